// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! # Reliability building blocks
//!
//! Data structures the publisher, subscriber and request/response channel are
//! built from.
//!
//! | Component | Role |
//! |-----------|------|
//! | `ExpiryWindowCache` | Mapping whose entries expire after a fixed TTL, one coalesced timer |
//! | `NonceGapTracker` | Seen-nonce set compacted into a base nonce plus a sparse window |
//! | `SerializedSendQueue` | FIFO feeding a single-writer socket, one send in flight |
//! | `CancellableDelay` | Sleeps that all complete early when cancelled |

mod delay;
mod expiry_cache;
mod nonce_tracker;
mod send_queue;

pub use delay::{CancellableDelay, DelayOutcome};
pub use expiry_cache::{ExpiryWindowCache, EXPIRY_BUFFER};
pub use nonce_tracker::{NonceGapTracker, NonceStatus, MAX_NONCE_WINDOW};
pub use send_queue::{SendTicket, SerializedSendQueue};
