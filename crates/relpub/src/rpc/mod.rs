// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Request/response channel with retries and at-most-once handling.
//!
//! Runs over a dealer (client) / router (server) socket pair.
//!
//! # Overview
//!
//! - **Clients** number their requests, resend until a reply arrives or the
//!   deadline (`2 x maximum_latency`) passes
//! - **Servers** remember every `(sender, nonce)` they answered for
//!   `response_cache_multiplier x maximum_latency` and replay the same reply
//!   to duplicates without re-running the handler
//!
//! # Frames
//!
//! Requests and replies share one layout: `[sender_id, nonce, payload]`.
//! Replies are correlated on the nonce.
//!
//! # Reserved replies
//!
//! - cache-expired sentinel: the server saw the nonce but forgot the answer
//! - rejection prefix + reason: the handler refused the request

mod client;
mod error;
mod server;

pub use client::{RequestClient, RequestOutcome};
pub use error::{RequestError, RequestRejected, RequestResult, ServerError};
pub use server::{RequestHandler, ResponseServer};
