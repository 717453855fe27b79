// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! relpub: gap-free, ordered pub/sub over an unreliable transport
//!
//! Publishers keep a short-lived cache of every message they send and announce
//! their latest nonce through heartbeats. Subscribers track nonces per topic,
//! detect gaps, and recover the missing messages from the publisher's cache over
//! a retrying request/response channel. No broker, no persistent log.
//!
//! # Protocol Flow
//!
//! ```text
//! Publisher                                   Subscriber
//!   |                                              |
//!   |--- PUBLISH (nonce=0) ----------------------->|
//!   |--- PUBLISH (nonce=1) ---------X (lost)       |
//!   |--- PUBLISH (nonce=2) ----------------------->| (gap: [1] missing)
//!   |                                              |
//!   |<-- request ["topic", 1] ---------------------|
//!   |--- response [["topic","PUBLISH","1",..]] --->| (gap filled)
//!   |                                              |
//!   |--- HEARTBEAT (nonce=2) --------------------->| (idle: nothing missing)
//! ```
//!
//! # Components
//!
//! | Component | Role |
//! |-----------|------|
//! | [`Publisher`] | Nonce issuance, message cache, heartbeats, recovery responder |
//! | [`Subscriber`] | Topic registration, fan-in, callback dispatch, recovery |
//! | [`RequestClient`] | Correlated, retrying request dispatch |
//! | [`ResponseServer`] | Per-sender request deduplication and idempotent replies |
//! | [`ExpiryWindowCache`] | Mapping with coalesced TTL expiry |
//! | [`NonceGapTracker`] | Compacting seen-nonce set |
//! | [`SerializedSendQueue`] | Single-flight outbound queue |
//!
//! # Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use relpub::transport::memory::MemoryTransport;
//! use relpub::{Endpoint, Publisher, ReliabilityConfig, Subscriber};
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = Arc::new(ReliabilityConfig::default());
//! let transport = Arc::new(MemoryTransport::new());
//! let endpoint = Endpoint::new("mem://prices", "mem://prices/recovery");
//!
//! let publisher = Publisher::new(config.clone(), transport.clone(), endpoint.clone());
//! publisher.open().await?;
//!
//! let subscriber = Subscriber::new(config, transport);
//! subscriber
//!     .subscribe(&endpoint, "EURUSD", |msg| println!("{} -> {}", msg.nonce, msg.payload))
//!     .await?;
//!
//! publisher.publish("EURUSD", "1.0842")?;
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod hooks;
pub mod protocol;
pub mod publisher;
pub mod reliability;
pub mod rpc;
pub mod stats;
pub mod subscriber;
pub mod transport;

pub use config::{ConfigError, ReliabilityConfig};
pub use hooks::{CacheError, HighWaterMark, Hooks};
pub use protocol::{Envelope, MessageKind, ProtocolError, CACHE_EXPIRED_SENTINEL};
pub use publisher::{Publisher, PublisherError, TopicDetails};
pub use reliability::{
    CancellableDelay, DelayOutcome, ExpiryWindowCache, NonceGapTracker, NonceStatus, SendTicket,
    SerializedSendQueue, EXPIRY_BUFFER, MAX_NONCE_WINDOW,
};
pub use rpc::{
    RequestClient, RequestError, RequestHandler, RequestOutcome, RequestRejected, RequestResult,
    ResponseServer, ServerError,
};
pub use stats::{PublisherStats, PublisherStatsSnapshot, SubscriberStats, SubscriberStatsSnapshot};
pub use subscriber::{
    Delivery, ReceivedMessage, RecoveryHandler, Subscriber, SubscriberError, SubscriptionId,
    TopicSubscriptionTracker,
};
pub use transport::{Endpoint, Multipart, PeerId, Transport, TransportError};
