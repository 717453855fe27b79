// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Transport seam.
//!
//! The reliability layer treats the network as "send frames, maybe they
//! arrive". It needs four socket kinds:
//!
//! - `PublishSocket` - fan-out feed (bound by the publisher)
//! - `SubscribeSocket` - prefix-filtered feed reader (connected by subscribers)
//! - `RouterSocket` - addressed request/response endpoint (bound by the publisher)
//! - `DealerSocket` - asynchronous request/response peer (connected by clients)
//!
//! A send either succeeds, fails fast with [`TransportError::HighWaterMark`]
//! (back-pressure, never blocking), or fails with another error that callers
//! treat as a broken transport.
//!
//! # Modules
//!
//! - `memory` - in-process hub with loss injection and bounded queues

pub mod memory;

use async_trait::async_trait;
use std::fmt;
use thiserror::Error;

/// Ordered list of UTF-8 frames forming one transport message.
pub type Multipart = Vec<String>;

/// Transport errors.
#[derive(Debug, Error)]
pub enum TransportError {
    #[error("High-water-mark reached, send rejected")]
    HighWaterMark,

    #[error("Socket closed")]
    Closed,

    #[error("Address already in use: {0}")]
    AddressInUse(String),

    #[error("Invalid address: {0}")]
    InvalidAddress(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl TransportError {
    /// True for back-pressure, which callers report and move on from.
    pub fn is_high_water_mark(&self) -> bool {
        matches!(self, Self::HighWaterMark)
    }
}

/// Routing identity of a dealer as seen by a router.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PeerId(pub u64);

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "peer-{}", self.0)
    }
}

/// A frame addressed to (or received from) a specific dealer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Routed {
    pub peer: PeerId,
    pub frames: Multipart,
}

/// Addresses of one publisher: its feed and its recovery endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Endpoint {
    publish: String,
    request: String,
}

impl Endpoint {
    /// Create an endpoint from its feed and recovery addresses.
    pub fn new(publish: impl Into<String>, request: impl Into<String>) -> Self {
        Self {
            publish: publish.into(),
            request: request.into(),
        }
    }

    /// Feed address (publish/subscribe).
    pub fn publish_address(&self) -> &str {
        &self.publish
    }

    /// Recovery address (router/dealer).
    pub fn request_address(&self) -> &str {
        &self.request
    }
}

impl fmt::Display for Endpoint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{} (recovery {})", self.publish, self.request)
    }
}

/// Anything that accepts outbound items one at a time.
#[async_trait]
pub trait FrameSink<T>: Send + Sync + 'static {
    /// Send one item. Must fail fast on back-pressure.
    async fn send(&self, item: T) -> Result<(), TransportError>;
}

/// Fan-out feed socket.
#[async_trait]
pub trait PublishSocket: FrameSink<Multipart> {
    /// Unbind and release the socket.
    async fn close(&self);
}

/// Feed reader socket.
#[async_trait]
pub trait SubscribeSocket: Send + Sync + 'static {
    /// Next frame set, in arrival order.
    async fn recv(&self) -> Result<Multipart, TransportError>;

    /// Start receiving frames whose first frame starts with `prefix`.
    fn subscribe(&self, prefix: &str);

    /// Stop receiving frames for `prefix`.
    fn unsubscribe(&self, prefix: &str);

    /// Disconnect and release the socket.
    async fn close(&self);
}

/// Asynchronous request/response client socket.
#[async_trait]
pub trait DealerSocket: FrameSink<Multipart> {
    /// Next reply, in arrival order.
    async fn recv(&self) -> Result<Multipart, TransportError>;

    /// Disconnect and release the socket.
    async fn close(&self);
}

/// Addressed request/response server socket.
#[async_trait]
pub trait RouterSocket: FrameSink<Routed> {
    /// Next request together with the peer that sent it.
    async fn recv(&self) -> Result<Routed, TransportError>;

    /// Unbind and release the socket.
    async fn close(&self);
}

/// Factory for the four socket kinds.
#[async_trait]
pub trait Transport: Send + Sync + 'static {
    async fn bind_publisher(&self, address: &str) -> Result<Box<dyn PublishSocket>, TransportError>;

    async fn connect_subscriber(
        &self,
        address: &str,
    ) -> Result<Box<dyn SubscribeSocket>, TransportError>;

    async fn bind_router(&self, address: &str) -> Result<Box<dyn RouterSocket>, TransportError>;

    async fn connect_dealer(&self, address: &str) -> Result<Box<dyn DealerSocket>, TransportError>;
}
