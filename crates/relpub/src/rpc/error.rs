// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Error types for the request/response channel.

use crate::transport::TransportError;
use thiserror::Error;

/// Result type for request client operations
pub type RequestResult<T> = Result<T, RequestError>;

/// Errors raised by [`RequestClient`](super::RequestClient).
///
/// Timeouts, expired caches and rejections are outcomes, not errors.
#[derive(Debug, Error)]
pub enum RequestError {
    /// Client was closed (before or during the request)
    #[error("Request client closed")]
    Closed,

    /// Socket setup failed
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
}

/// Errors raised by [`ResponseServer`](super::ResponseServer).
#[derive(Debug, Error)]
pub enum ServerError {
    /// Socket setup failed, or the socket broke while serving
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),

    /// Request dispatch panicked while serving
    #[error("Request dispatch panicked: {0}")]
    DispatchPanicked(String),

    /// Server was already closed
    #[error("Response server already closed")]
    Closed,
}

/// Handler refusal: the caller receives a rejection reply carrying `reason`.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("Request rejected: {reason}")]
pub struct RequestRejected {
    pub reason: String,
}

impl RequestRejected {
    pub fn new(reason: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
        }
    }
}

impl From<crate::protocol::ProtocolError> for RequestRejected {
    fn from(e: crate::protocol::ProtocolError) -> Self {
        Self::new(e.to_string())
    }
}
