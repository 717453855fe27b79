// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Injectable handlers for steady-state conditions.
//!
//! Back-pressure and expired-cache conditions are expected outcomes of an
//! unreliable transport, so they are reported through callbacks instead of
//! errors. Both default to no-ops.

use std::fmt;
use std::sync::Arc;

/// A send rejected by the transport's high-water-mark.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HighWaterMark {
    /// Topic (publisher) or peer / client id (request channel).
    pub target: String,
    /// Nonce of the rejected frame.
    pub nonce: u64,
    /// Payload of the rejected frame.
    pub payload: String,
}

/// A requested nonce that was no longer cached by the remote side.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CacheError {
    /// Address of the endpoint that answered.
    pub endpoint: String,
    /// Nonce that could not be served.
    pub nonce: u64,
}

type HighWaterMarkFn = dyn Fn(&HighWaterMark) + Send + Sync;
type CacheErrorFn = dyn Fn(&CacheError) + Send + Sync;

/// Set of optional handlers shared by every component.
#[derive(Clone, Default)]
pub struct Hooks {
    on_high_water_mark: Option<Arc<HighWaterMarkFn>>,
    on_cache_error: Option<Arc<CacheErrorFn>>,
}

impl Hooks {
    /// Hooks with every handler unset.
    pub fn new() -> Self {
        Self::default()
    }

    /// Install the back-pressure warning handler.
    pub fn on_high_water_mark<F>(mut self, handler: F) -> Self
    where
        F: Fn(&HighWaterMark) + Send + Sync + 'static,
    {
        self.on_high_water_mark = Some(Arc::new(handler));
        self
    }

    /// Install the cache-error handler.
    pub fn on_cache_error<F>(mut self, handler: F) -> Self
    where
        F: Fn(&CacheError) + Send + Sync + 'static,
    {
        self.on_cache_error = Some(Arc::new(handler));
        self
    }

    pub(crate) fn high_water_mark(&self, warning: &HighWaterMark) {
        tracing::debug!(
            "high-water-mark hit: target={} nonce={}",
            warning.target,
            warning.nonce
        );
        if let Some(handler) = &self.on_high_water_mark {
            handler(warning);
        }
    }

    pub(crate) fn cache_error(&self, error: &CacheError) {
        tracing::debug!(
            "cache expired at {} for nonce {}",
            error.endpoint,
            error.nonce
        );
        if let Some(handler) = &self.on_cache_error {
            handler(error);
        }
    }
}

impl fmt::Debug for Hooks {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Hooks")
            .field("on_high_water_mark", &self.on_high_water_mark.is_some())
            .field("on_cache_error", &self.on_cache_error.is_some())
            .finish()
    }
}
