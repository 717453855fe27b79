// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Sleeps that can be cut short in bulk.

use std::time::Duration;
use tokio::sync::watch;

/// How a [`CancellableDelay::sleep`] ended.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DelayOutcome {
    Elapsed,
    Cancelled,
}

/// Source of sleeps that all complete immediately on [`cancel_all`](Self::cancel_all).
///
/// Cancellation is sticky: sleeps started afterwards return
/// [`DelayOutcome::Cancelled`] without waiting.
#[derive(Debug)]
pub struct CancellableDelay {
    cancelled: watch::Sender<bool>,
}

impl CancellableDelay {
    pub fn new() -> Self {
        let (cancelled, _) = watch::channel(false);
        Self { cancelled }
    }

    /// Sleep for `duration` unless cancelled first.
    pub async fn sleep(&self, duration: Duration) -> DelayOutcome {
        let mut rx = self.cancelled.subscribe();
        if *rx.borrow_and_update() {
            return DelayOutcome::Cancelled;
        }
        tokio::select! {
            () = tokio::time::sleep(duration) => DelayOutcome::Elapsed,
            _ = rx.changed() => DelayOutcome::Cancelled,
        }
    }

    /// Complete every pending and future sleep.
    pub fn cancel_all(&self) {
        self.cancelled.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancelled.borrow()
    }
}

impl Default for CancellableDelay {
    fn default() -> Self {
        Self::new()
    }
}
