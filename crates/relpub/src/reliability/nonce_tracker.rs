// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Seen-nonce tracking for request deduplication.
//!
//! Server-side component that remembers which request nonces a sender has
//! already used. Memory stays proportional to the number of outstanding gaps,
//! not to the number of requests ever seen.

use std::collections::VecDeque;

/// Furthest a nonce may sit above `base` and still be tracked.
pub const MAX_NONCE_WINDOW: u64 = 1 << 16;

/// Classification of a nonce by [`NonceGapTracker::observe`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum NonceStatus {
    /// Never seen before; now recorded.
    New,
    /// Already recorded.
    Seen,
    /// At least [`MAX_NONCE_WINDOW`] above `base`; not recorded.
    OutOfWindow,
}

/// Compacting set of seen nonces.
///
/// # Algorithm
///
/// - `base`: every nonce `< base` has been seen
/// - `window[i]`: whether `base + i` has been seen
///
/// The window front is never `true` after [`garbage_clean`](Self::garbage_clean):
/// a marked front is folded into `base`.
///
/// # Example
///
/// ```ignore
/// let mut tracker = NonceGapTracker::new();
/// tracker.insert(0);
/// tracker.insert(2);          // gap at 1
/// assert!(!tracker.has(1));
/// tracker.insert(1);
/// tracker.garbage_clean();
/// assert_eq!(tracker.base(), 3);
/// assert_eq!(tracker.window_len(), 0);
/// ```
#[derive(Debug, Clone, Default)]
pub struct NonceGapTracker {
    base: u64,
    window: VecDeque<bool>,
}

impl NonceGapTracker {
    /// Empty tracker. Nonce 0 starts the chain.
    pub fn new() -> Self {
        Self::default()
    }

    /// Record `nonce` as seen.
    ///
    /// Nonces below `base` are already seen and ignored, as are nonces
    /// outside the window.
    pub fn insert(&mut self, nonce: u64) {
        if nonce < self.base || !self.in_window(nonce) {
            return;
        }
        if nonce == self.base {
            self.base += 1;
            self.window.pop_front();
            return;
        }

        let offset = (nonce - self.base) as usize;
        if offset >= self.window.len() {
            self.window.resize(offset + 1, false);
        }
        self.window[offset] = true;
    }

    fn in_window(&self, nonce: u64) -> bool {
        nonce.saturating_sub(self.base) < MAX_NONCE_WINDOW
    }

    /// Fold every marked slot at the front of the window into `base`.
    pub fn garbage_clean(&mut self) {
        while self.window.front() == Some(&true) {
            self.window.pop_front();
            self.base += 1;
        }
    }

    /// Whether `nonce` has been seen.
    pub fn has(&self, nonce: u64) -> bool {
        if nonce < self.base {
            return true;
        }
        let offset = nonce - self.base;
        usize::try_from(offset)
            .ok()
            .and_then(|offset| self.window.get(offset).copied())
            .unwrap_or(false)
    }

    /// Classify `nonce`, record it if new and compact.
    pub fn observe(&mut self, nonce: u64) -> NonceStatus {
        if self.has(nonce) {
            return NonceStatus::Seen;
        }
        if !self.in_window(nonce) {
            return NonceStatus::OutOfWindow;
        }
        self.insert(nonce);
        self.garbage_clean();
        NonceStatus::New
    }

    /// Lowest nonce not yet known to be seen.
    pub fn base(&self) -> u64 {
        self.base
    }

    /// Number of slots held above `base`.
    pub fn window_len(&self) -> usize {
        self.window.len()
    }

    /// Number of unseen nonces between `base` and the highest seen nonce.
    pub fn pending_gaps(&self) -> usize {
        let Some(last) = self.window.iter().rposition(|seen| *seen) else {
            return 0;
        };
        self.window.iter().take(last).filter(|seen| !**seen).count()
    }
}
