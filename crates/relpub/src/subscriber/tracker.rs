// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Per-topic nonce state machine.
//!
//! Reader-side component that decides, for every PUBLISH or HEARTBEAT of one
//! (endpoint, topic), whether the message is new and which nonces went missing.
//!
//! # Algorithm
//!
//! With `expected = last_seen + 1` (0 before anything was seen):
//!
//! 1. PUBLISH `nonce == expected` -> new, advance
//! 2. PUBLISH `nonce > expected` -> new, recover `[expected, nonce - 1]`, advance to `nonce`
//! 3. PUBLISH `nonce <= last_seen` -> duplicate, ignored
//! 4. HEARTBEAT `nonce > last_seen` -> recover `[expected, nonce]`, advance to `nonce`
//! 5. HEARTBEAT otherwise -> ignored
//!
//! `last_seen` never decreases.

use std::fmt;
use std::ops::RangeInclusive;
use std::sync::Arc;

/// Called with the topic and the inclusive nonce range to recover.
pub type RecoveryHandler = Arc<dyn Fn(&str, RangeInclusive<u64>) + Send + Sync>;

/// Nonce tracker for one subscribed topic.
///
/// # Example
///
/// ```ignore
/// let tracker = TopicSubscriptionTracker::new("t", Arc::new(|topic, range| {
///     println!("recover {} {:?}", topic, range);
/// }));
/// tracker.process_publish(0); // true
/// tracker.process_publish(3); // true, recover 1..=2
/// tracker.process_publish(2); // false
/// ```
pub struct TopicSubscriptionTracker {
    topic: String,
    last_seen: Option<u64>,
    recovery: RecoveryHandler,
}

impl TopicSubscriptionTracker {
    pub fn new(topic: impl Into<String>, recovery: RecoveryHandler) -> Self {
        Self {
            topic: topic.into(),
            last_seen: None,
            recovery,
        }
    }

    fn expected(&self) -> u64 {
        self.last_seen.map_or(0, |last| last + 1)
    }

    fn is_seen(&self, nonce: u64) -> bool {
        self.last_seen.is_some_and(|last| nonce <= last)
    }

    /// Feed a PUBLISH nonce. Returns `true` if the message is new.
    pub fn process_publish(&mut self, nonce: u64) -> bool {
        if self.is_seen(nonce) {
            tracing::trace!("{}#{} already seen", self.topic, nonce);
            return false;
        }

        let expected = self.expected();
        if nonce > expected {
            tracing::debug!(
                "gap on {}: expected {}, got {}",
                self.topic,
                expected,
                nonce
            );
            (self.recovery)(&self.topic, expected..=nonce - 1);
        }
        self.last_seen = Some(nonce);
        true
    }

    /// Feed a HEARTBEAT nonce.
    pub fn process_heartbeat(&mut self, nonce: u64) {
        if self.is_seen(nonce) {
            return;
        }

        let expected = self.expected();
        tracing::debug!(
            "heartbeat on {} announces {}, recovering from {}",
            self.topic,
            nonce,
            expected
        );
        (self.recovery)(&self.topic, expected..=nonce);
        self.last_seen = Some(nonce);
    }

    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Highest nonce seen or requested, `None` before the first message.
    pub fn last_seen(&self) -> Option<u64> {
        self.last_seen
    }
}

impl fmt::Debug for TopicSubscriptionTracker {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TopicSubscriptionTracker")
            .field("topic", &self.topic)
            .field("last_seen", &self.last_seen)
            .finish()
    }
}
