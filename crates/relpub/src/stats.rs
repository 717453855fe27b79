// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Publisher and subscriber counters.

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Instant;

/// Statistics for a publisher.
#[derive(Debug)]
pub struct PublisherStats {
    /// PUBLISH frames queued.
    pub published: AtomicU64,

    /// HEARTBEAT frames queued.
    pub heartbeats: AtomicU64,

    /// Recovery requests answered.
    pub recovery_requests: AtomicU64,

    /// Envelopes returned from the cache by recovery.
    pub recovered_served: AtomicU64,

    /// Requested nonces no longer cached.
    pub cache_misses: AtomicU64,

    /// Sends rejected by back-pressure.
    pub high_water_marks: AtomicU64,

    /// Creation time.
    pub created: Instant,
}

impl PublisherStats {
    pub fn new() -> Self {
        Self {
            published: AtomicU64::new(0),
            heartbeats: AtomicU64::new(0),
            recovery_requests: AtomicU64::new(0),
            recovered_served: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            high_water_marks: AtomicU64::new(0),
            created: Instant::now(),
        }
    }

    /// Get snapshot of current stats.
    pub fn snapshot(&self) -> PublisherStatsSnapshot {
        PublisherStatsSnapshot {
            published: self.published.load(Ordering::Relaxed),
            heartbeats: self.heartbeats.load(Ordering::Relaxed),
            recovery_requests: self.recovery_requests.load(Ordering::Relaxed),
            recovered_served: self.recovered_served.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            high_water_marks: self.high_water_marks.load(Ordering::Relaxed),
            uptime_secs: self.created.elapsed().as_secs(),
        }
    }
}

impl Default for PublisherStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of publisher statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PublisherStatsSnapshot {
    pub published: u64,
    pub heartbeats: u64,
    pub recovery_requests: u64,
    pub recovered_served: u64,
    pub cache_misses: u64,
    pub high_water_marks: u64,
    pub uptime_secs: u64,
}

impl PublisherStatsSnapshot {
    /// Calculate messages per second.
    pub fn messages_per_second(&self) -> f64 {
        if self.uptime_secs > 0 {
            self.published as f64 / self.uptime_secs as f64
        } else {
            0.0
        }
    }
}

/// Statistics for a subscriber.
#[derive(Debug)]
pub struct SubscriberStats {
    /// Messages dispatched as they arrived.
    pub delivered_live: AtomicU64,

    /// Messages dispatched after recovery.
    pub recovered: AtomicU64,

    /// Frames dropped as already seen.
    pub duplicates_dropped: AtomicU64,

    /// Nonce gaps that triggered recovery.
    pub gaps_detected: AtomicU64,

    /// Nonces the publisher no longer had.
    pub cache_misses: AtomicU64,

    /// Recovery requests that got no answer.
    pub recovery_timeouts: AtomicU64,

    /// Recovery requests refused or unreadable.
    pub recovery_failures: AtomicU64,

    /// Creation time.
    pub created: Instant,
}

impl SubscriberStats {
    pub fn new() -> Self {
        Self {
            delivered_live: AtomicU64::new(0),
            recovered: AtomicU64::new(0),
            duplicates_dropped: AtomicU64::new(0),
            gaps_detected: AtomicU64::new(0),
            cache_misses: AtomicU64::new(0),
            recovery_timeouts: AtomicU64::new(0),
            recovery_failures: AtomicU64::new(0),
            created: Instant::now(),
        }
    }

    /// Get snapshot of current stats.
    pub fn snapshot(&self) -> SubscriberStatsSnapshot {
        SubscriberStatsSnapshot {
            delivered_live: self.delivered_live.load(Ordering::Relaxed),
            recovered: self.recovered.load(Ordering::Relaxed),
            duplicates_dropped: self.duplicates_dropped.load(Ordering::Relaxed),
            gaps_detected: self.gaps_detected.load(Ordering::Relaxed),
            cache_misses: self.cache_misses.load(Ordering::Relaxed),
            recovery_timeouts: self.recovery_timeouts.load(Ordering::Relaxed),
            recovery_failures: self.recovery_failures.load(Ordering::Relaxed),
            uptime_secs: self.created.elapsed().as_secs(),
        }
    }
}

impl Default for SubscriberStats {
    fn default() -> Self {
        Self::new()
    }
}

/// Snapshot of subscriber statistics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SubscriberStatsSnapshot {
    pub delivered_live: u64,
    pub recovered: u64,
    pub duplicates_dropped: u64,
    pub gaps_detected: u64,
    pub cache_misses: u64,
    pub recovery_timeouts: u64,
    pub recovery_failures: u64,
    pub uptime_secs: u64,
}

impl SubscriberStatsSnapshot {
    /// Every message handed to callbacks.
    pub fn delivered(&self) -> u64 {
        self.delivered_live + self.recovered
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_publisher_stats_snapshot() {
        let stats = PublisherStats::new();
        stats.published.fetch_add(3, Ordering::Relaxed);
        stats.heartbeats.fetch_add(1, Ordering::Relaxed);
        stats.cache_misses.fetch_add(2, Ordering::Relaxed);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.published, 3);
        assert_eq!(snapshot.heartbeats, 1);
        assert_eq!(snapshot.cache_misses, 2);
        assert_eq!(snapshot.high_water_marks, 0);
        assert_eq!(snapshot.messages_per_second(), 0.0);
    }

    #[test]
    fn test_subscriber_stats_delivered() {
        let stats = SubscriberStats::new();
        stats.delivered_live.fetch_add(4, Ordering::Relaxed);
        stats.recovered.fetch_add(2, Ordering::Relaxed);
        stats.duplicates_dropped.fetch_add(1, Ordering::Relaxed);

        let snapshot = stats.snapshot();
        assert_eq!(snapshot.delivered(), 6);
        assert_eq!(snapshot.duplicates_dropped, 1);
    }
}
