// SPDX-License-Identifier: Apache-2.0 OR MIT
// Copyright (c) 2025-2026 naskel.com

//! Reliability configuration - single source of truth for timing.
//!
//! Every component that needs a latency bound, heartbeat period or cache TTL
//! reads it from one shared [`ReliabilityConfig`] (`Arc<ReliabilityConfig>`).
//! Values are validated once, when the configuration is built or loaded, so a
//! bad combination is rejected before any publisher or subscriber starts.
//!
//! # Configuration File
//!
//! ```toml
//! maximum_latency_ms = 3000
//! heartbeat_interval_ms = 1000
//! publisher_cache_expiry_ms = 10000
//! response_cache_multiplier = 3
//! response_timeout_ms = 500
//! expiry_buffer_ms = 500
//! ```

use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

/// Default upper bound on acceptable end-to-end delay (milliseconds).
pub const DEFAULT_MAXIMUM_LATENCY_MS: u64 = 3_000;
/// Default heartbeat period (milliseconds).
pub const DEFAULT_HEARTBEAT_INTERVAL_MS: u64 = 1_000;
/// Default publisher message cache TTL (milliseconds).
pub const DEFAULT_PUBLISHER_CACHE_EXPIRY_MS: u64 = 10_000;
/// Default response cache TTL, as a multiple of the maximum latency.
pub const DEFAULT_RESPONSE_CACHE_MULTIPLIER: u32 = 3;
/// Default wait for a single response before resending (milliseconds).
pub const DEFAULT_RESPONSE_TIMEOUT_MS: u64 = 500;
/// Default slack added to every expiry timer (milliseconds).
pub const DEFAULT_EXPIRY_BUFFER_MS: u64 = 500;

/// Configuration errors.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("Invalid configuration: {0}")]
    Invalid(String),
}

/// Timing configuration shared by publishers, subscribers and the
/// request/response channel.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ReliabilityConfig {
    #[serde(default = "default_maximum_latency_ms")]
    maximum_latency_ms: u64,

    #[serde(default = "default_heartbeat_interval_ms")]
    heartbeat_interval_ms: u64,

    #[serde(default = "default_publisher_cache_expiry_ms")]
    publisher_cache_expiry_ms: u64,

    #[serde(default = "default_response_cache_multiplier")]
    response_cache_multiplier: u32,

    #[serde(default = "default_response_timeout_ms")]
    response_timeout_ms: u64,

    #[serde(default = "default_expiry_buffer_ms")]
    expiry_buffer_ms: u64,
}

fn default_maximum_latency_ms() -> u64 {
    DEFAULT_MAXIMUM_LATENCY_MS
}

fn default_heartbeat_interval_ms() -> u64 {
    DEFAULT_HEARTBEAT_INTERVAL_MS
}

fn default_publisher_cache_expiry_ms() -> u64 {
    DEFAULT_PUBLISHER_CACHE_EXPIRY_MS
}

fn default_response_cache_multiplier() -> u32 {
    DEFAULT_RESPONSE_CACHE_MULTIPLIER
}

fn default_response_timeout_ms() -> u64 {
    DEFAULT_RESPONSE_TIMEOUT_MS
}

fn default_expiry_buffer_ms() -> u64 {
    DEFAULT_EXPIRY_BUFFER_MS
}

impl Default for ReliabilityConfig {
    fn default() -> Self {
        Self {
            maximum_latency_ms: DEFAULT_MAXIMUM_LATENCY_MS,
            heartbeat_interval_ms: DEFAULT_HEARTBEAT_INTERVAL_MS,
            publisher_cache_expiry_ms: DEFAULT_PUBLISHER_CACHE_EXPIRY_MS,
            response_cache_multiplier: DEFAULT_RESPONSE_CACHE_MULTIPLIER,
            response_timeout_ms: DEFAULT_RESPONSE_TIMEOUT_MS,
            expiry_buffer_ms: DEFAULT_EXPIRY_BUFFER_MS,
        }
    }
}

impl ReliabilityConfig {
    /// Build a configuration from the two values every deployment picks,
    /// keeping defaults for the rest.
    ///
    /// The publisher cache expiry is raised to cover the request deadline
    /// plus one heartbeat if the default would be too short.
    pub fn new(maximum_latency: Duration, heartbeat_interval: Duration) -> Result<Self, ConfigError> {
        let maximum_latency_ms = duration_ms(maximum_latency);
        let heartbeat_interval_ms = duration_ms(heartbeat_interval);
        let floor = maximum_latency_ms
            .saturating_mul(2)
            .saturating_add(heartbeat_interval_ms);

        let config = Self {
            maximum_latency_ms,
            heartbeat_interval_ms,
            publisher_cache_expiry_ms: DEFAULT_PUBLISHER_CACHE_EXPIRY_MS.max(floor),
            ..Self::default()
        };
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a TOML file.
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let content = std::fs::read_to_string(path)?;
        Self::from_toml_str(&content)
    }

    /// Parse configuration from a TOML document.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Override the publisher cache TTL.
    pub fn with_publisher_cache_expiry(mut self, expiry: Duration) -> Result<Self, ConfigError> {
        self.publisher_cache_expiry_ms = duration_ms(expiry);
        self.validate()?;
        Ok(self)
    }

    /// Override the response cache TTL multiplier.
    pub fn with_response_cache_multiplier(mut self, multiplier: u32) -> Result<Self, ConfigError> {
        self.response_cache_multiplier = multiplier;
        self.validate()?;
        Ok(self)
    }

    /// Override the single-response wait before a resend.
    pub fn with_response_timeout(mut self, timeout: Duration) -> Result<Self, ConfigError> {
        self.response_timeout_ms = duration_ms(timeout);
        self.validate()?;
        Ok(self)
    }

    /// Override the expiry timer slack.
    pub fn with_expiry_buffer(mut self, buffer: Duration) -> Result<Self, ConfigError> {
        self.expiry_buffer_ms = duration_ms(buffer);
        self.validate()?;
        Ok(self)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.maximum_latency_ms == 0 {
            return Err(ConfigError::Invalid("maximum latency must be non-zero".into()));
        }

        if self.heartbeat_interval_ms == 0 {
            return Err(ConfigError::Invalid("heartbeat interval must be non-zero".into()));
        }

        if self.heartbeat_interval_ms >= self.maximum_latency_ms {
            return Err(ConfigError::Invalid(format!(
                "heartbeat interval ({} ms) must be below maximum latency ({} ms)",
                self.heartbeat_interval_ms, self.maximum_latency_ms
            )));
        }

        if self.response_cache_multiplier == 0 {
            return Err(ConfigError::Invalid(
                "response cache multiplier must be non-zero".into(),
            ));
        }

        if self.response_timeout_ms == 0 {
            return Err(ConfigError::Invalid("response timeout must be non-zero".into()));
        }

        let request_deadline_ms = self.request_deadline_ms();
        if self.publisher_cache_expiry_ms < request_deadline_ms {
            return Err(ConfigError::Invalid(format!(
                "publisher cache expiry ({} ms) must cover the request deadline ({} ms)",
                self.publisher_cache_expiry_ms, request_deadline_ms
            )));
        }

        Ok(())
    }

    /// Upper bound on acceptable end-to-end delay.
    pub fn maximum_latency(&self) -> Duration {
        Duration::from_millis(self.maximum_latency_ms)
    }

    /// Heartbeat period for idle topics.
    pub fn heartbeat_interval(&self) -> Duration {
        Duration::from_millis(self.heartbeat_interval_ms)
    }

    /// TTL of the publisher's per-topic message cache.
    pub fn publisher_cache_expiry(&self) -> Duration {
        Duration::from_millis(self.publisher_cache_expiry_ms)
    }

    /// Multiplier applied to the maximum latency for the response cache TTL.
    pub fn response_cache_multiplier(&self) -> u32 {
        self.response_cache_multiplier
    }

    /// TTL of the response server's dedup cache.
    pub fn response_cache_expiry(&self) -> Duration {
        self.maximum_latency() * self.response_cache_multiplier
    }

    /// Wait for a single response before resending the request.
    pub fn response_timeout(&self) -> Duration {
        Duration::from_millis(self.response_timeout_ms)
    }

    /// Total budget of one request (send + response).
    pub fn request_deadline(&self) -> Duration {
        Duration::from_millis(self.request_deadline_ms())
    }

    /// Slack added to every expiry timer.
    pub fn expiry_buffer(&self) -> Duration {
        Duration::from_millis(self.expiry_buffer_ms)
    }

    fn request_deadline_ms(&self) -> u64 {
        self.maximum_latency_ms.saturating_mul(2)
    }
}

fn duration_ms(duration: Duration) -> u64 {
    u64::try_from(duration.as_millis()).unwrap_or(u64::MAX)
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn test_default_config_is_valid() {
        let config = ReliabilityConfig::default();
        assert!(config.validate().is_ok());
        assert_eq!(config.maximum_latency(), Duration::from_secs(3));
        assert_eq!(config.request_deadline(), Duration::from_secs(6));
        assert_eq!(config.response_cache_expiry(), Duration::from_secs(9));
    }

    #[test]
    fn test_heartbeat_equal_to_latency_rejected() {
        let result = ReliabilityConfig::new(Duration::from_millis(1000), Duration::from_millis(1000));
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_heartbeat_above_latency_rejected() {
        let result = ReliabilityConfig::new(Duration::from_millis(500), Duration::from_millis(2000));
        let err = result.expect_err("heartbeat above latency");
        assert!(err.to_string().contains("heartbeat interval"));
    }

    #[test]
    fn test_new_raises_cache_expiry_floor() {
        let config = ReliabilityConfig::new(Duration::from_secs(20), Duration::from_secs(5))
            .expect("valid config");
        assert_eq!(config.publisher_cache_expiry(), Duration::from_secs(45));
    }

    #[test]
    fn test_short_publisher_cache_rejected() {
        let result = ReliabilityConfig::default().with_publisher_cache_expiry(Duration::from_secs(1));
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_zero_multiplier_rejected() {
        let result = ReliabilityConfig::default().with_response_cache_multiplier(0);
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_from_toml_partial() {
        let config = ReliabilityConfig::from_toml_str(
            r#"
            maximum_latency_ms = 2000
            heartbeat_interval_ms = 250
            "#,
        )
        .expect("parse");

        assert_eq!(config.maximum_latency(), Duration::from_secs(2));
        assert_eq!(config.heartbeat_interval(), Duration::from_millis(250));
        assert_eq!(config.response_timeout(), Duration::from_millis(500));
    }

    #[test]
    fn test_from_toml_rejects_bad_timing() {
        let result = ReliabilityConfig::from_toml_str(
            r#"
            maximum_latency_ms = 100
            heartbeat_interval_ms = 250
            "#,
        );
        assert!(matches!(result, Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_from_toml_unknown_field() {
        let result = ReliabilityConfig::from_toml_str("max_latency = 5");
        assert!(matches!(result, Err(ConfigError::Toml(_))));
    }

    #[test]
    fn test_from_file() {
        let mut file = tempfile::NamedTempFile::new().expect("tempfile");
        writeln!(file, "maximum_latency_ms = 4000").expect("write");
        writeln!(file, "heartbeat_interval_ms = 1000").expect("write");

        let config = ReliabilityConfig::from_file(file.path()).expect("load");
        assert_eq!(config.maximum_latency(), Duration::from_secs(4));
    }

    #[test]
    fn test_from_missing_file() {
        let result = ReliabilityConfig::from_file("/nonexistent/relpub.toml");
        assert!(matches!(result, Err(ConfigError::Io(_))));
    }
}
