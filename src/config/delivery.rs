//! Delivery tunables shared by every destination.

use super::ConfigError;
use crate::delivery::RetryPolicy;
use crate::queue::QueueConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Batch mode settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Periodic flush interval (default: 1s)
    #[serde(with = "crate::config::duration")]
    pub flush_interval: Duration,
    /// Buffered rows that trigger an early flush (default: 1,000)
    pub flush_threshold: usize,
    /// Buffered rows before `consume` reports backpressure (default: 100,000)
    pub max_buffered_rows: usize,
    pub retry: RetryPolicy,
}

impl Default for BatchConfig {
    fn default() -> Self {
        BatchConfig {
            flush_interval: Duration::from_secs(1),
            flush_threshold: 1_000,
            max_buffered_rows: 100_000,
            retry: RetryPolicy::default(),
        }
    }
}

impl BatchConfig {
    pub fn test() -> Self {
        BatchConfig {
            flush_interval: Duration::from_millis(50),
            flush_threshold: 10,
            max_buffered_rows: 100,
            retry: RetryPolicy::test(),
        }
    }
}

impl BatchConfig {
    /// Reject settings the batch worker cannot run with
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.flush_interval.is_zero() {
            return Err(invalid("batch.flush_interval", "must be greater than zero"));
        }
        if self.flush_threshold == 0 {
            return Err(invalid("batch.flush_threshold", "must be greater than zero"));
        }
        if self.max_buffered_rows == 0 {
            return Err(invalid("batch.max_buffered_rows", "must be greater than zero"));
        }
        validate_retry("batch.retry.max_attempts", &self.retry)
    }
}

/// Stream mode settings
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    /// Entries written per adapter call (default: 1)
    pub micro_batch_size: usize,
    /// Backoff between redeliveries. `max_attempts` caps deliveries per
    /// entry; `queue.max_redeliveries` still bounds the queue itself.
    pub retry: RetryPolicy,
}

impl Default for StreamConfig {
    fn default() -> Self {
        StreamConfig {
            micro_batch_size: 1,
            retry: RetryPolicy::default(),
        }
    }
}

impl StreamConfig {
    pub fn test() -> Self {
        StreamConfig {
            micro_batch_size: 1,
            retry: RetryPolicy::test(),
        }
    }
}

impl StreamConfig {
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.micro_batch_size == 0 {
            return Err(invalid("stream.micro_batch_size", "must be greater than zero"));
        }
        validate_retry("stream.retry.max_attempts", &self.retry)
    }
}

fn validate_retry(key: &'static str, retry: &RetryPolicy) -> Result<(), ConfigError> {
    if retry.max_attempts == 0 {
        return Err(invalid(key, "must allow at least one attempt"));
    }
    Ok(())
}

fn invalid(key: &'static str, reason: &'static str) -> ConfigError {
    ConfigError::Invalid { key, reason }
}

/// Delivery settings for all destinations
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DeliveryConfig {
    pub batch: BatchConfig,
    pub stream: StreamConfig,
    pub queue: QueueConfig,
    /// Outcomes retained per destination (fixed)
    pub outcome_cache_capacity: usize,
    /// Time allowed for workers to drain on close
    #[serde(with = "crate::config::duration")]
    pub shutdown_timeout: Duration,
    /// Skip events whose id already succeeded at a destination
    pub suppress_duplicates: bool,
}

impl Default for DeliveryConfig {
    fn default() -> Self {
        DeliveryConfig {
            batch: BatchConfig::default(),
            stream: StreamConfig::default(),
            queue: QueueConfig::default(),
            outcome_cache_capacity: 1_000,
            shutdown_timeout: Duration::from_secs(10),
            suppress_duplicates: true,
        }
    }
}

impl DeliveryConfig {
    /// Configuration for testing (small buffers, fast retries)
    pub fn test() -> Self {
        DeliveryConfig {
            batch: BatchConfig::test(),
            stream: StreamConfig::test(),
            queue: QueueConfig::test(),
            outcome_cache_capacity: 100,
            shutdown_timeout: Duration::from_secs(2),
            suppress_duplicates: true,
        }
    }
}

impl DeliveryConfig {
    /// Check every setting a worker depends on
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.batch.validate()?;
        self.stream.validate()?;
        if self.queue.max_segment_bytes == 0 {
            return Err(invalid("queue.max_segment_bytes", "must be greater than zero"));
        }
        if self.queue.max_disk_bytes < self.queue.max_segment_bytes as u64 {
            return Err(invalid("queue.max_disk_bytes", "must be at least queue.max_segment_bytes"));
        }
        if self.outcome_cache_capacity == 0 {
            return Err(invalid("outcome_cache_capacity", "must be greater than zero"));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = DeliveryConfig::default();
        assert_eq!(config.batch.flush_threshold, 1_000);
        assert_eq!(config.stream.micro_batch_size, 1);
        assert_eq!(config.outcome_cache_capacity, 1_000);
        assert!(config.suppress_duplicates);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config: DeliveryConfig = toml::from_str(
            r#"
            outcome_cache_capacity = 50
            [batch]
            flush_interval = 250
            "#,
        )
        .unwrap();
        assert_eq!(config.outcome_cache_capacity, 50);
        assert_eq!(config.batch.flush_interval, Duration::from_millis(250));
        assert_eq!(config.batch.flush_threshold, 1_000);
        assert_eq!(config.queue, QueueConfig::default());
    }

    #[test]
    fn test_validate_rejects_zero_settings() {
        assert!(DeliveryConfig::default().validate().is_ok());
        assert!(DeliveryConfig::test().validate().is_ok());

        let mut config = DeliveryConfig::test();
        config.batch.flush_interval = Duration::ZERO;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("batch.flush_interval"), "{}", err);

        let mut config = DeliveryConfig::test();
        config.batch.flush_threshold = 0;
        assert!(config.validate().is_err());

        let mut config = DeliveryConfig::test();
        config.batch.max_buffered_rows = 0;
        assert!(config.validate().is_err());

        let mut config = DeliveryConfig::test();
        config.stream.micro_batch_size = 0;
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("stream.micro_batch_size"), "{}", err);

        let mut config = DeliveryConfig::test();
        config.stream.retry.max_attempts = 0;
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_zero_interval_from_toml_is_rejected() {
        let config: DeliveryConfig = toml::from_str(
            r#"
            [batch]
            flush_interval = 0
            "#,
        )
        .unwrap();
        assert!(matches!(
            config.validate(),
            Err(ConfigError::Invalid { key: "batch.flush_interval", .. })
        ));
    }
}
