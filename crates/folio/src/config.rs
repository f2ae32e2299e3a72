//! Configuration for the pipeline components.
//!
//! Both structs deserialize with serde so they can be embedded in an
//! application's own configuration file.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct IdempotencyConfig {
    /// How long a record stays visible after it is written.
    pub record_ttl_secs: u64,
    /// How long a request waits for another request holding the same key.
    pub lock_timeout_ms: u64,
}

impl Default for IdempotencyConfig {
    fn default() -> Self {
        Self {
            record_ttl_secs: 24 * 60 * 60,
            lock_timeout_ms: 10_000,
        }
    }
}

impl IdempotencyConfig {
    pub fn record_ttl(&self) -> Duration {
        Duration::from_secs(self.record_ttl_secs)
    }

    pub fn lock_timeout(&self) -> Duration {
        Duration::from_millis(self.lock_timeout_ms)
    }

    pub fn with_record_ttl(mut self, ttl: Duration) -> Self {
        self.record_ttl_secs = ttl.as_secs();
        self
    }

    pub fn with_lock_timeout(mut self, timeout: Duration) -> Self {
        self.lock_timeout_ms = u64::try_from(timeout.as_millis()).unwrap_or(u64::MAX);
        self
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ContentStoreConfig {
    /// Directory holding the sharded tree.
    pub root: PathBuf,
    /// Public URL prefix that maps onto `root`.
    pub base_url: String,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn missing_fields_fall_back_to_defaults() {
        let config: IdempotencyConfig = serde_json::from_str(r#"{"lock_timeout_ms": 250}"#).unwrap();

        assert_eq!(config.lock_timeout(), Duration::from_millis(250));
        assert_eq!(config.record_ttl(), Duration::from_secs(86_400));
    }

    #[test]
    fn builders_override_durations() {
        let config = IdempotencyConfig::default()
            .with_record_ttl(Duration::from_secs(60))
            .with_lock_timeout(Duration::from_millis(1500));

        assert_eq!(config.record_ttl_secs, 60);
        assert_eq!(config.lock_timeout_ms, 1500);
    }
}
