use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::error::{FeedError, Result};
use crate::protocol::MAX_PAGE_SIZE;
use crate::retry::{RetryConfig, MAX_RETRY_ATTEMPTS};

/// What the scheduler does when a stored cursor stops resolving
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum InvalidCursorPolicy {
    /// Drop cached pages and continue from the start of the feed
    #[default]
    Restart,
    /// Stop advancing; the feed is treated as exhausted until reset
    Stop,
}

/// Feed pagination settings.
///
/// Read from `FEED_*` environment variables by [`FeedConfig::from_env`]
/// (`FEED_PAGE_SIZE`, `FEED_DEBOUNCE_MS`, `FEED_MAX_CACHED_PAGES`, ...).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    #[serde(default = "default_page_size")]
    pub page_size: u32,
    #[serde(default = "default_debounce_ms")]
    pub debounce_ms: u64,
    #[serde(default = "default_max_cached_pages")]
    pub max_cached_pages: usize,
    /// Automatic retries after a failed fetch (0 disables)
    #[serde(default = "default_retry_attempts")]
    pub retry_attempts: u32,
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,
    #[serde(default = "default_fetch_timeout_ms")]
    pub fetch_timeout_ms: u64,
    #[serde(default)]
    pub invalid_cursor_policy: InvalidCursorPolicy,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            page_size: default_page_size(),
            debounce_ms: default_debounce_ms(),
            max_cached_pages: default_max_cached_pages(),
            retry_attempts: default_retry_attempts(),
            retry_backoff_ms: default_retry_backoff_ms(),
            fetch_timeout_ms: default_fetch_timeout_ms(),
            invalid_cursor_policy: InvalidCursorPolicy::default(),
        }
    }
}

impl FeedConfig {
    pub fn from_env() -> Result<Self> {
        dotenvy::dotenv().ok();

        let config: FeedConfig = envy::prefixed("FEED_").from_env()?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<()> {
        if self.page_size == 0 || self.page_size > MAX_PAGE_SIZE {
            return Err(FeedError::Config(format!(
                "page_size must be between 1 and {}",
                MAX_PAGE_SIZE
            )));
        }
        if self.max_cached_pages == 0 {
            return Err(FeedError::Config(
                "max_cached_pages must be at least 1".to_string(),
            ));
        }
        if self.fetch_timeout_ms == 0 {
            return Err(FeedError::Config(
                "fetch_timeout_ms must be greater than zero".to_string(),
            ));
        }
        Ok(())
    }

    pub fn debounce(&self) -> Duration {
        Duration::from_millis(self.debounce_ms)
    }

    pub fn fetch_timeout(&self) -> Duration {
        Duration::from_millis(self.fetch_timeout_ms)
    }

    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_retries: self.retry_attempts.min(MAX_RETRY_ATTEMPTS),
            initial_backoff: Duration::from_millis(self.retry_backoff_ms),
            ..Default::default()
        }
    }
}

fn default_page_size() -> u32 {
    20
}

fn default_debounce_ms() -> u64 {
    200
}

fn default_max_cached_pages() -> usize {
    10
}

fn default_retry_attempts() -> u32 {
    3
}

fn default_retry_backoff_ms() -> u64 {
    250
}

fn default_fetch_timeout_ms() -> u64 {
    10_000
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_config_default() {
        let config = FeedConfig::default();
        assert_eq!(config.page_size, 20);
        assert_eq!(config.debounce(), Duration::from_millis(200));
        assert_eq!(config.max_cached_pages, 10);
        assert_eq!(config.invalid_cursor_policy, InvalidCursorPolicy::Restart);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_values() {
        let config = FeedConfig {
            page_size: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(FeedError::Config(_))));

        let config = FeedConfig {
            max_cached_pages: 0,
            ..Default::default()
        };
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_retry_attempts_are_capped() {
        let config = FeedConfig {
            retry_attempts: 50,
            retry_backoff_ms: 40,
            ..Default::default()
        };
        let retry = config.retry_config();
        assert_eq!(retry.max_retries, MAX_RETRY_ATTEMPTS);
        assert_eq!(retry.initial_backoff, Duration::from_millis(40));
    }

    #[test]
    fn test_from_env_iter() {
        let vars = vec![
            ("FEED_PAGE_SIZE".to_string(), "10".to_string()),
            ("FEED_DEBOUNCE_MS".to_string(), "150".to_string()),
            ("FEED_INVALID_CURSOR_POLICY".to_string(), "stop".to_string()),
        ];
        let config: FeedConfig = envy::prefixed("FEED_").from_iter(vars).unwrap();
        assert_eq!(config.page_size, 10);
        assert_eq!(config.debounce_ms, 150);
        assert_eq!(config.max_cached_pages, 10);
        assert_eq!(config.invalid_cursor_policy, InvalidCursorPolicy::Stop);
    }
}
