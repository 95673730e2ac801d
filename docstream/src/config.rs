//! Configuration for fetchers and write queues
//!
//! Every struct has a `Default` carrying the stock values and can be loaded
//! partially from JSON: missing fields keep their defaults.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Pagination settings of a [`crate::PagedFetcher`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct FetchConfig {
    /// Records requested per remote call
    pub page_size: usize,
    /// Cursor time-to-live sent with every call, in seconds
    pub ttl_secs: u64,
    /// Buffer size below which a background prefetch is scheduled.
    /// Defaults to `page_size`.
    pub prefetch_target: Option<usize>,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            page_size: 1000,
            ttl_secs: 360,
            prefetch_target: None,
        }
    }
}

impl FetchConfig {
    #[must_use]
    pub fn with_page_size(page_size: usize) -> Self {
        Self {
            page_size,
            ..Self::default()
        }
    }

    #[must_use]
    pub fn ttl(&self) -> Duration {
        Duration::from_secs(self.ttl_secs)
    }

    #[must_use]
    pub fn prefetch_target(&self) -> usize {
        self.prefetch_target.unwrap_or(self.page_size)
    }

    /// # Errors
    /// `Error::Config` naming the first invalid setting.
    pub fn validate(&self) -> Result<()> {
        first_failure(&[
            (self.page_size == 0, "fetch.page_size must be positive"),
            (
                self.prefetch_target == Some(0),
                "fetch.prefetch_target must be positive",
            ),
        ])
    }
}

/// Settings of a [`crate::ThrottledWriteQueue`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ThrottledQueueConfig {
    /// Admission floor; the ceiling never blocks below this
    pub min_in_flight: usize,
    /// Initial admission ceiling
    pub max_in_flight: usize,
    /// Give up on a write after this many throttle signals. `None` retries forever.
    pub max_throttle_retries: Option<u32>,
}

impl Default for ThrottledQueueConfig {
    fn default() -> Self {
        Self {
            min_in_flight: 5,
            max_in_flight: 25,
            max_throttle_retries: None,
        }
    }
}

impl ThrottledQueueConfig {
    /// # Errors
    /// `Error::Config` naming the first invalid setting.
    pub fn validate(&self) -> Result<()> {
        first_failure(&[(
            self.min_in_flight == 0,
            "throttled.min_in_flight must be positive",
        )])
    }
}

/// Settings of a [`crate::BulkWriteQueue`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BulkQueueConfig {
    pub batch_size: usize,
    pub batch_bytes: usize,
    pub max_concurrent_batches: usize,
    /// Retries of one batch on transient failures
    pub max_retries: u32,
    pub flush_interval_ms: u64,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub close_timeout_ms: u64,
}

impl Default for BulkQueueConfig {
    fn default() -> Self {
        Self {
            batch_size: 1000,
            batch_bytes: 5 * 1024 * 1024,
            max_concurrent_batches: 2,
            max_retries: 5,
            flush_interval_ms: 5000,
            initial_backoff_ms: 1000,
            max_backoff_ms: 30_000,
            close_timeout_ms: 60_000,
        }
    }
}

impl BulkQueueConfig {
    #[must_use]
    pub fn flush_interval(&self) -> Duration {
        Duration::from_millis(self.flush_interval_ms)
    }

    #[must_use]
    pub fn initial_backoff(&self) -> Duration {
        Duration::from_millis(self.initial_backoff_ms)
    }

    #[must_use]
    pub fn max_backoff(&self) -> Duration {
        Duration::from_millis(self.max_backoff_ms)
    }

    #[must_use]
    pub fn close_timeout(&self) -> Duration {
        Duration::from_millis(self.close_timeout_ms)
    }

    /// # Errors
    /// `Error::Config` naming the first invalid setting.
    pub fn validate(&self) -> Result<()> {
        first_failure(&[
            (self.batch_size == 0, "bulk.batch_size must be positive"),
            (self.batch_bytes == 0, "bulk.batch_bytes must be positive"),
            (
                self.max_concurrent_batches == 0,
                "bulk.max_concurrent_batches must be positive",
            ),
            (
                self.flush_interval_ms == 0,
                "bulk.flush_interval_ms must be positive",
            ),
        ])
    }
}

/// Combined configuration, as loaded by the CLI
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
    pub fetch: FetchConfig,
    pub throttled: ThrottledQueueConfig,
    pub bulk: BulkQueueConfig,
}

impl StreamConfig {
    /// Parse and validate a JSON document.
    ///
    /// # Errors
    /// `Error::Json` on malformed input, `Error::Config` on invalid values.
    pub fn from_json_str(text: &str) -> Result<Self> {
        let config: Self = serde_json::from_str(text)?;
        config.validate()?;
        Ok(config)
    }

    /// # Errors
    /// `Error::Config` naming the first invalid setting.
    pub fn validate(&self) -> Result<()> {
        self.fetch.validate()?;
        self.throttled.validate()?;
        self.bulk.validate()
    }
}

/// `Err` with the message of the first failed check
fn first_failure(checks: &[(bool, &str)]) -> Result<()> {
    match checks.iter().find(|(failed, _)| *failed) {
        Some((_, message)) => Err(Error::Config((*message).to_string())),
        None => Ok(()),
    }
}
