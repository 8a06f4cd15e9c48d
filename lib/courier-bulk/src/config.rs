//! Bulk pipeline configuration.

use std::time::Duration;

use bytesize::ByteSize;
use courier_config::GenericConfiguration;
use serde::Deserialize;
use snafu::{ensure, ResultExt as _, Snafu};

use crate::{
    compression::{CompressionError, CompressionScheme},
    retry::{ExponentialBackoff, RetryPolicy},
    GenericError,
};

const fn default_max_items() -> usize {
    100
}

const fn default_flush_interval_secs() -> u64 {
    5
}

const fn default_max_concurrent_sends() -> usize {
    1
}

const fn default_max_retries() -> u32 {
    3
}

const fn default_retry_initial_delay_ms() -> u64 {
    100
}

const fn default_retry_max_delay_ms() -> u64 {
    10_000
}

const fn default_retry_jitter_factor() -> f64 {
    0.0
}

fn default_max_budget() -> ByteSize {
    ByteSize::mib(64)
}

fn default_compression() -> String {
    "zstd".to_string()
}

const fn default_compression_level() -> i32 {
    3
}

const fn default_flush_on_stop() -> bool {
    false
}

const fn default_drain_timeout_secs() -> u64 {
    5
}

/// Bulk pipeline configuration errors.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum BulkConfigurationError {
    /// `bulk_max_items` was zero.
    #[snafu(display("bulk_max_items must be greater than zero"))]
    ZeroMaxItems,

    /// `bulk_flush_interval_secs` was zero.
    #[snafu(display("bulk_flush_interval_secs must be greater than zero"))]
    ZeroFlushInterval,

    /// `bulk_max_concurrent_sends` was zero.
    #[snafu(display("bulk_max_concurrent_sends must be at least one"))]
    ZeroConcurrentSends,

    /// The maximum retry delay was lower than the initial retry delay.
    #[snafu(display(
        "bulk_retry_max_delay_ms ({}) must not be lower than bulk_retry_initial_delay_ms ({})",
        max_delay_ms,
        initial_delay_ms
    ))]
    InvertedRetryDelays {
        /// Initial retry delay, in milliseconds.
        initial_delay_ms: u64,
        /// Maximum retry delay, in milliseconds.
        max_delay_ms: u64,
    },

    /// The compression scheme was invalid.
    #[snafu(display("invalid bulk_compression: {}", source))]
    InvalidCompression {
        /// Error source.
        source: CompressionError,
    },
}

/// Bulk pipeline configuration.
///
/// All settings are optional and prefixed with `bulk_`, so that they flatten cleanly into environment variables (for
/// example, `COURIER_BULK_MAX_ITEMS`).
#[derive(Clone, Debug, Deserialize)]
pub struct BulkConfiguration {
    /// Maximum number of records in a single batch.
    ///
    /// Defaults to 100.
    #[serde(default = "default_max_items", rename = "bulk_max_items")]
    max_items: usize,

    /// Maximum time a non-empty batch is held before being flushed, in seconds.
    ///
    /// Defaults to 5 seconds.
    #[serde(default = "default_flush_interval_secs", rename = "bulk_flush_interval_secs")]
    flush_interval_secs: u64,

    /// Maximum number of batches being sent at the same time.
    ///
    /// Defaults to 1.
    #[serde(default = "default_max_concurrent_sends", rename = "bulk_max_concurrent_sends")]
    max_concurrent_sends: usize,

    /// Maximum number of retries after the initial send attempt.
    ///
    /// Defaults to 3.
    #[serde(default = "default_max_retries", rename = "bulk_max_retries")]
    max_retries: u32,

    /// Backoff before the first retry, in milliseconds.
    ///
    /// Defaults to 100 milliseconds.
    #[serde(default = "default_retry_initial_delay_ms", rename = "bulk_retry_initial_delay_ms")]
    retry_initial_delay_ms: u64,

    /// Upper bound of the retry backoff, in milliseconds.
    ///
    /// Defaults to 10 seconds.
    #[serde(default = "default_retry_max_delay_ms", rename = "bulk_retry_max_delay_ms")]
    retry_max_delay_ms: u64,

    /// Fraction of each backoff delay, between 0.0 and 1.0, that may be randomly shaved off.
    ///
    /// 0.0 disables jitter, which keeps backoff delays monotonic.
    ///
    /// Defaults to 0.0.
    #[serde(default = "default_retry_jitter_factor", rename = "bulk_retry_jitter_factor")]
    retry_jitter_factor: f64,

    /// Maximum number of bytes buffered or in flight across the pipeline.
    ///
    /// Defaults to 64MiB.
    #[serde(default = "default_max_budget", rename = "bulk_max_budget")]
    max_budget: ByteSize,

    /// Compression scheme: `none`, `zlib`, or `zstd`.
    ///
    /// Defaults to `zstd`.
    #[serde(default = "default_compression", rename = "bulk_compression")]
    compression: String,

    /// Compression level, used by `zstd` only.
    ///
    /// Defaults to 3.
    #[serde(default = "default_compression_level", rename = "bulk_compression_level")]
    compression_level: i32,

    /// Whether a partially-filled batch is sent when the pipeline stops.
    ///
    /// Defaults to `false`.
    #[serde(default = "default_flush_on_stop", rename = "bulk_flush_on_stop")]
    flush_on_stop: bool,

    /// Maximum time to wait for in-flight sends when stopping, in seconds.
    ///
    /// Defaults to 5 seconds.
    #[serde(default = "default_drain_timeout_secs", rename = "bulk_drain_timeout_secs")]
    drain_timeout_secs: u64,
}

impl Default for BulkConfiguration {
    fn default() -> Self {
        Self {
            max_items: default_max_items(),
            flush_interval_secs: default_flush_interval_secs(),
            max_concurrent_sends: default_max_concurrent_sends(),
            max_retries: default_max_retries(),
            retry_initial_delay_ms: default_retry_initial_delay_ms(),
            retry_max_delay_ms: default_retry_max_delay_ms(),
            retry_jitter_factor: default_retry_jitter_factor(),
            max_budget: default_max_budget(),
            compression: default_compression(),
            compression_level: default_compression_level(),
            flush_on_stop: default_flush_on_stop(),
            drain_timeout_secs: default_drain_timeout_secs(),
        }
    }
}

impl BulkConfiguration {
    /// Creates a new `BulkConfiguration` from the given configuration.
    ///
    /// # Errors
    ///
    /// If the configuration cannot be deserialized, or the resulting settings are invalid, an error is returned.
    pub fn from_configuration(config: &GenericConfiguration) -> Result<Self, GenericError> {
        let bulk_config = config.as_typed::<Self>()?;
        bulk_config.validate()?;
        Ok(bulk_config)
    }

    /// Validates the settings.
    ///
    /// # Errors
    ///
    /// If any setting is out of range, an error is returned.
    pub fn validate(&self) -> Result<(), BulkConfigurationError> {
        ensure!(self.max_items > 0, ZeroMaxItems);
        ensure!(self.flush_interval_secs > 0, ZeroFlushInterval);
        ensure!(self.max_concurrent_sends > 0, ZeroConcurrentSends);
        ensure!(
            self.retry_max_delay_ms >= self.retry_initial_delay_ms,
            InvertedRetryDelays {
                initial_delay_ms: self.retry_initial_delay_ms,
                max_delay_ms: self.retry_max_delay_ms,
            }
        );
        self.compression_scheme()?;

        Ok(())
    }

    /// Sets the maximum number of records in a single batch.
    pub fn with_max_items(mut self, max_items: usize) -> Self {
        self.max_items = max_items;
        self
    }

    /// Sets the flush interval, in seconds.
    pub fn with_flush_interval_secs(mut self, flush_interval_secs: u64) -> Self {
        self.flush_interval_secs = flush_interval_secs;
        self
    }

    /// Sets the maximum number of concurrent sends.
    pub fn with_max_concurrent_sends(mut self, max_concurrent_sends: usize) -> Self {
        self.max_concurrent_sends = max_concurrent_sends;
        self
    }

    /// Sets the maximum number of retries.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Sets the initial and maximum retry delays.
    pub fn with_retry_delays(mut self, initial: Duration, max: Duration) -> Self {
        self.retry_initial_delay_ms = u64::try_from(initial.as_millis()).unwrap_or(u64::MAX);
        self.retry_max_delay_ms = u64::try_from(max.as_millis()).unwrap_or(u64::MAX);
        self
    }

    /// Sets the byte budget.
    pub fn with_max_budget_bytes(mut self, max_budget_bytes: u64) -> Self {
        self.max_budget = ByteSize::b(max_budget_bytes);
        self
    }

    /// Sets whether a partially-filled batch is sent when stopping.
    pub fn with_flush_on_stop(mut self, flush_on_stop: bool) -> Self {
        self.flush_on_stop = flush_on_stop;
        self
    }

    /// Sets the drain timeout, in seconds.
    pub fn with_drain_timeout_secs(mut self, drain_timeout_secs: u64) -> Self {
        self.drain_timeout_secs = drain_timeout_secs;
        self
    }

    /// Returns the maximum number of records in a single batch.
    pub const fn max_items(&self) -> usize {
        self.max_items
    }

    /// Returns the flush interval.
    pub const fn flush_interval(&self) -> Duration {
        Duration::from_secs(self.flush_interval_secs)
    }

    /// Returns the maximum number of concurrent sends.
    pub const fn max_concurrent_sends(&self) -> usize {
        self.max_concurrent_sends
    }

    /// Returns the maximum number of retries.
    pub const fn max_retries(&self) -> u32 {
        self.max_retries
    }

    /// Returns the backoff before the first retry.
    pub const fn retry_initial_delay(&self) -> Duration {
        Duration::from_millis(self.retry_initial_delay_ms)
    }

    /// Returns the upper bound of the retry backoff.
    pub const fn retry_max_delay(&self) -> Duration {
        Duration::from_millis(self.retry_max_delay_ms)
    }

    /// Returns the byte budget.
    pub fn max_budget_bytes(&self) -> u64 {
        self.max_budget.as_u64()
    }

    /// Returns `true` if a partially-filled batch is sent when stopping.
    pub const fn flush_on_stop(&self) -> bool {
        self.flush_on_stop
    }

    /// Returns the drain timeout.
    pub const fn drain_timeout(&self) -> Duration {
        Duration::from_secs(self.drain_timeout_secs)
    }

    /// Returns the configured compression scheme.
    ///
    /// # Errors
    ///
    /// If the compression scheme name is not recognized, an error is returned.
    pub fn compression_scheme(&self) -> Result<CompressionScheme, BulkConfigurationError> {
        CompressionScheme::parse(&self.compression, self.compression_level).context(InvalidCompression)
    }

    /// Creates the retry policy described by these settings.
    pub fn retry_policy(&self) -> RetryPolicy {
        let backoff = ExponentialBackoff::new(self.retry_initial_delay(), self.retry_max_delay())
            .with_jitter(self.retry_jitter_factor);
        RetryPolicy::new(self.max_retries, backoff)
    }
}
