//! Pipeline metrics.

use metrics::{counter, histogram, Counter, Histogram};

use crate::batch::FlushReason;

/// Why a record was dropped before entering a batch.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum RecordDropReason {
    /// The record failed validation.
    Invalid,
    /// The record could not be transformed.
    TransformFailure,
    /// The byte budget was exhausted.
    BudgetExhausted,
    /// The pipeline was not running.
    NotRunning,
}

/// Why a batch was dropped without being delivered.
#[derive(Clone, Copy, Debug, Eq, PartialEq)]
pub enum BatchDropReason {
    /// The batch could not be compressed.
    CompressionFailure,
    /// The sink rejected the batch with a non-retryable error.
    NonRetryable,
    /// All retries failed.
    RetriesExhausted,
    /// The pipeline stopped before the batch was delivered.
    Shutdown,
}

/// Pipeline telemetry.
#[derive(Clone)]
pub struct Telemetry {
    records_received: Counter,
    records_dropped_invalid: Counter,
    records_dropped_transform: Counter,
    records_dropped_budget: Counter,
    records_dropped_not_running: Counter,
    batches_flushed_full: Counter,
    batches_flushed_interval: Counter,
    batches_flushed_shutdown: Counter,
    batches_dropped_compression: Counter,
    batches_dropped_non_retryable: Counter,
    batches_dropped_retries_exhausted: Counter,
    batches_dropped_shutdown: Counter,
    send_attempts: Counter,
    batches_sent: Counter,
    records_sent: Counter,
    bytes_sent: Counter,
    batch_size: Histogram,
}

impl Telemetry {
    /// Registers the pipeline metrics with the global recorder.
    pub fn register() -> Self {
        Self {
            records_received: counter!("bulk_records_received_total"),
            records_dropped_invalid: counter!("bulk_records_dropped_total", "drop_reason" => "invalid"),
            records_dropped_transform: counter!("bulk_records_dropped_total", "drop_reason" => "transform_failure"),
            records_dropped_budget: counter!("bulk_records_dropped_total", "drop_reason" => "budget_exhausted"),
            records_dropped_not_running: counter!("bulk_records_dropped_total", "drop_reason" => "not_running"),
            batches_flushed_full: counter!("bulk_batches_flushed_total", "flush_reason" => "full"),
            batches_flushed_interval: counter!("bulk_batches_flushed_total", "flush_reason" => "interval"),
            batches_flushed_shutdown: counter!("bulk_batches_flushed_total", "flush_reason" => "shutdown"),
            batches_dropped_compression: counter!("bulk_batches_dropped_total", "drop_reason" => "compression_failure"),
            batches_dropped_non_retryable: counter!("bulk_batches_dropped_total", "drop_reason" => "non_retryable"),
            batches_dropped_retries_exhausted: counter!("bulk_batches_dropped_total", "drop_reason" => "retries_exhausted"),
            batches_dropped_shutdown: counter!("bulk_batches_dropped_total", "drop_reason" => "shutdown"),
            send_attempts: counter!("bulk_send_attempts_total"),
            batches_sent: counter!("bulk_batches_sent_total"),
            records_sent: counter!("bulk_records_sent_total"),
            bytes_sent: counter!("bulk_bytes_sent_total"),
            batch_size: histogram!("bulk_batch_size"),
        }
    }

    /// Counts a record handed to the pipeline, whether or not it is admitted.
    pub fn record_received(&self) {
        self.records_received.increment(1);
    }

    /// Counts a record dropped before entering a batch.
    pub fn record_dropped(&self, reason: RecordDropReason) {
        let counter = match reason {
            RecordDropReason::Invalid => &self.records_dropped_invalid,
            RecordDropReason::TransformFailure => &self.records_dropped_transform,
            RecordDropReason::BudgetExhausted => &self.records_dropped_budget,
            RecordDropReason::NotRunning => &self.records_dropped_not_running,
        };
        counter.increment(1);
    }

    /// Counts a flushed batch, and records its size in records.
    pub fn batch_flushed(&self, reason: FlushReason, records: usize) {
        let counter = match reason {
            FlushReason::Full => &self.batches_flushed_full,
            FlushReason::Interval => &self.batches_flushed_interval,
            FlushReason::Shutdown => &self.batches_flushed_shutdown,
        };
        counter.increment(1);
        self.batch_size.record(records as f64);
    }

    /// Counts a batch dropped without being delivered.
    pub fn batch_dropped(&self, reason: BatchDropReason) {
        let counter = match reason {
            BatchDropReason::CompressionFailure => &self.batches_dropped_compression,
            BatchDropReason::NonRetryable => &self.batches_dropped_non_retryable,
            BatchDropReason::RetriesExhausted => &self.batches_dropped_retries_exhausted,
            BatchDropReason::Shutdown => &self.batches_dropped_shutdown,
        };
        counter.increment(1);
    }

    /// Adds the attempts made for one batch, including retries.
    pub fn send_attempts(&self, attempts: u32) {
        self.send_attempts.increment(u64::from(attempts));
    }

    /// Counts a delivered batch, along with its records and compressed bytes.
    pub fn batch_sent(&self, records: u64, bytes: usize) {
        self.batches_sent.increment(1);
        self.records_sent.increment(records);
        self.bytes_sent.increment(bytes as u64);
    }
}
