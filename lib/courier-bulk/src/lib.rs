//! Bulk reporting pipeline.
//!
//! Records are accumulated into size- and time-bounded batches, which are then compressed and sent to a remote sink
//! with bounded concurrency, retries, and a global byte budget that bounds the memory held by records in flight.
#![deny(missing_docs)]

pub mod batch;
pub mod budget;
pub mod compression;
pub mod config;
pub mod processor;
pub mod record;
pub mod retry;
pub mod sender;
pub mod telemetry;
pub mod transform;

pub use self::batch::{Batch, FlushReason, Offer, TypeCounts};
pub use self::budget::{ByteBudget, Reservation};
pub use self::compression::{BatchCompressor, CompressedBatch, CompressionError, CompressionScheme, StandardCompressor};
pub use self::config::{BulkConfiguration, BulkConfigurationError};
pub use self::processor::{BulkProcessor, PipelineState, ProcessorError};
pub use self::record::{Record, RecordType, RecordValidity, RequestMetrics, Validator};
pub use self::retry::{ExponentialBackoff, RetryClassifier, RetryPolicy, SendOutcome, StandardClassifier};
pub use self::sender::{BlackholeSender, SendError, Sender, WriterSender};
pub use self::transform::{JsonLinesTransformer, TransformedPayload, Transformer};

/// A type-erased error.
pub type GenericError = anyhow::Error;

#[doc(hidden)]
pub use anyhow::anyhow as _anyhow;

/// Creates a [`GenericError`] from a message or format string.
#[macro_export]
macro_rules! generic_error {
    ($($args:tt)*) => {
        $crate::_anyhow!($($args)*)
    };
}
