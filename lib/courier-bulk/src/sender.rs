//! Sending compressed batches to a remote sink.

use std::sync::{
    atomic::{AtomicU64, Ordering::Relaxed},
    Arc,
};

use async_trait::async_trait;
use snafu::Snafu;
use tokio::{
    io::{AsyncWrite, AsyncWriteExt as _},
    sync::Mutex,
};
use tracing::debug;

use crate::{compression::CompressedBatch, GenericError};

/// A classified send failure.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)), visibility(pub))]
pub enum SendError {
    /// The send failed, but attempting it again could plausibly succeed.
    #[snafu(display("retryable send failure: {}", source))]
    Retryable {
        /// Error source.
        source: GenericError,
    },

    /// The send failed in a way that retrying the same payload cannot fix.
    #[snafu(display("non-retryable send failure: {}", source))]
    NonRetryable {
        /// Error source.
        source: GenericError,
    },
}

impl SendError {
    /// Creates a retryable send error.
    pub fn retryable<E>(error: E) -> Self
    where
        E: Into<GenericError>,
    {
        Self::Retryable { source: error.into() }
    }

    /// Creates a non-retryable send error.
    pub fn non_retryable<E>(error: E) -> Self
    where
        E: Into<GenericError>,
    {
        Self::NonRetryable { source: error.into() }
    }

    /// Returns `true` if this error is retryable.
    pub const fn is_retryable(&self) -> bool {
        matches!(self, Self::Retryable { .. })
    }
}

// Errors that weren't explicitly classified are treated as transient.
impl From<GenericError> for SendError {
    fn from(source: GenericError) -> Self {
        Self::Retryable { source }
    }
}

/// Ships compressed batches to a remote sink.
#[async_trait]
pub trait Sender: Send + Sync {
    /// Sends the given batch.
    ///
    /// # Errors
    ///
    /// If the batch could not be delivered, a classified error is returned.
    async fn send(&self, batch: &CompressedBatch) -> Result<(), SendError>;
}

#[async_trait]
impl<S> Sender for Arc<S>
where
    S: Sender + ?Sized,
{
    async fn send(&self, batch: &CompressedBatch) -> Result<(), SendError> {
        (**self).send(batch).await
    }
}

/// Sender that discards every batch.
#[derive(Debug, Default)]
pub struct BlackholeSender {
    batches: AtomicU64,
    records: AtomicU64,
    bytes: AtomicU64,
}

impl BlackholeSender {
    /// Returns the number of batches received.
    pub fn batches(&self) -> u64 {
        self.batches.load(Relaxed)
    }

    /// Returns the number of records received.
    pub fn records(&self) -> u64 {
        self.records.load(Relaxed)
    }

    /// Returns the number of compressed bytes received.
    pub fn bytes(&self) -> u64 {
        self.bytes.load(Relaxed)
    }
}

#[async_trait]
impl Sender for BlackholeSender {
    async fn send(&self, batch: &CompressedBatch) -> Result<(), SendError> {
        let batches = self.batches.fetch_add(1, Relaxed) + 1;
        self.records.fetch_add(batch.record_count(), Relaxed);
        self.bytes.fetch_add(batch.bytes().len() as u64, Relaxed);

        debug!(
            batches,
            records = batch.record_count(),
            compressed_len = batch.bytes().len(),
            "Blackhole received batch."
        );

        Ok(())
    }
}

/// Sender that writes the compressed bytes of each batch to a writer.
pub struct WriterSender<W> {
    writer: Mutex<W>,
}

impl<W> WriterSender<W> {
    /// Creates a new `WriterSender` wrapping the given writer.
    pub fn new(writer: W) -> Self {
        Self {
            writer: Mutex::new(writer),
        }
    }

    /// Consumes the sender, returning the inner writer.
    pub fn into_inner(self) -> W {
        self.writer.into_inner()
    }
}

#[async_trait]
impl<W> Sender for WriterSender<W>
where
    W: AsyncWrite + Unpin + Send,
{
    async fn send(&self, batch: &CompressedBatch) -> Result<(), SendError> {
        let mut writer = self.writer.lock().await;
        writer.write_all(batch.bytes()).await.map_err(SendError::retryable)?;
        writer.flush().await.map_err(SendError::retryable)?;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{batch::TypeCounts, generic_error, record::RecordType};

    fn compressed(data: &'static [u8], records: usize) -> CompressedBatch {
        let mut counts = TypeCounts::default();
        for _ in 0..records {
            counts.increment(RecordType::METRICS);
        }
        CompressedBatch::new(data, counts)
    }

    #[test]
    fn unclassified_errors_are_retryable() {
        let error: SendError = generic_error!("connection reset").into();
        assert!(error.is_retryable());
        assert!(!SendError::non_retryable(generic_error!("bad request")).is_retryable());
    }

    #[tokio::test]
    async fn blackhole_counts() {
        let sender = BlackholeSender::default();
        sender.send(&compressed(b"abc", 2)).await.expect("blackhole never fails");
        sender.send(&compressed(b"de", 1)).await.expect("blackhole never fails");

        assert_eq!(sender.batches(), 2);
        assert_eq!(sender.records(), 3);
        assert_eq!(sender.bytes(), 5);
    }

    #[tokio::test]
    async fn writer_appends_batches() {
        let sender = WriterSender::new(Vec::new());
        sender.send(&compressed(b"one\n", 1)).await.expect("vec writes never fail");
        sender.send(&compressed(b"two\n", 1)).await.expect("vec writes never fail");

        assert_eq!(sender.into_inner(), b"one\ntwo\n");
    }
}
