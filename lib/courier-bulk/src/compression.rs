//! Batch compression.

use std::io;

use async_compression::{
    tokio::write::{ZlibEncoder, ZstdEncoder},
    Level,
};
use async_trait::async_trait;
use bytes::Bytes;
use snafu::{ResultExt as _, Snafu};
use tokio::io::{AsyncWrite, AsyncWriteExt as _};

use crate::batch::{Batch, TypeCounts};

/// Compression errors.
#[derive(Debug, Snafu)]
#[snafu(context(suffix(false)))]
pub enum CompressionError {
    /// The compression scheme name was not recognized.
    #[snafu(display("unknown compression scheme '{}' (expected one of: none, zlib, zstd)", scheme))]
    UnknownScheme {
        /// Name of the compression scheme.
        scheme: String,
    },

    /// Writing to the encoder failed.
    #[snafu(display("failed to compress batch: {}", source))]
    Io {
        /// Error source.
        source: io::Error,
    },
}

/// Compression schemes supported by [`StandardCompressor`].
#[derive(Copy, Clone, Debug)]
pub enum CompressionScheme {
    /// No compression.
    Noop,
    /// Zlib.
    Zlib(Level),
    /// Zstd.
    Zstd(Level),
}

impl CompressionScheme {
    /// No compression.
    pub const fn noop() -> Self {
        Self::Noop
    }

    /// Zlib compression, using the default compression level (6).
    pub const fn zlib_default() -> Self {
        Self::Zlib(Level::Default)
    }

    /// Zstd compression, using the default compression level (3).
    pub const fn zstd_default() -> Self {
        Self::Zstd(Level::Default)
    }

    /// Parses a compression scheme from its name and level.
    ///
    /// Supported names are `none`, `zlib`, and `zstd`. The level is only used for `zstd`.
    ///
    /// # Errors
    ///
    /// If the name is not recognized, an error is returned.
    pub fn parse(scheme: &str, level: i32) -> Result<Self, CompressionError> {
        match scheme {
            "none" | "noop" => Ok(Self::Noop),
            "zlib" => Ok(Self::zlib_default()),
            "zstd" => Ok(Self::Zstd(Level::Precise(level))),
            other => UnknownScheme { scheme: other }.fail(),
        }
    }

    /// Returns the HTTP content encoding matching this scheme.
    pub const fn content_encoding(&self) -> Option<&'static str> {
        match self {
            Self::Noop => None,
            Self::Zlib(_) => Some("deflate"),
            Self::Zstd(_) => Some("zstd"),
        }
    }
}

/// A frozen batch in its compressed, ready-to-send form.
#[derive(Clone, Debug)]
pub struct CompressedBatch {
    bytes: Bytes,
    counts: TypeCounts,
    content_encoding: Option<&'static str>,
}

impl CompressedBatch {
    /// Creates a new `CompressedBatch`.
    pub fn new<B>(bytes: B, counts: TypeCounts) -> Self
    where
        B: Into<Bytes>,
    {
        Self {
            bytes: bytes.into(),
            counts,
            content_encoding: None,
        }
    }

    /// Sets the content encoding of the compressed bytes.
    pub fn with_content_encoding(mut self, content_encoding: Option<&'static str>) -> Self {
        self.content_encoding = content_encoding;
        self
    }

    /// Returns the compressed bytes.
    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    /// Returns the per-type counts of records in this batch.
    pub fn counts(&self) -> &TypeCounts {
        &self.counts
    }

    /// Returns the total number of records in this batch.
    pub fn record_count(&self) -> u64 {
        self.counts.total()
    }

    /// Returns the content encoding of the compressed bytes, if any.
    pub const fn content_encoding(&self) -> Option<&'static str> {
        self.content_encoding
    }
}

/// Compresses frozen batches.
#[async_trait]
pub trait BatchCompressor: Send + Sync {
    /// Error returned when a batch cannot be compressed.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Compresses the given batch.
    ///
    /// # Errors
    ///
    /// If the batch cannot be compressed, an error is returned and the batch is dropped by the caller.
    async fn compress(&self, batch: &Batch) -> Result<CompressedBatch, Self::Error>;
}

/// Compressor backed by `async-compression`.
///
/// Payloads are written to the encoder back-to-back, in batch order.
#[derive(Clone, Copy, Debug)]
pub struct StandardCompressor {
    scheme: CompressionScheme,
}

impl StandardCompressor {
    /// Creates a new `StandardCompressor` using the given compression scheme.
    pub const fn new(scheme: CompressionScheme) -> Self {
        Self { scheme }
    }

    /// Returns the compression scheme in use.
    pub const fn scheme(&self) -> CompressionScheme {
        self.scheme
    }
}

async fn write_batch<W>(mut writer: W, batch: &Batch) -> io::Result<W>
where
    W: AsyncWrite + Unpin,
{
    for payload in batch.payloads() {
        writer.write_all(payload.bytes()).await?;
    }
    writer.shutdown().await?;

    Ok(writer)
}

#[async_trait]
impl BatchCompressor for StandardCompressor {
    type Error = CompressionError;

    async fn compress(&self, batch: &Batch) -> Result<CompressedBatch, Self::Error> {
        let buf = Vec::with_capacity(batch.byte_size());
        let compressed = match self.scheme {
            CompressionScheme::Noop => write_batch(buf, batch).await.context(Io)?,
            CompressionScheme::Zlib(level) => write_batch(ZlibEncoder::with_quality(buf, level), batch)
                .await
                .context(Io)?
                .into_inner(),
            CompressionScheme::Zstd(level) => write_batch(ZstdEncoder::with_quality(buf, level), batch)
                .await
                .context(Io)?
                .into_inner(),
        };

        Ok(CompressedBatch::new(compressed, batch.counts().clone())
            .with_content_encoding(self.scheme.content_encoding()))
    }
}

#[cfg(test)]
mod tests {
    use async_compression::tokio::bufread::{ZlibDecoder, ZstdDecoder};
    use tokio::io::AsyncReadExt as _;

    use super::*;
    use crate::{
        batch::{Accumulator, Offer},
        budget::ByteBudget,
        record::RecordType,
        transform::TransformedPayload,
    };

    fn three_line_batch() -> Batch {
        let budget = ByteBudget::new(u64::MAX);
        let accumulator = Accumulator::new(3);
        let lines: [&'static [u8]; 3] = [b"{\"a\":1}\n", b"{\"b\":2}\n", b"{\"c\":3}\n"];

        lines
            .into_iter()
            .find_map(|line| {
                let reservation = budget.try_reserve(line.len() as u64).expect("unbounded budget");
                match accumulator.offer(TransformedPayload::new(line, RecordType::METRICS), reservation) {
                    Offer::Full(batch) => Some(batch),
                    _ => None,
                }
            })
            .expect("third payload should fill the batch")
    }

    const EXPECTED: &[u8] = b"{\"a\":1}\n{\"b\":2}\n{\"c\":3}\n";

    #[test]
    fn parse_scheme() {
        assert!(matches!(CompressionScheme::parse("none", 0), Ok(CompressionScheme::Noop)));
        assert!(matches!(CompressionScheme::parse("zlib", 0), Ok(CompressionScheme::Zlib(_))));
        assert!(matches!(
            CompressionScheme::parse("zstd", 9),
            Ok(CompressionScheme::Zstd(Level::Precise(9)))
        ));
        assert!(matches!(
            CompressionScheme::parse("brotli", 0),
            Err(CompressionError::UnknownScheme { .. })
        ));
    }

    #[tokio::test]
    async fn noop_concatenates_in_order() {
        let batch = three_line_batch();
        let compressed = StandardCompressor::new(CompressionScheme::noop())
            .compress(&batch)
            .await
            .expect("should not fail to compress");

        assert_eq!(compressed.bytes().as_ref(), EXPECTED);
        assert_eq!(compressed.record_count(), 3);
        assert_eq!(compressed.content_encoding(), None);
    }

    #[tokio::test]
    async fn zlib_and_zstd_decode_to_concatenation() {
        let batch = three_line_batch();

        let zlib = StandardCompressor::new(CompressionScheme::zlib_default())
            .compress(&batch)
            .await
            .expect("should not fail to compress");
        assert_eq!(zlib.content_encoding(), Some("deflate"));
        let mut decoded = Vec::new();
        ZlibDecoder::new(zlib.bytes().as_ref())
            .read_to_end(&mut decoded)
            .await
            .expect("should decode");
        assert_eq!(decoded, EXPECTED);

        let zstd = StandardCompressor::new(CompressionScheme::zstd_default())
            .compress(&batch)
            .await
            .expect("should not fail to compress");
        assert_eq!(zstd.content_encoding(), Some("zstd"));
        let mut decoded = Vec::new();
        ZstdDecoder::new(zstd.bytes().as_ref())
            .read_to_end(&mut decoded)
            .await
            .expect("should decode");
        assert_eq!(decoded, EXPECTED);
        assert_eq!(zstd.counts().get(RecordType::METRICS), 3);
    }
}
