//! Record serialization.

use bytes::Bytes;
use serde::Serialize;

use crate::record::{Record, RecordType};

/// A record in its serialized form, ready to be appended to a batch.
#[derive(Clone, Debug, Eq, PartialEq)]
pub struct TransformedPayload {
    bytes: Bytes,
    record_type: RecordType,
}

impl TransformedPayload {
    /// Creates a new `TransformedPayload`.
    pub fn new<B>(bytes: B, record_type: RecordType) -> Self
    where
        B: Into<Bytes>,
    {
        Self {
            bytes: bytes.into(),
            record_type,
        }
    }

    /// Returns the serialized bytes.
    pub fn bytes(&self) -> &Bytes {
        &self.bytes
    }

    /// Returns the type tag of the record this payload was produced from.
    pub const fn record_type(&self) -> RecordType {
        self.record_type
    }

    /// Returns the length of the payload, in bytes.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    /// Returns `true` if the payload is empty.
    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }
}

/// Serializes records into payloads.
pub trait Transformer<R>: Send + Sync {
    /// Error returned when a record cannot be transformed.
    type Error: std::error::Error + Send + Sync + 'static;

    /// Transforms the given record.
    ///
    /// # Errors
    ///
    /// If the record cannot be serialized, an error is returned and the record is dropped by the caller.
    fn transform(&self, record: &R) -> Result<TransformedPayload, Self::Error>;
}

/// Transformer that writes each record as a single line of JSON.
#[derive(Clone, Copy, Debug, Default)]
pub struct JsonLinesTransformer;

impl<R> Transformer<R> for JsonLinesTransformer
where
    R: Record + Serialize,
{
    type Error = serde_json::Error;

    fn transform(&self, record: &R) -> Result<TransformedPayload, Self::Error> {
        let mut buf = serde_json::to_vec(record)?;
        buf.push(b'\n');
        Ok(TransformedPayload::new(buf, record.record_type()))
    }
}
