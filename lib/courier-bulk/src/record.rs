//! Records and record validation.

use std::fmt;

use serde::{Deserialize, Serialize};

/// Type tag of a record.
///
/// Every payload in a batch carries the tag of the record it was produced from, which is what backs the per-type
/// counters of a batch.
#[derive(Clone, Copy, Debug, Eq, Hash, Ord, PartialEq, PartialOrd)]
pub struct RecordType(&'static str);

impl RecordType {
    /// Request metrics.
    pub const METRICS: Self = Self("metrics");

    /// Request/response logs.
    pub const LOG: Self = Self("log");

    /// Endpoint health status.
    pub const HEALTH: Self = Self("health");

    /// Node monitoring data.
    pub const MONITOR: Self = Self("monitor");

    /// Creates a custom record type.
    pub const fn new(name: &'static str) -> Self {
        Self(name)
    }

    /// Returns the name of this record type.
    pub const fn as_str(&self) -> &'static str {
        self.0
    }
}

impl fmt::Display for RecordType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.0)
    }
}

/// A unit of telemetry accepted by the pipeline.
pub trait Record {
    /// Returns the type tag of this record.
    fn record_type(&self) -> RecordType;

    /// Returns `true` if all of the fields required to identify this record are present.
    ///
    /// Defaults to `true`.
    fn is_valid(&self) -> bool {
        true
    }
}

/// Decides whether a record may enter a batch.
pub trait Validator<R>: Send + Sync {
    /// Returns `true` if the record is valid.
    fn validate(&self, record: &R) -> bool;
}

impl<R, F> Validator<R> for F
where
    F: Fn(&R) -> bool + Send + Sync,
{
    fn validate(&self, record: &R) -> bool {
        self(record)
    }
}

/// Validator that defers to [`Record::is_valid`].
#[derive(Clone, Copy, Debug, Default)]
pub struct RecordValidity;

impl<R: Record> Validator<R> for RecordValidity {
    fn validate(&self, record: &R) -> bool {
        record.is_valid()
    }
}

/// Metrics for a single request handled by the gateway.
#[derive(Clone, Debug, Default, Deserialize, PartialEq, Serialize)]
pub struct RequestMetrics {
    /// Time the request was received, in milliseconds since the Unix epoch.
    #[serde(default)]
    pub timestamp: u64,

    /// Request identifier.
    #[serde(default)]
    pub request_id: String,

    /// Identifier of the API that served the request.
    #[serde(default)]
    pub api_id: Option<String>,

    /// HTTP method of the request.
    #[serde(default)]
    pub http_method: Option<String>,

    /// Request URI.
    #[serde(default)]
    pub uri: Option<String>,

    /// Response status code.
    #[serde(default)]
    pub status: u16,

    /// Total response time, in milliseconds.
    #[serde(default)]
    pub response_time_ms: u64,
}

impl Record for RequestMetrics {
    fn record_type(&self) -> RecordType {
        RecordType::METRICS
    }

    fn is_valid(&self) -> bool {
        let present = |field: &Option<String>| field.as_deref().is_some_and(|value| !value.is_empty());
        present(&self.http_method) && present(&self.uri)
    }
}
