use crate::error::TelemetryError;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Discriminates the two record shapes on the wire.
///
/// The lowercase names double as the default broker queue names.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "lowercase")]
pub enum RecordKind {
    Apm,
    Logs,
}

impl RecordKind {
    #[must_use]
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::Apm => "apm",
            Self::Logs => "logs",
        }
    }
}

/// Resource usage of one instrumented call.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct MetricRecord {
    pub uuid: Uuid,
    pub created_dt: String,
    pub func_path: String,
    pub func_name: String,
    /// Wall time in seconds.
    pub exec_time: f64,
    pub cpu_used: f64,
    /// Resident memory delta in bytes.
    pub ram_used: u64,
    pub server_name: String,
}

/// One event from the host logger.
///
/// Field names follow the collector's log schema, which predates this crate.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct LogRecord {
    pub uuid: Uuid,
    pub created_dt: String,
    /// Creation time in seconds since the Unix epoch.
    pub created: f64,
    /// Millisecond part of `created`.
    pub msecs: f64,
    /// Milliseconds since the logging backend started.
    #[serde(rename = "relativeCreated")]
    pub relative_created: f64,
    pub pathname: String,
    pub filename: String,
    pub module: String,
    #[serde(rename = "funcName")]
    pub func_name: String,
    pub lineno: u32,
    pub message: String,
    pub msg: String,
    pub levelname: String,
    pub levelno: u8,
    pub name: String,
    pub process: u32,
    #[serde(rename = "processName")]
    pub process_name: String,
    pub thread: String,
    #[serde(rename = "threadName")]
    pub thread_name: String,
    pub exc_text: String,
    pub stack_info: Option<String>,
    pub server_name: String,
}

/// A record together with its kind, serialized as `{"kind": ..., "record": ...}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "kind", content = "record")]
pub enum Record {
    #[serde(rename = "apm")]
    Metric(MetricRecord),
    #[serde(rename = "logs")]
    Log(LogRecord),
}

impl Record {
    #[must_use]
    pub const fn kind(&self) -> RecordKind {
        match self {
            Self::Metric(_) => RecordKind::Apm,
            Self::Log(_) => RecordKind::Logs,
        }
    }

    #[must_use]
    pub const fn uuid(&self) -> Uuid {
        match self {
            Self::Metric(m) => m.uuid,
            Self::Log(l) => l.uuid,
        }
    }

    /// Serializes the bare inner record, as published on a broker queue.
    ///
    /// # Errors
    /// Returns an error if the record cannot be serialized.
    pub fn to_body(&self) -> Result<Vec<u8>, TelemetryError> {
        match self {
            Self::Metric(m) => serde_json::to_vec(m),
            Self::Log(l) => serde_json::to_vec(l),
        }
        .map_err(TelemetryError::from)
    }

    /// Serializes the record wrapped in its kind envelope, as sent in a datagram.
    ///
    /// # Errors
    /// Returns an error if the record cannot be serialized.
    pub fn to_envelope(&self) -> Result<Vec<u8>, TelemetryError> {
        serde_json::to_vec(self).map_err(TelemetryError::from)
    }

    /// Decodes an envelope produced by [`Record::to_envelope`].
    ///
    /// # Errors
    /// Returns an error if the bytes are not a valid envelope.
    pub fn from_envelope(buffer: &[u8]) -> Result<Self, TelemetryError> {
        serde_json::from_slice(buffer).map_err(TelemetryError::from)
    }

    /// Decodes a bare body taken from the queue named after `kind`.
    ///
    /// # Errors
    /// Returns an error if the bytes do not match the record shape for `kind`.
    pub fn from_body(kind: RecordKind, buffer: &[u8]) -> Result<Self, TelemetryError> {
        match kind {
            RecordKind::Apm => serde_json::from_slice(buffer).map(Self::Metric),
            RecordKind::Logs => serde_json::from_slice(buffer).map(Self::Log),
        }
        .map_err(TelemetryError::from)
    }
}

impl From<MetricRecord> for Record {
    fn from(record: MetricRecord) -> Self {
        Self::Metric(record)
    }
}

impl From<LogRecord> for Record {
    fn from(record: LogRecord) -> Self {
        Self::Log(record)
    }
}

impl TryFrom<&[u8]> for Record {
    type Error = TelemetryError;

    fn try_from(buffer: &[u8]) -> Result<Self, Self::Error> {
        Self::from_envelope(buffer)
    }
}

impl TryFrom<&Record> for Vec<u8> {
    type Error = TelemetryError;

    fn try_from(record: &Record) -> Result<Self, Self::Error> {
        record.to_envelope()
    }
}
