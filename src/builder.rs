use crate::{
    config::MemoryFloor,
    events::{LogRecord, MetricRecord},
    instrument::CallSite,
    probe::Snapshot,
};
use chrono::{DateTime, Local};
use std::time::Duration;
use uuid::Uuid;

/// Timestamp layout shared by every record and transport.
pub const TIMESTAMP_FORMAT: &str = "%Y-%m-%d %H:%M:%S%.6f";

/// Identity minted at capture time: correlation id and creation timestamp.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Capture {
    pub id: Uuid,
    pub created_at: DateTime<Local>,
}

impl Capture {
    #[must_use]
    pub fn now() -> Self {
        Self {
            id: Uuid::new_v4(),
            created_at: Local::now(),
        }
    }

    fn created_dt(&self) -> String {
        self.created_at.format(TIMESTAMP_FORMAT).to_string()
    }

    #[allow(clippy::cast_precision_loss)]
    fn epoch_seconds(&self) -> f64 {
        self.created_at.timestamp_micros() as f64 / 1_000_000.0
    }

    fn millis_fraction(&self) -> f64 {
        f64::from(self.created_at.timestamp_subsec_micros()) / 1_000.0
    }
}

/// Raw readings taken around one call.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Measurement {
    pub elapsed: Duration,
    pub start: Snapshot,
    pub end: Snapshot,
}

/// Structured fields of one log event, detached from the logging framework.
#[derive(Debug, Clone)]
pub struct LogFields<'a> {
    pub message: String,
    /// The format string when it is static, otherwise `None`.
    pub raw: Option<&'a str>,
    pub level: log::Level,
    pub target: &'a str,
    pub module: Option<&'a str>,
    pub file: Option<&'a str>,
    pub line: Option<u32>,
    pub exception: Option<String>,
    pub stack: Option<String>,
    /// Time since the logging backend started.
    pub since_start: Duration,
    pub process: u32,
    pub process_name: &'a str,
    pub thread: String,
    pub thread_name: &'a str,
}

/// Turns measurements and identity into records. Performs no I/O.
#[derive(Debug, Clone)]
pub struct RecordBuilder {
    server_name: String,
    memory_floor: MemoryFloor,
}

impl RecordBuilder {
    #[must_use]
    pub fn new(server_name: &str, memory_floor: MemoryFloor) -> Self {
        Self {
            server_name: server_name.to_string(),
            memory_floor,
        }
    }

    #[must_use]
    pub fn server_name(&self) -> &str {
        &self.server_name
    }

    #[must_use]
    pub const fn memory_floor(&self) -> MemoryFloor {
        self.memory_floor
    }

    #[must_use]
    pub fn metric(&self, capture: &Capture, site: &CallSite, m: &Measurement) -> MetricRecord {
        // getrusage and /proc sampling can step backwards by a tick
        let cpu_used = (m.end.cpu_seconds - m.start.cpu_seconds).max(0.0);
        let ram_used = m
            .end
            .resident_bytes
            .saturating_sub(m.start.resident_bytes)
            .max(self.memory_floor.bytes());

        MetricRecord {
            uuid: capture.id,
            created_dt: capture.created_dt(),
            func_path: site.path().to_string(),
            func_name: site.name().to_string(),
            exec_time: m.elapsed.as_secs_f64(),
            cpu_used,
            ram_used,
            server_name: self.server_name.clone(),
        }
    }

    #[must_use]
    pub fn log(&self, capture: &Capture, fields: &LogFields<'_>) -> LogRecord {
        let (levelname, levelno) = level_names(fields.level);
        let pathname = fields.file.unwrap_or_default();
        let filename = pathname
            .rsplit(['/', '\\'])
            .next()
            .unwrap_or_default()
            .to_string();
        let func_name = fields
            .target
            .rsplit("::")
            .next()
            .unwrap_or(fields.target)
            .to_string();

        LogRecord {
            uuid: capture.id,
            created_dt: capture.created_dt(),
            created: capture.epoch_seconds(),
            msecs: capture.millis_fraction(),
            relative_created: fields.since_start.as_secs_f64() * 1_000.0,
            pathname: pathname.to_string(),
            filename,
            module: fields.module.unwrap_or(fields.target).to_string(),
            func_name,
            lineno: fields.line.unwrap_or(0),
            message: fields.message.clone(),
            msg: fields.raw.map_or_else(|| fields.message.clone(), str::to_string),
            levelname: levelname.to_string(),
            levelno,
            name: fields.target.to_string(),
            process: fields.process,
            process_name: fields.process_name.to_string(),
            thread: fields.thread.clone(),
            thread_name: fields.thread_name.to_string(),
            exc_text: fields.exception.clone().unwrap_or_default(),
            stack_info: fields.stack.clone(),
            server_name: self.server_name.clone(),
        }
    }
}

/// Level names and numbers on the collector's scale.
const fn level_names(level: log::Level) -> (&'static str, u8) {
    match level {
        log::Level::Error => ("ERROR", 40),
        log::Level::Warn => ("WARNING", 30),
        log::Level::Info => ("INFO", 20),
        log::Level::Debug => ("DEBUG", 10),
        log::Level::Trace => ("TRACE", 5),
    }
}
