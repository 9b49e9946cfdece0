#![warn(clippy::pedantic, clippy::nursery, clippy::cargo, clippy::perf)]

//! # `apm_relay`
//!
//! Function-level application performance monitoring and log shipping.
//!
//! An [`Instrumentor`] wraps calls and, for each one, ships a metric record
//! with its wall-clock time, CPU time and resident memory delta. A
//! [`TelemetryLogger`] plugs into the `log` facade and ships every enabled
//! log event as a log record. Both hand their records to a [`Transport`]:
//!
//! - [`ReliableQueueTransport`] publishes persistent messages to a durable
//!   queue on an AMQP broker.
//! - [`UnreliableDatagramTransport`] sends one UDP packet per record.
//!
//! Shipping never changes the behaviour of the instrumented code: results,
//! errors and panics pass through untouched and delivery failures are only
//! logged and counted through the `metrics` facade.
//!
//! ## Features
//!
//! - `tokio`: async instrumentor, async transports and a channel-backed logger.
//!   Requires a Tokio runtime.
//! - `amqp`: `transport::amqp::AmqpConnector`, a broker connector backed by
//!   `lapin`. Without it, bring your own [`BrokerConnector`].
//!
//! ```toml
//! [dependencies]
//! apm_relay = { version = "...", features = ["tokio", "amqp"] }
//! ```
//!
//! See README for details.

mod builder;
mod config;
mod error;
mod events;
mod instrument;
mod logger;
mod probe;
pub mod transport;

pub use builder::{Capture, LogFields, Measurement, RecordBuilder, TIMESTAMP_FORMAT};
pub use config::{
    BrokerSettings, DEFAULT_SERVER_NAME, DatagramSettings, LOGS_QUEUE, METRICS_QUEUE, MemoryFloor,
};
pub use error::TelemetryError;
pub use events::{LogRecord, MetricRecord, Record, RecordKind};
pub use instrument::{CallSite, Instrumentor};
pub use logger::TelemetryLogger;
pub use probe::{ProcessCpuTime, ProcessProbe, Snapshot, SystemCpuPercent};
pub use transport::{
    BrokerChannel, BrokerConnector, ConnectionPool, ReliableQueueTransport, Transport,
    UnreliableDatagramTransport, dispatch,
};

#[cfg(feature = "tokio")]
pub use instrument::AsyncInstrumentor;
#[cfg(feature = "tokio")]
pub use logger::AsyncTelemetryLogger;
#[cfg(feature = "tokio")]
pub use transport::{
    AsyncBrokerChannel, AsyncBrokerConnector, AsyncReliableQueueTransport, AsyncTransport,
    dispatch_async,
};
