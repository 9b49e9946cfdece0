//! Delivery of serialized records to a collector.
//!
//! A [`Transport`] turns a [`Record`] into bytes once ([`Transport::frame`])
//! and ships those bytes with [`Transport::send`]. Two families exist:
//!
//! - [`ReliableQueueTransport`]: publishes persistent messages to a durable
//!   broker queue, one channel per worker thread, reconnecting after failures.
//! - [`UnreliableDatagramTransport`]: one UDP packet per record, no
//!   confirmation, no retry.
//!
//! The broker itself is reached through [`BrokerConnector`] and
//! [`BrokerChannel`], so any AMQP client (or an in-memory fake) can back the
//! reliable transport. With the `amqp` feature, `AmqpConnector` provides a
//! `lapin` implementation.

use crate::{
    config::{BrokerSettings, DEFAULT_SERVER_NAME},
    error::TelemetryError,
    events::Record,
};

pub mod broker;
pub mod datagram;

#[cfg(feature = "amqp")]
pub mod amqp;

pub use broker::{ConnectionPool, ReliableQueueTransport};
pub use datagram::UnreliableDatagramTransport;

#[cfg(feature = "tokio")]
pub use broker::AsyncReliableQueueTransport;

const RECORDS_SENT: &str = "apm_relay_records_sent_total";
const DISPATCH_FAILURES: &str = "apm_relay_dispatch_failures_total";
const BROKER_CONNECTS: &str = "apm_relay_broker_connects_total";

/// A delivery mechanism for records.
pub trait Transport: Send + Sync {
    /// Short label used in diagnostics and metric labels.
    fn name(&self) -> &'static str;

    /// Label stamped on records shipped through this transport, taken from its settings.
    fn server_name(&self) -> &str {
        DEFAULT_SERVER_NAME
    }

    /// Prepares the transport for the calling worker. Calling it again is a no-op
    /// while the existing connection is alive.
    ///
    /// # Errors
    /// Returns an error if the underlying connection cannot be established.
    fn connect(&self) -> Result<(), TelemetryError>;

    /// Serializes a record into the payload this transport puts on the wire.
    ///
    /// # Errors
    /// Returns an error if the record cannot be serialized.
    fn frame(&self, record: &Record) -> Result<Vec<u8>, TelemetryError> {
        record.to_body()
    }

    /// Ships one payload.
    ///
    /// # Errors
    /// Returns an error if the payload could not be handed to the network.
    fn send(&self, payload: &[u8]) -> Result<(), TelemetryError>;

    /// Releases every connection or socket held by the transport.
    ///
    /// # Errors
    /// Returns the first error raised while closing connections.
    fn close(&self) -> Result<(), TelemetryError>;
}

/// One open channel to a message broker.
pub trait BrokerChannel: Send + 'static {
    /// Declares `queue`, creating it if needed.
    ///
    /// # Errors
    /// Returns an error if the broker rejects the declaration.
    fn declare_queue(&mut self, queue: &str, durable: bool) -> Result<(), TelemetryError>;

    /// Publishes `body` on the default exchange with `queue` as routing key.
    ///
    /// # Errors
    /// Returns an error if the broker did not accept the message.
    fn publish(&mut self, queue: &str, body: &[u8], persistent: bool)
    -> Result<(), TelemetryError>;

    fn is_open(&self) -> bool;

    /// # Errors
    /// Returns an error if the connection could not be closed cleanly.
    fn close(&mut self) -> Result<(), TelemetryError>;
}

/// Opens [`BrokerChannel`]s.
pub trait BrokerConnector: Send + Sync {
    type Channel: BrokerChannel;

    /// # Errors
    /// Returns an error if the broker is unreachable or refuses the credentials.
    fn connect(&self, settings: &BrokerSettings) -> Result<Self::Channel, TelemetryError>;
}

/// Frames and sends `record` through `transport`, counting the outcome.
///
/// # Errors
/// Returns the serialization or transport error; callers on the
/// instrumentation path log it and carry on.
pub fn dispatch(transport: &dyn Transport, record: &Record) -> Result<(), TelemetryError> {
    let payload = transport.frame(record)?;
    let result = transport.send(&payload);
    count_outcome(transport.name(), &result);
    result
}

fn count_outcome(transport: &'static str, result: &Result<(), TelemetryError>) {
    if result.is_ok() {
        metrics::counter!(RECORDS_SENT, "transport" => transport).increment(1);
    } else {
        metrics::counter!(DISPATCH_FAILURES, "transport" => transport).increment(1);
    }
}

#[cfg(feature = "tokio")]
pub use self::nonblocking::{
    AsyncBrokerChannel, AsyncBrokerConnector, AsyncTransport, dispatch_async,
};

#[cfg(feature = "tokio")]
mod nonblocking {
    use super::count_outcome;
    use crate::{
        config::{BrokerSettings, DEFAULT_SERVER_NAME},
        error::TelemetryError,
        events::Record,
    };
    use async_trait::async_trait;

    /// Async counterpart of [`super::Transport`] for cooperative schedulers.
    #[async_trait]
    pub trait AsyncTransport: Send + Sync {
        fn name(&self) -> &'static str;

        fn server_name(&self) -> &str {
            DEFAULT_SERVER_NAME
        }

        async fn connect(&self) -> Result<(), TelemetryError>;

        fn frame(&self, record: &Record) -> Result<Vec<u8>, TelemetryError> {
            record.to_body()
        }

        async fn send(&self, payload: &[u8]) -> Result<(), TelemetryError>;

        async fn close(&self) -> Result<(), TelemetryError>;
    }

    /// Async counterpart of [`super::BrokerChannel`].
    #[async_trait]
    pub trait AsyncBrokerChannel: Send + Sync {
        async fn declare_queue(&mut self, queue: &str, durable: bool)
        -> Result<(), TelemetryError>;

        async fn publish(
            &mut self,
            queue: &str,
            body: &[u8],
            persistent: bool,
        ) -> Result<(), TelemetryError>;

        fn is_open(&self) -> bool;

        async fn close(&mut self) -> Result<(), TelemetryError>;
    }

    /// Async counterpart of [`super::BrokerConnector`].
    #[async_trait]
    pub trait AsyncBrokerConnector: Send + Sync {
        type Channel: AsyncBrokerChannel;

        async fn connect(&self, settings: &BrokerSettings)
        -> Result<Self::Channel, TelemetryError>;
    }

    /// Frames and sends `record`, awaiting the transport.
    ///
    /// # Errors
    /// Returns the serialization or transport error.
    pub async fn dispatch_async(
        transport: &dyn AsyncTransport,
        record: &Record,
    ) -> Result<(), TelemetryError> {
        let payload = transport.frame(record)?;
        let result = transport.send(&payload).await;
        count_outcome(transport.name(), &result);
        result
    }

    pub(crate) async fn send_counted(
        transport: &dyn AsyncTransport,
        payload: &[u8],
    ) -> Result<(), TelemetryError> {
        let result = transport.send(payload).await;
        count_outcome(transport.name(), &result);
        result
    }
}

#[cfg(feature = "tokio")]
pub(crate) use self::nonblocking::send_counted;
