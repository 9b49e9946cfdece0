//! AMQP 0-9-1 broker connector backed by `lapin`.
//!
//! Messages go to the default exchange with the queue name as routing key,
//! and persistent messages carry `delivery_mode = 2`. The blocking
//! [`BrokerConnector`] drives lapin's futures to completion on the calling
//! thread; with the `tokio` feature the same connector also implements
//! `AsyncBrokerConnector`.

use super::{BrokerChannel, BrokerConnector};
use crate::{config::BrokerSettings, error::TelemetryError};
use futures::executor::block_on;
use lapin::{
    BasicProperties, Channel, Connection, ConnectionProperties,
    options::{BasicPublishOptions, QueueDeclareOptions},
    types::FieldTable,
};

const PERSISTENT: u8 = 2;

/// Opens AMQP connections from [`BrokerSettings`].
#[derive(Debug, Clone, Default)]
pub struct AmqpConnector {
    connection_name: Option<String>,
}

impl AmqpConnector {
    /// Sets the client-provided connection name shown in the broker's management UI.
    #[must_use]
    pub fn connection_name(mut self, name: &str) -> Self {
        self.connection_name = Some(name.to_string());
        self
    }

    fn properties(&self) -> ConnectionProperties {
        let properties = ConnectionProperties::default();
        match &self.connection_name {
            Some(name) => properties.with_connection_name(name.clone().into()),
            None => properties,
        }
    }

    async fn open(&self, settings: &BrokerSettings) -> Result<AmqpChannel, TelemetryError> {
        let connection = Connection::connect(&settings.amqp_uri(), self.properties()).await?;
        let channel = connection.create_channel().await?;
        Ok(AmqpChannel {
            connection,
            channel,
        })
    }
}

/// One AMQP connection with a single channel on it.
pub struct AmqpChannel {
    connection: Connection,
    channel: Channel,
}

impl AmqpChannel {
    async fn declare(&self, queue: &str, durable: bool) -> Result<(), TelemetryError> {
        let options = QueueDeclareOptions {
            durable,
            ..QueueDeclareOptions::default()
        };
        self.channel
            .queue_declare(queue, options, FieldTable::default())
            .await?;
        Ok(())
    }

    async fn publish_message(
        &self,
        queue: &str,
        body: &[u8],
        persistent: bool,
    ) -> Result<(), TelemetryError> {
        let properties = if persistent {
            BasicProperties::default().with_delivery_mode(PERSISTENT)
        } else {
            BasicProperties::default()
        };
        self.channel
            .basic_publish("", queue, BasicPublishOptions::default(), body, properties)
            .await?
            .await?;
        Ok(())
    }

    fn connected(&self) -> bool {
        self.connection.status().connected() && self.channel.status().connected()
    }

    async fn shutdown(&self) -> Result<(), TelemetryError> {
        if self.connection.status().connected() {
            self.connection.close(200, "closing").await?;
        }
        Ok(())
    }
}

impl BrokerConnector for AmqpConnector {
    type Channel = AmqpChannel;

    fn connect(&self, settings: &BrokerSettings) -> Result<AmqpChannel, TelemetryError> {
        block_on(self.open(settings))
    }
}

impl BrokerChannel for AmqpChannel {
    fn declare_queue(&mut self, queue: &str, durable: bool) -> Result<(), TelemetryError> {
        block_on(self.declare(queue, durable))
    }

    fn publish(
        &mut self,
        queue: &str,
        body: &[u8],
        persistent: bool,
    ) -> Result<(), TelemetryError> {
        block_on(self.publish_message(queue, body, persistent))
    }

    fn is_open(&self) -> bool {
        self.connected()
    }

    fn close(&mut self) -> Result<(), TelemetryError> {
        block_on(self.shutdown())
    }
}

#[cfg(feature = "tokio")]
mod nonblocking {
    use super::{AmqpChannel, AmqpConnector};
    use crate::{
        config::BrokerSettings,
        error::TelemetryError,
        transport::{AsyncBrokerChannel, AsyncBrokerConnector},
    };
    use async_trait::async_trait;

    #[async_trait]
    impl AsyncBrokerConnector for AmqpConnector {
        type Channel = AmqpChannel;

        async fn connect(&self, settings: &BrokerSettings) -> Result<AmqpChannel, TelemetryError> {
            self.open(settings).await
        }
    }

    #[async_trait]
    impl AsyncBrokerChannel for AmqpChannel {
        async fn declare_queue(
            &mut self,
            queue: &str,
            durable: bool,
        ) -> Result<(), TelemetryError> {
            self.declare(queue, durable).await
        }

        async fn publish(
            &mut self,
            queue: &str,
            body: &[u8],
            persistent: bool,
        ) -> Result<(), TelemetryError> {
            self.publish_message(queue, body, persistent).await
        }

        fn is_open(&self) -> bool {
            self.connected()
        }

        async fn close(&mut self) -> Result<(), TelemetryError> {
            self.shutdown().await
        }
    }
}
