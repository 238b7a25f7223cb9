//! RabbitMQ access for the email worker.
//!
//! Connects, checks the queue passively, applies prefetch = 1 and exposes
//! the ack/reject calls the consumer settles deliveries with. The session
//! lifecycle sits behind [`BrokerSession`] so the worker can run against a
//! fake broker.

use crate::config::WorkerConfig;
use crate::error::{TransportError, WorkerError, WorkerResult};
use async_trait::async_trait;
use futures_util::stream::BoxStream;
use futures_util::StreamExt;
use lapin::message::Delivery;
use lapin::options::{
    BasicAckOptions, BasicConsumeOptions, BasicNackOptions, BasicQosOptions, QueueDeclareOptions,
};
use lapin::types::FieldTable;
use lapin::{Channel, Connection, ConnectionProperties};
use tracing::{debug, info, warn};

/// Unsettled deliveries the broker may hand this consumer at once.
pub const PREFETCH_COUNT: u16 = 1;

/// A message handed to the worker by the broker.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeliveredMessage {
    /// Broker-assigned ordinal used to settle this delivery.
    pub delivery_tag: u64,
    /// Producer identity (`user-id` property).
    pub sender_identity: Option<String>,
    /// Seconds since the epoch, as set by the producer.
    pub timestamp: Option<u64>,
    /// Producer-assigned message id.
    pub message_id: Option<String>,
    /// Whether the broker has delivered this message before.
    pub redelivered: bool,
    /// Raw payload bytes.
    pub body: Vec<u8>,
}

impl From<Delivery> for DeliveredMessage {
    fn from(delivery: Delivery) -> Self {
        let props = &delivery.properties;
        Self {
            delivery_tag: delivery.delivery_tag,
            sender_identity: props.user_id().as_ref().map(|s| s.as_str().to_string()),
            timestamp: *props.timestamp(),
            message_id: props.message_id().as_ref().map(|s| s.as_str().to_string()),
            redelivered: delivery.redelivered,
            body: delivery.data,
        }
    }
}

/// Settlement calls against the channel a delivery arrived on.
///
/// Every call covers exactly one delivery (`multiple = false`).
#[async_trait]
pub trait AckChannel: Send + Sync {
    /// Whether the channel can still carry settlement frames.
    fn is_open(&self) -> bool;

    /// Acknowledge one delivery.
    async fn ack(&self, delivery_tag: u64) -> Result<(), TransportError>;

    /// Reject one delivery without requeue.
    async fn reject(&self, delivery_tag: u64) -> Result<(), TransportError>;
}

/// [`AckChannel`] backed by a lapin channel.
#[derive(Clone)]
pub struct LapinAckChannel {
    channel: Channel,
}

#[async_trait]
impl AckChannel for LapinAckChannel {
    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }

    async fn ack(&self, delivery_tag: u64) -> Result<(), TransportError> {
        self.channel
            .basic_ack(delivery_tag, BasicAckOptions { multiple: false })
            .await
            .map_err(TransportError::from_lapin)
    }

    async fn reject(&self, delivery_tag: u64) -> Result<(), TransportError> {
        self.channel
            .basic_nack(
                delivery_tag,
                BasicNackOptions {
                    multiple: false,
                    requeue: false,
                },
            )
            .await
            .map_err(TransportError::from_lapin)
    }
}

/// Deliveries as they come off the broker, in receipt order.
pub type DeliveryStream = BoxStream<'static, Result<DeliveredMessage, TransportError>>;

/// Lifecycle of one open broker session: consume, settle, close.
#[async_trait]
pub trait BrokerSession: Send + Sync {
    type Channel: AckChannel;

    /// Messages ready in the queue when the session was opened.
    fn message_count(&self) -> u32;

    /// Handle used to settle deliveries from [`BrokerSession::consume`].
    fn ack_channel(&self) -> Self::Channel;

    /// Start consuming with manual acknowledgment.
    async fn consume(&self) -> WorkerResult<DeliveryStream>;

    /// Close the channel. Anything unsettled goes back to the queue.
    async fn close_channel(&self);

    /// Close the connection. Called after [`BrokerSession::close_channel`].
    async fn close_connection(self);
}

/// An open connection and channel bound to the configured queue.
pub struct BrokerConnection {
    connection: Connection,
    channel: Channel,
    config: WorkerConfig,
    message_count: u32,
}

impl BrokerConnection {
    /// Connect, declare the queue passively and apply prefetch.
    ///
    /// Fails if the broker is unreachable or the queue does not exist.
    pub async fn connect(config: WorkerConfig) -> WorkerResult<Self> {
        let uri = config.amqp_uri()?;
        let connection = Connection::connect(&uri, ConnectionProperties::default()).await?;
        debug!(endpoint = %config.redacted_endpoint(), "Connected to RabbitMQ");

        let channel = connection.create_channel().await?;

        // Passive: never create the queue, only check that it exists
        let queue = channel
            .queue_declare(
                &config.queue,
                QueueDeclareOptions {
                    passive: true,
                    ..QueueDeclareOptions::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|source| WorkerError::QueueNotFound {
                queue: config.queue.clone(),
                source,
            })?;

        // prefetch_size is always 0 (unlimited); global = false scopes it per consumer
        channel
            .basic_qos(PREFETCH_COUNT, BasicQosOptions { global: false })
            .await?;

        let message_count = queue.message_count();

        Ok(Self {
            connection,
            channel,
            config,
            message_count,
        })
    }
}

#[async_trait]
impl BrokerSession for BrokerConnection {
    type Channel = LapinAckChannel;

    fn message_count(&self) -> u32 {
        self.message_count
    }

    fn ack_channel(&self) -> LapinAckChannel {
        LapinAckChannel {
            channel: self.channel.clone(),
        }
    }

    async fn consume(&self) -> WorkerResult<DeliveryStream> {
        let consumer = self
            .channel
            .basic_consume(
                &self.config.queue,
                &self.config.consumer_tag,
                BasicConsumeOptions {
                    no_ack: false,
                    ..BasicConsumeOptions::default()
                },
                FieldTable::default(),
            )
            .await?;

        info!(
            queue = %self.config.queue,
            consumer_tag = %self.config.consumer_tag,
            "Consumer registered"
        );

        Ok(consumer
            .map(|item| {
                item.map(DeliveredMessage::from)
                    .map_err(TransportError::from_lapin)
            })
            .boxed())
    }

    async fn close_channel(&self) {
        if self.channel.status().connected() {
            if let Err(e) = self.channel.close(200, "worker shutdown").await {
                warn!(error = %e, "Failed to close channel");
            }
        }
    }

    async fn close_connection(self) {
        if self.connection.status().connected() {
            if let Err(e) = self.connection.close(200, "worker shutdown").await {
                warn!(error = %e, "Failed to close connection");
            }
        }
    }
}
