//! Narrow contract the bus client needs from a topic-based broker.
//!
//! Mirrors the AMQP 0-9-1 surface: connections own channels, channels declare
//! exchanges and queues, bind them, publish, consume, and acknowledge. The
//! broker itself is an external collaborator; tests drive the client through
//! an in-process implementation of this contract.

use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use tokio::sync::mpsc;

/// Exchange routing behaviour.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ExchangeKind {
    Direct,
    #[default]
    Topic,
    Fanout,
}

impl ExchangeKind {
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Direct => "direct",
            Self::Topic => "topic",
            Self::Fanout => "fanout",
        }
    }
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ExchangeKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "direct" => Ok(Self::Direct),
            "topic" => Ok(Self::Topic),
            "fanout" => Ok(Self::Fanout),
            other => Err(format!("unknown exchange kind `{other}`")),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ExchangeOptions {
    pub durable: bool,
}

impl Default for ExchangeOptions {
    fn default() -> Self {
        Self { durable: true }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct QueueOptions {
    pub durable: bool,
    /// Owned by the declaring connection and deleted when it closes.
    pub exclusive: bool,
    /// Deleted once its last consumer is cancelled.
    pub auto_delete: bool,
}

impl QueueOptions {
    #[must_use]
    pub fn durable() -> Self {
        Self {
            durable: true,
            ..Self::default()
        }
    }

    /// Private, connection-scoped queue (reply destinations).
    #[must_use]
    pub fn private() -> Self {
        Self {
            durable: false,
            exclusive: true,
            auto_delete: true,
        }
    }
}

/// Per-message properties carried alongside the body.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct MessageProperties {
    pub message_id: Option<String>,
    pub correlation_id: Option<String>,
    pub reply_to: Option<String>,
    pub content_type: Option<String>,
    pub persistent: bool,
    pub headers: BTreeMap<String, String>,
}

/// A message handed to a consumer. Must be acked or nacked on the channel that
/// delivered it.
#[derive(Debug, Clone)]
pub struct Delivery {
    pub delivery_tag: u64,
    pub exchange: String,
    pub routing_key: String,
    pub redelivered: bool,
    pub body: Bytes,
    pub properties: MessageProperties,
}

/// An active subscription. The delivery stream ends when the consumer is
/// cancelled or its channel closes.
#[derive(Debug)]
pub struct Consumer {
    pub tag: String,
    pub deliveries: mpsc::UnboundedReceiver<Delivery>,
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum BrokerError {
    #[error("failed to connect to broker: {0}")]
    ConnectFailed(String),
    #[error("connection closed")]
    ConnectionClosed,
    #[error("channel closed")]
    ChannelClosed,
    #[error("exchange `{0}` not found")]
    ExchangeNotFound(String),
    #[error("queue `{0}` not found")]
    QueueNotFound(String),
    #[error("queue `{0}` is exclusive to another connection")]
    ResourceLocked(String),
    #[error("unknown delivery tag {0}")]
    UnknownDeliveryTag(u64),
    #[error("unknown consumer `{0}`")]
    UnknownConsumer(String),
}

#[async_trait]
pub trait BrokerConnector: Send + Sync {
    async fn connect(&self, uri: &str) -> Result<Arc<dyn BrokerConnection>, BrokerError>;
}

#[async_trait]
pub trait BrokerConnection: Send + Sync {
    async fn create_channel(&self) -> Result<Arc<dyn BrokerChannel>, BrokerError>;

    /// Resolves once the connection is closed, whichever side closed it.
    async fn closed(&self);

    fn is_open(&self) -> bool;

    /// Closes the connection and every channel on it.
    async fn close(&self) -> Result<(), BrokerError>;
}

#[async_trait]
pub trait BrokerChannel: Send + Sync {
    async fn assert_exchange(
        &self,
        name: &str,
        kind: ExchangeKind,
        options: ExchangeOptions,
    ) -> Result<(), BrokerError>;

    /// Declares a queue and returns its name. An empty `name` asks the broker
    /// to generate one.
    async fn assert_queue(&self, name: &str, options: QueueOptions) -> Result<String, BrokerError>;

    async fn bind_queue(&self, queue: &str, exchange: &str, routing_key: &str)
        -> Result<(), BrokerError>;

    async fn unbind_queue(
        &self,
        queue: &str,
        exchange: &str,
        routing_key: &str,
    ) -> Result<(), BrokerError>;

    /// Publishes a message. `Ok(false)` means the message was accepted but the
    /// broker is applying backpressure; wait on [`wait_writable`](Self::wait_writable)
    /// before treating the publish as complete. The empty exchange routes
    /// directly to the queue named by `routing_key`.
    async fn publish(
        &self,
        exchange: &str,
        routing_key: &str,
        body: Bytes,
        properties: MessageProperties,
    ) -> Result<bool, BrokerError>;

    /// Resolves once the channel accepts writes without backpressure.
    async fn wait_writable(&self) -> Result<(), BrokerError>;

    /// Caps unacknowledged deliveries across this channel's consumers.
    /// Zero means unlimited.
    async fn prefetch(&self, count: u16) -> Result<(), BrokerError>;

    async fn consume(&self, queue: &str) -> Result<Consumer, BrokerError>;

    async fn cancel(&self, consumer_tag: &str) -> Result<(), BrokerError>;

    async fn ack(&self, delivery_tag: u64) -> Result<(), BrokerError>;

    async fn nack(&self, delivery_tag: u64, requeue: bool) -> Result<(), BrokerError>;

    /// Closes the channel; its unacknowledged deliveries are requeued.
    async fn close(&self) -> Result<(), BrokerError>;
}
