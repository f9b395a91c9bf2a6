//! Broker client seam.
//!
//! The supervisor, publisher and dispatch loop only talk to these traits. The
//! [`crate::amqp`] module implements them over a real AMQP 0-9-1 connection,
//! [`crate::memory`] implements them in-process for tests.

use std::{fmt, sync::Arc};

use async_trait::async_trait;
use futures::stream::BoxStream;
use tokio::sync::mpsc;

use crate::error::Result;
use crate::topology::{Binding, ExchangeSpec, QueueSpec};

pub const CONTENT_TYPE_JSON: &str = "application/json";
pub const DELIVERY_MODE_PERSISTENT: u8 = 2;

/// Lifecycle notifications raised by the broker client.
///
/// `connection_id` and `generation` let the supervisor ignore notifications
/// from links it has already replaced.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkEvent {
    ConnectionClosed { connection_id: u64, reason: String },
    ChannelClosed { generation: u64, reason: String },
    ConsumerCancelled { generation: u64 },
}

pub type LinkEvents = mpsc::UnboundedSender<LinkEvent>;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MessageProperties {
    pub content_type: String,
    pub delivery_mode: u8,
    pub message_id: Option<String>,
    pub event_type: Option<String>,
    /// Epoch seconds.
    pub timestamp: Option<u64>,
}

impl Default for MessageProperties {
    fn default() -> Self {
        Self {
            content_type: CONTENT_TYPE_JSON.to_string(),
            delivery_mode: DELIVERY_MODE_PERSISTENT,
            message_id: None,
            event_type: None,
            timestamp: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutgoingMessage {
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub properties: MessageProperties,
}

/// Opens connections. One call per connect or reconnect attempt.
#[async_trait]
pub trait Connector: Send + Sync + 'static {
    async fn connect(
        &self,
        uri: &str,
        connection_id: u64,
        events: LinkEvents,
    ) -> Result<Arc<dyn BrokerConnection>>;
}

#[async_trait]
pub trait BrokerConnection: Send + Sync + 'static {
    async fn open_channel(&self, generation: u64, events: LinkEvents) -> Result<Arc<dyn BrokerChannel>>;

    fn is_open(&self) -> bool;

    async fn close(&self) -> Result<()>;
}

#[async_trait]
pub trait BrokerChannel: Send + Sync + 'static {
    async fn declare_exchange(&self, exchange: &ExchangeSpec) -> Result<()>;

    async fn declare_queue(&self, queue: &QueueSpec) -> Result<()>;

    async fn bind_queue(&self, binding: &Binding) -> Result<()>;

    /// Per-consumer unacknowledged delivery limit.
    async fn set_prefetch(&self, prefetch: u16) -> Result<()>;

    /// Hand the message to the broker. Does not wait for a publisher confirm.
    async fn publish(&self, message: OutgoingMessage) -> Result<()>;

    /// Start a manual-ack consumer on `queue`.
    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream>;

    fn is_open(&self) -> bool;

    async fn close(&self) -> Result<()>;
}

/// Settles one delivery on the channel it arrived on.
#[async_trait]
pub trait Acknowledger: Send + Sync + 'static {
    async fn ack(&self) -> Result<()>;

    async fn reject(&self, requeue: bool) -> Result<()>;
}

pub type DeliveryStream = BoxStream<'static, Result<Delivery>>;

/// A message handed to this service by the broker.
///
/// Settling consumes the delivery, so each one is acked or rejected at most
/// once.
pub struct Delivery {
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub redelivered: bool,
    pub message_id: Option<String>,
    /// Broker-maintained redelivery count (`x-delivery-count`), when present.
    pub delivery_count: Option<u32>,
    acker: Box<dyn Acknowledger>,
}

impl Delivery {
    pub fn new(
        exchange: impl Into<String>,
        routing_key: impl Into<String>,
        body: Vec<u8>,
        acker: Box<dyn Acknowledger>,
    ) -> Self {
        Self {
            exchange: exchange.into(),
            routing_key: routing_key.into(),
            body,
            redelivered: false,
            message_id: None,
            delivery_count: None,
            acker,
        }
    }

    pub fn with_redelivered(mut self, redelivered: bool) -> Self {
        self.redelivered = redelivered;
        self
    }

    pub fn with_message_id(mut self, message_id: Option<String>) -> Self {
        self.message_id = message_id;
        self
    }

    pub fn with_delivery_count(mut self, count: Option<u32>) -> Self {
        self.delivery_count = count;
        self
    }

    pub async fn ack(self) -> Result<()> {
        self.acker.ack().await
    }

    pub async fn reject(self, requeue: bool) -> Result<()> {
        self.acker.reject(requeue).await
    }
}

impl fmt::Debug for Delivery {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Delivery")
            .field("exchange", &self.exchange)
            .field("routing_key", &self.routing_key)
            .field("body_len", &self.body.len())
            .field("redelivered", &self.redelivered)
            .field("message_id", &self.message_id)
            .field("delivery_count", &self.delivery_count)
            .finish_non_exhaustive()
    }
}
