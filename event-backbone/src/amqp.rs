//! AMQP 0-9-1 client over `lapin`.

use std::sync::Arc;

use async_trait::async_trait;
use futures::StreamExt;
use lapin::{
    acker::Acker,
    options::{
        BasicAckOptions, BasicConsumeOptions, BasicPublishOptions, BasicQosOptions, BasicRejectOptions,
        ExchangeDeclareOptions, QueueBindOptions, QueueDeclareOptions,
    },
    protocol::{AMQPErrorKind, AMQPSoftError},
    types::{AMQPValue, FieldTable, LongString, ShortString},
    BasicProperties, Channel, Connection, ConnectionProperties,
};
use tracing::{debug, warn};

use crate::broker::{
    Acknowledger, BrokerChannel, BrokerConnection, Connector, Delivery, DeliveryStream, LinkEvent, LinkEvents,
    OutgoingMessage,
};
use crate::error::{EventBusError, Result};
use crate::topology::{Binding, ExchangeKind, ExchangeSpec, QueueSpec};

const DEAD_LETTER_EXCHANGE_ARG: &str = "x-dead-letter-exchange";
const DELIVERY_COUNT_HEADER: &str = "x-delivery-count";
const REPLY_SUCCESS: u16 = 200;

/// Dials a RabbitMQ (or other AMQP 0-9-1) broker.
#[derive(Debug, Clone)]
pub struct AmqpConnector {
    connection_name: String,
}

impl AmqpConnector {
    /// `connection_name` shows up in the broker's management UI.
    pub fn new(connection_name: impl Into<String>) -> Self {
        Self { connection_name: connection_name.into() }
    }
}

#[async_trait]
impl Connector for AmqpConnector {
    async fn connect(&self, uri: &str, connection_id: u64, events: LinkEvents) -> Result<Arc<dyn BrokerConnection>> {
        let properties =
            ConnectionProperties::default().with_connection_name(LongString::from(self.connection_name.clone()));
        let connection = Connection::connect(uri, properties)
            .await
            .map_err(|err| EventBusError::Connection(err.to_string()))?;

        connection.on_error(move |err| {
            warn!(connection_id, error = %err, "AMQP connection error");
            if events.send(LinkEvent::ConnectionClosed { connection_id, reason: err.to_string() }).is_err() {
                debug!(connection_id, "Connection error after supervisor exit");
            }
        });
        debug!(connection_id, name = %self.connection_name, "AMQP connection established");

        Ok(Arc::new(AmqpConnection { connection }))
    }
}

struct AmqpConnection {
    connection: Connection,
}

#[async_trait]
impl BrokerConnection for AmqpConnection {
    async fn open_channel(&self, generation: u64, events: LinkEvents) -> Result<Arc<dyn BrokerChannel>> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|err| EventBusError::Connection(err.to_string()))?;

        channel.on_error(move |err| {
            warn!(generation, error = %err, "AMQP channel error");
            if events.send(LinkEvent::ChannelClosed { generation, reason: err.to_string() }).is_err() {
                debug!(generation, "Channel error after supervisor exit");
            }
        });
        Ok(Arc::new(AmqpChannel { channel }))
    }

    fn is_open(&self) -> bool {
        self.connection.status().connected()
    }

    async fn close(&self) -> Result<()> {
        if !self.is_open() {
            return Ok(());
        }
        self.connection
            .close(REPLY_SUCCESS, "shutdown")
            .await
            .map_err(|err| EventBusError::Connection(err.to_string()))
    }
}

struct AmqpChannel {
    channel: Channel,
}

#[async_trait]
impl BrokerChannel for AmqpChannel {
    async fn declare_exchange(&self, exchange: &ExchangeSpec) -> Result<()> {
        let kind = match exchange.kind {
            ExchangeKind::Topic => lapin::ExchangeKind::Topic,
            ExchangeKind::Direct => lapin::ExchangeKind::Direct,
            ExchangeKind::Fanout => lapin::ExchangeKind::Fanout,
        };
        let options = ExchangeDeclareOptions { durable: exchange.durable, ..ExchangeDeclareOptions::default() };
        self.channel
            .exchange_declare(&exchange.name, kind, options, FieldTable::default())
            .await
            .map_err(declaration_error)
    }

    async fn declare_queue(&self, queue: &QueueSpec) -> Result<()> {
        let mut arguments = FieldTable::default();
        if let Some(dlx) = &queue.dead_letter_exchange {
            arguments.insert(
                ShortString::from(DEAD_LETTER_EXCHANGE_ARG),
                AMQPValue::LongString(LongString::from(dlx.clone())),
            );
        }
        let options = QueueDeclareOptions { durable: queue.durable, ..QueueDeclareOptions::default() };
        self.channel
            .queue_declare(&queue.name, options, arguments)
            .await
            .map(|_| ())
            .map_err(declaration_error)
    }

    async fn bind_queue(&self, binding: &Binding) -> Result<()> {
        self.channel
            .queue_bind(
                &binding.queue,
                &binding.exchange,
                &binding.routing_key,
                QueueBindOptions::default(),
                FieldTable::default(),
            )
            .await
            .map_err(declaration_error)
    }

    async fn set_prefetch(&self, prefetch: u16) -> Result<()> {
        self.channel
            .basic_qos(prefetch, BasicQosOptions::default())
            .await
            .map_err(|err| EventBusError::Connection(err.to_string()))
    }

    async fn publish(&self, message: OutgoingMessage) -> Result<()> {
        let props = message.properties;
        let mut properties = BasicProperties::default()
            .with_content_type(ShortString::from(props.content_type))
            .with_delivery_mode(props.delivery_mode);
        if let Some(id) = props.message_id {
            properties = properties.with_message_id(ShortString::from(id));
        }
        if let Some(kind) = props.event_type {
            properties = properties.with_kind(ShortString::from(kind));
        }
        if let Some(timestamp) = props.timestamp {
            properties = properties.with_timestamp(timestamp);
        }

        // The returned confirm is dropped: publishing does not wait for it.
        self.channel
            .basic_publish(
                &message.exchange,
                &message.routing_key,
                BasicPublishOptions::default(),
                &message.body,
                properties,
            )
            .await
            .map(|_confirm| ())
            .map_err(|err| EventBusError::Publish(err.to_string()))
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        let consumer = self
            .channel
            .basic_consume(queue, consumer_tag, BasicConsumeOptions::default(), FieldTable::default())
            .await
            .map_err(declaration_error)?;

        let stream = consumer.map(|delivery| {
            let delivery = delivery.map_err(|err| EventBusError::Connection(err.to_string()))?;
            let message_id = delivery.properties.message_id().as_ref().map(|id| id.as_str().to_string());
            let count = delivery.properties.headers().as_ref().and_then(delivery_count);
            Ok(Delivery::new(
                delivery.exchange.as_str(),
                delivery.routing_key.as_str(),
                delivery.data,
                Box::new(AmqpAcker { acker: delivery.acker }),
            )
            .with_redelivered(delivery.redelivered)
            .with_message_id(message_id)
            .with_delivery_count(count))
        });
        Ok(stream.boxed())
    }

    fn is_open(&self) -> bool {
        self.channel.status().connected()
    }

    async fn close(&self) -> Result<()> {
        if !self.is_open() {
            return Ok(());
        }
        self.channel
            .close(REPLY_SUCCESS, "shutdown")
            .await
            .map_err(|err| EventBusError::Connection(err.to_string()))
    }
}

struct AmqpAcker {
    acker: Acker,
}

#[async_trait]
impl Acknowledger for AmqpAcker {
    async fn ack(&self) -> Result<()> {
        self.acker
            .ack(BasicAckOptions::default())
            .await
            .map(|_| ())
            .map_err(|err| EventBusError::Connection(err.to_string()))
    }

    async fn reject(&self, requeue: bool) -> Result<()> {
        self.acker
            .reject(BasicRejectOptions { requeue })
            .await
            .map(|_| ())
            .map_err(|err| EventBusError::Connection(err.to_string()))
    }
}

/// `PRECONDITION_FAILED` and `NOT_FOUND` on a declaration are topology
/// conflicts, not transport failures.
fn declaration_error(err: lapin::Error) -> EventBusError {
    match &err {
        lapin::Error::ProtocolError(amqp) => match amqp.kind() {
            AMQPErrorKind::Soft(AMQPSoftError::PRECONDITIONFAILED | AMQPSoftError::NOTFOUND) => {
                EventBusError::Topology(err.to_string())
            }
            _ => EventBusError::Connection(err.to_string()),
        },
        _ => EventBusError::Connection(err.to_string()),
    }
}

fn delivery_count(headers: &FieldTable) -> Option<u32> {
    let value = headers
        .inner()
        .iter()
        .find(|(key, _)| key.as_str() == DELIVERY_COUNT_HEADER)
        .map(|(_, value)| value)?;
    let count = match value {
        AMQPValue::ShortShortInt(n) => i64::from(*n),
        AMQPValue::ShortShortUInt(n) => i64::from(*n),
        AMQPValue::ShortInt(n) => i64::from(*n),
        AMQPValue::ShortUInt(n) => i64::from(*n),
        AMQPValue::LongInt(n) => i64::from(*n),
        AMQPValue::LongUInt(n) => i64::from(*n),
        AMQPValue::LongLongInt(n) => *n,
        _ => return None,
    };
    u32::try_from(count).ok()
}
