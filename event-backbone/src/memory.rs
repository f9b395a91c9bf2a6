//! In-process broker for tests and local runs.
//!
//! Implements the broker traits with AMQP-like semantics: durable exchanges
//! and queues that outlive connections, topic/direct/fanout routing, per
//! channel prefetch credit, ack/reject/requeue, dead-lettering and
//! redelivery of unacked messages when a channel goes away. Failure
//! injection (`simulate_outage`, `close_channels`, `cancel_consumers`) raises
//! the same link events a real client would.

use std::collections::{HashMap, VecDeque};
use std::sync::{Arc, Weak};

use async_trait::async_trait;
use futures::StreamExt;
use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio_stream::wrappers::UnboundedReceiverStream;
use tracing::debug;

use crate::broker::{
    Acknowledger, BrokerChannel, BrokerConnection, Connector, Delivery, DeliveryStream, LinkEvent, LinkEvents,
    MessageProperties, OutgoingMessage,
};
use crate::error::{EventBusError, Result};
use crate::supervisor::Settlement;
use crate::topic;
use crate::topology::{Binding, ExchangeKind, ExchangeSpec, QueueSpec};

/// A declaration as received by the broker, in call order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Declaration {
    Exchange(ExchangeSpec),
    Queue(QueueSpec),
    Binding(Binding),
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BrokerStats {
    pub connects: usize,
    pub failed_connects: usize,
    pub channels_opened: usize,
    pub publishes: usize,
}

/// A message sitting in a queue.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueuedMessage {
    pub exchange: String,
    pub routing_key: String,
    pub body: Vec<u8>,
    pub properties: MessageProperties,
    pub redelivered: bool,
}

struct QueueState {
    spec: QueueSpec,
    ready: VecDeque<QueuedMessage>,
    unacked: HashMap<u64, Unacked>,
}

struct Unacked {
    message: QueuedMessage,
    channel_id: u64,
    consumer_tag: String,
}

struct ConnectionEntry {
    open: bool,
    connection_id: u64,
    events: LinkEvents,
}

struct ChannelEntry {
    open: bool,
    connection: u64,
    generation: u64,
    prefetch: u16,
    events: LinkEvents,
}

struct ConsumerEntry {
    tag: String,
    queue: String,
    channel_id: u64,
    in_flight: usize,
    sender: mpsc::UnboundedSender<Result<Delivery>>,
}

struct State {
    available: bool,
    exchanges: HashMap<String, ExchangeSpec>,
    queues: HashMap<String, QueueState>,
    bindings: Vec<Binding>,
    connections: HashMap<u64, ConnectionEntry>,
    channels: HashMap<u64, ChannelEntry>,
    consumers: Vec<ConsumerEntry>,
    next_id: u64,
    declarations: Vec<Declaration>,
    stats: BrokerStats,
}

impl Default for State {
    fn default() -> Self {
        Self {
            available: true,
            exchanges: HashMap::new(),
            queues: HashMap::new(),
            bindings: Vec::new(),
            connections: HashMap::new(),
            channels: HashMap::new(),
            consumers: Vec::new(),
            next_id: 0,
            declarations: Vec::new(),
            stats: BrokerStats::default(),
        }
    }
}

#[derive(Clone, Default)]
pub struct InMemoryBroker {
    state: Arc<Mutex<State>>,
}

impl InMemoryBroker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Drop every open connection and refuse new ones until [`Self::restore`].
    pub fn simulate_outage(&self) {
        let mut state = self.state.lock();
        state.available = false;
        let open: Vec<u64> = state
            .connections
            .iter()
            .filter(|(_, entry)| entry.open)
            .map(|(key, _)| *key)
            .collect();
        for key in open {
            state.close_connection(key, Some("CONNECTION_FORCED - broker forced connection closure"));
        }
        debug!("In-memory broker outage started");
    }

    pub fn restore(&self) {
        self.state.lock().available = true;
        debug!("In-memory broker restored");
    }

    pub fn is_available(&self) -> bool {
        self.state.lock().available
    }

    /// Close every open channel while leaving connections up.
    pub fn close_channels(&self) {
        let mut state = self.state.lock();
        let open: Vec<u64> = state
            .channels
            .iter()
            .filter(|(_, entry)| entry.open)
            .map(|(key, _)| *key)
            .collect();
        for key in open {
            state.close_channel(key, Some("CHANNEL_ERROR - channel closed by broker"));
        }
    }

    /// End the delivery streams of every consumer on `queue`.
    pub fn cancel_consumers(&self, queue: &str) {
        self.state.lock().consumers.retain(|consumer| consumer.queue != queue);
    }

    pub fn declarations(&self) -> Vec<Declaration> {
        self.state.lock().declarations.clone()
    }

    pub fn clear_declarations(&self) {
        self.state.lock().declarations.clear();
    }

    pub fn stats(&self) -> BrokerStats {
        self.state.lock().stats
    }

    pub fn queue_depth(&self, queue: &str) -> usize {
        self.state.lock().queues.get(queue).map_or(0, |q| q.ready.len())
    }

    pub fn unacked_count(&self, queue: &str) -> usize {
        self.state.lock().queues.get(queue).map_or(0, |q| q.unacked.len())
    }

    pub fn consumer_count(&self, queue: &str) -> usize {
        self.state.lock().consumers.iter().filter(|c| c.queue == queue).count()
    }

    /// Remove and return every ready message of `queue`.
    pub fn take_messages(&self, queue: &str) -> Vec<QueuedMessage> {
        self.state
            .lock()
            .queues
            .get_mut(queue)
            .map(|q| q.ready.drain(..).collect())
            .unwrap_or_default()
    }

    /// Route a message as if a foreign service published it.
    pub fn inject(&self, exchange: &str, routing_key: &str, body: impl Into<Vec<u8>>) -> Result<()> {
        let mut state = self.state.lock();
        state.route(QueuedMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            body: body.into(),
            properties: MessageProperties::default(),
            redelivered: false,
        })?;
        state.pump(&Arc::downgrade(&self.state));
        Ok(())
    }
}

impl State {
    fn next_id(&mut self) -> u64 {
        self.next_id += 1;
        self.next_id
    }

    fn channel_open(&self, channel_id: u64) -> bool {
        self.channels.get(&channel_id).is_some_and(|c| c.open)
    }

    fn close_connection(&mut self, key: u64, reason: Option<&str>) {
        let channels: Vec<u64> = self
            .channels
            .iter()
            .filter(|(_, c)| c.connection == key && c.open)
            .map(|(id, _)| *id)
            .collect();
        for channel in channels {
            self.close_channel(channel, reason);
        }
        if let Some(entry) = self.connections.get_mut(&key) {
            entry.open = false;
            if let Some(reason) = reason {
                let sent = entry.events.send(LinkEvent::ConnectionClosed {
                    connection_id: entry.connection_id,
                    reason: reason.to_string(),
                });
                if sent.is_err() {
                    debug!(connection_id = entry.connection_id, "Connection closed after supervisor exit");
                }
            }
        }
    }

    /// Mark the channel closed, end its consumers and requeue its unacked
    /// messages in their original order.
    fn close_channel(&mut self, channel_id: u64, reason: Option<&str>) {
        let Some(entry) = self.channels.get_mut(&channel_id) else {
            return;
        };
        if !entry.open {
            return;
        }
        entry.open = false;
        if let Some(reason) = reason {
            let sent = entry.events.send(LinkEvent::ChannelClosed {
                generation: entry.generation,
                reason: reason.to_string(),
            });
            if sent.is_err() {
                debug!(generation = entry.generation, "Channel closed after supervisor exit");
            }
        }

        self.consumers.retain(|consumer| consumer.channel_id != channel_id);
        for queue in self.queues.values_mut() {
            let mut orphaned: Vec<(u64, Unacked)> = Vec::new();
            queue.unacked.retain(|tag, unacked| {
                if unacked.channel_id == channel_id {
                    orphaned.push((*tag, Unacked {
                        message: unacked.message.clone(),
                        channel_id,
                        consumer_tag: unacked.consumer_tag.clone(),
                    }));
                    false
                } else {
                    true
                }
            });
            orphaned.sort_by_key(|(tag, _)| *tag);
            for (_, unacked) in orphaned.into_iter().rev() {
                let mut message = unacked.message;
                message.redelivered = true;
                queue.ready.push_front(message);
            }
        }
    }

    fn route(&mut self, message: QueuedMessage) -> Result<()> {
        let targets: Vec<String> = if message.exchange.is_empty() {
            vec![message.routing_key.clone()]
        } else {
            let exchange = self.exchanges.get(&message.exchange).ok_or_else(|| {
                EventBusError::Publish(format!("NOT_FOUND - no exchange '{}'", message.exchange))
            })?;
            let mut targets: Vec<String> = Vec::new();
            for binding in self.bindings.iter().filter(|b| b.exchange == message.exchange) {
                let routed = match exchange.kind {
                    ExchangeKind::Topic => topic::matches(&binding.routing_key, &message.routing_key),
                    ExchangeKind::Direct => binding.routing_key == message.routing_key,
                    ExchangeKind::Fanout => true,
                };
                if routed && !targets.contains(&binding.queue) {
                    targets.push(binding.queue.clone());
                }
            }
            targets
        };

        if targets.is_empty() {
            debug!(exchange = %message.exchange, routing_key = %message.routing_key, "Unroutable message dropped");
        }
        for target in targets {
            if let Some(queue) = self.queues.get_mut(&target) {
                queue.ready.push_back(message.clone());
            }
        }
        Ok(())
    }

    fn dead_letter(&mut self, queue: &str, message: QueuedMessage) {
        let dlx = self.queues.get(queue).and_then(|q| q.spec.dead_letter_exchange.clone());
        match dlx {
            Some(dlx) => {
                let routed = self.route(QueuedMessage { exchange: dlx, redelivered: false, ..message });
                if let Err(err) = routed {
                    debug!(error = %err, "Dead-letter exchange missing, message discarded");
                }
            }
            None => debug!(queue = %queue, "Rejected message discarded"),
        }
    }

    /// Hand ready messages to consumers with spare prefetch credit.
    fn pump(&mut self, handle: &Weak<Mutex<State>>) {
        loop {
            let mut progressed = false;
            let State { consumers, queues, channels, next_id, .. } = self;

            for consumer in consumers.iter_mut() {
                let Some(channel) = channels.get(&consumer.channel_id).filter(|c| c.open) else {
                    continue;
                };
                if channel.prefetch != 0 && consumer.in_flight >= usize::from(channel.prefetch) {
                    continue;
                }
                let Some(queue) = queues.get_mut(&consumer.queue) else {
                    continue;
                };
                let Some(message) = queue.ready.pop_front() else {
                    continue;
                };

                *next_id += 1;
                let delivery_tag = *next_id;
                let acker = MemoryAcker {
                    state: handle.clone(),
                    queue: consumer.queue.clone(),
                    channel_id: consumer.channel_id,
                    delivery_tag,
                };
                let delivery = Delivery::new(
                    message.exchange.clone(),
                    message.routing_key.clone(),
                    message.body.clone(),
                    Box::new(acker),
                )
                .with_redelivered(message.redelivered)
                .with_message_id(message.properties.message_id.clone());

                if consumer.sender.send(Ok(delivery)).is_err() {
                    queue.ready.push_front(message);
                    continue;
                }
                queue.unacked.insert(delivery_tag, Unacked {
                    message,
                    channel_id: consumer.channel_id,
                    consumer_tag: consumer.tag.clone(),
                });
                consumer.in_flight += 1;
                progressed = true;
            }

            consumers.retain(|consumer| !consumer.sender.is_closed());
            if !progressed {
                break;
            }
        }
    }

    fn settle(&mut self, handle: &Weak<Mutex<State>>, acker: &MemoryAcker, settlement: Settlement) -> Result<()> {
        if !self.channel_open(acker.channel_id) {
            return Err(EventBusError::Connection("channel is closed".into()));
        }
        let entry = self
            .queues
            .get_mut(&acker.queue)
            .and_then(|queue| queue.unacked.remove(&acker.delivery_tag))
            .ok_or_else(|| {
                EventBusError::Connection(format!("PRECONDITION_FAILED - unknown delivery tag {}", acker.delivery_tag))
            })?;

        if let Some(consumer) = self.consumers.iter_mut().find(|c| c.tag == entry.consumer_tag) {
            consumer.in_flight = consumer.in_flight.saturating_sub(1);
        }

        match settlement {
            Settlement::Ack => {}
            Settlement::Reject { requeue: true } => {
                if let Some(queue) = self.queues.get_mut(&acker.queue) {
                    let mut message = entry.message;
                    message.redelivered = true;
                    queue.ready.push_front(message);
                }
            }
            Settlement::Reject { requeue: false } => self.dead_letter(&acker.queue, entry.message),
        }
        self.pump(handle);
        Ok(())
    }
}

#[async_trait]
impl Connector for InMemoryBroker {
    async fn connect(&self, _uri: &str, connection_id: u64, events: LinkEvents) -> Result<Arc<dyn BrokerConnection>> {
        let mut state = self.state.lock();
        if !state.available {
            state.stats.failed_connects += 1;
            return Err(EventBusError::Connection("connection refused".into()));
        }
        state.stats.connects += 1;
        let key = state.next_id();
        state.connections.insert(key, ConnectionEntry { open: true, connection_id, events });
        Ok(Arc::new(MemoryConnection { key, state: Arc::clone(&self.state) }))
    }
}

struct MemoryConnection {
    key: u64,
    state: Arc<Mutex<State>>,
}

#[async_trait]
impl BrokerConnection for MemoryConnection {
    async fn open_channel(&self, generation: u64, events: LinkEvents) -> Result<Arc<dyn BrokerChannel>> {
        let mut state = self.state.lock();
        let open = state.available && state.connections.get(&self.key).is_some_and(|c| c.open);
        if !open {
            return Err(EventBusError::Connection("connection is closed".into()));
        }
        state.stats.channels_opened += 1;
        let id = state.next_id();
        state.channels.insert(id, ChannelEntry { open: true, connection: self.key, generation, prefetch: 0, events });
        Ok(Arc::new(MemoryChannel { id, state: Arc::clone(&self.state) }))
    }

    fn is_open(&self) -> bool {
        self.state.lock().connections.get(&self.key).is_some_and(|c| c.open)
    }

    async fn close(&self) -> Result<()> {
        self.state.lock().close_connection(self.key, None);
        Ok(())
    }
}

struct MemoryChannel {
    id: u64,
    state: Arc<Mutex<State>>,
}

impl MemoryChannel {
    fn ensure_open(&self, state: &State) -> Result<()> {
        if state.channel_open(self.id) {
            Ok(())
        } else {
            Err(EventBusError::Connection("channel is closed".into()))
        }
    }

    /// Soft errors close the channel, as on a real broker.
    fn fail(&self, state: &mut State, err: EventBusError) -> EventBusError {
        state.close_channel(self.id, Some(&err.to_string()));
        err
    }
}

#[async_trait]
impl BrokerChannel for MemoryChannel {
    async fn declare_exchange(&self, exchange: &ExchangeSpec) -> Result<()> {
        let mut state = self.state.lock();
        self.ensure_open(&state)?;
        state.declarations.push(Declaration::Exchange(exchange.clone()));
        match state.exchanges.get(&exchange.name) {
            Some(existing) if existing != exchange => {
                let err = EventBusError::Topology(format!(
                    "PRECONDITION_FAILED - inequivalent arg 'type' for exchange '{}': received '{}' but current is '{}'",
                    exchange.name, exchange.kind, existing.kind
                ));
                Err(self.fail(&mut state, err))
            }
            Some(_) => Ok(()),
            None => {
                state.exchanges.insert(exchange.name.clone(), exchange.clone());
                Ok(())
            }
        }
    }

    async fn declare_queue(&self, queue: &QueueSpec) -> Result<()> {
        let mut state = self.state.lock();
        self.ensure_open(&state)?;
        state.declarations.push(Declaration::Queue(queue.clone()));
        match state.queues.get(&queue.name) {
            Some(existing) if existing.spec != *queue => {
                let err = EventBusError::Topology(format!(
                    "PRECONDITION_FAILED - inequivalent arg for queue '{}'",
                    queue.name
                ));
                Err(self.fail(&mut state, err))
            }
            Some(_) => Ok(()),
            None => {
                state.queues.insert(queue.name.clone(), QueueState {
                    spec: queue.clone(),
                    ready: VecDeque::new(),
                    unacked: HashMap::new(),
                });
                Ok(())
            }
        }
    }

    async fn bind_queue(&self, binding: &Binding) -> Result<()> {
        let mut state = self.state.lock();
        self.ensure_open(&state)?;
        state.declarations.push(Declaration::Binding(binding.clone()));
        if !state.exchanges.contains_key(&binding.exchange) {
            let err = EventBusError::Topology(format!("NOT_FOUND - no exchange '{}'", binding.exchange));
            return Err(self.fail(&mut state, err));
        }
        if !state.queues.contains_key(&binding.queue) {
            let err = EventBusError::Topology(format!("NOT_FOUND - no queue '{}'", binding.queue));
            return Err(self.fail(&mut state, err));
        }
        if !state.bindings.contains(binding) {
            state.bindings.push(binding.clone());
        }
        Ok(())
    }

    async fn set_prefetch(&self, prefetch: u16) -> Result<()> {
        let mut state = self.state.lock();
        self.ensure_open(&state)?;
        if let Some(channel) = state.channels.get_mut(&self.id) {
            channel.prefetch = prefetch;
        }
        state.pump(&Arc::downgrade(&self.state));
        Ok(())
    }

    async fn publish(&self, message: OutgoingMessage) -> Result<()> {
        let mut state = self.state.lock();
        if !state.channel_open(self.id) {
            return Err(EventBusError::Publish("channel is closed".into()));
        }
        state.route(QueuedMessage {
            exchange: message.exchange,
            routing_key: message.routing_key,
            body: message.body,
            properties: message.properties,
            redelivered: false,
        })?;
        state.stats.publishes += 1;
        state.pump(&Arc::downgrade(&self.state));
        Ok(())
    }

    async fn consume(&self, queue: &str, consumer_tag: &str) -> Result<DeliveryStream> {
        let mut state = self.state.lock();
        self.ensure_open(&state)?;
        if !state.queues.contains_key(queue) {
            let err = EventBusError::Topology(format!("NOT_FOUND - no queue '{queue}'"));
            return Err(self.fail(&mut state, err));
        }
        let (sender, receiver) = mpsc::unbounded_channel();
        state.consumers.push(ConsumerEntry {
            tag: consumer_tag.to_string(),
            queue: queue.to_string(),
            channel_id: self.id,
            in_flight: 0,
            sender,
        });
        state.pump(&Arc::downgrade(&self.state));
        Ok(UnboundedReceiverStream::new(receiver).boxed())
    }

    fn is_open(&self) -> bool {
        self.state.lock().channel_open(self.id)
    }

    async fn close(&self) -> Result<()> {
        self.state.lock().close_channel(self.id, None);
        Ok(())
    }
}

struct MemoryAcker {
    state: Weak<Mutex<State>>,
    queue: String,
    channel_id: u64,
    delivery_tag: u64,
}

impl MemoryAcker {
    fn settle(&self, settlement: Settlement) -> Result<()> {
        let state = self.state.upgrade().ok_or(EventBusError::Closed)?;
        let mut guard = state.lock();
        guard.settle(&self.state, self, settlement)
    }
}

#[async_trait]
impl Acknowledger for MemoryAcker {
    async fn ack(&self) -> Result<()> {
        self.settle(Settlement::Ack)
    }

    async fn reject(&self, requeue: bool) -> Result<()> {
        self.settle(Settlement::Reject { requeue })
    }
}

/// Records how a [`detached_delivery`] was settled.
#[derive(Clone, Default)]
pub struct SettlementProbe {
    settled: Arc<Mutex<Option<Settlement>>>,
}

impl SettlementProbe {
    pub fn settlement(&self) -> Option<Settlement> {
        *self.settled.lock()
    }
}

struct ProbeAcker {
    probe: SettlementProbe,
}

#[async_trait]
impl Acknowledger for ProbeAcker {
    async fn ack(&self) -> Result<()> {
        *self.probe.settled.lock() = Some(Settlement::Ack);
        Ok(())
    }

    async fn reject(&self, requeue: bool) -> Result<()> {
        *self.probe.settled.lock() = Some(Settlement::Reject { requeue });
        Ok(())
    }
}

/// A delivery not backed by any broker, for driving handlers directly.
pub fn detached_delivery(routing_key: &str, body: Vec<u8>) -> (Delivery, SettlementProbe) {
    let probe = SettlementProbe::default();
    let delivery = Delivery::new("", routing_key, body, Box::new(ProbeAcker { probe: probe.clone() }));
    (delivery, probe)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::topology::Topology;

    async fn channel(broker: &InMemoryBroker) -> (Arc<dyn BrokerChannel>, mpsc::UnboundedReceiver<LinkEvent>) {
        let (events, rx) = mpsc::unbounded_channel();
        let connection = broker.connect("memory", 1, events.clone()).await.unwrap();
        (connection.open_channel(1, events).await.unwrap(), rx)
    }

    async fn declare(channel: &dyn BrokerChannel) {
        let topology = Topology::builder()
            .topic_exchange("billing.events")
            .queue("svc")
            .bind("billing.events", "plan.*")
            .dead_letter("svc.dlx")
            .build()
            .unwrap();
        crate::topology::declare_topology(channel, &topology).await.unwrap();
    }

    fn message(routing_key: &str) -> OutgoingMessage {
        OutgoingMessage {
            exchange: "billing.events".into(),
            routing_key: routing_key.into(),
            body: b"{}".to_vec(),
            properties: MessageProperties::default(),
        }
    }

    #[tokio::test]
    async fn outage_without_listener_still_closes_everything() {
        let broker = InMemoryBroker::new();
        let (channel, events) = channel(&broker).await;
        drop(events);

        broker.simulate_outage();
        assert!(!channel.is_open());
        assert!(!broker.is_available());
    }

    #[tokio::test]
    async fn topic_routing_respects_bindings() {
        let broker = InMemoryBroker::new();
        let (channel, _events) = channel(&broker).await;
        declare(channel.as_ref()).await;

        channel.publish(message("plan.created")).await.unwrap();
        channel.publish(message("subscription.updated")).await.unwrap();
        assert_eq!(broker.queue_depth("svc"), 1);
    }

    #[tokio::test]
    async fn prefetch_limits_unacked_deliveries() {
        let broker = InMemoryBroker::new();
        let (channel, _events) = channel(&broker).await;
        declare(channel.as_ref()).await;
        for _ in 0..5 {
            channel.publish(message("plan.created")).await.unwrap();
        }

        channel.set_prefetch(2).await.unwrap();
        let mut stream = channel.consume("svc", "t1").await.unwrap();
        assert_eq!(broker.unacked_count("svc"), 2);
        assert_eq!(broker.queue_depth("svc"), 3);

        let first = stream.next().await.unwrap().unwrap();
        first.ack().await.unwrap();
        assert_eq!(broker.unacked_count("svc"), 2);
        assert_eq!(broker.queue_depth("svc"), 2);
    }

    #[tokio::test]
    async fn rejected_without_requeue_goes_to_dead_letter_queue() {
        let broker = InMemoryBroker::new();
        let (channel, _events) = channel(&broker).await;
        declare(channel.as_ref()).await;
        channel.publish(message("plan.deleted")).await.unwrap();

        let mut stream = channel.consume("svc", "t1").await.unwrap();
        let delivery = stream.next().await.unwrap().unwrap();
        delivery.reject(true).await.unwrap();
        let redelivered = stream.next().await.unwrap().unwrap();
        assert!(redelivered.redelivered);
        redelivered.reject(false).await.unwrap();

        assert_eq!(broker.queue_depth("svc.dead-letter"), 1);
        assert_eq!(broker.unacked_count("svc"), 0);
    }

    #[tokio::test]
    async fn conflicting_redeclaration_closes_the_channel() {
        let broker = InMemoryBroker::new();
        let (channel, mut events) = channel(&broker).await;
        declare(channel.as_ref()).await;

        let err = channel
            .declare_exchange(&ExchangeSpec { name: "billing.events".into(), kind: ExchangeKind::Direct, durable: true })
            .await
            .unwrap_err();
        assert!(matches!(err, EventBusError::Topology(ref msg) if msg.contains("PRECONDITION_FAILED")));
        assert!(!channel.is_open());
        assert!(matches!(events.recv().await, Some(LinkEvent::ChannelClosed { generation: 1, .. })));
    }

    #[tokio::test]
    async fn outage_requeues_unacked_and_refuses_connections() {
        let broker = InMemoryBroker::new();
        let (channel, mut events) = channel(&broker).await;
        declare(channel.as_ref()).await;
        channel.publish(message("plan.created")).await.unwrap();
        let mut stream = channel.consume("svc", "t1").await.unwrap();
        let _unacked = stream.next().await.unwrap().unwrap();

        broker.simulate_outage();
        assert!(stream.next().await.is_none());
        assert_eq!(broker.queue_depth("svc"), 1);
        assert!(matches!(events.recv().await, Some(LinkEvent::ChannelClosed { .. })));
        assert!(matches!(events.recv().await, Some(LinkEvent::ConnectionClosed { connection_id: 1, .. })));

        let (events_tx, _rx) = mpsc::unbounded_channel();
        assert!(broker.connect("memory", 2, events_tx).await.is_err());
        assert_eq!(broker.stats().failed_connects, 1);
    }
}
