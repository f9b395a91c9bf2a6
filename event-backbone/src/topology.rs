//! Exchange, queue and binding declarations for one service.

use std::fmt;

use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::broker::BrokerChannel;
use crate::error::{EventBusError, Result};

/// Suffix of the queue that collects dead-lettered messages.
pub const DEAD_LETTER_QUEUE_SUFFIX: &str = ".dead-letter";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ExchangeKind {
    Topic,
    Direct,
    Fanout,
}

impl ExchangeKind {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Topic => "topic",
            Self::Direct => "direct",
            Self::Fanout => "fanout",
        }
    }
}

impl fmt::Display for ExchangeKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ExchangeSpec {
    pub name: String,
    pub kind: ExchangeKind,
    pub durable: bool,
}

impl ExchangeSpec {
    /// Durable topic exchange, the only kind services declare.
    pub fn topic(name: impl Into<String>) -> Self {
        Self { name: name.into(), kind: ExchangeKind::Topic, durable: true }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct QueueSpec {
    pub name: String,
    pub durable: bool,
    pub dead_letter_exchange: Option<String>,
}

impl QueueSpec {
    pub fn durable(name: impl Into<String>) -> Self {
        Self { name: name.into(), durable: true, dead_letter_exchange: None }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Binding {
    pub queue: String,
    pub exchange: String,
    pub routing_key: String,
}

/// Validated, ordered declaration set.
///
/// Built once per service and replayed verbatim on every (re)connect, so the
/// declarations after a reconnect are identical to the startup ones.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Topology {
    exchanges: Vec<ExchangeSpec>,
    queues: Vec<QueueSpec>,
    bindings: Vec<Binding>,
    primary_queue: Option<String>,
}

impl Topology {
    pub fn builder() -> TopologyBuilder {
        TopologyBuilder::default()
    }

    /// No declarations. Used by publish-only services.
    pub fn empty() -> Self {
        Self { exchanges: Vec::new(), queues: Vec::new(), bindings: Vec::new(), primary_queue: None }
    }

    pub fn exchanges(&self) -> &[ExchangeSpec] {
        &self.exchanges
    }

    pub fn queues(&self) -> &[QueueSpec] {
        &self.queues
    }

    pub fn bindings(&self) -> &[Binding] {
        &self.bindings
    }

    /// The service queue the dispatch loop consumes.
    pub fn primary_queue(&self) -> Option<&QueueSpec> {
        let name = self.primary_queue.as_deref()?;
        self.queues.iter().find(|queue| queue.name == name)
    }

    pub fn is_empty(&self) -> bool {
        self.exchanges.is_empty() && self.queues.is_empty()
    }
}

#[derive(Debug, Default)]
pub struct TopologyBuilder {
    exchanges: Vec<ExchangeSpec>,
    queues: Vec<QueueSpec>,
    bindings: Vec<Binding>,
    primary_queue: Option<String>,
    dead_letter: Option<String>,
}

impl TopologyBuilder {
    pub fn exchange(mut self, exchange: ExchangeSpec) -> Self {
        self.exchanges.push(exchange);
        self
    }

    /// Shorthand for a durable topic exchange.
    pub fn topic_exchange(self, name: impl Into<String>) -> Self {
        self.exchange(ExchangeSpec::topic(name))
    }

    /// The durable service queue. Bindings added with [`Self::bind`] target it.
    pub fn queue(mut self, name: impl Into<String>) -> Self {
        let name = name.into();
        self.primary_queue = Some(name.clone());
        self.queues.push(QueueSpec::durable(name));
        self
    }

    pub fn bind(mut self, exchange: impl Into<String>, routing_key: impl Into<String>) -> Self {
        let queue = self.primary_queue.clone().unwrap_or_default();
        self.bindings.push(Binding { queue, exchange: exchange.into(), routing_key: routing_key.into() });
        self
    }

    /// Route rejected-without-requeue messages of the service queue to `exchange`.
    ///
    /// Adds the exchange, a `<queue>.dead-letter` holding queue and a `#`
    /// binding between them.
    pub fn dead_letter(mut self, exchange: impl Into<String>) -> Self {
        self.dead_letter = Some(exchange.into());
        self
    }

    pub fn build(mut self) -> Result<Topology> {
        if let Some(dlx) = self.dead_letter.take() {
            let primary = self.primary_queue.clone().ok_or_else(|| {
                EventBusError::Topology("dead-letter exchange configured without a service queue".into())
            })?;
            for queue in self.queues.iter_mut().filter(|queue| queue.name == primary) {
                queue.dead_letter_exchange = Some(dlx.clone());
            }
            let holding = format!("{primary}{DEAD_LETTER_QUEUE_SUFFIX}");
            self.exchanges.push(ExchangeSpec::topic(dlx.clone()));
            self.queues.push(QueueSpec::durable(holding.clone()));
            self.bindings.push(Binding { queue: holding, exchange: dlx, routing_key: "#".into() });
        }

        let exchanges = dedup_exchanges(self.exchanges)?;
        let queues = dedup_queues(self.queues)?;

        let mut bindings: Vec<Binding> = Vec::with_capacity(self.bindings.len());
        for binding in self.bindings {
            if binding.queue.is_empty() {
                return Err(EventBusError::Topology(format!(
                    "binding {}/{} added before any queue",
                    binding.exchange, binding.routing_key
                )));
            }
            if !exchanges.iter().any(|exchange| exchange.name == binding.exchange) {
                return Err(EventBusError::Topology(format!(
                    "binding {} targets undeclared exchange {}",
                    binding.routing_key, binding.exchange
                )));
            }
            if !bindings.contains(&binding) {
                bindings.push(binding);
            }
        }

        Ok(Topology { exchanges, queues, bindings, primary_queue: self.primary_queue })
    }
}

fn dedup_exchanges(declared: Vec<ExchangeSpec>) -> Result<Vec<ExchangeSpec>> {
    let mut unique: Vec<ExchangeSpec> = Vec::with_capacity(declared.len());
    for exchange in declared {
        if exchange.name.is_empty() {
            return Err(EventBusError::Topology("exchange name must not be empty".into()));
        }
        match unique.iter().find(|existing| existing.name == exchange.name) {
            Some(existing) if *existing == exchange => {}
            Some(existing) => {
                return Err(EventBusError::Topology(format!(
                    "exchange {} declared twice with different parameters ({} vs {})",
                    exchange.name, existing.kind, exchange.kind
                )))
            }
            None => unique.push(exchange),
        }
    }
    Ok(unique)
}

fn dedup_queues(declared: Vec<QueueSpec>) -> Result<Vec<QueueSpec>> {
    let mut unique: Vec<QueueSpec> = Vec::with_capacity(declared.len());
    for queue in declared {
        if queue.name.is_empty() {
            return Err(EventBusError::Topology("queue name must not be empty".into()));
        }
        match unique.iter().find(|existing| existing.name == queue.name) {
            Some(existing) if *existing == queue => {}
            Some(_) => {
                return Err(EventBusError::Topology(format!(
                    "queue {} declared twice with different parameters",
                    queue.name
                )))
            }
            None => unique.push(queue),
        }
    }
    Ok(unique)
}

/// Declare every exchange, then every queue, then every binding.
///
/// Identical redeclaration is a no-op on the broker. A conflicting one fails
/// with [`EventBusError::Topology`].
pub async fn declare_topology(channel: &dyn BrokerChannel, topology: &Topology) -> Result<()> {
    for exchange in topology.exchanges() {
        channel.declare_exchange(exchange).await?;
        debug!(exchange = %exchange.name, kind = %exchange.kind, "Exchange declared");
    }

    for queue in topology.queues() {
        channel.declare_queue(queue).await?;
        debug!(queue = %queue.name, dead_letter_exchange = ?queue.dead_letter_exchange, "Queue declared");
    }

    for binding in topology.bindings() {
        channel.bind_queue(binding).await?;
        debug!(
            queue = %binding.queue,
            exchange = %binding.exchange,
            routing_key = %binding.routing_key,
            "Queue bound"
        );
    }

    info!(
        exchanges = topology.exchanges().len(),
        queues = topology.queues().len(),
        bindings = topology.bindings().len(),
        "Topology declared"
    );
    Ok(())
}
