use std::sync::Arc;

use tracing::{info, warn};

use crate::amqp::AmqpConnector;
use crate::broker::Connector;
use crate::config::BackboneConfig;
use crate::consumer::EventConsumer;
use crate::error::Result;
use crate::handlers::HandlerRegistry;
use crate::publisher::EventPublisher;
use crate::supervisor::{ConnectionState, ConnectionSupervisor};
use crate::topology::Topology;

/// Everything a service needs to talk to the broker: one supervised
/// connection shared by a publisher and a consumer.
///
/// ```no_run
/// # async fn run() -> event_backbone::Result<()> {
/// use event_backbone::{BackboneConfig, EventBackbone, HandlerRegistry};
///
/// let config = BackboneConfig::from_env()?;
/// let topology = config
///     .topology_builder()
///     .topic_exchange("profile-events")
///     .bind("profile-events", "profile.updated")
///     .build()?;
/// let backbone = EventBackbone::connect(config, topology).await?;
///
/// let handlers = HandlerRegistry::new().register_fn("profile.updated", |_body| async { Ok(()) });
/// backbone.start_consumer(handlers).await?;
/// backbone.publisher().publish_event("user-events", "user.login", serde_json::json!({"user_id": "u1"})).await?;
/// backbone.close().await
/// # }
/// ```
pub struct EventBackbone {
    config: BackboneConfig,
    supervisor: Option<ConnectionSupervisor>,
    publisher: EventPublisher,
    consumer: EventConsumer,
}

impl EventBackbone {
    /// Connect to the configured AMQP broker.
    pub async fn connect(config: BackboneConfig, topology: Topology) -> Result<Self> {
        let connector = Arc::new(AmqpConnector::new(config.service_name.clone()));
        Self::connect_with(config, topology, connector).await
    }

    /// Connect through any [`Connector`]. An empty URI yields a disabled
    /// backbone without touching the connector.
    pub async fn connect_with(config: BackboneConfig, topology: Topology, connector: Arc<dyn Connector>) -> Result<Self> {
        config.validate()?;
        if !config.is_enabled() {
            warn!(service = %config.service_name, "No broker URI configured, event backbone disabled");
            return Ok(Self::disabled(config));
        }

        let supervisor = ConnectionSupervisor::connect(config.uri.clone(), connector, topology, config.backoff()).await?;
        let publisher = EventPublisher::with_timeout(supervisor.clone(), config.publish_timeout());
        let consumer = EventConsumer::new(supervisor.clone(), config.consumer_options());
        info!(service = %config.service_name, queue = %config.queue_name(), "Event backbone connected");

        Ok(Self { config, supervisor: Some(supervisor), publisher, consumer })
    }

    pub fn disabled(config: BackboneConfig) -> Self {
        Self {
            config,
            supervisor: None,
            publisher: EventPublisher::disabled(),
            consumer: EventConsumer::disabled(),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.supervisor.is_some()
    }

    pub fn config(&self) -> &BackboneConfig {
        &self.config
    }

    pub fn publisher(&self) -> EventPublisher {
        self.publisher.clone()
    }

    pub fn supervisor(&self) -> Option<&ConnectionSupervisor> {
        self.supervisor.as_ref()
    }

    pub fn state(&self) -> ConnectionState {
        self.supervisor
            .as_ref()
            .map_or(ConnectionState::Disconnected, ConnectionSupervisor::state)
    }

    /// Start dispatching the service queue with the configured prefetch.
    pub async fn start_consumer(&self, handlers: HandlerRegistry) -> Result<()> {
        self.consumer.start(self.config.prefetch, handlers).await
    }

    /// Drain in-flight handlers and close the connection. Idempotent.
    pub async fn close(&self) -> Result<()> {
        self.consumer.close().await?;
        if let Some(supervisor) = &self.supervisor {
            supervisor.close().await?;
        }
        Ok(())
    }
}

impl std::fmt::Debug for EventBackbone {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBackbone")
            .field("service", &self.config.service_name)
            .field("enabled", &self.is_enabled())
            .field("state", &self.state())
            .finish()
    }
}
