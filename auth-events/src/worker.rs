//! Wiring for the auth service's consumer.

use std::sync::Arc;

use event_backbone::broker::Connector;
use event_backbone::{event_types, BackboneConfig, EventBackbone, HandlerRegistry, Result, Topology};
use tracing::info;

use crate::events::exchanges;
use crate::handlers::{AuthEventHandlers, AuthStores};

/// Exchange and routing key for every event the auth queue receives.
pub const AUTH_BINDINGS: [(&str, &str); 9] = [
    (exchanges::PROFILE_EVENTS, event_types::PROFILE_UPDATED),
    (exchanges::PROFILE_EVENTS, event_types::PROFILE_DELETED),
    (exchanges::GOOGLE_EVENTS, event_types::GOOGLE_LOGIN),
    (exchanges::GOOGLE_EVENTS, event_types::GOOGLE_LOGIN_REQUEST),
    (exchanges::GOOGLE_EVENTS, event_types::EMAIL_VERIFICATION_SUCCESS),
    (exchanges::BILLING_EVENTS, event_types::PLAN_CREATED),
    (exchanges::BILLING_EVENTS, event_types::PLAN_UPDATED),
    (exchanges::BILLING_EVENTS, event_types::PLAN_DELETED),
    (exchanges::BILLING_EVENTS, event_types::SUBSCRIPTION_UPDATED),
];

/// The auth queue with its bindings, plus the exchanges the service
/// publishes to (`auth-events`, `user-events`).
pub fn auth_topology(config: &BackboneConfig) -> Result<Topology> {
    let builder = [
        exchanges::PROFILE_EVENTS,
        exchanges::GOOGLE_EVENTS,
        exchanges::BILLING_EVENTS,
        exchanges::AUTH_EVENTS,
        exchanges::USER_EVENTS,
    ]
    .into_iter()
    .fold(config.topology_builder(), |builder, exchange| builder.topic_exchange(exchange));

    AUTH_BINDINGS
        .into_iter()
        .fold(builder, |builder, (exchange, routing_key)| builder.bind(exchange, routing_key))
        .build()
}

pub fn auth_registry(handlers: Arc<AuthEventHandlers>) -> HandlerRegistry {
    handlers.registry()
}

/// Backbone connection plus the running auth consumer.
pub struct AuthEventWorker {
    backbone: EventBackbone,
}

impl AuthEventWorker {
    /// Connect to the configured broker and start consuming. With no broker
    /// URI the worker runs disabled.
    pub async fn start(config: BackboneConfig, stores: AuthStores) -> Result<Self> {
        let topology = auth_topology(&config)?;
        let backbone = EventBackbone::connect(config, topology).await?;
        Self::run(backbone, stores).await
    }

    pub async fn start_with(config: BackboneConfig, stores: AuthStores, connector: Arc<dyn Connector>) -> Result<Self> {
        let topology = auth_topology(&config)?;
        let backbone = EventBackbone::connect_with(config, topology, connector).await?;
        Self::run(backbone, stores).await
    }

    async fn run(backbone: EventBackbone, stores: AuthStores) -> Result<Self> {
        let handlers = Arc::new(AuthEventHandlers::new(stores, backbone.publisher()));
        backbone.start_consumer(auth_registry(handlers)).await?;
        info!(enabled = backbone.is_enabled(), "Auth event worker started");
        Ok(Self { backbone })
    }

    pub fn backbone(&self) -> &EventBackbone {
        &self.backbone
    }

    pub async fn close(&self) -> Result<()> {
        self.backbone.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn topology_binds_every_handled_key() {
        let config = BackboneConfig { service_name: "auth-service".into(), ..BackboneConfig::default() };
        let topology = auth_topology(&config).unwrap();

        assert_eq!(topology.primary_queue().unwrap().name, "auth-service-events");
        assert_eq!(topology.exchanges().len(), 5);
        assert_eq!(topology.bindings().len(), AUTH_BINDINGS.len());
        assert!(topology
            .bindings()
            .iter()
            .any(|b| b.exchange == "google.events" && b.routing_key == "email.verification.success"));
    }

    #[test]
    fn registry_covers_every_binding() {
        let store = Arc::new(crate::memory::InMemoryAuthStore::new());
        let handlers = Arc::new(AuthEventHandlers::new(
            AuthStores::in_memory(store),
            event_backbone::EventPublisher::disabled(),
        ));
        let registry = auth_registry(handlers);
        assert_eq!(registry.len(), AUTH_BINDINGS.len());
        assert!(AUTH_BINDINGS.iter().all(|(_, key)| registry.resolve(key).is_some()));
        assert!(registry.resolve("user.registered").is_none());
    }
}
