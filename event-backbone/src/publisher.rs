use std::time::Duration;

use serde::Serialize;
use tracing::{debug, warn};

use crate::broker::{MessageProperties, OutgoingMessage};
use crate::envelope::Envelope;
use crate::error::{EventBusError, Result};
use crate::supervisor::ConnectionSupervisor;

pub const DEFAULT_PUBLISH_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
enum Mode {
    /// No broker configured. Every publish succeeds without I/O.
    Disabled,
    Enabled {
        supervisor: ConnectionSupervisor,
        publish_timeout: Duration,
    },
}

/// Publishes enveloped domain events on the supervisor's current channel.
///
/// Publishing is fire-and-forget: the message is handed to the broker and the
/// call returns without waiting for a confirm. There is no built-in retry.
#[derive(Clone)]
pub struct EventPublisher {
    mode: Mode,
}

impl EventPublisher {
    pub fn new(supervisor: ConnectionSupervisor) -> Self {
        Self::with_timeout(supervisor, DEFAULT_PUBLISH_TIMEOUT)
    }

    pub fn with_timeout(supervisor: ConnectionSupervisor, publish_timeout: Duration) -> Self {
        Self { mode: Mode::Enabled { supervisor, publish_timeout } }
    }

    /// A publisher for services running without a broker.
    pub fn disabled() -> Self {
        Self { mode: Mode::Disabled }
    }

    pub fn is_enabled(&self) -> bool {
        matches!(self.mode, Mode::Enabled { .. })
    }

    /// Publish `payload` with the routing key as its event type.
    pub async fn publish_event<P: Serialize>(&self, exchange: &str, routing_key: &str, payload: P) -> Result<()> {
        self.publish_as(exchange, routing_key, routing_key, payload).await
    }

    /// Publish `payload` under an event type that differs from the routing key.
    pub async fn publish_as<P: Serialize>(
        &self,
        exchange: &str,
        routing_key: &str,
        event_type: &str,
        payload: P,
    ) -> Result<()> {
        if !self.is_enabled() {
            return Ok(());
        }
        self.publish_envelope(exchange, routing_key, &Envelope::new(event_type, payload)).await
    }

    /// Publish a prebuilt envelope.
    pub async fn publish_envelope<P: Serialize>(
        &self,
        exchange: &str,
        routing_key: &str,
        envelope: &Envelope<P>,
    ) -> Result<()> {
        let Mode::Enabled { supervisor, publish_timeout } = &self.mode else {
            return Ok(());
        };

        let channel = supervisor.current_channel()?;
        let body = envelope.encode()?;
        let message = OutgoingMessage {
            exchange: exchange.to_string(),
            routing_key: routing_key.to_string(),
            body,
            properties: MessageProperties {
                message_id: Some(envelope.id().to_string()),
                event_type: Some(envelope.event_type().to_string()),
                timestamp: u64::try_from(envelope.timestamp()).ok(),
                ..MessageProperties::default()
            },
        };

        match tokio::time::timeout(*publish_timeout, channel.publish(message)).await {
            Ok(Ok(())) => {
                debug!(
                    exchange = %exchange,
                    routing_key = %routing_key,
                    event_id = %envelope.id(),
                    generation = channel.generation(),
                    "Event published"
                );
                Ok(())
            }
            Ok(Err(err)) => {
                warn!(exchange = %exchange, routing_key = %routing_key, error = %err, "Event publish failed");
                Err(match err {
                    EventBusError::Publish(_) | EventBusError::ConnectionUnavailable => err,
                    other => EventBusError::Publish(other.to_string()),
                })
            }
            Err(_) => {
                warn!(exchange = %exchange, routing_key = %routing_key, timeout = ?publish_timeout, "Event publish timed out");
                Err(EventBusError::Publish(format!("publish timed out after {publish_timeout:?}")))
            }
        }
    }
}

impl std::fmt::Debug for EventPublisher {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventPublisher").field("enabled", &self.is_enabled()).finish()
    }
}
