use std::time::Duration;

use thiserror::Error;

#[derive(Error, Debug)]
pub enum EventBusError {
    /// Dial or channel-open failure.
    #[error("Broker connection failed: {0}")]
    Connection(String),

    /// No healthy channel right now (disconnected, reconnecting or shut down).
    #[error("Broker connection unavailable")]
    ConnectionUnavailable,

    /// Conflicting or invalid exchange/queue/binding declaration. Never retried.
    #[error("Topology declaration failed: {0}")]
    Topology(String),

    #[error("Event serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid event payload: {0}")]
    InvalidPayload(String),

    #[error("Event publishing failed: {0}")]
    Publish(String),

    #[error("Event handler failed: {0:#}")]
    Handler(#[from] anyhow::Error),

    #[error("Event handler exceeded its deadline of {0:?}")]
    HandlerTimeout(Duration),

    #[error("Timed out waiting for response to request {0}")]
    ResponseTimeout(String),

    #[error("Invalid backbone configuration: {0}")]
    Config(String),

    #[error("Event backbone is closed")]
    Closed,
}

impl EventBusError {
    /// Errors that can never succeed on redelivery. The dispatcher acks these
    /// regardless of the configured failure policy.
    pub fn is_permanent(&self) -> bool {
        matches!(self, Self::Serialization(_) | Self::InvalidPayload(_))
    }

    /// Errors that must stop a service from starting.
    pub fn is_fatal(&self) -> bool {
        matches!(self, Self::Topology(_) | Self::Config(_))
    }
}

pub type Result<T> = std::result::Result<T, EventBusError>;
