use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::backoff::BackoffPolicy;
use crate::consumer::{ConsumerOptions, FailurePolicy};
use crate::error::{EventBusError, Result};
use crate::topology::{Topology, TopologyBuilder};

pub const ENV_URI: &str = "RABBITMQ_URI";
pub const ENV_URI_FALLBACK: &str = "AMQP_URI";

/// Broker settings for one service process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct BackboneConfig {
    /// Broker address. Empty disables the backbone: the publisher becomes a
    /// no-op and the consumer never starts.
    pub uri: String,
    /// Used for the connection name and the default queue name.
    pub service_name: String,
    /// Service queue. Defaults to `<service_name>-events`.
    pub queue: Option<String>,
    /// Unacked deliveries the broker may push before waiting for settlements.
    pub prefetch: u16,
    /// Handlers running concurrently. More than `prefetch` never get work.
    pub workers: usize,
    /// What happens to a delivery whose handler failed.
    pub failure_policy: FailurePolicyKind,
    /// Requeues before a failing delivery is dead-lettered (requeue policy only).
    pub max_retries: u32,
    /// Exchange receiving rejected deliveries. Required by the requeue policy.
    pub dead_letter_exchange: Option<String>,
    /// First reconnect delay, in seconds.
    pub backoff_initial_secs: u64,
    /// Reconnect delay cap, in seconds.
    pub backoff_max_secs: u64,
    /// Upper bound on a single publish, in seconds.
    pub publish_timeout_secs: u64,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum FailurePolicyKind {
    /// Log the failure and ack the delivery.
    #[default]
    AckAndDrop,
    /// Reject with requeue until `max_retries`, then dead-letter.
    Requeue,
}

impl std::str::FromStr for FailurePolicyKind {
    type Err = EventBusError;

    fn from_str(value: &str) -> Result<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "ack-and-drop" | "ack_and_drop" | "drop" => Ok(Self::AckAndDrop),
            "requeue" => Ok(Self::Requeue),
            other => Err(EventBusError::Config(format!("unknown failure policy `{other}`"))),
        }
    }
}

impl Default for BackboneConfig {
    fn default() -> Self {
        Self {
            uri: String::new(),
            service_name: "service".to_string(),
            queue: None,
            prefetch: 10,
            workers: 1,
            failure_policy: FailurePolicyKind::AckAndDrop,
            max_retries: 3,
            dead_letter_exchange: None,
            backoff_initial_secs: 1,
            backoff_max_secs: 30,
            publish_timeout_secs: 5,
        }
    }
}

impl BackboneConfig {
    /// Load configuration from environment variables.
    pub fn from_env() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load configuration from any key lookup, e.g. a map in tests.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str| lookup(key).map(|v| v.trim().to_string()).filter(|v| !v.is_empty());
        let mut config = Self::default();

        if let Some(uri) = get(ENV_URI).or_else(|| get(ENV_URI_FALLBACK)) {
            config.uri = uri;
        }
        if let Some(name) = get("BACKBONE_SERVICE_NAME") {
            config.service_name = name;
        }
        config.queue = get("BACKBONE_QUEUE");
        config.dead_letter_exchange = get("BACKBONE_DEAD_LETTER_EXCHANGE");
        if let Some(value) = get("BACKBONE_PREFETCH") {
            config.prefetch = parse("BACKBONE_PREFETCH", &value)?;
        }
        if let Some(value) = get("BACKBONE_WORKERS") {
            config.workers = parse("BACKBONE_WORKERS", &value)?;
        }
        if let Some(value) = get("BACKBONE_FAILURE_POLICY") {
            config.failure_policy = value.parse()?;
        }
        if let Some(value) = get("BACKBONE_MAX_RETRIES") {
            config.max_retries = parse("BACKBONE_MAX_RETRIES", &value)?;
        }
        if let Some(value) = get("BACKBONE_BACKOFF_INITIAL_SECS") {
            config.backoff_initial_secs = parse("BACKBONE_BACKOFF_INITIAL_SECS", &value)?;
        }
        if let Some(value) = get("BACKBONE_BACKOFF_MAX_SECS") {
            config.backoff_max_secs = parse("BACKBONE_BACKOFF_MAX_SECS", &value)?;
        }
        if let Some(value) = get("BACKBONE_PUBLISH_TIMEOUT_SECS") {
            config.publish_timeout_secs = parse("BACKBONE_PUBLISH_TIMEOUT_SECS", &value)?;
        }

        config.validate()?;
        Ok(config)
    }

    pub fn is_enabled(&self) -> bool {
        !self.uri.trim().is_empty()
    }

    pub fn queue_name(&self) -> String {
        self.queue.clone().unwrap_or_else(|| format!("{}-events", self.service_name))
    }

    /// Topology builder preloaded with the service queue and, when
    /// configured, its dead-letter exchange. Add exchanges and bindings, then
    /// build.
    pub fn topology_builder(&self) -> TopologyBuilder {
        let builder = Topology::builder().queue(self.queue_name());
        match &self.dead_letter_exchange {
            Some(dlx) => builder.dead_letter(dlx.clone()),
            None => builder,
        }
    }

    pub fn backoff(&self) -> BackoffPolicy {
        BackoffPolicy::new(
            Duration::from_secs(self.backoff_initial_secs),
            Duration::from_secs(self.backoff_max_secs),
        )
    }

    pub fn publish_timeout(&self) -> Duration {
        Duration::from_secs(self.publish_timeout_secs)
    }

    pub fn failure_policy(&self) -> FailurePolicy {
        match self.failure_policy {
            FailurePolicyKind::AckAndDrop => FailurePolicy::AckAndDrop,
            FailurePolicyKind::Requeue => FailurePolicy::Requeue { max_retries: self.max_retries },
        }
    }

    /// Worker count clamped to `1..=prefetch`.
    pub fn consumer_options(&self) -> ConsumerOptions {
        ConsumerOptions {
            workers: self.workers.clamp(1, usize::from(self.prefetch.max(1))),
            failure_policy: self.failure_policy(),
        }
    }

    pub fn validate(&self) -> Result<()> {
        if self.prefetch == 0 {
            return Err(EventBusError::Config("prefetch must be at least 1".into()));
        }
        if self.backoff_initial_secs == 0 {
            return Err(EventBusError::Config("backoff initial delay must be at least 1s".into()));
        }
        if self.failure_policy == FailurePolicyKind::Requeue && self.dead_letter_exchange.is_none() {
            return Err(EventBusError::Config(
                "requeue failure policy needs BACKBONE_DEAD_LETTER_EXCHANGE".into(),
            ));
        }
        if self.service_name.trim().is_empty() {
            return Err(EventBusError::Config("service name must not be empty".into()));
        }
        Ok(())
    }
}

fn parse<T: std::str::FromStr>(key: &str, value: &str) -> Result<T> {
    value
        .parse()
        .map_err(|_| EventBusError::Config(format!("{key}: cannot parse `{value}`")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn load(vars: &[(&str, &str)]) -> Result<BackboneConfig> {
        let vars: HashMap<String, String> = vars.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect();
        BackboneConfig::from_lookup(|key| vars.get(key).cloned())
    }

    #[test]
    fn defaults_leave_the_backbone_disabled() {
        let config = load(&[]).unwrap();
        assert!(!config.is_enabled());
        assert_eq!(config.prefetch, 10);
        assert_eq!(config.backoff(), BackoffPolicy::default());
        assert_eq!(config.publish_timeout(), Duration::from_secs(5));
        assert_eq!(config.failure_policy(), FailurePolicy::AckAndDrop);
    }

    #[test]
    fn primary_uri_wins_over_fallback() {
        let config = load(&[(ENV_URI, "amqp://primary"), (ENV_URI_FALLBACK, "amqp://fallback")]).unwrap();
        assert_eq!(config.uri, "amqp://primary");

        let config = load(&[(ENV_URI, "  "), (ENV_URI_FALLBACK, "amqp://fallback")]).unwrap();
        assert_eq!(config.uri, "amqp://fallback");
    }

    #[test]
    fn queue_name_defaults_from_service_name() {
        let config = load(&[("BACKBONE_SERVICE_NAME", "auth-service")]).unwrap();
        assert_eq!(config.queue_name(), "auth-service-events");
    }

    #[test]
    fn workers_are_clamped_to_prefetch() {
        let config = load(&[("BACKBONE_PREFETCH", "4"), ("BACKBONE_WORKERS", "16")]).unwrap();
        assert_eq!(config.consumer_options().workers, 4);

        let config = load(&[("BACKBONE_WORKERS", "0")]).unwrap();
        assert_eq!(config.consumer_options().workers, 1);
    }

    #[test]
    fn requeue_needs_a_dead_letter_exchange() {
        let err = load(&[("BACKBONE_FAILURE_POLICY", "requeue")]).unwrap_err();
        assert!(matches!(err, EventBusError::Config(_)));

        let config = load(&[
            ("BACKBONE_FAILURE_POLICY", "requeue"),
            ("BACKBONE_MAX_RETRIES", "5"),
            ("BACKBONE_DEAD_LETTER_EXCHANGE", "auth.dlx"),
        ])
        .unwrap();
        assert_eq!(config.failure_policy(), FailurePolicy::Requeue { max_retries: 5 });
    }

    #[test]
    fn topology_builder_carries_queue_and_dead_letter() {
        let config = load(&[("BACKBONE_SERVICE_NAME", "auth-service"), ("BACKBONE_DEAD_LETTER_EXCHANGE", "auth.dlx")])
            .unwrap();
        let topology = config
            .topology_builder()
            .topic_exchange("profile-events")
            .bind("profile-events", "profile.updated")
            .build()
            .unwrap();
        let queue = topology.primary_queue().unwrap();
        assert_eq!(queue.name, "auth-service-events");
        assert_eq!(queue.dead_letter_exchange.as_deref(), Some("auth.dlx"));
    }

    #[test]
    fn malformed_numbers_are_config_errors() {
        let err = load(&[("BACKBONE_PREFETCH", "ten")]).unwrap_err();
        assert!(err.to_string().contains("BACKBONE_PREFETCH"));
        assert!(err.is_fatal());
    }
}
