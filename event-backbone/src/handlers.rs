//! Routing-key handler registry.

use std::collections::BTreeMap;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;

use crate::broker::Delivery;
use crate::error::{EventBusError, Result};

/// Business logic for one routing key.
///
/// Handlers receive the raw delivery body and decode it themselves. Returning
/// an error hands the delivery to the queue's failure policy; permanent errors
/// (malformed payloads) are always dropped.
#[async_trait]
pub trait EventHandler: Send + Sync + 'static {
    async fn handle(&self, delivery: &Delivery) -> Result<()>;
}

struct FnHandler<F> {
    handler: F,
}

#[async_trait]
impl<F, Fut> EventHandler for FnHandler<F>
where
    F: Fn(Vec<u8>) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = Result<()>> + Send + 'static,
{
    async fn handle(&self, delivery: &Delivery) -> Result<()> {
        (self.handler)(delivery.body.clone()).await
    }
}

/// Routing key to handler map. One handler per key; later registrations
/// replace earlier ones.
#[derive(Clone, Default)]
pub struct HandlerRegistry {
    handlers: BTreeMap<String, Arc<dyn EventHandler>>,
    fallback: Option<Arc<dyn EventHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(mut self, routing_key: impl Into<String>, handler: Arc<dyn EventHandler>) -> Self {
        self.handlers.insert(routing_key.into(), handler);
        self
    }

    /// Register an async closure over the delivery body.
    pub fn register_fn<F, Fut>(self, routing_key: impl Into<String>, handler: F) -> Self
    where
        F: Fn(Vec<u8>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.register(routing_key, Arc::new(FnHandler { handler }))
    }

    /// Handler for deliveries no registered key matches. Without one they
    /// are acked and dropped.
    pub fn fallback_fn<F, Fut>(mut self, handler: F) -> Self
    where
        F: Fn(Vec<u8>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        self.fallback = Some(Arc::new(FnHandler { handler }));
        self
    }

    pub fn resolve(&self, routing_key: &str) -> Option<Arc<dyn EventHandler>> {
        self.handlers.get(routing_key).or(self.fallback.as_ref()).cloned()
    }

    pub fn routing_keys(&self) -> impl Iterator<Item = &str> {
        self.handlers.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

impl std::fmt::Debug for HandlerRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HandlerRegistry")
            .field("routing_keys", &self.handlers.keys().collect::<Vec<_>>())
            .field("fallback", &self.fallback.is_some())
            .finish()
    }
}

/// Bound a downstream call. Elapsed deadlines become
/// [`EventBusError::HandlerTimeout`], which the failure policy treats like any
/// other handler error.
pub async fn with_deadline<T, F>(deadline: Duration, call: F) -> Result<T>
where
    F: Future<Output = Result<T>>,
{
    tokio::time::timeout(deadline, call)
        .await
        .map_err(|_| EventBusError::HandlerTimeout(deadline))?
}
