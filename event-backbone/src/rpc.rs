//! Request/response over pub/sub.
//!
//! The requester publishes an event carrying a `request_id` and waits for a
//! response event with the same `request_id` on a routing key its own queue
//! is bound to. Waits always have a deadline.

use std::sync::Arc;
use std::time::Duration;

use dashmap::DashMap;
use serde::{de::DeserializeOwned, Serialize};
use tokio::sync::oneshot;
use tracing::{debug, warn};

use crate::envelope::decode_payload;
use crate::error::{EventBusError, Result};
use crate::handlers::{EventHandler, HandlerRegistry};
use crate::publisher::EventPublisher;

pub const DEFAULT_RESPONSE_TIMEOUT: Duration = Duration::from_secs(10);

/// Payloads that carry a correlation ID.
pub trait Correlated {
    fn request_id(&self) -> &str;
}

/// Outstanding requests keyed by `request_id`.
pub struct PendingResponses<R> {
    waiters: Arc<DashMap<String, oneshot::Sender<R>>>,
}

impl<R> Clone for PendingResponses<R> {
    fn clone(&self) -> Self {
        Self { waiters: Arc::clone(&self.waiters) }
    }
}

impl<R> Default for PendingResponses<R> {
    fn default() -> Self {
        Self { waiters: Arc::new(DashMap::new()) }
    }
}

impl<R: Send + 'static> PendingResponses<R> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Start waiting for `request_id`. Register before publishing the request
    /// so a fast response cannot be missed.
    pub fn register(&self, request_id: impl Into<String>) -> ResponseWaiter<R> {
        let request_id = request_id.into();
        let (tx, rx) = oneshot::channel();
        if self.waiters.insert(request_id.clone(), tx).is_some() {
            warn!(request_id = %request_id, "Replacing an outstanding waiter");
        }
        ResponseWaiter { request_id, rx, waiters: Arc::clone(&self.waiters) }
    }

    /// Hand `response` to its waiter. Returns `false` for unknown, expired or
    /// duplicate responses.
    pub fn complete(&self, request_id: &str, response: R) -> bool {
        match self.waiters.remove(request_id) {
            Some((_, tx)) => tx.send(response).is_ok(),
            None => {
                debug!(request_id = %request_id, "No waiter for response");
                false
            }
        }
    }

    pub fn pending(&self) -> usize {
        self.waiters.len()
    }
}

impl<R> PendingResponses<R>
where
    R: Correlated + DeserializeOwned + Send + 'static,
{
    /// Handler to register under the response routing key.
    pub fn handler(&self) -> Arc<dyn EventHandler> {
        Arc::new(ResponseHandler { pending: self.clone() })
    }

    /// Register this correlator's handler in `registry`.
    pub fn install(&self, registry: HandlerRegistry, routing_key: &str) -> HandlerRegistry {
        registry.register(routing_key, self.handler())
    }

    /// Register, publish the request and wait for the matching response.
    pub async fn call<P: Serialize>(
        &self,
        publisher: &EventPublisher,
        exchange: &str,
        routing_key: &str,
        request_id: &str,
        request: P,
        timeout: Duration,
    ) -> Result<R> {
        let waiter = self.register(request_id);
        publisher.publish_event(exchange, routing_key, request).await?;
        waiter.wait(timeout).await
    }
}

struct ResponseHandler<R> {
    pending: PendingResponses<R>,
}

#[async_trait::async_trait]
impl<R> EventHandler for ResponseHandler<R>
where
    R: Correlated + DeserializeOwned + Send + 'static,
{
    async fn handle(&self, delivery: &crate::broker::Delivery) -> Result<()> {
        let response: R = decode_payload(&delivery.body)?;
        let request_id = response.request_id().to_string();
        if !self.pending.complete(&request_id, response) {
            debug!(request_id = %request_id, routing_key = %delivery.routing_key, "Dropping uncorrelated response");
        }
        Ok(())
    }
}

/// One outstanding request. Dropping it cancels the wait.
pub struct ResponseWaiter<R> {
    request_id: String,
    rx: oneshot::Receiver<R>,
    waiters: Arc<DashMap<String, oneshot::Sender<R>>>,
}

impl<R> ResponseWaiter<R> {
    pub fn request_id(&self) -> &str {
        &self.request_id
    }

    /// Wait up to `timeout`, then fail with [`EventBusError::ResponseTimeout`].
    pub async fn wait(mut self, timeout: Duration) -> Result<R> {
        match tokio::time::timeout(timeout, &mut self.rx).await {
            Ok(Ok(response)) => Ok(response),
            Ok(Err(_)) => Err(EventBusError::Closed),
            Err(_) => {
                warn!(request_id = %self.request_id, timeout = ?timeout, "Response wait timed out");
                Err(EventBusError::ResponseTimeout(self.request_id.clone()))
            }
        }
    }
}

impl<R> Drop for ResponseWaiter<R> {
    fn drop(&mut self) {
        self.waiters.remove(&self.request_id);
    }
}
