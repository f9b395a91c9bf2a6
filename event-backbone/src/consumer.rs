//! Consumer dispatch loop.
//!
//! One task per service drains the QoS-bounded delivery stream of the service
//! queue, resolves a handler by routing key and settles each delivery
//! according to the queue's [`FailurePolicy`]. When the stream ends the task
//! asks the supervisor for a fresh channel and resubscribes; it only exits on
//! shutdown.

use std::collections::hash_map::DefaultHasher;
use std::future::Future;
use std::hash::{Hash, Hasher};
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use futures::{FutureExt, StreamExt};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::Semaphore;
use tokio::task::{JoinError, JoinHandle, JoinSet};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::broker::{Delivery, DeliveryStream};
use crate::envelope::EnvelopeHeader;
use crate::error::{EventBusError, Result};
use crate::handlers::HandlerRegistry;
use crate::supervisor::{ChannelHandle, ConnectionState, ConnectionSupervisor, Settlement};

/// Upper bound on tracked failing messages before the ledger is reset.
const RETRY_LEDGER_CAPACITY: usize = 10_000;

/// What happens to a delivery whose handler returned an error.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "policy", rename_all = "kebab-case")]
pub enum FailurePolicy {
    /// Log and ack. The event is lost.
    #[default]
    AckAndDrop,
    /// Reject with requeue up to `max_retries` times, then reject without
    /// requeue so the broker dead-letters it. Needs a dead-letter exchange on
    /// the queue.
    Requeue { max_retries: u32 },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConsumerOptions {
    /// Concurrent handler invocations. 1 keeps completion order; values above
    /// the prefetch are clamped to it.
    pub workers: usize,
    pub failure_policy: FailurePolicy,
}

impl Default for ConsumerOptions {
    fn default() -> Self {
        Self { workers: 1, failure_policy: FailurePolicy::AckAndDrop }
    }
}

pub struct EventConsumer {
    supervisor: Option<ConnectionSupervisor>,
    options: ConsumerOptions,
    shutdown: CancellationToken,
    task: Mutex<Option<JoinHandle<()>>>,
    started: AtomicBool,
    closed: AtomicBool,
}

impl EventConsumer {
    pub fn new(supervisor: ConnectionSupervisor, options: ConsumerOptions) -> Self {
        Self {
            supervisor: Some(supervisor),
            options,
            shutdown: CancellationToken::new(),
            task: Mutex::new(None),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    /// A consumer for services running without a broker. `start` does nothing.
    pub fn disabled() -> Self {
        Self {
            supervisor: None,
            options: ConsumerOptions::default(),
            shutdown: CancellationToken::new(),
            task: Mutex::new(None),
            started: AtomicBool::new(false),
            closed: AtomicBool::new(false),
        }
    }

    pub fn is_enabled(&self) -> bool {
        self.supervisor.is_some()
    }

    pub fn is_running(&self) -> bool {
        self.task.lock().as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Set QoS, subscribe to the service queue and spawn the dispatch task.
    ///
    /// Errors from the first subscription are returned; later ones are
    /// recovered from in the background.
    pub async fn start(&self, prefetch: u16, handlers: HandlerRegistry) -> Result<()> {
        let Some(supervisor) = &self.supervisor else {
            info!("Event consumer disabled, no broker configured");
            return Ok(());
        };
        if self.closed.load(Ordering::SeqCst) {
            return Err(EventBusError::Closed);
        }
        if prefetch == 0 {
            return Err(EventBusError::Config("prefetch must be at least 1".into()));
        }
        let queue = supervisor
            .topology()
            .primary_queue()
            .ok_or_else(|| EventBusError::Config("topology has no service queue to consume".into()))?;
        if matches!(self.options.failure_policy, FailurePolicy::Requeue { .. }) && queue.dead_letter_exchange.is_none() {
            return Err(EventBusError::Config(format!(
                "requeue policy on {} needs a dead-letter exchange",
                queue.name
            )));
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(EventBusError::Config("consumer already started".into()));
        }

        let workers = self.options.workers.clamp(1, usize::from(prefetch));
        let dispatcher = Dispatcher {
            supervisor: supervisor.clone(),
            queue: queue.name.clone(),
            prefetch,
            workers,
            context: Arc::new(DispatchContext {
                registry: handlers,
                policy: self.options.failure_policy,
                retries: RetryLedger::default(),
            }),
            shutdown: self.shutdown.clone(),
        };

        let subscription = match dispatcher.subscribe().await {
            Ok(subscription) => subscription,
            Err(err) => {
                self.started.store(false, Ordering::SeqCst);
                return Err(err);
            }
        };
        info!(
            queue = %dispatcher.queue,
            prefetch,
            workers,
            policy = ?self.options.failure_policy,
            handlers = dispatcher.context.registry.len(),
            "Event consumer started"
        );

        *self.task.lock() = Some(tokio::spawn(dispatcher.run(subscription)));
        Ok(())
    }

    /// Stop dispatching, wait for in-flight handlers, then close channel and
    /// connection. Idempotent.
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.shutdown.cancel();

        let task = self.task.lock().take();
        if let Some(task) = task {
            if let Err(err) = task.await {
                warn!(error = %err, "Dispatch task exited abnormally");
            }
        }

        if let Some(supervisor) = &self.supervisor {
            supervisor.close().await?;
        }
        info!("Event consumer closed");
        Ok(())
    }
}

impl std::fmt::Debug for EventConsumer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventConsumer")
            .field("enabled", &self.is_enabled())
            .field("options", &self.options)
            .field("running", &self.is_running())
            .finish()
    }
}

struct DispatchContext {
    registry: HandlerRegistry,
    policy: FailurePolicy,
    retries: RetryLedger,
}

struct Dispatcher {
    supervisor: ConnectionSupervisor,
    queue: String,
    prefetch: u16,
    workers: usize,
    context: Arc<DispatchContext>,
    shutdown: CancellationToken,
}

impl Dispatcher {
    async fn subscribe(&self) -> Result<(ChannelHandle, DeliveryStream)> {
        let handle = self.supervisor.current_channel()?;
        handle.channel().set_prefetch(self.prefetch).await?;
        let consumer_tag = format!("{}-{}", self.queue, Uuid::new_v4());
        let stream = handle.channel().consume(&self.queue, &consumer_tag).await?;
        debug!(queue = %self.queue, consumer_tag = %consumer_tag, generation = handle.generation(), "Subscribed");
        Ok((handle, stream))
    }

    /// Wait for a channel newer than `stale` and subscribe on it. `None` on
    /// shutdown.
    async fn resubscribe(&self, mut stale: u64) -> Option<(ChannelHandle, DeliveryStream)> {
        let mut status = self.supervisor.subscribe_status();
        loop {
            tokio::select! {
                biased;
                () = self.shutdown.cancelled() => return None,
                ready = async {
                    status
                        .wait_for(|s| s.state == ConnectionState::Connected && s.generation > stale)
                        .await
                        .map(|_| ())
                } => {
                    if ready.is_err() {
                        return None;
                    }
                }
            }

            match self.subscribe().await {
                Ok(subscription) => {
                    info!(queue = %self.queue, generation = subscription.0.generation(), "Consumer resubscribed");
                    return Some(subscription);
                }
                Err(err) => {
                    stale = self.supervisor.status().generation;
                    warn!(queue = %self.queue, generation = stale, error = %err, "Resubscribe failed, waiting for a new channel");
                    self.supervisor.request_recovery(stale);
                }
            }
        }
    }

    async fn run(self, first: (ChannelHandle, DeliveryStream)) {
        let permits = Arc::new(Semaphore::new(self.workers));
        let mut in_flight = JoinSet::new();
        let mut subscription = Some(first);
        let mut stale = 0;

        'subscriptions: loop {
            let (handle, mut stream) = match subscription.take() {
                Some(subscription) => subscription,
                None => match self.resubscribe(stale).await {
                    Some(subscription) => subscription,
                    None => break 'subscriptions,
                },
            };
            let generation = handle.generation();

            loop {
                let permit = tokio::select! {
                    biased;
                    () = self.shutdown.cancelled() => break 'subscriptions,
                    Some(joined) = in_flight.join_next() => {
                        report_task(joined);
                        continue;
                    }
                    permit = Arc::clone(&permits).acquire_owned() => match permit {
                        Ok(permit) => permit,
                        Err(_) => break 'subscriptions,
                    },
                };

                let next = tokio::select! {
                    biased;
                    () = self.shutdown.cancelled() => break 'subscriptions,
                    next = stream.next() => next,
                };

                match next {
                    Some(Ok(delivery)) => {
                        let context = Arc::clone(&self.context);
                        let handle = handle.clone();
                        in_flight.spawn(async move {
                            process(&context, &handle, delivery).await;
                            drop(permit);
                        });
                    }
                    Some(Err(err)) => {
                        warn!(queue = %self.queue, generation, error = %err, "Delivery stream failed, requesting recovery");
                        break;
                    }
                    None => {
                        warn!(queue = %self.queue, generation, "Delivery stream ended, requesting recovery");
                        break;
                    }
                }
            }

            stale = generation;
            self.supervisor.request_recovery(generation);
        }

        if !in_flight.is_empty() {
            info!(in_flight = in_flight.len(), "Waiting for in-flight handlers");
        }
        while let Some(joined) = in_flight.join_next().await {
            report_task(joined);
        }
        debug!(queue = %self.queue, "Dispatch loop stopped");
    }
}

fn report_task(joined: std::result::Result<(), JoinError>) {
    if let Err(err) = joined {
        if err.is_panic() {
            error!(error = %err, "Dispatch task panicked, delivery left unsettled");
        }
    }
}

/// Run a handler future, turning a panic into a handler error so the
/// delivery is still settled by the failure policy.
async fn guarded(call: impl Future<Output = Result<()>>) -> Result<()> {
    match AssertUnwindSafe(call).catch_unwind().await {
        Ok(outcome) => outcome,
        Err(panic) => {
            let message = panic
                .downcast_ref::<&str>()
                .map(|message| (*message).to_string())
                .or_else(|| panic.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "non-string panic payload".to_string());
            Err(EventBusError::Handler(anyhow::anyhow!("handler panicked: {message}")))
        }
    }
}

async fn process(context: &DispatchContext, handle: &ChannelHandle, delivery: Delivery) {
    let settlement = match context.registry.resolve(&delivery.routing_key) {
        None => {
            let header = EnvelopeHeader::peek(&delivery.body).unwrap_or_default();
            warn!(
                exchange = %delivery.exchange,
                routing_key = %delivery.routing_key,
                event_id = ?header.id,
                "No handler registered, dropping delivery"
            );
            Settlement::Ack
        }
        Some(handler) => match guarded(handler.handle(&delivery)).await {
            Ok(()) => {
                context.retries.forget(&delivery);
                debug!(routing_key = %delivery.routing_key, "Event handled");
                Settlement::Ack
            }
            Err(err) if err.is_permanent() => {
                context.retries.forget(&delivery);
                error!(
                    exchange = %delivery.exchange,
                    routing_key = %delivery.routing_key,
                    error = %err,
                    "Malformed delivery dropped"
                );
                Settlement::Ack
            }
            Err(err) => context.on_failure(&delivery, &err),
        },
    };

    if !handle.is_open() {
        debug!(
            routing_key = %delivery.routing_key,
            generation = handle.generation(),
            "Channel replaced before settlement, broker will redeliver"
        );
        return;
    }
    let routing_key = delivery.routing_key.clone();
    if let Err(err) = handle.settle(delivery, settlement).await {
        warn!(routing_key = %routing_key, settlement = ?settlement, error = %err, "Failed to settle delivery");
    }
}

impl DispatchContext {
    fn on_failure(&self, delivery: &Delivery, err: &EventBusError) -> Settlement {
        match self.policy {
            FailurePolicy::AckAndDrop => {
                error!(
                    exchange = %delivery.exchange,
                    routing_key = %delivery.routing_key,
                    error = %err,
                    "Event handler failed, dropping delivery"
                );
                Settlement::Ack
            }
            FailurePolicy::Requeue { max_retries } => {
                let failures = self.retries.record(delivery);
                if failures <= max_retries {
                    warn!(
                        routing_key = %delivery.routing_key,
                        failures,
                        max_retries,
                        error = %err,
                        "Event handler failed, requeueing"
                    );
                    Settlement::Reject { requeue: true }
                } else {
                    self.retries.forget(delivery);
                    error!(
                        routing_key = %delivery.routing_key,
                        failures,
                        error = %err,
                        "Retries exhausted, dead-lettering delivery"
                    );
                    Settlement::Reject { requeue: false }
                }
            }
        }
    }
}

/// Failure counts per message, for brokers that do not report
/// `x-delivery-count`.
#[derive(Default)]
struct RetryLedger {
    failures: DashMap<String, u32>,
}

impl RetryLedger {
    /// Record one more failure and return the failure count so far.
    fn record(&self, delivery: &Delivery) -> u32 {
        if let Some(previous) = delivery.delivery_count {
            return previous.saturating_add(1);
        }
        if self.failures.len() >= RETRY_LEDGER_CAPACITY {
            warn!(tracked = self.failures.len(), "Retry ledger full, resetting");
            self.failures.clear();
        }
        let mut count = self.failures.entry(Self::key(delivery)).or_insert(0);
        *count = count.saturating_add(1);
        *count
    }

    /// Drop the entry for a settled message. Brokers may start reporting
    /// `x-delivery-count` only from the first redelivery, so the entry is
    /// removed whether or not this delivery carries one.
    fn forget(&self, delivery: &Delivery) {
        self.failures.remove(&Self::key(delivery));
    }

    fn key(delivery: &Delivery) -> String {
        match &delivery.message_id {
            Some(id) => id.clone(),
            None => {
                let mut hasher = DefaultHasher::new();
                delivery.exchange.hash(&mut hasher);
                delivery.routing_key.hash(&mut hasher);
                delivery.body.hash(&mut hasher);
                format!("{}:{:016x}", delivery.routing_key, hasher.finish())
            }
        }
    }
}
