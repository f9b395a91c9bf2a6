//! Broker connection supervisor.
//!
//! Owns the single connection and channel of a service process. A background
//! monitor reacts to close notifications: a closed channel on a healthy
//! connection is reopened in place, a closed connection triggers a full
//! reconnect with exponential backoff. Topology is redeclared on every new
//! channel.
//!
//! The current channel is only reachable through [`ConnectionSupervisor::current_channel`],
//! which fails fast while no healthy channel exists.

use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::backoff::BackoffPolicy;
use crate::broker::{BrokerChannel, BrokerConnection, Connector, Delivery, LinkEvent, OutgoingMessage};
use crate::error::{EventBusError, Result};
use crate::topology::{declare_topology, Topology};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ConnectionState {
    /// No connection, either before the first dial or after close.
    Disconnected,
    /// First connection attempt in progress.
    Connecting,
    /// Connection and channel are up and topology is declared.
    Connected,
    /// Link lost; the monitor is reopening the channel or redialing.
    Reconnecting,
}

impl fmt::Display for ConnectionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Disconnected => "disconnected",
            Self::Connecting => "connecting",
            Self::Connected => "connected",
            Self::Reconnecting => "reconnecting",
        };
        f.write_str(name)
    }
}

/// Observable link state. `generation` is the most recent channel generation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct LinkStatus {
    pub state: ConnectionState,
    /// Increases every time a channel is opened.
    pub generation: u64,
}

/// How a delivery is finished.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Settlement {
    Ack,
    Reject { requeue: bool },
}

/// A channel together with its generation.
///
/// Publishes and settlements through the handle are serialized by one lock
/// shared by every handle of the supervisor.
#[derive(Clone)]
pub struct ChannelHandle {
    generation: u64,
    channel: Arc<dyn BrokerChannel>,
    writes: Arc<tokio::sync::Mutex<()>>,
}

impl ChannelHandle {
    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Raw channel for non-write operations (QoS, consume).
    pub fn channel(&self) -> &Arc<dyn BrokerChannel> {
        &self.channel
    }

    pub fn is_open(&self) -> bool {
        self.channel.is_open()
    }

    pub async fn publish(&self, message: OutgoingMessage) -> Result<()> {
        let _guard = self.writes.lock().await;
        self.channel.publish(message).await
    }

    pub async fn settle(&self, delivery: Delivery, settlement: Settlement) -> Result<()> {
        let _guard = self.writes.lock().await;
        match settlement {
            Settlement::Ack => delivery.ack().await,
            Settlement::Reject { requeue } => delivery.reject(requeue).await,
        }
    }
}

impl fmt::Debug for ChannelHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ChannelHandle")
            .field("generation", &self.generation)
            .field("open", &self.channel.is_open())
            .finish()
    }
}

struct Link {
    connection_id: u64,
    connection: Arc<dyn BrokerConnection>,
    channel: Option<ChannelHandle>,
}

struct Inner {
    uri: String,
    connector: Arc<dyn Connector>,
    topology: Topology,
    backoff: BackoffPolicy,
    current: RwLock<Option<Link>>,
    status: watch::Sender<LinkStatus>,
    next_generation: AtomicU64,
    next_connection_id: AtomicU64,
    events: mpsc::UnboundedSender<LinkEvent>,
    writes: Arc<tokio::sync::Mutex<()>>,
    shutdown: CancellationToken,
    monitor: Mutex<Option<JoinHandle<()>>>,
    closed: AtomicBool,
}

#[derive(Clone)]
pub struct ConnectionSupervisor {
    inner: Arc<Inner>,
}

impl ConnectionSupervisor {
    /// Dial, open a channel and declare `topology`.
    ///
    /// Any failure here is returned to the caller; retries only happen once
    /// the first connection has been established.
    pub async fn connect(
        uri: impl Into<String>,
        connector: Arc<dyn Connector>,
        topology: Topology,
        backoff: BackoffPolicy,
    ) -> Result<Self> {
        let (events, events_rx) = mpsc::unbounded_channel();
        let (status, _) = watch::channel(LinkStatus { state: ConnectionState::Disconnected, generation: 0 });

        let inner = Arc::new(Inner {
            uri: uri.into(),
            connector,
            topology,
            backoff: backoff.normalized(),
            current: RwLock::new(None),
            status,
            next_generation: AtomicU64::new(0),
            next_connection_id: AtomicU64::new(0),
            events,
            writes: Arc::new(tokio::sync::Mutex::new(())),
            shutdown: CancellationToken::new(),
            monitor: Mutex::new(None),
            closed: AtomicBool::new(false),
        });

        inner.set_state(ConnectionState::Connecting);
        if let Err(err) = inner.establish().await {
            inner.set_state(ConnectionState::Disconnected);
            error!(error = %err, "Initial broker connection failed");
            return Err(err);
        }
        info!(generation = inner.status.borrow().generation, "Connected to broker");

        let monitor = tokio::spawn(Inner::monitor(Arc::clone(&inner), events_rx));
        *inner.monitor.lock() = Some(monitor);

        Ok(Self { inner })
    }

    /// The current healthy channel, or [`EventBusError::ConnectionUnavailable`].
    pub fn current_channel(&self) -> Result<ChannelHandle> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Err(EventBusError::Closed);
        }
        self.inner
            .current
            .read()
            .as_ref()
            .and_then(|link| link.channel.clone())
            .filter(ChannelHandle::is_open)
            .ok_or(EventBusError::ConnectionUnavailable)
    }

    pub fn status(&self) -> LinkStatus {
        *self.inner.status.borrow()
    }

    pub fn state(&self) -> ConnectionState {
        self.status().state
    }

    pub fn subscribe_status(&self) -> watch::Receiver<LinkStatus> {
        self.inner.status.subscribe()
    }

    pub fn topology(&self) -> &Topology {
        &self.inner.topology
    }

    pub fn is_closed(&self) -> bool {
        self.inner.closed.load(Ordering::SeqCst)
    }

    /// Ask the monitor to replace the channel of `generation`, e.g. after its
    /// delivery stream ended. Ignored if that channel was already replaced.
    pub fn request_recovery(&self, generation: u64) {
        if self.inner.events.send(LinkEvent::ConsumerCancelled { generation }).is_err() {
            debug!(generation, "Recovery requested after monitor exit");
        }
    }

    /// Stop the monitor and close channel and connection. Idempotent.
    pub async fn close(&self) -> Result<()> {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        self.inner.shutdown.cancel();

        let monitor = self.inner.monitor.lock().take();
        if let Some(monitor) = monitor {
            if let Err(err) = monitor.await {
                warn!(error = %err, "Connection monitor exited abnormally");
            }
        }

        let link = self.inner.current.write().take();
        self.inner.set_state(ConnectionState::Disconnected);

        if let Some(link) = link {
            if let Some(handle) = link.channel {
                if let Err(err) = handle.channel.close().await {
                    debug!(error = %err, "Channel close failed");
                }
            }
            link.connection.close().await?;
        }
        info!("Broker connection closed");
        Ok(())
    }
}

impl fmt::Debug for ConnectionSupervisor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ConnectionSupervisor")
            .field("status", &self.status())
            .field("closed", &self.is_closed())
            .finish_non_exhaustive()
    }
}

impl Inner {
    fn set_state(&self, state: ConnectionState) {
        self.status.send_modify(|status| status.state = state);
    }

    fn set_connected(&self, generation: u64) {
        self.status.send_replace(LinkStatus { state: ConnectionState::Connected, generation });
    }

    /// One connect attempt: dial, open a channel, declare topology, install.
    async fn establish(&self) -> Result<u64> {
        let connection_id = self.next_connection_id.fetch_add(1, Ordering::SeqCst) + 1;
        let connection = self
            .connector
            .connect(&self.uri, connection_id, self.events.clone())
            .await?;

        let handle = match self.open_declared_channel(connection.as_ref()).await {
            Ok(handle) => handle,
            Err(err) => {
                if let Err(close_err) = connection.close().await {
                    debug!(error = %close_err, "Closing half-open connection failed");
                }
                return Err(err);
            }
        };

        let generation = handle.generation;
        *self.current.write() = Some(Link { connection_id, connection, channel: Some(handle) });
        self.set_connected(generation);
        Ok(generation)
    }

    async fn open_declared_channel(&self, connection: &dyn BrokerConnection) -> Result<ChannelHandle> {
        let generation = self.next_generation.fetch_add(1, Ordering::SeqCst) + 1;
        let channel = connection.open_channel(generation, self.events.clone()).await?;
        if let Err(err) = declare_topology(channel.as_ref(), &self.topology).await {
            if let Err(close_err) = channel.close().await {
                debug!(error = %close_err, "Closing undeclared channel failed");
            }
            return Err(err);
        }
        Ok(ChannelHandle { generation, channel, writes: Arc::clone(&self.writes) })
    }

    fn is_current_connection(&self, connection_id: u64) -> bool {
        self.current
            .read()
            .as_ref()
            .is_some_and(|link| link.connection_id == connection_id)
    }

    fn is_current_generation(&self, generation: u64) -> bool {
        self.current
            .read()
            .as_ref()
            .and_then(|link| link.channel.as_ref())
            .is_some_and(|handle| handle.generation == generation)
    }

    async fn monitor(inner: Arc<Self>, mut events: mpsc::UnboundedReceiver<LinkEvent>) {
        loop {
            let event = tokio::select! {
                biased;
                () = inner.shutdown.cancelled() => break,
                event = events.recv() => match event {
                    Some(event) => event,
                    None => break,
                },
            };

            match event {
                LinkEvent::ConnectionClosed { connection_id, reason } => {
                    if !inner.is_current_connection(connection_id) {
                        debug!(connection_id, "Ignoring close of a replaced connection");
                        continue;
                    }
                    warn!(connection_id, reason = %reason, "Broker connection lost");
                    inner.drop_link().await;
                    inner.reconnect().await;
                }
                LinkEvent::ChannelClosed { generation, reason } => {
                    if !inner.is_current_generation(generation) {
                        debug!(generation, "Ignoring close of a replaced channel");
                        continue;
                    }
                    warn!(generation, reason = %reason, "Broker channel closed");
                    inner.reopen_channel().await;
                }
                LinkEvent::ConsumerCancelled { generation } => {
                    if !inner.is_current_generation(generation) {
                        debug!(generation, "Ignoring recovery request for a replaced channel");
                        continue;
                    }
                    warn!(generation, "Consumer cancelled, replacing channel");
                    inner.reopen_channel().await;
                }
            }
        }
        debug!("Connection monitor stopped");
    }

    /// Forget the current link and close whatever is left of it.
    async fn drop_link(&self) {
        let link = self.current.write().take();
        self.set_state(ConnectionState::Disconnected);
        if let Some(link) = link {
            if let Some(handle) = link.channel {
                if let Err(err) = handle.channel.close().await {
                    debug!(error = %err, "Closing retired channel failed");
                }
            }
            if let Err(err) = link.connection.close().await {
                debug!(error = %err, "Closing lost connection failed");
            }
        }
    }

    /// Retry [`Inner::establish`] with backoff until it succeeds or the
    /// supervisor shuts down.
    async fn reconnect(&self) {
        self.set_state(ConnectionState::Reconnecting);
        let mut backoff = self.backoff.start();

        loop {
            let delay = backoff.next_delay();
            debug!(delay = ?delay, attempt = backoff.attempts(), "Waiting before reconnect");
            tokio::select! {
                biased;
                () = self.shutdown.cancelled() => return,
                () = tokio::time::sleep(delay) => {}
            }

            let attempt = tokio::select! {
                biased;
                () = self.shutdown.cancelled() => return,
                attempt = self.establish() => attempt,
            };

            match attempt {
                Ok(generation) => {
                    info!(generation, attempts = backoff.attempts(), "Reconnected to broker");
                    return;
                }
                Err(err) if err.is_fatal() => {
                    error!(error = %err, attempt = backoff.attempts(), "Topology rejected during reconnect, retrying");
                }
                Err(err) => {
                    warn!(
                        error = %err,
                        attempt = backoff.attempts(),
                        next_delay = ?backoff.peek(),
                        "Reconnect attempt failed"
                    );
                }
            }
        }
    }

    /// Replace the channel on the current connection. Falls back to a full
    /// reconnect when the connection is gone or the new channel fails.
    async fn reopen_channel(&self) {
        let retired = {
            let mut current = self.current.write();
            current
                .as_mut()
                .map(|link| (link.connection_id, Arc::clone(&link.connection), link.channel.take()))
        };
        let Some((connection_id, connection, old_channel)) = retired else {
            self.reconnect().await;
            return;
        };

        self.set_state(ConnectionState::Reconnecting);
        if let Some(handle) = old_channel {
            if let Err(err) = handle.channel.close().await {
                debug!(error = %err, "Closing retired channel failed");
            }
        }

        if connection.is_open() {
            let reopened = tokio::select! {
                biased;
                () = self.shutdown.cancelled() => return,
                reopened = self.open_declared_channel(connection.as_ref()) => reopened,
            };
            match reopened {
                Ok(handle) => {
                    let generation = handle.generation;
                    let installed = {
                        let mut current = self.current.write();
                        match current.as_mut() {
                            Some(link) if link.connection_id == connection_id => {
                                link.channel = Some(handle);
                                true
                            }
                            _ => false,
                        }
                    };
                    if installed {
                        self.set_connected(generation);
                        info!(generation, "Broker channel reopened");
                        return;
                    }
                }
                Err(err) => {
                    warn!(error = %err, "Channel reopen failed, escalating to full reconnect");
                }
            }
        }

        self.drop_link().await;
        self.reconnect().await;
    }
}
