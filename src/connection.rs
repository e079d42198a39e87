//! Connection actor - keeps one authenticated stream to one host
//!
//! ## State machine
//!
//! ```text
//!                 enable / reconnect timer
//! Disconnected ───────────────────────────▶ Connecting
//!      ▲  ▲                                     │ transport open (auth frame sent)
//!      │  └──────────── transport error ────────┤
//!      │                                        ▼
//!      │◀─── error / close / auth rejected ─ Authenticating
//!      │                                        │ auth ack or first metrics
//!      │                                        ▼
//!      └────────── error / close ────────── Connected
//! ```
//!
//! Every entry into `Disconnected` while the connection is enabled arms a single
//! reconnect timer. `disable` disarms it and aborts the transport task before
//! it acknowledges.
//!
//! Each connection attempt runs its transport in a separate task. Events from
//! that task are tagged with the attempt's generation so events from a transport
//! that has already been torn down are ignored.
//!
//! Transitions, snapshots and forwarded messages go out on one broadcast as
//! [`ConnectionEvent`]s, in the order the actor handled them.

use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::{Sleep, sleep};
use tracing::{debug, error, info, instrument, trace, warn};

use crate::SystemMetrics;
use crate::config::{HostTarget, LinkConfig};
use crate::protocol::{ForwardedMessage, Inbound, Outbound};
use crate::store::MetricsStore;
use crate::transport::{Connector, Transport};

/// Lifecycle state of a connection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Authenticating,
    Connected,
}

impl ConnectionState {
    /// Whether `self → next` is an edge of the state machine
    pub fn can_transition_to(&self, next: ConnectionState) -> bool {
        use ConnectionState::*;

        matches!(
            (self, next),
            (Disconnected, Connecting)
                | (Connecting, Authenticating)
                | (Connecting, Disconnected)
                | (Authenticating, Connected)
                | (Authenticating, Disconnected)
                | (Connected, Disconnected)
        )
    }

    pub fn is_live(&self) -> bool {
        !matches!(self, ConnectionState::Disconnected)
    }
}

/// Snapshot of a connection's state machine
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionStatus {
    pub state: ConnectionState,

    /// Reconnect attempts since the last successful authentication
    pub reconnect_attempt: u32,

    pub enabled: bool,
}

impl Default for ConnectionStatus {
    fn default() -> Self {
        Self {
            state: ConnectionState::Disconnected,
            reconnect_attempt: 0,
            enabled: false,
        }
    }
}

/// Published on every state change
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StateTransition {
    pub from: ConnectionState,
    pub to: ConnectionState,
}

/// Published by a connection in handling order
#[derive(Debug, Clone)]
pub enum ConnectionEvent {
    Transition(StateTransition),

    /// A metrics frame, after it was written to the store
    Snapshot(Arc<SystemMetrics>),

    /// An inbound message that is neither `auth` nor `metrics`
    Message(ForwardedMessage),
}

/// Commands that can be sent to a connection actor
#[derive(Debug)]
enum ConnectionCommand {
    /// Start connecting unless already live
    Enable { respond_to: oneshot::Sender<()> },

    /// Disarm the reconnect timer and drop the transport
    Disable { respond_to: oneshot::Sender<()> },

    /// Forward an encoded frame if connected, drop it otherwise
    Send { frame: String },

    /// Swap the target; restarts the handshake if the endpoint changed
    UpdateTarget {
        target: HostTarget,
        respond_to: oneshot::Sender<()>,
    },

    /// Disable and stop the actor
    Shutdown { respond_to: oneshot::Sender<()> },
}

#[derive(Debug)]
enum TransportEvent {
    Opened,
    Frame(String),
    Closed,
    Failed(String),
}

#[derive(Debug)]
struct TaggedEvent {
    generation: u64,
    event: TransportEvent,
}

/// Transport task of the current attempt
struct ActiveTransport {
    outbound: mpsc::UnboundedSender<String>,
    task: JoinHandle<()>,
}

/// Actor owning the state machine of a single host connection
struct ConnectionActor {
    target: HostTarget,
    connector: Arc<dyn Connector>,
    store: MetricsStore,
    reconnect_delay: Duration,
    connect_timeout: Duration,

    command_rx: mpsc::Receiver<ConnectionCommand>,
    transport_tx: mpsc::UnboundedSender<TaggedEvent>,
    transport_rx: mpsc::UnboundedReceiver<TaggedEvent>,

    status_tx: watch::Sender<ConnectionStatus>,
    event_tx: broadcast::Sender<ConnectionEvent>,

    enabled: bool,
    state: ConnectionState,
    reconnect_attempt: u32,
    generation: u64,
    transport: Option<ActiveTransport>,

    /// The single armed reconnect timer, if any
    reconnect: Option<Pin<Box<Sleep>>>,
}

impl ConnectionActor {
    #[instrument(skip(self), fields(host = %self.target.id))]
    async fn run(mut self) {
        debug!("starting connection actor");

        self.store.set_online(&self.target.id, false).await;

        loop {
            tokio::select! {
                cmd = self.command_rx.recv() => {
                    match cmd {
                        Some(ConnectionCommand::Enable { respond_to }) => {
                            self.enable().await;
                            let _ = respond_to.send(());
                        }

                        Some(ConnectionCommand::Disable { respond_to }) => {
                            self.disable().await;
                            let _ = respond_to.send(());
                        }

                        Some(ConnectionCommand::Send { frame }) => {
                            self.send(frame);
                        }

                        Some(ConnectionCommand::UpdateTarget { target, respond_to }) => {
                            self.update_target(target).await;
                            let _ = respond_to.send(());
                        }

                        Some(ConnectionCommand::Shutdown { respond_to }) => {
                            debug!("received shutdown command");
                            self.disable().await;
                            let _ = respond_to.send(());
                            break;
                        }

                        None => {
                            warn!("command channel closed, shutting down");
                            self.disable().await;
                            break;
                        }
                    }
                }

                Some(TaggedEvent { generation, event }) = self.transport_rx.recv() => {
                    if generation != self.generation {
                        trace!("ignoring event of stale transport #{generation}: {event:?}");
                        continue;
                    }
                    self.handle_transport_event(event).await;
                }

                _ = armed(&mut self.reconnect) => {
                    self.reconnect = None;
                    if self.enabled && self.state == ConnectionState::Disconnected {
                        debug!("reconnect timer fired (attempt {})", self.reconnect_attempt);
                        self.open().await;
                    }
                }
            }
        }

        debug!("connection actor stopped");
    }

    async fn enable(&mut self) {
        self.enabled = true;

        if self.state.is_live() {
            trace!("enable ignored, already {:?}", self.state);
            self.publish_status();
            return;
        }

        // connect now instead of waiting for a pending timer
        self.reconnect = None;
        self.open().await;
    }

    async fn disable(&mut self) {
        self.enabled = false;
        self.reconnect = None;
        self.close_transport();
        self.transition(ConnectionState::Disconnected).await;
        self.publish_status();
    }

    async fn update_target(&mut self, target: HostTarget) {
        if !self.target.endpoint_differs(&target) {
            self.target = target;
            return;
        }

        info!("endpoint of {} changed to {}", self.target.display_name(), target.url());

        let was_enabled = self.enabled;
        self.disable().await;
        self.target = target;
        self.reconnect_attempt = 0;

        if was_enabled {
            self.enable().await;
        } else {
            self.publish_status();
        }
    }

    fn send(&mut self, frame: String) {
        if self.state != ConnectionState::Connected {
            debug!("not connected ({:?}), dropping outbound frame", self.state);
            return;
        }

        match &self.transport {
            Some(transport) if transport.outbound.send(frame).is_ok() => {}
            _ => debug!("transport gone, dropping outbound frame"),
        }
    }

    /// Start a new transport attempt
    async fn open(&mut self) {
        self.close_transport();

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let task = tokio::spawn(run_transport(
            self.connector.clone(),
            self.target.clone(),
            self.connect_timeout,
            self.generation,
            self.transport_tx.clone(),
            outbound_rx,
        ));

        self.transport = Some(ActiveTransport {
            outbound: outbound_tx,
            task,
        });

        info!("connecting to {} ({})", self.target.display_name(), self.target.url());
        self.transition(ConnectionState::Connecting).await;
    }

    /// Abort the current transport task; its pending events become stale
    fn close_transport(&mut self) {
        if let Some(transport) = self.transport.take() {
            transport.task.abort();
        }
        self.generation += 1;
    }

    async fn handle_transport_event(&mut self, event: TransportEvent) {
        match event {
            TransportEvent::Opened => {
                if self.state != ConnectionState::Connecting {
                    return;
                }
                self.transition(ConnectionState::Authenticating).await;
                self.send_auth().await;
            }

            TransportEvent::Frame(text) => self.dispatch(&text).await,

            TransportEvent::Closed => {
                info!("connection to {} closed", self.target.display_name());
                self.lose_connection().await;
            }

            TransportEvent::Failed(reason) => {
                error!("connection to {} failed: {}", self.target.display_name(), reason);
                self.lose_connection().await;
            }
        }
    }

    async fn send_auth(&mut self) {
        let frame = match serde_json::to_string(&Outbound::auth(self.target.secret.clone())) {
            Ok(frame) => frame,
            Err(e) => {
                error!("failed to encode auth frame: {e}");
                self.lose_connection().await;
                return;
            }
        };

        match &self.transport {
            Some(transport) if transport.outbound.send(frame).is_ok() => {
                trace!("auth frame sent");
            }
            _ => self.lose_connection().await,
        }
    }

    async fn dispatch(&mut self, text: &str) {
        let inbound = match Inbound::parse(text) {
            Ok(inbound) => inbound,
            Err(e) => {
                warn!("dropping malformed frame: {e:#}");
                trace!("raw frame: {text}");
                return;
            }
        };

        match inbound {
            Inbound::Metrics(metrics) => {
                self.authenticated().await;
                trace!("received metrics at {}", metrics.timestamp);
                let snapshot = self.store.set_snapshot(&self.target.id, *metrics).await;
                self.publish(ConnectionEvent::Snapshot(snapshot));
            }

            Inbound::Auth { error: None } => {
                self.authenticated().await;
            }

            Inbound::Auth {
                error: Some(reason),
            } => {
                warn!("authentication to {} rejected: {}", self.target.display_name(), reason);
                self.lose_connection().await;
            }

            Inbound::Other { kind, message } => {
                trace!("forwarding {kind} message");
                self.publish(ConnectionEvent::Message(ForwardedMessage { kind, message }));
            }
        }
    }

    async fn authenticated(&mut self) {
        if self.state == ConnectionState::Authenticating {
            info!("authenticated to {}", self.target.display_name());
            self.transition(ConnectionState::Connected).await;
        }
    }

    /// Tear down the transport and arm the reconnect timer if still enabled
    async fn lose_connection(&mut self) {
        self.close_transport();
        self.transition(ConnectionState::Disconnected).await;

        if self.enabled && self.reconnect.is_none() {
            self.reconnect_attempt += 1;
            info!(
                "reconnecting to {} in {:?} (attempt {})",
                self.target.display_name(),
                self.reconnect_delay,
                self.reconnect_attempt
            );
            self.reconnect = Some(Box::pin(sleep(self.reconnect_delay)));
        }

        self.publish_status();
    }

    async fn transition(&mut self, next: ConnectionState) {
        let from = self.state;
        if from == next {
            return;
        }

        debug_assert!(from.can_transition_to(next), "illegal transition {from:?} -> {next:?}");
        debug!("{from:?} -> {next:?}");

        self.state = next;
        if next == ConnectionState::Connected {
            self.reconnect_attempt = 0;
        }

        self.store
            .set_online(&self.target.id, next == ConnectionState::Connected)
            .await;

        self.publish_status();
        self.publish(ConnectionEvent::Transition(StateTransition { from, to: next }));
    }

    fn publish(&self, event: ConnectionEvent) {
        // no listeners is fine
        let _ = self.event_tx.send(event);
    }

    fn publish_status(&self) {
        self.status_tx.send_replace(ConnectionStatus {
            state: self.state,
            reconnect_attempt: self.reconnect_attempt,
            enabled: self.enabled,
        });
    }
}

/// Resolves when the timer fires; never resolves while disarmed
async fn armed(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(timer) => timer.as_mut().await,
        None => std::future::pending().await,
    }
}

/// Body of one transport attempt: connect, then pump frames both ways
async fn run_transport(
    connector: Arc<dyn Connector>,
    target: HostTarget,
    connect_timeout: Duration,
    generation: u64,
    events: mpsc::UnboundedSender<TaggedEvent>,
    mut outbound: mpsc::UnboundedReceiver<String>,
) {
    let emit = |event: TransportEvent| {
        // the actor going away is the only reason this can fail
        let _ = events.send(TaggedEvent { generation, event });
    };

    let Transport {
        mut sink,
        mut stream,
    } = match tokio::time::timeout(connect_timeout, connector.connect(&target)).await {
        Ok(Ok(transport)) => transport,
        Ok(Err(e)) => {
            emit(TransportEvent::Failed(format!("{e:#}")));
            return;
        }
        Err(_) => {
            emit(TransportEvent::Failed(format!(
                "no connection within {connect_timeout:?}"
            )));
            return;
        }
    };

    emit(TransportEvent::Opened);

    loop {
        tokio::select! {
            frame = outbound.recv() => {
                let Some(frame) = frame else {
                    // actor dropped this attempt
                    let _ = sink.close().await;
                    return;
                };

                if let Err(e) = sink.send(frame).await {
                    emit(TransportEvent::Failed(format!("{e:#}")));
                    return;
                }
            }

            incoming = stream.next() => {
                match incoming {
                    Some(Ok(text)) => emit(TransportEvent::Frame(text)),
                    Some(Err(e)) => {
                        emit(TransportEvent::Failed(format!("{e:#}")));
                        return;
                    }
                    None => {
                        emit(TransportEvent::Closed);
                        return;
                    }
                }
            }
        }
    }
}

/// Handle for controlling a connection actor
///
/// Cheap to clone; all clones talk to the same actor.
#[derive(Clone)]
pub struct ConnectionHandle {
    sender: mpsc::Sender<ConnectionCommand>,
    host_id: String,
    status_rx: watch::Receiver<ConnectionStatus>,
    event_tx: broadcast::Sender<ConnectionEvent>,
}

impl ConnectionHandle {
    /// Spawn a connection actor for `target`. The connection starts disabled.
    pub fn spawn(
        target: HostTarget,
        connector: Arc<dyn Connector>,
        store: MetricsStore,
        config: &LinkConfig,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(config.command_capacity.max(1));
        let (transport_tx, transport_rx) = mpsc::unbounded_channel();
        let (status_tx, status_rx) = watch::channel(ConnectionStatus::default());
        let (event_tx, _) = broadcast::channel(config.event_capacity.max(1));

        let host_id = target.id.clone();

        let actor = ConnectionActor {
            target,
            connector,
            store,
            reconnect_delay: config.reconnect_delay(),
            connect_timeout: config.connect_timeout(),
            command_rx: cmd_rx,
            transport_tx,
            transport_rx,
            status_tx,
            event_tx: event_tx.clone(),
            enabled: false,
            state: ConnectionState::Disconnected,
            reconnect_attempt: 0,
            generation: 0,
            transport: None,
            reconnect: None,
        };

        tokio::spawn(actor.run());

        Self {
            sender: cmd_tx,
            host_id,
            status_rx,
            event_tx,
        }
    }

    pub fn host_id(&self) -> &str {
        &self.host_id
    }

    /// Start connecting; no-op if already connecting or connected
    pub async fn enable(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ConnectionCommand::Enable { respond_to: tx })
            .await
            .context("failed to send Enable command")?;
        rx.await.context("failed to receive Enable acknowledgement")
    }

    /// Stop the connection. When this returns, no reconnect timer is armed
    /// and the transport has been released.
    pub async fn disable(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ConnectionCommand::Disable { respond_to: tx })
            .await
            .context("failed to send Disable command")?;
        rx.await.context("failed to receive Disable acknowledgement")
    }

    /// Send a JSON-encodable message.
    ///
    /// Delivery is best effort: the message is dropped unless the connection is
    /// `Connected` when the actor processes it.
    pub async fn send<T: Serialize + ?Sized>(&self, message: &T) {
        let frame = match serde_json::to_string(message) {
            Ok(frame) => frame,
            Err(e) => {
                warn!("{}: failed to encode outbound message: {e}", self.host_id);
                return;
            }
        };

        if self
            .sender
            .send(ConnectionCommand::Send { frame })
            .await
            .is_err()
        {
            debug!("{}: connection actor stopped, dropping message", self.host_id);
        }
    }

    /// Replace the host parameters. A changed address, port, secret or scheme
    /// drops the current transport and, if enabled, reconnects right away.
    pub async fn update_target(&self, target: HostTarget) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ConnectionCommand::UpdateTarget {
                target,
                respond_to: tx,
            })
            .await
            .context("failed to send UpdateTarget command")?;
        rx.await.context("failed to receive UpdateTarget acknowledgement")
    }

    /// Disable the connection and stop the actor
    pub async fn shutdown(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(ConnectionCommand::Shutdown { respond_to: tx })
            .await
            .context("failed to send Shutdown command")?;
        rx.await.context("failed to receive Shutdown acknowledgement")
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.status_rx.borrow()
    }

    pub fn state(&self) -> ConnectionState {
        self.status_rx.borrow().state
    }

    /// Follow the latest status (intermediate values may be skipped)
    pub fn watch_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_rx.clone()
    }

    /// Receive every transition, snapshot and forwarded message from now on,
    /// in the order the connection handled them
    pub fn subscribe(&self) -> broadcast::Receiver<ConnectionEvent> {
        self.event_tx.subscribe()
    }
}
