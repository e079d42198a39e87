//! HistoryCorrelator - request/response history on top of a connection
//!
//! ## Message Flow
//!
//! ```text
//! set_range ─┐
//!            ├─▶ {"type":"history","range":R} ──▶ Connection ──▶ agent
//! Connected ─┘
//!
//! agent ──▶ Connection ──▶ Message(history, range R) ──▶ HistoryState::accept_response
//! agent ──▶ Connection ──▶ Snapshot ──────────────────▶ HistoryState::push_live
//! ```
//!
//! Responses and snapshots arrive on the connection's single event stream, so
//! a metrics frame sent right after a history response is seen after it.
//!
//! One correlator runs per host. It owns the host's [`HistoryState`]; readers
//! get copies through the handle and observers are called after every change.

use std::pin::Pin;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use anyhow::{Context, Result};
use tokio::sync::{RwLock, broadcast, mpsc, oneshot};
use tokio::time::{Sleep, sleep};
use tracing::{debug, instrument, trace, warn};

use crate::config::LinkConfig;
use crate::connection::{ConnectionEvent, ConnectionHandle, ConnectionState, StateTransition};
use crate::history::{HistoryPoint, HistoryRange, HistoryState, HistoryView};
use crate::protocol::{ForwardedMessage, HistoryResponse, Outbound};

/// Callback invoked with the new history of a host after every change
pub type HistoryObserver = Arc<dyn Fn(&HistoryView) + Send + Sync>;

/// Commands that can be sent to a HistoryCorrelator
#[derive(Debug)]
enum CorrelatorCommand {
    /// Select a range and request it
    SetRange {
        range: HistoryRange,
        respond_to: oneshot::Sender<()>,
    },

    /// Request the current range again
    Refresh { respond_to: oneshot::Sender<()> },

    Shutdown,
}

struct HistoryCorrelator {
    host_id: String,
    connection: ConnectionHandle,
    state: Arc<RwLock<HistoryState>>,
    observers: Arc<Mutex<Vec<HistoryObserver>>>,

    command_rx: mpsc::Receiver<CorrelatorCommand>,
    event_rx: broadcast::Receiver<ConnectionEvent>,

    request_timeout: Duration,

    /// Expires the in-flight request, if any
    pending: Option<Pin<Box<Sleep>>>,
}

impl HistoryCorrelator {
    #[instrument(skip(self), fields(host = %self.host_id))]
    async fn run(mut self) {
        debug!("starting history correlator");

        // the connection may have come up before we subscribed
        if self.connection.state() == ConnectionState::Connected {
            self.request_range().await;
        }

        loop {
            tokio::select! {
                cmd = self.command_rx.recv() => {
                    match cmd {
                        Some(CorrelatorCommand::SetRange { range, respond_to }) => {
                            self.set_range(range).await;
                            let _ = respond_to.send(());
                        }

                        Some(CorrelatorCommand::Refresh { respond_to }) => {
                            self.request_range().await;
                            let _ = respond_to.send(());
                        }

                        Some(CorrelatorCommand::Shutdown) | None => {
                            debug!("shutting down");
                            break;
                        }
                    }
                }

                event = self.event_rx.recv() => {
                    match event {
                        Ok(ConnectionEvent::Transition(StateTransition { to: ConnectionState::Connected, .. })) => {
                            self.request_range().await;
                        }
                        Ok(ConnectionEvent::Transition(_)) => {}
                        Ok(ConnectionEvent::Message(message)) if message.kind == "history" => {
                            self.handle_response(message).await;
                        }
                        Ok(ConnectionEvent::Message(message)) => trace!("ignoring {} message", message.kind),
                        Ok(ConnectionEvent::Snapshot(snapshot)) => {
                            self.push_live(HistoryPoint::from_snapshot(&snapshot)).await;
                        }
                        Err(broadcast::error::RecvError::Lagged(skipped)) => {
                            // the missed events may include a response or a reconnect
                            warn!("missed {skipped} connection events");
                            if self.connection.state() == ConnectionState::Connected {
                                self.request_range().await;
                            }
                        }
                        Err(broadcast::error::RecvError::Closed) => break,
                    }
                }

                _ = armed(&mut self.pending) => {
                    self.pending = None;
                    let abandoned = self.state.write().await.abandon_request();
                    if abandoned {
                        warn!("no history response within {:?}, resuming live points", self.request_timeout);
                        self.notify().await;
                    }
                }
            }
        }

        debug!("history correlator stopped");
    }

    async fn set_range(&mut self, range: HistoryRange) {
        let changed = self.state.write().await.select_range(range);

        if changed {
            debug!("range switched to {range}");
            self.pending = None;
            self.notify().await;
        }

        self.request_range().await;
    }

    /// Send a request for the current range; only valid while connected
    async fn request_range(&mut self) {
        if self.connection.state() != ConnectionState::Connected {
            debug!("not connected, deferring history request");
            return;
        }

        let range = self.state.write().await.begin_request();
        debug!("requesting {range} history");

        self.connection.send(&Outbound::history(range)).await;
        self.pending = Some(Box::pin(sleep(self.request_timeout)));
        self.notify().await;
    }

    async fn handle_response(&mut self, message: ForwardedMessage) {
        let response: HistoryResponse = match serde_json::from_value(message.message) {
            Ok(response) => response,
            Err(e) => {
                warn!("dropping malformed history response: {e}");
                return;
            }
        };

        let count = response.points.len();
        let accepted = self
            .state
            .write()
            .await
            .accept_response(response.range, response.points);

        if !accepted {
            trace!("ignoring stale {} history response", response.range);
            return;
        }

        debug!("received {count} {} history points", response.range);
        self.pending = None;
        self.notify().await;
    }

    async fn push_live(&mut self, point: HistoryPoint) {
        let appended = self.state.write().await.push_live(point);

        if appended {
            self.notify().await;
        } else {
            trace!("live point {} not appended", point.timestamp);
        }
    }

    async fn notify(&self) {
        let observers: Vec<HistoryObserver> = self
            .observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone();

        if observers.is_empty() {
            return;
        }

        let view = self.state.read().await.view(&self.host_id);
        for observer in observers {
            observer(&view);
        }
    }
}

async fn armed(timer: &mut Option<Pin<Box<Sleep>>>) {
    match timer {
        Some(timer) => timer.as_mut().await,
        None => std::future::pending().await,
    }
}

/// Handle for a host's history correlator
#[derive(Clone)]
pub struct CorrelatorHandle {
    sender: mpsc::Sender<CorrelatorCommand>,
    host_id: String,
    state: Arc<RwLock<HistoryState>>,
    observers: Arc<Mutex<Vec<HistoryObserver>>>,
}

impl CorrelatorHandle {
    /// Spawn a correlator bound to `connection`, starting with `range` selected
    pub fn spawn(
        connection: ConnectionHandle,
        range: HistoryRange,
        config: &LinkConfig,
    ) -> Self {
        let (cmd_tx, cmd_rx) = mpsc::channel(config.command_capacity.max(1));
        let host_id = connection.host_id().to_string();
        let state = Arc::new(RwLock::new(HistoryState::new(range)));
        let observers = Arc::new(Mutex::new(Vec::new()));

        // subscribe before spawning so nothing sent from here on is missed
        let actor = HistoryCorrelator {
            host_id: host_id.clone(),
            event_rx: connection.subscribe(),
            connection,
            state: state.clone(),
            observers: observers.clone(),
            command_rx: cmd_rx,
            request_timeout: config.history_timeout(),
            pending: None,
        };

        tokio::spawn(actor.run());

        Self {
            sender: cmd_tx,
            host_id,
            state,
            observers,
        }
    }

    pub fn host_id(&self) -> &str {
        &self.host_id
    }

    /// Select `range`, discarding points of any other range, and request it
    pub async fn set_range(&self, range: HistoryRange) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(CorrelatorCommand::SetRange {
                range,
                respond_to: tx,
            })
            .await
            .context("failed to send SetRange command")?;
        rx.await.context("failed to receive SetRange acknowledgement")
    }

    /// Request the current range again
    pub async fn refresh(&self) -> Result<()> {
        let (tx, rx) = oneshot::channel();
        self.sender
            .send(CorrelatorCommand::Refresh { respond_to: tx })
            .await
            .context("failed to send Refresh command")?;
        rx.await.context("failed to receive Refresh acknowledgement")
    }

    pub async fn view(&self) -> HistoryView {
        self.state.read().await.view(&self.host_id)
    }

    pub async fn points(&self) -> Vec<HistoryPoint> {
        self.state.read().await.buffer().to_vec()
    }

    pub async fn range(&self) -> HistoryRange {
        self.state.read().await.range()
    }

    pub async fn is_loading(&self) -> bool {
        self.state.read().await.is_loading()
    }

    /// Register a callback run after every history change.
    ///
    /// Callbacks run on the correlator task and must not block.
    pub fn on_update<F>(&self, observer: F)
    where
        F: Fn(&HistoryView) + Send + Sync + 'static,
    {
        self.observers
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Arc::new(observer));
    }

    pub async fn shutdown(&self) -> Result<()> {
        self.sender
            .send(CorrelatorCommand::Shutdown)
            .await
            .context("failed to send Shutdown command")?;
        Ok(())
    }
}
