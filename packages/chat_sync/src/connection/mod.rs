//! Connection manager actor.
//!
//! One task owns the state machine, the transport link, the reconnect timer,
//! the heartbeat and the inbound dispatcher. Callers talk to it through a
//! cloneable [`ConnectionHandle`]; state is published on a watch channel.
//! The credential source is the only place the token lives: the actor reads
//! it at each attempt and follows its rotations.

pub mod machine;

use std::sync::Arc;

use serde_json::Value;
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::{Instant, Interval, MissedTickBehavior};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::config::ConnectionConfig;
use crate::credential::{CredentialSource, CredentialStatus};
use crate::dedup::CacheStats;
use crate::dispatch::{DispatchOutcome, DispatchStats, InboundDispatcher};
use crate::error::SyncError;
use crate::frame::Frame;
use crate::status::{ConnectionStatus, StatusProjection, StatusWatcher};
use crate::transport::{EventSink, Transport, TransportEvent, TransportHandle, with_token};

use machine::{ConnectionEvent, ConnectionMachine, ConnectionState, Effect, TransitionError};

const COMMAND_BUFFER: usize = 32;
const EVENT_BUFFER: usize = 256;

/// Published after every transition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnectionSnapshot {
    pub state: ConnectionState,
    pub attempts: u32,
    pub max_attempts: u32,
}

impl ConnectionSnapshot {
    pub fn initial(max_attempts: u32) -> Self {
        Self {
            state: ConnectionState::Idle,
            attempts: 0,
            max_attempts,
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        ConnectionStatus::from_state(self.state)
    }

    pub fn projection(&self) -> StatusProjection {
        StatusProjection::from_state(self.state)
    }
}

#[derive(Debug)]
enum ConnectionCommand {
    Connect {
        respond_to: oneshot::Sender<Result<(), SyncError>>,
    },
    Disconnect {
        respond_to: oneshot::Sender<()>,
    },
    UpdateToken {
        token: Option<String>,
        respond_to: oneshot::Sender<()>,
    },
    Send {
        frame: Frame,
        respond_to: oneshot::Sender<Result<(), SyncError>>,
    },
    Stats {
        respond_to: oneshot::Sender<(DispatchStats, CacheStats)>,
    },
}

/// Handle to a running connection manager.
#[derive(Clone)]
pub struct ConnectionHandle {
    sender: mpsc::Sender<ConnectionCommand>,
    state: watch::Receiver<ConnectionSnapshot>,
}

impl ConnectionHandle {
    /// Start connecting. Returns once the attempt is initiated, not when the
    /// socket is open; watch the state for the outcome.
    pub async fn connect(&self) -> Result<(), SyncError> {
        let (tx, rx) = oneshot::channel();
        self.request(ConnectionCommand::Connect { respond_to: tx })
            .await?;
        rx.await.map_err(|_| SyncError::ManagerStopped)?
    }

    /// Close for good: cancels any pending reconnect and closes the transport.
    pub async fn disconnect(&self) -> Result<(), SyncError> {
        let (tx, rx) = oneshot::channel();
        self.request(ConnectionCommand::Disconnect { respond_to: tx })
            .await?;
        rx.await.map_err(|_| SyncError::ManagerStopped)
    }

    /// Rotate the credential source. The next connection attempt uses the
    /// new token.
    ///
    /// `None` revokes it: a pending reconnect is cancelled and the manager
    /// settles in `Disconnected`. A live connection is left running either way.
    pub async fn update_token(&self, token: Option<String>) -> Result<(), SyncError> {
        let (tx, rx) = oneshot::channel();
        self.request(ConnectionCommand::UpdateToken {
            token,
            respond_to: tx,
        })
        .await?;
        rx.await.map_err(|_| SyncError::ManagerStopped)
    }

    /// Send `{type, payload, timestamp}` stamped with the current time.
    pub async fn send(&self, kind: &str, payload: Value) -> Result<(), SyncError> {
        self.send_frame(Frame::new(kind, payload)).await
    }

    pub async fn send_frame(&self, frame: Frame) -> Result<(), SyncError> {
        let (tx, rx) = oneshot::channel();
        self.request(ConnectionCommand::Send {
            frame,
            respond_to: tx,
        })
        .await?;
        rx.await.map_err(|_| SyncError::ManagerStopped)?
    }

    pub async fn stats(&self) -> Result<(DispatchStats, CacheStats), SyncError> {
        let (tx, rx) = oneshot::channel();
        self.request(ConnectionCommand::Stats { respond_to: tx })
            .await?;
        rx.await.map_err(|_| SyncError::ManagerStopped)
    }

    pub fn snapshot(&self) -> ConnectionSnapshot {
        *self.state.borrow()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.snapshot().status()
    }

    pub fn watch(&self) -> StatusWatcher {
        StatusWatcher::new(self.state.clone())
    }

    async fn request(&self, cmd: ConnectionCommand) -> Result<(), SyncError> {
        self.sender
            .send(cmd)
            .await
            .map_err(|_| SyncError::ManagerStopped)
    }
}

struct Link {
    handle: TransportHandle,
    connection_id: Uuid,
}

pub struct ConnectionManager;

impl ConnectionManager {
    /// Spawn the manager task. Register handlers on `dispatcher` first; the
    /// handler table is owned by the task from here on.
    pub fn spawn(
        config: ConnectionConfig,
        transport: impl Transport,
        credentials: Arc<dyn CredentialSource>,
        dispatcher: InboundDispatcher,
    ) -> ConnectionHandle {
        let (sender, receiver) = mpsc::channel(COMMAND_BUFFER);
        let (events_tx, events_rx) = mpsc::channel(EVENT_BUFFER);
        let (state_tx, state_rx) =
            watch::channel(ConnectionSnapshot::initial(config.reconnect.max_attempts));
        let rotations = credentials.subscribe();

        let actor = ConnectionActor {
            machine: ConnectionMachine::new(config.reconnect.clone()),
            config,
            transport: Box::new(transport),
            credentials,
            rotations,
            dispatcher,
            receiver,
            events_tx,
            events_rx,
            state_tx,
            generation: 0,
            link: None,
            reconnect_at: None,
            heartbeat: None,
        };

        tokio::spawn(async move {
            actor.run().await;
        });

        ConnectionHandle {
            sender,
            state: state_rx,
        }
    }
}

struct ConnectionActor {
    machine: ConnectionMachine,
    config: ConnectionConfig,
    transport: Box<dyn Transport>,
    credentials: Arc<dyn CredentialSource>,
    rotations: watch::Receiver<Option<String>>,
    dispatcher: InboundDispatcher,
    receiver: mpsc::Receiver<ConnectionCommand>,
    events_tx: mpsc::Sender<(u64, TransportEvent)>,
    events_rx: mpsc::Receiver<(u64, TransportEvent)>,
    state_tx: watch::Sender<ConnectionSnapshot>,
    /// Bumped on every open and close; events tagged with an older value are stale.
    generation: u64,
    link: Option<Link>,
    reconnect_at: Option<Instant>,
    heartbeat: Option<Interval>,
}

impl ConnectionActor {
    async fn run(mut self) {
        debug!(url = %self.config.url, "connection manager started");

        loop {
            // Transport events first, so a command observes every frame
            // delivered before it.
            tokio::select! {
                biased;

                Some((generation, event)) = self.events_rx.recv() => {
                    self.handle_transport_event(generation, event);
                }

                cmd = self.receiver.recv() => match cmd {
                    Some(cmd) => self.handle_command(cmd),
                    None => {
                        // Every handle dropped
                        let _ = self.apply(ConnectionEvent::Disconnect);
                        break;
                    }
                },

                Ok(()) = self.rotations.changed() => {
                    self.rotations.borrow_and_update();
                    self.credential_rotated();
                }

                () = reconnect_timer(self.reconnect_at) => {
                    self.reconnect_at = None;
                    let credential = self.credential_status();
                    let _ = self.apply(ConnectionEvent::ReconnectTimerFired { credential });
                }

                () = heartbeat_tick(&mut self.heartbeat) => {
                    self.send_heartbeat();
                }
            }
        }

        debug!("connection manager stopped");
    }

    fn handle_command(&mut self, cmd: ConnectionCommand) {
        match cmd {
            ConnectionCommand::Connect { respond_to } => {
                let credential = self.credential_status();
                let result = self
                    .apply(ConnectionEvent::Connect { credential })
                    .map_err(|e| {
                        warn!(error = %e, "connect rejected");
                        SyncError::from(e)
                    });
                let _ = respond_to.send(result);
            }

            ConnectionCommand::Disconnect { respond_to } => {
                let _ = self.apply(ConnectionEvent::Disconnect);
                let _ = respond_to.send(());
            }

            ConnectionCommand::UpdateToken { token, respond_to } => {
                self.credentials.rotate(token);
                // Handled here so the caller observes the outcome; the
                // matching notification is consumed.
                self.rotations.borrow_and_update();
                self.credential_rotated();
                let _ = respond_to.send(());
            }

            ConnectionCommand::Send { frame, respond_to } => {
                let _ = respond_to.send(self.send_frame(&frame));
            }

            ConnectionCommand::Stats { respond_to } => {
                let _ = respond_to.send((self.dispatcher.stats(), self.dispatcher.cache_stats()));
            }
        }
    }

    fn handle_transport_event(&mut self, generation: u64, event: TransportEvent) {
        if generation != self.generation || self.link.is_none() {
            debug!(generation, current = self.generation, "ignoring stale transport event");
            return;
        }
        let connection_id = self.link.as_ref().map(|l| l.connection_id);

        match event {
            TransportEvent::Opened => {
                let _ = self.apply(ConnectionEvent::TransportOpened);
            }

            TransportEvent::Message(text) => {
                if self.machine.state() != ConnectionState::Connected {
                    return;
                }
                if self.dispatcher.on_frame(&text) == DispatchOutcome::Ping {
                    if let Err(e) = self.send_frame(&Frame::pong()) {
                        debug!(error = %e, "failed to answer ping");
                    }
                }
            }

            TransportEvent::Error(error) => {
                warn!(?connection_id, %error, "transport error");
                let _ = self.apply(ConnectionEvent::TransportFailed { error });
            }

            TransportEvent::Closed { code, reason } => {
                info!(?connection_id, ?code, %reason, "transport closed");
                let _ = self.apply(ConnectionEvent::TransportClosed { code, reason });
            }
        }
    }

    /// Run one event through the machine, carry out its effects, publish.
    fn apply(&mut self, event: ConnectionEvent) -> Result<(), TransitionError> {
        let before = self.machine.state();
        let effects = self.machine.apply(event)?;
        let after = self.machine.state();

        if before != after {
            info!(
                from = %before,
                to = %after,
                attempts = self.machine.attempts(),
                "connection state changed"
            );
        }

        for effect in effects {
            self.run_effect(effect);
        }
        self.publish();
        Ok(())
    }

    fn run_effect(&mut self, effect: Effect) {
        match effect {
            Effect::OpenTransport { attempt } => self.open_transport(attempt),

            Effect::CloseTransport => {
                if let Some(link) = self.link.take() {
                    debug!(connection_id = %link.connection_id, "closing transport");
                    link.handle.close();
                }
                self.generation += 1;
            }

            Effect::ScheduleReconnect { delay, attempt } => {
                info!(
                    attempt,
                    max_attempts = self.machine.policy().max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "scheduling reconnect"
                );
                self.reconnect_at = Some(Instant::now() + delay);
            }

            Effect::CancelReconnect => {
                if self.reconnect_at.take().is_some() {
                    debug!("pending reconnect cancelled");
                }
            }

            Effect::StartHeartbeat => {
                let period = self.config.heartbeat_interval;
                let mut interval = tokio::time::interval_at(Instant::now() + period, period);
                interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
                self.heartbeat = Some(interval);
            }

            Effect::StopHeartbeat => {
                self.heartbeat = None;
            }
        }
    }

    fn open_transport(&mut self, attempt: u32) {
        // The machine only opens after a valid credential check
        let url = match self.current_token() {
            Some(token) => with_token(&self.config.url, &token),
            None => self.config.url.clone(),
        };

        self.generation += 1;
        let connection_id = Uuid::new_v4();
        info!(%connection_id, attempt, generation = self.generation, "opening transport");

        let sink = EventSink::new(self.generation, self.events_tx.clone());
        let handle = self.transport.open(url, sink);
        self.link = Some(Link {
            handle,
            connection_id,
        });
    }

    fn send_frame(&self, frame: &Frame) -> Result<(), SyncError> {
        let link = match (&self.link, self.machine.state()) {
            (Some(link), ConnectionState::Connected) if !link.handle.is_closed() => link,
            _ => return Err(SyncError::NotConnected),
        };
        let json = frame.to_json()?;
        link.handle.send(json)
    }

    fn send_heartbeat(&mut self) {
        if let Err(e) = self.send_frame(&Frame::ping()) {
            debug!(error = %e, "heartbeat not sent");
        }
    }

    fn current_token(&self) -> Option<String> {
        self.credentials.token()
    }

    fn credential_status(&self) -> CredentialStatus {
        CredentialStatus::of(self.current_token().as_deref())
    }

    fn credential_rotated(&mut self) {
        let credential = self.credential_status();
        info!(state = %self.machine.state(), ?credential, "credential rotated");
        if credential != CredentialStatus::Valid {
            let _ = self.apply(ConnectionEvent::CredentialRevoked);
        }
    }

    fn publish(&self) {
        let snapshot = ConnectionSnapshot {
            state: self.machine.state(),
            attempts: self.machine.attempts(),
            max_attempts: self.machine.policy().max_attempts,
        };
        self.state_tx.send_if_modified(|current| {
            if *current == snapshot {
                false
            } else {
                *current = snapshot;
                true
            }
        });
    }
}

async fn reconnect_timer(deadline: Option<Instant>) {
    match deadline {
        Some(deadline) => tokio::time::sleep_until(deadline).await,
        None => std::future::pending().await,
    }
}

async fn heartbeat_tick(interval: &mut Option<Interval>) {
    match interval {
        Some(interval) => {
            interval.tick().await;
        }
        None => std::future::pending().await,
    }
}
