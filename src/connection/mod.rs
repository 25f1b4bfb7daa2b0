//! Lifecycle of the single push connection.
//!
//! The manager owns at most one connection task per credential. The task
//! opens a link through the injected [`PushTransport`], answers Engine.IO
//! pings, forwards inbound event packets as [`LinkSignal`]s and reconnects
//! with bounded exponential backoff when the link drops. Liveness is
//! published on a watch channel.

mod transport;

pub use transport::{Inbound, Outbound, PushLink, PushTransport, WebSocketTransport};

use crate::error::{SyncError, SyncResult};
use crate::protocol::{ClientMessage, Packet};
use crate::rooms::RoomChannel;
use futures::{SinkExt, StreamExt};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use uuid::Uuid;

/// Opaque bearer token. Never printed.
#[derive(Clone, PartialEq, Eq)]
pub struct Credential(String);

impl Credential {
    pub fn new(token: impl Into<String>) -> Self {
        Self(token.into())
    }

    pub fn expose(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("Credential(<redacted>)")
    }
}

/// Identity of one established link. A reconnect yields a new id.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    Connecting { attempt: u32 },
    Connected(ConnectionId),
    /// Reconnect budget spent. Only a new `connect` call retries.
    Exhausted { last_error: String },
}

impl ConnectionStatus {
    pub fn is_live(&self) -> bool {
        matches!(self, Self::Connected(_))
    }
}

/// Signals delivered to the consumer of the connection, in order.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LinkSignal {
    Connected(ConnectionId),
    Disconnected { reason: String },
    /// Raw inbound text frame
    Frame(String),
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    /// Consecutive failed attempts per outage before giving up.
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(5),
            max_attempts: 5,
        }
    }
}

impl ReconnectPolicy {
    /// Base delay before the next attempt after `failures` consecutive failures.
    pub fn delay_for(&self, failures: u32) -> Duration {
        let exponent = failures.saturating_sub(1).min(16);
        self.initial_delay
            .saturating_mul(1u32 << exponent)
            .min(self.max_delay)
    }

    /// Applies ±25% jitter.
    fn jittered(delay: Duration) -> Duration {
        let factor = 1.0 + 0.25 * (rand::random::<f64>() * 2.0 - 1.0);
        delay.mul_f64(factor)
    }
}

type OutboundSlot = Option<mpsc::UnboundedSender<String>>;

/// Cheap handle to whichever connection the manager currently runs.
///
/// Stays valid across credential changes: every new connection task
/// installs its outbound sender where existing handles look it up.
#[derive(Clone)]
pub struct ConnectionHandle {
    outbound: watch::Receiver<OutboundSlot>,
    status: watch::Receiver<ConnectionStatus>,
}

impl ConnectionHandle {
    pub fn id(&self) -> Option<ConnectionId> {
        match &*self.status.borrow() {
            ConnectionStatus::Connected(id) => Some(*id),
            _ => None,
        }
    }

    pub fn is_live(&self) -> bool {
        self.status.borrow().is_live()
    }

    pub fn send(&self, message: &ClientMessage) -> SyncResult<()> {
        if !self.is_live() {
            return Err(SyncError::Transport("connection is not live".to_string()));
        }
        let outbound = self.outbound.borrow().clone();
        let Some(outbound) = outbound else {
            return Err(SyncError::Transport("no connection task".to_string()));
        };
        outbound
            .send(message.to_wire())
            .map_err(|_| SyncError::Transport("connection task has stopped".to_string()))
    }
}

impl RoomChannel for ConnectionHandle {
    fn is_live(&self) -> bool {
        ConnectionHandle::is_live(self)
    }

    fn send(&self, message: &ClientMessage) -> SyncResult<()> {
        ConnectionHandle::send(self, message)
    }
}

struct ActiveConnection {
    credential: Credential,
    task: JoinHandle<()>,
}

/// Owns the push connection. Construct one per process and pass it down.
pub struct ConnectionManager {
    transport: Arc<dyn PushTransport>,
    policy: ReconnectPolicy,
    signal_tx: mpsc::UnboundedSender<LinkSignal>,
    status_tx: watch::Sender<ConnectionStatus>,
    outbound_tx: watch::Sender<OutboundSlot>,
    active: Option<ActiveConnection>,
}

impl ConnectionManager {
    /// Returns the manager and the receiver of its link signals.
    pub fn new(
        transport: Arc<dyn PushTransport>,
        policy: ReconnectPolicy,
    ) -> (Self, mpsc::UnboundedReceiver<LinkSignal>) {
        let (signal_tx, signal_rx) = mpsc::unbounded_channel();
        let (status_tx, _) = watch::channel(ConnectionStatus::Disconnected);
        let (outbound_tx, _) = watch::channel(None);
        let manager = Self {
            transport,
            policy,
            signal_tx,
            status_tx,
            outbound_tx,
            active: None,
        };
        (manager, signal_rx)
    }

    pub fn status(&self) -> watch::Receiver<ConnectionStatus> {
        self.status_tx.subscribe()
    }

    pub fn handle(&self) -> Option<ConnectionHandle> {
        self.active.as_ref().map(|_| self.new_handle())
    }

    fn new_handle(&self) -> ConnectionHandle {
        ConnectionHandle {
            outbound: self.outbound_tx.subscribe(),
            status: self.status_tx.subscribe(),
        }
    }

    /// Ensures a connection for `credential`.
    ///
    /// Idempotent while the connection task for the same credential is
    /// alive. A different credential tears the old connection down first;
    /// `None` only tears down.
    pub fn connect(&mut self, credential: Option<Credential>) -> Option<ConnectionHandle> {
        let Some(credential) = credential else {
            self.disconnect();
            return None;
        };

        if let Some(active) = &self.active {
            if active.credential == credential && !active.task.is_finished() {
                return Some(self.new_handle());
            }
        }
        self.disconnect();

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        self.outbound_tx.send_replace(Some(outbound_tx));
        let task = tokio::spawn(run_connection(
            Arc::clone(&self.transport),
            credential.clone(),
            self.policy.clone(),
            outbound_rx,
            self.signal_tx.clone(),
            self.status_tx.clone(),
        ));
        tracing::info!("Push connection started");

        self.active = Some(ActiveConnection { credential, task });
        Some(self.new_handle())
    }

    pub fn disconnect(&mut self) {
        let Some(active) = self.active.take() else {
            return;
        };
        active.task.abort();
        self.outbound_tx.send_replace(None);
        let was_live = self
            .status_tx
            .send_replace(ConnectionStatus::Disconnected)
            .is_live();
        if was_live {
            let _ = self.signal_tx.send(LinkSignal::Disconnected {
                reason: "closed by client".to_string(),
            });
        }
        tracing::info!("Push connection closed");
    }
}

impl Drop for ConnectionManager {
    fn drop(&mut self) {
        if let Some(active) = self.active.take() {
            active.task.abort();
        }
    }
}

async fn run_connection(
    transport: Arc<dyn PushTransport>,
    credential: Credential,
    policy: ReconnectPolicy,
    mut outbound_rx: mpsc::UnboundedReceiver<String>,
    signal_tx: mpsc::UnboundedSender<LinkSignal>,
    status_tx: watch::Sender<ConnectionStatus>,
) {
    let mut failures = 0u32;

    loop {
        status_tx.send_replace(ConnectionStatus::Connecting {
            attempt: failures + 1,
        });

        match transport.open(&credential).await {
            Ok(link) => {
                failures = 0;
                // Messages issued while the link was down are not replayed
                while outbound_rx.try_recv().is_ok() {}

                let id = ConnectionId::new();
                status_tx.send_replace(ConnectionStatus::Connected(id));
                tracing::info!(connection = %id, "Push connection established");
                if signal_tx.send(LinkSignal::Connected(id)).is_err() {
                    return;
                }

                let reason = pump(link, &mut outbound_rx, &signal_tx).await;

                status_tx.send_replace(ConnectionStatus::Disconnected);
                tracing::warn!(connection = %id, %reason, "Push connection lost");
                if signal_tx
                    .send(LinkSignal::Disconnected {
                        reason: reason.clone(),
                    })
                    .is_err()
                {
                    return;
                }
            }
            Err(e) => {
                failures += 1;
                tracing::warn!(attempt = failures, error = %e, "Push connection attempt failed");
                if failures >= policy.max_attempts {
                    tracing::warn!(
                        attempts = failures,
                        "Giving up on push connection; polling continues"
                    );
                    status_tx.send_replace(ConnectionStatus::Exhausted {
                        last_error: e.to_string(),
                    });
                    return;
                }
                status_tx.send_replace(ConnectionStatus::Disconnected);
            }
        }

        let delay = ReconnectPolicy::jittered(policy.delay_for(failures));
        tracing::debug!(delay_ms = delay.as_millis() as u64, "Reconnecting after delay");
        tokio::time::sleep(delay).await;
    }
}

/// Drives one link until it fails. Returns the reason.
///
/// Pings are answered here. Event packets, and anything unparseable, go to
/// the consumer as raw frames; it validates them.
async fn pump(
    link: PushLink,
    outbound_rx: &mut mpsc::UnboundedReceiver<String>,
    signal_tx: &mpsc::UnboundedSender<LinkSignal>,
) -> String {
    let PushLink {
        mut outbound,
        mut inbound,
    } = link;

    loop {
        tokio::select! {
            frame = inbound.next() => match frame {
                Some(Ok(text)) => match Packet::parse(&text) {
                    Ok(Packet::Ping) => {
                        if let Err(e) = outbound.send(Packet::Pong.encode()).await {
                            return e.to_string();
                        }
                    }
                    Ok(Packet::Close) | Ok(Packet::Disconnect) => {
                        return "server ended the session".to_string();
                    }
                    Ok(Packet::ConnectError(message)) => {
                        return format!("server refused the session: {}", message);
                    }
                    Ok(Packet::Event { .. }) | Err(_) => {
                        if signal_tx.send(LinkSignal::Frame(text)).is_err() {
                            return "signal receiver dropped".to_string();
                        }
                    }
                    Ok(other) => {
                        tracing::trace!(packet = %other.encode(), "Control packet ignored");
                    }
                },
                Some(Err(e)) => return e.to_string(),
                None => return "connection closed".to_string(),
            },
            message = outbound_rx.recv() => match message {
                Some(text) => {
                    if let Err(e) = outbound.send(text).await {
                        return e.to_string();
                    }
                }
                None => return "connection handle dropped".to_string(),
            },
        }
    }
}
