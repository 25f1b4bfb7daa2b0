//! In-memory fakes for the push transport, the pull source and room channels.

use crate::connection::{Credential, PushLink, PushTransport};
use crate::error::{SyncError, SyncResult};
use crate::protocol::ClientMessage;
use crate::pull::SnapshotSource;
use crate::rooms::RoomChannel;
use crate::snapshot::{ProjectId, WorkflowSnapshot};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// Test side of a link opened through [`FakeTransport`].
pub struct FakeLink {
    pub credential: Credential,
    frames: mpsc::UnboundedSender<SyncResult<String>>,
    sent: mpsc::UnboundedReceiver<String>,
}

impl FakeLink {
    /// Delivers a server frame.
    pub fn push(&self, frame: &str) {
        let _ = self.frames.send(Ok(frame.to_string()));
    }

    pub fn fail(&self, reason: &str) {
        let _ = self.frames.send(Err(SyncError::Transport(reason.to_string())));
    }

    /// Next message the client wrote, waiting for it.
    pub async fn next_sent(&mut self) -> Option<String> {
        self.sent.recv().await
    }

    pub fn drain_sent(&mut self) -> Vec<String> {
        let mut out = Vec::new();
        while let Ok(text) = self.sent.try_recv() {
            out.push(text);
        }
        out
    }
}

/// Transport whose connection attempts follow a script.
///
/// Unscripted attempts succeed. Every accepted link is handed to the test
/// through the receiver returned by [`FakeTransport::new`].
pub struct FakeTransport {
    script: Mutex<VecDeque<Result<(), String>>>,
    attempts: AtomicUsize,
    links_tx: mpsc::UnboundedSender<FakeLink>,
}

impl FakeTransport {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<FakeLink>) {
        let (links_tx, links_rx) = mpsc::unbounded_channel();
        let transport = Arc::new(Self {
            script: Mutex::new(VecDeque::new()),
            attempts: AtomicUsize::new(0),
            links_tx,
        });
        (transport, links_rx)
    }

    pub fn refuse_next(&self, count: usize, reason: &str) {
        let mut script = self.script.lock().unwrap();
        for _ in 0..count {
            script.push_back(Err(reason.to_string()));
        }
    }

    pub fn attempts(&self) -> usize {
        self.attempts.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PushTransport for FakeTransport {
    async fn open(&self, credential: &Credential) -> SyncResult<PushLink> {
        self.attempts.fetch_add(1, Ordering::SeqCst);
        let outcome = self.script.lock().unwrap().pop_front().unwrap_or(Ok(()));
        if let Err(reason) = outcome {
            return Err(SyncError::Transport(reason));
        }

        let (frames_tx, frames_rx) = mpsc::unbounded_channel::<SyncResult<String>>();
        let (sent_tx, sent_rx) = mpsc::unbounded_channel::<String>();

        let inbound = futures::stream::unfold(frames_rx, |mut rx| async move {
            rx.recv().await.map(|item| (item, rx))
        });
        let outbound = futures::sink::unfold(sent_tx, |tx, text: String| async move {
            tx.send(text)
                .map_err(|_| SyncError::Transport("peer gone".to_string()))?;
            Ok::<_, SyncError>(tx)
        });

        let _ = self.links_tx.send(FakeLink {
            credential: credential.clone(),
            frames: frames_tx,
            sent: sent_rx,
        });
        Ok(PushLink {
            outbound: Box::pin(outbound),
            inbound: Box::pin(inbound),
        })
    }
}

/// Pull source serving configurable snapshots.
#[derive(Default)]
pub struct FakeSource {
    projects: Mutex<HashMap<ProjectId, WorkflowSnapshot>>,
    failing: Mutex<Option<String>>,
    latency: Mutex<Duration>,
    fetches: AtomicUsize,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

impl FakeSource {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_project(&self, snapshot: WorkflowSnapshot) {
        self.projects.lock().unwrap().insert(snapshot.id, snapshot);
    }

    pub fn set_status(&self, id: ProjectId, status: &str) {
        self.set_project(WorkflowSnapshot::new(id, status));
    }

    /// Makes every fetch fail until cleared with `None`.
    pub fn set_failing(&self, reason: Option<&str>) {
        *self.failing.lock().unwrap() = reason.map(str::to_string);
    }

    pub fn set_latency(&self, latency: Duration) {
        *self.latency.lock().unwrap() = latency;
    }

    pub fn fetches(&self) -> usize {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }

    async fn begin(&self) -> SyncResult<()> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);

        let latency = *self.latency.lock().unwrap();
        if !latency.is_zero() {
            tokio::time::sleep(latency).await;
        }
        self.in_flight.fetch_sub(1, Ordering::SeqCst);

        match self.failing.lock().unwrap().clone() {
            Some(reason) => Err(SyncError::Pull(reason)),
            None => Ok(()),
        }
    }
}

#[async_trait]
impl SnapshotSource for FakeSource {
    async fn fetch_project(&self, id: ProjectId) -> SyncResult<WorkflowSnapshot> {
        self.begin().await?;
        self.projects
            .lock()
            .unwrap()
            .get(&id)
            .cloned()
            .ok_or_else(|| SyncError::Pull(format!("HTTP 404 for project {}", id)))
    }

    async fn list_projects(&self) -> SyncResult<Vec<WorkflowSnapshot>> {
        self.begin().await?;
        let mut all: Vec<WorkflowSnapshot> =
            self.projects.lock().unwrap().values().cloned().collect();
        all.sort_by_key(|s| s.id);
        Ok(all)
    }
}

/// Room channel that records what was sent.
pub struct RecordingChannel {
    live: AtomicBool,
    failing: AtomicBool,
    sent: Mutex<Vec<ClientMessage>>,
}

impl RecordingChannel {
    pub fn new(live: bool) -> Arc<Self> {
        Arc::new(Self {
            live: AtomicBool::new(live),
            failing: AtomicBool::new(false),
            sent: Mutex::new(Vec::new()),
        })
    }

    pub fn set_live(&self, live: bool) {
        self.live.store(live, Ordering::SeqCst);
    }

    pub fn set_failing(&self, failing: bool) {
        self.failing.store(failing, Ordering::SeqCst);
    }

    pub fn sent(&self) -> Vec<ClientMessage> {
        self.sent.lock().unwrap().clone()
    }
}

impl RoomChannel for RecordingChannel {
    fn is_live(&self) -> bool {
        self.live.load(Ordering::SeqCst)
    }

    fn send(&self, message: &ClientMessage) -> SyncResult<()> {
        if self.failing.load(Ordering::SeqCst) {
            return Err(SyncError::Transport("write failed".to_string()));
        }
        self.sent.lock().unwrap().push(message.clone());
        Ok(())
    }
}
