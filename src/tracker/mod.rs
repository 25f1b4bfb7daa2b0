//! Composes the sync components for one tracked project.
//!
//! A single task owns the multiplexer, interpreter, room membership and
//! phase clock and reacts to link signals, poll results, commands and a
//! progress tick from one `select!` loop. Consumers talk to it through a
//! [`TrackerHandle`].

use crate::config::SyncConfig;
use crate::connection::{ConnectionHandle, LinkSignal};
use crate::interpreter::{Phase, PhaseEvent, PhaseView, WorkflowInterpreter};
use crate::multiplexer::{EventMultiplexer, Subscribers, Unsubscribe, WorkflowEvent};
use crate::progress::{EstimateTable, PhaseClock, ProgressEstimate};
use crate::pull::{PollState, PollTarget, PollingFallback, Pulled, SnapshotSource};
use crate::rooms::RoomSubscriptionManager;
use crate::snapshot::ProjectId;
use crate::structured_logger::StructuredLogger;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};

#[derive(Debug, Clone)]
pub struct TrackerOptions {
    pub poll_interval: Duration,
    pub stale_after_failures: u32,
    pub event_log_capacity: usize,
    pub estimates: EstimateTable,
    pub progress_tick: Duration,
}

impl TrackerOptions {
    pub fn from_config(config: &SyncConfig) -> Self {
        Self {
            poll_interval: config.polling.project_interval(),
            stale_after_failures: config.polling.stale_after_failures,
            event_log_capacity: config.event_log_capacity,
            estimates: config.estimate_table(),
            progress_tick: Duration::from_secs(1),
        }
    }
}

/// The push half: a handle to the shared connection and its signals.
pub struct PushSide {
    pub handle: ConnectionHandle,
    pub signals: mpsc::UnboundedReceiver<LinkSignal>,
}

enum Command {
    Track(Option<ProjectId>),
    Shutdown,
}

pub struct TrackerHandle {
    commands: mpsc::UnboundedSender<Command>,
    connected: watch::Receiver<bool>,
    last_event: watch::Receiver<Option<WorkflowEvent>>,
    view: watch::Receiver<Option<PhaseView>>,
    progress: watch::Receiver<Option<ProgressEstimate>>,
    stale: watch::Receiver<bool>,
    subscribers: Subscribers,
    task: JoinHandle<()>,
}

impl TrackerHandle {
    /// Switches the tracked project; `None` stops tracking.
    pub fn track(&self, project_id: Option<ProjectId>) {
        let _ = self.commands.send(Command::Track(project_id));
    }

    pub fn connected(&self) -> watch::Receiver<bool> {
        self.connected.clone()
    }

    pub fn last_event(&self) -> watch::Receiver<Option<WorkflowEvent>> {
        self.last_event.clone()
    }

    pub fn view(&self) -> watch::Receiver<Option<PhaseView>> {
        self.view.clone()
    }

    pub fn phase(&self) -> Option<Phase> {
        self.view.borrow().as_ref().map(|view| view.phase)
    }

    pub fn progress(&self) -> watch::Receiver<Option<ProgressEstimate>> {
        self.progress.clone()
    }

    pub fn stale(&self) -> watch::Receiver<bool> {
        self.stale.clone()
    }

    pub fn on_event(
        &self,
        handler: impl Fn(&WorkflowEvent) + Send + Sync + 'static,
    ) -> Unsubscribe {
        self.subscribers.subscribe(handler)
    }

    /// Stops tracking, leaves the room and waits for the task to finish.
    pub async fn shutdown(self) {
        let _ = self.commands.send(Command::Shutdown);
        if let Err(e) = self.task.await {
            tracing::warn!(error = %e, "Tracker task ended abnormally");
        }
    }
}

pub struct ProjectTracker {
    poller: PollingFallback,
    poll_rx: watch::Receiver<PollState>,
    interpreter: WorkflowInterpreter,
    mux: EventMultiplexer,
    rooms: Option<RoomSubscriptionManager>,
    signals: Option<mpsc::UnboundedReceiver<LinkSignal>>,
    clock: PhaseClock,
    options: TrackerOptions,
    tracked: Option<ProjectId>,
    connected_tx: watch::Sender<bool>,
    stale_tx: watch::Sender<bool>,
    progress_tx: watch::Sender<Option<ProgressEstimate>>,
    events_tx: mpsc::UnboundedSender<PhaseEvent>,
    logger: Option<Arc<StructuredLogger>>,
}

impl ProjectTracker {
    /// Spawns the tracker task.
    ///
    /// Returns the handle and a stream of phase events, including the
    /// completion notice carrying the results path.
    pub fn spawn(
        source: Arc<dyn SnapshotSource>,
        push: Option<PushSide>,
        options: TrackerOptions,
        logger: Option<Arc<StructuredLogger>>,
    ) -> (TrackerHandle, mpsc::UnboundedReceiver<PhaseEvent>) {
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();
        let (events_tx, events_rx) = mpsc::unbounded_channel();

        let poller = PollingFallback::new(source, options.stale_after_failures, logger.clone());
        let (interpreter, view_rx) = WorkflowInterpreter::new(logger.clone());
        let mux = EventMultiplexer::new(options.event_log_capacity, logger.clone());

        let initially_live = push.as_ref().is_some_and(|p| p.handle.is_live());
        let (connected_tx, connected_rx) = watch::channel(initially_live);
        let (stale_tx, stale_rx) = watch::channel(false);
        let (progress_tx, progress_rx) = watch::channel(None);

        let (rooms, signals) = match push {
            Some(PushSide { handle, signals }) => (
                Some(RoomSubscriptionManager::new(Arc::new(handle))),
                Some(signals),
            ),
            None => (None, None),
        };

        let last_event_rx = mux.last_event();
        let subscribers = mux.subscribers();
        let tracker = Self {
            poll_rx: poller.state(),
            poller,
            interpreter,
            mux,
            rooms,
            signals,
            clock: PhaseClock::default(),
            options,
            tracked: None,
            connected_tx,
            stale_tx,
            progress_tx,
            events_tx,
            logger,
        };
        let task = tokio::spawn(tracker.run(commands_rx));

        let handle = TrackerHandle {
            commands: commands_tx,
            connected: connected_rx,
            last_event: last_event_rx,
            view: view_rx,
            progress: progress_rx,
            stale: stale_rx,
            subscribers,
            task,
        };
        (handle, events_rx)
    }

    async fn run(mut self, mut commands: mpsc::UnboundedReceiver<Command>) {
        let mut tick = tokio::time::interval(self.options.progress_tick);
        tick.set_missed_tick_behavior(MissedTickBehavior::Skip);

        loop {
            tokio::select! {
                command = commands.recv() => match command {
                    Some(Command::Track(project_id)) => self.track(project_id),
                    Some(Command::Shutdown) | None => break,
                },
                signal = next_signal(&mut self.signals) => match signal {
                    Some(signal) => self.on_signal(signal),
                    None => {
                        tracing::debug!("Connection manager gone; continuing on polling only");
                        self.signals = None;
                    }
                },
                changed = self.poll_rx.changed() => {
                    if changed.is_ok() {
                        self.on_poll();
                    }
                }
                _ = tick.tick() => self.publish_progress(),
            }
        }

        self.track(None);
        tracing::debug!("Tracker stopped");
    }

    fn track(&mut self, project_id: Option<ProjectId>) {
        if self.tracked == project_id {
            return;
        }
        if let (Some(previous), Some(rooms)) = (self.tracked, self.rooms.as_mut()) {
            rooms.leave(previous);
        }

        self.tracked = project_id;
        self.interpreter.track(project_id);
        self.clock.reset();
        self.progress_tx.send_replace(None);

        match project_id {
            Some(id) => {
                tracing::info!(project = %id, "Tracking project");
                self.poller
                    .start(PollTarget::Project(id), self.options.poll_interval);
                if let Some(rooms) = self.rooms.as_mut() {
                    rooms.join(id);
                }
            }
            None => self.poller.stop(),
        }
    }

    fn on_signal(&mut self, signal: LinkSignal) {
        match signal {
            LinkSignal::Connected(id) => {
                self.connected_tx.send_replace(true);
                if let Some(logger) = &self.logger {
                    logger.log_connection("connected", Some(&id.to_string()));
                }
                // Membership was cleared when the previous link went down
                if let (Some(project_id), Some(rooms)) = (self.tracked, self.rooms.as_mut()) {
                    rooms.join(project_id);
                }
            }
            LinkSignal::Disconnected { reason } => {
                self.connected_tx.send_replace(false);
                if let Some(rooms) = self.rooms.as_mut() {
                    rooms.connection_lost();
                }
                if let Some(logger) = &self.logger {
                    logger.log_connection("disconnected", Some(&reason));
                }
            }
            LinkSignal::Frame(text) => {
                if self.mux.ingest(&text).is_ok() && self.tracked.is_some() {
                    self.spawn_refresh();
                }
            }
        }
    }

    /// Pulls early. Runs detached so frames keep flowing meanwhile.
    fn spawn_refresh(&self) {
        let poller = self.poller.clone();
        tokio::spawn(async move {
            if let Err(e) = poller.refresh_now().await {
                tracing::debug!(error = %e, "Event-triggered refresh failed");
            }
        });
    }

    fn on_poll(&mut self) {
        let state = self.poll_rx.borrow_and_update().clone();
        self.stale_tx.send_if_modified(|stale| {
            let changed = *stale != state.stale;
            *stale = state.stale;
            changed
        });

        let Some(Pulled::Project(snapshot)) = &state.snapshot else {
            return;
        };
        for event in self.interpreter.apply(snapshot) {
            match &event {
                PhaseEvent::WorkflowCompleted { results_path, .. } => {
                    tracing::info!(%results_path, "Workflow completed");
                }
                PhaseEvent::WorkflowFailed { error, .. } => {
                    tracing::warn!(%error, "Workflow failed");
                }
                PhaseEvent::PhaseChanged { .. } => {}
            }
            let _ = self.events_tx.send(event);
        }
        if let Some(phase) = self.interpreter.phase() {
            self.clock.observe(phase, Instant::now());
        }
        self.publish_progress();
    }

    fn publish_progress(&self) {
        let estimate = self.clock.estimate(Instant::now(), &self.options.estimates);
        self.progress_tx.send_if_modified(|current| {
            let changed = *current != estimate;
            *current = estimate;
            changed
        });
    }
}

async fn next_signal(
    signals: &mut Option<mpsc::UnboundedReceiver<LinkSignal>>,
) -> Option<LinkSignal> {
    match signals {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}
