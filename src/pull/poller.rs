//! Fixed-cadence polling with request coalescing.
//!
//! The poller is the authoritative path: push events only make it fetch
//! earlier. At most one request is in flight; callers that ask for a
//! refresh while one is running share its result.

use super::{fetch, PollTarget, Pulled, SnapshotSource};
use crate::error::{SyncError, SyncResult};
use crate::structured_logger::StructuredLogger;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;

type InFlight = Shared<BoxFuture<'static, SyncResult<Pulled>>>;

/// Latest pull outcome as seen by consumers.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct PollState {
    /// Last successful pull. Kept across failures.
    pub snapshot: Option<Pulled>,
    pub consecutive_failures: u32,
    /// Raised after too many consecutive failures, cleared by a success.
    pub stale: bool,
    pub last_error: Option<SyncError>,
}

#[derive(Default)]
struct Inner {
    target: Option<PollTarget>,
    /// Bumped on every start/stop; results of older generations are dropped.
    generation: u64,
    in_flight: Option<(u64, InFlight)>,
    timer: Option<JoinHandle<()>>,
}

/// Cheap to clone; clones drive the same poller.
#[derive(Clone)]
pub struct PollingFallback {
    source: Arc<dyn SnapshotSource>,
    stale_after: u32,
    inner: Arc<Mutex<Inner>>,
    state_tx: Arc<watch::Sender<PollState>>,
    logger: Option<Arc<StructuredLogger>>,
}

impl PollingFallback {
    pub fn new(
        source: Arc<dyn SnapshotSource>,
        stale_after: u32,
        logger: Option<Arc<StructuredLogger>>,
    ) -> Self {
        let (state_tx, _) = watch::channel(PollState::default());
        Self {
            source,
            stale_after: stale_after.max(1),
            inner: Arc::new(Mutex::new(Inner::default())),
            state_tx: Arc::new(state_tx),
            logger,
        }
    }

    pub fn state(&self) -> watch::Receiver<PollState> {
        self.state_tx.subscribe()
    }

    pub fn target(&self) -> Option<PollTarget> {
        self.lock().target
    }

    /// Starts polling `target` every `interval`, beginning immediately.
    ///
    /// Replaces any previous target and forgets its snapshot.
    pub fn start(&self, target: PollTarget, interval: Duration) {
        self.stop();
        {
            let mut inner = self.lock();
            inner.target = Some(target);
            let poller = self.clone();
            inner.timer = Some(tokio::spawn(async move {
                let mut ticker = tokio::time::interval(interval);
                ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
                loop {
                    ticker.tick().await;
                    // Failures are recorded in the poll state
                    let _ = poller.refresh_now().await;
                }
            }));
        }
        tracing::debug!(?target, interval_ms = interval.as_millis() as u64, "Polling started");
    }

    /// Cancels the timer. Results still in flight are discarded.
    pub fn stop(&self) {
        let mut inner = self.lock();
        inner.generation += 1;
        inner.in_flight = None;
        if let Some(timer) = inner.timer.take() {
            timer.abort();
        }
        if inner.target.take().is_some() {
            tracing::debug!("Polling stopped");
            self.state_tx.send_replace(PollState::default());
        }
    }

    /// Fetches now, or joins the fetch already in flight.
    pub async fn refresh_now(&self) -> SyncResult<Pulled> {
        let (generation, request) = {
            let mut inner = self.lock();
            let target = inner
                .target
                .ok_or_else(|| SyncError::Pull("nothing to poll".to_string()))?;
            let generation = inner.generation;
            match &inner.in_flight {
                Some((g, request)) if *g == generation => (generation, request.clone()),
                _ => {
                    let source = Arc::clone(&self.source);
                    let request = async move { fetch(source.as_ref(), target).await }
                        .boxed()
                        .shared();
                    inner.in_flight = Some((generation, request.clone()));
                    (generation, request)
                }
            }
        };

        let result = request.clone().await;
        self.settle(generation, &request, &result);
        result
    }

    /// Records `result` once per request, unless its generation is gone.
    fn settle(&self, generation: u64, request: &InFlight, result: &SyncResult<Pulled>) {
        {
            let mut inner = self.lock();
            if inner.generation != generation {
                tracing::debug!("Discarding pull result from a stopped poller");
                return;
            }
            match &inner.in_flight {
                Some((_, current)) if Shared::ptr_eq(current, request) => inner.in_flight = None,
                // Another caller of the same request already recorded it
                _ => return,
            }
        }

        let stale_after = self.stale_after;
        let logger = self.logger.clone();
        self.state_tx.send_modify(|state| match result {
            Ok(pulled) => {
                if state.stale {
                    tracing::info!("Pull channel recovered");
                }
                state.snapshot = Some(pulled.clone());
                state.consecutive_failures = 0;
                state.stale = false;
                state.last_error = None;
            }
            Err(e) => {
                state.consecutive_failures += 1;
                state.last_error = Some(e.clone());
                let now_stale = state.consecutive_failures >= stale_after;
                if now_stale && !state.stale {
                    tracing::warn!(
                        failures = state.consecutive_failures,
                        "Pull channel failing; data may be stale"
                    );
                }
                state.stale = now_stale;
                tracing::warn!(error = %e, failures = state.consecutive_failures, "Pull failed");
                if let Some(logger) = &logger {
                    logger.log_pull_failure(&e.to_string(), state.consecutive_failures);
                }
            }
        });
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::snapshot::{ProjectId, WorkflowSnapshot};
    use crate::testing::FakeSource;

    const WAIT: Duration = Duration::from_secs(120);

    async fn wait_for(
        state: &mut watch::Receiver<PollState>,
        f: impl FnMut(&PollState) -> bool,
    ) -> PollState {
        tokio::time::timeout(WAIT, state.wait_for(f))
            .await
            .expect("timed out")
            .expect("poller dropped")
            .clone()
    }

    fn status_of(state: &PollState) -> Option<String> {
        match &state.snapshot {
            Some(Pulled::Project(snapshot)) => Some(snapshot.status.clone()),
            _ => None,
        }
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_refreshes_share_one_request() {
        let source = FakeSource::new();
        source.set_status(ProjectId(1), "planning");
        source.set_latency(Duration::from_secs(1));
        let poller = PollingFallback::new(source.clone(), 3, None);
        poller.start(PollTarget::Project(ProjectId(1)), Duration::from_secs(30));

        let (a, b) = tokio::join!(poller.refresh_now(), poller.refresh_now());

        assert_eq!(a.unwrap(), b.unwrap());
        assert_eq!(source.fetches(), 1);
        assert_eq!(source.max_in_flight(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_polls_on_cadence() {
        let source = FakeSource::new();
        source.set_status(ProjectId(1), "planning");
        let poller = PollingFallback::new(source.clone(), 3, None);
        let mut state = poller.state();

        poller.start(PollTarget::Project(ProjectId(1)), Duration::from_secs(3));
        wait_for(&mut state, |s| s.snapshot.is_some()).await;

        source.set_status(ProjectId(1), "awaiting_approval");
        let updated = wait_for(&mut state, |s| {
            status_of(s).as_deref() == Some("awaiting_approval")
        })
        .await;
        assert_eq!(updated.consecutive_failures, 0);
        assert!(source.fetches() >= 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_after_consecutive_failures_and_recovery() {
        let source = FakeSource::new();
        source.set_status(ProjectId(2), "synthesizing");
        let poller = PollingFallback::new(source.clone(), 3, None);
        let mut state = poller.state();

        poller.start(PollTarget::Project(ProjectId(2)), Duration::from_secs(3));
        wait_for(&mut state, |s| s.snapshot.is_some()).await;

        source.set_failing(Some("HTTP 502"));
        let two = wait_for(&mut state, |s| s.consecutive_failures == 2).await;
        assert!(!two.stale);

        let stale = wait_for(&mut state, |s| s.stale).await;
        assert_eq!(stale.consecutive_failures, 3);
        assert_eq!(status_of(&stale).as_deref(), Some("synthesizing"));
        assert_eq!(stale.last_error, Some(SyncError::Pull("HTTP 502".to_string())));

        source.set_failing(None);
        let recovered = wait_for(&mut state, |s| !s.stale).await;
        assert_eq!(recovered.consecutive_failures, 0);
        assert_eq!(recovered.last_error, None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stop_discards_in_flight_result() {
        let source = FakeSource::new();
        source.set_status(ProjectId(3), "planning");
        source.set_latency(Duration::from_secs(5));
        let poller = PollingFallback::new(source.clone(), 3, None);
        let state = poller.state();

        poller.start(PollTarget::Project(ProjectId(3)), Duration::from_secs(3));
        let pending = tokio::spawn({
            let poller = poller.clone();
            async move { poller.refresh_now().await }
        });
        tokio::time::sleep(Duration::from_secs(1)).await;
        poller.stop();

        // The detached caller still gets its answer; the poller ignores it
        assert!(pending.await.unwrap().is_ok());
        assert_eq!(*state.borrow(), PollState::default());
        assert!(poller.refresh_now().await.is_err());
    }

    #[tokio::test(start_paused = true)]
    async fn test_switching_target_forgets_previous_snapshot() {
        let source = FakeSource::new();
        source.set_status(ProjectId(1), "completed");
        source.set_project(WorkflowSnapshot::new(ProjectId(2), "eliciting"));
        let poller = PollingFallback::new(source.clone(), 3, None);
        let mut state = poller.state();

        poller.start(PollTarget::Project(ProjectId(1)), Duration::from_secs(3));
        wait_for(&mut state, |s| status_of(s).as_deref() == Some("completed")).await;

        poller.start(PollTarget::Overview, Duration::from_secs(5));
        let overview = wait_for(&mut state, |s| {
            matches!(&s.snapshot, Some(Pulled::Overview(_)))
        })
        .await;
        let Some(Pulled::Overview(list)) = overview.snapshot else {
            unreachable!()
        };
        assert_eq!(list.len(), 2);
        assert_eq!(poller.target(), Some(PollTarget::Overview));
    }
}
