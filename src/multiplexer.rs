//! Normalizes push frames into one ordered event stream.
//!
//! Every accepted frame becomes a [`WorkflowEvent`] with a local arrival
//! number, is appended to a bounded log and handed to each subscriber in
//! registration order. Delivery is at-least-once: nothing is deduplicated.

use crate::error::SyncResult;
use crate::protocol::{decode_frame, EventKind, EventPayload};
use crate::structured_logger::StructuredLogger;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::VecDeque;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, Mutex, Weak};
use tokio::sync::watch;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct WorkflowEvent {
    pub kind: EventKind,
    pub payload: EventPayload,
    /// Local, strictly increasing. Not a server sequence number.
    pub arrival_order: u64,
    pub received_at: DateTime<Utc>,
}

type Handler = Arc<dyn Fn(&WorkflowEvent) + Send + Sync>;

#[derive(Default)]
struct Registry {
    next_id: u64,
    handlers: Vec<(u64, Handler)>,
}

/// Shared list of event subscribers. Clones refer to the same list.
#[derive(Clone, Default)]
pub struct Subscribers {
    inner: Arc<Mutex<Registry>>,
}

impl Subscribers {
    pub fn subscribe(
        &self,
        handler: impl Fn(&WorkflowEvent) + Send + Sync + 'static,
    ) -> Unsubscribe {
        let id = match self.inner.lock() {
            Ok(mut registry) => {
                registry.next_id += 1;
                let id = registry.next_id;
                registry.handlers.push((id, Arc::new(handler)));
                id
            }
            Err(_) => 0,
        };
        Unsubscribe {
            id,
            registry: Arc::downgrade(&self.inner),
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map(|r| r.handlers.len()).unwrap_or(0)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Copies the current handlers so dispatch runs without the lock held.
    fn snapshot(&self) -> Vec<Handler> {
        self.inner
            .lock()
            .map(|r| r.handlers.iter().map(|(_, h)| Arc::clone(h)).collect())
            .unwrap_or_default()
    }
}

/// Removes a subscription. Dropping it without calling `unsubscribe` keeps
/// the handler registered.
#[must_use = "keep the token to be able to unsubscribe"]
pub struct Unsubscribe {
    id: u64,
    registry: Weak<Mutex<Registry>>,
}

impl Unsubscribe {
    pub fn unsubscribe(self) {
        if let Some(registry) = self.registry.upgrade() {
            if let Ok(mut registry) = registry.lock() {
                registry.handlers.retain(|(id, _)| *id != self.id);
            }
        }
    }
}

pub struct EventMultiplexer {
    subscribers: Subscribers,
    log: VecDeque<WorkflowEvent>,
    capacity: usize,
    next_order: u64,
    last_tx: watch::Sender<Option<WorkflowEvent>>,
    logger: Option<Arc<StructuredLogger>>,
}

impl EventMultiplexer {
    pub fn new(capacity: usize, logger: Option<Arc<StructuredLogger>>) -> Self {
        let (last_tx, _) = watch::channel(None);
        Self {
            subscribers: Subscribers::default(),
            log: VecDeque::with_capacity(capacity.min(1024)),
            capacity: capacity.max(1),
            next_order: 0,
            last_tx,
            logger,
        }
    }

    pub fn subscribe(
        &self,
        handler: impl Fn(&WorkflowEvent) + Send + Sync + 'static,
    ) -> Unsubscribe {
        self.subscribers.subscribe(handler)
    }

    /// Handle for registering subscribers from outside the owning task.
    pub fn subscribers(&self) -> Subscribers {
        self.subscribers.clone()
    }

    pub fn last_event(&self) -> watch::Receiver<Option<WorkflowEvent>> {
        self.last_tx.subscribe()
    }

    /// Retained events, oldest first.
    pub fn log(&self) -> impl Iterator<Item = &WorkflowEvent> {
        self.log.iter()
    }

    /// Decodes one raw frame and dispatches it.
    ///
    /// Frames outside the wire schema are rejected here and never reach a
    /// subscriber.
    pub fn ingest(&mut self, frame: &str) -> SyncResult<WorkflowEvent> {
        let (kind, payload) = match decode_frame(frame) {
            Ok(decoded) => decoded,
            Err(e) => {
                tracing::warn!(error = %e, "Dropping push frame");
                if let Some(logger) = &self.logger {
                    logger.log_rejected_frame(&e.to_string());
                }
                return Err(e);
            }
        };
        if let EventPayload::Malformed { reason, .. } = &payload {
            tracing::warn!(%kind, %reason, "Push payload failed validation");
        }

        self.next_order += 1;
        let event = WorkflowEvent {
            kind,
            payload,
            arrival_order: self.next_order,
            received_at: Utc::now(),
        };
        tracing::debug!(%kind, order = event.arrival_order, "Push event");

        if self.log.len() == self.capacity {
            self.log.pop_front();
        }
        self.log.push_back(event.clone());
        if let Some(logger) = &self.logger {
            logger.log_push_event(&event);
        }
        self.last_tx.send_replace(Some(event.clone()));

        self.dispatch(&event);
        Ok(event)
    }

    fn dispatch(&self, event: &WorkflowEvent) {
        for handler in self.subscribers.snapshot() {
            if catch_unwind(AssertUnwindSafe(|| handler(event))).is_err() {
                tracing::warn!(kind = %event.kind, "Event subscriber panicked");
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::protocol::ProgressPayload;

    const PROGRESS: &str =
        r#"42["progress_update",{"stage":"planning","message":"Building..."}]"#;
    const COMPLETED: &str = r#"42["workflow_completed",{"status":"completed"}]"#;

    fn recorder(mux: &EventMultiplexer) -> (Arc<Mutex<Vec<u64>>>, Unsubscribe) {
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let token = mux.subscribe(move |e| sink.lock().unwrap().push(e.arrival_order));
        (seen, token)
    }

    #[test]
    fn test_events_are_numbered_and_dispatched_in_order() {
        let mut mux = EventMultiplexer::new(10, None);
        let (seen, _token) = recorder(&mux);

        let first = mux.ingest(PROGRESS).unwrap();
        mux.ingest(COMPLETED).unwrap();

        assert_eq!(first.kind, EventKind::ProgressUpdate);
        assert_eq!(
            first.payload,
            EventPayload::Progress(ProgressPayload {
                stage: "planning".to_string(),
                message: "Building...".to_string(),
            })
        );
        assert_eq!(*seen.lock().unwrap(), vec![1, 2]);
        assert_eq!(
            mux.last_event().borrow().as_ref().map(|e| e.kind),
            Some(EventKind::Completed)
        );
    }

    #[test]
    fn test_duplicates_are_not_collapsed() {
        let mut mux = EventMultiplexer::new(10, None);
        let (seen, _token) = recorder(&mux);

        mux.ingest(COMPLETED).unwrap();
        mux.ingest(COMPLETED).unwrap();

        assert_eq!(seen.lock().unwrap().len(), 2);
        assert_eq!(mux.log().count(), 2);
    }

    #[test]
    fn test_unknown_event_is_dropped() {
        let mut mux = EventMultiplexer::new(10, None);
        let (seen, _token) = recorder(&mux);

        assert!(mux.ingest(r#"42["project_deleted",{}]"#).is_err());
        assert!(mux.ingest("not json").is_err());

        assert!(seen.lock().unwrap().is_empty());
        assert_eq!(mux.log().count(), 0);
        assert!(mux.last_event().borrow().is_none());
    }

    #[test]
    fn test_malformed_payload_is_still_dispatched() {
        let mut mux = EventMultiplexer::new(10, None);
        let (seen, _token) = recorder(&mux);

        let event = mux
            .ingest(r#"42["prompts_generated",{"count":"lots"}]"#)
            .unwrap();

        assert!(matches!(event.payload, EventPayload::Malformed { .. }));
        assert_eq!(seen.lock().unwrap().len(), 1);
    }

    #[test]
    fn test_log_is_bounded() {
        let mut mux = EventMultiplexer::new(3, None);
        for _ in 0..5 {
            mux.ingest(PROGRESS).unwrap();
        }
        let orders: Vec<u64> = mux.log().map(|e| e.arrival_order).collect();
        assert_eq!(orders, vec![3, 4, 5]);
    }

    #[test]
    fn test_unsubscribe_stops_delivery() {
        let mut mux = EventMultiplexer::new(10, None);
        let (seen, token) = recorder(&mux);

        mux.ingest(PROGRESS).unwrap();
        token.unsubscribe();
        mux.ingest(PROGRESS).unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![1]);
        assert!(mux.subscribers().is_empty());
    }

    #[test]
    fn test_subscribing_during_dispatch_affects_next_pass_only() {
        let mut mux = EventMultiplexer::new(10, None);
        let subscribers = mux.subscribers();
        let late_calls = Arc::new(Mutex::new(0));

        let late = Arc::clone(&late_calls);
        let _token = mux.subscribe(move |_| {
            let late = Arc::clone(&late);
            let _inner = subscribers.subscribe(move |_| *late.lock().unwrap() += 1);
        });

        mux.ingest(PROGRESS).unwrap();
        assert_eq!(*late_calls.lock().unwrap(), 0);

        mux.ingest(PROGRESS).unwrap();
        assert_eq!(*late_calls.lock().unwrap(), 1);
    }

    #[test]
    fn test_unsubscribing_during_dispatch_affects_next_pass_only() {
        let mut mux = EventMultiplexer::new(10, None);
        let victim_token: Arc<Mutex<Option<Unsubscribe>>> = Arc::new(Mutex::new(None));

        let pending = Arc::clone(&victim_token);
        let _remover = mux.subscribe(move |_| {
            if let Some(token) = pending.lock().unwrap().take() {
                token.unsubscribe();
            }
        });
        let (seen, token) = recorder(&mux);
        *victim_token.lock().unwrap() = Some(token);

        mux.ingest(PROGRESS).unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![1]);
        assert_eq!(mux.subscribers().len(), 1);

        mux.ingest(PROGRESS).unwrap();
        assert_eq!(*seen.lock().unwrap(), vec![1]);
    }

    #[test]
    fn test_panicking_subscriber_does_not_stop_dispatch() {
        let mut mux = EventMultiplexer::new(10, None);
        let _bad = mux.subscribe(|_| panic!("subscriber bug"));
        let (seen, _token) = recorder(&mux);

        mux.ingest(PROGRESS).unwrap();

        assert_eq!(*seen.lock().unwrap(), vec![1]);
    }
}
