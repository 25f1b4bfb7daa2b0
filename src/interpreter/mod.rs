//! Status-driven interpreter for the tracked workflow.
//!
//! This is the only place a phase is derived. Every authoritative snapshot
//! goes through [`WorkflowInterpreter::apply`], which recomputes the phase,
//! emits events and broadcasts a [`PhaseView`] on a watch channel.

mod events;
mod phase;
mod view;

pub use events::{results_path, PhaseEvent};
pub use phase::{Phase, STEPS};
pub use view::{PhaseView, DEFAULT_FAILURE_MESSAGE};

use crate::snapshot::{ProjectId, WorkflowSnapshot};
use crate::structured_logger::StructuredLogger;
use std::sync::Arc;
use tokio::sync::watch;

pub struct WorkflowInterpreter {
    tracked: Option<ProjectId>,
    phase: Option<Phase>,
    completion_fired: bool,
    view_tx: watch::Sender<Option<PhaseView>>,
    logger: Option<Arc<StructuredLogger>>,
}

impl WorkflowInterpreter {
    /// Creates an interpreter tracking nothing.
    ///
    /// Returns the interpreter and a receiver that sees `None` until the
    /// first snapshot of the tracked instance is applied.
    pub fn new(
        logger: Option<Arc<StructuredLogger>>,
    ) -> (Self, watch::Receiver<Option<PhaseView>>) {
        let (view_tx, view_rx) = watch::channel(None);
        let interpreter = Self {
            tracked: None,
            phase: None,
            completion_fired: false,
            view_tx,
            logger,
        };
        (interpreter, view_rx)
    }

    /// Switches the tracked instance and forgets everything derived so far.
    pub fn track(&mut self, project_id: Option<ProjectId>) {
        if self.tracked == project_id {
            return;
        }
        tracing::debug!(?project_id, "Interpreter now tracking");
        self.tracked = project_id;
        self.phase = None;
        self.completion_fired = false;
        self.view_tx.send_replace(None);
    }

    pub fn tracked(&self) -> Option<ProjectId> {
        self.tracked
    }

    pub fn phase(&self) -> Option<Phase> {
        self.phase
    }

    /// Applies a freshly pulled snapshot.
    ///
    /// Snapshots of any instance other than the tracked one are ignored.
    pub fn apply(&mut self, snapshot: &WorkflowSnapshot) -> Vec<PhaseEvent> {
        if self.tracked != Some(snapshot.id) {
            tracing::debug!(
                snapshot_id = %snapshot.id,
                tracked = ?self.tracked,
                "Ignoring snapshot for untracked project"
            );
            return Vec::new();
        }

        let next = Phase::from_snapshot(snapshot);
        if next == Phase::Unknown {
            tracing::warn!(status = %snapshot.status, "Unrecognized workflow status");
        }

        let view = PhaseView::derive(next, snapshot);
        let previous = self.phase.replace(next);
        let mut events = Vec::new();

        if previous != Some(next) {
            tracing::info!(from = ?previous, to = %next, project = %snapshot.id, "Phase changed");
            if let Some(logger) = &self.logger {
                logger.log_phase_transition(previous.as_ref(), &next);
            }
            events.push(PhaseEvent::PhaseChanged { from: previous, to: next });

            if next == Phase::Failed {
                events.push(PhaseEvent::WorkflowFailed {
                    project_id: snapshot.id,
                    error: view
                        .error
                        .clone()
                        .unwrap_or_else(|| DEFAULT_FAILURE_MESSAGE.to_string()),
                });
            }
        }

        if next == Phase::Completed && !self.completion_fired {
            self.completion_fired = true;
            events.push(PhaseEvent::WorkflowCompleted {
                project_id: snapshot.id,
                results_path: results_path(snapshot.id),
            });
        }

        self.view_tx.send_replace(Some(view));
        events
    }
}
