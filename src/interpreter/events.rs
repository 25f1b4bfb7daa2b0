//! Events emitted by the interpreter after a snapshot is applied.
//!
//! These are for notification and logging. Consumers that only need the
//! current state read the `PhaseView` watch channel instead.

use super::Phase;
use crate::snapshot::ProjectId;
use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "type")]
pub enum PhaseEvent {
    /// Phase changed; `from` is `None` on the first observation
    PhaseChanged { from: Option<Phase>, to: Phase },
    /// The tracked workflow reached `completed`. Fires once per instance.
    WorkflowCompleted {
        project_id: ProjectId,
        results_path: String,
    },
    /// The tracked workflow entered `failed`
    WorkflowFailed { project_id: ProjectId, error: String },
}

/// Location of the generated results for a project.
pub fn results_path(project_id: ProjectId) -> String {
    format!("/projects/{}/prompts", project_id)
}
