//! Read-only view of the tracked workflow for presentation.

use super::Phase;
use crate::snapshot::{ProjectId, Question, WorkflowSnapshot};
use std::collections::BTreeMap;

/// Shown when a failed snapshot carries no error message.
pub const DEFAULT_FAILURE_MESSAGE: &str = "An unexpected error occurred.";

/// Phase plus the sub-state derived from the latest snapshot.
#[derive(Debug, Clone, PartialEq)]
pub struct PhaseView {
    pub project_id: ProjectId,
    pub phase: Phase,
    pub title: String,
    pub requires_input: bool,
    pub is_terminal: bool,
    /// Pending questions, only while `AwaitingUserAnswers`.
    pub questions: Vec<Question>,
    pub spec_md: Option<String>,
    pub tech_stack: Option<BTreeMap<String, Vec<String>>>,
    /// Failure message, only while `Failed`.
    pub error: Option<String>,
    pub refinements_remaining: u32,
}

impl PhaseView {
    pub fn derive(phase: Phase, snapshot: &WorkflowSnapshot) -> Self {
        let questions = if phase == Phase::AwaitingUserAnswers {
            snapshot.stage_data.questions.clone()
        } else {
            Vec::new()
        };
        let error = (phase == Phase::Failed).then(|| {
            snapshot
                .stage_data
                .error
                .as_deref()
                .filter(|msg| !msg.trim().is_empty())
                .unwrap_or(DEFAULT_FAILURE_MESSAGE)
                .to_string()
        });

        Self {
            project_id: snapshot.id,
            phase,
            title: snapshot.title.clone(),
            requires_input: phase.requires_input(),
            is_terminal: phase.is_terminal(),
            questions,
            spec_md: snapshot.spec_md.clone(),
            tech_stack: snapshot.stage_data.tech_stack.clone(),
            error,
            refinements_remaining: snapshot.refinements_remaining(),
        }
    }
}
