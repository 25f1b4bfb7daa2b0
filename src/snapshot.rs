//! Authoritative workflow snapshots obtained from the pull channel.
//!
//! A snapshot is only ever replaced whole after a successful pull. Push
//! events never patch it.

use crate::error::{SyncError, SyncResult};
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;
use std::fmt;

/// Server-side identifier of a workflow instance ("project").
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ProjectId(pub u64);

impl fmt::Display for ProjectId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for ProjectId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        s.trim().parse().map(ProjectId)
    }
}

/// A clarifying question produced by the elicitation stage.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Question {
    pub number: u32,
    #[serde(default)]
    pub topic: String,
    #[serde(default)]
    pub text: String,
    #[serde(default)]
    pub options: Vec<String>,
}

/// Free-form per-stage data. Which keys are present depends on the status.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct StageData {
    /// Pending questions (awaiting_answers).
    #[serde(default, deserialize_with = "null_as_default")]
    pub questions: Vec<Question>,
    /// Tech-stack breakdown by category (planning / awaiting_approval).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tech_stack: Option<BTreeMap<String, Vec<String>>>,
    /// Failure message (failed).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    /// Any other keys, preserved verbatim.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// The authoritative representation of one tracked workflow instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkflowSnapshot {
    pub id: ProjectId,
    pub status: String,
    #[serde(default)]
    pub title: String,
    /// The user's originating idea.
    #[serde(default)]
    pub initial_idea: String,
    #[serde(default)]
    pub current_stage: Option<String>,
    /// Rendered specification, once the architecture stage produced one.
    #[serde(default)]
    pub spec_md: Option<String>,
    #[serde(rename = "workflow_data", default, deserialize_with = "null_as_default")]
    pub stage_data: StageData,
    #[serde(default)]
    pub refinement_count: u32,
    #[serde(default)]
    pub max_refinements: u32,
    #[serde(default)]
    pub created_at: Option<String>,
    #[serde(default)]
    pub updated_at: Option<String>,
    #[serde(default)]
    pub completed_at: Option<String>,
}

fn null_as_default<'de, D, T>(deserializer: D) -> Result<T, D::Error>
where
    D: Deserializer<'de>,
    T: Default + Deserialize<'de>,
{
    Ok(Option::<T>::deserialize(deserializer)?.unwrap_or_default())
}

impl WorkflowSnapshot {
    /// Creates a minimal snapshot with the given status.
    pub fn new(id: ProjectId, status: impl Into<String>) -> Self {
        Self {
            id,
            status: status.into(),
            title: String::new(),
            initial_idea: String::new(),
            current_stage: None,
            spec_md: None,
            stage_data: StageData::default(),
            refinement_count: 0,
            max_refinements: 0,
            created_at: None,
            updated_at: None,
            completed_at: None,
        }
    }

    /// Decodes and validates a single snapshot body.
    pub fn from_json(body: &str) -> SyncResult<Self> {
        let snapshot: Self = serde_json::from_str(body)
            .map_err(|e| SyncError::Pull(format!("invalid snapshot body: {}", e)))?;
        snapshot.validate()?;
        Ok(snapshot)
    }

    /// Decodes and validates a list body. One invalid entry rejects the list.
    pub fn list_from_json(body: &str) -> SyncResult<Vec<Self>> {
        let snapshots: Vec<Self> = serde_json::from_str(body)
            .map_err(|e| SyncError::Pull(format!("invalid snapshot list body: {}", e)))?;
        for snapshot in &snapshots {
            snapshot.validate()?;
        }
        Ok(snapshots)
    }

    /// Checks `refinement_count <= max_refinements`.
    pub fn validate(&self) -> SyncResult<()> {
        if self.refinement_count > self.max_refinements {
            return Err(SyncError::Pull(format!(
                "project {} reports {} refinements with a budget of {}",
                self.id, self.refinement_count, self.max_refinements
            )));
        }
        Ok(())
    }

    pub fn has_questions(&self) -> bool {
        !self.stage_data.questions.is_empty()
    }

    pub fn refinements_remaining(&self) -> u32 {
        self.max_refinements.saturating_sub(self.refinement_count)
    }
}
