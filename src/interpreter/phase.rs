use crate::snapshot::WorkflowSnapshot;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Labels of the six-step stepper shown while a workflow runs.
pub const STEPS: [&str; 6] = [
    "Questions",
    "Your Answers",
    "Architecture",
    "Prompts",
    "Review",
    "Done",
];

/// Client-side phase derived from a snapshot's raw status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Phase {
    QuestionsGenerating,
    AwaitingUserAnswers,
    BuildingArchitecture,
    AwaitingApproval,
    WritingPrompts,
    Reviewing,
    Refining,
    Completed,
    Failed,
    /// Status string this client does not recognize.
    Unknown,
}

impl Phase {
    pub const ALL: [Phase; 10] = [
        Phase::QuestionsGenerating,
        Phase::AwaitingUserAnswers,
        Phase::BuildingArchitecture,
        Phase::AwaitingApproval,
        Phase::WritingPrompts,
        Phase::Reviewing,
        Phase::Refining,
        Phase::Completed,
        Phase::Failed,
        Phase::Unknown,
    ];

    /// Maps a raw server status to a phase.
    ///
    /// `awaiting_answers` only counts as waiting on the user once the
    /// questions have actually arrived; before that the questions are
    /// still being generated.
    pub fn from_status(status: &str, has_questions: bool) -> Self {
        match status {
            "eliciting" => Self::QuestionsGenerating,
            "awaiting_answers" if has_questions => Self::AwaitingUserAnswers,
            "awaiting_answers" => Self::QuestionsGenerating,
            "planning" => Self::BuildingArchitecture,
            "awaiting_approval" => Self::AwaitingApproval,
            "synthesizing" => Self::WritingPrompts,
            "critiquing" => Self::Reviewing,
            "refining" => Self::Refining,
            "completed" => Self::Completed,
            "failed" => Self::Failed,
            _ => Self::Unknown,
        }
    }

    pub fn from_snapshot(snapshot: &WorkflowSnapshot) -> Self {
        Self::from_status(&snapshot.status, snapshot.has_questions())
    }

    /// Configuration key, e.g. `building_architecture`.
    pub fn key(self) -> &'static str {
        match self {
            Self::QuestionsGenerating => "questions_generating",
            Self::AwaitingUserAnswers => "awaiting_user_answers",
            Self::BuildingArchitecture => "building_architecture",
            Self::AwaitingApproval => "awaiting_approval",
            Self::WritingPrompts => "writing_prompts",
            Self::Reviewing => "reviewing",
            Self::Refining => "refining",
            Self::Completed => "completed",
            Self::Failed => "failed",
            Self::Unknown => "unknown",
        }
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Completed | Self::Failed)
    }

    /// Whether the workflow is blocked on the user.
    pub fn requires_input(self) -> bool {
        matches!(self, Self::AwaitingUserAnswers | Self::AwaitingApproval)
    }

    /// Index into [`STEPS`], or `None` for phases outside the stepper.
    pub fn step(self) -> Option<usize> {
        match self {
            Self::QuestionsGenerating => Some(0),
            Self::AwaitingUserAnswers => Some(1),
            Self::BuildingArchitecture | Self::AwaitingApproval => Some(2),
            Self::WritingPrompts => Some(3),
            Self::Reviewing | Self::Refining => Some(4),
            Self::Completed => Some(5),
            Self::Failed | Self::Unknown => None,
        }
    }

    /// Status line shown while in this phase.
    pub fn description(self) -> &'static str {
        match self {
            Self::QuestionsGenerating => "Analyzing your idea and generating questions...",
            Self::AwaitingUserAnswers => "Answer the questions to continue.",
            Self::BuildingArchitecture => "Building your app's architecture...",
            Self::AwaitingApproval => "Review the architecture and approve to continue.",
            Self::WritingPrompts => "Writing optimized prompts...",
            Self::Reviewing => "Reviewing prompt quality...",
            Self::Refining => "Refining prompts based on review...",
            Self::Completed => "Your prompts are ready.",
            Self::Failed => "Generation failed.",
            Self::Unknown => "Working...",
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.key())
    }
}
