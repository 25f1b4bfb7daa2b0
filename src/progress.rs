//! Heuristic progress for phases with no server-side progress signal.
//!
//! The server only reports coarse statuses, so a long phase would look
//! frozen. Each long-running phase has an expected duration; the estimate
//! counts down from the moment the phase was first observed.

use crate::interpreter::Phase;
use serde::Serialize;
use std::collections::HashMap;
use std::time::Duration;
use tokio::time::Instant;

/// The ratio never reaches 1.0; only the server decides a phase is done.
pub const MAX_RATIO: f64 = 0.95;

#[derive(Debug, Clone, PartialEq)]
pub struct EstimateTable {
    expected: HashMap<Phase, Duration>,
}

impl Default for EstimateTable {
    fn default() -> Self {
        let expected = [
            (Phase::BuildingArchitecture, 300),
            (Phase::WritingPrompts, 150),
            (Phase::Reviewing, 20),
            (Phase::Refining, 140),
        ]
        .into_iter()
        .map(|(phase, secs)| (phase, Duration::from_secs(secs)))
        .collect();
        Self { expected }
    }
}

impl EstimateTable {
    pub fn set(&mut self, phase: Phase, expected: Duration) {
        self.expected.insert(phase, expected);
    }

    pub fn expected(&self, phase: Phase) -> Option<Duration> {
        self.expected.get(&phase).copied()
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ProgressEstimate {
    pub phase: Phase,
    /// In `[0.0, MAX_RATIO]`.
    pub elapsed_ratio: f64,
    pub remaining_secs: u64,
    /// `~Xm Ys`, `~Ys`, or `almost done...`.
    pub remaining: String,
}

/// Estimates progress through `phase`, entered at `entered_at`.
///
/// Returns `None` for phases without an expected duration.
pub fn estimate(
    phase: Phase,
    entered_at: Instant,
    now: Instant,
    table: &EstimateTable,
) -> Option<ProgressEstimate> {
    let expected = table.expected(phase)?;
    let elapsed = now.saturating_duration_since(entered_at);
    let ratio = if expected.is_zero() {
        MAX_RATIO
    } else {
        (elapsed.as_secs_f64() / expected.as_secs_f64()).min(MAX_RATIO)
    };
    let remaining_secs = expected.saturating_sub(elapsed).as_secs();

    Some(ProgressEstimate {
        phase,
        elapsed_ratio: ratio,
        remaining_secs,
        remaining: format_remaining(remaining_secs),
    })
}

pub fn format_remaining(secs: u64) -> String {
    if secs == 0 {
        return "almost done...".to_string();
    }
    let (m, s) = (secs / 60, secs % 60);
    if m > 0 {
        format!("~{}m {}s", m, s)
    } else {
        format!("~{}s", s)
    }
}

/// Remembers when the current phase was first observed.
#[derive(Debug, Default)]
pub struct PhaseClock {
    current: Option<(Phase, Instant)>,
}

impl PhaseClock {
    /// Records an observation; the entry time resets only when the phase changes.
    pub fn observe(&mut self, phase: Phase, now: Instant) {
        match self.current {
            Some((current, _)) if current == phase => {}
            _ => self.current = Some((phase, now)),
        }
    }

    pub fn reset(&mut self) {
        self.current = None;
    }

    pub fn entered_at(&self) -> Option<(Phase, Instant)> {
        self.current
    }

    pub fn estimate(&self, now: Instant, table: &EstimateTable) -> Option<ProgressEstimate> {
        let (phase, entered_at) = self.current?;
        estimate(phase, entered_at, now, table)
    }
}
