//! Structured JSONL log of everything the sync core observed.
//!
//! Each line carries:
//! - A monotonic sequence number for ordering
//! - An ISO 8601 timestamp with microsecond precision
//! - The session ID for correlation across runs
//! - The emitting component and the structured event

use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use std::fs::{File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;

use crate::interpreter::Phase;
use crate::multiplexer::WorkflowEvent;

/// Structured JSONL logger for diagnostics and event reconstruction.
pub struct StructuredLogger {
    session_id: String,
    seq: AtomicU64,
    log_file: Mutex<File>,
    log_path: PathBuf,
}

/// A single log entry in JSONL format.
#[derive(Serialize, serde::Deserialize)]
pub struct LogEntry {
    /// Monotonic sequence number (unique across the session)
    pub seq: u64,
    /// ISO 8601 timestamp with microseconds
    pub ts: String,
    pub session_id: String,
    /// Component that emitted the entry
    pub component: String,
    pub event: Value,
}

impl StructuredLogger {
    /// Creates a logger writing to `<logs_dir>/events.jsonl`.
    ///
    /// # Errors
    ///
    /// Returns an error if the directory cannot be created or the file
    /// cannot be opened for appending.
    pub fn new(session_id: &str, logs_dir: &Path) -> anyhow::Result<Self> {
        std::fs::create_dir_all(logs_dir)?;
        let log_path = logs_dir.join("events.jsonl");
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&log_path)?;

        Ok(Self {
            session_id: session_id.to_string(),
            seq: AtomicU64::new(0),
            log_file: Mutex::new(file),
            log_path,
        })
    }

    fn next_seq(&self) -> u64 {
        self.seq.fetch_add(1, Ordering::SeqCst) + 1
    }

    /// Logs a structured event as a single JSON line. Write failures are dropped.
    pub fn log(&self, component: &str, event: impl Serialize) {
        let entry = LogEntry {
            seq: self.next_seq(),
            ts: Utc::now().format("%Y-%m-%dT%H:%M:%S%.6fZ").to_string(),
            session_id: self.session_id.clone(),
            component: component.to_string(),
            event: serde_json::to_value(event).unwrap_or(Value::Null),
        };

        if let Ok(mut file) = self.log_file.lock() {
            if let Ok(line) = serde_json::to_string(&entry) {
                let _ = writeln!(file, "{}", line);
                let _ = file.flush();
            }
        }
    }

    /// Logs a normalized push event.
    pub fn log_push_event(&self, event: &WorkflowEvent) {
        self.log(
            "Multiplexer",
            serde_json::json!({
                "type": "PushEvent",
                "event": event
            }),
        );
    }

    /// Logs a frame dropped at the protocol boundary.
    pub fn log_rejected_frame(&self, reason: &str) {
        self.log(
            "Multiplexer",
            serde_json::json!({
                "type": "RejectedFrame",
                "reason": reason
            }),
        );
    }

    /// Logs a phase transition.
    pub fn log_phase_transition(&self, from: Option<&Phase>, to: &Phase) {
        self.log(
            "Interpreter",
            serde_json::json!({
                "type": "PhaseTransition",
                "from": from,
                "to": to
            }),
        );
    }

    /// Logs a failed pull.
    pub fn log_pull_failure(&self, error: &str, consecutive_failures: u32) {
        self.log(
            "Poller",
            serde_json::json!({
                "type": "PullFailed",
                "error": error,
                "consecutive_failures": consecutive_failures
            }),
        );
    }

    /// Logs a connection lifecycle change.
    pub fn log_connection(&self, state: &str, detail: Option<&str>) {
        self.log(
            "Connection",
            serde_json::json!({
                "type": "Lifecycle",
                "state": state,
                "detail": detail
            }),
        );
    }

    pub fn path(&self) -> &PathBuf {
        &self.log_path
    }

    pub fn session_id(&self) -> &str {
        &self.session_id
    }
}

#[cfg(test)]
#[path = "tests/structured_logger_tests.rs"]
mod tests;
