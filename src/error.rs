//! Error taxonomy for the sync core.
//!
//! None of these halt the event loop: transport errors become liveness,
//! room errors are logged, pull errors are counted toward the stale flag.
//! A `failed` workflow is a phase, not an error.

use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq)]
pub enum SyncError {
    /// Push connection refused, dropped, or unusable.
    #[error("transport error: {0}")]
    Transport(String),

    /// Join/leave control message could not be sent.
    #[error("room error: {0}")]
    Room(String),

    /// Snapshot fetch failed or returned an invalid snapshot.
    #[error("pull error: {0}")]
    Pull(String),

    /// Inbound frame did not match the wire schema.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Invalid configuration.
    #[error("config error: {0}")]
    Config(String),
}

impl SyncError {
    /// Returns true for errors that only degrade liveness or freshness.
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Self::Config(_))
    }
}

pub type SyncResult<T> = std::result::Result<T, SyncError>;
