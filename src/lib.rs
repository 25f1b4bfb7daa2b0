//! Client-side synchronization for long-running prompt-generation workflows.
//!
//! A tracked workflow is followed over two unsynchronized channels: push
//! events over one WebSocket connection, and periodic HTTP polling. Push
//! events only make the poller fetch earlier; the pulled snapshot is the
//! single source of truth for the derived phase.

pub mod config;
pub mod connection;
pub mod error;
pub mod interpreter;
pub mod multiplexer;
pub mod progress;
pub mod protocol;
pub mod pull;
pub mod rooms;
pub mod snapshot;
pub mod structured_logger;
pub mod sync_paths;
pub mod tracker;

#[cfg(test)]
mod testing;
