//! Scopes the shared push connection to one project room.
//!
//! At most one membership exists at a time. Operations while the
//! connection is down are dropped, not queued; the owner re-issues `join`
//! once a new link is up.

use crate::error::{SyncError, SyncResult};
use crate::protocol::ClientMessage;
use crate::snapshot::ProjectId;
use std::sync::Arc;

/// Where room control messages are written.
pub trait RoomChannel: Send + Sync {
    fn is_live(&self) -> bool;
    fn send(&self, message: &ClientMessage) -> SyncResult<()>;
}

pub struct RoomSubscriptionManager {
    channel: Arc<dyn RoomChannel>,
    current: Option<ProjectId>,
}

impl RoomSubscriptionManager {
    pub fn new(channel: Arc<dyn RoomChannel>) -> Self {
        Self {
            channel,
            current: None,
        }
    }

    pub fn current(&self) -> Option<ProjectId> {
        self.current
    }

    /// Joins the room for `project_id`, leaving the current room first.
    pub fn join(&mut self, project_id: ProjectId) {
        if !self.channel.is_live() {
            tracing::debug!(project = %project_id, "Join deferred: connection not live");
            return;
        }
        if self.current == Some(project_id) {
            return;
        }
        if let Some(previous) = self.current.take() {
            if let Err(e) = self.send(ClientMessage::LeaveProject {
                project_id: previous,
            }) {
                tracing::warn!(project = %previous, error = %e, "Failed to leave room");
            }
        }
        match self.send(ClientMessage::JoinProject { project_id }) {
            Ok(()) => {
                tracing::info!(project = %project_id, "Joined project room");
                self.current = Some(project_id);
            }
            Err(e) => tracing::warn!(project = %project_id, error = %e, "Failed to join room"),
        }
    }

    pub fn leave(&mut self, project_id: ProjectId) {
        if !self.channel.is_live() || self.current != Some(project_id) {
            return;
        }
        self.current = None;
        match self.send(ClientMessage::LeaveProject { project_id }) {
            Ok(()) => tracing::info!(project = %project_id, "Left project room"),
            Err(e) => tracing::warn!(project = %project_id, error = %e, "Failed to leave room"),
        }
    }

    /// Forgets the membership; the server drops rooms with the connection.
    pub fn connection_lost(&mut self) {
        if let Some(project_id) = self.current.take() {
            tracing::debug!(project = %project_id, "Room membership dropped with connection");
        }
    }

    fn send(&self, message: ClientMessage) -> SyncResult<()> {
        self.channel.send(&message).map_err(|e| {
            SyncError::Room(format!(
                "{} for project {}: {}",
                action(&message),
                message.project_id(),
                e
            ))
        })
    }
}

fn action(message: &ClientMessage) -> &'static str {
    match message {
        ClientMessage::JoinProject { .. } => "join",
        ClientMessage::LeaveProject { .. } => "leave",
    }
}
