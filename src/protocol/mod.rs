//! Wire types for the push channel.
//!
//! The push channel speaks Socket.IO over Engine.IO (see [`packet`]).
//! Server events form a closed set; each one has a versioned payload schema
//! that is validated here, at the boundary, instead of being trusted.

mod packet;

pub use packet::Packet;

use crate::error::{SyncError, SyncResult};
use crate::snapshot::{ProjectId, Question};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};
use std::collections::BTreeMap;

/// Version of the payload schemas below. Bump when a payload changes shape.
pub const PAYLOAD_SCHEMA_VERSION: u32 = 1;

/// Control messages sent from client to server.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClientMessage {
    /// Enter the room that scopes events to one project
    JoinProject { project_id: ProjectId },
    /// Leave a project room
    LeaveProject { project_id: ProjectId },
}

impl ClientMessage {
    pub fn event_name(&self) -> &'static str {
        match self {
            Self::JoinProject { .. } => "join_project",
            Self::LeaveProject { .. } => "leave_project",
        }
    }

    /// Encodes the message as a Socket.IO event packet.
    pub fn to_wire(&self) -> String {
        Packet::Event {
            name: self.event_name().to_string(),
            data: json!({ "project_id": self.project_id() }),
        }
        .encode()
    }

    pub fn project_id(&self) -> ProjectId {
        match self {
            Self::JoinProject { project_id } | Self::LeaveProject { project_id } => *project_id,
        }
    }
}

/// The closed set of server event types.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    ProgressUpdate,
    QuestionsReady,
    SpecReady,
    PromptsGenerated,
    Completed,
    Failed,
    RefinementCompleted,
    RoomJoined,
    Error,
}

impl EventKind {
    pub const ALL: [EventKind; 9] = [
        EventKind::ProgressUpdate,
        EventKind::QuestionsReady,
        EventKind::SpecReady,
        EventKind::PromptsGenerated,
        EventKind::Completed,
        EventKind::Failed,
        EventKind::RefinementCompleted,
        EventKind::RoomJoined,
        EventKind::Error,
    ];

    /// Event name as emitted by the server.
    pub fn wire_name(self) -> &'static str {
        match self {
            Self::ProgressUpdate => "progress_update",
            Self::QuestionsReady => "questions_ready",
            Self::SpecReady => "spec_ready",
            Self::PromptsGenerated => "prompts_generated",
            Self::Completed => "workflow_completed",
            Self::Failed => "workflow_failed",
            Self::RefinementCompleted => "refinement_completed",
            Self::RoomJoined => "joined_project",
            Self::Error => "error",
        }
    }

    pub fn from_wire(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.wire_name() == name)
    }
}

impl std::fmt::Display for EventKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.wire_name())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ProgressPayload {
    pub stage: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QuestionsPayload {
    pub questions: Vec<Question>,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SpecPayload {
    pub spec_md: Option<String>,
    pub tech_stack: Option<BTreeMap<String, Vec<String>>>,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PromptsPayload {
    pub count: u32,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CompletedPayload {
    pub status: String,
    pub total_tokens: Option<u64>,
    pub total_cost: Option<f64>,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct FailedPayload {
    pub error: String,
    pub message: String,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RefinementPayload {
    /// Number of the prompt that was refined.
    pub section: Option<u32>,
    pub message: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoomJoinedPayload {
    pub project_id: ProjectId,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ErrorPayload {
    pub message: String,
}

/// Validated payload of a push event.
///
/// Payloads are hints only. A payload that fails validation is kept as
/// `Malformed` so the event still triggers a re-pull.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "schema", rename_all = "snake_case")]
pub enum EventPayload {
    Progress(ProgressPayload),
    Questions(QuestionsPayload),
    Spec(SpecPayload),
    Prompts(PromptsPayload),
    Completed(CompletedPayload),
    Failed(FailedPayload),
    Refinement(RefinementPayload),
    RoomJoined(RoomJoinedPayload),
    Error(ErrorPayload),
    Malformed { reason: String, raw: Value },
}

impl EventPayload {
    /// Human-readable message carried by the payload, if any.
    pub fn message(&self) -> Option<&str> {
        let message = match self {
            Self::Progress(p) => &p.message,
            Self::Questions(p) => &p.message,
            Self::Spec(p) => &p.message,
            Self::Prompts(p) => &p.message,
            Self::Completed(p) => &p.message,
            Self::Failed(p) => &p.message,
            Self::Refinement(p) => &p.message,
            Self::Error(p) => &p.message,
            Self::RoomJoined(_) | Self::Malformed { .. } => return None,
        };
        (!message.is_empty()).then_some(message.as_str())
    }
}

/// Decodes one server event packet into its kind and validated payload.
///
/// Errors only when the frame itself is unusable: not a Socket.IO event
/// packet, or an event name outside the closed set.
pub fn decode_frame(text: &str) -> SyncResult<(EventKind, EventPayload)> {
    let (name, data) = match Packet::parse(text)? {
        Packet::Event { name, data } => (name, data),
        other => {
            return Err(SyncError::Protocol(format!(
                "not an event packet: {}",
                other.encode()
            )))
        }
    };
    let kind = EventKind::from_wire(&name)
        .ok_or_else(|| SyncError::Protocol(format!("unknown event '{}'", name)))?;
    Ok((kind, decode_payload(kind, data)))
}

fn decode_payload(kind: EventKind, data: Value) -> EventPayload {
    let data = match data {
        Value::Null => Value::Object(Map::new()),
        other => other,
    };
    let result = match kind {
        EventKind::ProgressUpdate => parse(&data).map(EventPayload::Progress),
        EventKind::QuestionsReady => parse(&data).map(EventPayload::Questions),
        EventKind::SpecReady => parse(&data).map(EventPayload::Spec),
        EventKind::PromptsGenerated => parse(&data).map(EventPayload::Prompts),
        EventKind::Completed => parse(&data).map(EventPayload::Completed),
        EventKind::Failed => parse(&data).map(EventPayload::Failed),
        EventKind::RefinementCompleted => parse(&data).map(EventPayload::Refinement),
        EventKind::RoomJoined => parse(&data).map(EventPayload::RoomJoined),
        EventKind::Error => parse(&data).map(EventPayload::Error),
    };
    result.unwrap_or_else(|reason| EventPayload::Malformed { reason, raw: data })
}

fn parse<T: DeserializeOwned>(data: &Value) -> Result<T, String> {
    T::deserialize(data).map_err(|e| e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_room_messages_are_socket_io_events() {
        let msg = ClientMessage::JoinProject {
            project_id: ProjectId(5),
        };
        assert_eq!(msg.to_wire(), r#"42["join_project",{"project_id":5}]"#);

        let msg = ClientMessage::LeaveProject {
            project_id: ProjectId(7),
        };
        assert_eq!(msg.to_wire(), r#"42["leave_project",{"project_id":7}]"#);
        assert_eq!(msg.project_id(), ProjectId(7));
    }

    #[test]
    fn test_every_kind_round_trips_its_wire_name() {
        for kind in EventKind::ALL {
            assert_eq!(EventKind::from_wire(kind.wire_name()), Some(kind));
        }
        assert_eq!(EventKind::from_wire("project_deleted"), None);
    }

    #[test]
    fn test_decode_progress_update() {
        let message = "Planning your app's architecture...";
        let frame = format!(
            r#"42["progress_update",{{"stage":"planning","message":"{}"}}]"#,
            message
        );
        let (kind, payload) = decode_frame(&frame).unwrap();
        assert_eq!(kind, EventKind::ProgressUpdate);
        assert_eq!(
            payload,
            EventPayload::Progress(ProgressPayload {
                stage: "planning".to_string(),
                message: message.to_string(),
            })
        );
        assert_eq!(payload.message(), Some(message));
    }

    #[test]
    fn test_decode_incomplete_payload_uses_defaults() {
        let frame = r#"42["workflow_completed",{"status":"completed"}]"#;
        let (_, payload) = decode_frame(frame).unwrap();
        match payload {
            EventPayload::Completed(p) => {
                assert_eq!(p.status, "completed");
                assert_eq!(p.total_tokens, None);
            }
            other => panic!("Expected Completed payload, got {:?}", other),
        }
    }

    #[test]
    fn test_decode_missing_data_is_empty_payload() {
        let (kind, payload) = decode_frame(r#"42["error"]"#).unwrap();
        assert_eq!(kind, EventKind::Error);
        assert_eq!(payload, EventPayload::Error(ErrorPayload::default()));
        assert_eq!(payload.message(), None);
    }

    #[test]
    fn test_wrongly_typed_payload_is_malformed_not_rejected() {
        let (kind, payload) =
            decode_frame(r#"42["prompts_generated",{"count":"many"}]"#).unwrap();
        assert_eq!(kind, EventKind::PromptsGenerated);
        assert!(matches!(payload, EventPayload::Malformed { .. }));

        let (_, payload) = decode_frame(r#"42["joined_project",{}]"#).unwrap();
        assert!(matches!(payload, EventPayload::Malformed { .. }));
    }

    #[test]
    fn test_unknown_event_is_protocol_error() {
        let err = decode_frame(r#"42["project_deleted",{}]"#).unwrap_err();
        assert!(matches!(err, SyncError::Protocol(msg) if msg.contains("project_deleted")));
    }

    #[test]
    fn test_control_and_raw_json_frames_are_not_events() {
        for frame in ["2", r#"40{"sid":"abc"}"#, r#"{"event":"progress_update"}"#] {
            assert!(matches!(decode_frame(frame), Err(SyncError::Protocol(_))));
        }
    }
}
