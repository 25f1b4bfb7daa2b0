//! Engine.IO v4 / Socket.IO v5 packet framing.
//!
//! Each WebSocket text message is one Engine.IO packet: a type digit and an
//! optional payload. Engine.IO type `4` carries a Socket.IO packet, which is
//! again a type digit, an optional namespace, an optional ack id and JSON
//! data. Only the default namespace is spoken.

use crate::error::{SyncError, SyncResult};
use serde_json::{json, Value};

#[derive(Debug, Clone, PartialEq)]
pub enum Packet {
    /// Engine.IO handshake from the server (`0{"sid":..,"pingInterval":..}`).
    Open(Value),
    Close,
    Ping,
    Pong,
    Noop,
    /// Socket.IO connect: client auth or server acknowledgement (`40{..}`).
    Connect(Option<Value>),
    /// Socket.IO disconnect (`41`).
    Disconnect,
    /// Socket.IO event (`42["name",{..}]`).
    Event { name: String, data: Value },
    /// Server refused the Socket.IO connect (`44{"message":..}`).
    ConnectError(String),
}

impl Packet {
    pub fn parse(text: &str) -> SyncResult<Self> {
        let mut chars = text.chars();
        let engine_type = chars
            .next()
            .ok_or_else(|| protocol_error("empty frame".to_string()))?;
        let rest = chars.as_str();
        match engine_type {
            '0' => Ok(Self::Open(parse_json(rest)?.unwrap_or(Value::Null))),
            '1' => Ok(Self::Close),
            '2' => Ok(Self::Ping),
            '3' => Ok(Self::Pong),
            '6' => Ok(Self::Noop),
            '4' => parse_message(rest),
            other => Err(protocol_error(format!(
                "unsupported engine packet type '{}'",
                other
            ))),
        }
    }

    pub fn encode(&self) -> String {
        match self {
            Self::Open(handshake) => format!("0{}", handshake),
            Self::Close => "1".to_string(),
            Self::Ping => "2".to_string(),
            Self::Pong => "3".to_string(),
            Self::Noop => "6".to_string(),
            Self::Connect(None) => "40".to_string(),
            Self::Connect(Some(auth)) => format!("40{}", auth),
            Self::Disconnect => "41".to_string(),
            Self::Event { name, data } => format!("42{}", json!([name, data])),
            Self::ConnectError(message) => format!("44{}", json!({ "message": message })),
        }
    }
}

fn parse_message(text: &str) -> SyncResult<Packet> {
    let mut chars = text.chars();
    let socket_type = chars
        .next()
        .ok_or_else(|| protocol_error("empty message packet".to_string()))?;
    let body = strip_default_namespace(chars.as_str())?;

    match socket_type {
        '0' => Ok(Packet::Connect(parse_json(body)?)),
        '1' => Ok(Packet::Disconnect),
        '2' => parse_event(body.trim_start_matches(|c: char| c.is_ascii_digit())),
        '4' => {
            let data = parse_json(body)?.unwrap_or(Value::Null);
            let message = data
                .get("message")
                .and_then(Value::as_str)
                .or_else(|| data.as_str())
                .unwrap_or("connection refused")
                .to_string();
            Ok(Packet::ConnectError(message))
        }
        other => Err(protocol_error(format!(
            "unsupported socket packet type '{}'",
            other
        ))),
    }
}

fn strip_default_namespace(body: &str) -> SyncResult<&str> {
    if !body.starts_with('/') {
        return Ok(body);
    }
    let (namespace, rest) = body.split_once(',').unwrap_or((body, ""));
    if namespace == "/" {
        Ok(rest)
    } else {
        Err(protocol_error(format!("unexpected namespace '{}'", namespace)))
    }
}

fn parse_event(body: &str) -> SyncResult<Packet> {
    let Some(Value::Array(mut args)) = parse_json(body)? else {
        return Err(protocol_error("event packet without arguments".to_string()));
    };
    if args.is_empty() {
        return Err(protocol_error("event packet without a name".to_string()));
    }
    let data = if args.len() > 1 {
        args.swap_remove(1)
    } else {
        Value::Null
    };
    match args.swap_remove(0) {
        Value::String(name) => Ok(Packet::Event { name, data }),
        other => Err(protocol_error(format!("event name is not a string: {}", other))),
    }
}

fn parse_json(body: &str) -> SyncResult<Option<Value>> {
    if body.is_empty() {
        return Ok(None);
    }
    serde_json::from_str(body)
        .map(Some)
        .map_err(|e| protocol_error(format!("unparseable packet data: {}", e)))
}

fn protocol_error(message: String) -> SyncError {
    SyncError::Protocol(message)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parses_engine_control_packets() {
        assert_eq!(Packet::parse("2").unwrap(), Packet::Ping);
        assert_eq!(Packet::parse("3").unwrap(), Packet::Pong);
        assert_eq!(Packet::parse("1").unwrap(), Packet::Close);
        assert_eq!(Packet::parse("6").unwrap(), Packet::Noop);

        let Packet::Open(handshake) =
            Packet::parse(r#"0{"sid":"a1","pingInterval":25000,"pingTimeout":20000}"#).unwrap()
        else {
            panic!("expected open packet");
        };
        assert_eq!(handshake["pingInterval"], 25000);
    }

    #[test]
    fn test_parses_socket_connect_and_refusal() {
        assert_eq!(
            Packet::parse(r#"40{"sid":"xyz"}"#).unwrap(),
            Packet::Connect(Some(json!({ "sid": "xyz" })))
        );
        assert_eq!(Packet::parse("40").unwrap(), Packet::Connect(None));
        assert_eq!(Packet::parse("41").unwrap(), Packet::Disconnect);
        assert_eq!(
            Packet::parse(r#"44{"message":"Invalid or expired token"}"#).unwrap(),
            Packet::ConnectError("Invalid or expired token".to_string())
        );
    }

    #[test]
    fn test_parses_event_with_default_namespace_and_ack_id() {
        let expected = Packet::Event {
            name: "progress_update".to_string(),
            data: json!({ "stage": "planning", "message": "x" }),
        };
        let plain = r#"42["progress_update",{"stage":"planning","message":"x"}]"#;
        let namespaced = r#"42/,["progress_update",{"stage":"planning","message":"x"}]"#;
        let with_ack = r#"4217["progress_update",{"stage":"planning","message":"x"}]"#;

        assert_eq!(Packet::parse(plain).unwrap(), expected);
        assert_eq!(Packet::parse(namespaced).unwrap(), expected);
        assert_eq!(Packet::parse(with_ack).unwrap(), expected);
    }

    #[test]
    fn test_event_without_data_has_null_payload() {
        assert_eq!(
            Packet::parse(r#"42["error"]"#).unwrap(),
            Packet::Event {
                name: "error".to_string(),
                data: Value::Null,
            }
        );
    }

    #[test]
    fn test_rejects_foreign_namespace_and_garbage() {
        assert!(Packet::parse(r#"42/admin,["x",{}]"#).is_err());
        assert!(Packet::parse("").is_err());
        assert!(Packet::parse(r#"{"event":"x"}"#).is_err());
        assert!(Packet::parse(r#"42{"not":"an array"}"#).is_err());
        assert!(Packet::parse("42[5,{}]").is_err());
    }

    #[test]
    fn test_encodes_client_packets() {
        assert_eq!(Packet::Pong.encode(), "3");
        assert_eq!(
            Packet::Connect(Some(json!({ "token": "secret" }))).encode(),
            r#"40{"token":"secret"}"#
        );
        assert_eq!(
            Packet::Event {
                name: "join_project".to_string(),
                data: json!({ "project_id": 5 }),
            }
            .encode(),
            r#"42["join_project",{"project_id":5}]"#
        );
    }
}
