//! Push transports.
//!
//! A transport opens one authenticated link. The link is split into an
//! outbound sink and an inbound stream of text frames so both directions
//! can be driven from the same `select!` loop.

use super::Credential;
use crate::error::{SyncError, SyncResult};
use crate::protocol::Packet;
use async_trait::async_trait;
use futures::{future, Sink, SinkExt, Stream, StreamExt};
use serde_json::{json, Value};
use std::pin::Pin;
use std::time::Duration;
use tokio_tungstenite::tungstenite::{self, Message};
use url::Url;

pub type Outbound = Pin<Box<dyn Sink<String, Error = SyncError> + Send>>;
pub type Inbound = Pin<Box<dyn Stream<Item = SyncResult<String>> + Send>>;

const HANDSHAKE_TIMEOUT: Duration = Duration::from_secs(10);

/// One established link. Dropping it closes the connection.
pub struct PushLink {
    pub outbound: Outbound,
    /// Ends when the peer closes the link.
    pub inbound: Inbound,
}

#[async_trait]
pub trait PushTransport: Send + Sync {
    async fn open(&self, credential: &Credential) -> SyncResult<PushLink>;
}

/// Socket.IO over a plain WebSocket.
///
/// The credential travels in the Socket.IO connect packet as
/// `{"token": ..}`, never in the URL.
pub struct WebSocketTransport {
    url: Url,
}

impl WebSocketTransport {
    /// Adds the Engine.IO query parameters when `push_url` lacks them.
    pub fn new(push_url: &str) -> SyncResult<Self> {
        let mut url = Url::parse(push_url)
            .map_err(|e| SyncError::Config(format!("invalid push_url '{}': {}", push_url, e)))?;
        match url.scheme() {
            "ws" | "wss" => {}
            other => {
                return Err(SyncError::Config(format!(
                    "push_url must use ws:// or wss://, got {}://",
                    other
                )))
            }
        }

        let has_version = url.query_pairs().any(|(key, _)| key == "EIO");
        let has_transport = url.query_pairs().any(|(key, _)| key == "transport");
        if !has_version {
            url.query_pairs_mut().append_pair("EIO", "4");
        }
        if !has_transport {
            url.query_pairs_mut().append_pair("transport", "websocket");
        }
        Ok(Self { url })
    }
}

#[async_trait]
impl PushTransport for WebSocketTransport {
    async fn open(&self, credential: &Credential) -> SyncResult<PushLink> {
        let (ws, _) = tokio_tungstenite::connect_async(self.url.as_str())
            .await
            .map_err(|e| SyncError::Transport(format!("connect to {} failed: {}", self.url, e)))?;
        tracing::debug!(url = %self.url, "WebSocket handshake complete");

        let (sink, stream) = ws.split();

        let outbound = sink
            .with(|text: String| future::ready(Ok::<_, tungstenite::Error>(Message::Text(text))))
            .sink_map_err(|e| SyncError::Transport(e.to_string()));

        // WebSocket-level pings are answered by tungstenite while the stream is polled
        let inbound = stream.filter_map(|message| {
            future::ready(match message {
                Ok(Message::Text(text)) => Some(Ok(text)),
                Ok(Message::Close(frame)) => Some(Err(SyncError::Transport(match frame {
                    Some(frame) => format!("server closed the connection: {}", frame.reason),
                    None => "server closed the connection".to_string(),
                }))),
                Ok(_) => None,
                Err(e) => Some(Err(SyncError::Transport(e.to_string()))),
            })
        });

        let mut link = PushLink {
            outbound: Box::pin(outbound),
            inbound: Box::pin(inbound),
        };
        let sid = tokio::time::timeout(HANDSHAKE_TIMEOUT, handshake(&mut link, credential))
            .await
            .map_err(|_| SyncError::Transport("Socket.IO handshake timed out".to_string()))??;
        tracing::debug!(%sid, "Socket.IO session established");
        Ok(link)
    }
}

/// Waits for the Engine.IO open packet, then connects the default
/// namespace with the credential as auth. Returns the session id.
async fn handshake(link: &mut PushLink, credential: &Credential) -> SyncResult<String> {
    match next_packet(&mut link.inbound).await? {
        Packet::Open(_) => {}
        other => {
            return Err(SyncError::Transport(format!(
                "expected Engine.IO open packet, got '{}'",
                other.encode()
            )))
        }
    }

    let auth = Packet::Connect(Some(json!({ "token": credential.expose() })));
    link.outbound.send(auth.encode()).await?;

    loop {
        match next_packet(&mut link.inbound).await? {
            Packet::Connect(ack) => {
                let sid = ack
                    .as_ref()
                    .and_then(|ack| ack.get("sid"))
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                return Ok(sid.to_string());
            }
            Packet::ConnectError(message) => {
                return Err(SyncError::Transport(format!(
                    "server refused the session: {}",
                    message
                )))
            }
            Packet::Ping => link.outbound.send(Packet::Pong.encode()).await?,
            Packet::Close | Packet::Disconnect => {
                return Err(SyncError::Transport(
                    "server closed the session during handshake".to_string(),
                ))
            }
            Packet::Open(_) | Packet::Pong | Packet::Noop | Packet::Event { .. } => {}
        }
    }
}

async fn next_packet(inbound: &mut Inbound) -> SyncResult<Packet> {
    match inbound.next().await {
        Some(Ok(text)) => Packet::parse(&text),
        Some(Err(e)) => Err(e),
        None => Err(SyncError::Transport(
            "connection closed during handshake".to_string(),
        )),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use futures::channel::mpsc::{self, UnboundedReceiver};

    /// Link fed by scripted server frames; returns what the client wrote.
    fn scripted_link(frames: &[&str]) -> (PushLink, UnboundedReceiver<String>) {
        let (sent_tx, sent_rx) = mpsc::unbounded::<String>();
        let frames: Vec<SyncResult<String>> = frames.iter().map(|f| Ok(f.to_string())).collect();
        let link = PushLink {
            outbound: Box::pin(sent_tx.sink_map_err(|e| SyncError::Transport(e.to_string()))),
            inbound: Box::pin(futures::stream::iter(frames)),
        };
        (link, sent_rx)
    }

    async fn written(link: PushLink, sent: UnboundedReceiver<String>) -> Vec<String> {
        drop(link);
        sent.collect().await
    }

    #[test]
    fn test_engine_io_query_is_added_once() {
        let transport = WebSocketTransport::new("ws://localhost:8000/ws/socket.io/").unwrap();
        assert_eq!(
            transport.url.as_str(),
            "ws://localhost:8000/ws/socket.io/?EIO=4&transport=websocket"
        );

        let full = "ws://localhost:8000/ws/socket.io/?EIO=4&transport=websocket";
        assert_eq!(WebSocketTransport::new(full).unwrap().url.as_str(), full);
    }

    #[test]
    fn test_rejects_non_websocket_urls() {
        assert!(matches!(
            WebSocketTransport::new("http://localhost:8000"),
            Err(SyncError::Config(_))
        ));
        assert!(WebSocketTransport::new("not a url").is_err());
    }

    #[tokio::test]
    async fn test_handshake_sends_token_as_auth_and_answers_ping() {
        let (mut link, sent) = scripted_link(&[
            r#"0{"sid":"e1","upgrades":[],"pingInterval":25000,"pingTimeout":20000}"#,
            "2",
            r#"40{"sid":"s1"}"#,
        ]);

        let sid = handshake(&mut link, &Credential::new("secret")).await.unwrap();

        assert_eq!(sid, "s1");
        assert_eq!(
            written(link, sent).await,
            vec![r#"40{"token":"secret"}"#.to_string(), "3".to_string()]
        );
    }

    #[tokio::test]
    async fn test_handshake_reports_refused_session() {
        let (mut link, _sent) = scripted_link(&[
            r#"0{"sid":"e1"}"#,
            r#"44{"message":"Invalid or expired token"}"#,
        ]);

        let err = handshake(&mut link, &Credential::new("stale")).await.unwrap_err();

        assert!(
            matches!(&err, SyncError::Transport(msg) if msg.contains("Invalid or expired token")),
            "unexpected error: {:?}",
            err
        );
    }

    #[tokio::test]
    async fn test_handshake_requires_open_packet() {
        let (mut link, _sent) = scripted_link(&[r#"42["progress_update",{}]"#]);
        assert!(handshake(&mut link, &Credential::new("t")).await.is_err());

        let (mut link, _sent) = scripted_link(&[]);
        assert!(handshake(&mut link, &Credential::new("t")).await.is_err());
    }
}
