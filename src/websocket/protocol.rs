use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::frame::{FrameMetadata, FrameSummary};
use crate::monitor::Statistics;
use crate::session::SessionInfo;

pub const SERVER_VERSION: &str = env!("CARGO_PKG_VERSION");

pub const CAPABILITIES: &[&str] = &[
    "frame_analysis",
    "binary_frames",
    "frame_cache",
    "notifications",
    "session_stats",
];

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ClientMessage {
    /// Text-encoded frame as a `data:image/...;base64,` URL.
    Frame { data: String },
    /// Metadata for the next binary message on this connection.
    FrameHeader(FrameMetadata),
    Ping,
    GetStatus,
    GetStats,
    ClearCache,
    SetMetadata { key: String, value: Value },
}

impl ClientMessage {
    pub fn name(&self) -> &'static str {
        match self {
            ClientMessage::Frame { .. } => "frame",
            ClientMessage::FrameHeader(_) => "frame_header",
            ClientMessage::Ping => "ping",
            ClientMessage::GetStatus => "get_status",
            ClientMessage::GetStats => "get_stats",
            ClientMessage::ClearCache => "clear_cache",
            ClientMessage::SetMetadata { .. } => "set_metadata",
        }
    }
}

#[derive(Debug, Clone, Serialize)]
#[serde(tag = "type", rename_all = "snake_case", rename_all_fields = "camelCase")]
pub enum ServerMessage {
    Connected {
        session_id: Uuid,
        capabilities: Vec<String>,
        server_version: String,
        timestamp: DateTime<Utc>,
    },
    AnalysisResult {
        session_id: Uuid,
        frame: FrameSummary,
        result: Value,
        timestamp: DateTime<Utc>,
    },
    Pong {
        timestamp: DateTime<Utc>,
    },
    SessionStatus {
        session: SessionInfo,
    },
    Stats {
        stats: Statistics,
    },
    Ack {
        command: String,
    },
    Notification {
        event: String,
        data: Value,
        timestamp: DateTime<Utc>,
    },
    Error {
        code: String,
        message: String,
    },
}

impl ServerMessage {
    pub fn connected(session_id: Uuid) -> Self {
        ServerMessage::Connected {
            session_id,
            capabilities: CAPABILITIES.iter().map(|c| c.to_string()).collect(),
            server_version: SERVER_VERSION.to_string(),
            timestamp: Utc::now(),
        }
    }

    pub fn error(code: &str, message: impl Into<String>) -> Self {
        ServerMessage::Error {
            code: code.to_string(),
            message: message.into(),
        }
    }

    pub fn notification(event: impl Into<String>, data: Value) -> Self {
        ServerMessage::Notification {
            event: event.into(),
            data,
            timestamp: Utc::now(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_client_messages() {
        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"frame","data":"data:image/png;base64,AA=="}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::Frame {
                data: "data:image/png;base64,AA==".into()
            }
        );

        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"frame_header","format":"png","width":320,"timestamp":1}"#)
                .unwrap();
        match msg {
            ClientMessage::FrameHeader(meta) => {
                assert_eq!(meta.format.as_deref(), Some("png"));
                assert_eq!(meta.width, Some(320));
                assert_eq!(meta.height, None);
                assert_eq!(meta.timestamp, Some(1));
            }
            other => panic!("unexpected message: {:?}", other),
        }

        let msg: ClientMessage = serde_json::from_str(r#"{"type":"ping"}"#).unwrap();
        assert_eq!(msg.name(), "ping");

        let msg: ClientMessage =
            serde_json::from_str(r#"{"type":"set_metadata","key":"room","value":3}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::SetMetadata {
                key: "room".into(),
                value: json!(3)
            }
        );
    }

    #[test]
    fn test_unknown_type_is_rejected() {
        assert!(serde_json::from_str::<ClientMessage>(r#"{"type":"launch"}"#).is_err());
        assert!(serde_json::from_str::<ClientMessage>(r#"{"data":"x"}"#).is_err());
        assert!(serde_json::from_str::<ClientMessage>("not json").is_err());
    }

    #[test]
    fn test_connected_wire_format() {
        let id = Uuid::new_v4();
        let value = serde_json::to_value(ServerMessage::connected(id)).unwrap();
        assert_eq!(value["type"], "connected");
        assert_eq!(value["sessionId"], id.to_string());
        assert_eq!(value["serverVersion"], SERVER_VERSION);
        assert_eq!(value["capabilities"].as_array().unwrap().len(), CAPABILITIES.len());
        assert!(value["timestamp"].is_string());
    }

    #[test]
    fn test_error_wire_format() {
        let value = serde_json::to_value(ServerMessage::error("PROTOCOL_ERROR", "bad")).unwrap();
        assert_eq!(value, json!({ "type": "error", "code": "PROTOCOL_ERROR", "message": "bad" }));
    }
}
