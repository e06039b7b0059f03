use std::borrow::Cow;

use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::protocol::frame::coding::CloseCode;
use tokio_tungstenite::tungstenite::protocol::CloseFrame;
use tokio_tungstenite::tungstenite::Message;
use uuid::Uuid;

use crate::error::WebSocketError;
use crate::websocket::ServerMessage;

/// Why the server closed a connection. Codes and reasons are part of the
/// client contract.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CloseReason {
    IdleTimeout,
    Shutdown,
    ErrorCeiling,
    Overloaded,
}

impl CloseReason {
    pub fn code(&self) -> u16 {
        match self {
            CloseReason::IdleTimeout => 1000,
            CloseReason::Shutdown => 1001,
            CloseReason::ErrorCeiling => 1011,
            CloseReason::Overloaded => 1013,
        }
    }

    pub fn reason(&self) -> &'static str {
        match self {
            CloseReason::IdleTimeout => "Session timeout",
            CloseReason::Shutdown => "Server shutdown",
            CloseReason::ErrorCeiling => "Too many errors",
            CloseReason::Overloaded => "Server overloaded",
        }
    }

    pub fn frame(&self) -> CloseFrame<'static> {
        CloseFrame {
            code: CloseCode::from(self.code()),
            reason: Cow::Borrowed(self.reason()),
        }
    }
}

/// Cloneable write side of one websocket connection.
///
/// Messages are queued to the connection's writer task. A failed send means
/// the writer is gone and the connection is dead.
#[derive(Debug, Clone)]
pub struct ConnectionHandle {
    id: Uuid,
    tx: mpsc::UnboundedSender<Message>,
}

impl ConnectionHandle {
    pub fn new(tx: mpsc::UnboundedSender<Message>) -> Self {
        Self {
            id: Uuid::new_v4(),
            tx,
        }
    }

    pub fn id(&self) -> Uuid {
        self.id
    }

    pub fn send(&self, msg: &ServerMessage) -> Result<(), WebSocketError> {
        let text = serde_json::to_string(msg)
            .map_err(|e| WebSocketError::SendError(format!("Failed to serialize message: {}", e)))?;
        self.send_text(text)
    }

    pub fn send_text(&self, text: String) -> Result<(), WebSocketError> {
        self.send_raw(Message::Text(text))
    }

    pub fn send_raw(&self, msg: Message) -> Result<(), WebSocketError> {
        self.tx
            .send(msg)
            .map_err(|e| WebSocketError::SendError(format!("Failed to send message: {}", e)))
    }

    pub fn close(&self, reason: CloseReason) -> Result<(), WebSocketError> {
        self.send_raw(Message::Close(Some(reason.frame())))
    }

    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}
