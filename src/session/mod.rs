//! Session management for the gateway
//!
//! This module tracks live websocket sessions, enforces the session
//! ceiling and evicts idle sessions on a timer.

mod handle;
mod reaper;
mod registry;

pub use handle::{CloseReason, ConnectionHandle};
pub use reaper::SessionReaper;
pub use registry::{ErrorOutcome, SessionRegistry, MAX_SESSION_ERRORS};

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::HashMap;
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum SessionStatus {
    Active,
    Inactive,
    Error,
}

/// One client connection and the state tracked for it.
#[derive(Debug, Clone)]
pub struct Session {
    pub id: Uuid,
    pub connection: ConnectionHandle,
    pub metadata: HashMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub is_processing: bool,
    pub frame_count: u64,
    pub message_count: u64,
    pub error_count: u32,
    pub status: SessionStatus,
}

impl Session {
    pub fn new(connection: ConnectionHandle, metadata: HashMap<String, serde_json::Value>) -> Self {
        let now = Utc::now();
        Self {
            id: Uuid::new_v4(),
            connection,
            metadata,
            created_at: now,
            last_activity: now,
            is_processing: false,
            frame_count: 0,
            message_count: 0,
            error_count: 0,
            status: SessionStatus::Active,
        }
    }

    pub fn info(&self) -> SessionInfo {
        SessionInfo {
            id: self.id,
            metadata: self.metadata.clone(),
            created_at: self.created_at,
            last_activity: self.last_activity,
            is_processing: self.is_processing,
            frame_count: self.frame_count,
            message_count: self.message_count,
            error_count: self.error_count,
            status: self.status,
        }
    }
}

/// Serializable view of a session, without the connection handle.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionInfo {
    pub id: Uuid,
    pub metadata: HashMap<String, serde_json::Value>,
    pub created_at: DateTime<Utc>,
    pub last_activity: DateTime<Utc>,
    pub is_processing: bool,
    pub frame_count: u64,
    pub message_count: u64,
    pub error_count: u32,
    pub status: SessionStatus,
}
