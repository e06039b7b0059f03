use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use tokio::sync::RwLock;
use tracing::{error, info, warn};
use uuid::Uuid;

use super::{CloseReason, ConnectionHandle, Session, SessionStatus};
use crate::error::SessionError;

/// Errors a session may accumulate before it is closed and removed.
pub const MAX_SESSION_ERRORS: u32 = 10;

/// Result of [`SessionRegistry::record_error`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ErrorOutcome {
    /// The session is gone already.
    Unknown,
    /// Error counted; carries the new total.
    Recorded(u32),
    /// The ceiling was reached; the session has been closed and removed.
    Evicted,
}

/// Owns every live session.
///
/// Callers only ever receive copies of sessions. Anything that runs after an
/// await must look its session up again by id, because it may have been
/// removed in the meantime. Mutations on an unknown id are no-ops.
#[derive(Debug)]
pub struct SessionRegistry {
    pub(super) sessions: RwLock<HashMap<Uuid, Session>>,
    max_sessions: usize,
}

impl SessionRegistry {
    pub fn new(max_sessions: usize) -> Self {
        Self {
            sessions: RwLock::new(HashMap::new()),
            max_sessions,
        }
    }

    pub fn max_sessions(&self) -> usize {
        self.max_sessions
    }

    /// Register a new session, or close `connection` as overloaded when the
    /// ceiling is reached. Existing sessions are never displaced.
    pub async fn create(
        &self,
        connection: ConnectionHandle,
        metadata: HashMap<String, serde_json::Value>,
    ) -> Result<Session, SessionError> {
        let mut sessions = self.sessions.write().await;

        if sessions.len() >= self.max_sessions {
            warn!(
                "Session limit reached ({}), rejecting connection {}",
                self.max_sessions,
                connection.id()
            );
            if let Err(e) = connection.close(CloseReason::Overloaded) {
                error!("Failed to close rejected connection {}: {}", connection.id(), e);
            }
            return Err(SessionError::ConnectionLimitExceeded {
                max: self.max_sessions,
            });
        }

        let session = Session::new(connection, metadata);
        sessions.insert(session.id, session.clone());
        info!(
            "Created session {} ({}/{} active)",
            session.id,
            sessions.len(),
            self.max_sessions
        );

        Ok(session)
    }

    pub async fn remove(&self, id: &Uuid) -> bool {
        let removed = self.sessions.write().await.remove(id).is_some();
        if removed {
            info!("Removed session {}", id);
        }
        removed
    }

    pub async fn find_by_id(&self, id: &Uuid) -> Option<Session> {
        self.sessions.read().await.get(id).cloned()
    }

    pub async fn find_by_connection(&self, connection_id: &Uuid) -> Option<Session> {
        self.sessions
            .read()
            .await
            .values()
            .find(|s| s.connection.id() == *connection_id)
            .cloned()
    }

    /// Advance `last_activity` and count one message.
    pub async fn touch(&self, id: &Uuid) {
        if let Some(session) = self.sessions.write().await.get_mut(id) {
            session.last_activity = session.last_activity.max(Utc::now());
            session.message_count += 1;
        }
    }

    /// Returns false when the session no longer exists.
    pub async fn mark_processing(&self, id: &Uuid, processing: bool) -> bool {
        match self.sessions.write().await.get_mut(id) {
            Some(session) => {
                session.is_processing = processing;
                true
            }
            None => false,
        }
    }

    pub async fn record_frame(&self, id: &Uuid) {
        if let Some(session) = self.sessions.write().await.get_mut(id) {
            session.frame_count += 1;
        }
    }

    pub async fn set_metadata(&self, id: &Uuid, key: String, value: serde_json::Value) -> bool {
        match self.sessions.write().await.get_mut(id) {
            Some(session) => {
                session.metadata.insert(key, value);
                true
            }
            None => false,
        }
    }

    /// Count an error against the session, closing and removing it once it
    /// reaches [`MAX_SESSION_ERRORS`].
    pub async fn record_error(&self, id: &Uuid) -> ErrorOutcome {
        let mut sessions = self.sessions.write().await;

        let count = match sessions.get_mut(id) {
            Some(session) => {
                session.error_count += 1;
                session.error_count
            }
            None => return ErrorOutcome::Unknown,
        };

        if count < MAX_SESSION_ERRORS {
            return ErrorOutcome::Recorded(count);
        }

        if let Some(mut session) = sessions.remove(id) {
            session.status = SessionStatus::Error;
            warn!("Session {} reached {} errors, closing", id, count);
            if let Err(e) = session.connection.close(CloseReason::ErrorCeiling) {
                error!("Failed to close session {}: {}", id, e);
            }
        }
        ErrorOutcome::Evicted
    }

    /// Close and remove `id` if it has been idle longer than `timeout` at
    /// `now`. Idleness is re-checked here since the session may have been
    /// touched after the caller looked at it.
    pub async fn evict_idle(&self, id: &Uuid, now: DateTime<Utc>, timeout: Duration) -> bool {
        let mut sessions = self.sessions.write().await;

        let idle = sessions
            .get(id)
            .map(|s| now - s.last_activity > timeout)
            .unwrap_or(false);
        if !idle {
            return false;
        }

        if let Some(mut session) = sessions.remove(id) {
            session.status = SessionStatus::Inactive;
            info!("Session {} idle since {}, closing", id, session.last_activity);
            if let Err(e) = session.connection.close(CloseReason::IdleTimeout) {
                error!("Failed to close idle session {}: {}", id, e);
            }
        }
        true
    }

    /// Copy of every session, safe to iterate while the registry changes.
    pub async fn snapshot(&self) -> Vec<Session> {
        self.sessions.read().await.values().cloned().collect()
    }

    /// Close every session with `reason` and empty the registry.
    pub async fn drain(&self, reason: CloseReason) -> usize {
        let drained: Vec<Session> = self.sessions.write().await.drain().map(|(_, s)| s).collect();
        for session in &drained {
            if let Err(e) = session.connection.close(reason) {
                error!("Failed to close session {}: {}", session.id, e);
            }
        }
        if !drained.is_empty() {
            info!("Drained {} sessions ({})", drained.len(), reason.reason());
        }
        drained.len()
    }

    pub async fn len(&self) -> usize {
        self.sessions.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.sessions.read().await.is_empty()
    }
}
