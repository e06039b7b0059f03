use std::sync::Arc;

use tracing::{debug, error, warn};
use uuid::Uuid;

use crate::error::{AppError, SessionError};
use crate::session::{Session, SessionRegistry};
use crate::websocket::ServerMessage;

/// Pushes one message to many sessions.
#[derive(Clone)]
pub struct Broadcaster {
    registry: Arc<SessionRegistry>,
}

impl Broadcaster {
    pub fn new(registry: Arc<SessionRegistry>) -> Self {
        Self { registry }
    }

    /// Send `msg` to every session matching `filter` and return how many
    /// sends succeeded. A session whose send fails is removed on the spot.
    pub async fn broadcast<F>(&self, msg: &ServerMessage, filter: F) -> usize
    where
        F: Fn(&Session) -> bool,
    {
        let text = match serde_json::to_string(msg) {
            Ok(text) => text,
            Err(e) => {
                error!("Failed to serialize broadcast message: {}", e);
                return 0;
            }
        };

        let mut delivered = 0;
        for session in self.registry.snapshot().await {
            if !filter(&session) {
                continue;
            }
            match session.connection.send_text(text.clone()) {
                Ok(()) => delivered += 1,
                Err(e) => {
                    warn!("Broadcast to session {} failed, removing: {}", session.id, e);
                    self.registry.remove(&session.id).await;
                }
            }
        }

        debug!("Broadcast delivered to {} sessions", delivered);
        delivered
    }

    pub async fn broadcast_all(&self, msg: &ServerMessage) -> usize {
        self.broadcast(msg, |_| true).await
    }

    pub async fn send_to(&self, id: &Uuid, msg: &ServerMessage) -> Result<(), AppError> {
        let session = self
            .registry
            .find_by_id(id)
            .await
            .ok_or(SessionError::NotFound(*id))?;

        if let Err(e) = session.connection.send(msg) {
            self.registry.remove(id).await;
            return Err(e.into());
        }
        Ok(())
    }
}
