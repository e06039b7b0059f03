use std::collections::HashMap;

use chrono::Utc;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};
use uuid::Uuid;

use crate::error::{AppError, FrameError, SessionError};
use crate::frame::{cache_key, CacheEntry, FrameMetadata, FrameRecord};
use crate::session::{ConnectionHandle, ErrorOutcome};
use crate::websocket::{ClientMessage, ServerMessage};
use crate::{AppState, Result};

/// Lifecycle of one websocket connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Unopened,
    Open,
    Closing,
    Closed,
}

/// What the reader loop should do after a message.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Flow {
    Continue,
    Close,
}

/// Dispatches the messages of a single connection, in arrival order.
///
/// The connection keeps only its session id. Session state is looked up
/// in the registry on every step, since the reaper, a broadcast or the error
/// ceiling may remove the session while a frame is being analysed.
pub struct Connection {
    handle: ConnectionHandle,
    app: AppState,
    state: ConnectionState,
    session_id: Option<Uuid>,
    pending_header: Option<FrameMetadata>,
}

impl Connection {
    pub fn new(handle: ConnectionHandle, app: AppState) -> Self {
        Self {
            handle,
            app,
            state: ConnectionState::Unopened,
            session_id: None,
            pending_header: None,
        }
    }

    pub fn state(&self) -> ConnectionState {
        self.state
    }

    pub fn session_id(&self) -> Option<Uuid> {
        self.session_id
    }

    /// Register a session for this connection and greet the client.
    pub async fn open(&mut self, metadata: HashMap<String, serde_json::Value>) -> Result<Uuid> {
        if self.state != ConnectionState::Unopened {
            let state = format!("cannot open from {:?}", self.state);
            return Err(SessionError::InvalidState(state).into());
        }

        let session = match self.app.registry.create(self.handle.clone(), metadata).await {
            Ok(session) => session,
            Err(e) => {
                self.state = ConnectionState::Closed;
                return Err(e.into());
            }
        };

        if let Err(e) = self.handle.send(&ServerMessage::connected(session.id)) {
            error!("Failed to greet session {}: {}", session.id, e);
            self.app.registry.remove(&session.id).await;
            self.state = ConnectionState::Closed;
            return Err(e.into());
        }

        self.session_id = Some(session.id);
        self.state = ConnectionState::Open;
        info!("Session {} opened on connection {}", session.id, self.handle.id());
        Ok(session.id)
    }

    pub async fn handle_message(&mut self, msg: Message) -> Result<Flow> {
        let id = match (self.state, self.session_id) {
            (ConnectionState::Open, Some(id)) => id,
            _ => return Ok(Flow::Close),
        };

        // Reaped or evicted since the last message
        if self.app.registry.find_by_id(&id).await.is_none() {
            debug!("Session {} no longer registered, stopping", id);
            self.state = ConnectionState::Closed;
            return Ok(Flow::Close);
        }

        match msg {
            Message::Text(text) => self.handle_text(id, &text).await,
            Message::Binary(data) => {
                self.app.registry.touch(&id).await;
                let header = self.pending_header.take();
                let decoded = self.app.decoder.decode_binary(data, header);
                self.process_frame(id, decoded).await
            }
            Message::Ping(data) => {
                self.app.registry.touch(&id).await;
                self.reply_raw(id, Message::Pong(data)).await
            }
            Message::Pong(_) => {
                self.app.registry.touch(&id).await;
                Ok(Flow::Continue)
            }
            Message::Close(frame) => {
                info!("Client closed session {}: {:?}", id, frame);
                self.state = ConnectionState::Closing;
                Ok(Flow::Close)
            }
            Message::Frame(_) => Ok(Flow::Continue),
        }
    }

    async fn handle_text(&mut self, id: Uuid, text: &str) -> Result<Flow> {
        let client_msg = match serde_json::from_str::<ClientMessage>(text) {
            Ok(msg) => msg,
            Err(e) => return self.reject(id, e.into()).await,
        };

        self.app.registry.touch(&id).await;
        debug!("Session {} sent {}", id, client_msg.name());

        match client_msg {
            ClientMessage::Frame { data } => {
                let decoded = self.app.decoder.decode_data_url(&data);
                self.process_frame(id, decoded).await
            }
            ClientMessage::FrameHeader(header) => {
                self.pending_header = Some(header);
                self.ack(id, "frame_header").await
            }
            ClientMessage::Ping => {
                self.reply(id, ServerMessage::Pong { timestamp: Utc::now() }).await
            }
            ClientMessage::GetStatus => match self.app.registry.find_by_id(&id).await {
                Some(session) => {
                    self.reply(id, ServerMessage::SessionStatus { session: session.info() }).await
                }
                None => Ok(Flow::Close),
            },
            ClientMessage::GetStats => {
                let stats = self.app.monitor.statistics().await;
                self.reply(id, ServerMessage::Stats { stats }).await
            }
            ClientMessage::ClearCache => {
                self.app.cache.clear().await;
                info!("Frame cache cleared by session {}", id);
                self.ack(id, "clear_cache").await
            }
            ClientMessage::SetMetadata { key, value } => {
                self.app.registry.set_metadata(&id, key, value).await;
                self.ack(id, "set_metadata").await
            }
        }
    }

    async fn process_frame(
        &mut self,
        id: Uuid,
        decoded: std::result::Result<FrameRecord, FrameError>,
    ) -> Result<Flow> {
        let mut frame = match decoded {
            Ok(frame) => frame,
            Err(e) => return self.reject(id, e.into()).await,
        };

        self.app.registry.record_frame(&id).await;

        if self.app.cache.is_enabled() {
            let key = cache_key(&frame.data);
            match self.app.cache.lookup(&key).await {
                Some(entry) => {
                    debug!("Cache hit {} for session {}", key, id);
                    frame.merge_cached(&entry);
                }
                None => {
                    self.app.cache.insert(key, CacheEntry::from(&frame)).await;
                }
            }
        }

        self.app.registry.mark_processing(&id, true).await;
        let outcome = self.app.orchestrator.analyze(&frame, Utc::now()).await;

        // The session may have gone away while the orchestrator was working
        if !self.app.registry.mark_processing(&id, false).await {
            debug!("Dropping analysis result for closed session {}", id);
            self.state = ConnectionState::Closed;
            return Ok(Flow::Close);
        }

        match outcome {
            Ok(result) => {
                let msg = ServerMessage::AnalysisResult {
                    session_id: id,
                    frame: frame.summary(),
                    result,
                    timestamp: Utc::now(),
                };
                // Delivered only if the session is still registered
                match self.app.broadcaster.send_to(&id, &msg).await {
                    Ok(()) => Ok(Flow::Continue),
                    Err(AppError::SessionError(SessionError::NotFound(_))) => {
                        debug!("Dropping analysis result for closed session {}", id);
                        self.state = ConnectionState::Closed;
                        Ok(Flow::Close)
                    }
                    Err(e) => {
                        self.state = ConnectionState::Closed;
                        Err(e)
                    }
                }
            }
            Err(e) => {
                error!("Analysis failed for session {}: {}", id, e);
                self.reject(id, e.into()).await
            }
        }
    }

    /// Count a failure against the session and report it to the client,
    /// unless that failure pushed the session over the error ceiling.
    async fn reject(&mut self, id: Uuid, err: AppError) -> Result<Flow> {
        warn!("Rejected message from session {}: {}", id, err);
        match self.app.registry.record_error(&id).await {
            ErrorOutcome::Recorded(_) => {
                self.reply(id, ServerMessage::error(err.code(), err.to_string())).await
            }
            ErrorOutcome::Evicted | ErrorOutcome::Unknown => {
                self.state = ConnectionState::Closed;
                Ok(Flow::Close)
            }
        }
    }

    async fn ack(&mut self, id: Uuid, command: &str) -> Result<Flow> {
        self.reply(id, ServerMessage::Ack { command: command.to_string() }).await
    }

    async fn reply(&mut self, id: Uuid, msg: ServerMessage) -> Result<Flow> {
        let sent = self.handle.send(&msg);
        self.after_send(id, sent).await
    }

    async fn reply_raw(&mut self, id: Uuid, msg: Message) -> Result<Flow> {
        let sent = self.handle.send_raw(msg);
        self.after_send(id, sent).await
    }

    /// A failed send means the connection is dead; the session goes with it.
    async fn after_send(
        &mut self,
        id: Uuid,
        sent: std::result::Result<(), crate::error::WebSocketError>,
    ) -> Result<Flow> {
        match sent {
            Ok(()) => Ok(Flow::Continue),
            Err(e) => {
                self.app.registry.remove(&id).await;
                self.state = ConnectionState::Closed;
                Err(e.into())
            }
        }
    }

    /// Orderly close, initiated by the client or by the server loop.
    pub async fn close(&mut self) {
        if let Some(id) = self.session_id {
            if matches!(self.state, ConnectionState::Open | ConnectionState::Closing) {
                self.state = ConnectionState::Closing;
                self.app.registry.remove(&id).await;
            }
        }
        self.state = ConnectionState::Closed;
    }

    /// Transport error: count it against the session if it is still around,
    /// then remove it.
    pub async fn fail(&mut self, reason: &str) {
        if let Some(id) = self.session_id {
            warn!("Connection error on session {}: {}", id, reason);
            if self.app.registry.record_error(&id).await != ErrorOutcome::Evicted {
                self.app.registry.remove(&id).await;
            }
        }
        self.state = ConnectionState::Closed;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Settings;
    use crate::error::OrchestratorError;
    use crate::orchestrator::MockOrchestrator;
    use crate::session::{CloseReason, MAX_SESSION_ERRORS};
    use base64::{engine::general_purpose::STANDARD as BASE64, Engine};
    use serde_json::{json, Value};
    use std::sync::Arc;
    use tokio::sync::mpsc;

    fn settings(max_sessions: usize, cache_size: usize) -> Settings {
        let mut settings = Settings::new_for_test().expect("Failed to load test config");
        settings.session.max_sessions = max_sessions;
        settings.cache.size = cache_size;
        settings.frames.max_frame_size = 1024;
        settings
    }

    fn echo_orchestrator() -> MockOrchestrator {
        let mut orchestrator = MockOrchestrator::new();
        orchestrator
            .expect_analyze()
            .returning(|frame, _| Ok(json!({ "size": frame.size })));
        orchestrator
    }

    fn app(orchestrator: MockOrchestrator, max_sessions: usize, cache_size: usize) -> AppState {
        AppState::with_orchestrator(settings(max_sessions, cache_size), Arc::new(orchestrator))
    }

    async fn open(app: &AppState) -> (Connection, mpsc::UnboundedReceiver<Message>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let mut connection = Connection::new(ConnectionHandle::new(tx), app.clone());
        connection.open(HashMap::new()).await.unwrap();
        (connection, rx)
    }

    fn next_json(rx: &mut mpsc::UnboundedReceiver<Message>) -> Value {
        match rx.try_recv() {
            Ok(Message::Text(text)) => serde_json::from_str(&text).unwrap(),
            other => panic!("expected text message, got {:?}", other),
        }
    }

    fn text(value: Value) -> Message {
        Message::Text(value.to_string())
    }

    fn png_url(seed: u8) -> String {
        let mut bytes = vec![0x89, 0x50, 0x4E, 0x47];
        bytes.extend_from_slice(&[seed; 16]);
        format!("data:image/png;base64,{}", BASE64.encode(bytes))
    }

    #[tokio::test]
    async fn test_open_sends_handshake() {
        let app = app(MockOrchestrator::new(), 2, 5);
        let (connection, mut rx) = open(&app).await;

        let hello = next_json(&mut rx);
        assert_eq!(hello["type"], "connected");
        assert_eq!(hello["sessionId"], connection.session_id().unwrap().to_string());
        assert!(hello["capabilities"].as_array().unwrap().len() > 0);
        assert_eq!(connection.state(), ConnectionState::Open);
    }

    #[tokio::test]
    async fn test_open_removes_session_when_greeting_fails() {
        let app = app(MockOrchestrator::new(), 2, 5);
        let (tx, rx) = mpsc::unbounded_channel();
        drop(rx);
        let mut connection = Connection::new(ConnectionHandle::new(tx), app.clone());

        assert!(connection.open(HashMap::new()).await.is_err());
        assert_eq!(connection.state(), ConnectionState::Closed);
        assert!(app.registry.is_empty().await);
    }

    #[tokio::test]
    async fn test_open_rejected_when_full() {
        let app = app(MockOrchestrator::new(), 1, 5);
        let (_first, _rx) = open(&app).await;

        let (tx, mut rx) = mpsc::unbounded_channel();
        let mut second = Connection::new(ConnectionHandle::new(tx), app.clone());
        let err = second.open(HashMap::new()).await.unwrap_err();
        assert!(matches!(
            err,
            AppError::SessionError(SessionError::ConnectionLimitExceeded { max: 1 })
        ));
        match rx.try_recv() {
            Ok(Message::Close(Some(frame))) => {
                assert_eq!(u16::from(frame.code), CloseReason::Overloaded.code())
            }
            other => panic!("expected overloaded close, got {:?}", other),
        }
        assert_eq!(app.registry.len().await, 1);
    }

    #[tokio::test]
    async fn test_frame_round_trip_and_cache_hit() {
        let app = app(echo_orchestrator(), 2, 5);
        let (mut connection, mut rx) = open(&app).await;
        next_json(&mut rx);

        let msg = text(json!({ "type": "frame", "data": png_url(1) }));
        assert_eq!(connection.handle_message(msg.clone()).await.unwrap(), Flow::Continue);
        let first = next_json(&mut rx);
        assert_eq!(first["type"], "analysis_result");
        assert_eq!(first["frame"]["format"], "png");
        assert_eq!(first["frame"]["size"], 20);
        assert_eq!(first["frame"]["cacheHit"], false);
        assert_eq!(first["result"]["size"], 20);

        connection.handle_message(msg).await.unwrap();
        let second = next_json(&mut rx);
        assert_eq!(second["frame"]["cacheHit"], true);

        let session = app.registry.find_by_id(&connection.session_id().unwrap()).await.unwrap();
        assert_eq!(session.frame_count, 2);
        assert_eq!(session.message_count, 2);
        assert!(!session.is_processing);
    }

    #[tokio::test]
    async fn test_cache_capacity_respected() {
        let app = app(echo_orchestrator(), 2, 2);
        let (mut connection, mut rx) = open(&app).await;
        next_json(&mut rx);

        for seed in 1..=3 {
            let msg = text(json!({ "type": "frame", "data": png_url(seed) }));
            connection.handle_message(msg).await.unwrap();
            assert_eq!(next_json(&mut rx)["frame"]["cacheHit"], false);
        }
        assert_eq!(app.cache.len().await, 2);

        let msg = text(json!({ "type": "frame", "data": png_url(1) }));
        connection.handle_message(msg).await.unwrap();
        assert_eq!(next_json(&mut rx)["frame"]["cacheHit"], true);

        let msg = text(json!({ "type": "frame", "data": png_url(3) }));
        connection.handle_message(msg).await.unwrap();
        assert_eq!(next_json(&mut rx)["frame"]["cacheHit"], false);
    }

    #[tokio::test]
    async fn test_binary_frame_uses_pending_header_once() {
        let app = app(echo_orchestrator(), 2, 5);
        let (mut connection, mut rx) = open(&app).await;
        next_json(&mut rx);

        let header = text(json!({ "type": "frame_header", "format": "webp", "width": 64, "height": 48 }));
        connection.handle_message(header).await.unwrap();
        assert_eq!(next_json(&mut rx)["command"], "frame_header");

        connection.handle_message(Message::Binary(vec![1, 2, 3, 4])).await.unwrap();
        let result = next_json(&mut rx);
        assert_eq!(result["frame"]["format"], "webp");
        assert_eq!(result["frame"]["width"], 64);

        connection.handle_message(Message::Binary(vec![0xFF, 0xD8, 9, 9])).await.unwrap();
        let result = next_json(&mut rx);
        assert_eq!(result["frame"]["format"], "jpeg");
        assert!(result["frame"]["width"].is_null());
    }

    #[tokio::test]
    async fn test_protocol_errors_until_ceiling() {
        let app = app(MockOrchestrator::new(), 2, 5);
        let (mut connection, mut rx) = open(&app).await;
        next_json(&mut rx);
        let id = connection.session_id().unwrap();

        for _ in 1..MAX_SESSION_ERRORS {
            let flow = connection.handle_message(Message::Text("{nope".into())).await.unwrap();
            assert_eq!(flow, Flow::Continue);
            let reply = next_json(&mut rx);
            assert_eq!(reply["type"], "error");
            assert_eq!(reply["code"], "PROTOCOL_ERROR");
        }
        assert_eq!(app.registry.find_by_id(&id).await.unwrap().error_count, 9);

        let unknown = text(json!({ "type": "self_destruct" }));
        assert_eq!(connection.handle_message(unknown).await.unwrap(), Flow::Close);
        assert!(app.registry.find_by_id(&id).await.is_none());
        match rx.try_recv() {
            Ok(Message::Close(Some(frame))) => {
                assert_eq!(u16::from(frame.code), CloseReason::ErrorCeiling.code())
            }
            other => panic!("expected error ceiling close, got {:?}", other),
        }
        assert_eq!(connection.state(), ConnectionState::Closed);
    }

    #[tokio::test]
    async fn test_oversized_frame_reported() {
        let app = app(MockOrchestrator::new(), 2, 5);
        let (mut connection, mut rx) = open(&app).await;
        next_json(&mut rx);

        connection.handle_message(Message::Binary(vec![0u8; 2048])).await.unwrap();
        let reply = next_json(&mut rx);
        assert_eq!(reply["code"], "FRAME_TOO_LARGE");
        assert_eq!(app.decoder.stats().decode_errors, 1);
        assert_eq!(app.cache.len().await, 0);
    }

    /// Stands in for the reaper firing while a frame is being analysed.
    struct DrainingOrchestrator {
        registry: Arc<crate::session::SessionRegistry>,
    }

    #[async_trait::async_trait]
    impl crate::orchestrator::Orchestrator for DrainingOrchestrator {
        async fn analyze(
            &self,
            _frame: &FrameRecord,
            _requested_at: chrono::DateTime<Utc>,
        ) -> std::result::Result<Value, OrchestratorError> {
            self.registry.drain(CloseReason::IdleTimeout).await;
            Ok(json!({}))
        }
    }

    #[tokio::test]
    async fn test_result_dropped_for_removed_session() {
        let base = app(MockOrchestrator::new(), 2, 5);
        let orchestrator = DrainingOrchestrator {
            registry: base.registry.clone(),
        };
        let app = AppState {
            orchestrator: Arc::new(orchestrator),
            ..base
        };

        let (mut connection, mut rx) = open(&app).await;
        next_json(&mut rx);

        let msg = text(json!({ "type": "frame", "data": png_url(7) }));
        assert_eq!(connection.handle_message(msg).await.unwrap(), Flow::Close);
        assert_eq!(connection.state(), ConnectionState::Closed);

        // Only the idle close frame, no analysis result
        assert!(matches!(rx.try_recv(), Ok(Message::Close(_))));
        assert!(rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn test_analysis_result_to_dead_connection_removes_session() {
        let app = app(echo_orchestrator(), 2, 5);
        let (mut connection, rx) = open(&app).await;
        let id = connection.session_id().unwrap();
        drop(rx);

        let msg = text(json!({ "type": "frame", "data": png_url(9) }));
        let err = connection.handle_message(msg).await.unwrap_err();
        assert_eq!(err.code(), "CONNECTION_ERROR");
        assert_eq!(connection.state(), ConnectionState::Closed);
        assert!(app.registry.find_by_id(&id).await.is_none());
    }

    #[tokio::test]
    async fn test_orchestrator_failure_reported() {
        let mut orchestrator = MockOrchestrator::new();
        orchestrator
            .expect_analyze()
            .returning(|_, _| Err(OrchestratorError::RequestFailed("offline".into())));
        let app = app(orchestrator, 2, 5);
        let (mut connection, mut rx) = open(&app).await;
        next_json(&mut rx);

        let msg = text(json!({ "type": "frame", "data": png_url(2) }));
        assert_eq!(connection.handle_message(msg).await.unwrap(), Flow::Continue);
        assert_eq!(next_json(&mut rx)["code"], "ANALYSIS_FAILED");
    }

    #[tokio::test]
    async fn test_control_commands() {
        let app = app(MockOrchestrator::new(), 2, 5);
        let (mut connection, mut rx) = open(&app).await;
        next_json(&mut rx);

        connection.handle_message(text(json!({ "type": "ping" }))).await.unwrap();
        assert_eq!(next_json(&mut rx)["type"], "pong");

        let set = text(json!({ "type": "set_metadata", "key": "camera", "value": "front" }));
        connection.handle_message(set).await.unwrap();
        assert_eq!(next_json(&mut rx)["command"], "set_metadata");

        connection.handle_message(text(json!({ "type": "get_status" }))).await.unwrap();
        let status = next_json(&mut rx);
        assert_eq!(status["type"], "session_status");
        assert_eq!(status["session"]["metadata"]["camera"], "front");
        assert_eq!(status["session"]["messageCount"], 3);

        connection.handle_message(text(json!({ "type": "get_stats" }))).await.unwrap();
        let stats = next_json(&mut rx);
        assert_eq!(stats["stats"]["activeConnections"], 1);

        connection.handle_message(text(json!({ "type": "clear_cache" }))).await.unwrap();
        assert_eq!(next_json(&mut rx)["command"], "clear_cache");
    }

    #[tokio::test]
    async fn test_close_and_fail_remove_session() {
        let app = app(MockOrchestrator::new(), 2, 5);
        let (mut first, _rx1) = open(&app).await;
        let (mut second, _rx2) = open(&app).await;

        assert_eq!(
            first.handle_message(Message::Close(None)).await.unwrap(),
            Flow::Close
        );
        first.close().await;
        assert_eq!(first.state(), ConnectionState::Closed);

        second.fail("connection reset").await;
        assert_eq!(second.state(), ConnectionState::Closed);
        assert!(app.registry.is_empty().await);

        // Nothing is dispatched once closed
        let flow = second.handle_message(text(json!({ "type": "ping" }))).await.unwrap();
        assert_eq!(flow, Flow::Close);
    }
}
