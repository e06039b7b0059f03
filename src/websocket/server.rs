use std::collections::HashMap;
use std::io;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::Value;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::session::ConnectionHandle;
use crate::websocket::{Connection as WebSocketConnection, Flow};
use crate::AppState;

/// Time allowed for queued messages to drain after the reader stops.
const WRITER_DRAIN_TIMEOUT: Duration = Duration::from_secs(5);
/// Pause after an accept error that is not specific to one peer.
const ACCEPT_BACKOFF: Duration = Duration::from_millis(100);

pub struct WebSocketServer {
    app: AppState,
    active: Arc<watch::Sender<usize>>,
}

/// Counts a connection task for as long as it lives.
struct ActiveConnection {
    active: Arc<watch::Sender<usize>>,
}

impl ActiveConnection {
    fn new(active: Arc<watch::Sender<usize>>) -> Self {
        active.send_modify(|n| *n += 1);
        Self { active }
    }
}

impl Drop for ActiveConnection {
    fn drop(&mut self) {
        self.active.send_modify(|n| *n -= 1);
    }
}

impl WebSocketServer {
    pub fn new(app: AppState) -> Self {
        let (active, _) = watch::channel(0);
        Self {
            app,
            active: Arc::new(active),
        }
    }

    /// Accept connections until the task running this is aborted.
    pub async fn run(self: Arc<Self>, listener: TcpListener) {
        loop {
            match listener.accept().await {
                Ok((stream, addr)) => {
                    let server = self.clone();
                    let guard = ActiveConnection::new(self.active.clone());
                    tokio::spawn(async move {
                        server.handle_connection(stream, addr).await;
                        drop(guard);
                    });
                }
                Err(e) => {
                    error!("Failed to accept connection: {}", e);
                    if let Some(delay) = accept_backoff(&e) {
                        tokio::time::sleep(delay).await;
                    }
                }
            }
        }
    }

    /// Connection tasks still running.
    pub fn active_connections(&self) -> usize {
        *self.active.borrow()
    }

    /// Wait for every connection task to finish flushing, bounded by the
    /// writer drain timeout. Returns false if some were still running.
    pub async fn wait_for_connections(&self) -> bool {
        let mut active = self.active.subscribe();
        let drained = tokio::time::timeout(WRITER_DRAIN_TIMEOUT, active.wait_for(|n| *n == 0)).await;
        matches!(drained, Ok(Ok(_)))
    }

    pub async fn handle_connection(&self, raw_stream: TcpStream, addr: SocketAddr) {
        info!("New WebSocket connection from: {}", addr);

        let mut metadata = HashMap::new();
        metadata.insert("peerAddr".to_string(), Value::String(addr.to_string()));

        let capture = |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
            metadata.extend(request_metadata(req));
            Ok(resp)
        };

        let ws_stream = match tokio_tungstenite::accept_hdr_async(raw_stream, capture).await {
            Ok(ws) => ws,
            Err(e) => {
                error!("Error during WebSocket handshake: {}", e);
                return;
            }
        };

        let (ws_sink, ws_stream) = ws_stream.split();
        let (tx, rx) = mpsc::unbounded_channel();
        let handle = ConnectionHandle::new(tx);
        let connection_id = handle.id();
        let (writer_done_tx, mut writer_done) = watch::channel(false);

        // Forward messages from rx to WebSocket; a close frame ends the writer
        let mut send_task = tokio::spawn(async move {
            let mut ws_sink = ws_sink;
            let mut rx = rx;

            while let Some(message) = rx.recv().await {
                let closing = matches!(message, Message::Close(_));
                if let Err(e) = ws_sink.send(message).await {
                    error!("Error sending WebSocket message: {}", e);
                    break;
                }
                if closing {
                    break;
                }
            }

            if let Err(e) = ws_sink.close().await {
                debug!("Error closing WebSocket connection: {}", e);
            }
            let _ = writer_done_tx.send(true);
        });

        let mut connection = WebSocketConnection::new(handle, self.app.clone());
        let session_id = match connection.open(metadata).await {
            Ok(id) => id,
            Err(e) => {
                warn!("Rejected connection {} from {}: {}", connection_id, addr, e);
                drop(connection);
                let _ = tokio::time::timeout(WRITER_DRAIN_TIMEOUT, send_task).await;
                return;
            }
        };

        // Handle incoming WebSocket messages strictly in order. The writer
        // finishing is only noticed between messages, so a frame already
        // under analysis runs to completion.
        let receive_task = tokio::spawn(async move {
            let mut ws_stream = ws_stream;

            loop {
                let message = tokio::select! {
                    biased;
                    _ = writer_done.changed() => break,
                    message = ws_stream.next() => message,
                };

                match message {
                    Some(Ok(msg)) => match connection.handle_message(msg).await {
                        Ok(Flow::Continue) => {}
                        Ok(Flow::Close) => break,
                        Err(e) => {
                            error!("Error handling message: {}", e);
                            break;
                        }
                    },
                    Some(Err(e)) => {
                        error!("Error receiving WebSocket message: {}", e);
                        connection.fail(&e.to_string()).await;
                        break;
                    }
                    None => break,
                }
            }

            connection.close().await;
        });

        if let Err(e) = receive_task.await {
            error!("Receive task for connection {} failed: {}", connection_id, e);
        }
        debug!("Receive task completed for connection {}", connection_id);
        if tokio::time::timeout(WRITER_DRAIN_TIMEOUT, &mut send_task).await.is_err() {
            send_task.abort();
        }

        // Cleanup session
        self.app.registry.remove(&session_id).await;
        info!("Connection {} (session {}) closed", connection_id, session_id);
    }
}

/// Errors tied to a single peer are retried at once; anything else, such
/// as running out of file descriptors, waits [`ACCEPT_BACKOFF`] first.
fn accept_backoff(err: &io::Error) -> Option<Duration> {
    match err.kind() {
        io::ErrorKind::ConnectionAborted
        | io::ErrorKind::ConnectionReset
        | io::ErrorKind::ConnectionRefused
        | io::ErrorKind::Interrupted
        | io::ErrorKind::WouldBlock => None,
        _ => Some(ACCEPT_BACKOFF),
    }
}

/// Request path and query-string parameters of the upgrade request.
fn request_metadata(req: &Request) -> HashMap<String, Value> {
    let mut metadata = HashMap::new();
    metadata.insert("path".to_string(), Value::String(req.uri().path().to_string()));

    if let Some(query) = req.uri().query() {
        for (key, value) in url::form_urlencoded::parse(query.as_bytes()) {
            metadata.insert(key.into_owned(), Value::String(value.into_owned()));
        }
    }
    if let Some(agent) = req.headers().get("user-agent").and_then(|h| h.to_str().ok()) {
        metadata.insert("userAgent".to_string(), Value::String(agent.to_string()));
    }
    metadata
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_request_metadata() {
        let req = Request::builder()
            .uri("/ws?client=kiosk&room=lobby%201")
            .header("user-agent", "kiosk-agent/1.0")
            .body(())
            .unwrap();

        let metadata = request_metadata(&req);
        assert_eq!(metadata["path"], "/ws");
        assert_eq!(metadata["client"], "kiosk");
        assert_eq!(metadata["room"], "lobby 1");
        assert_eq!(metadata["userAgent"], "kiosk-agent/1.0");
    }

    #[test]
    fn test_accept_backoff() {
        let aborted = io::Error::from(io::ErrorKind::ConnectionAborted);
        assert_eq!(accept_backoff(&aborted), None);

        // EMFILE
        let exhausted = io::Error::from_raw_os_error(24);
        assert_eq!(accept_backoff(&exhausted), Some(ACCEPT_BACKOFF));
    }

    #[tokio::test]
    async fn test_connection_count_tracks_guards() {
        let config = crate::Settings::new_for_test().expect("Failed to load test config");
        let server = WebSocketServer::new(AppState::new(config).unwrap());
        assert!(server.wait_for_connections().await);

        let guard = ActiveConnection::new(server.active.clone());
        assert_eq!(server.active_connections(), 1);
        drop(guard);
        assert_eq!(server.active_connections(), 0);
        assert!(server.wait_for_connections().await);
    }
}
