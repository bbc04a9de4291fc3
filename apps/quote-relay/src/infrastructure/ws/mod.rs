//! WebSocket Transport
//!
//! Serves `GET /ws` and bridges each socket to a [`BroadcastEngine`] client.
//! Inbound text frames are parsed as [`ClientMessage`]s and answered on the
//! same socket; updates from the client's delivery worker are written as
//! they arrive. Closing the socket, or any read error, disconnects the
//! client, which drops all of its subscriptions.

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Router,
    extract::{
        State,
        ws::{Message, WebSocket, WebSocketUpgrade},
    },
    response::IntoResponse,
    routing::get,
};
use futures::{SinkExt, StreamExt};
use tokio::net::TcpListener;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::application::services::{BroadcastEngine, ClientConnection};
use crate::domain::streaming::{ClientMessage, ServerMessage};
use crate::domain::subscription::ClientId;

// =============================================================================
// Server
// =============================================================================

#[derive(Clone)]
struct WsState {
    engine: Arc<BroadcastEngine>,
    cancel: CancellationToken,
}

/// WebSocket server for live clients.
pub struct WsServer {
    port: u16,
    engine: Arc<BroadcastEngine>,
    cancel: CancellationToken,
}

impl WsServer {
    /// Create a new WebSocket server.
    #[must_use]
    pub const fn new(port: u16, engine: Arc<BroadcastEngine>, cancel: CancellationToken) -> Self {
        Self {
            port,
            engine,
            cancel,
        }
    }

    /// Run the server until cancelled.
    ///
    /// # Errors
    ///
    /// Returns `WsServerError` if binding fails or the HTTP server
    /// encounters a fatal error while running.
    pub async fn run(self) -> Result<(), WsServerError> {
        let addr = SocketAddr::from(([0, 0, 0, 0], self.port));
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| WsServerError::BindFailed(self.port, e.to_string()))?;

        info!(port = self.port, "WebSocket server listening");

        axum::serve(listener, router(self.engine, self.cancel.clone()))
            .with_graceful_shutdown(self.cancel.cancelled_owned())
            .await
            .map_err(|e| WsServerError::ServerFailed(e.to_string()))?;

        info!("WebSocket server stopped");
        Ok(())
    }
}

/// Routes served by the WebSocket server. Open sockets close when `cancel`
/// fires.
pub fn router(engine: Arc<BroadcastEngine>, cancel: CancellationToken) -> Router {
    Router::new()
        .route("/ws", get(ws_handler))
        .with_state(WsState { engine, cancel })
}

async fn ws_handler(ws: WebSocketUpgrade, State(state): State<WsState>) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

// =============================================================================
// Connection Loop
// =============================================================================

async fn handle_socket(socket: WebSocket, state: WsState) {
    let WsState { engine, cancel } = state;
    let ClientConnection {
        id: client_id,
        mut outbound,
    } = engine.connect();
    let (mut sink, mut stream) = socket.split();

    loop {
        let outgoing = tokio::select! {
            () = cancel.cancelled() => break,
            inbound = stream.next() => match inbound {
                Some(Ok(Message::Text(text))) => reply(&engine, client_id, text.as_str()),
                Some(Ok(Message::Binary(_))) => {
                    ServerMessage::error("binary frames are not supported")
                }
                Some(Ok(Message::Close(_))) | None => break,
                Some(Ok(Message::Ping(_) | Message::Pong(_))) => continue,
                Some(Err(e)) => {
                    debug!(client_id, error = %e, "WebSocket read failed");
                    break;
                }
            },
            update = outbound.recv() => match update {
                Some(message) => message,
                None => break,
            },
        };

        let frame = match outgoing.to_json() {
            Ok(json) => Message::Text(json.into()),
            Err(e) => {
                warn!(client_id, error = %e, "Failed to serialize server message");
                continue;
            }
        };
        if sink.send(frame).await.is_err() {
            debug!(client_id, "WebSocket write failed");
            break;
        }
    }

    engine.disconnect(client_id);
    let _ = sink.close().await;
}

/// Answer one inbound text frame.
fn reply(engine: &BroadcastEngine, client_id: ClientId, text: &str) -> ServerMessage {
    match ClientMessage::parse(text) {
        Ok(message) => engine.handle_message(client_id, message),
        Err(e) => {
            debug!(client_id, error = %e, "Unparseable client frame");
            ServerMessage::error(e)
        }
    }
}

// =============================================================================
// Errors
// =============================================================================

/// WebSocket server errors.
#[derive(Debug, thiserror::Error)]
pub enum WsServerError {
    /// Failed to bind to port.
    #[error("failed to bind to port {0}: {1}")]
    BindFailed(u16, String),

    /// Server error.
    #[error("server error: {0}")]
    ServerFailed(String),
}

// =============================================================================
// Tests
// =============================================================================

#[cfg(test)]
mod tests {
    use super::*;
    use crate::application::services::EngineConfig;
    use crate::domain::indicators::Indicator;
    use crate::domain::subscription::SubscriptionRegistry;
    use crate::infrastructure::clock::SystemClock;

    fn engine() -> Arc<BroadcastEngine> {
        BroadcastEngine::new(
            EngineConfig::default(),
            Arc::new(SubscriptionRegistry::new()),
            Arc::new(SystemClock),
        )
    }

    #[tokio::test]
    async fn malformed_frame_gets_error_reply() {
        let engine = engine();
        let conn = engine.connect();

        let message = reply(&engine, conn.id, "{not json");
        assert!(matches!(message, ServerMessage::Error { ref message } if message.starts_with("malformed message")));
        assert!(engine.registry().client_symbols(conn.id).is_empty());
    }

    #[tokio::test]
    async fn subscribe_frame_is_acknowledged() {
        let engine = engine();
        let conn = engine.connect();

        let message = reply(
            &engine,
            conn.id,
            r#"{"type":"subscribe","symbols":["MSFT","AAPL"],"indicators":["rsi"]}"#,
        );
        assert_eq!(
            message,
            ServerMessage::Subscribed {
                symbols: vec!["AAPL".to_string(), "MSFT".to_string()],
                indicators: vec![Indicator::Rsi],
            }
        );
        engine.shutdown();
    }

    #[tokio::test]
    async fn empty_subscribe_is_rejected() {
        let engine = engine();
        let conn = engine.connect();

        let message = reply(&engine, conn.id, r#"{"type":"subscribe","symbols":[]}"#);
        assert_eq!(
            message,
            ServerMessage::error("symbols must be a non-empty array")
        );
    }
}
