//! WebSocket relay server
//!
//! Routes:
//! - `GET /ws`: signaling socket (JSON text frames)
//! - `GET /health`: liveness check
//! - `GET /stats`: room and connection counts

use anyhow::Result;
use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::IntoResponse,
    routing::get,
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use serde::Serialize;
use std::future::Future;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, error, info};

use crate::registry::RoomRegistry;
use crate::session::ClientSession;

/// State shared by all relay handlers
#[derive(Clone)]
pub struct RelayState {
    pub rooms: Arc<RoomRegistry>,
}

impl RelayState {
    pub fn new() -> Self {
        Self {
            rooms: Arc::new(RoomRegistry::new()),
        }
    }
}

impl Default for RelayState {
    fn default() -> Self {
        Self::new()
    }
}

#[derive(Debug, Serialize)]
pub struct RelayStats {
    pub rooms: usize,
    pub connections: usize,
}

pub struct RelayServer {
    state: RelayState,
    addr: String,
}

impl RelayServer {
    pub fn new(addr: impl Into<String>) -> Self {
        Self {
            state: RelayState::new(),
            addr: addr.into(),
        }
    }

    /// Share an existing registry (e.g. to inspect rooms from tests)
    pub fn with_registry(mut self, rooms: Arc<RoomRegistry>) -> Self {
        self.state.rooms = rooms;
        self
    }

    pub fn registry(&self) -> Arc<RoomRegistry> {
        self.state.rooms.clone()
    }

    pub fn addr(&self) -> &str {
        &self.addr
    }

    pub fn router(&self) -> Router {
        Router::new()
            .route("/ws", get(signaling_ws_handler))
            .route("/health", get(health_check))
            .route("/stats", get(stats))
            .with_state(self.state.clone())
    }

    /// Bind the configured address and serve until `shutdown` resolves
    pub async fn run<F>(self, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let listener = TcpListener::bind(&self.addr).await?;
        self.serve(listener, shutdown).await
    }

    /// Serve on an already-bound listener until `shutdown` resolves
    pub async fn serve<F>(self, listener: TcpListener, shutdown: F) -> Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        info!("Relay listening on {}", listener.local_addr()?);
        let app = self.router();
        axum::serve(listener, app)
            .with_graceful_shutdown(shutdown)
            .await?;
        info!("Relay stopped");
        Ok(())
    }
}

async fn health_check() -> &'static str {
    "ok"
}

async fn stats(State(state): State<RelayState>) -> Json<RelayStats> {
    Json(RelayStats {
        rooms: state.rooms.room_count().await,
        connections: state.rooms.connection_count(),
    })
}

/// WebSocket upgrade handler for the /ws endpoint
pub async fn signaling_ws_handler(
    ws: WebSocketUpgrade,
    State(state): State<RelayState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_signaling_socket(socket, state))
}

/// Handle a single relay connection
async fn handle_signaling_socket(socket: WebSocket, state: RelayState) {
    let (mut ws_tx, mut ws_rx) = socket.split();
    let (tx, mut rx) = mpsc::unbounded_channel::<String>();

    let mut session = ClientSession::new(state.rooms.clone(), tx);
    let client_id = session.id();

    // Forward queued frames to the socket
    let send_task = tokio::spawn(async move {
        while let Some(text) = rx.recv().await {
            if ws_tx.send(Message::Text(text)).await.is_err() {
                break;
            }
        }
    });

    while let Some(result) = ws_rx.next().await {
        match result {
            Ok(Message::Text(text)) => session.handle_text(&text).await,
            Ok(Message::Binary(_)) => {
                debug!("Client {} sent a binary frame", client_id);
                session.reply_invalid();
            }
            Ok(Message::Close(_)) => break,
            Ok(_) => {} // Ping/Pong handled by axum
            Err(e) => {
                error!("WebSocket error from client {}: {}", client_id, e);
                break;
            }
        }
    }

    // Leaving drops the registry's copy of the outbound sender
    session.close().await;
    let _ = send_task.await;
}

#[cfg(test)]
mod tests {
    use super::*;
    use peerdrop_core::{Role, SignalingMessage};
    use std::time::Duration;
    use tokio_tungstenite::{connect_async, tungstenite::Message as WsMessage};

    async fn start() -> (String, Arc<RoomRegistry>, tokio::sync::oneshot::Sender<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = RelayServer::new(addr.to_string());
        let registry = server.registry();
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        tokio::spawn(server.serve(listener, async move {
            let _ = stop_rx.await;
        }));
        (format!("ws://{}/ws", addr), registry, stop_tx)
    }

    async fn next_signal<S>(ws: &mut S) -> SignalingMessage
    where
        S: futures::Stream<Item = Result<WsMessage, tokio_tungstenite::tungstenite::Error>> + Unpin,
    {
        loop {
            let msg = tokio::time::timeout(Duration::from_secs(5), ws.next())
                .await
                .expect("timed out waiting for relay")
                .expect("socket closed")
                .expect("socket error");
            if let WsMessage::Text(text) = msg {
                return SignalingMessage::parse(&text).unwrap();
            }
        }
    }

    #[tokio::test]
    async fn test_ws_pairing_and_relay() {
        let (url, registry, _stop) = start().await;

        let (mut sender, _) = connect_async(&url).await.unwrap();
        let (mut receiver, _) = connect_async(&url).await.unwrap();

        sender
            .send(WsMessage::Text(SignalingMessage::join("room1", Role::Sender).to_json()))
            .await
            .unwrap();
        // Let the first join land before the second
        tokio::time::sleep(Duration::from_millis(50)).await;
        receiver
            .send(WsMessage::Text(SignalingMessage::join("room1", Role::Receiver).to_json()))
            .await
            .unwrap();

        match next_signal(&mut sender).await {
            SignalingMessage::PeerJoined { peer_role } => assert_eq!(peer_role, Role::Receiver),
            other => panic!("Expected PeerJoined, got {:?}", other),
        }
        match next_signal(&mut receiver).await {
            SignalingMessage::PeerJoined { .. } => {}
            other => panic!("Expected PeerJoined, got {:?}", other),
        }

        let offer = SignalingMessage::offer(serde_json::json!({"type": "offer", "sdp": "v=0"}), "room1");
        sender.send(WsMessage::Text(offer.to_json())).await.unwrap();
        assert_eq!(next_signal(&mut receiver).await, offer);

        drop(sender);
        match next_signal(&mut receiver).await {
            SignalingMessage::PeerLeft { peer_role } => assert_eq!(peer_role, Role::Sender),
            other => panic!("Expected PeerLeft, got {:?}", other),
        }
        assert_eq!(registry.occupancy("room1").await, Some((false, true)));
    }

    #[tokio::test]
    async fn test_ws_malformed_message() {
        let (url, _registry, _stop) = start().await;
        let (mut client, _) = connect_async(&url).await.unwrap();
        client.send(WsMessage::Text("garbage".into())).await.unwrap();
        match next_signal(&mut client).await {
            SignalingMessage::Error { message } => assert_eq!(message, "Invalid message format"),
            other => panic!("Expected Error, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn test_router_has_health_route() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        let handle = tokio::spawn(RelayServer::new(addr.to_string()).serve(listener, async move {
            let _ = stop_rx.await;
        }));

        let mut stream = tokio::net::TcpStream::connect(addr).await.unwrap();
        use tokio::io::{AsyncReadExt, AsyncWriteExt};
        stream
            .write_all(b"GET /health HTTP/1.1\r\nHost: localhost\r\nConnection: close\r\n\r\n")
            .await
            .unwrap();
        let mut response = String::new();
        stream.read_to_string(&mut response).await.unwrap();
        assert!(response.starts_with("HTTP/1.1 200"));
        assert!(response.ends_with("ok"));

        stop_tx.send(()).unwrap();
        handle.await.unwrap().unwrap();
    }
}
