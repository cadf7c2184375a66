//! Per-connection relay logic
//!
//! A [`ClientSession`] interprets the text frames of one relay connection.
//! It is transport-agnostic: the WebSocket handler and the in-process relay
//! both feed it raw text and drain its outbound channel.

use std::sync::Arc;
use tracing::{debug, warn};

use peerdrop_core::{Role, SignalingMessage};

use crate::registry::{ClientId, ClientTx, JoinError, RoomRegistry};

pub const INVALID_MESSAGE: &str = "Invalid message format";

pub struct ClientSession {
    registry: Arc<RoomRegistry>,
    id: ClientId,
    tx: ClientTx,
    joined: Option<(String, Role)>,
}

impl ClientSession {
    /// Register a new connection whose outbound frames go to `tx`
    pub fn new(registry: Arc<RoomRegistry>, tx: ClientTx) -> Self {
        let id = registry.register();
        Self {
            registry,
            id,
            tx,
            joined: None,
        }
    }

    pub fn id(&self) -> ClientId {
        self.id
    }

    /// The room and role this connection holds, if any
    pub fn joined(&self) -> Option<(&str, Role)> {
        self.joined.as_ref().map(|(room, role)| (room.as_str(), *role))
    }

    /// Handle one inbound text frame
    pub async fn handle_text(&mut self, text: &str) {
        let msg = match SignalingMessage::parse(text) {
            Ok(msg) => msg,
            Err(e) => {
                debug!("Client {} sent malformed message: {}", self.id, e);
                self.reply_invalid();
                return;
            }
        };

        match msg {
            SignalingMessage::JoinRoom { room_id, role } => self.handle_join(room_id, role).await,
            msg if msg.is_relayed() => match &self.joined {
                Some((room_id, _)) => {
                    self.registry.relay(room_id, self.id, text).await;
                }
                None => {
                    debug!("Client {} sent {} before joining", self.id, msg.msg_type());
                    self.reply_error("Join a room before signaling");
                }
            },
            other => {
                debug!("Client {} sent server-only {}", self.id, other.msg_type());
                self.reply_error(format!("Unexpected message type: {}", other.msg_type()));
            }
        }
    }

    async fn handle_join(&mut self, room_id: String, role: Role) {
        if let Some((current, current_role)) = &self.joined {
            if *current != room_id || *current_role != role {
                let err = JoinError::AlreadyInRoom {
                    room: current.clone(),
                    role: *current_role,
                };
                warn!("Client {}: {}", self.id, err);
                self.reply_error(err.to_string());
                return;
            }
        }

        match self
            .registry
            .join(&room_id, role, self.id, self.tx.clone())
            .await
        {
            Ok(()) => self.joined = Some((room_id, role)),
            Err(e) => {
                warn!("Client {} join {} rejected: {}", self.id, room_id, e);
                self.reply_error(e.to_string());
            }
        }
    }

    /// Answer a frame that is not a signaling message
    pub fn reply_invalid(&self) {
        self.reply_error(INVALID_MESSAGE);
    }

    fn reply_error(&self, message: impl Into<String>) {
        let _ = self.tx.send(SignalingMessage::error(message).to_json());
    }

    /// Leave the joined room (if any) and release the connection
    pub async fn close(mut self) {
        if let Some((room_id, _)) = self.joined.take() {
            self.registry.leave(&room_id, self.id).await;
        }
        self.registry.unregister(self.id);
    }
}
