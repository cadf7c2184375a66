//! PeerDrop facade
//!
//! Composition root: wires the transfer engine into the connection manager's
//! events and exposes the handful of operations a UI or CLI needs.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{watch, RwLock};
use tracing::{debug, warn};

use peerdrop_core::{
    ControlMessage, DataChannel, FileEntry, PeerLinkFactory, SignalingConnector,
};

use crate::connection::{ConnectionError, ConnectionHandler, ConnectionManager};
use crate::transfer::{ShareFile, TransferEngine, TransferError, TransferEvents};
use crate::types::{ConnectionStatus, DisconnectReason, PeerDropConfig};

/// Query parameter carrying the room id in share links
pub const SHARE_LINK_PARAM: &str = "peer";

#[derive(Debug, Error)]
pub enum PeerDropError {
    #[error(transparent)]
    Connection(#[from] ConnectionError),
    #[error(transparent)]
    Transfer(#[from] TransferError),
}

/// Routes channel traffic into the transfer engine
struct EngineBridge {
    engine: TransferEngine,
    channel: RwLock<Option<Arc<dyn DataChannel>>>,
}

#[async_trait]
impl ConnectionHandler for EngineBridge {
    async fn on_data_channel_open(&self, channel: Arc<dyn DataChannel>) {
        *self.channel.write().await = Some(channel.clone());
        if let Err(e) = self.engine.send_file_list(channel.as_ref()).await {
            warn!("Failed to send file list: {}", e);
        }
    }

    async fn on_message(&self, msg: ControlMessage) {
        let channel = self.channel.read().await.clone();
        self.engine.handle_message(msg, channel).await;
    }

    async fn on_file_chunk(&self, chunk: Bytes) {
        self.engine.handle_chunk(chunk).await;
    }

    async fn on_connection_change(&self, connected: bool) {
        self.engine.events().on_connection_change(connected);
    }

    async fn on_peer_disconnected(&self) {
        self.channel.write().await.take();
        self.engine.clear_file_state().await;
    }
}

/// One peer: share files or fetch them from a remote peer
pub struct PeerDrop {
    manager: ConnectionManager,
    engine: TransferEngine,
    share_base_url: String,
}

impl PeerDrop {
    pub fn new(
        connector: Arc<dyn SignalingConnector>,
        factory: Arc<dyn PeerLinkFactory>,
        config: PeerDropConfig,
        events: Arc<dyn TransferEvents>,
    ) -> Self {
        let engine = TransferEngine::new(config.transfer, events);
        let bridge = Arc::new(EngineBridge {
            engine: engine.clone(),
            channel: RwLock::new(None),
        });
        let manager = ConnectionManager::new(connector, factory, config.connection, bridge);
        Self {
            manager,
            engine,
            share_base_url: config.share_base_url,
        }
    }

    /// Offer files to whoever joins our room
    ///
    /// Replaces the catalogue. Starts waiting for a receiver when idle, and
    /// re-advertises immediately when a channel is already open.
    pub async fn share(&self, files: Vec<ShareFile>) -> Result<Vec<FileEntry>, PeerDropError> {
        let entries = self.engine.set_files_for_sharing(files).await;
        if self.manager.status() == ConnectionStatus::Disconnected {
            self.manager.wait_for_connection().await?;
        } else if let Some(channel) = self.manager.channel().await {
            if channel.is_open() {
                self.engine.send_file_list(channel.as_ref()).await?;
            }
        }
        Ok(entries)
    }

    /// Join a sender's room; accepts a bare room id or a share link
    pub async fn connect(&self, remote: &str) -> Result<(), ConnectionError> {
        let room_id = room_from_link(remote)
            .ok_or_else(|| ConnectionError::InvalidRoom(remote.to_string()))?;
        debug!("Connecting to room {}", room_id);
        self.manager.connect(&room_id).await?;
        Ok(())
    }

    pub async fn request_files(&self, file_ids: Vec<String>) -> Result<(), TransferError> {
        let channel = self.manager.channel().await;
        self.engine.request_files(file_ids, channel.as_ref()).await
    }

    /// Link for the remote peer: base URL plus `?peer=<room or local id>`
    pub async fn generate_share_link(&self) -> String {
        let id = match self.manager.room_id().await {
            Some(room_id) => room_id,
            None => self.manager.local_id().to_string(),
        };
        let separator = if self.share_base_url.contains('?') { '&' } else { '?' };
        format!(
            "{}{}{}={}",
            self.share_base_url, separator, SHARE_LINK_PARAM, id
        )
    }

    pub async fn disconnect(&self) {
        self.manager.disconnect().await;
    }

    /// Notify the remote and disconnect; call on every exit path
    pub async fn close(&self) {
        self.manager.close().await;
    }

    pub async fn wait_connected(&self) -> Result<(), ConnectionError> {
        self.manager.wait_connected().await
    }

    pub fn status(&self) -> ConnectionStatus {
        self.manager.status()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.manager.subscribe_status()
    }

    pub async fn room_id(&self) -> Option<String> {
        self.manager.room_id().await
    }

    pub fn local_id(&self) -> &str {
        self.manager.local_id()
    }

    pub async fn last_disconnect_reason(&self) -> Option<DisconnectReason> {
        self.manager.last_disconnect_reason().await
    }

    /// Our current catalogue
    pub async fn catalog(&self) -> Vec<FileEntry> {
        self.engine.catalog().await
    }

    /// Files the remote peer advertised
    pub async fn incoming_files(&self) -> Vec<FileEntry> {
        self.engine.incoming_files().await
    }

    pub fn manager(&self) -> &ConnectionManager {
        &self.manager
    }

    pub fn engine(&self) -> &TransferEngine {
        &self.engine
    }
}

/// Extract the room id from a share link, or return the input trimmed
///
/// `None` when the input is blank or the link's `peer` value is empty.
pub fn room_from_link(input: &str) -> Option<String> {
    let input = input.trim();
    let room = match input.split_once('?') {
        None => input,
        Some((_, query)) => {
            let query = query.split('#').next().unwrap_or_default();
            query
                .split('&')
                .filter_map(|pair| pair.split_once('='))
                .find(|(key, _)| *key == SHARE_LINK_PARAM)
                .map_or(input, |(_, value)| value)
        }
    };
    (!room.is_empty()).then(|| room.to_string())
}
