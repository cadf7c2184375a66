//! Transfer engine
//!
//! Owns the local share catalogue and the single inbound transfer, and
//! speaks the chunking protocol over an ordered, reliable data channel:
//!
//! ```text
//! sender                                  receiver
//!   file-list {files}            ->
//!                                <-       file-request {fileIds}
//!   file-start {name,size,id}    ->
//!   [binary chunk] x ceil(size / chunk)  ->
//!   file-end {id}                ->
//! ```
//!
//! A chunk that still fails after the configured attempts aborts that file
//! with `file-error`; the connection stays up and the next requested file
//! is sent.

use bytes::{Bytes, BytesMut};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::io::{AsyncReadExt, AsyncSeekExt};
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use peerdrop_core::{
    generate_id, progress_percent, ControlMessage, DataChannel, FileEntry, Frame,
    OverlapPolicy, TransportError, FILE_ID_LEN,
};

use crate::types::TransferConfig;

#[derive(Debug, Error)]
pub enum TransferError {
    #[error("No active connection")]
    NoActiveConnection,
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Where a shared file's content comes from
#[derive(Debug, Clone)]
pub enum FileSource {
    Memory(Bytes),
    Path(PathBuf),
}

/// A file offered for sharing
#[derive(Debug, Clone)]
pub struct ShareFile {
    pub name: String,
    pub size: u64,
    pub source: FileSource,
}

impl ShareFile {
    pub fn from_bytes(name: impl Into<String>, data: impl Into<Bytes>) -> Self {
        let data = data.into();
        Self {
            name: name.into(),
            size: data.len() as u64,
            source: FileSource::Memory(data),
        }
    }

    /// Share a file from disk; the size is taken from its metadata now
    pub async fn from_path(path: impl AsRef<Path>) -> std::io::Result<Self> {
        let path = path.as_ref();
        let metadata = tokio::fs::metadata(path).await?;
        let name = path
            .file_name()
            .map(|n| n.to_string_lossy().to_string())
            .unwrap_or_else(|| "file".to_string());
        Ok(Self {
            name,
            size: metadata.len(),
            source: FileSource::Path(path.to_path_buf()),
        })
    }
}

/// A fully reassembled inbound file
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceivedFile {
    pub id: String,
    pub name: String,
    pub data: Bytes,
}

/// Callbacks toward the UI / caller
///
/// Called synchronously from engine tasks; implementations should not block.
pub trait TransferEvents: Send + Sync {
    fn on_file_received(&self, _file: ReceivedFile) {}
    /// Whole-percent progress of the current file
    fn on_progress(&self, _percent: u8) {}
    /// The remote catalogue (empty after a reset)
    fn on_incoming_files(&self, _files: Vec<FileEntry>) {}
    fn on_transfer_failed(&self, _file_id: &str, _reason: &str) {}
    fn on_connection_change(&self, _connected: bool) {}
}

/// Events sink that ignores everything
pub struct NoopEvents;

impl TransferEvents for NoopEvents {}

/// Why a frame could not be sent
enum SendFailure {
    /// The channel closed or the engine was reset while retrying
    Stale,
    Failed(TransferError),
}

struct CatalogEntry {
    entry: FileEntry,
    source: FileSource,
}

struct InboundTransfer {
    file_id: String,
    file_name: String,
    declared_size: u64,
    received: u64,
    chunks: Vec<Bytes>,
}

#[derive(Default)]
struct EngineState {
    catalog: Vec<CatalogEntry>,
    inbound: Option<InboundTransfer>,
    /// File id of a rejected overlapping transfer still on the wire
    ignoring: Option<String>,
    incoming: Vec<FileEntry>,
    last_progress: Option<u8>,
}

struct EngineShared {
    config: TransferConfig,
    events: Arc<dyn TransferEvents>,
    state: Mutex<EngineState>,
    /// Serializes outbound streams so frames of two files never interleave
    send_lock: Mutex<()>,
    /// Bumped on reset; streams started under an older value stop
    generation: AtomicU64,
}

/// Sends local files and reassembles remote ones
#[derive(Clone)]
pub struct TransferEngine {
    shared: Arc<EngineShared>,
}

/// Reads successive chunks from a file source
enum ChunkReader {
    Memory(Bytes),
    File(tokio::fs::File),
}

impl ChunkReader {
    async fn open(source: &FileSource) -> std::io::Result<Self> {
        match source {
            FileSource::Memory(data) => Ok(ChunkReader::Memory(data.clone())),
            FileSource::Path(path) => Ok(ChunkReader::File(tokio::fs::File::open(path).await?)),
        }
    }

    async fn read(&mut self, offset: u64, len: usize) -> std::io::Result<Bytes> {
        match self {
            ChunkReader::Memory(data) => {
                let start = offset as usize;
                let end = start.checked_add(len).filter(|end| *end <= data.len());
                match end {
                    Some(end) => Ok(data.slice(start..end)),
                    None => Err(std::io::Error::new(
                        std::io::ErrorKind::UnexpectedEof,
                        "source shorter than declared size",
                    )),
                }
            }
            ChunkReader::File(file) => {
                file.seek(std::io::SeekFrom::Start(offset)).await?;
                let mut buf = vec![0u8; len];
                file.read_exact(&mut buf).await?;
                Ok(Bytes::from(buf))
            }
        }
    }
}

impl TransferEngine {
    pub fn new(config: TransferConfig, events: Arc<dyn TransferEvents>) -> Self {
        Self {
            shared: Arc::new(EngineShared {
                config,
                events,
                state: Mutex::new(EngineState::default()),
                send_lock: Mutex::new(()),
                generation: AtomicU64::new(0),
            }),
        }
    }

    pub fn events(&self) -> Arc<dyn TransferEvents> {
        self.shared.events.clone()
    }

    // ------------------------------------------------------------------
    // Catalogue
    // ------------------------------------------------------------------

    /// Replace the catalogue; every file gets a fresh id
    pub async fn set_files_for_sharing(&self, files: Vec<ShareFile>) -> Vec<FileEntry> {
        let catalog: Vec<CatalogEntry> = files
            .into_iter()
            .map(|f| CatalogEntry {
                entry: FileEntry {
                    id: generate_id(FILE_ID_LEN),
                    name: f.name,
                    size: f.size,
                },
                source: f.source,
            })
            .collect();
        let entries: Vec<FileEntry> = catalog.iter().map(|c| c.entry.clone()).collect();
        info!("Sharing {} file(s)", entries.len());
        self.shared.state.lock().await.catalog = catalog;
        entries
    }

    pub async fn catalog(&self) -> Vec<FileEntry> {
        let state = self.shared.state.lock().await;
        state.catalog.iter().map(|c| c.entry.clone()).collect()
    }

    /// Last catalogue advertised by the remote peer
    pub async fn incoming_files(&self) -> Vec<FileEntry> {
        self.shared.state.lock().await.incoming.clone()
    }

    /// Advertise the catalogue; no-op if the channel is closed or nothing is shared
    pub async fn send_file_list(&self, channel: &dyn DataChannel) -> Result<(), TransferError> {
        if !channel.is_open() {
            return Ok(());
        }
        let files = self.catalog().await;
        if files.is_empty() {
            return Ok(());
        }
        debug!("Sending file list ({} files)", files.len());
        channel.send(ControlMessage::FileList { files }.into()).await?;
        Ok(())
    }

    /// Ask the remote peer for specific files
    pub async fn request_files(
        &self,
        file_ids: Vec<String>,
        channel: Option<&Arc<dyn DataChannel>>,
    ) -> Result<(), TransferError> {
        let channel = match channel {
            Some(ch) if ch.is_open() => ch,
            _ => return Err(TransferError::NoActiveConnection),
        };
        debug!("Requesting {} file(s)", file_ids.len());
        channel
            .send(ControlMessage::FileRequest { file_ids }.into())
            .await?;
        Ok(())
    }

    // ------------------------------------------------------------------
    // Inbound frames
    // ------------------------------------------------------------------

    /// Handle a control message from the remote peer
    ///
    /// File requests are streamed on a background task.
    pub async fn handle_message(&self, msg: ControlMessage, channel: Option<Arc<dyn DataChannel>>) {
        match msg {
            ControlMessage::FileList { files } => {
                debug!("Remote shares {} file(s)", files.len());
                self.shared.state.lock().await.incoming = files.clone();
                self.shared.events.on_incoming_files(files);
            }
            ControlMessage::FileRequest { file_ids } => match channel {
                Some(channel) => {
                    let engine = self.clone();
                    tokio::spawn(async move {
                        engine.serve_request(file_ids, channel).await;
                    });
                }
                None => warn!("File request without a channel, ignoring"),
            },
            ControlMessage::FileStart {
                file_name,
                file_size,
                file_id,
            } => self.start_inbound(file_id, file_name, file_size).await,
            ControlMessage::FileEnd { file_id } => self.finish_inbound(&file_id).await,
            ControlMessage::FileError { file_id } => self.fail_inbound(&file_id).await,
            ControlMessage::PeerDisconnected { peer_id } => {
                debug!("peer-disconnected from {} reached the engine", peer_id);
            }
        }
    }

    /// Append a binary chunk to the active inbound transfer
    pub async fn handle_chunk(&self, chunk: Bytes) {
        let progress = {
            let mut state = self.shared.state.lock().await;
            if state.ignoring.is_some() {
                return;
            }
            let Some(transfer) = state.inbound.as_mut() else {
                warn!("Received {} byte chunk with no active transfer", chunk.len());
                return;
            };
            transfer.received += chunk.len() as u64;
            transfer.chunks.push(chunk);
            let percent = progress_percent(transfer.received, transfer.declared_size);
            Self::progress_changed(&mut state, percent)
        };
        if let Some(percent) = progress {
            self.shared.events.on_progress(percent);
        }
    }

    async fn start_inbound(&self, file_id: String, file_name: String, file_size: u64) {
        let mut abandoned = None;
        {
            let mut state = self.shared.state.lock().await;
            if let Some(active) = &state.inbound {
                match self.shared.config.overlap_policy {
                    OverlapPolicy::Replace => {
                        warn!(
                            "file-start for {} while {} is in progress, abandoning {}",
                            file_id, active.file_id, active.file_id
                        );
                        abandoned = Some(active.file_id.clone());
                    }
                    OverlapPolicy::Reject => {
                        warn!(
                            "file-start for {} while {} is in progress, ignoring {}",
                            file_id, active.file_id, file_id
                        );
                        state.ignoring = Some(file_id);
                        return;
                    }
                }
            }
            debug!("Receiving {} ({} bytes)", file_name, file_size);
            state.inbound = Some(InboundTransfer {
                file_id,
                file_name,
                declared_size: file_size,
                received: 0,
                chunks: Vec::new(),
            });
            state.ignoring = None;
            state.last_progress = Some(0);
        }
        if let Some(old) = abandoned {
            self.shared
                .events
                .on_transfer_failed(&old, "superseded by another transfer");
        }
        self.shared.events.on_progress(0);
    }

    async fn finish_inbound(&self, file_id: &str) {
        let (file, progress) = {
            let mut state = self.shared.state.lock().await;
            if state.ignoring.as_deref() == Some(file_id) {
                debug!("Rejected transfer {} ended", file_id);
                state.ignoring = None;
                return;
            }
            let matches = state
                .inbound
                .as_ref()
                .is_some_and(|t| t.file_id == file_id);
            if !matches {
                warn!("file-end for {} with no matching transfer, ignoring", file_id);
                return;
            }
            let Some(transfer) = state.inbound.take() else {
                return;
            };
            if transfer.received != transfer.declared_size {
                warn!(
                    "{}: received {} bytes, expected {}",
                    transfer.file_name, transfer.received, transfer.declared_size
                );
            }
            let mut data = BytesMut::with_capacity(transfer.received as usize);
            for chunk in &transfer.chunks {
                data.extend_from_slice(chunk);
            }
            let file = ReceivedFile {
                id: transfer.file_id,
                name: transfer.file_name,
                data: data.freeze(),
            };
            (file, Self::progress_changed(&mut state, 100))
        };
        info!("Received {} ({} bytes)", file.name, file.data.len());
        if let Some(percent) = progress {
            self.shared.events.on_progress(percent);
        }
        self.shared.events.on_file_received(file);
    }

    async fn fail_inbound(&self, file_id: &str) {
        {
            let mut state = self.shared.state.lock().await;
            if state.ignoring.as_deref() == Some(file_id) {
                state.ignoring = None;
                return;
            }
            match &state.inbound {
                Some(t) if t.file_id == file_id => state.inbound = None,
                // Failed before file-start: still a file the remote offered
                _ if state.incoming.iter().any(|f| f.id == file_id) => {}
                _ => {
                    debug!("file-error for {} with no matching transfer", file_id);
                    return;
                }
            }
        }
        warn!("Remote failed to send {}", file_id);
        self.shared
            .events
            .on_transfer_failed(file_id, "remote failed to send the file");
    }

    // ------------------------------------------------------------------
    // Outbound streaming
    // ------------------------------------------------------------------

    /// Stream every requested file present in the catalogue, in order
    ///
    /// Unknown ids are skipped silently.
    pub async fn serve_request(&self, file_ids: Vec<String>, channel: Arc<dyn DataChannel>) {
        let _guard = self.shared.send_lock.lock().await;
        let generation = self.shared.generation.load(Ordering::SeqCst);

        for file_id in file_ids {
            let found = {
                let state = self.shared.state.lock().await;
                state
                    .catalog
                    .iter()
                    .find(|c| c.entry.id == file_id)
                    .map(|c| (c.entry.clone(), c.source.clone()))
            };
            let Some((entry, source)) = found else {
                debug!("Request for unknown file {}, ignoring", file_id);
                continue;
            };
            if !self.still_current(generation, channel.as_ref()) {
                return;
            }
            self.send_file(&entry, &source, channel.as_ref(), generation)
                .await;
        }
    }

    fn still_current(&self, generation: u64, channel: &dyn DataChannel) -> bool {
        self.shared.generation.load(Ordering::SeqCst) == generation && channel.is_open()
    }

    async fn send_file(
        &self,
        entry: &FileEntry,
        source: &FileSource,
        channel: &dyn DataChannel,
        generation: u64,
    ) {
        info!("Sending {} ({} bytes)", entry.name, entry.size);
        let start = ControlMessage::FileStart {
            file_name: entry.name.clone(),
            file_size: entry.size,
            file_id: entry.id.clone(),
        };
        if let Err(failure) = self.send_with_retry(channel, start.into(), generation).await {
            self.fail_send(entry, channel, failure).await;
            return;
        }
        self.report_progress(0).await;

        let mut reader = match ChunkReader::open(source).await {
            Ok(reader) => reader,
            Err(e) => {
                self.abort_send(entry, channel, &e.to_string()).await;
                return;
            }
        };

        let chunk_size = self.shared.config.chunk_size.max(1) as u64;
        let mut offset = 0u64;
        while offset < entry.size {
            if !self.still_current(generation, channel) {
                debug!("Stopping {} at {} bytes: connection reset", entry.name, offset);
                return;
            }
            let len = chunk_size.min(entry.size - offset) as usize;
            let chunk = match reader.read(offset, len).await {
                Ok(chunk) => chunk,
                Err(e) => {
                    self.abort_send(entry, channel, &format!("read failed: {}", e))
                        .await;
                    return;
                }
            };
            if let Err(failure) = self
                .send_with_retry(channel, Frame::Binary(chunk), generation)
                .await
            {
                self.fail_send(entry, channel, failure).await;
                return;
            }
            offset += len as u64;
            self.report_progress(progress_percent(offset, entry.size))
                .await;
        }

        let end = ControlMessage::FileEnd {
            file_id: entry.id.clone(),
        };
        if let Err(failure) = self.send_with_retry(channel, end.into(), generation).await {
            self.fail_send(entry, channel, failure).await;
            return;
        }
        // Empty files never pass through the chunk loop
        self.report_progress(100).await;
        info!("Sent {}", entry.name);
    }

    /// Send one frame, retrying the same frame after a fixed delay
    ///
    /// Gives up early with [`SendFailure::Stale`] once the channel closes or
    /// the engine is reset between attempts.
    async fn send_with_retry(
        &self,
        channel: &dyn DataChannel,
        frame: Frame,
        generation: u64,
    ) -> Result<(), SendFailure> {
        let attempts = self.shared.config.max_send_attempts.max(1);
        let mut last_err = TransportError::NotConnected;
        for attempt in 1..=attempts {
            match channel.send(frame.clone()).await {
                Ok(()) => return Ok(()),
                Err(e) => {
                    debug!("Send attempt {}/{} failed: {}", attempt, attempts, e);
                    last_err = e;
                }
            }
            if attempt < attempts {
                tokio::time::sleep(self.shared.config.retry_delay).await;
                if !self.still_current(generation, channel) {
                    return Err(SendFailure::Stale);
                }
            }
        }
        Err(SendFailure::Failed(TransferError::Transport(last_err)))
    }

    /// Abort after a failed send, unless the connection already went away
    async fn fail_send(&self, entry: &FileEntry, channel: &dyn DataChannel, failure: SendFailure) {
        match failure {
            SendFailure::Stale => {
                debug!("Stopping {}: connection reset during retries", entry.name)
            }
            SendFailure::Failed(e) => self.abort_send(entry, channel, &e.to_string()).await,
        }
    }

    async fn abort_send(&self, entry: &FileEntry, channel: &dyn DataChannel, reason: &str) {
        warn!("Aborting {}: {}", entry.name, reason);
        let notice = ControlMessage::FileError {
            file_id: entry.id.clone(),
        };
        if let Err(e) = channel.send(notice.into()).await {
            debug!("Could not deliver file-error for {}: {}", entry.id, e);
        }
        self.shared.events.on_transfer_failed(&entry.id, reason);
    }

    // ------------------------------------------------------------------
    // Progress and reset
    // ------------------------------------------------------------------

    fn progress_changed(state: &mut EngineState, percent: u8) -> Option<u8> {
        if state.last_progress == Some(percent) {
            return None;
        }
        state.last_progress = Some(percent);
        Some(percent)
    }

    async fn report_progress(&self, percent: u8) {
        let changed = {
            let mut state = self.shared.state.lock().await;
            Self::progress_changed(&mut state, percent)
        };
        if let Some(percent) = changed {
            self.shared.events.on_progress(percent);
        }
    }

    /// Drop all transfer state after a disconnection
    ///
    /// Discards the inbound transfer, empties the catalogue and the remote
    /// listing, stops outbound streams at the next chunk and resets progress.
    pub async fn clear_file_state(&self) {
        self.shared.generation.fetch_add(1, Ordering::SeqCst);
        let dropped = {
            let mut state = self.shared.state.lock().await;
            let dropped = state.inbound.take().map(|t| t.file_id);
            state.catalog.clear();
            state.incoming.clear();
            state.ignoring = None;
            state.last_progress = Some(0);
            dropped
        };
        if let Some(file_id) = dropped {
            info!("Discarded partial transfer {}", file_id);
        }
        self.shared.events.on_incoming_files(Vec::new());
        self.shared.events.on_progress(0);
    }

    /// Whether a file is currently being received
    pub async fn has_inbound_transfer(&self) -> bool {
        self.shared.state.lock().await.inbound.is_some()
    }
}
