//! In-process relay
//!
//! Runs the same room logic as the WebSocket server but hands clients
//! in-memory connections. Used for tests and simulations; it can also drop
//! every live connection or refuse new ones to exercise reconnect paths.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex as StdMutex, Weak};
use tokio::sync::{mpsc, Mutex};
use tracing::debug;

use peerdrop_core::{
    SignalingConnector, SignalingLink, SignalingMessage, SignalingSink, TransportError,
};

use crate::registry::RoomRegistry;
use crate::session::ClientSession;

pub struct LocalRelay {
    rooms: Arc<RoomRegistry>,
    available: AtomicBool,
    connect_attempts: AtomicUsize,
    links: StdMutex<Vec<Weak<LocalSink>>>,
}

impl LocalRelay {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            rooms: Arc::new(RoomRegistry::new()),
            available: AtomicBool::new(true),
            connect_attempts: AtomicUsize::new(0),
            links: StdMutex::new(Vec::new()),
        })
    }

    pub fn registry(&self) -> Arc<RoomRegistry> {
        self.rooms.clone()
    }

    /// Refuse (false) or accept (true) new connections
    pub fn set_available(&self, available: bool) {
        self.available.store(available, Ordering::SeqCst);
    }

    /// Number of `connect` calls seen so far, successful or not
    pub fn connect_attempts(&self) -> usize {
        self.connect_attempts.load(Ordering::SeqCst)
    }

    /// Abruptly drop every live connection, as if the relay restarted
    pub async fn drop_connections(&self) {
        let links: Vec<Arc<LocalSink>> = {
            let mut links = self.links.lock().unwrap_or_else(|e| e.into_inner());
            let live = links.iter().filter_map(Weak::upgrade).collect();
            links.clear();
            live
        };
        debug!("Dropping {} relay connections", links.len());
        for link in links {
            link.close().await;
        }
    }
}

#[async_trait]
impl SignalingConnector for LocalRelay {
    async fn connect(&self) -> Result<SignalingLink, TransportError> {
        self.connect_attempts.fetch_add(1, Ordering::SeqCst);
        if !self.available.load(Ordering::SeqCst) {
            return Err(TransportError::ConnectionFailed(
                "relay unavailable".to_string(),
            ));
        }

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<String>();
        let (in_tx, in_rx) = mpsc::unbounded_channel::<SignalingMessage>();
        let session = ClientSession::new(self.rooms.clone(), out_tx);

        // Relay frames become parsed messages; the stream ends once the
        // session and the registry have both dropped their senders.
        tokio::spawn(async move {
            while let Some(text) = out_rx.recv().await {
                match SignalingMessage::parse(&text) {
                    Ok(msg) => {
                        if in_tx.send(msg).is_err() {
                            break;
                        }
                    }
                    Err(e) => debug!("Local relay produced unparseable frame: {}", e),
                }
            }
        });

        let sink = Arc::new(LocalSink {
            session: Mutex::new(Some(session)),
        });
        {
            let mut links = self.links.lock().unwrap_or_else(|e| e.into_inner());
            links.retain(|l| l.strong_count() > 0);
            links.push(Arc::downgrade(&sink));
        }

        Ok(SignalingLink {
            sink,
            incoming: in_rx,
        })
    }
}

struct LocalSink {
    session: Mutex<Option<ClientSession>>,
}

#[async_trait]
impl SignalingSink for LocalSink {
    async fn send(&self, msg: SignalingMessage) -> Result<(), TransportError> {
        let mut session = self.session.lock().await;
        match session.as_mut() {
            Some(session) => {
                session.handle_text(&msg.to_json()).await;
                Ok(())
            }
            None => Err(TransportError::Disconnected),
        }
    }

    async fn close(&self) {
        let session = self.session.lock().await.take();
        if let Some(session) = session {
            session.close().await;
        }
    }
}
