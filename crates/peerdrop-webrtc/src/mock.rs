//! Mock implementations for testing and simulation
//!
//! Provides an in-memory direct-link network: offers carry a token that the
//! answering side claims from the shared [`MockNetwork`], and frames sent on
//! one data channel arrive as [`LinkEvent::Frame`] on the other link's event
//! stream. Send failures and abrupt connectivity loss can be injected.

use async_trait::async_trait;
use serde_json::json;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU32, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::debug;

use peerdrop_core::{
    generate_id, DataChannel, Frame, LinkEvent, LinkHandles, LinkState, PeerLink,
    PeerLinkFactory, TransportError, DATA_CHANNEL_LABEL,
};

type EventTx = mpsc::UnboundedSender<LinkEvent>;

fn lock<T>(mutex: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(|e| e.into_inner())
}

// ============================================================================
// Mock Data Channel
// ============================================================================

/// Mock data channel delivering frames to the remote link's event stream
pub struct MockDataChannel {
    label: String,
    open: AtomicBool,
    closed: AtomicBool,
    remote: Mutex<Option<EventTx>>,
    fail_sends: AtomicU32,
    sent: AtomicUsize,
}

/// One end of a directly paired channel, with the frames sent to it
pub struct MockEndpoint {
    pub channel: Arc<MockDataChannel>,
    pub events: mpsc::UnboundedReceiver<LinkEvent>,
}

impl MockEndpoint {
    /// Next frame addressed to this end, skipping other events
    ///
    /// Returns `None` once the remote has closed.
    pub async fn next_frame(&mut self) -> Option<Frame> {
        while let Some(event) = self.events.recv().await {
            match event {
                LinkEvent::Frame(frame) => return Some(frame),
                LinkEvent::ChannelClosed => return None,
                _ => {}
            }
        }
        None
    }

    /// Frames already delivered, without waiting
    pub fn drain_frames(&mut self) -> Vec<Frame> {
        let mut frames = Vec::new();
        while let Ok(event) = self.events.try_recv() {
            if let LinkEvent::Frame(frame) = event {
                frames.push(frame);
            }
        }
        frames
    }
}

impl MockDataChannel {
    fn unpaired() -> Self {
        Self {
            label: DATA_CHANNEL_LABEL.to_string(),
            open: AtomicBool::new(false),
            closed: AtomicBool::new(false),
            remote: Mutex::new(None),
            fail_sends: AtomicU32::new(0),
            sent: AtomicUsize::new(0),
        }
    }

    /// Create a connected, open pair of mock channels
    pub fn pair() -> (MockEndpoint, MockEndpoint) {
        let (tx_a, rx_a) = mpsc::unbounded_channel();
        let (tx_b, rx_b) = mpsc::unbounded_channel();

        let chan_a = Arc::new(Self::unpaired());
        let chan_b = Arc::new(Self::unpaired());
        chan_a.attach(tx_b); // A sends to B's events
        chan_b.attach(tx_a);
        chan_a.open.store(true, Ordering::SeqCst);
        chan_b.open.store(true, Ordering::SeqCst);

        (
            MockEndpoint {
                channel: chan_a,
                events: rx_a,
            },
            MockEndpoint {
                channel: chan_b,
                events: rx_b,
            },
        )
    }

    fn attach(&self, remote: EventTx) {
        *lock(&self.remote) = Some(remote);
    }

    fn mark_open(&self) {
        if !self.closed.load(Ordering::SeqCst) {
            self.open.store(true, Ordering::SeqCst);
        }
    }

    /// Make the next `n` sends fail
    pub fn fail_next_sends(&self, n: u32) {
        self.fail_sends.store(n, Ordering::SeqCst);
    }

    /// Frames successfully handed to the remote side
    pub fn sent_frames(&self) -> usize {
        self.sent.load(Ordering::SeqCst)
    }

    /// Lose the channel without telling the remote
    fn sever(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.open.store(false, Ordering::SeqCst);
        lock(&self.remote).take();
    }
}

#[async_trait]
impl DataChannel for MockDataChannel {
    async fn send(&self, frame: Frame) -> Result<(), TransportError> {
        if !self.open.load(Ordering::SeqCst) {
            return Err(TransportError::NotConnected);
        }

        let injected = self
            .fail_sends
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok();
        if injected {
            return Err(TransportError::SendFailed("injected failure".to_string()));
        }

        let remote = lock(&self.remote).clone();
        match remote {
            Some(tx) => {
                tx.send(LinkEvent::Frame(frame))
                    .map_err(|_| TransportError::Disconnected)?;
                self.sent.fetch_add(1, Ordering::SeqCst);
                Ok(())
            }
            None => Err(TransportError::Disconnected),
        }
    }

    fn is_open(&self) -> bool {
        self.open.load(Ordering::SeqCst)
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.open.store(false, Ordering::SeqCst);
        if let Some(remote) = lock(&self.remote).take() {
            let _ = remote.send(LinkEvent::ChannelClosed);
        }
    }

    fn label(&self) -> &str {
        &self.label
    }
}

// ============================================================================
// Mock Peer Link
// ============================================================================

/// The parts of a link its counterpart needs to reach it
#[derive(Clone)]
struct LinkHalf {
    events: EventTx,
    channel: Arc<MockDataChannel>,
}

/// In-memory direct link
pub struct MockPeerLink {
    network: Arc<NetworkState>,
    initiator: bool,
    own: LinkHalf,
    token: Mutex<Option<String>>,
    peer: Mutex<Option<LinkHalf>>,
    remote_candidates: AtomicUsize,
    closed: AtomicBool,
}

impl MockPeerLink {
    pub fn is_initiator(&self) -> bool {
        self.initiator
    }

    pub fn channel(&self) -> Arc<MockDataChannel> {
        self.own.channel.clone()
    }

    /// Remote ICE candidates applied so far
    pub fn remote_candidates(&self) -> usize {
        self.remote_candidates.load(Ordering::SeqCst)
    }

    /// Simulate this side vanishing: the remote only sees connectivity loss
    pub fn sever(&self) {
        self.closed.store(true, Ordering::SeqCst);
        self.own.channel.sever();
        if let Some(peer) = lock(&self.peer).take() {
            let _ = peer
                .events
                .send(LinkEvent::StateChanged(LinkState::Disconnected));
        }
    }

    fn emit(&self, event: LinkEvent) {
        let _ = self.own.events.send(event);
    }

    fn local_candidate(&self) -> serde_json::Value {
        json!({
            "candidate": format!("candidate:mock {}", if self.initiator { "offerer" } else { "answerer" }),
            "sdpMid": "0",
            "sdpMLineIndex": 0,
        })
    }
}

fn parse_token(description: &serde_json::Value, kind: &str) -> Result<String, TransportError> {
    if description.get("type").and_then(|t| t.as_str()) != Some(kind) {
        return Err(TransportError::ConnectionFailed(format!(
            "Expected {} description",
            kind
        )));
    }
    description
        .get("sdp")
        .and_then(|s| s.as_str())
        .and_then(|s| s.strip_prefix("mock:"))
        .map(str::to_string)
        .ok_or_else(|| TransportError::ConnectionFailed("Not a mock description".to_string()))
}

#[async_trait]
impl PeerLink for MockPeerLink {
    async fn create_offer(&self) -> Result<serde_json::Value, TransportError> {
        if !self.initiator {
            return Err(TransportError::ConnectionFailed(
                "Only the initiator creates offers".to_string(),
            ));
        }
        let token = generate_id(16);
        *lock(&self.token) = Some(token.clone());
        lock(&self.network.offers).insert(token.clone(), self.own.clone());
        self.emit(LinkEvent::LocalCandidate(self.local_candidate()));
        Ok(json!({"type": "offer", "sdp": format!("mock:{}", token)}))
    }

    async fn accept_offer(
        &self,
        offer: serde_json::Value,
    ) -> Result<serde_json::Value, TransportError> {
        let token = parse_token(&offer, "offer")?;
        let offerer = lock(&self.network.offers)
            .remove(&token)
            .ok_or_else(|| TransportError::ConnectionFailed("Offer not found".to_string()))?;

        // Wire both channels to each other's event streams
        self.own.channel.attach(offerer.events.clone());
        offerer.channel.attach(self.own.events.clone());
        lock(&self.network.answers).insert(token.clone(), self.own.clone());
        *lock(&self.peer) = Some(offerer);
        *lock(&self.token) = Some(token.clone());

        self.emit(LinkEvent::StateChanged(LinkState::Connecting));
        self.emit(LinkEvent::LocalCandidate(self.local_candidate()));
        Ok(json!({"type": "answer", "sdp": format!("mock:{}", token)}))
    }

    async fn accept_answer(&self, answer: serde_json::Value) -> Result<(), TransportError> {
        let token = parse_token(&answer, "answer")?;
        if lock(&self.token).as_deref() != Some(token.as_str()) {
            return Err(TransportError::ConnectionFailed(
                "Answer does not match offer".to_string(),
            ));
        }
        let answerer = lock(&self.network.answers)
            .remove(&token)
            .ok_or_else(|| TransportError::ConnectionFailed("Answer not found".to_string()))?;
        *lock(&self.peer) = Some(answerer.clone());

        self.own.channel.mark_open();
        answerer.channel.mark_open();
        debug!("Mock link {} connected", token);

        for half in [&self.own, &answerer] {
            let _ = half.events.send(LinkEvent::StateChanged(LinkState::Connected));
            let channel: Arc<dyn DataChannel> = half.channel.clone();
            let _ = half.events.send(LinkEvent::ChannelOpen(channel));
        }
        Ok(())
    }

    async fn add_ice_candidate(
        &self,
        candidate: serde_json::Value,
    ) -> Result<(), TransportError> {
        if candidate.get("candidate").is_none() {
            return Err(TransportError::ConnectionFailed(
                "Malformed candidate".to_string(),
            ));
        }
        self.remote_candidates.fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        self.own.channel.close().await;
        lock(&self.peer).take();
        if let Some(token) = lock(&self.token).take() {
            lock(&self.network.offers).remove(&token);
            lock(&self.network.answers).remove(&token);
        }
    }
}

// ============================================================================
// Mock Network
// ============================================================================

#[derive(Default)]
struct NetworkState {
    /// Offers waiting for an answerer, keyed by token
    offers: Mutex<HashMap<String, LinkHalf>>,
    /// Answerers waiting for the offerer to apply the answer
    answers: Mutex<HashMap<String, LinkHalf>>,
    links: Mutex<Vec<Arc<MockPeerLink>>>,
}

/// Link factory whose links can only reach links from the same network
#[derive(Clone, Default)]
pub struct MockNetwork {
    state: Arc<NetworkState>,
}

impl MockNetwork {
    pub fn new() -> Self {
        Self::default()
    }

    /// Most recently created link with the given role
    pub fn link(&self, initiator: bool) -> Option<Arc<MockPeerLink>> {
        lock(&self.state.links)
            .iter()
            .rev()
            .find(|l| l.initiator == initiator)
            .cloned()
    }

    pub fn link_count(&self) -> usize {
        lock(&self.state.links).len()
    }
}

#[async_trait]
impl PeerLinkFactory for MockNetwork {
    async fn create_link(&self, initiator: bool) -> Result<LinkHandles, TransportError> {
        let (tx, rx) = mpsc::unbounded_channel();
        let channel = Arc::new(MockDataChannel::unpaired());
        let link = Arc::new(MockPeerLink {
            network: self.state.clone(),
            initiator,
            own: LinkHalf {
                events: tx,
                channel: channel.clone(),
            },
            token: Mutex::new(None),
            peer: Mutex::new(None),
            remote_candidates: AtomicUsize::new(0),
            closed: AtomicBool::new(false),
        });
        lock(&self.state.links).push(link.clone());

        let local_channel: Option<Arc<dyn DataChannel>> = if initiator {
            Some(channel)
        } else {
            None
        };
        Ok(LinkHandles {
            link,
            channel: local_channel,
            events: rx,
        })
    }
}
