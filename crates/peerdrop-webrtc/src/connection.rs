//! Connection manager
//!
//! Runs one session at a time: join the relay under a room id, swap
//! offer/answer/candidates with the other role, then own the direct data
//! channel until something ends it.
//!
//! ```text
//!                 wait_for_connection()            peer-joined
//! Disconnected ───────────────────────> WaitingForPeer ──────> Connecting
//!      │          connect(room)                                   │
//!      └────────────────────────────────────────────> Connecting  │
//!                                                        │ channel open
//!                                                        v        v
//!                                                       Connected
//! ```
//!
//! Every way a session can end (transport loss, channel close or error,
//! `peer-disconnected`, relay error, timeout, local `disconnect()`) goes
//! through [`ConnectionManager::handle_disconnection`], which tears the
//! session down exactly once.

use async_trait::async_trait;
use bytes::Bytes;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, watch, Mutex};
use tokio::time::Instant;
use tracing::{debug, info, warn};

use peerdrop_core::{
    generate_id, ControlMessage, DataChannel, Frame, LinkEvent, LinkHandles, PeerLink,
    PeerLinkFactory, Role, SignalingConnector, SignalingMessage, SignalingSink, TransportError,
    LOCAL_ID_LEN, ROOM_ID_LEN,
};

use crate::backoff::Backoff;
use crate::types::{ConnectionConfig, ConnectionStatus, DisconnectReason};

#[derive(Debug, Error)]
pub enum ConnectionError {
    #[error("Transport error: {0}")]
    Transport(#[from] TransportError),
    #[error("Relay error: {0}")]
    Signaling(String),
    #[error("Relay unavailable after {attempts} reconnect attempts")]
    RelayUnavailable { attempts: u32 },
    #[error("Connection timed out")]
    Timeout,
    #[error("No room id in {0:?}")]
    InvalidRoom(String),
}

/// Receives everything the direct channel delivers
///
/// Called from the session task in arrival order.
#[async_trait]
pub trait ConnectionHandler: Send + Sync {
    async fn on_data_channel_open(&self, _channel: Arc<dyn DataChannel>) {}
    async fn on_message(&self, _msg: ControlMessage) {}
    async fn on_file_chunk(&self, _chunk: Bytes) {}
    async fn on_connection_change(&self, _connected: bool) {}
    /// The session ended, whatever the cause
    async fn on_peer_disconnected(&self) {}
}

/// Handler that ignores everything
pub struct NoopHandler;

#[async_trait]
impl ConnectionHandler for NoopHandler {}

struct Session {
    generation: u64,
    role: Role,
    room_id: String,
    link: Arc<dyn PeerLink>,
    channel: Option<Arc<dyn DataChannel>>,
    channel_open: bool,
    /// Latest relay connection; replaced on reconnect
    signaling: Arc<dyn SignalingSink>,
    shutdown: watch::Sender<bool>,
}

#[derive(Default)]
struct Inner {
    session: Option<Session>,
    generation: u64,
    last_reason: Option<DisconnectReason>,
}

struct Shared {
    connector: Arc<dyn SignalingConnector>,
    factory: Arc<dyn PeerLinkFactory>,
    config: ConnectionConfig,
    handler: Arc<dyn ConnectionHandler>,
    local_id: String,
    inner: Mutex<Inner>,
    status_tx: watch::Sender<ConnectionStatus>,
}

/// Owns the relay connection and the direct link for one peer
#[derive(Clone)]
pub struct ConnectionManager {
    shared: Arc<Shared>,
}

impl ConnectionManager {
    pub fn new(
        connector: Arc<dyn SignalingConnector>,
        factory: Arc<dyn PeerLinkFactory>,
        config: ConnectionConfig,
        handler: Arc<dyn ConnectionHandler>,
    ) -> Self {
        let (status_tx, _) = watch::channel(ConnectionStatus::Disconnected);
        Self {
            shared: Arc::new(Shared {
                connector,
                factory,
                config,
                handler,
                local_id: generate_id(LOCAL_ID_LEN),
                inner: Mutex::new(Inner::default()),
                status_tx,
            }),
        }
    }

    /// Sender path: join a fresh room and wait for a receiver
    ///
    /// Returns the room id to hand to the receiver.
    pub async fn wait_for_connection(&self) -> Result<String, ConnectionError> {
        self.start(Role::Sender, generate_id(ROOM_ID_LEN)).await
    }

    /// Receiver path: join an existing room and answer its sender
    pub async fn connect(&self, room_id: &str) -> Result<String, ConnectionError> {
        self.start(Role::Receiver, room_id.to_string()).await
    }

    async fn start(&self, role: Role, room_id: String) -> Result<String, ConnectionError> {
        let mut inner = self.shared.inner.lock().await;
        if let Some(session) = &inner.session {
            info!(
                "Already {} in room {} as {}, ignoring {} request",
                self.status(),
                session.room_id,
                session.role,
                role
            );
            return Ok(session.room_id.clone());
        }
        inner.generation += 1;
        let generation = inner.generation;

        let LinkHandles {
            link,
            channel,
            events,
        } = self.shared.factory.create_link(role == Role::Sender).await?;

        let relay = match self.shared.connector.connect().await {
            Ok(relay) => relay,
            Err(e) => {
                link.close().await;
                return Err(e.into());
            }
        };
        if let Err(e) = relay.sink.send(SignalingMessage::join(&room_id, role)).await {
            link.close().await;
            relay.sink.close().await;
            return Err(e.into());
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        inner.session = Some(Session {
            generation,
            role,
            room_id: room_id.clone(),
            link: link.clone(),
            channel,
            channel_open: false,
            signaling: relay.sink.clone(),
            shutdown: shutdown_tx,
        });
        inner.last_reason = None;
        self.set_status(match role {
            Role::Sender => ConnectionStatus::WaitingForPeer,
            Role::Receiver => ConnectionStatus::Connecting,
        });
        drop(inner);
        info!("Joined room {} as {}", room_id, role);

        // The receiver is negotiating from the start; the sender only once a
        // receiver shows up.
        let deadline = match role {
            Role::Sender => None,
            Role::Receiver => Some(Instant::now() + self.shared.config.connect_timeout),
        };
        let driver = SessionDriver {
            manager: self.clone(),
            generation,
            role,
            room_id: room_id.clone(),
            link,
            events,
            sink: Some(relay.sink),
            incoming: Some(relay.incoming),
            pending_signals: Vec::new(),
            shutdown: shutdown_rx,
            backoff: Backoff::from(&self.shared.config.reconnect),
            reconnect_at: None,
            deadline,
            offered: false,
            channel_open: false,
        };
        tokio::spawn(driver.run());

        Ok(room_id)
    }

    /// Tear down the active session
    ///
    /// Closes the channel, the link and the relay socket once, flips the
    /// status to `Disconnected` and notifies the handler. With a
    /// `generation`, only that session is affected; calls for a session
    /// that already ended do nothing.
    pub async fn handle_disconnection(&self, generation: Option<u64>, reason: DisconnectReason) {
        let session = {
            let mut inner = self.shared.inner.lock().await;
            let current = match &inner.session {
                Some(session) => generation.map_or(true, |g| g == session.generation),
                None => false,
            };
            if !current {
                return;
            }
            inner.last_reason = Some(reason.clone());
            self.set_status(ConnectionStatus::Disconnected);
            inner.session.take()
        };
        let Some(session) = session else {
            return;
        };

        let _ = session.shutdown.send(true);
        if let Some(channel) = &session.channel {
            channel.close().await;
        }
        session.link.close().await;
        session.signaling.close().await;
        info!("Disconnected from room {}: {}", session.room_id, reason);

        self.shared.handler.on_connection_change(false).await;
        self.shared.handler.on_peer_disconnected().await;
    }

    /// User-initiated disconnect
    pub async fn disconnect(&self) {
        self.handle_disconnection(None, DisconnectReason::LocalClose)
            .await;
    }

    /// Dispose: tell the remote we are leaving, then disconnect
    ///
    /// Call on every exit path; the remote may otherwise only notice once
    /// the transport times out.
    pub async fn close(&self) {
        let target = {
            let inner = self.shared.inner.lock().await;
            inner.session.as_ref().and_then(|s| match (&s.channel, s.channel_open) {
                (Some(channel), true) => Some((channel.clone(), s.role)),
                _ => None,
            })
        };
        if let Some((channel, role)) = target {
            let notice = ControlMessage::PeerDisconnected {
                peer_id: role.to_string(),
            };
            if let Err(e) = channel.send(notice.into()).await {
                debug!("Could not send peer-disconnected: {}", e);
            }
        }
        self.disconnect().await;
    }

    /// Wait until the session is connected or has ended
    ///
    /// Call after `wait_for_connection` or `connect`; with no session this
    /// returns the error for the last disconnection.
    pub async fn wait_connected(&self) -> Result<(), ConnectionError> {
        let mut rx = self.subscribe_status();
        loop {
            let status = *rx.borrow_and_update();
            match status {
                ConnectionStatus::Connected => return Ok(()),
                ConnectionStatus::Disconnected => return Err(self.disconnect_error().await),
                _ => {}
            }
            if rx.changed().await.is_err() {
                return Err(TransportError::Disconnected.into());
            }
        }
    }

    async fn disconnect_error(&self) -> ConnectionError {
        match self.last_disconnect_reason().await {
            Some(DisconnectReason::Timeout) => ConnectionError::Timeout,
            Some(DisconnectReason::RelayUnavailable) => ConnectionError::RelayUnavailable {
                attempts: self.shared.config.reconnect.max_attempts,
            },
            Some(DisconnectReason::SignalingError(message)) => ConnectionError::Signaling(message),
            Some(DisconnectReason::PeerLeft) => {
                ConnectionError::Signaling(DisconnectReason::PeerLeft.to_string())
            }
            _ => TransportError::Disconnected.into(),
        }
    }

    pub fn status(&self) -> ConnectionStatus {
        *self.shared.status_tx.borrow()
    }

    pub fn subscribe_status(&self) -> watch::Receiver<ConnectionStatus> {
        self.shared.status_tx.subscribe()
    }

    /// Data channel of the active session
    ///
    /// The sender's channel exists before it opens; check `is_open()`.
    pub async fn channel(&self) -> Option<Arc<dyn DataChannel>> {
        let inner = self.shared.inner.lock().await;
        inner.session.as_ref().and_then(|s| s.channel.clone())
    }

    pub async fn room_id(&self) -> Option<String> {
        let inner = self.shared.inner.lock().await;
        inner.session.as_ref().map(|s| s.room_id.clone())
    }

    pub async fn role(&self) -> Option<Role> {
        let inner = self.shared.inner.lock().await;
        inner.session.as_ref().map(|s| s.role)
    }

    pub fn local_id(&self) -> &str {
        &self.shared.local_id
    }

    pub async fn last_disconnect_reason(&self) -> Option<DisconnectReason> {
        self.shared.inner.lock().await.last_reason.clone()
    }

    fn set_status(&self, status: ConnectionStatus) {
        self.shared.status_tx.send_if_modified(|current| {
            if *current == status {
                return false;
            }
            info!("Connection status: {} -> {}", current, status);
            *current = status;
            true
        });
    }

    /// Run `f` on the session if it is still the given generation
    async fn with_session<R>(
        &self,
        generation: u64,
        f: impl FnOnce(&mut Session) -> R,
    ) -> Option<R> {
        let mut inner = self.shared.inner.lock().await;
        inner
            .session
            .as_mut()
            .filter(|s| s.generation == generation)
            .map(f)
    }
}

// ============================================================================
// Session task
// ============================================================================

enum Step {
    Continue,
    /// Session is over; `None` when it was already torn down elsewhere
    Stop(Option<DisconnectReason>),
}

/// Owns the event streams of one session
struct SessionDriver {
    manager: ConnectionManager,
    generation: u64,
    role: Role,
    room_id: String,
    link: Arc<dyn PeerLink>,
    events: mpsc::UnboundedReceiver<LinkEvent>,
    sink: Option<Arc<dyn SignalingSink>>,
    incoming: Option<mpsc::UnboundedReceiver<SignalingMessage>>,
    /// Signals produced while the relay was away
    pending_signals: Vec<SignalingMessage>,
    shutdown: watch::Receiver<bool>,
    backoff: Backoff,
    reconnect_at: Option<Instant>,
    deadline: Option<Instant>,
    offered: bool,
    channel_open: bool,
}

async fn recv_signal(
    incoming: &mut Option<mpsc::UnboundedReceiver<SignalingMessage>>,
) -> Option<SignalingMessage> {
    match incoming {
        Some(rx) => rx.recv().await,
        None => std::future::pending().await,
    }
}

async fn sleep_until(at: Option<Instant>) {
    match at {
        Some(at) => tokio::time::sleep_until(at).await,
        None => std::future::pending().await,
    }
}

impl SessionDriver {
    async fn run(mut self) {
        loop {
            let step = tokio::select! {
                _ = self.shutdown.changed() => Step::Stop(None),
                msg = recv_signal(&mut self.incoming) => match msg {
                    Some(msg) => self.on_signal(msg).await,
                    None => self.on_relay_lost(),
                },
                event = self.events.recv() => match event {
                    Some(event) => self.on_link_event(event).await,
                    None => Step::Stop(Some(DisconnectReason::TransportLost)),
                },
                _ = sleep_until(self.deadline) => {
                    warn!("Room {}: direct channel did not open in time", self.room_id);
                    Step::Stop(Some(DisconnectReason::Timeout))
                }
                _ = sleep_until(self.reconnect_at) => self.reconnect().await,
            };

            match step {
                Step::Continue => {}
                Step::Stop(None) => return,
                Step::Stop(Some(reason)) => {
                    self.manager
                        .handle_disconnection(Some(self.generation), reason)
                        .await;
                    return;
                }
            }
        }
    }

    async fn on_signal(&mut self, msg: SignalingMessage) -> Step {
        match msg {
            SignalingMessage::PeerJoined { peer_role } => {
                debug!("Room {}: {} joined", self.room_id, peer_role);
                if self.role == Role::Sender && !self.offered {
                    return self.send_offer().await;
                }
            }
            SignalingMessage::Offer { offer, .. } => {
                if self.role != Role::Receiver {
                    warn!("Room {}: sender received an offer, ignoring", self.room_id);
                    return Step::Continue;
                }
                match self.link.accept_offer(offer).await {
                    Ok(answer) => {
                        let msg = SignalingMessage::answer(answer, &self.room_id);
                        self.send_signal(msg).await;
                    }
                    Err(e) => {
                        warn!("Room {}: could not answer offer: {}", self.room_id, e);
                        return Step::Stop(Some(DisconnectReason::TransportLost));
                    }
                }
            }
            SignalingMessage::Answer { answer, .. } => {
                if let Err(e) = self.link.accept_answer(answer).await {
                    warn!("Room {}: could not apply answer: {}", self.room_id, e);
                    return Step::Stop(Some(DisconnectReason::TransportLost));
                }
            }
            SignalingMessage::IceCandidate { candidate, .. } => {
                if let Err(e) = self.link.add_ice_candidate(candidate).await {
                    warn!("Room {}: bad remote candidate: {}", self.room_id, e);
                }
            }
            SignalingMessage::PeerLeft { peer_role } => {
                if self.channel_open {
                    info!("Room {}: {} left the relay", self.room_id, peer_role);
                } else {
                    info!("Room {}: {} left before connecting", self.room_id, peer_role);
                    return Step::Stop(Some(DisconnectReason::PeerLeft));
                }
            }
            SignalingMessage::Error { message } => {
                warn!("Room {}: relay error: {}", self.room_id, message);
                return Step::Stop(Some(DisconnectReason::SignalingError(message)));
            }
            SignalingMessage::JoinRoom { .. } => {
                debug!("Ignoring join-room from relay");
            }
        }
        Step::Continue
    }

    async fn send_offer(&mut self) -> Step {
        self.offered = true;
        let offer = match self.link.create_offer().await {
            Ok(offer) => offer,
            Err(e) => {
                warn!("Room {}: could not create offer: {}", self.room_id, e);
                return Step::Stop(Some(DisconnectReason::TransportLost));
            }
        };
        self.send_signal(SignalingMessage::offer(offer, &self.room_id))
            .await;
        let live = self
            .manager
            .with_session(self.generation, |_| {
                self.manager.set_status(ConnectionStatus::Connecting)
            })
            .await;
        if live.is_none() {
            return Step::Stop(None);
        }
        self.deadline = Some(Instant::now() + self.manager.shared.config.connect_timeout);
        Step::Continue
    }

    async fn send_signal(&mut self, msg: SignalingMessage) {
        let Some(sink) = &self.sink else {
            self.pending_signals.push(msg);
            return;
        };
        if let Err(e) = sink.send(msg.clone()).await {
            debug!("Relay send failed ({}), holding {}", e, msg.msg_type());
            self.pending_signals.push(msg);
        }
    }

    fn on_relay_lost(&mut self) -> Step {
        self.incoming = None;
        self.sink = None;
        if self.channel_open {
            info!("Room {}: relay connection lost, direct channel unaffected", self.room_id);
            return Step::Continue;
        }
        self.schedule_reconnect()
    }

    fn schedule_reconnect(&mut self) -> Step {
        match self.backoff.next_delay() {
            Some(delay) => {
                warn!(
                    "Room {}: relay connection lost, reconnecting in {:?} (attempt {}/{})",
                    self.room_id,
                    delay,
                    self.backoff.attempt(),
                    self.manager.shared.config.reconnect.max_attempts
                );
                self.reconnect_at = Some(Instant::now() + delay);
                Step::Continue
            }
            None => {
                warn!("Room {}: giving up on the relay", self.room_id);
                Step::Stop(Some(DisconnectReason::RelayUnavailable))
            }
        }
    }

    async fn reconnect(&mut self) -> Step {
        self.reconnect_at = None;
        let relay = match self.manager.shared.connector.connect().await {
            Ok(relay) => relay,
            Err(e) => {
                warn!("Room {}: relay reconnect failed: {}", self.room_id, e);
                return self.schedule_reconnect();
            }
        };
        let join = SignalingMessage::join(&self.room_id, self.role);
        if let Err(e) = relay.sink.send(join).await {
            warn!("Room {}: rejoin failed: {}", self.room_id, e);
            relay.sink.close().await;
            return self.schedule_reconnect();
        }

        let sink = relay.sink.clone();
        let live = self
            .manager
            .with_session(self.generation, move |s| s.signaling = sink)
            .await;
        if live.is_none() {
            relay.sink.close().await;
            return Step::Stop(None);
        }
        info!(
            "Room {}: rejoined as {} after {} attempt(s)",
            self.room_id,
            self.role,
            self.backoff.attempt()
        );
        self.backoff.reset();
        self.sink = Some(relay.sink);
        self.incoming = Some(relay.incoming);

        for msg in std::mem::take(&mut self.pending_signals) {
            self.send_signal(msg).await;
        }
        Step::Continue
    }

    async fn on_link_event(&mut self, event: LinkEvent) -> Step {
        match event {
            LinkEvent::LocalCandidate(candidate) => {
                let msg = SignalingMessage::candidate(candidate, &self.room_id);
                self.send_signal(msg).await;
            }
            LinkEvent::StateChanged(state) => {
                debug!("Room {}: link state {:?}", self.room_id, state);
                if state.is_lost() {
                    return Step::Stop(Some(DisconnectReason::TransportLost));
                }
            }
            LinkEvent::ChannelOpen(channel) => return self.on_channel_open(channel).await,
            LinkEvent::Frame(Frame::Text(text)) => match ControlMessage::parse(&text) {
                Ok(ControlMessage::PeerDisconnected { peer_id }) => {
                    info!("Room {}: remote {} disconnected", self.room_id, peer_id);
                    return Step::Stop(Some(DisconnectReason::PeerDisconnected));
                }
                Ok(msg) => self.manager.shared.handler.on_message(msg).await,
                Err(e) => warn!("Room {}: dropping malformed control frame: {}", self.room_id, e),
            },
            LinkEvent::Frame(Frame::Binary(chunk)) => {
                self.manager.shared.handler.on_file_chunk(chunk).await;
            }
            LinkEvent::ChannelClosed => {
                return Step::Stop(Some(DisconnectReason::ChannelClosed));
            }
            LinkEvent::ChannelError(e) => {
                return Step::Stop(Some(DisconnectReason::ChannelError(e)));
            }
        }
        Step::Continue
    }

    async fn on_channel_open(&mut self, channel: Arc<dyn DataChannel>) -> Step {
        let stored = channel.clone();
        let live = self
            .manager
            .with_session(self.generation, |s| {
                s.channel = Some(stored);
                s.channel_open = true;
                self.manager.set_status(ConnectionStatus::Connected);
            })
            .await;
        if live.is_none() {
            return Step::Stop(None);
        }
        self.channel_open = true;
        self.deadline = None;
        if self.reconnect_at.take().is_some() {
            debug!("Room {}: channel open, dropping relay reconnect", self.room_id);
        }
        info!("Room {}: data channel '{}' open", self.room_id, channel.label());

        let handler = self.manager.shared.handler.clone();
        handler.on_connection_change(true).await;
        handler.on_data_channel_open(channel).await;
        Step::Continue
    }
}
