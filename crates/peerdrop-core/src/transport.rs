//! Transport abstraction
//!
//! Defines the seams between session logic and the outside world: the relay
//! socket used for signaling, and the direct link with its data channel.
//! Real (WebSocket + WebRTC) and in-memory implementations both plug in here.

use async_trait::async_trait;
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

use crate::protocol::Frame;
use crate::types::SignalingMessage;

/// Errors from transport operations
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum TransportError {
    #[error("Connection failed: {0}")]
    ConnectionFailed(String),
    #[error("Send failed: {0}")]
    SendFailed(String),
    #[error("Receive failed: {0}")]
    ReceiveFailed(String),
    #[error("Timeout")]
    Timeout,
    #[error("Disconnected")]
    Disconnected,
    #[error("Not connected")]
    NotConnected,
}

/// Outbound half of a relay connection
#[async_trait]
pub trait SignalingSink: Send + Sync {
    /// Send a message to the relay
    async fn send(&self, msg: SignalingMessage) -> Result<(), TransportError>;

    /// Close the relay socket. Idempotent.
    async fn close(&self);
}

/// A live relay connection
///
/// `incoming` yields `None` once the relay socket is gone.
pub struct SignalingLink {
    pub sink: Arc<dyn SignalingSink>,
    pub incoming: mpsc::UnboundedReceiver<SignalingMessage>,
}

/// Opens relay connections
#[async_trait]
pub trait SignalingConnector: Send + Sync {
    async fn connect(&self) -> Result<SignalingLink, TransportError>;
}

/// Data channel for peer-to-peer frames
///
/// Inbound frames are not read from the channel; they arrive as
/// [`LinkEvent::Frame`] on the owning link's event stream.
#[async_trait]
pub trait DataChannel: Send + Sync {
    /// Send one frame to the peer
    async fn send(&self, frame: Frame) -> Result<(), TransportError>;

    /// Check if the channel is open
    fn is_open(&self) -> bool;

    /// Close the channel
    async fn close(&self);

    fn label(&self) -> &str;
}

/// Connectivity of the underlying direct transport
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LinkState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl LinkState {
    /// States that mean the direct path is gone
    pub fn is_lost(&self) -> bool {
        matches!(
            self,
            LinkState::Disconnected | LinkState::Failed | LinkState::Closed
        )
    }
}

/// Everything a direct link reports back to its owner
pub enum LinkEvent {
    /// A local ICE candidate to hand to the remote side via the relay
    LocalCandidate(serde_json::Value),
    StateChanged(LinkState),
    /// The data channel is open and usable
    ChannelOpen(Arc<dyn DataChannel>),
    Frame(Frame),
    ChannelClosed,
    ChannelError(String),
}

impl std::fmt::Debug for LinkEvent {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            LinkEvent::LocalCandidate(c) => f.debug_tuple("LocalCandidate").field(c).finish(),
            LinkEvent::StateChanged(s) => f.debug_tuple("StateChanged").field(s).finish(),
            LinkEvent::ChannelOpen(ch) => f.debug_tuple("ChannelOpen").field(&ch.label()).finish(),
            LinkEvent::Frame(frame) => f.debug_tuple("Frame").field(&frame.len()).finish(),
            LinkEvent::ChannelClosed => f.write_str("ChannelClosed"),
            LinkEvent::ChannelError(e) => f.debug_tuple("ChannelError").field(e).finish(),
        }
    }
}

/// One direct connection to one remote peer
///
/// Session descriptions and candidates are opaque JSON values produced and
/// consumed only by the link implementation.
#[async_trait]
pub trait PeerLink: Send + Sync {
    /// Create and apply a local offer (initiator side)
    async fn create_offer(&self) -> Result<serde_json::Value, TransportError>;

    /// Apply a remote offer and return the local answer (answering side)
    async fn accept_offer(
        &self,
        offer: serde_json::Value,
    ) -> Result<serde_json::Value, TransportError>;

    /// Apply the remote answer (initiator side)
    async fn accept_answer(&self, answer: serde_json::Value) -> Result<(), TransportError>;

    /// Apply a remote ICE candidate; queued until the remote description is set
    async fn add_ice_candidate(&self, candidate: serde_json::Value)
        -> Result<(), TransportError>;

    /// Tear down the connection. Idempotent.
    async fn close(&self);
}

/// A freshly created link plus its event stream
pub struct LinkHandles {
    pub link: Arc<dyn PeerLink>,
    /// Local half of the data channel, present for the initiator
    pub channel: Option<Arc<dyn DataChannel>>,
    pub events: mpsc::UnboundedReceiver<LinkEvent>,
}

/// Factory for direct links
#[async_trait]
pub trait PeerLinkFactory: Send + Sync {
    /// Create a link. The initiator opens its data channel immediately.
    async fn create_link(&self, initiator: bool) -> Result<LinkHandles, TransportError>;
}

// Blanket implementations for Arc<T> so wrapped transports can be passed as trait objects

#[async_trait]
impl<T: SignalingConnector + ?Sized> SignalingConnector for Arc<T> {
    async fn connect(&self) -> Result<SignalingLink, TransportError> {
        (**self).connect().await
    }
}

#[async_trait]
impl<T: PeerLinkFactory + ?Sized> PeerLinkFactory for Arc<T> {
    async fn create_link(&self, initiator: bool) -> Result<LinkHandles, TransportError> {
        (**self).create_link(initiator).await
    }
}
