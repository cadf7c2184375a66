//! Peer side of peerdrop
//!
//! Establishes a direct data channel to one remote peer through the relay
//! and moves files over it in 16 KiB chunks.
//!
//! # Overview
//!
//! - **Connection manager**: relay handshake, liveness, relay reconnect
//!   with backoff, single disconnection routine
//! - **Transfer engine**: catalogue, file requests, chunked streaming with
//!   retry, reassembly
//! - **Facade**: [`PeerDrop`] wires the two together
//! - **Transports**: WebSocket relay client and webrtc data channels, plus
//!   an in-memory [`mock::MockNetwork`] for tests
//!
//! # Example
//!
//! ```rust,no_run
//! use peerdrop_webrtc::{NoopEvents, PeerDrop, PeerDropConfig, RtcLinkFactory, ShareFile, WsSignalingConnector};
//! use std::sync::Arc;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let peer = PeerDrop::new(
//!         Arc::new(WsSignalingConnector::new("ws://127.0.0.1:8787/ws")),
//!         Arc::new(RtcLinkFactory::new(vec!["stun:stun.l.google.com:19302".into()])),
//!         PeerDropConfig::default(),
//!         Arc::new(NoopEvents),
//!     );
//!
//!     peer.share(vec![ShareFile::from_path("report.pdf").await?]).await?;
//!     println!("{}", peer.generate_share_link().await);
//!
//!     peer.wait_connected().await?;
//!     peer.close().await;
//!     Ok(())
//! }
//! ```

pub mod backoff;
pub mod connection;
pub mod facade;
pub mod mock;
pub mod real_factory;
pub mod transfer;
pub mod types;
pub mod ws_signaling;

pub use backoff::Backoff;
pub use connection::{ConnectionError, ConnectionHandler, ConnectionManager, NoopHandler};
pub use facade::{room_from_link, PeerDrop, PeerDropError, SHARE_LINK_PARAM};
pub use real_factory::RtcLinkFactory;
pub use transfer::{
    FileSource, NoopEvents, ReceivedFile, ShareFile, TransferEngine, TransferError,
    TransferEvents,
};
pub use types::{
    ConnectionConfig, ConnectionStatus, DisconnectReason, PeerDropConfig, ReconnectPolicy,
    TransferConfig,
};
pub use ws_signaling::WsSignalingConnector;
