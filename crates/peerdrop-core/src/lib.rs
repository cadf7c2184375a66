//! Core types for peerdrop
//!
//! Shared by the relay server and the peers:
//!
//! - **Signaling**: JSON messages exchanged with the relay to pair a sender
//!   and a receiver and swap connection-setup payloads
//! - **Control**: JSON messages on the direct channel (catalogue, requests,
//!   file boundaries)
//! - **Transport seams**: traits for the relay socket and the direct link

pub mod protocol;
pub mod transport;
pub mod types;

pub use protocol::{
    chunk_count, progress_percent, Frame, ProtocolError, CHUNK_SIZE, DATA_CHANNEL_LABEL,
};
pub use transport::{
    DataChannel, LinkEvent, LinkHandles, LinkState, PeerLink, PeerLinkFactory,
    SignalingConnector, SignalingLink, SignalingSink, TransportError,
};
pub use types::{
    generate_id, ControlMessage, FileEntry, OverlapPolicy, Role, SignalingMessage,
    FILE_ID_LEN, LOCAL_ID_LEN, ROOM_ID_LEN,
};
