//! Configuration and status types for the peer side

use std::fmt;
use std::time::Duration;

use peerdrop_config::Config;
use peerdrop_core::{OverlapPolicy, CHUNK_SIZE};

/// Where the local peer is in reaching the remote one
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionStatus {
    Disconnected,
    /// Sender has joined its room and no receiver has arrived yet
    WaitingForPeer,
    Connecting,
    Connected,
}

impl fmt::Display for ConnectionStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            ConnectionStatus::Disconnected => "disconnected",
            ConnectionStatus::WaitingForPeer => "waiting for peer",
            ConnectionStatus::Connecting => "connecting",
            ConnectionStatus::Connected => "connected",
        };
        f.write_str(s)
    }
}

/// What ended the last session
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DisconnectReason {
    /// `disconnect()` or `close()` on this side
    LocalClose,
    /// Remote sent `peer-disconnected`
    PeerDisconnected,
    ChannelClosed,
    ChannelError(String),
    /// The direct transport reported connectivity loss
    TransportLost,
    /// Remote left the room before the channel opened
    PeerLeft,
    /// The relay answered with an error
    SignalingError(String),
    /// Relay reconnect attempts exhausted
    RelayUnavailable,
    /// The direct channel did not open in time
    Timeout,
}

impl fmt::Display for DisconnectReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DisconnectReason::LocalClose => write!(f, "closed locally"),
            DisconnectReason::PeerDisconnected => write!(f, "peer disconnected"),
            DisconnectReason::ChannelClosed => write!(f, "data channel closed"),
            DisconnectReason::ChannelError(e) => write!(f, "data channel error: {}", e),
            DisconnectReason::TransportLost => write!(f, "connection lost"),
            DisconnectReason::PeerLeft => write!(f, "peer left the room"),
            DisconnectReason::SignalingError(e) => write!(f, "relay error: {}", e),
            DisconnectReason::RelayUnavailable => write!(f, "relay unavailable"),
            DisconnectReason::Timeout => write!(f, "connection timed out"),
        }
    }
}

/// Relay reconnect policy
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ReconnectPolicy {
    pub base_delay: Duration,
    pub max_delay: Duration,
    pub max_attempts: u32,
}

impl Default for ReconnectPolicy {
    fn default() -> Self {
        Self {
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
            max_attempts: 5,
        }
    }
}

/// Connection manager settings
#[derive(Debug, Clone)]
pub struct ConnectionConfig {
    /// From negotiation start until the channel must be open
    pub connect_timeout: Duration,
    pub reconnect: ReconnectPolicy,
}

impl Default for ConnectionConfig {
    fn default() -> Self {
        Self {
            connect_timeout: Duration::from_secs(30),
            reconnect: ReconnectPolicy::default(),
        }
    }
}

/// Transfer engine settings
#[derive(Debug, Clone)]
pub struct TransferConfig {
    pub chunk_size: usize,
    /// Total attempts per frame, including the first
    pub max_send_attempts: u32,
    pub retry_delay: Duration,
    pub overlap_policy: OverlapPolicy,
}

impl Default for TransferConfig {
    fn default() -> Self {
        Self {
            chunk_size: CHUNK_SIZE,
            max_send_attempts: 5,
            retry_delay: Duration::from_millis(100),
            overlap_policy: OverlapPolicy::Replace,
        }
    }
}

/// Everything the facade needs
#[derive(Debug, Clone)]
pub struct PeerDropConfig {
    pub connection: ConnectionConfig,
    pub transfer: TransferConfig,
    pub share_base_url: String,
}

impl Default for PeerDropConfig {
    fn default() -> Self {
        Self {
            connection: ConnectionConfig::default(),
            transfer: TransferConfig::default(),
            share_base_url: "http://localhost:5173".to_string(),
        }
    }
}

impl From<&Config> for PeerDropConfig {
    fn from(config: &Config) -> Self {
        Self {
            connection: ConnectionConfig {
                connect_timeout: Duration::from_millis(config.client.connect_timeout_ms),
                reconnect: ReconnectPolicy {
                    base_delay: Duration::from_millis(config.reconnect.base_delay_ms),
                    max_delay: Duration::from_millis(config.reconnect.max_delay_ms),
                    max_attempts: config.reconnect.max_attempts,
                },
            },
            transfer: TransferConfig {
                chunk_size: config.transfer.chunk_size.max(1),
                max_send_attempts: config.transfer.max_send_attempts.max(1),
                retry_delay: Duration::from_millis(config.transfer.retry_delay_ms),
                overlap_policy: config.transfer.overlap_policy,
            },
            share_base_url: config.client.share_base_url.clone(),
        }
    }
}
