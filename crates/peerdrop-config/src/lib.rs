//! Shared configuration for peerdrop tools
//!
//! Reads from ~/.peerdrop/config.toml (override the directory with
//! `PEERDROP_CONFIG_DIR`).

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};

pub use peerdrop_core::OverlapPolicy;

/// Default public STUN servers
pub const DEFAULT_STUN_SERVERS: &[&str] = &[
    "stun:stun.l.google.com:19302",
    "stun:stun.cloudflare.com:3478",
];

/// Top-level config structure
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub relay: RelayConfig,
    #[serde(default)]
    pub client: ClientConfig,
    #[serde(default)]
    pub reconnect: ReconnectConfig,
    #[serde(default)]
    pub transfer: TransferSettings,
}

/// Relay server configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    #[serde(default = "default_bind_address")]
    pub bind_address: String,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            bind_address: default_bind_address(),
        }
    }
}

fn default_bind_address() -> String {
    "127.0.0.1:8787".to_string()
}

/// Peer-side configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ClientConfig {
    /// WebSocket URL of the relay's signaling endpoint
    #[serde(default = "default_relay_url")]
    pub relay_url: String,
    /// Base URL that share links point at
    #[serde(default = "default_share_base_url")]
    pub share_base_url: String,
    #[serde(default = "default_stun_servers")]
    pub stun_servers: Vec<String>,
    /// Give up if the direct channel is not open within this window
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,
}

impl Default for ClientConfig {
    fn default() -> Self {
        Self {
            relay_url: default_relay_url(),
            share_base_url: default_share_base_url(),
            stun_servers: default_stun_servers(),
            connect_timeout_ms: default_connect_timeout_ms(),
        }
    }
}

fn default_relay_url() -> String {
    "ws://127.0.0.1:8787/ws".to_string()
}

fn default_share_base_url() -> String {
    "http://localhost:5173".to_string()
}

fn default_stun_servers() -> Vec<String> {
    DEFAULT_STUN_SERVERS.iter().map(|s| s.to_string()).collect()
}

fn default_connect_timeout_ms() -> u64 {
    30_000
}

/// Relay reconnect backoff
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReconnectConfig {
    #[serde(default = "default_base_delay_ms")]
    pub base_delay_ms: u64,
    #[serde(default = "default_max_delay_ms")]
    pub max_delay_ms: u64,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
}

impl Default for ReconnectConfig {
    fn default() -> Self {
        Self {
            base_delay_ms: default_base_delay_ms(),
            max_delay_ms: default_max_delay_ms(),
            max_attempts: default_max_attempts(),
        }
    }
}

fn default_base_delay_ms() -> u64 {
    500
}

fn default_max_delay_ms() -> u64 {
    8_000
}

fn default_max_attempts() -> u32 {
    5
}

/// Chunked transfer tuning
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransferSettings {
    #[serde(default = "default_chunk_size")]
    pub chunk_size: usize,
    /// Total attempts per chunk, including the first
    #[serde(default = "default_max_send_attempts")]
    pub max_send_attempts: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default)]
    pub overlap_policy: OverlapPolicy,
    #[serde(default = "default_download_dir")]
    pub download_dir: String,
}

impl Default for TransferSettings {
    fn default() -> Self {
        Self {
            chunk_size: default_chunk_size(),
            max_send_attempts: default_max_send_attempts(),
            retry_delay_ms: default_retry_delay_ms(),
            overlap_policy: OverlapPolicy::default(),
            download_dir: default_download_dir(),
        }
    }
}

fn default_chunk_size() -> usize {
    peerdrop_core::CHUNK_SIZE
}

fn default_max_send_attempts() -> u32 {
    5
}

fn default_retry_delay_ms() -> u64 {
    100
}

fn default_download_dir() -> String {
    dirs::download_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .to_string_lossy()
        .to_string()
}

impl Config {
    /// Load config from file, or create default if doesn't exist
    pub fn load() -> Result<Self> {
        let config_path = get_config_path();

        if config_path.exists() {
            Self::load_from(&config_path)
        } else {
            let config = Config::default();
            config.save_to(&config_path)?;
            Ok(config)
        }
    }

    /// Load config, returning default on any error (no panic)
    pub fn load_or_default() -> Self {
        Self::load().unwrap_or_default()
    }

    /// Parse a config file at an explicit path
    pub fn load_from(path: &Path) -> Result<Self> {
        let content = fs::read_to_string(path)
            .with_context(|| format!("Failed to read config file {}", path.display()))?;
        toml::from_str(&content).context("Failed to parse config file")
    }

    /// Save config to the default location
    pub fn save(&self) -> Result<()> {
        self.save_to(&get_config_path())
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let content = toml::to_string_pretty(self)?;
        fs::write(path, content)?;

        Ok(())
    }
}

/// Get the peerdrop directory (~/.peerdrop)
pub fn get_peerdrop_dir() -> PathBuf {
    if let Ok(dir) = std::env::var("PEERDROP_CONFIG_DIR") {
        return PathBuf::from(dir);
    }
    dirs::home_dir()
        .unwrap_or_else(|| PathBuf::from("."))
        .join(".peerdrop")
}

/// Get the config file path (~/.peerdrop/config.toml)
pub fn get_config_path() -> PathBuf {
    get_peerdrop_dir().join("config.toml")
}
