//! peerdrop command line
//!
//! Usage:
//!   peerdrop relay [--addr 127.0.0.1:8787]
//!   peerdrop send <files...> [--relay ws://host/ws]
//!   peerdrop receive <room-or-link> [--out DIR] [--relay ws://host/ws]
//!   peerdrop config

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use peerdrop_config::{get_config_path, Config};
use peerdrop_core::FileEntry;
use peerdrop_relay::RelayServer;
use peerdrop_webrtc::{
    PeerDrop, PeerDropConfig, ReceivedFile, RtcLinkFactory, ShareFile, TransferEvents,
    WsSignalingConnector,
};
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, info};
use tracing_subscriber::EnvFilter;

#[derive(Parser)]
#[command(name = "peerdrop")]
#[command(about = "Send files directly between two peers", long_about = None)]
struct Cli {
    /// Log at debug level
    #[arg(short, long, global = true)]
    verbose: bool,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the signaling relay
    Relay {
        /// Address to bind (default from config)
        #[arg(long)]
        addr: Option<String>,
    },
    /// Share files and wait for a receiver
    Send {
        /// Files to offer
        #[arg(required = true)]
        files: Vec<PathBuf>,
        /// Relay WebSocket URL (default from config)
        #[arg(long)]
        relay: Option<String>,
    },
    /// Fetch every file a sender offers
    Receive {
        /// Room id or share link
        remote: String,
        /// Directory to write files into (default from config)
        #[arg(long)]
        out: Option<PathBuf>,
        /// Relay WebSocket URL (default from config)
        #[arg(long)]
        relay: Option<String>,
    },
    /// Print the effective configuration
    Config,
}

/// Transfer callbacks, forwarded to the command loop
enum Event {
    Received(ReceivedFile),
    Progress(u8),
    Incoming(Vec<FileEntry>),
    Failed { file_id: String, reason: String },
    Connection(bool),
}

struct ChannelEvents(mpsc::UnboundedSender<Event>);

impl TransferEvents for ChannelEvents {
    fn on_file_received(&self, file: ReceivedFile) {
        let _ = self.0.send(Event::Received(file));
    }
    fn on_progress(&self, percent: u8) {
        let _ = self.0.send(Event::Progress(percent));
    }
    fn on_incoming_files(&self, files: Vec<FileEntry>) {
        let _ = self.0.send(Event::Incoming(files));
    }
    fn on_transfer_failed(&self, file_id: &str, reason: &str) {
        let _ = self.0.send(Event::Failed {
            file_id: file_id.to_string(),
            reason: reason.to_string(),
        });
    }
    fn on_connection_change(&self, connected: bool) {
        let _ = self.0.send(Event::Connection(connected));
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    init_logging(cli.verbose)?;

    match cli.command {
        Commands::Relay { addr } => {
            let config = Config::load()?;
            let addr = addr.unwrap_or(config.relay.bind_address);
            println!("Starting peerdrop relay on {}", addr);
            println!("Signaling: ws://{}/ws", addr);
            RelayServer::new(addr)
                .run(async {
                    let _ = tokio::signal::ctrl_c().await;
                })
                .await?;
        }
        Commands::Send { files, relay } => {
            let config = Config::load()?;
            send(&config, files, relay).await?;
        }
        Commands::Receive { remote, out, relay } => {
            let config = Config::load()?;
            let out = out.unwrap_or_else(|| PathBuf::from(&config.transfer.download_dir));
            receive(&config, &remote, &out, relay).await?;
        }
        Commands::Config => {
            let config = Config::load()?;
            println!("# {}", get_config_path().display());
            print!(
                "{}",
                toml::to_string_pretty(&config).context("Failed to render config")?
            );
        }
    }

    Ok(())
}

/// Default to info for our crates, override with RUST_LOG
fn init_logging(verbose: bool) -> Result<()> {
    let directive = if verbose { "peerdrop=debug" } else { "peerdrop=info" };
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env().add_directive(directive.parse()?))
        .with_writer(std::io::stderr)
        .init();
    Ok(())
}

fn build_peer(
    config: &Config,
    relay: Option<String>,
) -> (PeerDrop, mpsc::UnboundedReceiver<Event>) {
    let relay_url = relay.unwrap_or_else(|| config.client.relay_url.clone());
    debug!("Using relay {}", relay_url);
    let (tx, rx) = mpsc::unbounded_channel();
    let peer = PeerDrop::new(
        Arc::new(WsSignalingConnector::new(relay_url)),
        Arc::new(RtcLinkFactory::new(config.client.stun_servers.clone())),
        PeerDropConfig::from(config),
        Arc::new(ChannelEvents(tx)),
    );
    (peer, rx)
}

async fn send(config: &Config, paths: Vec<PathBuf>, relay: Option<String>) -> Result<()> {
    let mut files = Vec::with_capacity(paths.len());
    for path in &paths {
        let file = ShareFile::from_path(path)
            .await
            .with_context(|| format!("Failed to open {}", path.display()))?;
        files.push(file);
    }

    let (peer, mut events) = build_peer(config, relay);
    let entries = peer.share(files).await?;
    for entry in &entries {
        println!("  {} ({} bytes)", entry.name, entry.size);
    }
    println!("Room: {}", peer.room_id().await.unwrap_or_default());
    println!("Share link: {}", peer.generate_share_link().await);
    println!("Waiting for receiver... (ctrl-c to stop)");

    let mut connected = false;
    loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, closing");
                break;
            }
            event = events.recv() => match event {
                Some(Event::Connection(true)) => {
                    connected = true;
                    println!("Receiver connected");
                }
                Some(Event::Connection(false)) => {
                    let reason = peer
                        .last_disconnect_reason()
                        .await
                        .map(|r| r.to_string())
                        .unwrap_or_else(|| "unknown".to_string());
                    if connected {
                        println!("Receiver disconnected ({})", reason);
                        break;
                    }
                    peer.close().await;
                    bail!("No receiver connected: {}", reason);
                }
                Some(Event::Failed { file_id, reason }) => {
                    eprintln!("Failed to send {}: {}", file_id, reason);
                }
                Some(Event::Progress(percent)) => debug!("Upload {}%", percent),
                Some(_) => {}
                None => break,
            }
        }
    }
    peer.close().await;
    Ok(())
}

async fn receive(config: &Config, remote: &str, out: &Path, relay: Option<String>) -> Result<()> {
    tokio::fs::create_dir_all(out)
        .await
        .with_context(|| format!("Failed to create {}", out.display()))?;

    let (peer, mut events) = build_peer(config, relay);
    peer.connect(remote).await?;
    println!("Connecting to {}...", peer.room_id().await.unwrap_or_default());

    let mut pending: Option<HashSet<String>> = None;
    let result = loop {
        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Interrupted, closing");
                break Ok(());
            }
            event = events.recv() => match event {
                Some(Event::Connection(true)) => println!("Connected"),
                Some(Event::Incoming(files)) if pending.is_none() && !files.is_empty() => {
                    println!("Sender offers {} file(s):", files.len());
                    for file in &files {
                        println!("  {} ({} bytes)", file.name, file.size);
                    }
                    let ids: Vec<String> = files.into_iter().map(|f| f.id).collect();
                    pending = Some(ids.iter().cloned().collect());
                    if let Err(e) = peer.request_files(ids).await {
                        break Err(e.into());
                    }
                }
                Some(Event::Received(file)) => {
                    let path = output_path(out, &file.name, &file.id);
                    if let Err(e) = tokio::fs::write(&path, &file.data).await {
                        break Err(anyhow::Error::new(e)
                            .context(format!("Failed to write {}", path.display())));
                    }
                    println!("Saved {} ({} bytes)", path.display(), file.data.len());
                    if finish(&mut pending, &file.id) {
                        break Ok(());
                    }
                }
                Some(Event::Failed { file_id, reason }) => {
                    eprintln!("Failed to receive {}: {}", file_id, reason);
                    if finish(&mut pending, &file_id) {
                        break Ok(());
                    }
                }
                Some(Event::Progress(percent)) => debug!("Download {}%", percent),
                Some(Event::Connection(false)) => {
                    let reason = peer
                        .last_disconnect_reason()
                        .await
                        .map(|r| r.to_string())
                        .unwrap_or_else(|| "unknown".to_string());
                    break Err(anyhow::anyhow!("Disconnected: {}", reason));
                }
                Some(_) => {}
                None => break Ok(()),
            }
        }
    };
    peer.close().await;
    result
}

/// Mark a file done; true once nothing requested is outstanding
fn finish(pending: &mut Option<HashSet<String>>, file_id: &str) -> bool {
    match pending {
        Some(ids) => {
            ids.remove(file_id);
            ids.is_empty()
        }
        None => false,
    }
}

/// Where to save a received file, never outside `dir` and never over an existing file
fn output_path(dir: &Path, name: &str, fallback: &str) -> PathBuf {
    let name = Path::new(name)
        .file_name()
        .and_then(|n| n.to_str())
        .filter(|n| !n.is_empty())
        .unwrap_or(fallback);

    let candidate = dir.join(name);
    if !candidate.exists() {
        return candidate;
    }
    let path = Path::new(name);
    let stem = path.file_stem().and_then(|s| s.to_str()).unwrap_or(name);
    let ext = path.extension().and_then(|e| e.to_str());
    (1..)
        .map(|n| match ext {
            Some(ext) => dir.join(format!("{} ({}).{}", stem, n, ext)),
            None => dir.join(format!("{} ({})", stem, n)),
        })
        .find(|p| !p.exists())
        .unwrap_or(candidate)
}
