//! WebSocket signaling client
//!
//! Speaks the relay's JSON protocol over tokio-tungstenite. One task writes
//! queued frames, another parses inbound text into [`SignalingMessage`]s.

use async_trait::async_trait;
use futures::{SinkExt, StreamExt};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use peerdrop_core::{
    SignalingConnector, SignalingLink, SignalingMessage, SignalingSink, TransportError,
};

/// Connects to a relay's `/ws` endpoint
pub struct WsSignalingConnector {
    url: String,
}

impl WsSignalingConnector {
    pub fn new(url: impl Into<String>) -> Self {
        Self { url: url.into() }
    }

    pub fn url(&self) -> &str {
        &self.url
    }
}

#[async_trait]
impl SignalingConnector for WsSignalingConnector {
    async fn connect(&self) -> Result<SignalingLink, TransportError> {
        let (ws_stream, _) = connect_async(self.url.as_str())
            .await
            .map_err(|e| TransportError::ConnectionFailed(format!("{}: {}", self.url, e)))?;
        info!("Connected to relay {}", self.url);
        let (mut write, mut read) = ws_stream.split();

        let (out_tx, mut out_rx) = mpsc::unbounded_channel::<Message>();
        let writer_url = self.url.clone();
        tokio::spawn(async move {
            while let Some(msg) = out_rx.recv().await {
                let closing = matches!(msg, Message::Close(_));
                if let Err(e) = write.send(msg).await {
                    debug!("Relay write to {} failed: {}", writer_url, e);
                    break;
                }
                if closing {
                    break;
                }
            }
            let _ = write.close().await;
        });

        let (in_tx, in_rx) = mpsc::unbounded_channel::<SignalingMessage>();
        let reader_url = self.url.clone();
        let reader = tokio::spawn(async move {
            while let Some(msg) = read.next().await {
                match msg {
                    Ok(Message::Text(text)) => match SignalingMessage::parse(&text) {
                        Ok(msg) => {
                            if in_tx.send(msg).is_err() {
                                break;
                            }
                        }
                        Err(e) => warn!("Unparseable frame from relay: {}", e),
                    },
                    Ok(Message::Close(_)) => break,
                    Ok(_) => {}
                    Err(e) => {
                        warn!("WebSocket error from {}: {}", reader_url, e);
                        break;
                    }
                }
            }
            debug!("Relay stream {} ended", reader_url);
        });

        let sink = Arc::new(WsSink {
            out: out_tx,
            closed: AtomicBool::new(false),
            reader: Mutex::new(Some(reader)),
        });
        Ok(SignalingLink {
            sink,
            incoming: in_rx,
        })
    }
}

struct WsSink {
    out: mpsc::UnboundedSender<Message>,
    closed: AtomicBool,
    reader: Mutex<Option<JoinHandle<()>>>,
}

#[async_trait]
impl SignalingSink for WsSink {
    async fn send(&self, msg: SignalingMessage) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(TransportError::Disconnected);
        }
        self.out
            .send(Message::Text(msg.to_json()))
            .map_err(|_| TransportError::Disconnected)
    }

    async fn close(&self) {
        if self.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        let _ = self.out.send(Message::Close(None));
        let reader = self.reader.lock().unwrap_or_else(|e| e.into_inner()).take();
        if let Some(reader) = reader {
            reader.abort();
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use peerdrop_core::Role;
    use peerdrop_relay::RelayServer;
    use std::time::Duration;
    use tokio::net::TcpListener;

    async fn start_relay() -> (String, tokio::sync::oneshot::Sender<()>) {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let server = RelayServer::new(addr.to_string());
        let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
        tokio::spawn(server.serve(listener, async move {
            let _ = stop_rx.await;
        }));
        (format!("ws://{}/ws", addr), stop_tx)
    }

    async fn recv(link: &mut SignalingLink) -> Option<SignalingMessage> {
        tokio::time::timeout(Duration::from_secs(5), link.incoming.recv())
            .await
            .expect("timed out waiting for relay")
    }

    #[tokio::test]
    async fn test_pairing_over_websocket() {
        let (url, _stop) = start_relay().await;
        let connector = WsSignalingConnector::new(url);
        let mut sender = connector.connect().await.unwrap();
        let mut receiver = connector.connect().await.unwrap();

        sender.sink.send(SignalingMessage::join("room", Role::Sender)).await.unwrap();
        tokio::time::sleep(Duration::from_millis(50)).await;
        receiver
            .sink
            .send(SignalingMessage::join("room", Role::Receiver))
            .await
            .unwrap();
        assert_eq!(
            recv(&mut sender).await,
            Some(SignalingMessage::PeerJoined {
                peer_role: Role::Receiver
            })
        );
        assert!(matches!(
            recv(&mut receiver).await,
            Some(SignalingMessage::PeerJoined { .. })
        ));

        let answer = SignalingMessage::answer(serde_json::json!({"type": "answer"}), "room");
        receiver.sink.send(answer.clone()).await.unwrap();
        assert_eq!(recv(&mut sender).await, Some(answer));

        receiver.sink.close().await;
        assert_eq!(
            recv(&mut sender).await,
            Some(SignalingMessage::PeerLeft {
                peer_role: Role::Receiver
            })
        );
        assert!(receiver
            .sink
            .send(SignalingMessage::join("room", Role::Receiver))
            .await
            .is_err());
    }

    #[tokio::test]
    async fn test_connect_refused() {
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        drop(listener);
        let connector = WsSignalingConnector::new(format!("ws://{}/ws", addr));
        let err = connector.connect().await.err().unwrap();
        assert!(matches!(err, TransportError::ConnectionFailed(_)));
    }
}
