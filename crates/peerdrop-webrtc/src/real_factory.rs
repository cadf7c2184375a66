//! Real WebRTC link factory
//!
//! Wraps the webrtc crate to implement PeerLinkFactory for production use.
//! Session descriptions and candidates cross the relay as the crate's own
//! serde representation.

use async_trait::async_trait;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, RwLock};
use tracing::{debug, warn};

use peerdrop_core::{
    DataChannel, Frame, LinkEvent, LinkHandles, LinkState, PeerLink, PeerLinkFactory,
    TransportError, DATA_CHANNEL_LABEL,
};

use webrtc::api::interceptor_registry::register_default_interceptors;
use webrtc::api::media_engine::MediaEngine;
use webrtc::api::APIBuilder;
use webrtc::data_channel::data_channel_init::RTCDataChannelInit;
use webrtc::data_channel::data_channel_message::DataChannelMessage;
use webrtc::data_channel::data_channel_state::RTCDataChannelState;
use webrtc::data_channel::RTCDataChannel;
use webrtc::ice_transport::ice_candidate::{RTCIceCandidate, RTCIceCandidateInit};
use webrtc::ice_transport::ice_server::RTCIceServer;
use webrtc::interceptor::registry::Registry;
use webrtc::peer_connection::configuration::RTCConfiguration;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;
use webrtc::peer_connection::sdp::session_description::RTCSessionDescription;
use webrtc::peer_connection::RTCPeerConnection;

type EventTx = mpsc::UnboundedSender<LinkEvent>;

fn failed(e: impl std::fmt::Display) -> TransportError {
    TransportError::ConnectionFailed(e.to_string())
}

/// Wrapper around RTCDataChannel that implements our DataChannel trait
struct RtcDataChannel {
    dc: Arc<RTCDataChannel>,
}

#[async_trait]
impl DataChannel for RtcDataChannel {
    async fn send(&self, frame: Frame) -> Result<(), TransportError> {
        let result = match frame {
            Frame::Text(text) => self.dc.send_text(text).await,
            Frame::Binary(data) => self.dc.send(&data).await,
        };
        result
            .map(|_| ())
            .map_err(|e| TransportError::SendFailed(e.to_string()))
    }

    fn is_open(&self) -> bool {
        self.dc.ready_state() == RTCDataChannelState::Open
    }

    async fn close(&self) {
        let _ = self.dc.close().await;
    }

    fn label(&self) -> &str {
        self.dc.label()
    }
}

/// One RTCPeerConnection
struct RtcPeerLink {
    connection: Arc<RTCPeerConnection>,
    /// Remote candidates that arrived before the remote description
    pending_candidates: RwLock<Vec<RTCIceCandidateInit>>,
}

impl RtcPeerLink {
    async fn apply_pending_candidates(&self) -> Result<(), TransportError> {
        let candidates = self
            .pending_candidates
            .write()
            .await
            .drain(..)
            .collect::<Vec<_>>();
        if !candidates.is_empty() {
            debug!("Adding {} queued ICE candidates", candidates.len());
        }
        for candidate in candidates {
            self.connection
                .add_ice_candidate(candidate)
                .await
                .map_err(failed)?;
        }
        Ok(())
    }
}

fn description(value: serde_json::Value) -> Result<RTCSessionDescription, TransportError> {
    serde_json::from_value(value).map_err(failed)
}

fn to_value(desc: &RTCSessionDescription) -> Result<serde_json::Value, TransportError> {
    serde_json::to_value(desc).map_err(failed)
}

#[async_trait]
impl PeerLink for RtcPeerLink {
    async fn create_offer(&self) -> Result<serde_json::Value, TransportError> {
        let offer = self.connection.create_offer(None).await.map_err(failed)?;
        self.connection
            .set_local_description(offer.clone())
            .await
            .map_err(failed)?;
        to_value(&offer)
    }

    async fn accept_offer(
        &self,
        offer: serde_json::Value,
    ) -> Result<serde_json::Value, TransportError> {
        self.connection
            .set_remote_description(description(offer)?)
            .await
            .map_err(failed)?;
        self.apply_pending_candidates().await?;

        let answer = self.connection.create_answer(None).await.map_err(failed)?;
        self.connection
            .set_local_description(answer.clone())
            .await
            .map_err(failed)?;
        to_value(&answer)
    }

    async fn accept_answer(&self, answer: serde_json::Value) -> Result<(), TransportError> {
        self.connection
            .set_remote_description(description(answer)?)
            .await
            .map_err(failed)?;
        self.apply_pending_candidates().await
    }

    async fn add_ice_candidate(
        &self,
        candidate: serde_json::Value,
    ) -> Result<(), TransportError> {
        let init: RTCIceCandidateInit = serde_json::from_value(candidate).map_err(failed)?;
        if self.connection.remote_description().await.is_some() {
            self.connection
                .add_ice_candidate(init)
                .await
                .map_err(failed)
        } else {
            debug!("Queueing ICE candidate (no remote description yet)");
            self.pending_candidates.write().await.push(init);
            Ok(())
        }
    }

    async fn close(&self) {
        if let Err(e) = self.connection.close().await {
            debug!("Error closing peer connection: {}", e);
        }
    }
}

/// Real WebRTC link factory
///
/// Creates actual WebRTC connections using the webrtc crate.
pub struct RtcLinkFactory {
    stun_servers: Vec<String>,
}

impl RtcLinkFactory {
    pub fn new(stun_servers: Vec<String>) -> Self {
        Self { stun_servers }
    }

    async fn create_connection(&self) -> Result<Arc<RTCPeerConnection>, TransportError> {
        let mut media_engine = MediaEngine::default();
        media_engine.register_default_codecs().map_err(failed)?;

        let mut registry = Registry::new();
        registry = register_default_interceptors(registry, &mut media_engine).map_err(failed)?;

        let api = APIBuilder::new()
            .with_media_engine(media_engine)
            .with_interceptor_registry(registry)
            .build();

        let ice_servers = if self.stun_servers.is_empty() {
            Vec::new()
        } else {
            vec![RTCIceServer {
                urls: self.stun_servers.clone(),
                ..Default::default()
            }]
        };
        let config = RTCConfiguration {
            ice_servers,
            ..Default::default()
        };

        api.new_peer_connection(config)
            .await
            .map(Arc::new)
            .map_err(failed)
    }

    fn setup_connection_handlers(connection: &Arc<RTCPeerConnection>, events: &EventTx) {
        let tx = events.clone();
        connection.on_peer_connection_state_change(Box::new(move |s: RTCPeerConnectionState| {
            let state = match s {
                RTCPeerConnectionState::New => Some(LinkState::New),
                RTCPeerConnectionState::Connecting => Some(LinkState::Connecting),
                RTCPeerConnectionState::Connected => Some(LinkState::Connected),
                RTCPeerConnectionState::Disconnected => Some(LinkState::Disconnected),
                RTCPeerConnectionState::Failed => Some(LinkState::Failed),
                RTCPeerConnectionState::Closed => Some(LinkState::Closed),
                _ => None,
            };
            if let Some(state) = state {
                let _ = tx.send(LinkEvent::StateChanged(state));
            }
            Box::pin(async {})
        }));

        let tx = events.clone();
        connection.on_ice_candidate(Box::new(move |candidate: Option<RTCIceCandidate>| {
            let tx = tx.clone();
            Box::pin(async move {
                let Some(candidate) = candidate else {
                    return;
                };
                let json = match candidate.to_json() {
                    Ok(json) => json,
                    Err(e) => {
                        warn!("Could not serialize ICE candidate: {}", e);
                        return;
                    }
                };
                match serde_json::to_value(&json) {
                    Ok(value) => {
                        let _ = tx.send(LinkEvent::LocalCandidate(value));
                    }
                    Err(e) => warn!("Could not serialize ICE candidate: {}", e),
                }
            })
        }));

        connection.on_ice_connection_state_change(Box::new(move |s| {
            debug!("ICE connection state: {:?}", s);
            Box::pin(async {})
        }));
    }

    /// Forward a data channel's lifecycle and frames to the link's events
    fn setup_channel_handlers(dc: &Arc<RTCDataChannel>, events: &EventTx) {
        let announced = Arc::new(AtomicBool::new(false));
        let announce = {
            let dc = dc.clone();
            let tx = events.clone();
            let announced = announced.clone();
            move || {
                if !announced.swap(true, Ordering::SeqCst) {
                    let channel: Arc<dyn DataChannel> = Arc::new(RtcDataChannel { dc: dc.clone() });
                    let _ = tx.send(LinkEvent::ChannelOpen(channel));
                }
            }
        };

        let on_open = announce.clone();
        dc.on_open(Box::new(move || {
            on_open();
            Box::pin(async {})
        }));
        if dc.ready_state() == RTCDataChannelState::Open {
            announce();
        }

        let tx = events.clone();
        dc.on_message(Box::new(move |msg: DataChannelMessage| {
            let frame = if msg.is_string {
                Frame::Text(String::from_utf8_lossy(&msg.data).to_string())
            } else {
                Frame::Binary(msg.data)
            };
            let _ = tx.send(LinkEvent::Frame(frame));
            Box::pin(async {})
        }));

        let tx = events.clone();
        dc.on_close(Box::new(move || {
            let _ = tx.send(LinkEvent::ChannelClosed);
            Box::pin(async {})
        }));

        let tx = events.clone();
        dc.on_error(Box::new(move |e| {
            let _ = tx.send(LinkEvent::ChannelError(e.to_string()));
            Box::pin(async {})
        }));
    }
}

#[async_trait]
impl PeerLinkFactory for RtcLinkFactory {
    async fn create_link(&self, initiator: bool) -> Result<LinkHandles, TransportError> {
        let connection = self.create_connection().await?;
        let (tx, rx) = mpsc::unbounded_channel();
        Self::setup_connection_handlers(&connection, &tx);

        let channel: Option<Arc<dyn DataChannel>> = if initiator {
            // Ordered and reliable: chunks carry no sequence numbers
            let dc_init = RTCDataChannelInit {
                ordered: Some(true),
                ..Default::default()
            };
            let dc = connection
                .create_data_channel(DATA_CHANNEL_LABEL, Some(dc_init))
                .await
                .map_err(failed)?;
            Self::setup_channel_handlers(&dc, &tx);
            Some(Arc::new(RtcDataChannel { dc }))
        } else {
            let events = tx.clone();
            connection.on_data_channel(Box::new(move |dc: Arc<RTCDataChannel>| {
                if dc.label() == DATA_CHANNEL_LABEL {
                    Self::setup_channel_handlers(&dc, &events);
                } else {
                    debug!("Ignoring unexpected data channel '{}'", dc.label());
                }
                Box::pin(async {})
            }));
            None
        };

        let link: Arc<dyn PeerLink> = Arc::new(RtcPeerLink {
            connection,
            pending_candidates: RwLock::new(Vec::new()),
        });
        Ok(LinkHandles {
            link,
            channel,
            events: rx,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_description_roundtrip_shape() {
        let value = serde_json::json!({"type": "offer", "sdp": "v=0\r\n"});
        let desc = description(value).unwrap();
        let back = to_value(&desc).unwrap();
        assert_eq!(back["type"], "offer");
        assert_eq!(back["sdp"], "v=0\r\n");
    }

    #[test]
    fn test_description_rejects_garbage() {
        assert!(description(serde_json::json!("not a description")).is_err());
    }

    #[tokio::test]
    async fn test_offer_answer_over_loopback() {
        let factory = RtcLinkFactory::new(Vec::new());
        let offerer = factory.create_link(true).await.unwrap();
        let answerer = factory.create_link(false).await.unwrap();
        assert_eq!(offerer.channel.as_ref().unwrap().label(), DATA_CHANNEL_LABEL);
        assert!(answerer.channel.is_none());

        let offer = offerer.link.create_offer().await.unwrap();
        assert_eq!(offer["type"], "offer");
        let answer = answerer.link.accept_offer(offer).await.unwrap();
        assert_eq!(answer["type"], "answer");
        offerer.link.accept_answer(answer).await.unwrap();

        offerer.link.close().await;
        answerer.link.close().await;
    }
}
