//! End-to-end scenarios: two peers, an in-process relay and the mock network

use bytes::Bytes;
use std::future::Future;
use std::sync::{Arc, Mutex};
use std::time::Duration;

use peerdrop_core::{
    ControlMessage, DataChannel, FileEntry, Frame, Role, SignalingConnector, SignalingMessage,
};
use peerdrop_relay::LocalRelay;
use peerdrop_webrtc::mock::MockNetwork;
use peerdrop_webrtc::{
    ConnectionError, ConnectionStatus, DisconnectReason, PeerDrop, PeerDropConfig, ReceivedFile,
    ShareFile, TransferEvents,
};

#[derive(Default)]
struct Recorder {
    received: Mutex<Vec<ReceivedFile>>,
    progress: Mutex<Vec<u8>>,
    incoming: Mutex<Vec<Vec<FileEntry>>>,
    failed: Mutex<Vec<String>>,
    connection: Mutex<Vec<bool>>,
}

impl Recorder {
    fn received(&self) -> Vec<ReceivedFile> {
        self.received.lock().unwrap().clone()
    }

    fn last_progress(&self) -> Option<u8> {
        self.progress.lock().unwrap().last().copied()
    }

    fn failed(&self) -> Vec<String> {
        self.failed.lock().unwrap().clone()
    }
}

impl TransferEvents for Recorder {
    fn on_file_received(&self, file: ReceivedFile) {
        self.received.lock().unwrap().push(file);
    }
    fn on_progress(&self, percent: u8) {
        self.progress.lock().unwrap().push(percent);
    }
    fn on_incoming_files(&self, files: Vec<FileEntry>) {
        self.incoming.lock().unwrap().push(files);
    }
    fn on_transfer_failed(&self, file_id: &str, _reason: &str) {
        self.failed.lock().unwrap().push(file_id.to_string());
    }
    fn on_connection_change(&self, connected: bool) {
        self.connection.lock().unwrap().push(connected);
    }
}

struct Peer {
    app: PeerDrop,
    events: Arc<Recorder>,
}

fn new_peer(relay: &Arc<LocalRelay>, network: &MockNetwork) -> Peer {
    let events = Arc::new(Recorder::default());
    let app = PeerDrop::new(
        relay.clone(),
        Arc::new(network.clone()),
        PeerDropConfig::default(),
        events.clone(),
    );
    Peer { app, events }
}

/// Poll until `check` holds, advancing (possibly paused) time between tries
async fn eventually<F, Fut>(check: F)
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    for _ in 0..1000 {
        if check().await {
            return;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    panic!("condition not reached");
}

fn pattern(len: usize) -> Bytes {
    (0..len).map(|i| (i % 251) as u8).collect::<Vec<u8>>().into()
}

/// Sender shares `files`, receiver follows the share link, both connect and
/// the receiver has seen the catalogue
async fn connected_pair(
    relay: &Arc<LocalRelay>,
    network: &MockNetwork,
    files: Vec<ShareFile>,
) -> (Peer, Peer, Vec<FileEntry>) {
    let sender = new_peer(relay, network);
    let receiver = new_peer(relay, network);

    let entries = sender.app.share(files).await.unwrap();
    let link = sender.app.generate_share_link().await;
    receiver.app.connect(&link).await.unwrap();
    sender.app.wait_connected().await.unwrap();
    receiver.app.wait_connected().await.unwrap();

    let r = &receiver.app;
    let expected = entries.len();
    eventually(|| async move { r.incoming_files().await.len() == expected }).await;
    (sender, receiver, entries)
}

/// Push a file-start and half of a 40000 byte file straight onto the sender's channel
async fn start_partial_transfer(sender: &Peer, receiver: &Peer) {
    let channel = sender.app.manager().channel().await.unwrap();
    let start = ControlMessage::FileStart {
        file_name: "partial.bin".to_string(),
        file_size: 40000,
        file_id: "partial".to_string(),
    };
    channel.send(start.into()).await.unwrap();
    channel
        .send(Frame::Binary(Bytes::from(vec![7u8; 20000])))
        .await
        .unwrap();

    let engine = receiver.app.engine();
    let events = &receiver.events;
    eventually(|| async move {
        engine.has_inbound_transfer().await && events.last_progress() == Some(50)
    })
    .await;
}

/// Wait until the peer is disconnected and its transfer state is cleared
async fn wait_for_reset(peer: &Peer) {
    let (app, events) = (&peer.app, &peer.events);
    eventually(|| async move {
        app.status() == ConnectionStatus::Disconnected
            && !app.engine().has_inbound_transfer().await
            && app.incoming_files().await.is_empty()
            && events.last_progress() == Some(0)
    })
    .await;
}

#[tokio::test]
async fn test_receiver_gets_only_requested_file() {
    let relay = LocalRelay::new();
    let network = MockNetwork::new();
    let big = pattern(40000);
    let (sender, receiver, entries) = connected_pair(
        &relay,
        &network,
        vec![
            ShareFile::from_bytes("a.txt", vec![1u8; 10]),
            ShareFile::from_bytes("b.bin", big.clone()),
        ],
    )
    .await;

    let incoming = receiver.app.incoming_files().await;
    assert_eq!(incoming, entries);
    assert_eq!(incoming[1].size, 40000);

    receiver
        .app
        .request_files(vec![entries[1].id.clone()])
        .await
        .unwrap();
    let events = &receiver.events;
    eventually(|| async move { !events.received().is_empty() }).await;

    let sender_channel = network.link(true).unwrap().channel();
    // file-list, file-start, three chunks, file-end
    eventually(|| {
        let sent = sender_channel.sent_frames();
        async move { sent == 6 }
    })
    .await;

    tokio::time::sleep(Duration::from_millis(50)).await;
    let received = receiver.events.received();
    assert_eq!(received.len(), 1);
    assert_eq!(received[0].id, entries[1].id);
    assert_eq!(received[0].name, "b.bin");
    assert_eq!(received[0].data, big);
    assert_eq!(receiver.events.last_progress(), Some(100));
    assert!(receiver.events.failed().is_empty());

    sender.app.close().await;
    receiver.app.close().await;
}

#[tokio::test]
async fn test_path_backed_file_arrives_byte_identical() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("photo.raw");
    let content = pattern(50_001);
    std::fs::write(&path, &content).unwrap();

    let relay = LocalRelay::new();
    let network = MockNetwork::new();
    let file = ShareFile::from_path(&path).await.unwrap();
    let (_sender, receiver, entries) = connected_pair(&relay, &network, vec![file]).await;
    assert_eq!(entries[0].name, "photo.raw");
    assert_eq!(entries[0].size, 50_001);

    receiver
        .app
        .request_files(vec![entries[0].id.clone()])
        .await
        .unwrap();
    let events = &receiver.events;
    eventually(|| async move { !events.received().is_empty() }).await;

    let received = receiver.events.received();
    assert_eq!(received[0].data, content);
}

#[tokio::test]
async fn test_abrupt_sender_exit_resets_receiver() {
    let relay = LocalRelay::new();
    let network = MockNetwork::new();
    let (sender, receiver, _) = connected_pair(
        &relay,
        &network,
        vec![ShareFile::from_bytes("a.txt", &b"hello"[..])],
    )
    .await;

    start_partial_transfer(&sender, &receiver).await;
    network.link(true).unwrap().sever();

    wait_for_reset(&receiver).await;
    assert_eq!(
        receiver.app.last_disconnect_reason().await,
        Some(DisconnectReason::TransportLost)
    );
    assert!(receiver.events.received().is_empty());
    assert!(receiver.app.incoming_files().await.is_empty());
    assert_eq!(
        receiver.events.connection.lock().unwrap().last(),
        Some(&false)
    );
}

#[derive(Debug, Clone, Copy)]
enum Trigger {
    ReceiverDisconnect,
    SenderClose,
    SenderDisconnect,
    Sever,
}

#[tokio::test]
async fn test_every_disconnect_path_resets_state() {
    let cases = [
        (Trigger::ReceiverDisconnect, DisconnectReason::LocalClose),
        (Trigger::SenderClose, DisconnectReason::PeerDisconnected),
        (Trigger::SenderDisconnect, DisconnectReason::ChannelClosed),
        (Trigger::Sever, DisconnectReason::TransportLost),
    ];

    for (trigger, expected) in cases {
        let relay = LocalRelay::new();
        let network = MockNetwork::new();
        let (sender, receiver, _) = connected_pair(
            &relay,
            &network,
            vec![ShareFile::from_bytes("a.txt", &b"hello"[..])],
        )
        .await;
        start_partial_transfer(&sender, &receiver).await;

        match trigger {
            Trigger::ReceiverDisconnect => receiver.app.disconnect().await,
            Trigger::SenderClose => sender.app.close().await,
            Trigger::SenderDisconnect => sender.app.disconnect().await,
            Trigger::Sever => network.link(true).unwrap().sever(),
        }

        wait_for_reset(&receiver).await;
        wait_for_reset(&sender).await;
        assert!(sender.app.catalog().await.is_empty());
        assert_eq!(
            receiver.app.last_disconnect_reason().await,
            Some(expected),
            "{:?}",
            trigger
        );

        let registry = relay.registry();
        let reg = &registry;
        eventually(|| async move { reg.room_count().await == 0 }).await;
    }
}

#[tokio::test(start_paused = true)]
async fn test_sender_rejoins_relay_after_outage() {
    let relay = LocalRelay::new();
    let network = MockNetwork::new();
    let sender = new_peer(&relay, &network);
    let entries = sender
        .app
        .share(vec![ShareFile::from_bytes("a.txt", &b"after the outage"[..])])
        .await
        .unwrap();
    let room = sender.app.room_id().await.unwrap();

    relay.set_available(false);
    relay.drop_connections().await;
    let rl = &relay;
    eventually(|| async move { rl.connect_attempts() >= 3 }).await;
    relay.set_available(true);

    let registry = relay.registry();
    let (reg, room_ref) = (&registry, &room);
    eventually(|| async move { reg.occupancy(room_ref).await == Some((true, false)) }).await;
    assert_eq!(sender.app.status(), ConnectionStatus::WaitingForPeer);

    let receiver = new_peer(&relay, &network);
    receiver.app.connect(&room).await.unwrap();
    sender.app.wait_connected().await.unwrap();
    receiver.app.wait_connected().await.unwrap();

    let r = &receiver.app;
    eventually(|| async move { !r.incoming_files().await.is_empty() }).await;
    receiver
        .app
        .request_files(vec![entries[0].id.clone()])
        .await
        .unwrap();
    let events = &receiver.events;
    eventually(|| async move { !events.received().is_empty() }).await;
    assert_eq!(&receiver.events.received()[0].data[..], b"after the outage");
}

#[tokio::test(start_paused = true)]
async fn test_relay_unavailable_after_backoff() {
    let relay = LocalRelay::new();
    let network = MockNetwork::new();
    let sender = new_peer(&relay, &network);
    sender
        .app
        .share(vec![ShareFile::from_bytes("a.txt", &b"x"[..])])
        .await
        .unwrap();

    relay.set_available(false);
    let started = tokio::time::Instant::now();
    relay.drop_connections().await;

    let err = sender.app.wait_connected().await.unwrap_err();
    assert!(matches!(err, ConnectionError::RelayUnavailable { attempts: 5 }));
    // 0.5 + 1 + 2 + 4 + 8 seconds of backoff
    assert!(started.elapsed() >= Duration::from_millis(15_500));
    assert_eq!(relay.connect_attempts(), 6);
    assert_eq!(sender.app.status(), ConnectionStatus::Disconnected);
    assert_eq!(
        sender.app.last_disconnect_reason().await,
        Some(DisconnectReason::RelayUnavailable)
    );
}

#[tokio::test]
async fn test_relay_loss_after_open_keeps_channel() {
    let relay = LocalRelay::new();
    let network = MockNetwork::new();
    let (sender, receiver, entries) = connected_pair(
        &relay,
        &network,
        vec![ShareFile::from_bytes("a.txt", pattern(20000))],
    )
    .await;

    relay.drop_connections().await;
    tokio::time::sleep(Duration::from_millis(100)).await;
    assert_eq!(sender.app.status(), ConnectionStatus::Connected);
    assert_eq!(receiver.app.status(), ConnectionStatus::Connected);
    assert_eq!(relay.connect_attempts(), 2);

    receiver
        .app
        .request_files(vec![entries[0].id.clone()])
        .await
        .unwrap();
    let events = &receiver.events;
    eventually(|| async move { !events.received().is_empty() }).await;
    assert_eq!(receiver.events.received()[0].data, pattern(20000));
}

#[tokio::test(start_paused = true)]
async fn test_sender_times_out_without_answer() {
    let relay = LocalRelay::new();
    let network = MockNetwork::new();
    let sender = new_peer(&relay, &network);
    sender
        .app
        .share(vec![ShareFile::from_bytes("a.txt", &b"x"[..])])
        .await
        .unwrap();
    let room = sender.app.room_id().await.unwrap();

    // A receiver that joins but never answers the offer
    let silent = relay.connect().await.unwrap();
    silent
        .sink
        .send(SignalingMessage::join(&room, Role::Receiver))
        .await
        .unwrap();

    let started = tokio::time::Instant::now();
    let err = sender.app.wait_connected().await.unwrap_err();
    assert!(matches!(err, ConnectionError::Timeout));
    assert!(started.elapsed() >= Duration::from_secs(30));
    assert_eq!(
        sender.app.last_disconnect_reason().await,
        Some(DisconnectReason::Timeout)
    );
    drop(silent);
}

#[tokio::test]
async fn test_peer_leaving_before_open_ends_session() {
    let relay = LocalRelay::new();
    let network = MockNetwork::new();
    let sender = new_peer(&relay, &network);
    sender
        .app
        .share(vec![ShareFile::from_bytes("a.txt", &b"x"[..])])
        .await
        .unwrap();
    let room = sender.app.room_id().await.unwrap();

    let visitor = relay.connect().await.unwrap();
    visitor
        .sink
        .send(SignalingMessage::join(&room, Role::Receiver))
        .await
        .unwrap();
    visitor.sink.close().await;

    let err = sender.app.wait_connected().await.unwrap_err();
    assert!(matches!(err, ConnectionError::Signaling(_)));
    assert_eq!(
        sender.app.last_disconnect_reason().await,
        Some(DisconnectReason::PeerLeft)
    );
}

#[tokio::test]
async fn test_duplicate_requests_are_serialized() {
    let relay = LocalRelay::new();
    let network = MockNetwork::new();
    let big = pattern(40000);
    let (_sender, receiver, entries) = connected_pair(
        &relay,
        &network,
        vec![ShareFile::from_bytes("b.bin", big.clone())],
    )
    .await;

    let id = entries[0].id.clone();
    receiver.app.request_files(vec![id.clone()]).await.unwrap();
    receiver.app.request_files(vec![id]).await.unwrap();

    let events = &receiver.events;
    eventually(|| async move { events.received().len() == 2 }).await;
    assert!(receiver.events.received().iter().all(|f| f.data == big));
    assert!(receiver.events.failed().is_empty());
}

#[tokio::test]
async fn test_failed_file_reports_error_and_keeps_connection() {
    let relay = LocalRelay::new();
    let network = MockNetwork::new();
    let (sender, receiver, entries) = connected_pair(
        &relay,
        &network,
        vec![ShareFile::from_bytes("a.txt", &b"retry me"[..])],
    )
    .await;

    // Every attempt at file-start fails; the file-error after it goes through
    network.link(true).unwrap().channel().fail_next_sends(5);
    let id = entries[0].id.clone();
    receiver.app.request_files(vec![id.clone()]).await.unwrap();

    let events = &sender.events;
    eventually(|| async move { !events.failed().is_empty() }).await;
    assert_eq!(sender.events.failed(), vec![id.clone()]);
    let events = &receiver.events;
    eventually(|| async move { !events.failed().is_empty() }).await;
    assert_eq!(receiver.events.failed(), vec![id.clone()]);
    assert!(receiver.events.received().is_empty());
    assert_eq!(sender.app.status(), ConnectionStatus::Connected);
    assert_eq!(receiver.app.status(), ConnectionStatus::Connected);

    receiver.app.request_files(vec![id]).await.unwrap();
    let events = &receiver.events;
    eventually(|| async move { !events.received().is_empty() }).await;
    assert_eq!(&receiver.events.received()[0].data[..], b"retry me");
}
