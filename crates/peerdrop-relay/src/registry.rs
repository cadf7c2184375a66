//! Room registry
//!
//! Each room has exactly one sender slot and one receiver slot. Slot changes
//! happen under the room's own mutex; the map of rooms is only locked long
//! enough to look up, insert or drop an entry, so unrelated rooms never
//! contend.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::{mpsc, Mutex, RwLock};
use tracing::debug;

use peerdrop_core::{Role, SignalingMessage};

/// Identifies one relay connection
pub type ClientId = u64;

/// Outbound text frames for one connection
pub type ClientTx = mpsc::UnboundedSender<String>;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum JoinError {
    #[error("Room already has a {0}")]
    RoleTaken(Role),
    #[error("Already joined room {room} as {role}")]
    AlreadyInRoom { room: String, role: Role },
}

struct Occupant {
    client: ClientId,
    tx: ClientTx,
}

#[derive(Default)]
struct Room {
    sender: Option<Occupant>,
    receiver: Option<Occupant>,
    /// Set once the room is empty and about to be dropped from the map
    closed: bool,
}

impl Room {
    fn slot_mut(&mut self, role: Role) -> &mut Option<Occupant> {
        match role {
            Role::Sender => &mut self.sender,
            Role::Receiver => &mut self.receiver,
        }
    }

    fn slot(&self, role: Role) -> &Option<Occupant> {
        match role {
            Role::Sender => &self.sender,
            Role::Receiver => &self.receiver,
        }
    }

    fn role_of(&self, client: ClientId) -> Option<Role> {
        [Role::Sender, Role::Receiver]
            .into_iter()
            .find(|role| matches!(self.slot(*role), Some(o) if o.client == client))
    }

    fn is_empty(&self) -> bool {
        self.sender.is_none() && self.receiver.is_none()
    }
}

/// Registry of all rooms on this relay
pub struct RoomRegistry {
    rooms: RwLock<HashMap<String, Arc<Mutex<Room>>>>,
    next_id: AtomicU64,
    connections: AtomicUsize,
}

impl RoomRegistry {
    pub fn new() -> Self {
        Self {
            rooms: RwLock::new(HashMap::new()),
            next_id: AtomicU64::new(1),
            connections: AtomicUsize::new(0),
        }
    }

    /// Allocate an id for a new connection
    pub fn register(&self) -> ClientId {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let total = self.connections.fetch_add(1, Ordering::Relaxed) + 1;
        debug!("Client {} connected, total: {}", id, total);
        id
    }

    pub fn unregister(&self, id: ClientId) {
        let total = self.connections.fetch_sub(1, Ordering::Relaxed).saturating_sub(1);
        debug!("Client {} disconnected, total: {}", id, total);
    }

    pub fn connection_count(&self) -> usize {
        self.connections.load(Ordering::Relaxed)
    }

    pub async fn room_count(&self) -> usize {
        self.rooms.read().await.len()
    }

    /// Which slots of a room are occupied, as (sender, receiver)
    pub async fn occupancy(&self, room_id: &str) -> Option<(bool, bool)> {
        let room = self.rooms.read().await.get(room_id).cloned()?;
        let room = room.lock().await;
        Some((room.sender.is_some(), room.receiver.is_some()))
    }

    /// Claim `role` in `room_id` for `client`
    ///
    /// Fails without side effects if the slot belongs to another client.
    /// When both slots end up filled, both occupants get `peer-joined`
    /// naming the role that just arrived.
    pub async fn join(
        &self,
        room_id: &str,
        role: Role,
        client: ClientId,
        tx: ClientTx,
    ) -> Result<(), JoinError> {
        loop {
            let room = self.room_entry(room_id).await;
            let mut guard = room.lock().await;
            if guard.closed {
                // Lost a race with the last occupant leaving
                drop(guard);
                self.discard(room_id, &room).await;
                continue;
            }

            match guard.slot(role) {
                Some(o) if o.client == client => return Ok(()),
                Some(_) => {
                    debug!("Client {} rejected from room {}: {} taken", client, room_id, role);
                    return Err(JoinError::RoleTaken(role));
                }
                None => {}
            }

            *guard.slot_mut(role) = Some(Occupant { client, tx });
            debug!("Client {} joined room {} as {}", client, room_id, role);

            if let (Some(sender), Some(receiver)) = (&guard.sender, &guard.receiver) {
                let joined = SignalingMessage::PeerJoined { peer_role: role }.to_json();
                let _ = sender.tx.send(joined.clone());
                let _ = receiver.tx.send(joined);
            }
            return Ok(());
        }
    }

    /// Forward a raw handshake message to the other occupant of the room
    ///
    /// Returns false if `from` is not in the room or nobody else is.
    pub async fn relay(&self, room_id: &str, from: ClientId, text: &str) -> bool {
        let Some(room) = self.rooms.read().await.get(room_id).cloned() else {
            return false;
        };
        let guard = room.lock().await;
        let Some(role) = guard.role_of(from) else {
            return false;
        };
        match guard.slot(role.other()) {
            Some(other) => {
                let delivered = other.tx.send(text.to_string()).is_ok();
                debug!("Relayed {} bytes in room {} from {}", text.len(), room_id, role);
                delivered
            }
            None => {
                debug!("Nothing to relay to in room {} ({} is alone)", room_id, role);
                false
            }
        }
    }

    /// Vacate whichever slot `client` holds in the room
    ///
    /// The remaining occupant gets `peer-left`; an emptied room is deleted.
    pub async fn leave(&self, room_id: &str, client: ClientId) -> Option<Role> {
        let room = self.rooms.read().await.get(room_id).cloned()?;
        let mut guard = room.lock().await;
        let role = guard.role_of(client)?;
        *guard.slot_mut(role) = None;
        debug!("Client {} left room {} ({})", client, room_id, role);

        if let Some(other) = guard.slot(role.other()) {
            let left = SignalingMessage::PeerLeft { peer_role: role }.to_json();
            let _ = other.tx.send(left);
        }

        if guard.is_empty() {
            guard.closed = true;
            drop(guard);
            self.discard(room_id, &room).await;
            debug!("Room {} deleted", room_id);
        }
        Some(role)
    }

    async fn room_entry(&self, room_id: &str) -> Arc<Mutex<Room>> {
        if let Some(room) = self.rooms.read().await.get(room_id) {
            return room.clone();
        }
        self.rooms
            .write()
            .await
            .entry(room_id.to_string())
            .or_default()
            .clone()
    }

    /// Drop a closed room from the map unless it was already replaced
    async fn discard(&self, room_id: &str, room: &Arc<Mutex<Room>>) {
        let mut rooms = self.rooms.write().await;
        if rooms.get(room_id).is_some_and(|r| Arc::ptr_eq(r, room)) {
            rooms.remove(room_id);
        }
    }
}

impl Default for RoomRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client(registry: &RoomRegistry) -> (ClientId, ClientTx, mpsc::UnboundedReceiver<String>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (registry.register(), tx, rx)
    }

    fn parse(text: String) -> SignalingMessage {
        SignalingMessage::parse(&text).unwrap()
    }

    #[tokio::test]
    async fn test_join_notifies_both_sides() {
        let registry = RoomRegistry::new();
        let (s, s_tx, mut s_rx) = client(&registry);
        let (r, r_tx, mut r_rx) = client(&registry);

        registry.join("room", Role::Sender, s, s_tx).await.unwrap();
        assert!(s_rx.try_recv().is_err(), "lone sender gets nothing");

        registry.join("room", Role::Receiver, r, r_tx).await.unwrap();
        for rx in [&mut s_rx, &mut r_rx] {
            match parse(rx.try_recv().unwrap()) {
                SignalingMessage::PeerJoined { peer_role } => assert_eq!(peer_role, Role::Receiver),
                other => panic!("Expected PeerJoined, got {:?}", other),
            }
        }
        assert_eq!(registry.occupancy("room").await, Some((true, true)));
    }

    #[tokio::test]
    async fn test_second_sender_rejected() {
        let registry = RoomRegistry::new();
        let (s1, s1_tx, mut s1_rx) = client(&registry);
        let (s2, s2_tx, _s2_rx) = client(&registry);
        let (r, r_tx, _r_rx) = client(&registry);

        registry.join("room", Role::Sender, s1, s1_tx).await.unwrap();
        let err = registry.join("room", Role::Sender, s2, s2_tx).await.unwrap_err();
        assert_eq!(err, JoinError::RoleTaken(Role::Sender));
        assert_eq!(err.to_string(), "Room already has a sender");

        // The original sender still owns the slot and still gets paired
        registry.join("room", Role::Receiver, r, r_tx).await.unwrap();
        assert!(matches!(
            parse(s1_rx.try_recv().unwrap()),
            SignalingMessage::PeerJoined { .. }
        ));
        assert!(registry.relay("room", s1, r#"{"type":"offer","offer":{}}"#).await);
        assert!(!registry.relay("room", s2, r#"{"type":"offer","offer":{}}"#).await);
    }

    #[tokio::test]
    async fn test_rejoin_same_slot_is_idempotent() {
        let registry = RoomRegistry::new();
        let (s, s_tx, _rx) = client(&registry);
        registry.join("room", Role::Sender, s, s_tx.clone()).await.unwrap();
        registry.join("room", Role::Sender, s, s_tx).await.unwrap();
        assert_eq!(registry.occupancy("room").await, Some((true, false)));
    }

    #[tokio::test]
    async fn test_relay_goes_to_other_side_only() {
        let registry = RoomRegistry::new();
        let (s, s_tx, mut s_rx) = client(&registry);
        let (r, r_tx, mut r_rx) = client(&registry);
        registry.join("room", Role::Sender, s, s_tx).await.unwrap();
        registry.join("room", Role::Receiver, r, r_tx).await.unwrap();
        let _ = s_rx.try_recv();
        let _ = r_rx.try_recv();

        let offer = r#"{"type":"offer","offer":{"sdp":"x"},"roomId":"room"}"#;
        assert!(registry.relay("room", s, offer).await);
        assert_eq!(r_rx.try_recv().unwrap(), offer);
        assert!(s_rx.try_recv().is_err(), "never echoed back");
    }

    #[tokio::test]
    async fn test_leave_notifies_and_deletes_room() {
        let registry = RoomRegistry::new();
        let (s, s_tx, _s_rx) = client(&registry);
        let (r, r_tx, mut r_rx) = client(&registry);
        registry.join("room", Role::Sender, s, s_tx).await.unwrap();
        registry.join("room", Role::Receiver, r, r_tx).await.unwrap();
        let _ = r_rx.try_recv();

        assert_eq!(registry.leave("room", s).await, Some(Role::Sender));
        match parse(r_rx.try_recv().unwrap()) {
            SignalingMessage::PeerLeft { peer_role } => assert_eq!(peer_role, Role::Sender),
            other => panic!("Expected PeerLeft, got {:?}", other),
        }
        assert_eq!(registry.room_count().await, 1);

        assert_eq!(registry.leave("room", r).await, Some(Role::Receiver));
        assert_eq!(registry.room_count().await, 0);
        assert_eq!(registry.leave("room", r).await, None);
    }

    #[tokio::test]
    async fn test_slot_reusable_after_leave() {
        let registry = RoomRegistry::new();
        let (s1, s1_tx, _rx1) = client(&registry);
        let (s2, s2_tx, _rx2) = client(&registry);
        registry.join("room", Role::Sender, s1, s1_tx).await.unwrap();
        registry.leave("room", s1).await;
        registry.join("room", Role::Sender, s2, s2_tx).await.unwrap();
        assert_eq!(registry.occupancy("room").await, Some((true, false)));
    }

    #[tokio::test(flavor = "multi_thread", worker_threads = 4)]
    async fn test_concurrent_joins_fill_each_slot_once() {
        let registry = Arc::new(RoomRegistry::new());
        let mut handles = Vec::new();
        let mut receivers = Vec::new();
        for i in 0..16 {
            let (id, tx, rx) = client(&registry);
            receivers.push(rx);
            let registry = registry.clone();
            let role = if i % 2 == 0 { Role::Sender } else { Role::Receiver };
            handles.push(tokio::spawn(async move {
                registry.join("race", role, id, tx).await.is_ok()
            }));
        }
        let mut accepted = 0;
        for handle in handles {
            if handle.await.unwrap() {
                accepted += 1;
            }
        }
        assert_eq!(accepted, 2);
        assert_eq!(registry.occupancy("race").await, Some((true, true)));
    }

    #[tokio::test]
    async fn test_connection_count() {
        let registry = RoomRegistry::new();
        let a = registry.register();
        let b = registry.register();
        assert_ne!(a, b);
        assert_eq!(registry.connection_count(), 2);
        registry.unregister(a);
        assert_eq!(registry.connection_count(), 1);
    }
}
