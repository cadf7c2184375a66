//! Wire types shared by the relay and the peers
//!
//! Two JSON vocabularies live here: relay signaling messages exchanged over
//! the relay socket, and control messages exchanged over the direct channel.
//! Both are tagged on a `"type"` field with kebab-case names.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::protocol::ProtocolError;

/// Length of generated room ids (base36, roughly 113 bits)
pub const ROOM_ID_LEN: usize = 22;

/// Length of generated local peer ids
pub const LOCAL_ID_LEN: usize = 9;

/// Length of generated catalogue file ids
pub const FILE_ID_LEN: usize = 12;

/// Generate a random base36 token of the given length
pub fn generate_id(len: usize) -> String {
    use rand::Rng;
    let mut rng = rand::thread_rng();
    (0..len)
        .map(|_| {
            let digit: u32 = rng.gen_range(0..36);
            char::from_digit(digit, 36).unwrap_or('0')
        })
        .collect()
}

/// One of the two slots in a room
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    Sender,
    Receiver,
}

impl Role {
    /// The counterpart role
    pub fn other(self) -> Role {
        match self {
            Role::Sender => Role::Receiver,
            Role::Receiver => Role::Sender,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Role::Sender => "sender",
            Role::Receiver => "receiver",
        }
    }
}

impl fmt::Display for Role {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Messages exchanged with the relay server
///
/// Session descriptions and ICE candidates are opaque to everything except
/// the direct-channel implementation, so they travel as raw JSON values.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum SignalingMessage {
    /// Claim a role slot in a room (client -> relay)
    JoinRoom {
        #[serde(rename = "roomId")]
        room_id: String,
        role: Role,
    },
    /// The room now holds both roles; names the role that just joined
    PeerJoined {
        #[serde(rename = "peerRole")]
        peer_role: Role,
    },
    /// The named role vacated the room
    PeerLeft {
        #[serde(rename = "peerRole")]
        peer_role: Role,
    },
    Offer {
        offer: serde_json::Value,
        #[serde(rename = "roomId", default)]
        room_id: String,
    },
    Answer {
        answer: serde_json::Value,
        #[serde(rename = "roomId", default)]
        room_id: String,
    },
    IceCandidate {
        candidate: serde_json::Value,
        #[serde(rename = "roomId", default)]
        room_id: String,
    },
    Error {
        message: String,
    },
}

impl SignalingMessage {
    pub fn join(room_id: &str, role: Role) -> Self {
        SignalingMessage::JoinRoom {
            room_id: room_id.to_string(),
            role,
        }
    }

    pub fn offer(offer: serde_json::Value, room_id: &str) -> Self {
        SignalingMessage::Offer {
            offer,
            room_id: room_id.to_string(),
        }
    }

    pub fn answer(answer: serde_json::Value, room_id: &str) -> Self {
        SignalingMessage::Answer {
            answer,
            room_id: room_id.to_string(),
        }
    }

    pub fn candidate(candidate: serde_json::Value, room_id: &str) -> Self {
        SignalingMessage::IceCandidate {
            candidate,
            room_id: room_id.to_string(),
        }
    }

    pub fn error(message: impl Into<String>) -> Self {
        SignalingMessage::Error {
            message: message.into(),
        }
    }

    pub fn msg_type(&self) -> &'static str {
        match self {
            SignalingMessage::JoinRoom { .. } => "join-room",
            SignalingMessage::PeerJoined { .. } => "peer-joined",
            SignalingMessage::PeerLeft { .. } => "peer-left",
            SignalingMessage::Offer { .. } => "offer",
            SignalingMessage::Answer { .. } => "answer",
            SignalingMessage::IceCandidate { .. } => "ice-candidate",
            SignalingMessage::Error { .. } => "error",
        }
    }

    /// Handshake messages the relay forwards to the other occupant
    pub fn is_relayed(&self) -> bool {
        matches!(
            self,
            SignalingMessage::Offer { .. }
                | SignalingMessage::Answer { .. }
                | SignalingMessage::IceCandidate { .. }
        )
    }

    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }

    pub fn to_json(&self) -> String {
        // Serializing these variants cannot fail: every field is a string,
        // an enum or an already-valid JSON value.
        serde_json::to_string(self).unwrap_or_default()
    }
}

/// A catalogue entry as advertised to the remote peer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FileEntry {
    pub id: String,
    pub name: String,
    pub size: u64,
}

/// Text frames on the direct channel
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "kebab-case")]
pub enum ControlMessage {
    FileList {
        files: Vec<FileEntry>,
    },
    FileRequest {
        #[serde(rename = "fileIds")]
        file_ids: Vec<String>,
    },
    FileStart {
        #[serde(rename = "fileName")]
        file_name: String,
        #[serde(rename = "fileSize")]
        file_size: u64,
        #[serde(rename = "fileId")]
        file_id: String,
    },
    FileEnd {
        #[serde(rename = "fileId")]
        file_id: String,
    },
    FileError {
        #[serde(rename = "fileId")]
        file_id: String,
    },
    PeerDisconnected {
        #[serde(rename = "peerId")]
        peer_id: String,
    },
}

impl ControlMessage {
    pub fn msg_type(&self) -> &'static str {
        match self {
            ControlMessage::FileList { .. } => "file-list",
            ControlMessage::FileRequest { .. } => "file-request",
            ControlMessage::FileStart { .. } => "file-start",
            ControlMessage::FileEnd { .. } => "file-end",
            ControlMessage::FileError { .. } => "file-error",
            ControlMessage::PeerDisconnected { .. } => "peer-disconnected",
        }
    }

    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::Malformed(e.to_string()))
    }
}

/// What the receiver does when a second `file-start` arrives mid-transfer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OverlapPolicy {
    /// Abandon the active transfer (reported as failed) and start the new one
    #[default]
    Replace,
    /// Keep the active transfer and drop the newcomer until its end marker
    Reject,
}
