//! Direct-channel framing
//!
//! The direct channel carries two kinds of frames on one ordered, reliable
//! stream: JSON control messages as text frames and raw file chunks as
//! binary frames. There are no sequence numbers; reassembly relies on
//! arrival order.

use bytes::Bytes;
use thiserror::Error;

use crate::types::ControlMessage;

/// Fixed chunk size for file content (16 KiB)
pub const CHUNK_SIZE: usize = 16 * 1024;

/// Label of the data channel carrying file transfers
pub const DATA_CHANNEL_LABEL: &str = "fileTransfer";

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum ProtocolError {
    #[error("Malformed message: {0}")]
    Malformed(String),
}

/// One frame on the direct channel
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Frame {
    Text(String),
    Binary(Bytes),
}

impl Frame {
    pub fn len(&self) -> usize {
        match self {
            Frame::Text(s) => s.len(),
            Frame::Binary(b) => b.len(),
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_binary(&self) -> bool {
        matches!(self, Frame::Binary(_))
    }
}

impl From<&ControlMessage> for Frame {
    fn from(msg: &ControlMessage) -> Self {
        // Control messages hold only strings and integers
        Frame::Text(serde_json::to_string(msg).unwrap_or_default())
    }
}

impl From<ControlMessage> for Frame {
    fn from(msg: ControlMessage) -> Self {
        Frame::from(&msg)
    }
}

/// Number of chunks needed for a file of `size` bytes
pub fn chunk_count(size: u64, chunk_size: usize) -> u64 {
    if chunk_size == 0 {
        return 0;
    }
    size.div_ceil(chunk_size as u64)
}

/// Whole-percent progress, clamped to 0..=100
///
/// An empty file counts as complete.
pub fn progress_percent(done: u64, total: u64) -> u8 {
    if total == 0 {
        return 100;
    }
    let ratio = (done as f64 / total as f64).min(1.0);
    (ratio * 100.0).round() as u8
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_chunk_count() {
        assert_eq!(chunk_count(0, CHUNK_SIZE), 0);
        assert_eq!(chunk_count(10, CHUNK_SIZE), 1);
        assert_eq!(chunk_count(16384, CHUNK_SIZE), 1);
        assert_eq!(chunk_count(16385, CHUNK_SIZE), 2);
        assert_eq!(chunk_count(40000, CHUNK_SIZE), 3);
    }

    #[test]
    fn test_progress_percent() {
        assert_eq!(progress_percent(0, 40000), 0);
        assert_eq!(progress_percent(16384, 40000), 41);
        assert_eq!(progress_percent(32768, 40000), 82);
        assert_eq!(progress_percent(40000, 40000), 100);
        // Overshoot is clamped
        assert_eq!(progress_percent(50000, 40000), 100);
        assert_eq!(progress_percent(0, 0), 100);
    }

    #[test]
    fn test_control_frame_is_text() {
        let frame = Frame::from(ControlMessage::FileEnd {
            file_id: "abc".into(),
        });
        match frame {
            Frame::Text(text) => {
                assert_eq!(text, r#"{"type":"file-end","fileId":"abc"}"#);
            }
            _ => panic!("Expected Text frame"),
        }
    }

    #[test]
    fn test_frame_len() {
        let frame = Frame::Binary(Bytes::from_static(&[1, 2, 3]));
        assert_eq!(frame.len(), 3);
        assert!(frame.is_binary());
        assert!(Frame::Text(String::new()).is_empty());
    }
}
