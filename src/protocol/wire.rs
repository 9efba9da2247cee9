//! Wire messages and framing.
//!
//! Frames are length-prefixed and checksummed: a 4-byte big-endian payload
//! length, an 8-byte big-endian xxh3 of the payload, then the bincode
//! payload. Message order within a round is handshake -> manifest -> plan
//! -> chunks -> acks -> commit.

use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use xxhash_rust::xxh3::xxh3_64;

use crate::error::{Result, SyncError};
use crate::meta::FileMetadata;
use crate::path::PathKey;
use crate::queue::ChangeKind;
use crate::resolve::ResolvedAction;

pub const PROTOCOL_VERSION: u32 = 1;

/// Upper bound on a single frame; anything larger is a protocol error.
const MAX_FRAME_BYTES: u32 = 16 * 1024 * 1024;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum AckStatus {
    Done,
    Failed(String),
}

/// One entry of a manifest: the path, what happened to it, and its current
/// metadata (a tombstone for deletions).
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ManifestEntry {
    pub path: PathKey,
    pub kind: ChangeKind,
    pub meta: FileMetadata,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub enum Message {
    Handshake {
        version: u32,
        identity: String,
    },
    ManifestDelta {
        round_id: u64,
        /// True for a periodic full-reconciliation digest of the whole
        /// tree; false for a drained-changes delta.
        full: bool,
        entries: Vec<ManifestEntry>,
    },
    ActionPlan {
        round_id: u64,
        actions: Vec<ResolvedAction>,
    },
    ChunkData {
        round_id: u64,
        path: PathKey,
        offset: u64,
        bytes: Vec<u8>,
        running_checksum: u64,
    },
    ActionAck {
        round_id: u64,
        path: PathKey,
        status: AckStatus,
    },
    RoundCommit {
        round_id: u64,
    },
}

impl Message {
    pub fn name(&self) -> &'static str {
        match self {
            Message::Handshake { .. } => "Handshake",
            Message::ManifestDelta { .. } => "ManifestDelta",
            Message::ActionPlan { .. } => "ActionPlan",
            Message::ChunkData { .. } => "ChunkData",
            Message::ActionAck { .. } => "ActionAck",
            Message::RoundCommit { .. } => "RoundCommit",
        }
    }
}

pub async fn write_message<W: AsyncWrite + Unpin>(writer: &mut W, msg: &Message) -> Result<()> {
    let payload =
        bincode::serialize(msg).map_err(|e| SyncError::Protocol(format!("encode: {}", e)))?;
    if payload.len() as u64 > MAX_FRAME_BYTES as u64 {
        return Err(SyncError::Protocol(format!(
            "outgoing {} frame of {} bytes exceeds limit",
            msg.name(),
            payload.len()
        )));
    }
    let mut frame = Vec::with_capacity(12 + payload.len());
    frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
    frame.extend_from_slice(&xxh3_64(&payload).to_be_bytes());
    frame.extend_from_slice(&payload);
    writer
        .write_all(&frame)
        .await
        .map_err(|e| SyncError::Transport(e.to_string()))?;
    writer
        .flush()
        .await
        .map_err(|e| SyncError::Transport(e.to_string()))?;
    Ok(())
}

pub async fn read_message<R: AsyncRead + Unpin>(reader: &mut R) -> Result<Message> {
    let mut header = [0u8; 12];
    reader
        .read_exact(&mut header)
        .await
        .map_err(|e| SyncError::Transport(e.to_string()))?;
    let len = u32::from_be_bytes(header[0..4].try_into().unwrap());
    let checksum = u64::from_be_bytes(header[4..12].try_into().unwrap());
    if len > MAX_FRAME_BYTES {
        return Err(SyncError::Protocol(format!(
            "incoming frame of {} bytes exceeds limit",
            len
        )));
    }
    let mut payload = vec![0u8; len as usize];
    reader
        .read_exact(&mut payload)
        .await
        .map_err(|e| SyncError::Transport(e.to_string()))?;
    if xxh3_64(&payload) != checksum {
        return Err(SyncError::Protocol("frame checksum mismatch".to_string()));
    }
    bincode::deserialize(&payload).map_err(|e| SyncError::Protocol(format!("decode: {}", e)))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::EntryKind;
    use crate::resolve::Decision;

    fn sample_meta() -> FileMetadata {
        FileMetadata {
            size: 42,
            modified: 1_700_000_000_000_000_000,
            content_hash: Some("deadbeef".to_string()),
            kind: EntryKind::File,
        }
    }

    #[tokio::test]
    async fn test_roundtrip_manifest() {
        let (mut a, mut b) = tokio::io::duplex(64 * 1024);
        let msg = Message::ManifestDelta {
            round_id: 7,
            full: false,
            entries: vec![ManifestEntry {
                path: PathKey::new("dir/file.txt"),
                kind: ChangeKind::Modified,
                meta: sample_meta(),
            }],
        };
        write_message(&mut a, &msg).await.unwrap();

        match read_message(&mut b).await.unwrap() {
            Message::ManifestDelta {
                round_id,
                full,
                entries,
            } => {
                assert_eq!(round_id, 7);
                assert!(!full);
                assert_eq!(entries.len(), 1);
                assert_eq!(entries[0].path.as_str(), "dir/file.txt");
            }
            other => panic!("unexpected message: {}", other.name()),
        }
    }

    #[tokio::test]
    async fn test_roundtrip_plan_and_chunks() {
        let (mut a, mut b) = tokio::io::duplex(64 * 1024);
        let plan = Message::ActionPlan {
            round_id: 1,
            actions: vec![ResolvedAction::new(
                PathKey::new("f.bin"),
                Decision::PullFromRemote,
                sample_meta(),
            )],
        };
        let chunk = Message::ChunkData {
            round_id: 1,
            path: PathKey::new("f.bin"),
            offset: 0,
            bytes: vec![1, 2, 3],
            running_checksum: xxh3_64(&[1, 2, 3]),
        };
        write_message(&mut a, &plan).await.unwrap();
        write_message(&mut a, &chunk).await.unwrap();

        assert_eq!(read_message(&mut b).await.unwrap().name(), "ActionPlan");
        match read_message(&mut b).await.unwrap() {
            Message::ChunkData { bytes, .. } => assert_eq!(bytes, vec![1, 2, 3]),
            other => panic!("unexpected message: {}", other.name()),
        }
    }

    #[tokio::test]
    async fn test_corrupted_frame_rejected() {
        let (mut a, mut b) = tokio::io::duplex(64 * 1024);
        let msg = Message::RoundCommit { round_id: 3 };
        let payload = bincode::serialize(&msg).unwrap();
        let mut frame = Vec::new();
        frame.extend_from_slice(&(payload.len() as u32).to_be_bytes());
        frame.extend_from_slice(&(0xDEAD_BEEFu64).to_be_bytes()); // wrong checksum
        frame.extend_from_slice(&payload);
        tokio::io::AsyncWriteExt::write_all(&mut a, &frame)
            .await
            .unwrap();

        match read_message(&mut b).await {
            Err(SyncError::Protocol(_)) => {}
            other => panic!("expected protocol error, got {:?}", other.map(|m| m.name())),
        }
    }

    #[tokio::test]
    async fn test_oversized_frame_rejected() {
        let (mut a, mut b) = tokio::io::duplex(1024);
        let mut header = Vec::new();
        header.extend_from_slice(&(MAX_FRAME_BYTES + 1).to_be_bytes());
        header.extend_from_slice(&0u64.to_be_bytes());
        tokio::io::AsyncWriteExt::write_all(&mut a, &header)
            .await
            .unwrap();
        assert!(matches!(
            read_message(&mut b).await,
            Err(SyncError::Protocol(_))
        ));
    }
}
