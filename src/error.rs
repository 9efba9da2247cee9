use std::path::PathBuf;
use thiserror::Error;

use crate::path::PathKey;

#[derive(Error, Debug)]
pub enum SyncError {
    #[error("Connection to peer lost: {0}\nThe session will reconnect with backoff.")]
    Transport(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("I/O failure on {path}\nCause: {source}\nOther paths in the round proceed independently.")]
    PathIo {
        path: PathKey,
        source: std::io::Error,
    },

    #[error("Checksum mismatch for {path}\nExpected {expected}, got {actual}\nThe transfer was discarded; it will be retried.")]
    ChecksumMismatch {
        path: PathKey,
        expected: String,
        actual: String,
    },

    #[error("Protocol error: {0}\nThis session is terminated; the tree state is untouched.")]
    Protocol(String),

    #[error("Peer speaks protocol version {theirs}, we speak {ours}\nUpgrade one of the two ends.")]
    VersionMismatch { ours: u32, theirs: u32 },

    #[error("Unresolvable conflict on {path}\nBoth versions were preserved under conflict names.")]
    ConflictUnresolvable { path: PathKey },

    #[error("State journal failure at {path}\nCause: {source}\nSynchronization for this root pair is halted at the last committed state.")]
    Journal {
        path: PathBuf,
        source: std::io::Error,
    },

    #[error("Sync round {round_id} abandoned: {reason}\nPending changes were re-queued.")]
    RoundAbandoned { round_id: u64, reason: String },

    #[error("Invalid path: {path}\nPaths must be relative to the synchronized root and must not escape it.")]
    InvalidPath { path: PathBuf },

    #[error("Configuration error: {0}")]
    Config(String),
}

impl SyncError {
    /// Errors that fail a single action but leave the rest of the round alive.
    pub fn is_per_path(&self) -> bool {
        matches!(
            self,
            SyncError::PathIo { .. } | SyncError::ChecksumMismatch { .. }
        )
    }

    /// Errors that tear down the session (caller reconnects with backoff).
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            SyncError::Transport(_) | SyncError::Protocol(_) | SyncError::VersionMismatch { .. }
        )
    }
}

pub type Result<T> = std::result::Result<T, SyncError>;
