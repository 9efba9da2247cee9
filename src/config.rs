use serde::{Deserialize, Serialize};
use std::collections::hash_map::DefaultHasher;
use std::hash::{Hash, Hasher};
use std::path::PathBuf;
use std::time::Duration;

use crate::error::{Result, SyncError};
use crate::path::Endpoint;

/// Policy for paths edited on both sides since the baseline.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ContentPolicy {
    /// Preserve both versions under conflict names (default).
    KeepBothRenamed,
    /// The newer modification time wins. Accepts clock-skew risk.
    LatestModifiedWins,
}

/// Policy for paths edited on one side and deleted on the other.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum DeletePolicy {
    /// The edit wins unless the deletion is newer by more than the grace
    /// window (default; favors not losing data).
    EditWinsOverDelete,
    /// The deletion wins.
    DeleteWins,
}

/// Validated configuration for one synchronized root pair.
///
/// Built once by the CLI layer before the core is constructed; the core
/// holds it immutably for its lifetime. There are no process-wide globals.
#[derive(Debug, Clone)]
pub struct SyncConfig {
    /// The local tree this process serves.
    pub root: PathBuf,
    /// The peer's tree: remote daemon or local path for same-machine runs.
    pub peer: Endpoint,
    pub content_policy: ContentPolicy,
    pub delete_policy: DeletePolicy,
    /// A deletion beats an edit under `EditWinsOverDelete` only if it is
    /// newer than the edit by more than this window.
    pub delete_grace: Duration,
    /// Watcher burst coalescing window.
    pub debounce: Duration,
    /// Periodic full reconciliation, to catch anything the watcher missed.
    pub full_sync_interval: Duration,
    /// Bound on concurrent per-path transfer tasks.
    pub max_transfers: usize,
    pub chunk_size: usize,
    /// A round with no progress for this long is abandoned.
    pub round_timeout: Duration,
    /// Trees larger than this are watched in poll mode.
    pub max_watched_entries: usize,
    pub poll_interval: Duration,
    /// Maximum number of queued changes drained into one round.
    pub round_batch: usize,
    /// Entry names to skip while scanning and watching.
    pub excludes: Vec<String>,
    /// Identity is folded to lowercase when the root is case-insensitive.
    pub case_insensitive: bool,
    /// Override for the private state directory (used by tests).
    pub state_dir: Option<PathBuf>,
}

impl SyncConfig {
    pub fn new(root: PathBuf, peer: Endpoint) -> Self {
        Self {
            root,
            peer,
            content_policy: ContentPolicy::KeepBothRenamed,
            delete_policy: DeletePolicy::EditWinsOverDelete,
            delete_grace: Duration::from_secs(5),
            debounce: Duration::from_millis(200),
            full_sync_interval: Duration::from_secs(300),
            max_transfers: 4,
            chunk_size: 64 * 1024,
            round_timeout: Duration::from_secs(120),
            max_watched_entries: 200_000,
            poll_interval: Duration::from_secs(10),
            round_batch: 512,
            excludes: Vec::new(),
            case_insensitive: false,
            state_dir: None,
        }
    }

    pub fn validate(&self) -> Result<()> {
        if !self.root.is_dir() {
            return Err(SyncError::Config(format!(
                "Local root is not a directory: {}",
                self.root.display()
            )));
        }
        if self.chunk_size == 0 || self.max_transfers == 0 || self.round_batch == 0 {
            return Err(SyncError::Config(
                "chunk_size, max_transfers and round_batch must be non-zero".to_string(),
            ));
        }
        if let Endpoint::Local(path) = &self.peer {
            if path == &self.root {
                return Err(SyncError::Config(
                    "Local peer path must differ from the root".to_string(),
                ));
            }
        }
        Ok(())
    }

    /// Unique identity for this root pair; keys the persisted snapshot and
    /// journal files.
    pub fn pair_id(&self) -> String {
        let mut hasher = DefaultHasher::new();
        self.root.to_string_lossy().hash(&mut hasher);
        self.peer.to_string().hash(&mut hasher);
        format!("{:x}", hasher.finish())
    }

    /// Private state directory (~/.local/share/sinkd/ by default).
    pub fn state_dir(&self) -> Result<PathBuf> {
        let dir = match &self.state_dir {
            Some(dir) => dir.clone(),
            None => dirs::data_local_dir()
                .ok_or_else(|| {
                    SyncError::Config("Cannot determine state directory (HOME not set)".to_string())
                })?
                .join("sinkd"),
        };
        std::fs::create_dir_all(&dir)?;
        Ok(dir)
    }

    /// True if the entry name is excluded from watching and scanning.
    /// Daemon-private names (".sinkd*" spool and state files) are always
    /// excluded to avoid feeding our own writes back into the queue.
    pub fn is_excluded(&self, name: &str) -> bool {
        name.starts_with(".sinkd") || self.excludes.iter().any(|e| e == name)
    }
}
