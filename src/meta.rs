use ignore::WalkBuilder;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::io::Read;
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::path::PathKey;

/// What an entry is. `Deleted` is a tombstone used in manifests and commits.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum EntryKind {
    File,
    Directory,
    Symlink { target: String },
    Deleted,
}

/// Metadata for one tree entry. The content hash is computed lazily: only
/// when a conflict decision or transfer verification needs it.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FileMetadata {
    pub size: u64,
    /// Modification time as nanoseconds since the Unix epoch.
    pub modified: i64,
    pub content_hash: Option<String>,
    pub kind: EntryKind,
}

impl FileMetadata {
    /// Read metadata from the filesystem without hashing content.
    pub fn from_fs(abs: &Path) -> Result<Self> {
        let meta = std::fs::symlink_metadata(abs)?;
        let kind = if meta.file_type().is_symlink() {
            let target = std::fs::read_link(abs)?
                .to_str()
                .ok_or_else(|| SyncError::InvalidPath {
                    path: abs.to_path_buf(),
                })?
                .to_string();
            EntryKind::Symlink { target }
        } else if meta.is_dir() {
            EntryKind::Directory
        } else {
            EntryKind::File
        };

        Ok(Self {
            size: if meta.is_dir() { 0 } else { meta.len() },
            modified: system_time_nanos(meta.modified().unwrap_or(UNIX_EPOCH)),
            content_hash: None,
            kind,
        })
    }

    pub fn tombstone() -> Self {
        Self::tombstone_at(system_time_nanos(SystemTime::now()))
    }

    /// Tombstone carrying the time the deletion was actually observed (or
    /// the last time the path was known to exist). The edit-vs-delete grace
    /// comparison depends on this, so a deletion that happened long ago
    /// must not be stamped with the current time.
    pub fn tombstone_at(modified: i64) -> Self {
        Self {
            size: 0,
            modified,
            content_hash: None,
            kind: EntryKind::Deleted,
        }
    }

    pub fn is_deleted(&self) -> bool {
        self.kind == EntryKind::Deleted
    }

    /// Compute and cache the blake3 hash for file entries.
    pub fn ensure_hash(&mut self, abs: &Path) -> Result<Option<&str>> {
        if self.kind != EntryKind::File {
            return Ok(None);
        }
        if self.content_hash.is_none() {
            self.content_hash = Some(hash_file(abs)?);
        }
        Ok(self.content_hash.as_deref())
    }

    /// Cheap equality used for baseline comparison: kind, size and mtime.
    /// Hashes are deliberately not consulted here.
    pub fn same_shape(&self, other: &FileMetadata) -> bool {
        self.kind == other.kind && self.size == other.size && self.modified == other.modified
    }
}

pub fn system_time_nanos(t: SystemTime) -> i64 {
    match t.duration_since(UNIX_EPOCH) {
        Ok(d) => d.as_nanos() as i64,
        Err(e) => -(e.duration().as_nanos() as i64),
    }
}

pub fn now_nanos() -> i64 {
    system_time_nanos(SystemTime::now())
}

/// Streaming blake3 of a file's content, hex encoded.
pub fn hash_file(path: &Path) -> Result<String> {
    let mut file = std::fs::File::open(path)?;
    let mut hasher = blake3::Hasher::new();
    let mut buf = [0u8; 64 * 1024];
    loop {
        let n = file.read(&mut buf)?;
        if n == 0 {
            break;
        }
        hasher.update(&buf[..n]);
    }
    Ok(hex::encode(hasher.finalize().as_bytes()))
}

/// Walk a root and return path -> metadata for everything under it,
/// skipping excluded names. Used by poll-mode watching, startup
/// reconciliation and full-manifest rounds.
pub fn scan_root(cfg: &SyncConfig, root: &Path) -> Result<BTreeMap<PathKey, FileMetadata>> {
    let mut entries = BTreeMap::new();

    let excludes = cfg.clone();
    let walker = WalkBuilder::new(root)
        .hidden(false)
        .git_ignore(false)
        .git_global(false)
        .git_exclude(false)
        .follow_links(false)
        .filter_entry(move |entry| {
            entry
                .file_name()
                .to_str()
                .map(|name| !excludes.is_excluded(name))
                .unwrap_or(true)
        })
        .build();

    for result in walker {
        let entry = result.map_err(|e| SyncError::Io(std::io::Error::other(e.to_string())))?;
        let abs = entry.path();
        if abs == root {
            continue;
        }
        let key = PathKey::from_absolute(abs, root, cfg.case_insensitive)?;
        let meta = match FileMetadata::from_fs(abs) {
            Ok(meta) => meta,
            // Entry vanished between walk and stat; the watcher will report it.
            Err(SyncError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => continue,
            Err(e) => return Err(e),
        };
        entries.insert(key, meta);
    }

    Ok(entries)
}
