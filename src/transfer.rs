//! Transfer engine: moves file content and metadata between peers.
//!
//! Incoming content is staged in a `.sinkd-partial-*` spool file next to
//! nothing the watcher cares about (daemon-private names are excluded from
//! scans), verified against the manifest hash, then atomically renamed into
//! place. An interrupted transfer leaves the spool behind, and the next
//! session resumes from its length rather than restarting.

use filetime::FileTime;
use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use tokio::sync::mpsc;
use xxhash_rust::xxh3::xxh3_64;

use crate::error::{Result, SyncError};
use crate::meta::FileMetadata;
use crate::path::PathKey;
use crate::protocol::wire::Message;
use crate::watch::SuppressionSet;

fn path_io(path: &PathKey) -> impl Fn(std::io::Error) -> SyncError + '_ {
    move |e| SyncError::PathIo {
        path: path.clone(),
        source: e,
    }
}

/// Spool file location for an in-flight transfer. Flat under the root so
/// renaming into place never crosses a filesystem boundary.
pub fn spool_path_for(root: &Path, key: &PathKey) -> PathBuf {
    root.join(format!(".sinkd-partial-{:016x}", xxh3_64(key.as_str().as_bytes())))
}

/// Bytes already staged for a path, used to negotiate a resume offset.
pub fn staged_offset(root: &Path, key: &PathKey) -> u64 {
    std::fs::metadata(spool_path_for(root, key))
        .map(|m| m.len())
        .unwrap_or(0)
}

/// Resume offset to negotiate for an incoming transfer of `size` bytes.
/// A staged spool at least as large as the incoming file belongs to an
/// older version of the path and cannot be resumed; it is discarded so
/// the transfer starts clean. Resuming past the manifest size would make
/// the sender seek beyond EOF and never complete.
pub fn usable_resume_offset(root: &Path, key: &PathKey, size: u64) -> u64 {
    let staged = staged_offset(root, key);
    if staged == 0 {
        return 0;
    }
    if staged >= size {
        let _ = std::fs::remove_file(spool_path_for(root, key));
        return 0;
    }
    staged
}

/// Receiving side of one file transfer.
pub struct Spool {
    key: PathKey,
    final_path: PathBuf,
    spool_path: PathBuf,
    file: File,
    offset: u64,
    hasher: blake3::Hasher,
    expected: FileMetadata,
}

impl Spool {
    /// Open a spool, resuming from `resume_offset` bytes of previously
    /// staged content when possible. The staged prefix is re-read to keep
    /// the whole-file hash continuous across the interruption.
    pub async fn open(
        root: &Path,
        key: PathKey,
        expected: FileMetadata,
        resume_offset: u64,
    ) -> Result<Self> {
        let io = |e| SyncError::PathIo {
            path: key.clone(),
            source: e,
        };
        let final_path = key.to_absolute(root);
        let spool_path = spool_path_for(root, &key);
        let mut hasher = blake3::Hasher::new();

        let (file, offset) = if resume_offset > 0 {
            let mut file = OpenOptions::new()
                .read(true)
                .write(true)
                .open(&spool_path)
                .await
                .map_err(io)?;
            let staged = file.metadata().await.map_err(io)?.len();
            if staged < resume_offset {
                return Err(SyncError::Protocol(format!(
                    "peer resumed {} at offset {} but only {} bytes are staged",
                    key, resume_offset, staged
                )));
            }
            let mut remaining = resume_offset;
            let mut buf = vec![0u8; 64 * 1024];
            file.rewind().await.map_err(io)?;
            while remaining > 0 {
                let want = remaining.min(buf.len() as u64) as usize;
                let n = file.read(&mut buf[..want]).await.map_err(io)?;
                if n == 0 {
                    break;
                }
                hasher.update(&buf[..n]);
                remaining -= n as u64;
            }
            file.set_len(resume_offset).await.map_err(io)?;
            file.seek(std::io::SeekFrom::Start(resume_offset))
                .await
                .map_err(io)?;
            (file, resume_offset)
        } else {
            let file = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&spool_path)
                .await
                .map_err(io)?;
            (file, 0)
        };

        Ok(Self {
            key,
            final_path,
            spool_path,
            file,
            offset,
            hasher,
            expected,
        })
    }

    pub fn offset(&self) -> u64 {
        self.offset
    }

    pub fn is_complete(&self) -> bool {
        self.offset >= self.expected.size
    }

    pub async fn write_chunk(&mut self, offset: u64, bytes: &[u8], checksum: u64) -> Result<()> {
        if offset != self.offset {
            return Err(SyncError::Protocol(format!(
                "out-of-order chunk for {}: expected offset {}, got {}",
                self.key, self.offset, offset
            )));
        }
        if xxh3_64(bytes) != checksum {
            return Err(SyncError::ChecksumMismatch {
                path: self.key.clone(),
                expected: format!("{:016x}", checksum),
                actual: format!("{:016x}", xxh3_64(bytes)),
            });
        }
        self.file
            .write_all(bytes)
            .await
            .map_err(path_io(&self.key))?;
        self.hasher.update(bytes);
        self.offset += bytes.len() as u64;
        Ok(())
    }

    /// Verify the whole-file hash, restore the manifest mtime, and rename
    /// into place. A mismatch discards the spool so the retry starts clean.
    pub async fn finish(mut self, suppress: &SuppressionSet) -> Result<FileMetadata> {
        let io = path_io(&self.key);
        self.file.flush().await.map_err(&io)?;
        self.file.sync_all().await.map_err(&io)?;
        drop(self.file);

        let actual = hex::encode(self.hasher.finalize().as_bytes());
        if let Some(expected_hash) = &self.expected.content_hash {
            if &actual != expected_hash {
                let _ = tokio::fs::remove_file(&self.spool_path).await;
                return Err(SyncError::ChecksumMismatch {
                    path: self.key.clone(),
                    expected: expected_hash.clone(),
                    actual,
                });
            }
        }

        let secs = self.expected.modified.div_euclid(1_000_000_000);
        let nanos = self.expected.modified.rem_euclid(1_000_000_000) as u32;
        filetime::set_file_mtime(&self.spool_path, FileTime::from_unix_time(secs, nanos))
            .map_err(&io)?;

        if let Some(parent) = self.final_path.parent() {
            tokio::fs::create_dir_all(parent).await.map_err(&io)?;
        }
        suppress.insert(self.key.clone());
        tokio::fs::rename(&self.spool_path, &self.final_path)
            .await
            .map_err(&io)?;

        let mut meta = self.expected;
        meta.content_hash = Some(actual);
        Ok(meta)
    }

    /// Drop the transfer but keep the staged bytes for a later resume.
    pub async fn park(mut self) -> u64 {
        let _ = self.file.flush().await;
        self.offset
    }
}

/// Sending side: stream a file as chunk messages from `offset` up to the
/// manifest size; a file that changed underneath stops short or is cut off
/// and fails verification on the other end. Frames go through the session's
/// outbound channel; per-file ordering holds because one task owns one file.
pub async fn send_file(
    wire_key: &PathKey,
    source: &Path,
    round_id: u64,
    offset: u64,
    size: u64,
    chunk_size: usize,
    tx: &mpsc::Sender<Message>,
) -> Result<u64> {
    let io = path_io(wire_key);
    let mut file = File::open(source).await.map_err(&io)?;
    if offset > 0 {
        file.seek(std::io::SeekFrom::Start(offset))
            .await
            .map_err(&io)?;
    }
    let mut sent = offset;
    let mut buf = vec![0u8; chunk_size];
    while sent < size {
        let want = (size - sent).min(chunk_size as u64) as usize;
        let n = file.read(&mut buf[..want]).await.map_err(&io)?;
        if n == 0 {
            break;
        }
        let bytes = buf[..n].to_vec();
        let checksum = xxh3_64(&bytes);
        tx.send(Message::ChunkData {
            round_id,
            path: wire_key.clone(),
            offset: sent,
            bytes,
            running_checksum: checksum,
        })
        .await
        .map_err(|_| SyncError::Transport("session closed while sending chunks".to_string()))?;
        sent += n as u64;
    }
    Ok(sent)
}

/// Remove a path. Already absent counts as success.
pub async fn apply_delete(root: &Path, key: &PathKey, suppress: &SuppressionSet) -> Result<()> {
    let abs = key.to_absolute(root);
    suppress.insert(key.clone());
    let result = match tokio::fs::symlink_metadata(&abs).await {
        Ok(meta) if meta.is_dir() => tokio::fs::remove_dir_all(&abs).await,
        Ok(_) => tokio::fs::remove_file(&abs).await,
        Err(e) => Err(e),
    };
    match result {
        Ok(()) => Ok(()),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(SyncError::PathIo {
            path: key.clone(),
            source: e,
        }),
    }
}

/// Create a directory (and any missing parents).
pub async fn apply_mkdir(root: &Path, key: &PathKey, suppress: &SuppressionSet) -> Result<()> {
    suppress.insert(key.clone());
    tokio::fs::create_dir_all(key.to_absolute(root))
        .await
        .map_err(path_io(key))
}

/// Install a symlink; the target string is the transferred content.
pub async fn apply_symlink(
    root: &Path,
    key: &PathKey,
    target: &str,
    suppress: &SuppressionSet,
) -> Result<()> {
    let abs = key.to_absolute(root);
    suppress.insert(key.clone());
    match tokio::fs::symlink_metadata(&abs).await {
        Ok(_) => {
            let _ = tokio::fs::remove_file(&abs).await;
        }
        Err(_) => {}
    }
    if let Some(parent) = abs.parent() {
        tokio::fs::create_dir_all(parent)
            .await
            .map_err(path_io(key))?;
    }
    #[cfg(unix)]
    {
        tokio::fs::symlink(target, &abs).await.map_err(path_io(key))
    }
    #[cfg(not(unix))]
    {
        let _ = target;
        Err(SyncError::PathIo {
            path: key.clone(),
            source: std::io::Error::other("symlinks are not supported on this platform"),
        })
    }
}

/// Replay a rename the peer reported, avoiding a content transfer.
pub async fn apply_rename(
    root: &Path,
    from: &PathKey,
    to: &PathKey,
    suppress: &SuppressionSet,
) -> Result<()> {
    let to_abs = to.to_absolute(root);
    if let Some(parent) = to_abs.parent() {
        tokio::fs::create_dir_all(parent).await.map_err(path_io(to))?;
    }
    suppress.insert(from.clone());
    suppress.insert(to.clone());
    tokio::fs::rename(from.to_absolute(root), to_abs)
        .await
        .map_err(path_io(from))
}
