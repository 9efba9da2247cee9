//! Tree State Store: the persisted sync baseline for one root pair.
//!
//! The snapshot is the last state both sides are known to agree on. It is
//! the only resource mutated by multiple components, and all mutation goes
//! through [`TreeStore::commit`]; everything else reads. Commits are
//! crash-safe: a write-ahead journal entry is persisted before the snapshot
//! is touched, and an interrupted commit is replayed on the next open.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs::{File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use std::time::SystemTime;

use crate::config::SyncConfig;
use crate::error::{Result, SyncError};
use crate::meta::FileMetadata;
use crate::path::PathKey;
use crate::queue::{ChangeEvent, ChangeKind, Origin};

const SNAPSHOT_VERSION: u32 = 1;

/// Raw watcher notification kind, before classification against the
/// baseline. Renames arrive decomposed as Removed + Created; the manifest
/// builder re-pairs them via [`detect_renames`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RawKind {
    Created,
    Modified,
    Removed,
}

#[derive(Debug, Serialize, Deserialize)]
struct SnapshotFile {
    version: u32,
    entries: BTreeMap<PathKey, FileMetadata>,
}

#[derive(Debug, Serialize, Deserialize)]
struct JournalEntry {
    round_id: u64,
    committed_at: String,
    updates: Vec<(PathKey, FileMetadata)>,
}

pub struct TreeStore {
    snapshot_path: PathBuf,
    journal_path: PathBuf,
    snapshot: RwLock<BTreeMap<PathKey, FileMetadata>>,
}

impl TreeStore {
    /// Open the store for a root pair, replaying any interrupted commit.
    pub fn open(cfg: &SyncConfig) -> Result<Self> {
        let dir = cfg.state_dir()?;
        let pair = cfg.pair_id();
        let snapshot_path = dir.join(format!("{}.snapshot.json", pair));
        let journal_path = dir.join(format!("{}.journal.jsonl", pair));

        let mut entries = load_snapshot(&snapshot_path)?;

        if journal_path.exists() {
            let replayed = replay_journal(&journal_path, &mut entries)?;
            if replayed > 0 {
                tracing::info!(
                    "Replayed {} journaled update(s) from an interrupted commit",
                    replayed
                );
            }
            persist_snapshot(&snapshot_path, &entries)?;
            std::fs::remove_file(&journal_path).map_err(|e| SyncError::Journal {
                path: journal_path.clone(),
                source: e,
            })?;
        }

        Ok(Self {
            snapshot_path,
            journal_path,
            snapshot: RwLock::new(entries),
        })
    }

    /// Baseline metadata for a path, if the path is part of the baseline.
    pub fn get(&self, path: &PathKey) -> Option<FileMetadata> {
        self.snapshot.read().unwrap().get(path).cloned()
    }

    pub fn len(&self) -> usize {
        self.snapshot.read().unwrap().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Clone of the full baseline, for manifests and reconciliation.
    pub fn baseline(&self) -> BTreeMap<PathKey, FileMetadata> {
        self.snapshot.read().unwrap().clone()
    }

    /// Turn a raw notification into a semantic change by comparing against
    /// the baseline. Returns None for notifications that carry no
    /// information (e.g. deletion of a path we never knew about).
    pub fn classify(&self, path: PathKey, raw: RawKind, origin: Origin) -> Option<ChangeEvent> {
        let known = self.get(&path).is_some();
        let kind = match raw {
            RawKind::Removed => {
                if known {
                    ChangeKind::Deleted
                } else {
                    return None;
                }
            }
            RawKind::Created | RawKind::Modified => {
                if known {
                    ChangeKind::Modified
                } else {
                    ChangeKind::Created
                }
            }
        };
        Some(ChangeEvent {
            path,
            kind,
            observed: SystemTime::now(),
            origin,
        })
    }

    /// True when the baseline already reflects `target`, i.e. replaying the
    /// action that produced it would be a no-op.
    pub fn already_applied(&self, path: &PathKey, target: &FileMetadata) -> bool {
        match self.get(path) {
            None => target.is_deleted(),
            Some(current) => !target.is_deleted() && current.same_shape(target),
        }
    }

    /// Atomically apply a round's confirmed updates. Tombstones remove
    /// entries, everything else upserts. Journal first, then snapshot.
    pub fn commit(&self, round_id: u64, updates: &[(PathKey, FileMetadata)]) -> Result<()> {
        if updates.is_empty() {
            return Ok(());
        }

        self.append_journal(round_id, updates)?;

        let mut snapshot = self.snapshot.write().unwrap();
        apply_updates(&mut snapshot, updates);
        persist_snapshot(&self.snapshot_path, &snapshot)?;
        drop(snapshot);

        std::fs::remove_file(&self.journal_path).map_err(|e| SyncError::Journal {
            path: self.journal_path.clone(),
            source: e,
        })?;

        tracing::debug!("Committed round {} ({} path(s))", round_id, updates.len());
        Ok(())
    }

    fn append_journal(&self, round_id: u64, updates: &[(PathKey, FileMetadata)]) -> Result<()> {
        let journal = |e| SyncError::Journal {
            path: self.journal_path.clone(),
            source: e,
        };
        let entry = JournalEntry {
            round_id,
            committed_at: chrono::Utc::now().to_rfc3339(),
            updates: updates.to_vec(),
        };
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.journal_path)
            .map_err(journal)?;
        let mut writer = BufWriter::new(file);
        let line = serde_json::to_string(&entry)
            .map_err(|e| journal(std::io::Error::other(e.to_string())))?;
        writeln!(writer, "{}", line).map_err(journal)?;
        writer.flush().map_err(journal)?;
        writer.get_ref().sync_all().map_err(journal)?;
        Ok(())
    }
}

fn apply_updates(snapshot: &mut BTreeMap<PathKey, FileMetadata>, updates: &[(PathKey, FileMetadata)]) {
    for (path, meta) in updates {
        if meta.is_deleted() {
            snapshot.remove(path);
        } else {
            snapshot.insert(path.clone(), meta.clone());
        }
    }
}

fn load_snapshot(path: &Path) -> Result<BTreeMap<PathKey, FileMetadata>> {
    if !path.exists() {
        return Ok(BTreeMap::new());
    }
    let file = File::open(path)?;
    let parsed: std::result::Result<SnapshotFile, _> = serde_json::from_reader(BufReader::new(file));
    match parsed {
        Ok(snap) if snap.version == SNAPSHOT_VERSION => Ok(snap.entries),
        Ok(snap) => {
            tracing::warn!(
                "Snapshot version mismatch (expected {}, got {}); starting from an empty baseline",
                SNAPSHOT_VERSION,
                snap.version
            );
            Ok(BTreeMap::new())
        }
        Err(e) => {
            tracing::warn!("Corrupted snapshot file ({}); starting from an empty baseline", e);
            Ok(BTreeMap::new())
        }
    }
}

/// Atomic replace-on-commit: write to a temp file, then rename over.
fn persist_snapshot(path: &Path, entries: &BTreeMap<PathKey, FileMetadata>) -> Result<()> {
    let journal = |e: std::io::Error| SyncError::Journal {
        path: path.to_path_buf(),
        source: e,
    };
    let tmp = path.with_extension("json.tmp");
    let file = File::create(&tmp).map_err(journal)?;
    let mut writer = BufWriter::new(file);
    let snap = SnapshotFile {
        version: SNAPSHOT_VERSION,
        entries: entries.clone(),
    };
    serde_json::to_writer(&mut writer, &snap)
        .map_err(|e| journal(std::io::Error::other(e.to_string())))?;
    writer.flush().map_err(journal)?;
    writer.get_ref().sync_all().map_err(journal)?;
    std::fs::rename(&tmp, path).map_err(journal)?;
    Ok(())
}

fn replay_journal(path: &Path, entries: &mut BTreeMap<PathKey, FileMetadata>) -> Result<usize> {
    let file = File::open(path).map_err(|e| SyncError::Journal {
        path: path.to_path_buf(),
        source: e,
    })?;
    let mut replayed = 0;
    for line in BufReader::new(file).lines() {
        let line = line.map_err(|e| SyncError::Journal {
            path: path.to_path_buf(),
            source: e,
        })?;
        if line.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<JournalEntry>(&line) {
            Ok(entry) => {
                apply_updates(entries, &entry.updates);
                replayed += entry.updates.len();
            }
            // A torn final line means the crash happened mid-append, before
            // the snapshot was touched; nothing to replay for it.
            Err(e) => {
                tracing::warn!("Discarding torn journal line: {}", e);
            }
        }
    }
    Ok(replayed)
}

/// Paths whose metadata differs between two tree views (presence included).
pub fn diverged(
    a: &BTreeMap<PathKey, FileMetadata>,
    b: &BTreeMap<PathKey, FileMetadata>,
) -> Vec<PathKey> {
    let mut out = Vec::new();
    for (path, meta) in a {
        match b.get(path) {
            Some(other) if meta.same_shape(other) => {}
            _ => out.push(path.clone()),
        }
    }
    for path in b.keys() {
        if !a.contains_key(path) {
            out.push(path.clone());
        }
    }
    out.sort();
    out.dedup();
    out
}

/// Rename heuristic: pair a disappeared path with an appeared path when
/// content hash and size match within the same round; ties broken by the
/// closest modification time. A path that cannot be paired stays a plain
/// delete + create.
pub fn detect_renames(
    disappeared: &[(PathKey, FileMetadata)],
    appeared: &[(PathKey, FileMetadata)],
) -> Vec<(PathKey, PathKey)> {
    let mut pairs = Vec::new();
    let mut used = vec![false; disappeared.len()];

    for (to, new_meta) in appeared {
        let Some(new_hash) = new_meta.content_hash.as_deref() else {
            continue;
        };
        let mut best: Option<(usize, i64)> = None;
        for (i, (_, old_meta)) in disappeared.iter().enumerate() {
            if used[i] {
                continue;
            }
            if old_meta.size != new_meta.size {
                continue;
            }
            if old_meta.content_hash.as_deref() != Some(new_hash) {
                continue;
            }
            let distance = (old_meta.modified - new_meta.modified).abs();
            if best.map(|(_, d)| distance < d).unwrap_or(true) {
                best = Some((i, distance));
            }
        }
        if let Some((i, _)) = best {
            used[i] = true;
            pairs.push((disappeared[i].0.clone(), to.clone()));
        }
    }

    pairs
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::EntryKind;
    use crate::path::Endpoint;
    use tempfile::TempDir;

    fn test_store(root: &TempDir, state: &TempDir) -> (SyncConfig, TreeStore) {
        let mut cfg = SyncConfig::new(
            root.path().to_path_buf(),
            Endpoint::parse("host:/peer"),
        );
        cfg.state_dir = Some(state.path().to_path_buf());
        let store = TreeStore::open(&cfg).unwrap();
        (cfg, store)
    }

    fn file_meta(size: u64, mtime: i64) -> FileMetadata {
        FileMetadata {
            size,
            modified: mtime,
            content_hash: None,
            kind: EntryKind::File,
        }
    }

    #[test]
    fn test_commit_and_reload() {
        let root = TempDir::new().unwrap();
        let state = TempDir::new().unwrap();
        let (cfg, store) = test_store(&root, &state);

        store
            .commit(
                1,
                &[
                    (PathKey::new("a.txt"), file_meta(10, 100)),
                    (PathKey::new("b.txt"), file_meta(20, 200)),
                ],
            )
            .unwrap();
        assert_eq!(store.len(), 2);
        drop(store);

        let store = TreeStore::open(&cfg).unwrap();
        assert_eq!(store.len(), 2);
        assert_eq!(store.get(&PathKey::new("a.txt")).unwrap().size, 10);
    }

    #[test]
    fn test_tombstone_removes_entry() {
        let root = TempDir::new().unwrap();
        let state = TempDir::new().unwrap();
        let (_cfg, store) = test_store(&root, &state);

        store
            .commit(1, &[(PathKey::new("a.txt"), file_meta(10, 100))])
            .unwrap();
        store
            .commit(2, &[(PathKey::new("a.txt"), FileMetadata::tombstone())])
            .unwrap();
        assert!(store.get(&PathKey::new("a.txt")).is_none());
        assert!(store.is_empty());
    }

    #[test]
    fn test_journal_replay_finishes_interrupted_commit() {
        let root = TempDir::new().unwrap();
        let state = TempDir::new().unwrap();
        let (cfg, store) = test_store(&root, &state);

        store
            .commit(1, &[(PathKey::new("a.txt"), file_meta(10, 100))])
            .unwrap();

        // Simulate a crash after journal append but before snapshot write.
        let journal_path = state
            .path()
            .join(format!("{}.journal.jsonl", cfg.pair_id()));
        let entry = JournalEntry {
            round_id: 2,
            committed_at: chrono::Utc::now().to_rfc3339(),
            updates: vec![(PathKey::new("b.txt"), file_meta(20, 200))],
        };
        std::fs::write(
            &journal_path,
            format!("{}\n", serde_json::to_string(&entry).unwrap()),
        )
        .unwrap();
        drop(store);

        let store = TreeStore::open(&cfg).unwrap();
        assert_eq!(store.len(), 2);
        assert!(store.get(&PathKey::new("b.txt")).is_some());
        assert!(!journal_path.exists());
    }

    #[test]
    fn test_torn_journal_line_discarded() {
        let root = TempDir::new().unwrap();
        let state = TempDir::new().unwrap();
        let (cfg, store) = test_store(&root, &state);
        drop(store);

        let journal_path = state
            .path()
            .join(format!("{}.journal.jsonl", cfg.pair_id()));
        std::fs::write(&journal_path, "{\"round_id\":3,\"committed").unwrap();

        let store = TreeStore::open(&cfg).unwrap();
        assert!(store.is_empty());
        assert!(!journal_path.exists());
    }

    #[test]
    fn test_classify_against_baseline() {
        let root = TempDir::new().unwrap();
        let state = TempDir::new().unwrap();
        let (_cfg, store) = test_store(&root, &state);
        store
            .commit(1, &[(PathKey::new("known.txt"), file_meta(10, 100))])
            .unwrap();

        // Modified notification for an unknown path becomes Created
        let ev = store
            .classify(PathKey::new("new.txt"), RawKind::Modified, Origin::Local)
            .unwrap();
        assert_eq!(ev.kind, ChangeKind::Created);

        // Created notification for a known path becomes Modified
        let ev = store
            .classify(PathKey::new("known.txt"), RawKind::Created, Origin::Local)
            .unwrap();
        assert_eq!(ev.kind, ChangeKind::Modified);

        // Removal of a known path is a deletion
        let ev = store
            .classify(PathKey::new("known.txt"), RawKind::Removed, Origin::Local)
            .unwrap();
        assert_eq!(ev.kind, ChangeKind::Deleted);

        // Removal of an unknown path carries no information
        assert!(store
            .classify(PathKey::new("ghost.txt"), RawKind::Removed, Origin::Local)
            .is_none());
    }

    #[test]
    fn test_already_applied() {
        let root = TempDir::new().unwrap();
        let state = TempDir::new().unwrap();
        let (_cfg, store) = test_store(&root, &state);
        let meta = file_meta(10, 100);
        store
            .commit(1, &[(PathKey::new("a.txt"), meta.clone())])
            .unwrap();

        assert!(store.already_applied(&PathKey::new("a.txt"), &meta));
        assert!(!store.already_applied(&PathKey::new("a.txt"), &file_meta(11, 100)));
        assert!(store.already_applied(&PathKey::new("gone.txt"), &FileMetadata::tombstone()));
        assert!(!store.already_applied(&PathKey::new("a.txt"), &FileMetadata::tombstone()));
    }

    #[test]
    fn test_diverged() {
        let mut a = BTreeMap::new();
        let mut b = BTreeMap::new();
        a.insert(PathKey::new("same.txt"), file_meta(1, 1));
        b.insert(PathKey::new("same.txt"), file_meta(1, 1));
        a.insert(PathKey::new("changed.txt"), file_meta(1, 1));
        b.insert(PathKey::new("changed.txt"), file_meta(2, 2));
        a.insert(PathKey::new("only-a.txt"), file_meta(1, 1));
        b.insert(PathKey::new("only-b.txt"), file_meta(1, 1));

        let diff = diverged(&a, &b);
        assert_eq!(
            diff,
            vec![
                PathKey::new("changed.txt"),
                PathKey::new("only-a.txt"),
                PathKey::new("only-b.txt"),
            ]
        );
    }

    #[test]
    fn test_detect_renames_by_hash_and_size() {
        let mut old = file_meta(100, 1000);
        old.content_hash = Some("abc".to_string());
        let mut new = file_meta(100, 1001);
        new.content_hash = Some("abc".to_string());

        let pairs = detect_renames(
            &[(PathKey::new("old/name.txt"), old)],
            &[(PathKey::new("new/name.txt"), new)],
        );
        assert_eq!(
            pairs,
            vec![(PathKey::new("old/name.txt"), PathKey::new("new/name.txt"))]
        );
    }

    #[test]
    fn test_detect_renames_tie_broken_by_mtime() {
        let mut near = file_meta(100, 1000);
        near.content_hash = Some("abc".to_string());
        let mut far = file_meta(100, 50);
        far.content_hash = Some("abc".to_string());
        let mut new = file_meta(100, 1001);
        new.content_hash = Some("abc".to_string());

        let pairs = detect_renames(
            &[
                (PathKey::new("far.txt"), far),
                (PathKey::new("near.txt"), near),
            ],
            &[(PathKey::new("moved.txt"), new)],
        );
        assert_eq!(pairs[0].0, PathKey::new("near.txt"));
    }

    #[test]
    fn test_detect_renames_needs_hashes() {
        let old = file_meta(100, 1000);
        let new = file_meta(100, 1001);
        let pairs = detect_renames(
            &[(PathKey::new("a.txt"), old)],
            &[(PathKey::new("b.txt"), new)],
        );
        assert!(pairs.is_empty());
    }
}
