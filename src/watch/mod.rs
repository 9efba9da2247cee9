//! Filesystem watcher: turns kernel notifications into queued changes.
//!
//! Raw notifications are debounced per path, filtered against the
//! suppression set (so the daemon's own writes do not echo back), classified
//! against the baseline and pushed onto the change queue. Trees too large to
//! watch, and platforms where recursive watching fails, degrade to periodic
//! polling.

use notify::event::{EventKind, ModifyKind, RenameMode};
use notify::{RecursiveMode, Watcher};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::{mpsc, Notify};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::config::SyncConfig;
use crate::meta::{scan_root, FileMetadata};
use crate::path::PathKey;
use crate::queue::{ChangeQueue, Origin};
use crate::state::{RawKind, TreeStore};

/// Paths the daemon itself is about to touch. A watcher notification for a
/// suppressed path within the grace window is an echo of our own write and
/// is dropped instead of queued.
pub struct SuppressionSet {
    grace: Duration,
    inner: Mutex<HashMap<PathKey, Instant>>,
}

impl SuppressionSet {
    pub fn new(grace: Duration) -> Self {
        Self {
            grace,
            inner: Mutex::new(HashMap::new()),
        }
    }

    pub fn insert(&self, path: PathKey) {
        self.inner.lock().unwrap().insert(path, Instant::now());
    }

    /// Consume a suppression for `path` if one is still within the grace
    /// window. Expired entries are dropped as they are encountered.
    pub fn take(&self, path: &PathKey) -> bool {
        let mut inner = self.inner.lock().unwrap();
        match inner.remove(path) {
            Some(at) if at.elapsed() <= self.grace => true,
            _ => false,
        }
    }
}

/// Decompose one notification into per-path raw kinds. Renames become a
/// Removed + Created pair; the manifest builder re-pairs them later by
/// content identity, which also covers renames split across two events.
fn raw_events(event: &notify::Event) -> Vec<(PathBuf, RawKind)> {
    match &event.kind {
        EventKind::Create(_) => event
            .paths
            .iter()
            .map(|p| (p.clone(), RawKind::Created))
            .collect(),
        EventKind::Remove(_) => event
            .paths
            .iter()
            .map(|p| (p.clone(), RawKind::Removed))
            .collect(),
        EventKind::Modify(ModifyKind::Name(mode)) => match (mode, event.paths.as_slice()) {
            (RenameMode::Both, [from, to]) => vec![
                (from.clone(), RawKind::Removed),
                (to.clone(), RawKind::Created),
            ],
            (RenameMode::From, paths) => {
                paths.iter().map(|p| (p.clone(), RawKind::Removed)).collect()
            }
            (RenameMode::To, paths) => {
                paths.iter().map(|p| (p.clone(), RawKind::Created)).collect()
            }
            // Unspecified rename halves: existence decides the kind.
            (_, paths) => paths
                .iter()
                .map(|p| {
                    if p.exists() {
                        (p.clone(), RawKind::Created)
                    } else {
                        (p.clone(), RawKind::Removed)
                    }
                })
                .collect(),
        },
        EventKind::Modify(_) => event
            .paths
            .iter()
            .map(|p| (p.clone(), RawKind::Modified))
            .collect(),
        // Access and metadata-only noise carries no tree change.
        _ => Vec::new(),
    }
}

/// Relative key for an absolute path, or None when the path is outside the
/// root or touches an excluded name anywhere in its relative components.
fn to_key(cfg: &SyncConfig, abs: &Path) -> Option<PathKey> {
    let key = PathKey::from_absolute(abs, &cfg.root, cfg.case_insensitive).ok()?;
    if key.as_str().split('/').any(|part| cfg.is_excluded(part)) {
        return None;
    }
    Some(key)
}

/// Merge a raw kind into the pending debounce map. Within one burst the
/// newest observation wins; a Removed followed by a Created is a replacement
/// and stays Created.
fn absorb(pending: &mut HashMap<PathKey, RawKind>, key: PathKey, raw: RawKind) {
    pending.insert(key, raw);
}

/// Diff two poll scans into the same raw events a live watcher would emit.
fn poll_diff(
    prev: &std::collections::BTreeMap<PathKey, FileMetadata>,
    current: &std::collections::BTreeMap<PathKey, FileMetadata>,
) -> Vec<(PathKey, RawKind)> {
    let mut out = Vec::new();
    for (path, meta) in current {
        match prev.get(path) {
            None => out.push((path.clone(), RawKind::Created)),
            Some(old) if !old.same_shape(meta) => out.push((path.clone(), RawKind::Modified)),
            Some(_) => {}
        }
    }
    for path in prev.keys() {
        if !current.contains_key(path) {
            out.push((path.clone(), RawKind::Removed));
        }
    }
    out
}

fn enqueue(
    store: &TreeStore,
    queue: &ChangeQueue,
    suppress: &SuppressionSet,
    wake: &Notify,
    key: PathKey,
    raw: RawKind,
) {
    if suppress.take(&key) {
        debug!("Suppressed echo of own write: {}", key);
        return;
    }
    if let Some(event) = store.classify(key, raw, Origin::Local) {
        debug!("Queued {:?} for {}", event.kind, event.path);
        queue.push(event);
        wake.notify_one();
    }
}

/// Spawn the watcher task for a root. Picks live watching when the tree is
/// small enough and the platform cooperates, polling otherwise.
pub fn spawn(
    cfg: Arc<SyncConfig>,
    store: Arc<TreeStore>,
    queue: Arc<ChangeQueue>,
    suppress: Arc<SuppressionSet>,
    wake: Arc<Notify>,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if store.len() > cfg.max_watched_entries {
            info!(
                "Tree has {} entries (limit {}); watching in poll mode",
                store.len(),
                cfg.max_watched_entries
            );
            poll_loop(&cfg, &store, &queue, &suppress, &wake).await;
            return;
        }

        match notify_loop(&cfg, &store, &queue, &suppress, &wake).await {
            Ok(()) => {}
            Err(e) => {
                warn!("Native file watching unavailable ({}); degrading to poll mode", e);
                poll_loop(&cfg, &store, &queue, &suppress, &wake).await;
            }
        }
    })
}

async fn notify_loop(
    cfg: &SyncConfig,
    store: &TreeStore,
    queue: &ChangeQueue,
    suppress: &SuppressionSet,
    wake: &Notify,
) -> notify::Result<()> {
    let (tx, rx) = mpsc::unbounded_channel();
    let mut watcher = notify::recommended_watcher(move |res: notify::Result<notify::Event>| {
        // Dropped receiver means the daemon is shutting down.
        let _ = tx.send(res);
    })?;
    watcher.watch(&cfg.root, RecursiveMode::Recursive)?;
    info!("Watching {} for changes", cfg.root.display());

    debounce_loop(cfg, store, queue, suppress, wake, rx).await
}

/// Coalesce raw notifications per path and flush on a quiet gap — but no
/// later than a few debounce windows after the first held event, so a tree
/// that never goes quiet cannot starve the queue.
async fn debounce_loop(
    cfg: &SyncConfig,
    store: &TreeStore,
    queue: &ChangeQueue,
    suppress: &SuppressionSet,
    wake: &Notify,
    mut rx: mpsc::UnboundedReceiver<notify::Result<notify::Event>>,
) -> notify::Result<()> {
    let max_hold = cfg.debounce * 4;
    let mut pending: HashMap<PathKey, RawKind> = HashMap::new();
    let mut oldest = Instant::now();

    loop {
        let received = if pending.is_empty() {
            rx.recv().await
        } else if oldest.elapsed() >= max_hold {
            for (key, raw) in pending.drain() {
                enqueue(store, queue, suppress, wake, key, raw);
            }
            continue;
        } else {
            let wait = cfg.debounce.min(max_hold.saturating_sub(oldest.elapsed()));
            match tokio::time::timeout(wait, rx.recv()).await {
                Ok(received) => received,
                Err(_) => {
                    // Burst went quiet (or the hold window expired): flush.
                    for (key, raw) in pending.drain() {
                        enqueue(store, queue, suppress, wake, key, raw);
                    }
                    continue;
                }
            }
        };

        match received {
            Some(Ok(event)) => {
                let was_empty = pending.is_empty();
                for (abs, raw) in raw_events(&event) {
                    if let Some(key) = to_key(cfg, &abs) {
                        absorb(&mut pending, key, raw);
                    }
                }
                if was_empty && !pending.is_empty() {
                    oldest = Instant::now();
                }
            }
            Some(Err(e)) => return Err(e),
            None => return Ok(()),
        }
    }
}

async fn poll_loop(
    cfg: &SyncConfig,
    store: &TreeStore,
    queue: &ChangeQueue,
    suppress: &SuppressionSet,
    wake: &Notify,
) {
    let mut prev = match scan_root(cfg, &cfg.root) {
        Ok(scan) => scan,
        Err(e) => {
            warn!("Initial poll scan failed: {}", e);
            store.baseline()
        }
    };

    loop {
        tokio::time::sleep(cfg.poll_interval).await;
        let current = match scan_root(cfg, &cfg.root) {
            Ok(scan) => scan,
            Err(e) => {
                warn!("Poll scan failed: {}", e);
                continue;
            }
        };
        for (key, raw) in poll_diff(&prev, &current) {
            enqueue(store, queue, suppress, wake, key, raw);
        }
        prev = current;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::EntryKind;
    use crate::path::Endpoint;
    use notify::event::CreateKind;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn cfg() -> SyncConfig {
        SyncConfig::new(PathBuf::from("/sync/root"), Endpoint::parse("host:/peer"))
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
    fn test_suppression_consumed_once() {
        let s = SuppressionSet::new(Duration::from_secs(5));
        s.insert(PathKey::new("a.txt"));
        assert!(s.take(&PathKey::new("a.txt")));
        // Consumed: a genuine later change for the same path queues normally
        assert!(!s.take(&PathKey::new("a.txt")));
    }

    #[test]
    fn test_suppression_expires() {
        let s = SuppressionSet::new(Duration::ZERO);
        s.insert(PathKey::new("a.txt"));
        std::thread::sleep(Duration::from_millis(5));
        assert!(!s.take(&PathKey::new("a.txt")));
    }

    #[test]
    fn test_rename_decomposes_to_remove_and_create() {
        let event = notify::Event {
            kind: EventKind::Modify(ModifyKind::Name(RenameMode::Both)),
            paths: vec![PathBuf::from("/sync/root/old.txt"), PathBuf::from("/sync/root/new.txt")],
            attrs: Default::default(),
        };
        let raw = raw_events(&event);
        assert_eq!(raw.len(), 2);
        assert_eq!(raw[0], (PathBuf::from("/sync/root/old.txt"), RawKind::Removed));
        assert_eq!(raw[1], (PathBuf::from("/sync/root/new.txt"), RawKind::Created));
    }

    #[test]
    fn test_create_event_maps_per_path() {
        let event = notify::Event {
            kind: EventKind::Create(CreateKind::File),
            paths: vec![PathBuf::from("/sync/root/f.txt")],
            attrs: Default::default(),
        };
        assert_eq!(
            raw_events(&event),
            vec![(PathBuf::from("/sync/root/f.txt"), RawKind::Created)]
        );
    }

    #[test]
    fn test_to_key_filters_excluded_and_foreign_paths() {
        let mut cfg = cfg();
        cfg.excludes.push("target".to_string());

        assert_eq!(
            to_key(&cfg, Path::new("/sync/root/src/lib.rs")),
            Some(PathKey::new("src/lib.rs"))
        );
        // Excluded component anywhere in the relative path
        assert_eq!(to_key(&cfg, Path::new("/sync/root/target/debug/x")), None);
        // Daemon-private spool names never queue
        assert_eq!(to_key(&cfg, Path::new("/sync/root/.sinkd-partial-ab")), None);
        // Outside the root entirely
        assert_eq!(to_key(&cfg, Path::new("/elsewhere/f.txt")), None);
    }

    #[test]
    fn test_absorb_newest_wins() {
        let mut pending = HashMap::new();
        absorb(&mut pending, PathKey::new("a.txt"), RawKind::Removed);
        absorb(&mut pending, PathKey::new("a.txt"), RawKind::Created);
        assert_eq!(pending[&PathKey::new("a.txt")], RawKind::Created);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn test_sustained_event_stream_still_flushes() {
        let root = TempDir::new().unwrap();
        let state = TempDir::new().unwrap();
        let mut cfg = SyncConfig::new(root.path().to_path_buf(), Endpoint::parse("host:/peer"));
        cfg.state_dir = Some(state.path().to_path_buf());
        cfg.debounce = Duration::from_millis(20);
        let cfg = Arc::new(cfg);
        let store = Arc::new(TreeStore::open(&cfg).unwrap());
        let queue = Arc::new(ChangeQueue::new());
        let suppress = Arc::new(SuppressionSet::new(Duration::from_secs(5)));
        let wake = Arc::new(Notify::new());

        let (tx, rx) = mpsc::unbounded_channel();
        {
            let (cfg, store, queue) = (cfg.clone(), store.clone(), queue.clone());
            let (suppress, wake) = (suppress.clone(), wake.clone());
            tokio::spawn(async move {
                let _ = debounce_loop(&cfg, &store, &queue, &suppress, &wake, rx).await;
            });
        }

        // Events arrive faster than the debounce window and never go
        // quiet; the hold deadline must flush anyway.
        let hot = root.path().join("hot.txt");
        let mut flushed = false;
        for _ in 0..60 {
            let event = notify::Event {
                kind: EventKind::Create(CreateKind::File),
                paths: vec![hot.clone()],
                attrs: Default::default(),
            };
            tx.send(Ok(event)).unwrap();
            if !queue.is_empty() {
                flushed = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        assert!(flushed, "pending changes starved by a busy event stream");
    }

    #[test]
    fn test_poll_diff() {
        let mut prev = BTreeMap::new();
        let mut current = BTreeMap::new();
        prev.insert(PathKey::new("kept.txt"), file_meta(1, 100));
        current.insert(PathKey::new("kept.txt"), file_meta(1, 100));
        prev.insert(PathKey::new("edited.txt"), file_meta(1, 100));
        current.insert(PathKey::new("edited.txt"), file_meta(2, 200));
        prev.insert(PathKey::new("gone.txt"), file_meta(1, 100));
        current.insert(PathKey::new("new.txt"), file_meta(1, 100));

        let mut diff = poll_diff(&prev, &current);
        diff.sort_by(|a, b| a.0.cmp(&b.0));
        assert_eq!(
            diff,
            vec![
                (PathKey::new("edited.txt"), RawKind::Modified),
                (PathKey::new("gone.txt"), RawKind::Removed),
                (PathKey::new("new.txt"), RawKind::Created),
            ]
        );
    }
}
