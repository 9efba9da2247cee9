//! Daemon wiring: shared core state, startup reconciliation, and the
//! server/client connection loops.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::Notify;
use tracing::{info, warn};
use xxhash_rust::xxh3::xxh3_64;

use crate::config::SyncConfig;
use crate::error::Result;
use crate::meta::{now_nanos, scan_root};
use crate::path::PathKey;
use crate::protocol::session::Session;
use crate::queue::{ChangeQueue, Origin};
use crate::state::{diverged, RawKind, TreeStore};
use crate::watch::{self, SuppressionSet};

/// Echo window for the daemon's own filesystem writes.
const ECHO_GRACE: Duration = Duration::from_secs(5);

const RECONNECT_FLOOR: Duration = Duration::from_secs(1);
const RECONNECT_CEIL: Duration = Duration::from_secs(60);

/// Everything a session and the watcher share for one synchronized root.
/// The tree store is the only mutable resource; it guards itself.
pub struct SyncCore {
    pub cfg: Arc<SyncConfig>,
    pub store: Arc<TreeStore>,
    pub queue: Arc<ChangeQueue>,
    pub suppress: Arc<SuppressionSet>,
    pub wake: Arc<Notify>,
    /// Stable for the process lifetime; breaks round-initiation ties.
    pub identity: String,
    next_round: AtomicU64,
    /// Consecutive failed-push counts per path. A push that the peer could
    /// not verify is retried once; a second failure surfaces instead.
    push_failures: Mutex<HashMap<PathKey, u32>>,
}

impl SyncCore {
    pub fn new(cfg: SyncConfig) -> Result<Self> {
        cfg.validate()?;
        let store = TreeStore::open(&cfg)?;
        let identity = format!(
            "{:016x}",
            xxh3_64(
                format!(
                    "{}|{}|{}",
                    cfg.root.display(),
                    std::process::id(),
                    now_nanos()
                )
                .as_bytes()
            )
        );
        Ok(Self {
            cfg: Arc::new(cfg),
            store: Arc::new(store),
            queue: Arc::new(ChangeQueue::new()),
            suppress: Arc::new(SuppressionSet::new(ECHO_GRACE)),
            wake: Arc::new(Notify::new()),
            identity,
            next_round: AtomicU64::new(1),
            push_failures: Mutex::new(HashMap::new()),
        })
    }

    pub fn next_round_id(&self) -> u64 {
        self.next_round.fetch_add(1, Ordering::Relaxed)
    }

    /// Count a failed push for `path`. Returns true when it should be
    /// re-offered once more, false when the retry has been spent.
    pub fn note_push_failure(&self, path: &PathKey) -> bool {
        let mut failures = self.push_failures.lock().unwrap();
        let count = failures.entry(path.clone()).or_insert(0);
        *count += 1;
        *count <= 1
    }

    /// A push for `path` was confirmed (or given up on); later failures
    /// start a fresh retry budget.
    pub fn clear_push_failure(&self, path: &PathKey) {
        self.push_failures.lock().unwrap().remove(path);
    }

    /// Queue everything that changed while the daemon was not running, by
    /// diffing the current tree against the persisted baseline.
    pub fn reconcile_startup(&self) -> Result<usize> {
        let scan = scan_root(&self.cfg, &self.cfg.root)?;
        let baseline = self.store.baseline();
        let mut queued = 0;
        for path in diverged(&baseline, &scan) {
            let raw = if scan.contains_key(&path) {
                RawKind::Modified
            } else {
                RawKind::Removed
            };
            if let Some(event) = self.store.classify(path, raw, Origin::Local) {
                self.queue.push(event);
                queued += 1;
            }
        }
        if queued > 0 {
            info!("Queued {} offline change(s) found at startup", queued);
            self.wake.notify_one();
        }
        Ok(queued)
    }

    fn spawn_watcher(self: &Arc<Self>) {
        watch::spawn(
            self.cfg.clone(),
            self.store.clone(),
            self.queue.clone(),
            self.suppress.clone(),
            self.wake.clone(),
        );
    }
}

/// Listening side: accept one peer at a time and serve sessions until the
/// process is stopped. The peer reconnects after failures.
pub async fn run_server(cfg: SyncConfig, listen: SocketAddr) -> Result<()> {
    let core = Arc::new(SyncCore::new(cfg)?);
    core.reconcile_startup()?;
    core.spawn_watcher();

    let listener = TcpListener::bind(listen).await?;
    info!(
        "Serving {} on {}",
        core.cfg.root.display(),
        listener.local_addr()?
    );

    loop {
        let (stream, addr) = listener.accept().await?;
        info!("Peer connected from {}", addr);
        stream.set_nodelay(true)?;
        match Session::establish(core.clone(), stream).await {
            Ok(session) => {
                if let Err(e) = session.run(false).await {
                    warn!("Session with {} ended: {}", addr, e);
                }
            }
            Err(e) => warn!("Handshake with {} failed: {}", addr, e),
        }
    }
}

/// Connecting side: dial the peer daemon and keep the session alive,
/// reconnecting with exponential backoff.
pub async fn run_client(cfg: SyncConfig, addr: String) -> Result<()> {
    let core = Arc::new(SyncCore::new(cfg)?);
    core.reconcile_startup()?;
    core.spawn_watcher();

    let mut backoff = RECONNECT_FLOOR;
    loop {
        match TcpStream::connect(&addr).await {
            Ok(stream) => {
                info!("Connected to {}", addr);
                stream.set_nodelay(true)?;
                backoff = RECONNECT_FLOOR;
                match Session::establish(core.clone(), stream).await {
                    Ok(session) => {
                        // Open with a full round to fold in whatever
                        // happened while disconnected.
                        if let Err(e) = session.run(true).await {
                            warn!("Session ended: {}", e);
                        }
                    }
                    Err(e) => warn!("Handshake failed: {}", e),
                }
            }
            Err(e) => warn!("Cannot reach {}: {}", addr, e),
        }
        info!("Reconnecting in {:?}", backoff);
        tokio::time::sleep(backoff).await;
        backoff = (backoff * 2).min(RECONNECT_CEIL);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::meta::FileMetadata;
    use crate::path::{Endpoint, PathKey};
    use crate::queue::ChangeKind;
    use std::fs;
    use tempfile::TempDir;

    fn core_for(root: &TempDir, state: &TempDir) -> Arc<SyncCore> {
        let mut cfg = SyncConfig::new(root.path().to_path_buf(), Endpoint::parse("host:/peer"));
        cfg.state_dir = Some(state.path().to_path_buf());
        Arc::new(SyncCore::new(cfg).unwrap())
    }

    #[test]
    fn test_round_ids_are_monotonic() {
        let root = TempDir::new().unwrap();
        let state = TempDir::new().unwrap();
        let core = core_for(&root, &state);
        let a = core.next_round_id();
        let b = core.next_round_id();
        assert!(b > a);
    }

    #[test]
    fn test_push_failure_budget_is_one_retry() {
        let root = TempDir::new().unwrap();
        let state = TempDir::new().unwrap();
        let core = core_for(&root, &state);
        let key = PathKey::new("flaky.txt");

        assert!(core.note_push_failure(&key));
        assert!(!core.note_push_failure(&key));

        // A confirmed push starts a fresh budget.
        core.clear_push_failure(&key);
        assert!(core.note_push_failure(&key));
    }

    #[test]
    fn test_reconcile_startup_queues_offline_changes() {
        let root = TempDir::new().unwrap();
        let state = TempDir::new().unwrap();
        let core = core_for(&root, &state);

        // Baseline knows a file that is gone, and the tree has a new one.
        core.store
            .commit(
                1,
                &[(
                    PathKey::new("removed-offline.txt"),
                    FileMetadata {
                        size: 1,
                        modified: 1,
                        content_hash: None,
                        kind: crate::meta::EntryKind::File,
                    },
                )],
            )
            .unwrap();
        fs::write(root.path().join("added-offline.txt"), "x").unwrap();

        let queued = core.reconcile_startup().unwrap();
        assert_eq!(queued, 2);

        let batch = core.queue.drain_batch(10);
        let kinds: Vec<_> = batch.iter().map(|e| (e.path.as_str(), &e.kind)).collect();
        assert!(kinds.contains(&("added-offline.txt", &ChangeKind::Created)));
        assert!(kinds.contains(&("removed-offline.txt", &ChangeKind::Deleted)));
    }

    #[test]
    fn test_reconcile_startup_clean_tree_queues_nothing() {
        let root = TempDir::new().unwrap();
        let state = TempDir::new().unwrap();
        let core = core_for(&root, &state);
        assert_eq!(core.reconcile_startup().unwrap(), 0);
        assert!(core.queue.is_empty());
    }
}
