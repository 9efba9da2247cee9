use serde::{Deserialize, Serialize};
use std::collections::{HashMap, VecDeque};
use std::sync::Mutex;
use std::time::SystemTime;

use crate::path::PathKey;

/// Semantic change kind, after classification against the baseline.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum ChangeKind {
    Created,
    Modified,
    Deleted,
    Renamed { from: PathKey },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Local,
    Remote,
}

/// One pending change. Ephemeral: lives in the queue until a sync round
/// consumes it.
#[derive(Debug, Clone)]
pub struct ChangeEvent {
    pub path: PathKey,
    pub kind: ChangeKind,
    pub observed: SystemTime,
    pub origin: Origin,
}

#[derive(Default)]
struct QueueInner {
    /// Insertion order of live keys. May contain stale keys for entries
    /// that were coalesced away; drain skips them.
    order: VecDeque<PathKey>,
    entries: HashMap<PathKey, ChangeEvent>,
}

/// Deduplicating, insertion-ordered buffer of pending changes.
///
/// Keyed by path: a later event for the same path replaces the earlier
/// pending one in place, keeping its queue position. A `Deleted` arriving
/// while a `Created` for the same path is still pending (never transferred)
/// annihilates the pair entirely.
///
/// All operations are short critical sections; nothing awaits while the
/// lock is held.
pub struct ChangeQueue {
    inner: Mutex<QueueInner>,
}

impl ChangeQueue {
    pub fn new() -> Self {
        Self {
            inner: Mutex::new(QueueInner::default()),
        }
    }

    pub fn push(&self, event: ChangeEvent) {
        let mut inner = self.inner.lock().unwrap();
        match inner.entries.get(&event.path) {
            Some(pending)
                if matches!(pending.kind, ChangeKind::Created)
                    && matches!(event.kind, ChangeKind::Deleted) =>
            {
                // Created then deleted before any round saw it: a no-op.
                inner.entries.remove(&event.path);
            }
            Some(_) => {
                // Coalesce: keep queue position, replace payload.
                inner.entries.insert(event.path.clone(), event);
            }
            None => {
                inner.order.push_back(event.path.clone());
                inner.entries.insert(event.path.clone(), event);
            }
        }
    }

    /// Remove and return up to `max` oldest entries for the next round.
    pub fn drain_batch(&self, max: usize) -> Vec<ChangeEvent> {
        let mut inner = self.inner.lock().unwrap();
        let mut batch = Vec::new();
        while batch.len() < max {
            let Some(key) = inner.order.pop_front() else {
                break;
            };
            if let Some(event) = inner.entries.remove(&key) {
                batch.push(event);
            }
            // Stale order slots (coalesced twice, annihilated) are skipped.
        }
        batch
    }

    /// Return entries from a failed round to the front of the queue,
    /// preserving their relative order. An entry that was re-observed while
    /// the round ran keeps the fresher payload already queued.
    pub fn requeue_front(&self, events: Vec<ChangeEvent>) {
        let mut inner = self.inner.lock().unwrap();
        for event in events.into_iter().rev() {
            if inner.entries.contains_key(&event.path) {
                continue;
            }
            inner.order.push_front(event.path.clone());
            inner.entries.insert(event.path.clone(), event);
        }
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ChangeQueue {
    fn default() -> Self {
        Self::new()
    }
}
