use chrono::{TimeZone, Utc};
use serde::{Deserialize, Serialize};

use crate::config::{ContentPolicy, DeletePolicy, SyncConfig};
use crate::meta::{EntryKind, FileMetadata};
use crate::path::PathKey;

/// Per-path outcome of a negotiation, expressed in the frame of the node
/// executing the plan: "local" is that node's own tree, "remote" is its
/// peer. `invert` re-expresses an action for the other side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Decision {
    /// Install the peer's version locally (content flows peer -> us).
    PullFromRemote,
    /// The peer installs our version in its local tree (content flows us -> peer).
    PushToLocal,
    DeleteLocal,
    DeleteRemote,
    /// Preserve both versions under conflict names; the original path ends
    /// absent on both sides and no content is lost.
    KeepBothRenamed,
    /// Already converged; commit metadata only.
    NoOp,
}

impl Decision {
    pub fn invert(self) -> Self {
        match self {
            Decision::PullFromRemote => Decision::PushToLocal,
            Decision::PushToLocal => Decision::PullFromRemote,
            Decision::DeleteLocal => Decision::DeleteRemote,
            Decision::DeleteRemote => Decision::DeleteLocal,
            other => other,
        }
    }
}

/// A resolved per-path action. Produced by the resolver, consumed by the
/// transfer engine.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ResolvedAction {
    pub path: PathKey,
    pub decision: Decision,
    /// The subject version: for pulls, what we will receive and verify; for
    /// pushes, what the peer will receive; for conflicts, our own version.
    pub meta: FileMetadata,
    /// The peer's version, carried only for conflict preservation.
    pub theirs: Option<FileMetadata>,
    /// Bytes this side already has staged for its inbound transfer of this
    /// action; the peer starts sending from here. 0 for fresh transfers.
    pub resume_offset: u64,
    /// The peer's staged byte count for its inbound transfer; this side
    /// starts sending from here. Filled during negotiation.
    pub theirs_resume_offset: u64,
    /// Set when the peer reported a rename this side can replay locally
    /// without content transfer.
    pub rename_from: Option<PathKey>,
}

impl ResolvedAction {
    pub fn new(path: PathKey, decision: Decision, meta: FileMetadata) -> Self {
        Self {
            path,
            decision,
            meta,
            theirs: None,
            resume_offset: 0,
            theirs_resume_offset: 0,
            rename_from: None,
        }
    }

    /// Re-express this action in the peer's frame.
    pub fn invert(mut self) -> Self {
        self.decision = self.decision.invert();
        if self.decision == Decision::KeepBothRenamed {
            if let Some(theirs) = self.theirs.take() {
                self.theirs = Some(std::mem::replace(&mut self.meta, theirs));
            }
        }
        std::mem::swap(&mut self.resume_offset, &mut self.theirs_resume_offset);
        self
    }
}

/// Conflict-preserving name for a losing version, derived from that
/// version's own modification time so the two sides produce distinct names.
pub fn conflict_filename(path: &PathKey, modified_nanos: i64) -> PathKey {
    let secs = modified_nanos.div_euclid(1_000_000_000);
    let nanos = modified_nanos.rem_euclid(1_000_000_000) as u32;
    let ts = Utc
        .timestamp_opt(secs, nanos)
        .single()
        .unwrap_or_else(|| Utc.timestamp_opt(0, 0).unwrap());
    PathKey::new(format!(
        "{}.conflict-{}",
        path.as_str(),
        ts.format("%Y%m%dT%H%M%S%.9f")
    ))
}

fn changed(current: Option<&FileMetadata>, baseline: Option<&FileMetadata>) -> bool {
    match (current, baseline) {
        (None, None) => false,
        (None, Some(b)) => !b.is_deleted(),
        (Some(c), None) => !c.is_deleted(),
        (Some(c), Some(b)) => !c.same_shape(b),
    }
}

fn present(meta: Option<&FileMetadata>) -> Option<&FileMetadata> {
    meta.filter(|m| !m.is_deleted())
}

/// Content equality for both-changed paths. Hashes must already be present
/// for file entries; a missing hash compares as unequal, which errs toward
/// preserving both versions.
fn content_equal(a: &FileMetadata, b: &FileMetadata) -> bool {
    match (&a.kind, &b.kind) {
        (EntryKind::File, EntryKind::File) => match (&a.content_hash, &b.content_hash) {
            (Some(x), Some(y)) => x == y,
            _ => false,
        },
        (EntryKind::Symlink { target: x }, EntryKind::Symlink { target: y }) => x == y,
        (EntryKind::Directory, EntryKind::Directory) => true,
        _ => false,
    }
}

/// Decides, for a path in the divergence set, which version wins or how
/// both are preserved. Total over its input domain: every combination of
/// baseline/local/remote produces a decision.
pub struct Resolver<'a> {
    cfg: &'a SyncConfig,
}

impl<'a> Resolver<'a> {
    pub fn new(cfg: &'a SyncConfig) -> Self {
        Self { cfg }
    }

    /// `local` and `remote` are the current versions (None or a tombstone
    /// for absent); `baseline` is the last agreed state. Runs in the frame
    /// of the node calling it.
    pub fn resolve(
        &self,
        path: &PathKey,
        baseline: Option<&FileMetadata>,
        local: Option<&FileMetadata>,
        remote: Option<&FileMetadata>,
    ) -> ResolvedAction {
        let local_changed = changed(local, baseline);
        let remote_changed = changed(remote, baseline);
        let local_live = present(local);
        let remote_live = present(remote);

        // Stand-in tombstone for a side that is simply absent (no explicit
        // deletion record, e.g. missing from a full manifest). The deletion
        // happened at some unknown point since the baseline, so the
        // baseline mtime is the honest stamp; stamping "now" would let a
        // stale deletion outrank a genuinely newer edit under the grace
        // comparison.
        let absent = || FileMetadata::tombstone_at(baseline.map(|b| b.modified).unwrap_or(0));

        // Only one side moved since baseline: that side wins outright.
        if !local_changed && !remote_changed {
            let meta = local_live.cloned().unwrap_or_else(FileMetadata::tombstone);
            return ResolvedAction::new(path.clone(), Decision::NoOp, meta);
        }
        if !local_changed {
            return match remote_live {
                Some(m) => ResolvedAction::new(path.clone(), Decision::PullFromRemote, m.clone()),
                None => ResolvedAction::new(
                    path.clone(),
                    Decision::DeleteLocal,
                    remote.cloned().unwrap_or_else(absent),
                ),
            };
        }
        if !remote_changed {
            return match local_live {
                Some(m) => ResolvedAction::new(path.clone(), Decision::PushToLocal, m.clone()),
                None => ResolvedAction::new(
                    path.clone(),
                    Decision::DeleteRemote,
                    local.cloned().unwrap_or_else(absent),
                ),
            };
        }

        // Both sides changed.
        match (local_live, remote_live) {
            (None, None) => {
                // Deleted on both: converged, commit the tombstone.
                ResolvedAction::new(path.clone(), Decision::NoOp, FileMetadata::tombstone())
            }
            (Some(ours), Some(theirs)) => {
                if content_equal(ours, theirs) {
                    return ResolvedAction::new(path.clone(), Decision::NoOp, ours.clone());
                }
                self.resolve_content_conflict(path, ours, theirs)
            }
            (Some(edit), None) => {
                self.resolve_edit_vs_delete(path, edit, remote.cloned().unwrap_or_else(absent), true)
            }
            (None, Some(edit)) => {
                self.resolve_edit_vs_delete(path, edit, local.cloned().unwrap_or_else(absent), false)
            }
        }
    }

    /// Edit on one side, deletion on the other. `local_edited` says which
    /// side holds the surviving content.
    fn resolve_edit_vs_delete(
        &self,
        path: &PathKey,
        edit: &FileMetadata,
        tombstone: FileMetadata,
        local_edited: bool,
    ) -> ResolvedAction {
        let delete_wins = match self.cfg.delete_policy {
            DeletePolicy::DeleteWins => true,
            DeletePolicy::EditWinsOverDelete => {
                let grace = self.cfg.delete_grace.as_nanos() as i64;
                tombstone.modified.saturating_sub(edit.modified) > grace
            }
        };

        if delete_wins {
            let decision = if local_edited {
                Decision::DeleteLocal
            } else {
                Decision::DeleteRemote
            };
            ResolvedAction::new(path.clone(), decision, tombstone)
        } else {
            let decision = if local_edited {
                Decision::PushToLocal
            } else {
                Decision::PullFromRemote
            };
            ResolvedAction::new(path.clone(), decision, edit.clone())
        }
    }

    fn resolve_content_conflict(
        &self,
        path: &PathKey,
        ours: &FileMetadata,
        theirs: &FileMetadata,
    ) -> ResolvedAction {
        if self.cfg.content_policy == ContentPolicy::LatestModifiedWins
            && ours.modified != theirs.modified
        {
            return if ours.modified > theirs.modified {
                ResolvedAction::new(path.clone(), Decision::PushToLocal, ours.clone())
            } else {
                ResolvedAction::new(path.clone(), Decision::PullFromRemote, theirs.clone())
            };
        }

        // Default: preserve both. Equal mtimes under LatestModifiedWins land
        // here too, since neither side can be called newer.
        let mut action = ResolvedAction::new(path.clone(), Decision::KeepBothRenamed, ours.clone());
        action.theirs = Some(theirs.clone());
        action
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::path::Endpoint;
    use std::path::PathBuf;
    use std::time::Duration;

    fn cfg() -> SyncConfig {
        // Resolver never touches the filesystem, so the paths need not exist.
        SyncConfig::new(PathBuf::from("/tmp/a"), Endpoint::parse("host:/b"))
    }

    fn file(mtime: i64, hash: &str) -> FileMetadata {
        FileMetadata {
            size: 10,
            modified: mtime,
            content_hash: Some(hash.to_string()),
            kind: EntryKind::File,
        }
    }

    fn tomb(mtime: i64) -> FileMetadata {
        FileMetadata {
            modified: mtime,
            ..FileMetadata::tombstone()
        }
    }

    fn key() -> PathKey {
        PathKey::new("notes.txt")
    }

    #[test]
    fn test_unchanged_is_noop() {
        let c = cfg();
        let base = file(100, "h1");
        let action = Resolver::new(&c).resolve(&key(), Some(&base), Some(&base), Some(&base));
        assert_eq!(action.decision, Decision::NoOp);
    }

    #[test]
    fn test_only_remote_changed_pulls() {
        let c = cfg();
        let base = file(100, "h1");
        let remote = file(200, "h2");
        let action = Resolver::new(&c).resolve(&key(), Some(&base), Some(&base), Some(&remote));
        assert_eq!(action.decision, Decision::PullFromRemote);
        assert_eq!(action.meta, remote);
    }

    #[test]
    fn test_only_local_changed_pushes() {
        let c = cfg();
        let base = file(100, "h1");
        let local = file(200, "h2");
        let action = Resolver::new(&c).resolve(&key(), Some(&base), Some(&local), Some(&base));
        assert_eq!(action.decision, Decision::PushToLocal);
    }

    #[test]
    fn test_remote_delete_unedited_local() {
        let c = cfg();
        let base = file(100, "h1");
        let action = Resolver::new(&c).resolve(&key(), Some(&base), Some(&base), None);
        assert_eq!(action.decision, Decision::DeleteLocal);
    }

    #[test]
    fn test_new_local_file_pushes() {
        let c = cfg();
        let local = file(100, "h1");
        let action = Resolver::new(&c).resolve(&key(), None, Some(&local), None);
        assert_eq!(action.decision, Decision::PushToLocal);
    }

    #[test]
    fn test_both_changed_same_content_noop() {
        let c = cfg();
        let base = file(100, "h1");
        let local = file(200, "h2");
        let remote = file(300, "h2");
        let action = Resolver::new(&c).resolve(&key(), Some(&base), Some(&local), Some(&remote));
        assert_eq!(action.decision, Decision::NoOp);
    }

    #[test]
    fn test_both_changed_conflict_keeps_both() {
        let c = cfg();
        let base = file(100, "h1");
        let local = file(200, "h2");
        let remote = file(300, "h3");
        let action = Resolver::new(&c).resolve(&key(), Some(&base), Some(&local), Some(&remote));
        assert_eq!(action.decision, Decision::KeepBothRenamed);
        assert_eq!(action.meta, local);
        assert_eq!(action.theirs, Some(remote));
    }

    #[test]
    fn test_latest_modified_wins_policy() {
        let mut c = cfg();
        c.content_policy = ContentPolicy::LatestModifiedWins;
        let base = file(100, "h1");
        let local = file(200, "h2");
        let remote = file(300, "h3");
        let action = Resolver::new(&c).resolve(&key(), Some(&base), Some(&local), Some(&remote));
        assert_eq!(action.decision, Decision::PullFromRemote);
    }

    #[test]
    fn test_edit_wins_over_delete_by_default() {
        let c = cfg();
        let base = file(100, "h1");
        let local = file(200, "h2");
        // Deletion barely newer than the edit: within grace, edit wins.
        let remote_tomb = tomb(200 + 1);
        let action =
            Resolver::new(&c).resolve(&key(), Some(&base), Some(&local), Some(&remote_tomb));
        assert_eq!(action.decision, Decision::PushToLocal);
    }

    #[test]
    fn test_much_newer_delete_wins() {
        let mut c = cfg();
        c.delete_grace = Duration::from_secs(1);
        let base = file(100, "h1");
        let local = file(200, "h2");
        let remote_tomb = tomb(200 + 2_000_000_000);
        let action =
            Resolver::new(&c).resolve(&key(), Some(&base), Some(&local), Some(&remote_tomb));
        assert_eq!(action.decision, Decision::DeleteLocal);
    }

    #[test]
    fn test_absent_remote_does_not_outrank_newer_edit() {
        let c = cfg();
        let base = file(100, "h1");
        // Local edit long after the baseline; the remote side is simply
        // absent (a full manifest without the path), with no deletion
        // timestamp of its own. The synthesized tombstone inherits the
        // baseline time, so the edit wins regardless of the grace window.
        let local = file(100 + 3_600_000_000_000, "h2");
        let action = Resolver::new(&c).resolve(&key(), Some(&base), Some(&local), None);
        assert_eq!(action.decision, Decision::PushToLocal);
    }

    #[test]
    fn test_delete_wins_policy() {
        let mut c = cfg();
        c.delete_policy = DeletePolicy::DeleteWins;
        let base = file(100, "h1");
        let local = file(500, "h2");
        let remote_tomb = tomb(150);
        let action =
            Resolver::new(&c).resolve(&key(), Some(&base), Some(&local), Some(&remote_tomb));
        assert_eq!(action.decision, Decision::DeleteLocal);
    }

    #[test]
    fn test_both_deleted_is_noop_tombstone() {
        let c = cfg();
        let base = file(100, "h1");
        let action = Resolver::new(&c).resolve(&key(), Some(&base), None, None);
        assert_eq!(action.decision, Decision::NoOp);
        assert!(action.meta.is_deleted());
    }

    #[test]
    fn test_missing_hash_errs_toward_conflict() {
        let c = cfg();
        let base = file(100, "h1");
        let mut local = file(200, "x");
        let mut remote = file(300, "x");
        local.content_hash = None;
        remote.content_hash = None;
        let action = Resolver::new(&c).resolve(&key(), Some(&base), Some(&local), Some(&remote));
        assert_eq!(action.decision, Decision::KeepBothRenamed);
    }

    #[test]
    fn test_invert_swaps_frames() {
        let action = ResolvedAction::new(key(), Decision::PullFromRemote, file(1, "h"));
        assert_eq!(action.invert().decision, Decision::PushToLocal);

        let mut conflict = ResolvedAction::new(key(), Decision::KeepBothRenamed, file(1, "a"));
        conflict.theirs = Some(file(2, "b"));
        conflict.resume_offset = 7;
        let flipped = conflict.invert();
        assert_eq!(flipped.meta, file(2, "b"));
        assert_eq!(flipped.theirs, Some(file(1, "a")));
        // Staged offsets follow the frame swap
        assert_eq!(flipped.resume_offset, 0);
        assert_eq!(flipped.theirs_resume_offset, 7);
    }

    #[test]
    fn test_conflict_filename_distinct_per_version() {
        let a = conflict_filename(&key(), 1_700_000_000_123_456_789);
        let b = conflict_filename(&key(), 1_700_000_000_987_654_321);
        assert_ne!(a, b);
        assert!(a.as_str().starts_with("notes.txt.conflict-"));
    }
}
