//! Sync session: negotiation and round execution over one framed stream.
//!
//! A round is strictly phased so both ends always agree on whose turn it is
//! to write: manifest -> plan -> confirmed plan -> initiator content ->
//! responder acks + content -> initiator acks -> commit exchange. Plans on
//! the wire are always expressed in the recipient's frame; the sender calls
//! [`ResolvedAction::invert`] before writing.
//!
//! Either end may start a round. When both do at once, the side with the
//! lower identity yields: it re-queues its drained changes and serves the
//! peer's round instead, while the higher side discards the colliding
//! manifest.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::SystemTime;
use tokio::io::{AsyncRead, AsyncWrite, WriteHalf};
use tokio::sync::mpsc;
use tokio::task::{JoinHandle, JoinSet};
use tokio::time::{timeout, MissedTickBehavior};
use tracing::{debug, error, info, warn};

use crate::daemon::SyncCore;
use crate::error::{Result, SyncError};
use crate::meta::{scan_root, system_time_nanos, EntryKind, FileMetadata};
use crate::path::PathKey;
use crate::protocol::wire::{
    read_message, write_message, AckStatus, ManifestEntry, Message, PROTOCOL_VERSION,
};
use crate::queue::{ChangeEvent, ChangeKind, Origin};
use crate::resolve::{conflict_filename, Decision, ResolvedAction, Resolver};
use crate::state::detect_renames;
use crate::transfer::{self, usable_resume_offset, Spool};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Negotiating,
    Transferring,
    Committing,
}

/// What the handshake established about the other end.
#[derive(Debug, Clone)]
pub struct PeerSession {
    pub identity: String,
    pub version: u32,
}

enum Role {
    Initiator,
    Responder,
}

enum RoundOutcome {
    Completed,
    /// Collision: the peer's manifest to serve after yielding.
    Yielded {
        round_id: u64,
        full: bool,
        entries: Vec<ManifestEntry>,
    },
}

/// An expected incoming file for the current round.
struct InboundFile {
    meta: FileMetadata,
    resume: u64,
    spool: Option<Spool>,
    status: Option<AckStatus>,
}

/// A file this side sends in the current round.
struct OutboundFile {
    wire_path: PathKey,
    source: PathKey,
    size: u64,
    start: u64,
    /// Baseline update to record once the peer confirms installation.
    commit_on_ack: Option<(PathKey, FileMetadata)>,
    /// Local path to re-offer if the peer reports failure.
    requeue_on_fail: PathKey,
}

pub struct Session<S> {
    core: Arc<SyncCore>,
    writer: WriteHalf<S>,
    rx: mpsc::Receiver<Result<Message>>,
    reader: JoinHandle<()>,
    pub peer: PeerSession,
    state: SessionState,
}

impl<S> Drop for Session<S> {
    fn drop(&mut self) {
        self.reader.abort();
    }
}

impl<S: AsyncRead + AsyncWrite + Send + Unpin + 'static> Session<S> {
    /// Exchange handshakes and spawn the frame reader.
    pub async fn establish(core: Arc<SyncCore>, mut stream: S) -> Result<Self> {
        write_message(
            &mut stream,
            &Message::Handshake {
                version: PROTOCOL_VERSION,
                identity: core.identity.clone(),
            },
        )
        .await?;

        let greeting = timeout(core.cfg.round_timeout, read_message(&mut stream))
            .await
            .map_err(|_| SyncError::Transport("handshake timed out".to_string()))??;
        let peer = match greeting {
            Message::Handshake { version, identity } => {
                if version != PROTOCOL_VERSION {
                    return Err(SyncError::VersionMismatch {
                        ours: PROTOCOL_VERSION,
                        theirs: version,
                    });
                }
                PeerSession { identity, version }
            }
            other => {
                return Err(SyncError::Protocol(format!(
                    "expected Handshake, got {}",
                    other.name()
                )))
            }
        };
        info!("Session established with peer {}", peer.identity);

        let (read_half, writer) = tokio::io::split(stream);
        let (tx, rx) = mpsc::channel(64);
        let reader = tokio::spawn(async move {
            let mut read_half = read_half;
            loop {
                let next = read_message(&mut read_half).await;
                let failed = next.is_err();
                if tx.send(next).await.is_err() || failed {
                    break;
                }
            }
        });

        Ok(Self {
            core,
            writer,
            rx,
            reader,
            peer,
            state: SessionState::Idle,
        })
    }

    /// Serve the session until it errors or the peer disconnects. With
    /// `initiate_on_start` the session opens with a full-reconciliation
    /// round, which folds in anything that changed while disconnected.
    pub async fn run(mut self, initiate_on_start: bool) -> Result<()> {
        if initiate_on_start {
            let opening = self.initiate_round(true).await;
            self.absorb_round_error(opening)?;
        }

        let mut full_timer = tokio::time::interval(self.core.cfg.full_sync_interval);
        full_timer.set_missed_tick_behavior(MissedTickBehavior::Delay);
        full_timer.tick().await; // first tick is immediate

        loop {
            tokio::select! {
                _ = self.core.wake.notified() => {
                    // Let the burst land in one round.
                    tokio::time::sleep(self.core.cfg.debounce).await;
                    if !self.core.queue.is_empty() {
                        let round = self.initiate_round(false).await;
                        self.absorb_round_error(round)?;
                    }
                }
                _ = full_timer.tick() => {
                    let round = self.initiate_round(true).await;
                    self.absorb_round_error(round)?;
                }
                incoming = self.rx.recv() => match incoming {
                    None => return Err(SyncError::Transport("peer disconnected".to_string())),
                    Some(msg) => match msg? {
                        Message::ManifestDelta { round_id, full, entries } => {
                            let round = self.respond_round(round_id, full, entries).await;
                            self.absorb_round_error(round)?;
                        }
                        other => {
                            return Err(SyncError::Protocol(format!(
                                "unexpected {} outside a round",
                                other.name()
                            )))
                        }
                    }
                }
            }
        }
    }

    /// An abandoned or locally failed round already re-queued its changes;
    /// the session stays up and returns to idle. Transport and protocol
    /// errors tear the session down, and journal failures halt the pair.
    fn absorb_round_error(&mut self, result: Result<()>) -> Result<()> {
        match result {
            Ok(()) => Ok(()),
            Err(e) if e.is_session_fatal() => Err(e),
            Err(e @ SyncError::Journal { .. }) => Err(e),
            Err(e) => {
                warn!("Round failed: {}", e);
                self.state = SessionState::Idle;
                Ok(())
            }
        }
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    async fn write(&mut self, msg: &Message) -> Result<()> {
        write_message(&mut self.writer, msg).await
    }

    async fn next_message(&mut self, round_id: u64) -> Result<Message> {
        match timeout(self.core.cfg.round_timeout, self.rx.recv()).await {
            Err(_) => Err(SyncError::RoundAbandoned {
                round_id,
                reason: "no progress before the round timeout".to_string(),
            }),
            Ok(None) => Err(SyncError::Transport(
                "peer disconnected mid-round".to_string(),
            )),
            Ok(Some(msg)) => msg,
        }
    }

    /// Start a round as initiator. Drained changes go back to the queue if
    /// the round fails or yields to a colliding peer round.
    pub async fn initiate_round(&mut self, full: bool) -> Result<()> {
        let drained = if full {
            Vec::new()
        } else {
            self.core.queue.drain_batch(self.core.cfg.round_batch)
        };
        let entries = if full {
            match build_full_entries(&self.core) {
                Ok(entries) => entries,
                Err(e) => {
                    warn!("Full-reconciliation scan failed: {}", e);
                    return Ok(());
                }
            }
        } else {
            build_delta_entries(&self.core, &drained)
        };
        if entries.is_empty() && !full {
            return Ok(());
        }

        let round_id = self.core.next_round_id();
        debug!(
            "Initiating {} round {} with {} manifest entr{}",
            if full { "full" } else { "delta" },
            round_id,
            entries.len(),
            if entries.len() == 1 { "y" } else { "ies" }
        );

        match self.drive_initiated_round(round_id, full, entries).await {
            Ok(RoundOutcome::Completed) => Ok(()),
            Ok(RoundOutcome::Yielded {
                round_id: peer_round,
                full: peer_full,
                entries: peer_entries,
            }) => {
                info!(
                    "Round {} yielded to peer {}'s simultaneous round {}",
                    round_id, self.peer.identity, peer_round
                );
                self.core.queue.requeue_front(drained);
                self.respond_round(peer_round, peer_full, peer_entries).await
            }
            Err(e) => {
                self.core.queue.requeue_front(drained);
                self.state = SessionState::Idle;
                Err(e)
            }
        }
    }

    async fn drive_initiated_round(
        &mut self,
        round_id: u64,
        full: bool,
        entries: Vec<ManifestEntry>,
    ) -> Result<RoundOutcome> {
        self.state = SessionState::Negotiating;
        self.write(&Message::ManifestDelta {
            round_id,
            full,
            entries,
        })
        .await?;

        let mut actions = loop {
            match self.next_message(round_id).await? {
                Message::ActionPlan {
                    round_id: rid,
                    actions,
                } if rid == round_id => break actions,
                Message::ManifestDelta {
                    round_id: peer_round,
                    full: peer_full,
                    entries: peer_entries,
                } => {
                    if self.core.identity < self.peer.identity {
                        return Ok(RoundOutcome::Yielded {
                            round_id: peer_round,
                            full: peer_full,
                            entries: peer_entries,
                        });
                    }
                    // Lower side yields; its manifest is dropped and its
                    // changes stay queued on its end.
                    debug!("Discarding colliding manifest from peer round {}", peer_round);
                }
                other => {
                    return Err(SyncError::Protocol(format!(
                        "expected ActionPlan, got {}",
                        other.name()
                    )))
                }
            }
        };

        // The received plan is in our frame; add our staged offsets and
        // send the confirmed plan back in the responder's frame.
        fill_inbound_offsets(&self.core, &mut actions);
        self.write(&Message::ActionPlan {
            round_id,
            actions: actions.iter().cloned().map(ResolvedAction::invert).collect(),
        })
        .await?;

        self.execute_round(round_id, actions, Role::Initiator).await?;
        Ok(RoundOutcome::Completed)
    }

    /// Serve a round the peer initiated.
    async fn respond_round(
        &mut self,
        round_id: u64,
        full: bool,
        entries: Vec<ManifestEntry>,
    ) -> Result<()> {
        self.state = SessionState::Negotiating;
        debug!(
            "Responding to {} round {} ({} entries)",
            if full { "full" } else { "delta" },
            round_id,
            entries.len()
        );

        let mut plan = build_plan(&self.core, &entries, full);
        fill_inbound_offsets(&self.core, &mut plan);
        self.write(&Message::ActionPlan {
            round_id,
            actions: plan.iter().cloned().map(ResolvedAction::invert).collect(),
        })
        .await?;

        // The confirmed plan arrives back in our frame with the peer's
        // staged offsets filled in.
        let confirmed = loop {
            match self.next_message(round_id).await? {
                Message::ActionPlan {
                    round_id: rid,
                    actions,
                } if rid == round_id => break actions,
                other => {
                    return Err(SyncError::Protocol(format!(
                        "expected confirmed ActionPlan, got {}",
                        other.name()
                    )))
                }
            }
        };

        let result = self
            .execute_round(round_id, confirmed, Role::Responder)
            .await;
        if result.is_err() {
            self.state = SessionState::Idle;
        }
        result
    }

    async fn execute_round(
        &mut self,
        round_id: u64,
        actions: Vec<ResolvedAction>,
        role: Role,
    ) -> Result<()> {
        self.state = SessionState::Transferring;
        let mut commits: Vec<(PathKey, FileMetadata)> = Vec::new();
        let (mut inbound, outbound) = prepare_local(&self.core, &actions, &mut commits).await;

        match role {
            Role::Initiator => {
                let sender_failures = self.send_content(round_id, &outbound).await?;
                let mut waiting: BTreeMap<PathKey, &OutboundFile> = outbound
                    .iter()
                    .filter(|o| !sender_failures.contains(&o.wire_path))
                    .map(|o| (o.wire_path.clone(), o))
                    .collect();

                while !waiting.is_empty() || inbound.values().any(|e| e.status.is_none()) {
                    match self.next_message(round_id).await? {
                        Message::ChunkData {
                            round_id: rid,
                            path,
                            offset,
                            bytes,
                            running_checksum,
                        } if rid == round_id => {
                            absorb_chunk(
                                &self.core,
                                &mut inbound,
                                &mut commits,
                                path,
                                offset,
                                &bytes,
                                running_checksum,
                            )
                            .await?;
                        }
                        Message::ActionAck {
                            round_id: rid,
                            path,
                            status,
                        } if rid == round_id => {
                            if let Some(out) = waiting.remove(&path) {
                                self.settle_outbound(out, status, &mut commits);
                            } else {
                                settle_sender_failure(&mut inbound, path, status);
                            }
                        }
                        other => {
                            return Err(SyncError::Protocol(format!(
                                "unexpected {} during transfer phase",
                                other.name()
                            )))
                        }
                    }
                }

                self.ack_inbound(round_id, &inbound).await?;
                self.write(&Message::RoundCommit { round_id }).await?;
                self.await_commit(round_id).await?;
            }
            Role::Responder => {
                // Phase A: the initiator's content.
                while inbound.values().any(|e| e.status.is_none()) {
                    match self.next_message(round_id).await? {
                        Message::ChunkData {
                            round_id: rid,
                            path,
                            offset,
                            bytes,
                            running_checksum,
                        } if rid == round_id => {
                            absorb_chunk(
                                &self.core,
                                &mut inbound,
                                &mut commits,
                                path,
                                offset,
                                &bytes,
                                running_checksum,
                            )
                            .await?;
                        }
                        Message::ActionAck {
                            round_id: rid,
                            path,
                            status,
                        } if rid == round_id => {
                            settle_sender_failure(&mut inbound, path, status);
                        }
                        other => {
                            return Err(SyncError::Protocol(format!(
                                "unexpected {} during transfer phase",
                                other.name()
                            )))
                        }
                    }
                }
                self.ack_inbound(round_id, &inbound).await?;

                // Phase B: our content.
                let sender_failures = self.send_content(round_id, &outbound).await?;
                let mut waiting: BTreeMap<PathKey, &OutboundFile> = outbound
                    .iter()
                    .filter(|o| !sender_failures.contains(&o.wire_path))
                    .map(|o| (o.wire_path.clone(), o))
                    .collect();
                let mut commit_seen = false;
                while !waiting.is_empty() || !commit_seen {
                    match self.next_message(round_id).await? {
                        Message::ActionAck {
                            round_id: rid,
                            path,
                            status,
                        } if rid == round_id => {
                            if let Some(out) = waiting.remove(&path) {
                                self.settle_outbound(out, status, &mut commits);
                            } else {
                                debug!("Stray ack for {}", path);
                            }
                        }
                        Message::RoundCommit { round_id: rid } if rid == round_id => {
                            commit_seen = true;
                        }
                        other => {
                            return Err(SyncError::Protocol(format!(
                                "unexpected {} while awaiting commit",
                                other.name()
                            )))
                        }
                    }
                }
                self.write(&Message::RoundCommit { round_id }).await?;
            }
        }

        self.state = SessionState::Committing;
        self.core.store.commit(round_id, &commits)?;
        self.state = SessionState::Idle;
        info!(
            "Round {} committed: {} baseline update(s)",
            round_id,
            commits.len()
        );
        Ok(())
    }

    fn settle_outbound(
        &self,
        out: &OutboundFile,
        status: AckStatus,
        commits: &mut Vec<(PathKey, FileMetadata)>,
    ) {
        match status {
            AckStatus::Done => {
                self.core.clear_push_failure(&out.requeue_on_fail);
                if let Some(update) = &out.commit_on_ack {
                    commits.push(update.clone());
                }
            }
            AckStatus::Failed(reason) => {
                if self.core.note_push_failure(&out.requeue_on_fail) {
                    warn!(
                        "Peer could not install {}: {}; re-offering next round",
                        out.wire_path, reason
                    );
                    self.core.queue.push(ChangeEvent {
                        path: out.requeue_on_fail.clone(),
                        kind: ChangeKind::Modified,
                        observed: SystemTime::now(),
                        origin: Origin::Local,
                    });
                    self.core.wake.notify_one();
                } else {
                    // One retry was spent. The path stays out of the queue;
                    // the periodic full reconciliation re-offers it fresh.
                    self.core.clear_push_failure(&out.requeue_on_fail);
                    error!(
                        "Giving up on {} after a failed retry: {}",
                        out.wire_path, reason
                    );
                }
            }
        }
    }

    async fn ack_inbound(
        &mut self,
        round_id: u64,
        inbound: &BTreeMap<PathKey, InboundFile>,
    ) -> Result<()> {
        for (path, entry) in inbound {
            let status = entry
                .status
                .clone()
                .unwrap_or_else(|| AckStatus::Failed("content never arrived".to_string()));
            self.write(&Message::ActionAck {
                round_id,
                path: path.clone(),
                status,
            })
            .await?;
        }
        Ok(())
    }

    async fn await_commit(&mut self, round_id: u64) -> Result<()> {
        loop {
            match self.next_message(round_id).await? {
                Message::RoundCommit { round_id: rid } if rid == round_id => return Ok(()),
                Message::ActionAck { path, .. } => debug!("Stray ack for {}", path),
                other => {
                    return Err(SyncError::Protocol(format!(
                        "expected RoundCommit, got {}",
                        other.name()
                    )))
                }
            }
        }
    }

    /// Stream every outbound file, at most `max_transfers` read in parallel.
    /// Reader tasks feed one channel; this side of the stream has a single
    /// writer so frames never interleave mid-message. Returns the paths
    /// whose send failed locally (a Failed marker was sent for each).
    async fn send_content(
        &mut self,
        round_id: u64,
        outbound: &[OutboundFile],
    ) -> Result<BTreeSet<PathKey>> {
        let (tx, mut rx) = mpsc::channel::<Message>(self.core.cfg.max_transfers * 2);
        let semaphore = Arc::new(tokio::sync::Semaphore::new(self.core.cfg.max_transfers));
        let mut tasks = JoinSet::new();

        for out in outbound {
            let tx = tx.clone();
            let semaphore = semaphore.clone();
            let wire_path = out.wire_path.clone();
            let source = out.source.to_absolute(&self.core.cfg.root);
            let size = out.size;
            let start = out.start;
            let chunk_size = self.core.cfg.chunk_size;
            tasks.spawn(async move {
                let _permit = match semaphore.acquire_owned().await {
                    Ok(permit) => permit,
                    Err(_) => return,
                };
                let status = match transfer::send_file(
                    &wire_path, &source, round_id, start, size, chunk_size, &tx,
                )
                .await
                {
                    Ok(sent) if sent == size => return,
                    Ok(sent) => AckStatus::Failed(format!(
                        "file has {} byte(s), manifest said {}",
                        sent, size
                    )),
                    Err(e) => AckStatus::Failed(e.to_string()),
                };
                let _ = tx
                    .send(Message::ActionAck {
                        round_id,
                        path: wire_path,
                        status,
                    })
                    .await;
            });
        }
        drop(tx);

        let mut failures = BTreeSet::new();
        while let Some(msg) = rx.recv().await {
            if let Message::ActionAck { path, status, .. } = &msg {
                warn!("Could not send {}: {:?}", path, status);
                failures.insert(path.clone());
            }
            self.write(&msg).await?;
        }
        while let Some(joined) = tasks.join_next().await {
            if let Err(e) = joined {
                warn!("Transfer task failed: {}", e);
            }
        }
        Ok(failures)
    }
}

/// Record a sender-side failure marker against the matching inbound slot.
fn settle_sender_failure(
    inbound: &mut BTreeMap<PathKey, InboundFile>,
    path: PathKey,
    status: AckStatus,
) {
    match inbound.get_mut(&path) {
        Some(entry) if entry.status.is_none() => {
            warn!("Peer could not send {}: {:?}", path, status);
            entry.status = Some(status);
        }
        _ => debug!("Stray ack for {}", path),
    }
}

/// Feed one chunk into its spool; finishes and commits the file when the
/// expected size is reached. Per-path errors settle the transfer as failed
/// without touching the rest of the round.
async fn absorb_chunk(
    core: &SyncCore,
    inbound: &mut BTreeMap<PathKey, InboundFile>,
    commits: &mut Vec<(PathKey, FileMetadata)>,
    path: PathKey,
    offset: u64,
    bytes: &[u8],
    checksum: u64,
) -> Result<()> {
    let Some(entry) = inbound.get_mut(&path) else {
        return Err(SyncError::Protocol(format!(
            "chunk for unannounced path {}",
            path
        )));
    };
    if entry.status.is_some() {
        debug!("Dropping late chunk for settled {}", path);
        return Ok(());
    }

    if entry.spool.is_none() {
        match Spool::open(&core.cfg.root, path.clone(), entry.meta.clone(), entry.resume).await {
            Ok(spool) => entry.spool = Some(spool),
            Err(e) if e.is_per_path() => {
                warn!("Cannot stage {}: {}", path, e);
                entry.status = Some(AckStatus::Failed(e.to_string()));
                return Ok(());
            }
            Err(e) => return Err(e),
        }
    }
    let Some(spool) = entry.spool.as_mut() else {
        return Ok(());
    };

    match spool.write_chunk(offset, bytes, checksum).await {
        Ok(()) => {
            if spool.is_complete() {
                if let Some(spool) = entry.spool.take() {
                    match spool.finish(&core.suppress).await {
                        Ok(meta) => {
                            entry.status = Some(AckStatus::Done);
                            commits.push((path, meta));
                        }
                        Err(e) => {
                            warn!("Verification failed for {}: {}", path, e);
                            entry.status = Some(AckStatus::Failed(e.to_string()));
                        }
                    }
                }
            }
            Ok(())
        }
        Err(e) if e.is_per_path() => {
            warn!("Staging failed for {}: {}", path, e);
            if let Some(spool) = entry.spool.take() {
                spool.park().await;
            }
            entry.status = Some(AckStatus::Failed(e.to_string()));
            Ok(())
        }
        Err(e) => Err(e),
    }
}

/// Execute the local half of a plan and derive the round's transfer sets.
///
/// Ordering: directories parent-before-child, then rename replays and
/// conflict renames, then symlink installs, then deletions child-before-
/// parent. Content installation happens later, through spools that create
/// missing parents themselves.
async fn prepare_local(
    core: &SyncCore,
    actions: &[ResolvedAction],
    commits: &mut Vec<(PathKey, FileMetadata)>,
) -> (BTreeMap<PathKey, InboundFile>, Vec<OutboundFile>) {
    let root = &core.cfg.root;
    let mut inbound = BTreeMap::new();
    let mut outbound = Vec::new();

    let mut mkdirs: Vec<&ResolvedAction> = Vec::new();
    let mut renames: Vec<&ResolvedAction> = Vec::new();
    let mut conflicts: Vec<&ResolvedAction> = Vec::new();
    let mut deletes: Vec<&ResolvedAction> = Vec::new();
    let mut rest: Vec<&ResolvedAction> = Vec::new();
    for action in actions {
        match action.decision {
            Decision::PullFromRemote if action.rename_from.is_some() => renames.push(action),
            Decision::PullFromRemote if action.meta.kind == EntryKind::Directory => {
                mkdirs.push(action)
            }
            Decision::KeepBothRenamed => conflicts.push(action),
            Decision::DeleteLocal => deletes.push(action),
            _ => rest.push(action),
        }
    }
    mkdirs.sort_by_key(|a| a.path.depth());
    deletes.sort_by_key(|a| std::cmp::Reverse(a.path.depth()));

    for action in mkdirs {
        match transfer::apply_mkdir(root, &action.path, &core.suppress).await {
            Ok(()) => commits.push((action.path.clone(), action.meta.clone())),
            Err(e) => warn!("Could not create {}: {}", action.path, e),
        }
    }

    for action in renames {
        let Some(from) = &action.rename_from else {
            continue;
        };
        match transfer::apply_rename(root, from, &action.path, &core.suppress).await {
            Ok(()) => {
                commits.push((from.clone(), FileMetadata::tombstone()));
                commits.push((action.path.clone(), action.meta.clone()));
            }
            // Content was never scheduled for this path; a full round heals it.
            Err(e) => warn!("Could not replay rename {} -> {}: {}", from, action.path, e),
        }
    }

    for action in conflicts {
        let Some(theirs) = &action.theirs else {
            warn!("Conflict on {} lacks the peer version; skipped", action.path);
            continue;
        };
        let mine_name = conflict_filename(&action.path, action.meta.modified);
        let theirs_name = conflict_filename(&action.path, theirs.modified);
        info!(
            "Conflict on {}: preserving both as {} and {}",
            action.path, mine_name, theirs_name
        );

        match transfer::apply_rename(root, &action.path, &mine_name, &core.suppress).await {
            Ok(()) => {
                commits.push((action.path.clone(), FileMetadata::tombstone()));
                commits.push((mine_name.clone(), action.meta.clone()));
                if action.meta.kind == EntryKind::File {
                    outbound.push(OutboundFile {
                        wire_path: mine_name.clone(),
                        source: mine_name.clone(),
                        size: action.meta.size,
                        start: action.theirs_resume_offset,
                        commit_on_ack: None,
                        requeue_on_fail: mine_name.clone(),
                    });
                }
            }
            Err(e) => warn!("Could not preserve own copy of {}: {}", action.path, e),
        }

        match &theirs.kind {
            EntryKind::File => {
                inbound.insert(
                    theirs_name,
                    InboundFile {
                        meta: theirs.clone(),
                        resume: action.resume_offset,
                        spool: None,
                        status: None,
                    },
                );
            }
            EntryKind::Symlink { target } => {
                match transfer::apply_symlink(root, &theirs_name, target, &core.suppress).await {
                    Ok(()) => commits.push((theirs_name, theirs.clone())),
                    Err(e) => warn!("Could not install {}: {}", theirs_name, e),
                }
            }
            _ => {}
        }
    }

    for action in rest {
        match action.decision {
            Decision::PullFromRemote => match &action.meta.kind {
                EntryKind::File => {
                    inbound.insert(
                        action.path.clone(),
                        InboundFile {
                            meta: action.meta.clone(),
                            resume: action.resume_offset,
                            spool: None,
                            status: None,
                        },
                    );
                }
                EntryKind::Symlink { target } => {
                    match transfer::apply_symlink(root, &action.path, target, &core.suppress).await
                    {
                        Ok(()) => commits.push((action.path.clone(), action.meta.clone())),
                        Err(e) => warn!("Could not install {}: {}", action.path, e),
                    }
                }
                _ => commits.push((action.path.clone(), action.meta.clone())),
            },
            Decision::PushToLocal => {
                if action.rename_from.is_some() {
                    // The peer replays the rename; no content moves.
                    if let Some(from) = &action.rename_from {
                        commits.push((from.clone(), FileMetadata::tombstone()));
                    }
                    commits.push((action.path.clone(), action.meta.clone()));
                } else if action.meta.kind == EntryKind::File {
                    outbound.push(OutboundFile {
                        wire_path: action.path.clone(),
                        source: action.path.clone(),
                        size: action.meta.size,
                        start: action.theirs_resume_offset,
                        commit_on_ack: Some((action.path.clone(), action.meta.clone())),
                        requeue_on_fail: action.path.clone(),
                    });
                } else {
                    // Directories and symlinks are installed by the peer
                    // from plan metadata alone.
                    commits.push((action.path.clone(), action.meta.clone()));
                }
            }
            Decision::DeleteRemote | Decision::NoOp => {
                commits.push((action.path.clone(), action.meta.clone()));
            }
            _ => {}
        }
    }

    for action in deletes {
        match transfer::apply_delete(root, &action.path, &core.suppress).await {
            Ok(()) => commits.push((action.path.clone(), FileMetadata::tombstone())),
            Err(e) => warn!("Could not delete {}: {}", action.path, e),
        }
    }

    (inbound, outbound)
}

/// Manifest entries for a drained batch of local changes. Created and
/// modified files are hashed here; deletions become tombstones. Removed +
/// created pairs with identical content collapse into rename entries.
pub(crate) fn build_delta_entries(
    core: &SyncCore,
    drained: &[ChangeEvent],
) -> Vec<ManifestEntry> {
    let root = &core.cfg.root;
    let mut entries: Vec<ManifestEntry> = Vec::new();
    let mut disappeared: Vec<(PathKey, FileMetadata)> = Vec::new();

    for event in drained {
        // Deletions are stamped with when they were seen, not when the
        // manifest is built; a delete queued while the daemon was busy
        // must not look newer than a later edit on the peer.
        let observed = system_time_nanos(event.observed);
        match &event.kind {
            ChangeKind::Deleted => {
                if let Some(base) = core.store.get(&event.path) {
                    disappeared.push((event.path.clone(), base));
                }
                entries.push(ManifestEntry {
                    path: event.path.clone(),
                    kind: ChangeKind::Deleted,
                    meta: FileMetadata::tombstone_at(observed),
                });
            }
            kind => {
                let abs = event.path.to_absolute(root);
                let mut meta = match FileMetadata::from_fs(&abs) {
                    Ok(meta) => meta,
                    Err(SyncError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => {
                        // Vanished since the event fired.
                        if let Some(base) = core.store.get(&event.path) {
                            disappeared.push((event.path.clone(), base));
                            entries.push(ManifestEntry {
                                path: event.path.clone(),
                                kind: ChangeKind::Deleted,
                                meta: FileMetadata::tombstone_at(observed),
                            });
                        }
                        continue;
                    }
                    Err(e) => {
                        // Transient read failure: the change goes back on
                        // the queue instead of being lost.
                        warn!("Cannot read {}: {}; re-queued for a later round", event.path, e);
                        core.queue.push(event.clone());
                        continue;
                    }
                };
                if let Err(e) = meta.ensure_hash(&abs) {
                    warn!("Cannot hash {}: {}; re-queued for a later round", event.path, e);
                    core.queue.push(event.clone());
                    continue;
                }
                entries.push(ManifestEntry {
                    path: event.path.clone(),
                    kind: kind.clone(),
                    meta,
                });
            }
        }
    }

    // Collapse same-content delete + create pairs into renames.
    let appeared: Vec<(PathKey, FileMetadata)> = entries
        .iter()
        .filter(|e| e.kind == ChangeKind::Created)
        .map(|e| (e.path.clone(), e.meta.clone()))
        .collect();
    for (from, to) in detect_renames(&disappeared, &appeared) {
        entries.retain(|e| !(e.path == from && e.kind == ChangeKind::Deleted));
        for entry in entries.iter_mut() {
            if entry.path == to && entry.kind == ChangeKind::Created {
                debug!("Detected rename {} -> {}", from, to);
                entry.kind = ChangeKind::Renamed { from: from.clone() };
            }
        }
    }

    entries
}

/// Manifest of the entire current tree, every file hashed, plus tombstones
/// for baseline paths that no longer exist.
pub(crate) fn build_full_entries(core: &SyncCore) -> Result<Vec<ManifestEntry>> {
    let root = &core.cfg.root;
    let mut scan = scan_root(&core.cfg, root)?;
    let baseline = core.store.baseline();
    let mut entries = Vec::new();

    for (path, meta) in scan.iter_mut() {
        if meta.kind == EntryKind::File {
            if let Err(e) = meta.ensure_hash(&path.to_absolute(root)) {
                warn!("Cannot hash {}: {}; omitted from this round", path, e);
                continue;
            }
        }
        let kind = if baseline.contains_key(path) {
            ChangeKind::Modified
        } else {
            ChangeKind::Created
        };
        entries.push(ManifestEntry {
            path: path.clone(),
            kind,
            meta: meta.clone(),
        });
    }
    for (path, base) in &baseline {
        if !scan.contains_key(path) {
            // The deletion happened at some unknown point since the
            // baseline; its last-known mtime is the honest lower bound.
            entries.push(ManifestEntry {
                path: path.clone(),
                kind: ChangeKind::Deleted,
                meta: FileMetadata::tombstone_at(base.modified),
            });
        }
    }
    Ok(entries)
}

fn stat_local(root: &std::path::Path, path: &PathKey) -> Option<FileMetadata> {
    match FileMetadata::from_fs(&path.to_absolute(root)) {
        Ok(meta) => Some(meta),
        Err(SyncError::Io(e)) if e.kind() == std::io::ErrorKind::NotFound => None,
        Err(e) => {
            warn!("Cannot read {}: {}", path, e);
            None
        }
    }
}

/// Resolve a peer manifest against the local tree and baseline into a plan
/// in this side's frame. For full manifests the candidate set is the union
/// of manifest, local tree and baseline, so silence on either end is
/// treated as absence.
pub(crate) fn build_plan(
    core: &SyncCore,
    entries: &[ManifestEntry],
    full: bool,
) -> Vec<ResolvedAction> {
    let root = &core.cfg.root;
    let resolver = Resolver::new(&core.cfg);
    let baseline = core.store.baseline();

    let local_scan = if full {
        match scan_root(&core.cfg, root) {
            Ok(scan) => Some(scan),
            Err(e) => {
                warn!("Local scan failed: {}; statting per path instead", e);
                None
            }
        }
    } else {
        None
    };
    let local_of = |path: &PathKey| -> Option<FileMetadata> {
        match &local_scan {
            Some(scan) => scan.get(path).cloned(),
            None => stat_local(root, path),
        }
    };

    let mut remote: BTreeMap<PathKey, Option<FileMetadata>> = BTreeMap::new();
    let mut actions = Vec::new();
    let mut handled: BTreeSet<PathKey> = BTreeSet::new();

    for entry in entries {
        match &entry.kind {
            ChangeKind::Renamed { from } => {
                let base_from = baseline.get(from);
                let local_from = local_of(from);
                let clean_source = matches!((base_from, &local_from), (Some(b), Some(l)) if l.same_shape(b));
                let clean_target =
                    local_of(&entry.path).is_none() && !baseline.contains_key(&entry.path);
                if clean_source && clean_target {
                    let mut action = ResolvedAction::new(
                        entry.path.clone(),
                        Decision::PullFromRemote,
                        entry.meta.clone(),
                    );
                    action.rename_from = Some(from.clone());
                    actions.push(action);
                    handled.insert(from.clone());
                    handled.insert(entry.path.clone());
                } else {
                    // Either end diverged; fall back to delete + create.
                    // The renamed file's own mtime stands in for when the
                    // source path stopped existing.
                    remote.insert(entry.path.clone(), Some(entry.meta.clone()));
                    remote.insert(
                        from.clone(),
                        Some(FileMetadata::tombstone_at(entry.meta.modified)),
                    );
                }
            }
            ChangeKind::Deleted => {
                remote.insert(entry.path.clone(), Some(entry.meta.clone()));
            }
            _ => {
                remote.insert(entry.path.clone(), Some(entry.meta.clone()));
            }
        }
    }

    let mut candidates: BTreeSet<PathKey> = remote.keys().cloned().collect();
    if full {
        candidates.extend(baseline.keys().cloned());
        if let Some(scan) = &local_scan {
            candidates.extend(scan.keys().cloned());
        }
    }

    for path in candidates {
        if handled.contains(&path) {
            continue;
        }
        let base = baseline.get(&path);
        let mut local = local_of(&path);
        // In a full round, absence from the manifest means the peer does
        // not have the path.
        let remote_meta = remote.get(&path).cloned().unwrap_or(None);

        // Hash the local version only when a content comparison is coming.
        if let (Some(l), Some(r)) = (&mut local, &remote_meta) {
            if l.kind == EntryKind::File && r.kind == EntryKind::File {
                if let Err(e) = l.ensure_hash(&path.to_absolute(root)) {
                    warn!("Cannot hash {}: {}", path, e);
                }
            }
        }

        let action = resolver.resolve(&path, base, local.as_ref(), remote_meta.as_ref());
        if action.decision == Decision::NoOp && core.store.already_applied(&path, &action.meta) {
            continue;
        }
        actions.push(action);
    }

    actions.sort_by(|a, b| a.path.cmp(&b.path));
    actions
}

/// Record how many bytes are already staged for each transfer this side
/// will receive, so the peer resumes instead of restarting. Staged spools
/// that meet or exceed the incoming size are from an older version of the
/// path and are discarded rather than resumed.
pub(crate) fn fill_inbound_offsets(core: &SyncCore, actions: &mut [ResolvedAction]) {
    let root = &core.cfg.root;
    for action in actions.iter_mut() {
        match action.decision {
            Decision::PullFromRemote
                if action.meta.kind == EntryKind::File && action.rename_from.is_none() =>
            {
                action.resume_offset = usable_resume_offset(root, &action.path, action.meta.size);
            }
            Decision::KeepBothRenamed => {
                if let Some(theirs) = &action.theirs {
                    if theirs.kind == EntryKind::File {
                        action.resume_offset = usable_resume_offset(
                            root,
                            &conflict_filename(&action.path, theirs.modified),
                            theirs.size,
                        );
                    }
                }
            }
            _ => {}
        }
    }
}
