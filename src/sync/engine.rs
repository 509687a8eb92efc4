//! Sync engine
//!
//! A pass snapshots local items, lists the remote, diffs both against the
//! checkpoint, resolves collisions, then pushes and pulls with retry. Local
//! writes and the checkpoint are committed once, at the end of the pass, and
//! only for items whose every required leg succeeded. Anything else shows up
//! again on the next pass.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Instant;

use chrono::Utc;
use futures::stream::{self, StreamExt};
use parking_lot::RwLock;
use tokio::sync::{watch, Mutex};

use super::adapter::{create_adapter, CloudAdapter};
use super::changes::{ChangeDetector, REMOTE_KEY_META};
use super::checkpoint::{write_atomic, Checkpoint, CheckpointStore, ListingFingerprint};
use super::conflict::{ConflictDetector, ConflictResolver, ResolveOutcome};
use super::retry::{RetryOp, RetryPolicy};
use super::store::LocalStore;
use crate::config::{ProviderConfig, SyncOptions};
use crate::error::{AdapterErrorCode, Result, SyncError};
use crate::types::{
    is_valid_item_id, parse_remote_key, sha256_hex, Change, ChangeType, DownloadResult, ItemRef,
    Resolution, SyncConflict, SyncDirection, SyncItemError, SyncResult, SyncState, SyncStatus,
    SyncableItem,
};

/// Per-item work left after pairing
#[derive(Debug)]
enum Work {
    Push(Change),
    Pull(Change),
    Collide(Change, Change),
}

impl Work {
    fn remote(&self) -> Option<&Change> {
        match self {
            Work::Pull(r) | Work::Collide(_, r) => Some(r),
            Work::Push(_) => None,
        }
    }

    fn item_id(&self) -> &str {
        match self {
            Work::Push(c) | Work::Pull(c) | Work::Collide(c, _) => &c.item.id,
        }
    }
}

/// What a pass will do for one item
#[derive(Debug)]
struct Plan {
    item: SyncableItem,
    /// Remote key of the item, for uploads and deletes
    remote_key: String,
    upload: bool,
    delete_remote: bool,
    write_local: bool,
    remove_local: bool,
    report_pushed: bool,
    report_pulled: bool,
    /// Drop the checkpoint entry instead of recording the item
    forget: bool,
    remote_checksum: Option<String>,
}

impl Plan {
    fn new(item: SyncableItem, remote_key: String) -> Self {
        Self {
            item,
            remote_key,
            upload: false,
            delete_remote: false,
            write_local: false,
            remove_local: false,
            report_pushed: false,
            report_pulled: false,
            forget: false,
            remote_checksum: None,
        }
    }

    fn needs_push(&self) -> bool {
        self.upload || self.delete_remote
    }

    fn needs_pull(&self) -> bool {
        self.write_local || self.remove_local
    }

    /// Every required leg is permitted in this direction
    fn complete_in(&self, direction: SyncDirection) -> bool {
        (!self.needs_push() || direction.allows_push())
            && (!self.needs_pull() || direction.allows_pull())
    }
}

enum Leg {
    Done(Option<String>),
    Failed(SyncItemError),
    Skipped,
}

enum Fetch {
    Item(SyncableItem, String),
    Failed(SyncItemError),
    Skipped,
}

/// Results collected while a pass runs
#[derive(Default)]
struct Ledger {
    pushed: Vec<SyncableItem>,
    pulled: Vec<SyncableItem>,
    conflicts: Vec<SyncConflict>,
    errors: Vec<SyncItemError>,
    resolved: u64,
    /// Items whose state this pass could not observe
    blocked: HashSet<String>,
    cancelled: bool,
}

/// Bidirectional sync between a local store and a cloud adapter
pub struct SyncEngine {
    local: Arc<dyn LocalStore>,
    checkpoints: Arc<dyn CheckpointStore>,
    adapter: tokio::sync::RwLock<Option<Arc<dyn CloudAdapter>>>,
    state: RwLock<SyncState>,
    state_path: Option<PathBuf>,
    pass_lock: Mutex<()>,
    cancel: AtomicBool,
    progress: watch::Sender<u8>,
    changes: ChangeDetector,
    detector: ConflictDetector,
    resolver: ConflictResolver,
}

impl SyncEngine {
    /// Engine with in-memory state
    pub fn new(local: Arc<dyn LocalStore>, checkpoints: Arc<dyn CheckpointStore>) -> Self {
        let (progress, _) = watch::channel(0);
        Self {
            local,
            checkpoints,
            adapter: tokio::sync::RwLock::new(None),
            state: RwLock::new(SyncState::default()),
            state_path: None,
            pass_lock: Mutex::new(()),
            cancel: AtomicBool::new(false),
            progress,
            changes: ChangeDetector::new(),
            detector: ConflictDetector::new(),
            resolver: ConflictResolver::new(),
        }
    }

    /// Engine whose state (status, stats, conflict queue) is persisted at
    /// `path`. A state left in `syncing` by an interrupted process is reset.
    pub fn with_state_file(
        local: Arc<dyn LocalStore>,
        checkpoints: Arc<dyn CheckpointStore>,
        path: impl Into<PathBuf>,
    ) -> Result<Self> {
        let path = path.into();
        let mut engine = Self::new(local, checkpoints);
        let mut state = Self::load_state(&path)?;
        if state.status == SyncStatus::Syncing {
            tracing::warn!(path = %path.display(), "previous sync did not finish, resetting status");
            state.status = if state.unresolved_conflicts().next().is_some() {
                SyncStatus::Conflict
            } else {
                SyncStatus::Idle
            };
        }
        state.progress = 0;
        engine.state = RwLock::new(state);
        engine.state_path = Some(path);
        Ok(engine)
    }

    fn load_state(path: &Path) -> Result<SyncState> {
        match std::fs::read(path) {
            Ok(bytes) => serde_json::from_slice(&bytes).map_err(|e| {
                SyncError::Storage(format!("corrupt state file {}: {}", path.display(), e))
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(SyncState::default()),
            Err(e) => Err(e.into()),
        }
    }

    /// Build, connect and install the adapter for `config`
    pub async fn configure(&self, config: ProviderConfig) -> Result<()> {
        let adapter = create_adapter(config)?;
        adapter.connect().await?;
        tracing::info!(provider = %adapter.provider(), "sync provider configured");
        self.set_adapter(adapter).await;
        Ok(())
    }

    /// Install an already-built adapter. It is connected lazily by the next pass.
    pub async fn set_adapter(&self, adapter: Arc<dyn CloudAdapter>) {
        let previous = self.adapter.write().await.replace(adapter);
        if let Some(previous) = previous {
            previous.disconnect().await;
        }
    }

    pub async fn is_configured(&self) -> bool {
        self.adapter.read().await.is_some()
    }

    pub fn state(&self) -> SyncState {
        self.state.read().clone()
    }

    /// Queued conflicts, unresolved ones and those resolved but not yet applied
    pub fn conflicts(&self) -> Vec<SyncConflict> {
        self.state.read().conflicts.clone()
    }

    pub fn subscribe_progress(&self) -> watch::Receiver<u8> {
        self.progress.subscribe()
    }

    /// Ask the running pass to stop before its next item
    pub fn cancel(&self) {
        self.cancel.store(true, Ordering::SeqCst);
    }

    /// Record a decision for a queued conflict. It is applied by the next pass.
    pub async fn resolve_conflict(&self, id: &str, resolution: Resolution) -> Result<SyncConflict> {
        let resolved = self.update_conflict(id, |conflict| {
            if resolution != Resolution::Merged {
                conflict.merged_item = None;
            }
            conflict.resolve(resolution);
        })?;
        self.persist_state().await?;
        Ok(resolved)
    }

    /// Resolve a queued conflict as `merged` with hand-edited content
    pub async fn resolve_conflict_with(
        &self,
        id: &str,
        content: impl Into<String>,
    ) -> Result<SyncConflict> {
        let content = content.into();
        let resolved = self.update_conflict(id, |conflict| {
            conflict.merged_item = Some(conflict.local_item.with_content(content));
            conflict.resolve(Resolution::Merged);
        })?;
        self.persist_state().await?;
        Ok(resolved)
    }

    fn update_conflict(
        &self,
        id: &str,
        update: impl FnOnce(&mut SyncConflict),
    ) -> Result<SyncConflict> {
        let mut state = self.state.write();
        let conflict = state
            .conflicts
            .iter_mut()
            .find(|c| c.id == id)
            .ok_or_else(|| SyncError::ConflictNotFound(id.to_string()))?;
        update(conflict);
        let resolved = conflict.clone();
        if state.status == SyncStatus::Conflict && state.unresolved_conflicts().next().is_none() {
            state.status = SyncStatus::Idle;
        }
        Ok(resolved)
    }

    /// Forget the checkpoint and all state. The next pass treats every item
    /// on both sides as new.
    pub async fn reset(&self) -> Result<()> {
        let _pass = self.pass_lock.try_lock().map_err(|_| SyncError::InProgress)?;
        self.checkpoints.clear().await?;
        *self.state.write() = SyncState::default();
        self.progress.send_replace(0);
        self.persist_state().await
    }

    /// Cancel any running pass, wait for it, and disconnect the adapter
    pub async fn shutdown(&self) -> Result<()> {
        self.cancel();
        let _pass = self.pass_lock.lock().await;
        if let Some(adapter) = self.adapter.write().await.take() {
            adapter.disconnect().await;
        }
        self.persist_state().await
    }

    async fn persist_state(&self) -> Result<()> {
        let Some(path) = self.state_path.clone() else {
            return Ok(());
        };
        let bytes = serde_json::to_vec_pretty(&*self.state.read())?;
        tokio::task::spawn_blocking(move || write_atomic(&path, &bytes))
            .await
            .map_err(|e| SyncError::Internal(format!("state writer panicked: {}", e)))?
    }

    fn report_progress(&self, done: usize, total: usize) {
        let pct = if total == 0 {
            100
        } else {
            ((done * 100) / total).min(100) as u8
        };
        self.state.write().progress = pct;
        self.progress.send_replace(pct);
    }

    fn cancelled(&self) -> bool {
        self.cancel.load(Ordering::SeqCst)
    }

    /// Run one sync pass. Rejected with [`SyncError::InProgress`] while another
    /// pass is running. Connect and list failures abort the pass; per-item
    /// failures are reported in the result.
    pub async fn perform_sync(&self, options: SyncOptions) -> Result<SyncResult> {
        let _pass = self.pass_lock.try_lock().map_err(|_| SyncError::InProgress)?;
        let adapter = self
            .adapter
            .read()
            .await
            .clone()
            .ok_or(SyncError::NotConfigured)?;

        self.cancel.store(false, Ordering::SeqCst);
        {
            let mut state = self.state.write();
            state.status = SyncStatus::Syncing;
            state.progress = 0;
        }
        self.progress.send_replace(0);

        let started_at = Utc::now();
        let clock = Instant::now();
        tracing::info!(
            provider = %adapter.provider(),
            direction = ?options.direction,
            strategy = ?options.conflict_strategy,
            dry_run = options.dry_run,
            "sync started"
        );

        let outcome = self.run_pass(adapter.as_ref(), &options).await;
        let duration_ms = clock.elapsed().as_millis() as u64;
        let completed_at = Utc::now();

        let ledger = match outcome {
            Ok(ledger) => ledger,
            Err(e) => {
                tracing::error!(error = %e, code = e.code(), "sync aborted");
                {
                    let mut state = self.state.write();
                    state.status = SyncStatus::Error;
                    state.last_error = Some(e.to_string());
                    state.stats.failures += 1;
                    state.stats.total_duration_ms += duration_ms;
                }
                self.persist_state().await?;
                return Err(e);
            }
        };

        let result = SyncResult {
            success: ledger.errors.is_empty(),
            direction: options.direction,
            pushed: ledger.pushed,
            pulled: ledger.pulled,
            conflicts: ledger.conflicts,
            errors: ledger.errors,
            duration_ms,
            started_at,
            completed_at,
            dry_run: options.dry_run,
            cancelled: ledger.cancelled,
        };

        {
            let mut state = self.state.write();
            if !options.dry_run {
                // Conflicts outside this pass's scope, or on items it could
                // not observe, stay queued
                let mut queue: Vec<SyncConflict> = state
                    .conflicts
                    .drain(..)
                    .filter(|c| {
                        !options.includes(c.item_type) || ledger.blocked.contains(&c.item_id)
                    })
                    .collect();
                queue.extend(result.conflicts.iter().filter(|c| !c.resolved).cloned());
                state.conflicts = queue;

                let pushed = result.pushed.len() as u64;
                let pulled = result.pulled.len() as u64;
                state.stats.pushed += pushed;
                state.stats.pulled += pulled;
                state.stats.total_synced += pushed + pulled;
                state.stats.conflicts_resolved += ledger.resolved;
                state.stats.failures += result.errors.len() as u64;
                state.stats.total_duration_ms += duration_ms;
                state.last_sync_at = Some(completed_at);
            }
            state.last_error = result.errors.first().map(|e| e.message.clone());
            state.status = if state.unresolved_conflicts().next().is_some() {
                SyncStatus::Conflict
            } else {
                SyncStatus::Idle
            };
            state.progress = 100;
        }
        self.progress.send_replace(100);
        self.persist_state().await?;

        tracing::info!(
            pushed = result.pushed.len(),
            pulled = result.pulled.len(),
            conflicts = result.conflicts.len(),
            errors = result.errors.len(),
            cancelled = result.cancelled,
            duration_ms,
            "sync finished"
        );
        Ok(result)
    }

    async fn run_pass(&self, adapter: &dyn CloudAdapter, options: &SyncOptions) -> Result<Ledger> {
        if !adapter.is_connected() {
            adapter.connect().await?;
        }

        let policy = RetryPolicy::new(
            adapter.retry_limit().unwrap_or(options.max_retries),
            options.retry_delay_ms,
        );
        let concurrency = options.concurrency.max(1);
        let direction = options.direction;

        let mut checkpoint = self.checkpoints.load().await?;
        let local_items = self.local.snapshot(&options.item_types).await?;
        let listing = policy
            .run(RetryOp::List, "", || adapter.list(""))
            .await
            .result?;
        // Backends without listing checksums are tracked by listing fingerprint
        let fingerprints: HashMap<String, ListingFingerprint> = listing
            .iter()
            .filter(|r| !r.is_directory && r.checksum.is_none())
            .filter_map(|r| {
                parse_remote_key(&r.key).map(|(_, id)| (id, ListingFingerprint::of(r)))
            })
            .collect();

        let local_changes =
            self.changes
                .detect_local(&local_items, &checkpoint, &options.item_types);
        let remote_changes =
            self.changes
                .detect_remote(&listing, &checkpoint, &options.item_types);
        tracing::debug!(
            local = local_changes.len(),
            remote = remote_changes.len(),
            "changes detected"
        );

        let pairing = self.detector.pair(local_changes, remote_changes);
        let mut work: Vec<Work> = Vec::new();
        work.extend(pairing.local_only.into_iter().map(Work::Push));
        work.extend(pairing.remote_only.into_iter().map(Work::Pull));
        work.extend(pairing.colliding.into_iter().map(|(l, r)| Work::Collide(l, r)));

        let mut ledger = Ledger::default();
        let mut remote_sums: HashMap<String, String> = HashMap::new();
        if !options.dry_run {
            let work_before = std::mem::take(&mut work);
            work = self
                .hydrate(
                    adapter,
                    &policy,
                    concurrency,
                    direction,
                    work_before,
                    &fingerprints,
                    &mut checkpoint,
                    &mut remote_sums,
                    &mut ledger,
                )
                .await;
        }

        if options.dry_run {
            work.retain(|w| !agrees_with_listing(w));
        }

        let queued: Vec<SyncConflict> = self
            .state
            .read()
            .conflicts
            .iter()
            .filter(|c| options.includes(c.item_type))
            .cloned()
            .collect();
        let mut plans = Vec::with_capacity(work.len());
        for item_work in work {
            if let Some(plan) =
                self.plan(item_work, &checkpoint, &remote_sums, &queued, options, &mut ledger)
            {
                plans.push(plan);
            }
        }

        if options.dry_run {
            for plan in &plans {
                if plan.report_pushed && direction.allows_push() {
                    ledger.pushed.push(plan.item.clone());
                }
                if plan.report_pulled && direction.allows_pull() {
                    ledger.pulled.push(plan.item.clone());
                }
            }
            return Ok(ledger);
        }

        let legs = self
            .run_remote_legs(adapter, &policy, concurrency, direction, &plans)
            .await;

        let mut writes = Vec::new();
        let mut removals: Vec<ItemRef> = Vec::new();
        let mut applied: Vec<(usize, Option<String>, bool)> = Vec::new();
        for (idx, leg) in legs.into_iter().enumerate() {
            let plan = &plans[idx];
            let checksum = match leg {
                Leg::Done(checksum) => checksum,
                Leg::Failed(error) => {
                    ledger.errors.push(error);
                    continue;
                }
                Leg::Skipped => {
                    ledger.cancelled = true;
                    ledger.blocked.insert(plan.item.id.clone());
                    continue;
                }
            };
            if plan.needs_push() && direction.allows_push() && plan.report_pushed {
                ledger.pushed.push(plan.item.clone());
            }
            if direction.allows_pull() {
                if plan.write_local {
                    writes.push(plan.item.clone());
                }
                if plan.remove_local {
                    removals.push(plan.item.item_ref());
                }
                if plan.needs_pull() && plan.report_pulled {
                    ledger.pulled.push(plan.item.clone());
                }
            }
            if plan.complete_in(direction) {
                let uploaded = checksum.is_some();
                applied.push((idx, checksum.or_else(|| plan.remote_checksum.clone()), uploaded));
            }
        }

        if !writes.is_empty() || !removals.is_empty() {
            self.local.apply(&writes, &removals).await?;
        }

        let synced_at = Utc::now();
        for (idx, checksum, uploaded) in applied {
            let plan = &plans[idx];
            if plan.forget {
                checkpoint.remove(&plan.item.id);
            } else {
                checkpoint.record(&plan.item, checksum, synced_at);
                // Our own upload is not in this pass's listing yet
                if !uploaded {
                    let seen = fingerprints.get(&plan.item.id).cloned();
                    checkpoint.set_listing(&plan.item.id, seen);
                }
            }
        }
        self.checkpoints.save(&checkpoint).await?;
        Ok(ledger)
    }

    /// Download remote candidates and confirm they really changed. Candidates
    /// whose content matches the checkpoint only refresh its fingerprint.
    #[allow(clippy::too_many_arguments)]
    async fn hydrate(
        &self,
        adapter: &dyn CloudAdapter,
        policy: &RetryPolicy,
        concurrency: usize,
        direction: SyncDirection,
        work: Vec<Work>,
        fingerprints: &HashMap<String, ListingFingerprint>,
        checkpoint: &mut Checkpoint,
        remote_sums: &mut HashMap<String, String>,
        ledger: &mut Ledger,
    ) -> Vec<Work> {
        let jobs: Vec<(usize, SyncableItem)> = work
            .iter()
            .enumerate()
            .filter_map(|(idx, w)| {
                let wanted = match w {
                    Work::Collide(..) => true,
                    Work::Pull(_) => direction.allows_pull(),
                    Work::Push(_) => false,
                };
                let remote = w.remote()?;
                (wanted && remote.change_type != ChangeType::Delete)
                    .then(|| (idx, remote.item.clone()))
            })
            .collect();

        let mut fetched: HashMap<usize, Fetch> = stream::iter(jobs)
            .map(|(idx, stub)| async move {
                if self.cancelled() {
                    return (idx, Fetch::Skipped);
                }
                let key = stub
                    .metadata
                    .get(REMOTE_KEY_META)
                    .and_then(|v| v.as_str())
                    .map(String::from)
                    .unwrap_or_else(|| stub.remote_key());
                let attempted = policy
                    .run(RetryOp::Download, &key, || adapter.download(&key))
                    .await;
                let fetch = match attempted.result {
                    Ok(download) => match decode_remote(&stub, &download) {
                        Ok(item) => Fetch::Item(item, download.checksum),
                        Err(message) => {
                            Fetch::Failed(SyncItemError::validation(&stub.id, message))
                        }
                    },
                    Err(e) => Fetch::Failed(SyncItemError::from_adapter(
                        &stub.id,
                        &e,
                        attempted.attempts,
                    )),
                };
                (idx, fetch)
            })
            .buffer_unordered(concurrency)
            .boxed()
            .collect()
            .await;

        let mut kept = Vec::with_capacity(work.len());
        for (idx, item_work) in work.into_iter().enumerate() {
            let Some(fetch) = fetched.remove(&idx) else {
                kept.push(item_work);
                continue;
            };
            let (item, checksum) = match fetch {
                Fetch::Item(item, checksum) => (item, checksum),
                Fetch::Failed(error) => {
                    tracing::warn!(id = %error.item_id, code = ?error.code, "remote item unavailable");
                    ledger.blocked.insert(item_work.item_id().to_string());
                    ledger.errors.push(error);
                    continue;
                }
                Fetch::Skipped => {
                    ledger.cancelled = true;
                    ledger.blocked.insert(item_work.item_id().to_string());
                    continue;
                }
            };

            let unchanged = checkpoint
                .get(&item.id)
                .map_or(false, |e| e.content_hash == item.content_hash && e.version == item.version);
            if unchanged {
                tracing::debug!(id = %item.id, "remote fingerprint moved without a content change");
                if let Some(entry) = checkpoint.entries.get_mut(&item.id) {
                    entry.remote_checksum = Some(checksum);
                    entry.listing = fingerprints.get(&item.id).cloned();
                }
                if let Work::Collide(local, _) = item_work {
                    kept.push(Work::Push(local));
                }
                continue;
            }

            remote_sums.insert(item.id.clone(), checksum);
            kept.push(match item_work {
                Work::Pull(mut r) => {
                    r.item = item;
                    Work::Pull(r)
                }
                Work::Collide(l, mut r) => {
                    r.item = item;
                    Work::Collide(l, r)
                }
                push => push,
            });
        }
        kept
    }

    fn plan(
        &self,
        work: Work,
        checkpoint: &Checkpoint,
        remote_sums: &HashMap<String, String>,
        queued: &[SyncConflict],
        options: &SyncOptions,
        ledger: &mut Ledger,
    ) -> Option<Plan> {
        let remote_key = |item: &SyncableItem| {
            checkpoint
                .get(&item.id)
                .map(|e| e.remote_key.clone())
                .unwrap_or_else(|| item.remote_key())
        };

        match work {
            Work::Push(local) => {
                let key = remote_key(&local.item);
                let mut plan = Plan::new(local.item, key);
                plan.report_pushed = true;
                if local.change_type == ChangeType::Delete {
                    plan.delete_remote = true;
                    plan.forget = true;
                } else {
                    plan.upload = true;
                }
                Some(plan)
            }
            Work::Pull(remote) => {
                let key = remote_key(&remote.item);
                let checksum = remote_sums.get(&remote.item.id).cloned();
                let mut plan = Plan::new(remote.item, key);
                plan.report_pulled = true;
                if remote.change_type == ChangeType::Delete {
                    plan.remove_local = true;
                    plan.forget = true;
                } else {
                    plan.write_local = true;
                    plan.remote_checksum = checksum;
                }
                Some(plan)
            }
            Work::Collide(local, remote) => {
                let key = remote_key(&local.item);
                let checksum = remote_sums.get(&remote.item.id).cloned();
                let base = checkpoint.base_content(&local.item.id);

                let Some(info) = self.detector.detect(base, &local, &remote) else {
                    // Both sides already agree
                    let both_deleted = local.item.is_tombstone() && remote.item.is_tombstone();
                    let mut plan = Plan::new(local.item, key);
                    plan.forget = both_deleted;
                    plan.remote_checksum = checksum;
                    return Some(plan);
                };

                let mut conflict = SyncConflict::new(local, remote);
                let decision = queued
                    .iter()
                    .find(|c| c.item_id == conflict.item_id && c.resolved)
                    .and_then(|c| c.resolution.map(|r| (c, r)));
                // Forced strategies settle the collision without a conflict record
                let forced = decision.is_none() && options.force;

                let (resolution, item) = if let Some((decided, resolution)) = decision {
                    conflict.id = decided.id.clone();
                    conflict.detected_at = decided.detected_at;
                    conflict.merged_item = decided.merged_item.clone();
                    (resolution, self.resolver.apply(&conflict, resolution, base))
                } else if options.force {
                    self.resolver.resolve_forced(&conflict, &info, options.conflict_strategy, base)
                } else {
                    match self
                        .resolver
                        .resolve(&conflict, &info, options.conflict_strategy, base)
                    {
                        ResolveOutcome::Resolved { resolution, item } => (resolution, item),
                        ResolveOutcome::Manual { reason } => {
                            if let Some(open) = queued
                                .iter()
                                .find(|c| c.item_id == conflict.item_id && !c.resolved)
                            {
                                conflict.id = open.id.clone();
                                conflict.detected_at = open.detected_at;
                            }
                            tracing::info!(
                                id = %conflict.item_id,
                                conflict = %conflict.id,
                                reason = %reason,
                                "conflict needs manual resolution"
                            );
                            ledger.conflicts.push(conflict);
                            return None;
                        }
                    }
                };

                tracing::debug!(
                    id = %conflict.item_id,
                    kind = ?info.conflict_type,
                    ?resolution,
                    "conflict resolved"
                );
                let local_deleted = conflict.local_item.is_tombstone();
                let remote_deleted = conflict.remote_item.is_tombstone();
                conflict.resolve(resolution);
                conflict.merged_item = None;
                ledger.resolved += 1;
                if !forced {
                    ledger.conflicts.push(conflict);
                }

                let mut plan = Plan::new(item, key);
                if plan.item.is_tombstone() {
                    plan.forget = true;
                    plan.delete_remote = !remote_deleted;
                    plan.remove_local = !local_deleted;
                    plan.report_pushed = plan.delete_remote;
                    plan.report_pulled = plan.remove_local;
                } else {
                    plan.upload = true;
                    plan.write_local = true;
                    plan.report_pushed = resolution != Resolution::Remote;
                    plan.report_pulled = resolution != Resolution::Local;
                }
                Some(plan)
            }
        }
    }

    /// Run uploads and deletes with bounded parallelism. Results line up
    /// with `plans`.
    async fn run_remote_legs(
        &self,
        adapter: &dyn CloudAdapter,
        policy: &RetryPolicy,
        concurrency: usize,
        direction: SyncDirection,
        plans: &[Plan],
    ) -> Vec<Leg> {
        let total = plans.len();
        let done = AtomicUsize::new(0);
        let done = &done;

        let mut legs: Vec<(usize, Leg)> = stream::iter(plans.iter().enumerate())
            .map(|(idx, plan)| async move {
                let leg = if !plan.needs_push() || !direction.allows_push() {
                    Leg::Done(None)
                } else if self.cancelled() {
                    Leg::Skipped
                } else {
                    self.push_one(adapter, policy, plan).await
                };
                self.report_progress(done.fetch_add(1, Ordering::SeqCst) + 1, total);
                (idx, leg)
            })
            .buffer_unordered(concurrency)
            .boxed()
            .collect()
            .await;

        legs.sort_by_key(|(idx, _)| *idx);
        legs.into_iter().map(|(_, leg)| leg).collect()
    }

    async fn push_one(&self, adapter: &dyn CloudAdapter, policy: &RetryPolicy, plan: &Plan) -> Leg {
        let id = &plan.item.id;
        let key = &plan.remote_key;

        if plan.delete_remote {
            let attempted = policy
                .run(RetryOp::Delete, key, || adapter.delete(key))
                .await;
            return match attempted.result {
                Ok(_) => Leg::Done(None),
                Err(e) if e.code == AdapterErrorCode::NotFound => {
                    tracing::debug!(id = %id, key = %key, "remote already gone");
                    Leg::Done(None)
                }
                Err(e) => Leg::Failed(SyncItemError::from_adapter(id, &e, attempted.attempts)),
            };
        }

        let bytes = match payload(&plan.item) {
            Ok(bytes) => bytes,
            Err(e) => return Leg::Failed(SyncItemError::validation(id, e.to_string())),
        };
        let attempted = policy
            .run(RetryOp::Upload, key, || adapter.upload(key, &bytes))
            .await;
        match attempted.result {
            Ok(uploaded) => {
                tracing::debug!(id = %id, key = %key, size = uploaded.size, "uploaded");
                Leg::Done(Some(uploaded.checksum))
            }
            Err(e) => Leg::Failed(SyncItemError::from_adapter(id, &e, attempted.attempts)),
        }
    }
}

/// Bytes uploaded for an item
fn payload(item: &SyncableItem) -> serde_json::Result<Vec<u8>> {
    serde_json::to_vec_pretty(item)
}

/// Dry runs download nothing, so a collision can only be cleared when the
/// listing checksum is the checksum of our own payload
fn agrees_with_listing(work: &Work) -> bool {
    let Work::Collide(local, remote) = work else {
        return false;
    };
    if local.item.is_tombstone()
        || remote.change_type == ChangeType::Delete
        || remote.item.content_hash.is_empty()
    {
        return false;
    }
    payload(&local.item).map_or(false, |bytes| sha256_hex(&bytes) == remote.item.content_hash)
}

/// Validate a downloaded payload against the listing it came from
fn decode_remote(
    expected: &SyncableItem,
    download: &DownloadResult,
) -> std::result::Result<SyncableItem, String> {
    if sha256_hex(&download.data) != download.checksum {
        return Err(format!(
            "checksum mismatch for {}: payload does not match upload checksum",
            expected.id
        ));
    }
    let item: SyncableItem = serde_json::from_slice(&download.data)
        .map_err(|e| format!("invalid item payload for {}: {}", expected.id, e))?;
    if !item.verify_hash() {
        return Err(format!("content hash mismatch for {}", expected.id));
    }
    if !is_valid_item_id(&item.id) {
        return Err(format!("payload for {} carries an unsafe id {:?}", expected.id, item.id));
    }
    if item.id != expected.id || item.item_type != expected.item_type {
        return Err(format!(
            "payload for {} describes {}/{}",
            expected.id, item.item_type, item.id
        ));
    }
    Ok(item)
}
