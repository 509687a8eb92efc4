//! Background sync worker with debouncing

use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{interval, Instant, MissedTickBehavior};

use super::engine::SyncEngine;
use crate::config::SyncOptions;
use crate::error::{Result, SyncError};
use crate::types::SyncDirection;

/// Commands for the sync worker
#[derive(Debug)]
pub enum SyncCommand {
    /// Trigger a sync (direction, force)
    Sync(SyncDirection, bool),
    /// Mark local data as dirty (triggers debounced sync)
    MarkDirty,
    /// Stop the worker
    Stop,
}

/// Worker timing
#[derive(Debug, Clone)]
pub struct WorkerConfig {
    /// Quiet period after the last `MarkDirty` before syncing
    pub debounce: Duration,
    /// Periodic sync, if any
    pub interval: Option<Duration>,
    /// Options for every pass; direction and force are overridden per command
    pub options: SyncOptions,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        Self {
            debounce: Duration::from_secs(2),
            interval: None,
            options: SyncOptions::default(),
        }
    }
}

/// Background sync worker
pub struct SyncWorker {
    sender: mpsc::Sender<SyncCommand>,
    handle: JoinHandle<()>,
}

impl SyncWorker {
    /// Start the sync worker
    pub fn start(engine: Arc<SyncEngine>, config: WorkerConfig) -> Self {
        let (sender, mut receiver) = mpsc::channel::<SyncCommand>(100);

        let handle = tokio::spawn(async move {
            let mut last_dirty: Option<Instant> = None;
            let mut check_interval = interval(Duration::from_millis(250));
            check_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);
            let mut last_sync = Instant::now();

            loop {
                tokio::select! {
                    cmd = receiver.recv() => {
                        match cmd {
                            Some(SyncCommand::Sync(direction, force)) => {
                                let mut options = config.options.clone();
                                options.direction = direction;
                                options.force = force;
                                Self::do_sync(&engine, options).await;
                                last_dirty = None;
                                last_sync = Instant::now();
                            }
                            Some(SyncCommand::MarkDirty) => {
                                last_dirty = Some(Instant::now());
                            }
                            Some(SyncCommand::Stop) | None => {
                                // Flush pending local edits before stopping
                                if last_dirty.is_some() {
                                    Self::do_sync(&engine, config.options.clone()).await;
                                }
                                break;
                            }
                        }
                    }
                    _ = check_interval.tick() => {
                        let debounced = last_dirty
                            .map_or(false, |dirty| dirty.elapsed() >= config.debounce);
                        let due = config
                            .interval
                            .map_or(false, |every| last_sync.elapsed() >= every);
                        if debounced || due {
                            Self::do_sync(&engine, config.options.clone()).await;
                            last_dirty = None;
                            last_sync = Instant::now();
                        }
                    }
                }
            }

            tracing::info!("Sync worker stopped");
        });

        Self { sender, handle }
    }

    /// Perform the actual sync operation
    async fn do_sync(engine: &SyncEngine, options: SyncOptions) {
        let direction = options.direction;
        match engine.perform_sync(options).await {
            Ok(result) => {
                tracing::info!(
                    ?direction,
                    pushed = result.pushed.len(),
                    pulled = result.pulled.len(),
                    conflicts = result.conflicts.len(),
                    errors = result.errors.len(),
                    "Background sync completed in {}ms",
                    result.duration_ms
                );
            }
            Err(SyncError::InProgress) => {
                tracing::debug!("Background sync skipped: a pass is already running");
            }
            Err(e) => {
                tracing::error!("Background sync {:?} failed: {}", direction, e);
            }
        }
    }

    async fn send(&self, command: SyncCommand) -> Result<()> {
        self.sender
            .send(command)
            .await
            .map_err(|_| SyncError::Internal("Worker channel closed".to_string()))
    }

    /// Trigger a sync
    pub async fn sync(&self, direction: SyncDirection, force: bool) -> Result<()> {
        self.send(SyncCommand::Sync(direction, force)).await
    }

    /// Mark data as dirty (triggers debounced sync)
    pub async fn mark_dirty(&self) -> Result<()> {
        self.send(SyncCommand::MarkDirty).await
    }

    /// Stop the worker and wait for it to exit
    pub async fn stop(self) -> Result<()> {
        self.send(SyncCommand::Stop).await?;
        self.handle
            .await
            .map_err(|e| SyncError::Internal(format!("sync worker panicked: {}", e)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::LocalConfig;
    use crate::sync::adapter::LocalAdapter;
    use crate::sync::checkpoint::MemoryCheckpointStore;
    use crate::sync::store::MemoryStore;
    use crate::types::{ItemType, SyncableItem};

    async fn engine(dir: &std::path::Path, store: Arc<MemoryStore>) -> Arc<SyncEngine> {
        let engine = Arc::new(SyncEngine::new(store, Arc::new(MemoryCheckpointStore::new())));
        let adapter = LocalAdapter::new(LocalConfig {
            base_dir: dir.to_path_buf(),
            timeout_ms: 5_000,
            max_retries: Some(1),
        });
        engine.set_adapter(Arc::new(adapter)).await;
        engine
    }

    #[tokio::test]
    async fn test_explicit_sync_command() {
        let remote = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::with_items([SyncableItem::new(
            "a",
            ItemType::Skills,
            "a",
            "hello",
        )]));
        let engine = engine(remote.path(), store).await;

        let worker = SyncWorker::start(engine.clone(), WorkerConfig::default());
        worker.sync(SyncDirection::Push, false).await.unwrap();
        worker.stop().await.unwrap();

        assert_eq!(engine.state().stats.pushed, 1);
        assert!(remote.path().join("skills/a.json").is_file());
    }

    #[tokio::test]
    async fn test_dirty_flushes_on_stop() {
        let remote = tempfile::tempdir().unwrap();
        let store = Arc::new(MemoryStore::new());
        let engine = engine(remote.path(), store.clone()).await;

        let worker = SyncWorker::start(
            engine.clone(),
            WorkerConfig {
                debounce: Duration::from_secs(3600),
                ..Default::default()
            },
        );
        store.insert(SyncableItem::new("late", ItemType::Workflows, "late", "steps"));
        worker.mark_dirty().await.unwrap();
        worker.stop().await.unwrap();

        assert!(remote.path().join("workflows/late.json").is_file());
    }
}
