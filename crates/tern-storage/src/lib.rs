//! tern-storage: the per-node storage core of a versioned analytical
//! store.
//!
//! Data is organized into tablets, each a gap-free sequence of immutable
//! versioned rowsets. Writes buffer in memtables and flush through an
//! ordered async pipeline into segment files; a background scheduler
//! merges rowsets back down with cumulative and base compaction.
//!
//! ```no_run
//! use tern_storage::{Chunk, KeysModel, Row, StorageConfig, StorageEngine, TabletSchema};
//! use bytes::Bytes;
//!
//! # async fn demo() -> tern_storage::Result<()> {
//! let engine = StorageEngine::open(StorageConfig::default())?;
//! engine.start();
//!
//! engine.create_tablet(1, TabletSchema::new(KeysModel::Duplicate, 1))?;
//!
//! let mut writer = engine.new_delta_writer(1, 100, 1)?;
//! let mut chunk = Chunk::new();
//! chunk.push(Row::new(Bytes::from("k"), vec![Bytes::from("v")]));
//! writer.write(&chunk, &[0]).await?;
//! writer.finish().await?;
//! writer.close().await;
//!
//! engine.publish_txn(1, 100)?;
//! engine.shutdown().await;
//! # Ok(())
//! # }
//! ```

pub mod chunk;
pub mod compaction;
pub mod config;
pub mod error;
pub mod flush;
pub mod memtable;
pub mod meta;
pub mod rowset;
pub mod scheduler;
pub mod segment;
pub mod tablet;
pub mod tracker;
pub mod writer;

pub use chunk::{Chunk, KeysModel, Row, TabletSchema};
pub use compaction::{
    CompactionCandidate, CompactionKind, CompactionManager, CompactionPolicy, CompactionTask,
    DefaultCompactionPolicy, TaskState,
};
pub use config::{
    CompactionConfig, CompactionConfigHandle, FlushConfig, MemTableConfig, MemoryConfig,
    StorageConfig,
};
pub use error::{Error, Result};
pub use flush::{FlushToken, FlushTokenExecutor};
pub use memtable::MemTable;
pub use meta::{MemMetaStore, MetaStore, TabletMetaSnapshot, TxnLog, WriteManifest};
pub use rowset::{
    Rowset, RowsetData, RowsetId, RowsetMeta, RowsetReadGuard, RowsetState, TabletId, TxnId,
    Version,
};
pub use scheduler::CompactionScheduler;
pub use segment::{BincodeCodec, SegmentCodec, SegmentMeta, TabletWriter};
pub use tablet::{DataDir, Tablet, TabletManager, TabletState};
pub use tracker::MemTracker;
pub use writer::DeltaWriter;

use parking_lot::Mutex;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::info;

/// The assembled storage engine: tablet manager, write pipeline, and
/// compaction scheduler wired to a shared configuration.
pub struct StorageEngine {
    config: StorageConfig,
    mem_tracker: Arc<MemTracker>,
    meta_store: Arc<dyn MetaStore>,
    flush_executor: FlushTokenExecutor,
    compaction_manager: Arc<CompactionManager>,
    tablet_manager: Arc<TabletManager>,
    scheduler: Arc<CompactionScheduler>,
    scheduler_handle: Mutex<Option<JoinHandle<()>>>,
}

impl StorageEngine {
    /// Opens an engine with the in-memory metadata store and the default
    /// codec and compaction policy.
    pub fn open(config: StorageConfig) -> Result<Arc<Self>> {
        let policy = DefaultCompactionPolicy::new(
            config.compaction.min_cumulative_rowsets,
            config.compaction.min_base_rowsets,
        );
        Self::open_with(
            config,
            Arc::new(MemMetaStore::new()),
            Arc::new(BincodeCodec),
            Arc::new(policy),
        )
    }

    /// Opens an engine with caller-provided metadata store, segment
    /// codec, and compaction policy.
    pub fn open_with(
        config: StorageConfig,
        meta_store: Arc<dyn MetaStore>,
        codec: Arc<dyn SegmentCodec>,
        policy: Arc<dyn CompactionPolicy>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let compaction_config = CompactionConfigHandle::new(config.compaction.clone());
        let compaction_manager = CompactionManager::new(compaction_config);
        let tablet_manager = TabletManager::new(
            &config,
            Arc::clone(&meta_store),
            codec,
            policy,
            Arc::clone(&compaction_manager),
        )?;
        let scheduler =
            CompactionScheduler::new(Arc::clone(&compaction_manager), Arc::clone(&tablet_manager));
        let mem_tracker = MemTracker::root("load", config.memory.process_limit_bytes);
        let flush_executor = FlushTokenExecutor::new(config.flush.queue_capacity);
        info!(
            "storage engine opened with {} data dir(s)",
            config.data_dirs.len()
        );
        Ok(Arc::new(Self {
            config,
            mem_tracker,
            meta_store,
            flush_executor,
            compaction_manager,
            tablet_manager,
            scheduler,
            scheduler_handle: Mutex::new(None),
        }))
    }

    /// Starts the background compaction scheduler. Idempotent.
    pub fn start(&self) {
        let mut handle = self.scheduler_handle.lock();
        if handle.is_none() {
            *handle = Some(Arc::clone(&self.scheduler).start());
        }
    }

    /// Stops background work and waits for the scheduler loop to exit.
    pub async fn shutdown(&self) {
        self.scheduler.stop();
        let handle = self.scheduler_handle.lock().take();
        if let Some(handle) = handle {
            let _ = handle.await;
        }
        for id in self.tablet_manager.tablet_ids() {
            if let Ok(tablet) = self.tablet_manager.get_tablet(id) {
                tablet.close_all_rowsets();
            }
        }
        info!("storage engine shut down");
    }

    pub fn create_tablet(&self, id: TabletId, schema: TabletSchema) -> Result<Arc<Tablet>> {
        self.tablet_manager.create_tablet(id, schema)
    }

    pub fn get_tablet(&self, id: TabletId) -> Result<Arc<Tablet>> {
        self.tablet_manager.get_tablet(id)
    }

    pub fn drop_tablet(&self, id: TabletId) -> Result<()> {
        self.tablet_manager.drop_tablet(id)
    }

    /// Opens a delta writer for one (tablet, txn) pair.
    pub fn new_delta_writer(
        &self,
        tablet_id: TabletId,
        txn_id: TxnId,
        partition_id: i64,
    ) -> Result<DeltaWriter> {
        DeltaWriter::open(
            tablet_id,
            txn_id,
            partition_id,
            &self.tablet_manager,
            &self.flush_executor,
            Arc::clone(&self.meta_store),
            &self.mem_tracker,
            &self.config,
        )
    }

    /// Makes a finished transaction visible as the tablet's next version.
    pub fn publish_txn(&self, tablet_id: TabletId, txn_id: TxnId) -> Result<Version> {
        self.tablet_manager.publish_txn(tablet_id, txn_id)
    }

    /// Runs one compaction of `kind` on `tablet_id` and waits for it.
    ///
    /// Unlike the scheduler, this administrative path acquires the kind
    /// lock blockingly, so it queues behind a running background task of
    /// the same kind instead of skipping.
    pub async fn compact(&self, tablet_id: TabletId, kind: CompactionKind) -> Result<()> {
        let tablet = self.get_tablet(tablet_id)?;
        let config = self.compaction_manager.config().get();
        let min_inputs = match kind {
            CompactionKind::Cumulative => config.min_cumulative_rowsets,
            CompactionKind::Base => config.min_base_rowsets,
        };
        // Take the kind lock before snapshotting inputs, so a background
        // task of the same kind cannot retire them under this task.
        let guard = tablet.kind_lock(kind).lock_owned().await;
        let task = CompactionTask::create(
            Arc::clone(&tablet),
            kind,
            tablet.compaction_score(kind),
            self.tablet_manager.next_rowset_id(),
            config.max_input_rowsets,
            min_inputs,
        )
        .ok_or_else(|| {
            Error::Compaction(format!(
                "tablet {tablet_id} has too few rowsets for {kind} compaction"
            ))
        })?;
        task.set_kind_lock(guard);
        task.set_task_id(self.compaction_manager.next_task_id());
        if let Err(e) = self.compaction_manager.register_task(&task) {
            task.release_kind_lock();
            task.release_inputs();
            return Err(e);
        }
        tablet.register_compaction(kind, task.task_id());

        let manager = Arc::clone(&self.compaction_manager);
        let run_task = Arc::clone(&task);
        tokio::task::spawn_blocking(move || run_task.run(manager.as_ref()))
            .await
            .map_err(|e| Error::Internal(format!("compaction worker panicked: {e}")))?;

        match task.state() {
            TaskState::Finished => Ok(()),
            _ => Err(Error::Compaction(format!(
                "{kind} compaction of tablet {tablet_id} failed"
            ))),
        }
    }

    pub fn config(&self) -> &StorageConfig {
        &self.config
    }

    pub fn compaction_config(&self) -> &CompactionConfigHandle {
        self.compaction_manager.config()
    }

    pub fn mem_tracker(&self) -> &Arc<MemTracker> {
        &self.mem_tracker
    }

    pub fn tablet_manager(&self) -> &Arc<TabletManager> {
        &self.tablet_manager
    }

    pub fn compaction_manager(&self) -> &Arc<CompactionManager> {
        &self.compaction_manager
    }

    pub fn scheduler(&self) -> &Arc<CompactionScheduler> {
        &self.scheduler
    }
}
