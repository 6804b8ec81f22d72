//! Tablets and the tablet manager.
//!
//! A tablet owns a gap-free, version-ordered set of rowsets. All version
//! set mutations (publish, compaction swap) serialize on a per-tablet
//! mutation lock; readers snapshot the set under a short read lock.

use crate::chunk::TabletSchema;
use crate::compaction::{CompactionKind, CompactionManager, CompactionPolicy};
use crate::config::StorageConfig;
use crate::error::{Error, Result};
use crate::meta::{MetaStore, TabletMetaSnapshot, TxnLog};
use crate::rowset::{Rowset, RowsetId, RowsetMeta, TabletId, TxnId, Version};
use crate::segment::{SegmentCodec, SegmentRowsetData};
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicI64, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tracing::{debug, info, warn};

/// One data directory, normally one disk. Compaction concurrency is
/// limited per directory, so a slow disk cannot starve the others.
pub struct DataDir {
    path: PathBuf,
    capacity_bytes: u64,
    used_bytes: AtomicU64,
}

impl DataDir {
    pub fn new(path: PathBuf, capacity_bytes: u64) -> Self {
        Self {
            path,
            capacity_bytes,
            used_bytes: AtomicU64::new(0),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn used_bytes(&self) -> u64 {
        self.used_bytes.load(Ordering::Acquire)
    }

    pub fn add_used(&self, bytes: u64) {
        self.used_bytes.fetch_add(bytes, Ordering::AcqRel);
    }

    pub fn sub_used(&self, bytes: u64) {
        let mut cur = self.used_bytes.load(Ordering::Acquire);
        loop {
            let next = cur.saturating_sub(bytes);
            match self.used_bytes.compare_exchange_weak(
                cur,
                next,
                Ordering::AcqRel,
                Ordering::Acquire,
            ) {
                Ok(_) => return,
                Err(observed) => cur = observed,
            }
        }
    }

    /// Whether writing `incoming` more bytes would overflow the
    /// configured capacity (0 = unlimited).
    pub fn reach_capacity_limit(&self, incoming: u64) -> bool {
        self.capacity_bytes > 0 && self.used_bytes() + incoming > self.capacity_bytes
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TabletState {
    Running,
    Dropped,
}

pub struct Tablet {
    id: TabletId,
    schema: TabletSchema,
    data_dir: Arc<DataDir>,
    /// `<data_dir>/data/<tablet_id>`, where segment files live.
    data_path: PathBuf,
    state: Mutex<TabletState>,
    /// Visible rowsets, sorted by version end. Gap-free by construction.
    versions: RwLock<Vec<Arc<Rowset>>>,
    /// Rowsets swapped out by compaction, awaiting reader drain and file
    /// deletion.
    stale: Mutex<Vec<Arc<Rowset>>>,
    /// Serializes version set mutations.
    mutation_lock: Mutex<()>,
    /// Held for the duration of a compaction task of the matching kind.
    cumulative_lock: Arc<tokio::sync::Mutex<()>>,
    base_lock: Arc<tokio::sync::Mutex<()>>,
    /// Versions ending before this point belong to the base level.
    cumulative_point: AtomicI64,
    last_cumulative_failure: Mutex<Option<Instant>>,
    last_base_failure: Mutex<Option<Instant>>,
    /// Task id of the running compaction per kind.
    running_compactions: Mutex<HashMap<CompactionKind, u64>>,
    codec: Arc<dyn SegmentCodec>,
    meta_store: Arc<dyn MetaStore>,
    policy: Arc<dyn CompactionPolicy>,
}

impl Tablet {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        id: TabletId,
        schema: TabletSchema,
        data_dir: Arc<DataDir>,
        codec: Arc<dyn SegmentCodec>,
        meta_store: Arc<dyn MetaStore>,
        policy: Arc<dyn CompactionPolicy>,
    ) -> Result<Arc<Self>> {
        let data_path = data_dir.path().join("data").join(id.to_string());
        fs::create_dir_all(&data_path)?;
        Ok(Arc::new(Self {
            id,
            schema,
            data_dir,
            data_path,
            state: Mutex::new(TabletState::Running),
            versions: RwLock::new(Vec::new()),
            stale: Mutex::new(Vec::new()),
            mutation_lock: Mutex::new(()),
            cumulative_lock: Arc::new(tokio::sync::Mutex::new(())),
            base_lock: Arc::new(tokio::sync::Mutex::new(())),
            cumulative_point: AtomicI64::new(0),
            last_cumulative_failure: Mutex::new(None),
            last_base_failure: Mutex::new(None),
            running_compactions: Mutex::new(HashMap::new()),
            codec,
            meta_store,
            policy,
        }))
    }

    pub fn id(&self) -> TabletId {
        self.id
    }

    pub fn schema(&self) -> &TabletSchema {
        &self.schema
    }

    pub fn data_dir(&self) -> &Arc<DataDir> {
        &self.data_dir
    }

    pub fn data_path(&self) -> &Path {
        &self.data_path
    }

    pub fn codec(&self) -> &Arc<dyn SegmentCodec> {
        &self.codec
    }

    pub fn state(&self) -> TabletState {
        *self.state.lock()
    }

    pub fn is_running(&self) -> bool {
        self.state() == TabletState::Running
    }

    pub fn set_dropped(&self) {
        *self.state.lock() = TabletState::Dropped;
    }

    /// Snapshot of the visible rowsets in version order.
    pub fn rowsets(&self) -> Vec<Arc<Rowset>> {
        self.versions.read().clone()
    }

    pub fn num_rowsets(&self) -> usize {
        self.versions.read().len()
    }

    pub fn max_version(&self) -> i64 {
        self.versions
            .read()
            .last()
            .and_then(|r| r.version())
            .map(|v| v.end)
            .unwrap_or(0)
    }

    /// Version a newly published rowset would receive.
    pub fn next_version(&self) -> i64 {
        self.max_version() + 1
    }

    pub fn cumulative_point(&self) -> i64 {
        self.cumulative_point.load(Ordering::Acquire)
    }

    pub fn set_cumulative_point(&self, point: i64) {
        self.cumulative_point.store(point, Ordering::Release);
    }

    /// Publishes a new rowset at `version`. The version must extend the
    /// set without a gap.
    pub fn publish_rowset(&self, rowset: Arc<Rowset>, version: Version) -> Result<()> {
        let _guard = self.mutation_lock.lock();
        if !self.is_running() {
            return Err(Error::TabletNotRunning(self.id));
        }
        let expected = self.next_version();
        if version.start != expected {
            return Err(Error::VersionConflict {
                tablet_id: self.id,
                reason: format!("expected version {expected}, got {version}"),
            });
        }
        rowset.make_visible(version)?;
        rowset.load()?;
        self.data_dir.add_used(rowset.data_size());
        self.versions.write().push(rowset);
        self.save_meta()?;
        debug!("tablet {} published version {version}", self.id);
        Ok(())
    }

    /// Atomically replaces `inputs` with `output`. The output version must
    /// cover exactly the contiguous range of the inputs.
    pub fn replace_rowsets(
        &self,
        inputs: &[Arc<Rowset>],
        output: Arc<Rowset>,
        version: Version,
    ) -> Result<()> {
        let _guard = self.mutation_lock.lock();
        if !self.is_running() {
            return Err(Error::TabletNotRunning(self.id));
        }
        let input_versions: Vec<Version> = inputs
            .iter()
            .map(|r| {
                r.version().ok_or_else(|| Error::VersionConflict {
                    tablet_id: self.id,
                    reason: "compaction input has no version".to_string(),
                })
            })
            .collect::<Result<_>>()?;
        let (Some(first), Some(last)) = (input_versions.first(), input_versions.last()) else {
            return Err(Error::VersionConflict {
                tablet_id: self.id,
                reason: "compaction replaced nothing".to_string(),
            });
        };
        if version.start != first.start || version.end != last.end {
            return Err(Error::VersionConflict {
                tablet_id: self.id,
                reason: format!(
                    "output version {version} does not cover inputs [{}-{}]",
                    first.start, last.end
                ),
            });
        }
        for pair in input_versions.windows(2) {
            if pair[1].start != pair[0].end + 1 {
                return Err(Error::VersionConflict {
                    tablet_id: self.id,
                    reason: format!(
                        "compaction inputs not contiguous at {} -> {}",
                        pair[0], pair[1]
                    ),
                });
            }
        }
        // The inputs were snapshotted before this lock was taken; a swap
        // that already retired one of them must not publish a second
        // rowset over the same range.
        {
            let versions = self.versions.read();
            for input in inputs {
                if !versions.iter().any(|r| r.rowset_id() == input.rowset_id()) {
                    return Err(Error::VersionConflict {
                        tablet_id: self.id,
                        reason: format!(
                            "compaction input {} no longer in the version set",
                            input.rowset_id()
                        ),
                    });
                }
            }
        }

        output.make_visible(version)?;
        output.load()?;
        self.data_dir.add_used(output.data_size());

        {
            let mut versions = self.versions.write();
            versions.retain(|r| !inputs.iter().any(|i| i.rowset_id() == r.rowset_id()));
            versions.push(output);
            versions.sort_by(Rowset::compare_by_version);
        }

        let mut stale = self.stale.lock();
        for input in inputs {
            input.set_need_delete_file();
            input.close();
            stale.push(Arc::clone(input));
        }
        drop(stale);

        self.save_meta()?;
        info!(
            "tablet {} compacted {} rowsets into version {version}",
            self.id,
            inputs.len()
        );
        Ok(())
    }

    /// Input rowsets for a compaction of `kind`, oldest first, capped at
    /// `max_inputs`.
    pub fn pick_compaction_inputs(
        &self,
        kind: CompactionKind,
        max_inputs: usize,
    ) -> Vec<Arc<Rowset>> {
        let cp = self.cumulative_point();
        let versions = self.versions.read();
        versions
            .iter()
            .filter(|r| match (kind, r.version()) {
                (CompactionKind::Cumulative, Some(v)) => v.start >= cp,
                (CompactionKind::Base, Some(v)) => v.end < cp,
                (_, None) => false,
            })
            .take(max_inputs)
            .cloned()
            .collect()
    }

    /// Candidate score for `kind`; zero means no compaction is needed.
    pub fn compaction_score(&self, kind: CompactionKind) -> f64 {
        let cp = self.cumulative_point();
        let rowsets = self.rowsets();
        self.policy.score(kind, cp, &rowsets)
    }

    pub fn need_compaction(&self, kind: CompactionKind) -> bool {
        self.compaction_score(kind) > 0.0
    }

    /// Lock a compaction task of `kind` must hold while running. Cloned
    /// so the guard can be acquired with `try_lock_owned` and moved into
    /// the task.
    pub fn kind_lock(&self, kind: CompactionKind) -> Arc<tokio::sync::Mutex<()>> {
        match kind {
            CompactionKind::Cumulative => Arc::clone(&self.cumulative_lock),
            CompactionKind::Base => Arc::clone(&self.base_lock),
        }
    }

    pub fn register_compaction(&self, kind: CompactionKind, task_id: u64) {
        self.running_compactions.lock().insert(kind, task_id);
    }

    pub fn has_running_compaction(&self, kind: CompactionKind) -> bool {
        self.running_compactions.lock().contains_key(&kind)
    }

    pub fn reset_compaction(&self, kind: CompactionKind) {
        self.running_compactions.lock().remove(&kind);
    }

    pub fn set_last_failure_time(&self, kind: CompactionKind, at: Instant) {
        match kind {
            CompactionKind::Cumulative => *self.last_cumulative_failure.lock() = Some(at),
            CompactionKind::Base => *self.last_base_failure.lock() = Some(at),
        }
    }

    pub fn clear_last_failure_time(&self, kind: CompactionKind) {
        match kind {
            CompactionKind::Cumulative => *self.last_cumulative_failure.lock() = None,
            CompactionKind::Base => *self.last_base_failure.lock() = None,
        }
    }

    /// Time since the last failed compaction of `kind`, if any.
    pub fn last_failure_elapsed(&self, kind: CompactionKind) -> Option<std::time::Duration> {
        let slot = match kind {
            CompactionKind::Cumulative => self.last_cumulative_failure.lock(),
            CompactionKind::Base => self.last_base_failure.lock(),
        };
        slot.map(|at| at.elapsed())
    }

    /// Deletes files of stale rowsets whose readers have all drained.
    pub fn purge_stale_rowsets(&self) {
        let mut stale = self.stale.lock();
        stale.retain(|rowset| {
            if rowset.refs_by_reader() > 0 {
                return true;
            }
            if rowset.need_delete_file() {
                match rowset.remove() {
                    Ok(()) => {
                        self.data_dir.sub_used(rowset.data_size());
                        debug!(
                            "tablet {} removed stale rowset {}",
                            self.id,
                            rowset.rowset_id()
                        );
                    }
                    Err(e) => {
                        warn!(
                            "tablet {} failed to remove rowset {}: {e}",
                            self.id,
                            rowset.rowset_id()
                        );
                        return true;
                    }
                }
            }
            false
        });
    }

    pub fn num_stale_rowsets(&self) -> usize {
        self.stale.lock().len()
    }

    /// Reads every visible row in version order, for verification.
    pub fn scan_all(&self) -> Result<Vec<crate::chunk::Row>> {
        let rowsets = self.rowsets();
        let guards = crate::rowset::acquire_readers(&rowsets);
        let mut out = Vec::new();
        for guard in &guards {
            for iter in guard.segment_iterators()? {
                for row in iter {
                    out.push(row?);
                }
            }
        }
        Ok(out)
    }

    fn save_meta(&self) -> Result<()> {
        let versions = self.versions.read();
        let rowsets = versions
            .iter()
            .filter_map(|r| r.version().map(|v| (r.meta().clone(), v)))
            .collect();
        drop(versions);
        self.meta_store.save_tablet_meta(TabletMetaSnapshot {
            tablet_id: self.id,
            schema: self.schema.clone(),
            cumulative_point: self.cumulative_point(),
            rowsets,
        })
    }

    /// Closes every rowset. Used on drop and shutdown.
    pub fn close_all_rowsets(&self) {
        for rowset in self.rowsets() {
            rowset.close();
        }
        for rowset in self.stale.lock().iter() {
            rowset.close();
        }
    }
}

pub struct TabletManager {
    data_dirs: Vec<Arc<DataDir>>,
    tablets: RwLock<HashMap<TabletId, Arc<Tablet>>>,
    meta_store: Arc<dyn MetaStore>,
    codec: Arc<dyn SegmentCodec>,
    policy: Arc<dyn CompactionPolicy>,
    next_rowset_id: AtomicU64,
    compaction_manager: Arc<CompactionManager>,
}

impl TabletManager {
    pub fn new(
        config: &StorageConfig,
        meta_store: Arc<dyn MetaStore>,
        codec: Arc<dyn SegmentCodec>,
        policy: Arc<dyn CompactionPolicy>,
        compaction_manager: Arc<CompactionManager>,
    ) -> Result<Arc<Self>> {
        let mut data_dirs = Vec::with_capacity(config.data_dirs.len());
        for path in &config.data_dirs {
            fs::create_dir_all(path)?;
            data_dirs.push(Arc::new(DataDir::new(
                path.clone(),
                config.data_dir_capacity_bytes,
            )));
        }
        Ok(Arc::new(Self {
            data_dirs,
            tablets: RwLock::new(HashMap::new()),
            meta_store,
            codec,
            policy,
            next_rowset_id: AtomicU64::new(1),
            compaction_manager,
        }))
    }

    pub fn data_dirs(&self) -> &[Arc<DataDir>] {
        &self.data_dirs
    }

    pub fn compaction_manager(&self) -> &Arc<CompactionManager> {
        &self.compaction_manager
    }

    pub fn next_rowset_id(&self) -> RowsetId {
        RowsetId(self.next_rowset_id.fetch_add(1, Ordering::AcqRel))
    }

    pub fn create_tablet(&self, id: TabletId, schema: TabletSchema) -> Result<Arc<Tablet>> {
        let mut tablets = self.tablets.write();
        if tablets.contains_key(&id) {
            return Err(Error::Internal(format!("tablet {id} already exists")));
        }
        // spread tablets across directories by id
        let dir = &self.data_dirs[(id as u64 % self.data_dirs.len() as u64) as usize];
        let tablet = Tablet::new(
            id,
            schema,
            Arc::clone(dir),
            Arc::clone(&self.codec),
            Arc::clone(&self.meta_store),
            Arc::clone(&self.policy),
        )?;
        tablets.insert(id, Arc::clone(&tablet));
        info!("created tablet {id} in {}", dir.path().display());
        Ok(tablet)
    }

    pub fn get_tablet(&self, id: TabletId) -> Result<Arc<Tablet>> {
        self.tablets
            .read()
            .get(&id)
            .cloned()
            .ok_or(Error::TabletNotFound(id))
    }

    pub fn drop_tablet(&self, id: TabletId) -> Result<()> {
        let tablet = self
            .tablets
            .write()
            .remove(&id)
            .ok_or(Error::TabletNotFound(id))?;
        tablet.set_dropped();
        tablet.close_all_rowsets();
        self.meta_store.remove_tablet_meta(id)?;
        info!("dropped tablet {id}");
        Ok(())
    }

    pub fn tablet_ids(&self) -> Vec<TabletId> {
        self.tablets.read().keys().copied().collect()
    }

    /// Turns a staged transaction into a visible version and refreshes the
    /// tablet's compaction candidacy.
    pub fn publish_txn(&self, tablet_id: TabletId, txn_id: TxnId) -> Result<Version> {
        let tablet = self.get_tablet(tablet_id)?;
        let log = self.meta_store.take_txn_log(tablet_id, txn_id)?;
        let version = Version::single(tablet.next_version());
        let rowset = self.rowset_from_txn_log(&tablet, &log);
        if let Err(e) = tablet.publish_rowset(rowset, version) {
            // put the log back so publish can be retried
            self.meta_store.put_txn_log(log)?;
            return Err(e);
        }
        self.compaction_manager.update_tablet_candidates(&tablet);
        Ok(version)
    }

    fn rowset_from_txn_log(&self, tablet: &Arc<Tablet>, log: &TxnLog) -> Arc<Rowset> {
        let manifest = &log.write;
        let segments: Vec<String> = manifest
            .segments
            .iter()
            .map(|s| s.file_name.clone())
            .collect();
        let meta = RowsetMeta {
            rowset_id: manifest.rowset_id,
            tablet_id: log.tablet_id,
            txn_id: log.txn_id,
            partition_id: log.partition_id,
            segments: segments.clone(),
            delete_files: Vec::new(),
            num_rows: manifest.num_rows,
            data_size: manifest.data_size,
            overlapped: manifest.overlapped,
            schema: tablet.schema().clone(),
            creation_time: crate::rowset::unix_now(),
        };
        let data = Box::new(SegmentRowsetData::new(
            tablet.data_path().to_path_buf(),
            segments,
            Arc::clone(&self.codec),
        ));
        Rowset::new(meta, data)
    }
}
