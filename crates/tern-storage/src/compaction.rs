//! Compaction candidates, the compaction manager, and task execution.
//!
//! Tablets are scored into a priority queue whenever their version set
//! changes. The scheduler pops the best candidate, re-validates it, and
//! runs the task on the worker pool. Stale queue entries are handled by
//! lazy deletion: the authoritative score lives in a side map and heap
//! entries that no longer match are dropped on pop.

use crate::chunk::KeysModel;
use crate::config::CompactionConfigHandle;
use crate::error::{Error, Result};
use crate::rowset::{
    acquire_readers, Rowset, RowsetData, RowsetId, RowsetMeta, RowsetReadGuard, TabletId, Version,
};
use crate::segment::{SegmentRowsetData, TabletWriter};
use crate::tablet::Tablet;
use bytes::Bytes;
use parking_lot::Mutex;
use std::cmp::{Ordering as CmpOrdering, Reverse};
use std::collections::{BinaryHeap, HashMap};
use std::fmt;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;
use tokio::sync::{Notify, OwnedMutexGuard};
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompactionKind {
    /// Merges recently published rowsets above the cumulative point.
    Cumulative,
    /// Merges everything below the cumulative point into one base rowset.
    Base,
}

impl fmt::Display for CompactionKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CompactionKind::Cumulative => write!(f, "cumulative"),
            CompactionKind::Base => write!(f, "base"),
        }
    }
}

/// Scores a tablet for compaction. Zero means nothing to do.
pub trait CompactionPolicy: Send + Sync {
    fn score(&self, kind: CompactionKind, cumulative_point: i64, rowsets: &[Arc<Rowset>]) -> f64;
}

/// Counts rowsets on each side of the cumulative point. A side scores
/// its rowset count once the per-kind minimum is reached.
pub struct DefaultCompactionPolicy {
    min_cumulative_rowsets: usize,
    min_base_rowsets: usize,
}

impl DefaultCompactionPolicy {
    pub fn new(min_cumulative_rowsets: usize, min_base_rowsets: usize) -> Self {
        Self {
            min_cumulative_rowsets,
            min_base_rowsets,
        }
    }
}

impl CompactionPolicy for DefaultCompactionPolicy {
    fn score(&self, kind: CompactionKind, cumulative_point: i64, rowsets: &[Arc<Rowset>]) -> f64 {
        let count = rowsets
            .iter()
            .filter(|r| match (kind, r.version()) {
                (CompactionKind::Cumulative, Some(v)) => v.start >= cumulative_point,
                (CompactionKind::Base, Some(v)) => v.end < cumulative_point,
                (_, None) => false,
            })
            .count();
        let min = match kind {
            CompactionKind::Cumulative => self.min_cumulative_rowsets,
            CompactionKind::Base => self.min_base_rowsets,
        };
        if count >= min {
            count as f64
        } else {
            0.0
        }
    }
}

/// One (tablet, kind) entry in the candidate queue.
#[derive(Clone)]
pub struct CompactionCandidate {
    pub tablet: Arc<Tablet>,
    pub kind: CompactionKind,
    pub score: f64,
}

impl CompactionCandidate {
    fn key(&self) -> (TabletId, CompactionKind) {
        (self.tablet.id(), self.kind)
    }
}

impl PartialEq for CompactionCandidate {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == CmpOrdering::Equal
    }
}

impl Eq for CompactionCandidate {}

impl PartialOrd for CompactionCandidate {
    fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
        Some(self.cmp(other))
    }
}

impl Ord for CompactionCandidate {
    fn cmp(&self, other: &Self) -> CmpOrdering {
        // max-heap: highest score wins, ties broken deterministically
        self.score
            .total_cmp(&other.score)
            .then_with(|| other.tablet.id().cmp(&self.tablet.id()))
            .then_with(|| (self.kind == CompactionKind::Base).cmp(&(other.kind == CompactionKind::Base)))
    }
}

struct CandidateQueue {
    heap: BinaryHeap<CompactionCandidate>,
    /// Authoritative latest score per (tablet, kind); heap entries not
    /// matching this are stale and dropped on pop.
    members: HashMap<(TabletId, CompactionKind), f64>,
}

struct RunningCompaction {
    tablet_id: TabletId,
    kind: CompactionKind,
    dir: PathBuf,
}

/// Tracks candidates and running tasks node-wide.
pub struct CompactionManager {
    config: CompactionConfigHandle,
    candidates: Mutex<CandidateQueue>,
    running: Mutex<HashMap<u64, RunningCompaction>>,
    next_task_id: AtomicU64,
    notify: Notify,
}

impl CompactionManager {
    pub fn new(config: CompactionConfigHandle) -> Arc<Self> {
        Arc::new(Self {
            config,
            candidates: Mutex::new(CandidateQueue {
                heap: BinaryHeap::new(),
                members: HashMap::new(),
            }),
            running: Mutex::new(HashMap::new()),
            next_task_id: AtomicU64::new(1),
            notify: Notify::new(),
        })
    }

    pub fn config(&self) -> &CompactionConfigHandle {
        &self.config
    }

    pub fn next_task_id(&self) -> u64 {
        self.next_task_id.fetch_add(1, Ordering::AcqRel)
    }

    /// Inserts or rescores one candidate and wakes the scheduler.
    pub fn update_candidate(&self, candidate: CompactionCandidate) {
        {
            let mut queue = self.candidates.lock();
            if candidate.score > 0.0 {
                queue.members.insert(candidate.key(), candidate.score);
                queue.heap.push(candidate);
            } else {
                queue.members.remove(&candidate.key());
            }
        }
        self.notify_scheduler();
    }

    /// Batch reinsertion, used by the scheduler to put requeued
    /// candidates back after a pick round.
    pub fn insert_candidates(&self, candidates: Vec<CompactionCandidate>) {
        if candidates.is_empty() {
            return;
        }
        let mut queue = self.candidates.lock();
        for candidate in candidates {
            if candidate.score > 0.0 {
                queue.members.insert(candidate.key(), candidate.score);
                queue.heap.push(candidate);
            }
        }
    }

    /// Rescores both kinds for `tablet`.
    pub fn update_tablet_candidates(&self, tablet: &Arc<Tablet>) {
        for kind in [CompactionKind::Cumulative, CompactionKind::Base] {
            self.update_candidate(CompactionCandidate {
                tablet: Arc::clone(tablet),
                kind,
                score: tablet.compaction_score(kind),
            });
        }
    }

    /// Pops the best live candidate, skipping stale heap entries.
    pub fn pick_candidate(&self) -> Option<CompactionCandidate> {
        let mut queue = self.candidates.lock();
        while let Some(candidate) = queue.heap.pop() {
            match queue.members.get(&candidate.key()) {
                Some(score) if score.to_bits() == candidate.score.to_bits() => {
                    queue.members.remove(&candidate.key());
                    return Some(candidate);
                }
                _ => continue, // stale entry
            }
        }
        None
    }

    pub fn candidates_size(&self) -> usize {
        self.candidates.lock().members.len()
    }

    pub fn running_tasks_num(&self) -> usize {
        self.running.lock().len()
    }

    pub fn check_if_exceed_max_task_num(&self) -> bool {
        let max = self.config.get().max_task_num;
        let running = self.running_tasks_num();
        if running >= max {
            debug!("running compaction tasks {running} reach limit {max}");
            true
        } else {
            false
        }
    }

    /// Registers a task against the global ceiling. The ceiling is hard:
    /// registration fails rather than overshoots.
    pub fn register_task(&self, task: &Arc<CompactionTask>) -> Result<()> {
        let max = self.config.get().max_task_num;
        let mut running = self.running.lock();
        if running.len() >= max {
            return Err(Error::Compaction(format!(
                "running tasks reach max_task_num {max}"
            )));
        }
        running.insert(
            task.task_id(),
            RunningCompaction {
                tablet_id: task.tablet.id(),
                kind: task.kind,
                dir: task.tablet.data_dir().path().to_path_buf(),
            },
        );
        Ok(())
    }

    pub fn unregister_task(&self, task_id: u64) {
        self.running.lock().remove(&task_id);
    }

    pub fn running_tasks_num_for_dir(&self, kind: CompactionKind, dir: &std::path::Path) -> usize {
        self.running
            .lock()
            .values()
            .filter(|t| t.kind == kind && t.dir == dir)
            .count()
    }

    pub fn has_running_task_for_tablet(&self, tablet_id: TabletId, kind: CompactionKind) -> bool {
        self.running
            .lock()
            .values()
            .any(|t| t.tablet_id == tablet_id && t.kind == kind)
    }

    pub fn notify_scheduler(&self) {
        self.notify.notify_one();
    }

    pub async fn wait_notified(&self) {
        self.notify.notified().await;
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TaskState {
    Created,
    Running,
    Finished,
    Failed,
}

/// One compaction execution: a frozen input set, the output version, and
/// the locks that keep the inputs alive and the kind exclusive.
pub struct CompactionTask {
    task_id: AtomicU64,
    pub tablet: Arc<Tablet>,
    pub kind: CompactionKind,
    pub score: f64,
    output_rowset_id: RowsetId,
    inputs: Vec<Arc<Rowset>>,
    /// Read guards pinning the inputs against teardown while the task
    /// runs.
    input_guards: Mutex<Vec<RowsetReadGuard>>,
    input_size: u64,
    output_version: Version,
    state: Mutex<TaskState>,
    /// Owned guard on the tablet's per-kind lock, installed by the
    /// scheduler, released when the task retires.
    kind_lock: Mutex<Option<OwnedMutexGuard<()>>>,
}

impl CompactionTask {
    /// Freezes the input set for a compaction of `kind`. Returns `None`
    /// when the tablet has too few qualifying rowsets, which the caller
    /// treats as a structural discard.
    pub fn create(
        tablet: Arc<Tablet>,
        kind: CompactionKind,
        score: f64,
        output_rowset_id: RowsetId,
        max_input_rowsets: usize,
        min_input_rowsets: usize,
    ) -> Option<Arc<Self>> {
        let inputs = tablet.pick_compaction_inputs(kind, max_input_rowsets);
        if inputs.len() < min_input_rowsets {
            return None;
        }
        let first = inputs.first()?.version()?;
        let last = inputs.last()?.version()?;
        let input_guards = acquire_readers(&inputs);
        let input_size = inputs.iter().map(|r| r.data_size()).sum();
        Some(Arc::new(Self {
            task_id: AtomicU64::new(0),
            tablet,
            kind,
            score,
            output_rowset_id,
            inputs,
            input_guards: Mutex::new(input_guards),
            input_size,
            output_version: Version::new(first.start, last.end),
            state: Mutex::new(TaskState::Created),
            kind_lock: Mutex::new(None),
        }))
    }

    pub fn task_id(&self) -> u64 {
        self.task_id.load(Ordering::Acquire)
    }

    pub fn set_task_id(&self, id: u64) {
        self.task_id.store(id, Ordering::Release);
    }

    pub fn state(&self) -> TaskState {
        *self.state.lock()
    }

    pub fn input_size(&self) -> u64 {
        self.input_size
    }

    pub fn num_inputs(&self) -> usize {
        self.inputs.len()
    }

    pub fn output_version(&self) -> Version {
        self.output_version
    }

    pub fn set_kind_lock(&self, guard: OwnedMutexGuard<()>) {
        *self.kind_lock.lock() = Some(guard);
    }

    pub fn has_kind_lock(&self) -> bool {
        self.kind_lock.lock().is_some()
    }

    pub fn release_kind_lock(&self) {
        *self.kind_lock.lock() = None;
    }

    /// Releases the input read guards. Called on completion and on
    /// abandonment before run.
    pub fn release_inputs(&self) {
        self.input_guards.lock().clear();
    }

    /// A fresh candidate for this tablet and kind, rescored.
    pub fn to_candidate(&self) -> CompactionCandidate {
        CompactionCandidate {
            tablet: Arc::clone(&self.tablet),
            kind: self.kind,
            score: self.tablet.compaction_score(self.kind),
        }
    }

    /// Runs the compaction to completion, then retires the task: drops
    /// locks and guards, updates failure bookkeeping, and requeues the
    /// tablet when the failure is worth retrying.
    pub fn run(&self, manager: &CompactionManager) {
        *self.state.lock() = TaskState::Running;
        let started = Instant::now();
        let result = self.do_compact();

        match &result {
            Ok(()) => {
                *self.state.lock() = TaskState::Finished;
                self.tablet.clear_last_failure_time(self.kind);
                info!(
                    "{} compaction of tablet {} finished, inputs: {}, output: {}, elapsed: {:?}",
                    self.kind,
                    self.tablet.id(),
                    self.inputs.len(),
                    self.output_version,
                    started.elapsed()
                );
            }
            Err(e) => {
                *self.state.lock() = TaskState::Failed;
                self.tablet.set_last_failure_time(self.kind, Instant::now());
                warn!(
                    "{} compaction of tablet {} failed: {e}",
                    self.kind,
                    self.tablet.id()
                );
            }
        }

        self.release_inputs();
        self.tablet.reset_compaction(self.kind);
        self.release_kind_lock();
        manager.unregister_task(self.task_id());

        if result.is_err() {
            // transient failure: the tablet goes back in the queue and the
            // cooldown keeps it from spinning
            manager.update_candidate(self.to_candidate());
        } else {
            self.tablet.purge_stale_rowsets();
            manager.update_tablet_candidates(&self.tablet);
        }
        manager.notify_scheduler();
    }

    fn do_compact(&self) -> Result<()> {
        let mut writer = TabletWriter::new(
            self.tablet.data_path().to_path_buf(),
            self.output_rowset_id,
            Arc::clone(self.tablet.codec()),
            self.tablet.schema().clone(),
        );
        match self.merge_into(&mut writer) {
            Ok(()) => {}
            Err(e) => {
                writer.close();
                return Err(e);
            }
        }
        let segments = writer.finish()?;
        let names: Vec<String> = segments.iter().map(|s| s.file_name.clone()).collect();
        let meta = RowsetMeta {
            rowset_id: self.output_rowset_id,
            tablet_id: self.tablet.id(),
            txn_id: -1,
            partition_id: self
                .inputs
                .first()
                .map(|r| r.meta().partition_id)
                .unwrap_or(-1),
            segments: names.clone(),
            delete_files: Vec::new(),
            num_rows: segments.iter().map(|s| s.num_rows).sum(),
            data_size: segments.iter().map(|s| s.data_size).sum(),
            overlapped: false,
            schema: self.tablet.schema().clone(),
            creation_time: crate::rowset::unix_now(),
        };
        let data = Box::new(SegmentRowsetData::new(
            self.tablet.data_path().to_path_buf(),
            names,
            Arc::clone(self.tablet.codec()),
        ));
        let output = Rowset::new(meta, data);

        if let Err(e) = self
            .tablet
            .replace_rowsets(&self.inputs, output, self.output_version)
        {
            // the output rowset never became visible; its files go with it
            if let Err(remove_err) = SegmentRowsetData::new(
                self.tablet.data_path().to_path_buf(),
                segments.iter().map(|s| s.file_name.clone()).collect(),
                Arc::clone(self.tablet.codec()),
            )
            .remove()
            {
                warn!("failed to remove abandoned compaction output: {remove_err}");
            }
            return Err(e);
        }

        if self.kind == CompactionKind::Cumulative {
            self.tablet.set_cumulative_point(self.output_version.end + 1);
        }
        Ok(())
    }

    /// K-way merge of the input segments into one output segment. For the
    /// unique keys model, equal keys collapse to the newest source.
    fn merge_into(&self, writer: &mut TabletWriter) -> Result<()> {
        struct Entry {
            key: Bytes,
            src: usize,
        }
        impl PartialEq for Entry {
            fn eq(&self, other: &Self) -> bool {
                self.key == other.key && self.src == other.src
            }
        }
        impl Eq for Entry {}
        impl PartialOrd for Entry {
            fn partial_cmp(&self, other: &Self) -> Option<CmpOrdering> {
                Some(self.cmp(other))
            }
        }
        impl Ord for Entry {
            fn cmp(&self, other: &Self) -> CmpOrdering {
                self.key.cmp(&other.key).then(self.src.cmp(&other.src))
            }
        }

        // Sources are enumerated in version order, segments within a
        // rowset in write order, so a higher source index is newer.
        let mut iters = Vec::new();
        for input in &self.inputs {
            iters.extend(input.segment_iterators()?);
        }

        let mut heads: Vec<Option<crate::chunk::Row>> = Vec::with_capacity(iters.len());
        let mut heap: BinaryHeap<Reverse<Entry>> = BinaryHeap::new();
        for (src, iter) in iters.iter_mut().enumerate() {
            match iter.next().transpose()? {
                Some(row) => {
                    heap.push(Reverse(Entry {
                        key: row.key.clone(),
                        src,
                    }));
                    heads.push(Some(row));
                }
                None => heads.push(None),
            }
        }

        let unique = self.tablet.schema().keys_model == KeysModel::Unique;
        let mut merged = crate::chunk::Chunk::new();
        let mut pending: Option<crate::chunk::Row> = None;

        while let Some(Reverse(entry)) = heap.pop() {
            let row = match heads[entry.src].take() {
                Some(row) => row,
                None => {
                    return Err(Error::Internal(
                        "compaction merge lost a buffered row".to_string(),
                    ))
                }
            };
            if let Some(next) = iters[entry.src].next().transpose()? {
                heap.push(Reverse(Entry {
                    key: next.key.clone(),
                    src: entry.src,
                }));
                heads[entry.src] = Some(next);
            }

            if unique {
                // rows pop in (key, src) order, so the last row of an
                // equal-key run came from the newest source
                let same_key = pending.as_ref().is_some_and(|p| p.key == row.key);
                match pending.replace(row) {
                    Some(prev) if !same_key => merged.push(prev),
                    _ => {}
                }
            } else {
                merged.push(row);
            }
        }
        if let Some(p) = pending {
            merged.push(p);
        }

        writer.write_chunk(&merged)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{Chunk, KeysModel, Row, TabletSchema};
    use crate::config::{CompactionConfig, StorageConfig};
    use crate::meta::{MemMetaStore, MetaStore};
    use crate::tablet::TabletManager;
    use bytes::Bytes;
    use tempfile::TempDir;

    fn handle() -> CompactionConfigHandle {
        CompactionConfigHandle::new(CompactionConfig::default())
    }

    struct Fixture {
        _dir: TempDir,
        tablet_manager: Arc<TabletManager>,
        manager: Arc<CompactionManager>,
    }

    fn fixture() -> Fixture {
        let dir = TempDir::new().unwrap();
        let config = StorageConfig {
            data_dirs: vec![dir.path().to_path_buf()],
            ..StorageConfig::default()
        };
        let manager = CompactionManager::new(handle());
        let tablet_manager = TabletManager::new(
            &config,
            Arc::new(MemMetaStore::new()) as Arc<dyn MetaStore>,
            Arc::new(crate::segment::BincodeCodec),
            Arc::new(DefaultCompactionPolicy::new(2, 2)),
            Arc::clone(&manager),
        )
        .unwrap();
        Fixture {
            _dir: dir,
            tablet_manager,
            manager,
        }
    }

    fn tablet_with_rowsets(fx: &Fixture, id: TabletId, count: usize) -> Arc<Tablet> {
        let tablet = fx
            .tablet_manager
            .create_tablet(id, TabletSchema::new(KeysModel::Duplicate, 1))
            .unwrap();
        for i in 0..count {
            let rowset_id = fx.tablet_manager.next_rowset_id();
            let mut writer = TabletWriter::new(
                tablet.data_path().to_path_buf(),
                rowset_id,
                Arc::clone(tablet.codec()),
                tablet.schema().clone(),
            );
            let mut chunk = Chunk::new();
            chunk.push(Row::new(
                Bytes::from(format!("key-{i}")),
                vec![Bytes::from("v")],
            ));
            writer.write_chunk(&chunk).unwrap();
            let segments = writer.finish().unwrap();
            let names: Vec<String> = segments.iter().map(|s| s.file_name.clone()).collect();
            let meta = RowsetMeta {
                rowset_id,
                tablet_id: tablet.id(),
                txn_id: i as i64,
                partition_id: 1,
                segments: names.clone(),
                delete_files: Vec::new(),
                num_rows: 1,
                data_size: segments.iter().map(|s| s.data_size).sum(),
                overlapped: false,
                schema: tablet.schema().clone(),
                creation_time: crate::rowset::unix_now(),
            };
            let data = Box::new(SegmentRowsetData::new(
                tablet.data_path().to_path_buf(),
                names,
                Arc::clone(tablet.codec()),
            ));
            let rowset = Rowset::new(meta, data);
            let v = tablet.next_version();
            tablet.publish_rowset(rowset, Version::single(v)).unwrap();
        }
        tablet
    }

    #[test]
    fn test_default_policy_minimum() {
        let policy = DefaultCompactionPolicy::new(2, 2);
        assert_eq!(policy.score(CompactionKind::Cumulative, 0, &[]), 0.0);
    }

    #[tokio::test]
    async fn test_candidates_ordered_by_score() {
        let fx = fixture();
        let small = tablet_with_rowsets(&fx, 1, 2);
        let big = tablet_with_rowsets(&fx, 2, 4);

        fx.manager.update_tablet_candidates(&small);
        fx.manager.update_tablet_candidates(&big);

        let first = fx.manager.pick_candidate().unwrap();
        assert_eq!(first.tablet.id(), big.id());
        assert_eq!(first.score, 4.0);

        let second = fx.manager.pick_candidate().unwrap();
        assert_eq!(second.tablet.id(), small.id());
        assert!(fx.manager.pick_candidate().is_none());
    }

    #[tokio::test]
    async fn test_stale_heap_entries_skipped() {
        let fx = fixture();
        let tablet = tablet_with_rowsets(&fx, 1, 2);

        // an old high score followed by a rescore: only the latest entry
        // is live
        fx.manager.update_candidate(CompactionCandidate {
            tablet: Arc::clone(&tablet),
            kind: CompactionKind::Cumulative,
            score: 50.0,
        });
        fx.manager.update_candidate(CompactionCandidate {
            tablet: Arc::clone(&tablet),
            kind: CompactionKind::Cumulative,
            score: 2.0,
        });

        let picked = fx.manager.pick_candidate().unwrap();
        assert_eq!(picked.score, 2.0);
        assert!(fx.manager.pick_candidate().is_none());
    }

    #[tokio::test]
    async fn test_zero_score_removes_candidate() {
        let fx = fixture();
        let tablet = tablet_with_rowsets(&fx, 1, 2);

        fx.manager.update_tablet_candidates(&tablet);
        assert_eq!(fx.manager.candidates_size(), 1);

        fx.manager.update_candidate(CompactionCandidate {
            tablet: Arc::clone(&tablet),
            kind: CompactionKind::Cumulative,
            score: 0.0,
        });
        assert_eq!(fx.manager.candidates_size(), 0);
        assert!(fx.manager.pick_candidate().is_none());
    }

    #[tokio::test]
    async fn test_register_respects_hard_ceiling() {
        let fx = fixture();
        fx.manager.config().update(|c| c.max_task_num = 1);
        let tablet = tablet_with_rowsets(&fx, 1, 4);

        let t1 = CompactionTask::create(
            Arc::clone(&tablet),
            CompactionKind::Cumulative,
            4.0,
            fx.tablet_manager.next_rowset_id(),
            2,
            2,
        )
        .unwrap();
        t1.set_task_id(fx.manager.next_task_id());
        fx.manager.register_task(&t1).unwrap();
        assert!(fx.manager.check_if_exceed_max_task_num());

        let t2 = CompactionTask::create(
            Arc::clone(&tablet),
            CompactionKind::Cumulative,
            4.0,
            fx.tablet_manager.next_rowset_id(),
            2,
            2,
        )
        .unwrap();
        t2.set_task_id(fx.manager.next_task_id());
        assert!(fx.manager.register_task(&t2).is_err());

        fx.manager.unregister_task(t1.task_id());
        assert!(fx.manager.register_task(&t2).is_ok());
        t1.release_inputs();
        t2.release_inputs();
    }

    #[tokio::test]
    async fn test_create_needs_minimum_inputs() {
        let fx = fixture();
        let tablet = tablet_with_rowsets(&fx, 1, 1);
        assert!(CompactionTask::create(
            Arc::clone(&tablet),
            CompactionKind::Cumulative,
            1.0,
            fx.tablet_manager.next_rowset_id(),
            64,
            2,
        )
        .is_none());
    }

    #[test]
    fn test_max_task_num_read_dynamically() {
        let manager = CompactionManager::new(handle());
        assert!(!manager.check_if_exceed_max_task_num());

        manager.config().update(|c| c.max_task_num = 1);
        assert_eq!(manager.config().get().max_task_num, 1);
    }
}
