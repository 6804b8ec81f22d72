//! Rowset: an immutable, versioned fragment of a tablet's data, plus the
//! lifecycle state machine that lets background maintenance tear a rowset
//! down safely while query readers still hold references.
//!
//! The state transfer graph:
//!
//! ```text
//!    UNLOADED    <--|
//!        |          |
//!        v          |
//!     LOADED        |
//!        |          |
//!        v          |
//!    UNLOADING   -->|
//! ```
//!
//! `close()` moves a LOADED rowset to UNLOADED when no reader holds it,
//! otherwise to UNLOADING; the reader whose `release()` drops the count to
//! zero while UNLOADING performs the actual teardown. Both teardown sites
//! run under the per-rowset mutex, so resources are released exactly once.

use crate::chunk::{Row, TabletSchema};
use crate::error::{Error, Result};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, OnceLock};
use tracing::{debug, warn};

pub type TabletId = i64;
pub type TxnId = i64;
pub type PartitionId = i64;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct RowsetId(pub u64);

impl fmt::Display for RowsetId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:016x}", self.0)
    }
}

/// A contiguous `[start, end]` version range.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Version {
    pub start: i64,
    pub end: i64,
}

impl Version {
    pub fn new(start: i64, end: i64) -> Self {
        Self { start, end }
    }

    pub fn single(v: i64) -> Self {
        Self { start: v, end: v }
    }

    pub fn contains(&self, other: Version) -> bool {
        self.start <= other.start && other.end <= self.end
    }
}

impl fmt::Display for Version {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}-{}]", self.start, self.end)
    }
}

/// Seconds since the Unix epoch, for rowset creation stamps.
pub(crate) fn unix_now() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or(0)
}

/// Immutable descriptor of one rowset. Frozen once the rowset is
/// published via [`Rowset::make_visible`].
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RowsetMeta {
    pub rowset_id: RowsetId,
    pub tablet_id: TabletId,
    pub txn_id: TxnId,
    pub partition_id: PartitionId,
    /// Segment file names relative to the tablet data directory.
    pub segments: Vec<String>,
    pub delete_files: Vec<String>,
    pub num_rows: u64,
    pub data_size: u64,
    /// Whether segments overlap in key space (flush output with more than
    /// one segment does; compaction output never does).
    pub overlapped: bool,
    pub schema: TabletSchema,
    /// Unix timestamp of rowset creation.
    pub creation_time: u64,
}

impl RowsetMeta {
    pub fn num_segments(&self) -> usize {
        self.segments.len()
    }

    pub fn has_data_files(&self) -> bool {
        !self.segments.is_empty() || !self.delete_files.is_empty()
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RowsetState {
    /// Newly created, or fully torn down.
    Unloaded,
    /// `load()` succeeded; handles are open.
    Loaded,
    /// `close()` was called while readers still hold references.
    Unloading,
}

/// Per-rowset lifecycle guard. Invalid transitions are internal logic
/// errors: they abort the operation but never the process.
#[derive(Debug)]
pub struct RowsetStateMachine {
    state: RowsetState,
}

impl RowsetStateMachine {
    pub fn new() -> Self {
        Self {
            state: RowsetState::Unloaded,
        }
    }

    pub fn state(&self) -> RowsetState {
        self.state
    }

    pub fn on_load(&mut self) -> Result<()> {
        match self.state {
            RowsetState::Unloaded => {
                self.state = RowsetState::Loaded;
                Ok(())
            }
            other => Err(Error::Internal(format!(
                "rowset state on_load error, state: {other:?}"
            ))),
        }
    }

    pub fn on_close(&mut self, refs_by_reader: u64) -> Result<()> {
        match self.state {
            RowsetState::Loaded => {
                self.state = if refs_by_reader == 0 {
                    RowsetState::Unloaded
                } else {
                    RowsetState::Unloading
                };
                Ok(())
            }
            other => Err(Error::Internal(format!(
                "rowset state on_close error, state: {other:?}"
            ))),
        }
    }

    pub fn on_release(&mut self) -> Result<()> {
        match self.state {
            RowsetState::Unloading => {
                self.state = RowsetState::Unloaded;
                Ok(())
            }
            other => Err(Error::Internal(format!(
                "rowset state on_release error, state: {other:?}"
            ))),
        }
    }
}

impl Default for RowsetStateMachine {
    fn default() -> Self {
        Self::new()
    }
}

pub type RowIter = Box<dyn Iterator<Item = Result<Row>> + Send>;

/// Narrow capability set backing a rowset. Concrete implementations are
/// selected at tablet-open time; shared lifecycle logic lives in
/// [`Rowset`] itself rather than in the implementations.
pub trait RowsetData: Send + Sync {
    /// Opens the underlying handles. Called at most once between closes.
    fn load(&self) -> Result<()>;

    /// Releases all handles. Only ever invoked by [`Rowset`] under its
    /// mutex; must tolerate being called when nothing is open.
    fn close(&self);

    /// One sorted row iterator per segment.
    fn segment_iterators(&self) -> Result<Vec<RowIter>>;

    /// Removes the data files from disk.
    fn remove(&self) -> Result<()>;

    /// Hard-links every file into `dir` under a new rowset identity.
    fn link_files_to(&self, dir: &Path, new_rowset_id: RowsetId) -> Result<()>;
}

/// An immutable unit of committed data. The version is assigned exactly
/// once at publish; row and byte counts never change afterwards.
pub struct Rowset {
    meta: RowsetMeta,
    version: OnceLock<Version>,
    data: Box<dyn RowsetData>,
    /// Number of query readers currently holding this rowset. Updated
    /// without the mutex; re-checked under it before teardown.
    refs_by_reader: AtomicU64,
    need_delete_file: AtomicBool,
    /// Guards teardown and state transitions.
    lifecycle: Mutex<RowsetStateMachine>,
}

impl Rowset {
    pub fn new(meta: RowsetMeta, data: Box<dyn RowsetData>) -> Arc<Self> {
        Arc::new(Self {
            meta,
            version: OnceLock::new(),
            data,
            refs_by_reader: AtomicU64::new(0),
            need_delete_file: AtomicBool::new(false),
            lifecycle: Mutex::new(RowsetStateMachine::new()),
        })
    }

    pub fn meta(&self) -> &RowsetMeta {
        &self.meta
    }

    pub fn rowset_id(&self) -> RowsetId {
        self.meta.rowset_id
    }

    pub fn tablet_id(&self) -> TabletId {
        self.meta.tablet_id
    }

    pub fn num_rows(&self) -> u64 {
        self.meta.num_rows
    }

    pub fn data_size(&self) -> u64 {
        self.meta.data_size
    }

    pub fn num_segments(&self) -> usize {
        self.meta.num_segments()
    }

    pub fn overlapped(&self) -> bool {
        self.meta.overlapped
    }

    /// Version range, if published.
    pub fn version(&self) -> Option<Version> {
        self.version.get().copied()
    }

    pub fn is_visible(&self) -> bool {
        self.version.get().is_some()
    }

    /// Publishes this rowset under `version`. May be called exactly once.
    pub fn make_visible(&self, version: Version) -> Result<()> {
        self.version.set(version).map_err(|_| {
            Error::Internal(format!(
                "rowset {} already published at {}",
                self.meta.rowset_id,
                // set() only fails when a value is present
                self.version().unwrap_or(version)
            ))
        })
    }

    pub fn state(&self) -> RowsetState {
        self.lifecycle.lock().state()
    }

    pub fn refs_by_reader(&self) -> u64 {
        self.refs_by_reader.load(Ordering::Acquire)
    }

    pub fn need_delete_file(&self) -> bool {
        self.need_delete_file.load(Ordering::Acquire)
    }

    pub fn set_need_delete_file(&self) {
        self.need_delete_file.store(true, Ordering::Release);
    }

    /// Opens segment handles. Idempotent: a second call while loaded or
    /// unloading is a no-op.
    pub fn load(&self) -> Result<()> {
        let mut lc = self.lifecycle.lock();
        match lc.state() {
            RowsetState::Unloaded => {
                self.data.load()?;
                lc.on_load()
            }
            _ => Ok(()),
        }
    }

    /// Increments the reader reference count. Callers should prefer
    /// [`RowsetReadGuard`] so the matching `release()` cannot be missed.
    pub fn acquire(&self) {
        self.refs_by_reader.fetch_add(1, Ordering::AcqRel);
    }

    /// Drops one reader reference. The caller that brings the count to
    /// zero while the rowset is UNLOADING performs the teardown.
    pub fn release(&self) {
        let prev = self.refs_by_reader.fetch_sub(1, Ordering::AcqRel);
        debug_assert!(prev > 0, "rowset release without acquire");
        if prev != 1 {
            return;
        }

        let mut lc = self.lifecycle.lock();
        // Re-check under the mutex: acquire() does not take it, so a new
        // reader may have arrived between the decrement and here.
        if self.refs_by_reader.load(Ordering::Acquire) == 0
            && lc.state() == RowsetState::Unloading
        {
            self.data.close();
            if let Err(e) = lc.on_release() {
                warn!("rowset {} state transition failed: {e}", self.meta.rowset_id);
                return;
            }
            debug!(
                "rowset {} closed by last reader, version {:?}",
                self.meta.rowset_id,
                self.version()
            );
        }
    }

    /// Releases resources owned by this rowset. No-op unless LOADED.
    ///
    /// Single-threaded maintenance responsibility: must not be called
    /// concurrently with itself.
    pub fn close(&self) {
        let mut lc = self.lifecycle.lock();
        if lc.state() != RowsetState::Loaded {
            return;
        }
        let refs = self.refs_by_reader.load(Ordering::Acquire);
        if refs == 0 {
            self.data.close();
        }
        if let Err(e) = lc.on_close(refs) {
            warn!("rowset {} state transition failed: {e}", self.meta.rowset_id);
            return;
        }
        debug!(
            "rowset {} closed, refs_by_reader: {refs}, new state: {:?}",
            self.meta.rowset_id,
            lc.state()
        );
    }

    /// One sorted row iterator per segment; requires the rowset to be
    /// loaded.
    pub fn segment_iterators(&self) -> Result<Vec<RowIter>> {
        self.data.segment_iterators()
    }

    /// Removes all data files. Only valid once the rowset is UNLOADED and
    /// no longer visible in any version set.
    pub fn remove(&self) -> Result<()> {
        self.data.remove()
    }

    pub fn link_files_to(&self, dir: &Path, new_rowset_id: RowsetId) -> Result<()> {
        self.data.link_files_to(dir, new_rowset_id)
    }

    /// Sort helper for version sets.
    pub fn compare_by_version(a: &Arc<Rowset>, b: &Arc<Rowset>) -> std::cmp::Ordering {
        let ea = a.version().map(|v| v.end).unwrap_or(i64::MIN);
        let eb = b.version().map(|v| v.end).unwrap_or(i64::MIN);
        ea.cmp(&eb)
    }
}

impl fmt::Debug for Rowset {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Rowset")
            .field("rowset_id", &self.meta.rowset_id)
            .field("tablet_id", &self.meta.tablet_id)
            .field("version", &self.version())
            .field("num_rows", &self.meta.num_rows)
            .field("state", &self.state())
            .finish()
    }
}

/// Scoped reader reference: `acquire()` on construction, `release()` on
/// drop, so early returns and cancellation cannot leak a reference.
pub struct RowsetReadGuard {
    rowset: Arc<Rowset>,
}

impl RowsetReadGuard {
    pub fn new(rowset: Arc<Rowset>) -> Self {
        rowset.acquire();
        Self { rowset }
    }

    pub fn rowset(&self) -> &Arc<Rowset> {
        &self.rowset
    }
}

impl Drop for RowsetReadGuard {
    fn drop(&mut self) {
        self.rowset.release();
    }
}

impl std::ops::Deref for RowsetReadGuard {
    type Target = Rowset;

    fn deref(&self) -> &Rowset {
        &self.rowset
    }
}

/// Acquires a read guard on every rowset in `rowsets`.
pub fn acquire_readers(rowsets: &[Arc<Rowset>]) -> Vec<RowsetReadGuard> {
    rowsets
        .iter()
        .map(|r| RowsetReadGuard::new(Arc::clone(r)))
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::KeysModel;
    use std::sync::atomic::AtomicUsize;

    /// Counters are shared with the test body so teardown can be observed
    /// after the data is boxed into the rowset.
    #[derive(Clone)]
    struct CountingData {
        loads: Arc<AtomicUsize>,
        closes: Arc<AtomicUsize>,
    }

    impl CountingData {
        fn new() -> Self {
            Self {
                loads: Arc::new(AtomicUsize::new(0)),
                closes: Arc::new(AtomicUsize::new(0)),
            }
        }
    }

    impl RowsetData for CountingData {
        fn load(&self) -> Result<()> {
            self.loads.fetch_add(1, Ordering::SeqCst);
            Ok(())
        }

        fn close(&self) {
            self.closes.fetch_add(1, Ordering::SeqCst);
        }

        fn segment_iterators(&self) -> Result<Vec<RowIter>> {
            Ok(Vec::new())
        }

        fn remove(&self) -> Result<()> {
            Ok(())
        }

        fn link_files_to(&self, _dir: &Path, _new_rowset_id: RowsetId) -> Result<()> {
            Ok(())
        }
    }

    fn test_meta() -> RowsetMeta {
        RowsetMeta {
            rowset_id: RowsetId(1),
            tablet_id: 10,
            txn_id: 100,
            partition_id: 1,
            segments: vec!["0000000000000001_0.dat".to_string()],
            delete_files: Vec::new(),
            num_rows: 5,
            data_size: 128,
            overlapped: false,
            schema: TabletSchema::new(KeysModel::Duplicate, 1),
            creation_time: unix_now(),
        }
    }

    fn counting_rowset() -> (Arc<Rowset>, CountingData) {
        let data = CountingData::new();
        let rowset = Rowset::new(test_meta(), Box::new(data.clone()));
        (rowset, data)
    }

    fn closes(data: &CountingData) -> usize {
        data.closes.load(Ordering::SeqCst)
    }

    #[test]
    fn test_state_machine_transitions() {
        let mut sm = RowsetStateMachine::new();
        assert_eq!(sm.state(), RowsetState::Unloaded);

        assert!(sm.on_load().is_ok());
        assert_eq!(sm.state(), RowsetState::Loaded);

        // load again from LOADED is an error
        assert!(sm.on_load().is_err());

        assert!(sm.on_close(2).is_ok());
        assert_eq!(sm.state(), RowsetState::Unloading);

        assert!(sm.on_release().is_ok());
        assert_eq!(sm.state(), RowsetState::Unloaded);
    }

    #[test]
    fn test_state_machine_close_without_readers() {
        let mut sm = RowsetStateMachine::new();
        sm.on_load().unwrap();
        sm.on_close(0).unwrap();
        assert_eq!(sm.state(), RowsetState::Unloaded);
        assert!(sm.on_release().is_err());
    }

    #[test]
    fn test_close_without_readers_tears_down_immediately() {
        let (rowset, data) = counting_rowset();
        rowset.load().unwrap();
        assert_eq!(rowset.state(), RowsetState::Loaded);

        rowset.close();
        assert_eq!(rowset.state(), RowsetState::Unloaded);
        assert_eq!(closes(&data), 1);

        // idempotent: closing a non-LOADED rowset is a no-op
        rowset.close();
        assert_eq!(closes(&data), 1);
    }

    #[test]
    fn test_last_reader_performs_teardown() {
        let (rowset, data) = counting_rowset();
        rowset.load().unwrap();

        let g1 = RowsetReadGuard::new(Arc::clone(&rowset));
        let g2 = RowsetReadGuard::new(Arc::clone(&rowset));
        assert_eq!(rowset.refs_by_reader(), 2);

        rowset.close();
        assert_eq!(rowset.state(), RowsetState::Unloading);
        assert_eq!(closes(&data), 0, "teardown must wait for readers");

        drop(g1);
        assert_eq!(rowset.state(), RowsetState::Unloading);
        assert_eq!(closes(&data), 0);

        drop(g2);
        assert_eq!(rowset.state(), RowsetState::Unloaded);
        assert_eq!(closes(&data), 1, "exactly one teardown");
    }

    #[test]
    fn test_release_before_close_does_not_tear_down() {
        let (rowset, data) = counting_rowset();
        rowset.load().unwrap();

        let guard = RowsetReadGuard::new(Arc::clone(&rowset));
        drop(guard);

        // Still LOADED: no close() happened yet.
        assert_eq!(rowset.state(), RowsetState::Loaded);
        assert_eq!(closes(&data), 0);

        rowset.close();
        assert_eq!(closes(&data), 1);
    }

    #[test]
    fn test_load_is_idempotent() {
        let (rowset, data) = counting_rowset();
        rowset.load().unwrap();
        rowset.load().unwrap();
        assert_eq!(rowset.state(), RowsetState::Loaded);
        assert_eq!(data.loads.load(Ordering::SeqCst), 1);
    }

    #[test]
    fn test_make_visible_only_once() {
        let (rowset, _) = counting_rowset();
        assert!(!rowset.is_visible());

        rowset.make_visible(Version::single(3)).unwrap();
        assert_eq!(rowset.version(), Some(Version::single(3)));

        assert!(rowset.make_visible(Version::single(4)).is_err());
        assert_eq!(rowset.version(), Some(Version::single(3)));
    }

    #[test]
    fn test_concurrent_acquire_release() {
        let (rowset, data) = counting_rowset();
        rowset.load().unwrap();

        let mut handles = Vec::new();
        for _ in 0..8 {
            let rowset = Arc::clone(&rowset);
            handles.push(std::thread::spawn(move || {
                for _ in 0..1000 {
                    let _guard = RowsetReadGuard::new(Arc::clone(&rowset));
                }
            }));
        }
        for h in handles {
            h.join().unwrap();
        }

        assert_eq!(rowset.refs_by_reader(), 0);
        assert_eq!(rowset.state(), RowsetState::Loaded);

        rowset.close();
        assert_eq!(rowset.state(), RowsetState::Unloaded);
        assert_eq!(closes(&data), 1);
    }

    #[test]
    fn test_version_contains() {
        let v = Version::new(2, 8);
        assert!(v.contains(Version::new(2, 8)));
        assert!(v.contains(Version::single(5)));
        assert!(!v.contains(Version::new(1, 3)));
        assert!(!v.contains(Version::new(7, 9)));
    }
}
