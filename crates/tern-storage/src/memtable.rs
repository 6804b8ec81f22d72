//! In-memory write buffer. Rows accumulate unsorted; ordering and key
//! deduplication happen once, at finalize, right before the buffer is
//! handed to the flush pipeline.

use crate::chunk::{Chunk, KeysModel, Row, TabletSchema};
use crate::error::Result;
use crate::rowset::TabletId;
use crate::segment::MemTableSink;
use crate::tracker::MemTracker;
use std::sync::Arc;
use tracing::debug;

pub struct MemTable {
    tablet_id: TabletId,
    schema: TabletSchema,
    rows: Vec<Row>,
    bytes_usage: usize,
    max_buffer_rows: usize,
    max_buffer_bytes: usize,
    mem_tracker: Arc<MemTracker>,
    /// Bytes charged to the tracker so far; released on drop.
    tracked_bytes: i64,
    finalized: bool,
}

impl MemTable {
    pub fn new(
        tablet_id: TabletId,
        schema: TabletSchema,
        max_buffer_rows: usize,
        max_buffer_bytes: usize,
        mem_tracker: Arc<MemTracker>,
    ) -> Self {
        Self {
            tablet_id,
            schema,
            rows: Vec::new(),
            bytes_usage: 0,
            max_buffer_rows,
            max_buffer_bytes,
            mem_tracker,
            tracked_bytes: 0,
            finalized: false,
        }
    }

    pub fn tablet_id(&self) -> TabletId {
        self.tablet_id
    }

    pub fn num_rows(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Bytes buffered; O(1), maintained incrementally.
    pub fn memory_usage(&self) -> usize {
        self.bytes_usage
    }

    pub fn is_full(&self) -> bool {
        self.rows.len() >= self.max_buffer_rows || self.bytes_usage >= self.max_buffer_bytes
    }

    /// Copies the rows of `chunk` selected by `indexes` into the buffer.
    /// Returns whether the buffer is now full.
    pub fn insert(&mut self, chunk: &Chunk, indexes: &[u32]) -> bool {
        let rows = chunk.rows();
        let mut added = 0usize;
        for &idx in indexes {
            let row = rows[idx as usize].clone();
            added += row.bytes_usage();
            self.rows.push(row);
        }
        self.bytes_usage += added;
        self.mem_tracker.consume(added as i64);
        self.tracked_bytes += added as i64;
        self.is_full()
    }

    /// Sorts the buffer by key. For the unique keys model, equal keys
    /// collapse to the latest insertion.
    pub fn finalize(&mut self) {
        if self.finalized {
            return;
        }
        self.finalized = true;
        // Stable sort keeps insertion order within an equal-key run, so
        // the last element of each run is the newest write.
        self.rows.sort_by(|a, b| a.key.cmp(&b.key));
        if self.schema.keys_model == KeysModel::Unique {
            let before = self.rows.len();
            dedup_keep_last(&mut self.rows);
            if self.rows.len() != before {
                debug!(
                    "memtable for tablet {} deduplicated {} rows",
                    self.tablet_id,
                    before - self.rows.len()
                );
            }
        }
    }

    /// Writes the finalized buffer into `sink` as one chunk.
    pub fn flush(&mut self, sink: &dyn MemTableSink) -> Result<()> {
        debug_assert!(self.finalized, "memtable flushed before finalize");
        let rows = std::mem::take(&mut self.rows);
        debug!(
            "flushing memtable for tablet {}, rows: {}, bytes: {}",
            self.tablet_id,
            rows.len(),
            self.bytes_usage
        );
        sink.flush_chunk(Chunk::from_rows(rows))
    }
}

impl Drop for MemTable {
    fn drop(&mut self) {
        if self.tracked_bytes > 0 {
            self.mem_tracker.release(self.tracked_bytes);
        }
    }
}

/// Collapses runs of equal keys, keeping the last row of each run.
fn dedup_keep_last(rows: &mut Vec<Row>) {
    if rows.len() < 2 {
        return;
    }
    let mut out: Vec<Row> = Vec::with_capacity(rows.len());
    for row in rows.drain(..) {
        match out.last() {
            Some(last) if last.key == row.key => {
                // same key, newer write wins
                let slot = out.len() - 1;
                out[slot] = row;
            }
            _ => out.push(row),
        }
    }
    *rows = out;
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use parking_lot::Mutex;

    fn row(key: &str, val: &str) -> Row {
        Row::new(Bytes::from(key.to_string()), vec![Bytes::from(val.to_string())])
    }

    struct CollectSink {
        chunks: Mutex<Vec<Chunk>>,
    }

    impl CollectSink {
        fn new() -> Self {
            Self {
                chunks: Mutex::new(Vec::new()),
            }
        }
    }

    impl MemTableSink for CollectSink {
        fn flush_chunk(&self, chunk: Chunk) -> Result<()> {
            self.chunks.lock().push(chunk);
            Ok(())
        }
    }

    fn memtable(model: KeysModel, max_rows: usize, max_bytes: usize) -> MemTable {
        MemTable::new(
            1,
            TabletSchema::new(model, 1),
            max_rows,
            max_bytes,
            MemTracker::root("test", 0),
        )
    }

    #[test]
    fn test_insert_tracks_memory() {
        let tracker = MemTracker::root("test", 0);
        let mut mt = MemTable::new(1, TabletSchema::new(KeysModel::Duplicate, 1), 100, 1 << 20, Arc::clone(&tracker));

        let mut chunk = Chunk::new();
        chunk.push(row("aa", "11"));
        chunk.push(row("bb", "22"));
        mt.insert(&chunk, &[0, 1]);

        assert_eq!(mt.num_rows(), 2);
        assert_eq!(mt.memory_usage(), 8);
        assert_eq!(tracker.consumption(), 8);

        drop(mt);
        assert_eq!(tracker.consumption(), 0);
    }

    #[test]
    fn test_full_by_rows_and_bytes() {
        let mut mt = memtable(KeysModel::Duplicate, 2, 1 << 20);
        let mut chunk = Chunk::new();
        chunk.push(row("a", "1"));
        assert!(!mt.insert(&chunk, &[0]));
        assert!(mt.insert(&chunk, &[0]), "row threshold reached");

        let mut mt = memtable(KeysModel::Duplicate, 1000, 4);
        let mut big = Chunk::new();
        big.push(row("abc", "def"));
        assert!(mt.insert(&big, &[0]), "byte threshold reached");
    }

    #[test]
    fn test_selective_insert() {
        let mut mt = memtable(KeysModel::Duplicate, 100, 1 << 20);
        let mut chunk = Chunk::new();
        chunk.push(row("a", "1"));
        chunk.push(row("b", "2"));
        chunk.push(row("c", "3"));
        mt.insert(&chunk, &[0, 2]);
        assert_eq!(mt.num_rows(), 2);
    }

    #[test]
    fn test_finalize_sorts() {
        let mut mt = memtable(KeysModel::Duplicate, 100, 1 << 20);
        let mut chunk = Chunk::new();
        chunk.push(row("c", "3"));
        chunk.push(row("a", "1"));
        chunk.push(row("b", "2"));
        mt.insert(&chunk, &[0, 1, 2]);
        mt.finalize();

        let sink = CollectSink::new();
        mt.flush(&sink).unwrap();
        let chunks = sink.chunks.lock();
        let keys: Vec<_> = chunks[0].rows().iter().map(|r| r.key.clone()).collect();
        assert_eq!(keys, vec![Bytes::from("a"), Bytes::from("b"), Bytes::from("c")]);
    }

    #[test]
    fn test_unique_model_keeps_latest() {
        let mut mt = memtable(KeysModel::Unique, 100, 1 << 20);
        let mut chunk = Chunk::new();
        chunk.push(row("k", "old"));
        chunk.push(row("x", "1"));
        chunk.push(row("k", "new"));
        mt.insert(&chunk, &[0, 1, 2]);
        mt.finalize();

        let sink = CollectSink::new();
        mt.flush(&sink).unwrap();
        let chunks = sink.chunks.lock();
        let rows = chunks[0].rows();
        assert_eq!(rows.len(), 2);
        assert_eq!(rows[0].key, Bytes::from("k"));
        assert_eq!(rows[0].columns[0], Bytes::from("new"));
    }

    #[test]
    fn test_duplicate_model_keeps_all() {
        let mut mt = memtable(KeysModel::Duplicate, 100, 1 << 20);
        let mut chunk = Chunk::new();
        chunk.push(row("k", "1"));
        chunk.push(row("k", "2"));
        mt.insert(&chunk, &[0, 1]);
        mt.finalize();

        let sink = CollectSink::new();
        mt.flush(&sink).unwrap();
        assert_eq!(sink.chunks.lock()[0].rows().len(), 2);
    }
}
