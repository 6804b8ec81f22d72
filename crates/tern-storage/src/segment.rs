//! Segment encoding and the per-transaction tablet writer.
//!
//! A segment is one immutable file of sorted rows. Each flushed memtable
//! becomes exactly one segment, so a rowset produced by a multi-flush
//! transaction has overlapping key ranges across its segments until
//! compaction rewrites it.

use crate::chunk::{Chunk, Row, TabletSchema};
use crate::error::{Error, Result};
use crate::rowset::{RowIter, RowsetData, RowsetId};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SegmentMeta {
    pub file_name: String,
    pub num_rows: u64,
    pub data_size: u64,
}

/// Sink for sorted rows headed into one segment file.
pub trait SegmentWriter: Send {
    fn append(&mut self, chunk: &Chunk) -> Result<()>;
    fn finish(self: Box<Self>) -> Result<SegmentMeta>;
}

/// Pluggable segment file format.
pub trait SegmentCodec: Send + Sync {
    fn new_writer(&self, path: &Path, schema: &TabletSchema) -> Result<Box<dyn SegmentWriter>>;
    fn read_rows(&self, path: &Path) -> Result<Vec<Row>>;
}

/// Length-prefixed bincode row blocks. Simple and dense enough for the
/// storage core; columnar encodings slot in behind [`SegmentCodec`].
pub struct BincodeCodec;

impl SegmentCodec for BincodeCodec {
    fn new_writer(&self, path: &Path, _schema: &TabletSchema) -> Result<Box<dyn SegmentWriter>> {
        Ok(Box::new(BincodeSegmentWriter {
            path: path.to_path_buf(),
            rows: Vec::new(),
        }))
    }

    fn read_rows(&self, path: &Path) -> Result<Vec<Row>> {
        let bytes = fs::read(path)?;
        bincode::deserialize(&bytes)
            .map_err(|e| Error::Codec(format!("decode {}: {e}", path.display())))
    }
}

struct BincodeSegmentWriter {
    path: PathBuf,
    rows: Vec<Row>,
}

impl SegmentWriter for BincodeSegmentWriter {
    fn append(&mut self, chunk: &Chunk) -> Result<()> {
        self.rows.extend_from_slice(chunk.rows());
        Ok(())
    }

    fn finish(self: Box<Self>) -> Result<SegmentMeta> {
        let num_rows = self.rows.len() as u64;
        let encoded = bincode::serialize(&self.rows)
            .map_err(|e| Error::Codec(format!("encode {}: {e}", self.path.display())))?;
        fs::write(&self.path, &encoded)?;
        let file_name = self
            .path
            .file_name()
            .and_then(|n| n.to_str())
            .ok_or_else(|| Error::Codec(format!("bad segment path {}", self.path.display())))?
            .to_string();
        Ok(SegmentMeta {
            file_name,
            num_rows,
            data_size: encoded.len() as u64,
        })
    }
}

/// Accumulates the segments of one transaction's rowset. One instance per
/// (tablet, txn); each `write_chunk` call produces one segment file named
/// `<rowset_id>_<seq>.dat`.
pub struct TabletWriter {
    dir: PathBuf,
    rowset_id: RowsetId,
    codec: Arc<dyn SegmentCodec>,
    schema: TabletSchema,
    segment_seq: usize,
    segments: Vec<SegmentMeta>,
    finished: bool,
}

impl TabletWriter {
    pub fn new(
        dir: PathBuf,
        rowset_id: RowsetId,
        codec: Arc<dyn SegmentCodec>,
        schema: TabletSchema,
    ) -> Self {
        Self {
            dir,
            rowset_id,
            codec,
            schema,
            segment_seq: 0,
            segments: Vec::new(),
            finished: false,
        }
    }

    pub fn rowset_id(&self) -> RowsetId {
        self.rowset_id
    }

    pub fn segment_file_name(rowset_id: RowsetId, seq: usize) -> String {
        format!("{rowset_id}_{seq}.dat")
    }

    /// Writes one sorted chunk as a new segment.
    pub fn write_chunk(&mut self, chunk: &Chunk) -> Result<()> {
        if chunk.is_empty() {
            return Ok(());
        }
        let name = Self::segment_file_name(self.rowset_id, self.segment_seq);
        let path = self.dir.join(&name);
        let mut writer = self.codec.new_writer(&path, &self.schema)?;
        writer.append(chunk)?;
        let meta = writer.finish()?;
        debug!(
            "segment {} written, rows: {}, bytes: {}",
            meta.file_name, meta.num_rows, meta.data_size
        );
        self.segments.push(meta);
        self.segment_seq += 1;
        Ok(())
    }

    pub fn num_rows(&self) -> u64 {
        self.segments.iter().map(|s| s.num_rows).sum()
    }

    pub fn data_size(&self) -> u64 {
        self.segments.iter().map(|s| s.data_size).sum()
    }

    /// Seals the writer and hands back the segment list.
    pub fn finish(&mut self) -> Result<Vec<SegmentMeta>> {
        if self.finished {
            return Err(Error::Internal(format!(
                "tablet writer for rowset {} already finished",
                self.rowset_id
            )));
        }
        self.finished = true;
        Ok(self.segments.clone())
    }

    /// Deletes written segment files. No-op after a successful finish.
    pub fn close(&mut self) {
        if self.finished {
            return;
        }
        for seg in self.segments.drain(..) {
            let path = self.dir.join(&seg.file_name);
            if let Err(e) = fs::remove_file(&path) {
                warn!("failed to remove aborted segment {}: {e}", path.display());
            }
        }
    }
}

/// Destination for finalized memtables.
pub trait MemTableSink: Send + Sync {
    fn flush_chunk(&self, chunk: Chunk) -> Result<()>;
}

/// Routes flushed memtables into a shared [`TabletWriter`].
pub struct TabletWriterSink {
    writer: Arc<Mutex<TabletWriter>>,
}

impl TabletWriterSink {
    pub fn new(writer: Arc<Mutex<TabletWriter>>) -> Self {
        Self { writer }
    }
}

impl MemTableSink for TabletWriterSink {
    fn flush_chunk(&self, chunk: Chunk) -> Result<()> {
        self.writer.lock().write_chunk(&chunk)
    }
}

/// File-backed rowset data. `load()` decodes every segment into memory;
/// iterators hand out rows from the shared cache.
pub struct SegmentRowsetData {
    dir: PathBuf,
    segments: Vec<String>,
    codec: Arc<dyn SegmentCodec>,
    loaded: Mutex<Option<Vec<Arc<Vec<Row>>>>>,
}

impl SegmentRowsetData {
    pub fn new(dir: PathBuf, segments: Vec<String>, codec: Arc<dyn SegmentCodec>) -> Self {
        Self {
            dir,
            segments,
            codec,
            loaded: Mutex::new(None),
        }
    }
}

impl RowsetData for SegmentRowsetData {
    fn load(&self) -> Result<()> {
        let mut loaded = self.loaded.lock();
        if loaded.is_some() {
            return Ok(());
        }
        let mut segs = Vec::with_capacity(self.segments.len());
        for name in &self.segments {
            let rows = self.codec.read_rows(&self.dir.join(name))?;
            segs.push(Arc::new(rows));
        }
        *loaded = Some(segs);
        Ok(())
    }

    fn close(&self) {
        *self.loaded.lock() = None;
    }

    fn segment_iterators(&self) -> Result<Vec<RowIter>> {
        let loaded = self.loaded.lock();
        let segs = loaded
            .as_ref()
            .ok_or_else(|| Error::Internal("rowset not loaded".to_string()))?;
        Ok(segs
            .iter()
            .map(|rows| Box::new(ArcRowsIter::new(Arc::clone(rows))) as RowIter)
            .collect())
    }

    fn remove(&self) -> Result<()> {
        for name in &self.segments {
            let path = self.dir.join(name);
            match fs::remove_file(&path) {
                Ok(()) => {}
                Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    fn link_files_to(&self, dir: &Path, new_rowset_id: RowsetId) -> Result<()> {
        for (seq, name) in self.segments.iter().enumerate() {
            let dst = dir.join(TabletWriter::segment_file_name(new_rowset_id, seq));
            fs::hard_link(self.dir.join(name), dst)?;
        }
        Ok(())
    }
}

struct ArcRowsIter {
    rows: Arc<Vec<Row>>,
    pos: usize,
}

impl ArcRowsIter {
    fn new(rows: Arc<Vec<Row>>) -> Self {
        Self { rows, pos: 0 }
    }
}

impl Iterator for ArcRowsIter {
    type Item = Result<Row>;

    fn next(&mut self) -> Option<Result<Row>> {
        let row = self.rows.get(self.pos)?.clone();
        self.pos += 1;
        Some(Ok(row))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::KeysModel;
    use bytes::Bytes;
    use tempfile::TempDir;

    fn row(key: &str, val: &str) -> Row {
        Row::new(Bytes::from(key.to_string()), vec![Bytes::from(val.to_string())])
    }

    fn schema() -> TabletSchema {
        TabletSchema::new(KeysModel::Duplicate, 1)
    }

    #[test]
    fn test_codec_round_trip() {
        let dir = TempDir::new().unwrap();
        let codec = BincodeCodec;
        let path = dir.path().join("seg.dat");

        let mut chunk = Chunk::new();
        chunk.push(row("a", "1"));
        chunk.push(row("b", "2"));

        let mut writer = codec.new_writer(&path, &schema()).unwrap();
        writer.append(&chunk).unwrap();
        let meta = writer.finish().unwrap();
        assert_eq!(meta.num_rows, 2);

        let rows = codec.read_rows(&path).unwrap();
        assert_eq!(rows, chunk.rows());
    }

    #[test]
    fn test_tablet_writer_one_segment_per_chunk() {
        let dir = TempDir::new().unwrap();
        let mut writer = TabletWriter::new(
            dir.path().to_path_buf(),
            RowsetId(7),
            Arc::new(BincodeCodec),
            schema(),
        );

        let mut c1 = Chunk::new();
        c1.push(row("a", "1"));
        let mut c2 = Chunk::new();
        c2.push(row("b", "2"));
        c2.push(row("c", "3"));

        writer.write_chunk(&c1).unwrap();
        writer.write_chunk(&Chunk::new()).unwrap(); // empty chunk dropped
        writer.write_chunk(&c2).unwrap();

        let segments = writer.finish().unwrap();
        assert_eq!(segments.len(), 2);
        assert_eq!(writer.num_rows(), 3);
        assert!(dir.path().join(&segments[0].file_name).exists());
        assert!(dir.path().join(&segments[1].file_name).exists());
    }

    #[test]
    fn test_tablet_writer_close_removes_files() {
        let dir = TempDir::new().unwrap();
        let mut writer = TabletWriter::new(
            dir.path().to_path_buf(),
            RowsetId(9),
            Arc::new(BincodeCodec),
            schema(),
        );

        let mut chunk = Chunk::new();
        chunk.push(row("a", "1"));
        writer.write_chunk(&chunk).unwrap();

        let seg_path = dir.path().join(TabletWriter::segment_file_name(RowsetId(9), 0));
        assert!(seg_path.exists());

        writer.close();
        assert!(!seg_path.exists());
    }

    #[test]
    fn test_rowset_data_load_and_iterate() {
        let dir = TempDir::new().unwrap();
        let codec: Arc<dyn SegmentCodec> = Arc::new(BincodeCodec);
        let mut writer = TabletWriter::new(
            dir.path().to_path_buf(),
            RowsetId(3),
            Arc::clone(&codec),
            schema(),
        );

        let mut chunk = Chunk::new();
        chunk.push(row("x", "10"));
        chunk.push(row("y", "11"));
        writer.write_chunk(&chunk).unwrap();
        let segments = writer.finish().unwrap();

        let data = SegmentRowsetData::new(
            dir.path().to_path_buf(),
            segments.iter().map(|s| s.file_name.clone()).collect(),
            codec,
        );

        assert!(data.segment_iterators().is_err());

        data.load().unwrap();
        let mut iters = data.segment_iterators().unwrap();
        assert_eq!(iters.len(), 1);
        let rows: Result<Vec<Row>> = iters.pop().unwrap().collect();
        assert_eq!(rows.unwrap().len(), 2);

        data.close();
        assert!(data.segment_iterators().is_err());
    }

    #[test]
    fn test_rowset_data_remove_missing_file_ok() {
        let dir = TempDir::new().unwrap();
        let data = SegmentRowsetData::new(
            dir.path().to_path_buf(),
            vec!["gone.dat".to_string()],
            Arc::new(BincodeCodec),
        );
        assert!(data.remove().is_ok());
    }
}
