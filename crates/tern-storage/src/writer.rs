//! Per-transaction delta writer.
//!
//! Buffers incoming rows in a memtable and decides, on every write, how
//! to relieve memory pressure:
//!
//!   1. writer tracker over its limit: flush synchronously
//!   2. node-wide tracker over its limit: flush synchronously
//!   3. memtable full: flush asynchronously and keep accepting writes
//!
//! The synchronous cases block the caller until the flush pipeline
//! drains, which is what pushes backpressure up to the ingestion RPC.

use crate::chunk::Chunk;
use crate::config::StorageConfig;
use crate::error::{Error, Result};
use crate::flush::{FlushToken, FlushTokenExecutor};
use crate::memtable::MemTable;
use crate::meta::{MetaStore, TxnLog, WriteManifest};
use crate::rowset::{PartitionId, RowsetId, TabletId, TxnId};
use crate::segment::{MemTableSink, TabletWriter, TabletWriterSink};
use crate::tablet::{Tablet, TabletManager};
use crate::tracker::MemTracker;
use parking_lot::Mutex;
use std::sync::Arc;
use tracing::debug;

pub struct DeltaWriter {
    tablet_id: TabletId,
    txn_id: TxnId,
    partition_id: PartitionId,
    tablet: Arc<Tablet>,
    rowset_id: RowsetId,
    mem_tracker: Arc<MemTracker>,
    mem_table: Option<MemTable>,
    tablet_writer: Arc<Mutex<TabletWriter>>,
    flush_token: FlushToken,
    meta_store: Arc<dyn MetaStore>,
    max_buffer_rows: usize,
    max_buffer_bytes: usize,
    finished: bool,
    closed: bool,
}

impl DeltaWriter {
    /// Opens a writer for one (tablet, txn) pair.
    pub fn open(
        tablet_id: TabletId,
        txn_id: TxnId,
        partition_id: PartitionId,
        tablet_manager: &Arc<TabletManager>,
        flush_executor: &FlushTokenExecutor,
        meta_store: Arc<dyn MetaStore>,
        node_tracker: &Arc<MemTracker>,
        config: &StorageConfig,
    ) -> Result<Self> {
        let tablet = tablet_manager.get_tablet(tablet_id)?;
        if !tablet.is_running() {
            return Err(Error::TabletNotRunning(tablet_id));
        }
        let rowset_id = tablet_manager.next_rowset_id();
        let tablet_writer = Arc::new(Mutex::new(TabletWriter::new(
            tablet.data_path().to_path_buf(),
            rowset_id,
            Arc::clone(tablet.codec()),
            tablet.schema().clone(),
        )));
        let sink: Arc<dyn MemTableSink> =
            Arc::new(TabletWriterSink::new(Arc::clone(&tablet_writer)));
        let flush_token = flush_executor.create_flush_token(sink);
        let mem_tracker = node_tracker.child(
            format!("delta-writer-{tablet_id}-{txn_id}"),
            config.memory.writer_limit_bytes,
        );
        Ok(Self {
            tablet_id,
            txn_id,
            partition_id,
            tablet,
            rowset_id,
            mem_tracker,
            mem_table: None,
            tablet_writer,
            flush_token,
            meta_store,
            max_buffer_rows: config.memtable.max_buffer_rows,
            max_buffer_bytes: config.memtable.max_buffer_bytes,
            finished: false,
            closed: false,
        })
    }

    pub fn tablet_id(&self) -> TabletId {
        self.tablet_id
    }

    pub fn txn_id(&self) -> TxnId {
        self.txn_id
    }

    pub fn rowset_id(&self) -> RowsetId {
        self.rowset_id
    }

    /// Flushes completed so far, for observability.
    pub fn num_flushes(&self) -> usize {
        self.flush_token.num_flushed()
    }

    /// Buffers the rows of `chunk` selected by `indexes`.
    pub async fn write(&mut self, chunk: &Chunk, indexes: &[u32]) -> Result<()> {
        self.check_open()?;
        if self.mem_table.is_none() {
            self.mem_table = Some(MemTable::new(
                self.tablet_id,
                self.tablet.schema().clone(),
                self.max_buffer_rows,
                self.max_buffer_bytes,
                Arc::clone(&self.mem_tracker),
            ));
        }
        let full = match self.mem_table.as_mut() {
            Some(mem_table) => mem_table.insert(chunk, indexes),
            None => false,
        };

        if self.mem_tracker.limit_exceeded() {
            debug!(
                "writer for tablet {} over memory limit, flushing synchronously",
                self.tablet_id
            );
            self.flush_memtable().await
        } else if self
            .mem_tracker
            .parent()
            .is_some_and(|p| p.limit_exceeded())
        {
            debug!(
                "node ingestion memory over limit, writer for tablet {} flushing synchronously",
                self.tablet_id
            );
            self.flush_memtable().await
        } else if full {
            self.flush_memtable_async().await
        } else {
            Ok(())
        }
    }

    /// Detaches the memtable and queues it; returns without waiting.
    pub async fn flush_memtable_async(&mut self) -> Result<()> {
        let Some(mut mem_table) = self.mem_table.take() else {
            return Ok(());
        };
        if mem_table.is_empty() {
            return Ok(());
        }
        mem_table.finalize();
        self.flush_token.submit(mem_table).await
    }

    /// Flushes and blocks until the pipeline drains.
    pub async fn flush_memtable(&mut self) -> Result<()> {
        self.flush_memtable_async().await?;
        self.flush_token.wait().await
    }

    /// Seals the write: flushes the tail, waits for every segment, and
    /// stages the transaction log for later publish.
    pub async fn finish(&mut self) -> Result<()> {
        self.check_open()?;
        self.flush_memtable_async().await?;
        self.flush_token.wait().await?;

        let segments = self.tablet_writer.lock().finish()?;
        let num_rows = segments.iter().map(|s| s.num_rows).sum();
        let data_size = segments.iter().map(|s| s.data_size).sum();
        let overlapped = segments.len() > 1;
        self.meta_store.put_txn_log(TxnLog {
            tablet_id: self.tablet_id,
            txn_id: self.txn_id,
            partition_id: self.partition_id,
            write: WriteManifest {
                rowset_id: self.rowset_id,
                segments,
                num_rows,
                data_size,
                overlapped,
            },
        })?;
        self.finished = true;
        debug!(
            "writer for tablet {} txn {} finished, rows: {num_rows}, bytes: {data_size}",
            self.tablet_id, self.txn_id
        );
        Ok(())
    }

    /// Abandons the write. Idempotent; a finished writer keeps its
    /// staged log.
    pub async fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.mem_table = None;
        // drain in-flight flushes so file removal below races nothing
        let _ = self.flush_token.wait().await;
        if !self.finished {
            self.tablet_writer.lock().close();
        }
    }

    fn check_open(&self) -> Result<()> {
        if self.closed {
            return Err(Error::Internal(format!(
                "writer for tablet {} txn {} is closed",
                self.tablet_id, self.txn_id
            )));
        }
        if self.finished {
            return Err(Error::Internal(format!(
                "writer for tablet {} txn {} already finished",
                self.tablet_id, self.txn_id
            )));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::chunk::{KeysModel, Row, TabletSchema};
    use crate::compaction::{CompactionManager, DefaultCompactionPolicy};
    use crate::config::CompactionConfigHandle;
    use crate::meta::MemMetaStore;
    use crate::segment::BincodeCodec;
    use bytes::Bytes;
    use tempfile::TempDir;

    struct Fixture {
        _dir: TempDir,
        config: StorageConfig,
        manager: Arc<TabletManager>,
        meta_store: Arc<MemMetaStore>,
        executor: FlushTokenExecutor,
        tracker: Arc<MemTracker>,
    }

    fn fixture(mut config: StorageConfig) -> Fixture {
        let dir = TempDir::new().unwrap();
        config.data_dirs = vec![dir.path().to_path_buf()];
        let meta_store = Arc::new(MemMetaStore::new());
        let compaction_manager =
            CompactionManager::new(CompactionConfigHandle::new(config.compaction.clone()));
        let manager = TabletManager::new(
            &config,
            meta_store.clone() as Arc<dyn MetaStore>,
            Arc::new(BincodeCodec),
            Arc::new(DefaultCompactionPolicy::new(2, 2)),
            compaction_manager,
        )
        .unwrap();
        manager
            .create_tablet(1, TabletSchema::new(KeysModel::Duplicate, 1))
            .unwrap();
        let executor = FlushTokenExecutor::new(config.flush.queue_capacity);
        let tracker = MemTracker::root("load", config.memory.process_limit_bytes);
        Fixture {
            _dir: dir,
            config,
            manager,
            meta_store,
            executor,
            tracker,
        }
    }

    fn chunk(keys: &[&str]) -> Chunk {
        let mut chunk = Chunk::new();
        for key in keys {
            chunk.push(Row::new(
                Bytes::from(key.to_string()),
                vec![Bytes::from("v")],
            ));
        }
        chunk
    }

    fn all(chunk: &Chunk) -> Vec<u32> {
        (0..chunk.len() as u32).collect()
    }

    async fn open(fx: &Fixture, txn_id: TxnId) -> DeltaWriter {
        DeltaWriter::open(
            1,
            txn_id,
            1,
            &fx.manager,
            &fx.executor,
            fx.meta_store.clone(),
            &fx.tracker,
            &fx.config,
        )
        .unwrap()
    }

    #[tokio::test]
    async fn test_write_finish_publish() {
        let fx = fixture(StorageConfig::default());
        let mut writer = open(&fx, 100).await;

        let c = chunk(&["b", "a"]);
        writer.write(&c, &all(&c)).await.unwrap();
        writer.finish().await.unwrap();
        writer.close().await;

        let version = fx.manager.publish_txn(1, 100).unwrap();
        assert_eq!(version.end, 1);

        let tablet = fx.manager.get_tablet(1).unwrap();
        let rows = tablet.scan_all().unwrap();
        let keys: Vec<_> = rows.iter().map(|r| r.key.clone()).collect();
        assert_eq!(keys, vec![Bytes::from("a"), Bytes::from("b")]);
    }

    #[tokio::test]
    async fn test_full_memtable_flushes_async() {
        let mut config = StorageConfig::default();
        config.memtable.max_buffer_rows = 2;
        let fx = fixture(config);
        let mut writer = open(&fx, 101).await;

        for keys in [&["a", "b"][..], &["c", "d"][..], &["e"][..]] {
            let c = chunk(keys);
            writer.write(&c, &all(&c)).await.unwrap();
        }
        writer.finish().await.unwrap();
        assert_eq!(writer.num_flushes(), 3, "two full buffers plus the tail");

        writer.close().await;
        fx.manager.publish_txn(1, 101).unwrap();
        let tablet = fx.manager.get_tablet(1).unwrap();
        let rowset = &tablet.rowsets()[0];
        assert_eq!(rowset.num_segments(), 3);
        assert!(rowset.overlapped());
    }

    #[tokio::test]
    async fn test_writer_limit_forces_sync_flush() {
        let mut config = StorageConfig::default();
        config.memory.writer_limit_bytes = 1;
        let fx = fixture(config);
        let mut writer = open(&fx, 102).await;

        let c = chunk(&["abcdef"]);
        writer.write(&c, &all(&c)).await.unwrap();
        // the sync flush drained the pipeline before write returned
        assert_eq!(writer.num_flushes(), 1);

        writer.finish().await.unwrap();
        writer.close().await;
    }

    #[tokio::test]
    async fn test_node_limit_throttles_innocent_writer() {
        let mut config = StorageConfig::default();
        config.memory.process_limit_bytes = 8;
        let fx = fixture(config);

        // a sibling pushes the node tracker over its limit
        let hog = fx.tracker.child("hog", 0);
        hog.consume(1024);

        let mut writer = open(&fx, 103).await;
        let c = chunk(&["a"]);
        writer.write(&c, &all(&c)).await.unwrap();
        assert_eq!(writer.num_flushes(), 1, "sync flush despite tiny buffer");

        hog.release(1024);
        writer.finish().await.unwrap();
        writer.close().await;
    }

    #[tokio::test]
    async fn test_close_without_finish_removes_files() {
        let mut config = StorageConfig::default();
        config.memtable.max_buffer_rows = 1;
        let fx = fixture(config);
        let mut writer = open(&fx, 104).await;

        let c = chunk(&["a"]);
        writer.write(&c, &all(&c)).await.unwrap();
        writer.flush_memtable().await.unwrap();

        let seg_path = {
            let tablet = fx.manager.get_tablet(1).unwrap();
            tablet
                .data_path()
                .join(TabletWriter::segment_file_name(writer.rowset_id(), 0))
        };
        assert!(seg_path.exists());

        writer.close().await;
        assert!(!seg_path.exists());
        assert!(fx.meta_store.take_txn_log(1, 104).is_err());
    }

    #[tokio::test]
    async fn test_write_after_close_rejected() {
        let fx = fixture(StorageConfig::default());
        let mut writer = open(&fx, 105).await;
        writer.close().await;

        let c = chunk(&["a"]);
        assert!(writer.write(&c, &all(&c)).await.is_err());
    }
}
