//! Transaction logs and tablet metadata persistence.
//!
//! A finished write publishes a [`TxnLog`] describing the staged rowset;
//! commit later turns the log into a visible version. The storage core
//! only needs a small key-value surface, kept behind [`MetaStore`] so a
//! durable implementation can replace the in-memory one.

use crate::chunk::TabletSchema;
use crate::error::{Error, Result};
use crate::rowset::{PartitionId, RowsetId, RowsetMeta, TabletId, TxnId, Version};
use crate::segment::SegmentMeta;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// What one transaction wrote into one tablet.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WriteManifest {
    pub rowset_id: RowsetId,
    pub segments: Vec<SegmentMeta>,
    pub num_rows: u64,
    pub data_size: u64,
    pub overlapped: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TxnLog {
    pub tablet_id: TabletId,
    pub txn_id: TxnId,
    pub partition_id: PartitionId,
    pub write: WriteManifest,
}

/// Durable view of one tablet: schema plus its visible rowsets.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TabletMetaSnapshot {
    pub tablet_id: TabletId,
    pub schema: TabletSchema,
    pub cumulative_point: i64,
    pub rowsets: Vec<(RowsetMeta, Version)>,
}

pub trait MetaStore: Send + Sync {
    fn put_txn_log(&self, log: TxnLog) -> Result<()>;
    /// Removes and returns the log, so publish consumes it exactly once.
    fn take_txn_log(&self, tablet_id: TabletId, txn_id: TxnId) -> Result<TxnLog>;
    fn save_tablet_meta(&self, snapshot: TabletMetaSnapshot) -> Result<()>;
    fn remove_tablet_meta(&self, tablet_id: TabletId) -> Result<()>;
}

/// In-memory metadata store, also the test double.
pub struct MemMetaStore {
    txn_logs: Mutex<HashMap<(TabletId, TxnId), TxnLog>>,
    tablet_metas: Mutex<HashMap<TabletId, TabletMetaSnapshot>>,
}

impl MemMetaStore {
    pub fn new() -> Self {
        Self {
            txn_logs: Mutex::new(HashMap::new()),
            tablet_metas: Mutex::new(HashMap::new()),
        }
    }

    pub fn tablet_meta(&self, tablet_id: TabletId) -> Option<TabletMetaSnapshot> {
        self.tablet_metas.lock().get(&tablet_id).cloned()
    }
}

impl Default for MemMetaStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MetaStore for MemMetaStore {
    fn put_txn_log(&self, log: TxnLog) -> Result<()> {
        self.txn_logs
            .lock()
            .insert((log.tablet_id, log.txn_id), log);
        Ok(())
    }

    fn take_txn_log(&self, tablet_id: TabletId, txn_id: TxnId) -> Result<TxnLog> {
        self.txn_logs
            .lock()
            .remove(&(tablet_id, txn_id))
            .ok_or(Error::TxnLogNotFound { tablet_id, txn_id })
    }

    fn save_tablet_meta(&self, snapshot: TabletMetaSnapshot) -> Result<()> {
        self.tablet_metas
            .lock()
            .insert(snapshot.tablet_id, snapshot);
        Ok(())
    }

    fn remove_tablet_meta(&self, tablet_id: TabletId) -> Result<()> {
        self.tablet_metas.lock().remove(&tablet_id);
        Ok(())
    }
}
