use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("segment codec error: {0}")]
    Codec(String),

    #[error("invalid configuration: {0}")]
    Config(String),

    #[error("tablet {0} not found")]
    TabletNotFound(i64),

    #[error("tablet {0} is not in running state")]
    TabletNotRunning(i64),

    #[error("txn log not found for tablet {tablet_id}, txn {txn_id}")]
    TxnLogNotFound { tablet_id: i64, txn_id: i64 },

    #[error("version conflict on tablet {tablet_id}: {reason}")]
    VersionConflict { tablet_id: i64, reason: String },

    #[error("flush error: {0}")]
    Flush(String),

    #[error("compaction error: {0}")]
    Compaction(String),

    #[error("memory limit exceeded: {0}")]
    MemLimitExceeded(String),

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;
