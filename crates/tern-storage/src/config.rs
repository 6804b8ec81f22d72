use crate::error::{Error, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

/// Top-level storage engine configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Data directories, one per disk. Tablets are spread across them.
    pub data_dirs: Vec<PathBuf>,

    /// Per-directory capacity in bytes (0 = unlimited).
    pub data_dir_capacity_bytes: u64,

    /// Write-path configuration.
    pub memtable: MemTableConfig,

    /// Flush pipeline configuration.
    pub flush: FlushConfig,

    /// Memory budgets for ingestion.
    pub memory: MemoryConfig,

    /// Compaction scheduling limits (changeable at runtime, see
    /// [`CompactionConfigHandle`]).
    pub compaction: CompactionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemTableConfig {
    /// Row-count threshold at which a memtable reports itself full.
    pub max_buffer_rows: usize,

    /// Byte threshold at which a memtable reports itself full
    /// (default: 64 MiB).
    pub max_buffer_bytes: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FlushConfig {
    /// Bound on the number of memtables queued per flush token.
    pub queue_capacity: usize,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MemoryConfig {
    /// Per-writer memory limit in bytes (0 = unlimited).
    pub writer_limit_bytes: i64,

    /// Node-wide ingestion memory limit in bytes (0 = unlimited).
    /// Exceeding this throttles every writer, not just the offender.
    pub process_limit_bytes: i64,
}

/// Limits read by the compaction scheduler on every round.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CompactionConfig {
    /// Global ceiling on concurrently running compaction tasks.
    pub max_task_num: usize,

    /// Per-disk ceiling on cumulative compaction tasks (-1 = unlimited).
    pub cumulative_tasks_per_disk: i32,

    /// Per-disk ceiling on base compaction tasks (-1 = unlimited).
    pub base_tasks_per_disk: i32,

    /// Minimum interval before a tablet is retried after a failed
    /// compaction of the same kind.
    pub min_failure_interval_sec: u64,

    /// How often the scheduler re-checks capacity while waiting, so that
    /// runtime config changes take effect.
    pub schedule_check_interval_sec: u64,

    /// Bounded wait when no candidate qualified this round.
    pub idle_wait_sec: u64,

    /// Minimum number of input rowsets for a cumulative compaction.
    pub min_cumulative_rowsets: usize,

    /// Minimum number of input rowsets for a base compaction.
    pub min_base_rowsets: usize,

    /// Upper bound on input rowsets captured by one task.
    pub max_input_rowsets: usize,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            data_dirs: vec![PathBuf::from("data")],
            data_dir_capacity_bytes: 0,
            memtable: MemTableConfig::default(),
            flush: FlushConfig::default(),
            memory: MemoryConfig::default(),
            compaction: CompactionConfig::default(),
        }
    }
}

impl Default for MemTableConfig {
    fn default() -> Self {
        Self {
            max_buffer_rows: 1_048_576,
            max_buffer_bytes: 64 * 1024 * 1024, // 64 MiB
        }
    }
}

impl Default for FlushConfig {
    fn default() -> Self {
        Self { queue_capacity: 4 }
    }
}

impl Default for MemoryConfig {
    fn default() -> Self {
        Self {
            writer_limit_bytes: 128 * 1024 * 1024,
            process_limit_bytes: 2 * 1024 * 1024 * 1024,
        }
    }
}

impl Default for CompactionConfig {
    fn default() -> Self {
        Self {
            max_task_num: 4,
            cumulative_tasks_per_disk: 2,
            base_tasks_per_disk: 1,
            min_failure_interval_sec: 120,
            schedule_check_interval_sec: 5,
            idle_wait_sec: 10,
            min_cumulative_rowsets: 2,
            min_base_rowsets: 2,
            max_input_rowsets: 64,
        }
    }
}

impl StorageConfig {
    /// Validates the configuration and returns an error if invalid.
    pub fn validate(&self) -> Result<()> {
        if self.data_dirs.is_empty() {
            return Err(Error::Config("data_dirs must not be empty".to_string()));
        }

        if self.memtable.max_buffer_rows == 0 {
            return Err(Error::Config(
                "memtable.max_buffer_rows must be > 0".to_string(),
            ));
        }

        if self.memtable.max_buffer_bytes == 0 {
            return Err(Error::Config(
                "memtable.max_buffer_bytes must be > 0".to_string(),
            ));
        }

        if self.flush.queue_capacity == 0 {
            return Err(Error::Config(
                "flush.queue_capacity must be > 0".to_string(),
            ));
        }

        if self.memory.writer_limit_bytes < 0 || self.memory.process_limit_bytes < 0 {
            return Err(Error::Config(
                "memory limits must be >= 0 (0 = unlimited)".to_string(),
            ));
        }

        self.compaction.validate()
    }
}

impl CompactionConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_task_num == 0 {
            return Err(Error::Config(
                "compaction.max_task_num must be > 0".to_string(),
            ));
        }

        if self.min_cumulative_rowsets < 2 || self.min_base_rowsets < 2 {
            return Err(Error::Config(
                "compaction input minimums must be >= 2".to_string(),
            ));
        }

        if self.max_input_rowsets < self.min_cumulative_rowsets {
            return Err(Error::Config(
                "compaction.max_input_rowsets must be >= min_cumulative_rowsets".to_string(),
            ));
        }

        if self.schedule_check_interval_sec == 0 || self.idle_wait_sec == 0 {
            return Err(Error::Config(
                "scheduler wait intervals must be > 0".to_string(),
            ));
        }

        Ok(())
    }

    pub fn min_failure_interval(&self) -> Duration {
        Duration::from_secs(self.min_failure_interval_sec)
    }

    pub fn schedule_check_interval(&self) -> Duration {
        Duration::from_secs(self.schedule_check_interval_sec)
    }

    pub fn idle_wait(&self) -> Duration {
        Duration::from_secs(self.idle_wait_sec)
    }
}

/// Shared handle to the compaction limits.
///
/// The scheduler reads through this on every round instead of caching
/// values at startup, so limits can be adjusted on a live node.
#[derive(Clone)]
pub struct CompactionConfigHandle {
    inner: Arc<RwLock<CompactionConfig>>,
}

impl CompactionConfigHandle {
    pub fn new(config: CompactionConfig) -> Self {
        Self {
            inner: Arc::new(RwLock::new(config)),
        }
    }

    /// Returns a snapshot of the current limits.
    pub fn get(&self) -> CompactionConfig {
        self.inner.read().clone()
    }

    /// Applies an in-place update, visible to the scheduler on its next
    /// round.
    pub fn update(&self, f: impl FnOnce(&mut CompactionConfig)) {
        f(&mut self.inner.write());
    }
}
