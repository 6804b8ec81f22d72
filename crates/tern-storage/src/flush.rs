//! Asynchronous memtable flushing.
//!
//! Each writer gets its own [`FlushToken`]: a bounded queue drained by a
//! single consumer task, so flushes submitted by one writer land in
//! submission order. The first flush failure is sticky; later memtables
//! are drained without being written and `wait()` surfaces the error.

use crate::error::{Error, Result};
use crate::memtable::MemTable;
use crate::segment::MemTableSink;
use parking_lot::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use tokio::sync::{mpsc, Notify};
use tracing::{debug, warn};

/// Spawns flush consumers. One executor is shared by all writers; the
/// queue bound applies per token.
pub struct FlushTokenExecutor {
    queue_capacity: usize,
}

impl FlushTokenExecutor {
    pub fn new(queue_capacity: usize) -> Self {
        Self { queue_capacity }
    }

    pub fn create_flush_token(&self, sink: Arc<dyn MemTableSink>) -> FlushToken {
        let (tx, mut rx) = mpsc::channel::<MemTable>(self.queue_capacity);
        let inner = Arc::new(TokenInner {
            inflight: AtomicUsize::new(0),
            first_error: Mutex::new(None),
            flushed: AtomicUsize::new(0),
            notify: Notify::new(),
        });

        let consumer = Arc::clone(&inner);
        tokio::spawn(async move {
            while let Some(mut memtable) = rx.recv().await {
                if consumer.first_error.lock().is_none() {
                    match memtable.flush(sink.as_ref()) {
                        Ok(()) => {
                            consumer.flushed.fetch_add(1, Ordering::Release);
                        }
                        Err(e) => {
                            warn!("memtable flush failed: {e}");
                            *consumer.first_error.lock() = Some(e.to_string());
                        }
                    }
                } else {
                    debug!(
                        "skipping memtable flush for tablet {} after earlier failure",
                        memtable.tablet_id()
                    );
                }
                drop(memtable);
                consumer.inflight.fetch_sub(1, Ordering::AcqRel);
                consumer.notify.notify_waiters();
            }
        });

        FlushToken { tx, inner }
    }
}

struct TokenInner {
    inflight: AtomicUsize,
    first_error: Mutex<Option<String>>,
    flushed: AtomicUsize,
    notify: Notify,
}

/// Per-writer flush handle. Submissions are processed FIFO by a single
/// consumer; `submit` blocks when the queue is at capacity.
pub struct FlushToken {
    tx: mpsc::Sender<MemTable>,
    inner: Arc<TokenInner>,
}

impl FlushToken {
    /// Queues a finalized memtable. Fails fast if an earlier flush
    /// already failed.
    pub async fn submit(&self, memtable: MemTable) -> Result<()> {
        self.check_error()?;
        self.inner.inflight.fetch_add(1, Ordering::AcqRel);
        if self.tx.send(memtable).await.is_err() {
            self.inner.inflight.fetch_sub(1, Ordering::AcqRel);
            return Err(Error::Flush("flush consumer stopped".to_string()));
        }
        Ok(())
    }

    /// Waits until every submitted memtable has been processed, then
    /// surfaces the first error if any flush failed.
    pub async fn wait(&self) -> Result<()> {
        loop {
            let notified = self.inner.notify.notified();
            if self.inner.inflight.load(Ordering::Acquire) == 0 {
                break;
            }
            notified.await;
        }
        self.check_error()
    }

    pub fn num_flushed(&self) -> usize {
        self.inner.flushed.load(Ordering::Acquire)
    }

    pub fn has_error(&self) -> bool {
        self.inner.first_error.lock().is_some()
    }

    fn check_error(&self) -> Result<()> {
        match self.inner.first_error.lock().as_ref() {
            Some(msg) => Err(Error::Flush(msg.clone())),
            None => Ok(()),
        }
    }
}
