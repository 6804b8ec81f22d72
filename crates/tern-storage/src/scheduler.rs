//! Background compaction scheduling.
//!
//! One scheduler loop per node. Each round it waits until there is both
//! a candidate and task headroom, pops candidates until one survives
//! validation, and hands the task to a bounded worker pool. Candidates
//! that fail for structural reasons are dropped (the queue will be
//! refreshed by the next version change); candidates that fail for
//! transient reasons go back into the queue.

use crate::compaction::{CompactionKind, CompactionManager, CompactionTask};
use crate::config::CompactionConfig;
use crate::tablet::TabletManager;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use tokio::sync::Semaphore;
use tokio::task::JoinHandle;
use tokio::time::timeout;
use tracing::{debug, info, warn};

pub struct CompactionScheduler {
    manager: Arc<CompactionManager>,
    tablet_manager: Arc<TabletManager>,
    /// Worker pool bound, sized from `max_task_num` at startup.
    semaphore: Arc<Semaphore>,
    round: AtomicU64,
    stopped: AtomicBool,
}

impl CompactionScheduler {
    pub fn new(
        manager: Arc<CompactionManager>,
        tablet_manager: Arc<TabletManager>,
    ) -> Arc<Self> {
        let permits = manager.config().get().max_task_num;
        Arc::new(Self {
            manager,
            tablet_manager,
            semaphore: Arc::new(Semaphore::new(permits)),
            round: AtomicU64::new(0),
            stopped: AtomicBool::new(false),
        })
    }

    pub fn start(self: Arc<Self>) -> JoinHandle<()> {
        tokio::spawn(async move {
            self.schedule().await;
        })
    }

    pub fn stop(&self) {
        self.stopped.store(true, Ordering::Release);
        self.manager.notify_scheduler();
    }

    pub fn is_stopped(&self) -> bool {
        self.stopped.load(Ordering::Acquire)
    }

    pub fn round(&self) -> u64 {
        self.round.load(Ordering::Acquire)
    }

    async fn schedule(&self) {
        info!("compaction scheduler started");
        while !self.is_stopped() {
            self.round.fetch_add(1, Ordering::AcqRel);
            self.wait_to_run().await;
            if self.is_stopped() {
                break;
            }
            match self.try_get_next_task() {
                Some(task) => self.submit(task),
                None => {
                    // nothing qualified this round; sleep bounded so
                    // cooldown expiry is picked up without a wakeup
                    let idle = self.manager.config().get().idle_wait();
                    let _ = timeout(idle, self.manager.wait_notified()).await;
                }
            }
        }
        info!("compaction scheduler stopped");
    }

    fn can_schedule_next(&self) -> bool {
        !self.manager.check_if_exceed_max_task_num() && self.manager.candidates_size() > 0
    }

    /// Blocks until a round is worth running. Re-checks periodically so
    /// runtime limit changes take effect without a notification.
    async fn wait_to_run(&self) {
        loop {
            if self.is_stopped() || self.can_schedule_next() {
                return;
            }
            let interval = self.manager.config().get().schedule_check_interval();
            let _ = timeout(interval, self.manager.wait_notified()).await;
        }
    }

    /// Pops candidates until one passes every check. Structural failures
    /// discard the candidate; transient failures requeue it after the
    /// round so the pick loop terminates.
    pub fn try_get_next_task(&self) -> Option<Arc<CompactionTask>> {
        let mut requeue = Vec::new();
        let mut picked = None;

        while let Some(candidate) = self.manager.pick_candidate() {
            let tablet = Arc::clone(&candidate.tablet);
            let kind = candidate.kind;

            if !tablet.is_running() {
                debug!("discard compaction candidate: tablet {} not running", tablet.id());
                continue;
            }
            if !tablet.need_compaction(kind) {
                debug!(
                    "discard {kind} compaction candidate: tablet {} score gone stale",
                    tablet.id()
                );
                continue;
            }
            if tablet.has_running_compaction(kind) {
                // the running task refreshes candidacy when it retires
                debug!(
                    "discard {kind} compaction candidate: tablet {} already compacting",
                    tablet.id()
                );
                continue;
            }

            let config = self.manager.config().get();
            let min_inputs = match kind {
                CompactionKind::Cumulative => config.min_cumulative_rowsets,
                CompactionKind::Base => config.min_base_rowsets,
            };
            let rowset_id = self.tablet_manager.next_rowset_id();
            let Some(task) = CompactionTask::create(
                Arc::clone(&tablet),
                kind,
                candidate.score,
                rowset_id,
                config.max_input_rowsets,
                min_inputs,
            ) else {
                // the score can stay positive while the configured input
                // minimum rises past what the tablet has; keep the
                // candidate for when either side moves
                debug!(
                    "requeue {kind} compaction candidate: tablet {} has too few inputs",
                    tablet.id()
                );
                requeue.push(candidate);
                continue;
            };

            if tablet.data_dir().reach_capacity_limit(task.input_size()) {
                debug!(
                    "requeue {kind} compaction candidate: disk {} near capacity",
                    tablet.data_dir().path().display()
                );
                task.release_inputs();
                requeue.push(candidate);
                continue;
            }

            if !self.can_do_task(&task, &config) {
                task.release_inputs();
                requeue.push(candidate);
                continue;
            }

            task.set_task_id(self.manager.next_task_id());
            tablet.register_compaction(kind, task.task_id());
            picked = Some(task);
            break;
        }

        self.manager.insert_candidates(requeue);
        picked
    }

    /// Non-blocking admission checks: kind lock, per-disk ceiling,
    /// failure cooldown. On success the kind lock guard is installed on
    /// the task.
    pub fn can_do_task(&self, task: &Arc<CompactionTask>, config: &CompactionConfig) -> bool {
        let tablet = &task.tablet;
        let kind = task.kind;

        // never block the scheduler loop on a tablet lock
        match tablet.kind_lock(kind).try_lock_owned() {
            Ok(guard) => task.set_kind_lock(guard),
            Err(_) => {
                debug!(
                    "requeue {kind} compaction candidate: tablet {} lock busy",
                    tablet.id()
                );
                return false;
            }
        }

        let disk_limit = match kind {
            CompactionKind::Cumulative => config.cumulative_tasks_per_disk,
            CompactionKind::Base => config.base_tasks_per_disk,
        };
        if disk_limit >= 0 {
            let dir = tablet.data_dir().path();
            let running = self.manager.running_tasks_num_for_dir(kind, dir);
            if running >= disk_limit as usize {
                debug!(
                    "requeue {kind} compaction candidate: disk {} at task limit {disk_limit}",
                    dir.display()
                );
                task.release_kind_lock();
                return false;
            }
        }

        if let Some(elapsed) = tablet.last_failure_elapsed(kind) {
            if elapsed < config.min_failure_interval() {
                debug!(
                    "requeue {kind} compaction candidate: tablet {} in failure cooldown",
                    tablet.id()
                );
                task.release_kind_lock();
                return false;
            }
        }

        true
    }

    /// Hands a validated task to the worker pool.
    pub fn submit(&self, task: Arc<CompactionTask>) {
        let permit = match Arc::clone(&self.semaphore).try_acquire_owned() {
            Ok(permit) => permit,
            Err(_) => {
                warn!("compaction worker pool exhausted, abandoning task");
                self.abandon(task);
                return;
            }
        };
        if let Err(e) = self.manager.register_task(&task) {
            warn!("failed to register compaction task: {e}");
            self.abandon(task);
            return;
        }
        let manager = Arc::clone(&self.manager);
        tokio::task::spawn_blocking(move || {
            let _permit = permit;
            task.run(manager.as_ref());
        });
    }

    /// Returns an admitted but unsubmitted task's resources and requeues
    /// the tablet.
    fn abandon(&self, task: Arc<CompactionTask>) {
        task.release_kind_lock();
        task.release_inputs();
        task.tablet.reset_compaction(task.kind);
        self.manager.update_candidate(task.to_candidate());
    }
}
