//! Worker pool and admission control.
//!
//! Tasks reach workers through two channels: a zero-capacity handoff that
//! only succeeds while a worker is idle in `select!`, and, for
//! [`QueueStrategy::BoundedQueue`], a bounded backlog. Admission never
//! blocks: a fork the pool cannot take right now runs inline, on the
//! spawner's thread, before the spawn returns.

use crate::{
    config::{EngineConfig, QueueStrategy},
    speculation::{
        engine::Runtime,
        task::{Computation, Task, TaskControl},
        types::{TaskId, WorkerState},
    },
};
use crossbeam_channel::{Receiver, Sender, TrySendError, bounded, never, select};
use parking_lot::RwLock;
use std::sync::{
    Arc,
    atomic::{AtomicBool, AtomicU8, AtomicU64, AtomicUsize, Ordering},
};
use tracing::{debug, trace};

pub(crate) type Job = Arc<dyn TaskControl>;

struct Senders {
    handoff: Sender<Job>,
    backlog: Option<Sender<Job>>,
}

/// Shared pool state: queues, worker states and progress counters.
pub(crate) struct Scheduler {
    senders: RwLock<Option<Senders>>,
    handoff_rx: Receiver<Job>,
    backlog_rx: Option<Receiver<Job>>,
    backlog_capacity: usize,
    /// Cleared by the watchdog to demote buffered admission to handoff only
    buffering: AtomicBool,
    idle_workers: AtomicUsize,
    /// Jobs taken off the backlog, by workers or the watchdog
    backlog_dequeued: AtomicU64,
    workers: Vec<AtomicU8>,
}

impl Scheduler {
    pub(crate) fn new(config: &EngineConfig) -> Self {
        let (handoff_tx, handoff_rx) = bounded(0);
        let (backlog, backlog_rx, backlog_capacity) = match config.queue {
            QueueStrategy::SynchronousHandoff => (None, None, 0),
            QueueStrategy::BoundedQueue { capacity } => {
                let (tx, rx) = bounded(capacity);
                (Some(tx), Some(rx), capacity)
            }
        };
        let workers = (0..config.worker_count())
            .map(|_| AtomicU8::new(WorkerState::Running as u8))
            .collect();

        Self {
            senders: RwLock::new(Some(Senders {
                handoff: handoff_tx,
                backlog,
            })),
            handoff_rx,
            backlog_capacity,
            buffering: AtomicBool::new(backlog_rx.is_some()),
            backlog_rx,
            idle_workers: AtomicUsize::new(0),
            backlog_dequeued: AtomicU64::new(0),
            workers,
        }
    }

    pub(crate) fn worker_count(&self) -> usize {
        self.workers.len()
    }

    pub(crate) fn is_buffering(&self) -> bool {
        self.buffering.load(Ordering::SeqCst)
    }

    pub(crate) fn backlog_len(&self) -> usize {
        self.backlog_rx.as_ref().map_or(0, Receiver::len)
    }

    pub(crate) fn backlog_dequeued(&self) -> u64 {
        self.backlog_dequeued.load(Ordering::SeqCst)
    }

    pub(crate) fn idle_workers(&self) -> usize {
        self.idle_workers.load(Ordering::SeqCst)
    }

    /// Cheap pre-check: could an offer made right now be accepted?
    pub(crate) fn has_room(&self) -> bool {
        self.idle_workers() > 0 || (self.is_buffering() && self.backlog_len() < self.backlog_capacity)
    }

    /// Hand `job` to an idle worker, or buffer it when buffering is enabled.
    /// Returns the job back if the pool is saturated or shut down.
    pub(crate) fn offer(&self, job: Job) -> Result<(), Job> {
        let senders = self.senders.read();
        let Some(senders) = senders.as_ref() else {
            return Err(job);
        };
        let job = match senders.handoff.try_send(job) {
            Ok(()) => return Ok(()),
            Err(TrySendError::Full(job)) | Err(TrySendError::Disconnected(job)) => job,
        };
        match &senders.backlog {
            Some(backlog) if self.is_buffering() => backlog.try_send(job).map_err(|err| match err {
                TrySendError::Full(job) | TrySendError::Disconnected(job) => job,
            }),
            _ => Err(job),
        }
    }

    pub(crate) fn worker_state(&self, worker: usize) -> WorkerState {
        self.workers
            .get(worker)
            .map_or(WorkerState::Idle, |state| WorkerState::from_u8(state.load(Ordering::SeqCst)))
    }

    pub(crate) fn worker_states(&self) -> Vec<WorkerState> {
        (0..self.workers.len()).map(|id| self.worker_state(id)).collect()
    }

    pub(crate) fn set_worker_state(&self, worker: usize, state: WorkerState) {
        if let Some(slot) = self.workers.get(worker) {
            slot.store(state as u8, Ordering::SeqCst);
        }
    }

    /// Mark `worker` blocked until the guard drops. A no-op off the pool.
    pub(crate) fn blocked(&self, worker: Option<usize>) -> BlockedGuard<'_> {
        if let Some(worker) = worker {
            self.set_worker_state(worker, WorkerState::Blocked);
        }
        BlockedGuard {
            scheduler: self,
            worker,
        }
    }

    /// Stop accepting buffered tasks. Returns false if already demoted.
    pub(crate) fn demote(&self) -> bool {
        self.buffering.swap(false, Ordering::SeqCst)
    }

    /// Empty the backlog. Drained tasks stay queued and are stolen by their
    /// spawner when it settles them.
    pub(crate) fn drain_backlog(&self) -> Vec<TaskId> {
        let Some(backlog) = &self.backlog_rx else {
            return Vec::new();
        };
        let drained: Vec<TaskId> = backlog.try_iter().map(|job| job.id()).collect();
        self.backlog_dequeued
            .fetch_add(drained.len() as u64, Ordering::SeqCst);
        drained
    }

    /// Drop the senders so idle workers observe disconnection and exit.
    pub(crate) fn close(&self) {
        self.senders.write().take();
    }

    fn receivers(&self) -> (Receiver<Job>, Receiver<Job>) {
        (
            self.handoff_rx.clone(),
            self.backlog_rx.clone().unwrap_or_else(never),
        )
    }
}

/// Restores the worker to `Running` on drop.
pub(crate) struct BlockedGuard<'a> {
    scheduler: &'a Scheduler,
    worker: Option<usize>,
}

impl Drop for BlockedGuard<'_> {
    fn drop(&mut self) {
        if let Some(worker) = self.worker {
            self.scheduler.set_worker_state(worker, WorkerState::Running);
        }
    }
}

/// Admit a fork. Returns the speculative task if the pool took it, `None`
/// if the fork has to run inline. `granted` hands the task the commit token
/// up front.
pub(crate) fn try_spawn<T: Clone + Send + 'static>(
    runtime: &Arc<Runtime>,
    spawner: TaskId,
    depth: usize,
    label: &str,
    granted: bool,
    computation: &Computation<T>,
) -> Option<Arc<Task<T>>> {
    let scheduler = &runtime.scheduler;
    if !scheduler.has_room() {
        runtime.metrics.record_rejection();
        trace!(target: "speculation", label = %label, "Pool saturated, running fork inline");
        return None;
    }

    let id = runtime.tree.next_id();
    let task = Arc::new(Task::new(id, spawner, label, depth, Arc::clone(computation), granted));
    if !runtime.tree.insert(task.clone()) {
        runtime.metrics.record_inline();
        return None;
    }

    match scheduler.offer(task.clone()) {
        Ok(()) => {
            runtime.metrics.record_spawn();
            debug!(
                target: "speculation",
                task_id = %id,
                spawner = %spawner,
                label = %label,
                depth = depth,
                granted = granted,
                "Spawned speculative task"
            );
            Some(task)
        }
        Err(_) => {
            runtime.tree.remove(id);
            runtime.metrics.record_rejection();
            trace!(target: "speculation", label = %label, "Offer rejected, running fork inline");
            None
        }
    }
}

/// Body of pool worker `worker_id`. Returns once the scheduler is closed.
///
/// `ready` is signalled once, the first time the worker parks.
pub(crate) fn worker_loop(runtime: Arc<Runtime>, worker_id: usize, ready: Sender<()>) {
    let worker_span = tracing::info_span!(target: "speculation", "speculation_worker", worker_id = worker_id);
    let _worker_guard = worker_span.entered();

    let scheduler = &runtime.scheduler;
    let (handoff, backlog) = scheduler.receivers();
    let mut ready = Some(ready);
    loop {
        scheduler.set_worker_state(worker_id, WorkerState::Idle);
        scheduler.idle_workers.fetch_add(1, Ordering::SeqCst);
        if let Some(ready) = ready.take() {
            // The engine may have given up waiting already
            let _ = ready.send(());
        }
        let (job, from_backlog) = select! {
            recv(handoff) -> msg => (msg, false),
            recv(backlog) -> msg => (msg, true),
        };
        scheduler.idle_workers.fetch_sub(1, Ordering::SeqCst);

        let Ok(job) = job else {
            break;
        };
        if from_backlog {
            scheduler.backlog_dequeued.fetch_add(1, Ordering::SeqCst);
        }
        scheduler.set_worker_state(worker_id, WorkerState::Running);
        job.execute(&runtime, worker_id);
    }

    scheduler.set_worker_state(worker_id, WorkerState::Idle);
    debug!(target: "speculation", worker_id = worker_id, "Worker thread exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        metrics::EngineMetrics,
        speculation::{context::Ctx, task::TaskTree},
    };

    fn job(tree: &TaskTree) -> Job {
        Arc::new(Task::<u32>::new(
            tree.next_id(),
            TaskId::ROOT,
            "job",
            1,
            Arc::new(|_: &mut Ctx| Ok(1)),
            false,
        ))
    }

    #[test]
    fn test_handoff_rejects_without_idle_worker() {
        let scheduler = Scheduler::new(&EngineConfig::default().with_workers(2));
        let tree = TaskTree::new(Arc::new(EngineMetrics::default()));
        assert!(!scheduler.has_room());
        assert!(scheduler.offer(job(&tree)).is_err());
    }

    #[test]
    fn test_backlog_accepts_until_full() {
        let config = EngineConfig::default()
            .with_workers(1)
            .with_queue(QueueStrategy::BoundedQueue { capacity: 2 });
        let scheduler = Scheduler::new(&config);
        let tree = TaskTree::new(Arc::new(EngineMetrics::default()));

        assert!(scheduler.has_room());
        assert!(scheduler.offer(job(&tree)).is_ok());
        assert!(scheduler.offer(job(&tree)).is_ok());
        assert_eq!(scheduler.backlog_len(), 2);
        assert!(!scheduler.has_room());
        assert!(scheduler.offer(job(&tree)).is_err());
    }

    #[test]
    fn test_demotion_disables_buffering() {
        let config = EngineConfig::default()
            .with_workers(1)
            .with_queue(QueueStrategy::BoundedQueue { capacity: 4 });
        let scheduler = Scheduler::new(&config);
        let tree = TaskTree::new(Arc::new(EngineMetrics::default()));
        assert!(scheduler.offer(job(&tree)).is_ok());

        assert!(scheduler.demote());
        assert!(!scheduler.demote());
        assert!(scheduler.offer(job(&tree)).is_err());
        assert_eq!(scheduler.drain_backlog().len(), 1);
        assert_eq!(scheduler.backlog_dequeued(), 1);
    }

    #[test]
    fn test_blocked_guard_restores_running() {
        let scheduler = Scheduler::new(&EngineConfig::default().with_workers(2));
        {
            let _blocked = scheduler.blocked(Some(1));
            assert_eq!(scheduler.worker_state(1), WorkerState::Blocked);
        }
        assert_eq!(scheduler.worker_state(1), WorkerState::Running);
        let _noop = scheduler.blocked(None);
        assert_eq!(scheduler.worker_states(), vec![WorkerState::Running; 2]);
    }

    #[test]
    fn test_closed_scheduler_rejects() {
        let config = EngineConfig::default().with_queue(QueueStrategy::BoundedQueue { capacity: 4 });
        let scheduler = Scheduler::new(&config);
        let tree = TaskTree::new(Arc::new(EngineMetrics::default()));
        scheduler.close();
        assert!(scheduler.offer(job(&tree)).is_err());
    }
}
