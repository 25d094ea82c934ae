//! Per-thread execution context.
//!
//! Every computation receives a `&mut Ctx`. The context knows which task it
//! executes for and whether that task is still speculative (it owns a live
//! [`Transaction`]) or already holds the commit token and works on the heap
//! directly.
//!
//! A context also owns the forks it spawned and has not settled yet. They
//! precede everything the context does after spawning them, so while any is
//! pending the context's writes are buffered behind the most recent one and
//! a read that misses that buffer settles the pending forks first.

use crate::{
    error::Fault,
    overspeculation::cfg::SiteId,
    speculation::{
        engine::Runtime,
        future::FutureHandle,
        heap::Heap,
        scheduler::{self, BlockedGuard},
        task::{Computation, TaskControl, panic_message},
        transaction::Transaction,
        types::{Location, ObjectId, TaskId, Value, ValueKind},
    },
};
use derive_more::Debug;
use std::{
    collections::{HashMap, VecDeque},
    panic::{AssertUnwindSafe, catch_unwind},
    sync::Arc,
};
use tracing::{debug, trace, warn};

/// An unsettled fork and the writes its spawner made after it, up to the
/// next fork.
struct PendingFork {
    task: Arc<dyn TaskControl>,
    writes: HashMap<Location, Value>,
}

#[derive(Debug)]
pub struct Ctx {
    #[debug(skip)]
    runtime: Arc<Runtime>,
    /// `None` when executing on behalf of the program-order root
    #[debug(skip)]
    task: Option<Arc<dyn TaskControl>>,
    /// Present while the task is still speculative
    txn: Option<Transaction>,
    /// Spawn order
    #[debug(skip)]
    pending: VecDeque<PendingFork>,
    worker: Option<usize>,
    depth: usize,
    /// Set once the task was aborted; every further operation fails
    doomed: bool,
}

impl Ctx {
    pub(crate) fn root(runtime: Arc<Runtime>) -> Self {
        Self {
            runtime,
            task: None,
            txn: None,
            pending: VecDeque::new(),
            worker: None,
            depth: 0,
            doomed: false,
        }
    }

    pub(crate) fn speculative(runtime: Arc<Runtime>, task: Arc<dyn TaskControl>, worker: usize) -> Self {
        Self {
            runtime,
            txn: Some(Transaction::new(task.id())),
            pending: VecDeque::new(),
            depth: task.depth(),
            task: Some(task),
            worker: Some(worker),
            doomed: false,
        }
    }

    pub fn task_id(&self) -> TaskId {
        self.task.as_ref().map_or(TaskId::ROOT, |task| task.id())
    }

    /// True while writes are buffered in a transaction that has not committed.
    pub fn is_speculative(&self) -> bool {
        self.txn.is_some()
    }

    /// Number of spawn edges between this task and the root.
    pub fn depth(&self) -> usize {
        self.depth
    }

    pub fn worker_id(&self) -> Option<usize> {
        self.worker
    }

    /// Forks spawned from this context that are not settled yet.
    pub fn pending_forks(&self) -> usize {
        self.pending.len()
    }

    pub fn read(&mut self, location: Location, kind: ValueKind) -> Result<Value, Fault> {
        self.check_live()?;
        self.runtime.heap.check(&location)?;
        let buffered = self.pending.back().map(|fork| fork.writes.get(&location).copied());
        match buffered {
            Some(Some(value)) => return Ok(value),
            // A pending fork may write the location
            Some(None) => self.settle_through(None)?,
            None => {}
        }
        let heap = &self.runtime.heap;
        let Some(txn) = self.txn.as_mut() else {
            return Ok(heap.load(&location, kind));
        };
        let live = heap.load(&location, kind);
        let value = txn.read(location, kind, live);
        if txn.read_set_len() >= self.runtime.config.max_read_set {
            trace!(
                target: "speculation",
                task_id = %txn.owner(),
                reads = txn.read_set_len(),
                "Read-set limit reached, attempting voluntary commit"
            );
            self.acquire_token()?;
        }
        Ok(value)
    }

    pub fn write(&mut self, location: Location, value: Value) -> Result<(), Fault> {
        self.check_live()?;
        self.runtime.heap.check(&location)?;
        if let Some(fork) = self.pending.back_mut() {
            fork.writes.insert(location, value);
            return Ok(());
        }
        match self.txn.as_mut() {
            Some(txn) => txn.write(location, value),
            None => self.runtime.heap.store(location, value),
        }
        Ok(())
    }

    pub fn read_field(&mut self, object: ObjectId, offset: u32, kind: ValueKind) -> Result<Value, Fault> {
        self.read(Location::field(object, offset), kind)
    }

    pub fn write_field(&mut self, object: ObjectId, offset: u32, value: Value) -> Result<(), Fault> {
        self.write(Location::field(object, offset), value)
    }

    pub fn read_element(&mut self, array: ObjectId, index: u32, kind: ValueKind) -> Result<Value, Fault> {
        self.read(Location::element(array, index), kind)
    }

    pub fn write_element(&mut self, array: ObjectId, index: u32, value: Value) -> Result<(), Fault> {
        self.write(Location::element(array, index), value)
    }

    /// Allocate a zero-initialized object. Allocation is not transactional:
    /// an aborted task leaves an unreachable object behind.
    pub fn alloc_object(&mut self, fields: u32) -> Result<ObjectId, Fault> {
        self.check_live()?;
        Ok(self.runtime.heap.alloc_object(fields))
    }

    pub fn alloc_array(&mut self, kind: ValueKind, len: u32) -> Result<ObjectId, Fault> {
        self.check_live()?;
        Ok(self.runtime.heap.alloc_array(kind, len))
    }

    pub fn array_len(&mut self, array: ObjectId) -> Result<u32, Fault> {
        self.check_live()?;
        match self.runtime.heap.shape(array) {
            Some(_) => self
                .runtime
                .heap
                .array_len(array)
                .ok_or_else(|| Fault::Fatal(format!("{} is not an array", array))),
            None => Err(Fault::DanglingReference(array)),
        }
    }

    /// Fork `computation`. In program order it runs here, before anything
    /// that follows the spawn. The returned handle yields its result at
    /// `get()`.
    pub fn spawn<T, F>(&mut self, label: &str, computation: F) -> FutureHandle<T>
    where
        T: Clone + Send + 'static,
        F: Fn(&mut Ctx) -> Result<T, Fault> + Send + Sync + 'static,
    {
        self.spawn_computation(label, Arc::new(computation))
    }

    /// Fork at an analyzed fork site. Sites rejected by the installed fork
    /// plan always run inline, before this returns.
    pub fn spawn_at<T, F>(&mut self, site: SiteId, label: &str, computation: F) -> FutureHandle<T>
    where
        T: Clone + Send + 'static,
        F: Fn(&mut Ctx) -> Result<T, Fault> + Send + Sync + 'static,
    {
        if !self.runtime.plans.allows(site) {
            self.runtime.metrics.record_inline();
            trace!(target: "speculation", site = %site, label = %label, "Fork site rejected by plan");
            let computation: Computation<T> = Arc::new(computation);
            return self.fork_inline(label, &computation);
        }
        self.spawn_computation(label, Arc::new(computation))
    }

    /// Fork the computation registered for `descriptor`.
    pub fn spawn_call(&mut self, descriptor: &str) -> Result<FutureHandle<Value>, Fault> {
        let computation = self
            .runtime
            .registry
            .resolve(descriptor)
            .ok_or_else(|| Fault::Fatal(format!("no computation registered for {descriptor}")))?;
        Ok(self.spawn_computation(descriptor, computation))
    }

    fn spawn_computation<T: Clone + Send + 'static>(
        &mut self,
        label: &str,
        computation: Computation<T>,
    ) -> FutureHandle<T> {
        if let Err(fault) = self.check_live() {
            return FutureHandle::resolved(Err(fault));
        }
        if self.depth >= self.runtime.config.max_depth {
            self.runtime.metrics.record_inline();
            return self.fork_inline(label, &computation);
        }
        // Nothing uncommitted precedes a fork spawned here
        let granted = self.pending.is_empty() && !self.is_speculative();
        match scheduler::try_spawn(&self.runtime, self.task_id(), self.depth + 1, label, granted, &computation) {
            Some(task) => {
                self.pending.push_back(PendingFork {
                    task: task.clone(),
                    writes: HashMap::new(),
                });
                FutureHandle::speculative(task)
            }
            None => self.fork_inline(label, &computation),
        }
    }

    fn fork_inline<T: Clone + Send + 'static>(&mut self, label: &str, computation: &Computation<T>) -> FutureHandle<T> {
        FutureHandle::resolved(self.run_inline(label, computation))
    }

    /// Run `computation` here, turning a panic into a user error.
    pub(crate) fn run_guarded<T>(&mut self, label: &str, computation: &Computation<T>) -> Result<T, Fault> {
        match catch_unwind(AssertUnwindSafe(|| computation(self))) {
            Ok(result) => result,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                warn!(
                    target: "speculation",
                    task_id = %self.task_id(),
                    label = %label,
                    panic = %message,
                    "Computation panicked"
                );
                Err(Fault::panicked(message))
            }
        }
    }

    /// Run a fork's computation on this thread as its final execution.
    pub(crate) fn run_inline<T>(&mut self, label: &str, computation: &Computation<T>) -> Result<T, Fault> {
        let result = self.run_guarded(label, computation);
        if matches!(result, Err(Fault::User(_))) {
            self.runtime.metrics.record_user_error();
        }
        result
    }

    /// Run a fork at the head of this context's queue. Everything queued
    /// behind it comes later in program order and stays out of sight until
    /// the fork and whatever it spawned are settled.
    pub(crate) fn run_detached<T>(&mut self, label: &str, computation: &Computation<T>) -> Result<T, Fault> {
        let later = std::mem::take(&mut self.pending);
        let result = self.run_inline(label, computation);
        let settled = self.settle_pending();
        let leftover = std::mem::replace(&mut self.pending, later);
        abandon(&self.runtime, leftover);
        settled.and(result)
    }

    /// Settle pending forks in spawn order, up to and including `until`,
    /// applying the writes buffered behind each. Settles everything when
    /// `until` is `None` or not pending here.
    pub(crate) fn settle_through(&mut self, until: impl Into<Option<TaskId>>) -> Result<(), Fault> {
        let until = until.into();
        self.acquire_token()?;
        while let Some(fork) = self.pending.pop_front() {
            let id = fork.task.id();
            if let Err(fault) = fork.task.settle(self) {
                self.pending.push_front(fork);
                return Err(fault);
            }
            self.runtime.tree.remove(id);
            for (location, value) in fork.writes {
                self.runtime.heap.store(location, value);
            }
            trace!(target: "speculation", task_id = %self.task_id(), settled = %id, "Fork settled");
            if until == Some(id) {
                break;
            }
        }
        Ok(())
    }

    pub(crate) fn settle_pending(&mut self) -> Result<(), Fault> {
        if self.pending.is_empty() {
            return Ok(());
        }
        self.settle_through(None)
    }

    /// Wait until everything before this point has committed, then commit
    /// this task's own transaction and settle its pending forks.
    pub fn commit_boundary(&mut self) -> Result<(), Fault> {
        self.settle_through(None)
    }

    /// Run `operation` directly against the heap, outside the transaction.
    ///
    /// Operations on the safe allow-list run right away. Any other operation
    /// first waits for the commit token and settles pending forks.
    pub fn non_transactional<R>(&mut self, operation: &str, f: impl FnOnce(&Heap) -> R) -> Result<R, Fault> {
        self.check_live()?;
        let deferred = self.is_speculative() || !self.pending.is_empty();
        if deferred && !self.runtime.safe_operations.is_safe(operation) {
            debug!(
                target: "speculation",
                task_id = %self.task_id(),
                operation = %operation,
                "Unsafe operation, waiting for commit token"
            );
            self.settle_through(None)?;
        }
        Ok(f(&self.runtime.heap))
    }

    /// Make sure this context holds the commit token and has nothing left to
    /// commit. A speculative task freezes until its consumer grants the
    /// token, then commits what it has executed so far.
    pub(crate) fn acquire_token(&mut self) -> Result<(), Fault> {
        self.check_live()?;
        if self.txn.is_none() {
            return Ok(());
        }
        let Some(task) = self.task.clone() else {
            return Ok(());
        };
        if !task.token_granted() {
            let waited = {
                let _blocked = self.blocked();
                task.wait_for_token()
            };
            if let Err(fault) = waited {
                self.doom();
                return Err(fault);
            }
        }
        self.commit_early()
    }

    fn check_live(&mut self) -> Result<(), Fault> {
        if self.doomed {
            return Err(Fault::Aborted);
        }
        let Some(task) = self.task.clone() else {
            return Ok(());
        };
        if task.abort_requested() {
            self.doom();
            return Err(Fault::Aborted);
        }
        if self.txn.is_some() && task.token_granted() {
            return self.commit_early();
        }
        Ok(())
    }

    fn commit_early(&mut self) -> Result<(), Fault> {
        let (Some(mut txn), Some(task)) = (self.txn.take(), self.task.clone()) else {
            return Ok(());
        };
        let validation = txn.commit(&self.runtime.heap);
        if validation.is_valid() {
            task.committed_early();
            self.runtime.metrics.record_early_commit();
            debug!(
                target: "speculation",
                task_id = %task.id(),
                label = %task.label(),
                "Committed mid-flight, continuing non-speculatively"
            );
            return Ok(());
        }

        self.runtime.metrics.record_validation_abort();
        warn!(
            target: "speculation",
            task_id = %task.id(),
            label = %task.label(),
            validation = ?validation,
            "Speculation invalidated: stale read at commit"
        );
        self.doom();
        self.runtime.tree.abort_spawned(task.id());
        task.invalidate();
        Err(Fault::Aborted)
    }

    fn doom(&mut self) {
        self.doomed = true;
        if let Some(mut txn) = self.txn.take() {
            txn.abort();
        }
    }

    pub(crate) fn blocked(&self) -> BlockedGuard<'_> {
        self.runtime.scheduler.blocked(self.worker)
    }

    pub(crate) fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    /// Split into the pending transaction and whether the task was aborted.
    pub(crate) fn into_parts(mut self) -> (Option<Transaction>, bool) {
        (self.txn.take(), self.doomed)
    }
}

impl Drop for Ctx {
    fn drop(&mut self) {
        abandon(&self.runtime, std::mem::take(&mut self.pending));
    }
}

/// Abort forks whose spawner will never settle them.
fn abandon(runtime: &Runtime, forks: VecDeque<PendingFork>) {
    let mut aborted = 0;
    for fork in forks {
        aborted += runtime.tree.abort(fork.task.id());
    }
    if aborted > 0 {
        debug!(target: "speculation", aborted = aborted, "Abandoned unsettled forks");
    }
}
