//! Speculative tasks and the speculation tree.
//!
//! A [`Task`] is one forked computation. It occupies the program-order
//! position of its spawn: everything the spawner does afterwards comes after
//! it. The spawning context keeps its unsettled tasks in a queue and settles
//! them front to back, so the commit token always travels in spawn order. A
//! task spawned by a context that holds the token with nothing queued ahead
//! of it receives the token at spawn.
//!
//! # Task lifecycle
//!
//! ```text
//! Queued ──▶ Running ⇄ FrozenMidFlight
//!   │           │
//!   │           ├──▶ FrozenFinished ──▶ Done   (spawner runs the epilogue)
//!   │           └──▶ Done                     (token already granted)
//!   └──▶ Done                                 (stolen by the spawner or aborted)
//! ```
//!
//! # Tree
//!
//! [`TaskTree`] is an arena keyed by [`TaskId`]. Every task has a single
//! child slot. Spawning into an occupied slot pushes the previous child one
//! level down, where it becomes the new task's *inherited* child. The chain
//! below a task therefore holds its spawned descendants first and the
//! children inherited from its ancestors after them.

use crate::{
    error::Fault,
    metrics::EngineMetrics,
    speculation::{
        context::Ctx,
        engine::Runtime,
        result::{AbortReason, Outcome, ResultChannel},
        transaction::Transaction,
        types::{CommitState, TaskId, TaskStatus},
    },
};
use parking_lot::{Condvar, Mutex};
use std::{
    any::Any,
    collections::{HashMap, HashSet},
    sync::{
        Arc,
        atomic::{AtomicBool, AtomicU64, Ordering},
    },
};
use tracing::{debug, trace, warn};

#[cfg(test)]
use crate::speculation::types::ChildLink;

/// A deferred computation. Kept behind an `Arc` so it can be re-executed
/// inline after an abort.
pub type Computation<T> = Arc<dyn Fn(&mut Ctx) -> Result<T, Fault> + Send + Sync>;

/// Type-erased view of a task used by the tree, the pool and execution contexts.
pub(crate) trait TaskControl: Send + Sync {
    fn id(&self) -> TaskId;

    fn spawner(&self) -> TaskId;

    fn label(&self) -> &str;

    fn depth(&self) -> usize;

    fn token_granted(&self) -> bool;

    fn abort_requested(&self) -> bool;

    /// Freeze mid-flight until the commit token arrives. Fails with
    /// [`Fault::Aborted`] if the task is forced to abort while waiting.
    fn wait_for_token(&self) -> Result<(), Fault>;

    /// Record that the running computation committed its transaction.
    fn committed_early(&self);

    /// Publish a failed self-validation to the consumer.
    fn invalidate(&self);

    /// Abort this task alone. Returns false if it already finished or holds
    /// the commit token.
    fn force_abort(&self) -> bool;

    fn is_done(&self) -> bool;

    /// Bring the task to a final result at its program-order position.
    ///
    /// Called by the spawning context once every earlier fork is settled and
    /// the context holds the commit token. Errors are the caller's own
    /// ([`Fault::Aborted`] or a fatal fault); the task's result, user errors
    /// included, is kept for its handle.
    fn settle(&self, ctx: &mut Ctx) -> Result<(), Fault>;

    /// Run the computation on pool worker `worker`.
    fn execute(self: Arc<Self>, runtime: &Arc<Runtime>, worker: usize);
}

struct Finished<T> {
    txn: Transaction,
    result: Result<T, Fault>,
}

struct TaskState<T> {
    status: TaskStatus,
    commit: CommitState,
    /// Epilogue of a task frozen in the finished state
    finished: Option<Finished<T>>,
}

/// What the spawner has to do after inspecting a task it settles.
enum Join<T> {
    Steal,
    Wait,
    Epilogue(Finished<T>),
}

pub(crate) struct Task<T> {
    id: TaskId,
    spawner: TaskId,
    label: String,
    depth: usize,
    computation: Computation<T>,
    state: Mutex<TaskState<T>>,
    wake: Condvar,
    token: AtomicBool,
    abort: AtomicBool,
    channel: ResultChannel<T>,
    /// Final result once settled, handed out by every `get()`
    settled: Mutex<Option<Result<T, Fault>>>,
}

impl<T> Task<T> {
    pub(crate) fn id(&self) -> TaskId {
        self.id
    }

    #[cfg(test)]
    pub(crate) fn status(&self) -> TaskStatus {
        self.state.lock().status
    }

    #[cfg(test)]
    pub(crate) fn commit_state(&self) -> CommitState {
        self.state.lock().commit
    }
}

impl<T: Clone + Send + 'static> Task<T> {
    pub(crate) fn new(
        id: TaskId,
        spawner: TaskId,
        label: &str,
        depth: usize,
        computation: Computation<T>,
        granted: bool,
    ) -> Self {
        Self {
            id,
            spawner,
            label: label.to_string(),
            depth,
            computation,
            state: Mutex::new(TaskState {
                status: TaskStatus::Queued,
                commit: CommitState::Pending,
                finished: None,
            }),
            wake: Condvar::new(),
            token: AtomicBool::new(granted),
            abort: AtomicBool::new(false),
            channel: ResultChannel::new(),
            settled: Mutex::new(None),
        }
    }

    pub(crate) fn outcome(&self) -> Option<Outcome<T>> {
        self.channel.try_get()
    }

    pub(crate) fn settled(&self) -> Option<Result<T, Fault>> {
        self.settled.lock().clone()
    }

    pub(crate) fn is_settled(&self) -> bool {
        self.settled.lock().is_some()
    }

    fn keep(&self, result: Result<T, Fault>) -> Result<(), Fault> {
        if let Err(fault @ (Fault::Aborted | Fault::Fatal(_))) = &result {
            return Err(fault.clone());
        }
        *self.settled.lock() = Some(result);
        Ok(())
    }

    /// Validate, commit and publish a finished computation.
    fn complete(&self, runtime: &Runtime, mut txn: Transaction, result: Result<T, Fault>) -> Outcome<T> {
        let validation = txn.commit(&runtime.heap);
        let outcome = if validation.is_valid() {
            runtime.metrics.record_commit(result.is_err());
            self.state.lock().commit = CommitState::Committed;
            debug!(
                target: "speculation",
                task_id = %self.id,
                label = %self.label,
                user_error = result.is_err(),
                "Speculative task committed"
            );
            Outcome::from(result)
        } else {
            runtime.metrics.record_validation_abort();
            self.state.lock().commit = CommitState::Invalidated;
            warn!(
                target: "speculation",
                task_id = %self.id,
                label = %self.label,
                validation = ?validation,
                "Speculation invalidated: stale read at commit"
            );
            runtime.tree.abort_spawned(self.id);
            Outcome::Aborted(AbortReason::Invalidated)
        };
        self.state.lock().status = TaskStatus::Done;
        self.channel.set(outcome.clone());
        outcome
    }

    /// Hand the result of the computation over once it returned on a worker.
    fn finish(&self, runtime: &Runtime, ctx: Ctx, result: Result<T, Fault>) {
        let (txn, doomed) = ctx.into_parts();
        if doomed || self.abort_requested() {
            debug!(
                target: "speculation",
                task_id = %self.id,
                "Aborted task unwound"
            );
            return;
        }

        let Some(txn) = txn else {
            // Already committed mid-flight: the result is final.
            if result.is_err() {
                runtime.metrics.record_user_error();
            }
            self.state.lock().status = TaskStatus::Done;
            self.channel.set(Outcome::from(result));
            return;
        };

        let mut finished = Some(Finished { txn, result });
        {
            let mut state = self.state.lock();
            if self.abort_requested() {
                return;
            }
            if !self.token_granted() {
                state.status = TaskStatus::FrozenFinished;
                state.finished = finished.take();
            } else {
                state.status = TaskStatus::Done;
            }
        }

        match finished {
            Some(Finished { txn, result }) => {
                self.complete(runtime, txn, result);
            }
            None => trace!(
                target: "speculation",
                task_id = %self.id,
                "Task frozen in finished state"
            ),
        }
    }
}

impl<T: Clone + Send + 'static> TaskControl for Task<T> {
    fn id(&self) -> TaskId {
        self.id
    }

    fn spawner(&self) -> TaskId {
        self.spawner
    }

    fn label(&self) -> &str {
        &self.label
    }

    fn depth(&self) -> usize {
        self.depth
    }

    fn token_granted(&self) -> bool {
        self.token.load(Ordering::SeqCst)
    }

    fn abort_requested(&self) -> bool {
        self.abort.load(Ordering::SeqCst)
    }

    fn wait_for_token(&self) -> Result<(), Fault> {
        let mut state = self.state.lock();
        if !self.token_granted() && !self.abort_requested() {
            state.status = TaskStatus::FrozenMidFlight;
            trace!(target: "speculation", task_id = %self.id, "Frozen mid-flight");
        }
        while !self.token_granted() && !self.abort_requested() {
            self.wake.wait(&mut state);
        }
        if self.abort_requested() {
            return Err(Fault::Aborted);
        }
        state.status = TaskStatus::Running;
        Ok(())
    }

    fn committed_early(&self) {
        self.state.lock().commit = CommitState::Committed;
    }

    fn invalidate(&self) {
        self.state.lock().commit = CommitState::Invalidated;
        self.channel.set(Outcome::Aborted(AbortReason::Invalidated));
    }

    fn force_abort(&self) -> bool {
        {
            let mut state = self.state.lock();
            if state.status == TaskStatus::Done
                || state.commit != CommitState::Pending
                || self.token_granted()
            {
                return false;
            }
            self.abort.store(true, Ordering::SeqCst);
            state.commit = CommitState::ForcedAbort;
            state.finished = None;
            if matches!(state.status, TaskStatus::Queued | TaskStatus::FrozenFinished) {
                state.status = TaskStatus::Done;
            }
            self.wake.notify_all();
        }
        self.channel.set(Outcome::Aborted(AbortReason::Forced));
        true
    }

    fn is_done(&self) -> bool {
        self.state.lock().status == TaskStatus::Done
    }

    fn settle(&self, ctx: &mut Ctx) -> Result<(), Fault> {
        let join = {
            let mut state = self.state.lock();
            match state.status {
                TaskStatus::Queued => {
                    state.status = TaskStatus::Done;
                    Join::Steal
                }
                TaskStatus::Running | TaskStatus::FrozenMidFlight => {
                    self.token.store(true, Ordering::SeqCst);
                    self.wake.notify_all();
                    Join::Wait
                }
                TaskStatus::FrozenFinished => {
                    state.status = TaskStatus::Done;
                    match state.finished.take() {
                        Some(finished) => Join::Epilogue(finished),
                        None => Join::Wait,
                    }
                }
                TaskStatus::Done => Join::Wait,
            }
        };

        let outcome = match join {
            Join::Steal => {
                ctx.runtime().metrics.record_steal();
                debug!(
                    target: "speculation",
                    task_id = %self.id,
                    label = %self.label,
                    "Stealing queued task"
                );
                return self.keep(ctx.run_detached(&self.label, &self.computation));
            }
            Join::Wait => {
                let _blocked = ctx.blocked();
                self.channel.wait()
            }
            Join::Epilogue(Finished { txn, result }) => self.complete(ctx.runtime(), txn, result),
        };

        let result = match outcome {
            Outcome::Value(value) => Ok(value),
            Outcome::Error(fault) => Err(fault),
            Outcome::Aborted(reason) => {
                ctx.runtime().metrics.record_retry();
                debug!(
                    target: "speculation",
                    task_id = %self.id,
                    label = %self.label,
                    reason = ?reason,
                    "Re-executing aborted task at its spawn position"
                );
                ctx.run_detached(&self.label, &self.computation)
            }
        };
        self.keep(result)
    }

    fn execute(self: Arc<Self>, runtime: &Arc<Runtime>, worker: usize) {
        {
            let mut state = self.state.lock();
            if state.status != TaskStatus::Queued {
                // Stolen by its consumer or aborted while queued
                return;
            }
            state.status = TaskStatus::Running;
        }

        let span = tracing::info_span!(
            target: "speculation",
            "speculative_task",
            task_id = %self.id,
            label = %self.label,
            worker_id = worker
        );
        let _task_guard = span.entered();
        debug!(target: "speculation", task_id = %self.id, "Starting speculative task");

        let control: Arc<dyn TaskControl> = self.clone();
        let mut ctx = Ctx::speculative(Arc::clone(runtime), control, worker);
        let result = ctx.run_guarded(&self.label, &self.computation);
        // Forks the computation left unsettled are part of its effects
        let result = match ctx.settle_pending() {
            Ok(()) => result,
            Err(fault) => Err(fault),
        };
        self.finish(runtime, ctx, result);
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "non-string panic payload".to_string()
    }
}

struct Node {
    /// `None` for the root
    control: Option<Arc<dyn TaskControl>>,
    spawner: TaskId,
    /// Task whose child slot holds this node
    holder: Option<TaskId>,
    child: Option<TaskId>,
}

/// Arena of live tasks linked in program order.
pub(crate) struct TaskTree {
    nodes: Mutex<HashMap<TaskId, Node>>,
    next_id: AtomicU64,
    metrics: Arc<EngineMetrics>,
}

impl TaskTree {
    pub(crate) fn new(metrics: Arc<EngineMetrics>) -> Self {
        let mut nodes = HashMap::new();
        nodes.insert(
            TaskId::ROOT,
            Node {
                control: None,
                spawner: TaskId::ROOT,
                holder: None,
                child: None,
            },
        );
        Self {
            nodes: Mutex::new(nodes),
            next_id: AtomicU64::new(1),
            metrics,
        }
    }

    pub(crate) fn next_id(&self) -> TaskId {
        TaskId(self.next_id.fetch_add(1, Ordering::Relaxed))
    }

    /// Link `control` into its spawner's child slot. The previous occupant of
    /// the slot becomes the new task's inherited child. Fails if the spawner
    /// already left the tree.
    pub(crate) fn insert(&self, control: Arc<dyn TaskControl>) -> bool {
        let id = control.id();
        let spawner = control.spawner();
        let mut nodes = self.nodes.lock();
        let Some(parent) = nodes.get_mut(&spawner) else {
            return false;
        };
        let inherited = parent.child.replace(id);
        if let Some(inherited) = inherited {
            if let Some(node) = nodes.get_mut(&inherited) {
                node.holder = Some(id);
            }
        }
        nodes.insert(
            id,
            Node {
                control: Some(control),
                spawner,
                holder: Some(spawner),
                child: inherited,
            },
        );
        true
    }

    #[cfg(test)]
    pub(crate) fn contains(&self, id: TaskId) -> bool {
        self.nodes.lock().contains_key(&id)
    }

    pub(crate) fn len(&self) -> usize {
        self.nodes.lock().len()
    }

    /// Occupant of `id`'s child slot and how `id` relates to it.
    #[cfg(test)]
    pub(crate) fn child(&self, id: TaskId) -> Option<(TaskId, ChildLink)> {
        let nodes = self.nodes.lock();
        let child = nodes.get(&id)?.child?;
        let link = if nodes.get(&child)?.spawner == id {
            ChildLink::Spawned
        } else {
            ChildLink::Inherited
        };
        Some((child, link))
    }

    /// Unlink `id`, handing its child slot back to the task that held it.
    pub(crate) fn remove(&self, id: TaskId) {
        if id.is_root() {
            return;
        }
        Self::splice(&mut self.nodes.lock(), id);
    }

    fn splice(nodes: &mut HashMap<TaskId, Node>, id: TaskId) -> Option<Node> {
        let node = nodes.remove(&id)?;
        if let Some(holder) = node.holder.and_then(|holder| nodes.get_mut(&holder)) {
            holder.child = node.child;
        }
        if let Some(child) = node.child.and_then(|child| nodes.get_mut(&child)) {
            child.holder = node.holder;
        }
        Some(node)
    }

    /// Force-abort every task spawned by `id`, directly or transitively.
    /// Inherited children below `id` stay untouched.
    pub(crate) fn abort_spawned(&self, id: TaskId) -> usize {
        let mut nodes = self.nodes.lock();
        let mut aborting = HashSet::from([id]);
        self.cascade(&mut nodes, id, &mut aborting)
    }

    /// Force-abort `id` itself and everything it spawned.
    pub(crate) fn abort(&self, id: TaskId) -> usize {
        let mut nodes = self.nodes.lock();
        let Some(node) = nodes.get(&id) else {
            return 0;
        };
        let (aborted, done) = match node.control.clone() {
            Some(control) => (control.force_abort(), control.is_done()),
            None => (false, false),
        };
        if aborted {
            self.metrics.record_forced_aborts(1);
        }
        let mut aborting = HashSet::from([id]);
        let cascaded = self.cascade(&mut nodes, id, &mut aborting);
        // A task holding the token keeps running and stays linked
        if aborted || done {
            Self::splice(&mut nodes, id);
        }
        cascaded + usize::from(aborted)
    }

    fn cascade(
        &self,
        nodes: &mut HashMap<TaskId, Node>,
        from: TaskId,
        aborting: &mut HashSet<TaskId>,
    ) -> usize {
        let mut victims = Vec::new();
        let mut cursor = nodes.get(&from).and_then(|node| node.child);
        while let Some(id) = cursor {
            let Some(node) = nodes.get(&id) else {
                break;
            };
            cursor = node.child;
            if aborting.contains(&node.spawner) {
                aborting.insert(id);
                victims.push(id);
            }
        }

        let mut aborted = 0;
        for id in victims {
            if let Some(node) = Self::splice(nodes, id) {
                if node.control.is_some_and(|control| control.force_abort()) {
                    aborted += 1;
                }
            }
        }
        if aborted > 0 {
            self.metrics.record_forced_aborts(aborted as u64);
            debug!(
                target: "speculation",
                task_id = %from,
                aborted = aborted,
                "Cascaded forced abort to spawned children"
            );
        }
        aborted
    }

    /// Abort and unlink every remaining task.
    pub(crate) fn clear(&self) -> usize {
        let mut nodes = self.nodes.lock();
        let ids: Vec<TaskId> = nodes.keys().copied().filter(|id| !id.is_root()).collect();
        let mut aborted = 0;
        for id in ids {
            if let Some(node) = Self::splice(&mut nodes, id) {
                if node.control.is_some_and(|control| control.force_abort()) {
                    aborted += 1;
                }
            }
        }
        self.metrics.record_forced_aborts(aborted as u64);
        aborted
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn task(tree: &TaskTree, spawner: TaskId) -> Arc<Task<u32>> {
        let task = Arc::new(Task::new(
            tree.next_id(),
            spawner,
            "test",
            1,
            Arc::new(|_: &mut Ctx| Ok(0)),
            false,
        ));
        assert!(tree.insert(task.clone()));
        task
    }

    fn tree() -> TaskTree {
        TaskTree::new(Arc::new(EngineMetrics::default()))
    }

    #[test]
    fn test_spawn_into_occupied_slot_inherits_previous_child() {
        let tree = tree();
        let a = task(&tree, TaskId::ROOT);
        let b = task(&tree, TaskId::ROOT);

        assert_eq!(tree.child(TaskId::ROOT), Some((b.id, ChildLink::Spawned)));
        assert_eq!(tree.child(b.id), Some((a.id, ChildLink::Inherited)));
        assert_eq!(tree.child(a.id), None);
    }

    #[test]
    fn test_remove_hands_inherited_child_back_up() {
        let tree = tree();
        let a = task(&tree, TaskId::ROOT);
        let b = task(&tree, TaskId::ROOT);

        tree.remove(b.id);
        assert_eq!(tree.child(TaskId::ROOT), Some((a.id, ChildLink::Spawned)));
        assert!(!tree.contains(b.id));
        assert_eq!(tree.len(), 2);
    }

    #[test]
    fn test_abort_spares_inherited_child() {
        let tree = tree();
        let a = task(&tree, TaskId::ROOT);
        let b = task(&tree, TaskId::ROOT);
        let c = task(&tree, b.id);
        // Chain: root -> b -> c -> a, where a is inherited by b
        assert_eq!(tree.child(b.id), Some((c.id, ChildLink::Spawned)));

        assert_eq!(tree.abort(b.id), 2);
        assert_eq!(b.commit_state(), CommitState::ForcedAbort);
        assert_eq!(c.commit_state(), CommitState::ForcedAbort);
        assert!(matches!(c.outcome(), Some(Outcome::Aborted(AbortReason::Forced))));

        assert_eq!(a.commit_state(), CommitState::Pending);
        assert!(a.outcome().is_none());
        assert_eq!(tree.child(TaskId::ROOT), Some((a.id, ChildLink::Spawned)));
    }

    #[test]
    fn test_cascade_follows_grandchildren() {
        let tree = tree();
        let a = task(&tree, TaskId::ROOT);
        let b = task(&tree, a.id);
        let c = task(&tree, b.id);

        assert_eq!(tree.abort_spawned(a.id), 2);
        assert!(b.abort_requested());
        assert!(c.abort_requested());
        assert!(!a.abort_requested());
        assert_eq!(tree.child(a.id), None);
    }

    #[test]
    fn test_force_abort_is_refused_once_token_granted() {
        let tree = tree();
        let a = task(&tree, TaskId::ROOT);
        a.token.store(true, Ordering::SeqCst);
        assert!(!a.force_abort());
        assert_eq!(tree.abort(a.id), 0);
        assert!(tree.contains(a.id));

        // A refused abort leaves the inherited chain where it was
        let b = task(&tree, TaskId::ROOT);
        b.token.store(true, Ordering::SeqCst);
        assert_eq!(tree.abort(b.id), 0);
        assert_eq!(tree.child(TaskId::ROOT), Some((b.id, ChildLink::Spawned)));
        assert_eq!(tree.child(b.id), Some((a.id, ChildLink::Inherited)));
    }

    #[test]
    fn test_abort_unlinks_finished_task_without_counting_it() {
        let tree = tree();
        let a = task(&tree, TaskId::ROOT);
        let b = task(&tree, a.id);
        a.state.lock().status = TaskStatus::Done;

        assert_eq!(tree.abort(a.id), 1);
        assert!(b.abort_requested());
        assert!(!tree.contains(a.id));
        assert_eq!(tree.len(), 1);
    }

    #[test]
    fn test_queued_task_aborts_to_done() {
        let tree = tree();
        let a = task(&tree, TaskId::ROOT);
        assert_eq!(a.status(), TaskStatus::Queued);
        assert!(a.force_abort());
        assert_eq!(a.status(), TaskStatus::Done);
        assert!(!a.force_abort());
    }
}
