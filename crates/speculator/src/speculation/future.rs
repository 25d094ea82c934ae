use crate::{
    error::Fault,
    speculation::{
        context::Ctx,
        result::Outcome,
        task::Task,
        types::TaskId,
    },
};
use std::{marker::PhantomData, rc::Rc, sync::Arc};

enum HandleState<T> {
    Speculative(Arc<Task<T>>),
    Resolved(Result<T, Fault>),
}

/// Handle on the result of a forked computation.
///
/// Both variants honor the same contract: `get()` returns what the
/// computation produced at its spawn position in sequential order, and every
/// later `get()` returns that same outcome without recomputation. A fork that
/// ran inline is resolved before `spawn` returns. A handle stays with the
/// context that created it; dropping it unconsumed does not undo the fork,
/// whose effects are settled with the rest of the spawner's forks.
pub struct FutureHandle<T> {
    state: HandleState<T>,
    _not_send: PhantomData<Rc<()>>,
}

impl<T: Clone + Send + 'static> FutureHandle<T> {
    pub(crate) fn speculative(task: Arc<Task<T>>) -> Self {
        Self {
            state: HandleState::Speculative(task),
            _not_send: PhantomData,
        }
    }

    pub(crate) fn resolved(result: Result<T, Fault>) -> Self {
        Self {
            state: HandleState::Resolved(result),
            _not_send: PhantomData,
        }
    }

    /// True if the computation was handed to the worker pool.
    pub fn is_speculative(&self) -> bool {
        matches!(self.state, HandleState::Speculative(_))
    }

    pub fn is_resolved(&self) -> bool {
        matches!(self.state, HandleState::Resolved(_))
    }

    /// True once a result is available without waiting.
    pub fn is_ready(&self) -> bool {
        match &self.state {
            HandleState::Speculative(task) => task.is_settled() || task.outcome().is_some(),
            HandleState::Resolved(_) => true,
        }
    }

    pub fn task_id(&self) -> Option<TaskId> {
        match &self.state {
            HandleState::Speculative(task) => Some(task.id()),
            HandleState::Resolved(_) => None,
        }
    }

    /// The result of the fork.
    ///
    /// Settles the spawner's forks up to and including this one first. A
    /// captured error is returned exactly as sequential execution would have
    /// raised it. [`Fault::Aborted`] means the *caller* was aborted and must
    /// unwind; it is never memoized.
    pub fn get(&mut self, ctx: &mut Ctx) -> Result<T, Fault> {
        let task = match &self.state {
            HandleState::Resolved(result) => return result.clone(),
            HandleState::Speculative(task) => Arc::clone(task),
        };

        if task.id() == ctx.task_id() {
            // Awaiting oneself: hand back what was published, never block
            return match task.outcome() {
                Some(Outcome::Value(value)) => Ok(value),
                Some(Outcome::Error(fault)) => Err(fault),
                Some(Outcome::Aborted(_)) | None => Err(Fault::Aborted),
            };
        }

        let result = match task.settled() {
            Some(result) => result,
            None => {
                ctx.settle_through(task.id())?;
                task.settled().unwrap_or_else(|| {
                    Err(Fault::Fatal(format!("{} was not settled by its spawner", task.id())))
                })
            }
        };
        self.state = HandleState::Resolved(result.clone());
        result
    }
}
