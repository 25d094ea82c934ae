use crate::error::Fault;
use parking_lot::{Condvar, Mutex};

/// Why a task produced no committed result.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortReason {
    /// The task's own read-set failed validation
    Invalidated,
    /// An ancestor failed validation or the handle was discarded
    Forced,
}

/// Final outcome of a speculative task.
#[derive(Debug, Clone)]
pub enum Outcome<T> {
    /// Committed value
    Value(T),
    /// Committed error, replayed at the consuming `get()`
    Error(Fault),
    /// Nothing committed; the consumer re-executes the computation itself
    Aborted(AbortReason),
}

impl<T> Outcome<T> {
    pub fn is_aborted(&self) -> bool {
        matches!(self, Outcome::Aborted(_))
    }
}

impl<T> From<Result<T, Fault>> for Outcome<T> {
    fn from(result: Result<T, Fault>) -> Self {
        match result {
            Ok(value) => Outcome::Value(value),
            Err(fault) => Outcome::Error(fault),
        }
    }
}

/// Write-once slot carrying a task's outcome to the task that consumes it.
#[derive(Debug)]
pub struct ResultChannel<T> {
    slot: Mutex<Option<Outcome<T>>>,
    ready: Condvar,
}

impl<T> Default for ResultChannel<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ResultChannel<T> {
    pub fn new() -> Self {
        Self {
            slot: Mutex::new(None),
            ready: Condvar::new(),
        }
    }

    /// Publish `outcome`. Returns false, leaving the channel unchanged, if an
    /// outcome was already set.
    pub fn set(&self, outcome: Outcome<T>) -> bool {
        let mut slot = self.slot.lock();
        if slot.is_some() {
            return false;
        }
        *slot = Some(outcome);
        self.ready.notify_all();
        true
    }

    pub fn is_set(&self) -> bool {
        self.slot.lock().is_some()
    }
}

impl<T: Clone> ResultChannel<T> {
    pub fn try_get(&self) -> Option<Outcome<T>> {
        self.slot.lock().clone()
    }

    /// Block until an outcome is published.
    pub fn wait(&self) -> Outcome<T> {
        let mut slot = self.slot.lock();
        loop {
            if let Some(outcome) = slot.as_ref() {
                return outcome.clone();
            }
            self.ready.wait(&mut slot);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::{sync::Arc, thread, time::Duration};

    #[test]
    fn test_write_once() {
        let channel = ResultChannel::new();
        assert!(channel.try_get().is_none());
        assert!(channel.set(Outcome::Value(1)));
        assert!(!channel.set(Outcome::Value(2)));
        assert!(!channel.set(Outcome::Aborted(AbortReason::Forced)));
        assert!(matches!(channel.try_get(), Some(Outcome::Value(1))));
        assert!(matches!(channel.wait(), Outcome::Value(1)));
    }

    #[test]
    fn test_wait_wakes_on_set() {
        let channel = Arc::new(ResultChannel::<u64>::new());
        let waiter = {
            let channel = Arc::clone(&channel);
            thread::spawn(move || channel.wait())
        };
        thread::sleep(Duration::from_millis(10));
        channel.set(Outcome::Aborted(AbortReason::Invalidated));
        assert!(matches!(
            waiter.join().unwrap(),
            Outcome::Aborted(AbortReason::Invalidated)
        ));
    }

    #[test]
    fn test_from_result() {
        let outcome: Outcome<u8> = Err(Fault::Fatal("x".into())).into();
        assert!(matches!(outcome, Outcome::Error(Fault::Fatal(_))));
        assert!(!outcome.is_aborted());
    }
}
