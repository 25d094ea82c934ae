//! Stall watchdog for buffered admission.
//!
//! With a bounded backlog every worker can end up blocked on a task frozen
//! mid-flight while the tasks that would unblock them wait in the backlog.
//! The watchdog samples the pool periodically; once the backlog head has not
//! moved for `stall_polls` polls while every worker is blocked, it demotes
//! admission to synchronous handoff and drains the backlog. Drained tasks
//! stay queued and are executed by their spawners when they settle them.

use crate::speculation::{engine::Runtime, scheduler::Scheduler, types::WorkerState};
use crossbeam_channel::{Receiver, select, tick};
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum Poll {
    Healthy,
    /// Consecutive stalled samples so far
    Suspect(u32),
    /// Buffering was disabled and the backlog drained
    Intervened { drained: usize },
}

#[derive(Debug)]
pub(crate) struct Watchdog {
    stall_polls: u32,
    last_dequeued: u64,
    stalled: u32,
}

impl Watchdog {
    pub(crate) fn new(stall_polls: u32) -> Self {
        Self {
            stall_polls,
            last_dequeued: 0,
            stalled: 0,
        }
    }

    pub(crate) fn poll(&mut self, scheduler: &Scheduler) -> Poll {
        let dequeued = scheduler.backlog_dequeued();
        let head_moved = dequeued != self.last_dequeued;
        self.last_dequeued = dequeued;

        let all_blocked = scheduler
            .worker_states()
            .iter()
            .all(|state| *state == WorkerState::Blocked);
        if !scheduler.is_buffering() || scheduler.backlog_len() == 0 || head_moved || !all_blocked {
            self.stalled = 0;
            return Poll::Healthy;
        }

        self.stalled += 1;
        if self.stalled < self.stall_polls {
            debug!(
                target: "speculation",
                stalled_polls = self.stalled,
                backlog = scheduler.backlog_len(),
                "Backlog head unchanged with every worker blocked"
            );
            return Poll::Suspect(self.stalled);
        }

        scheduler.demote();
        let drained = scheduler.drain_backlog();
        self.last_dequeued = scheduler.backlog_dequeued();
        self.stalled = 0;
        warn!(
            target: "speculation",
            drained = drained.len(),
            tasks = ?drained,
            "Admission stalled, demoting to synchronous handoff"
        );
        Poll::Intervened {
            drained: drained.len(),
        }
    }
}

/// Poll the pool every `watchdog_interval` until `stop` disconnects.
pub(crate) fn watchdog_loop(runtime: Arc<Runtime>, stop: Receiver<()>) {
    let ticks = tick(runtime.config.watchdog_interval());
    let mut watchdog = Watchdog::new(runtime.config.stall_polls);
    loop {
        select! {
            recv(stop) -> _ => break,
            recv(ticks) -> _ => {
                if let Poll::Intervened { drained } = watchdog.poll(&runtime.scheduler) {
                    runtime.metrics.record_demotion(drained as u64);
                }
            }
        }
    }
    debug!(target: "speculation", "Watchdog exiting");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        config::{EngineConfig, QueueStrategy},
        metrics::EngineMetrics,
        speculation::{
            context::Ctx,
            task::{Task, TaskTree},
            types::TaskId,
        },
    };

    fn stalled_scheduler(jobs: usize) -> Scheduler {
        let config = EngineConfig::default()
            .with_workers(2)
            .with_queue(QueueStrategy::BoundedQueue { capacity: 8 });
        let scheduler = Scheduler::new(&config);
        let tree = TaskTree::new(Arc::new(EngineMetrics::default()));
        for _ in 0..jobs {
            let task = Arc::new(Task::<u32>::new(
                tree.next_id(),
                TaskId::ROOT,
                "stalled",
                1,
                Arc::new(|_: &mut Ctx| Ok(0)),
                false,
            ));
            assert!(scheduler.offer(task).is_ok());
        }
        scheduler.set_worker_state(0, WorkerState::Blocked);
        scheduler.set_worker_state(1, WorkerState::Blocked);
        scheduler
    }

    #[test]
    fn test_intervenes_after_stall_polls() {
        let scheduler = stalled_scheduler(3);
        let mut watchdog = Watchdog::new(3);

        assert_eq!(watchdog.poll(&scheduler), Poll::Suspect(1));
        assert_eq!(watchdog.poll(&scheduler), Poll::Suspect(2));
        assert_eq!(watchdog.poll(&scheduler), Poll::Intervened { drained: 3 });

        assert!(!scheduler.is_buffering());
        assert_eq!(scheduler.backlog_len(), 0);
        // Nothing left to drain: the pool reads as healthy again
        assert_eq!(watchdog.poll(&scheduler), Poll::Healthy);
    }

    #[test]
    fn test_running_worker_resets_suspicion() {
        let scheduler = stalled_scheduler(1);
        let mut watchdog = Watchdog::new(2);

        assert_eq!(watchdog.poll(&scheduler), Poll::Suspect(1));
        scheduler.set_worker_state(1, WorkerState::Running);
        assert_eq!(watchdog.poll(&scheduler), Poll::Healthy);
        scheduler.set_worker_state(1, WorkerState::Blocked);
        assert_eq!(watchdog.poll(&scheduler), Poll::Suspect(1));
        assert_eq!(watchdog.poll(&scheduler), Poll::Intervened { drained: 1 });
    }

    #[test]
    fn test_empty_backlog_is_healthy() {
        let scheduler = stalled_scheduler(0);
        let mut watchdog = Watchdog::new(1);
        assert_eq!(watchdog.poll(&scheduler), Poll::Healthy);
        assert!(scheduler.is_buffering());
    }
}
