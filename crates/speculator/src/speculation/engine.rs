use crate::{
    config::EngineConfig,
    error::{EngineError, EngineResult, Fault},
    metrics::{EngineMetrics, SpeculationStats},
    overspeculation::controller::{ForkPlan, PlanTable},
    registry::{CallSiteRegistry, SafeOperations},
    speculation::{
        context::Ctx,
        heap::Heap,
        scheduler::{self, Scheduler},
        task::TaskTree,
        types::WorkerState,
        watchdog,
    },
};
use crossbeam_channel::{Sender, bounded};
use parking_lot::Mutex;
use std::{
    sync::Arc,
    thread::{self, JoinHandle},
    time::{Duration, Instant},
};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// How long `Engine::new` waits for workers to park before returning.
const STARTUP_GRACE: Duration = Duration::from_secs(1);

/// State shared by the engine, its workers and every execution context.
pub(crate) struct Runtime {
    pub(crate) config: EngineConfig,
    pub(crate) heap: Arc<Heap>,
    pub(crate) tree: Arc<TaskTree>,
    pub(crate) scheduler: Scheduler,
    pub(crate) metrics: Arc<EngineMetrics>,
    pub(crate) registry: CallSiteRegistry,
    pub(crate) safe_operations: SafeOperations,
    pub(crate) plans: PlanTable,
}

/// Speculative execution engine.
///
/// Owns the shared heap and a fixed worker pool. [`Engine::run`] executes a
/// program on the calling thread; forks the program makes with
/// [`Ctx::spawn`] run on the pool while the program continues, and commit
/// in spawn order ahead of the program's own later effects.
pub struct Engine {
    runtime: Arc<Runtime>,
    workers: Vec<JoinHandle<()>>,
    watchdog: Option<JoinHandle<()>>,
    /// Dropped at shutdown to wake the watchdog
    stop_watchdog: Option<Sender<()>>,
    cancel: CancellationToken,
    /// Only one program-order root may hold the commit token at a time
    run_lock: Mutex<()>,
    stopped: bool,
}

impl Engine {
    pub fn new(config: EngineConfig) -> EngineResult<Self> {
        config.validate()?;
        let metrics = Arc::new(EngineMetrics::default());
        let runtime = Arc::new(Runtime {
            scheduler: Scheduler::new(&config),
            heap: Arc::new(Heap::new()),
            tree: Arc::new(TaskTree::new(Arc::clone(&metrics))),
            metrics,
            registry: CallSiteRegistry::new(),
            safe_operations: SafeOperations::new(),
            plans: PlanTable::default(),
            config,
        });

        let mut engine = Self {
            runtime,
            workers: Vec::new(),
            watchdog: None,
            stop_watchdog: None,
            cancel: CancellationToken::new(),
            run_lock: Mutex::new(()),
            stopped: false,
        };
        if let Err(err) = engine.start() {
            engine.shutdown();
            return Err(err);
        }
        Ok(engine)
    }

    fn start(&mut self) -> EngineResult<()> {
        let worker_count = self.runtime.scheduler.worker_count();
        let (ready_tx, ready_rx) = bounded(worker_count);
        for worker_id in 0..worker_count {
            let runtime = Arc::clone(&self.runtime);
            let ready = ready_tx.clone();
            let handle = thread::Builder::new()
                .name(format!("speculation-worker-{worker_id}"))
                .spawn(move || scheduler::worker_loop(runtime, worker_id, ready))?;
            self.workers.push(handle);
        }
        drop(ready_tx);

        let runtime = Arc::clone(&self.runtime);
        let (stop_tx, stop_rx) = bounded(0);
        self.stop_watchdog = Some(stop_tx);
        self.watchdog = Some(
            thread::Builder::new()
                .name("speculation-watchdog".to_string())
                .spawn(move || watchdog::watchdog_loop(runtime, stop_rx))?,
        );

        let deadline = Instant::now() + STARTUP_GRACE;
        let parked = (0..worker_count)
            .take_while(|_| ready_rx.recv_deadline(deadline).is_ok())
            .count();
        if parked < worker_count {
            warn!(
                target: "speculation",
                parked = parked,
                workers = worker_count,
                "Not every worker parked before the startup deadline"
            );
        }

        info!(
            target: "speculation",
            workers = worker_count,
            queue = ?self.runtime.config.queue,
            max_depth = self.runtime.config.max_depth,
            "Speculation engine started"
        );
        Ok(())
    }

    /// Execute `program` as the program-order root.
    ///
    /// The result is exactly what sequential execution of `program` would
    /// have produced. Forks still unsettled when `program` returns are
    /// settled before `run` does. A fatal engine fault terminates the run.
    pub fn run<T, F>(&self, program: F) -> EngineResult<T>
    where
        F: FnOnce(&mut Ctx) -> Result<T, Fault>,
    {
        if self.cancel.is_cancelled() {
            return Err(EngineError::ShutDown);
        }
        let _root = self.run_lock.lock();
        let run_span = tracing::info_span!(target: "speculation", "speculative_run");
        let _run_guard = run_span.entered();

        let mut ctx = Ctx::root(Arc::clone(&self.runtime));
        let mut result = program(&mut ctx);
        if !result.as_ref().is_err_and(Fault::is_fatal) {
            if let Err(fault) = ctx.settle_pending() {
                result = Err(fault);
            }
        }
        drop(ctx);

        result.map_err(|fault| {
            if fault.is_fatal() {
                error!(target: "speculation", error = %fault, "Fatal error, terminating run");
            } else {
                debug!(target: "speculation", error = %fault, "Program failed");
            }
            EngineError::from(fault)
        })
    }

    pub fn heap(&self) -> &Arc<Heap> {
        &self.runtime.heap
    }

    pub fn config(&self) -> &EngineConfig {
        &self.runtime.config
    }

    pub fn registry(&self) -> &CallSiteRegistry {
        &self.runtime.registry
    }

    pub fn safe_operations(&self) -> &SafeOperations {
        &self.runtime.safe_operations
    }

    /// Apply the fork decisions of an analyzed method.
    pub fn install_plan(&self, plan: &ForkPlan) {
        self.runtime.plans.install(plan);
    }

    pub fn worker_count(&self) -> usize {
        self.runtime.scheduler.worker_count()
    }

    pub fn worker_states(&self) -> Vec<WorkerState> {
        self.runtime.scheduler.worker_states()
    }

    /// False once the watchdog demoted admission to synchronous handoff.
    pub fn is_buffering(&self) -> bool {
        self.runtime.scheduler.is_buffering()
    }

    pub fn backlog_len(&self) -> usize {
        self.runtime.scheduler.backlog_len()
    }

    /// Speculative tasks currently linked in the speculation tree.
    pub fn live_tasks(&self) -> usize {
        self.runtime.tree.len().saturating_sub(1)
    }

    pub fn stats(&self) -> SpeculationStats {
        self.runtime.metrics.snapshot()
    }

    #[cfg(test)]
    pub(crate) fn runtime(&self) -> &Arc<Runtime> {
        &self.runtime
    }

    /// Stop the pool and the watchdog and report the end-of-run counters.
    pub fn shutdown(&mut self) -> SpeculationStats {
        if !self.stopped {
            self.stopped = true;
            self.cancel.cancel();
            self.stop_watchdog.take();
            let abandoned = self.runtime.tree.clear();
            if abandoned > 0 {
                warn!(target: "speculation", abandoned = abandoned, "Aborted tasks left at shutdown");
            }
            self.runtime.scheduler.close();
            for handle in self.workers.drain(..) {
                if handle.join().is_err() {
                    error!(target: "speculation", "Worker thread panicked");
                }
            }
            if let Some(handle) = self.watchdog.take() {
                if handle.join().is_err() {
                    error!(target: "speculation", "Watchdog thread panicked");
                }
            }

            let stats = self.stats();
            info!(
                target: "speculation",
                spawned = stats.spawned,
                committed = stats.committed,
                validation_aborts = stats.validation_aborts,
                forced_aborts = stats.forced_aborts,
                user_errors = stats.user_errors,
                inline_admissions = stats.inline_admissions,
                queue_rejections = stats.queue_rejections,
                steals = stats.steals,
                early_commits = stats.early_commits,
                retries = stats.retries,
                watchdog_demotions = stats.watchdog_demotions,
                "Speculation engine shut down"
            );
        }
        self.stats()
    }
}

impl Drop for Engine {
    fn drop(&mut self) {
        self.shutdown();
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("workers", &self.runtime.scheduler.worker_count())
            .field("queue", &self.runtime.config.queue)
            .field("stopped", &self.stopped)
            .finish()
    }
}
