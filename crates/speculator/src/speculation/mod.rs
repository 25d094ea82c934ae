//! Speculation: method-level speculative execution over a transactional heap
//!
//! Forked computations run ahead on a fixed worker pool while the program
//! continues past the spawn. Sequentially a fork runs at its spawn, so the
//! spawner's continuation comes after it and is kept deferred until the fork
//! commits:
//!
//! 1. `spawn` hands the computation to the pool, or runs it inline before returning if the pool is saturated
//! 2. The task records its reads and buffers its writes in an optimistic transaction
//! 3. The spawner buffers its own writes behind the pending fork; reading shared state, `get`, or a commit
//!    boundary settles the pending forks in spawn order
//! 4. Settling passes the commit token to the task, which validates its read-set against the live heap and
//!    publishes its writes; the spawner's buffered writes follow
//! 5. A stale read aborts the task, cascades the abort to what it spawned, and re-executes the computation at
//!    its spawn position
//!
//! # Architecture
//!
//! - [`types`]: Task ids and states, heap locations and values
//! - [`heap`]: Shared heap holding committed values
//! - [`access`]: A single recorded read or write
//! - [`transaction`]: Read-set/write-set tracking and commit
//! - [`result`]: Write-once result channel
//! - [`task`]: Speculative tasks and the speculation tree
//! - [`future`]: Handle returned by `spawn`
//! - [`context`]: Per-thread execution context
//! - [`scheduler`]: Worker pool and admission control
//! - [`watchdog`]: Stall detection for buffered admission
//! - [`engine`]: Engine façade

pub mod access;
pub mod context;
pub mod engine;
pub mod future;
pub mod heap;
pub mod result;
pub(crate) mod scheduler;
pub mod task;
pub mod transaction;
pub mod types;
pub(crate) mod watchdog;


pub use access::MemoryAccessRecord;
pub use context::Ctx;
pub use engine::Engine;
pub use future::FutureHandle;
pub use heap::{Heap, Shape};
pub use result::{AbortReason, Outcome, ResultChannel};
pub use task::Computation;
pub use transaction::{Transaction, TxnState, ValidationResult};
pub use types::{
    ChildLink, CommitState, Location, ObjectId, TaskId, TaskStatus, Value, ValueKind, WorkerState,
};
