//! Method-level speculative execution engine.
//!
//! See [`speculation`] for the runtime and [`overspeculation`] for the
//! analysis that decides which fork sites are worth forking.

pub mod config;
pub mod error;
pub mod metrics;
pub mod overspeculation;
pub mod registry;
pub mod speculation;

pub use config::{AnalysisConfig, EngineConfig, QueueStrategy};
pub use error::{AnalysisError, EngineError, EngineResult, Fault, PanicError, UserError};
pub use metrics::{EngineMetrics, SpeculationStats};
pub use registry::{CallSiteRegistry, ComputationFactory, SafeOperations};
pub use speculation::{Ctx, Engine, FutureHandle};
