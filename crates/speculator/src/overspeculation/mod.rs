//! Static fork-placement analysis.
//!
//! - [`cfg`]: Control-flow graph of a method body
//! - [`controller`]: Fork-site classification and the rewrite fixpoint

pub mod cfg;
pub mod controller;

pub use cfg::{Block, BlockId, Insn, MethodBody, SiteId, Terminator};
pub use controller::{ForkPlan, OverspeculationController, PlanStatus, PlanTable, RevertReason, Verdict};
