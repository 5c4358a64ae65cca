//! Scheduler: dependency evaluation, mapping expansion, run lifecycle and
//! the pass loop that ties them together.
//!
//! [`Scheduler::run_pass`] can be driven directly (tests, one-shot CLI
//! runs) or periodically through [`Scheduler::start`].

pub mod deps;
mod engine;
pub mod expand;
mod handle;
mod runs;
mod types;
pub mod view;

pub use deps::{DepDecision, UpstreamSummary};
pub use engine::Scheduler;
pub use expand::ExpansionResult;
pub use handle::SchedulerHandle;
pub use runs::{CreateRunRequest, RunManager, aggregate_state};
pub use types::{PassSummary, SchedulerConfig, SchedulerError, SchedulerState};
pub use view::RunView;
