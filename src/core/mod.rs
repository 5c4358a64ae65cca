//! Graph model and the records the scheduler persists.

pub mod clock;
pub mod context;
pub mod dag;
pub mod instance;
pub mod pool;
pub mod retry;
pub mod run;
pub mod schedule;
pub mod task;
pub mod types;
