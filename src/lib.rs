//! tributary - a DAG workflow scheduler with dynamic task mapping.
//!
//! DAGs are declared in code through [`DagBuilder`] or loaded from YAML with
//! [`load_dags_from_directory`]. A [`Scheduler`] creates runs, decides which
//! task instances may run, expands mapped tasks at run time and hands work
//! to an [`Executor`]. Task results travel between tasks as XCom values.

pub mod config;
pub mod core;
pub mod events;
pub mod execution;
pub mod scheduler;
pub mod storage;
pub mod testing;
pub mod xcom;

pub use config::{ConfigError, DagConfigBuilder, TributaryConfig, YamlLoader, load_dags_from_directory};
pub use core::clock::{Clock, SystemClock};
pub use core::context::{ContextError, ExecutionContext};
pub use core::dag::{
    ArgValue, Dag, DagBuilder, DagError, MapSource, TaskDefinition, TriggerRule, XComArg,
};
pub use core::instance::{TaskInstance, TaskInstanceState};
pub use core::pool::{DEFAULT_POOL, Pool, PoolRegistry};
pub use core::retry::{RetryCondition, RetryPolicy};
pub use core::run::{DagRun, RunState, RunType};
pub use core::schedule::{Schedule, ScheduleError};
pub use core::task::{ExecutionUnit, FnUnit, Signature, TaskError};
pub use core::types::{DagId, RunId, TaskId, TaskInstanceKey};
pub use events::{Event, EventBus, EventHandler, TracingHandler};
pub use execution::{
    CommandUnit, ExecutionCommand, Executor, ExecutorEvent, LocalExecutor, SubmitOutcome,
};
pub use scheduler::{
    CreateRunRequest, PassSummary, Scheduler, SchedulerConfig, SchedulerError, SchedulerHandle,
    SchedulerState,
};
pub use storage::{InMemoryStorage, Storage, StorageError};
pub use xcom::{RETURN_VALUE_KEY, XComError, XComKey, XComStore};
