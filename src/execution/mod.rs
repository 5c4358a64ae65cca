//! Executor interface and the in-process reference backend.
//!
//! The scheduler hands each admitted task instance to an [`Executor`] as an
//! [`ExecutionCommand`] and later collects [`ExecutorEvent`]s with
//! [`Executor::drain_events`]. Neither call blocks on task execution.
//!
//! Every event carries the try number of the command that produced it, so
//! the scheduler can discard events from tries it no longer tracks.

mod command;
mod local;

pub use command::{CommandUnit, CommandUnitBuilder};
pub use local::LocalExecutor;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use crate::core::context::ExecutionContext;
use crate::core::task::ExecutionUnit;
use crate::core::types::TaskInstanceKey;

/// Everything an executor needs to run one try of one task instance.
#[derive(Clone)]
pub struct ExecutionCommand {
    pub key: TaskInstanceKey,
    /// The try this command starts.
    pub try_number: u32,
    pub unit: Arc<dyn ExecutionUnit>,
    /// Fully resolved arguments: static, partial, mapped slice and XCom.
    pub arguments: BTreeMap<String, Value>,
    pub logical_date: DateTime<Utc>,
    pub data_interval: (DateTime<Utc>, DateTime<Utc>),
    /// Enforced by the executor, not by the scheduler.
    pub execution_timeout: Option<Duration>,
}

impl ExecutionCommand {
    /// Build the context the unit executes with.
    pub fn context(&self) -> ExecutionContext {
        ExecutionContext::new(
            self.key.clone(),
            self.try_number,
            self.logical_date,
            self.data_interval,
            self.arguments.clone(),
        )
    }
}

impl fmt::Debug for ExecutionCommand {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ExecutionCommand")
            .field("key", &self.key)
            .field("try_number", &self.try_number)
            .field("unit", &self.unit.name())
            .field("arguments", &self.arguments)
            .field("execution_timeout", &self.execution_timeout)
            .finish()
    }
}

/// Answer to [`Executor::submit`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SubmitOutcome {
    Accepted,
    /// Not taken; the instance goes back to `scheduled`.
    Rejected(String),
}

/// Progress reported by an executor.
#[derive(Debug, Clone, PartialEq)]
pub enum ExecutorEvent {
    /// The try began executing.
    Started { key: TaskInstanceKey, try_number: u32 },

    /// The try is still alive.
    Heartbeat { key: TaskInstanceKey, try_number: u32 },

    /// The try finished successfully.
    Completed {
        key: TaskInstanceKey,
        try_number: u32,
        return_value: Option<Value>,
        /// Extra outputs pushed by the unit.
        outputs: BTreeMap<String, Value>,
    },

    /// The try failed.
    Failed {
        key: TaskInstanceKey,
        try_number: u32,
        reason: String,
        /// The failure may go away on retry.
        transient: bool,
    },
}

impl ExecutorEvent {
    /// The instance the event is about.
    pub fn key(&self) -> &TaskInstanceKey {
        match self {
            ExecutorEvent::Started { key, .. }
            | ExecutorEvent::Heartbeat { key, .. }
            | ExecutorEvent::Completed { key, .. }
            | ExecutorEvent::Failed { key, .. } => key,
        }
    }

    /// The try the event is about.
    pub fn try_number(&self) -> u32 {
        match self {
            ExecutorEvent::Started { try_number, .. }
            | ExecutorEvent::Heartbeat { try_number, .. }
            | ExecutorEvent::Completed { try_number, .. }
            | ExecutorEvent::Failed { try_number, .. } => *try_number,
        }
    }
}

/// A backend that runs task instances.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Accept or reject a command. Must not wait for the task to run.
    async fn submit(&self, command: ExecutionCommand) -> SubmitOutcome;

    /// Every event produced since the last call, in production order.
    fn drain_events(&self) -> Vec<ExecutorEvent>;

    /// Ask the backend to stop a running try. Advisory; returns true if
    /// something was cancelled.
    async fn cancel(&self, _key: &TaskInstanceKey) -> bool {
        false
    }
}
