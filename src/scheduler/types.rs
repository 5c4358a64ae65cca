//! Scheduler type definitions.
//!
//! This module contains error types, configuration, state enums, pass
//! summaries and command types for the scheduler.

use chrono::{DateTime, Utc};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::oneshot;

use super::runs::CreateRunRequest;
use crate::core::run::DagRun;
use crate::core::schedule::ScheduleError;
use crate::core::types::{DagId, RunId, TaskInstanceKey};
use crate::storage::StorageError;

/// Errors that can occur in the scheduler.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// DAG not registered.
    #[error("dag not found: {0}")]
    DagNotFound(DagId),

    /// A run already exists for the logical date.
    #[error("dag '{dag_id}' already has a run for {logical_date}")]
    DuplicateRun {
        dag_id: DagId,
        logical_date: DateTime<Utc>,
    },

    /// The run already reached a terminal state.
    #[error("run {dag_id}/{run_id} already finished")]
    RunFinished { dag_id: DagId, run_id: RunId },

    /// A concurrent writer changed the record first.
    #[error("conflict: {0}")]
    Conflict(String),

    /// Storage error.
    #[error("storage error: {0}")]
    Storage(#[from] StorageError),

    /// Schedule evaluation error.
    #[error("schedule error: {0}")]
    Schedule(#[from] ScheduleError),

    /// Channel error.
    #[error("channel error: {0}")]
    ChannelError(String),
}

/// State of the scheduler.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SchedulerState {
    /// Scheduler is stopped.
    Stopped,
    /// Scheduler is running.
    Running,
    /// Scheduler is paused: no passes, no scheduled runs.
    Paused,
}

/// Scheduler timing knobs.
#[derive(Debug, Clone, PartialEq)]
pub struct SchedulerConfig {
    /// Time between passes when started with [`Scheduler::start`](super::Scheduler::start).
    pub tick_interval: Duration,
    /// A running instance without a heartbeat for this long is a zombie.
    pub zombie_threshold: Duration,
    /// Queued instances older than this go back to `scheduled`.
    pub queued_timeout: Option<Duration>,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            tick_interval: Duration::from_secs(1),
            zombie_threshold: Duration::from_secs(300),
            queued_timeout: Some(Duration::from_secs(600)),
        }
    }
}

/// What one pass did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PassSummary {
    pub runs_promoted: usize,
    pub expanded: usize,
    pub scheduled: usize,
    pub skipped: usize,
    pub upstream_failed: usize,
    pub retries_woken: usize,
    pub admitted: usize,
    pub dispatched: usize,
    pub rejected: usize,
    pub events_applied: usize,
    pub events_discarded: usize,
    pub zombies: usize,
    pub requeued: usize,
    pub runs_finished: usize,
    /// Storage or executor failures that were logged and skipped.
    pub errors: usize,
}

impl PassSummary {
    /// True if the pass changed any state.
    pub fn made_progress(&self) -> bool {
        self.runs_promoted
            + self.expanded
            + self.scheduled
            + self.skipped
            + self.upstream_failed
            + self.retries_woken
            + self.admitted
            + self.rejected
            + self.events_applied
            + self.zombies
            + self.requeued
            + self.runs_finished
            > 0
    }
}

/// Commands that can be sent to the scheduler.
pub(crate) enum SchedulerCommand {
    /// Create a run.
    Trigger {
        dag_id: DagId,
        request: Option<CreateRunRequest>,
        response: oneshot::Sender<Result<DagRun, SchedulerError>>,
    },
    /// Fail a run and remove its unfinished instances.
    MarkRunFailed {
        dag_id: DagId,
        run_id: RunId,
        reason: Option<String>,
        response: oneshot::Sender<Result<(), SchedulerError>>,
    },
    /// Remove one task instance.
    MarkRemoved {
        key: TaskInstanceKey,
        response: oneshot::Sender<Result<bool, SchedulerError>>,
    },
    /// Pause the scheduler.
    Pause { response: oneshot::Sender<()> },
    /// Resume the scheduler.
    Resume { response: oneshot::Sender<()> },
    /// Shutdown the scheduler.
    Shutdown { response: oneshot::Sender<()> },
}
