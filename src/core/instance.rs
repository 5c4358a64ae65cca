//! Task instances and their state machine.
//!
//! A task instance is one execution slot of a task within a DAG run (one per
//! map index for mapped tasks). Every change goes through
//! [`TaskInstance::transition`], which rejects edges the state machine does
//! not allow, and is persisted with a compare-and-set on the previous
//! [`Expectation`].

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::fmt;
use thiserror::Error;

use super::types::TaskInstanceKey;

/// State of a task instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskInstanceState {
    /// Created, dependencies not yet met.
    None,
    /// Dependencies met, waiting for a pool slot.
    Scheduled,
    /// Admitted and handed to the executor.
    Queued,
    /// The executor reported that the try started.
    Running,
    Success,
    Failed,
    /// Failed with retries left, waiting for the retry delay.
    UpForRetry,
    Skipped,
    UpstreamFailed,
    /// Taken out of the run; late events are discarded.
    Removed,
}

impl TaskInstanceState {
    /// All states, in lifecycle order.
    pub const ALL: [TaskInstanceState; 10] = [
        TaskInstanceState::None,
        TaskInstanceState::Scheduled,
        TaskInstanceState::Queued,
        TaskInstanceState::Running,
        TaskInstanceState::Success,
        TaskInstanceState::Failed,
        TaskInstanceState::UpForRetry,
        TaskInstanceState::Skipped,
        TaskInstanceState::UpstreamFailed,
        TaskInstanceState::Removed,
    ];

    /// Terminal states never change again.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            TaskInstanceState::Success
                | TaskInstanceState::Failed
                | TaskInstanceState::Skipped
                | TaskInstanceState::UpstreamFailed
                | TaskInstanceState::Removed
        )
    }

    /// States that occupy pool slots and count against concurrency limits.
    pub fn is_active(&self) -> bool {
        matches!(self, TaskInstanceState::Queued | TaskInstanceState::Running)
    }

    /// Returns true if the state machine allows moving to `next`.
    pub fn can_transition_to(&self, next: TaskInstanceState) -> bool {
        use TaskInstanceState::*;

        if next == Removed {
            return !self.is_terminal();
        }
        match self {
            None => matches!(next, Scheduled | Skipped | UpstreamFailed),
            Scheduled => matches!(next, Queued),
            // An executor may report completion without a separate start event.
            Queued => matches!(next, Running | Scheduled | Success | Failed | UpForRetry),
            Running => matches!(next, Success | Failed | UpForRetry),
            UpForRetry => matches!(next, Scheduled),
            Success | Failed | Skipped | UpstreamFailed | Removed => false,
        }
    }

    /// The snake_case name.
    pub fn as_str(&self) -> &'static str {
        match self {
            TaskInstanceState::None => "none",
            TaskInstanceState::Scheduled => "scheduled",
            TaskInstanceState::Queued => "queued",
            TaskInstanceState::Running => "running",
            TaskInstanceState::Success => "success",
            TaskInstanceState::Failed => "failed",
            TaskInstanceState::UpForRetry => "up_for_retry",
            TaskInstanceState::Skipped => "skipped",
            TaskInstanceState::UpstreamFailed => "upstream_failed",
            TaskInstanceState::Removed => "removed",
        }
    }
}

impl fmt::Display for TaskInstanceState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Rejected state change.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("illegal transition for {key}: {from} -> {to}")]
pub struct InvalidTransition {
    pub key: TaskInstanceKey,
    pub from: TaskInstanceState,
    pub to: TaskInstanceState,
}

/// What a compare-and-set expects to find in storage.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Expectation {
    pub state: TaskInstanceState,
    pub try_number: u32,
}

/// Persisted record of one task instance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskInstance {
    pub key: TaskInstanceKey,
    pub state: TaskInstanceState,
    /// Number of tries started so far.
    pub try_number: u32,
    pub max_retries: u32,
    pub pool: String,
    pub pool_slots: u32,
    /// Declaration order of the task, used to break admission ties.
    pub task_order: usize,
    /// Logical date of the owning run, used to break admission ties.
    pub logical_date: DateTime<Utc>,
    /// Slice of mapped arguments for this map index.
    pub map_arguments: BTreeMap<String, Value>,
    pub queued_at: Option<DateTime<Utc>>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    pub last_heartbeat: Option<DateTime<Utc>>,
    pub next_retry_at: Option<DateTime<Utc>>,
    pub failure_reason: Option<String>,
}

impl TaskInstance {
    /// Create a fresh instance in state `none`.
    pub fn new(key: TaskInstanceKey, logical_date: DateTime<Utc>) -> Self {
        Self {
            key,
            state: TaskInstanceState::None,
            try_number: 0,
            max_retries: 0,
            pool: crate::core::pool::DEFAULT_POOL.to_string(),
            pool_slots: 1,
            task_order: 0,
            logical_date,
            map_arguments: BTreeMap::new(),
            queued_at: None,
            start_date: None,
            end_date: None,
            last_heartbeat: None,
            next_retry_at: None,
            failure_reason: None,
        }
    }

    /// Builder: pool and slot weight.
    pub fn with_pool(mut self, pool: impl Into<String>, slots: u32) -> Self {
        self.pool = pool.into();
        self.pool_slots = slots;
        self
    }

    /// Builder: retries allowed after the first try.
    pub fn with_max_retries(mut self, max_retries: u32) -> Self {
        self.max_retries = max_retries;
        self
    }

    /// Builder: declaration order of the task.
    pub fn with_task_order(mut self, order: usize) -> Self {
        self.task_order = order;
        self
    }

    /// Builder: mapped argument slice.
    pub fn with_map_arguments(mut self, arguments: BTreeMap<String, Value>) -> Self {
        self.map_arguments = arguments;
        self
    }

    /// Builder: create directly in `state`, used for expansion placeholders.
    pub fn with_state(mut self, state: TaskInstanceState, now: DateTime<Utc>) -> Self {
        self.state = state;
        if state.is_terminal() {
            self.end_date = Some(now);
        }
        self
    }

    /// The compare-and-set expectation matching this record.
    pub fn expectation(&self) -> Expectation {
        Expectation {
            state: self.state,
            try_number: self.try_number,
        }
    }

    /// Return a copy moved to `to`, with timestamps maintained.
    pub fn transition(
        &self,
        to: TaskInstanceState,
        now: DateTime<Utc>,
    ) -> Result<TaskInstance, InvalidTransition> {
        if !self.state.can_transition_to(to) {
            return Err(InvalidTransition {
                key: self.key.clone(),
                from: self.state,
                to,
            });
        }

        let mut next = self.clone();
        next.state = to;
        match to {
            TaskInstanceState::Scheduled => {
                next.next_retry_at = None;
                next.queued_at = None;
            }
            TaskInstanceState::Queued => {
                next.queued_at = Some(now);
            }
            TaskInstanceState::Running => {
                next.try_number += 1;
                next.start_date = Some(now);
                next.end_date = None;
                next.last_heartbeat = Some(now);
                next.failure_reason = None;
            }
            TaskInstanceState::UpForRetry => {
                next.end_date = Some(now);
            }
            _ if to.is_terminal() => {
                next.end_date = Some(now);
            }
            _ => {}
        }
        Ok(next)
    }
}
