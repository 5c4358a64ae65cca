//! DAG runs.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

use super::types::{DagId, RunId};

/// State of a DAG run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunState {
    /// Created, waiting for a free run slot.
    Queued,
    Running,
    Success,
    Failed,
}

impl RunState {
    /// Returns true for success and failed.
    pub fn is_terminal(&self) -> bool {
        matches!(self, RunState::Success | RunState::Failed)
    }

    /// The snake_case name.
    pub fn as_str(&self) -> &'static str {
        match self {
            RunState::Queued => "queued",
            RunState::Running => "running",
            RunState::Success => "success",
            RunState::Failed => "failed",
        }
    }
}

impl fmt::Display for RunState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// How a run was created.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunType {
    Manual,
    Scheduled,
}

/// One execution of a DAG for a logical date.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DagRun {
    pub dag_id: DagId,
    pub run_id: RunId,
    pub run_type: RunType,
    pub logical_date: DateTime<Utc>,
    pub data_interval_start: DateTime<Utc>,
    pub data_interval_end: DateTime<Utc>,
    pub state: RunState,
    pub created_at: DateTime<Utc>,
    pub start_date: Option<DateTime<Utc>>,
    pub end_date: Option<DateTime<Utc>>,
    /// Created on explicit request rather than by the schedule.
    pub external_trigger: bool,
    /// Created despite an existing run for the same logical date.
    pub forced: bool,
    pub note: Option<String>,
}

impl DagRun {
    /// Create a queued run.
    pub fn new(
        dag_id: DagId,
        run_id: RunId,
        run_type: RunType,
        logical_date: DateTime<Utc>,
        data_interval: (DateTime<Utc>, DateTime<Utc>),
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            dag_id,
            run_id,
            run_type,
            logical_date,
            data_interval_start: data_interval.0,
            data_interval_end: data_interval.1,
            state: RunState::Queued,
            created_at: now,
            start_date: None,
            end_date: None,
            external_trigger: run_type == RunType::Manual,
            forced: false,
            note: None,
        }
    }

    /// Return a copy moved to `state`, with timestamps maintained.
    pub fn with_state(&self, state: RunState, now: DateTime<Utc>) -> DagRun {
        let mut next = self.clone();
        next.state = state;
        match state {
            RunState::Running => next.start_date = Some(now),
            RunState::Success | RunState::Failed => {
                next.start_date.get_or_insert(now);
                next.end_date = Some(now);
            }
            RunState::Queued => {}
        }
        next
    }

    /// The data interval as a pair.
    pub fn data_interval(&self) -> (DateTime<Utc>, DateTime<Utc>) {
        (self.data_interval_start, self.data_interval_end)
    }
}
