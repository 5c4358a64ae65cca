//! Core identifier types for the orchestrator.
//!
//! These types provide type-safe identifiers for DAGs, tasks, runs and task
//! instances.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Unique identifier for a task within a DAG.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TaskId(String);

/// Unique identifier for a DAG run, unique within its DAG.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct RunId(String);

/// Unique identifier for a DAG.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DagId(String);

impl TaskId {
    /// Create a new TaskId from a string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the underlying string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for TaskId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for TaskId {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl RunId {
    /// Create a RunId from an explicit string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Run id for a manually triggered run, e.g. `manual__2024-01-01T00:00:00+00:00`.
    pub fn manual(logical_date: DateTime<Utc>) -> Self {
        Self(format!("manual__{}", logical_date.to_rfc3339()))
    }

    /// Run id for a run created from the DAG's schedule.
    pub fn scheduled(logical_date: DateTime<Utc>) -> Self {
        Self(format!("scheduled__{}", logical_date.to_rfc3339()))
    }

    /// Append a random suffix, used when a run is forced onto an existing logical date.
    pub fn with_unique_suffix(self) -> Self {
        let suffix = Uuid::new_v4().simple().to_string();
        Self(format!("{}__{}", self.0, &suffix[..8]))
    }

    /// Get the underlying string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for RunId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for RunId {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl DagId {
    /// Create a new DagId from a string.
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    /// Get the underlying string value.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl From<&str> for DagId {
    fn from(s: &str) -> Self {
        Self::new(s)
    }
}

impl From<String> for DagId {
    fn from(s: String) -> Self {
        Self::new(s)
    }
}

impl fmt::Display for TaskId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for RunId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl fmt::Display for DagId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Identity of a single task instance: one task, in one run, at one map index.
///
/// `map_index` is `None` for unmapped tasks (and for the placeholder recorded
/// when a mapped task cannot expand because its upstream failed).
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TaskInstanceKey {
    pub dag_id: DagId,
    pub run_id: RunId,
    pub task_id: TaskId,
    pub map_index: Option<usize>,
}

impl TaskInstanceKey {
    /// Key of an unmapped task instance.
    pub fn new(dag_id: DagId, run_id: RunId, task_id: TaskId) -> Self {
        Self {
            dag_id,
            run_id,
            task_id,
            map_index: None,
        }
    }

    /// Key of one expanded instance of a mapped task.
    pub fn mapped(dag_id: DagId, run_id: RunId, task_id: TaskId, map_index: usize) -> Self {
        Self {
            dag_id,
            run_id,
            task_id,
            map_index: Some(map_index),
        }
    }

    /// Returns true if both keys belong to the same DAG run.
    pub fn same_run(&self, dag_id: &DagId, run_id: &RunId) -> bool {
        &self.dag_id == dag_id && &self.run_id == run_id
    }
}

impl fmt::Display for TaskInstanceKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.map_index {
            Some(index) => write!(f, "{}/{}/{}[{}]", self.dag_id, self.run_id, self.task_id, index),
            None => write!(f, "{}/{}/{}", self.dag_id, self.run_id, self.task_id),
        }
    }
}
