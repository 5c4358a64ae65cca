//! Storage abstraction for runs, task instances, expansions and XCom.
//!
//! The storage is the single source of truth shared by every scheduler pass.
//! Operations that must not interleave (run creation, compare-and-set,
//! admission, success commits, expansion) are single trait methods so a
//! backend can implement each one as one transaction.

mod memory;

pub use memory::InMemoryStorage;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::core::instance::{Expectation, TaskInstance, TaskInstanceState};
use crate::core::pool::Pool;
use crate::core::run::{DagRun, RunState};
use crate::core::types::{DagId, RunId, TaskId, TaskInstanceKey};
use crate::xcom::{XComEntry, XComKey};

/// Errors that can occur during storage operations.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The requested item was not found.
    #[error("not found: {0}")]
    NotFound(String),

    /// A duplicate key was detected.
    #[error("duplicate key: {0}")]
    DuplicateKey(String),

    /// Storage lock was poisoned.
    #[error("storage lock poisoned")]
    LockPoisoned,

    /// Serialization/deserialization error.
    #[error("serialization error: {0}")]
    SerializationError(String),

    /// Generic storage error.
    #[error("storage error: {0}")]
    Other(String),
}

/// Outcome of expanding a mapped task in one run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExpansionOutcome {
    /// Expanded into `length` instances (possibly zero).
    Expanded { length: usize },
    /// A source failed; a placeholder instance records `upstream_failed`.
    UpstreamFailed,
    /// Nothing to map over; a placeholder instance records `skipped`.
    Skipped,
}

/// Persisted expansion record. Its presence makes expansion idempotent.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredExpansion {
    pub dag_id: DagId,
    pub run_id: RunId,
    pub task_id: TaskId,
    pub outcome: ExpansionOutcome,
    pub created_at: DateTime<Utc>,
}

/// Request to move one instance from `scheduled` to `queued`.
#[derive(Debug, Clone)]
pub struct AdmissionRequest {
    /// Expected current state, normally `scheduled`.
    pub expected: Expectation,
    /// The queued record to write.
    pub instance: TaskInstance,
    /// The instance's pool.
    pub pool: Pool,
    /// Ceiling on queued plus running instances of the DAG.
    pub max_active_tasks: usize,
}

/// Result of an admission attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AdmitOutcome {
    Admitted,
    /// The instance changed since it was read.
    Conflict,
    /// Not enough free slots in the pool.
    PoolFull,
    /// The DAG already has `max_active_tasks` active instances.
    DagLimitReached,
}

/// Storage trait for persisting orchestrator state.
#[async_trait]
pub trait Storage: Send + Sync {
    // Run operations

    /// Create a run together with its initial task instances.
    ///
    /// Fails with `DuplicateKey` if the run id exists, or if a run for the
    /// same DAG and logical date exists and `run.forced` is false.
    async fn create_run(
        &self,
        run: DagRun,
        instances: Vec<TaskInstance>,
    ) -> Result<(), StorageError>;

    /// Get a run.
    async fn get_run(&self, dag_id: &DagId, run_id: &RunId) -> Result<DagRun, StorageError>;

    /// List runs ordered by logical date, optionally filtered by DAG and state.
    /// An empty `states` slice matches every state.
    async fn list_runs(
        &self,
        dag_id: Option<&DagId>,
        states: &[RunState],
    ) -> Result<Vec<DagRun>, StorageError>;

    /// Replace a run if its current state is `expected`.
    async fn update_run(&self, expected: RunState, run: DagRun) -> Result<bool, StorageError>;

    // Task instance operations

    /// Get a task instance.
    async fn get_instance(&self, key: &TaskInstanceKey) -> Result<TaskInstance, StorageError>;

    /// All instances of a run, ordered by key.
    async fn list_instances(
        &self,
        dag_id: &DagId,
        run_id: &RunId,
    ) -> Result<Vec<TaskInstance>, StorageError>;

    /// All instances in any of `states`.
    async fn list_instances_in_state(
        &self,
        states: &[TaskInstanceState],
    ) -> Result<Vec<TaskInstance>, StorageError>;

    /// Replace an instance if its state and try number match `expected`.
    async fn compare_and_set(
        &self,
        expected: Expectation,
        instance: TaskInstance,
    ) -> Result<bool, StorageError>;

    /// Compare-and-set into `running` and clear the XCom left by earlier tries.
    async fn begin_try(
        &self,
        expected: Expectation,
        instance: TaskInstance,
    ) -> Result<bool, StorageError>;

    /// Admit an instance into `queued` if pool and DAG limits allow it.
    ///
    /// Occupancy is computed from queued and running instances inside the
    /// same critical section as the state change.
    async fn admit(&self, request: AdmissionRequest) -> Result<AdmitOutcome, StorageError>;

    /// Write `xcoms` and then the success record, only if `expected` holds.
    async fn commit_success(
        &self,
        expected: Expectation,
        instance: TaskInstance,
        xcoms: Vec<XComEntry>,
    ) -> Result<bool, StorageError>;

    // Expansion operations

    /// Get the expansion record of a mapped task in a run.
    async fn get_expansion(
        &self,
        dag_id: &DagId,
        run_id: &RunId,
        task_id: &TaskId,
    ) -> Result<Option<StoredExpansion>, StorageError>;

    /// All expansion records of a run.
    async fn list_expansions(
        &self,
        dag_id: &DagId,
        run_id: &RunId,
    ) -> Result<Vec<StoredExpansion>, StorageError>;

    /// Insert an expansion record and its instances.
    ///
    /// Returns false without writing anything if a record already exists.
    async fn record_expansion(
        &self,
        expansion: StoredExpansion,
        instances: Vec<TaskInstance>,
    ) -> Result<bool, StorageError>;

    // XCom operations

    /// Insert or overwrite an XCom entry.
    async fn put_xcom(&self, entry: XComEntry) -> Result<(), StorageError>;

    /// Get an XCom entry.
    async fn get_xcom(&self, key: &XComKey) -> Result<XComEntry, StorageError>;

    /// Entries of `key` for every instance of a task, ordered by map index.
    async fn list_xcom(
        &self,
        dag_id: &DagId,
        run_id: &RunId,
        task_id: &TaskId,
        key: &str,
    ) -> Result<Vec<XComEntry>, StorageError>;
}
