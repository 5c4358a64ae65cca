//! In-memory storage implementation.
//!
//! Provides a thread-safe in-memory backend for tests, development and
//! single-process deployments.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{BTreeMap, HashMap};
use std::sync::RwLock;

use super::{
    AdmissionRequest, AdmitOutcome, Storage, StorageError, StoredExpansion,
};
use crate::core::instance::{Expectation, TaskInstance, TaskInstanceState};
use crate::core::run::{DagRun, RunState};
use crate::core::types::{DagId, RunId, TaskId, TaskInstanceKey};
use crate::xcom::{XComEntry, XComKey};

type RunKey = (DagId, RunId);
type ExpansionKey = (DagId, RunId, TaskId);

#[derive(Default)]
struct Tables {
    runs: HashMap<RunKey, DagRun>,
    /// Unforced runs by logical date, enforcing uniqueness.
    logical_dates: HashMap<(DagId, DateTime<Utc>), RunId>,
    instances: BTreeMap<TaskInstanceKey, TaskInstance>,
    expansions: HashMap<ExpansionKey, StoredExpansion>,
    xcom: BTreeMap<XComKey, XComEntry>,
}

impl Tables {
    fn matches(&self, expected: &Expectation, key: &TaskInstanceKey) -> bool {
        self.instances.get(key).is_some_and(|current| {
            current.state == expected.state && current.try_number == expected.try_number
        })
    }

    fn clear_xcom(&mut self, instance: &TaskInstanceKey) {
        self.xcom.retain(|key, _| !key.belongs_to(instance));
    }
}

/// In-memory storage backend.
///
/// All tables sit behind one lock, so every trait method is atomic with
/// respect to every other. Data is not persisted across restarts.
pub struct InMemoryStorage {
    tables: RwLock<Tables>,
}

impl InMemoryStorage {
    /// Create a new empty in-memory storage.
    pub fn new() -> Self {
        Self {
            tables: RwLock::new(Tables::default()),
        }
    }

    fn read(&self) -> Result<std::sync::RwLockReadGuard<'_, Tables>, StorageError> {
        self.tables.read().map_err(|_| StorageError::LockPoisoned)
    }

    fn write(&self) -> Result<std::sync::RwLockWriteGuard<'_, Tables>, StorageError> {
        self.tables.write().map_err(|_| StorageError::LockPoisoned)
    }
}

impl Default for InMemoryStorage {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Storage for InMemoryStorage {
    async fn create_run(
        &self,
        run: DagRun,
        instances: Vec<TaskInstance>,
    ) -> Result<(), StorageError> {
        let mut tables = self.write()?;
        let run_key = (run.dag_id.clone(), run.run_id.clone());
        if tables.runs.contains_key(&run_key) {
            return Err(StorageError::DuplicateKey(format!(
                "run: {}/{}",
                run.dag_id, run.run_id
            )));
        }
        let date_key = (run.dag_id.clone(), run.logical_date);
        if !run.forced && tables.logical_dates.contains_key(&date_key) {
            return Err(StorageError::DuplicateKey(format!(
                "run: {} at {}",
                run.dag_id,
                run.logical_date.to_rfc3339()
            )));
        }

        for instance in instances {
            tables.instances.insert(instance.key.clone(), instance);
        }
        if !run.forced {
            tables.logical_dates.insert(date_key, run.run_id.clone());
        }
        tables.runs.insert(run_key, run);
        Ok(())
    }

    async fn get_run(&self, dag_id: &DagId, run_id: &RunId) -> Result<DagRun, StorageError> {
        let tables = self.read()?;
        tables
            .runs
            .get(&(dag_id.clone(), run_id.clone()))
            .cloned()
            .ok_or_else(|| StorageError::NotFound(format!("run: {}/{}", dag_id, run_id)))
    }

    async fn list_runs(
        &self,
        dag_id: Option<&DagId>,
        states: &[RunState],
    ) -> Result<Vec<DagRun>, StorageError> {
        let tables = self.read()?;
        let mut result: Vec<_> = tables
            .runs
            .values()
            .filter(|r| dag_id.is_none_or(|id| &r.dag_id == id))
            .filter(|r| states.is_empty() || states.contains(&r.state))
            .cloned()
            .collect();
        result.sort_by(|a, b| {
            a.logical_date
                .cmp(&b.logical_date)
                .then_with(|| a.created_at.cmp(&b.created_at))
                .then_with(|| a.run_id.cmp(&b.run_id))
        });
        Ok(result)
    }

    async fn update_run(&self, expected: RunState, run: DagRun) -> Result<bool, StorageError> {
        let mut tables = self.write()?;
        let run_key = (run.dag_id.clone(), run.run_id.clone());
        match tables.runs.get(&run_key) {
            None => Err(StorageError::NotFound(format!(
                "run: {}/{}",
                run.dag_id, run.run_id
            ))),
            Some(current) if current.state != expected => Ok(false),
            Some(_) => {
                tables.runs.insert(run_key, run);
                Ok(true)
            }
        }
    }

    async fn get_instance(&self, key: &TaskInstanceKey) -> Result<TaskInstance, StorageError> {
        let tables = self.read()?;
        tables
            .instances
            .get(key)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(format!("task instance: {}", key)))
    }

    async fn list_instances(
        &self,
        dag_id: &DagId,
        run_id: &RunId,
    ) -> Result<Vec<TaskInstance>, StorageError> {
        let tables = self.read()?;
        Ok(tables
            .instances
            .values()
            .filter(|ti| ti.key.same_run(dag_id, run_id))
            .cloned()
            .collect())
    }

    async fn list_instances_in_state(
        &self,
        states: &[TaskInstanceState],
    ) -> Result<Vec<TaskInstance>, StorageError> {
        let tables = self.read()?;
        Ok(tables
            .instances
            .values()
            .filter(|ti| states.contains(&ti.state))
            .cloned()
            .collect())
    }

    async fn compare_and_set(
        &self,
        expected: Expectation,
        instance: TaskInstance,
    ) -> Result<bool, StorageError> {
        let mut tables = self.write()?;
        if !tables.matches(&expected, &instance.key) {
            return Ok(false);
        }
        tables.instances.insert(instance.key.clone(), instance);
        Ok(true)
    }

    async fn begin_try(
        &self,
        expected: Expectation,
        instance: TaskInstance,
    ) -> Result<bool, StorageError> {
        let mut tables = self.write()?;
        if !tables.matches(&expected, &instance.key) {
            return Ok(false);
        }
        tables.clear_xcom(&instance.key);
        tables.instances.insert(instance.key.clone(), instance);
        Ok(true)
    }

    async fn admit(&self, request: AdmissionRequest) -> Result<AdmitOutcome, StorageError> {
        let mut tables = self.write()?;
        let instance = request.instance;
        if !tables.matches(&request.expected, &instance.key) {
            return Ok(AdmitOutcome::Conflict);
        }

        let mut pool_occupied: u32 = 0;
        let mut dag_active: usize = 0;
        for ti in tables.instances.values().filter(|ti| ti.state.is_active()) {
            if ti.pool == instance.pool {
                pool_occupied = pool_occupied.saturating_add(ti.pool_slots);
            }
            if ti.key.dag_id == instance.key.dag_id {
                dag_active += 1;
            }
        }

        if !request.pool.fits(pool_occupied, instance.pool_slots) {
            return Ok(AdmitOutcome::PoolFull);
        }
        if dag_active >= request.max_active_tasks {
            return Ok(AdmitOutcome::DagLimitReached);
        }

        tables.instances.insert(instance.key.clone(), instance);
        Ok(AdmitOutcome::Admitted)
    }

    async fn commit_success(
        &self,
        expected: Expectation,
        instance: TaskInstance,
        xcoms: Vec<XComEntry>,
    ) -> Result<bool, StorageError> {
        let mut tables = self.write()?;
        if !tables.matches(&expected, &instance.key) {
            return Ok(false);
        }
        for entry in xcoms {
            tables.xcom.insert(entry.key.clone(), entry);
        }
        tables.instances.insert(instance.key.clone(), instance);
        Ok(true)
    }

    async fn get_expansion(
        &self,
        dag_id: &DagId,
        run_id: &RunId,
        task_id: &TaskId,
    ) -> Result<Option<StoredExpansion>, StorageError> {
        let tables = self.read()?;
        Ok(tables
            .expansions
            .get(&(dag_id.clone(), run_id.clone(), task_id.clone()))
            .cloned())
    }

    async fn list_expansions(
        &self,
        dag_id: &DagId,
        run_id: &RunId,
    ) -> Result<Vec<StoredExpansion>, StorageError> {
        let tables = self.read()?;
        Ok(tables
            .expansions
            .values()
            .filter(|e| &e.dag_id == dag_id && &e.run_id == run_id)
            .cloned()
            .collect())
    }

    async fn record_expansion(
        &self,
        expansion: StoredExpansion,
        instances: Vec<TaskInstance>,
    ) -> Result<bool, StorageError> {
        let mut tables = self.write()?;
        let key = (
            expansion.dag_id.clone(),
            expansion.run_id.clone(),
            expansion.task_id.clone(),
        );
        if tables.expansions.contains_key(&key) {
            return Ok(false);
        }
        for instance in instances {
            tables.instances.entry(instance.key.clone()).or_insert(instance);
        }
        tables.expansions.insert(key, expansion);
        Ok(true)
    }

    async fn put_xcom(&self, entry: XComEntry) -> Result<(), StorageError> {
        let mut tables = self.write()?;
        tables.xcom.insert(entry.key.clone(), entry);
        Ok(())
    }

    async fn get_xcom(&self, key: &XComKey) -> Result<XComEntry, StorageError> {
        let tables = self.read()?;
        tables
            .xcom
            .get(key)
            .cloned()
            .ok_or_else(|| StorageError::NotFound(format!("xcom: {}", key)))
    }

    async fn list_xcom(
        &self,
        dag_id: &DagId,
        run_id: &RunId,
        task_id: &TaskId,
        key: &str,
    ) -> Result<Vec<XComEntry>, StorageError> {
        let tables = self.read()?;
        // BTreeMap order puts map_index None first, then ascending indices.
        Ok(tables
            .xcom
            .values()
            .filter(|e| {
                &e.key.dag_id == dag_id
                    && &e.key.run_id == run_id
                    && &e.key.task_id == task_id
                    && e.key.key == key
            })
            .cloned()
            .collect())
    }
}
