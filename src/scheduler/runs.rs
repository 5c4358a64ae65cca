//! DAG run lifecycle: creation, promotion, aggregation and cancellation.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tracing::{debug, info};

use super::types::SchedulerError;
use super::view::RunView;
use crate::core::dag::{Dag, TaskDefinition};
use crate::core::instance::{TaskInstance, TaskInstanceState};
use crate::core::run::{DagRun, RunState, RunType};
use crate::core::types::{DagId, RunId, TaskInstanceKey};
use crate::events::{Event, EventBus};
use crate::storage::{Storage, StorageError};

/// How many times a removal re-reads an instance that keeps changing.
const MAX_CAS_ATTEMPTS: usize = 5;

/// Parameters of a new run.
#[derive(Debug, Clone, PartialEq)]
pub struct CreateRunRequest {
    pub logical_date: DateTime<Utc>,
    pub run_type: RunType,
    /// Allow a second run for the same logical date.
    pub force: bool,
    pub note: Option<String>,
}

impl CreateRunRequest {
    /// A manually triggered run.
    pub fn manual(logical_date: DateTime<Utc>) -> Self {
        Self {
            logical_date,
            run_type: RunType::Manual,
            force: false,
            note: None,
        }
    }

    /// A run created by the DAG's schedule.
    pub fn scheduled(logical_date: DateTime<Utc>) -> Self {
        Self {
            run_type: RunType::Scheduled,
            ..Self::manual(logical_date)
        }
    }

    /// Builder: create the run even if one exists for the logical date.
    pub fn forced(mut self) -> Self {
        self.force = true;
        self
    }

    /// Builder: attach a note.
    pub fn with_note(mut self, note: impl Into<String>) -> Self {
        self.note = Some(note.into());
        self
    }
}

/// A fresh instance of `task` in `run`.
pub(crate) fn new_instance(
    dag: &Dag,
    task: &TaskDefinition,
    run: &DagRun,
    map_index: Option<usize>,
) -> TaskInstance {
    let key = TaskInstanceKey {
        dag_id: run.dag_id.clone(),
        run_id: run.run_id.clone(),
        task_id: task.task_id.clone(),
        map_index,
    };
    TaskInstance::new(key, run.logical_date)
        .with_pool(task.pool.clone(), task.pool_slots)
        .with_max_retries(dag.retry_policy(&task.task_id).max_retries)
        .with_task_order(dag.declaration_index(&task.task_id).unwrap_or(0))
}

/// State a run should be in given its instances.
///
/// `success` when every instance succeeded or was skipped and every mapped
/// task has expanded; `failed` when everything is terminal otherwise;
/// `running` while anything can still change.
pub fn aggregate_state(dag: &Dag, view: &RunView) -> RunState {
    let mut all_ok = true;
    for task in dag.tasks() {
        if task.is_mapped() && view.expansion(&task.task_id).is_none() {
            return RunState::Running;
        }
        for instance in view.instances(&task.task_id) {
            match instance.state {
                TaskInstanceState::Success | TaskInstanceState::Skipped => {}
                state if state.is_terminal() => all_ok = false,
                _ => return RunState::Running,
            }
        }
    }
    if all_ok {
        RunState::Success
    } else {
        RunState::Failed
    }
}

/// Creates runs and moves them through their lifecycle.
pub struct RunManager<S: Storage> {
    storage: Arc<S>,
    event_bus: Arc<EventBus>,
}

impl<S: Storage> RunManager<S> {
    pub fn new(storage: Arc<S>, event_bus: Arc<EventBus>) -> Self {
        Self { storage, event_bus }
    }

    /// Create a queued run together with every unmapped task instance.
    ///
    /// Mapped tasks get their instances when they expand.
    pub async fn create_run(
        &self,
        dag: &Dag,
        request: CreateRunRequest,
        now: DateTime<Utc>,
    ) -> Result<DagRun, SchedulerError> {
        let logical_date = request.logical_date;
        let mut run_id = match request.run_type {
            RunType::Manual => RunId::manual(logical_date),
            RunType::Scheduled => RunId::scheduled(logical_date),
        };
        if request.force {
            run_id = run_id.with_unique_suffix();
        }

        let data_interval = match dag.schedule() {
            Some(schedule) => schedule.data_interval(logical_date)?,
            None => (logical_date, logical_date),
        };

        let mut run = DagRun::new(
            dag.id().clone(),
            run_id,
            request.run_type,
            logical_date,
            data_interval,
            now,
        );
        run.forced = request.force;
        run.note = request.note;

        let instances: Vec<TaskInstance> = dag
            .tasks()
            .filter(|task| !task.is_mapped())
            .map(|task| new_instance(dag, task, &run, None))
            .collect();

        match self.storage.create_run(run.clone(), instances).await {
            Ok(()) => {}
            Err(StorageError::DuplicateKey(_)) => {
                return Err(SchedulerError::DuplicateRun {
                    dag_id: dag.id().clone(),
                    logical_date,
                });
            }
            Err(e) => return Err(e.into()),
        }

        info!(dag = %run.dag_id, run = %run.run_id, logical_date = %logical_date, "run created");
        Ok(run)
    }

    /// Move queued runs to running while the DAG has free run slots,
    /// earliest logical date first.
    pub async fn promote_queued(
        &self,
        dag: &Dag,
        now: DateTime<Utc>,
    ) -> Result<Vec<RunId>, StorageError> {
        let runs = self
            .storage
            .list_runs(Some(dag.id()), &[RunState::Queued, RunState::Running])
            .await?;
        let mut active = runs.iter().filter(|r| r.state == RunState::Running).count();

        let mut promoted = Vec::new();
        for run in runs.iter().filter(|r| r.state == RunState::Queued) {
            if active >= dag.max_active_runs() {
                debug!(dag = %dag.id(), active, "max_active_runs reached");
                break;
            }
            let next = run.with_state(RunState::Running, now);
            if self.storage.update_run(RunState::Queued, next).await? {
                active += 1;
                promoted.push(run.run_id.clone());
                self.event_bus
                    .emit(Event::run_state_changed(
                        run.dag_id.clone(),
                        run.run_id.clone(),
                        RunState::Queued,
                        RunState::Running,
                        now,
                    ))
                    .await;
            }
        }
        Ok(promoted)
    }

    /// Recompute a running run's state and commit it if it finished.
    ///
    /// Returns the new state when the run reached a terminal state.
    pub async fn aggregate(
        &self,
        dag: &Dag,
        run: &DagRun,
        now: DateTime<Utc>,
    ) -> Result<Option<RunState>, StorageError> {
        if run.state != RunState::Running {
            return Ok(None);
        }
        let view = RunView::load(self.storage.as_ref(), &run.dag_id, &run.run_id).await?;
        let state = aggregate_state(dag, &view);
        if state == RunState::Running {
            return Ok(None);
        }

        if !self
            .storage
            .update_run(RunState::Running, run.with_state(state, now))
            .await?
        {
            return Ok(None);
        }
        self.event_bus
            .emit(Event::run_state_changed(
                run.dag_id.clone(),
                run.run_id.clone(),
                RunState::Running,
                state,
                now,
            ))
            .await;
        Ok(Some(state))
    }

    /// Fail a run from outside and remove every unfinished instance.
    ///
    /// Returns the removed instances that were queued or running, which the
    /// caller may ask the executor to cancel.
    pub async fn mark_run_failed(
        &self,
        dag_id: &DagId,
        run_id: &RunId,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Vec<TaskInstanceKey>, SchedulerError> {
        let run = self.storage.get_run(dag_id, run_id).await?;
        if run.state.is_terminal() {
            return Err(SchedulerError::RunFinished {
                dag_id: dag_id.clone(),
                run_id: run_id.clone(),
            });
        }

        let mut failed = run.with_state(RunState::Failed, now);
        if reason.is_some() {
            failed.note = reason;
        }
        if !self.storage.update_run(run.state, failed).await? {
            return Err(SchedulerError::Conflict(format!("run {} changed", run_id)));
        }
        self.event_bus
            .emit(Event::run_state_changed(
                dag_id.clone(),
                run_id.clone(),
                run.state,
                RunState::Failed,
                now,
            ))
            .await;

        let mut in_flight = Vec::new();
        for instance in self.storage.list_instances(dag_id, run_id).await? {
            if instance.state.is_terminal() {
                continue;
            }
            let was_active = instance.state.is_active();
            if self.mark_instance_removed(&instance.key, now).await? && was_active {
                in_flight.push(instance.key);
            }
        }
        Ok(in_flight)
    }

    /// Move one instance to `removed`. Returns false if it already finished.
    pub async fn mark_instance_removed(
        &self,
        key: &TaskInstanceKey,
        now: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        for _ in 0..MAX_CAS_ATTEMPTS {
            let current = self.storage.get_instance(key).await?;
            let Ok(next) = current.transition(TaskInstanceState::Removed, now) else {
                return Ok(false);
            };
            if self
                .storage
                .compare_and_set(current.expectation(), next)
                .await?
            {
                self.event_bus
                    .emit(Event::task_state_changed(
                        key.clone(),
                        current.state,
                        TaskInstanceState::Removed,
                        current.try_number,
                        Some("removed".to_string()),
                        now,
                    ))
                    .await;
                return Ok(true);
            }
        }
        Err(StorageError::Other(format!(
            "task instance {} kept changing while being removed",
            key
        )))
    }
}
