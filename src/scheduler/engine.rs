//! Scheduler engine implementation.
//!
//! One [`Scheduler::run_pass`] moves every running DAG run forward:
//! - promote queued runs within `max_active_runs`
//! - expand mapped tasks whose upstreams finished
//! - evaluate trigger rules and wake retries
//! - admit scheduled instances into pools and dispatch them
//! - apply executor events
//! - fail zombies and requeue stuck instances
//! - aggregate run states
//!
//! Every state write is a compare-and-set, so passes may run concurrently
//! against the same storage.

use chrono::{DateTime, TimeDelta, Utc};
use serde_json::Value;
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use tokio::sync::{RwLock, mpsc};
use tokio::task::JoinHandle;
use tracing::{Instrument, debug, info, info_span, warn};

use super::deps::{self, DepDecision};
use super::expand::{ExpansionResult, expand};
use super::handle::{COMMAND_CHANNEL_BUFFER, SchedulerHandle};
use super::runs::{CreateRunRequest, RunManager};
use super::types::{PassSummary, SchedulerCommand, SchedulerConfig, SchedulerError, SchedulerState};
use super::view::RunView;
use crate::core::clock::{Clock, SystemClock};
use crate::core::dag::{ArgValue, Dag, TaskDefinition, XComArg};
use crate::core::instance::{TaskInstance, TaskInstanceState};
use crate::core::pool::PoolRegistry;
use crate::core::run::{DagRun, RunState};
use crate::core::types::{DagId, RunId, TaskId, TaskInstanceKey};
use crate::events::{Event, EventBus};
use crate::execution::{ExecutionCommand, Executor, ExecutorEvent, SubmitOutcome};
use crate::storage::{AdmissionRequest, AdmitOutcome, Storage, StorageError};
use crate::xcom::{XComError, XComKey, XComStore, build_entries};

type BlockedKey = (DagId, RunId, TaskId);

/// The scheduler: owns the registered DAGs and drives their runs.
pub struct Scheduler<S: Storage, E: Executor> {
    dags: HashMap<DagId, Arc<Dag>>,
    storage: Arc<S>,
    executor: Arc<E>,
    event_bus: Arc<EventBus>,
    clock: Arc<dyn Clock>,
    pools: PoolRegistry,
    config: SchedulerConfig,
    /// Expansions already reported as blocked.
    blocked: Mutex<HashSet<BlockedKey>>,
}

impl<S: Storage + 'static, E: Executor + 'static> Scheduler<S, E> {
    /// Create a scheduler over shared storage and an executor.
    pub fn new(storage: Arc<S>, executor: Arc<E>) -> Self {
        Self {
            dags: HashMap::new(),
            storage,
            executor,
            event_bus: Arc::new(EventBus::new()),
            clock: Arc::new(SystemClock),
            pools: PoolRegistry::default(),
            config: SchedulerConfig::default(),
            blocked: Mutex::new(HashSet::new()),
        }
    }

    /// Set the event bus.
    pub fn with_event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.event_bus = event_bus;
        self
    }

    /// Set the time source.
    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = clock;
        self
    }

    /// Set the pools instances are admitted into.
    pub fn with_pools(mut self, pools: PoolRegistry) -> Self {
        self.pools = pools;
        self
    }

    /// Set tick interval and timeouts.
    pub fn with_config(mut self, config: SchedulerConfig) -> Self {
        self.config = config;
        self
    }

    /// Register a DAG, replacing any DAG with the same id.
    pub fn register(&mut self, dag: Dag) {
        self.dags.insert(dag.id().clone(), Arc::new(dag));
    }

    /// Get a registered DAG.
    pub fn dag(&self, id: &DagId) -> Option<&Dag> {
        self.dags.get(id).map(Arc::as_ref)
    }

    /// All registered DAGs.
    pub fn dags(&self) -> impl Iterator<Item = &Dag> {
        self.dags.values().map(Arc::as_ref)
    }

    pub fn storage(&self) -> &Arc<S> {
        &self.storage
    }

    pub fn executor(&self) -> &Arc<E> {
        &self.executor
    }

    /// Get the event bus.
    pub fn event_bus(&self) -> &Arc<EventBus> {
        &self.event_bus
    }

    pub fn config(&self) -> &SchedulerConfig {
        &self.config
    }

    fn runs(&self) -> RunManager<S> {
        RunManager::new(Arc::clone(&self.storage), Arc::clone(&self.event_bus))
    }

    /// Create a run of `dag_id`. Without a request, a manual run for now.
    pub async fn trigger_run(
        &self,
        dag_id: &DagId,
        request: Option<CreateRunRequest>,
    ) -> Result<DagRun, SchedulerError> {
        let dag = self
            .dags
            .get(dag_id)
            .ok_or_else(|| SchedulerError::DagNotFound(dag_id.clone()))?;
        let now = self.clock.now();
        let request = request.unwrap_or_else(|| CreateRunRequest::manual(now));
        self.runs().create_run(dag, request, now).await
    }

    /// Fail a run, remove its unfinished instances and cancel the ones the
    /// executor holds.
    pub async fn mark_run_failed(
        &self,
        dag_id: &DagId,
        run_id: &RunId,
        reason: Option<String>,
    ) -> Result<(), SchedulerError> {
        let in_flight = self
            .runs()
            .mark_run_failed(dag_id, run_id, reason, self.clock.now())
            .await?;
        for key in in_flight {
            if self.executor.cancel(&key).await {
                debug!(instance = %key, "cancelled in-flight try");
            }
        }
        Ok(())
    }

    /// Remove one instance. Returns false if it had already finished.
    pub async fn mark_instance_removed(&self, key: &TaskInstanceKey) -> Result<bool, SchedulerError> {
        let was_active = self.storage.get_instance(key).await?.state.is_active();
        let removed = self
            .runs()
            .mark_instance_removed(key, self.clock.now())
            .await?;
        if removed && was_active {
            self.executor.cancel(key).await;
        }
        Ok(removed)
    }

    /// Run one scheduling pass.
    ///
    /// Never fails: storage errors are logged, counted in
    /// [`PassSummary::errors`] and retried on the next pass.
    pub async fn run_pass(&self) -> PassSummary {
        let now = self.clock.now();
        let span = info_span!("scheduler_pass", at = %now);
        async move {
            let mut summary = PassSummary::default();

            self.promote_runs(now, &mut summary).await;

            let running = match self.storage.list_runs(None, &[RunState::Running]).await {
                Ok(runs) => runs,
                Err(e) => {
                    warn!(error = %e, "failed to list running runs");
                    summary.errors += 1;
                    Vec::new()
                }
            };

            for run in &running {
                if let Err(e) = self.advance_run(run, now, &mut summary).await {
                    warn!(dag = %run.dag_id, run = %run.run_id, error = %e, "failed to advance run");
                    summary.errors += 1;
                }
            }

            let runs_by_key: HashMap<(DagId, RunId), DagRun> = running
                .iter()
                .map(|r| ((r.dag_id.clone(), r.run_id.clone()), r.clone()))
                .collect();
            let admitted = self.admit(now, &mut summary).await;
            self.dispatch(admitted, &runs_by_key, now, &mut summary).await;
            self.ingest_events(now, &mut summary).await;
            self.reap_zombies(now, &mut summary).await;
            self.requeue_stuck(now, &mut summary).await;

            for run in &running {
                let Some(dag) = self.dags.get(&run.dag_id) else {
                    continue;
                };
                match self.runs().aggregate(dag, run, now).await {
                    Ok(Some(state)) => {
                        info!(dag = %run.dag_id, run = %run.run_id, state = %state, "run finished");
                        summary.runs_finished += 1;
                    }
                    Ok(None) => {}
                    Err(e) => {
                        warn!(dag = %run.dag_id, run = %run.run_id, error = %e, "failed to aggregate run");
                        summary.errors += 1;
                    }
                }
            }

            debug!(?summary, "pass complete");
            summary
        }
        .instrument(span)
        .await
    }

    async fn promote_runs(&self, now: DateTime<Utc>, summary: &mut PassSummary) {
        let mut dag_ids: Vec<&DagId> = self.dags.keys().collect();
        dag_ids.sort();
        for dag_id in dag_ids {
            let dag = &self.dags[dag_id];
            match self.runs().promote_queued(dag, now).await {
                Ok(promoted) => summary.runs_promoted += promoted.len(),
                Err(e) => {
                    warn!(dag = %dag_id, error = %e, "failed to promote queued runs");
                    summary.errors += 1;
                }
            }
        }
    }

    /// Expansion, dependency evaluation and retry wake-ups for one run.
    async fn advance_run(
        &self,
        run: &DagRun,
        now: DateTime<Utc>,
        summary: &mut PassSummary,
    ) -> Result<(), StorageError> {
        let Some(dag) = self.dags.get(&run.dag_id).cloned() else {
            debug!(dag = %run.dag_id, run = %run.run_id, "run of unregistered dag");
            return Ok(());
        };
        let mut view = RunView::load(self.storage.as_ref(), &run.dag_id, &run.run_id).await?;

        for task_id in dag.topological_order() {
            let Some(task) = dag.task(task_id) else {
                continue;
            };
            if !task.is_mapped() || view.expansion(task_id).is_some() {
                continue;
            }
            let result = expand(&self.storage, &dag, task, run, &view, now).await?;
            if self.record_expansion_result(run, task, result, now, summary).await {
                view = RunView::load(self.storage.as_ref(), &run.dag_id, &run.run_id).await?;
            }
        }

        for task_id in dag.topological_order() {
            let Some(task) = dag.task(task_id) else {
                continue;
            };
            let waiting: Vec<TaskInstance> = view
                .instances(task_id)
                .iter()
                .filter(|ti| ti.state == TaskInstanceState::None)
                .cloned()
                .collect();
            if waiting.is_empty() {
                continue;
            }

            let upstream = view.upstream_summary(&dag, task_id);
            let decision = deps::evaluate(task.trigger_rule, &upstream);
            let (to, reason) = match decision {
                DepDecision::NotReady => continue,
                DepDecision::Ready => (TaskInstanceState::Scheduled, None),
                DepDecision::UpstreamFailed => (
                    TaskInstanceState::UpstreamFailed,
                    Some(format!("trigger rule {} cannot be met", task.trigger_rule)),
                ),
                DepDecision::Skip => (
                    TaskInstanceState::Skipped,
                    Some(format!("skipped by trigger rule {}", task.trigger_rule)),
                ),
            };

            for instance in waiting {
                debug!(instance = %instance.key, ?decision, "dependencies evaluated");
                if let Some(next) = self.apply(&instance, to, reason.clone(), now).await? {
                    match to {
                        TaskInstanceState::Scheduled => summary.scheduled += 1,
                        TaskInstanceState::Skipped => summary.skipped += 1,
                        _ => summary.upstream_failed += 1,
                    }
                    view.update(next);
                }
            }
        }

        let due: Vec<TaskInstance> = view
            .all()
            .filter(|ti| ti.state == TaskInstanceState::UpForRetry)
            .filter(|ti| ti.next_retry_at.is_none_or(|at| at <= now))
            .cloned()
            .collect();
        for instance in due {
            let reason = Some(format!("retry {} due", instance.try_number + 1));
            if self
                .apply(&instance, TaskInstanceState::Scheduled, reason, now)
                .await?
                .is_some()
            {
                summary.retries_woken += 1;
            }
        }
        Ok(())
    }

    /// Emit events for an expansion attempt. Returns true if instances were
    /// written.
    async fn record_expansion_result(
        &self,
        run: &DagRun,
        task: &TaskDefinition,
        result: ExpansionResult,
        now: DateTime<Utc>,
        summary: &mut PassSummary,
    ) -> bool {
        let blocked_key = (run.dag_id.clone(), run.run_id.clone(), task.task_id.clone());
        match result {
            ExpansionResult::Pending | ExpansionResult::AlreadyExpanded => false,
            ExpansionResult::Blocked(reason) => {
                let first = self
                    .blocked
                    .lock()
                    .map(|mut blocked| blocked.insert(blocked_key))
                    .unwrap_or(false);
                if first {
                    warn!(dag = %run.dag_id, run = %run.run_id, task = %task.task_id, reason = %reason, "expansion blocked");
                    self.event_bus
                        .emit(Event::ExpansionBlocked {
                            dag_id: run.dag_id.clone(),
                            run_id: run.run_id.clone(),
                            task_id: task.task_id.clone(),
                            reason,
                            timestamp: now,
                        })
                        .await;
                }
                false
            }
            ExpansionResult::Expanded { length } => {
                if let Ok(mut blocked) = self.blocked.lock() {
                    blocked.remove(&blocked_key);
                }
                info!(dag = %run.dag_id, run = %run.run_id, task = %task.task_id, length, "expanded mapped task");
                summary.expanded += 1;
                self.event_bus
                    .emit(Event::TaskExpanded {
                        dag_id: run.dag_id.clone(),
                        run_id: run.run_id.clone(),
                        task_id: task.task_id.clone(),
                        length,
                        timestamp: now,
                    })
                    .await;
                true
            }
            ExpansionResult::UpstreamFailed => {
                summary.upstream_failed += 1;
                self.emit_placeholder(run, task, TaskInstanceState::UpstreamFailed, now)
                    .await;
                true
            }
            ExpansionResult::Skipped => {
                summary.skipped += 1;
                self.emit_placeholder(run, task, TaskInstanceState::Skipped, now)
                    .await;
                true
            }
        }
    }

    async fn emit_placeholder(
        &self,
        run: &DagRun,
        task: &TaskDefinition,
        state: TaskInstanceState,
        now: DateTime<Utc>,
    ) {
        let key = TaskInstanceKey::new(run.dag_id.clone(), run.run_id.clone(), task.task_id.clone());
        info!(instance = %key, state = %state, "mapped task not expanded");
        self.event_bus
            .emit(Event::task_state_changed(
                key,
                TaskInstanceState::None,
                state,
                0,
                Some("mapped task not expanded".to_string()),
                now,
            ))
            .await;
    }

    /// Move `instance` to `to` with a compare-and-set and emit the change.
    ///
    /// Returns the new record, or None if the instance changed meanwhile.
    async fn apply(
        &self,
        instance: &TaskInstance,
        to: TaskInstanceState,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) -> Result<Option<TaskInstance>, StorageError> {
        let next = match instance.transition(to, now) {
            Ok(next) => next,
            Err(e) => {
                debug!(error = %e, "transition rejected");
                return Ok(None);
            }
        };
        if !self
            .storage
            .compare_and_set(instance.expectation(), next.clone())
            .await?
        {
            debug!(instance = %instance.key, to = %to, "lost compare-and-set");
            return Ok(None);
        }
        self.emit_transition(instance, &next, reason, now).await;
        Ok(Some(next))
    }

    async fn emit_transition(
        &self,
        from: &TaskInstance,
        to: &TaskInstance,
        reason: Option<String>,
        now: DateTime<Utc>,
    ) {
        self.event_bus
            .emit(Event::task_state_changed(
                to.key.clone(),
                from.state,
                to.state,
                to.try_number,
                reason,
                now,
            ))
            .await;
    }

    /// Admit scheduled instances into `queued`, earliest logical date first,
    /// then declaration order, then map index.
    async fn admit(&self, now: DateTime<Utc>, summary: &mut PassSummary) -> Vec<TaskInstance> {
        let mut candidates = match self
            .storage
            .list_instances_in_state(&[TaskInstanceState::Scheduled])
            .await
        {
            Ok(candidates) => candidates,
            Err(e) => {
                warn!(error = %e, "failed to list scheduled instances");
                summary.errors += 1;
                return Vec::new();
            }
        };
        candidates.sort_by(|a, b| {
            a.logical_date
                .cmp(&b.logical_date)
                .then_with(|| a.task_order.cmp(&b.task_order))
                .then_with(|| a.key.map_index.cmp(&b.key.map_index))
                .then_with(|| a.key.cmp(&b.key))
        });

        let mut admitted = Vec::new();
        for instance in candidates {
            let Some(dag) = self.dags.get(&instance.key.dag_id) else {
                continue;
            };
            let Some(pool) = self.pools.get(&instance.pool) else {
                debug!(instance = %instance.key, pool = %instance.pool, "unknown pool");
                continue;
            };
            let Ok(queued) = instance.transition(TaskInstanceState::Queued, now) else {
                continue;
            };

            let request = AdmissionRequest {
                expected: instance.expectation(),
                instance: queued.clone(),
                pool: pool.clone(),
                max_active_tasks: dag.max_active_tasks(),
            };
            match self.storage.admit(request).await {
                Ok(AdmitOutcome::Admitted) => {
                    self.emit_transition(&instance, &queued, None, now).await;
                    summary.admitted += 1;
                    admitted.push(queued);
                }
                Ok(AdmitOutcome::PoolFull) => {
                    debug!(instance = %instance.key, pool = %instance.pool, "pool full");
                }
                Ok(AdmitOutcome::DagLimitReached) => {
                    debug!(instance = %instance.key, "max_active_tasks reached");
                }
                Ok(AdmitOutcome::Conflict) => {}
                Err(e) => {
                    warn!(instance = %instance.key, error = %e, "admission failed");
                    summary.errors += 1;
                }
            }
        }
        admitted
    }

    /// Hand admitted instances to the executor.
    async fn dispatch(
        &self,
        admitted: Vec<TaskInstance>,
        runs: &HashMap<(DagId, RunId), DagRun>,
        now: DateTime<Utc>,
        summary: &mut PassSummary,
    ) {
        for instance in admitted {
            let key = instance.key.clone();
            let Some(task) = self
                .dags
                .get(&key.dag_id)
                .and_then(|dag| dag.task(&key.task_id))
            else {
                continue;
            };

            let run = match runs.get(&(key.dag_id.clone(), key.run_id.clone())) {
                Some(run) => run.clone(),
                None => match self.storage.get_run(&key.dag_id, &key.run_id).await {
                    Ok(run) => run,
                    Err(e) => {
                        warn!(instance = %key, error = %e, "run of admitted instance not found");
                        summary.errors += 1;
                        continue;
                    }
                },
            };

            let arguments = match self.resolve_arguments(task, &instance).await {
                Ok(arguments) => arguments,
                Err(reason) => {
                    warn!(instance = %key, reason = %reason, "argument resolution failed");
                    summary.errors += 1;
                    let mut failed = instance.clone();
                    failed.failure_reason = Some(reason.clone());
                    if let Err(e) = self
                        .apply(&failed, TaskInstanceState::Failed, Some(reason), now)
                        .await
                    {
                        warn!(instance = %key, error = %e, "failed to record failure");
                    }
                    continue;
                }
            };

            let command = ExecutionCommand {
                key: key.clone(),
                try_number: instance.try_number + 1,
                unit: Arc::clone(&task.unit),
                arguments,
                logical_date: run.logical_date,
                data_interval: run.data_interval(),
                execution_timeout: task.execution_timeout,
            };
            match self.executor.submit(command).await {
                SubmitOutcome::Accepted => {
                    debug!(instance = %key, try_number = instance.try_number + 1, "dispatched");
                    summary.dispatched += 1;
                }
                SubmitOutcome::Rejected(reason) => {
                    info!(instance = %key, reason = %reason, "executor rejected instance");
                    match self
                        .apply(&instance, TaskInstanceState::Scheduled, Some(reason), now)
                        .await
                    {
                        Ok(Some(_)) => summary.rejected += 1,
                        Ok(None) => {}
                        Err(e) => {
                            warn!(instance = %key, error = %e, "failed to requeue rejected instance");
                            summary.errors += 1;
                        }
                    }
                }
            }
        }
    }

    /// Static, partial and XCom arguments merged with the mapped slice.
    async fn resolve_arguments(
        &self,
        task: &TaskDefinition,
        instance: &TaskInstance,
    ) -> Result<BTreeMap<String, Value>, String> {
        let mut arguments = BTreeMap::new();
        for (name, value) in &task.arguments {
            let value = match value {
                ArgValue::Literal(value) => value.clone(),
                ArgValue::XCom(arg) => self.pull(&instance.key, arg).await?,
            };
            arguments.insert(name.clone(), value);
        }
        arguments.extend(instance.map_arguments.clone());
        Ok(arguments)
    }

    /// Read an XCom reference. A mapped producer yields the list of its
    /// instances' values in map-index order.
    async fn pull(&self, key: &TaskInstanceKey, arg: &XComArg) -> Result<Value, String> {
        let xcom = XComStore::new(Arc::clone(&self.storage));
        let producer_mapped = self
            .dags
            .get(&key.dag_id)
            .and_then(|dag| dag.task(&arg.task_id))
            .is_some_and(|t| t.is_mapped());

        if producer_mapped {
            return xcom
                .get_many_key(&key.dag_id, &key.run_id, &arg.task_id, &arg.key)
                .await
                .map(|values| Value::Array(values.into_values().collect()))
                .map_err(|e| e.to_string());
        }

        let xcom_key = XComKey {
            dag_id: key.dag_id.clone(),
            run_id: key.run_id.clone(),
            task_id: arg.task_id.clone(),
            map_index: None,
            key: arg.key.clone(),
        };
        xcom.get(&xcom_key).await.map_err(|e| match e {
            XComError::NotFound(k) => format!("missing xcom {}", k),
            other => other.to_string(),
        })
    }

    /// Apply every event the executor produced since the last pass.
    async fn ingest_events(&self, now: DateTime<Utc>, summary: &mut PassSummary) {
        for event in self.executor.drain_events() {
            match self.apply_event(&event, now).await {
                Ok(true) => summary.events_applied += 1,
                Ok(false) => {
                    debug!(instance = %event.key(), try_number = event.try_number(), "discarded stale executor event");
                    summary.events_discarded += 1;
                }
                Err(e) => {
                    warn!(instance = %event.key(), error = %e, "failed to apply executor event");
                    summary.errors += 1;
                }
            }
        }
    }

    async fn apply_event(&self, event: &ExecutorEvent, now: DateTime<Utc>) -> Result<bool, StorageError> {
        let key = event.key();
        if !self.dags.contains_key(&key.dag_id) {
            return Ok(false);
        }
        let current = match self.storage.get_instance(key).await {
            Ok(current) => current,
            Err(StorageError::NotFound(_)) => return Ok(false),
            Err(e) => return Err(e),
        };
        let Some(running) = self.ensure_running(&current, event.try_number(), now).await? else {
            return Ok(false);
        };

        match event {
            ExecutorEvent::Started { .. } => Ok(true),
            ExecutorEvent::Heartbeat { .. } => {
                let mut next = running.clone();
                next.last_heartbeat = Some(now);
                self.storage
                    .compare_and_set(running.expectation(), next)
                    .await
            }
            ExecutorEvent::Completed {
                return_value,
                outputs,
                ..
            } => {
                self.complete(&running, return_value.clone(), outputs.clone(), now)
                    .await
            }
            ExecutorEvent::Failed {
                reason, transient, ..
            } => self.fail(&running, reason.clone(), *transient, now).await,
        }
    }

    /// The running record for `try_number`, moving a queued instance into
    /// `running` first if the executor skipped the start event.
    async fn ensure_running(
        &self,
        current: &TaskInstance,
        try_number: u32,
        now: DateTime<Utc>,
    ) -> Result<Option<TaskInstance>, StorageError> {
        match current.state {
            TaskInstanceState::Running if current.try_number == try_number => {
                Ok(Some(current.clone()))
            }
            TaskInstanceState::Queued if current.try_number + 1 == try_number => {
                let Ok(next) = current.transition(TaskInstanceState::Running, now) else {
                    return Ok(None);
                };
                if !self
                    .storage
                    .begin_try(current.expectation(), next.clone())
                    .await?
                {
                    return Ok(None);
                }
                info!(instance = %next.key, try_number, "try started");
                self.emit_transition(current, &next, None, now).await;
                Ok(Some(next))
            }
            _ => Ok(None),
        }
    }

    async fn complete(
        &self,
        running: &TaskInstance,
        return_value: Option<Value>,
        outputs: BTreeMap<String, Value>,
        now: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        let multiple_outputs = self
            .dags
            .get(&running.key.dag_id)
            .and_then(|dag| dag.task(&running.key.task_id))
            .is_some_and(|task| task.multiple_outputs);

        let entries = match build_entries(
            &running.key,
            running.try_number,
            return_value,
            outputs,
            multiple_outputs,
            now,
        ) {
            Ok(entries) => entries,
            Err(XComError::Storage(e)) => return Err(e),
            Err(e) => return self.fail(running, e.to_string(), false, now).await,
        };

        let Ok(next) = running.transition(TaskInstanceState::Success, now) else {
            return Ok(false);
        };
        if !self
            .storage
            .commit_success(running.expectation(), next.clone(), entries)
            .await?
        {
            return Ok(false);
        }
        info!(instance = %next.key, try_number = next.try_number, "task instance succeeded");
        self.emit_transition(running, &next, None, now).await;
        Ok(true)
    }

    /// Fail a running try through the retry policy.
    async fn fail(
        &self,
        running: &TaskInstance,
        reason: String,
        transient: bool,
        now: DateTime<Utc>,
    ) -> Result<bool, StorageError> {
        let Some(dag) = self.dags.get(&running.key.dag_id) else {
            return Ok(false);
        };
        let policy = dag.retry_policy(&running.key.task_id);
        let retry = policy.should_retry(running.try_number, transient);
        let to = if retry {
            TaskInstanceState::UpForRetry
        } else {
            TaskInstanceState::Failed
        };

        let Ok(mut next) = running.transition(to, now) else {
            return Ok(false);
        };
        next.failure_reason = Some(reason.clone());
        if retry {
            let delay = TimeDelta::from_std(policy.delay_for(running.try_number))
                .unwrap_or(TimeDelta::MAX);
            next.next_retry_at = Some(now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC));
        }

        if !self
            .storage
            .compare_and_set(running.expectation(), next.clone())
            .await?
        {
            return Ok(false);
        }
        if retry {
            info!(instance = %next.key, try_number = next.try_number, reason = %reason, "task instance up for retry");
        } else {
            warn!(instance = %next.key, try_number = next.try_number, reason = %reason, "task instance failed");
        }
        self.emit_transition(running, &next, Some(reason), now).await;
        Ok(true)
    }

    fn cutoff(now: DateTime<Utc>, age: std::time::Duration) -> Option<DateTime<Utc>> {
        TimeDelta::from_std(age)
            .ok()
            .and_then(|age| now.checked_sub_signed(age))
    }

    /// Fail running instances whose heartbeat is older than the threshold.
    async fn reap_zombies(&self, now: DateTime<Utc>, summary: &mut PassSummary) {
        let Some(cutoff) = Self::cutoff(now, self.config.zombie_threshold) else {
            return;
        };
        let running = match self
            .storage
            .list_instances_in_state(&[TaskInstanceState::Running])
            .await
        {
            Ok(running) => running,
            Err(e) => {
                warn!(error = %e, "failed to list running instances");
                summary.errors += 1;
                return;
            }
        };

        for instance in running {
            if !self.dags.contains_key(&instance.key.dag_id) {
                continue;
            }
            let Some(last_seen) = instance.last_heartbeat.or(instance.start_date) else {
                continue;
            };
            if last_seen >= cutoff {
                continue;
            }
            let reason = format!("zombie: no heartbeat since {}", last_seen.to_rfc3339());
            match self.fail(&instance, reason, true, now).await {
                Ok(true) => {
                    summary.zombies += 1;
                    self.executor.cancel(&instance.key).await;
                }
                Ok(false) => {}
                Err(e) => {
                    warn!(instance = %instance.key, error = %e, "failed to fail zombie");
                    summary.errors += 1;
                }
            }
        }
    }

    /// Return instances stuck in `queued` to `scheduled`.
    async fn requeue_stuck(&self, now: DateTime<Utc>, summary: &mut PassSummary) {
        let Some(cutoff) = self
            .config
            .queued_timeout
            .and_then(|timeout| Self::cutoff(now, timeout))
        else {
            return;
        };
        let queued = match self
            .storage
            .list_instances_in_state(&[TaskInstanceState::Queued])
            .await
        {
            Ok(queued) => queued,
            Err(e) => {
                warn!(error = %e, "failed to list queued instances");
                summary.errors += 1;
                return;
            }
        };

        for instance in queued {
            if !self.dags.contains_key(&instance.key.dag_id)
                || instance.queued_at.is_none_or(|at| at >= cutoff)
            {
                continue;
            }
            let reason = Some("queued timeout".to_string());
            match self
                .apply(&instance, TaskInstanceState::Scheduled, reason, now)
                .await
            {
                Ok(Some(_)) => {
                    summary.requeued += 1;
                    self.executor.cancel(&instance.key).await;
                }
                Ok(None) => {}
                Err(e) => {
                    warn!(instance = %instance.key, error = %e, "failed to requeue instance");
                    summary.errors += 1;
                }
            }
        }
    }

    /// Start the scheduler loop and return a handle for controlling it.
    pub async fn start(self) -> (SchedulerHandle, JoinHandle<()>) {
        let (command_tx, command_rx) = mpsc::channel(COMMAND_CHANNEL_BUFFER);
        let state = Arc::new(RwLock::new(SchedulerState::Running));

        let handle = SchedulerHandle {
            command_tx,
            state: Arc::clone(&state),
        };

        let scheduler_task = tokio::spawn(async move {
            self.run(command_rx, state).await;
        });

        (handle, scheduler_task)
    }

    /// Main scheduler loop.
    async fn run(
        self,
        mut command_rx: mpsc::Receiver<SchedulerCommand>,
        state: Arc<RwLock<SchedulerState>>,
    ) {
        let mut interval = tokio::time::interval(self.config.tick_interval);
        let mut last_check = self.clock.now();
        info!(dags = self.dags.len(), "scheduler started");

        loop {
            tokio::select! {
                _ = interval.tick() => {
                    if *state.read().await == SchedulerState::Running {
                        let now = self.clock.now();
                        self.check_schedules(last_check, now).await;
                        last_check = now;
                        self.run_pass().await;
                    }
                }

                Some(command) = command_rx.recv() => {
                    match command {
                        SchedulerCommand::Trigger { dag_id, request, response } => {
                            let _ = response.send(self.trigger_run(&dag_id, request).await);
                        }
                        SchedulerCommand::MarkRunFailed { dag_id, run_id, reason, response } => {
                            let _ = response.send(self.mark_run_failed(&dag_id, &run_id, reason).await);
                        }
                        SchedulerCommand::MarkRemoved { key, response } => {
                            let _ = response.send(self.mark_instance_removed(&key).await);
                        }
                        SchedulerCommand::Pause { response } => {
                            *state.write().await = SchedulerState::Paused;
                            info!("scheduler paused");
                            let _ = response.send(());
                        }
                        SchedulerCommand::Resume { response } => {
                            *state.write().await = SchedulerState::Running;
                            // Occurrences that fell inside the pause are not run.
                            last_check = self.clock.now();
                            info!("scheduler resumed");
                            let _ = response.send(());
                        }
                        SchedulerCommand::Shutdown { response } => {
                            *state.write().await = SchedulerState::Stopped;
                            info!("scheduler stopped");
                            let _ = response.send(());
                            break;
                        }
                    }
                }
            }
        }
    }

    /// Create a run for every DAG whose schedule fired in `(last_check, now]`.
    ///
    /// Several missed occurrences produce one run, for the latest.
    async fn check_schedules(&self, last_check: DateTime<Utc>, now: DateTime<Utc>) {
        for dag in self.dags.values() {
            let Some(schedule) = dag.schedule() else {
                continue;
            };
            let occurrence = match schedule.latest_due(last_check, now) {
                Ok(Some(occurrence)) => occurrence,
                Ok(None) => continue,
                Err(e) => {
                    warn!(dag = %dag.id(), error = %e, "failed to evaluate schedule");
                    continue;
                }
            };

            match self
                .trigger_run(dag.id(), Some(CreateRunRequest::scheduled(occurrence)))
                .await
            {
                Ok(run) => info!(dag = %dag.id(), run = %run.run_id, "scheduled run created"),
                Err(SchedulerError::DuplicateRun { .. }) => {
                    debug!(dag = %dag.id(), logical_date = %occurrence, "run already exists");
                }
                Err(e) => warn!(dag = %dag.id(), error = %e, "failed to create scheduled run"),
            }
        }
    }
}
