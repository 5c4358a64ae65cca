//! Expansion of mapped tasks into one instance per map index.
//!
//! A mapped task expands once per run, after every upstream has finished.
//! The expansion record and its instances are written in one storage call,
//! so a second attempt (from this pass or a concurrent one) is a no-op.

use chrono::{DateTime, Utc};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;

use super::deps::{self, DepDecision};
use super::runs::new_instance;
use super::view::RunView;
use crate::core::dag::{Dag, MapSource, TaskDefinition, XComArg};
use crate::core::instance::{TaskInstance, TaskInstanceState};
use crate::core::run::DagRun;
use crate::storage::{ExpansionOutcome, Storage, StorageError, StoredExpansion};
use crate::xcom::{XComError, XComKey, XComStore, json_kind};

/// Result of one expansion attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ExpansionResult {
    /// Upstreams still running; try again next pass.
    Pending,
    /// Upstreams finished but a source cannot be mapped over.
    Blocked(String),
    /// Recorded an `upstream_failed` placeholder.
    UpstreamFailed,
    /// Recorded a `skipped` placeholder.
    Skipped,
    /// Created `length` instances.
    Expanded { length: usize },
    /// Another attempt recorded the expansion first.
    AlreadyExpanded,
}

/// Try to expand `task` in `run`.
///
/// `view` must be a current snapshot of the run. The caller emits events for
/// whatever was recorded.
pub async fn expand<S: Storage>(
    storage: &Arc<S>,
    dag: &Dag,
    task: &TaskDefinition,
    run: &DagRun,
    view: &RunView,
    now: DateTime<Utc>,
) -> Result<ExpansionResult, StorageError> {
    if view.expansion(&task.task_id).is_some() {
        return Ok(ExpansionResult::AlreadyExpanded);
    }

    let upstream = view.upstream_summary(dag, &task.task_id);
    if !upstream.all_done() {
        return Ok(ExpansionResult::Pending);
    }

    match deps::evaluate(task.trigger_rule, &upstream) {
        DepDecision::NotReady => return Ok(ExpansionResult::Pending),
        DepDecision::UpstreamFailed => {
            return record_placeholder(storage, dag, task, run, ExpansionOutcome::UpstreamFailed, now)
                .await;
        }
        DepDecision::Skip => {
            return record_placeholder(storage, dag, task, run, ExpansionOutcome::Skipped, now)
                .await;
        }
        DepDecision::Ready => {}
    }

    // The rule tolerated a failed or skipped source: nothing to map over.
    if let Some(source) = task
        .expand
        .iter()
        .filter_map(|(_, source)| source.upstream())
        .find(|source| !source_succeeded(dag, view, source))
    {
        tracing::debug!(
            dag = %run.dag_id,
            run = %run.run_id,
            task = %task.task_id,
            source = %source,
            "map source did not succeed"
        );
        return record_placeholder(storage, dag, task, run, ExpansionOutcome::Skipped, now).await;
    }

    let mut columns = Vec::with_capacity(task.expand.len());
    for (name, source) in &task.expand {
        match resolve_source(storage, dag, view, run, source).await? {
            Ok(items) => columns.push((name.as_str(), items)),
            Err(reason) => return Ok(ExpansionResult::Blocked(reason)),
        }
    }

    let Some(slices) = cartesian_product(&columns) else {
        return Ok(ExpansionResult::Blocked(format!(
            "task '{}' would expand into more instances than can be counted",
            task.task_id
        )));
    };

    let length = slices.len();
    let instances: Vec<TaskInstance> = slices
        .into_iter()
        .enumerate()
        .map(|(index, slice)| new_instance(dag, task, run, Some(index)).with_map_arguments(slice))
        .collect();

    let recorded = storage
        .record_expansion(
            expansion_record(run, task, ExpansionOutcome::Expanded { length }, now),
            instances,
        )
        .await?;
    Ok(if recorded {
        ExpansionResult::Expanded { length }
    } else {
        ExpansionResult::AlreadyExpanded
    })
}

fn expansion_record(
    run: &DagRun,
    task: &TaskDefinition,
    outcome: ExpansionOutcome,
    now: DateTime<Utc>,
) -> StoredExpansion {
    StoredExpansion {
        dag_id: run.dag_id.clone(),
        run_id: run.run_id.clone(),
        task_id: task.task_id.clone(),
        outcome,
        created_at: now,
    }
}

async fn record_placeholder<S: Storage>(
    storage: &Arc<S>,
    dag: &Dag,
    task: &TaskDefinition,
    run: &DagRun,
    outcome: ExpansionOutcome,
    now: DateTime<Utc>,
) -> Result<ExpansionResult, StorageError> {
    let (state, result) = match outcome {
        ExpansionOutcome::UpstreamFailed => (
            TaskInstanceState::UpstreamFailed,
            ExpansionResult::UpstreamFailed,
        ),
        _ => (TaskInstanceState::Skipped, ExpansionResult::Skipped),
    };
    let placeholder = new_instance(dag, task, run, None).with_state(state, now);

    let recorded = storage
        .record_expansion(expansion_record(run, task, outcome, now), vec![placeholder])
        .await?;
    Ok(if recorded {
        result
    } else {
        ExpansionResult::AlreadyExpanded
    })
}

/// True if every instance of `source` succeeded. A mapped source that
/// expanded to nothing counts as succeeded.
fn source_succeeded(dag: &Dag, view: &RunView, source: &crate::core::types::TaskId) -> bool {
    let mapped = dag.task(source).is_some_and(|t| t.is_mapped());
    if mapped {
        match view.expansion(source) {
            Some(ExpansionOutcome::Expanded { length: 0 }) => return true,
            Some(ExpansionOutcome::Expanded { .. }) => {}
            _ => return false,
        }
    }
    let instances = view.instances(source);
    !instances.is_empty()
        && instances
            .iter()
            .all(|ti| ti.state == TaskInstanceState::Success)
}

/// Items of one map source, or the reason it cannot be mapped over.
async fn resolve_source<S: Storage>(
    storage: &Arc<S>,
    dag: &Dag,
    view: &RunView,
    run: &DagRun,
    source: &MapSource,
) -> Result<Result<Vec<Value>, String>, StorageError> {
    let arg = match source {
        MapSource::Literal(items) => return Ok(Ok(items.clone())),
        MapSource::XCom(arg) => arg,
    };
    let xcom = XComStore::new(Arc::clone(storage));

    if dag.task(&arg.task_id).is_some_and(|t| t.is_mapped()) {
        let values = match xcom
            .get_many_key(&run.dag_id, &run.run_id, &arg.task_id, &arg.key)
            .await
        {
            Ok(values) => values,
            Err(err) => return xcom_failure(arg, err),
        };
        let expected = view.instances(&arg.task_id).len();
        if values.len() != expected {
            return Ok(Err(format!(
                "mapped task '{}' pushed '{}' from {} of {} instances",
                arg.task_id,
                arg.key,
                values.len(),
                expected
            )));
        }
        return Ok(Ok(values.into_values().collect()));
    }

    let key = XComKey {
        dag_id: run.dag_id.clone(),
        run_id: run.run_id.clone(),
        task_id: arg.task_id.clone(),
        map_index: None,
        key: arg.key.clone(),
    };
    match xcom.get(&key).await {
        Ok(value) => Ok(as_collection(arg, value)),
        Err(err) => xcom_failure(arg, err),
    }
}

fn xcom_failure(
    arg: &XComArg,
    err: XComError,
) -> Result<Result<Vec<Value>, String>, StorageError> {
    match err {
        XComError::Storage(e) => Err(e),
        XComError::NotFound(key) => Ok(Err(format!("no xcom value at {}", key))),
        other => Ok(Err(format!("cannot read '{}': {}", arg.task_id, other))),
    }
}

/// Arrays map element-wise, objects over `[key, value]` pairs.
fn as_collection(arg: &XComArg, value: Value) -> Result<Vec<Value>, String> {
    match value {
        Value::Array(items) => Ok(items),
        Value::Object(entries) => Ok(entries
            .into_iter()
            .map(|(k, v)| Value::Array(vec![Value::String(k), v]))
            .collect()),
        other => Err(format!(
            "xcom '{}' of '{}' is {}, expected a list or an object",
            arg.key,
            arg.task_id,
            json_kind(&other)
        )),
    }
}

/// Every combination of the columns, last column varying fastest.
///
/// Returns None if the count overflows.
fn cartesian_product(columns: &[(&str, Vec<Value>)]) -> Option<Vec<BTreeMap<String, Value>>> {
    let total = columns
        .iter()
        .try_fold(1usize, |acc, (_, items)| acc.checked_mul(items.len()))?;

    let mut slices = Vec::with_capacity(total);
    for index in 0..total {
        let mut rest = index;
        let mut slice = BTreeMap::new();
        for (name, items) in columns.iter().rev() {
            let len = items.len();
            slice.insert(name.to_string(), items[rest % len].clone());
            rest /= len;
        }
        slices.push(slice);
    }
    Some(slices)
}
