//! Snapshot of one run's task instances and expansion records.

use std::collections::HashMap;

use super::deps::UpstreamSummary;
use crate::core::dag::Dag;
use crate::core::instance::TaskInstance;
use crate::core::types::{DagId, RunId, TaskId};
use crate::storage::{ExpansionOutcome, Storage, StorageError};

/// Instances of a run grouped by task, plus the expansion outcome of every
/// mapped task that has expanded.
#[derive(Debug, Clone, Default)]
pub struct RunView {
    by_task: HashMap<TaskId, Vec<TaskInstance>>,
    expansions: HashMap<TaskId, ExpansionOutcome>,
}

impl RunView {
    /// Read a run's instances and expansions from storage.
    pub async fn load<S: Storage + ?Sized>(
        storage: &S,
        dag_id: &DagId,
        run_id: &RunId,
    ) -> Result<Self, StorageError> {
        let instances = storage.list_instances(dag_id, run_id).await?;
        let expansions = storage.list_expansions(dag_id, run_id).await?;

        let mut view = RunView::default();
        for instance in instances {
            view.by_task
                .entry(instance.key.task_id.clone())
                .or_default()
                .push(instance);
        }
        for expansion in expansions {
            view.expansions.insert(expansion.task_id, expansion.outcome);
        }
        Ok(view)
    }

    /// Instances of one task, ordered by map index.
    pub fn instances(&self, task_id: &TaskId) -> &[TaskInstance] {
        self.by_task.get(task_id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Every instance in the run.
    pub fn all(&self) -> impl Iterator<Item = &TaskInstance> {
        self.by_task.values().flatten()
    }

    /// Expansion outcome of a mapped task, if it has expanded.
    pub fn expansion(&self, task_id: &TaskId) -> Option<ExpansionOutcome> {
        self.expansions.get(task_id).copied()
    }

    /// Replace the cached copy of an instance after a successful write.
    pub fn update(&mut self, instance: TaskInstance) {
        let slot = self
            .by_task
            .entry(instance.key.task_id.clone())
            .or_default();
        match slot.iter_mut().find(|ti| ti.key == instance.key) {
            Some(existing) => *existing = instance,
            None => slot.push(instance),
        }
    }

    /// Add one task's instances to `summary`.
    ///
    /// A mapped task that has not expanded counts as one unfinished
    /// upstream; one that expanded to nothing counts as one success.
    pub fn add_task(&self, dag: &Dag, task_id: &TaskId, summary: &mut UpstreamSummary) {
        let mapped = dag.task(task_id).is_some_and(|t| t.is_mapped());
        if mapped {
            match self.expansion(task_id) {
                None => {
                    summary.record_unexpanded();
                    return;
                }
                Some(ExpansionOutcome::Expanded { length: 0 }) => {
                    summary.record_empty_expansion();
                    return;
                }
                Some(_) => {}
            }
        }

        let instances = self.instances(task_id);
        if instances.is_empty() {
            summary.record_unexpanded();
        }
        for instance in instances {
            summary.record(instance.state);
        }
    }

    /// Summary of every upstream of `task_id`.
    pub fn upstream_summary(&self, dag: &Dag, task_id: &TaskId) -> UpstreamSummary {
        let mut summary = UpstreamSummary::default();
        for upstream in dag.upstream(task_id) {
            self.add_task(dag, upstream, &mut summary);
        }
        summary
    }
}
