//! Directed Acyclic Graph (DAG) of task definitions.
//!
//! A [`Dag`] is immutable once built. [`DagBuilder`] is the only way to create
//! one and validates the whole graph up front: a builder that fails
//! validation produces no DAG at all.

use std::cmp::Reverse;
use std::collections::{BTreeMap, BinaryHeap, HashMap, HashSet};
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

use super::pool::DEFAULT_POOL;
use super::retry::RetryPolicy;
use super::schedule::Schedule;
use super::task::ExecutionUnit;
use super::types::{DagId, TaskId};
use crate::xcom::RETURN_VALUE_KEY;

/// Errors that can occur when building DAGs.
#[derive(Debug, Error)]
pub enum DagError {
    /// A cycle was detected in the graph.
    #[error("cycle detected involving task: {0}")]
    CycleDetected(TaskId),

    /// A dependency references a task that doesn't exist.
    #[error("missing dependency: task '{from}' depends on non-existent task '{to}'")]
    MissingDependency { from: TaskId, to: TaskId },

    /// Two tasks share an id.
    #[error("duplicate task: {0}")]
    DuplicateTaskName(TaskId),

    /// A partial or mapped argument is not in the execution unit's signature.
    #[error("task '{task}' got unexpected mapping arguments: {}", names.join(", "))]
    UnknownMapArgument { task: TaskId, names: Vec<String> },

    /// A static argument is not in the execution unit's signature.
    #[error("task '{task}' got unexpected arguments: {}", names.join(", "))]
    UnknownArgument { task: TaskId, names: Vec<String> },

    /// The same argument name is given more than once.
    #[error("task '{task}' got argument '{name}' more than once")]
    DuplicateMapArgument { task: TaskId, name: String },

    /// Task not found in the DAG.
    #[error("task not found: {0}")]
    TaskNotFound(TaskId),
}

/// Rule deciding when a task may run, given the states of its upstreams.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TriggerRule {
    /// Every upstream succeeded.
    #[default]
    AllSuccess,
    /// Every upstream failed.
    AllFailed,
    /// Every upstream finished, whatever the outcome.
    AllDone,
    /// At least one upstream succeeded and all have finished.
    OneSuccess,
    /// At least one upstream failed and all have finished.
    OneFailed,
    /// No upstream failed; skips when every upstream was skipped.
    NoneFailed,
    /// No upstream failed and at least one succeeded.
    NoneFailedMinOneSuccess,
    /// No upstream was skipped.
    NoneSkipped,
    /// Run regardless of upstream state.
    Always,
}

impl TriggerRule {
    /// The rule's snake_case name.
    pub fn as_str(&self) -> &'static str {
        match self {
            TriggerRule::AllSuccess => "all_success",
            TriggerRule::AllFailed => "all_failed",
            TriggerRule::AllDone => "all_done",
            TriggerRule::OneSuccess => "one_success",
            TriggerRule::OneFailed => "one_failed",
            TriggerRule::NoneFailed => "none_failed",
            TriggerRule::NoneFailedMinOneSuccess => "none_failed_min_one_success",
            TriggerRule::NoneSkipped => "none_skipped",
            TriggerRule::Always => "always",
        }
    }
}

impl fmt::Display for TriggerRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Reference to an XCom value produced by another task.
///
/// Using an `XComArg` as an argument or map source makes the producing task
/// an upstream of the consumer.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct XComArg {
    pub task_id: TaskId,
    #[serde(default = "default_xcom_key")]
    pub key: String,
}

fn default_xcom_key() -> String {
    RETURN_VALUE_KEY.to_string()
}

impl XComArg {
    /// Reference the `return_value` of `task_id`.
    pub fn new(task_id: impl Into<TaskId>) -> Self {
        Self {
            task_id: task_id.into(),
            key: default_xcom_key(),
        }
    }

    /// Reference a named key instead of `return_value`.
    pub fn with_key(mut self, key: impl Into<String>) -> Self {
        self.key = key.into();
        self
    }
}

/// A static or partial argument value.
#[derive(Debug, Clone, PartialEq)]
pub enum ArgValue {
    /// A literal JSON value.
    Literal(Value),
    /// Resolved from XCom when the instance is dispatched.
    XCom(XComArg),
}

/// Where a mapped argument's collection comes from.
#[derive(Debug, Clone, PartialEq)]
pub enum MapSource {
    /// A literal collection, known when the DAG is built.
    Literal(Vec<Value>),
    /// An upstream's output, resolved at run time.
    XCom(XComArg),
}

impl MapSource {
    /// The upstream task this source reads from, if any.
    pub fn upstream(&self) -> Option<&TaskId> {
        match self {
            MapSource::Literal(_) => None,
            MapSource::XCom(arg) => Some(&arg.task_id),
        }
    }
}

/// Definition of one task in a DAG.
///
/// A task with at least one mapped argument is a mapped task: at run time it
/// expands into one instance per element of its map sources.
#[derive(Clone)]
pub struct TaskDefinition {
    pub task_id: TaskId,
    pub unit: Arc<dyn ExecutionUnit>,
    pub trigger_rule: TriggerRule,
    pub retry_policy: Option<RetryPolicy>,
    pub pool: String,
    pub pool_slots: u32,
    /// Passed through to the executor; not enforced by the scheduler.
    pub execution_timeout: Option<Duration>,
    /// Spread an object return value into one XCom entry per key.
    pub multiple_outputs: bool,
    /// Static arguments, or the partial arguments of a mapped task.
    pub arguments: BTreeMap<String, ArgValue>,
    /// Mapped arguments in declaration order.
    pub expand: Vec<(String, MapSource)>,
    pub depends_on: Vec<TaskId>,
}

impl TaskDefinition {
    /// Create a task with default settings.
    pub fn new(task_id: impl Into<TaskId>, unit: Arc<dyn ExecutionUnit>) -> Self {
        Self {
            task_id: task_id.into(),
            unit,
            trigger_rule: TriggerRule::default(),
            retry_policy: None,
            pool: DEFAULT_POOL.to_string(),
            pool_slots: 1,
            execution_timeout: None,
            multiple_outputs: false,
            arguments: BTreeMap::new(),
            expand: Vec::new(),
            depends_on: Vec::new(),
        }
    }

    /// Builder: add upstream tasks.
    pub fn depends_on(mut self, upstream: &[&str]) -> Self {
        self.depends_on.extend(upstream.iter().map(|id| TaskId::new(*id)));
        self
    }

    /// Builder: set the trigger rule.
    pub fn with_trigger_rule(mut self, rule: TriggerRule) -> Self {
        self.trigger_rule = rule;
        self
    }

    /// Builder: set the retry policy, overriding the DAG default.
    pub fn with_retry(mut self, policy: RetryPolicy) -> Self {
        self.retry_policy = Some(policy);
        self
    }

    /// Builder: run in `pool`, occupying `slots` slots.
    pub fn with_pool(mut self, pool: impl Into<String>, slots: u32) -> Self {
        self.pool = pool.into();
        self.pool_slots = slots.max(1);
        self
    }

    /// Builder: set the execution timeout handed to the executor.
    pub fn with_execution_timeout(mut self, timeout: Duration) -> Self {
        self.execution_timeout = Some(timeout);
        self
    }

    /// Builder: spread object return values into per-key XCom entries.
    pub fn with_multiple_outputs(mut self, enabled: bool) -> Self {
        self.multiple_outputs = enabled;
        self
    }

    /// Builder: add a literal argument (a partial argument for mapped tasks).
    pub fn with_arg(mut self, name: impl Into<String>, value: Value) -> Self {
        self.arguments.insert(name.into(), ArgValue::Literal(value));
        self
    }

    /// Builder: add an argument resolved from an upstream's XCom.
    pub fn with_xcom_arg(mut self, name: impl Into<String>, arg: XComArg) -> Self {
        self.arguments.insert(name.into(), ArgValue::XCom(arg));
        self
    }

    /// Builder: map `name` over `source`.
    pub fn expand(mut self, name: impl Into<String>, source: MapSource) -> Self {
        self.expand.push((name.into(), source));
        self
    }

    /// Returns true if this task expands at run time.
    pub fn is_mapped(&self) -> bool {
        !self.expand.is_empty()
    }

    /// Upstream tasks referenced through XCom arguments or map sources.
    fn xcom_upstreams(&self) -> impl Iterator<Item = &TaskId> {
        let from_args = self.arguments.values().filter_map(|arg| match arg {
            ArgValue::XCom(xcom) => Some(&xcom.task_id),
            ArgValue::Literal(_) => None,
        });
        let from_sources = self.expand.iter().filter_map(|(_, source)| source.upstream());
        from_args.chain(from_sources)
    }
}

impl fmt::Debug for TaskDefinition {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TaskDefinition")
            .field("task_id", &self.task_id)
            .field("unit", &self.unit.name())
            .field("trigger_rule", &self.trigger_rule)
            .field("pool", &self.pool)
            .field("mapped", &self.is_mapped())
            .finish()
    }
}

/// A validated, immutable DAG.
#[derive(Clone)]
pub struct Dag {
    id: DagId,
    description: Option<String>,
    schedule: Option<Schedule>,
    max_active_runs: usize,
    max_active_tasks: usize,
    default_retry: RetryPolicy,

    /// Tasks in declaration order.
    tasks: Vec<TaskDefinition>,
    index: HashMap<TaskId, usize>,
    upstream: HashMap<TaskId, Vec<TaskId>>,
    downstream: HashMap<TaskId, Vec<TaskId>>,
    order: Vec<TaskId>,
}

impl Dag {
    /// Get the DAG ID.
    pub fn id(&self) -> &DagId {
        &self.id
    }

    /// Human-readable description.
    pub fn description(&self) -> Option<&str> {
        self.description.as_deref()
    }

    /// The schedule, if runs are created automatically.
    pub fn schedule(&self) -> Option<&Schedule> {
        self.schedule.as_ref()
    }

    /// Maximum number of concurrently running runs.
    pub fn max_active_runs(&self) -> usize {
        self.max_active_runs
    }

    /// Maximum number of queued or running instances across all runs.
    pub fn max_active_tasks(&self) -> usize {
        self.max_active_tasks
    }

    /// Check if the DAG is empty.
    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    /// Get the number of tasks in the DAG.
    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    /// Tasks in declaration order.
    pub fn tasks(&self) -> impl Iterator<Item = &TaskDefinition> {
        self.tasks.iter()
    }

    /// Get a task definition by id.
    pub fn task(&self, id: &TaskId) -> Option<&TaskDefinition> {
        self.index.get(id).map(|&i| &self.tasks[i])
    }

    /// Position of a task in declaration order.
    pub fn declaration_index(&self, id: &TaskId) -> Option<usize> {
        self.index.get(id).copied()
    }

    /// Upstream tasks, explicit dependencies first, then XCom references.
    pub fn upstream(&self, id: &TaskId) -> &[TaskId] {
        self.upstream.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Downstream tasks in declaration order.
    pub fn downstream(&self, id: &TaskId) -> &[TaskId] {
        self.downstream.get(id).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Every task exactly once, upstreams before downstreams, ties broken by
    /// declaration order.
    pub fn topological_order(&self) -> &[TaskId] {
        &self.order
    }

    /// Effective retry policy of a task.
    pub fn retry_policy(&self, id: &TaskId) -> &RetryPolicy {
        self.task(id)
            .and_then(|task| task.retry_policy.as_ref())
            .unwrap_or(&self.default_retry)
    }

    /// Task ids in declaration order.
    pub fn task_ids(&self) -> Vec<TaskId> {
        self.tasks.iter().map(|t| t.task_id.clone()).collect()
    }
}

impl fmt::Debug for Dag {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Dag")
            .field("id", &self.id)
            .field("tasks", &self.order)
            .finish()
    }
}

const DEFAULT_MAX_ACTIVE_RUNS: usize = 16;
const DEFAULT_MAX_ACTIVE_TASKS: usize = 16;

/// Builder for constructing DAGs fluently.
///
/// Errors from individual calls are remembered and the first one is returned
/// by [`build`](Self::build).
pub struct DagBuilder {
    id: DagId,
    description: Option<String>,
    schedule: Option<Schedule>,
    max_active_runs: usize,
    max_active_tasks: usize,
    default_retry: RetryPolicy,
    tasks: Vec<TaskDefinition>,
    /// Group prefix each task was declared under (empty for the root).
    scopes: Vec<String>,
    group_stack: Vec<String>,
    extra_edges: Vec<(TaskId, TaskId)>,
    error: Option<DagError>,
}

impl DagBuilder {
    /// Create a new DAG builder.
    pub fn new(id: impl Into<DagId>) -> Self {
        Self {
            id: id.into(),
            description: None,
            schedule: None,
            max_active_runs: DEFAULT_MAX_ACTIVE_RUNS,
            max_active_tasks: DEFAULT_MAX_ACTIVE_TASKS,
            default_retry: RetryPolicy::default(),
            tasks: Vec::new(),
            scopes: Vec::new(),
            group_stack: Vec::new(),
            extra_edges: Vec::new(),
            error: None,
        }
    }

    /// Set a description.
    pub fn with_description(mut self, description: impl Into<String>) -> Self {
        self.description = Some(description.into());
        self
    }

    /// Create runs automatically on `schedule`.
    pub fn with_schedule(mut self, schedule: Schedule) -> Self {
        self.schedule = Some(schedule);
        self
    }

    /// Limit concurrently running runs.
    pub fn with_max_active_runs(mut self, max: usize) -> Self {
        self.max_active_runs = max.max(1);
        self
    }

    /// Limit queued plus running instances across all runs.
    pub fn with_max_active_tasks(mut self, max: usize) -> Self {
        self.max_active_tasks = max.max(1);
        self
    }

    /// Retry policy for tasks that do not set their own.
    pub fn with_default_retry(mut self, policy: RetryPolicy) -> Self {
        self.default_retry = policy;
        self
    }

    /// Add a task. Inside a group the id is prefixed with the group path.
    pub fn add_task(mut self, mut task: TaskDefinition) -> Self {
        task.task_id = self.scoped_id(task.task_id.as_str());
        if self.contains(&task.task_id) {
            self.fail(DagError::DuplicateTaskName(task.task_id));
            return self;
        }
        self.push(task);
        self
    }

    /// Add a task, renaming it `id__1`, `id__2`, ... if the id is taken.
    pub fn add_task_auto_id(mut self, mut task: TaskDefinition) -> Self {
        let base = self.scoped_id(task.task_id.as_str());
        let mut candidate = base.clone();
        let mut suffix = 0;
        while self.contains(&candidate) {
            suffix += 1;
            candidate = TaskId::new(format!("{}__{}", base, suffix));
        }
        task.task_id = candidate;
        self.push(task);
        self
    }

    /// Declare tasks inside a named group. Group ids nest with `.`.
    pub fn group<F>(mut self, name: &str, build: F) -> Self
    where
        F: FnOnce(DagBuilder) -> DagBuilder,
    {
        self.group_stack.push(name.to_string());
        let mut builder = build(self);
        builder.group_stack.pop();
        builder
    }

    /// Add a dependency: `downstream` runs after `upstream`.
    pub fn add_dependency(mut self, downstream: &str, upstream: &str) -> Self {
        self.extra_edges
            .push((self.scoped_id(downstream), self.scoped_id(upstream)));
        self
    }

    /// Validate and build the DAG.
    pub fn build(self) -> Result<Dag, DagError> {
        if let Some(err) = self.error {
            return Err(err);
        }

        let index: HashMap<TaskId, usize> = self
            .tasks
            .iter()
            .enumerate()
            .map(|(i, t)| (t.task_id.clone(), i))
            .collect();

        let mut tasks = self.tasks;
        let mut upstream: HashMap<TaskId, Vec<TaskId>> = HashMap::new();

        for (i, task) in tasks.iter_mut().enumerate() {
            let scope = &self.scopes[i];
            task.depends_on = task
                .depends_on
                .iter()
                .map(|dep| resolve(&index, scope, dep))
                .collect();
            for arg in task.arguments.values_mut() {
                if let ArgValue::XCom(xcom) = arg {
                    xcom.task_id = resolve(&index, scope, &xcom.task_id);
                }
            }
            for (_, source) in task.expand.iter_mut() {
                if let MapSource::XCom(xcom) = source {
                    xcom.task_id = resolve(&index, scope, &xcom.task_id);
                }
            }

            validate_arguments(task)?;

            let mut seen = HashSet::new();
            let mut ups = Vec::new();
            for dep in task.depends_on.iter().chain(task.xcom_upstreams()) {
                if !index.contains_key(dep) {
                    return Err(DagError::MissingDependency {
                        from: task.task_id.clone(),
                        to: dep.clone(),
                    });
                }
                if seen.insert(dep.clone()) {
                    ups.push(dep.clone());
                }
            }
            upstream.insert(task.task_id.clone(), ups);
        }

        for (from, to) in self.extra_edges {
            if !index.contains_key(&from) {
                return Err(DagError::TaskNotFound(from));
            }
            if !index.contains_key(&to) {
                return Err(DagError::MissingDependency { from, to });
            }
            let ups = upstream.entry(from).or_default();
            if !ups.contains(&to) {
                ups.push(to);
            }
        }

        let mut downstream: HashMap<TaskId, Vec<TaskId>> = HashMap::new();
        for task in &tasks {
            for up in &upstream[&task.task_id] {
                downstream
                    .entry(up.clone())
                    .or_default()
                    .push(task.task_id.clone());
            }
        }

        let order = topological_sort(&tasks, &index, &upstream, &downstream)?;

        Ok(Dag {
            id: self.id,
            description: self.description,
            schedule: self.schedule,
            max_active_runs: self.max_active_runs,
            max_active_tasks: self.max_active_tasks,
            default_retry: self.default_retry,
            tasks,
            index,
            upstream,
            downstream,
            order,
        })
    }

    fn scoped_id(&self, id: &str) -> TaskId {
        if self.group_stack.is_empty() {
            TaskId::new(id)
        } else {
            TaskId::new(format!("{}.{}", self.group_stack.join("."), id))
        }
    }

    fn contains(&self, id: &TaskId) -> bool {
        self.tasks.iter().any(|t| &t.task_id == id)
    }

    fn push(&mut self, task: TaskDefinition) {
        self.scopes.push(self.group_stack.join("."));
        self.tasks.push(task);
    }

    fn fail(&mut self, err: DagError) {
        if self.error.is_none() {
            self.error = Some(err);
        }
    }
}

/// Resolve a reference made inside group `scope`: the innermost group that
/// declares the name wins, then the root.
fn resolve(index: &HashMap<TaskId, usize>, scope: &str, name: &TaskId) -> TaskId {
    let mut prefix = scope;
    while !prefix.is_empty() {
        let candidate = TaskId::new(format!("{}.{}", prefix, name));
        if index.contains_key(&candidate) {
            return candidate;
        }
        prefix = prefix.rsplit_once('.').map(|(head, _)| head).unwrap_or("");
    }
    name.clone()
}

fn validate_arguments(task: &TaskDefinition) -> Result<(), DagError> {
    let mut seen: HashSet<&str> = task.arguments.keys().map(String::as_str).collect();
    for (name, _) in &task.expand {
        if !seen.insert(name.as_str()) {
            return Err(DagError::DuplicateMapArgument {
                task: task.task_id.clone(),
                name: name.clone(),
            });
        }
    }

    let signature = task.unit.signature();
    let mut unknown: Vec<String> = task
        .arguments
        .keys()
        .chain(task.expand.iter().map(|(name, _)| name))
        .filter(|name| !signature.accepts(name))
        .cloned()
        .collect();

    if unknown.is_empty() {
        return Ok(());
    }
    unknown.sort();
    if task.is_mapped() {
        Err(DagError::UnknownMapArgument {
            task: task.task_id.clone(),
            names: unknown,
        })
    } else {
        Err(DagError::UnknownArgument {
            task: task.task_id.clone(),
            names: unknown,
        })
    }
}

/// Kahn's algorithm with a min-heap on declaration index so ties are stable.
fn topological_sort(
    tasks: &[TaskDefinition],
    index: &HashMap<TaskId, usize>,
    upstream: &HashMap<TaskId, Vec<TaskId>>,
    downstream: &HashMap<TaskId, Vec<TaskId>>,
) -> Result<Vec<TaskId>, DagError> {
    let mut in_degree: Vec<usize> = tasks
        .iter()
        .map(|t| upstream.get(&t.task_id).map_or(0, Vec::len))
        .collect();

    let mut ready: BinaryHeap<Reverse<usize>> = in_degree
        .iter()
        .enumerate()
        .filter(|(_, degree)| **degree == 0)
        .map(|(i, _)| Reverse(i))
        .collect();

    let mut order = Vec::with_capacity(tasks.len());
    while let Some(Reverse(i)) = ready.pop() {
        let id = &tasks[i].task_id;
        order.push(id.clone());
        for next in downstream.get(id).into_iter().flatten() {
            let j = index[next];
            in_degree[j] -= 1;
            if in_degree[j] == 0 {
                ready.push(Reverse(j));
            }
        }
    }

    if order.len() != tasks.len() {
        let stuck = in_degree
            .iter()
            .position(|degree| *degree > 0)
            .map(|i| tasks[i].task_id.clone())
            .unwrap_or_else(|| tasks[0].task_id.clone());
        return Err(DagError::CycleDetected(stuck));
    }

    Ok(order)
}
