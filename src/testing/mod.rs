//! Testing utilities for users of the tributary library.
//!
//! - [`FakeExecutor`]: records commands and emits scripted events
//! - [`ManualClock`]: a clock that only moves when told to
//! - [`FlakyUnit`]: an execution unit that fails N times then succeeds
//! - [`ConstUnit`]: an execution unit returning a fixed value
//! - [`RecordingHandler`]: an event handler that keeps every event
//! - [`drive_until_terminal`]: runs scheduler passes until a run finishes

use async_trait::async_trait;
use chrono::{DateTime, TimeDelta, Utc};
use serde_json::Value;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration;
use tokio::sync::RwLock;

use crate::core::clock::Clock;
use crate::core::context::ExecutionContext;
use crate::core::instance::TaskInstanceState;
use crate::core::run::DagRun;
use crate::core::task::{ExecutionUnit, Signature, TaskError};
use crate::core::types::{DagId, RunId, TaskId, TaskInstanceKey};
use crate::events::{Event, EventHandler};
use crate::execution::{ExecutionCommand, Executor, ExecutorEvent, SubmitOutcome};
use crate::scheduler::{Scheduler, SchedulerError};
use crate::storage::Storage;

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

/// An executor that never runs anything on its own.
///
/// In manual mode commands are only recorded; tests script the outcome with
/// [`start`](Self::start), [`complete`](Self::complete) and
/// [`fail`](Self::fail). In inline mode each accepted command runs to
/// completion inside `submit` and its events are ready for the next drain.
///
/// ```
/// use tributary::testing::FakeExecutor;
///
/// let executor = FakeExecutor::new();
/// executor.reject_with("no capacity");
/// assert!(executor.submitted().is_empty());
/// ```
#[derive(Default)]
pub struct FakeExecutor {
    inline: bool,
    reject: Mutex<Option<String>>,
    submitted: Mutex<Vec<ExecutionCommand>>,
    events: Mutex<VecDeque<ExecutorEvent>>,
    cancelled: Mutex<Vec<TaskInstanceKey>>,
}

impl FakeExecutor {
    /// An executor whose events are scripted by the test.
    pub fn new() -> Self {
        Self::default()
    }

    /// An executor that runs every accepted command immediately.
    pub fn inline() -> Self {
        Self {
            inline: true,
            ..Self::default()
        }
    }

    /// Reject every submission with `reason` until [`accept_all`](Self::accept_all).
    pub fn reject_with(&self, reason: impl Into<String>) {
        *lock(&self.reject) = Some(reason.into());
    }

    /// Accept submissions again.
    pub fn accept_all(&self) {
        *lock(&self.reject) = None;
    }

    /// Every accepted command so far.
    pub fn submitted(&self) -> Vec<ExecutionCommand> {
        lock(&self.submitted).clone()
    }

    /// Accepted commands since the last call.
    pub fn take_submitted(&self) -> Vec<ExecutionCommand> {
        std::mem::take(&mut *lock(&self.submitted))
    }

    /// Keys passed to `cancel`, in call order.
    pub fn cancelled(&self) -> Vec<TaskInstanceKey> {
        lock(&self.cancelled).clone()
    }

    /// Queue an arbitrary event.
    pub fn push_event(&self, event: ExecutorEvent) {
        lock(&self.events).push_back(event);
    }

    /// Report that `command`'s try started.
    pub fn start(&self, command: &ExecutionCommand) {
        self.push_event(ExecutorEvent::Started {
            key: command.key.clone(),
            try_number: command.try_number,
        });
    }

    /// Report a heartbeat for `command`'s try.
    pub fn heartbeat(&self, command: &ExecutionCommand) {
        self.push_event(ExecutorEvent::Heartbeat {
            key: command.key.clone(),
            try_number: command.try_number,
        });
    }

    /// Report that `command`'s try succeeded with `return_value`.
    pub fn complete(&self, command: &ExecutionCommand, return_value: Option<Value>) {
        self.push_event(ExecutorEvent::Completed {
            key: command.key.clone(),
            try_number: command.try_number,
            return_value,
            outputs: BTreeMap::new(),
        });
    }

    /// Report that `command`'s try failed.
    pub fn fail(&self, command: &ExecutionCommand, reason: &str, transient: bool) {
        self.push_event(ExecutorEvent::Failed {
            key: command.key.clone(),
            try_number: command.try_number,
            reason: reason.to_string(),
            transient,
        });
    }

    async fn run_inline(&self, command: &ExecutionCommand) {
        self.start(command);
        let ctx = command.context();
        let event = match command.unit.execute(&ctx).await {
            Ok(return_value) => ExecutorEvent::Completed {
                key: command.key.clone(),
                try_number: command.try_number,
                return_value,
                outputs: ctx.take_pushed().unwrap_or_default(),
            },
            Err(err) => ExecutorEvent::Failed {
                key: command.key.clone(),
                try_number: command.try_number,
                reason: err.to_string(),
                transient: err.is_transient(),
            },
        };
        self.push_event(event);
    }
}

#[async_trait]
impl Executor for FakeExecutor {
    async fn submit(&self, command: ExecutionCommand) -> SubmitOutcome {
        let rejection = lock(&self.reject).clone();
        if let Some(reason) = rejection {
            return SubmitOutcome::Rejected(reason);
        }
        if self.inline {
            self.run_inline(&command).await;
        }
        lock(&self.submitted).push(command);
        SubmitOutcome::Accepted
    }

    fn drain_events(&self) -> Vec<ExecutorEvent> {
        lock(&self.events).drain(..).collect()
    }

    async fn cancel(&self, key: &TaskInstanceKey) -> bool {
        lock(&self.cancelled).push(key.clone());
        true
    }
}

/// A clock that only moves when the test moves it.
#[derive(Debug)]
pub struct ManualClock {
    now: Mutex<DateTime<Utc>>,
}

impl ManualClock {
    /// Create a clock frozen at `start`.
    pub fn new(start: DateTime<Utc>) -> Self {
        Self {
            now: Mutex::new(start),
        }
    }

    /// Jump to `now`.
    pub fn set(&self, now: DateTime<Utc>) {
        *lock(&self.now) = now;
    }

    /// Move forward by `by`.
    pub fn advance(&self, by: Duration) {
        let mut now = lock(&self.now);
        let by = TimeDelta::from_std(by).unwrap_or(TimeDelta::MAX);
        *now = now.checked_add_signed(by).unwrap_or(DateTime::<Utc>::MAX_UTC);
    }
}

impl Clock for ManualClock {
    fn now(&self) -> DateTime<Utc> {
        *lock(&self.now)
    }
}

/// A unit that fails a fixed number of times, then succeeds.
///
/// ```
/// use tributary::testing::FlakyUnit;
///
/// // Fails twice, succeeds on the third try.
/// let unit = FlakyUnit::new("flaky", 2);
/// assert_eq!(unit.call_count(), 0);
/// ```
#[derive(Debug)]
pub struct FlakyUnit {
    name: String,
    failures: u32,
    transient: bool,
    value: Option<Value>,
    calls: AtomicU32,
}

impl FlakyUnit {
    /// Create a unit that fails `failures` times.
    pub fn new(name: impl Into<String>, failures: u32) -> Self {
        Self {
            name: name.into(),
            failures,
            transient: false,
            value: None,
            calls: AtomicU32::new(0),
        }
    }

    /// Report the failures as transient.
    pub fn transient(mut self) -> Self {
        self.transient = true;
        self
    }

    /// Return `value` once the unit succeeds.
    pub fn returning(mut self, value: Value) -> Self {
        self.value = Some(value);
        self
    }

    /// Number of times the unit has executed.
    pub fn call_count(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl ExecutionUnit for FlakyUnit {
    fn name(&self) -> &str {
        &self.name
    }

    async fn execute(&self, _ctx: &ExecutionContext) -> Result<Option<Value>, TaskError> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) + 1;
        if call <= self.failures {
            let message = format!("failure {} of {}", call, self.failures);
            return Err(if self.transient {
                TaskError::Transient(message)
            } else {
                TaskError::ExecutionFailed(message)
            });
        }
        Ok(self.value.clone())
    }
}

/// A unit that always returns the same value.
#[derive(Debug, Clone)]
pub struct ConstUnit {
    name: String,
    value: Option<Value>,
    signature: Signature,
}

impl ConstUnit {
    /// Return `value` on every try.
    pub fn new(name: impl Into<String>, value: Value) -> Self {
        Self {
            name: name.into(),
            value: Some(value),
            signature: Signature::Any,
        }
    }

    /// Succeed without a return value.
    pub fn empty(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            value: None,
            signature: Signature::Any,
        }
    }

    /// Restrict the accepted argument names.
    pub fn with_params<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.signature = Signature::params(names);
        self
    }
}

#[async_trait]
impl ExecutionUnit for ConstUnit {
    fn name(&self) -> &str {
        &self.name
    }

    fn signature(&self) -> Signature {
        self.signature.clone()
    }

    async fn execute(&self, _ctx: &ExecutionContext) -> Result<Option<Value>, TaskError> {
        Ok(self.value.clone())
    }
}

/// Keeps every event it receives.
#[derive(Default)]
pub struct RecordingHandler {
    events: RwLock<Vec<Event>>,
}

impl RecordingHandler {
    pub fn new() -> Self {
        Self::default()
    }

    /// Every event received so far, in delivery order.
    pub async fn events(&self) -> Vec<Event> {
        self.events.read().await.clone()
    }

    /// Target states of every transition of `task_id`, across runs and map
    /// indices.
    pub async fn transitions_of(&self, task_id: &TaskId) -> Vec<TaskInstanceState> {
        self.events
            .read()
            .await
            .iter()
            .filter_map(|event| match event {
                Event::TaskStateChanged { key, to, .. } if &key.task_id == task_id => Some(*to),
                _ => None,
            })
            .collect()
    }
}

#[async_trait]
impl EventHandler for RecordingHandler {
    async fn handle(&self, event: &Event) {
        self.events.write().await.push(event.clone());
    }
}

/// Run scheduler passes until the run reaches a terminal state or
/// `max_passes` passes have run. Returns the run as last stored.
pub async fn drive_until_terminal<S, E>(
    scheduler: &Scheduler<S, E>,
    dag_id: &DagId,
    run_id: &RunId,
    max_passes: usize,
) -> Result<DagRun, SchedulerError>
where
    S: Storage + 'static,
    E: Executor + 'static,
{
    for _ in 0..max_passes {
        scheduler.run_pass().await;
        let run = scheduler.storage().get_run(dag_id, run_id).await?;
        if run.state.is_terminal() {
            return Ok(run);
        }
        tokio::task::yield_now().await;
    }
    Ok(scheduler.storage().get_run(dag_id, run_id).await?)
}
