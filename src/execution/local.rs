//! In-process executor.
//!
//! [`LocalExecutor`] runs each command as a tokio task. Concurrency is
//! limited with a semaphore; commands beyond the limit wait for a permit
//! without blocking `submit`. Events are buffered in an unbounded channel
//! until the scheduler drains them. A unit that panics is reported as a
//! failed try.

use async_trait::async_trait;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{Semaphore, mpsc};
use tokio::task::{AbortHandle, JoinError, JoinHandle};
use tracing::debug;

use super::{ExecutionCommand, Executor, ExecutorEvent, SubmitOutcome};
use crate::core::task::TaskError;
use crate::core::types::TaskInstanceKey;

const DEFAULT_HEARTBEAT_INTERVAL: Duration = Duration::from_secs(5);
const DEFAULT_MAX_PENDING: usize = 1024;
const MIN_HEARTBEAT_INTERVAL: Duration = Duration::from_millis(1);

type RunningMap = HashMap<TaskInstanceKey, (u32, JoinHandle<()>)>;

/// Executor running tasks on the current tokio runtime.
pub struct LocalExecutor {
    /// Maximum number of concurrent task executions.
    max_concurrency: usize,
    semaphore: Arc<Semaphore>,
    heartbeat_interval: Duration,
    /// Upper bound on accepted but unfinished commands.
    max_pending: usize,
    accepting: AtomicBool,
    events_tx: mpsc::UnboundedSender<ExecutorEvent>,
    events_rx: Mutex<mpsc::UnboundedReceiver<ExecutorEvent>>,
    running: Arc<Mutex<RunningMap>>,
}

impl LocalExecutor {
    /// Create an executor running at most `max_concurrency` tasks at once.
    pub fn new(max_concurrency: usize) -> Self {
        let max_concurrency = max_concurrency.max(1);
        let (events_tx, events_rx) = mpsc::unbounded_channel();
        Self {
            max_concurrency,
            semaphore: Arc::new(Semaphore::new(max_concurrency)),
            heartbeat_interval: DEFAULT_HEARTBEAT_INTERVAL,
            max_pending: DEFAULT_MAX_PENDING,
            accepting: AtomicBool::new(true),
            events_tx,
            events_rx: Mutex::new(events_rx),
            running: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// Builder: how often a running task reports a heartbeat.
    pub fn with_heartbeat_interval(mut self, interval: Duration) -> Self {
        self.heartbeat_interval = interval.max(MIN_HEARTBEAT_INTERVAL);
        self
    }

    /// Builder: reject submissions once this many commands are unfinished.
    pub fn with_max_pending(mut self, max_pending: usize) -> Self {
        self.max_pending = max_pending;
        self
    }

    /// Get the maximum concurrency limit.
    pub fn max_concurrency(&self) -> usize {
        self.max_concurrency
    }

    /// Get the number of available permits (slots for concurrent execution).
    pub fn available_permits(&self) -> usize {
        self.semaphore.available_permits()
    }

    /// Number of accepted commands that have not finished.
    pub fn active_count(&self) -> usize {
        self.running.lock().map(|running| running.len()).unwrap_or(0)
    }

    /// Stop accepting new commands. Running tasks finish normally.
    pub fn close(&self) {
        self.accepting.store(false, Ordering::SeqCst);
    }
}

impl Default for LocalExecutor {
    fn default() -> Self {
        Self::new(4)
    }
}

#[async_trait]
impl Executor for LocalExecutor {
    async fn submit(&self, command: ExecutionCommand) -> SubmitOutcome {
        if !self.accepting.load(Ordering::SeqCst) {
            return SubmitOutcome::Rejected("executor is shutting down".to_string());
        }

        let Ok(mut running) = self.running.lock() else {
            return SubmitOutcome::Rejected("executor state poisoned".to_string());
        };
        if running.len() >= self.max_pending {
            return SubmitOutcome::Rejected(format!(
                "executor has {} pending commands",
                running.len()
            ));
        }

        let key = command.key.clone();
        let try_number = command.try_number;
        let semaphore = Arc::clone(&self.semaphore);
        let events = self.events_tx.clone();
        let registry = Arc::clone(&self.running);
        let heartbeat_interval = self.heartbeat_interval;

        // The registry lock is held until the handle is stored, so the task
        // cannot deregister itself before it was registered.
        let handle = tokio::spawn(async move {
            let key = command.key.clone();
            let try_number = command.try_number;
            if let Ok(_permit) = semaphore.acquire_owned().await {
                run_try(command, &events, heartbeat_interval).await;
            }

            if let Ok(mut running) = registry.lock()
                && running.get(&key).is_some_and(|(t, _)| *t == try_number)
            {
                running.remove(&key);
            }
        });

        debug!(instance = %key, try_number, "command accepted");
        if let Some((_, previous)) = running.insert(key, (try_number, handle)) {
            previous.abort();
        }
        SubmitOutcome::Accepted
    }

    fn drain_events(&self) -> Vec<ExecutorEvent> {
        let Ok(mut rx) = self.events_rx.lock() else {
            return Vec::new();
        };
        let mut events = Vec::new();
        while let Ok(event) = rx.try_recv() {
            events.push(event);
        }
        events
    }

    async fn cancel(&self, key: &TaskInstanceKey) -> bool {
        let removed = match self.running.lock() {
            Ok(mut running) => running.remove(key),
            Err(_) => None,
        };
        match removed {
            Some((try_number, handle)) => {
                handle.abort();
                debug!(instance = %key, try_number, "command cancelled");
                true
            }
            None => false,
        }
    }
}

/// Execute one try, reporting start, heartbeats and the outcome.
async fn run_try(
    command: ExecutionCommand,
    events: &mpsc::UnboundedSender<ExecutorEvent>,
    heartbeat_interval: Duration,
) {
    let key = command.key.clone();
    let try_number = command.try_number;
    let ctx = Arc::new(command.context());

    let _ = events.send(ExecutorEvent::Started {
        key: key.clone(),
        try_number,
    });

    // The unit runs on its own task so a panic surfaces as a JoinError.
    let unit = Arc::clone(&command.unit);
    let unit_ctx = Arc::clone(&ctx);
    let mut unit_task = tokio::spawn(async move { unit.execute(&unit_ctx).await });
    let _abort_unit = AbortOnDrop(unit_task.abort_handle());

    let work = async {
        let joined = match command.execution_timeout {
            Some(limit) => match tokio::time::timeout(limit, &mut unit_task).await {
                Ok(joined) => joined,
                Err(_) => return Err(TaskError::Timeout(limit)),
            },
            None => (&mut unit_task).await,
        };
        joined.unwrap_or_else(|err| Err(join_failure(err)))
    };
    tokio::pin!(work);

    let mut ticker = tokio::time::interval(heartbeat_interval);
    ticker.tick().await;

    let result = loop {
        tokio::select! {
            result = &mut work => break result,
            _ = ticker.tick() => {
                let _ = events.send(ExecutorEvent::Heartbeat {
                    key: key.clone(),
                    try_number,
                });
            }
        }
    };

    let event = match result.and_then(|value| Ok((value, ctx.take_pushed()?))) {
        Ok((return_value, outputs)) => ExecutorEvent::Completed {
            key,
            try_number,
            return_value,
            outputs,
        },
        Err(err) => ExecutorEvent::Failed {
            key,
            try_number,
            reason: err.to_string(),
            transient: err.is_transient(),
        },
    };
    let _ = events.send(event);
}

/// Aborts the wrapped task when dropped, e.g. when the try is cancelled.
struct AbortOnDrop(AbortHandle);

impl Drop for AbortOnDrop {
    fn drop(&mut self) {
        self.0.abort();
    }
}

fn join_failure(err: JoinError) -> TaskError {
    if !err.is_panic() {
        return TaskError::ExecutionFailed(format!("task aborted: {}", err));
    }
    let payload = err.into_panic();
    let message = payload
        .downcast_ref::<&str>()
        .map(|s| s.to_string())
        .or_else(|| payload.downcast_ref::<String>().cloned())
        .unwrap_or_else(|| "unknown panic".to_string());
    TaskError::ExecutionFailed(format!("task panicked: {}", message))
}
