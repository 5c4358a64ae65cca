//! State transition events and event handling.
//!
//! Every task-instance and run transition the scheduler commits is emitted
//! on an [`EventBus`], giving handlers an ordered view of each instance's
//! lifecycle.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio::sync::RwLock;

use crate::core::instance::TaskInstanceState;
use crate::core::run::RunState;
use crate::core::types::{DagId, RunId, TaskId, TaskInstanceKey};

/// Events emitted by the scheduler.
#[derive(Debug, Clone, PartialEq)]
pub enum Event {
    /// A task instance changed state.
    TaskStateChanged {
        key: TaskInstanceKey,
        from: TaskInstanceState,
        to: TaskInstanceState,
        try_number: u32,
        reason: Option<String>,
        timestamp: DateTime<Utc>,
    },

    /// A DAG run changed state.
    RunStateChanged {
        dag_id: DagId,
        run_id: RunId,
        from: RunState,
        to: RunState,
        timestamp: DateTime<Utc>,
    },

    /// A mapped task was expanded.
    TaskExpanded {
        dag_id: DagId,
        run_id: RunId,
        task_id: TaskId,
        length: usize,
        timestamp: DateTime<Utc>,
    },

    /// A mapped task's sources finished but cannot be mapped over. The task
    /// stays unexpanded.
    ExpansionBlocked {
        dag_id: DagId,
        run_id: RunId,
        task_id: TaskId,
        reason: String,
        timestamp: DateTime<Utc>,
    },
}

impl Event {
    /// Get the timestamp of the event.
    pub fn timestamp(&self) -> DateTime<Utc> {
        match self {
            Event::TaskStateChanged { timestamp, .. } => *timestamp,
            Event::RunStateChanged { timestamp, .. } => *timestamp,
            Event::TaskExpanded { timestamp, .. } => *timestamp,
            Event::ExpansionBlocked { timestamp, .. } => *timestamp,
        }
    }

    /// Create a TaskStateChanged event.
    pub fn task_state_changed(
        key: TaskInstanceKey,
        from: TaskInstanceState,
        to: TaskInstanceState,
        try_number: u32,
        reason: Option<String>,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Event::TaskStateChanged {
            key,
            from,
            to,
            try_number,
            reason,
            timestamp,
        }
    }

    /// Create a RunStateChanged event.
    pub fn run_state_changed(
        dag_id: DagId,
        run_id: RunId,
        from: RunState,
        to: RunState,
        timestamp: DateTime<Utc>,
    ) -> Self {
        Event::RunStateChanged {
            dag_id,
            run_id,
            from,
            to,
            timestamp,
        }
    }
}

/// Handler for receiving scheduler events.
#[async_trait]
pub trait EventHandler: Send + Sync {
    /// Handle an event.
    async fn handle(&self, event: &Event);
}

/// Event bus for distributing events to registered handlers.
pub struct EventBus {
    handlers: RwLock<Vec<Arc<dyn EventHandler>>>,
}

impl EventBus {
    /// Create a new event bus with no handlers.
    pub fn new() -> Self {
        Self {
            handlers: RwLock::new(Vec::new()),
        }
    }

    /// Register an event handler.
    pub async fn register(&self, handler: Arc<dyn EventHandler>) {
        let mut handlers = self.handlers.write().await;
        handlers.push(handler);
    }

    /// Emit an event to all registered handlers, in registration order.
    pub async fn emit(&self, event: Event) {
        let handlers = self.handlers.read().await;
        for handler in handlers.iter() {
            handler.handle(&event).await;
        }
    }

    /// Get the number of registered handlers.
    pub async fn handler_count(&self) -> usize {
        self.handlers.read().await.len()
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}

/// Forwards events to `tracing`.
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingHandler;

#[async_trait]
impl EventHandler for TracingHandler {
    async fn handle(&self, event: &Event) {
        match event {
            Event::TaskStateChanged {
                key,
                from,
                to,
                try_number,
                reason,
                ..
            } => match reason {
                Some(reason) => tracing::info!(
                    instance = %key,
                    from = %from,
                    to = %to,
                    try_number,
                    reason = %reason,
                    "task instance state changed"
                ),
                None => tracing::info!(
                    instance = %key,
                    from = %from,
                    to = %to,
                    try_number,
                    "task instance state changed"
                ),
            },
            Event::RunStateChanged {
                dag_id,
                run_id,
                from,
                to,
                ..
            } => {
                tracing::info!(dag = %dag_id, run = %run_id, from = %from, to = %to, "run state changed");
            }
            Event::TaskExpanded {
                dag_id,
                run_id,
                task_id,
                length,
                ..
            } => {
                tracing::info!(dag = %dag_id, run = %run_id, task = %task_id, length, "mapped task expanded");
            }
            Event::ExpansionBlocked {
                dag_id,
                run_id,
                task_id,
                reason,
                ..
            } => {
                tracing::warn!(dag = %dag_id, run = %run_id, task = %task_id, reason = %reason, "mapped task cannot expand");
            }
        }
    }
}
