//! Scheduler handle for controlling a started scheduler.
//!
//! A [`SchedulerHandle`] sends commands over a channel to the scheduler loop
//! and waits for the answer on a oneshot channel.

use std::sync::Arc;

use tokio::sync::{RwLock, mpsc, oneshot};

use super::runs::CreateRunRequest;
use super::types::{SchedulerCommand, SchedulerError, SchedulerState};
use crate::core::run::DagRun;
use crate::core::types::{DagId, RunId, TaskInstanceKey};

/// Buffer size for the command channel between SchedulerHandle and Scheduler.
pub(crate) const COMMAND_CHANNEL_BUFFER: usize = 32;

/// Handle for controlling the scheduler.
#[derive(Clone)]
pub struct SchedulerHandle {
    pub(crate) command_tx: mpsc::Sender<SchedulerCommand>,
    pub(crate) state: Arc<RwLock<SchedulerState>>,
}

impl SchedulerHandle {
    /// Helper to send a command that returns a result and wait for response.
    async fn send_result_command<T>(
        &self,
        build_command: impl FnOnce(oneshot::Sender<Result<T, SchedulerError>>) -> SchedulerCommand,
        operation: &str,
    ) -> Result<T, SchedulerError>
    where
        T: Send + 'static,
    {
        let (response_tx, response_rx) = oneshot::channel();
        self.command_tx
            .send(build_command(response_tx))
            .await
            .map_err(|_| {
                SchedulerError::ChannelError(format!("failed to send {} command", operation))
            })?;

        response_rx.await.map_err(|_| {
            SchedulerError::ChannelError(format!("failed to receive {} response", operation))
        })?
    }

    /// Helper to send a command that returns unit and wait for response.
    async fn send_unit_command(
        &self,
        build_command: impl FnOnce(oneshot::Sender<()>) -> SchedulerCommand,
        operation: &str,
    ) -> Result<(), SchedulerError> {
        let (response_tx, response_rx) = oneshot::channel();
        self.command_tx
            .send(build_command(response_tx))
            .await
            .map_err(|_| {
                SchedulerError::ChannelError(format!("failed to send {} command", operation))
            })?;

        response_rx.await.map_err(|_| {
            SchedulerError::ChannelError(format!("failed to receive {} response", operation))
        })
    }

    /// Trigger a manual run of `dag_id` with the current time as logical date.
    pub async fn trigger(&self, dag_id: impl Into<DagId>) -> Result<RunId, SchedulerError> {
        let dag_id = dag_id.into();
        let run = self
            .send_result_command(
                |response| SchedulerCommand::Trigger {
                    dag_id,
                    request: None,
                    response,
                },
                "trigger",
            )
            .await?;
        Ok(run.run_id)
    }

    /// Create a run with explicit parameters.
    pub async fn trigger_with(
        &self,
        dag_id: impl Into<DagId>,
        request: CreateRunRequest,
    ) -> Result<DagRun, SchedulerError> {
        let dag_id = dag_id.into();
        self.send_result_command(
            |response| SchedulerCommand::Trigger {
                dag_id,
                request: Some(request),
                response,
            },
            "trigger",
        )
        .await
    }

    /// Fail a run and remove its unfinished task instances.
    pub async fn mark_run_failed(
        &self,
        dag_id: impl Into<DagId>,
        run_id: impl Into<RunId>,
        reason: Option<String>,
    ) -> Result<(), SchedulerError> {
        let dag_id = dag_id.into();
        let run_id = run_id.into();
        self.send_result_command(
            |response| SchedulerCommand::MarkRunFailed {
                dag_id,
                run_id,
                reason,
                response,
            },
            "mark_run_failed",
        )
        .await
    }

    /// Remove one task instance. Returns false if it had already finished.
    pub async fn mark_removed(&self, key: TaskInstanceKey) -> Result<bool, SchedulerError> {
        self.send_result_command(
            |response| SchedulerCommand::MarkRemoved { key, response },
            "mark_removed",
        )
        .await
    }

    /// Pause the scheduler.
    ///
    /// While paused, no passes run and schedules do not fire, but manual
    /// triggers still create runs.
    pub async fn pause(&self) -> Result<(), SchedulerError> {
        self.send_unit_command(|response| SchedulerCommand::Pause { response }, "pause")
            .await
    }

    /// Resume the scheduler after being paused.
    pub async fn resume(&self) -> Result<(), SchedulerError> {
        self.send_unit_command(|response| SchedulerCommand::Resume { response }, "resume")
            .await
    }

    /// Shutdown the scheduler.
    pub async fn shutdown(&self) -> Result<(), SchedulerError> {
        self.send_unit_command(
            |response| SchedulerCommand::Shutdown { response },
            "shutdown",
        )
        .await
    }

    /// Get the current scheduler state.
    pub async fn state(&self) -> SchedulerState {
        *self.state.read().await
    }

    /// Check if the scheduler is running.
    pub async fn is_running(&self) -> bool {
        *self.state.read().await == SchedulerState::Running
    }

    /// Check if the scheduler is paused.
    pub async fn is_paused(&self) -> bool {
        *self.state.read().await == SchedulerState::Paused
    }
}
