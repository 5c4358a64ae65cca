//! Recovery integration tests.
//!
//! Tests that verify zombie detection, stuck-queue recovery, executor
//! rejections, removals and the handling of late executor events.

use crate::common::{Harness, start_time};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tributary::testing::{ConstUnit, FakeExecutor};
use tributary::{
    DagBuilder, RetryPolicy, RunState, TaskDefinition, TaskInstanceState, XComArg,
};

fn two_step(retry: Option<RetryPolicy>) -> tributary::Dag {
    let mut first = TaskDefinition::new("first", Arc::new(ConstUnit::empty("first")));
    if let Some(policy) = retry {
        first = first.with_retry(policy);
    }
    DagBuilder::new("steps")
        .add_task(first)
        .add_task(
            TaskDefinition::new("second", Arc::new(ConstUnit::empty("second")))
                .depends_on(&["first"]),
        )
        .build()
        .unwrap()
}

/// Test: a running instance without heartbeats is failed as a zombie.
#[tokio::test]
async fn test_zombie_without_retries_fails_downstream() {
    let h = Harness::new(vec![two_step(None)], FakeExecutor::new()).await;
    let run = h.trigger("steps").await;
    h.passes(1).await;
    let command = h.executor.take_submitted().remove(0);
    h.executor.start(&command);
    h.passes(1).await;
    assert_eq!(
        h.instance(&run, "first", None).await.state,
        TaskInstanceState::Running
    );

    h.clock.advance(Duration::from_secs(301));
    let summary = h.scheduler.run_pass().await;
    assert_eq!(summary.zombies, 1);
    assert_eq!(h.executor.cancelled(), vec![command.key.clone()]);

    let first = h.instance(&run, "first", None).await;
    assert_eq!(first.state, TaskInstanceState::Failed);
    assert!(first.failure_reason.unwrap().starts_with("zombie"));

    h.passes(1).await;
    assert_eq!(
        h.instance(&run, "second", None).await.state,
        TaskInstanceState::UpstreamFailed
    );
    assert_eq!(h.run_state(&run).await, RunState::Failed);
}

/// Test: heartbeats keep a long-running instance alive.
#[tokio::test]
async fn test_heartbeat_prevents_zombie() {
    let h = Harness::new(vec![two_step(None)], FakeExecutor::new()).await;
    let run = h.trigger("steps").await;
    h.passes(1).await;
    let command = h.executor.take_submitted().remove(0);
    h.executor.start(&command);
    h.passes(1).await;

    h.clock.advance(Duration::from_secs(200));
    h.executor.heartbeat(&command);
    h.passes(1).await;
    let ti = h.instance(&run, "first", None).await;
    assert_eq!(ti.last_heartbeat, Some(start_time() + chrono::Duration::seconds(200)));

    h.clock.advance(Duration::from_secs(200));
    let summary = h.scheduler.run_pass().await;
    assert_eq!(summary.zombies, 0);
    assert_eq!(
        h.instance(&run, "first", None).await.state,
        TaskInstanceState::Running
    );
}

/// Test: a zombie with retries left is retried, and the old try's late
/// completion is discarded.
#[tokio::test]
async fn test_zombie_retry_discards_stale_completion() {
    let h = Harness::new(
        vec![two_step(Some(RetryPolicy::fixed(1, Duration::ZERO)))],
        FakeExecutor::new(),
    )
    .await;
    let run = h.trigger("steps").await;
    h.passes(1).await;
    let first_try = h.executor.take_submitted().remove(0);
    h.executor.start(&first_try);
    h.passes(1).await;

    h.clock.advance(Duration::from_secs(301));
    h.passes(1).await;
    assert_eq!(
        h.instance(&run, "first", None).await.state,
        TaskInstanceState::UpForRetry
    );

    h.passes(1).await;
    let second_try = h.executor.take_submitted().remove(0);
    assert_eq!(second_try.try_number, 2);

    h.executor.complete(&first_try, Some(json!("late")));
    let summary = h.scheduler.run_pass().await;
    assert_eq!(summary.events_discarded, 1);
    assert_eq!(
        h.instance(&run, "first", None).await.state,
        TaskInstanceState::Queued
    );

    h.executor.complete(&second_try, None);
    h.passes(1).await;
    let first = h.instance(&run, "first", None).await;
    assert_eq!(first.state, TaskInstanceState::Success);
    assert_eq!(first.try_number, 2);
}

/// Test: an instance the executor never started is returned to scheduled
/// and dispatched again with the same try number.
#[tokio::test]
async fn test_stuck_queued_instance_is_requeued() {
    let h = Harness::new(vec![two_step(None)], FakeExecutor::new()).await;
    let run = h.trigger("steps").await;
    h.passes(1).await;
    let lost = h.executor.take_submitted().remove(0);

    h.clock.advance(Duration::from_secs(601));
    let summary = h.scheduler.run_pass().await;
    assert_eq!(summary.requeued, 1);
    assert_eq!(h.executor.cancelled(), vec![lost.key.clone()]);
    assert_eq!(
        h.instance(&run, "first", None).await.state,
        TaskInstanceState::Scheduled
    );

    h.passes(1).await;
    let again = h.executor.take_submitted().remove(0);
    assert_eq!(again.key, lost.key);
    assert_eq!(again.try_number, 1);
}

/// Test: rejected submissions go back to scheduled and are retried later
/// without using up a try.
#[tokio::test]
async fn test_rejected_submission_is_retried() {
    let h = Harness::new(vec![two_step(None)], FakeExecutor::new()).await;
    h.executor.reject_with("no capacity");
    let run = h.trigger("steps").await;

    let summary = h.scheduler.run_pass().await;
    assert_eq!(summary.rejected, 1);
    assert_eq!(summary.dispatched, 0);
    let first = h.instance(&run, "first", None).await;
    assert_eq!(first.state, TaskInstanceState::Scheduled);
    assert_eq!(first.try_number, 0);

    h.executor.accept_all();
    let summary = h.scheduler.run_pass().await;
    assert_eq!(summary.dispatched, 1);
    assert_eq!(h.executor.take_submitted()[0].try_number, 1);
}

/// Test: removing a running instance cancels it, discards its late result
/// and fails the run.
#[tokio::test]
async fn test_removed_instance_ignores_late_result() {
    let h = Harness::new(vec![two_step(None)], FakeExecutor::new()).await;
    let run = h.trigger("steps").await;
    h.passes(1).await;
    let command = h.executor.take_submitted().remove(0);
    h.executor.start(&command);
    h.passes(1).await;

    assert!(h.scheduler.mark_instance_removed(&command.key).await.unwrap());
    assert_eq!(h.executor.cancelled(), vec![command.key.clone()]);
    assert!(!h.scheduler.mark_instance_removed(&command.key).await.unwrap());

    h.executor.complete(&command, Some(json!(1)));
    let summary = h.scheduler.run_pass().await;
    assert_eq!(summary.events_discarded, 1);
    assert_eq!(
        h.instance(&run, "first", None).await.state,
        TaskInstanceState::Removed
    );

    h.passes(1).await;
    assert_eq!(
        h.instance(&run, "second", None).await.state,
        TaskInstanceState::UpstreamFailed
    );
    assert_eq!(h.run_state(&run).await, RunState::Failed);
}

/// Test: an argument that cannot be resolved fails the instance before it
/// reaches the executor.
#[tokio::test]
async fn test_missing_xcom_argument_fails_instance() {
    let dag = DagBuilder::new("missing")
        .add_task(TaskDefinition::new("producer", Arc::new(ConstUnit::empty("producer"))))
        .add_task(
            TaskDefinition::new("consumer", Arc::new(ConstUnit::empty("consumer")))
                .with_xcom_arg("value", XComArg::new("producer")),
        )
        .build()
        .unwrap();
    let h = Harness::new(vec![dag], FakeExecutor::inline()).await;
    let run = h.trigger("missing").await;
    h.passes(1).await;

    let summary = h.scheduler.run_pass().await;
    assert_eq!(summary.errors, 1);
    assert_eq!(summary.dispatched, 0);

    let consumer = h.instance(&run, "consumer", None).await;
    assert_eq!(consumer.state, TaskInstanceState::Failed);
    assert!(consumer.failure_reason.unwrap().contains("missing xcom"));
    assert_eq!(h.executor.submitted().len(), 1);
}

/// Test: events for instances that do not exist are discarded.
#[tokio::test]
async fn test_event_for_unknown_instance_is_discarded() {
    let h = Harness::new(vec![two_step(None)], FakeExecutor::new()).await;
    let run = h.trigger("steps").await;
    h.passes(1).await;
    let mut command = h.executor.take_submitted().remove(0);
    command.key.task_id = "ghost".into();
    h.executor.complete(&command, None);

    let summary = h.scheduler.run_pass().await;
    assert_eq!(summary.events_discarded, 1);
    assert_eq!(h.run_state(&run).await, RunState::Running);
}
