//! Complete workflow integration tests.
//!
//! Tests that verify runs from trigger to completion, including retries,
//! XCom passing and run-level limits.

use crate::common::{Harness, start_time};
use serde_json::{Value, json};
use std::sync::Arc;
use std::time::Duration;
use tributary::testing::{ConstUnit, FakeExecutor, FlakyUnit, drive_until_terminal};
use tributary::{
    CreateRunRequest, DagBuilder, Event, FnUnit, RetryCondition, RetryPolicy, RunState,
    SchedulerError, TaskDefinition, TaskError, TaskInstanceState, XComArg, XComKey, XComStore,
};

fn doubler() -> Arc<FnUnit> {
    Arc::new(FnUnit::new("double", |ctx| {
        let value: i64 = ctx.arg("value")?;
        Ok(Some(json!(value * 2)))
    }))
}

/// Test: A -> B -> C where B fails twice before succeeding.
#[tokio::test]
async fn test_chain_with_flaky_task_completes() {
    let flaky = Arc::new(FlakyUnit::new("b", 2));
    let dag = DagBuilder::new("etl")
        .add_task(TaskDefinition::new("a", Arc::new(ConstUnit::new("a", json!(21)))))
        .add_task(
            TaskDefinition::new("b", flaky.clone())
                .depends_on(&["a"])
                .with_retry(RetryPolicy::fixed(2, Duration::ZERO)),
        )
        .add_task(
            TaskDefinition::new("c", doubler())
                .depends_on(&["b"])
                .with_xcom_arg("value", XComArg::new("a")),
        )
        .build()
        .unwrap();

    let h = Harness::new(vec![dag], FakeExecutor::inline()).await;
    let run = h.trigger("etl").await;
    let run = drive_until_terminal(&h.scheduler, &run.dag_id, &run.run_id, 20)
        .await
        .unwrap();

    assert_eq!(run.state, RunState::Success);
    assert_eq!(flaky.call_count(), 3);

    let b = h.instance(&run, "b", None).await;
    assert_eq!(b.state, TaskInstanceState::Success);
    assert_eq!(b.try_number, 3);

    let c = h.instance(&run, "c", None).await;
    let xcom = XComStore::new(h.storage.clone());
    let value = xcom.get(&XComKey::return_value(&c.key)).await.unwrap();
    assert_eq!(value, json!(42));

    let b_transitions = h.recorder.transitions_of(&"b".into()).await;
    assert_eq!(
        b_transitions
            .iter()
            .filter(|s| **s == TaskInstanceState::UpForRetry)
            .count(),
        2
    );
}

/// Test: a task that keeps failing stops after its retries and fails the run.
#[tokio::test]
async fn test_retries_are_bounded() {
    let flaky = Arc::new(FlakyUnit::new("t", 10));
    let dag = DagBuilder::new("bounded")
        .add_task(TaskDefinition::new("t", flaky.clone()).with_retry(RetryPolicy::fixed(2, Duration::ZERO)))
        .add_task(TaskDefinition::new("after", Arc::new(ConstUnit::empty("after"))).depends_on(&["t"]))
        .build()
        .unwrap();

    let h = Harness::new(vec![dag], FakeExecutor::inline()).await;
    let run = h.trigger("bounded").await;
    let run = drive_until_terminal(&h.scheduler, &run.dag_id, &run.run_id, 20)
        .await
        .unwrap();

    assert_eq!(run.state, RunState::Failed);
    assert_eq!(flaky.call_count(), 3);

    let t = h.instance(&run, "t", None).await;
    assert_eq!(t.state, TaskInstanceState::Failed);
    assert_eq!(t.try_number, 3);
    assert!(t.failure_reason.unwrap().contains("failure 3"));

    let after = h.instance(&run, "after", None).await;
    assert_eq!(after.state, TaskInstanceState::UpstreamFailed);
}

/// Test: a transient-only policy does not retry ordinary failures.
#[tokio::test]
async fn test_transient_only_policy_fails_fast_on_permanent_error() {
    let dag = DagBuilder::new("transient")
        .add_task(
            TaskDefinition::new("permanent", Arc::new(FlakyUnit::new("permanent", 1))).with_retry(
                RetryPolicy::fixed(3, Duration::ZERO).with_condition(RetryCondition::TransientOnly),
            ),
        )
        .add_task(
            TaskDefinition::new("blip", Arc::new(FlakyUnit::new("blip", 1).transient())).with_retry(
                RetryPolicy::fixed(3, Duration::ZERO).with_condition(RetryCondition::TransientOnly),
            ),
        )
        .build()
        .unwrap();

    let h = Harness::new(vec![dag], FakeExecutor::inline()).await;
    let run = h.trigger("transient").await;
    let run = drive_until_terminal(&h.scheduler, &run.dag_id, &run.run_id, 10)
        .await
        .unwrap();

    assert_eq!(run.state, RunState::Failed);
    let permanent = h.instance(&run, "permanent", None).await;
    assert_eq!(permanent.state, TaskInstanceState::Failed);
    assert_eq!(permanent.try_number, 1);

    let blip = h.instance(&run, "blip", None).await;
    assert_eq!(blip.state, TaskInstanceState::Success);
    assert_eq!(blip.try_number, 2);
}

/// Test: exponential backoff spaces retries by the policy's delays.
#[tokio::test]
async fn test_exponential_backoff_schedule() {
    let dag = DagBuilder::new("backoff")
        .add_task(
            TaskDefinition::new("t", Arc::new(ConstUnit::empty("t")))
                .with_retry(RetryPolicy::exponential(2, Duration::from_secs(10), 3.0)),
        )
        .build()
        .unwrap();

    let h = Harness::new(vec![dag], FakeExecutor::new()).await;
    let run = h.trigger("backoff").await;
    h.passes(1).await;

    let first = h.executor.take_submitted().remove(0);
    h.executor.fail(&first, "boom", false);
    h.passes(1).await;
    let ti = h.instance(&run, "t", None).await;
    assert_eq!(
        ti.next_retry_at,
        Some(start_time() + chrono::Duration::seconds(10))
    );

    h.clock.advance(Duration::from_secs(10));
    h.passes(1).await;
    let second = h.executor.take_submitted().remove(0);
    assert_eq!(second.try_number, 2);

    h.executor.fail(&second, "boom", false);
    h.passes(1).await;
    let ti = h.instance(&run, "t", None).await;
    assert_eq!(ti.state, TaskInstanceState::UpForRetry);
    assert_eq!(
        ti.next_retry_at,
        Some(start_time() + chrono::Duration::seconds(10 + 30))
    );
}

/// Test: XCom values pushed by a unit are visible to downstream arguments.
#[tokio::test]
async fn test_pushed_outputs_reach_downstream() {
    let producer = Arc::new(FnUnit::new("producer", |ctx| {
        ctx.push("rows", json!([1, 2, 3]))?;
        Ok(Some(json!("done")))
    }));
    let consumer = Arc::new(FnUnit::new("consumer", |ctx| {
        let rows: Vec<i64> = ctx.arg("rows")?;
        if rows.len() != 3 {
            return Err(TaskError::ExecutionFailed("wrong rows".into()));
        }
        Ok(Some(json!(rows.iter().sum::<i64>())))
    }));
    let dag = DagBuilder::new("push")
        .add_task(TaskDefinition::new("producer", producer))
        .add_task(
            TaskDefinition::new("consumer", consumer)
                .with_xcom_arg("rows", XComArg::new("producer").with_key("rows")),
        )
        .build()
        .unwrap();

    let h = Harness::new(vec![dag], FakeExecutor::inline()).await;
    let run = h.trigger("push").await;
    let run = drive_until_terminal(&h.scheduler, &run.dag_id, &run.run_id, 10)
        .await
        .unwrap();

    assert_eq!(run.state, RunState::Success);
    let consumer = h.instance(&run, "consumer", None).await;
    let sum = XComStore::new(h.storage.clone())
        .get(&XComKey::return_value(&consumer.key))
        .await
        .unwrap();
    assert_eq!(sum, json!(6));
}

/// Test: multiple_outputs spreads an object return value into keys.
#[tokio::test]
async fn test_multiple_outputs_spread_into_keys() {
    let dag = DagBuilder::new("spread")
        .add_task(
            TaskDefinition::new(
                "stats",
                Arc::new(ConstUnit::new("stats", json!({"min": 1, "max": 9}))),
            )
            .with_multiple_outputs(true),
        )
        .build()
        .unwrap();

    let h = Harness::new(vec![dag], FakeExecutor::inline()).await;
    let run = h.trigger("spread").await;
    drive_until_terminal(&h.scheduler, &run.dag_id, &run.run_id, 5)
        .await
        .unwrap();

    let stats = h.instance(&run, "stats", None).await;
    let xcom = XComStore::new(h.storage.clone());
    assert_eq!(
        xcom.get(&XComKey::new(&stats.key, "max")).await.unwrap(),
        json!(9)
    );
    assert_eq!(
        xcom.get(&XComKey::return_value(&stats.key)).await.unwrap(),
        json!({"min": 1, "max": 9})
    );
}

/// Test: multiple_outputs with a non-object return value fails the try.
#[tokio::test]
async fn test_multiple_outputs_requires_object() {
    let dag = DagBuilder::new("bad_spread")
        .add_task(
            TaskDefinition::new("stats", Arc::new(ConstUnit::new("stats", json!([1, 2]))))
                .with_multiple_outputs(true),
        )
        .build()
        .unwrap();

    let h = Harness::new(vec![dag], FakeExecutor::inline()).await;
    let run = h.trigger("bad_spread").await;
    let run = drive_until_terminal(&h.scheduler, &run.dag_id, &run.run_id, 5)
        .await
        .unwrap();

    assert_eq!(run.state, RunState::Failed);
    let stats = h.instance(&run, "stats", None).await;
    assert_eq!(stats.state, TaskInstanceState::Failed);
    let xcom = XComStore::new(h.storage.clone());
    assert!(xcom.get(&XComKey::return_value(&stats.key)).await.is_err());
}

/// Test: max_active_runs holds later runs in the queue.
#[tokio::test]
async fn test_max_active_runs_queues_later_runs() {
    let dag = DagBuilder::new("serial")
        .with_max_active_runs(1)
        .add_task(TaskDefinition::new("t", Arc::new(ConstUnit::empty("t"))))
        .build()
        .unwrap();

    let h = Harness::new(vec![dag], FakeExecutor::new()).await;
    let first = h
        .scheduler
        .trigger_run(&"serial".into(), Some(CreateRunRequest::manual(start_time())))
        .await
        .unwrap();
    let second = h
        .scheduler
        .trigger_run(
            &"serial".into(),
            Some(CreateRunRequest::manual(start_time() + chrono::Duration::hours(1))),
        )
        .await
        .unwrap();

    h.passes(1).await;
    assert_eq!(h.run_state(&first).await, RunState::Running);
    assert_eq!(h.run_state(&second).await, RunState::Queued);

    let command = h.executor.take_submitted().remove(0);
    assert_eq!(command.key.run_id, first.run_id);
    h.executor.complete(&command, None);
    h.passes(1).await;
    assert_eq!(h.run_state(&first).await, RunState::Success);
    assert_eq!(h.run_state(&second).await, RunState::Queued);

    h.passes(1).await;
    assert_eq!(h.run_state(&second).await, RunState::Running);
}

/// Test: one run per logical date unless forced.
#[tokio::test]
async fn test_duplicate_logical_date_rejected_unless_forced() {
    let dag = DagBuilder::new("dup")
        .add_task(TaskDefinition::new("t", Arc::new(ConstUnit::empty("t"))))
        .build()
        .unwrap();
    let h = Harness::new(vec![dag], FakeExecutor::new()).await;

    let request = CreateRunRequest::manual(start_time());
    let first = h
        .scheduler
        .trigger_run(&"dup".into(), Some(request.clone()))
        .await
        .unwrap();
    let err = h
        .scheduler
        .trigger_run(&"dup".into(), Some(request.clone()))
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::DuplicateRun { .. }));

    let forced = h
        .scheduler
        .trigger_run(&"dup".into(), Some(request.forced()))
        .await
        .unwrap();
    assert_ne!(forced.run_id, first.run_id);
    assert!(forced.forced);
}

/// Test: failing a run from outside removes its unfinished instances.
#[tokio::test]
async fn test_mark_run_failed_removes_unfinished_instances() {
    let dag = DagBuilder::new("cancel")
        .add_task(TaskDefinition::new("a", Arc::new(ConstUnit::empty("a"))))
        .add_task(TaskDefinition::new("b", Arc::new(ConstUnit::empty("b"))).depends_on(&["a"]))
        .build()
        .unwrap();
    let h = Harness::new(vec![dag], FakeExecutor::new()).await;
    let run = h.trigger("cancel").await;
    h.passes(1).await;
    let command = h.executor.take_submitted().remove(0);

    h.scheduler
        .mark_run_failed(&run.dag_id, &run.run_id, Some("operator".into()))
        .await
        .unwrap();

    assert_eq!(h.run_state(&run).await, RunState::Failed);
    let states = h.states(&run).await;
    assert_eq!(states["a"], TaskInstanceState::Removed);
    assert_eq!(states["b"], TaskInstanceState::Removed);
    assert_eq!(h.executor.cancelled(), vec![command.key.clone()]);

    h.executor.complete(&command, Some(json!(1)));
    let summary = h.scheduler.run_pass().await;
    assert_eq!(summary.events_discarded, 1);
    assert_eq!(
        h.instance(&run, "a", None).await.state,
        TaskInstanceState::Removed
    );

    let err = h
        .scheduler
        .mark_run_failed(&run.dag_id, &run.run_id, None)
        .await
        .unwrap_err();
    assert!(matches!(err, SchedulerError::RunFinished { .. }));
}

/// Test: run lifecycle events are emitted in order.
#[tokio::test]
async fn test_run_events_emitted() {
    let dag = DagBuilder::new("events")
        .add_task(TaskDefinition::new("t", Arc::new(ConstUnit::empty("t"))))
        .build()
        .unwrap();
    let h = Harness::new(vec![dag], FakeExecutor::inline()).await;
    let run = h.trigger("events").await;
    drive_until_terminal(&h.scheduler, &run.dag_id, &run.run_id, 5)
        .await
        .unwrap();

    let run_transitions: Vec<(RunState, RunState)> = h
        .recorder
        .events()
        .await
        .into_iter()
        .filter_map(|event| match event {
            Event::RunStateChanged { from, to, .. } => Some((from, to)),
            _ => None,
        })
        .collect();
    assert_eq!(
        run_transitions,
        vec![
            (RunState::Queued, RunState::Running),
            (RunState::Running, RunState::Success)
        ]
    );
}

/// Test: a manual run's data interval collapses to its logical date.
#[tokio::test]
async fn test_context_carries_logical_date() {
    let dag = DagBuilder::new("dates")
        .add_task(TaskDefinition::new(
            "t",
            Arc::new(FnUnit::new("t", |ctx| {
                Ok(Some(Value::String(ctx.logical_date.to_rfc3339())))
            })),
        ))
        .build()
        .unwrap();
    let h = Harness::new(vec![dag], FakeExecutor::new()).await;
    let run = h.trigger("dates").await;
    h.passes(1).await;

    let command = h.executor.take_submitted().remove(0);
    assert_eq!(command.logical_date, start_time());
    assert_eq!(command.data_interval, (start_time(), start_time()));
    assert_eq!(run.logical_date, start_time());
}
