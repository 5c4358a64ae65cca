//! Trigger rule integration tests.
//!
//! Tests that verify how upstream outcomes decide whether a task runs, is
//! skipped or is marked upstream_failed.

use crate::common::Harness;
use std::sync::Arc;
use tributary::testing::{ConstUnit, FakeExecutor, FlakyUnit, drive_until_terminal};
use tributary::{
    DagBuilder, DagRun, RunState, TaskDefinition, TaskInstanceState, TriggerRule,
};

fn ok(id: &str) -> TaskDefinition {
    TaskDefinition::new(id, Arc::new(ConstUnit::empty(id)))
}

fn broken(id: &str) -> TaskDefinition {
    TaskDefinition::new(id, Arc::new(FlakyUnit::new(id, u32::MAX)))
}

async fn finish(h: &Harness, dag_id: &str) -> DagRun {
    let run = h.trigger(dag_id).await;
    drive_until_terminal(&h.scheduler, &run.dag_id, &run.run_id, 20)
        .await
        .unwrap()
}

/// Test: all_success propagates upstream_failed down a chain without running.
#[tokio::test]
async fn test_all_success_propagates_upstream_failed() {
    let dag = DagBuilder::new("chain")
        .add_task(broken("extract"))
        .add_task(ok("transform").depends_on(&["extract"]))
        .add_task(ok("load").depends_on(&["transform"]))
        .build()
        .unwrap();
    let h = Harness::new(vec![dag], FakeExecutor::inline()).await;
    let run = finish(&h, "chain").await;

    assert_eq!(run.state, RunState::Failed);
    let states = h.states(&run).await;
    assert_eq!(states["extract"], TaskInstanceState::Failed);
    assert_eq!(states["transform"], TaskInstanceState::UpstreamFailed);
    assert_eq!(states["load"], TaskInstanceState::UpstreamFailed);

    let submitted: Vec<String> = h
        .executor
        .submitted()
        .iter()
        .map(|c| c.key.task_id.to_string())
        .collect();
    assert_eq!(submitted, vec!["extract".to_string()]);
}

/// Test: all_done runs once every upstream finished, whatever the outcome.
#[tokio::test]
async fn test_all_done_runs_after_failure() {
    let dag = DagBuilder::new("cleanup")
        .add_task(broken("a"))
        .add_task(ok("b"))
        .add_task(
            ok("cleanup")
                .depends_on(&["a", "b"])
                .with_trigger_rule(TriggerRule::AllDone),
        )
        .build()
        .unwrap();
    let h = Harness::new(vec![dag], FakeExecutor::inline()).await;
    let run = finish(&h, "cleanup").await;

    let states = h.states(&run).await;
    assert_eq!(states["a"], TaskInstanceState::Failed);
    assert_eq!(states["b"], TaskInstanceState::Success);
    assert_eq!(states["cleanup"], TaskInstanceState::Success);
    assert_eq!(run.state, RunState::Failed);
}

/// Test: all_done waits while an upstream is still running.
#[tokio::test]
async fn test_all_done_waits_for_running_upstream() {
    let dag = DagBuilder::new("waiting")
        .add_task(ok("slow"))
        .add_task(
            ok("after")
                .depends_on(&["slow"])
                .with_trigger_rule(TriggerRule::AllDone),
        )
        .build()
        .unwrap();
    let h = Harness::new(vec![dag], FakeExecutor::new()).await;
    let run = h.trigger("waiting").await;
    h.passes(1).await;

    let command = h.executor.take_submitted().remove(0);
    h.executor.start(&command);
    h.passes(2).await;
    assert_eq!(h.states(&run).await["after"], TaskInstanceState::None);

    h.executor.complete(&command, None);
    h.passes(2).await;
    assert_eq!(
        h.instance(&run, "after", None).await.state,
        TaskInstanceState::Queued
    );
}

/// Test: one_failed runs an alert on failure and skips it otherwise.
#[tokio::test]
async fn test_one_failed_alerting() {
    let failing = DagBuilder::new("failing")
        .add_task(broken("work"))
        .add_task(
            ok("alert")
                .depends_on(&["work"])
                .with_trigger_rule(TriggerRule::OneFailed),
        )
        .build()
        .unwrap();
    let passing = DagBuilder::new("passing")
        .add_task(ok("work"))
        .add_task(
            ok("alert")
                .depends_on(&["work"])
                .with_trigger_rule(TriggerRule::OneFailed),
        )
        .build()
        .unwrap();
    let h = Harness::new(vec![failing, passing], FakeExecutor::inline()).await;

    let run = finish(&h, "failing").await;
    assert_eq!(
        h.instance(&run, "alert", None).await.state,
        TaskInstanceState::Success
    );
    assert_eq!(run.state, RunState::Failed);

    let run = finish(&h, "passing").await;
    assert_eq!(
        h.instance(&run, "alert", None).await.state,
        TaskInstanceState::Skipped
    );
    assert_eq!(run.state, RunState::Success);
}

/// Test: skips propagate through all_success; none_failed tolerates them.
#[tokio::test]
async fn test_skip_propagation_and_none_failed() {
    let dag = DagBuilder::new("branches")
        .add_task(ok("root"))
        .add_task(
            ok("on_failure")
                .depends_on(&["root"])
                .with_trigger_rule(TriggerRule::OneFailed),
        )
        .add_task(ok("after_failure").depends_on(&["on_failure"]))
        .add_task(
            ok("join")
                .depends_on(&["root", "on_failure"])
                .with_trigger_rule(TriggerRule::NoneFailed),
        )
        .add_task(
            ok("only_skipped")
                .depends_on(&["on_failure"])
                .with_trigger_rule(TriggerRule::NoneFailed),
        )
        .build()
        .unwrap();
    let h = Harness::new(vec![dag], FakeExecutor::inline()).await;
    let run = finish(&h, "branches").await;

    let states = h.states(&run).await;
    assert_eq!(states["on_failure"], TaskInstanceState::Skipped);
    assert_eq!(states["after_failure"], TaskInstanceState::Skipped);
    assert_eq!(states["join"], TaskInstanceState::Success);
    assert_eq!(states["only_skipped"], TaskInstanceState::Skipped);
    assert_eq!(run.state, RunState::Success);
}

/// Test: none_failed marks upstream_failed as soon as an upstream fails.
#[tokio::test]
async fn test_none_failed_with_failure() {
    let dag = DagBuilder::new("strict")
        .add_task(broken("a"))
        .add_task(ok("b"))
        .add_task(
            ok("c")
                .depends_on(&["a", "b"])
                .with_trigger_rule(TriggerRule::NoneFailed),
        )
        .build()
        .unwrap();
    let h = Harness::new(vec![dag], FakeExecutor::inline()).await;
    let run = finish(&h, "strict").await;
    assert_eq!(
        h.instance(&run, "c", None).await.state,
        TaskInstanceState::UpstreamFailed
    );
}

/// Test: all_failed runs only when every upstream failed.
#[tokio::test]
async fn test_all_failed() {
    let dag = DagBuilder::new("rollback")
        .add_task(broken("a"))
        .add_task(broken("b"))
        .add_task(ok("c"))
        .add_task(
            ok("rollback")
                .depends_on(&["a", "b"])
                .with_trigger_rule(TriggerRule::AllFailed),
        )
        .add_task(
            ok("never")
                .depends_on(&["a", "c"])
                .with_trigger_rule(TriggerRule::AllFailed),
        )
        .build()
        .unwrap();
    let h = Harness::new(vec![dag], FakeExecutor::inline()).await;
    let run = finish(&h, "rollback").await;

    let states = h.states(&run).await;
    assert_eq!(states["rollback"], TaskInstanceState::Success);
    assert_eq!(states["never"], TaskInstanceState::Skipped);
}

/// Test: always runs even when its upstream was never attempted.
#[tokio::test]
async fn test_always_runs_regardless() {
    let dag = DagBuilder::new("always")
        .add_task(broken("a"))
        .add_task(ok("b").depends_on(&["a"]))
        .add_task(
            ok("report")
                .depends_on(&["b"])
                .with_trigger_rule(TriggerRule::Always),
        )
        .build()
        .unwrap();
    let h = Harness::new(vec![dag], FakeExecutor::new()).await;
    let run = h.trigger("always").await;
    h.passes(1).await;

    // `report` does not wait for `b` to be decided.
    let names: Vec<String> = h
        .executor
        .take_submitted()
        .iter()
        .map(|c| c.key.task_id.to_string())
        .collect();
    assert!(names.contains(&"a".to_string()));
    assert!(names.contains(&"report".to_string()));
    assert_eq!(h.states(&run).await["b"], TaskInstanceState::None);
}

/// Test: one_success fails upstream when no upstream succeeded.
#[tokio::test]
async fn test_one_success() {
    let dag = DagBuilder::new("any")
        .add_task(broken("a"))
        .add_task(ok("b"))
        .add_task(
            ok("any_ok")
                .depends_on(&["a", "b"])
                .with_trigger_rule(TriggerRule::OneSuccess),
        )
        .add_task(broken("c"))
        .add_task(
            ok("none_ok")
                .depends_on(&["a", "c"])
                .with_trigger_rule(TriggerRule::OneSuccess),
        )
        .build()
        .unwrap();
    let h = Harness::new(vec![dag], FakeExecutor::inline()).await;
    let run = finish(&h, "any").await;

    let states = h.states(&run).await;
    assert_eq!(states["any_ok"], TaskInstanceState::Success);
    assert_eq!(states["none_ok"], TaskInstanceState::UpstreamFailed);
}
