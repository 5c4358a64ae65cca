//! Dynamic task mapping integration tests.
//!
//! Tests that verify run-time expansion of mapped tasks from XCom values and
//! literals, and how mapped results flow downstream.

use crate::common::Harness;
use serde_json::{Value, json};
use std::sync::Arc;
use tributary::testing::{ConstUnit, FakeExecutor, FlakyUnit, drive_until_terminal};
use tributary::{
    Dag, DagBuilder, Event, FnUnit, MapSource, RunState, TaskDefinition, TaskInstanceState,
    XComArg,
};

/// `numbers` -> `square` (mapped over `numbers`) -> `total`.
fn fan_out_dag(numbers: Value) -> Dag {
    let square = Arc::new(FnUnit::new("square", |ctx| {
        let x: i64 = ctx.arg("x")?;
        Ok(Some(json!(x * x)))
    }));
    let total = Arc::new(FnUnit::new("total", |ctx| {
        let values: Vec<i64> = ctx.arg("values")?;
        Ok(Some(json!(values.iter().sum::<i64>())))
    }));
    DagBuilder::new("fan_out")
        .add_task(TaskDefinition::new(
            "numbers",
            Arc::new(ConstUnit::new("numbers", numbers)),
        ))
        .add_task(
            TaskDefinition::new("square", square)
                .expand("x", MapSource::XCom(XComArg::new("numbers"))),
        )
        .add_task(
            TaskDefinition::new("total", total).with_xcom_arg("values", XComArg::new("square")),
        )
        .build()
        .unwrap()
}

/// Test: a list of three expands into three instances whose results reach
/// the consumer in map-index order, whatever order they finished in.
#[tokio::test]
async fn test_expansion_results_arrive_in_map_index_order() {
    let h = Harness::new(vec![fan_out_dag(json!([1, 2, 3]))], FakeExecutor::new()).await;
    let run = h.trigger("fan_out").await;

    h.passes(1).await;
    let numbers = h.executor.take_submitted().remove(0);
    h.executor.complete(&numbers, Some(json!([10, 20, 30])));
    h.passes(2).await;

    let squares = h.executor.take_submitted();
    assert_eq!(squares.len(), 3);
    let indices: Vec<Option<usize>> = squares.iter().map(|c| c.key.map_index).collect();
    assert_eq!(indices, vec![Some(0), Some(1), Some(2)]);
    assert_eq!(squares[1].arguments["x"], json!(20));

    h.executor.complete(&squares[2], Some(json!(900)));
    h.executor.complete(&squares[0], Some(json!(100)));
    h.executor.complete(&squares[1], Some(json!(400)));
    h.passes(2).await;

    let total = h.executor.take_submitted().remove(0);
    assert_eq!(total.key.task_id.as_str(), "total");
    assert_eq!(total.arguments["values"], json!([100, 400, 900]));

    h.executor.complete(&total, Some(json!(1400)));
    h.passes(1).await;
    assert_eq!(h.run_state(&run).await, RunState::Success);

    let states = h.states(&run).await;
    assert_eq!(states.len(), 5);
    assert_eq!(states["square[0]"], TaskInstanceState::Success);
    assert!(!states.contains_key("square"));
}

/// Test: an inline run computes the squares end to end.
#[tokio::test]
async fn test_expansion_inline() {
    let h = Harness::new(vec![fan_out_dag(json!([1, 2, 3, 4]))], FakeExecutor::inline()).await;
    let run = h.trigger("fan_out").await;
    let run = drive_until_terminal(&h.scheduler, &run.dag_id, &run.run_id, 10)
        .await
        .unwrap();

    assert_eq!(run.state, RunState::Success);
    let expanded = h
        .recorder
        .events()
        .await
        .into_iter()
        .find_map(|event| match event {
            Event::TaskExpanded { task_id, length, .. } => Some((task_id, length)),
            _ => None,
        });
    assert_eq!(expanded, Some(("square".into(), 4)));
}

/// Test: an empty list expands to nothing and downstream still runs.
#[tokio::test]
async fn test_empty_expansion() {
    let h = Harness::new(vec![fan_out_dag(json!([]))], FakeExecutor::inline()).await;
    let run = h.trigger("fan_out").await;
    let run = drive_until_terminal(&h.scheduler, &run.dag_id, &run.run_id, 10)
        .await
        .unwrap();

    assert_eq!(run.state, RunState::Success);
    let states = h.states(&run).await;
    assert!(states.keys().all(|name| !name.starts_with("square")));
    assert_eq!(states["total"], TaskInstanceState::Success);

    let total = h
        .executor
        .submitted()
        .into_iter()
        .find(|c| c.key.task_id.as_str() == "total")
        .unwrap();
    assert_eq!(total.arguments["values"], json!([]));
}

/// Test: repeated and concurrent passes expand a task only once.
#[tokio::test]
async fn test_expansion_is_idempotent() {
    let h = Harness::new(vec![fan_out_dag(json!([1, 2, 3]))], FakeExecutor::new()).await;
    let run = h.trigger("fan_out").await;
    h.passes(1).await;
    let numbers = h.executor.take_submitted().remove(0);
    h.executor.complete(&numbers, Some(json!([1, 2, 3])));
    h.passes(1).await;

    let (a, b) = tokio::join!(h.scheduler.run_pass(), h.scheduler.run_pass());
    assert_eq!(a.expanded + b.expanded, 1);
    h.passes(2).await;

    let squares = h
        .states(&run)
        .await
        .into_keys()
        .filter(|name| name.starts_with("square"))
        .count();
    assert_eq!(squares, 3);

    let expansions = h
        .recorder
        .events()
        .await
        .iter()
        .filter(|event| matches!(event, Event::TaskExpanded { .. }))
        .count();
    assert_eq!(expansions, 1);
}

/// Test: several literal sources map over their cross product, last source
/// varying fastest, with partial arguments shared by every instance.
#[tokio::test]
async fn test_literal_cross_product() {
    let dag = DagBuilder::new("grid")
        .add_task(
            TaskDefinition::new("cell", Arc::new(ConstUnit::empty("cell")))
                .with_arg("mode", json!("fast"))
                .expand("row", MapSource::Literal(vec![json!(1), json!(2)]))
                .expand(
                    "col",
                    MapSource::Literal(vec![json!("x"), json!("y"), json!("z")]),
                ),
        )
        .build()
        .unwrap();
    let h = Harness::new(vec![dag], FakeExecutor::new()).await;
    let run = h.trigger("grid").await;
    h.passes(1).await;

    let cells = h.executor.take_submitted();
    assert_eq!(cells.len(), 6);
    assert_eq!(cells[1].arguments["row"], json!(1));
    assert_eq!(cells[1].arguments["col"], json!("y"));
    assert_eq!(cells[3].arguments["row"], json!(2));
    assert_eq!(cells[3].arguments["col"], json!("x"));
    assert!(cells.iter().all(|c| c.arguments["mode"] == json!("fast")));

    let stored = h.instance(&run, "cell", Some(5)).await;
    assert_eq!(stored.map_arguments["col"], json!("z"));
}

/// Test: objects map over their `[key, value]` pairs.
#[tokio::test]
async fn test_object_source_maps_over_pairs() {
    let dag = DagBuilder::new("pairs")
        .add_task(TaskDefinition::new(
            "config",
            Arc::new(ConstUnit::new("config", json!({"a": 1, "b": 2}))),
        ))
        .add_task(
            TaskDefinition::new("apply", Arc::new(ConstUnit::empty("apply")))
                .expand("entry", MapSource::XCom(XComArg::new("config"))),
        )
        .build()
        .unwrap();
    let h = Harness::new(vec![dag], FakeExecutor::inline()).await;
    let run = h.trigger("pairs").await;
    drive_until_terminal(&h.scheduler, &run.dag_id, &run.run_id, 10)
        .await
        .unwrap();

    let entries: Vec<Value> = h
        .executor
        .submitted()
        .iter()
        .filter(|c| c.key.task_id.as_str() == "apply")
        .map(|c| c.arguments["entry"].clone())
        .collect();
    assert_eq!(entries, vec![json!(["a", 1]), json!(["b", 2])]);
}

/// Test: a scalar source blocks expansion and the run stays running.
#[tokio::test]
async fn test_scalar_source_blocks_expansion() {
    let h = Harness::new(vec![fan_out_dag(json!(5))], FakeExecutor::inline()).await;
    let run = h.trigger("fan_out").await;
    h.passes(5).await;

    assert_eq!(h.run_state(&run).await, RunState::Running);
    let states = h.states(&run).await;
    assert_eq!(states["numbers"], TaskInstanceState::Success);
    assert_eq!(states["total"], TaskInstanceState::None);
    assert!(!states.contains_key("square[0]"));

    let blocked: Vec<String> = h
        .recorder
        .events()
        .await
        .into_iter()
        .filter_map(|event| match event {
            Event::ExpansionBlocked { reason, .. } => Some(reason),
            _ => None,
        })
        .collect();
    assert_eq!(blocked.len(), 1);
    assert!(blocked[0].contains("expected a list"));
}

/// Test: a failed source leaves the mapped task upstream_failed without
/// creating instances.
#[tokio::test]
async fn test_failed_source_marks_mapped_task_upstream_failed() {
    let dag = DagBuilder::new("broken_source")
        .add_task(TaskDefinition::new(
            "numbers",
            Arc::new(FlakyUnit::new("numbers", u32::MAX)),
        ))
        .add_task(
            TaskDefinition::new("square", Arc::new(ConstUnit::empty("square")))
                .expand("x", MapSource::XCom(XComArg::new("numbers"))),
        )
        .add_task(
            TaskDefinition::new("after", Arc::new(ConstUnit::empty("after")))
                .depends_on(&["square"]),
        )
        .build()
        .unwrap();
    let h = Harness::new(vec![dag], FakeExecutor::inline()).await;
    let run = h.trigger("broken_source").await;
    let run = drive_until_terminal(&h.scheduler, &run.dag_id, &run.run_id, 10)
        .await
        .unwrap();

    assert_eq!(run.state, RunState::Failed);
    let states = h.states(&run).await;
    assert_eq!(states["square"], TaskInstanceState::UpstreamFailed);
    assert_eq!(states["after"], TaskInstanceState::UpstreamFailed);
}

/// Test: one failed map index fails the downstream consumer's dependency.
#[tokio::test]
async fn test_one_failed_index_fails_downstream() {
    let h = Harness::new(vec![fan_out_dag(json!([1, 2]))], FakeExecutor::new()).await;
    let run = h.trigger("fan_out").await;
    h.passes(1).await;
    let numbers = h.executor.take_submitted().remove(0);
    h.executor.complete(&numbers, Some(json!([1, 2])));
    h.passes(2).await;

    let squares = h.executor.take_submitted();
    h.executor.complete(&squares[0], Some(json!(1)));
    h.executor.fail(&squares[1], "boom", false);
    h.passes(2).await;

    let states = h.states(&run).await;
    assert_eq!(states["square[0]"], TaskInstanceState::Success);
    assert_eq!(states["square[1]"], TaskInstanceState::Failed);
    assert_eq!(states["total"], TaskInstanceState::UpstreamFailed);
    assert_eq!(h.run_state(&run).await, RunState::Failed);
}
