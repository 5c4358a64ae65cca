//! YAML loading integration tests.
//!
//! Tests that verify DAGs loaded from a directory of YAML files run through
//! the scheduler, both with a scripted executor and with real processes.

use crate::common::{Harness, wait_for_terminal};
use serde_json::json;
use std::fs;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tributary::testing::FakeExecutor;
use tributary::{
    ConfigError, EventBus, InMemoryStorage, RunState, Scheduler, TaskId, TaskInstanceState,
    TributaryConfig, YamlLoader, load_dags_from_directory,
};

const PIPELINE: &str = r#"
id: pipeline
description: Extract, fan out and report
tasks:
  - id: extract
    group: ingest
    command: sh
    args: ["-c", "echo '[1, 2, 3]'"]
  - id: process
    group: ingest
    command: sh
    args: ["-c", "echo $((TRIB_ARG_ITEM * 10))"]
    params: [item, mode]
    partial:
      mode: fast
    expand:
      item: { from: extract }
  - id: report
    command: sh
    args: ["-c", "echo \"$TRIB_ARG_TOTALS\""]
    params: [totals]
    partial:
      totals: { from: ingest.process }
"#;

fn write(dir: &Path, name: &str, contents: &str) {
    fs::write(dir.join(name), contents).unwrap();
}

fn pipeline_dir() -> TempDir {
    let dir = TempDir::new().unwrap();
    write(dir.path(), "pipeline.yaml", PIPELINE);
    dir
}

/// Test: grouped task ids are qualified with the group name.
#[tokio::test]
async fn test_loaded_dag_uses_group_qualified_ids() {
    let dir = pipeline_dir();
    let dags = load_dags_from_directory(dir.path(), &TributaryConfig::default()).unwrap();
    assert_eq!(dags.len(), 1);

    let dag = &dags[0];
    let ids: Vec<&str> = dag.topological_order().iter().map(|t| t.as_str()).collect();
    assert_eq!(ids, vec!["ingest.extract", "ingest.process", "report"]);
    assert!(dag.task(&TaskId::new("ingest.process")).unwrap().is_mapped());
    assert_eq!(
        dag.upstream(&TaskId::new("ingest.process")),
        &[TaskId::new("ingest.extract")]
    );
}

/// Test: a loaded DAG is scheduled like a coded one.
#[tokio::test]
async fn test_loaded_dag_runs_with_scripted_executor() {
    let dir = pipeline_dir();
    let dags = load_dags_from_directory(dir.path(), &TributaryConfig::default()).unwrap();
    let h = Harness::new(dags, FakeExecutor::new()).await;
    let run = h.trigger("pipeline").await;

    h.passes(1).await;
    let extract = h.executor.take_submitted().remove(0);
    assert_eq!(extract.key.task_id.as_str(), "ingest.extract");
    h.executor.complete(&extract, Some(json!(["a", "b"])));
    h.passes(2).await;

    let processes = h.executor.take_submitted();
    assert_eq!(processes.len(), 2);
    assert_eq!(processes[0].arguments["item"], json!("a"));
    assert_eq!(processes[0].arguments["mode"], json!("fast"));
    for command in &processes {
        h.executor.complete(command, None);
    }
    h.passes(2).await;

    let report = h.executor.take_submitted().remove(0);
    assert_eq!(report.arguments["totals"], json!([]));
    h.executor.complete(&report, None);
    h.passes(1).await;

    assert_eq!(h.run_state(&run).await, RunState::Success);
    let states = h.states(&run).await;
    assert_eq!(states["ingest.process[1]"], TaskInstanceState::Success);
}

/// Test: processes run end to end, passing values through XCom.
#[cfg(unix)]
#[tokio::test]
async fn test_loaded_dag_runs_real_processes() {
    let dir = pipeline_dir();
    let config = TributaryConfig::default();
    let dags = load_dags_from_directory(dir.path(), &config).unwrap();

    let storage = Arc::new(InMemoryStorage::new());
    let mut scheduler = Scheduler::new(Arc::clone(&storage), Arc::new(config.local_executor()))
        .with_event_bus(Arc::new(EventBus::new()))
        .with_pools(config.pool_registry());
    for dag in dags {
        scheduler.register(dag);
    }

    let run = scheduler
        .trigger_run(&"pipeline".into(), None)
        .await
        .unwrap();
    let run = wait_for_terminal(&scheduler, &run, Duration::from_secs(30)).await;
    assert_eq!(run.state, RunState::Success);

    let xcom = tributary::XComStore::new(Arc::clone(&storage));
    let totals = xcom
        .get_many(&run.dag_id, &run.run_id, &TaskId::new("ingest.process"))
        .await
        .unwrap();
    assert_eq!(
        totals.into_values().collect::<Vec<_>>(),
        vec![json!(10), json!(20), json!(30)]
    );

    let report = tributary::TaskInstanceKey::new(run.dag_id.clone(), run.run_id.clone(), "report".into());
    let echoed = xcom
        .get(&tributary::XComKey::return_value(&report))
        .await
        .unwrap();
    assert_eq!(echoed, json!([10, 20, 30]));
    scheduler.executor().close();
}

/// Test: global configuration feeds pools and scheduler settings.
#[test]
fn test_global_config_file() {
    let dir = TempDir::new().unwrap();
    write(
        dir.path(),
        "tributary.yaml",
        r#"
tick_interval_ms: 250
zombie_threshold_secs: 60
pools:
  db: 2
"#,
    );
    let config = YamlLoader::load_global_config(dir.path().join("tributary.yaml")).unwrap();

    assert_eq!(config.scheduler_config().tick_interval, Duration::from_millis(250));
    assert_eq!(config.scheduler_config().zombie_threshold, Duration::from_secs(60));
    assert_eq!(config.pool_registry().get("db").unwrap().slots, 2);
    assert!(config.pool_registry().get(tributary::DEFAULT_POOL).is_some());
}

/// Test: an invalid file in the directory fails the whole load.
#[test]
fn test_invalid_file_fails_directory_load() {
    let dir = pipeline_dir();
    write(
        dir.path(),
        "broken.yaml",
        r#"
id: broken
tasks:
  - id: a
    command: x
    depends_on: [nowhere]
"#,
    );

    let err = load_dags_from_directory(dir.path(), &TributaryConfig::default()).unwrap_err();
    assert!(matches!(err, ConfigError::InvalidDag { ref dag, .. } if dag == "broken"));
}
