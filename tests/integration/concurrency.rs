//! Concurrency integration tests.
//!
//! Tests that verify pool and DAG limits hold when several scheduler passes
//! run at the same time.

use crate::common::start_time;
use std::collections::HashSet;
use std::sync::Arc;
use tributary::testing::{ConstUnit, FakeExecutor, ManualClock};
use tributary::{
    Dag, DagBuilder, InMemoryStorage, PoolRegistry, Scheduler, Storage, TaskDefinition,
    TaskInstanceState,
};

fn pooled_dag(id: &str, tasks: usize, pool: &str, slots: u32) -> Dag {
    let mut builder = DagBuilder::new(id);
    for i in 0..tasks {
        let name = format!("t{}", i);
        builder = builder.add_task(
            TaskDefinition::new(name.as_str(), Arc::new(ConstUnit::empty(name.as_str())))
                .with_pool(pool, slots),
        );
    }
    builder.build().unwrap()
}

fn scheduler(
    dags: Vec<Dag>,
    pools: PoolRegistry,
) -> (
    Scheduler<InMemoryStorage, FakeExecutor>,
    Arc<InMemoryStorage>,
    Arc<FakeExecutor>,
) {
    let storage = Arc::new(InMemoryStorage::new());
    let executor = Arc::new(FakeExecutor::new());
    let mut scheduler = Scheduler::new(Arc::clone(&storage), Arc::clone(&executor))
        .with_clock(Arc::new(ManualClock::new(start_time())))
        .with_pools(pools);
    for dag in dags {
        scheduler.register(dag);
    }
    (scheduler, storage, executor)
}

async fn count_in_state(storage: &InMemoryStorage, state: TaskInstanceState) -> usize {
    storage
        .list_instances_in_state(&[state])
        .await
        .unwrap()
        .len()
}

/// Test: two passes racing over a one-slot pool admit a single instance.
#[tokio::test]
async fn test_racing_passes_respect_pool_capacity() {
    let pools = PoolRegistry::default().with_pool("single", 1);
    let (scheduler, storage, executor) = scheduler(vec![pooled_dag("racy", 4, "single", 1)], pools);
    scheduler.trigger_run(&"racy".into(), None).await.unwrap();

    let (a, b) = tokio::join!(scheduler.run_pass(), scheduler.run_pass());
    assert_eq!(a.admitted + b.admitted, 1);
    assert_eq!(executor.submitted().len(), 1);
    assert_eq!(count_in_state(&storage, TaskInstanceState::Queued).await, 1);
    assert_eq!(count_in_state(&storage, TaskInstanceState::Scheduled).await, 3);
}

/// Test: passes on worker threads never submit an instance twice and never
/// exceed the pool.
#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_parallel_passes_submit_each_instance_once() {
    let pools = PoolRegistry::default().with_pool("shared", 3);
    let (scheduler, storage, executor) = scheduler(
        vec![
            pooled_dag("left", 5, "shared", 1),
            pooled_dag("right", 5, "shared", 1),
        ],
        pools,
    );
    let scheduler = Arc::new(scheduler);
    scheduler.trigger_run(&"left".into(), None).await.unwrap();
    scheduler.trigger_run(&"right".into(), None).await.unwrap();

    let mut handles = Vec::new();
    for _ in 0..8 {
        let scheduler = Arc::clone(&scheduler);
        handles.push(tokio::spawn(async move { scheduler.run_pass().await }));
    }
    for handle in handles {
        handle.await.unwrap();
    }

    let submitted = executor.submitted();
    let unique: HashSet<_> = submitted.iter().map(|c| c.key.clone()).collect();
    assert_eq!(unique.len(), submitted.len());
    assert_eq!(submitted.len(), 3);
    assert_eq!(count_in_state(&storage, TaskInstanceState::Queued).await, 3);
}

/// Test: pool slots are weighted by each instance's slot count.
#[tokio::test]
async fn test_weighted_pool_slots() {
    let pools = PoolRegistry::default().with_pool("gpu", 3);
    let (scheduler, _storage, executor) =
        scheduler(vec![pooled_dag("train", 3, "gpu", 2)], pools);
    scheduler.trigger_run(&"train".into(), None).await.unwrap();

    scheduler.run_pass().await;
    scheduler.run_pass().await;
    let first = executor.take_submitted();
    assert_eq!(first.len(), 1);
    assert_eq!(first[0].key.task_id.as_str(), "t0");

    executor.complete(&first[0], None);
    scheduler.run_pass().await;
    scheduler.run_pass().await;
    let second = executor.take_submitted();
    assert_eq!(second.len(), 1);
    assert_eq!(second[0].key.task_id.as_str(), "t1");
}

/// Test: max_active_tasks caps active instances per DAG across runs.
#[tokio::test]
async fn test_max_active_tasks_limits_dag() {
    let dag = DagBuilder::new("capped")
        .with_max_active_tasks(2)
        .add_task(TaskDefinition::new("a", Arc::new(ConstUnit::empty("a"))))
        .add_task(TaskDefinition::new("b", Arc::new(ConstUnit::empty("b"))))
        .add_task(TaskDefinition::new("c", Arc::new(ConstUnit::empty("c"))))
        .build()
        .unwrap();
    let (scheduler, storage, executor) = scheduler(vec![dag], PoolRegistry::default());
    scheduler.trigger_run(&"capped".into(), None).await.unwrap();

    let (a, b) = tokio::join!(scheduler.run_pass(), scheduler.run_pass());
    assert_eq!(a.admitted + b.admitted, 2);
    let mut names: Vec<String> = executor
        .take_submitted()
        .iter()
        .map(|c| c.key.task_id.to_string())
        .collect();
    names.sort();
    assert_eq!(names, vec!["a".to_string(), "b".to_string()]);
    assert_eq!(count_in_state(&storage, TaskInstanceState::Scheduled).await, 1);
}

/// Test: an instance in an unknown pool waits instead of failing.
#[tokio::test]
async fn test_unknown_pool_waits() {
    let (scheduler, storage, executor) = scheduler(
        vec![pooled_dag("orphan", 1, "missing_pool", 1)],
        PoolRegistry::default(),
    );
    scheduler.trigger_run(&"orphan".into(), None).await.unwrap();

    for _ in 0..3 {
        let summary = scheduler.run_pass().await;
        assert_eq!(summary.admitted, 0);
    }
    assert!(executor.submitted().is_empty());
    assert_eq!(count_in_state(&storage, TaskInstanceState::Scheduled).await, 1);
}
