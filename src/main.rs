//! trib - command-line front end for the tributary scheduler.
//!
//! Usage:
//!   trib run <dags-dir>               Run the scheduler until Ctrl+C
//!   trib validate <dags-dir>          Validate DAG files without running
//!   trib list <dags-dir>              List DAGs and their tasks
//!   trib trigger <dags-dir> <dag-id>  Run one DAG once and print the outcome

use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{error, info, warn};
use tributary::{
    CreateRunRequest, Dag, DagId, EventBus, InMemoryStorage, Scheduler, Storage,
    TracingHandler, TributaryConfig, YamlLoader, load_dags_from_directory,
};

/// trib - a DAG workflow scheduler
#[derive(Parser)]
#[command(name = "trib")]
#[command(author, version, about, long_about = None)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run the scheduler with DAGs from a directory
    Run {
        /// Directory containing DAG YAML files
        #[arg(value_name = "DAGS_DIR")]
        dags_dir: PathBuf,

        /// Global configuration file (tributary.yaml)
        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,
    },

    /// Validate DAG files without running
    Validate {
        /// Directory containing DAG YAML files
        #[arg(value_name = "DAGS_DIR")]
        dags_dir: PathBuf,

        /// Global configuration file (tributary.yaml)
        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,
    },

    /// List all DAGs in the directory
    List {
        /// Directory containing DAG YAML files
        #[arg(value_name = "DAGS_DIR")]
        dags_dir: PathBuf,
    },

    /// Run one DAG once and wait for it to finish
    Trigger {
        /// Directory containing DAG YAML files
        #[arg(value_name = "DAGS_DIR")]
        dags_dir: PathBuf,

        /// DAG to run
        #[arg(value_name = "DAG_ID")]
        dag_id: String,

        /// Logical date of the run (RFC 3339); defaults to now
        #[arg(long, value_name = "RFC3339")]
        logical_date: Option<DateTime<Utc>>,

        /// Global configuration file (tributary.yaml)
        #[arg(short, long, value_name = "FILE")]
        config: Option<PathBuf>,
    },
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new("info")),
        )
        .init();

    let cli = Cli::parse();

    match cli.command {
        Commands::Run { dags_dir, config } => {
            let config = load_config(config.as_deref())?;
            run_scheduler(&dags_dir, config).await?;
        }
        Commands::Validate { dags_dir, config } => {
            let config = load_config(config.as_deref())?;
            validate_dags(&dags_dir, &config)?;
        }
        Commands::List { dags_dir } => {
            list_dags(&dags_dir)?;
        }
        Commands::Trigger {
            dags_dir,
            dag_id,
            logical_date,
            config,
        } => {
            let config = load_config(config.as_deref())?;
            trigger_dag(&dags_dir, dag_id.into(), logical_date, config).await?;
        }
    }

    Ok(())
}

fn load_config(path: Option<&Path>) -> Result<TributaryConfig, Box<dyn std::error::Error>> {
    match path {
        Some(path) => {
            info!("Loading configuration from: {}", path.display());
            Ok(YamlLoader::load_global_config(path)?)
        }
        None => Ok(TributaryConfig::default()),
    }
}

async fn build_scheduler(
    dags: Vec<Dag>,
    config: &TributaryConfig,
) -> Scheduler<InMemoryStorage, tributary::LocalExecutor> {
    let event_bus = Arc::new(EventBus::new());
    event_bus.register(Arc::new(TracingHandler)).await;

    let mut scheduler = Scheduler::new(
        Arc::new(InMemoryStorage::new()),
        Arc::new(config.local_executor()),
    )
    .with_event_bus(event_bus)
    .with_pools(config.pool_registry())
    .with_config(config.scheduler_config());

    for dag in dags {
        scheduler.register(dag);
    }
    scheduler
}

/// Run the scheduler with DAGs from a directory.
async fn run_scheduler(
    dags_dir: &Path,
    config: TributaryConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    info!("Loading DAGs from: {}", dags_dir.display());
    let dags = load_dags_from_directory(dags_dir, &config)?;

    if dags.is_empty() {
        warn!("No DAG files found in {}", dags_dir.display());
        return Ok(());
    }

    info!("Loaded {} DAG(s):", dags.len());
    for dag in &dags {
        let schedule = dag
            .schedule()
            .map(|s| s.expression().to_string())
            .unwrap_or_else(|| "manual only".to_string());
        info!("  - {} ({}): {} task(s)", dag.id(), schedule, dag.len());
    }

    let scheduler = build_scheduler(dags, &config).await;
    let executor = Arc::clone(scheduler.executor());

    info!(
        "Starting scheduler (tick interval: {}ms)...",
        config.tick_interval_ms
    );
    info!("Press Ctrl+C to stop");

    let (handle, scheduler_task) = scheduler.start().await;

    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Shutting down...");
            handle.shutdown().await?;
        }
        _ = scheduler_task => {
            info!("Scheduler stopped");
        }
    }

    executor.close();
    Ok(())
}

/// Validate DAG files without running.
fn validate_dags(
    dags_dir: &Path,
    config: &TributaryConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    info!("Validating DAGs in: {}", dags_dir.display());

    match load_dags_from_directory(dags_dir, config) {
        Ok(dags) => {
            info!("All {} DAG(s) are valid:", dags.len());
            for dag in &dags {
                info!("  - {}: OK", dag.id());
            }
            Ok(())
        }
        Err(e) => {
            error!("Validation failed: {}", e);
            Err(e.into())
        }
    }
}

/// List all DAGs in the directory.
fn list_dags(dags_dir: &Path) -> Result<(), Box<dyn std::error::Error>> {
    let dags = load_dags_from_directory(dags_dir, &TributaryConfig::default())?;

    if dags.is_empty() {
        println!("No DAGs found in {}", dags_dir.display());
        return Ok(());
    }

    println!("DAGs in {}:", dags_dir.display());
    println!();

    for dag in &dags {
        println!("ID: {}", dag.id());
        if let Some(description) = dag.description() {
            println!("  Description: {}", description);
        }
        match dag.schedule() {
            Some(schedule) => println!(
                "  Schedule: {} ({})",
                schedule.expression(),
                schedule.timezone()
            ),
            None => println!("  Schedule: manual only"),
        }
        println!("  Max active runs: {}", dag.max_active_runs());
        println!("  Tasks: {}", dag.len());

        for task_id in dag.topological_order() {
            let mapped = dag
                .task(task_id)
                .is_some_and(|t| t.is_mapped())
                .then_some(" [mapped]")
                .unwrap_or_default();
            let deps = dag.upstream(task_id);
            if deps.is_empty() {
                println!("    - {}{}", task_id, mapped);
            } else {
                let dep_names: Vec<&str> = deps.iter().map(|d| d.as_str()).collect();
                println!(
                    "    - {}{} (depends on: {})",
                    task_id,
                    mapped,
                    dep_names.join(", ")
                );
            }
        }

        println!();
    }

    Ok(())
}

/// Run one DAG once and print every instance's outcome.
async fn trigger_dag(
    dags_dir: &Path,
    dag_id: DagId,
    logical_date: Option<DateTime<Utc>>,
    config: TributaryConfig,
) -> Result<(), Box<dyn std::error::Error>> {
    info!("Loading DAGs from: {}", dags_dir.display());
    let dags = load_dags_from_directory(dags_dir, &config)?;

    if !dags.iter().any(|d| d.id() == &dag_id) {
        error!("DAG '{}' not found", dag_id);
        error!(
            "Available DAGs: {}",
            dags.iter()
                .map(|d| d.id().as_str())
                .collect::<Vec<_>>()
                .join(", ")
        );
        return Err(format!("DAG '{}' not found", dag_id).into());
    }

    let tick = config.scheduler_config().tick_interval;
    let scheduler = build_scheduler(dags, &config).await;
    let request = CreateRunRequest::manual(logical_date.unwrap_or_else(Utc::now));
    let run = scheduler.trigger_run(&dag_id, Some(request)).await?;
    info!("Triggered run {} of DAG '{}'", run.run_id, dag_id);

    let run = loop {
        scheduler.run_pass().await;
        let run = scheduler.storage().get_run(&dag_id, &run.run_id).await?;
        if run.state.is_terminal() {
            break run;
        }
        tokio::time::sleep(tick).await;
    };
    scheduler.executor().close();

    println!("Run {} of DAG '{}': {}", run.run_id, dag_id, run.state);
    for instance in scheduler
        .storage()
        .list_instances(&dag_id, &run.run_id)
        .await?
    {
        let index = instance
            .key
            .map_index
            .map(|i| format!("[{}]", i))
            .unwrap_or_default();
        let reason = instance
            .failure_reason
            .as_deref()
            .map(|r| format!(" ({})", r))
            .unwrap_or_default();
        println!(
            "  {}{}: {} (try {}){}",
            instance.key.task_id, index, instance.state, instance.try_number, reason
        );
    }

    if run.state == tributary::RunState::Failed {
        return Err(format!("run {} failed", run.run_id).into());
    }
    Ok(())
}
