//! DAG builder from YAML configuration.
//!
//! Converts a [`DagConfig`] into a validated [`Dag`] whose tasks run as
//! [`CommandUnit`]s.

use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use tracing::debug;

use crate::core::dag::{Dag, DagBuilder, MapSource, TaskDefinition, XComArg};
use crate::core::pool::DEFAULT_POOL;
use crate::core::schedule::Schedule;
use crate::execution::CommandUnit;

use super::error::ConfigError;
use super::types::{
    ArgConfig, DagConfig, MapSourceConfig, TaskConfig, TributaryConfig, XComRefConfig,
};
use super::yaml::YamlLoader;

/// Builder for creating DAGs from YAML configuration.
pub struct DagConfigBuilder;

impl DagConfigBuilder {
    /// Build a DAG from its configuration, with global defaults applied.
    pub fn build(config: DagConfig, global: &TributaryConfig) -> Result<Dag, ConfigError> {
        let mut builder = DagBuilder::new(config.id.as_str());

        if let Some(description) = &config.description {
            builder = builder.with_description(description);
        }
        if let Some(schedule_config) = &config.schedule {
            let schedule = match schedule_config.timezone() {
                Some(tz) => Schedule::with_timezone(schedule_config.expression(), tz),
                None => Schedule::new(schedule_config.expression()),
            }
            .map_err(|e| ConfigError::InvalidSchedule {
                dag: config.id.clone(),
                source: e,
            })?;
            builder = builder.with_schedule(schedule);
        }
        if let Some(max) = config.max_active_runs {
            builder = builder.with_max_active_runs(max);
        }
        if let Some(max) = config.max_active_tasks {
            builder = builder.with_max_active_tasks(max);
        }
        if let Some(retry) = config.default_retry.as_ref().or(global.default_retry.as_ref()) {
            builder = builder.with_default_retry(retry.to_policy());
        }

        for task_config in &config.tasks {
            let task = Self::build_task(task_config, &config)?;
            builder = match &task_config.group {
                Some(group) => builder.group(group, |b| b.add_task(task)),
                None => builder.add_task(task),
            };
        }

        builder.build().map_err(|e| ConfigError::InvalidDag {
            dag: config.id.clone(),
            source: e,
        })
    }

    fn build_task(config: &TaskConfig, dag: &DagConfig) -> Result<TaskDefinition, ConfigError> {
        let mut unit = CommandUnit::builder(&config.command)
            .name(&config.id)
            .args(config.args.iter());
        for (key, value) in &config.env {
            unit = unit.env(key, value);
        }
        if let Some(dir) = &config.working_dir {
            unit = unit.working_dir(dir);
        }
        if let Some(params) = &config.params {
            unit = unit.params(params.iter());
        }

        let deps: Vec<&str> = config.depends_on.iter().map(String::as_str).collect();
        let mut task = TaskDefinition::new(config.id.as_str(), Arc::new(unit.build()))
            .depends_on(&deps)
            .with_multiple_outputs(config.multiple_outputs);

        if let Some(rule) = config.trigger_rule.or(dag.default_trigger_rule) {
            task = task.with_trigger_rule(rule);
        }
        if let Some(retry) = &config.retry {
            task = task.with_retry(retry.to_policy());
        }
        match (&config.pool, config.pool_slots) {
            (Some(pool), slots) => task = task.with_pool(pool, slots.unwrap_or(1)),
            (None, Some(slots)) => task = task.with_pool(DEFAULT_POOL, slots),
            (None, None) => {}
        }
        if let Some(secs) = config.execution_timeout_secs {
            task = task.with_execution_timeout(Duration::from_secs(secs));
        }

        for (name, arg) in &config.partial {
            task = match arg {
                ArgConfig::XCom(reference) => task.with_xcom_arg(name, xcom_arg(reference)),
                ArgConfig::Literal(value) => task.with_arg(name, value.clone()),
            };
        }
        for (name, source) in config.expand_sources()? {
            let source = match source {
                MapSourceConfig::XCom(reference) => MapSource::XCom(xcom_arg(&reference)),
                MapSourceConfig::Literal(values) => MapSource::Literal(values),
            };
            task = task.expand(name, source);
        }

        Ok(task)
    }
}

fn xcom_arg(reference: &XComRefConfig) -> XComArg {
    let arg = XComArg::new(reference.from.as_str());
    match &reference.key {
        Some(key) => arg.with_key(key),
        None => arg,
    }
}

/// Load every DAG file (`.yaml`/`.yml`) in a directory.
///
/// Files are read in name order. Two files declaring the same DAG id is an
/// error.
pub fn load_dags_from_directory(
    dir: impl AsRef<Path>,
    global: &TributaryConfig,
) -> Result<Vec<Dag>, ConfigError> {
    let dir = dir.as_ref();

    if !dir.is_dir() {
        return Err(ConfigError::InvalidConfig(format!(
            "'{}' is not a directory",
            dir.display()
        )));
    }

    let dir_error = |e: std::io::Error| ConfigError::DirReadError {
        path: dir.to_path_buf(),
        source: e,
    };
    let mut paths: Vec<PathBuf> = Vec::new();
    for entry in std::fs::read_dir(dir).map_err(dir_error)? {
        let path = entry.map_err(dir_error)?.path();
        if let Some(ext) = path.extension()
            && (ext == "yaml" || ext == "yml")
        {
            paths.push(path);
        }
    }
    paths.sort();

    let mut seen = HashSet::new();
    let mut dags = Vec::with_capacity(paths.len());
    for path in paths {
        let config = YamlLoader::load_dag_config(&path)?;
        if !seen.insert(config.id.clone()) {
            return Err(ConfigError::InvalidConfig(format!(
                "DAG '{}' is defined more than once (again in '{}')",
                config.id,
                path.display()
            )));
        }
        let dag = DagConfigBuilder::build(config, global)?;
        debug!(dag = %dag.id(), path = %path.display(), tasks = dag.len(), "loaded DAG");
        dags.push(dag);
    }

    Ok(dags)
}
