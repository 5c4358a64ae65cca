//! YAML configuration parsing.
//!
//! Parses DAG definitions and global configuration from YAML files. Graph
//! checks (cycles, unknown upstreams, argument names) happen when the DAG is
//! built; this module only rejects files that cannot describe a DAG at all.

use std::collections::HashSet;
use std::path::Path;

use super::error::ConfigError;
use super::types::{DagConfig, TributaryConfig};

/// YAML configuration loader.
pub struct YamlLoader;

impl YamlLoader {
    /// Load global configuration from a file.
    pub fn load_global_config(path: impl AsRef<Path>) -> Result<TributaryConfig, ConfigError> {
        let path = path.as_ref();
        let content = read_file(path)?;
        serde_yaml::from_str(&content).map_err(|e| ConfigError::YamlFileError {
            path: path.to_path_buf(),
            source: e,
        })
    }

    /// Parse global configuration from a YAML string.
    pub fn parse_global_config(yaml: &str) -> Result<TributaryConfig, ConfigError> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    /// Load a DAG definition from a file.
    pub fn load_dag_config(path: impl AsRef<Path>) -> Result<DagConfig, ConfigError> {
        let path = path.as_ref();
        let content = read_file(path)?;
        let config: DagConfig =
            serde_yaml::from_str(&content).map_err(|e| ConfigError::YamlFileError {
                path: path.to_path_buf(),
                source: e,
            })?;
        Self::validate_dag_config(&config)?;
        Ok(config)
    }

    /// Parse a DAG definition from a YAML string.
    pub fn parse_dag_config(yaml: &str) -> Result<DagConfig, ConfigError> {
        let config: DagConfig = serde_yaml::from_str(yaml)?;
        Self::validate_dag_config(&config)?;
        Ok(config)
    }

    fn validate_dag_config(config: &DagConfig) -> Result<(), ConfigError> {
        if config.id.trim().is_empty() {
            return Err(ConfigError::MissingField("id".into()));
        }
        if config.tasks.is_empty() {
            return Err(ConfigError::InvalidConfig(format!(
                "DAG '{}' must have at least one task",
                config.id
            )));
        }

        let mut seen = HashSet::new();
        for task in &config.tasks {
            if task.id.trim().is_empty() {
                return Err(ConfigError::MissingField(format!(
                    "tasks[].id in DAG '{}'",
                    config.id
                )));
            }
            if task.id.contains('.') {
                return Err(ConfigError::InvalidConfig(format!(
                    "task id '{}' must not contain '.'; use `group` instead",
                    task.id
                )));
            }
            if task.command.trim().is_empty() {
                return Err(ConfigError::MissingField(format!(
                    "command for task '{}'",
                    task.id
                )));
            }
            if task.pool_slots == Some(0) {
                return Err(ConfigError::InvalidConfig(format!(
                    "task '{}': pool_slots must be at least 1",
                    task.id
                )));
            }

            let full_id = match &task.group {
                Some(group) => format!("{}.{}", group, task.id),
                None => task.id.clone(),
            };
            if !seen.insert(full_id.clone()) {
                return Err(ConfigError::InvalidConfig(format!(
                    "duplicate task id '{}'",
                    full_id
                )));
            }

            task.expand_sources()?;
        }

        Ok(())
    }
}

fn read_file(path: &Path) -> Result<String, ConfigError> {
    std::fs::read_to_string(path).map_err(|e| ConfigError::FileReadError {
        path: path.to_path_buf(),
        source: e,
    })
}
