//! Configuration error types.

use std::path::PathBuf;
use thiserror::Error;

use crate::core::dag::DagError;
use crate::core::schedule::ScheduleError;

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read a specific file.
    #[error("failed to read file '{path}': {source}")]
    FileReadError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Failed to read a directory.
    #[error("failed to read directory '{path}': {source}")]
    DirReadError {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    /// Failed to parse YAML.
    #[error("YAML parse error: {0}")]
    YamlError(#[from] serde_yaml::Error),

    /// Failed to parse YAML from a specific file.
    #[error("YAML parse error in '{path}': {source}")]
    YamlFileError {
        path: PathBuf,
        #[source]
        source: serde_yaml::Error,
    },

    /// Invalid configuration value.
    #[error("invalid configuration: {0}")]
    InvalidConfig(String),

    /// Missing required field.
    #[error("missing required field: {0}")]
    MissingField(String),

    /// The schedule expression or timezone could not be parsed.
    #[error("invalid schedule for DAG '{dag}': {source}")]
    InvalidSchedule {
        dag: String,
        #[source]
        source: ScheduleError,
    },

    /// The tasks do not form a valid DAG.
    #[error("invalid DAG '{dag}': {source}")]
    InvalidDag {
        dag: String,
        #[source]
        source: DagError,
    },
}
