//! Configuration loading and parsing.
//!
//! YAML configuration for DAG files and global scheduler settings.

mod builder;
mod error;
mod types;
mod yaml;

pub use builder::{DagConfigBuilder, load_dags_from_directory};
pub use error::ConfigError;
pub use types::{
    ArgConfig, DagConfig, MapSourceConfig, RetryConfig, ScheduleConfig, TaskConfig,
    TributaryConfig, XComRefConfig,
};
pub use yaml::YamlLoader;
