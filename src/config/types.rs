//! Configuration type definitions.
//!
//! Global scheduler settings (`tributary.yaml`) and DAG files.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::time::Duration;

use super::error::ConfigError;
use crate::core::dag::TriggerRule;
use crate::core::pool::{DEFAULT_POOL_SLOTS, PoolRegistry};
use crate::core::retry::{RetryCondition, RetryPolicy};
use crate::execution::LocalExecutor;
use crate::scheduler::SchedulerConfig;

/// Global configuration (`tributary.yaml`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TributaryConfig {
    /// Milliseconds between scheduler passes.
    pub tick_interval_ms: u64,
    /// Seconds without a heartbeat before a running instance is a zombie.
    pub zombie_threshold_secs: u64,
    /// Seconds an instance may stay queued before it is rescheduled.
    pub queued_timeout_secs: Option<u64>,
    /// Seconds between executor heartbeats.
    pub heartbeat_interval_secs: u64,
    /// Concurrent executions in the local executor.
    pub parallelism: usize,
    /// Slots of the default pool.
    pub default_pool_slots: u32,
    /// Named pools and their slot counts.
    pub pools: BTreeMap<String, u32>,
    /// Retry policy for DAGs that set none.
    pub default_retry: Option<RetryConfig>,
}

impl Default for TributaryConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: 1000,
            zombie_threshold_secs: 300,
            queued_timeout_secs: Some(600),
            heartbeat_interval_secs: 5,
            parallelism: 4,
            default_pool_slots: DEFAULT_POOL_SLOTS,
            pools: BTreeMap::new(),
            default_retry: None,
        }
    }
}

impl TributaryConfig {
    /// Scheduler timing derived from this configuration.
    pub fn scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig {
            tick_interval: Duration::from_millis(self.tick_interval_ms.max(1)),
            zombie_threshold: Duration::from_secs(self.zombie_threshold_secs),
            queued_timeout: self.queued_timeout_secs.map(Duration::from_secs),
        }
    }

    /// Pool registry holding the default pool and every named pool.
    pub fn pool_registry(&self) -> PoolRegistry {
        self.pools
            .iter()
            .fold(PoolRegistry::new(self.default_pool_slots), |registry, (name, slots)| {
                registry.with_pool(name, *slots)
            })
    }

    /// A local executor sized by `parallelism`.
    pub fn local_executor(&self) -> LocalExecutor {
        LocalExecutor::new(self.parallelism.max(1))
            .with_heartbeat_interval(Duration::from_secs(self.heartbeat_interval_secs.max(1)))
    }
}

/// DAG configuration from YAML.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DagConfig {
    /// DAG identifier.
    pub id: String,
    /// Human-readable description.
    #[serde(default)]
    pub description: Option<String>,
    /// Schedule for automatic runs.
    #[serde(default)]
    pub schedule: Option<ScheduleConfig>,
    #[serde(default)]
    pub max_active_runs: Option<usize>,
    #[serde(default)]
    pub max_active_tasks: Option<usize>,
    /// Trigger rule for tasks that set none.
    #[serde(default)]
    pub default_trigger_rule: Option<TriggerRule>,
    /// Retry policy for tasks that set none.
    #[serde(default)]
    pub default_retry: Option<RetryConfig>,
    /// Tasks in declaration order.
    pub tasks: Vec<TaskConfig>,
}

/// Schedule configuration: a bare expression or an expression with timezone.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ScheduleConfig {
    /// Cron expression, shortcut or `@every` interval.
    Simple(String),
    /// Expression evaluated in a timezone.
    Detailed {
        cron: String,
        timezone: Option<String>,
    },
}

impl ScheduleConfig {
    /// Get the schedule expression.
    pub fn expression(&self) -> &str {
        match self {
            ScheduleConfig::Simple(s) => s,
            ScheduleConfig::Detailed { cron, .. } => cron,
        }
    }

    /// Get the timezone, if specified.
    pub fn timezone(&self) -> Option<&str> {
        match self {
            ScheduleConfig::Simple(_) => None,
            ScheduleConfig::Detailed { timezone, .. } => timezone.as_deref(),
        }
    }
}

/// Task configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskConfig {
    /// Task identifier, unique within its group.
    pub id: String,
    /// Program to run.
    pub command: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
    #[serde(default)]
    pub working_dir: Option<String>,
    /// Accepted argument names. Any name is accepted when absent.
    #[serde(default)]
    pub params: Option<Vec<String>>,
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Group path; nested groups are separated with `.`.
    #[serde(default)]
    pub group: Option<String>,
    #[serde(default)]
    pub trigger_rule: Option<TriggerRule>,
    #[serde(default)]
    pub retry: Option<RetryConfig>,
    #[serde(default)]
    pub pool: Option<String>,
    #[serde(default)]
    pub pool_slots: Option<u32>,
    #[serde(default)]
    pub execution_timeout_secs: Option<u64>,
    #[serde(default)]
    pub multiple_outputs: bool,
    /// Arguments shared by every instance.
    #[serde(default)]
    pub partial: BTreeMap<String, ArgConfig>,
    /// Mapped arguments. Entry order decides the order of the cross product.
    #[serde(default)]
    pub expand: serde_yaml::Mapping,
}

impl TaskConfig {
    /// Mapped arguments in declaration order.
    pub fn expand_sources(&self) -> Result<Vec<(String, MapSourceConfig)>, ConfigError> {
        self.expand
            .iter()
            .map(|(name, source)| {
                let name = name.as_str().ok_or_else(|| {
                    ConfigError::InvalidConfig(format!(
                        "task '{}': expand keys must be strings",
                        self.id
                    ))
                })?;
                let source = serde_yaml::from_value(source.clone()).map_err(|_| {
                    ConfigError::InvalidConfig(format!(
                        "task '{}': expand '{}' must be a list or {{ from, key }}",
                        self.id, name
                    ))
                })?;
                Ok((name.to_string(), source))
            })
            .collect()
    }
}

/// A reference to an upstream task's XCom value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct XComRefConfig {
    /// Producing task.
    pub from: String,
    /// XCom key; the return value when absent.
    #[serde(default)]
    pub key: Option<String>,
}

/// A partial argument: an XCom reference or a literal value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ArgConfig {
    XCom(XComRefConfig),
    Literal(serde_json::Value),
}

/// A mapped argument source: an XCom reference or a literal list.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MapSourceConfig {
    XCom(XComRefConfig),
    Literal(Vec<serde_json::Value>),
}

/// Retry configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RetryConfig {
    /// Retries after the first try.
    pub max_retries: u32,
    /// Delay before the first retry, in seconds.
    #[serde(default)]
    pub delay_secs: u64,
    /// Multiplier applied to the delay for each further retry.
    #[serde(default)]
    pub backoff_multiplier: Option<f64>,
    /// Upper bound on the delay, in seconds.
    #[serde(default)]
    pub max_delay_secs: Option<u64>,
    #[serde(default)]
    pub condition: RetryCondition,
}

impl RetryConfig {
    /// Convert into a [`RetryPolicy`].
    pub fn to_policy(&self) -> RetryPolicy {
        let delay = Duration::from_secs(self.delay_secs);
        let mut policy = match self.backoff_multiplier {
            Some(multiplier) => RetryPolicy::exponential(self.max_retries, delay, multiplier),
            None => RetryPolicy::fixed(self.max_retries, delay),
        };
        if let Some(max) = self.max_delay_secs {
            policy = policy.with_max_delay(Duration::from_secs(max));
        }
        policy.with_condition(self.condition)
    }
}
