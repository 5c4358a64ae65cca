//! Execution context handed to an execution unit.
//!
//! The context carries the identity of the task instance being run, its
//! resolved arguments (static arguments, partial arguments, the mapped slice
//! and any resolved XCom references) and a buffer for extra keyed outputs.
//!
//! - [`ExecutionContext::arg`]: typed access to a resolved argument
//! - [`ExecutionContext::push`]: write an extra XCom entry under a custom key
//!
//! Pushed outputs are only persisted if the try succeeds; a failed try leaves
//! the XCom store untouched.

use chrono::{DateTime, Utc};
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Mutex;
use thiserror::Error;

use super::types::TaskInstanceKey;

/// Errors that can occur when working with the context.
#[derive(Debug, Error)]
pub enum ContextError {
    /// Argument was not supplied to this task instance.
    #[error("argument not found: {0}")]
    ArgumentNotFound(String),

    /// Failed to deserialize an argument into the requested type.
    #[error("deserialization error for argument '{key}': {message}")]
    DeserializationError { key: String, message: String },

    /// Failed to serialize a pushed value.
    #[error("serialization error for key '{key}': {message}")]
    SerializationError { key: String, message: String },

    /// Output buffer lock was poisoned.
    #[error("context lock poisoned")]
    LockPoisoned,
}

/// Context for one try of one task instance.
#[derive(Debug)]
pub struct ExecutionContext {
    /// Identity of the running instance.
    pub key: TaskInstanceKey,

    /// Try number of this execution, starting at 1.
    pub try_number: u32,

    /// Logical date of the owning run.
    pub logical_date: DateTime<Utc>,

    /// Data interval covered by the owning run.
    pub data_interval: (DateTime<Utc>, DateTime<Utc>),

    arguments: BTreeMap<String, Value>,
    pushed: Mutex<BTreeMap<String, Value>>,
}

impl ExecutionContext {
    /// Create a new context.
    pub fn new(
        key: TaskInstanceKey,
        try_number: u32,
        logical_date: DateTime<Utc>,
        data_interval: (DateTime<Utc>, DateTime<Utc>),
        arguments: BTreeMap<String, Value>,
    ) -> Self {
        Self {
            key,
            try_number,
            logical_date,
            data_interval,
            arguments,
            pushed: Mutex::new(BTreeMap::new()),
        }
    }

    /// All resolved arguments.
    pub fn arguments(&self) -> &BTreeMap<String, Value> {
        &self.arguments
    }

    /// Get an argument, deserialized into `T`.
    pub fn arg<T: DeserializeOwned>(&self, name: &str) -> Result<T, ContextError> {
        let value = self
            .arguments
            .get(name)
            .ok_or_else(|| ContextError::ArgumentNotFound(name.to_string()))?;
        serde_json::from_value(value.clone()).map_err(|e| ContextError::DeserializationError {
            key: name.to_string(),
            message: e.to_string(),
        })
    }

    /// Get an optional argument. Returns None if missing or of the wrong type.
    pub fn arg_optional<T: DeserializeOwned>(&self, name: &str) -> Option<T> {
        let value = self.arguments.get(name)?;
        serde_json::from_value(value.clone()).ok()
    }

    /// Push an extra output under `key`.
    ///
    /// `return_value` is reserved for the unit's return value; pushing it is
    /// allowed but the return value wins.
    pub fn push<T: Serialize>(&self, key: impl Into<String>, value: T) -> Result<(), ContextError> {
        let key = key.into();
        let value = serde_json::to_value(value).map_err(|e| ContextError::SerializationError {
            key: key.clone(),
            message: e.to_string(),
        })?;
        self.pushed
            .lock()
            .map_err(|_| ContextError::LockPoisoned)?
            .insert(key, value);
        Ok(())
    }

    /// Take every pushed output, leaving the buffer empty.
    pub fn take_pushed(&self) -> Result<BTreeMap<String, Value>, ContextError> {
        let mut pushed = self.pushed.lock().map_err(|_| ContextError::LockPoisoned)?;
        Ok(std::mem::take(&mut *pushed))
    }
}
