//! Cross-task communication ("XCom").
//!
//! Values are keyed by `(dag, run, task, map index, key)` and persisted
//! through [`Storage`]. Writes to the same key overwrite; reads of a missing
//! key are an error. [`XComStore::get_many`] gathers the `return_value` of
//! every instance of a mapped task, ordered by map index.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;

use crate::core::types::{DagId, RunId, TaskId, TaskInstanceKey};
use crate::storage::{Storage, StorageError};

/// Key under which an execution unit's return value is stored.
pub const RETURN_VALUE_KEY: &str = "return_value";

/// Errors from XCom reads and writes.
#[derive(Debug, Error)]
pub enum XComError {
    /// No value stored under the key.
    #[error("xcom not found: {0}")]
    NotFound(XComKey),

    /// `multiple_outputs` was set but the return value is not a JSON object.
    #[error("multiple_outputs requires a JSON object return value, got {0}")]
    NotAnObject(&'static str),

    /// Underlying storage failure.
    #[error(transparent)]
    Storage(StorageError),
}

impl From<StorageError> for XComError {
    fn from(err: StorageError) -> Self {
        XComError::Storage(err)
    }
}

/// Full key of one XCom value.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct XComKey {
    pub dag_id: DagId,
    pub run_id: RunId,
    pub task_id: TaskId,
    pub map_index: Option<usize>,
    pub key: String,
}

impl XComKey {
    /// Key `key` of the instance `instance`.
    pub fn new(instance: &TaskInstanceKey, key: impl Into<String>) -> Self {
        Self {
            dag_id: instance.dag_id.clone(),
            run_id: instance.run_id.clone(),
            task_id: instance.task_id.clone(),
            map_index: instance.map_index,
            key: key.into(),
        }
    }

    /// The `return_value` key of `instance`.
    pub fn return_value(instance: &TaskInstanceKey) -> Self {
        Self::new(instance, RETURN_VALUE_KEY)
    }

    /// Returns true if this key belongs to `instance`.
    pub fn belongs_to(&self, instance: &TaskInstanceKey) -> bool {
        self.dag_id == instance.dag_id
            && self.run_id == instance.run_id
            && self.task_id == instance.task_id
            && self.map_index == instance.map_index
    }
}

impl std::fmt::Display for XComKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.map_index {
            Some(index) => write!(
                f,
                "{}/{}/{}[{}]:{}",
                self.dag_id, self.run_id, self.task_id, index, self.key
            ),
            None => write!(
                f,
                "{}/{}/{}:{}",
                self.dag_id, self.run_id, self.task_id, self.key
            ),
        }
    }
}

/// A stored XCom value.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct XComEntry {
    pub key: XComKey,
    pub value: Value,
    /// Try that produced the value.
    pub try_number: u32,
    pub timestamp: DateTime<Utc>,
}

/// Turn a successful try's outputs into the entries to persist.
///
/// Pushed outputs are written as-is; the return value is written under
/// `return_value` and, with `multiple_outputs`, also spread one entry per
/// object key.
pub fn build_entries(
    instance: &TaskInstanceKey,
    try_number: u32,
    return_value: Option<Value>,
    pushed: BTreeMap<String, Value>,
    multiple_outputs: bool,
    now: DateTime<Utc>,
) -> Result<Vec<XComEntry>, XComError> {
    let mut values = pushed;

    if let Some(value) = return_value {
        if multiple_outputs {
            let object = value.as_object().ok_or(XComError::NotAnObject(json_kind(&value)))?;
            for (key, item) in object {
                values.insert(key.clone(), item.clone());
            }
        }
        values.insert(RETURN_VALUE_KEY.to_string(), value);
    }

    Ok(values
        .into_iter()
        .map(|(key, value)| XComEntry {
            key: XComKey::new(instance, key),
            value,
            try_number,
            timestamp: now,
        })
        .collect())
}

pub(crate) fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "a boolean",
        Value::Number(_) => "a number",
        Value::String(_) => "a string",
        Value::Array(_) => "an array",
        Value::Object(_) => "an object",
    }
}

/// Read/write facade over the XCom part of a [`Storage`].
pub struct XComStore<S: Storage> {
    storage: Arc<S>,
}

impl<S: Storage> Clone for XComStore<S> {
    fn clone(&self) -> Self {
        Self {
            storage: Arc::clone(&self.storage),
        }
    }
}

impl<S: Storage> XComStore<S> {
    /// Create a facade over `storage`.
    pub fn new(storage: Arc<S>) -> Self {
        Self { storage }
    }

    /// Write a value, overwriting any previous value under the same key.
    pub async fn put(&self, key: XComKey, value: Value, try_number: u32) -> Result<(), XComError> {
        self.storage
            .put_xcom(XComEntry {
                key,
                value,
                try_number,
                timestamp: Utc::now(),
            })
            .await?;
        Ok(())
    }

    /// Read a value.
    pub async fn get(&self, key: &XComKey) -> Result<Value, XComError> {
        match self.storage.get_xcom(key).await {
            Ok(entry) => Ok(entry.value),
            Err(StorageError::NotFound(_)) => Err(XComError::NotFound(key.clone())),
            Err(e) => Err(e.into()),
        }
    }

    /// `return_value` of every instance of `task_id`, keyed by map index in
    /// ascending order. Unmapped instances are not included.
    pub async fn get_many(
        &self,
        dag_id: &DagId,
        run_id: &RunId,
        task_id: &TaskId,
    ) -> Result<BTreeMap<usize, Value>, XComError> {
        self.get_many_key(dag_id, run_id, task_id, RETURN_VALUE_KEY).await
    }

    /// Like [`get_many`](Self::get_many) for an arbitrary key.
    pub async fn get_many_key(
        &self,
        dag_id: &DagId,
        run_id: &RunId,
        task_id: &TaskId,
        key: &str,
    ) -> Result<BTreeMap<usize, Value>, XComError> {
        let entries = self.storage.list_xcom(dag_id, run_id, task_id, key).await?;
        Ok(entries
            .into_iter()
            .filter_map(|entry| entry.key.map_index.map(|index| (index, entry.value)))
            .collect())
    }
}
