//! Execution unit trait and error types.
//!
//! An [`ExecutionUnit`] is the work a task performs. It receives an
//! [`ExecutionContext`] with resolved arguments and may return a value, which
//! the scheduler stores in XCom under `return_value`.

use async_trait::async_trait;
use serde_json::Value;
use std::fmt;
use std::sync::Arc;
use thiserror::Error;

use super::context::ExecutionContext;

/// Errors that can occur during task execution.
#[derive(Debug, Error)]
pub enum TaskError {
    /// Task execution failed with a message.
    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    /// Task timed out.
    #[error("task timed out after {0:?}")]
    Timeout(std::time::Duration),

    /// External command exited unsuccessfully.
    #[error("command exited with code {code}: {stderr}")]
    CommandFailed { code: i32, stderr: String },

    /// Error accessing task context.
    #[error("context error: {0}")]
    Context(#[from] super::context::ContextError),

    /// A transient error that may succeed on retry.
    #[error("transient error: {0}")]
    Transient(String),

    /// Generic error wrapper.
    #[error(transparent)]
    Other(#[from] Box<dyn std::error::Error + Send + Sync>),
}

impl TaskError {
    /// Check if this error is considered transient.
    pub fn is_transient(&self) -> bool {
        matches!(self, TaskError::Transient(_) | TaskError::Timeout(_))
    }
}

/// The argument names an execution unit accepts.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub enum Signature {
    /// Any argument name is accepted.
    #[default]
    Any,
    /// Only the listed names are accepted.
    Params(Vec<String>),
}

impl Signature {
    /// Build a `Params` signature from names.
    pub fn params<I, S>(names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Signature::Params(names.into_iter().map(Into::into).collect())
    }

    /// Returns true if `name` is a valid argument for this signature.
    pub fn accepts(&self, name: &str) -> bool {
        match self {
            Signature::Any => true,
            Signature::Params(names) => names.iter().any(|n| n == name),
        }
    }
}

/// The core trait for the work a task performs.
///
/// # Example
///
/// ```ignore
/// use tributary::{ExecutionContext, ExecutionUnit, Signature, TaskError};
/// use async_trait::async_trait;
/// use serde_json::{Value, json};
///
/// struct Double;
///
/// #[async_trait]
/// impl ExecutionUnit for Double {
///     fn name(&self) -> &str {
///         "double"
///     }
///
///     fn signature(&self) -> Signature {
///         Signature::params(["x"])
///     }
///
///     async fn execute(&self, ctx: &ExecutionContext) -> Result<Option<Value>, TaskError> {
///         let x: i64 = ctx.arg("x")?;
///         Ok(Some(json!(x * 2)))
///     }
/// }
/// ```
#[async_trait]
pub trait ExecutionUnit: Send + Sync {
    /// Returns the name of this unit, used in logs.
    fn name(&self) -> &str;

    /// Argument names this unit accepts. Used to validate partial and mapped
    /// arguments when a DAG is built.
    fn signature(&self) -> Signature {
        Signature::Any
    }

    /// Execute one try.
    ///
    /// # Returns
    /// * `Ok(Some(value))` - success, `value` is stored as `return_value`
    /// * `Ok(None)` - success without a return value
    /// * `Err(TaskError)` - the try failed
    async fn execute(&self, ctx: &ExecutionContext) -> Result<Option<Value>, TaskError>;

    /// Optional description for display/logging purposes.
    fn description(&self) -> Option<&str> {
        None
    }
}

type UnitFn = dyn Fn(&ExecutionContext) -> Result<Option<Value>, TaskError> + Send + Sync;

/// An execution unit backed by a synchronous closure.
#[derive(Clone)]
pub struct FnUnit {
    name: String,
    signature: Signature,
    func: Arc<UnitFn>,
}

impl FnUnit {
    /// Create a unit that accepts any argument.
    pub fn new<F>(name: impl Into<String>, func: F) -> Self
    where
        F: Fn(&ExecutionContext) -> Result<Option<Value>, TaskError> + Send + Sync + 'static,
    {
        Self {
            name: name.into(),
            signature: Signature::Any,
            func: Arc::new(func),
        }
    }

    /// Builder: restrict the accepted argument names.
    pub fn with_params<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.signature = Signature::params(names);
        self
    }
}

impl fmt::Debug for FnUnit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("FnUnit")
            .field("name", &self.name)
            .field("signature", &self.signature)
            .finish()
    }
}

#[async_trait]
impl ExecutionUnit for FnUnit {
    fn name(&self) -> &str {
        &self.name
    }

    fn signature(&self) -> Signature {
        self.signature.clone()
    }

    async fn execute(&self, ctx: &ExecutionContext) -> Result<Option<Value>, TaskError> {
        (self.func)(ctx)
    }
}
