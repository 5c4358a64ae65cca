//! External command execution unit.
//!
//! [`CommandUnit`] runs a program as a task. Resolved arguments are handed to
//! the process as environment variables named `TRIB_ARG_<NAME>` (strings
//! raw, anything else as JSON), alongside the identity of the running
//! instance:
//!
//! | Variable | Value |
//! |----------|-------|
//! | `TRIB_DAG_ID` | DAG id |
//! | `TRIB_RUN_ID` | run id |
//! | `TRIB_TASK_ID` | task id |
//! | `TRIB_MAP_INDEX` | map index, or `-1` for unmapped instances |
//! | `TRIB_TRY_NUMBER` | try number |
//! | `TRIB_LOGICAL_DATE` | logical date, RFC 3339 |
//!
//! After the process exits, `stdout`, `stderr` and `exit_code` are pushed as
//! XCom entries. The last non-empty stdout line becomes the return value,
//! parsed as JSON when possible and kept as a string otherwise.
//!
//! ```rust
//! use tributary::CommandUnit;
//!
//! let unit = CommandUnit::builder("sh")
//!     .name("count_rows")
//!     .args(["-c", "wc -l < \"$TRIB_ARG_PATH\""])
//!     .params(["path"])
//!     .build();
//! ```
//!
//! A non-zero exit fails the try with [`TaskError::CommandFailed`]. The child
//! is killed when the execution future is dropped, which is how the
//! executor's timeout and cancellation stop it.

use async_trait::async_trait;
use serde_json::Value;
use std::collections::BTreeMap;
use std::path::PathBuf;
use std::process::Stdio;
use tokio::process::Command;

use crate::core::context::ExecutionContext;
use crate::core::task::{ExecutionUnit, Signature, TaskError};

const ARG_PREFIX: &str = "TRIB_ARG_";

/// An execution unit that runs an external command.
#[derive(Debug, Clone)]
pub struct CommandUnit {
    name: String,
    program: String,
    args: Vec<String>,
    env: BTreeMap<String, String>,
    working_dir: Option<PathBuf>,
    signature: Signature,
}

impl CommandUnit {
    /// Create a new builder for a command unit.
    pub fn builder(program: impl Into<String>) -> CommandUnitBuilder {
        CommandUnitBuilder::new(program)
    }

    /// Get the program being executed.
    pub fn program(&self) -> &str {
        &self.program
    }

    /// Get the command arguments.
    pub fn args(&self) -> &[String] {
        &self.args
    }

    /// Get the extra environment variables.
    pub fn env(&self) -> &BTreeMap<String, String> {
        &self.env
    }

    /// Get the working directory.
    pub fn working_dir(&self) -> Option<&PathBuf> {
        self.working_dir.as_ref()
    }

    fn command(&self, ctx: &ExecutionContext) -> Command {
        let mut cmd = Command::new(&self.program);
        cmd.args(&self.args);
        cmd.envs(&self.env);

        let key = &ctx.key;
        let map_index = key.map_index.map_or(-1, |i| i as i64);
        cmd.env("TRIB_DAG_ID", key.dag_id.as_str())
            .env("TRIB_RUN_ID", key.run_id.as_str())
            .env("TRIB_TASK_ID", key.task_id.as_str())
            .env("TRIB_MAP_INDEX", map_index.to_string())
            .env("TRIB_TRY_NUMBER", ctx.try_number.to_string())
            .env("TRIB_LOGICAL_DATE", ctx.logical_date.to_rfc3339());

        for (name, value) in ctx.arguments() {
            cmd.env(arg_var(name), arg_value(value));
        }

        if let Some(ref dir) = self.working_dir {
            cmd.current_dir(dir);
        }

        cmd.stdout(Stdio::piped());
        cmd.stderr(Stdio::piped());
        cmd.kill_on_drop(true);
        cmd
    }
}

fn arg_var(name: &str) -> String {
    format!("{}{}", ARG_PREFIX, name.to_uppercase())
}

fn arg_value(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        other => other.to_string(),
    }
}

/// The last non-empty line of `stdout`, as JSON if it parses.
fn return_value(stdout: &str) -> Option<Value> {
    let line = stdout.lines().rev().map(str::trim).find(|l| !l.is_empty())?;
    Some(serde_json::from_str(line).unwrap_or_else(|_| Value::String(line.to_string())))
}

#[async_trait]
impl ExecutionUnit for CommandUnit {
    fn name(&self) -> &str {
        &self.name
    }

    fn signature(&self) -> Signature {
        self.signature.clone()
    }

    async fn execute(&self, ctx: &ExecutionContext) -> Result<Option<Value>, TaskError> {
        let output = self
            .command(ctx)
            .output()
            .await
            .map_err(|e| TaskError::ExecutionFailed(format!("{}: {}", self.program, e)))?;

        let stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        let code = output.status.code().unwrap_or(-1);

        ctx.push("stdout", &stdout)?;
        ctx.push("stderr", &stderr)?;
        ctx.push("exit_code", code)?;

        if output.status.success() {
            Ok(return_value(&stdout))
        } else {
            Err(TaskError::CommandFailed { code, stderr })
        }
    }

    fn description(&self) -> Option<&str> {
        Some(&self.program)
    }
}

/// Builder for creating `CommandUnit` instances.
#[derive(Debug, Clone)]
pub struct CommandUnitBuilder {
    name: Option<String>,
    program: String,
    args: Vec<String>,
    env: BTreeMap<String, String>,
    working_dir: Option<PathBuf>,
    signature: Signature,
}

impl CommandUnitBuilder {
    /// Create a new builder with the given program.
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            name: None,
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            working_dir: None,
            signature: Signature::Any,
        }
    }

    /// Set the unit name used in logs. Defaults to the program.
    pub fn name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    /// Add a single argument.
    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    /// Add multiple arguments.
    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    /// Add a single environment variable.
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Set the working directory.
    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    /// Restrict the accepted argument names.
    pub fn params<I, S>(mut self, names: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.signature = Signature::params(names);
        self
    }

    /// Build the `CommandUnit`.
    pub fn build(self) -> CommandUnit {
        let name = self.name.unwrap_or_else(|| self.program.clone());
        CommandUnit {
            name,
            program: self.program,
            args: self.args,
            env: self.env,
            working_dir: self.working_dir,
            signature: self.signature,
        }
    }
}
