//! Step Execution
//!
//! Defines the executor contract every step implements and the runner that
//! applies per-step timeouts, retries and panic capture.
//!
//! - [`StepExecutor`]: `run(context) -> StepResult`, supplied by the workflow author
//! - [`FnExecutor`]: adapter turning a closure into an executor
//! - [`CommandExecutor`]: runs a shell command with `{key}` placeholders
//!   resolved from the execution context
//! - [`execute_step`]: runs one step and records its outcome in the context
//! - [`skip_reason`]: disabled steps and unmet conditions

use std::any::Any;
use std::panic::AssertUnwindSafe;
use std::path::PathBuf;
use std::time::Instant;

use async_trait::async_trait;
use futures::FutureExt;
use log::{debug, error, info, warn};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::process::Command;

use super::model::Step;
use crate::execution::context::{ExecutionContext, StepRecord};
use crate::execution::timeline::EventType;

/// Outcome reported by a step executor.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
pub struct StepResult {
    pub success: bool,
    #[serde(default)]
    pub data: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl StepResult {
    /// Successful result carrying `data`.
    pub fn ok(data: impl Into<Value>) -> Self {
        Self {
            success: true,
            data: data.into(),
            error: None,
        }
    }

    /// Successful result without data.
    pub fn success() -> Self {
        Self::ok(Value::Null)
    }

    /// Failed result with an error message.
    pub fn failed(error: impl Into<String>) -> Self {
        Self {
            success: false,
            data: Value::Null,
            error: Some(error.into()),
        }
    }
}

/// The executable contract of a step.
///
/// The engine only orchestrates; it never interprets what a step does.
/// Executors may read and write the context they are given.
#[async_trait]
pub trait StepExecutor: Send + Sync {
    async fn run(&self, ctx: &mut ExecutionContext) -> StepResult;
}

/// Wraps a synchronous closure as a [`StepExecutor`].
pub struct FnExecutor<F> {
    f: F,
}

impl<F> FnExecutor<F>
where
    F: Fn(&mut ExecutionContext) -> StepResult + Send + Sync,
{
    pub fn new(f: F) -> Self {
        Self { f }
    }
}

#[async_trait]
impl<F> StepExecutor for FnExecutor<F>
where
    F: Fn(&mut ExecutionContext) -> StepResult + Send + Sync,
{
    async fn run(&self, ctx: &mut ExecutionContext) -> StepResult {
        (self.f)(ctx)
    }
}

/// Runs a shell command through `bash -c`.
///
/// Placeholders of the form `{key}` are replaced with the string form of the
/// matching context value before the command runs. Sensitive context values
/// are substituted but never logged.
#[derive(Debug, Clone)]
pub struct CommandExecutor {
    command: String,
    working_dir: Option<PathBuf>,
}

impl CommandExecutor {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            working_dir: None,
        }
    }

    pub fn with_working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn command(&self) -> &str {
        &self.command
    }

    /// Resolves `{key}` placeholders against the context.
    fn resolve(&self, ctx: &ExecutionContext) -> String {
        let mut text = self.command.clone();
        for (key, value) in ctx.data() {
            let placeholder = format!("{{{}}}", key);
            if !text.contains(&placeholder) {
                continue;
            }
            let replacement = match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            text = text.replace(&placeholder, &replacement);
        }
        text
    }
}

#[async_trait]
impl StepExecutor for CommandExecutor {
    async fn run(&self, ctx: &mut ExecutionContext) -> StepResult {
        let command_text = self.resolve(ctx);
        if !ctx.has_sensitive_data() {
            debug!("Executing command: {}", command_text);
        }

        let mut cmd = Command::new("bash");
        cmd.arg("-c").arg(&command_text).kill_on_drop(true);
        if let Some(dir) = &self.working_dir {
            cmd.current_dir(dir);
            debug!("Executing in directory: {}", dir.display());
        }

        let output = match cmd.output().await {
            Ok(output) => output,
            Err(e) => return StepResult::failed(format!("failed to spawn command: {}", e)),
        };

        let stdout = String::from_utf8_lossy(&output.stdout).trim().to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();

        if output.status.success() {
            StepResult::ok(json!({
                "stdout": stdout,
                "exit_code": output.status.code(),
            }))
        } else {
            error!("Command failed with exit code: {:?}", output.status.code());
            if !stderr.is_empty() {
                error!("stderr:\n{}", stderr);
            }
            let mut result = StepResult::failed(format!(
                "command exited with status {:?}: {}",
                output.status.code(),
                last_line(&stderr)
            ));
            result.data = json!({ "stdout": stdout, "stderr": stderr });
            result
        }
    }
}

fn last_line(text: &str) -> &str {
    text.lines().last().unwrap_or("")
}

fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}

/// Runs a step's executor once per attempt until it succeeds or the retry
/// budget is spent.
///
/// A step timeout turns into a failed result, and so does a panic inside
/// the executor. Returns the last result and the number of attempts made.
pub async fn run_step(step: &Step, ctx: &mut ExecutionContext) -> (StepResult, u32) {
    let meta = step.metadata();
    let max_attempts = meta.retries.saturating_add(1);
    let mut last = StepResult::failed("step was not executed");
    let mut attempts = 0;

    while attempts < max_attempts {
        attempts += 1;

        let fut = AssertUnwindSafe(step.executor().run(ctx)).catch_unwind();
        let outcome = match meta.timeout() {
            Some(limit) => match tokio::time::timeout(limit, fut).await {
                Ok(outcome) => outcome,
                Err(_) => Ok(StepResult::failed(format!("step timed out after {:?}", limit))),
            },
            None => fut.await,
        };

        last = match outcome {
            Ok(result) => result,
            Err(payload) => {
                let message = panic_message(payload.as_ref());
                error!("Step '{}' panicked: {}", meta.name, message);
                StepResult::failed(format!("step panicked: {}", message))
            }
        };

        if last.success {
            break;
        }

        if attempts < max_attempts {
            warn!(
                "Step '{}' failed (attempt {}/{}): {} - retrying",
                meta.name,
                attempts,
                max_attempts,
                last.error.as_deref().unwrap_or("unknown error")
            );
            ctx.increment("step_retries");
        }
    }

    (last, attempts)
}

/// Why a step should not run against the context, if it shouldn't.
pub fn skip_reason(step: &Step, ctx: &ExecutionContext) -> Option<&'static str> {
    let meta = step.metadata();
    if meta.disabled {
        Some("disabled")
    } else if !meta.conditions_hold(ctx) {
        Some("conditions not met")
    } else {
        None
    }
}

/// Runs a step and records the outcome on the context timeline and step records.
///
/// Disabled steps and steps whose conditions do not hold are recorded as
/// skipped, which satisfies their dependents. Synthetic steps are not
/// recorded themselves; their executors record each member instead.
pub async fn execute_step(step: &Step, ctx: &mut ExecutionContext) -> StepResult {
    let name = step.name().to_string();
    let synthetic = step.metadata().is_synthetic();

    if synthetic {
        let (result, _) = run_step(step, ctx).await;
        return result;
    }

    if let Some(reason) = skip_reason(step, ctx) {
        info!("Skipping step '{}': {}", name, reason);
        ctx.increment("steps_skipped");
        let result = StepResult::ok(json!({ "skipped": reason }));
        ctx.record_step(StepRecord {
            name,
            success: true,
            data: result.data.clone(),
            error: None,
            duration_ms: 0,
            attempts: 0,
        });
        return result;
    }

    let started = Instant::now();
    ctx.timeline_mut().add_event(name.clone(), EventType::Started);

    let (result, attempts) = run_step(step, ctx).await;
    let duration_ms = started.elapsed().as_millis() as u64;

    let event = if result.success {
        EventType::Completed
    } else {
        EventType::Failed
    };
    ctx.timeline_mut().add_event(name.clone(), event);

    if result.success {
        ctx.increment("steps_completed");
        debug!("Step '{}' completed in {} ms", name, duration_ms);
    } else {
        ctx.increment("steps_failed");
        let message = result.error.clone().unwrap_or_else(|| "unknown error".to_string());
        ctx.record_error(format!("{}: {}", name, message));
    }

    ctx.record_step(StepRecord {
        name,
        success: result.success,
        data: result.data.clone(),
        error: result.error.clone(),
        duration_ms,
        attempts,
    });

    result
}
