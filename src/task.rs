//! Tasks and the registry of task functions workers know how to run.
//!
//! A task is a registered function name plus the JSON items it should be
//! mapped over. The worker binary owns a `TaskRegistry` resolving names
//! to async functions; shipping compiled closures between processes is
//! not a thing, so the name is the contract.

use std::collections::HashMap;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use anyhow::{bail, Context as _, Result};
use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tracing::info;

use crate::result::TaskError;
use crate::store::Store;

/// The smallest unit of work: one function name and the items of one
/// group of the user iterable. Immutable once submitted.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct Task {
    pub function: String,
    pub items: Vec<Value>,
}

impl Task {
    pub fn new(function: impl Into<String>, items: Vec<Value>) -> Self {
        Task {
            function: function.into(),
            items,
        }
    }

    pub fn to_bytes(&self) -> Result<Bytes> {
        let data = serde_json::to_vec(self).context("failed to serialize task")?;
        Ok(data.into())
    }
}

impl TryFrom<Bytes> for Task {
    type Error = serde_json::Error;

    fn try_from(b: Bytes) -> std::result::Result<Self, Self::Error> {
        serde_json::from_slice(&b)
    }
}

/// Worker-side handle to the shared blob store, passed to every task
/// function (remote objects load through it).
#[derive(Debug, Clone)]
pub struct TaskContext {
    store: Store,
}

impl TaskContext {
    pub fn new(store: Store) -> Self {
        TaskContext { store }
    }

    pub fn store(&self) -> &Store {
        &self.store
    }
}

type TaskFuture = Pin<Box<dyn Future<Output = std::result::Result<Value, TaskError>> + Send>>;
type TaskFn = Arc<dyn Fn(TaskContext, Value) -> TaskFuture + Send + Sync>;

/// Name → async task function. Decode and encode failures surface as
/// `TaskError`s with their own kind tags so the driver can tell them
/// apart from task failures.
#[derive(Default, Clone)]
pub struct TaskRegistry {
    functions: HashMap<String, TaskFn>,
}

impl TaskRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register<I, O, F, Fut>(&mut self, name: impl Into<String>, function: F)
    where
        I: DeserializeOwned + Send + 'static,
        O: Serialize + Send + 'static,
        F: Fn(TaskContext, I) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<O>> + Send + 'static,
    {
        let function = Arc::new(function);
        let wrapped: TaskFn = Arc::new(move |ctx, value| {
            let function = function.clone();
            Box::pin(async move {
                let input: I = serde_json::from_value(value)
                    .map_err(|err| TaskError::new("decode", err.to_string()))?;
                let output = function(ctx, input)
                    .await
                    .map_err(|err| TaskError::from_error("task", &err))?;
                serde_json::to_value(output)
                    .map_err(|err| TaskError::new("encode", err.to_string()))
            })
        });
        self.functions.insert(name.into(), wrapped);
    }

    pub async fn invoke(
        &self,
        ctx: TaskContext,
        name: &str,
        input: Value,
    ) -> std::result::Result<Value, TaskError> {
        let Some(function) = self.functions.get(name) else {
            return Err(TaskError::new(
                "unknown-function",
                format!("no registered task function named '{}'", name),
            ));
        };
        function(ctx, input).await
    }

    pub fn names(&self) -> Vec<&str> {
        let mut names: Vec<&str> = self.functions.keys().map(|s| s.as_str()).collect();
        names.sort();
        names
    }
}

impl std::fmt::Debug for TaskRegistry {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TaskRegistry")
            .field("functions", &self.names())
            .finish()
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct ShellCommandItem {
    command: String,
    value: Value,
}

/// The registry the `fanout` binary ships with. User binaries that embed
/// the worker entry point bring their own.
pub fn builtin_registry() -> TaskRegistry {
    let mut registry = TaskRegistry::new();

    registry.register("echo", |_ctx: TaskContext, value: Value| async move {
        Ok(value)
    });

    registry.register(
        "shell-command",
        |_ctx: TaskContext, item: ShellCommandItem| async move {
            let rendered = match &item.value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            };
            let command = item.command.replace("{}", &rendered);
            info!("running shell command: {}", command);
            let output = tokio::process::Command::new("sh")
                .arg("-c")
                .arg(&command)
                .output()
                .await
                .with_context(|| format!("spawning: {}", command))?;
            if !output.status.success() {
                bail!(
                    "command failed with {}: {}",
                    output.status,
                    String::from_utf8_lossy(&output.stderr)
                );
            }
            Ok(json!({
                "value": item.value,
                "output": String::from_utf8_lossy(&output.stdout),
            }))
        },
    );

    registry
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> (tempfile::TempDir, TaskContext) {
        let dir = tempfile::tempdir().unwrap();
        let store = Store::from_url(dir.path().to_str().unwrap()).unwrap();
        (dir, TaskContext::new(store))
    }

    #[test]
    fn test_task_bytes_roundtrip() {
        let task = Task::new("square", vec![json!(1), json!(2)]);
        let bytes = task.to_bytes().unwrap();
        let restored = Task::try_from(bytes).unwrap();
        assert_eq!(restored, task);
    }

    #[tokio::test]
    async fn test_register_and_invoke_typed() {
        let (_dir, ctx) = ctx();
        let mut registry = TaskRegistry::new();
        registry.register("square", |_ctx: TaskContext, x: i64| async move {
            Ok(x * x)
        });

        let out = registry.invoke(ctx, "square", json!(7)).await.unwrap();
        assert_eq!(out, json!(49));
    }

    #[tokio::test]
    async fn test_invoke_decode_error() {
        let (_dir, ctx) = ctx();
        let mut registry = TaskRegistry::new();
        registry.register("square", |_ctx: TaskContext, x: i64| async move {
            Ok(x * x)
        });

        let err = registry
            .invoke(ctx, "square", json!("not a number"))
            .await
            .unwrap_err();
        assert_eq!(err.kind, "decode");
    }

    #[tokio::test]
    async fn test_invoke_unknown_function() {
        let (_dir, ctx) = ctx();
        let registry = TaskRegistry::new();
        let err = registry.invoke(ctx, "missing", json!(1)).await.unwrap_err();
        assert_eq!(err.kind, "unknown-function");
    }

    #[tokio::test]
    async fn test_invoke_task_error_carries_message() {
        let (_dir, ctx) = ctx();
        let mut registry = TaskRegistry::new();
        registry.register("fail", |_ctx: TaskContext, _x: i64| async move {
            if true {
                bail!("boom");
            }
            Ok(0)
        });

        let err = registry.invoke(ctx, "fail", json!(1)).await.unwrap_err();
        assert_eq!(err.kind, "task");
        assert_eq!(err.message, "boom");
        assert!(err.traceback.is_some());
    }

    #[tokio::test]
    async fn test_builtin_shell_command() {
        let (_dir, ctx) = ctx();
        let registry = builtin_registry();
        let out = registry
            .invoke(
                ctx,
                "shell-command",
                json!({"command": "echo hi-{}", "value": 3}),
            )
            .await
            .unwrap();
        assert_eq!(out["output"], json!("hi-3\n"));
        assert_eq!(out["value"], json!(3));
    }
}
