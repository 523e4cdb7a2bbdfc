//! Worker-side runner: read an input blob, run the task function over
//! its items, publish the result blob. Every backend ends up here, in
//! this process or another one.

use anyhow::{Context, Result};
use futures::FutureExt;
use tracing::{info, warn};

use crate::common::{epoch_seconds, human_readable_size};
use crate::result::{ResultEnvelope, ResultType, TaskError};
use crate::store::Store;
use crate::task::{Task, TaskContext, TaskRegistry};

/// Substitute the worker-filled fields of a result-blob template.
fn fill_template(template: &str, result_type: ResultType, result_time: u64) -> String {
    template
        .replace("{result_type}", &result_type.to_string())
        .replace("{result_time}", &result_time.to_string())
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "task panicked".to_string()
    }
}

/// Run the function over every item, stopping at the first failure.
/// Panics in task functions are caught and carried like any other
/// failure so that a result blob is still published.
async fn run_items(
    store: &Store,
    registry: &TaskRegistry,
    task: &Task,
) -> std::result::Result<Vec<serde_json::Value>, TaskError> {
    let ctx = TaskContext::new(store.clone());
    let mut outputs = Vec::with_capacity(task.items.len());
    for (index, item) in task.items.iter().enumerate() {
        let invocation = registry.invoke(ctx.clone(), &task.function, item.clone());
        match std::panic::AssertUnwindSafe(invocation).catch_unwind().await {
            Ok(Ok(value)) => outputs.push(value),
            Ok(Err(err)) => {
                warn!(
                    "task function '{}' failed on item {}: {}",
                    task.function, index, err
                );
                return Err(err);
            }
            Err(payload) => {
                let message = panic_message(payload);
                warn!(
                    "task function '{}' panicked on item {}: {}",
                    task.function, index, message
                );
                return Err(TaskError::new("panic", message)
                    .with_traceback(format!("panic while running '{}' on item {}", task.function, index)));
            }
        }
    }
    Ok(outputs)
}

/// Execute one task end to end. Returns the published result-blob name.
pub async fn run_task(
    store: &Store,
    registry: &TaskRegistry,
    input_name: &str,
    result_template: &str,
    delete_input: bool,
) -> Result<String> {
    info!("reading: {}", store.access_info(input_name));
    let bytes = store
        .get(input_name)
        .await
        .with_context(|| format!("reading task input {}", input_name))?;
    let input_size = bytes.len() as u64;
    let task = Task::try_from(bytes).context("deserializing task")?;
    info!(
        "running task function '{}' over {} items",
        task.function,
        task.items.len()
    );

    let start_time = epoch_seconds();
    let outcome = run_items(store, registry, &task).await;
    let end_time = epoch_seconds();

    let envelope = match outcome {
        Ok(outputs) => ResultEnvelope::value(
            start_time,
            end_time,
            Some(input_size),
            serde_json::Value::Array(outputs),
        ),
        Err(error) => ResultEnvelope::exception(start_time, end_time, Some(input_size), error),
    };

    let result_name = fill_template(
        result_template,
        envelope.result_type,
        end_time.ceil() as u64,
    );
    let encoded = serde_json::to_vec(&envelope).context("serializing result")?;
    info!(
        "writing result ({}): {}",
        human_readable_size(encoded.len() as u64),
        store.access_info(&result_name)
    );
    store
        .put(&result_name, encoded.into(), Some("application/json"))
        .await?;

    if delete_input && envelope.result_type == ResultType::Value {
        info!("deleting input: {}", input_name);
        store.delete(input_name).await?;
    }

    Ok(result_name)
}
