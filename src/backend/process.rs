//! Spawns each worker as a local subprocess running the `run-task`
//! entry point, by default re-invoking the current executable.

use anyhow::{Context, Result};
use tracing::debug;

use super::WorkerConfig;

#[derive(Debug, Clone)]
pub struct LocalProcessBackend {
    storage_root: String,
    worker: WorkerConfig,
}

impl LocalProcessBackend {
    pub fn new(storage_root: String, worker: WorkerConfig) -> Self {
        LocalProcessBackend {
            storage_root,
            worker,
        }
    }

    pub async fn submit_task(
        &self,
        task_name: &str,
        input_name: &str,
        result_template: &str,
    ) -> Result<()> {
        let argv = self.worker.local_argv()?;
        let args = self
            .worker
            .run_task_args(&self.storage_root, input_name, result_template);
        debug!("running task '{}': {} {}", task_name, argv.join(" "), args.join(" "));

        let mut command = tokio::process::Command::new(&argv[0]);
        command
            .args(&argv[1..])
            .args(&args)
            .stdin(std::process::Stdio::null());
        let mut child = command
            .spawn()
            .with_context(|| format!("spawning worker process for '{}'", task_name))?;

        // Fire and forget; reap the child off to the side so it does not
        // linger as a zombie.
        let task_name = task_name.to_string();
        tokio::spawn(async move {
            match child.wait().await {
                Ok(status) if !status.success() => {
                    debug!("worker process for '{}' exited with {}", task_name, status);
                }
                Ok(_) => {}
                Err(err) => debug!("waiting on worker process for '{}': {}", task_name, err),
            }
        });
        Ok(())
    }
}
