//! Task-launching backends. The contract is deliberately narrow: a
//! backend fires off a worker for `(task_name, input_blob,
//! result_template)` and returns immediately. Completion is never
//! signalled back; the driver discovers it by polling the blob store.

use std::sync::Arc;

use anyhow::{Context, Result};
use clap::Args;

use crate::store::Store;
use crate::task::TaskRegistry;

pub mod docker;
pub mod in_process;
pub mod kubernetes;
pub mod process;

pub use docker::LocalDockerBackend;
pub use in_process::InProcessBackend;
pub use kubernetes::{KubernetesArgs, KubernetesBackend};
pub use process::LocalProcessBackend;

/// Worker invocation settings consumed by the non-in-process backends.
#[derive(Debug, Clone, Args)]
pub struct WorkerConfig {
    /// Container image that ships the worker binary (docker and
    /// kubernetes backends).
    #[arg(long = "fanout-worker-image", default_value = "fanout:latest")]
    pub image: String,

    /// Worker command, space separated. Defaults to this executable for
    /// the local-process backend and to `fanout` inside containers.
    #[arg(long = "fanout-worker-command")]
    pub command: Option<String>,

    /// Delete task input blobs after successful runs.
    #[arg(long = "fanout-worker-delete-input")]
    pub delete_input: bool,
}

impl Default for WorkerConfig {
    fn default() -> Self {
        WorkerConfig {
            image: "fanout:latest".to_string(),
            command: None,
            delete_input: false,
        }
    }
}

impl WorkerConfig {
    /// Argv for spawning a worker on this host.
    pub fn local_argv(&self) -> Result<Vec<String>> {
        match &self.command {
            Some(command) => Ok(command.split_whitespace().map(str::to_string).collect()),
            None => {
                let exe = std::env::current_exe().context("locating current executable")?;
                Ok(vec![exe.to_string_lossy().into_owned()])
            }
        }
    }

    /// Argv for spawning a worker inside a container image.
    pub fn container_argv(&self) -> Vec<String> {
        match &self.command {
            Some(command) => command.split_whitespace().map(str::to_string).collect(),
            None => vec!["fanout".to_string()],
        }
    }

    /// Arguments for the `run-task` worker entry point.
    pub fn run_task_args(
        &self,
        storage_root: &str,
        input_name: &str,
        result_template: &str,
    ) -> Vec<String> {
        let mut args = vec![
            "run-task".to_string(),
            input_name.to_string(),
            result_template.to_string(),
            "--storage".to_string(),
            storage_root.to_string(),
        ];
        if self.delete_input {
            args.push("--delete-input".to_string());
        }
        args
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum BackendKind {
    InProcess,
    LocalProcess,
    LocalDocker,
    Kubernetes,
}

/// Backend selection plus per-backend settings, flattened into the
/// client argument surface.
#[derive(Debug, Clone, Args)]
pub struct BackendArgs {
    #[arg(long = "fanout-backend", value_enum, default_value = "local-process")]
    pub backend: BackendKind,

    #[command(flatten)]
    pub worker: WorkerConfig,

    #[command(flatten)]
    pub kubernetes: KubernetesArgs,
}

impl BackendArgs {
    pub fn build(&self, store: &Store, registry: Arc<TaskRegistry>) -> Result<Backend> {
        let backend = match self.backend {
            BackendKind::InProcess => Backend::InProcess(InProcessBackend::new(
                store.clone(),
                registry,
                self.worker.delete_input,
            )),
            BackendKind::LocalProcess => Backend::LocalProcess(LocalProcessBackend::new(
                store.root().to_string(),
                self.worker.clone(),
            )),
            BackendKind::LocalDocker => Backend::LocalDocker(LocalDockerBackend::new(
                store.root().to_string(),
                self.worker.clone(),
            )?),
            BackendKind::Kubernetes => Backend::Kubernetes(KubernetesBackend::new(
                store.root().to_string(),
                self.worker.clone(),
                self.kubernetes.clone(),
            )),
        };
        Ok(backend)
    }
}

#[derive(Debug, Clone)]
pub enum Backend {
    InProcess(InProcessBackend),
    LocalProcess(LocalProcessBackend),
    LocalDocker(LocalDockerBackend),
    Kubernetes(KubernetesBackend),
}

impl Backend {
    /// Launch a worker for one task attempt. Fire-and-forget: returns
    /// as soon as the launch is handed off.
    pub async fn submit_task(
        &self,
        task_name: &str,
        input_name: &str,
        result_template: &str,
    ) -> Result<()> {
        match self {
            Backend::InProcess(backend) => {
                backend.submit_task(task_name, input_name, result_template).await
            }
            Backend::LocalProcess(backend) => {
                backend.submit_task(task_name, input_name, result_template).await
            }
            Backend::LocalDocker(backend) => {
                backend.submit_task(task_name, input_name, result_template).await
            }
            Backend::Kubernetes(backend) => {
                backend.submit_task(task_name, input_name, result_template).await
            }
        }
    }

    /// Reject incompatible backend/storage pairings before any work is
    /// submitted.
    pub fn supports_storage(&self, store: &Store) -> bool {
        match self {
            Backend::InProcess(_) | Backend::LocalProcess(_) | Backend::LocalDocker(_) => true,
            Backend::Kubernetes(_) => store.is_bucket(),
        }
    }

    pub fn describe(&self) -> String {
        match self {
            Backend::InProcess(_) => "in-process".to_string(),
            Backend::LocalProcess(_) => "local-process".to_string(),
            Backend::LocalDocker(backend) => format!("local-docker({})", backend.image()),
            Backend::Kubernetes(backend) => format!(
                "kubernetes({} namespace={})",
                backend.image(),
                backend.namespace()
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_config_argv() {
        let config = WorkerConfig {
            command: Some("fanout --quiet".to_string()),
            ..WorkerConfig::default()
        };
        assert_eq!(config.local_argv().unwrap(), vec!["fanout", "--quiet"]);
        assert_eq!(config.container_argv(), vec!["fanout", "--quiet"]);

        let default = WorkerConfig::default();
        assert_eq!(default.container_argv(), vec!["fanout"]);
        assert!(default.local_argv().unwrap()[0].len() > 0);
    }

    #[test]
    fn test_run_task_args() {
        let mut config = WorkerConfig::default();
        assert_eq!(
            config.run_task_args("/data", "input::k::0", "result::k::0::0::1::{result_type}::{result_time}"),
            vec![
                "run-task",
                "input::k::0",
                "result::k::0::0::1::{result_type}::{result_time}",
                "--storage",
                "/data",
            ]
        );
        config.delete_input = true;
        assert!(config
            .run_task_args("/data", "i", "r")
            .contains(&"--delete-input".to_string()));
    }
}
