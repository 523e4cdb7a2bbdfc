//! Runs each worker attempt as a cluster pod: render a restart-never
//! pod manifest and hand it to `kubectl apply`, retrying control-plane
//! errors with exponential backoff. Requires a bucket store — cluster
//! pods cannot see a driver-local directory.

use anyhow::{bail, Context, Result};
use clap::Args;
use serde_json::{json, Value};
use tokio::io::AsyncWriteExt;
use tracing::{debug, info, warn};

use crate::common::hash_value;
use crate::naming::sanitize;

use super::WorkerConfig;

const RETRIES_BEFORE_FAILURE: i32 = 12;
const FIRST_RETRY_SLEEP: f64 = 2.0;

#[derive(Debug, Clone, Args)]
pub struct KubernetesArgs {
    #[arg(long = "fanout-kubernetes-namespace", default_value = "default")]
    pub namespace: String,

    #[arg(long = "fanout-kubernetes-image-pull-policy", default_value = "Always")]
    pub image_pull_policy: String,

    /// e.g. `1` or `500m`.
    #[arg(long = "fanout-kubernetes-cpu-request")]
    pub cpu_request: Option<String>,

    /// e.g. `2Gi`.
    #[arg(long = "fanout-kubernetes-memory-request")]
    pub memory_request: Option<String>,

    #[arg(long = "fanout-kubernetes-context")]
    pub context: Option<String>,

    /// Kill the pod (and so the worker) after this many seconds. The
    /// task then simply never produces a result blob.
    #[arg(long = "fanout-kubernetes-active-deadline-seconds")]
    pub active_deadline_seconds: Option<u64>,

    #[arg(long = "fanout-kubectl", default_value = "kubectl")]
    pub kubectl: String,
}

impl Default for KubernetesArgs {
    fn default() -> Self {
        KubernetesArgs {
            namespace: "default".to_string(),
            image_pull_policy: "Always".to_string(),
            cpu_request: None,
            memory_request: None,
            context: None,
            active_deadline_seconds: None,
            kubectl: "kubectl".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct KubernetesBackend {
    storage_root: String,
    worker: WorkerConfig,
    args: KubernetesArgs,
}

impl KubernetesBackend {
    pub fn new(storage_root: String, worker: WorkerConfig, args: KubernetesArgs) -> Self {
        KubernetesBackend {
            storage_root,
            worker,
            args,
        }
    }

    pub fn image(&self) -> &str {
        &self.worker.image
    }

    pub fn namespace(&self) -> &str {
        &self.args.namespace
    }

    fn pod_manifest(&self, task_name: &str, input_name: &str, result_template: &str) -> Value {
        // One attempt, one pod; the attempt number inside the template
        // keeps speculative rerun pods from colliding on the name.
        let pod_name = format!(
            "fanout-{}-{}",
            sanitize(task_name),
            hash_value(result_template, 6)
        );
        let mut command = self.worker.container_argv();
        command.extend(
            self.worker
                .run_task_args(&self.storage_root, input_name, result_template),
        );

        let mut container = json!({
            "name": "worker",
            "image": self.worker.image,
            "imagePullPolicy": self.args.image_pull_policy,
            "command": command,
        });
        let mut requests = serde_json::Map::new();
        if let Some(cpu) = &self.args.cpu_request {
            requests.insert("cpu".to_string(), json!(cpu));
        }
        if let Some(memory) = &self.args.memory_request {
            requests.insert("memory".to_string(), json!(memory));
        }
        if !requests.is_empty() {
            container["resources"] = json!({ "requests": requests });
        }

        let mut spec = json!({
            "restartPolicy": "Never",
            "containers": [container],
        });
        if let Some(deadline) = self.args.active_deadline_seconds {
            spec["activeDeadlineSeconds"] = json!(deadline);
        }

        json!({
            "apiVersion": "v1",
            "kind": "Pod",
            "metadata": {
                "name": pod_name,
                "labels": {
                    "app": "fanout-worker",
                    "fanout-task": sanitize(task_name),
                },
            },
            "spec": spec,
        })
    }

    async fn kubectl_apply(&self, manifest: &Value) -> Result<()> {
        let mut command = tokio::process::Command::new(&self.args.kubectl);
        command
            .args(["apply", "-f", "-"])
            .args(["--namespace", &self.args.namespace])
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::null())
            .stderr(std::process::Stdio::piped());
        if let Some(context) = &self.args.context {
            command.args(["--context", context]);
        }

        let mut child = command.spawn().context("spawning kubectl")?;
        let mut stdin = child.stdin.take().context("opening kubectl stdin")?;
        stdin
            .write_all(serde_json::to_string(manifest)?.as_bytes())
            .await
            .context("writing pod manifest to kubectl")?;
        drop(stdin);

        let output = child.wait_with_output().await.context("waiting for kubectl")?;
        if !output.status.success() {
            bail!(
                "kubectl apply failed ({}): {}",
                output.status,
                String::from_utf8_lossy(&output.stderr).trim()
            );
        }
        Ok(())
    }

    pub async fn submit_task(
        &self,
        task_name: &str,
        input_name: &str,
        result_template: &str,
    ) -> Result<()> {
        let manifest = self.pod_manifest(task_name, input_name, result_template);
        debug!("submitting pod for task '{}'", task_name);

        let mut error_num = 0;
        loop {
            match self.kubectl_apply(&manifest).await {
                Ok(()) => break,
                Err(err) => {
                    error_num += 1;
                    if error_num > RETRIES_BEFORE_FAILURE {
                        return Err(err)
                            .with_context(|| format!("submitting pod for '{}'", task_name));
                    }
                    let sleep_seconds = FIRST_RETRY_SLEEP.powi(error_num);
                    warn!(
                        "pod submission for '{}' failed ({:#}); attempt {}/{}, sleeping {:.0}s",
                        task_name, err, error_num, RETRIES_BEFORE_FAILURE, sleep_seconds
                    );
                    tokio::time::sleep(std::time::Duration::from_secs_f64(sleep_seconds)).await;
                }
            }
        }
        info!("submitted pod for task '{}'", task_name);
        Ok(())
    }
}
