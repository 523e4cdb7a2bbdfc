//! Spawns each worker in a local container. When the store is a local
//! directory it is bind-mounted into the container; bucket stores are
//! reached directly from inside.

use anyhow::{Context, Result};
use bollard::container::RemoveContainerOptions;
use bollard::image::CreateImageOptions;
use bollard::Docker;
use futures::{StreamExt, TryStreamExt};
use tracing::{debug, info, warn};

use crate::common::hash_value;
use crate::naming::sanitize;
use crate::store::is_bucket_url;

use super::WorkerConfig;

/// Where a local store root is mounted inside worker containers.
pub const STORE_MOUNT: &str = "/fanout-data";

#[derive(Debug, Clone)]
pub struct LocalDockerBackend {
    docker: Docker,
    storage_root: String,
    worker: WorkerConfig,
}

impl LocalDockerBackend {
    pub fn new(storage_root: String, worker: WorkerConfig) -> Result<Self> {
        let docker = Docker::connect_with_local_defaults()
            .context("docker is not available, confirm it is installed and running")?;
        Ok(LocalDockerBackend {
            docker,
            storage_root,
            worker,
        })
    }

    pub fn image(&self) -> &str {
        &self.worker.image
    }

    pub async fn submit_task(
        &self,
        task_name: &str,
        input_name: &str,
        result_template: &str,
    ) -> Result<()> {
        pull_image(&self.docker, &self.worker.image).await?;

        let (storage_root, binds) = if is_bucket_url(&self.storage_root) {
            (self.storage_root.clone(), None)
        } else {
            let host_root = std::fs::canonicalize(&self.storage_root)
                .with_context(|| format!("resolving storage root {}", self.storage_root))?;
            (
                STORE_MOUNT.to_string(),
                Some(vec![format!("{}:{}", host_root.display(), STORE_MOUNT)]),
            )
        };

        let mut cmd = self.worker.container_argv();
        cmd.extend(
            self.worker
                .run_task_args(&storage_root, input_name, result_template),
        );

        // One attempt, one container: the template carries the attempt
        // number, so hashing it keeps speculative reruns from colliding.
        let container_name = format!(
            "fanout-{}-{}",
            sanitize(task_name),
            hash_value(result_template, 6)
        );
        debug!("creating container {}: {:?}", container_name, cmd);

        let config = bollard::container::Config {
            image: Some(self.worker.image.clone()),
            cmd: Some(cmd),
            tty: Some(false),
            host_config: Some(bollard::models::HostConfig {
                binds,
                ..Default::default()
            }),
            ..Default::default()
        };
        let options = bollard::container::CreateContainerOptions {
            name: container_name.as_str(),
            platform: None,
        };
        let id = self
            .docker
            .create_container(Some(options), config)
            .await
            .with_context(|| format!("creating container for '{}'", task_name))?
            .id;
        self.docker
            .start_container::<String>(&id, None)
            .await
            .with_context(|| format!("starting container for '{}'", task_name))?;
        info!("started container {} for task '{}'", container_name, task_name);

        // Fire and forget: reap the container once it exits.
        let docker = self.docker.clone();
        tokio::spawn(async move {
            let mut wait = docker.wait_container(
                &id,
                Some(bollard::container::WaitContainerOptions {
                    condition: "not-running",
                }),
            );
            while let Some(response) = wait.next().await {
                debug!("docker wait {}: {:?}", container_name, response);
            }
            remove_container(&docker, &container_name).await;
        });
        Ok(())
    }
}

async fn pull_image(docker: &Docker, image: &str) -> Result<()> {
    if docker.inspect_image(image).await.is_ok() {
        debug!("image {} found locally, not pulling", image);
        return Ok(());
    }
    info!("image {} not found, pulling it now", image);
    docker
        .create_image(
            Some(CreateImageOptions {
                from_image: image,
                ..Default::default()
            }),
            None,
            None,
        )
        .try_collect::<Vec<_>>()
        .await
        .with_context(|| format!("pulling image {}", image))?;
    Ok(())
}

async fn remove_container(docker: &Docker, name: &str) {
    let options = Some(RemoveContainerOptions {
        force: true,
        ..Default::default()
    });
    match docker.remove_container(name, options).await {
        Ok(_) => debug!("removed container {}", name),
        Err(err) => warn!("failed to remove container {}: {:#}", name, err),
    }
}
