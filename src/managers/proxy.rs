//! Runs label-sourced backups in a throwaway container
//!
//! The labeled volume is mounted at `/backup` of a fresh backup container
//! that receives the decoded configuration as `OFFEN_` variables. The
//! container is removed again whatever the outcome.

use crate::config::Config;
use crate::utils::docker::DOCKER_SOCKET;
use crate::utils::docker_ops::{ContainerSpec, DockerOperations, Mount, MountKind};
use anyhow::{anyhow, bail, Context, Result};
use tracing::info;

/// Entrypoint of the backup image
const ENTRYPOINT: &str = "backup";

/// Back up the volume named by `config.source` through a proxy container
pub async fn run_proxy(config: &Config, docker: &dyn DockerOperations) -> Result<()> {
    let image = &config.backup.proxy_image;
    docker.pull_image(image).await.context("unable to pull image")?;

    let network = if config.backup.proxy_network.is_empty() {
        None
    } else {
        let name = &config.backup.proxy_network;
        let networks = docker
            .list_networks(name)
            .await
            .with_context(|| format!("unable to look up network {}", name))?;
        let network = networks
            .into_iter()
            .next()
            .ok_or_else(|| anyhow!("network {} does not exist", name))?;
        Some(network.id)
    };

    let spec = container_spec(config, network);
    let id = docker
        .create_container(&spec)
        .await
        .context("unable to create container")?;
    info!(volume = %config.source, container = %id, "Created proxy container");

    let result = run_container(docker, &id, &config.source).await;
    let removed = docker
        .remove_container(&id)
        .await
        .context("unable to remove container");

    match (result, removed) {
        (Ok(()), removed) => removed,
        (Err(e), Ok(())) => Err(e),
        (Err(e), Err(removed)) => Err(e.context(format!("{:#}", removed))),
    }
}

async fn run_container(docker: &dyn DockerOperations, id: &str, volume: &str) -> Result<()> {
    docker.start_container(id).await.context("unable to start container")?;
    let status = docker.wait_container(id).await.context("error running container")?;

    let logs = docker
        .container_logs(id)
        .await
        .context("unable to get logs from container")?;
    for line in logs.lines().filter(|l| !l.trim().is_empty()) {
        info!(volume = %volume, "{}", line);
    }

    if status != 0 {
        bail!("backup container for volume {} exited with status {}", volume, status);
    }
    Ok(())
}

/// Container definition for backing up the volume named by `config.source`
pub fn container_spec(config: &Config, network: Option<String>) -> ContainerSpec {
    let mut env: Vec<(String, String)> = config
        .env
        .iter()
        .filter(|(key, _)| key.starts_with("OFFEN_"))
        .map(|(key, value)| (key.to_string(), value.to_string()))
        .collect();
    env.sort();

    let hostname = config
        .env
        .get("HOSTNAME")
        .map(str::to_string)
        .or_else(|| std::env::var("HOSTNAME").ok())
        .unwrap_or_default();
    env.push(("HOSTNAME".to_string(), hostname));

    ContainerSpec {
        image: config.backup.proxy_image.clone(),
        entrypoint: Some(ENTRYPOINT.to_string()),
        env,
        mounts: vec![
            Mount {
                kind: MountKind::Volume,
                source: config.source.clone(),
                target: "/backup".to_string(),
            },
            Mount {
                kind: MountKind::Bind,
                source: DOCKER_SOCKET.to_string(),
                target: DOCKER_SOCKET.to_string(),
            },
        ],
        network,
    }
}
