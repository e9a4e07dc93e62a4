//! Docker CLI wrappers used by the container runtime abstraction

use super::command::CommandOptions;
use super::executor::CommandExecutor;
use anyhow::{Context, Result};
use serde::Deserialize;
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tracing::debug;

/// Timeout applied to short-lived docker calls
pub const DOCKER_TIMEOUT: Duration = Duration::from_secs(60);

/// Socket mounted into proxy containers and probed to detect a local daemon
pub const DOCKER_SOCKET: &str = "/var/run/docker.sock";

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerInfo {
    pub id: String,
    pub name: String,
    pub running: bool,
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct VolumeInfo {
    pub name: String,
    pub labels: HashMap<String, String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NetworkInfo {
    pub id: String,
    pub name: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MountKind {
    Volume,
    Bind,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Mount {
    pub kind: MountKind,
    pub source: String,
    pub target: String,
}

impl Mount {
    fn to_arg(&self) -> String {
        let kind = match self.kind {
            MountKind::Volume => "volume",
            MountKind::Bind => "bind",
        };
        format!("type={},source={},target={}", kind, self.source, self.target)
    }
}

/// Everything needed to create a container
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ContainerSpec {
    pub image: String,
    pub entrypoint: Option<String>,
    pub env: Vec<(String, String)>,
    pub mounts: Vec<Mount>,
    pub network: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ExecOutput {
    pub stdout: String,
    pub stderr: String,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectContainer {
    id: String,
    name: String,
    state: InspectState,
    config: InspectConfig,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectState {
    running: bool,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectConfig {
    labels: Option<HashMap<String, String>>,
}

#[derive(Deserialize)]
#[serde(rename_all = "PascalCase")]
struct InspectVolume {
    name: String,
    labels: Option<HashMap<String, String>>,
}

/// Whether a docker daemon is reachable without further configuration
pub fn docker_available(docker_host: Option<&str>) -> bool {
    docker_host.is_some_and(|h| !h.is_empty()) || Path::new(DOCKER_SOCKET).exists()
}

fn to_args(list: &[&str]) -> Vec<String> {
    list.iter().map(|s| s.to_string()).collect()
}

fn short_opts() -> CommandOptions {
    CommandOptions::new().timeout(DOCKER_TIMEOUT)
}

/// Parse the JSON printed by `docker inspect` for containers
pub fn parse_container_inspect(json: &str) -> Result<Vec<ContainerInfo>> {
    let parsed: Vec<InspectContainer> =
        serde_json::from_str(json).context("Failed to parse docker inspect output")?;
    Ok(parsed
        .into_iter()
        .map(|c| ContainerInfo {
            id: c.id,
            name: c.name.trim_start_matches('/').to_string(),
            running: c.state.running,
            labels: c.config.labels.unwrap_or_default(),
        })
        .collect())
}

/// Parse the JSON printed by `docker volume inspect`
pub fn parse_volume_inspect(json: &str) -> Result<Vec<VolumeInfo>> {
    let parsed: Vec<InspectVolume> =
        serde_json::from_str(json).context("Failed to parse docker volume inspect output")?;
    Ok(parsed
        .into_iter()
        .map(|v| VolumeInfo {
            name: v.name,
            labels: v.labels.unwrap_or_default(),
        })
        .collect())
}

/// List running containers matching every given filter (`label=...`, `status=...`)
pub async fn list_containers(
    exec: &dyn CommandExecutor,
    filters: &[String],
) -> Result<Vec<ContainerInfo>> {
    let mut args = to_args(&["ps", "-q", "--no-trunc"]);
    for filter in filters {
        args.push("--filter".to_string());
        args.push(filter.clone());
    }
    let ids = exec.run_stdout("docker", &args, &short_opts()).await?;
    let ids: Vec<String> = ids.lines().map(str::trim).filter(|l| !l.is_empty()).map(str::to_string).collect();
    if ids.is_empty() {
        return Ok(Vec::new());
    }

    let mut args = vec!["inspect".to_string()];
    args.extend(ids);
    let json = exec.run_stdout("docker", &args, &short_opts()).await?;
    parse_container_inspect(&json)
}

/// List volumes matching a label filter
pub async fn list_volumes(exec: &dyn CommandExecutor, label: &str) -> Result<Vec<VolumeInfo>> {
    let args = to_args(&["volume", "ls", "-q", "--filter", &format!("label={}", label)]);
    let names = exec.run_stdout("docker", &args, &short_opts()).await?;
    let names: Vec<String> = names.lines().map(str::trim).filter(|l| !l.is_empty()).map(str::to_string).collect();
    if names.is_empty() {
        return Ok(Vec::new());
    }

    let mut args = to_args(&["volume", "inspect"]);
    args.extend(names);
    let json = exec.run_stdout("docker", &args, &short_opts()).await?;
    parse_volume_inspect(&json)
}

/// Networks whose name matches exactly
pub async fn list_networks(exec: &dyn CommandExecutor, name: &str) -> Result<Vec<NetworkInfo>> {
    let args = to_args(&[
        "network",
        "ls",
        "--no-trunc",
        "--filter",
        &format!("name={}", name),
        "--format",
        "{{.ID}}\t{{.Name}}",
    ]);
    let out = exec.run_stdout("docker", &args, &short_opts()).await?;
    Ok(out
        .lines()
        .filter_map(|line| line.split_once('\t'))
        .filter(|(_, n)| *n == name)
        .map(|(id, n)| NetworkInfo {
            id: id.to_string(),
            name: n.to_string(),
        })
        .collect())
}

pub async fn stop_container(exec: &dyn CommandExecutor, id: &str, timeout: Duration) -> Result<()> {
    let args = to_args(&["stop", "-t", &timeout.as_secs().to_string(), id]);
    let opts = CommandOptions::new().timeout(timeout + DOCKER_TIMEOUT);
    exec.run("docker", &args, &opts)
        .await
        .with_context(|| format!("Failed to stop container {}", id))?;
    Ok(())
}

pub async fn start_container(exec: &dyn CommandExecutor, id: &str) -> Result<()> {
    exec.run("docker", &to_args(&["start", id]), &short_opts())
        .await
        .with_context(|| format!("Failed to start container {}", id))?;
    Ok(())
}

/// Run a shell command inside a running container
pub async fn exec_in_container(
    exec: &dyn CommandExecutor,
    id: &str,
    command: &str,
    user: Option<&str>,
) -> Result<ExecOutput> {
    let mut args = vec!["exec".to_string()];
    if let Some(user) = user {
        args.push("--user".to_string());
        args.push(user.to_string());
    }
    args.extend(to_args(&[id, "/bin/sh", "-c", command]));

    let output = exec.run("docker", &args, &CommandOptions::new()).await?;
    Ok(ExecOutput {
        stdout: String::from_utf8_lossy(&output.stdout).to_string(),
        stderr: String::from_utf8_lossy(&output.stderr).to_string(),
    })
}

pub async fn pull_image(exec: &dyn CommandExecutor, image: &str) -> Result<()> {
    debug!("Pulling image {}", image);
    exec.run("docker", &to_args(&["pull", "--quiet", image]), &CommandOptions::new())
        .await
        .with_context(|| format!("Unable to pull image {}", image))?;
    Ok(())
}

/// Create a container and return its id
///
/// Environment values are handed to the docker CLI through its own
/// environment so they never show up in the process list.
pub async fn create_container(exec: &dyn CommandExecutor, spec: &ContainerSpec) -> Result<String> {
    let mut args = vec!["create".to_string()];
    let mut opts = short_opts();

    if let Some(entrypoint) = &spec.entrypoint {
        args.push("--entrypoint".to_string());
        args.push(entrypoint.clone());
    }
    for (key, value) in &spec.env {
        args.push("-e".to_string());
        args.push(key.clone());
        opts = opts.env(key.clone(), value.clone());
    }
    for mount in &spec.mounts {
        args.push("--mount".to_string());
        args.push(mount.to_arg());
    }
    if let Some(network) = &spec.network {
        args.push("--network".to_string());
        args.push(network.clone());
    }
    args.push(spec.image.clone());

    let id = exec
        .run_stdout("docker", &args, &opts)
        .await
        .context("Unable to create container")?;
    Ok(id.trim().to_string())
}

/// Block until the container exits and return its exit code
pub async fn wait_container(exec: &dyn CommandExecutor, id: &str) -> Result<i64> {
    let out = exec
        .run_stdout("docker", &to_args(&["wait", id]), &CommandOptions::new())
        .await?;
    out.trim()
        .parse()
        .with_context(|| format!("Unexpected output from docker wait: {}", out.trim()))
}

pub async fn container_logs(exec: &dyn CommandExecutor, id: &str) -> Result<String> {
    let output = exec
        .run("docker", &to_args(&["logs", id]), &short_opts())
        .await
        .context("Unable to get logs from container")?;
    let mut logs = String::from_utf8_lossy(&output.stdout).to_string();
    logs.push_str(&String::from_utf8_lossy(&output.stderr));
    Ok(logs)
}

pub async fn remove_container(exec: &dyn CommandExecutor, id: &str) -> Result<()> {
    exec.run("docker", &to_args(&["rm", "-f", id]), &short_opts())
        .await
        .with_context(|| format!("Unable to remove container {}", id))?;
    Ok(())
}
