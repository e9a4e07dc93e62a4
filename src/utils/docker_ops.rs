//! Docker operations abstraction for testability
//!
//! This module provides a trait-based abstraction for Docker operations,
//! enabling dependency injection and mocking for tests.

use super::executor::{CommandExecutor, RealExecutor};
use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;

pub use super::docker::{
    ContainerInfo, ContainerSpec, ExecOutput, Mount, MountKind, NetworkInfo, VolumeInfo,
};

/// Abstraction for Docker operations, enabling mocking in tests
#[async_trait]
pub trait DockerOperations: Send + Sync {
    /// Running containers matching every filter
    async fn list_containers(&self, filters: &[String]) -> Result<Vec<ContainerInfo>>;

    /// Volumes carrying the given label (`key=value` or `key`)
    async fn list_volumes(&self, label: &str) -> Result<Vec<VolumeInfo>>;

    /// Networks with exactly this name
    async fn list_networks(&self, name: &str) -> Result<Vec<NetworkInfo>>;

    async fn stop_container(&self, id: &str, timeout: Duration) -> Result<()>;

    async fn start_container(&self, id: &str) -> Result<()>;

    /// Run a shell command inside a container
    async fn exec(&self, id: &str, command: &str, user: Option<&str>) -> Result<ExecOutput>;

    async fn pull_image(&self, image: &str) -> Result<()>;

    /// Create a container, returning its id
    async fn create_container(&self, spec: &ContainerSpec) -> Result<String>;

    /// Wait for a container to exit, returning its exit code
    async fn wait_container(&self, id: &str) -> Result<i64>;

    async fn container_logs(&self, id: &str) -> Result<String>;

    async fn remove_container(&self, id: &str) -> Result<()>;
}

/// Default implementation using the docker CLI
#[derive(Clone)]
pub struct RealDockerOps {
    executor: Arc<dyn CommandExecutor>,
}

impl Default for RealDockerOps {
    fn default() -> Self {
        Self::new()
    }
}

impl RealDockerOps {
    pub fn new() -> Self {
        Self::with_executor(Arc::new(RealExecutor::new()))
    }

    pub fn with_executor(executor: Arc<dyn CommandExecutor>) -> Self {
        Self { executor }
    }
}

#[async_trait]
impl DockerOperations for RealDockerOps {
    async fn list_containers(&self, filters: &[String]) -> Result<Vec<ContainerInfo>> {
        super::docker::list_containers(self.executor.as_ref(), filters).await
    }

    async fn list_volumes(&self, label: &str) -> Result<Vec<VolumeInfo>> {
        super::docker::list_volumes(self.executor.as_ref(), label).await
    }

    async fn list_networks(&self, name: &str) -> Result<Vec<NetworkInfo>> {
        super::docker::list_networks(self.executor.as_ref(), name).await
    }

    async fn stop_container(&self, id: &str, timeout: Duration) -> Result<()> {
        super::docker::stop_container(self.executor.as_ref(), id, timeout).await
    }

    async fn start_container(&self, id: &str) -> Result<()> {
        super::docker::start_container(self.executor.as_ref(), id).await
    }

    async fn exec(&self, id: &str, command: &str, user: Option<&str>) -> Result<ExecOutput> {
        super::docker::exec_in_container(self.executor.as_ref(), id, command, user).await
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        super::docker::pull_image(self.executor.as_ref(), image).await
    }

    async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
        super::docker::create_container(self.executor.as_ref(), spec).await
    }

    async fn wait_container(&self, id: &str) -> Result<i64> {
        super::docker::wait_container(self.executor.as_ref(), id).await
    }

    async fn container_logs(&self, id: &str) -> Result<String> {
        super::docker::container_logs(self.executor.as_ref(), id).await
    }

    async fn remove_container(&self, id: &str) -> Result<()> {
        super::docker::remove_container(self.executor.as_ref(), id).await
    }
}

/// Mock implementation for testing
/// Available for use in external test crates
pub mod mock {
    use super::*;
    use std::collections::{HashMap, HashSet};
    use std::sync::Mutex;

    /// Recorded Docker operation call
    #[derive(Clone, Debug, PartialEq, Eq)]
    pub enum DockerCall {
        ListContainers { filters: Vec<String> },
        ListVolumes { label: String },
        ListNetworks { name: String },
        Stop { id: String },
        Start { id: String },
        Exec { id: String, command: String },
        Pull { image: String },
        Create { spec: ContainerSpec },
        Wait { id: String },
        Logs { id: String },
        Remove { id: String },
    }

    /// Mock Docker operations for testing
    #[derive(Clone, Default)]
    pub struct MockDockerOps {
        /// Recorded operation calls
        pub calls: Arc<Mutex<Vec<DockerCall>>>,
        containers: Arc<Mutex<Vec<ContainerInfo>>>,
        volumes: Arc<Mutex<Vec<VolumeInfo>>>,
        networks: Arc<Mutex<Vec<NetworkInfo>>>,
        failing_stop: Arc<Mutex<HashSet<String>>>,
        failing_start: Arc<Mutex<HashSet<String>>>,
        failing_exec: Arc<Mutex<bool>>,
        exit_code: Arc<Mutex<i64>>,
        logs: Arc<Mutex<String>>,
        should_fail_create: Arc<Mutex<bool>>,
        should_fail_list: Arc<Mutex<bool>>,
    }

    impl MockDockerOps {
        pub fn new() -> Self {
            Self::default()
        }

        /// Configure running containers; label filters are applied on listing
        pub fn with_containers(self, containers: Vec<ContainerInfo>) -> Self {
            *self.containers.lock().unwrap() = containers;
            self
        }

        pub fn with_volumes(self, volumes: Vec<VolumeInfo>) -> Self {
            *self.volumes.lock().unwrap() = volumes;
            self
        }

        pub fn with_networks(self, networks: Vec<NetworkInfo>) -> Self {
            *self.networks.lock().unwrap() = networks;
            self
        }

        pub fn with_failing_stop(self, id: &str) -> Self {
            self.failing_stop.lock().unwrap().insert(id.to_string());
            self
        }

        pub fn with_failing_start(self, id: &str) -> Self {
            self.failing_start.lock().unwrap().insert(id.to_string());
            self
        }

        pub fn with_failing_exec(self) -> Self {
            *self.failing_exec.lock().unwrap() = true;
            self
        }

        pub fn with_failing_create(self) -> Self {
            *self.should_fail_create.lock().unwrap() = true;
            self
        }

        pub fn with_failing_list(self) -> Self {
            *self.should_fail_list.lock().unwrap() = true;
            self
        }

        pub fn with_exit_code(self, code: i64) -> Self {
            *self.exit_code.lock().unwrap() = code;
            self
        }

        pub fn with_logs(self, logs: &str) -> Self {
            *self.logs.lock().unwrap() = logs.to_string();
            self
        }

        /// Get all recorded calls
        pub fn get_calls(&self) -> Vec<DockerCall> {
            self.calls.lock().unwrap().clone()
        }

        pub fn stopped(&self) -> Vec<String> {
            self.get_calls()
                .into_iter()
                .filter_map(|c| match c {
                    DockerCall::Stop { id } => Some(id),
                    _ => None,
                })
                .collect()
        }

        pub fn started(&self) -> Vec<String> {
            self.get_calls()
                .into_iter()
                .filter_map(|c| match c {
                    DockerCall::Start { id } => Some(id),
                    _ => None,
                })
                .collect()
        }

        pub fn exec_commands(&self) -> Vec<(String, String)> {
            self.get_calls()
                .into_iter()
                .filter_map(|c| match c {
                    DockerCall::Exec { id, command } => Some((id, command)),
                    _ => None,
                })
                .collect()
        }

        pub fn removed(&self) -> Vec<String> {
            self.get_calls()
                .into_iter()
                .filter_map(|c| match c {
                    DockerCall::Remove { id } => Some(id),
                    _ => None,
                })
                .collect()
        }

        fn record_call(&self, call: DockerCall) {
            self.calls.lock().unwrap().push(call);
        }
    }

    fn matches_label(labels: &HashMap<String, String>, filter: &str) -> bool {
        let filter = filter.strip_prefix("label=").unwrap_or(filter);
        match filter.split_once('=') {
            Some((key, value)) => labels.get(key).is_some_and(|v| v == value),
            None => labels.contains_key(filter),
        }
    }

    #[async_trait]
    impl DockerOperations for MockDockerOps {
        async fn list_containers(&self, filters: &[String]) -> Result<Vec<ContainerInfo>> {
            self.record_call(DockerCall::ListContainers {
                filters: filters.to_vec(),
            });
            if *self.should_fail_list.lock().unwrap() {
                anyhow::bail!("Mock list_containers failure");
            }
            Ok(self
                .containers
                .lock()
                .unwrap()
                .iter()
                .filter(|c| {
                    filters
                        .iter()
                        .filter(|f| f.starts_with("label="))
                        .all(|f| matches_label(&c.labels, f))
                })
                .cloned()
                .collect())
        }

        async fn list_volumes(&self, label: &str) -> Result<Vec<VolumeInfo>> {
            self.record_call(DockerCall::ListVolumes {
                label: label.to_string(),
            });
            if *self.should_fail_list.lock().unwrap() {
                anyhow::bail!("Mock list_volumes failure");
            }
            Ok(self
                .volumes
                .lock()
                .unwrap()
                .iter()
                .filter(|v| matches_label(&v.labels, label))
                .cloned()
                .collect())
        }

        async fn list_networks(&self, name: &str) -> Result<Vec<NetworkInfo>> {
            self.record_call(DockerCall::ListNetworks {
                name: name.to_string(),
            });
            Ok(self
                .networks
                .lock()
                .unwrap()
                .iter()
                .filter(|n| n.name == name)
                .cloned()
                .collect())
        }

        async fn stop_container(&self, id: &str, _timeout: Duration) -> Result<()> {
            self.record_call(DockerCall::Stop { id: id.to_string() });
            if self.failing_stop.lock().unwrap().contains(id) {
                anyhow::bail!("Mock stop failure for container {}", id);
            }
            Ok(())
        }

        async fn start_container(&self, id: &str) -> Result<()> {
            self.record_call(DockerCall::Start { id: id.to_string() });
            if self.failing_start.lock().unwrap().contains(id) {
                anyhow::bail!("Mock start failure for container {}", id);
            }
            Ok(())
        }

        async fn exec(&self, id: &str, command: &str, _user: Option<&str>) -> Result<ExecOutput> {
            self.record_call(DockerCall::Exec {
                id: id.to_string(),
                command: command.to_string(),
            });
            if *self.failing_exec.lock().unwrap() {
                anyhow::bail!("Mock exec failure in container {}", id);
            }
            Ok(ExecOutput {
                stdout: format!("ran {}", command),
                stderr: String::new(),
            })
        }

        async fn pull_image(&self, image: &str) -> Result<()> {
            self.record_call(DockerCall::Pull {
                image: image.to_string(),
            });
            Ok(())
        }

        async fn create_container(&self, spec: &ContainerSpec) -> Result<String> {
            self.record_call(DockerCall::Create { spec: spec.clone() });
            if *self.should_fail_create.lock().unwrap() {
                anyhow::bail!("Mock create failure");
            }
            Ok("mock-container".to_string())
        }

        async fn wait_container(&self, id: &str) -> Result<i64> {
            self.record_call(DockerCall::Wait { id: id.to_string() });
            Ok(*self.exit_code.lock().unwrap())
        }

        async fn container_logs(&self, id: &str) -> Result<String> {
            self.record_call(DockerCall::Logs { id: id.to_string() });
            Ok(self.logs.lock().unwrap().clone())
        }

        async fn remove_container(&self, id: &str) -> Result<()> {
            self.record_call(DockerCall::Remove { id: id.to_string() });
            Ok(())
        }
    }
}
