//! Test fixtures and sample data
//!
//! Provides pre-built docker objects and a filesystem-only archiver.

use anyhow::Result;
use async_trait::async_trait;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use volume_backup::utils::archive::{ArchiveRequest, Archiver};
use volume_backup::utils::docker_ops::{ContainerInfo, NetworkInfo, VolumeInfo};

/// Contents written by [`FakeArchiver`]
pub const FAKE_ARCHIVE_CONTENT: &[u8] = b"archive";

/// Writes a placeholder archive instead of calling tar and gpg
#[derive(Debug, Clone, Copy, Default)]
pub struct FakeArchiver;

#[async_trait]
impl Archiver for FakeArchiver {
    async fn create(&self, request: &ArchiveRequest) -> Result<()> {
        tokio::fs::write(&request.target, FAKE_ARCHIVE_CONTENT).await?;
        Ok(())
    }

    async fn encrypt(&self, input: &Path, _passphrase: &str) -> Result<PathBuf> {
        let mut output = input.as_os_str().to_owned();
        output.push(".gpg");
        let output = PathBuf::from(output);
        tokio::fs::copy(input, &output).await?;
        Ok(output)
    }
}

/// Running container carrying the given labels
pub fn container(id: &str, labels: &[(&str, &str)]) -> ContainerInfo {
    ContainerInfo {
        id: id.to_string(),
        name: format!("/{}", id),
        running: true,
        labels: to_map(labels),
    }
}

/// Container opted into being stopped during backups
pub fn stoppable_container(id: &str) -> ContainerInfo {
    container(id, &[("docker-volume-backup.stop-during-backup", "true")])
}

/// Volume enabled for label based backups with the given env labels
pub fn labeled_volume(name: &str, env: &[(&str, &str)]) -> VolumeInfo {
    let mut labels = HashMap::from([("docker-volume-backup.enable".to_string(), "true".to_string())]);
    for (key, value) in env {
        labels.insert(format!("docker-volume-backup.env.{}", key), value.to_string());
    }
    VolumeInfo {
        name: name.to_string(),
        labels,
    }
}

pub fn network(id: &str, name: &str) -> NetworkInfo {
    NetworkInfo {
        id: id.to_string(),
        name: name.to_string(),
    }
}

fn to_map(pairs: &[(&str, &str)]) -> HashMap<String, String> {
    pairs
        .iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect()
}
