//! Local archive directory backend

use super::{
    do_prune, select_for_pruning, Artifact, LogFn, LogLevel, PrunePolicy, PruneStats, StorageBackend,
    StorageContext, StorageError,
};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};

const NAME: &str = "Local";

pub struct LocalStorage {
    archive_path: PathBuf,
    latest_symlink: String,
    log: LogFn,
}

impl LocalStorage {
    pub fn new(archive_path: impl Into<PathBuf>, latest_symlink: impl Into<String>, log: LogFn) -> Self {
        Self {
            archive_path: archive_path.into(),
            latest_symlink: latest_symlink.into(),
            log,
        }
    }

    async fn update_symlink(&self, target_name: &str) -> Result<(), StorageError> {
        let link = self.archive_path.join(&self.latest_symlink);
        match tokio::fs::symlink_metadata(&link).await {
            Ok(_) => tokio::fs::remove_file(&link)
                .await
                .storage_context(NAME, || format!("error removing existing symlink {:?}", link))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(StorageError::with_source(NAME, format!("error checking symlink {:?}", link), e)),
        }

        tokio::fs::symlink(target_name, &link)
            .await
            .storage_context(NAME, || format!("error creating latest symlink {:?}", link))?;
        (self.log)(
            LogLevel::Info,
            NAME,
            &format!("Created/Updated symlink `{}` for latest backup.", self.latest_symlink),
        );
        Ok(())
    }

    /// Regular files and symlinks in the archive directory carrying the pruning prefix
    async fn list(&self, prefix: &str) -> Result<(Vec<Artifact>, Vec<PathBuf>), StorageError> {
        let mut entries = tokio::fs::read_dir(&self.archive_path)
            .await
            .storage_context(NAME, || format!("error reading directory {:?}", self.archive_path))?;

        let mut files = Vec::new();
        let mut links = Vec::new();
        while let Some(entry) = entries
            .next_entry()
            .await
            .storage_context(NAME, || format!("error reading directory {:?}", self.archive_path))?
        {
            let name = entry.file_name().to_string_lossy().into_owned();
            if !name.starts_with(prefix) {
                continue;
            }
            let path = entry.path();
            let meta = tokio::fs::symlink_metadata(&path)
                .await
                .storage_context(NAME, || format!("error calling lstat on file {:?}", path))?;

            if meta.file_type().is_symlink() {
                links.push(path);
            } else if meta.is_file() {
                let modified = meta
                    .modified()
                    .storage_context(NAME, || format!("error reading mtime of {:?}", path))?;
                files.push(Artifact {
                    name: path.to_string_lossy().into_owned(),
                    modified: DateTime::<Utc>::from(modified),
                });
            }
        }
        Ok((files, links))
    }
}

#[async_trait]
impl StorageBackend for LocalStorage {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn copy(&self, file: &Path) -> Result<String, StorageError> {
        let name = file
            .file_name()
            .ok_or_else(|| StorageError::new(NAME, format!("{:?} has no file name", file)))?
            .to_string_lossy()
            .into_owned();
        let destination = self.archive_path.join(&name);

        tokio::fs::copy(file, &destination)
            .await
            .storage_context(NAME, || format!("error copying file {:?} to {:?}", file, destination))?;
        (self.log)(
            LogLevel::Info,
            NAME,
            &format!("Stored copy of backup `{}` in `{}`.", name, self.archive_path.display()),
        );

        if !self.latest_symlink.is_empty() {
            self.update_symlink(&name).await?;
        }

        Ok(destination.to_string_lossy().into_owned())
    }

    async fn prune(&self, policy: &PrunePolicy, now: DateTime<Utc>) -> Result<PruneStats, StorageError> {
        let Some(deadline) = policy.deadline(now) else {
            return Ok(PruneStats::default());
        };

        let (files, links) = self.list(&policy.prefix).await?;
        let (total, matches) = select_for_pruning(policy, now, files, |a| {
            Path::new(&a.name)
                .file_name()
                .and_then(|n| n.to_str())
                .unwrap_or_default()
        });

        let stats = do_prune(NAME, &self.log, matches.len(), total, deadline, || async {
            let mut failures = Vec::new();
            for artifact in &matches {
                if let Err(e) = tokio::fs::remove_file(&artifact.name).await {
                    failures.push(format!("{}: {}", artifact.name, e));
                }
            }
            if failures.is_empty() {
                Ok(())
            } else {
                Err(StorageError::new(
                    NAME,
                    format!("{} error(s) deleting files: {}", failures.len(), failures.join(", ")),
                ))
            }
        })
        .await?;

        // Links whose target no longer exists
        for link in links {
            if tokio::fs::metadata(&link).await.is_err() {
                tokio::fs::remove_file(&link)
                    .await
                    .storage_context(NAME, || format!("error removing dangling symlink {:?}", link))?;
                (self.log)(
                    LogLevel::Info,
                    NAME,
                    &format!("Removed dangling symlink `{}`.", link.display()),
                );
            }
        }

        Ok(stats)
    }
}
