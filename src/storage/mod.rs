//! Storage backends archives are copied to and pruned from
//!
//! Every backend implements [`StorageBackend`]. A run builds one backend per
//! configured target, fans `copy` out across all of them, then prunes the
//! ones that received the fresh archive.

pub mod azure;
pub mod dropbox;
pub mod local;
pub mod s3;
pub mod ssh;
pub mod webdav;

pub use azure::AzureStorage;
pub use dropbox::DropboxStorage;
pub use local::LocalStorage;
pub use s3::S3Storage;
pub use ssh::SshStorage;
pub use webdav::WebdavStorage;

use crate::config::BackupConfig;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::future::join_all;
use std::error::Error as StdError;
use std::future::Future;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

/// Boxed error kept as the source of a [`StorageError`]
pub type BoxError = Box<dyn StdError + Send + Sync + 'static>;

#[derive(Debug, thiserror::Error)]
#[error("{backend}: {message}")]
pub struct StorageError {
    pub backend: &'static str,
    pub message: String,
    #[source]
    pub source: Option<BoxError>,
}

impl StorageError {
    pub fn new(backend: &'static str, message: impl Into<String>) -> Self {
        Self {
            backend,
            message: message.into(),
            source: None,
        }
    }

    pub fn with_source(backend: &'static str, message: impl Into<String>, source: impl Into<BoxError>) -> Self {
        Self {
            backend,
            message: message.into(),
            source: Some(source.into()),
        }
    }
}

/// Attach backend context to fallible operations
pub trait StorageContext<T> {
    fn storage_context<F, S>(self, backend: &'static str, message: F) -> Result<T, StorageError>
    where
        F: FnOnce() -> S,
        S: Into<String>;
}

impl<T, E> StorageContext<T> for Result<T, E>
where
    E: Into<BoxError>,
{
    fn storage_context<F, S>(self, backend: &'static str, message: F) -> Result<T, StorageError>
    where
        F: FnOnce() -> S,
        S: Into<String>,
    {
        self.map_err(|e| StorageError::with_source(backend, message(), e))
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LogLevel {
    Info,
    Warning,
    Error,
}

/// Log sink shared by every backend of a run; receives level, backend name and message
pub type LogFn = Arc<dyn Fn(LogLevel, &str, &str) + Send + Sync>;

/// Sink that forwards straight to `tracing`
pub fn tracing_log() -> LogFn {
    Arc::new(|level, backend, message| match level {
        LogLevel::Info => tracing::info!(storage = backend, "{}", message),
        LogLevel::Warning => tracing::warn!(storage = backend, "{}", message),
        LogLevel::Error => tracing::error!(storage = backend, "{}", message),
    })
}

/// Retention rules applied when pruning
#[derive(Debug, Clone)]
pub struct PrunePolicy {
    /// Negative values disable pruning
    pub retention_days: i32,
    pub leeway: Duration,
    pub prefix: String,
    /// Backend names exempt from pruning, compared case-insensitively
    pub skip: Vec<String>,
}

impl PrunePolicy {
    pub fn from_config(backup: &BackupConfig) -> Self {
        Self {
            retention_days: backup.retention_days,
            leeway: backup.pruning_leeway,
            prefix: backup.pruning_prefix.clone(),
            skip: backup.skip_backends_from_prune.clone(),
        }
    }

    pub fn enabled(&self) -> bool {
        self.retention_days >= 0
    }

    /// Artifacts modified strictly before this instant are eligible
    pub fn deadline(&self, now: DateTime<Utc>) -> Option<DateTime<Utc>> {
        if !self.enabled() {
            return None;
        }
        let retention = chrono::Duration::days(i64::from(self.retention_days));
        let leeway = chrono::Duration::from_std(self.leeway).ok()?;
        now.checked_sub_signed(retention)?.checked_sub_signed(leeway)
    }

    pub fn is_eligible(&self, modified: DateTime<Utc>, now: DateTime<Utc>) -> bool {
        self.deadline(now).is_some_and(|deadline| modified < deadline)
    }

    pub fn matches_prefix(&self, name: &str) -> bool {
        name.starts_with(&self.prefix)
    }

    pub fn skips(&self, backend: &str) -> bool {
        self.skip.iter().any(|s| s.eq_ignore_ascii_case(backend))
    }
}

/// Counts reported by a prune pass
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PruneStats {
    pub total: usize,
    pub pruned: usize,
}

/// A stored backup as seen by a listing
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Artifact {
    /// Backend specific handle, usually the object key or remote path
    pub name: String,
    pub modified: DateTime<Utc>,
}

/// Split artifacts carrying the pruning prefix into the candidate count and the eligible ones
pub fn select_for_pruning(
    policy: &PrunePolicy,
    now: DateTime<Utc>,
    artifacts: Vec<Artifact>,
    file_name: impl Fn(&Artifact) -> &str,
) -> (usize, Vec<Artifact>) {
    let candidates: Vec<Artifact> = artifacts
        .into_iter()
        .filter(|a| policy.matches_prefix(file_name(a)))
        .collect();
    let total = candidates.len();
    let matches = candidates
        .into_iter()
        .filter(|a| policy.is_eligible(a.modified, now))
        .collect();
    (total, matches)
}

/// Remove `matches` unless doing so would delete every candidate
pub async fn do_prune<F, Fut>(
    backend: &'static str,
    log: &LogFn,
    matches: usize,
    total: usize,
    deadline: DateTime<Utc>,
    remove: F,
) -> Result<PruneStats, StorageError>
where
    F: FnOnce() -> Fut,
    Fut: Future<Output = Result<(), StorageError>>,
{
    if matches != 0 && matches != total {
        remove().await?;
        log(
            LogLevel::Info,
            backend,
            &format!(
                "Pruned {} out of {} backups as they were older than the given deadline of {}.",
                matches,
                total,
                deadline.to_rfc3339()
            ),
        );
        Ok(PruneStats { total, pruned: matches })
    } else if matches != 0 {
        log(
            LogLevel::Warning,
            backend,
            &format!(
                "The current configuration would delete all {} existing backups. Refusing to do so, please check your configuration.",
                total
            ),
        );
        Ok(PruneStats { total, pruned: 0 })
    } else {
        log(
            LogLevel::Info,
            backend,
            &format!("None of {} existing backups were pruned.", total),
        );
        Ok(PruneStats { total, pruned: 0 })
    }
}

/// A place archives are copied to
#[async_trait]
pub trait StorageBackend: Send + Sync {
    /// Name used in stats, logs and the skip-from-prune list
    fn name(&self) -> &'static str;

    /// Copy the archive, returning where it was stored
    async fn copy(&self, file: &Path) -> Result<String, StorageError>;

    /// Delete archives older than the policy allows
    async fn prune(&self, policy: &PrunePolicy, now: DateTime<Utc>) -> Result<PruneStats, StorageError>;
}

/// Copy to every backend concurrently, reporting each outcome in input order
pub async fn copy_all(
    backends: &[Arc<dyn StorageBackend>],
    file: &Path,
) -> Vec<(&'static str, Result<String, StorageError>)> {
    join_all(backends.iter().map(|backend| async move {
        (backend.name(), backend.copy(file).await)
    }))
    .await
}

/// Prune every backend concurrently, honoring the skip list
pub async fn prune_all(
    backends: &[Arc<dyn StorageBackend>],
    policy: &PrunePolicy,
    now: DateTime<Utc>,
) -> Vec<(&'static str, Result<PruneStats, StorageError>)> {
    join_all(
        backends
            .iter()
            .filter(|backend| !policy.skips(backend.name()))
            .map(|backend| async move { (backend.name(), backend.prune(policy, now).await) }),
    )
    .await
}

/// Join a remote directory and a file name with exactly one slash
pub(crate) fn join_remote(dir: &str, name: &str) -> String {
    let dir = dir.trim_end_matches('/');
    if dir.is_empty() {
        name.to_string()
    } else {
        format!("{}/{}", dir, name)
    }
}

/// Last path segment of a remote key
pub(crate) fn base_name(key: &str) -> &str {
    key.rsplit('/').next().unwrap_or(key)
}

/// In-memory backend for tests
pub mod mock {
    use super::*;
    use std::path::PathBuf;
    use std::sync::Mutex;

    #[derive(Clone)]
    pub struct MockStorage {
        name: &'static str,
        /// Files passed to `copy`
        pub copies: Arc<Mutex<Vec<PathBuf>>>,
        /// Number of `prune` calls
        pub prunes: Arc<Mutex<usize>>,
        fail_copy: bool,
        fail_prune: bool,
        prune_stats: PruneStats,
    }

    impl MockStorage {
        pub fn new(name: &'static str) -> Self {
            Self {
                name,
                copies: Arc::new(Mutex::new(Vec::new())),
                prunes: Arc::new(Mutex::new(0)),
                fail_copy: false,
                fail_prune: false,
                prune_stats: PruneStats::default(),
            }
        }

        pub fn with_failing_copy(mut self) -> Self {
            self.fail_copy = true;
            self
        }

        pub fn with_failing_prune(mut self) -> Self {
            self.fail_prune = true;
            self
        }

        pub fn with_prune_stats(mut self, total: usize, pruned: usize) -> Self {
            self.prune_stats = PruneStats { total, pruned };
            self
        }

        pub fn copied(&self) -> Vec<PathBuf> {
            self.copies.lock().unwrap().clone()
        }

        pub fn prune_count(&self) -> usize {
            *self.prunes.lock().unwrap()
        }
    }

    #[async_trait]
    impl StorageBackend for MockStorage {
        fn name(&self) -> &'static str {
            self.name
        }

        async fn copy(&self, file: &Path) -> Result<String, StorageError> {
            self.copies.lock().unwrap().push(file.to_path_buf());
            if self.fail_copy {
                return Err(StorageError::new(self.name, "upload rejected"));
            }
            let name = file.file_name().map(|n| n.to_string_lossy().into_owned()).unwrap_or_default();
            Ok(format!("mock://{}/{}", self.name.to_lowercase(), name))
        }

        async fn prune(&self, _policy: &PrunePolicy, _now: DateTime<Utc>) -> Result<PruneStats, StorageError> {
            *self.prunes.lock().unwrap() += 1;
            if self.fail_prune {
                return Err(StorageError::new(self.name, "listing failed"));
            }
            Ok(self.prune_stats)
        }
    }
}
