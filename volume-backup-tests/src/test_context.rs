//! Test context and harness for pipeline runs
//!
//! Provides a temporary workspace with sources, archive and lock paths and
//! the matching [`ScriptDependencies`].

use crate::fixtures::FakeArchiver;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tempfile::TempDir;
use volume_backup::managers::notification::Notifier;
use volume_backup::managers::script::ScriptDependencies;
use volume_backup::storage::StorageBackend;
use volume_backup::utils::docker_ops::DockerOperations;
use volume_backup::utils::executor::mock::MockExecutor;

/// Test context that manages test resources and provides common utilities
pub struct TestContext {
    /// Temporary directory for test files
    temp_dir: TempDir,
    executor: MockExecutor,
}

impl TestContext {
    /// Create a new test context with `sources/` and `archive/` directories
    pub fn new() -> Self {
        let ctx = Self {
            temp_dir: TempDir::new().expect("Failed to create temp dir"),
            executor: MockExecutor::new(),
        };
        ctx.create_subdir("sources");
        ctx.create_subdir("archive");
        ctx
    }

    /// Get the temporary directory path
    pub fn temp_dir(&self) -> &Path {
        self.temp_dir.path()
    }

    pub fn sources_dir(&self) -> PathBuf {
        self.temp_dir.path().join("sources")
    }

    pub fn archive_dir(&self) -> PathBuf {
        self.temp_dir.path().join("archive")
    }

    pub fn confd_dir(&self) -> PathBuf {
        self.temp_dir.path().join("conf.d")
    }

    pub fn lock_path(&self) -> PathBuf {
        self.temp_dir.path().join("backup.lock")
    }

    /// Directory the pipeline writes its temporary archive to
    pub fn work_dir(&self) -> PathBuf {
        self.temp_dir.path().join("work")
    }

    /// Executor shared with the dependencies returned by [`Self::deps`]
    pub fn executor(&self) -> &MockExecutor {
        &self.executor
    }

    /// Create a subdirectory in the temp dir
    pub fn create_subdir(&self, name: &str) -> PathBuf {
        let path = self.temp_dir.path().join(name);
        fs::create_dir_all(&path).expect("Failed to create subdirectory");
        path
    }

    /// Create a file in the temp dir
    pub fn create_file(&self, name: &str, content: &str) -> PathBuf {
        let path = self.temp_dir.path().join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("Failed to create parent directory");
        }
        fs::write(&path, content).expect("Failed to write file");
        path
    }

    /// Files currently in the archive directory, sorted by name
    pub fn archived_files(&self) -> Vec<String> {
        let mut names: Vec<String> = fs::read_dir(self.archive_dir())
            .expect("Failed to read archive directory")
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        names.sort();
        names
    }

    /// Dependencies wired to the temp dir, the fake archiver and no docker
    pub fn deps(&self) -> ScriptDependencies {
        self.create_subdir("work");
        ScriptDependencies::detect()
            .with_docker(None)
            .with_executor(Arc::new(self.executor.clone()))
            .with_archiver(Arc::new(FakeArchiver))
            .with_lock_path(self.lock_path())
            .with_work_dir(self.work_dir())
            .with_templates_dir(self.temp_dir.path().join("notifications.d"))
    }

    /// Dependencies with explicit backends and a notifier
    pub fn deps_with(
        &self,
        backends: Vec<Arc<dyn StorageBackend>>,
        notifier: Arc<dyn Notifier>,
    ) -> ScriptDependencies {
        self.deps().with_backends(backends).with_notifier(notifier)
    }

    /// Same as [`Self::deps_with`] but talking to the given docker mock
    pub fn deps_with_docker(
        &self,
        backends: Vec<Arc<dyn StorageBackend>>,
        notifier: Arc<dyn Notifier>,
        docker: Arc<dyn DockerOperations>,
    ) -> ScriptDependencies {
        self.deps_with(backends, notifier).with_docker(Some(docker))
    }
}

impl Default for TestContext {
    fn default() -> Self {
        Self::new()
    }
}
