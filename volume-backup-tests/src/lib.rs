//! Test utilities for volume-backup
//!
//! This crate provides shared test utilities, mock implementations,
//! and helper functions for testing the backup pipeline and scheduler.
//!
//! # Quick Start
//!
//! ```rust,ignore
//! use test_utils::{ConfigBuilder, TestContext, MockStorage};
//!
//! #[tokio::test]
//! async fn my_test() {
//!     let ctx = TestContext::new();
//!     let config = ConfigBuilder::new().retention_days(7).build();
//!     let storage = MockStorage::new("S3");
//!     // ... test code
//! }
//! ```

pub mod config_builder;
pub mod fixtures;
pub mod test_context;

// Re-export commonly used items
pub use config_builder::ConfigBuilder;
pub use fixtures::*;
pub use test_context::TestContext;

// Re-export types from the main crate for convenience
pub use volume_backup::config::{
    load_from_context, BackupConfig, CompressionType, Config, ConfigError, ConfigLoader,
    ConfigStrategy, EnvContext, NotificationConfig, StorageConfig,
};
pub use volume_backup::managers::stats::Stats;

// Re-export mock implementations from the main crate
pub use volume_backup::managers::notification::mock::RecordingNotifier;
pub use volume_backup::storage::mock::MockStorage;
pub use volume_backup::storage::StorageBackend;
pub use volume_backup::utils::docker_ops::mock::{DockerCall, MockDockerOps};
pub use volume_backup::utils::docker_ops::DockerOperations;
pub use volume_backup::utils::executor::mock::{MockExecutor, MockResponse};
pub use volume_backup::utils::executor::CommandExecutor;

/// Common test result type
pub type TestResult<T = ()> = anyhow::Result<T>;
