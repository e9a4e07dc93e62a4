//! Unit tests for configuration sourcing
//!
//! These tests exercise the loader through fixed base environments, so
//! nothing here reads the live process environment.

use rstest::rstest;
use std::sync::Arc;
use test_utils::{labeled_volume, ConfigBuilder, ConfigError, ConfigLoader, ConfigStrategy, EnvContext, MockDockerOps, TestContext};
use volume_backup::config::CompressionType;

#[test]
fn test_builder_defaults() {
    let config = ConfigBuilder::new().build();

    assert_eq!(config.source, "from environment");
    assert_eq!(config.backup.cron_expression, "@daily");
    assert_eq!(config.backup.retention_days, -1);
    assert_eq!(config.backup.compression, CompressionType::Gz);
    assert_eq!(config.notification.level, "error");
    assert!(config.storage.aws.is_none());
}

#[rstest]
#[case("BACKUP_CRON_EXPRESSION")]
#[case("OFFEN_BACKUP_CRONEXPRESSION")]
fn test_legacy_and_canonical_names_agree(#[case] key: &str) {
    let config = ConfigBuilder::new()
        .unset("OFFEN_BACKUP_CRONEXPRESSION")
        .var(key, "0 3 * * *")
        .build();

    assert_eq!(config.backup.cron_expression, "0 3 * * *");
    assert_eq!(config.env.get("OFFEN_BACKUP_CRONEXPRESSION"), Some("0 3 * * *"));
    assert!(!config.env.contains("BACKUP_CRON_EXPRESSION"));
}

#[test]
fn test_legacy_conflict_is_rejected() {
    let err = ConfigBuilder::new()
        .var("BACKUP_RETENTION_DAYS", "7")
        .retention_days(3)
        .try_build()
        .unwrap_err();

    assert!(matches!(err, ConfigError::Conflict { .. }));
    assert!(err.to_string().contains("OFFEN_BACKUP_RETENTIONDAYS"));
}

#[test]
fn test_file_indirection_reads_secret() {
    let ctx = TestContext::new();
    let secret = ctx.create_file("secrets/gpg", "hunter2");

    let config = ConfigBuilder::new()
        .var("GPG_PASSPHRASE_FILE", &secret.display().to_string())
        .build();

    assert_eq!(config.backup.gpg_passphrase, "hunter2");
    assert!(!config.env.contains("FILE__OFFEN_BACKUP_GPGPASSPHRASE"));
}

#[test]
fn test_file_indirection_missing_file() {
    let err = ConfigBuilder::new()
        .var("FILE__OFFEN_BACKUP_GPGPASSPHRASE", "/nonexistent/secret")
        .try_build()
        .unwrap_err();

    assert!(matches!(err, ConfigError::FileRead { .. }));
}

#[test]
fn test_decode_error_names_key() {
    let err = ConfigBuilder::new()
        .var("OFFEN_BACKUP_COMPRESSION", "brotli")
        .try_build()
        .unwrap_err();

    assert!(err.to_string().contains("OFFEN_BACKUP_COMPRESSION"));
}

#[test]
fn test_storage_enabled_by_any_key() {
    let config = ConfigBuilder::new()
        .var("AWS_S3_BUCKET_NAME", "backups")
        .var("OFFEN_STORAGE_DROPBOX_REFRESHTOKEN", "token")
        .build();

    assert_eq!(config.storage.aws.map(|s| s.bucket_name).as_deref(), Some("backups"));
    assert!(config.storage.dropbox.is_some());
    assert!(config.storage.webdav.is_none());
}

#[tokio::test]
async fn test_confd_yields_one_config_per_file() {
    let ctx = TestContext::new();
    let dir = ctx.confd_dir();
    ConfigBuilder::new().cron("0 1 * * *").write_dotenv(&dir, "01_app.env");
    ConfigBuilder::new()
        .cron("0 2 * * *")
        .var("BACKUP_FILENAME", "db-%Y.tar.gz")
        .write_dotenv(&dir, "02_db.env");

    let loader = ConfigLoader::new()
        .with_confd_dir(&dir)
        .with_base_env(EnvContext::from_pairs([("HOSTNAME", "box")]));
    let configs = loader.load(ConfigStrategy::Confd).await.unwrap();

    assert_eq!(configs.len(), 2);
    assert_eq!(configs[0].backup.cron_expression, "0 1 * * *");
    assert_eq!(configs[1].backup.filename, "db-%Y.tar.gz");
    assert!(configs[1].source.ends_with("02_db.env"));
}

#[tokio::test]
async fn test_confd_files_do_not_leak_into_each_other() {
    let ctx = TestContext::new();
    let dir = ctx.confd_dir();
    ConfigBuilder::new().retention_days(7).write_dotenv(&dir, "a.env");
    ConfigBuilder::new().write_dotenv(&dir, "b.env");

    let loader = ConfigLoader::new().with_confd_dir(&dir).with_base_env(EnvContext::new());
    let configs = loader.load(ConfigStrategy::Confd).await.unwrap();

    assert_eq!(configs[0].backup.retention_days, 7);
    assert_eq!(configs[1].backup.retention_days, -1);
}

#[tokio::test]
async fn test_env_strategy_without_variables() {
    let loader = ConfigLoader::new().with_base_env(EnvContext::from_pairs([("HOME", "/root")]));
    let err = loader.load(ConfigStrategy::Env).await.unwrap_err();
    assert!(matches!(err, ConfigError::NoEnvironment));
}

#[tokio::test]
async fn test_label_strategy_reads_volume_labels() {
    let docker = MockDockerOps::new().with_volumes(vec![
        labeled_volume("app_data", &[("OFFEN_BACKUP_CRONEXPRESSION", "@hourly")]),
        labeled_volume("db_data", &[("BACKUP_RETENTION_DAYS", "14")]),
    ]);

    let loader = ConfigLoader::new()
        .with_base_env(EnvContext::new())
        .with_docker(Arc::new(docker));
    let configs = loader.load(ConfigStrategy::Label).await.unwrap();

    assert_eq!(configs.len(), 2);
    assert_eq!(configs[0].source, "app_data");
    assert_eq!(configs[0].backup.cron_expression, "@hourly");
    assert_eq!(configs[1].backup.retention_days, 14);
}
