// Integration tests for sourcing configuration from the process environment

use serial_test::serial;
use std::env;
use std::fs;
use tempfile::TempDir;
use volume_backup::config::{ConfigError, ConfigLoader, ConfigStrategy};

/// Sets process variables for the duration of a test and removes them afterwards
struct EnvGuard {
    keys: Vec<String>,
}

impl EnvGuard {
    fn set(pairs: &[(&str, &str)]) -> Self {
        for (key, value) in pairs {
            env::set_var(key, value);
        }
        Self {
            keys: pairs.iter().map(|(k, _)| k.to_string()).collect(),
        }
    }
}

impl Drop for EnvGuard {
    fn drop(&mut self) {
        for key in &self.keys {
            env::remove_var(key);
        }
    }
}

#[tokio::test]
#[serial]
async fn test_env_strategy_reads_process_environment() {
    let _env = EnvGuard::set(&[
        ("BACKUP_CRON_EXPRESSION", "0 4 * * *"),
        ("OFFEN_BACKUP_RETENTIONDAYS", "5"),
    ]);

    let configs = ConfigLoader::new().load(ConfigStrategy::Env).await.unwrap();

    assert_eq!(configs.len(), 1);
    assert_eq!(configs[0].source, "from environment");
    assert_eq!(configs[0].backup.cron_expression, "0 4 * * *");
    assert_eq!(configs[0].backup.retention_days, 5);
}

#[tokio::test]
#[serial]
async fn test_process_environment_is_left_untouched() {
    let temp_dir = TempDir::new().unwrap();
    let secret = temp_dir.path().join("passphrase");
    fs::write(&secret, "secret").unwrap();
    let secret = secret.display().to_string();
    let _env = EnvGuard::set(&[
        ("BACKUP_RETENTION_DAYS", "3"),
        ("GPG_PASSPHRASE_FILE", secret.as_str()),
    ]);

    let config = ConfigLoader::new().load_env().unwrap();

    assert_eq!(config.backup.gpg_passphrase, "secret");
    assert_eq!(env::var("BACKUP_RETENTION_DAYS").as_deref(), Ok("3"));
    assert!(env::var("OFFEN_BACKUP_RETENTIONDAYS").is_err());
    assert!(env::var("OFFEN_BACKUP_GPGPASSPHRASE").is_err());
}

#[tokio::test]
#[serial]
async fn test_confd_files_override_process_environment() {
    let temp_dir = TempDir::new().unwrap();
    fs::write(
        temp_dir.path().join("job.env"),
        "OFFEN_BACKUP_CRONEXPRESSION=\"@hourly\"\nOFFEN_BACKUP_PRUNINGPREFIX=\"${PREFIX_FROM_ENV}-\"\n",
    )
    .unwrap();
    let _env = EnvGuard::set(&[
        ("OFFEN_BACKUP_CRONEXPRESSION", "@daily"),
        ("PREFIX_FROM_ENV", "nightly"),
    ]);

    let configs = ConfigLoader::new()
        .with_confd_dir(temp_dir.path())
        .load(ConfigStrategy::Confd)
        .await
        .unwrap();

    assert_eq!(configs.len(), 1);
    assert_eq!(configs[0].backup.cron_expression, "@hourly");
    assert_eq!(configs[0].backup.pruning_prefix, "nightly-");
}

#[tokio::test]
#[serial]
async fn test_conflicting_process_variables() {
    let _env = EnvGuard::set(&[
        ("BACKUP_ARCHIVE", "/archive"),
        ("OFFEN_BACKUP_ARCHIVE", "/other"),
    ]);

    let err = ConfigLoader::new().load_env().unwrap_err();

    assert!(matches!(err, ConfigError::Conflict { .. }));
    assert_eq!(env::var("BACKUP_ARCHIVE").as_deref(), Ok("/archive"));
}
