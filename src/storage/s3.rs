//! S3 compatible object storage through the AWS CLI

use super::{
    base_name, do_prune, join_remote, select_for_pruning, Artifact, LogFn, LogLevel, PrunePolicy, PruneStats,
    StorageBackend, StorageContext, StorageError,
};
use crate::config::S3Config;
use crate::utils::command::CommandOptions;
use crate::utils::executor::CommandExecutor;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

const NAME: &str = "S3";

/// `delete-objects` accepts at most this many keys per call
const DELETE_BATCH: usize = 1000;

const UPLOAD_TIMEOUT: Duration = Duration::from_secs(6 * 60 * 60);

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ListObjectsOutput {
    #[serde(default)]
    contents: Vec<ObjectEntry>,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct ObjectEntry {
    key: String,
    last_modified: String,
}

pub struct S3Storage {
    config: S3Config,
    executor: Arc<dyn CommandExecutor>,
    log: LogFn,
    ca_bundle: Option<PathBuf>,
}

impl S3Storage {
    /// Create the backend; a configured CA certificate is written to a temporary bundle file
    pub fn new(config: S3Config, executor: Arc<dyn CommandExecutor>, log: LogFn) -> Result<Self, StorageError> {
        let ca_bundle = match config.endpoint_ca_cert.pem() {
            Some(pem) => {
                let path = std::env::temp_dir().join(format!("volume-backup-s3-ca-{}.pem", std::process::id()));
                std::fs::write(&path, pem)
                    .storage_context(NAME, || format!("error writing CA bundle {:?}", path))?;
                Some(path)
            }
            None => None,
        };

        Ok(Self {
            config,
            executor,
            log,
            ca_bundle,
        })
    }

    /// Arguments shared by every invocation
    fn global_args(&self) -> Vec<String> {
        let mut args = vec![
            "--endpoint-url".to_string(),
            format!("{}://{}", self.config.endpoint_proto, self.config.endpoint),
        ];
        if self.config.endpoint_insecure {
            args.push("--no-verify-ssl".to_string());
        }
        if let Some(bundle) = &self.ca_bundle {
            args.push("--ca-bundle".to_string());
            args.push(bundle.to_string_lossy().into_owned());
        }
        args
    }

    /// Credentials are handed over through the child environment only
    fn options(&self) -> CommandOptions {
        let mut opts = CommandOptions::new();
        if !self.config.access_key_id.is_empty() {
            opts = opts
                .env("AWS_ACCESS_KEY_ID", &self.config.access_key_id)
                .env("AWS_SECRET_ACCESS_KEY", &self.config.secret_access_key);
        }
        if !self.config.iam_role_endpoint.is_empty() {
            opts = opts.env("AWS_CONTAINER_CREDENTIALS_FULL_URI", &self.config.iam_role_endpoint);
        }
        opts
    }

    fn key_for(&self, name: &str) -> String {
        join_remote(self.config.path.trim_start_matches('/'), name)
    }

    /// Build the `aws s3 cp` invocation for `file`
    pub fn copy_args(&self, file: &Path) -> Result<(Vec<String>, String), StorageError> {
        let name = file
            .file_name()
            .ok_or_else(|| StorageError::new(NAME, format!("{:?} has no file name", file)))?
            .to_string_lossy()
            .into_owned();
        let destination = format!("s3://{}/{}", self.config.bucket_name, self.key_for(&name));

        let mut args = self.global_args();
        args.extend([
            "s3".to_string(),
            "cp".to_string(),
            "--only-show-errors".to_string(),
            file.to_string_lossy().into_owned(),
            destination.clone(),
        ]);
        if !self.config.storage_class.is_empty() {
            args.push("--storage-class".to_string());
            args.push(self.config.storage_class.clone());
        }
        Ok((args, destination))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<Artifact>, StorageError> {
        let mut args = self.global_args();
        args.extend([
            "s3api".to_string(),
            "list-objects-v2".to_string(),
            "--bucket".to_string(),
            self.config.bucket_name.clone(),
            "--prefix".to_string(),
            self.key_for(prefix),
            "--output".to_string(),
            "json".to_string(),
        ]);

        let stdout = self
            .executor
            .run_stdout("aws", &args, &self.options())
            .await
            .storage_context(NAME, || "error looking up candidates from remote storage")?;
        parse_listing(&stdout)
    }

    async fn delete(&self, keys: &[Artifact]) -> Result<(), StorageError> {
        for batch in keys.chunks(DELETE_BATCH) {
            let objects: Vec<_> = batch
                .iter()
                .map(|a| serde_json::json!({ "Key": a.name }))
                .collect();
            let payload = serde_json::json!({ "Objects": objects, "Quiet": true });

            let mut args = self.global_args();
            args.extend([
                "s3api".to_string(),
                "delete-objects".to_string(),
                "--bucket".to_string(),
                self.config.bucket_name.clone(),
                "--delete".to_string(),
                payload.to_string(),
            ]);
            self.executor
                .run("aws", &args, &self.options())
                .await
                .storage_context(NAME, || format!("error removing {} object(s)", batch.len()))?;
        }
        Ok(())
    }
}

/// Parse `list-objects-v2` JSON output; an empty bucket prints nothing at all
pub fn parse_listing(stdout: &str) -> Result<Vec<Artifact>, StorageError> {
    if stdout.trim().is_empty() {
        return Ok(Vec::new());
    }
    let output: ListObjectsOutput =
        serde_json::from_str(stdout).storage_context(NAME, || "error parsing object listing")?;

    output
        .contents
        .into_iter()
        .map(|entry| {
            let modified = DateTime::parse_from_rfc3339(&entry.last_modified)
                .storage_context(NAME, || format!("invalid LastModified for {}", entry.key))?;
            Ok(Artifact {
                name: entry.key,
                modified: modified.with_timezone(&Utc),
            })
        })
        .collect()
}

#[async_trait]
impl StorageBackend for S3Storage {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn copy(&self, file: &Path) -> Result<String, StorageError> {
        let (args, destination) = self.copy_args(file)?;
        self.executor
            .run("aws", &args, &self.options().timeout(UPLOAD_TIMEOUT))
            .await
            .storage_context(NAME, || {
                format!("error uploading backup to remote storage {}", destination)
            })?;

        (self.log)(
            LogLevel::Info,
            NAME,
            &format!("Uploaded a copy of backup `{}` to bucket `{}`.", file.display(), self.config.bucket_name),
        );
        Ok(destination)
    }

    async fn prune(&self, policy: &PrunePolicy, now: DateTime<Utc>) -> Result<PruneStats, StorageError> {
        let Some(deadline) = policy.deadline(now) else {
            return Ok(PruneStats::default());
        };

        let artifacts = self.list(&policy.prefix).await?;
        let (total, matches) = select_for_pruning(policy, now, artifacts, |a| base_name(&a.name));

        do_prune(NAME, &self.log, matches.len(), total, deadline, || self.delete(&matches)).await
    }
}

impl Drop for S3Storage {
    fn drop(&mut self) {
        if let Some(bundle) = &self.ca_bundle {
            let _ = std::fs::remove_file(bundle);
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::tracing_log;
    use crate::utils::executor::mock::{MockExecutor, MockResponse};

    fn config() -> S3Config {
        S3Config {
            bucket_name: "backups".to_string(),
            path: "daily/".to_string(),
            endpoint: "minio:9000".to_string(),
            endpoint_proto: "http".to_string(),
            access_key_id: "AKIA".to_string(),
            secret_access_key: "secret".to_string(),
            ..S3Config::default()
        }
    }

    const LISTING: &str = r#"{
        "Contents": [
            {"Key": "daily/backup-2024-01-01.tar.gz", "LastModified": "2024-01-01T02:00:00+00:00", "Size": 10},
            {"Key": "daily/backup-2024-03-01.tar.gz", "LastModified": "2024-03-01T02:00:00.000Z", "Size": 10},
            {"Key": "daily/backup-2024-03-02.tar.gz", "LastModified": "2024-03-02T02:00:00.000Z", "Size": 10}
        ]
    }"#;

    #[test]
    fn test_copy_args() {
        let storage = S3Storage::new(
            S3Config {
                storage_class: "GLACIER".to_string(),
                ..config()
            },
            Arc::new(MockExecutor::new()),
            tracing_log(),
        )
        .unwrap();

        let (args, destination) = storage.copy_args(Path::new("/tmp/backup.tar.gz")).unwrap();
        assert_eq!(destination, "s3://backups/daily/backup.tar.gz");
        let line = args.join(" ");
        assert!(line.starts_with("--endpoint-url http://minio:9000 s3 cp"));
        assert!(line.ends_with("--storage-class GLACIER"));
        assert!(!line.contains("secret"));
    }

    #[test]
    fn test_parse_listing() {
        let artifacts = parse_listing(LISTING).unwrap();
        assert_eq!(artifacts.len(), 3);
        assert_eq!(artifacts[0].name, "daily/backup-2024-01-01.tar.gz");
        assert_eq!(artifacts[1].modified.to_rfc3339(), "2024-03-01T02:00:00+00:00");

        assert!(parse_listing("").unwrap().is_empty());
        assert!(parse_listing("{}").unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_copy_passes_credentials_via_env() {
        let executor = Arc::new(MockExecutor::new());
        let storage = S3Storage::new(config(), executor.clone(), tracing_log()).unwrap();

        let location = storage.copy(Path::new("/tmp/backup.tar.gz")).await.unwrap();
        assert_eq!(location, "s3://backups/daily/backup.tar.gz");

        let calls = executor.calls_to("aws");
        assert_eq!(calls[0].env("AWS_ACCESS_KEY_ID"), Some("AKIA"));
        assert_eq!(calls[0].env("AWS_SECRET_ACCESS_KEY"), Some("secret"));
    }

    #[tokio::test]
    async fn test_prune_deletes_old_objects() {
        let executor = Arc::new(
            MockExecutor::new().expect_args("aws", "list-objects-v2", MockResponse::stdout(LISTING)),
        );
        let storage = S3Storage::new(config(), executor.clone(), tracing_log()).unwrap();
        let now = DateTime::parse_from_rfc3339("2024-03-05T00:00:00Z").unwrap().with_timezone(&Utc);
        let policy = PrunePolicy {
            retention_days: 7,
            leeway: Duration::from_secs(60),
            prefix: "backup-".to_string(),
            skip: Vec::new(),
        };

        let stats = storage.prune(&policy, now).await.unwrap();
        assert_eq!(stats, PruneStats { total: 3, pruned: 1 });

        let calls = executor.calls_to("aws");
        assert!(calls[0].command_line().contains("--prefix daily/backup-"));
        let delete = calls.iter().find(|c| c.command_line().contains("delete-objects")).unwrap();
        assert!(delete.command_line().contains("daily/backup-2024-01-01.tar.gz"));
        assert!(!delete.command_line().contains("2024-03-01"));
    }
}
