//! Azure Blob Storage through the `az` CLI

use super::{
    base_name, do_prune, join_remote, select_for_pruning, Artifact, LogFn, LogLevel, PrunePolicy, PruneStats,
    StorageBackend, StorageContext, StorageError,
};
use crate::config::AzureConfig;
use crate::utils::command::CommandOptions;
use crate::utils::executor::CommandExecutor;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

const NAME: &str = "Azure";

const UPLOAD_TIMEOUT: Duration = Duration::from_secs(6 * 60 * 60);

#[derive(Debug, Deserialize)]
struct BlobEntry {
    name: String,
    properties: BlobProperties,
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct BlobProperties {
    last_modified: String,
}

pub struct AzureStorage {
    config: AzureConfig,
    executor: Arc<dyn CommandExecutor>,
    log: LogFn,
}

impl AzureStorage {
    pub fn new(config: AzureConfig, executor: Arc<dyn CommandExecutor>, log: LogFn) -> Self {
        Self { config, executor, log }
    }

    /// Blob endpoint with the account name filled in
    pub fn endpoint(&self) -> String {
        self.config
            .endpoint
            .replace("{{ .AccountName }}", &self.config.account_name)
            .replace("{{.AccountName}}", &self.config.account_name)
    }

    /// Authentication arguments; secrets travel in the child environment
    fn auth(&self) -> (Vec<String>, CommandOptions) {
        let opts = CommandOptions::new();
        if !self.config.connection_string.is_empty() {
            return (
                Vec::new(),
                opts.env("AZURE_STORAGE_CONNECTION_STRING", &self.config.connection_string),
            );
        }

        let mut args = vec![
            "--account-name".to_string(),
            self.config.account_name.clone(),
            "--blob-endpoint".to_string(),
            self.endpoint(),
        ];
        if self.config.primary_account_key.is_empty() {
            args.push("--auth-mode".to_string());
            args.push("login".to_string());
            (args, opts)
        } else {
            (args, opts.env("AZURE_STORAGE_KEY", &self.config.primary_account_key))
        }
    }

    fn blob_name(&self, name: &str) -> String {
        join_remote(self.config.path.trim_matches('/'), name)
    }

    /// `az storage blob upload` invocation for `file`
    pub fn upload_args(&self, file: &Path) -> Result<(Vec<String>, CommandOptions, String), StorageError> {
        let name = file
            .file_name()
            .ok_or_else(|| StorageError::new(NAME, format!("{:?} has no file name", file)))?
            .to_string_lossy()
            .into_owned();
        let blob = self.blob_name(&name);

        let (auth, opts) = self.auth();
        let mut args = vec![
            "storage".to_string(),
            "blob".to_string(),
            "upload".to_string(),
            "--container-name".to_string(),
            self.config.container_name.clone(),
            "--name".to_string(),
            blob.clone(),
            "--file".to_string(),
            file.to_string_lossy().into_owned(),
            "--overwrite".to_string(),
            "--only-show-errors".to_string(),
        ];
        args.extend(auth);
        Ok((args, opts, format!("{}/{}", self.config.container_name, blob)))
    }

    async fn list(&self, prefix: &str) -> Result<Vec<Artifact>, StorageError> {
        let (auth, opts) = self.auth();
        let mut args = vec![
            "storage".to_string(),
            "blob".to_string(),
            "list".to_string(),
            "--container-name".to_string(),
            self.config.container_name.clone(),
            "--prefix".to_string(),
            self.blob_name(prefix),
            "--num-results".to_string(),
            "*".to_string(),
            "--output".to_string(),
            "json".to_string(),
            "--only-show-errors".to_string(),
        ];
        args.extend(auth);

        let stdout = self
            .executor
            .run_stdout("az", &args, &opts)
            .await
            .storage_context(NAME, || "error enumerating blobs")?;
        parse_listing(&stdout)
    }

    async fn delete(&self, blobs: &[Artifact]) -> Result<(), StorageError> {
        let mut failures = Vec::new();
        for blob in blobs {
            let (auth, opts) = self.auth();
            let mut args = vec![
                "storage".to_string(),
                "blob".to_string(),
                "delete".to_string(),
                "--container-name".to_string(),
                self.config.container_name.clone(),
                "--name".to_string(),
                blob.name.clone(),
                "--only-show-errors".to_string(),
            ];
            args.extend(auth);
            if let Err(e) = self.executor.run("az", &args, &opts).await {
                failures.push(format!("{}: {:#}", blob.name, e));
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            Err(StorageError::new(
                NAME,
                format!("{} error(s) deleting blobs: {}", failures.len(), failures.join(", ")),
            ))
        }
    }
}

/// Parse `az storage blob list --output json`
pub fn parse_listing(stdout: &str) -> Result<Vec<Artifact>, StorageError> {
    if stdout.trim().is_empty() {
        return Ok(Vec::new());
    }
    let entries: Vec<BlobEntry> =
        serde_json::from_str(stdout).storage_context(NAME, || "error parsing blob listing")?;

    entries
        .into_iter()
        .map(|entry| {
            let modified = DateTime::parse_from_rfc3339(&entry.properties.last_modified)
                .storage_context(NAME, || format!("invalid lastModified for {}", entry.name))?;
            Ok(Artifact {
                name: entry.name,
                modified: modified.with_timezone(&Utc),
            })
        })
        .collect()
}

#[async_trait]
impl StorageBackend for AzureStorage {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn copy(&self, file: &Path) -> Result<String, StorageError> {
        let (args, opts, location) = self.upload_args(file)?;
        self.executor
            .run("az", &args, &opts.timeout(UPLOAD_TIMEOUT))
            .await
            .storage_context(NAME, || format!("error uploading file {:?}", file))?;

        (self.log)(
            LogLevel::Info,
            NAME,
            &format!(
                "Uploaded a copy of backup `{}` to container `{}`.",
                file.display(),
                self.config.container_name
            ),
        );
        Ok(location)
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

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::tracing_log;
    use crate::utils::executor::mock::{MockExecutor, MockResponse};

    fn config() -> AzureConfig {
        AzureConfig {
            account_name: "acme".to_string(),
            primary_account_key: "s3cr3t".to_string(),
            container_name: "backups".to_string(),
            path: "/nightly/".to_string(),
            ..AzureConfig::default()
        }
    }

    #[test]
    fn test_endpoint_template() {
        let storage = AzureStorage::new(config(), Arc::new(MockExecutor::new()), tracing_log());
        assert_eq!(storage.endpoint(), "https://acme.blob.core.windows.net/");
    }

    #[test]
    fn test_upload_args_with_account_key() {
        let storage = AzureStorage::new(config(), Arc::new(MockExecutor::new()), tracing_log());
        let (args, opts, location) = storage.upload_args(Path::new("/tmp/backup.tar.gz")).unwrap();

        assert_eq!(location, "backups/nightly/backup.tar.gz");
        let line = args.join(" ");
        assert!(line.contains("--name nightly/backup.tar.gz"));
        assert!(line.contains("--account-name acme"));
        assert!(!line.contains("s3cr3t"));
        assert_eq!(opts.envs, vec![("AZURE_STORAGE_KEY".to_string(), "s3cr3t".to_string())]);
    }

    #[test]
    fn test_upload_args_with_connection_string() {
        let storage = AzureStorage::new(
            AzureConfig {
                connection_string: "DefaultEndpointsProtocol=https;AccountName=acme".to_string(),
                ..config()
            },
            Arc::new(MockExecutor::new()),
            tracing_log(),
        );
        let (args, opts, _) = storage.upload_args(Path::new("/tmp/backup.tar.gz")).unwrap();

        assert!(!args.contains(&"--account-name".to_string()));
        assert_eq!(opts.envs[0].0, "AZURE_STORAGE_CONNECTION_STRING");
    }

    #[test]
    fn test_managed_identity_uses_login() {
        let storage = AzureStorage::new(
            AzureConfig {
                primary_account_key: String::new(),
                ..config()
            },
            Arc::new(MockExecutor::new()),
            tracing_log(),
        );
        let (args, _, _) = storage.upload_args(Path::new("/tmp/backup.tar.gz")).unwrap();
        assert!(args.join(" ").contains("--auth-mode login"));
    }

    #[tokio::test]
    async fn test_prune_parses_listing() {
        let listing = r#"[
            {"name": "nightly/backup-1.tar.gz", "properties": {"lastModified": "2020-01-01T00:00:00+00:00"}},
            {"name": "nightly/backup-2.tar.gz", "properties": {"lastModified": "2999-01-01T00:00:00+00:00"}}
        ]"#;
        let executor = Arc::new(MockExecutor::new().expect_args("az", "list", MockResponse::stdout(listing)));
        let storage = AzureStorage::new(config(), executor.clone(), tracing_log());
        let policy = PrunePolicy {
            retention_days: 30,
            leeway: Duration::from_secs(60),
            prefix: "backup-".to_string(),
            skip: Vec::new(),
        };

        let stats = storage.prune(&policy, Utc::now()).await.unwrap();
        assert_eq!(stats, PruneStats { total: 2, pruned: 1 });

        let deletes: Vec<_> = executor
            .calls_to("az")
            .into_iter()
            .filter(|c| c.args[2] == "delete")
            .collect();
        assert_eq!(deletes.len(), 1);
        assert!(deletes[0].command_line().contains("--name nightly/backup-1.tar.gz"));
    }
}
