//! SSH backend using the `ssh` and `scp` clients
//!
//! Password authentication goes through `sshpass -e`, which reads the
//! password from `SSHPASS` so it never shows up in the process list.

use super::{
    do_prune, join_remote, select_for_pruning, Artifact, LogFn, LogLevel, PrunePolicy, PruneStats, StorageBackend,
    StorageContext, StorageError,
};
use crate::config::{expand_tilde, SshConfig};
use crate::utils::command::CommandOptions;
use crate::utils::executor::CommandExecutor;
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;

const NAME: &str = "SSH";

const UPLOAD_TIMEOUT: Duration = Duration::from_secs(6 * 60 * 60);

pub struct SshStorage {
    config: SshConfig,
    executor: Arc<dyn CommandExecutor>,
    log: LogFn,
    use_identity: bool,
}

impl SshStorage {
    pub fn new(config: SshConfig, executor: Arc<dyn CommandExecutor>, log: LogFn) -> Self {
        let identity = expand_tilde(&config.identity_file);
        let use_identity = identity.is_file();
        if use_identity && !config.identity_passphrase.is_empty() {
            log(
                LogLevel::Warning,
                NAME,
                "Identity file passphrases cannot be supplied non-interactively, load the key into an agent instead.",
            );
        }

        Self {
            config: SshConfig {
                identity_file: identity,
                ..config
            },
            executor,
            log,
            use_identity,
        }
    }

    fn destination(&self) -> String {
        format!("{}@{}", self.config.user, self.config.host_name)
    }

    /// Options shared by `ssh` and `scp`; the port flag differs between them
    fn common_args(&self, port_flag: &str) -> Vec<String> {
        let mut args = vec![
            port_flag.to_string(),
            self.config.port.clone(),
            "-o".to_string(),
            "StrictHostKeyChecking=accept-new".to_string(),
        ];
        if self.config.password.is_empty() {
            args.push("-o".to_string());
            args.push("BatchMode=yes".to_string());
        }
        if self.use_identity {
            args.push("-i".to_string());
            args.push(self.config.identity_file.to_string_lossy().into_owned());
        }
        args
    }

    /// Wrap the invocation in `sshpass` when password authentication is configured
    fn program(&self, tool: &str, args: Vec<String>) -> (String, Vec<String>, CommandOptions) {
        if self.config.password.is_empty() {
            return (tool.to_string(), args, CommandOptions::new());
        }
        let mut wrapped = vec!["-e".to_string(), tool.to_string()];
        wrapped.extend(args);
        (
            "sshpass".to_string(),
            wrapped,
            CommandOptions::new().env("SSHPASS", &self.config.password),
        )
    }

    /// Command line for uploading `file`, plus the remote location
    pub fn copy_command(&self, file: &Path) -> Result<(String, Vec<String>, CommandOptions, String), StorageError> {
        let name = file
            .file_name()
            .ok_or_else(|| StorageError::new(NAME, format!("{:?} has no file name", file)))?
            .to_string_lossy()
            .into_owned();
        let remote = join_remote(&self.config.remote_path, &name);
        let location = format!("{}:{}", self.destination(), remote);

        let mut args = self.common_args("-P");
        args.push("-q".to_string());
        args.push(file.to_string_lossy().into_owned());
        args.push(location.clone());

        let (program, args, opts) = self.program("scp", args);
        Ok((program, args, opts, location))
    }

    fn remote_command(&self, command: String) -> (String, Vec<String>, CommandOptions) {
        let mut args = self.common_args("-p");
        args.push(self.destination());
        args.push(command);
        self.program("ssh", args)
    }

    async fn list(&self, prefix: &str) -> Result<Vec<Artifact>, StorageError> {
        let dir = if self.config.remote_path.is_empty() {
            ".".to_string()
        } else {
            self.config.remote_path.clone()
        };
        let command = format!(
            "find {} -maxdepth 1 -type f -name {} -printf '%T@ %p\\n'",
            shell_quote(&dir),
            shell_quote(&format!("{}*", prefix))
        );
        let (program, args, opts) = self.remote_command(command);

        let stdout = self
            .executor
            .run_stdout(&program, &args, &opts)
            .await
            .storage_context(NAME, || "error reading directory listing")?;
        parse_listing(&stdout)
    }
}

/// Parse `find -printf '%T@ %p\n'` output
pub fn parse_listing(stdout: &str) -> Result<Vec<Artifact>, StorageError> {
    stdout
        .lines()
        .filter(|line| !line.trim().is_empty())
        .map(|line| {
            let (stamp, path) = line
                .split_once(' ')
                .ok_or_else(|| StorageError::new(NAME, format!("malformed listing line `{}`", line)))?;
            let (secs, fraction) = stamp.split_once('.').unwrap_or((stamp, "0"));
            let secs: i64 = secs
                .parse()
                .storage_context(NAME, || format!("malformed timestamp `{}`", stamp))?;
            let nanos = format!("{:0<9}", fraction)
                .get(..9)
                .and_then(|n| n.parse::<u32>().ok())
                .unwrap_or(0);
            let modified = Utc
                .timestamp_opt(secs, nanos)
                .single()
                .ok_or_else(|| StorageError::new(NAME, format!("timestamp out of range `{}`", stamp)))?;

            Ok(Artifact {
                name: path.to_string(),
                modified,
            })
        })
        .collect()
}

/// Single-quote a value for the remote shell
fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

#[async_trait]
impl StorageBackend for SshStorage {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn copy(&self, file: &Path) -> Result<String, StorageError> {
        let (program, args, opts, location) = self.copy_command(file)?;
        self.executor
            .run(&program, &args, &opts.timeout(UPLOAD_TIMEOUT))
            .await
            .storage_context(NAME, || format!("error copying backup to {}", location))?;

        (self.log)(
            LogLevel::Info,
            NAME,
            &format!(
                "Uploaded a copy of backup `{}` to '{}' at path '{}'.",
                file.display(),
                self.config.host_name,
                self.config.remote_path
            ),
        );
        Ok(location)
    }

    async fn prune(&self, policy: &PrunePolicy, now: DateTime<Utc>) -> Result<PruneStats, StorageError> {
        let Some(deadline) = policy.deadline(now) else {
            return Ok(PruneStats::default());
        };

        let artifacts = self.list(&policy.prefix).await?;
        let (total, matches) = select_for_pruning(policy, now, artifacts, |a| super::base_name(&a.name));

        do_prune(NAME, &self.log, matches.len(), total, deadline, || async {
            let paths: Vec<String> = matches.iter().map(|a| shell_quote(&a.name)).collect();
            let (program, args, opts) = self.remote_command(format!("rm -f -- {}", paths.join(" ")));
            self.executor
                .run(&program, &args, &opts)
                .await
                .storage_context(NAME, || format!("error removing {} file(s)", matches.len()))?;
            Ok(())
        })
        .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::tracing_log;
    use crate::utils::executor::mock::{MockExecutor, MockResponse};

    fn config() -> SshConfig {
        SshConfig {
            host_name: "storage.example.com".to_string(),
            user: "backup".to_string(),
            remote_path: "/srv/backups".to_string(),
            identity_file: "/nonexistent/id_rsa".into(),
            ..SshConfig::default()
        }
    }

    #[test]
    fn test_copy_command_with_keys() {
        let storage = SshStorage::new(config(), Arc::new(MockExecutor::new()), tracing_log());
        let (program, args, opts, location) = storage.copy_command(Path::new("/tmp/backup.tar.gz")).unwrap();

        assert_eq!(program, "scp");
        assert_eq!(location, "backup@storage.example.com:/srv/backups/backup.tar.gz");
        assert_eq!(args[..2], ["-P".to_string(), "22".to_string()]);
        assert!(args.contains(&"BatchMode=yes".to_string()));
        assert!(opts.envs.is_empty());
    }

    #[test]
    fn test_copy_command_with_password() {
        let storage = SshStorage::new(
            SshConfig {
                password: "hunter2".to_string(),
                ..config()
            },
            Arc::new(MockExecutor::new()),
            tracing_log(),
        );
        let (program, args, opts, _) = storage.copy_command(Path::new("/tmp/backup.tar.gz")).unwrap();

        assert_eq!(program, "sshpass");
        assert_eq!(args[..2], ["-e".to_string(), "scp".to_string()]);
        assert!(!args.iter().any(|a| a.contains("hunter2")));
        assert_eq!(opts.envs, vec![("SSHPASS".to_string(), "hunter2".to_string())]);
    }

    #[test]
    fn test_parse_listing() {
        let out = "1704074400.1234567890 /srv/backups/backup-a.tar.gz\n1709251200.0000000000 /srv/backups/backup b.tar.gz\n";
        let artifacts = parse_listing(out).unwrap();

        assert_eq!(artifacts.len(), 2);
        assert_eq!(artifacts[0].modified.timestamp(), 1704074400);
        assert_eq!(artifacts[0].modified.timestamp_subsec_nanos(), 123456789);
        assert_eq!(artifacts[1].name, "/srv/backups/backup b.tar.gz");
        assert!(parse_listing("garbage").is_err());
    }

    #[test]
    fn test_shell_quote() {
        assert_eq!(shell_quote("plain"), "'plain'");
        assert_eq!(shell_quote("it's"), r"'it'\''s'");
    }

    #[tokio::test]
    async fn test_prune_removes_matches_remotely() {
        let listing = "1000.0 /srv/backups/backup-old.tar.gz\n4102444800.0 /srv/backups/backup-new.tar.gz\n";
        let executor = Arc::new(MockExecutor::new().expect_args("ssh", "find", MockResponse::stdout(listing)));
        let storage = SshStorage::new(config(), executor.clone(), tracing_log());
        let policy = PrunePolicy {
            retention_days: 1,
            leeway: Duration::from_secs(60),
            prefix: "backup-".to_string(),
            skip: Vec::new(),
        };

        let stats = storage.prune(&policy, Utc::now()).await.unwrap();
        assert_eq!(stats, PruneStats { total: 2, pruned: 1 });

        let calls = executor.calls_to("ssh");
        assert_eq!(calls.len(), 2);
        let rm = calls[1].args.last().unwrap();
        assert_eq!(rm, "rm -f -- '/srv/backups/backup-old.tar.gz'");
    }
}
