//! Utilities for running external tools with proper error handling and timeouts

use anyhow::{Context, Result};
use std::path::PathBuf;
use std::process::{Output, Stdio};
use std::time::Duration;
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::{debug, error};

/// Per-invocation settings for an external command
#[derive(Debug, Clone, Default)]
pub struct CommandOptions {
    pub working_dir: Option<PathBuf>,
    pub timeout: Option<Duration>,
    /// Additional environment for the child process
    pub envs: Vec<(String, String)>,
    /// Bytes written to the child's stdin
    pub stdin: Option<Vec<u8>>,
}

impl CommandOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    pub fn working_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.working_dir = Some(dir.into());
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }

    pub fn stdin(mut self, input: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(input.into());
        self
    }
}

/// Run a command, failing on a non-zero exit status
pub async fn run_command(program: &str, args: &[String], opts: &CommandOptions) -> Result<Output> {
    let mut cmd = Command::new(program);
    cmd.args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .stdin(if opts.stdin.is_some() {
            Stdio::piped()
        } else {
            Stdio::null()
        })
        .kill_on_drop(true);

    if let Some(dir) = &opts.working_dir {
        cmd.current_dir(dir);
    }
    for (key, value) in &opts.envs {
        cmd.env(key, value);
    }

    debug!("Running command: {} {}", program, args.join(" "));

    let mut child = cmd
        .spawn()
        .with_context(|| format!("Failed to execute {}", program))?;

    if let Some(input) = &opts.stdin {
        if let Some(mut stdin) = child.stdin.take() {
            stdin
                .write_all(input)
                .await
                .with_context(|| format!("Failed to write to stdin of {}", program))?;
        }
    }

    let output = match opts.timeout {
        Some(timeout) => tokio::time::timeout(timeout, child.wait_with_output())
            .await
            .map_err(|_| anyhow::anyhow!("{} timed out after {:?}", program, timeout))?,
        None => child.wait_with_output().await,
    }
    .with_context(|| format!("Failed to execute {}", program))?;

    if !output.status.success() {
        let stderr = String::from_utf8_lossy(&output.stderr);
        error!("Command failed: {} {}", program, args.join(" "));
        anyhow::bail!(
            "{} failed with exit code {:?}: {}",
            program,
            output.status.code(),
            stderr.trim()
        );
    }

    Ok(output)
}

/// Whether a program can be found on PATH
pub fn is_available(program: &str) -> bool {
    which::which(program).is_ok()
}
