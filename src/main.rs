use anyhow::Result;
use clap::Parser;
use std::sync::Arc;
use tracing::{error, warn};
use volume_backup::config::{ConfigLoader, SOURCE_FROM_ENVIRONMENT};
use volume_backup::managers::logging::{self, LogGuard, LoggingConfig};
use volume_backup::managers::scheduler::{ForegroundOptions, Scheduler, ScriptRunner};
use volume_backup::managers::script::ScriptDependencies;

#[derive(Parser)]
#[command(name = "backup")]
#[command(about = "Back up docker volumes to remote storage on a schedule", long_about = None)]
#[command(version)]
struct Cli {
    /// Run in the foreground, scheduling every configured backup
    #[arg(long)]
    foreground: bool,

    /// Source of the backup to execute when not running in the foreground
    #[arg(long, default_value = SOURCE_FROM_ENVIRONMENT)]
    source: String,

    /// Log runtime metrics periodically on the given cron expression
    #[arg(long)]
    profile: Option<String>,
}

#[tokio::main]
async fn main() {
    let cli = Cli::parse();

    // Keep the guard alive so buffered file logs are flushed
    let log_guard = match logging::init_logging(&LoggingConfig::from_env()) {
        Ok(guard) => Some(guard),
        Err(e) => {
            logging::init_console_logging();
            warn!("Falling back to console logging: {:#}", e);
            None
        }
    };

    must(run(cli).await, log_guard);
}

async fn run(cli: Cli) -> Result<()> {
    let deps = ScriptDependencies::detect();

    let mut loader = ConfigLoader::new();
    if let Some(docker) = &deps.docker {
        loader = loader.with_docker(docker.clone());
    }

    let scheduler = Scheduler::new(Arc::new(loader), Arc::new(ScriptRunner::new(deps)));
    if cli.foreground {
        scheduler
            .run_in_foreground(ForegroundOptions { profile: cli.profile })
            .await
    } else {
        scheduler.run_as_command(&cli.source).await
    }
}

/// The only place the process exits with a failure
fn must(result: Result<()>, log_guard: Option<LogGuard>) {
    if let Err(e) = result {
        error!(error = ?e, "Fatal error running command: {:#}", e);
        drop(log_guard);
        std::process::exit(1);
    }
}
