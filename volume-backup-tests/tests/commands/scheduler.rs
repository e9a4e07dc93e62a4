//! Tests for scheduling and one-off runs
//!
//! The real configuration loader is used with a temp conf.d directory; the
//! runner records which configurations it was asked to run.

use async_trait::async_trait;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use test_utils::{labeled_volume, Config, ConfigBuilder, ConfigLoader, ConfigStrategy, EnvContext, MockDockerOps, TestContext};
use volume_backup::managers::scheduler::{BackupRunner, ForegroundOptions};
use volume_backup::{Scheduler, ScriptRunner};

#[derive(Default)]
struct RecordingRunner {
    runs: Mutex<Vec<(String, &'static str)>>,
}

impl RecordingRunner {
    fn runs(&self) -> Vec<(String, &'static str)> {
        self.runs.lock().clone()
    }
}

#[async_trait]
impl BackupRunner for RecordingRunner {
    async fn run_script(&self, config: &Config) -> anyhow::Result<()> {
        self.runs.lock().push((config.source.clone(), "script"));
        Ok(())
    }

    async fn run_proxy(&self, config: &Config) -> anyhow::Result<()> {
        self.runs.lock().push((config.source.clone(), "proxy"));
        Ok(())
    }
}

fn loader(ctx: &TestContext, base: EnvContext) -> ConfigLoader {
    ConfigLoader::new().with_confd_dir(ctx.confd_dir()).with_base_env(base)
}

#[tokio::test]
async fn test_confd_reload_tracks_file_changes() {
    let ctx = TestContext::new();
    let dir = ctx.confd_dir();
    ConfigBuilder::new().cron("0 1 * * *").write_dotenv(&dir, "a.env");
    let removed = ConfigBuilder::new().cron("0 2 * * *").write_dotenv(&dir, "b.env");

    let scheduler = Scheduler::new(
        Arc::new(loader(&ctx, EnvContext::new())),
        Arc::new(RecordingRunner::default()),
    );
    scheduler.reload(ConfigStrategy::Confd).await.unwrap();
    assert_eq!(scheduler.entries(ConfigStrategy::Confd).len(), 2);

    std::fs::remove_file(removed).unwrap();
    scheduler.reload(ConfigStrategy::Confd).await.unwrap();

    assert_eq!(scheduler.entries(ConfigStrategy::Confd).len(), 1);
    assert_eq!(scheduler.expressions(), vec!["0 1 * * *"]);
}

#[tokio::test]
async fn test_missing_confd_dir_without_environment_schedules_nothing() {
    let ctx = TestContext::new();
    let scheduler = Scheduler::new(
        Arc::new(loader(&ctx, EnvContext::from_pairs([("HOME", "/root")]))),
        Arc::new(RecordingRunner::default()),
    );

    scheduler.reload(ConfigStrategy::Confd).await.unwrap();

    assert!(scheduler.expressions().is_empty());
}

#[tokio::test]
async fn test_invalid_confd_file_fails_reload() {
    let ctx = TestContext::new();
    ConfigBuilder::new()
        .var("OFFEN_BACKUP_RETENTIONDAYS", "seven")
        .write_dotenv(&ctx.confd_dir(), "broken.env");

    let scheduler = Scheduler::new(
        Arc::new(loader(&ctx, EnvContext::new())),
        Arc::new(RecordingRunner::default()),
    );
    let err = scheduler.reload(ConfigStrategy::Confd).await.unwrap_err();

    assert!(format!("{:#}", err).contains("OFFEN_BACKUP_RETENTIONDAYS"));
}

#[tokio::test]
async fn test_run_as_command_routes_by_strategy() {
    let ctx = TestContext::new();
    let confd = ConfigBuilder::new().write_dotenv(&ctx.confd_dir(), "app.env");
    let docker = MockDockerOps::new().with_volumes(vec![labeled_volume(
        "db_data",
        &[("OFFEN_BACKUP_CRONEXPRESSION", "@hourly")],
    )]);
    let runner = Arc::new(RecordingRunner::default());
    let scheduler = Scheduler::new(
        Arc::new(loader(&ctx, EnvContext::new()).with_docker(Arc::new(docker))),
        runner.clone(),
    );

    scheduler.run_as_command("db_data").await.unwrap();
    scheduler.run_as_command(&confd.display().to_string()).await.unwrap();
    scheduler.run_as_command("unknown").await.unwrap();

    assert_eq!(
        runner.runs(),
        vec![
            ("db_data".to_string(), "proxy"),
            (confd.display().to_string(), "script"),
        ]
    );
}

#[tokio::test]
async fn test_run_as_command_executes_pipeline() {
    let ctx = TestContext::new();
    let confd = ConfigBuilder::new()
        .archive(&ctx.archive_dir())
        .filename("nightly.{{ .Extension }}")
        .write_dotenv(&ctx.confd_dir(), "nightly.env");

    let scheduler = Scheduler::new(
        Arc::new(loader(&ctx, EnvContext::new())),
        Arc::new(ScriptRunner::new(ctx.deps())),
    );
    scheduler.run_as_command(&confd.display().to_string()).await.unwrap();

    assert_eq!(ctx.archived_files(), vec!["nightly.tar.gz"]);
}

#[tokio::test]
async fn test_foreground_runs_scheduled_jobs_until_shutdown() {
    let ctx = TestContext::new();
    ConfigBuilder::new()
        .cron("@every 100ms")
        .write_dotenv(&ctx.confd_dir(), "fast.env");
    let runner = Arc::new(RecordingRunner::default());
    let scheduler = Arc::new(Scheduler::new(
        Arc::new(loader(&ctx, EnvContext::new())),
        runner.clone(),
    ));

    let shutdown = scheduler.shutdown_token();
    let handle = {
        let scheduler = scheduler.clone();
        tokio::spawn(async move { scheduler.run_in_foreground(ForegroundOptions::default()).await })
    };

    tokio::time::sleep(Duration::from_millis(450)).await;
    shutdown.cancel();
    handle.await.unwrap().unwrap();

    assert!(!runner.runs().is_empty());
    assert!(runner.runs().iter().all(|(_, kind)| *kind == "script"));
}
