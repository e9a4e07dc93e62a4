//! Schedules backup runs for every sourced configuration
//!
//! In the foreground the scheduler keeps one cron entry per configuration of
//! the `confd` and `label` strategies. Entries are tracked per strategy so a
//! reload replaces exactly the entries of the strategy being reloaded.
//! Without `--foreground` a single configuration is looked up by source and
//! run once.

use super::proxy::run_proxy;
use super::script::{run_script, ScriptDependencies};
use crate::config::{Config, ConfigError, ConfigLoader, ConfigStrategy};
use crate::utils::cron::{CronEngine, CronSchedule, EntryId, Job};
use anyhow::{anyhow, Context, Result};
use async_trait::async_trait;
use chrono::Local;
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::sync::Arc;
use tokio::signal::unix::{signal, SignalKind};
use tokio::sync::Notify;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

/// Provides the configurations of a sourcing strategy
#[async_trait]
pub trait ConfigSource: Send + Sync {
    async fn load(&self, strategy: ConfigStrategy) -> Result<Vec<Config>, ConfigError>;
}

#[async_trait]
impl ConfigSource for ConfigLoader {
    async fn load(&self, strategy: ConfigStrategy) -> Result<Vec<Config>, ConfigError> {
        ConfigLoader::load(self, strategy).await
    }
}

/// Executes backups for a configuration
#[async_trait]
pub trait BackupRunner: Send + Sync {
    /// Run the backup in this process
    async fn run_script(&self, config: &Config) -> Result<()>;

    /// Run the backup in a proxy container
    async fn run_proxy(&self, config: &Config) -> Result<()>;
}

/// Runner backed by the real pipeline and docker
pub struct ScriptRunner {
    deps: ScriptDependencies,
}

impl ScriptRunner {
    pub fn new(deps: ScriptDependencies) -> Self {
        Self { deps }
    }
}

#[async_trait]
impl BackupRunner for ScriptRunner {
    async fn run_script(&self, config: &Config) -> Result<()> {
        run_script(config, &self.deps).await
    }

    async fn run_proxy(&self, config: &Config) -> Result<()> {
        let docker = self
            .deps
            .docker
            .as_ref()
            .ok_or_else(|| anyhow!("no docker daemon available to run volume {}", config.source))?;
        run_proxy(config, docker.as_ref()).await
    }
}

/// Requests a reload of a running scheduler, like SIGHUP does
#[derive(Clone, Default)]
pub struct ReloadHandle {
    notify: Arc<Notify>,
}

impl ReloadHandle {
    pub fn reload(&self) {
        self.notify.notify_one();
    }
}

#[derive(Debug, Clone, Default)]
pub struct ForegroundOptions {
    /// Cron expression on which runtime metrics are logged
    pub profile: Option<String>,
}

pub struct Scheduler {
    engine: CronEngine,
    source: Arc<dyn ConfigSource>,
    runner: Arc<dyn BackupRunner>,
    schedules: Mutex<HashMap<ConfigStrategy, Vec<EntryId>>>,
    reload: ReloadHandle,
    shutdown: CancellationToken,
}

impl Scheduler {
    pub fn new(source: Arc<dyn ConfigSource>, runner: Arc<dyn BackupRunner>) -> Self {
        Self {
            engine: CronEngine::new(),
            source,
            runner,
            schedules: Mutex::new(HashMap::new()),
            reload: ReloadHandle::default(),
            shutdown: CancellationToken::new(),
        }
    }

    pub fn reload_handle(&self) -> ReloadHandle {
        self.reload.clone()
    }

    /// Token that stops [`Scheduler::run_in_foreground`] like SIGTERM does
    pub fn shutdown_token(&self) -> CancellationToken {
        self.shutdown.clone()
    }

    /// Entry ids currently owned by `strategy`
    pub fn entries(&self, strategy: ConfigStrategy) -> Vec<EntryId> {
        self.schedules.lock().get(&strategy).cloned().unwrap_or_default()
    }

    /// Expressions of every live cron entry
    pub fn expressions(&self) -> Vec<String> {
        self.engine.expressions().into_iter().map(|(_, e)| e).collect()
    }

    async fn load(&self, strategy: ConfigStrategy) -> Result<Vec<Config>> {
        match self.source.load(strategy).await {
            Ok(configs) => Ok(configs),
            Err(ConfigError::NoEnvironment) => {
                debug!("No configuration variables set for strategy {}", strategy);
                Ok(Vec::new())
            }
            Err(e) => Err(anyhow::Error::new(e).context(format!("error loading {} configuration", strategy))),
        }
    }

    /// Replace every entry of `strategy` with freshly sourced configurations
    pub async fn reload(&self, strategy: ConfigStrategy) -> Result<()> {
        let previous = self.schedules.lock().remove(&strategy).unwrap_or_default();
        for id in previous {
            self.engine.remove(id);
        }

        let configs = self.load(strategy).await.context("error sourcing configuration")?;

        let now = Local::now();
        let mut schedules = self.schedules.lock();
        let ids = schedules.entry(strategy).or_default();
        for config in configs {
            let expression = config.backup.cron_expression.clone();
            let source = config.source.clone();
            let id = self
                .engine
                .add(&expression, self.job(strategy, config))
                .with_context(|| format!("error adding schedule {}", expression))?;
            ids.push(id);

            info!(
                strategy = %strategy,
                "Successfully scheduled backup {} with expression {}", source, expression
            );
            if CronSchedule::parse(&expression).is_ok_and(|s| !s.will_fire(&now)) {
                warn!(
                    "Scheduled cron expression {} will never run, is this intentional?",
                    expression
                );
            }
        }

        Ok(())
    }

    async fn reload_all(&self) -> Result<()> {
        self.reload(ConfigStrategy::Confd).await?;
        self.reload(ConfigStrategy::Label).await
    }

    fn job(&self, strategy: ConfigStrategy, config: Config) -> Job {
        let runner = self.runner.clone();
        let config = Arc::new(config);
        Arc::new(move || {
            let runner = runner.clone();
            let config = config.clone();
            async move {
                let expression = &config.backup.cron_expression;
                info!(source = %config.source, "Now running script on schedule {}", expression);

                let result = match strategy {
                    ConfigStrategy::Label => runner.run_proxy(&config).await,
                    ConfigStrategy::Env | ConfigStrategy::Confd => runner.run_script(&config).await,
                };
                if let Err(e) = result {
                    error!(
                        source = %config.source,
                        "Unexpected error running schedule {}: {:#}", expression, e
                    );
                }
            }
            .boxed()
        })
    }

    fn profile_job(&self) -> Job {
        let engine = self.engine.clone();
        Arc::new(move || {
            let engine = engine.clone();
            async move {
                info!(
                    entries = engine.len(),
                    active_tasks = engine.active_tasks(),
                    resident_memory_kb = resident_memory_kb(),
                    "Collecting runtime information"
                );
            }
            .boxed()
        })
    }

    /// Schedule every confd and label configuration and run until shut down
    ///
    /// SIGINT and SIGTERM stop the scheduler once running backups finished.
    /// SIGHUP or [`ReloadHandle::reload`] re-source both strategies.
    pub async fn run_in_foreground(&self, opts: ForegroundOptions) -> Result<()> {
        self.reload_all().await.context("error scheduling")?;

        if let Some(expression) = opts.profile.filter(|e| !e.is_empty()) {
            self.engine
                .add(&expression, self.profile_job())
                .context("error adding profiling job")?;
        }

        let mut sigterm = signal(SignalKind::terminate()).context("failed to listen for SIGTERM")?;
        let mut sigint = signal(SignalKind::interrupt()).context("failed to listen for SIGINT")?;
        let mut sighup = signal(SignalKind::hangup()).context("failed to listen for SIGHUP")?;

        self.engine.start();
        info!(entries = self.engine.len(), "Scheduler started");

        loop {
            let reload = tokio::select! {
                _ = sigterm.recv() => false,
                _ = sigint.recv() => false,
                _ = self.shutdown.cancelled() => false,
                _ = sighup.recv() => true,
                _ = self.reload.notify.notified() => true,
            };
            if !reload {
                break;
            }

            info!("Reloading configuration");
            if let Err(e) = self.reload_all().await {
                self.engine.stop().await;
                return Err(e.context("error reloading configuration"));
            }
        }

        info!("Shutting down, waiting for running backups to finish");
        self.engine.stop().await;
        Ok(())
    }

    /// Run the configuration whose source is `source` once
    ///
    /// Strategies are searched in order env, confd, label; label matches run
    /// through a proxy container. No match is not an error.
    pub async fn run_as_command(&self, source: &str) -> Result<()> {
        for strategy in [ConfigStrategy::Env, ConfigStrategy::Confd, ConfigStrategy::Label] {
            let configs = self.load(strategy).await?;
            let Some(config) = configs.into_iter().find(|c| c.source == source) else {
                continue;
            };

            return match strategy {
                ConfigStrategy::Label => self.runner.run_proxy(&config).await.context("error running proxy"),
                ConfigStrategy::Env | ConfigStrategy::Confd => {
                    self.runner.run_script(&config).await.context("error running script")
                }
            };
        }

        warn!("No configuration found for source {}", source);
        Ok(())
    }
}

fn resident_memory_kb() -> u64 {
    std::fs::read_to_string("/proc/self/status")
        .ok()
        .and_then(|status| {
            status
                .lines()
                .find_map(|line| line.strip_prefix("VmRSS:"))
                .and_then(|value| value.trim().trim_end_matches("kB").trim().parse().ok())
        })
        .unwrap_or(0)
}
