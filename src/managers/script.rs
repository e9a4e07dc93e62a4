//! One backup run: lock, archive, encrypt, copy, prune, notify
//!
//! Every run goes through the same fixed phases. Each phase is wrapped in
//! `docker-volume-backup.<phase>-pre` / `-post` commands executed inside
//! labeled containers. Cleanup and notifications are registered as hooks and
//! dispatched once the phases are done, whatever their outcome.

use super::hooks::{combine, HookLevel, Hooks};
use super::logging::RunLog;
use super::notification::{
    render, NotificationKind, NotificationManager, Notifier, Templates, UrlNotifier, DEFAULT_TEMPLATE_DIR,
};
use super::stats::Stats;
use crate::config::{CompressionType, Config, EnvContext};
use crate::storage::{
    copy_all, prune_all, AzureStorage, DropboxStorage, LocalStorage, PrunePolicy, S3Storage, SshStorage,
    StorageBackend, WebdavStorage,
};
use crate::utils::archive::{ArchiveRequest, Archiver, TarArchiver};
use crate::utils::docker::docker_available;
use crate::utils::docker_ops::{ContainerInfo, DockerOperations, RealDockerOps};
use crate::utils::executor::{CommandExecutor, RealExecutor};
use crate::utils::locker::{BackupLock, DEFAULT_LOCK_PATH};
use anyhow::{anyhow, bail, Context, Result};
use chrono::format::{Item, StrftimeItems};
use chrono::{DateTime, Local, Utc};
use futures::future::join_all;
use futures::FutureExt;
use parking_lot::Mutex;
use std::collections::HashSet;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::Arc;

/// Collaborators of a run, replaceable in tests
#[derive(Clone)]
pub struct ScriptDependencies {
    pub executor: Arc<dyn CommandExecutor>,
    /// `None` when no docker daemon is reachable
    pub docker: Option<Arc<dyn DockerOperations>>,
    pub archiver: Arc<dyn Archiver>,
    /// Replaces the URL based sender when set
    pub notifier: Option<Arc<dyn Notifier>>,
    /// Replaces the backends built from the configuration when set
    pub backends: Option<Vec<Arc<dyn StorageBackend>>>,
    pub lock_path: PathBuf,
    /// Where archives are written before they are copied
    pub work_dir: PathBuf,
    pub templates_dir: PathBuf,
}

impl ScriptDependencies {
    /// Real collaborators; docker is used when `DOCKER_HOST` is set or the socket exists
    pub fn detect() -> Self {
        let executor: Arc<dyn CommandExecutor> = Arc::new(RealExecutor::new());
        let docker_host = std::env::var("DOCKER_HOST").ok();
        let docker: Option<Arc<dyn DockerOperations>> = if docker_available(docker_host.as_deref()) {
            Some(Arc::new(RealDockerOps::with_executor(executor.clone())))
        } else {
            None
        };

        Self {
            archiver: Arc::new(TarArchiver::new(executor.clone())),
            executor,
            docker,
            notifier: None,
            backends: None,
            lock_path: PathBuf::from(DEFAULT_LOCK_PATH),
            work_dir: PathBuf::from("/tmp"),
            templates_dir: PathBuf::from(DEFAULT_TEMPLATE_DIR),
        }
    }

    pub fn with_docker(mut self, docker: Option<Arc<dyn DockerOperations>>) -> Self {
        self.docker = docker;
        self
    }

    pub fn with_archiver(mut self, archiver: Arc<dyn Archiver>) -> Self {
        self.archiver = archiver;
        self
    }

    pub fn with_executor(mut self, executor: Arc<dyn CommandExecutor>) -> Self {
        self.executor = executor;
        self
    }

    pub fn with_notifier(mut self, notifier: Arc<dyn Notifier>) -> Self {
        self.notifier = Some(notifier);
        self
    }

    pub fn with_backends(mut self, backends: Vec<Arc<dyn StorageBackend>>) -> Self {
        self.backends = Some(backends);
        self
    }

    pub fn with_lock_path(mut self, path: impl Into<PathBuf>) -> Self {
        self.lock_path = path.into();
        self
    }

    pub fn with_work_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.work_dir = dir.into();
        self
    }

    pub fn with_templates_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.templates_dir = dir.into();
        self
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Archive,
    Process,
    Copy,
    Prune,
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Phase::Archive => write!(f, "archive"),
            Phase::Process => write!(f, "process"),
            Phase::Copy => write!(f, "copy"),
            Phase::Prune => write!(f, "prune"),
        }
    }
}

/// Run one backup for `config`
///
/// The host wide lock is held for the whole run. Hooks always run once the
/// script was set up; their errors are reported next to the run error.
pub async fn run_script(config: &Config, deps: &ScriptDependencies) -> Result<()> {
    let lock = BackupLock::acquire(&deps.lock_path, config.backup.lock_timeout)
        .await
        .context("error acquiring file lock")?;

    let mut script = Script::new(config.clone(), deps);
    if !lock.waited().is_zero() {
        script.stats.lock().lock_wait = lock.waited();
        script.log.info(format!(
            "Waited {:?} for the lock held by another backup run.",
            lock.waited()
        ));
    }

    script.init().context("error instantiating script")?;

    let run = script.run_phases().await;
    match &run {
        Ok(()) => script.log.info("Finished running backup tasks."),
        Err(e) => script.log.error(format!("Fatal error running backup: {:#}", e)),
    }

    let Script { hooks, hook_level, .. } = script;
    let hooks_result = hooks.run(hook_level, run.as_ref().err()).await;
    drop(lock);

    combine(run, hooks_result)
}

struct Script<'a> {
    config: Config,
    deps: &'a ScriptDependencies,
    log: RunLog,
    stats: Arc<Mutex<Stats>>,
    hooks: Hooks,
    hook_level: HookLevel,
    backends: Vec<Arc<dyn StorageBackend>>,
    file: PathBuf,
    stopped: Arc<Mutex<Vec<ContainerInfo>>>,
    copy_failed: HashSet<&'static str>,
    copy_errors: Vec<String>,
}

impl<'a> Script<'a> {
    fn new(config: Config, deps: &'a ScriptDependencies) -> Self {
        let log = RunLog::new(&config.source);
        Self {
            config,
            deps,
            log,
            stats: Arc::new(Mutex::new(Stats::new(Local::now()))),
            hooks: Hooks::new(),
            hook_level: HookLevel::Error,
            backends: Vec::new(),
            file: PathBuf::new(),
            stopped: Arc::new(Mutex::new(Vec::new())),
            copy_failed: HashSet::new(),
            copy_errors: Vec::new(),
        }
    }

    fn init(&mut self) -> Result<()> {
        let stats = self.stats.clone();
        self.hooks.register(HookLevel::Plumbing, "stamp end time", move |_| {
            async move {
                stats.lock().finish(Local::now());
                Ok(())
            }
            .boxed()
        });

        let start_time = self.stats.lock().start_time;
        let filename = resolve_filename(
            &self.config.backup.filename,
            self.config.backup.compression,
            self.config.backup.filename_expand.then_some(&self.config.env),
            &start_time,
        )?;
        if self.config.backup.filename_expand {
            let backup = &mut self.config.backup;
            backup.latest_symlink = self.config.env.expand(&backup.latest_symlink);
            backup.pruning_prefix = self.config.env.expand(&backup.pruning_prefix);
        }
        self.file = self.deps.work_dir.join(filename);

        self.backends = match &self.deps.backends {
            Some(backends) => backends.clone(),
            None => self.build_backends()?,
        };

        if let Some(email) = self.config.notification.email.take() {
            self.config.notification.urls.push(email.to_url());
            self.log.warn(
                "Using EMAIL_* keys for providing notification configuration has been deprecated and will be removed in the next major version.",
            );
            self.log
                .warn("Please use NOTIFICATION_URLS instead. Refer to the README for an upgrade guide.");
        }

        self.hook_level = HookLevel::from_notification_level(&self.config.notification.level)?;

        if !self.config.notification.urls.is_empty() {
            let templates = Templates::load(&self.deps.templates_dir)
                .context("unable to parse user defined notifications templates")?;
            let notifier: Arc<dyn Notifier> = match &self.deps.notifier {
                Some(notifier) => notifier.clone(),
                None => Arc::new(
                    UrlNotifier::new(self.config.notification.urls.clone(), self.deps.executor.clone())
                        .context("error creating sender")?,
                ),
            };
            self.register_notifications(Arc::new(NotificationManager::new(templates, notifier)));
        }

        Ok(())
    }

    fn build_backends(&self) -> Result<Vec<Arc<dyn StorageBackend>>> {
        let sink = self.log.storage_sink();
        let executor = &self.deps.executor;
        let storage = &self.config.storage;
        let mut backends: Vec<Arc<dyn StorageBackend>> = Vec::new();

        if let Some(aws) = &storage.aws {
            let backend = S3Storage::new(aws.clone(), executor.clone(), sink.clone())
                .context("error creating s3 storage backend")?;
            backends.push(Arc::new(backend));
        }
        if let Some(webdav) = &storage.webdav {
            let backend =
                WebdavStorage::new(webdav.clone(), sink.clone()).context("error creating webdav storage backend")?;
            backends.push(Arc::new(backend));
        }
        if let Some(ssh) = &storage.ssh {
            backends.push(Arc::new(SshStorage::new(ssh.clone(), executor.clone(), sink.clone())));
        }
        if self.config.backup.archive.exists() {
            backends.push(Arc::new(LocalStorage::new(
                self.config.backup.archive.clone(),
                self.config.backup.latest_symlink.clone(),
                sink.clone(),
            )));
        }
        if let Some(azure) = &storage.azure {
            backends.push(Arc::new(AzureStorage::new(azure.clone(), executor.clone(), sink.clone())));
        }
        if let Some(dropbox) = &storage.dropbox {
            let backend = DropboxStorage::new(dropbox.clone(), sink.clone())
                .context("error creating dropbox storage backend")?;
            backends.push(Arc::new(backend));
        }

        Ok(backends)
    }

    /// Failure and success notifications; the run error decides which one sends.
    /// A failed send is logged and never fails the run.
    fn register_notifications(&mut self, manager: Arc<NotificationManager>) {
        let (stats, log, failure) = (self.stats.clone(), self.log.clone(), manager.clone());
        self.hooks.register(HookLevel::Error, "notify failure", move |err| {
            async move {
                let Some(err) = err else { return Ok(()) };
                let snapshot = snapshot(&stats, &log);
                if let Err(e) = failure.notify(NotificationKind::Failure, &snapshot, Some(&err)).await {
                    log.error(format!("Error notifying failure: {:#}", e));
                }
                Ok(())
            }
            .boxed()
        });

        let (stats, log) = (self.stats.clone(), self.log.clone());
        self.hooks.register(HookLevel::Info, "notify success", move |err| {
            async move {
                if err.is_some() {
                    return Ok(());
                }
                let snapshot = snapshot(&stats, &log);
                if let Err(e) = manager.notify(NotificationKind::Success, &snapshot, None).await {
                    log.error(format!("Error notifying success: {:#}", e));
                }
                Ok(())
            }
            .boxed()
        });
    }

    async fn run_phases(&mut self) -> Result<()> {
        for phase in [Phase::Archive, Phase::Process, Phase::Copy, Phase::Prune] {
            self.run_phase(phase).await?;
        }

        if self.copy_errors.is_empty() {
            Ok(())
        } else {
            Err(anyhow!(
                "error copying archive: {}",
                self.copy_errors.join("; ")
            ))
        }
    }

    async fn run_phase(&mut self, phase: Phase) -> Result<()> {
        self.run_labeled_commands(&format!("{}-pre", phase))
            .await
            .with_context(|| format!("error running {}-pre commands", phase))?;

        let result = match phase {
            Phase::Archive => self.create_archive().await,
            Phase::Process => self.encrypt_archive().await,
            Phase::Copy => self.copy_archive().await,
            Phase::Prune => self.prune_backups().await,
        };

        let post = self
            .run_labeled_commands(&format!("{}-post", phase))
            .await
            .with_context(|| format!("error running {}-post commands", phase));

        match (result, post) {
            (Ok(()), post) => post,
            (Err(e), Ok(())) => Err(e),
            (Err(e), Err(post)) => Err(anyhow!("{:#}; {:#}", e, post)),
        }
    }

    /// Execute the commands found in `docker-volume-backup.<label>` container labels
    async fn run_labeled_commands(&self, label: &str) -> Result<()> {
        let Some(docker) = &self.deps.docker else {
            return Ok(());
        };

        let exec_filter = (!self.config.backup.exec_label.is_empty())
            .then(|| format!("label=docker-volume-backup.exec-label={}", self.config.backup.exec_label));

        let mut keys = vec![format!("docker-volume-backup.{}", label)];
        let deprecated = match label {
            "archive-pre" => Some("docker-volume-backup.exec-pre"),
            "archive-post" => Some("docker-volume-backup.exec-post"),
            _ => None,
        };
        keys.extend(deprecated.map(str::to_string));

        let mut targets: Vec<(ContainerInfo, String)> = Vec::new();
        for key in keys {
            let mut filters = vec![format!("label={}", key)];
            filters.extend(exec_filter.clone());
            let containers = docker
                .list_containers(&filters)
                .await
                .context("error querying for containers")?;
            if Some(key.as_str()) == deprecated && !containers.is_empty() {
                self.log.warn(
                    "Using `docker-volume-backup.exec-pre` and `docker-volume-backup.exec-post` labels has been deprecated and will be removed in the next major version.",
                );
                self.log
                    .warn("Please use other `-pre` and `-post` labels instead. Refer to the README for an upgrade guide.");
            }
            targets.extend(containers.into_iter().map(|c| (c, key.clone())));
        }

        if targets.is_empty() {
            return Ok(());
        }

        let forward = self.config.backup.exec_forward_output;
        let results = join_all(targets.iter().map(|(container, key)| async move {
            let command = container.labels.get(key).cloned().unwrap_or_default();
            let user = container.labels.get(&format!("{}.user", key)).map(String::as_str);
            self.log.info(format!(
                "Running {} command `{}` for container {}.",
                label, command, container.name
            ));
            let output = docker
                .exec(&container.id, &command, user)
                .await
                .with_context(|| format!("error executing command in container {}", container.name))?;
            if forward {
                for line in output.stdout.lines().chain(output.stderr.lines()) {
                    self.log.info(format!("[{}] {}", container.name, line));
                }
            }
            Ok::<(), anyhow::Error>(())
        }))
        .await;

        let failures: Vec<String> = results
            .into_iter()
            .filter_map(|r| r.err())
            .map(|e| format!("{:#}", e))
            .collect();
        if failures.is_empty() {
            Ok(())
        } else {
            bail!("{} error(s) running labeled commands: {}", failures.len(), failures.join("; "))
        }
    }

    async fn create_archive(&mut self) -> Result<()> {
        self.register_removal(self.file.clone(), "tar file");

        let stop_result = self.stop_containers().await;
        let archive_result = match &stop_result {
            Ok(()) => {
                let request = ArchiveRequest {
                    sources: self.config.backup.sources.clone(),
                    target: self.file.clone(),
                    compression: self.config.backup.compression,
                    parallelism: self.config.backup.gzip_parallelism.get(),
                    exclude: self.config.backup.exclude_regexp.regex().cloned(),
                };
                self.deps.archiver.create(&request).await
            }
            Err(_) => Ok(()),
        };
        let restart_result = match &self.deps.docker {
            Some(docker) => restart_containers(docker.as_ref(), &self.stopped, &self.stats, &self.log).await,
            None => Ok(()),
        };

        stop_result.context("error stopping containers")?;
        archive_result.context("error creating archive")?;
        restart_result.context("error restarting containers")?;

        self.log.info(format!(
            "Created backup of `{}` at `{}`.",
            self.config.backup.sources.display(),
            self.file.display()
        ));
        Ok(())
    }

    /// Stop running containers carrying the stop-during-backup label
    async fn stop_containers(&mut self) -> Result<()> {
        let Some(docker) = self.deps.docker.clone() else {
            return Ok(());
        };

        let all = docker
            .list_containers(&[])
            .await
            .context("error querying for containers")?;
        let label = format!(
            "docker-volume-backup.stop-during-backup={}",
            self.config.backup.stop_during_backup_label
        );
        let to_stop = docker
            .list_containers(&[format!("label={}", label)])
            .await
            .with_context(|| format!("error querying for containers to stop with label {}", label))?;

        {
            let mut stats = self.stats.lock();
            stats.containers.all = all.len();
            stats.containers.to_stop = to_stop.len();
        }
        if to_stop.is_empty() {
            return Ok(());
        }

        let (stopped, log, stats) = (self.stopped.clone(), self.log.clone(), self.stats.clone());
        let restart_docker = docker.clone();
        self.hooks.register(HookLevel::Plumbing, "restart stopped containers", move |_| {
            async move { restart_containers(restart_docker.as_ref(), &stopped, &stats, &log).await }.boxed()
        });

        self.log.info(format!(
            "Stopping {} out of {} running container(s) as they were labeled {}.",
            to_stop.len(),
            all.len(),
            label
        ));

        let timeout = self.config.backup.stop_service_timeout;
        let results = join_all(to_stop.into_iter().map(|container| {
            let docker = docker.clone();
            async move {
                let result = docker.stop_container(&container.id, timeout).await;
                (container, result)
            }
        }))
        .await;

        let mut failures = Vec::new();
        for (container, result) in results {
            match result {
                Ok(()) => self.stopped.lock().push(container),
                Err(e) => failures.push(format!("{}: {:#}", container.name, e)),
            }
        }
        self.stats.lock().containers.stopped = self.stopped.lock().len();

        if failures.is_empty() {
            Ok(())
        } else {
            bail!("{} error(s) stopping containers: {}", failures.len(), failures.join("; "))
        }
    }

    async fn encrypt_archive(&mut self) -> Result<()> {
        if self.config.backup.gpg_passphrase.is_empty() {
            return Ok(());
        }

        let mut encrypted = self.file.as_os_str().to_owned();
        encrypted.push(".gpg");
        self.register_removal(PathBuf::from(encrypted), "encrypted backup");

        let output = self
            .deps
            .archiver
            .encrypt(&self.file, &self.config.backup.gpg_passphrase)
            .await
            .context("error encrypting backup file")?;
        self.log.info(format!(
            "Encrypted backup using given passphrase, saving as `{}`.",
            output.display()
        ));
        self.file = output;
        Ok(())
    }

    async fn copy_archive(&mut self) -> Result<()> {
        let metadata = tokio::fs::metadata(&self.file)
            .await
            .with_context(|| format!("unable to stat backup file {:?}", self.file))?;
        {
            let mut stats = self.stats.lock();
            stats.backup_file.name = self
                .file
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            stats.backup_file.full_path = self.file.display().to_string();
            stats.backup_file.size = metadata.len();
        }

        for (name, result) in copy_all(&self.backends, &self.file).await {
            let mut stats = self.stats.lock();
            let entry = stats.storage_mut(name);
            match result {
                Ok(location) => entry.location = location,
                Err(e) => {
                    let message = format!("{:#}", anyhow::Error::new(e));
                    entry.store_error = Some(message.clone());
                    self.copy_failed.insert(name);
                    self.copy_errors.push(message);
                }
            }
        }
        Ok(())
    }

    async fn prune_backups(&mut self) -> Result<()> {
        let policy = PrunePolicy::from_config(&self.config.backup);
        if !policy.enabled() {
            return Ok(());
        }

        let eligible: Vec<Arc<dyn StorageBackend>> = self
            .backends
            .iter()
            .filter(|backend| !self.copy_failed.contains(backend.name()))
            .cloned()
            .collect();

        let mut failures = Vec::new();
        for (name, result) in prune_all(&eligible, &policy, Utc::now()).await {
            let mut stats = self.stats.lock();
            let entry = stats.storage_mut(name);
            match result {
                Ok(pruned) => {
                    entry.total = pruned.total;
                    entry.pruned = pruned.pruned;
                }
                Err(e) => {
                    let message = format!("{:#}", anyhow::Error::new(e));
                    entry.pruning_error = Some(message.clone());
                    failures.push(message);
                }
            }
        }

        if failures.is_empty() {
            Ok(())
        } else {
            bail!("error pruning backups: {}", failures.join("; "))
        }
    }

    /// Remove a local artifact once the run is over
    fn register_removal(&mut self, path: PathBuf, what: &'static str) {
        let log = self.log.clone();
        self.hooks.register(HookLevel::Plumbing, format!("remove {}", what), move |_| {
            async move {
                match tokio::fs::remove_file(&path).await {
                    Ok(()) => {
                        log.info(format!("Removed {} `{}`.", what, path.display()));
                        Ok(())
                    }
                    Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
                    Err(e) => Err(anyhow!(e).context(format!("error removing {} {:?}", what, path))),
                }
            }
            .boxed()
        });
    }
}

/// Start every container still recorded as stopped
async fn restart_containers(
    docker: &dyn DockerOperations,
    stopped: &Mutex<Vec<ContainerInfo>>,
    stats: &Mutex<Stats>,
    log: &RunLog,
) -> Result<()> {
    let containers = std::mem::take(&mut *stopped.lock());
    if containers.is_empty() {
        return Ok(());
    }

    let mut failures = Vec::new();
    for container in &containers {
        if let Err(e) = docker.start_container(&container.id).await {
            failures.push(format!("{}: {:#}", container.name, e));
        }
    }

    if failures.is_empty() {
        log.info(format!("Restarted {} container(s).", containers.len()));
        Ok(())
    } else {
        stats.lock().containers.restart_errors += failures.len();
        bail!("{} error(s) restarting containers: {}", failures.len(), failures.join("; "))
    }
}

fn snapshot(stats: &Mutex<Stats>, log: &RunLog) -> Stats {
    let mut stats = stats.lock();
    stats.log_output = log.output();
    stats.clone()
}

/// Resolve the archive file name for a run started at `start`
///
/// `{{ .Extension }}` becomes `tar.gz` or `tar.zst`, then `$VAR` references
/// are expanded when `env` is given, then strftime directives are applied.
pub fn resolve_filename(
    template: &str,
    compression: CompressionType,
    env: Option<&EnvContext>,
    start: &DateTime<Local>,
) -> Result<String> {
    let name = render(template, &serde_json::json!({ "Extension": compression.extension() }))
        .context("unable to resolve backup file extension")?;
    let name = match env {
        Some(env) => env.expand(&name),
        None => name,
    };

    let items: Vec<Item> = StrftimeItems::new(&name).collect();
    if items.iter().any(|item| matches!(item, Item::Error)) {
        bail!("invalid strftime directive in backup filename {:?}", name);
    }
    let resolved = start.format_with_items(items.into_iter()).to_string();

    if resolved.is_empty() || Path::new(&resolved).file_name().is_none() {
        bail!("backup filename {:?} does not resolve to a file name", template);
    }
    Ok(resolved)
}
