use super::compat::{apply_file_indirection, apply_legacy_mapping};
use super::context::{parse_dotenv, EnvContext};
use super::decoders::DecodeError;
use super::env::decode_config;
use super::types::{Config, SOURCE_FROM_ENVIRONMENT};
use crate::utils::docker_ops::DockerOperations;
use parking_lot::Mutex;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::{debug, info};

/// Directory holding one dotenv file per backup job
pub const DEFAULT_CONFD_DIR: &str = "/etc/dockervolumebackup/conf.d";

/// Volumes carrying this label are backed up by the label strategy
pub const LABEL_ENABLE: &str = "docker-volume-backup.enable=true";

/// Volume labels with this prefix provide configuration variables,
/// e.g. `docker-volume-backup.env.OFFEN_BACKUP_CRONEXPRESSION`
pub const LABEL_ENV_PREFIX: &str = "docker-volume-backup.env.";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("environment variable {key} is set, while its legacy option {legacy} is also set")]
    Conflict { key: String, legacy: String },

    #[error("environment variable {key} is set, while file option {file_key} is also set")]
    FileConflict { key: String, file_key: String },

    #[error("unable to read variable {key} from file {path:?}")]
    FileRead {
        key: String,
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to decode {key}")]
    Decode {
        key: String,
        #[source]
        source: DecodeError,
    },

    #[error("failed to load environment variables")]
    NoEnvironment,

    #[error("failed to read configuration from {path:?}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid configuration file {path:?}: {reason}")]
    Dotenv { path: PathBuf, reason: String },

    #[error("error querying docker for labeled volumes: {0}")]
    Docker(String),
}

pub type Result<T> = std::result::Result<T, ConfigError>;

/// Serializes "snapshot, override, decode, rollback" sequences system wide
static ENV_SOURCING: Mutex<()> = parking_lot::const_mutex(());

/// Where configurations are discovered from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum ConfigStrategy {
    /// The process environment, yielding a single configuration
    Env,
    /// One dotenv file per job in the conf.d directory
    Confd,
    /// Docker volumes carrying the enable label
    Label,
}

impl fmt::Display for ConfigStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConfigStrategy::Env => write!(f, "env"),
            ConfigStrategy::Confd => write!(f, "confd"),
            ConfigStrategy::Label => write!(f, "label"),
        }
    }
}

/// Decode one configuration from the given context
///
/// Compatibility rewrites are applied on top of `ctx` and rolled back once
/// decoding finished, whatever the outcome.
pub fn load_from_context(mut ctx: EnvContext, source: &str) -> Result<Config> {
    let _sourcing = ENV_SOURCING.lock();

    let mut legacy = apply_legacy_mapping(&mut ctx)?;
    let files = apply_file_indirection(&mut legacy)?;
    let config = decode_config(&files, source);
    drop(files);
    drop(legacy);

    config
}

/// Produces configurations for each sourcing strategy
#[derive(Clone)]
pub struct ConfigLoader {
    confd_dir: PathBuf,
    docker: Option<Arc<dyn DockerOperations>>,
    base_env: Option<EnvContext>,
}

impl Default for ConfigLoader {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigLoader {
    pub fn new() -> Self {
        Self {
            confd_dir: PathBuf::from(DEFAULT_CONFD_DIR),
            docker: None,
            base_env: None,
        }
    }

    pub fn with_confd_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.confd_dir = dir.into();
        self
    }

    pub fn with_docker(mut self, docker: Arc<dyn DockerOperations>) -> Self {
        self.docker = Some(docker);
        self
    }

    /// Use a fixed base environment instead of the live process environment
    pub fn with_base_env(mut self, env: EnvContext) -> Self {
        self.base_env = Some(env);
        self
    }

    pub fn confd_dir(&self) -> &Path {
        &self.confd_dir
    }

    fn base(&self) -> EnvContext {
        self.base_env.clone().unwrap_or_else(EnvContext::from_process)
    }

    pub async fn load(&self, strategy: ConfigStrategy) -> Result<Vec<Config>> {
        match strategy {
            ConfigStrategy::Env => Ok(vec![self.load_env()?]),
            ConfigStrategy::Confd => self.load_confd(),
            ConfigStrategy::Label => self.load_labels().await,
        }
    }

    pub fn load_env(&self) -> Result<Config> {
        load_from_context(self.base(), SOURCE_FROM_ENVIRONMENT)
    }

    /// One configuration per regular file in the conf.d directory, in name
    /// order; falls back to the environment when the directory is missing
    pub fn load_confd(&self) -> Result<Vec<Config>> {
        if !self.confd_dir.exists() {
            debug!(
                "{} does not exist, falling back to the environment",
                self.confd_dir.display()
            );
            return Ok(vec![self.load_env()?]);
        }

        let io_err = |source| ConfigError::Io {
            path: self.confd_dir.clone(),
            source,
        };
        let mut paths = Vec::new();
        for entry in fs::read_dir(&self.confd_dir).map_err(io_err)? {
            let path = entry.map_err(io_err)?.path();
            if path.is_file() {
                paths.push(path);
            }
        }
        paths.sort();

        let base = self.base();
        let mut configs = Vec::with_capacity(paths.len());
        for path in paths {
            let content = fs::read_to_string(&path).map_err(|source| ConfigError::Io {
                path: path.clone(),
                source,
            })?;
            let pairs = parse_dotenv(&content).map_err(|reason| ConfigError::Dotenv {
                path: path.clone(),
                reason,
            })?;

            let mut ctx = base.clone();
            let expanded: Vec<_> = pairs
                .into_iter()
                .map(|(k, v)| {
                    let v = base.expand(&v);
                    (k, v)
                })
                .collect();
            ctx.overlay(expanded);

            configs.push(load_from_context(ctx, &path.display().to_string())?);
        }

        info!(
            "Loaded {} configuration(s) from {}",
            configs.len(),
            self.confd_dir.display()
        );
        Ok(configs)
    }

    /// One configuration per labeled docker volume, with the volume name as source
    pub async fn load_labels(&self) -> Result<Vec<Config>> {
        let Some(docker) = &self.docker else {
            debug!("No docker connection available, skipping label configuration");
            return Ok(Vec::new());
        };

        let volumes = docker
            .list_volumes(LABEL_ENABLE)
            .await
            .map_err(|e| ConfigError::Docker(format!("{:#}", e)))?;

        let base = self.base();
        let mut configs = Vec::with_capacity(volumes.len());
        for volume in volumes {
            let mut ctx = base.clone();
            ctx.overlay(volume.labels.iter().filter_map(|(k, v)| {
                k.strip_prefix(LABEL_ENV_PREFIX)
                    .map(|key| (key.to_string(), v.clone()))
            }));
            configs.push(load_from_context(ctx, &volume.name)?);
        }

        Ok(configs)
    }
}
