use super::context::EnvContext;
use super::decoders::{CertDecoder, CompressionType, NaturalNumber, RegexpDecoder, WholeNumber};
use std::path::PathBuf;
use std::time::Duration;

/// Source tag used for the configuration read straight from the process environment
pub const SOURCE_FROM_ENVIRONMENT: &str = "from environment";

/// Root configuration for a single backup job
#[derive(Debug, Clone)]
pub struct Config {
    /// Where this configuration came from: "from environment", a conf.d file or a volume name
    pub source: String,
    pub backup: BackupConfig,
    pub notification: NotificationConfig,
    pub storage: StorageConfig,
    /// Effective variables the configuration was decoded from
    pub env: EnvContext,
}

impl Config {
    /// Configuration with every default applied and no storage configured
    pub fn with_defaults(source: impl Into<String>) -> Self {
        Self {
            source: source.into(),
            backup: BackupConfig::default(),
            notification: NotificationConfig::default(),
            storage: StorageConfig::default(),
            env: EnvContext::new(),
        }
    }
}

/// Settings for archiving, locking and pruning
#[derive(Debug, Clone)]
pub struct BackupConfig {
    pub gzip_parallelism: WholeNumber,
    pub compression: CompressionType,
    /// Directory that gets archived
    pub sources: PathBuf,
    /// Filename template, supports `{{ .Extension }}` and strftime directives
    pub filename: String,
    pub filename_expand: bool,
    pub latest_symlink: String,
    /// Local archive directory, used as a storage backend when it exists
    pub archive: PathBuf,
    pub cron_expression: String,
    /// Negative values disable pruning
    pub retention_days: i32,
    pub pruning_leeway: Duration,
    pub pruning_prefix: String,
    pub stop_during_backup_label: String,
    pub stop_service_timeout: Duration,
    pub exclude_regexp: RegexpDecoder,
    pub skip_backends_from_prune: Vec<String>,
    pub exec_label: String,
    pub exec_forward_output: bool,
    pub lock_timeout: Duration,
    pub gpg_passphrase: String,
    /// Image used when running label-sourced backups in a separate container
    pub proxy_image: String,
    pub proxy_network: String,
}

impl Default for BackupConfig {
    fn default() -> Self {
        Self {
            gzip_parallelism: WholeNumber::new(1),
            compression: CompressionType::Gz,
            sources: PathBuf::from("/backup"),
            filename: default_filename(),
            filename_expand: false,
            latest_symlink: String::new(),
            archive: PathBuf::from("/archive"),
            cron_expression: "@daily".to_string(),
            retention_days: -1,
            pruning_leeway: Duration::from_secs(60),
            pruning_prefix: String::new(),
            stop_during_backup_label: "true".to_string(),
            stop_service_timeout: Duration::from_secs(5 * 60),
            exclude_regexp: RegexpDecoder::default(),
            skip_backends_from_prune: Vec::new(),
            exec_label: String::new(),
            exec_forward_output: false,
            lock_timeout: Duration::from_secs(60 * 60),
            gpg_passphrase: String::new(),
            proxy_image: default_proxy_image(),
            proxy_network: String::new(),
        }
    }
}

/// Deprecated inline email settings, folded into a notification URL at run time
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EmailNotification {
    pub recipient: String,
    pub sender: String,
    pub smtp_host: String,
    pub smtp_port: u16,
    pub smtp_username: String,
    pub smtp_password: String,
}

impl Default for EmailNotification {
    fn default() -> Self {
        Self {
            recipient: String::new(),
            sender: "noreply@nohost".to_string(),
            smtp_host: String::new(),
            smtp_port: 587,
            smtp_username: String::new(),
            smtp_password: String::new(),
        }
    }
}

impl EmailNotification {
    /// Render the settings as an smtp:// notification URL
    pub fn to_url(&self) -> String {
        format!(
            "smtp://{}:{}@{}:{}/?from={}&to={}",
            self.smtp_username,
            self.smtp_password,
            self.smtp_host,
            self.smtp_port,
            self.sender,
            self.recipient
        )
    }
}

/// Notification configuration
#[derive(Debug, Clone)]
pub struct NotificationConfig {
    pub urls: Vec<String>,
    /// Minimum severity, `error` or `info`
    pub level: String,
    pub email: Option<EmailNotification>,
}

impl Default for NotificationConfig {
    fn default() -> Self {
        Self {
            urls: Vec::new(),
            level: "error".to_string(),
            email: None,
        }
    }
}

/// Storage backends; a present sub-config enables the backend
#[derive(Debug, Clone, Default)]
pub struct StorageConfig {
    pub aws: Option<S3Config>,
    pub webdav: Option<WebdavConfig>,
    pub ssh: Option<SshConfig>,
    pub azure: Option<AzureConfig>,
    pub dropbox: Option<DropboxConfig>,
}

#[derive(Debug, Clone)]
pub struct S3Config {
    pub bucket_name: String,
    pub path: String,
    pub endpoint: String,
    pub endpoint_proto: String,
    pub endpoint_insecure: bool,
    pub endpoint_ca_cert: CertDecoder,
    pub storage_class: String,
    pub access_key_id: String,
    pub secret_access_key: String,
    pub iam_role_endpoint: String,
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            bucket_name: String::new(),
            path: String::new(),
            endpoint: "s3.amazonaws.com".to_string(),
            endpoint_proto: "https".to_string(),
            endpoint_insecure: false,
            endpoint_ca_cert: CertDecoder::default(),
            storage_class: String::new(),
            access_key_id: String::new(),
            secret_access_key: String::new(),
            iam_role_endpoint: String::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct WebdavConfig {
    pub url: String,
    pub url_insecure: bool,
    pub path: String,
    pub username: String,
    pub password: String,
}

impl Default for WebdavConfig {
    fn default() -> Self {
        Self {
            url: String::new(),
            url_insecure: false,
            path: "/".to_string(),
            username: String::new(),
            password: String::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct SshConfig {
    pub host_name: String,
    pub port: String,
    pub user: String,
    pub password: String,
    pub identity_file: PathBuf,
    pub identity_passphrase: String,
    pub remote_path: String,
}

impl Default for SshConfig {
    fn default() -> Self {
        Self {
            host_name: String::new(),
            port: "22".to_string(),
            user: String::new(),
            password: String::new(),
            identity_file: PathBuf::from("/root/.ssh/id_rsa"),
            identity_passphrase: String::new(),
            remote_path: String::new(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct AzureConfig {
    pub account_name: String,
    pub primary_account_key: String,
    pub connection_string: String,
    pub container_name: String,
    pub path: String,
    /// Blob endpoint template, `{{ .AccountName }}` is substituted
    pub endpoint: String,
}

impl Default for AzureConfig {
    fn default() -> Self {
        Self {
            account_name: String::new(),
            primary_account_key: String::new(),
            connection_string: String::new(),
            container_name: String::new(),
            path: String::new(),
            endpoint: "https://{{ .AccountName }}.blob.core.windows.net/".to_string(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct DropboxConfig {
    pub endpoint: String,
    pub content_endpoint: String,
    pub oauth2_endpoint: String,
    pub refresh_token: String,
    pub app_key: String,
    pub app_secret: String,
    pub remote_path: String,
    pub concurrency_level: NaturalNumber,
}

impl Default for DropboxConfig {
    fn default() -> Self {
        Self {
            endpoint: "https://api.dropboxapi.com/".to_string(),
            content_endpoint: "https://content.dropboxapi.com/".to_string(),
            oauth2_endpoint: "https://api.dropbox.com/".to_string(),
            refresh_token: String::new(),
            app_key: String::new(),
            app_secret: String::new(),
            remote_path: String::new(),
            concurrency_level: NaturalNumber::new(6).unwrap_or_default(),
        }
    }
}

// Default value functions

fn default_filename() -> String {
    "backup-%Y-%m-%dT%H-%M-%S.{{ .Extension }}".to_string()
}

fn default_proxy_image() -> String {
    "offen/docker-volume-backup:v2".to_string()
}
