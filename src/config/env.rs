//! Decode a [`Config`] from prefixed variables in an [`EnvContext`]
//!
//! Variable names are `OFFEN_<SECTION>_<FIELD>` with the field name upper cased
//! and stripped of separators, e.g. `OFFEN_BACKUP_CRONEXPRESSION` or
//! `OFFEN_STORAGE_AWS_BUCKETNAME`.

use super::context::EnvContext;
use super::decoders::{parse_bool, parse_duration, DecodeError};
use super::loader::{ConfigError, Result};
use super::types::*;
use std::path::PathBuf;
use std::str::FromStr;
use std::time::Duration;
use tracing::warn;

pub const ENV_PREFIX: &str = "OFFEN_";

/// Reads the fields of one configuration section
pub struct EnvDecoder<'a> {
    ctx: &'a EnvContext,
    prefix: String,
}

impl<'a> EnvDecoder<'a> {
    pub fn new(ctx: &'a EnvContext) -> Self {
        Self {
            ctx,
            prefix: ENV_PREFIX.to_string(),
        }
    }

    /// Decoder for a nested section, e.g. `STORAGE` then `AWS`
    pub fn section(&self, name: &str) -> EnvDecoder<'a> {
        EnvDecoder {
            ctx: self.ctx,
            prefix: format!("{}{}_", self.prefix, name),
        }
    }

    /// Whether any variable of this section is set
    pub fn present(&self) -> bool {
        self.ctx.has_prefix(&self.prefix)
    }

    pub fn key(&self, field: &str) -> String {
        format!("{}{}", self.prefix, field)
    }

    pub fn raw(&self, field: &str) -> Option<&'a str> {
        self.ctx.get(&self.key(field))
    }

    fn with<T>(
        &self,
        field: &str,
        target: &mut T,
        decode: impl FnOnce(&str) -> std::result::Result<T, DecodeError>,
    ) -> Result<()> {
        if let Some(value) = self.raw(field) {
            *target = decode(value).map_err(|source| ConfigError::Decode {
                key: self.key(field),
                source,
            })?;
        }
        Ok(())
    }

    pub fn string(&self, field: &str, target: &mut String) {
        if let Some(value) = self.raw(field) {
            *target = value.to_string();
        }
    }

    pub fn path(&self, field: &str, target: &mut PathBuf) {
        if let Some(value) = self.raw(field) {
            *target = PathBuf::from(value);
        }
    }

    pub fn parse<T>(&self, field: &str, target: &mut T) -> Result<()>
    where
        T: FromStr<Err = DecodeError>,
    {
        self.with(field, target, |v| v.parse::<T>())
    }

    pub fn bool(&self, field: &str, target: &mut bool) -> Result<()> {
        self.with(field, target, parse_bool)
    }

    pub fn duration(&self, field: &str, target: &mut Duration) -> Result<()> {
        self.with(field, target, parse_duration)
    }

    pub fn int<T: FromStr>(&self, field: &str, target: &mut T) -> Result<()> {
        self.with(field, target, |v| {
            v.trim()
                .parse()
                .map_err(|_| DecodeError::NotAnInteger(v.to_string()))
        })
    }

    /// Comma separated list, empty items are dropped
    pub fn list(&self, field: &str, target: &mut Vec<String>) {
        if let Some(value) = self.raw(field) {
            *target = value
                .split(',')
                .map(str::trim)
                .filter(|s| !s.is_empty())
                .map(str::to_string)
                .collect();
        }
    }
}

/// Decode a full configuration from the given context
///
/// Returns [`ConfigError::NoEnvironment`] if no `OFFEN_` variable is set at all.
pub fn decode_config(ctx: &EnvContext, source: &str) -> Result<Config> {
    let root = EnvDecoder::new(ctx);
    if !root.present() {
        return Err(ConfigError::NoEnvironment);
    }

    let mut config = Config::with_defaults(source);
    config.backup = decode_backup(&root.section("BACKUP"))?;
    config.notification = decode_notification(&root.section("NOTIFICATION"))?;
    config.storage = decode_storage(&root.section("STORAGE"))?;
    config.env = ctx.clone();

    Ok(config)
}

fn decode_backup(d: &EnvDecoder<'_>) -> Result<BackupConfig> {
    let mut c = BackupConfig::default();

    d.parse("GZIPPARALLELISM", &mut c.gzip_parallelism)?;
    d.parse("COMPRESSION", &mut c.compression)?;
    d.path("SOURCES", &mut c.sources);
    d.string("FILENAME", &mut c.filename);
    d.bool("FILENAMEEXPAND", &mut c.filename_expand)?;
    d.string("LATESTSYMLINK", &mut c.latest_symlink);
    d.path("ARCHIVE", &mut c.archive);
    d.string("CRONEXPRESSION", &mut c.cron_expression);
    d.int("RETENTIONDAYS", &mut c.retention_days)?;
    d.duration("PRUNINGLEEWAY", &mut c.pruning_leeway)?;
    d.string("PRUNINGPREFIX", &mut c.pruning_prefix);
    d.string("STOPDURINGBACKUPLABEL", &mut c.stop_during_backup_label);
    if let Some(label) = d.raw("STOPCONTAINERLABEL") {
        warn!(
            "Using {} has been deprecated and will be removed in the next major version, use {} instead",
            d.key("STOPCONTAINERLABEL"),
            d.key("STOPDURINGBACKUPLABEL")
        );
        c.stop_during_backup_label = label.to_string();
    }
    d.duration("STOPSERVICETIMEOUT", &mut c.stop_service_timeout)?;
    d.parse("EXCLUDEREGEXP", &mut c.exclude_regexp)?;
    d.list("SKIPBACKENDSFROMPRUNE", &mut c.skip_backends_from_prune);
    d.string("EXECLABEL", &mut c.exec_label);
    d.bool("EXECFORWARDOUTPUT", &mut c.exec_forward_output)?;
    d.duration("LOCKTIMEOUT", &mut c.lock_timeout)?;
    d.string("GPGPASSPHRASE", &mut c.gpg_passphrase);
    d.string("PROXYIMAGE", &mut c.proxy_image);
    d.string("PROXYNETWORK", &mut c.proxy_network);

    Ok(c)
}

fn decode_notification(d: &EnvDecoder<'_>) -> Result<NotificationConfig> {
    let mut c = NotificationConfig::default();
    d.list("URLS", &mut c.urls);
    d.string("LEVEL", &mut c.level);

    let email = d.section("EMAIL");
    if email.present() {
        let mut e = EmailNotification::default();
        email.string("RECIPIENT", &mut e.recipient);
        email.string("SENDER", &mut e.sender);
        email.string("SMTPHOST", &mut e.smtp_host);
        email.int("SMTPPORT", &mut e.smtp_port)?;
        email.string("SMTPUSERNAME", &mut e.smtp_username);
        email.string("SMTPPASSWORD", &mut e.smtp_password);
        c.email = Some(e);
    }

    Ok(c)
}

fn decode_storage(d: &EnvDecoder<'_>) -> Result<StorageConfig> {
    let mut storage = StorageConfig::default();

    let aws = d.section("AWS");
    if aws.present() {
        let mut c = S3Config::default();
        aws.string("BUCKETNAME", &mut c.bucket_name);
        aws.string("PATH", &mut c.path);
        aws.string("ENDPOINT", &mut c.endpoint);
        aws.string("ENDPOINTPROTO", &mut c.endpoint_proto);
        aws.bool("ENDPOINTINSECURE", &mut c.endpoint_insecure)?;
        aws.parse("ENDPOINTCACERT", &mut c.endpoint_ca_cert)?;
        aws.string("STORAGECLASS", &mut c.storage_class);
        aws.string("ACCESSKEYID", &mut c.access_key_id);
        aws.string("SECRETACCESSKEY", &mut c.secret_access_key);
        aws.string("IAMROLEENDPOINT", &mut c.iam_role_endpoint);
        storage.aws = Some(c);
    }

    let webdav = d.section("WEBDAV");
    if webdav.present() {
        let mut c = WebdavConfig::default();
        webdav.string("URL", &mut c.url);
        webdav.bool("URLINSECURE", &mut c.url_insecure)?;
        webdav.string("PATH", &mut c.path);
        webdav.string("USERNAME", &mut c.username);
        webdav.string("PASSWORD", &mut c.password);
        storage.webdav = Some(c);
    }

    let ssh = d.section("SSH");
    if ssh.present() {
        let mut c = SshConfig::default();
        ssh.string("HOSTNAME", &mut c.host_name);
        ssh.string("PORT", &mut c.port);
        ssh.string("USER", &mut c.user);
        ssh.string("PASSWORD", &mut c.password);
        ssh.path("IDENTITYFILE", &mut c.identity_file);
        ssh.string("IDENTITYPASSPHRASE", &mut c.identity_passphrase);
        ssh.string("REMOTEPATH", &mut c.remote_path);
        storage.ssh = Some(c);
    }

    let azure = d.section("AZURE");
    if azure.present() {
        let mut c = AzureConfig::default();
        azure.string("ACCOUNTNAME", &mut c.account_name);
        azure.string("PRIMARYACCOUNTKEY", &mut c.primary_account_key);
        azure.string("CONNECTIONSTRING", &mut c.connection_string);
        azure.string("CONTAINERNAME", &mut c.container_name);
        azure.string("PATH", &mut c.path);
        azure.string("ENDPOINT", &mut c.endpoint);
        storage.azure = Some(c);
    }

    let dropbox = d.section("DROPBOX");
    if dropbox.present() {
        let mut c = DropboxConfig::default();
        dropbox.string("ENDPOINT", &mut c.endpoint);
        dropbox.string("CONTENTENDPOINT", &mut c.content_endpoint);
        dropbox.string("OAUTH2ENDPOINT", &mut c.oauth2_endpoint);
        dropbox.string("REFRESHTOKEN", &mut c.refresh_token);
        dropbox.string("APPKEY", &mut c.app_key);
        dropbox.string("APPSECRET", &mut c.app_secret);
        dropbox.string("REMOTEPATH", &mut c.remote_path);
        dropbox.parse("CONCURRENCYLEVEL", &mut c.concurrency_level)?;
        storage.dropbox = Some(c);
    }

    Ok(storage)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::decoders::CompressionType;

    fn decode(pairs: &[(&str, &str)]) -> Result<Config> {
        decode_config(&EnvContext::from_pairs(pairs.iter().copied()), "test")
    }

    #[test]
    fn test_requires_prefixed_variables() {
        assert!(matches!(
            decode(&[("PATH", "/usr/bin")]),
            Err(ConfigError::NoEnvironment)
        ));
    }

    #[test]
    fn test_defaults_applied() {
        let config = decode(&[("OFFEN_BACKUP_CRONEXPRESSION", "0 2 * * *")]).unwrap();
        assert_eq!(config.source, "test");
        assert_eq!(config.backup.cron_expression, "0 2 * * *");
        assert_eq!(config.backup.retention_days, -1);
        assert_eq!(config.backup.pruning_leeway, Duration::from_secs(60));
        assert_eq!(config.backup.lock_timeout, Duration::from_secs(3600));
        assert_eq!(config.backup.compression, CompressionType::Gz);
        assert_eq!(config.notification.level, "error");
        assert!(config.storage.aws.is_none());
        assert!(config.notification.email.is_none());
    }

    #[test]
    fn test_storage_presence_by_prefix() {
        let config = decode(&[
            ("OFFEN_STORAGE_AWS_BUCKETNAME", "bucket"),
            ("OFFEN_STORAGE_SSH_HOSTNAME", "host"),
            ("OFFEN_STORAGE_DROPBOX_CONCURRENCYLEVEL", "2"),
        ])
        .unwrap();

        let aws = config.storage.aws.unwrap();
        assert_eq!(aws.bucket_name, "bucket");
        assert_eq!(aws.endpoint, "s3.amazonaws.com");
        let ssh = config.storage.ssh.unwrap();
        assert_eq!(ssh.port, "22");
        assert_eq!(config.storage.dropbox.unwrap().concurrency_level.get(), 2);
        assert!(config.storage.webdav.is_none());
        assert!(config.storage.azure.is_none());
    }

    #[test]
    fn test_lists_and_durations() {
        let config = decode(&[
            ("OFFEN_NOTIFICATION_URLS", "https://a.example, discord://t@1,"),
            ("OFFEN_BACKUP_SKIPBACKENDSFROMPRUNE", "S3,webdav"),
            ("OFFEN_BACKUP_PRUNINGLEEWAY", "10m"),
            ("OFFEN_BACKUP_RETENTIONDAYS", "7"),
        ])
        .unwrap();
        assert_eq!(
            config.notification.urls,
            vec!["https://a.example", "discord://t@1"]
        );
        assert_eq!(config.backup.skip_backends_from_prune, vec!["S3", "webdav"]);
        assert_eq!(config.backup.pruning_leeway, Duration::from_secs(600));
        assert_eq!(config.backup.retention_days, 7);
    }

    #[test]
    fn test_decode_errors_name_the_key() {
        let err = decode(&[("OFFEN_BACKUP_COMPRESSION", "bz2")]).unwrap_err();
        match err {
            ConfigError::Decode { key, .. } => assert_eq!(key, "OFFEN_BACKUP_COMPRESSION"),
            other => panic!("unexpected error: {other}"),
        }

        assert!(decode(&[("OFFEN_BACKUP_GZIPPARALLELISM", "-1")]).is_err());
        assert!(decode(&[("OFFEN_STORAGE_DROPBOX_CONCURRENCYLEVEL", "0")]).is_err());
        assert!(decode(&[("OFFEN_BACKUP_EXCLUDEREGEXP", "(")]).is_err());
        assert!(decode(&[("OFFEN_BACKUP_RETENTIONDAYS", "seven")]).is_err());
    }

    #[test]
    fn test_deprecated_stop_container_label() {
        let config = decode(&[("OFFEN_BACKUP_STOPCONTAINERLABEL", "db")]).unwrap();
        assert_eq!(config.backup.stop_during_backup_label, "db");
    }

    #[test]
    fn test_email_section() {
        let config = decode(&[
            ("OFFEN_NOTIFICATION_EMAIL_RECIPIENT", "ops@example.com"),
            ("OFFEN_NOTIFICATION_EMAIL_SMTPHOST", "mail.example.com"),
        ])
        .unwrap();
        let email = config.notification.email.unwrap();
        assert_eq!(email.sender, "noreply@nohost");
        assert_eq!(email.smtp_port, 587);
        assert_eq!(email.smtp_host, "mail.example.com");
    }
}
