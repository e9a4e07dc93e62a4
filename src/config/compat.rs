//! Compatibility layer for legacy and file-indirected variables
//!
//! Both rewrites are applied to an [`EnvContext`] through an [`Overlay`] guard.
//! Every override records an [`EnvVarSnapshot`]; dropping the guard (or calling
//! [`Overlay::rollback`]) replays the snapshots in reverse order, which restores
//! the context exactly, including unsetting keys that did not exist before.

use super::context::EnvContext;
use super::loader::ConfigError;
use std::ops::{Deref, DerefMut};

/// Prefix requesting that a variable's value is read from the file it names
pub const FILE_PREFIX: &str = "FILE__";

/// Legacy variable names and the canonical names they map to
pub const LEGACY_MAPPING: &[(&str, &str)] = &[
    ("AWS_ACCESS_KEY_ID", "OFFEN_STORAGE_AWS_ACCESSKEYID"),
    ("AWS_SECRET_ACCESS_KEY", "OFFEN_STORAGE_AWS_SECRETACCESSKEY"),
    ("AWS_SECRET_ACCESS_KEY_FILE", "FILE__OFFEN_STORAGE_AWS_SECRETACCESSKEY"),
    ("AWS_ENDPOINT", "OFFEN_STORAGE_AWS_ENDPOINT"),
    ("AWS_ENDPOINT_PROTO", "OFFEN_STORAGE_AWS_ENDPOINTPROTO"),
    ("AWS_ENDPOINT_INSECURE", "OFFEN_STORAGE_AWS_ENDPOINTINSECURE"),
    ("AWS_ENDPOINT_CA_CERT", "OFFEN_STORAGE_AWS_ENDPOINTCACERT"),
    ("AWS_STORAGE_CLASS", "OFFEN_STORAGE_AWS_STORAGECLASS"),
    ("AWS_S3_BUCKET_NAME", "OFFEN_STORAGE_AWS_BUCKETNAME"),
    ("AWS_S3_PATH", "OFFEN_STORAGE_AWS_PATH"),
    ("AWS_IAM_ROLE_ENDPOINT", "OFFEN_STORAGE_AWS_IAMROLEENDPOINT"),
    ("BACKUP_FILENAME_EXPAND", "OFFEN_BACKUP_FILENAMEEXPAND"),
    ("BACKUP_FILENAME", "OFFEN_BACKUP_FILENAME"),
    ("BACKUP_LATEST_SYMLINK", "OFFEN_BACKUP_LATESTSYMLINK"),
    ("BACKUP_COMPRESSION", "OFFEN_BACKUP_COMPRESSION"),
    ("GZIP_PARALLELISM", "OFFEN_BACKUP_GZIPPARALLELISM"),
    ("BACKUP_SOURCES", "OFFEN_BACKUP_SOURCES"),
    ("BACKUP_ARCHIVE", "OFFEN_BACKUP_ARCHIVE"),
    ("BACKUP_CRON_EXPRESSION", "OFFEN_BACKUP_CRONEXPRESSION"),
    ("BACKUP_RETENTION_DAYS", "OFFEN_BACKUP_RETENTIONDAYS"),
    ("BACKUP_PRUNING_LEEWAY", "OFFEN_BACKUP_PRUNINGLEEWAY"),
    ("BACKUP_PRUNING_PREFIX", "OFFEN_BACKUP_PRUNINGPREFIX"),
    ("BACKUP_STOP_CONTAINER_LABEL", "OFFEN_BACKUP_STOPCONTAINERLABEL"),
    ("BACKUP_STOP_DURING_BACKUP_LABEL", "OFFEN_BACKUP_STOPDURINGBACKUPLABEL"),
    ("BACKUP_STOP_SERVICE_TIMEOUT", "OFFEN_BACKUP_STOPSERVICETIMEOUT"),
    ("BACKUP_EXCLUDE_REGEXP", "OFFEN_BACKUP_EXCLUDEREGEXP"),
    ("BACKUP_SKIP_BACKENDS_FROM_PRUNE", "OFFEN_BACKUP_SKIPBACKENDSFROMPRUNE"),
    ("EXEC_LABEL", "OFFEN_BACKUP_EXECLABEL"),
    ("EXEC_FORWARD_OUTPUT", "OFFEN_BACKUP_EXECFORWARDOUTPUT"),
    ("LOCK_TIMEOUT", "OFFEN_BACKUP_LOCKTIMEOUT"),
    ("GPG_PASSPHRASE", "OFFEN_BACKUP_GPGPASSPHRASE"),
    ("GPG_PASSPHRASE_FILE", "FILE__OFFEN_BACKUP_GPGPASSPHRASE"),
    ("NOTIFICATION_URLS", "OFFEN_NOTIFICATION_URLS"),
    ("NOTIFICATION_LEVEL", "OFFEN_NOTIFICATION_LEVEL"),
    ("EMAIL_NOTIFICATION_RECIPIENT", "OFFEN_NOTIFICATION_EMAIL_RECIPIENT"),
    ("EMAIL_NOTIFICATION_SENDER", "OFFEN_NOTIFICATION_EMAIL_SENDER"),
    ("EMAIL_SMTP_HOST", "OFFEN_NOTIFICATION_EMAIL_SMTPHOST"),
    ("EMAIL_SMTP_PORT", "OFFEN_NOTIFICATION_EMAIL_SMTPPORT"),
    ("EMAIL_SMTP_USERNAME", "OFFEN_NOTIFICATION_EMAIL_SMTPUSERNAME"),
    ("EMAIL_SMTP_PASSWORD", "OFFEN_NOTIFICATION_EMAIL_SMTPPASSWORD"),
    ("WEBDAV_URL", "OFFEN_STORAGE_WEBDAV_URL"),
    ("WEBDAV_URL_INSECURE", "OFFEN_STORAGE_WEBDAV_URLINSECURE"),
    ("WEBDAV_PATH", "OFFEN_STORAGE_WEBDAV_PATH"),
    ("WEBDAV_USERNAME", "OFFEN_STORAGE_WEBDAV_USERNAME"),
    ("WEBDAV_PASSWORD", "OFFEN_STORAGE_WEBDAV_PASSWORD"),
    ("WEBDAV_PASSWORD_FILE", "FILE__OFFEN_STORAGE_WEBDAV_PASSWORD"),
    ("SSH_HOST_NAME", "OFFEN_STORAGE_SSH_HOSTNAME"),
    ("SSH_PORT", "OFFEN_STORAGE_SSH_PORT"),
    ("SSH_USER", "OFFEN_STORAGE_SSH_USER"),
    ("SSH_PASSWORD", "OFFEN_STORAGE_SSH_PASSWORD"),
    ("SSH_PASSWORD_FILE", "FILE__OFFEN_STORAGE_SSH_PASSWORD"),
    ("SSH_IDENTITY_FILE", "OFFEN_STORAGE_SSH_IDENTITYFILE"),
    ("SSH_IDENTITY_PASSPHRASE", "OFFEN_STORAGE_SSH_IDENTITYPASSPHRASE"),
    ("SSH_REMOTE_PATH", "OFFEN_STORAGE_SSH_REMOTEPATH"),
    ("AZURE_STORAGE_ACCOUNT_NAME", "OFFEN_STORAGE_AZURE_ACCOUNTNAME"),
    ("AZURE_STORAGE_PRIMARY_ACCOUNT_KEY", "OFFEN_STORAGE_AZURE_PRIMARYACCOUNTKEY"),
    ("AZURE_STORAGE_CONNECTION_STRING", "OFFEN_STORAGE_AZURE_CONNECTIONSTRING"),
    ("AZURE_STORAGE_CONTAINER_NAME", "OFFEN_STORAGE_AZURE_CONTAINERNAME"),
    ("AZURE_STORAGE_PATH", "OFFEN_STORAGE_AZURE_PATH"),
    ("AZURE_STORAGE_ENDPOINT", "OFFEN_STORAGE_AZURE_ENDPOINT"),
    ("DROPBOX_ENDPOINT", "OFFEN_STORAGE_DROPBOX_ENDPOINT"),
    ("DROPBOX_CONTENT_ENDPOINT", "OFFEN_STORAGE_DROPBOX_CONTENTENDPOINT"),
    ("DROPBOX_OAUTH2_ENDPOINT", "OFFEN_STORAGE_DROPBOX_OAUTH2ENDPOINT"),
    ("DROPBOX_REFRESH_TOKEN", "OFFEN_STORAGE_DROPBOX_REFRESHTOKEN"),
    ("DROPBOX_APP_KEY", "OFFEN_STORAGE_DROPBOX_APPKEY"),
    ("DROPBOX_APP_SECRET", "OFFEN_STORAGE_DROPBOX_APPSECRET"),
    ("DROPBOX_REMOTE_PATH", "OFFEN_STORAGE_DROPBOX_REMOTEPATH"),
    ("DROPBOX_CONCURRENCY_LEVEL", "OFFEN_STORAGE_DROPBOX_CONCURRENCYLEVEL"),
];

/// State of a single variable before it was overridden
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EnvVarSnapshot {
    pub key: String,
    pub was_present: bool,
    pub previous_value: Option<String>,
}

impl EnvVarSnapshot {
    pub fn capture(ctx: &EnvContext, key: &str) -> Self {
        let previous_value = ctx.get(key).map(str::to_string);
        Self {
            key: key.to_string(),
            was_present: previous_value.is_some(),
            previous_value,
        }
    }

    /// Put the variable back into its captured state
    pub fn restore(&self, ctx: &mut EnvContext) {
        match (&self.previous_value, self.was_present) {
            (Some(value), true) => {
                ctx.set(self.key.clone(), value.clone());
            }
            _ => {
                ctx.remove(&self.key);
            }
        }
    }
}

/// Scoped set of overrides on an [`EnvContext`]
///
/// Overlays nest: an overlay can be applied on top of another one by passing
/// `&mut overlay` where a context is expected. The inner overlay has to be
/// released first, which the borrow checker enforces.
pub struct Overlay<'a> {
    ctx: &'a mut EnvContext,
    snapshots: Vec<EnvVarSnapshot>,
}

impl<'a> Overlay<'a> {
    pub fn new(ctx: &'a mut EnvContext) -> Self {
        Self {
            ctx,
            snapshots: Vec::new(),
        }
    }

    /// Set a variable, recording its previous state
    pub fn set(&mut self, key: &str, value: impl Into<String>) {
        self.snapshots.push(EnvVarSnapshot::capture(self.ctx, key));
        self.ctx.set(key, value);
    }

    /// Unset a variable, recording its previous state
    pub fn unset(&mut self, key: &str) {
        self.snapshots.push(EnvVarSnapshot::capture(self.ctx, key));
        self.ctx.remove(key);
    }

    /// Snapshots in the order the overrides were applied
    pub fn snapshots(&self) -> &[EnvVarSnapshot] {
        &self.snapshots
    }

    /// Undo every override now
    pub fn rollback(self) {
        drop(self);
    }

    fn restore(&mut self) {
        while let Some(snapshot) = self.snapshots.pop() {
            snapshot.restore(self.ctx);
        }
    }
}

impl Deref for Overlay<'_> {
    type Target = EnvContext;

    fn deref(&self) -> &EnvContext {
        self.ctx
    }
}

impl DerefMut for Overlay<'_> {
    fn deref_mut(&mut self) -> &mut EnvContext {
        self.ctx
    }
}

impl Drop for Overlay<'_> {
    fn drop(&mut self) {
        self.restore();
    }
}

/// Rewrite legacy variable names into the canonical namespace
///
/// Fails with [`ConfigError::Conflict`] when both a legacy variable and its
/// canonical counterpart are set; everything applied up to that point is
/// rolled back before the error is returned.
pub fn apply_legacy_mapping(ctx: &mut EnvContext) -> Result<Overlay<'_>, ConfigError> {
    let mut overlay = Overlay::new(ctx);

    for (legacy, canonical) in LEGACY_MAPPING {
        let Some(value) = overlay.get(legacy).map(str::to_string) else {
            continue;
        };
        overlay.unset(legacy);

        if overlay.contains(canonical) {
            return Err(ConfigError::Conflict {
                key: canonical.to_string(),
                legacy: legacy.to_string(),
            });
        }
        overlay.set(canonical, value);
    }

    Ok(overlay)
}

/// Replace every `FILE__OFFEN_*` variable with the content of the file it names
pub fn apply_file_indirection(ctx: &mut EnvContext) -> Result<Overlay<'_>, ConfigError> {
    let mut overlay = Overlay::new(ctx);

    let keys = overlay.keys_with_prefix(&format!("{}OFFEN_", FILE_PREFIX));
    for key in keys {
        let Some(path) = overlay.get(&key).map(str::to_string) else {
            continue;
        };
        overlay.unset(&key);

        let target = key.trim_start_matches(FILE_PREFIX).to_string();
        if overlay.contains(&target) {
            return Err(ConfigError::FileConflict { key: target, file_key: key });
        }

        let contents = std::fs::read_to_string(&path).map_err(|source| ConfigError::FileRead {
            key: key.clone(),
            path: path.clone().into(),
            source,
        })?;
        overlay.set(&target, contents);
    }

    Ok(overlay)
}
