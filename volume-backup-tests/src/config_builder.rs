//! Fluent API for building test configurations
//!
//! Configurations are assembled as `OFFEN_` variables and decoded the same
//! way the loader does, so compatibility rewrites apply to builder input too.

use std::fs;
use std::path::{Path, PathBuf};
use volume_backup::config::{load_from_context, Config, ConfigError, EnvContext, SOURCE_FROM_ENVIRONMENT};

/// Builder for creating test configurations
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    source: String,
    vars: Vec<(String, String)>,
}

impl ConfigBuilder {
    /// Create a builder with a daily schedule and nothing else
    pub fn new() -> Self {
        Self {
            source: SOURCE_FROM_ENVIRONMENT.to_string(),
            vars: vec![("OFFEN_BACKUP_CRONEXPRESSION".to_string(), "@daily".to_string())],
        }
    }

    /// Set the source tag of the decoded configuration
    pub fn source(mut self, source: &str) -> Self {
        self.source = source.to_string();
        self
    }

    /// Set an arbitrary variable, legacy names included
    pub fn var(mut self, key: &str, value: &str) -> Self {
        self.vars.retain(|(k, _)| k != key);
        self.vars.push((key.to_string(), value.to_string()));
        self
    }

    /// Drop a variable, e.g. to let a legacy name take its place
    pub fn unset(mut self, key: &str) -> Self {
        self.vars.retain(|(k, _)| k != key);
        self
    }

    pub fn cron(self, expression: &str) -> Self {
        self.var("OFFEN_BACKUP_CRONEXPRESSION", expression)
    }

    pub fn retention_days(self, days: i32) -> Self {
        self.var("OFFEN_BACKUP_RETENTIONDAYS", &days.to_string())
    }

    pub fn filename(self, template: &str) -> Self {
        self.var("OFFEN_BACKUP_FILENAME", template)
    }

    pub fn archive(self, dir: &Path) -> Self {
        self.var("OFFEN_BACKUP_ARCHIVE", &dir.display().to_string())
    }

    pub fn sources(self, dir: &Path) -> Self {
        self.var("OFFEN_BACKUP_SOURCES", &dir.display().to_string())
    }

    pub fn notification_urls(self, urls: &[&str]) -> Self {
        self.var("OFFEN_NOTIFICATION_URLS", &urls.join(","))
    }

    pub fn notification_level(self, level: &str) -> Self {
        self.var("OFFEN_NOTIFICATION_LEVEL", level)
    }

    /// The variables as an environment context
    pub fn context(&self) -> EnvContext {
        EnvContext::from_pairs(self.vars.iter().map(|(k, v)| (k.as_str(), v.as_str())))
    }

    /// Decode the configuration, surfacing decode errors
    pub fn try_build(&self) -> Result<Config, ConfigError> {
        load_from_context(self.context(), &self.source)
    }

    /// Decode the configuration, panicking on decode errors
    pub fn build(&self) -> Config {
        self.try_build().expect("Failed to decode test configuration")
    }

    /// Write the variables as a dotenv file into `dir`
    pub fn write_dotenv(&self, dir: &Path, name: &str) -> PathBuf {
        fs::create_dir_all(dir).expect("Failed to create conf.d directory");
        let content: String = self
            .vars
            .iter()
            .map(|(k, v)| format!("{}=\"{}\"\n", k, v))
            .collect();
        let path = dir.join(name);
        fs::write(&path, content).expect("Failed to write dotenv file");
        path
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
