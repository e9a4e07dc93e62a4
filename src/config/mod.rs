//! Configuration module for volume-backup
//!
//! Configurations are decoded from `OFFEN_`-prefixed variables. They can be
//! sourced in three ways:
//!
//! 1. The process environment (`from environment`)
//! 2. One dotenv file per job in `/etc/dockervolumebackup/conf.d`
//! 3. Labels on docker volumes (`docker-volume-backup.env.<VAR>`)
//!
//! Before decoding, legacy variable names and `FILE__` indirections are
//! rewritten into the canonical namespace; see [`compat`].
//!
//! ## Example Usage
//!
//! ```no_run
//! use volume_backup::config::{load_from_context, EnvContext};
//!
//! let ctx = EnvContext::from_pairs([("BACKUP_CRON_EXPRESSION", "0 2 * * *")]);
//! let config = load_from_context(ctx, "from environment")?;
//! assert_eq!(config.backup.cron_expression, "0 2 * * *");
//! # Ok::<(), volume_backup::config::ConfigError>(())
//! ```

pub mod compat;
mod context;
pub mod decoders;
pub mod env;
mod loader;
mod types;

pub use context::{parse_dotenv, EnvContext};
pub use decoders::{CertDecoder, CompressionType, DecodeError, NaturalNumber, RegexpDecoder, WholeNumber};
pub use loader::{
    load_from_context, ConfigError, ConfigLoader, ConfigStrategy, Result, DEFAULT_CONFD_DIR,
    LABEL_ENABLE, LABEL_ENV_PREFIX,
};
pub use types::*;

/// Expand tilde (~) in path
pub fn expand_tilde(path: &std::path::Path) -> std::path::PathBuf {
    if let Ok(stripped) = path.strip_prefix("~") {
        if let Some(home) = dirs::home_dir() {
            return home.join(stripped);
        }
    }
    path.to_path_buf()
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::path::PathBuf;

    #[test]
    fn test_expand_tilde() {
        let path = PathBuf::from("~/.ssh/id_ed25519");
        let expanded = expand_tilde(&path);
        assert!(!expanded.starts_with("~"));

        let path = PathBuf::from("/root/.ssh/id_rsa");
        assert_eq!(expand_tilde(&path), path);
    }
}
