//! Volume Backup Library
//!
//! Scheduled backups of docker volumes to S3, WebDAV, SSH, Azure, Dropbox or
//! a local archive directory.

pub mod config;
pub mod managers;
pub mod storage;
pub mod utils;

// Re-export commonly used types
pub use config::{Config, ConfigLoader, ConfigStrategy};
pub use managers::logging::{init_console_logging, init_logging, LogGuard, LoggingConfig};
pub use managers::scheduler::{Scheduler, ScriptRunner};
pub use managers::script::{run_script, ScriptDependencies};
pub use storage::StorageBackend;
