pub mod archive;
pub mod command;
pub mod cron;
pub mod docker;
pub mod locker;

// Trait-based abstractions for testability
pub mod docker_ops;
pub mod executor;

// Re-export commonly used types and traits (used by test crate)
pub use archive::{Archiver, TarArchiver};
pub use docker_ops::{DockerOperations, RealDockerOps};
pub use executor::{CommandExecutor, RealExecutor};
