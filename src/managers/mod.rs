//! Run orchestration: the backup pipeline, its hooks and the scheduler

pub mod hooks;
pub mod logging;
pub mod notification;
pub mod proxy;
pub mod scheduler;
pub mod script;
pub mod stats;
