//! End-to-end runs against mocked docker, storage and notifiers
//!
//! Run with: cargo test -p volume-backup-tests --test commands

mod pipeline;
mod proxy;
mod scheduler;
