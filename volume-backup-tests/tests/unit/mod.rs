//! Unit tests for volume-backup
//!
//! Run with: cargo test -p volume-backup-tests --test unit

mod config;
mod notification;
mod storage;
