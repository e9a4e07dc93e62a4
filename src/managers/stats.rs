//! Run statistics exposed to notification templates

use chrono::{DateTime, Local};
use serde::{Serialize, Serializer};
use std::collections::BTreeMap;
use std::time::Duration;

/// Names of every storage backend, each gets an entry in [`Stats::storages`]
pub const STORAGE_NAMES: [&str; 6] = ["S3", "WebDAV", "SSH", "Local", "Azure", "Dropbox"];

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ContainersStats {
    pub all: usize,
    pub to_stop: usize,
    pub stopped: usize,
    pub restart_errors: usize,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct BackupFileStats {
    pub name: String,
    pub full_path: String,
    pub size: u64,
}

#[derive(Debug, Clone, Default, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct StorageStats {
    /// Where the archive was stored, empty if the copy did not happen
    pub location: String,
    pub store_error: Option<String>,
    pub total: usize,
    pub pruned: usize,
    pub pruning_error: Option<String>,
}

/// Statistics collected over one backup run
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct Stats {
    pub start_time: DateTime<Local>,
    pub end_time: Option<DateTime<Local>>,
    #[serde(serialize_with = "human_duration")]
    pub took_time: Duration,
    #[serde(serialize_with = "human_duration")]
    pub lock_wait: Duration,
    pub log_output: String,
    pub containers: ContainersStats,
    pub backup_file: BackupFileStats,
    pub storages: BTreeMap<String, StorageStats>,
}

impl Stats {
    pub fn new(start_time: DateTime<Local>) -> Self {
        Self {
            start_time,
            end_time: None,
            took_time: Duration::ZERO,
            lock_wait: Duration::ZERO,
            log_output: String::new(),
            containers: ContainersStats::default(),
            backup_file: BackupFileStats::default(),
            storages: STORAGE_NAMES
                .iter()
                .map(|name| (name.to_string(), StorageStats::default()))
                .collect(),
        }
    }

    /// Stamp the end of the run
    pub fn finish(&mut self, end_time: DateTime<Local>) {
        self.end_time = Some(end_time);
        self.took_time = (end_time - self.start_time).to_std().unwrap_or(Duration::ZERO);
    }

    pub fn storage_mut(&mut self, name: &str) -> &mut StorageStats {
        self.storages.entry(name.to_string()).or_default()
    }
}

fn human_duration<S: Serializer>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
    serializer.serialize_str(&format_duration(duration.as_secs()))
}

/// Format seconds into a human-readable duration
pub fn format_duration(seconds: u64) -> String {
    if seconds < 60 {
        format!("{}s", seconds)
    } else if seconds < 3600 {
        let minutes = seconds / 60;
        let secs = seconds % 60;
        if secs == 0 {
            format!("{}m", minutes)
        } else {
            format!("{}m {}s", minutes, secs)
        }
    } else {
        let hours = seconds / 3600;
        let minutes = (seconds % 3600) / 60;
        if minutes == 0 {
            format!("{}h", hours)
        } else {
            format!("{}h {}m", hours, minutes)
        }
    }
}
