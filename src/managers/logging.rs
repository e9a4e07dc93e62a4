//! Logging setup and per-run log capture
//!
//! Provides dual-output logging:
//! - Console: plain or JSON lines on stderr
//! - File: optional daily rotated files when `LOG_DIRECTORY` is set
//!
//! [`RunLog`] mirrors everything a backup run logs into a buffer that ends
//! up in the run's notification.

use crate::storage::{LogFn, LogLevel};
use anyhow::{Context, Result};
use chrono::{Local, SecondsFormat};
use parking_lot::Mutex;
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tracing::Level;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_appender::rolling::{RollingFileAppender, Rotation};
use tracing_subscriber::fmt::format::FmtSpan;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::{fmt, EnvFilter, Layer};

const LOG_FILE_PREFIX: &str = "volume-backup";

/// Logging configuration
#[derive(Debug, Clone)]
pub struct LoggingConfig {
    /// Directory for rotated log files, console only when unset
    pub log_directory: Option<PathBuf>,
    pub log_level: Level,
    /// Maximum number of log files to keep
    pub max_files: u32,
    /// Emit JSON lines on the console
    pub json: bool,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            log_directory: None,
            log_level: Level::INFO,
            max_files: 10,
            json: false,
        }
    }
}

impl LoggingConfig {
    /// Read `LOG_DIRECTORY`, `LOG_LEVEL`, `LOG_FORMAT` and `LOG_MAX_FILES`
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            log_directory: std::env::var_os("LOG_DIRECTORY")
                .filter(|v| !v.is_empty())
                .map(PathBuf::from),
            log_level: std::env::var("LOG_LEVEL")
                .map(|v| parse_level(&v))
                .unwrap_or(defaults.log_level),
            max_files: std::env::var("LOG_MAX_FILES")
                .ok()
                .and_then(|v| v.parse().ok())
                .unwrap_or(defaults.max_files),
            json: std::env::var("LOG_FORMAT").is_ok_and(|v| v.eq_ignore_ascii_case("json")),
        }
    }
}

fn parse_level(value: &str) -> Level {
    match value.to_lowercase().as_str() {
        "trace" => Level::TRACE,
        "debug" => Level::DEBUG,
        "warn" | "warning" => Level::WARN,
        "error" => Level::ERROR,
        _ => Level::INFO,
    }
}

/// Initialize logging with console and optional file output
///
/// Returns a guard that must be kept alive for the duration of the program.
/// When the guard is dropped, any remaining logs are flushed to disk.
pub fn init_logging(config: &LoggingConfig) -> Result<LogGuard> {
    let console_layer = if config.json {
        fmt::layer()
            .json()
            .with_writer(std::io::stderr)
            .with_span_events(FmtSpan::NONE)
            .with_filter(level_filter(config.log_level))
            .boxed()
    } else {
        fmt::layer()
            .with_writer(std::io::stderr)
            .with_target(false)
            .with_level(true)
            .with_span_events(FmtSpan::NONE)
            .with_filter(level_filter(config.log_level))
            .boxed()
    };

    let mut file_guard = None;
    let file_layer = match &config.log_directory {
        Some(dir) => {
            let log_dir = crate::config::expand_tilde(dir);
            fs::create_dir_all(&log_dir)
                .with_context(|| format!("Failed to create log directory: {:?}", log_dir))?;

            let appender = RollingFileAppender::new(Rotation::DAILY, &log_dir, format!("{}.log", LOG_FILE_PREFIX));
            let (non_blocking, guard) = tracing_appender::non_blocking(appender);
            file_guard = Some(guard);
            cleanup_old_logs(&log_dir, config.max_files)?;

            Some(
                fmt::layer()
                    .with_writer(non_blocking)
                    .with_ansi(false)
                    .with_target(true)
                    .with_filter(level_filter(Level::DEBUG.max(config.log_level))),
            )
        }
        None => None,
    };

    tracing_subscriber::registry()
        .with(console_layer)
        .with(file_layer)
        .try_init()
        .context("Failed to initialize logging")?;

    Ok(LogGuard {
        _file_guard: file_guard,
    })
}

/// Initialize simple console-only logging (for when config isn't available)
pub fn init_console_logging() {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));

    let _ = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_level(true)
        .try_init();
}

/// Create a level filter for tracing layers
fn level_filter(level: Level) -> EnvFilter {
    EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level.as_str().to_lowercase()))
}

/// Cleanup old log files, keeping only the most recent N files
fn cleanup_old_logs(log_dir: &Path, max_files: u32) -> Result<()> {
    let mut log_files: Vec<_> = fs::read_dir(log_dir)?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_name().to_string_lossy().starts_with(LOG_FILE_PREFIX))
        .collect();

    // Sort by modification time (newest first)
    log_files.sort_by(|a, b| {
        let a_time = a.metadata().and_then(|m| m.modified()).ok();
        let b_time = b.metadata().and_then(|m| m.modified()).ok();
        b_time.cmp(&a_time)
    });

    for file in log_files.into_iter().skip(max_files as usize) {
        if let Err(e) = fs::remove_file(file.path()) {
            tracing::warn!("Failed to remove old log file {:?}: {}", file.path(), e);
        } else {
            tracing::debug!("Removed old log file: {:?}", file.path());
        }
    }

    Ok(())
}

/// Guard that keeps the logging system alive
///
/// When dropped, flushes any remaining logs to disk.
pub struct LogGuard {
    _file_guard: Option<WorkerGuard>,
}

/// Log sink for one backup run
///
/// Every line goes to `tracing` and is also appended to an in-memory buffer
/// that notification templates see as `.Stats.LogOutput`.
#[derive(Clone)]
pub struct RunLog {
    source: Arc<str>,
    buffer: Arc<Mutex<String>>,
}

impl RunLog {
    pub fn new(source: &str) -> Self {
        Self {
            source: Arc::from(source),
            buffer: Arc::new(Mutex::new(String::new())),
        }
    }

    pub fn info(&self, message: impl AsRef<str>) {
        let message = message.as_ref();
        tracing::info!(source = %self.source, "{}", message);
        self.append("INFO", message, None);
    }

    pub fn warn(&self, message: impl AsRef<str>) {
        let message = message.as_ref();
        tracing::warn!(source = %self.source, "{}", message);
        self.append("WARN", message, None);
    }

    pub fn error(&self, message: impl AsRef<str>) {
        let message = message.as_ref();
        tracing::error!(source = %self.source, "{}", message);
        self.append("ERROR", message, None);
    }

    /// Everything captured so far
    pub fn output(&self) -> String {
        self.buffer.lock().clone()
    }

    /// Sink handed to storage backends
    pub fn storage_sink(&self) -> LogFn {
        let log = self.clone();
        Arc::new(move |level, backend, message| {
            let label = match level {
                LogLevel::Info => {
                    tracing::info!(source = %log.source, storage = backend, "{}", message);
                    "INFO"
                }
                LogLevel::Warning => {
                    tracing::warn!(source = %log.source, storage = backend, "{}", message);
                    "WARN"
                }
                LogLevel::Error => {
                    tracing::error!(source = %log.source, storage = backend, "{}", message);
                    "ERROR"
                }
            };
            log.append(label, message, Some(backend));
        })
    }

    fn append(&self, level: &str, message: &str, storage: Option<&str>) {
        let mut buffer = self.buffer.lock();
        let _ = write!(
            buffer,
            "time={} level={} msg={:?}",
            Local::now().to_rfc3339_opts(SecondsFormat::Millis, false),
            level,
            message
        );
        if let Some(storage) = storage {
            let _ = write!(buffer, " storage={}", storage);
        }
        buffer.push('\n');
    }
}
