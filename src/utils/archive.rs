//! Archive creation and encryption through external tools
//!
//! The source directory is walked up front so the exclude pattern can be
//! applied per path; the resulting list is handed to `tar`, which compresses
//! with `gzip`, `pigz` or `zstd` depending on the configuration.

use super::command::{is_available, CommandOptions};
use super::executor::CommandExecutor;
use crate::config::CompressionType;
use anyhow::{Context, Result};
use async_trait::async_trait;
use regex::Regex;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tracing::{debug, info};
use walkdir::WalkDir;

/// Upper bound for a single archive or encryption invocation
const ARCHIVE_TIMEOUT: Duration = Duration::from_secs(24 * 60 * 60);

/// Everything needed to produce one archive
#[derive(Debug, Clone)]
pub struct ArchiveRequest {
    pub sources: PathBuf,
    pub target: PathBuf,
    pub compression: CompressionType,
    /// Compression threads, 0 uses every core
    pub parallelism: u32,
    pub exclude: Option<Regex>,
}

/// Creates compressed archives of a directory tree
#[async_trait]
pub trait Archiver: Send + Sync {
    async fn create(&self, request: &ArchiveRequest) -> Result<()>;

    /// Symmetrically encrypt `input`, returning the path of the encrypted file
    async fn encrypt(&self, input: &Path, passphrase: &str) -> Result<PathBuf>;
}

/// `tar`/`gpg` based archiver
pub struct TarArchiver {
    executor: Arc<dyn CommandExecutor>,
    pigz_available: bool,
}

impl TarArchiver {
    pub fn new(executor: Arc<dyn CommandExecutor>) -> Self {
        Self {
            executor,
            pigz_available: is_available("pigz"),
        }
    }

    /// Override tool detection, mostly useful in tests
    pub fn with_pigz(mut self, available: bool) -> Self {
        self.pigz_available = available;
        self
    }
}

#[async_trait]
impl Archiver for TarArchiver {
    async fn create(&self, request: &ArchiveRequest) -> Result<()> {
        let (root, files) = collect_files(&request.sources, request.exclude.as_ref())?;
        debug!(
            files = files.len(),
            "Collected files below {:?}", request.sources
        );

        let list_path = request.target.with_extension("files");
        let mut listing = files
            .iter()
            .map(|p| p.to_string_lossy().into_owned())
            .collect::<Vec<_>>()
            .join("\n");
        listing.push('\n');
        tokio::fs::write(&list_path, listing)
            .await
            .with_context(|| format!("Failed to write file list {:?}", list_path))?;

        let program = compress_program(request.compression, request.parallelism, self.pigz_available);
        let args = vec![
            "--create".to_string(),
            "--file".to_string(),
            request.target.to_string_lossy().into_owned(),
            "--use-compress-program".to_string(),
            program,
            "--directory".to_string(),
            root.to_string_lossy().into_owned(),
            "--no-recursion".to_string(),
            "--verbatim-files-from".to_string(),
            "--files-from".to_string(),
            list_path.to_string_lossy().into_owned(),
        ];

        let result = self
            .executor
            .run("tar", &args, &CommandOptions::new().timeout(ARCHIVE_TIMEOUT))
            .await
            .with_context(|| format!("Failed to create archive {:?}", request.target));

        if let Err(e) = tokio::fs::remove_file(&list_path).await {
            debug!("Failed to remove file list {:?}: {}", list_path, e);
        }
        result?;

        info!("Created backup of {:?} at {:?}", request.sources, request.target);
        Ok(())
    }

    async fn encrypt(&self, input: &Path, passphrase: &str) -> Result<PathBuf> {
        let mut output = input.as_os_str().to_owned();
        output.push(".gpg");
        let output = PathBuf::from(output);

        let args = vec![
            "--batch".to_string(),
            "--yes".to_string(),
            "--symmetric".to_string(),
            "--cipher-algo".to_string(),
            "AES256".to_string(),
            "--pinentry-mode".to_string(),
            "loopback".to_string(),
            "--passphrase-fd".to_string(),
            "0".to_string(),
            "--output".to_string(),
            output.to_string_lossy().into_owned(),
            input.to_string_lossy().into_owned(),
        ];
        let opts = CommandOptions::new()
            .timeout(ARCHIVE_TIMEOUT)
            .stdin(passphrase.as_bytes().to_vec());

        self.executor
            .run("gpg", &args, &opts)
            .await
            .with_context(|| format!("Failed to encrypt {:?}", input))?;

        info!("Encrypted backup using given passphrase, saving as {:?}", output);
        Ok(output)
    }
}

/// Compression program handed to `tar --use-compress-program`
pub fn compress_program(compression: CompressionType, parallelism: u32, pigz_available: bool) -> String {
    match compression {
        CompressionType::Zst => format!("zstd -T{}", parallelism),
        CompressionType::Gz if parallelism == 1 || !pigz_available => "gzip".to_string(),
        CompressionType::Gz if parallelism == 0 => "pigz".to_string(),
        CompressionType::Gz => format!("pigz -p {}", parallelism),
    }
}

/// Walk `sources` and return the parent directory plus every entry relative to it
///
/// Entries whose absolute path matches `exclude` are skipped; an excluded
/// directory is not descended into.
pub fn collect_files(sources: &Path, exclude: Option<&Regex>) -> Result<(PathBuf, Vec<PathBuf>)> {
    let root = sources
        .parent()
        .map(Path::to_path_buf)
        .unwrap_or_else(|| PathBuf::from("/"));

    let walker = WalkDir::new(sources)
        .follow_links(false)
        .sort_by_file_name()
        .into_iter()
        .filter_entry(|entry| match exclude {
            Some(re) => !re.is_match(&entry.path().to_string_lossy()),
            None => true,
        });

    let mut files = Vec::new();
    for entry in walker {
        let entry = entry.with_context(|| format!("Failed to walk {:?}", sources))?;
        let relative = entry
            .path()
            .strip_prefix(&root)
            .with_context(|| format!("{:?} is outside of {:?}", entry.path(), root))?;
        files.push(relative.to_path_buf());
    }

    Ok((root, files))
}
