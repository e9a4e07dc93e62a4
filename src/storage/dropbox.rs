//! Dropbox backend using the HTTP API
//!
//! A short-lived access token is exchanged from the configured refresh token
//! for every operation. Files above [`SINGLE_UPLOAD_LIMIT`] go through an
//! upload session.

use super::{
    do_prune, select_for_pruning, Artifact, LogFn, LogLevel, PrunePolicy, PruneStats, StorageBackend, StorageContext,
    StorageError,
};
use crate::config::DropboxConfig;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures::stream::{self, StreamExt};
use reqwest::{Body, Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::json;
use std::path::Path;
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tokio_util::io::ReaderStream;

const NAME: &str = "Dropbox";

/// Largest file sent in a single `files/upload` request
pub const SINGLE_UPLOAD_LIMIT: u64 = 150 * 1024 * 1024;

/// Chunk size for upload sessions
const CHUNK_SIZE: usize = 8 * 1024 * 1024;

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Debug, Deserialize)]
struct SessionStart {
    session_id: String,
}

#[derive(Debug, Deserialize)]
struct ListFolderResponse {
    entries: Vec<FolderEntry>,
    cursor: String,
    has_more: bool,
}

#[derive(Debug, Deserialize)]
struct FolderEntry {
    #[serde(rename = ".tag")]
    tag: String,
    name: String,
    path_display: Option<String>,
    server_modified: Option<String>,
}

/// One page of a folder listing
#[derive(Debug)]
pub struct ListingPage {
    pub files: Vec<Artifact>,
    pub cursor: Option<String>,
}

pub struct DropboxStorage {
    config: DropboxConfig,
    client: Client,
    log: LogFn,
}

impl DropboxStorage {
    pub fn new(config: DropboxConfig, log: LogFn) -> Result<Self, StorageError> {
        if config.refresh_token.is_empty() || config.app_key.is_empty() || config.app_secret.is_empty() {
            return Err(StorageError::new(
                NAME,
                "refresh token, app key and app secret are required to use the Dropbox backend",
            ));
        }
        let client = Client::builder()
            .connect_timeout(Duration::from_secs(30))
            .build()
            .storage_context(NAME, || "error creating HTTP client")?;

        Ok(Self { config, client, log })
    }

    /// Absolute Dropbox path for a file in the remote directory
    pub fn remote_file(&self, name: &str) -> String {
        let dir = self.config.remote_path.trim_matches('/');
        if dir.is_empty() {
            format!("/{}", name)
        } else {
            format!("/{}/{}", dir, name)
        }
    }

    fn remote_dir(&self) -> String {
        let dir = self.config.remote_path.trim_matches('/');
        if dir.is_empty() {
            String::new()
        } else {
            format!("/{}", dir)
        }
    }

    fn api(&self, route: &str) -> String {
        format!("{}2/{}", ensure_slash(&self.config.endpoint), route)
    }

    fn content(&self, route: &str) -> String {
        format!("{}2/{}", ensure_slash(&self.config.content_endpoint), route)
    }

    async fn access_token(&self) -> Result<String, StorageError> {
        let url = format!("{}oauth2/token", ensure_slash(&self.config.oauth2_endpoint));
        let response = self
            .client
            .post(&url)
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", self.config.refresh_token.as_str()),
                ("client_id", self.config.app_key.as_str()),
                ("client_secret", self.config.app_secret.as_str()),
            ])
            .send()
            .await
            .storage_context(NAME, || "error refreshing access token")?;

        let token: TokenResponse = decode(response, "refreshing access token").await?;
        Ok(token.access_token)
    }

    async fn rpc<T: DeserializeOwned>(&self, token: &str, route: &str, body: serde_json::Value) -> Result<T, StorageError> {
        let response = self
            .client
            .post(self.api(route))
            .bearer_auth(token)
            .json(&body)
            .send()
            .await
            .storage_context(NAME, || format!("error calling {}", route))?;
        decode(response, route).await
    }

    fn content_request(&self, token: &str, route: &str, arg: serde_json::Value) -> RequestBuilder {
        self.client
            .post(self.content(route))
            .bearer_auth(token)
            .header("Dropbox-API-Arg", arg.to_string())
            .header("Content-Type", "application/octet-stream")
    }

    async fn upload_single(&self, token: &str, file: &Path, remote: &str) -> Result<(), StorageError> {
        let handle = tokio::fs::File::open(file)
            .await
            .storage_context(NAME, || format!("error opening file {:?}", file))?;
        let response = self
            .content_request(token, "files/upload", json!({ "path": remote, "mode": "overwrite" }))
            .body(Body::wrap_stream(ReaderStream::new(handle)))
            .send()
            .await
            .storage_context(NAME, || format!("error uploading {}", remote))?;
        decode::<serde_json::Value>(response, "files/upload").await?;
        Ok(())
    }

    async fn upload_session(&self, token: &str, file: &Path, remote: &str) -> Result<(), StorageError> {
        let mut handle = tokio::fs::File::open(file)
            .await
            .storage_context(NAME, || format!("error opening file {:?}", file))?;

        let first = read_chunk(&mut handle).await?;
        let mut offset = first.len() as u64;
        let response = self
            .content_request(token, "files/upload_session/start", json!({ "close": false }))
            .body(first)
            .send()
            .await
            .storage_context(NAME, || "error starting upload session")?;
        let session: SessionStart = decode(response, "files/upload_session/start").await?;

        loop {
            let chunk = read_chunk(&mut handle).await?;
            if chunk.is_empty() {
                break;
            }
            let length = chunk.len() as u64;
            let arg = json!({
                "cursor": { "session_id": session.session_id, "offset": offset },
                "close": false,
            });
            let response = self
                .content_request(token, "files/upload_session/append_v2", arg)
                .body(chunk)
                .send()
                .await
                .storage_context(NAME, || format!("error appending to upload session at offset {}", offset))?;
            decode::<serde_json::Value>(response, "files/upload_session/append_v2").await?;
            offset += length;
        }

        let arg = json!({
            "cursor": { "session_id": session.session_id, "offset": offset },
            "commit": { "path": remote, "mode": "overwrite" },
        });
        let response = self
            .content_request(token, "files/upload_session/finish", arg)
            .body(Vec::new())
            .send()
            .await
            .storage_context(NAME, || "error finishing upload session")?;
        decode::<serde_json::Value>(response, "files/upload_session/finish").await?;
        Ok(())
    }

    async fn list(&self, token: &str) -> Result<Vec<Artifact>, StorageError> {
        let first: serde_json::Value = self
            .rpc(token, "files/list_folder", json!({ "path": self.remote_dir() }))
            .await?;
        let mut page = parse_listing(first)?;
        let mut files = std::mem::take(&mut page.files);

        while let Some(cursor) = page.cursor.take() {
            let next: serde_json::Value = self
                .rpc(token, "files/list_folder/continue", json!({ "cursor": cursor }))
                .await?;
            page = parse_listing(next)?;
            files.append(&mut page.files);
        }
        Ok(files)
    }

    async fn delete(&self, token: &str, artifacts: &[Artifact]) -> Result<(), StorageError> {
        let concurrency = self.config.concurrency_level.get() as usize;
        let deletions: Vec<_> = artifacts
            .iter()
            .map(|artifact| async move {
                self.rpc::<serde_json::Value>(token, "files/delete_v2", json!({ "path": artifact.name }))
                    .await
                    .err()
                    .map(|e| format!("{}: {}", artifact.name, e))
            })
            .collect();
        let failures: Vec<String> = stream::iter(deletions)
            .buffer_unordered(concurrency.max(1))
            .filter_map(|failure| async move { failure })
            .collect()
            .await;

        if failures.is_empty() {
            Ok(())
        } else {
            Err(StorageError::new(
                NAME,
                format!("{} error(s) deleting files: {}", failures.len(), failures.join(", ")),
            ))
        }
    }
}

fn ensure_slash(endpoint: &str) -> String {
    if endpoint.ends_with('/') {
        endpoint.to_string()
    } else {
        format!("{}/", endpoint)
    }
}

/// Fill a buffer of up to [`CHUNK_SIZE`] bytes, returning less only at end of file
async fn read_chunk(file: &mut tokio::fs::File) -> Result<Vec<u8>, StorageError> {
    let mut buffer = vec![0u8; CHUNK_SIZE];
    let mut filled = 0;
    while filled < CHUNK_SIZE {
        let read = file
            .read(&mut buffer[filled..])
            .await
            .storage_context(NAME, || "error reading archive")?;
        if read == 0 {
            break;
        }
        filled += read;
    }
    buffer.truncate(filled);
    Ok(buffer)
}

async fn decode<T: DeserializeOwned>(response: Response, what: &str) -> Result<T, StorageError> {
    let status = response.status();
    let body = response
        .text()
        .await
        .storage_context(NAME, || format!("error reading response of {}", what))?;
    if !status.is_success() {
        return Err(StorageError::new(NAME, format!("{} failed with status {}: {}", what, status, body)));
    }
    serde_json::from_str(&body).storage_context(NAME, || format!("error decoding response of {}", what))
}

/// Parse a `list_folder` result, keeping files only
pub fn parse_listing(value: serde_json::Value) -> Result<ListingPage, StorageError> {
    let response: ListFolderResponse =
        serde_json::from_value(value).storage_context(NAME, || "error decoding folder listing")?;

    let mut files = Vec::new();
    for entry in response.entries.into_iter().filter(|e| e.tag == "file") {
        let Some(stamp) = entry.server_modified.as_deref() else {
            continue;
        };
        let modified = DateTime::parse_from_rfc3339(stamp)
            .storage_context(NAME, || format!("invalid server_modified for {}", entry.name))?;
        files.push(Artifact {
            name: entry.path_display.unwrap_or(entry.name),
            modified: modified.with_timezone(&Utc),
        });
    }

    Ok(ListingPage {
        files,
        cursor: response.has_more.then_some(response.cursor),
    })
}

#[async_trait]
impl StorageBackend for DropboxStorage {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn copy(&self, file: &Path) -> Result<String, StorageError> {
        let name = file
            .file_name()
            .ok_or_else(|| StorageError::new(NAME, format!("{:?} has no file name", file)))?
            .to_string_lossy()
            .into_owned();
        let remote = self.remote_file(&name);
        let size = tokio::fs::metadata(file)
            .await
            .storage_context(NAME, || format!("error reading size of {:?}", file))?
            .len();

        let token = self.access_token().await?;
        if size <= SINGLE_UPLOAD_LIMIT {
            self.upload_single(&token, file, &remote).await?;
        } else {
            self.upload_session(&token, file, &remote).await?;
        }

        (self.log)(
            LogLevel::Info,
            NAME,
            &format!("Uploaded a copy of backup `{}` to Dropbox at path `{}`.", file.display(), remote),
        );
        Ok(remote)
    }

    async fn prune(&self, policy: &PrunePolicy, now: DateTime<Utc>) -> Result<PruneStats, StorageError> {
        let Some(deadline) = policy.deadline(now) else {
            return Ok(PruneStats::default());
        };

        let token = self.access_token().await?;
        let artifacts = self.list(&token).await?;
        let (total, matches) = select_for_pruning(policy, now, artifacts, |a| super::base_name(&a.name));

        do_prune(NAME, &self.log, matches.len(), total, deadline, || self.delete(&token, &matches)).await
    }
}
