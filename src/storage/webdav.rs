//! WebDAV backend over HTTP

use super::{
    do_prune, select_for_pruning, Artifact, LogFn, LogLevel, PrunePolicy, PruneStats, StorageBackend, StorageContext,
    StorageError,
};
use crate::config::WebdavConfig;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use quick_xml::events::Event;
use quick_xml::Reader;
use reqwest::{Body, Client, Method, RequestBuilder, StatusCode, Url};
use std::collections::HashMap;
use std::path::Path;
use std::time::Duration;
use tokio_util::io::ReaderStream;

const NAME: &str = "WebDAV";

const PROPFIND_BODY: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<d:propfind xmlns:d="DAV:"><d:prop><d:resourcetype/><d:getlastmodified/></d:prop></d:propfind>"#;

/// One `<response>` of a multistatus document
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct DavEntry {
    pub href: String,
    pub modified: Option<DateTime<Utc>>,
    pub is_collection: bool,
}

pub struct WebdavStorage {
    config: WebdavConfig,
    client: Client,
    log: LogFn,
}

impl WebdavStorage {
    pub fn new(config: WebdavConfig, log: LogFn) -> Result<Self, StorageError> {
        if config.url.is_empty() {
            return Err(StorageError::new(NAME, "URL is required to use the WebDAV backend"));
        }
        let client = Client::builder()
            .danger_accept_invalid_certs(config.url_insecure)
            .connect_timeout(Duration::from_secs(30))
            .build()
            .storage_context(NAME, || "error creating HTTP client")?;

        Ok(Self { config, client, log })
    }

    /// URL of the configured remote directory, always ending in a slash
    pub fn directory_url(&self) -> String {
        let base = self.config.url.trim_end_matches('/');
        let path = self.config.path.trim_matches('/');
        if path.is_empty() {
            format!("{}/", base)
        } else {
            format!("{}/{}/", base, path)
        }
    }

    fn request(&self, method: Method, url: &str) -> RequestBuilder {
        let builder = self.client.request(method, url);
        if self.config.username.is_empty() {
            builder
        } else {
            builder.basic_auth(&self.config.username, Some(&self.config.password))
        }
    }

    async fn make_collections(&self) -> Result<(), StorageError> {
        let mkcol = Method::from_bytes(b"MKCOL").storage_context(NAME, || "invalid method")?;
        let base = self.config.url.trim_end_matches('/');
        let mut current = String::new();

        for segment in self.config.path.split('/').filter(|s| !s.is_empty()) {
            current.push('/');
            current.push_str(segment);
            let url = format!("{}{}/", base, current);
            let response = self
                .request(mkcol.clone(), &url)
                .send()
                .await
                .storage_context(NAME, || format!("error creating directory {}", url))?;

            let status = response.status();
            if !(status.is_success() || status == StatusCode::METHOD_NOT_ALLOWED || status.is_redirection()) {
                return Err(StorageError::new(
                    NAME,
                    format!("error creating directory {}: {}", url, status),
                ));
            }
        }
        Ok(())
    }

    async fn list(&self) -> Result<Vec<DavEntry>, StorageError> {
        let propfind = Method::from_bytes(b"PROPFIND").storage_context(NAME, || "invalid method")?;
        let url = self.directory_url();
        let response = self
            .request(propfind, &url)
            .header("Depth", "1")
            .header("Content-Type", "application/xml")
            .body(PROPFIND_BODY)
            .send()
            .await
            .storage_context(NAME, || format!("error looking up candidates from {}", url))?;

        let status = response.status();
        if !status.is_success() {
            return Err(StorageError::new(NAME, format!("listing {} failed with status {}", url, status)));
        }
        let body = response
            .text()
            .await
            .storage_context(NAME, || "error reading PROPFIND response")?;
        parse_multistatus(&body)
    }

    async fn delete(&self, artifacts: &[Artifact]) -> Result<(), StorageError> {
        let base = Url::parse(&self.config.url).storage_context(NAME, || "invalid WebDAV URL")?;
        let mut failures = Vec::new();

        for artifact in artifacts {
            let url = base
                .join(&artifact.name)
                .storage_context(NAME, || format!("invalid href {}", artifact.name))?;
            match self.request(Method::DELETE, url.as_str()).send().await {
                Ok(response) if response.status().is_success() => {}
                Ok(response) => failures.push(format!("{}: {}", artifact.name, response.status())),
                Err(e) => failures.push(format!("{}: {}", artifact.name, e)),
            }
        }

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

/// Parse a PROPFIND multistatus document
pub fn parse_multistatus(xml: &str) -> Result<Vec<DavEntry>, StorageError> {
    let mut reader = Reader::from_str(xml);
    reader.trim_text(true);

    let mut entries = Vec::new();
    let mut entry: Option<DavEntry> = None;
    let mut current: Vec<u8> = Vec::new();

    loop {
        match reader.read_event() {
            Ok(Event::Start(e)) => {
                let name = e.local_name().as_ref().to_vec();
                match name.as_slice() {
                    b"response" => entry = Some(DavEntry::default()),
                    b"collection" => {
                        if let Some(entry) = entry.as_mut() {
                            entry.is_collection = true;
                        }
                    }
                    _ => {}
                }
                current = name;
            }
            Ok(Event::Empty(e)) => {
                if e.local_name().as_ref() == b"collection" {
                    if let Some(entry) = entry.as_mut() {
                        entry.is_collection = true;
                    }
                }
            }
            Ok(Event::Text(t)) => {
                let Some(entry) = entry.as_mut() else { continue };
                let text = t
                    .unescape()
                    .storage_context(NAME, || "invalid text in PROPFIND response")?;
                match current.as_slice() {
                    b"href" => entry.href = text.into_owned(),
                    b"getlastmodified" => {
                        let modified = DateTime::parse_from_rfc2822(&text)
                            .storage_context(NAME, || format!("invalid getlastmodified `{}`", text))?;
                        entry.modified = Some(modified.with_timezone(&Utc));
                    }
                    _ => {}
                }
            }
            Ok(Event::End(e)) => {
                if e.local_name().as_ref() == b"response" {
                    if let Some(done) = entry.take() {
                        entries.push(done);
                    }
                }
                current.clear();
            }
            Ok(Event::Eof) => break,
            Ok(_) => {}
            Err(e) => {
                return Err(StorageError::with_source(
                    NAME,
                    format!("malformed PROPFIND response at position {}", reader.buffer_position()),
                    e,
                ))
            }
        }
    }

    Ok(entries)
}

/// Decode `%XX` escapes in an href segment
fn percent_decode(input: &str) -> String {
    let bytes = input.as_bytes();
    let mut out = Vec::with_capacity(bytes.len());
    let mut i = 0;
    while i < bytes.len() {
        if bytes[i] == b'%' && i + 2 < bytes.len() {
            let decoded = std::str::from_utf8(&bytes[i + 1..i + 3])
                .ok()
                .and_then(|hex| u8::from_str_radix(hex, 16).ok());
            if let Some(byte) = decoded {
                out.push(byte);
                i += 3;
                continue;
            }
        }
        out.push(bytes[i]);
        i += 1;
    }
    String::from_utf8_lossy(&out).into_owned()
}

fn file_name(href: &str) -> String {
    percent_decode(href.trim_end_matches('/').rsplit('/').next().unwrap_or_default())
}

#[async_trait]
impl StorageBackend for WebdavStorage {
    fn name(&self) -> &'static str {
        NAME
    }

    async fn copy(&self, file: &Path) -> Result<String, StorageError> {
        let name = file
            .file_name()
            .ok_or_else(|| StorageError::new(NAME, format!("{:?} has no file name", file)))?
            .to_string_lossy()
            .into_owned();

        self.make_collections().await?;

        let handle = tokio::fs::File::open(file)
            .await
            .storage_context(NAME, || format!("error opening file {:?}", file))?;
        let length = handle
            .metadata()
            .await
            .storage_context(NAME, || format!("error reading size of {:?}", file))?
            .len();

        let url = format!("{}{}", self.directory_url(), name);
        let response = self
            .request(Method::PUT, &url)
            .header("Content-Length", length)
            .body(Body::wrap_stream(ReaderStream::new(handle)))
            .send()
            .await
            .storage_context(NAME, || format!("error uploading the file to WebDAV server {}", url))?;

        let status = response.status();
        if !status.is_success() {
            return Err(StorageError::new(NAME, format!("uploading {} failed with status {}", url, status)));
        }

        (self.log)(
            LogLevel::Info,
            NAME,
            &format!(
                "Uploaded a copy of backup `{}` to WebDAV URL `{}` at path `{}`.",
                file.display(),
                self.config.url,
                self.config.path
            ),
        );
        Ok(url)
    }

    async fn prune(&self, policy: &PrunePolicy, now: DateTime<Utc>) -> Result<PruneStats, StorageError> {
        let Some(deadline) = policy.deadline(now) else {
            return Ok(PruneStats::default());
        };

        // Artifacts are named by their decoded file name, hrefs are kept for deletion
        let mut hrefs = HashMap::new();
        let artifacts: Vec<Artifact> = self
            .list()
            .await?
            .into_iter()
            .filter(|e| !e.is_collection)
            .filter_map(|e| {
                let modified = e.modified?;
                let name = file_name(&e.href);
                hrefs.insert(name.clone(), e.href);
                Some(Artifact { name, modified })
            })
            .collect();

        let (total, matches) = select_for_pruning(policy, now, artifacts, |a| a.name.as_str());
        let targets: Vec<Artifact> = matches
            .iter()
            .filter_map(|a| {
                hrefs.get(&a.name).map(|href| Artifact {
                    name: href.clone(),
                    modified: a.modified,
                })
            })
            .collect();

        do_prune(NAME, &self.log, matches.len(), total, deadline, || self.delete(&targets)).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::tracing_log;

    const MULTISTATUS: &str = r#"<?xml version="1.0" encoding="utf-8"?>
<d:multistatus xmlns:d="DAV:">
  <d:response>
    <d:href>/remote.php/dav/files/backup/</d:href>
    <d:propstat>
      <d:prop>
        <d:resourcetype><d:collection/></d:resourcetype>
        <d:getlastmodified>Mon, 01 Jan 2024 00:00:00 GMT</d:getlastmodified>
      </d:prop>
      <d:status>HTTP/1.1 200 OK</d:status>
    </d:propstat>
  </d:response>
  <d:response>
    <d:href>/remote.php/dav/files/backup/backup-2024-01-01.tar.gz</d:href>
    <d:propstat>
      <d:prop>
        <d:resourcetype/>
        <d:getlastmodified>Mon, 01 Jan 2024 02:00:00 GMT</d:getlastmodified>
      </d:prop>
    </d:propstat>
  </d:response>
  <d:response>
    <d:href>/remote.php/dav/files/backup/backup%202024.tar.gz</d:href>
    <d:propstat>
      <d:prop>
        <d:resourcetype/>
        <d:getlastmodified>Fri, 01 Mar 2024 02:00:00 GMT</d:getlastmodified>
      </d:prop>
    </d:propstat>
  </d:response>
</d:multistatus>"#;

    #[test]
    fn test_parse_multistatus() {
        let entries = parse_multistatus(MULTISTATUS).unwrap();
        assert_eq!(entries.len(), 3);
        assert!(entries[0].is_collection);
        assert!(!entries[1].is_collection);
        assert_eq!(entries[1].href, "/remote.php/dav/files/backup/backup-2024-01-01.tar.gz");
        assert_eq!(
            entries[1].modified.unwrap().to_rfc3339(),
            "2024-01-01T02:00:00+00:00"
        );
    }

    #[test]
    fn test_parse_multistatus_rejects_garbage() {
        assert!(parse_multistatus("<d:multistatus><d:response></d:multistatus>").is_err());
    }

    #[test]
    fn test_file_name_decodes_href() {
        assert_eq!(file_name("/dav/backup%202024.tar.gz"), "backup 2024.tar.gz");
        assert_eq!(file_name("/dav/dir/"), "dir");
        assert_eq!(file_name("/dav/100%"), "100%");
    }

    #[test]
    fn test_directory_url() {
        let storage = WebdavStorage::new(
            WebdavConfig {
                url: "https://cloud.example.com/remote.php/dav/files/backup/".to_string(),
                path: "/volumes/app/".to_string(),
                ..WebdavConfig::default()
            },
            tracing_log(),
        )
        .unwrap();
        assert_eq!(
            storage.directory_url(),
            "https://cloud.example.com/remote.php/dav/files/backup/volumes/app/"
        );
    }

    #[test]
    fn test_missing_url_is_rejected() {
        assert!(WebdavStorage::new(WebdavConfig::default(), tracing_log()).is_err());
    }
}
