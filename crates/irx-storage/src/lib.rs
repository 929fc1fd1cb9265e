//! HTTP fetch + atomic output file utilities for IRX.

use std::fs;
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};
use tempfile::NamedTempFile;
use thiserror::Error;
use tracing::{debug, info_span, Instrument};

pub const CRATE_NAME: &str = "irx-storage";

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request to {url} failed: {source}")]
    Request {
        url: String,
        #[source]
        source: reqwest::Error,
    },
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("response from {url} is not valid JSON: {source}")]
    Decode {
        url: String,
        #[source]
        source: serde_json::Error,
    },
}

impl FetchError {
    pub fn url(&self) -> &str {
        match self {
            Self::Request { url, .. } | Self::HttpStatus { url, .. } | Self::Decode { url, .. } => {
                url
            }
        }
    }
}

/// Anything that can answer a GET with a JSON document.
#[async_trait]
pub trait JsonSource: Send + Sync {
    async fn get_json(&self, url: &str) -> Result<JsonValue, FetchError>;
}

#[derive(Debug, Clone, Default)]
pub struct HttpClientConfig {
    /// `None` keeps reqwest's default (no overall request timeout).
    pub timeout: Option<Duration>,
    pub user_agent: Option<String>,
}

/// Single-shot GET client: no retries, non-2xx is an error.
#[derive(Debug, Clone)]
pub struct HttpFetcher {
    client: reqwest::Client,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder().gzip(true).brotli(true);

        if let Some(timeout) = config.timeout {
            builder = builder.timeout(timeout);
        }
        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self { client })
    }

    /// Body of a non-JSON page (e.g. the collection browse page).
    pub async fn get_text(&self, url: &str) -> Result<String, FetchError> {
        let span = info_span!("http_fetch_text", url);
        async {
            let resp = self
                .client
                .get(url)
                .send()
                .await
                .map_err(|source| FetchError::Request {
                    url: url.to_string(),
                    source,
                })?;
            let status = resp.status();
            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: url.to_string(),
                });
            }
            resp.text().await.map_err(|source| FetchError::Request {
                url: url.to_string(),
                source,
            })
        }
        .instrument(span)
        .await
    }
}

#[async_trait]
impl JsonSource for HttpFetcher {
    async fn get_json(&self, url: &str) -> Result<JsonValue, FetchError> {
        let span = info_span!("http_fetch", url);
        async {
            let resp = self
                .client
                .get(url)
                .send()
                .await
                .map_err(|source| FetchError::Request {
                    url: url.to_string(),
                    source,
                })?;

            let status = resp.status();
            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: url.to_string(),
                });
            }

            let body = resp.bytes().await.map_err(|source| FetchError::Request {
                url: url.to_string(),
                source,
            })?;
            debug!(status = status.as_u16(), bytes = body.len(), "response received");

            serde_json::from_slice(&body).map_err(|source| FetchError::Decode {
                url: url.to_string(),
                source,
            })
        }
        .instrument(span)
        .await
    }
}

/// Row encoding for delimited output. Fields are quoted only when needed.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DelimitedFormat {
    pub delimiter: u8,
}

impl DelimitedFormat {
    pub fn new(delimiter: u8) -> Self {
        Self { delimiter }
    }

    /// One record, newline terminated.
    pub fn encode_row<I, S>(&self, fields: I) -> Result<Vec<u8>, csv::Error>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<[u8]>,
    {
        let mut writer = csv::WriterBuilder::new()
            .delimiter(self.delimiter)
            .quote_style(csv::QuoteStyle::Necessary)
            .terminator(csv::Terminator::Any(b'\n'))
            .from_writer(Vec::new());
        writer.write_record(fields)?;
        writer
            .into_inner()
            .map_err(|err| csv::Error::from(err.into_error()))
    }

    pub fn file_extension(&self) -> &'static str {
        match self.delimiter {
            b'\t' => "tsv",
            _ => "csv",
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StoredOutput {
    pub path: PathBuf,
    pub byte_size: usize,
    pub sha256: String,
}

/// Writes into a temp file beside the destination and renames it into place on
/// `finish`. Dropping it unfinished deletes the temp file.
pub struct AtomicOutputFile {
    writer: BufWriter<NamedTempFile>,
    hasher: Sha256,
    byte_size: usize,
    final_path: PathBuf,
}

impl AtomicOutputFile {
    pub fn create(final_path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let final_path = final_path.as_ref().to_path_buf();
        let parent = final_path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        let temp = NamedTempFile::new_in(parent)
            .with_context(|| format!("creating temp file in {}", parent.display()))?;
        Ok(Self {
            writer: BufWriter::new(temp),
            hasher: Sha256::new(),
            byte_size: 0,
            final_path,
        })
    }

    pub fn write_bytes(&mut self, bytes: &[u8]) -> anyhow::Result<()> {
        self.writer
            .write_all(bytes)
            .with_context(|| format!("writing temp file for {}", self.final_path.display()))?;
        self.hasher.update(bytes);
        self.byte_size += bytes.len();
        Ok(())
    }

    pub fn final_path(&self) -> &Path {
        &self.final_path
    }

    pub fn finish(self) -> anyhow::Result<StoredOutput> {
        let Self {
            writer,
            hasher,
            byte_size,
            final_path,
        } = self;
        let temp = writer
            .into_inner()
            .map_err(|err| err.into_error())
            .with_context(|| format!("flushing temp file for {}", final_path.display()))?;
        temp.persist(&final_path)
            .with_context(|| format!("persisting {}", final_path.display()))?;
        Ok(StoredOutput {
            path: final_path,
            byte_size,
            sha256: hex::encode(hasher.finalize()),
        })
    }
}

/// Output directory for one session; created on first write.
#[derive(Debug, Clone)]
pub struct OutputStore {
    root: PathBuf,
}

impl OutputStore {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn ensure_root(&self) -> anyhow::Result<()> {
        fs::create_dir_all(&self.root)
            .with_context(|| format!("creating output directory {}", self.root.display()))
    }

    pub fn path_for(&self, file_name: &str) -> PathBuf {
        self.root.join(file_name)
    }

    pub fn create_file(&self, file_name: &str) -> anyhow::Result<AtomicOutputFile> {
        self.ensure_root()?;
        AtomicOutputFile::create(self.path_for(file_name))
    }

    pub fn store_bytes(&self, file_name: &str, bytes: &[u8]) -> anyhow::Result<StoredOutput> {
        let mut file = self.create_file(file_name)?;
        file.write_bytes(bytes)?;
        file.finish()
    }

    /// Returns whether a file was removed.
    pub fn remove_if_exists(&self, file_name: &str) -> anyhow::Result<bool> {
        let path = self.path_for(file_name);
        match fs::remove_file(&path) {
            Ok(()) => Ok(true),
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(false),
            Err(err) => Err(err).with_context(|| format!("removing {}", path.display())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn output_hashing_is_stable() {
        let hash = OutputStore::sha256_hex(b"hello world");
        assert_eq!(
            hash,
            "b94d27b9934d3e08a52e52d7da7dabfac484efe37a5380ee9088f7ace2efcde9"
        );
    }

    #[test]
    fn encode_row_quotes_only_when_needed() {
        let pipe = DelimitedFormat::new(b'|');
        assert_eq!(pipe.encode_row(["1", "A"]).unwrap(), b"1|A\n".to_vec());
        assert_eq!(
            pipe.encode_row(["1", "left|right"]).unwrap(),
            b"1|\"left|right\"\n".to_vec()
        );
        assert_eq!(
            pipe.encode_row(["say \"hi\"", "x"]).unwrap(),
            b"\"say \"\"hi\"\"\"|x\n".to_vec()
        );

        let tab = DelimitedFormat::new(b'\t');
        assert_eq!(tab.encode_row(["a,b", "c"]).unwrap(), b"a,b\tc\n".to_vec());
        assert_eq!(tab.file_extension(), "tsv");
        assert_eq!(pipe.file_extension(), "csv");
    }

    #[test]
    fn store_bytes_creates_root_and_reports_hash() {
        let dir = tempdir().expect("tempdir");
        let store = OutputStore::new(dir.path().join("nested/output"));
        let stored = store.store_bytes("hello.txt", b"hello world").expect("store");

        assert_eq!(stored.byte_size, 11);
        assert_eq!(stored.sha256, OutputStore::sha256_hex(b"hello world"));
        assert_eq!(fs::read(&stored.path).expect("read"), b"hello world");
    }

    #[test]
    fn unfinished_file_leaves_nothing_behind() {
        let dir = tempdir().expect("tempdir");
        let store = OutputStore::new(dir.path());
        {
            let mut file = store.create_file("partial.txt").expect("create");
            file.write_bytes(b"half a row").expect("write");
        }

        let entries: Vec<_> = fs::read_dir(dir.path()).expect("read dir").collect();
        assert!(entries.is_empty(), "temp file should be removed on drop");
        assert!(!store.path_for("partial.txt").exists());
    }

    #[test]
    fn finish_replaces_existing_file() {
        let dir = tempdir().expect("tempdir");
        let store = OutputStore::new(dir.path());
        fs::write(store.path_for("out.txt"), "OLD").expect("seed");

        store.store_bytes("out.txt", b"NEW").expect("store");
        assert_eq!(fs::read_to_string(store.path_for("out.txt")).unwrap(), "NEW");
        assert!(store.remove_if_exists("out.txt").unwrap());
        assert!(!store.remove_if_exists("out.txt").unwrap());
    }
}
