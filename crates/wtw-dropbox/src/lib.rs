//! Concurrent image upload to Dropbox with share-link collection.

use std::sync::Arc;
use std::time::Duration;

use reqwest::header::CONTENT_TYPE;
use serde::Deserialize;
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tracing::{info, info_span, Instrument};

pub const CRATE_NAME: &str = "wtw-dropbox";

pub const DEFAULT_CONTENT_BASE: &str = "https://content.dropboxapi.com";
pub const DEFAULT_API_BASE: &str = "https://api.dropboxapi.com";

const UPLOAD_PATH: &str = "/2/files/upload";
const SHARE_PATH: &str = "/2/sharing/create_shared_link_with_settings";

#[derive(Debug, Clone)]
pub struct DropboxConfig {
    pub token: String,
    pub content_base: String,
    pub api_base: String,
    pub timeout: Duration,
    pub concurrency: usize,
}

impl DropboxConfig {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
            content_base: DEFAULT_CONTENT_BASE.to_string(),
            api_base: DEFAULT_API_BASE.to_string(),
            timeout: Duration::from_secs(30),
            concurrency: 4,
        }
    }

    /// Point both endpoints at one host.
    pub fn with_base_url(mut self, base: impl Into<String>) -> Self {
        let base = base.into();
        self.content_base = base.clone();
        self.api_base = base;
        self
    }
}

/// In-memory file taken from a form submission.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadFile {
    pub filename: String,
    pub bytes: Vec<u8>,
}

impl UploadFile {
    pub fn new(filename: impl Into<String>, bytes: impl Into<Vec<u8>>) -> Self {
        Self {
            filename: filename.into(),
            bytes: bytes.into(),
        }
    }
}

#[derive(Debug, Error)]
pub enum UploadError {
    #[error("dropbox request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("dropbox returned http status {status} for {url}: {body}")]
    Status { status: u16, url: String, body: String },
    #[error("upload task failed: {0}")]
    Join(String),
}

#[derive(Debug, Deserialize)]
struct UploadedFile {
    path_lower: String,
}

#[derive(Debug, Clone)]
pub struct DropboxClient {
    client: reqwest::Client,
    config: Arc<DropboxConfig>,
    limit: Arc<Semaphore>,
}

impl DropboxClient {
    pub fn new(config: DropboxConfig) -> Result<Self, UploadError> {
        let client = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout)
            .build()?;
        Ok(Self {
            client,
            limit: Arc::new(Semaphore::new(config.concurrency.max(1))),
            config: Arc::new(config),
        })
    }

    /// Upload every file and return its share link, in input order.
    ///
    /// All uploads run to completion before this returns. If any failed, the
    /// error of the earliest failing file is returned and no links are.
    pub async fn upload_all(&self, files: Vec<UploadFile>) -> Result<Vec<String>, UploadError> {
        if files.is_empty() {
            return Ok(Vec::new());
        }

        let total = files.len();
        let mut tasks = JoinSet::new();
        for (idx, file) in files.into_iter().enumerate() {
            let this = self.clone();
            let span = info_span!("dropbox_upload", idx, filename = %file.filename);
            tasks.spawn(
                async move {
                    let result = this.upload_and_share(file).await;
                    (idx, result)
                }
                .instrument(span),
            );
        }

        let mut slots: Vec<Option<Result<String, UploadError>>> = (0..total).map(|_| None).collect();
        let mut join_failure = None;
        while let Some(joined) = tasks.join_next().await {
            match joined {
                Ok((idx, result)) => slots[idx] = Some(result),
                Err(err) => {
                    join_failure.get_or_insert(UploadError::Join(err.to_string()));
                }
            }
        }
        if let Some(err) = join_failure {
            return Err(err);
        }

        let urls = slots
            .into_iter()
            .map(|slot| slot.unwrap_or_else(|| Err(UploadError::Join("upload task vanished".into()))))
            .collect::<Result<Vec<_>, _>>()?;
        info!(files = urls.len(), "dropbox uploads finished");
        Ok(urls)
    }

    async fn upload_and_share(&self, file: UploadFile) -> Result<String, UploadError> {
        let _permit = self
            .limit
            .acquire()
            .await
            .map_err(|err| UploadError::Join(err.to_string()))?;

        let upload_url = format!("{}{UPLOAD_PATH}", self.config.content_base);
        let resp = self
            .client
            .post(&upload_url)
            .bearer_auth(&self.config.token)
            .header(CONTENT_TYPE, "application/octet-stream")
            .header("Dropbox-API-Arg", dropbox_api_arg(&file.filename))
            .body(file.bytes)
            .send()
            .await?;
        let status = resp.status();
        if !status.is_success() {
            return Err(UploadError::Status {
                status: status.as_u16(),
                url: upload_url,
                body: resp.text().await.unwrap_or_default(),
            });
        }
        let uploaded: UploadedFile = resp.json().await?;

        // Dropbox answers 409 with the existing link in the error body, so the
        // body is read whatever the status.
        let share_url = format!("{}{SHARE_PATH}", self.config.api_base);
        let resp = self
            .client
            .post(&share_url)
            .bearer_auth(&self.config.token)
            .json(&json!({ "path": uploaded.path_lower }))
            .send()
            .await?;
        let status = resp.status();
        let body: Value = resp.json().await?;
        let url = extract_share_url(&body).ok_or_else(|| UploadError::Status {
            status: status.as_u16(),
            url: share_url,
            body: body.to_string(),
        })?;
        Ok(normalize_share_url(url))
    }
}

/// Link from a fresh share response, or from the `shared_link_already_exists` error.
pub fn extract_share_url(body: &Value) -> Option<&str> {
    body.get("url")
        .and_then(Value::as_str)
        .or_else(|| {
            body.pointer("/error/shared_link_already_exists/metadata/url")
                .and_then(Value::as_str)
        })
}

/// Turn a landing-page link into one that serves the raw file.
pub fn normalize_share_url(url: &str) -> String {
    match url.strip_suffix("&dl=0") {
        Some(prefix) => format!("{prefix}&raw=1"),
        None => url.to_string(),
    }
}

/// `Dropbox-API-Arg` header value. Header values must be ASCII, so anything
/// else is written as JSON `\u` escapes.
pub fn dropbox_api_arg(filename: &str) -> String {
    let arg = json!({
        "autorename": true,
        "mode": "add",
        "path": format!("/{filename}"),
    })
    .to_string();

    let mut out = String::with_capacity(arg.len());
    for ch in arg.chars() {
        if ch.is_ascii() && ch != '\x7f' {
            out.push(ch);
        } else {
            let mut units = [0u16; 2];
            for unit in ch.encode_utf16(&mut units) {
                out.push_str(&format!("\\u{unit:04x}"));
            }
        }
    }
    out
}
