//! Dropbox HTTP API uploads.
//!
//! Small files go through `files/upload`; anything above the threshold is sent
//! as an upload session (`start`, `append_v2` for middle chunks, `finish` with
//! the commit). The session logic only talks to [`UploadSink`], so byte
//! accounting can be checked without a network.

use anyhow::{bail, Context, Result};
use common::DropboxConfig;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::io::AsyncReadExt;
use tracing::{error, info, warn};

use super::PublishReport;

/// Largest file sent with a single `files/upload` call
pub const UPLOAD_THRESHOLD: u64 = 150 * 1024 * 1024;
/// Bytes per upload-session request
pub const CHUNK_SIZE: u64 = 150 * 1024 * 1024;

const RPC_TIMEOUT: Duration = Duration::from_secs(30);
const CONTENT_TIMEOUT: Duration = Duration::from_secs(600);

/// Destination of the upload calls
#[async_trait::async_trait]
pub trait UploadSink: Send + Sync {
    /// Single-shot upload to `remote_path`, overwriting.
    async fn upload(&self, remote_path: &str, data: Vec<u8>) -> Result<()>;
    /// Open a session with the first chunk; returns the session id.
    async fn start_session(&self, data: Vec<u8>) -> Result<String>;
    async fn append(&self, session_id: &str, offset: u64, data: Vec<u8>) -> Result<()>;
    /// Send the last chunk and commit the session to `remote_path`.
    async fn finish(&self, session_id: &str, offset: u64, data: Vec<u8>, remote_path: &str) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UploadMode {
    Single,
    Chunked,
}

/// `size <= threshold` is uploaded in one call.
pub fn upload_mode(size: u64, threshold: u64) -> UploadMode {
    if size <= threshold {
        UploadMode::Single
    } else {
        UploadMode::Chunked
    }
}

async fn read_chunk(file: &mut tokio::fs::File, chunk_size: u64) -> Result<Vec<u8>> {
    let mut buf = Vec::new();
    file.take(chunk_size)
        .read_to_end(&mut buf)
        .await
        .context("failed to read file chunk")?;
    Ok(buf)
}

/// Upload one local file, picking single-shot or session upload by size.
pub async fn upload_file<S>(
    sink: &S,
    local: &Path,
    remote_path: &str,
    threshold: u64,
    chunk_size: u64,
) -> Result<UploadMode>
where
    S: UploadSink + ?Sized,
{
    let size = tokio::fs::metadata(local)
        .await
        .with_context(|| format!("cannot stat {}", local.display()))?
        .len();

    let mode = upload_mode(size, threshold);
    if mode == UploadMode::Single {
        let data = tokio::fs::read(local)
            .await
            .with_context(|| format!("cannot read {}", local.display()))?;
        sink.upload(remote_path, data).await?;
        return Ok(mode);
    }

    info!(size, "File {} is larger than the single upload limit, using chunked upload.", local.display());
    let chunk_size = chunk_size.max(1);
    let mut file = tokio::fs::File::open(local)
        .await
        .with_context(|| format!("cannot open {}", local.display()))?;

    let first = read_chunk(&mut file, chunk_size).await?;
    let mut offset = first.len() as u64;
    let session_id = sink.start_session(first).await?;

    loop {
        // finish always runs, with an empty body if start already sent everything
        if size.saturating_sub(offset) <= chunk_size {
            let last = read_chunk(&mut file, chunk_size).await?;
            sink.finish(&session_id, offset, last, remote_path).await?;
            break;
        }

        let chunk = read_chunk(&mut file, chunk_size).await?;
        if chunk.is_empty() {
            bail!("{} ended at byte {} of {}", local.display(), offset, size);
        }
        let len = chunk.len() as u64;
        sink.append(&session_id, offset, chunk).await?;
        offset += len;
    }

    Ok(mode)
}

/// JSON for the `Dropbox-API-Arg` header: every non-ASCII character becomes a
/// `\uXXXX` escape (UTF-16 surrogate pairs above the BMP).
pub fn header_safe_json(value: &Value) -> Result<String> {
    let raw = serde_json::to_string(value).context("failed to encode API argument")?;
    let mut out = String::with_capacity(raw.len());
    for c in raw.chars() {
        if c.is_ascii() {
            out.push(c);
        } else {
            let mut units = [0u16; 2];
            for unit in c.encode_utf16(&mut units) {
                let _ = write!(out, "\\u{:04x}", unit);
            }
        }
    }
    Ok(out)
}

/// Base URLs of the three Dropbox hosts
#[derive(Debug, Clone)]
pub struct DropboxEndpoints {
    /// Host of `/oauth2/token`
    pub oauth: String,
    /// RPC base, e.g. `https://api.dropboxapi.com/2`
    pub api: String,
    /// Content-upload base
    pub content: String,
}

impl Default for DropboxEndpoints {
    fn default() -> Self {
        Self {
            oauth: "https://api.dropbox.com".to_string(),
            api: "https://api.dropboxapi.com/2".to_string(),
            content: "https://content.dropboxapi.com/2".to_string(),
        }
    }
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    access_token: String,
}

#[derive(Debug, Deserialize)]
pub struct Account {
    pub account_id: String,
    #[serde(default)]
    pub email: Option<String>,
}

#[derive(Debug, Deserialize)]
struct SessionStart {
    session_id: String,
}

/// Authenticated Dropbox client
pub struct DropboxClient {
    client: Client,
    endpoints: DropboxEndpoints,
    access_token: String,
}

impl DropboxClient {
    pub async fn connect(cfg: &DropboxConfig) -> Result<Self> {
        Self::connect_with(cfg, DropboxEndpoints::default()).await
    }

    /// Exchange the refresh token for an access token and verify it against
    /// `users/get_current_account`.
    pub async fn connect_with(cfg: &DropboxConfig, endpoints: DropboxEndpoints) -> Result<Self> {
        let client = Client::builder()
            .user_agent("newsdigest/0.1.0")
            .build()
            .context("failed to build reqwest client")?;

        let token_url = format!("{}/oauth2/token", endpoints.oauth.trim_end_matches('/'));
        let response = client
            .post(&token_url)
            .form(&[
                ("grant_type", "refresh_token"),
                ("refresh_token", cfg.refresh_token.as_str()),
                ("client_id", cfg.app_key.as_str()),
                ("client_secret", cfg.app_secret.as_str()),
            ])
            .timeout(RPC_TIMEOUT)
            .send()
            .await
            .context("token refresh request failed")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("Dropbox token refresh failed {}: {}", status, body);
        }
        let token: TokenResponse = response.json().await.context("invalid token response")?;

        let dropbox = Self { client, endpoints, access_token: token.access_token };
        let account = dropbox.current_account().await?;
        info!(account_id = %account.account_id, "Successfully connected to Dropbox.");
        Ok(dropbox)
    }

    pub async fn current_account(&self) -> Result<Account> {
        let url = format!("{}/users/get_current_account", self.endpoints.api.trim_end_matches('/'));
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.access_token)
            .timeout(RPC_TIMEOUT)
            .send()
            .await
            .context("get_current_account request failed")?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("Dropbox API error {} on users/get_current_account: {}", status, body);
        }
        response.json().await.context("invalid account response")
    }

    async fn content_call(&self, route: &str, arg: Value, data: Vec<u8>) -> Result<reqwest::Response> {
        let url = format!("{}/{}", self.endpoints.content.trim_end_matches('/'), route);
        let response = self
            .client
            .post(&url)
            .bearer_auth(&self.access_token)
            .header("Content-Type", "application/octet-stream")
            .header("Dropbox-API-Arg", header_safe_json(&arg)?)
            .body(data)
            .timeout(CONTENT_TIMEOUT)
            .send()
            .await
            .with_context(|| format!("{} request failed", route))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            bail!("Dropbox API error {} on {}: {}", status, route, body);
        }
        Ok(response)
    }
}

#[async_trait::async_trait]
impl UploadSink for DropboxClient {
    async fn upload(&self, remote_path: &str, data: Vec<u8>) -> Result<()> {
        let arg = json!({ "path": remote_path, "mode": "overwrite" });
        self.content_call("files/upload", arg, data).await?;
        Ok(())
    }

    async fn start_session(&self, data: Vec<u8>) -> Result<String> {
        let response = self
            .content_call("files/upload_session/start", json!({ "close": false }), data)
            .await?;
        let start: SessionStart = response.json().await.context("invalid upload_session/start response")?;
        Ok(start.session_id)
    }

    async fn append(&self, session_id: &str, offset: u64, data: Vec<u8>) -> Result<()> {
        let arg = json!({
            "cursor": { "session_id": session_id, "offset": offset },
            "close": false,
        });
        self.content_call("files/upload_session/append_v2", arg, data).await?;
        Ok(())
    }

    async fn finish(&self, session_id: &str, offset: u64, data: Vec<u8>, remote_path: &str) -> Result<()> {
        let arg = json!({
            "cursor": { "session_id": session_id, "offset": offset },
            "commit": { "path": remote_path, "mode": "overwrite" },
        });
        self.content_call("files/upload_session/finish", arg, data).await?;
        Ok(())
    }
}

/// Upload each file to `/<file name>`; per-file failures are logged and skipped.
pub async fn upload_all<S>(sink: &S, files: &[PathBuf], threshold: u64, chunk_size: u64) -> PublishReport
where
    S: UploadSink + ?Sized,
{
    let mut report = PublishReport::default();

    for path in files {
        let Some(file_name) = path.file_name().map(|n| n.to_string_lossy().into_owned()) else {
            warn!("Skipping {}: no file name", path.display());
            report.skipped.push(path.clone());
            continue;
        };
        if !path.exists() {
            warn!("File not found: {}", path.display());
            report.skipped.push(path.clone());
            continue;
        }

        let remote_path = format!("/{}", file_name);
        match upload_file(sink, path, &remote_path, threshold, chunk_size).await {
            Ok(_) => {
                info!("Successfully uploaded {} to Dropbox path: {}", file_name, remote_path);
                report.uploaded.push(path.clone());
            }
            Err(e) => {
                error!("Error uploading {}: {:#}", path.display(), e);
                report.failed.push(path.clone());
            }
        }
    }

    report
}

/// Connect (fatal on failure) and upload every file.
pub async fn publish(cfg: &DropboxConfig, files: &[PathBuf]) -> Result<PublishReport> {
    let client = DropboxClient::connect(cfg)
        .await
        .context("Error connecting to Dropbox")?;
    Ok(upload_all(&client, files, UPLOAD_THRESHOLD, CHUNK_SIZE).await)
}
