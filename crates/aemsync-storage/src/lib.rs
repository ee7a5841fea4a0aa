//! External collaborators for the sync: upstream API client, raw payload
//! archive and the relational store.

use std::fmt;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::Context;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tracing::{debug, warn};
use uuid::Uuid;

mod postgres;
mod store;

pub use postgres::PgStore;
pub use store::{ChangeSet, FacilityStore, MemoryStore, PersistenceError, Savepoint, StageKind};

pub const CRATE_NAME: &str = "aemsync-storage";

const LOGIN_PATH: &str = "api/Account/Login";
const PLATFORM_WELL_PATH: &str = "api/PlatformWell";

#[derive(Debug, Clone)]
pub struct ArchivedPayload {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Keeps every fetched response body on disk, addressed by content hash, so a
/// surprising payload can be replayed through `aemsync-cli inspect` later.
#[derive(Debug, Clone)]
pub struct PayloadArchive {
    root: PathBuf,
}

impl PayloadArchive {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        hex::encode(Sha256::digest(bytes))
    }

    pub fn payload_relative_path(
        &self,
        fetched_at: DateTime<Utc>,
        endpoint: &str,
        content_hash: &str,
    ) -> PathBuf {
        PathBuf::from(fetched_at.format("%Y%m%d_%H%M%S").to_string())
            .join(path_segment(endpoint))
            .join(format!("{content_hash}.json"))
    }

    /// Write via temp file + rename; an identical body already on disk is reused.
    pub async fn store_payload(
        &self,
        fetched_at: DateTime<Utc>,
        endpoint: &str,
        bytes: &[u8],
    ) -> anyhow::Result<ArchivedPayload> {
        let content_hash = Self::sha256_hex(bytes);
        let relative_path = self.payload_relative_path(fetched_at, endpoint, &content_hash);
        let absolute_path = self.root.join(&relative_path);
        let archived = |deduplicated| ArchivedPayload {
            content_hash: content_hash.clone(),
            relative_path: relative_path.clone(),
            absolute_path: absolute_path.clone(),
            byte_size: bytes.len(),
            deduplicated,
        };

        let parent = absolute_path
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or_else(|| self.root.clone());
        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating payload directory {}", parent.display()))?;

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking payload path {}", absolute_path.display()))?
        {
            return Ok(archived(true));
        }

        let temp_path = parent.join(format!(".{}.tmp", Uuid::new_v4()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp payload file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp payload file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp payload file {}", temp_path.display()))?;
        drop(file);

        match fs::rename(&temp_path, &absolute_path).await {
            Ok(()) => Ok(archived(false)),
            Err(err) if err.kind() == std::io::ErrorKind::AlreadyExists => {
                let _ = fs::remove_file(&temp_path).await;
                Ok(archived(true))
            }
            Err(err) => {
                let _ = fs::remove_file(&temp_path).await;
                Err(err).with_context(|| {
                    format!(
                        "renaming temp payload {} -> {}",
                        temp_path.display(),
                        absolute_path.display()
                    )
                })
            }
        }
    }
}

fn path_segment(endpoint: &str) -> String {
    let segment = endpoint
        .trim_matches('/')
        .chars()
        .map(|c| if c.is_ascii_alphanumeric() || c == '-' || c == '_' { c } else { '_' })
        .collect::<String>();
    if segment.is_empty() {
        "root".to_string()
    } else {
        segment
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RetryDisposition {
    Retryable,
    NonRetryable,
}

pub fn classify_status(status: StatusCode) -> RetryDisposition {
    if status.is_server_error() || status == StatusCode::TOO_MANY_REQUESTS {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

pub fn classify_reqwest_error(err: &reqwest::Error) -> RetryDisposition {
    if err.is_timeout() || err.is_connect() {
        RetryDisposition::Retryable
    } else {
        RetryDisposition::NonRetryable
    }
}

#[derive(Debug, Clone, Copy)]
pub struct BackoffPolicy {
    pub max_retries: usize,
    pub base_delay: Duration,
    pub max_delay: Duration,
}

impl Default for BackoffPolicy {
    fn default() -> Self {
        Self {
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        self.base_delay.saturating_mul(factor).min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub base_url: String,
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            base_url: "http://localhost:5000".to_string(),
            timeout: Duration::from_secs(30),
            user_agent: None,
            backoff: BackoffPolicy::default(),
        }
    }
}

#[derive(Clone)]
pub struct ApiCredentials {
    pub username: String,
    pub password: String,
}

impl fmt::Debug for ApiCredentials {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiCredentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .finish()
    }
}

/// Bearer token obtained from one login, handed explicitly to every fetch.
#[derive(Clone, PartialEq, Eq)]
pub struct ApiSession {
    token: String,
}

impl ApiSession {
    pub fn new(token: impl Into<String>) -> Self {
        Self {
            token: token.into(),
        }
    }

    pub fn bearer_token(&self) -> &str {
        &self.token
    }

    /// First few characters only; safe for logs.
    pub fn token_preview(&self) -> String {
        let head = self.token.chars().take(8).collect::<String>();
        format!("{head}...")
    }
}

impl fmt::Debug for ApiSession {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ApiSession")
            .field("token", &self.token_preview())
            .finish()
    }
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: u16,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum AuthError {
    #[error("no API credentials configured")]
    MissingCredentials,
    #[error("login request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("login rejected with http status {status}")]
    Rejected { status: u16 },
    #[error("login response did not contain a token")]
    EmptyToken,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// The upstream platform/well API.
#[async_trait]
pub trait FacilityApi: Send + Sync {
    async fn authenticate(&self, credentials: &ApiCredentials) -> Result<ApiSession, AuthError>;

    async fn fetch(&self, session: &ApiSession, endpoint: &str) -> Result<FetchedResponse, FetchError>;
}

#[derive(Debug)]
pub struct HttpFacilityApi {
    client: reqwest::Client,
    base_url: String,
    backoff: BackoffPolicy,
}

impl HttpFacilityApi {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        Ok(Self {
            client,
            base_url: config.base_url,
            backoff: config.backoff,
        })
    }

    async fn send_with_retry<F>(&self, build: F) -> Result<reqwest::Response, reqwest::Error>
    where
        F: Fn() -> reqwest::RequestBuilder + Send + Sync,
    {
        let mut attempt = 0;
        loop {
            match build().send().await {
                Ok(resp) => {
                    let status = resp.status();
                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        warn!(status = status.as_u16(), attempt, "retrying after http status");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Ok(resp);
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        warn!(error = %err, attempt, "retrying after transport error");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(err);
                }
            }
        }
    }
}

#[async_trait]
impl FacilityApi for HttpFacilityApi {
    async fn authenticate(&self, credentials: &ApiCredentials) -> Result<ApiSession, AuthError> {
        if credentials.username.trim().is_empty() {
            return Err(AuthError::MissingCredentials);
        }
        let url = join_url(&self.base_url, LOGIN_PATH);
        let body = serde_json::json!({
            "username": credentials.username,
            "password": credentials.password,
        });
        debug!(%url, username = %credentials.username, "logging in");

        let resp = self
            .send_with_retry(|| self.client.post(&url).json(&body))
            .await?;
        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            debug!(status = status.as_u16(), body = %text, "login rejected");
            return Err(AuthError::Rejected {
                status: status.as_u16(),
            });
        }

        extract_token(&text)
            .map(ApiSession::new)
            .ok_or(AuthError::EmptyToken)
    }

    async fn fetch(&self, session: &ApiSession, endpoint: &str) -> Result<FetchedResponse, FetchError> {
        let url = endpoint_url(&self.base_url, endpoint);
        let resp = self
            .send_with_retry(|| self.client.get(&url).bearer_auth(session.bearer_token()))
            .await?;
        let status = resp.status();
        let final_url = resp.url().to_string();

        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            debug!(status = status.as_u16(), %final_url, %body, "endpoint returned error body");
            return Err(FetchError::HttpStatus {
                status: status.as_u16(),
                url: final_url,
            });
        }

        let body = resp.bytes().await?.to_vec();
        Ok(FetchedResponse {
            status: status.as_u16(),
            final_url,
            body,
        })
    }
}

fn join_url(base_url: &str, path: &str) -> String {
    format!(
        "{}/{}",
        base_url.trim_end_matches('/'),
        path.trim_start_matches('/')
    )
}

/// Bare endpoint names live under `api/PlatformWell/`; paths starting with `/`
/// are taken relative to the base URL and absolute URLs are used as-is.
pub fn endpoint_url(base_url: &str, endpoint: &str) -> String {
    let endpoint = endpoint.trim();
    if endpoint.starts_with("http://") || endpoint.starts_with("https://") {
        endpoint.to_string()
    } else if endpoint.starts_with('/') {
        join_url(base_url, endpoint)
    } else {
        join_url(base_url, &format!("{PLATFORM_WELL_PATH}/{endpoint}"))
    }
}

/// The login endpoint answers with either a bare (possibly quoted) JWT or a
/// JSON object carrying a `token` field.
pub fn extract_token(body: &str) -> Option<String> {
    let trimmed = body.trim();
    if trimmed.starts_with('{') {
        let value: serde_json::Value = serde_json::from_str(trimmed).ok()?;
        let object = value.as_object()?;
        return object
            .iter()
            .find(|(k, _)| k.eq_ignore_ascii_case("token"))
            .and_then(|(_, v)| v.as_str())
            .map(str::trim)
            .filter(|t| !t.is_empty())
            .map(ToString::to_string);
    }
    let token = trimmed.trim_matches('"').trim();
    if token.is_empty() {
        None
    } else {
        Some(token.to_string())
    }
}
