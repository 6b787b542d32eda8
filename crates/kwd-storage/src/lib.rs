//! Keyword corpus persistence + HTTP plumbing for the volume resolvers.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context};
use chrono::{DateTime, Utc};
use kwd_core::{CategoryConfig, CategorySnapshot, Lifecycle};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "kwd-storage";

#[derive(Debug, Clone)]
pub struct StoredSnapshot {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub unchanged: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SnapshotSummary {
    pub snapshot_id: Uuid,
    pub category_id: String,
    pub lifecycle: Lifecycle,
    pub row_count: usize,
    pub updated_at: DateTime<Utc>,
}

/// File-backed keyword corpus: one JSON document per snapshot under
/// `{root}/{category_id}/{snapshot_id}.json`.
#[derive(Debug, Clone)]
pub struct SnapshotStore {
    root: PathBuf,
}

impl SnapshotStore {
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

    pub fn snapshot_relative_path(&self, category_id: &str, snapshot_id: Uuid) -> PathBuf {
        PathBuf::from(category_id).join(format!("{snapshot_id}.json"))
    }

    pub async fn create_draft(
        &self,
        category: &CategoryConfig,
        now: DateTime<Utc>,
    ) -> anyhow::Result<CategorySnapshot> {
        let snapshot = CategorySnapshot::new_draft(category, now);
        self.save(&snapshot).await?;
        Ok(snapshot)
    }

    /// Persist a snapshot with an atomic temp-file rename. Identical content is left untouched.
    pub async fn save(&self, snapshot: &CategorySnapshot) -> anyhow::Result<StoredSnapshot> {
        let bytes = serde_json::to_vec_pretty(snapshot)
            .with_context(|| format!("serializing snapshot {}", snapshot.snapshot_id))?;
        let content_hash = Self::sha256_hex(&bytes);
        let relative_path =
            self.snapshot_relative_path(&snapshot.category_id, snapshot.snapshot_id);
        let absolute_path = self.root.join(&relative_path);
        let parent = absolute_path
            .parent()
            .ok_or_else(|| anyhow!("snapshot path {} has no parent", absolute_path.display()))?
            .to_path_buf();

        fs::create_dir_all(&parent)
            .await
            .with_context(|| format!("creating snapshot directory {}", parent.display()))?;

        if fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking snapshot path {}", absolute_path.display()))?
        {
            let existing = fs::read(&absolute_path)
                .await
                .with_context(|| format!("reading {}", absolute_path.display()))?;
            if Self::sha256_hex(&existing) == content_hash {
                debug!(snapshot_id = %snapshot.snapshot_id, "snapshot unchanged");
                return Ok(StoredSnapshot {
                    content_hash,
                    relative_path,
                    absolute_path,
                    byte_size: bytes.len(),
                    unchanged: true,
                });
            }
        }

        let temp_path = parent.join(format!(".{}.{}.tmp", Uuid::new_v4(), bytes.len()));
        let mut file = fs::OpenOptions::new()
            .create_new(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp snapshot file {}", temp_path.display()))?;
        file.write_all(&bytes)
            .await
            .with_context(|| format!("writing temp snapshot file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp snapshot file {}", temp_path.display()))?;
        drop(file);

        if let Err(err) = fs::rename(&temp_path, &absolute_path).await {
            let _ = fs::remove_file(&temp_path).await;
            return Err(err).with_context(|| {
                format!(
                    "atomically renaming temp snapshot {} -> {}",
                    temp_path.display(),
                    absolute_path.display()
                )
            });
        }

        Ok(StoredSnapshot {
            content_hash,
            relative_path,
            absolute_path,
            byte_size: bytes.len(),
            unchanged: false,
        })
    }

    pub async fn load(
        &self,
        category_id: &str,
        snapshot_id: Uuid,
    ) -> anyhow::Result<CategorySnapshot> {
        let path = self
            .root
            .join(self.snapshot_relative_path(category_id, snapshot_id));
        read_snapshot(&path).await
    }

    /// Summaries ordered oldest to newest by `updated_at`.
    pub async fn list(&self, category_id: &str) -> anyhow::Result<Vec<SnapshotSummary>> {
        let mut summaries = self
            .read_category(category_id)
            .await?
            .into_iter()
            .map(|s| SnapshotSummary {
                snapshot_id: s.snapshot_id,
                category_id: s.category_id.clone(),
                lifecycle: s.lifecycle,
                row_count: s.rows.len(),
                updated_at: s.updated_at,
            })
            .collect::<Vec<_>>();
        summaries.sort_by(|a, b| {
            a.updated_at
                .cmp(&b.updated_at)
                .then_with(|| a.snapshot_id.cmp(&b.snapshot_id))
        });
        Ok(summaries)
    }

    pub async fn latest(&self, category_id: &str) -> anyhow::Result<Option<CategorySnapshot>> {
        let snapshots = self.read_category(category_id).await?;
        Ok(snapshots.into_iter().max_by(|a, b| {
            a.updated_at
                .cmp(&b.updated_at)
                .then_with(|| a.snapshot_id.cmp(&b.snapshot_id))
        }))
    }

    /// Category directories present in the store, sorted.
    pub async fn categories(&self) -> anyhow::Result<Vec<String>> {
        let mut out = Vec::new();
        if !fs::try_exists(&self.root)
            .await
            .with_context(|| format!("checking store root {}", self.root.display()))?
        {
            return Ok(out);
        }
        let mut entries = fs::read_dir(&self.root)
            .await
            .with_context(|| format!("listing {}", self.root.display()))?;
        while let Some(entry) = entries.next_entry().await? {
            if entry.file_type().await?.is_dir() {
                out.push(entry.file_name().to_string_lossy().to_string());
            }
        }
        out.sort();
        Ok(out)
    }

    async fn read_category(&self, category_id: &str) -> anyhow::Result<Vec<CategorySnapshot>> {
        let dir = self.root.join(category_id);
        let mut snapshots = Vec::new();
        if !fs::try_exists(&dir)
            .await
            .with_context(|| format!("checking {}", dir.display()))?
        {
            return Ok(snapshots);
        }
        let mut entries = fs::read_dir(&dir)
            .await
            .with_context(|| format!("listing {}", dir.display()))?;
        while let Some(entry) = entries.next_entry().await? {
            let path = entry.path();
            let name = entry.file_name().to_string_lossy().to_string();
            if name.starts_with('.') || path.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            snapshots.push(read_snapshot(&path).await?);
        }
        Ok(snapshots)
    }
}

async fn read_snapshot(path: &Path) -> anyhow::Result<CategorySnapshot> {
    let bytes = fs::read(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_slice(&bytes).with_context(|| format!("parsing {}", path.display()))
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
    if err.is_timeout() || err.is_connect() || err.is_request() {
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
            max_retries: 2,
            base_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(8),
        }
    }
}

impl BackoffPolicy {
    pub fn delay_for_attempt(&self, attempt_index: usize) -> Duration {
        let factor = 1u32.checked_shl(attempt_index as u32).unwrap_or(u32::MAX);
        let delay = self.base_delay.saturating_mul(factor);
        delay.min(self.max_delay)
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub global_concurrency: usize,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(60),
            user_agent: None,
            global_concurrency: 4,
        }
    }
}

#[derive(Debug, Clone, Copy)]
pub struct TokenBucketConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

/// Process-wide request gate. A zero `refill_every` disables throttling.
#[derive(Debug)]
pub struct SimpleTokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<TokenBucketState>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: u32,
    last_refill: Instant,
}

impl SimpleTokenBucket {
    pub fn new(capacity: u32, refill_every: Duration) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            refill_every,
            state: Mutex::new(TokenBucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    pub fn from_config(config: TokenBucketConfig) -> Self {
        Self::new(config.capacity, config.refill_every)
    }

    pub async fn take(&self) {
        if self.refill_every.is_zero() {
            return;
        }
        loop {
            let mut state = self.state.lock().await;
            let elapsed = state.last_refill.elapsed();
            if elapsed >= self.refill_every {
                let refills = (elapsed.as_millis() / self.refill_every.as_millis().max(1)) as u32;
                state.tokens = (state.tokens.saturating_add(refills)).min(self.capacity);
                state.last_refill = Instant::now();
            }

            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }

            let sleep_for = self.refill_every.saturating_sub(elapsed);
            drop(state);
            tokio::time::sleep(sleep_for.max(Duration::from_millis(1))).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct BasicAuth {
    pub login: String,
    pub password: String,
}

#[derive(Debug, Clone)]
pub struct HttpResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
    #[error("http client shut down")]
    Closed,
}

impl FetchError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            FetchError::Request(err) => classify_reqwest_error(err),
            FetchError::HttpStatus { status, .. } => StatusCode::from_u16(*status)
                .map(classify_status)
                .unwrap_or(RetryDisposition::NonRetryable),
            FetchError::Closed => RetryDisposition::NonRetryable,
        }
    }

    pub fn is_auth_failure(&self) -> bool {
        matches!(self, FetchError::HttpStatus { status: 401 | 403, .. })
    }

    pub fn is_timeout(&self) -> bool {
        matches!(self, FetchError::Request(err) if err.is_timeout())
    }
}

/// Single-attempt JSON client. Retry decisions belong to the caller.
#[derive(Debug)]
pub struct HttpClient {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
}

impl HttpClient {
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
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
        })
    }

    pub async fn post_json<T>(
        &self,
        url: &str,
        body: &T,
        auth: Option<&BasicAuth>,
    ) -> Result<HttpResponse, FetchError>
    where
        T: Serialize + ?Sized,
    {
        let _permit = self
            .global_limit
            .acquire()
            .await
            .map_err(|_| FetchError::Closed)?;

        let mut request = self.client.post(url).json(body);
        if let Some(auth) = auth {
            request = request.basic_auth(&auth.login, Some(&auth.password));
        }

        async move {
            let resp = request.send().await?;
            let status = resp.status();
            let final_url = resp.url().to_string();
            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }
            let body = resp.bytes().await?.to_vec();
            Ok(HttpResponse {
                status,
                final_url,
                body,
            })
        }
        .instrument(info_span!("http_post", url))
        .await
    }
}
