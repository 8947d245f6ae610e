//! Raw payload caching + retrying HTTP fetch for the Pantry pipeline.

use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::Context;
use chrono::Utc;
use pantry_core::RawRecipe;
use reqwest::StatusCode;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::Mutex;
use tracing::debug;

pub const CRATE_NAME: &str = "pantry-storage";

/// Outcome of a cache write.
#[derive(Debug, Clone)]
pub struct StoredPayload {
    pub path: PathBuf,
    pub sha256: String,
    pub byte_size: usize,
    /// True when an identical payload was already on disk and no write
    /// happened.
    pub unchanged: bool,
}

/// On-disk cache of raw recipe batches, one JSON file per `(source, label)`
/// pair, plus timestamped whole-run snapshots at the cache root.
#[derive(Debug, Clone)]
pub struct RawCache {
    root: PathBuf,
}

impl RawCache {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Filesystem-safe form of a cache label ("Main Course" -> "main-course").
    pub fn slug(label: &str) -> String {
        let mut out = String::with_capacity(label.len());
        for ch in label.to_ascii_lowercase().chars() {
            if ch.is_ascii_alphanumeric() {
                out.push(ch);
            } else if !out.ends_with('-') {
                out.push('-');
            }
        }
        out.trim_matches('-').to_string()
    }

    pub fn sha256_hex(bytes: &[u8]) -> String {
        let mut hasher = Sha256::new();
        hasher.update(bytes);
        hex::encode(hasher.finalize())
    }

    pub fn entry_path(&self, source: &str, label: &str) -> PathBuf {
        self.root
            .join(source)
            .join(format!("{}.json", Self::slug(label)))
    }

    /// Load a cached batch, `None` when the entry has never been written.
    pub async fn load(&self, source: &str, label: &str) -> anyhow::Result<Option<Vec<RawRecipe>>> {
        let path = self.entry_path(source, label);
        if !fs::try_exists(&path)
            .await
            .with_context(|| format!("checking cache entry {}", path.display()))?
        {
            return Ok(None);
        }
        let text = fs::read_to_string(&path)
            .await
            .with_context(|| format!("reading cache entry {}", path.display()))?;
        let records: Vec<RawRecipe> = serde_json::from_str(&text)
            .with_context(|| format!("parsing cache entry {}", path.display()))?;
        debug!(source, label, records = records.len(), "loaded cache entry");
        Ok(Some(records))
    }

    /// Write (or refresh) a cache entry atomically.
    pub async fn store(
        &self,
        source: &str,
        label: &str,
        records: &[RawRecipe],
    ) -> anyhow::Result<StoredPayload> {
        let path = self.entry_path(source, label);
        let bytes = serde_json::to_vec_pretty(records).context("serializing cache entry")?;
        self.write_atomic(&path, &bytes).await
    }

    /// Persist a timestamped snapshot of a whole raw batch at the cache root.
    pub async fn save_snapshot(
        &self,
        prefix: &str,
        records: &[RawRecipe],
    ) -> anyhow::Result<StoredPayload> {
        let stamp = Utc::now().format("%Y%m%dT%H%M%SZ");
        let path = self.root.join(format!("{prefix}_{stamp}.json"));
        let bytes = serde_json::to_vec_pretty(records).context("serializing raw snapshot")?;
        self.write_atomic(&path, &bytes).await
    }

    async fn write_atomic(&self, path: &Path, bytes: &[u8]) -> anyhow::Result<StoredPayload> {
        let sha256 = Self::sha256_hex(bytes);

        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)
                .await
                .with_context(|| format!("creating cache directory {}", parent.display()))?;
        }

        if fs::try_exists(path)
            .await
            .with_context(|| format!("checking cache path {}", path.display()))?
        {
            let existing = fs::read(path)
                .await
                .with_context(|| format!("reading existing cache file {}", path.display()))?;
            if Self::sha256_hex(&existing) == sha256 {
                return Ok(StoredPayload {
                    path: path.to_path_buf(),
                    sha256,
                    byte_size: bytes.len(),
                    unchanged: true,
                });
            }
        }

        let temp_path = path
            .parent()
            .expect("cache path always has a parent")
            .join(format!(".{sha256}.tmp"));

        let mut file = fs::OpenOptions::new()
            .create(true)
            .truncate(true)
            .write(true)
            .open(&temp_path)
            .await
            .with_context(|| format!("opening temp cache file {}", temp_path.display()))?;
        file.write_all(bytes)
            .await
            .with_context(|| format!("writing temp cache file {}", temp_path.display()))?;
        file.flush()
            .await
            .with_context(|| format!("flushing temp cache file {}", temp_path.display()))?;
        drop(file);

        fs::rename(&temp_path, path).await.with_context(|| {
            format!(
                "renaming temp cache file {} -> {}",
                temp_path.display(),
                path.display()
            )
        })?;

        Ok(StoredPayload {
            path: path.to_path_buf(),
            sha256,
            byte_size: bytes.len(),
            unchanged: false,
        })
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
            max_retries: 4,
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

/// Polite-pacing configuration for burst-limited APIs.
#[derive(Debug, Clone, Copy)]
pub struct PacingConfig {
    pub capacity: u32,
    pub refill_every: Duration,
}

#[derive(Debug)]
pub struct TokenBucket {
    capacity: u32,
    refill_every: Duration,
    state: Mutex<TokenBucketState>,
}

#[derive(Debug, Clone, Copy)]
struct TokenBucketState {
    tokens: u32,
    last_refill: Instant,
}

impl TokenBucket {
    pub fn new(capacity: u32, refill_every: Duration) -> Self {
        Self {
            capacity,
            refill_every,
            state: Mutex::new(TokenBucketState {
                tokens: capacity,
                last_refill: Instant::now(),
            }),
        }
    }

    pub async fn take(&self) {
        loop {
            let mut state = self.state.lock().await;
            let elapsed = state.last_refill.elapsed();
            if elapsed >= self.refill_every && self.refill_every.as_millis() > 0 {
                let refills = (elapsed.as_millis() / self.refill_every.as_millis()) as u32;
                state.tokens = state.tokens.saturating_add(refills).min(self.capacity);
                state.last_refill = Instant::now();
            }

            if state.tokens > 0 {
                state.tokens -= 1;
                return;
            }

            let sleep_for = self.refill_every;
            drop(state);
            tokio::time::sleep(sleep_for).await;
        }
    }
}

#[derive(Debug, Clone)]
pub struct HttpClientConfig {
    pub timeout: Duration,
    pub user_agent: Option<String>,
    pub backoff: BackoffPolicy,
    pub pacing: Option<PacingConfig>,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            backoff: BackoffPolicy::default(),
            pacing: None,
        }
    }
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
}

/// Shared HTTP client with retry classification, exponential backoff, and
/// optional token-bucket pacing.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    backoff: BackoffPolicy,
    pacing: Option<Arc<TokenBucket>>,
}

impl HttpFetcher {
    pub fn new(config: HttpClientConfig) -> anyhow::Result<Self> {
        let mut builder = reqwest::Client::builder()
            .gzip(true)
            .brotli(true)
            .timeout(config.timeout);

        if let Some(user_agent) = &config.user_agent {
            builder = builder.user_agent(user_agent.clone());
        }

        let client = builder.build().context("building reqwest client")?;
        let pacing = config
            .pacing
            .map(|p| Arc::new(TokenBucket::new(p.capacity, p.refill_every)));

        Ok(Self {
            client,
            backoff: config.backoff,
            pacing,
        })
    }

    /// GET `url` with `params`, retrying transient failures, and return the
    /// response body.
    pub async fn get_bytes(
        &self,
        source: &str,
        url: &str,
        params: &[(&str, &str)],
    ) -> Result<Vec<u8>, FetchError> {
        if let Some(bucket) = &self.pacing {
            bucket.take().await;
        }

        let mut last_request_error: Option<reqwest::Error> = None;

        for attempt in 0..=self.backoff.max_retries {
            let resp_result = self.client.get(url).query(params).send().await;

            match resp_result {
                Ok(resp) => {
                    let status = resp.status();
                    let final_url = resp.url().to_string();

                    if status.is_success() {
                        debug!(source, url = %final_url, attempt, "fetched");
                        return Ok(resp.bytes().await?.to_vec());
                    }

                    if classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        debug!(source, url = %final_url, %status, attempt, "retrying");
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }

                    return Err(FetchError::HttpStatus {
                        status: status.as_u16(),
                        url: final_url,
                    });
                }
                Err(err) => {
                    if classify_reqwest_error(&err) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
                        last_request_error = Some(err);
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }

        Err(FetchError::Request(
            last_request_error.expect("retry loop should capture a request error"),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pantry_core::{RawIngredient, SourceName};
    use tempfile::tempdir;

    fn sample_batch() -> Vec<RawRecipe> {
        vec![RawRecipe {
            source_name: SourceName::Themealdb,
            source_id: Some("52893".to_string()),
            name: Some("Apple Crumble".to_string()),
            category: Some("Dessert".to_string()),
            area: Some("British".to_string()),
            instructions: Some("Bake.".to_string()),
            thumbnail: None,
            ingredients: vec![RawIngredient {
                ingredient: Some("Apples".to_string()),
                measure: Some("4".to_string()),
            }],
        }]
    }

    #[test]
    fn slug_is_filesystem_safe() {
        assert_eq!(RawCache::slug("Main Course"), "main-course");
        assert_eq!(RawCache::slug("  Dessert  "), "dessert");
        assert_eq!(RawCache::slug("side dish / snack"), "side-dish-snack");
    }

    #[tokio::test]
    async fn cache_round_trips_and_skips_unchanged_rewrites() {
        let dir = tempdir().expect("tempdir");
        let cache = RawCache::new(dir.path());
        let batch = sample_batch();

        assert!(cache
            .load("themealdb", "Dessert")
            .await
            .expect("load empty")
            .is_none());

        let first = cache
            .store("themealdb", "Dessert", &batch)
            .await
            .expect("first store");
        assert!(!first.unchanged);

        let second = cache
            .store("themealdb", "Dessert", &batch)
            .await
            .expect("second store");
        assert!(second.unchanged);
        assert_eq!(first.sha256, second.sha256);

        let loaded = cache
            .load("themealdb", "Dessert")
            .await
            .expect("load")
            .expect("entry present");
        assert_eq!(loaded, batch);
    }

    #[tokio::test]
    async fn snapshot_lands_at_cache_root_with_prefix() {
        let dir = tempdir().expect("tempdir");
        let cache = RawCache::new(dir.path());

        let stored = cache
            .save_snapshot("recipes_initial", &sample_batch())
            .await
            .expect("snapshot");
        let file_name = stored
            .path
            .file_name()
            .and_then(|n| n.to_str())
            .expect("snapshot file name");
        assert!(file_name.starts_with("recipes_initial_"));
        assert!(file_name.ends_with(".json"));
        assert_eq!(stored.path.parent(), Some(dir.path()));
    }

    #[test]
    fn backoff_is_exponential_and_capped() {
        let policy = BackoffPolicy {
            max_retries: 5,
            base_delay: Duration::from_millis(100),
            max_delay: Duration::from_millis(350),
        };

        assert_eq!(policy.delay_for_attempt(0), Duration::from_millis(100));
        assert_eq!(policy.delay_for_attempt(1), Duration::from_millis(200));
        assert_eq!(policy.delay_for_attempt(2), Duration::from_millis(350));
        assert_eq!(policy.delay_for_attempt(6), Duration::from_millis(350));
    }

    #[test]
    fn rate_limit_and_server_errors_are_retryable() {
        assert_eq!(
            classify_status(StatusCode::TOO_MANY_REQUESTS),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::BAD_GATEWAY),
            RetryDisposition::Retryable
        );
        assert_eq!(
            classify_status(StatusCode::NOT_FOUND),
            RetryDisposition::NonRetryable
        );
    }
}
