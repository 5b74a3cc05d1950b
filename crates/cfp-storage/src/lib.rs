//! Canonical store persistence, raw snapshot capture and HTTP fetch utilities.

use std::collections::{BTreeMap, HashMap};
use std::future::Future;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use cfp_core::Event;
use chrono::{DateTime, Utc};
use reqwest::StatusCode;
use serde::de::DeserializeOwned;
use serde::Serialize;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tokio::fs;
use tokio::io::AsyncWriteExt;
use tokio::sync::{Mutex, Semaphore};
use tokio::time::Instant;
use tracing::{debug, info_span, Instrument};
use uuid::Uuid;

pub const CRATE_NAME: &str = "cfp-storage";

pub fn sha256_hex(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    hex::encode(hasher.finalize())
}

/// Replace `path` with `bytes` via a sibling temp file and rename.
///
/// An existing file is first copied to `<name>.bak`; the returned path points at
/// that backup so an interrupted run can be rolled back by hand.
pub async fn write_atomic(path: &Path, bytes: &[u8]) -> anyhow::Result<Option<PathBuf>> {
    let parent = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));
    fs::create_dir_all(parent)
        .await
        .with_context(|| format!("creating directory {}", parent.display()))?;

    let file_name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .with_context(|| format!("{} has no file name", path.display()))?;
    let temp_path = parent.join(format!(".{file_name}.{}.tmp", Uuid::new_v4()));

    let mut file = fs::OpenOptions::new()
        .create_new(true)
        .write(true)
        .open(&temp_path)
        .await
        .with_context(|| format!("opening temp file {}", temp_path.display()))?;
    file.write_all(bytes)
        .await
        .with_context(|| format!("writing temp file {}", temp_path.display()))?;
    file.flush()
        .await
        .with_context(|| format!("flushing temp file {}", temp_path.display()))?;
    file.sync_all()
        .await
        .with_context(|| format!("syncing temp file {}", temp_path.display()))?;
    drop(file);

    let backup = if fs::try_exists(path)
        .await
        .with_context(|| format!("checking {}", path.display()))?
    {
        let backup_path = path.with_file_name(format!("{file_name}.bak"));
        fs::copy(path, &backup_path)
            .await
            .with_context(|| format!("backing up {} -> {}", path.display(), backup_path.display()))?;
        Some(backup_path)
    } else {
        None
    };

    match fs::rename(&temp_path, path).await {
        Ok(()) => Ok(backup),
        Err(err) => {
            let _ = fs::remove_file(&temp_path).await;
            Err(err).with_context(|| {
                format!(
                    "atomically renaming {} -> {}",
                    temp_path.display(),
                    path.display()
                )
            })
        }
    }
}

pub async fn read_json_or_default<T: DeserializeOwned + Default>(path: &Path) -> anyhow::Result<T> {
    if !fs::try_exists(path)
        .await
        .with_context(|| format!("checking {}", path.display()))?
    {
        return Ok(T::default());
    }
    let text = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

pub async fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> anyhow::Result<()> {
    let bytes = serde_json::to_vec_pretty(value)
        .with_context(|| format!("serializing {}", path.display()))?;
    write_atomic(path, &bytes).await?;
    Ok(())
}

#[derive(Debug, Clone)]
pub struct WriteOutcome {
    pub path: PathBuf,
    pub sha256: String,
    pub bytes: usize,
    pub backup: Option<PathBuf>,
    /// The file already held exactly these bytes; nothing was written.
    pub unchanged: bool,
}

/// YAML list-of-records file holding the active canonical collection.
#[derive(Debug, Clone)]
pub struct EventStore {
    path: PathBuf,
}

impl EventStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the collection; a missing file is an empty collection.
    pub async fn load(&self) -> anyhow::Result<Vec<Event>> {
        load_event_file(&self.path).await
    }

    pub fn render(events: &[Event]) -> anyhow::Result<String> {
        serde_yaml::to_string(events).context("serializing events to yaml")
    }

    /// Digest of the bytes currently on disk, `None` if the file does not exist.
    pub async fn digest(&self) -> anyhow::Result<Option<String>> {
        file_digest(&self.path).await
    }

    pub async fn replace(&self, events: &[Event]) -> anyhow::Result<WriteOutcome> {
        replace_event_file(&self.path, events).await
    }
}

/// Year-partitioned archive: one `<year>.yaml` per edition year.
#[derive(Debug, Clone)]
pub struct ArchiveStore {
    dir: PathBuf,
}

impl ArchiveStore {
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self { dir: dir.into() }
    }

    pub fn path_for_year(&self, year: i32) -> PathBuf {
        self.dir.join(format!("{year}.yaml"))
    }

    pub async fn load_all(&self) -> anyhow::Result<BTreeMap<i32, Vec<Event>>> {
        let mut out = BTreeMap::new();
        if !fs::try_exists(&self.dir)
            .await
            .with_context(|| format!("checking {}", self.dir.display()))?
        {
            return Ok(out);
        }
        let mut entries = fs::read_dir(&self.dir)
            .await
            .with_context(|| format!("reading {}", self.dir.display()))?;
        while let Some(entry) = entries
            .next_entry()
            .await
            .with_context(|| format!("listing {}", self.dir.display()))?
        {
            let path = entry.path();
            if path.extension().and_then(|e| e.to_str()) != Some("yaml") {
                continue;
            }
            let Some(year) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| s.parse::<i32>().ok())
            else {
                continue;
            };
            out.insert(year, load_event_file(&path).await?);
        }
        Ok(out)
    }

    pub async fn replace_year(&self, year: i32, events: &[Event]) -> anyhow::Result<WriteOutcome> {
        replace_event_file(&self.path_for_year(year), events).await
    }
}

async fn load_event_file(path: &Path) -> anyhow::Result<Vec<Event>> {
    if !fs::try_exists(path)
        .await
        .with_context(|| format!("checking {}", path.display()))?
    {
        return Ok(Vec::new());
    }
    let text = fs::read_to_string(path)
        .await
        .with_context(|| format!("reading {}", path.display()))?;
    if text.trim().is_empty() {
        return Ok(Vec::new());
    }
    serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))
}

async fn file_digest(path: &Path) -> anyhow::Result<Option<String>> {
    match fs::read(path).await {
        Ok(bytes) => Ok(Some(sha256_hex(&bytes))),
        Err(err) if err.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(err) => Err(err).with_context(|| format!("reading {}", path.display())),
    }
}

async fn replace_event_file(path: &Path, events: &[Event]) -> anyhow::Result<WriteOutcome> {
    let rendered = EventStore::render(events)?;
    let sha256 = sha256_hex(rendered.as_bytes());
    if file_digest(path).await?.as_deref() == Some(sha256.as_str()) {
        return Ok(WriteOutcome {
            path: path.to_path_buf(),
            sha256,
            bytes: rendered.len(),
            backup: None,
            unchanged: true,
        });
    }
    let backup = write_atomic(path, rendered.as_bytes()).await?;
    Ok(WriteOutcome {
        path: path.to_path_buf(),
        sha256,
        bytes: rendered.len(),
        backup,
        unchanged: false,
    })
}

#[derive(Debug, Clone)]
pub struct StoredSnapshot {
    pub content_hash: String,
    pub relative_path: PathBuf,
    pub absolute_path: PathBuf,
    pub byte_size: usize,
    pub deduplicated: bool,
}

/// Content-addressed capture of raw source payloads, kept for auditing adapter output.
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

    pub fn relative_path(
        fetched_at: DateTime<Utc>,
        source_id: &str,
        content_hash: &str,
        extension: &str,
    ) -> PathBuf {
        let day = fetched_at.format("%Y%m%d").to_string();
        let ext = extension.trim_start_matches('.').trim();
        let ext = if ext.is_empty() { "bin" } else { ext };
        PathBuf::from(source_id)
            .join(day)
            .join(format!("{content_hash}.{ext}"))
    }

    pub async fn store_bytes(
        &self,
        fetched_at: DateTime<Utc>,
        source_id: &str,
        extension: &str,
        bytes: &[u8],
    ) -> anyhow::Result<StoredSnapshot> {
        let content_hash = sha256_hex(bytes);
        let relative_path = Self::relative_path(fetched_at, source_id, &content_hash, extension);
        let absolute_path = self.root.join(&relative_path);

        let deduplicated = fs::try_exists(&absolute_path)
            .await
            .with_context(|| format!("checking snapshot path {}", absolute_path.display()))?;
        if !deduplicated {
            write_atomic(&absolute_path, bytes).await?;
        }

        Ok(StoredSnapshot {
            content_hash,
            relative_path,
            absolute_path,
            byte_size: bytes.len(),
            deduplicated,
        })
    }
}

/// Serializes calls so that at most one is in flight and consecutive calls start
/// at least `min_interval` apart.
#[derive(Debug)]
pub struct IntervalGate {
    min_interval: Duration,
    last_finished: Mutex<Option<Instant>>,
}

impl IntervalGate {
    pub fn new(min_interval: Duration) -> Self {
        Self {
            min_interval,
            last_finished: Mutex::new(None),
        }
    }

    pub async fn run<F, T>(&self, call: F) -> T
    where
        F: Future<Output = T>,
    {
        let mut last = self.last_finished.lock().await;
        if let Some(previous) = *last {
            let elapsed = previous.elapsed();
            if elapsed < self.min_interval {
                let wait = self.min_interval - elapsed;
                debug!(?wait, "interval gate waiting");
                tokio::time::sleep(wait).await;
            }
        }
        let out = call.await;
        *last = Some(Instant::now());
        out
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
            max_retries: 3,
            base_delay: Duration::from_millis(250),
            max_delay: Duration::from_secs(5),
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
    pub per_scope_concurrency: usize,
    pub backoff: BackoffPolicy,
}

impl Default for HttpClientConfig {
    fn default() -> Self {
        Self {
            timeout: Duration::from_secs(20),
            user_agent: None,
            global_concurrency: 8,
            per_scope_concurrency: 4,
            backoff: BackoffPolicy::default(),
        }
    }
}

/// Shared HTTP client with a global and a per-scope concurrency cap plus retries.
///
/// A scope is whatever the caller groups requests by: a source id, `links`, `geocode`.
#[derive(Debug)]
pub struct HttpFetcher {
    client: reqwest::Client,
    global_limit: Arc<Semaphore>,
    per_scope_limit: usize,
    per_scope: Mutex<HashMap<String, Arc<Semaphore>>>,
    backoff: BackoffPolicy,
}

#[derive(Debug, Clone)]
pub struct FetchedResponse {
    pub status: StatusCode,
    pub final_url: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum FetchError {
    #[error("request failed after retries: {0}")]
    Request(#[from] reqwest::Error),
    #[error("http status {status} for {url}")]
    HttpStatus { status: u16, url: String },
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

        Ok(Self {
            client,
            global_limit: Arc::new(Semaphore::new(config.global_concurrency.max(1))),
            per_scope_limit: config.per_scope_concurrency.max(1),
            per_scope: Mutex::new(HashMap::new()),
            backoff: config.backoff,
        })
    }

    async fn per_scope_semaphore(&self, scope: &str) -> Arc<Semaphore> {
        let mut map = self.per_scope.lock().await;
        map.entry(scope.to_string())
            .or_insert_with(|| Arc::new(Semaphore::new(self.per_scope_limit)))
            .clone()
    }

    /// GET `url` and return the body of a successful response.
    pub async fn fetch_bytes(&self, scope: &str, url: &str) -> Result<FetchedResponse, FetchError> {
        self.fetch_bytes_paced(scope, url, None).await
    }

    /// Like [`HttpFetcher::fetch_bytes`], but every attempt, retries included,
    /// passes through `gate`.
    pub async fn fetch_bytes_gated(
        &self,
        scope: &str,
        url: &str,
        gate: &IntervalGate,
    ) -> Result<FetchedResponse, FetchError> {
        self.fetch_bytes_paced(scope, url, Some(gate)).await
    }

    async fn fetch_bytes_paced(
        &self,
        scope: &str,
        url: &str,
        gate: Option<&IntervalGate>,
    ) -> Result<FetchedResponse, FetchError> {
        let span = info_span!("http_fetch", scope, url);
        async {
            let resp = self.send_with_retry(scope, url, gate).await?;
            let status = resp.status();
            let final_url = resp.url().to_string();
            if !status.is_success() {
                return Err(FetchError::HttpStatus {
                    status: status.as_u16(),
                    url: final_url,
                });
            }
            let body = resp.bytes().await?.to_vec();
            Ok(FetchedResponse {
                status,
                final_url,
                body,
            })
        }
        .instrument(span)
        .await
    }

    /// GET `url` and report the final status without reading the body.
    pub async fn probe(&self, scope: &str, url: &str) -> Result<StatusCode, FetchError> {
        let span = info_span!("http_probe", scope, url);
        async { Ok(self.send_with_retry(scope, url, None).await?.status()) }
            .instrument(span)
            .await
    }

    async fn send_with_retry(
        &self,
        scope: &str,
        url: &str,
        gate: Option<&IntervalGate>,
    ) -> Result<reqwest::Response, FetchError> {
        let _global = self
            .global_limit
            .acquire()
            .await
            .expect("semaphore not closed");
        let per_scope = self.per_scope_semaphore(scope).await;
        let _scope = per_scope.acquire().await.expect("semaphore not closed");

        let mut attempt = 0;
        loop {
            let sent = match gate {
                Some(gate) => gate.run(self.client.get(url).send()).await,
                None => self.client.get(url).send().await,
            };
            match sent {
                Ok(resp) => {
                    let status = resp.status();
                    if !status.is_success()
                        && classify_status(status) == RetryDisposition::Retryable
                        && attempt < self.backoff.max_retries
                    {
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
                        tokio::time::sleep(self.backoff.delay_for_attempt(attempt)).await;
                        attempt += 1;
                        continue;
                    }
                    return Err(FetchError::Request(err));
                }
            }
        }
    }
}
