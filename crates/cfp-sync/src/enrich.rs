//! Geocoding and link-liveness enrichment backed by persistent lookup caches.
//!
//! Each lookup key has its own async lock, so concurrent workers asking for the
//! same key make one external call and the rest read the cached answer.

use std::collections::{BTreeMap, BTreeSet, HashMap};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use cfp_core::{Coordinates, Event};
use cfp_storage::{read_json_or_default, write_json_atomic, FetchError, HttpFetcher, IntervalGate};
use chrono::{DateTime, NaiveDate, Utc};
use futures::stream::{self, StreamExt};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::{Mutex, OwnedMutexGuard};
use tracing::{debug, info, warn};
use url::Url;

/// Field owner recorded for coordinates filled in by the geocoder.
pub const GEOCODER_SOURCE: &str = "geocoder";

#[derive(Debug, Error)]
pub enum EnrichError {
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error("malformed lookup response: {0}")]
    Parse(String),
    #[error("invalid lookup url: {0}")]
    Url(#[from] url::ParseError),
}

#[async_trait]
pub trait Geocoder: Send + Sync {
    /// `Ok(None)` when the service has no match for the query.
    async fn geocode(&self, query: &str) -> Result<Option<Coordinates>, EnrichError>;
}

#[async_trait]
pub trait LinkChecker: Send + Sync {
    async fn check(&self, url: &str) -> Result<LinkStatus, EnrichError>;
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "state", rename_all = "snake_case")]
pub enum LinkStatus {
    Alive,
    /// Dead at the origin but a web archive copy exists.
    Archived { snapshot: String },
    Dead,
    /// The check itself failed; retried once the entry goes stale.
    Unknown,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GeocodeEntry {
    pub coordinates: Option<Coordinates>,
    pub looked_up_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LinkEntry {
    pub status: LinkStatus,
    pub checked_at: DateTime<Utc>,
}

/// Key -> entry map persisted as one JSON document.
pub struct EnrichmentCache<V> {
    path: Option<PathBuf>,
    entries: Mutex<BTreeMap<String, V>>,
    key_locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
    dirty: AtomicBool,
}

impl<V> EnrichmentCache<V>
where
    V: Clone + Serialize + DeserializeOwned + Send,
{
    pub async fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let entries: BTreeMap<String, V> = read_json_or_default(&path).await?;
        debug!(path = %path.display(), entries = entries.len(), "loaded enrichment cache");
        Ok(Self::with_entries(Some(path), entries))
    }

    pub fn in_memory() -> Self {
        Self::with_entries(None, BTreeMap::new())
    }

    fn with_entries(path: Option<PathBuf>, entries: BTreeMap<String, V>) -> Self {
        Self {
            path,
            entries: Mutex::new(entries),
            key_locks: Mutex::new(HashMap::new()),
            dirty: AtomicBool::new(false),
        }
    }

    /// Exclusive hold on one key; other keys stay available.
    pub async fn lock_key(&self, key: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.key_locks.lock().await;
            locks
                .entry(key.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())))
                .clone()
        };
        lock.lock_owned().await
    }

    pub async fn get(&self, key: &str) -> Option<V> {
        self.entries.lock().await.get(key).cloned()
    }

    pub async fn put(&self, key: &str, value: V) {
        self.entries.lock().await.insert(key.to_string(), value);
        self.dirty.store(true, Ordering::Release);
    }

    /// Write the cache back if anything changed since it was loaded.
    pub async fn persist(&self) -> Result<bool> {
        let Some(path) = &self.path else {
            return Ok(false);
        };
        if !self.dirty.swap(false, Ordering::AcqRel) {
            return Ok(false);
        }
        let entries = self.entries.lock().await;
        write_json_atomic(path, &*entries).await?;
        Ok(true)
    }
}

#[derive(Debug, Deserialize)]
struct NominatimHit {
    lat: String,
    lon: String,
}

/// OSM Nominatim search client; at most one request per second.
pub struct NominatimGeocoder {
    http: Arc<HttpFetcher>,
    base_url: String,
    gate: IntervalGate,
}

impl NominatimGeocoder {
    pub fn new(http: Arc<HttpFetcher>, base_url: impl Into<String>) -> Self {
        Self {
            http,
            base_url: base_url.into(),
            gate: IntervalGate::new(Duration::from_secs(1)),
        }
    }

    pub fn parse_response(body: &[u8]) -> Result<Option<Coordinates>, EnrichError> {
        let hits: Vec<NominatimHit> =
            serde_json::from_slice(body).map_err(|e| EnrichError::Parse(e.to_string()))?;
        let Some(hit) = hits.first() else {
            return Ok(None);
        };
        let lat = hit.lat.parse::<f64>().map_err(|e| EnrichError::Parse(e.to_string()))?;
        let lon = hit.lon.parse::<f64>().map_err(|e| EnrichError::Parse(e.to_string()))?;
        let coordinates = Coordinates { lat, lon };
        if !coordinates.in_bounds() {
            return Err(EnrichError::Parse(format!("coordinates ({lat}, {lon}) out of range")));
        }
        Ok(Some(coordinates.truncated()))
    }
}

#[async_trait]
impl Geocoder for NominatimGeocoder {
    async fn geocode(&self, query: &str) -> Result<Option<Coordinates>, EnrichError> {
        let endpoint = format!("{}/search", self.base_url.trim_end_matches('/'));
        let url = Url::parse_with_params(&endpoint, &[("q", query), ("format", "json"), ("limit", "1")])?;
        let response = self
            .http
            .fetch_bytes_gated("geocoder", url.as_str(), &self.gate)
            .await?;
        Self::parse_response(&response.body)
    }
}

#[derive(Debug, Default, Deserialize)]
struct WaybackAvailability {
    #[serde(default)]
    archived_snapshots: WaybackSnapshots,
}

#[derive(Debug, Default, Deserialize)]
struct WaybackSnapshots {
    closest: Option<WaybackSnapshot>,
}

#[derive(Debug, Deserialize)]
struct WaybackSnapshot {
    available: bool,
    url: String,
}

/// GET probe with a web-archive fallback for links that no longer resolve.
pub struct HttpLinkChecker {
    http: Arc<HttpFetcher>,
    archive_lookup_url: String,
}

impl HttpLinkChecker {
    pub fn new(http: Arc<HttpFetcher>, archive_lookup_url: impl Into<String>) -> Self {
        Self {
            http,
            archive_lookup_url: archive_lookup_url.into(),
        }
    }

    pub fn parse_availability(body: &[u8]) -> Result<LinkStatus, EnrichError> {
        let availability: WaybackAvailability =
            serde_json::from_slice(body).map_err(|e| EnrichError::Parse(e.to_string()))?;
        Ok(match availability.archived_snapshots.closest {
            Some(snapshot) if snapshot.available => LinkStatus::Archived {
                snapshot: snapshot.url,
            },
            _ => LinkStatus::Dead,
        })
    }
}

#[async_trait]
impl LinkChecker for HttpLinkChecker {
    async fn check(&self, url: &str) -> Result<LinkStatus, EnrichError> {
        match self.http.probe("links", url).await {
            Ok(status) if status.is_success() => return Ok(LinkStatus::Alive),
            Ok(status) => debug!(url, status = status.as_u16(), "link probe failed"),
            Err(err) => debug!(url, error = %err, "link probe errored"),
        }
        let lookup = Url::parse_with_params(&self.archive_lookup_url, &[("url", url)])?;
        let response = self.http.fetch_bytes("archive", lookup.as_str()).await?;
        Self::parse_availability(&response.body)
    }
}

#[derive(Debug, Clone, Copy)]
pub struct EnrichmentPolicy {
    pub link_stale: chrono::Duration,
    pub geocode_retry: chrono::Duration,
    pub concurrency: usize,
    pub check_links: bool,
}

impl Default for EnrichmentPolicy {
    fn default() -> Self {
        Self {
            link_stale: chrono::Duration::hours(168),
            geocode_retry: chrono::Duration::hours(24),
            concurrency: 4,
            check_links: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LinkFinding {
    pub name: String,
    pub year: i32,
    pub field: &'static str,
    pub url: String,
    pub status: LinkStatus,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct EnrichmentReport {
    pub geocoded: usize,
    pub geocode_calls: usize,
    pub geocode_cache_hits: usize,
    pub links_checked: usize,
    pub link_calls: usize,
    pub link_cache_hits: usize,
    pub link_findings: Vec<LinkFinding>,
    /// Records with a lookup that failed and will be retried on a later run.
    pub retry_next_run: Vec<String>,
}

enum Lookup<T> {
    Cached(T),
    Fetched(T),
}

impl<T> Lookup<T> {
    fn into_parts(self) -> (T, bool) {
        match self {
            Lookup::Cached(value) => (value, true),
            Lookup::Fetched(value) => (value, false),
        }
    }
}

/// Geocoder cache key: case and whitespace insensitive location text.
pub fn location_key(text: &str) -> String {
    text.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

pub struct Enricher {
    geocoder: Arc<dyn Geocoder>,
    link_checker: Option<Arc<dyn LinkChecker>>,
    geocode_cache: EnrichmentCache<GeocodeEntry>,
    link_cache: EnrichmentCache<LinkEntry>,
    policy: EnrichmentPolicy,
}

impl Enricher {
    pub fn new(
        geocoder: Arc<dyn Geocoder>,
        link_checker: Option<Arc<dyn LinkChecker>>,
        geocode_cache: EnrichmentCache<GeocodeEntry>,
        link_cache: EnrichmentCache<LinkEntry>,
        policy: EnrichmentPolicy,
    ) -> Self {
        Self {
            geocoder,
            link_checker,
            geocode_cache,
            link_cache,
            policy,
        }
    }

    /// Fill missing coordinates and check link liveness for records still
    /// current at `reference`. Liveness findings are reported, never applied.
    pub async fn enrich(&self, events: &mut [Event], reference: NaiveDate, now: DateTime<Utc>) -> EnrichmentReport {
        let mut report = EnrichmentReport::default();
        self.fill_coordinates(events, reference, now, &mut report).await;
        if self.policy.check_links {
            if let Some(checker) = &self.link_checker {
                self.check_links(checker.as_ref(), events, reference, now, &mut report)
                    .await;
            }
        }
        report.retry_next_run.sort();
        report.retry_next_run.dedup();
        info!(
            geocoded = report.geocoded,
            geocode_calls = report.geocode_calls,
            links_checked = report.links_checked,
            findings = report.link_findings.len(),
            "enrichment finished"
        );
        report
    }

    pub async fn persist(&self) -> Result<()> {
        self.geocode_cache.persist().await?;
        self.link_cache.persist().await?;
        Ok(())
    }

    async fn fill_coordinates(
        &self,
        events: &mut [Event],
        reference: NaiveDate,
        now: DateTime<Utc>,
        report: &mut EnrichmentReport,
    ) {
        let pending: Vec<(usize, String)> = events
            .iter()
            .enumerate()
            .filter(|(_, e)| e.coordinates.is_none() && !e.is_elapsed(reference))
            .filter_map(|(i, e)| e.location_text.as_deref().map(|t| (i, location_key(t))))
            .filter(|(_, key)| !key.is_empty())
            .collect();

        let results: Vec<(usize, Lookup<GeocodeEntry>)> = stream::iter(pending)
            .map(|(i, key)| async move { (i, self.geocode_cached(&key, now).await) })
            .buffer_unordered(self.policy.concurrency.max(1))
            .collect()
            .await;

        for (i, lookup) in results {
            let (entry, cached) = lookup.into_parts();
            if cached {
                report.geocode_cache_hits += 1;
            } else {
                report.geocode_calls += 1;
            }
            let event = &mut events[i];
            match entry.coordinates {
                Some(coordinates) => {
                    event.coordinates = Some(coordinates);
                    event
                        .field_sources
                        .insert("coordinates".to_string(), GEOCODER_SOURCE.to_string());
                    report.geocoded += 1;
                }
                None => report
                    .retry_next_run
                    .push(format!("{} {}", event.name, event.year)),
            }
        }
    }

    async fn geocode_cached(&self, key: &str, now: DateTime<Utc>) -> Lookup<GeocodeEntry> {
        let _guard = self.geocode_cache.lock_key(key).await;
        if let Some(entry) = self.geocode_cache.get(key).await {
            let fresh = entry.coordinates.is_some()
                || now - entry.looked_up_at < self.policy.geocode_retry;
            if fresh {
                return Lookup::Cached(entry);
            }
        }
        let entry = match self.geocoder.geocode(key).await {
            Ok(coordinates) => GeocodeEntry {
                coordinates,
                looked_up_at: now,
                error: None,
            },
            Err(err) => {
                warn!(query = key, error = %err, "geocoding failed");
                GeocodeEntry {
                    coordinates: None,
                    looked_up_at: now,
                    error: Some(err.to_string()),
                }
            }
        };
        self.geocode_cache.put(key, entry.clone()).await;
        Lookup::Fetched(entry)
    }

    async fn check_links(
        &self,
        checker: &dyn LinkChecker,
        events: &[Event],
        reference: NaiveDate,
        now: DateTime<Utc>,
        report: &mut EnrichmentReport,
    ) {
        let targets: Vec<(usize, &'static str, String)> = events
            .iter()
            .enumerate()
            .filter(|(_, e)| !e.is_elapsed(reference))
            .flat_map(|(i, e)| {
                [("primary_url", e.primary_url.clone()), ("cfp_url", e.cfp_url.clone())]
                    .into_iter()
                    .filter_map(move |(field, url)| url.map(|u| (i, field, u)))
            })
            .collect();
        let unique: BTreeSet<String> = targets.iter().map(|(_, _, url)| url.clone()).collect();

        let results: HashMap<String, Lookup<LinkEntry>> = stream::iter(unique)
            .map(|url| async move {
                let lookup = self.check_cached(checker, &url, now).await;
                (url, lookup)
            })
            .buffer_unordered(self.policy.concurrency.max(1))
            .collect()
            .await;

        let mut statuses = HashMap::new();
        for (url, lookup) in results {
            let (entry, cached) = lookup.into_parts();
            if cached {
                report.link_cache_hits += 1;
            } else {
                report.link_calls += 1;
            }
            statuses.insert(url, entry.status);
        }
        report.links_checked = statuses.len();

        for (i, field, url) in targets {
            let Some(status) = statuses.get(&url) else {
                continue;
            };
            let event = &events[i];
            match status {
                LinkStatus::Alive => {}
                LinkStatus::Unknown => report
                    .retry_next_run
                    .push(format!("{} {}", event.name, event.year)),
                other => report.link_findings.push(LinkFinding {
                    name: event.name.clone(),
                    year: event.year,
                    field,
                    url,
                    status: other.clone(),
                }),
            }
        }
    }

    async fn check_cached(&self, checker: &dyn LinkChecker, url: &str, now: DateTime<Utc>) -> Lookup<LinkEntry> {
        let _guard = self.link_cache.lock_key(url).await;
        if let Some(entry) = self.link_cache.get(url).await {
            if now - entry.checked_at < self.policy.link_stale {
                return Lookup::Cached(entry);
            }
        }
        let status = match checker.check(url).await {
            Ok(status) => status,
            Err(err) => {
                warn!(url, error = %err, "link check failed");
                LinkStatus::Unknown
            }
        };
        let entry = LinkEntry {
            status,
            checked_at: now,
        };
        self.link_cache.put(url, entry.clone()).await;
        Lookup::Fetched(entry)
    }
}
