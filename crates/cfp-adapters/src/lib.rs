//! Source adapter contracts + bundle, curated and remote adapter implementations.
//!
//! Adapters only shape records: they deserialize source payloads into
//! [`RawRecord`]s and tag them with provenance. All cleanup happens in the
//! normalizer.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::Context;
use async_trait::async_trait;
use cfp_core::{RawEvent, RawRecord};
use cfp_storage::{FetchError, HttpFetcher, SnapshotStore};
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::debug;
use uuid::Uuid;

pub const CRATE_NAME: &str = "cfp-adapters";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceMode {
    /// Captured JSON bundle on disk.
    Fixture,
    /// Hand-curated YAML list; records are manual edits.
    Manual,
    /// JSON records fetched over HTTPS.
    Remote,
}

pub struct AdapterContext<'a> {
    pub run_id: Uuid,
    pub workspace_root: &'a Path,
    pub http: &'a HttpFetcher,
    pub snapshots: &'a SnapshotStore,
    pub fetched_at: DateTime<Utc>,
}

#[derive(Debug, Error)]
pub enum AdapterError {
    #[error("bundle at {path} belongs to source '{found}', expected '{expected}'")]
    SourceMismatch {
        path: String,
        expected: String,
        found: String,
    },
    #[error("source '{0}' has no location configured")]
    MissingLocation(String),
    #[error(transparent)]
    Fetch(#[from] FetchError),
    #[error(transparent)]
    Anyhow(#[from] anyhow::Error),
}

#[async_trait]
pub trait SourceAdapter: Send + Sync {
    fn source_id(&self) -> &str;
    fn mode(&self) -> SourceMode;

    async fn collect(&self, ctx: &AdapterContext<'_>) -> Result<Vec<RawEvent>, AdapterError>;
}

/// Captured source payload: records plus where and when they were taken.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecordBundle {
    pub bundle_id: String,
    pub source_id: String,
    pub captured_from_url: String,
    pub fetched_at: DateTime<Utc>,
    pub records: Vec<RawRecord>,
    #[serde(default)]
    pub notes: Option<String>,
}

pub fn load_bundle(path: impl AsRef<Path>) -> anyhow::Result<RecordBundle> {
    read_json_file(path)
}

fn read_json_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> anyhow::Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_json::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

fn read_yaml_file<T: DeserializeOwned>(path: impl AsRef<Path>) -> anyhow::Result<T> {
    let path = path.as_ref();
    let data = fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))?;
    serde_yaml::from_str(&data).with_context(|| format!("parsing {}", path.display()))
}

/// Stable per-record id: same source, payload locator and position give the same id.
pub fn deterministic_origin_id(source_id: &str, locator: &str, position: usize) -> Uuid {
    let key = format!("{source_id}:{locator}:{position}");
    Uuid::new_v5(&Uuid::NAMESPACE_URL, key.as_bytes())
}

fn tag_records(
    source_id: &str,
    locator: &str,
    manually_edited: bool,
    records: Vec<RawRecord>,
) -> Vec<RawEvent> {
    records
        .into_iter()
        .enumerate()
        .map(|(position, record)| RawEvent {
            source_id: source_id.to_string(),
            origin: deterministic_origin_id(source_id, locator, position),
            manually_edited,
            record,
        })
        .collect()
}

#[derive(Debug, Clone)]
pub struct BundleAdapter {
    source_id: String,
    path: Option<PathBuf>,
}

impl BundleAdapter {
    pub fn new(source_id: impl Into<String>, path: Option<PathBuf>) -> Self {
        Self {
            source_id: source_id.into(),
            path,
        }
    }

    fn bundle_path(&self, root: &Path) -> PathBuf {
        match &self.path {
            Some(path) => root.join(path),
            None => root
                .join("fixtures")
                .join(&self.source_id)
                .join("bundle.json"),
        }
    }
}

#[async_trait]
impl SourceAdapter for BundleAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn mode(&self) -> SourceMode {
        SourceMode::Fixture
    }

    async fn collect(&self, ctx: &AdapterContext<'_>) -> Result<Vec<RawEvent>, AdapterError> {
        let path = self.bundle_path(ctx.workspace_root);
        let bundle = load_bundle(&path)?;
        if bundle.source_id != self.source_id {
            return Err(AdapterError::SourceMismatch {
                path: path.display().to_string(),
                expected: self.source_id.clone(),
                found: bundle.source_id,
            });
        }
        debug!(
            source_id = %self.source_id,
            bundle_id = %bundle.bundle_id,
            records = bundle.records.len(),
            "loaded record bundle"
        );
        Ok(tag_records(
            &self.source_id,
            &bundle.bundle_id,
            false,
            bundle.records,
        ))
    }
}

#[derive(Debug, Clone)]
pub struct CuratedYamlAdapter {
    source_id: String,
    path: Option<PathBuf>,
}

impl CuratedYamlAdapter {
    pub fn new(source_id: impl Into<String>, path: Option<PathBuf>) -> Self {
        Self {
            source_id: source_id.into(),
            path,
        }
    }

    fn list_path(&self, root: &Path) -> PathBuf {
        match &self.path {
            Some(path) => root.join(path),
            None => root.join("manual").join(format!("{}.yaml", self.source_id)),
        }
    }
}

#[async_trait]
impl SourceAdapter for CuratedYamlAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn mode(&self) -> SourceMode {
        SourceMode::Manual
    }

    async fn collect(&self, ctx: &AdapterContext<'_>) -> Result<Vec<RawEvent>, AdapterError> {
        let path = self.list_path(ctx.workspace_root);
        if !path.exists() {
            debug!(source_id = %self.source_id, path = %path.display(), "no curated entries");
            return Ok(Vec::new());
        }
        let records: Vec<RawRecord> = read_yaml_file(&path)?;
        let locator = path.strip_prefix(ctx.workspace_root).unwrap_or(&path);
        Ok(tag_records(
            &self.source_id,
            &locator.display().to_string(),
            true,
            records,
        ))
    }
}

#[derive(Debug, Deserialize)]
#[serde(untagged)]
enum RemotePayload {
    Records(Vec<RawRecord>),
    Bundle { records: Vec<RawRecord> },
}

#[derive(Debug, Clone)]
pub struct RemoteJsonAdapter {
    source_id: String,
    url: String,
}

impl RemoteJsonAdapter {
    pub fn new(source_id: impl Into<String>, url: impl Into<String>) -> Self {
        Self {
            source_id: source_id.into(),
            url: url.into(),
        }
    }

    pub fn parse_payload(&self, body: &[u8]) -> Result<Vec<RawEvent>, AdapterError> {
        let payload: RemotePayload = serde_json::from_slice(body)
            .with_context(|| format!("parsing payload from {}", self.url))?;
        let records = match payload {
            RemotePayload::Records(records) | RemotePayload::Bundle { records } => records,
        };
        Ok(tag_records(&self.source_id, &self.url, false, records))
    }
}

#[async_trait]
impl SourceAdapter for RemoteJsonAdapter {
    fn source_id(&self) -> &str {
        &self.source_id
    }

    fn mode(&self) -> SourceMode {
        SourceMode::Remote
    }

    async fn collect(&self, ctx: &AdapterContext<'_>) -> Result<Vec<RawEvent>, AdapterError> {
        let response = ctx.http.fetch_bytes(&self.source_id, &self.url).await?;
        let stored = ctx
            .snapshots
            .store_bytes(ctx.fetched_at, &self.source_id, "json", &response.body)
            .await?;
        debug!(
            run_id = %ctx.run_id,
            source_id = %self.source_id,
            snapshot = %stored.relative_path.display(),
            deduplicated = stored.deduplicated,
            "captured remote payload"
        );
        self.parse_payload(&response.body)
    }
}

/// Build the adapter for a registry entry. `location` is a path relative to the
/// workspace root for file modes and the payload URL for remote sources.
pub fn adapter_for_source(
    source_id: &str,
    mode: SourceMode,
    location: Option<&str>,
) -> Result<Box<dyn SourceAdapter>, AdapterError> {
    let adapter: Box<dyn SourceAdapter> = match mode {
        SourceMode::Fixture => Box::new(BundleAdapter::new(source_id, location.map(PathBuf::from))),
        SourceMode::Manual => Box::new(CuratedYamlAdapter::new(
            source_id,
            location.map(PathBuf::from),
        )),
        SourceMode::Remote => {
            let url = location.ok_or_else(|| AdapterError::MissingLocation(source_id.to_string()))?;
            Box::new(RemoteJsonAdapter::new(source_id, url))
        }
    };
    Ok(adapter)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn origin_ids_are_deterministic_per_position() {
        let a = deterministic_origin_id("pycon-calendar", "bundle-1", 0);
        let b = deterministic_origin_id("pycon-calendar", "bundle-1", 0);
        let c = deterministic_origin_id("pycon-calendar", "bundle-1", 1);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn remote_payload_accepts_bare_arrays_and_wrapped_records() {
        let adapter = RemoteJsonAdapter::new("community", "https://example.org/events.json");
        let bare = adapter
            .parse_payload(br#"[{"conference": "PyCon US", "year": 2025}]"#)
            .expect("bare array");
        let wrapped = adapter
            .parse_payload(br#"{"records": [{"name": "PyCon US", "year": "2025"}]}"#)
            .expect("wrapped");
        assert_eq!(bare.len(), 1);
        assert_eq!(wrapped.len(), 1);
        assert_eq!(bare[0].record.name.as_deref(), Some("PyCon US"));
        assert_eq!(bare[0].origin, wrapped[0].origin);
        assert!(!bare[0].manually_edited);
    }

    #[test]
    fn remote_sources_require_a_location() {
        let err = adapter_for_source("community", SourceMode::Remote, None)
            .err()
            .expect("missing url");
        assert!(matches!(err, AdapterError::MissingLocation(_)));
        let ok = adapter_for_source("curated", SourceMode::Manual, None).expect("manual");
        assert_eq!(ok.mode(), SourceMode::Manual);
        assert_eq!(ok.source_id(), "curated");
    }
}
