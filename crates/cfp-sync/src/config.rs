use std::collections::BTreeSet;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use cfp_adapters::SourceMode;
use cfp_core::FieldCategory;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::matcher::MatcherConfig;

#[derive(Debug, Clone, Deserialize)]
pub struct SourceRegistry {
    pub sources: Vec<SourceConfig>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SourceConfig {
    pub source_id: String,
    pub display_name: String,
    pub enabled: bool,
    pub mode: SourceMode,
    /// Tie-break between non-authoritative sources; higher wins.
    #[serde(default)]
    pub priority: i32,
    #[serde(default)]
    pub authoritative_for: BTreeSet<FieldCategory>,
    /// Relative path for file modes, payload URL for remote ones.
    #[serde(default)]
    pub location: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
}

impl SourceRegistry {
    pub async fn load(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path)
            .await
            .with_context(|| format!("reading {}", path.display()))?;
        let registry: Self =
            serde_yaml::from_str(&text).with_context(|| format!("parsing {}", path.display()))?;
        registry.check_unique_ids()?;
        Ok(registry)
    }

    fn check_unique_ids(&self) -> Result<()> {
        let mut seen = BTreeSet::new();
        for source in &self.sources {
            if !seen.insert(source.source_id.as_str()) {
                anyhow::bail!("duplicate source_id '{}' in registry", source.source_id);
            }
        }
        Ok(())
    }

    pub fn enabled(&self) -> impl Iterator<Item = &SourceConfig> {
        self.sources.iter().filter(|s| s.enabled)
    }
}

#[derive(Debug, Clone)]
pub struct PipelineConfig {
    pub workspace_root: PathBuf,
    pub user_agent: String,
    pub http_timeout_secs: u64,
    pub geocoder_url: String,
    pub archive_lookup_url: String,
    pub link_stale_hours: i64,
    pub geocode_retry_hours: i64,
    pub link_concurrency: usize,
    pub skip_links: bool,
    pub dry_run: bool,
    /// Reference date override; defaults to the current UTC date.
    pub today: Option<NaiveDate>,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
    pub matcher: MatcherConfig,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            workspace_root: PathBuf::from("."),
            user_agent: "cfp-reconciler/0.1".to_string(),
            http_timeout_secs: 20,
            geocoder_url: "https://nominatim.openstreetmap.org".to_string(),
            archive_lookup_url: "https://archive.org/wayback/available".to_string(),
            link_stale_hours: 168,
            geocode_retry_hours: 24,
            link_concurrency: 4,
            skip_links: false,
            dry_run: false,
            today: None,
            scheduler_enabled: false,
            sync_cron: "0 6 * * *".to_string(),
            matcher: MatcherConfig::default(),
        }
    }
}

fn env_flag(name: &str) -> Option<bool> {
    std::env::var(name)
        .ok()
        .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
}

fn env_parse<T: std::str::FromStr>(name: &str) -> Option<T> {
    std::env::var(name).ok().and_then(|v| v.parse().ok())
}

impl PipelineConfig {
    pub fn from_env() -> Self {
        let defaults = Self::default();
        Self {
            workspace_root: std::env::var("CFP_ROOT")
                .map(PathBuf::from)
                .unwrap_or(defaults.workspace_root),
            user_agent: std::env::var("CFP_USER_AGENT").unwrap_or(defaults.user_agent),
            http_timeout_secs: env_parse("CFP_HTTP_TIMEOUT_SECS").unwrap_or(defaults.http_timeout_secs),
            geocoder_url: std::env::var("CFP_GEOCODER_URL").unwrap_or(defaults.geocoder_url),
            archive_lookup_url: defaults.archive_lookup_url,
            link_stale_hours: env_parse("CFP_LINK_STALE_HOURS").unwrap_or(defaults.link_stale_hours),
            geocode_retry_hours: env_parse("CFP_GEOCODE_RETRY_HOURS")
                .unwrap_or(defaults.geocode_retry_hours),
            link_concurrency: env_parse("CFP_LINK_CONCURRENCY").unwrap_or(defaults.link_concurrency),
            skip_links: env_flag("CFP_SKIP_LINKS").unwrap_or(defaults.skip_links),
            dry_run: env_flag("CFP_DRY_RUN").unwrap_or(defaults.dry_run),
            today: None,
            scheduler_enabled: env_flag("CFP_SCHEDULER_ENABLED").unwrap_or(defaults.scheduler_enabled),
            sync_cron: std::env::var("SYNC_CRON").unwrap_or(defaults.sync_cron),
            matcher: defaults.matcher,
        }
    }

    pub fn with_root(root: impl Into<PathBuf>) -> Self {
        Self {
            workspace_root: root.into(),
            ..Self::default()
        }
    }

    pub fn registry_path(&self) -> PathBuf {
        self.workspace_root.join("sources.yaml")
    }

    pub fn store_path(&self) -> PathBuf {
        self.workspace_root.join("data").join("conferences.yml")
    }

    pub fn archive_dir(&self) -> PathBuf {
        self.workspace_root.join("data").join("archive")
    }

    pub fn cache_dir(&self) -> PathBuf {
        self.workspace_root.join("cache")
    }

    pub fn snapshots_dir(&self) -> PathBuf {
        self.workspace_root.join("snapshots")
    }

    pub fn reports_root(&self) -> PathBuf {
        self.workspace_root.join("reports")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn registry_yaml_parses_modes_and_authority() {
        let yaml = r#"
sources:
  - source_id: pycon-calendar
    display_name: PyCon calendar
    enabled: true
    mode: fixture
    priority: 10
    authoritative_for: [dates, links]
  - source_id: curated
    display_name: Curated entries
    enabled: false
    mode: manual
"#;
        let registry: SourceRegistry = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(registry.sources.len(), 2);
        assert_eq!(registry.sources[0].mode, SourceMode::Fixture);
        assert!(registry.sources[0]
            .authoritative_for
            .contains(&FieldCategory::Dates));
        assert_eq!(registry.sources[1].priority, 0);
        assert_eq!(registry.enabled().count(), 1);
        registry.check_unique_ids().unwrap();
    }

    #[test]
    fn duplicate_source_ids_are_rejected() {
        let yaml = r#"
sources:
  - { source_id: a, display_name: A, enabled: true, mode: fixture }
  - { source_id: a, display_name: A again, enabled: true, mode: manual }
"#;
        let registry: SourceRegistry = serde_yaml::from_str(yaml).unwrap();
        assert!(registry.check_unique_ids().is_err());
    }

    #[test]
    fn workspace_paths_hang_off_the_root() {
        let config = PipelineConfig::with_root("/srv/cfp");
        assert_eq!(config.store_path(), PathBuf::from("/srv/cfp/data/conferences.yml"));
        assert_eq!(config.archive_dir(), PathBuf::from("/srv/cfp/data/archive"));
        assert_eq!(config.link_stale_hours, 168);
    }
}
