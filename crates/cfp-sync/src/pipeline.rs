use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use cfp_adapters::{adapter_for_source, AdapterContext};
use cfp_core::{Event, RawEvent};
use cfp_storage::{ArchiveStore, EventStore, HttpClientConfig, HttpFetcher, SnapshotStore};
use chrono::{DateTime, NaiveDate, Utc};
use serde::Serialize;
use tokio_cron_scheduler::{Job, JobScheduler};
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::{PipelineConfig, SourceRegistry};
use crate::enrich::{
    EnrichmentCache, EnrichmentPolicy, EnrichmentReport, Enricher, Geocoder, HttpLinkChecker,
    LinkChecker, NominatimGeocoder,
};
use crate::lifecycle::{archive_into, partition};
use crate::matcher::{AliasTable, IdentityMatcher};
use crate::merge::{NameDiscrepancy, SourcePolicy};
use crate::normalize::{normalize, NormalizeWarning, Rejection};
use crate::reconcile::{reconcile, Candidate, ReconcileCounts, ReviewItem};
use crate::report::write_run_reports;
use crate::validate::{validate, Violation};

#[derive(Debug, Clone, Serialize)]
pub struct SourceReport {
    pub source_id: String,
    pub records: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecordWarning {
    pub source_id: String,
    pub origin: Uuid,
    pub name: String,
    #[serde(flatten)]
    pub warning: NormalizeWarning,
}

#[derive(Debug, Clone, Serialize)]
pub struct InvalidRecord {
    pub name: String,
    pub year: i32,
    pub violations: Vec<Violation>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub reference_date: NaiveDate,
    pub dry_run: bool,
    /// A pre-existing record failed validation; nothing was written.
    pub blocked: bool,
    pub sources: Vec<SourceReport>,
    pub raw_records: usize,
    pub rejected: usize,
    #[serde(flatten)]
    pub counts: ReconcileCounts,
    pub newly_archived: usize,
    pub active_total: usize,
    pub rejections: Vec<Rejection>,
    pub warnings: Vec<RecordWarning>,
    pub review: Vec<ReviewItem>,
    pub blocking: Vec<InvalidRecord>,
    pub name_discrepancies: Vec<NameDiscrepancy>,
    pub enrichment: EnrichmentReport,
    pub store_sha256_before: Option<String>,
    pub store_sha256_after: Option<String>,
    pub store_written: bool,
    pub reports_dir: Option<String>,
}

/// Run `f` over `items` on the blocking pool, one chunk per available core,
/// returning results in input order.
pub async fn map_in_parallel<T, R, F>(items: Vec<T>, f: F) -> Result<Vec<R>>
where
    T: Send + 'static,
    R: Send + 'static,
    F: Fn(T) -> R + Send + Sync + 'static,
{
    if items.is_empty() {
        return Ok(Vec::new());
    }
    let workers = std::thread::available_parallelism()
        .map(|n| n.get())
        .unwrap_or(1);
    let chunk_size = items.len().div_ceil(workers);
    let f = Arc::new(f);
    let mut items = items.into_iter();
    let mut handles = Vec::with_capacity(workers);
    loop {
        let chunk: Vec<T> = items.by_ref().take(chunk_size).collect();
        if chunk.is_empty() {
            break;
        }
        let f = Arc::clone(&f);
        handles.push(tokio::task::spawn_blocking(move || {
            chunk.into_iter().map(|item| (*f)(item)).collect::<Vec<R>>()
        }));
    }
    let mut out = Vec::new();
    for handle in handles {
        out.extend(handle.await.context("joining worker task")?);
    }
    Ok(out)
}

pub struct ReconcilePipeline {
    config: PipelineConfig,
    http: Arc<HttpFetcher>,
    geocoder: Arc<dyn Geocoder>,
    link_checker: Arc<dyn LinkChecker>,
}

impl ReconcilePipeline {
    pub fn new(config: PipelineConfig) -> Result<Self> {
        let http = Arc::new(HttpFetcher::new(HttpClientConfig {
            timeout: Duration::from_secs(config.http_timeout_secs),
            user_agent: Some(config.user_agent.clone()),
            ..Default::default()
        })?);
        let geocoder = Arc::new(NominatimGeocoder::new(http.clone(), config.geocoder_url.clone()));
        let link_checker = Arc::new(HttpLinkChecker::new(
            http.clone(),
            config.archive_lookup_url.clone(),
        ));
        Ok(Self {
            config,
            http,
            geocoder,
            link_checker,
        })
    }

    pub fn with_enrichers(mut self, geocoder: Arc<dyn Geocoder>, link_checker: Arc<dyn LinkChecker>) -> Self {
        self.geocoder = geocoder;
        self.link_checker = link_checker;
        self
    }

    pub fn config(&self) -> &PipelineConfig {
        &self.config
    }

    pub async fn run_once(&self) -> Result<RunSummary> {
        let started_at = Utc::now();
        let run_id = Uuid::new_v4();
        let reference = self.config.today.unwrap_or_else(|| started_at.date_naive());
        let span = info_span!("reconcile_run", %run_id, %reference);
        self.run_inner(run_id, started_at, reference)
            .instrument(span)
            .await
    }

    async fn run_inner(&self, run_id: Uuid, started_at: DateTime<Utc>, reference: NaiveDate) -> Result<RunSummary> {
        let config = &self.config;
        let root = config.workspace_root.clone();

        let registry = SourceRegistry::load(&config.registry_path()).await?;
        let policy = SourcePolicy::from_registry(&registry);
        let aliases = AliasTable::load(&root)?;
        let matcher = IdentityMatcher::new(config.matcher, aliases);

        let store = EventStore::new(config.store_path());
        let archive_store = ArchiveStore::new(config.archive_dir());
        let canonical = store.load().await?;
        let mut archive = archive_store.load_all().await?;
        let store_sha256_before = store.digest().await?;
        info!(
            canonical = canonical.len(),
            archived_years = archive.len(),
            "loaded canonical stores"
        );

        let (raw, sources) = self.collect_sources(&registry, run_id, started_at).await;
        let raw_records = raw.len();

        let normalized = map_in_parallel(raw, |raw: RawEvent| normalize(&raw)).await?;
        let mut candidates = Vec::with_capacity(normalized.len());
        let mut rejections = Vec::new();
        let mut warnings = Vec::new();
        for result in normalized {
            match result {
                Ok(record) => {
                    warnings.extend(record.warnings.into_iter().map(|warning| RecordWarning {
                        source_id: record.source_id.clone(),
                        origin: record.origin,
                        name: record.event.name.clone(),
                        warning,
                    }));
                    candidates.push(Candidate {
                        source_id: record.source_id,
                        origin: record.origin,
                        event: record.event,
                    });
                }
                Err(rejection) => {
                    warn!(source_id = %rejection.source_id, reason = %rejection.reason, "record rejected");
                    rejections.push(rejection);
                }
            }
        }

        let reconciliation = reconcile(canonical, &mut archive, candidates, &matcher, &policy, reference);
        let counts = reconciliation.counts;
        info!(?counts, "reconciled candidates");

        let checked = map_in_parallel(reconciliation.collection, move |event: Event| {
            let violations = if event.is_elapsed(reference) {
                Vec::new()
            } else {
                validate(&event)
            };
            (event, violations)
        })
        .await?;
        let mut collection = Vec::with_capacity(checked.len());
        let mut blocking = Vec::new();
        for (event, violations) in checked {
            if !violations.is_empty() {
                blocking.push(InvalidRecord {
                    name: event.name.clone(),
                    year: event.year,
                    violations,
                });
            }
            collection.push(event);
        }
        let blocked = !blocking.is_empty();
        if blocked {
            error!(
                records = blocking.len(),
                "canonical store holds invalid records; refusing to write"
            );
        }

        let enricher = Enricher::new(
            self.geocoder.clone(),
            Some(self.link_checker.clone()),
            EnrichmentCache::load(config.cache_dir().join("geocode.json")).await?,
            EnrichmentCache::load(config.cache_dir().join("links.json")).await?,
            EnrichmentPolicy {
                link_stale: chrono::Duration::hours(config.link_stale_hours),
                geocode_retry: chrono::Duration::hours(config.geocode_retry_hours),
                concurrency: config.link_concurrency,
                check_links: !config.skip_links,
            },
        );
        let enrichment = if blocked {
            EnrichmentReport::default()
        } else {
            enricher.enrich(&mut collection, reference, Utc::now()).await
        };

        let split = partition(collection, reference);
        let newly_archived = split.elapsed.len();
        let delta = archive_into(&mut archive, split.elapsed);
        let mut touched_years = delta.touched_years;
        touched_years.extend(reconciliation.archive_years_touched.iter().copied());
        let active = split.active;

        let mut store_written = false;
        let mut store_sha256_after = store_sha256_before.clone();
        if !config.dry_run && !blocked {
            // Archive first: an interrupted run may leave an event in both
            // stores, which the next run folds back together.
            for year in &touched_years {
                let events = archive.get(year).map(Vec::as_slice).unwrap_or_default();
                archive_store.replace_year(*year, events).await?;
            }
            let outcome = store.replace(&active).await?;
            store_written = !outcome.unchanged;
            store_sha256_after = Some(outcome.sha256);
            enricher.persist().await?;
        }

        let mut summary = RunSummary {
            run_id,
            started_at,
            finished_at: Utc::now(),
            reference_date: reference,
            dry_run: config.dry_run,
            blocked,
            sources,
            raw_records,
            rejected: rejections.len(),
            counts,
            newly_archived,
            active_total: active.len(),
            rejections,
            warnings,
            review: reconciliation.review,
            blocking,
            name_discrepancies: reconciliation.discrepancies,
            enrichment,
            store_sha256_before,
            store_sha256_after,
            store_written,
            reports_dir: None,
        };

        if !config.dry_run {
            let reports_dir = config.reports_root().join(run_id.to_string());
            write_run_reports(&reports_dir, &summary, &active, &registry.sources).await?;
            summary.reports_dir = Some(reports_dir.display().to_string());
        }

        info!(
            inserted = summary.counts.inserted,
            merged = summary.counts.merged,
            flagged = summary.counts.flagged,
            invalid = summary.counts.invalid,
            archived = summary.newly_archived,
            written = summary.store_written,
            blocked = summary.blocked,
            "run finished"
        );
        Ok(summary)
    }

    async fn collect_sources(
        &self,
        registry: &SourceRegistry,
        run_id: Uuid,
        fetched_at: DateTime<Utc>,
    ) -> (Vec<RawEvent>, Vec<SourceReport>) {
        let snapshots = SnapshotStore::new(self.config.snapshots_dir());
        let ctx = AdapterContext {
            run_id,
            workspace_root: &self.config.workspace_root,
            http: &self.http,
            snapshots: &snapshots,
            fetched_at,
        };
        let mut raw = Vec::new();
        let mut reports = Vec::new();
        for source in registry.enabled() {
            let collected = match adapter_for_source(&source.source_id, source.mode, source.location.as_deref()) {
                Ok(adapter) => adapter.collect(&ctx).await,
                Err(err) => Err(err),
            };
            match collected {
                Ok(records) => {
                    info!(source_id = %source.source_id, records = records.len(), "collected source");
                    reports.push(SourceReport {
                        source_id: source.source_id.clone(),
                        records: records.len(),
                        error: None,
                    });
                    raw.extend(records);
                }
                Err(err) => {
                    warn!(source_id = %source.source_id, error = %err, "source collection failed");
                    reports.push(SourceReport {
                        source_id: source.source_id.clone(),
                        records: 0,
                        error: Some(err.to_string()),
                    });
                }
            }
        }
        (raw, reports)
    }

    pub async fn maybe_build_scheduler(&self) -> Result<Option<JobScheduler>> {
        if !self.config.scheduler_enabled {
            return Ok(None);
        }
        let sched = JobScheduler::new().await.context("creating scheduler")?;
        let cron = &self.config.sync_cron;
        let config = self.config.clone();
        let job = Job::new_async(cron, move |_uuid, _l| {
            let config = config.clone();
            Box::pin(async move {
                match run_with_config(config).await {
                    Ok(summary) => info!(
                        run_id = %summary.run_id,
                        blocked = summary.blocked,
                        "scheduled run finished"
                    ),
                    Err(err) => error!(error = %err, "scheduled run failed"),
                }
            })
        })
        .with_context(|| format!("creating scheduler job for cron {cron}"))?;
        sched.add(job).await.context("adding scheduler job")?;
        Ok(Some(sched))
    }
}

pub async fn run_with_config(config: PipelineConfig) -> Result<RunSummary> {
    ReconcilePipeline::new(config)?.run_once().await
}

pub async fn run_once_from_env() -> Result<RunSummary> {
    run_with_config(PipelineConfig::from_env()).await
}
