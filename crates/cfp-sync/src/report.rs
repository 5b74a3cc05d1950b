//! Per-run report bundle: summary JSON, review queue, daily brief and a
//! parquet snapshot of the active store with a checksum manifest.

use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{BooleanArray, Float64Array, Int32Array, RecordBatch, StringArray, UInt32Array};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use cfp_core::Event;
use cfp_storage::sha256_hex;
use parquet::arrow::ArrowWriter;
use serde::{Deserialize, Serialize};
use tokio::fs;

use crate::config::SourceConfig;
use crate::pipeline::RunSummary;

pub const SUMMARY_FILE: &str = "summary.json";
pub const REVIEW_FILE: &str = "review_queue.yaml";
pub const BRIEF_FILE: &str = "daily_brief.md";

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParquetManifest {
    pub schema_version: u32,
    pub files: Vec<ParquetManifestFile>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ParquetManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

pub async fn write_run_reports(
    reports_dir: &Path,
    summary: &RunSummary,
    active: &[Event],
    sources: &[SourceConfig],
) -> Result<PathBuf> {
    fs::create_dir_all(reports_dir)
        .await
        .with_context(|| format!("creating {}", reports_dir.display()))?;

    let summary_json = serde_json::to_vec_pretty(summary).context("serializing run summary")?;
    fs::write(reports_dir.join(SUMMARY_FILE), summary_json)
        .await
        .context("writing summary.json")?;

    let review_yaml = serde_yaml::to_string(&summary.review).context("serializing review queue")?;
    fs::write(reports_dir.join(REVIEW_FILE), review_yaml)
        .await
        .context("writing review_queue.yaml")?;

    fs::write(reports_dir.join(BRIEF_FILE), daily_brief(summary, active))
        .await
        .context("writing daily_brief.md")?;

    export_parquet_snapshot(reports_dir, active, sources)
}

pub fn daily_brief(summary: &RunSummary, active: &[Event]) -> String {
    let counts = &summary.counts;
    let mut lines = vec![
        "# CFP Reconciliation Brief".to_string(),
        String::new(),
        format!("- Run ID: `{}`", summary.run_id),
        format!("- Reference date: {}", summary.reference_date),
        format!("- Started: {}", summary.started_at),
        format!("- Finished: {}", summary.finished_at),
        format!("- Raw records: {}", summary.raw_records),
        format!("- Inserted: {}", counts.inserted),
        format!("- Merged: {}", counts.merged),
        format!("- Unchanged: {}", counts.unchanged),
        format!("- Archived: {}", summary.newly_archived),
        format!("- Rejected: {}", summary.rejected + counts.invalid),
        format!("- Flagged for review: {}", counts.flagged),
        format!("- Active events: {}", summary.active_total),
    ];
    if summary.blocked {
        lines.push("- **Write blocked**: canonical records failed validation".to_string());
    }
    if summary.dry_run {
        lines.push("- Dry run: nothing was written".to_string());
    }

    lines.push(String::new());
    lines.push("## Sources".to_string());
    for source in &summary.sources {
        match &source.error {
            Some(err) => lines.push(format!("- {}: failed ({err})", source.source_id)),
            None => lines.push(format!("- {}: {}", source.source_id, source.records)),
        }
    }

    if !summary.blocking.is_empty() {
        lines.push(String::new());
        lines.push("## Blocking violations".to_string());
        for record in &summary.blocking {
            for violation in &record.violations {
                lines.push(format!(
                    "- {} {}: {}",
                    record.name, record.year, violation.message
                ));
            }
        }
    }

    let upcoming: Vec<&Event> = active
        .iter()
        .filter(|e| e.operative_deadline_utc().is_some())
        .take(10)
        .collect();
    if !upcoming.is_empty() {
        lines.push(String::new());
        lines.push("## Next deadlines".to_string());
        for event in upcoming {
            let deadline = event
                .operative_deadline()
                .map(|d| d.to_string())
                .unwrap_or_default();
            lines.push(format!(
                "- {} {}: {} {}",
                event.name, event.year, deadline, event.timezone
            ));
        }
    }

    if !summary.enrichment.link_findings.is_empty() {
        lines.push(String::new());
        lines.push("## Link findings".to_string());
        for finding in &summary.enrichment.link_findings {
            lines.push(format!(
                "- {} {} `{}`: {}",
                finding.name, finding.year, finding.field, finding.url
            ));
        }
    }
    lines.push(String::new());
    lines.join("\n")
}

/// Markdown digest of the most recent `runs` report directories.
pub fn report_recent_markdown(runs: usize, workspace_root: Option<PathBuf>) -> Result<String> {
    let root = workspace_root.unwrap_or_else(|| PathBuf::from("."));
    let reports_root = root.join("reports");
    let mut dirs = std::fs::read_dir(&reports_root)
        .with_context(|| format!("reading {}", reports_root.display()))?
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().map(|ft| ft.is_dir()).unwrap_or(false))
        .collect::<Vec<_>>();
    dirs.sort_by_key(|e| e.metadata().and_then(|m| m.modified()).ok());
    dirs.reverse();
    let dirs = dirs.into_iter().take(runs.max(1)).collect::<Vec<_>>();

    let mut lines = vec!["# CFP Reconciliation Runs".to_string(), String::new()];
    for dir in dirs {
        let run_id = dir.file_name().to_string_lossy().to_string();
        let summary_path = dir.path().join(SUMMARY_FILE);
        let manifest_path = dir.path().join("snapshots").join("manifest.json");
        let summary: serde_json::Value = serde_json::from_str(
            &std::fs::read_to_string(&summary_path)
                .with_context(|| format!("reading {}", summary_path.display()))?,
        )
        .with_context(|| format!("parsing {}", summary_path.display()))?;
        let count = |key: &str| summary.get(key).and_then(|v| v.as_u64()).unwrap_or(0);

        lines.push(format!("## Run `{run_id}`"));
        lines.push(format!(
            "- reference date: {}",
            summary
                .get("reference_date")
                .and_then(|v| v.as_str())
                .unwrap_or("unknown")
        ));
        for key in ["inserted", "merged", "newly_archived", "rejected", "invalid", "flagged"] {
            lines.push(format!("- {key}: {}", count(key)));
        }
        if summary.get("blocked").and_then(|v| v.as_bool()) == Some(true) {
            lines.push("- blocked: true".to_string());
        }
        lines.push(format!("- summary: `{}`", summary_path.display()));
        if manifest_path.exists() {
            lines.push(format!("- parquet manifest: `{}`", manifest_path.display()));
        }
        lines.push(String::new());
    }
    Ok(lines.join("\n"))
}

fn export_parquet_snapshot(reports_dir: &Path, active: &[Event], sources: &[SourceConfig]) -> Result<PathBuf> {
    let snapshot_dir = reports_dir.join("snapshots");
    std::fs::create_dir_all(&snapshot_dir)
        .with_context(|| format!("creating {}", snapshot_dir.display()))?;

    let events_path = snapshot_dir.join("events.parquet");
    let sources_path = snapshot_dir.join("sources.parquet");
    write_events_parquet(&events_path, active)?;
    write_sources_parquet(&sources_path, sources)?;

    let manifest = ParquetManifest {
        schema_version: 1,
        files: vec![
            manifest_entry("events", reports_dir, &events_path)?,
            manifest_entry("sources", reports_dir, &sources_path)?,
        ],
    };
    let manifest_path = snapshot_dir.join("manifest.json");
    let bytes = serde_json::to_vec_pretty(&manifest).context("serializing parquet manifest")?;
    std::fs::write(&manifest_path, bytes)
        .with_context(|| format!("writing {}", manifest_path.display()))?;
    Ok(manifest_path)
}

fn write_parquet(path: &Path, batch: RecordBatch) -> Result<()> {
    let file = File::create(path).with_context(|| format!("creating {}", path.display()))?;
    let mut writer = ArrowWriter::try_new(file, batch.schema(), None)
        .with_context(|| format!("opening parquet writer {}", path.display()))?;
    writer
        .write(&batch)
        .with_context(|| format!("writing record batch {}", path.display()))?;
    writer
        .close()
        .with_context(|| format!("closing parquet writer {}", path.display()))?;
    Ok(())
}

fn write_events_parquet(path: &Path, events: &[Event]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("name", DataType::Utf8, false),
        ArrowField::new("year", DataType::Int32, false),
        ArrowField::new("primary_url", DataType::Utf8, true),
        ArrowField::new("cfp_deadline", DataType::Utf8, true),
        ArrowField::new("deadline_utc", DataType::Utf8, true),
        ArrowField::new("start_date", DataType::Utf8, true),
        ArrowField::new("end_date", DataType::Utf8, true),
        ArrowField::new("location_text", DataType::Utf8, true),
        ArrowField::new("lat", DataType::Float64, true),
        ArrowField::new("lon", DataType::Float64, true),
        ArrowField::new("timezone", DataType::Utf8, false),
        ArrowField::new("source_count", DataType::UInt32, false),
        ArrowField::new("manually_edited", DataType::Boolean, false),
    ]));
    let names = StringArray::from(events.iter().map(|e| Some(e.name.as_str())).collect::<Vec<_>>());
    let years = Int32Array::from(events.iter().map(|e| e.year).collect::<Vec<_>>());
    let urls = StringArray::from(events.iter().map(|e| e.primary_url.as_deref()).collect::<Vec<_>>());
    let deadlines = StringArray::from(
        events
            .iter()
            .map(|e| e.cfp_deadline.map(|d| d.to_string()))
            .collect::<Vec<_>>(),
    );
    let deadlines_utc = StringArray::from(
        events
            .iter()
            .map(|e| e.operative_deadline_utc().map(|at| at.to_rfc3339()))
            .collect::<Vec<_>>(),
    );
    let starts = StringArray::from(
        events
            .iter()
            .map(|e| e.start_date.map(|d| d.to_string()))
            .collect::<Vec<_>>(),
    );
    let ends = StringArray::from(
        events
            .iter()
            .map(|e| e.end_date.map(|d| d.to_string()))
            .collect::<Vec<_>>(),
    );
    let locations = StringArray::from(
        events
            .iter()
            .map(|e| e.location_text.as_deref())
            .collect::<Vec<_>>(),
    );
    let lats = Float64Array::from(events.iter().map(|e| e.coordinates.map(|c| c.lat)).collect::<Vec<_>>());
    let lons = Float64Array::from(events.iter().map(|e| e.coordinates.map(|c| c.lon)).collect::<Vec<_>>());
    let timezones = StringArray::from(
        events
            .iter()
            .map(|e| Some(e.timezone.to_string()))
            .collect::<Vec<_>>(),
    );
    let source_counts = UInt32Array::from(
        events
            .iter()
            .map(|e| e.source_provenance.len() as u32)
            .collect::<Vec<_>>(),
    );
    let manual = BooleanArray::from(events.iter().map(|e| e.manually_edited).collect::<Vec<_>>());

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(names),
            Arc::new(years),
            Arc::new(urls),
            Arc::new(deadlines),
            Arc::new(deadlines_utc),
            Arc::new(starts),
            Arc::new(ends),
            Arc::new(locations),
            Arc::new(lats),
            Arc::new(lons),
            Arc::new(timezones),
            Arc::new(source_counts),
            Arc::new(manual),
        ],
    )
    .context("building events record batch")?;
    write_parquet(path, batch)
}

fn write_sources_parquet(path: &Path, sources: &[SourceConfig]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("source_id", DataType::Utf8, false),
        ArrowField::new("display_name", DataType::Utf8, false),
        ArrowField::new("mode", DataType::Utf8, false),
        ArrowField::new("priority", DataType::Int32, false),
        ArrowField::new("enabled", DataType::Boolean, false),
    ]));
    let source_ids = StringArray::from(
        sources
            .iter()
            .map(|s| Some(s.source_id.as_str()))
            .collect::<Vec<_>>(),
    );
    let display_names = StringArray::from(
        sources
            .iter()
            .map(|s| Some(s.display_name.as_str()))
            .collect::<Vec<_>>(),
    );
    let modes = StringArray::from(
        sources
            .iter()
            .map(|s| Some(format!("{:?}", s.mode).to_lowercase()))
            .collect::<Vec<_>>(),
    );
    let priorities = Int32Array::from(sources.iter().map(|s| s.priority).collect::<Vec<_>>());
    let enabled = BooleanArray::from(sources.iter().map(|s| s.enabled).collect::<Vec<_>>());
    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(source_ids),
            Arc::new(display_names),
            Arc::new(modes),
            Arc::new(priorities),
            Arc::new(enabled),
        ],
    )
    .context("building sources record batch")?;
    write_parquet(path, batch)
}

fn manifest_entry(name: &str, reports_dir: &Path, path: &Path) -> Result<ParquetManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let rel = path
        .strip_prefix(reports_dir)
        .unwrap_or(path)
        .display()
        .to_string();
    Ok(ParquetManifestFile {
        name: name.to_string(),
        path: rel,
        sha256: sha256_hex(&bytes),
        bytes: bytes.len() as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use cfp_adapters::SourceMode;
    use cfp_core::Deadline;
    use chrono::{NaiveDate, NaiveDateTime};
    use tempfile::tempdir;

    fn event(name: &str) -> Event {
        let mut e = Event::new(name, 2025);
        e.cfp_deadline = Some(Deadline::At(
            NaiveDateTime::parse_from_str("2025-01-15 23:59:00", "%Y-%m-%d %H:%M:%S").unwrap(),
        ));
        e.start_date = NaiveDate::from_ymd_opt(2025, 5, 14);
        e.source_provenance.insert("pycon-calendar".into());
        e
    }

    fn source() -> SourceConfig {
        SourceConfig {
            source_id: "pycon-calendar".into(),
            display_name: "PyCon calendar".into(),
            enabled: true,
            mode: SourceMode::Fixture,
            priority: 1,
            authoritative_for: Default::default(),
            location: None,
            notes: None,
        }
    }

    #[test]
    fn parquet_snapshot_writes_manifest_with_checksums() {
        let dir = tempdir().unwrap();
        let manifest_path =
            export_parquet_snapshot(dir.path(), &[event("PyCon US"), event("EuroPython")], &[source()])
                .unwrap();
        let manifest: ParquetManifest =
            serde_json::from_str(&std::fs::read_to_string(&manifest_path).unwrap()).unwrap();
        assert_eq!(manifest.files.len(), 2);
        for file in &manifest.files {
            let bytes = std::fs::read(dir.path().join(&file.path)).unwrap();
            assert_eq!(file.sha256, sha256_hex(&bytes));
            assert_eq!(file.bytes, bytes.len() as u64);
            assert!(bytes.starts_with(b"PAR1"));
        }
    }
}
