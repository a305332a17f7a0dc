//! Per-run report files under `<reports_dir>/<run_id>/`.

use std::collections::BTreeMap;
use std::fs::File;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use arrow_array::{Int64Array, RecordBatch, StringArray};
use arrow_schema::{DataType, Field as ArrowField, Schema};
use parquet::arrow::ArrowWriter;
use ph_storage::{sha256_hex, write_atomic, write_json_atomic};
use serde::Serialize;
use tokio::fs;

use crate::reconcile::{OutcomeStatus, RecordOutcome, RunSummary};

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotManifest {
    pub schema_version: u32,
    pub files: Vec<SnapshotManifestFile>,
}

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotManifestFile {
    pub name: String,
    pub path: String,
    pub sha256: String,
    pub bytes: u64,
}

#[derive(Debug, Clone)]
pub struct RunReportPaths {
    pub dir: PathBuf,
    pub summary: PathBuf,
    pub brief: PathBuf,
    pub outcomes: PathBuf,
    pub manifest: PathBuf,
}

pub async fn write_run_report(reports_root: &Path, summary: &RunSummary) -> Result<RunReportPaths> {
    let dir = reports_root.join(summary.run_id.to_string());
    fs::create_dir_all(&dir)
        .await
        .with_context(|| format!("creating {}", dir.display()))?;

    let summary_path = dir.join("summary.json");
    write_json_atomic(&summary_path, summary).await?;

    let brief_path = dir.join("run_brief.md");
    write_atomic(&brief_path, run_brief_markdown(summary).as_bytes())
        .await
        .context("writing run_brief.md")?;

    let outcomes_path = dir.join("outcomes.json");
    write_json_atomic(&outcomes_path, &summary.outcomes).await?;

    let snapshot_dir = dir.join("snapshots");
    fs::create_dir_all(&snapshot_dir)
        .await
        .with_context(|| format!("creating {}", snapshot_dir.display()))?;
    let parquet_path = snapshot_dir.join("outcomes.parquet");
    write_outcomes_parquet(&parquet_path, &summary.outcomes)?;

    let manifest = SnapshotManifest {
        schema_version: 1,
        files: vec![
            manifest_entry("summary", &dir, &summary_path)?,
            manifest_entry("outcomes", &dir, &outcomes_path)?,
            manifest_entry("outcomes_parquet", &dir, &parquet_path)?,
        ],
    };
    let manifest_path = snapshot_dir.join("manifest.json");
    write_json_atomic(&manifest_path, &manifest).await?;

    Ok(RunReportPaths {
        dir,
        summary: summary_path,
        brief: brief_path,
        outcomes: outcomes_path,
        manifest: manifest_path,
    })
}

pub fn run_brief_markdown(summary: &RunSummary) -> String {
    let c = &summary.counters;
    let mut failures_by_class: BTreeMap<String, usize> = BTreeMap::new();
    for outcome in summary.outcomes.iter().filter(|o| o.status == OutcomeStatus::Failed) {
        let class = outcome
            .error_class
            .map(|c| format!("{c:?}").to_lowercase())
            .unwrap_or_else(|| "unclassified".to_string());
        *failures_by_class.entry(class).or_default() += 1;
    }

    let mut lines = vec![
        "# Parent Helper Sync Run".to_string(),
        String::new(),
        format!("- Run ID: `{}`", summary.run_id),
        format!("- Job: `{}`", summary.job),
        format!("- Started: {}", summary.started_at),
        format!("- Finished: {}", summary.finished_at),
        format!("- Final state: {:?}", summary.final_state),
        format!("- Stop reason: {:?}", summary.stop_reason),
        format!("- Start cursor: `{:?}`", summary.start_cursor),
        format!("- Watermark: `{:?}`", summary.watermark),
        String::new(),
        "## Counters".to_string(),
        format!("- Processed: {}", c.processed),
        format!("- Added: {}", c.added),
        format!("- Skipped: {}", c.skipped),
        format!("- Failed: {}", c.failed),
        format!("- Pages read: {}", c.pages_read),
        format!("- Batches sent: {}", c.batches_sent),
        format!("- Retries: {}", c.retries),
        format!(
            "- Enrichment: {} filled, {} no match, {} errors",
            c.enriched, c.enrichment_misses, c.enrichment_failures
        ),
    ];
    if let Some(error) = &summary.error {
        lines.push(String::new());
        lines.push("## Abort".to_string());
        lines.push(error.clone());
    }
    if !failures_by_class.is_empty() {
        lines.push(String::new());
        lines.push("## Failures".to_string());
        for (class, count) in &failures_by_class {
            lines.push(format!("- {class}: {count}"));
        }
        for outcome in summary
            .outcomes
            .iter()
            .filter(|o| o.status == OutcomeStatus::Failed)
            .take(20)
        {
            lines.push(format!(
                "  - {}: {}",
                outcome.label,
                outcome.detail.as_deref().unwrap_or("-")
            ));
        }
    }
    lines.push(String::new());
    lines.join("\n")
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

fn write_outcomes_parquet(path: &Path, outcomes: &[RecordOutcome]) -> Result<()> {
    let schema = Arc::new(Schema::new(vec![
        ArrowField::new("source_id", DataType::Int64, false),
        ArrowField::new("label", DataType::Utf8, false),
        ArrowField::new("match_key", DataType::Utf8, true),
        ArrowField::new("status", DataType::Utf8, false),
        ArrowField::new("error_class", DataType::Utf8, true),
        ArrowField::new("detail", DataType::Utf8, true),
        ArrowField::new("destination_id", DataType::Utf8, true),
    ]));

    let classes = outcomes
        .iter()
        .map(|o| o.error_class.map(|c| format!("{c:?}").to_lowercase()))
        .collect::<Vec<_>>();

    let batch = RecordBatch::try_new(
        schema,
        vec![
            Arc::new(Int64Array::from(
                outcomes.iter().map(|o| o.source_id).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                outcomes.iter().map(|o| Some(o.label.as_str())).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                outcomes.iter().map(|o| o.match_key.as_deref()).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                outcomes.iter().map(|o| Some(o.status.as_str())).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                classes.iter().map(|c| c.as_deref()).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                outcomes.iter().map(|o| o.detail.as_deref()).collect::<Vec<_>>(),
            )),
            Arc::new(StringArray::from(
                outcomes.iter().map(|o| o.destination_id.as_deref()).collect::<Vec<_>>(),
            )),
        ],
    )
    .context("building outcomes record batch")?;
    write_parquet(path, batch)
}

fn manifest_entry(name: &str, root: &Path, path: &Path) -> Result<SnapshotManifestFile> {
    let bytes = std::fs::read(path).with_context(|| format!("reading {}", path.display()))?;
    let rel = path.strip_prefix(root).unwrap_or(path).display().to_string();
    Ok(SnapshotManifestFile {
        name: name.to_string(),
        path: rel,
        sha256: sha256_hex(&bytes),
        bytes: bytes.len() as u64,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reconcile::{LoopState, StopReason};
    use crate::ErrorClass;
    use chrono::Utc;
    use ph_core::{Cursor, ProgressCounters};
    use uuid::Uuid;

    fn summary() -> RunSummary {
        RunSummary {
            run_id: Uuid::new_v4(),
            job: "nightly".into(),
            started_at: Utc::now(),
            finished_at: Utc::now(),
            final_state: LoopState::Done,
            stop_reason: StopReason::Exhausted,
            error: None,
            counters: ProgressCounters {
                processed: 2,
                added: 1,
                failed: 1,
                pages_read: 1,
                batches_sent: 1,
                ..Default::default()
            },
            start_cursor: Cursor::ById { after: None },
            watermark: Cursor::ById { after: Some(2) },
            trace: vec![LoopState::Idle, LoopState::Reading, LoopState::Done],
            outcomes: vec![
                RecordOutcome {
                    source_id: 1,
                    label: "#1 Baby Sensory Andover (SP10 2BX)".into(),
                    match_key: Some("baby sensory andover|pc:SP102BX".into()),
                    status: OutcomeStatus::Added,
                    error_class: None,
                    detail: None,
                    destination_id: Some("rec1".into()),
                },
                RecordOutcome {
                    source_id: 2,
                    label: "#2 <unnamed> (Romsey)".into(),
                    match_key: None,
                    status: OutcomeStatus::Failed,
                    error_class: Some(ErrorClass::Data),
                    detail: Some("record 2 has no business name".into()),
                    destination_id: None,
                },
            ],
        }
    }

    #[tokio::test]
    async fn writes_all_report_files_with_manifest_hashes() {
        let dir = tempfile::tempdir().unwrap();
        let summary = summary();
        let paths = write_run_report(dir.path(), &summary).await.unwrap();

        assert_eq!(paths.dir, dir.path().join(summary.run_id.to_string()));
        let json: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&paths.summary).unwrap()).unwrap();
        assert_eq!(json["stop_reason"], "exhausted");
        assert_eq!(json["watermark"]["after"], 2);
        assert!(json.get("outcomes").is_none());

        let outcomes: Vec<RecordOutcome> =
            serde_json::from_slice(&std::fs::read(&paths.outcomes).unwrap()).unwrap();
        assert_eq!(outcomes, summary.outcomes);

        let manifest: serde_json::Value =
            serde_json::from_slice(&std::fs::read(&paths.manifest).unwrap()).unwrap();
        let files = manifest["files"].as_array().unwrap();
        assert_eq!(files.len(), 3);
        let parquet = &files[2];
        assert_eq!(parquet["path"], "snapshots/outcomes.parquet");
        let bytes = std::fs::read(paths.dir.join("snapshots/outcomes.parquet")).unwrap();
        assert_eq!(parquet["sha256"], sha256_hex(&bytes));
    }

    #[test]
    fn brief_lists_failures_by_class() {
        let brief = run_brief_markdown(&summary());
        assert!(brief.contains("- Added: 1"));
        assert!(brief.contains("- data: 1"));
        assert!(brief.contains("has no business name"));
    }
}
