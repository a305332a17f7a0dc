//! Reconciliation of the Postgres `businesses` table into Airtable.

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{Context, Result};
use ph_adapters::{
    AirtableConfig, AirtableDestination, Destination, Enricher, MemorySource, PlacesConfig,
    PlacesEnricher, PostgresSource, SourceFilter, SourceReader,
};
use ph_core::SourceOrder;
use ph_storage::ArtifactStore;
use tokio_util::sync::CancellationToken;
use tracing::info;

pub mod config;
pub mod dedup;
pub mod error;
pub mod existence;
pub mod reconcile;
pub mod report;
pub mod scheduler;
pub mod upload;
pub mod watermark;

pub use config::{load_mapping_rules, SyncConfig};
pub use dedup::{scan_duplicates, DedupConfig, DedupEngine, DuplicateReport};
pub use error::{ErrorClass, SyncError};
pub use existence::{Existence, ExistenceCheck, MatchStrength};
pub use reconcile::{LoopState, OutcomeStatus, Reconciler, RecordOutcome, RunOptions, RunSummary, StopReason};
pub use report::{write_run_report, RunReportPaths};
pub use scheduler::{build_scheduler, RunGuard};
pub use upload::{BatchReport, BatchUploader};
pub use watermark::{StoredWatermark, WatermarkStore};

pub const CRATE_NAME: &str = "ph-sync";

/// Per-invocation choices layered over [`SyncConfig`].
#[derive(Debug, Clone)]
pub struct SyncRequest {
    pub job: String,
    pub order: SourceOrder,
    pub filter: SourceFilter,
    pub page_size: Option<usize>,
    pub batch_size: Option<usize>,
    pub workers: Option<usize>,
    pub max_records: Option<u64>,
    /// Ignore any stored watermark.
    pub fresh: bool,
    /// Load the destination once instead of querying per record.
    pub preload: bool,
    /// Read source records from a JSON file instead of Postgres.
    pub fixture: Option<PathBuf>,
}

impl Default for SyncRequest {
    fn default() -> Self {
        Self {
            job: "default".to_string(),
            order: SourceOrder::Id,
            filter: SourceFilter::default(),
            page_size: None,
            batch_size: None,
            workers: None,
            max_records: None,
            fresh: false,
            preload: false,
            fixture: None,
        }
    }
}

#[derive(Debug, Clone)]
pub struct SyncOutcome {
    pub summary: RunSummary,
    pub report: RunReportPaths,
}

pub async fn open_source(config: &SyncConfig, request: &SyncRequest) -> Result<Arc<dyn SourceReader>> {
    if let Some(path) = &request.fixture {
        let source = MemorySource::from_json_file(path)
            .with_context(|| format!("loading fixture {}", path.display()))?
            .with_filter(request.filter.clone());
        return Ok(Arc::new(source));
    }
    let source = PostgresSource::connect(
        config.database_url()?,
        &config.source_table,
        request.filter.clone(),
    )
    .await
    .context("connecting to source database")?;
    Ok(Arc::new(source))
}

pub fn open_destination(config: &SyncConfig) -> Result<Arc<dyn Destination>> {
    config.require_destination()?;
    let destination = AirtableDestination::new(AirtableConfig {
        api_url: config.airtable_api_url.clone(),
        token: config.airtable_token.clone(),
        base_id: config.airtable_base_id.clone(),
        table: config.airtable_table.clone(),
        http: config.http_client_config(),
    })?;
    Ok(Arc::new(destination))
}

/// Places lookup, only when an API key is configured.
pub fn open_enricher(config: &SyncConfig) -> Result<Option<Arc<dyn Enricher>>> {
    let Some(api_key) = &config.places_api_key else {
        return Ok(None);
    };
    let enricher = PlacesEnricher::new(PlacesConfig {
        api_url: config.places_api_url.clone(),
        api_key: api_key.clone(),
        region: "uk".to_string(),
        http: config.http_client_config(),
    })?;
    Ok(Some(Arc::new(enricher)))
}

pub async fn run_configured_sync(
    config: &SyncConfig,
    request: &SyncRequest,
    cancel: &CancellationToken,
) -> Result<SyncOutcome> {
    let source = open_source(config, request).await?;
    let destination = open_destination(config)?;
    let enricher = open_enricher(config)?;
    run_sync_with(config, request, source, destination, enricher, cancel).await
}

/// Run one sync against already-opened adapters and write its report.
pub async fn run_sync_with(
    config: &SyncConfig,
    request: &SyncRequest,
    source: Arc<dyn SourceReader>,
    destination: Arc<dyn Destination>,
    enricher: Option<Arc<dyn Enricher>>,
    cancel: &CancellationToken,
) -> Result<SyncOutcome> {
    let mut effective = config.clone();
    if let Some(page_size) = request.page_size {
        effective.page_size = page_size;
    }
    if let Some(batch_size) = request.batch_size {
        effective.batch_size = batch_size;
    }
    if let Some(workers) = request.workers {
        effective.workers = workers;
    }
    effective.validate()?;

    let rules = load_mapping_rules(effective.rules_file.as_deref())?;
    let watermarks = WatermarkStore::new(&effective.state_dir);
    let start = watermarks
        .resume_cursor(&request.job, &request.order, request.fresh)
        .await?;

    let mut existence = ExistenceCheck::new(destination.clone(), effective.fuzzy_threshold)
        .with_backoff(effective.backoff);
    if request.preload {
        let entries = existence
            .preload()
            .await
            .context("preloading destination snapshot")?;
        info!(entries, "destination snapshot loaded");
    }
    let uploader = BatchUploader::new(destination, effective.backoff)
        .with_artifacts(ArtifactStore::new(&effective.artifacts_dir));

    let options = RunOptions {
        job: request.job.clone(),
        page_size: effective.page_size,
        batch_size: effective.batch_size,
        workers: effective.workers,
        max_records: request.max_records,
    };
    let mut reconciler =
        Reconciler::new(source, existence, uploader, rules, options).with_watermarks(watermarks);
    if let Some(enricher) = enricher {
        reconciler = reconciler.with_enricher(enricher);
    }

    let summary = reconciler.run(start, cancel).await;
    let report = write_run_report(&effective.reports_dir, &summary).await?;
    info!(dir = %report.dir.display(), "run report written");
    Ok(SyncOutcome { summary, report })
}

/// Duplicate report over the configured source.
pub async fn run_duplicate_scan(config: &SyncConfig, request: &SyncRequest) -> Result<DuplicateReport> {
    let source = open_source(config, request).await?;
    let rules = load_mapping_rules(config.rules_file.as_deref())?;
    let page_size = request.page_size.unwrap_or(config.page_size);
    scan_duplicates(source.as_ref(), page_size, &rules, DedupConfig::default())
        .await
        .context("scanning source for duplicates")
}
