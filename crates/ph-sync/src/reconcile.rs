//! Reconciliation loop: read a page, map, check existence, upload, report.
//!
//! Pages are read one at a time. Each page is cut into batches and the
//! batches into waves of at most `workers`; a wave's uploads run concurrently
//! and the watermark only moves once the whole wave has been reported. It never
//! moves past a record that was still failing transiently when retries ran out;
//! the run stops there instead.

use std::borrow::Cow;
use std::collections::HashSet;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use ph_adapters::{Enricher, SourceReader};
use ph_core::{map_record, BusinessRecord, Cursor, MappingRules, ProgressCounters, TargetRecord};
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, info_span, warn, Instrument};
use uuid::Uuid;

use crate::config::MAX_WORKERS;
use crate::existence::{Existence, ExistenceCheck};
use crate::upload::BatchUploader;
use crate::watermark::WatermarkStore;
use crate::{ErrorClass, SyncError};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LoopState {
    Idle,
    Reading,
    Mapping,
    CheckingExistence,
    Uploading,
    Reporting,
    Done,
    Aborted,
}

impl LoopState {
    pub fn is_terminal(self) -> bool {
        matches!(self, Self::Done | Self::Aborted)
    }

    pub fn can_transition_to(self, next: LoopState) -> bool {
        use LoopState::*;
        if self.is_terminal() {
            return false;
        }
        matches!(
            (self, next),
            (_, Aborted)
                | (Idle, Reading)
                | (Reading, Mapping)
                | (Mapping, CheckingExistence)
                | (CheckingExistence, Uploading)
                | (Uploading, Reporting)
                | (Reporting, Reading)
                | (Reporting, Mapping)
                | (Idle | Reading | Reporting, Done)
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StopReason {
    Exhausted,
    TargetReached,
    Cancelled,
    /// Transient failures outlasted the backoff policy.
    RetriesExhausted,
    Fatal,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeStatus {
    Added,
    Skipped,
    Failed,
}

impl OutcomeStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Added => "added",
            Self::Skipped => "skipped",
            Self::Failed => "failed",
        }
    }
}

/// What happened to one source record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RecordOutcome {
    pub source_id: i64,
    pub label: String,
    pub match_key: Option<String>,
    pub status: OutcomeStatus,
    pub error_class: Option<ErrorClass>,
    pub detail: Option<String>,
    pub destination_id: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RunSummary {
    pub run_id: Uuid,
    pub job: String,
    pub started_at: DateTime<Utc>,
    pub finished_at: DateTime<Utc>,
    pub final_state: LoopState,
    pub stop_reason: StopReason,
    pub error: Option<String>,
    pub counters: ProgressCounters,
    pub start_cursor: Cursor,
    pub watermark: Cursor,
    pub trace: Vec<LoopState>,
    #[serde(skip)]
    pub outcomes: Vec<RecordOutcome>,
}

impl RunSummary {
    pub fn is_done(&self) -> bool {
        self.final_state == LoopState::Done
    }
}

#[derive(Debug, Clone)]
pub struct RunOptions {
    pub job: String,
    pub page_size: usize,
    pub batch_size: usize,
    pub workers: usize,
    /// Stop once this many records have been processed.
    pub max_records: Option<u64>,
}

impl Default for RunOptions {
    fn default() -> Self {
        Self {
            job: "default".to_string(),
            page_size: 100,
            batch_size: 10,
            workers: 1,
            max_records: None,
        }
    }
}

struct Machine {
    state: LoopState,
    trace: Vec<LoopState>,
}

impl Machine {
    fn new() -> Self {
        Self {
            state: LoopState::Idle,
            trace: vec![LoopState::Idle],
        }
    }

    fn to(&mut self, next: LoopState) {
        debug_assert!(
            self.state.can_transition_to(next),
            "invalid transition {:?} -> {:?}",
            self.state,
            next
        );
        self.state = next;
        self.trace.push(next);
    }
}

struct RunState {
    machine: Machine,
    counters: ProgressCounters,
    outcomes: Vec<RecordOutcome>,
    watermark: Cursor,
    /// Source ids whose last failure was transient.
    stranded: HashSet<i64>,
}

impl RunState {
    fn record(&mut self, outcome: RecordOutcome) {
        self.counters.processed += 1;
        match outcome.status {
            OutcomeStatus::Added => self.counters.added += 1,
            OutcomeStatus::Skipped => self.counters.skipped += 1,
            OutcomeStatus::Failed => self.counters.failed += 1,
        }
        self.outcomes.push(outcome);
    }

    fn fail(&mut self, source: &SourceRef, target: Option<&TargetRecord>, class: ErrorClass, detail: String) {
        warn!(record = %source.label, ?class, "record failed: {detail}");
        if class == ErrorClass::Transient {
            self.stranded.insert(source.id);
        }
        self.record(RecordOutcome {
            source_id: source.id,
            label: source.label.clone(),
            match_key: target.map(|t| t.match_key().as_index_key()),
            status: OutcomeStatus::Failed,
            error_class: Some(class),
            detail: Some(detail),
            destination_id: None,
        });
    }
}

#[derive(Debug, Clone)]
struct SourceRef {
    id: i64,
    label: String,
}

impl From<&BusinessRecord> for SourceRef {
    fn from(record: &BusinessRecord) -> Self {
        Self {
            id: record.id,
            label: record.label(),
        }
    }
}

#[derive(Default)]
struct PendingBatch {
    sources: Vec<SourceRef>,
    targets: Vec<TargetRecord>,
}

pub struct Reconciler {
    source: Arc<dyn SourceReader>,
    existence: ExistenceCheck,
    uploader: BatchUploader,
    rules: MappingRules,
    enricher: Option<Arc<dyn Enricher>>,
    watermarks: Option<WatermarkStore>,
    options: RunOptions,
}

impl Reconciler {
    pub fn new(
        source: Arc<dyn SourceReader>,
        existence: ExistenceCheck,
        uploader: BatchUploader,
        rules: MappingRules,
        options: RunOptions,
    ) -> Self {
        Self {
            source,
            existence,
            uploader,
            rules,
            enricher: None,
            watermarks: None,
            options,
        }
    }

    pub fn with_enricher(mut self, enricher: Arc<dyn Enricher>) -> Self {
        self.enricher = Some(enricher);
        self
    }

    /// Persist the watermark after every completed wave.
    pub fn with_watermarks(mut self, store: WatermarkStore) -> Self {
        self.watermarks = Some(store);
        self
    }

    pub fn options(&self) -> &RunOptions {
        &self.options
    }

    fn batch_size(&self) -> usize {
        self.options
            .batch_size
            .clamp(1, self.uploader.max_batch_size().max(1))
    }

    fn workers(&self) -> usize {
        self.options.workers.clamp(1, MAX_WORKERS)
    }

    pub async fn run(&self, start: Cursor, cancel: &CancellationToken) -> RunSummary {
        let run_id = Uuid::new_v4();
        let span = info_span!("sync_run", %run_id, job = %self.options.job);
        self.run_with_id(run_id, start, cancel).instrument(span).await
    }

    async fn run_with_id(&self, run_id: Uuid, start: Cursor, cancel: &CancellationToken) -> RunSummary {
        let started_at = Utc::now();
        info!(
            cursor = ?start,
            page_size = self.options.page_size,
            batch_size = self.batch_size(),
            workers = self.workers(),
            max_records = ?self.options.max_records,
            "sync run starting"
        );
        let mut run = RunState {
            machine: Machine::new(),
            counters: ProgressCounters::default(),
            outcomes: Vec::new(),
            watermark: start.clone(),
            stranded: HashSet::new(),
        };

        let (stop_reason, error) = match self.drive(run_id, &mut run, cancel).await {
            Ok(reason) => {
                run.machine.to(LoopState::Done);
                (reason, None)
            }
            Err(err) => {
                error!(class = ?err.class(), "sync run aborted: {err}");
                run.machine.to(LoopState::Aborted);
                let reason = match err.class() {
                    ErrorClass::Transient => StopReason::RetriesExhausted,
                    _ => StopReason::Fatal,
                };
                (reason, Some(err.to_string()))
            }
        };

        let counters = run.counters;
        info!(
            state = ?run.machine.state,
            ?stop_reason,
            processed = counters.processed,
            added = counters.added,
            skipped = counters.skipped,
            failed = counters.failed,
            retries = counters.retries,
            watermark = ?run.watermark,
            "sync run finished"
        );

        RunSummary {
            run_id,
            job: self.options.job.clone(),
            started_at,
            finished_at: Utc::now(),
            final_state: run.machine.state,
            stop_reason,
            error,
            counters,
            start_cursor: start,
            watermark: run.watermark,
            trace: run.machine.trace,
            outcomes: run.outcomes,
        }
    }

    async fn drive(
        &self,
        run_id: Uuid,
        run: &mut RunState,
        cancel: &CancellationToken,
    ) -> Result<StopReason, SyncError> {
        let page_size = self.options.page_size.max(1);
        let batch_size = self.batch_size();
        let workers = self.workers();

        loop {
            if cancel.is_cancelled() {
                info!("cancellation requested before page read");
                return Ok(StopReason::Cancelled);
            }
            let remaining = self
                .options
                .max_records
                .map(|max| max.saturating_sub(run.counters.processed));
            if remaining == Some(0) {
                return Ok(StopReason::TargetReached);
            }

            run.machine.to(LoopState::Reading);
            let page = self.source.read_page(page_size, &run.watermark).await?;
            run.counters.pages_read += 1;
            let exhausted = page.is_last(page_size);
            let mut records = page.records;
            let mut truncated = false;
            if let Some(remaining) = remaining {
                if records.len() as u64 > remaining {
                    records.truncate(remaining as usize);
                    truncated = true;
                }
            }
            debug!(
                page = run.counters.pages_read,
                records = records.len(),
                exhausted,
                "read page"
            );
            if records.is_empty() {
                return self.finish_pass(run_id, run).await;
            }

            let batches = records.chunks(batch_size).collect::<Vec<_>>();
            for wave in batches.chunks(workers) {
                if cancel.is_cancelled() {
                    info!(watermark = ?run.watermark, "cancellation requested between batches");
                    return Ok(StopReason::Cancelled);
                }
                self.process_wave(run_id, run, wave).await?;
            }

            info!(
                pages = run.counters.pages_read,
                processed = run.counters.processed,
                added = run.counters.added,
                skipped = run.counters.skipped,
                failed = run.counters.failed,
                "page complete"
            );
            if truncated {
                return Ok(StopReason::TargetReached);
            }
            if exhausted {
                return self.finish_pass(run_id, run).await;
            }
        }
    }

    /// The source has no rows past the watermark. Orderings that can gain rows
    /// ahead of the cursor rewind so the next run starts a new pass.
    async fn finish_pass(&self, run_id: Uuid, run: &mut RunState) -> Result<StopReason, SyncError> {
        if run.watermark.restarts_when_exhausted() && !run.watermark.is_start() {
            run.watermark = Cursor::start(run.watermark.order());
            info!(watermark = ?run.watermark, "pass complete; next run starts a new pass");
            self.save_watermark(run_id, &run.watermark).await?;
        }
        Ok(StopReason::Exhausted)
    }

    async fn save_watermark(&self, run_id: Uuid, watermark: &Cursor) -> Result<(), SyncError> {
        if let Some(store) = &self.watermarks {
            store
                .save(&self.options.job, run_id, watermark)
                .await
                .map_err(SyncError::State)?;
        }
        Ok(())
    }

    async fn process_wave(
        &self,
        run_id: Uuid,
        run: &mut RunState,
        wave: &[&[BusinessRecord]],
    ) -> Result<(), SyncError> {
        run.machine.to(LoopState::Mapping);
        let mut mapped = Vec::with_capacity(wave.len());
        for batch in wave {
            let mut ready = Vec::with_capacity(batch.len());
            for record in batch.iter() {
                let source = SourceRef::from(record);
                let record = self.enrich(record, &mut run.counters).await;
                match map_record(&record, &self.rules) {
                    Ok(target) => ready.push((source, target)),
                    Err(err) => {
                        let err = SyncError::from(err);
                        run.fail(&source, None, err.class(), err.to_string());
                    }
                }
            }
            mapped.push(ready);
        }

        run.machine.to(LoopState::CheckingExistence);
        let mut uploads: Vec<PendingBatch> = Vec::with_capacity(mapped.len());
        for ready in mapped {
            let mut pending = PendingBatch::default();
            for (source, target) in ready {
                match self.existence.check_and_claim(&target).await {
                    Ok(Existence::New) => {
                        pending.sources.push(source);
                        pending.targets.push(target);
                    }
                    Ok(existing) => {
                        let destination_id = match &existing {
                            Existence::AtDestination { record_id, .. } => Some(record_id.clone()),
                            _ => None,
                        };
                        debug!(record = %source.label, ?existing, "already present; skipping");
                        run.record(RecordOutcome {
                            source_id: source.id,
                            label: source.label,
                            match_key: Some(target.match_key().as_index_key()),
                            status: OutcomeStatus::Skipped,
                            error_class: None,
                            detail: Some(match existing {
                                Existence::SeenThisRun => "duplicate within run".to_string(),
                                Existence::AtDestination { strength, .. } => {
                                    format!("exists at destination ({strength:?})")
                                }
                                Existence::New => String::new(),
                            }),
                            destination_id,
                        });
                    }
                    Err(err) => {
                        let err = SyncError::from(err);
                        if err.class() == ErrorClass::Fatal {
                            for batch in uploads.iter().chain(std::iter::once(&pending)) {
                                for claimed in &batch.targets {
                                    self.existence.release(claimed).await;
                                }
                            }
                            return Err(err);
                        }
                        run.fail(&source, Some(&target), err.class(), err.to_string());
                    }
                }
            }
            if !pending.targets.is_empty() {
                uploads.push(pending);
            }
        }

        run.counters.retries += self.existence.take_retries();

        run.machine.to(LoopState::Uploading);
        let reports = join_all(
            uploads
                .iter()
                .map(|batch| self.uploader.upload(&batch.targets)),
        )
        .await;

        run.machine.to(LoopState::Reporting);
        let mut fatal = None;
        for (batch, report) in uploads.iter().zip(reports) {
            run.counters.batches_sent += 1;
            run.counters.retries += report.retries as u64;
            if let Some(failure) = &report.failure {
                let mut detail = failure.message.clone();
                if let Some(path) = &failure.artifact {
                    detail.push_str(&format!(" (body saved to {})", path.display()));
                }
                for (source, target) in batch.sources.iter().zip(&batch.targets) {
                    self.existence.release(target).await;
                    run.fail(source, Some(target), failure.class, detail.clone());
                }
                if failure.class == ErrorClass::Fatal && fatal.is_none() {
                    fatal = Some(SyncError::Rejected {
                        status: failure.status,
                        message: failure.message.clone(),
                    });
                }
                continue;
            }

            for (i, (source, target)) in batch.sources.iter().zip(&batch.targets).enumerate() {
                match report.created.get(i) {
                    Some(created) => {
                        self.existence.confirm(target).await;
                        run.record(RecordOutcome {
                            source_id: source.id,
                            label: source.label.clone(),
                            match_key: Some(target.match_key().as_index_key()),
                            status: OutcomeStatus::Added,
                            error_class: None,
                            detail: None,
                            destination_id: Some(created.id.clone()),
                        });
                    }
                    None => {
                        self.existence.release(target).await;
                        run.fail(
                            source,
                            Some(target),
                            ErrorClass::Data,
                            "missing from destination response".to_string(),
                        );
                    }
                }
            }
        }
        if let Some(err) = fatal {
            return Err(err);
        }

        let mut settled = None;
        for record in wave.iter().flat_map(|batch| batch.iter()) {
            if run.stranded.contains(&record.id) {
                break;
            }
            settled = Some(record);
        }
        if let Some(last) = settled {
            run.watermark = run.watermark.after_record(last);
        }
        self.save_watermark(run_id, &run.watermark).await?;
        if !run.stranded.is_empty() {
            warn!(
                watermark = ?run.watermark,
                records = run.stranded.len(),
                "stopping with transient failures; watermark held before the first"
            );
            return Err(SyncError::RetriesExhausted {
                records: run.stranded.len(),
            });
        }
        debug!(watermark = ?run.watermark, processed = run.counters.processed, "wave complete");
        Ok(())
    }

    /// Fill a missing address or postcode from the places lookup. Never fails.
    async fn enrich<'a>(
        &self,
        record: &'a BusinessRecord,
        counters: &mut ProgressCounters,
    ) -> Cow<'a, BusinessRecord> {
        let Some(enricher) = &self.enricher else {
            return Cow::Borrowed(record);
        };
        let present = |v: &Option<String>| v.as_deref().is_some_and(|s| !s.trim().is_empty());
        if present(&record.address) && present(&record.postcode) {
            return Cow::Borrowed(record);
        }
        let Some(name) = record.name.as_deref().map(str::trim).filter(|n| !n.is_empty()) else {
            return Cow::Borrowed(record);
        };
        let query = [Some(name), record.venue.as_deref(), record.town.as_deref()]
            .into_iter()
            .flatten()
            .map(str::trim)
            .filter(|part| !part.is_empty())
            .collect::<Vec<_>>()
            .join(" ");

        match enricher.lookup(&query).await {
            Ok(Some(place)) => {
                counters.enriched += 1;
                let mut enriched = record.clone();
                if !present(&enriched.address) {
                    enriched.address = Some(place.formatted_address);
                }
                if !present(&enriched.postcode) {
                    enriched.postcode = place.postcode;
                }
                debug!(record = %record.label(), place_id = %place.place_id, "enriched record");
                Cow::Owned(enriched)
            }
            Ok(None) => {
                counters.enrichment_misses += 1;
                debug!(record = %record.label(), "no places match");
                Cow::Borrowed(record)
            }
            Err(err) => {
                counters.enrichment_failures += 1;
                warn!(record = %record.label(), "enrichment failed: {err}");
                Cow::Borrowed(record)
            }
        }
    }
}
