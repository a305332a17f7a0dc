use std::collections::HashMap;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use async_trait::async_trait;
use ph_adapters::{
    DestinationError, MemoryDestination, MemorySource, Page, SourceError, SourceReader,
};
use ph_core::{BusinessRecord, Cursor, SourceOrder, TargetRecord};
use ph_sync::{
    run_sync_with, ErrorClass, LoopState, OutcomeStatus, StopReason, SyncConfig, SyncRequest,
    WatermarkStore,
};
use tokio_util::sync::CancellationToken;

fn config(root: &Path, extra: &[(&str, &str)]) -> SyncConfig {
    let mut vars = HashMap::from([
        ("AIRTABLE_TOKEN".to_string(), "pat_test".to_string()),
        ("AIRTABLE_BASE_ID".to_string(), "appTest".to_string()),
        ("AIRTABLE_TABLE".to_string(), "Businesses".to_string()),
        ("PH_BACKOFF_BASE_MS".to_string(), "1".to_string()),
        ("PH_BACKOFF_MAX_MS".to_string(), "4".to_string()),
        ("PH_STATE_DIR".to_string(), root.join("state").display().to_string()),
        ("PH_REPORTS_DIR".to_string(), root.join("reports").display().to_string()),
        ("PH_ARTIFACTS_DIR".to_string(), root.join("artifacts").display().to_string()),
    ]);
    for (k, v) in extra {
        vars.insert(k.to_string(), v.to_string());
    }
    SyncConfig::from_lookup(|k| vars.get(k).cloned()).unwrap()
}

/// Records with distinct names spread over distinct towns.
fn classes(n: i64) -> Vec<BusinessRecord> {
    (1..=n)
        .map(|id| BusinessRecord {
            id,
            name: Some(format!("Class {id}")),
            town: Some(format!("Town {id}")),
            ..Default::default()
        })
        .collect()
}

fn request(job: &str) -> SyncRequest {
    SyncRequest {
        job: job.to_string(),
        page_size: Some(10),
        ..Default::default()
    }
}

fn fixture_path() -> std::path::PathBuf {
    Path::new(env!("CARGO_MANIFEST_DIR")).join("../../fixtures/businesses/sample.json")
}

fn status(code: u16, body: &str) -> Option<DestinationError> {
    Some(DestinationError::Status {
        status: code,
        body: body.to_string(),
    })
}

#[tokio::test]
async fn twenty_three_records_take_three_reads() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path(), &[]);
    let source = Arc::new(MemorySource::new(classes(23)));
    let dest = Arc::new(MemoryDestination::new());

    let outcome = run_sync_with(
        &config,
        &request("scenario-a"),
        source.clone(),
        dest.clone(),
        None,
        &CancellationToken::new(),
    )
    .await
    .unwrap();

    let summary = outcome.summary;
    assert_eq!(source.reads(), 3);
    assert_eq!(summary.final_state, LoopState::Done);
    assert_eq!(summary.stop_reason, StopReason::Exhausted);
    assert_eq!(summary.counters.added, 23);
    assert_eq!(summary.counters.pages_read, 3);
    assert_eq!(summary.watermark, Cursor::ById { after: Some(23) });
    assert_eq!(dest.records().await.len(), 23);

    let stored = WatermarkStore::new(&config.state_dir)
        .load("scenario-a")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.cursor, Cursor::ById { after: Some(23) });
    assert!(outcome.report.summary.exists());
    assert!(outcome.report.brief.exists());
    assert!(outcome.report.manifest.exists());
}

#[tokio::test]
async fn rate_limited_batch_succeeds_after_two_retries() {
    let dir = tempfile::tempdir().unwrap();
    let dest = Arc::new(MemoryDestination::new());
    dest.script_create(status(429, "")).await;
    dest.script_create(status(429, "")).await;

    let outcome = run_sync_with(
        &config(dir.path(), &[("PH_MAX_ATTEMPTS", "3")]),
        &request("scenario-b"),
        Arc::new(MemorySource::new(classes(5))),
        dest.clone(),
        None,
        &CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(outcome.summary.counters.retries, 2);
    assert_eq!(outcome.summary.counters.added, 5);
    assert_eq!(outcome.summary.counters.failed, 0);
    assert_eq!(dest.create_calls().await, 3);
}

#[tokio::test]
async fn fixture_run_skips_duplicates_and_nameless_rows() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path(), &[]);
    let req = SyncRequest {
        fixture: Some(fixture_path()),
        ..request("fixture")
    };
    let source = Arc::new(MemorySource::from_json_file(fixture_path()).unwrap());
    let dest = Arc::new(MemoryDestination::new());

    let outcome = run_sync_with(&config, &req, source, dest.clone(), None, &CancellationToken::new())
        .await
        .unwrap();
    let summary = outcome.summary;

    assert!(summary.is_done());
    assert_eq!(summary.counters.processed, 7);
    assert_eq!(summary.counters.added, 5);
    assert_eq!(summary.counters.skipped, 1);
    assert_eq!(summary.counters.failed, 1);

    let duplicate = summary.outcomes.iter().find(|o| o.source_id == 4).unwrap();
    assert_eq!(duplicate.status, OutcomeStatus::Skipped);
    let nameless = summary.outcomes.iter().find(|o| o.source_id == 6).unwrap();
    assert_eq!(nameless.error_class, Some(ErrorClass::Data));

    let stored = dest.records().await;
    let sensory = stored
        .iter()
        .find(|r| r.fields.business_name == "Baby Sensory Andover")
        .unwrap();
    assert_eq!(sensory.fields.postcode.as_deref(), Some("SP10 2BX"));
    assert_eq!(sensory.fields.day_of_week.as_deref(), Some("Tuesday"));
}

#[tokio::test]
async fn entries_already_at_destination_are_skipped() {
    let dir = tempfile::tempdir().unwrap();
    let dest = Arc::new(MemoryDestination::new());
    dest.seed(vec![TargetRecord {
        business_name: "Class 2".into(),
        town: Some("town 2".into()),
        ..Default::default()
    }])
    .await;

    let outcome = run_sync_with(
        &config(dir.path(), &[]),
        &request("existing"),
        Arc::new(MemorySource::new(classes(3))),
        dest.clone(),
        None,
        &CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(outcome.summary.counters.added, 2);
    assert_eq!(outcome.summary.counters.skipped, 1);
    let skipped = outcome
        .summary
        .outcomes
        .iter()
        .find(|o| o.status == OutcomeStatus::Skipped)
        .unwrap();
    assert_eq!(skipped.source_id, 2);
    assert!(skipped.destination_id.as_deref().unwrap().starts_with("recSeed"));
    assert_eq!(dest.records().await.len(), 3);
}

#[tokio::test]
async fn second_run_resumes_from_stored_watermark() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path(), &[]);
    let dest = Arc::new(MemoryDestination::new());

    let first = run_sync_with(
        &config,
        &SyncRequest {
            max_records: Some(10),
            ..request("resume")
        },
        Arc::new(MemorySource::new(classes(23))),
        dest.clone(),
        None,
        &CancellationToken::new(),
    )
    .await
    .unwrap();
    assert_eq!(first.summary.stop_reason, StopReason::TargetReached);
    assert_eq!(first.summary.watermark, Cursor::ById { after: Some(10) });

    let second = run_sync_with(
        &config,
        &request("resume"),
        Arc::new(MemorySource::new(classes(23))),
        dest.clone(),
        None,
        &CancellationToken::new(),
    )
    .await
    .unwrap();
    assert_eq!(second.summary.start_cursor, Cursor::ById { after: Some(10) });
    assert_eq!(second.summary.counters.processed, 13);
    assert_eq!(second.summary.counters.skipped, 0);
    assert_eq!(dest.records().await.len(), 23);
}

/// Cancels the token once the given read has been served.
struct CancellingSource {
    inner: MemorySource,
    cancel: CancellationToken,
    cancel_on_read: usize,
    reads: AtomicUsize,
}

#[async_trait]
impl SourceReader for CancellingSource {
    async fn read_page(&self, page_size: usize, cursor: &Cursor) -> Result<Page, SourceError> {
        let page = self.inner.read_page(page_size, cursor).await;
        if self.reads.fetch_add(1, Ordering::SeqCst) + 1 == self.cancel_on_read {
            self.cancel.cancel();
        }
        page
    }
}

#[tokio::test]
async fn cancellation_stops_between_batches_with_watermark_kept() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path(), &[]);
    let cancel = CancellationToken::new();
    let source = Arc::new(CancellingSource {
        inner: MemorySource::new(classes(30)),
        cancel: cancel.clone(),
        cancel_on_read: 2,
        reads: AtomicUsize::new(0),
    });
    let dest = Arc::new(MemoryDestination::new());

    let outcome = run_sync_with(
        &config,
        &SyncRequest {
            batch_size: Some(5),
            ..request("cancel")
        },
        source,
        dest.clone(),
        None,
        &cancel,
    )
    .await
    .unwrap();

    assert_eq!(outcome.summary.final_state, LoopState::Done);
    assert_eq!(outcome.summary.stop_reason, StopReason::Cancelled);
    assert_eq!(outcome.summary.counters.added, 10);
    assert_eq!(outcome.summary.watermark, Cursor::ById { after: Some(10) });
    let stored = WatermarkStore::new(&config.state_dir)
        .load("cancel")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.cursor, Cursor::ById { after: Some(10) });
}

#[tokio::test]
async fn unauthorised_destination_aborts_without_moving_watermark() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path(), &[]);
    let dest = Arc::new(MemoryDestination::new());
    dest.script_create(None).await;
    dest.script_create(status(401, r#"{"error":"AUTHENTICATION_REQUIRED"}"#))
        .await;

    let outcome = run_sync_with(
        &config,
        &request("abort"),
        Arc::new(MemorySource::new(classes(25))),
        dest.clone(),
        None,
        &CancellationToken::new(),
    )
    .await
    .unwrap();

    let summary = outcome.summary;
    assert_eq!(summary.final_state, LoopState::Aborted);
    assert_eq!(summary.stop_reason, StopReason::Fatal);
    assert!(summary.error.as_deref().unwrap().contains("401"));
    assert_eq!(summary.counters.added, 10);
    assert_eq!(summary.watermark, Cursor::ById { after: Some(10) });
    assert_eq!(dest.create_calls().await, 2);
    assert_eq!(summary.trace.last(), Some(&LoopState::Aborted));
}

#[tokio::test]
async fn source_failure_aborts_after_last_completed_page() {
    let dir = tempfile::tempdir().unwrap();
    let outcome = run_sync_with(
        &config(dir.path(), &[]),
        &request("source-down"),
        Arc::new(MemorySource::new(classes(25)).failing_on_read(2)),
        Arc::new(MemoryDestination::new()),
        None,
        &CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(outcome.summary.final_state, LoopState::Aborted);
    assert_eq!(outcome.summary.counters.added, 10);
    assert_eq!(outcome.summary.watermark, Cursor::ById { after: Some(10) });
}

#[tokio::test]
async fn rejected_batch_is_recorded_and_the_run_continues() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path(), &[]);
    let dest = Arc::new(MemoryDestination::new());
    dest.script_create(status(
        422,
        r#"{"error":{"type":"INVALID_VALUE_FOR_COLUMN","message":"Field \"Rating\" cannot accept the provided value"}}"#,
    ))
    .await;

    let outcome = run_sync_with(
        &config,
        &SyncRequest {
            batch_size: Some(5),
            ..request("rejected")
        },
        Arc::new(MemorySource::new(classes(10))),
        dest.clone(),
        None,
        &CancellationToken::new(),
    )
    .await
    .unwrap();

    let summary = outcome.summary;
    assert!(summary.is_done());
    assert_eq!(summary.counters.failed, 5);
    assert_eq!(summary.counters.added, 5);
    let failed = summary
        .outcomes
        .iter()
        .find(|o| o.status == OutcomeStatus::Failed)
        .unwrap();
    assert_eq!(failed.error_class, Some(ErrorClass::Data));
    assert!(failed.detail.as_deref().unwrap().contains("INVALID_VALUE_FOR_COLUMN"));
    assert!(config.artifacts_dir.join("batch-failures").exists());
}

#[tokio::test]
async fn concurrent_workers_never_insert_the_same_key_twice() {
    let dir = tempfile::tempdir().unwrap();
    // Twins of ids 10..=12 share a wave with their originals; twins of 7..=9 come a wave later.
    let mut records = classes(12);
    for (id, original) in (13..=18).zip([9, 10, 11, 6, 7, 8]) {
        let twin = &records[original];
        records.push(BusinessRecord {
            id,
            name: twin.name.clone(),
            town: twin.town.clone(),
            ..Default::default()
        });
    }

    let dest = Arc::new(MemoryDestination::new());
    let outcome = run_sync_with(
        &config(dir.path(), &[]),
        &SyncRequest {
            page_size: Some(50),
            batch_size: Some(3),
            workers: Some(3),
            ..request("workers")
        },
        Arc::new(MemorySource::new(records)),
        dest.clone(),
        None,
        &CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(outcome.summary.counters.added, 12);
    assert_eq!(outcome.summary.counters.skipped, 6);
    assert_eq!(dest.create_calls().await, 4);
    let mut names = dest
        .records()
        .await
        .into_iter()
        .map(|r| r.fields.business_name)
        .collect::<Vec<_>>();
    names.sort();
    names.dedup();
    assert_eq!(names.len(), 12);
}

#[tokio::test]
async fn records_dropped_by_destination_count_as_failed() {
    let dir = tempfile::tempdir().unwrap();
    let dest = Arc::new(MemoryDestination::new());
    dest.drop_last_record_on_create().await;

    let outcome = run_sync_with(
        &config(dir.path(), &[]),
        &request("partial"),
        Arc::new(MemorySource::new(classes(4))),
        dest,
        None,
        &CancellationToken::new(),
    )
    .await
    .unwrap();

    assert_eq!(outcome.summary.counters.added, 3);
    assert_eq!(outcome.summary.counters.failed, 1);
    let dropped = outcome
        .summary
        .outcomes
        .iter()
        .find(|o| o.status == OutcomeStatus::Failed)
        .unwrap();
    assert_eq!(dropped.source_id, 4);
}

#[tokio::test]
async fn rate_limited_lookup_is_retried_and_nothing_is_left_behind() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path(), &[]);
    let dest = Arc::new(MemoryDestination::new());
    dest.script_lookup(status(429, "")).await;

    let outcome = run_sync_with(
        &config,
        &request("lookup-limited"),
        Arc::new(MemorySource::new(classes(3))),
        dest.clone(),
        None,
        &CancellationToken::new(),
    )
    .await
    .unwrap();

    let summary = outcome.summary;
    assert!(summary.is_done());
    assert_eq!(summary.counters.added, 3);
    assert_eq!(summary.counters.failed, 0);
    assert_eq!(summary.counters.retries, 1);
    assert_eq!(dest.lookup_calls().await, 4);
    assert_eq!(summary.watermark, Cursor::ById { after: Some(3) });
    assert_eq!(dest.records().await.len(), 3);
}

#[tokio::test]
async fn exhausted_lookup_retries_hold_the_watermark_before_the_record() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path(), &[("PH_MAX_ATTEMPTS", "2")]);
    let dest = Arc::new(MemoryDestination::new());
    dest.script_lookup(None).await;
    dest.script_lookup(status(429, "")).await;
    dest.script_lookup(status(429, "")).await;

    let first = run_sync_with(
        &config,
        &request("lookup-exhausted"),
        Arc::new(MemorySource::new(classes(5))),
        dest.clone(),
        None,
        &CancellationToken::new(),
    )
    .await
    .unwrap();

    let summary = first.summary;
    assert_eq!(summary.final_state, LoopState::Aborted);
    assert_eq!(summary.stop_reason, StopReason::RetriesExhausted);
    assert_eq!(summary.counters.added, 4);
    assert_eq!(summary.counters.failed, 1);
    let stranded = summary
        .outcomes
        .iter()
        .find(|o| o.status == OutcomeStatus::Failed)
        .unwrap();
    assert_eq!(stranded.source_id, 2);
    assert_eq!(stranded.error_class, Some(ErrorClass::Transient));
    assert_eq!(summary.watermark, Cursor::ById { after: Some(1) });

    let second = run_sync_with(
        &config,
        &request("lookup-exhausted"),
        Arc::new(MemorySource::new(classes(5))),
        dest.clone(),
        None,
        &CancellationToken::new(),
    )
    .await
    .unwrap();
    assert_eq!(second.summary.start_cursor, Cursor::ById { after: Some(1) });
    assert!(second.summary.is_done());
    assert_eq!(second.summary.counters.added, 1);
    assert_eq!(second.summary.counters.skipped, 3);
    assert_eq!(dest.records().await.len(), 5);
}

#[tokio::test]
async fn exhausted_upload_retries_keep_the_batch_ahead_of_the_watermark() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path(), &[("PH_MAX_ATTEMPTS", "2")]);
    let dest = Arc::new(MemoryDestination::new());
    dest.script_create(None).await;
    dest.script_create(status(503, "")).await;
    dest.script_create(status(503, "")).await;

    let outcome = run_sync_with(
        &config,
        &SyncRequest {
            batch_size: Some(5),
            workers: Some(1),
            ..request("upload-exhausted")
        },
        Arc::new(MemorySource::new(classes(15))),
        dest.clone(),
        None,
        &CancellationToken::new(),
    )
    .await
    .unwrap();

    let summary = outcome.summary;
    assert_eq!(summary.stop_reason, StopReason::RetriesExhausted);
    assert_eq!(summary.counters.added, 5);
    assert_eq!(summary.counters.failed, 5);
    assert_eq!(summary.counters.processed, 10);
    assert_eq!(summary.watermark, Cursor::ById { after: Some(5) });
    let stored = WatermarkStore::new(&config.state_dir)
        .load("upload-exhausted")
        .await
        .unwrap()
        .unwrap();
    assert_eq!(stored.cursor, Cursor::ById { after: Some(5) });
    assert_eq!(dest.create_calls().await, 3);
}

#[tokio::test]
async fn sample_order_resume_keeps_every_row_after_inserts() {
    let dir = tempfile::tempdir().unwrap();
    let config = config(dir.path(), &[]);
    let dest = Arc::new(MemoryDestination::new());
    let sampled = |max_records| SyncRequest {
        order: SourceOrder::Sample {
            seed: "spring".into(),
        },
        max_records,
        ..request("sample")
    };

    let first = run_sync_with(
        &config,
        &sampled(Some(5)),
        Arc::new(MemorySource::new(classes(10))),
        dest.clone(),
        None,
        &CancellationToken::new(),
    )
    .await
    .unwrap();
    assert_eq!(first.summary.stop_reason, StopReason::TargetReached);
    assert_eq!(first.summary.counters.added, 5);

    let second = run_sync_with(
        &config,
        &sampled(None),
        Arc::new(MemorySource::new(classes(20))),
        dest.clone(),
        None,
        &CancellationToken::new(),
    )
    .await
    .unwrap();
    assert_eq!(second.summary.start_cursor, first.summary.watermark);
    assert_eq!(second.summary.stop_reason, StopReason::Exhausted);
    assert_eq!(
        second.summary.watermark,
        Cursor::Sample {
            seed: "spring".into(),
            after: None
        }
    );
    let names = dest
        .records()
        .await
        .into_iter()
        .map(|r| r.fields.business_name)
        .collect::<Vec<_>>();
    for id in 1..=10 {
        assert!(names.contains(&format!("Class {id}")), "Class {id} was skipped");
    }

    let third = run_sync_with(
        &config,
        &sampled(None),
        Arc::new(MemorySource::new(classes(20))),
        dest.clone(),
        None,
        &CancellationToken::new(),
    )
    .await
    .unwrap();
    assert!(third.summary.start_cursor.is_start());
    assert_eq!(third.summary.counters.added + third.summary.counters.skipped, 20);
    assert_eq!(dest.records().await.len(), 20);
}
