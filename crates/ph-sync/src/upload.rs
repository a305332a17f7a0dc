//! Batch upload client.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use ph_adapters::{Destination, DestinationError, DestinationRecord};
use ph_core::TargetRecord;
use ph_storage::{retry_with_backoff, ArtifactStore, BackoffPolicy};
use serde::Serialize;
use tracing::{info_span, warn, Instrument};

use crate::ErrorClass;

pub const FAILURE_ARTIFACT_NAMESPACE: &str = "batch-failures";

#[derive(Debug, Clone, Serialize)]
pub struct BatchFailure {
    pub class: ErrorClass,
    pub status: Option<u16>,
    pub message: String,
    pub body: Option<String>,
    pub artifact: Option<PathBuf>,
}

/// Result of one batch after all attempts.
#[derive(Debug, Clone)]
pub struct BatchReport {
    /// Created entries, aligned with the start of the input batch.
    pub created: Vec<DestinationRecord>,
    pub attempts: usize,
    pub retries: usize,
    pub failure: Option<BatchFailure>,
}

impl BatchReport {
    pub fn succeeded(&self) -> bool {
        self.failure.is_none()
    }

    pub fn is_fatal(&self) -> bool {
        self.failure
            .as_ref()
            .is_some_and(|f| f.class == ErrorClass::Fatal)
    }
}

#[derive(Clone)]
pub struct BatchUploader {
    destination: Arc<dyn Destination>,
    backoff: BackoffPolicy,
    artifacts: Option<ArtifactStore>,
}

impl BatchUploader {
    pub fn new(destination: Arc<dyn Destination>, backoff: BackoffPolicy) -> Self {
        Self {
            destination,
            backoff,
            artifacts: None,
        }
    }

    /// Keep failed response bodies on disk as hash-addressed artifacts.
    pub fn with_artifacts(mut self, store: ArtifactStore) -> Self {
        self.artifacts = Some(store);
        self
    }

    pub fn max_batch_size(&self) -> usize {
        self.destination.max_batch_size()
    }

    pub async fn upload(&self, batch: &[TargetRecord]) -> BatchReport {
        let span = info_span!("upload_batch", records = batch.len());
        self.upload_inner(batch).instrument(span).await
    }

    async fn upload_inner(&self, batch: &[TargetRecord]) -> BatchReport {
        let retried = retry_with_backoff(
            &self.backoff,
            "upload",
            || self.destination.create_records(batch),
            DestinationError::disposition,
        )
        .await;
        let attempts = retried.attempts;
        let retries = retried.retries();
        match retried.result {
            Ok(created) => {
                if created.len() < batch.len() {
                    warn!(
                        sent = batch.len(),
                        created = created.len(),
                        "destination returned fewer records than sent"
                    );
                }
                BatchReport {
                    created,
                    attempts,
                    retries,
                    failure: None,
                }
            }
            Err(err) => {
                let failure = self.describe_failure(&err, err.disposition().into()).await;
                warn!(
                    attempts,
                    class = ?failure.class,
                    status = ?failure.status,
                    "batch upload failed: {}",
                    failure.message
                );
                BatchReport {
                    created: Vec::new(),
                    attempts,
                    retries,
                    failure: Some(failure),
                }
            }
        }
    }

    async fn describe_failure(&self, err: &DestinationError, class: ErrorClass) -> BatchFailure {
        let body = err.body().filter(|b| !b.is_empty()).map(str::to_string);
        let mut artifact = None;
        if let (Some(store), Some(body)) = (&self.artifacts, &body) {
            match store
                .store_bytes(Utc::now(), FAILURE_ARTIFACT_NAMESPACE, "json", body.as_bytes())
                .await
            {
                Ok(stored) => artifact = Some(stored.absolute_path),
                Err(store_err) => warn!("could not keep failed batch body: {store_err:#}"),
            }
        }
        BatchFailure {
            class,
            status: err.status(),
            message: err.to_string(),
            body,
            artifact,
        }
    }
}
