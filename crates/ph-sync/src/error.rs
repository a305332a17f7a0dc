use ph_adapters::{DestinationError, SourceError};
use ph_core::MappingError;
use ph_storage::RetryDisposition;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// How an error affects the run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorClass {
    /// Rate limits, timeouts, dropped connections. Retried with backoff; once
    /// retries run out the record is re-read by the next run.
    Transient,
    /// One record or batch is unusable; the run carries on.
    Data,
    /// Credentials, schema or source unavailable; the run stops.
    Fatal,
}

impl From<RetryDisposition> for ErrorClass {
    fn from(value: RetryDisposition) -> Self {
        match value {
            RetryDisposition::Retryable => Self::Transient,
            RetryDisposition::NonRetryable => Self::Data,
            RetryDisposition::Fatal => Self::Fatal,
        }
    }
}

#[derive(Debug, Error)]
pub enum SyncError {
    #[error("source read failed: {0}")]
    Source(#[from] SourceError),
    #[error(transparent)]
    Destination(#[from] DestinationError),
    #[error(transparent)]
    Mapping(#[from] MappingError),
    #[error("destination rejected a batch: {message}")]
    Rejected { status: Option<u16>, message: String },
    #[error("{records} record(s) still failing after retries; the next run resumes before them")]
    RetriesExhausted { records: usize },
    #[error("configuration error: {0}")]
    Config(String),
    #[error("state persistence failed: {0:#}")]
    State(#[from] anyhow::Error),
}

impl SyncError {
    pub fn class(&self) -> ErrorClass {
        match self {
            Self::Source(_) | Self::Rejected { .. } | Self::Config(_) | Self::State(_) => {
                ErrorClass::Fatal
            }
            Self::Destination(err) => err.disposition().into(),
            Self::Mapping(_) => ErrorClass::Data,
            Self::RetriesExhausted { .. } => ErrorClass::Transient,
        }
    }
}
