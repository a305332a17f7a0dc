//! Adapter contracts for the systems the sync talks to: the Postgres source
//! table, the Airtable destination and the places lookup used for enrichment.

use async_trait::async_trait;
use ph_core::{BusinessRecord, Cursor, MatchKey, TargetRecord};
use ph_storage::{classify_status, RetryDisposition};
use reqwest::StatusCode;
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use thiserror::Error;

pub mod airtable;
pub mod memory;
pub mod places;
pub mod postgres;

pub use airtable::{AirtableConfig, AirtableDestination};
pub use memory::{load_fixture_records, MemoryDestination, MemorySource};
pub use places::{PlacesConfig, PlacesEnricher};
pub use postgres::PostgresSource;

pub const CRATE_NAME: &str = "ph-adapters";

/// Row filters applied on top of the cursor ordering.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SourceFilter {
    /// Inclusive lower bound on the lowercased name.
    pub name_from: Option<String>,
    /// Exclusive upper bound on the lowercased name.
    pub name_to: Option<String>,
    pub active_only: bool,
}

impl SourceFilter {
    pub fn admits(&self, record: &BusinessRecord) -> bool {
        let name = record.name.as_deref().unwrap_or_default().to_lowercase();
        if let Some(from) = &self.name_from {
            if name < from.to_lowercase() {
                return false;
            }
        }
        if let Some(to) = &self.name_to {
            if name >= to.to_lowercase() {
                return false;
            }
        }
        !self.active_only || record.is_active.unwrap_or(true)
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Page {
    pub records: Vec<BusinessRecord>,
    pub next_cursor: Cursor,
}

impl Page {
    /// An empty or short page means the source has nothing further.
    pub fn is_last(&self, page_size: usize) -> bool {
        self.records.len() < page_size.max(1)
    }
}

#[derive(Debug, Error)]
pub enum SourceError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
    #[error("invalid source table name {0:?}")]
    InvalidTable(String),
    #[error("fixture error: {0}")]
    Fixture(String),
}

#[async_trait]
pub trait SourceReader: Send + Sync {
    /// Read up to `page_size` records strictly after `cursor`.
    async fn read_page(&self, page_size: usize, cursor: &Cursor) -> Result<Page, SourceError>;
}

/// A record as stored at the destination, with its destination id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DestinationRecord {
    pub id: String,
    pub fields: TargetRecord,
}

impl DestinationRecord {
    /// Decode destination fields leniently: a record whose optional fields do
    /// not fit the expected types still yields its identity fields.
    pub fn from_json(id: String, fields: JsonValue) -> Self {
        let decoded = serde_json::from_value::<TargetRecord>(fields.clone()).unwrap_or_else(|_| {
            let text = |key: &str| fields.get(key).and_then(JsonValue::as_str).map(str::to_string);
            TargetRecord {
                business_name: text("Business_Name").unwrap_or_default(),
                town: text("Town"),
                postcode: text("Postcode"),
                ..Default::default()
            }
        });
        Self {
            id,
            fields: decoded,
        }
    }
}

#[derive(Debug, Error)]
pub enum DestinationError {
    #[error("destination returned http {status}: {body}")]
    Status { status: u16, body: String },
    #[error("destination request failed: {0}")]
    Transport(#[from] reqwest::Error),
    #[error("unexpected destination response: {0}")]
    Decode(String),
}

/// Destination error types that mean the base/table/fields are not what we expect.
const SCHEMA_MISMATCH_MARKERS: &[&str] = &[
    "UNKNOWN_FIELD_NAME",
    "INVALID_PERMISSIONS",
    "TABLE_NOT_FOUND",
    "MODEL_NOT_FOUND",
    "AUTHENTICATION_REQUIRED",
];

impl DestinationError {
    pub fn disposition(&self) -> RetryDisposition {
        match self {
            Self::Status { status, body } => {
                if SCHEMA_MISMATCH_MARKERS.iter().any(|m| body.contains(m)) {
                    return RetryDisposition::Fatal;
                }
                StatusCode::from_u16(*status)
                    .map(classify_status)
                    .unwrap_or(RetryDisposition::NonRetryable)
            }
            Self::Transport(err) => ph_storage::classify_reqwest_error(err),
            Self::Decode(_) => RetryDisposition::NonRetryable,
        }
    }

    pub fn status(&self) -> Option<u16> {
        match self {
            Self::Status { status, .. } => Some(*status),
            Self::Transport(err) => err.status().map(|s| s.as_u16()),
            Self::Decode(_) => None,
        }
    }

    pub fn body(&self) -> Option<&str> {
        match self {
            Self::Status { body, .. } => Some(body),
            _ => None,
        }
    }
}

#[async_trait]
pub trait Destination: Send + Sync {
    /// Largest batch one create call accepts.
    fn max_batch_size(&self) -> usize;

    /// Create all `records` in one call. Results come back in input order and
    /// may be shorter than the input when the destination drops records.
    async fn create_records(
        &self,
        records: &[TargetRecord],
    ) -> Result<Vec<DestinationRecord>, DestinationError>;

    /// Records that could match `key`: same postcode when the key has one,
    /// otherwise same town, otherwise same name.
    async fn find_candidates(&self, key: &MatchKey) -> Result<Vec<DestinationRecord>, DestinationError>;

    /// Every record at the destination.
    async fn list_records(&self) -> Result<Vec<DestinationRecord>, DestinationError>;
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlaceMatch {
    pub place_id: String,
    pub formatted_address: String,
    pub postcode: Option<String>,
    pub lat: Option<f64>,
    pub lng: Option<f64>,
}

#[derive(Debug, Error)]
pub enum EnrichmentError {
    #[error("places api returned status {status}: {message}")]
    Api { status: String, message: String },
    #[error("places request failed: {0}")]
    Transport(#[from] reqwest::Error),
}

/// Best-effort address lookup; callers must treat errors as non-fatal.
#[async_trait]
pub trait Enricher: Send + Sync {
    async fn lookup(&self, query: &str) -> Result<Option<PlaceMatch>, EnrichmentError>;
}
