//! In-process source and destination with the same contracts as the real
//! adapters. Used for offline runs from a JSON fixture and by tests.

use std::collections::VecDeque;
use std::path::Path;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use ph_core::{compact_postcode, normalize_name, sample_key, BusinessRecord, Cursor, MatchKey, TargetRecord};
use tokio::sync::Mutex;

use crate::{Destination, DestinationError, DestinationRecord, Page, SourceError, SourceFilter, SourceReader};

/// Load a JSON array of business records.
pub fn load_fixture_records(path: impl AsRef<Path>) -> Result<Vec<BusinessRecord>, SourceError> {
    let path = path.as_ref();
    let data = std::fs::read_to_string(path)
        .map_err(|e| SourceError::Fixture(format!("reading {}: {e}", path.display())))?;
    serde_json::from_str(&data)
        .map_err(|e| SourceError::Fixture(format!("parsing {}: {e}", path.display())))
}

pub struct MemorySource {
    records: Vec<BusinessRecord>,
    filter: SourceFilter,
    reads: AtomicUsize,
    fail_on_read: Option<usize>,
}

impl MemorySource {
    pub fn new(records: Vec<BusinessRecord>) -> Self {
        Self {
            records,
            filter: SourceFilter::default(),
            reads: AtomicUsize::new(0),
            fail_on_read: None,
        }
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, SourceError> {
        Ok(Self::new(load_fixture_records(path)?))
    }

    pub fn with_filter(mut self, filter: SourceFilter) -> Self {
        self.filter = filter;
        self
    }

    /// Make the n-th read (1-based) fail like a dropped connection.
    #[cfg(any(test, feature = "test-util"))]
    pub fn failing_on_read(mut self, read_no: usize) -> Self {
        self.fail_on_read = Some(read_no);
        self
    }

    pub fn reads(&self) -> usize {
        self.reads.load(Ordering::SeqCst)
    }
}

fn name_key(record: &BusinessRecord) -> String {
    record.name.as_deref().unwrap_or_default().to_lowercase()
}

#[async_trait]
impl SourceReader for MemorySource {
    async fn read_page(&self, page_size: usize, cursor: &Cursor) -> Result<Page, SourceError> {
        let read_no = self.reads.fetch_add(1, Ordering::SeqCst) + 1;
        if self.fail_on_read == Some(read_no) {
            return Err(SourceError::Database(sqlx::Error::PoolTimedOut));
        }

        let mut rows = self
            .records
            .iter()
            .filter(|r| self.filter.admits(r))
            .cloned()
            .collect::<Vec<_>>();

        let records = match cursor {
            Cursor::ById { after } => {
                rows.sort_by_key(|r| r.id);
                rows.into_iter()
                    .filter(|r| after.map_or(true, |id| r.id > id))
                    .take(page_size)
                    .collect::<Vec<_>>()
            }
            Cursor::ByName { after } => {
                rows.sort_by(|a, b| name_key(a).cmp(&name_key(b)).then(a.id.cmp(&b.id)));
                rows.into_iter()
                    .filter(|r| {
                        after
                            .as_ref()
                            .map_or(true, |(name, id)| (name_key(r), r.id) > (name.clone(), *id))
                    })
                    .take(page_size)
                    .collect::<Vec<_>>()
            }
            Cursor::Sample { seed, after } => {
                let mut keyed = rows
                    .into_iter()
                    .map(|r| ((sample_key(r.id, seed), r.id), r))
                    .collect::<Vec<_>>();
                keyed.sort_by(|a, b| a.0.cmp(&b.0));
                keyed
                    .into_iter()
                    .filter(|(key, _)| after.as_ref().map_or(true, |after| key > after))
                    .map(|(_, r)| r)
                    .take(page_size)
                    .collect::<Vec<_>>()
            }
        };

        let next_cursor = match records.last() {
            Some(last) => cursor.after_record(last),
            None => cursor.clone(),
        };
        Ok(Page {
            records,
            next_cursor,
        })
    }
}

#[derive(Debug, Default)]
struct MemoryDestinationState {
    records: Vec<DestinationRecord>,
    scripted_create_errors: VecDeque<Option<DestinationError>>,
    scripted_lookup_errors: VecDeque<Option<DestinationError>>,
    drop_last_on_create: bool,
    create_calls: usize,
    lookup_calls: usize,
    next_id: usize,
}

/// Destination held in memory. With the `test-util` feature, failures can be
/// scripted per call in order: each queued entry is consumed by one call,
/// `None` meaning "behave normally".
pub struct MemoryDestination {
    max_batch_size: usize,
    state: Mutex<MemoryDestinationState>,
}

impl Default for MemoryDestination {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryDestination {
    pub fn new() -> Self {
        Self {
            max_batch_size: 10,
            state: Mutex::new(MemoryDestinationState::default()),
        }
    }

    pub fn with_max_batch_size(mut self, max: usize) -> Self {
        self.max_batch_size = max.max(1);
        self
    }

    pub async fn seed(&self, records: Vec<TargetRecord>) {
        let mut state = self.state.lock().await;
        for fields in records {
            state.next_id += 1;
            let id = format!("recSeed{:04}", state.next_id);
            state.records.push(DestinationRecord { id, fields });
        }
    }

    #[cfg(any(test, feature = "test-util"))]
    pub async fn script_create(&self, outcome: Option<DestinationError>) {
        self.state.lock().await.scripted_create_errors.push_back(outcome);
    }

    #[cfg(any(test, feature = "test-util"))]
    pub async fn script_lookup(&self, outcome: Option<DestinationError>) {
        self.state.lock().await.scripted_lookup_errors.push_back(outcome);
    }

    /// Every subsequent create silently drops the last record of its batch.
    #[cfg(any(test, feature = "test-util"))]
    pub async fn drop_last_record_on_create(&self) {
        self.state.lock().await.drop_last_on_create = true;
    }

    pub async fn records(&self) -> Vec<DestinationRecord> {
        self.state.lock().await.records.clone()
    }

    pub async fn create_calls(&self) -> usize {
        self.state.lock().await.create_calls
    }

    pub async fn lookup_calls(&self) -> usize {
        self.state.lock().await.lookup_calls
    }
}

fn candidate_matches(record: &TargetRecord, key: &MatchKey) -> bool {
    if let Some(postcode) = &key.postcode {
        record
            .postcode
            .as_deref()
            .is_some_and(|p| compact_postcode(p) == *postcode)
    } else if let Some(town) = &key.town {
        record.town.as_deref().is_some_and(|t| normalize_name(t) == *town)
    } else {
        normalize_name(&record.business_name) == key.name
    }
}

#[async_trait]
impl Destination for MemoryDestination {
    fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    async fn create_records(
        &self,
        records: &[TargetRecord],
    ) -> Result<Vec<DestinationRecord>, DestinationError> {
        let mut state = self.state.lock().await;
        state.create_calls += 1;
        if let Some(Some(err)) = state.scripted_create_errors.pop_front() {
            return Err(err);
        }
        if records.len() > self.max_batch_size {
            return Err(DestinationError::Status {
                status: 422,
                body: format!(
                    r#"{{"error":{{"type":"INVALID_RECORDS","message":"at most {} records per request"}}}}"#,
                    self.max_batch_size
                ),
            });
        }

        let keep = if state.drop_last_on_create {
            records.len().saturating_sub(1)
        } else {
            records.len()
        };
        let mut created = Vec::with_capacity(keep);
        for fields in records.iter().take(keep) {
            state.next_id += 1;
            let record = DestinationRecord {
                id: format!("recMem{:04}", state.next_id),
                fields: fields.clone(),
            };
            state.records.push(record.clone());
            created.push(record);
        }
        Ok(created)
    }

    async fn find_candidates(&self, key: &MatchKey) -> Result<Vec<DestinationRecord>, DestinationError> {
        let mut state = self.state.lock().await;
        state.lookup_calls += 1;
        if let Some(Some(err)) = state.scripted_lookup_errors.pop_front() {
            return Err(err);
        }
        Ok(state
            .records
            .iter()
            .filter(|r| candidate_matches(&r.fields, key))
            .cloned()
            .collect())
    }

    async fn list_records(&self) -> Result<Vec<DestinationRecord>, DestinationError> {
        let mut state = self.state.lock().await;
        state.lookup_calls += 1;
        Ok(state.records.clone())
    }
}
