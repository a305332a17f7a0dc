//! Target existence check.
//!
//! Every mapped record is checked before upload. The run index is consulted
//! first; it holds keys already found at the destination or created this run,
//! plus keys claimed by a batch that is still uploading. Destination queries
//! retry transient failures under the same backoff policy as uploads.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use ph_adapters::{Destination, DestinationError, DestinationRecord};
use ph_core::{MatchKey, TargetRecord};
use ph_storage::{retry_with_backoff, BackoffPolicy};
use serde::{Deserialize, Serialize};
use strsim::jaro_winkler;
use tokio::sync::Mutex;
use tracing::debug;

pub const DEFAULT_FUZZY_THRESHOLD: f64 = 0.97;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MatchStrength {
    NamePostcode,
    NameTown,
    /// Record carries no location at all; the name alone has to agree.
    NameOnly,
    FuzzyNamePostcode,
}

/// How an existing entry was found.
#[derive(Debug, Clone, PartialEq)]
pub enum Existence {
    New,
    AtDestination {
        record_id: String,
        strength: MatchStrength,
    },
    SeenThisRun,
}

impl Existence {
    pub fn exists(&self) -> bool {
        !matches!(self, Self::New)
    }
}

/// Match `target` against one destination entry, most specific rule first.
pub fn match_strength(target: &MatchKey, candidate: &MatchKey, fuzzy_threshold: f64) -> Option<MatchStrength> {
    if target.name.is_empty() {
        return None;
    }
    if let Some(postcode) = &target.postcode {
        if candidate.postcode.as_ref() != Some(postcode) {
            return None;
        }
        if candidate.name == target.name {
            return Some(MatchStrength::NamePostcode);
        }
        if jaro_winkler(&candidate.name, &target.name) >= fuzzy_threshold {
            return Some(MatchStrength::FuzzyNamePostcode);
        }
        return None;
    }
    if candidate.name != target.name {
        return None;
    }
    match &target.town {
        Some(town) if candidate.town.as_ref() == Some(town) => Some(MatchStrength::NameTown),
        Some(_) => None,
        None => Some(MatchStrength::NameOnly),
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KeyState {
    Known,
    Claimed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LookupStrategy {
    /// One filtered destination query per record.
    PerRecord,
    /// Match against a destination snapshot taken once with [`ExistenceCheck::preload`].
    Preloaded,
}

pub struct ExistenceCheck {
    destination: Arc<dyn Destination>,
    fuzzy_threshold: f64,
    backoff: BackoffPolicy,
    strategy: LookupStrategy,
    snapshot: Vec<(MatchKey, String)>,
    index: Mutex<HashMap<String, KeyState>>,
    retries: AtomicU64,
}

impl ExistenceCheck {
    /// Single-attempt lookups until [`with_backoff`](Self::with_backoff) is applied.
    pub fn new(destination: Arc<dyn Destination>, fuzzy_threshold: f64) -> Self {
        Self {
            destination,
            fuzzy_threshold,
            backoff: BackoffPolicy {
                max_attempts: 1,
                ..BackoffPolicy::default()
            },
            strategy: LookupStrategy::PerRecord,
            snapshot: Vec::new(),
            index: Mutex::new(HashMap::new()),
            retries: AtomicU64::new(0),
        }
    }

    pub fn with_backoff(mut self, backoff: BackoffPolicy) -> Self {
        self.backoff = backoff;
        self
    }

    /// Retries spent on destination queries since the last call.
    pub fn take_retries(&self) -> u64 {
        self.retries.swap(0, Ordering::Relaxed)
    }

    pub fn strategy(&self) -> LookupStrategy {
        self.strategy
    }

    /// Switch to snapshot lookups. Returns the number of destination entries loaded.
    pub async fn preload(&mut self) -> Result<usize, DestinationError> {
        let retried = retry_with_backoff(
            &self.backoff,
            "preload",
            || self.destination.list_records(),
            DestinationError::disposition,
        )
        .await;
        self.retries.fetch_add(retried.retries() as u64, Ordering::Relaxed);
        let records = retried.result?;
        self.snapshot = records
            .into_iter()
            .map(|r| (r.fields.match_key(), r.id))
            .collect();
        self.strategy = LookupStrategy::Preloaded;
        debug!(entries = self.snapshot.len(), "preloaded destination snapshot");
        Ok(self.snapshot.len())
    }

    /// Whether an equivalent entry exists at the destination or earlier in this run.
    pub async fn exists(&self, target: &TargetRecord) -> Result<bool, DestinationError> {
        let key = target.match_key();
        if self.index.lock().await.contains_key(&key.as_index_key()) {
            return Ok(true);
        }
        Ok(self.find_at_destination(&key).await?.is_some())
    }

    /// Check `target` and, when it is new, claim its key for the caller's upload.
    ///
    /// A claimed key must later be passed to [`confirm`](Self::confirm) or
    /// [`release`](Self::release).
    pub async fn check_and_claim(&self, target: &TargetRecord) -> Result<Existence, DestinationError> {
        let key = target.match_key();
        let index_key = key.as_index_key();
        if self.index.lock().await.contains_key(&index_key) {
            return Ok(Existence::SeenThisRun);
        }

        if let Some((record_id, strength)) = self.find_at_destination(&key).await? {
            self.index.lock().await.insert(index_key, KeyState::Known);
            return Ok(Existence::AtDestination { record_id, strength });
        }

        let mut index = self.index.lock().await;
        if index.contains_key(&index_key) {
            return Ok(Existence::SeenThisRun);
        }
        index.insert(index_key, KeyState::Claimed);
        Ok(Existence::New)
    }

    pub async fn confirm(&self, target: &TargetRecord) {
        self.index
            .lock()
            .await
            .insert(target.match_key().as_index_key(), KeyState::Known);
    }

    /// Drop a claim after a failed upload so a later run can retry the record.
    pub async fn release(&self, target: &TargetRecord) {
        let index_key = target.match_key().as_index_key();
        let mut index = self.index.lock().await;
        if index.get(&index_key) == Some(&KeyState::Claimed) {
            index.remove(&index_key);
        }
    }

    async fn find_at_destination(
        &self,
        key: &MatchKey,
    ) -> Result<Option<(String, MatchStrength)>, DestinationError> {
        let best = match self.strategy {
            LookupStrategy::Preloaded => best_match(
                key,
                self.snapshot.iter().map(|(k, id)| (k.clone(), id.clone())),
                self.fuzzy_threshold,
            ),
            LookupStrategy::PerRecord => {
                let retried = retry_with_backoff(
                    &self.backoff,
                    "lookup",
                    || self.destination.find_candidates(key),
                    DestinationError::disposition,
                )
                .await;
                self.retries.fetch_add(retried.retries() as u64, Ordering::Relaxed);
                let candidates = retried.result?;
                best_match(
                    key,
                    candidates.into_iter().map(candidate_key),
                    self.fuzzy_threshold,
                )
            }
        };
        Ok(best)
    }
}

fn candidate_key(record: DestinationRecord) -> (MatchKey, String) {
    (record.fields.match_key(), record.id)
}

/// Exact matches win over fuzzy ones; among fuzzy ones the first is kept.
fn best_match(
    key: &MatchKey,
    candidates: impl Iterator<Item = (MatchKey, String)>,
    threshold: f64,
) -> Option<(String, MatchStrength)> {
    let mut fuzzy = None;
    for (candidate, id) in candidates {
        match match_strength(key, &candidate, threshold) {
            Some(MatchStrength::FuzzyNamePostcode) => {
                if fuzzy.is_none() {
                    fuzzy = Some((id, MatchStrength::FuzzyNamePostcode));
                }
            }
            Some(strength) => return Some((id, strength)),
            None => {}
        }
    }
    fuzzy
}
