//! Core domain model for the Parent Helper directory sync.

use chrono::{DateTime, Utc, Weekday};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

pub mod mapping;

pub use mapping::{map_record, unmap_record, CategoryAlias, MappingError, MappingRules};

pub const CRATE_NAME: &str = "ph-core";

/// One class/activity listing as stored in the source `businesses` table.
///
/// Every column except `id` is nullable at source, so every field is optional
/// here; the field mapper decides which absences get defaults.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BusinessRecord {
    pub id: i64,
    pub name: Option<String>,
    pub description: Option<String>,
    pub category: Option<String>,
    pub town: Option<String>,
    pub postcode: Option<String>,
    pub address: Option<String>,
    pub venue: Option<String>,
    pub age_min_months: Option<i32>,
    pub age_max_months: Option<i32>,
    pub day_of_week: Option<String>,
    pub time: Option<String>,
    pub price: Option<String>,
    pub phone: Option<String>,
    pub email: Option<String>,
    pub website: Option<String>,
    pub is_featured: Option<bool>,
    pub is_active: Option<bool>,
    pub wheelchair_accessible: Option<bool>,
    pub parking_available: Option<bool>,
    pub direct_booking_available: Option<bool>,
    pub rating: Option<f64>,
    pub created_at: Option<DateTime<Utc>>,
}

impl BusinessRecord {
    /// Short identifying label used in logs and failure reports.
    pub fn label(&self) -> String {
        format!(
            "#{} {} ({})",
            self.id,
            self.name.as_deref().unwrap_or("<unnamed>").trim(),
            self.postcode
                .as_deref()
                .or(self.town.as_deref())
                .unwrap_or("no location")
                .trim()
        )
    }
}

/// Airtable-side projection of a [`BusinessRecord`].
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct TargetRecord {
    #[serde(rename = "Business_Name", default)]
    pub business_name: String,
    #[serde(rename = "Description", default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(rename = "Category", default)]
    pub category: String,
    #[serde(rename = "Town", default, skip_serializing_if = "Option::is_none")]
    pub town: Option<String>,
    #[serde(rename = "Postcode", default, skip_serializing_if = "Option::is_none")]
    pub postcode: Option<String>,
    #[serde(rename = "Full_Address", default, skip_serializing_if = "Option::is_none")]
    pub full_address: Option<String>,
    #[serde(rename = "Venue", default, skip_serializing_if = "Option::is_none")]
    pub venue: Option<String>,
    #[serde(rename = "Age_Range_Min", default)]
    pub age_range_min: i32,
    #[serde(rename = "Age_Range_Max", default)]
    pub age_range_max: i32,
    #[serde(rename = "Day_Of_Week", default, skip_serializing_if = "Option::is_none")]
    pub day_of_week: Option<String>,
    #[serde(rename = "Time", default, skip_serializing_if = "Option::is_none")]
    pub time: Option<String>,
    #[serde(rename = "Price", default)]
    pub price: String,
    #[serde(rename = "Phone", default, skip_serializing_if = "Option::is_none")]
    pub phone: Option<String>,
    #[serde(rename = "Email", default, skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(rename = "Website", default, skip_serializing_if = "Option::is_none")]
    pub website: Option<String>,
    #[serde(rename = "Is_Featured", default)]
    pub is_featured: bool,
    #[serde(rename = "Is_Active", default)]
    pub is_active: bool,
    #[serde(rename = "Wheelchair_Accessible", default)]
    pub wheelchair_accessible: bool,
    #[serde(rename = "Parking_Available", default)]
    pub parking_available: bool,
    #[serde(rename = "Direct_Booking_Available", default)]
    pub direct_booking_available: bool,
    #[serde(rename = "Rating", default, skip_serializing_if = "Option::is_none")]
    pub rating: Option<f64>,
    #[serde(rename = "Created_At", default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
}

impl TargetRecord {
    pub fn match_key(&self) -> MatchKey {
        MatchKey::new(
            &self.business_name,
            self.postcode.as_deref(),
            self.town.as_deref(),
        )
    }
}

/// Normalised de facto uniqueness key: name + postcode, falling back to town.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct MatchKey {
    pub name: String,
    pub postcode: Option<String>,
    pub town: Option<String>,
}

impl MatchKey {
    pub fn new(name: &str, postcode: Option<&str>, town: Option<&str>) -> Self {
        Self {
            name: normalize_name(name),
            postcode: postcode
                .map(compact_postcode)
                .filter(|p| !p.is_empty()),
            town: town.map(normalize_name).filter(|t| !t.is_empty()),
        }
    }

    /// Stable string form used as the run-index key.
    pub fn as_index_key(&self) -> String {
        match (&self.postcode, &self.town) {
            (Some(postcode), _) => format!("{}|pc:{}", self.name, postcode),
            (None, Some(town)) => format!("{}|town:{}", self.name, town),
            (None, None) => format!("{}|-", self.name),
        }
    }
}

/// Lowercase and collapse internal whitespace.
pub fn normalize_name(input: &str) -> String {
    input
        .split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

/// Uppercase with all whitespace removed (`sp10 2bx` -> `SP102BX`).
pub fn compact_postcode(input: &str) -> String {
    input
        .chars()
        .filter(|c| !c.is_whitespace())
        .collect::<String>()
        .to_ascii_uppercase()
}

/// Canonical UK postcode formatting: uppercase, one space before the inward code.
///
/// Values that do not look like a UK postcode are uppercased with whitespace
/// collapsed and otherwise left alone.
pub fn normalize_postcode(input: &str) -> String {
    let compact = compact_postcode(input);
    if looks_like_postcode(&compact) {
        let split = compact.len() - 3;
        format!("{} {}", &compact[..split], &compact[split..])
    } else {
        input
            .split_whitespace()
            .collect::<Vec<_>>()
            .join(" ")
            .to_ascii_uppercase()
    }
}

fn looks_like_postcode(compact: &str) -> bool {
    if !(5..=7).contains(&compact.len()) || !compact.is_ascii() {
        return false;
    }
    let bytes = compact.as_bytes();
    let (outward, inward) = bytes.split_at(bytes.len() - 3);
    outward[0].is_ascii_alphabetic()
        && outward.iter().all(u8::is_ascii_alphanumeric)
        && outward.iter().any(u8::is_ascii_digit)
        && inward[0].is_ascii_digit()
        && inward[1].is_ascii_alphabetic()
        && inward[2].is_ascii_alphabetic()
}

/// Find the first UK postcode inside free text such as a formatted address.
pub fn extract_postcode(text: &str) -> Option<String> {
    let tokens = text
        .split(|c: char| c == ',' || c.is_whitespace())
        .filter(|t| !t.is_empty())
        .collect::<Vec<_>>();
    for window in tokens.windows(2) {
        let joined = compact_postcode(&format!("{}{}", window[0], window[1]));
        if window[1].len() == 3 && looks_like_postcode(&joined) {
            return Some(normalize_postcode(&joined));
        }
    }
    tokens
        .iter()
        .map(|t| compact_postcode(t))
        .find(|t| looks_like_postcode(t))
        .map(|t| normalize_postcode(&t))
}

/// Parse a weekday in any case, as a full name or a common abbreviation.
pub fn parse_weekday(input: &str) -> Option<Weekday> {
    let lower = input.trim().trim_end_matches('.').to_ascii_lowercase();
    match lower.as_str() {
        "tue" | "tues" => Some(Weekday::Tue),
        "wed" | "weds" => Some(Weekday::Wed),
        "thu" | "thur" | "thurs" => Some(Weekday::Thu),
        _ => lower.parse::<Weekday>().ok(),
    }
}

pub fn weekday_name(day: Weekday) -> &'static str {
    match day {
        Weekday::Mon => "Monday",
        Weekday::Tue => "Tuesday",
        Weekday::Wed => "Wednesday",
        Weekday::Thu => "Thursday",
        Weekday::Fri => "Friday",
        Weekday::Sat => "Saturday",
        Weekday::Sun => "Sunday",
    }
}

/// Hex sha256 of `id || seed`; the sort key of the seeded sample ordering.
pub fn sample_key(id: i64, seed: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(id.to_string().as_bytes());
    hasher.update(seed.as_bytes());
    hex::encode(hasher.finalize())
}

/// Resumable position in a paged source read.
///
/// Every ordering is keyset based, so rows present when a pass started are
/// never skipped by rows inserted ahead of the cursor.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "order", rename_all = "snake_case")]
pub enum Cursor {
    ById { after: Option<i64> },
    ByName { after: Option<(String, i64)> },
    Sample { seed: String, after: Option<(String, i64)> },
}

impl Cursor {
    pub fn start(order: SourceOrder) -> Self {
        match order {
            SourceOrder::Id => Self::ById { after: None },
            SourceOrder::Name => Self::ByName { after: None },
            SourceOrder::Sample { seed } => Self::Sample { seed, after: None },
        }
    }

    pub fn order(&self) -> SourceOrder {
        match self {
            Self::ById { .. } => SourceOrder::Id,
            Self::ByName { .. } => SourceOrder::Name,
            Self::Sample { seed, .. } => SourceOrder::Sample { seed: seed.clone() },
        }
    }

    /// Cursor positioned just after `record`.
    pub fn after_record(&self, record: &BusinessRecord) -> Self {
        match self {
            Self::ById { .. } => Self::ById {
                after: Some(record.id),
            },
            Self::ByName { .. } => Self::ByName {
                after: Some((
                    record.name.as_deref().unwrap_or_default().to_lowercase(),
                    record.id,
                )),
            },
            Self::Sample { seed, .. } => Self::Sample {
                seed: seed.clone(),
                after: Some((sample_key(record.id, seed), record.id)),
            },
        }
    }

    pub fn is_start(&self) -> bool {
        match self {
            Self::ById { after } => after.is_none(),
            Self::ByName { after } => after.is_none(),
            Self::Sample { after, .. } => after.is_none(),
        }
    }

    /// Whether a finished pass should start over on the next run.
    ///
    /// Id order only ever grows at the end. The other orderings can gain rows
    /// ahead of the cursor, which only a new pass will reach.
    pub fn restarts_when_exhausted(&self) -> bool {
        matches!(self, Self::Sample { .. })
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum SourceOrder {
    Id,
    Name,
    Sample { seed: String },
}

impl SourceOrder {
    pub fn seed(&self) -> Option<&str> {
        match self {
            Self::Sample { seed } => Some(seed),
            _ => None,
        }
    }
}

/// Process-local run counters; never persisted beyond the run report.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProgressCounters {
    pub processed: u64,
    pub added: u64,
    pub skipped: u64,
    pub failed: u64,
    pub pages_read: u64,
    pub batches_sent: u64,
    pub retries: u64,
    pub enriched: u64,
    pub enrichment_misses: u64,
    pub enrichment_failures: u64,
}

impl ProgressCounters {
    pub fn merge(&mut self, other: &ProgressCounters) {
        self.processed += other.processed;
        self.added += other.added;
        self.skipped += other.skipped;
        self.failed += other.failed;
        self.pages_read += other.pages_read;
        self.batches_sent += other.batches_sent;
        self.retries += other.retries;
        self.enriched += other.enriched;
        self.enrichment_misses += other.enrichment_misses;
        self.enrichment_failures += other.enrichment_failures;
    }
}
