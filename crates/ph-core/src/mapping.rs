//! Field mapper: source row -> Airtable projection.
//!
//! Everything here is pure. Absent optional values get per-field defaults
//! instead of errors; only a missing name rejects a record.

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::{normalize_postcode, parse_weekday, weekday_name, BusinessRecord, TargetRecord};

pub const DEFAULT_CATEGORY: &str = "Educational";
pub const DEFAULT_PRICE: &str = "Contact for pricing";
pub const DEFAULT_AGE_MIN_MONTHS: i32 = 0;
pub const DEFAULT_AGE_MAX_MONTHS: i32 = 12;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum MappingError {
    #[error("record {id} has no business name")]
    MissingName { id: i64 },
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CategoryAlias {
    pub canonical: String,
    #[serde(default)]
    pub aliases: Vec<String>,
}

/// Defaults and category alignment applied by [`map_record`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MappingRules {
    #[serde(default = "default_category")]
    pub default_category: String,
    #[serde(default = "default_price")]
    pub default_price: String,
    #[serde(default)]
    pub default_age_min_months: i32,
    #[serde(default = "default_age_max")]
    pub default_age_max_months: i32,
    #[serde(default)]
    pub categories: Vec<CategoryAlias>,
}

fn default_category() -> String {
    DEFAULT_CATEGORY.to_string()
}

fn default_price() -> String {
    DEFAULT_PRICE.to_string()
}

fn default_age_max() -> i32 {
    DEFAULT_AGE_MAX_MONTHS
}

impl Default for MappingRules {
    fn default() -> Self {
        let alias = |canonical: &str, aliases: &[&str]| CategoryAlias {
            canonical: canonical.to_string(),
            aliases: aliases.iter().map(|a| a.to_string()).collect(),
        };
        Self {
            default_category: default_category(),
            default_price: default_price(),
            default_age_min_months: DEFAULT_AGE_MIN_MONTHS,
            default_age_max_months: DEFAULT_AGE_MAX_MONTHS,
            categories: vec![
                alias("Educational", &["education", "learning", "early learning"]),
                alias("Sensory", &["baby sensory", "sensory play", "messy play"]),
                alias("Music", &["music & movement", "music and movement", "singing"]),
                alias("Swimming", &["swim", "baby swimming", "aquatics"]),
                alias("Sports", &["sport", "gymnastics", "football", "physical"]),
                alias("Arts & Crafts", &["arts", "crafts", "art", "arts and crafts"]),
                alias("Dance", &["ballet", "baby ballet", "dancing"]),
                alias("Language", &["languages", "baby signing", "signing"]),
                alias("Yoga & Massage", &["baby yoga", "baby massage", "yoga", "massage"]),
            ],
        }
    }
}

impl MappingRules {
    /// Canonical category for a raw value, or the trimmed value when unknown.
    pub fn canonical_category(&self, raw: &str) -> String {
        let needle = raw.trim().to_lowercase();
        self.categories
            .iter()
            .find(|c| {
                c.canonical.to_lowercase() == needle
                    || c.aliases.iter().any(|a| a.trim().to_lowercase() == needle)
            })
            .map(|c| c.canonical.clone())
            .unwrap_or_else(|| raw.trim().to_string())
    }
}

/// Trimmed value, treating `None`, blank and the literal `"null"` as absent.
fn clean(value: Option<&str>) -> Option<String> {
    let trimmed = value?.trim();
    if trimmed.is_empty() || trimmed.eq_ignore_ascii_case("null") {
        None
    } else {
        Some(trimmed.to_string())
    }
}

fn clean_website(value: Option<&str>) -> Option<String> {
    clean(value).map(|site| {
        if site.to_ascii_lowercase().starts_with("www.") {
            format!("https://{site}")
        } else {
            site
        }
    })
}

fn age_or(value: Option<i32>, default: i32) -> i32 {
    match value {
        Some(v) if v >= 0 => v,
        _ => default,
    }
}

fn format_timestamp(ts: DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Secs, true)
}

pub fn map_record(record: &BusinessRecord, rules: &MappingRules) -> Result<TargetRecord, MappingError> {
    let business_name =
        clean(record.name.as_deref()).ok_or(MappingError::MissingName { id: record.id })?;

    let age_range_min = age_or(record.age_min_months, rules.default_age_min_months);
    let age_range_max = age_or(record.age_max_months, rules.default_age_max_months).max(age_range_min);

    Ok(TargetRecord {
        business_name,
        description: clean(record.description.as_deref()),
        category: clean(record.category.as_deref())
            .map(|c| rules.canonical_category(&c))
            .unwrap_or_else(|| rules.default_category.clone()),
        town: clean(record.town.as_deref()),
        postcode: clean(record.postcode.as_deref()).map(|p| normalize_postcode(&p)),
        full_address: clean(record.address.as_deref()),
        venue: clean(record.venue.as_deref()),
        age_range_min,
        age_range_max,
        day_of_week: clean(record.day_of_week.as_deref())
            .and_then(|d| parse_weekday(&d))
            .map(|d| weekday_name(d).to_string()),
        time: clean(record.time.as_deref()),
        price: clean(record.price.as_deref()).unwrap_or_else(|| rules.default_price.clone()),
        phone: clean(record.phone.as_deref()),
        email: clean(record.email.as_deref()).map(|e| e.to_lowercase()),
        website: clean_website(record.website.as_deref()),
        is_featured: record.is_featured.unwrap_or(false),
        is_active: record.is_active.unwrap_or(true),
        wheelchair_accessible: record.wheelchair_accessible.unwrap_or(false),
        parking_available: record.parking_available.unwrap_or(false),
        direct_booking_available: record.direct_booking_available.unwrap_or(false),
        rating: record.rating.filter(|r| r.is_finite() && (0.0..=5.0).contains(r)),
        created_at: record.created_at.map(format_timestamp),
    })
}

/// Inverse projection back into source shape. The id is unknown and left 0.
pub fn unmap_record(target: &TargetRecord) -> BusinessRecord {
    BusinessRecord {
        id: 0,
        name: Some(target.business_name.clone()),
        description: target.description.clone(),
        category: Some(target.category.clone()),
        town: target.town.clone(),
        postcode: target.postcode.clone(),
        address: target.full_address.clone(),
        venue: target.venue.clone(),
        age_min_months: Some(target.age_range_min),
        age_max_months: Some(target.age_range_max),
        day_of_week: target.day_of_week.clone(),
        time: target.time.clone(),
        price: Some(target.price.clone()),
        phone: target.phone.clone(),
        email: target.email.clone(),
        website: target.website.clone(),
        is_featured: Some(target.is_featured),
        is_active: Some(target.is_active),
        wheelchair_accessible: Some(target.wheelchair_accessible),
        parking_available: Some(target.parking_available),
        direct_booking_available: Some(target.direct_booking_available),
        rating: target.rating,
        created_at: target
            .created_at
            .as_deref()
            .and_then(|s| DateTime::parse_from_rfc3339(s).ok())
            .map(|ts| ts.with_timezone(&Utc)),
    }
}
