use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

use anyhow::{Context, Result};
use ph_adapters::airtable::AIRTABLE_MAX_BATCH;
use ph_core::MappingRules;
use ph_storage::{BackoffPolicy, HttpClientConfig};

use crate::SyncError;

pub const DEFAULT_AIRTABLE_API_URL: &str = "https://api.airtable.com";
pub const DEFAULT_PLACES_API_URL: &str = "https://maps.googleapis.com";
pub const DEFAULT_SOURCE_TABLE: &str = "businesses";
pub const DEFAULT_SYNC_CRON: &str = "0 0 6 * * *";
pub const MAX_WORKERS: usize = 5;
/// Upper bound accepted from configuration before the destination limit is applied.
pub const MAX_BATCH_SIZE: usize = 20;

#[derive(Debug, Clone)]
pub struct SyncConfig {
    pub database_url: Option<String>,
    pub source_table: String,
    pub airtable_api_url: String,
    pub airtable_token: String,
    pub airtable_base_id: String,
    pub airtable_table: String,
    pub page_size: usize,
    pub batch_size: usize,
    pub workers: usize,
    pub backoff: BackoffPolicy,
    pub http_timeout_secs: u64,
    pub user_agent: String,
    pub state_dir: PathBuf,
    pub reports_dir: PathBuf,
    pub artifacts_dir: PathBuf,
    pub rules_file: Option<PathBuf>,
    pub fuzzy_threshold: f64,
    pub places_api_key: Option<String>,
    pub places_api_url: String,
    pub scheduler_enabled: bool,
    pub sync_cron: String,
}

impl SyncConfig {
    pub fn from_env() -> Result<Self, SyncError> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Build from any key lookup; blank values count as unset.
    pub fn from_lookup<F>(lookup: F) -> Result<Self, SyncError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let var = |key: &str| {
            lookup(key)
                .map(|v| v.trim().to_string())
                .filter(|v| !v.is_empty())
        };

        let defaults = BackoffPolicy::default();
        let config = Self {
            database_url: var("DATABASE_URL"),
            source_table: var("PH_SOURCE_TABLE").unwrap_or_else(|| DEFAULT_SOURCE_TABLE.to_string()),
            airtable_api_url: var("AIRTABLE_API_URL")
                .unwrap_or_else(|| DEFAULT_AIRTABLE_API_URL.to_string()),
            airtable_token: var("AIRTABLE_TOKEN").unwrap_or_default(),
            airtable_base_id: var("AIRTABLE_BASE_ID").unwrap_or_default(),
            airtable_table: var("AIRTABLE_TABLE").unwrap_or_default(),
            page_size: parse_var(&var, "PH_PAGE_SIZE", 100)?,
            batch_size: parse_var(&var, "PH_BATCH_SIZE", AIRTABLE_MAX_BATCH)?,
            workers: parse_var(&var, "PH_WORKERS", 1)?,
            backoff: BackoffPolicy {
                max_attempts: parse_var(&var, "PH_MAX_ATTEMPTS", defaults.max_attempts)?,
                base_delay: Duration::from_millis(parse_var(
                    &var,
                    "PH_BACKOFF_BASE_MS",
                    defaults.base_delay.as_millis() as u64,
                )?),
                max_delay: Duration::from_millis(parse_var(
                    &var,
                    "PH_BACKOFF_MAX_MS",
                    defaults.max_delay.as_millis() as u64,
                )?),
            },
            http_timeout_secs: parse_var(&var, "PH_HTTP_TIMEOUT_SECS", 20)?,
            user_agent: var("PH_USER_AGENT").unwrap_or_else(|| "parent-helper-sync/0.1".to_string()),
            state_dir: var("PH_STATE_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./state")),
            reports_dir: var("PH_REPORTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./reports")),
            artifacts_dir: var("PH_ARTIFACTS_DIR")
                .map(PathBuf::from)
                .unwrap_or_else(|| PathBuf::from("./artifacts")),
            rules_file: var("PH_RULES_FILE").map(PathBuf::from),
            fuzzy_threshold: parse_var(&var, "PH_FUZZY_THRESHOLD", 0.97)?,
            places_api_key: var("GOOGLE_PLACES_API_KEY"),
            places_api_url: var("GOOGLE_PLACES_API_URL")
                .unwrap_or_else(|| DEFAULT_PLACES_API_URL.to_string()),
            scheduler_enabled: var("PH_SCHEDULER_ENABLED")
                .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "True"))
                .unwrap_or(false),
            sync_cron: var("PH_SYNC_CRON").unwrap_or_else(|| DEFAULT_SYNC_CRON.to_string()),
        };
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), SyncError> {
        if self.page_size == 0 {
            return Err(SyncError::Config("PH_PAGE_SIZE must be at least 1".into()));
        }
        if !(1..=MAX_BATCH_SIZE).contains(&self.batch_size) {
            return Err(SyncError::Config(format!(
                "PH_BATCH_SIZE must be between 1 and {MAX_BATCH_SIZE}, got {}",
                self.batch_size
            )));
        }
        if !(1..=MAX_WORKERS).contains(&self.workers) {
            return Err(SyncError::Config(format!(
                "PH_WORKERS must be between 1 and {MAX_WORKERS}, got {}",
                self.workers
            )));
        }
        if self.backoff.max_attempts == 0 {
            return Err(SyncError::Config("PH_MAX_ATTEMPTS must be at least 1".into()));
        }
        if self.backoff.base_delay > self.backoff.max_delay {
            return Err(SyncError::Config(
                "PH_BACKOFF_BASE_MS must not exceed PH_BACKOFF_MAX_MS".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.fuzzy_threshold) {
            return Err(SyncError::Config(format!(
                "PH_FUZZY_THRESHOLD must be within 0..=1, got {}",
                self.fuzzy_threshold
            )));
        }
        Ok(())
    }

    /// Destination credentials are only needed by commands that talk to Airtable.
    pub fn require_destination(&self) -> Result<(), SyncError> {
        for (key, value) in [
            ("AIRTABLE_TOKEN", &self.airtable_token),
            ("AIRTABLE_BASE_ID", &self.airtable_base_id),
            ("AIRTABLE_TABLE", &self.airtable_table),
        ] {
            if value.is_empty() {
                return Err(SyncError::Config(format!("{key} must be set")));
            }
        }
        Ok(())
    }

    pub fn http_client_config(&self) -> HttpClientConfig {
        HttpClientConfig {
            timeout: Duration::from_secs(self.http_timeout_secs),
            user_agent: Some(self.user_agent.clone()),
        }
    }

    pub fn database_url(&self) -> Result<&str, SyncError> {
        self.database_url
            .as_deref()
            .ok_or_else(|| SyncError::Config("DATABASE_URL must be set unless --fixture is used".into()))
    }
}

fn parse_var<T, F>(var: &F, key: &str, default: T) -> Result<T, SyncError>
where
    T: FromStr,
    T::Err: std::fmt::Display,
    F: Fn(&str) -> Option<String>,
{
    match var(key) {
        None => Ok(default),
        Some(raw) => raw
            .parse()
            .map_err(|e| SyncError::Config(format!("{key}={raw:?} is invalid: {e}"))),
    }
}

/// Mapping rules from an optional YAML file; built-in rules when absent.
pub fn load_mapping_rules(path: Option<&Path>) -> Result<MappingRules> {
    let Some(path) = path else {
        return Ok(MappingRules::default());
    };
    let text = std::fs::read_to_string(path)
        .with_context(|| format!("reading mapping rules {}", path.display()))?;
    serde_yaml::from_str(&text).with_context(|| format!("parsing mapping rules {}", path.display()))
}
