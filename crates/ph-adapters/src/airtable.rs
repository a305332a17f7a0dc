//! Airtable REST destination.
//!
//! One method call is one HTTP request; retrying is left to the caller so that
//! a single backoff policy governs every request the sync makes.

use anyhow::{anyhow, Context};
use async_trait::async_trait;
use ph_core::{MatchKey, TargetRecord};
use ph_storage::{build_http_client, HttpClientConfig};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use tracing::{debug, info_span, Instrument};

use crate::{Destination, DestinationError, DestinationRecord};

/// Airtable rejects create requests with more than ten records.
pub const AIRTABLE_MAX_BATCH: usize = 10;
const LIST_PAGE_SIZE: usize = 100;

#[derive(Debug, Clone)]
pub struct AirtableConfig {
    pub api_url: String,
    pub token: String,
    pub base_id: String,
    pub table: String,
    pub http: HttpClientConfig,
}

#[derive(Debug, Clone)]
pub struct AirtableDestination {
    client: reqwest::Client,
    table_url: reqwest::Url,
    token: String,
}

#[derive(Debug, Serialize)]
struct CreateRequest<'a> {
    records: Vec<CreateRecord<'a>>,
    typecast: bool,
}

#[derive(Debug, Serialize)]
struct CreateRecord<'a> {
    fields: &'a TargetRecord,
}

#[derive(Debug, Deserialize)]
struct RecordsResponse {
    #[serde(default)]
    records: Vec<RawRecord>,
    #[serde(default)]
    offset: Option<String>,
}

#[derive(Debug, Deserialize)]
struct RawRecord {
    id: String,
    #[serde(default)]
    fields: JsonValue,
}

impl AirtableDestination {
    pub fn new(config: AirtableConfig) -> anyhow::Result<Self> {
        let client = build_http_client(&config.http).context("building airtable client")?;
        let mut table_url = reqwest::Url::parse(&config.api_url)
            .with_context(|| format!("parsing airtable api url {}", config.api_url))?;
        table_url
            .path_segments_mut()
            .map_err(|_| anyhow!("airtable api url cannot take a path: {}", config.api_url))?
            .pop_if_empty()
            .extend(["v0", config.base_id.as_str(), config.table.as_str()]);
        Ok(Self {
            client,
            table_url,
            token: config.token,
        })
    }

    async fn send(&self, request: reqwest::RequestBuilder) -> Result<RecordsResponse, DestinationError> {
        let resp = request.bearer_auth(&self.token).send().await?;
        let status = resp.status();
        if !status.is_success() {
            let body = resp.text().await.unwrap_or_default();
            return Err(DestinationError::Status {
                status: status.as_u16(),
                body,
            });
        }
        let text = resp.text().await?;
        serde_json::from_str(&text).map_err(|e| DestinationError::Decode(format!("{e}: {text}")))
    }

    async fn select(&self, formula: Option<String>) -> Result<Vec<DestinationRecord>, DestinationError> {
        let mut out = Vec::new();
        let mut offset: Option<String> = None;
        loop {
            let mut query = vec![("pageSize".to_string(), LIST_PAGE_SIZE.to_string())];
            if let Some(formula) = &formula {
                query.push(("filterByFormula".to_string(), formula.clone()));
            }
            if let Some(offset) = &offset {
                query.push(("offset".to_string(), offset.clone()));
            }
            let page = self.send(self.client.get(self.table_url.clone()).query(&query)).await?;
            out.extend(
                page.records
                    .into_iter()
                    .map(|r| DestinationRecord::from_json(r.id, r.fields)),
            );
            match page.offset {
                Some(next) => offset = Some(next),
                None => break,
            }
        }
        Ok(out)
    }
}

#[async_trait]
impl Destination for AirtableDestination {
    fn max_batch_size(&self) -> usize {
        AIRTABLE_MAX_BATCH
    }

    async fn create_records(
        &self,
        records: &[TargetRecord],
    ) -> Result<Vec<DestinationRecord>, DestinationError> {
        let body = CreateRequest {
            records: records.iter().map(|fields| CreateRecord { fields }).collect(),
            typecast: true,
        };
        let span = info_span!("airtable_create", records = records.len());
        let resp = self
            .send(self.client.post(self.table_url.clone()).json(&body))
            .instrument(span)
            .await?;
        debug!(created = resp.records.len(), "airtable create response");
        Ok(resp
            .records
            .into_iter()
            .map(|r| DestinationRecord::from_json(r.id, r.fields))
            .collect())
    }

    async fn find_candidates(&self, key: &MatchKey) -> Result<Vec<DestinationRecord>, DestinationError> {
        self.select(Some(candidate_formula(key))).await
    }

    async fn list_records(&self) -> Result<Vec<DestinationRecord>, DestinationError> {
        self.select(None).await
    }
}

/// Airtable formula string literal with quotes and backslashes escaped.
pub fn formula_literal(value: &str) -> String {
    let escaped = value.replace('\\', "\\\\").replace('"', "\\\"");
    format!("\"{escaped}\"")
}

/// Narrowing formula for existence checks; exact matching happens client-side.
pub fn candidate_formula(key: &MatchKey) -> String {
    if let Some(postcode) = &key.postcode {
        format!(
            "UPPER(SUBSTITUTE({{Postcode}}, \" \", \"\")) = {}",
            formula_literal(postcode)
        )
    } else if let Some(town) = &key.town {
        format!("{} = {}", collapsed_lower("Town"), formula_literal(town))
    } else {
        format!("{} = {}", collapsed_lower("Business_Name"), formula_literal(&key.name))
    }
}

/// Field value lowercased, trimmed and with whitespace runs collapsed, as in `normalize_name`.
fn collapsed_lower(field: &str) -> String {
    format!("LOWER(TRIM(REGEX_REPLACE({{{field}}}, \"[[:space:]]+\", \" \")))")
}
