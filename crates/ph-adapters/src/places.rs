//! Google Places text search, used to fill in missing addresses.

use anyhow::Context;
use async_trait::async_trait;
use ph_core::extract_postcode;
use ph_storage::{build_http_client, HttpClientConfig};
use serde::Deserialize;
use tracing::debug;

use crate::{Enricher, EnrichmentError, PlaceMatch};

#[derive(Debug, Clone)]
pub struct PlacesConfig {
    pub api_url: String,
    pub api_key: String,
    /// Appended to every query to keep results in the UK.
    pub region: String,
    pub http: HttpClientConfig,
}

#[derive(Debug, Clone)]
pub struct PlacesEnricher {
    client: reqwest::Client,
    search_url: String,
    api_key: String,
    region: String,
}

#[derive(Debug, Deserialize)]
struct TextSearchResponse {
    status: String,
    #[serde(default)]
    error_message: Option<String>,
    #[serde(default)]
    results: Vec<TextSearchResult>,
}

#[derive(Debug, Deserialize)]
struct TextSearchResult {
    place_id: String,
    #[serde(default)]
    formatted_address: Option<String>,
    #[serde(default)]
    geometry: Option<Geometry>,
}

#[derive(Debug, Deserialize)]
struct Geometry {
    location: LatLng,
}

#[derive(Debug, Deserialize)]
struct LatLng {
    lat: f64,
    lng: f64,
}

impl PlacesEnricher {
    pub fn new(config: PlacesConfig) -> anyhow::Result<Self> {
        let client = build_http_client(&config.http).context("building places client")?;
        Ok(Self {
            client,
            search_url: format!(
                "{}/maps/api/place/textsearch/json",
                config.api_url.trim_end_matches('/')
            ),
            api_key: config.api_key,
            region: config.region,
        })
    }
}

#[async_trait]
impl Enricher for PlacesEnricher {
    async fn lookup(&self, query: &str) -> Result<Option<PlaceMatch>, EnrichmentError> {
        let resp: TextSearchResponse = self
            .client
            .get(&self.search_url)
            .query(&[
                ("query", query),
                ("region", self.region.as_str()),
                ("key", self.api_key.as_str()),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;

        match resp.status.as_str() {
            "OK" => {}
            "ZERO_RESULTS" => return Ok(None),
            other => {
                return Err(EnrichmentError::Api {
                    status: other.to_string(),
                    message: resp.error_message.unwrap_or_default(),
                })
            }
        }

        let Some(best) = resp.results.into_iter().next() else {
            return Ok(None);
        };
        let Some(formatted_address) = best.formatted_address else {
            return Ok(None);
        };
        debug!(query, place_id = %best.place_id, "places match");
        Ok(Some(PlaceMatch {
            postcode: extract_postcode(&formatted_address),
            place_id: best.place_id,
            formatted_address,
            lat: best.geometry.as_ref().map(|g| g.location.lat),
            lng: best.geometry.as_ref().map(|g| g.location.lng),
        }))
    }
}
