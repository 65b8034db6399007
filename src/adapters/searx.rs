//! SearxNG news search over its JSON API.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use tracing::{debug, warn};

use super::{status_of, ProviderSettings, SearchProvider};
use crate::domain::{CallError, RemoteResponse};

/// Search provider backed by a SearxNG instance
pub struct SearxSearch {
    client: Client,
    endpoint: String,
    max_results: usize,
}

#[derive(Debug, Deserialize)]
struct SearxResponse {
    #[serde(default)]
    results: Vec<SearxResult>,
}

#[derive(Debug, Deserialize)]
struct SearxResult {
    url: String,
}

impl SearxSearch {
    pub fn new(settings: &ProviderSettings) -> Result<Self> {
        let client = Client::builder()
            .user_agent(settings.user_agent.as_str())
            .build()
            .context("failed to build search HTTP client")?;
        Ok(Self {
            client,
            endpoint: settings.search_endpoint.clone(),
            max_results: settings.search_max_results,
        })
    }
}

#[async_trait]
impl SearchProvider for SearxSearch {
    fn name(&self) -> &str {
        "searx"
    }

    async fn search(&self, term: &str) -> Result<RemoteResponse<Vec<String>>, CallError> {
        debug!(term, "Searching the web");
        let response = match self
            .client
            .get(&self.endpoint)
            .query(&[
                ("q", term),
                ("format", "json"),
                ("categories", "news"),
                ("time_range", "day"),
            ])
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) => {
                warn!(term, error = %err, "Search request failed");
                return Ok(RemoteResponse::status(status_of(&err)));
            }
        };

        let status = response.status();
        if !status.is_success() {
            return Ok(RemoteResponse::status(status.as_u16()));
        }

        match response.json::<SearxResponse>().await {
            Ok(body) => Ok(RemoteResponse::ok(
                body.results
                    .into_iter()
                    .map(|result| result.url)
                    .take(self.max_results)
                    .collect(),
            )),
            Err(err) => {
                warn!(term, error = %err, "Search response did not decode");
                Ok(RemoteResponse::status(status_of(&err)))
            }
        }
    }
}
