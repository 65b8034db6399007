//! Page fetching with an optional crawl-proxy fallback.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use tracing::debug;

use super::{PageFetcher, ProviderSettings};
use crate::domain::{CallError, RemoteResponse};

/// Crawl proxy endpoint plus its access token
#[derive(Debug, Clone)]
struct CrawlProxy {
    endpoint: String,
    token: String,
}

/// Plain HTTP GET page fetcher
pub struct HttpFetcher {
    client: Client,
    proxy: Option<CrawlProxy>,
}

impl HttpFetcher {
    /// Build a fetcher; the proxy is used only if its endpoint and token are set
    pub fn new(settings: &ProviderSettings, timeout: Duration) -> Result<Self> {
        let client = Client::builder()
            .user_agent(settings.user_agent.as_str())
            .redirect(reqwest::redirect::Policy::limited(5))
            .timeout(timeout)
            .build()
            .context("failed to build fetch HTTP client")?;

        let proxy = settings.crawl_proxy_endpoint.as_ref().and_then(|endpoint| {
            std::env::var(&settings.crawl_proxy_token_env)
                .ok()
                .filter(|token| !token.trim().is_empty())
                .map(|token| CrawlProxy {
                    endpoint: endpoint.clone(),
                    token,
                })
        });

        Ok(Self { client, proxy })
    }

    pub fn has_proxy(&self) -> bool {
        self.proxy.is_some()
    }

    async fn get(&self, request: reqwest::RequestBuilder) -> Result<RemoteResponse<String>, CallError> {
        let response = request
            .send()
            .await
            .map_err(|err| CallError::Transport(err.to_string()))?;
        let status = response.status().as_u16();
        if !response.status().is_success() {
            return Ok(RemoteResponse::status(status));
        }
        let body = response
            .text()
            .await
            .map_err(|err| CallError::Transport(err.to_string()))?;
        Ok(RemoteResponse {
            status_code: status,
            value: Some(body),
        })
    }
}

#[async_trait]
impl PageFetcher for HttpFetcher {
    fn name(&self) -> &str {
        "http"
    }

    async fn fetch(&self, url: &str) -> Result<RemoteResponse<String>, CallError> {
        let direct = self.get(self.client.get(url)).await;
        let proxy = match &self.proxy {
            Some(proxy) => proxy,
            None => return direct,
        };

        let use_proxy = match &direct {
            Ok(response) if response.is_success() => false,
            Ok(response) => {
                debug!(url, status = response.status_code, "Direct fetch failed, using crawl proxy");
                true
            }
            Err(err) => {
                debug!(url, error = %err, "Direct fetch failed, using crawl proxy");
                true
            }
        };
        if !use_proxy {
            return direct;
        }

        self.get(
            self.client
                .get(&proxy.endpoint)
                .query(&[("token", proxy.token.as_str()), ("url", url)]),
        )
        .await
    }
}
