//! Adapter interfaces for external systems.
//!
//! Adapters are the remote collaborators the pipeline fans out to: a web
//! search API, a page fetcher and a language model. Each returns a
//! `RemoteResponse` carrying an HTTP-like status so that the retry policy can
//! classify failures uniformly.

pub mod gemini;
pub mod html;
pub mod http;
pub mod searx;

use std::sync::Arc;
use std::time::Duration;

use anyhow::Result;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::domain::{CallError, RemoteResponse};

pub use gemini::GeminiClient;
pub use html::extract_paragraphs;
pub use http::HttpFetcher;
pub use searx::SearxSearch;

/// Web search returning result URLs
#[async_trait]
pub trait SearchProvider: Send + Sync {
    /// Human-readable provider name
    fn name(&self) -> &str;

    /// Search recent news for one term
    async fn search(&self, term: &str) -> Result<RemoteResponse<Vec<String>>, CallError>;
}

/// Fetches raw page bodies
#[async_trait]
pub trait PageFetcher: Send + Sync {
    fn name(&self) -> &str;

    /// Fetch the HTML body of `url`
    async fn fetch(&self, url: &str) -> Result<RemoteResponse<String>, CallError>;
}

/// Language model answering prompts with JSON
#[async_trait]
pub trait LanguageModel: Send + Sync {
    fn name(&self) -> &str;

    /// Send one prompt; a reply that is not valid JSON is a failed attempt
    async fn complete(&self, prompt: &str) -> Result<RemoteResponse<Value>, CallError>;
}

/// Provider settings (from the `providers` config section)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderSettings {
    /// SearxNG-compatible search endpoint
    #[serde(default = "default_search_endpoint")]
    pub search_endpoint: String,

    /// Result URLs kept per search term
    #[serde(default = "default_search_max_results")]
    pub search_max_results: usize,

    #[serde(default = "default_llm_endpoint")]
    pub llm_endpoint: String,

    #[serde(default = "default_llm_model")]
    pub llm_model: String,

    /// Environment variable holding the language model API key
    #[serde(default = "default_llm_api_key_env")]
    pub llm_api_key_env: String,

    /// Optional crawl proxy used when a direct fetch fails
    #[serde(default)]
    pub crawl_proxy_endpoint: Option<String>,

    #[serde(default = "default_crawl_proxy_token_env")]
    pub crawl_proxy_token_env: String,

    #[serde(default = "default_user_agent")]
    pub user_agent: String,
}

fn default_search_endpoint() -> String {
    "http://localhost:8888/search".to_string()
}
fn default_search_max_results() -> usize {
    10
}
fn default_llm_endpoint() -> String {
    "https://generativelanguage.googleapis.com/v1beta".to_string()
}
fn default_llm_model() -> String {
    "gemini-2.0-flash".to_string()
}
fn default_llm_api_key_env() -> String {
    "GEMINI_API_KEY".to_string()
}
fn default_crawl_proxy_token_env() -> String {
    "CRAWL_PROXY_TOKEN".to_string()
}
fn default_user_agent() -> String {
    concat!("newsfan/", env!("CARGO_PKG_VERSION")).to_string()
}

impl Default for ProviderSettings {
    fn default() -> Self {
        Self {
            search_endpoint: default_search_endpoint(),
            search_max_results: default_search_max_results(),
            llm_endpoint: default_llm_endpoint(),
            llm_model: default_llm_model(),
            llm_api_key_env: default_llm_api_key_env(),
            crawl_proxy_endpoint: None,
            crawl_proxy_token_env: default_crawl_proxy_token_env(),
            user_agent: default_user_agent(),
        }
    }
}

/// The three providers a call context needs
#[derive(Clone)]
pub struct Providers {
    pub search: Arc<dyn SearchProvider>,
    pub fetcher: Arc<dyn PageFetcher>,
    pub llm: Arc<dyn LanguageModel>,
}

/// Build the HTTP-backed providers from settings
pub fn build_providers(settings: &ProviderSettings, fetch_timeout: Duration) -> Result<Providers> {
    Ok(Providers {
        search: Arc::new(SearxSearch::new(settings)?),
        fetcher: Arc::new(HttpFetcher::new(settings, fetch_timeout)?),
        llm: Arc::new(GeminiClient::from_settings(settings)?),
    })
}

/// Map a transport error to the status the retry policy sees
///
/// Errors without an HTTP status (connection refused, reset, body decode)
/// are reported as 500 so they are retried like a server error.
pub(crate) fn status_of(err: &reqwest::Error) -> u16 {
    err.status().map(|status| status.as_u16()).unwrap_or(500)
}
