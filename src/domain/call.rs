//! Remote call descriptors and their outcomes.
//!
//! A `RemoteCall` is the unit of work the fan-out executor distributes. It is
//! serialisable so that it can be handed to a worker process, and it knows
//! its own cache key and rate-limit lane.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use thiserror::Error;

/// A single remote call: which function to invoke and with which argument
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum RemoteCall {
    /// Web search for one search term
    Search { term: String },

    /// Fetch and extract the text of one page
    Crawl { url: String },

    /// One language-model completion
    Complete {
        prompt: String,
        /// Disambiguates identical prompts issued for different purposes
        #[serde(default, skip_serializing_if = "Option::is_none")]
        cache_prefix: Option<String>,
    },
}

impl RemoteCall {
    /// Short name of the call kind (used in cache keys and logs)
    pub fn kind(&self) -> &'static str {
        match self {
            Self::Search { .. } => "search",
            Self::Crawl { .. } => "crawl",
            Self::Complete { .. } => "llm",
        }
    }

    /// Rate-limit lane this call draws from, if any
    pub fn lane(&self) -> Option<Lane> {
        match self {
            Self::Search { .. } => Some(Lane::Search),
            Self::Crawl { .. } => None,
            Self::Complete { .. } => Some(Lane::Llm),
        }
    }

    /// Human-readable label for logs (never the full prompt)
    pub fn label(&self) -> String {
        match self {
            Self::Search { term } => format!("search '{}'", term),
            Self::Crawl { url } => format!("crawl {}", url),
            Self::Complete { cache_prefix, prompt } => match cache_prefix {
                Some(prefix) => format!("llm [{}]", prefix),
                None => format!("llm ({} chars)", prompt.len()),
            },
        }
    }

    /// Output standing in for a recorded "no result"
    pub fn empty_output(&self) -> CallOutput {
        match self {
            Self::Search { .. } => CallOutput::Urls(Vec::new()),
            Self::Crawl { .. } => CallOutput::Page(String::new()),
            Self::Complete { .. } => CallOutput::Completion(serde_json::Value::Null),
        }
    }

    /// Deterministic cache key: `<kind>:<prefix>:<sha256 of the argument>`
    pub fn cache_key(&self) -> String {
        let (prefix, argument) = match self {
            Self::Search { term } => ("", term.as_str()),
            Self::Crawl { url } => ("", url.as_str()),
            Self::Complete {
                prompt,
                cache_prefix,
            } => (cache_prefix.as_deref().unwrap_or(""), prompt.as_str()),
        };
        format!("{}:{}:{}", self.kind(), prefix, hash_argument(argument))
    }
}

/// Full SHA256 hex digest of a call argument
pub fn hash_argument(argument: &str) -> String {
    hex::encode(Sha256::digest(argument.as_bytes()))
}

/// Rate-limit lanes shared by all workers
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Lane {
    /// Search API requests
    Search,

    /// Language-model requests
    Llm,
}

impl std::fmt::Display for Lane {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Search => write!(f, "search"),
            Self::Llm => write!(f, "llm"),
        }
    }
}

/// Successful output of a remote call
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum CallOutput {
    /// URLs returned by a search
    Urls(Vec<String>),

    /// Extracted page text (empty when the page produced nothing usable)
    Page(String),

    /// Parsed JSON completion
    Completion(serde_json::Value),
}

impl CallOutput {
    pub fn into_urls(self) -> Result<Vec<String>, CallError> {
        match self {
            Self::Urls(urls) => Ok(urls),
            other => Err(CallError::Decode(format!("expected urls, got {}", other.kind_name()))),
        }
    }

    pub fn into_page(self) -> Result<String, CallError> {
        match self {
            Self::Page(text) => Ok(text),
            other => Err(CallError::Decode(format!("expected page, got {}", other.kind_name()))),
        }
    }

    pub fn into_completion(self) -> Result<serde_json::Value, CallError> {
        match self {
            Self::Completion(value) => Ok(value),
            other => Err(CallError::Decode(format!(
                "expected completion, got {}",
                other.kind_name()
            ))),
        }
    }

    fn kind_name(&self) -> &'static str {
        match self {
            Self::Urls(_) => "urls",
            Self::Page(_) => "page",
            Self::Completion(_) => "completion",
        }
    }
}

/// Raw reply of a provider: an HTTP-like status plus an optional value
#[derive(Debug, Clone, PartialEq)]
pub struct RemoteResponse<T> {
    pub status_code: u16,
    pub value: Option<T>,
}

impl<T> RemoteResponse<T> {
    /// A 200 reply carrying a value
    pub fn ok(value: T) -> Self {
        Self {
            status_code: 200,
            value: Some(value),
        }
    }

    /// A reply with only a status code
    pub fn status(status_code: u16) -> Self {
        Self {
            status_code,
            value: None,
        }
    }

    /// Whether the status is 2xx
    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }

    /// Value of a successful reply, or the status as an error
    pub fn into_result(self) -> Result<T, CallError> {
        match self.value {
            Some(value) if self.is_success() => Ok(value),
            _ => Err(CallError::Status {
                code: self.status_code,
            }),
        }
    }
}

/// Errors of a single remote call
#[derive(Debug, Clone, Error, PartialEq)]
pub enum CallError {
    #[error("remote call returned status {code}")]
    Status { code: u16 },

    #[error("gave up after {attempts} attempts, last status {status}")]
    RetriesExhausted { attempts: u32, status: u16 },

    #[error("cache error: {0}")]
    Cache(String),

    #[error("transport error: {0}")]
    Transport(String),

    #[error("worker process error: {0}")]
    Worker(String),

    #[error("worker reported: {0}")]
    Remote(String),

    #[error("unexpected output: {0}")]
    Decode(String),
}
