//! Gemini `generateContent` client returning parsed JSON replies.

use anyhow::{Context, Result};
use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use super::{status_of, LanguageModel, ProviderSettings};
use crate::domain::{CallError, RemoteResponse};

/// Language model backed by the Gemini REST API
pub struct GeminiClient {
    client: Client,
    endpoint: String,
    model: String,
    api_key: String,
}

#[derive(Serialize)]
struct GenerateRequest<'a> {
    contents: [Content<'a>; 1],
}

#[derive(Serialize)]
struct Content<'a> {
    parts: [Part<'a>; 1],
}

#[derive(Serialize)]
struct Part<'a> {
    text: &'a str,
}

#[derive(Debug, Deserialize)]
struct GenerateResponse {
    #[serde(default)]
    candidates: Vec<Candidate>,
}

#[derive(Debug, Deserialize)]
struct Candidate {
    content: CandidateContent,
}

#[derive(Debug, Deserialize)]
struct CandidateContent {
    #[serde(default)]
    parts: Vec<CandidatePart>,
}

#[derive(Debug, Deserialize)]
struct CandidatePart {
    #[serde(default)]
    text: String,
}

impl GenerateResponse {
    fn first_text(self) -> Option<String> {
        self.candidates
            .into_iter()
            .next()
            .and_then(|candidate| candidate.content.parts.into_iter().next())
            .map(|part| part.text)
    }
}

impl GeminiClient {
    pub fn new(
        endpoint: impl Into<String>,
        model: impl Into<String>,
        api_key: impl Into<String>,
        user_agent: &str,
    ) -> Result<Self> {
        let api_key = api_key.into();
        anyhow::ensure!(!api_key.trim().is_empty(), "missing Gemini API key");
        let client = Client::builder()
            .user_agent(user_agent)
            .build()
            .context("failed to build Gemini HTTP client")?;
        Ok(Self {
            client,
            endpoint: endpoint.into().trim_end_matches('/').to_string(),
            model: model.into(),
            api_key,
        })
    }

    /// Build from settings, reading the API key from the configured variable
    pub fn from_settings(settings: &ProviderSettings) -> Result<Self> {
        let api_key = std::env::var(&settings.llm_api_key_env)
            .with_context(|| format!("{} is not set", settings.llm_api_key_env))?;
        Self::new(
            settings.llm_endpoint.as_str(),
            settings.llm_model.as_str(),
            api_key,
            &settings.user_agent,
        )
    }

    fn url(&self) -> String {
        format!("{}/models/{}:generateContent", self.endpoint, self.model)
    }
}

#[async_trait]
impl LanguageModel for GeminiClient {
    fn name(&self) -> &str {
        "gemini"
    }

    async fn complete(&self, prompt: &str) -> Result<RemoteResponse<Value>, CallError> {
        let request = GenerateRequest {
            contents: [Content {
                parts: [Part { text: prompt }],
            }],
        };

        let response = match self
            .client
            .post(self.url())
            .query(&[("key", self.api_key.as_str())])
            .json(&request)
            .send()
            .await
        {
            Ok(response) => response,
            Err(err) => {
                warn!(model = %self.model, error = %err, "Language model request failed");
                return Ok(RemoteResponse::status(status_of(&err)));
            }
        };

        let status = response.status();
        if !status.is_success() {
            return Ok(RemoteResponse::status(status.as_u16()));
        }

        let text = match response.json::<GenerateResponse>().await {
            Ok(body) => body.first_text().unwrap_or_default(),
            Err(err) => return Ok(RemoteResponse::status(status_of(&err))),
        };

        match serde_json::from_str::<Value>(&clean_json_text(&text)) {
            Ok(value) => Ok(RemoteResponse::ok(value)),
            Err(err) => {
                // Re-ask: a malformed reply is usually fixed by another sample.
                warn!(model = %self.model, error = %err, chars = text.len(), "Reply is not valid JSON");
                debug!(reply = %text, "Unparseable reply");
                Ok(RemoteResponse::status(500))
            }
        }
    }
}

/// Strip markdown fences and typographic quotes from a model reply
pub fn clean_json_text(text: &str) -> String {
    let mut text = text.trim();
    if let Some(rest) = text.strip_prefix("```json") {
        text = rest;
    } else if let Some(rest) = text.strip_prefix("```") {
        text = rest;
    }
    if let Some(rest) = text.strip_suffix("```") {
        text = rest;
    }

    text.trim()
        .chars()
        .filter(|c| *c != '`')
        .map(|c| match c {
            '\u{2018}' | '\u{2019}' | '\u{201a}' | '\u{201b}' | '\u{2032}' | '\u{2035}'
            | '\u{2039}' | '\u{203a}' => '\'',
            '\u{201c}' | '\u{201d}' | '\u{201e}' | '\u{201f}' | '\u{2033}' | '\u{2036}'
            | '\u{275b}' | '\u{275c}' | '\u{275d}' | '\u{275e}' => '"',
            other => other,
        })
        .collect()
}
