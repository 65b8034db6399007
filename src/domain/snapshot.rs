//! Immutable pipeline snapshots.
//!
//! Each stage consumes one `NewsSnapshot` and returns a new one with its own
//! field populated. Earlier fields are shared by reference (`Arc`), never
//! mutated in place.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// The five pipeline stages, in execution order
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Stage {
    SearchTermGeneration,
    WebSearch,
    Crawling,
    RelevanceIdentification,
    ImpactSummarization,
}

impl Stage {
    /// All stages in order; no skipping, no reordering
    pub const ALL: [Stage; 5] = [
        Stage::SearchTermGeneration,
        Stage::WebSearch,
        Stage::Crawling,
        Stage::RelevanceIdentification,
        Stage::ImpactSummarization,
    ];

    /// Human-readable stage name
    pub fn description(&self) -> &'static str {
        match self {
            Self::SearchTermGeneration => "The generation of the search terms",
            Self::WebSearch => "The web search",
            Self::Crawling => "The crawling",
            Self::RelevanceIdentification => "The identification of relevant articles",
            Self::ImpactSummarization => "The generation of the most impactful news",
        }
    }

    /// The stage that must run after this one
    pub fn next(&self) -> Option<Stage> {
        let idx = Self::ALL.iter().position(|s| s == self)?;
        Self::ALL.get(idx + 1).copied()
    }
}

/// Direction of a piece of news on the query
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ImpactType {
    Positive,
    Negative,
    Neutral,
}

impl ImpactType {
    /// Parse a model-provided label; only positive and negative are accepted
    pub fn parse_directional(label: &str) -> Option<Self> {
        match label.trim().to_lowercase().as_str() {
            "positive" => Some(Self::Positive),
            "negative" => Some(Self::Negative),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Positive => "positive",
            Self::Negative => "negative",
            Self::Neutral => "neutral",
        }
    }
}

/// An article judged relevant by one completion
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Article {
    pub article_number: String,
    pub article_url: String,
    pub impact_summary: String,
    pub impact_type: ImpactType,
}

/// One summarised piece of news (the terminal output item)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct News {
    pub news_summary: String,
    pub impact_description: String,
    pub impact_type: ImpactType,
    pub most_relevant_url: String,
}

/// A required snapshot field was absent or empty
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{stage:?} requires a non-empty '{field}'")]
pub struct SnapshotError {
    pub stage: Stage,
    pub field: &'static str,
}

/// Append-only pipeline state after some number of stages
#[derive(Debug, Clone, Serialize)]
pub struct NewsSnapshot {
    pub query: Arc<str>,
    pub query_meaning: Option<Arc<str>>,
    pub search_terms: Option<Arc<Vec<String>>>,
    pub retrieved_urls: Option<Arc<Vec<String>>>,
    pub parsed_urls: Option<Arc<BTreeMap<String, String>>>,
    pub relevant_articles: Option<Arc<Vec<Vec<Article>>>>,
    pub most_impactful_news: Option<Arc<Vec<News>>>,
}

impl NewsSnapshot {
    /// Initial snapshot holding only the query
    pub fn new(query: impl Into<Arc<str>>) -> Self {
        Self {
            query: query.into(),
            query_meaning: None,
            search_terms: None,
            retrieved_urls: None,
            parsed_urls: None,
            relevant_articles: None,
            most_impactful_news: None,
        }
    }

    /// Last stage whose output is present
    pub fn completed_stage(&self) -> Option<Stage> {
        if self.most_impactful_news.is_some() {
            Some(Stage::ImpactSummarization)
        } else if self.relevant_articles.is_some() {
            Some(Stage::RelevanceIdentification)
        } else if self.parsed_urls.is_some() {
            Some(Stage::Crawling)
        } else if self.retrieved_urls.is_some() {
            Some(Stage::WebSearch)
        } else if self.search_terms.is_some() {
            Some(Stage::SearchTermGeneration)
        } else {
            None
        }
    }

    pub fn with_search_terms(&self, query_meaning: String, search_terms: Vec<String>) -> Self {
        Self {
            query_meaning: Some(query_meaning.into()),
            search_terms: Some(Arc::new(search_terms)),
            ..self.clone()
        }
    }

    pub fn with_retrieved_urls(&self, retrieved_urls: Vec<String>) -> Self {
        Self {
            retrieved_urls: Some(Arc::new(retrieved_urls)),
            ..self.clone()
        }
    }

    pub fn with_parsed_urls(&self, parsed_urls: BTreeMap<String, String>) -> Self {
        Self {
            parsed_urls: Some(Arc::new(parsed_urls)),
            ..self.clone()
        }
    }

    pub fn with_relevant_articles(&self, relevant_articles: Vec<Vec<Article>>) -> Self {
        Self {
            relevant_articles: Some(Arc::new(relevant_articles)),
            ..self.clone()
        }
    }

    pub fn with_most_impactful_news(&self, news: Vec<News>) -> Self {
        Self {
            most_impactful_news: Some(Arc::new(news)),
            ..self.clone()
        }
    }

    /// The query meaning, falling back to the raw query
    pub fn subject(&self) -> &str {
        self.query_meaning.as_deref().unwrap_or(&self.query)
    }

    pub fn require_search_terms(&self) -> Result<&[String], SnapshotError> {
        non_empty(self.search_terms.as_deref(), Stage::WebSearch, "search_terms")
    }

    pub fn require_retrieved_urls(&self) -> Result<&[String], SnapshotError> {
        non_empty(self.retrieved_urls.as_deref(), Stage::Crawling, "retrieved_urls")
    }

    pub fn require_parsed_urls(&self) -> Result<&BTreeMap<String, String>, SnapshotError> {
        match self.parsed_urls.as_deref() {
            Some(parsed) if !parsed.is_empty() => Ok(parsed),
            _ => Err(SnapshotError {
                stage: Stage::RelevanceIdentification,
                field: "parsed_urls",
            }),
        }
    }

    pub fn require_relevant_articles(&self) -> Result<&[Vec<Article>], SnapshotError> {
        non_empty(
            self.relevant_articles.as_deref(),
            Stage::ImpactSummarization,
            "relevant_articles",
        )
    }

    /// Terminal output: the ordered news list (empty before the last stage)
    pub fn news_items(&self) -> &[News] {
        self.most_impactful_news.as_deref().map(Vec::as_slice).unwrap_or(&[])
    }

    /// Per-field counts of this snapshot
    pub fn stats(&self) -> SnapshotStats {
        SnapshotStats {
            search_terms: self.search_terms.as_ref().map_or(0, |t| t.len()),
            retrieved_urls: self.retrieved_urls.as_ref().map_or(0, |u| u.len()),
            parsed_urls: self.parsed_urls.as_ref().map_or(0, |p| p.len()),
            relevant_articles: self
                .relevant_articles
                .as_ref()
                .map(|lists| lists.iter().map(Vec::len).collect())
                .unwrap_or_default(),
            news_characters: self
                .news_items()
                .iter()
                .map(|n| n.news_summary.chars().count())
                .sum(),
        }
    }
}

fn non_empty<'a, T>(
    field: Option<&'a Vec<T>>,
    stage: Stage,
    name: &'static str,
) -> Result<&'a [T], SnapshotError> {
    match field {
        Some(values) if !values.is_empty() => Ok(values),
        _ => Err(SnapshotError { stage, field: name }),
    }
}

/// Counts reported at the end of a run
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotStats {
    pub search_terms: usize,
    pub retrieved_urls: usize,
    pub parsed_urls: usize,
    /// Number of relevant articles per completion
    pub relevant_articles: Vec<usize>,
    pub news_characters: usize,
}
