//! Search-term generation: one completion expands the query into terms.

use std::collections::BTreeSet;

use serde::Deserialize;
use tracing::info;

use super::{PipelineError, StageContext, StageTimer};
use crate::domain::{CallError, NewsSnapshot, RemoteCall, Stage};

const STAGE: Stage = Stage::SearchTermGeneration;

const PROMPT_TEMPLATE: &str = r#"You help an analyst collect today's news about a SUBJECT.

1. If the SUBJECT is a ticker or symbol of a financial instrument (a stock, bond,
   fund, currency or currency pair), give its full name in a few words.
2. Write {per_step} web search queries for recent financial news about the SUBJECT.
3. If the SUBJECT is a fund that tracks an index, name the index.
4. Write {per_step} web search queries for recent news about that index (none if there is no index).
5. Name the country or region most relevant to the SUBJECT ("global" is allowed).
6. Write {per_step} web search queries for recent economic news about that country or region.
7. Name the industries or sectors most relevant to the SUBJECT.
8. Write {per_step} web search queries for recent news about those industries or sectors.
   Leave this list empty when the SUBJECT spans all industries.
9. Name closely related subjects, such as competitors or funds with the same benchmark.
10. Write {per_step} web search queries for recent news about those related subjects.

Write "latest" instead of any year in the queries. If the SUBJECT has nothing to do
with finance or economics, return empty lists.

SUBJECT: {query}

Reply with a single JSON object and nothing else, using exactly these keys:
{
    "query_meaning": string,
    "list_search_terms": [string],
    "tracked_index": string,
    "list_search_terms_tracked_index": [string],
    "country_or_region": string,
    "list_search_terms_country_or_region": [string],
    "industries_and_sectors": string,
    "list_search_terms_industries_and_sectors": [string],
    "related_terms": string,
    "list_search_terms_related_terms": [string]
}
"#;

#[derive(Debug, Deserialize)]
struct SearchTermReply {
    query_meaning: String,
    #[serde(default)]
    list_search_terms: Vec<String>,
    #[serde(default)]
    list_search_terms_tracked_index: Vec<String>,
    #[serde(default)]
    list_search_terms_country_or_region: Vec<String>,
    #[serde(default)]
    list_search_terms_industries_and_sectors: Vec<String>,
    #[serde(default)]
    list_search_terms_related_terms: Vec<String>,
}

impl SearchTermReply {
    /// Sorted, deduplicated union of every list plus the query itself
    fn aggregate(self, query: &str) -> Vec<String> {
        let mut terms: BTreeSet<String> = [
            self.list_search_terms,
            self.list_search_terms_tracked_index,
            self.list_search_terms_country_or_region,
            self.list_search_terms_industries_and_sectors,
            self.list_search_terms_related_terms,
        ]
        .into_iter()
        .flatten()
        .map(|term| term.trim().to_string())
        .filter(|term| !term.is_empty())
        .collect();
        terms.insert(query.to_string());
        terms.into_iter().collect()
    }
}

pub fn build_prompt(query: &str, per_step: usize) -> String {
    PROMPT_TEMPLATE
        .replace("{per_step}", &per_step.to_string())
        .replace("{query}", query)
}

/// Populate `query_meaning` and `search_terms`
pub async fn generate_search_terms(
    snapshot: &NewsSnapshot,
    ctx: &StageContext,
) -> Result<NewsSnapshot, PipelineError> {
    let query = snapshot.query.as_ref();
    let timer = StageTimer::start(STAGE, query, &ctx.sink);

    let call = RemoteCall::Complete {
        prompt: build_prompt(query, ctx.settings.pipeline.search_terms_per_step),
        cache_prefix: Some(format!("{}|search terms", query)),
    };
    let reply = ctx
        .call_one(STAGE, call)
        .await?
        .into_completion()
        .and_then(|value| {
            serde_json::from_value::<SearchTermReply>(value)
                .map_err(|err| CallError::Decode(err.to_string()))
        })
        .map_err(|source| PipelineError::Remote {
            stage: STAGE,
            source,
        })?;

    let query_meaning = reply.query_meaning.trim().to_string();
    let message = format!("The meaning of the query is: {}", query_meaning);
    info!("{}", message);
    ctx.sink.progress(message);

    let search_terms = reply.aggregate(query);
    let message = format!("Generated {} search terms", search_terms.len());
    info!("{}", message);
    ctx.sink.progress(message);

    timer.finish();
    Ok(snapshot.with_search_terms(query_meaning, search_terms))
}
