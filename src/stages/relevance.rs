//! Relevance identification: several independent completions pick the
//! articles that matter for the query.

use std::collections::BTreeMap;

use serde_json::Value;
use tracing::{debug, info, warn};

use super::{digits_only, reply_items, PipelineError, StageContext, StageTimer};
use crate::core::fanout::CallOutcome;
use crate::domain::{Article, ImpactType, NewsSnapshot, RemoteCall, Stage};

const STAGE: Stage = Stage::RelevanceIdentification;

const PROMPT_HEADER: &str = r#"Below are numbered ARTICLES, each with its URL and TEXT. Find the most important
news they contain about the SUBJECT and how each piece of news affects the SUBJECT's
outlook (its price, if the SUBJECT is a financial instrument).

Return at most 10 items, ordered from the largest impact to the smallest. Each item
names the ARTICLE that best supports it.

SUBJECT: {subject}

"#;

const PROMPT_FORMAT: &str = r#"
Reply with a single JSON object and nothing else, in English, using exactly these keys:
{
  "items": [
    {
      "article_number": "the ARTICLE number, digits only",
      "article_url": "the ARTICLE URL",
      "impact_on_term_of_interest": "how the news affects the SUBJECT",
      "impact_type": "positive, negative or neutral"
    }
  ]
}
"#;

/// One prompt listing every parsed article, sorted by URL
pub fn build_prompt(subject: &str, parsed_urls: &BTreeMap<String, String>) -> String {
    let mut prompt = PROMPT_HEADER.replace("{subject}", subject);
    for (number, (url, text)) in parsed_urls.iter().enumerate() {
        prompt.push_str(&format!(
            "ARTICLE {}:\nURL: {}\nTEXT: {}\n\n",
            number + 1,
            url,
            text
        ));
    }
    prompt.push_str(PROMPT_FORMAT);
    prompt
}

/// Directional articles of one completion; neutral or unlabeled items are dropped
pub fn parse_articles(reply: &Value) -> Vec<Article> {
    reply_items(reply)
        .iter()
        .filter_map(|item| {
            let impact_type = item
                .get("impact_type")
                .and_then(Value::as_str)
                .and_then(ImpactType::parse_directional)?;
            Some(Article {
                article_number: digits_only(item.get("article_number").unwrap_or(&Value::Null)),
                article_url: str_field(item, "article_url"),
                impact_summary: str_field(item, "impact_on_term_of_interest"),
                impact_type,
            })
        })
        .collect()
}

fn str_field(item: &Value, key: &str) -> String {
    item.get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

/// Populate `relevant_articles`, one list per completion that finished
///
/// A failed completion contributes an empty list; a completion cut off by
/// the deadline contributes nothing. Lists are ordered by completion index.
pub async fn identify_relevant_articles(
    snapshot: &NewsSnapshot,
    ctx: &StageContext,
) -> Result<NewsSnapshot, PipelineError> {
    let parsed_urls = snapshot.require_parsed_urls()?;
    let query = snapshot.query.as_ref();
    let timer = StageTimer::start(STAGE, query, &ctx.sink);

    let prompt = build_prompt(snapshot.subject(), parsed_urls);
    info!(chars = prompt.len(), "Relevance prompt built");

    let calls = (1..=ctx.settings.pipeline.completions)
        .map(|completion| RemoteCall::Complete {
            prompt: prompt.clone(),
            cache_prefix: Some(format!("{}|relevant articles {}", query, completion)),
        })
        .collect();
    let batch = ctx
        .fan_out(calls, ctx.settings.timeouts.relevance())
        .await;

    let mut by_completion: BTreeMap<usize, Vec<Article>> = BTreeMap::new();
    for entry in batch.entries() {
        let completion = entry.index + 1;
        match &entry.outcome {
            CallOutcome::Completed(output) => {
                let articles = match output.clone().into_completion() {
                    Ok(reply) => parse_articles(&reply),
                    Err(err) => {
                        warn!(completion, error = %err, "Unexpected completion output");
                        Vec::new()
                    }
                };
                if articles.is_empty() {
                    debug!(completion, "Completion returned no directional items");
                }
                by_completion.insert(entry.index, articles);
            }
            CallOutcome::Failed(err) => {
                warn!(completion, error = %err, "Completion failed");
                by_completion.insert(entry.index, Vec::new());
            }
            CallOutcome::TimedOut => warn!(completion, "Completion timed out"),
        }
    }

    let relevant_articles: Vec<Vec<Article>> = by_completion.into_values().collect();
    let counts: Vec<usize> = relevant_articles.iter().map(Vec::len).collect();
    let message = format!(
        "The counts of relevant articles identified for {} are: {:?}",
        query, counts
    );
    info!("{}", message);
    ctx.sink.progress(message);

    timer.finish();
    Ok(snapshot.with_relevant_articles(relevant_articles))
}
