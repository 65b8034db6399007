//! Impact summarization: merge the relevant articles into the final news list.

use std::collections::BTreeMap;

use serde_json::Value;
use tracing::{debug, info};

use super::{reply_items, PipelineError, StageContext, StageTimer};
use crate::domain::{Article, CallError, ImpactType, News, NewsSnapshot, RemoteCall, Stage};

const STAGE: Stage = Stage::ImpactSummarization;

const PROMPT_HEADER: &str = r#"Below are ARTICLES about a SUBJECT, each with a claimed impact on the SUBJECT.
For every ARTICLE, check that the ARTICLE TEXT supports the claimed impact and whether
that impact is positive or negative. Ignore ARTICLES whose impact is neutral or unsupported.

Then merge what remains into at most 5 distinct pieces of news, from the largest impact
to the smallest. News about the same topic (for example two articles on central bank
policy) must be merged into one. Give fewer than 5 if there are fewer distinct topics,
and an empty list if nothing affects the SUBJECT. For each piece of news, give the most
relevant URL and explain its impact on the SUBJECT.

SUBJECT: {subject}
"#;

const PROMPT_FORMAT: &str = r#"
Reply with a single JSON object and nothing else, in English, using exactly these keys:
{
  "items": [
    {
      "news": "the news",
      "most_relevant_url": "a URL from the ARTICLES",
      "impact_of_news_on_term_of_interest": "how the news affects the SUBJECT",
      "impact_type_of_news": "positive or negative"
    }
  ]
}
"#;

/// Lists ordered by their serialized form, so the prompt is stable across runs
fn ordered_lists(lists: &[Vec<Article>]) -> Vec<&Vec<Article>> {
    let mut keyed: Vec<(String, &Vec<Article>)> = lists
        .iter()
        .map(|list| (serde_json::to_string(list).unwrap_or_default(), list))
        .collect();
    keyed.sort_by(|a, b| a.0.cmp(&b.0));
    keyed.into_iter().map(|(_, list)| list).collect()
}

pub fn build_prompt(
    subject: &str,
    relevant_articles: &[Vec<Article>],
    parsed_urls: &BTreeMap<String, String>,
) -> String {
    let mut lines = vec![PROMPT_HEADER.replace("{subject}", subject)];
    for list in ordered_lists(relevant_articles) {
        for article in list {
            let text = parsed_urls
                .get(&article.article_url)
                .map(String::as_str)
                .unwrap_or_default();
            lines.push(format!("ARTICLE {}", article.article_number));
            lines.push(format!("ARTICLE URL: {}", article.article_url));
            lines.push(format!("ARTICLE TEXT: {}", text));
            lines.push(format!("CLAIMED IMPACT: {}", article.impact_summary));
            lines.push(format!("CLAIMED IMPACT TYPE: {}\n", article.impact_type.as_str()));
        }
    }
    lines.push(PROMPT_FORMAT.to_string());
    lines.join("\n")
}

/// News items of the reply; items missing a field or with a non-directional
/// impact type are skipped
pub fn parse_news(reply: &Value) -> Vec<News> {
    reply_items(reply)
        .iter()
        .enumerate()
        .filter_map(|(idx, item)| {
            let field = |key: &str| item.get(key).and_then(Value::as_str).map(str::to_string);
            let parsed = (|| {
                Some(News {
                    news_summary: field("news")?,
                    most_relevant_url: field("most_relevant_url")?,
                    impact_description: field("impact_of_news_on_term_of_interest")?,
                    impact_type: ImpactType::parse_directional(&field("impact_type_of_news")?)?,
                })
            })();
            if parsed.is_none() {
                debug!(item = idx + 1, "Skipping incomplete news item");
            }
            parsed
        })
        .collect()
}

/// Populate `most_impactful_news`
pub async fn generate_most_impactful_news(
    snapshot: &NewsSnapshot,
    ctx: &StageContext,
) -> Result<NewsSnapshot, PipelineError> {
    let relevant_articles = snapshot.require_relevant_articles()?;
    let query = snapshot.query.as_ref();
    let timer = StageTimer::start(STAGE, query, &ctx.sink);

    let empty = BTreeMap::new();
    let parsed_urls = snapshot.parsed_urls.as_deref().unwrap_or(&empty);
    let prompt = build_prompt(snapshot.subject(), relevant_articles, parsed_urls);
    info!(chars = prompt.len(), "Impact prompt built");

    let call = RemoteCall::Complete {
        prompt,
        cache_prefix: Some(format!("{}|most impactful news", query)),
    };
    let reply = ctx
        .call_one(STAGE, call)
        .await?
        .into_completion()
        .map_err(|source: CallError| PipelineError::Remote {
            stage: STAGE,
            source,
        })?;

    let news = parse_news(&reply);
    let message = format!("Generated {} most impactful news for {}", news.len(), query);
    info!("{}", message);
    ctx.sink.progress(message);

    timer.finish();
    Ok(snapshot.with_most_impactful_news(news))
}
