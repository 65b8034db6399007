//! Web search: fan out one search per term and aggregate the URLs.

use std::collections::{BTreeMap, BTreeSet};

use tracing::{info, warn};

use super::{PipelineError, StageContext, StageTimer};
use crate::core::fanout::CallOutcome;
use crate::domain::{NewsSnapshot, RemoteCall, Stage};

const STAGE: Stage = Stage::WebSearch;

/// Populate `retrieved_urls`
///
/// Terms whose search did not complete count as returning no URLs and get a
/// "no result" cache entry so a later run does not repeat them.
pub async fn perform_web_search(
    snapshot: &NewsSnapshot,
    ctx: &StageContext,
) -> Result<NewsSnapshot, PipelineError> {
    let terms = snapshot.require_search_terms()?;
    let timer = StageTimer::start(STAGE, &snapshot.query, &ctx.sink);

    let calls = terms
        .iter()
        .map(|term| RemoteCall::Search { term: term.clone() })
        .collect();
    let batch = ctx
        .fan_out(calls, ctx.settings.timeouts.web_search())
        .await;
    ctx.record_unfinished(&batch).await?;

    let mut per_term: BTreeMap<&str, Vec<String>> = terms
        .iter()
        .map(|term| (term.as_str(), Vec::new()))
        .collect();
    for entry in batch.entries() {
        let term = match &entry.arg {
            RemoteCall::Search { term } => term.as_str(),
            _ => continue,
        };
        match &entry.outcome {
            CallOutcome::Completed(output) => match output.clone().into_urls() {
                Ok(urls) => {
                    per_term.insert(term, urls);
                }
                Err(err) => warn!(term, error = %err, "Unexpected search output"),
            },
            CallOutcome::Failed(err) => warn!(term, error = %err, "Search failed"),
            CallOutcome::TimedOut => warn!(term, "Search timed out"),
        }
    }

    let counts: Vec<usize> = per_term.values().map(Vec::len).collect();
    info!(?counts, "Search results per term");

    let retrieved_urls: Vec<String> = per_term
        .into_values()
        .flatten()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();

    let message = format!("Found {} search results", retrieved_urls.len());
    info!("{}", message);
    ctx.sink.progress(message);

    timer.finish();
    Ok(snapshot.with_retrieved_urls(retrieved_urls))
}
