//! Crawling: fetch every retrieved URL under the crawl deadline.

use std::collections::BTreeMap;

use glob::Pattern;
use reqwest::Url;
use tracing::{debug, info, warn};

use super::{PipelineError, StageContext, StageTimer};
use crate::domain::{NewsSnapshot, RemoteCall, Stage};

const STAGE: Stage = Stage::Crawling;

/// Compiled host denylist
pub struct HostFilter {
    patterns: Vec<Pattern>,
}

impl HostFilter {
    pub fn new(globs: &[String]) -> Self {
        let patterns = globs
            .iter()
            .filter_map(|glob| match Pattern::new(glob) {
                Ok(pattern) => Some(pattern),
                Err(err) => {
                    warn!(glob = %glob, error = %err, "Ignoring invalid excluded host pattern");
                    None
                }
            })
            .collect();
        Self { patterns }
    }

    /// Whether the URL's host matches an excluded pattern
    ///
    /// URLs without a parseable host are never excluded; their fetch fails
    /// on its own.
    pub fn is_excluded(&self, url: &str) -> bool {
        let parsed = match Url::parse(url) {
            Ok(parsed) => parsed,
            Err(_) => return false,
        };
        match parsed.host_str() {
            Some(host) => self.patterns.iter().any(|pattern| pattern.matches(host)),
            None => false,
        }
    }
}

/// Populate `parsed_urls` with the non-empty text of every page fetched in time
///
/// A URL whose fetch did not complete is absent from the result, never
/// mapped to partial text.
pub async fn perform_crawling(
    snapshot: &NewsSnapshot,
    ctx: &StageContext,
) -> Result<NewsSnapshot, PipelineError> {
    let urls = snapshot.require_retrieved_urls()?;
    let timer = StageTimer::start(STAGE, &snapshot.query, &ctx.sink);

    let filter = HostFilter::new(&ctx.settings.pipeline.excluded_hosts);
    let (excluded, to_crawl): (Vec<&String>, Vec<&String>) =
        urls.iter().partition(|url| filter.is_excluded(url));
    if !excluded.is_empty() {
        debug!(count = excluded.len(), "Skipping excluded hosts");
    }

    let calls = to_crawl
        .into_iter()
        .map(|url| RemoteCall::Crawl { url: url.clone() })
        .collect();
    let batch = ctx.fan_out(calls, ctx.settings.timeouts.crawl()).await;

    let recorded = ctx.record_unfinished(&batch).await?;
    if batch.timed_out_count() > 0 {
        info!(
            timed_out = batch.timed_out_count(),
            recorded, "The crawling timed out for some URLs"
        );
    }

    let mut parsed_urls = BTreeMap::new();
    for (call, output) in batch.completed() {
        let url = match call {
            RemoteCall::Crawl { url } => url,
            _ => continue,
        };
        match output.clone().into_page() {
            Ok(text) if !text.trim().is_empty() => {
                parsed_urls.insert(url.clone(), text);
            }
            Ok(_) => {}
            Err(err) => warn!(url = %url, error = %err, "Unexpected crawl output"),
        }
    }

    let message = format!(
        "{} URLs out of {} could be parsed",
        parsed_urls.len(),
        urls.len()
    );
    info!("{}", message);
    ctx.sink.progress(message);

    timer.finish();
    Ok(snapshot.with_parsed_urls(parsed_urls))
}
