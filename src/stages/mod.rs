//! The five pipeline stages.
//!
//! Each stage is a transition from one `NewsSnapshot` to the next. A stage
//! validates its required input, fans its remote calls out through the
//! configured `CallRunner`, and returns a new snapshot with exactly one more
//! field populated.

pub mod crawling;
pub mod impact;
pub mod relevance;
pub mod search_terms;
pub mod web_search;

use std::sync::Arc;
use std::time::Duration;

use chrono::Local;
use thiserror::Error;
use tokio::time::Instant;
use tracing::info;

use crate::config::Settings;
use crate::core::cache::{Cache, CacheError};
use crate::core::calls::CallRunner;
use crate::core::fanout::{run_all, BatchResult};
use crate::core::progress::ProgressSink;
use crate::domain::{CallError, CallOutput, NewsSnapshot, RemoteCall, SnapshotError, Stage};

/// Errors that abort a pipeline run
#[derive(Debug, Error)]
pub enum PipelineError {
    /// A stage's required input was absent or empty
    #[error(transparent)]
    MissingInput(#[from] SnapshotError),

    /// A call the stage cannot do without failed
    #[error("{} failed: {}", .stage.description(), .source)]
    Remote {
        stage: Stage,
        #[source]
        source: CallError,
    },

    #[error(transparent)]
    Cache(#[from] CacheError),
}

/// Shared dependencies of every stage
#[derive(Clone)]
pub struct StageContext {
    pub runner: Arc<dyn CallRunner>,
    pub cache: Cache,
    pub settings: Arc<Settings>,
    pub sink: ProgressSink,
}

impl StageContext {
    pub fn new(runner: Arc<dyn CallRunner>, cache: Cache, settings: Arc<Settings>, sink: ProgressSink) -> Self {
        Self {
            runner,
            cache,
            settings,
            sink,
        }
    }

    /// Run every call concurrently under one batch deadline
    pub async fn fan_out(
        &self,
        calls: Vec<RemoteCall>,
        max_time: Option<Duration>,
    ) -> BatchResult<RemoteCall, CallOutput> {
        let runner = Arc::clone(&self.runner);
        run_all(
            move |call: RemoteCall| {
                let runner = Arc::clone(&runner);
                async move { runner.run(call).await }
            },
            calls,
            max_time,
        )
        .await
    }

    /// Run a single call the stage cannot proceed without
    pub async fn call_one(&self, stage: Stage, call: RemoteCall) -> Result<CallOutput, PipelineError> {
        self.runner
            .run(call)
            .await
            .map_err(|source| PipelineError::Remote { stage, source })
    }

    /// Record "no result" for calls of a batch that did not complete
    pub async fn record_unfinished(
        &self,
        batch: &BatchResult<RemoteCall, CallOutput>,
    ) -> Result<usize, CacheError> {
        let keys: Vec<String> = batch.unfinished().map(RemoteCall::cache_key).collect();
        self.cache
            .run_blocking(move |cache| {
                let mut recorded = 0;
                for key in &keys {
                    if cache.set_no_result(key)? {
                        recorded += 1;
                    }
                }
                Ok(recorded)
            })
            .await
    }
}

/// Run one stage on a snapshot
pub async fn run_stage(
    stage: Stage,
    snapshot: &NewsSnapshot,
    ctx: &StageContext,
) -> Result<NewsSnapshot, PipelineError> {
    match stage {
        Stage::SearchTermGeneration => search_terms::generate_search_terms(snapshot, ctx).await,
        Stage::WebSearch => web_search::perform_web_search(snapshot, ctx).await,
        Stage::Crawling => crawling::perform_crawling(snapshot, ctx).await,
        Stage::RelevanceIdentification => relevance::identify_relevant_articles(snapshot, ctx).await,
        Stage::ImpactSummarization => impact::generate_most_impactful_news(snapshot, ctx).await,
    }
}

/// Logs and reports the start, end and duration of a stage
pub struct StageTimer {
    label: String,
    started: Instant,
    sink: ProgressSink,
}

impl StageTimer {
    pub fn start(stage: Stage, query: &str, sink: &ProgressSink) -> Self {
        let label = format!("{} for {}", stage.description(), query);
        let message = format!("{} started at: {}", label, timestamp());
        info!("{}", message);
        sink.progress(message);
        Self {
            label,
            started: Instant::now(),
            sink: sink.clone(),
        }
    }

    pub fn finish(self) -> Duration {
        let elapsed = self.started.elapsed();
        let finished = format!("{} finished at: {}", self.label, timestamp());
        let took = format!("{} took: {:.2} seconds", self.label, elapsed.as_secs_f64());
        info!("{}", finished);
        info!("{}", took);
        self.sink.progress(finished);
        self.sink.progress(took);
        elapsed
    }
}

fn timestamp() -> String {
    Local::now().format("%Y-%m-%d %H:%M:%S").to_string()
}

/// Keep only the digits of a model-provided number
pub(crate) fn digits_only(value: &serde_json::Value) -> String {
    let raw = match value {
        serde_json::Value::String(s) => s.clone(),
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    };
    raw.chars().filter(char::is_ascii_digit).collect()
}

/// Model reply items under `"items"` (empty if the shape is unexpected)
pub(crate) fn reply_items(reply: &serde_json::Value) -> &[serde_json::Value] {
    reply
        .get("items")
        .and_then(serde_json::Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[])
}
