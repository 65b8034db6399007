//! Pipeline execution engine.
//!
//! The orchestrator drives a query through the five stages in order and
//! always closes the progress stream with a terminal event, whether the run
//! succeeded or not.

use serde_json::json;
use tracing::{error, info, instrument};
use uuid::Uuid;

use crate::domain::{NewsSnapshot, Stage};
use crate::stages::{run_stage, PipelineError, StageContext};

/// Runs news queries through the stage state machine
pub struct Orchestrator {
    context: StageContext,
}

impl Orchestrator {
    pub fn new(context: StageContext) -> Self {
        Self { context }
    }

    /// Run every stage on `query`, stopping at the first failure
    #[instrument(skip(self), fields(run_id = %Uuid::new_v4(), runner = %self.context.runner.name()))]
    pub async fn run(&self, query: &str) -> Result<NewsSnapshot, PipelineError> {
        info!("Starting news run");

        let mut snapshot = NewsSnapshot::new(query);
        for stage in Stage::ALL {
            snapshot = match run_stage(stage, &snapshot, &self.context).await {
                Ok(next) => next,
                Err(err) => {
                    error!(?stage, error = %err, "Stage failed");
                    return Err(err);
                }
            };
        }

        info!(news = snapshot.news_items().len(), "Run completed");
        Ok(snapshot)
    }

    /// Run and report the outcome on the progress sink
    ///
    /// On success a `value` event with the snapshot's counts precedes the
    /// `final` event carrying the news list. On failure the `final` event
    /// carries the error message. Either way the stream ends.
    pub async fn run_to_sink(&self, query: &str) -> Result<NewsSnapshot, PipelineError> {
        let result = self.run(query).await;
        let sink = &self.context.sink;
        match &result {
            Ok(snapshot) => {
                sink.value(json!({ "stats": snapshot.stats() }));
                sink.send_final(json!(snapshot.news_items()));
            }
            Err(err) => sink.send_final(json!({ "error": err.to_string() })),
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    use async_trait::async_trait;
    use serde_json::Value;
    use tempfile::TempDir;

    use crate::adapters::{LanguageModel, PageFetcher, Providers, SearchProvider};
    use crate::config::Settings;
    use crate::core::cache::Cache;
    use crate::core::calls::{CallContext, InProcessRunner};
    use crate::core::progress;
    use crate::core::rate_limiter::{LimitSettings, RateLimiters};
    use crate::core::retry::RetryPolicy;
    use crate::domain::{CallError, MessageType, RemoteResponse};

    struct Unreachable;

    #[async_trait]
    impl SearchProvider for Unreachable {
        fn name(&self) -> &str {
            "unreachable"
        }
        async fn search(&self, _term: &str) -> Result<RemoteResponse<Vec<String>>, CallError> {
            Ok(RemoteResponse::status(404))
        }
    }

    #[async_trait]
    impl PageFetcher for Unreachable {
        fn name(&self) -> &str {
            "unreachable"
        }
        async fn fetch(&self, _url: &str) -> Result<RemoteResponse<String>, CallError> {
            Ok(RemoteResponse::status(404))
        }
    }

    #[async_trait]
    impl LanguageModel for Unreachable {
        fn name(&self) -> &str {
            "unreachable"
        }
        async fn complete(&self, _prompt: &str) -> Result<RemoteResponse<Value>, CallError> {
            Ok(RemoteResponse::status(404))
        }
    }

    #[tokio::test]
    async fn test_failed_run_still_ends_stream() {
        let dir = TempDir::new().unwrap();
        let cache = Cache::open(&dir.path().join("cache.db"), Duration::from_secs(60)).unwrap();
        let (sink, stream) = progress::channel();
        let providers = Providers {
            search: Arc::new(Unreachable),
            fetcher: Arc::new(Unreachable),
            llm: Arc::new(Unreachable),
        };
        let limiters = RateLimiters::from_settings(&LimitSettings::default()).unwrap();
        let context = CallContext::new(
            providers,
            cache.clone(),
            RetryPolicy::default(),
            Arc::new(limiters),
            sink.clone(),
        );
        let runner = Arc::new(InProcessRunner::new(context));
        let orchestrator = Orchestrator::new(StageContext::new(
            runner,
            cache,
            Arc::new(Settings::default()),
            sink,
        ));

        let err = orchestrator.run_to_sink("US stocks").await.unwrap_err();
        assert!(matches!(
            err,
            PipelineError::Remote {
                stage: Stage::SearchTermGeneration,
                ..
            }
        ));

        let events = stream.collect().await;
        let last = events.last().unwrap();
        assert_eq!(last.message_type, MessageType::Final);
        assert!(last.message["error"]
            .as_str()
            .unwrap()
            .contains("The generation of the search terms failed"));
    }
}
