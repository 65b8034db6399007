//! Per-call execution: cache lookup, admission, retry and write-back.
//!
//! `CallContext::execute` is what every worker runs for one `RemoteCall`,
//! whether it lives in the parent process (`InProcessRunner`) or in a
//! dedicated worker process (`ProcessRunner`).

use std::sync::Arc;

use async_trait::async_trait;
use tracing::{debug, info};

use super::cache::{Cache, Cached};
use super::progress::ProgressSink;
use super::rate_limiter::Admission;
use super::retry::RetryPolicy;
use crate::adapters::{extract_paragraphs, LanguageModel, PageFetcher, Providers, SearchProvider};
use crate::domain::{CallError, CallOutput, RemoteCall};

/// Everything a worker needs to execute calls
#[derive(Clone)]
pub struct CallContext {
    pub search: Arc<dyn SearchProvider>,
    pub fetcher: Arc<dyn PageFetcher>,
    pub llm: Arc<dyn LanguageModel>,
    pub cache: Cache,
    pub retry: RetryPolicy,
    pub admission: Arc<dyn Admission>,
    pub sink: ProgressSink,
}

impl CallContext {
    pub fn new(
        providers: Providers,
        cache: Cache,
        retry: RetryPolicy,
        admission: Arc<dyn Admission>,
        sink: ProgressSink,
    ) -> Self {
        Self {
            search: providers.search,
            fetcher: providers.fetcher,
            llm: providers.llm,
            cache,
            retry,
            admission,
            sink,
        }
    }

    /// Execute one call, consulting and filling the cache
    ///
    /// A cache hit returns without touching the rate limiter or provider. A
    /// recorded "no result" yields the call's empty output.
    pub async fn execute(&self, call: &RemoteCall) -> Result<CallOutput, CallError> {
        let key = call.cache_key();
        let lookup = key.clone();
        let cached = self
            .cache
            .run_blocking(move |cache| cache.get_json::<CallOutput>(&lookup))
            .await?;
        if let Some(cached) = cached {
            debug!(call = %call.label(), "Cache hit");
            return Ok(match cached {
                Cached::Value(output) => output,
                Cached::NoResult => call.empty_output(),
            });
        }

        match call {
            RemoteCall::Search { term } => {
                let urls = self.search(call, term).await?;
                self.sink
                    .log(format!("{} results for '{}'", urls.len(), term));
                self.store(key, CallOutput::Urls(urls)).await
            }
            RemoteCall::Crawl { url } => self.crawl(url, key).await,
            RemoteCall::Complete { prompt, .. } => {
                let value = self.complete(call, prompt).await?;
                self.store(key, CallOutput::Completion(value)).await
            }
        }
    }

    async fn search(&self, call: &RemoteCall, term: &str) -> Result<Vec<String>, CallError> {
        let search = &self.search;
        self.retry
            .run(&call.label(), move || async move {
                self.admit(call).await?;
                search.search(term).await
            })
            .await?
            .into_result()
    }

    async fn complete(
        &self,
        call: &RemoteCall,
        prompt: &str,
    ) -> Result<serde_json::Value, CallError> {
        let llm = &self.llm;
        self.retry
            .run(&call.label(), move || async move {
                self.admit(call).await?;
                llm.complete(prompt).await
            })
            .await?
            .into_result()
    }

    /// Wait for the call's lane, if it draws from one
    async fn admit(&self, call: &RemoteCall) -> Result<(), CallError> {
        match call.lane() {
            Some(lane) => self.admission.admit(lane).await,
            None => Ok(()),
        }
    }

    /// Page fetches are not retried; a failure is cached as "no result"
    async fn crawl(&self, url: &str, key: String) -> Result<CallOutput, CallError> {
        let html = match self.fetcher.fetch(url).await.and_then(|r| r.into_result()) {
            Ok(html) => html,
            Err(err) => {
                debug!(url, error = %err, "Fetch failed");
                self.record_no_result(key).await?;
                return Err(err);
            }
        };

        let text = extract_paragraphs(&html);
        if text.is_empty() {
            self.record_no_result(key).await?;
            return Ok(CallOutput::Page(text));
        }
        self.store(key, CallOutput::Page(text)).await
    }

    async fn record_no_result(&self, key: String) -> Result<bool, CallError> {
        Ok(self
            .cache
            .run_blocking(move |cache| cache.set_no_result(&key))
            .await?)
    }

    /// Write-once store; if another worker won the race, return its value
    async fn store(&self, key: String, output: CallOutput) -> Result<CallOutput, CallError> {
        let stored = self
            .cache
            .run_blocking(move |cache| {
                if cache.set_json(&key, &output)? {
                    return Ok(output);
                }
                info!(key = %key, "Result already cached by a concurrent call");
                Ok(match cache.get_json::<CallOutput>(&key)? {
                    Some(Cached::Value(stored)) => stored,
                    _ => output,
                })
            })
            .await?;
        Ok(stored)
    }
}

/// Executes calls somewhere: in this process or in a worker process
#[async_trait]
pub trait CallRunner: Send + Sync {
    /// Human-readable runner name
    fn name(&self) -> &str;

    async fn run(&self, call: RemoteCall) -> Result<CallOutput, CallError>;
}

/// Runs calls as tasks in the current process
///
/// Cheaper than `ProcessRunner` but a call that never yields cannot be
/// forcibly stopped.
pub struct InProcessRunner {
    context: Arc<CallContext>,
}

impl InProcessRunner {
    pub fn new(context: CallContext) -> Self {
        Self {
            context: Arc::new(context),
        }
    }
}

#[async_trait]
impl CallRunner for InProcessRunner {
    fn name(&self) -> &str {
        "in_process"
    }

    async fn run(&self, call: RemoteCall) -> Result<CallOutput, CallError> {
        self.context.execute(&call).await
    }
}
