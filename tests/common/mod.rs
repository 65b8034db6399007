//! Shared fixtures: scripted providers and an in-process stage context.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;
use tempfile::TempDir;

use newsfan::adapters::{LanguageModel, PageFetcher, Providers, SearchProvider};
use newsfan::config::Settings;
use newsfan::core::progress::{self, ProgressStream};
use newsfan::core::{Cache, CallContext, InProcessRunner, LimitSettings, RateLimiters, RetryPolicy};
use newsfan::domain::{CallError, RemoteResponse};
use newsfan::stages::StageContext;

/// Search provider answering from a fixed term -> URLs table
pub struct ScriptedSearch {
    results: HashMap<String, Vec<String>>,
    status: Option<u16>,
    calls: AtomicUsize,
}

impl ScriptedSearch {
    pub fn new(results: &[(&str, &[&str])]) -> Self {
        Self {
            results: results
                .iter()
                .map(|(term, urls)| (term.to_string(), urls.iter().map(|u| u.to_string()).collect()))
                .collect(),
            status: None,
            calls: AtomicUsize::new(0),
        }
    }

    /// Every request fails with `status`
    pub fn failing(status: u16) -> Self {
        Self {
            status: Some(status),
            ..Self::new(&[])
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl SearchProvider for ScriptedSearch {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn search(&self, term: &str) -> Result<RemoteResponse<Vec<String>>, CallError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if let Some(status) = self.status {
            return Ok(RemoteResponse::status(status));
        }
        Ok(RemoteResponse::ok(
            self.results.get(term).cloned().unwrap_or_default(),
        ))
    }
}

/// Page fetcher serving fixed HTML; some URLs never answer
pub struct ScriptedFetcher {
    pages: HashMap<String, String>,
    hanging: HashSet<String>,
    calls: AtomicUsize,
}

impl ScriptedFetcher {
    pub fn new(pages: &[(&str, &str)]) -> Self {
        Self {
            pages: pages
                .iter()
                .map(|(url, html)| (url.to_string(), html.to_string()))
                .collect(),
            hanging: HashSet::new(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn hanging(mut self, url: &str) -> Self {
        self.hanging.insert(url.to_string());
        self
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl PageFetcher for ScriptedFetcher {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn fetch(&self, url: &str) -> Result<RemoteResponse<String>, CallError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        if self.hanging.contains(url) {
            std::future::pending::<()>().await;
        }
        Ok(match self.pages.get(url) {
            Some(html) => RemoteResponse::ok(html.clone()),
            None => RemoteResponse::status(404),
        })
    }
}

/// Language model picking its reply by a marker found in the prompt
pub struct ScriptedModel {
    replies: Vec<(String, Value)>,
    calls: AtomicUsize,
}

impl ScriptedModel {
    pub fn new(replies: Vec<(&str, Value)>) -> Self {
        Self {
            replies: replies
                .into_iter()
                .map(|(marker, reply)| (marker.to_string(), reply))
                .collect(),
            calls: AtomicUsize::new(0),
        }
    }

    pub fn calls(&self) -> usize {
        self.calls.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl LanguageModel for ScriptedModel {
    fn name(&self) -> &str {
        "scripted"
    }

    async fn complete(&self, prompt: &str) -> Result<RemoteResponse<Value>, CallError> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        Ok(self
            .replies
            .iter()
            .find(|(marker, _)| prompt.contains(marker.as_str()))
            .map(|(_, reply)| RemoteResponse::ok(reply.clone()))
            .unwrap_or_else(|| RemoteResponse::status(404)))
    }
}

/// Limits high enough never to throttle a test
pub fn generous_limits() -> LimitSettings {
    LimitSettings {
        search_per_sec: 1000,
        llm_per_sec: 1000,
        reset_interval_ms: 1000,
        poll_interval_ms: 10,
    }
}

/// Retry policy with short delays
pub fn quick_retry() -> RetryPolicy {
    RetryPolicy {
        max_attempts: 3,
        initial_delay_ms: 10,
        max_delay_ms: 100,
        ..RetryPolicy::default()
    }
}

pub fn open_cache(dir: &TempDir) -> Cache {
    Cache::open(&dir.path().join("cache.db"), Duration::from_secs(3600)).unwrap()
}

/// A stage context running calls in-process over the given providers
pub struct Harness {
    pub dir: TempDir,
    pub cache: Cache,
    pub context: StageContext,
    pub stream: ProgressStream,
}

impl Harness {
    pub fn new(providers: Providers, settings: Settings) -> Self {
        let dir = TempDir::new().unwrap();
        let cache = open_cache(&dir);
        let (sink, stream) = progress::channel();
        let limiters = RateLimiters::from_settings(&generous_limits()).unwrap();

        let calls = CallContext::new(
            providers,
            cache.clone(),
            quick_retry(),
            Arc::new(limiters),
            sink.clone(),
        );
        let context = StageContext::new(
            Arc::new(InProcessRunner::new(calls)),
            cache.clone(),
            Arc::new(settings),
            sink,
        );

        Self {
            dir,
            cache,
            context,
            stream,
        }
    }
}

pub fn providers(
    search: Arc<ScriptedSearch>,
    fetcher: Arc<ScriptedFetcher>,
    llm: Arc<ScriptedModel>,
) -> Providers {
    Providers {
        search,
        fetcher,
        llm,
    }
}
