//! Worker Integration Tests
//!
//! The worker side of the line protocol, driven from a parent over an
//! in-memory pipe and through the real `newsfan worker` binary.

mod common;

use std::sync::Arc;

use serde_json::json;
use tempfile::TempDir;
use tokio::io::{AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader, Lines};

use common::{open_cache, quick_retry, ScriptedFetcher, ScriptedModel, ScriptedSearch};
use newsfan::core::progress::ProgressSink;
use newsfan::core::{CallContext, CallRunner, Cached, LimitSettings, RateLimiters};
use newsfan::domain::{CallError, CallOutput, Lane, MessageType, RemoteCall};
use newsfan::worker::protocol::{decode_line, encode_line};
use newsfan::worker::{serve_call, ParentLink, ParentMessage, ProcessRunner, WorkerMessage};

async fn send<W: AsyncWrite + Unpin>(writer: &mut W, message: &ParentMessage) {
    let line = encode_line(message).unwrap();
    writer.write_all(line.as_bytes()).await.unwrap();
    writer.flush().await.unwrap();
}

async fn receive<R: AsyncBufRead + Unpin>(lines: &mut Lines<R>) -> WorkerMessage {
    let line = lines.next_line().await.unwrap().unwrap();
    decode_line(&line).unwrap()
}

#[tokio::test]
async fn test_worker_asks_for_admission_and_relays_progress() {
    let dir = TempDir::new().unwrap();
    let cache = open_cache(&dir);
    let search = Arc::new(ScriptedSearch::new(&[("rates", &["u1"])]));
    let providers = common::providers(
        search.clone(),
        Arc::new(ScriptedFetcher::new(&[])),
        Arc::new(ScriptedModel::new(vec![])),
    );

    let (worker_end, parent_end) = tokio::io::duplex(4096);
    let (worker_read, worker_write) = tokio::io::split(worker_end);
    let link = Arc::new(ParentLink::new(worker_read, worker_write));
    let worker = tokio::spawn(serve_call(link, move |admission, sink| {
        Ok(CallContext::new(
            providers,
            cache,
            quick_retry(),
            admission,
            sink,
        ))
    }));

    let (parent_read, mut parent_write) = tokio::io::split(parent_end);
    let mut lines = BufReader::new(parent_read).lines();
    let call = RemoteCall::Search {
        term: "rates".to_string(),
    };
    send(&mut parent_write, &ParentMessage::Run { call }).await;

    assert_eq!(
        receive(&mut lines).await,
        WorkerMessage::Acquire { lane: Lane::Search }
    );
    // Nothing reaches the provider before admission is granted
    assert_eq!(search.calls(), 0);
    send(&mut parent_write, &ParentMessage::Granted { lane: Lane::Search }).await;

    match receive(&mut lines).await {
        WorkerMessage::Progress { event } => {
            assert_eq!(event.message_type, MessageType::Log);
            assert_eq!(event.message, json!("1 results for 'rates'"));
        }
        other => panic!("expected progress, got {:?}", other),
    }
    match receive(&mut lines).await {
        WorkerMessage::Done { outcome } => assert_eq!(
            outcome.into_result().unwrap(),
            CallOutput::Urls(vec!["u1".to_string()])
        ),
        other => panic!("expected done, got {:?}", other),
    }

    worker.await.unwrap().unwrap();
    assert_eq!(search.calls(), 1);
}

#[tokio::test]
async fn test_worker_reports_context_failure() {
    let (worker_end, parent_end) = tokio::io::duplex(1024);
    let (worker_read, worker_write) = tokio::io::split(worker_end);
    let link = Arc::new(ParentLink::new(worker_read, worker_write));
    let worker = tokio::spawn(serve_call(link, |_, _| {
        Err(anyhow::anyhow!("GEMINI_API_KEY is not set"))
    }));

    let (parent_read, mut parent_write) = tokio::io::split(parent_end);
    let mut lines = BufReader::new(parent_read).lines();
    let call = RemoteCall::Crawl {
        url: "https://a".to_string(),
    };
    send(&mut parent_write, &ParentMessage::Run { call }).await;

    match receive(&mut lines).await {
        WorkerMessage::Done { outcome } => assert_eq!(
            outcome.into_result(),
            Err(CallError::Remote("GEMINI_API_KEY is not set".to_string()))
        ),
        other => panic!("expected done, got {:?}", other),
    }
    worker.await.unwrap().unwrap();
}

#[tokio::test]
async fn test_worker_binary_shares_no_result_with_parent() {
    let dir = TempDir::new().unwrap();
    let home = dir.path().join("home");
    let config_path = dir.path().join("config.yaml");
    std::fs::write(&config_path, "timeouts:\n  fetch_seconds: 2\n").unwrap();

    let limiters = Arc::new(RateLimiters::from_settings(&LimitSettings::default()).unwrap());
    let runner = ProcessRunner::with_command(
        env!("CARGO_BIN_EXE_newsfan"),
        ["worker"],
        limiters,
        ProgressSink::disconnected(),
    )
    .env("NEWSFAN_HOME", home.to_string_lossy())
    .env("NEWSFAN_CONFIG", config_path.to_string_lossy())
    .env("GEMINI_API_KEY", "test-key");

    // Nothing listens on port 1, so the fetch fails without network access
    let call = RemoteCall::Crawl {
        url: "http://127.0.0.1:1/".to_string(),
    };

    let first = runner.run(call.clone()).await;
    assert!(matches!(first, Err(CallError::Remote(_))), "{:?}", first);

    // The first worker's "no result" is served to the second
    let second = runner.run(call.clone()).await.unwrap();
    assert_eq!(second, CallOutput::Page(String::new()));

    let cache = newsfan::core::Cache::open(
        &home.join("cache.db"),
        std::time::Duration::from_secs(60),
    )
    .unwrap();
    assert_eq!(cache.get(&call.cache_key()).unwrap(), Some(Cached::NoResult));
}
