//! Process Isolation Integration Tests
//!
//! `sh` scripts stand in for worker processes speaking the line protocol.

#![cfg(unix)]

use std::sync::Arc;
use std::time::{Duration, Instant};

use tempfile::TempDir;

use newsfan::core::progress::{self, ProgressSink};
use newsfan::core::{run_all, Admission, CallRunner, LimitSettings, RateLimiters};
use newsfan::domain::{CallError, CallOutput, Lane, MessageType, RemoteCall};
use newsfan::worker::ProcessRunner;

const DONE_OK: &str =
    r#"{"type":"done","outcome":{"status":"ok","output":{"kind":"urls","value":["u1"]}}}"#;

fn limiters() -> Arc<RateLimiters> {
    Arc::new(RateLimiters::from_settings(&LimitSettings::default()).unwrap())
}

fn script_runner(script: &str, admission: Arc<dyn Admission>, sink: ProgressSink) -> ProcessRunner {
    ProcessRunner::with_command("sh", ["-c", script], admission, sink)
}

fn search(term: &str) -> RemoteCall {
    RemoteCall::Search {
        term: term.to_string(),
    }
}

#[tokio::test]
async fn test_worker_outcome_is_returned() {
    let script = format!("read call; echo '{}'", DONE_OK);
    let runner = script_runner(&script, limiters(), ProgressSink::disconnected());

    let output = runner.run(search("rates")).await.unwrap();
    assert_eq!(output, CallOutput::Urls(vec!["u1".to_string()]));
}

#[tokio::test]
async fn test_worker_error_outcome() {
    let script = r#"read call; echo '{"type":"done","outcome":{"status":"err","error":"status 404"}}'"#;
    let runner = script_runner(script, limiters(), ProgressSink::disconnected());

    let err = runner.run(search("rates")).await.unwrap_err();
    assert_eq!(err, CallError::Remote("status 404".to_string()));
}

#[tokio::test]
async fn test_admission_and_progress_go_through_parent() {
    let script = format!(
        r#"read call
echo 'not a protocol line'
echo '{{"type":"acquire","lane":"search"}}'
read granted
case "$granted" in
  *granted*) ;;
  *) exit 1 ;;
esac
echo '{{"type":"progress","event":{{"message_type":"log","message":"1 results"}}}}'
echo '{}'"#,
        DONE_OK
    );
    let limiters = limiters();
    let (sink, stream) = progress::channel();
    let runner = script_runner(&script, limiters.clone(), sink.clone());

    let output = runner.run(search("rates")).await.unwrap();
    assert_eq!(output, CallOutput::Urls(vec!["u1".to_string()]));
    assert_eq!(limiters.limiter(Lane::Search).admitted_in_window(), 1);
    assert_eq!(limiters.limiter(Lane::Llm).admitted_in_window(), 0);

    sink.close();
    let events = stream.collect().await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].message_type, MessageType::Log);
}

#[tokio::test]
async fn test_worker_exiting_without_result_is_an_error() {
    let runner = script_runner("read call; exit 3", limiters(), ProgressSink::disconnected());

    let err = runner.run(search("rates")).await.unwrap_err();
    match err {
        CallError::Worker(message) => assert!(message.contains("without a result"), "{}", message),
        other => panic!("expected worker error, got {:?}", other),
    }
}

#[tokio::test]
async fn test_spawn_failure_is_reported() {
    let runner = ProcessRunner::with_command(
        "/nonexistent/newsfan-worker",
        Vec::<String>::new(),
        limiters(),
        ProgressSink::disconnected(),
    );

    let err = runner.run(search("rates")).await.unwrap_err();
    assert!(matches!(err, CallError::Worker(_)));
}

#[tokio::test]
async fn test_deadline_kills_stuck_workers() {
    let dir = TempDir::new().unwrap();
    let pid_file = dir.path().join("pids");
    let runner = Arc::new(
        ProcessRunner::with_command(
            "sh",
            [
                "-c".to_string(),
                r#"read call; echo $$ >> "$1"; exec sleep 30"#.to_string(),
                "sh".to_string(),
                pid_file.to_string_lossy().to_string(),
            ],
            limiters(),
            ProgressSink::disconnected(),
        ),
    );

    let started = Instant::now();
    let batch = run_all(
        move |call: RemoteCall| {
            let runner = Arc::clone(&runner);
            async move { runner.run(call).await }
        },
        vec![search("a"), search("b"), search("c")],
        Some(Duration::from_secs(1)),
    )
    .await;

    assert!(started.elapsed() < Duration::from_secs(5));
    assert_eq!(batch.timed_out_count(), 3);

    // Every stuck worker is gone (or awaiting reaping), not sleeping on
    tokio::time::sleep(Duration::from_millis(300)).await;
    let pids = std::fs::read_to_string(&pid_file).unwrap();
    assert_eq!(pids.lines().count(), 3);
    for pid in pids.lines() {
        assert!(!is_running(pid.trim()), "worker {} still running", pid);
    }
}

/// A process that is absent or a zombie no longer runs
fn is_running(pid: &str) -> bool {
    match std::fs::read_to_string(format!("/proc/{}/stat", pid)) {
        Ok(stat) => stat
            .rsplit(')')
            .next()
            .and_then(|rest| rest.split_whitespace().next())
            .map(|state| state != "Z" && state != "X")
            .unwrap_or(false),
        Err(_) => {
            // Without procfs, fall back to a signal-0 probe
            !std::path::Path::new("/proc").exists()
                && std::process::Command::new("kill")
                    .args(["-0", pid])
                    .status()
                    .map(|s| s.success())
                    .unwrap_or(false)
        }
    }
}
