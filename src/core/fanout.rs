//! Fan-out executor with a hard per-batch deadline.
//!
//! `run_all` launches one task per argument, waits for them against a single
//! shared deadline (start + `max_time`) and aborts whatever is still running
//! when it passes. Aborting drops the call's future; a call that owns a
//! worker process (see `ProcessRunner`) kills that process on drop, which is
//! what bounds calls that ignore their own timeouts.
//!
//! Results are appended to a shared collector in arrival order. Once the
//! deadline passes the collector is sealed and late writes are discarded, so
//! a straggler can never contribute a torn result.

use std::fmt::Display;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::task::{JoinError, JoinHandle};
use tokio::time::{timeout_at, Instant};
use tracing::{debug, info, warn};

/// Time allowed for aborted tasks to unwind before `run_all` returns
const ABORT_GRACE: Duration = Duration::from_millis(100);

/// Outcome of one call in a batch
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "status", content = "value", rename_all = "snake_case")]
pub enum CallOutcome<T> {
    Completed(T),
    /// No result before the deadline (or the result arrived too late)
    TimedOut,
    Failed(String),
}

impl<T> CallOutcome<T> {
    pub fn is_completed(&self) -> bool {
        matches!(self, Self::Completed(_))
    }

    pub fn completed(self) -> Option<T> {
        match self {
            Self::Completed(value) => Some(value),
            _ => None,
        }
    }
}

/// One argument and what became of it
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct BatchEntry<A, T> {
    /// Position of the argument in the input list
    pub index: usize,
    pub arg: A,
    pub outcome: CallOutcome<T>,
}

/// Everything a batch produced, in arrival order then timed-out entries
#[derive(Debug, Clone)]
pub struct BatchResult<A, T> {
    entries: Vec<BatchEntry<A, T>>,
    elapsed: Duration,
}

impl<A, T> BatchResult<A, T> {
    pub fn entries(&self) -> &[BatchEntry<A, T>] {
        &self.entries
    }

    pub fn into_entries(self) -> Vec<BatchEntry<A, T>> {
        self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Wall time the batch took
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    /// Completed results paired with their arguments
    pub fn completed(&self) -> impl Iterator<Item = (&A, &T)> {
        self.entries.iter().filter_map(|entry| match &entry.outcome {
            CallOutcome::Completed(value) => Some((&entry.arg, value)),
            _ => None,
        })
    }

    /// Arguments that produced no result, whether timed out or failed
    pub fn unfinished(&self) -> impl Iterator<Item = &A> {
        self.entries
            .iter()
            .filter(|entry| !entry.outcome.is_completed())
            .map(|entry| &entry.arg)
    }

    pub fn timed_out_count(&self) -> usize {
        self.count(|outcome| matches!(outcome, CallOutcome::TimedOut))
    }

    pub fn failed_count(&self) -> usize {
        self.count(|outcome| matches!(outcome, CallOutcome::Failed(_)))
    }

    pub fn completed_count(&self) -> usize {
        self.count(CallOutcome::is_completed)
    }

    fn count(&self, pred: impl Fn(&CallOutcome<T>) -> bool) -> usize {
        self.entries.iter().filter(|entry| pred(&entry.outcome)).count()
    }
}

/// Shared result collection, guarded by a single lock
struct Collector<T> {
    sealed: bool,
    arrivals: Vec<(usize, Result<T, String>)>,
}

impl<T> Collector<T> {
    fn push(&mut self, index: usize, result: Result<T, String>) -> bool {
        if self.sealed {
            return false;
        }
        self.arrivals.push((index, result));
        true
    }
}

/// Run `f` once per argument, concurrently, bounded by `max_time`
///
/// With `max_time = None` every call is awaited to completion. An empty
/// argument list returns an empty result.
pub async fn run_all<A, T, E, F, Fut>(f: F, args: Vec<A>, max_time: Option<Duration>) -> BatchResult<A, T>
where
    A: Clone,
    F: Fn(A) -> Fut,
    Fut: Future<Output = Result<T, E>> + Send + 'static,
    T: Send + 'static,
    E: Display + Send + 'static,
{
    let started = Instant::now();
    if args.is_empty() {
        return BatchResult {
            entries: Vec::new(),
            elapsed: Duration::ZERO,
        };
    }

    let collector = Arc::new(Mutex::new(Collector {
        sealed: false,
        arrivals: Vec::with_capacity(args.len()),
    }));

    let handles: Vec<JoinHandle<()>> = args
        .iter()
        .cloned()
        .enumerate()
        .map(|(index, arg)| {
            let call = f(arg);
            let collector = Arc::clone(&collector);
            tokio::spawn(async move {
                let result = call.await.map_err(|err| err.to_string());
                if !collector.lock().push(index, result) {
                    debug!(index, "Result arrived after deadline, discarded");
                }
            })
        })
        .collect();

    let deadline = max_time.map(|limit| started + limit);
    let mut pending = Vec::new();
    for (index, mut handle) in handles.into_iter().enumerate() {
        let joined = match deadline {
            Some(deadline) if Instant::now() >= deadline => {
                pending.push(handle);
                continue;
            }
            Some(deadline) => match timeout_at(deadline, &mut handle).await {
                Ok(joined) => joined,
                Err(_) => {
                    pending.push(handle);
                    continue;
                }
            },
            None => handle.await,
        };

        if let Err(err) = joined {
            let message = join_failure(err);
            warn!(index, error = %message, "Fan-out task failed");
            collector.lock().push(index, Err(message));
        }
    }

    // Seal before aborting so nothing that finishes during shutdown is kept.
    let arrivals = {
        let mut collector = collector.lock();
        collector.sealed = true;
        std::mem::take(&mut collector.arrivals)
    };

    if !pending.is_empty() {
        for handle in &pending {
            handle.abort();
        }
        let grace = Instant::now() + ABORT_GRACE;
        for handle in pending {
            let _ = timeout_at(grace, handle).await;
        }
    }

    let mut args: Vec<Option<A>> = args.into_iter().map(Some).collect();
    let mut entries = Vec::with_capacity(args.len());
    for (index, result) in arrivals {
        if let Some(arg) = args.get_mut(index).and_then(Option::take) {
            let outcome = match result {
                Ok(value) => CallOutcome::Completed(value),
                Err(message) => CallOutcome::Failed(message),
            };
            entries.push(BatchEntry { index, arg, outcome });
        }
    }
    for (index, arg) in args.into_iter().enumerate() {
        if let Some(arg) = arg {
            entries.push(BatchEntry {
                index,
                arg,
                outcome: CallOutcome::TimedOut,
            });
        }
    }

    let result = BatchResult {
        entries,
        elapsed: started.elapsed(),
    };
    info!(
        calls = result.len(),
        completed = result.completed_count(),
        failed = result.failed_count(),
        timed_out = result.timed_out_count(),
        elapsed_ms = result.elapsed.as_millis() as u64,
        "Fan-out batch finished"
    );
    result
}

fn join_failure(err: JoinError) -> String {
    if err.is_panic() {
        let payload = err.into_panic();
        let message = payload
            .downcast_ref::<&str>()
            .map(|s| s.to_string())
            .or_else(|| payload.downcast_ref::<String>().cloned())
            .unwrap_or_else(|| "unknown panic".to_string());
        format!("panicked: {}", message)
    } else {
        "cancelled".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_every_argument_has_an_entry() {
        let result = run_all(
            |n: u32| async move { Ok::<_, String>(n * 10) },
            vec![1, 2, 3],
            None,
        )
        .await;

        assert_eq!(result.len(), 3);
        let mut pairs: Vec<(u32, u32)> = result.completed().map(|(a, v)| (*a, *v)).collect();
        pairs.sort();
        assert_eq!(pairs, vec![(1, 10), (2, 20), (3, 30)]);
    }

    #[tokio::test]
    async fn test_failures_are_isolated() {
        let result = run_all(
            |n: u32| async move {
                if n == 2 {
                    Err("status 404".to_string())
                } else {
                    Ok(n)
                }
            },
            vec![1, 2, 3],
            Some(Duration::from_secs(5)),
        )
        .await;

        assert_eq!(result.completed_count(), 2);
        assert_eq!(result.failed_count(), 1);
        let failed = result
            .entries()
            .iter()
            .find(|e| e.arg == 2)
            .map(|e| e.outcome.clone());
        assert_eq!(failed, Some(CallOutcome::Failed("status 404".to_string())));
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_results_become_timed_out() {
        let result = run_all(
            |delay_ms: u64| async move {
                tokio::time::sleep(Duration::from_millis(delay_ms)).await;
                Ok::<_, String>(delay_ms)
            },
            vec![3000, 10],
            Some(Duration::from_secs(1)),
        )
        .await;

        let entries = result.entries();
        assert_eq!(entries[0].index, 1);
        assert_eq!(entries[0].outcome, CallOutcome::Completed(10));
        assert_eq!(entries[1].index, 0);
        assert_eq!(entries[1].outcome, CallOutcome::TimedOut);
    }
}
