//! Core execution substrate.
//!
//! This module contains:
//! - RateLimiter: fixed-window admission per lane
//! - RetryPolicy: exponential backoff on transient status codes
//! - Cache: SQLite-backed memoization shared by every worker
//! - Fan-out: concurrent batches under one hard deadline
//! - Progress: the ordered event stream of a run
//! - Calls: per-call execution and the runners that host it
//! - Orchestrator: the stage state machine driver

pub mod cache;
pub mod calls;
pub mod fanout;
pub mod orchestrator;
pub mod progress;
pub mod rate_limiter;
pub mod retry;

// Re-export commonly used types
pub use cache::{Cache, CacheError, CacheSettings, CacheStats, Cached};
pub use calls::{CallContext, CallRunner, InProcessRunner};
pub use fanout::{run_all, BatchEntry, BatchResult, CallOutcome};
pub use orchestrator::Orchestrator;
pub use progress::{ProgressSink, ProgressStream};
pub use rate_limiter::{Admission, LimitSettings, RateLimitError, RateLimiter, RateLimiters};
pub use retry::RetryPolicy;
