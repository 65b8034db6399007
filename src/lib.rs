//! newsfan - Fan-out news pipeline
//!
//! Finds the most impactful recent news about a query by fanning remote
//! calls (web search, page fetches, language-model completions) out across
//! many concurrent workers.
//!
//! # Architecture
//!
//! Every remote call goes through the same substrate:
//! - A memoizing cache shared by all workers (first writer wins)
//! - A per-lane rate limiter with a fixed reset window
//! - A retry policy with exponential backoff on transient statuses
//! - A fan-out executor whose batch deadline is a hard bound
//!
//! A run is a fixed sequence of five stages, each producing a new immutable
//! snapshot. Progress is streamed as NDJSON events ending in one `final`.
//!
//! # Modules
//!
//! - `adapters`: External providers (search, page fetch, language model)
//! - `core`: Execution substrate (RateLimiter, Cache, RetryPolicy, fan-out)
//! - `domain`: Data structures (RemoteCall, ProgressEvent, NewsSnapshot)
//! - `stages`: The five pipeline stages
//! - `worker`: Process isolation and the worker protocol
//! - `cli`: Command-line interface
//!
//! # Usage
//!
//! ```bash
//! # Stream progress for a query
//! newsfan run "US stocks"
//!
//! # Same, without worker processes
//! newsfan run "Apple Inc." --in-process
//!
//! # Drop expired cache entries
//! newsfan cache purge
//! ```

pub mod adapters;
pub mod cli;
pub mod config;
pub mod core;
pub mod domain;
pub mod stages;
pub mod worker;

// Re-export main types at crate root for convenience
pub use core::{Cache, Orchestrator, ProgressSink, RateLimiter, RetryPolicy};
pub use domain::{CallError, CallOutput, NewsSnapshot, ProgressEvent, RemoteCall, Stage};
pub use stages::PipelineError;
