//! Domain types for the newsfan pipeline.
//!
//! This module contains the core data structures:
//! - Call: Remote call descriptors, outputs and errors
//! - Events: Progress events streamed to the consumer
//! - Snapshot: Immutable pipeline state between stages

pub mod call;
pub mod events;
pub mod snapshot;

// Re-export commonly used types
pub use call::{CallError, CallOutput, Lane, RemoteCall, RemoteResponse};
pub use events::{MessageType, ProgressEvent};
pub use snapshot::{
    Article, ImpactType, News, NewsSnapshot, SnapshotError, SnapshotStats, Stage,
};
