//! Process isolation for remote calls.
//!
//! Each call may run in its own `newsfan worker` process so the fan-out
//! deadline can terminate it outright. The rate limiter stays in the parent;
//! workers ask for admission over the protocol.

pub mod child;
pub mod process;
pub mod protocol;

pub use child::{serve_call, ParentLink};
pub use process::ProcessRunner;
pub use protocol::{ParentMessage, WireOutcome, WorkerMessage};
