//! Line protocol between the parent and a worker process.
//!
//! One JSON object per line over the worker's stdin (parent to worker) and
//! stdout (worker to parent). The parent sends exactly one `run`, then one
//! `granted` per `acquire` the worker sends. The worker ends with `done`.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::domain::{CallError, CallOutput, Lane, ProgressEvent, RemoteCall};

/// Parent to worker
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ParentMessage {
    /// The call this worker must execute
    Run { call: RemoteCall },

    /// Admission on `lane` was granted
    Granted { lane: Lane },
}

/// Worker to parent
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum WorkerMessage {
    /// Request admission on a rate-limited lane
    Acquire { lane: Lane },

    /// Relay a progress event to the parent's sink
    Progress { event: ProgressEvent },

    /// Final outcome; the worker exits after sending it
    Done { outcome: WireOutcome },
}

/// Call outcome as it crosses the process boundary
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum WireOutcome {
    Ok { output: CallOutput },
    Err { error: String },
}

impl From<Result<CallOutput, CallError>> for WireOutcome {
    fn from(result: Result<CallOutput, CallError>) -> Self {
        match result {
            Ok(output) => Self::Ok { output },
            Err(err) => Self::Err {
                error: err.to_string(),
            },
        }
    }
}

impl WireOutcome {
    pub fn into_result(self) -> Result<CallOutput, CallError> {
        match self {
            Self::Ok { output } => Ok(output),
            Self::Err { error } => Err(CallError::Remote(error)),
        }
    }
}

/// Serialize a message as one line, newline included
pub fn encode_line<T: Serialize>(message: &T) -> serde_json::Result<String> {
    let mut line = serde_json::to_string(message)?;
    line.push('\n');
    Ok(line)
}

pub fn decode_line<T: DeserializeOwned>(line: &str) -> serde_json::Result<T> {
    serde_json::from_str(line.trim_end())
}
