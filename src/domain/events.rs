//! Progress events streamed to the consumer of a pipeline run.
//!
//! Events are serialised as newline-delimited JSON records of the form
//! `{"message_type": ..., "message": ...}`.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A single event in a progress stream
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressEvent {
    /// Kind of event
    pub message_type: MessageType,

    /// Free-form payload (usually a string, structured for values and finals)
    pub message: Value,
}

impl ProgressEvent {
    /// Create a new event
    pub fn new(message_type: MessageType, message: impl Into<Value>) -> Self {
        Self {
            message_type,
            message: message.into(),
        }
    }

    /// Whether this is the terminal event of a run
    pub fn is_final(&self) -> bool {
        self.message_type == MessageType::Final
    }

    /// Serialise as one NDJSON line (including the trailing newline)
    pub fn to_ndjson_line(&self) -> serde_json::Result<String> {
        let mut line = serde_json::to_string(self)?;
        line.push('\n');
        Ok(line)
    }
}

/// Kinds of progress events
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageType {
    /// Human-readable progress message
    Progress,

    /// Intermediate structured value
    Value,

    /// Diagnostic detail, typically from inside a worker
    Log,

    /// Terminal result (or structured error) of the run
    Final,
}

impl Default for MessageType {
    fn default() -> Self {
        Self::Progress
    }
}
