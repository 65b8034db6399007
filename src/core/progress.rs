//! Progress sink: an unbounded multi-producer single-consumer event queue.
//!
//! The end of the stream is an explicit sentinel (`None` on the channel),
//! never an event. The consumer stops when it sees the sentinel even if
//! producers still hold sink handles.

use serde_json::Value;
use tokio::io::{AsyncWrite, AsyncWriteExt};
use tokio::sync::mpsc;
use tracing::debug;

use crate::domain::{MessageType, ProgressEvent};

/// Create a connected sink and stream
pub fn channel() -> (ProgressSink, ProgressStream) {
    let (tx, rx) = mpsc::unbounded_channel();
    (ProgressSink { tx }, ProgressStream { rx, finished: false })
}

/// Producer handle; clone one per producer
#[derive(Debug, Clone)]
pub struct ProgressSink {
    tx: mpsc::UnboundedSender<Option<ProgressEvent>>,
}

impl ProgressSink {
    /// A sink with no consumer; events are dropped
    pub fn disconnected() -> Self {
        channel().0
    }

    /// Enqueue an event; never blocks
    pub fn send(&self, event: ProgressEvent) {
        if self.tx.send(Some(event)).is_err() {
            debug!("Progress consumer gone, event dropped");
        }
    }

    /// Enqueue an event of the given kind
    pub fn send_kind(&self, message_type: MessageType, message: impl Into<Value>) {
        self.send(ProgressEvent::new(message_type, message));
    }

    /// Enqueue a `progress` event
    pub fn progress(&self, message: impl Into<Value>) {
        self.send_kind(MessageType::Progress, message);
    }

    pub fn value(&self, message: impl Into<Value>) {
        self.send_kind(MessageType::Value, message);
    }

    pub fn log(&self, message: impl Into<Value>) {
        self.send_kind(MessageType::Log, message);
    }

    /// Enqueue one `final` event followed by the sentinel
    pub fn send_final(&self, message: impl Into<Value>) {
        self.send_kind(MessageType::Final, message);
        self.close();
    }

    /// Enqueue only the sentinel
    pub fn close(&self) {
        let _ = self.tx.send(None);
    }

    /// Whether the consumer has gone away
    pub fn is_closed(&self) -> bool {
        self.tx.is_closed()
    }
}

/// Consumer side of a progress channel
#[derive(Debug)]
pub struct ProgressStream {
    rx: mpsc::UnboundedReceiver<Option<ProgressEvent>>,
    finished: bool,
}

impl ProgressStream {
    /// Next event in enqueue order, or `None` once the sentinel is seen
    ///
    /// Also returns `None` if every sink was dropped without a sentinel.
    pub async fn next(&mut self) -> Option<ProgressEvent> {
        if self.finished {
            return None;
        }
        match self.rx.recv().await {
            Some(Some(event)) => Some(event),
            Some(None) | None => {
                self.finished = true;
                self.rx.close();
                None
            }
        }
    }

    /// Drain every event up to the sentinel
    pub async fn collect(mut self) -> Vec<ProgressEvent> {
        let mut events = Vec::new();
        while let Some(event) = self.next().await {
            events.push(event);
        }
        events
    }

    /// Write events as NDJSON until the sentinel, returning how many were written
    pub async fn write_ndjson<W>(mut self, writer: &mut W) -> std::io::Result<usize>
    where
        W: AsyncWrite + Unpin,
    {
        let mut written = 0;
        while let Some(event) = self.next().await {
            let line = event.to_ndjson_line()?;
            writer.write_all(line.as_bytes()).await?;
            writer.flush().await?;
            written += 1;
        }
        Ok(written)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_events_after_sentinel_are_not_delivered() {
        let (sink, stream) = channel();
        sink.progress("a");
        sink.close();
        sink.progress("after");

        let events = stream.collect().await;
        assert_eq!(events.len(), 1);
        assert_eq!(events[0].message, "a");
    }

    #[tokio::test]
    async fn test_dropped_sinks_end_stream() {
        let (sink, stream) = channel();
        let clone = sink.clone();
        sink.log("from first");
        clone.value(serde_json::json!({"n": 1}));
        drop(sink);
        drop(clone);

        let events = stream.collect().await;
        assert_eq!(events.len(), 2);
        assert_eq!(events[1].message_type, MessageType::Value);
    }

    #[tokio::test]
    async fn test_write_ndjson() {
        let (sink, stream) = channel();
        sink.progress("one");
        sink.send_final(serde_json::json!([]));

        let mut out = Vec::new();
        let written = stream.write_ndjson(&mut out).await.unwrap();
        assert_eq!(written, 2);

        let text = String::from_utf8(out).unwrap();
        let lines: Vec<&str> = text.lines().collect();
        assert_eq!(lines[0], r#"{"message_type":"progress","message":"one"}"#);
        assert_eq!(lines[1], r#"{"message_type":"final","message":[]}"#);
    }
}
