//! Worker side of process isolation.
//!
//! A worker reads its call from the parent, executes it with a `CallContext`
//! whose admission and progress go back over the same pipe, then reports the
//! outcome and exits.

use std::io;
use std::sync::Arc;

use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncRead, AsyncWrite, AsyncWriteExt, BufReader, Lines};
use tokio::sync::Mutex;
use tracing::{debug, warn};

use super::protocol::{decode_line, encode_line, ParentMessage, WireOutcome, WorkerMessage};
use crate::core::calls::CallContext;
use crate::core::progress::{self, ProgressSink};
use crate::core::rate_limiter::Admission;
use crate::domain::{CallError, Lane, RemoteCall};

/// The worker's connection to its parent
pub struct ParentLink<R, W> {
    reader: Mutex<Lines<BufReader<R>>>,
    writer: Mutex<W>,
}

impl<R, W> ParentLink<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    pub fn new(reader: R, writer: W) -> Self {
        Self {
            reader: Mutex::new(BufReader::new(reader).lines()),
            writer: Mutex::new(writer),
        }
    }

    /// Write one message as a whole line
    pub async fn send(&self, message: &WorkerMessage) -> io::Result<()> {
        let line = encode_line(message)?;
        let mut writer = self.writer.lock().await;
        writer.write_all(line.as_bytes()).await?;
        writer.flush().await
    }

    async fn next_message(lines: &mut Lines<BufReader<R>>) -> io::Result<Option<ParentMessage>> {
        while let Some(line) = lines.next_line().await? {
            if line.trim().is_empty() {
                continue;
            }
            return decode_line(&line).map(Some).map_err(io::Error::from);
        }
        Ok(None)
    }

    /// Read the call this worker must run
    pub async fn receive_call(&self) -> io::Result<RemoteCall> {
        let mut reader = self.reader.lock().await;
        match Self::next_message(&mut reader).await? {
            Some(ParentMessage::Run { call }) => Ok(call),
            Some(other) => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("expected a run message, got {:?}", other),
            )),
            None => Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "parent closed the channel before sending a call",
            )),
        }
    }
}

#[async_trait]
impl<R, W> Admission for ParentLink<R, W>
where
    R: AsyncRead + Unpin + Send,
    W: AsyncWrite + Unpin + Send,
{
    /// Ask the parent's limiter; the reply is awaited under the reader lock
    async fn admit(&self, lane: Lane) -> Result<(), CallError> {
        let mut reader = self.reader.lock().await;
        self.send(&WorkerMessage::Acquire { lane })
            .await
            .map_err(|err| CallError::Worker(format!("failed to request admission: {}", err)))?;

        loop {
            match Self::next_message(&mut reader).await {
                Ok(Some(ParentMessage::Granted { lane: granted })) if granted == lane => return Ok(()),
                Ok(Some(other)) => warn!(?other, "Unexpected message while waiting for admission"),
                Ok(None) => {
                    return Err(CallError::Worker(
                        "parent closed the channel while waiting for admission".to_string(),
                    ))
                }
                Err(err) => return Err(CallError::Worker(err.to_string())),
            }
        }
    }
}

/// Serve exactly one call over `link`
///
/// `build` receives the remote admission gate and a sink relayed to the
/// parent. A context that cannot be built is reported as a failed call.
pub async fn serve_call<R, W, F>(link: Arc<ParentLink<R, W>>, build: F) -> io::Result<()>
where
    R: AsyncRead + Unpin + Send + 'static,
    W: AsyncWrite + Unpin + Send + 'static,
    F: FnOnce(Arc<dyn Admission>, ProgressSink) -> anyhow::Result<CallContext>,
{
    let call = link.receive_call().await?;
    debug!(call = %call.label(), "Worker received call");

    let (sink, mut stream) = progress::channel();
    let admission: Arc<dyn Admission> = link.clone();

    let execute = async {
        let outcome = match build(admission, sink.clone()) {
            Ok(context) => WireOutcome::from(context.execute(&call).await),
            Err(err) => WireOutcome::Err {
                error: format!("{:#}", err),
            },
        };
        sink.close();
        outcome
    };
    let forward = async {
        while let Some(event) = stream.next().await {
            if let Err(err) = link.send(&WorkerMessage::Progress { event }).await {
                warn!(error = %err, "Failed to relay progress to parent");
            }
        }
    };

    let (outcome, ()) = tokio::join!(execute, forward);
    link.send(&WorkerMessage::Done { outcome }).await
}
