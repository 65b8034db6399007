//! Parent side of process isolation.
//!
//! `ProcessRunner` spawns one worker process per call. The child is spawned
//! with `kill_on_drop`, so when the fan-out executor aborts the call's task
//! at the batch deadline the process is killed, whatever it was doing.

use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::{ChildStdin, Command};
use tokio::time::timeout;
use tracing::{debug, warn};

use super::protocol::{decode_line, encode_line, ParentMessage, WorkerMessage};
use crate::core::calls::CallRunner;
use crate::core::progress::ProgressSink;
use crate::core::rate_limiter::Admission;
use crate::domain::{CallError, CallOutput, RemoteCall};

/// How long a worker may take to exit after reporting its outcome
const EXIT_GRACE: Duration = Duration::from_secs(1);

/// Runs each call in its own worker process
pub struct ProcessRunner {
    program: PathBuf,
    args: Vec<String>,
    envs: Vec<(String, String)>,
    admission: Arc<dyn Admission>,
    sink: ProgressSink,
}

impl ProcessRunner {
    /// Workers are this executable's hidden `worker` subcommand
    pub fn current_exe(admission: Arc<dyn Admission>, sink: ProgressSink) -> Result<Self> {
        let program = std::env::current_exe().context("Failed to locate the newsfan executable")?;
        Ok(Self::with_command(program, ["worker"], admission, sink))
    }

    /// Use an arbitrary worker command speaking the worker protocol
    pub fn with_command<I, S>(
        program: impl Into<PathBuf>,
        args: I,
        admission: Arc<dyn Admission>,
        sink: ProgressSink,
    ) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        Self {
            program: program.into(),
            args: args.into_iter().map(Into::into).collect(),
            envs: Vec::new(),
            admission,
            sink,
        }
    }

    /// Set an environment variable for every worker
    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.envs.push((key.into(), value.into()));
        self
    }
}

async fn write_message(stdin: &mut ChildStdin, message: &ParentMessage) -> Result<(), CallError> {
    let line = encode_line(message).map_err(|err| CallError::Worker(err.to_string()))?;
    stdin
        .write_all(line.as_bytes())
        .await
        .map_err(|err| CallError::Worker(format!("failed to write to worker: {}", err)))?;
    stdin
        .flush()
        .await
        .map_err(|err| CallError::Worker(format!("failed to write to worker: {}", err)))
}

#[async_trait]
impl CallRunner for ProcessRunner {
    fn name(&self) -> &str {
        "process"
    }

    async fn run(&self, call: RemoteCall) -> Result<CallOutput, CallError> {
        let label = call.label();
        let mut child = Command::new(&self.program)
            .args(&self.args)
            .envs(self.envs.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::inherit())
            .kill_on_drop(true)
            .spawn()
            .map_err(|err| CallError::Worker(format!("failed to spawn worker: {}", err)))?;

        let (mut stdin, stdout) = match (child.stdin.take(), child.stdout.take()) {
            (Some(stdin), Some(stdout)) => (stdin, stdout),
            _ => return Err(CallError::Worker("worker pipes unavailable".to_string())),
        };
        let mut lines = BufReader::new(stdout).lines();

        debug!(call = %label, pid = ?child.id(), "Worker spawned");
        write_message(&mut stdin, &ParentMessage::Run { call }).await?;

        loop {
            let line = lines
                .next_line()
                .await
                .map_err(|err| CallError::Worker(format!("failed to read from worker: {}", err)))?;
            let line = match line {
                Some(line) => line,
                None => {
                    let status = child.wait().await.map_err(|err| CallError::Worker(err.to_string()))?;
                    return Err(CallError::Worker(format!(
                        "worker exited without a result ({})",
                        status
                    )));
                }
            };
            if line.trim().is_empty() {
                continue;
            }

            match decode_line::<WorkerMessage>(&line) {
                Ok(WorkerMessage::Acquire { lane }) => {
                    self.admission.admit(lane).await?;
                    write_message(&mut stdin, &ParentMessage::Granted { lane }).await?;
                }
                Ok(WorkerMessage::Progress { event }) => self.sink.send(event),
                Ok(WorkerMessage::Done { outcome }) => {
                    drop(stdin);
                    if timeout(EXIT_GRACE, child.wait()).await.is_err() {
                        debug!(call = %label, "Worker slow to exit after reporting, killing");
                    }
                    return outcome.into_result();
                }
                Err(err) => warn!(call = %label, error = %err, "Ignoring malformed worker line"),
            }
        }
    }
}
