//! Log streaming for one run
//!
//! A [`LogStreamer`] is spawned by the coordinator once a run is loggable.
//! It attaches to the resource's output on its own task and forwards lines
//! into a bounded channel; the caller consumes them as a [`LogStream`].
//! Failures end the stream and are reported through [`LogStream::finish`],
//! never through the run outcome.

use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use flowpod_core::{ClusterClient, RunId, StreamError};
use futures::{Stream, StreamExt};
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Handle to a spawned log forwarding task
#[derive(Debug)]
pub struct LogStreamer {
    attached: Option<oneshot::Receiver<()>>,
    stream: LogStream,
}

impl LogStreamer {
    /// Start forwarding `run_id`'s output into a channel of `buffer` lines
    pub fn spawn(cluster: Arc<dyn ClusterClient>, run_id: RunId, buffer: usize) -> Self {
        let (lines_tx, lines_rx) = mpsc::channel(buffer.max(1));
        let (attached_tx, attached_rx) = oneshot::channel();

        let task = tokio::spawn(forward(cluster, run_id.clone(), lines_tx, attached_tx));

        Self {
            attached: Some(attached_rx),
            stream: LogStream {
                run_id,
                lines: lines_rx,
                task,
            },
        }
    }

    pub fn run_id(&self) -> &RunId {
        &self.stream.run_id
    }

    /// Wait until the attach call has completed, successfully or not
    pub async fn wait_attached(&mut self) {
        if let Some(attached) = self.attached.take() {
            let _ = attached.await;
        }
    }

    /// Stop forwarding immediately
    pub fn abort(self) {
        self.stream.task.abort();
    }

    pub fn into_stream(self) -> LogStream {
        self.stream
    }
}

async fn forward(
    cluster: Arc<dyn ClusterClient>,
    run_id: RunId,
    lines: mpsc::Sender<String>,
    attached: oneshot::Sender<()>,
) -> Result<u64, StreamError> {
    let output = cluster.output_stream(&run_id).await;
    let _ = attached.send(());

    let mut output = output.map_err(|e| interrupted(&run_id, e.to_string()))?;
    debug!(run_id = %run_id, "Log streamer attached");

    let mut forwarded = 0u64;
    while let Some(item) = output.next().await {
        match item {
            Ok(line) => {
                if lines.send(strip_line_terminator(line)).await.is_err() {
                    debug!(run_id = %run_id, "Log consumer dropped, stopping");
                    break;
                }
                forwarded += 1;
            }
            Err(e) => return Err(interrupted(&run_id, e.to_string())),
        }
    }

    debug!(run_id = %run_id, lines = forwarded, "Log stream ended");
    Ok(forwarded)
}

fn interrupted(run_id: &RunId, reason: String) -> StreamError {
    warn!(run_id = %run_id, reason = %reason, "Log stream interrupted");
    StreamError::Interrupted {
        run_id: run_id.clone(),
        reason,
    }
}

fn strip_line_terminator(mut line: String) -> String {
    let len = line.trim_end_matches(['\r', '\n']).len();
    line.truncate(len);
    line
}

/// Output lines of one run
///
/// Finite and not restartable: it ends when the resource's output ends.
/// Use [`finish`](Self::finish) to learn whether it ended normally.
#[derive(Debug)]
pub struct LogStream {
    run_id: RunId,
    lines: mpsc::Receiver<String>,
    task: JoinHandle<Result<u64, StreamError>>,
}

impl LogStream {
    pub fn run_id(&self) -> &RunId {
        &self.run_id
    }

    /// Discard any remaining lines and report how the stream ended
    ///
    /// # Errors
    ///
    /// Returns `StreamError::Interrupted` if attaching or reading failed.
    pub async fn finish(mut self) -> Result<u64, StreamError> {
        while self.lines.recv().await.is_some() {}
        self.join().await
    }

    /// Read every remaining line, then report how the stream ended
    pub async fn collect_lines(mut self) -> (Vec<String>, Result<u64, StreamError>) {
        let mut collected = Vec::new();
        while let Some(line) = self.lines.recv().await {
            collected.push(line);
        }
        let result = self.join().await;
        (collected, result)
    }

    async fn join(self) -> Result<u64, StreamError> {
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(StreamError::Interrupted {
                run_id: self.run_id,
                reason: e.to_string(),
            }),
        }
    }
}

impl Stream for LogStream {
    type Item = String;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.lines.poll_recv(cx)
    }
}
