//! Output batching.
//!
//! Shells write in many small pieces: one per line, per prompt redraw, or
//! per progress update. The [`OutputAggregator`] collects them and emits a
//! single [`OutputChunk`] once the shell has been quiet for the configured
//! window, so a command's output arrives as one chat message.

use std::time::{Duration, SystemTime};

use bytes::{Bytes, BytesMut};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use super::pty::{PtyOutput, ReadOutcome};

/// A batch of raw shell output.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputChunk {
    /// Raw bytes as read from the terminal. Never empty.
    pub data: Bytes,
    /// When the first byte of the batch arrived.
    pub started_at: SystemTime,
    /// When the batch was flushed.
    pub finished_at: SystemTime,
}

impl OutputChunk {
    /// Decodes the batch as UTF-8, replacing invalid sequences.
    pub fn text(&self) -> String {
        String::from_utf8_lossy(&self.data).into_owned()
    }
}

/// Why the aggregator stopped producing chunks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FinishReason {
    /// The terminal reached EOF.
    ChildExited,
    /// Shutdown was requested.
    Shutdown,
    /// The chunk receiver went away.
    SinkClosed,
}

/// Groups terminal output into quiet-window-delimited chunks.
pub struct OutputAggregator {
    output: PtyOutput,
    quiet_window: Duration,
    buffer: BytesMut,
    started_at: Option<SystemTime>,
    finished: Option<FinishReason>,
}

impl OutputAggregator {
    /// Creates an aggregator over `output`, flushing after `quiet_window`
    /// without new data.
    pub fn new(output: PtyOutput, quiet_window: Duration) -> Self {
        Self {
            output,
            quiet_window,
            buffer: BytesMut::new(),
            started_at: None,
            finished: None,
        }
    }

    /// Returns why the aggregator finished, if it has.
    pub fn finish_reason(&self) -> Option<FinishReason> {
        self.finished
    }

    /// Waits for the next chunk.
    ///
    /// Returns `None` once the terminal has closed or `shutdown` was
    /// cancelled and any pending bytes have been handed out. Shutdown is
    /// only noticed at a quiet-window boundary, so output already in flight
    /// is still delivered.
    pub async fn next_chunk(&mut self, shutdown: &CancellationToken) -> Option<OutputChunk> {
        loop {
            if self.finished.is_some() {
                return self.flush();
            }

            match self.output.read_available(self.quiet_window).await {
                ReadOutcome::Data(data) => {
                    if data.is_empty() {
                        continue;
                    }
                    if self.started_at.is_none() {
                        self.started_at = Some(SystemTime::now());
                    }
                    self.buffer.extend_from_slice(&data);
                }
                ReadOutcome::Timeout => {
                    if shutdown.is_cancelled() {
                        self.finished = Some(FinishReason::Shutdown);
                        return self.flush();
                    }
                    if let Some(chunk) = self.flush() {
                        return Some(chunk);
                    }
                }
                ReadOutcome::Eof => {
                    tracing::debug!(pending = self.buffer.len(), "Shell output closed");
                    self.finished = Some(FinishReason::ChildExited);
                    return self.flush();
                }
            }
        }
    }

    /// Feeds every chunk into `sink` until the aggregator finishes.
    pub async fn run(
        mut self,
        sink: mpsc::Sender<OutputChunk>,
        shutdown: CancellationToken,
    ) -> FinishReason {
        while let Some(chunk) = self.next_chunk(&shutdown).await {
            if sink.send(chunk).await.is_err() {
                return FinishReason::SinkClosed;
            }
        }
        self.finished.unwrap_or(FinishReason::Shutdown)
    }

    fn flush(&mut self) -> Option<OutputChunk> {
        if self.buffer.is_empty() {
            return None;
        }
        let data = self.buffer.split().freeze();
        let finished_at = SystemTime::now();
        let started_at = self.started_at.take().unwrap_or(finished_at);
        tracing::trace!(bytes = data.len(), "Flushing output chunk");
        Some(OutputChunk {
            data,
            started_at,
            finished_at,
        })
    }
}
