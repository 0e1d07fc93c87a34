//! Output fan-out for command runs
//!
//! Each stream of a process or session is read by exactly one [`Fanout`]. A
//! fan-out keeps its own capture buffer and forwards every chunk to a fixed
//! set of taps chosen when it is built: the combined buffer used for failure
//! diagnostics, and the log sink when the [`LogMode`] selects that stream.

use std::sync::Arc;

use tokio::io::{AsyncRead, AsyncReadExt};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::info;

use crate::spec::LogMode;

const READ_CHUNK: usize = 8 * 1024;

/// Which stream a chunk came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StreamKind {
    Stdout,
    Stderr,
}

/// Receives mirrored command output and status messages
pub trait LogSink: Send + Sync {
    /// One complete line of command output
    fn log_line(&self, stream: StreamKind, line: &str);

    /// A progress message such as a dial retry
    fn status(&self, message: &str);
}

/// Log sink that emits `tracing` events
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingSink;

impl LogSink for TracingSink {
    fn log_line(&self, stream: StreamKind, line: &str) {
        info!(target: "shellwright::output", stream = ?stream, "{line}");
    }

    fn status(&self, message: &str) {
        info!(target: "shellwright::status", "{message}");
    }
}

#[derive(Debug)]
struct Chunk {
    stream: StreamKind,
    data: Vec<u8>,
}

/// One reader's view of the output: a capture buffer plus its taps
#[derive(Debug)]
pub struct Fanout {
    stream: StreamKind,
    captured: Vec<u8>,
    taps: Vec<mpsc::UnboundedSender<Chunk>>,
}

impl Fanout {
    /// Record a chunk and forward it to every tap
    pub fn write(&mut self, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        self.captured.extend_from_slice(data);
        for tap in &self.taps {
            // a closed tap only means its consumer has already finished
            let _ = tap.send(Chunk {
                stream: self.stream,
                data: data.to_vec(),
            });
        }
    }

    /// Read `reader` to end of stream, then return the captured bytes
    ///
    /// # Errors
    /// Returns the underlying I/O error if a read fails
    pub async fn drain<R>(mut self, mut reader: R) -> std::io::Result<Vec<u8>>
    where
        R: AsyncRead + Unpin,
    {
        let mut buf = vec![0u8; READ_CHUNK];
        loop {
            let n = reader.read(&mut buf).await?;
            if n == 0 {
                break;
            }
            self.write(&buf[..n]);
        }
        Ok(self.finish())
    }

    /// Close the taps and hand back the captured bytes
    #[must_use]
    pub fn finish(self) -> Vec<u8> {
        self.captured
    }
}

/// Owns the consumers behind the taps of one stdout/stderr fan-out pair
pub struct Multiplexer {
    combined: JoinHandle<Vec<u8>>,
    logger: Option<JoinHandle<()>>,
}

impl Multiplexer {
    /// Build the stdout and stderr fan-outs for one invocation
    ///
    /// Log gating is fixed here: a stream not selected by `mode` never gets
    /// a log tap.
    pub fn new(mode: LogMode, sink: Arc<dyn LogSink>) -> (Self, Fanout, Fanout) {
        let (combined_tx, combined_rx) = mpsc::unbounded_channel();
        let combined = tokio::spawn(collect(combined_rx));

        let mut stdout_taps = vec![combined_tx.clone()];
        let mut stderr_taps = vec![combined_tx];

        let logger = if mode == LogMode::None {
            None
        } else {
            let (log_tx, log_rx) = mpsc::unbounded_channel();
            if mode.logs_stdout() {
                stdout_taps.push(log_tx.clone());
            }
            if mode.logs_stderr() {
                stderr_taps.push(log_tx);
            }
            Some(tokio::spawn(log_lines(log_rx, sink)))
        };

        let stdout = Fanout {
            stream: StreamKind::Stdout,
            captured: Vec::new(),
            taps: stdout_taps,
        };
        let stderr = Fanout {
            stream: StreamKind::Stderr,
            captured: Vec::new(),
            taps: stderr_taps,
        };
        (Self { combined, logger }, stdout, stderr)
    }

    /// Wait for every consumer and return the combined output
    ///
    /// Completes once both fan-outs have been finished or dropped.
    pub async fn finish(self) -> Vec<u8> {
        if let Some(logger) = self.logger {
            let _ = logger.await;
        }
        self.combined.await.unwrap_or_default()
    }
}

async fn collect(mut rx: mpsc::UnboundedReceiver<Chunk>) -> Vec<u8> {
    let mut combined = Vec::new();
    while let Some(chunk) = rx.recv().await {
        combined.extend_from_slice(&chunk.data);
    }
    combined
}

async fn log_lines(mut rx: mpsc::UnboundedReceiver<Chunk>, sink: Arc<dyn LogSink>) {
    let mut stdout = LineBuffer::default();
    let mut stderr = LineBuffer::default();
    while let Some(chunk) = rx.recv().await {
        let buffer = match chunk.stream {
            StreamKind::Stdout => &mut stdout,
            StreamKind::Stderr => &mut stderr,
        };
        buffer.push(&chunk.data, |line| sink.log_line(chunk.stream, line));
    }
    stdout.flush(|line| sink.log_line(StreamKind::Stdout, line));
    stderr.flush(|line| sink.log_line(StreamKind::Stderr, line));
}

/// Splits a byte stream into lines, holding back an unterminated tail
#[derive(Debug, Default)]
struct LineBuffer {
    pending: Vec<u8>,
}

impl LineBuffer {
    fn push(&mut self, data: &[u8], mut emit: impl FnMut(&str)) {
        self.pending.extend_from_slice(data);
        while let Some(pos) = self.pending.iter().position(|&b| b == b'\n') {
            let line: Vec<u8> = self.pending.drain(..=pos).collect();
            emit(&decode_line(&line[..pos]));
        }
    }

    fn flush(&mut self, mut emit: impl FnMut(&str)) {
        if !self.pending.is_empty() {
            let line = std::mem::take(&mut self.pending);
            emit(&decode_line(&line));
        }
    }
}

fn decode_line(bytes: &[u8]) -> String {
    let bytes = bytes.strip_suffix(b"\r").unwrap_or(bytes);
    String::from_utf8_lossy(bytes).into_owned()
}
