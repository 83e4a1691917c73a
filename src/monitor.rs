//! Readers for the engine's stdout and stderr.
//!
//! Protocol traffic goes over the socket, so anything the engine prints on its
//! standard streams is diagnostics: startup failures, Lisp backtraces, library
//! warnings. Each line is logged and forwarded to the session.

use serde::Serialize;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tracing::{debug, warn};

/// Which standard stream a diagnostic line came from
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum DiagnosticStream {
    Stdout,
    Stderr,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DiagnosticLine {
    pub stream: DiagnosticStream,
    pub line: String,
}

/// Line reader for one standard stream
pub struct StreamMonitor {
    stream: DiagnosticStream,
    tx: mpsc::UnboundedSender<DiagnosticLine>,
    lines: usize,
}

impl StreamMonitor {
    pub fn new(stream: DiagnosticStream, tx: mpsc::UnboundedSender<DiagnosticLine>) -> Self {
        Self {
            stream,
            tx,
            lines: 0,
        }
    }

    /// Number of non-empty lines forwarded so far
    pub fn lines(&self) -> usize {
        self.lines
    }

    /// Read until EOF, forwarding every non-empty line
    pub async fn monitor_stream<R>(&mut self, reader: &mut BufReader<R>)
    where
        R: AsyncRead + Unpin,
    {
        let mut raw = Vec::new();
        loop {
            raw.clear();
            match reader.read_until(b'\n', &mut raw).await {
                Ok(0) => {
                    debug!(stream = ?self.stream, "engine stream closed");
                    break;
                }
                Ok(_) => {
                    let line = String::from_utf8_lossy(&raw);
                    let line = line.trim_end();
                    if line.is_empty() {
                        continue;
                    }
                    debug!(stream = ?self.stream, "engine: {}", line);
                    self.lines += 1;
                    let sent = self.tx.send(DiagnosticLine {
                        stream: self.stream,
                        line: line.to_string(),
                    });
                    if sent.is_err() {
                        debug!("diagnostic receiver gone; stopping monitor");
                        break;
                    }
                }
                Err(e) => {
                    warn!(stream = ?self.stream, "engine stream read error: {}", e);
                    break;
                }
            }
        }
    }
}

/// Spawn monitor tasks for the engine's stdout and stderr.
///
/// Either stream may be absent; the corresponding task then finishes at once.
pub fn spawn_monitors<O, E>(
    stdout: Option<BufReader<O>>,
    stderr: Option<BufReader<E>>,
    tx: mpsc::UnboundedSender<DiagnosticLine>,
) -> (JoinHandle<usize>, JoinHandle<usize>)
where
    O: AsyncRead + Unpin + Send + 'static,
    E: AsyncRead + Unpin + Send + 'static,
{
    let stdout_tx = tx.clone();
    let stdout_handle = tokio::spawn(async move {
        let mut monitor = StreamMonitor::new(DiagnosticStream::Stdout, stdout_tx);
        if let Some(mut stdout) = stdout {
            monitor.monitor_stream(&mut stdout).await;
        }
        monitor.lines()
    });

    let stderr_handle = tokio::spawn(async move {
        let mut monitor = StreamMonitor::new(DiagnosticStream::Stderr, tx);
        if let Some(mut stderr) = stderr {
            monitor.monitor_stream(&mut stderr).await;
        }
        monitor.lines()
    });

    (stdout_handle, stderr_handle)
}
