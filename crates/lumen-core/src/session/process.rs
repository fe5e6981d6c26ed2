//! One interpreter subprocess and its pipes.
//!
//! Three tasks serve a process:
//! - a writer draining an ordered outbound queue into stdin,
//! - a monitor reading stdout through the frame decoder and watching for exit,
//! - a stderr collector keeping a bounded tail of diagnostic lines.
//!
//! The monitor is the only task that reports termination, so
//! [`ProcessEvent::Terminated`] is delivered exactly once.

use std::collections::VecDeque;
use std::sync::{Arc, Mutex};

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::process::Child;
use tokio::sync::{mpsc, oneshot};

use crate::error::{Error, Result};
use crate::protocol::{Frame, FrameDecoder, LineDecoder, ResultPayload};

use super::spawn::{BoxedReader, BoxedWriter, SpawnedProcess};

const READ_CHUNK: usize = 8 * 1024;

/// Something the interpreter did.
#[derive(Debug, Clone, PartialEq)]
pub enum ProcessEvent {
    /// The ready sentinel was seen.
    Ready,
    /// A response frame arrived.
    Response(ResultPayload),
    /// stdout closed and/or the process exited; carries a description.
    Terminated(String),
}

/// Shared, bounded buffer of the last stderr lines of a process.
#[derive(Debug, Clone)]
pub struct StderrTail {
    lines: Arc<Mutex<VecDeque<String>>>,
    capacity: usize,
}

impl StderrTail {
    pub fn new(capacity: usize) -> Self {
        Self {
            lines: Arc::new(Mutex::new(VecDeque::with_capacity(capacity))),
            capacity,
        }
    }

    fn push(&self, line: String) {
        if self.capacity == 0 {
            return;
        }
        if let Ok(mut lines) = self.lines.lock() {
            if lines.len() == self.capacity {
                lines.pop_front();
            }
            lines.push_back(line);
        }
    }

    /// Snapshot of the buffered lines, oldest first.
    pub fn lines(&self) -> Vec<String> {
        self.lines
            .lock()
            .map(|lines| lines.iter().cloned().collect())
            .unwrap_or_default()
    }

    pub fn last(&self) -> Option<String> {
        self.lines.lock().ok().and_then(|lines| lines.back().cloned())
    }
}

/// Handle to a running interpreter process.
pub struct SessionProcess {
    key: String,
    pid: Option<u32>,
    outbound: Option<mpsc::UnboundedSender<String>>,
    kill: Option<oneshot::Sender<()>>,
    events: mpsc::UnboundedReceiver<ProcessEvent>,
    stderr_tail: StderrTail,
}

impl SessionProcess {
    /// Start serving a spawned process. Must be called inside a tokio runtime.
    pub fn start(key: impl Into<String>, spawned: SpawnedProcess, stderr_lines: usize) -> Self {
        let key = key.into();
        let pid = spawned.pid();
        let SpawnedProcess {
            stdin,
            stdout,
            stderr,
            child,
        } = spawned;

        let (outbound_tx, outbound_rx) = mpsc::unbounded_channel();
        let (event_tx, event_rx) = mpsc::unbounded_channel();
        let (kill_tx, kill_rx) = oneshot::channel();
        let stderr_tail = StderrTail::new(stderr_lines);

        tokio::spawn(write_loop(key.clone(), stdin, outbound_rx));
        tokio::spawn(monitor(key.clone(), stdout, child, kill_rx, event_tx));
        if let Some(stderr) = stderr {
            tokio::spawn(collect_stderr(key.clone(), stderr, stderr_tail.clone()));
        }

        Self {
            key,
            pid,
            outbound: Some(outbound_tx),
            kill: Some(kill_tx),
            events: event_rx,
            stderr_tail,
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn stderr_tail(&self) -> &StderrTail {
        &self.stderr_tail
    }

    /// Queue a frame for the process's stdin. Frames go out in call order.
    pub fn write(&self, frame: &Frame) -> Result<()> {
        let line = frame.encode()?;
        let outbound = self
            .outbound
            .as_ref()
            .ok_or_else(|| Error::SessionTerminated("stdin already closed".to_string()))?;
        outbound
            .send(line)
            .map_err(|_| Error::SessionTerminated("stdin writer stopped".to_string()))
    }

    /// Close stdin once the queued frames have been written.
    pub fn close_stdin(&mut self) {
        self.outbound = None;
    }

    /// Force-terminate the process. The termination event still follows.
    pub fn kill(&mut self) {
        if let Some(kill) = self.kill.take() {
            let _ = kill.send(());
        }
    }

    /// Next event, or `None` once the termination event has been consumed.
    pub async fn next_event(&mut self) -> Option<ProcessEvent> {
        self.events.recv().await
    }
}

async fn write_loop(key: String, mut stdin: BoxedWriter, mut outbound: mpsc::UnboundedReceiver<String>) {
    while let Some(line) = outbound.recv().await {
        let written: std::io::Result<()> = async {
            stdin.write_all(line.as_bytes()).await?;
            stdin.flush().await
        }
        .await;

        if let Err(e) = written {
            tracing::warn!("Failed to write to interpreter '{}': {}", key, e);
            break;
        }
    }
    let _ = stdin.shutdown().await;
    tracing::debug!("Closed stdin of interpreter '{}'", key);
}

async fn monitor(
    key: String,
    mut stdout: BoxedReader,
    child: Option<Child>,
    mut kill: oneshot::Receiver<()>,
    events: mpsc::UnboundedSender<ProcessEvent>,
) {
    let mut decoder = FrameDecoder::new();
    let mut buf = vec![0u8; READ_CHUNK];
    // Dropping the kill sender (handle gone) counts as a kill request.
    let mut killed = false;

    loop {
        tokio::select! {
            read = stdout.read(&mut buf) => match read {
                Ok(0) => break,
                Ok(n) => {
                    for frame in decoder.push(&buf[..n]) {
                        forward(&key, frame, &events);
                    }
                }
                Err(e) => {
                    tracing::warn!("Failed to read from interpreter '{}': {}", key, e);
                    break;
                }
            },
            _ = &mut kill, if !killed => {
                killed = true;
                break;
            }
        }
    }
    if let Some(frame) = decoder.finish() {
        forward(&key, frame, &events);
    }
    drop(stdout);

    let cause = match child {
        Some(mut child) => {
            if killed {
                let _ = child.start_kill();
            }
            let status = if killed {
                child.wait().await
            } else {
                tokio::select! {
                    status = child.wait() => status,
                    _ = &mut kill => {
                        killed = true;
                        let _ = child.start_kill();
                        child.wait().await
                    }
                }
            };
            match status {
                Ok(status) if killed => format!("killed ({})", status),
                Ok(status) => format!("process exited with {}", status),
                Err(e) => format!("failed to wait for process: {}", e),
            }
        }
        None if killed => "killed".to_string(),
        None => "output stream closed".to_string(),
    };

    tracing::info!("Interpreter '{}' terminated: {}", key, cause);
    let _ = events.send(ProcessEvent::Terminated(cause));
}

fn forward(key: &str, frame: Frame, events: &mpsc::UnboundedSender<ProcessEvent>) {
    let event = match frame {
        Frame::Ready => ProcessEvent::Ready,
        Frame::Result(payload) => ProcessEvent::Response(payload),
        other => {
            tracing::debug!("Ignoring host-side frame from interpreter '{}': {:?}", key, other);
            return;
        }
    };
    let _ = events.send(event);
}

async fn collect_stderr(key: String, mut stderr: BoxedReader, tail: StderrTail) {
    // Keep draining until EOF whatever the bytes are; a closed pipe would
    // kill the interpreter on its next write.
    let mut decoder = LineDecoder::new();
    let mut buf = vec![0u8; READ_CHUNK];
    loop {
        match stderr.read(&mut buf).await {
            Ok(0) => break,
            Ok(n) => {
                for line in decoder.push(&buf[..n]) {
                    record_stderr(&key, &tail, line);
                }
            }
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => {
                tracing::debug!("Stopped reading stderr of '{}': {}", key, e);
                break;
            }
        }
    }
    if let Some(line) = decoder.finish() {
        record_stderr(&key, &tail, line);
    }
}

fn record_stderr(key: &str, tail: &StderrTail, line: String) {
    tracing::debug!(session = %key, "stderr: {}", line);
    tail.push(line);
}
