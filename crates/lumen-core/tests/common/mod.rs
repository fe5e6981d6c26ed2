//! Interpreter doubles shared by the integration tests.

#![allow(dead_code)]

use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use lumen_core::protocol::{ExecutePayload, Frame, FrameDecoder, ResultPayload};
use lumen_core::model::{Artifact, ResultBody};
use lumen_core::{Result, SpawnedProcess, Spawner};
use tokio::io::{AsyncReadExt, AsyncWriteExt, DuplexStream, duplex};
use tokio::sync::mpsc;

/// The interpreter's ends of the pipes of one spawned session.
pub struct FakeInterpreter {
    pub key: String,
    input: DuplexStream,
    output: DuplexStream,
    decoder: FrameDecoder,
    queued: Vec<Frame>,
}

impl FakeInterpreter {
    pub async fn announce(&mut self) {
        self.send(&Frame::Ready).await;
    }

    pub async fn send(&mut self, frame: &Frame) {
        let line = frame.encode().unwrap();
        self.output.write_all(line.as_bytes()).await.unwrap();
    }

    pub async fn send_raw(&mut self, bytes: &[u8]) {
        self.output.write_all(bytes).await.unwrap();
    }

    /// Next frame written by the host, or `None` once stdin closed.
    pub async fn next_frame(&mut self) -> Option<Frame> {
        let mut buf = [0u8; 1024];
        loop {
            if !self.queued.is_empty() {
                return Some(self.queued.remove(0));
            }
            let n = self.input.read(&mut buf).await.ok()?;
            if n == 0 {
                return None;
            }
            self.queued.extend(self.decoder.push(&buf[..n]));
        }
    }

    pub async fn next_request(&mut self) -> ExecutePayload {
        match self.next_frame().await {
            Some(Frame::Execute(payload)) => payload,
            other => panic!("Expected an execute frame, got {:?}", other),
        }
    }

    pub async fn reply_text(&mut self, execution_id: &str, text: &str) {
        self.send(&Frame::Result(ResultPayload {
            execution_id: execution_id.to_string(),
            result: ResultBody {
                stdout: text.to_string(),
                stderr: String::new(),
                artifacts: vec![Artifact::text(text)],
            },
        }))
        .await;
    }

    /// Simulate the process dying.
    pub fn crash(self) {}
}

/// Spawner handing each new interpreter to the test through a channel.
pub struct ChannelSpawner {
    pub spawned: AtomicUsize,
    tx: mpsc::UnboundedSender<FakeInterpreter>,
}

impl ChannelSpawner {
    pub fn new() -> (Arc<Self>, mpsc::UnboundedReceiver<FakeInterpreter>) {
        let (tx, rx) = mpsc::unbounded_channel();
        let spawner = Arc::new(Self {
            spawned: AtomicUsize::new(0),
            tx,
        });
        (spawner, rx)
    }

    pub fn count(&self) -> usize {
        self.spawned.load(Ordering::SeqCst)
    }
}

impl Spawner for ChannelSpawner {
    fn spawn(&self, key: &str) -> Result<SpawnedProcess> {
        self.spawned.fetch_add(1, Ordering::SeqCst);
        let (host_in, interp_in) = duplex(64 * 1024);
        let (interp_out, host_out) = duplex(64 * 1024);
        let _ = self.tx.send(FakeInterpreter {
            key: key.to_string(),
            input: interp_in,
            output: interp_out,
            decoder: FrameDecoder::new(),
            queued: Vec::new(),
        });
        Ok(SpawnedProcess::from_streams(host_in, host_out, None))
    }
}

/// Spawner whose interpreters answer by interpreting code as a tiny script:
/// each line `kind:payload` becomes one artifact; `fail` raises an error.
pub struct ScriptSpawner {
    pub spawned: AtomicUsize,
}

impl ScriptSpawner {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            spawned: AtomicUsize::new(0),
        })
    }
}

impl Spawner for ScriptSpawner {
    fn spawn(&self, _key: &str) -> Result<SpawnedProcess> {
        self.spawned.fetch_add(1, Ordering::SeqCst);
        let (host_in, interp_in) = duplex(64 * 1024);
        let (interp_out, host_out) = duplex(64 * 1024);
        tokio::spawn(run_script_interpreter(interp_in, interp_out));
        Ok(SpawnedProcess::from_streams(host_in, host_out, None))
    }
}

async fn run_script_interpreter(mut input: DuplexStream, mut output: DuplexStream) {
    if output.write_all(b"PYTHON_SESSION_READY\n").await.is_err() {
        return;
    }
    let mut decoder = FrameDecoder::new();
    let mut buf = [0u8; 4096];
    loop {
        let n = match input.read(&mut buf).await {
            Ok(0) | Err(_) => return,
            Ok(n) => n,
        };
        for frame in decoder.push(&buf[..n]) {
            let request = match frame {
                Frame::Execute(request) => request,
                Frame::Exit => return,
                _ => continue,
            };
            let artifacts = request
                .code
                .lines()
                .filter_map(|line| {
                    if line == "fail" {
                        return Some(Artifact::error("RuntimeError: fail"));
                    }
                    let (kind, payload) = line.split_once(':')?;
                    match kind {
                        "text" => Some(Artifact::text(payload)),
                        "image" => Some(Artifact::image(payload)),
                        _ => None,
                    }
                })
                .collect();
            let reply = Frame::Result(ResultPayload {
                execution_id: request.execution_id,
                result: ResultBody {
                    stdout: String::new(),
                    stderr: String::new(),
                    artifacts,
                },
            });
            if output
                .write_all(reply.encode().unwrap().as_bytes())
                .await
                .is_err()
            {
                return;
            }
        }
    }
}
