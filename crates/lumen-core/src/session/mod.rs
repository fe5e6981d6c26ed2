//! Persistent interpreter sessions.
//!
//! A [`Session`] is a cheap handle; the actual work happens in a driver task
//! that owns the process, the pending-execution map and the startup queue.
//! Handles talk to the driver over a command channel, so no lock guards the
//! pending map.
//!
//! ```text
//! Starting --ready sentinel--> Ready --shutdown / process exit--> Terminating --> Terminated
//!     \------------------- ready timeout / early exit ----------------------------/
//! ```

mod correlator;
mod process;
mod registry;
mod spawn;

pub use correlator::{ExecutionCorrelator, PendingEntry, Reply};
pub use process::{ProcessEvent, SessionProcess, StderrTail};
pub use registry::SessionRegistry;
pub use spawn::{BoxedReader, BoxedWriter, CommandSpawner, SESSION_KEY_ENV, SpawnedProcess, Spawner};

use std::collections::VecDeque;
use std::fmt;
use std::sync::{Arc, Mutex, OnceLock};
use std::time::Duration;

use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::Instant;

use crate::config::SessionConfig;
use crate::error::{Error, Result};
use crate::model::ExecutionResult;
use crate::protocol::{ExecutePayload, Frame};

/// Lifecycle state of a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SessionState {
    /// Process spawned, ready sentinel not seen yet.
    Starting,
    /// Accepting executions.
    Ready,
    /// Shutting down or reacting to an exit.
    Terminating,
    /// Gone; every pending call has been settled.
    Terminated,
}

impl fmt::Display for SessionState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Starting => "starting",
            Self::Ready => "ready",
            Self::Terminating => "terminating",
            Self::Terminated => "terminated",
        };
        f.write_str(name)
    }
}

enum SessionCommand {
    Submit {
        code: String,
        timeout: Duration,
        reply: Reply,
    },
    Shutdown {
        grace: Duration,
        done: oneshot::Sender<()>,
    },
}

/// Handle to one persistent interpreter session.
pub struct Session {
    key: String,
    pid: Option<u32>,
    commands: mpsc::UnboundedSender<SessionCommand>,
    state: watch::Receiver<SessionState>,
    cause: Arc<OnceLock<Error>>,
    last_activity: Arc<Mutex<Instant>>,
    stderr_tail: StderrTail,
    execution_timeout: Duration,
    shutdown_grace: Duration,
}

impl fmt::Debug for Session {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Session")
            .field("key", &self.key)
            .field("pid", &self.pid)
            .field("state", &self.state())
            .finish()
    }
}

impl Session {
    /// Start driving a spawned process. Must be called inside a tokio runtime.
    ///
    /// The session is returned in `Starting`; use [`wait_ready`](Self::wait_ready)
    /// to wait for the sentinel. Submissions made before that are queued.
    pub fn launch(key: impl Into<String>, spawned: SpawnedProcess, config: &SessionConfig) -> Self {
        let key = key.into();
        let process = SessionProcess::start(key.clone(), spawned, config.stderr_tail_lines);
        let pid = process.pid();
        let stderr_tail = process.stderr_tail().clone();

        let (command_tx, command_rx) = mpsc::unbounded_channel();
        let (state_tx, state_rx) = watch::channel(SessionState::Starting);
        let cause = Arc::new(OnceLock::new());
        let last_activity = Arc::new(Mutex::new(Instant::now()));

        let driver = Driver {
            key: key.clone(),
            process,
            correlator: ExecutionCorrelator::new(key.clone()),
            unsent: VecDeque::new(),
            commands: command_rx,
            state: state_tx,
            cause: cause.clone(),
            last_activity: last_activity.clone(),
            ready_deadline: Instant::now() + config.ready_timeout(),
            ready_timeout: config.ready_timeout(),
            shutdown_grace: config.shutdown_grace(),
        };
        tokio::spawn(driver.run());

        Self {
            key,
            pid,
            commands: command_tx,
            state: state_rx,
            cause,
            last_activity,
            stderr_tail,
            execution_timeout: config.execution_timeout(),
            shutdown_grace: config.shutdown_grace(),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    /// OS process ID, when backed by a real process.
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn state(&self) -> SessionState {
        *self.state.borrow()
    }

    pub fn is_terminated(&self) -> bool {
        matches!(self.state(), SessionState::Terminating | SessionState::Terminated)
    }

    /// Time since the last submission or response.
    pub fn idle_for(&self) -> Duration {
        self.last_activity
            .lock()
            .map(|at| at.elapsed())
            .unwrap_or_default()
    }

    /// Recent stderr lines of the interpreter.
    pub fn stderr_tail(&self) -> Vec<String> {
        self.stderr_tail.lines()
    }

    /// Why the session ended, once it has.
    pub fn termination_cause(&self) -> Option<Error> {
        self.cause.get().cloned()
    }

    /// Wait until the session is `Ready`, or fail with the reason it never got there.
    pub async fn wait_ready(&self) -> Result<()> {
        let mut state = self.state.clone();
        let reached = state
            .wait_for(|s| matches!(s, SessionState::Ready | SessionState::Terminating | SessionState::Terminated))
            .await
            .map(|s| *s);

        match reached {
            Ok(SessionState::Ready) => Ok(()),
            _ => Err(self.closed_error()),
        }
    }

    /// Execute code with the session's default deadline.
    pub async fn submit(&self, code: impl Into<String>) -> Result<ExecutionResult> {
        self.submit_with_timeout(code, self.execution_timeout).await
    }

    /// Execute code, giving up after `timeout`.
    ///
    /// A timeout fails only this call; the interpreter keeps running and its
    /// eventual answer is dropped.
    pub async fn submit_with_timeout(
        &self,
        code: impl Into<String>,
        timeout: Duration,
    ) -> Result<ExecutionResult> {
        let (reply, rx) = oneshot::channel();
        self.commands
            .send(SessionCommand::Submit {
                code: code.into(),
                timeout,
                reply,
            })
            .map_err(|_| self.closed_error())?;

        rx.await.map_err(|_| self.closed_error())?
    }

    /// Ask the interpreter to exit, killing it after the grace period.
    ///
    /// Pending calls fail with [`Error::SessionShuttingDown`].
    pub async fn shutdown(&self) {
        self.shutdown_with_grace(self.shutdown_grace).await;
    }

    pub async fn shutdown_with_grace(&self, grace: Duration) {
        let (done, rx) = oneshot::channel();
        if self
            .commands
            .send(SessionCommand::Shutdown { grace, done })
            .is_ok()
        {
            // Err means the driver already finished.
            let _ = rx.await;
        }
    }

    fn closed_error(&self) -> Error {
        self.termination_cause()
            .unwrap_or_else(|| Error::SessionTerminated("session driver stopped".to_string()))
    }
}

struct Driver {
    key: String,
    process: SessionProcess,
    correlator: ExecutionCorrelator,
    /// Requests submitted while `Starting`, written once ready.
    unsent: VecDeque<ExecutePayload>,
    commands: mpsc::UnboundedReceiver<SessionCommand>,
    state: watch::Sender<SessionState>,
    cause: Arc<OnceLock<Error>>,
    last_activity: Arc<Mutex<Instant>>,
    ready_deadline: Instant,
    ready_timeout: Duration,
    shutdown_grace: Duration,
}

impl Driver {
    async fn run(mut self) {
        loop {
            let starting = self.current() == SessionState::Starting;
            let next_deadline = self.correlator.next_deadline();
            let expiry = next_deadline.unwrap_or(self.ready_deadline);

            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(SessionCommand::Submit { code, timeout, reply }) => {
                        self.submit(code, timeout, reply);
                    }
                    Some(SessionCommand::Shutdown { grace, done }) => {
                        self.shutdown(grace).await;
                        let _ = done.send(());
                        break;
                    }
                    None => {
                        tracing::debug!("All handles to session '{}' dropped", self.key);
                        let grace = self.shutdown_grace;
                        self.shutdown(grace).await;
                        break;
                    }
                },
                event = self.process.next_event() => match event {
                    Some(ProcessEvent::Ready) => self.on_ready(),
                    Some(ProcessEvent::Response(payload)) => {
                        self.touch();
                        self.correlator.resolve(payload);
                    }
                    Some(ProcessEvent::Terminated(cause)) => {
                        self.on_terminated(cause);
                        break;
                    }
                    None => {
                        self.on_terminated("event stream closed".to_string());
                        break;
                    }
                },
                _ = tokio::time::sleep_until(expiry), if next_deadline.is_some() => {
                    self.correlator.expire(Instant::now());
                    self.unsent.retain(|p| self.correlator.contains(&p.execution_id));
                }
                _ = tokio::time::sleep_until(self.ready_deadline), if starting => {
                    self.on_startup_timeout().await;
                    break;
                }
            }
        }
    }

    fn current(&self) -> SessionState {
        *self.state.borrow()
    }

    fn set_state(&self, state: SessionState) {
        tracing::debug!("Session '{}' -> {}", self.key, state);
        self.state.send_replace(state);
    }

    fn touch(&self) {
        if let Ok(mut at) = self.last_activity.lock() {
            *at = Instant::now();
        }
    }

    fn submit(&mut self, code: String, timeout: Duration, reply: Reply) {
        self.touch();
        let payload = self.correlator.register(code, timeout, reply);
        match self.current() {
            SessionState::Ready => self.write_request(payload),
            SessionState::Starting => {
                tracing::debug!(
                    "Queueing execution {} until session '{}' is ready",
                    payload.execution_id,
                    self.key
                );
                self.unsent.push_back(payload);
            }
            SessionState::Terminating | SessionState::Terminated => {
                let error = self.cause.get().cloned().unwrap_or(Error::SessionShuttingDown);
                self.correlator.reject(&payload.execution_id, error);
            }
        }
    }

    fn write_request(&mut self, payload: ExecutePayload) {
        let execution_id = payload.execution_id.clone();
        tracing::debug!("Sending execution {} to session '{}'", execution_id, self.key);
        if let Err(e) = self.process.write(&Frame::Execute(payload)) {
            self.correlator.reject(&execution_id, e);
        }
    }

    fn on_ready(&mut self) {
        if self.current() != SessionState::Starting {
            tracing::debug!("Ignoring repeated ready sentinel from session '{}'", self.key);
            return;
        }
        tracing::info!("Session '{}' is ready", self.key);
        self.set_state(SessionState::Ready);

        while let Some(payload) = self.unsent.pop_front() {
            if self.correlator.contains(&payload.execution_id) {
                self.write_request(payload);
            }
        }
    }

    fn on_terminated(&mut self, cause: String) {
        let error = if self.current() == SessionState::Starting {
            let mut message = format!("process exited before ready: {}", cause);
            if let Some(line) = self.process.stderr_tail().last() {
                message.push_str(&format!(" (stderr: {})", line));
            }
            Error::StartupFailure {
                key: self.key.clone(),
                message,
            }
        } else {
            tracing::warn!("Session '{}' terminated unexpectedly: {}", self.key, cause);
            Error::SessionTerminated(cause)
        };
        self.finish(error);
    }

    async fn on_startup_timeout(&mut self) {
        tracing::warn!(
            "Session '{}' did not become ready within {}ms",
            self.key,
            self.ready_timeout.as_millis()
        );
        let error = Error::StartupFailure {
            key: self.key.clone(),
            message: format!("no ready sentinel within {}ms", self.ready_timeout.as_millis()),
        };
        let _ = self.cause.set(error.clone());
        self.set_state(SessionState::Terminating);
        self.correlator.fail_all(&error);
        self.unsent.clear();

        self.process.kill();
        self.drain_until_terminated().await;
        self.set_state(SessionState::Terminated);
    }

    async fn shutdown(&mut self, grace: Duration) {
        tracing::info!("Shutting down session '{}'", self.key);
        let _ = self.cause.set(Error::SessionShuttingDown);
        self.set_state(SessionState::Terminating);
        self.correlator.fail_all(&Error::SessionShuttingDown);
        self.unsent.clear();

        if let Err(e) = self.process.write(&Frame::Exit) {
            tracing::debug!("Could not send exit to session '{}': {}", self.key, e);
        }
        self.process.close_stdin();

        if tokio::time::timeout(grace, self.drain_until_terminated())
            .await
            .is_err()
        {
            tracing::warn!(
                "Session '{}' did not exit within {}ms, killing",
                self.key,
                grace.as_millis()
            );
            self.process.kill();
            self.drain_until_terminated().await;
        }
        self.set_state(SessionState::Terminated);
    }

    /// Consume events until the process reports termination.
    async fn drain_until_terminated(&mut self) {
        while let Some(event) = self.process.next_event().await {
            match event {
                ProcessEvent::Terminated(_) => break,
                ProcessEvent::Response(payload) => {
                    self.correlator.resolve(payload);
                }
                ProcessEvent::Ready => {}
            }
        }
    }

    fn finish(&mut self, error: Error) {
        let _ = self.cause.set(error.clone());
        self.set_state(SessionState::Terminating);
        let failed = self.correlator.fail_all(&error);
        if failed > 0 {
            tracing::debug!("Failed {} pending executions on session '{}'", failed, self.key);
        }
        self.unsent.clear();
        self.set_state(SessionState::Terminated);
    }
}
