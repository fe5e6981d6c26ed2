//! Creation of interpreter processes.
//!
//! The registry never builds a `Command` itself; it asks a [`Spawner`] so the
//! process side can be swapped for in-memory pipes in tests.

use std::path::PathBuf;
use std::process::Stdio;

use tokio::io::{AsyncRead, AsyncWrite};
use tokio::process::{Child, Command};

use crate::config::{ARTIFACT_DIR_ENV, LumenConfig};
use crate::error::{Error, Result};

/// Environment variable carrying the session key into the interpreter.
pub const SESSION_KEY_ENV: &str = "LUMEN_SESSION_KEY";

pub type BoxedWriter = Box<dyn AsyncWrite + Send + Unpin>;
pub type BoxedReader = Box<dyn AsyncRead + Send + Unpin>;

/// The pipes (and optionally the OS process) of a freshly spawned interpreter.
pub struct SpawnedProcess {
    pub stdin: BoxedWriter,
    pub stdout: BoxedReader,
    pub stderr: Option<BoxedReader>,
    pub child: Option<Child>,
}

impl SpawnedProcess {
    /// Take the piped streams out of a spawned child.
    pub fn from_child(mut child: Child) -> Result<Self> {
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| Error::Spawn("failed to get interpreter stdin".to_string()))?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| Error::Spawn("failed to get interpreter stdout".to_string()))?;
        let stderr = child.stderr.take();

        Ok(Self {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            stderr: stderr.map(|s| Box::new(s) as BoxedReader),
            child: Some(child),
        })
    }

    /// Wrap bare streams with no OS process behind them.
    pub fn from_streams(
        stdin: impl AsyncWrite + Send + Unpin + 'static,
        stdout: impl AsyncRead + Send + Unpin + 'static,
        stderr: Option<BoxedReader>,
    ) -> Self {
        Self {
            stdin: Box::new(stdin),
            stdout: Box::new(stdout),
            stderr,
            child: None,
        }
    }

    pub fn pid(&self) -> Option<u32> {
        self.child.as_ref().and_then(Child::id)
    }
}

/// Something that can start an interpreter for a session key.
pub trait Spawner: Send + Sync + 'static {
    fn spawn(&self, key: &str) -> Result<SpawnedProcess>;
}

/// Spawns the configured interpreter executable.
#[derive(Debug, Clone)]
pub struct CommandSpawner {
    program: PathBuf,
    args: Vec<String>,
    cwd: Option<PathBuf>,
    artifact_dir: PathBuf,
}

impl CommandSpawner {
    pub fn new(program: impl Into<PathBuf>, args: Vec<String>, artifact_dir: impl Into<PathBuf>) -> Self {
        Self {
            program: program.into(),
            args,
            cwd: None,
            artifact_dir: artifact_dir.into(),
        }
    }

    /// Build from config, resolving the interpreter on `PATH`.
    pub fn from_config(config: &LumenConfig) -> Result<Self> {
        let program = config.resolve_interpreter()?;
        let mut spawner = Self::new(program, config.interpreter.effective_args(), config.artifact_dir());
        spawner.cwd = config.interpreter.cwd.clone();
        Ok(spawner)
    }

    pub fn program(&self) -> &PathBuf {
        &self.program
    }
}

impl Spawner for CommandSpawner {
    fn spawn(&self, key: &str) -> Result<SpawnedProcess> {
        let mut command = Command::new(&self.program);
        command
            .args(&self.args)
            .env(ARTIFACT_DIR_ENV, &self.artifact_dir)
            .env(SESSION_KEY_ENV, key)
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);
        if let Some(cwd) = &self.cwd {
            command.current_dir(cwd);
        }

        let child = command.spawn().map_err(|e| {
            Error::Spawn(format!(
                "failed to spawn interpreter '{}': {}",
                self.program.display(),
                e
            ))
        })?;

        tracing::info!(
            "Spawned interpreter for session '{}' (pid {:?})",
            key,
            child.id()
        );

        SpawnedProcess::from_child(child)
    }
}
