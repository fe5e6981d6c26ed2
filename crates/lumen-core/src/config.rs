//! Runtime configuration.
//!
//! Everything has a default; a JSON file may override any subset of fields
//! and a couple of environment variables override the file.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Environment variable naming the interpreter executable.
pub const INTERPRETER_ENV: &str = "LUMEN_INTERPRETER";
/// Environment variable naming the artifact directory.
pub const ARTIFACT_DIR_ENV: &str = "LUMEN_ARTIFACT_DIR";

/// Bootstrap script run by the default Python interpreter.
pub const PYTHON_BOOTSTRAP: &str = include_str!("../assets/session.py");

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LumenConfig {
    pub interpreter: InterpreterConfig,
    pub session: SessionConfig,
    pub cleanup: CleanupConfig,
    pub layout: LayoutConfig,
    /// Directory for rendered artifact files.
    /// Defaults to `<cache dir>/lumen/artifacts`.
    pub artifact_dir: Option<PathBuf>,
}

/// How interpreter processes are launched.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InterpreterConfig {
    /// Executable name or path, resolved through `PATH`.
    pub command: String,
    /// Arguments. When empty and the command is a Python, the bundled
    /// bootstrap script is passed with `-u -c`.
    pub args: Vec<String>,
    /// Working directory for the process.
    pub cwd: Option<PathBuf>,
}

impl Default for InterpreterConfig {
    fn default() -> Self {
        Self {
            command: "python3".to_string(),
            args: Vec::new(),
            cwd: None,
        }
    }
}

impl InterpreterConfig {
    /// Arguments actually passed to the process.
    pub fn effective_args(&self) -> Vec<String> {
        if !self.args.is_empty() {
            return self.args.clone();
        }
        let stem = Path::new(&self.command)
            .file_stem()
            .map(|s| s.to_string_lossy().to_string())
            .unwrap_or_default();
        if stem.starts_with("python") {
            vec!["-u".into(), "-c".into(), PYTHON_BOOTSTRAP.into()]
        } else {
            Vec::new()
        }
    }
}

/// Session lifecycle timing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// How long a new process has to print its ready sentinel.
    pub ready_timeout_ms: u64,
    /// Per-call deadline for an execution.
    pub execution_timeout_ms: u64,
    /// How long shutdown waits for a cooperative exit before killing.
    pub shutdown_grace_ms: u64,
    /// Number of stderr lines kept per session.
    pub stderr_tail_lines: usize,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ready_timeout_ms: 5_000,
            execution_timeout_ms: 60_000,
            shutdown_grace_ms: 2_000,
            stderr_tail_lines: 50,
        }
    }
}

impl SessionConfig {
    pub fn ready_timeout(&self) -> Duration {
        Duration::from_millis(self.ready_timeout_ms)
    }

    pub fn execution_timeout(&self) -> Duration {
        Duration::from_millis(self.execution_timeout_ms)
    }

    pub fn shutdown_grace(&self) -> Duration {
        Duration::from_millis(self.shutdown_grace_ms)
    }
}

/// Cleanup sweeper timing.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct CleanupConfig {
    pub interval_secs: u64,
    /// Age after which cached results are evicted.
    pub result_ttl_secs: u64,
    /// Age after which unreferenced artifact files are deleted.
    pub artifact_ttl_secs: u64,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            interval_secs: 60,
            result_ttl_secs: 600,
            artifact_ttl_secs: 3_600,
        }
    }
}

impl CleanupConfig {
    pub fn interval(&self) -> Duration {
        Duration::from_secs(self.interval_secs)
    }

    pub fn result_ttl(&self) -> Duration {
        Duration::from_secs(self.result_ttl_secs)
    }

    pub fn artifact_ttl(&self) -> Duration {
        Duration::from_secs(self.artifact_ttl_secs)
    }
}

/// Geometry used when the reconciler has to allocate a new slot.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct LayoutConfig {
    /// Gap between the source and its outputs, and between outputs.
    pub gap: f64,
    pub text_size: (f64, f64),
    pub image_size: (f64, f64),
    pub error_size: (f64, f64),
    pub success_size: (f64, f64),
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            gap: 20.0,
            text_size: (400.0, 200.0),
            image_size: (400.0, 300.0),
            error_size: (400.0, 150.0),
            success_size: (160.0, 48.0),
        }
    }
}

impl LumenConfig {
    /// Load from a JSON file, then apply environment overrides.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut config = match path {
            Some(path) => Self::from_file(path)?,
            None => Self::default(),
        };
        config.apply_env();
        config.validate()?;
        Ok(config)
    }

    /// Parse a JSON config file. Missing fields keep their defaults.
    pub fn from_file(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("cannot read {}: {}", path.display(), e)))?;
        serde_json::from_str(&text)
            .map_err(|e| Error::Config(format!("invalid config {}: {}", path.display(), e)))
    }

    /// Apply `LUMEN_INTERPRETER` and `LUMEN_ARTIFACT_DIR`.
    pub fn apply_env(&mut self) {
        if let Ok(command) = std::env::var(INTERPRETER_ENV)
            && !command.trim().is_empty()
        {
            self.interpreter.command = command;
        }
        if let Ok(dir) = std::env::var(ARTIFACT_DIR_ENV)
            && !dir.trim().is_empty()
        {
            self.artifact_dir = Some(PathBuf::from(dir));
        }
    }

    /// Reject settings the runtime cannot work with.
    pub fn validate(&self) -> Result<()> {
        if self.interpreter.command.trim().is_empty() {
            return Err(Error::Config("interpreter.command is empty".into()));
        }
        if self.session.ready_timeout_ms == 0 || self.session.execution_timeout_ms == 0 {
            return Err(Error::Config("session timeouts must be positive".into()));
        }
        if self.cleanup.interval_secs == 0 {
            return Err(Error::Config("cleanup.interval_secs must be positive".into()));
        }
        Ok(())
    }

    /// Artifact directory, falling back to the user cache directory.
    pub fn artifact_dir(&self) -> PathBuf {
        if let Some(dir) = &self.artifact_dir {
            return dir.clone();
        }
        dirs::cache_dir()
            .unwrap_or_else(std::env::temp_dir)
            .join("lumen")
            .join("artifacts")
    }

    /// Resolve the interpreter executable.
    ///
    /// Absolute or relative paths are used as is when they exist; bare names
    /// are looked up on `PATH`.
    pub fn resolve_interpreter(&self) -> Result<PathBuf> {
        let command = &self.interpreter.command;
        let as_path = PathBuf::from(command);
        if as_path.components().count() > 1 {
            if as_path.exists() {
                return Ok(as_path);
            }
            return Err(Error::Spawn(format!("interpreter '{}' does not exist", command)));
        }
        which::which(command)
            .map_err(|e| Error::Spawn(format!("interpreter '{}' not found on PATH: {}", command, e)))
    }
}
