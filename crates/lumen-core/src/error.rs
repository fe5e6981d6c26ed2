//! Error types for lumen-core.

use std::time::Duration;

use thiserror::Error;

/// Result type for lumen-core operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that can occur in lumen-core.
///
/// An interpreter-side failure (user code raised) is not an error here: it
/// comes back as a normal result carrying an `error` artifact.
#[derive(Debug, Clone, Error)]
pub enum Error {
    /// The subprocess never signaled readiness.
    #[error("session '{key}' failed to start: {message}")]
    StartupFailure { key: String, message: String },

    /// No response arrived before the call's deadline.
    #[error("execution {execution_id} timed out after {}ms", timeout.as_millis())]
    ExecutionTimeout {
        execution_id: String,
        timeout: Duration,
    },

    /// The session's process exited or its pipes failed.
    #[error("session terminated: {0}")]
    SessionTerminated(String),

    /// The session is being shut down on request.
    #[error("session is shutting down")]
    SessionShuttingDown,

    /// Failed to spawn the interpreter process.
    #[error("failed to spawn interpreter: {0}")]
    Spawn(String),

    /// IO error.
    #[error("IO error: {0}")]
    Io(String),

    /// JSON encoding or decoding error.
    #[error("JSON error: {0}")]
    Json(String),

    /// Malformed protocol traffic.
    #[error("protocol error: {0}")]
    Protocol(String),

    /// Invalid configuration.
    #[error("configuration error: {0}")]
    Config(String),
}

impl From<std::io::Error> for Error {
    fn from(e: std::io::Error) -> Self {
        Self::Io(e.to_string())
    }
}

impl From<serde_json::Error> for Error {
    fn from(e: serde_json::Error) -> Self {
        Self::Json(e.to_string())
    }
}

impl Error {
    /// Whether this error tore the session down (as opposed to failing one call).
    pub fn is_transport(&self) -> bool {
        matches!(
            self,
            Self::StartupFailure { .. } | Self::SessionTerminated(_) | Self::SessionShuttingDown
        )
    }

    /// Format the error with a recovery hint for display.
    pub fn with_hint(&self) -> String {
        let hint = match self {
            Self::StartupFailure { .. } => {
                Some("check that the interpreter prints its ready line; raise `ready_timeout_ms` for slow starts")
            }
            Self::ExecutionTimeout { .. } => {
                Some("the session is still alive; a late answer is discarded, raise `execution_timeout_ms` for long cells")
            }
            Self::SessionTerminated(_) => Some("the next execution starts a fresh session"),
            Self::Spawn(_) => Some("set LUMEN_INTERPRETER or `interpreter.command` in the config file"),
            Self::Config(_) => Some("see `lumen check` for the resolved configuration"),
            _ => None,
        };

        match hint {
            Some(hint) => format!("{}\n  hint: {}", self, hint),
            None => self.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transport_classification() {
        assert!(Error::SessionShuttingDown.is_transport());
        assert!(Error::SessionTerminated("exit 1".into()).is_transport());
        assert!(
            !Error::ExecutionTimeout {
                execution_id: "e1".into(),
                timeout: Duration::from_millis(5),
            }
            .is_transport()
        );
    }

    #[test]
    fn test_hint_is_appended() {
        let err = Error::Spawn("not found".into());
        let text = err.with_hint();
        assert!(text.starts_with("failed to spawn interpreter: not found"));
        assert!(text.contains("hint: set LUMEN_INTERPRETER"));

        assert_eq!(Error::Io("x".into()).with_hint(), "IO error: x");
    }
}
