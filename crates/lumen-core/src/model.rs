//! Execution data carried between the interpreter, the core and the canvas.

use std::fmt;
use std::path::PathBuf;

use serde::{Deserialize, Serialize};

/// Kind of a single execution output.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ArtifactKind {
    /// Plain text output.
    Text,
    /// Error text (exception, traceback).
    Error,
    /// Rendered image; the payload is a file path or inline data.
    Image,
    /// Synthetic marker for a run that produced nothing.
    Success,
}

impl fmt::Display for ArtifactKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Text => "text",
            Self::Error => "error",
            Self::Image => "image",
            Self::Success => "success",
        };
        f.write_str(name)
    }
}

/// One discrete piece of execution output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Artifact {
    pub kind: ArtifactKind,
    #[serde(default)]
    pub payload: String,
    #[serde(default, skip_serializing_if = "serde_json::Map::is_empty")]
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl Artifact {
    pub fn new(kind: ArtifactKind, payload: impl Into<String>) -> Self {
        Self {
            kind,
            payload: payload.into(),
            metadata: serde_json::Map::new(),
        }
    }

    pub fn text(payload: impl Into<String>) -> Self {
        Self::new(ArtifactKind::Text, payload)
    }

    pub fn error(payload: impl Into<String>) -> Self {
        Self::new(ArtifactKind::Error, payload)
    }

    pub fn image(payload: impl Into<String>) -> Self {
        Self::new(ArtifactKind::Image, payload)
    }

    /// The marker used when a run produced no output at all.
    pub fn success() -> Self {
        Self::new(ArtifactKind::Success, "")
    }

    /// Path of the backing file, for image artifacts stored on disk.
    pub fn file_path(&self) -> Option<PathBuf> {
        if self.kind != ArtifactKind::Image || self.is_inline() || self.payload.is_empty() {
            return None;
        }
        Some(PathBuf::from(&self.payload))
    }

    /// Whether the payload is inline base64 data rather than a path.
    pub fn is_inline(&self) -> bool {
        self.metadata
            .get("encoding")
            .and_then(|v| v.as_str())
            .is_some_and(|enc| enc == "base64")
    }
}

/// The `result` object of a response frame.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ResultBody {
    #[serde(default)]
    pub stdout: String,
    #[serde(default)]
    pub stderr: String,
    #[serde(default)]
    pub artifacts: Vec<Artifact>,
}

/// Output of one execution, keyed by its execution ID.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub execution_id: String,
    pub stdout: String,
    pub stderr: String,
    pub artifacts: Vec<Artifact>,
}

impl ExecutionResult {
    pub fn from_body(execution_id: impl Into<String>, body: ResultBody) -> Self {
        Self {
            execution_id: execution_id.into(),
            stdout: body.stdout,
            stderr: body.stderr,
            artifacts: body.artifacts,
        }
    }

    /// False when the interpreter reported an error artifact.
    pub fn success(&self) -> bool {
        !self
            .artifacts
            .iter()
            .any(|a| a.kind == ArtifactKind::Error)
    }

    /// Paths of on-disk artifacts this result refers to.
    pub fn artifact_paths(&self) -> impl Iterator<Item = PathBuf> + '_ {
        self.artifacts.iter().filter_map(Artifact::file_path)
    }
}

/// One submitted piece of code, bound to a session.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExecutionRequest {
    pub execution_id: String,
    pub session_key: String,
    pub code: String,
}

impl ExecutionRequest {
    /// Create a request with a fresh, globally unique execution ID.
    pub fn new(session_key: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            execution_id: uuid::Uuid::new_v4().to_string(),
            session_key: session_key.into(),
            code: code.into(),
        }
    }
}

/// A request for the execution API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteRequest {
    pub code: String,
    pub source_id: String,
    pub session_key: String,
}

/// Reply of the execution API.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecuteResponse {
    /// Absent when the request failed before the session accepted it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_id: Option<String>,
    pub source_id: String,
    pub stdout: String,
    pub stderr: String,
    pub artifacts: Vec<Artifact>,
    pub success: bool,
    pub execution_time_ms: u64,
}
