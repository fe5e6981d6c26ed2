//! Line protocol spoken with interpreter processes.
//!
//! Every frame is one `\n`-terminated line on the process's stdin/stdout:
//!
//! ```text
//! PYTHON_SESSION_READY                      (interpreter -> host, once)
//! EXECUTE:{"executionId":"..","code":".."}  (host -> interpreter)
//! RESULT:{"executionId":"..","result":{..}} (interpreter -> host)
//! EXIT                                      (host -> interpreter)
//! ```
//!
//! Lines that match none of these are ignored by the decoder side.

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};
use crate::model::ResultBody;

/// Sentinel line printed by the interpreter once it accepts requests.
pub const READY_SENTINEL: &str = "PYTHON_SESSION_READY";
/// Command line asking the interpreter to exit cooperatively.
pub const EXIT_COMMAND: &str = "EXIT";
/// Tag prefix of request frames.
pub const EXECUTE_TAG: &str = "EXECUTE:";
/// Tag prefix of response frames.
pub const RESULT_TAG: &str = "RESULT:";

/// Longest partial line kept while waiting for a newline (64MB).
const MAX_PENDING_LINE: usize = 64 * 1024 * 1024;

/// Payload of an `EXECUTE:` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutePayload {
    pub execution_id: String,
    pub code: String,
}

/// Payload of a `RESULT:` frame.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ResultPayload {
    pub execution_id: String,
    #[serde(default)]
    pub result: ResultBody,
}

/// A protocol frame.
#[derive(Debug, Clone, PartialEq)]
pub enum Frame {
    Ready,
    Execute(ExecutePayload),
    Result(ResultPayload),
    Exit,
}

impl Frame {
    /// Encode the frame as a single line, including the trailing newline.
    ///
    /// JSON never contains a raw newline, so multi-line code stays on one line.
    pub fn encode(&self) -> Result<String> {
        let mut line = match self {
            Self::Ready => READY_SENTINEL.to_string(),
            Self::Exit => EXIT_COMMAND.to_string(),
            Self::Execute(payload) => format!("{}{}", EXECUTE_TAG, serde_json::to_string(payload)?),
            Self::Result(payload) => format!("{}{}", RESULT_TAG, serde_json::to_string(payload)?),
        };
        line.push('\n');
        Ok(line)
    }

    /// Parse one complete line (without its terminator).
    ///
    /// Returns `Ok(None)` for lines that are not frames at all and an error
    /// for a recognized tag with a malformed payload.
    pub fn parse(line: &str) -> Result<Option<Self>> {
        let line = line.strip_suffix('\r').unwrap_or(line);

        if line == READY_SENTINEL {
            return Ok(Some(Self::Ready));
        }
        if line == EXIT_COMMAND {
            return Ok(Some(Self::Exit));
        }
        if let Some(json) = line.strip_prefix(RESULT_TAG) {
            let payload = serde_json::from_str(json)
                .map_err(|e| Error::Protocol(format!("malformed RESULT frame: {}", e)))?;
            return Ok(Some(Self::Result(payload)));
        }
        if let Some(json) = line.strip_prefix(EXECUTE_TAG) {
            let payload = serde_json::from_str(json)
                .map_err(|e| Error::Protocol(format!("malformed EXECUTE frame: {}", e)))?;
            return Ok(Some(Self::Execute(payload)));
        }

        Ok(None)
    }
}

/// Splits a byte stream into lines, keeping partial lines across reads.
#[derive(Debug, Default)]
pub struct LineDecoder {
    pending: Vec<u8>,
}

impl LineDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return every line it completed, in order.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<String> {
        let mut lines = Vec::new();
        let mut rest = chunk;

        while let Some(pos) = rest.iter().position(|&b| b == b'\n') {
            self.pending.extend_from_slice(&rest[..pos]);
            lines.push(Self::take_line(&mut self.pending));
            rest = &rest[pos + 1..];
        }
        self.pending.extend_from_slice(rest);

        if self.pending.len() > MAX_PENDING_LINE {
            tracing::warn!(
                "Discarding {} bytes of unterminated interpreter output",
                self.pending.len()
            );
            self.pending.clear();
        }

        lines
    }

    /// Flush the unterminated tail when the stream ends.
    pub fn finish(&mut self) -> Option<String> {
        if self.pending.is_empty() {
            None
        } else {
            Some(Self::take_line(&mut self.pending))
        }
    }

    /// Bytes buffered without a newline yet.
    pub fn pending_len(&self) -> usize {
        self.pending.len()
    }

    fn take_line(buf: &mut Vec<u8>) -> String {
        let bytes = std::mem::take(buf);
        let mut line = match String::from_utf8(bytes) {
            Ok(line) => line,
            Err(e) => String::from_utf8_lossy(e.as_bytes()).into_owned(),
        };
        if line.ends_with('\r') {
            line.pop();
        }
        line
    }
}

/// Decodes frames from a byte stream, skipping non-frame lines.
#[derive(Debug, Default)]
pub struct FrameDecoder {
    lines: LineDecoder,
}

impl FrameDecoder {
    pub fn new() -> Self {
        Self::default()
    }

    /// Feed a chunk and return the frames it completed.
    pub fn push(&mut self, chunk: &[u8]) -> Vec<Frame> {
        self.lines
            .push(chunk)
            .iter()
            .filter_map(|line| Self::decode_line(line))
            .collect()
    }

    /// Decode whatever is left once the stream has ended.
    pub fn finish(&mut self) -> Option<Frame> {
        self.lines.finish().and_then(|line| Self::decode_line(&line))
    }

    fn decode_line(line: &str) -> Option<Frame> {
        match Frame::parse(line) {
            Ok(Some(frame)) => Some(frame),
            Ok(None) => {
                if !line.is_empty() {
                    tracing::debug!("Ignoring interpreter line: {}", line);
                }
                None
            }
            Err(e) => {
                tracing::warn!("{}", e);
                None
            }
        }
    }
}
