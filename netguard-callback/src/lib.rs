//! SDK-local network-hook callback client. A small, single-purpose
//! crate, split out the way this workspace splits concerns throughout
//! (`netguard-store`, `netguard-observability`, …) — this client has no
//! reason to live inside the plugin that calls it.
//!
//! One JSON object per direction over a Unix domain socket: the engine
//! writes a [`CallbackRequest`] line, reads one [`CallbackResponse`]
//! line, and the connection ends. Framing (one object per line, explicit
//! flush) follows the same discipline as
//! `ando-observability::audit_file_writer`'s line-oriented writes, even
//! though this is a bidirectional socket rather than an append-only file.

use netguard_core::EngineError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::io::{BufRead, BufReader, Write};
use std::os::unix::net::UnixStream;
use std::path::{Path, PathBuf};
use std::time::Duration;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CallbackRequest {
    pub callback_id: String,
    /// `"before"` or `"after"`.
    pub phase: String,
    pub host: String,
    pub method: String,
    pub path: String,
    pub query: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_headers: Option<Vec<(String, String)>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub response_headers: Option<Vec<(String, String)>>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct CallbackResponse {
    /// `"allow"`, `"block"`, or `"mutate"`.
    pub action: String,
    #[serde(default)]
    pub request_mutation: Option<RequestMutation>,
    #[serde(default)]
    pub response_mutation: Option<ResponseMutation>,
    #[serde(default)]
    pub error: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct RequestMutation {
    #[serde(default)]
    pub header_sets: HashMap<String, String>,
    #[serde(default)]
    pub header_deletes: Vec<String>,
    #[serde(default)]
    pub query_sets: HashMap<String, String>,
    #[serde(default)]
    pub query_deletes: Vec<String>,
    #[serde(default)]
    pub rewrite_path: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ResponseMutation {
    #[serde(default)]
    pub header_sets: HashMap<String, String>,
    #[serde(default)]
    pub header_deletes: Vec<String>,
    #[serde(default)]
    pub body_replacements: Vec<BodyReplacement>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct BodyReplacement {
    pub find: String,
    pub replace: String,
}

/// Rule-level default when a rule's own `timeout_ms` is unset. Callers
/// still take the longer of this (or the rule's configured timeout) and
/// the calling context's remaining deadline before dialing — this constant
/// is not by itself the effective per-call timeout.
pub const DEFAULT_TIMEOUT: Duration = Duration::from_secs(2);

pub struct CallbackClient {
    socket_path: PathBuf,
}

impl CallbackClient {
    pub fn new(socket_path: impl AsRef<Path>) -> Self {
        Self { socket_path: socket_path.as_ref().to_path_buf() }
    }

    /// Dial, write one request line, read one response line. `timeout`
    /// bounds both connect-adjacent I/O and the response read.
    pub fn call(&self, request: &CallbackRequest, timeout: Duration) -> Result<CallbackResponse, EngineError> {
        tracing::debug!(callback_id = %request.callback_id, phase = %request.phase, "dispatching network hook callback");
        let mut stream = UnixStream::connect(&self.socket_path)
            .map_err(|e| EngineError::CallbackError(format!("connect {}: {e}", self.socket_path.display())))?;
        stream
            .set_write_timeout(Some(timeout))
            .map_err(|e| EngineError::CallbackError(e.to_string()))?;
        stream
            .set_read_timeout(Some(timeout))
            .map_err(|e| EngineError::CallbackError(e.to_string()))?;

        let mut line = serde_json::to_string(request)?;
        line.push('\n');
        stream
            .write_all(line.as_bytes())
            .map_err(|e| EngineError::CallbackError(format!("write: {e}")))?;

        let mut reader = BufReader::new(stream);
        let mut resp_line = String::new();
        let n = reader
            .read_line(&mut resp_line)
            .map_err(|e| EngineError::CallbackError(format!("read: {e}")))?;
        if n == 0 {
            return Err(EngineError::CallbackError("socket closed without a response".into()));
        }

        let response: CallbackResponse = serde_json::from_str(resp_line.trim_end())
            .map_err(|e| EngineError::CallbackError(format!("decode: {e}")))?;

        if let Some(err) = &response.error {
            if !err.is_empty() {
                return Err(EngineError::CallbackError(err.clone()));
            }
        }

        Ok(response)
    }
}
