//! JSON wire protocol between the orchestrator and the in-sandbox executor.
//!
//! One request in, one response out. The cluster `exec` capability carries the
//! bytes (stdin/stdout of `codebox-executor exec` for Kubernetes, a direct call
//! for the local backend); this module only fixes their shape.

use std::collections::BTreeMap;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use serde::{Deserialize, Serialize};

use crate::cas::Digest;

/// A single operation for the executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum ExecutorRequest {
    /// Liveness check.
    Ping,
    /// Resolve dependencies and run `source_code` in the workspace.
    Run {
        source_code: String,
        #[serde(default)]
        env: BTreeMap<String, String>,
        #[serde(default)]
        timeout_secs: Option<u64>,
    },
    /// Materialise a file at a workspace-relative path.
    WriteFile { path: String, content_b64: String },
    /// Read a workspace file back.
    ReadFile { path: String },
    /// Hash every tracked file in the workspace.
    Snapshot,
}

impl ExecutorRequest {
    pub fn write_file(path: impl Into<String>, content: &[u8]) -> Self {
        ExecutorRequest::WriteFile {
            path: path.into(),
            content_b64: BASE64.encode(content),
        }
    }

    /// Short operation name for logs.
    pub fn op(&self) -> &'static str {
        match self {
            ExecutorRequest::Ping => "ping",
            ExecutorRequest::Run { .. } => "run",
            ExecutorRequest::WriteFile { .. } => "write_file",
            ExecutorRequest::ReadFile { .. } => "read_file",
            ExecutorRequest::Snapshot => "snapshot",
        }
    }
}

/// Captured result of one subprocess run.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RunOutput {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    /// The wall-clock limit fired and the process was killed.
    #[serde(default)]
    pub timed_out: bool,
}

/// Category of an executor-side failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ExecutorErrorKind {
    InvalidPath,
    NotFound,
    Spawn,
    Io,
    Protocol,
}

/// The executor's reply.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
pub enum ExecutorResponse {
    Pong,
    Ran(RunOutput),
    Written { digest: Digest },
    File { content_b64: String },
    Snapshot { files: BTreeMap<String, Digest> },
    Error { kind: ExecutorErrorKind, message: String },
}

impl ExecutorResponse {
    pub fn file(content: &[u8]) -> Self {
        ExecutorResponse::File {
            content_b64: BASE64.encode(content),
        }
    }

    /// Decode the payload of a [`ExecutorResponse::File`].
    pub fn decode_file(content_b64: &str) -> Result<Vec<u8>, base64::DecodeError> {
        BASE64.decode(content_b64)
    }
}

/// Decode the payload of a [`ExecutorRequest::WriteFile`].
pub fn decode_content(content_b64: &str) -> Result<Vec<u8>, base64::DecodeError> {
    BASE64.decode(content_b64)
}
