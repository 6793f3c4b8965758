//! Error taxonomy for codebox.
//!
//! A non-zero exit code or non-empty stderr from user code is never an error
//! here; those travel back as ordinary [`ExecutionResult`](crate::ExecutionResult) data.

use crate::cas::{CasError, Digest};
use crate::cluster::ClusterError;
use crate::executor::ResolveError;

/// Errors surfaced to callers of the orchestration layer.
#[derive(Debug, thiserror::Error)]
pub enum InterpreterError {
    #[error("sandbox creation failed for {sandbox}: {reason}")]
    SandboxCreation { sandbox: String, reason: String },

    #[error("sandbox {sandbox} timed out during {phase} after {limit_secs}s")]
    SandboxTimeout {
        sandbox: String,
        phase: TimeoutPhase,
        limit_secs: u64,
    },

    #[error("could not resolve package for import {import}: {reason}")]
    PackageResolution { import: String, reason: String },

    #[error("input file {path} references unknown hash {digest}")]
    FileNotFound { path: String, digest: Digest },

    #[error("custom tool parse failed: {}", errors.join("; "))]
    ToolParse { errors: Vec<String> },

    #[error("custom tool raised: {stderr}")]
    ToolExecution { stderr: String },

    #[error("transport error talking to sandbox {sandbox}: {reason}")]
    Transport { sandbox: String, reason: String },

    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("configuration error: {0}")]
    Config(String),

    #[error("file store error: {0}")]
    Store(#[from] CasError),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

/// Which deadline a [`InterpreterError::SandboxTimeout`] refers to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TimeoutPhase {
    Readiness,
    Execution,
}

impl std::fmt::Display for TimeoutPhase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TimeoutPhase::Readiness => write!(f, "readiness"),
            TimeoutPhase::Execution => write!(f, "execution"),
        }
    }
}

impl InterpreterError {
    /// Whether this error leaves the owning session's sandbox in an unknown state.
    ///
    /// Fatal errors mark the session `Failed`; the next acquire recreates it.
    pub fn is_session_fatal(&self) -> bool {
        matches!(
            self,
            InterpreterError::SandboxCreation { .. }
                | InterpreterError::SandboxTimeout { .. }
                | InterpreterError::Transport { .. }
        )
    }

    pub(crate) fn from_cluster(sandbox: &str, err: ClusterError) -> Self {
        InterpreterError::Transport {
            sandbox: sandbox.to_string(),
            reason: err.to_string(),
        }
    }
}

impl From<ResolveError> for InterpreterError {
    fn from(err: ResolveError) -> Self {
        InterpreterError::PackageResolution {
            import: err.import,
            reason: err.reason,
        }
    }
}

/// Result type for orchestration operations.
pub type Result<T> = std::result::Result<T, InterpreterError>;
