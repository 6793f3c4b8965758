//! Execution Dispatcher: one request, end to end.
//!
//! acquire session -> fetch input blobs -> materialise -> snapshot -> run ->
//! snapshot -> collect changed files -> release.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::time::Instant;
use tracing::{debug, Instrument};

use crate::cas::{CasError, Digest, FileStore};
use crate::cluster::{ClusterError, SandboxName};
use crate::config::ServiceConfig;
use crate::error::{InterpreterError, Result, TimeoutPhase};
use crate::executor::protocol::{ExecutorErrorKind, ExecutorRequest, ExecutorResponse};
use crate::executor::workspace::normalize_path;
use crate::metrics::METRICS;
use crate::obs;
use crate::retry::{retry_transient, RetryPolicy};
use crate::session::{ExecutorId, SessionManager};

/// Code to run plus the files to place in the workspace first.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionRequest {
    pub source_code: String,
    /// Workspace path -> content hash in the file store.
    #[serde(default)]
    pub files: BTreeMap<String, Digest>,
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

impl ExecutionRequest {
    pub fn new(source_code: impl Into<String>) -> Self {
        Self {
            source_code: source_code.into(),
            ..Self::default()
        }
    }

    pub fn with_file(mut self, path: impl Into<String>, digest: Digest) -> Self {
        self.files.insert(path.into(), digest);
        self
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }
}

/// Outcome of running user code. A non-zero `exit_code` is still a result.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub stdout: String,
    pub stderr: String,
    pub exit_code: i32,
    /// Files created or modified by the run, workspace-relative.
    pub files: BTreeMap<String, Digest>,
}

#[derive(Debug, Clone)]
pub struct DispatchConfig {
    /// Limit handed to the executor for the user code.
    pub execution_timeout: Duration,
    /// Extra time for installation and file transfer before the whole call is abandoned.
    pub deadline_grace: Duration,
    pub retry: RetryPolicy,
}

impl Default for DispatchConfig {
    fn default() -> Self {
        Self {
            execution_timeout: Duration::from_secs(60),
            deadline_grace: Duration::from_secs(360),
            retry: RetryPolicy::default(),
        }
    }
}

impl From<&ServiceConfig> for DispatchConfig {
    fn from(config: &ServiceConfig) -> Self {
        Self {
            execution_timeout: config.execution_timeout(),
            deadline_grace: config.deadline_grace(),
            retry: config.retry.clone(),
        }
    }
}

pub struct ExecutionDispatcher {
    sessions: Arc<SessionManager>,
    store: Arc<dyn FileStore>,
    config: DispatchConfig,
}

impl ExecutionDispatcher {
    pub fn new(
        sessions: Arc<SessionManager>,
        store: Arc<dyn FileStore>,
        config: DispatchConfig,
    ) -> Self {
        Self {
            sessions,
            store,
            config,
        }
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub fn store(&self) -> &Arc<dyn FileStore> {
        &self.store
    }

    /// Run `request` in the sandbox bound to `executor_id`.
    ///
    /// Calls for the same id run one at a time in arrival order. Errors that
    /// leave the sandbox in an unknown state mark the session failed.
    pub async fn execute(
        &self,
        executor_id: &ExecutorId,
        request: ExecutionRequest,
    ) -> Result<ExecutionResult> {
        let span = obs::session_span(executor_id.as_str());
        self.execute_in_session(executor_id, request)
            .instrument(span)
            .await
    }

    async fn execute_in_session(
        &self,
        executor_id: &ExecutorId,
        request: ExecutionRequest,
    ) -> Result<ExecutionResult> {
        let inputs = normalize_inputs(&request.files)?;
        METRICS.inc_executions();
        obs::emit_execution_started(
            executor_id.as_str(),
            request.source_code.len(),
            inputs.len(),
        );
        let started = Instant::now();

        let mut lease = self.sessions.acquire(executor_id).await?;
        let sandbox = lease.sandbox().clone();

        // Every blob is loaded before the sandbox is touched.
        let mut blobs = Vec::with_capacity(inputs.len());
        for (path, digest) in inputs {
            match self.store.get(&digest).await {
                Ok(content) => blobs.push((path, content)),
                Err(CasError::NotFound(_)) => {
                    return Err(InterpreterError::FileNotFound { path, digest })
                }
                Err(e) => return Err(e.into()),
            }
        }

        let limit = self.config.execution_timeout + self.config.deadline_grace;
        let outcome = match tokio::time::timeout(limit, self.run(&sandbox, blobs, request)).await {
            Ok(outcome) => outcome,
            Err(_) => Err(InterpreterError::SandboxTimeout {
                sandbox: sandbox.to_string(),
                phase: TimeoutPhase::Execution,
                limit_secs: limit.as_secs(),
            }),
        };

        match outcome {
            Ok(result) => {
                obs::emit_execution_finished(
                    executor_id.as_str(),
                    result.exit_code,
                    result.files.len(),
                    started.elapsed().as_millis() as u64,
                );
                Ok(result)
            }
            Err(err) => {
                if err.is_session_fatal() {
                    lease.mark_failed(&err);
                }
                Err(err)
            }
        }
    }

    async fn run(
        &self,
        sandbox: &SandboxName,
        blobs: Vec<(String, Vec<u8>)>,
        request: ExecutionRequest,
    ) -> Result<ExecutionResult> {
        for (path, content) in blobs {
            match self
                .call(sandbox, ExecutorRequest::write_file(path, &content), true)
                .await?
            {
                ExecutorResponse::Written { .. } => {}
                other => return Err(unexpected(sandbox, "write_file", other)),
            }
        }

        let baseline = self.snapshot(sandbox).await?;

        let run = ExecutorRequest::Run {
            source_code: request.source_code,
            env: request.env,
            timeout_secs: Some(self.config.execution_timeout.as_secs()),
        };
        let output = match self.call(sandbox, run, false).await? {
            ExecutorResponse::Ran(output) => output,
            other => return Err(unexpected(sandbox, "run", other)),
        };
        if output.timed_out {
            return Err(InterpreterError::SandboxTimeout {
                sandbox: sandbox.to_string(),
                phase: TimeoutPhase::Execution,
                limit_secs: self.config.execution_timeout.as_secs(),
            });
        }

        let after = self.snapshot(sandbox).await?;
        let mut files = BTreeMap::new();
        for (path, digest) in changed_files(&baseline, &after) {
            if let Some(stored) = self.collect(sandbox, path, digest).await? {
                files.insert(path.clone(), stored);
            }
        }

        Ok(ExecutionResult {
            stdout: output.stdout,
            stderr: output.stderr,
            exit_code: output.exit_code,
            files,
        })
    }

    /// Store one output file, skipping the download when its hash is already held.
    async fn collect(
        &self,
        sandbox: &SandboxName,
        path: &str,
        digest: &Digest,
    ) -> Result<Option<Digest>> {
        if self.store.exists(digest).await? {
            debug!(path, digest = %digest.short(), "output already stored");
            return Ok(Some(*digest));
        }

        let request = ExecutorRequest::ReadFile {
            path: path.to_string(),
        };
        match self.call(sandbox, request, true).await? {
            ExecutorResponse::File { content_b64 } => {
                let content = ExecutorResponse::decode_file(&content_b64).map_err(|e| {
                    InterpreterError::Transport {
                        sandbox: sandbox.to_string(),
                        reason: format!("bad file payload for {path}: {e}"),
                    }
                })?;
                Ok(Some(self.store.put(&content).await?))
            }
            // Removed between snapshot and read; nothing to report.
            ExecutorResponse::Error {
                kind: ExecutorErrorKind::NotFound,
                ..
            } => Ok(None),
            other => Err(unexpected(sandbox, "read_file", other)),
        }
    }

    async fn snapshot(&self, sandbox: &SandboxName) -> Result<BTreeMap<String, Digest>> {
        match self.call(sandbox, ExecutorRequest::Snapshot, true).await? {
            ExecutorResponse::Snapshot { files } => Ok(files),
            other => Err(unexpected(sandbox, "snapshot", other)),
        }
    }

    /// Send one request; idempotent requests are retried on transient errors.
    async fn call(
        &self,
        sandbox: &SandboxName,
        request: ExecutorRequest,
        idempotent: bool,
    ) -> Result<ExecutorResponse> {
        let cluster = self.sessions.cluster();
        let op = request.op();
        let response: std::result::Result<ExecutorResponse, ClusterError> = if idempotent {
            let policy = &self.config.retry;
            let request = &request;
            retry_transient(policy, op, move || cluster.exec(sandbox, request.clone())).await
        } else {
            cluster.exec(sandbox, request).await
        };
        response.map_err(|e| InterpreterError::from_cluster(sandbox.as_str(), e))
    }
}

/// Validate caller paths and fold `/workspace/x` and `x` onto one key.
fn normalize_inputs(files: &BTreeMap<String, Digest>) -> Result<BTreeMap<String, Digest>> {
    let mut normalized = BTreeMap::new();
    for (raw, digest) in files {
        let path =
            normalize_path(raw).map_err(|e| InterpreterError::InvalidRequest(e.to_string()))?;
        if let Some(previous) = normalized.insert(path.clone(), *digest) {
            if previous != *digest {
                return Err(InterpreterError::InvalidRequest(format!(
                    "path {path} given twice with different content"
                )));
            }
        }
    }
    Ok(normalized)
}

/// Files that are new in `after` or whose hash differs from `before`.
fn changed_files<'a>(
    before: &'a BTreeMap<String, Digest>,
    after: &'a BTreeMap<String, Digest>,
) -> impl Iterator<Item = (&'a String, &'a Digest)> + 'a {
    after
        .iter()
        .filter(move |(path, digest)| before.get(*path) != Some(*digest))
}

fn unexpected(sandbox: &SandboxName, op: &str, response: ExecutorResponse) -> InterpreterError {
    match response {
        ExecutorResponse::Error {
            kind: ExecutorErrorKind::InvalidPath,
            message,
        } => InterpreterError::InvalidRequest(message),
        ExecutorResponse::Error { kind, message } => InterpreterError::Transport {
            sandbox: sandbox.to_string(),
            reason: format!("{op} failed ({kind:?}): {message}"),
        },
        other => InterpreterError::Transport {
            sandbox: sandbox.to_string(),
            reason: format!("unexpected response to {op}: {other:?}"),
        },
    }
}
