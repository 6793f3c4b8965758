//! Structured observability hooks for session and sandbox lifecycle events.
//!
//! Events are emitted at `info!` level (failures at `warn!`) with a stable
//! `event` field so log pipelines can filter on them.

use tracing::{info, warn};

/// Span tagging every log line of one request with its executor id.
///
/// Attach with [`tracing::Instrument::instrument`]; an entered span guard
/// cannot be held across `.await` in a `Send` future.
pub fn session_span(executor_id: &str) -> tracing::Span {
    tracing::info_span!("codebox.session", executor_id = %executor_id)
}

/// Emit event: a sandbox became ready for a session.
pub fn emit_sandbox_created(executor_id: &str, sandbox: &str, duration_ms: u64) {
    info!(
        event = "sandbox.created",
        executor_id = %executor_id,
        sandbox = %sandbox,
        duration_ms = duration_ms,
    );
}

/// Emit event: a sandbox was torn down.
pub fn emit_sandbox_terminated(sandbox: &str, reason: &str) {
    info!(event = "sandbox.terminated", sandbox = %sandbox, reason = %reason);
}

/// Emit event: an execution was handed to the in-sandbox executor.
pub fn emit_execution_started(executor_id: &str, code_len: usize, input_files: usize) {
    info!(
        event = "execution.started",
        executor_id = %executor_id,
        code_len = code_len,
        input_files = input_files,
    );
}

/// Emit event: an execution finished (any exit code).
pub fn emit_execution_finished(
    executor_id: &str,
    exit_code: i32,
    output_files: usize,
    duration_ms: u64,
) {
    info!(
        event = "execution.finished",
        executor_id = %executor_id,
        exit_code = exit_code,
        output_files = output_files,
        duration_ms = duration_ms,
    );
}

/// Emit event: a session was marked failed (warning level).
pub fn emit_session_failed(executor_id: &str, error: &dyn std::fmt::Display) {
    warn!(event = "session.failed", executor_id = %executor_id, error = %error);
}

/// Emit event: an idle session was evicted.
pub fn emit_session_evicted(executor_id: &str, idle_secs: u64) {
    info!(
        event = "session.evicted",
        executor_id = %executor_id,
        idle_secs = idle_secs,
    );
}
