//! Global atomic counters for codebox observability.
//!
//! Counters are incremented silently at the call site. Call
//! [`Metrics::flush`] to emit current values as a single
//! `tracing::info!` event (e.g. on every idle sweep).

use std::sync::atomic::{AtomicU64, Ordering};

/// Global metrics singleton.
pub static METRICS: Metrics = Metrics::new();

/// Lightweight atomic counters.
pub struct Metrics {
    sandboxes_created: AtomicU64,
    executions: AtomicU64,
    sessions_failed: AtomicU64,
    sessions_evicted: AtomicU64,
    blobs_stored: AtomicU64,
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl Metrics {
    pub const fn new() -> Self {
        Self {
            sandboxes_created: AtomicU64::new(0),
            executions: AtomicU64::new(0),
            sessions_failed: AtomicU64::new(0),
            sessions_evicted: AtomicU64::new(0),
            blobs_stored: AtomicU64::new(0),
        }
    }

    pub fn inc_sandboxes_created(&self) {
        self.sandboxes_created.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "sandboxes_created", "counter incremented");
    }

    pub fn inc_executions(&self) {
        self.executions.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "executions", "counter incremented");
    }

    pub fn inc_sessions_failed(&self) {
        self.sessions_failed.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "sessions_failed", "counter incremented");
    }

    pub fn inc_sessions_evicted(&self) {
        self.sessions_evicted.fetch_add(1, Ordering::Relaxed);
        tracing::trace!(metric = "sessions_evicted", "counter incremented");
    }

    pub fn inc_blobs_stored(&self) {
        self.blobs_stored.fetch_add(1, Ordering::Relaxed);
    }

    /// Emit all current counter values as a single `info!` event.
    pub fn flush(&self) {
        tracing::info!(
            metric = "flush",
            sandboxes_created = self.sandboxes_created(),
            executions = self.executions(),
            sessions_failed = self.sessions_failed(),
            sessions_evicted = self.sessions_evicted(),
            blobs_stored = self.blobs_stored(),
        );
    }

    pub fn sandboxes_created(&self) -> u64 {
        self.sandboxes_created.load(Ordering::Relaxed)
    }

    pub fn executions(&self) -> u64 {
        self.executions.load(Ordering::Relaxed)
    }

    pub fn sessions_failed(&self) -> u64 {
        self.sessions_failed.load(Ordering::Relaxed)
    }

    pub fn sessions_evicted(&self) -> u64 {
        self.sessions_evicted.load(Ordering::Relaxed)
    }

    pub fn blobs_stored(&self) -> u64 {
        self.blobs_stored.load(Ordering::Relaxed)
    }

    /// Reset all counters to zero (useful in tests).
    pub fn reset(&self) {
        self.sandboxes_created.store(0, Ordering::Relaxed);
        self.executions.store(0, Ordering::Relaxed);
        self.sessions_failed.store(0, Ordering::Relaxed);
        self.sessions_evicted.store(0, Ordering::Relaxed);
        self.blobs_stored.store(0, Ordering::Relaxed);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_increment_and_reset() {
        let m = Metrics::new();
        m.inc_sandboxes_created();
        m.inc_executions();
        m.inc_executions();
        m.inc_sessions_failed();
        assert_eq!(m.sandboxes_created(), 1);
        assert_eq!(m.executions(), 2);
        assert_eq!(m.sessions_failed(), 1);
        assert_eq!(m.sessions_evicted(), 0);

        m.reset();
        assert_eq!(m.executions(), 0);
        assert_eq!(m.sandboxes_created(), 0);
    }
}
