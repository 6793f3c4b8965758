//! Lifecycle Manager: one sticky sandbox per executor id.
//!
//! Each session owns a FIFO async mutex. Holding it is what "busy" means:
//! creation is single-flight, executions on one session run in submission
//! order, and distinct sessions never wait on each other. The registry map
//! itself is only locked for short, non-async sections.
//!
//! State machine per session:
//!
//! ```text
//! Absent -> Creating -> AwaitingReady -> Ready <-> Executing
//!              |              |                       |
//!              +------> Failed <----------------------+
//! Failed --(next acquire: terminate, recreate)--> Creating
//! Ready --(no answer to ping on acquire)--> Failed
//! Ready/Failed --(idle past TTL)--> Terminating -> Absent
//! ```
//!
//! A sandbox that already exists under the session's name (left by an earlier
//! process) is adopted when it answers, and replaced when it doesn't.

use std::collections::HashMap;
use std::fmt;
use std::str::FromStr;
use std::sync::{Arc, Mutex, Weak};
use std::time::Duration;

use chrono::{DateTime, Utc};
use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard};
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tracing::{debug, info, warn};

use crate::cluster::{ClusterError, SandboxCluster, SandboxName};
use crate::config::ServiceConfig;
use crate::error::{InterpreterError, Result, TimeoutPhase};
use crate::executor::protocol::{ExecutorRequest, ExecutorResponse};
use crate::metrics::METRICS;
use crate::obs;
use crate::retry::{retry_transient, RetryPolicy};

pub const MAX_EXECUTOR_ID_LEN: usize = 256;

/// Longest wait for a pre-existing sandbox before it is replaced instead.
const ADOPT_READY_TIMEOUT: Duration = Duration::from_secs(10);

/// Caller-chosen session key.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ExecutorId(String);

impl ExecutorId {
    pub fn new(id: impl Into<String>) -> Result<Self> {
        let id = id.into();
        if id.trim().is_empty() {
            return Err(InterpreterError::InvalidRequest("executor id is empty".into()));
        }
        if id.len() > MAX_EXECUTOR_ID_LEN {
            return Err(InterpreterError::InvalidRequest(format!(
                "executor id is longer than {MAX_EXECUTOR_ID_LEN} bytes"
            )));
        }
        Ok(Self(id))
    }

    /// A fresh id that no caller will ever reuse.
    pub fn ephemeral(prefix: &str) -> Self {
        Self(format!("{prefix}-{}", uuid::Uuid::new_v4()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn sandbox_name(&self) -> SandboxName {
        SandboxName::for_executor(&self.0)
    }
}

impl fmt::Display for ExecutorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for ExecutorId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ExecutorId({})", self.0)
    }
}

impl FromStr for ExecutorId {
    type Err = InterpreterError;

    fn from_str(s: &str) -> Result<Self> {
        Self::new(s)
    }
}

impl TryFrom<String> for ExecutorId {
    type Error = InterpreterError;

    fn try_from(value: String) -> Result<Self> {
        Self::new(value)
    }
}

impl From<ExecutorId> for String {
    fn from(id: ExecutorId) -> Self {
        id.0
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionState {
    Absent,
    Creating,
    AwaitingReady,
    Ready,
    Executing,
    Failed,
    Terminating,
}

/// Point-in-time view of one session.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub executor_id: ExecutorId,
    pub sandbox: SandboxName,
    pub state: SessionState,
    /// When the current sandbox became ready.
    pub sandbox_created_at: Option<DateTime<Utc>>,
    pub idle_secs: u64,
}

#[derive(Debug, Clone)]
pub struct SessionConfig {
    /// Limit on create plus readiness for one sandbox.
    pub ready_timeout: Duration,
    pub retry: RetryPolicy,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            ready_timeout: Duration::from_secs(120),
            retry: RetryPolicy::default(),
        }
    }
}

impl From<&ServiceConfig> for SessionConfig {
    fn from(config: &ServiceConfig) -> Self {
        Self {
            ready_timeout: config.ready_timeout(),
            retry: config.retry.clone(),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Provisioned {
    Created,
    Adopted,
}

#[derive(Debug, Clone, Copy)]
struct SessionStatus {
    state: SessionState,
    last_activity: Instant,
    created_at: Option<DateTime<Utc>>,
}

/// Guarded by the session's async mutex. `status` is mirrored outside the
/// lock so snapshots never wait on a running execution.
struct SessionInner {
    sandbox: Option<SandboxName>,
    /// Set once the slot has been removed from the registry; waiters must re-resolve.
    retired: bool,
    status: Arc<Mutex<SessionStatus>>,
}

impl SessionInner {
    fn status(&self) -> SessionStatus {
        *self.status.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn state(&self) -> SessionState {
        self.status().state
    }

    fn set_state(&self, state: SessionState) {
        self.status.lock().unwrap_or_else(|e| e.into_inner()).state = state;
    }

    fn set_created_at(&self, created_at: Option<DateTime<Utc>>) {
        self.status.lock().unwrap_or_else(|e| e.into_inner()).created_at = created_at;
    }

    fn touch(&self) {
        self.status
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .last_activity = Instant::now();
    }
}

struct SessionSlot {
    inner: Arc<AsyncMutex<SessionInner>>,
    status: Arc<Mutex<SessionStatus>>,
}

impl SessionSlot {
    fn new() -> Self {
        let status = Arc::new(Mutex::new(SessionStatus {
            state: SessionState::Absent,
            last_activity: Instant::now(),
            created_at: None,
        }));
        Self {
            inner: Arc::new(AsyncMutex::new(SessionInner {
                sandbox: None,
                retired: false,
                status: Arc::clone(&status),
            })),
            status,
        }
    }

    fn status(&self) -> SessionStatus {
        *self.status.lock().unwrap_or_else(|e| e.into_inner())
    }
}

/// Exclusive use of a ready sandbox.
///
/// Dropping the lease releases the session and records its last activity.
pub struct SessionLease {
    executor_id: ExecutorId,
    sandbox: SandboxName,
    guard: OwnedMutexGuard<SessionInner>,
}

impl SessionLease {
    pub fn executor_id(&self) -> &ExecutorId {
        &self.executor_id
    }

    pub fn sandbox(&self) -> &SandboxName {
        &self.sandbox
    }

    /// The sandbox is in an unknown state; the next acquire replaces it.
    pub fn mark_failed(&mut self, reason: &dyn fmt::Display) {
        if self.guard.state() != SessionState::Failed {
            self.guard.set_state(SessionState::Failed);
            METRICS.inc_sessions_failed();
            obs::emit_session_failed(self.executor_id.as_str(), reason);
        }
    }

    pub fn is_failed(&self) -> bool {
        self.guard.state() == SessionState::Failed
    }
}

impl fmt::Debug for SessionLease {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SessionLease")
            .field("executor_id", &self.executor_id)
            .field("sandbox", &self.sandbox)
            .finish()
    }
}

impl Drop for SessionLease {
    fn drop(&mut self) {
        if self.guard.state() == SessionState::Executing {
            self.guard.set_state(SessionState::Ready);
        }
        self.guard.touch();
    }
}

pub struct SessionManager {
    cluster: Arc<dyn SandboxCluster>,
    config: SessionConfig,
    sessions: Mutex<HashMap<ExecutorId, Arc<SessionSlot>>>,
}

impl SessionManager {
    pub fn new(cluster: Arc<dyn SandboxCluster>, config: SessionConfig) -> Self {
        Self {
            cluster,
            config,
            sessions: Mutex::new(HashMap::new()),
        }
    }

    pub fn cluster(&self) -> &Arc<dyn SandboxCluster> {
        &self.cluster
    }

    fn registry(&self) -> std::sync::MutexGuard<'_, HashMap<ExecutorId, Arc<SessionSlot>>> {
        self.sessions.lock().unwrap_or_else(|e| e.into_inner())
    }

    fn slot(&self, executor_id: &ExecutorId) -> Arc<SessionSlot> {
        Arc::clone(
            self.registry()
                .entry(executor_id.clone())
                .or_insert_with(|| Arc::new(SessionSlot::new())),
        )
    }

    fn existing(&self, executor_id: &ExecutorId) -> Option<Arc<SessionSlot>> {
        self.registry().get(executor_id).cloned()
    }

    fn remove_slot(&self, executor_id: &ExecutorId, slot: &Arc<SessionSlot>) {
        let mut sessions = self.registry();
        if sessions
            .get(executor_id)
            .is_some_and(|current| Arc::ptr_eq(current, slot))
        {
            sessions.remove(executor_id);
        }
    }

    /// Wait for exclusive use of the session's sandbox, creating it if needed.
    ///
    /// Callers queue in arrival order. A `Failed` session is torn down and
    /// recreated here; a creation failure leaves the session `Failed` and is
    /// returned to this caller only.
    pub async fn acquire(&self, executor_id: &ExecutorId) -> Result<SessionLease> {
        loop {
            let slot = self.slot(executor_id);
            let mut guard = Arc::clone(&slot.inner).lock_owned().await;
            if guard.retired {
                continue;
            }

            if guard.state() == SessionState::Ready && !self.is_alive(&guard).await {
                guard.set_state(SessionState::Failed);
                METRICS.inc_sessions_failed();
                obs::emit_session_failed(executor_id.as_str(), &"sandbox stopped responding");
            }
            if guard.state() != SessionState::Ready {
                self.provision(executor_id, &mut guard).await?;
            }

            let sandbox = match &guard.sandbox {
                Some(name) => name.clone(),
                None => executor_id.sandbox_name(),
            };
            guard.set_state(SessionState::Executing);
            guard.touch();
            return Ok(SessionLease {
                executor_id: executor_id.clone(),
                sandbox,
                guard,
            });
        }
    }

    /// Ping the session's sandbox. Transient errors are retried; anything else means it is gone.
    async fn is_alive(&self, inner: &SessionInner) -> bool {
        let Some(name) = &inner.sandbox else {
            return false;
        };
        self.ping(name).await
    }

    async fn ping(&self, name: &SandboxName) -> bool {
        let cluster = &self.cluster;
        match retry_transient(&self.config.retry, "sandbox.ping", move || {
            cluster.exec(name, ExecutorRequest::Ping)
        })
        .await
        {
            Ok(ExecutorResponse::Pong) => true,
            Ok(other) => {
                warn!(sandbox = %name, response = ?other, "unexpected ping response");
                false
            }
            Err(e) => {
                warn!(sandbox = %name, error = %e, "sandbox unreachable");
                false
            }
        }
    }

    async fn provision(&self, executor_id: &ExecutorId, inner: &mut SessionInner) -> Result<()> {
        let name = executor_id.sandbox_name();

        inner.set_created_at(None);
        if let Some(previous) = inner.sandbox.take() {
            debug!(executor_id = %executor_id, sandbox = %previous, "replacing failed sandbox");
            if let Err(e) = self.teardown(&previous, "replaced after failure").await {
                warn!(sandbox = %previous, error = %e, "could not terminate failed sandbox");
            }
        }

        let started = Instant::now();
        let limit = self.config.ready_timeout;
        let outcome = tokio::time::timeout(limit, self.create_and_wait(&name, inner)).await;

        let err = match outcome {
            Ok(Ok(provisioned)) => {
                inner.sandbox = Some(name.clone());
                inner.set_state(SessionState::Ready);
                inner.set_created_at(Some(Utc::now()));
                match provisioned {
                    Provisioned::Created => {
                        METRICS.inc_sandboxes_created();
                        obs::emit_sandbox_created(
                            executor_id.as_str(),
                            name.as_str(),
                            started.elapsed().as_millis() as u64,
                        );
                    }
                    Provisioned::Adopted => {
                        info!(executor_id = %executor_id, sandbox = %name, "adopted existing sandbox");
                    }
                }
                return Ok(());
            }
            Ok(Err(ClusterError::ReadyTimeout(_))) | Err(_) => InterpreterError::SandboxTimeout {
                sandbox: name.to_string(),
                phase: TimeoutPhase::Readiness,
                limit_secs: limit.as_secs(),
            },
            Ok(Err(e)) => InterpreterError::SandboxCreation {
                sandbox: name.to_string(),
                reason: e.to_string(),
            },
        };

        inner.set_state(SessionState::Failed);
        METRICS.inc_sessions_failed();
        obs::emit_session_failed(executor_id.as_str(), &err);
        // Half-created sandboxes are not left running.
        if let Err(e) = self.teardown(&name, "creation failed").await {
            warn!(sandbox = %name, error = %e, "cleanup after failed creation did not complete");
            inner.sandbox = Some(name);
        }
        Err(err)
    }

    async fn create_and_wait(
        &self,
        name: &SandboxName,
        inner: &SessionInner,
    ) -> std::result::Result<Provisioned, ClusterError> {
        let cluster = &self.cluster;
        let policy = &self.config.retry;

        inner.set_state(SessionState::Creating);
        match retry_transient(policy, "sandbox.create", move || cluster.create(name)).await {
            Ok(()) => {}
            Err(ClusterError::AlreadyExists(_)) => {
                inner.set_state(SessionState::AwaitingReady);
                if self.adopt(name).await {
                    return Ok(Provisioned::Adopted);
                }
                warn!(sandbox = %name, "existing sandbox is unusable, replacing it");
                inner.set_state(SessionState::Creating);
                retry_transient(policy, "sandbox.terminate", move || cluster.terminate(name))
                    .await?;
                retry_transient(policy, "sandbox.create", move || cluster.create(name)).await?;
            }
            Err(e) => return Err(e),
        }

        inner.set_state(SessionState::AwaitingReady);
        let timeout = self.config.ready_timeout;
        retry_transient(policy, "sandbox.await_ready", move || {
            cluster.await_ready(name, timeout)
        })
        .await?;
        Ok(Provisioned::Created)
    }

    /// Whether a sandbox found under `name` becomes ready and answers a ping.
    async fn adopt(&self, name: &SandboxName) -> bool {
        let timeout = self.config.ready_timeout.min(ADOPT_READY_TIMEOUT);
        if let Err(e) = self.cluster.await_ready(name, timeout).await {
            debug!(sandbox = %name, error = %e, "existing sandbox did not become ready");
            return false;
        }
        self.ping(name).await
    }

    async fn teardown(
        &self,
        name: &SandboxName,
        reason: &str,
    ) -> std::result::Result<(), ClusterError> {
        let cluster = &self.cluster;
        retry_transient(&self.config.retry, "sandbox.terminate", move || {
            cluster.terminate(name)
        })
        .await?;
        obs::emit_sandbox_terminated(name.as_str(), reason);
        Ok(())
    }

    /// Mark a session failed without holding a lease. Waits for any in-flight execution.
    pub async fn mark_failed(&self, executor_id: &ExecutorId, reason: &dyn fmt::Display) {
        let Some(slot) = self.existing(executor_id) else {
            return;
        };
        let inner = slot.inner.lock().await;
        if !inner.retired && inner.sandbox.is_some() && inner.state() != SessionState::Failed {
            inner.set_state(SessionState::Failed);
            METRICS.inc_sessions_failed();
            obs::emit_session_failed(executor_id.as_str(), reason);
        }
    }

    /// Tear down a session's sandbox and forget the session.
    pub async fn terminate(&self, executor_id: &ExecutorId) -> Result<()> {
        let Some(slot) = self.existing(executor_id) else {
            return Ok(());
        };
        let mut inner = Arc::clone(&slot.inner).lock_owned().await;
        if inner.retired {
            return Ok(());
        }
        if let Some(name) = inner.sandbox.clone() {
            inner.set_state(SessionState::Terminating);
            if let Err(e) = self.teardown(&name, "terminated").await {
                inner.set_state(SessionState::Failed);
                return Err(InterpreterError::from_cluster(name.as_str(), e));
            }
        }
        inner.sandbox = None;
        inner.set_state(SessionState::Absent);
        inner.set_created_at(None);
        inner.retired = true;
        self.remove_slot(executor_id, &slot);
        Ok(())
    }

    /// Terminate every session idle for at least `ttl`. Busy sessions are skipped.
    ///
    /// Returns the ids whose sandboxes were torn down.
    pub async fn evict_idle(&self, ttl: Duration) -> Vec<ExecutorId> {
        let now = Instant::now();
        let mut candidates = Vec::new();
        {
            let mut sessions = self.registry();
            sessions.retain(|id, slot| {
                // A held or contended lock means the session is in use.
                let Ok(mut guard) = Arc::clone(&slot.inner).try_lock_owned() else {
                    return true;
                };
                if now.saturating_duration_since(guard.status().last_activity) < ttl {
                    return true;
                }
                if guard.sandbox.is_none() {
                    guard.retired = true;
                    return false;
                }
                candidates.push((id.clone(), Arc::clone(slot), guard));
                true
            });
        }

        let mut evicted = Vec::new();
        for (id, slot, mut guard) in candidates {
            let idle = now.saturating_duration_since(guard.status().last_activity);
            let Some(name) = guard.sandbox.clone() else {
                continue;
            };
            guard.set_state(SessionState::Terminating);
            match self.teardown(&name, "idle").await {
                Ok(()) => {
                    guard.sandbox = None;
                    guard.set_state(SessionState::Absent);
                    guard.retired = true;
                    self.remove_slot(&id, &slot);
                    drop(guard);
                    METRICS.inc_sessions_evicted();
                    obs::emit_session_evicted(id.as_str(), idle.as_secs());
                    evicted.push(id);
                }
                Err(e) => {
                    // Retried on the next sweep.
                    warn!(executor_id = %id, sandbox = %name, error = %e, "idle eviction failed");
                    guard.set_state(SessionState::Failed);
                }
            }
        }
        evicted
    }

    /// Run [`evict_idle`](Self::evict_idle) every `interval` until the manager is dropped.
    pub fn spawn_idle_sweeper(self: &Arc<Self>, interval: Duration, ttl: Duration) -> JoinHandle<()> {
        let manager: Weak<Self> = Arc::downgrade(self);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
            ticker.tick().await;
            loop {
                ticker.tick().await;
                let Some(manager) = manager.upgrade() else {
                    break;
                };
                let evicted = manager.evict_idle(ttl).await;
                if !evicted.is_empty() {
                    info!(count = evicted.len(), "idle sweep evicted sessions");
                }
                METRICS.flush();
            }
        })
    }

    /// Terminate all sandboxes concurrently. Returns how many were torn down.
    pub async fn shutdown(&self) -> usize {
        let ids: Vec<ExecutorId> = self.registry().keys().cloned().collect();
        let results = join_all(ids.iter().map(|id| self.terminate(id))).await;

        let mut terminated = 0;
        for (id, result) in ids.iter().zip(results) {
            match result {
                Ok(()) => terminated += 1,
                Err(e) => warn!(executor_id = %id, error = %e, "shutdown could not terminate sandbox"),
            }
        }
        info!(terminated, "session manager shut down");
        terminated
    }

    pub fn snapshot(&self) -> Vec<SessionInfo> {
        let now = Instant::now();
        let mut sessions: Vec<SessionInfo> = self
            .registry()
            .iter()
            .map(|(id, slot)| {
                let status = slot.status();
                SessionInfo {
                    executor_id: id.clone(),
                    sandbox: id.sandbox_name(),
                    state: status.state,
                    sandbox_created_at: status.created_at,
                    idle_secs: now.saturating_duration_since(status.last_activity).as_secs(),
                }
            })
            .collect();
        sessions.sort_by(|a, b| a.executor_id.cmp(&b.executor_id));
        sessions
    }

    pub fn state(&self, executor_id: &ExecutorId) -> Option<SessionState> {
        self.existing(executor_id).map(|slot| slot.status().state)
    }

    pub fn len(&self) -> usize {
        self.registry().len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
