//! Sandbox faults mid-call: the failing request errors, the next one recovers.

mod common;

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use codebox_core::{
    ClusterError, CodeInterpreter, ExecutionRequest, ExecutorId, ExecutorRequest,
    ExecutorResponse, InterpreterError, LocalCluster, MemoryFileStore, SandboxCluster,
    SandboxName, SessionState,
};

use common::{service_config, shell_executor};

/// Local cluster that can drop `run` calls or refuse file transfers on demand.
struct FaultyCluster {
    inner: LocalCluster,
    drop_next_runs: AtomicUsize,
    refuse_next_writes: AtomicUsize,
    runs: AtomicUsize,
}

impl FaultyCluster {
    fn new(inner: LocalCluster) -> Self {
        Self {
            inner,
            drop_next_runs: AtomicUsize::new(0),
            refuse_next_writes: AtomicUsize::new(0),
            runs: AtomicUsize::new(0),
        }
    }

    fn take(counter: &AtomicUsize) -> bool {
        counter
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1))
            .is_ok()
    }
}

#[async_trait]
impl SandboxCluster for FaultyCluster {
    fn backend(&self) -> &'static str {
        "faulty"
    }

    async fn create(&self, name: &SandboxName) -> Result<(), ClusterError> {
        self.inner.create(name).await
    }

    async fn await_ready(&self, name: &SandboxName, timeout: Duration) -> Result<(), ClusterError> {
        self.inner.await_ready(name, timeout).await
    }

    async fn terminate(&self, name: &SandboxName) -> Result<(), ClusterError> {
        self.inner.terminate(name).await
    }

    async fn exec(
        &self,
        name: &SandboxName,
        request: ExecutorRequest,
    ) -> Result<ExecutorResponse, ClusterError> {
        match &request {
            ExecutorRequest::Run { .. } => {
                self.runs.fetch_add(1, Ordering::SeqCst);
                if Self::take(&self.drop_next_runs) {
                    return Err(ClusterError::Transient("connection reset by peer".into()));
                }
            }
            ExecutorRequest::WriteFile { .. } if Self::take(&self.refuse_next_writes) => {
                return Err(ClusterError::Transient("connection refused".into()));
            }
            _ => {}
        }
        self.inner.exec(name, request).await
    }
}

fn faulty_service(root: &std::path::Path) -> (Arc<FaultyCluster>, CodeInterpreter) {
    let mut config = service_config(root, shell_executor());
    config.retry.backoff_base_ms = 1;
    config.retry.backoff_max_ms = 5;
    let cluster = Arc::new(FaultyCluster::new(LocalCluster::new(
        root.join("sandboxes"),
        shell_executor(),
    )));
    let shared: Arc<dyn SandboxCluster> = cluster.clone();
    let service = CodeInterpreter::new(config, shared, Arc::new(MemoryFileStore::new()));
    (cluster, service)
}

#[tokio::test]
async fn dropped_run_marks_session_failed_then_recovers() {
    let dir = tempfile::tempdir().unwrap();
    let (cluster, service) = faulty_service(dir.path());
    let id = ExecutorId::new("fragile").unwrap();

    service
        .execute("fragile", ExecutionRequest::new("echo 1 > marker.txt"))
        .await
        .unwrap();

    cluster.drop_next_runs.store(1, Ordering::SeqCst);
    let err = service
        .execute("fragile", ExecutionRequest::new("echo never"))
        .await
        .unwrap_err();
    assert!(matches!(err, InterpreterError::Transport { .. }));
    assert_eq!(service.sessions().state(&id), Some(SessionState::Failed));
    // Runs are not idempotent and are never retried.
    assert_eq!(cluster.runs.load(Ordering::SeqCst), 2);

    let recovered = service
        .execute(
            "fragile",
            ExecutionRequest::new("test -f marker.txt && echo stale || echo fresh"),
        )
        .await
        .unwrap();
    assert_eq!(recovered.stdout, "fresh\n");
    assert_eq!(service.sessions().state(&id), Some(SessionState::Ready));
}

#[tokio::test]
async fn transient_file_transfer_errors_are_retried() {
    let dir = tempfile::tempdir().unwrap();
    let (cluster, service) = faulty_service(dir.path());
    let digest = service.upload(b"payload").await.unwrap();

    cluster.refuse_next_writes.store(2, Ordering::SeqCst);
    let result = service
        .execute(
            "retry",
            ExecutionRequest::new("cat data.bin").with_file("data.bin", digest),
        )
        .await
        .unwrap();

    assert_eq!(result.stdout, "payload");
    assert_eq!(cluster.refuse_next_writes.load(Ordering::SeqCst), 0);
}

#[tokio::test]
async fn failure_in_one_session_does_not_touch_another() {
    let dir = tempfile::tempdir().unwrap();
    let (cluster, service) = faulty_service(dir.path());

    service
        .execute("steady", ExecutionRequest::new("echo keep > keep.txt"))
        .await
        .unwrap();

    cluster.drop_next_runs.store(1, Ordering::SeqCst);
    service
        .execute("victim", ExecutionRequest::new("true"))
        .await
        .unwrap_err();

    let steady = service
        .execute("steady", ExecutionRequest::new("cat keep.txt"))
        .await
        .unwrap();
    assert_eq!(steady.stdout, "keep\n");
}

#[tokio::test]
async fn sandbox_lost_between_calls_is_replaced_transparently() {
    let dir = tempfile::tempdir().unwrap();
    let (cluster, service) = faulty_service(dir.path());
    let id = ExecutorId::new("idle").unwrap();

    service
        .execute("idle", ExecutionRequest::new("echo 1 > marker.txt"))
        .await
        .unwrap();

    // The sandbox disappears while nobody is using the session.
    cluster.inner.terminate(&id.sandbox_name()).await.unwrap();

    let result = service
        .execute(
            "idle",
            ExecutionRequest::new("test -f marker.txt && echo stale || echo hi"),
        )
        .await
        .unwrap();
    assert_eq!(result.stdout, "hi\n");
    assert_eq!(service.sessions().state(&id), Some(SessionState::Ready));
    assert_eq!(cluster.inner.sandbox_count(), 1);
}
