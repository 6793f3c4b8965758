//! In-process cluster: one directory per sandbox under a local root.
//!
//! No isolation beyond the filesystem layout. Used for development, the CLI's
//! `--backend local` and the test suite.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use tracing::debug;

use super::{ClusterError, SandboxCluster, SandboxName};
use crate::executor::protocol::{ExecutorRequest, ExecutorResponse};
use crate::executor::{ExecutorConfig, SandboxExecutor};

const READY_POLL: Duration = Duration::from_millis(25);

pub struct LocalCluster {
    root: PathBuf,
    config: ExecutorConfig,
    sandboxes: Mutex<HashMap<SandboxName, SandboxExecutor>>,
}

impl LocalCluster {
    pub fn new(root: impl Into<PathBuf>, config: ExecutorConfig) -> Self {
        Self {
            root: root.into(),
            config,
            sandboxes: Mutex::new(HashMap::new()),
        }
    }

    /// Directory backing a sandbox's workspace.
    pub fn sandbox_root(&self, name: &SandboxName) -> PathBuf {
        self.root.join(name.as_str())
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Number of live sandboxes.
    pub fn sandbox_count(&self) -> usize {
        self.sandboxes.lock().map(|s| s.len()).unwrap_or(0)
    }

    fn lookup(&self, name: &SandboxName) -> Result<SandboxExecutor, ClusterError> {
        let sandboxes = self
            .sandboxes
            .lock()
            .map_err(|_| ClusterError::Fatal("sandbox table poisoned".into()))?;
        sandboxes
            .get(name)
            .cloned()
            .ok_or_else(|| ClusterError::NotFound(name.to_string()))
    }

    fn forget(&self, name: &SandboxName) {
        if let Ok(mut sandboxes) = self.sandboxes.lock() {
            sandboxes.remove(name);
        }
    }
}

#[async_trait]
impl SandboxCluster for LocalCluster {
    fn backend(&self) -> &'static str {
        "local"
    }

    /// A ready directory left by an earlier process is registered and reported
    /// as `AlreadyExists` so the caller can adopt it. Anything else found at the
    /// sandbox path is wiped.
    async fn create(&self, name: &SandboxName) -> Result<(), ClusterError> {
        let dir = self.sandbox_root(name);
        let executor = {
            let mut sandboxes = self
                .sandboxes
                .lock()
                .map_err(|_| ClusterError::Fatal("sandbox table poisoned".into()))?;
            if sandboxes.contains_key(name) {
                return Err(ClusterError::AlreadyExists(name.to_string()));
            }
            let executor = SandboxExecutor::new(&dir, self.config.clone());
            sandboxes.insert(name.clone(), executor.clone());
            executor
        };

        if executor.is_ready().await {
            debug!(sandbox = %name, "found running sandbox from an earlier process");
            return Err(ClusterError::AlreadyExists(name.to_string()));
        }

        if tokio::fs::try_exists(&dir).await.unwrap_or(false) {
            debug!(sandbox = %name, "removing stale sandbox directory");
            if let Err(e) = tokio::fs::remove_dir_all(&dir).await {
                self.forget(name);
                return Err(ClusterError::Fatal(format!(
                    "removing stale {}: {e}",
                    dir.display()
                )));
            }
        }

        if let Err(e) = executor.prepare().await {
            self.forget(name);
            return Err(ClusterError::Fatal(format!("preparing {}: {e}", dir.display())));
        }
        Ok(())
    }

    async fn await_ready(&self, name: &SandboxName, timeout: Duration) -> Result<(), ClusterError> {
        let executor = self.lookup(name)?;
        let wait = async {
            while !executor.is_ready().await {
                tokio::time::sleep(READY_POLL).await;
            }
        };
        tokio::time::timeout(timeout, wait)
            .await
            .map_err(|_| ClusterError::ReadyTimeout(timeout))
    }

    async fn terminate(&self, name: &SandboxName) -> Result<(), ClusterError> {
        let removed = self
            .sandboxes
            .lock()
            .map_err(|_| ClusterError::Fatal("sandbox table poisoned".into()))?
            .remove(name);
        let dir = self.sandbox_root(name);
        match tokio::fs::remove_dir_all(&dir).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {}
            Err(e) => return Err(ClusterError::Fatal(format!("removing {}: {e}", dir.display()))),
        }
        debug!(sandbox = %name, existed = removed.is_some(), "local sandbox removed");
        Ok(())
    }

    async fn exec(
        &self,
        name: &SandboxName,
        request: ExecutorRequest,
    ) -> Result<ExecutorResponse, ClusterError> {
        let executor = self.lookup(name)?;
        Ok(executor.handle(request).await)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cluster(dir: &Path) -> LocalCluster {
        LocalCluster::new(dir, ExecutorConfig::default())
    }

    #[tokio::test]
    async fn create_ready_exec_terminate() {
        let dir = tempfile::tempdir().unwrap();
        let cluster = cluster(dir.path());
        let name = SandboxName::for_executor("alice");

        cluster.create(&name).await.unwrap();
        cluster
            .await_ready(&name, Duration::from_secs(5))
            .await
            .unwrap();
        assert_eq!(cluster.sandbox_count(), 1);

        let response = cluster.exec(&name, ExecutorRequest::Ping).await.unwrap();
        assert_eq!(response, ExecutorResponse::Pong);

        cluster.terminate(&name).await.unwrap();
        assert_eq!(cluster.sandbox_count(), 0);
        assert!(!cluster.sandbox_root(&name).exists());
    }

    #[tokio::test]
    async fn duplicate_create_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let cluster = cluster(dir.path());
        let name = SandboxName::for_executor("bob");

        cluster.create(&name).await.unwrap();
        let err = cluster.create(&name).await.unwrap_err();
        assert!(matches!(err, ClusterError::AlreadyExists(_)));
    }

    #[tokio::test]
    async fn exec_against_missing_sandbox_is_not_found() {
        let dir = tempfile::tempdir().unwrap();
        let cluster = cluster(dir.path());
        let err = cluster
            .exec(&SandboxName::for_executor("ghost"), ExecutorRequest::Snapshot)
            .await
            .unwrap_err();
        assert!(matches!(err, ClusterError::NotFound(_)));
    }

    #[tokio::test]
    async fn terminate_missing_sandbox_succeeds() {
        let dir = tempfile::tempdir().unwrap();
        let cluster = cluster(dir.path());
        cluster
            .terminate(&SandboxName::for_executor("never-created"))
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn stale_directory_is_wiped_on_create() {
        let dir = tempfile::tempdir().unwrap();
        let cluster = cluster(dir.path());
        let name = SandboxName::for_executor("carol");
        let root = cluster.sandbox_root(&name);
        std::fs::create_dir_all(&root).unwrap();
        std::fs::write(root.join("leftover.txt"), b"old").unwrap();

        cluster.create(&name).await.unwrap();
        assert!(!root.join("leftover.txt").exists());
    }

    #[tokio::test]
    async fn ready_sandbox_from_earlier_process_is_reported_and_usable() {
        let dir = tempfile::tempdir().unwrap();
        let name = SandboxName::for_executor("dave");
        {
            let first = cluster(dir.path());
            first.create(&name).await.unwrap();
            first
                .exec(&name, ExecutorRequest::write_file("state.txt", b"42"))
                .await
                .unwrap();
        }

        let second = cluster(dir.path());
        let err = second.create(&name).await.unwrap_err();
        assert!(matches!(err, ClusterError::AlreadyExists(_)));
        second
            .await_ready(&name, Duration::from_secs(5))
            .await
            .unwrap();
        let response = second
            .exec(&name, ExecutorRequest::ReadFile { path: "state.txt".into() })
            .await
            .unwrap();
        match response {
            ExecutorResponse::File { content_b64 } => {
                assert_eq!(ExecutorResponse::decode_file(&content_b64).unwrap(), b"42");
            }
            other => panic!("unexpected response: {other:?}"),
        }
    }

    #[tokio::test]
    async fn unremovable_stale_path_fails_create() {
        let dir = tempfile::tempdir().unwrap();
        let cluster = cluster(dir.path());
        let name = SandboxName::for_executor("erin");
        // A plain file where the sandbox directory belongs cannot be wiped as a directory.
        std::fs::write(cluster.sandbox_root(&name), b"not a directory").unwrap();

        let err = cluster.create(&name).await.unwrap_err();
        assert!(matches!(err, ClusterError::Fatal(_)));
        assert_eq!(cluster.sandbox_count(), 0);
    }
}
