//! Sandbox provisioning capability.
//!
//! The orchestration layer never talks to a container runtime directly. It
//! asks a [`SandboxCluster`] to create, wait on, exec into and delete
//! sandboxes by name. `exec` carries one executor protocol request and
//! returns its response.

pub mod kubectl;
pub mod local;

use std::fmt;
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::cas::Digest;
use crate::executor::protocol::{ExecutorRequest, ExecutorResponse};
use crate::retry::Transient;

pub use kubectl::KubectlCluster;
pub use local::LocalCluster;

/// Name of a sandbox, derived deterministically from the executor id.
///
/// Identical ids always map to the same name, which keeps the name usable as
/// a Kubernetes object name regardless of what characters the id contains.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SandboxName(String);

impl SandboxName {
    pub const PREFIX: &'static str = "codebox-";

    pub fn for_executor(executor_id: &str) -> Self {
        let digest = Digest::compute(executor_id.as_bytes());
        Self(format!("{}{}", Self::PREFIX, &digest.to_hex()[..16]))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SandboxName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Debug for SandboxName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SandboxName({})", self.0)
    }
}

/// Failure talking to the cluster.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum ClusterError {
    /// Worth retrying: API blips, container still starting, dropped connections.
    #[error("transient cluster error: {0}")]
    Transient(String),

    #[error("cluster error: {0}")]
    Fatal(String),

    #[error("sandbox not found: {0}")]
    NotFound(String),

    #[error("sandbox already exists: {0}")]
    AlreadyExists(String),

    #[error("sandbox not ready after {}s", .0.as_secs())]
    ReadyTimeout(Duration),
}

impl Transient for ClusterError {
    fn is_transient(&self) -> bool {
        matches!(self, ClusterError::Transient(_))
    }
}

/// Create, inspect and destroy sandboxes.
#[async_trait]
pub trait SandboxCluster: Send + Sync {
    /// Short backend name for logs.
    fn backend(&self) -> &'static str;

    /// Start a sandbox. Fails with [`ClusterError::AlreadyExists`] if the name is taken.
    async fn create(&self, name: &SandboxName) -> Result<(), ClusterError>;

    /// Block until the sandbox's executor answers, or `timeout` elapses.
    async fn await_ready(&self, name: &SandboxName, timeout: Duration) -> Result<(), ClusterError>;

    /// Delete a sandbox. Deleting a missing sandbox succeeds.
    async fn terminate(&self, name: &SandboxName) -> Result<(), ClusterError>;

    /// Deliver one request to the sandbox's executor.
    async fn exec(
        &self,
        name: &SandboxName,
        request: ExecutorRequest,
    ) -> Result<ExecutorResponse, ClusterError>;
}
