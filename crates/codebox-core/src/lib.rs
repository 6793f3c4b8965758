//! codebox core library
//!
//! Sandboxed code execution with one sticky sandbox per caller-chosen
//! executor id, automatic dependency installation inside the sandbox, and
//! content-addressed file exchange.
//!
//! The pieces, bottom up:
//!
//! - [`cas`]: content-addressed file store
//! - [`executor`]: the in-sandbox side (runs code, manages files, installs packages)
//! - [`cluster`]: create / wait / exec / delete sandboxes
//! - [`session`]: lifecycle manager, one sandbox per executor id
//! - [`dispatcher`]: one execution request end to end
//! - [`custom_tool`]: Python functions as callable tools
//! - [`service`]: the facade binaries use

pub mod cas;
pub mod cluster;
pub mod config;
pub mod custom_tool;
pub mod dispatcher;
pub mod error;
pub mod executor;
pub mod metrics;
pub mod obs;
pub mod retry;
pub mod service;
pub mod session;
pub mod telemetry;

pub use cas::fs::FsFileStore;
pub use cas::memory::MemoryFileStore;
pub use cas::{CasError, Digest, FileStore};

pub use cluster::{ClusterError, KubectlCluster, LocalCluster, SandboxCluster, SandboxName};
pub use config::{Backend, ServiceConfig};
pub use custom_tool::{CustomToolExecutor, ToolDefinition, ToolOutcome};
pub use dispatcher::{DispatchConfig, ExecutionDispatcher, ExecutionRequest, ExecutionResult};
pub use error::{InterpreterError, Result, TimeoutPhase};
pub use executor::{ExecutorConfig, ExecutorRequest, ExecutorResponse, SandboxExecutor};
pub use retry::RetryPolicy;
pub use service::{
    build_cluster, CodeInterpreter, ExecuteCustomToolResponse, ParseCustomToolResponse,
};
pub use session::{
    ExecutorId, SessionConfig, SessionInfo, SessionLease, SessionManager, SessionState,
};

/// Crate version, reported by both binaries.
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
