//! Shared fixtures: a local cluster whose "interpreter" is `sh`.

#![allow(dead_code)]

use std::path::Path;
use std::sync::Arc;

use codebox_core::{
    Backend, CodeInterpreter, ExecutorConfig, LocalCluster, MemoryFileStore, SandboxCluster,
    ServiceConfig,
};

pub fn shell_executor() -> ExecutorConfig {
    ExecutorConfig {
        interpreter: "sh".to_string(),
        script_suffix: ".sh".to_string(),
        auto_install: false,
        ..ExecutorConfig::default()
    }
}

pub fn python_executor() -> ExecutorConfig {
    ExecutorConfig {
        auto_install: false,
        ..ExecutorConfig::default()
    }
}

pub fn service_config(root: &Path, executor: ExecutorConfig) -> ServiceConfig {
    ServiceConfig {
        backend: Backend::Local,
        local_root: root.to_path_buf(),
        file_storage_path: root.join("files"),
        executor,
        ..ServiceConfig::default()
    }
}

/// Interpreter backed by an in-memory store and a local cluster under `root`.
pub fn interpreter(root: &Path, config: ServiceConfig) -> (Arc<LocalCluster>, CodeInterpreter) {
    let cluster = Arc::new(LocalCluster::new(root.join("sandboxes"), config.executor.clone()));
    let shared: Arc<dyn SandboxCluster> = cluster.clone();
    let interpreter = CodeInterpreter::new(config, shared, Arc::new(MemoryFileStore::new()));
    (cluster, interpreter)
}

pub fn shell_interpreter(root: &Path) -> (Arc<LocalCluster>, CodeInterpreter) {
    interpreter(root, service_config(root, shell_executor()))
}

/// Skip tests that need a Python interpreter on hosts without one.
pub fn python_available() -> bool {
    std::process::Command::new("python3")
        .arg("--version")
        .output()
        .map(|o| o.status.success())
        .unwrap_or(false)
}
