//! Service configuration.
//!
//! Every field has a default, so an empty TOML file is a valid configuration.
//! Binaries layer `CODEBOX_*` environment variables and flags on top.

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::cluster::kubectl::KubernetesConfig;
use crate::error::{InterpreterError, Result};
use crate::executor::ExecutorConfig;
use crate::retry::RetryPolicy;

/// Which [`SandboxCluster`](crate::cluster::SandboxCluster) implementation to run against.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Backend {
    #[default]
    Kubectl,
    Local,
}

impl std::str::FromStr for Backend {
    type Err = InterpreterError;

    fn from_str(s: &str) -> Result<Self> {
        match s {
            "kubectl" | "kubernetes" => Ok(Backend::Kubectl),
            "local" => Ok(Backend::Local),
            other => Err(InterpreterError::Config(format!(
                "unknown backend '{other}' (expected kubectl or local)"
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct ServiceConfig {
    /// Root of the content-addressed file store.
    pub file_storage_path: PathBuf,
    pub backend: Backend,
    /// Sandbox directories for the local backend.
    pub local_root: PathBuf,
    /// Sessions idle longer than this are evicted.
    pub idle_ttl_secs: u64,
    pub sweep_interval_secs: u64,
    /// Limit on sandbox creation plus readiness.
    pub ready_timeout_secs: u64,
    /// Wall-clock limit for the submitted code itself.
    pub execution_timeout_secs: u64,
    /// Added to the execution limit to bound a whole dispatch (install, file transfer).
    pub deadline_grace_secs: u64,
    pub retry: RetryPolicy,
    pub kubernetes: KubernetesConfig,
    pub executor: ExecutorConfig,
}

impl Default for ServiceConfig {
    fn default() -> Self {
        Self {
            file_storage_path: PathBuf::from("./.tmp/files"),
            backend: Backend::default(),
            local_root: PathBuf::from("./.tmp/sandboxes"),
            idle_ttl_secs: 600,
            sweep_interval_secs: 60,
            ready_timeout_secs: 120,
            execution_timeout_secs: 60,
            deadline_grace_secs: 360,
            retry: RetryPolicy::default(),
            kubernetes: KubernetesConfig::default(),
            executor: ExecutorConfig::default(),
        }
    }
}

impl ServiceConfig {
    pub fn from_toml_str(raw: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(raw).map_err(|e| InterpreterError::Config(e.to_string()))?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: &Path) -> Result<Self> {
        let raw = std::fs::read_to_string(path).map_err(|e| {
            InterpreterError::Config(format!("reading {}: {e}", path.display()))
        })?;
        let config: Self = toml::from_str(&raw)
            .map_err(|e| InterpreterError::Config(format!("{}: {e}", path.display())))?;
        config.validate()?;
        Ok(config)
    }

    /// Load from `path` if given, defaults otherwise.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        match path {
            Some(path) => Self::from_file(path),
            None => Ok(Self::default()),
        }
    }

    pub fn validate(&self) -> Result<()> {
        let positive = [
            ("idle_ttl_secs", self.idle_ttl_secs),
            ("sweep_interval_secs", self.sweep_interval_secs),
            ("ready_timeout_secs", self.ready_timeout_secs),
            ("execution_timeout_secs", self.execution_timeout_secs),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(InterpreterError::Config(format!("{field} must be greater than 0")));
            }
        }
        if self.executor.interpreter.trim().is_empty() {
            return Err(InterpreterError::Config("executor.interpreter is empty".into()));
        }
        if self.backend == Backend::Kubectl && self.kubernetes.executor_image.trim().is_empty() {
            return Err(InterpreterError::Config(
                "kubernetes.executor_image is required for the kubectl backend".into(),
            ));
        }
        Ok(())
    }

    pub fn idle_ttl(&self) -> Duration {
        Duration::from_secs(self.idle_ttl_secs)
    }

    pub fn sweep_interval(&self) -> Duration {
        Duration::from_secs(self.sweep_interval_secs)
    }

    pub fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }

    pub fn execution_timeout(&self) -> Duration {
        Duration::from_secs(self.execution_timeout_secs)
    }

    pub fn deadline_grace(&self) -> Duration {
        Duration::from_secs(self.deadline_grace_secs)
    }
}
