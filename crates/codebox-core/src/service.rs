//! `CodeInterpreter`: the three endpoints plus file exchange, wired from config.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tokio::task::JoinHandle;
use tracing::info;

use crate::cas::fs::FsFileStore;
use crate::cas::{Digest, FileStore};
use crate::cluster::{KubectlCluster, LocalCluster, SandboxCluster};
use crate::config::{Backend, ServiceConfig};
use crate::custom_tool::{CustomToolExecutor, ToolOutcome};
use crate::dispatcher::{DispatchConfig, ExecutionDispatcher, ExecutionRequest, ExecutionResult};
use crate::error::{InterpreterError, Result};
use crate::session::{ExecutorId, SessionConfig, SessionInfo, SessionManager};

/// Reply to a parse request: the tool description or the reasons it was rejected.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ParseCustomToolResponse {
    Success {
        tool_name: String,
        /// JSON Schema, serialised.
        tool_input_schema_json: String,
        tool_description: String,
    },
    Error {
        error_messages: Vec<String>,
    },
}

/// Reply to a tool invocation. `Error` carries the tool's own failure output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ExecuteCustomToolResponse {
    Success { tool_output_json: String },
    Error { stderr: String },
}

/// Build the cluster backend named in `config`.
pub fn build_cluster(config: &ServiceConfig) -> Arc<dyn SandboxCluster> {
    match config.backend {
        Backend::Local => Arc::new(LocalCluster::new(
            config.local_root.clone(),
            config.executor.clone(),
        )),
        Backend::Kubectl => Arc::new(KubectlCluster::new(config.kubernetes.clone())),
    }
}

pub struct CodeInterpreter {
    config: ServiceConfig,
    store: Arc<dyn FileStore>,
    sessions: Arc<SessionManager>,
    dispatcher: Arc<ExecutionDispatcher>,
    tools: CustomToolExecutor,
    sweeper: Option<JoinHandle<()>>,
}

impl CodeInterpreter {
    /// Filesystem store and the configured backend.
    pub fn from_config(config: ServiceConfig) -> Result<Self> {
        config.validate()?;
        let store = Arc::new(FsFileStore::new(&config.file_storage_path)?);
        let cluster = build_cluster(&config);
        Ok(Self::new(config, cluster, store))
    }

    /// Wire the components together. Inside a tokio runtime the idle sweeper
    /// starts immediately; otherwise call [`start_idle_sweeper`](Self::start_idle_sweeper)
    /// once a runtime is available.
    pub fn new(
        config: ServiceConfig,
        cluster: Arc<dyn SandboxCluster>,
        store: Arc<dyn FileStore>,
    ) -> Self {
        info!(
            backend = cluster.backend(),
            idle_ttl_secs = config.idle_ttl_secs,
            "code interpreter starting"
        );
        let sessions = Arc::new(SessionManager::new(cluster, SessionConfig::from(&config)));
        let dispatcher = Arc::new(ExecutionDispatcher::new(
            Arc::clone(&sessions),
            Arc::clone(&store),
            DispatchConfig::from(&config),
        ));
        let tools = CustomToolExecutor::new(Arc::clone(&dispatcher));
        let mut service = Self {
            config,
            store,
            sessions,
            dispatcher,
            tools,
            sweeper: None,
        };
        if tokio::runtime::Handle::try_current().is_ok() {
            service.start_idle_sweeper();
        }
        service
    }

    /// Start idle eviction on the current tokio runtime. Calling twice is a no-op.
    pub fn start_idle_sweeper(&mut self) {
        if self.sweeper.is_none() {
            self.sweeper = Some(
                self.sessions
                    .spawn_idle_sweeper(self.config.sweep_interval(), self.config.idle_ttl()),
            );
        }
    }

    pub fn config(&self) -> &ServiceConfig {
        &self.config
    }

    pub fn sessions(&self) -> &Arc<SessionManager> {
        &self.sessions
    }

    pub async fn execute(
        &self,
        executor_id: &str,
        request: ExecutionRequest,
    ) -> Result<ExecutionResult> {
        let executor_id = ExecutorId::new(executor_id)?;
        self.dispatcher.execute(&executor_id, request).await
    }

    pub async fn parse_custom_tool(&self, tool_source_code: &str) -> Result<ParseCustomToolResponse> {
        match self.tools.parse(tool_source_code).await {
            Ok(tool) => Ok(ParseCustomToolResponse::Success {
                tool_name: tool.name,
                tool_input_schema_json: serde_json::to_string(&tool.input_schema)?,
                tool_description: tool.description,
            }),
            Err(InterpreterError::ToolParse { errors }) => Ok(ParseCustomToolResponse::Error {
                error_messages: errors,
            }),
            Err(e) => Err(e),
        }
    }

    pub async fn execute_custom_tool(
        &self,
        tool_source_code: &str,
        tool_input: &Value,
        env: BTreeMap<String, String>,
    ) -> Result<ExecuteCustomToolResponse> {
        match self.tools.execute(tool_source_code, tool_input, env).await? {
            ToolOutcome::Success(value) => Ok(ExecuteCustomToolResponse::Success {
                tool_output_json: serde_json::to_string(&value)?,
            }),
            ToolOutcome::Error { stderr } => Ok(ExecuteCustomToolResponse::Error { stderr }),
        }
    }

    pub async fn upload(&self, content: &[u8]) -> Result<Digest> {
        Ok(self.store.put(content).await?)
    }

    pub async fn download(&self, digest: &Digest) -> Result<Vec<u8>> {
        Ok(self.store.get(digest).await?)
    }

    pub fn session_snapshot(&self) -> Vec<SessionInfo> {
        self.sessions.snapshot()
    }

    /// Stop the sweeper and terminate every sandbox.
    pub async fn shutdown(mut self) -> usize {
        if let Some(sweeper) = self.sweeper.take() {
            sweeper.abort();
        }
        self.sessions.shutdown().await
    }
}

impl Drop for CodeInterpreter {
    fn drop(&mut self) {
        if let Some(sweeper) = self.sweeper.take() {
            sweeper.abort();
        }
    }
}
