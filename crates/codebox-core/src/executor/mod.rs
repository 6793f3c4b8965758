//! In-sandbox executor: the long-lived side of the sandbox boundary.
//!
//! One instance per sandbox, owning that sandbox's workspace directory and its
//! layered dependency directory. Executions are serialised by the session
//! manager on the orchestrator side, not here.
//!
//! # Modules
//!
//! - [`imports`]: static scan of source for imported modules
//! - [`resolver`]: import name to installable package name
//! - [`workspace`]: path safety and content-hash snapshots
//! - [`protocol`]: `ExecutorRequest` / `ExecutorResponse` wire types

pub mod imports;
pub mod protocol;
pub mod resolver;
pub mod workspace;

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tokio::process::Command;
use tracing::{debug, info, warn};

use crate::cas::Digest;

pub use imports::scan_imports;
pub use protocol::{ExecutorErrorKind, ExecutorRequest, ExecutorResponse, RunOutput};
pub use resolver::{PackageResolver, ResolveError, StaticPackageResolver};

/// Errors raised inside the executor.
#[derive(Debug, thiserror::Error)]
pub enum ExecutorError {
    #[error("invalid path {path:?}: {reason}")]
    InvalidPath { path: String, reason: String },

    #[error("file not found in workspace: {0}")]
    NotFound(String),

    #[error("failed to start {program}: {source}")]
    Spawn {
        program: String,
        #[source]
        source: std::io::Error,
    },

    #[error("malformed request: {0}")]
    Protocol(String),

    #[error("io error: {0}")]
    Io(#[from] std::io::Error),
}

impl ExecutorError {
    pub fn kind(&self) -> ExecutorErrorKind {
        match self {
            ExecutorError::InvalidPath { .. } => ExecutorErrorKind::InvalidPath,
            ExecutorError::NotFound(_) => ExecutorErrorKind::NotFound,
            ExecutorError::Spawn { .. } => ExecutorErrorKind::Spawn,
            ExecutorError::Protocol(_) => ExecutorErrorKind::Protocol,
            ExecutorError::Io(_) => ExecutorErrorKind::Io,
        }
    }
}

/// Executor settings; deployed alongside the executor inside the sandbox image.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Program that runs submitted source.
    pub interpreter: String,
    /// Arguments placed before the script path.
    pub interpreter_args: Vec<String>,
    /// File suffix for the temporary script.
    pub script_suffix: String,
    /// Installer command prefix; `--target <deps_dir> <packages...>` is appended.
    pub installer: Vec<String>,
    /// Dependency directory, relative to the sandbox root unless absolute.
    pub deps_dir: PathBuf,
    /// Run the dependency resolution step before each execution.
    pub auto_install: bool,
    /// Fall back to the import name when no alias is known.
    pub identity_fallback: bool,
    pub default_timeout_secs: u64,
    pub install_timeout_secs: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            interpreter: "python3".to_string(),
            interpreter_args: Vec::new(),
            script_suffix: ".py".to_string(),
            installer: vec![
                "pip".to_string(),
                "install".to_string(),
                "--quiet".to_string(),
                "--disable-pip-version-check".to_string(),
            ],
            deps_dir: PathBuf::from(workspace::RESERVED_DIR).join("site-packages"),
            auto_install: true,
            identity_fallback: true,
            default_timeout_secs: 60,
            install_timeout_secs: 300,
        }
    }
}

/// Asks the interpreter which of the given top-level modules it cannot find.
const FIND_MISSING_MODULES: &str = r#"
import importlib.util, json, sys
missing = []
for name in json.loads(sys.argv[1]):
    try:
        if importlib.util.find_spec(name) is None:
            missing.append(name)
    except Exception:
        missing.append(name)
print(json.dumps(missing))
"#;

/// Runs code and manages files inside one sandbox root.
#[derive(Clone)]
pub struct SandboxExecutor {
    root: PathBuf,
    config: ExecutorConfig,
    resolver: Arc<dyn PackageResolver>,
}

impl std::fmt::Debug for SandboxExecutor {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SandboxExecutor")
            .field("root", &self.root)
            .field("config", &self.config)
            .finish_non_exhaustive()
    }
}

impl SandboxExecutor {
    pub fn new(root: impl Into<PathBuf>, config: ExecutorConfig) -> Self {
        let resolver =
            StaticPackageResolver::default().with_identity_fallback(config.identity_fallback);
        Self::with_resolver(root, config, Arc::new(resolver))
    }

    pub fn with_resolver(
        root: impl Into<PathBuf>,
        config: ExecutorConfig,
        resolver: Arc<dyn PackageResolver>,
    ) -> Self {
        Self {
            root: root.into(),
            config,
            resolver,
        }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn deps_dir(&self) -> PathBuf {
        if self.config.deps_dir.is_absolute() {
            self.config.deps_dir.clone()
        } else {
            self.root.join(&self.config.deps_dir)
        }
    }

    fn ready_marker(&self) -> PathBuf {
        self.root.join(workspace::RESERVED_DIR).join("ready")
    }

    /// Create the workspace and dependency directories and drop the readiness marker.
    pub async fn prepare(&self) -> Result<(), ExecutorError> {
        tokio::fs::create_dir_all(&self.root).await?;
        tokio::fs::create_dir_all(self.deps_dir()).await?;
        let marker = self.ready_marker();
        if let Some(parent) = marker.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&marker, b"").await?;
        Ok(())
    }

    pub async fn is_ready(&self) -> bool {
        tokio::fs::try_exists(self.ready_marker())
            .await
            .unwrap_or(false)
    }

    /// Serve one protocol request. Failures become [`ExecutorResponse::Error`].
    pub async fn handle(&self, request: ExecutorRequest) -> ExecutorResponse {
        let op = request.op();
        let result = match request {
            ExecutorRequest::Ping => Ok(ExecutorResponse::Pong),
            ExecutorRequest::Run {
                source_code,
                env,
                timeout_secs,
            } => self
                .run(&source_code, &env, timeout_secs.map(Duration::from_secs))
                .await
                .map(ExecutorResponse::Ran),
            ExecutorRequest::WriteFile { path, content_b64 } => {
                match protocol::decode_content(&content_b64) {
                    Ok(content) => self
                        .write_file(&path, &content)
                        .await
                        .map(|digest| ExecutorResponse::Written { digest }),
                    Err(e) => Err(ExecutorError::Protocol(format!("bad base64 payload: {e}"))),
                }
            }
            ExecutorRequest::ReadFile { path } => self
                .read_file(&path)
                .await
                .map(|content| ExecutorResponse::file(&content)),
            ExecutorRequest::Snapshot => self
                .snapshot()
                .await
                .map(|files| ExecutorResponse::Snapshot { files }),
        };

        result.unwrap_or_else(|err| {
            warn!(op = op, error = %err, "executor request failed");
            ExecutorResponse::Error {
                kind: err.kind(),
                message: err.to_string(),
            }
        })
    }

    /// Write `content` at a workspace path, creating parent directories.
    pub async fn write_file(&self, path: &str, content: &[u8]) -> Result<Digest, ExecutorError> {
        let relative = workspace::normalize_path(path)?;
        let target = self.root.join(&relative);
        if let Some(parent) = target.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }
        tokio::fs::write(&target, content).await?;
        debug!(path = %relative, bytes = content.len(), "file materialised");
        Ok(Digest::compute(content))
    }

    pub async fn read_file(&self, path: &str) -> Result<Vec<u8>, ExecutorError> {
        let relative = workspace::normalize_path(path)?;
        tokio::fs::read(self.root.join(&relative))
            .await
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => ExecutorError::NotFound(relative),
                _ => ExecutorError::Io(e),
            })
    }

    /// Content hashes of every tracked workspace file.
    pub async fn snapshot(&self) -> Result<BTreeMap<String, Digest>, ExecutorError> {
        let root = self.root.clone();
        tokio::task::spawn_blocking(move || workspace::snapshot_blocking(&root))
            .await
            .map_err(|e| ExecutorError::Io(std::io::Error::other(e)))?
    }

    /// Resolve dependencies, then run `source_code` with a wall-clock limit.
    ///
    /// Resolution and installation problems never abort the run; they are
    /// prepended to `stderr` as `codebox:` diagnostics and the script then
    /// fails (or not) on its own terms.
    pub async fn run(
        &self,
        source_code: &str,
        env: &BTreeMap<String, String>,
        timeout: Option<Duration>,
    ) -> Result<RunOutput, ExecutorError> {
        let timeout = timeout.unwrap_or(Duration::from_secs(self.config.default_timeout_secs));
        tokio::fs::create_dir_all(&self.root).await?;

        let diagnostics = if self.config.auto_install {
            self.prepare_dependencies(source_code).await
        } else {
            Vec::new()
        };

        // The script lives outside the workspace so it never shows up as an output file.
        let script_dir = tempfile::tempdir()?;
        let script = script_dir
            .path()
            .join(format!("script{}", self.config.script_suffix));
        tokio::fs::write(&script, source_code).await?;

        let mut cmd = Command::new(&self.config.interpreter);
        cmd.args(&self.config.interpreter_args)
            .arg(&script)
            .current_dir(&self.root)
            .envs(env)
            .env("PYTHONPATH", self.python_path(env.get("PYTHONPATH")))
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        let child = cmd.spawn().map_err(|source| ExecutorError::Spawn {
            program: self.config.interpreter.clone(),
            source,
        })?;

        let mut output = match tokio::time::timeout(timeout, child.wait_with_output()).await {
            Ok(result) => {
                let output = result?;
                RunOutput {
                    stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
                    stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
                    exit_code: output.status.code().unwrap_or(-1),
                    timed_out: false,
                }
            }
            Err(_) => {
                // Dropping the wait future drops the child, and kill_on_drop reaps it.
                warn!(limit_secs = timeout.as_secs(), "execution timed out, process killed");
                RunOutput {
                    stdout: String::new(),
                    stderr: "Execution timed out".to_string(),
                    exit_code: -1,
                    timed_out: true,
                }
            }
        };

        if !diagnostics.is_empty() {
            let mut stderr = diagnostics.join("\n");
            stderr.push('\n');
            stderr.push_str(&output.stderr);
            output.stderr = stderr;
        }

        info!(exit_code = output.exit_code, timed_out = output.timed_out, "run finished");
        Ok(output)
    }

    /// Workspace first so local modules resolve, then installed dependencies.
    fn python_path(&self, caller: Option<&String>) -> String {
        let base = format!("{}:{}", self.root.display(), self.deps_dir().display());
        match caller {
            Some(extra) if !extra.is_empty() => format!("{base}:{extra}"),
            _ => base,
        }
    }

    /// Install whatever the source imports that the environment lacks.
    /// Returns human-readable diagnostics for anything that could not be provided.
    async fn prepare_dependencies(&self, source_code: &str) -> Vec<String> {
        let imports = scan_imports(source_code);
        if imports.is_empty() {
            return Vec::new();
        }

        let missing = match self.missing_modules(&imports).await {
            Ok(missing) => missing,
            Err(reason) => {
                warn!(%reason, "missing-module check failed, skipping installation");
                return Vec::new();
            }
        };
        if missing.is_empty() {
            return Vec::new();
        }

        let mut diagnostics = Vec::new();
        let mut packages = Vec::new();
        for module in &missing {
            match self.resolver.resolve(module) {
                Ok(package) if !packages.contains(&package) => packages.push(package),
                Ok(_) => {}
                Err(err) => diagnostics.push(format!("codebox: PackageResolutionError: {err}")),
            }
        }
        if packages.is_empty() {
            return diagnostics;
        }

        info!(?packages, "installing missing dependencies");
        if let Err(reason) = self.install(&packages).await {
            // Retry one by one so a single bad name doesn't block the rest.
            debug!(%reason, "batch install failed, isolating packages");
            for package in &packages {
                if let Err(reason) = self.install(std::slice::from_ref(package)).await {
                    diagnostics.push(format!("codebox: could not install {package}: {reason}"));
                }
            }
        }
        diagnostics
    }

    async fn missing_modules(&self, modules: &[String]) -> Result<Vec<String>, String> {
        let mut cmd = Command::new(&self.config.interpreter);
        cmd.args(&self.config.interpreter_args)
            .arg("-c")
            .arg(FIND_MISSING_MODULES)
            .arg(serde_json::to_string(modules).map_err(|e| e.to_string())?)
            .current_dir(&self.root)
            .env("PYTHONPATH", self.python_path(None))
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let output = tokio::time::timeout(Duration::from_secs(30), cmd.output())
            .await
            .map_err(|_| "module lookup timed out".to_string())?
            .map_err(|e| e.to_string())?;
        if !output.status.success() {
            return Err(tail(&String::from_utf8_lossy(&output.stderr)));
        }
        serde_json::from_slice(&output.stdout).map_err(|e| e.to_string())
    }

    async fn install(&self, packages: &[String]) -> Result<(), String> {
        let Some((program, args)) = self.config.installer.split_first() else {
            return Err("no installer configured".to_string());
        };
        let deps_dir = self.deps_dir();
        tokio::fs::create_dir_all(&deps_dir)
            .await
            .map_err(|e| e.to_string())?;

        let mut cmd = Command::new(program);
        cmd.args(args)
            .arg("--target")
            .arg(&deps_dir)
            .args(packages)
            .current_dir(&self.root)
            .stdin(Stdio::null())
            .kill_on_drop(true);

        let limit = Duration::from_secs(self.config.install_timeout_secs);
        let output = tokio::time::timeout(limit, cmd.output())
            .await
            .map_err(|_| format!("installation timed out after {}s", limit.as_secs()))?
            .map_err(|e| format!("failed to start {program}: {e}"))?;

        if output.status.success() {
            Ok(())
        } else {
            Err(tail(&String::from_utf8_lossy(&output.stderr)))
        }
    }
}

/// Last non-empty line of tool output, for compact diagnostics.
fn tail(text: &str) -> String {
    text.lines()
        .rev()
        .find(|l| !l.trim().is_empty())
        .unwrap_or("unknown error")
        .trim()
        .to_string()
}
