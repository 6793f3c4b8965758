//! codebox-executor: the process that lives inside every sandbox.
//!
//! - `serve`: prepare the workspace, mark it ready, and stay up until SIGTERM
//! - `probe`: exit 0 only if the workspace is ready (readiness probe)
//! - `exec`: read one JSON request on stdin, write one JSON response on stdout

use std::path::PathBuf;

use anyhow::{bail, Context, Result};
use clap::{Parser, Subcommand};
use codebox_core::executor::protocol::ExecutorErrorKind;
use codebox_core::telemetry::init_tracing;
use codebox_core::{ExecutorConfig, ExecutorRequest, ExecutorResponse, SandboxExecutor, ServiceConfig};
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{info, Level};

#[derive(Parser)]
#[command(name = "codebox-executor")]
#[command(author = "Stevedores Org")]
#[command(version = codebox_core::VERSION)]
#[command(about = "In-sandbox executor for codebox", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true, env = "CODEBOX_LOG_JSON")]
    json: bool,

    /// TOML file whose `[executor]` section configures the interpreter and installer
    #[arg(long, global = true, env = "CODEBOX_CONFIG")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Prepare the workspace and wait for termination
    Serve {
        #[arg(long, default_value = "/workspace", env = "CODEBOX_WORKSPACE")]
        root: PathBuf,
    },

    /// Exit successfully once the workspace is ready
    Probe {
        #[arg(long, default_value = "/workspace", env = "CODEBOX_WORKSPACE")]
        root: PathBuf,
    },

    /// Handle one protocol request from stdin
    Exec {
        #[arg(long, default_value = "/workspace", env = "CODEBOX_WORKSPACE")]
        root: PathBuf,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let level = if cli.verbose { Level::DEBUG } else { Level::INFO };
    init_tracing(cli.json, level);

    let config = load_executor_config(cli.config.as_ref())?;

    match cli.command {
        Commands::Serve { root } => serve(SandboxExecutor::new(root, config)).await,
        Commands::Probe { root } => {
            if SandboxExecutor::new(&root, config).is_ready().await {
                Ok(())
            } else {
                bail!("workspace {} is not ready", root.display())
            }
        }
        Commands::Exec { root } => {
            let mut input = Vec::new();
            tokio::io::stdin()
                .read_to_end(&mut input)
                .await
                .context("reading request from stdin")?;

            let response = respond(&SandboxExecutor::new(root, config), &input).await;
            let mut payload = serde_json::to_vec(&response).context("encoding response")?;
            payload.push(b'\n');

            let mut stdout = tokio::io::stdout();
            stdout.write_all(&payload).await.context("writing response")?;
            stdout.flush().await.context("flushing response")?;
            Ok(())
        }
    }
}

fn load_executor_config(path: Option<&PathBuf>) -> Result<ExecutorConfig> {
    let config = ServiceConfig::load(path.map(PathBuf::as_path))
        .context("loading executor configuration")?;
    Ok(config.executor)
}

async fn serve(executor: SandboxExecutor) -> Result<()> {
    executor
        .prepare()
        .await
        .with_context(|| format!("preparing workspace {}", executor.root().display()))?;
    info!(root = %executor.root().display(), "executor ready");

    wait_for_shutdown().await?;
    info!("executor shutting down");
    Ok(())
}

#[cfg(unix)]
async fn wait_for_shutdown() -> Result<()> {
    use tokio::signal::unix::{signal, SignalKind};

    let mut terminate = signal(SignalKind::terminate()).context("installing SIGTERM handler")?;
    tokio::select! {
        result = tokio::signal::ctrl_c() => result.context("waiting for ctrl-c")?,
        _ = terminate.recv() => {}
    }
    Ok(())
}

#[cfg(not(unix))]
async fn wait_for_shutdown() -> Result<()> {
    tokio::signal::ctrl_c().await.context("waiting for ctrl-c")
}

/// Decode one request and serve it. Malformed input becomes a protocol error response.
async fn respond(executor: &SandboxExecutor, input: &[u8]) -> ExecutorResponse {
    match serde_json::from_slice::<ExecutorRequest>(input) {
        Ok(request) => executor.handle(request).await,
        Err(e) => ExecutorResponse::Error {
            kind: ExecutorErrorKind::Protocol,
            message: format!("malformed request: {e}"),
        },
    }
}
