//! codebox CLI
//!
//! Runs code in per-session sandboxes and exchanges files with the store.
//!
//! ## Commands
//!
//! - `execute`: run a script in the sandbox bound to an executor id
//! - `put` / `get`: upload or download a file by content hash
//! - `parse-tool`: describe a Python tool function
//! - `run-tool`: invoke a Python tool function with JSON input
//! - `resolve`: show which package an import installs

use std::collections::BTreeMap;
use std::io::{Read, Write};
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use codebox_core::executor::{PackageResolver, StaticPackageResolver};
use codebox_core::telemetry::init_tracing;
use codebox_core::{
    Backend, CodeInterpreter, Digest, ExecutionRequest, InterpreterError, ServiceConfig,
};
use serde::Serialize;
use serde_json::Value;
use tracing::{debug, Level};

#[derive(Parser)]
#[command(name = "codebox")]
#[command(author = "Stevedores Org")]
#[command(version = codebox_core::VERSION)]
#[command(about = "Sandboxed code execution with sticky sessions", long_about = None)]
struct Cli {
    /// Enable verbose output
    #[arg(short, long, global = true)]
    verbose: bool,

    /// Emit JSON-formatted log lines
    #[arg(long, global = true)]
    json: bool,

    /// TOML configuration file
    #[arg(long, global = true, env = "CODEBOX_CONFIG")]
    config: Option<PathBuf>,

    /// Sandbox backend: kubectl or local
    #[arg(long, global = true, env = "CODEBOX_BACKEND")]
    backend: Option<Backend>,

    /// Sandbox directory for the local backend
    #[arg(long, global = true, env = "CODEBOX_LOCAL_ROOT")]
    local_root: Option<PathBuf>,

    /// File store directory
    #[arg(long, global = true, env = "CODEBOX_FILE_STORAGE_PATH")]
    file_storage_path: Option<PathBuf>,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Run a script in a session sandbox
    Execute {
        /// Session key; calls with the same id share a sandbox
        #[arg(long, default_value = "default")]
        executor_id: String,

        /// Input file as PATH=HASH (repeatable)
        #[arg(long = "file", value_parser = parse_key_val)]
        files: Vec<(String, String)>,

        /// Environment variable as KEY=VALUE (repeatable)
        #[arg(long = "env", value_parser = parse_key_val)]
        env: Vec<(String, String)>,

        /// Keep the sandbox running after the command exits; a later
        /// `execute` with the same id picks it up
        #[arg(long)]
        keep: bool,

        /// Script file, or `-` for stdin
        script: PathBuf,
    },

    /// Upload a file and print its hash
    Put {
        file: PathBuf,
    },

    /// Download a file by hash
    Get {
        hash: String,

        /// Output path (default: stdout)
        #[arg(short, long)]
        output: Option<PathBuf>,
    },

    /// Describe the tool function defined in a Python file
    ParseTool {
        file: PathBuf,
    },

    /// Invoke the tool function defined in a Python file
    RunTool {
        file: PathBuf,

        /// Keyword arguments as a JSON object
        #[arg(long, default_value = "{}")]
        input: String,

        /// Environment variable as KEY=VALUE (repeatable)
        #[arg(long = "env", value_parser = parse_key_val)]
        env: Vec<(String, String)>,
    },

    /// Show which package would be installed for an import
    Resolve {
        import: String,
    },
}

/// What a command produced.
#[derive(Debug)]
enum Output {
    Json(Value),
    Bytes(Vec<u8>),
    Written(PathBuf),
}

#[derive(Serialize)]
struct PutResponse {
    hash: Digest,
    bytes: usize,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let level = if cli.verbose { Level::DEBUG } else { Level::WARN };
    init_tracing(cli.json, level);

    match run(cli).await? {
        Output::Json(value) => {
            println!("{}", serde_json::to_string_pretty(&value)?);
        }
        Output::Bytes(bytes) => {
            let mut stdout = std::io::stdout().lock();
            stdout.write_all(&bytes).context("writing to stdout")?;
            stdout.flush()?;
        }
        Output::Written(path) => {
            eprintln!("wrote {}", path.display());
        }
    }
    Ok(())
}

fn service_config(cli: &Cli) -> Result<ServiceConfig> {
    let mut config = ServiceConfig::load(cli.config.as_deref())?;
    if let Some(backend) = cli.backend {
        config.backend = backend;
    }
    if let Some(root) = &cli.local_root {
        config.local_root = root.clone();
    }
    if let Some(path) = &cli.file_storage_path {
        config.file_storage_path = path.clone();
    }
    config.validate()?;
    debug!(backend = ?config.backend, store = %config.file_storage_path.display(), "configuration loaded");
    Ok(config)
}

async fn run(cli: Cli) -> Result<Output> {
    let config = service_config(&cli)?;

    match cli.command {
        Commands::Execute {
            executor_id,
            files,
            env,
            keep,
            script,
        } => {
            let source_code = read_source(&script)?;
            let mut request = ExecutionRequest::new(source_code);
            for (path, hash) in files {
                let digest: Digest = hash
                    .parse()
                    .with_context(|| format!("invalid hash for {path}"))?;
                request = request.with_file(path, digest);
            }
            request.env = env.into_iter().collect();

            let service = CodeInterpreter::from_config(config)?;
            let result = service.execute(&executor_id, request).await;
            if !keep {
                service.shutdown().await;
            }
            Ok(Output::Json(serde_json::to_value(result?)?))
        }

        Commands::Put { file } => {
            let content =
                std::fs::read(&file).with_context(|| format!("reading {}", file.display()))?;
            let service = CodeInterpreter::from_config(config)?;
            let hash = service.upload(&content).await?;
            Ok(Output::Json(serde_json::to_value(PutResponse {
                hash,
                bytes: content.len(),
            })?))
        }

        Commands::Get { hash, output } => {
            let digest: Digest = hash.parse().context("invalid hash")?;
            let service = CodeInterpreter::from_config(config)?;
            let content = service.download(&digest).await?;
            match output {
                Some(path) => {
                    std::fs::write(&path, &content)
                        .with_context(|| format!("writing {}", path.display()))?;
                    Ok(Output::Written(path))
                }
                None => Ok(Output::Bytes(content)),
            }
        }

        Commands::ParseTool { file } => {
            let source = read_source(&file)?;
            let service = CodeInterpreter::from_config(config)?;
            let response = service.parse_custom_tool(&source).await?;
            Ok(Output::Json(serde_json::to_value(response)?))
        }

        Commands::RunTool { file, input, env } => {
            let source = read_source(&file)?;
            let input: Value = serde_json::from_str(&input).context("--input is not valid JSON")?;
            let service = CodeInterpreter::from_config(config)?;
            let response = service
                .execute_custom_tool(&source, &input, env.into_iter().collect::<BTreeMap<_, _>>())
                .await?;
            Ok(Output::Json(serde_json::to_value(response)?))
        }

        Commands::Resolve { import } => {
            let resolver = StaticPackageResolver::default()
                .with_identity_fallback(config.executor.identity_fallback);
            let package = resolver
                .resolve(&import)
                .map_err(InterpreterError::from)?;
            Ok(Output::Json(serde_json::json!({
                "import": import,
                "package": package,
            })))
        }
    }
}

fn read_source(path: &Path) -> Result<String> {
    if path == Path::new("-") {
        let mut source = String::new();
        std::io::stdin()
            .read_to_string(&mut source)
            .context("reading script from stdin")?;
        Ok(source)
    } else {
        std::fs::read_to_string(path).with_context(|| format!("reading {}", path.display()))
    }
}

/// Parse `KEY=VALUE`; the value may itself contain `=`.
fn parse_key_val(s: &str) -> std::result::Result<(String, String), String> {
    let (key, value) = s
        .split_once('=')
        .ok_or_else(|| format!("expected KEY=VALUE, got '{s}'"))?;
    if key.is_empty() {
        return Err(format!("empty key in '{s}'"));
    }
    Ok((key.to_string(), value.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use clap::CommandFactory;

    fn local_cli(dir: &Path, args: &[&str]) -> Cli {
        let root = dir.join("sandboxes");
        let store = dir.join("files");
        let mut argv = vec![
            "codebox".to_string(),
            "--backend".to_string(),
            "local".to_string(),
            "--local-root".to_string(),
            root.display().to_string(),
            "--file-storage-path".to_string(),
            store.display().to_string(),
        ];
        argv.extend(args.iter().map(|a| a.to_string()));
        Cli::try_parse_from(argv).unwrap()
    }

    #[test]
    fn cli_definition_is_consistent() {
        Cli::command().debug_assert();
    }

    #[test]
    fn key_val_parsing() {
        assert_eq!(
            parse_key_val("input.csv=abc").unwrap(),
            ("input.csv".to_string(), "abc".to_string())
        );
        assert_eq!(
            parse_key_val("QUERY=a=b").unwrap(),
            ("QUERY".to_string(), "a=b".to_string())
        );
        assert!(parse_key_val("novalue").is_err());
        assert!(parse_key_val("=x").is_err());
    }

    #[test]
    fn execute_flags_parse() {
        let cli = Cli::try_parse_from([
            "codebox",
            "execute",
            "--executor-id",
            "nb-1",
            "--file",
            "a.csv=00",
            "--env",
            "K=V",
            "script.py",
        ])
        .unwrap();
        match cli.command {
            Commands::Execute {
                executor_id,
                files,
                env,
                keep,
                script,
            } => {
                assert_eq!(executor_id, "nb-1");
                assert_eq!(files, vec![("a.csv".to_string(), "00".to_string())]);
                assert_eq!(env, vec![("K".to_string(), "V".to_string())]);
                assert!(!keep);
                assert_eq!(script, PathBuf::from("script.py"));
            }
            _ => panic!("expected execute"),
        }
    }

    #[test]
    fn unknown_backend_is_rejected() {
        assert!(Cli::try_parse_from(["codebox", "--backend", "docker", "put", "x"]).is_err());
    }

    #[tokio::test]
    async fn put_then_get_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let file = dir.path().join("data.bin");
        std::fs::write(&file, b"\x00\x01payload").unwrap();

        let put = run(local_cli(dir.path(), &["put", &file.display().to_string()]))
            .await
            .unwrap();
        let Output::Json(value) = put else {
            panic!("expected JSON output");
        };
        let hash = value["hash"].as_str().unwrap().to_string();
        assert_eq!(hash, Digest::compute(b"\x00\x01payload").to_hex());
        assert_eq!(value["bytes"], 9);

        let out = dir.path().join("copy.bin");
        let get = run(local_cli(
            dir.path(),
            &["get", &hash, "-o", &out.display().to_string()],
        ))
        .await
        .unwrap();
        assert!(matches!(get, Output::Written(_)));
        assert_eq!(std::fs::read(&out).unwrap(), b"\x00\x01payload");
    }

    fn shell_config(dir: &Path) -> String {
        let path = dir.join("codebox.toml");
        std::fs::write(
            &path,
            "[executor]\ninterpreter = \"sh\"\nscript_suffix = \".sh\"\nauto_install = false\n",
        )
        .unwrap();
        path.display().to_string()
    }

    async fn execute_script(dir: &Path, config: &str, script: &str, extra: &[&str]) -> Value {
        let path = dir.join("script.sh");
        std::fs::write(&path, script).unwrap();
        let path = path.display().to_string();
        let mut args = vec!["--config", config, "execute", "--executor-id", "nb"];
        args.extend_from_slice(extra);
        args.push(&path);
        match run(local_cli(dir, &args)).await.unwrap() {
            Output::Json(value) => value,
            other => panic!("expected JSON output, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn kept_sandbox_is_reused_by_the_next_execute() {
        let dir = tempfile::tempdir().unwrap();
        let config = shell_config(dir.path());

        let first = execute_script(dir.path(), &config, "echo 42 > state.txt", &["--keep"]).await;
        assert_eq!(first["exit_code"], 0);

        let second = execute_script(dir.path(), &config, "cat state.txt || echo gone", &[]).await;
        assert_eq!(second["stdout"], "42\n");

        // Without --keep the sandbox is gone afterwards.
        let third = execute_script(dir.path(), &config, "cat state.txt || echo gone", &[]).await;
        assert_eq!(third["stdout"], "gone\n");
    }

    #[tokio::test]
    async fn get_unknown_hash_fails() {
        let dir = tempfile::tempdir().unwrap();
        let unknown = Digest::compute(b"nothing").to_hex();
        assert!(run(local_cli(dir.path(), &["get", &unknown])).await.is_err());
    }

    #[tokio::test]
    async fn resolve_uses_alias_table() {
        let dir = tempfile::tempdir().unwrap();
        let output = run(local_cli(dir.path(), &["resolve", "sklearn"]))
            .await
            .unwrap();
        let Output::Json(value) = output else {
            panic!("expected JSON output");
        };
        assert_eq!(value["package"], "scikit-learn");
    }
}
