//! Custom tools: a Python function exposed as a callable tool.
//!
//! Both operations are ordinary executions. A generated program embeds the
//! tool source as a JSON string literal, runs through the dispatcher in a
//! throwaway session, and reports back on stdout.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, warn};

use crate::dispatcher::{ExecutionDispatcher, ExecutionRequest, ExecutionResult};
use crate::error::{InterpreterError, Result};
use crate::executor::scan_imports;
use crate::session::ExecutorId;

const INTROSPECT_PROGRAM: &str = include_str!("introspect.py");
const INVOKE_PROGRAM: &str = include_str!("invoke.py");

/// What introspection found in the tool source.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolDefinition {
    pub name: String,
    pub description: String,
    /// JSON Schema (draft-07) for the keyword arguments.
    pub input_schema: Value,
}

/// Result of invoking a tool. A tool that raises is still a well-formed outcome.
#[derive(Debug, Clone, PartialEq)]
pub enum ToolOutcome {
    Success(Value),
    Error { stderr: String },
}

impl ToolOutcome {
    /// Treat a tool-level failure as an error.
    pub fn into_result(self) -> Result<Value> {
        match self {
            ToolOutcome::Success(value) => Ok(value),
            ToolOutcome::Error { stderr } => Err(InterpreterError::ToolExecution { stderr }),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(tag = "status", rename_all = "snake_case")]
enum IntrospectionReport {
    Ok { tool: ToolDefinition },
    Error { errors: Vec<String> },
}

/// Program that prints an [`IntrospectionReport`] for `tool_source_code`.
pub fn introspection_program(tool_source_code: &str) -> Result<String> {
    Ok(format!(
        "TOOL_SOURCE = {}\n{INTROSPECT_PROGRAM}",
        serde_json::to_string(tool_source_code)?
    ))
}

/// Program that calls the tool with `tool_input` and prints the JSON result.
///
/// The tool's top-level modules are imported up front so the executor's
/// dependency step sees them.
pub fn invocation_program(tool_source_code: &str, tool_input: &Value) -> Result<String> {
    let mut program = String::new();
    for module in scan_imports(tool_source_code) {
        program.push_str(&format!("try:\n    import {module}\nexcept ImportError:\n    pass\n"));
    }
    program.push_str(&format!(
        "TOOL_SOURCE = {}\nTOOL_INPUT = {}\n{INVOKE_PROGRAM}",
        serde_json::to_string(tool_source_code)?,
        serde_json::to_string(&serde_json::to_string(tool_input)?)?,
    ));
    Ok(program)
}

pub struct CustomToolExecutor {
    dispatcher: Arc<ExecutionDispatcher>,
}

impl CustomToolExecutor {
    pub fn new(dispatcher: Arc<ExecutionDispatcher>) -> Self {
        Self { dispatcher }
    }

    /// Locate the single tool function and describe it.
    pub async fn parse(&self, tool_source_code: &str) -> Result<ToolDefinition> {
        let program = introspection_program(tool_source_code)?;
        let result = self.run_ephemeral(program, BTreeMap::new()).await?;

        if result.exit_code != 0 {
            return Err(InterpreterError::ToolParse {
                errors: vec![failure_text(&result)],
            });
        }
        match serde_json::from_str::<IntrospectionReport>(result.stdout.trim()) {
            Ok(IntrospectionReport::Ok { tool }) => Ok(tool),
            Ok(IntrospectionReport::Error { errors }) => Err(InterpreterError::ToolParse { errors }),
            Err(e) => Err(InterpreterError::ToolParse {
                errors: vec![format!("introspection produced unreadable output: {e}")],
            }),
        }
    }

    /// Invoke the tool with keyword arguments taken from `tool_input`.
    pub async fn execute(
        &self,
        tool_source_code: &str,
        tool_input: &Value,
        env: BTreeMap<String, String>,
    ) -> Result<ToolOutcome> {
        if !tool_input.is_object() {
            return Err(InterpreterError::InvalidRequest(
                "tool input must be a JSON object".into(),
            ));
        }
        let program = invocation_program(tool_source_code, tool_input)?;
        let result = self.run_ephemeral(program, env).await?;

        if result.exit_code != 0 {
            return Ok(ToolOutcome::Error {
                stderr: result.stderr,
            });
        }
        // The tool's own prints are suppressed, so stdout is just the result.
        match serde_json::from_str(result.stdout.trim()) {
            Ok(value) => Ok(ToolOutcome::Success(value)),
            Err(e) => Ok(ToolOutcome::Error {
                stderr: format!("tool output is not valid JSON: {e}\n{}", result.stderr),
            }),
        }
    }

    async fn run_ephemeral(
        &self,
        program: String,
        env: BTreeMap<String, String>,
    ) -> Result<ExecutionResult> {
        let executor_id = ExecutorId::ephemeral("tool");
        debug!(executor_id = %executor_id, "running custom tool program");
        let request = ExecutionRequest {
            source_code: program,
            files: BTreeMap::new(),
            env,
        };
        let result = self.dispatcher.execute(&executor_id, request).await;
        if let Err(e) = self.dispatcher.sessions().terminate(&executor_id).await {
            warn!(executor_id = %executor_id, error = %e, "could not terminate tool sandbox");
        }
        result
    }
}

fn failure_text(result: &ExecutionResult) -> String {
    let stderr = result.stderr.trim();
    if stderr.is_empty() {
        format!("introspection exited with code {}", result.exit_code)
    } else {
        stderr.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn introspection_program_embeds_source_as_one_line() {
        let source = "import numpy as np\ndef f(x: int) -> int:\n    \"\"\"Doc.\"\"\"\n    return x\n";
        let program = introspection_program(source).unwrap();
        let first = program.lines().next().unwrap();

        assert!(first.starts_with("TOOL_SOURCE = \""));
        assert!(first.contains("\\n"));
        // Tool imports must not reach the dependency scanner during parsing.
        assert!(!scan_imports(&program).contains(&"numpy".to_string()));
    }

    #[test]
    fn invocation_program_surfaces_tool_imports() {
        let source = "import requests\nfrom bs4 import BeautifulSoup\ndef fetch(url: str) -> str:\n    return url\n";
        let program = invocation_program(source, &json!({"url": "https://example.com"})).unwrap();
        let imports = scan_imports(&program);

        assert!(imports.contains(&"requests".to_string()));
        assert!(imports.contains(&"bs4".to_string()));
        assert!(program.contains("TOOL_INPUT = \"{\\\"url\\\""));
    }

    #[test]
    fn report_decoding() {
        let ok: IntrospectionReport = serde_json::from_str(
            r#"{"status": "ok", "tool": {"name": "f", "description": "", "input_schema": {}}}"#,
        )
        .unwrap();
        assert!(matches!(ok, IntrospectionReport::Ok { tool } if tool.name == "f"));

        let err: IntrospectionReport =
            serde_json::from_str(r#"{"status": "error", "errors": ["a", "b"]}"#).unwrap();
        assert!(matches!(err, IntrospectionReport::Error { errors } if errors.len() == 2));
    }

    #[test]
    fn tool_error_converts_to_tool_execution() {
        let outcome = ToolOutcome::Error {
            stderr: "ValueError: boom".into(),
        };
        assert!(matches!(
            outcome.into_result(),
            Err(InterpreterError::ToolExecution { stderr }) if stderr.contains("boom")
        ));
        assert_eq!(
            ToolOutcome::Success(json!(3)).into_result().unwrap(),
            json!(3)
        );
    }
}
