//! Custom tool parse and execute against a real `python3`, when one is installed.

mod common;

use std::collections::BTreeMap;

use codebox_core::{ExecuteCustomToolResponse, ParseCustomToolResponse};
use serde_json::{json, Value};

use common::{interpreter, python_available, python_executor, service_config};

const ADD_TOOL: &str = r#"
import typing

def add(a: int, b: typing.Optional[int] = None, *, label: str = "sum") -> int:
    """Add two numbers.

    :param a: first operand
    :param b: second operand
    :return: the total
    """
    print("this must not reach stdout")
    return a + (b or 0)
"#;

#[tokio::test]
async fn parse_describes_the_tool() {
    if !python_available() {
        eprintln!("python3 not available, skipping");
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let (cluster, service) = interpreter(dir.path(), service_config(dir.path(), python_executor()));

    let response = service.parse_custom_tool(ADD_TOOL).await.unwrap();
    let ParseCustomToolResponse::Success {
        tool_name,
        tool_input_schema_json,
        tool_description,
    } = response
    else {
        panic!("parse failed: {response:?}");
    };

    assert_eq!(tool_name, "add");
    assert_eq!(tool_description, "Add two numbers.\n\nReturns: int -- the total");
    let schema: Value = serde_json::from_str(&tool_input_schema_json).unwrap();
    assert_eq!(schema["title"], "add");
    assert_eq!(schema["required"], json!(["a"]));
    assert_eq!(schema["properties"]["a"]["type"], "integer");
    assert_eq!(schema["properties"]["a"]["description"], "first operand");
    assert_eq!(
        schema["properties"]["b"]["anyOf"],
        json!([{"type": "null"}, {"type": "integer"}])
    );
    assert_eq!(schema["additionalProperties"], false);

    // The throwaway session is gone.
    assert_eq!(cluster.sandbox_count(), 0);
    assert!(service.session_snapshot().is_empty());
}

#[tokio::test]
async fn parse_rejects_source_without_a_single_function() {
    if !python_available() {
        eprintln!("python3 not available, skipping");
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let (_cluster, service) =
        interpreter(dir.path(), service_config(dir.path(), python_executor()));

    for source in ["x = 1\n", "def f(a: int):\n    pass\ndef g(b: int):\n    pass\n"] {
        let response = service.parse_custom_tool(source).await.unwrap();
        match response {
            ParseCustomToolResponse::Error { error_messages } => {
                assert!(!error_messages.is_empty());
            }
            other => panic!("expected a parse error, got {other:?}"),
        }
    }
}

#[tokio::test]
async fn parse_reports_signature_problems() {
    if !python_available() {
        eprintln!("python3 not available, skipping");
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let (_cluster, service) =
        interpreter(dir.path(), service_config(dir.path(), python_executor()));

    let response = service
        .parse_custom_tool("def f(a, *args, **kwargs):\n    pass\n")
        .await
        .unwrap();
    let ParseCustomToolResponse::Error { error_messages } = response else {
        panic!("expected a parse error");
    };
    assert!(error_messages.iter().any(|m| m.contains("*args")));
    assert!(error_messages.iter().any(|m| m.contains("**kwargs")));
    assert!(error_messages.iter().any(|m| m.contains("type annotations")));
}

#[tokio::test]
async fn execute_returns_the_json_result() {
    if !python_available() {
        eprintln!("python3 not available, skipping");
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let (_cluster, service) =
        interpreter(dir.path(), service_config(dir.path(), python_executor()));

    let response = service
        .execute_custom_tool(ADD_TOOL, &json!({"a": 2, "b": 3}), BTreeMap::new())
        .await
        .unwrap();

    assert_eq!(
        response,
        ExecuteCustomToolResponse::Success {
            tool_output_json: "5".into()
        }
    );
}

#[tokio::test]
async fn raising_tool_yields_an_error_payload() {
    if !python_available() {
        eprintln!("python3 not available, skipping");
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let (_cluster, service) =
        interpreter(dir.path(), service_config(dir.path(), python_executor()));

    let source = "def explode(reason: str) -> None:\n    raise ValueError(reason)\n";
    let response = service
        .execute_custom_tool(source, &json!({"reason": "boom"}), BTreeMap::new())
        .await
        .unwrap();

    match response {
        ExecuteCustomToolResponse::Error { stderr } => {
            assert!(stderr.contains("ValueError: boom"), "stderr: {stderr}");
        }
        other => panic!("expected a tool error, got {other:?}"),
    }
}

#[tokio::test]
async fn tool_env_is_visible() {
    if !python_available() {
        eprintln!("python3 not available, skipping");
        return;
    }
    let dir = tempfile::tempdir().unwrap();
    let (_cluster, service) =
        interpreter(dir.path(), service_config(dir.path(), python_executor()));

    let source = "import os\n\ndef token() -> str:\n    return os.environ['API_TOKEN']\n";
    let env = BTreeMap::from([("API_TOKEN".to_string(), "s3cret".to_string())]);
    let response = service
        .execute_custom_tool(source, &json!({}), env)
        .await
        .unwrap();

    assert_eq!(
        response,
        ExecuteCustomToolResponse::Success {
            tool_output_json: "\"s3cret\"".into()
        }
    );
}
