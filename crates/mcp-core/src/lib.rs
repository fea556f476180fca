// # -----------------------------
// # crates/mcp-core/src/lib.rs
// # -----------------------------
//! Schema-described tool interface shared by the tool adapters and the server.

use async_trait::async_trait;
use serde::Serialize;
use serde_json::{json, Value};
use thiserror::Error;

pub type McpResult<T> = Result<T, McpError>;

/// JSON-RPC codes used across the tool surface.
pub mod codes {
    pub const PARSE_ERROR: i32 = -32700;
    pub const INVALID_REQUEST: i32 = -32600;
    pub const METHOD_NOT_FOUND: i32 = -32601;
    pub const INVALID_PARAMS: i32 = -32602;
    pub const INTERNAL_ERROR: i32 = -32603;
    /// Tool ran but the operation failed
    pub const EXECUTION_FAILED: i32 = -32001;
    /// Mirror state prevents the operation (diverged, locked, missing)
    pub const STATE_CONFLICT: i32 = -32002;
}

#[derive(Debug, Error)]
pub enum McpError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    #[error("tool not found: {0}")]
    ToolNotFound(String),

    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    #[error("internal error: {0}")]
    Internal(String),

    #[error("{message}")]
    Rpc {
        code: i32,
        message: String,
        data: Option<Value>,
    },
}

impl McpError {
    pub fn code(&self) -> i32 {
        match self {
            McpError::InvalidRequest(_) => codes::INVALID_REQUEST,
            McpError::ToolNotFound(_) => codes::METHOD_NOT_FOUND,
            McpError::ExecutionFailed(_) => codes::EXECUTION_FAILED,
            McpError::Internal(_) => codes::INTERNAL_ERROR,
            McpError::Rpc { code, .. } => *code,
        }
    }

    pub fn message(&self) -> String {
        match self {
            McpError::InvalidRequest(msg)
            | McpError::ToolNotFound(msg)
            | McpError::ExecutionFailed(msg)
            | McpError::Internal(msg) => msg.clone(),
            McpError::Rpc { message, .. } => message.clone(),
        }
    }

    pub fn data(&self) -> Option<Value> {
        match self {
            McpError::Rpc { data, .. } => data.clone(),
            _ => None,
        }
    }

    /// Stable error code from the `data` payload (`E_VALIDATION`, ...), if any.
    pub fn error_code(&self) -> Option<&str> {
        match self {
            McpError::Rpc { data: Some(data), .. } => data.get("code").and_then(Value::as_str),
            _ => None,
        }
    }

    pub fn rpc<D: Into<Option<Value>>, M: Into<String>>(code: i32, message: M, data: D) -> Self {
        McpError::Rpc {
            code,
            message: message.into(),
            data: data.into(),
        }
    }
}

/// Behaviour hints surfaced to clients alongside the schema.
#[derive(Debug, Clone, Copy, Default, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolAnnotations {
    pub read_only_hint: bool,
    pub destructive_hint: bool,
    pub open_world_hint: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct ToolDescriptor {
    pub name: String,
    pub description: String,
    #[serde(rename = "inputSchema")]
    pub input_schema: Value,
    pub annotations: ToolAnnotations,
}

#[async_trait]
pub trait McpTool: Send + Sync {
    fn name(&self) -> &str;
    fn description(&self) -> &str;
    async fn execute(&self, params: Value) -> McpResult<Value>;
    fn input_schema(&self) -> Value;

    fn annotations(&self) -> ToolAnnotations {
        ToolAnnotations::default()
    }

    fn descriptor(&self) -> ToolDescriptor {
        ToolDescriptor {
            name: self.name().to_string(),
            description: self.description().to_string(),
            input_schema: self.input_schema(),
            annotations: self.annotations(),
        }
    }
}

/// Standard `tools/call` result: a text summary plus the structured payload.
pub fn tool_result(text: impl Into<String>, structured: Value) -> Value {
    json!({
        "content": [
            {
                "type": "text",
                "text": text.into()
            }
        ],
        "structuredContent": structured
    })
}
