// # -----------------------------
// # crates/mcp-server/src/lib.rs
// # -----------------------------
//! Line-delimited JSON-RPC 2.0 server exposing the mirror tools over stdio.

use std::collections::HashMap;
use std::sync::Arc;

use anyhow::Result;
use mcp_core::{codes, McpError, McpTool, ToolDescriptor};
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::io::{self, AsyncBufRead, AsyncBufReadExt, AsyncWrite, AsyncWriteExt, BufReader};
use tracing::{debug, info, warn};

pub const PROTOCOL_VERSION: &str = "2025-06-18";

#[derive(Clone)]
pub struct ToolRegistry {
    tools: HashMap<String, Arc<dyn McpTool>>,
    order: Vec<String>,
}

impl ToolRegistry {
    pub fn new(tools: Vec<Arc<dyn McpTool>>) -> Self {
        let mut map = HashMap::new();
        let mut order = Vec::new();

        for tool in tools {
            let name = tool.name().to_string();
            if map.insert(name.clone(), tool).is_none() {
                order.push(name);
            } else {
                warn!(tool = %name, "duplicate tool name; keeping the last registration");
            }
        }

        Self { tools: map, order }
    }

    pub fn get(&self, name: &str) -> Option<Arc<dyn McpTool>> {
        self.tools.get(name).cloned()
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn descriptors(&self) -> Vec<ToolDescriptor> {
        self.order
            .iter()
            .filter_map(|name| self.tools.get(name))
            .map(|tool| tool.descriptor())
            .collect()
    }
}

pub struct McpServer {
    registry: ToolRegistry,
}

impl McpServer {
    pub fn new(registry: ToolRegistry) -> Self {
        Self { registry }
    }

    pub async fn serve_stdio(&self) -> Result<()> {
        info!(tools = self.registry.len(), "serving MCP on stdin/stdout");
        self.serve(BufReader::new(io::stdin()), io::stdout()).await
    }

    /// One request per line in, one response per line out, until EOF.
    pub async fn serve<R, W>(&self, mut reader: R, mut writer: W) -> Result<()>
    where
        R: AsyncBufRead + Unpin,
        W: AsyncWrite + Unpin,
    {
        let mut line = String::new();
        loop {
            line.clear();
            if reader.read_line(&mut line).await? == 0 {
                debug!("client disconnected (EOF)");
                break;
            }
            let trimmed = line.trim();
            if trimmed.is_empty() {
                continue;
            }

            let response = match serde_json::from_str::<Value>(trimmed) {
                Ok(request) => self.handle_jsonrpc(request).await,
                Err(err) => {
                    warn!(error = %err, "unparseable request line");
                    Some(error_value(
                        Value::Null,
                        codes::PARSE_ERROR,
                        format!("Parse error: {}", err),
                    ))
                }
            };

            if let Some(response) = response {
                let mut out = serde_json::to_string(&response)?;
                out.push('\n');
                writer.write_all(out.as_bytes()).await?;
                writer.flush().await?;
            }
        }
        Ok(())
    }

    /// `None` for notifications, which get no reply.
    pub async fn handle_jsonrpc(&self, request: Value) -> Option<Value> {
        let method = request.get("method").and_then(Value::as_str).unwrap_or("");
        if method.starts_with("notifications/") {
            debug!(method, "notification");
            return None;
        }

        let request: JsonRpcRequest = match serde_json::from_value(request.clone()) {
            Ok(request) => request,
            Err(err) => {
                let id = request.get("id").cloned().unwrap_or(Value::Null);
                return Some(error_value(
                    id,
                    codes::INVALID_REQUEST,
                    format!("Invalid request: {}", err),
                ));
            }
        };
        debug!(method = %request.method, id = ?request.id, "request");
        let response = handle_request(request, &self.registry).await;
        match serde_json::to_value(&response) {
            Ok(value) => Some(value),
            Err(err) => Some(error_value(
                Value::Null,
                codes::INTERNAL_ERROR,
                format!("Unserializable response: {}", err),
            )),
        }
    }
}

#[derive(Debug, Deserialize)]
struct JsonRpcRequest {
    jsonrpc: String,
    #[serde(default)]
    id: Option<Value>,
    method: String,
    #[serde(default)]
    params: Option<Value>,
}

#[derive(Debug, Serialize)]
struct JsonRpcResponse {
    jsonrpc: &'static str,
    id: Value,
    #[serde(skip_serializing_if = "Option::is_none")]
    result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    error: Option<JsonRpcError>,
}

#[derive(Debug, Serialize)]
struct JsonRpcError {
    code: i32,
    message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    data: Option<Value>,
}

fn error_value(id: Value, code: i32, message: String) -> Value {
    json!({
        "jsonrpc": "2.0",
        "id": id,
        "error": {"code": code, "message": message}
    })
}

fn ok_response(id: Option<Value>, result: Value) -> JsonRpcResponse {
    JsonRpcResponse {
        jsonrpc: "2.0",
        id: id.unwrap_or(Value::Null),
        result: Some(result),
        error: None,
    }
}

async fn handle_request(request: JsonRpcRequest, registry: &ToolRegistry) -> JsonRpcResponse {
    let JsonRpcRequest {
        jsonrpc,
        id,
        method,
        params,
    } = request;

    if jsonrpc != "2.0" {
        return rpc_error_response(
            id.unwrap_or(Value::Null),
            McpError::InvalidRequest(format!("Unsupported JSON-RPC version: {jsonrpc}")),
        );
    }

    match method.as_str() {
        "initialize" => ok_response(id, initialize_result()),
        "ping" => ok_response(id, json!({})),
        "tools/list" => ok_response(id, json!({ "tools": registry.descriptors() })),
        "tools/call" => handle_tools_call(id, params, registry).await,
        "resources/list" => ok_response(id, json!({ "resources": [] })),
        "prompts/list" => ok_response(id, json!({ "prompts": [] })),
        _ => rpc_error_response(
            id.unwrap_or(Value::Null),
            McpError::rpc(
                codes::METHOD_NOT_FOUND,
                format!("Unknown method: {method}"),
                None::<Value>,
            ),
        ),
    }
}

fn initialize_result() -> Value {
    json!({
        "protocolVersion": PROTOCOL_VERSION,
        "capabilities": {
            "tools": { "listChanged": false },
            "prompts": { "listChanged": false },
            "resources": { "listChanged": false, "subscribe": false }
        },
        "serverInfo": {
            "name": "mirrorkit-mcp-server",
            "version": env!("CARGO_PKG_VERSION"),
        }
    })
}

async fn handle_tools_call(
    id: Option<Value>,
    params: Option<Value>,
    registry: &ToolRegistry,
) -> JsonRpcResponse {
    let id = id.unwrap_or(Value::Null);

    let params = match params {
        Some(Value::Object(map)) => map,
        _ => {
            return rpc_error_response(
                id,
                McpError::rpc(
                    codes::INVALID_PARAMS,
                    "Missing params object for tools/call",
                    None::<Value>,
                ),
            );
        }
    };

    let name = match params.get("name").and_then(Value::as_str) {
        Some(name) => name,
        None => {
            return rpc_error_response(
                id,
                McpError::rpc(
                    codes::INVALID_PARAMS,
                    "Missing 'name' in params",
                    None::<Value>,
                ),
            );
        }
    };

    let arguments = match params.get("arguments") {
        None | Some(Value::Null) => json!({}),
        Some(value) => value.clone(),
    };

    let tool = match registry.get(name) {
        Some(tool) => tool,
        None => {
            return rpc_error_response(id, McpError::ToolNotFound(name.to_string()));
        }
    };

    match tool.execute(arguments).await {
        Ok(result) => {
            info!(tool = name, "tool call completed");
            ok_response(Some(id), result)
        }
        Err(err) => {
            warn!(
                tool = name,
                code = err.code(),
                error_code = err.error_code().unwrap_or(""),
                "tool call failed: {}",
                err.message()
            );
            rpc_error_response(id, err)
        }
    }
}

fn rpc_error_response(id: Value, error: McpError) -> JsonRpcResponse {
    JsonRpcResponse {
        jsonrpc: "2.0",
        id,
        result: None,
        error: Some(JsonRpcError {
            code: error.code(),
            message: error.message(),
            data: error.data(),
        }),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use async_trait::async_trait;
    use mcp_core::{tool_result, McpResult};

    struct Upper;

    #[async_trait]
    impl McpTool for Upper {
        fn name(&self) -> &str {
            "upper"
        }

        fn description(&self) -> &str {
            "Uppercase `text`"
        }

        async fn execute(&self, params: Value) -> McpResult<Value> {
            match params.get("text").and_then(Value::as_str) {
                Some(text) => Ok(tool_result(text.to_uppercase(), json!({}))),
                None => Err(McpError::rpc(
                    codes::INVALID_PARAMS,
                    "text is required",
                    json!({"code": "E_VALIDATION"}),
                )),
            }
        }

        fn input_schema(&self) -> Value {
            json!({"type": "object", "properties": {"text": {"type": "string"}}})
        }
    }

    fn server() -> McpServer {
        McpServer::new(ToolRegistry::new(vec![Arc::new(Upper)]))
    }

    #[tokio::test]
    async fn initialize_reports_protocol_and_tools_capability() {
        let response = server()
            .handle_jsonrpc(json!({"jsonrpc": "2.0", "id": 1, "method": "initialize"}))
            .await
            .unwrap();
        assert_eq!(response["id"], 1);
        assert_eq!(response["result"]["protocolVersion"], PROTOCOL_VERSION);
        assert_eq!(response["result"]["serverInfo"]["name"], "mirrorkit-mcp-server");
    }

    #[tokio::test]
    async fn tools_call_round_trip_and_errors() {
        let s = server();
        let ok = s
            .handle_jsonrpc(json!({
                "jsonrpc": "2.0", "id": 2, "method": "tools/call",
                "params": {"name": "upper", "arguments": {"text": "abc"}}
            }))
            .await
            .unwrap();
        assert_eq!(ok["result"]["content"][0]["text"], "ABC");

        let bad = s
            .handle_jsonrpc(json!({
                "jsonrpc": "2.0", "id": 3, "method": "tools/call",
                "params": {"name": "upper", "arguments": {}}
            }))
            .await
            .unwrap();
        assert_eq!(bad["error"]["code"], codes::INVALID_PARAMS);
        assert_eq!(bad["error"]["data"]["code"], "E_VALIDATION");

        let missing = s
            .handle_jsonrpc(json!({
                "jsonrpc": "2.0", "id": 4, "method": "tools/call",
                "params": {"name": "nope"}
            }))
            .await
            .unwrap();
        assert_eq!(missing["error"]["code"], codes::METHOD_NOT_FOUND);
    }

    #[tokio::test]
    async fn notifications_get_no_reply() {
        let reply = server()
            .handle_jsonrpc(json!({"jsonrpc": "2.0", "method": "notifications/initialized"}))
            .await;
        assert!(reply.is_none());
    }

    #[tokio::test]
    async fn serve_answers_each_line_and_reports_parse_errors() {
        let input = concat!(
            "{\"jsonrpc\":\"2.0\",\"id\":1,\"method\":\"tools/list\"}\n",
            "\n",
            "not json\n",
            "{\"jsonrpc\":\"2.0\",\"method\":\"notifications/initialized\"}\n",
            "{\"jsonrpc\":\"2.0\",\"id\":2,\"method\":\"bogus\"}\n",
        );
        let mut output = Vec::new();
        server()
            .serve(BufReader::new(input.as_bytes()), &mut output)
            .await
            .unwrap();

        let lines: Vec<Value> = String::from_utf8(output)
            .unwrap()
            .lines()
            .map(|l| serde_json::from_str(l).unwrap())
            .collect();
        assert_eq!(lines.len(), 3);
        assert_eq!(lines[0]["result"]["tools"][0]["name"], "upper");
        assert_eq!(lines[1]["error"]["code"], codes::PARSE_ERROR);
        assert_eq!(lines[2]["error"]["code"], codes::METHOD_NOT_FOUND);
        assert_eq!(lines[2]["id"], 2);
    }
}
