//! End-to-end edit, gate, commit, push and pull-request pipeline.

use std::sync::Arc;

use async_trait::async_trait;
use mcp_core::{tool_result, McpResult, McpTool, ToolAnnotations};
use mirrorkit_engine::{
    batch::OPERATION_KINDS, parse_operations, Orchestrator, PullRequestGateway, StepStatus,
    WorkflowOutcome, WorkflowRequest,
};
use serde_json::{json, Value};
use tracing::info;

use crate::context::MirrorContext;
use crate::errors::{internal_error, mirror_error, validation_error};

pub struct RunWorkflowTool {
    context: Arc<MirrorContext>,
    gateway: Arc<dyn PullRequestGateway>,
}

impl RunWorkflowTool {
    pub fn new(context: Arc<MirrorContext>, gateway: Arc<dyn PullRequestGateway>) -> Self {
        Self { context, gateway }
    }
}

fn request_from_params(params: Value) -> McpResult<WorkflowRequest> {
    let mut object = match params {
        Value::Object(map) => map,
        _ => return Err(validation_error("Parameters must be an object")),
    };
    let operations = match object.remove("operations") {
        None | Some(Value::Null) => Vec::new(),
        Some(Value::Array(values)) => parse_operations(&values).map_err(mirror_error)?,
        Some(_) => return Err(validation_error("Parameter 'operations' must be an array")),
    };
    let mut request: WorkflowRequest = serde_json::from_value(Value::Object(object))
        .map_err(|e| validation_error(&format!("Invalid workflow request: {}", e)))?;
    request.operations = operations;
    Ok(request)
}

fn summarize(outcome: &WorkflowOutcome) -> String {
    let mut lines = vec![if outcome.success {
        format!("Workflow succeeded: {} -> {}", outcome.branch, outcome.base)
    } else {
        format!(
            "Workflow stopped at {}",
            outcome.stopped_at.unwrap_or("unknown step")
        )
    }];
    for step in &outcome.steps {
        let mark = match step.status {
            StepStatus::Succeeded => "ok",
            StepStatus::Failed => "FAILED",
            StepStatus::Skipped => "skipped",
        };
        lines.push(format!("  [{}] {}: {}", mark, step.name, step.detail));
    }
    if let Some(pr) = &outcome.pull_request {
        lines.push(format!("Pull request #{}: {}", pr.number, pr.url));
    }
    lines.join("\n")
}

#[async_trait]
impl McpTool for RunWorkflowTool {
    fn name(&self) -> &str {
        "run_pr_workflow"
    }

    fn description(&self) -> &str {
        "Sync the base mirror, check out the feature branch, apply the edit batch, run the \
         quality gate, commit, push and open (or reuse) a pull request. Stops at the first \
         failing step and reports every step."
    }

    async fn execute(&self, params: Value) -> McpResult<Value> {
        let request = request_from_params(params)?;
        let gateway = Arc::clone(&self.gateway);

        let outcome = self
            .context
            .blocking(move |manager| Orchestrator::new(manager, gateway.as_ref()).run(&request))
            .await?;

        info!(
            target: "mirrorkit_tools",
            branch = %outcome.branch,
            success = outcome.success,
            stopped_at = outcome.stopped_at.unwrap_or(""),
            "workflow finished"
        );
        let structured =
            serde_json::to_value(&outcome).map_err(|e| internal_error(e.to_string()))?;
        Ok(tool_result(summarize(&outcome), structured))
    }

    fn input_schema(&self) -> Value {
        json!({
            "type": "object",
            "properties": {
                "repo": {"type": "string", "description": "owner/name"},
                "base": {"type": "string", "description": "Base branch; configured default when omitted"},
                "branch": {"type": "string", "description": "Feature branch to create or reuse"},
                "operations": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {"op": {"type": "string", "enum": OPERATION_KINDS}},
                        "required": ["op"]
                    }
                },
                "commit_message": {"type": "string"},
                "pr_title": {"type": "string"},
                "pr_body": {"type": "string"},
                "quality_gate": {"type": "array", "items": {"type": "string"}},
                "run_quality_gate": {"type": "boolean", "default": true},
                "push": {"type": "boolean", "default": true},
                "open_pr": {"type": "boolean", "default": true},
                "reset_base": {"type": "boolean", "default": false},
                "include_outputs": {"type": "boolean", "default": false}
            },
            "required": ["repo", "branch", "commit_message"]
        })
    }

    fn annotations(&self) -> ToolAnnotations {
        ToolAnnotations {
            destructive_hint: true,
            open_world_hint: true,
            ..ToolAnnotations::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn request_defaults_follow_pipeline() {
        let request = request_from_params(json!({
            "repo": "acme/widgets",
            "branch": "feat/x",
            "commit_message": "Edit",
            "operations": [{"op": "write_file", "path": "a.txt", "content": "x"}]
        }))
        .unwrap();
        assert_eq!(request.operations.len(), 1);
        assert!(request.push && request.open_pr && request.run_quality_gate);
        assert!(request.base.is_none());
    }

    #[test]
    fn bad_operation_reports_its_index() {
        let err = request_from_params(json!({
            "repo": "acme/widgets",
            "branch": "feat/x",
            "commit_message": "Edit",
            "operations": [
                {"op": "write_file", "path": "a.txt", "content": "x"},
                {"op": "teleport"}
            ]
        }))
        .unwrap_err();
        assert_eq!(err.error_code(), Some("E_VALIDATION"));
        assert_eq!(err.data().unwrap()["details"]["operation_index"], 1);
    }

    #[test]
    fn missing_commit_message_is_invalid() {
        let err = request_from_params(json!({"repo": "acme/widgets", "branch": "b"})).unwrap_err();
        assert_eq!(err.error_code(), Some("E_VALIDATION"));
    }
}
