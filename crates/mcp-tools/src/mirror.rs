//! Mirror lifecycle tools.

use std::sync::Arc;

use async_trait::async_trait;
use mcp_core::{tool_result, McpResult, McpTool, ToolAnnotations};
use serde_json::{json, Value};
use tracing::info;

use crate::context::{optional_bool, required_str, target_schema, MirrorContext, Target};
use crate::errors::internal_error;

fn to_value<T: serde::Serialize>(value: &T) -> McpResult<Value> {
    serde_json::to_value(value).map_err(|e| internal_error(e.to_string()))
}

pub struct EnsureWorkspaceTool {
    context: Arc<MirrorContext>,
}

impl EnsureWorkspaceTool {
    pub fn new(context: Arc<MirrorContext>) -> Self {
        Self { context }
    }
}

#[async_trait]
impl McpTool for EnsureWorkspaceTool {
    fn name(&self) -> &str {
        "ensure_workspace"
    }

    fn description(&self) -> &str {
        "Clone or refresh the local mirror for (repo, ref). Without reset the mirror is \
         fast-forwarded only and a diverged mirror is reported; reset=true hard-resets \
         it to the remote ref, discarding local changes."
    }

    async fn execute(&self, params: Value) -> McpResult<Value> {
        let target = Target::from_params(&params)?;
        let reset = optional_bool(&params, "reset", false)?;
        let outcome = self
            .context
            .blocking(move |manager| {
                let key = target.key(manager)?;
                manager.ensure(&key, reset)
            })
            .await?;

        info!(
            target: "mirrorkit_tools",
            key = %outcome.mirror.key,
            created = outcome.created,
            "ensure_workspace"
        );
        let text = format!(
            "{} {} at {} ({:?})",
            if outcome.created { "Cloned" } else { "Refreshed" },
            outcome.mirror.key,
            outcome.mirror.head,
            outcome.action
        );
        Ok(tool_result(text, to_value(&outcome)?))
    }

    fn input_schema(&self) -> Value {
        target_schema(
            json!({
                "reset": {"type": "boolean", "default": false}
            }),
            &[],
        )
    }

    fn annotations(&self) -> ToolAnnotations {
        ToolAnnotations {
            open_world_hint: true,
            ..ToolAnnotations::default()
        }
    }
}

pub struct CheckoutWorkspaceTool {
    context: Arc<MirrorContext>,
}

impl CheckoutWorkspaceTool {
    pub fn new(context: Arc<MirrorContext>) -> Self {
        Self { context }
    }
}

#[async_trait]
impl McpTool for CheckoutWorkspaceTool {
    fn name(&self) -> &str {
        "checkout_workspace"
    }

    fn description(&self) -> &str {
        "Switch an existing mirror to another branch. create=true starts a new branch \
         from the current HEAD; rekey=true (default) makes later calls for the target \
         ref reuse this working tree."
    }

    async fn execute(&self, params: Value) -> McpResult<Value> {
        let target = Target::from_params(&params)?;
        let branch = required_str(&params, "target")?.to_string();
        let create = optional_bool(&params, "create", false)?;
        let rekey = optional_bool(&params, "rekey", true)?;
        let outcome = self
            .context
            .blocking(move |manager| {
                let key = target.key(manager)?;
                manager.checkout(&key, &branch, create, rekey)
            })
            .await?;

        let text = format!(
            "Checked out {} in {}{}",
            outcome.mirror.branch.as_deref().unwrap_or("(detached)"),
            outcome.mirror.path.display(),
            if outcome.rekeyed { " (rekeyed)" } else { "" }
        );
        Ok(tool_result(text, to_value(&outcome)?))
    }

    fn input_schema(&self) -> Value {
        target_schema(
            json!({
                "target": {"type": "string", "description": "Branch to switch to"},
                "create": {"type": "boolean", "default": false},
                "rekey": {"type": "boolean", "default": true}
            }),
            &["target"],
        )
    }
}

pub struct WorkspaceStatusTool {
    context: Arc<MirrorContext>,
}

impl WorkspaceStatusTool {
    pub fn new(context: Arc<MirrorContext>) -> Self {
        Self { context }
    }
}

#[async_trait]
impl McpTool for WorkspaceStatusTool {
    fn name(&self) -> &str {
        "workspace_status"
    }

    fn description(&self) -> &str {
        "Report a mirror's HEAD, branch, dirty flag, lock state and any merge or rebase in progress"
    }

    async fn execute(&self, params: Value) -> McpResult<Value> {
        let target = Target::from_params(&params)?;
        let status = self
            .context
            .blocking(move |manager| {
                let key = target.key(manager)?;
                manager.status(&key)
            })
            .await?;

        let text = format!(
            "{} on {} at {}{}{}",
            status.key,
            status.branch.as_deref().unwrap_or("(detached)"),
            status.head,
            if status.dirty { ", dirty" } else { "" },
            if status.consistent { "" } else { ", inconsistent" }
        );
        Ok(tool_result(text, to_value(&status)?))
    }

    fn input_schema(&self) -> Value {
        target_schema(json!({}), &[])
    }

    fn annotations(&self) -> ToolAnnotations {
        ToolAnnotations {
            read_only_hint: true,
            ..ToolAnnotations::default()
        }
    }
}

pub struct ListWorkspacesTool {
    context: Arc<MirrorContext>,
}

impl ListWorkspacesTool {
    pub fn new(context: Arc<MirrorContext>) -> Self {
        Self { context }
    }
}

#[async_trait]
impl McpTool for ListWorkspacesTool {
    fn name(&self) -> &str {
        "list_workspaces"
    }

    fn description(&self) -> &str {
        "List every registered mirror"
    }

    async fn execute(&self, _params: Value) -> McpResult<Value> {
        let records = self.context.blocking(|manager| manager.list()).await?;
        let lines: Vec<String> = records
            .iter()
            .map(|r| format!("- {} -> {}", r.key, r.path.display()))
            .collect();
        let text = if lines.is_empty() {
            "No mirrors".to_string()
        } else {
            lines.join("\n")
        };
        Ok(tool_result(text, json!({ "mirrors": to_value(&records)? })))
    }

    fn input_schema(&self) -> Value {
        json!({"type": "object", "properties": {}})
    }

    fn annotations(&self) -> ToolAnnotations {
        ToolAnnotations {
            read_only_hint: true,
            ..ToolAnnotations::default()
        }
    }
}

pub struct DeleteWorkspaceTool {
    context: Arc<MirrorContext>,
}

impl DeleteWorkspaceTool {
    pub fn new(context: Arc<MirrorContext>) -> Self {
        Self { context }
    }
}

#[async_trait]
impl McpTool for DeleteWorkspaceTool {
    fn name(&self) -> &str {
        "delete_workspace"
    }

    fn description(&self) -> &str {
        "Delete a mirror and its working tree. Unpushed work is lost."
    }

    async fn execute(&self, params: Value) -> McpResult<Value> {
        let target = Target::from_params(&params)?;
        let (key, deleted) = self
            .context
            .blocking(move |manager| {
                let key = target.key(manager)?;
                let deleted = manager.delete(&key)?;
                Ok((key, deleted))
            })
            .await?;

        let text = if deleted {
            format!("Deleted mirror {}", key)
        } else {
            format!("No mirror registered for {}", key)
        };
        Ok(tool_result(
            text,
            json!({ "key": to_value(&key)?, "deleted": deleted }),
        ))
    }

    fn input_schema(&self) -> Value {
        target_schema(json!({}), &[])
    }

    fn annotations(&self) -> ToolAnnotations {
        ToolAnnotations {
            destructive_hint: true,
            ..ToolAnnotations::default()
        }
    }
}
