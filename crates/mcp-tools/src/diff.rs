//! Diff generation and patch application tools.

use std::sync::Arc;

use async_trait::async_trait;
use mcp_core::{tool_result, McpResult, McpTool, ToolAnnotations};
use mirrorkit_engine::{apply_patch, compare, ApplyOptions, DiffLimits, DiffSource, PatchInput};
use serde_json::{json, Value};
use tracing::info;

use crate::context::{
    acquire, open, optional_bool, optional_str, optional_u64, target_schema, MirrorContext,
    Target,
};
use crate::errors::{internal_error, validation_error};

/// A bare string is literal text; objects use the tagged source form.
fn parse_source(params: &Value, field: &str) -> McpResult<DiffSource> {
    match params.get(field) {
        Some(Value::String(text)) => Ok(DiffSource::Text { text: text.clone() }),
        Some(value @ Value::Object(_)) => serde_json::from_value(value.clone()).map_err(|e| {
            validation_error(&format!("Parameter '{}' is not a valid source: {}", field, e))
        }),
        Some(_) => Err(validation_error(&format!(
            "Parameter '{}' must be text or a source object",
            field
        ))),
        None => Err(validation_error(&format!(
            "Parameter '{}' is required",
            field
        ))),
    }
}

fn source_schema() -> Value {
    json!({
        "oneOf": [
            {"type": "string", "description": "Literal text"},
            {
                "type": "object",
                "properties": {
                    "kind": {"type": "string", "enum": ["text", "path", "path_at_rev"]},
                    "text": {"type": "string"},
                    "path": {"type": "string"},
                    "rev": {"type": "string"}
                },
                "required": ["kind"]
            }
        ]
    })
}

/// Shared body of the two diff tools.
async fn run_diff(
    context: &MirrorContext,
    params: &Value,
    left_field: &str,
    right_field: &str,
) -> McpResult<Value> {
    let left = parse_source(params, left_field)?;
    let right = parse_source(params, right_field)?;
    let label = optional_str(params, "label")?.map(str::to_string);
    let mut limits = DiffLimits::from(&context.manager().config().diff);
    if let Some(lines) = optional_u64(params, "context_lines")? {
        limits.context_lines = lines as usize;
    }
    let target = match optional_str(params, "repo")? {
        Some(_) => Some(Target::from_params(params)?),
        None => None,
    };

    let result = context
        .blocking(move |manager| {
            let handle = target.as_ref().map(|t| open(manager, t)).transpose()?;
            compare(handle.as_ref(), &left, &right, label.as_deref(), limits)
        })
        .await?;

    let text = if result.identical {
        "No differences".to_string()
    } else {
        format!(
            "+{} / -{} line(s){}\n\n{}",
            result.added,
            result.removed,
            if result.truncated { " (truncated)" } else { "" },
            result.diff
        )
    };
    let structured = serde_json::to_value(&result).map_err(|e| internal_error(e.to_string()))?;
    Ok(tool_result(text, structured))
}

pub struct MakeDiffTool {
    context: Arc<MirrorContext>,
}

impl MakeDiffTool {
    pub fn new(context: Arc<MirrorContext>) -> Self {
        Self { context }
    }
}

#[async_trait]
impl McpTool for MakeDiffTool {
    fn name(&self) -> &str {
        "make_diff"
    }

    fn description(&self) -> &str {
        "Unified diff from `before` to `after`. Each side is literal text, or with `repo` \
         set, a mirror path at the checkout or at any git revision."
    }

    async fn execute(&self, params: Value) -> McpResult<Value> {
        run_diff(&self.context, &params, "before", "after").await
    }

    fn input_schema(&self) -> Value {
        let mut schema = target_schema(
            json!({
                "before": source_schema(),
                "after": source_schema(),
                "label": {"type": "string", "description": "File name used in headers for text sides"},
                "context_lines": {"type": "integer", "minimum": 0}
            }),
            &["before", "after"],
        );
        // Literal-text diffs need no mirror.
        schema["required"] = json!(["before", "after"]);
        schema
    }

    fn annotations(&self) -> ToolAnnotations {
        ToolAnnotations {
            read_only_hint: true,
            ..ToolAnnotations::default()
        }
    }
}

pub struct CompareTool {
    context: Arc<MirrorContext>,
}

impl CompareTool {
    pub fn new(context: Arc<MirrorContext>) -> Self {
        Self { context }
    }
}

#[async_trait]
impl McpTool for CompareTool {
    fn name(&self) -> &str {
        "compare_workspace_files"
    }

    fn description(&self) -> &str {
        "Compare any two of {text, path, path@rev} inside a mirror; returns the diff and \
         added/removed line counts."
    }

    async fn execute(&self, params: Value) -> McpResult<Value> {
        run_diff(&self.context, &params, "left", "right").await
    }

    fn input_schema(&self) -> Value {
        target_schema(
            json!({
                "left": source_schema(),
                "right": source_schema(),
                "label": {"type": "string"},
                "context_lines": {"type": "integer", "minimum": 0}
            }),
            &["left", "right"],
        )
    }

    fn annotations(&self) -> ToolAnnotations {
        ToolAnnotations {
            read_only_hint: true,
            ..ToolAnnotations::default()
        }
    }
}

pub struct ApplyPatchTool {
    context: Arc<MirrorContext>,
}

impl ApplyPatchTool {
    pub fn new(context: Arc<MirrorContext>) -> Self {
        Self { context }
    }
}

#[async_trait]
impl McpTool for ApplyPatchTool {
    fn name(&self) -> &str {
        "apply_workspace_patch"
    }

    fn description(&self) -> &str {
        "Apply one or more unified diffs to a mirror. All-or-nothing: if any hunk fails, \
         nothing is written. Optionally git add, commit and push afterwards."
    }

    async fn execute(&self, params: Value) -> McpResult<Value> {
        let target = Target::from_params(&params)?;
        let patch: PatchInput = params
            .get("patch")
            .cloned()
            .ok_or_else(|| validation_error("Parameter 'patch' is required"))
            .and_then(|v| {
                serde_json::from_value(v).map_err(|_| {
                    validation_error("Parameter 'patch' must be a string or an array of strings")
                })
            })?;
        let options = ApplyOptions {
            add: optional_bool(&params, "add", false)?,
            commit: optional_bool(&params, "commit", false)?,
            push: optional_bool(&params, "push", false)?,
            commit_message: optional_str(&params, "commit_message")?.map(str::to_string),
        };

        let outcome = self
            .context
            .blocking(move |manager| {
                let handle = acquire(manager, &target)?;
                apply_patch(
                    &handle,
                    &patch.texts(),
                    &options,
                    &manager.config().git.remote_name,
                )
            })
            .await?;

        info!(
            target: "mirrorkit_tools",
            files = outcome.files.len(),
            commit = outcome.commit.as_deref().unwrap_or(""),
            pushed = outcome.pushed,
            "patch applied"
        );
        let mut lines = vec![format!(
            "Patch applied: {} file(s), {} hunk(s), +{} / -{}",
            outcome.files.len(),
            outcome.stats.hunks_applied,
            outcome.stats.lines_added,
            outcome.stats.lines_removed
        )];
        if let Some(commit) = &outcome.commit {
            lines.push(format!("Committed {}", commit));
        }
        if outcome.pushed {
            lines.push("Pushed".to_string());
        }
        let structured =
            serde_json::to_value(&outcome).map_err(|e| internal_error(e.to_string()))?;
        Ok(tool_result(lines.join("\n"), structured))
    }

    fn input_schema(&self) -> Value {
        target_schema(
            json!({
                "patch": {
                    "oneOf": [
                        {"type": "string"},
                        {"type": "array", "items": {"type": "string"}}
                    ]
                },
                "add": {"type": "boolean", "default": false},
                "commit": {"type": "boolean", "default": false},
                "push": {"type": "boolean", "default": false},
                "commit_message": {"type": "string"}
            }),
            &["patch"],
        )
    }

    fn annotations(&self) -> ToolAnnotations {
        ToolAnnotations {
            open_world_hint: true,
            ..ToolAnnotations::default()
        }
    }
}
