//! Text-editing and batch tools over a mirror.

use std::sync::Arc;

use async_trait::async_trait;
use mcp_core::{tool_result, McpResult, McpTool, ToolAnnotations};
use mirrorkit_engine::{
    parse_operations, run_batch, BatchExecutor, BatchPlan, BatchStatus, EditOperation,
    OperationOutcome,
};
use serde_json::{json, Map, Value};
use tracing::info;

use crate::context::{acquire, open, optional_bool, target_schema, MirrorContext, Target};
use crate::errors::{internal_error, mirror_error, validation_error};

/// Parameters every single-operation tool accepts besides its own fields.
const SHARED_PARAMS: &[&str] = &["repo", "ref", "create_parents", "preview"];

struct EditToolSpec {
    name: &'static str,
    op: &'static str,
    description: &'static str,
    properties: fn() -> Value,
    required: &'static [&'static str],
}

fn position_schema() -> Value {
    json!({
        "type": "object",
        "properties": {
            "line": {"type": "integer", "minimum": 1},
            "col": {"type": "integer", "minimum": 1}
        },
        "required": ["line", "col"]
    })
}

fn match_properties(needle: &str) -> Value {
    json!({
        "path": {"type": "string"},
        needle: {"type": "string"},
        "occurrence": {"type": "integer", "minimum": 1, "description": "1-indexed match to edit; default 1"},
        "replace_all": {"type": "boolean", "default": false, "description": "Edit every match; occurrence is ignored"},
        "case_sensitive": {"type": "boolean", "default": true},
        "whole_word": {"type": "boolean", "default": false}
    })
}

const EDIT_TOOLS: &[EditToolSpec] = &[
    EditToolSpec {
        name: "read_workspace_file",
        op: "read_sections",
        description: "Read a page of numbered lines from a mirror file. Returns total_lines and \
                      next_start_line for pagination.",
        properties: || {
            json!({
                "path": {"type": "string"},
                "start_line": {"type": "integer", "minimum": 1, "default": 1},
                "max_lines": {"type": "integer", "minimum": 1, "default": 200}
            })
        },
        required: &["path"],
    },
    EditToolSpec {
        name: "write_workspace_file",
        op: "write_file",
        description: "Write a whole file atomically. mode=create_new fails if the file exists.",
        properties: || {
            json!({
                "path": {"type": "string"},
                "content": {"type": "string"},
                "mode": {"type": "string", "enum": ["overwrite", "create_new"], "default": "overwrite"}
            })
        },
        required: &["path", "content"],
    },
    EditToolSpec {
        name: "replace_workspace_text",
        op: "replace_text",
        description: "Replace the Nth literal match of `old` (or every match with replace_all). \
                      Case folding is applied before the whole-word filter.",
        properties: || {
            let mut props = match_properties("old");
            props["new"] = json!({"type": "string"});
            props
        },
        required: &["path", "old", "new"],
    },
    EditToolSpec {
        name: "edit_workspace_range",
        op: "edit_range",
        description: "Replace the half-open range start..end (1-indexed line/col, end excluded). \
                      (L,1)..(L+1,1) covers line L with its newline.",
        properties: || {
            json!({
                "path": {"type": "string"},
                "start": position_schema(),
                "end": position_schema(),
                "text": {"type": "string", "default": ""}
            })
        },
        required: &["path", "start", "end"],
    },
    EditToolSpec {
        name: "edit_workspace_line",
        op: "edit_line",
        description: "Replace, insert before, insert after or delete one line. Replace keeps the \
                      line's existing line ending.",
        properties: || {
            json!({
                "path": {"type": "string"},
                "line": {"type": "integer", "minimum": 1},
                "operation": {"type": "string", "enum": ["replace", "insert_before", "insert_after", "delete"]},
                "text": {"type": "string", "default": ""}
            })
        },
        required: &["path", "line", "operation"],
    },
    EditToolSpec {
        name: "delete_workspace_lines",
        op: "delete_lines",
        description: "Delete an inclusive span of lines; end_line defaults to start_line.",
        properties: || {
            json!({
                "path": {"type": "string"},
                "start_line": {"type": "integer", "minimum": 1},
                "end_line": {"type": "integer", "minimum": 1}
            })
        },
        required: &["path", "start_line"],
    },
    EditToolSpec {
        name: "delete_workspace_word",
        op: "delete_word",
        description: "Delete the Nth match of a word or substring, with the same matching rules \
                      as replace_workspace_text.",
        properties: || match_properties("word"),
        required: &["path", "word"],
    },
    EditToolSpec {
        name: "delete_workspace_chars",
        op: "delete_chars",
        description: "Delete `count` characters (Unicode scalar values) starting at (line, col).",
        properties: || {
            json!({
                "path": {"type": "string"},
                "line": {"type": "integer", "minimum": 1},
                "col": {"type": "integer", "minimum": 1},
                "count": {"type": "integer", "minimum": 1}
            })
        },
        required: &["path", "line", "col", "count"],
    },
    EditToolSpec {
        name: "delete_workspace_path",
        op: "delete_path",
        description: "Delete a file, or a directory with everything under it.",
        properties: || json!({"path": {"type": "string"}}),
        required: &["path"],
    },
    EditToolSpec {
        name: "make_workspace_directory",
        op: "make_directory",
        description: "Create a directory.",
        properties: || json!({"path": {"type": "string"}}),
        required: &["path"],
    },
    EditToolSpec {
        name: "remove_workspace_directory",
        op: "remove_directory",
        description: "Remove a directory; non-empty directories need recursive=true.",
        properties: || {
            json!({
                "path": {"type": "string"},
                "recursive": {"type": "boolean", "default": false}
            })
        },
        required: &["path"],
    },
    EditToolSpec {
        name: "move_workspace_path",
        op: "move",
        description: "Move or rename a file or directory.",
        properties: || {
            json!({
                "from": {"type": "string"},
                "to": {"type": "string"},
                "overwrite": {"type": "boolean", "default": false}
            })
        },
        required: &["from", "to"],
    },
];

/// Build the engine operation from a tool call's own fields.
fn operation_from_params(op: &str, params: &Value) -> McpResult<EditOperation> {
    let mut fields: Map<String, Value> = params
        .as_object()
        .cloned()
        .ok_or_else(|| validation_error("Parameters must be an object"))?;
    for shared in SHARED_PARAMS {
        fields.remove(*shared);
    }
    fields.insert("op".to_string(), Value::String(op.to_string()));
    parse_operations(&[Value::Object(fields)])
        .map_err(mirror_error)?
        .into_iter()
        .next()
        .ok_or_else(|| internal_error("operation parsing produced nothing"))
}

fn outcome_text(outcome: &OperationOutcome, preview: bool) -> String {
    let subject = outcome.path.as_deref().unwrap_or("");
    let mut text = match &outcome.description {
        Some(description) => description.clone(),
        None => format!("{} {}", outcome.op, subject),
    };
    if preview {
        text = format!("[preview] {}", text);
    }
    if let Some(diff) = &outcome.diff {
        text.push_str("\n\n");
        text.push_str(diff);
    }
    text
}

/// One engine edit operation exposed as its own tool.
pub struct WorkspaceEditTool {
    context: Arc<MirrorContext>,
    spec: &'static EditToolSpec,
}

impl WorkspaceEditTool {
    pub fn all(context: &Arc<MirrorContext>) -> Vec<Self> {
        EDIT_TOOLS
            .iter()
            .map(|spec| Self {
                context: Arc::clone(context),
                spec,
            })
            .collect()
    }

    fn read_only(&self) -> bool {
        self.spec.op == "read_sections"
    }
}

#[async_trait]
impl McpTool for WorkspaceEditTool {
    fn name(&self) -> &str {
        self.spec.name
    }

    fn description(&self) -> &str {
        self.spec.description
    }

    async fn execute(&self, params: Value) -> McpResult<Value> {
        let target = Target::from_params(&params)?;
        let create_parents = optional_bool(&params, "create_parents", true)?;
        let preview = optional_bool(&params, "preview", false)?;
        let op = operation_from_params(self.spec.op, &params)?;
        let locked = op.is_mutating() && !preview;

        let outcome = self
            .context
            .blocking(move |manager| {
                let handle = if locked {
                    acquire(manager, &target)?
                } else {
                    open(manager, &target)?
                };
                BatchExecutor::from_config(&handle.paths, manager.config())
                    .apply_single(op, create_parents, preview)
            })
            .await?;

        info!(
            target: "mirrorkit_tools",
            tool = self.spec.name,
            path = outcome.path.as_deref().unwrap_or(""),
            preview,
            "edit applied"
        );
        let structured =
            serde_json::to_value(&outcome).map_err(|e| internal_error(e.to_string()))?;
        Ok(tool_result(outcome_text(&outcome, preview), structured))
    }

    fn input_schema(&self) -> Value {
        let mut properties = (self.spec.properties)();
        if !self.read_only() {
            properties["create_parents"] = json!({"type": "boolean", "default": true});
            properties["preview"] = json!({
                "type": "boolean",
                "default": false,
                "description": "Describe the would-be effect as a diff without writing"
            });
        }
        target_schema(properties, self.spec.required)
    }

    fn annotations(&self) -> ToolAnnotations {
        ToolAnnotations {
            read_only_hint: self.read_only(),
            destructive_hint: matches!(
                self.spec.op,
                "delete_path" | "remove_directory" | "write_file" | "move"
            ),
            ..ToolAnnotations::default()
        }
    }
}

pub struct ApplyBatchTool {
    context: Arc<MirrorContext>,
}

impl ApplyBatchTool {
    pub fn new(context: Arc<MirrorContext>) -> Self {
        Self { context }
    }
}

#[async_trait]
impl McpTool for ApplyBatchTool {
    fn name(&self) -> &str {
        "apply_workspace_batch"
    }

    fn description(&self) -> &str {
        "Apply an ordered list of edit operations as one unit. Each entry has an `op` tag \
         (write_file, replace_text, edit_range, edit_line, delete_lines, delete_word, \
         delete_chars, delete_path, make_directory, remove_directory, move, apply_patch, \
         read_sections) plus that operation's fields. With rollback_on_error (default) a \
         failure restores the tree to its pre-batch state."
    }

    async fn execute(&self, params: Value) -> McpResult<Value> {
        let target = Target::from_params(&params)?;
        let raw_ops = params
            .get("operations")
            .and_then(Value::as_array)
            .ok_or_else(|| validation_error("Parameter 'operations' must be an array"))?;
        let plan = BatchPlan {
            fail_fast: optional_bool(&params, "fail_fast", true)?,
            rollback_on_error: optional_bool(&params, "rollback_on_error", true)?,
            preview_only: optional_bool(&params, "preview_only", false)?,
            create_parents: optional_bool(&params, "create_parents", true)?,
            include_summary: optional_bool(&params, "include_summary", false)?,
            ..BatchPlan::new(parse_operations(raw_ops).map_err(mirror_error)?)
        };
        let locked = !plan.preview_only && plan.operations.iter().any(EditOperation::is_mutating);

        let mut result = self
            .context
            .blocking(move |manager| {
                let handle = if locked {
                    acquire(manager, &target)?
                } else {
                    open(manager, &target)?
                };
                run_batch(&handle, &plan, manager.config())
            })
            .await?;

        let failure = result.take_failure();
        let mut structured =
            serde_json::to_value(&result).map_err(|e| internal_error(e.to_string()))?;
        if let Some(err) = failure {
            structured["error"] = mirror_error(err).data().unwrap_or(Value::Null);
        }

        let applied = result
            .operations
            .iter()
            .filter(|o| o.status == mirrorkit_engine::OperationStatus::Applied)
            .count();
        let text = format!(
            "Batch {} ({:?}): {}/{} operation(s) applied{}",
            match result.status {
                BatchStatus::Success => "succeeded",
                BatchStatus::Partial => "partially applied",
                BatchStatus::Failed => "failed",
            },
            result.state,
            applied,
            result.operations.len(),
            if result.preview { " [preview]" } else { "" }
        );
        info!(target: "mirrorkit_tools", status = ?result.status, state = ?result.state, "batch finished");
        Ok(tool_result(text, structured))
    }

    fn input_schema(&self) -> Value {
        target_schema(
            json!({
                "operations": {
                    "type": "array",
                    "items": {
                        "type": "object",
                        "properties": {"op": {"type": "string", "enum": mirrorkit_engine::batch::OPERATION_KINDS}},
                        "required": ["op"]
                    }
                },
                "fail_fast": {"type": "boolean", "default": true},
                "rollback_on_error": {"type": "boolean", "default": true},
                "preview_only": {"type": "boolean", "default": false},
                "create_parents": {"type": "boolean", "default": true},
                "include_summary": {"type": "boolean", "default": false}
            }),
            &["operations"],
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn shared_params_are_stripped_before_parsing() {
        let op = operation_from_params(
            "edit_line",
            &json!({
                "repo": "o/r", "ref": "main", "preview": true, "create_parents": false,
                "path": "a.txt", "line": 1, "operation": "replace", "text": "HELLO"
            }),
        )
        .unwrap();
        assert_eq!(op.kind(), "edit_line");
        assert_eq!(op.path(), Some("a.txt"));
    }

    #[test]
    fn missing_operation_field_is_validation() {
        let err = operation_from_params("edit_line", &json!({"repo": "o/r", "path": "a.txt"}))
            .unwrap_err();
        assert_eq!(err.error_code(), Some("E_VALIDATION"));
    }

    #[test]
    fn tool_names_are_unique_and_ops_known() {
        let mut names: Vec<&str> = EDIT_TOOLS.iter().map(|s| s.name).collect();
        names.sort_unstable();
        names.dedup();
        assert_eq!(names.len(), EDIT_TOOLS.len());
        for spec in EDIT_TOOLS {
            assert!(
                mirrorkit_engine::batch::OPERATION_KINDS.contains(&spec.op),
                "{}",
                spec.op
            );
            let props = (spec.properties)();
            for field in spec.required {
                assert!(props.get(*field).is_some(), "{}: {}", spec.name, field);
            }
        }
    }
}
