mod common;
use common::*;

use std::collections::HashSet;
use std::fs;
use std::path::PathBuf;

use mcp_core::codes;
use serde_json::{json, Value};

async fn ensure_main(h: &Harness) -> PathBuf {
    let result = h
        .tool("ensure_workspace")
        .execute(json!({"repo": REPO}))
        .await
        .unwrap();
    PathBuf::from(result["structuredContent"]["mirror"]["path"].as_str().unwrap())
}

#[tokio::test]
async fn descriptors_are_unique_and_require_repo() {
    let h = Harness::new();
    let mut names = HashSet::new();
    for (name, tool) in &h.tools {
        assert!(names.insert(name.clone()), "duplicate tool {}", name);
        let descriptor = tool.descriptor();
        assert_eq!(descriptor.input_schema["type"], "object");
        if name != "make_diff" && name != "list_workspaces" {
            let required = descriptor.input_schema["required"].as_array().unwrap();
            assert!(required.contains(&json!("repo")), "{} must require repo", name);
        }
    }
    assert!(h.tools.contains_key("run_pr_workflow"));
    assert!(h.tools.contains_key("edit_workspace_line"));
}

#[tokio::test]
async fn ensure_clones_then_reuses() {
    let h = Harness::new();
    let first = h
        .tool("ensure_workspace")
        .execute(json!({"repo": REPO}))
        .await
        .unwrap();
    assert_eq!(first["structuredContent"]["created"], true);
    assert_eq!(first["structuredContent"]["action"], "cloned");

    let second = h
        .tool("ensure_workspace")
        .execute(json!({"repo": REPO, "ref": "main"}))
        .await
        .unwrap();
    assert_eq!(second["structuredContent"]["created"], false);
    assert_eq!(second["structuredContent"]["action"], "up_to_date");
    assert!(second["content"][0]["text"].as_str().unwrap().starts_with("Refreshed"));
}

#[tokio::test]
async fn edit_line_tool_materializes_and_edits() {
    let h = Harness::new();
    let result = h
        .tool("edit_workspace_line")
        .execute(json!({
            "repo": REPO,
            "path": "a.txt",
            "line": 1,
            "operation": "replace",
            "text": "HELLO"
        }))
        .await
        .unwrap();
    assert_eq!(result["structuredContent"]["status"], "applied");

    let root = ensure_main(&h).await;
    assert_eq!(fs::read_to_string(root.join("a.txt")).unwrap(), "HELLO\nworld\n");
}

#[tokio::test]
async fn preview_edit_leaves_file_alone() {
    let h = Harness::new();
    let root = ensure_main(&h).await;
    let result = h
        .tool("replace_workspace_text")
        .execute(json!({
            "repo": REPO,
            "path": "a.txt",
            "old": "world",
            "new": "there",
            "preview": true
        }))
        .await
        .unwrap();
    let diff = result["structuredContent"]["diff"].as_str().unwrap();
    assert!(diff.contains("+there"));
    assert_eq!(fs::read_to_string(root.join("a.txt")).unwrap(), "hello\nworld\n");
}

#[tokio::test]
async fn read_tool_pages_lines() {
    let h = Harness::new();
    let result = h
        .tool("read_workspace_file")
        .execute(json!({"repo": REPO, "path": "a.txt", "start_line": 2, "max_lines": 5}))
        .await
        .unwrap();
    let output = &result["structuredContent"]["output"];
    assert_eq!(output["start_line"], 2);
    assert_eq!(output["total_lines"], 2);
    assert!(output["next_start_line"].is_null());
}

#[tokio::test]
async fn failed_batch_is_a_result_with_error_payload() {
    let h = Harness::new();
    let root = ensure_main(&h).await;
    let result = h
        .tool("apply_workspace_batch")
        .execute(json!({
            "repo": REPO,
            "operations": [
                {"op": "write_file", "path": "x.txt", "content": "1"},
                {"op": "delete_path", "path": "missing.txt"}
            ]
        }))
        .await
        .unwrap();
    let structured = &result["structuredContent"];
    assert_eq!(structured["status"], "failed");
    assert_eq!(structured["state"], "rolled_back");
    assert_eq!(structured["error"]["code"], "E_APPLY");
    assert_eq!(structured["error"]["details"]["operation_index"], 1);
    assert!(!root.join("x.txt").exists());
}

#[tokio::test]
async fn unknown_operation_is_invalid_params() {
    let h = Harness::new();
    let err = h
        .tool("apply_workspace_batch")
        .execute(json!({"repo": REPO, "operations": [{"op": "teleport"}]}))
        .await
        .unwrap_err();
    assert_eq!(err.code(), codes::INVALID_PARAMS);
    assert_eq!(err.error_code(), Some("E_VALIDATION"));
}

#[tokio::test]
async fn path_escape_is_rejected() {
    let h = Harness::new();
    let err = h
        .tool("write_workspace_file")
        .execute(json!({"repo": REPO, "path": "../../etc/passwd", "content": "x"}))
        .await
        .unwrap_err();
    assert_eq!(err.error_code(), Some("E_PATH_ESCAPE"));
}

#[tokio::test]
async fn text_diff_needs_no_mirror() {
    let h = Harness::new();
    let result = h
        .tool("make_diff")
        .execute(json!({"before": "a\nb\n", "after": "a\nc\n", "label": "notes.txt"}))
        .await
        .unwrap();
    let structured = &result["structuredContent"];
    assert_eq!(structured["added"], 1);
    assert_eq!(structured["removed"], 1);
    assert!(structured["diff"].as_str().unwrap().contains("notes.txt"));
}

#[tokio::test]
async fn compare_against_head_revision() {
    let h = Harness::new();
    let root = ensure_main(&h).await;
    fs::write(root.join("a.txt"), "hello\nworld\nagain\n").unwrap();
    let result = h
        .tool("compare_workspace_files")
        .execute(json!({
            "repo": REPO,
            "left": {"kind": "path_at_rev", "path": "a.txt", "rev": "HEAD"},
            "right": {"kind": "path", "path": "a.txt"}
        }))
        .await
        .unwrap();
    assert_eq!(result["structuredContent"]["added"], 1);
    assert_eq!(result["structuredContent"]["identical"], false);
}

#[cfg(unix)]
#[tokio::test]
async fn command_exit_code_is_a_result() {
    let h = Harness::new();
    let result = h
        .tool("run_workspace_command")
        .execute(json!({"repo": REPO, "command": "cat a.txt; exit 1"}))
        .await
        .unwrap();
    let structured = &result["structuredContent"];
    assert_eq!(structured["exit_code"], 1);
    assert_eq!(structured["timed_out"], false);
    assert!(structured["stdout"].as_str().unwrap().contains("hello"));
    assert!(structured.get("error").is_none());
}

#[cfg(unix)]
#[tokio::test]
async fn command_timeout_carries_error_payload() {
    let h = Harness::new();
    let result = h
        .tool("run_workspace_command")
        .execute(json!({"repo": REPO, "command": "echo started; sleep 5", "timeout": 1}))
        .await
        .unwrap();
    let structured = &result["structuredContent"];
    assert_eq!(structured["timed_out"], true);
    assert_eq!(structured["error"]["code"], "E_TIMEOUT");
    assert!(structured["stdout"].as_str().unwrap().contains("started"));
}

#[tokio::test]
async fn status_and_delete_round_out_lifecycle() {
    let h = Harness::new();
    ensure_main(&h).await;
    let status = h
        .tool("workspace_status")
        .execute(json!({"repo": REPO}))
        .await
        .unwrap();
    assert_eq!(status["structuredContent"]["consistent"], true);
    assert_eq!(status["structuredContent"]["locked"], false);

    let listed = h.tool("list_workspaces").execute(json!({})).await.unwrap();
    assert_eq!(count_mirrors(&listed), 1);

    h.tool("delete_workspace")
        .execute(json!({"repo": REPO}))
        .await
        .unwrap();
    let listed = h.tool("list_workspaces").execute(json!({})).await.unwrap();
    assert_eq!(count_mirrors(&listed), 0);
}

fn count_mirrors(result: &Value) -> usize {
    result["structuredContent"]["mirrors"]
        .as_array()
        .map(Vec::len)
        .unwrap_or(0)
}

#[cfg(unix)]
#[tokio::test]
async fn workflow_pushes_branch_and_opens_pull_request() {
    let h = Harness::new();
    let result = h
        .tool("run_pr_workflow")
        .execute(json!({
            "repo": REPO,
            "branch": "feat/greeting",
            "commit_message": "Add greeting",
            "operations": [
                {"op": "write_file", "path": "greeting.txt", "content": "hi\n"}
            ],
            "quality_gate": ["test -f greeting.txt"]
        }))
        .await
        .unwrap();
    let structured = &result["structuredContent"];
    assert_eq!(structured["success"], true, "{}", result["content"][0]["text"]);
    assert_eq!(structured["pull_request"]["number"], 1);
    assert_eq!(h.gateway.created.lock().unwrap().len(), 1);

    let remote = git(&h.bare(), "show feat/greeting:greeting.txt");
    assert_eq!(remote, "hi");
}
