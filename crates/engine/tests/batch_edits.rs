mod common;
use common::*;

use std::fs;

use mirrorkit_engine::{
    apply_patch, parse_operations, run_batch, ApplyOptions, BatchExecutor, BatchPlan, BatchState,
    BatchStatus, MirrorError, MirrorHandle, OperationStatus,
};
use serde_json::json;

fn locked_main(fx: &Fixture) -> MirrorHandle {
    let key = fx.manager.key(REPO, None).unwrap();
    fx.manager.ensure(&key, false).unwrap();
    fx.manager.acquire(&key).unwrap()
}

fn plan(ops: serde_json::Value) -> BatchPlan {
    let values = ops.as_array().unwrap().clone();
    BatchPlan::new(parse_operations(&values).unwrap())
}

#[test]
fn edit_line_replaces_first_line() {
    let fx = Fixture::new();
    let handle = locked_main(&fx);
    let result = run_batch(
        &handle,
        &plan(json!([
            {"op": "edit_line", "path": "a.txt", "line": 1, "operation": "replace", "text": "HELLO"}
        ])),
        fx.manager.config(),
    )
    .unwrap();

    assert!(result.is_success());
    assert_eq!(
        fs::read_to_string(handle.root().join("a.txt")).unwrap(),
        "HELLO\nworld\n"
    );
}

#[test]
fn failed_delete_rolls_back_earlier_write() {
    let fx = Fixture::new();
    let handle = locked_main(&fx);
    let result = run_batch(
        &handle,
        &plan(json!([
            {"op": "write_file", "path": "x.txt", "content": "1"},
            {"op": "delete_path", "path": "missing.txt"}
        ])),
        fx.manager.config(),
    )
    .unwrap();

    assert_eq!(result.status, BatchStatus::Failed);
    assert_eq!(result.state, BatchState::RolledBack);
    assert_eq!(result.operations[1].status, OperationStatus::Failed);
    assert!(!handle.root().join("x.txt").exists());
    assert!(!handle.git.is_dirty().unwrap());
}

#[test]
fn replace_second_occurrence_only() {
    let fx = Fixture::new();
    let handle = locked_main(&fx);
    fs::write(handle.root().join("foo.txt"), "foo foo foo").unwrap();

    let result = run_batch(
        &handle,
        &plan(json!([
            {"op": "replace_text", "path": "foo.txt", "old": "foo", "new": "bar",
             "occurrence": 2, "replace_all": false}
        ])),
        fx.manager.config(),
    )
    .unwrap();

    assert!(result.is_success());
    assert_eq!(
        fs::read_to_string(handle.root().join("foo.txt")).unwrap(),
        "foo bar foo"
    );
}

#[test]
fn mixed_batch_with_directories_commits_in_order() {
    let fx = Fixture::new();
    let handle = locked_main(&fx);
    let mut batch = plan(json!([
        {"op": "make_directory", "path": "docs/guide"},
        {"op": "write_file", "path": "docs/guide/intro.md", "content": "# Intro\n"},
        {"op": "move", "from": "a.txt", "to": "docs/a.txt"},
        {"op": "replace_text", "path": "src/lib.rs", "old": "42", "new": "43"},
        {"op": "delete_lines", "path": "docs/a.txt", "start_line": 2}
    ]));
    batch.include_summary = true;

    let result = run_batch(&handle, &batch, fx.manager.config()).unwrap();
    assert!(result.is_success(), "{:?}", result.failure());
    assert_eq!(result.state, BatchState::Committed);
    let root = handle.root();
    assert_eq!(fs::read_to_string(root.join("docs/guide/intro.md")).unwrap(), "# Intro\n");
    assert_eq!(fs::read_to_string(root.join("docs/a.txt")).unwrap(), "hello\n");
    assert!(!root.join("a.txt").exists());
    assert!(fs::read_to_string(root.join("src/lib.rs")).unwrap().contains("43"));
    let summary = result.summary.unwrap();
    assert!(summary.created >= 2);
}

#[test]
fn rollback_restores_removed_directory_tree() {
    let fx = Fixture::new();
    let handle = locked_main(&fx);
    let before = fs::read_to_string(handle.root().join("src/lib.rs")).unwrap();

    let result = run_batch(
        &handle,
        &plan(json!([
            {"op": "remove_directory", "path": "src", "recursive": true},
            {"op": "write_file", "path": "new.txt", "content": "n"},
            {"op": "edit_line", "path": "a.txt", "line": 99, "operation": "delete"}
        ])),
        fx.manager.config(),
    )
    .unwrap();

    assert_eq!(result.state, BatchState::RolledBack);
    assert_eq!(
        fs::read_to_string(handle.root().join("src/lib.rs")).unwrap(),
        before
    );
    assert!(!handle.root().join("new.txt").exists());
    assert!(!handle.git.is_dirty().unwrap());
}

#[test]
fn escaping_path_rejects_whole_batch() {
    let fx = Fixture::new();
    let handle = locked_main(&fx);
    let err = run_batch(
        &handle,
        &plan(json!([
            {"op": "write_file", "path": "ok.txt", "content": "fine"},
            {"op": "write_file", "path": "../outside.txt", "content": "nope"}
        ])),
        fx.manager.config(),
    )
    .unwrap_err();

    assert!(err.is_validation());
    assert!(!handle.root().join("ok.txt").exists());
    assert!(!handle.root().parent().unwrap().join("outside.txt").exists());
}

#[test]
fn preview_reports_diffs_without_touching_mirror() {
    let fx = Fixture::new();
    let handle = locked_main(&fx);
    let mut batch = plan(json!([
        {"op": "write_file", "path": "a.txt", "content": "changed\n"},
        {"op": "edit_line", "path": "a.txt", "line": 1, "operation": "insert_before", "text": "top"}
    ]));
    batch.preview_only = true;

    let result = run_batch(&handle, &batch, fx.manager.config()).unwrap();
    assert!(result.preview);
    assert!(result.is_success());
    let second = result.operations[1].diff.as_deref().unwrap();
    assert!(second.contains("+top"), "{second}");
    assert!(!handle.git.is_dirty().unwrap());
}

#[test]
fn unlocked_handle_cannot_mutate() {
    let fx = Fixture::new();
    let key = fx.manager.key(REPO, None).unwrap();
    fx.manager.ensure(&key, false).unwrap();
    let reader = fx.manager.open(&key).unwrap();

    let err = run_batch(
        &reader,
        &plan(json!([{"op": "write_file", "path": "x.txt", "content": "1"}])),
        fx.manager.config(),
    )
    .unwrap_err();
    assert!(matches!(err, MirrorError::Internal { .. }));

    let read = run_batch(
        &reader,
        &plan(json!([{"op": "read_sections", "path": "a.txt"}])),
        fx.manager.config(),
    )
    .unwrap();
    assert!(read.is_success());
    assert!(read.operations[0].output.is_some());
}

#[test]
fn single_edit_surfaces_its_error() {
    let fx = Fixture::new();
    let handle = locked_main(&fx);
    let executor = BatchExecutor::from_config(&handle.paths, fx.manager.config());
    let op = parse_operations(&[json!({
        "op": "replace_text", "path": "a.txt", "old": "absent", "new": "x"
    })])
    .unwrap()
    .remove(0);

    let err = executor.apply_single(op, true, false).unwrap_err();
    assert_eq!(err.error_code(), "E_APPLY");
}

#[test]
fn patch_is_committed_and_pushed() {
    let fx = Fixture::new();
    let handle = locked_main(&fx);
    let patch = "--- a/a.txt\n+++ b/a.txt\n@@ -1,2 +1,2 @@\n hello\n-world\n+there\n\
                 --- /dev/null\n+++ b/notes/todo.md\n@@ -0,0 +1 @@\n+- ship it\n";

    let outcome = apply_patch(
        &handle,
        &[patch.to_string()],
        &ApplyOptions {
            push: true,
            commit_message: Some("Patch a.txt".into()),
            ..ApplyOptions::default()
        },
        "origin",
    )
    .unwrap();

    assert!(outcome.pushed);
    let commit = outcome.commit.unwrap();
    assert_eq!(fx.remote_head("main").as_deref(), Some(commit.as_str()));
    assert_eq!(fx.remote_file("main", "a.txt").unwrap(), "hello\nthere\n");
    assert_eq!(fx.remote_file("main", "notes/todo.md").unwrap(), "- ship it\n");
    assert_eq!(outcome.stats.lines_added, 2);
}

#[test]
fn mismatched_patch_leaves_tree_untouched() {
    let fx = Fixture::new();
    let handle = locked_main(&fx);
    let good = "--- /dev/null\n+++ b/fresh.txt\n@@ -0,0 +1 @@\n+fresh\n";
    let bad = "--- a/a.txt\n+++ b/a.txt\n@@ -1,2 +1,2 @@\n hello\n-nothere\n+x\n";

    let err = apply_patch(
        &handle,
        &[good.to_string(), bad.to_string()],
        &ApplyOptions::default(),
        "origin",
    )
    .unwrap_err();

    assert_eq!(err.error_code(), "E_APPLY");
    assert!(!handle.root().join("fresh.txt").exists());
    assert!(!handle.git.is_dirty().unwrap());
}
