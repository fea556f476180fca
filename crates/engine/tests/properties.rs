//! Property tests for the text addressing, diff and batch rollback paths.
//! Generated text mixes LF and CRLF endings and multibyte characters.

use std::collections::BTreeMap;
use std::fs;
use std::path::Path;

use mirrorkit_engine::patch::apply_to_text;
use mirrorkit_engine::patch_parser::ParsedPatch;
use mirrorkit_engine::text::{edit_range, position_after, read_range};
use mirrorkit_engine::{
    compare, parse_operations, BatchExecutor, BatchPlan, DiffLimits, DiffSource, MirrorPaths,
    Position,
};
use proptest::prelude::*;
use serde_json::{json, Value};
use tempfile::TempDir;
use walkdir::WalkDir;

fn arb_line() -> impl Strategy<Value = String> {
    "[a-z é日本🦀]{0,8}"
}

/// Lines joined by a per-line choice of `\n` or `\r\n`, optionally ending
/// without a final line break.
fn arb_text() -> impl Strategy<Value = String> {
    (
        prop::collection::vec((arb_line(), any::<bool>()), 1..6),
        any::<bool>(),
    )
        .prop_map(|(lines, trailing)| {
            let last = lines.len() - 1;
            let mut text = String::new();
            for (i, (line, crlf)) in lines.into_iter().enumerate() {
                text.push_str(&line);
                if i < last || trailing {
                    text.push_str(if crlf { "\r\n" } else { "\n" });
                }
            }
            text
        })
}

// Character width of each line, without its ending.
fn widths(text: &str) -> Vec<usize> {
    text.split_inclusive('\n')
        .map(|l| {
            l.strip_suffix('\n')
                .map(|l| l.strip_suffix('\r').unwrap_or(l))
                .unwrap_or(l)
                .chars()
                .count()
        })
        .collect()
}

fn pick(text: &str, (a, b): (usize, usize)) -> Position {
    let widths = widths(text);
    // End of file gets its own line only after a final line break.
    let eof_line = text.is_empty() || text.ends_with('\n');
    let choices = widths.len() + usize::from(eof_line);
    let line = a % choices;
    match widths.get(line) {
        Some(width) => Position::new(line + 1, b % (width + 1) + 1),
        None => Position::new(line + 1, 1),
    }
}

fn ordered(a: Position, b: Position) -> (Position, Position) {
    if (a.line, a.col) <= (b.line, b.col) {
        (a, b)
    } else {
        (b, a)
    }
}

fn unbounded() -> DiffLimits {
    DiffLimits {
        context_lines: 3,
        max_chars_per_side: usize::MAX,
        max_diff_chars: usize::MAX,
    }
}

fn tree() -> (TempDir, MirrorPaths) {
    let dir = TempDir::new().unwrap();
    fs::write(dir.path().join("a.txt"), "hello\r\nwörld\n").unwrap();
    fs::create_dir_all(dir.path().join("src/nested")).unwrap();
    fs::write(dir.path().join("src/lib.rs"), "fn main() {}\n").unwrap();
    fs::write(dir.path().join("src/nested/deep.txt"), "日本\n").unwrap();
    let paths = MirrorPaths::new(dir.path()).unwrap();
    (dir, paths)
}

fn snapshot(root: &Path) -> BTreeMap<String, Option<Vec<u8>>> {
    WalkDir::new(root)
        .into_iter()
        .filter_map(Result::ok)
        .map(|e| {
            let rel = e.path().strip_prefix(root).unwrap().to_string_lossy().to_string();
            let bytes = e.file_type().is_file().then(|| fs::read(e.path()).unwrap());
            (rel, bytes)
        })
        .collect()
}

fn arb_operation() -> impl Strategy<Value = Value> {
    let file = prop_oneof![
        Just("a.txt"),
        Just("src/lib.rs"),
        Just("src/nested/deep.txt"),
        Just("fresh/dir/new.txt"),
    ];
    prop_oneof![
        (file, arb_text()).prop_map(|(path, content)| {
            json!({"op": "write_file", "path": path, "content": content})
        }),
        prop_oneof![Just("a.txt"), Just("src/lib.rs"), Just("src")]
            .prop_map(|path| json!({"op": "delete_path", "path": path})),
        Just(json!({"op": "remove_directory", "path": "src/nested", "recursive": true})),
        Just(json!({"op": "make_directory", "path": "made/here"})),
        Just(json!({"op": "move", "from": "a.txt", "to": "moved/a.txt"})),
        Just(json!({"op": "edit_range", "path": "a.txt",
            "start": {"line": 1, "col": 1}, "end": {"line": 1, "col": 1}, "text": "ü\r\n"})),
    ]
}

proptest! {
    #[test]
    fn edited_range_reads_back(
        text in arb_text(),
        a in (any::<usize>(), any::<usize>()),
        b in (any::<usize>(), any::<usize>()),
        replacement in arb_text(),
    ) {
        let (start, end) = ordered(pick(&text, a), pick(&text, b));
        let edited = edit_range(&text, start, end, &replacement).unwrap();
        let end_after = position_after(start, &replacement);
        prop_assert_eq!(read_range(&edited, start, end_after).unwrap(), replacement);
    }

    #[test]
    fn reading_then_writing_a_range_is_identity(
        text in arb_text(),
        a in (any::<usize>(), any::<usize>()),
        b in (any::<usize>(), any::<usize>()),
    ) {
        let (start, end) = ordered(pick(&text, a), pick(&text, b));
        let slice = read_range(&text, start, end).unwrap();
        prop_assert_eq!(edit_range(&text, start, end, &slice).unwrap(), text);
    }

    #[test]
    fn diff_applies_back_to_target(before in arb_text(), after in arb_text()) {
        prop_assume!(before != after);
        let result = compare(
            None,
            &DiffSource::Text { text: before.clone() },
            &DiffSource::Text { text: after.clone() },
            Some("f.txt"),
            unbounded(),
        )
        .unwrap();
        prop_assert!(!result.truncated);
        let parsed = ParsedPatch::from_diff(&result.diff).unwrap();
        prop_assert_eq!(apply_to_text(&before, &parsed.files[0]).unwrap(), after);
    }
}

proptest! {
    #![proptest_config(ProptestConfig::with_cases(48))]

    #[test]
    fn failed_batch_restores_tree(ops in prop::collection::vec(arb_operation(), 0..6)) {
        let (dir, paths) = tree();
        let before = snapshot(dir.path());

        let mut values = ops;
        values.push(json!({"op": "delete_path", "path": "never/there.txt"}));
        let plan = BatchPlan::new(parse_operations(&values).unwrap());
        if let Ok(result) = BatchExecutor::new(&paths).execute(&plan) {
            prop_assert!(!result.is_success());
        }
        prop_assert_eq!(snapshot(dir.path()), before);
    }
}
