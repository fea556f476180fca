//! All-or-nothing application of unified diffs to a mirror.
//!
//! Every hunk of every file is applied in memory first. Only when the whole
//! call verifies are files written, and a failed write restores the files
//! already touched.

use std::collections::BTreeMap;
use std::fs;

use serde::Serialize;
use tracing::{info, warn};

use crate::errors::{MirrorError, MirrorResult};
use crate::lifecycle::MirrorHandle;
use crate::patch_parser::{FilePatch, ParsedPatch, PatchHunk, PatchLine};
use crate::path_security::MirrorPaths;
use mirrorkit_common::write_atomic;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeKind {
    Created,
    Modified,
    Deleted,
}

/// One file's post-patch state, not yet written.
#[derive(Debug, Clone)]
pub struct StagedChange {
    pub path: String,
    /// `None` deletes the file
    pub content: Option<String>,
    pub kind: ChangeKind,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct PatchStats {
    pub files_created: usize,
    pub files_modified: usize,
    pub files_deleted: usize,
    pub hunks_applied: usize,
    pub lines_added: usize,
    pub lines_removed: usize,
}

#[derive(Debug, Clone, Default)]
pub struct ApplyOptions {
    /// `git add -A` after writing
    pub add: bool,
    /// Commit with `commit_message`; implies `add`
    pub commit: bool,
    /// Push the current branch; implies `commit`
    pub push: bool,
    pub commit_message: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PatchOutcome {
    pub files: Vec<FileChange>,
    pub stats: PatchStats,
    pub commit: Option<String>,
    pub pushed: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct FileChange {
    pub path: String,
    pub kind: ChangeKind,
}

/// Apply one file patch to `original` text.
pub fn apply_to_text(original: &str, patch: &FilePatch) -> MirrorResult<String> {
    let path = patch.display_path();
    let had_final_newline = original.is_empty() || original.ends_with('\n');
    let mut lines: Vec<String> = original
        .split_inclusive('\n')
        .map(|l| l.strip_suffix('\n').unwrap_or(l).to_string())
        .collect();
    let mut final_newline = had_final_newline;

    let mut delta: isize = 0;
    let mut floor = 0usize;
    for (index, hunk) in patch.hunks.iter().enumerate() {
        let old: Vec<&str> = hunk.old_lines().collect();
        let expected = hunk_anchor(hunk) as isize + delta;
        let at = locate(&lines, &old, expected.max(0) as usize, floor).ok_or_else(|| {
            MirrorError::apply(
                Some(path),
                format!(
                    "hunk #{} (@@ -{},{} +{},{} @@) does not match current content",
                    index + 1,
                    hunk.old_start,
                    hunk.old_count,
                    hunk.new_start,
                    hunk.new_count
                ),
            )
        })?;

        let reaches_eof = at + old.len() == lines.len();
        let new: Vec<String> = hunk.new_lines().map(str::to_string).collect();
        let added = new.len();
        lines.splice(at..at + old.len(), new);
        delta += added as isize - old.len() as isize;
        floor = at + added;

        if reaches_eof {
            final_newline = !hunk.new_missing_newline;
        }
    }

    let mut out = lines.join("\n");
    if final_newline && !lines.is_empty() {
        out.push('\n');
    }
    Ok(out)
}

// Zero-based line index a hunk expects to start at.
fn hunk_anchor(hunk: &PatchHunk) -> usize {
    if hunk.old_count == 0 {
        hunk.old_start
    } else {
        hunk.old_start.saturating_sub(1)
    }
}

// Exact match at `expected`, otherwise the nearest offset that matches.
fn locate(lines: &[String], old: &[&str], expected: usize, floor: usize) -> Option<usize> {
    let fits = |at: usize| {
        at >= floor
            && at + old.len() <= lines.len()
            && lines[at..at + old.len()]
                .iter()
                .zip(old)
                .all(|(have, want)| have == want)
    };
    if fits(expected) {
        return Some(expected);
    }
    let limit = lines.len().max(expected);
    for distance in 1..=limit {
        if let Some(before) = expected.checked_sub(distance) {
            if fits(before) {
                return Some(before);
            }
        }
        if fits(expected + distance) {
            return Some(expected + distance);
        }
    }
    None
}

/// Current content of a file in the tree, `None` if absent.
pub fn read_tree_file(paths: &MirrorPaths, path: &str) -> MirrorResult<Option<String>> {
    let full = paths.resolve(path)?;
    if !full.is_file() {
        return Ok(None);
    }
    fs::read_to_string(&full)
        .map(Some)
        .map_err(|e| MirrorError::io(Some(full), "read patch target", e))
}

struct Overlay<F> {
    staged: BTreeMap<String, Option<String>>,
    base: F,
}

impl<F> Overlay<F>
where
    F: FnMut(&str) -> MirrorResult<Option<String>>,
{
    fn read(&mut self, path: &str) -> MirrorResult<Option<String>> {
        match self.staged.get(path) {
            Some(staged) => Ok(staged.clone()),
            None => (self.base)(path),
        }
    }
}

/// Verify every patch text against the tree and return the resulting file
/// states. Nothing is written.
pub fn stage_patches(
    paths: &MirrorPaths,
    patch_texts: &[String],
) -> MirrorResult<(Vec<StagedChange>, PatchStats)> {
    stage_patches_over(paths, patch_texts, |path| read_tree_file(paths, path))
}

/// [`stage_patches`] against an arbitrary view of the tree. `base` returns a
/// file's current content; batches use it to see their own earlier edits.
pub fn stage_patches_over<F>(
    paths: &MirrorPaths,
    patch_texts: &[String],
    base: F,
) -> MirrorResult<(Vec<StagedChange>, PatchStats)>
where
    F: FnMut(&str) -> MirrorResult<Option<String>>,
{
    let mut overlay = Overlay {
        staged: BTreeMap::new(),
        base,
    };
    let mut kinds: BTreeMap<String, ChangeKind> = BTreeMap::new();
    let mut stats = PatchStats::default();

    for text in patch_texts {
        let parsed = ParsedPatch::from_diff(text)?;
        for file in &parsed.files {
            for path in [&file.old_path, &file.new_path].into_iter().flatten() {
                paths.resolve(path)?;
            }
            if file.is_binary {
                return Err(MirrorError::apply(
                    Some(file.display_path()),
                    "binary patches are not supported",
                ));
            }
            stage_file(file, &mut overlay, &mut kinds, &mut stats)?;
        }
    }

    let changes = overlay
        .staged
        .into_iter()
        .map(|(path, content)| {
            let kind = kinds.get(&path).copied().unwrap_or(ChangeKind::Modified);
            StagedChange {
                path,
                content,
                kind,
            }
        })
        .collect();
    Ok((changes, stats))
}

fn stage_file<F>(
    file: &FilePatch,
    overlay: &mut Overlay<F>,
    kinds: &mut BTreeMap<String, ChangeKind>,
    stats: &mut PatchStats,
) -> MirrorResult<()>
where
    F: FnMut(&str) -> MirrorResult<Option<String>>,
{
    let source = if file.is_new_file {
        None
    } else {
        file.old_path.as_deref()
    };
    let target = if file.is_deleted_file {
        None
    } else {
        file.new_path.as_deref()
    };

    let original = match source {
        Some(path) => Some(overlay.read(path)?.ok_or_else(|| {
            MirrorError::apply(Some(path), "file to patch does not exist")
        })?),
        None => None,
    };
    if let Some(path) = target {
        if source != Some(path) && overlay.read(path)?.is_some() {
            return Err(MirrorError::apply(
                Some(path),
                "patch creates a file that already exists",
            ));
        }
    }

    let result = apply_to_text(original.as_deref().unwrap_or(""), file)?;

    match (source, target) {
        (Some(old), None) => {
            if !result.is_empty() {
                return Err(MirrorError::apply(
                    Some(old),
                    "deletion patch does not remove the whole file",
                ));
            }
            overlay.staged.insert(old.to_string(), None);
            record_kind(kinds, old, ChangeKind::Deleted);
            stats.files_deleted += 1;
        }
        (None, Some(new)) => {
            overlay.staged.insert(new.to_string(), Some(result));
            record_kind(kinds, new, ChangeKind::Created);
            stats.files_created += 1;
        }
        (Some(old), Some(new)) => {
            if old != new {
                overlay.staged.insert(old.to_string(), None);
                record_kind(kinds, old, ChangeKind::Deleted);
                record_kind(kinds, new, ChangeKind::Created);
            } else {
                record_kind(kinds, new, ChangeKind::Modified);
            }
            overlay.staged.insert(new.to_string(), Some(result));
            stats.files_modified += 1;
        }
        (None, None) => {
            return Err(MirrorError::validation("patch", "file patch has no paths"));
        }
    }

    stats.hunks_applied += file.hunks.len();
    for line in file.hunks.iter().flat_map(|h| &h.lines) {
        match line {
            PatchLine::Add(_) => stats.lines_added += 1,
            PatchLine::Remove(_) => stats.lines_removed += 1,
            PatchLine::Context(_) => {}
        }
    }
    Ok(())
}

// A file created then modified within one call stays "created".
fn record_kind(kinds: &mut BTreeMap<String, ChangeKind>, path: &str, kind: ChangeKind) {
    let merged = match (kinds.get(path), kind) {
        (Some(ChangeKind::Created), ChangeKind::Modified) => ChangeKind::Created,
        (Some(ChangeKind::Deleted), ChangeKind::Created) => ChangeKind::Modified,
        _ => kind,
    };
    kinds.insert(path.to_string(), merged);
}

/// Write staged changes. On failure every file already written is restored.
pub fn materialize(paths: &MirrorPaths, changes: &[StagedChange]) -> MirrorResult<()> {
    let mut pre_images: Vec<(std::path::PathBuf, Option<Vec<u8>>)> = Vec::new();

    let result = (|| -> MirrorResult<()> {
        for change in changes {
            let full = paths.resolve(&change.path)?;
            let before = if full.is_file() {
                Some(
                    fs::read(&full)
                        .map_err(|e| MirrorError::io(Some(full.clone()), "snapshot file", e))?,
                )
            } else {
                None
            };
            pre_images.push((full.clone(), before));

            match &change.content {
                Some(content) => {
                    if let Some(parent) = full.parent() {
                        fs::create_dir_all(parent).map_err(|e| {
                            MirrorError::io(Some(parent.to_path_buf()), "create parent", e)
                        })?;
                    }
                    write_atomic(&full, content.as_bytes())?;
                }
                None => {
                    if full.exists() {
                        fs::remove_file(&full)
                            .map_err(|e| MirrorError::io(Some(full.clone()), "delete file", e))?;
                    }
                }
            }
        }
        Ok(())
    })();

    if result.is_err() {
        for (full, before) in pre_images.into_iter().rev() {
            let restored = match before {
                Some(bytes) => write_atomic(&full, &bytes).map_err(MirrorError::from),
                None if full.exists() => fs::remove_file(&full)
                    .map_err(|e| MirrorError::io(Some(full.clone()), "remove", e)),
                None => Ok(()),
            };
            if let Err(err) = restored {
                warn!(path = %full.display(), error = %err, "failed to restore file after patch error");
            }
        }
    }
    result
}

/// Apply patch texts to a locked mirror, then optionally add, commit and push.
pub fn apply_patch(
    handle: &MirrorHandle,
    patch_texts: &[String],
    options: &ApplyOptions,
    remote: &str,
) -> MirrorResult<PatchOutcome> {
    if patch_texts.is_empty() {
        return Err(MirrorError::validation("patch", "no patch text supplied"));
    }
    let (changes, stats) = stage_patches(&handle.paths, patch_texts)?;
    materialize(&handle.paths, &changes)?;

    let commit_requested = options.commit || options.push;
    let mut commit = None;
    if options.add || commit_requested {
        handle.git.stage_all()?;
    }
    if commit_requested {
        let message = options
            .commit_message
            .clone()
            .unwrap_or_else(|| "Apply patch".to_string());
        commit = handle.git.commit(&message)?;
    }
    let mut pushed = false;
    if options.push {
        let branch = handle
            .git
            .current_branch()?
            .unwrap_or_else(|| handle.key.git_ref.clone());
        handle.git.push(remote, &branch, true)?;
        pushed = true;
    }

    info!(
        key = %handle.key,
        files = changes.len(),
        hunks = stats.hunks_applied,
        committed = commit.is_some(),
        pushed,
        "patch applied"
    );
    Ok(PatchOutcome {
        files: changes
            .iter()
            .map(|c| FileChange {
                path: c.path.clone(),
                kind: c.kind,
            })
            .collect(),
        stats,
        commit,
        pushed,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    fn single(diff: &str) -> FilePatch {
        ParsedPatch::from_diff(diff).unwrap().files.remove(0)
    }

    #[test]
    fn applies_with_offset() {
        let original = "extra\na\nb\nc\n";
        let patch = single("--- a/f\n+++ b/f\n@@ -1,3 +1,3 @@\n a\n-b\n+B\n c\n");
        assert_eq!(apply_to_text(original, &patch).unwrap(), "extra\na\nB\nc\n");
    }

    #[test]
    fn mismatch_is_apply_failure() {
        let patch = single("--- a/f\n+++ b/f\n@@ -1,2 +1,2 @@\n a\n-zzz\n+y\n");
        let err = apply_to_text("a\nb\n", &patch).unwrap_err();
        assert_eq!(err.error_code(), "E_APPLY");
    }

    #[test]
    fn newline_at_eof_markers() {
        let add_newline =
            single("--- a/f\n+++ b/f\n@@ -1 +1 @@\n-x\n\\ No newline at end of file\n+x\n");
        assert_eq!(apply_to_text("x", &add_newline).unwrap(), "x\n");

        let drop_newline =
            single("--- a/f\n+++ b/f\n@@ -1 +1 @@\n-x\n+x\n\\ No newline at end of file\n");
        assert_eq!(apply_to_text("x\n", &drop_newline).unwrap(), "x");
    }

    #[test]
    fn failing_second_file_writes_nothing() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("a.txt"), "one\n").unwrap();
        fs::write(dir.path().join("b.txt"), "two\n").unwrap();
        let paths = MirrorPaths::new(dir.path()).unwrap();

        let diff = "--- a/a.txt\n+++ b/a.txt\n@@ -1 +1 @@\n-one\n+ONE\n--- a/b.txt\n+++ b/b.txt\n@@ -1 +1 @@\n-nope\n+TWO\n";
        assert!(stage_patches(&paths, &[diff.to_string()]).is_err());
        assert_eq!(fs::read_to_string(dir.path().join("a.txt")).unwrap(), "one\n");
    }

    #[test]
    fn create_modify_delete_rename() {
        let dir = tempdir().unwrap();
        fs::write(dir.path().join("old.txt"), "keep\n").unwrap();
        fs::write(dir.path().join("gone.txt"), "bye\n").unwrap();
        let paths = MirrorPaths::new(dir.path()).unwrap();

        let diff = concat!(
            "--- /dev/null\n+++ b/dir/new.txt\n@@ -0,0 +1 @@\n+hi\n",
            "--- a/gone.txt\n+++ /dev/null\n@@ -1 +0,0 @@\n-bye\n",
            "diff --git a/old.txt b/moved.txt\nrename from old.txt\nrename to moved.txt\n",
        );
        let (changes, stats) = stage_patches(&paths, &[diff.to_string()]).unwrap();
        assert_eq!(stats.files_created, 1);
        assert_eq!(stats.files_deleted, 1);
        materialize(&paths, &changes).unwrap();

        assert_eq!(fs::read_to_string(dir.path().join("dir/new.txt")).unwrap(), "hi\n");
        assert!(!dir.path().join("gone.txt").exists());
        assert!(!dir.path().join("old.txt").exists());
        assert_eq!(fs::read_to_string(dir.path().join("moved.txt")).unwrap(), "keep\n");
    }

    #[test]
    fn traversal_in_patch_rejected() {
        let dir = tempdir().unwrap();
        let paths = MirrorPaths::new(dir.path()).unwrap();
        let diff = "--- /dev/null\n+++ b/../evil.txt\n@@ -0,0 +1 @@\n+x\n";
        let err = stage_patches(&paths, &[diff.to_string()]).unwrap_err();
        assert!(err.is_validation());
    }
}
