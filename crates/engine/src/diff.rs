use serde::{Deserialize, Serialize};
use similar::{ChangeTag, TextDiff};

use crate::config::DiffConfig;
use crate::errors::{MirrorError, MirrorResult};
use crate::lifecycle::MirrorHandle;

/// One side of a diff.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum DiffSource {
    Text { text: String },
    /// Mirror-relative path at the current checkout
    Path { path: String },
    /// Mirror-relative path at a git revision; the checkout is not touched
    PathAtRev { path: String, rev: String },
}

impl DiffSource {
    fn path(&self) -> Option<&str> {
        match self {
            DiffSource::Text { .. } => None,
            DiffSource::Path { path } | DiffSource::PathAtRev { path, .. } => Some(path),
        }
    }

    fn needs_mirror(&self) -> bool {
        !matches!(self, DiffSource::Text { .. })
    }

    fn resolve(&self, mirror: Option<&MirrorHandle>) -> MirrorResult<String> {
        let require = || {
            mirror.ok_or_else(|| {
                MirrorError::validation("source", "path sources need a repository mirror")
            })
        };
        match self {
            DiffSource::Text { text } => Ok(text.clone()),
            DiffSource::Path { path } => {
                let handle = require()?;
                let full = handle.paths.resolve(path)?;
                // Whole-file read so a concurrent writer's rename is never seen half-done.
                std::fs::read(&full)
                    .map(|bytes| String::from_utf8_lossy(&bytes).into_owned())
                    .map_err(|e| match e.kind() {
                        std::io::ErrorKind::NotFound => {
                            MirrorError::validation("path", format!("'{}' does not exist", path))
                        }
                        _ => MirrorError::io(Some(full), "read diff source", e),
                    })
            }
            DiffSource::PathAtRev { path, rev } => {
                let handle = require()?;
                crate::path_security::validate_relative(path)?;
                handle.git.show_file(rev, path)
            }
        }
    }
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize)]
pub struct DiffLimits {
    pub context_lines: usize,
    pub max_chars_per_side: usize,
    pub max_diff_chars: usize,
}

impl From<&DiffConfig> for DiffLimits {
    fn from(config: &DiffConfig) -> Self {
        Self {
            context_lines: config.context_lines,
            max_chars_per_side: config.max_chars_per_side,
            max_diff_chars: config.max_diff_chars,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct DiffResult {
    pub diff: String,
    pub identical: bool,
    pub added: usize,
    pub removed: usize,
    /// Set when any side or the diff itself was cut to its budget
    pub truncated: bool,
    pub left_truncated: bool,
    pub right_truncated: bool,
    pub diff_truncated: bool,
}

fn truncate_chars(text: &mut String, max_chars: usize) -> bool {
    match text.char_indices().nth(max_chars) {
        Some((byte, _)) => {
            text.truncate(byte);
            true
        }
        None => false,
    }
}

/// Unified diff of two texts with `---`/`+++`/`@@` headers.
pub fn unified_diff(
    before: &str,
    after: &str,
    before_label: &str,
    after_label: &str,
    context_lines: usize,
) -> String {
    TextDiff::from_lines(before, after)
        .unified_diff()
        .context_radius(context_lines)
        .header(before_label, after_label)
        .to_string()
}

/// Compare two sources. Path labels come from the sources; `label` names
/// literal text sides.
pub fn compare(
    mirror: Option<&MirrorHandle>,
    left: &DiffSource,
    right: &DiffSource,
    label: Option<&str>,
    limits: DiffLimits,
) -> MirrorResult<DiffResult> {
    if (left.needs_mirror() || right.needs_mirror()) && mirror.is_none() {
        return Err(MirrorError::validation(
            "source",
            "path sources need a repository mirror",
        ));
    }
    let mut before = left.resolve(mirror)?;
    let mut after = right.resolve(mirror)?;
    let left_truncated = truncate_chars(&mut before, limits.max_chars_per_side);
    let right_truncated = truncate_chars(&mut after, limits.max_chars_per_side);

    let fallback = label.unwrap_or("file");
    let before_label = format!("a/{}", left.path().or(right.path()).unwrap_or(fallback));
    let after_label = format!("b/{}", right.path().or(left.path()).unwrap_or(fallback));

    let text_diff = TextDiff::from_lines(&before, &after);
    let (mut added, mut removed) = (0, 0);
    for change in text_diff.iter_all_changes() {
        match change.tag() {
            ChangeTag::Insert => added += 1,
            ChangeTag::Delete => removed += 1,
            ChangeTag::Equal => {}
        }
    }
    let mut diff = text_diff
        .unified_diff()
        .context_radius(limits.context_lines)
        .header(&before_label, &after_label)
        .to_string();
    let diff_truncated = truncate_chars(&mut diff, limits.max_diff_chars);

    Ok(DiffResult {
        identical: added == 0 && removed == 0,
        diff,
        added,
        removed,
        truncated: left_truncated || right_truncated || diff_truncated,
        left_truncated,
        right_truncated,
        diff_truncated,
    })
}

/// `compare` for the common before/after case.
pub fn make_diff(
    mirror: Option<&MirrorHandle>,
    before: &DiffSource,
    after: &DiffSource,
    label: Option<&str>,
    limits: DiffLimits,
) -> MirrorResult<DiffResult> {
    compare(mirror, before, after, label, limits)
}
