//! # Batch Operation Executor
//!
//! Applies an ordered list of [`EditOperation`]s to one mirror as a single
//! logical unit.
//!
//! A batch moves through `Planned -> Applying -> {Committed, RolledBack,
//! PartiallyApplied}`. Every operation is validated before the first
//! mutation. While applying, each touched path has its pre-image recorded in
//! a journal; replaying the journal backwards restores the tree byte for
//! byte. Each operation is individually atomic: a failing operation undoes
//! its own partial effects before the batch decides what to do next.
//!
//! Preview batches run the same code against an in-memory overlay so later
//! operations observe earlier ones without the filesystem being touched.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{debug, info, warn};
use walkdir::WalkDir;

use crate::config::CoreConfig;
use crate::diff::unified_diff;
use crate::errors::{MirrorError, MirrorResult};
use crate::lifecycle::MirrorHandle;
use crate::patch::stage_patches_over;
use crate::path_security::MirrorPaths;
use crate::text::{self, LineOp, MatchOptions, Occurrence, Position};
use mirrorkit_common::{write_atomic, SafeFileWriter, WriteMode};

fn default_true() -> bool {
    true
}

fn default_start_line() -> usize {
    1
}

fn default_max_lines() -> usize {
    200
}

/// One patch text or several.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PatchInput {
    One(String),
    Many(Vec<String>),
}

impl PatchInput {
    pub fn texts(&self) -> Vec<String> {
        match self {
            PatchInput::One(text) => vec![text.clone()],
            PatchInput::Many(texts) => texts.clone(),
        }
    }
}

/// A single requested mutation (or, for `ReadSections`, an inspection).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum EditOperation {
    WriteFile {
        path: String,
        content: String,
        #[serde(default)]
        mode: WriteMode,
    },
    ReplaceText {
        path: String,
        old: String,
        new: String,
        #[serde(default)]
        occurrence: Option<usize>,
        #[serde(default)]
        replace_all: bool,
        #[serde(default = "default_true")]
        case_sensitive: bool,
        #[serde(default)]
        whole_word: bool,
    },
    /// Replace the half-open range `start..end`
    EditRange {
        path: String,
        start: Position,
        end: Position,
        #[serde(default)]
        text: String,
    },
    EditLine {
        path: String,
        line: usize,
        operation: LineOp,
        #[serde(default)]
        text: String,
    },
    /// Inclusive line span; `end_line` defaults to `start_line`
    DeleteLines {
        path: String,
        start_line: usize,
        #[serde(default)]
        end_line: Option<usize>,
    },
    DeleteWord {
        path: String,
        word: String,
        #[serde(default)]
        occurrence: Option<usize>,
        #[serde(default)]
        replace_all: bool,
        #[serde(default = "default_true")]
        case_sensitive: bool,
        #[serde(default)]
        whole_word: bool,
    },
    DeleteChars {
        path: String,
        line: usize,
        col: usize,
        count: usize,
    },
    /// Files, or directories together with their contents
    DeletePath { path: String },
    MakeDirectory { path: String },
    RemoveDirectory {
        path: String,
        #[serde(default)]
        recursive: bool,
    },
    Move {
        from: String,
        to: String,
        #[serde(default)]
        overwrite: bool,
    },
    ApplyPatch {
        #[serde(alias = "patches")]
        patch: PatchInput,
    },
    ReadSections {
        path: String,
        #[serde(default = "default_start_line")]
        start_line: usize,
        #[serde(default = "default_max_lines")]
        max_lines: usize,
    },
}

/// Operation tags accepted in a batch payload.
pub const OPERATION_KINDS: &[&str] = &[
    "write_file",
    "replace_text",
    "edit_range",
    "edit_line",
    "delete_lines",
    "delete_word",
    "delete_chars",
    "delete_path",
    "make_directory",
    "remove_directory",
    "move",
    "apply_patch",
    "read_sections",
];

impl EditOperation {
    pub fn kind(&self) -> &'static str {
        match self {
            EditOperation::WriteFile { .. } => "write_file",
            EditOperation::ReplaceText { .. } => "replace_text",
            EditOperation::EditRange { .. } => "edit_range",
            EditOperation::EditLine { .. } => "edit_line",
            EditOperation::DeleteLines { .. } => "delete_lines",
            EditOperation::DeleteWord { .. } => "delete_word",
            EditOperation::DeleteChars { .. } => "delete_chars",
            EditOperation::DeletePath { .. } => "delete_path",
            EditOperation::MakeDirectory { .. } => "make_directory",
            EditOperation::RemoveDirectory { .. } => "remove_directory",
            EditOperation::Move { .. } => "move",
            EditOperation::ApplyPatch { .. } => "apply_patch",
            EditOperation::ReadSections { .. } => "read_sections",
        }
    }

    pub fn is_mutating(&self) -> bool {
        !matches!(self, EditOperation::ReadSections { .. })
    }

    /// Primary path, for reporting.
    pub fn path(&self) -> Option<&str> {
        match self {
            EditOperation::WriteFile { path, .. }
            | EditOperation::ReplaceText { path, .. }
            | EditOperation::EditRange { path, .. }
            | EditOperation::EditLine { path, .. }
            | EditOperation::DeleteLines { path, .. }
            | EditOperation::DeleteWord { path, .. }
            | EditOperation::DeleteChars { path, .. }
            | EditOperation::DeletePath { path }
            | EditOperation::MakeDirectory { path }
            | EditOperation::RemoveDirectory { path, .. }
            | EditOperation::ReadSections { path, .. } => Some(path),
            EditOperation::Move { from, .. } => Some(from),
            EditOperation::ApplyPatch { .. } => None,
        }
    }
}

/// Decode a loosely-typed operation list. Unknown or malformed entries are
/// rejected here, before anything runs.
pub fn parse_operations(values: &[Value]) -> MirrorResult<Vec<EditOperation>> {
    values
        .iter()
        .enumerate()
        .map(|(index, value)| {
            let field = format!("operations[{}]", index);
            let kind = value.get("op").and_then(Value::as_str).ok_or_else(|| {
                MirrorError::validation(&field, "missing string field 'op'").at_operation(index)
            })?;
            if !OPERATION_KINDS.contains(&kind) {
                return Err(MirrorError::validation(
                    &field,
                    format!(
                        "unknown operation '{}' (expected one of: {})",
                        kind,
                        OPERATION_KINDS.join(", ")
                    ),
                )
                .at_operation(index));
            }
            serde_json::from_value(value.clone())
                .map_err(|e| MirrorError::validation(&field, e.to_string()).at_operation(index))
        })
        .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BatchPlan {
    pub operations: Vec<EditOperation>,
    #[serde(default = "default_true")]
    pub fail_fast: bool,
    #[serde(default = "default_true")]
    pub rollback_on_error: bool,
    #[serde(default)]
    pub preview_only: bool,
    #[serde(default = "default_true")]
    pub create_parents: bool,
    #[serde(default)]
    pub include_summary: bool,
}

impl Default for BatchPlan {
    fn default() -> Self {
        Self {
            operations: Vec::new(),
            fail_fast: true,
            rollback_on_error: true,
            preview_only: false,
            create_parents: true,
            include_summary: false,
        }
    }
}

impl BatchPlan {
    pub fn new(operations: Vec<EditOperation>) -> Self {
        Self {
            operations,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchState {
    Planned,
    Applying,
    Committed,
    RolledBack,
    PartiallyApplied,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum BatchStatus {
    Success,
    Partial,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum OperationStatus {
    Applied,
    Skipped,
    Failed,
}

#[derive(Debug, Clone, Serialize)]
pub struct OperationError {
    pub code: &'static str,
    pub message: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub hints: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct OperationOutcome {
    pub index: usize,
    pub op: &'static str,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    pub status: OperationStatus,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    /// Would-be effect, reported in preview mode
    #[serde(skip_serializing_if = "Option::is_none")]
    pub diff: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<OperationError>,
}

impl OperationOutcome {
    fn new(index: usize, op: &EditOperation, status: OperationStatus) -> Self {
        Self {
            index,
            op: op.kind(),
            path: op.path().map(str::to_string),
            status,
            description: None,
            diff: None,
            output: None,
            error: None,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct BatchSummary {
    pub created: usize,
    pub updated: usize,
    pub deleted: usize,
}

#[derive(Debug, Serialize)]
pub struct BatchResult {
    pub status: BatchStatus,
    pub state: BatchState,
    pub preview: bool,
    pub operations: Vec<OperationOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub summary: Option<BatchSummary>,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub rollback_errors: Vec<String>,
    #[serde(skip)]
    failure: Option<MirrorError>,
}

impl BatchResult {
    pub fn is_success(&self) -> bool {
        self.status == BatchStatus::Success
    }

    /// First operation error, carrying its operation index.
    pub fn failure(&self) -> Option<&MirrorError> {
        self.failure.as_ref()
    }

    pub fn take_failure(&mut self) -> Option<MirrorError> {
        self.failure.take()
    }
}

#[derive(Debug)]
enum Entry {
    Dir,
    File {
        bytes: Vec<u8>,
        permissions: fs::Permissions,
    },
    Symlink(PathBuf),
}

#[derive(Debug)]
enum Snapshot {
    Missing,
    Entry(Entry),
    /// Whole subtree, parents before children
    Tree(Vec<(PathBuf, Entry)>),
}

#[derive(Debug)]
enum Undo {
    Restore { path: PathBuf, snapshot: Snapshot },
    Rename { from: PathBuf, to: PathBuf },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Missing,
    File,
    Dir,
}

fn read_entry(path: &Path, meta: &fs::Metadata) -> io::Result<Entry> {
    let file_type = meta.file_type();
    if file_type.is_symlink() {
        Ok(Entry::Symlink(fs::read_link(path)?))
    } else if file_type.is_dir() {
        Ok(Entry::Dir)
    } else {
        Ok(Entry::File {
            bytes: fs::read(path)?,
            permissions: meta.permissions(),
        })
    }
}

fn capture(full: &Path, deep: bool) -> MirrorResult<Snapshot> {
    let meta = match fs::symlink_metadata(full) {
        Ok(meta) => meta,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Snapshot::Missing),
        Err(e) => return Err(MirrorError::io(Some(full.to_path_buf()), "snapshot path", e)),
    };
    if !(deep && meta.is_dir()) {
        return read_entry(full, &meta)
            .map(Snapshot::Entry)
            .map_err(|e| MirrorError::io(Some(full.to_path_buf()), "snapshot path", e));
    }

    let mut entries = Vec::new();
    for item in WalkDir::new(full).follow_links(false) {
        let item = item.map_err(|e| {
            MirrorError::io(Some(full.to_path_buf()), "snapshot directory", e.into())
        })?;
        let relative = item
            .path()
            .strip_prefix(full)
            .map(Path::to_path_buf)
            .unwrap_or_default();
        let entry = item
            .metadata()
            .map_err(io::Error::from)
            .and_then(|meta| read_entry(item.path(), &meta))
            .map_err(|e| MirrorError::io(Some(item.path().to_path_buf()), "snapshot entry", e))?;
        entries.push((relative, entry));
    }
    Ok(Snapshot::Tree(entries))
}

fn tree_size(full: &Path) -> u64 {
    WalkDir::new(full)
        .follow_links(false)
        .into_iter()
        .filter_map(Result::ok)
        .filter_map(|entry| entry.metadata().ok())
        .filter(|meta| meta.is_file())
        .map(|meta| meta.len())
        .sum()
}

fn clear(full: &Path) -> io::Result<()> {
    match fs::symlink_metadata(full) {
        Ok(meta) if meta.is_dir() => fs::remove_dir_all(full),
        Ok(_) => fs::remove_file(full),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(()),
        Err(e) => Err(e),
    }
}

#[cfg(unix)]
fn restore_symlink(target: &Path, full: &Path) -> io::Result<()> {
    std::os::unix::fs::symlink(target, full)
}

#[cfg(not(unix))]
fn restore_symlink(_target: &Path, _full: &Path) -> io::Result<()> {
    Err(io::Error::new(
        io::ErrorKind::Unsupported,
        "symlinks cannot be restored on this platform",
    ))
}

fn write_entry(full: &Path, entry: &Entry) -> MirrorResult<()> {
    let io_err = |e| MirrorError::io(Some(full.to_path_buf()), "restore entry", e);
    match entry {
        Entry::Dir => fs::create_dir_all(full).map_err(io_err),
        Entry::File { bytes, permissions } => {
            if let Some(parent) = full.parent() {
                fs::create_dir_all(parent).map_err(io_err)?;
            }
            write_atomic(full, bytes)?;
            fs::set_permissions(full, permissions.clone()).map_err(io_err)
        }
        Entry::Symlink(target) => restore_symlink(target, full).map_err(io_err),
    }
}

fn restore(full: &Path, snapshot: &Snapshot) -> MirrorResult<()> {
    let io_err = |e| MirrorError::io(Some(full.to_path_buf()), "restore path", e);
    match snapshot {
        Snapshot::Missing => clear(full).map_err(io_err),
        Snapshot::Entry(Entry::Dir) if full.is_dir() => Ok(()),
        Snapshot::Entry(entry) => {
            clear(full).map_err(io_err)?;
            write_entry(full, entry)
        }
        Snapshot::Tree(entries) => {
            clear(full).map_err(io_err)?;
            for (relative, entry) in entries {
                let target = if relative.as_os_str().is_empty() {
                    full.to_path_buf()
                } else {
                    full.join(relative)
                };
                write_entry(&target, entry)?;
            }
            Ok(())
        }
    }
}

fn check_position(field: &str, pos: Position) -> MirrorResult<()> {
    if pos.line == 0 || pos.col == 0 {
        return Err(MirrorError::validation(
            field,
            "line and col are 1-indexed",
        ));
    }
    Ok(())
}

fn check_occurrence(occurrence: Option<usize>) -> MirrorResult<()> {
    if occurrence == Some(0) {
        return Err(MirrorError::validation(
            "occurrence",
            "occurrence is 1-indexed",
        ));
    }
    Ok(())
}

#[derive(Debug, Clone)]
struct Target {
    rel: String,
    full: PathBuf,
}

/// In-memory view of preview mutations.
#[derive(Debug, Clone, Default)]
struct Overlay {
    /// `None` marks a deleted file
    files: BTreeMap<String, Option<String>>,
    /// `false` marks a removed directory
    dirs: BTreeMap<String, bool>,
}

impl Overlay {
    fn remove_tree(&mut self, rel: &str) {
        let prefix = format!("{}/", rel);
        for (path, content) in self.files.iter_mut() {
            if path.starts_with(&prefix) {
                *content = None;
            }
        }
        for (path, present) in self.dirs.iter_mut() {
            if path.starts_with(&prefix) {
                *present = false;
            }
        }
        self.dirs.insert(rel.to_string(), false);
        self.files.remove(rel);
    }
}

struct Report {
    description: String,
    diff: Option<String>,
    output: Option<Value>,
}

impl Report {
    fn describe(description: impl Into<String>) -> Self {
        Self {
            description: description.into(),
            diff: None,
            output: None,
        }
    }
}

/// Mutable state of one batch run.
struct Session<'a> {
    paths: &'a MirrorPaths,
    writer: SafeFileWriter,
    preview: bool,
    create_parents: bool,
    context_lines: usize,
    overlay: Overlay,
    journal: Vec<Undo>,
    summary: BatchSummary,
    // Set while rollback is on; bounds each recursive snapshot.
    snapshot_budget: Option<u64>,
}

impl<'a> Session<'a> {
    fn target(&self, raw: &str) -> MirrorResult<Target> {
        let full = self.paths.resolve(raw.trim_end_matches('/'))?;
        let rel = self
            .paths
            .relative(&full)
            .filter(|rel| !rel.is_empty() && rel != ".")
            .ok_or_else(|| {
                MirrorError::validation("path", "operation cannot target the mirror root")
            })?;
        Ok(Target { rel, full })
    }

    fn parent_of(&self, t: &Target) -> MirrorResult<Option<Target>> {
        match Path::new(&t.rel).parent() {
            Some(parent) if !parent.as_os_str().is_empty() => {
                self.target(&parent.to_string_lossy()).map(Some)
            }
            _ => Ok(None),
        }
    }

    fn kind_of(&self, t: &Target) -> Kind {
        if self.preview {
            if self.overlay.dirs.get(&t.rel) == Some(&true) {
                return Kind::Dir;
            }
            match self.overlay.files.get(&t.rel) {
                Some(Some(_)) => return Kind::File,
                Some(None) => return Kind::Missing,
                None => {}
            }
            let removed_above = Path::new(&t.rel)
                .ancestors()
                .any(|a| self.overlay.dirs.get(&*a.to_string_lossy()) == Some(&false));
            if removed_above {
                return Kind::Missing;
            }
            let prefix = format!("{}/", t.rel);
            let implied_by_file = self
                .overlay
                .files
                .iter()
                .any(|(path, content)| content.is_some() && path.starts_with(&prefix));
            let implied_by_dir = self
                .overlay
                .dirs
                .iter()
                .any(|(path, present)| *present && path.starts_with(&prefix));
            if implied_by_file || implied_by_dir {
                return Kind::Dir;
            }
        }
        match fs::symlink_metadata(&t.full) {
            Ok(meta) if meta.is_dir() => Kind::Dir,
            Ok(_) => Kind::File,
            Err(_) => Kind::Missing,
        }
    }

    fn read_text(&self, t: &Target) -> MirrorResult<Option<String>> {
        match self.kind_of(t) {
            Kind::Missing => return Ok(None),
            Kind::Dir => {
                return Err(MirrorError::apply(Some(&t.rel), "path is a directory"));
            }
            Kind::File => {}
        }
        if self.preview {
            if let Some(Some(content)) = self.overlay.files.get(&t.rel) {
                return Ok(Some(content.clone()));
            }
        }
        let bytes =
            fs::read(&t.full).map_err(|e| MirrorError::io(Some(t.full.clone()), "read file", e))?;
        String::from_utf8(bytes)
            .map(Some)
            .map_err(|_| MirrorError::validation("path", format!("'{}' is not UTF-8 text", t.rel)))
    }

    fn require_text(&self, t: &Target) -> MirrorResult<String> {
        self.read_text(t)?
            .ok_or_else(|| MirrorError::apply(Some(&t.rel), "file does not exist"))
    }

    fn record(&mut self, full: &Path, deep: bool) -> MirrorResult<()> {
        let snapshot = capture(full, deep)?;
        self.journal.push(Undo::Restore {
            path: full.to_path_buf(),
            snapshot,
        });
        Ok(())
    }

    /// Make sure the parent directory of `t` exists, creating it when allowed.
    fn prepare_parent(&mut self, t: &Target) -> MirrorResult<()> {
        let Some(parent) = self.parent_of(t)? else {
            return Ok(());
        };
        match self.kind_of(&parent) {
            Kind::Dir => return Ok(()),
            Kind::File => {
                return Err(MirrorError::apply(
                    Some(&t.rel),
                    format!("parent '{}' is not a directory", parent.rel),
                ))
            }
            Kind::Missing if !self.create_parents => {
                return Err(MirrorError::apply(
                    Some(&t.rel),
                    format!("parent directory '{}' does not exist", parent.rel),
                ))
            }
            Kind::Missing => {}
        }
        if self.preview {
            self.overlay.dirs.insert(parent.rel.clone(), true);
            return Ok(());
        }

        // Journal only the topmost missing ancestor; removing it on rollback
        // removes everything created below it.
        let mut topmost = parent.full.clone();
        while let Some(up) = topmost.parent() {
            if up.exists() || !up.starts_with(self.paths.root()) {
                break;
            }
            topmost = up.to_path_buf();
        }
        self.journal.push(Undo::Restore {
            path: topmost,
            snapshot: Snapshot::Missing,
        });
        fs::create_dir_all(&parent.full)
            .map_err(|e| MirrorError::io(Some(parent.full.clone()), "create parent directories", e))
    }

    fn write_file(&mut self, t: &Target, content: &str, mode: WriteMode) -> MirrorResult<()> {
        let kind = self.kind_of(t);
        match kind {
            Kind::Dir => return Err(MirrorError::apply(Some(&t.rel), "path is a directory")),
            Kind::File if mode == WriteMode::CreateNew => {
                return Err(MirrorError::apply(Some(&t.rel), "file already exists"))
            }
            _ => {}
        }
        self.prepare_parent(t)?;
        if kind == Kind::File {
            self.summary.updated += 1;
        } else {
            self.summary.created += 1;
        }

        if self.preview {
            self.overlay
                .files
                .insert(t.rel.clone(), Some(content.to_string()));
            return Ok(());
        }
        self.record(&t.full, false)?;
        self.writer
            .write(&t.full, content.as_bytes(), mode)
            .map_err(|e| MirrorError::apply(Some(&t.rel), e.to_string()))?;
        Ok(())
    }

    fn remove_file(&mut self, t: &Target) -> MirrorResult<()> {
        match self.kind_of(t) {
            Kind::Missing => return Err(MirrorError::apply(Some(&t.rel), "file does not exist")),
            Kind::Dir => return Err(MirrorError::apply(Some(&t.rel), "path is a directory")),
            Kind::File => {}
        }
        self.summary.deleted += 1;
        if self.preview {
            self.overlay.files.insert(t.rel.clone(), None);
            return Ok(());
        }
        self.record(&t.full, false)?;
        fs::remove_file(&t.full).map_err(|e| MirrorError::io(Some(t.full.clone()), "delete file", e))
    }

    /// Returns false when the directory already existed.
    fn make_dir(&mut self, t: &Target) -> MirrorResult<bool> {
        match self.kind_of(t) {
            Kind::Dir => return Ok(false),
            Kind::File => {
                return Err(MirrorError::apply(
                    Some(&t.rel),
                    "a file already exists at this path",
                ))
            }
            Kind::Missing => {}
        }
        self.prepare_parent(t)?;
        self.summary.created += 1;
        if self.preview {
            self.overlay.dirs.insert(t.rel.clone(), true);
            return Ok(true);
        }
        self.journal.push(Undo::Restore {
            path: t.full.clone(),
            snapshot: Snapshot::Missing,
        });
        fs::create_dir(&t.full)
            .map_err(|e| MirrorError::io(Some(t.full.clone()), "create directory", e))?;
        Ok(true)
    }

    fn dir_is_empty(&self, t: &Target) -> MirrorResult<bool> {
        if self.preview {
            let prefix = format!("{}/", t.rel);
            let staged = self
                .overlay
                .files
                .iter()
                .any(|(path, content)| content.is_some() && path.starts_with(&prefix));
            if staged {
                return Ok(false);
            }
        }
        if !t.full.is_dir() {
            return Ok(true);
        }
        let mut entries = fs::read_dir(&t.full)
            .map_err(|e| MirrorError::io(Some(t.full.clone()), "list directory", e))?;
        Ok(entries.next().is_none())
    }

    fn remove_dir(&mut self, t: &Target, recursive: bool) -> MirrorResult<()> {
        match self.kind_of(t) {
            Kind::Missing => {
                return Err(MirrorError::apply(Some(&t.rel), "directory does not exist"))
            }
            Kind::File => return Err(MirrorError::apply(Some(&t.rel), "path is not a directory")),
            Kind::Dir => {}
        }
        if !recursive && !self.dir_is_empty(t)? {
            return Err(MirrorError::apply(
                Some(&t.rel),
                "directory is not empty (set recursive to remove its contents)",
            ));
        }
        self.summary.deleted += 1;
        if self.preview {
            self.overlay.remove_tree(&t.rel);
            return Ok(());
        }
        if recursive {
            // Earlier operations in the batch may have grown the tree since
            // validation measured it.
            if let Some(budget) = self.snapshot_budget {
                let size = tree_size(&t.full);
                if size > budget {
                    return Err(MirrorError::apply(
                        Some(&t.rel),
                        format!(
                            "'{}' now holds {} bytes, over the {} byte rollback snapshot budget",
                            t.rel, size, budget
                        ),
                    ));
                }
            }
        }
        self.record(&t.full, recursive)?;
        let removed = if recursive {
            fs::remove_dir_all(&t.full)
        } else {
            fs::remove_dir(&t.full)
        };
        removed.map_err(|e| MirrorError::io(Some(t.full.clone()), "remove directory", e))
    }

    fn move_path(&mut self, from: &Target, to: &Target, overwrite: bool) -> MirrorResult<()> {
        let from_kind = self.kind_of(from);
        if from_kind == Kind::Missing {
            return Err(MirrorError::apply(Some(&from.rel), "source does not exist"));
        }
        let to_kind = self.kind_of(to);
        match to_kind {
            Kind::Dir => {
                return Err(MirrorError::apply(
                    Some(&to.rel),
                    "destination is an existing directory",
                ))
            }
            Kind::File if !overwrite => {
                return Err(MirrorError::apply(
                    Some(&to.rel),
                    "destination exists (set overwrite to replace it)",
                ))
            }
            Kind::File if from_kind == Kind::Dir => {
                return Err(MirrorError::apply(
                    Some(&to.rel),
                    "cannot replace a file with a directory",
                ))
            }
            _ => {}
        }
        self.prepare_parent(to)?;
        self.summary.deleted += 1;
        if to_kind == Kind::File {
            self.summary.updated += 1;
        } else {
            self.summary.created += 1;
        }

        if self.preview {
            match from_kind {
                Kind::File => {
                    let content = self.read_text(from).ok().flatten().unwrap_or_default();
                    self.overlay.files.insert(to.rel.clone(), Some(content));
                    self.overlay.files.insert(from.rel.clone(), None);
                }
                _ => {
                    self.overlay.dirs.insert(to.rel.clone(), true);
                    self.overlay.remove_tree(&from.rel);
                }
            }
            return Ok(());
        }

        self.record(&to.full, false)?;
        fs::rename(&from.full, &to.full)
            .map_err(|e| MirrorError::io(Some(from.full.clone()), "move path", e))?;
        self.journal.push(Undo::Rename {
            from: from.full.clone(),
            to: to.full.clone(),
        });
        Ok(())
    }

    fn diff_for(&self, rel: &str, before: &str, after: &str) -> Option<String> {
        self.preview.then(|| {
            unified_diff(
                before,
                after,
                &format!("a/{}", rel),
                &format!("b/{}", rel),
                self.context_lines,
            )
        })
    }

    /// Read, transform and rewrite one file.
    fn edit_text<F>(&mut self, raw: &str, edit: F) -> MirrorResult<(Target, Option<String>)>
    where
        F: FnOnce(&str) -> MirrorResult<String>,
    {
        let t = self.target(raw)?;
        let before = self.require_text(&t)?;
        let after = edit(&before)?;
        self.write_file(&t, &after, WriteMode::Overwrite)?;
        let diff = self.diff_for(&t.rel, &before, &after);
        Ok((t, diff))
    }

    fn validate(&self, op: &EditOperation, plan: &BatchPlan, budget: u64) -> MirrorResult<()> {
        match op {
            EditOperation::WriteFile { path, .. } | EditOperation::MakeDirectory { path } => {
                self.target(path)?;
            }
            EditOperation::ReplaceText {
                path,
                old,
                occurrence,
                ..
            } => {
                self.target(path)?;
                if old.is_empty() {
                    return Err(MirrorError::validation("old", "search text cannot be empty"));
                }
                check_occurrence(*occurrence)?;
            }
            EditOperation::DeleteWord {
                path,
                word,
                occurrence,
                ..
            } => {
                self.target(path)?;
                if word.is_empty() {
                    return Err(MirrorError::validation("word", "word cannot be empty"));
                }
                check_occurrence(*occurrence)?;
            }
            EditOperation::EditRange {
                path, start, end, ..
            } => {
                self.target(path)?;
                check_position("start", *start)?;
                check_position("end", *end)?;
                if (end.line, end.col) < (start.line, start.col) {
                    return Err(MirrorError::validation("end", "end precedes start"));
                }
            }
            EditOperation::EditLine { path, line, .. } => {
                self.target(path)?;
                if *line == 0 {
                    return Err(MirrorError::validation("line", "line is 1-indexed"));
                }
            }
            EditOperation::DeleteLines {
                path,
                start_line,
                end_line,
            } => {
                self.target(path)?;
                if *start_line == 0 {
                    return Err(MirrorError::validation("start_line", "line is 1-indexed"));
                }
                if end_line.is_some_and(|end| end < *start_line) {
                    return Err(MirrorError::validation(
                        "end_line",
                        "end_line precedes start_line",
                    ));
                }
            }
            EditOperation::DeleteChars {
                path,
                line,
                col,
                count,
            } => {
                self.target(path)?;
                check_position("line", Position::new(*line, *col))?;
                if *count == 0 {
                    return Err(MirrorError::validation("count", "count must be at least 1"));
                }
            }
            EditOperation::DeletePath { path } => {
                let t = self.target(path)?;
                self.check_snapshot_budget(&t, plan, budget)?;
            }
            EditOperation::RemoveDirectory { path, recursive } => {
                let t = self.target(path)?;
                if *recursive {
                    self.check_snapshot_budget(&t, plan, budget)?;
                }
            }
            EditOperation::Move { from, to, .. } => {
                let source = self.target(from)?;
                let dest = self.target(to)?;
                if source.rel == dest.rel {
                    return Err(MirrorError::validation("to", "source and destination are the same"));
                }
                if dest.rel.starts_with(&format!("{}/", source.rel)) {
                    return Err(MirrorError::validation(
                        "to",
                        "cannot move a directory inside itself",
                    ));
                }
            }
            EditOperation::ApplyPatch { patch } => {
                let texts = patch.texts();
                if texts.is_empty() || texts.iter().all(|t| t.trim().is_empty()) {
                    return Err(MirrorError::validation("patch", "no patch text supplied"));
                }
                for text in &texts {
                    let parsed = crate::patch_parser::ParsedPatch::from_diff(text)?;
                    for file in &parsed.files {
                        for path in [&file.old_path, &file.new_path].into_iter().flatten() {
                            self.target(path)?;
                        }
                    }
                }
            }
            EditOperation::ReadSections {
                path,
                start_line,
                max_lines,
            } => {
                self.target(path)?;
                if *start_line == 0 || *max_lines == 0 {
                    return Err(MirrorError::validation(
                        "start_line",
                        "start_line and max_lines must be at least 1",
                    ));
                }
            }
        }
        Ok(())
    }

    fn check_snapshot_budget(&self, t: &Target, plan: &BatchPlan, budget: u64) -> MirrorResult<()> {
        if !plan.rollback_on_error || plan.preview_only || !t.full.is_dir() {
            return Ok(());
        }
        let size = tree_size(&t.full);
        if size > budget {
            return Err(MirrorError::validation(
                "path",
                format!(
                    "'{}' holds {} bytes, over the {} byte rollback snapshot budget; \
                     disable rollback_on_error to delete it",
                    t.rel, size, budget
                ),
            ));
        }
        Ok(())
    }

    fn apply(&mut self, op: &EditOperation) -> MirrorResult<Report> {
        match op {
            EditOperation::WriteFile {
                path,
                content,
                mode,
            } => {
                let t = self.target(path)?;
                let before = match self.kind_of(&t) {
                    Kind::File if self.preview => self.read_text(&t).ok().flatten(),
                    _ => None,
                };
                self.write_file(&t, content, *mode)?;
                Ok(Report {
                    description: format!("write {} ({} bytes)", t.rel, content.len()),
                    diff: self.diff_for(&t.rel, before.as_deref().unwrap_or(""), content),
                    output: None,
                })
            }
            EditOperation::ReplaceText {
                path,
                old,
                new,
                occurrence,
                replace_all,
                case_sensitive,
                whole_word,
            } => {
                let options = MatchOptions {
                    case_sensitive: *case_sensitive,
                    whole_word: *whole_word,
                };
                let which = Occurrence::from_params(*occurrence, *replace_all);
                let mut replaced = 0;
                let (t, diff) = self.edit_text(path, |text| {
                    let (out, count) = text::replace_text(text, old, new, which, options)?;
                    replaced = count;
                    Ok(out)
                })?;
                Ok(Report {
                    description: format!("replace {} occurrence(s) in {}", replaced, t.rel),
                    diff,
                    output: Some(serde_json::json!({ "replaced": replaced })),
                })
            }
            EditOperation::EditRange {
                path,
                start,
                end,
                text: replacement,
            } => {
                let (t, diff) = self.edit_text(path, |text| {
                    text::edit_range(text, *start, *end, replacement)
                })?;
                let end_after = text::position_after(*start, replacement);
                Ok(Report {
                    description: format!(
                        "edit {} {}:{}..{}:{}",
                        t.rel, start.line, start.col, end.line, end.col
                    ),
                    diff,
                    output: Some(serde_json::json!({ "end": end_after })),
                })
            }
            EditOperation::EditLine {
                path,
                line,
                operation,
                text: new_text,
            } => {
                let (t, diff) = self.edit_text(path, |text| {
                    text::edit_line(text, *line, *operation, new_text)
                })?;
                Ok(Report {
                    description: format!("{:?} line {} of {}", operation, line, t.rel),
                    diff,
                    output: None,
                })
            }
            EditOperation::DeleteLines {
                path,
                start_line,
                end_line,
            } => {
                let end = end_line.unwrap_or(*start_line);
                let (t, diff) =
                    self.edit_text(path, |text| text::delete_lines(text, *start_line, end))?;
                Ok(Report {
                    description: format!("delete lines {}-{} of {}", start_line, end, t.rel),
                    diff,
                    output: None,
                })
            }
            EditOperation::DeleteWord {
                path,
                word,
                occurrence,
                replace_all,
                case_sensitive,
                whole_word,
            } => {
                let options = MatchOptions {
                    case_sensitive: *case_sensitive,
                    whole_word: *whole_word,
                };
                let which = Occurrence::from_params(*occurrence, *replace_all);
                let mut deleted = 0;
                let (t, diff) = self.edit_text(path, |text| {
                    let (out, count) = text::delete_word(text, word, which, options)?;
                    deleted = count;
                    Ok(out)
                })?;
                Ok(Report {
                    description: format!("delete {} occurrence(s) of '{}' in {}", deleted, word, t.rel),
                    diff,
                    output: Some(serde_json::json!({ "deleted": deleted })),
                })
            }
            EditOperation::DeleteChars {
                path,
                line,
                col,
                count,
            } => {
                let (t, diff) = self.edit_text(path, |text| {
                    text::delete_chars(text, Position::new(*line, *col), *count)
                })?;
                Ok(Report {
                    description: format!("delete {} char(s) at {}:{} in {}", count, line, col, t.rel),
                    diff,
                    output: None,
                })
            }
            EditOperation::DeletePath { path } => {
                let t = self.target(path)?;
                match self.kind_of(&t) {
                    Kind::Dir => {
                        self.remove_dir(&t, true)?;
                        Ok(Report::describe(format!("delete directory {}", t.rel)))
                    }
                    _ => {
                        let before = if self.preview {
                            self.read_text(&t).ok().flatten()
                        } else {
                            None
                        };
                        self.remove_file(&t)?;
                        Ok(Report {
                            description: format!("delete {}", t.rel),
                            diff: before.and_then(|b| self.diff_for(&t.rel, &b, "")),
                            output: None,
                        })
                    }
                }
            }
            EditOperation::MakeDirectory { path } => {
                let t = self.target(path)?;
                let created = self.make_dir(&t)?;
                Ok(Report::describe(if created {
                    format!("create directory {}", t.rel)
                } else {
                    format!("directory {} already exists", t.rel)
                }))
            }
            EditOperation::RemoveDirectory { path, recursive } => {
                let t = self.target(path)?;
                self.remove_dir(&t, *recursive)?;
                Ok(Report::describe(format!(
                    "remove directory {}{}",
                    t.rel,
                    if *recursive { " and its contents" } else { "" }
                )))
            }
            EditOperation::Move {
                from,
                to,
                overwrite,
            } => {
                let source = self.target(from)?;
                let dest = self.target(to)?;
                self.move_path(&source, &dest, *overwrite)?;
                Ok(Report::describe(format!("move {} -> {}", source.rel, dest.rel)))
            }
            EditOperation::ApplyPatch { patch } => self.apply_patch(&patch.texts()),
            EditOperation::ReadSections {
                path,
                start_line,
                max_lines,
            } => {
                let t = self.target(path)?;
                let content = self.require_text(&t)?;
                let section = text::read_sections(&content, *start_line, *max_lines)?;
                let description = format!(
                    "read lines {}-{} of {} from {}",
                    section.start_line, section.end_line, section.total_lines, t.rel
                );
                let output = serde_json::to_value(&section)
                    .map_err(|e| MirrorError::internal(e.to_string()))?;
                Ok(Report {
                    description,
                    diff: None,
                    output: Some(output),
                })
            }
        }
    }

    fn apply_patch(&mut self, texts: &[String]) -> MirrorResult<Report> {
        let (changes, stats) = stage_patches_over(self.paths, texts, |rel| {
            let t = self.target(rel)?;
            self.read_text(&t)
        })?;

        let mut diffs = String::new();
        for change in &changes {
            let t = self.target(&change.path)?;
            let before = if self.preview {
                self.read_text(&t)?.unwrap_or_default()
            } else {
                String::new()
            };
            match &change.content {
                Some(content) => {
                    self.write_file(&t, content, WriteMode::Overwrite)?;
                    if let Some(diff) = self.diff_for(&t.rel, &before, content) {
                        diffs.push_str(&diff);
                    }
                }
                None => {
                    self.remove_file(&t)?;
                    if let Some(diff) = self.diff_for(&t.rel, &before, "") {
                        diffs.push_str(&diff);
                    }
                }
            }
        }

        Ok(Report {
            description: format!(
                "apply patch: {} file(s), {} hunk(s), +{} -{}",
                changes.len(),
                stats.hunks_applied,
                stats.lines_added,
                stats.lines_removed
            ),
            diff: self.preview.then_some(diffs),
            output: serde_json::to_value(&stats).ok(),
        })
    }

    /// Undo journal entries newer than `mark`, newest first.
    fn rollback_to(&mut self, mark: usize) -> Vec<String> {
        let mut errors = Vec::new();
        while self.journal.len() > mark {
            let Some(undo) = self.journal.pop() else {
                break;
            };
            let result = match &undo {
                Undo::Restore { path, snapshot } => restore(path, snapshot),
                Undo::Rename { from, to } => fs::rename(to, from)
                    .map_err(|e| MirrorError::io(Some(to.clone()), "undo move", e)),
            };
            if let Err(err) = result {
                warn!(error = %err, "rollback step failed");
                errors.push(err.to_string());
            }
        }
        errors
    }
}

/// Runs batch plans against one mirror tree.
pub struct BatchExecutor<'a> {
    paths: &'a MirrorPaths,
    max_snapshot_bytes: u64,
    context_lines: usize,
    max_file_size: Option<usize>,
}

impl<'a> BatchExecutor<'a> {
    pub fn new(paths: &'a MirrorPaths) -> Self {
        Self {
            paths,
            max_snapshot_bytes: crate::config::BatchConfig::default().max_snapshot_bytes,
            context_lines: 3,
            max_file_size: Some(10 * 1024 * 1024),
        }
    }

    pub fn from_config(paths: &'a MirrorPaths, config: &CoreConfig) -> Self {
        Self::new(paths)
            .with_snapshot_budget(config.batch.max_snapshot_bytes)
            .with_context_lines(config.diff.context_lines)
    }

    pub fn with_snapshot_budget(mut self, bytes: u64) -> Self {
        self.max_snapshot_bytes = bytes;
        self
    }

    pub fn with_context_lines(mut self, lines: usize) -> Self {
        self.context_lines = lines;
        self
    }

    pub fn with_max_file_size(mut self, bytes: Option<usize>) -> Self {
        self.max_file_size = bytes;
        self
    }

    fn session(&self, plan: &BatchPlan) -> Session<'a> {
        Session {
            paths: self.paths,
            writer: SafeFileWriter::new(self.paths.root())
                .with_max_size(self.max_file_size)
                .with_create_parents(plan.create_parents),
            preview: plan.preview_only,
            create_parents: plan.create_parents,
            context_lines: self.context_lines,
            overlay: Overlay::default(),
            journal: Vec::new(),
            summary: BatchSummary::default(),
            snapshot_budget: plan.rollback_on_error.then_some(self.max_snapshot_bytes),
        }
    }

    /// Validate every operation without running anything.
    pub fn validate(&self, plan: &BatchPlan) -> MirrorResult<()> {
        if plan.operations.is_empty() {
            return Err(MirrorError::validation("operations", "batch has no operations"));
        }
        let session = self.session(plan);
        for (index, op) in plan.operations.iter().enumerate() {
            session
                .validate(op, plan, self.max_snapshot_bytes)
                .map_err(|e| e.at_operation(index))?;
        }
        Ok(())
    }

    /// Validate then apply `plan`. Validation failures are returned as `Err`
    /// before anything is touched; operation failures are reported in the
    /// result.
    pub fn execute(&self, plan: &BatchPlan) -> MirrorResult<BatchResult> {
        let mut state = BatchState::Planned;
        self.validate(plan)?;
        debug!(
            operations = plan.operations.len(),
            preview = plan.preview_only,
            ?state,
            "batch validated"
        );

        state = BatchState::Applying;
        let mut session = self.session(plan);
        let mut outcomes = Vec::with_capacity(plan.operations.len());
        let mut failure: Option<MirrorError> = None;
        let (mut applied, mut failed) = (0usize, 0usize);

        for (index, op) in plan.operations.iter().enumerate() {
            if failure.is_some() && plan.fail_fast {
                outcomes.push(OperationOutcome::new(index, op, OperationStatus::Skipped));
                continue;
            }

            let mark = session.journal.len();
            let summary = session.summary;
            let overlay = session.preview.then(|| session.overlay.clone());
            match session.apply(op) {
                Ok(report) => {
                    applied += 1;
                    let mut outcome = OperationOutcome::new(index, op, OperationStatus::Applied);
                    outcome.description = Some(report.description);
                    outcome.diff = report.diff;
                    outcome.output = report.output;
                    outcomes.push(outcome);
                }
                Err(err) => {
                    let err = err.at_operation(index);
                    warn!(index, op = op.kind(), error = %err, ?state, "batch operation failed");
                    for message in session.rollback_to(mark) {
                        warn!(index, error = %message, "could not undo failed operation");
                    }
                    session.summary = summary;
                    if let Some(overlay) = overlay {
                        session.overlay = overlay;
                    }

                    failed += 1;
                    let mut outcome = OperationOutcome::new(index, op, OperationStatus::Failed);
                    outcome.error = Some(OperationError {
                        code: err.error_code(),
                        message: err.to_string(),
                        hints: err.recovery_hints(),
                    });
                    outcomes.push(outcome);
                    failure.get_or_insert(err);
                }
            }
        }

        let mut rollback_errors = Vec::new();
        let (state, status) = if failed == 0 {
            (BatchState::Committed, BatchStatus::Success)
        } else if plan.preview_only {
            (BatchState::Committed, BatchStatus::Failed)
        } else if plan.rollback_on_error {
            rollback_errors = session.rollback_to(0);
            if rollback_errors.is_empty() {
                session.summary = BatchSummary::default();
                (BatchState::RolledBack, BatchStatus::Failed)
            } else {
                (BatchState::PartiallyApplied, BatchStatus::Failed)
            }
        } else if applied == 0 {
            (BatchState::PartiallyApplied, BatchStatus::Failed)
        } else {
            (BatchState::PartiallyApplied, BatchStatus::Partial)
        };

        info!(
            ?state,
            ?status,
            applied,
            failed,
            preview = plan.preview_only,
            "batch finished"
        );
        Ok(BatchResult {
            status,
            state,
            preview: plan.preview_only,
            operations: outcomes,
            summary: plan.include_summary.then_some(session.summary),
            rollback_errors,
            failure,
        })
    }

    /// Run one operation as a batch of its own and surface its error directly.
    pub fn apply_single(
        &self,
        op: EditOperation,
        create_parents: bool,
        preview: bool,
    ) -> MirrorResult<OperationOutcome> {
        let plan = BatchPlan {
            operations: vec![op],
            create_parents,
            preview_only: preview,
            ..BatchPlan::default()
        };
        let mut result = self.execute(&plan)?;
        if let Some(err) = result.take_failure() {
            return Err(err);
        }
        result
            .operations
            .pop()
            .ok_or_else(|| MirrorError::internal("batch produced no outcome"))
    }
}

/// Run a batch inside a locked mirror.
pub fn run_batch(
    handle: &MirrorHandle,
    plan: &BatchPlan,
    config: &CoreConfig,
) -> MirrorResult<BatchResult> {
    let mutating = !plan.preview_only && plan.operations.iter().any(EditOperation::is_mutating);
    if mutating && !handle.is_locked() {
        return Err(MirrorError::internal(
            "mutating batches need a locked mirror handle",
        ));
    }
    BatchExecutor::from_config(&handle.paths, config).execute(plan)
}
