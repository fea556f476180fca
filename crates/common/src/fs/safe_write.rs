use anyhow::{bail, Context, Result};
use path_clean::PathClean;
use serde::{Deserialize, Serialize};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Component, Path, PathBuf};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WriteMode {
    #[default]
    Overwrite,
    CreateNew,
}

/// Writes files below a fixed root, atomically.
pub struct SafeFileWriter {
    root: PathBuf,
    max_file_size: Option<usize>,
    create_parents: bool,
}

impl SafeFileWriter {
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self {
            root: root.into(),
            max_file_size: Some(10 * 1024 * 1024), // 10MB default max
            create_parents: true,
        }
    }

    pub fn with_max_size(mut self, max_size: Option<usize>) -> Self {
        self.max_file_size = max_size;
        self
    }

    pub fn with_create_parents(mut self, create_parents: bool) -> Self {
        self.create_parents = create_parents;
        self
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn validate_path(&self, path: &Path) -> Result<PathBuf> {
        let cleaned = path.clean();

        if cleaned.is_absolute() {
            if !cleaned.starts_with(&self.root) {
                bail!(
                    "absolute path '{}' is outside of '{}'",
                    path.display(),
                    self.root.display()
                );
            }
            return Ok(cleaned);
        }

        if cleaned
            .components()
            .any(|component| matches!(component, Component::ParentDir))
        {
            bail!(
                "path '{}' contains parent directory traversal",
                path.display()
            );
        }

        Ok(self.root.join(cleaned))
    }

    fn validate_content(&self, content: &[u8]) -> Result<()> {
        if let Some(max_size) = self.max_file_size {
            if content.len() > max_size {
                bail!(
                    "content size {} exceeds maximum {} bytes",
                    content.len(),
                    max_size
                );
            }
        }
        Ok(())
    }

    pub fn write(&self, path: &Path, content: &[u8], mode: WriteMode) -> Result<PathBuf> {
        let target = self.validate_path(path)?;
        self.validate_content(content)?;

        if let Some(parent) = target.parent() {
            if !parent.exists() {
                if !self.create_parents {
                    bail!(
                        "parent directory '{}' does not exist",
                        parent.display()
                    );
                }
                fs::create_dir_all(parent).with_context(|| {
                    format!(
                        "failed to create parent directories for '{}'",
                        parent.display()
                    )
                })?;
            }
        }

        if mode == WriteMode::CreateNew && target.exists() {
            bail!("file '{}' already exists", target.display());
        }

        write_atomic(&target, content)?;
        Ok(target)
    }

    pub fn write_text(&self, path: &Path, content: &str, mode: WriteMode) -> Result<PathBuf> {
        self.write(path, content.as_bytes(), mode)
    }
}

/// Write to a sibling temp file, fsync, then rename over `path`.
///
/// Readers never observe a half-written file; they see either the old or the
/// new content.
pub fn write_atomic(path: &Path, content: &[u8]) -> Result<()> {
    let file_name = path
        .file_name()
        .with_context(|| format!("'{}' has no file name", path.display()))?;
    let mut temp_name = std::ffi::OsString::from(".");
    temp_name.push(file_name);
    temp_name.push(format!(".{}.tmp", std::process::id()));
    let temp_path = path.with_file_name(temp_name);

    let mut temp_file = OpenOptions::new()
        .write(true)
        .create(true)
        .truncate(true)
        .open(&temp_path)
        .with_context(|| format!("failed to create temp file '{}'", temp_path.display()))?;

    let written = temp_file
        .write_all(content)
        .and_then(|_| temp_file.sync_all());
    drop(temp_file);

    if let Err(err) = written {
        let _ = fs::remove_file(&temp_path);
        return Err(err).with_context(|| format!("failed to write '{}'", temp_path.display()));
    }

    if let Ok(metadata) = fs::metadata(path) {
        let _ = fs::set_permissions(&temp_path, metadata.permissions());
    }

    fs::rename(&temp_path, path).map_err(|err| {
        let _ = fs::remove_file(&temp_path);
        anyhow::Error::new(err).context(format!("atomic rename onto '{}'", path.display()))
    })
}
