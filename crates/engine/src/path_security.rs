use crate::errors::{MirrorError, MirrorResult};
use std::fs;
use std::path::{Component, Path, PathBuf};

const MAX_PATH_LEN: usize = 4096;

/// Resolves caller-supplied repository-relative paths against one mirror root.
///
/// Paths are rejected, never normalized: `a/../b` fails even though it would
/// land inside the root.
#[derive(Debug, Clone)]
pub struct MirrorPaths {
    /// Canonicalized mirror root
    root: PathBuf,
}

impl MirrorPaths {
    pub fn new<P: AsRef<Path>>(root: P) -> MirrorResult<Self> {
        let root = fs::canonicalize(root.as_ref()).map_err(|e| {
            MirrorError::io(
                Some(root.as_ref().to_path_buf()),
                "canonicalize mirror root",
                e,
            )
        })?;
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Validate `relative` and return its absolute location inside the mirror.
    pub fn resolve(&self, relative: &str) -> MirrorResult<PathBuf> {
        validate_relative(relative)?;
        let full = self.root.join(relative);
        self.ensure_no_symlink_escape(relative, &full)?;
        Ok(full)
    }

    /// Like [`resolve`](Self::resolve) but the empty string and `.` mean the root.
    pub fn resolve_dir(&self, relative: Option<&str>) -> MirrorResult<PathBuf> {
        match relative.map(str::trim) {
            None | Some("") | Some(".") => Ok(self.root.clone()),
            Some(rel) => self.resolve(rel.trim_end_matches('/')),
        }
    }

    /// Repository-relative POSIX form of an absolute path inside the mirror.
    pub fn relative(&self, full: &Path) -> Option<String> {
        full.strip_prefix(&self.root)
            .ok()
            .map(|p| p.to_string_lossy().replace('\\', "/"))
    }

    // The deepest existing ancestor must canonicalize inside the root, so a
    // symlinked directory cannot redirect writes elsewhere.
    fn ensure_no_symlink_escape(&self, relative: &str, full: &Path) -> MirrorResult<()> {
        let mut probe = full.to_path_buf();
        loop {
            if fs::symlink_metadata(&probe).is_ok() {
                break;
            }
            if !probe.pop() {
                return Ok(());
            }
        }

        let canonical = fs::canonicalize(&probe)
            .map_err(|e| MirrorError::io(Some(probe.clone()), "canonicalize path", e))
            .or_else(|err| {
                // Dangling symlink: judge it by its target text.
                match fs::read_link(&probe) {
                    Ok(target) if target.is_absolute() => Ok(target),
                    Ok(target) => Ok(probe
                        .parent()
                        .map(|p| p.join(&target))
                        .unwrap_or(target)),
                    Err(_) => Err(err),
                }
            })?;

        if canonical.starts_with(&self.root) {
            Ok(())
        } else {
            Err(MirrorError::PathEscape {
                path: relative.to_string(),
                rule: "symlink_escape",
            })
        }
    }
}

/// Syntactic checks shared by every path crossing the engine boundary.
pub fn validate_relative(relative: &str) -> MirrorResult<()> {
    if relative.trim().is_empty() {
        return Err(MirrorError::validation("path", "path cannot be empty"));
    }
    if relative.len() > MAX_PATH_LEN {
        return Err(MirrorError::validation("path", "path too long"));
    }
    if relative.contains('\0') || relative.chars().any(|c| c.is_control()) {
        return Err(MirrorError::validation(
            "path",
            "path contains control characters",
        ));
    }
    if relative.contains('\\') {
        return Err(MirrorError::validation(
            "path",
            "path must use '/' separators",
        ));
    }

    let path = Path::new(relative);
    if path.is_absolute() || relative.starts_with('/') {
        return Err(MirrorError::PathEscape {
            path: relative.to_string(),
            rule: "no_absolute_paths",
        });
    }

    let mut first = true;
    for component in path.components() {
        match component {
            Component::ParentDir => {
                return Err(MirrorError::PathEscape {
                    path: relative.to_string(),
                    rule: "no_path_traversal",
                })
            }
            Component::Normal(name) if first && name == ".git" => {
                return Err(MirrorError::PathEscape {
                    path: relative.to_string(),
                    rule: "no_git_internals",
                })
            }
            Component::Prefix(_) | Component::RootDir => {
                return Err(MirrorError::PathEscape {
                    path: relative.to_string(),
                    rule: "no_absolute_paths",
                })
            }
            _ => {}
        }
        first = false;
    }

    Ok(())
}
