//! # Mirror Engine Error Types
//!
//! Every fallible engine operation returns [`MirrorResult`]. Each variant maps
//! to one failure mode and carries enough structured context (failing path,
//! operation index, git exit code) for a caller to decide whether to retry.
//!
//! ## Error Categories
//!
//! - **Validation**: bad path, bad range, unknown operation kind
//! - **State**: diverged mirror, missing mirror, lock contention
//! - **Operation**: hunk did not apply, command timed out, git failed
//! - **System**: I/O and internal failures

use std::borrow::Cow;
use std::path::PathBuf;
use thiserror::Error;
use uuid::Uuid;

/// Higher-level classification than individual error codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum ErrorCategory {
    /// Input validation failures and malformed data
    Validation,
    /// Path containment violations
    Security,
    /// Mirror state inconsistencies
    State,
    /// Operation execution failures (apply, git, commands)
    Operation,
    /// System-level errors (I/O, internal failures)
    System,
}

/// Result type for all engine operations.
pub type MirrorResult<T> = Result<T, MirrorError>;

#[derive(Debug, Error)]
pub enum MirrorError {
    /// E_VALIDATION - Input rejected before any mutation happened
    #[error("Validation failed for '{field}': {reason}")]
    Validation {
        /// Parameter or operation field that failed validation
        field: String,
        reason: String,
        /// Index of the failing batch operation, if any
        operation_index: Option<usize>,
    },

    /// E_PATH_ESCAPE - Path resolves outside the mirror root
    #[error("Path escapes mirror root: {path}")]
    PathEscape { path: String, rule: &'static str },

    /// E_DIVERGED - Fast-forward impossible between local and remote
    #[error("Mirror for {repo}@{git_ref} cannot fast-forward: {detail}")]
    DivergedState {
        repo: String,
        git_ref: String,
        /// Diverged commits, or the inconsistent state found (merge in progress, detached HEAD)
        detail: String,
    },

    /// E_APPLY - Patch hunk mismatch or missing move/delete target
    #[error("Apply failed{}: {reason}", path.as_ref().map(|p| format!(" for '{}'", p)).unwrap_or_default())]
    ApplyFailure {
        reason: String,
        path: Option<String>,
        operation_index: Option<usize>,
    },

    /// E_TIMEOUT - Command exceeded its time budget
    #[error("Command timed out after {timeout_secs}s")]
    Timeout { timeout_secs: u64, command: String },

    /// E_LOCK_CONTENTION - Another operation holds the mirror lock
    #[error("Mirror {key} is locked by another operation")]
    LockContention { key: String, lock_path: PathBuf },

    /// E_MIRROR_NOT_FOUND - No mirror registered for the key
    #[error("No mirror exists for {key}")]
    MirrorNotFound { key: String },

    /// E_GIT - A git invocation returned non-zero
    #[error("git {args} failed (exit {exit_code:?}): {stderr}")]
    GitCommand {
        args: String,
        exit_code: Option<i32>,
        stderr: String,
        /// Whether the command talked to a remote (fetch, clone, push)
        network: bool,
    },

    /// E_REMOTE - The pull-request host rejected or failed a request
    #[error("{service} {operation} failed: {message}")]
    Remote {
        service: String,
        operation: String,
        message: String,
        retryable: bool,
    },

    /// E_CONFIG - Configuration could not be loaded or is invalid
    #[error("Invalid configuration: {message}")]
    Config { message: String },

    /// E_IO - I/O operation failed
    #[error("I/O error in {operation}: {source}")]
    Io {
        operation: String,
        path: Option<PathBuf>,
        #[source]
        source: std::io::Error,
    },

    /// E_INTERNAL - Unexpected condition
    #[error("Internal error in {component}: {message}")]
    Internal {
        component: String,
        message: String,
        correlation_id: String,
    },
}

impl MirrorError {
    pub fn io<P, S>(path: P, operation: S, source: std::io::Error) -> Self
    where
        P: Into<Option<PathBuf>>,
        S: Into<String>,
    {
        Self::Io {
            operation: operation.into(),
            path: path.into(),
            source,
        }
    }

    pub fn validation(field: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::Validation {
            field: field.into(),
            reason: reason.into(),
            operation_index: None,
        }
    }

    pub fn apply(path: Option<&str>, reason: impl Into<String>) -> Self {
        Self::ApplyFailure {
            reason: reason.into(),
            path: path.map(str::to_string),
            operation_index: None,
        }
    }

    pub fn internal<M: Into<Cow<'static, str>>>(message: M) -> Self {
        Self::Internal {
            component: "engine".to_string(),
            message: message.into().into_owned(),
            correlation_id: Uuid::new_v4().to_string(),
        }
    }

    /// Attach the failing batch operation index.
    pub fn at_operation(mut self, index: usize) -> Self {
        match &mut self {
            Self::Validation {
                operation_index, ..
            }
            | Self::ApplyFailure {
                operation_index, ..
            } => *operation_index = Some(index),
            _ => {}
        }
        self
    }

    pub fn error_code(&self) -> &'static str {
        match self {
            Self::Validation { .. } => "E_VALIDATION",
            Self::PathEscape { .. } => "E_PATH_ESCAPE",
            Self::DivergedState { .. } => "E_DIVERGED",
            Self::ApplyFailure { .. } => "E_APPLY",
            Self::Timeout { .. } => "E_TIMEOUT",
            Self::LockContention { .. } => "E_LOCK_CONTENTION",
            Self::MirrorNotFound { .. } => "E_MIRROR_NOT_FOUND",
            Self::GitCommand { .. } => "E_GIT",
            Self::Remote { .. } => "E_REMOTE",
            Self::Config { .. } => "E_CONFIG",
            Self::Io { .. } => "E_IO",
            Self::Internal { .. } => "E_INTERNAL",
        }
    }

    pub fn category(&self) -> ErrorCategory {
        match self {
            Self::Validation { .. } | Self::Config { .. } => ErrorCategory::Validation,
            Self::PathEscape { .. } => ErrorCategory::Security,
            Self::DivergedState { .. }
            | Self::LockContention { .. }
            | Self::MirrorNotFound { .. } => ErrorCategory::State,
            Self::ApplyFailure { .. }
            | Self::Timeout { .. }
            | Self::GitCommand { .. }
            | Self::Remote { .. } => ErrorCategory::Operation,
            Self::Io { .. } | Self::Internal { .. } => ErrorCategory::System,
        }
    }

    /// A path escape is reported to callers as a validation failure.
    pub fn is_validation(&self) -> bool {
        matches!(self, Self::Validation { .. } | Self::PathEscape { .. })
    }

    /// Whether the same call may succeed if repeated later, unchanged.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::LockContention { .. } | Self::Timeout { .. } => true,
            Self::GitCommand { network, .. } => *network,
            Self::Remote { retryable, .. } => *retryable,
            _ => false,
        }
    }

    /// Actionable steps, most likely first.
    pub fn recovery_hints(&self) -> Vec<String> {
        match self {
            Self::Validation {
                field,
                operation_index,
                ..
            } => {
                let mut hints = vec![format!("Fix the '{}' parameter and resend", field)];
                if let Some(index) = operation_index {
                    hints.insert(0, format!("Operation #{} in the batch is invalid", index));
                }
                hints
            }
            Self::PathEscape { .. } => vec![
                "Use a POSIX-style path relative to the repository root".to_string(),
                "Remove '..' segments and leading '/'".to_string(),
            ],
            Self::DivergedState { repo, git_ref, .. } => vec![
                format!(
                    "Call ensure(repo='{}', ref='{}', reset=true) to discard local history",
                    repo, git_ref
                ),
                "Push or save local commits first if they matter".to_string(),
            ],
            Self::ApplyFailure { path, .. } => {
                let mut hints = vec![
                    "Re-read the target file and regenerate the patch or edit".to_string(),
                ];
                if let Some(p) = path {
                    hints.insert(0, format!("Check the current contents of '{}'", p));
                }
                hints
            }
            Self::Timeout { timeout_secs, .. } => vec![
                format!("Raise the timeout above {} seconds", timeout_secs),
                "Split the command into smaller steps".to_string(),
            ],
            Self::LockContention { .. } => vec![
                "Retry after the concurrent operation on this mirror finishes".to_string(),
            ],
            Self::MirrorNotFound { .. } => {
                vec!["Call ensure() to create the mirror first".to_string()]
            }
            Self::GitCommand { network, .. } => {
                if *network {
                    vec![
                        "Check remote reachability and credentials".to_string(),
                        "Retry the operation".to_string(),
                    ]
                } else {
                    vec![
                        "Inspect the mirror with status()".to_string(),
                        "Use ensure(reset=true) if the working tree is inconsistent".to_string(),
                    ]
                }
            }
            Self::Remote { service, .. } => vec![
                format!("Check that the {} CLI is installed and authenticated", service),
                "Retry once the remote is reachable".to_string(),
            ],
            Self::Config { .. } => {
                vec!["Fix the configuration file or MIRRORKIT_* variables".to_string()]
            }
            Self::Io { operation, path, .. } => {
                let mut hints = vec![
                    "Check file and directory permissions".to_string(),
                    format!("Retry the '{}' operation", operation),
                ];
                if let Some(p) = path {
                    hints.insert(0, format!("Check access to path: {:?}", p));
                }
                hints
            }
            Self::Internal { correlation_id, .. } => vec![format!(
                "Report this internal error with ID: {}",
                correlation_id
            )],
        }
    }
}

impl From<anyhow::Error> for MirrorError {
    fn from(error: anyhow::Error) -> Self {
        MirrorError::internal(error.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn retryability_follows_taxonomy() {
        assert!(!MirrorError::validation("path", "empty").is_retryable());
        assert!(MirrorError::LockContention {
            key: "k".into(),
            lock_path: PathBuf::from("/tmp/x.lock"),
        }
        .is_retryable());
        let local_git = MirrorError::GitCommand {
            args: "merge --ff-only".into(),
            exit_code: Some(1),
            stderr: String::new(),
            network: false,
        };
        assert!(!local_git.is_retryable());
    }

    #[test]
    fn operation_index_is_attached() {
        let err = MirrorError::apply(Some("missing.txt"), "not found").at_operation(1);
        match err {
            MirrorError::ApplyFailure {
                operation_index, ..
            } => assert_eq!(operation_index, Some(1)),
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn diverged_recommends_reset() {
        let err = MirrorError::DivergedState {
            repo: "o/r".into(),
            git_ref: "main".into(),
            detail: "local a and remote b have diverged".into(),
        };
        assert_eq!(err.error_code(), "E_DIVERGED");
        assert!(err.recovery_hints()[0].contains("reset=true"));
    }
}
