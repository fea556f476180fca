//! # Mirror Engine Configuration
//!
//! Configuration is resolved in order of increasing precedence:
//! 1. Built-in defaults
//! 2. TOML file (`--config`, `MIRRORKIT_CONFIG`, or `mirrorkit.toml`)
//! 3. Environment variables (`MIRRORKIT_*`)

use std::env;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::errors::{MirrorError, MirrorResult};

const DEFAULT_STORE_DIR: &str = "~/.mirrorkit/mirrors";
const DEFAULT_REMOTE_TEMPLATE: &str = "https://github.com/{repo}.git";
const DEFAULT_OUTPUT_BYTES: u64 = 64 * 1024;
const DEFAULT_SNAPSHOT_BYTES: u64 = 32 * 1024 * 1024;

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct CoreConfig {
    pub store: StoreConfig,
    pub git: GitConfig,
    pub exec: ExecConfig,
    pub diff: DiffConfig,
    pub batch: BatchConfig,
    pub workflow: WorkflowConfig,
}

/// Where mirrors live and how repository identifiers become remote URLs.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct StoreConfig {
    pub root: PathBuf,
    /// `{repo}` is replaced by the repository identifier.
    pub remote_template: String,
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            root: PathBuf::from(DEFAULT_STORE_DIR),
            remote_template: DEFAULT_REMOTE_TEMPLATE.to_string(),
        }
    }
}

impl StoreConfig {
    pub fn resolved_root(&self) -> PathBuf {
        expand_tilde(&self.root)
    }

    /// URLs and absolute paths are used verbatim.
    pub fn remote_url(&self, repo: &str) -> String {
        if repo.contains("://") || repo.starts_with("git@") || Path::new(repo).is_absolute() {
            repo.to_string()
        } else {
            self.remote_template.replace("{repo}", repo)
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct GitConfig {
    pub default_branch: String,
    pub remote_name: String,
    pub author_name: String,
    pub author_email: String,
}

impl Default for GitConfig {
    fn default() -> Self {
        Self {
            default_branch: "main".to_string(),
            remote_name: "origin".to_string(),
            author_name: "mirrorkit".to_string(),
            author_email: "mirrorkit@localhost".to_string(),
        }
    }
}

/// Command execution budgets and environment bootstrap.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecConfig {
    pub default_timeout_secs: u64,
    pub max_timeout_secs: u64,
    pub max_stdout_bytes: u64,
    pub max_stderr_bytes: u64,
    /// Mirror-relative directory holding the persistent environment
    pub env_dir: String,
    /// Run once when `env_dir` is missing; `{env_dir}` is substituted
    pub env_create_command: String,
    /// Best-effort install step run before the primary command
    pub install_command: String,
    /// Variables copied from the server environment; everything else is cleared
    pub preserved_env_vars: Vec<String>,
}

impl Default for ExecConfig {
    fn default() -> Self {
        Self {
            default_timeout_secs: 120,
            max_timeout_secs: 1800,
            max_stdout_bytes: DEFAULT_OUTPUT_BYTES,
            max_stderr_bytes: DEFAULT_OUTPUT_BYTES,
            env_dir: ".mirrorkit-venv".to_string(),
            env_create_command: "python3 -m venv {env_dir}".to_string(),
            install_command: "if [ -f requirements.txt ]; then pip install -r requirements.txt; \
                              elif [ -f pyproject.toml ]; then pip install -e .; fi"
                .to_string(),
            preserved_env_vars: ["PATH", "HOME", "LANG", "LC_ALL", "TERM", "TMPDIR", "USER"]
                .iter()
                .map(|s| s.to_string())
                .collect(),
        }
    }
}

impl ExecConfig {
    pub fn default_timeout(&self) -> Duration {
        Duration::from_secs(self.default_timeout_secs)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DiffConfig {
    pub context_lines: usize,
    pub max_chars_per_side: usize,
    pub max_diff_chars: usize,
}

impl Default for DiffConfig {
    fn default() -> Self {
        Self {
            context_lines: 3,
            max_chars_per_side: 200_000,
            max_diff_chars: 100_000,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Pre-image budget for recursive directory deletes under rollback
    pub max_snapshot_bytes: u64,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            max_snapshot_bytes: DEFAULT_SNAPSHOT_BYTES,
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct WorkflowConfig {
    /// Commands run in order as the quality gate
    pub quality_gate: Vec<String>,
    pub retry: RetrySettings,
}

impl Default for WorkflowConfig {
    fn default() -> Self {
        Self {
            quality_gate: Vec::new(),
            retry: RetrySettings::default(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetrySettings {
    pub max_attempts: u32,
    pub backoff_ms: u64,
    pub backoff_multiplier: f64,
}

impl Default for RetrySettings {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            backoff_ms: 500,
            backoff_multiplier: 2.0,
        }
    }
}

impl CoreConfig {
    /// Loads configuration from standard sources (path override, env, defaults).
    pub fn load(path_override: Option<&Path>) -> MirrorResult<Self> {
        let mut config = match Self::discover_config_path(path_override) {
            Some(path) => Self::from_file(&path)?,
            None => Self::default(),
        };
        config.apply_env_overrides();
        config.validate().map_err(|errors| MirrorError::Config {
            message: errors.join(", "),
        })?;
        Ok(config)
    }

    pub fn from_file<P: AsRef<Path>>(path: P) -> MirrorResult<Self> {
        let path = path.as_ref();
        let contents = fs::read_to_string(path)
            .map_err(|e| MirrorError::io(Some(path.to_path_buf()), "read config", e))?;
        toml::from_str(&contents).map_err(|e| MirrorError::Config {
            message: format!("{}: {}", path.display(), e),
        })
    }

    fn discover_config_path(path_override: Option<&Path>) -> Option<PathBuf> {
        if let Some(path) = path_override {
            return Some(path.to_path_buf());
        }

        if let Ok(from_env) = env::var("MIRRORKIT_CONFIG") {
            let trimmed = from_env.trim();
            if !trimmed.is_empty() {
                return Some(PathBuf::from(trimmed));
            }
        }

        let candidate = PathBuf::from("mirrorkit.toml");
        candidate.exists().then_some(candidate)
    }

    /// Applies environment variable overrides using the `MIRRORKIT_*` namespace.
    fn apply_env_overrides(&mut self) {
        if let Ok(value) = env::var("MIRRORKIT_STORE_ROOT") {
            if !value.trim().is_empty() {
                self.store.root = PathBuf::from(value.trim());
            }
        }

        if let Ok(value) = env::var("MIRRORKIT_REMOTE_TEMPLATE") {
            if value.contains("{repo}") {
                self.store.remote_template = value;
            }
        }

        if let Ok(value) = env::var("MIRRORKIT_DEFAULT_BRANCH") {
            if !value.trim().is_empty() {
                self.git.default_branch = value.trim().to_string();
            }
        }

        if let Ok(value) = env::var("MIRRORKIT_EXEC_TIMEOUT_SECS") {
            if let Ok(parsed) = value.trim().parse::<u64>() {
                self.exec.default_timeout_secs = parsed;
            }
        }

        if let Ok(value) = env::var("MIRRORKIT_MAX_OUTPUT_BYTES") {
            if let Ok(parsed) = value.trim().parse::<u64>() {
                self.exec.max_stdout_bytes = parsed;
                self.exec.max_stderr_bytes = parsed;
            }
        }

        if let Ok(value) = env::var("MIRRORKIT_QUALITY_GATE") {
            self.workflow.quality_gate = value
                .split(";;")
                .map(str::trim)
                .filter(|cmd| !cmd.is_empty())
                .map(str::to_string)
                .collect();
        }
    }

    pub fn validate(&self) -> Result<(), Vec<String>> {
        let mut errors = Vec::new();

        if !self.store.remote_template.contains("{repo}") {
            errors.push("store.remote_template must contain '{repo}'".to_string());
        }
        if self.git.default_branch.trim().is_empty() {
            errors.push("git.default_branch cannot be empty".to_string());
        }
        if self.git.remote_name.trim().is_empty() {
            errors.push("git.remote_name cannot be empty".to_string());
        }
        if self.exec.default_timeout_secs == 0 {
            errors.push("exec.default_timeout_secs must be greater than 0".to_string());
        }
        if self.exec.default_timeout_secs > self.exec.max_timeout_secs {
            errors.push("exec.default_timeout_secs exceeds exec.max_timeout_secs".to_string());
        }
        if self.exec.max_stdout_bytes == 0 || self.exec.max_stderr_bytes == 0 {
            errors.push("exec output budgets must be greater than 0".to_string());
        }
        if self.exec.env_dir.starts_with('/') || self.exec.env_dir.contains("..") {
            errors.push("exec.env_dir must be mirror-relative".to_string());
        }
        if self.diff.max_diff_chars == 0 || self.diff.max_chars_per_side == 0 {
            errors.push("diff budgets must be greater than 0".to_string());
        }
        if self.workflow.retry.max_attempts == 0 {
            errors.push("workflow.retry.max_attempts must be at least 1".to_string());
        }
        if self.workflow.retry.backoff_multiplier < 1.0 {
            errors.push("workflow.retry.backoff_multiplier must be >= 1.0".to_string());
        }

        if errors.is_empty() {
            Ok(())
        } else {
            Err(errors)
        }
    }
}

fn expand_tilde(path: &Path) -> PathBuf {
    if let Some(raw) = path.to_str() {
        if raw == "~" {
            return env::var("HOME")
                .map(PathBuf::from)
                .unwrap_or_else(|_| path.to_path_buf());
        } else if let Some(rest) = raw.strip_prefix("~/") {
            if let Ok(home) = env::var("HOME") {
                return PathBuf::from(home).join(rest);
            }
        }
    }
    path.to_path_buf()
}
