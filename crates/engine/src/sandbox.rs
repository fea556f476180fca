//! Command execution inside a mirror.
//!
//! Commands run through `sh -c` in their own process group with a cleared
//! environment. Output is drained by reader threads that keep at most the
//! configured number of bytes per stream; a timed-out command has its whole
//! group killed and returns whatever was captured up to that point.

use std::io::Read;
use std::path::{Path, PathBuf};
use std::process::{Command, Stdio};
use std::sync::{Arc, Mutex, MutexGuard};
use std::thread;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::config::ExecConfig;
use crate::errors::{MirrorError, MirrorResult};
use crate::lifecycle::MirrorHandle;
use mirrorkit_common::process_utils::{decode_bounded, isolate_process_group, kill_process_group};
use mirrorkit_common::{resolve_budget, BudgetSource};

const POLL_INTERVAL: Duration = Duration::from_millis(25);
// After a kill, how long to wait for reader threads to see EOF.
const DRAIN_GRACE: Duration = Duration::from_millis(500);
const MAX_OUTPUT_CEILING: u64 = 16 * 1024 * 1024;

/// Environment preparation before the primary command.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EnvMode {
    #[default]
    None,
    /// Ensure the per-mirror environment exists and activate it
    Persistent,
    /// `Persistent`, plus a best-effort dependency install first
    InstallDependencies,
}

impl EnvMode {
    pub fn from_flags(use_env: bool, install_dependencies: bool) -> Self {
        match (use_env, install_dependencies) {
            (_, true) => EnvMode::InstallDependencies,
            (true, false) => EnvMode::Persistent,
            (false, false) => EnvMode::None,
        }
    }

    fn uses_env(self) -> bool {
        self != EnvMode::None
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CommandRequest {
    pub command: String,
    /// Mirror-relative working directory; the mirror root when absent
    #[serde(default)]
    pub workdir: Option<String>,
    #[serde(default)]
    pub timeout_secs: Option<u64>,
    #[serde(default)]
    pub env_mode: EnvMode,
    #[serde(default)]
    pub max_stdout_bytes: Option<u64>,
    #[serde(default)]
    pub max_stderr_bytes: Option<u64>,
}

impl CommandRequest {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            ..Self::default()
        }
    }

    pub fn with_timeout_secs(mut self, secs: u64) -> Self {
        self.timeout_secs = Some(secs);
        self
    }
}

/// Result of one process run.
#[derive(Debug, Clone, Serialize)]
pub struct StepOutput {
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub stdout: String,
    pub stderr: String,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
    pub elapsed_ms: u64,
}

impl StepOutput {
    pub fn succeeded(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct EnvSetup {
    pub env_dir: String,
    /// The environment was created by this call
    pub created: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub install: Option<StepOutput>,
}

#[derive(Debug, Clone, Serialize)]
pub struct CommandExecution {
    pub command: String,
    pub workdir: String,
    pub timeout_secs: u64,
    pub timeout_source: BudgetSource,
    pub exit_code: Option<i32>,
    pub timed_out: bool,
    pub stdout: String,
    pub stderr: String,
    pub stdout_truncated: bool,
    pub stderr_truncated: bool,
    pub elapsed_ms: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub env_setup: Option<EnvSetup>,
}

impl CommandExecution {
    pub fn succeeded(&self) -> bool {
        !self.timed_out && self.exit_code == Some(0)
    }
}

#[derive(Default)]
struct Captured {
    bytes: Vec<u8>,
    total: u64,
    done: bool,
}

fn lock(captured: &Mutex<Captured>) -> MutexGuard<'_, Captured> {
    captured.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

// Keeps the first `cap` bytes and drains the rest so the child never blocks
// on a full pipe.
fn spawn_capture<R>(stream: Option<R>, cap: usize) -> Arc<Mutex<Captured>>
where
    R: Read + Send + 'static,
{
    let captured = Arc::new(Mutex::new(Captured::default()));
    let Some(mut stream) = stream else {
        lock(&captured).done = true;
        return captured;
    };
    let shared = Arc::clone(&captured);
    thread::spawn(move || {
        let mut chunk = [0u8; 8192];
        loop {
            match stream.read(&mut chunk) {
                Ok(0) | Err(_) => break,
                Ok(n) => {
                    let mut guard = lock(&shared);
                    let room = cap.saturating_sub(guard.bytes.len());
                    let keep = room.min(n);
                    guard.bytes.extend_from_slice(&chunk[..keep]);
                    guard.total += n as u64;
                }
            }
        }
        lock(&shared).done = true;
    });
    captured
}

fn wait_drained(streams: &[&Arc<Mutex<Captured>>], grace: Duration) {
    let deadline = Instant::now() + grace;
    while Instant::now() < deadline && !streams.iter().all(|s| lock(s).done) {
        thread::sleep(POLL_INTERVAL);
    }
}

fn finish(captured: &Mutex<Captured>, cap: usize) -> (String, bool) {
    let guard = lock(captured);
    let (text, cut) = decode_bounded(&guard.bytes, cap);
    (text, cut || guard.total > cap as u64)
}

/// Run `script` with `sh -c` in `workdir`, bounded by `timeout` and the
/// output caps.
fn run_process(
    script: &str,
    workdir: &Path,
    env: &[(String, String)],
    timeout: Duration,
    stdout_cap: usize,
    stderr_cap: usize,
) -> MirrorResult<StepOutput> {
    let mut cmd = Command::new("sh");
    cmd.arg("-c")
        .arg(script)
        .current_dir(workdir)
        .env_clear()
        .envs(env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());
    isolate_process_group(&mut cmd);

    debug!(command = %script, workdir = %workdir.display(), timeout_secs = timeout.as_secs(), "spawning command");
    let start = Instant::now();
    let mut child = cmd
        .spawn()
        .map_err(|e| MirrorError::io(Some(workdir.to_path_buf()), "spawn command", e))?;
    let stdout = spawn_capture(child.stdout.take(), stdout_cap);
    let stderr = spawn_capture(child.stderr.take(), stderr_cap);

    let mut timed_out = false;
    let status = loop {
        match child.try_wait() {
            Ok(Some(status)) => break Some(status),
            Ok(None) if start.elapsed() >= timeout => {
                timed_out = true;
                if let Err(err) = kill_process_group(child.id()) {
                    warn!(pid = child.id(), error = %err, "failed to kill process group");
                    let _ = child.kill();
                }
                let _ = child.wait();
                break None;
            }
            Ok(None) => thread::sleep(POLL_INTERVAL),
            Err(e) => {
                let _ = kill_process_group(child.id());
                let _ = child.wait();
                return Err(MirrorError::io(None::<PathBuf>, "wait for command", e));
            }
        }
    };

    // A background grandchild may keep the pipes open; cap how long we wait.
    let grace = if timed_out { DRAIN_GRACE } else { DRAIN_GRACE * 4 };
    wait_drained(&[&stdout, &stderr], grace);
    let (stdout, stdout_truncated) = finish(&stdout, stdout_cap);
    let (stderr, stderr_truncated) = finish(&stderr, stderr_cap);

    Ok(StepOutput {
        exit_code: status.and_then(|s| s.code()),
        timed_out,
        stdout,
        stderr,
        stdout_truncated,
        stderr_truncated,
        elapsed_ms: start.elapsed().as_millis() as u64,
    })
}

/// Runs commands against locked mirrors.
#[derive(Debug, Clone)]
pub struct Sandbox {
    config: ExecConfig,
}

impl Sandbox {
    pub fn new(config: ExecConfig) -> Self {
        Self { config }
    }

    fn base_env(&self) -> Vec<(String, String)> {
        self.config
            .preserved_env_vars
            .iter()
            .filter_map(|name| std::env::var(name).ok().map(|v| (name.clone(), v)))
            .collect()
    }

    fn activated_env(&self, env_root: &Path) -> Vec<(String, String)> {
        let bin = env_root.join("bin");
        let mut env: Vec<(String, String)> = self
            .base_env()
            .into_iter()
            .filter(|(k, _)| k != "PATH")
            .collect();
        let path = match std::env::var("PATH") {
            Ok(existing) if !existing.is_empty() => format!("{}:{}", bin.display(), existing),
            _ => bin.display().to_string(),
        };
        env.push(("PATH".to_string(), path));
        env.push(("VIRTUAL_ENV".to_string(), env_root.display().to_string()));
        env
    }

    fn ensure_env(
        &self,
        root: &Path,
        mode: EnvMode,
        timeout: Duration,
        caps: (usize, usize),
    ) -> MirrorResult<EnvSetup> {
        let env_root = root.join(&self.config.env_dir);
        let mut created = false;
        if !env_root.is_dir() {
            let script = self
                .config
                .env_create_command
                .replace("{env_dir}", &self.config.env_dir);
            let output = run_process(&script, root, &self.base_env(), timeout, caps.0, caps.1)?;
            if !output.succeeded() || !env_root.is_dir() {
                return Err(MirrorError::apply(
                    Some(&self.config.env_dir),
                    format!(
                        "environment creation failed (exit {:?}, timed out: {}): {}",
                        output.exit_code,
                        output.timed_out,
                        output.stderr.trim()
                    ),
                ));
            }
            info!(env_dir = %self.config.env_dir, "created persistent environment");
            created = true;
        }

        let install = if mode == EnvMode::InstallDependencies {
            let output = run_process(
                &self.config.install_command,
                root,
                &self.activated_env(&env_root),
                timeout,
                caps.0,
                caps.1,
            )?;
            if !output.succeeded() {
                warn!(
                    exit_code = ?output.exit_code,
                    timed_out = output.timed_out,
                    "dependency install failed; running command anyway"
                );
            }
            Some(output)
        } else {
            None
        };

        Ok(EnvSetup {
            env_dir: self.config.env_dir.clone(),
            created,
            install,
        })
    }

    /// Run one command. The handle must hold the mirror lock; the command,
    /// its environment setup and its outputs are all serialized under it.
    pub fn run(
        &self,
        handle: &MirrorHandle,
        request: &CommandRequest,
    ) -> MirrorResult<CommandExecution> {
        if !handle.is_locked() {
            return Err(MirrorError::internal(
                "command execution needs a locked mirror handle",
            ));
        }
        if request.command.trim().is_empty() {
            return Err(MirrorError::validation("command", "command cannot be empty"));
        }

        let workdir: PathBuf = handle.paths.resolve_dir(request.workdir.as_deref())?;
        if !workdir.is_dir() {
            return Err(MirrorError::validation(
                "workdir",
                format!("'{}' is not a directory", workdir.display()),
            ));
        }

        let timeout = resolve_budget(
            request.timeout_secs,
            "MIRRORKIT_EXEC_TIMEOUT_SECS",
            self.config.default_timeout_secs,
            1,
            self.config.max_timeout_secs,
        );
        let stdout_cap = resolve_budget(
            request.max_stdout_bytes,
            "MIRRORKIT_MAX_OUTPUT_BYTES",
            self.config.max_stdout_bytes,
            1,
            MAX_OUTPUT_CEILING,
        )
        .value as usize;
        let stderr_cap = resolve_budget(
            request.max_stderr_bytes,
            "MIRRORKIT_MAX_OUTPUT_BYTES",
            self.config.max_stderr_bytes,
            1,
            MAX_OUTPUT_CEILING,
        )
        .value as usize;
        let budget = Duration::from_secs(timeout.value);

        let env_setup = if request.env_mode.uses_env() {
            Some(self.ensure_env(
                handle.root(),
                request.env_mode,
                budget,
                (stdout_cap, stderr_cap),
            )?)
        } else {
            None
        };
        let env = if env_setup.is_some() {
            self.activated_env(&handle.root().join(&self.config.env_dir))
        } else {
            self.base_env()
        };

        let output = run_process(
            &request.command,
            &workdir,
            &env,
            budget,
            stdout_cap,
            stderr_cap,
        )?;
        info!(
            key = %handle.key,
            exit_code = ?output.exit_code,
            timed_out = output.timed_out,
            elapsed_ms = output.elapsed_ms,
            stdout_truncated = output.stdout_truncated,
            stderr_truncated = output.stderr_truncated,
            "command finished"
        );

        Ok(CommandExecution {
            command: request.command.clone(),
            workdir: handle
                .paths
                .relative(&workdir)
                .filter(|rel| !rel.is_empty())
                .unwrap_or_else(|| ".".to_string()),
            timeout_secs: timeout.value,
            timeout_source: timeout.source,
            exit_code: output.exit_code,
            timed_out: output.timed_out,
            stdout: output.stdout,
            stderr: output.stderr,
            stdout_truncated: output.stdout_truncated,
            stderr_truncated: output.stderr_truncated,
            elapsed_ms: output.elapsed_ms,
            env_setup,
        })
    }
}
