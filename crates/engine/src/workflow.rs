//! Branch → edit → gate → commit → push → pull request, as one pipeline.
//!
//! Stages run in a fixed order and the first failure stops the pipeline.
//! Every stage, including the ones never reached, appears in the step log.
//! Only the network stages (base sync, push, pull request) are retried, and
//! only for errors that report themselves as retryable.

use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::{info, warn};

use crate::batch::{run_batch, BatchPlan, EditOperation};
use crate::config::RetrySettings;
use crate::errors::{MirrorError, MirrorResult};
use crate::lifecycle::{MirrorHandle, MirrorManager};
use crate::sandbox::{CommandRequest, Sandbox};
use crate::store::MirrorKey;

pub const STEP_SYNC_BASE: &str = "sync_base";
pub const STEP_PREPARE_BRANCH: &str = "prepare_branch";
pub const STEP_APPLY_EDITS: &str = "apply_edits";
pub const STEP_QUALITY_GATE: &str = "quality_gate";
pub const STEP_COMMIT: &str = "commit";
pub const STEP_PUSH: &str = "push";
pub const STEP_PULL_REQUEST: &str = "pull_request";

const PIPELINE: [&str; 7] = [
    STEP_SYNC_BASE,
    STEP_PREPARE_BRANCH,
    STEP_APPLY_EDITS,
    STEP_QUALITY_GATE,
    STEP_COMMIT,
    STEP_PUSH,
    STEP_PULL_REQUEST,
];

/// Caller-visible retry policy for network stages.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub backoff: Duration,
    pub multiplier: f64,
}

impl RetryPolicy {
    pub fn none() -> Self {
        Self {
            max_attempts: 1,
            backoff: Duration::ZERO,
            multiplier: 1.0,
        }
    }

    /// Run `op` until it succeeds, fails with a non-retryable error, or the
    /// attempts run out. Returns the last result and the attempt count.
    pub fn run<T, F>(&self, step: &str, mut op: F) -> (MirrorResult<T>, u32)
    where
        F: FnMut() -> MirrorResult<T>,
    {
        let max_attempts = self.max_attempts.max(1);
        let mut delay = self.backoff;
        let mut attempt = 0;
        loop {
            attempt += 1;
            match op() {
                Ok(value) => return (Ok(value), attempt),
                Err(err) if err.is_retryable() && attempt < max_attempts => {
                    warn!(
                        step,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %err,
                        "retrying workflow step"
                    );
                    thread::sleep(delay);
                    delay = delay.mul_f64(self.multiplier.max(1.0));
                }
                Err(err) => return (Err(err), attempt),
            }
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from(&RetrySettings::default())
    }
}

impl From<&RetrySettings> for RetryPolicy {
    fn from(settings: &RetrySettings) -> Self {
        Self {
            max_attempts: settings.max_attempts,
            backoff: Duration::from_millis(settings.backoff_ms),
            multiplier: settings.backoff_multiplier,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PullRequest {
    pub number: u64,
    pub url: String,
    pub head: String,
    pub base: String,
    /// An open pull request for the same head/base pair was returned
    #[serde(default)]
    pub reused: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullRequestDraft {
    pub head: String,
    pub base: String,
    pub title: String,
    pub body: String,
}

/// Remote side of the pull-request stage.
pub trait PullRequestGateway: Send + Sync {
    /// Open pull request with exactly this head and base, if any.
    fn find_open(&self, repo: &str, head: &str, base: &str) -> MirrorResult<Option<PullRequest>>;

    fn create(&self, repo: &str, draft: &PullRequestDraft) -> MirrorResult<PullRequest>;
}

fn default_true() -> bool {
    true
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRequest {
    pub repo: String,
    /// Base ref; the configured default branch when absent
    #[serde(default)]
    pub base: Option<String>,
    /// Feature branch to create or reuse
    pub branch: String,
    #[serde(default)]
    pub operations: Vec<EditOperation>,
    pub commit_message: String,
    #[serde(default)]
    pub pr_title: Option<String>,
    #[serde(default)]
    pub pr_body: Option<String>,
    /// Overrides the configured gate commands
    #[serde(default)]
    pub quality_gate: Option<Vec<String>>,
    #[serde(default = "default_true")]
    pub run_quality_gate: bool,
    #[serde(default = "default_true")]
    pub push: bool,
    #[serde(default = "default_true")]
    pub open_pr: bool,
    /// Hard-reset the base mirror instead of fast-forwarding it
    #[serde(default)]
    pub reset_base: bool,
    /// Attach raw stage outputs (batch results, command output) to the log
    #[serde(default)]
    pub include_outputs: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Succeeded,
    Failed,
    Skipped,
}

#[derive(Debug, Clone, Serialize)]
pub struct StepError {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Vec::is_empty")]
    pub hints: Vec<String>,
}

impl From<&MirrorError> for StepError {
    fn from(err: &MirrorError) -> Self {
        Self {
            code: err.error_code().to_string(),
            message: err.to_string(),
            hints: err.recovery_hints(),
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct StepRecord {
    pub name: &'static str,
    pub status: StepStatus,
    pub attempts: u32,
    pub detail: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<StepError>,
}

#[derive(Debug, Clone, Serialize)]
pub struct WorkflowOutcome {
    pub success: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stopped_at: Option<&'static str>,
    pub base: String,
    pub branch: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub commit: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pull_request: Option<PullRequest>,
    pub steps: Vec<StepRecord>,
}

struct StepLog {
    steps: Vec<StepRecord>,
    include_outputs: bool,
}

impl StepLog {
    fn push(
        &mut self,
        name: &'static str,
        status: StepStatus,
        attempts: u32,
        detail: impl Into<String>,
        output: Option<Value>,
        error: Option<StepError>,
    ) {
        self.steps.push(StepRecord {
            name,
            status,
            attempts,
            detail: detail.into(),
            output: output.filter(|_| self.include_outputs),
            error,
        });
    }

    fn ok(&mut self, name: &'static str, attempts: u32, detail: impl Into<String>) {
        self.push(name, StepStatus::Succeeded, attempts, detail, None, None);
    }

    fn skip(&mut self, name: &'static str, detail: impl Into<String>) {
        self.push(name, StepStatus::Skipped, 0, detail, None, None);
    }

    fn fail(&mut self, name: &'static str, attempts: u32, error: StepError, output: Option<Value>) {
        let detail = error.message.clone();
        self.push(name, StepStatus::Failed, attempts, detail, output, Some(error));
    }

    /// Record the stages after `stopped` as not run.
    fn close(&mut self, stopped: &'static str) {
        let start = PIPELINE
            .iter()
            .position(|step| *step == stopped)
            .map_or(PIPELINE.len(), |i| i + 1);
        for name in &PIPELINE[start..] {
            self.skip(name, format!("not run: pipeline stopped at {}", stopped));
        }
    }
}

/// Runs [`WorkflowRequest`]s.
pub struct Orchestrator<'a> {
    manager: &'a MirrorManager,
    gateway: &'a dyn PullRequestGateway,
    retry: RetryPolicy,
}

impl<'a> Orchestrator<'a> {
    pub fn new(manager: &'a MirrorManager, gateway: &'a dyn PullRequestGateway) -> Self {
        Self {
            manager,
            gateway,
            retry: RetryPolicy::from(&manager.config().workflow.retry),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Run the pipeline. Bad requests fail with `Err` before any stage runs;
    /// stage failures are reported in the outcome.
    pub fn run(&self, request: &WorkflowRequest) -> MirrorResult<WorkflowOutcome> {
        let base_key = self.manager.key(&request.repo, request.base.as_deref())?;
        let branch_key = MirrorKey::new(request.repo.clone(), request.branch.trim())?;
        if branch_key == base_key {
            return Err(MirrorError::validation(
                "branch",
                "feature branch must differ from the base ref",
            ));
        }
        if request.commit_message.trim().is_empty() {
            return Err(MirrorError::validation(
                "commit_message",
                "commit message cannot be empty",
            ));
        }

        let mut log = StepLog {
            steps: Vec::new(),
            include_outputs: request.include_outputs,
        };
        let mut outcome = WorkflowOutcome {
            success: false,
            stopped_at: None,
            base: base_key.git_ref.clone(),
            branch: branch_key.git_ref.clone(),
            commit: None,
            pull_request: None,
            steps: Vec::new(),
        };

        let stopped = self.pipeline(request, &base_key, &branch_key, &mut log, &mut outcome);
        if let Some(step) = stopped {
            log.close(step);
        }
        outcome.success = stopped.is_none();
        outcome.stopped_at = stopped;
        outcome.steps = log.steps;

        info!(
            repo = %request.repo,
            branch = %outcome.branch,
            success = outcome.success,
            stopped_at = ?outcome.stopped_at,
            "workflow finished"
        );
        Ok(outcome)
    }

    // Returns the stage that stopped the pipeline.
    fn pipeline(
        &self,
        request: &WorkflowRequest,
        base_key: &MirrorKey,
        branch_key: &MirrorKey,
        log: &mut StepLog,
        outcome: &mut WorkflowOutcome,
    ) -> Option<&'static str> {
        let (synced, attempts) = self.retry.run(STEP_SYNC_BASE, || {
            self.manager.ensure(base_key, request.reset_base)
        });
        match synced {
            Ok(sync) => log.ok(
                STEP_SYNC_BASE,
                attempts,
                format!("{} {:?} at {}", base_key, sync.action, sync.mirror.head),
            ),
            Err(err) => {
                log.fail(STEP_SYNC_BASE, attempts, StepError::from(&err), None);
                return Some(STEP_SYNC_BASE);
            }
        }

        match self.prepare_branch(base_key, branch_key) {
            Ok(detail) => log.ok(STEP_PREPARE_BRANCH, 1, detail),
            Err(err) => {
                log.fail(STEP_PREPARE_BRANCH, 1, StepError::from(&err), None);
                return Some(STEP_PREPARE_BRANCH);
            }
        }

        // The branch lock is held from here until the pull request step.
        let handle = match self.manager.acquire(branch_key) {
            Ok(handle) => handle,
            Err(err) => {
                log.fail(STEP_APPLY_EDITS, 1, StepError::from(&err), None);
                return Some(STEP_APPLY_EDITS);
            }
        };

        if let Some(step) = self.apply_edits(request, &handle, log) {
            return Some(step);
        }
        if let Some(step) = self.quality_gate(request, &handle, log) {
            return Some(step);
        }

        match handle
            .git
            .stage_all()
            .and_then(|_| handle.git.commit(&request.commit_message))
        {
            Ok(Some(commit)) => {
                log.ok(STEP_COMMIT, 1, format!("committed {}", commit));
                outcome.commit = Some(commit);
            }
            Ok(None) => log.skip(STEP_COMMIT, "nothing to commit"),
            Err(err) => {
                log.fail(STEP_COMMIT, 1, StepError::from(&err), None);
                return Some(STEP_COMMIT);
            }
        }

        if request.push {
            let remote = &self.manager.config().git.remote_name;
            let (pushed, attempts) = self.retry.run(STEP_PUSH, || {
                handle.git.push(remote, &branch_key.git_ref, true)
            });
            match pushed {
                Ok(()) => log.ok(
                    STEP_PUSH,
                    attempts,
                    format!("pushed {} to {}", branch_key.git_ref, remote),
                ),
                Err(err) => {
                    log.fail(STEP_PUSH, attempts, StepError::from(&err), None);
                    return Some(STEP_PUSH);
                }
            }
        } else {
            log.skip(STEP_PUSH, "push disabled");
        }
        drop(handle);

        if !request.open_pr {
            log.skip(STEP_PULL_REQUEST, "pull request disabled");
            return None;
        }
        if !request.push {
            log.skip(STEP_PULL_REQUEST, "branch was not pushed");
            return None;
        }
        let (opened, attempts) = self.retry.run(STEP_PULL_REQUEST, || {
            self.open_or_reuse(request, &base_key.git_ref, &branch_key.git_ref)
        });
        match opened {
            Ok(pr) => {
                let verb = if pr.reused { "reused" } else { "opened" };
                log.ok(
                    STEP_PULL_REQUEST,
                    attempts,
                    format!("{} pull request #{} {}", verb, pr.number, pr.url),
                );
                outcome.pull_request = Some(pr);
                None
            }
            Err(err) => {
                log.fail(STEP_PULL_REQUEST, attempts, StepError::from(&err), None);
                Some(STEP_PULL_REQUEST)
            }
        }
    }

    /// Reuse a mirror already keyed by the branch, otherwise check the branch
    /// out inside the base mirror and rekey it.
    fn prepare_branch(&self, base_key: &MirrorKey, branch_key: &MirrorKey) -> MirrorResult<String> {
        if self.manager.store().lookup(branch_key)?.is_some() {
            let ensured = self.manager.ensure(branch_key, false)?;
            return Ok(format!(
                "reused mirror for {} ({:?})",
                branch_key, ensured.action
            ));
        }

        let on_remote = {
            let base = self.manager.open(base_key)?;
            base.git
                .fetch_if_present(&self.manager.config().git.remote_name, &branch_key.git_ref)?
        };
        let checkout = self
            .manager
            .checkout(base_key, &branch_key.git_ref, !on_remote, true)?;
        Ok(if checkout.created_branch {
            format!("created branch {} from {}", branch_key.git_ref, base_key.git_ref)
        } else {
            format!("checked out existing remote branch {}", branch_key.git_ref)
        })
    }

    fn apply_edits(
        &self,
        request: &WorkflowRequest,
        handle: &MirrorHandle,
        log: &mut StepLog,
    ) -> Option<&'static str> {
        if request.operations.is_empty() {
            log.skip(STEP_APPLY_EDITS, "no operations");
            return None;
        }
        let plan = BatchPlan {
            include_summary: true,
            ..BatchPlan::new(request.operations.clone())
        };
        match run_batch(handle, &plan, self.manager.config()) {
            Ok(mut result) => {
                let output = serde_json::to_value(&result).ok();
                match result.take_failure() {
                    None => {
                        let summary = result.summary.unwrap_or_default();
                        log.push(
                            STEP_APPLY_EDITS,
                            StepStatus::Succeeded,
                            1,
                            format!(
                                "{} operation(s): {} created, {} updated, {} deleted",
                                result.operations.len(),
                                summary.created,
                                summary.updated,
                                summary.deleted
                            ),
                            output,
                            None,
                        );
                        None
                    }
                    Some(err) => {
                        log.fail(STEP_APPLY_EDITS, 1, StepError::from(&err), output);
                        Some(STEP_APPLY_EDITS)
                    }
                }
            }
            Err(err) => {
                log.fail(STEP_APPLY_EDITS, 1, StepError::from(&err), None);
                Some(STEP_APPLY_EDITS)
            }
        }
    }

    fn quality_gate(
        &self,
        request: &WorkflowRequest,
        handle: &MirrorHandle,
        log: &mut StepLog,
    ) -> Option<&'static str> {
        let commands = request
            .quality_gate
            .clone()
            .unwrap_or_else(|| self.manager.config().workflow.quality_gate.clone());
        if !request.run_quality_gate || commands.is_empty() {
            log.skip(STEP_QUALITY_GATE, "no quality gate configured");
            return None;
        }

        let sandbox = Sandbox::new(self.manager.config().exec.clone());
        let mut outputs = Vec::with_capacity(commands.len());
        for command in &commands {
            let execution = match sandbox.run(handle, &CommandRequest::new(command.clone())) {
                Ok(execution) => execution,
                Err(err) => {
                    log.fail(STEP_QUALITY_GATE, 1, StepError::from(&err), None);
                    return Some(STEP_QUALITY_GATE);
                }
            };
            let passed = execution.succeeded();
            let error = if execution.timed_out {
                Some(StepError::from(&MirrorError::Timeout {
                    timeout_secs: execution.timeout_secs,
                    command: command.clone(),
                }))
            } else if !passed {
                Some(StepError {
                    code: "E_QUALITY_GATE".to_string(),
                    message: format!(
                        "quality gate command `{}` exited with {:?}",
                        command, execution.exit_code
                    ),
                    hints: vec![
                        "Edits were applied but not committed; inspect the mirror or fix and rerun"
                            .to_string(),
                    ],
                })
            } else {
                None
            };
            outputs.push(serde_json::to_value(&execution).unwrap_or(Value::Null));

            if let Some(error) = error {
                log.fail(STEP_QUALITY_GATE, 1, error, Some(Value::Array(outputs)));
                return Some(STEP_QUALITY_GATE);
            }
        }

        log.push(
            STEP_QUALITY_GATE,
            StepStatus::Succeeded,
            1,
            format!("{} command(s) passed", commands.len()),
            Some(Value::Array(outputs)),
            None,
        );
        None
    }

    fn open_or_reuse(
        &self,
        request: &WorkflowRequest,
        base: &str,
        head: &str,
    ) -> MirrorResult<PullRequest> {
        if let Some(mut existing) = self.gateway.find_open(&request.repo, head, base)? {
            existing.reused = true;
            return Ok(existing);
        }
        let title = request
            .pr_title
            .clone()
            .filter(|t| !t.trim().is_empty())
            .unwrap_or_else(|| {
                request
                    .commit_message
                    .lines()
                    .next()
                    .unwrap_or_default()
                    .to_string()
            });
        let draft = PullRequestDraft {
            head: head.to_string(),
            base: base.to_string(),
            title,
            body: request.pr_body.clone().unwrap_or_default(),
        };
        self.gateway.create(&request.repo, &draft)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn retry_stops_on_non_retryable_errors() {
        let policy = RetryPolicy {
            max_attempts: 5,
            backoff: Duration::ZERO,
            multiplier: 2.0,
        };
        let calls = Cell::new(0);
        let (result, attempts) = policy.run("test", || -> MirrorResult<()> {
            calls.set(calls.get() + 1);
            Err(MirrorError::validation("x", "bad"))
        });
        assert!(result.is_err());
        assert_eq!(attempts, 1);
        assert_eq!(calls.get(), 1);
    }

    #[test]
    fn retry_retries_network_failures_until_success() {
        let policy = RetryPolicy {
            max_attempts: 3,
            backoff: Duration::from_millis(1),
            multiplier: 2.0,
        };
        let calls = Cell::new(0);
        let (result, attempts) = policy.run("push", || {
            calls.set(calls.get() + 1);
            if calls.get() < 3 {
                Err(MirrorError::GitCommand {
                    args: "push".into(),
                    exit_code: Some(128),
                    stderr: "connection reset".into(),
                    network: true,
                })
            } else {
                Ok(42)
            }
        });
        assert_eq!(result.unwrap(), 42);
        assert_eq!(attempts, 3);
    }

    #[test]
    fn retry_gives_up_after_max_attempts() {
        let policy = RetryPolicy {
            max_attempts: 2,
            backoff: Duration::ZERO,
            multiplier: 1.0,
        };
        let (result, attempts) = policy.run("sync", || -> MirrorResult<()> {
            Err(MirrorError::LockContention {
                key: "o/r@main".into(),
                lock_path: "/tmp/x.lock".into(),
            })
        });
        assert_eq!(result.unwrap_err().error_code(), "E_LOCK_CONTENTION");
        assert_eq!(attempts, 2);
    }

    #[test]
    fn close_marks_remaining_steps_skipped() {
        let mut log = StepLog {
            steps: Vec::new(),
            include_outputs: false,
        };
        log.ok(STEP_SYNC_BASE, 1, "ok");
        log.fail(
            STEP_PREPARE_BRANCH,
            1,
            StepError::from(&MirrorError::validation("x", "y")),
            Some(Value::Null),
        );
        log.close(STEP_PREPARE_BRANCH);
        assert_eq!(log.steps.len(), PIPELINE.len());
        assert!(log.steps[1].output.is_none());
        assert!(log.steps[2..]
            .iter()
            .all(|s| s.status == StepStatus::Skipped));
    }
}
