use crate::errors::{MirrorError, MirrorResult};
use std::path::{Path, PathBuf};
use std::process::{Command, Output};
use tracing::debug;

/// Subcommands that talk to a remote; their failures are retryable.
const NETWORK_COMMANDS: &[&str] = &["clone", "fetch", "push", "ls-remote", "pull"];

/// Thin wrapper over the system `git` binary bound to one working tree.
#[derive(Debug, Clone)]
pub struct GitRunner {
    workdir: PathBuf,
    author: Option<(String, String)>,
}

/// Raw result of a git invocation that is allowed to fail.
#[derive(Debug)]
pub struct GitOutput {
    pub success: bool,
    pub exit_code: Option<i32>,
    pub stdout: String,
    pub stderr: String,
}

impl GitRunner {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
            author: None,
        }
    }

    pub fn with_author(mut self, name: &str, email: &str) -> Self {
        self.author = Some((name.to_string(), email.to_string()));
        self
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    fn command(&self, args: &[&str]) -> Command {
        let mut cmd = Command::new("git");
        if let Some((name, email)) = &self.author {
            cmd.arg("-c")
                .arg(format!("user.name={}", name))
                .arg("-c")
                .arg(format!("user.email={}", email));
        }
        cmd.args(args)
            .current_dir(&self.workdir)
            .env("GIT_TERMINAL_PROMPT", "0")
            .env("LC_ALL", "C");
        cmd
    }

    /// Run without treating a non-zero exit as an error.
    pub fn try_run(&self, args: &[&str]) -> MirrorResult<GitOutput> {
        debug!(dir = %self.workdir.display(), args = ?args, "git");
        let output: Output = self
            .command(args)
            .output()
            .map_err(|e| MirrorError::io(Some(self.workdir.clone()), "spawn git", e))?;
        Ok(GitOutput {
            success: output.status.success(),
            exit_code: output.status.code(),
            stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
            stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        })
    }

    /// Run and return trimmed stdout, failing on non-zero exit.
    pub fn run(&self, args: &[&str]) -> MirrorResult<String> {
        let output = self.try_run(args)?;
        if output.success {
            Ok(output.stdout.trim().to_string())
        } else {
            Err(git_error(args, &output))
        }
    }

    /// `git clone --branch <git_ref> <url> <dest>`, run from `dest`'s parent.
    pub fn clone_ref(url: &str, git_ref: &str, dest: &Path) -> MirrorResult<()> {
        let parent = dest.parent().unwrap_or_else(|| Path::new("."));
        let dest_str = dest.to_string_lossy();
        let args = ["clone", "--branch", git_ref, url, dest_str.as_ref()];
        let output = GitRunner::new(parent).try_run(&args)?;
        if output.success {
            return Ok(());
        }
        if output.stderr.contains("not found in upstream")
            || output.stderr.contains("Could not find remote branch")
        {
            return Err(MirrorError::validation(
                "ref",
                format!("ref '{}' does not exist on the remote", git_ref),
            ));
        }
        Err(git_error(&args, &output))
    }

    pub fn head_commit(&self) -> MirrorResult<String> {
        self.run(&["rev-parse", "HEAD"])
    }

    /// `None` when HEAD is detached.
    pub fn current_branch(&self) -> MirrorResult<Option<String>> {
        let out = self.try_run(&["symbolic-ref", "--quiet", "--short", "HEAD"])?;
        Ok(out
            .success
            .then(|| out.stdout.trim().to_string())
            .filter(|b| !b.is_empty()))
    }

    pub fn rev_parse(&self, rev: &str) -> MirrorResult<Option<String>> {
        check_rev(rev)?;
        let spec = format!("{}^{{commit}}", rev);
        let out = self.try_run(&["rev-parse", "--verify", "--quiet", &spec])?;
        Ok(out.success.then(|| out.stdout.trim().to_string()))
    }

    pub fn is_ancestor(&self, ancestor: &str, descendant: &str) -> MirrorResult<bool> {
        check_rev(ancestor)?;
        check_rev(descendant)?;
        let out = self.try_run(&["merge-base", "--is-ancestor", ancestor, descendant])?;
        match out.exit_code {
            Some(0) => Ok(true),
            Some(1) => Ok(false),
            _ => Err(git_error(
                &["merge-base", "--is-ancestor", ancestor, descendant],
                &out,
            )),
        }
    }

    pub fn is_dirty(&self) -> MirrorResult<bool> {
        Ok(!self.run(&["status", "--porcelain"])?.is_empty())
    }

    pub fn merge_in_progress(&self) -> bool {
        self.git_dir_has("MERGE_HEAD")
    }

    pub fn rebase_in_progress(&self) -> bool {
        self.git_dir_has("rebase-merge") || self.git_dir_has("rebase-apply")
    }

    fn git_dir_has(&self, entry: &str) -> bool {
        self.workdir.join(".git").join(entry).exists()
    }

    pub fn fetch(&self, remote: &str, git_ref: &str) -> MirrorResult<()> {
        self.run(&["fetch", "--prune", remote, git_ref]).map(|_| ())
    }

    /// Fetch `git_ref`; `Ok(false)` when the remote does not have it.
    pub fn fetch_if_present(&self, remote: &str, git_ref: &str) -> MirrorResult<bool> {
        let args = ["fetch", "--prune", remote, git_ref];
        let output = self.try_run(&args)?;
        if output.success {
            Ok(true)
        } else if output.stderr.contains("couldn't find remote ref") {
            Ok(false)
        } else {
            Err(git_error(&args, &output))
        }
    }

    /// File contents at an arbitrary revision, without touching the checkout.
    /// File contents at `rev`. The revision is resolved to a commit first,
    /// so nothing caller-supplied reaches `git show` as an option.
    pub fn show_file(&self, rev: &str, path: &str) -> MirrorResult<String> {
        let commit = self.rev_parse(rev)?.ok_or_else(|| {
            MirrorError::validation("rev", format!("unknown revision '{}'", rev))
        })?;
        let spec = format!("{}:{}", commit, path);
        let out = self.try_run(&["show", &spec])?;
        if out.success {
            Ok(out.stdout)
        } else {
            Err(MirrorError::validation(
                "rev",
                format!("'{}' not found at revision '{}'", path, rev),
            ))
        }
    }

    pub fn stage_all(&self) -> MirrorResult<()> {
        self.run(&["add", "-A"]).map(|_| ())
    }

    /// Commit staged changes. Returns `None` when nothing is staged.
    pub fn commit(&self, message: &str) -> MirrorResult<Option<String>> {
        let staged = self.try_run(&["diff", "--cached", "--quiet"])?;
        if staged.success {
            return Ok(None);
        }
        self.run(&["commit", "--no-verify", "-m", message])?;
        self.head_commit().map(Some)
    }

    pub fn push(&self, remote: &str, branch: &str, set_upstream: bool) -> MirrorResult<()> {
        let refspec = format!("HEAD:refs/heads/{}", branch);
        let mut args = vec!["push"];
        if set_upstream {
            args.push("--set-upstream");
        }
        args.push(remote);
        args.push(&refspec);
        self.run(&args).map(|_| ())
    }
}

fn git_error(args: &[&str], output: &GitOutput) -> MirrorError {
    let network = args
        .first()
        .map(|sub| NETWORK_COMMANDS.contains(sub))
        .unwrap_or(false);
    MirrorError::GitCommand {
        args: args.join(" "),
        exit_code: output.exit_code,
        stderr: output.stderr.trim().to_string(),
        network,
    }
}

// Revisions reach git as positional arguments; one that starts with '-'
// would be parsed as an option.
fn check_rev(rev: &str) -> MirrorResult<()> {
    if rev.trim().is_empty() {
        return Err(MirrorError::validation("rev", "revision must not be empty"));
    }
    if rev.starts_with('-') {
        return Err(MirrorError::validation(
            "rev",
            format!("revision '{}' must not start with '-'", rev),
        ));
    }
    Ok(())
}
