//! Pull-request gateway backed by the GitHub CLI.

use std::process::{Command, Output};

use mirrorkit_engine::{MirrorError, MirrorResult, PullRequest, PullRequestDraft, PullRequestGateway};
use serde::Deserialize;
use tracing::{debug, info};

// stderr fragments that retrying will not fix
const PERMANENT_FAILURES: &[&str] = &[
    "auth login",
    "not logged",
    "could not resolve to a repository",
    "no commits between",
    "permission",
    "already exists",
];

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ListedPullRequest {
    number: u64,
    url: String,
    head_ref_name: String,
    base_ref_name: String,
}

/// Shells out to `gh`; the binary must be installed and authenticated.
#[derive(Debug, Clone)]
pub struct GhCliGateway {
    program: String,
}

impl Default for GhCliGateway {
    fn default() -> Self {
        Self::new("gh")
    }
}

impl GhCliGateway {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
        }
    }

    fn gh(&self, operation: &str, args: &[&str]) -> MirrorResult<String> {
        debug!(target: "mirrorkit_tools", program = %self.program, args = ?args, "gh");
        let output: Output = Command::new(&self.program)
            .args(args)
            .env("GH_PROMPT_DISABLED", "1")
            .env("NO_COLOR", "1")
            .output()
            .map_err(|e| MirrorError::Remote {
                service: "gh".to_string(),
                operation: operation.to_string(),
                message: format!("failed to run {}: {}", self.program, e),
                retryable: false,
            })?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
            return Err(remote_error(operation, stderr));
        }
        Ok(String::from_utf8_lossy(&output.stdout).into_owned())
    }
}

fn remote_error(operation: &str, stderr: String) -> MirrorError {
    let lowered = stderr.to_lowercase();
    let retryable = !PERMANENT_FAILURES.iter().any(|m| lowered.contains(m));
    MirrorError::Remote {
        service: "gh".to_string(),
        operation: operation.to_string(),
        message: stderr,
        retryable,
    }
}

fn parse_listed(stdout: &str) -> MirrorResult<Option<PullRequest>> {
    let listed: Vec<ListedPullRequest> = serde_json::from_str(stdout.trim()).map_err(|e| {
        MirrorError::Remote {
            service: "gh".to_string(),
            operation: "pr list".to_string(),
            message: format!("unexpected output: {}", e),
            retryable: false,
        }
    })?;
    Ok(listed.into_iter().next().map(|pr| PullRequest {
        number: pr.number,
        url: pr.url,
        head: pr.head_ref_name,
        base: pr.base_ref_name,
        reused: true,
    }))
}

/// `gh pr create` prints the new pull request URL; the number is its last segment.
fn parse_created(stdout: &str, draft: &PullRequestDraft) -> MirrorResult<PullRequest> {
    let parsed = stdout
        .lines()
        .map(str::trim)
        .filter(|line| line.starts_with("http"))
        .find_map(|url| {
            let (_, tail) = url.rsplit_once("/pull/")?;
            let number = tail.trim_end_matches('/').parse::<u64>().ok()?;
            Some((url.to_string(), number))
        });
    match parsed {
        Some((url, number)) => Ok(PullRequest {
            number,
            url,
            head: draft.head.clone(),
            base: draft.base.clone(),
            reused: false,
        }),
        None => Err(MirrorError::Remote {
            service: "gh".to_string(),
            operation: "pr create".to_string(),
            message: format!("no pull request URL in output: {}", stdout.trim()),
            retryable: false,
        }),
    }
}

impl PullRequestGateway for GhCliGateway {
    fn find_open(&self, repo: &str, head: &str, base: &str) -> MirrorResult<Option<PullRequest>> {
        let stdout = self.gh(
            "pr list",
            &[
                "pr",
                "list",
                "--repo",
                repo,
                "--head",
                head,
                "--base",
                base,
                "--state",
                "open",
                "--json",
                "number,url,headRefName,baseRefName",
                "--limit",
                "1",
            ],
        )?;
        parse_listed(&stdout)
    }

    fn create(&self, repo: &str, draft: &PullRequestDraft) -> MirrorResult<PullRequest> {
        let stdout = self.gh(
            "pr create",
            &[
                "pr",
                "create",
                "--repo",
                repo,
                "--head",
                &draft.head,
                "--base",
                &draft.base,
                "--title",
                &draft.title,
                "--body",
                &draft.body,
            ],
        )?;
        let pr = parse_created(&stdout, draft)?;
        info!(target: "mirrorkit_tools", repo, number = pr.number, url = %pr.url, "pull request created");
        Ok(pr)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn draft() -> PullRequestDraft {
        PullRequestDraft {
            head: "feat/greeting".into(),
            base: "main".into(),
            title: "Add greeting".into(),
            body: String::new(),
        }
    }

    #[test]
    fn listed_pull_request_is_marked_reused() {
        let stdout = r#"[{"baseRefName":"main","headRefName":"feat/greeting","number":7,"url":"https://github.com/acme/widgets/pull/7"}]"#;
        let pr = parse_listed(stdout).unwrap().unwrap();
        assert_eq!(pr.number, 7);
        assert_eq!(pr.head, "feat/greeting");
        assert!(pr.reused);
        assert_eq!(parse_listed("[]\n").unwrap(), None);
    }

    #[test]
    fn created_url_yields_number() {
        let stdout = "Creating pull request for feat/greeting into main\n\nhttps://github.com/acme/widgets/pull/12\n";
        let pr = parse_created(stdout, &draft()).unwrap();
        assert_eq!(pr.number, 12);
        assert_eq!(pr.url, "https://github.com/acme/widgets/pull/12");
        assert!(!pr.reused);
        assert!(parse_created("warning: nothing\n", &draft()).is_err());
    }

    #[test]
    fn auth_failures_are_not_retryable() {
        let err = remote_error("pr create", "To get started with GitHub CLI, please run:  gh auth login".into());
        assert!(!err.is_retryable());
        let err = remote_error("pr list", "error connecting to api.github.com".into());
        assert!(err.is_retryable());
        assert_eq!(err.error_code(), "E_REMOTE");
    }

    #[test]
    fn missing_binary_is_a_remote_error() {
        let gateway = GhCliGateway::new("/nonexistent/gh-binary");
        let err = gateway.find_open("acme/widgets", "a", "main").unwrap_err();
        assert_eq!(err.error_code(), "E_REMOTE");
    }
}
