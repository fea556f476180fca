//! Common helpers for tool-level integration tests

#![allow(dead_code)]

use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::process::Command;
use std::sync::{Arc, Mutex};

use mcp_core::McpTool;
use mcp_tools::{default_tools_with_options, ToolOptions};
use mirrorkit_engine::{
    CoreConfig, MirrorResult, PullRequest, PullRequestDraft, PullRequestGateway,
};

pub const REPO: &str = "acme/widgets";

pub fn git(cwd: &Path, args: &str) -> String {
    let out = Command::new("sh")
        .arg("-c")
        .arg(format!(
            "git -c user.name=tester -c user.email=tester@example.com {}",
            args
        ))
        .current_dir(cwd)
        .output()
        .expect("spawn");
    assert!(
        out.status.success(),
        "git {} failed: {}",
        args,
        String::from_utf8_lossy(&out.stderr)
    );
    String::from_utf8_lossy(&out.stdout).trim().to_string()
}

/// Records drafts and numbers pull requests from 1.
#[derive(Default)]
pub struct RecordingGateway {
    pub created: Mutex<Vec<PullRequest>>,
}

impl PullRequestGateway for RecordingGateway {
    fn find_open(&self, _repo: &str, head: &str, base: &str) -> MirrorResult<Option<PullRequest>> {
        let created = self.created.lock().unwrap();
        Ok(created
            .iter()
            .find(|pr| pr.head == head && pr.base == base)
            .map(|pr| PullRequest {
                reused: true,
                ..pr.clone()
            }))
    }

    fn create(&self, repo: &str, draft: &PullRequestDraft) -> MirrorResult<PullRequest> {
        let mut created = self.created.lock().unwrap();
        let number = created.len() as u64 + 1;
        let pr = PullRequest {
            number,
            url: format!("https://example.test/{}/pull/{}", repo, number),
            head: draft.head.clone(),
            base: draft.base.clone(),
            reused: false,
        };
        created.push(pr.clone());
        Ok(pr)
    }
}

/// Bare remote seeded with `main`, plus the full tool set over a temp store.
pub struct Harness {
    pub remotes: tempfile::TempDir,
    pub store: tempfile::TempDir,
    pub gateway: Arc<RecordingGateway>,
    pub tools: HashMap<String, Arc<dyn McpTool>>,
}

impl Harness {
    pub fn new() -> Self {
        let remotes = tempfile::tempdir().unwrap();
        let bare = remotes.path().join("acme/widgets.git");
        fs::create_dir_all(&bare).unwrap();
        git(&bare, "init -q --bare -b main");

        let seed = remotes.path().join("seed");
        fs::create_dir_all(&seed).unwrap();
        git(&seed, "init -q -b main");
        fs::write(seed.join("a.txt"), "hello\nworld\n").unwrap();
        git(&seed, "add -A");
        git(&seed, "commit -q -m seed");
        git(&seed, &format!("remote add origin {}", bare.display()));
        git(&seed, "push -q origin main");

        let store = tempfile::tempdir().unwrap();
        let mut config = CoreConfig::default();
        config.store.root = store.path().join("mirrors");
        config.store.remote_template = format!("{}/{{repo}}.git", remotes.path().display());
        config.workflow.retry.max_attempts = 1;
        config.workflow.retry.backoff_ms = 0;

        let gateway = Arc::new(RecordingGateway::default());
        let tools = default_tools_with_options(
            config,
            ToolOptions {
                gateway: Some(gateway.clone()),
            },
        )
        .unwrap()
        .into_iter()
        .map(|tool| (tool.name().to_string(), tool))
        .collect();

        Self {
            remotes,
            store,
            gateway,
            tools,
        }
    }

    pub fn tool(&self, name: &str) -> Arc<dyn McpTool> {
        self.tools
            .get(name)
            .cloned()
            .unwrap_or_else(|| panic!("tool {} not registered", name))
    }

    pub fn bare(&self) -> PathBuf {
        self.remotes.path().join("acme/widgets.git")
    }
}
