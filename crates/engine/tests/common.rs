//! Common helpers for mirror engine integration tests

#![allow(dead_code)]

use std::fs;
use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use mirrorkit_engine::config::CoreConfig;
use mirrorkit_engine::MirrorManager;

pub const REPO: &str = "acme/widgets";

pub struct Tmp {
    pub dir: tempfile::TempDir,
}

impl Tmp {
    pub fn new() -> Self {
        Self {
            dir: tempfile::tempdir().unwrap(),
        }
    }

    pub fn path(&self) -> &Path {
        self.dir.path()
    }

    pub fn write(&self, rel: &str, data: &str) {
        let p = self.path().join(rel);
        if let Some(parent) = p.parent() {
            fs::create_dir_all(parent).ok();
        }
        fs::write(p, data).unwrap();
    }

    pub fn read(&self, rel: &str) -> String {
        fs::read_to_string(self.path().join(rel)).unwrap()
    }
}

pub fn run<S: AsRef<str>>(cmd: S, cwd: &Path) -> Output {
    Command::new("sh")
        .arg("-c")
        .arg(cmd.as_ref())
        .current_dir(cwd)
        .output()
        .expect("spawn")
}

/// Run git with a fixed identity and panic on failure.
pub fn git(cwd: &Path, args: &str) -> String {
    let out = run(
        format!(
            "git -c user.name=tester -c user.email=tester@example.com {}",
            args
        ),
        cwd,
    );
    assert!(
        out.status.success(),
        "git {} failed: {}",
        args,
        String::from_utf8_lossy(&out.stderr)
    );
    String::from_utf8_lossy(&out.stdout).trim().to_string()
}

/// A bare "remote" seeded with `main` and `feature`, a scratch clone to
/// push further commits from, and a manager whose store lives in a temp dir.
pub struct Fixture {
    pub remotes: Tmp,
    pub store: Tmp,
    pub manager: MirrorManager,
}

impl Fixture {
    pub fn new() -> Self {
        Self::with_config(|_| {})
    }

    pub fn with_config(tweak: impl FnOnce(&mut CoreConfig)) -> Self {
        let remotes = Tmp::new();
        let bare = remotes.path().join("acme/widgets.git");
        fs::create_dir_all(&bare).unwrap();
        git(&bare, "init -q --bare -b main");

        let seed = remotes.path().join("seed");
        fs::create_dir_all(&seed).unwrap();
        git(&seed, "init -q -b main");
        fs::write(seed.join("a.txt"), "hello\nworld\n").unwrap();
        fs::create_dir_all(seed.join("src")).unwrap();
        fs::write(seed.join("src/lib.rs"), "pub fn answer() -> u32 {\n    42\n}\n").unwrap();
        git(&seed, "add -A");
        git(&seed, "commit -q -m seed");
        git(&seed, &format!("remote add origin {}", bare.display()));
        git(&seed, "push -q origin main");
        git(&seed, "checkout -q -b feature");
        fs::write(seed.join("feature.txt"), "feature work\n").unwrap();
        git(&seed, "add -A");
        git(&seed, "commit -q -m feature");
        git(&seed, "push -q origin feature");
        git(&seed, "checkout -q main");

        let store = Tmp::new();
        let mut config = CoreConfig::default();
        config.store.root = store.path().join("mirrors");
        config.store.remote_template = format!("{}/{{repo}}.git", remotes.path().display());
        config.workflow.retry.max_attempts = 1;
        config.workflow.retry.backoff_ms = 0;
        tweak(&mut config);
        let manager = MirrorManager::new(config).unwrap();

        Self {
            remotes,
            store,
            manager,
        }
    }

    pub fn bare(&self) -> PathBuf {
        self.remotes.path().join("acme/widgets.git")
    }

    pub fn seed(&self) -> PathBuf {
        self.remotes.path().join("seed")
    }

    /// Commit `content` to `file` on `branch` and push it to the remote.
    pub fn push_remote_commit(&self, branch: &str, file: &str, content: &str) -> String {
        let seed = self.seed();
        git(&seed, &format!("checkout -q {}", branch));
        git(&seed, &format!("pull -q origin {}", branch));
        fs::write(seed.join(file), content).unwrap();
        git(&seed, "add -A");
        git(&seed, &format!("commit -q -m 'update {}'", file));
        git(&seed, &format!("push -q origin {}", branch));
        git(&seed, "rev-parse HEAD")
    }

    /// Tip of `branch` in the bare remote, if it exists.
    pub fn remote_head(&self, branch: &str) -> Option<String> {
        let out = run(
            format!("git rev-parse --verify -q refs/heads/{}", branch),
            &self.bare(),
        );
        out.status
            .success()
            .then(|| String::from_utf8_lossy(&out.stdout).trim().to_string())
    }

    /// File contents at the remote tip of `branch`.
    pub fn remote_file(&self, branch: &str, file: &str) -> Option<String> {
        let out = run(format!("git show {}:{}", branch, file), &self.bare());
        out.status
            .success()
            .then(|| String::from_utf8_lossy(&out.stdout).to_string())
    }
}
