//! Mirror Lifecycle Manager: create, refresh, reset, re-key and delete mirrors.

use std::fs;
use std::path::PathBuf;
use std::sync::Arc;

use serde::Serialize;
use tracing::{info, warn};

use crate::config::CoreConfig;
use crate::errors::{MirrorError, MirrorResult};
use crate::git::GitRunner;
use crate::path_security::MirrorPaths;
use crate::store::{MirrorGuard, MirrorKey, MirrorRecord, MirrorStore};

/// What `ensure` did to bring the mirror up to date.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SyncAction {
    Cloned,
    UpToDate,
    FastForwarded,
    /// Local has commits the remote lacks; left untouched
    LocalAhead,
    Reset,
}

#[derive(Debug, Clone, Serialize)]
pub struct Mirror {
    pub key: MirrorKey,
    pub path: PathBuf,
    pub head: String,
    pub branch: Option<String>,
    pub dirty: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct EnsureOutcome {
    pub mirror: Mirror,
    pub created: bool,
    pub action: SyncAction,
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckoutOutcome {
    pub mirror: Mirror,
    pub created_branch: bool,
    pub rekeyed: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct MirrorStatus {
    pub key: MirrorKey,
    pub path: PathBuf,
    pub head: String,
    pub branch: Option<String>,
    pub dirty: bool,
    pub locked: bool,
    pub merge_in_progress: bool,
    pub rebase_in_progress: bool,
    pub last_synced_commit: Option<String>,
    /// Checked-out branch matches the key's ref and no merge/rebase is pending
    pub consistent: bool,
}

/// A resolved mirror plus its path resolver and git runner. Mutating handles
/// hold the key lock until dropped.
#[derive(Debug)]
pub struct MirrorHandle {
    pub key: MirrorKey,
    pub paths: MirrorPaths,
    pub git: GitRunner,
    guard: Option<MirrorGuard>,
}

impl MirrorHandle {
    pub fn root(&self) -> &std::path::Path {
        self.paths.root()
    }

    pub fn is_locked(&self) -> bool {
        self.guard.is_some()
    }
}

#[derive(Debug, Clone)]
pub struct MirrorManager {
    store: MirrorStore,
    config: Arc<CoreConfig>,
}

impl MirrorManager {
    pub fn new(config: CoreConfig) -> MirrorResult<Self> {
        let store = MirrorStore::open(config.store.resolved_root())?;
        Ok(Self {
            store,
            config: Arc::new(config),
        })
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn store(&self) -> &MirrorStore {
        &self.store
    }

    /// Build a key, defaulting the ref to the configured default branch.
    pub fn key(&self, repo: &str, git_ref: Option<&str>) -> MirrorResult<MirrorKey> {
        let git_ref = git_ref
            .map(str::trim)
            .filter(|r| !r.is_empty())
            .unwrap_or(&self.config.git.default_branch);
        MirrorKey::new(repo, git_ref)
    }

    fn git(&self, path: impl Into<PathBuf>) -> GitRunner {
        GitRunner::new(path).with_author(
            &self.config.git.author_name,
            &self.config.git.author_email,
        )
    }

    fn remote(&self) -> &str {
        &self.config.git.remote_name
    }

    /// Make sure a usable mirror exists for the key.
    pub fn ensure(&self, key: &MirrorKey, reset: bool) -> MirrorResult<EnsureOutcome> {
        let _guard = self.store.lock(key)?;

        let existing = match self.store.lookup(key)? {
            Some(record) if record.path.join(".git").exists() => Some(record),
            Some(record) => {
                warn!(key = %key, path = %record.path.display(), "mirror directory vanished; re-cloning");
                self.store.remove(key)?;
                None
            }
            None => None,
        };

        let (record, created, action) = match existing {
            None => (self.clone_fresh(key)?, true, SyncAction::Cloned),
            Some(record) => {
                let git = self.git(&record.path);
                let action = if reset {
                    self.hard_reset(key, &git)?
                } else {
                    self.fast_forward(key, &git)?
                };
                self.store.mark_synced(key, &git.head_commit()?)?;
                (record, false, action)
            }
        };

        let mirror = self.describe(key, record.path)?;
        info!(key = %key, created, action = ?action, head = %mirror.head, "mirror ensured");
        Ok(EnsureOutcome {
            mirror,
            created,
            action,
        })
    }

    fn clone_fresh(&self, key: &MirrorKey) -> MirrorResult<MirrorRecord> {
        let dest = self.store.allocate_dir(key);
        if dest.exists() {
            return Err(MirrorError::internal(format!(
                "freshly allocated mirror directory {} already exists",
                dest.display()
            )));
        }

        // Clone next to the destination and rename, so a failed clone never
        // leaves a half-populated mirror behind.
        let staging = tempfile::Builder::new()
            .prefix(".clone-")
            .tempdir_in(self.store.trees_dir())
            .map_err(|e| MirrorError::io(Some(self.store.trees_dir()), "create clone staging", e))?;
        let staged_tree = staging.path().join("tree");
        let url = self.config.store.remote_url(&key.repo);
        GitRunner::clone_ref(&url, &key.git_ref, &staged_tree)?;
        fs::rename(&staged_tree, &dest)
            .map_err(|e| MirrorError::io(Some(dest.clone()), "move clone into place", e))?;

        let head = self.git(&dest).head_commit()?;
        self.store.register(key, &dest, Some(head))
    }

    fn fast_forward(&self, key: &MirrorKey, git: &GitRunner) -> MirrorResult<SyncAction> {
        self.check_consistent(key, git)?;
        if !git.fetch_if_present(self.remote(), &key.git_ref)? {
            // Branch created locally and not pushed yet.
            return Ok(SyncAction::LocalAhead);
        }

        let local = git.head_commit()?;
        let remote = git
            .rev_parse("FETCH_HEAD")?
            .ok_or_else(|| MirrorError::internal("FETCH_HEAD missing after fetch"))?;

        if local == remote {
            return Ok(SyncAction::UpToDate);
        }
        if git.is_ancestor(&local, &remote)? {
            git.run(&["merge", "--ff-only", "FETCH_HEAD"])?;
            return Ok(SyncAction::FastForwarded);
        }
        if git.is_ancestor(&remote, &local)? {
            return Ok(SyncAction::LocalAhead);
        }
        Err(MirrorError::DivergedState {
            repo: key.repo.clone(),
            git_ref: key.git_ref.clone(),
            detail: format!(
                "local {} and remote {} have diverged",
                short(&local),
                short(&remote)
            ),
        })
    }

    fn check_consistent(&self, key: &MirrorKey, git: &GitRunner) -> MirrorResult<()> {
        let diverged = |detail: String| MirrorError::DivergedState {
            repo: key.repo.clone(),
            git_ref: key.git_ref.clone(),
            detail,
        };
        if git.merge_in_progress() {
            return Err(diverged("merge in progress".to_string()));
        }
        if git.rebase_in_progress() {
            return Err(diverged("rebase in progress".to_string()));
        }
        match git.current_branch()? {
            None => Err(diverged("HEAD is detached".to_string())),
            Some(branch) if branch != key.git_ref => Err(diverged(format!(
                "branch '{}' is checked out instead of '{}'",
                branch, key.git_ref
            ))),
            Some(_) => Ok(()),
        }
    }

    fn hard_reset(&self, key: &MirrorKey, git: &GitRunner) -> MirrorResult<SyncAction> {
        if git.merge_in_progress() {
            let _ = git.try_run(&["merge", "--abort"])?;
        }
        if git.rebase_in_progress() {
            let _ = git.try_run(&["rebase", "--abort"])?;
        }
        git.fetch(self.remote(), &key.git_ref)?;
        git.run(&["checkout", "-f", "-B", &key.git_ref, "FETCH_HEAD"])?;
        git.run(&["reset", "--hard", "FETCH_HEAD"])?;
        // The persistent command environment survives resets.
        let keep = format!("{}/", self.config.exec.env_dir);
        git.run(&["clean", "-fd", "-e", &keep])?;
        info!(key = %key, "mirror hard-reset to remote");
        Ok(SyncAction::Reset)
    }

    /// Switch the working tree to `target`. With `rekey`, lookups under
    /// `target` resolve to this same tree afterwards.
    pub fn checkout(
        &self,
        key: &MirrorKey,
        target: &str,
        create: bool,
        rekey: bool,
    ) -> MirrorResult<CheckoutOutcome> {
        let target_key = MirrorKey::new(key.repo.clone(), target)?;
        let _guard = self.store.lock(key)?;
        let rekey = rekey && target_key != *key;
        let _target_guard = if rekey {
            Some(self.store.lock(&target_key)?)
        } else {
            None
        };

        let record = self
            .store
            .lookup(key)?
            .ok_or_else(|| MirrorError::MirrorNotFound {
                key: key.to_string(),
            })?;
        if rekey && self.store.lookup(&target_key)?.is_some() {
            return Err(MirrorError::validation(
                "target",
                format!(
                    "a mirror for {} already exists; delete it or pass rekey=false",
                    target_key
                ),
            ));
        }

        let git = self.git(&record.path);
        let created_branch = if create {
            git.run(&["checkout", "-b", target])?;
            true
        } else if git.rev_parse(&format!("refs/heads/{}", target))?.is_some() {
            git.run(&["checkout", target])?;
            false
        } else {
            git.fetch(self.remote(), target)?;
            git.run(&["checkout", "-B", target, "FETCH_HEAD"])?;
            false
        };

        let (final_key, path) = if rekey {
            let moved = self.store.rekey(key, &target_key)?;
            (target_key, moved.path)
        } else {
            (key.clone(), record.path)
        };

        info!(key = %key, target, created_branch, rekey, "mirror checkout");
        Ok(CheckoutOutcome {
            mirror: self.describe(&final_key, path)?,
            created_branch,
            rekeyed: rekey,
        })
    }

    /// Lock the key and return a handle for mutating operations.
    pub fn acquire(&self, key: &MirrorKey) -> MirrorResult<MirrorHandle> {
        let guard = self.store.lock(key)?;
        let mut handle = self.open(key)?;
        handle.guard = Some(guard);
        Ok(handle)
    }

    /// Handle for read-only inspection; takes no lock.
    pub fn open(&self, key: &MirrorKey) -> MirrorResult<MirrorHandle> {
        let record = self
            .store
            .lookup(key)?
            .ok_or_else(|| MirrorError::MirrorNotFound {
                key: key.to_string(),
            })?;
        Ok(MirrorHandle {
            key: key.clone(),
            paths: MirrorPaths::new(&record.path)?,
            git: self.git(&record.path),
            guard: None,
        })
    }

    pub fn status(&self, key: &MirrorKey) -> MirrorResult<MirrorStatus> {
        let record = self
            .store
            .lookup(key)?
            .ok_or_else(|| MirrorError::MirrorNotFound {
                key: key.to_string(),
            })?;
        let locked = self.store.is_locked(key)?;
        let git = self.git(&record.path);
        let branch = git.current_branch()?;
        let merge_in_progress = git.merge_in_progress();
        let rebase_in_progress = git.rebase_in_progress();
        let consistent = branch.as_deref() == Some(key.git_ref.as_str())
            && !merge_in_progress
            && !rebase_in_progress;
        Ok(MirrorStatus {
            key: key.clone(),
            head: git.head_commit()?,
            dirty: git.is_dirty()?,
            path: record.path,
            branch,
            locked,
            merge_in_progress,
            rebase_in_progress,
            last_synced_commit: record.last_synced_commit,
            consistent,
        })
    }

    pub fn list(&self) -> MirrorResult<Vec<MirrorRecord>> {
        self.store.list()
    }

    /// The only destructive lifecycle path.
    pub fn delete(&self, key: &MirrorKey) -> MirrorResult<bool> {
        let _guard = self.store.lock(key)?;
        Ok(self.store.remove(key)?.is_some())
    }

    fn describe(&self, key: &MirrorKey, path: PathBuf) -> MirrorResult<Mirror> {
        let git = self.git(&path);
        Ok(Mirror {
            key: key.clone(),
            head: git.head_commit()?,
            branch: git.current_branch()?,
            dirty: git.is_dirty()?,
            path,
        })
    }
}

fn short(commit: &str) -> &str {
    &commit[..commit.len().min(12)]
}
