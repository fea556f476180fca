//! On-disk registry of mirror working trees.
//!
//! Layout under the store root:
//!
//! ```text
//! index.json          key hash -> entry (atomic temp + rename)
//! index.lock          guards read-modify-write of index.json
//! locks/<hash>.lock   per-key exclusive lock; holds the holder's pid while taken
//! trees/<dir>/        one working tree per clone, never reused across keys
//! ```

use std::collections::BTreeMap;
use std::fmt;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use fs2::FileExt;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::errors::{MirrorError, MirrorResult};
use mirrorkit_common::process_utils::process_exists;
use mirrorkit_common::write_atomic;

const INDEX_FILE: &str = "index.json";
const INDEX_LOCK: &str = "index.lock";
const LOCKS_DIR: &str = "locks";
const TREES_DIR: &str = "trees";

/// (repository identifier, ref)
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MirrorKey {
    pub repo: String,
    #[serde(rename = "ref")]
    pub git_ref: String,
}

impl MirrorKey {
    pub fn new(repo: impl Into<String>, git_ref: impl Into<String>) -> MirrorResult<Self> {
        let repo = repo.into().trim().to_string();
        let git_ref = git_ref.into().trim().to_string();
        if repo.is_empty() {
            return Err(MirrorError::validation("repo", "repository cannot be empty"));
        }
        if git_ref.is_empty() || git_ref.starts_with('-') || git_ref.contains("..") {
            return Err(MirrorError::validation(
                "ref",
                format!("invalid ref '{}'", git_ref),
            ));
        }
        Ok(Self { repo, git_ref })
    }

    /// Stable hex digest used for lock and index names.
    pub fn hash(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.repo.as_bytes());
        hasher.update([0u8]);
        hasher.update(self.git_ref.as_bytes());
        hex::encode(&hasher.finalize()[..8])
    }

    fn dir_name(&self) -> String {
        format!(
            "{}@{}-{}",
            sanitize(&self.repo),
            sanitize(&self.git_ref),
            self.hash()
        )
    }
}

impl fmt::Display for MirrorKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.repo, self.git_ref)
    }
}

fn sanitize(raw: &str) -> String {
    let tail: String = raw
        .rsplit(['/', ':'])
        .take(2)
        .collect::<Vec<_>>()
        .into_iter()
        .rev()
        .collect::<Vec<_>>()
        .join("_");
    tail.chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || c == '-' || c == '_' || c == '.' {
                c
            } else {
                '_'
            }
        })
        .take(48)
        .collect()
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct IndexEntry {
    key: MirrorKey,
    /// Directory name under `trees/`
    dir: String,
    created_at: DateTime<Utc>,
    last_synced_commit: Option<String>,
    last_synced_at: Option<DateTime<Utc>>,
}

#[derive(Debug, Default, Serialize, Deserialize)]
struct StoreIndex {
    entries: BTreeMap<String, IndexEntry>,
}

/// Public view of one registered mirror.
#[derive(Debug, Clone, Serialize)]
pub struct MirrorRecord {
    pub key: MirrorKey,
    pub path: PathBuf,
    pub created_at: DateTime<Utc>,
    pub last_synced_commit: Option<String>,
    pub last_synced_at: Option<DateTime<Utc>>,
}

/// Exclusive hold on one mirror key. Released on drop.
#[derive(Debug)]
pub struct MirrorGuard {
    key: MirrorKey,
    file: File,
}

impl MirrorGuard {
    pub fn key(&self) -> &MirrorKey {
        &self.key
    }
}

impl Drop for MirrorGuard {
    fn drop(&mut self) {
        // Clear the holder record before the lock becomes available again.
        let _ = self.file.set_len(0);
        let _ = self.file.unlock();
        debug!(key = %self.key, "mirror lock released");
    }
}

#[derive(Debug, Clone)]
pub struct MirrorStore {
    root: PathBuf,
}

impl MirrorStore {
    pub fn open(root: impl Into<PathBuf>) -> MirrorResult<Self> {
        let root = root.into();
        for dir in [root.clone(), root.join(LOCKS_DIR), root.join(TREES_DIR)] {
            fs::create_dir_all(&dir)
                .map_err(|e| MirrorError::io(Some(dir.clone()), "create store directory", e))?;
        }
        Ok(Self { root })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn trees_dir(&self) -> PathBuf {
        self.root.join(TREES_DIR)
    }

    fn lock_path(&self, key: &MirrorKey) -> PathBuf {
        self.root.join(LOCKS_DIR).join(format!("{}.lock", key.hash()))
    }

    /// Take the key's exclusive lock without waiting.
    pub fn lock(&self, key: &MirrorKey) -> MirrorResult<MirrorGuard> {
        let lock_path = self.lock_path(key);
        let mut file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&lock_path)
            .map_err(|e| MirrorError::io(Some(lock_path.clone()), "open lock file", e))?;

        match file.try_lock_exclusive() {
            Ok(()) => {
                let recorded = file
                    .set_len(0)
                    .and_then(|_| writeln!(file, "{}", std::process::id()));
                if let Err(e) = recorded {
                    warn!(key = %key, error = %e, "could not record lock holder");
                }
                debug!(key = %key, "mirror lock acquired");
                Ok(MirrorGuard {
                    key: key.clone(),
                    file,
                })
            }
            Err(e) if e.kind() == fs2::lock_contended_error().kind() => {
                Err(MirrorError::LockContention {
                    key: key.to_string(),
                    lock_path,
                })
            }
            Err(e) => Err(MirrorError::io(Some(lock_path), "lock mirror", e)),
        }
    }

    /// Whether a live process currently holds the key's lock. Reads the
    /// holder record only, so it never contends with a writer.
    pub fn is_locked(&self, key: &MirrorKey) -> MirrorResult<bool> {
        let lock_path = self.lock_path(key);
        let raw = match fs::read_to_string(&lock_path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(false),
            Err(e) => return Err(MirrorError::io(Some(lock_path), "read lock file", e)),
        };
        Ok(raw
            .trim()
            .parse::<u32>()
            .map(process_exists)
            .unwrap_or(false))
    }

    pub fn lookup(&self, key: &MirrorKey) -> MirrorResult<Option<MirrorRecord>> {
        let index = self.load_index()?;
        Ok(index
            .entries
            .get(&key.hash())
            .map(|entry| self.record(entry)))
    }

    pub fn list(&self) -> MirrorResult<Vec<MirrorRecord>> {
        let index = self.load_index()?;
        Ok(index.entries.values().map(|e| self.record(e)).collect())
    }

    /// Fresh directory for a new clone of `key`. Each clone gets its own
    /// suffix, so a tree that moved to another key by rekey is never reused.
    pub fn allocate_dir(&self, key: &MirrorKey) -> PathBuf {
        let suffix = Uuid::new_v4().simple().to_string();
        self.trees_dir()
            .join(format!("{}-{}", key.dir_name(), &suffix[..8]))
    }

    pub fn register(
        &self,
        key: &MirrorKey,
        path: &Path,
        commit: Option<String>,
    ) -> MirrorResult<MirrorRecord> {
        let dir = path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| MirrorError::internal("mirror directory has no name"))?;
        let now = Utc::now();
        let entry = IndexEntry {
            key: key.clone(),
            dir,
            created_at: now,
            last_synced_commit: commit.clone(),
            last_synced_at: commit.as_ref().map(|_| now),
        };
        let record = self.record(&entry);
        self.with_index(|index| {
            index.entries.insert(key.hash(), entry);
            Ok(())
        })?;
        info!(key = %key, path = %record.path.display(), "mirror registered");
        Ok(record)
    }

    pub fn mark_synced(&self, key: &MirrorKey, commit: &str) -> MirrorResult<()> {
        self.with_index(|index| {
            if let Some(entry) = index.entries.get_mut(&key.hash()) {
                entry.last_synced_commit = Some(commit.to_string());
                entry.last_synced_at = Some(Utc::now());
            }
            Ok(())
        })
    }

    /// Move the index entry for `from` to `to`; the working tree stays put.
    pub fn rekey(&self, from: &MirrorKey, to: &MirrorKey) -> MirrorResult<MirrorRecord> {
        let record = self.with_index(|index| {
            if let Some(existing) = index.entries.get(&to.hash()) {
                return Err(MirrorError::validation(
                    "target",
                    format!("a mirror for {} already exists ({})", to, existing.dir),
                ));
            }
            let mut entry = index
                .entries
                .remove(&from.hash())
                .ok_or_else(|| MirrorError::MirrorNotFound {
                    key: from.to_string(),
                })?;
            entry.key = to.clone();
            let record = self.record(&entry);
            index.entries.insert(to.hash(), entry);
            Ok(record)
        })?;
        info!(from = %from, to = %to, "mirror rekeyed");
        Ok(record)
    }

    /// Unregister and delete the working tree. Caller holds the key lock.
    /// A directory still referenced by another entry is left on disk.
    pub fn remove(&self, key: &MirrorKey) -> MirrorResult<Option<PathBuf>> {
        let removed = self.with_index(|index| {
            Ok(index.entries.remove(&key.hash()).map(|entry| {
                let shared = index.entries.values().any(|other| other.dir == entry.dir);
                (entry, shared)
            }))
        })?;
        let Some((entry, shared)) = removed else {
            return Ok(None);
        };
        let path = self.trees_dir().join(&entry.dir);
        if shared {
            warn!(key = %key, path = %path.display(), "tree still registered under another key; kept");
        } else if path.exists() {
            fs::remove_dir_all(&path)
                .map_err(|e| MirrorError::io(Some(path.clone()), "remove mirror directory", e))?;
        }
        info!(key = %key, "mirror deleted");
        Ok(Some(path))
    }

    fn record(&self, entry: &IndexEntry) -> MirrorRecord {
        MirrorRecord {
            key: entry.key.clone(),
            path: self.trees_dir().join(&entry.dir),
            created_at: entry.created_at,
            last_synced_commit: entry.last_synced_commit.clone(),
            last_synced_at: entry.last_synced_at,
        }
    }

    fn load_index(&self) -> MirrorResult<StoreIndex> {
        let path = self.root.join(INDEX_FILE);
        if !path.exists() {
            return Ok(StoreIndex::default());
        }
        let raw = fs::read(&path)
            .map_err(|e| MirrorError::io(Some(path.clone()), "read store index", e))?;
        serde_json::from_slice(&raw).map_err(|e| MirrorError::Internal {
            component: "store".to_string(),
            message: format!("corrupt store index {}: {}", path.display(), e),
            correlation_id: uuid::Uuid::new_v4().to_string(),
        })
    }

    // Read-modify-write of the index under a blocking lock; held only for
    // the duration of the closure.
    fn with_index<T>(
        &self,
        f: impl FnOnce(&mut StoreIndex) -> MirrorResult<T>,
    ) -> MirrorResult<T> {
        let lock_path = self.root.join(INDEX_LOCK);
        let lock = File::create(&lock_path)
            .map_err(|e| MirrorError::io(Some(lock_path.clone()), "open index lock", e))?;
        lock.lock_exclusive()
            .map_err(|e| MirrorError::io(Some(lock_path.clone()), "lock index", e))?;

        let mut index = self.load_index()?;
        let value = f(&mut index)?;

        let path = self.root.join(INDEX_FILE);
        let bytes = serde_json::to_vec_pretty(&index)
            .map_err(|e| MirrorError::internal(format!("serialize store index: {}", e)))?;
        write_atomic(&path, &bytes)?;

        drop(lock);
        Ok(value)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::tempdir;

    #[test]
    fn key_hash_is_stable_and_distinct() {
        let a = MirrorKey::new("acme/app", "main").unwrap();
        let b = MirrorKey::new("acme/app", "dev").unwrap();
        assert_eq!(a.hash(), MirrorKey::new("acme/app", "main").unwrap().hash());
        assert_ne!(a.hash(), b.hash());
        assert!(a.dir_name().starts_with("acme_app@main-"));
    }

    #[test]
    fn invalid_keys_rejected() {
        assert!(MirrorKey::new("", "main").is_err());
        assert!(MirrorKey::new("a/b", "").is_err());
        assert!(MirrorKey::new("a/b", "--upload-pack=x").is_err());
    }

    #[test]
    fn second_lock_on_same_key_contends() {
        let dir = tempdir().unwrap();
        let store = MirrorStore::open(dir.path()).unwrap();
        let key = MirrorKey::new("acme/app", "main").unwrap();
        let guard = store.lock(&key).unwrap();
        let err = store.lock(&key).unwrap_err();
        assert_eq!(err.error_code(), "E_LOCK_CONTENTION");

        let other = MirrorKey::new("acme/app", "dev").unwrap();
        assert!(store.lock(&other).is_ok());

        drop(guard);
        assert!(store.lock(&key).is_ok());
    }

    #[test]
    fn register_rekey_remove() {
        let dir = tempdir().unwrap();
        let store = MirrorStore::open(dir.path()).unwrap();
        let main = MirrorKey::new("acme/app", "main").unwrap();
        let feature = MirrorKey::new("acme/app", "feature").unwrap();

        let path = store.allocate_dir(&main);
        fs::create_dir_all(&path).unwrap();
        store.register(&main, &path, Some("abc".into())).unwrap();
        assert!(store.lookup(&main).unwrap().is_some());

        let record = store.rekey(&main, &feature).unwrap();
        assert_eq!(record.path, path);
        assert!(store.lookup(&main).unwrap().is_none());
        assert_eq!(store.lookup(&feature).unwrap().unwrap().path, path);

        assert_eq!(store.remove(&feature).unwrap(), Some(path.clone()));
        assert!(!path.exists());
        assert!(store.list().unwrap().is_empty());
    }

    #[test]
    fn allocated_dirs_are_unique_per_clone() {
        let dir = tempdir().unwrap();
        let store = MirrorStore::open(dir.path()).unwrap();
        let key = MirrorKey::new("acme/app", "main").unwrap();
        let first = store.allocate_dir(&key);
        let second = store.allocate_dir(&key);
        assert_ne!(first, second);
        assert!(first
            .file_name()
            .unwrap()
            .to_string_lossy()
            .starts_with(&key.dir_name()));
    }

    #[test]
    fn remove_keeps_tree_shared_with_another_entry() {
        let dir = tempdir().unwrap();
        let store = MirrorStore::open(dir.path()).unwrap();
        let main = MirrorKey::new("acme/app", "main").unwrap();
        let topic = MirrorKey::new("acme/app", "topic").unwrap();

        let path = store.allocate_dir(&main);
        fs::create_dir_all(&path).unwrap();
        fs::write(path.join("wip.txt"), "keep me").unwrap();
        store.register(&main, &path, None).unwrap();
        store.register(&topic, &path, None).unwrap();

        store.remove(&main).unwrap();
        assert_eq!(fs::read_to_string(path.join("wip.txt")).unwrap(), "keep me");
        assert!(store.lookup(&topic).unwrap().is_some());
    }

    #[test]
    fn is_locked_reads_holder_without_taking_the_lock() {
        let dir = tempdir().unwrap();
        let store = MirrorStore::open(dir.path()).unwrap();
        let key = MirrorKey::new("acme/app", "main").unwrap();
        assert!(!store.is_locked(&key).unwrap());

        let guard = store.lock(&key).unwrap();
        assert!(store.is_locked(&key).unwrap());
        drop(guard);
        assert!(!store.is_locked(&key).unwrap());

        for _ in 0..5 {
            assert!(!store.is_locked(&key).unwrap());
            let guard = store.lock(&key).unwrap();
            assert!(store.is_locked(&key).unwrap());
            drop(guard);
        }
    }

    #[test]
    fn dead_holder_record_is_not_locked() {
        let dir = tempdir().unwrap();
        let store = MirrorStore::open(dir.path()).unwrap();
        let key = MirrorKey::new("acme/app", "main").unwrap();
        fs::write(store.lock_path(&key), "999999999\n").unwrap();
        assert!(!store.is_locked(&key).unwrap());
        assert!(store.lock(&key).is_ok());
    }
}
