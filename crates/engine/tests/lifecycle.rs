mod common;
use common::*;

use std::fs;

use mirrorkit_engine::{MirrorError, SyncAction};

#[test]
fn ensure_clones_once_then_reuses() {
    let fx = Fixture::new();
    let key = fx.manager.key(REPO, Some("feature")).unwrap();

    let first = fx.manager.ensure(&key, false).unwrap();
    assert!(first.created);
    assert_eq!(first.action, SyncAction::Cloned);
    assert_eq!(first.mirror.branch.as_deref(), Some("feature"));
    assert!(first.mirror.path.join("feature.txt").exists());

    let second = fx.manager.ensure(&key, false).unwrap();
    assert!(!second.created);
    assert_eq!(second.action, SyncAction::UpToDate);
    assert_eq!(second.mirror.path, first.mirror.path);
    assert_eq!(fx.manager.list().unwrap().len(), 1);
}

#[test]
fn ensure_defaults_to_main_and_fast_forwards() {
    let fx = Fixture::new();
    let key = fx.manager.key(REPO, None).unwrap();
    assert_eq!(key.git_ref, "main");
    fx.manager.ensure(&key, false).unwrap();

    let tip = fx.push_remote_commit("main", "a.txt", "hello\nremote\n");
    let refreshed = fx.manager.ensure(&key, false).unwrap();
    assert_eq!(refreshed.action, SyncAction::FastForwarded);
    assert_eq!(refreshed.mirror.head, tip);
    assert_eq!(
        fs::read_to_string(refreshed.mirror.path.join("a.txt")).unwrap(),
        "hello\nremote\n"
    );
}

#[test]
fn unknown_ref_is_a_validation_error() {
    let fx = Fixture::new();
    let key = fx.manager.key(REPO, Some("does-not-exist")).unwrap();
    let err = fx.manager.ensure(&key, false).unwrap_err();
    assert!(err.is_validation(), "{err:?}");
    assert!(fx.manager.list().unwrap().is_empty());
}

#[test]
fn divergence_is_reported_and_reset_recovers() {
    let fx = Fixture::new();
    let key = fx.manager.key(REPO, Some("main")).unwrap();
    let mirror = fx.manager.ensure(&key, false).unwrap().mirror;

    fs::write(mirror.path.join("local.txt"), "local only\n").unwrap();
    git(&mirror.path, "add -A");
    git(&mirror.path, "commit -q -m local");
    let remote_tip = fx.push_remote_commit("main", "a.txt", "upstream\n");

    let err = fx.manager.ensure(&key, false).unwrap_err();
    assert!(matches!(err, MirrorError::DivergedState { .. }), "{err:?}");
    assert_eq!(err.error_code(), "E_DIVERGED");
    assert!(!err.recovery_hints().is_empty());
    // Nothing was touched.
    assert!(mirror.path.join("local.txt").exists());

    let reset = fx.manager.ensure(&key, true).unwrap();
    assert_eq!(reset.action, SyncAction::Reset);
    assert_eq!(reset.mirror.head, remote_tip);
    assert!(!mirror.path.join("local.txt").exists());
    assert!(!reset.mirror.dirty);
}

#[test]
fn reset_discards_untracked_files_but_keeps_env_dir() {
    let fx = Fixture::new();
    let key = fx.manager.key(REPO, None).unwrap();
    let mirror = fx.manager.ensure(&key, false).unwrap().mirror;
    let env_dir = &fx.manager.config().exec.env_dir;

    fs::write(mirror.path.join("scratch.txt"), "junk").unwrap();
    fs::write(mirror.path.join("a.txt"), "edited\n").unwrap();
    fs::create_dir_all(mirror.path.join(env_dir).join("bin")).unwrap();

    fx.manager.ensure(&key, true).unwrap();
    assert!(!mirror.path.join("scratch.txt").exists());
    assert_eq!(
        fs::read_to_string(mirror.path.join("a.txt")).unwrap(),
        "hello\nworld\n"
    );
    assert!(mirror.path.join(env_dir).join("bin").is_dir());
}

#[test]
fn wrong_branch_checked_out_is_inconsistent() {
    let fx = Fixture::new();
    let key = fx.manager.key(REPO, None).unwrap();
    let mirror = fx.manager.ensure(&key, false).unwrap().mirror;
    git(&mirror.path, "checkout -q -b stray");

    let status = fx.manager.status(&key).unwrap();
    assert!(!status.consistent);
    assert_eq!(status.branch.as_deref(), Some("stray"));

    let err = fx.manager.ensure(&key, false).unwrap_err();
    assert!(matches!(err, MirrorError::DivergedState { .. }));
}

#[test]
fn checkout_with_rekey_moves_the_tree_to_the_new_key() {
    let fx = Fixture::new();
    let main = fx.manager.key(REPO, None).unwrap();
    let path = fx.manager.ensure(&main, false).unwrap().mirror.path;

    let outcome = fx.manager.checkout(&main, "topic", true, true).unwrap();
    assert!(outcome.created_branch);
    assert!(outcome.rekeyed);
    assert_eq!(outcome.mirror.path, path);
    assert_eq!(outcome.mirror.branch.as_deref(), Some("topic"));

    let topic = fx.manager.key(REPO, Some("topic")).unwrap();
    assert_eq!(fx.manager.status(&topic).unwrap().path, path);
    let err = fx.manager.status(&main).unwrap_err();
    assert!(matches!(err, MirrorError::MirrorNotFound { .. }));
}

#[test]
fn ensure_after_rekey_clones_base_without_touching_branch_tree() {
    let fx = Fixture::new();
    let main = fx.manager.key(REPO, None).unwrap();
    fx.manager.ensure(&main, false).unwrap();
    let branch_path = fx.manager.checkout(&main, "topic", true, true).unwrap().mirror.path;
    fs::write(branch_path.join("wip.txt"), "in progress\n").unwrap();

    let again = fx.manager.ensure(&main, false).unwrap();
    assert!(again.created);
    assert_ne!(again.mirror.path, branch_path);
    assert_eq!(
        fs::read_to_string(branch_path.join("wip.txt")).unwrap(),
        "in progress\n"
    );
    let topic = fx.manager.key(REPO, Some("topic")).unwrap();
    assert_eq!(fx.manager.status(&topic).unwrap().path, branch_path);
    assert_eq!(fx.manager.list().unwrap().len(), 2);
}

#[test]
fn status_never_blocks_writers() {
    let fx = Fixture::new();
    let key = fx.manager.key(REPO, None).unwrap();
    fx.manager.ensure(&key, false).unwrap();

    let reader = std::thread::scope(|scope| {
        let polling = scope.spawn(|| {
            for _ in 0..50 {
                assert!(fx.manager.status(&key).is_ok());
            }
        });
        for _ in 0..50 {
            let handle = fx.manager.acquire(&key).unwrap();
            drop(handle);
        }
        polling.join()
    });
    assert!(reader.is_ok());
}

#[test]
fn checkout_without_rekey_keeps_key_and_fetches_remote_branch() {
    let fx = Fixture::new();
    let main = fx.manager.key(REPO, None).unwrap();
    fx.manager.ensure(&main, false).unwrap();

    let outcome = fx.manager.checkout(&main, "feature", false, false).unwrap();
    assert!(!outcome.created_branch);
    assert!(!outcome.rekeyed);
    assert_eq!(outcome.mirror.key, main);
    assert!(outcome.mirror.path.join("feature.txt").exists());
    // The key now points at a tree on another branch.
    assert!(!fx.manager.status(&main).unwrap().consistent);
}

#[test]
fn rekey_onto_existing_mirror_is_rejected() {
    let fx = Fixture::new();
    let main = fx.manager.key(REPO, None).unwrap();
    let feature = fx.manager.key(REPO, Some("feature")).unwrap();
    fx.manager.ensure(&main, false).unwrap();
    fx.manager.ensure(&feature, false).unwrap();

    let err = fx.manager.checkout(&main, "feature", false, true).unwrap_err();
    assert!(err.is_validation());
    assert_eq!(fx.manager.list().unwrap().len(), 2);
}

#[test]
fn held_lock_blocks_other_mutations() {
    let fx = Fixture::new();
    let key = fx.manager.key(REPO, None).unwrap();
    fx.manager.ensure(&key, false).unwrap();

    let handle = fx.manager.acquire(&key).unwrap();
    assert!(handle.is_locked());

    let err = fx.manager.ensure(&key, false).unwrap_err();
    assert!(matches!(err, MirrorError::LockContention { .. }));
    assert!(err.is_retryable());
    assert!(fx.manager.status(&key).unwrap().locked);
    assert!(fx.manager.delete(&key).is_err());

    drop(handle);
    assert!(!fx.manager.status(&key).unwrap().locked);
    assert_eq!(
        fx.manager.ensure(&key, false).unwrap().action,
        SyncAction::UpToDate
    );
}

#[test]
fn read_only_handles_take_no_lock() {
    let fx = Fixture::new();
    let key = fx.manager.key(REPO, None).unwrap();
    fx.manager.ensure(&key, false).unwrap();

    let reader = fx.manager.open(&key).unwrap();
    assert!(!reader.is_locked());
    let writer = fx.manager.acquire(&key).unwrap();
    assert_eq!(reader.root(), writer.root());
}

#[test]
fn delete_removes_tree_and_index_entry() {
    let fx = Fixture::new();
    let key = fx.manager.key(REPO, None).unwrap();
    let path = fx.manager.ensure(&key, false).unwrap().mirror.path;

    assert!(fx.manager.delete(&key).unwrap());
    assert!(!path.exists());
    assert!(fx.manager.list().unwrap().is_empty());
    assert!(!fx.manager.delete(&key).unwrap());

    // A later ensure starts over with a fresh clone.
    assert!(fx.manager.ensure(&key, false).unwrap().created);
}

#[test]
fn vanished_tree_is_recloned() {
    let fx = Fixture::new();
    let key = fx.manager.key(REPO, None).unwrap();
    let path = fx.manager.ensure(&key, false).unwrap().mirror.path;
    fs::remove_dir_all(&path).unwrap();

    let again = fx.manager.ensure(&key, false).unwrap();
    assert!(again.created);
    assert!(again.mirror.path.join("a.txt").exists());
}

#[test]
fn status_reports_dirty_tree_and_sync_point() {
    let fx = Fixture::new();
    let key = fx.manager.key(REPO, None).unwrap();
    let mirror = fx.manager.ensure(&key, false).unwrap().mirror;

    let clean = fx.manager.status(&key).unwrap();
    assert!(!clean.dirty);
    assert!(clean.consistent);
    assert_eq!(clean.last_synced_commit.as_deref(), Some(mirror.head.as_str()));

    fs::write(mirror.path.join("new.txt"), "x").unwrap();
    assert!(fx.manager.status(&key).unwrap().dirty);
}
