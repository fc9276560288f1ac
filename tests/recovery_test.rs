//! Crash and recovery scenarios.
//!
//! A crash is simulated by copying the environment file and its
//! journal while the environment is still open (and therefore still
//! carries the dirty marker), then opening the copy.

use std::path::{Path, PathBuf};

use hamsterdb::{
    CloseFlags, DbOptions, EnvFlags, Environment, HamError, InsertFlags, Options,
};
use tempfile::TempDir;

fn txn_options() -> Options {
    Options {
        page_size: 1024,
        flags: EnvFlags::ENABLE_TRANSACTIONS | EnvFlags::AUTO_RECOVERY,
        ..Default::default()
    }
}

fn journal_path(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_os_string();
    name.push(".jrn");
    PathBuf::from(name)
}

/// Copies the environment and journal files into a crash image.
fn snapshot(path: &Path, dir: &TempDir, name: &str) -> PathBuf {
    let image = dir.path().join(name);
    std::fs::copy(path, &image).unwrap();
    std::fs::copy(journal_path(path), journal_path(&image)).unwrap();
    image
}

#[test]
fn test_crash_loses_uncommitted_txn() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("crash.db");

    let env = Environment::create(&path, txn_options()).unwrap();
    let db = env.create_db(1, DbOptions::default()).unwrap();

    // first half committed and flushed, enough for a few splits
    for i in 0..32u32 {
        let key = format!("committed-{:03}-{:0110}", i, i);
        db.insert(None, key.as_bytes(), b"yes", InsertFlags::empty())
            .unwrap();
    }

    // second half stays uncommitted
    let txn = env.txn_begin(false).unwrap();
    for i in 0..32u32 {
        let key = format!("uncommitted-{:03}", i);
        db.insert(Some(&txn), key.as_bytes(), b"no", InsertFlags::empty())
            .unwrap();
    }

    let image = snapshot(&path, &dir, "image.db");
    drop(txn);
    env.close(CloseFlags::AUTO_CLEANUP).unwrap();

    let env = Environment::open(&image, txn_options()).unwrap();
    let db = env.open_db(1).unwrap();
    for i in 0..32u32 {
        let key = format!("committed-{:03}-{:0110}", i, i);
        assert_eq!(db.find(None, key.as_bytes()).unwrap(), b"yes");
    }
    for i in 0..32u32 {
        let key = format!("uncommitted-{:03}", i);
        assert_eq!(
            db.find(None, key.as_bytes()),
            Err(HamError::KeyNotFound),
            "{} survived the crash",
            key
        );
    }
    db.check_integrity().unwrap();
    env.close(CloseFlags::AUTO_CLEANUP).unwrap();
}

#[test]
fn test_crash_replays_committed_but_unflushed_txn() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("crash.db");

    let env = Environment::create(&path, txn_options()).unwrap();
    let db = env.create_db(1, DbOptions::default()).unwrap();

    // an older active transaction blocks the flush of the younger one
    let blocker = env.txn_begin(false).unwrap();
    db.insert(Some(&blocker), b"blocker", b"-", InsertFlags::empty())
        .unwrap();

    let committed = env.txn_begin(false).unwrap();
    db.insert(Some(&committed), b"replayed", b"v", InsertFlags::empty())
        .unwrap();
    committed.commit().unwrap();

    // the committed data is not in the B-tree yet
    let image = snapshot(&path, &dir, "image.db");
    drop(blocker);
    env.close(CloseFlags::AUTO_CLEANUP).unwrap();

    let env = Environment::open(&image, txn_options()).unwrap();
    let db = env.open_db(1).unwrap();
    assert_eq!(db.find(None, b"replayed").unwrap(), b"v");
    assert_eq!(db.find(None, b"blocker"), Err(HamError::KeyNotFound));
    db.check_integrity().unwrap();
    env.close(CloseFlags::AUTO_CLEANUP).unwrap();
}

#[test]
fn test_crash_replays_committed_erase() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("crash.db");

    let env = Environment::create(&path, txn_options()).unwrap();
    let db = env.create_db(1, DbOptions::default()).unwrap();

    db.insert(None, b"victim", b"v", InsertFlags::empty()).unwrap();

    let blocker = env.txn_begin(false).unwrap();
    db.insert(Some(&blocker), b"blocker", b"-", InsertFlags::empty())
        .unwrap();

    let eraser = env.txn_begin(false).unwrap();
    db.erase(Some(&eraser), b"victim").unwrap();
    eraser.commit().unwrap();

    let image = snapshot(&path, &dir, "image.db");
    drop(blocker);
    env.close(CloseFlags::AUTO_CLEANUP).unwrap();

    let env = Environment::open(&image, txn_options()).unwrap();
    let db = env.open_db(1).unwrap();
    assert_eq!(db.find(None, b"victim"), Err(HamError::KeyNotFound));
    env.close(CloseFlags::AUTO_CLEANUP).unwrap();
}

#[test]
fn test_dirty_open_without_auto_recovery() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("crash.db");

    let env = Environment::create(&path, txn_options()).unwrap();
    let db = env.create_db(1, DbOptions::default()).unwrap();
    db.insert(None, b"k", b"v", InsertFlags::empty()).unwrap();

    let image = snapshot(&path, &dir, "image.db");
    env.close(CloseFlags::AUTO_CLEANUP).unwrap();

    let no_auto = Options {
        flags: EnvFlags::ENABLE_TRANSACTIONS,
        ..txn_options()
    };
    assert_eq!(
        Environment::open(&image, no_auto).err(),
        Some(HamError::NotReady)
    );
}

#[test]
fn test_clean_close_commits_everything() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("clean.db");

    let env = Environment::create(&path, txn_options()).unwrap();
    let db = env.create_db(1, DbOptions::default()).unwrap();

    let txn = env.txn_begin(false).unwrap();
    db.insert(Some(&txn), b"kept", b"v", InsertFlags::empty()).unwrap();

    // keep the transaction open across the close; auto-commit applies it
    env.close(CloseFlags::AUTO_CLEANUP | CloseFlags::TXN_AUTO_COMMIT)
        .unwrap();
    drop(txn);

    let env = Environment::open(&path, txn_options()).unwrap();
    let db = env.open_db(1).unwrap();
    assert_eq!(db.find(None, b"kept").unwrap(), b"v");
    env.close(CloseFlags::AUTO_CLEANUP).unwrap();
}
