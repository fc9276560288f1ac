use hamsterdb::{
    ApproxMode, CloseFlags, CursorMove, DbFlags, DbOptions, EnvFlags, Environment, HamError,
    InsertFlags, Options,
};
use tempfile::{Builder, NamedTempFile};

fn temp_file() -> NamedTempFile {
    Builder::new()
        .prefix("hamsterdb-")
        .suffix(".db")
        .tempfile()
        .unwrap()
}

fn txn_options() -> Options {
    Options {
        page_size: 1024,
        flags: EnvFlags::ENABLE_TRANSACTIONS | EnvFlags::AUTO_RECOVERY,
        ..Default::default()
    }
}

#[test]
fn test_write_write_conflict() {
    let file = temp_file();
    let env = Environment::create(file.path(), txn_options()).unwrap();
    let db = env.create_db(1, DbOptions::default()).unwrap();

    let t1 = env.txn_begin(false).unwrap();
    let t2 = env.txn_begin(false).unwrap();

    db.insert(Some(&t1), b"k", b"v", InsertFlags::empty()).unwrap();
    assert_eq!(
        db.insert(Some(&t2), b"k", b"w", InsertFlags::empty()),
        Err(HamError::TxnConflict)
    );

    t1.commit().unwrap();

    // t2 sees the committed value through the B-tree
    assert_eq!(db.find(Some(&t2), b"k").unwrap(), b"v");
    t2.commit().unwrap();

    // a fresh reader sees it as well
    assert_eq!(db.find(None, b"k").unwrap(), b"v");

    env.close(CloseFlags::AUTO_CLEANUP).unwrap();
}

#[test]
fn test_approximate_match_across_trees() {
    let file = temp_file();
    let env = Environment::create(file.path(), txn_options()).unwrap();
    let db = env.create_db(1, DbOptions::default()).unwrap();

    for key in [b"1", b"2", b"3"] {
        db.insert(None, key, key, InsertFlags::empty()).unwrap();
    }

    let txn = env.txn_begin(false).unwrap();
    db.insert(Some(&txn), b"2.5", b"x", InsertFlags::empty()).unwrap();

    // gt lands on the B-tree side
    let (key, record) = db.find_approx(Some(&txn), b"2.7", ApproxMode::Gt).unwrap();
    assert_eq!(key, b"3");
    assert_eq!(record, b"3");

    // lt lands on the pending insert of the transaction
    let (key, record) = db.find_approx(Some(&txn), b"2.7", ApproxMode::Lt).unwrap();
    assert_eq!(key, b"2.5");
    assert_eq!(record, b"x");

    txn.abort().unwrap();
    env.close(CloseFlags::AUTO_CLEANUP).unwrap();
}

#[test]
fn test_insert_onto_erase_is_a_fresh_key() {
    let file = temp_file();
    let env = Environment::create(file.path(), txn_options()).unwrap();
    let db = env.create_db(1, DbOptions::default()).unwrap();

    db.insert(None, b"k", b"old", InsertFlags::empty()).unwrap();

    let txn = env.txn_begin(false).unwrap();
    db.erase(Some(&txn), b"k").unwrap();
    // unique insert onto our own erase is legal
    db.insert(Some(&txn), b"k", b"new", InsertFlags::empty()).unwrap();
    txn.commit().unwrap();

    assert_eq!(db.find(None, b"k").unwrap(), b"new");
    env.close(CloseFlags::AUTO_CLEANUP).unwrap();
}

#[test]
fn test_unique_insert_onto_committed_key_fails() {
    let file = temp_file();
    let env = Environment::create(file.path(), txn_options()).unwrap();
    let db = env.create_db(1, DbOptions::default()).unwrap();

    let t1 = env.txn_begin(false).unwrap();
    db.insert(Some(&t1), b"k", b"v", InsertFlags::empty()).unwrap();
    t1.commit().unwrap();

    let t2 = env.txn_begin(false).unwrap();
    assert_eq!(
        db.insert(Some(&t2), b"k", b"w", InsertFlags::empty()),
        Err(HamError::DuplicateKey)
    );
    // overwrite is allowed
    db.insert(Some(&t2), b"k", b"w", InsertFlags::OVERWRITE).unwrap();
    t2.commit().unwrap();

    assert_eq!(db.find(None, b"k").unwrap(), b"w");
    env.close(CloseFlags::AUTO_CLEANUP).unwrap();
}

#[test]
fn test_erase_conflict() {
    let file = temp_file();
    let env = Environment::create(file.path(), txn_options()).unwrap();
    let db = env.create_db(1, DbOptions::default()).unwrap();

    db.insert(None, b"k", b"v", InsertFlags::empty()).unwrap();

    let t1 = env.txn_begin(false).unwrap();
    let t2 = env.txn_begin(false).unwrap();
    db.erase(Some(&t1), b"k").unwrap();

    assert_eq!(db.erase(Some(&t2), b"k"), Err(HamError::TxnConflict));
    t1.abort().unwrap();

    // after the abort the key is writable again
    db.erase(Some(&t2), b"k").unwrap();
    t2.commit().unwrap();
    assert_eq!(db.find(None, b"k"), Err(HamError::KeyNotFound));

    env.close(CloseFlags::AUTO_CLEANUP).unwrap();
}

#[test]
fn test_cursor_sees_pending_ops_of_its_txn() {
    let file = temp_file();
    let env = Environment::create(file.path(), txn_options()).unwrap();
    let db = env.create_db(1, DbOptions::default()).unwrap();

    db.insert(None, b"b", b"2", InsertFlags::empty()).unwrap();

    let txn = env.txn_begin(false).unwrap();
    db.insert(Some(&txn), b"a", b"1", InsertFlags::empty()).unwrap();
    db.insert(Some(&txn), b"c", b"3", InsertFlags::empty()).unwrap();

    {
        let cursor = db.cursor(Some(&txn)).unwrap();
        // the pending insert before the first B-tree key wins the tie
        let (key, record) = cursor.move_to(CursorMove::First).unwrap();
        assert_eq!((key.as_slice(), record.as_slice()), (b"a".as_slice(), b"1".as_slice()));

        let (key, _) = cursor.move_to(CursorMove::Next).unwrap();
        assert_eq!(key, b"b");
        let (key, _) = cursor.move_to(CursorMove::Next).unwrap();
        assert_eq!(key, b"c");
        assert_eq!(
            cursor.move_to(CursorMove::Next).err(),
            Some(HamError::KeyNotFound)
        );
    }

    // a cursor outside the transaction sees only committed state
    let outside = db.cursor(None).unwrap();
    let (key, _) = outside.move_to(CursorMove::First).unwrap();
    assert_eq!(key, b"b");
    assert_eq!(
        outside.move_to(CursorMove::Next).err(),
        Some(HamError::KeyNotFound)
    );
    drop(outside);

    txn.commit().unwrap();
    env.close(CloseFlags::AUTO_CLEANUP).unwrap();
}

#[test]
fn test_cursor_skips_pending_erase() {
    let file = temp_file();
    let env = Environment::create(file.path(), txn_options()).unwrap();
    let db = env.create_db(1, DbOptions::default()).unwrap();

    for key in [b"a", b"b", b"c"] {
        db.insert(None, key, key, InsertFlags::empty()).unwrap();
    }

    let txn = env.txn_begin(false).unwrap();
    db.erase(Some(&txn), b"b").unwrap();

    let cursor = db.cursor(Some(&txn)).unwrap();
    let (key, _) = cursor.move_to(CursorMove::First).unwrap();
    assert_eq!(key, b"a");
    let (key, _) = cursor.move_to(CursorMove::Next).unwrap();
    assert_eq!(key, b"c");
    drop(cursor);

    txn.abort().unwrap();
    env.close(CloseFlags::AUTO_CLEANUP).unwrap();
}

#[test]
fn test_txn_commit_with_open_cursor_fails() {
    let file = temp_file();
    let env = Environment::create(file.path(), txn_options()).unwrap();
    let db = env.create_db(1, DbOptions::default()).unwrap();

    let txn = env.txn_begin(false).unwrap();
    let cursor = db.cursor(Some(&txn)).unwrap();
    db.insert(Some(&txn), b"k", b"v", InsertFlags::empty()).unwrap();

    let result = txn.commit();
    assert_eq!(result, Err(HamError::CursorStillOpen));
    drop(cursor);

    env.close(CloseFlags::TXN_AUTO_COMMIT | CloseFlags::AUTO_CLEANUP)
        .unwrap();
    let file2 = file;

    let env = Environment::open(file2.path(), txn_options()).unwrap();
    let db = env.open_db(1).unwrap();
    // the close committed the transaction
    assert_eq!(db.find(None, b"k").unwrap(), b"v");
    env.close(CloseFlags::AUTO_CLEANUP).unwrap();
}

#[test]
fn test_close_aborts_open_txns_by_default() {
    let file = temp_file();
    let env = Environment::create(file.path(), txn_options()).unwrap();
    let db = env.create_db(1, DbOptions::default()).unwrap();

    db.insert(None, b"keep", b"1", InsertFlags::empty()).unwrap();

    let txn = env.txn_begin(false).unwrap();
    db.insert(Some(&txn), b"gone", b"2", InsertFlags::empty()).unwrap();
    std::mem::forget(txn);

    env.close(CloseFlags::AUTO_CLEANUP).unwrap();

    let env = Environment::open(file.path(), txn_options()).unwrap();
    let db = env.open_db(1).unwrap();
    assert_eq!(db.find(None, b"keep").unwrap(), b"1");
    assert_eq!(db.find(None, b"gone"), Err(HamError::KeyNotFound));
    env.close(CloseFlags::AUTO_CLEANUP).unwrap();
}

#[test]
fn test_duplicates_inside_txn() {
    let file = temp_file();
    let env = Environment::create(file.path(), txn_options()).unwrap();
    let db = env
        .create_db(
            1,
            DbOptions {
                flags: DbFlags::ENABLE_DUPLICATES,
                ..Default::default()
            },
        )
        .unwrap();

    db.insert(None, b"k", b"stored", InsertFlags::DUPLICATE).unwrap();

    let txn = env.txn_begin(false).unwrap();
    db.insert(Some(&txn), b"k", b"pending", InsertFlags::DUPLICATE)
        .unwrap();

    // pending duplicates come first, stored ones after
    let cursor = db.cursor(Some(&txn)).unwrap();
    let (_, record) = cursor.find(b"k", ApproxMode::Exact).unwrap();
    assert_eq!(record, b"pending");
    assert_eq!(cursor.duplicate_count().unwrap(), 2);
    let (_, record) = cursor.move_to(CursorMove::NextDuplicate).unwrap();
    assert_eq!(record, b"stored");
    drop(cursor);

    txn.commit().unwrap();

    let cursor = db.cursor(None).unwrap();
    let (_, first) = cursor.find(b"k", ApproxMode::Exact).unwrap();
    assert_eq!(cursor.duplicate_count().unwrap(), 2);
    assert_eq!(first, b"stored");
    drop(cursor);

    env.close(CloseFlags::AUTO_CLEANUP).unwrap();
}
