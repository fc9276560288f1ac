use hamsterdb::{
    ApproxMode, CloseFlags, CursorMove, DbFlags, DbOptions, Environment, HamError, InsertFlags,
    Options,
};
use tempfile::{Builder, NamedTempFile};

fn temp_file() -> NamedTempFile {
    Builder::new()
        .prefix("hamsterdb-")
        .suffix(".db")
        .tempfile()
        .unwrap()
}

#[test]
fn test_cursor_insert_couples_to_entry() {
    let file = temp_file();
    let env = Environment::create(file.path(), Options::default()).unwrap();
    let db = env.create_db(1, DbOptions::default()).unwrap();

    let cursor = db.cursor(None).unwrap();
    assert_eq!(
        cursor.move_to(CursorMove::First).err(),
        Some(HamError::KeyNotFound)
    );

    cursor.insert(b"k", b"v", InsertFlags::empty()).unwrap();
    // the cursor now stands on the fresh entry
    assert_eq!(cursor.record_size().unwrap(), 1);
    assert_eq!(cursor.duplicate_count().unwrap(), 1);

    cursor.overwrite(b"longer-record").unwrap();
    assert_eq!(cursor.record_size().unwrap(), 13);
    assert_eq!(db.find(None, b"k").unwrap(), b"longer-record");

    drop(cursor);
    env.close(CloseFlags::AUTO_CLEANUP).unwrap();
}

#[test]
fn test_cursor_erase_whole_key() {
    let file = temp_file();
    let env = Environment::create(file.path(), Options::default()).unwrap();
    let db = env.create_db(1, DbOptions::default()).unwrap();

    db.insert(None, b"a", b"1", InsertFlags::empty()).unwrap();
    db.insert(None, b"b", b"2", InsertFlags::empty()).unwrap();

    let cursor = db.cursor(None).unwrap();
    cursor.find(b"a", ApproxMode::Exact).unwrap();
    cursor.erase().unwrap();

    // the cursor is nil after the erase
    assert_eq!(cursor.erase().err(), Some(HamError::CursorIsNil));
    assert_eq!(db.find(None, b"a"), Err(HamError::KeyNotFound));
    assert_eq!(db.find(None, b"b").unwrap(), b"2");

    drop(cursor);
    env.close(CloseFlags::AUTO_CLEANUP).unwrap();
}

#[test]
fn test_cursor_clone_keeps_position() {
    let file = temp_file();
    let env = Environment::create(file.path(), Options::default()).unwrap();
    let db = env.create_db(1, DbOptions::default()).unwrap();

    for key in [b"a", b"b", b"c"] {
        db.insert(None, key, key, InsertFlags::empty()).unwrap();
    }

    let cursor = db.cursor(None).unwrap();
    cursor.find(b"b", ApproxMode::Exact).unwrap();

    let clone = cursor.try_clone().unwrap();
    let (key, _) = clone.move_to(CursorMove::Next).unwrap();
    assert_eq!(key, b"c");

    // the original cursor did not move
    let (key, _) = cursor.move_to(CursorMove::Next).unwrap();
    assert_eq!(key, b"c");

    drop(clone);
    drop(cursor);
    env.close(CloseFlags::AUTO_CLEANUP).unwrap();
}

#[test]
fn test_cursor_duplicate_positions() {
    let file = temp_file();
    let env = Environment::create(file.path(), Options::default()).unwrap();
    let db = env
        .create_db(
            1,
            DbOptions {
                flags: DbFlags::ENABLE_DUPLICATES,
                ..Default::default()
            },
        )
        .unwrap();

    let cursor = db.cursor(None).unwrap();
    cursor.insert(b"k", b"b", InsertFlags::DUPLICATE).unwrap();
    cursor.insert(b"k", b"d", InsertFlags::DUPLICATE).unwrap();
    // insert before the current duplicate (d)
    cursor
        .insert(b"k", b"a", InsertFlags::DUPLICATE | InsertFlags::DUPLICATE_INSERT_FIRST)
        .unwrap();

    let (_, record) = cursor.find(b"k", ApproxMode::Exact).unwrap();
    assert_eq!(record, b"a");
    let (_, record) = cursor.move_to(CursorMove::NextDuplicate).unwrap();
    assert_eq!(record, b"b");
    let (_, record) = cursor.move_to(CursorMove::NextDuplicate).unwrap();
    assert_eq!(record, b"d");

    // and backwards within the same key
    let (_, record) = cursor.move_to(CursorMove::PreviousDuplicate).unwrap();
    assert_eq!(record, b"b");

    assert_eq!(cursor.duplicate_count().unwrap(), 3);

    drop(cursor);
    env.close(CloseFlags::AUTO_CLEANUP).unwrap();
}

#[test]
fn test_cursor_record_size_of_blob_record() {
    let file = temp_file();
    let env = Environment::create(file.path(), Options::default()).unwrap();
    let db = env.create_db(1, DbOptions::default()).unwrap();

    let record = vec![3u8; 100_000];
    db.insert(None, b"big", &record, InsertFlags::empty()).unwrap();

    let cursor = db.cursor(None).unwrap();
    cursor.find(b"big", ApproxMode::Exact).unwrap();
    assert_eq!(cursor.record_size().unwrap(), 100_000);

    drop(cursor);
    env.close(CloseFlags::AUTO_CLEANUP).unwrap();
}
