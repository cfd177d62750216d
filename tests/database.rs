use zdb::{Database, Error, Mode, Options};

fn open_fresh(path: &std::path::Path, options: Options) -> Database {
    Database::open_with_options(path, Mode::CreateIfMissing, options).unwrap()
}

fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

#[test]
fn create_series_then_write_and_read_back() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("series.zdb");

    let db = open_fresh(&path, Options::default());
    db.create_series(1, 8).unwrap();

    let mut txn = db.begin(1, false).unwrap();
    {
        let mut cursor = txn.cursor();
        for i in 0..50u64 {
            cursor.append(i * 10, &i.to_le_bytes()).unwrap();
        }
    }
    txn.commit().unwrap();

    let mut txn = db.begin(1, true).unwrap();
    let mut cursor = txn.cursor();
    assert!(cursor.seek_to_first().unwrap());

    let mut count = 0u64;
    loop {
        let (ts, value) = cursor.get().unwrap();
        assert_eq!(ts, count * 10);
        assert_eq!(u64::from_le_bytes(value.try_into().unwrap()), count);
        count += 1;
        if !cursor.next().unwrap() {
            break;
        }
    }
    assert_eq!(count, 50);
}

#[test]
fn page_splits_when_soft_cap_is_exceeded() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("split.zdb");

    let options = Options {
        page_soft_cap_bytes: 128,
        ..Options::default()
    };
    let db = open_fresh(&path, options);
    db.create_series(1, 8).unwrap();

    let mut txn = db.begin(1, false).unwrap();
    {
        let mut cursor = txn.cursor();
        for i in 0..100u64 {
            cursor.append(i, &i.to_le_bytes()).unwrap();
        }
    }
    txn.commit().unwrap();

    let mut txn = db.begin(1, true).unwrap();
    let mut cursor = txn.cursor();
    assert!(cursor.seek_to(57).unwrap());
    let (ts, _) = cursor.get().unwrap();
    assert_eq!(ts, 57);
}

#[test]
fn reopen_recovers_committed_data() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("recover.zdb");

    {
        let db = open_fresh(&path, Options::default());
        db.create_series(7, 4).unwrap();

        let mut txn = db.begin(7, false).unwrap();
        {
            let mut cursor = txn.cursor();
            cursor.append(1, &[1, 2, 3, 4]).unwrap();
            cursor.append(2, &[5, 6, 7, 8]).unwrap();
        }
        txn.commit().unwrap();
    }

    let db = Database::open(&path, Mode::ReadOnly).unwrap();
    let mut txn = db.begin(7, true).unwrap();
    let mut cursor = txn.cursor();
    assert!(cursor.seek_to_first().unwrap());

    let (ts, value) = cursor.get().unwrap();
    assert_eq!(ts, 1);
    assert_eq!(value, vec![1, 2, 3, 4]);

    assert!(cursor.next().unwrap());
    let (ts, value) = cursor.get().unwrap();
    assert_eq!(ts, 2);
    assert_eq!(value, vec![5, 6, 7, 8]);

    assert!(!cursor.next().unwrap());
}

#[test]
fn create_series_twice_fails() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("dup.zdb");

    let db = open_fresh(&path, Options::default());
    db.create_series(1, 8).unwrap();

    match db.create_series(1, 8) {
        Err(Error::AlreadyExists(_)) => {}
        other => panic!("expected AlreadyExists, got {:?}", other),
    }
}

#[test]
fn begin_on_unknown_series_fails() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("unknown.zdb");

    let db = open_fresh(&path, Options::default());
    match db.begin(42, true) {
        Err(Error::NotFound(_)) => {}
        other => panic!("expected NotFound, got {:?}", other),
    }
}

#[test]
fn second_writer_is_rejected_while_first_is_active() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("busy.zdb");

    let db = open_fresh(&path, Options::default());
    db.create_series(1, 8).unwrap();

    let _first = db.begin(1, false).unwrap();
    match db.begin(1, false) {
        Err(Error::Busy(_)) => {}
        other => panic!("expected Busy, got {:?}", other),
    }
}

#[test]
fn aborted_transaction_releases_the_writer_slot() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("abort.zdb");

    let db = open_fresh(&path, Options::default());
    db.create_series(1, 8).unwrap();

    let mut txn = db.begin(1, false).unwrap();
    txn.cursor().append(0, &[0u8; 8]).unwrap();
    txn.abort();

    let txn = db.begin(1, false).unwrap();
    txn.abort();
}

/// An aborted mutation must never surface through a later, unrelated commit
/// to the same series.
#[test]
fn aborted_mutation_does_not_resurface_in_a_later_commit() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("abort_no_resurface.zdb");

    let db = open_fresh(&path, Options::default());
    db.create_series(1, 4).unwrap();

    let mut txn = db.begin(1, false).unwrap();
    {
        let mut cursor = txn.cursor();
        cursor.append(10, &[1, 1, 1, 1]).unwrap();
    }
    txn.commit().unwrap();

    // Mutate the committed sample, then abandon the change.
    let mut txn = db.begin(1, false).unwrap();
    {
        let mut cursor = txn.cursor();
        cursor.seek_to(10).unwrap();
        cursor.update(&[9, 9, 9, 9]).unwrap();
    }
    txn.abort();

    // An unrelated writer touches the series without ever seeing the
    // aborted mutation.
    let mut txn = db.begin(1, false).unwrap();
    txn.cursor().append(20, &[2, 2, 2, 2]).unwrap();
    txn.commit().unwrap();

    let mut txn = db.begin(1, true).unwrap();
    let mut cursor = txn.cursor();
    cursor.seek_to(10).unwrap();
    let (ts, value) = cursor.get().unwrap();
    assert_eq!(ts, 10);
    assert_eq!(value, vec![1, 1, 1, 1], "aborted update must not have been flushed");
}

#[test]
fn update_replaces_value_not_timestamp() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("update.zdb");

    let db = open_fresh(&path, Options::default());
    db.create_series(1, 4).unwrap();

    let mut txn = db.begin(1, false).unwrap();
    {
        let mut cursor = txn.cursor();
        cursor.append(10, &[1, 1, 1, 1]).unwrap();
        cursor.append(20, &[2, 2, 2, 2]).unwrap();
    }
    txn.commit().unwrap();

    let mut txn = db.begin(1, false).unwrap();
    {
        let mut cursor = txn.cursor();
        cursor.seek_to(10).unwrap();
        cursor.update(&[9, 9, 9, 9]).unwrap();
    }
    txn.commit().unwrap();

    let mut txn = db.begin(1, true).unwrap();
    let mut cursor = txn.cursor();
    cursor.seek_to(10).unwrap();
    let (ts, value) = cursor.get().unwrap();
    assert_eq!(ts, 10);
    assert_eq!(value, vec![9, 9, 9, 9]);
}

/// A readonly transaction opened before a writer commits must keep seeing
/// the pre-mutation value; only transactions begun after commit see the
/// update.
#[test]
fn uncommitted_update_is_invisible_to_a_concurrent_reader() {
    init_logging();
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("visibility.zdb");

    let db = open_fresh(&path, Options::default());
    db.create_series(1, 4).unwrap();

    let mut txn = db.begin(1, false).unwrap();
    {
        let mut cursor = txn.cursor();
        cursor.append(10, &[6, 6, 9, 0]).unwrap();
    }
    txn.commit().unwrap();

    let mut writer = db.begin(1, false).unwrap();
    {
        let mut cursor = writer.cursor();
        cursor.seek_to(10).unwrap();
        cursor.update(&[1, 2, 3, 4]).unwrap();
    }

    // Opened while the writer above is still uncommitted.
    let mut before_commit = db.begin(1, true).unwrap();
    let (ts, value) = {
        let mut cursor = before_commit.cursor();
        cursor.seek_to(10).unwrap();
        cursor.get().unwrap()
    };
    assert_eq!(ts, 10);
    assert_eq!(value, vec![6, 6, 9, 0], "reader must not see the writer's uncommitted mutation");
    before_commit.abort();

    writer.commit().unwrap();

    let mut after_commit = db.begin(1, true).unwrap();
    let mut cursor = after_commit.cursor();
    cursor.seek_to(10).unwrap();
    let (ts, value) = cursor.get().unwrap();
    assert_eq!(ts, 10);
    assert_eq!(value, vec![1, 2, 3, 4]);
}
