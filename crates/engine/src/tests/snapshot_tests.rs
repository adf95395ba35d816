use super::*;
use tempfile::tempdir;

fn keys(iter: RangeIter) -> Result<Vec<String>> {
    Ok(iter
        .collect_pairs()?
        .into_iter()
        .map(|(k, _)| String::from_utf8_lossy(&k).into_owned())
        .collect())
}

fn fill(db: &Database, index: usize, pairs: &[(&str, &str)]) -> Result<()> {
    let mut group = db.create_insert_group();
    for (k, v) in pairs {
        group.insert(index, *k, *v);
    }
    db.insert(group).wait()?;
    Ok(())
}

#[test]
fn snapshot_is_isolated_from_later_writes() -> Result<()> {
    let dir = tempdir()?;
    let engine = open(dir.path())?;
    let db = engine.create_database("db", 1)?;
    fill(&db, 0, &[("Key1", "v1"), ("Key2", "v2"), ("Key3", "v3")])?;

    engine.create_snapshot("db", SnapshotConfig::new("s1", [0]))?;
    fill(&db, 0, &[("Key1", "x"), ("Key2", "x"), ("Key3", "x")])?;
    db.put(0, b"Key4", b"x")?;

    let snap = engine.snapshot("db", "s1")?;
    assert_eq!(snap.lookup(0, b"Key1")?, Some(b"v1".to_vec()));
    assert_eq!(snap.lookup(0, b"Key3")?, Some(b"v3".to_vec()));
    assert_eq!(snap.lookup(0, b"Key4")?, None);
    assert_eq!(keys(snap.prefix_lookup(0, b"Key")?)?, vec!["Key1", "Key2", "Key3"]);
    assert_eq!(get(&db, 0, "Key2")?.as_deref(), Some("x"));

    // a checkpoint rewrites the live tree but not the snapshot
    engine.checkpoint()?;
    let snap = engine.snapshot("db", "s1")?;
    assert_eq!(snap.lookup(0, b"Key2")?, Some(b"v2".to_vec()));
    assert_eq!(get(&db, 0, "Key2")?.as_deref(), Some("x"));
    Ok(())
}

#[test]
fn snapshot_survives_restart() -> Result<()> {
    let dir = tempdir()?;
    {
        let engine = open(dir.path())?;
        let db = engine.create_database("db", 1)?;
        fill(&db, 0, &[("a", "1"), ("b", "2")])?;
        engine.checkpoint()?;
        db.put(0, b"c", b"3")?;
        engine.create_snapshot("db", SnapshotConfig::new("snap", [0]))?;
        db.delete(0, b"a")?;
    }
    let engine = open(dir.path())?;
    assert_eq!(engine.snapshot_names("db")?, vec!["snap".to_string()]);
    let snap = engine.snapshot("db", "snap")?;
    assert_eq!(keys(snap.prefix_lookup(0, b"")?)?, vec!["a", "b", "c"]);
    assert_eq!(get(&engine.database("db")?, 0, "a")?, None);
    Ok(())
}

#[test]
fn partial_snapshot_applies_filters() -> Result<()> {
    let dir = tempdir()?;
    let engine = open(dir.path())?;
    let db = engine.create_database("db", 4)?;
    for index in [0, 1, 3] {
        fill(
            &db,
            index,
            &[("testxyz", "1"), ("test", "2"), ("testabc", "3"), ("yagga", "4")],
        )?;
    }

    let filter = KeyFilter::new().prefix("test").exclude("testabc");
    let config = SnapshotConfig::new("partial", [0, 3]).with_filter(0, filter);
    engine.create_snapshot("db", config)?;
    let snap = engine.snapshot("db", "partial")?;

    assert_eq!(keys(snap.prefix_lookup(0, b"")?)?, vec!["test", "testxyz"]);
    assert_eq!(snap.lookup(0, b"testabc")?, None);
    assert_eq!(snap.lookup(0, b"yagga")?, None);
    assert_eq!(snap.lookup(0, b"testxyz")?, Some(b"1".to_vec()));

    // index 3 has no filter
    assert_eq!(
        keys(snap.prefix_lookup(3, b"")?)?,
        vec!["test", "testabc", "testxyz", "yagga"]
    );

    let err = snap.lookup(1, b"test").unwrap_err();
    assert_eq!(err.code(), ErrorCode::NoSuchIndex);
    assert!(snap.prefix_lookup(2, b"").is_err());
    Ok(())
}

#[test]
fn snapshot_errors() -> Result<()> {
    let dir = tempdir()?;
    let engine = open(dir.path())?;
    engine.create_database("db", 2)?;

    engine.create_snapshot("db", SnapshotConfig::new("s", [0]))?;
    let err = engine
        .create_snapshot("db", SnapshotConfig::new("s", [1]))
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::SnapshotExists);

    let err = engine
        .create_snapshot("db", SnapshotConfig::new("other", [0, 7]))
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::NoSuchIndex);
    assert_eq!(
        engine.snapshot("db", "other").unwrap_err().code(),
        ErrorCode::NoSuchSnapshot
    );

    for bad in ["", "..", "a/b"] {
        let err = engine
            .create_snapshot("db", SnapshotConfig::new(bad, [0]))
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidArgument, "name {:?}", bad);
    }
    let err = engine
        .create_snapshot("db", SnapshotConfig::new("none", Vec::<usize>::new()))
        .unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidArgument);

    let err = engine.delete_snapshot("db", "missing").unwrap_err();
    assert_eq!(err.code(), ErrorCode::NoSuchSnapshot);
    let err = engine.create_snapshot("nodb", SnapshotConfig::new("s", [0])).unwrap_err();
    assert_eq!(err.code(), ErrorCode::NoSuchDb);
    Ok(())
}

#[test]
fn deleted_snapshot_stays_deleted() -> Result<()> {
    let dir = tempdir()?;
    let snap_dir;
    {
        let engine = open(dir.path())?;
        let db = engine.create_database("db", 1)?;
        db.put(0, b"k", b"v")?;
        engine.create_snapshot("db", SnapshotConfig::new("gone", [0]))?;
        engine.create_snapshot("db", SnapshotConfig::new("kept", [0]))?;
        snap_dir = db_path(dir.path(), &db).join("snapshots").join("gone");
        assert!(snap_dir.exists());

        engine.delete_snapshot("db", "gone")?;
        assert!(!snap_dir.exists());
        assert_eq!(engine.snapshot_names("db")?, vec!["kept".to_string()]);
    }
    // replaying the log must not bring it back
    let engine = open(dir.path())?;
    assert_eq!(engine.snapshot_names("db")?, vec!["kept".to_string()]);
    assert_eq!(
        engine.snapshot("db", "gone").unwrap_err().code(),
        ErrorCode::NoSuchSnapshot
    );
    assert!(!snap_dir.exists());
    Ok(())
}

#[test]
fn snapshot_keeps_runs_alive_through_compaction() -> Result<()> {
    let dir = tempdir()?;
    let engine = Engine::open(config(dir.path()).with_compaction_trigger(2))?;
    let db = engine.create_database("db", 1)?;

    db.put(0, b"a", b"old")?;
    engine.checkpoint()?;
    engine.create_snapshot("db", SnapshotConfig::new("pin", [0]))?;

    for round in 0..4u8 {
        db.put(0, b"a", format!("new{}", round).as_bytes())?;
        db.put(0, &[b'k', round], b"x")?;
        engine.checkpoint()?;
    }
    let path = db_path(dir.path(), &db);
    assert!(count_runs(&path)? <= 2);

    let snap = engine.snapshot("db", "pin")?;
    assert_eq!(snap.lookup(0, b"a")?, Some(b"old".to_vec()));
    assert_eq!(get(&db, 0, "a")?.as_deref(), Some("new3"));

    // after deleting the snapshot its runs are collected
    drop(snap);
    engine.delete_snapshot("db", "pin")?;
    engine.checkpoint()?;
    assert_eq!(get(&db, 0, "a")?.as_deref(), Some("new3"));
    Ok(())
}
