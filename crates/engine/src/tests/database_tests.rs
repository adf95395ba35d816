use super::*;
use crate::ops::{DeleteDatabaseArgs, InsertGroupArgs, OpKind, Operation};
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread;
use tempfile::tempdir;
use test_log::test;

// --------------------- Registry ---------------------

#[test]
fn create_and_reopen_database() -> Result<()> {
    let dir = tempdir()?;
    {
        let engine = open(dir.path())?;
        let db = engine.create_database("users", 2)?;
        assert_eq!(db.index_count()?, 2);
        assert_eq!(engine.database_names(), vec!["users".to_string()]);
    }
    let engine = open(dir.path())?;
    let db = engine.database("users")?;
    assert_eq!(db.index_count()?, 2);
    Ok(())
}

#[test]
fn create_existing_database_fails() -> Result<()> {
    let dir = tempdir()?;
    let engine = open(dir.path())?;
    let first = engine.create_database("dup", 1)?;
    let err = engine.create_database("dup", 3).unwrap_err();
    assert_eq!(err.code(), ErrorCode::DbExists);
    // registry untouched
    assert_eq!(engine.database("dup")?.id(), first.id());
    assert_eq!(engine.database("dup")?.index_count()?, 1);
    Ok(())
}

#[test]
fn delete_unknown_database_fails() -> Result<()> {
    let dir = tempdir()?;
    let engine = open(dir.path())?;
    let err = engine.delete_database("ghost").unwrap_err();
    assert_eq!(err.code(), ErrorCode::NoSuchDb);
    assert_eq!(engine.database("ghost").unwrap_err().code(), ErrorCode::NoSuchDb);
    Ok(())
}

#[test]
fn deleted_database_stays_deleted() -> Result<()> {
    let dir = tempdir()?;
    {
        let engine = open(dir.path())?;
        let db = engine.create_database("tmp", 1)?;
        db.put(0, b"k", b"v")?;
        let path = db_path(dir.path(), &db);
        engine.delete_database("tmp")?;
        assert!(!path.exists());
        assert_eq!(db.lookup(0, b"k").unwrap_err().code(), ErrorCode::NoSuchDb);
        assert_eq!(db.put(0, b"k", b"v").unwrap_err().code(), ErrorCode::NoSuchDb);
    }
    let engine = open(dir.path())?;
    assert!(engine.database_names().is_empty());
    // the name is free again and gets a fresh id
    let again = engine.create_database("tmp", 1)?;
    assert_eq!(again.id(), 2);
    assert_eq!(again.lookup(0, b"k")?, None);
    Ok(())
}

#[test]
fn insert_into_unknown_index_rejects_whole_group() -> Result<()> {
    let dir = tempdir()?;
    let engine = open(dir.path())?;
    let db = engine.create_database("db", 2)?;

    let mut group = db.create_insert_group();
    group.insert(0, "a", "1").insert(2, "b", "2");
    let err = db.insert(group).wait().unwrap_err();
    assert_eq!(err.code(), ErrorCode::NoSuchIndex);
    assert_eq!(get(&db, 0, "a")?, None);
    assert_eq!(db.lookup(5, b"a").unwrap_err().code(), ErrorCode::NoSuchIndex);
    Ok(())
}

#[test]
fn oversized_key_is_invalid() -> Result<()> {
    let dir = tempdir()?;
    let engine = open(dir.path())?;
    let db = engine.create_database("db", 1)?;
    let key = vec![b'k'; ops::MAX_KEY_SIZE + 1];
    let err = db.put(0, &key, b"v").unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidArgument);
    Ok(())
}

// --------------------- Inserts and reads ---------------------

#[test]
fn insert_group_applies_atomically() -> Result<()> {
    let dir = tempdir()?;
    let engine = open(dir.path())?;
    let db = engine.create_database("db", 2)?;

    let mut group = db.create_insert_group();
    group
        .insert(0, "a", "1")
        .insert(0, "b", "2")
        .insert(1, "x", "9")
        .delete(0, "a");
    assert_eq!(group.len(), 4);
    let lsn = db.insert(group).wait()?;
    assert!(lsn.is_some());

    assert_eq!(get(&db, 0, "a")?, None);
    assert_eq!(get(&db, 0, "b")?.as_deref(), Some("2"));
    assert_eq!(get(&db, 1, "x")?.as_deref(), Some("9"));
    assert_eq!(get(&db, 1, "b")?, None);
    Ok(())
}

#[test]
fn prefix_and_range_lookups() -> Result<()> {
    let dir = tempdir()?;
    let engine = open(dir.path())?;
    let db = engine.create_database("db", 1)?;
    for key in ["apple", "apricot", "banana", "ap", "b"] {
        db.put(0, key.as_bytes(), key.to_uppercase().as_bytes())?;
    }
    engine.checkpoint()?;
    db.delete(0, b"apricot")?;
    db.put(0, b"apz", b"APZ")?;

    let keys: Vec<Vec<u8>> = db
        .prefix_lookup(0, b"ap")?
        .collect_pairs()?
        .into_iter()
        .map(|(k, _)| k)
        .collect();
    assert_eq!(keys, vec![b"ap".to_vec(), b"apple".to_vec(), b"apz".to_vec()]);

    let pairs = db.range_lookup(0, b"apple", b"b")?.collect_pairs()?;
    assert_eq!(
        pairs,
        vec![
            (b"apple".to_vec(), b"APPLE".to_vec()),
            (b"apz".to_vec(), b"APZ".to_vec()),
        ]
    );
    assert!(db.range_lookup(0, b"z", b"a")?.next().is_none());
    Ok(())
}

#[test]
fn durability_round_trip_without_checkpoint() -> Result<()> {
    let dir = tempdir()?;
    let mut expected = Vec::new();
    {
        let engine = open(dir.path())?;
        let db = engine.create_database("db", 2)?;
        for i in 0..50u32 {
            let mut group = db.create_insert_group();
            let key = format!("key{:03}", i % 20);
            if i % 7 == 3 {
                group.delete(0, key.clone());
            } else {
                group.insert(0, key.clone(), format!("v{}", i));
            }
            group.insert(1, format!("other{}", i), "x");
            db.insert(group).wait()?;
        }
        for i in 0..20u32 {
            let key = format!("key{:03}", i);
            expected.push((key.clone(), get(&db, 0, &key)?));
        }
        // no checkpoint: everything comes back from the log
    }

    let engine = open(dir.path())?;
    let db = engine.database("db")?;
    for (key, value) in &expected {
        assert_eq!(&get(&db, 0, key)?, value, "key {}", key);
    }
    assert_eq!(get(&db, 1, "other49")?.as_deref(), Some("x"));
    Ok(())
}

#[test]
fn lsns_increase_strictly() -> Result<()> {
    let dir = tempdir()?;
    let last;
    {
        let engine = open(dir.path())?;
        let db = engine.create_database("db", 1)?;
        let mut prev = engine.latest_lsn();
        for i in 0..10u8 {
            let mut group = db.create_insert_group();
            group.insert(0, vec![i], vec![i]);
            let lsn = db.insert(group).wait()?.ok_or_else(|| anyhow::anyhow!("no lsn"))?;
            assert!(lsn > prev);
            assert!(lsn.is_successor_of(prev));
            prev = lsn;
        }
        last = prev;
    }
    // the log continues after the replayed entries
    let engine = open(dir.path())?;
    assert_eq!(engine.latest_lsn(), last);
    let db = engine.database("db")?;
    let mut group = db.create_insert_group();
    group.insert(0, "z", "z");
    let lsn = db.insert(group).wait()?.ok_or_else(|| anyhow::anyhow!("no lsn"))?;
    assert!(lsn.is_successor_of(last));
    Ok(())
}

#[test]
fn async_mode_applies_before_durability() -> Result<()> {
    let dir = tempdir()?;
    let engine = Engine::open(config(dir.path()).with_sync_mode(SyncMode::Async))?;
    let db = engine.create_database("db", 1)?;
    let mut group = db.create_insert_group();
    group.insert(0, "k", "v");
    assert_eq!(db.insert(group).wait()?, None);
    assert_eq!(get(&db, 0, "k")?.as_deref(), Some("v"));
    Ok(())
}

// --------------------- Comparators ---------------------

#[test]
fn unknown_comparator_is_rejected() -> Result<()> {
    let dir = tempdir()?;
    let engine = open(dir.path())?;
    let err = engine.create_database_with("db", &["nope"]).unwrap_err();
    assert_eq!(err.code(), ErrorCode::InvalidArgument);
    assert!(engine.database_names().is_empty());
    Ok(())
}

#[test]
fn custom_comparator_orders_index() -> Result<()> {
    let dir = tempdir()?;
    {
        let engine = Engine::builder(config(dir.path()))
            .comparator("reverse", reverse)
            .open()?;
        let db = engine.create_database_with("db", &["reverse", DEFAULT_COMPARATOR_ID])?;
        for key in ["a", "c", "b"] {
            db.put(0, key.as_bytes(), b"1")?;
            db.put(1, key.as_bytes(), b"1")?;
        }
        engine.checkpoint()?;
        let desc: Vec<Vec<u8>> = db
            .range_lookup(0, b"c", b"a")?
            .collect_pairs()?
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(desc, vec![b"c".to_vec(), b"b".to_vec()]);
    }

    // a registered comparator reopens fine
    {
        let engine = Engine::builder(config(dir.path()))
            .comparator("reverse", reverse)
            .open()?;
        assert_eq!(get(&engine.database("db")?, 0, "b")?.as_deref(), Some("1"));
    }

    // without it the config file cannot be loaded
    let err = Engine::open(config(dir.path())).unwrap_err();
    assert_eq!(err.code(), ErrorCode::IoError);
    Ok(())
}

// --------------------- Copy ---------------------

#[test]
fn copy_database_snapshots_source() -> Result<()> {
    let dir = tempdir()?;
    {
        let engine = open(dir.path())?;
        let src = engine.create_database("src", 2)?;
        src.put(0, b"a", b"1")?;
        engine.checkpoint()?;
        src.put(0, b"b", b"2")?;
        src.put(1, b"c", b"3")?;
        src.delete(0, b"a")?;

        let copy = engine.copy_database("src", "dst")?;
        assert_ne!(copy.id(), src.id());
        src.put(0, b"later", b"x")?;

        assert_eq!(get(&copy, 0, "a")?, None);
        assert_eq!(get(&copy, 0, "b")?.as_deref(), Some("2"));
        assert_eq!(get(&copy, 1, "c")?.as_deref(), Some("3"));
        assert_eq!(get(&copy, 0, "later")?, None);

        let err = engine.copy_database("src", "dst").unwrap_err();
        assert_eq!(err.code(), ErrorCode::DbExists);
        let err = engine.copy_database("missing", "other").unwrap_err();
        assert_eq!(err.code(), ErrorCode::NoSuchDb);
        assert_eq!(engine.database("other").unwrap_err().code(), ErrorCode::NoSuchDb);
    }

    let engine = open(dir.path())?;
    let copy = engine.database("dst")?;
    assert_eq!(get(&copy, 0, "b")?.as_deref(), Some("2"));
    assert_eq!(get(&copy, 0, "later")?, None);
    assert_eq!(get(&engine.database("src")?, 0, "later")?.as_deref(), Some("x"));
    Ok(())
}

#[test]
fn create_fails_fast_while_a_copy_holds_the_name() -> Result<()> {
    let dir = tempdir()?;
    let engine = open(dir.path())?;
    let src = engine.create_database("src", 1)?;
    src.put(0, b"k", b"v")?;

    engine.pause();
    let copied = thread::scope(|s| {
        let copy = s.spawn(|| engine.copy_database("src", "dst"));
        let claimed = eventually(Duration::from_secs(5), || {
            engine.core.manager.name_taken("dst")
        });
        let started = Instant::now();
        let created = engine.create_database("dst", 1);
        let waited = started.elapsed();
        engine.resume();
        let copied = copy.join();

        assert!(claimed);
        assert_eq!(created.unwrap_err().code(), ErrorCode::DbExists);
        assert!(waited < Duration::from_secs(1), "create waited {:?}", waited);
        copied
    });
    let dst = copied.map_err(|_| anyhow::anyhow!("copy thread panicked"))??;
    assert_eq!(get(&dst, 0, "k")?.as_deref(), Some("v"));
    assert_eq!(engine.database_names(), vec!["dst".to_string(), "src".to_string()]);
    Ok(())
}

#[test]
fn failed_copy_releases_the_name() -> Result<()> {
    let dir = tempdir()?;
    let engine = open(dir.path())?;
    let err = engine.copy_database("missing", "dst").unwrap_err();
    assert_eq!(err.code(), ErrorCode::NoSuchDb);
    assert!(!engine.core.manager.name_taken("dst"));
    engine.create_database("dst", 1)?;
    Ok(())
}

// --------------------- Workers and pause ---------------------

#[test]
fn full_queue_rejects_with_busy() -> Result<()> {
    let dir = tempdir()?;
    let engine = Engine::open(config(dir.path()).with_workers(1).with_max_queue_len(1))?;
    let db = engine.create_database("db", 1)?;

    engine.pause();
    let futures: Vec<_> = (0..4u8)
        .map(|i| {
            let mut group = db.create_insert_group();
            group.insert(0, vec![i], vec![i]);
            db.insert(group)
        })
        .collect();
    engine.resume();

    let mut busy = 0;
    let mut done = 0;
    for f in futures {
        match f.wait() {
            Ok(_) => done += 1,
            Err(e) => {
                assert_eq!(e.code(), ErrorCode::Busy);
                busy += 1;
            }
        }
    }
    assert!(busy >= 2, "at most two inserts fit the worker and its queue");
    assert_eq!(busy + done, 4);
    Ok(())
}

#[test]
fn pause_blocks_writes_until_resume() -> Result<()> {
    let dir = tempdir()?;
    let engine = open(dir.path())?;
    let db = engine.create_database("db", 1)?;
    db.put(0, b"before", b"1")?;

    let paused_at = engine.pause();
    assert!(engine.is_paused());
    assert_eq!(paused_at, engine.latest_lsn());

    let finished = Arc::new(AtomicBool::new(false));
    let writer = {
        let db = db.clone();
        let finished = Arc::clone(&finished);
        thread::spawn(move || {
            let res = db.put(0, b"after", b"2");
            finished.store(true, Ordering::SeqCst);
            res
        })
    };
    thread::sleep(Duration::from_millis(100));
    assert!(!finished.load(Ordering::SeqCst));
    assert_eq!(engine.latest_lsn(), paused_at);
    // reads go on
    assert_eq!(get(&db, 0, "before")?.as_deref(), Some("1"));

    engine.resume();
    writer
        .join()
        .map_err(|_| anyhow::anyhow!("writer panicked"))??;
    assert!(engine.latest_lsn().is_successor_of(paused_at));
    assert_eq!(get(&db, 0, "after")?.as_deref(), Some("2"));
    Ok(())
}

#[test]
fn shutdown_rejects_new_operations() -> Result<()> {
    let dir = tempdir()?;
    let engine = open(dir.path())?;
    let db = engine.create_database("db", 1)?;
    engine.shutdown()?;
    assert!(db.put(0, b"k", b"v").is_err());
    engine.shutdown()?;
    Ok(())
}

#[test]
fn delete_shares_the_worker_of_its_database() -> Result<()> {
    let dir = tempdir()?;
    let engine = Engine::open(config(dir.path()).with_workers(4))?;
    let db = engine.create_database("db", 1)?;

    let insert = Operation::InsertGroup(InsertGroupArgs {
        db_id: db.id(),
        records: Vec::new(),
    });
    let delete = Operation::DeleteDatabase(DeleteDatabaseArgs {
        name: "db".into(),
        db_id: None,
    });
    let manager = &engine.core.manager;
    assert_eq!(insert.partition_key(manager), delete.partition_key(manager));
    Ok(())
}

#[test]
fn inserts_queued_before_a_delete_complete() -> Result<()> {
    let dir = tempdir()?;
    let engine = Engine::open(config(dir.path()).with_workers(4))?;
    let db = engine.create_database("db", 1)?;

    let futures: Vec<_> = (0..200u32)
        .map(|i| {
            let mut group = db.create_insert_group();
            group.insert(0, i.to_be_bytes(), vec![0u8; 256]);
            db.insert(group)
        })
        .collect();
    engine.delete_database("db")?;
    for f in futures {
        f.wait()?;
    }
    assert_eq!(db.lookup(0, b"k").unwrap_err().code(), ErrorCode::NoSuchDb);
    Ok(())
}

// --------------------- User-defined lookups ---------------------

#[test]
fn user_defined_lookup_sees_queued_inserts() -> Result<()> {
    let dir = tempdir()?;
    let engine = Engine::open(config(dir.path()).with_workers(2))?;
    let db = engine.create_database("db", 1)?;

    let futures: Vec<_> = (0..50u8)
        .map(|i| {
            let mut group = db.create_insert_group();
            group.insert(0, vec![b'k', i], vec![i]);
            db.insert(group)
        })
        .collect();
    let counted = db
        .user_defined_lookup(|db| {
            let mut n = 0;
            for entry in db.prefix_lookup(0, b"k")? {
                entry?;
                n += 1;
            }
            Ok(n)
        })
        .wait()?;
    assert_eq!(counted, 50);
    for f in futures {
        f.wait()?;
    }
    Ok(())
}

#[test]
fn user_defined_lookup_on_deleted_database_fails() -> Result<()> {
    let dir = tempdir()?;
    let engine = open(dir.path())?;
    let db = engine.create_database("db", 1)?;
    engine.delete_database("db")?;
    let err = db.user_defined_lookup(|_| Ok(())).wait().unwrap_err();
    assert_eq!(err.code(), ErrorCode::NoSuchDb);
    Ok(())
}

// --------------------- Transaction listeners ---------------------

#[derive(Default)]
struct Recorder {
    seen: Mutex<Vec<(Option<Lsn>, OpKind)>>,
}

impl TransactionListener for Recorder {
    fn operation_applied(&self, lsn: Option<Lsn>, op: &Operation) {
        self.seen.lock().push((lsn, op.kind()));
    }
}

#[test]
fn listeners_see_applied_operations_until_removed() -> Result<()> {
    let dir = tempdir()?;
    let engine = open(dir.path())?;
    let recorder = Arc::new(Recorder::default());
    let id = engine.add_transaction_listener(recorder.clone());

    let db = engine.create_database("db", 1)?;
    db.put(0, b"k", b"v")?;
    assert!(db.put(5, b"k", b"v").is_err());
    let last = engine.latest_lsn();
    assert!(engine.remove_transaction_listener(id));
    assert!(!engine.remove_transaction_listener(id));
    db.put(0, b"k", b"w")?;

    let seen = recorder.seen.lock().clone();
    assert_eq!(
        seen.iter().map(|(_, kind)| *kind).collect::<Vec<_>>(),
        vec![OpKind::CreateDatabase, OpKind::InsertGroup]
    );
    assert_eq!(seen[1].0, Some(last));
    Ok(())
}
