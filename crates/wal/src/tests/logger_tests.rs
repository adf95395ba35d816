use crate::*;
use anyhow::Result;
use config::SyncMode;
use parking_lot::Mutex;
use std::sync::Arc;
use tempfile::tempdir;
use test_log::test;

fn replayed(dir: &std::path::Path) -> Result<Vec<LogEntry>> {
    Ok(LogReplay::open(dir)?.collect::<crate::Result<_>>()?)
}

#[test]
fn appends_get_consecutive_lsns() -> Result<()> {
    let dir = tempdir()?;
    let logger = DiskLogger::open(dir.path(), Lsn::ORIGIN, SyncMode::SyncWrite)?;

    let futures: Vec<_> = (0..5).map(|i| logger.append(vec![i])).collect();
    let lsns: Vec<Lsn> = futures
        .into_iter()
        .map(|f| f.wait())
        .collect::<crate::Result<_>>()?;

    assert_eq!(lsns, (1..=5).map(|s| Lsn::new(1, s)).collect::<Vec<_>>());
    assert_eq!(logger.latest_lsn(), Lsn::new(1, 5));
    logger.shutdown()?;

    let entries = replayed(dir.path())?;
    assert_eq!(entries.len(), 5);
    assert_eq!(entries[3].payload, vec![3]);
    Ok(())
}

#[test]
fn switch_returns_last_written_and_opens_next_segment() -> Result<()> {
    let dir = tempdir()?;
    let logger = DiskLogger::open(dir.path(), Lsn::ORIGIN, SyncMode::SyncWrite)?;
    logger.append(b"a".to_vec()).wait()?;
    logger.append(b"b".to_vec()).wait()?;

    let last = {
        let mut lock = logger.lock();
        assert_eq!(logger.state(), LoggerState::LockedForRotation);
        lock.switch_log_file(false)?
    };
    assert_eq!(last, Lsn::new(1, 2));
    assert_eq!(logger.state(), LoggerState::Running);

    assert_eq!(logger.append(b"c".to_vec()).wait()?, Lsn::new(1, 3));
    assert!(dir.path().join("1.3.log").exists());
    Ok(())
}

#[test]
fn switching_an_empty_segment_is_a_no_op() -> Result<()> {
    let dir = tempdir()?;
    let logger = DiskLogger::open(dir.path(), Lsn::new(1, 4), SyncMode::SyncWrite)?;
    let last = logger.lock().switch_log_file(false)?;
    assert_eq!(last, Lsn::new(1, 4));
    assert_eq!(list_segments(dir.path())?.len(), 1);
    Ok(())
}

#[test]
fn view_increment_restarts_sequence() -> Result<()> {
    let dir = tempdir()?;
    let logger = DiskLogger::open(dir.path(), Lsn::ORIGIN, SyncMode::SyncWrite)?;
    logger.append(b"a".to_vec()).wait()?;

    let last = logger.lock().switch_log_file(true)?;
    assert_eq!(last, Lsn::new(1, 1));
    assert_eq!(logger.append(b"b".to_vec()).wait()?, Lsn::new(2, 1));
    assert!(dir.path().join("2.1.log").exists());

    // even with an empty segment a new view is never reused
    let last = logger.lock().switch_log_file(true)?;
    assert_eq!(last, Lsn::new(2, 1));
    logger.lock().switch_log_file(true)?;
    assert_eq!(logger.append(b"c".to_vec()).wait()?, Lsn::new(4, 1));
    Ok(())
}

#[test]
fn explicit_lsn_must_move_forward() -> Result<()> {
    let dir = tempdir()?;
    let logger = DiskLogger::open(dir.path(), Lsn::ORIGIN, SyncMode::FDataSync)?;
    assert_eq!(logger.append_at(Lsn::new(1, 7), vec![]).wait()?, Lsn::new(1, 7));
    let err = logger.append_at(Lsn::new(1, 7), vec![]).wait().unwrap_err();
    assert!(matches!(err, LogError::OutOfOrder { .. }));
    // the local counter continues after the replicated entry
    assert_eq!(logger.append(vec![]).wait()?, Lsn::new(1, 8));
    Ok(())
}

#[test]
fn pseudo_sync_acknowledges_and_persists() -> Result<()> {
    let dir = tempdir()?;
    {
        let logger = DiskLogger::open(
            dir.path(),
            Lsn::ORIGIN,
            SyncMode::PseudoSync { wait_ms: 5 },
        )?;
        for i in 0..20u8 {
            logger.append(vec![i]).wait()?;
        }
        logger.shutdown()?;
    }
    assert_eq!(replayed(dir.path())?.len(), 20);
    Ok(())
}

#[test]
fn append_after_shutdown_is_rejected() -> Result<()> {
    let dir = tempdir()?;
    let logger = DiskLogger::open(dir.path(), Lsn::ORIGIN, SyncMode::Async)?;
    logger.shutdown()?;
    assert_eq!(logger.state(), LoggerState::Stopped);
    assert!(matches!(
        logger.append(vec![1]).wait(),
        Err(LogError::ShutDown)
    ));
    // second shutdown is harmless
    logger.shutdown()?;
    Ok(())
}

#[test]
fn listener_sees_entries_in_order() -> Result<()> {
    let dir = tempdir()?;
    let logger = DiskLogger::open(dir.path(), Lsn::ORIGIN, SyncMode::SyncWrite)?;
    let seen = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&seen);
    logger.set_listener(Some(Arc::new(move |e: &LogEntry| sink.lock().push(e.lsn))));

    let futures: Vec<_> = (0..10).map(|_| logger.append(vec![])).collect();
    for f in futures {
        f.wait()?;
    }
    let seen = seen.lock().clone();
    assert_eq!(seen, (1..=10).map(|s| Lsn::new(1, s)).collect::<Vec<_>>());
    Ok(())
}

#[test]
fn reset_discards_history() -> Result<()> {
    let dir = tempdir()?;
    let logger = DiskLogger::open(dir.path(), Lsn::ORIGIN, SyncMode::SyncWrite)?;
    logger.append(b"old".to_vec()).wait()?;
    logger.lock().reset(Lsn::new(3, 40))?;

    assert_eq!(logger.append(b"new".to_vec()).wait()?, Lsn::new(3, 41));
    let entries = replayed(dir.path())?;
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].payload, b"new");
    Ok(())
}
