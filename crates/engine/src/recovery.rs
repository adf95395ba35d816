//! Startup recovery: replays the write-ahead log into the databases loaded
//! from disk and works out where the log continues.
//!
//! Entries are read in LSN order across all segments and run through the
//! same `before`/`after` stages as a live call. Entries already reflected on
//! disk (by a checkpoint or by a persisted metadata change) are skipped.

use config::SyncMode;
use log::{info, warn};
use std::fs;
use std::path::Path;
use wal::{list_segments, LogReplay, Lsn};

use crate::manager::DatabaseManager;
use crate::ops::{Mode, Operation, Prepared, StageContext};
use crate::replication::slave::{remove_state, LOAD_DIR, LOAD_MARKER};
use crate::Result;

/// Wipes the databases and the log when a load from the master was cut
/// short. The node then starts empty and a slave loads again from its
/// master. Returns true when something was discarded.
pub(crate) fn discard_interrupted_load(base_dir: &Path, log_dir: &Path) -> Result<bool> {
    let marker = base_dir.join(LOAD_MARKER);
    if !marker.exists() {
        return Ok(false);
    }
    warn!(
        "{} holds a partial load from the master; discarding the local state",
        base_dir.display()
    );
    remove_state(base_dir)?;
    let staging = base_dir.join(LOAD_DIR);
    if staging.exists() {
        fs::remove_dir_all(&staging)?;
    }
    if log_dir.exists() {
        for (_, path) in list_segments(log_dir)? {
            fs::remove_file(path)?;
        }
    }
    fs::remove_file(&marker)?;
    Ok(true)
}

pub(crate) fn replay_log(
    manager: &DatabaseManager,
    log_dir: &Path,
    sync_mode: SyncMode,
) -> Result<Lsn> {
    let mut last = Lsn::ORIGIN;
    for db in manager.databases() {
        last = last.max(db.ondisk_lsn());
    }
    // an empty segment left by a rotation still fixes where the log goes on
    for (first, _) in list_segments(log_dir)? {
        if first.sequence_no > 0 {
            last = last.max(Lsn::new(first.view_id, first.sequence_no - 1));
        }
    }

    let mut applied = 0;
    let mut skipped = 0;
    for entry in LogReplay::open(log_dir)? {
        let entry = entry?;
        let mut op = Operation::decode(&entry.payload)?;
        let ctx = StageContext {
            manager,
            mode: Mode::Replay(entry.lsn),
            sync_mode,
        };
        match op.before(&ctx)? {
            Prepared::Skipped => skipped += 1,
            prepared => {
                op.after(&ctx, &prepared);
                applied += 1;
            }
        }
        last = last.max(entry.lsn);
    }

    info!(
        "log replay: {} entries applied, {} skipped, continuing after {}",
        applied, skipped, last
    );
    Ok(last)
}
