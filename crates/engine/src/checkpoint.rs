//! Checkpoints: freeze the overlays, rotate the log, flush, prune the log.
//!
//! Only the freeze and the rotation happen under the overlay switch and the
//! logger lock. Flushing runs unlocked; log segments are deleted only after
//! every database flushed successfully.

use crossbeam_channel::{bounded, RecvTimeoutError, Sender};
use log::{debug, error, info};
use parking_lot::Mutex;
use std::fs;
use std::path::Path;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};
use std::time::{Duration, Instant};
use wal::{LoggerState, Lsn};

use crate::database::LsmDatabase;
use crate::db_config::CONFIG_FILENAME;
use crate::pipeline::EngineCore;
use crate::replication::service::state_files;
use crate::{Error, Result};

const POLL_INTERVAL: Duration = Duration::from_millis(500);

impl EngineCore {
    /// Runs one checkpoint. With `increment_view` the log continues in a
    /// new view, as required when a node becomes master.
    ///
    /// Returns the LSN of the last entry now reflected on disk.
    pub fn checkpoint(&self, increment_view: bool) -> Result<Lsn> {
        let _ckpt = self.checkpoint_lock.lock();
        self.checkpoint_locked(increment_view)
    }

    /// [`checkpoint`](Self::checkpoint) for a caller already holding
    /// `checkpoint_lock`.
    pub(crate) fn checkpoint_locked(&self, increment_view: bool) -> Result<Lsn> {
        self.check_healthy()?;

        let (pinned, last) = {
            let _switch = self.overlay_switch.write();
            let mut log = self.logger.lock();
            let pinned: Vec<(Arc<LsmDatabase>, Vec<u64>)> = self
                .manager
                .databases()
                .into_iter()
                .map(|db| {
                    let ids = db.create_snapshot();
                    (db, ids)
                })
                .collect();
            match log.switch_log_file(increment_view) {
                Ok(last) => (pinned, last),
                Err(e) => {
                    for (db, ids) in &pinned {
                        db.release_snapshot(ids);
                    }
                    return Err(e.into());
                }
            }
        };

        let mut remaining = pinned.into_iter();
        while let Some((db, ids)) = remaining.next() {
            let flushed = db
                .write_snapshot(&ids, last)
                .and_then(|runs| db.cleanup_snapshot(&ids, runs));
            if let Err(e) = flushed {
                db.release_snapshot(&ids);
                for (db, ids) in remaining {
                    db.release_snapshot(&ids);
                }
                error!("checkpoint of database '{}' failed: {}", db.name(), e);
                return Err(e);
            }
        }

        let pruned = wal::delete_segments_up_to(self.logger.dir(), last)?;
        info!(
            "checkpoint complete at {} ({} log segments pruned{})",
            last,
            pruned,
            if increment_view { ", new view" } else { "" }
        );
        Ok(last)
    }

    /// Checkpoints, then copies the registry and the files of every
    /// database to `dest`, which opens as an engine of its own.
    pub fn dump(&self, dest: &Path) -> Result<Lsn> {
        if dest.join(CONFIG_FILENAME).exists() {
            return Err(Error::InvalidArgument(format!(
                "{} already holds databases",
                dest.display()
            )));
        }
        let _ckpt = self.checkpoint_lock.lock();
        let lsn = self.checkpoint_locked(false)?;
        let base = self.manager.base_dir();
        let files = state_files(base)?;
        fs::create_dir_all(dest)?;
        let mut bytes = 0;
        for file in &files {
            let to = dest.join(&file.name);
            if let Some(parent) = to.parent() {
                fs::create_dir_all(parent)?;
            }
            bytes += fs::copy(base.join(&file.name), &to)?;
        }
        info!(
            "dumped {} files ({} bytes) at {} to {}",
            files.len(),
            bytes,
            lsn,
            dest.display()
        );
        Ok(lsn)
    }
}

/// Background thread running checkpoints when the active log segment grows
/// past `max_log_size` or `checkpoint_interval` has elapsed.
pub(crate) struct Checkpointer {
    stop: Mutex<Option<Sender<()>>>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl Checkpointer {
    pub fn disabled() -> Self {
        Self {
            stop: Mutex::new(None),
            handle: Mutex::new(None),
        }
    }

    /// Starts the thread, or returns a disabled checkpointer when neither
    /// trigger is configured.
    pub fn start(core: Weak<EngineCore>, interval: Option<Duration>, max_log_size: u64) -> Result<Self> {
        if interval.is_none() && max_log_size == 0 {
            return Ok(Self::disabled());
        }
        let (tx, rx) = bounded::<()>(1);
        let poll = interval.map_or(POLL_INTERVAL, |i| i.min(POLL_INTERVAL));
        let handle = thread::Builder::new()
            .name("tidedb-checkpointer".into())
            .spawn(move || {
                let mut last = Instant::now();
                loop {
                    match rx.recv_timeout(poll) {
                        Err(RecvTimeoutError::Timeout) => {}
                        Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                    }
                    let Some(core) = core.upgrade() else { break };
                    if matches!(
                        core.logger.state(),
                        LoggerState::ShuttingDown | LoggerState::Stopped
                    ) {
                        break;
                    }
                    let due = interval.map_or(false, |i| last.elapsed() >= i)
                        || (max_log_size > 0 && core.logger.segment_size() >= max_log_size);
                    if !due {
                        continue;
                    }
                    if let Err(e) = core.checkpoint(false) {
                        error!("background checkpoint failed: {}", e);
                    }
                    last = Instant::now();
                }
                debug!("checkpointer stopped");
            })?;
        Ok(Self {
            stop: Mutex::new(Some(tx)),
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Waits for a running checkpoint to finish and stops the thread.
    pub fn shutdown(&self) {
        if let Some(tx) = self.stop.lock().take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.lock().take() {
            let _ = handle.join();
        }
    }
}
