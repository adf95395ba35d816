//! Slave side: applying pushed entries and catching up with the master.

use crossbeam_channel::{bounded, RecvTimeoutError};
use log::{debug, info, warn};
use std::fs::{self, File};
use std::io::Write;
use std::path::{Component, Path};
use std::sync::{Arc, Weak};
use std::thread;
use std::time::Duration;
use wal::{LogEntry, Lsn};

use super::{Heartbeat, MasterClient, ReplicationFacade, SyncStatus};
use crate::pipeline::EngineCore;
use crate::db_config::CONFIG_FILENAME;
use crate::manager::is_db_dir_name;
use crate::{Error, Result};

/// Staging directory for a full load, under the base directory.
pub(crate) const LOAD_DIR: &str = ".load";
/// Present under the base directory while a load replaces the local state.
pub(crate) const LOAD_MARKER: &str = ".load-in-progress";

impl ReplicationFacade {
    /// `REPLICATE`: an entry pushed by the master.
    pub fn handle_replicate(&self, entry: LogEntry) -> Result<()> {
        if !self.core.replication.is_slave() {
            return Err(Error::Replication(format!(
                "'{}' is not a slave",
                self.config.local_address
            )));
        }
        if self.core.is_paused() {
            return Err(Error::Replication(format!("paused; refusing {}", entry.lsn)));
        }
        let _slave = self.slave_lock.lock();
        let latest = self.core.logger.latest_lsn();
        if entry.lsn <= latest {
            debug!("ignoring {} already applied (at {})", entry.lsn, latest);
            return Ok(());
        }
        if entry.lsn.is_successor_of(latest) {
            return self.core.apply_replicated(entry);
        }
        info!("gap between {} and {}, catching up", latest, entry.lsn);
        let target = entry.lsn;
        self.catch_up(target)?;
        // the catch-up range may stop short of the pushed entry
        if entry.lsn.is_successor_of(self.core.logger.latest_lsn()) {
            self.core.apply_replicated(entry)?;
        }
        Ok(())
    }

    /// Asks the master for its state and catches up to it. Does nothing
    /// while paused.
    pub fn synchronize(&self) -> Result<Lsn> {
        if !self.core.replication.is_slave() || self.core.is_paused() {
            return Ok(self.core.logger.latest_lsn());
        }
        let _slave = self.slave_lock.lock();
        let master = self.master_client()?;
        let state = master.state()?;
        if state.latest > self.core.logger.latest_lsn() {
            self.catch_up(state.latest)?;
        }
        Ok(self.core.logger.latest_lsn())
    }

    /// Brings the local log up to `target`. Caller holds `slave_lock`.
    fn catch_up(&self, target: Lsn) -> Result<()> {
        *self.status.lock() = SyncStatus::CatchingUp;
        let result = self.catch_up_inner(target);
        *self.status.lock() = SyncStatus::Normal;
        result
    }

    fn catch_up_inner(&self, target: Lsn) -> Result<()> {
        let master = self.master_client()?;
        let latest = self.core.logger.latest_lsn();
        let close = latest.view_id == target.view_id
            && target.sequence_no - latest.sequence_no <= self.config.max_replica_gap;
        if close && self.fetch_entries(master.as_ref(), latest, target)? {
            return Ok(());
        }

        let loaded = self.load_from_master(master.as_ref())?;
        if loaded < target && !self.fetch_entries(master.as_ref(), loaded, target)? {
            return Err(Error::Replication(format!(
                "master cannot serve entries {}..{} after a load",
                loaded.next(),
                target
            )));
        }
        Ok(())
    }

    /// Requests `(after, to]` with `REPLICA` and applies it. False when the
    /// master cannot serve the range or it is not contiguous.
    fn fetch_entries(&self, master: &dyn MasterClient, after: Lsn, to: Lsn) -> Result<bool> {
        let Some(entries) = master.replica(after.next(), to)?.into_option() else {
            debug!("master cannot serve {}..{}", after.next(), to);
            return Ok(false);
        };
        let mut prev = after;
        for e in &entries {
            if !e.lsn.is_successor_of(prev) {
                warn!("replica range from master breaks at {} after {}", e.lsn, prev);
                return Ok(false);
            }
            prev = e.lsn;
        }
        let count = entries.len();
        for entry in entries {
            self.core.apply_replicated(entry)?;
        }
        debug!("caught up {} entries to {}", count, prev);
        Ok(true)
    }

    /// Replaces the local state by the master's files. Returns the LSN the
    /// loaded state reflects.
    fn load_from_master(&self, master: &dyn MasterClient) -> Result<Lsn> {
        let manifest = master
            .load(self.core.logger.latest_lsn())?
            .into_option()
            .ok_or_else(|| Error::Replication("master cannot serve a full load".into()))?;

        let staging = self.core.manager.base_dir().join(LOAD_DIR);
        if staging.exists() {
            fs::remove_dir_all(&staging)?;
        }
        fs::create_dir_all(&staging)?;

        let chunk = self.config.chunk_size.max(1);
        let mut bytes = 0u64;
        for info in &manifest.files {
            let rel = checked_relative(&info.name)?;
            let path = staging.join(rel);
            if let Some(parent) = path.parent() {
                fs::create_dir_all(parent)?;
            }
            let mut out = File::create(&path)?;
            let mut start = 0;
            while start < info.size {
                let end = (start + chunk).min(info.size);
                let data = master
                    .chunk(&info.name, start, end)?
                    .into_option()
                    .ok_or_else(|| {
                        Error::Replication(format!("master lost '{}' during a load", info.name))
                    })?;
                if data.len() as u64 != end - start {
                    return Err(Error::Replication(format!(
                        "chunk {}..{} of '{}' has {} bytes",
                        start,
                        end,
                        info.name,
                        data.len()
                    )));
                }
                out.write_all(&data)?;
                start = end;
            }
            out.sync_all()?;
            bytes += info.size;
        }

        self.core.install_load(&staging, manifest.lsn)?;
        info!(
            "loaded {} files ({} bytes) from master at {}",
            manifest.files.len(),
            bytes,
            manifest.lsn
        );
        Ok(manifest.lsn)
    }

    pub(super) fn start_heartbeat(self: &Arc<Self>, interval: Duration) -> Result<()> {
        let (stop, rx) = bounded::<()>(1);
        let facade: Weak<Self> = Arc::downgrade(self);
        let handle = thread::Builder::new()
            .name("tidedb-heartbeat".into())
            .spawn(move || loop {
                match rx.recv_timeout(interval) {
                    Err(RecvTimeoutError::Timeout) => {}
                    Ok(()) | Err(RecvTimeoutError::Disconnected) => break,
                }
                let Some(facade) = facade.upgrade() else { break };
                facade.beat();
            })?;
        *self.heartbeat.lock() = Some(Heartbeat { stop, handle });
        Ok(())
    }

    /// One heartbeat: report progress, pick up trailing entries.
    fn beat(&self) {
        if let Err(e) = self.check_lease() {
            warn!("lease check failed: {}", e);
        }
        if !self.core.replication.is_slave() {
            return;
        }
        let Ok(master) = self.master_client() else { return };
        let latest = self.core.logger.latest_lsn();
        if let Err(e) = master.heartbeat(&self.config.local_address, latest) {
            warn!("heartbeat to '{}' failed: {}", master.address(), e);
            return;
        }
        if let Err(e) = self.synchronize() {
            warn!("synchronization with '{}' failed: {}", master.address(), e);
        }
    }
}

impl EngineCore {
    /// Swaps the on-disk state for the files staged in `staging` and
    /// restarts the log after `lsn`. A marker file brackets the swap; a
    /// node that finds it at startup discards its state (see
    /// [`crate::recovery::discard_interrupted_load`]).
    pub(crate) fn install_load(&self, staging: &Path, lsn: Lsn) -> Result<()> {
        let _ckpt = self.checkpoint_lock.lock();
        let _switch = self.overlay_switch.write();
        let mut log = self.logger.lock();

        let base = self.manager.base_dir();
        let marker = base.join(LOAD_MARKER);
        File::create(&marker)?.sync_all()?;
        sync_dir(base);

        remove_state(base)?;
        for entry in fs::read_dir(staging)? {
            let entry = entry?;
            fs::rename(entry.path(), base.join(entry.file_name()))?;
        }
        fs::remove_dir_all(staging)?;
        log.reset(lsn)?;

        fs::remove_file(&marker)?;
        sync_dir(base);
        self.manager.reload()
    }
}

/// Removes the registry file and every database directory under `base`.
pub(crate) fn remove_state(base: &Path) -> Result<()> {
    let config = base.join(CONFIG_FILENAME);
    if config.exists() {
        fs::remove_file(&config)?;
    }
    for entry in fs::read_dir(base)? {
        let entry = entry?;
        if entry.path().is_dir() && entry.file_name().to_str().map_or(false, is_db_dir_name) {
            fs::remove_dir_all(entry.path())?;
        }
    }
    Ok(())
}

fn sync_dir(dir: &Path) {
    // directory fsync is not supported everywhere
    if let Ok(d) = File::open(dir) {
        let _ = d.sync_all();
    }
}

/// A path from a load listing, restricted to plain components.
pub(crate) fn checked_relative(name: &str) -> Result<&Path> {
    let path = Path::new(name);
    let plain = !name.is_empty() && path.components().all(|c| matches!(c, Component::Normal(_)));
    if !plain {
        return Err(Error::Replication(format!("refusing file path '{}'", name)));
    }
    Ok(path)
}
