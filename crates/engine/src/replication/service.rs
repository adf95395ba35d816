//! Handlers for the replication procedures, called by the transport of the
//! embedding application.

use config::Role;
use log::{debug, info};
use std::fs::{self, File};
use std::io::{Read, Seek, SeekFrom};
use std::path::Path;
use std::time::{Instant, SystemTime, UNIX_EPOCH};
use wal::{LogEntry, Lsn};

use super::slave::checked_relative;
use super::{Availability, FileInfo, LoadManifest, NodeState, ReplicationFacade};
use crate::db_config::CONFIG_FILENAME;
use crate::manager::is_db_dir_name;
use crate::{Error, Result};

impl ReplicationFacade {
    /// `STATE`
    pub fn handle_state(&self) -> NodeState {
        NodeState {
            latest: self.core.logger.latest_lsn(),
            databases: self
                .core
                .manager
                .databases()
                .into_iter()
                .map(|db| (db.name().to_string(), db.ondisk_lsn()))
                .collect(),
        }
    }

    /// `REPLICA`: entries `from..=to`, available only when the local log
    /// holds every one of them and the range stays within one view and
    /// `max_replica_gap` entries. Larger ranges are served by `LOAD`.
    pub fn handle_replica(&self, from: Lsn, to: Lsn) -> Result<Availability<Vec<LogEntry>>> {
        if self.role() != Role::Master || from > to {
            return Ok(Availability::NotAvailable);
        }
        if from.view_id != to.view_id
            || to.sequence_no - from.sequence_no >= self.config.max_replica_gap
        {
            debug!("replica {}..{} exceeds {} entries", from, to, self.config.max_replica_gap);
            return Ok(Availability::NotAvailable);
        }
        let Some(entries) = wal::read_range(self.core.logger.dir(), from, to)? else {
            return Ok(Availability::NotAvailable);
        };
        let complete = entries.first().map(|e| e.lsn) == Some(from)
            && entries.last().map(|e| e.lsn) == Some(to)
            && entries.windows(2).all(|w| w[1].lsn.is_successor_of(w[0].lsn));
        if !complete {
            debug!("replica {}..{} is not contiguous in the local log", from, to);
            return Ok(Availability::NotAvailable);
        }
        Ok(Availability::Available(entries))
    }

    /// `LOAD`: checkpoints and lists the files of the on-disk state.
    pub fn handle_load(&self, from: Lsn) -> Result<Availability<LoadManifest>> {
        if self.role() != Role::Master {
            return Ok(Availability::NotAvailable);
        }
        let _ckpt = self.core.checkpoint_lock.lock();
        let lsn = self.core.checkpoint_locked(false)?;
        let files = state_files(self.core.manager.base_dir())?;
        info!(
            "serving a load from {} at {} ({} files)",
            from,
            lsn,
            files.len()
        );
        Ok(Availability::Available(LoadManifest { lsn, files }))
    }

    /// `CHUNK`: bytes `[start, end)` of a file under the base directory.
    pub fn handle_chunk(&self, file: &str, start: u64, end: u64) -> Result<Availability<Vec<u8>>> {
        let rel = match checked_relative(file) {
            Ok(rel) => rel,
            Err(_) => return Ok(Availability::NotAvailable),
        };
        let top = rel
            .components()
            .next()
            .and_then(|c| c.as_os_str().to_str())
            .unwrap_or_default();
        if !(file == CONFIG_FILENAME || is_db_dir_name(top)) || start > end {
            return Ok(Availability::NotAvailable);
        }
        let path = self.core.manager.base_dir().join(rel);
        let mut f = match File::open(&path) {
            Ok(f) => f,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(Availability::NotAvailable)
            }
            Err(e) => return Err(e.into()),
        };
        if end > f.metadata()?.len() {
            return Ok(Availability::NotAvailable);
        }
        f.seek(SeekFrom::Start(start))?;
        let mut buf = vec![0u8; (end - start) as usize];
        f.read_exact(&mut buf)?;
        Ok(Availability::Available(buf))
    }

    /// `HEARTBEAT`: records the progress of a slave.
    pub fn handle_heartbeat(&self, from: &str, latest: Lsn) {
        self.progress
            .lock()
            .insert(from.to_string(), (latest, Instant::now()));
    }

    /// `TIME`: local clock in milliseconds since the epoch.
    pub fn handle_time(&self) -> u64 {
        SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map_or(0, |d| d.as_millis() as u64)
    }

    /// `LEASE-MESSAGE`: handed to the lease oracle, then the lease is
    /// re-checked.
    pub fn handle_lease_message(&self, message: &[u8]) -> Result<()> {
        let Some(oracle) = &self.oracle else {
            return Err(Error::Replication("no lease oracle configured".into()));
        };
        oracle.receive(message);
        self.check_lease()
    }
}

/// The registry file and the files of every database directory, relative
/// to `base` and sorted by name.
pub(crate) fn state_files(base: &Path) -> Result<Vec<FileInfo>> {
    let mut files = Vec::new();
    let config = base.join(CONFIG_FILENAME);
    if config.exists() {
        files.push(FileInfo {
            name: CONFIG_FILENAME.to_string(),
            size: fs::metadata(&config)?.len(),
        });
    }
    for entry in fs::read_dir(base)? {
        let entry = entry?;
        let name = entry.file_name();
        let Some(name) = name.to_str() else { continue };
        if is_db_dir_name(name) && entry.path().is_dir() {
            list_files(base, Path::new(name), &mut files)?;
        }
    }
    files.sort_by(|a, b| a.name.cmp(&b.name));
    Ok(files)
}

fn list_files(base: &Path, rel: &Path, out: &mut Vec<FileInfo>) -> Result<()> {
    for entry in fs::read_dir(base.join(rel))? {
        let entry = entry?;
        let child = rel.join(entry.file_name());
        let meta = entry.metadata()?;
        if meta.is_dir() {
            list_files(base, &child, out)?;
        } else if child.extension().map_or(true, |e| e != "tmp") {
            if let Some(name) = child.to_str() {
                out.push(FileInfo {
                    name: name.replace('\\', "/"),
                    size: meta.len(),
                });
            }
        }
    }
    Ok(())
}
