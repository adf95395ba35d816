//! Shared engine state and the write pipeline.
//!
//! Lock order, outermost first: `checkpoint_lock`, `overlay_switch`, the
//! logger's rotation lock, the registry. Client inserts and replicated
//! applies hold `overlay_switch` for reading from `before` to `after`; the
//! checkpoint rotation holds it for writing. Metadata operations also hold
//! `checkpoint_lock` so that no checkpoint runs while they change files.
//!
//! While paused, client writes wait for `resume` and entries pushed by a
//! master are refused; the slave catches up on them after the resume.

use config::{EngineConfig, SyncMode};
use log::error;
use parking_lot::{Condvar, Mutex, RwLock, RwLockReadGuard};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use wal::{DiskLogger, LogEntry, LogError, Lsn};

use crate::manager::DatabaseManager;
use crate::ops::{Mode, Operation, Prepared, StageContext, TransactionListener};
use crate::replication::ReplicationState;
use crate::worker::WorkerPool;
use crate::{Error, Result};

/// Largest encoded operation; leaves room for the record header.
const MAX_PAYLOAD: usize = wal::record::MAX_RECORD_SIZE as usize - 64;

pub(crate) struct EngineCore {
    pub config: EngineConfig,
    pub manager: DatabaseManager,
    pub logger: DiskLogger,
    pub workers: WorkerPool,
    pub overlay_switch: RwLock<()>,
    pub checkpoint_lock: Mutex<()>,
    pub replication: ReplicationState,
    paused: Mutex<bool>,
    resumed: Condvar,
    failure_reported: Mutex<bool>,
    listeners: RwLock<Vec<(u64, Arc<dyn TransactionListener>)>>,
    next_listener: AtomicU64,
}

impl EngineCore {
    pub fn new(
        config: EngineConfig,
        manager: DatabaseManager,
        logger: DiskLogger,
        workers: WorkerPool,
        replication: ReplicationState,
    ) -> Self {
        Self {
            config,
            manager,
            logger,
            workers,
            overlay_switch: RwLock::new(()),
            checkpoint_lock: Mutex::new(()),
            replication,
            paused: Mutex::new(false),
            resumed: Condvar::new(),
            failure_reported: Mutex::new(false),
            listeners: RwLock::new(Vec::new()),
            next_listener: AtomicU64::new(1),
        }
    }

    pub fn sync_mode(&self) -> SyncMode {
        self.config.sync_mode
    }

    pub(crate) fn stage_context(&self, mode: Mode) -> StageContext<'_> {
        StageContext {
            manager: &self.manager,
            mode,
            sync_mode: self.config.sync_mode,
        }
    }

    /// Fails once the logger has given up; the engine accepts no more work.
    pub fn check_healthy(&self) -> Result<()> {
        match self.logger.failure() {
            None => Ok(()),
            Some(reason) => {
                let mut reported = self.failure_reported.lock();
                if !*reported {
                    error!("write-ahead log failed, engine stops accepting operations: {}", reason);
                    *reported = true;
                }
                Err(Error::Log(LogError::Failed(reason)))
            }
        }
    }

    pub fn check_writable(&self) -> Result<()> {
        self.check_healthy()?;
        if self.replication.is_slave() {
            return Err(Error::Replication(
                "this node is a slave; mutations must go to the master".into(),
            ));
        }
        Ok(())
    }

    /// Read side of the overlay switch, once writes are not paused.
    fn enter(&self) -> RwLockReadGuard<'_, ()> {
        loop {
            let guard = self.overlay_switch.read();
            if !*self.paused.lock() {
                return guard;
            }
            drop(guard);
            let mut paused = self.paused.lock();
            while *paused {
                self.resumed.wait(&mut paused);
            }
        }
    }

    /// Runs a client operation through `before`, the log append and
    /// `after`. Returns the LSN of the entry, or `None` when the log
    /// acknowledges asynchronously.
    pub fn execute(&self, mut op: Operation) -> Result<Option<Lsn>> {
        self.check_writable()?;
        let ckpt = op.is_metadata().then(|| self.checkpoint_lock.lock());
        let overlay = self.enter();

        let ctx = self.stage_context(Mode::Live);
        let prepared = op.before(&ctx)?;
        let payload = op.encode();
        if payload.len() > MAX_PAYLOAD {
            return Err(Error::InvalidArgument(format!(
                "operation of {} bytes exceeds the log record limit",
                payload.len()
            )));
        }
        let pending = self.logger.append(payload);
        op.meanwhile(&ctx, &prepared);
        if ctx.sync_mode.is_async() && !self.replication.waits_for_quorum() {
            drop(overlay);
            drop(ckpt);
            self.notify(None, &op);
            return Ok(None);
        }

        let lsn = pending.wait().map_err(|e| {
            let _ = self.check_healthy();
            Error::from(e)
        })?;
        op.after(&ctx, &prepared);
        drop(overlay);
        drop(ckpt);
        self.notify(Some(lsn), &op);

        self.replication.await_quorum(lsn)?;
        Ok(Some(lsn))
    }

    /// Applies an entry received from the master under the master's LSN.
    /// Refused while paused.
    pub fn apply_replicated(&self, entry: LogEntry) -> Result<()> {
        self.check_healthy()?;
        let mut op = Operation::decode(&entry.payload)?;
        let ckpt = op.is_metadata().then(|| self.checkpoint_lock.lock());
        let overlay = self.overlay_switch.read();
        if self.is_paused() {
            return Err(Error::Replication(format!(
                "paused; entry {} is not applied",
                entry.lsn
            )));
        }

        let ctx = self.stage_context(Mode::Replay(entry.lsn));
        let prepared = op.before(&ctx)?;
        self.logger.append_at(entry.lsn, entry.payload).wait()?;
        op.after(&ctx, &prepared);
        drop(overlay);
        drop(ckpt);
        if !matches!(prepared, Prepared::Skipped) {
            self.notify(Some(entry.lsn), &op);
        }
        Ok(())
    }

    /// Registers a listener called after each applied operation. Returns
    /// the id to remove it with.
    pub fn add_listener(&self, listener: Arc<dyn TransactionListener>) -> u64 {
        let id = self.next_listener.fetch_add(1, Ordering::Relaxed);
        self.listeners.write().push((id, listener));
        id
    }

    pub fn remove_listener(&self, id: u64) -> bool {
        let mut listeners = self.listeners.write();
        let before = listeners.len();
        listeners.retain(|(l, _)| *l != id);
        listeners.len() != before
    }

    fn notify(&self, lsn: Option<Lsn>, op: &Operation) {
        let listeners = self.listeners.read().clone();
        for (_, listener) in listeners {
            listener.operation_applied(lsn, op);
        }
    }

    /// Stops new writes and waits for those in flight. Returns the LSN of
    /// the last entry written.
    pub fn pause(&self) -> Lsn {
        *self.paused.lock() = true;
        let _drain = self.overlay_switch.write();
        self.logger.latest_lsn()
    }

    pub fn resume(&self) {
        *self.paused.lock() = false;
        self.resumed.notify_all();
    }

    pub fn is_paused(&self) -> bool {
        *self.paused.lock()
    }
}

impl std::fmt::Debug for EngineCore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EngineCore")
            .field("base_dir", &self.config.base_dir)
            .field("workers", &self.workers.len())
            .field("latest_lsn", &self.logger.latest_lsn())
            .field("manager", &self.manager)
            .finish()
    }
}
