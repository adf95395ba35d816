//! Master/slave log shipping.
//!
//! A master pushes every durable log entry to its slaves (see [`master`])
//! and, with `sync_n > 0`, holds a client write until `sync_n` slaves
//! acknowledged it. A slave rejects client mutations and applies entries
//! under the master's LSN; on a gap it catches up with `REPLICA` or a full
//! `LOAD` (see [`slave`]). The request handlers an embedding transport
//! routes to live in [`service`].
//!
//! ```text
//! master: execute ─► DiskLogger ─► listener ─► Fanout ─► SlaveClient::replicate
//!                                     │
//!                                     └─► AckTracker ◄── ack / nack
//! slave:  handle_replicate ─► successor? ─► apply_replicated
//!                                └─ no ──► catch_up (REPLICA | LOAD + CHUNK)
//! ```

mod master;
pub(crate) mod service;
pub(crate) mod slave;
pub mod transport;

pub use transport::{
    Availability, ClientFactory, FileInfo, LeaseOracle, LoadManifest, MasterClient, NodeState,
    Procedure, SlaveClient, TransportError,
};

use config::{ReplicationConfig, Role};
use crossbeam_channel::Sender;
use log::{info, warn};
use parking_lot::{Condvar, Mutex, RwLock};
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};
use wal::Lsn;

use crate::pipeline::EngineCore;
use crate::{Error, Result};
use master::Fanout;

/// Entries tracked for acknowledgment before the oldest are dropped.
const MAX_TRACKED: usize = 100_000;

/// Role and quorum as seen by the write pipeline.
pub(crate) struct ReplicationState {
    role: RwLock<Option<Role>>,
    timeout: Duration,
    pub(crate) tracker: Arc<AckTracker>,
}

impl ReplicationState {
    pub fn standalone() -> Self {
        Self {
            role: RwLock::new(None),
            timeout: Duration::ZERO,
            tracker: Arc::new(AckTracker::new(0)),
        }
    }

    pub fn new(config: &ReplicationConfig) -> Self {
        Self {
            role: RwLock::new(Some(config.role)),
            timeout: config.request_timeout,
            tracker: Arc::new(AckTracker::new(config.sync_n)),
        }
    }

    pub fn role(&self) -> Option<Role> {
        *self.role.read()
    }

    pub fn set_role(&self, role: Role) {
        *self.role.write() = Some(role);
    }

    pub fn is_slave(&self) -> bool {
        self.role() == Some(Role::Slave)
    }

    pub fn sync_n(&self) -> usize {
        self.tracker.sync_n()
    }

    pub fn set_sync_n(&self, n: usize) {
        self.tracker.set_sync_n(n);
    }

    pub fn waits_for_quorum(&self) -> bool {
        self.role() == Some(Role::Master) && self.sync_n() > 0
    }

    /// Blocks until the entry at `lsn` reached its quorum. The local write
    /// stays durable when this fails. Entries the fan-out did not register
    /// need no quorum.
    pub fn await_quorum(&self, lsn: Lsn) -> Result<()> {
        if self.role() != Some(Role::Master) {
            return Ok(());
        }
        self.tracker.wait(lsn, self.timeout)
    }
}

#[derive(Debug, Default)]
struct Acks {
    needed: usize,
    total: usize,
    acked: usize,
    failed: usize,
}

/// Per-entry acknowledgment counts of the slaves.
///
/// An entry is tracked from its registration by the fan-out until its
/// writer stops waiting for it; acks for untracked entries are dropped.
pub(crate) struct AckTracker {
    entries: Mutex<BTreeMap<Lsn, Acks>>,
    changed: Condvar,
    sync_n: AtomicUsize,
}

impl AckTracker {
    fn new(sync_n: usize) -> Self {
        Self {
            entries: Mutex::new(BTreeMap::new()),
            changed: Condvar::new(),
            sync_n: AtomicUsize::new(sync_n),
        }
    }

    /// Acknowledgments a new entry needs. Zero disables tracking.
    pub fn sync_n(&self) -> usize {
        self.sync_n.load(Ordering::Acquire)
    }

    pub fn set_sync_n(&self, n: usize) {
        self.sync_n.store(n, Ordering::Release);
    }

    /// Starts tracking `lsn`: `needed` acks out of `total` slaves.
    pub fn register(&self, lsn: Lsn, needed: usize, total: usize) {
        let mut entries = self.entries.lock();
        entries.insert(
            lsn,
            Acks {
                needed,
                total,
                ..Acks::default()
            },
        );
        while entries.len() > MAX_TRACKED {
            entries.pop_first();
        }
        drop(entries);
        self.changed.notify_all();
    }

    pub fn ack(&self, lsn: Lsn) {
        if let Some(acks) = self.entries.lock().get_mut(&lsn) {
            acks.acked += 1;
            self.changed.notify_all();
        }
    }

    pub fn nack(&self, lsn: Lsn) {
        if let Some(acks) = self.entries.lock().get_mut(&lsn) {
            acks.failed += 1;
            self.changed.notify_all();
        }
    }

    /// Waits for the quorum of `lsn` and stops tracking it. Untracked
    /// entries return at once.
    pub fn wait(&self, lsn: Lsn, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        let mut entries = self.entries.lock();
        loop {
            let Some(acks) = entries.get(&lsn) else {
                return Ok(());
            };
            if acks.acked >= acks.needed {
                entries.remove(&lsn);
                return Ok(());
            }
            if acks.total.saturating_sub(acks.failed) < acks.needed {
                let acks = entries.remove(&lsn).unwrap_or_default();
                return Err(Error::Replication(format!(
                    "entry {} reached {} of {} required acknowledgments",
                    lsn, acks.acked, acks.needed
                )));
            }
            if self.changed.wait_until(&mut entries, deadline).timed_out() {
                let acked = entries.remove(&lsn).map_or(0, |a| a.acked);
                return Err(Error::Replication(format!(
                    "entry {} timed out with {} acknowledgments",
                    lsn, acked
                )));
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncStatus {
    Normal,
    CatchingUp,
    Paused,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReplicationStatus {
    pub role: Role,
    pub sync: SyncStatus,
    pub latest: Lsn,
    pub master: Option<String>,
    pub slaves: Vec<String>,
}

struct MasterLink {
    address: String,
    client: Arc<dyn MasterClient>,
}

struct Heartbeat {
    stop: Sender<()>,
    handle: JoinHandle<()>,
}

/// Replication driver of one node: role changes, master fan-out, slave
/// catch-up and the handlers of the replication procedures.
pub struct ReplicationFacade {
    core: Arc<EngineCore>,
    config: ReplicationConfig,
    clients: Arc<dyn ClientFactory>,
    oracle: Option<Arc<dyn LeaseOracle>>,
    fanout: Mutex<Option<Arc<Fanout>>>,
    master: RwLock<Option<MasterLink>>,
    /// Serializes slave applies, catch-up and promotion.
    slave_lock: Mutex<()>,
    status: Mutex<SyncStatus>,
    progress: Mutex<HashMap<String, (Lsn, Instant)>>,
    heartbeat: Mutex<Option<Heartbeat>>,
    members: Vec<String>,
}

impl ReplicationFacade {
    pub(crate) fn start(
        core: Arc<EngineCore>,
        config: ReplicationConfig,
        clients: Arc<dyn ClientFactory>,
        oracle: Option<Arc<dyn LeaseOracle>>,
    ) -> Result<Arc<Self>> {
        let mut members: Vec<String> = Vec::new();
        let local = std::iter::once(&config.local_address);
        for addr in local.chain(config.master.iter()).chain(config.slaves.iter()) {
            if !addr.is_empty() && !members.contains(addr) {
                members.push(addr.clone());
            }
        }

        let facade = Arc::new(Self {
            core,
            config: config.clone(),
            clients,
            oracle,
            fanout: Mutex::new(None),
            master: RwLock::new(None),
            slave_lock: Mutex::new(()),
            status: Mutex::new(SyncStatus::Normal),
            progress: Mutex::new(HashMap::new()),
            heartbeat: Mutex::new(None),
            members,
        });

        match config.role {
            Role::Master => facade.become_master(config.slaves.clone())?,
            Role::Slave => {
                let master = config.master.clone().ok_or_else(|| {
                    Error::InvalidArgument("a slave needs a master address".into())
                })?;
                facade.become_slave(&master);
                if let Err(e) = facade.synchronize() {
                    warn!("initial synchronization with {} failed: {}", master, e);
                }
            }
        }
        if let Some(interval) = config.heartbeat_interval {
            facade.start_heartbeat(interval)?;
        }
        info!(
            "replication started as {:?} at '{}'",
            config.role, config.local_address
        );
        Ok(facade)
    }

    pub fn local_address(&self) -> &str {
        &self.config.local_address
    }

    pub fn role(&self) -> Role {
        self.core.replication.role().unwrap_or(self.config.role)
    }

    pub fn status(&self) -> ReplicationStatus {
        let slaves = self
            .fanout
            .lock()
            .as_ref()
            .map(|f| f.addresses())
            .unwrap_or_default();
        ReplicationStatus {
            role: self.role(),
            sync: *self.status.lock(),
            latest: self.core.logger.latest_lsn(),
            master: self.master.read().as_ref().map(|m| m.address.clone()),
            slaves,
        }
    }

    /// Stops accepting writes and returns the LSN of the last entry
    /// accepted before the pause.
    pub fn pause(&self) -> Lsn {
        let lsn = self.core.pause();
        *self.status.lock() = SyncStatus::Paused;
        info!("replication paused at {}", lsn);
        lsn
    }

    pub fn resume(&self) {
        self.core.resume();
        *self.status.lock() = SyncStatus::Normal;
        info!("replication resumed");
    }

    /// Changes how many slave acknowledgments a write waits for. Applies to
    /// entries written from now on, also after a promotion.
    pub fn set_sync_n(&self, n: usize) -> Result<()> {
        let slaves = self.fanout.lock().as_ref().map(|f| f.addresses().len());
        if let Some(count) = slaves.filter(|count| n > *count) {
            return Err(Error::InvalidArgument(format!(
                "sync_n {} exceeds the number of slaves ({})",
                n, count
            )));
        }
        self.core.replication.set_sync_n(n);
        info!("synchronous replication now waits for {} slaves", n);
        Ok(())
    }

    pub fn sync_n(&self) -> usize {
        self.core.replication.sync_n()
    }

    /// Turns this slave into the master. A catch-up in progress completes
    /// first; the log then continues in a new view.
    pub fn promote_to_master(&self) -> Result<Lsn> {
        let _slave = self.slave_lock.lock();
        let last = self.core.checkpoint(true)?;
        let slaves = self
            .members
            .iter()
            .filter(|m| **m != self.config.local_address)
            .cloned()
            .collect();
        *self.master.write() = None;
        self.become_master(slaves)?;
        info!("promoted to master after {}", last);
        Ok(last)
    }

    /// Turns this node into a slave of `master`.
    pub fn demote_to_slave(&self, master: &str) {
        let _slave = self.slave_lock.lock();
        self.become_slave(master);
        info!("now a slave of '{}'", master);
    }

    /// Re-checks the lease and changes role if it moved.
    pub fn check_lease(&self) -> Result<()> {
        let Some(holder) = self.oracle.as_ref().and_then(|o| o.lease_holder()) else {
            return Ok(());
        };
        if holder == self.config.local_address {
            if self.role() != Role::Master {
                self.promote_to_master()?;
            }
        } else {
            let current = self.master.read().as_ref().map(|m| m.address.clone());
            if self.role() == Role::Master || current.as_deref() != Some(holder.as_str()) {
                self.demote_to_slave(&holder);
            }
        }
        Ok(())
    }

    /// Last LSN each slave reported by heartbeat.
    pub fn slave_progress(&self) -> BTreeMap<String, Lsn> {
        self.progress
            .lock()
            .iter()
            .map(|(addr, (lsn, _))| (addr.clone(), *lsn))
            .collect()
    }

    fn become_master(&self, slaves: Vec<String>) -> Result<()> {
        let clients: Vec<Arc<dyn SlaveClient>> =
            slaves.iter().map(|s| self.clients.slave_client(s)).collect();
        let fanout = Fanout::start(
            clients,
            Arc::clone(&self.core.replication.tracker),
            self.config.max_retries,
        )?;
        if let Some(old) = self.fanout.lock().replace(Arc::clone(&fanout)) {
            old.shutdown();
        }
        fanout.install(&self.core.logger);
        self.core.replication.set_role(Role::Master);
        *self.status.lock() = SyncStatus::Normal;
        Ok(())
    }

    fn become_slave(&self, master: &str) {
        self.core.replication.set_role(Role::Slave);
        self.core.logger.set_listener(None);
        if let Some(fanout) = self.fanout.lock().take() {
            fanout.shutdown();
        }
        *self.master.write() = Some(MasterLink {
            address: master.to_string(),
            client: self.clients.master_client(master),
        });
        *self.status.lock() = SyncStatus::Normal;
    }

    fn master_client(&self) -> Result<Arc<dyn MasterClient>> {
        self.master
            .read()
            .as_ref()
            .map(|m| Arc::clone(&m.client))
            .ok_or_else(|| Error::Replication("no master known".into()))
    }

    pub(crate) fn shutdown(&self) {
        if let Some(hb) = self.heartbeat.lock().take() {
            let _ = hb.stop.send(());
            let _ = hb.handle.join();
        }
        self.core.logger.set_listener(None);
        if let Some(fanout) = self.fanout.lock().take() {
            fanout.shutdown();
        }
    }
}

impl std::fmt::Debug for ReplicationFacade {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ReplicationFacade")
            .field("local", &self.config.local_address)
            .field("status", &self.status())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn quorum_met_by_acks() -> anyhow::Result<()> {
        let tracker = AckTracker::new(1);
        let lsn = Lsn::new(1, 1);
        tracker.register(lsn, 2, 3);
        tracker.ack(lsn);
        tracker.nack(lsn);
        tracker.ack(lsn);
        tracker.wait(lsn, Duration::from_millis(10))?;
        assert!(tracker.entries.lock().is_empty());
        Ok(())
    }

    #[test]
    fn quorum_fails_once_unreachable() {
        let tracker = AckTracker::new(1);
        let lsn = Lsn::new(1, 7);
        tracker.register(lsn, 2, 2);
        tracker.nack(lsn);
        let err = tracker.wait(lsn, Duration::from_secs(5)).unwrap_err();
        assert_eq!(err.code(), crate::ErrorCode::ReplicationFailure);
    }

    #[test]
    fn quorum_larger_than_slave_set_fails() {
        let tracker = AckTracker::new(1);
        let lsn = Lsn::new(2, 1);
        tracker.register(lsn, 3, 1);
        assert!(tracker.wait(lsn, Duration::from_secs(5)).is_err());
    }

    #[test]
    fn quorum_times_out() {
        let tracker = AckTracker::new(1);
        let lsn = Lsn::new(1, 1);
        tracker.register(lsn, 1, 1);
        let started = Instant::now();
        assert!(tracker.wait(lsn, Duration::from_millis(50)).is_err());
        assert!(started.elapsed() >= Duration::from_millis(50));
    }

    #[test]
    fn late_ack_after_timeout_is_dropped() {
        let tracker = AckTracker::new(1);
        let lsn = Lsn::new(1, 3);
        tracker.register(lsn, 1, 2);
        assert!(tracker.wait(lsn, Duration::from_millis(10)).is_err());
        tracker.ack(lsn);
        tracker.nack(lsn);
        assert!(tracker.entries.lock().is_empty());
    }

    #[test]
    fn unregistered_entries_are_not_tracked() -> anyhow::Result<()> {
        let tracker = AckTracker::new(0);
        for seq in 1..=500 {
            tracker.ack(Lsn::new(1, seq));
        }
        assert!(tracker.entries.lock().is_empty());
        tracker.wait(Lsn::new(1, 1), Duration::from_secs(5))?;
        Ok(())
    }
}
