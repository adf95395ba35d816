mod database_tests;
mod snapshot_tests;

use crate::replication::{
    Availability, ClientFactory, LoadManifest, MasterClient, NodeState, SlaveClient,
    TransportError,
};
use crate::*;
use anyhow::Result;
use parking_lot::Mutex;
use std::collections::{HashMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Weak};
use std::time::{Duration, Instant};
use wal::LogEntry;

/// Standalone config without the size-triggered checkpoint, so tests decide
/// when checkpoints happen.
pub(crate) fn config(dir: &Path) -> EngineConfig {
    EngineConfig::new(dir).with_max_log_size(0)
}

pub(crate) fn open(dir: &Path) -> Result<Engine> {
    Ok(Engine::open(config(dir))?)
}

pub(crate) fn db_path(base: &Path, db: &Database) -> PathBuf {
    crate::manager::db_dir(base, db.id())
}

pub(crate) fn count_runs(dir: &Path) -> Result<usize> {
    let mut n = 0;
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().map_or(false, |e| e == "run") {
            n += 1;
        }
    }
    Ok(n)
}

pub(crate) fn count_segments(dir: &Path) -> Result<usize> {
    Ok(wal::list_segments(dir)?.len())
}

pub(crate) fn get(db: &Database, index: usize, key: &str) -> Result<Option<String>> {
    Ok(db
        .lookup(index, key.as_bytes())?
        .map(|v| String::from_utf8_lossy(&v).into_owned()))
}

/// Polls `cond` until it holds or `timeout` passes.
pub(crate) fn eventually<F: FnMut() -> bool>(timeout: Duration, mut cond: F) -> bool {
    let deadline = Instant::now() + timeout;
    while Instant::now() < deadline {
        if cond() {
            return true;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    cond()
}

/// Keys in descending byte order.
#[derive(Debug)]
pub(crate) struct Reverse;

impl ByteRangeComparator for Reverse {
    fn id(&self) -> &str {
        "reverse"
    }

    fn compare(&self, a: &[u8], b: &[u8]) -> std::cmp::Ordering {
        b.cmp(a)
    }
}

pub(crate) fn reverse() -> SharedComparator {
    Arc::new(Reverse)
}

/// In-process transport: calls the handlers of the addressed node directly.
#[derive(Clone, Default)]
pub(crate) struct Network {
    inner: Arc<NetworkInner>,
}

#[derive(Default)]
struct NetworkInner {
    nodes: Mutex<HashMap<String, Weak<ReplicationFacade>>>,
    down: Mutex<HashSet<String>>,
}

impl Network {
    pub fn join(&self, engine: &Engine) -> Result<()> {
        let facade = engine
            .replication()
            .ok_or_else(|| anyhow::anyhow!("engine is not replicated"))?;
        self.inner
            .nodes
            .lock()
            .insert(facade.local_address().to_string(), Arc::downgrade(facade));
        Ok(())
    }

    pub fn set_down(&self, address: &str, down: bool) {
        let mut set = self.inner.down.lock();
        if down {
            set.insert(address.to_string());
        } else {
            set.remove(address);
        }
    }

    fn node(&self, address: &str) -> std::result::Result<Arc<ReplicationFacade>, TransportError> {
        if self.inner.down.lock().contains(address) {
            return Err(TransportError::Unreachable(address.to_string()));
        }
        self.inner
            .nodes
            .lock()
            .get(address)
            .and_then(Weak::upgrade)
            .ok_or_else(|| TransportError::Unreachable(address.to_string()))
    }
}

impl ClientFactory for Network {
    fn master_client(&self, address: &str) -> Arc<dyn MasterClient> {
        Arc::new(Peer {
            net: self.clone(),
            address: address.to_string(),
        })
    }

    fn slave_client(&self, address: &str) -> Arc<dyn SlaveClient> {
        Arc::new(Peer {
            net: self.clone(),
            address: address.to_string(),
        })
    }
}

struct Peer {
    net: Network,
    address: String,
}

fn rejected(e: Error) -> TransportError {
    TransportError::Rejected(e.to_string())
}

impl MasterClient for Peer {
    fn address(&self) -> &str {
        &self.address
    }

    fn state(&self) -> std::result::Result<NodeState, TransportError> {
        Ok(self.net.node(&self.address)?.handle_state())
    }

    fn replica(
        &self,
        from: Lsn,
        to: Lsn,
    ) -> std::result::Result<Availability<Vec<LogEntry>>, TransportError> {
        self.net.node(&self.address)?.handle_replica(from, to).map_err(rejected)
    }

    fn load(&self, from: Lsn) -> std::result::Result<Availability<LoadManifest>, TransportError> {
        self.net.node(&self.address)?.handle_load(from).map_err(rejected)
    }

    fn chunk(
        &self,
        file: &str,
        start: u64,
        end: u64,
    ) -> std::result::Result<Availability<Vec<u8>>, TransportError> {
        self.net
            .node(&self.address)?
            .handle_chunk(file, start, end)
            .map_err(rejected)
    }

    fn heartbeat(&self, from: &str, latest: Lsn) -> std::result::Result<(), TransportError> {
        self.net.node(&self.address)?.handle_heartbeat(from, latest);
        Ok(())
    }

    fn time(&self) -> std::result::Result<u64, TransportError> {
        Ok(self.net.node(&self.address)?.handle_time())
    }
}

impl SlaveClient for Peer {
    fn address(&self) -> &str {
        &self.address
    }

    fn replicate(&self, entry: &LogEntry) -> std::result::Result<(), TransportError> {
        self.net
            .node(&self.address)?
            .handle_replicate(entry.clone())
            .map_err(rejected)
    }
}
