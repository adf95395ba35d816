//! The replication RPC surface as seen by the engine.
//!
//! The engine does not speak any wire protocol itself. An embedding
//! application implements [`MasterClient`] and [`SlaveClient`] over its
//! transport of choice and routes incoming requests to the handlers of
//! [`ReplicationFacade`](super::ReplicationFacade).

use std::collections::BTreeMap;
use std::sync::Arc;
use thiserror::Error;
use wal::{LogEntry, Lsn};

/// Procedures of the replication surface.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum Procedure {
    State = 1,
    Load = 2,
    Chunk = 3,
    LeaseMessage = 4,
    Time = 5,
    Replica = 6,
    Heartbeat = 7,
    Replicate = 8,
}

/// Answer to a catch-up request. `NotAvailable` is distinct from an empty
/// result: the peer cannot serve the request at all.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Availability<T> {
    Available(T),
    NotAvailable,
}

impl<T> Availability<T> {
    pub fn into_option(self) -> Option<T> {
        match self {
            Availability::Available(v) => Some(v),
            Availability::NotAvailable => None,
        }
    }
}

/// A file of a full load, by path relative to the base directory.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileInfo {
    pub name: String,
    pub size: u64,
}

/// Files making up the master's on-disk state as of `lsn`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadManifest {
    pub lsn: Lsn,
    pub files: Vec<FileInfo>,
}

/// Answer to `STATE`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NodeState {
    pub latest: Lsn,
    /// On-disk LSN per database name.
    pub databases: BTreeMap<String, Lsn>,
}

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("peer {0} is unreachable")]
    Unreachable(String),

    #[error("request to {0} timed out")]
    Timeout(String),

    #[error("peer rejected the request: {0}")]
    Rejected(String),
}

/// Requests a slave sends to its master.
pub trait MasterClient: Send + Sync {
    fn address(&self) -> &str;

    fn state(&self) -> Result<NodeState, TransportError>;

    /// Entries with `from <= lsn <= to`.
    fn replica(&self, from: Lsn, to: Lsn) -> Result<Availability<Vec<LogEntry>>, TransportError>;

    fn load(&self, from: Lsn) -> Result<Availability<LoadManifest>, TransportError>;

    /// Bytes `[start, end)` of a file listed by `load`.
    fn chunk(&self, file: &str, start: u64, end: u64) -> Result<Availability<Vec<u8>>, TransportError>;

    fn heartbeat(&self, from: &str, latest: Lsn) -> Result<(), TransportError>;

    /// Master clock in milliseconds since the epoch.
    fn time(&self) -> Result<u64, TransportError>;
}

/// Requests a master sends to one slave.
pub trait SlaveClient: Send + Sync {
    fn address(&self) -> &str;

    fn replicate(&self, entry: &LogEntry) -> Result<(), TransportError>;
}

/// Builds clients for peer addresses, also when roles change at runtime.
pub trait ClientFactory: Send + Sync {
    fn master_client(&self, address: &str) -> Arc<dyn MasterClient>;

    fn slave_client(&self, address: &str) -> Arc<dyn SlaveClient>;
}

/// External lease service deciding which node is master.
pub trait LeaseOracle: Send + Sync {
    /// Address of the node currently holding the master lease.
    fn lease_holder(&self) -> Option<String>;

    /// Opaque `LEASE-MESSAGE` payload from a peer.
    fn receive(&self, message: &[u8]);
}
