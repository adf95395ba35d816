//! # Engine - TideDB replicated LSM storage engine
//!
//! Ties the [`memtable`], [`sstable`] and [`wal`] crates together into named
//! databases of LSM indices, made durable by one shared write-ahead log and
//! replicated from a master to its slaves in LSN order.
//!
//! ## Architecture
//!
//! ```text
//! Client
//!   |
//!   v
//! ┌──────────────────────────────────────────────────────────┐
//! │                        ENGINE                            │
//! │                                                          │
//! │ Operation → worker(db) → before → DiskLogger → after     │
//! │                                      |           |       │
//! │                     ReplicationFacade┘     LsmTree.apply │
//! │                                                          │
//! │ Checkpointer: freeze overlays + rotate log  (locked)     │
//! │               flush runs + manifest, prune log (unlocked)│
//! │                                                          │
//! │ reads → overlay → frozen overlays → runs (newest first)  │
//! └──────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Module Responsibilities
//!
//! | Module          | Purpose                                                  |
//! |-----------------|----------------------------------------------------------|
//! | `lib.rs`        | `Engine`, `EngineBuilder`, `Database`, `InsertGroup`      |
//! | [`ops`]         | Logged operations and their before/meanwhile/after stages |
//! | `pipeline`      | Engine core: write pipeline, lock order, pause gate      |
//! | `checkpoint`    | Checkpoint protocol and its background trigger           |
//! | `recovery`      | WAL replay at startup                                    |
//! | `manager`       | Registry of databases, config file persistence           |
//! | `database`      | `LsmDatabase`: trees, manifest, persistent snapshots, GC  |
//! | `tree`          | `LsmTree`: overlays, runs, pinned views                  |
//! | `compaction`    | Merging the runs of one index                            |
//! | [`snapshot`]    | Snapshot configs, key filters, read-only snapshot views  |
//! | [`replication`] | Master fan-out, quorum, slave catch-up, procedure handlers |
//!
//! ## On-disk layout
//!
//! ```text
//! <base_dir>/config.db                     registry of databases (crc-checked)
//! <base_dir>/db-<id>/MANIFEST              runs per index + on-disk LSN
//! <base_dir>/db-<id>/idx<i>-<v>-<s>-<n>.run
//! <base_dir>/db-<id>/SNAPSHOTS             persistent snapshot metadata
//! <base_dir>/db-<id>/snapshots/<name>/     captured overlay runs
//! <log_dir>/<view>.<seq>.log               WAL segments
//! ```
//!
//! ## Crash Safety
//!
//! Every mutation is logged before it is applied. Log segments are deleted
//! only after every database flushed its overlay and saved its manifest
//! with the checkpoint LSN. Runs, manifests and the config file are written
//! to a temp file and renamed into place.

mod checkpoint;
mod codec;
mod compaction;
mod database;
mod db_config;
mod error;
mod manager;
mod manifest;
pub mod ops;
mod pipeline;
mod recovery;
mod registry;
pub mod replication;
pub mod snapshot;
mod tree;
mod worker;

pub use config::{EngineConfig, ReplicationConfig, Role, SyncMode};
pub use database::InsertRecord;
pub use error::{Error, ErrorCode, Result};
pub use ops::TransactionListener;
pub use memtable::{ByteRangeComparator, SharedComparator, DEFAULT_COMPARATOR_ID};
pub use registry::ComparatorFactory;
pub use replication::ReplicationFacade;
pub use snapshot::{KeyFilter, Snapshot, SnapshotConfig};
pub use tree::RangeIter;
pub use wal::{Lsn, OpFuture};

use log::info;
use std::path::Path;
use std::sync::Arc;

use crate::checkpoint::Checkpointer;
use crate::pipeline::EngineCore;
use crate::manager::DatabaseManager;
use crate::ops::{
    CopyDatabaseArgs, CreateDatabaseArgs, CreateSnapshotArgs, DeleteDatabaseArgs,
    DeleteSnapshotArgs, InsertGroupArgs, Operation,
};
use crate::registry::ComparatorRegistry;
use crate::replication::{ClientFactory, LeaseOracle, ReplicationState};
use crate::worker::WorkerPool;

/// Configures and opens an [`Engine`].
///
/// Custom comparators must be registered here, before any database that
/// uses them is loaded. A replicated engine also needs a transport.
pub struct EngineBuilder {
    config: EngineConfig,
    comparators: ComparatorRegistry,
    clients: Option<Arc<dyn ClientFactory>>,
    oracle: Option<Arc<dyn LeaseOracle>>,
}

impl EngineBuilder {
    pub fn new(config: EngineConfig) -> Self {
        Self {
            config,
            comparators: ComparatorRegistry::with_builtins(),
            clients: None,
            oracle: None,
        }
    }

    /// Registers a comparator under its stable id.
    pub fn comparator(mut self, id: &str, factory: ComparatorFactory) -> Self {
        self.comparators.register(id, factory);
        self
    }

    pub fn transport(mut self, clients: Arc<dyn ClientFactory>) -> Self {
        self.clients = Some(clients);
        self
    }

    pub fn lease_oracle(mut self, oracle: Arc<dyn LeaseOracle>) -> Self {
        self.oracle = Some(oracle);
        self
    }

    /// Loads the databases, replays the log and starts the background
    /// threads.
    pub fn open(self) -> Result<Engine> {
        let config = self.config;
        config.validate()?;
        let clients = match (&config.replication, self.clients) {
            (Some(_), None) => {
                return Err(Error::InvalidArgument(
                    "replication is configured but no transport was given".into(),
                ))
            }
            (_, clients) => clients,
        };

        recovery::discard_interrupted_load(&config.base_dir, &config.log_dir)?;
        let manager =
            DatabaseManager::open(&config.base_dir, config.compaction_trigger, self.comparators)?;
        let last = recovery::replay_log(&manager, &config.log_dir, config.sync_mode)?;
        let logger = wal::DiskLogger::open(&config.log_dir, last, config.sync_mode)?;
        let workers = WorkerPool::start(config.worker_count, config.max_queue_len)?;
        let state = match &config.replication {
            Some(repl) => ReplicationState::new(repl),
            None => ReplicationState::standalone(),
        };
        let core = Arc::new(EngineCore::new(config.clone(), manager, logger, workers, state));

        let checkpointer = Checkpointer::start(
            Arc::downgrade(&core),
            config.checkpoint_interval,
            config.max_log_size,
        )?;
        let replication = match (config.replication.clone(), clients) {
            (Some(repl), Some(clients)) => Some(ReplicationFacade::start(
                Arc::clone(&core),
                repl,
                clients,
                self.oracle,
            )?),
            _ => None,
        };

        info!(
            "engine opened at {} with {} databases, log continues after {}",
            config.base_dir.display(),
            core.manager.databases().len(),
            last
        );
        Ok(Engine {
            core,
            checkpointer,
            replication,
        })
    }
}

/// An open TideDB instance.
///
/// # Write Path
///
/// 1. The operation is queued on the worker owning its database.
/// 2. `before` validates it and applies metadata effects.
/// 3. It is appended to the WAL and acknowledged per the sync mode.
/// 4. `after` applies inserts to the trees; a master then waits for its
///    slave quorum.
///
/// # Read Path
///
/// Reads run on the caller thread: active overlay, frozen overlays, then
/// runs newest to oldest. The first hit wins; tombstones hide older values.
///
/// # Recovery
///
/// On [`open`](Engine::open) every database is loaded from its manifest and
/// the WAL is replayed, skipping entries already on disk.
pub struct Engine {
    core: Arc<EngineCore>,
    checkpointer: Checkpointer,
    replication: Option<Arc<ReplicationFacade>>,
}

impl Engine {
    pub fn open(config: EngineConfig) -> Result<Self> {
        EngineBuilder::new(config).open()
    }

    pub fn builder(config: EngineConfig) -> EngineBuilder {
        EngineBuilder::new(config)
    }

    fn run(&self, op: Operation) -> Result<Option<Lsn>> {
        self.clone_handle().submit(op).wait()
    }

    /// Creates a database with `index_count` indices ordered by the default
    /// comparator.
    pub fn create_database(&self, name: &str, index_count: usize) -> Result<Database> {
        let ids = vec![DEFAULT_COMPARATOR_ID; index_count];
        self.create_database_with(name, &ids)
    }

    /// Creates a database with one index per comparator id. A name already
    /// taken, also by a copy still queued, fails at once with `DbExists`.
    pub fn create_database_with(&self, name: &str, comparators: &[&str]) -> Result<Database> {
        if self.core.manager.name_taken(name) {
            return Err(Error::DbExists(name.to_string()));
        }
        self.run(Operation::CreateDatabase(CreateDatabaseArgs {
            name: name.to_string(),
            comparators: comparators.iter().map(|c| c.to_string()).collect(),
            db_id: None,
        }))?;
        self.database(name)
    }

    pub fn delete_database(&self, name: &str) -> Result<()> {
        self.run(Operation::DeleteDatabase(DeleteDatabaseArgs {
            name: name.to_string(),
            db_id: None,
        }))?;
        Ok(())
    }

    /// Copies the current contents of `source` into a new database `dest`.
    /// `dest` is taken before the copy is queued.
    pub fn copy_database(&self, source: &str, dest: &str) -> Result<Database> {
        self.core.manager.claim_name(dest)?;
        let copied = self.run(Operation::CopyDatabase(CopyDatabaseArgs {
            source: source.to_string(),
            dest: dest.to_string(),
            dest_id: None,
        }));
        if copied.is_err() {
            self.core.manager.release_name(dest);
        }
        copied?;
        self.database(dest)
    }

    pub fn database(&self, name: &str) -> Result<Database> {
        let db = self.core.manager.by_name(name)?;
        Ok(Database {
            engine: self.clone_handle(),
            id: db.id(),
            name: db.name().to_string(),
        })
    }

    #[must_use]
    pub fn database_names(&self) -> Vec<String> {
        self.core.manager.names()
    }

    /// Creates a persistent snapshot of `db`.
    pub fn create_snapshot(&self, db: &str, config: SnapshotConfig) -> Result<()> {
        let id = self.core.manager.by_name(db)?.id();
        self.run(Operation::CreateSnapshot(CreateSnapshotArgs { db_id: id, config }))?;
        Ok(())
    }

    pub fn delete_snapshot(&self, db: &str, name: &str) -> Result<()> {
        let id = self.core.manager.by_name(db)?.id();
        self.run(Operation::DeleteSnapshot(DeleteSnapshotArgs {
            db_id: id,
            name: name.to_string(),
        }))?;
        Ok(())
    }

    pub fn snapshot(&self, db: &str, name: &str) -> Result<Arc<Snapshot>> {
        self.core.manager.by_name(db)?.snapshot(name)
    }

    pub fn snapshot_names(&self, db: &str) -> Result<Vec<String>> {
        Ok(self.core.manager.by_name(db)?.snapshot_names())
    }

    /// Runs a checkpoint now. Returns the LSN now reflected on disk.
    pub fn checkpoint(&self) -> Result<Lsn> {
        self.core.checkpoint(false)
    }

    /// Writes a consistent copy of every database to `dest`, openable as
    /// the base directory of another engine. Returns the LSN it reflects.
    pub fn dump_all_databases(&self, dest: impl AsRef<Path>) -> Result<Lsn> {
        self.core.dump(dest.as_ref())
    }

    /// Changes the number of slaves a write waits for at runtime.
    pub fn switch_sync_mode(&self, sync_n: usize) -> Result<()> {
        let facade = self
            .replication
            .as_ref()
            .ok_or_else(|| Error::Replication("replication is disabled".into()))?;
        facade.set_sync_n(sync_n)
    }

    /// Calls `listener` after every operation this engine applies. Returns
    /// an id for [`remove_transaction_listener`](Self::remove_transaction_listener).
    pub fn add_transaction_listener(&self, listener: Arc<dyn TransactionListener>) -> u64 {
        self.core.add_listener(listener)
    }

    pub fn remove_transaction_listener(&self, id: u64) -> bool {
        self.core.remove_listener(id)
    }

    /// LSN of the last entry written to the log.
    #[must_use]
    pub fn latest_lsn(&self) -> Lsn {
        self.core.logger.latest_lsn()
    }

    /// Stops accepting writes and returns the LSN of the last one accepted.
    pub fn pause(&self) -> Lsn {
        match &self.replication {
            Some(r) => r.pause(),
            None => self.core.pause(),
        }
    }

    pub fn resume(&self) {
        match &self.replication {
            Some(r) => r.resume(),
            None => self.core.resume(),
        }
    }

    #[must_use]
    pub fn is_paused(&self) -> bool {
        self.core.is_paused()
    }

    pub fn replication(&self) -> Option<&Arc<ReplicationFacade>> {
        self.replication.as_ref()
    }

    /// Drains the workers, then the logger, then stops the checkpointer and
    /// replication. Idempotent.
    pub fn shutdown(&self) -> Result<()> {
        self.core.workers.shutdown();
        let logged = self.core.logger.shutdown();
        self.checkpointer.shutdown();
        if let Some(r) = &self.replication {
            r.shutdown();
        }
        logged?;
        Ok(())
    }

    fn clone_handle(&self) -> EngineHandle {
        EngineHandle {
            core: Arc::clone(&self.core),
        }
    }
}

/// Best-effort shutdown on drop. Unflushed data stays in the WAL and is
/// replayed on the next open.
impl Drop for Engine {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

impl std::fmt::Debug for Engine {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Engine")
            .field("core", &self.core)
            .field("replication", &self.replication)
            .finish()
    }
}

#[derive(Clone)]
struct EngineHandle {
    core: Arc<EngineCore>,
}

impl EngineHandle {
    fn submit(&self, op: Operation) -> OpFuture<Option<Lsn>, Error> {
        let (promise, future) = wal::promise();
        let core = Arc::clone(&self.core);
        let partition = op.partition_key(&self.core.manager);
        let job = Box::new(move || promise.fulfill(core.execute(op)));
        match self.core.workers.submit(partition, job) {
            Ok(()) => future,
            Err(e) => OpFuture::ready(Err(e)),
        }
    }
}

/// Handle to one database of an [`Engine`].
///
/// The handle resolves the database by id on every call, so it reports
/// `NoSuchDb` once the database was deleted.
#[derive(Clone)]
pub struct Database {
    engine: EngineHandle,
    id: u32,
    name: String,
}

impl Database {
    #[must_use]
    pub fn name(&self) -> &str {
        &self.name
    }

    #[must_use]
    pub fn id(&self) -> u32 {
        self.id
    }

    fn resolve(&self) -> Result<Arc<database::LsmDatabase>> {
        self.engine
            .core
            .manager
            .by_id(self.id)
            .filter(|db| !db.is_deleted())
            .ok_or_else(|| Error::NoSuchDb(self.name.clone()))
    }

    pub fn index_count(&self) -> Result<usize> {
        Ok(self.resolve()?.index_count())
    }

    pub fn create_insert_group(&self) -> InsertGroup {
        InsertGroup {
            db_id: self.id,
            records: Vec::new(),
        }
    }

    /// Submits `group` as one atomic log entry. The future completes with
    /// the entry's LSN, or `None` when the log acknowledges asynchronously.
    pub fn insert(&self, group: InsertGroup) -> OpFuture<Option<Lsn>, Error> {
        if group.db_id != self.id {
            return OpFuture::ready(Err(Error::InvalidArgument(format!(
                "insert group belongs to database #{}, not '{}'",
                group.db_id, self.name
            ))));
        }
        self.engine.submit(Operation::InsertGroup(InsertGroupArgs {
            db_id: group.db_id,
            records: group.records,
        }))
    }

    pub fn put(&self, index: usize, key: &[u8], value: &[u8]) -> Result<()> {
        let mut group = self.create_insert_group();
        group.insert(index, key, value);
        self.insert(group).wait()?;
        Ok(())
    }

    pub fn delete(&self, index: usize, key: &[u8]) -> Result<()> {
        let mut group = self.create_insert_group();
        group.delete(index, key);
        self.insert(group).wait()?;
        Ok(())
    }

    pub fn lookup(&self, index: usize, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.resolve()?.lookup(index, key)
    }

    /// Entries whose key starts with `prefix`, in comparator order.
    pub fn prefix_lookup(&self, index: usize, prefix: &[u8]) -> Result<RangeIter> {
        self.resolve()?.prefix_lookup(index, prefix)
    }

    /// Entries with `from <= key < to`.
    pub fn range_lookup(&self, index: usize, from: &[u8], to: &[u8]) -> Result<RangeIter> {
        self.resolve()?.range_lookup(index, from, to)
    }

    /// Runs `lookup` on the worker owning this database, after the inserts
    /// already queued for it. Refused on a slave. `.wait()` on the future
    /// gives the synchronous form.
    pub fn user_defined_lookup<F, T>(&self, lookup: F) -> OpFuture<T, Error>
    where
        F: FnOnce(&Database) -> Result<T> + Send + 'static,
        T: Send + 'static,
    {
        let core = &self.engine.core;
        if core.replication.is_slave() {
            return OpFuture::ready(Err(Error::Replication(
                "this node is a slave; user-defined lookups go to the master".into(),
            )));
        }
        if let Err(e) = self.resolve() {
            return OpFuture::ready(Err(e));
        }
        let (promise, future) = wal::promise();
        let db = self.clone();
        let job = Box::new(move || promise.fulfill(lookup(&db)));
        match core.workers.submit(self.id as u64, job) {
            Ok(()) => future,
            Err(e) => OpFuture::ready(Err(e)),
        }
    }
}

impl std::fmt::Debug for Database {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Database")
            .field("name", &self.name)
            .field("id", &self.id)
            .finish()
    }
}

/// Inserts and deletes applied together as one log entry.
#[derive(Debug, Clone)]
pub struct InsertGroup {
    db_id: u32,
    records: Vec<InsertRecord>,
}

impl InsertGroup {
    pub fn insert(&mut self, index: usize, key: impl Into<Vec<u8>>, value: impl Into<Vec<u8>>) -> &mut Self {
        self.records.push(InsertRecord {
            index,
            key: key.into(),
            value: Some(value.into()),
        });
        self
    }

    pub fn delete(&mut self, index: usize, key: impl Into<Vec<u8>>) -> &mut Self {
        self.records.push(InsertRecord {
            index,
            key: key.into(),
            value: None,
        });
        self
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.records.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

#[cfg(test)]
mod tests;
