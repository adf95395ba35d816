//! Logged operations and their processing stages.
//!
//! Every mutation of the engine is an [`Operation`]. The same value is
//! processed for a live call, for WAL replay at startup and for entries a
//! slave receives from its master, through three stages:
//!
//! * `before`: validation and metadata side effects (registering a
//!   database, writing a snapshot); runs before the log append.
//! * `meanwhile`: applies inserts right away when the log acknowledges
//!   asynchronously.
//! * `after`: applies inserts once the entry is durable.
//!
//! Replay runs `before` and `after` directly. Metadata effects already
//! reflected on disk are recognised in `before` and skipped.
//!
//! Payload: `[kind: u8]` followed by the fields of the kind.

use config::SyncMode;
use log::warn;
use std::sync::Arc;
use wal::Lsn;

use crate::codec::{self, Decoder};
use crate::database::{InsertRecord, LsmDatabase};
use crate::manager::{db_dir, DatabaseManager};
use crate::snapshot::SnapshotConfig;
use crate::{Error, Result};

/// Largest key accepted by an insert.
pub const MAX_KEY_SIZE: usize = 64 * 1024;
/// Largest value accepted by an insert.
pub const MAX_VALUE_SIZE: usize = 16 * 1024 * 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpKind {
    InsertGroup = 1,
    CreateDatabase = 2,
    DeleteDatabase = 3,
    CopyDatabase = 4,
    CreateSnapshot = 5,
    DeleteSnapshot = 6,
}

impl OpKind {
    fn from_tag(tag: u8) -> Result<Self> {
        Ok(match tag {
            1 => OpKind::InsertGroup,
            2 => OpKind::CreateDatabase,
            3 => OpKind::DeleteDatabase,
            4 => OpKind::CopyDatabase,
            5 => OpKind::CreateSnapshot,
            6 => OpKind::DeleteSnapshot,
            other => {
                return Err(Error::Corruption(format!("unknown operation kind {}", other)))
            }
        })
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsertGroupArgs {
    pub db_id: u32,
    pub records: Vec<InsertRecord>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateDatabaseArgs {
    pub name: String,
    pub comparators: Vec<String>,
    /// Assigned in `before` of the live call.
    pub db_id: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteDatabaseArgs {
    pub name: String,
    pub db_id: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CopyDatabaseArgs {
    pub source: String,
    pub dest: String,
    pub dest_id: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreateSnapshotArgs {
    pub db_id: u32,
    pub config: SnapshotConfig,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeleteSnapshotArgs {
    pub db_id: u32,
    pub name: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Operation {
    InsertGroup(InsertGroupArgs),
    CreateDatabase(CreateDatabaseArgs),
    DeleteDatabase(DeleteDatabaseArgs),
    CopyDatabase(CopyDatabaseArgs),
    CreateSnapshot(CreateSnapshotArgs),
    DeleteSnapshot(DeleteSnapshotArgs),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) enum Mode {
    Live,
    /// Entry at this LSN read back from the log or received from a master.
    Replay(Lsn),
}

pub(crate) struct StageContext<'a> {
    pub manager: &'a DatabaseManager,
    pub mode: Mode,
    pub sync_mode: SyncMode,
}

/// Outcome of `before`.
pub(crate) enum Prepared {
    /// Insert group validated against this database.
    Insert(Arc<LsmDatabase>),
    /// Metadata effect applied.
    Applied,
    /// Replay found the effect already reflected.
    Skipped,
}

impl Operation {
    pub fn kind(&self) -> OpKind {
        match self {
            Operation::InsertGroup(_) => OpKind::InsertGroup,
            Operation::CreateDatabase(_) => OpKind::CreateDatabase,
            Operation::DeleteDatabase(_) => OpKind::DeleteDatabase,
            Operation::CopyDatabase(_) => OpKind::CopyDatabase,
            Operation::CreateSnapshot(_) => OpKind::CreateSnapshot,
            Operation::DeleteSnapshot(_) => OpKind::DeleteSnapshot,
        }
    }

    pub fn is_metadata(&self) -> bool {
        !matches!(self, Operation::InsertGroup(_))
    }

    /// Key used to pick the worker of this operation: the id of the
    /// database it reads or changes, so that it queues behind the inserts
    /// already submitted for that database. Names not registered yet hash.
    pub(crate) fn partition_key(&self, manager: &DatabaseManager) -> u64 {
        let by_name = |name: &str| {
            manager
                .by_name(name)
                .map_or_else(|_| name_hash(name), |db| db.id() as u64)
        };
        match self {
            Operation::InsertGroup(a) => a.db_id as u64,
            Operation::CreateSnapshot(a) => a.db_id as u64,
            Operation::DeleteSnapshot(a) => a.db_id as u64,
            Operation::CreateDatabase(a) => name_hash(&a.name),
            Operation::DeleteDatabase(a) => by_name(&a.name),
            Operation::CopyDatabase(a) => by_name(&a.source),
        }
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        codec::put_u8(&mut buf, self.kind() as u8);
        match self {
            Operation::InsertGroup(a) => {
                codec::put_u32(&mut buf, a.db_id);
                codec::put_u32(&mut buf, a.records.len() as u32);
                for r in &a.records {
                    codec::put_u32(&mut buf, r.index as u32);
                    codec::put_bytes(&mut buf, &r.key);
                    codec::put_opt_bytes(&mut buf, r.value.as_deref());
                }
            }
            Operation::CreateDatabase(a) => {
                codec::put_str(&mut buf, &a.name);
                codec::put_opt_u32(&mut buf, a.db_id);
                codec::put_u32(&mut buf, a.comparators.len() as u32);
                for c in &a.comparators {
                    codec::put_str(&mut buf, c);
                }
            }
            Operation::DeleteDatabase(a) => {
                codec::put_str(&mut buf, &a.name);
                codec::put_opt_u32(&mut buf, a.db_id);
            }
            Operation::CopyDatabase(a) => {
                codec::put_str(&mut buf, &a.source);
                codec::put_str(&mut buf, &a.dest);
                codec::put_opt_u32(&mut buf, a.dest_id);
            }
            Operation::CreateSnapshot(a) => {
                codec::put_u32(&mut buf, a.db_id);
                a.config.encode(&mut buf);
            }
            Operation::DeleteSnapshot(a) => {
                codec::put_u32(&mut buf, a.db_id);
                codec::put_str(&mut buf, &a.name);
            }
        }
        buf
    }

    pub fn decode(payload: &[u8]) -> Result<Self> {
        let mut dec = Decoder::new(payload, "log payload");
        let op = match OpKind::from_tag(dec.u8()?)? {
            OpKind::InsertGroup => {
                let db_id = dec.u32()?;
                let count = dec.u32()?;
                let mut records = Vec::with_capacity(count.min(1024) as usize);
                for _ in 0..count {
                    records.push(InsertRecord {
                        index: dec.u32()? as usize,
                        key: dec.bytes()?,
                        value: dec.opt_bytes()?,
                    });
                }
                Operation::InsertGroup(InsertGroupArgs { db_id, records })
            }
            OpKind::CreateDatabase => {
                let name = dec.string()?;
                let db_id = dec.opt_u32()?;
                let comparators = (0..dec.u32()?)
                    .map(|_| dec.string())
                    .collect::<Result<Vec<_>>>()?;
                Operation::CreateDatabase(CreateDatabaseArgs {
                    name,
                    comparators,
                    db_id,
                })
            }
            OpKind::DeleteDatabase => Operation::DeleteDatabase(DeleteDatabaseArgs {
                name: dec.string()?,
                db_id: dec.opt_u32()?,
            }),
            OpKind::CopyDatabase => Operation::CopyDatabase(CopyDatabaseArgs {
                source: dec.string()?,
                dest: dec.string()?,
                dest_id: dec.opt_u32()?,
            }),
            OpKind::CreateSnapshot => Operation::CreateSnapshot(CreateSnapshotArgs {
                db_id: dec.u32()?,
                config: SnapshotConfig::decode(&mut dec)?,
            }),
            OpKind::DeleteSnapshot => Operation::DeleteSnapshot(DeleteSnapshotArgs {
                db_id: dec.u32()?,
                name: dec.string()?,
            }),
        };
        dec.finish()?;
        Ok(op)
    }

    /// Validates and applies metadata effects. In live mode fills in the
    /// ids the log entry must carry.
    pub(crate) fn before(&mut self, ctx: &StageContext<'_>) -> Result<Prepared> {
        let manager = ctx.manager;
        match (self, ctx.mode) {
            (Operation::InsertGroup(a), mode) => {
                let db = match (manager.by_id(a.db_id), mode) {
                    (Some(db), _) => db,
                    (None, Mode::Live) => return Err(Error::no_such_db_id(a.db_id)),
                    (None, Mode::Replay(lsn)) => {
                        warn!("skipping entry {} for deleted database #{}", lsn, a.db_id);
                        return Ok(Prepared::Skipped);
                    }
                };
                if let Mode::Replay(lsn) = mode {
                    if lsn <= db.ondisk_lsn() {
                        return Ok(Prepared::Skipped);
                    }
                }
                db.check_records(&a.records)?;
                for r in &a.records {
                    if r.key.len() > MAX_KEY_SIZE {
                        return Err(Error::InvalidArgument(format!(
                            "key of {} bytes exceeds {}",
                            r.key.len(),
                            MAX_KEY_SIZE
                        )));
                    }
                    if r.value.as_ref().map_or(0, Vec::len) > MAX_VALUE_SIZE {
                        return Err(Error::InvalidArgument(format!(
                            "value exceeds {} bytes",
                            MAX_VALUE_SIZE
                        )));
                    }
                }
                Ok(Prepared::Insert(db))
            }

            (Operation::CreateDatabase(a), Mode::Live) => {
                let db = manager.create_database(&a.name, &a.comparators, None)?;
                a.db_id = Some(db.id());
                Ok(Prepared::Applied)
            }
            (Operation::CreateDatabase(a), Mode::Replay(_)) => {
                let id = logged_id(a.db_id, "create")?;
                if id < manager.next_db_id() {
                    return Ok(Prepared::Skipped);
                }
                manager.create_database(&a.name, &a.comparators, Some(id))?;
                Ok(Prepared::Applied)
            }

            (Operation::DeleteDatabase(a), Mode::Live) => {
                a.db_id = Some(manager.delete_database(&a.name)?);
                Ok(Prepared::Applied)
            }
            (Operation::DeleteDatabase(a), Mode::Replay(_)) => {
                let id = logged_id(a.db_id, "delete")?;
                match manager.by_id(id) {
                    Some(db) if db.name() == a.name => {
                        manager.delete_database(&a.name)?;
                        Ok(Prepared::Applied)
                    }
                    _ => Ok(Prepared::Skipped),
                }
            }

            (Operation::CopyDatabase(a), mode) => {
                let dest_id = match mode {
                    Mode::Live => None,
                    Mode::Replay(_) => {
                        let id = logged_id(a.dest_id, "copy")?;
                        if id < manager.next_db_id() {
                            return Ok(Prepared::Skipped);
                        }
                        Some(id)
                    }
                };
                let source = manager.by_name(&a.source)?;
                let id = manager.reserve(&a.dest, dest_id)?;
                if let Err(e) = copy_into(manager, &source, &a.dest, id) {
                    manager.cancel_reservation(&a.dest, id);
                    return Err(e);
                }
                a.dest_id = Some(id);
                Ok(Prepared::Applied)
            }

            (Operation::CreateSnapshot(a), mode) => {
                let db = match target_db(manager, a.db_id, mode)? {
                    Some(db) => db,
                    None => return Ok(Prepared::Skipped),
                };
                if matches!(mode, Mode::Replay(_)) && db.has_snapshot(a.config.name()) {
                    return Ok(Prepared::Skipped);
                }
                db.create_persistent_snapshot(&a.config)?;
                Ok(Prepared::Applied)
            }

            (Operation::DeleteSnapshot(a), mode) => {
                let db = match target_db(manager, a.db_id, mode)? {
                    Some(db) => db,
                    None => return Ok(Prepared::Skipped),
                };
                if matches!(mode, Mode::Replay(_)) && !db.has_snapshot(&a.name) {
                    return Ok(Prepared::Skipped);
                }
                db.delete_persistent_snapshot(&a.name)?;
                Ok(Prepared::Applied)
            }
        }
    }

    /// Applies an insert group before durability when the log is async.
    pub(crate) fn meanwhile(&self, ctx: &StageContext<'_>, prepared: &Prepared) {
        if ctx.mode == Mode::Live && ctx.sync_mode.is_async() {
            self.apply(prepared);
        }
    }

    /// Applies an insert group once durable. A no-op for async live calls,
    /// which were applied in `meanwhile`.
    pub(crate) fn after(&self, ctx: &StageContext<'_>, prepared: &Prepared) {
        if ctx.mode != Mode::Live || !ctx.sync_mode.is_async() {
            self.apply(prepared);
        }
    }

    fn apply(&self, prepared: &Prepared) {
        if let (Operation::InsertGroup(a), Prepared::Insert(db)) = (self, prepared) {
            db.apply(&a.records);
        }
    }
}

fn name_hash(name: &str) -> u64 {
    // FNV-1a
    name.bytes().fold(0xcbf2_9ce4_8422_2325, |h, b| {
        (h ^ b as u64).wrapping_mul(0x0100_0000_01b3)
    })
}

fn logged_id(id: Option<u32>, what: &str) -> Result<u32> {
    id.ok_or_else(|| Error::Corruption(format!("logged {} operation carries no database id", what)))
}

/// Database targeted by a snapshot operation. `None` in replay when the
/// database is gone or already past the entry.
fn target_db(manager: &DatabaseManager, db_id: u32, mode: Mode) -> Result<Option<Arc<LsmDatabase>>> {
    match (manager.by_id(db_id), mode) {
        (Some(db), Mode::Live) => Ok(Some(db)),
        (None, Mode::Live) => Err(Error::no_such_db_id(db_id)),
        (Some(db), Mode::Replay(lsn)) if lsn > db.ondisk_lsn() => Ok(Some(db)),
        (_, Mode::Replay(_)) => Ok(None),
    }
}

fn copy_into(manager: &DatabaseManager, source: &LsmDatabase, dest: &str, id: u32) -> Result<()> {
    let ids = source.create_snapshot();
    let written = source.write_copy(&ids, &db_dir(manager.base_dir(), id));
    source.release_snapshot(&ids);
    written?;
    manager.complete_reservation(dest, id, &source.comparator_ids())?;
    Ok(())
}

/// Observer of the operations an engine applies, live or received from a
/// master. Called on the applying thread once the operation took effect,
/// outside the engine's locks; `lsn` is `None` for an insert acknowledged
/// before it was durable.
pub trait TransactionListener: Send + Sync {
    fn operation_applied(&self, lsn: Option<Lsn>, op: &Operation);
}
