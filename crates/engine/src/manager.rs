//! DatabaseManager: the registry of open databases.
//!
//! Databases are reachable by name and by id. Both maps live under one
//! mutex which is also held while the configuration file is rewritten, so
//! the registry a reader sees always matches the file on disk.

use log::{debug, info, warn};
use memtable::SharedComparator;
use parking_lot::Mutex;
use std::collections::HashMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::database::LsmDatabase;
use crate::db_config::{DbConfig, DbEntry, CONFIG_FILENAME};
use crate::registry::ComparatorRegistry;
use crate::{Error, Result};

const DB_DIR_PREFIX: &str = "db-";

enum Slot {
    /// Name held by a copy still queued for its turn.
    Claimed,
    /// Name taken by a copy that is still materializing.
    Reserved(u32),
    Open(Arc<LsmDatabase>),
}

struct Registry {
    by_name: HashMap<String, Slot>,
    by_id: HashMap<u32, Arc<LsmDatabase>>,
    next_db_id: u32,
}

pub(crate) struct DatabaseManager {
    base_dir: PathBuf,
    compaction_trigger: usize,
    registry: Mutex<Registry>,
    comparators: Mutex<ComparatorRegistry>,
}

pub(crate) fn db_dir(base_dir: &Path, id: u32) -> PathBuf {
    base_dir.join(format!("{}{}", DB_DIR_PREFIX, id))
}

fn db_dir_id(name: &str) -> Option<u32> {
    name.strip_prefix(DB_DIR_PREFIX)?.parse().ok()
}

pub(crate) fn is_db_dir_name(name: &str) -> bool {
    db_dir_id(name).is_some()
}

impl DatabaseManager {
    pub fn open(
        base_dir: &Path,
        compaction_trigger: usize,
        mut comparators: ComparatorRegistry,
    ) -> Result<Self> {
        fs::create_dir_all(base_dir)?;
        let registry = Self::load_registry(base_dir, compaction_trigger, &mut comparators)?;
        Ok(Self {
            base_dir: base_dir.to_path_buf(),
            compaction_trigger,
            registry: Mutex::new(registry),
            comparators: Mutex::new(comparators),
        })
    }

    fn load_registry(
        base_dir: &Path,
        compaction_trigger: usize,
        comparators: &mut ComparatorRegistry,
    ) -> Result<Registry> {
        let config = DbConfig::load(&base_dir.join(CONFIG_FILENAME))?.unwrap_or_default();
        let mut registry = Registry {
            by_name: HashMap::new(),
            by_id: HashMap::new(),
            next_db_id: config.next_db_id,
        };
        for entry in config.databases {
            let cmps = entry
                .comparators
                .iter()
                .map(|id| comparators.get(id))
                .collect::<Result<Vec<_>>>()?;
            let db = Arc::new(LsmDatabase::open(
                &entry.name,
                entry.id,
                &db_dir(base_dir, entry.id),
                cmps,
                compaction_trigger,
            )?);
            registry.by_id.insert(entry.id, Arc::clone(&db));
            registry.by_name.insert(entry.name, Slot::Open(db));
        }

        // directories of databases that never made it into the config file
        for entry in fs::read_dir(base_dir)? {
            let entry = entry?;
            let name = entry.file_name();
            let id = name.to_str().and_then(db_dir_id);
            if let Some(id) = id {
                if !registry.by_id.contains_key(&id) && entry.path().is_dir() {
                    warn!("removing orphaned database directory {}", entry.path().display());
                    fs::remove_dir_all(entry.path())?;
                }
            }
        }
        info!(
            "loaded {} databases from {}",
            registry.by_id.len(),
            base_dir.display()
        );
        Ok(registry)
    }

    /// Re-reads the configuration file and reopens every database, after
    /// the files underneath were replaced. Cached comparators are dropped.
    pub fn reload(&self) -> Result<()> {
        let mut comparators = self.comparators.lock();
        comparators.reset();
        let fresh = Self::load_registry(&self.base_dir, self.compaction_trigger, &mut comparators)?;
        let mut registry = self.registry.lock();
        for db in registry.by_id.values() {
            db.mark_deleted();
        }
        *registry = fresh;
        Ok(())
    }

    pub fn base_dir(&self) -> &Path {
        &self.base_dir
    }

    pub fn config_path(&self) -> PathBuf {
        self.base_dir.join(CONFIG_FILENAME)
    }

    pub fn by_name(&self, name: &str) -> Result<Arc<LsmDatabase>> {
        match self.registry.lock().by_name.get(name) {
            Some(Slot::Open(db)) => Ok(Arc::clone(db)),
            _ => Err(Error::NoSuchDb(name.to_string())),
        }
    }

    pub fn by_id(&self, id: u32) -> Option<Arc<LsmDatabase>> {
        self.registry.lock().by_id.get(&id).cloned()
    }

    /// Open databases ordered by id.
    pub fn databases(&self) -> Vec<Arc<LsmDatabase>> {
        let mut dbs: Vec<_> = self.registry.lock().by_id.values().cloned().collect();
        dbs.sort_by_key(|db| db.id());
        dbs
    }

    pub fn names(&self) -> Vec<String> {
        let mut names: Vec<String> = self
            .registry
            .lock()
            .by_name
            .iter()
            .filter(|(_, slot)| matches!(slot, Slot::Open(_)))
            .map(|(name, _)| name.clone())
            .collect();
        names.sort();
        names
    }

    pub fn next_db_id(&self) -> u32 {
        self.registry.lock().next_db_id
    }

    pub fn resolve_comparators(&self, ids: &[String]) -> Result<Vec<SharedComparator>> {
        let mut comparators = self.comparators.lock();
        ids.iter()
            .map(|id| {
                if !comparators.contains(id) {
                    return Err(Error::InvalidArgument(format!("unknown comparator '{}'", id)));
                }
                comparators.get(id)
            })
            .collect()
    }

    fn persist(&self, registry: &Registry) -> Result<()> {
        let mut databases: Vec<DbEntry> = registry
            .by_id
            .values()
            .map(|db| DbEntry {
                name: db.name().to_string(),
                id: db.id(),
                comparators: db.comparator_ids(),
            })
            .collect();
        databases.sort_by_key(|e| e.id);
        DbConfig {
            next_db_id: registry.next_db_id,
            databases,
        }
        .save(&self.config_path())
    }

    fn claim_id(registry: &mut Registry, name: &str, id: Option<u32>) -> Result<u32> {
        if registry.by_name.contains_key(name) {
            return Err(Error::DbExists(name.to_string()));
        }
        let id = id.unwrap_or(registry.next_db_id);
        if registry.by_id.contains_key(&id) {
            return Err(Error::Internal(format!("database id {} is already in use", id)));
        }
        Ok(id)
    }

    /// Registers a new empty database. `id` is `None` for a live call and
    /// the logged id when replaying.
    pub fn create_database(
        &self,
        name: &str,
        comparator_ids: &[String],
        id: Option<u32>,
    ) -> Result<Arc<LsmDatabase>> {
        if name.is_empty() {
            return Err(Error::InvalidArgument("database name is empty".into()));
        }
        if comparator_ids.is_empty() {
            return Err(Error::InvalidArgument(format!(
                "database '{}' needs at least one index",
                name
            )));
        }
        let cmps = self.resolve_comparators(comparator_ids)?;

        let mut registry = self.registry.lock();
        let id = Self::claim_id(&mut registry, name, id)?;
        let dir = db_dir(&self.base_dir, id);
        let db = Arc::new(LsmDatabase::create(name, id, &dir, cmps, self.compaction_trigger)?);

        let prev_next = registry.next_db_id;
        registry.next_db_id = registry.next_db_id.max(id + 1);
        registry.by_id.insert(id, Arc::clone(&db));
        registry.by_name.insert(name.to_string(), Slot::Open(Arc::clone(&db)));
        if let Err(e) = self.persist(&registry) {
            registry.by_id.remove(&id);
            registry.by_name.remove(name);
            registry.next_db_id = prev_next;
            let _ = fs::remove_dir_all(&dir);
            return Err(e);
        }
        debug!("created database '{}' (#{})", name, id);
        Ok(db)
    }

    /// Unregisters and removes a database. Returns its id.
    pub fn delete_database(&self, name: &str) -> Result<u32> {
        let mut registry = self.registry.lock();
        let db = match registry.by_name.get(name) {
            Some(Slot::Open(db)) => Arc::clone(db),
            _ => return Err(Error::NoSuchDb(name.to_string())),
        };
        let id = db.id();
        registry.by_name.remove(name);
        registry.by_id.remove(&id);
        if let Err(e) = self.persist(&registry) {
            registry.by_id.insert(id, Arc::clone(&db));
            registry.by_name.insert(name.to_string(), Slot::Open(db));
            return Err(e);
        }
        drop(registry);

        db.mark_deleted();
        if let Err(e) = fs::remove_dir_all(db.dir()) {
            warn!("could not remove directory of deleted database '{}': {}", name, e);
        }
        debug!("deleted database '{}' (#{})", name, id);
        Ok(id)
    }

    /// True when `name` is open, being copied into or claimed.
    pub fn name_taken(&self, name: &str) -> bool {
        self.registry.lock().by_name.contains_key(name)
    }

    /// Holds `name` for a copy before it is queued, so that a concurrent
    /// create of the same name fails at once with `DbExists`.
    pub fn claim_name(&self, name: &str) -> Result<()> {
        if name.is_empty() {
            return Err(Error::InvalidArgument("database name is empty".into()));
        }
        let mut registry = self.registry.lock();
        if registry.by_name.contains_key(name) {
            return Err(Error::DbExists(name.to_string()));
        }
        registry.by_name.insert(name.to_string(), Slot::Claimed);
        Ok(())
    }

    /// Drops a claim that never turned into a reservation.
    pub fn release_name(&self, name: &str) {
        let mut registry = self.registry.lock();
        if matches!(registry.by_name.get(name), Some(Slot::Claimed)) {
            registry.by_name.remove(name);
        }
    }

    /// Takes `name` for a copy in progress. Returns the id the copy will get.
    /// A live copy (`id` is `None`) turns its own claim into the reservation.
    pub fn reserve(&self, name: &str, id: Option<u32>) -> Result<u32> {
        if name.is_empty() {
            return Err(Error::InvalidArgument("database name is empty".into()));
        }
        let mut registry = self.registry.lock();
        if id.is_none() && matches!(registry.by_name.get(name), Some(Slot::Claimed)) {
            registry.by_name.remove(name);
        }
        let id = Self::claim_id(&mut registry, name, id)?;
        registry.next_db_id = registry.next_db_id.max(id + 1);
        registry.by_name.insert(name.to_string(), Slot::Reserved(id));
        Ok(id)
    }

    /// Opens the materialized copy in the reserved slot and persists it.
    pub fn complete_reservation(
        &self,
        name: &str,
        id: u32,
        comparator_ids: &[String],
    ) -> Result<Arc<LsmDatabase>> {
        let cmps = self.resolve_comparators(comparator_ids)?;
        let mut registry = self.registry.lock();
        if !matches!(registry.by_name.get(name), Some(Slot::Reserved(r)) if *r == id) {
            return Err(Error::Internal(format!("no reservation for '{}' (#{})", name, id)));
        }
        let db = Arc::new(LsmDatabase::open(
            name,
            id,
            &db_dir(&self.base_dir, id),
            cmps,
            self.compaction_trigger,
        )?);
        registry.by_id.insert(id, Arc::clone(&db));
        registry.by_name.insert(name.to_string(), Slot::Open(Arc::clone(&db)));
        if let Err(e) = self.persist(&registry) {
            registry.by_id.remove(&id);
            registry.by_name.insert(name.to_string(), Slot::Reserved(id));
            return Err(e);
        }
        debug!("completed copy into '{}' (#{})", name, id);
        Ok(db)
    }

    /// Frees the reserved slot and the partial copy. A slot that no longer
    /// holds this reservation is left alone.
    pub fn cancel_reservation(&self, name: &str, id: u32) {
        let mut registry = self.registry.lock();
        if !matches!(registry.by_name.get(name), Some(Slot::Reserved(r)) if *r == id) {
            return;
        }
        registry.by_name.remove(name);
        drop(registry);
        if let Err(e) = fs::remove_dir_all(db_dir(&self.base_dir, id)) {
            debug!("no partial copy of '{}' (#{}) to remove: {}", name, id, e);
        }
    }
}

impl std::fmt::Debug for DatabaseManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let registry = self.registry.lock();
        f.debug_struct("DatabaseManager")
            .field("base_dir", &self.base_dir)
            .field("databases", &registry.by_id.len())
            .field("next_db_id", &registry.next_db_id)
            .finish()
    }
}
