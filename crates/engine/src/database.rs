//! LSMDatabase: the ordered indices of one database, their run files, the
//! manifest tying them to a log position, and the persistent snapshots.

use log::{debug, warn};
use memtable::SharedComparator;
use parking_lot::Mutex;
use sstable::{SSTableReader, SSTableWriter};
use std::collections::{BTreeMap, HashSet};
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};
use wal::Lsn;

use crate::manifest::Manifest;
use crate::snapshot::{self, Snapshot, SnapshotConfig, SnapshotIndex};
use crate::tree::{LsmTree, RangeIter, RunHandle};
use crate::{Error, Result};

/// One record of an insert group, already validated against the database.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct InsertRecord {
    pub index: usize,
    pub key: Vec<u8>,
    /// `None` deletes the key.
    pub value: Option<Vec<u8>>,
}

pub struct LsmDatabase {
    name: String,
    id: u32,
    dir: PathBuf,
    comparators: Vec<SharedComparator>,
    trees: Vec<LsmTree>,
    manifest: Mutex<Manifest>,
    snapshots: Mutex<BTreeMap<String, Arc<Snapshot>>>,
    /// Runs replaced by compaction; their files go once nobody holds them.
    retired: Mutex<Vec<RunHandle>>,
    run_counter: AtomicU64,
    compaction_trigger: usize,
    deleted: AtomicBool,
}

fn open_run(path: &Path, cmp: &SharedComparator) -> Result<RunHandle> {
    Ok(Arc::new(SSTableReader::open(path, Arc::clone(cmp))?))
}

fn remove_tmp_files(dir: &Path) -> Result<()> {
    for entry in fs::read_dir(dir)? {
        let path = entry?.path();
        if path.extension().map_or(false, |e| e == "tmp") {
            debug!("removing leftover {}", path.display());
            fs::remove_file(&path)?;
        }
    }
    Ok(())
}

impl LsmDatabase {
    /// Creates an empty database in `dir`, replacing anything left there.
    pub(crate) fn create(
        name: &str,
        id: u32,
        dir: &Path,
        comparators: Vec<SharedComparator>,
        compaction_trigger: usize,
    ) -> Result<Self> {
        if dir.exists() {
            fs::remove_dir_all(dir)?;
        }
        fs::create_dir_all(dir)?;
        Manifest::load_or_create(dir, comparators.len())?.save()?;
        Self::open(name, id, dir, comparators, compaction_trigger)
    }

    /// Opens the database stored in `dir`. Fails with a corruption error if
    /// the manifest, a run or the snapshot metadata cannot be read.
    pub(crate) fn open(
        name: &str,
        id: u32,
        dir: &Path,
        comparators: Vec<SharedComparator>,
        compaction_trigger: usize,
    ) -> Result<Self> {
        fs::create_dir_all(dir)?;
        remove_tmp_files(dir)?;
        let manifest = Manifest::load_or_create(dir, comparators.len())?;

        let mut trees = Vec::with_capacity(comparators.len());
        for (index, cmp) in comparators.iter().enumerate() {
            let runs = manifest
                .runs(index)
                .iter()
                .map(|run| open_run(&dir.join(run), cmp))
                .collect::<Result<Vec<_>>>()?;
            trees.push(LsmTree::new(Arc::clone(cmp), runs));
        }
        let snapshots = snapshot::load_all(name, dir, &comparators, open_run)?;
        let snapshot_root = dir.join(snapshot::SNAPSHOT_DIR);
        if snapshot_root.is_dir() {
            for entry in fs::read_dir(&snapshot_root)? {
                let entry = entry?;
                let known = entry
                    .file_name()
                    .to_str()
                    .map_or(false, |n| snapshots.contains_key(n));
                if !known {
                    debug!("removing unlisted snapshot dir {}", entry.path().display());
                    fs::remove_dir_all(entry.path())?;
                }
            }
        }

        let seed = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .map(|d| d.as_millis() as u64)
            .unwrap_or(0);
        let db = Self {
            name: name.to_string(),
            id,
            dir: dir.to_path_buf(),
            comparators,
            trees,
            manifest: Mutex::new(manifest),
            snapshots: Mutex::new(snapshots),
            retired: Mutex::new(Vec::new()),
            run_counter: AtomicU64::new(seed),
            compaction_trigger,
            deleted: AtomicBool::new(false),
        };
        db.collect_garbage()?;
        debug!(
            "opened database '{}' (#{}) with {} indices at {}",
            db.name,
            db.id,
            db.trees.len(),
            db.ondisk_lsn()
        );
        Ok(db)
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn id(&self) -> u32 {
        self.id
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn index_count(&self) -> usize {
        self.trees.len()
    }

    pub fn comparator_ids(&self) -> Vec<String> {
        self.comparators.iter().map(|c| c.id().to_string()).collect()
    }

    /// LSN of the last log entry reflected in the on-disk runs.
    pub fn ondisk_lsn(&self) -> Lsn {
        self.manifest.lock().lsn()
    }

    pub(crate) fn mark_deleted(&self) {
        self.deleted.store(true, Ordering::SeqCst);
    }

    pub fn is_deleted(&self) -> bool {
        self.deleted.load(Ordering::SeqCst)
    }

    pub fn tree(&self, index: usize) -> Result<&LsmTree> {
        self.trees.get(index).ok_or_else(|| Error::NoSuchIndex {
            db: self.name.clone(),
            index,
        })
    }

    pub(crate) fn check_records(&self, records: &[InsertRecord]) -> Result<()> {
        for record in records {
            self.tree(record.index)?;
        }
        Ok(())
    }

    /// Applies a validated insert group, grouping records per index.
    pub(crate) fn apply(&self, records: &[InsertRecord]) {
        for (index, tree) in self.trees.iter().enumerate() {
            let mut batch = records
                .iter()
                .filter(|r| r.index == index)
                .map(|r| (r.key.as_slice(), r.value.as_deref()))
                .peekable();
            if batch.peek().is_some() {
                tree.apply(batch);
            }
        }
    }

    pub fn lookup(&self, index: usize, key: &[u8]) -> Result<Option<Vec<u8>>> {
        self.tree(index)?.lookup(key)
    }

    pub fn prefix_lookup(&self, index: usize, prefix: &[u8]) -> Result<RangeIter> {
        Ok(self.tree(index)?.prefix_lookup(prefix))
    }

    pub fn range_lookup(&self, index: usize, from: &[u8], to: &[u8]) -> Result<RangeIter> {
        let tree = self.tree(index)?;
        if tree.comparator().compare(from, to) != std::cmp::Ordering::Less {
            return Ok(RangeIter::empty());
        }
        Ok(tree.range(Some(from), Some(to)))
    }

    pub(crate) fn run_file_name(&self, index: usize, lsn: Lsn) -> String {
        let n = self.run_counter.fetch_add(1, Ordering::SeqCst);
        format!("idx{}-{}-{}-{}.run", index, lsn.view_id, lsn.sequence_no, n)
    }

    /// Pins a view of every index. Returns one snapshot id per index.
    pub(crate) fn create_snapshot(&self) -> Vec<u64> {
        self.trees.iter().map(LsmTree::create_snapshot).collect()
    }

    pub(crate) fn release_snapshot(&self, ids: &[u64]) {
        for (tree, id) in self.trees.iter().zip(ids) {
            tree.release_snapshot(*id);
        }
    }

    /// Flushes the overlays frozen by `ids` into one new run per index and
    /// commits them to the manifest under `lsn`.
    pub(crate) fn write_snapshot(&self, ids: &[u64], lsn: Lsn) -> Result<Vec<Option<RunHandle>>> {
        let mut flushed = Vec::with_capacity(self.trees.len());
        for (index, (tree, id)) in self.trees.iter().zip(ids).enumerate() {
            let view = tree.view(*id).ok_or_else(|| {
                Error::Internal(format!("view {} of index {} is not pinned", id, index))
            })?;
            if !view.has_overlay_data() {
                flushed.push(None);
                continue;
            }
            let name = self.run_file_name(index, lsn);
            let path = self.dir.join(&name);
            let bytes = SSTableWriter::write_from_iterator(&path, view.overlay_entries())?;
            debug!("db '{}' index {}: wrote {} ({} bytes)", self.name, index, name, bytes);
            flushed.push(Some(open_run(&path, tree.comparator())?));
        }

        let mut manifest = self.manifest.lock();
        let mut next = manifest.clone();
        for (index, run) in flushed.iter().enumerate() {
            if let Some(name) = run.as_ref().and_then(snapshot::run_file_name) {
                next.add(index, name);
            }
        }
        next.set_lsn(lsn);
        next.save()?;
        *manifest = next;
        Ok(flushed)
    }

    /// Installs flushed runs, compacts indices over the trigger and deletes
    /// unreferenced run files.
    pub(crate) fn cleanup_snapshot(&self, ids: &[u64], flushed: Vec<Option<RunHandle>>) -> Result<()> {
        for ((tree, id), run) in self.trees.iter().zip(ids).zip(flushed) {
            tree.cleanup_snapshot(*id, run);
        }
        if self.compaction_trigger > 0 {
            for index in 0..self.trees.len() {
                if self.trees[index].runs().len() >= self.compaction_trigger {
                    self.compact_index(index)?;
                }
            }
        }
        self.collect_garbage()?;
        Ok(())
    }

    /// Writes the full contents of the views `ids` into a fresh database
    /// directory, one merged run per index.
    pub(crate) fn write_copy(&self, ids: &[u64], dest: &Path) -> Result<()> {
        fs::create_dir_all(dest)?;
        let mut manifest = Manifest::load_or_create(dest, self.trees.len())?;
        for (index, (tree, id)) in self.trees.iter().zip(ids).enumerate() {
            let view = tree.view(*id).ok_or_else(|| {
                Error::Internal(format!("view {} of index {} is not pinned", id, index))
            })?;
            let name = self.run_file_name(index, Lsn::ZERO);
            SSTableWriter::write_from_iterator(&dest.join(&name), view.materialize())?;
            manifest.add(index, name);
        }
        manifest.save()
    }

    pub(crate) fn retire(&self, runs: Vec<RunHandle>) {
        self.retired.lock().extend(runs);
    }

    pub(crate) fn manifest(&self) -> parking_lot::MutexGuard<'_, Manifest> {
        self.manifest.lock()
    }

    /// Deletes run files referenced by neither the manifest, a persistent
    /// snapshot, nor a live handle. Returns the number of files removed.
    pub(crate) fn collect_garbage(&self) -> Result<usize> {
        let mut keep: HashSet<String> = self.manifest.lock().all_runs().map(str::to_string).collect();
        for snap in self.snapshots.lock().values() {
            keep.extend(snap.shared_runs());
        }
        {
            let mut retired = self.retired.lock();
            retired.retain(|run| Arc::strong_count(run) > 1);
            keep.extend(retired.iter().filter_map(snapshot::run_file_name));
        }

        let mut removed = 0;
        for entry in fs::read_dir(&self.dir)? {
            let path = entry?.path();
            if path.extension().map_or(true, |e| e != "run") {
                continue;
            }
            let name = match path.file_name().and_then(|n| n.to_str()) {
                Some(name) => name,
                None => continue,
            };
            if !keep.contains(name) {
                fs::remove_file(&path)?;
                removed += 1;
            }
        }
        if removed > 0 {
            debug!("db '{}': removed {} unreferenced runs", self.name, removed);
        }
        Ok(removed)
    }

    // --- persistent snapshots ---

    pub fn snapshot(&self, name: &str) -> Result<Arc<Snapshot>> {
        self.snapshots
            .lock()
            .get(name)
            .cloned()
            .ok_or_else(|| Error::NoSuchSnapshot {
                db: self.name.clone(),
                snapshot: name.to_string(),
            })
    }

    pub fn has_snapshot(&self, name: &str) -> bool {
        self.snapshots.lock().contains_key(name)
    }

    pub fn snapshot_names(&self) -> Vec<String> {
        self.snapshots.lock().keys().cloned().collect()
    }

    pub(crate) fn check_snapshot_config(&self, config: &SnapshotConfig) -> Result<()> {
        config.validate()?;
        for index in config.indices() {
            self.tree(index)?;
        }
        if self.has_snapshot(config.name()) {
            return Err(Error::SnapshotExists {
                db: self.name.clone(),
                snapshot: config.name().to_string(),
            });
        }
        Ok(())
    }

    /// Captures the indices named by `config` and persists the snapshot.
    pub(crate) fn create_persistent_snapshot(&self, config: &SnapshotConfig) -> Result<()> {
        self.check_snapshot_config(config)?;
        let mut snapshots = self.snapshots.lock();
        let pinned: Vec<(usize, u64)> = config
            .indices()
            .map(|index| (index, self.trees[index].create_snapshot()))
            .collect();
        let dir = snapshot::snapshot_dir(&self.dir, config.name());
        let built = self.materialize_snapshot(config, &pinned, &dir);
        for (index, id) in &pinned {
            self.trees[*index].release_snapshot(*id);
        }
        let snap = match built {
            Ok(snap) => Arc::new(snap),
            Err(e) => {
                let _ = fs::remove_dir_all(&dir);
                return Err(e);
            }
        };

        snapshots.insert(config.name().to_string(), snap);
        if let Err(e) = snapshot::save_all(&self.dir, snapshots.values().map(Arc::as_ref)) {
            snapshots.remove(config.name());
            let _ = fs::remove_dir_all(&dir);
            return Err(e);
        }
        debug!("db '{}': created snapshot '{}'", self.name, config.name());
        Ok(())
    }

    fn materialize_snapshot(
        &self,
        config: &SnapshotConfig,
        pinned: &[(usize, u64)],
        dir: &Path,
    ) -> Result<Snapshot> {
        if dir.exists() {
            fs::remove_dir_all(dir)?;
        }
        fs::create_dir_all(dir)?;
        let mut indices = BTreeMap::new();
        for (index, id) in pinned {
            let index = *index;
            let tree = &self.trees[index];
            let view = tree
                .view(*id)
                .ok_or_else(|| Error::Internal(format!("view {} of index {} is not pinned", id, index)))?;
            let overlay = if view.has_overlay_data() {
                let path = dir.join(snapshot::overlay_run_name(index));
                let entries = view.overlay_entries().filter(|item| match item {
                    Ok((key, _)) => config.accepts(index, key),
                    Err(_) => true,
                });
                SSTableWriter::write_from_iterator(&path, entries)?;
                Some(open_run(&path, tree.comparator())?)
            } else {
                None
            };
            indices.insert(
                index,
                SnapshotIndex {
                    cmp: Arc::clone(tree.comparator()),
                    overlay,
                    runs: view.runs().to_vec(),
                },
            );
        }
        Ok(Snapshot::new(self.name.clone(), config.clone(), indices))
    }

    pub(crate) fn delete_persistent_snapshot(&self, name: &str) -> Result<()> {
        {
            let mut snapshots = self.snapshots.lock();
            let removed = snapshots.remove(name).ok_or_else(|| Error::NoSuchSnapshot {
                db: self.name.clone(),
                snapshot: name.to_string(),
            })?;
            if let Err(e) = snapshot::save_all(&self.dir, snapshots.values().map(Arc::as_ref)) {
                snapshots.insert(name.to_string(), removed);
                return Err(e);
            }
        }
        if let Err(e) = fs::remove_dir_all(snapshot::snapshot_dir(&self.dir, name)) {
            if e.kind() != std::io::ErrorKind::NotFound {
                warn!("db '{}': could not remove snapshot dir of '{}': {}", self.name, name, e);
            }
        }
        self.collect_garbage()?;
        debug!("db '{}': deleted snapshot '{}'", self.name, name);
        Ok(())
    }
}

impl std::fmt::Debug for LsmDatabase {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("LsmDatabase")
            .field("name", &self.name)
            .field("id", &self.id)
            .field("dir", &self.dir)
            .field("indices", &self.trees.len())
            .finish()
    }
}
