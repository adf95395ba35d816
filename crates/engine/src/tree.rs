//! # LSMTree - one index of a database
//!
//! Layers, newest first:
//!
//! 1. the **active overlay**, a mutable [`Memtable`] receiving inserts;
//! 2. **frozen overlays**, former active overlays sealed by
//!    [`LsmTree::create_snapshot`] and waiting to be flushed by a checkpoint;
//! 3. **runs**, immutable on-disk files, newest first.
//!
//! A lookup returns the first hit walking that order; a tombstone hit means
//! absent. Snapshots pin a [`TreeView`]: shared handles to the frozen
//! overlays and runs that existed at creation, unaffected by later inserts,
//! flushes or compactions.

use memtable::{Memtable, SharedComparator};
use parking_lot::RwLock;
use sstable::{Entry, EntrySource, MergeIterator, SSTableReader};
use std::collections::BTreeMap;
use std::sync::Arc;

use crate::{Error, Result};

pub type RunHandle = Arc<SSTableReader>;

struct Layers {
    active: Memtable,
    /// `(snapshot id, overlay)`, newest first.
    frozen: Vec<(u64, Arc<Memtable>)>,
    /// Newest first.
    runs: Vec<RunHandle>,
    pinned: BTreeMap<u64, TreeView>,
    next_snapshot_id: u64,
}

pub struct LsmTree {
    cmp: SharedComparator,
    layers: RwLock<Layers>,
}

/// Immutable view of a tree as of one snapshot.
#[derive(Clone)]
pub struct TreeView {
    cmp: SharedComparator,
    overlays: Vec<Arc<Memtable>>,
    runs: Vec<RunHandle>,
}

fn copy_overlay(
    mem: &Memtable,
    start: Option<&[u8]>,
    end: Option<&[u8]>,
) -> Vec<sstable::Result<Entry>> {
    mem.range(start, end)
        .map(|(k, v)| Ok((k.to_vec(), v.map(<[u8]>::to_vec))))
        .collect()
}

fn search_runs(runs: &[RunHandle], key: &[u8]) -> Result<Option<Vec<u8>>> {
    for run in runs {
        if let Some(entry) = run.get(key)? {
            return Ok(entry);
        }
    }
    Ok(None)
}

impl LsmTree {
    /// `runs` must be ordered newest first.
    pub fn new(cmp: SharedComparator, runs: Vec<RunHandle>) -> Self {
        Self {
            layers: RwLock::new(Layers {
                active: Memtable::new(Arc::clone(&cmp)),
                frozen: Vec::new(),
                runs,
                pinned: BTreeMap::new(),
                next_snapshot_id: 1,
            }),
            cmp,
        }
    }

    pub fn comparator(&self) -> &SharedComparator {
        &self.cmp
    }

    pub fn insert(&self, key: Vec<u8>, value: Vec<u8>) {
        self.layers.write().active.put(key, value);
    }

    pub fn delete(&self, key: Vec<u8>) {
        self.layers.write().active.delete(key);
    }

    /// Applies `(key, value-or-tombstone)` pairs under one lock acquisition.
    pub fn apply<'a, I>(&self, records: I)
    where
        I: IntoIterator<Item = (&'a [u8], Option<&'a [u8]>)>,
    {
        let mut layers = self.layers.write();
        for (key, value) in records {
            match value {
                Some(v) => layers.active.put(key.to_vec(), v.to_vec()),
                None => layers.active.delete(key.to_vec()),
            }
        }
    }

    pub fn lookup(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let runs = {
            let layers = self.layers.read();
            if let Some(entry) = layers.active.get_entry(key) {
                return Ok(entry.map(<[u8]>::to_vec));
            }
            for (_, mem) in &layers.frozen {
                if let Some(entry) = mem.get_entry(key) {
                    return Ok(entry.map(<[u8]>::to_vec));
                }
            }
            layers.runs.clone()
        };
        search_runs(&runs, key)
    }

    /// Visible entries in `[start, end)`, ascending. The overlay part is
    /// copied under the lock; runs are read lazily.
    pub fn range(&self, start: Option<&[u8]>, end: Option<&[u8]>) -> RangeIter {
        let layers = self.layers.read();
        let mut sources: Vec<EntrySource> = Vec::with_capacity(1 + layers.frozen.len() + layers.runs.len());
        sources.push(Box::new(copy_overlay(&layers.active, start, end).into_iter()));
        for (_, mem) in &layers.frozen {
            sources.push(Box::new(copy_overlay(mem, start, end).into_iter()));
        }
        for run in &layers.runs {
            sources.push(Box::new(run.range(start, end)));
        }
        RangeIter::new(MergeIterator::new(Arc::clone(&self.cmp), sources))
    }

    pub fn prefix_lookup(&self, prefix: &[u8]) -> RangeIter {
        let (start, end) = self.cmp.prefix_range(prefix);
        self.range(Some(&start), end.as_deref())
    }

    /// Seals the active overlay and pins the resulting layer set. Mutates no
    /// data. Returns the id under which the view is pinned.
    pub fn create_snapshot(&self) -> u64 {
        let mut layers = self.layers.write();
        let id = layers.next_snapshot_id;
        layers.next_snapshot_id += 1;
        if !layers.active.is_empty() {
            let sealed = std::mem::replace(&mut layers.active, Memtable::new(Arc::clone(&self.cmp)));
            layers.frozen.insert(0, (id, Arc::new(sealed)));
        }
        let view = TreeView {
            cmp: Arc::clone(&self.cmp),
            overlays: layers.frozen.iter().map(|(_, m)| Arc::clone(m)).collect(),
            runs: layers.runs.clone(),
        };
        layers.pinned.insert(id, view);
        id
    }

    pub fn view(&self, id: u64) -> Option<TreeView> {
        self.layers.read().pinned.get(&id).cloned()
    }

    pub fn release_snapshot(&self, id: u64) {
        self.layers.write().pinned.remove(&id);
    }

    /// Installs the run flushed from snapshot `id`: drops the overlays it
    /// covers, adds the run as newest and unpins the view.
    pub fn cleanup_snapshot(&self, id: u64, flushed: Option<RunHandle>) {
        let mut layers = self.layers.write();
        layers.frozen.retain(|(sid, _)| *sid > id);
        if let Some(run) = flushed {
            layers.runs.insert(0, run);
        }
        layers.pinned.remove(&id);
    }

    pub fn runs(&self) -> Vec<RunHandle> {
        self.layers.read().runs.clone()
    }

    /// Replaces `old` with `merged` if the run list is still exactly `old`.
    /// Returns false when the runs changed in between.
    pub fn replace_runs(&self, old: &[RunHandle], merged: RunHandle) -> bool {
        let mut layers = self.layers.write();
        let unchanged = layers.runs.len() == old.len()
            && layers.runs.iter().zip(old).all(|(a, b)| Arc::ptr_eq(a, b));
        if unchanged {
            layers.runs = vec![merged];
        }
        unchanged
    }
}

impl std::fmt::Debug for LsmTree {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let layers = self.layers.read();
        f.debug_struct("LsmTree")
            .field("comparator", &self.cmp.id())
            .field("active", &layers.active.len())
            .field("frozen", &layers.frozen.len())
            .field("runs", &layers.runs.len())
            .field("pinned", &layers.pinned.len())
            .finish()
    }
}

impl TreeView {
    pub fn has_overlay_data(&self) -> bool {
        self.overlays.iter().any(|m| !m.is_empty())
    }

    pub fn runs(&self) -> &[RunHandle] {
        &self.runs
    }

    /// Merged overlay entries, tombstones kept. This is what a checkpoint
    /// writes as the new run.
    pub fn overlay_entries(&self) -> MergeIterator {
        let sources = self
            .overlays
            .iter()
            .map(|m| Box::new(copy_overlay(m, None, None).into_iter()) as EntrySource)
            .collect();
        MergeIterator::new(Arc::clone(&self.cmp), sources)
    }

    /// Every visible entry of the view, tombstones dropped.
    pub fn materialize(&self) -> MergeIterator {
        let mut sources: Vec<EntrySource> = self
            .overlays
            .iter()
            .map(|m| Box::new(copy_overlay(m, None, None).into_iter()) as EntrySource)
            .collect();
        for run in &self.runs {
            sources.push(Box::new(run.iter()));
        }
        MergeIterator::new(Arc::clone(&self.cmp), sources).drop_tombstones(true)
    }

    pub fn lookup(&self, key: &[u8]) -> Result<Option<Vec<u8>>> {
        for mem in &self.overlays {
            if let Some(entry) = mem.get_entry(key) {
                return Ok(entry.map(<[u8]>::to_vec));
            }
        }
        search_runs(&self.runs, key)
    }
}

/// Ascending `(key, value)` pairs of a range or prefix lookup.
///
/// Lazily reads runs, so it is not restartable: once the tree's run set
/// changes a new lookup sees the new state, this iterator keeps the old.
pub struct RangeIter {
    inner: Box<dyn Iterator<Item = sstable::Result<Entry>> + Send>,
}

impl RangeIter {
    pub(crate) fn new(merge: MergeIterator) -> Self {
        Self {
            inner: Box::new(merge.drop_tombstones(true)),
        }
    }

    /// Keeps only keys accepted by `keep`.
    pub(crate) fn filtered<F>(self, keep: F) -> Self
    where
        F: Fn(&[u8]) -> bool + Send + 'static,
    {
        Self {
            inner: Box::new(self.inner.filter(move |item| match item {
                Ok((k, _)) => keep(k),
                Err(_) => true,
            })),
        }
    }

    pub(crate) fn empty() -> Self {
        Self {
            inner: Box::new(std::iter::empty()),
        }
    }

    pub fn collect_pairs(self) -> Result<Vec<(Vec<u8>, Vec<u8>)>> {
        self.collect()
    }
}

impl Iterator for RangeIter {
    type Item = Result<(Vec<u8>, Vec<u8>)>;

    fn next(&mut self) -> Option<Self::Item> {
        loop {
            match self.inner.next()? {
                Ok((k, Some(v))) => return Some(Ok((k, v))),
                Ok((_, None)) => {}
                Err(e) => return Some(Err(Error::from(e))),
            }
        }
    }
}
