//! Persistent named snapshots.
//!
//! A snapshot captures selected indices of a database at one point of the
//! log. The overlay contents at that point are written into a run of their
//! own under `snapshots/<name>/`; the runs the index already had are shared
//! with the live tree and listed by filename in the database's `SNAPSHOTS`
//! file, which keeps them from being garbage collected.
//!
//! `SNAPSHOTS` layout (little endian):
//!
//! ```text
//! [magic "TSNP": u32][version: u32][count: u32]
//! per snapshot: [config][captured: u32]
//!     per index: [index: u32][overlay run: opt bytes][shared: u32][name: bytes]*
//! [crc32 of everything above: u32]
//! ```

use memtable::SharedComparator;
use sstable::{EntrySource, MergeIterator};
use std::collections::{BTreeMap, BTreeSet};
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::codec::{self, Decoder};
use crate::tree::{RangeIter, RunHandle};
use crate::{Error, Result};

pub const SNAPSHOTS_FILENAME: &str = "SNAPSHOTS";
pub const SNAPSHOT_DIR: &str = "snapshots";

const SNAPSHOTS_MAGIC: u32 = 0x504E_5354;
const SNAPSHOTS_VERSION: u32 = 1;

/// Per-index key predicate of a partial snapshot.
///
/// A key passes when it starts with one of the prefixes (or no prefix is
/// configured) and is not listed as excluded.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyFilter {
    prefixes: Vec<Vec<u8>>,
    excluded: Vec<Vec<u8>>,
}

impl KeyFilter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn prefix(mut self, prefix: impl Into<Vec<u8>>) -> Self {
        self.prefixes.push(prefix.into());
        self
    }

    pub fn exclude(mut self, key: impl Into<Vec<u8>>) -> Self {
        self.excluded.push(key.into());
        self
    }

    pub fn accepts(&self, key: &[u8]) -> bool {
        if self.excluded.iter().any(|k| k == key) {
            return false;
        }
        self.prefixes.is_empty() || self.prefixes.iter().any(|p| key.starts_with(p))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotConfig {
    name: String,
    indices: BTreeSet<usize>,
    filters: BTreeMap<usize, KeyFilter>,
}

impl SnapshotConfig {
    pub fn new(name: impl Into<String>, indices: impl IntoIterator<Item = usize>) -> Self {
        Self {
            name: name.into(),
            indices: indices.into_iter().collect(),
            filters: BTreeMap::new(),
        }
    }

    pub fn with_filter(mut self, index: usize, filter: KeyFilter) -> Self {
        self.filters.insert(index, filter);
        self
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn indices(&self) -> impl Iterator<Item = usize> + '_ {
        self.indices.iter().copied()
    }

    pub fn contains(&self, index: usize) -> bool {
        self.indices.contains(&index)
    }

    pub fn accepts(&self, index: usize, key: &[u8]) -> bool {
        self.contains(index) && self.filters.get(&index).map_or(true, |f| f.accepts(key))
    }

    pub(crate) fn validate(&self) -> Result<()> {
        let name = self.name.as_str();
        if name.is_empty()
            || name == "."
            || name == ".."
            || name.contains(|c| matches!(c, '/' | '\\' | '\0'))
        {
            return Err(Error::InvalidArgument(format!("invalid snapshot name '{}'", name)));
        }
        if self.indices.is_empty() {
            return Err(Error::InvalidArgument(format!(
                "snapshot '{}' captures no index",
                name
            )));
        }
        Ok(())
    }

    pub(crate) fn encode(&self, buf: &mut Vec<u8>) {
        codec::put_str(buf, &self.name);
        codec::put_u32(buf, self.indices.len() as u32);
        for index in &self.indices {
            codec::put_u32(buf, *index as u32);
        }
        codec::put_u32(buf, self.filters.len() as u32);
        for (index, filter) in &self.filters {
            codec::put_u32(buf, *index as u32);
            codec::put_u32(buf, filter.prefixes.len() as u32);
            for p in &filter.prefixes {
                codec::put_bytes(buf, p);
            }
            codec::put_u32(buf, filter.excluded.len() as u32);
            for k in &filter.excluded {
                codec::put_bytes(buf, k);
            }
        }
    }

    pub(crate) fn decode(dec: &mut Decoder<'_>) -> Result<Self> {
        let name = dec.string()?;
        let mut indices = BTreeSet::new();
        for _ in 0..dec.u32()? {
            indices.insert(dec.u32()? as usize);
        }
        let mut filters = BTreeMap::new();
        for _ in 0..dec.u32()? {
            let index = dec.u32()? as usize;
            let mut filter = KeyFilter::new();
            for _ in 0..dec.u32()? {
                filter.prefixes.push(dec.bytes()?);
            }
            for _ in 0..dec.u32()? {
                filter.excluded.push(dec.bytes()?);
            }
            filters.insert(index, filter);
        }
        Ok(Self {
            name,
            indices,
            filters,
        })
    }
}

pub(crate) struct SnapshotIndex {
    pub cmp: SharedComparator,
    /// Overlay contents at creation, filtered; tombstones kept.
    pub overlay: Option<RunHandle>,
    /// Shared runs of the live tree, newest first.
    pub runs: Vec<RunHandle>,
}

/// Read-only handle to a persistent snapshot.
pub struct Snapshot {
    db: String,
    config: SnapshotConfig,
    indices: BTreeMap<usize, SnapshotIndex>,
}

impl Snapshot {
    pub(crate) fn new(
        db: String,
        config: SnapshotConfig,
        indices: BTreeMap<usize, SnapshotIndex>,
    ) -> Self {
        Self {
            db,
            config,
            indices,
        }
    }

    pub fn name(&self) -> &str {
        self.config.name()
    }

    pub fn database(&self) -> &str {
        &self.db
    }

    pub fn config(&self) -> &SnapshotConfig {
        &self.config
    }

    fn index(&self, index: usize) -> Result<&SnapshotIndex> {
        self.indices.get(&index).ok_or_else(|| Error::NoSuchIndex {
            db: self.db.clone(),
            index,
        })
    }

    pub fn lookup(&self, index: usize, key: &[u8]) -> Result<Option<Vec<u8>>> {
        let idx = self.index(index)?;
        if !self.config.accepts(index, key) {
            return Ok(None);
        }
        if let Some(overlay) = &idx.overlay {
            if let Some(entry) = overlay.get(key)? {
                return Ok(entry);
            }
        }
        for run in &idx.runs {
            if let Some(entry) = run.get(key)? {
                return Ok(entry);
            }
        }
        Ok(None)
    }

    pub fn prefix_lookup(&self, index: usize, prefix: &[u8]) -> Result<RangeIter> {
        let idx = self.index(index)?;
        let (start, end) = idx.cmp.prefix_range(prefix);
        let end = end.as_deref();
        let mut sources: Vec<EntrySource> = Vec::new();
        if let Some(overlay) = &idx.overlay {
            sources.push(Box::new(overlay.range(Some(&start), end)));
        }
        for run in &idx.runs {
            sources.push(Box::new(run.range(Some(&start), end)));
        }
        let config = self.config.clone();
        Ok(RangeIter::new(MergeIterator::new(Arc::clone(&idx.cmp), sources))
            .filtered(move |key| config.accepts(index, key)))
    }

    /// Filenames of live-tree runs this snapshot keeps alive.
    pub(crate) fn shared_runs(&self) -> impl Iterator<Item = String> + '_ {
        self.indices
            .values()
            .flat_map(|idx| idx.runs.iter())
            .filter_map(|run| run_file_name(run))
    }
}

impl std::fmt::Debug for Snapshot {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Snapshot")
            .field("db", &self.db)
            .field("name", &self.config.name)
            .field("indices", &self.indices.keys().collect::<Vec<_>>())
            .finish()
    }
}

pub(crate) fn run_file_name(run: &RunHandle) -> Option<String> {
    run.path()
        .file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
}

pub(crate) fn snapshot_dir(db_dir: &Path, name: &str) -> PathBuf {
    db_dir.join(SNAPSHOT_DIR).join(name)
}

pub(crate) fn overlay_run_name(index: usize) -> String {
    format!("idx{}.run", index)
}

/// Rewrites `db_dir/SNAPSHOTS` atomically.
pub(crate) fn save_all<'a, I>(db_dir: &Path, snapshots: I) -> Result<()>
where
    I: ExactSizeIterator<Item = &'a Snapshot>,
{
    let mut buf = Vec::new();
    codec::put_u32(&mut buf, SNAPSHOTS_MAGIC);
    codec::put_u32(&mut buf, SNAPSHOTS_VERSION);
    codec::put_u32(&mut buf, snapshots.len() as u32);
    for snapshot in snapshots {
        snapshot.config.encode(&mut buf);
        codec::put_u32(&mut buf, snapshot.indices.len() as u32);
        for (index, idx) in &snapshot.indices {
            codec::put_u32(&mut buf, *index as u32);
            let overlay = idx.overlay.as_ref().map(|_| overlay_run_name(*index));
            codec::put_opt_bytes(&mut buf, overlay.as_deref().map(str::as_bytes));
            let shared: Vec<String> = idx.runs.iter().filter_map(run_file_name).collect();
            codec::put_u32(&mut buf, shared.len() as u32);
            for name in &shared {
                codec::put_str(&mut buf, name);
            }
        }
    }
    let crc = crc32fast::hash(&buf);
    codec::put_u32(&mut buf, crc);

    let path = db_dir.join(SNAPSHOTS_FILENAME);
    let tmp = db_dir.join(format!("{}.tmp", SNAPSHOTS_FILENAME));
    {
        let mut f = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(&tmp)?;
        f.write_all(&buf)?;
        f.sync_all()?;
    }
    fs::rename(&tmp, &path)?;
    Ok(())
}

/// Reopens every snapshot listed in `db_dir/SNAPSHOTS`.
///
/// `open_run` resolves a path and a comparator to a run handle; missing or
/// malformed files fail the load.
pub(crate) fn load_all<F>(
    db_name: &str,
    db_dir: &Path,
    comparators: &[SharedComparator],
    mut open_run: F,
) -> Result<BTreeMap<String, Arc<Snapshot>>>
where
    F: FnMut(&Path, &SharedComparator) -> Result<RunHandle>,
{
    let path = db_dir.join(SNAPSHOTS_FILENAME);
    let mut out = BTreeMap::new();
    let raw = match fs::read(&path) {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(out),
        Err(e) => return Err(e.into()),
    };
    if raw.len() < 4 {
        return Err(Error::Corruption(format!("{} is truncated", path.display())));
    }
    let (body, tail) = raw.split_at(raw.len() - 4);
    let stored = u32::from_le_bytes([tail[0], tail[1], tail[2], tail[3]]);
    if crc32fast::hash(body) != stored {
        return Err(Error::Corruption(format!("{} checksum mismatch", path.display())));
    }

    let mut dec = Decoder::new(body, "snapshot metadata");
    if dec.u32()? != SNAPSHOTS_MAGIC {
        return Err(Error::Corruption(format!("{} has a bad magic", path.display())));
    }
    let version = dec.u32()?;
    if version != SNAPSHOTS_VERSION {
        return Err(Error::Corruption(format!(
            "{} has unsupported version {}",
            path.display(),
            version
        )));
    }
    for _ in 0..dec.u32()? {
        let config = SnapshotConfig::decode(&mut dec)?;
        let dir = snapshot_dir(db_dir, config.name());
        let mut indices = BTreeMap::new();
        for _ in 0..dec.u32()? {
            let index = dec.u32()? as usize;
            let cmp = comparators.get(index).ok_or_else(|| {
                Error::Corruption(format!(
                    "snapshot '{}' references index {} beyond the database",
                    config.name(),
                    index
                ))
            })?;
            let overlay = match dec.opt_bytes()? {
                Some(name) => {
                    let name = String::from_utf8(name).map_err(|_| {
                        Error::Corruption("invalid run name in snapshot metadata".into())
                    })?;
                    Some(open_run(&dir.join(name), cmp)?)
                }
                None => None,
            };
            let mut runs = Vec::new();
            for _ in 0..dec.u32()? {
                let name = dec.string()?;
                runs.push(open_run(&db_dir.join(name), cmp)?);
            }
            indices.insert(
                index,
                SnapshotIndex {
                    cmp: Arc::clone(cmp),
                    overlay,
                    runs,
                },
            );
        }
        let name = config.name().to_string();
        out.insert(
            name,
            Arc::new(Snapshot::new(db_name.to_string(), config, indices)),
        );
    }
    dec.finish()?;
    Ok(out)
}
