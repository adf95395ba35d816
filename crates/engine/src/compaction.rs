//! Compaction: merges every run of one index into a single run.
//!
//! Streams all runs through a [`MergeIterator`] (newest wins) straight into
//! the [`SSTableWriter`]. Since the merge covers every run of the index no
//! older version can remain below it, so tombstones are dropped. Overlays
//! are not part of the merge and keep shadowing the result.
//!
//! The replaced runs are retired rather than deleted: their files go in the
//! next garbage collection once no view, iterator or persistent snapshot
//! references them.

use log::debug;
use sstable::{EntrySource, MergeIterator, SSTableWriter};
use std::sync::Arc;

use crate::database::LsmDatabase;
use crate::snapshot::run_file_name;
use crate::{Error, Result};

impl LsmDatabase {
    /// Compacts index `index`. Returns false when there was nothing to do or
    /// the run set changed while merging.
    pub(crate) fn compact_index(&self, index: usize) -> Result<bool> {
        let tree = self.tree(index)?;
        let runs = tree.runs();
        if runs.len() <= 1 {
            return Ok(false);
        }

        let cmp = Arc::clone(tree.comparator());
        let sources: Vec<EntrySource> = runs
            .iter()
            .map(|run| Box::new(run.iter()) as EntrySource)
            .collect();
        let merge = MergeIterator::new(Arc::clone(&cmp), sources).drop_tombstones(true);

        let name = self.run_file_name(index, self.ondisk_lsn());
        let path = self.dir().join(&name);
        let bytes = SSTableWriter::write_from_iterator(&path, merge)?;
        let merged = Arc::new(sstable::SSTableReader::open(&path, cmp)?);

        let mut manifest = self.manifest();
        let listed: Vec<String> = runs.iter().filter_map(run_file_name).collect();
        if manifest.runs(index) != listed.as_slice() {
            drop(manifest);
            std::fs::remove_file(&path)?;
            return Ok(false);
        }
        let mut next = manifest.clone();
        next.replace_index(index, name.clone());
        next.save()?;
        *manifest = next;
        if !tree.replace_runs(&runs, merged) {
            return Err(Error::Internal(format!(
                "runs of index {} changed during compaction",
                index
            )));
        }
        drop(manifest);

        debug!(
            "db '{}' index {}: compacted {} runs into {} ({} bytes)",
            self.name(),
            index,
            runs.len(),
            name,
            bytes
        );
        self.retire(runs);
        Ok(true)
    }
}
