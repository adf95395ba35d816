//! Newest-wins merge of several sorted entry streams.
//!
//! Sources are passed newest first. When a key appears in several sources
//! only the entry of the lowest-numbered source is emitted; this is how an
//! overlay shadows runs and a newer run shadows an older one.

use memtable::SharedComparator;
use std::cmp::Ordering;

use crate::{Entry, Result};

/// A sorted stream of entries, typically a [`crate::RunIter`] or an overlay
/// range copied into a vector.
pub type EntrySource = Box<dyn Iterator<Item = Result<Entry>> + Send>;

pub struct MergeIterator {
    sources: Vec<EntrySource>,
    heads: Vec<Option<Entry>>,
    cmp: SharedComparator,
    drop_tombstones: bool,
    primed: bool,
    done: bool,
}

impl MergeIterator {
    /// `sources` must be ordered newest first.
    pub fn new(cmp: SharedComparator, sources: Vec<EntrySource>) -> Self {
        let heads = sources.iter().map(|_| None).collect();
        Self {
            sources,
            heads,
            cmp,
            drop_tombstones: false,
            primed: false,
            done: false,
        }
    }

    /// Skip tombstones in the output. Only valid when the merged sources
    /// contain every older version of the index, e.g. a full compaction.
    pub fn drop_tombstones(mut self, drop: bool) -> Self {
        self.drop_tombstones = drop;
        self
    }

    fn advance(&mut self, source: usize) -> Result<()> {
        self.heads[source] = match self.sources[source].next() {
            Some(item) => Some(item?),
            None => None,
        };
        Ok(())
    }

    fn next_entry(&mut self) -> Result<Option<Entry>> {
        if !self.primed {
            for i in 0..self.sources.len() {
                self.advance(i)?;
            }
            self.primed = true;
        }

        loop {
            let mut winner: Option<usize> = None;
            for (i, head) in self.heads.iter().enumerate() {
                let Some((key, _)) = head else { continue };
                winner = match winner {
                    None => Some(i),
                    Some(w) => match &self.heads[w] {
                        Some((wk, _)) if self.cmp.compare(key, wk) == Ordering::Less => Some(i),
                        _ => Some(w),
                    },
                };
            }

            let Some(w) = winner else { return Ok(None) };
            let entry = self.heads[w].take();
            let Some(entry) = entry else { return Ok(None) };

            // drop shadowed versions of the same key in older sources
            for i in (w + 1)..self.heads.len() {
                let same = matches!(&self.heads[i], Some((k, _)) if self.cmp.compare(k, &entry.0) == Ordering::Equal);
                if same {
                    self.advance(i)?;
                }
            }
            self.advance(w)?;

            if self.drop_tombstones && entry.1.is_none() {
                continue;
            }
            return Ok(Some(entry));
        }
    }

    /// Drains the iterator into a vector, stopping at the first error.
    pub fn collect_all(self) -> Result<Vec<Entry>> {
        self.collect()
    }
}

impl Iterator for MergeIterator {
    type Item = Result<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.done {
            return None;
        }
        match self.next_entry() {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => {
                self.done = true;
                None
            }
            Err(e) => {
                self.done = true;
                Some(Err(e))
            }
        }
    }
}
