//! # Memtable - the in-memory overlay of an LSM index
//!
//! A sorted map from key to `Option<value>`; `None` is a tombstone that
//! shadows older values in on-disk runs. Keys are ordered by the index's
//! [`ByteRangeComparator`] rather than by raw byte order.
//!
//! The overlay is mutated in log order only, so the latest write to a key
//! always wins and no per-entry sequence number is needed.

pub mod comparator;

pub use comparator::{
    default_comparator, successor_prefix, ByteRangeComparator, DefaultByteRangeComparator,
    SharedComparator, DEFAULT_COMPARATOR_ID,
};

use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::fmt;
use std::ops::Bound;

/// A key paired with the comparator that orders it.
#[derive(Clone)]
struct OrderedKey {
    bytes: Vec<u8>,
    cmp: SharedComparator,
}

impl PartialEq for OrderedKey {
    fn eq(&self, other: &Self) -> bool {
        self.cmp(other) == Ordering::Equal
    }
}

impl Eq for OrderedKey {}

impl PartialOrd for OrderedKey {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for OrderedKey {
    fn cmp(&self, other: &Self) -> Ordering {
        self.cmp.compare(&self.bytes, &other.bytes)
    }
}

pub struct Memtable {
    map: BTreeMap<OrderedKey, Option<Vec<u8>>>,
    cmp: SharedComparator,
    approx_size: usize,
}

impl Memtable {
    pub fn new(cmp: SharedComparator) -> Self {
        Self {
            map: BTreeMap::new(),
            cmp,
            approx_size: 0,
        }
    }

    fn ordered(&self, key: &[u8]) -> OrderedKey {
        OrderedKey {
            bytes: key.to_vec(),
            cmp: self.cmp.clone(),
        }
    }

    /// Insert or overwrite a key.
    pub fn put(&mut self, key: Vec<u8>, value: Vec<u8>) {
        self.upsert(key, Some(value));
    }

    /// Record a tombstone for `key`.
    pub fn delete(&mut self, key: Vec<u8>) {
        self.upsert(key, None);
    }

    fn upsert(&mut self, key: Vec<u8>, value: Option<Vec<u8>>) {
        let added = key.len() + value.as_ref().map_or(0, Vec::len);
        let key = OrderedKey {
            bytes: key,
            cmp: self.cmp.clone(),
        };
        if let Some((old_key, old_val)) = self.map.get_key_value(&key) {
            let removed = old_key.bytes.len() + old_val.as_ref().map_or(0, Vec::len);
            self.approx_size = self.approx_size.saturating_sub(removed);
        }
        self.approx_size += added;
        self.map.insert(key, value);
    }

    /// Latest value for `key`, or `None` if absent or deleted.
    pub fn get(&self, key: &[u8]) -> Option<Vec<u8>> {
        self.get_entry(key).and_then(|v| v.map(<[u8]>::to_vec))
    }

    /// Raw entry lookup: `Some(None)` is a tombstone, `None` means the overlay
    /// knows nothing about the key.
    pub fn get_entry(&self, key: &[u8]) -> Option<Option<&[u8]>> {
        self.map.get(&self.ordered(key)).map(|v| v.as_deref())
    }

    /// Ordered iterator over all entries, tombstones included.
    pub fn iter(&self) -> impl Iterator<Item = (&[u8], Option<&[u8]>)> {
        self.map
            .iter()
            .map(|(k, v)| (k.bytes.as_slice(), v.as_deref()))
    }

    /// Ordered iterator over `[start, end)`; `None` leaves a side open.
    pub fn range<'a>(
        &'a self,
        start: Option<&[u8]>,
        end: Option<&[u8]>,
    ) -> impl Iterator<Item = (&'a [u8], Option<&'a [u8]>)> + 'a {
        let lower = match start {
            Some(s) => Bound::Included(self.ordered(s)),
            None => Bound::Unbounded,
        };
        let upper = match end {
            Some(e) => Bound::Excluded(self.ordered(e)),
            None => Bound::Unbounded,
        };
        let empty = matches!((&lower, &upper), (Bound::Included(l), Bound::Excluded(u)) if l >= u);
        let range = if empty {
            None
        } else {
            Some(self.map.range((lower, upper)))
        };
        range
            .into_iter()
            .flatten()
            .map(|(k, v)| (k.bytes.as_slice(), v.as_deref()))
    }

    /// All entries whose key starts with `prefix`, in comparator order.
    pub fn prefix<'a>(
        &'a self,
        prefix: &[u8],
    ) -> impl Iterator<Item = (&'a [u8], Option<&'a [u8]>)> + 'a {
        let (start, end) = self.cmp.prefix_range(prefix);
        self.range(Some(&start), end.as_deref())
    }

    pub fn comparator(&self) -> &SharedComparator {
        &self.cmp
    }

    pub fn len(&self) -> usize {
        self.map.len()
    }

    pub fn approx_size(&self) -> usize {
        self.approx_size
    }

    pub fn is_empty(&self) -> bool {
        self.map.is_empty()
    }

    pub fn clear(&mut self) {
        self.map.clear();
        self.approx_size = 0;
    }
}

impl Default for Memtable {
    fn default() -> Self {
        Self::new(default_comparator())
    }
}

impl fmt::Debug for Memtable {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Memtable")
            .field("comparator", &self.cmp.id())
            .field("entries", &self.map.len())
            .field("approx_size", &self.approx_size)
            .finish()
    }
}

#[cfg(test)]
mod tests;
