use std::cmp::Ordering;
use std::fmt;
use std::sync::Arc;

/// Identifier of the built-in unsigned lexicographic comparator.
pub const DEFAULT_COMPARATOR_ID: &str = "default";

/// Total order over byte-string keys of one index.
///
/// The `id` is persisted in the database configuration file and must stay
/// stable across releases: it is how the engine finds the comparator again
/// when the database is reopened.
pub trait ByteRangeComparator: Send + Sync + fmt::Debug {
    fn id(&self) -> &str;

    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering;

    /// Returns `[start, end)` bounds covering every key that starts with
    /// `prefix`. `None` as the end bound means "up to the last key".
    ///
    /// The default works for any order in which all keys sharing a prefix
    /// are contiguous and sort after the prefix itself, which holds for
    /// lexicographic orders.
    fn prefix_range(&self, prefix: &[u8]) -> (Vec<u8>, Option<Vec<u8>>) {
        (prefix.to_vec(), successor_prefix(prefix))
    }
}

pub type SharedComparator = Arc<dyn ByteRangeComparator>;

/// Unsigned byte-wise lexicographic order.
#[derive(Debug, Default, Clone, Copy)]
pub struct DefaultByteRangeComparator;

impl ByteRangeComparator for DefaultByteRangeComparator {
    fn id(&self) -> &str {
        DEFAULT_COMPARATOR_ID
    }

    fn compare(&self, a: &[u8], b: &[u8]) -> Ordering {
        a.cmp(b)
    }
}

pub fn default_comparator() -> SharedComparator {
    Arc::new(DefaultByteRangeComparator)
}

/// Smallest key greater than every key starting with `prefix`, or `None`
/// when no such key exists (empty prefix or all `0xff`).
pub fn successor_prefix(prefix: &[u8]) -> Option<Vec<u8>> {
    let mut end = prefix.to_vec();
    while let Some(last) = end.pop() {
        if last < u8::MAX {
            end.push(last + 1);
            return Some(end);
        }
    }
    None
}
