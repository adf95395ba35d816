//! # SSTable - immutable on-disk runs
//!
//! Every checkpoint turns the frozen overlay of an index into one run file.
//! Runs are *write-once, read-many*: they are replaced as a whole by
//! compaction, never modified in place.
//!
//! ## File layout
//!
//! ```text
//! ┌───────────────────────────────────────────────────────────────┐
//! │ DATA SECTION (records in comparator order)                    │
//! │                                                               │
//! │ crc32 (u32) | key_len (u32) | key                             │
//! │ present (u8) | [val_len (u32) | val]                          │
//! │                                                               │
//! │ The CRC32 covers everything after itself in the record.       │
//! ├───────────────────────────────────────────────────────────────┤
//! │ INDEX SECTION                                                 │
//! │                                                               │
//! │ key_len (u32) | key | data_offset (u64)                       │
//! ├───────────────────────────────────────────────────────────────┤
//! │ FOOTER (always last 20 bytes)                                 │
//! │                                                               │
//! │ entry_count (u64) | index_offset (u64) | magic (u32) "TRUN"   │
//! └───────────────────────────────────────────────────────────────┘
//! ```
//!
//! All integers are little-endian. `present == 0` marks a tombstone, which
//! is kept so that it keeps shadowing older runs of the same index.
//!
//! Keys are ordered by the index's [`memtable::ByteRangeComparator`]; the
//! reader must be opened with the same comparator the writer was fed with.
//! Open verifies that the index is strictly ascending under it and reports
//! [`RunError::Corrupt`] otherwise.

mod error;
mod format;
mod merge;
mod reader;
mod writer;

pub use error::{Result, RunError};
pub use format::{Footer, FOOTER_BYTES, RUN_MAGIC};
pub use merge::{EntrySource, MergeIterator};
pub use reader::{RunIter, SSTableReader};
pub use writer::SSTableWriter;

/// One key with its value, or `None` for a tombstone.
pub type Entry = (Vec<u8>, Option<Vec<u8>>);

#[cfg(test)]
mod tests;
