mod merge_tests;
mod reader_tests;
mod writer_tests;

use crate::{Entry, SSTableReader, SSTableWriter};
use anyhow::Result;
use memtable::{default_comparator, Memtable};
use std::path::Path;
use std::sync::Arc;

/// Writes the given entries through a memtable and opens the resulting run.
pub(crate) fn write_and_open(
    dir: &Path,
    name: &str,
    entries: &[(&[u8], Option<&[u8]>)],
) -> Result<Arc<SSTableReader>> {
    let path = dir.join(name);
    let mut mem = Memtable::default();
    for &(key, val) in entries {
        match val {
            Some(v) => mem.put(key.to_vec(), v.to_vec()),
            None => mem.delete(key.to_vec()),
        }
    }
    SSTableWriter::write_from_memtable(&path, &mem)?;
    Ok(Arc::new(SSTableReader::open(&path, default_comparator())?))
}

pub(crate) fn entry(key: &str, value: Option<&str>) -> Entry {
    (
        key.as_bytes().to_vec(),
        value.map(|v| v.as_bytes().to_vec()),
    )
}
