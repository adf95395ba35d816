use byteorder::{LittleEndian, WriteBytesExt};
use crc32fast::Hasher as Crc32;
use memtable::Memtable;
use std::fs::{rename, File, OpenOptions};
use std::io::{BufWriter, Seek, Write};
use std::path::Path;

use crate::format::{write_footer, Footer};
use crate::{Entry, Result};

/// Writes sorted entries to disk as an immutable run file.
///
/// The write is crash-safe: data goes to `<path>.tmp`, is fsynced, and is
/// then renamed over `path`; the parent directory is fsynced afterwards.
/// A crash mid-write leaves only the temp file, which recovery removes.
pub struct SSTableWriter {}

impl SSTableWriter {
    /// Flushes every entry of `mem` (tombstones included) to `path`.
    /// Returns the number of entries written.
    pub fn write_from_memtable(path: &Path, mem: &Memtable) -> Result<u64> {
        let iter = mem
            .iter()
            .map(|(k, v)| Ok((k.to_vec(), v.map(<[u8]>::to_vec))));
        Self::write_from_iterator(path, iter)
    }

    /// Streams entries into a new run. The iterator must yield keys in
    /// strictly ascending comparator order; the first error it yields aborts
    /// the write and removes the temp file.
    ///
    /// An empty iterator produces a valid run with zero entries.
    pub fn write_from_iterator<I>(path: &Path, iter: I) -> Result<u64>
    where
        I: Iterator<Item = Result<Entry>>,
    {
        let tmp_path = path.with_extension("run.tmp");
        match Self::write_internal(&tmp_path, iter) {
            Ok(count) => {
                rename(&tmp_path, path)?;
                if let Some(parent) = path.parent() {
                    if let Ok(dir) = File::open(parent) {
                        let _ = dir.sync_all();
                    }
                }
                log::debug!("wrote run {} ({} entries)", path.display(), count);
                Ok(count)
            }
            Err(e) => {
                let _ = std::fs::remove_file(&tmp_path);
                Err(e)
            }
        }
    }

    fn write_internal<I>(tmp_path: &Path, iter: I) -> Result<u64>
    where
        I: Iterator<Item = Result<Entry>>,
    {
        let raw_file = OpenOptions::new()
            .create(true)
            .write(true)
            .truncate(true)
            .open(tmp_path)?;
        let mut file = BufWriter::new(raw_file);

        let mut index: Vec<(Vec<u8>, u64)> = Vec::new();
        let mut record_buf: Vec<u8> = Vec::with_capacity(256);

        for item in iter {
            let (key, value) = item?;

            record_buf.clear();
            record_buf.write_u32::<LittleEndian>(key.len() as u32)?;
            record_buf.extend_from_slice(&key);
            match &value {
                Some(v) => {
                    record_buf.write_u8(1)?;
                    record_buf.write_u32::<LittleEndian>(v.len() as u32)?;
                    record_buf.extend_from_slice(v);
                }
                None => record_buf.write_u8(0)?,
            }

            let mut hasher = Crc32::new();
            hasher.update(&record_buf);

            let offset = file.stream_position()?;
            file.write_u32::<LittleEndian>(hasher.finalize())?;
            file.write_all(&record_buf)?;
            index.push((key, offset));
        }

        let index_offset = file.stream_position()?;
        for (key, data_offset) in &index {
            file.write_u32::<LittleEndian>(key.len() as u32)?;
            file.write_all(key)?;
            file.write_u64::<LittleEndian>(*data_offset)?;
        }

        let footer = Footer {
            entry_count: index.len() as u64,
            index_offset,
        };
        write_footer(&mut file, &footer)?;

        file.flush()?;
        file.into_inner().map_err(|e| e.into_error())?.sync_all()?;
        Ok(footer.entry_count)
    }
}
