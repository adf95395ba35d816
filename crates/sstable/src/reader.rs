use byteorder::{LittleEndian, ReadBytesExt};
use crc32fast::Hasher as Crc32;
use memtable::SharedComparator;
use parking_lot::Mutex;
use std::cmp::Ordering;
use std::fs::File;
use std::io::{BufReader, Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::Arc;

use crate::format::{read_footer, FOOTER_BYTES};
use crate::{Entry, Result, RunError};

/// Maximum key size we'll allocate during reads (64 KiB). Prevents OOM on corrupt files.
const MAX_KEY_BYTES: usize = 64 * 1024;
/// Maximum value size we'll allocate during reads (64 MiB). Prevents OOM on corrupt files.
const MAX_VALUE_BYTES: usize = 64 * 1024 * 1024;

/// Reads a run file.
///
/// On [`open`](SSTableReader::open) the whole index is loaded into memory as
/// a vector sorted by the run's comparator; lookups binary-search it and then
/// read a single record through a persistent file handle.
pub struct SSTableReader {
    path: PathBuf,
    index: Vec<(Vec<u8>, u64)>,
    cmp: SharedComparator,
    file: Mutex<BufReader<File>>,
    file_size: u64,
}

impl SSTableReader {
    /// Opens a run and validates its footer and index.
    ///
    /// # Errors
    ///
    /// [`RunError::Corrupt`] if the file is too small, the magic is wrong,
    /// offsets point outside the file, the entry count disagrees with the
    /// footer, or the keys are not strictly ascending under `cmp`.
    pub fn open<P: AsRef<Path>>(path: P, cmp: SharedComparator) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let mut f = File::open(&path)?;
        let file_size = f.metadata()?.len();

        if file_size < FOOTER_BYTES {
            return Err(RunError::corrupt(&path, "file too small"));
        }
        let footer = read_footer(&mut f)?.ok_or_else(|| RunError::corrupt(&path, "bad magic"))?;
        let index_end = file_size - FOOTER_BYTES;
        if footer.index_offset > index_end {
            return Err(RunError::corrupt(&path, "index offset beyond end of file"));
        }

        f.seek(SeekFrom::Start(footer.index_offset))?;
        let mut raw = vec![0u8; (index_end - footer.index_offset) as usize];
        f.read_exact(&mut raw)?;
        let index = parse_index(&path, &raw, footer.index_offset)?;

        if index.len() as u64 != footer.entry_count {
            return Err(RunError::corrupt(
                &path,
                format!(
                    "footer announces {} entries, index holds {}",
                    footer.entry_count,
                    index.len()
                ),
            ));
        }
        for pair in index.windows(2) {
            if cmp.compare(&pair[0].0, &pair[1].0) != Ordering::Less {
                return Err(RunError::corrupt(&path, "index keys out of order"));
            }
        }

        f.seek(SeekFrom::Start(0))?;
        Ok(Self {
            path,
            index,
            cmp,
            file: Mutex::new(BufReader::new(f)),
            file_size,
        })
    }

    /// Point lookup.
    ///
    /// `Ok(Some(None))` is a tombstone, `Ok(None)` means the run does not
    /// contain the key.
    pub fn get(&self, key: &[u8]) -> Result<Option<Option<Vec<u8>>>> {
        let pos = match self
            .index
            .binary_search_by(|(k, _)| self.cmp.compare(k, key))
        {
            Ok(pos) => pos,
            Err(_) => return Ok(None),
        };
        let (_, value) = self.read_at(pos)?;
        Ok(Some(value))
    }

    /// Reads the record at index position `pos`, verifying its checksum.
    pub fn read_at(&self, pos: usize) -> Result<Entry> {
        let (expected_key, offset) = self
            .index
            .get(pos)
            .ok_or_else(|| RunError::corrupt(&self.path, format!("no entry {}", pos)))?;

        let mut f = self.file.lock();
        f.seek(SeekFrom::Start(*offset))?;

        let stored_crc = f.read_u32::<LittleEndian>()?;
        let key_len = f.read_u32::<LittleEndian>()? as usize;
        if key_len > MAX_KEY_BYTES {
            return Err(RunError::corrupt(
                &self.path,
                format!("key_len {} exceeds maximum", key_len),
            ));
        }
        let mut key = vec![0u8; key_len];
        f.read_exact(&mut key)?;
        if &key != expected_key {
            return Err(RunError::corrupt(
                &self.path,
                format!("index points to a different key at offset {}", offset),
            ));
        }

        let present = f.read_u8()?;
        let value = match present {
            0 => None,
            1 => {
                let val_len = f.read_u32::<LittleEndian>()? as usize;
                if val_len > MAX_VALUE_BYTES {
                    return Err(RunError::corrupt(
                        &self.path,
                        format!("val_len {} exceeds maximum", val_len),
                    ));
                }
                let mut val = vec![0u8; val_len];
                f.read_exact(&mut val)?;
                Some(val)
            }
            other => {
                return Err(RunError::corrupt(
                    &self.path,
                    format!("unknown presence flag {}", other),
                ))
            }
        };

        let mut hasher = Crc32::new();
        hasher.update(&(key_len as u32).to_le_bytes());
        hasher.update(&key);
        hasher.update(&[present]);
        if let Some(v) = &value {
            hasher.update(&(v.len() as u32).to_le_bytes());
            hasher.update(v);
        }
        let actual_crc = hasher.finalize();
        if actual_crc != stored_crc {
            return Err(RunError::corrupt(
                &self.path,
                format!(
                    "CRC32 mismatch at offset {}: expected {:#010x}, got {:#010x}",
                    offset, stored_crc, actual_crc
                ),
            ));
        }

        Ok((key, value))
    }

    /// Index position of the first key `>= key`.
    fn lower_bound(&self, key: &[u8]) -> usize {
        self.index
            .partition_point(|(k, _)| self.cmp.compare(k, key) == Ordering::Less)
    }

    /// Lazy iterator over `[start, end)` in comparator order. `None` leaves a
    /// side open. The iterator keeps the reader alive.
    pub fn range(self: &Arc<Self>, start: Option<&[u8]>, end: Option<&[u8]>) -> RunIter {
        let pos = start.map_or(0, |s| self.lower_bound(s));
        let end_pos = end.map_or(self.index.len(), |e| self.lower_bound(e));
        RunIter {
            reader: Arc::clone(self),
            pos,
            end_pos: end_pos.max(pos),
        }
    }

    /// Lazy iterator over every entry.
    pub fn iter(self: &Arc<Self>) -> RunIter {
        self.range(None, None)
    }

    pub fn keys(&self) -> impl Iterator<Item = &[u8]> {
        self.index.iter().map(|(k, _)| k.as_slice())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn comparator(&self) -> &SharedComparator {
        &self.cmp
    }

    #[must_use]
    pub fn file_size(&self) -> u64 {
        self.file_size
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.index.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.index.is_empty()
    }
}

impl std::fmt::Debug for SSTableReader {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SSTableReader")
            .field("path", &self.path)
            .field("entries", &self.index.len())
            .finish()
    }
}

fn parse_index(path: &Path, mut raw: &[u8], index_offset: u64) -> Result<Vec<(Vec<u8>, u64)>> {
    let mut index = Vec::new();
    while !raw.is_empty() {
        let key_len = raw
            .read_u32::<LittleEndian>()
            .map_err(|_| RunError::corrupt(path, "truncated index"))? as usize;
        if key_len > MAX_KEY_BYTES || key_len > raw.len() {
            return Err(RunError::corrupt(path, "corrupt index key length"));
        }
        let (key, rest) = raw.split_at(key_len);
        raw = rest;
        let data_offset = raw
            .read_u64::<LittleEndian>()
            .map_err(|_| RunError::corrupt(path, "truncated index"))?;
        if data_offset >= index_offset {
            return Err(RunError::corrupt(path, "data offset inside index section"));
        }
        index.push((key.to_vec(), data_offset));
    }
    Ok(index)
}

/// Iterator returned by [`SSTableReader::range`].
pub struct RunIter {
    reader: Arc<SSTableReader>,
    pos: usize,
    end_pos: usize,
}

impl Iterator for RunIter {
    type Item = Result<Entry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.pos >= self.end_pos {
            return None;
        }
        let item = self.reader.read_at(self.pos);
        // stop after the first error
        self.pos = if item.is_ok() { self.pos + 1 } else { self.end_pos };
        Some(item)
    }
}
