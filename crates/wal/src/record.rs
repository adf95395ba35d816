use byteorder::{LittleEndian, ReadBytesExt, WriteBytesExt};
use crc32fast::Hasher as Crc32;
use std::fs::{File, OpenOptions};
use std::io::{self, BufReader, Read, Write};
use std::path::{Path, PathBuf};

use crate::{LogError, Lsn, Result};

/// Upper bound for one framed record; anything larger is corruption.
pub const MAX_RECORD_SIZE: u32 = 64 * 1024 * 1024;

/// Bytes of the frame before the payload: len + crc + view + seq.
const HEADER_BYTES: usize = 4 + 4 + 8 + 8;

/// One committed mutation as it appears in the log.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogEntry {
    pub lsn: Lsn,
    pub payload: Vec<u8>,
}

impl LogEntry {
    pub fn new(lsn: Lsn, payload: Vec<u8>) -> Self {
        Self { lsn, payload }
    }
}

/// Append-only writer for one segment file.
///
/// Each entry is framed into a reusable buffer and written with a single
/// `write_all`. Durability is the caller's decision: see
/// [`sync_all`](SegmentWriter::sync_all) and [`sync_data`](SegmentWriter::sync_data).
pub struct SegmentWriter {
    file: File,
    path: PathBuf,
    buf: Vec<u8>,
    len: u64,
}

impl SegmentWriter {
    /// Opens (or creates) a segment in append mode.
    pub fn create<P: AsRef<Path>>(path: P) -> Result<Self> {
        let path = path.as_ref().to_path_buf();
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .read(true)
            .open(&path)?;
        let len = file.metadata()?.len();
        Ok(Self {
            file,
            path,
            buf: Vec::with_capacity(256),
            len,
        })
    }

    pub fn append(&mut self, entry: &LogEntry) -> Result<()> {
        let record_len = (entry.payload.len() as u64) + (HEADER_BYTES as u64) - 4;
        if record_len > MAX_RECORD_SIZE as u64 {
            return Err(LogError::Io(io::Error::new(
                io::ErrorKind::InvalidInput,
                "log record too large",
            )));
        }

        self.buf.clear();
        // header placeholder: record_len + crc, filled in below
        self.buf.extend_from_slice(&[0u8; 8]);
        self.buf.write_u64::<LittleEndian>(entry.lsn.view_id)?;
        self.buf.write_u64::<LittleEndian>(entry.lsn.sequence_no)?;
        self.buf.extend_from_slice(&entry.payload);

        let mut hasher = Crc32::new();
        hasher.update(&self.buf[8..]);
        let crc = hasher.finalize();
        self.buf[0..4].copy_from_slice(&(record_len as u32).to_le_bytes());
        self.buf[4..8].copy_from_slice(&crc.to_le_bytes());

        if let Err(e) = self.file.write_all(&self.buf) {
            // drop any partial frame so a retry starts on a clean boundary
            let _ = self.file.set_len(self.len);
            return Err(e.into());
        }
        self.len += self.buf.len() as u64;
        Ok(())
    }

    /// fsync data and metadata.
    pub fn sync_all(&mut self) -> Result<()> {
        self.file.flush()?;
        self.file.sync_all()?;
        Ok(())
    }

    /// fdatasync.
    pub fn sync_data(&mut self) -> Result<()> {
        self.file.flush()?;
        self.file.sync_data()?;
        Ok(())
    }

    /// Bytes currently in the segment.
    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

/// Sequential reader over one segment.
///
/// Generic over any `Read` implementor so tests can feed in-memory buffers.
pub struct SegmentReader<R: Read> {
    rdr: BufReader<R>,
    name: String,
}

impl SegmentReader<File> {
    pub fn open<P: AsRef<Path>>(path: P) -> Result<SegmentReader<File>> {
        let name = path.as_ref().display().to_string();
        let f = File::open(path)?;
        Ok(SegmentReader {
            rdr: BufReader::new(f),
            name,
        })
    }
}

impl<R: Read> SegmentReader<R> {
    pub fn from_reader(reader: R) -> Self {
        SegmentReader {
            rdr: BufReader::new(reader),
            name: "<memory>".to_string(),
        }
    }

    /// Reads the next entry.
    ///
    /// - Clean EOF or a truncated tail record -> `Ok(None)`.
    /// - CRC mismatch or an impossible length -> `Err(LogError::Corrupt)`.
    pub fn next_entry(&mut self) -> Result<Option<LogEntry>> {
        let record_len = match self.rdr.read_u32::<LittleEndian>() {
            Ok(v) => v,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        if (record_len as usize) < HEADER_BYTES - 4 || record_len > MAX_RECORD_SIZE {
            return Err(LogError::Corrupt(format!(
                "{}: invalid record length {}",
                self.name, record_len
            )));
        }

        let crc = match self.rdr.read_u32::<LittleEndian>() {
            Ok(v) => v,
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
            Err(e) => return Err(e.into()),
        };

        let mut body = vec![0u8; record_len as usize - 4];
        match self.rdr.read_exact(&mut body) {
            Ok(()) => {}
            Err(e) if e.kind() == io::ErrorKind::UnexpectedEof => {
                log::warn!("{}: truncated tail record ignored", self.name);
                return Ok(None);
            }
            Err(e) => return Err(e.into()),
        }

        let mut hasher = Crc32::new();
        hasher.update(&body);
        if hasher.finalize() != crc {
            return Err(LogError::Corrupt(format!("{}: checksum mismatch", self.name)));
        }

        let mut br = &body[..];
        let view_id = br.read_u64::<LittleEndian>()?;
        let sequence_no = br.read_u64::<LittleEndian>()?;
        Ok(Some(LogEntry {
            lsn: Lsn::new(view_id, sequence_no),
            payload: br.to_vec(),
        }))
    }

    /// Replays every valid entry of the segment through `apply`.
    pub fn replay<F>(&mut self, mut apply: F) -> Result<()>
    where
        F: FnMut(LogEntry),
    {
        while let Some(entry) = self.next_entry()? {
            apply(entry);
        }
        Ok(())
    }
}
