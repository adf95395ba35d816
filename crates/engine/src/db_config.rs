//! The database configuration file: which databases exist, their ids and
//! the comparator of every index.
//!
//! ```text
//! [magic "TDBC": u32][version: u32][db_count: u32][next_db_id: u32]
//! per database: [name: str][id: u32][index_count: u32][comparator id: str]*
//! [crc32 of everything above: u32]
//! ```
//!
//! Rewritten through a temp file, fsync and rename, so a crash leaves
//! either the old or the new file.

use std::fs::{self, OpenOptions};
use std::io::{ErrorKind, Write};
use std::path::Path;

use crate::codec::{self, Decoder};
use crate::{Error, Result};

pub const CONFIG_FILENAME: &str = "config.db";

const CONFIG_MAGIC: u32 = 0x4342_4454;
pub const FORMAT_VERSION: u32 = 1;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbEntry {
    pub name: String,
    pub id: u32,
    /// One comparator id per index.
    pub comparators: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DbConfig {
    pub next_db_id: u32,
    pub databases: Vec<DbEntry>,
}

impl Default for DbConfig {
    fn default() -> Self {
        Self {
            next_db_id: 1,
            databases: Vec::new(),
        }
    }
}

impl DbConfig {
    /// Reads the file, `None` if it does not exist.
    pub fn load(path: &Path) -> Result<Option<Self>> {
        let raw = match fs::read(path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        Self::decode(&raw).map(Some).map_err(|e| match e {
            Error::Corruption(reason) => {
                Error::Corruption(format!("{}: {}", path.display(), reason))
            }
            other => other,
        })
    }

    pub fn decode(raw: &[u8]) -> Result<Self> {
        if raw.len() < 4 {
            return Err(Error::Corruption("config file is truncated".into()));
        }
        let (body, tail) = raw.split_at(raw.len() - 4);
        let stored = u32::from_le_bytes([tail[0], tail[1], tail[2], tail[3]]);
        if crc32fast::hash(body) != stored {
            return Err(Error::Corruption("config file checksum mismatch".into()));
        }

        let mut dec = Decoder::new(body, "database config");
        if dec.u32()? != CONFIG_MAGIC {
            return Err(Error::Corruption("not a database config file".into()));
        }
        let version = dec.u32()?;
        if version != FORMAT_VERSION {
            return Err(Error::Corruption(format!(
                "unsupported config format version {}",
                version
            )));
        }
        let count = dec.u32()?;
        let next_db_id = dec.u32()?;
        let mut databases = Vec::with_capacity(count as usize);
        for _ in 0..count {
            let name = dec.string()?;
            let id = dec.u32()?;
            let index_count = dec.u32()?;
            let comparators = (0..index_count)
                .map(|_| dec.string())
                .collect::<Result<Vec<_>>>()?;
            if id >= next_db_id {
                return Err(Error::Corruption(format!(
                    "database '{}' has id {} beyond next id {}",
                    name, id, next_db_id
                )));
            }
            databases.push(DbEntry {
                name,
                id,
                comparators,
            });
        }
        dec.finish()?;
        Ok(Self {
            next_db_id,
            databases,
        })
    }

    pub fn encode(&self) -> Vec<u8> {
        let mut buf = Vec::new();
        codec::put_u32(&mut buf, CONFIG_MAGIC);
        codec::put_u32(&mut buf, FORMAT_VERSION);
        codec::put_u32(&mut buf, self.databases.len() as u32);
        codec::put_u32(&mut buf, self.next_db_id);
        for db in &self.databases {
            codec::put_str(&mut buf, &db.name);
            codec::put_u32(&mut buf, db.id);
            codec::put_u32(&mut buf, db.comparators.len() as u32);
            for cmp in &db.comparators {
                codec::put_str(&mut buf, cmp);
            }
        }
        let crc = crc32fast::hash(&buf);
        codec::put_u32(&mut buf, crc);
        buf
    }

    pub fn save(&self, path: &Path) -> Result<()> {
        let tmp = path.with_extension("tmp");
        {
            let mut f = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp)?;
            f.write_all(&self.encode())?;
            f.sync_all()?;
        }
        fs::rename(&tmp, path)?;
        if let Some(parent) = path.parent() {
            // directory fsync is not supported everywhere
            if let Ok(dir) = fs::File::open(parent) {
                let _ = dir.sync_all();
            }
        }
        Ok(())
    }
}
