//! # Manifest - per-database run metadata
//!
//! Tracks which run files make up each index of a database, and the LSN
//! up to which those runs reflect the log. Written at every checkpoint and
//! compaction; read when the database is opened.
//!
//! ## File Format
//!
//! ```text
//! LSN:1.42
//! I0:idx0-1-42-1708600000001.run
//! I0:idx0-1-17-1708599999000.run
//! I1:idx1-1-42-1708600000002.run
//! ```
//!
//! Runs of one index are listed newest first. Lines starting with `#` are
//! comments. Empty lines are ignored. A database whose manifest has no `LSN`
//! line has nothing on disk and reports [`Lsn::ZERO`].
//!
//! ## Crash Safety
//!
//! The manifest is rewritten atomically: write to a `.tmp` file, fsync, then
//! rename over the existing manifest. Saving the manifest is the commit
//! point of a checkpoint for that database.

use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use wal::Lsn;

use crate::{Error, Result};

/// Name of the manifest file within a database directory.
pub const MANIFEST_FILENAME: &str = "MANIFEST";

const MANIFEST_TMP_FILENAME: &str = "MANIFEST.tmp";

#[derive(Debug, Clone)]
pub struct Manifest {
    path: PathBuf,
    lsn: Lsn,
    /// Run filenames per index, newest first.
    runs: Vec<Vec<String>>,
}

fn parse_lsn(s: &str) -> Option<Lsn> {
    let (view, seq) = s.split_once('.')?;
    Some(Lsn::new(view.parse().ok()?, seq.parse().ok()?))
}

impl Manifest {
    /// Loads `db_dir/MANIFEST`, or starts an empty one for `index_count`
    /// indices if the file does not exist.
    ///
    /// # Errors
    ///
    /// Returns [`Error::Corruption`] if a line cannot be parsed or names an
    /// index beyond `index_count`.
    pub fn load_or_create(db_dir: &Path, index_count: usize) -> Result<Self> {
        let path = db_dir.join(MANIFEST_FILENAME);
        let mut manifest = Self {
            path,
            lsn: Lsn::ZERO,
            runs: vec![Vec::new(); index_count],
        };
        if !manifest.path.exists() {
            return Ok(manifest);
        }

        let reader = BufReader::new(File::open(&manifest.path)?);
        for (line_num, line) in reader.lines().enumerate() {
            let line = line?;
            let trimmed = line.trim();
            if trimmed.is_empty() || trimmed.starts_with('#') {
                continue;
            }
            let bad = |what: &str| {
                Error::Corruption(format!(
                    "{} line {}: {}: {}",
                    manifest.path.display(),
                    line_num + 1,
                    what,
                    trimmed
                ))
            };

            let (tag, value) = trimmed
                .split_once(':')
                .ok_or_else(|| bad("expected '<tag>:<value>'"))?;
            if tag == "LSN" {
                manifest.lsn = parse_lsn(value).ok_or_else(|| bad("invalid lsn"))?;
                continue;
            }
            let index: usize = tag
                .strip_prefix('I')
                .and_then(|i| i.parse().ok())
                .ok_or_else(|| bad("unknown tag"))?;
            let runs = manifest
                .runs
                .get_mut(index)
                .ok_or_else(|| bad("index out of range"))?;
            runs.push(value.to_string());
        }
        Ok(manifest)
    }

    /// Persists the manifest. Falls back to truncate-and-write when the
    /// rename over the old file is refused by the platform.
    pub fn save(&self) -> Result<()> {
        let tmp_path = self.path.with_file_name(MANIFEST_TMP_FILENAME);
        {
            let mut f = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&tmp_path)?;
            self.write_contents(&mut f)?;
            f.flush()?;
            f.sync_all()?;
        }

        if fs::rename(&tmp_path, &self.path).is_err() {
            let mut f = OpenOptions::new()
                .create(true)
                .write(true)
                .truncate(true)
                .open(&self.path)?;
            self.write_contents(&mut f)?;
            f.flush()?;
            f.sync_all()?;
            let _ = fs::remove_file(&tmp_path);
        }
        Ok(())
    }

    fn write_contents(&self, f: &mut File) -> Result<()> {
        writeln!(f, "# TideDB database manifest")?;
        writeln!(f, "# Format: LSN:<view>.<seq> then I<index>:<run> (newest first)")?;
        if self.lsn != Lsn::ZERO {
            writeln!(f, "LSN:{}.{}", self.lsn.view_id, self.lsn.sequence_no)?;
        }
        for (index, runs) in self.runs.iter().enumerate() {
            for run in runs {
                writeln!(f, "I{}:{}", index, run)?;
            }
        }
        Ok(())
    }

    /// LSN of the last log entry reflected in the listed runs.
    pub fn lsn(&self) -> Lsn {
        self.lsn
    }

    pub fn set_lsn(&mut self, lsn: Lsn) {
        self.lsn = lsn;
    }

    pub fn index_count(&self) -> usize {
        self.runs.len()
    }

    pub fn runs(&self, index: usize) -> &[String] {
        self.runs.get(index).map(Vec::as_slice).unwrap_or(&[])
    }

    /// Every run filename referenced by any index.
    pub fn all_runs(&self) -> impl Iterator<Item = &str> {
        self.runs.iter().flatten().map(String::as_str)
    }

    /// Adds a run as the newest of `index` (does **not** save to disk).
    pub fn add(&mut self, index: usize, filename: String) {
        if let Some(runs) = self.runs.get_mut(index) {
            runs.insert(0, filename);
        }
    }

    /// Replaces every run of `index` with a single compacted run.
    pub fn replace_index(&mut self, index: usize, filename: String) {
        if let Some(runs) = self.runs.get_mut(index) {
            runs.clear();
            runs.push(filename);
        }
    }
}
