use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use crate::{LogEntry, LogError, Lsn, Result, SegmentReader};

pub const SEGMENT_EXTENSION: &str = "log";

/// `<viewId>.<sequenceNo>.log`
pub fn segment_file_name(first: Lsn) -> String {
    format!(
        "{}.{}.{}",
        first.view_id, first.sequence_no, SEGMENT_EXTENSION
    )
}

/// Inverse of [`segment_file_name`]. Returns `None` for foreign files.
pub fn parse_segment_name(name: &str) -> Option<Lsn> {
    let stem = name.strip_suffix(".log")?;
    let (view, seq) = stem.split_once('.')?;
    Some(Lsn::new(view.parse().ok()?, seq.parse().ok()?))
}

/// All segments in `dir`, sorted by the LSN in their name (numerically,
/// so `1.10.log` comes after `1.9.log`). A missing directory is empty.
pub fn list_segments(dir: &Path) -> io::Result<Vec<(Lsn, PathBuf)>> {
    let rd = match fs::read_dir(dir) {
        Ok(rd) => rd,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(e) => return Err(e),
    };
    let mut segments = Vec::new();
    for entry in rd {
        let entry = entry?;
        let name = entry.file_name();
        if let Some(lsn) = name.to_str().and_then(parse_segment_name) {
            segments.push((lsn, entry.path()));
        }
    }
    segments.sort_by_key(|(lsn, _)| *lsn);
    Ok(segments)
}

/// Deletes every segment whose first LSN is `<= upto`. Used after a
/// checkpoint has made those entries redundant. Returns the number removed.
pub fn delete_segments_up_to(dir: &Path, upto: Lsn) -> io::Result<usize> {
    let mut removed = 0;
    for (first, path) in list_segments(dir)? {
        if first <= upto {
            fs::remove_file(&path)?;
            removed += 1;
        }
    }
    if removed > 0 {
        log::debug!("removed {} log segment(s) up to {}", removed, upto);
    }
    Ok(removed)
}

/// Entries with `from <= lsn <= to`, read from the segments in `dir`.
///
/// Returns `Ok(None)` when the log no longer reaches back to `from`, i.e. no
/// segment starts at or before it. This is distinct from `Ok(Some(vec![]))`,
/// which means the range is covered but holds no entries.
pub fn read_range(dir: &Path, from: Lsn, to: Lsn) -> Result<Option<Vec<LogEntry>>> {
    let segments = list_segments(dir)?;
    let start = match segments.iter().rposition(|(first, _)| *first <= from) {
        Some(pos) => pos,
        None => return Ok(None),
    };

    let mut out = Vec::new();
    for (first, path) in &segments[start..] {
        if *first > to {
            break;
        }
        let mut reader = SegmentReader::open(path)?;
        while let Some(entry) = reader.next_entry()? {
            if entry.lsn > to {
                break;
            }
            if entry.lsn >= from {
                out.push(entry);
            }
        }
    }
    Ok(Some(out))
}

/// Iterator over every entry in `dir`, in LSN order across segments.
///
/// Fails with [`LogError::Corrupt`] if an entry does not sort strictly after
/// its predecessor.
pub struct LogReplay {
    segments: std::vec::IntoIter<(Lsn, PathBuf)>,
    current: Option<SegmentReader<fs::File>>,
    last: Option<Lsn>,
    failed: bool,
}

impl LogReplay {
    pub fn open(dir: &Path) -> Result<Self> {
        Ok(Self {
            segments: list_segments(dir)?.into_iter(),
            current: None,
            last: None,
            failed: false,
        })
    }

    fn next_entry(&mut self) -> Result<Option<LogEntry>> {
        loop {
            if let Some(reader) = self.current.as_mut() {
                if let Some(entry) = reader.next_entry()? {
                    if let Some(last) = self.last {
                        if entry.lsn <= last {
                            return Err(LogError::Corrupt(format!(
                                "entry {} follows {}",
                                entry.lsn, last
                            )));
                        }
                    }
                    self.last = Some(entry.lsn);
                    return Ok(Some(entry));
                }
            }
            match self.segments.next() {
                Some((_, path)) => self.current = Some(SegmentReader::open(path)?),
                None => return Ok(None),
            }
        }
    }
}

impl Iterator for LogReplay {
    type Item = Result<LogEntry>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.failed {
            return None;
        }
        match self.next_entry() {
            Ok(Some(entry)) => Some(Ok(entry)),
            Ok(None) => None,
            Err(e) => {
                self.failed = true;
                Some(Err(e))
            }
        }
    }
}
