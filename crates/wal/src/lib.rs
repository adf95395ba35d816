//! # WAL - write-ahead log
//!
//! Every committed mutation is a [`LogEntry`]: an opaque payload stamped with
//! the [`Lsn`] that orders it against all other mutations of the engine.
//! Entries are appended to segment files named after the LSN of their first
//! entry (`<viewId>.<sequenceNo>.log`) and replayed in LSN order on restart.
//!
//! ## Record framing
//!
//! ```text
//! [record_len: u32 LE][crc32: u32 LE][view_id: u64 LE][sequence_no: u64 LE][payload ...]
//! ```
//!
//! `record_len` covers the CRC, the LSN and the payload but not itself. The
//! CRC covers the LSN and the payload. A truncated tail record (crash
//! mid-write) is treated as a clean end of segment; a checksum mismatch is
//! reported as corruption.
//!
//! ## Components
//!
//! | Module        | Purpose                                                   |
//! |---------------|-----------------------------------------------------------|
//! | [`lsn`]       | `Lsn` ordering and successor rules                        |
//! | [`record`]    | `SegmentWriter` / `SegmentReader` for one segment file     |
//! | [`segments`]  | Naming, listing, range reads and pruning of segment files  |
//! | [`logger`]    | `DiskLogger`: background writer thread, sync modes, rotation lock |
//! | [`completion`]| One-shot `Promise` / `OpFuture` pair used for acknowledgments |

pub mod completion;
pub mod logger;
pub mod lsn;
pub mod record;
pub mod segments;

pub use completion::{promise, Canceled, OpFuture, Promise};
pub use logger::{DiskLogger, EntryListener, LoggerLock, LoggerState};
pub use lsn::Lsn;
pub use record::{LogEntry, SegmentReader, SegmentWriter};
pub use segments::{
    delete_segments_up_to, list_segments, parse_segment_name, read_range, segment_file_name,
    LogReplay,
};

use std::io;
use thiserror::Error;

/// Errors that can occur during WAL operations.
#[derive(Debug, Error)]
pub enum LogError {
    #[error("io error: {0}")]
    Io(#[from] io::Error),

    /// A record failed CRC validation or the segment sequence is inconsistent.
    #[error("corrupt log: {0}")]
    Corrupt(String),

    #[error("lsn {lsn} is not after the last written lsn {last}")]
    OutOfOrder { lsn: Lsn, last: Lsn },

    #[error("logger is shut down")]
    ShutDown,

    /// A previous write or sync failed; the logger accepts no more entries.
    #[error("logger failed: {0}")]
    Failed(String),

    #[error("request was abandoned before completion")]
    Abandoned,
}

impl From<Canceled> for LogError {
    fn from(_: Canceled) -> Self {
        LogError::Abandoned
    }
}

pub type Result<T> = std::result::Result<T, LogError>;

#[cfg(test)]
mod tests;
