//! The disk logger: a single background thread that owns the active
//! segment, stamps entries with LSNs in arrival order and acknowledges them
//! according to the configured [`SyncMode`].
//!
//! ```text
//! append() ──► queue ──► logger thread ──► segment.write ──► (fsync) ──► promise
//!                               ▲
//!       lock() / switch_log_file() share the same segment mutex, so a
//!       rotation never interleaves with a batch write.
//! ```

use config::SyncMode;
use crossbeam_channel::{unbounded, Receiver, RecvTimeoutError, Sender};
use parking_lot::{Mutex, MutexGuard, RwLock};
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::{Duration, Instant};

use crate::segments::{list_segments, segment_file_name};
use crate::{promise, LogEntry, LogError, Lsn, OpFuture, Promise, Result, SegmentWriter};

/// Attempts per entry before a write failure becomes fatal.
const MAX_WRITE_ATTEMPTS: usize = 3;
/// Upper bound on entries written between two sync decisions.
const MAX_BATCH: usize = 512;
/// Idle wake-up of the thread when the mode has no periodic sync.
const IDLE_TICK: Duration = Duration::from_secs(1);

/// Called from the logger thread for every entry once it is durable per the
/// sync mode, in LSN order. Must not block.
pub type EntryListener = Arc<dyn Fn(&LogEntry) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoggerState {
    Running,
    LockedForRotation,
    ShuttingDown,
    Stopped,
}

enum Request {
    Append {
        lsn: Option<Lsn>,
        payload: Vec<u8>,
        promise: Promise<Lsn, LogError>,
    },
    Shutdown,
}

struct Segment {
    writer: SegmentWriter,
    next_lsn: Lsn,
    last_written: Lsn,
    entries: u64,
    unsynced: bool,
    last_sync: Instant,
}

struct Shared {
    dir: PathBuf,
    sync_mode: SyncMode,
    segment: Mutex<Segment>,
    state: Mutex<LoggerState>,
    failure: Mutex<Option<String>>,
    listener: RwLock<Option<EntryListener>>,
}

pub struct DiskLogger {
    shared: Arc<Shared>,
    tx: Sender<Request>,
    handle: Mutex<Option<JoinHandle<()>>>,
}

impl DiskLogger {
    /// Starts a logger whose next entry follows `last_written`.
    ///
    /// The active segment is `<dir>/<next lsn>.log`; it is created if absent
    /// and appended to otherwise.
    pub fn open(dir: impl AsRef<Path>, last_written: Lsn, sync_mode: SyncMode) -> Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        fs::create_dir_all(&dir)?;

        let next_lsn = last_written.next();
        let writer = SegmentWriter::create(dir.join(segment_file_name(next_lsn)))?;
        let shared = Arc::new(Shared {
            dir,
            sync_mode,
            segment: Mutex::new(Segment {
                writer,
                next_lsn,
                last_written,
                entries: 0,
                unsynced: false,
                last_sync: Instant::now(),
            }),
            state: Mutex::new(LoggerState::Running),
            failure: Mutex::new(None),
            listener: RwLock::new(None),
        });

        let (tx, rx) = unbounded();
        let thread_shared = Arc::clone(&shared);
        let handle = std::thread::Builder::new()
            .name("disk-logger".into())
            .spawn(move || run(thread_shared, rx))?;

        log::debug!(
            "disk logger started in {} at {} ({:?})",
            shared.dir.display(),
            next_lsn,
            sync_mode
        );
        Ok(Self {
            shared,
            tx,
            handle: Mutex::new(Some(handle)),
        })
    }

    /// Appends `payload` under the next LSN.
    pub fn append(&self, payload: Vec<u8>) -> OpFuture<Lsn, LogError> {
        self.submit(None, payload)
    }

    /// Appends `payload` under an LSN chosen by the caller (replicated
    /// entries carry the master's LSN). It must sort after everything
    /// already written.
    pub fn append_at(&self, lsn: Lsn, payload: Vec<u8>) -> OpFuture<Lsn, LogError> {
        self.submit(Some(lsn), payload)
    }

    fn submit(&self, lsn: Option<Lsn>, payload: Vec<u8>) -> OpFuture<Lsn, LogError> {
        if let Some(reason) = self.failure() {
            return OpFuture::ready(Err(LogError::Failed(reason)));
        }
        if matches!(
            self.state(),
            LoggerState::ShuttingDown | LoggerState::Stopped
        ) {
            return OpFuture::ready(Err(LogError::ShutDown));
        }
        let (promise, future) = promise();
        if let Err(e) = self.tx.send(Request::Append {
            lsn,
            payload,
            promise,
        }) {
            if let Request::Append { promise, .. } = e.into_inner() {
                promise.fail(LogError::ShutDown);
            }
        }
        future
    }

    /// Takes the rotation lock. Appends wait until the guard is dropped.
    pub fn lock(&self) -> LoggerLock<'_> {
        let guard = self.shared.segment.lock();
        {
            let mut state = self.shared.state.lock();
            if *state == LoggerState::Running {
                *state = LoggerState::LockedForRotation;
            }
        }
        LoggerLock {
            shared: &self.shared,
            guard,
        }
    }

    /// LSN of the last entry written (or the starting point if none).
    pub fn latest_lsn(&self) -> Lsn {
        self.shared.segment.lock().last_written
    }

    /// Bytes in the active segment.
    pub fn segment_size(&self) -> u64 {
        self.shared.segment.lock().writer.len()
    }

    pub fn state(&self) -> LoggerState {
        *self.shared.state.lock()
    }

    /// Reason of a fatal write or sync failure, if one happened.
    pub fn failure(&self) -> Option<String> {
        self.shared.failure.lock().clone()
    }

    pub fn set_listener(&self, listener: Option<EntryListener>) {
        *self.shared.listener.write() = listener;
    }

    pub fn dir(&self) -> &Path {
        &self.shared.dir
    }

    pub fn sync_mode(&self) -> SyncMode {
        self.shared.sync_mode
    }

    /// Drains queued appends, syncs the active segment and stops the thread.
    /// Idempotent.
    pub fn shutdown(&self) -> Result<()> {
        let handle = self.handle.lock().take();
        let Some(handle) = handle else {
            return Ok(());
        };
        *self.shared.state.lock() = LoggerState::ShuttingDown;
        let _ = self.tx.send(Request::Shutdown);
        if handle.join().is_err() {
            log::error!("disk logger thread panicked");
        }
        *self.shared.state.lock() = LoggerState::Stopped;
        match self.failure() {
            Some(reason) => Err(LogError::Failed(reason)),
            None => Ok(()),
        }
    }
}

impl Drop for DiskLogger {
    fn drop(&mut self) {
        let _ = self.shutdown();
    }
}

impl fmt::Debug for DiskLogger {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("DiskLogger")
            .field("dir", &self.shared.dir)
            .field("sync_mode", &self.shared.sync_mode)
            .field("state", &self.state())
            .finish()
    }
}

/// Exclusive access to the active segment. Holding it blocks every append.
pub struct LoggerLock<'a> {
    shared: &'a Shared,
    guard: MutexGuard<'a, Segment>,
}

impl LoggerLock<'_> {
    /// Seals the active segment and starts a new one.
    ///
    /// Returns the LSN of the last entry written before the switch. With
    /// `increment_view` the next entry is `(view + 1, 1)`; otherwise the new
    /// segment is named by the next LSN of the current view. Switching an
    /// empty segment without a view change keeps it.
    pub fn switch_log_file(&mut self, increment_view: bool) -> Result<Lsn> {
        let seg = &mut *self.guard;
        let last = seg.last_written;
        if !increment_view && seg.entries == 0 {
            return Ok(last);
        }

        let next_first = if increment_view {
            Lsn::new(seg.next_lsn.view_id.max(last.view_id), 0).next_view()
        } else {
            seg.next_lsn
        };

        seg.writer.sync_all()?;
        let old_path = seg.writer.path().to_path_buf();
        let old_empty = seg.entries == 0;
        seg.writer = SegmentWriter::create(self.shared.dir.join(segment_file_name(next_first)))?;
        if old_empty && seg.writer.path() != old_path.as_path() {
            let _ = fs::remove_file(&old_path);
        }
        seg.next_lsn = next_first;
        seg.entries = 0;
        seg.unsynced = false;
        seg.last_sync = Instant::now();

        log::debug!(
            "switched log file at {} (next entry {}{})",
            last,
            next_first,
            if increment_view { ", new view" } else { "" }
        );
        Ok(last)
    }

    /// Discards every segment and restarts the log after `last_written`.
    /// Used when the local state is replaced wholesale by a transfer from
    /// the master.
    pub fn reset(&mut self, last_written: Lsn) -> Result<()> {
        let seg = &mut *self.guard;
        for (_, path) in list_segments(&self.shared.dir)? {
            fs::remove_file(path)?;
        }
        let next_lsn = last_written.next();
        seg.writer = SegmentWriter::create(self.shared.dir.join(segment_file_name(next_lsn)))?;
        seg.next_lsn = next_lsn;
        seg.last_written = last_written;
        seg.entries = 0;
        seg.unsynced = false;
        log::info!("log reset, next entry {}", next_lsn);
        Ok(())
    }

    pub fn latest_lsn(&self) -> Lsn {
        self.guard.last_written
    }
}

impl Drop for LoggerLock<'_> {
    fn drop(&mut self) {
        let mut state = self.shared.state.lock();
        if *state == LoggerState::LockedForRotation {
            *state = LoggerState::Running;
        }
    }
}

fn run(shared: Arc<Shared>, rx: Receiver<Request>) {
    let tick = shared.sync_mode.sync_interval().unwrap_or(IDLE_TICK);
    let mut batch = Vec::with_capacity(MAX_BATCH);

    loop {
        let mut shutdown = false;
        match rx.recv_timeout(tick) {
            Ok(Request::Append {
                lsn,
                payload,
                promise,
            }) => {
                batch.push((lsn, payload, promise));
                while batch.len() < MAX_BATCH {
                    match rx.try_recv() {
                        Ok(Request::Append {
                            lsn,
                            payload,
                            promise,
                        }) => batch.push((lsn, payload, promise)),
                        Ok(Request::Shutdown) => {
                            shutdown = true;
                            break;
                        }
                        Err(_) => break,
                    }
                }
            }
            Ok(Request::Shutdown) => shutdown = true,
            Err(RecvTimeoutError::Timeout) => {}
            Err(RecvTimeoutError::Disconnected) => shutdown = true,
        }

        if !batch.is_empty() {
            shared.write_batch(&mut batch);
        }
        shared.periodic_sync();

        if shutdown {
            break;
        }
    }

    // anything still queued after the shutdown marker is rejected
    while let Ok(req) = rx.try_recv() {
        if let Request::Append { promise, .. } = req {
            promise.fail(LogError::ShutDown);
        }
    }
    let mut seg = shared.segment.lock();
    if let Err(e) = seg.writer.sync_all() {
        shared.fail(format!("final sync failed: {}", e));
    }
    log::debug!("disk logger stopped at {}", seg.last_written);
}

type Pending = (Option<Lsn>, Vec<u8>, Promise<Lsn, LogError>);

impl Shared {
    fn fail(&self, reason: String) {
        log::error!("disk logger failure: {}", reason);
        let mut failure = self.failure.lock();
        if failure.is_none() {
            *failure = Some(reason);
        }
    }

    fn write_batch(&self, batch: &mut Vec<Pending>) {
        let mut seg = self.segment.lock();
        let mut written: Vec<(LogEntry, Promise<Lsn, LogError>)> = Vec::with_capacity(batch.len());

        for (lsn, payload, promise) in batch.drain(..) {
            if let Some(reason) = self.failure.lock().clone() {
                promise.fail(LogError::Failed(reason));
                continue;
            }
            let lsn = match lsn {
                Some(lsn) if lsn <= seg.last_written => {
                    promise.fail(LogError::OutOfOrder {
                        lsn,
                        last: seg.last_written,
                    });
                    continue;
                }
                Some(lsn) => lsn,
                None => seg.next_lsn,
            };
            let entry = LogEntry::new(lsn, payload);

            let mut attempt = 0;
            let outcome = loop {
                attempt += 1;
                match seg.writer.append(&entry) {
                    Ok(()) => break Ok(()),
                    Err(e) if attempt < MAX_WRITE_ATTEMPTS => {
                        log::warn!("log write of {} failed (attempt {}): {}", lsn, attempt, e);
                    }
                    Err(e) => break Err(e),
                }
            };
            match outcome {
                Ok(()) => {
                    seg.last_written = lsn;
                    seg.next_lsn = lsn.next();
                    seg.entries += 1;
                    written.push((entry, promise));
                }
                Err(e) => {
                    let reason = format!("write of {} failed: {}", lsn, e);
                    self.fail(reason.clone());
                    promise.fail(LogError::Failed(reason));
                }
            }
        }

        if written.is_empty() {
            return;
        }

        let synced = match self.sync_mode {
            SyncMode::SyncWrite => seg.writer.sync_all(),
            SyncMode::FDataSync => seg.writer.sync_data(),
            SyncMode::Async | SyncMode::PseudoSync { .. } => {
                seg.unsynced = true;
                Ok(())
            }
        };
        if let Err(e) = synced {
            let reason = format!("sync failed: {}", e);
            self.fail(reason.clone());
            for (_, promise) in written {
                promise.fail(LogError::Failed(reason.clone()));
            }
            return;
        }
        if matches!(self.sync_mode, SyncMode::SyncWrite | SyncMode::FDataSync) {
            seg.last_sync = Instant::now();
        }

        let listener = self.listener.read().clone();
        for (entry, promise) in written {
            if let Some(listener) = &listener {
                listener(&entry);
            }
            promise.succeed(entry.lsn);
        }
    }

    fn periodic_sync(&self) {
        let Some(interval) = self.sync_mode.sync_interval() else {
            return;
        };
        let mut seg = self.segment.lock();
        if !seg.unsynced || seg.last_sync.elapsed() < interval {
            return;
        }
        match seg.writer.sync_data() {
            Ok(()) => {
                seg.unsynced = false;
                seg.last_sync = Instant::now();
            }
            Err(e) => self.fail(format!("periodic sync failed: {}", e)),
        }
    }
}
