//! Master side: pushes every durable entry to each slave.
//!
//! The logger listener only enqueues; one sender thread per slave delivers
//! entries in LSN order and reports the outcome to the [`AckTracker`]. A
//! slave that misses entries notices the gap on the next one and catches up
//! by itself.

use crossbeam_channel::{unbounded, Receiver, Sender};
use log::{debug, warn};
use parking_lot::Mutex;
use std::sync::Arc;
use std::thread::{self, JoinHandle};
use std::time::Duration;
use wal::{DiskLogger, LogEntry};

use super::{AckTracker, SlaveClient};
use crate::Result;

const RETRY_BACKOFF: Duration = Duration::from_millis(50);

struct SlaveSender {
    address: String,
    tx: Sender<LogEntry>,
    handle: JoinHandle<()>,
}

pub(crate) struct Fanout {
    senders: Mutex<Vec<SlaveSender>>,
    addresses: Vec<String>,
    tracker: Arc<AckTracker>,
}

impl Fanout {
    pub fn start(
        slaves: Vec<Arc<dyn SlaveClient>>,
        tracker: Arc<AckTracker>,
        max_retries: u32,
    ) -> Result<Arc<Self>> {
        let mut senders = Vec::with_capacity(slaves.len());
        for client in slaves {
            let (tx, rx) = unbounded();
            let address = client.address().to_string();
            let tracker = Arc::clone(&tracker);
            let handle = thread::Builder::new()
                .name(format!("tidedb-fanout-{}", address))
                .spawn(move || send_loop(client, rx, tracker, max_retries))?;
            senders.push(SlaveSender { address, tx, handle });
        }
        let addresses = senders.iter().map(|s| s.address.clone()).collect();
        Ok(Arc::new(Self {
            senders: Mutex::new(senders),
            addresses,
            tracker,
        }))
    }

    /// Hooks the fan-out into the logger so every durable entry is shipped.
    pub fn install(self: &Arc<Self>, logger: &DiskLogger) {
        let fanout = Arc::clone(self);
        logger.set_listener(Some(Arc::new(move |entry: &LogEntry| fanout.dispatch(entry))));
    }

    pub fn addresses(&self) -> Vec<String> {
        self.addresses.clone()
    }

    /// The quorum is fixed here, against the slave set of this fan-out.
    /// Runs before the append is acknowledged, so the writer finds its
    /// entry registered.
    fn dispatch(&self, entry: &LogEntry) {
        let senders = self.senders.lock();
        let sync_n = self.tracker.sync_n();
        if sync_n > 0 {
            self.tracker.register(entry.lsn, sync_n, senders.len());
        }
        for s in senders.iter() {
            if s.tx.send(entry.clone()).is_err() {
                self.tracker.nack(entry.lsn);
            }
        }
    }

    /// Stops the sender threads once their queues are drained.
    pub fn shutdown(&self) {
        let senders: Vec<_> = std::mem::take(&mut *self.senders.lock());
        for s in senders {
            drop(s.tx);
            if s.handle.join().is_err() {
                warn!("sender thread for slave '{}' panicked", s.address);
            }
        }
    }
}

fn send_loop(
    client: Arc<dyn SlaveClient>,
    rx: Receiver<LogEntry>,
    tracker: Arc<AckTracker>,
    max_retries: u32,
) {
    while let Ok(entry) = rx.recv() {
        let mut attempt = 0;
        loop {
            match client.replicate(&entry) {
                Ok(()) => {
                    tracker.ack(entry.lsn);
                    break;
                }
                Err(e) if attempt < max_retries => {
                    debug!(
                        "replicating {} to '{}' failed (attempt {}): {}",
                        entry.lsn,
                        client.address(),
                        attempt + 1,
                        e
                    );
                    attempt += 1;
                    thread::sleep(RETRY_BACKOFF);
                }
                Err(e) => {
                    warn!(
                        "slave '{}' did not take {}: {}",
                        client.address(),
                        entry.lsn,
                        e
                    );
                    tracker.nack(entry.lsn);
                    break;
                }
            }
        }
    }
    debug!("sender for slave '{}' stopped", client.address());
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::replication::TransportError;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use wal::Lsn;

    struct Accepting {
        taken: AtomicUsize,
    }

    impl SlaveClient for Accepting {
        fn address(&self) -> &str {
            "s1"
        }

        fn replicate(&self, _entry: &LogEntry) -> std::result::Result<(), TransportError> {
            self.taken.fetch_add(1, Ordering::Relaxed);
            Ok(())
        }
    }

    fn entry(seq: u64) -> LogEntry {
        LogEntry::new(Lsn::new(1, seq), vec![seq as u8])
    }

    #[test]
    fn acks_without_quorum_leave_nothing_tracked() -> anyhow::Result<()> {
        let slave = Arc::new(Accepting {
            taken: AtomicUsize::new(0),
        });
        let tracker = Arc::new(AckTracker::new(0));
        let clients: Vec<Arc<dyn SlaveClient>> = vec![slave.clone()];
        let fanout = Fanout::start(clients, Arc::clone(&tracker), 0)?;
        for seq in 1..=500 {
            fanout.dispatch(&entry(seq));
        }
        fanout.shutdown();

        assert_eq!(slave.taken.load(Ordering::Relaxed), 500);
        assert!(tracker.entries.lock().is_empty());
        Ok(())
    }

    #[test]
    fn awaited_entries_are_released() -> anyhow::Result<()> {
        let slave = Arc::new(Accepting {
            taken: AtomicUsize::new(0),
        });
        let tracker = Arc::new(AckTracker::new(1));
        let clients: Vec<Arc<dyn SlaveClient>> = vec![slave];
        let fanout = Fanout::start(clients, Arc::clone(&tracker), 0)?;
        for seq in 1..=100 {
            let e = entry(seq);
            fanout.dispatch(&e);
            tracker.wait(e.lsn, Duration::from_secs(5))?;
        }
        fanout.shutdown();
        assert!(tracker.entries.lock().is_empty());
        Ok(())
    }
}
