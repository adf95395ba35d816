//! Worker pool partitioned by database.
//!
//! Each worker owns a FIFO queue. An operation goes to worker
//! `partition % count`, so operations on one database run in order while
//! different databases proceed in parallel. A bounded queue rejects work
//! with [`Error::Busy`] instead of growing.

use crossbeam_channel::{bounded, unbounded, Receiver, Sender, TrySendError};
use log::debug;
use parking_lot::Mutex;
use std::thread::{self, JoinHandle};

use crate::{Error, Result};

pub(crate) type Job = Box<dyn FnOnce() + Send + 'static>;

enum Message {
    Run(Job),
    Stop,
}

pub(crate) struct WorkerPool {
    senders: Vec<Sender<Message>>,
    handles: Mutex<Vec<JoinHandle<()>>>,
}

fn worker_loop(rx: Receiver<Message>) {
    while let Ok(msg) = rx.recv() {
        match msg {
            Message::Run(job) => job(),
            Message::Stop => break,
        }
    }
}

impl WorkerPool {
    /// `count == 0` runs every job on the submitting thread.
    /// `max_queue_len == 0` leaves the queues unbounded.
    pub fn start(count: usize, max_queue_len: usize) -> Result<Self> {
        let mut senders = Vec::with_capacity(count);
        let mut handles = Vec::with_capacity(count);
        for i in 0..count {
            let (tx, rx) = if max_queue_len > 0 {
                bounded(max_queue_len)
            } else {
                unbounded()
            };
            let handle = thread::Builder::new()
                .name(format!("tidedb-worker-{}", i))
                .spawn(move || worker_loop(rx))?;
            senders.push(tx);
            handles.push(handle);
        }
        Ok(Self {
            senders,
            handles: Mutex::new(handles),
        })
    }

    pub fn len(&self) -> usize {
        self.senders.len()
    }

    pub fn submit(&self, partition: u64, job: Job) -> Result<()> {
        if self.senders.is_empty() {
            job();
            return Ok(());
        }
        let worker = (partition % self.senders.len() as u64) as usize;
        match self.senders[worker].try_send(Message::Run(job)) {
            Ok(()) => Ok(()),
            Err(TrySendError::Full(_)) => Err(Error::Busy(worker)),
            Err(TrySendError::Disconnected(_)) => {
                Err(Error::Internal("worker pool is shut down".into()))
            }
        }
    }

    /// Lets every worker drain its queue, then joins it.
    pub fn shutdown(&self) {
        let handles: Vec<_> = std::mem::take(&mut *self.handles.lock());
        if handles.is_empty() {
            return;
        }
        for tx in &self.senders {
            let _ = tx.send(Message::Stop);
        }
        for handle in handles {
            let _ = handle.join();
        }
        debug!("worker pool stopped");
    }
}
