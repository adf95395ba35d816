use crossbeam_channel::{bounded, Receiver, RecvTimeoutError, Sender, TryRecvError};
use std::time::Duration;

/// The producing side was dropped without fulfilling its promise.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Canceled;

/// Creates a connected promise/future pair.
pub fn promise<T, E>() -> (Promise<T, E>, OpFuture<T, E>) {
    let (tx, rx) = bounded(1);
    (Promise { tx }, OpFuture { rx })
}

/// Producer half. Consumed on fulfilment, so a result is delivered at most once.
pub struct Promise<T, E> {
    tx: Sender<Result<T, E>>,
}

impl<T, E> Promise<T, E> {
    pub fn fulfill(self, result: Result<T, E>) {
        // the waiter may have given up; that is not an error for the producer
        let _ = self.tx.send(result);
    }

    pub fn succeed(self, value: T) {
        self.fulfill(Ok(value));
    }

    pub fn fail(self, err: E) {
        self.fulfill(Err(err));
    }
}

/// Consumer half: wait, wait with a deadline, or poll.
pub struct OpFuture<T, E> {
    rx: Receiver<Result<T, E>>,
}

impl<T, E> OpFuture<T, E> {
    /// A future that is already complete.
    pub fn ready(result: Result<T, E>) -> Self {
        let (p, f) = promise();
        p.fulfill(result);
        f
    }

    /// Blocks until the result is available.
    pub fn wait(self) -> Result<T, E>
    where
        E: From<Canceled>,
    {
        self.rx.recv().unwrap_or_else(|_| Err(Canceled.into()))
    }

    /// Blocks for at most `timeout`. `None` means the operation is still
    /// pending and the future can be waited on again.
    pub fn wait_timeout(&self, timeout: Duration) -> Option<Result<T, E>>
    where
        E: From<Canceled>,
    {
        match self.rx.recv_timeout(timeout) {
            Ok(result) => Some(result),
            Err(RecvTimeoutError::Timeout) => None,
            Err(RecvTimeoutError::Disconnected) => Some(Err(Canceled.into())),
        }
    }

    /// Non-blocking poll.
    pub fn try_get(&self) -> Option<Result<T, E>>
    where
        E: From<Canceled>,
    {
        match self.rx.try_recv() {
            Ok(result) => Some(result),
            Err(TryRecvError::Empty) => None,
            Err(TryRecvError::Disconnected) => Some(Err(Canceled.into())),
        }
    }
}

impl<T, E> std::fmt::Debug for OpFuture<T, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("OpFuture")
            .field("ready", &!self.rx.is_empty())
            .finish()
    }
}
