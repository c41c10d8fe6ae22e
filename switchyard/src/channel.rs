//! Best-effort queues.
//!
//! Every queue is a bounded tokio mpsc channel. Producers never wait: a full
//! queue drops the newest item. Consumers either poll (`poll`) or wait at most
//! one bounded interval.

use std::time::Duration;

use tokio::sync::mpsc::{self, Receiver, Sender, error::TryRecvError, error::TrySendError};

/// Default queue capacity.
pub const DEFAULT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum QueueError {
    #[error("queue full")]
    Full,
    #[error("queue closed")]
    Closed,
}

/// Create a bounded queue. A capacity of zero is raised to one.
pub fn queue<T>(capacity: usize) -> (Sender<T>, Receiver<T>) {
    mpsc::channel(capacity.max(1))
}

/// Non-blocking enqueue.
pub trait Offer<T> {
    fn offer(&self, item: T) -> Result<(), QueueError>;
}

impl<T> Offer<T> for Sender<T> {
    fn offer(&self, item: T) -> Result<(), QueueError> {
        self.try_send(item).map_err(|e| match e {
            TrySendError::Full(_) => QueueError::Full,
            TrySendError::Closed(_) => QueueError::Closed,
        })
    }
}

/// Non-blocking and bounded dequeue.
///
/// `Ok(None)` means nothing was available; `Err(QueueError::Closed)` means no
/// producer is left and nothing will ever arrive.
pub trait Poll<T> {
    fn poll(&mut self) -> Result<Option<T>, QueueError>;

    fn recv_within(
        &mut self,
        timeout: Duration,
    ) -> impl Future<Output = Result<Option<T>, QueueError>> + Send;
}

impl<T: Send> Poll<T> for Receiver<T> {
    fn poll(&mut self) -> Result<Option<T>, QueueError> {
        match self.try_recv() {
            Ok(item) => Ok(Some(item)),
            Err(TryRecvError::Empty) => Ok(None),
            Err(TryRecvError::Disconnected) => Err(QueueError::Closed),
        }
    }

    async fn recv_within(&mut self, timeout: Duration) -> Result<Option<T>, QueueError> {
        match tokio::time::timeout(timeout, self.recv()).await {
            Ok(Some(item)) => Ok(Some(item)),
            Ok(None) => Err(QueueError::Closed),
            Err(_) => Ok(None),
        }
    }
}
