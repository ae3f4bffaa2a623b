use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, mpsc};

/// Bounded single-consumer queue between a background loop and application code.
pub struct Mailbox<T> {
    sender: mpsc::Sender<T>,
    receiver: Mutex<mpsc::Receiver<T>>,
    overflow: AtomicU64,
}

impl<T: Send> Mailbox<T> {
    pub fn new(capacity: usize) -> Self {
        let (sender, receiver) = mpsc::channel(capacity.max(1));
        Self {
            sender,
            receiver: Mutex::new(receiver),
            overflow: AtomicU64::new(0),
        }
    }

    /// Enqueues without waiting. Returns `false` and counts an overflow when the
    /// mailbox is full.
    pub fn offer(&self, item: T) -> bool {
        match self.sender.try_send(item) {
            Ok(()) => true,
            Err(mpsc::error::TrySendError::Full(_)) => {
                let dropped = self.overflow.fetch_add(1, Ordering::Relaxed) + 1;
                tracing::trace!("Mailbox full, {} event(s) overflowed so far", dropped);
                false
            }
            Err(mpsc::error::TrySendError::Closed(_)) => false,
        }
    }

    /// Waits until an item is available.
    pub async fn take(&self) -> Option<T> {
        self.receiver.lock().await.recv().await
    }

    /// Takes an item only if one is ready and no one else is waiting.
    pub fn try_take(&self) -> Option<T> {
        self.receiver.try_lock().ok()?.try_recv().ok()
    }

    /// Waits at most `timeout` for an item.
    pub async fn poll(&self, timeout: Duration) -> Option<T> {
        tokio::time::timeout(timeout, self.take())
            .await
            .ok()
            .flatten()
    }

    pub fn overflow_count(&self) -> u64 {
        self.overflow.load(Ordering::Relaxed)
    }

    pub fn capacity(&self) -> usize {
        self.sender.max_capacity()
    }

    pub fn len(&self) -> usize {
        self.sender.max_capacity() - self.sender.capacity()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
