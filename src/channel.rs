//! A bounded MPMC channel with explicit close.
//!
//! Semantics, in order of precedence:
//!
//! - senders suspend while the buffer is full and the channel is open;
//! - `close` is idempotent, wakes blocked *senders* with
//!   [`ChannelClosed`], and leaves buffered items receivable;
//! - closing does **not** wake blocked receivers — `receive` fails with
//!   [`ChannelClosed`] only when it observes closed-and-empty on entry.
//!   Protocols that need receiver shutdown arrange termination
//!   sentinels, exact counts, or interruption (the pipeline does the
//!   latter internally).
//!
//! Between any one sender and one receiver, items arrive in send order.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;

use tokio::sync::{Notify, Semaphore, TryAcquireError};

/// The error returned by operations on a closed channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ChannelClosed;

impl std::fmt::Display for ChannelClosed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "channel closed")
    }
}

impl std::error::Error for ChannelClosed {}

/// A bounded multi-producer multi-consumer channel.
///
/// # Examples
///
/// ```
/// use millrace::Channel;
///
/// # tokio_test::block_on(async {
/// let channel = Channel::new(2);
/// channel.send(1).await.unwrap();
/// channel.send(2).await.unwrap();
///
/// assert_eq!(channel.receive().await, Ok(1));
/// assert_eq!(channel.receive().await, Ok(2));
///
/// channel.close();
/// assert!(channel.send(3).await.is_err());
/// # });
/// ```
pub struct Channel<T> {
    queue: Mutex<VecDeque<T>>,
    space: Semaphore,
    items: Semaphore,
    closed: AtomicBool,
    closed_notify: Notify,
    capacity: usize,
}

impl<T: Send> Channel<T> {
    /// A channel buffering up to `capacity` items; `0` means unbounded.
    pub fn new(capacity: usize) -> Self {
        let permits = if capacity == 0 {
            Semaphore::MAX_PERMITS
        } else {
            capacity
        };
        Channel {
            queue: Mutex::new(VecDeque::new()),
            space: Semaphore::new(permits),
            items: Semaphore::new(0),
            closed: AtomicBool::new(false),
            closed_notify: Notify::new(),
            capacity,
        }
    }

    /// A channel with no capacity bound.
    pub fn unbounded() -> Self {
        Channel::new(0)
    }

    /// The configured capacity; `0` means unbounded.
    pub fn capacity(&self) -> usize {
        self.capacity
    }

    /// Send an item, suspending while the buffer is full. Fails once
    /// the channel is closed, including for senders already blocked.
    pub async fn send(&self, value: T) -> Result<(), ChannelClosed> {
        let permit = self.space.acquire().await.map_err(|_| ChannelClosed)?;
        if self.closed.load(Ordering::Acquire) {
            return Err(ChannelClosed);
        }
        self.queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push_back(value);
        permit.forget();
        self.items.add_permits(1);
        Ok(())
    }

    /// Receive an item, suspending while the buffer is empty. Fails
    /// only when the channel is observed closed-and-empty on entry.
    pub async fn receive(&self) -> Result<T, ChannelClosed> {
        let permit = match self.items.try_acquire() {
            Ok(permit) => permit,
            Err(TryAcquireError::Closed) => return Err(ChannelClosed),
            Err(TryAcquireError::NoPermits) => {
                if self.is_closed() && self.is_empty() {
                    return Err(ChannelClosed);
                }
                match self.items.acquire().await {
                    Ok(permit) => permit,
                    Err(_) => return Err(ChannelClosed),
                }
            }
        };
        permit.forget();
        let value = self
            .queue
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front();
        match value {
            Some(value) => {
                self.space.add_permits(1);
                Ok(value)
            }
            None => Err(ChannelClosed),
        }
    }

    /// Non-suspending send. Returns the value back when the buffer is
    /// full or the channel is closed.
    pub fn try_send(&self, value: T) -> Result<(), T> {
        match self.space.try_acquire() {
            Ok(permit) => {
                if self.closed.load(Ordering::Acquire) {
                    return Err(value);
                }
                self.queue
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .push_back(value);
                permit.forget();
                self.items.add_permits(1);
                Ok(())
            }
            Err(_) => Err(value),
        }
    }

    /// Non-suspending receive.
    pub fn try_receive(&self) -> Option<T> {
        match self.items.try_acquire() {
            Ok(permit) => {
                permit.forget();
                let value = self
                    .queue
                    .lock()
                    .unwrap_or_else(|e| e.into_inner())
                    .pop_front();
                if value.is_some() {
                    self.space.add_permits(1);
                }
                value
            }
            Err(_) => None,
        }
    }

    /// Close the channel. Idempotent. Buffered items stay receivable.
    pub fn close(&self) {
        if !self.closed.swap(true, Ordering::AcqRel) {
            self.space.close();
            self.closed_notify.notify_waiters();
        }
    }

    /// True once the channel has been closed.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    /// The number of buffered items.
    pub fn len(&self) -> usize {
        self.queue.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    /// True when nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Wait until the channel is closed. Used by the pipeline's workers
    /// to shut down without changing the public receive contract.
    pub(crate) async fn closed(&self) {
        loop {
            if self.is_closed() {
                return;
            }
            let notified = self.closed_notify.notified();
            if self.is_closed() {
                return;
            }
            notified.await;
        }
    }
}

impl<T> std::fmt::Debug for Channel<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Channel")
            .field("capacity", &self.capacity)
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;
    use std::time::Duration;

    #[tokio::test]
    async fn buffered_items_survive_close() {
        let channel = Channel::new(4);
        channel.send(1).await.unwrap();
        channel.send(2).await.unwrap();
        channel.close();

        assert_eq!(channel.receive().await, Ok(1));
        assert_eq!(channel.receive().await, Ok(2));
        assert_eq!(channel.receive().await, Err(ChannelClosed));
    }

    #[tokio::test]
    async fn close_wakes_blocked_senders() {
        let channel = Arc::new(Channel::new(1));
        channel.send(1).await.unwrap();

        let blocked = channel.clone();
        let sender = tokio::spawn(async move { blocked.send(2).await });
        tokio::time::sleep(Duration::from_millis(20)).await;
        channel.close();

        assert_eq!(sender.await.unwrap(), Err(ChannelClosed));
    }

    #[tokio::test]
    async fn try_variants_do_not_suspend() {
        let channel = Channel::new(1);
        assert!(channel.try_send(1).is_ok());
        assert_eq!(channel.try_send(2), Err(2));
        assert_eq!(channel.try_receive(), Some(1));
        assert_eq!(channel.try_receive(), None);
    }
}
