//! A close-aware MPMC queue.
//!
//! Unlike [`Channel`](crate::Channel), closing a queue wakes blocked
//! receivers: they drain whatever is buffered and then fail with
//! [`QueueClosed`]. This is the primitive to reach for when consumers
//! should learn about shutdown without sentinels.

use std::collections::VecDeque;
use std::sync::Mutex;

use tokio::sync::Notify;

/// The error returned by operations on a closed, drained queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct QueueClosed;

impl std::fmt::Display for QueueClosed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "queue closed")
    }
}

impl std::error::Error for QueueClosed {}

struct QueueState<T> {
    buffer: VecDeque<T>,
    closed: bool,
}

/// A bounded MPMC queue whose close wakes blocked receivers.
///
/// # Examples
///
/// ```
/// use millrace::{Queue, QueueClosed};
///
/// # tokio_test::block_on(async {
/// let queue = Queue::new(8);
/// queue.send(1).await.unwrap();
/// queue.close();
///
/// assert_eq!(queue.receive().await, Ok(1));
/// assert_eq!(queue.receive().await, Err(QueueClosed));
/// # });
/// ```
pub struct Queue<T> {
    state: Mutex<QueueState<T>>,
    capacity: usize,
    senders: Notify,
    receivers: Notify,
}

impl<T: Send> Queue<T> {
    /// A queue buffering up to `capacity` items; `0` means unbounded.
    pub fn new(capacity: usize) -> Self {
        Queue {
            state: Mutex::new(QueueState {
                buffer: VecDeque::new(),
                closed: false,
            }),
            capacity,
            senders: Notify::new(),
            receivers: Notify::new(),
        }
    }

    /// A queue with no capacity bound.
    pub fn unbounded() -> Self {
        Queue::new(0)
    }

    /// Send an item, suspending while the buffer is full.
    pub async fn send(&self, value: T) -> Result<(), QueueClosed> {
        let mut slot = Some(value);
        loop {
            let notified = self.senders.notified();
            {
                let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                if state.closed {
                    return Err(QueueClosed);
                }
                if self.capacity == 0 || state.buffer.len() < self.capacity {
                    if let Some(value) = slot.take() {
                        state.buffer.push_back(value);
                    }
                    self.receivers.notify_one();
                    return Ok(());
                }
            }
            notified.await;
        }
    }

    /// Receive an item, draining buffered items even after close; fails
    /// with [`QueueClosed`] once closed and empty.
    pub async fn receive(&self) -> Result<T, QueueClosed> {
        loop {
            let notified = self.receivers.notified();
            {
                let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
                if let Some(value) = state.buffer.pop_front() {
                    self.senders.notify_one();
                    return Ok(value);
                }
                if state.closed {
                    return Err(QueueClosed);
                }
            }
            notified.await;
        }
    }

    /// Non-suspending receive.
    pub fn try_receive(&self) -> Option<T> {
        let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        let value = state.buffer.pop_front();
        if value.is_some() {
            self.senders.notify_one();
        }
        value
    }

    /// Close the queue, waking every blocked sender and receiver.
    pub fn close(&self) {
        {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            state.closed = true;
        }
        self.senders.notify_waiters();
        self.receivers.notify_waiters();
    }

    /// True once the queue has been closed.
    pub fn is_closed(&self) -> bool {
        self.state.lock().unwrap_or_else(|e| e.into_inner()).closed
    }

    /// The number of buffered items.
    pub fn len(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .buffer
            .len()
    }

    /// True when nothing is buffered.
    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl<T> std::fmt::Debug for Queue<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        f.debug_struct("Queue")
            .field("capacity", &self.capacity)
            .field("buffered", &state.buffer.len())
            .field("closed", &state.closed)
            .finish()
    }
}
