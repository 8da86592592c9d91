//! One-to-many broadcast with per-subscriber backpressure.

use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::queue::{Queue, QueueClosed};

/// The error returned by operations on a closed hub.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HubClosed;

impl std::fmt::Display for HubClosed {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "hub closed")
    }
}

impl std::error::Error for HubClosed {}

type SubscriberList<T> = Arc<Mutex<Vec<(u64, Arc<Queue<T>>)>>>;

/// One subscriber's view of a [`Hub`].
pub struct Subscription<T> {
    id: u64,
    queue: Arc<Queue<T>>,
    subscribers: SubscriberList<T>,
}

impl<T: Send> Subscription<T> {
    /// Receive the next published item; drains buffered items after the
    /// hub closes, then fails with [`QueueClosed`].
    pub async fn receive(&self) -> Result<T, QueueClosed> {
        self.queue.receive().await
    }

    /// The number of items waiting in this subscription.
    pub fn len(&self) -> usize {
        self.queue.len()
    }

    /// True when nothing is waiting.
    pub fn is_empty(&self) -> bool {
        self.queue.is_empty()
    }

    /// Stop receiving: deregisters from the hub and closes the backing
    /// queue.
    pub fn close(&self) {
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .retain(|(id, _)| *id != self.id);
        self.queue.close();
    }
}

impl<T> std::fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Subscription").field("id", &self.id).finish()
    }
}

/// A broadcast hub: every published item reaches every live
/// subscription, with backpressure applied per subscriber.
///
/// # Examples
///
/// ```
/// use millrace::Hub;
///
/// # tokio_test::block_on(async {
/// let hub = Hub::new();
/// let first = hub.subscribe(8).unwrap();
/// let second = hub.subscribe(8).unwrap();
///
/// hub.publish(1).await.unwrap();
/// assert_eq!(first.receive().await, Ok(1));
/// assert_eq!(second.receive().await, Ok(1));
/// # });
/// ```
pub struct Hub<T> {
    subscribers: SubscriberList<T>,
    closed: AtomicBool,
    next_id: AtomicU64,
}

impl<T: Send + Clone> Hub<T> {
    /// An open hub with no subscribers.
    pub fn new() -> Self {
        Hub {
            subscribers: Arc::new(Mutex::new(Vec::new())),
            closed: AtomicBool::new(false),
            next_id: AtomicU64::new(1),
        }
    }

    /// Register a subscription buffering up to `capacity` items
    /// (`0` means unbounded).
    pub fn subscribe(&self, capacity: usize) -> Result<Subscription<T>, HubClosed> {
        if self.closed.load(Ordering::Acquire) {
            return Err(HubClosed);
        }
        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let queue = Arc::new(Queue::new(capacity));
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push((id, queue.clone()));
        Ok(Subscription {
            id,
            queue,
            subscribers: self.subscribers.clone(),
        })
    }

    /// Deliver an item to every live subscription, awaiting each
    /// subscriber's queue in turn. Slow subscribers backpressure the
    /// publisher.
    pub async fn publish(&self, value: T) -> Result<(), HubClosed> {
        if self.closed.load(Ordering::Acquire) {
            return Err(HubClosed);
        }
        let subscriptions: Vec<Arc<Queue<T>>> = self
            .subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .iter()
            .map(|(_, queue)| queue.clone())
            .collect();
        for queue in subscriptions {
            // a subscription racing its own close just misses the item
            let _ = queue.send(value.clone()).await;
        }
        Ok(())
    }

    /// Close the hub and every subscription. Buffered items remain
    /// drainable by their subscribers.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        let subscriptions = std::mem::take(
            &mut *self.subscribers.lock().unwrap_or_else(|e| e.into_inner()),
        );
        for (_, queue) in subscriptions {
            queue.close();
        }
    }

    /// The number of live subscriptions.
    pub fn subscriber_count(&self) -> usize {
        self.subscribers
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .len()
    }
}

impl<T: Send + Clone> Default for Hub<T> {
    fn default() -> Self {
        Hub::new()
    }
}

impl<T> std::fmt::Debug for Hub<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Hub")
            .field("closed", &self.closed.load(Ordering::Relaxed))
            .finish()
    }
}
