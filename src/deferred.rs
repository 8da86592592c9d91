//! A single-assignment cell: set once, awaited by many.

use std::sync::Mutex;

use tokio::sync::Notify;

/// A one-shot cell. Readers suspend until a value is set; every reader
/// receives a clone. Setting twice is refused.
///
/// # Examples
///
/// ```
/// use std::sync::Arc;
/// use millrace::Deferred;
///
/// # tokio_test::block_on(async {
/// let cell = Arc::new(Deferred::new());
/// let reader = cell.clone();
/// let waiter = tokio::spawn(async move { reader.await_().await });
///
/// assert!(cell.try_succeed(5));
/// assert!(!cell.try_succeed(6));
/// assert_eq!(waiter.await.unwrap(), 5);
/// # });
/// ```
pub struct Deferred<T> {
    value: Mutex<Option<T>>,
    notify: Notify,
}

impl<T> Deferred<T> {
    /// An empty cell.
    pub fn new() -> Self {
        Deferred {
            value: Mutex::new(None),
            notify: Notify::new(),
        }
    }

    /// Set the value, waking all waiters. Returns false if the cell was
    /// already set; a second write is a protocol violation the caller
    /// surfaces as a defect.
    pub fn try_succeed(&self, value: T) -> bool {
        {
            let mut slot = self.value.lock().unwrap_or_else(|e| e.into_inner());
            if slot.is_some() {
                return false;
            }
            *slot = Some(value);
        }
        self.notify.notify_waiters();
        true
    }

    /// True once a value has been set.
    pub fn is_done(&self) -> bool {
        self.value
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .is_some()
    }

    /// The value, if already set.
    pub fn try_value(&self) -> Option<T>
    where
        T: Clone,
    {
        self.value
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }

    /// Suspend until the value is set.
    pub async fn await_(&self) -> T
    where
        T: Clone,
    {
        loop {
            let notified = self.notify.notified();
            {
                let slot = self.value.lock().unwrap_or_else(|e| e.into_inner());
                if let Some(value) = &*slot {
                    return value.clone();
                }
            }
            notified.await;
        }
    }
}

impl<T> Default for Deferred<T> {
    fn default() -> Self {
        Deferred::new()
    }
}

impl<T> std::fmt::Debug for Deferred<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Deferred")
            .field("done", &self.is_done())
            .finish()
    }
}
