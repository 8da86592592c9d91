//! A shared mutable cell with atomic update operations.

use std::sync::Mutex;

/// A mutable cell safe to share across fibers. Every operation runs
/// under the cell's lock, so updates are atomic with respect to each
/// other.
///
/// # Examples
///
/// ```
/// use millrace::Ref;
///
/// let counter = Ref::new(1);
/// counter.update(|n| *n += 3);
/// assert_eq!(counter.get(), 4);
///
/// let doubled = counter.modify(|n| {
///     let out = *n * 10;
///     *n -= 1;
///     out
/// });
/// assert_eq!(doubled, 40);
/// assert_eq!(counter.get(), 3);
/// ```
pub struct Ref<T> {
    value: Mutex<T>,
}

impl<T: Send> Ref<T> {
    /// A cell holding `initial`.
    pub fn new(initial: T) -> Self {
        Ref {
            value: Mutex::new(initial),
        }
    }

    /// A copy of the current value.
    pub fn get(&self) -> T
    where
        T: Clone,
    {
        self.value.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }

    /// Replace the value.
    pub fn set(&self, value: T) {
        *self.value.lock().unwrap_or_else(|e| e.into_inner()) = value;
    }

    /// Mutate the value atomically.
    pub fn update(&self, f: impl FnOnce(&mut T)) {
        let mut guard = self.value.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut guard);
    }

    /// Mutate the value atomically and return a derived result.
    pub fn modify<R>(&self, f: impl FnOnce(&mut T) -> R) -> R {
        let mut guard = self.value.lock().unwrap_or_else(|e| e.into_inner());
        f(&mut guard)
    }

    /// Replace the value only if it currently equals `expected`.
    pub fn compare_and_set(&self, expected: &T, value: T) -> bool
    where
        T: PartialEq,
    {
        let mut guard = self.value.lock().unwrap_or_else(|e| e.into_inner());
        if *guard == *expected {
            *guard = value;
            true
        } else {
            false
        }
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Ref<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let guard = self.value.lock().unwrap_or_else(|e| e.into_inner());
        f.debug_struct("Ref").field("value", &*guard).finish()
    }
}
