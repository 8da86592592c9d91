//! Fiber-local state with snapshot inheritance.
//!
//! A [`FiberLocal`] is a typed slot whose value is carried per fiber.
//! Children snapshot the parent's locals at fork time; writes made after
//! the fork are invisible across the boundary in either direction.

use std::any::Any;
use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex};

use crate::context::Context;
use crate::effect::Effect;
use crate::exit::Exit;

static NEXT_LOCAL_ID: AtomicU64 = AtomicU64::new(1);

type LocalValue = Arc<dyn Any + Send + Sync>;

/// The per-fiber map of local values. Shared within a fiber, snapshotted
/// at fork.
#[derive(Clone)]
pub(crate) struct FiberLocals {
    map: Arc<Mutex<HashMap<u64, LocalValue>>>,
}

impl FiberLocals {
    pub(crate) fn new() -> Self {
        FiberLocals {
            map: Arc::new(Mutex::new(HashMap::new())),
        }
    }

    /// A fresh map holding copies of the current entries.
    pub(crate) fn snapshot(&self) -> Self {
        let entries = self.map.lock().unwrap_or_else(|e| e.into_inner()).clone();
        FiberLocals {
            map: Arc::new(Mutex::new(entries)),
        }
    }

    pub(crate) fn get(&self, id: u64) -> Option<LocalValue> {
        self.map
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .get(&id)
            .cloned()
    }

    pub(crate) fn set(&self, id: u64, value: LocalValue) -> Option<LocalValue> {
        self.map
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .insert(id, value)
    }

    pub(crate) fn remove(&self, id: u64) -> Option<LocalValue> {
        self.map
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&id)
    }

    /// Copy every entry of `other` into this map, overwriting conflicts.
    pub(crate) fn absorb(&self, other: &FiberLocals) {
        let entries = other.map.lock().unwrap_or_else(|e| e.into_inner()).clone();
        let mut map = self.map.lock().unwrap_or_else(|e| e.into_inner());
        for (id, value) in entries {
            map.insert(id, value);
        }
    }
}

/// A typed per-fiber value with parent-to-child snapshot inheritance.
///
/// # Examples
///
/// ```
/// use millrace::{Context, FiberLocal};
///
/// # tokio_test::block_on(async {
/// let ctx = Context::new();
/// let label = FiberLocal::new("root".to_string());
///
/// label.set::<String>("request-7".to_string()).run(&ctx).await;
/// let seen = label.get::<String>().run(&ctx).await;
/// assert_eq!(seen.into_value(), Some("request-7".to_string()));
/// # });
/// ```
pub struct FiberLocal<T> {
    id: u64,
    initial: T,
}

impl<T> FiberLocal<T>
where
    T: Clone + Send + Sync + 'static,
{
    /// A new slot with the given default value.
    pub fn new(initial: T) -> Self {
        FiberLocal {
            id: NEXT_LOCAL_ID.fetch_add(1, Ordering::Relaxed),
            initial,
        }
    }

    /// Read the current fiber's value without going through an effect.
    pub fn get_value(&self, ctx: &Context) -> T {
        ctx.locals()
            .get(self.id)
            .and_then(|value| value.downcast::<T>().ok())
            .map(|value| (*value).clone())
            .unwrap_or_else(|| self.initial.clone())
    }

    /// Write the current fiber's value without going through an effect.
    pub fn set_value(&self, ctx: &Context, value: T) {
        ctx.locals().set(self.id, Arc::new(value));
    }

    /// An effect reading the current fiber's value.
    pub fn get<E: Send + 'static>(&self) -> Effect<T, E> {
        let id = self.id;
        let initial = self.initial.clone();
        Effect::from_run(move |ctx| {
            Box::pin(async move {
                let value = ctx
                    .locals()
                    .get(id)
                    .and_then(|value| value.downcast::<T>().ok())
                    .map(|value| (*value).clone())
                    .unwrap_or(initial);
                Exit::Success(value)
            })
        })
    }

    /// An effect writing the current fiber's value.
    pub fn set<E: Send + 'static>(&self, value: T) -> Effect<(), E> {
        let id = self.id;
        Effect::from_run(move |ctx| {
            Box::pin(async move {
                ctx.locals().set(id, Arc::new(value));
                Exit::Success(())
            })
        })
    }

    /// Run `eff` with this slot set to `value`, restoring the previous
    /// value afterward regardless of outcome.
    pub fn locally<A, E>(&self, value: T, eff: Effect<A, E>) -> Effect<A, E>
    where
        A: Send + 'static,
        E: Send + 'static,
    {
        let id = self.id;
        Effect::from_run(move |ctx| {
            Box::pin(async move {
                let previous = ctx.locals().set(id, Arc::new(value));
                let exit = eff.run_caught(ctx.clone()).await;
                match previous {
                    Some(prior) => {
                        ctx.locals().set(id, prior);
                    }
                    None => {
                        ctx.locals().remove(id);
                    }
                }
                exit
            })
        })
    }
}

impl<T: std::fmt::Debug> std::fmt::Debug for FiberLocal<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FiberLocal")
            .field("id", &self.id)
            .field("initial", &self.initial)
            .finish()
    }
}
