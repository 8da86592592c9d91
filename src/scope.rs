//! Scoped resource lifecycles: an ordered registry of release actions.
//!
//! A [`Scope`] collects finalizers as resources are acquired and releases
//! them in reverse insertion order when closed. Every finalizer is
//! attempted even when earlier ones fail; failures are captured as defects
//! and aggregated into the close result.

use std::convert::Infallible;
use std::future::Future;
use std::sync::Mutex;

use futures::FutureExt;

use crate::cause::{Cause, Defect};
use crate::effect::BoxFuture;
use crate::exit::Exit;

type Finalizer = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

struct ScopeState {
    finalizers: Vec<Finalizer>,
    closed: bool,
}

/// A LIFO registry of release actions.
///
/// # Examples
///
/// ```
/// use std::sync::{Arc, Mutex};
/// use millrace::Scope;
///
/// # tokio_test::block_on(async {
/// let log = Arc::new(Mutex::new(Vec::new()));
/// let scope = Scope::new();
///
/// for name in ["A", "B", "C"] {
///     let log = log.clone();
///     scope.add_finalizer(move || async move {
///         log.lock().unwrap().push(name);
///     }).await;
/// }
///
/// scope.close().await;
/// assert_eq!(*log.lock().unwrap(), vec!["C", "B", "A"]);
/// # });
/// ```
pub struct Scope {
    state: Mutex<ScopeState>,
}

impl Scope {
    /// An empty, open scope.
    pub fn new() -> Self {
        Scope {
            state: Mutex::new(ScopeState {
                finalizers: Vec::new(),
                closed: false,
            }),
        }
    }

    /// Register a release action. If the scope is already closed, the
    /// action runs immediately.
    pub async fn add_finalizer<F, Fut>(&self, finalizer: F)
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = ()> + Send + 'static,
    {
        let boxed: Finalizer = Box::new(move || -> BoxFuture<'static, ()> {
            Box::pin(finalizer())
        });
        self.add_finalizer_boxed(boxed).await;
    }

    pub(crate) async fn add_finalizer_boxed(&self, finalizer: Finalizer) {
        let leftover = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if state.closed {
                Some(finalizer)
            } else {
                state.finalizers.push(finalizer);
                None
            }
        };
        if let Some(finalizer) = leftover {
            if let Err(payload) = std::panic::AssertUnwindSafe(finalizer())
                .catch_unwind()
                .await
            {
                let defect = Defect::from_panic(payload);
                tracing::warn!("finalizer after scope close failed: {defect}");
            }
        }
    }

    /// True once [`close`](Scope::close) has run.
    pub fn is_closed(&self) -> bool {
        self.state
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .closed
    }

    /// Release every registered finalizer in reverse insertion order.
    ///
    /// Each finalizer is attempted regardless of earlier failures; panics
    /// become defects and are combined with [`Cause::then`] in release
    /// order. Closing an already-closed scope succeeds without effect.
    pub async fn close(&self) -> Exit<(), Infallible> {
        let finalizers = {
            let mut state = self.state.lock().unwrap_or_else(|e| e.into_inner());
            if state.closed {
                return Exit::Success(());
            }
            state.closed = true;
            std::mem::take(&mut state.finalizers)
        };

        let mut combined: Option<Cause<Infallible>> = None;
        for finalizer in finalizers.into_iter().rev() {
            if let Err(payload) = std::panic::AssertUnwindSafe(finalizer())
                .catch_unwind()
                .await
            {
                let cause = Cause::Die(Defect::from_panic(payload));
                combined = Some(match combined {
                    None => cause,
                    Some(earlier) => Cause::then(earlier, cause),
                });
            }
        }

        match combined {
            None => Exit::Success(()),
            Some(cause) => Exit::Failure(cause),
        }
    }
}

impl Default for Scope {
    fn default() -> Self {
        Scope::new()
    }
}

impl std::fmt::Debug for Scope {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.state.lock().unwrap_or_else(|e| e.into_inner());
        f.debug_struct("Scope")
            .field("finalizers", &state.finalizers.len())
            .field("closed", &state.closed)
            .finish()
    }
}
