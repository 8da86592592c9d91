//! The runtime: foreground evaluation, forking, and supervision.

use std::fmt::Debug;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex};

use crate::cause::{Cause, Defect};
use crate::context::Context;
use crate::effect::Effect;
use crate::exit::Exit;
use crate::fiber::{fork_effect, Fiber, FiberHooks, FiberId};
use crate::scope::Scope;

/// A type-erased view of a fiber handed to supervisor hooks.
#[derive(Debug, Clone)]
pub struct FiberInfo {
    /// The fiber's identifier.
    pub id: FiberId,
    /// The name given at fork, if any.
    pub name: Option<String>,
}

/// Lifecycle hooks observed by every fiber forked through a [`Runtime`].
///
/// Hooks run serially. A panicking hook becomes a defect on the
/// runtime's diagnostics channel and never affects the supervised
/// fiber's outcome.
pub trait Supervisor: Send + Sync {
    /// Called synchronously when a fiber is forked.
    fn on_start(&self, _fiber: &FiberInfo) {}

    /// Called when a fiber publishes its exit.
    fn on_end(&self, _fiber: &FiberInfo, _exit: &Exit<(), String>) {}

    /// Called, before `on_end`, when a fiber's exit is a failure.
    fn on_failure(&self, _fiber: &FiberInfo, _cause: &Cause<String>) {}
}

/// Owns a base environment, an optional supervisor, and a diagnostics
/// channel for hook defects.
///
/// # Examples
///
/// ```
/// use millrace::{Context, Effect, Runtime};
///
/// # tokio_test::block_on(async {
/// let runtime = Runtime::new(Context::new());
/// let exit = runtime.run(Effect::<i32, String>::succeed(7)).await;
/// assert_eq!(exit.into_value(), Some(7));
/// # });
/// ```
pub struct Runtime {
    base: Context,
    supervisor: Option<Arc<dyn Supervisor>>,
    hook_lock: Arc<Mutex<()>>,
    diagnostics: Arc<Mutex<Vec<Defect>>>,
}

impl Runtime {
    /// A runtime evaluating against `base`.
    pub fn new(base: Context) -> Self {
        Runtime {
            base,
            supervisor: None,
            hook_lock: Arc::new(Mutex::new(())),
            diagnostics: Arc::new(Mutex::new(Vec::new())),
        }
    }

    /// Attach a supervisor observing every fiber forked from here.
    pub fn with_supervisor(mut self, supervisor: Arc<dyn Supervisor>) -> Self {
        self.supervisor = Some(supervisor);
        self
    }

    /// The runtime's base environment.
    pub fn context(&self) -> &Context {
        &self.base
    }

    /// Evaluate an effect in the foreground and return its exit.
    pub async fn run<A, E>(&self, eff: Effect<A, E>) -> Exit<A, E>
    where
        A: Send + 'static,
        E: Send + 'static,
    {
        eff.run(&self.base).await
    }

    /// Evaluate with `scope` installed as the current scope, closing it
    /// on any completion. Close failures attach to the cause via `Then`.
    pub async fn run_scoped<A, E>(&self, eff: Effect<A, E>, scope: Arc<Scope>) -> Exit<A, E>
    where
        A: Send + 'static,
        E: Send + 'static,
    {
        let exit = eff.run(&self.base.with_scope(scope.clone())).await;
        let close_exit = scope.close().await;
        crate::effect::merge_finalizer_exit(exit, close_exit)
    }

    /// Fork an effect as a background fiber of the base environment.
    pub fn fork<A, E>(&self, eff: Effect<A, E>) -> Fiber<A, E>
    where
        A: Send + 'static,
        E: Send + Debug + 'static,
    {
        self.fork_inner(eff, None)
    }

    /// Fork with a name visible to supervision and debugging.
    pub fn fork_named<A, E>(&self, eff: Effect<A, E>, name: impl Into<String>) -> Fiber<A, E>
    where
        A: Send + 'static,
        E: Send + Debug + 'static,
    {
        self.fork_inner(eff, Some(name.into()))
    }

    fn fork_inner<A, E>(&self, eff: Effect<A, E>, name: Option<String>) -> Fiber<A, E>
    where
        A: Send + 'static,
        E: Send + Debug + 'static,
    {
        let hooks = self.supervisor.as_ref().map(|supervisor| {
            let start_supervisor = supervisor.clone();
            let start_lock = self.hook_lock.clone();
            let start_diagnostics = self.diagnostics.clone();
            let end_supervisor = supervisor.clone();
            let end_lock = self.hook_lock.clone();
            let end_diagnostics = self.diagnostics.clone();
            FiberHooks::<A, E> {
                on_start: Box::new(move |id, name| {
                    let info = FiberInfo {
                        id,
                        name: name.map(str::to_string),
                    };
                    invoke_hook(&start_lock, &start_diagnostics, || {
                        start_supervisor.on_start(&info)
                    });
                }),
                on_exit: Box::new(move |id, name, exit| {
                    let info = FiberInfo {
                        id,
                        name: name.map(str::to_string),
                    };
                    let erased: Exit<(), String> = match exit {
                        Exit::Success(_) => Exit::Success(()),
                        Exit::Failure(cause) => Exit::Failure(cause.erased()),
                    };
                    if let Exit::Failure(cause) = &erased {
                        invoke_hook(&end_lock, &end_diagnostics, || {
                            end_supervisor.on_failure(&info, cause)
                        });
                    }
                    invoke_hook(&end_lock, &end_diagnostics, || {
                        end_supervisor.on_end(&info, &erased)
                    });
                }),
            }
        });
        fork_effect(&self.base, eff, name, hooks)
    }

    /// Defects raised by supervisor hooks, oldest first.
    pub fn diagnostics(&self) -> Vec<Defect> {
        self.diagnostics
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clone()
    }
}

impl Default for Runtime {
    fn default() -> Self {
        Runtime::new(Context::new())
    }
}

impl std::fmt::Debug for Runtime {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Runtime")
            .field("supervised", &self.supervisor.is_some())
            .finish()
    }
}

fn invoke_hook(
    lock: &Arc<Mutex<()>>,
    diagnostics: &Arc<Mutex<Vec<Defect>>>,
    hook: impl FnOnce(),
) {
    let guard = lock.lock().unwrap_or_else(|e| e.into_inner());
    let outcome = std::panic::catch_unwind(AssertUnwindSafe(hook));
    drop(guard);
    if let Err(payload) = outcome {
        diagnostics
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(Defect::from_panic(payload));
    }
}
