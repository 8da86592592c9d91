//! Fibers: forked units of work with identity, join, and interruption.
//!
//! Interruption is cooperative. Each fiber carries an interrupt token;
//! designated suspension points (external futures, sleeps, channel
//! operations, fiber awaits) race the token and surface an interrupt
//! cause when it fires. A fiber's task is never aborted, so finalizers
//! registered along the way always run to completion.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicU8, Ordering};
use std::sync::Arc;

use tokio::sync::Notify;
use tokio::task::JoinHandle;

use crate::cause::{Cause, Defect};
use crate::context::Context;
use crate::deferred::Deferred;
use crate::effect::Effect;
use crate::exit::Exit;
use crate::fiber_local::FiberLocals;

static NEXT_FIBER_ID: AtomicU64 = AtomicU64::new(1);

/// A process-wide monotonic fiber identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct FiberId(u64);

impl FiberId {
    pub(crate) fn next() -> FiberId {
        FiberId(NEXT_FIBER_ID.fetch_add(1, Ordering::Relaxed))
    }
}

impl std::fmt::Display for FiberId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "#{}", self.0)
    }
}

struct TokenInner {
    requested: AtomicBool,
    notify: Notify,
}

/// The cooperative cancellation signal threaded through evaluation.
///
/// A token with no inner state never fires; it is what uninterruptible
/// regions install.
#[derive(Clone)]
pub(crate) struct InterruptToken {
    inner: Option<Arc<TokenInner>>,
    owner: Option<FiberId>,
}

impl InterruptToken {
    pub(crate) fn new(owner: Option<FiberId>) -> Self {
        InterruptToken {
            inner: Some(Arc::new(TokenInner {
                requested: AtomicBool::new(false),
                notify: Notify::new(),
            })),
            owner,
        }
    }

    /// A token that can never fire.
    pub(crate) fn never() -> Self {
        InterruptToken {
            inner: None,
            owner: None,
        }
    }

    pub(crate) fn request(&self) {
        if let Some(inner) = &self.inner {
            inner.requested.store(true, Ordering::SeqCst);
            inner.notify.notify_waiters();
        }
    }

    pub(crate) fn is_requested(&self) -> bool {
        match &self.inner {
            Some(inner) => inner.requested.load(Ordering::SeqCst),
            None => false,
        }
    }

    /// Suspend until the token fires. Never returns for masked tokens.
    pub(crate) async fn cancelled(&self) {
        match &self.inner {
            None => std::future::pending::<()>().await,
            Some(inner) => loop {
                if inner.requested.load(Ordering::SeqCst) {
                    return;
                }
                let notified = inner.notify.notified();
                if inner.requested.load(Ordering::SeqCst) {
                    return;
                }
                notified.await;
            },
        }
    }

    pub(crate) fn interrupt_cause<E>(&self) -> Cause<E> {
        Cause::Interrupt(self.owner)
    }
}

const STATUS_RUNNING: u8 = 0;
const STATUS_DONE: u8 = 1;
const STATUS_INTERRUPTING: u8 = 2;
const STATUS_INTERRUPTED: u8 = 3;

/// The lifecycle state of a fiber.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FiberStatus {
    /// Forked and not yet finished.
    Running,
    /// Finished with a non-interrupt exit.
    Done,
    /// An interrupt has been requested but the fiber has not yet ceased.
    Interrupting,
    /// The fiber ceased due to interruption.
    Interrupted,
}

/// A forked effect with identity, status, and a joinable result.
pub struct Fiber<A, E> {
    id: FiberId,
    name: Option<String>,
    token: InterruptToken,
    status: Arc<AtomicU8>,
    result: Arc<Deferred<Exit<A, E>>>,
    locals: FiberLocals,
}

impl<A, E> Fiber<A, E>
where
    A: Send + 'static,
    E: Send + 'static,
{
    /// This fiber's identifier.
    pub fn id(&self) -> FiberId {
        self.id
    }

    /// The name given at fork, if any.
    pub fn name(&self) -> Option<&str> {
        self.name.as_deref()
    }

    /// The fiber's current lifecycle state.
    pub fn status(&self) -> FiberStatus {
        match self.status.load(Ordering::SeqCst) {
            STATUS_DONE => FiberStatus::Done,
            STATUS_INTERRUPTING => FiberStatus::Interrupting,
            STATUS_INTERRUPTED => FiberStatus::Interrupted,
            _ => FiberStatus::Running,
        }
    }

    /// Suspend until the fiber finishes and return its exit.
    pub async fn await_(&self) -> Exit<A, E>
    where
        A: Clone,
        E: Clone,
    {
        self.result.await_().await
    }

    /// Suspend until the fiber finishes; succeed with its value or
    /// surface its cause.
    pub async fn join(&self) -> Result<A, Cause<E>>
    where
        A: Clone,
        E: Clone,
    {
        self.await_().await.into_result()
    }

    /// Request cancellation and wait for the fiber to actually cease.
    /// Idempotent: repeated calls return the same exit.
    pub async fn interrupt(&self) -> Exit<A, E>
    where
        A: Clone,
        E: Clone,
    {
        let _ = self.status.compare_exchange(
            STATUS_RUNNING,
            STATUS_INTERRUPTING,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        self.token.request();
        self.await_().await
    }

    /// Request cancellation without waiting.
    pub(crate) fn request_interrupt(&self) {
        let _ = self.status.compare_exchange(
            STATUS_RUNNING,
            STATUS_INTERRUPTING,
            Ordering::SeqCst,
            Ordering::SeqCst,
        );
        self.token.request();
    }

    /// Copy this fiber's local values into another context's map.
    pub fn inherit_locals(&self, into: &Context) {
        into.locals().absorb(&self.locals);
    }
}

impl<A, E> std::fmt::Debug for Fiber<A, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Fiber")
            .field("id", &self.id)
            .field("name", &self.name)
            .finish()
    }
}

/// Pre-spawn and post-exit callbacks used by runtime supervision.
pub(crate) struct FiberHooks<A, E> {
    pub(crate) on_start: Box<dyn FnOnce(FiberId, Option<&str>) + Send>,
    pub(crate) on_exit: Box<dyn FnOnce(FiberId, Option<&str>, &Exit<A, E>) + Send>,
}

/// Fork an effect onto the executor as a fiber of the current context.
///
/// The child receives a fresh interrupt token and a snapshot of the
/// parent's fiber-locals. `on_start` runs synchronously before the spawn.
pub(crate) fn fork_effect<A, E>(
    parent: &Context,
    eff: Effect<A, E>,
    name: Option<String>,
    hooks: Option<FiberHooks<A, E>>,
) -> Fiber<A, E>
where
    A: Send + 'static,
    E: Send + 'static,
{
    let id = FiberId::next();
    let token = InterruptToken::new(Some(id));
    let locals = parent.locals().snapshot();
    let child_ctx = parent
        .with_interrupt(token.clone())
        .with_locals(locals.clone());

    let status = Arc::new(AtomicU8::new(STATUS_RUNNING));
    let result = Arc::new(Deferred::new());

    let (on_start, on_exit) = match hooks {
        Some(hooks) => (Some(hooks.on_start), Some(hooks.on_exit)),
        None => (None, None),
    };
    if let Some(on_start) = on_start {
        on_start(id, name.as_deref());
    }

    let fiber = Fiber {
        id,
        name: name.clone(),
        token,
        status: status.clone(),
        result: result.clone(),
        locals,
    };

    tokio::spawn(async move {
        let exit = eff.run_caught(child_ctx).await;
        let final_status = if exit.is_interrupted() {
            STATUS_INTERRUPTED
        } else {
            STATUS_DONE
        };
        status.store(final_status, Ordering::SeqCst);
        if let Some(on_exit) = on_exit {
            on_exit(id, name.as_deref(), &exit);
        }
        let _ = result.try_succeed(exit);
    });

    fiber
}

/// A lightweight child used by the parallel combinators: a spawned task
/// plus the token that cancels it. Parents always await the handle after
/// requesting interruption, so children never leak.
pub(crate) struct Child<A, E> {
    token: InterruptToken,
    handle: JoinHandle<Exit<A, E>>,
}

impl<A, E> Child<A, E>
where
    A: Send + 'static,
    E: Send + 'static,
{
    pub(crate) fn token(&self) -> InterruptToken {
        self.token.clone()
    }

    /// Wait for the task and normalize executor-level failures: a panic
    /// that escaped the effect boundary is a defect, an aborted task is
    /// an interrupt.
    pub(crate) async fn join_exit(self) -> Exit<A, E> {
        match self.handle.await {
            Ok(exit) => exit,
            Err(join_error) => {
                if join_error.is_panic() {
                    Exit::Failure(Cause::Die(Defect::from_panic(join_error.into_panic())))
                } else {
                    Exit::Failure(Cause::interrupt())
                }
            }
        }
    }
}

pub(crate) fn spawn_child<A, E>(parent: &Context, eff: Effect<A, E>) -> Child<A, E>
where
    A: Send + 'static,
    E: Send + 'static,
{
    let id = FiberId::next();
    let token = InterruptToken::new(Some(id));
    let child_ctx = parent
        .with_interrupt(token.clone())
        .with_locals(parent.locals().snapshot());
    Child {
        token,
        handle: tokio::spawn(eff.run_caught(child_ctx)),
    }
}
