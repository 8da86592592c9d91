//! The effect value: a lazy, environment-dependent async computation
//! with a typed failure channel.
//!
//! `Effect<A, E>` describes a computation that, when run against a
//! [`Context`], produces an [`Exit`]: either a value of type `A` or a
//! [`Cause`] carrying a typed failure `E`, a defect, or an interrupt.
//! Building an effect performs no work; only [`run`](Effect::run) does.
//!
//! # Examples
//!
//! ```
//! use millrace::{Context, Effect};
//!
//! # tokio_test::block_on(async {
//! let ctx = Context::new();
//! let program = Effect::<i32, String>::succeed(10)
//!     .map(|x| x * 2)
//!     .flat_map(|x| Effect::succeed(x + 3));
//!
//! assert_eq!(program.run(&ctx).await.into_value(), Some(23));
//! # });
//! ```

use std::convert::Infallible;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use futures::FutureExt;

use crate::cause::{Cause, Defect};
use crate::clock::Clock;
use crate::context::Context;
use crate::exit::Exit;
use crate::fiber::{spawn_child, InterruptToken};
use crate::layer::Layer;
use crate::scope::Scope;

/// A boxed future that is `Send`.
pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

type EffectFn<A, E> = Box<dyn FnOnce(Context) -> BoxFuture<'static, Exit<A, E>> + Send>;

/// A lazy async computation producing `A`, failing with `E`, and
/// depending on services from a [`Context`].
///
/// Effects are single-shot values: combinators consume and return them.
/// Operations that re-run a computation — [`retry`](Effect::retry) and
/// [`repeat`](Effect::repeat) — therefore take a factory closure.
pub struct Effect<A, E = Infallible> {
    run_fn: EffectFn<A, E>,
}

impl<A, E> std::fmt::Debug for Effect<A, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Effect").field("run_fn", &"<function>").finish()
    }
}

impl<A, E> Effect<A, E>
where
    A: Send + 'static,
    E: Send + 'static,
{
    pub fn from_run<F>(f: F) -> Self
    where
        F: FnOnce(Context) -> BoxFuture<'static, Exit<A, E>> + Send + 'static,
    {
        Effect {
            run_fn: Box::new(f),
        }
    }

    /// An effect that always succeeds with `value`.
    ///
    /// # Examples
    ///
    /// ```
    /// use millrace::{Context, Effect};
    ///
    /// # tokio_test::block_on(async {
    /// let exit = Effect::<i32, String>::succeed(42).run(&Context::new()).await;
    /// assert_eq!(exit.into_value(), Some(42));
    /// # });
    /// ```
    pub fn succeed(value: A) -> Self {
        Effect::from_run(move |_| Box::pin(async move { Exit::Success(value) }))
    }

    /// An effect that always fails with `error` on the typed channel.
    pub fn fail(error: E) -> Self {
        Effect::from_run(move |_| Box::pin(async move { Exit::Failure(Cause::fail(error)) }))
    }

    /// An effect that dies with `defect`.
    pub fn die(defect: impl Into<Defect>) -> Self {
        let defect = defect.into();
        Effect::from_run(move |_| Box::pin(async move { Exit::Failure(Cause::Die(defect)) }))
    }

    /// Lift an already-computed exit.
    pub fn from_exit(exit: Exit<A, E>) -> Self {
        Effect::from_run(move |_| Box::pin(async move { exit }))
    }

    /// Run a pure thunk. A panic becomes a defect.
    pub fn sync<F>(f: F) -> Self
    where
        F: FnOnce() -> A + Send + 'static,
    {
        Effect::from_run(move |_| {
            Box::pin(async move {
                match std::panic::catch_unwind(AssertUnwindSafe(f)) {
                    Ok(value) => Exit::Success(value),
                    Err(payload) => Exit::Failure(Cause::Die(Defect::from_panic(payload))),
                }
            })
        })
    }

    /// Run a fallible thunk, typing any panic with `on_err`.
    pub fn attempt<F, H>(f: F, on_err: H) -> Self
    where
        F: FnOnce() -> A + Send + 'static,
        H: FnOnce(Defect) -> E + Send + 'static,
    {
        Effect::from_run(move |_| {
            Box::pin(async move {
                match std::panic::catch_unwind(AssertUnwindSafe(f)) {
                    Ok(value) => Exit::Success(value),
                    Err(payload) => {
                        Exit::Failure(Cause::fail(on_err(Defect::from_panic(payload))))
                    }
                }
            })
        })
    }

    /// Adopt an externally produced future whose errors are typed.
    ///
    /// The await is a suspension point: it races the current fiber's
    /// interrupt signal. A panic inside the future becomes a defect.
    pub fn from_future<F, Fut>(f: F) -> Self
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = Result<A, E>> + Send + 'static,
    {
        Effect::from_run(move |ctx| {
            Box::pin(async move {
                let token = ctx.interrupt_token().clone();
                if token.is_requested() {
                    return Exit::Failure(token.interrupt_cause());
                }
                let guarded = AssertUnwindSafe(async move { f().await }).catch_unwind();
                tokio::select! {
                    biased;
                    _ = token.cancelled() => Exit::Failure(token.interrupt_cause()),
                    outcome = guarded => match outcome {
                        Ok(Ok(value)) => Exit::Success(value),
                        Ok(Err(error)) => Exit::Failure(Cause::fail(error)),
                        Err(payload) => Exit::Failure(Cause::Die(Defect::from_panic(payload))),
                    },
                }
            })
        })
    }

    /// Reader-style access: build the effect from the current context.
    pub fn with_context<F>(f: F) -> Self
    where
        F: FnOnce(Context) -> Effect<A, E> + Send + 'static,
    {
        Effect::from_run(move |ctx| {
            Box::pin(async move {
                let eff = f(ctx.clone());
                (eff.run_fn)(ctx).await
            })
        })
    }

    /// Evaluate the effect against `ctx`. Panics from user code are
    /// captured as defects; they never escape to the caller.
    pub async fn run(self, ctx: &Context) -> Exit<A, E> {
        self.run_caught(ctx.clone()).await
    }

    pub(crate) fn run_with(self, ctx: Context) -> BoxFuture<'static, Exit<A, E>> {
        (self.run_fn)(ctx)
    }

    pub(crate) fn run_caught(self, ctx: Context) -> BoxFuture<'static, Exit<A, E>> {
        let fut = (self.run_fn)(ctx);
        Box::pin(async move {
            match AssertUnwindSafe(fut).catch_unwind().await {
                Ok(exit) => exit,
                Err(payload) => Exit::Failure(Cause::Die(Defect::from_panic(payload))),
            }
        })
    }

    /// Transform the success value.
    pub fn map<B, F>(self, f: F) -> Effect<B, E>
    where
        B: Send + 'static,
        F: FnOnce(A) -> B + Send + 'static,
    {
        Effect::from_run(move |ctx| {
            let fut = (self.run_fn)(ctx);
            Box::pin(async move {
                match fut.await {
                    Exit::Success(a) => Exit::Success(f(a)),
                    Exit::Failure(cause) => Exit::Failure(cause),
                }
            })
        })
    }

    /// Transform the typed failure channel.
    pub fn map_err<E2, F>(self, f: F) -> Effect<A, E2>
    where
        E2: Send + 'static,
        F: FnMut(E) -> E2 + Send + 'static,
    {
        Effect::from_run(move |ctx| {
            let fut = (self.run_fn)(ctx);
            Box::pin(async move {
                match fut.await {
                    Exit::Success(a) => Exit::Success(a),
                    Exit::Failure(cause) => Exit::Failure(cause.map(f)),
                }
            })
        })
    }

    /// Sequential composition: on success, continue with `f`; on any
    /// failure, skip it.
    ///
    /// # Examples
    ///
    /// ```
    /// use millrace::{Context, Effect};
    ///
    /// # tokio_test::block_on(async {
    /// let program = Effect::<i32, String>::succeed(5)
    ///     .flat_map(|x| Effect::succeed(x * 2));
    /// assert_eq!(program.run(&Context::new()).await.into_value(), Some(10));
    /// # });
    /// ```
    pub fn flat_map<B, F>(self, f: F) -> Effect<B, E>
    where
        B: Send + 'static,
        F: FnOnce(A) -> Effect<B, E> + Send + 'static,
    {
        Effect::from_run(move |ctx| {
            Box::pin(async move {
                match (self.run_fn)(ctx.clone()).await {
                    Exit::Success(a) => (f(a).run_fn)(ctx).await,
                    Exit::Failure(cause) => Exit::Failure(cause),
                }
            })
        })
    }

    /// Sequential pairing.
    pub fn zip<B>(self, other: Effect<B, E>) -> Effect<(A, B), E>
    where
        B: Send + 'static,
    {
        self.zip_with(other, |a, b| (a, b))
    }

    /// Sequential pairing through `f`.
    pub fn zip_with<B, C, F>(self, other: Effect<B, E>, f: F) -> Effect<C, E>
    where
        B: Send + 'static,
        C: Send + 'static,
        F: FnOnce(A, B) -> C + Send + 'static,
    {
        self.flat_map(move |a| other.map(move |b| f(a, b)))
    }

    /// Recover from a typed failure. Defects and interrupts pass through
    /// untouched; a cause containing a `Fail` leaf recovers with its
    /// first failure.
    ///
    /// # Examples
    ///
    /// ```
    /// use millrace::{Context, Effect};
    ///
    /// # tokio_test::block_on(async {
    /// let program = Effect::<String, String>::fail("boom".to_string())
    ///     .catch_all(|e| Effect::<String, String>::succeed(format!("handled:{e}")));
    /// let exit = program.run(&Context::new()).await;
    /// assert_eq!(exit.into_value(), Some("handled:boom".to_string()));
    /// # });
    /// ```
    pub fn catch_all<E2, H>(self, h: H) -> Effect<A, E2>
    where
        E2: Send + 'static,
        H: FnOnce(E) -> Effect<A, E2> + Send + 'static,
    {
        Effect::from_run(move |ctx| {
            Box::pin(async move {
                match (self.run_fn)(ctx.clone()).await {
                    Exit::Success(a) => Exit::Success(a),
                    Exit::Failure(cause) => match cause.failure_or_retyped::<E2>() {
                        Ok(error) => (h(error).run_fn)(ctx).await,
                        Err(cause) => Exit::Failure(cause),
                    },
                }
            })
        })
    }

    /// Handle both channels with pure functions. Defects and interrupts
    /// still pass through.
    pub fn fold<B, F, G>(self, on_err: F, on_ok: G) -> Effect<B, E>
    where
        B: Send + 'static,
        F: FnOnce(E) -> B + Send + 'static,
        G: FnOnce(A) -> B + Send + 'static,
    {
        Effect::from_run(move |ctx| {
            let fut = (self.run_fn)(ctx);
            Box::pin(async move {
                match fut.await {
                    Exit::Success(a) => Exit::Success(on_ok(a)),
                    Exit::Failure(cause) => match cause.failure_or_retyped::<E>() {
                        Ok(error) => Exit::Success(on_err(error)),
                        Err(cause) => Exit::Failure(cause),
                    },
                }
            })
        })
    }

    /// Handle both channels with effects, changing the error type.
    pub fn fold_effect<B, E2, F, G>(self, on_err: F, on_ok: G) -> Effect<B, E2>
    where
        B: Send + 'static,
        E2: Send + 'static,
        F: FnOnce(E) -> Effect<B, E2> + Send + 'static,
        G: FnOnce(A) -> Effect<B, E2> + Send + 'static,
    {
        Effect::from_run(move |ctx| {
            Box::pin(async move {
                match (self.run_fn)(ctx.clone()).await {
                    Exit::Success(a) => (on_ok(a).run_fn)(ctx).await,
                    Exit::Failure(cause) => match cause.failure_or_retyped::<E2>() {
                        Ok(error) => (on_err(error).run_fn)(ctx).await,
                        Err(cause) => Exit::Failure(cause),
                    },
                }
            })
        })
    }

    /// Total handling: observe the full cause, defects and interrupts
    /// included.
    pub fn fold_cause<B, F, G>(self, on_cause: F, on_value: G) -> Effect<B, E>
    where
        B: Send + 'static,
        F: FnOnce(Cause<E>) -> B + Send + 'static,
        G: FnOnce(A) -> B + Send + 'static,
    {
        Effect::from_run(move |ctx| {
            let fut = self.run_caught(ctx);
            Box::pin(async move {
                match fut.await {
                    Exit::Success(a) => Exit::Success(on_value(a)),
                    Exit::Failure(cause) => Exit::Success(on_cause(cause)),
                }
            })
        })
    }

    /// Surface the typed failure as a value.
    pub fn either(self) -> Effect<Result<A, E>, E> {
        Effect::from_run(move |ctx| {
            let fut = (self.run_fn)(ctx);
            Box::pin(async move {
                match fut.await {
                    Exit::Success(a) => Exit::Success(Ok(a)),
                    Exit::Failure(cause) => match cause.failure_or_retyped::<E>() {
                        Ok(error) => Exit::Success(Err(error)),
                        Err(cause) => Exit::Failure(cause),
                    },
                }
            })
        })
    }

    /// Expose the full cause on the typed channel.
    pub fn sandbox(self) -> Effect<A, Cause<E>> {
        Effect::from_run(move |ctx| {
            let fut = self.run_caught(ctx);
            Box::pin(async move {
                match fut.await {
                    Exit::Success(a) => Exit::Success(a),
                    Exit::Failure(cause) => Exit::Failure(Cause::fail(cause)),
                }
            })
        })
    }

    /// Narrow the typed failure to a subset; failures outside the subset
    /// become defects.
    pub fn refine_or_die<E2, P>(self, p: P) -> Effect<A, E2>
    where
        E: std::fmt::Debug,
        E2: Send + 'static,
        P: FnOnce(E) -> Option<E2> + Send + 'static,
    {
        Effect::from_run(move |ctx| {
            let fut = (self.run_fn)(ctx);
            Box::pin(async move {
                match fut.await {
                    Exit::Success(a) => Exit::Success(a),
                    Exit::Failure(cause) => match cause.failure_or_retyped::<E2>() {
                        Ok(error) => {
                            let rendered = format!("{error:?}");
                            match p(error) {
                                Some(refined) => Exit::Failure(Cause::fail(refined)),
                                None => Exit::Failure(Cause::die(format!(
                                    "unrefined failure: {rendered}"
                                ))),
                            }
                        }
                        Err(cause) => Exit::Failure(cause),
                    },
                }
            })
        })
    }

    /// Run `finalizer` after this effect on any completion — success,
    /// failure, or interrupt. The finalizer runs uninterruptibly; its
    /// defects combine with the primary cause via `Then`.
    pub fn ensuring(self, finalizer: Effect<(), Infallible>) -> Effect<A, E> {
        Effect::from_run(move |ctx| {
            Box::pin(async move {
                let exit = self.run_caught(ctx.clone()).await;
                let fin_ctx = ctx.with_interrupt(InterruptToken::never());
                let fin_exit = finalizer.run_caught(fin_ctx).await;
                merge_finalizer_exit(exit, fin_exit)
            })
        })
    }

    /// Run a cleanup effect only when this effect fails, with access to
    /// the cause.
    pub fn on_error<H>(self, h: H) -> Effect<A, E>
    where
        H: for<'a> FnOnce(&'a Cause<E>) -> Effect<(), Infallible> + Send + 'static,
    {
        Effect::from_run(move |ctx| {
            Box::pin(async move {
                match self.run_caught(ctx.clone()).await {
                    Exit::Success(a) => Exit::Success(a),
                    Exit::Failure(cause) => {
                        let cleanup = h(&cause);
                        let fin_ctx = ctx.with_interrupt(InterruptToken::never());
                        let fin_exit = cleanup.run_caught(fin_ctx).await;
                        merge_finalizer_exit(Exit::<A, E>::Failure(cause), fin_exit)
                    }
                }
            })
        })
    }

    /// Run a cleanup effect only when this effect is interrupted.
    pub fn on_interrupt(self, h: Effect<(), Infallible>) -> Effect<A, E> {
        Effect::from_run(move |ctx| {
            Box::pin(async move {
                match self.run_caught(ctx.clone()).await {
                    Exit::Success(a) => Exit::Success(a),
                    Exit::Failure(cause) => {
                        if cause.is_interrupt() {
                            let fin_ctx = ctx.with_interrupt(InterruptToken::never());
                            let fin_exit = h.run_caught(fin_ctx).await;
                            merge_finalizer_exit(Exit::<A, E>::Failure(cause), fin_exit)
                        } else {
                            Exit::Failure(cause)
                        }
                    }
                }
            })
        })
    }

    /// Attach a note to any cause this effect produces.
    pub fn annotate(self, note: impl Into<String>) -> Effect<A, E> {
        let note = note.into();
        Effect::from_run(move |ctx| {
            let fut = (self.run_fn)(ctx);
            Box::pin(async move {
                match fut.await {
                    Exit::Success(a) => Exit::Success(a),
                    Exit::Failure(cause) => Exit::Failure(cause.annotate(note)),
                }
            })
        })
    }

    /// Acquire a resource uninterruptibly and register its release on
    /// the nearest scope. Running outside any scope is a defect; a
    /// failed acquire registers nothing.
    pub fn acquire_release<Rel, RelFut>(acquire: Effect<A, E>, release: Rel) -> Effect<A, E>
    where
        A: Clone,
        Rel: FnOnce(A) -> RelFut + Send + 'static,
        RelFut: Future<Output = ()> + Send + 'static,
    {
        Effect::from_run(move |ctx| {
            Box::pin(async move {
                let scope = match ctx.current_scope() {
                    Some(scope) => scope,
                    None => {
                        return Exit::Failure(Cause::die(
                            "acquire_release outside any scope; wrap with scoped or provide",
                        ))
                    }
                };
                let acquire_ctx = ctx.with_interrupt(InterruptToken::never());
                match acquire.run_caught(acquire_ctx).await {
                    Exit::Success(resource) => {
                        let for_release = resource.clone();
                        scope
                            .add_finalizer(move || release(for_release))
                            .await;
                        Exit::Success(resource)
                    }
                    Exit::Failure(cause) => Exit::Failure(cause),
                }
            })
        })
    }

    /// Acquire, use, release: the scope-free bracket. Release always
    /// runs, uninterruptibly, even when `use_fn` fails or the fiber is
    /// interrupted during use.
    pub fn bracket<U, Use, Rel, RelFut>(
        acquire: Effect<A, E>,
        release: Rel,
        use_fn: Use,
    ) -> Effect<U, E>
    where
        A: Clone,
        U: Send + 'static,
        Use: FnOnce(A) -> Effect<U, E> + Send + 'static,
        Rel: FnOnce(A) -> RelFut + Send + 'static,
        RelFut: Future<Output = ()> + Send + 'static,
    {
        Effect::from_run(move |ctx| {
            Box::pin(async move {
                let acquire_ctx = ctx.clone().with_interrupt(InterruptToken::never());
                let resource = match acquire.run_caught(acquire_ctx).await {
                    Exit::Success(resource) => resource,
                    Exit::Failure(cause) => return Exit::Failure(cause),
                };
                let exit = use_fn(resource.clone()).run_caught(ctx).await;
                let release_exit = match AssertUnwindSafe(release(resource)).catch_unwind().await
                {
                    Ok(()) => Exit::Success(()),
                    Err(payload) => {
                        Exit::Failure(Cause::Die(Defect::from_panic(payload)))
                    }
                };
                merge_finalizer_exit(exit, release_exit)
            })
        })
    }

    /// Allocate a fresh scope, install it as current, hand it to `f`,
    /// and close it when the returned effect completes. Close failures
    /// combine with the body's cause via `Then`.
    pub fn scoped<F>(f: F) -> Effect<A, E>
    where
        F: FnOnce(Arc<Scope>) -> Effect<A, E> + Send + 'static,
    {
        Effect::from_run(move |ctx| {
            Box::pin(async move {
                let scope = Arc::new(Scope::new());
                let body = f(scope.clone());
                let exit = body.run_caught(ctx.with_scope(scope.clone())).await;
                let close_exit = scope.close().await;
                merge_finalizer_exit(exit, close_exit)
            })
        })
    }

    /// Build `layer` in a fresh scope, run this effect under the
    /// resulting context, and tear the scope down on any completion.
    /// A layer build failure is a defect.
    pub fn provide(self, layer: Layer) -> Effect<A, E> {
        Effect::from_run(move |ctx| {
            Box::pin(async move {
                let scope = Arc::new(Scope::new());
                let parent = ctx.with_scope(scope.clone());
                match layer.build_scoped(&parent, &scope).await {
                    Ok(built) => {
                        let exit = self.run_caught(built).await;
                        let close_exit = scope.close().await;
                        merge_finalizer_exit(exit, close_exit)
                    }
                    Err(error) => {
                        let close_exit = scope.close().await;
                        let failure =
                            Exit::<A, E>::Failure(Cause::die(format!("layer build failed: {error}")));
                        merge_finalizer_exit(failure, close_exit)
                    }
                }
            })
        })
    }

    /// Race this effect against the clock. If the sleep wins, the
    /// primary fiber is interrupted, its finalizers complete, and the
    /// result is `None`; otherwise the primary's outcome is returned.
    pub fn timeout(self, duration: Duration) -> Effect<Option<A>, E> {
        Effect::from_run(move |ctx| {
            Box::pin(async move {
                let clock = match ctx.get::<Clock>() {
                    Some(clock) => clock,
                    None => {
                        return Exit::Failure(Cause::die("missing service: millrace::Clock"))
                    }
                };
                let token = ctx.interrupt_token().clone();
                let child = spawn_child(&ctx, self);
                let child_token = child.token();
                let join = child.join_exit();
                tokio::pin!(join);
                let sleep = clock.sleep(duration);

                tokio::select! {
                    biased;
                    _ = token.cancelled() => {
                        child_token.request();
                        let _ = join.await;
                        Exit::Failure(token.interrupt_cause())
                    }
                    exit = &mut join => match exit {
                        Exit::Success(a) => Exit::Success(Some(a)),
                        Exit::Failure(cause) => Exit::Failure(cause),
                    },
                    _ = sleep => {
                        child_token.request();
                        match join.await {
                            Exit::Failure(cause) if !cause.is_interrupted_only() => {
                                Exit::Failure(cause)
                            }
                            _ => Exit::Success(None),
                        }
                    }
                }
            })
        })
    }

    /// Suppress external interruption for the whole region. An
    /// outstanding interrupt is observed immediately on exit and
    /// supersedes the region's outcome.
    pub fn uninterruptible(self) -> Effect<A, E> {
        Effect::from_run(move |ctx| {
            Box::pin(async move {
                let outer = ctx.interrupt_token().clone();
                let exit = (self.run_fn)(ctx.with_interrupt(InterruptToken::never())).await;
                if outer.is_requested() {
                    Exit::Failure(outer.interrupt_cause())
                } else {
                    exit
                }
            })
        })
    }

    /// Like [`uninterruptible`](Effect::uninterruptible), but hands the
    /// region a [`Restore`] capability that re-enables interruption for
    /// chosen sub-effects.
    pub fn uninterruptible_mask<F>(f: F) -> Effect<A, E>
    where
        F: FnOnce(Restore) -> Effect<A, E> + Send + 'static,
    {
        Effect::from_run(move |ctx| {
            Box::pin(async move {
                let outer = ctx.interrupt_token().clone();
                let body = f(Restore {
                    token: outer.clone(),
                });
                let exit = (body.run_fn)(ctx.with_interrupt(InterruptToken::never())).await;
                if outer.is_requested() {
                    Exit::Failure(outer.interrupt_cause())
                } else {
                    exit
                }
            })
        })
    }
}

/// Re-enables the pre-mask interrupt signal inside an
/// [`uninterruptible_mask`](Effect::uninterruptible_mask) region.
#[derive(Clone)]
pub struct Restore {
    token: InterruptToken,
}

impl Restore {
    /// Run `eff` with the original (pre-mask) interrupt signal
    /// reinstalled: a pending interrupt is observed at its next
    /// suspension point.
    pub fn restore<A, E>(&self, eff: Effect<A, E>) -> Effect<A, E>
    where
        A: Send + 'static,
        E: Send + 'static,
    {
        let token = self.token.clone();
        Effect::from_run(move |ctx| (eff.run_fn)(ctx.with_interrupt(token)))
    }
}

impl std::fmt::Debug for Restore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Restore").finish()
    }
}

/// Combine a primary exit with a finalizer's exit: finalizer failures
/// arise after the main outcome, so they attach with `Then`.
pub(crate) fn merge_finalizer_exit<A, E>(
    exit: Exit<A, E>,
    fin_exit: Exit<(), Infallible>,
) -> Exit<A, E> {
    match (exit, fin_exit) {
        (exit, Exit::Success(())) => exit,
        (Exit::Success(_), Exit::Failure(fin_cause)) => {
            Exit::Failure(Cause::from_infallible(fin_cause))
        }
        (Exit::Failure(cause), Exit::Failure(fin_cause)) => Exit::Failure(Cause::then(
            cause,
            Cause::from_infallible(fin_cause),
        )),
    }
}
