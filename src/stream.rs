//! Streams and sinks: queue-backed value flows with a typed error
//! channel.
//!
//! A [`Stream`] is a recipe for producers: given an output [`Queue`]
//! and a shared error slot, it starts the tasks that feed the queue and
//! closes it when production ends. Stages compose by inserting
//! intermediate queues, and termination propagates as a close cascade
//! in both directions — a drained upstream closes downstream, an
//! early-terminating downstream closes upstream. A [`Sink`] consumes
//! the final queue, watching the error slot so the first failure
//! anywhere in the flow surfaces promptly.
//!
//! Streams complement the [`Pipeline`](crate::Pipeline): a pipeline
//! wires caller-owned channels and guarantees worker join/interruption
//! as one supervised effect, while a stream is a lighter, composable
//! value whose stages shut down through queue closure.

use std::convert::Infallible;
use std::panic::AssertUnwindSafe;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;
use std::time::Duration;

use crate::cause::{Cause, Defect};
use crate::channel::Channel;
use crate::context::Context;
use crate::deferred::Deferred;
use crate::effect::{BoxFuture, Effect};
use crate::exit::Exit;
use crate::queue::Queue;

/// The shared single-assignment slot carrying a flow's first failure.
pub type ErrorSlot<E> = Arc<Deferred<Cause<E>>>;

type StreamBuild<A, E> =
    Box<dyn FnOnce(Arc<Queue<A>>, ErrorSlot<E>) -> Effect<(), Infallible> + Send>;

type EffectTransform<A, B, E> = Arc<dyn Fn(A) -> Effect<B, E> + Send + Sync>;

/// A composable flow of `A` values that may fail with `E`.
///
/// # Examples
///
/// ```
/// use millrace::{Context, Sink, Stream};
///
/// # tokio_test::block_on(async {
/// let doubled = Stream::<i32, String>::from_iterable(vec![1, 2, 3])
///     .map(|x| x * 2)
///     .run(Sink::collect());
///
/// let exit = doubled.run(&Context::new()).await;
/// assert_eq!(exit.into_value(), Some(vec![2, 4, 6]));
/// # });
/// ```
pub struct Stream<A, E = Infallible> {
    build: StreamBuild<A, E>,
}

impl<A, E> std::fmt::Debug for Stream<A, E> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Stream").finish()
    }
}

impl<A, E> Stream<A, E>
where
    A: Send + 'static,
    E: Clone + Send + 'static,
{
    /// Build a stream from a raw producer recipe. The recipe's effect
    /// must start production and arrange for `out` to be closed when
    /// production ends.
    pub fn from_build<F>(f: F) -> Self
    where
        F: FnOnce(Arc<Queue<A>>, ErrorSlot<E>) -> Effect<(), Infallible> + Send + 'static,
    {
        Stream { build: Box::new(f) }
    }

    /// A stream emitting each item of `items`, then completing.
    pub fn from_iterable<I>(items: I) -> Stream<A, E>
    where
        I: IntoIterator<Item = A> + Send + 'static,
        I::IntoIter: Send,
    {
        Stream::from_build(move |out, _errors| {
            Effect::from_run(move |_ctx| {
                Box::pin(async move {
                    tokio::spawn(async move {
                        for item in items {
                            if out.send(item).await.is_err() {
                                break;
                            }
                        }
                        out.close();
                    });
                    Exit::Success(())
                })
            })
        })
    }

    /// A stream forwarding from a [`Channel`]. The forwarder stops when
    /// the source is closed and drained, or when downstream terminates
    /// early.
    pub fn from_channel(source: Arc<Channel<A>>) -> Stream<A, E> {
        Stream::from_build(move |out, _errors| {
            Effect::from_run(move |_ctx| {
                Box::pin(async move {
                    tokio::spawn(async move {
                        loop {
                            tokio::select! {
                                biased;
                                _ = source.closed() => {
                                    while let Some(value) = source.try_receive() {
                                        if out.send(value).await.is_err() {
                                            return;
                                        }
                                    }
                                    out.close();
                                    return;
                                }
                                received = source.receive() => match received {
                                    Ok(value) => {
                                        if out.send(value).await.is_err() {
                                            return;
                                        }
                                    }
                                    Err(_) => {
                                        out.close();
                                        return;
                                    }
                                },
                            }
                        }
                    });
                    Exit::Success(())
                })
            })
        })
    }

    /// Transform each item through an effect, on `workers` concurrent
    /// fibers reading from an intermediate queue of `capacity`
    /// (`0` means unbounded). A typed failure or defect in the
    /// transform becomes the flow's error and stops the stages around
    /// it.
    pub fn via_effect<B, F>(self, f: F, workers: usize, capacity: usize) -> Stream<B, E>
    where
        B: Send + 'static,
        F: Fn(A) -> Effect<B, E> + Send + Sync + 'static,
    {
        let upstream = self.build;
        Stream::from_build(move |out, errors| {
            Effect::from_run(move |ctx| {
                Box::pin(async move {
                    let in_q = Arc::new(Queue::new(capacity));
                    tokio::spawn(upstream(in_q.clone(), errors.clone()).run_caught(ctx.clone()));

                    let transform: EffectTransform<A, B, E> = Arc::new(f);
                    let active = Arc::new(AtomicUsize::new(workers.max(1)));
                    for _ in 0..workers.max(1) {
                        tokio::spawn(stage_worker(
                            in_q.clone(),
                            out.clone(),
                            errors.clone(),
                            transform.clone(),
                            ctx.clone(),
                            active.clone(),
                        ));
                    }
                    Exit::Success(())
                })
            })
        })
    }

    /// Transform each item with a pure function.
    pub fn map<B, F>(self, f: F) -> Stream<B, E>
    where
        B: Send + 'static,
        F: Fn(A) -> B + Send + Sync + 'static,
    {
        let f = Arc::new(f);
        self.via_effect(
            move |item| {
                let f = f.clone();
                Effect::sync(move || f(item))
            },
            1,
            0,
        )
    }

    /// Decouple upstream from downstream with an identity stage reading
    /// through a queue of `capacity`.
    pub fn buffer(self, capacity: usize) -> Stream<A, E> {
        self.via_effect(Effect::succeed, 1, capacity)
    }

    /// Keep only items the predicate accepts. A panicking predicate is
    /// a defect and fails the flow.
    pub fn filter<P>(self, predicate: P) -> Stream<A, E>
    where
        P: Fn(&A) -> bool + Send + Sync + 'static,
    {
        let upstream = self.build;
        Stream::from_build(move |out, errors| {
            Effect::from_run(move |ctx| {
                Box::pin(async move {
                    let in_q = Arc::new(Queue::unbounded());
                    tokio::spawn(upstream(in_q.clone(), errors.clone()).run_caught(ctx));
                    tokio::spawn(async move {
                        loop {
                            let item = match in_q.receive().await {
                                Ok(item) => item,
                                Err(_) => {
                                    out.close();
                                    return;
                                }
                            };
                            let keep =
                                match std::panic::catch_unwind(AssertUnwindSafe(|| predicate(&item)))
                                {
                                    Ok(keep) => keep,
                                    Err(payload) => {
                                        let _ = errors.try_succeed(Cause::Die(Defect::from_panic(
                                            payload,
                                        )));
                                        in_q.close();
                                        out.close();
                                        return;
                                    }
                                };
                            if keep && out.send(item).await.is_err() {
                                in_q.close();
                                return;
                            }
                        }
                    });
                    Exit::Success(())
                })
            })
        })
    }

    /// Emit at most `n` items, then terminate the flow early: upstream
    /// is closed so producers stop.
    pub fn take(self, n: usize) -> Stream<A, E> {
        let upstream = self.build;
        Stream::from_build(move |out, errors| {
            Effect::from_run(move |ctx| {
                Box::pin(async move {
                    let in_q = Arc::new(Queue::unbounded());
                    tokio::spawn(upstream(in_q.clone(), errors.clone()).run_caught(ctx));
                    tokio::spawn(async move {
                        let mut remaining = n;
                        loop {
                            if remaining == 0 {
                                in_q.close();
                                out.close();
                                return;
                            }
                            let item = match in_q.receive().await {
                                Ok(item) => item,
                                Err(_) => {
                                    out.close();
                                    return;
                                }
                            };
                            if out.send(item).await.is_err() {
                                in_q.close();
                                return;
                            }
                            remaining -= 1;
                        }
                    });
                    Exit::Success(())
                })
            })
        })
    }

    /// Fail the flow with `on_timeout()` if the gap between consecutive
    /// items exceeds `per_item`. Timing is wall-clock, as the stage runs
    /// between queues rather than inside an effect.
    pub fn timeout<F>(self, per_item: Duration, on_timeout: F) -> Stream<A, E>
    where
        F: FnOnce() -> E + Send + 'static,
    {
        let upstream = self.build;
        Stream::from_build(move |out, errors| {
            Effect::from_run(move |ctx| {
                Box::pin(async move {
                    let in_q = Arc::new(Queue::unbounded());
                    tokio::spawn(upstream(in_q.clone(), errors.clone()).run_caught(ctx));
                    tokio::spawn(async move {
                        let mut on_timeout = Some(on_timeout);
                        loop {
                            tokio::select! {
                                biased;
                                received = in_q.receive() => match received {
                                    Ok(item) => {
                                        if out.send(item).await.is_err() {
                                            in_q.close();
                                            return;
                                        }
                                    }
                                    Err(_) => {
                                        out.close();
                                        return;
                                    }
                                },
                                _ = tokio::time::sleep(per_item) => {
                                    if let Some(on_timeout) = on_timeout.take() {
                                        let _ = errors.try_succeed(Cause::fail(on_timeout()));
                                    }
                                    in_q.close();
                                    out.close();
                                    return;
                                }
                            }
                        }
                    });
                    Exit::Success(())
                })
            })
        })
    }

    /// Emit at most one item per `period`.
    pub fn throttle(self, period: Duration) -> Stream<A, E> {
        let upstream = self.build;
        Stream::from_build(move |out, errors| {
            Effect::from_run(move |ctx| {
                Box::pin(async move {
                    let in_q = Arc::new(Queue::unbounded());
                    tokio::spawn(upstream(in_q.clone(), errors.clone()).run_caught(ctx));
                    tokio::spawn(async move {
                        loop {
                            let item = match in_q.receive().await {
                                Ok(item) => item,
                                Err(_) => {
                                    out.close();
                                    return;
                                }
                            };
                            tokio::time::sleep(period).await;
                            if out.send(item).await.is_err() {
                                in_q.close();
                                return;
                            }
                        }
                    });
                    Exit::Success(())
                })
            })
        })
    }

    /// Interleave two flows; the merged stream completes when both
    /// inputs have.
    pub fn merge(self, other: Stream<A, E>) -> Stream<A, E> {
        let left = self.build;
        let right = other.build;
        Stream::from_build(move |out, errors| {
            Effect::from_run(move |ctx| {
                Box::pin(async move {
                    let q1 = Arc::new(Queue::unbounded());
                    let q2 = Arc::new(Queue::unbounded());
                    tokio::spawn(left(q1.clone(), errors.clone()).run_caught(ctx.clone()));
                    tokio::spawn(right(q2.clone(), errors.clone()).run_caught(ctx));

                    let remaining = Arc::new(AtomicUsize::new(2));
                    for source in [q1, q2] {
                        let out = out.clone();
                        let remaining = remaining.clone();
                        tokio::spawn(async move {
                            loop {
                                match source.receive().await {
                                    Ok(value) => {
                                        if out.send(value).await.is_err() {
                                            source.close();
                                            break;
                                        }
                                    }
                                    Err(_) => break,
                                }
                            }
                            if remaining.fetch_sub(1, Ordering::SeqCst) == 1 {
                                out.close();
                            }
                        });
                    }
                    Exit::Success(())
                })
            })
        })
    }

    /// A stage whose workers each acquire a resource once, use it for
    /// every item they process, and release it on termination — success,
    /// early downstream close, or failure alike.
    pub fn via_acquire_release<R, B, Acq, Rel, F>(
        self,
        acquire: Acq,
        release: Rel,
        transform: F,
        workers: usize,
        capacity: usize,
    ) -> Stream<B, E>
    where
        R: Clone + Send + 'static,
        B: Send + 'static,
        Acq: Fn() -> Effect<R, E> + Send + Sync + 'static,
        Rel: Fn(R) -> Effect<(), Infallible> + Send + Sync + 'static,
        F: Fn(R, A) -> Effect<B, E> + Send + Sync + 'static,
    {
        let upstream = self.build;
        Stream::from_build(move |out, errors| {
            Effect::from_run(move |ctx| {
                Box::pin(async move {
                    let in_q = Arc::new(Queue::new(capacity));
                    tokio::spawn(upstream(in_q.clone(), errors.clone()).run_caught(ctx.clone()));

                    let acquire: Arc<dyn Fn() -> Effect<R, E> + Send + Sync> = Arc::new(acquire);
                    let release: Arc<dyn Fn(R) -> Effect<(), Infallible> + Send + Sync> =
                        Arc::new(release);
                    let transform: Arc<dyn Fn(R, A) -> Effect<B, E> + Send + Sync> =
                        Arc::new(transform);
                    let active = Arc::new(AtomicUsize::new(workers.max(1)));
                    for _ in 0..workers.max(1) {
                        tokio::spawn(scoped_worker(
                            in_q.clone(),
                            out.clone(),
                            errors.clone(),
                            acquire.clone(),
                            release.clone(),
                            transform.clone(),
                            ctx.clone(),
                            active.clone(),
                        ));
                    }
                    Exit::Success(())
                })
            })
        })
    }

    /// Drive the flow into `sink` and return its result. Production is
    /// started in the background; the sink's await races the fiber's
    /// interrupt signal, and the final queue is closed on the way out so
    /// early-terminating sinks stop the producers.
    pub fn run<B>(self, sink: Sink<A, E, B>) -> Effect<B, E>
    where
        B: Send + 'static,
    {
        Effect::from_run(move |ctx| {
            Box::pin(async move {
                let out = Arc::new(Queue::unbounded());
                let errors: ErrorSlot<E> = Arc::new(Deferred::new());
                tokio::spawn((self.build)(out.clone(), errors.clone()).run_caught(ctx.clone()));

                let token = ctx.interrupt_token().clone();
                let mut consuming = (sink.run)(out.clone(), errors.clone(), ctx.clone());
                let exit = tokio::select! {
                    biased;
                    _ = token.cancelled() => Exit::Failure(token.interrupt_cause()),
                    exit = &mut consuming => exit,
                };
                out.close();
                exit
            })
        })
    }

    /// Collect every item into a vector.
    pub fn run_collect(self) -> Effect<Vec<A>, E> {
        self.run(Sink::collect())
    }

    /// Aggregate items left to right.
    pub fn run_fold<B, F>(self, initial: B, f: F) -> Effect<B, E>
    where
        B: Send + 'static,
        F: FnMut(B, A) -> B + Send + 'static,
    {
        self.run(Sink::fold(initial, f))
    }
}

async fn stage_worker<A, B, E>(
    input: Arc<Queue<A>>,
    output: Arc<Queue<B>>,
    errors: ErrorSlot<E>,
    transform: EffectTransform<A, B, E>,
    ctx: Context,
    active: Arc<AtomicUsize>,
) where
    A: Send + 'static,
    B: Send + 'static,
    E: Clone + Send + 'static,
{
    loop {
        let item = match input.receive().await {
            Ok(item) => item,
            Err(_) => {
                // upstream finished; the last worker closes downstream
                if active.fetch_sub(1, Ordering::SeqCst) == 1 {
                    output.close();
                }
                return;
            }
        };
        match transform(item).run_caught(ctx.clone()).await {
            Exit::Success(value) => {
                if output.send(value).await.is_err() {
                    input.close();
                    return;
                }
            }
            Exit::Failure(cause) => {
                let _ = errors.try_succeed(cause);
                input.close();
                output.close();
                return;
            }
        }
    }
}

#[allow(clippy::too_many_arguments)]
async fn scoped_worker<A, R, B, E>(
    input: Arc<Queue<A>>,
    output: Arc<Queue<B>>,
    errors: ErrorSlot<E>,
    acquire: Arc<dyn Fn() -> Effect<R, E> + Send + Sync>,
    release: Arc<dyn Fn(R) -> Effect<(), Infallible> + Send + Sync>,
    transform: Arc<dyn Fn(R, A) -> Effect<B, E> + Send + Sync>,
    ctx: Context,
    active: Arc<AtomicUsize>,
) where
    A: Send + 'static,
    R: Clone + Send + 'static,
    B: Send + 'static,
    E: Clone + Send + 'static,
{
    let resource = match acquire().run_caught(ctx.clone()).await {
        Exit::Success(resource) => resource,
        Exit::Failure(cause) => {
            let _ = errors.try_succeed(cause);
            if active.fetch_sub(1, Ordering::SeqCst) == 1 {
                output.close();
            }
            return;
        }
    };
    loop {
        let item = match input.receive().await {
            Ok(item) => item,
            Err(_) => {
                if active.fetch_sub(1, Ordering::SeqCst) == 1 {
                    output.close();
                }
                break;
            }
        };
        match transform(resource.clone(), item).run_caught(ctx.clone()).await {
            Exit::Success(value) => {
                if output.send(value).await.is_err() {
                    input.close();
                    break;
                }
            }
            Exit::Failure(cause) => {
                let _ = errors.try_succeed(cause);
                input.close();
                output.close();
                break;
            }
        }
    }
    let _ = release(resource).run_caught(ctx).await;
}

/// Receive the next item, preferring a recorded failure over buffered
/// values; `Ok(None)` means the flow completed cleanly.
async fn next_item<A, E>(out: &Queue<A>, errors: &Deferred<Cause<E>>) -> Result<Option<A>, Cause<E>>
where
    A: Send,
    E: Clone + Send,
{
    tokio::select! {
        biased;
        cause = errors.await_() => Err(cause),
        received = out.receive() => match received {
            Ok(value) => Ok(Some(value)),
            Err(_) => match errors.try_value() {
                Some(cause) => Err(cause),
                None => Ok(None),
            },
        },
    }
}

type SinkRun<A, E, B> =
    Box<dyn FnOnce(Arc<Queue<A>>, ErrorSlot<E>, Context) -> BoxFuture<'static, Exit<B, E>> + Send>;

/// A consumer of a stream's final queue.
pub struct Sink<A, E, B> {
    run: SinkRun<A, E, B>,
}

impl<A, E, B> std::fmt::Debug for Sink<A, E, B> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Sink").finish()
    }
}

impl<A, E, B> Sink<A, E, B>
where
    A: Send + 'static,
    E: Clone + Send + 'static,
    B: Send + 'static,
{
    /// Build a sink from a raw consumer.
    pub fn new<F>(f: F) -> Self
    where
        F: FnOnce(Arc<Queue<A>>, ErrorSlot<E>, Context) -> BoxFuture<'static, Exit<B, E>>
            + Send
            + 'static,
    {
        Sink { run: Box::new(f) }
    }

    /// Aggregate items left to right into a final value.
    pub fn fold<F>(initial: B, mut f: F) -> Sink<A, E, B>
    where
        F: FnMut(B, A) -> B + Send + 'static,
    {
        Sink::new(move |out, errors, _ctx| {
            Box::pin(async move {
                let mut acc = initial;
                loop {
                    match next_item(&out, &errors).await {
                        Ok(Some(value)) => acc = f(acc, value),
                        Ok(None) => return Exit::Success(acc),
                        Err(cause) => return Exit::Failure(cause),
                    }
                }
            })
        })
    }
}

impl<A, E> Sink<A, E, Vec<A>>
where
    A: Send + 'static,
    E: Clone + Send + 'static,
{
    /// Collect every item, in arrival order.
    pub fn collect() -> Sink<A, E, Vec<A>> {
        Sink::fold(Vec::new(), |mut acc, value| {
            acc.push(value);
            acc
        })
    }
}

impl<A, E> Sink<A, E, Option<A>>
where
    A: Send + 'static,
    E: Clone + Send + 'static,
{
    /// Take the first item, if any, and terminate the flow.
    pub fn head() -> Sink<A, E, Option<A>> {
        Sink::new(move |out, errors, _ctx| {
            Box::pin(async move {
                match next_item(&out, &errors).await {
                    Ok(first) => Exit::Success(first),
                    Err(cause) => Exit::Failure(cause),
                }
            })
        })
    }
}

impl<A, E> Sink<A, E, ()>
where
    A: Send + 'static,
    E: Clone + Send + 'static,
{
    /// Consume and discard everything, surfacing only failure.
    pub fn drain() -> Sink<A, E, ()> {
        Sink::new(move |out, errors, _ctx| {
            Box::pin(async move {
                loop {
                    match next_item(&out, &errors).await {
                        Ok(Some(_)) => {}
                        Ok(None) => return Exit::Success(()),
                        Err(cause) => return Exit::Failure(cause),
                    }
                }
            })
        })
    }
}
