//! Parallel composition with cancellation on failure.
//!
//! Every combinator here shares one discipline: the first child to fail
//! typed or die causes immediate interruption of its siblings, and every
//! child is awaited before the combinator returns, so no fiber and no
//! resource leaks. Sibling causes consisting only of interruption are
//! absorbed; independent sibling failures combine with the offender via
//! [`Cause::both`].

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use futures::stream::{FuturesUnordered, StreamExt};

use crate::cause::Cause;
use crate::effect::Effect;
use crate::exit::Exit;
use crate::fiber::spawn_child;

fn combine_with_sibling<E>(offender: Cause<E>, sibling: Option<Cause<E>>) -> Cause<E> {
    match sibling {
        Some(cause) if !cause.is_interrupted_only() => Cause::both(offender, cause),
        _ => offender,
    }
}

fn sibling_cause<A, E>(exit: Exit<A, E>) -> Option<Cause<E>> {
    match exit {
        Exit::Success(_) => None,
        Exit::Failure(cause) => Some(cause),
    }
}

/// Run both effects concurrently; succeed with the pair when both
/// succeed. On the first failure the other side is interrupted and
/// awaited before the combinator returns.
pub fn zip_par<A, B, E>(left: Effect<A, E>, right: Effect<B, E>) -> Effect<(A, B), E>
where
    A: Send + 'static,
    B: Send + 'static,
    E: Send + 'static,
{
    Effect::from_run(move |ctx| {
        Box::pin(async move {
            let token = ctx.interrupt_token().clone();
            let left_child = spawn_child(&ctx, left);
            let right_child = spawn_child(&ctx, right);
            let left_token = left_child.token();
            let right_token = right_child.token();
            let left_join = left_child.join_exit();
            let right_join = right_child.join_exit();
            tokio::pin!(left_join);
            tokio::pin!(right_join);

            let mut left_value: Option<A> = None;
            let mut right_value: Option<B> = None;

            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => {
                        left_token.request();
                        right_token.request();
                        if left_value.is_none() {
                            let _ = (&mut left_join).await;
                        }
                        if right_value.is_none() {
                            let _ = (&mut right_join).await;
                        }
                        return Exit::Failure(token.interrupt_cause());
                    }
                    exit = &mut left_join, if left_value.is_none() => match exit {
                        Exit::Success(a) => {
                            left_value = Some(a);
                        }
                        Exit::Failure(cause) => {
                            right_token.request();
                            let other = match right_value.take() {
                                Some(_) => None,
                                None => sibling_cause((&mut right_join).await),
                            };
                            return Exit::Failure(combine_with_sibling(cause, other));
                        }
                    },
                    exit = &mut right_join, if right_value.is_none() => match exit {
                        Exit::Success(b) => {
                            right_value = Some(b);
                        }
                        Exit::Failure(cause) => {
                            left_token.request();
                            let other = match left_value.take() {
                                Some(_) => None,
                                None => sibling_cause((&mut left_join).await),
                            };
                            return Exit::Failure(combine_with_sibling(cause, other));
                        }
                    },
                }

                if left_value.is_some() && right_value.is_some() {
                    match (left_value.take(), right_value.take()) {
                        (Some(a), Some(b)) => return Exit::Success((a, b)),
                        _ => unreachable!("both sides checked present"),
                    }
                }
            }
        })
    })
}

/// Race two effects for the first *success*. A failed side defers to
/// the other's outcome; if both fail, the causes combine with `Both` in
/// completion order. The loser of a decided race is interrupted and
/// awaited.
pub fn race<A, E>(left: Effect<A, E>, right: Effect<A, E>) -> Effect<A, E>
where
    A: Send + 'static,
    E: Send + 'static,
{
    Effect::from_run(move |ctx| {
        Box::pin(async move {
            let token = ctx.interrupt_token().clone();
            let left_child = spawn_child(&ctx, left);
            let right_child = spawn_child(&ctx, right);
            let left_token = left_child.token();
            let right_token = right_child.token();
            let left_join = left_child.join_exit();
            let right_join = right_child.join_exit();
            tokio::pin!(left_join);
            tokio::pin!(right_join);

            let mut left_done = false;
            let mut right_done = false;
            let mut causes: Vec<Cause<E>> = Vec::new();

            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled() => {
                        left_token.request();
                        right_token.request();
                        if !left_done {
                            let _ = (&mut left_join).await;
                        }
                        if !right_done {
                            let _ = (&mut right_join).await;
                        }
                        return Exit::Failure(token.interrupt_cause());
                    }
                    exit = &mut left_join, if !left_done => {
                        left_done = true;
                        match exit {
                            Exit::Success(a) => {
                                right_token.request();
                                if !right_done {
                                    let _ = (&mut right_join).await;
                                }
                                return Exit::Success(a);
                            }
                            Exit::Failure(cause) => causes.push(cause),
                        }
                    }
                    exit = &mut right_join, if !right_done => {
                        right_done = true;
                        match exit {
                            Exit::Success(a) => {
                                left_token.request();
                                if !left_done {
                                    let _ = (&mut left_join).await;
                                }
                                return Exit::Success(a);
                            }
                            Exit::Failure(cause) => causes.push(cause),
                        }
                    }
                }

                if left_done && right_done {
                    let mut drained = causes.drain(..);
                    return match (drained.next(), drained.next()) {
                        (Some(first), Some(second)) => {
                            Exit::Failure(Cause::both(first, second))
                        }
                        (Some(only), None) => Exit::Failure(only),
                        _ => Exit::Failure(Cause::die("race finished without a cause")),
                    };
                }
            }
        })
    })
}

/// Return the first *completion*, success or failure, interrupting and
/// awaiting the rest. An empty input is a defect.
pub fn race_first<A, E>(effects: Vec<Effect<A, E>>) -> Effect<A, E>
where
    A: Send + 'static,
    E: Send + 'static,
{
    if effects.is_empty() {
        return Effect::die("race over empty input");
    }
    Effect::from_run(move |ctx| {
        Box::pin(async move {
            let token = ctx.interrupt_token().clone();
            let mut tokens = Vec::with_capacity(effects.len());
            let mut joins = FuturesUnordered::new();
            for eff in effects {
                let child = spawn_child(&ctx, eff);
                tokens.push(child.token());
                joins.push(child.join_exit());
            }

            let winner = tokio::select! {
                biased;
                _ = token.cancelled() => None,
                first = joins.next() => first,
            };

            for child_token in &tokens {
                child_token.request();
            }
            while joins.next().await.is_some() {}

            match winner {
                Some(exit) => exit,
                None => Exit::Failure(token.interrupt_cause()),
            }
        })
    })
}

/// Synonym for [`race_first`] taking its input as a list.
pub fn race_all<A, E>(effects: Vec<Effect<A, E>>) -> Effect<A, E>
where
    A: Send + 'static,
    E: Send + 'static,
{
    race_first(effects)
}

/// Run all effects with bounded concurrency, gathering results in input
/// order. The first failure cancels running siblings and pending work.
/// An empty input or zero parallelism is a defect.
pub fn merge_all<A, E>(effects: Vec<Effect<A, E>>, parallelism: usize) -> Effect<Vec<A>, E>
where
    A: Send + 'static,
    E: Send + 'static,
{
    if effects.is_empty() {
        return Effect::die("merge_all over empty input");
    }
    if parallelism == 0 {
        return Effect::die("merge_all with zero parallelism");
    }
    bounded_all(effects, parallelism)
}

/// Parallel map with bounded concurrency; result order matches input
/// order. Zero parallelism is a defect.
pub fn for_each_par<I, B, E, F>(items: Vec<I>, f: F, parallelism: usize) -> Effect<Vec<B>, E>
where
    I: Send + 'static,
    B: Send + 'static,
    E: Send + 'static,
    F: FnMut(I) -> Effect<B, E>,
{
    if parallelism == 0 {
        return Effect::die("for_each_par with zero parallelism");
    }
    let effects: Vec<Effect<B, E>> = items.into_iter().map(f).collect();
    if effects.is_empty() {
        return Effect::succeed(Vec::new());
    }
    bounded_all(effects, parallelism)
}

/// A pool of `parallelism` worker fibers pulling indexed work from a
/// shared cursor. Unstarted work is simply never picked up once a
/// failure stops the pool.
fn bounded_all<A, E>(effects: Vec<Effect<A, E>>, parallelism: usize) -> Effect<Vec<A>, E>
where
    A: Send + 'static,
    E: Send + 'static,
{
    Effect::from_run(move |ctx| {
        Box::pin(async move {
            let total = effects.len();
            let worker_count = parallelism.min(total);
            let queue: Arc<Mutex<Vec<Option<Effect<A, E>>>>> =
                Arc::new(Mutex::new(effects.into_iter().map(Some).collect()));
            let results: Arc<Mutex<Vec<Option<A>>>> =
                Arc::new(Mutex::new((0..total).map(|_| None).collect()));
            let cursor = Arc::new(AtomicUsize::new(0));
            let token = ctx.interrupt_token().clone();

            let mut tokens = Vec::with_capacity(worker_count);
            let mut joins = FuturesUnordered::new();
            for _ in 0..worker_count {
                let queue = queue.clone();
                let results = results.clone();
                let cursor = cursor.clone();
                let worker: Effect<(), E> = Effect::from_run(move |wctx| {
                    Box::pin(async move {
                        loop {
                            let worker_token = wctx.interrupt_token().clone();
                            if worker_token.is_requested() {
                                return Exit::Failure(worker_token.interrupt_cause());
                            }
                            let index = cursor.fetch_add(1, Ordering::SeqCst);
                            if index >= total {
                                return Exit::Success(());
                            }
                            let eff = queue.lock().unwrap_or_else(|e| e.into_inner())[index].take();
                            let Some(eff) = eff else { continue };
                            match eff.run_caught(wctx.clone()).await {
                                Exit::Success(value) => {
                                    results.lock().unwrap_or_else(|e| e.into_inner())[index] =
                                        Some(value);
                                }
                                Exit::Failure(cause) => return Exit::Failure(cause),
                            }
                        }
                    })
                });
                let child = spawn_child(&ctx, worker);
                tokens.push(child.token());
                joins.push(child.join_exit());
            }

            let mut offender: Option<Cause<E>> = None;
            let mut parent_interrupted = false;
            loop {
                tokio::select! {
                    biased;
                    _ = token.cancelled(), if !parent_interrupted && offender.is_none() => {
                        parent_interrupted = true;
                        for child_token in &tokens {
                            child_token.request();
                        }
                    }
                    next = joins.next() => match next {
                        None => break,
                        Some(Exit::Success(())) => {}
                        Some(Exit::Failure(cause)) => {
                            let expected_interrupt =
                                offender.is_some() || parent_interrupted;
                            if cause.is_interrupted_only() && expected_interrupt {
                                // absorbed: the worker stopped because we stopped it
                            } else if offender.is_none() {
                                offender = Some(cause);
                                for child_token in &tokens {
                                    child_token.request();
                                }
                            } else if !cause.is_interrupted_only() {
                                offender = offender.take().map(|c| Cause::both(c, cause));
                            }
                        }
                    }
                }
            }

            if let Some(cause) = offender {
                return Exit::Failure(cause);
            }
            if parent_interrupted {
                return Exit::Failure(token.interrupt_cause());
            }
            let slots = std::mem::take(&mut *results.lock().unwrap_or_else(|e| e.into_inner()));
            let mut out = Vec::with_capacity(total);
            for slot in slots {
                match slot {
                    Some(value) => out.push(value),
                    None => return Exit::Failure(Cause::die("parallel result slot unfilled")),
                }
            }
            Exit::Success(out)
        })
    })
}
