//! Schedules: decision automata driving retry and repeat.
//!
//! A [`Schedule`] consumes one input per step — the error for
//! [`Effect::retry`], the produced value for [`Effect::repeat`] — and
//! decides whether to continue after a delay or halt. Schedules are
//! pure data plus captured state; delays are served by the injected
//! [`Clock`] service and jitter by the injected [`Random`] service, so
//! tests can drive both deterministically.

use std::time::Duration;

use crate::cause::{Cause, Defect};
use crate::clock::Clock;
use crate::context::Context;
use crate::effect::Effect;
use crate::exit::Exit;
use crate::random::Random;

/// One step's verdict.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Decision<Out> {
    /// Run again after `delay`.
    Continue {
        /// How long to wait before the next attempt.
        delay: Duration,
        /// The schedule's output for this step.
        output: Out,
    },
    /// Stop recurring.
    Halt {
        /// The schedule's final output.
        output: Out,
    },
}

type StepFn<In, Out> = Box<dyn FnMut(&In, &Context) -> Result<Decision<Out>, Defect> + Send>;

/// A stateful decision automaton from `In` inputs to `Out` outputs.
///
/// # Examples
///
/// ```
/// use std::sync::atomic::{AtomicU32, Ordering};
/// use std::sync::Arc;
/// use millrace::{clock_layer, Context, Effect, Schedule};
///
/// # tokio_test::block_on(async {
/// let calls = Arc::new(AtomicU32::new(0));
/// let probe = calls.clone();
/// let flaky = move || {
///     let calls = probe.clone();
///     Effect::<u32, String>::sync(move || calls.fetch_add(1, Ordering::SeqCst))
///         .flat_map(|n| {
///             if n < 2 {
///                 Effect::fail("not yet".to_string())
///             } else {
///                 Effect::succeed(n)
///             }
///         })
/// };
///
/// let program = Effect::retry(flaky, Schedule::recurs(5)).provide(clock_layer());
/// let exit = program.run(&Context::new()).await;
/// assert_eq!(exit.into_value(), Some(2));
/// assert_eq!(calls.load(Ordering::SeqCst), 3);
/// # });
/// ```
pub struct Schedule<In, Out> {
    step: StepFn<In, Out>,
}

impl<In, Out> std::fmt::Debug for Schedule<In, Out> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Schedule").finish()
    }
}

impl<In, Out> Schedule<In, Out>
where
    In: 'static,
    Out: Send + 'static,
{
    /// Build a schedule from a raw step function.
    pub fn from_step<F>(f: F) -> Self
    where
        F: FnMut(&In, &Context) -> Result<Decision<Out>, Defect> + Send + 'static,
    {
        Schedule { step: Box::new(f) }
    }

    /// Advance the automaton by one input.
    pub fn step(&mut self, input: &In, ctx: &Context) -> Result<Decision<Out>, Defect> {
        (self.step)(input, ctx)
    }

    /// Switch to `other` once this schedule halts; the input that caused
    /// the halt is fed to `other` immediately.
    pub fn and_then(mut self, mut other: Schedule<In, Out>) -> Schedule<In, Out> {
        let mut switched = false;
        Schedule::from_step(move |input, ctx| {
            if switched {
                return other.step(input, ctx);
            }
            match self.step(input, ctx)? {
                Decision::Halt { .. } => {
                    switched = true;
                    other.step(input, ctx)
                }
                decision => Ok(decision),
            }
        })
    }

    /// Halt once the accumulated delay reaches `total`.
    pub fn up_to(mut self, total: Duration) -> Schedule<In, Out> {
        let mut accumulated = Duration::ZERO;
        Schedule::from_step(move |input, ctx| {
            match self.step(input, ctx)? {
                Decision::Continue { delay, output } => {
                    accumulated += delay;
                    if accumulated >= total {
                        Ok(Decision::Halt { output })
                    } else {
                        Ok(Decision::Continue { delay, output })
                    }
                }
                halt => Ok(halt),
            }
        })
    }

    /// Halt as soon as the predicate rejects an input.
    pub fn while_input<P>(mut self, mut p: P) -> Schedule<In, Out>
    where
        P: FnMut(&In) -> bool + Send + 'static,
    {
        Schedule::from_step(move |input, ctx| {
            let decision = self.step(input, ctx)?;
            if p(input) {
                Ok(decision)
            } else {
                match decision {
                    Decision::Continue { output, .. } => Ok(Decision::Halt { output }),
                    halt => Ok(halt),
                }
            }
        })
    }

    /// Halt as soon as the predicate rejects an output.
    pub fn while_output<P>(mut self, mut p: P) -> Schedule<In, Out>
    where
        P: FnMut(&Out) -> bool + Send + 'static,
    {
        Schedule::from_step(move |input, ctx| match self.step(input, ctx)? {
            Decision::Continue { delay, output } => {
                if p(&output) {
                    Ok(Decision::Continue { delay, output })
                } else {
                    Ok(Decision::Halt { output })
                }
            }
            halt => Ok(halt),
        })
    }

    /// Multiply every delay by a uniform sample from `[0, 1)` drawn from
    /// the injected [`Random`] service.
    pub fn jittered(self) -> Schedule<In, Out> {
        self.jittered_between(0.0, 1.0)
    }

    /// Multiply every delay by a uniform sample from `[low, high)`.
    /// A missing [`Random`] service is a defect.
    pub fn jittered_between(mut self, low: f64, high: f64) -> Schedule<In, Out> {
        Schedule::from_step(move |input, ctx| match self.step(input, ctx)? {
            Decision::Continue { delay, output } => {
                let random = ctx
                    .get::<Random>()
                    .ok_or_else(|| Defect::new("missing service: millrace::Random"))?;
                let factor = low + (high - low) * random.next_double();
                let scaled = delay.mul_f64(factor.max(0.0));
                Ok(Decision::Continue {
                    delay: scaled,
                    output,
                })
            }
            halt => Ok(halt),
        })
    }
}

impl<In> Schedule<In, u32>
where
    In: 'static,
{
    /// Continue `times` more times after the first attempt, with no
    /// delay. The output counts recurrences so far.
    pub fn recurs(times: u32) -> Schedule<In, u32> {
        let mut made = 0u32;
        Schedule::from_step(move |_input, _ctx| {
            if made < times {
                made += 1;
                Ok(Decision::Continue {
                    delay: Duration::ZERO,
                    output: made,
                })
            } else {
                Ok(Decision::Halt { output: made })
            }
        })
    }
}

impl<In> Schedule<In, u64>
where
    In: 'static,
{
    /// Continue forever with a constant delay. The output counts steps.
    pub fn spaced(interval: Duration) -> Schedule<In, u64> {
        let mut steps = 0u64;
        Schedule::from_step(move |_input, _ctx| {
            steps += 1;
            Ok(Decision::Continue {
                delay: interval,
                output: steps,
            })
        })
    }
}

impl<In> Schedule<In, Duration>
where
    In: 'static,
{
    /// Exponential backoff `base * 2^k`. The output is the delay.
    pub fn exponential(base: Duration) -> Schedule<In, Duration> {
        Schedule::exponential_with_factor(base, 2.0)
    }

    /// Exponential backoff with an explicit factor.
    pub fn exponential_with_factor(base: Duration, factor: f64) -> Schedule<In, Duration> {
        let mut attempt: i32 = 0;
        Schedule::from_step(move |_input, _ctx| {
            let multiplier = factor.powi(attempt).clamp(0.0, 1e9);
            attempt = attempt.saturating_add(1);
            let delay = base.mul_f64(multiplier);
            Ok(Decision::Continue {
                delay,
                output: delay,
            })
        })
    }

    /// Fibonacci backoff starting from `base`. The output is the delay.
    pub fn fibonacci(base: Duration) -> Schedule<In, Duration> {
        let mut current = base;
        let mut next = base;
        Schedule::from_step(move |_input, _ctx| {
            let delay = current;
            let sum = current.saturating_add(next);
            current = next;
            next = sum;
            Ok(Decision::Continue {
                delay,
                output: delay,
            })
        })
    }
}

impl<A, E> Effect<A, E>
where
    A: Send + 'static,
    E: Send + 'static,
{
    /// Re-run the effect produced by `make` while the schedule says to,
    /// consulting it with each typed failure. Defects and interrupts are
    /// never retried; once the schedule halts, the last failure
    /// surfaces. Delays are served by the [`Clock`] service.
    pub fn retry<F, Out>(make: F, schedule: Schedule<E, Out>) -> Effect<A, E>
    where
        F: Fn() -> Effect<A, E> + Send + 'static,
        Out: Send + 'static,
    {
        Effect::from_run(move |ctx| {
            Box::pin(async move {
                let mut schedule = schedule;
                loop {
                    let exit = make().run_caught(ctx.clone()).await;
                    let cause = match exit {
                        Exit::Success(value) => return Exit::Success(value),
                        Exit::Failure(cause) => cause,
                    };
                    let decision = match cause.first_failure() {
                        None => return Exit::Failure(cause),
                        Some(error) => match schedule.step(error, &ctx) {
                            Ok(decision) => decision,
                            Err(defect) => return Exit::Failure(Cause::Die(defect)),
                        },
                    };
                    match decision {
                        Decision::Halt { .. } => return Exit::Failure(cause),
                        Decision::Continue { delay, .. } => {
                            if let Err(interruption) = scheduled_sleep::<E>(&ctx, delay).await {
                                return Exit::Failure(interruption);
                            }
                        }
                    }
                }
            })
        })
    }

    /// Run the effect produced by `make`, consulting the schedule with
    /// each success. A failure during a repeat surfaces immediately;
    /// the result is the last success.
    pub fn repeat<F, Out>(make: F, schedule: Schedule<A, Out>) -> Effect<A, E>
    where
        F: Fn() -> Effect<A, E> + Send + 'static,
        Out: Send + 'static,
    {
        Effect::from_run(move |ctx| {
            Box::pin(async move {
                let mut schedule = schedule;
                loop {
                    let value = match make().run_caught(ctx.clone()).await {
                        Exit::Success(value) => value,
                        Exit::Failure(cause) => return Exit::Failure(cause),
                    };
                    match schedule.step(&value, &ctx) {
                        Err(defect) => return Exit::Failure(Cause::Die(defect)),
                        Ok(Decision::Halt { .. }) => return Exit::Success(value),
                        Ok(Decision::Continue { delay, .. }) => {
                            if let Err(interruption) = scheduled_sleep::<E>(&ctx, delay).await {
                                return Exit::Failure(interruption);
                            }
                        }
                    }
                }
            })
        })
    }
}

/// Sleep through the clock service, racing the fiber's interrupt
/// signal. A missing clock is a defect.
async fn scheduled_sleep<E>(ctx: &Context, delay: Duration) -> Result<(), Cause<E>> {
    if delay.is_zero() {
        return Ok(());
    }
    let clock = ctx
        .get::<Clock>()
        .ok_or_else(|| Cause::die("missing service: millrace::Clock"))?;
    let token = ctx.interrupt_token().clone();
    if token.is_requested() {
        return Err(token.interrupt_cause());
    }
    tokio::select! {
        biased;
        _ = token.cancelled() => Err(token.interrupt_cause()),
        _ = clock.sleep(delay) => Ok(()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ctx() -> Context {
        Context::new()
    }

    #[test]
    fn recurs_continues_exactly_n_times() {
        let mut schedule = Schedule::<&str, u32>::recurs(2);
        let ctx = ctx();
        assert!(matches!(
            schedule.step(&"e", &ctx),
            Ok(Decision::Continue { .. })
        ));
        assert!(matches!(
            schedule.step(&"e", &ctx),
            Ok(Decision::Continue { .. })
        ));
        assert!(matches!(schedule.step(&"e", &ctx), Ok(Decision::Halt { .. })));
    }

    #[test]
    fn exponential_doubles() {
        let mut schedule = Schedule::<(), Duration>::exponential(Duration::from_millis(100));
        let ctx = ctx();
        let delays: Vec<Duration> = (0..3)
            .map(|_| match schedule.step(&(), &ctx) {
                Ok(Decision::Continue { delay, .. }) => delay,
                other => panic!("expected continue, got {other:?}"),
            })
            .collect();
        assert_eq!(
            delays,
            vec![
                Duration::from_millis(100),
                Duration::from_millis(200),
                Duration::from_millis(400)
            ]
        );
    }

    #[test]
    fn fibonacci_progression() {
        let mut schedule = Schedule::<(), Duration>::fibonacci(Duration::from_millis(10));
        let ctx = ctx();
        let delays: Vec<u64> = (0..5)
            .map(|_| match schedule.step(&(), &ctx) {
                Ok(Decision::Continue { delay, .. }) => delay.as_millis() as u64,
                other => panic!("expected continue, got {other:?}"),
            })
            .collect();
        assert_eq!(delays, vec![10, 10, 20, 30, 50]);
    }

    #[test]
    fn up_to_halts_on_accumulated_delay() {
        let mut schedule =
            Schedule::<(), u64>::spaced(Duration::from_millis(40)).up_to(Duration::from_millis(100));
        let ctx = ctx();
        assert!(matches!(
            schedule.step(&(), &ctx),
            Ok(Decision::Continue { .. })
        ));
        assert!(matches!(
            schedule.step(&(), &ctx),
            Ok(Decision::Continue { .. })
        ));
        assert!(matches!(schedule.step(&(), &ctx), Ok(Decision::Halt { .. })));
    }

    #[test]
    fn while_input_halts_on_rejected_input() {
        let mut schedule = Schedule::<u32, u32>::recurs(10).while_input(|n| *n < 3);
        let ctx = ctx();
        assert!(matches!(
            schedule.step(&1, &ctx),
            Ok(Decision::Continue { .. })
        ));
        assert!(matches!(schedule.step(&7, &ctx), Ok(Decision::Halt { .. })));
    }

    #[test]
    fn jitter_without_random_service_is_a_defect() {
        let mut schedule =
            Schedule::<(), u64>::spaced(Duration::from_millis(10)).jittered();
        assert!(schedule.step(&(), &ctx()).is_err());
    }

    #[test]
    fn seeded_jitter_is_deterministic() {
        let sample = |seeded: &Context| {
            let mut schedule =
                Schedule::<(), u64>::spaced(Duration::from_millis(100)).jittered();
            match schedule.step(&(), seeded) {
                Ok(Decision::Continue { delay, .. }) => delay,
                other => panic!("expected continue, got {other:?}"),
            }
        };
        let first = sample(&ctx().add(Random::seeded(42)));
        let again = sample(&ctx().add(Random::seeded(42)));
        assert_eq!(first, again);
        assert!(first < Duration::from_millis(100));
    }
}
