//! The clock service: sleeping and reading the time through the
//! environment, so tests can substitute virtual time.

use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crate::cause::Cause;
use crate::context::Context;
use crate::effect::{BoxFuture, Effect};
use crate::exit::Exit;
use crate::layer::Layer;

/// The time source behind a [`Clock`] handle.
pub trait ClockSource: Send + Sync {
    /// Sleep for `duration`.
    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()>;
    /// The current monotonic time.
    fn now(&self) -> Instant;
}

/// The clock service handle stored in the [`Context`].
#[derive(Clone)]
pub struct Clock {
    source: Arc<dyn ClockSource>,
}

impl Clock {
    /// The real clock, backed by tokio timers.
    pub fn system() -> Self {
        Clock {
            source: Arc::new(SystemClock),
        }
    }

    /// A clock over a custom source.
    pub fn from_source(source: Arc<dyn ClockSource>) -> Self {
        Clock { source }
    }

    /// Sleep for `duration`.
    pub fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
        self.source.sleep(duration)
    }

    /// The current monotonic time.
    pub fn now(&self) -> Instant {
        self.source.now()
    }
}

impl std::fmt::Debug for Clock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Clock").finish()
    }
}

struct SystemClock;

impl ClockSource for SystemClock {
    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
        Box::pin(tokio::time::sleep(duration))
    }

    fn now(&self) -> Instant {
        Instant::now()
    }
}

/// A virtual clock for tests. Sleeping advances the virtual offset and
/// yields, so schedule-driven code runs instantly; `advance` moves time
/// on demand.
///
/// # Examples
///
/// ```
/// use std::time::Duration;
/// use millrace::{Clock, ClockSource, TestClock};
///
/// # tokio_test::block_on(async {
/// let test_clock = TestClock::new();
/// let clock = Clock::from_source(std::sync::Arc::new(test_clock.clone()));
///
/// clock.sleep(Duration::from_secs(3600)).await;
/// assert_eq!(test_clock.elapsed(), Duration::from_secs(3600));
/// # });
/// ```
#[derive(Clone)]
pub struct TestClock {
    origin: Instant,
    offset: Arc<Mutex<Duration>>,
}

impl TestClock {
    /// A virtual clock starting at zero elapsed time.
    pub fn new() -> Self {
        TestClock {
            origin: Instant::now(),
            offset: Arc::new(Mutex::new(Duration::ZERO)),
        }
    }

    /// Move virtual time forward.
    pub fn advance(&self, duration: Duration) {
        let mut offset = self.offset.lock().unwrap_or_else(|e| e.into_inner());
        *offset += duration;
    }

    /// Total virtual time elapsed.
    pub fn elapsed(&self) -> Duration {
        *self.offset.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for TestClock {
    fn default() -> Self {
        TestClock::new()
    }
}

impl ClockSource for TestClock {
    fn sleep(&self, duration: Duration) -> BoxFuture<'static, ()> {
        let offset = self.offset.clone();
        Box::pin(async move {
            {
                let mut offset = offset.lock().unwrap_or_else(|e| e.into_inner());
                *offset += duration;
            }
            tokio::task::yield_now().await;
        })
    }

    fn now(&self) -> Instant {
        self.origin + self.elapsed()
    }
}

impl std::fmt::Debug for TestClock {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("TestClock")
            .field("elapsed", &self.elapsed())
            .finish()
    }
}

/// A layer installing the system clock.
pub fn clock_layer() -> Layer {
    Layer::from_value(Clock::system())
}

/// A layer installing a virtual clock. Keep a clone of `clock` to
/// advance and inspect it.
pub fn test_clock_layer(clock: TestClock) -> Layer {
    Layer::from_value(Clock::from_source(Arc::new(clock)))
}

/// Sleep through the [`Clock`] service. An interruptible suspension
/// point; a missing clock is a defect.
pub fn sleep<E: Send + 'static>(duration: Duration) -> Effect<(), E> {
    Effect::from_run(move |ctx: Context| {
        Box::pin(async move {
            let clock = match ctx.get::<Clock>() {
                Some(clock) => clock,
                None => return Exit::Failure(Cause::die("missing service: millrace::Clock")),
            };
            let token = ctx.interrupt_token().clone();
            if token.is_requested() {
                return Exit::Failure(token.interrupt_cause());
            }
            tokio::select! {
                biased;
                _ = token.cancelled() => Exit::Failure(token.interrupt_cause()),
                _ = clock.sleep(duration) => Exit::Success(()),
            }
        })
    })
}

/// Read the current time from the [`Clock`] service.
pub fn current_time<E: Send + 'static>() -> Effect<Instant, E> {
    Effect::from_run(move |ctx: Context| {
        Box::pin(async move {
            match ctx.get::<Clock>() {
                Some(clock) => Exit::Success(clock.now()),
                None => Exit::Failure(Cause::die("missing service: millrace::Clock")),
            }
        })
    })
}
