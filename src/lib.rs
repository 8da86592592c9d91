//! # Millrace
//!
//! > *A millrace channels the current that drives the wheel.*
//!
//! A structured-concurrency effect runtime: lazy, environment-dependent
//! async computations with a typed failure channel, scoped resource
//! management that survives failure and interruption, fibers with
//! cooperative cancellation, composable service layers, retry/repeat
//! schedules, and backpressured channel pipelines.
//!
//! ## The value type
//!
//! Everything starts from [`Effect<A, E>`]: a description of an async
//! computation that needs services from a [`Context`] and finishes with
//! an [`Exit`] — a success value or a [`Cause`] tree recording typed
//! failures, defects, and interruptions distinctly.
//!
//! ```
//! use millrace::{Context, Effect};
//!
//! # tokio_test::block_on(async {
//! let ctx = Context::new();
//! let program = Effect::<String, String>::fail("boom".to_string())
//!     .catch_all(|e| Effect::<String, String>::succeed(format!("handled:{e}")));
//!
//! assert_eq!(program.run(&ctx).await.into_value(), Some("handled:boom".to_string()));
//! # });
//! ```
//!
//! ## Resources
//!
//! Acquisitions register their releases on a [`Scope`]; the scope
//! releases them in reverse order on success, failure, and interrupt
//! alike. [`Layer`]s build service environments the same way and
//! compose with `+` (sequential) and `|` (parallel, right wins).
//!
//! ## Concurrency
//!
//! [`Runtime::fork`] starts [`Fiber`]s; [`zip_par`], [`race`], and
//! friends fork children whose lifetimes are bounded by the parent and
//! which are interrupted promptly when a sibling fails. Interruption is
//! cooperative: it is observed at suspension points, and finalizers
//! always run to completion.
//!
//! ## Executor
//!
//! Millrace runs on tokio. The combinators spawn onto whatever runtime
//! is current, so they behave identically — cooperative, suspension
//! points only — on the multi-threaded and current-thread flavors; all
//! shared primitives ([`Ref`], [`Channel`], [`Hub`]) are internally
//! synchronized.

#![warn(missing_docs)]
#![warn(missing_debug_implementations)]

pub mod cause;
pub mod channel;
pub mod clock;
pub mod context;
pub mod deferred;
pub mod effect;
pub mod exit;
pub mod fiber;
pub mod fiber_local;
pub mod hub;
pub mod instrument;
pub mod layer;
pub mod logger;
pub mod metrics;
pub mod parallel;
pub mod pipeline;
pub mod queue;
pub mod random;
pub mod refs;
pub mod runtime;
pub mod schedule;
pub mod scope;
pub mod stream;
pub mod tracer;

pub use cause::{Cause, CauseLeaf, Defect, Squashed};
pub use channel::{Channel, ChannelClosed};
pub use clock::{clock_layer, current_time, sleep, test_clock_layer, Clock, ClockSource, TestClock};
pub use context::{service, Context};
pub use deferred::Deferred;
pub use effect::{BoxFuture, Effect, Restore};
pub use exit::Exit;
pub use fiber::{Fiber, FiberId, FiberStatus};
pub use fiber_local::FiberLocal;
pub use hub::{Hub, HubClosed, Subscription};
pub use instrument::instrument;
pub use layer::{Layer, LayerError};
pub use logger::{logger_layer, LogEntry, LogLevel, LogSink, Logger, MemoryLogSink};
pub use metrics::{metrics_layer, Counter, Gauge, Histogram, MetricsRegistry};
pub use parallel::{for_each_par, merge_all, race, race_all, race_first, zip_par};
pub use pipeline::{stage, Pipeline, Stage};
pub use queue::{Queue, QueueClosed};
pub use random::{
    next_double, next_long, random_layer, seeded_random_layer, Random, RandomSource,
};
pub use refs::Ref;
pub use runtime::{FiberInfo, Runtime, Supervisor};
pub use schedule::{Decision, Schedule};
pub use scope::Scope;
pub use stream::{ErrorSlot, Sink, Stream};
pub use tracer::{tracer_layer, Span, SpanEvent, SpanStatus, Tracer};

/// Everything most programs need, in one import.
pub mod prelude {
    pub use crate::cause::{Cause, Defect};
    pub use crate::channel::Channel;
    pub use crate::clock::{clock_layer, current_time, sleep, Clock};
    pub use crate::context::{service, Context};
    pub use crate::effect::Effect;
    pub use crate::exit::Exit;
    pub use crate::layer::Layer;
    pub use crate::parallel::{for_each_par, merge_all, race, race_all, race_first, zip_par};
    pub use crate::pipeline::{stage, Pipeline};
    pub use crate::runtime::Runtime;
    pub use crate::schedule::Schedule;
    pub use crate::scope::Scope;
    pub use crate::stream::{Sink, Stream};
}
