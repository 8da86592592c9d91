//! The random service: jitter and sampling through the environment.

use std::sync::{Arc, Mutex};

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use crate::cause::Cause;
use crate::context::Context;
use crate::effect::Effect;
use crate::exit::Exit;
use crate::layer::Layer;

/// The entropy source behind a [`Random`] handle.
pub trait RandomSource: Send + Sync {
    /// A uniform sample from `[0.0, 1.0)`.
    fn next_double(&self) -> f64;
    /// A uniform 64-bit sample.
    fn next_long(&self) -> u64;
}

/// The random service handle stored in the [`Context`].
#[derive(Clone)]
pub struct Random {
    source: Arc<dyn RandomSource>,
}

impl Random {
    /// An entropy-seeded generator.
    pub fn system() -> Self {
        Random {
            source: Arc::new(StdRandom {
                rng: Mutex::new(StdRng::from_entropy()),
            }),
        }
    }

    /// A deterministic generator for tests.
    pub fn seeded(seed: u64) -> Self {
        Random {
            source: Arc::new(StdRandom {
                rng: Mutex::new(StdRng::seed_from_u64(seed)),
            }),
        }
    }

    /// A handle over a custom source.
    pub fn from_source(source: Arc<dyn RandomSource>) -> Self {
        Random { source }
    }

    /// A uniform sample from `[0.0, 1.0)`.
    pub fn next_double(&self) -> f64 {
        self.source.next_double()
    }

    /// A uniform 64-bit sample.
    pub fn next_long(&self) -> u64 {
        self.source.next_long()
    }
}

impl std::fmt::Debug for Random {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Random").finish()
    }
}

struct StdRandom {
    rng: Mutex<StdRng>,
}

impl RandomSource for StdRandom {
    fn next_double(&self) -> f64 {
        self.rng.lock().unwrap_or_else(|e| e.into_inner()).gen()
    }

    fn next_long(&self) -> u64 {
        self.rng.lock().unwrap_or_else(|e| e.into_inner()).gen()
    }
}

/// A layer installing an entropy-seeded [`Random`].
pub fn random_layer() -> Layer {
    Layer::from_value(Random::system())
}

/// A layer installing a deterministic [`Random`] for tests.
pub fn seeded_random_layer(seed: u64) -> Layer {
    Layer::from_value(Random::seeded(seed))
}

/// Sample a double from the [`Random`] service.
pub fn next_double<E: Send + 'static>() -> Effect<f64, E> {
    Effect::from_run(move |ctx: Context| {
        Box::pin(async move {
            match ctx.get::<Random>() {
                Some(random) => Exit::Success(random.next_double()),
                None => Exit::Failure(Cause::die("missing service: millrace::Random")),
            }
        })
    })
}

/// Sample a 64-bit integer from the [`Random`] service.
pub fn next_long<E: Send + 'static>() -> Effect<u64, E> {
    Effect::from_run(move |ctx: Context| {
        Box::pin(async move {
            match ctx.get::<Random>() {
                Some(random) => Exit::Success(random.next_long()),
                None => Exit::Failure(Cause::die("missing service: millrace::Random")),
            }
        })
    })
}
