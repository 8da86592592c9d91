//! The outcome of running an effect: a success value or a [`Cause`].

use crate::cause::{Cause, Defect};

/// The result of evaluating an effect to completion.
///
/// # Examples
///
/// ```
/// use millrace::{Context, Effect, Exit};
///
/// # tokio_test::block_on(async {
/// let ctx = Context::new();
/// let exit = Effect::<i32, String>::succeed(42).run(&ctx).await;
/// assert_eq!(exit, Exit::Success(42));
///
/// let exit = Effect::<i32, String>::fail("boom".to_string()).run(&ctx).await;
/// assert!(exit.is_failure());
/// # });
/// ```
#[derive(Debug, Clone, PartialEq)]
pub enum Exit<A, E> {
    /// The effect produced a value.
    Success(A),
    /// The effect ended abnormally.
    Failure(Cause<E>),
}

impl<A, E> Exit<A, E> {
    /// A successful exit.
    pub fn succeed(value: A) -> Self {
        Exit::Success(value)
    }

    /// A typed-failure exit.
    pub fn fail(error: E) -> Self {
        Exit::Failure(Cause::fail(error))
    }

    /// A defect exit.
    pub fn die(defect: impl Into<Defect>) -> Self {
        Exit::Failure(Cause::die(defect))
    }

    /// An unattributed interrupt exit.
    pub fn interrupt() -> Self {
        Exit::Failure(Cause::interrupt())
    }

    /// True when this exit carries a value.
    pub fn is_success(&self) -> bool {
        matches!(self, Exit::Success(_))
    }

    /// True when this exit carries a cause.
    pub fn is_failure(&self) -> bool {
        matches!(self, Exit::Failure(_))
    }

    /// True when the cause consists solely of interruption.
    pub fn is_interrupted(&self) -> bool {
        matches!(self, Exit::Failure(cause) if cause.is_interrupted_only())
    }

    /// The value, if present.
    pub fn value(&self) -> Option<&A> {
        match self {
            Exit::Success(a) => Some(a),
            Exit::Failure(_) => None,
        }
    }

    /// The cause, if present.
    pub fn cause(&self) -> Option<&Cause<E>> {
        match self {
            Exit::Success(_) => None,
            Exit::Failure(cause) => Some(cause),
        }
    }

    /// Collapse the exit with one handler per channel.
    pub fn fold<B>(self, on_cause: impl FnOnce(Cause<E>) -> B, on_value: impl FnOnce(A) -> B) -> B {
        match self {
            Exit::Success(a) => on_value(a),
            Exit::Failure(cause) => on_cause(cause),
        }
    }

    /// Transform the success channel.
    pub fn map<B>(self, f: impl FnOnce(A) -> B) -> Exit<B, E> {
        match self {
            Exit::Success(a) => Exit::Success(f(a)),
            Exit::Failure(cause) => Exit::Failure(cause),
        }
    }

    /// Transform the typed failure channel.
    pub fn map_err<E2>(self, f: impl FnMut(E) -> E2) -> Exit<A, E2> {
        match self {
            Exit::Success(a) => Exit::Success(a),
            Exit::Failure(cause) => Exit::Failure(cause.map(f)),
        }
    }

    /// Convert to a `Result`, surfacing the full cause on failure.
    pub fn into_result(self) -> Result<A, Cause<E>> {
        match self {
            Exit::Success(a) => Ok(a),
            Exit::Failure(cause) => Err(cause),
        }
    }

    /// The value, discarding any cause.
    pub fn into_value(self) -> Option<A> {
        match self {
            Exit::Success(a) => Some(a),
            Exit::Failure(_) => None,
        }
    }
}

impl<A, E> From<Result<A, E>> for Exit<A, E> {
    fn from(result: Result<A, E>) -> Self {
        match result {
            Ok(a) => Exit::Success(a),
            Err(e) => Exit::fail(e),
        }
    }
}
