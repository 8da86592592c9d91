//! The cause algebra: a composable tree describing how and why an effect
//! ended abnormally.
//!
//! A [`Cause`] distinguishes the three abnormal channels — typed failure
//! ([`Cause::Fail`]), defect ([`Cause::Die`]), and interruption
//! ([`Cause::Interrupt`]) — and records how multiple abnormal outcomes
//! combined: [`Cause::Then`] for sequential composition (the right cause
//! arose after the left, e.g. a finalizer failing during cleanup) and
//! [`Cause::Both`] for concurrent composition (both arose independently).
//! [`Cause::Annotated`] attaches contextual notes without changing the
//! cause's kind.

use std::any::Any;
use std::convert::Infallible;
use std::fmt;

use crate::fiber::FiberId;

/// An unexpected error: a bug, a panic, a violated invariant.
///
/// Defects live outside the typed error channel. They are produced by
/// explicit [`Effect::die`](crate::Effect::die) calls and by panics
/// captured from user code, and they are not recoverable through
/// [`catch_all`](crate::Effect::catch_all).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Defect {
    message: String,
}

impl Defect {
    /// Create a defect from a message.
    pub fn new(message: impl Into<String>) -> Self {
        Defect {
            message: message.into(),
        }
    }

    /// The defect's message.
    pub fn message(&self) -> &str {
        &self.message
    }

    /// Build a defect from a captured panic payload.
    pub(crate) fn from_panic(payload: Box<dyn Any + Send>) -> Self {
        let message = if let Some(s) = payload.downcast_ref::<&'static str>() {
            (*s).to_string()
        } else if let Some(s) = payload.downcast_ref::<String>() {
            s.clone()
        } else {
            "panic with non-string payload".to_string()
        };
        Defect { message }
    }
}

impl fmt::Display for Defect {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for Defect {}

impl From<&str> for Defect {
    fn from(message: &str) -> Self {
        Defect::new(message)
    }
}

impl From<String> for Defect {
    fn from(message: String) -> Self {
        Defect { message }
    }
}

/// A tree of abnormal outcomes.
///
/// Leaves carry the outcome itself; interior nodes record composition.
/// `Annotated` is transparent to every kind query.
#[derive(Debug, Clone, PartialEq)]
pub enum Cause<E> {
    /// A typed, expected failure on the declared error channel.
    Fail(E),
    /// An unexpected defect.
    Die(Defect),
    /// Cooperative cancellation, optionally attributed to the fiber that
    /// was interrupted.
    Interrupt(Option<FiberId>),
    /// Sequential composition: the right cause arose after the left.
    Then(Box<Cause<E>>, Box<Cause<E>>),
    /// Concurrent composition: both causes arose independently.
    Both(Box<Cause<E>>, Box<Cause<E>>),
    /// A contextual annotation, transparent to kind queries.
    Annotated(Box<Cause<E>>, String),
}

/// A borrowed view of a single leaf, used by [`Cause::fold_leaves`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum CauseLeaf<'a, E> {
    /// A typed failure leaf.
    Fail(&'a E),
    /// A defect leaf.
    Die(&'a Defect),
    /// An interrupt leaf.
    Interrupt(Option<FiberId>),
}

/// The single representative outcome produced by [`Cause::squash`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Squashed<'a, E> {
    /// The first typed failure in the tree.
    Fail(&'a E),
    /// The first defect, when no typed failure exists.
    Die(&'a Defect),
    /// Interruption, when the tree holds nothing else.
    Interrupt(Option<FiberId>),
}

impl<E> Cause<E> {
    /// A typed failure leaf.
    pub fn fail(error: E) -> Self {
        Cause::Fail(error)
    }

    /// A defect leaf.
    pub fn die(defect: impl Into<Defect>) -> Self {
        Cause::Die(defect.into())
    }

    /// An unattributed interrupt leaf.
    pub fn interrupt() -> Self {
        Cause::Interrupt(None)
    }

    /// An interrupt leaf attributed to `fiber`.
    pub fn interrupt_by(fiber: FiberId) -> Self {
        Cause::Interrupt(Some(fiber))
    }

    /// Sequential composition: `second` arose after `first`.
    pub fn then(first: Cause<E>, second: Cause<E>) -> Self {
        Cause::Then(Box::new(first), Box::new(second))
    }

    /// Concurrent composition.
    pub fn both(left: Cause<E>, right: Cause<E>) -> Self {
        Cause::Both(Box::new(left), Box::new(right))
    }

    /// Attach a contextual note.
    pub fn annotate(self, note: impl Into<String>) -> Self {
        Cause::Annotated(Box::new(self), note.into())
    }

    /// Fold over the leaves in left-to-right order. Annotations are
    /// transparent.
    pub fn fold_leaves<'a, B, F>(&'a self, init: B, mut f: F) -> B
    where
        F: FnMut(B, CauseLeaf<'a, E>) -> B,
    {
        fn go<'a, B, E, F>(cause: &'a Cause<E>, acc: B, f: &mut F) -> B
        where
            F: FnMut(B, CauseLeaf<'a, E>) -> B,
        {
            match cause {
                Cause::Fail(e) => f(acc, CauseLeaf::Fail(e)),
                Cause::Die(d) => f(acc, CauseLeaf::Die(d)),
                Cause::Interrupt(id) => f(acc, CauseLeaf::Interrupt(*id)),
                Cause::Then(l, r) | Cause::Both(l, r) => {
                    let acc = go(l, acc, f);
                    go(r, acc, f)
                }
                Cause::Annotated(inner, _) => go(inner, acc, f),
            }
        }
        go(self, init, &mut f)
    }

    /// True when any leaf is a typed failure.
    pub fn is_fail(&self) -> bool {
        self.fold_leaves(false, |acc, leaf| acc || matches!(leaf, CauseLeaf::Fail(_)))
    }

    /// True when any leaf is a defect.
    pub fn is_die(&self) -> bool {
        self.fold_leaves(false, |acc, leaf| acc || matches!(leaf, CauseLeaf::Die(_)))
    }

    /// True when any leaf is an interrupt.
    pub fn is_interrupt(&self) -> bool {
        self.fold_leaves(false, |acc, leaf| {
            acc || matches!(leaf, CauseLeaf::Interrupt(_))
        })
    }

    /// True when every leaf is an interrupt. Parallel combinators absorb
    /// sibling causes that satisfy this.
    pub fn is_interrupted_only(&self) -> bool {
        self.fold_leaves(true, |acc, leaf| {
            acc && matches!(leaf, CauseLeaf::Interrupt(_))
        })
    }

    /// Every typed failure in the tree, left to right.
    pub fn failures(&self) -> Vec<&E> {
        self.fold_leaves(Vec::new(), |mut acc, leaf| {
            if let CauseLeaf::Fail(e) = leaf {
                acc.push(e);
            }
            acc
        })
    }

    /// Every defect in the tree, left to right.
    pub fn defects(&self) -> Vec<&Defect> {
        self.fold_leaves(Vec::new(), |mut acc, leaf| {
            if let CauseLeaf::Die(d) = leaf {
                acc.push(d);
            }
            acc
        })
    }

    /// The first typed failure, if any.
    pub fn first_failure(&self) -> Option<&E> {
        self.fold_leaves(None, |acc, leaf| match (acc, leaf) {
            (None, CauseLeaf::Fail(e)) => Some(e),
            (acc, _) => acc,
        })
    }

    /// Squash the tree to a single representative outcome, preferring a
    /// typed failure, then a defect, then interruption.
    pub fn squash(&self) -> Squashed<'_, E> {
        let (fail, die, interrupt) = self.fold_leaves(
            (None, None, None),
            |(fail, die, interrupt), leaf| match leaf {
                CauseLeaf::Fail(e) => (fail.or(Some(e)), die, interrupt),
                CauseLeaf::Die(d) => (fail, die.or(Some(d)), interrupt),
                CauseLeaf::Interrupt(id) => (fail, die, interrupt.or(Some(id))),
            },
        );
        if let Some(e) = fail {
            Squashed::Fail(e)
        } else if let Some(d) = die {
            Squashed::Die(d)
        } else {
            Squashed::Interrupt(interrupt.flatten())
        }
    }

    /// Map the typed failure channel.
    pub fn map<E2>(self, mut f: impl FnMut(E) -> E2) -> Cause<E2> {
        fn go<E, E2, F: FnMut(E) -> E2>(cause: Cause<E>, f: &mut F) -> Cause<E2> {
            match cause {
                Cause::Fail(e) => Cause::Fail(f(e)),
                Cause::Die(d) => Cause::Die(d),
                Cause::Interrupt(id) => Cause::Interrupt(id),
                Cause::Then(l, r) => Cause::Then(Box::new(go(*l, f)), Box::new(go(*r, f))),
                Cause::Both(l, r) => Cause::Both(Box::new(go(*l, f)), Box::new(go(*r, f))),
                Cause::Annotated(inner, note) => Cause::Annotated(Box::new(go(*inner, f)), note),
            }
        }
        go(self, &mut f)
    }

    /// A type-erased rendering of this cause, used by supervision.
    pub fn erased(&self) -> Cause<String>
    where
        E: fmt::Debug,
    {
        fn go<E: fmt::Debug>(cause: &Cause<E>) -> Cause<String> {
            match cause {
                Cause::Fail(e) => Cause::Fail(format!("{e:?}")),
                Cause::Die(d) => Cause::Die(d.clone()),
                Cause::Interrupt(id) => Cause::Interrupt(*id),
                Cause::Then(l, r) => Cause::Then(Box::new(go(l)), Box::new(go(r))),
                Cause::Both(l, r) => Cause::Both(Box::new(go(l)), Box::new(go(r))),
                Cause::Annotated(inner, note) => {
                    Cause::Annotated(Box::new(go(inner)), note.clone())
                }
            }
        }
        go(self)
    }

    /// Recover the typed failure when one exists; otherwise hand back a
    /// retyped cause (which at that point holds no `Fail` leaves).
    pub(crate) fn failure_or_retyped<E2>(self) -> Result<E, Cause<E2>> {
        fn retype<E, E2>(cause: Cause<E>) -> Result<Cause<E2>, E> {
            match cause {
                Cause::Fail(e) => Err(e),
                Cause::Die(d) => Ok(Cause::Die(d)),
                Cause::Interrupt(id) => Ok(Cause::Interrupt(id)),
                Cause::Then(l, r) => Ok(Cause::Then(
                    Box::new(retype(*l)?),
                    Box::new(retype(*r)?),
                )),
                Cause::Both(l, r) => Ok(Cause::Both(
                    Box::new(retype(*l)?),
                    Box::new(retype(*r)?),
                )),
                Cause::Annotated(inner, note) => {
                    Ok(Cause::Annotated(Box::new(retype(*inner)?), note))
                }
            }
        }
        match retype(self) {
            Ok(cause) => Err(cause),
            Err(e) => Ok(e),
        }
    }

    /// Render an indented multi-line description of the tree, including
    /// `@ note` annotation lines.
    pub fn render(&self) -> String
    where
        E: fmt::Debug,
    {
        fn go<E: fmt::Debug>(cause: &Cause<E>, indent: usize, out: &mut String) {
            let pad = "  ".repeat(indent);
            match cause {
                Cause::Fail(e) => {
                    out.push_str(&format!("{pad}Fail({e:?})\n"));
                }
                Cause::Die(d) => {
                    out.push_str(&format!("{pad}Die({})\n", d.message()));
                }
                Cause::Interrupt(None) => {
                    out.push_str(&format!("{pad}Interrupt\n"));
                }
                Cause::Interrupt(Some(id)) => {
                    out.push_str(&format!("{pad}Interrupt({id})\n"));
                }
                Cause::Then(l, r) => {
                    out.push_str(&format!("{pad}Then:\n"));
                    go(l, indent + 1, out);
                    go(r, indent + 1, out);
                }
                Cause::Both(l, r) => {
                    out.push_str(&format!("{pad}Both:\n"));
                    go(l, indent + 1, out);
                    go(r, indent + 1, out);
                }
                Cause::Annotated(inner, note) => {
                    out.push_str(&format!("{pad}@ {note}\n"));
                    go(inner, indent, out);
                }
            }
        }
        let mut out = String::new();
        go(self, 0, &mut out);
        out
    }
}

impl<E> Cause<E> {
    /// Widen a cause that provably carries no typed failures.
    pub fn from_infallible(cause: Cause<Infallible>) -> Cause<E> {
        match cause {
            Cause::Fail(never) => match never {},
            Cause::Die(d) => Cause::Die(d),
            Cause::Interrupt(id) => Cause::Interrupt(id),
            Cause::Then(l, r) => Cause::Then(
                Box::new(Cause::from_infallible(*l)),
                Box::new(Cause::from_infallible(*r)),
            ),
            Cause::Both(l, r) => Cause::Both(
                Box::new(Cause::from_infallible(*l)),
                Box::new(Cause::from_infallible(*r)),
            ),
            Cause::Annotated(inner, note) => {
                Cause::Annotated(Box::new(Cause::from_infallible(*inner)), note)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn kind_queries_look_through_annotations() {
        let cause: Cause<&str> = Cause::fail("boom").annotate("while saving");
        assert!(cause.is_fail());
        assert!(!cause.is_die());
        assert!(!cause.is_interrupt());
    }

    #[test]
    fn composite_kinds_report_any_leaf() {
        let cause: Cause<&str> = Cause::then(Cause::fail("boom"), Cause::die("cleanup blew up"));
        assert!(cause.is_fail());
        assert!(cause.is_die());
        assert!(!cause.is_interrupted_only());

        let interrupts: Cause<&str> = Cause::both(Cause::interrupt(), Cause::interrupt());
        assert!(interrupts.is_interrupted_only());
    }

    #[test]
    fn squash_prefers_typed_failures() {
        let cause: Cause<&str> = Cause::both(Cause::die("bug"), Cause::fail("boom"));
        assert_eq!(cause.squash(), Squashed::Fail(&"boom"));

        let cause: Cause<&str> = Cause::both(Cause::interrupt(), Cause::die("bug"));
        assert!(matches!(cause.squash(), Squashed::Die(_)));
    }

    #[test]
    fn render_includes_annotations_and_structure() {
        let cause: Cause<&str> = Cause::then(Cause::fail("boom"), Cause::die("late"))
            .annotate("request 42");
        let rendered = cause.render();
        assert!(rendered.contains("@ request 42"));
        assert!(rendered.contains("Then:"));
        assert!(rendered.contains("Fail(\"boom\")"));
        assert!(rendered.contains("Die(late)"));
    }

    #[test]
    fn failure_or_retyped_recovers_first_failure() {
        let cause: Cause<&str> = Cause::fail("first").annotate("ctx");
        assert_eq!(cause.failure_or_retyped::<String>().ok(), Some("first"));

        let cause: Cause<&str> = Cause::then(Cause::die("bug"), Cause::interrupt());
        assert!(cause.failure_or_retyped::<String>().is_err());
    }
}
