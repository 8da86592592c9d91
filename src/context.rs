//! The service container: an immutable, type-indexed dictionary.
//!
//! A [`Context`] maps service types to shared instances. `add` returns a
//! new container; the original is never mutated, so contexts are safe to
//! share across fibers by construction. The context also threads the
//! crate's evaluation state (current scope, interrupt token, and
//! fiber-locals) so effects can reach them without ambient globals.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::sync::Arc;

use crate::cause::Cause;
use crate::effect::Effect;
use crate::exit::Exit;
use crate::fiber::InterruptToken;
use crate::fiber_local::FiberLocals;
use crate::scope::Scope;

type ServiceMap = HashMap<TypeId, Arc<dyn Any + Send + Sync>>;

/// An immutable type-indexed service container.
///
/// # Examples
///
/// ```
/// use millrace::Context;
///
/// struct Database {
///     url: String,
/// }
///
/// let base = Context::new();
/// let ctx = base.add(Database { url: "postgres://localhost".into() });
///
/// assert!(base.get::<Database>().is_none());
/// assert_eq!(ctx.get::<Database>().unwrap().url, "postgres://localhost");
/// ```
#[derive(Clone)]
pub struct Context {
    services: Arc<ServiceMap>,
    scope: Option<Arc<Scope>>,
    interrupt: InterruptToken,
    locals: FiberLocals,
}

impl Context {
    /// An empty container.
    pub fn new() -> Self {
        Context {
            services: Arc::new(HashMap::new()),
            scope: None,
            interrupt: InterruptToken::new(None),
            locals: FiberLocals::new(),
        }
    }

    /// A new container that also holds `service`.
    pub fn add<T: Send + Sync + 'static>(&self, service: T) -> Context {
        self.add_shared(Arc::new(service))
    }

    /// A new container that also holds an already-shared `service`.
    pub fn add_shared<T: Send + Sync + 'static>(&self, service: Arc<T>) -> Context {
        let mut services = (*self.services).clone();
        services.insert(TypeId::of::<T>(), service as Arc<dyn Any + Send + Sync>);
        Context {
            services: Arc::new(services),
            ..self.clone()
        }
    }

    /// Look up a service by type.
    pub fn get<T: Send + Sync + 'static>(&self) -> Option<Arc<T>> {
        self.services
            .get(&TypeId::of::<T>())
            .cloned()
            .and_then(|service| service.downcast::<T>().ok())
    }

    /// True when a service of type `T` is present.
    pub fn contains<T: Send + Sync + 'static>(&self) -> bool {
        self.services.contains_key(&TypeId::of::<T>())
    }

    /// The scope resources acquired here will be released into, if one
    /// is installed.
    pub fn current_scope(&self) -> Option<Arc<Scope>> {
        self.scope.clone()
    }

    pub(crate) fn with_scope(&self, scope: Arc<Scope>) -> Context {
        Context {
            scope: Some(scope),
            ..self.clone()
        }
    }

    pub(crate) fn interrupt_token(&self) -> &InterruptToken {
        &self.interrupt
    }

    pub(crate) fn with_interrupt(&self, interrupt: InterruptToken) -> Context {
        Context {
            interrupt,
            ..self.clone()
        }
    }

    pub(crate) fn locals(&self) -> &FiberLocals {
        &self.locals
    }

    pub(crate) fn with_locals(&self, locals: FiberLocals) -> Context {
        Context {
            locals,
            ..self.clone()
        }
    }

    /// Union of two containers' services, with `other` winning conflicts.
    /// Evaluation state comes from `self`.
    pub(crate) fn merge_services(&self, other: &Context) -> Context {
        let mut services = (*self.services).clone();
        for (key, value) in other.services.iter() {
            services.insert(*key, value.clone());
        }
        Context {
            services: Arc::new(services),
            ..self.clone()
        }
    }
}

impl Default for Context {
    fn default() -> Self {
        Context::new()
    }
}

impl std::fmt::Debug for Context {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Context")
            .field("services", &self.services.len())
            .field("scoped", &self.scope.is_some())
            .finish()
    }
}

/// An effect that resolves a service from the context. A missing service
/// is a defect, not a typed failure: the environment is assembled by
/// layers, and a hole in it is a wiring bug.
pub fn service<T, E>() -> Effect<Arc<T>, E>
where
    T: Send + Sync + 'static,
    E: Send + 'static,
{
    Effect::from_run(move |ctx| {
        Box::pin(async move {
            match ctx.get::<T>() {
                Some(service) => Exit::Success(service),
                None => Exit::Failure(Cause::die(format!(
                    "missing service: {}",
                    std::any::type_name::<T>()
                ))),
            }
        })
    })
}
