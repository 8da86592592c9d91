//! Layers: composable, scoped builders of service environments.
//!
//! A [`Layer`] knows how to extend a [`Context`] with services and how
//! to release them: every release it schedules lands on the [`Scope`]
//! it is built against. Layers compose sequentially with `+` (the right
//! side sees the left side's services) and in parallel with `|`
//! (independent builds, right wins on conflicts). On a partial failure
//! during a composite build, the finalizers of every successfully-built
//! sub-layer run before the error propagates.

use std::future::Future;
use std::sync::Arc;

use crate::context::Context;
use crate::effect::BoxFuture;
use crate::scope::Scope;

/// An error produced while building a layer.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LayerError {
    message: String,
}

impl LayerError {
    /// Create a build error from a message.
    pub fn new(message: impl Into<String>) -> Self {
        LayerError {
            message: message.into(),
        }
    }

    /// The error's message.
    pub fn message(&self) -> &str {
        &self.message
    }
}

impl std::fmt::Display for LayerError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.message)
    }
}

impl std::error::Error for LayerError {}

impl From<&str> for LayerError {
    fn from(message: &str) -> Self {
        LayerError::new(message)
    }
}

impl From<String> for LayerError {
    fn from(message: String) -> Self {
        LayerError { message }
    }
}

type LayerBuild =
    Arc<dyn Fn(Context, Arc<Scope>) -> BoxFuture<'static, Result<Context, LayerError>> + Send + Sync>;

/// A scoped builder of services.
///
/// # Examples
///
/// ```
/// use millrace::{Context, Layer, LayerError, Scope};
/// use std::sync::Arc;
///
/// struct Pool {
///     size: usize,
/// }
///
/// # tokio_test::block_on(async {
/// let layer = Layer::from_resource(
///     |_ctx| async { Ok::<_, LayerError>(Pool { size: 4 }) },
///     |_pool| async {},
/// );
///
/// let scope = Arc::new(Scope::new());
/// let ctx = layer.build_scoped(&Context::new(), &scope).await.unwrap();
/// assert_eq!(ctx.get::<Pool>().unwrap().size, 4);
/// scope.close().await;
/// # });
/// ```
#[derive(Clone)]
pub struct Layer {
    build: LayerBuild,
}

impl Layer {
    /// Build a layer from a raw build function. Releases belong on the
    /// scope the function receives.
    pub fn from_build<F, Fut>(f: F) -> Layer
    where
        F: Fn(Context, Arc<Scope>) -> Fut + Send + Sync + 'static,
        Fut: Future<Output = Result<Context, LayerError>> + Send + 'static,
    {
        Layer {
            build: Arc::new(move |ctx, scope| Box::pin(f(ctx, scope))),
        }
    }

    /// A layer acquiring one service and registering its release.
    pub fn from_resource<T, Mk, MkFut, Cl, ClFut>(make: Mk, close: Cl) -> Layer
    where
        T: Send + Sync + 'static,
        Mk: Fn(Context) -> MkFut + Send + Sync + 'static,
        MkFut: Future<Output = Result<T, LayerError>> + Send + 'static,
        Cl: Fn(Arc<T>) -> ClFut + Clone + Send + Sync + 'static,
        ClFut: Future<Output = ()> + Send + 'static,
    {
        Layer::from_build(move |parent: Context, scope: Arc<Scope>| {
            let making = make(parent.clone());
            let close = close.clone();
            async move {
                let service = Arc::new(making.await?);
                let releasing = service.clone();
                scope.add_finalizer(move || close(releasing)).await;
                Ok(parent.add_shared(service))
            }
        })
    }

    /// A layer injecting an already-constructed service.
    pub fn from_value<T: Send + Sync + 'static>(service: T) -> Layer {
        let shared = Arc::new(service);
        Layer::from_build(move |parent: Context, _scope: Arc<Scope>| {
            let service = shared.clone();
            async move { Ok(parent.add_shared(service)) }
        })
    }

    /// Build this layer's services into a new context, scheduling every
    /// release on `scope`. This is the primary operator; composition and
    /// [`Effect::provide`](crate::Effect::provide) go through it.
    pub async fn build_scoped(
        &self,
        parent: &Context,
        scope: &Arc<Scope>,
    ) -> Result<Context, LayerError> {
        (self.build)(parent.clone(), scope.clone()).await
    }
}

impl std::fmt::Debug for Layer {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Layer").finish()
    }
}

/// Register `child`'s close on `parent` so nested releases cascade in
/// LIFO order. Child closes are idempotent, so an eager close on the
/// failure path is safe.
async fn register_child_scope(parent: &Arc<Scope>, child: &Arc<Scope>) {
    let closing = child.clone();
    parent
        .add_finalizer(move || async move {
            let _ = closing.close().await;
        })
        .await;
}

impl std::ops::Add for Layer {
    type Output = Layer;

    /// Sequential composition: build `self`, then `rhs` with access to
    /// `self`'s services. If `rhs` fails, `self`'s releases run before
    /// the error propagates.
    fn add(self, rhs: Layer) -> Layer {
        let left = self;
        let right = rhs;
        Layer::from_build(move |parent: Context, scope: Arc<Scope>| {
            let left = left.clone();
            let right = right.clone();
            async move {
                let left_scope = Arc::new(Scope::new());
                register_child_scope(&scope, &left_scope).await;
                let mid = match left.build_scoped(&parent, &left_scope).await {
                    Ok(mid) => mid,
                    Err(error) => {
                        let _ = left_scope.close().await;
                        return Err(error);
                    }
                };

                let right_scope = Arc::new(Scope::new());
                register_child_scope(&scope, &right_scope).await;
                match right.build_scoped(&mid, &right_scope).await {
                    Ok(built) => Ok(built),
                    Err(error) => {
                        let _ = right_scope.close().await;
                        let _ = left_scope.close().await;
                        Err(error)
                    }
                }
            }
        })
    }
}

impl std::ops::BitOr for Layer {
    type Output = Layer;

    /// Parallel composition: both sides build concurrently against the
    /// same parent; service conflicts resolve in favor of the right
    /// side. On partial failure the surviving side's finalizers run
    /// before the composite error propagates.
    fn bitor(self, rhs: Layer) -> Layer {
        let left = self;
        let right = rhs;
        Layer::from_build(move |parent: Context, scope: Arc<Scope>| {
            let left = left.clone();
            let right = right.clone();
            async move {
                let left_scope = Arc::new(Scope::new());
                let right_scope = Arc::new(Scope::new());
                register_child_scope(&scope, &left_scope).await;
                register_child_scope(&scope, &right_scope).await;

                let (left_built, right_built) = tokio::join!(
                    left.build_scoped(&parent, &left_scope),
                    right.build_scoped(&parent, &right_scope)
                );

                match (left_built, right_built) {
                    (Ok(left_ctx), Ok(right_ctx)) => Ok(left_ctx.merge_services(&right_ctx)),
                    (Err(error), Ok(_)) => {
                        let _ = tokio::join!(left_scope.close(), right_scope.close());
                        Err(error)
                    }
                    (Ok(_), Err(error)) => {
                        let _ = tokio::join!(left_scope.close(), right_scope.close());
                        Err(error)
                    }
                    (Err(error), Err(_)) => {
                        let _ = tokio::join!(left_scope.close(), right_scope.close());
                        Err(error)
                    }
                }
            }
        })
    }
}
