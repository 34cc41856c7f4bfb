//! Handler trait, type erasure and the per-route utilities handed to handlers.
//!
//! # How async handlers are stored
//!
//! A route table holds handlers of *different* types in one map, and the
//! middleware pipeline stacks wrappers of different types around them. Both
//! only work with **trait objects**: every handler and every middleware
//! wrapper is stored as a [`BoxedHandler`] (`Arc<dyn ErasedHandler>`).
//!
//! ```text
//! async fn hello(req: Request) -> Response { … }   ← user writes this
//!        ↓ service.add_route(…, hello)
//! hello.into_boxed_handler()                       ← Handler blanket impl
//!        ↓
//! Arc::new(FnHandler(hello))                       ← BoxedHandler
//!        ↓ Wrapper::wrap(…)                        ← zero or more times
//! Arc::new(NoCache { next })                       ← still a BoxedHandler
//!        ↓
//! handler.call(req)  at request time               ← one vtable call per layer
//! ```

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use crate::config::ServiceGlobals;
use crate::logging::{Meta, RequestLogger};
use crate::metrics::{Metrics, NoopMetrics};
use crate::request::Request;
use crate::response::{IntoResponse, Response};

// ── Erased handlers ───────────────────────────────────────────────────────────

/// A heap-allocated, type-erased future that resolves to a [`Response`].
pub type BoxFuture = Pin<Box<dyn Future<Output = Response> + Send + 'static>>;

/// Dispatch interface shared by terminal handlers and middleware wrappers.
///
/// `call` must not do request work itself beyond building the future; the
/// work happens when the returned future is polled.
pub trait ErasedHandler {
    fn call(&self, req: Request) -> BoxFuture;
}

/// A heap-allocated, type-erased handler shared across concurrent requests.
pub type BoxedHandler = Arc<dyn ErasedHandler + Send + Sync + 'static>;

// ── Public Handler trait ──────────────────────────────────────────────────────

/// Implemented for every valid route handler.
///
/// You never implement this yourself. It is automatically satisfied for any
/// `async fn` (or closure returning a future) with the signature:
///
/// ```text
/// async fn name(req: Request) -> impl IntoResponse
/// ```
pub trait Handler: private::Sealed + Send + Sync + 'static {
    fn into_boxed_handler(self) -> BoxedHandler;
}

mod private {
    pub trait Sealed {}
}

impl<F, Fut, R> private::Sealed for F
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
    R: IntoResponse + Send + 'static,
{
}

impl<F, Fut, R> Handler for F
where
    F: Fn(Request) -> Fut + Send + Sync + 'static,
    Fut: Future<Output = R> + Send + 'static,
    R: IntoResponse + Send + 'static,
{
    fn into_boxed_handler(self) -> BoxedHandler {
        Arc::new(FnHandler(self))
    }
}

/// Bridges a concrete handler function to the trait-object world.
struct FnHandler<F>(F);

impl<F, Fut, R> ErasedHandler for FnHandler<F>
where
    F: Fn(Request) -> Fut + Send + Sync,
    Fut: Future<Output = R> + Send + 'static,
    R: IntoResponse + Send + 'static,
{
    fn call(&self, req: Request) -> BoxFuture {
        let fut = (self.0)(req);
        Box::pin(async move { fut.await.into_response() })
    }
}

// ── Per-route utilities ───────────────────────────────────────────────────────

/// Produces free-form log metadata for one request.
pub type MetaFunc = Arc<dyn Fn(&Request) -> Meta + Send + Sync + 'static>;

/// A meta function that contributes nothing.
pub fn empty_meta() -> MetaFunc {
    Arc::new(|_: &Request| Meta::new())
}

/// Utilities a route table attaches to every request it dispatches.
///
/// Cheap to clone: everything inside is reference counted.
#[derive(Clone)]
pub struct HandlerUtils {
    meta_func: MetaFunc,
    metrics: Arc<dyn Metrics>,
    globals: Arc<ServiceGlobals>,
}

impl HandlerUtils {
    pub fn new(meta_func: MetaFunc, metrics: Arc<dyn Metrics>, globals: Arc<ServiceGlobals>) -> Self {
        Self { meta_func, metrics, globals }
    }

    /// The same utilities with a route-specific meta function.
    pub(crate) fn with_meta_func(&self, meta_func: MetaFunc) -> Self {
        Self { meta_func, ..self.clone() }
    }

    pub fn metrics(&self) -> &dyn Metrics {
        self.metrics.as_ref()
    }

    pub fn globals(&self) -> &ServiceGlobals {
        &self.globals
    }

    /// Runs the route's meta function.
    pub fn meta(&self, req: &Request) -> Meta {
        (self.meta_func)(req)
    }

    /// A logger carrying the service globals, the route's meta and `meta`,
    /// later sources overwriting earlier ones.
    pub fn logger_with_meta(&self, req: &Request, meta: &Meta) -> RequestLogger {
        let mut combined = self.globals.meta();
        combined.merge(&self.meta(req));
        combined.merge(meta);
        RequestLogger::new(combined)
    }
}

impl Default for HandlerUtils {
    fn default() -> Self {
        Self::new(empty_meta(), Arc::new(NoopMetrics), Arc::new(ServiceGlobals::default()))
    }
}
