//! Middleware pipeline.
//!
//! Every route handler is wrapped in the middleware listed for its route.
//! Each [`Middleware`] value names one behaviour; [`MiddlewareWrapper::wrap`]
//! turns a handler into a new handler that applies that behaviour around it.
//!
//! # Wrap order is not execution order
//!
//! [`MiddlewareWrapper::compose`] folds the list left to right, each wrap
//! enclosing the previous result:
//!
//! ```text
//! [m1, m2, m3]  →  m3( m2( m1( handler ) ) )
//! ```
//!
//! The **last** listed middleware runs first (outermost) and the **first**
//! listed runs last, right before the handler. `PanicTo500` therefore belongs
//! at the end of any list that also logs or records metrics, so failures in
//! those layers are caught too.
//!
//! Wrapping never runs anything: it only allocates the wrapper. All request
//! work happens when the returned handler's future is polled.

mod cors;
mod logging;
mod metrics;
mod recover;

use std::fmt;
use std::sync::Arc;

use chrono::{Months, Utc};
use http::header::{CACHE_CONTROL, EXPIRES, HeaderValue, LAST_MODIFIED};
use http::StatusCode;
use tracing::warn;

use crate::config::ServiceGlobals;
use crate::handler::{BoxFuture, BoxedHandler, ErasedHandler, MetaFunc};
use crate::request::Request;
use crate::response::Response;

pub use cors::CorsOptions;

use cors::CorsPolicy;

/// Caller-supplied authorization predicate. `false` answers `401`.
pub type AuthorizationFunc = Arc<dyn Fn(&Request) -> bool + Send + Sync + 'static>;

/// Named request-handling behaviours.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Middleware {
    /// Cross-origin policy; answers preflight requests itself.
    Cors,
    /// `Cache-Control`, `Last-Modified` and `Expires` headers forbidding caching.
    NoCaching,
    /// Per-route request counter, labelled with the response status.
    Counter,
    /// Per-route duration histogram and summary.
    Histogram,
    /// Turns a panic anywhere inside into a logged `500`.
    PanicTo500,
    /// One log line when the request starts, one when it finishes.
    RequestLogging,
    /// Aggregate request/response counters and durations.
    RequestMetrics,
    /// Runs the [`AuthorizationFunc`]; `401` on refusal.
    Authorize,
    /// A code outside the known set. Wrapping with it is a no-op.
    Unrecognized(u8),
}

impl Middleware {
    /// Stable numeric code, as used in configuration files.
    pub fn code(self) -> u8 {
        match self {
            Self::Cors => 1,
            Self::NoCaching => 2,
            Self::Counter => 3,
            Self::Histogram => 4,
            Self::PanicTo500 => 5,
            Self::RequestLogging => 6,
            Self::RequestMetrics => 7,
            Self::Authorize => 8,
            Self::Unrecognized(code) => code,
        }
    }
}

impl From<u8> for Middleware {
    fn from(code: u8) -> Self {
        match code {
            1 => Self::Cors,
            2 => Self::NoCaching,
            3 => Self::Counter,
            4 => Self::Histogram,
            5 => Self::PanicTo500,
            6 => Self::RequestLogging,
            7 => Self::RequestMetrics,
            8 => Self::Authorize,
            other => Self::Unrecognized(other),
        }
    }
}

impl fmt::Display for Middleware {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Unrecognized(code) => write!(f, "Unrecognized({code})"),
            other => fmt::Debug::fmt(other, f),
        }
    }
}

// ── MiddlewareWrapper ─────────────────────────────────────────────────────────

/// Builds wrapped handlers for one service.
pub struct MiddlewareWrapper {
    globals: Arc<ServiceGlobals>,
    cors: CorsPolicy,
    authorize: Option<AuthorizationFunc>,
}

impl MiddlewareWrapper {
    pub fn new(globals: Arc<ServiceGlobals>, cors: CorsOptions, authorize: Option<AuthorizationFunc>) -> Self {
        Self { globals, cors: CorsPolicy::new(cors), authorize }
    }

    /// Wraps `next` with one middleware.
    ///
    /// Unrecognized middleware are logged and leave `next` unwrapped; the
    /// route keeps working without that behaviour.
    pub fn wrap(
        &self,
        subsystem: &str,
        name: &str,
        middleware: Middleware,
        next: BoxedHandler,
        meta_func: &MetaFunc,
    ) -> BoxedHandler {
        match middleware {
            Middleware::Cors => cors::wrap(&self.cors, next),
            Middleware::NoCaching => Arc::new(NoCache { next }),
            Middleware::Counter => metrics::counter(self.labels(subsystem, name), next),
            Middleware::Histogram => metrics::histogram(self.labels(subsystem, name), next),
            Middleware::PanicTo500 => recover::wrap(Arc::clone(meta_func), next),
            Middleware::RequestLogging => logging::wrap(Arc::clone(meta_func), next),
            Middleware::RequestMetrics => metrics::request_metrics(self.labels(subsystem, name), next),
            Middleware::Authorize => match &self.authorize {
                Some(check) => Arc::new(Authorize { check: Arc::clone(check), next }),
                None => {
                    warn!(subsystem, route = name, "Authorize requested but no authorization function configured, denying all requests");
                    Arc::new(Authorize { check: Arc::new(|_: &Request| false), next })
                }
            },
            Middleware::Unrecognized(code) => {
                warn!(subsystem, route = name, code, "unhandled middleware, leaving handler unwrapped");
                next
            }
        }
    }

    /// Applies `middlewares` in list order; the last one ends up outermost.
    pub fn compose(
        &self,
        subsystem: &str,
        name: &str,
        middlewares: &[Middleware],
        handler: BoxedHandler,
        meta_func: &MetaFunc,
    ) -> BoxedHandler {
        middlewares
            .iter()
            .fold(handler, |next, m| self.wrap(subsystem, name, *m, next, meta_func))
    }

    fn labels(&self, subsystem: &str, name: &str) -> Arc<metrics::LabelContext> {
        Arc::new(metrics::LabelContext::new(Arc::clone(&self.globals), subsystem, name))
    }
}

// ── NoCaching ─────────────────────────────────────────────────────────────────

struct NoCache {
    next: BoxedHandler,
}

impl ErasedHandler for NoCache {
    fn call(&self, req: Request) -> BoxFuture {
        let next = Arc::clone(&self.next);
        Box::pin(async move {
            let mut res = next.call(req).await;
            apply_no_cache(&mut res);
            res
        })
    }
}

const HTTP_DATE: &str = "%a, %d %b %Y %H:%M:%S GMT";

/// Headers a handler set itself are kept.
fn apply_no_cache(res: &mut Response) {
    let now = Utc::now();
    let expired = now.checked_sub_months(Months::new(12)).unwrap_or(now);
    let headers = res.headers_mut();

    headers
        .entry(CACHE_CONTROL)
        .or_insert(HeaderValue::from_static("max-age: 0, private"));
    if let Ok(v) = HeaderValue::try_from(now.format(HTTP_DATE).to_string()) {
        headers.entry(LAST_MODIFIED).or_insert(v);
    }
    if let Ok(v) = HeaderValue::try_from(expired.format(HTTP_DATE).to_string()) {
        headers.entry(EXPIRES).or_insert(v);
    }
}

// ── Authorize ─────────────────────────────────────────────────────────────────

struct Authorize {
    check: AuthorizationFunc,
    next: BoxedHandler,
}

impl ErasedHandler for Authorize {
    fn call(&self, req: Request) -> BoxFuture {
        let check = Arc::clone(&self.check);
        let next = Arc::clone(&self.next);
        Box::pin(async move {
            if !check(&req) {
                return Response::status(StatusCode::UNAUTHORIZED);
            }
            next.call(req).await
        })
    }
}
