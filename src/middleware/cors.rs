//! Cross-origin resource sharing, on top of `tower_http::cors`.
//!
//! The caller's [`CorsOptions`] are merged with fixed defaults into one
//! [`CorsLayer`]. The wrapped handler chain is adapted into a
//! `tower::Service` so the layer can sit in the pipeline like any other
//! middleware. `OPTIONS` requests are answered by the layer and never reach
//! the handler. Actual requests from an origin the policy refuses get `403`.

use std::convert::Infallible;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;
use http::header::{HeaderName, HeaderValue, ORIGIN, VARY};
use http::{Method, StatusCode};
use tower::{Layer, Service, ServiceExt};
use tower_http::cors::{AllowHeaders, AllowMethods, AllowOrigin, CorsLayer, ExposeHeaders};
use tracing::{debug, warn};

use crate::handler::{BoxFuture, BoxedHandler, ErasedHandler};
use crate::request::Request;
use crate::response::Response;

const DEFAULT_ALLOWED_METHODS: &[&str] = &["HEAD", "OPTIONS"];

const DEFAULT_ALLOWED_HEADERS: &[&str] = &["Origin", "Accept", "Content-Type", "X-Requested-With", "X-CSRF-Token"];

const DEFAULT_EXPOSED_HEADERS: &[&str] = &[
    "Access-Control-Allow-Headers",
    "Access-Control-Allow-Methods",
    "Access-Control-Max-Age",
    "Access-Control-Allow-Credentials",
    "Access-Control-Allow-Origin",
];

/// Caller-facing CORS settings, merged with fixed defaults when the
/// pipeline is built.
#[derive(Clone, Debug)]
pub struct CorsOptions {
    /// Exact origins, `*`, or patterns with one `*` such as `https://*.example.com`.
    pub allowed_origins: Vec<String>,
    pub allowed_methods: Vec<String>,
    pub allowed_headers: Vec<String>,
    pub exposed_headers: Vec<String>,
    /// Seconds a preflight answer may be cached. `0` omits the header.
    pub max_age: u32,
}

impl Default for CorsOptions {
    fn default() -> Self {
        Self {
            allowed_origins: vec!["*".to_owned()],
            allowed_methods: vec!["GET".to_owned(), "POST".to_owned()],
            allowed_headers: Vec::new(),
            exposed_headers: Vec::new(),
            max_age: 0,
        }
    }
}

// ── Origins ───────────────────────────────────────────────────────────────────

#[derive(Debug)]
enum OriginPattern {
    Any,
    Exact(String),
    Wildcard { prefix: String, suffix: String },
}

impl OriginPattern {
    fn parse(raw: &str) -> Self {
        let raw = raw.trim().to_lowercase();
        if raw == "*" {
            return Self::Any;
        }
        match raw.split_once('*') {
            Some((prefix, suffix)) => Self::Wildcard { prefix: prefix.to_owned(), suffix: suffix.to_owned() },
            None => Self::Exact(raw),
        }
    }

    fn matches(&self, origin: &str) -> bool {
        match self {
            Self::Any => true,
            Self::Exact(o) => o == origin,
            Self::Wildcard { prefix, suffix } => {
                origin.len() >= prefix.len() + suffix.len()
                    && origin.starts_with(prefix.as_str())
                    && origin.ends_with(suffix.as_str())
            }
        }
    }
}

#[derive(Debug)]
struct Origins(Vec<OriginPattern>);

impl Origins {
    fn new(raw: &[String]) -> Self {
        if raw.is_empty() {
            return Self(vec![OriginPattern::Any]);
        }
        Self(raw.iter().map(|o| OriginPattern::parse(o)).collect())
    }

    fn allows(&self, origin: &HeaderValue) -> bool {
        let Ok(origin) = origin.to_str() else { return false };
        let origin = origin.to_lowercase();
        self.0.iter().any(|p| p.matches(&origin))
    }
}

// ── Policy ────────────────────────────────────────────────────────────────────

/// The merged policy: a ready [`CorsLayer`] plus the origin check used to
/// refuse actual requests.
#[derive(Clone)]
pub(crate) struct CorsPolicy {
    layer: CorsLayer,
    origins: Arc<Origins>,
}

impl CorsPolicy {
    /// Methods always include `HEAD` and `OPTIONS`, headers the common
    /// request headers, and the `Access-Control-*` headers are always
    /// exposed. Credentials are allowed, so `*` lists are mirrored from the
    /// request instead of sent as a wildcard.
    pub(crate) fn new(options: CorsOptions) -> Self {
        let origins = Arc::new(Origins::new(&options.allowed_origins));

        let methods = merge(&options.allowed_methods, DEFAULT_ALLOWED_METHODS, str::to_uppercase);
        let allow_methods = if methods.iter().any(|m| m == "*") {
            AllowMethods::mirror_request()
        } else {
            AllowMethods::list(parse_all(&methods, |m| Method::from_bytes(m.as_bytes()).ok(), "method"))
        };

        let headers = merge(&options.allowed_headers, DEFAULT_ALLOWED_HEADERS, str::to_lowercase);
        let allow_headers = if headers.iter().any(|h| h == "*") {
            AllowHeaders::mirror_request()
        } else {
            AllowHeaders::list(parse_all(&headers, |h| HeaderName::try_from(h).ok(), "header"))
        };

        let exposed = merge(&options.exposed_headers, DEFAULT_EXPOSED_HEADERS, str::to_lowercase);
        let expose_headers = ExposeHeaders::list(parse_all(
            &exposed.into_iter().filter(|h| h != "*").collect::<Vec<_>>(),
            |h| HeaderName::try_from(h).ok(),
            "exposed header",
        ));

        let allowed = Arc::clone(&origins);
        let mut layer = CorsLayer::new()
            .allow_origin(AllowOrigin::predicate(move |origin: &HeaderValue, _: &http::request::Parts| {
                allowed.allows(origin)
            }))
            .allow_methods(allow_methods)
            .allow_headers(allow_headers)
            .expose_headers(expose_headers)
            .allow_credentials(true);
        if options.max_age > 0 {
            layer = layer.max_age(Duration::from_secs(u64::from(options.max_age)));
        }

        Self { layer, origins }
    }
}

/// `custom` followed by `defaults`, mapped through `normalize`, first
/// occurrence kept.
fn merge(custom: &[String], defaults: &[&str], normalize: fn(&str) -> String) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for item in custom.iter().map(|s| s.trim()).chain(defaults.iter().copied()) {
        let item = normalize(item);
        if !item.is_empty() && !out.contains(&item) {
            out.push(item);
        }
    }
    out
}

fn parse_all<T>(items: &[String], parse: impl Fn(&str) -> Option<T>, what: &str) -> Vec<T> {
    items
        .iter()
        .filter_map(|item| {
            let parsed = parse(item);
            if parsed.is_none() {
                warn!(value = %item, "ignoring invalid CORS {what}");
            }
            parsed
        })
        .collect()
}

// ── Pipeline adapter ──────────────────────────────────────────────────────────

/// The wrapped handler chain as a `tower::Service`. The tower request
/// carries the whole [`Request`] as its body, so path parameters and
/// utilities survive the trip through the layer.
#[derive(Clone)]
struct Inner(BoxedHandler);

impl Service<http::Request<Request>> for Inner {
    type Response = http::Response<Bytes>;
    type Error = Infallible;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Infallible>> + Send>>;

    fn poll_ready(&mut self, _cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        Poll::Ready(Ok(()))
    }

    fn call(&mut self, req: http::Request<Request>) -> Self::Future {
        let fut = self.0.call(req.into_body());
        Box::pin(async move { Ok(fut.await.into()) })
    }
}

pub(super) fn wrap(policy: &CorsPolicy, next: BoxedHandler) -> BoxedHandler {
    Arc::new(Cors {
        service: policy.layer.layer(Inner(next)),
        origins: Arc::clone(&policy.origins),
    })
}

struct Cors {
    service: tower_http::cors::Cors<Inner>,
    origins: Arc<Origins>,
}

impl ErasedHandler for Cors {
    fn call(&self, req: Request) -> BoxFuture {
        if req.method() != Method::OPTIONS {
            if let Some(origin) = req.headers().get(ORIGIN).filter(|o| !self.origins.allows(o)) {
                debug!(origin = ?origin, method = %req.method(), "cross-origin request refused");
                let mut res = Response::status(StatusCode::FORBIDDEN);
                res.headers_mut().append(VARY, HeaderValue::from_static("origin"));
                return Box::pin(async move { res });
            }
        }

        let service = self.service.clone();
        Box::pin(async move {
            match service.oneshot(into_tower(req)).await {
                Ok(res) => Response::from(res),
                Err(never) => match never {},
            }
        })
    }
}

fn into_tower(req: Request) -> http::Request<Request> {
    let (method, uri, headers) = (req.method().clone(), req.uri().clone(), req.headers().clone());
    let mut outer = http::Request::new(req);
    *outer.method_mut() = method;
    *outer.uri_mut() = uri;
    *outer.headers_mut() = headers;
    outer
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicBool, Ordering};

    use super::*;
    use crate::handler::Handler;

    fn policy(origins: &[&str]) -> CorsPolicy {
        CorsPolicy::new(CorsOptions {
            allowed_origins: origins.iter().map(|o| o.to_string()).collect(),
            allowed_methods: vec!["get".into(), "POST".into(), "GET".into()],
            ..Default::default()
        })
    }

    fn request(method: Method, headers: &[(&str, &str)]) -> Request {
        let mut b = http::Request::builder().method(method).uri("/do");
        for (k, v) in headers {
            b = b.header(*k, *v);
        }
        b.body(Bytes::new()).unwrap().into()
    }

    fn list(res: &Response, name: &str) -> Vec<String> {
        res.header(name)
            .unwrap_or_default()
            .split(',')
            .map(|s| s.trim().to_owned())
            .filter(|s| !s.is_empty())
            .collect()
    }

    fn recording() -> (BoxedHandler, Arc<AtomicBool>) {
        let called = Arc::new(AtomicBool::new(false));
        let seen = Arc::clone(&called);
        let handler = (move |_req: Request| {
            seen.store(true, Ordering::SeqCst);
            async { "ok" }
        })
        .into_boxed_handler();
        (handler, called)
    }

    #[test]
    fn merge_dedupes_and_appends_defaults() {
        let custom = vec!["get".to_owned(), "POST".to_owned(), "GET".to_owned()];
        assert_eq!(merge(&custom, DEFAULT_ALLOWED_METHODS, str::to_uppercase), ["GET", "POST", "HEAD", "OPTIONS"]);
    }

    #[test]
    fn wildcard_origin_pattern() {
        let origins = Origins::new(&["https://*.example.com".to_owned()]);
        assert!(origins.allows(&HeaderValue::from_static("https://api.example.com")));
        assert!(origins.allows(&HeaderValue::from_static("HTTPS://API.EXAMPLE.COM")));
        assert!(!origins.allows(&HeaderValue::from_static("https://example.org")));
        assert!(!origins.allows(&HeaderValue::from_static("http://api.example.com")));
    }

    #[tokio::test]
    async fn preflight_is_answered_without_calling_handler() {
        let (handler, called) = recording();
        let h = wrap(&policy(&["https://app.example"]), handler);

        let res = h
            .call(request(
                Method::OPTIONS,
                &[
                    ("origin", "https://app.example"),
                    ("access-control-request-method", "POST"),
                    ("access-control-request-headers", "content-type"),
                ],
            ))
            .await;

        assert_eq!(res.status_code(), StatusCode::OK);
        assert!(res.body().is_empty());
        assert_eq!(res.header("access-control-allow-origin"), Some("https://app.example"));
        assert_eq!(list(&res, "access-control-allow-methods"), ["GET", "POST", "HEAD", "OPTIONS"]);
        assert!(list(&res, "access-control-allow-headers").contains(&"content-type".to_owned()));
        assert_eq!(res.header("access-control-allow-credentials"), Some("true"));
        assert!(!called.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn preflight_from_disallowed_origin_has_no_allow_origin() {
        let (handler, called) = recording();
        let h = wrap(&policy(&["https://app.example"]), handler);
        let res = h
            .call(request(
                Method::OPTIONS,
                &[("origin", "https://evil.example"), ("access-control-request-method", "GET")],
            ))
            .await;
        assert_eq!(res.status_code(), StatusCode::OK);
        assert_eq!(res.header("access-control-allow-origin"), None);
        assert!(!called.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn any_origin_is_mirrored_with_credentials() {
        let (handler, _) = recording();
        let h = wrap(&policy(&["*"]), handler);
        let res = h.call(request(Method::GET, &[("origin", "https://app.example")])).await;

        assert_eq!(res.status_code(), StatusCode::OK);
        assert_eq!(res.body().as_ref(), b"ok");
        assert_eq!(res.header("access-control-allow-origin"), Some("https://app.example"));
        assert_eq!(res.header("access-control-allow-credentials"), Some("true"));
        assert!(list(&res, "access-control-expose-headers").contains(&"access-control-max-age".to_owned()));
    }

    #[tokio::test]
    async fn actual_request_from_disallowed_origin_is_forbidden() {
        let (handler, called) = recording();
        let h = wrap(&policy(&["https://app.example"]), handler);
        let res = h.call(request(Method::GET, &[("origin", "https://evil.example")])).await;
        assert_eq!(res.status_code(), StatusCode::FORBIDDEN);
        assert!(res.body().is_empty());
        assert!(!called.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn same_origin_request_passes_through() {
        let (handler, called) = recording();
        let h = wrap(&policy(&["https://app.example"]), handler);
        let res = h.call(request(Method::DELETE, &[])).await;
        assert_eq!(res.body().as_ref(), b"ok");
        assert_eq!(res.header("access-control-allow-origin"), None);
        assert!(called.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn request_extras_survive_the_layer() {
        let handler = (|req: Request| async move { req.param("id").unwrap_or("missing").to_owned() }).into_boxed_handler();
        let h = wrap(&policy(&["*"]), handler);
        let mut req = request(Method::GET, &[("origin", "https://app.example")]);
        req.set_match("/do/{id}", vec![("id".into(), "7".into())]);
        assert_eq!(h.call(req).await.body().as_ref(), b"7");
    }
}
