//! Counter, Histogram and RequestMetrics middleware.
//!
//! All three label their instruments with the same set:
//! `app`, `server`, `env`, `status`, `method`, `route`, `version`, `subsystem`.
//! `method` is lowercased and `route` is the lowercased route name.

use std::sync::Arc;
use std::time::{Duration, Instant};

use http::{Method, StatusCode};

use crate::config::ServiceGlobals;
use crate::handler::{BoxFuture, BoxedHandler, ErasedHandler};
use crate::metrics::{Labels, duration_in};
use crate::request::Request;

const MILLISECOND: Duration = Duration::from_millis(1);
const MICROSECOND: Duration = Duration::from_micros(1);
const SECOND: Duration = Duration::from_secs(1);

/// Status recorded before the handler has answered: what a response starts as.
const PENDING_STATUS: StatusCode = StatusCode::OK;

/// Route-level label values fixed at wrap time.
pub(crate) struct LabelContext {
    globals: Arc<ServiceGlobals>,
    subsystem: String,
    route: String,
}

impl LabelContext {
    pub(crate) fn new(globals: Arc<ServiceGlobals>, subsystem: &str, route: &str) -> Self {
        Self { globals, subsystem: subsystem.to_owned(), route: route.to_lowercase() }
    }

    fn labels(&self, status: StatusCode, method: &Method) -> Labels {
        vec![
            ("app", self.globals.app_name.clone()),
            ("server", self.globals.server_name.clone()),
            ("env", self.globals.deploy_environment.clone()),
            ("status", status.as_u16().to_string()),
            ("method", method.as_str().to_lowercase()),
            ("route", self.route.clone()),
            ("version", self.globals.version_number.clone()),
            ("subsystem", self.subsystem.clone()),
        ]
    }
}

// ── Counter ───────────────────────────────────────────────────────────────────

struct Counter {
    ctx: Arc<LabelContext>,
    name: Arc<str>,
    help: Arc<str>,
    next: BoxedHandler,
}

pub(super) fn counter(ctx: Arc<LabelContext>, next: BoxedHandler) -> BoxedHandler {
    let name = format!("{}_total", ctx.route);
    let help = format!("Totals for {}.", ctx.route);
    Arc::new(Counter { ctx, name: name.into(), help: help.into(), next })
}

impl ErasedHandler for Counter {
    fn call(&self, req: Request) -> BoxFuture {
        let ctx = Arc::clone(&self.ctx);
        let name = Arc::clone(&self.name);
        let help = Arc::clone(&self.help);
        let next = Arc::clone(&self.next);
        Box::pin(async move {
            let method = req.method().clone();
            let utils = req.utils().clone();
            let res = next.call(req).await;
            // Per-route totals share one name across listeners; the label
            // tells them apart.
            utils
                .metrics()
                .count_labels("", &name, &help, &ctx.labels(res.status_code(), &method));
            res
        })
    }
}

// ── Histogram ─────────────────────────────────────────────────────────────────

struct Histogram {
    ctx: Arc<LabelContext>,
    histogram_name: Arc<str>,
    summary_name: Arc<str>,
    help: Arc<str>,
    next: BoxedHandler,
}

pub(super) fn histogram(ctx: Arc<LabelContext>, next: BoxedHandler) -> BoxedHandler {
    let histogram_name = format!("{}_duration_milliseconds", ctx.route);
    let summary_name = format!("{}_duration_microseconds", ctx.route);
    let help = format!("Request durations for {}.", ctx.route);
    Arc::new(Histogram {
        ctx,
        histogram_name: histogram_name.into(),
        summary_name: summary_name.into(),
        help: help.into(),
        next,
    })
}

impl ErasedHandler for Histogram {
    fn call(&self, req: Request) -> BoxFuture {
        let ctx = Arc::clone(&self.ctx);
        let histogram_name = Arc::clone(&self.histogram_name);
        let summary_name = Arc::clone(&self.summary_name);
        let help = Arc::clone(&self.help);
        let next = Arc::clone(&self.next);
        Box::pin(async move {
            let method = req.method().clone();
            let utils = req.utils().clone();
            let start = Instant::now();
            let res = next.call(req).await;
            let elapsed = start.elapsed();

            let labels = ctx.labels(res.status_code(), &method);
            let metrics = utils.metrics();
            metrics.observe_histogram(&ctx.subsystem, &histogram_name, &help, &labels, duration_in(elapsed, MILLISECOND));
            metrics.observe_summary(&ctx.subsystem, &summary_name, &help, &labels, duration_in(elapsed, MICROSECOND));
            res
        })
    }
}

// ── RequestMetrics ────────────────────────────────────────────────────────────

struct RequestMetrics {
    ctx: Arc<LabelContext>,
    next: BoxedHandler,
}

pub(super) fn request_metrics(ctx: Arc<LabelContext>, next: BoxedHandler) -> BoxedHandler {
    Arc::new(RequestMetrics { ctx, next })
}

impl ErasedHandler for RequestMetrics {
    fn call(&self, req: Request) -> BoxFuture {
        let ctx = Arc::clone(&self.ctx);
        let next = Arc::clone(&self.next);
        Box::pin(async move {
            let method = req.method().clone();
            let utils = req.utils().clone();
            let metrics = utils.metrics();

            metrics.count_labels(
                "",
                "http_requests_total",
                "How many HTTP requests processed, partitioned by status code and HTTP method.",
                &ctx.labels(PENDING_STATUS, &method),
            );

            let start = Instant::now();
            let res = next.call(req).await;
            let elapsed = start.elapsed();

            let labels = ctx.labels(res.status_code(), &method);
            metrics.observe_histogram(
                "",
                "http_request_duration_seconds",
                "The HTTP request latencies in seconds.",
                &labels,
                duration_in(elapsed, SECOND),
            );
            metrics.observe_summary(
                "",
                "http_request_duration_microseconds",
                "The HTTP request latencies in microseconds.",
                &labels,
                duration_in(elapsed, MICROSECOND),
            );
            metrics.count_labels(
                "",
                "http_responses_total",
                "How many HTTP responses sent, partitioned by status code and HTTP method.",
                &labels,
            );
            res
        })
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::handler::{Handler, HandlerUtils, empty_meta};
    use crate::metrics::{Metrics, PrometheusMetrics};
    use crate::middleware::Middleware;
    use crate::middleware::tests::wrapper;

    fn request(utils: &HandlerUtils, method: Method, path: &str) -> Request {
        let req: Request = http::Request::builder()
            .method(method)
            .uri(path)
            .body(Bytes::new())
            .unwrap()
            .into();
        req.with_utils(utils.clone())
    }

    fn utils() -> (Arc<PrometheusMetrics>, HandlerUtils) {
        let metrics = Arc::new(PrometheusMetrics::new("orders").unwrap());
        let utils = HandlerUtils::new(empty_meta(), metrics.clone(), Arc::new(ServiceGlobals::default()));
        (metrics, utils)
    }

    #[tokio::test]
    async fn counter_labels_with_final_status() {
        let (metrics, utils) = utils();
        let handler = (|_req: Request| async { StatusCode::NOT_FOUND }).into_boxed_handler();
        let h = wrapper().wrap("public", "Lookup", Middleware::Counter, handler, &empty_meta());

        h.call(request(&utils, Method::POST, "/lookup")).await;

        let out = metrics.render();
        let line = out
            .lines()
            .find(|l| l.starts_with("orders_lookup_total{"))
            .expect("counter line");
        assert!(line.contains(r#"status="404""#), "{line}");
        assert!(line.contains(r#"method="post""#), "{line}");
        assert!(line.contains(r#"route="lookup""#), "{line}");
        assert!(line.contains(r#"subsystem="public""#), "{line}");
        assert!(line.contains(r#"app="orders""#), "{line}");
        assert!(line.ends_with(" 1"), "{line}");
    }

    #[tokio::test]
    async fn request_metrics_records_request_and_response() {
        let (metrics, utils) = utils();
        let handler = (|_req: Request| async { StatusCode::ACCEPTED }).into_boxed_handler();
        let h = wrapper().wrap("public", "do", Middleware::RequestMetrics, handler, &empty_meta());

        h.call(request(&utils, Method::GET, "/do")).await;

        let out = metrics.render();
        let requests = out.lines().find(|l| l.starts_with("orders_http_requests_total{")).expect("requests");
        assert!(requests.contains(r#"status="200""#), "{requests}");
        let responses = out.lines().find(|l| l.starts_with("orders_http_responses_total{")).expect("responses");
        assert!(responses.contains(r#"status="202""#), "{responses}");
        assert!(out.contains("orders_http_request_duration_seconds_bucket"));
        assert!(out.contains("orders_http_request_duration_microseconds{"));
    }

    #[tokio::test]
    async fn histogram_uses_subsystem_in_name() {
        let (metrics, utils) = utils();
        let handler = (|_req: Request| async { StatusCode::OK }).into_boxed_handler();
        let h = wrapper().wrap("internal", "do", Middleware::Histogram, handler, &empty_meta());

        h.call(request(&utils, Method::GET, "/do")).await;

        let out = metrics.render();
        assert!(out.contains("orders_internal_do_duration_milliseconds_bucket"));
        assert!(out.contains("orders_internal_do_duration_microseconds{"));
    }
}
