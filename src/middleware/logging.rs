use std::sync::Arc;
use std::time::{Duration, Instant};

use http::header::CONTENT_TYPE;

use crate::handler::{BoxFuture, BoxedHandler, ErasedHandler, MetaFunc};
use crate::logging::{Meta, RequestLogger};
use crate::metrics::duration_in;
use crate::request::Request;
use crate::response::Response;

const MILLISECOND: Duration = Duration::from_millis(1);

pub(super) fn wrap(meta_func: MetaFunc, next: BoxedHandler) -> BoxedHandler {
    Arc::new(RequestLogging { meta_func, next })
}

/// Logs `ApiRequest` when a request arrives and `ApiResponse` once the inner
/// handler has answered.
struct RequestLogging {
    meta_func: MetaFunc,
    next: BoxedHandler,
}

impl ErasedHandler for RequestLogging {
    fn call(&self, req: Request) -> BoxFuture {
        let meta_func = Arc::clone(&self.meta_func);
        let next = Arc::clone(&self.next);
        Box::pin(async move {
            let mut meta = meta_func(&req);
            meta.merge(&request_meta(&req));
            let logger = req.utils().logger_with_meta(&req, &meta);
            let line = format!("{} {}", req.method(), req.url());
            logger.info("ApiRequest", &line);

            let start = Instant::now();
            let res = next.call(req).await;
            let millis = format!("{:.3}", duration_in(start.elapsed(), MILLISECOND));

            let mut meta = logger.meta().clone();
            meta.merge(&response_meta(&res, &millis));
            RequestLogger::new(meta).info(
                "ApiResponse",
                format_args!(
                    "{line} finished. Duration: {millis}ms. Status: {}, ContentType: {}",
                    res.status_code().as_u16(),
                    res.header(CONTENT_TYPE.as_str()).unwrap_or_default(),
                ),
            );
            res
        })
    }
}

fn request_meta(req: &Request) -> Meta {
    let mut meta = Meta::new();
    meta.insert_entry("http.method", req.method().as_str());
    meta.insert_entry("http.host", req.host());
    meta.insert_entry("http.url", req.request_uri());
    meta.insert_entry("http.query", req.query().unwrap_or_default());
    meta.insert_entry("http.route", req.route().unwrap_or_default());
    meta.insert_entry("http.scheme", req.scheme());
    meta.insert_entry("request", format!("{} {}", req.method(), req.url()));
    meta
}

/// Status, duration and the headers the response carries. Request headers
/// are never logged; they hold credentials.
fn response_meta(res: &Response, millis: &str) -> Meta {
    let mut meta = Meta::new();
    meta.insert_entry("statuscode", res.status_code().as_u16().to_string());
    meta.insert_entry("duration", millis);
    for name in res.headers().keys() {
        if let Some(value) = res.header(name.as_str()) {
            meta.insert_entry(&format!("http.header.{name}"), value);
        }
    }
    meta
}
