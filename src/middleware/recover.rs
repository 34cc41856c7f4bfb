use std::any::Any;
use std::backtrace::Backtrace;
use std::panic::AssertUnwindSafe;
use std::sync::Arc;

use futures_util::FutureExt;
use http::StatusCode;

use crate::handler::{BoxFuture, BoxedHandler, ErasedHandler, MetaFunc};
use crate::request::Request;
use crate::response::Response;

pub(super) fn wrap(meta_func: MetaFunc, next: BoxedHandler) -> BoxedHandler {
    Arc::new(PanicTo500 { meta_func, next })
}

/// Catches a panic raised while the inner handler runs and answers `500`.
///
/// The panic is logged with the request's metadata and a backtrace under the
/// `PanicAutorecover` event. Nothing is written to the response body.
struct PanicTo500 {
    meta_func: MetaFunc,
    next: BoxedHandler,
}

impl ErasedHandler for PanicTo500 {
    fn call(&self, req: Request) -> BoxFuture {
        let meta_func = Arc::clone(&self.meta_func);
        let next = Arc::clone(&self.next);
        Box::pin(async move {
            // The request moves into the inner handler, so capture what the
            // log line needs up front.
            let meta = meta_func(&req);
            let logger = req.utils().logger_with_meta(&req, &meta);

            match AssertUnwindSafe(next.call(req)).catch_unwind().await {
                Ok(res) => res,
                Err(payload) => {
                    let backtrace = Backtrace::force_capture();
                    logger.error(
                        "PanicAutorecover",
                        format_args!("PANIC recovered: {}\n{backtrace}", panic_message(payload.as_ref())),
                    );
                    Response::status(StatusCode::INTERNAL_SERVER_ERROR)
                }
            }
        })
    }
}

fn panic_message(payload: &(dyn Any + Send)) -> &str {
    payload
        .downcast_ref::<&str>()
        .copied()
        .or_else(|| payload.downcast_ref::<String>().map(String::as_str))
        .unwrap_or("non-string panic payload")
}
