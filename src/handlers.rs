//! Standard operational handlers.
//!
//! | Handler | Answers |
//! |---|---|
//! | root | `200` with an empty body for `/`, `404` otherwise |
//! | liveness | `200 "ok"`, or `500 "not ready"` |
//! | readiness | `200 "ok"`, or `500 "not ready"` |
//! | health | `200 "ok"`, or `500 "not healthy"` |
//! | version | the build metadata map as JSON |
//! | metrics | the Prometheus exposition text |
//! | quit | `200`, then starts the service shutdown |
//! | preflight | `200` with an empty body |
//!
//! Bodies of the state handlers are JSON strings, so `"ok"` goes over the
//! wire with its quotes.

use std::sync::Arc;

use http::StatusCode;

use crate::handler::Handler;
use crate::metrics::Metrics;
use crate::request::Request;
use crate::response::Response;
use crate::service::{ServiceHandle, Trigger};
use crate::state::ServiceState;
use crate::version::VersionBuilder;

const PROMETHEUS_CONTENT_TYPE: &str = "text/plain; version=0.0.4; charset=utf-8";

/// Builds the standard handlers over the service's collaborators.
#[derive(Clone)]
pub struct HandlerFactory {
    version: Arc<dyn VersionBuilder>,
    state: Arc<dyn ServiceState>,
    metrics: Arc<dyn Metrics>,
    service: ServiceHandle,
}

impl HandlerFactory {
    pub fn new(
        version: Arc<dyn VersionBuilder>,
        state: Arc<dyn ServiceState>,
        metrics: Arc<dyn Metrics>,
        service: ServiceHandle,
    ) -> Self {
        Self { version, state, metrics, service }
    }

    pub fn root(&self) -> impl Handler {
        |req: Request| async move {
            if req.path() == "/" {
                return Response::status(StatusCode::OK);
            }
            tracing::warn!(path = req.path(), "root handler reached for a path other than /");
            Response::status(StatusCode::NOT_FOUND)
        }
    }

    pub fn liveness(&self) -> impl Handler {
        let state = Arc::clone(&self.state);
        move |_req: Request| {
            let res = gate(state.is_live(), "not ready");
            async move { res }
        }
    }

    pub fn readiness(&self) -> impl Handler {
        let state = Arc::clone(&self.state);
        move |_req: Request| {
            let res = gate(state.is_ready(), "not ready");
            async move { res }
        }
    }

    pub fn health(&self) -> impl Handler {
        let state = Arc::clone(&self.state);
        move |_req: Request| {
            let res = gate(state.is_healthy(), "not healthy");
            async move { res }
        }
    }

    pub fn version(&self) -> impl Handler {
        let version = Arc::clone(&self.version);
        move |_req: Request| {
            let res = Response::json_value(StatusCode::OK, &version.to_map());
            async move { res }
        }
    }

    pub fn metrics(&self) -> impl Handler {
        let metrics = Arc::clone(&self.metrics);
        move |_req: Request| {
            let res = Response::builder().bytes(PROMETHEUS_CONTENT_TYPE, metrics.render());
            async move { res }
        }
    }

    /// The response is produced before shutdown can close the connection:
    /// the trigger only records intent, and listeners drain in-flight
    /// requests before the exit function runs.
    pub fn quit(&self) -> impl Handler {
        let service = self.service.clone();
        move |_req: Request| {
            if !service.fire(Trigger::Quit) {
                tracing::debug!("quit requested while already shutting down");
            }
            async { Response::status(StatusCode::OK) }
        }
    }

    pub fn preflight(&self) -> impl Handler {
        |_req: Request| async { Response::status(StatusCode::OK) }
    }
}

fn gate(ok: bool, failure: &str) -> Response {
    if ok {
        Response::json_value(StatusCode::OK, "ok")
    } else {
        Response::json_value(StatusCode::INTERNAL_SERVER_ERROR, failure)
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;

    use super::*;
    use crate::handler::BoxedHandler;
    use crate::metrics::NoopMetrics;
    use crate::service::{LifecyclePhase, ServiceHandle};
    use crate::state::{DefaultServiceState, TrackedServiceState};
    use crate::version::BuildVersion;

    fn factory(state: Arc<dyn ServiceState>) -> (HandlerFactory, ServiceHandle) {
        let (handle, _intent) = ServiceHandle::new();
        let version = BuildVersion {
            version_number: "1.2.3".into(),
            build_date: "2024-05-01".into(),
            git_hash: "cafe".into(),
        };
        let f = HandlerFactory::new(Arc::new(version), state, Arc::new(NoopMetrics), handle.clone());
        (f, handle)
    }

    async fn call(h: BoxedHandler, path: &str) -> Response {
        h.call(http::Request::get(path).body(Bytes::new()).unwrap().into()).await
    }

    #[tokio::test]
    async fn root_is_empty_200_only_for_slash() {
        let (f, _) = factory(Arc::new(DefaultServiceState));
        let res = call(f.root().into_boxed_handler(), "/").await;
        assert_eq!(res.status_code(), StatusCode::OK);
        assert!(res.body().is_empty());
        let res = call(f.root().into_boxed_handler(), "/other").await;
        assert_eq!(res.status_code(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn status_endpoints_follow_state() {
        let state = Arc::new(TrackedServiceState::new());
        let (f, _) = factory(state.clone());

        let res = call(f.readiness().into_boxed_handler(), "/service/readiness").await;
        assert_eq!(res.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(res.body().as_ref(), br#""not ready""#);

        state.warm_up();
        let res = call(f.readiness().into_boxed_handler(), "/service/readiness").await;
        assert_eq!(res.status_code(), StatusCode::OK);
        assert_eq!(res.body().as_ref(), br#""ok""#);
        assert_eq!(res.header("content-type"), Some("application/json"));

        state.shut_down();
        let res = call(f.health().into_boxed_handler(), "/healthz").await;
        assert_eq!(res.body().as_ref(), br#""not healthy""#);
        let res = call(f.liveness().into_boxed_handler(), "/service/liveness").await;
        assert_eq!(res.status_code(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn version_serves_map_as_json() {
        let (f, _) = factory(Arc::new(DefaultServiceState));
        let res = call(f.version().into_boxed_handler(), "/service/version").await;
        let body: serde_json::Value = serde_json::from_slice(res.body()).unwrap();
        assert_eq!(body["version"], "1.2.3");
        assert_eq!(body["buildDate"], "2024-05-01");
        assert_eq!(body["gitHash"], "cafe");
    }

    #[tokio::test]
    async fn quit_answers_and_fires_once() {
        let (f, handle) = factory(Arc::new(DefaultServiceState));
        let quit = f.quit().into_boxed_handler();

        let res = call(Arc::clone(&quit), "/quit").await;
        assert_eq!(res.status_code(), StatusCode::OK);
        assert!(handle.is_quitting());
        assert_eq!(handle.phase(), LifecyclePhase::Initialized);

        // A second quit is answered too but does not fire again.
        assert!(!handle.fire(Trigger::Quit));
        assert_eq!(call(quit, "/quit").await.status_code(), StatusCode::OK);
    }
}
