//! # service-foundation
//!
//! Runtime scaffold for HTTP microservices running behind a load balancer
//! or ingress.
//!
//! ## The contract
//!
//! Every service built on this crate exposes the same operational surface
//! on three listeners, so orchestration, monitoring and load balancers can
//! treat all services alike:
//!
//! | Listener | Port | Routes |
//! |---|---|---|
//! | public | `P` | `/`, `/service/version`, `/service/liveness`, `/service/readiness`, your routes |
//! | readiness | `P+1` | `/`, `/service/liveness`, `/service/readiness` |
//! | internal | `P+2` | `/`, `/health_check`, `/healthz`, `/metrics`, `/quit` |
//!
//! What's left for the service itself:
//!
//! - Routes: [`Service::add_route`] with a list of [`Middleware`]
//! - Readiness: a [`ServiceState`] gate for warm-up and shutdown
//! - Build metadata: a [`VersionBuilder`], by default read from the environment
//!
//! Shutdown is graceful and happens once, on SIGTERM / Ctrl-C, on
//! resolution of the cancellation future handed to [`Service::run`], on a call to
//! `/quit`, or when any listener dies.
//!
//! ## Quick start
//!
//! ```rust,no_run
//! use http::{Method, StatusCode};
//! use service_foundation::{Middleware, Request, Response, Service};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), service_foundation::Error> {
//!     let mut service = Service::from_env("orders")?;
//!     service.add_route(
//!         "get_order",
//!         &["/orders/{id}"],
//!         &[Method::GET],
//!         &[Middleware::RequestLogging, Middleware::Counter, Middleware::PanicTo500],
//!         None,
//!         get_order,
//!     )?;
//!     service.run(std::future::pending()).await;
//!     Ok(())
//! }
//!
//! async fn get_order(req: Request) -> Response {
//!     match req.param("id") {
//!         Some(id) => Response::json_value(StatusCode::OK, &serde_json::json!({ "id": id })),
//!         None => Response::status(StatusCode::BAD_REQUEST),
//!     }
//! }
//! ```

mod error;
mod handler;
mod request;
mod response;
mod router;
mod server;

pub mod config;
pub mod handlers;
pub mod logging;
pub mod metrics;
pub mod middleware;
pub mod service;
pub mod state;
pub mod version;

pub use config::{Ports, ServiceConfig, ServiceGlobals};
pub use error::Error;
pub use handler::{BoxFuture, BoxedHandler, ErasedHandler, Handler, HandlerUtils, MetaFunc};
pub use logging::{Meta, RequestLogger};
pub use metrics::{Metrics, NoopMetrics, PrometheusMetrics};
pub use middleware::{AuthorizationFunc, CorsOptions, Middleware, MiddlewareWrapper};
pub use request::Request;
pub use response::{IntoResponse, Response, ResponseBuilder};
pub use router::Router;
pub use server::Server;
pub use service::{ExitFunc, LifecyclePhase, Listener, Service, ServiceHandle, ServiceOptions, Trigger};
pub use state::{DefaultServiceState, ServiceState, TrackedServiceState};
pub use version::{BuildVersion, VersionBuilder};
