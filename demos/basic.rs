//! Minimal service: one JSON resource plus the standard operational routes.
//!
//! Run with:
//!   HTTPPORT=3000 LOG_MINFILTER=info cargo run --example basic
//!
//! Try:
//!   curl http://localhost:3000/users/42
//!   curl -X POST http://localhost:3000/users -d '{"name":"alice"}'
//!   curl -X OPTIONS http://localhost:3000/users \
//!        -H 'origin: https://app.example' \
//!        -H 'access-control-request-method: POST' -i
//!   curl http://localhost:3000/service/version
//!   curl http://localhost:3002/metrics
//!   curl http://localhost:3002/quit

use std::sync::Arc;

use http::{Method, StatusCode};
use serde::Deserialize;
use service_foundation::{Meta, MetaFunc, Middleware, Request, Response, Service};

#[derive(Deserialize)]
struct NewUser {
    name: String,
}

#[tokio::main]
async fn main() -> Result<(), service_foundation::Error> {
    let mut service = Service::from_env("basic")?;

    // PanicTo500 last: it wraps, and therefore protects, everything else.
    let middlewares = [
        Middleware::Cors,
        Middleware::NoCaching,
        Middleware::Counter,
        Middleware::Histogram,
        Middleware::RequestMetrics,
        Middleware::RequestLogging,
        Middleware::PanicTo500,
    ];
    let user_meta: MetaFunc = Arc::new(|req: &Request| {
        let mut meta = Meta::new();
        if let Some(id) = req.param("id") {
            meta.insert("user_id", id);
        }
        meta
    });

    service.add_route("get_user", &["/users/{id}"], &[Method::GET], &middlewares, Some(user_meta), get_user)?;
    service.add_route("create_user", &["/users"], &[Method::POST], &middlewares, None, create_user)?;

    // Signals and /quit stop the service; there is no other cancellation.
    let trigger = service.run(std::future::pending()).await;
    tracing::info!(?trigger, "stopped");
    Ok(())
}

// GET /users/{id}
async fn get_user(req: Request) -> Response {
    let id = req.param("id").unwrap_or("unknown");
    Response::json_value(StatusCode::OK, &serde_json::json!({ "id": id, "name": "alice" }))
}

// POST /users
async fn create_user(req: Request) -> Response {
    let Ok(user) = serde_json::from_slice::<NewUser>(req.body()) else {
        return Response::status(StatusCode::BAD_REQUEST);
    };
    Response::builder()
        .status(StatusCode::CREATED)
        .header("location", "/users/99")
        .json(serde_json::to_vec(&serde_json::json!({ "id": 99, "name": user.name })).unwrap_or_default())
}
