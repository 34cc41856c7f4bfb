//! One HTTP listener and its graceful close.
//!
//! # Close and drain
//!
//! When the close flag turns `true` the listener:
//! 1. Stops `listener.accept()` immediately; no new connections are made.
//! 2. Asks every open connection to finish its in-flight request and close.
//! 3. Waits at most the drain window for that, then returns regardless.
//!
//! Handlers are never interrupted; a request still running when the drain
//! window elapses is abandoned to process exit.

use std::convert::Infallible;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use http_body_util::{BodyExt, Full};
use hyper::body::Incoming;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo, TokioTimer};
use hyper_util::server::conn::auto::Builder as ConnBuilder;
use hyper_util::server::graceful::GracefulShutdown;
use tokio::net::TcpListener;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use crate::config::{DEFAULT_DRAIN_WINDOW, DEFAULT_HEADER_READ_TIMEOUT};
use crate::error::Error;
use crate::request::Request;
use crate::response::Response;
use crate::router::Router;

/// A bound listener, ready to serve one [`Router`].
pub struct Server {
    name: &'static str,
    listener: TcpListener,
    addr: SocketAddr,
    header_read_timeout: Duration,
    drain_window: Duration,
}

impl Server {
    /// Binds `addr`. Port `0` picks a free port; see [`local_addr`](Self::local_addr).
    pub async fn bind(name: &'static str, addr: SocketAddr) -> Result<Self, Error> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|source| Error::Bind { listener: name, addr, source })?;
        let addr = listener.local_addr()?;
        Ok(Self {
            name,
            listener,
            addr,
            header_read_timeout: DEFAULT_HEADER_READ_TIMEOUT,
            drain_window: DEFAULT_DRAIN_WINDOW,
        })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.addr
    }

    /// Time a client gets to send the request headers before the connection
    /// is dropped.
    pub fn header_read_timeout(mut self, timeout: Duration) -> Self {
        self.header_read_timeout = timeout;
        self
    }

    pub fn drain_window(mut self, window: Duration) -> Self {
        self.drain_window = window;
        self
    }

    /// Accepts connections and dispatches them through `router` until
    /// `close` turns `true` (or its sender is dropped), then drains.
    pub async fn serve(self, router: Router, close: watch::Receiver<bool>) -> Result<(), Error> {
        let Self { name, listener, addr, header_read_timeout, drain_window } = self;
        let router = Arc::new(router);
        let closed = closed(close);
        tokio::pin!(closed);

        let mut builder = ConnBuilder::new(TokioExecutor::new());
        builder
            .http1()
            .timer(TokioTimer::new())
            .header_read_timeout(header_read_timeout);

        let graceful = GracefulShutdown::new();
        info!(listener = name, %addr, "listening");

        loop {
            tokio::select! {
                // Close first so a closing listener stops accepting even when
                // more connections are queued.
                biased;

                () = &mut closed => {
                    info!(listener = name, "close requested, draining connections");
                    break;
                }

                res = listener.accept() => {
                    let (stream, remote_addr) = match res {
                        Ok(v) => v,
                        Err(e) => {
                            error!(listener = name, "accept error: {e}");
                            continue;
                        }
                    };

                    let router = Arc::clone(&router);
                    let svc = service_fn(move |req| {
                        let router = Arc::clone(&router);
                        async move { dispatch(router, req, remote_addr).await }
                    });

                    let conn = builder.serve_connection_with_upgrades(TokioIo::new(stream), svc);
                    let conn = graceful.watch(conn.into_owned());
                    tokio::spawn(async move {
                        if let Err(e) = conn.await {
                            debug!(listener = name, peer = %remote_addr, "connection error: {e}");
                        }
                    });
                }
            }
        }

        drop(listener);

        tokio::select! {
            () = graceful.shutdown() => {
                info!(listener = name, "all connections closed");
            }
            () = tokio::time::sleep(drain_window) => {
                warn!(listener = name, ?drain_window, "drain window elapsed with connections still open");
            }
        }
        Ok(())
    }
}

// ── Request dispatch ──────────────────────────────────────────────────────────

/// Collects the body, routes the request and produces one response.
///
/// Every failure is answered with a status code, so hyper never sees an error.
async fn dispatch(
    router: Arc<Router>,
    req: hyper::Request<Incoming>,
    remote_addr: SocketAddr,
) -> Result<http::Response<Full<Bytes>>, Infallible> {
    let (parts, body) = req.into_parts();
    let body = match body.collect().await {
        Ok(collected) => collected.to_bytes(),
        Err(e) => {
            debug!(peer = %remote_addr, "failed to read request body: {e}");
            return Ok(Response::status(http::StatusCode::BAD_REQUEST).into_inner());
        }
    };

    let res = router.dispatch(Request::new(parts, body, Some(remote_addr))).await;
    Ok(res.into_inner())
}

/// Resolves once `close` holds `true` or its sender is gone.
pub(crate) async fn closed(mut close: watch::Receiver<bool>) {
    let _ = close.wait_for(|closed| *closed).await;
}

// ── Shutdown signal ───────────────────────────────────────────────────────────

/// Resolves on the first termination signal the process receives.
///
/// On Unix this listens for both **SIGTERM** (sent by the orchestrator) and
/// **SIGINT** (Ctrl-C, for local dev). On Windows only Ctrl-C is available.
/// A handler that cannot be installed is logged and never resolves.
pub(crate) async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            error!("failed to install Ctrl-C handler: {e}");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let sigterm = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut stream) => {
                stream.recv().await;
            }
            Err(e) => {
                error!("failed to install SIGTERM handler: {e}");
                std::future::pending::<()>().await;
            }
        }
    };

    // `pending()` never resolves: on non-Unix platforms the SIGTERM arm is
    // effectively disabled.
    #[cfg(not(unix))]
    let sigterm = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {}
        () = sigterm => {}
    }
}
