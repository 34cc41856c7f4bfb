//! Unified error type.

use std::net::SocketAddr;

/// The error type returned by the crate's fallible operations.
///
/// Application-level errors (401, 404, 500, etc.) are expressed as HTTP
/// [`Response`](crate::Response) values, not as `Error`s. This type surfaces
/// wiring and infrastructure failures: registering a route, binding a
/// listener, setting up the metrics exporter.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A route could not be inserted into a route table.
    #[error("invalid route `{method} {path}`: {source}")]
    Route {
        method: http::Method,
        path: String,
        #[source]
        source: matchit::InsertError,
    },

    /// A listener could not bind its socket.
    #[error("{listener} listener failed to bind {addr}: {source}")]
    Bind {
        listener: &'static str,
        addr: SocketAddr,
        #[source]
        source: std::io::Error,
    },

    /// The Prometheus recorder rejected its configuration.
    #[error("metrics: {0}")]
    Metrics(#[from] metrics_exporter_prometheus::BuildError),

    #[error("io: {0}")]
    Io(#[from] std::io::Error),
}
