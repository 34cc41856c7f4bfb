//! Incoming HTTP request type.

use std::net::SocketAddr;

use bytes::Bytes;
use http::header::HOST;
use http::{HeaderMap, Method, Uri};

use crate::handler::HandlerUtils;

/// An incoming HTTP request with its body already collected.
///
/// Besides the HTTP parts it carries what the router learned while matching
/// (path parameters, the matched route pattern) and the [`HandlerUtils`] of
/// the route table that dispatched it.
pub struct Request {
    parts: http::request::Parts,
    body: Bytes,
    params: Vec<(String, String)>,
    route: Option<String>,
    remote_addr: Option<SocketAddr>,
    utils: HandlerUtils,
}

impl Request {
    pub(crate) fn new(parts: http::request::Parts, body: Bytes, remote_addr: Option<SocketAddr>) -> Self {
        Self {
            parts,
            body,
            params: Vec::new(),
            route: None,
            remote_addr,
            utils: HandlerUtils::default(),
        }
    }

    pub(crate) fn set_match(&mut self, route: &str, params: Vec<(String, String)>) {
        self.route = Some(route.to_owned());
        self.params = params;
    }

    /// Replaces the utilities handed to middleware and handlers.
    pub fn with_utils(mut self, utils: HandlerUtils) -> Self {
        self.utils = utils;
        self
    }

    pub fn method(&self) -> &Method { &self.parts.method }
    pub fn uri(&self) -> &Uri { &self.parts.uri }
    pub fn path(&self) -> &str { self.parts.uri.path() }
    pub fn query(&self) -> Option<&str> { self.parts.uri.query() }
    pub fn headers(&self) -> &HeaderMap { &self.parts.headers }
    pub fn body(&self) -> &Bytes { &self.body }
    pub fn remote_addr(&self) -> Option<SocketAddr> { self.remote_addr }
    pub fn utils(&self) -> &HandlerUtils { &self.utils }

    /// The route pattern that matched, e.g. `/users/{id}`.
    pub fn route(&self) -> Option<&str> { self.route.as_deref() }

    /// Case-insensitive header lookup; `None` for absent or non-UTF-8 values.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.parts.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Returns a named path parameter.
    ///
    /// For a route `/users/{id}`, `req.param("id")` on `/users/42` returns `Some("42")`.
    pub fn param(&self, key: &str) -> Option<&str> {
        self.params.iter().find(|(k, _)| k == key).map(|(_, v)| v.as_str())
    }

    pub fn params(&self) -> &[(String, String)] {
        &self.params
    }

    /// `Host` header, falling back to the URI authority.
    pub fn host(&self) -> &str {
        self.header(HOST.as_str())
            .or_else(|| self.parts.uri.authority().map(|a| a.as_str()))
            .unwrap_or_default()
    }

    /// URI scheme when the request carried one, `http` otherwise. TLS is
    /// terminated in front of the service, so plain requests are the norm.
    pub fn scheme(&self) -> &str {
        self.parts.uri.scheme_str().unwrap_or("http")
    }

    /// Path plus query exactly as requested.
    pub fn request_uri(&self) -> &str {
        self.parts
            .uri
            .path_and_query()
            .map(|pq| pq.as_str())
            .unwrap_or_else(|| self.parts.uri.path())
    }

    /// Absolute URL reconstructed from scheme, host and request URI.
    pub fn url(&self) -> String {
        format!("{}://{}{}", self.scheme(), self.host(), self.request_uri())
    }
}

/// Builds a request outside any router, e.g. in tests or when embedding the
/// pipeline in another server. Utilities start as [`HandlerUtils::default`].
impl From<http::Request<Bytes>> for Request {
    fn from(req: http::Request<Bytes>) -> Self {
        let (parts, body) = req.into_parts();
        Self::new(parts, body, None)
    }
}
