//! Radix-tree route table for one listener.
//!
//! One tree per HTTP method, O(path-length) lookup. Each registered route
//! carries its fully wrapped handler and the meta function used for its log
//! lines.

use std::collections::HashMap;
use std::sync::Arc;

use http::header::{ALLOW, HeaderValue};
use http::{Method, StatusCode};
use matchit::Router as MatchitRouter;

use crate::error::Error;
use crate::handler::{BoxFuture, BoxedHandler, HandlerUtils, MetaFunc};
use crate::request::Request;
use crate::response::Response;

struct Route {
    pattern: String,
    handler: BoxedHandler,
    meta_func: MetaFunc,
}

/// A listener's route table.
///
/// Path parameters use `{name}` syntax; `req.param("name")` retrieves them.
/// Unknown paths answer `404`; known paths with an unregistered method
/// answer `405` with an `Allow` header.
pub struct Router {
    routes: HashMap<Method, MatchitRouter<Route>>,
    registered: Vec<(Method, String)>,
    utils: HandlerUtils,
}

impl Router {
    pub fn new(utils: HandlerUtils) -> Self {
        Self { routes: HashMap::new(), registered: Vec::new(), utils }
    }

    /// Registers an already wrapped handler for a method and path.
    pub fn handle(
        &mut self,
        method: Method,
        path: &str,
        meta_func: MetaFunc,
        handler: BoxedHandler,
    ) -> Result<(), Error> {
        let route = Route { pattern: path.to_owned(), handler, meta_func };
        self.routes
            .entry(method.clone())
            .or_default()
            .insert(path, route)
            .map_err(|source| Error::Route { method: method.clone(), path: path.to_owned(), source })?;
        self.registered.push((method, path.to_owned()));
        Ok(())
    }

    /// Whether exactly this method and pattern were registered.
    pub fn contains(&self, method: &Method, path: &str) -> bool {
        self.registered.iter().any(|(m, p)| m == method && p == path)
    }

    /// Registered `(method, pattern)` pairs in registration order.
    pub fn routes(&self) -> &[(Method, String)] {
        &self.registered
    }

    /// Finds the route for `req` and returns the future producing its response.
    pub fn dispatch(&self, mut req: Request) -> BoxFuture {
        let path = req.path().to_owned();
        let found = self.routes.get(req.method()).and_then(|tree| tree.at(&path).ok());

        let Some(matched) = found else {
            let allowed = self.allowed_methods(&path);
            let utils = self.utils.clone();
            return Box::pin(async move { not_routed(&req.with_utils(utils), allowed) });
        };

        let route = matched.value;
        let params = matched.params.iter().map(|(k, v)| (k.to_owned(), v.to_owned())).collect();
        req.set_match(&route.pattern, params);
        let req = req.with_utils(self.utils.with_meta_func(Arc::clone(&route.meta_func)));
        route.handler.call(req)
    }

    fn allowed_methods(&self, path: &str) -> Vec<Method> {
        let mut allowed: Vec<Method> = self
            .routes
            .iter()
            .filter(|(_, tree)| tree.at(path).is_ok())
            .map(|(method, _)| method.clone())
            .collect();
        allowed.sort_by(|a, b| a.as_str().cmp(b.as_str()));
        allowed
    }
}

fn not_routed(req: &Request, allowed: Vec<Method>) -> Response {
    if allowed.is_empty() {
        tracing::debug!(method = %req.method(), path = req.path(), "no route");
        return Response::status(StatusCode::NOT_FOUND);
    }

    let mut res = Response::status(StatusCode::METHOD_NOT_ALLOWED);
    let list = allowed.iter().map(Method::as_str).collect::<Vec<_>>().join(", ");
    if let Ok(v) = HeaderValue::try_from(list) {
        res.headers_mut().insert(ALLOW, v);
    }
    res
}
