//! Route table: which handler a connection upgraded on `(method, path)` is
//! bound to.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use axum::http::Method;
use sockroute_core::BridgeError;

use crate::websocket::dispatch::Handler;

/// A registered route. Cheap to clone.
#[derive(Clone)]
pub struct Route {
    method: Method,
    path: String,
    handler: Arc<dyn Handler>,
}

impl Route {
    /// Bind `handler` to `(method, path)`.
    pub fn new(method: Method, path: impl Into<String>, handler: impl Handler + 'static) -> Self {
        Self {
            method,
            path: path.into(),
            handler: Arc::new(handler),
        }
    }

    /// Upgrade method.
    pub fn method(&self) -> &Method {
        &self.method
    }

    /// Absolute path.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// The bound handler.
    pub fn handler(&self) -> &Arc<dyn Handler> {
        &self.handler
    }
}

impl fmt::Debug for Route {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Route")
            .field("method", &self.method)
            .field("path", &self.path)
            .finish_non_exhaustive()
    }
}

/// Registered routes keyed by `(method, path)`.
#[derive(Default, Debug)]
pub struct RouteTable {
    routes: HashMap<(Method, String), Route>,
}

impl RouteTable {
    /// Create an empty table.
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a handler, replacing any previous one for the same key.
    pub fn route(&mut self, method: Method, path: &str, handler: impl Handler + 'static) -> &mut Self {
        let route = Route::new(method.clone(), path, handler);
        let _ = self.routes.insert((method, path.to_owned()), route);
        self
    }

    /// Look up a route.
    pub fn lookup(&self, method: &Method, path: &str) -> Option<Route> {
        self.routes.get(&(method.clone(), path.to_owned())).cloned()
    }

    /// Look up a route, treating absence as an error.
    pub fn resolve(&self, method: &Method, path: &str) -> Result<Route, BridgeError> {
        self.lookup(method, path).ok_or_else(|| BridgeError::NoRoute {
            method: method.to_string(),
            path: path.to_owned(),
        })
    }

    /// Distinct registered paths, sorted.
    pub fn paths(&self) -> Vec<String> {
        let mut paths: Vec<String> = self.routes.keys().map(|(_, p)| p.clone()).collect();
        paths.sort();
        paths.dedup();
        paths
    }

    /// Number of routes.
    pub fn len(&self) -> usize {
        self.routes.len()
    }

    /// Whether no routes are registered.
    pub fn is_empty(&self) -> bool {
        self.routes.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::websocket::dispatch::handler_fn;

    fn noop() -> impl Handler + 'static {
        handler_fn(|_ctx, reply| {
            reply.text("ok");
            Ok(())
        })
    }

    #[test]
    fn register_and_lookup() {
        let mut table = RouteTable::new();
        let _ = table.route(Method::GET, "/ws", noop()).route(Method::GET, "/chat", noop());

        assert_eq!(table.len(), 2);
        let route = table.lookup(&Method::GET, "/ws").unwrap();
        assert_eq!(route.path(), "/ws");
        assert_eq!(route.method(), &Method::GET);
        assert!(table.lookup(&Method::POST, "/ws").is_none());
        assert_eq!(table.paths(), vec!["/chat".to_owned(), "/ws".to_owned()]);
    }

    #[test]
    fn resolve_reports_no_route() {
        let table = RouteTable::new();
        assert!(table.is_empty());
        let err = table.resolve(&Method::GET, "/missing").unwrap_err();
        assert!(matches!(err, BridgeError::NoRoute { ref path, .. } if path == "/missing"));
        assert_eq!(err.to_string(), "no route for GET /missing");
    }
}
