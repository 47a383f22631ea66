//! Request dispatch.
//!
//! The serve loop resolves each parsed request to a [`Handler`] through
//! a [`Router`]. Handlers run on the connection's coroutine, so a
//! stalled handler stalls only its own connection.

use std::future::Future;
use std::pin::Pin;

use crate::error::HttpError;
use crate::request::Request;
use crate::response::Response;

/// Boxed handler future. Boxing keeps [`Handler`] object-safe so
/// routers can hold heterogeneous handlers behind one trait object.
pub type HandlerFuture<'a> = Pin<Box<dyn Future<Output = Result<(), HttpError>> + 'a>>;

/// One request handler. Implementations read the request and either
/// fill the response body or drive one of the streaming send paths.
pub trait Handler {
    fn handle<'a>(&'a self, req: &'a Request, resp: &'a mut Response) -> HandlerFuture<'a>;
}

impl<F> Handler for F
where
    F: for<'a> Fn(&'a Request, &'a mut Response) -> HandlerFuture<'a>,
{
    fn handle<'a>(&'a self, req: &'a Request, resp: &'a mut Response) -> HandlerFuture<'a> {
        self(req, resp)
    }
}

/// Maps (method, path) to a handler. `None` makes the serve loop answer
/// 404 without invoking anything.
pub trait Router {
    fn resolve(&self, method: &str, path: &str) -> Option<&dyn Handler>;
}

/// Exact-match router over (method, path) pairs. `HEAD` falls back to
/// the `GET` route when no explicit `HEAD` route exists.
#[derive(Default)]
pub struct PathRouter {
    routes: Vec<(String, String, Box<dyn Handler>)>,
}

impl PathRouter {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn route<H: Handler + 'static>(mut self, method: &str, path: &str, handler: H) -> Self {
        self.routes
            .push((method.to_string(), path.to_string(), Box::new(handler)));
        self
    }

    fn lookup(&self, method: &str, path: &str) -> Option<&dyn Handler> {
        self.routes
            .iter()
            .find(|(m, p, _)| m == method && p == path)
            .map(|(_, _, h)| h.as_ref())
    }
}

impl Router for PathRouter {
    fn resolve(&self, method: &str, path: &str) -> Option<&dyn Handler> {
        match self.lookup(method, path) {
            Some(handler) => Some(handler),
            None if method == "HEAD" => self.lookup("GET", path),
            None => None,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    type RouteFn = for<'a> fn(&'a Request, &'a mut Response) -> HandlerFuture<'a>;

    fn noop<'a>(_req: &'a Request, _resp: &'a mut Response) -> HandlerFuture<'a> {
        Box::pin(async { Ok(()) })
    }

    fn test_router() -> PathRouter {
        PathRouter::new()
            .route("GET", "/a", noop as RouteFn)
            .route("POST", "/b", noop as RouteFn)
    }

    #[test]
    fn resolves_exact_matches_only() {
        let router = test_router();
        assert!(router.resolve("GET", "/a").is_some());
        assert!(router.resolve("POST", "/b").is_some());
        assert!(router.resolve("GET", "/b").is_none());
        assert!(router.resolve("GET", "/missing").is_none());
    }

    #[test]
    fn head_falls_back_to_get_route() {
        let router = test_router();
        assert!(router.resolve("HEAD", "/a").is_some());
        assert!(router.resolve("HEAD", "/b").is_none());
    }
}
