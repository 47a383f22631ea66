//! shoreline-http — HTTP/1.1 and WebSocket serving on the shoreline
//! engine.
//!
//! Each accepted connection runs [`serve_connection`]: a streaming
//! request parser that tolerates arbitrary read boundaries, a router
//! dispatching to per-request handlers, and a response layer with three
//! send paths (buffered with computed `Content-Length`, chunked
//! transfer, and byte-range serving). Requests carrying a WebSocket
//! handshake can be upgraded in place; the handler then owns the
//! connection as a [`WsConn`] session.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use std::rc::Rc;
//! use shoreline::{AsyncEventHandler, Config, ConnCtx, ShorelineBuilder};
//! use shoreline_http::{serve_connection, HandlerFuture, PathRouter, Request, Response, ServeConfig};
//!
//! type RouteFn = for<'a> fn(&'a Request, &'a mut Response) -> HandlerFuture<'a>;
//!
//! fn hello<'a>(_req: &'a Request, resp: &'a mut Response) -> HandlerFuture<'a> {
//!     Box::pin(async move {
//!         resp.set_header("content-type", "text/plain");
//!         resp.write(b"hello\n");
//!         Ok(())
//!     })
//! }
//!
//! struct Server {
//!     router: Rc<PathRouter>,
//! }
//!
//! impl AsyncEventHandler for Server {
//!     fn on_accept(&self, conn: ConnCtx) -> impl std::future::Future<Output = ()> + 'static {
//!         let router = self.router.clone();
//!         serve_connection(conn, router, ServeConfig::default())
//!     }
//!
//!     fn create_for_worker(_id: usize) -> Self {
//!         let router = PathRouter::new()
//!             .route("GET", "/hello", hello as RouteFn);
//!         Server { router: Rc::new(router) }
//!     }
//! }
//!
//! fn main() -> Result<(), shoreline::Error> {
//!     let (_shutdown, handles) = ShorelineBuilder::new(Config::default())
//!         .bind("127.0.0.1:8080".parse().unwrap())
//!         .launch::<Server>()?;
//!     for h in handles {
//!         h.join().unwrap()?;
//!     }
//!     Ok(())
//! }
//! ```

pub mod error;
pub mod metrics;
pub mod parser;
pub mod range;
pub mod request;
pub mod response;
pub mod router;
pub mod serve;
pub mod ws;

pub use error::{HttpError, WsError};
pub use parser::{FeedProgress, RequestParser};
pub use range::{parse_range, ResolvedRange};
pub use request::Request;
pub use response::{RangeSource, Response};
pub use router::{Handler, HandlerFuture, PathRouter, Router};
pub use serve::{serve_connection, ServeConfig};
pub use ws::{accept_key, upgrade, WsConn, WsMessage};
