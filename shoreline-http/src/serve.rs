//! Per-connection serve loop.
//!
//! One [`serve_connection`] call runs for the whole life of an accepted
//! connection: parse a request (racing the idle timeout), resolve a
//! handler, run it, flush the response, then either start the next
//! keep-alive cycle or tear the connection down.

use std::rc::Rc;
use std::time::Duration;

use log::{debug, warn};
use shoreline::{ConnCtx, ParseResult};

use crate::error::HttpError;
use crate::metrics::{
    HANDLER_ERRORS, PROTOCOL_ERRORS, REQUESTS_PARSED, REQUEST_TIMEOUTS, RESPONSES_SENT,
};
use crate::parser::{FeedProgress, RequestParser};
use crate::request::Request;
use crate::response::Response;
use crate::router::Router;

/// Serve-loop tunables. One copy per worker, cloned into each
/// connection's coroutine.
#[derive(Clone, Debug)]
pub struct ServeConfig {
    /// How long a cycle may wait for a complete request before the
    /// connection is closed.
    pub request_timeout: Duration,
    /// How long a WebSocket close waits for the peer's acknowledgement.
    pub ws_close_timeout: Duration,
    /// Cap on a request body.
    pub max_body: usize,
}

impl Default for ServeConfig {
    fn default() -> Self {
        Self {
            request_timeout: Duration::from_secs(30),
            ws_close_timeout: Duration::from_secs(5),
            max_body: crate::parser::DEFAULT_MAX_BODY,
        }
    }
}

enum ParseOutcome {
    Request,
    /// Peer went away between requests; not an error.
    QuietClose,
    Timeout,
    Protocol(HttpError),
}

/// Drive one connection until it closes. Invoked from
/// `AsyncEventHandler::on_accept`; the router is shared across the
/// worker's connections via `Rc`.
pub async fn serve_connection<R: Router>(conn: ConnCtx, router: Rc<R>, config: ServeConfig) {
    let mut parser = RequestParser::with_max_body(config.max_body);
    let mut req = Request::default();
    let mut resp = Response::new(conn);

    loop {
        req.clear();
        resp.clear();
        parser.reset();

        match parse_request(conn, &mut parser, &mut req, &config).await {
            ParseOutcome::Request => {}
            ParseOutcome::QuietClose => {
                debug!("connection {} closed by peer", conn.index());
                return;
            }
            ParseOutcome::Timeout => {
                REQUEST_TIMEOUTS.increment();
                debug!("connection {} idle timeout", conn.index());
                conn.close();
                return;
            }
            ParseOutcome::Protocol(e) => {
                PROTOCOL_ERRORS.increment();
                warn!("connection {}: malformed request: {e}", conn.index());
                let status = match e {
                    HttpError::BodyTooLarge => "413 Payload Too Large",
                    HttpError::HeaderTooLarge => "431 Request Header Fields Too Large",
                    _ => "400 Bad Request",
                };
                let reply =
                    format!("HTTP/1.1 {status}\r\ncontent-length: 0\r\nconnection: close\r\n\r\n");
                // Await the send so the status reaches the peer before
                // the close SQE tears the fd down.
                if let Ok(sent) = conn.send(reply.as_bytes()) {
                    let _ = sent.await;
                }
                conn.close();
                return;
            }
        }

        REQUESTS_PARSED.increment();
        resp.keep_alive = req.keep_alive();
        resp.head_only = req.method() == "HEAD";

        match router.resolve(req.method(), req.path()) {
            Some(handler) => {
                if let Err(e) = handler.handle(&req, &mut resp).await {
                    // The response may be half-built; nothing of it goes
                    // out, the connection is not reusable.
                    HANDLER_ERRORS.increment();
                    warn!(
                        "connection {}: handler for {} {} failed: {e}",
                        conn.index(),
                        req.method(),
                        req.path()
                    );
                    conn.close();
                    return;
                }
            }
            None => resp.set_status(404),
        }

        if resp.upgraded {
            // The handler ran the WebSocket session to completion.
            conn.close();
            return;
        }

        if let Err(e) = resp.flush().await {
            warn!("connection {}: flush failed: {e}", conn.index());
            conn.close();
            return;
        }
        RESPONSES_SENT.increment();

        if !resp.keep_alive {
            conn.close();
            return;
        }
    }
}

async fn parse_request(
    conn: ConnCtx,
    parser: &mut RequestParser,
    req: &mut Request,
    config: &ServeConfig,
) -> ParseOutcome {
    let mut received_any = parser.buffered() > 0;
    loop {
        match parser.poll_buffered(req) {
            Ok(FeedProgress::Complete) => return ParseOutcome::Request,
            Ok(FeedProgress::NeedMore) => {}
            Err(e) => return ParseOutcome::Protocol(e),
        }

        let recv = conn.with_data(|data| {
            parser.append(data);
            ParseResult::Consumed(data.len())
        });
        match shoreline::timeout(config.request_timeout, recv).await {
            Ok(0) => {
                // EOF mid-message is a protocol error; EOF on a clean
                // boundary is the peer ending keep-alive.
                return if received_any {
                    ParseOutcome::Protocol(HttpError::ConnectionClosed)
                } else {
                    ParseOutcome::QuietClose
                };
            }
            Ok(_) => received_any = true,
            Err(shoreline::Elapsed) => return ParseOutcome::Timeout,
        }
    }
}
