//! Serving-layer metrics.
//!
//! Counters for request/response volume and protocol failures, exposed
//! alongside the runtime's metrics when registered with an
//! admin/metrics endpoint.

use metriken::{metric, Counter};

#[metric(
    name = "shoreline_http/requests/parsed",
    description = "Requests fully parsed off the wire"
)]
pub static REQUESTS_PARSED: Counter = Counter::new();

#[metric(
    name = "shoreline_http/responses/sent",
    description = "Responses flushed to the transport"
)]
pub static RESPONSES_SENT: Counter = Counter::new();

#[metric(
    name = "shoreline_http/websocket/upgrades",
    description = "Connections upgraded to WebSocket"
)]
pub static WS_UPGRADES: Counter = Counter::new();

#[metric(
    name = "shoreline_http/protocol_errors",
    description = "Connections dropped for malformed HTTP or WebSocket input"
)]
pub static PROTOCOL_ERRORS: Counter = Counter::new();

#[metric(
    name = "shoreline_http/requests/timeouts",
    description = "Connections closed after the request idle timeout"
)]
pub static REQUEST_TIMEOUTS: Counter = Counter::new();

#[metric(
    name = "shoreline_http/handler_errors",
    description = "Handler invocations that returned an error"
)]
pub static HANDLER_ERRORS: Counter = Counter::new();
