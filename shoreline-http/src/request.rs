//! Parsed HTTP/1.1 request.

use bytes::{Bytes, BytesMut};

/// One parsed request. Filled by [`RequestParser`](crate::parser::RequestParser),
/// read-only to handlers, cleared and reused across keep-alive cycles.
#[derive(Debug, Default)]
pub struct Request {
    pub(crate) method: String,
    pub(crate) target: String,
    pub(crate) version: String,
    /// Keys are lower-cased on insertion.
    pub(crate) headers: Vec<(String, String)>,
    pub(crate) body: BytesMut,
}

impl Request {
    pub fn method(&self) -> &str {
        &self.method
    }

    /// The raw request target, query string included.
    pub fn target(&self) -> &str {
        &self.target
    }

    /// The path component of the target, without the query string.
    pub fn path(&self) -> &str {
        match self.target.split_once('?') {
            Some((path, _)) => path,
            None => &self.target,
        }
    }

    /// The query string after `?`, if any.
    pub fn query(&self) -> Option<&str> {
        self.target.split_once('?').map(|(_, q)| q)
    }

    /// Look up one query parameter by name.
    pub fn query_param(&self, name: &str) -> Option<&str> {
        self.query()?.split('&').find_map(|pair| {
            let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
            (k == name).then_some(v)
        })
    }

    pub fn version(&self) -> &str {
        &self.version
    }

    /// First header value for `name` (lower-cased lookup).
    pub fn header(&self, name: &str) -> Option<&str> {
        let lower = name.to_ascii_lowercase();
        self.headers
            .iter()
            .find(|(k, _)| *k == lower)
            .map(|(_, v)| v.as_str())
    }

    /// All headers, in arrival order. Keys are lower-cased.
    pub fn headers(&self) -> &[(String, String)] {
        &self.headers
    }

    pub fn body(&self) -> &[u8] {
        &self.body
    }

    pub fn body_bytes(&self) -> Bytes {
        Bytes::copy_from_slice(&self.body)
    }

    /// Whether the peer wants the connection kept open after this cycle.
    /// HTTP/1.1 defaults to keep-alive; HTTP/1.0 defaults to close.
    pub fn keep_alive(&self) -> bool {
        match self.header("connection") {
            Some(v) if v.eq_ignore_ascii_case("close") => false,
            Some(v) if v.eq_ignore_ascii_case("keep-alive") => true,
            _ => self.version != "HTTP/1.0",
        }
    }

    /// True when the request carries a WebSocket upgrade.
    pub fn is_upgrade(&self) -> bool {
        self.header("upgrade")
            .map(|v| v.eq_ignore_ascii_case("websocket"))
            .unwrap_or(false)
    }

    /// Reset for reuse on the next keep-alive cycle.
    pub(crate) fn clear(&mut self) {
        self.method.clear();
        self.target.clear();
        self.version.clear();
        self.headers.clear();
        self.body.clear();
    }
}
