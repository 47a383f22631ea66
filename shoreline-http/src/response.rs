//! Response construction and serialization.
//!
//! A [`Response`] is handed to the handler mutably. Handlers either fill
//! the buffered body and let the serve loop flush it with a computed
//! `Content-Length`, stream fragments with [`send_chunk`] /
//! [`finish_chunks`], or serve a byte range with [`send_range`]. A sent
//! flag guards against a response going out twice on one cycle.
//!
//! [`send_chunk`]: Response::send_chunk
//! [`finish_chunks`]: Response::finish_chunks
//! [`send_range`]: Response::send_range

use std::io;

use bytes::{Bytes, BytesMut};
use shoreline::ConnCtx;

use crate::error::HttpError;
use crate::range::{parse_range, ResolvedRange};
use crate::request::Request;

/// Read window used when streaming a range body.
const RANGE_READ_CHUNK: usize = 16 * 1024;

/// Random-access byte source for range responses.
pub trait RangeSource {
    /// Total resource length in bytes.
    fn len(&self) -> u64;

    /// Read up to `buf.len()` bytes starting at `offset`. Returns the
    /// number of bytes read; `0` only at or past the end of the source.
    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize>;
}

impl RangeSource for Bytes {
    fn len(&self) -> u64 {
        Bytes::len(self) as u64
    }

    fn read_at(&self, offset: u64, buf: &mut [u8]) -> io::Result<usize> {
        let total = Bytes::len(self);
        let offset = offset.min(total as u64) as usize;
        let n = buf.len().min(total - offset);
        buf[..n].copy_from_slice(&self[offset..offset + n]);
        Ok(n)
    }
}

pub struct Response {
    conn: ConnCtx,
    status: u16,
    headers: Vec<(String, String)>,
    body: BytesMut,
    chunked_started: bool,
    sent: bool,
    pub(crate) keep_alive: bool,
    pub(crate) head_only: bool,
    pub(crate) upgraded: bool,
}

impl Response {
    pub(crate) fn new(conn: ConnCtx) -> Self {
        Self {
            conn,
            status: 200,
            headers: Vec::new(),
            body: BytesMut::new(),
            chunked_started: false,
            sent: false,
            keep_alive: true,
            head_only: false,
            upgraded: false,
        }
    }

    pub(crate) fn conn(&self) -> ConnCtx {
        self.conn
    }

    pub(crate) fn mark_sent(&mut self) {
        self.sent = true;
    }

    pub fn set_status(&mut self, status: u16) {
        self.status = status;
    }

    pub fn status(&self) -> u16 {
        self.status
    }

    /// Set a header, replacing any previous value under the same name.
    pub fn set_header(&mut self, name: &str, value: &str) {
        let name = name.to_ascii_lowercase();
        self.headers.retain(|(n, _)| *n != name);
        self.headers.push((name, value.to_string()));
    }

    /// Append to the buffered body. The serve loop flushes it as one
    /// write with a computed `Content-Length`.
    pub fn write(&mut self, data: &[u8]) {
        self.body.extend_from_slice(data);
    }

    /// Reset for the next keep-alive cycle.
    pub(crate) fn clear(&mut self) {
        self.status = 200;
        self.headers.clear();
        self.body.clear();
        self.chunked_started = false;
        self.sent = false;
        self.head_only = false;
        self.upgraded = false;
    }

    // ── Chunked streaming ────────────────────────────────────────────

    /// Stream one body fragment. The first call commits the response:
    /// status line and headers go out with `Transfer-Encoding: chunked`
    /// and the buffered-body path is no longer available. Empty
    /// fragments are skipped since a zero-length chunk would terminate
    /// the stream early.
    pub async fn send_chunk(&mut self, data: &[u8]) -> Result<(), HttpError> {
        if self.sent {
            return Err(HttpError::AlreadySent);
        }
        if !self.chunked_started {
            self.set_header("transfer-encoding", "chunked");
            let head = self.serialize_head(None);
            self.conn.send(&head)?.await?;
            self.chunked_started = true;
        }
        if data.is_empty() {
            return Ok(());
        }
        let mut frame = Vec::with_capacity(data.len() + 16);
        frame.extend_from_slice(format!("{:x}\r\n", data.len()).as_bytes());
        frame.extend_from_slice(data);
        frame.extend_from_slice(b"\r\n");
        self.conn.send(&frame)?.await?;
        Ok(())
    }

    /// Terminate a chunked stream with the zero-size chunk and mark the
    /// response sent.
    pub async fn finish_chunks(&mut self) -> Result<(), HttpError> {
        if self.sent {
            return Err(HttpError::AlreadySent);
        }
        if !self.chunked_started {
            // A chunked response with no fragments is still well formed.
            self.send_chunk(&[]).await?;
        }
        self.conn.send(b"0\r\n\r\n")?.await?;
        self.sent = true;
        Ok(())
    }

    // ── Range responses ──────────────────────────────────────────────

    /// Serve `source` honoring the request's method and `Range` header.
    ///
    /// `HEAD` answers with `Content-Length` and `Accept-Ranges: bytes`
    /// and no body. A `GET` with a satisfiable `Range` answers `206
    /// Partial Content` with a `Content-Range` and exactly the requested
    /// bytes. Without a `Range` header the full resource is sent
    /// buffered. Unsatisfiable or multi-range requests answer `416` with
    /// `Content-Range: bytes */total`.
    pub async fn send_range<S: RangeSource>(
        &mut self,
        req: &Request,
        source: &S,
    ) -> Result<(), HttpError> {
        if self.sent {
            return Err(HttpError::AlreadySent);
        }
        let total = source.len();

        if req.method() == "HEAD" {
            self.set_status(200);
            self.set_header("accept-ranges", "bytes");
            self.set_header("content-length", &total.to_string());
            let head = self.serialize_head(None);
            self.conn.send(&head)?.await?;
            self.sent = true;
            return Ok(());
        }

        let range = match req.header("range") {
            Some(value) => match parse_range(value, total) {
                Ok(range) => Some(range),
                Err(HttpError::RangeNotSatisfiable) => {
                    self.set_status(416);
                    self.set_header("content-range", &format!("bytes */{total}"));
                    let head = self.serialize_head(Some(0));
                    self.conn.send(&head)?.await?;
                    self.sent = true;
                    return Ok(());
                }
                Err(e) => return Err(e),
            },
            None => None,
        };

        let range = match range {
            Some(r) => {
                self.set_status(206);
                self.set_header(
                    "content-range",
                    &format!("bytes {}-{}/{}", r.start, r.end, total),
                );
                self.set_header("accept-ranges", "bytes");
                r
            }
            None => {
                self.set_status(200);
                self.set_header("accept-ranges", "bytes");
                if total == 0 {
                    let head = self.serialize_head(Some(0));
                    self.conn.send(&head)?.await?;
                    self.sent = true;
                    return Ok(());
                }
                ResolvedRange {
                    start: 0,
                    end: total - 1,
                }
            }
        };

        let head = self.serialize_head(Some(range.len()));
        self.conn.send(&head)?.await?;

        let mut buf = vec![0u8; RANGE_READ_CHUNK];
        let mut offset = range.start;
        let mut remaining = range.len();
        while remaining > 0 {
            let want = (remaining as usize).min(buf.len());
            let n = source.read_at(offset, &mut buf[..want])?;
            if n == 0 {
                return Err(HttpError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    "range source ended early",
                )));
            }
            self.conn.send(&buf[..n])?.await?;
            offset += n as u64;
            remaining -= n as u64;
        }
        self.sent = true;
        Ok(())
    }

    // ── Flush ────────────────────────────────────────────────────────

    /// Serialize and send the buffered response as a single write.
    /// No-op when the handler already sent via a streaming path.
    pub(crate) async fn flush(&mut self) -> Result<(), HttpError> {
        if self.sent {
            return Ok(());
        }
        if self.chunked_started {
            // Handler started streaming but never finished; close out
            // the stream so the client is not left hanging.
            self.conn.send(b"0\r\n\r\n")?.await?;
            self.sent = true;
            return Ok(());
        }
        let mut wire = self.serialize_head(Some(self.body.len() as u64));
        if !self.head_only {
            wire.extend_from_slice(&self.body);
        }
        self.conn.send(&wire)?.await?;
        self.sent = true;
        Ok(())
    }

    fn serialize_head(&self, content_length: Option<u64>) -> Vec<u8> {
        let mut head = Vec::with_capacity(256);
        head.extend_from_slice(
            format!("HTTP/1.1 {} {}\r\n", self.status, status_text(self.status)).as_bytes(),
        );
        let explicit_length = self.headers.iter().any(|(n, _)| n == "content-length");
        for (name, value) in &self.headers {
            head.extend_from_slice(format!("{name}: {value}\r\n").as_bytes());
        }
        if let Some(len) = content_length {
            if !explicit_length {
                head.extend_from_slice(format!("content-length: {len}\r\n").as_bytes());
            }
        }
        let connection = if self.keep_alive { "keep-alive" } else { "close" };
        head.extend_from_slice(format!("connection: {connection}\r\n\r\n").as_bytes());
        head
    }
}

pub(crate) fn status_text(status: u16) -> &'static str {
    match status {
        100 => "Continue",
        101 => "Switching Protocols",
        200 => "OK",
        201 => "Created",
        204 => "No Content",
        206 => "Partial Content",
        301 => "Moved Permanently",
        302 => "Found",
        304 => "Not Modified",
        400 => "Bad Request",
        403 => "Forbidden",
        404 => "Not Found",
        405 => "Method Not Allowed",
        408 => "Request Timeout",
        411 => "Length Required",
        413 => "Payload Too Large",
        416 => "Range Not Satisfiable",
        426 => "Upgrade Required",
        431 => "Request Header Fields Too Large",
        429 => "Too Many Requests",
        500 => "Internal Server Error",
        501 => "Not Implemented",
        503 => "Service Unavailable",
        _ => "Unknown",
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bytes_range_source_reads_windows() {
        let data = Bytes::from_static(b"0123456789");
        assert_eq!(RangeSource::len(&data), 10);

        let mut buf = [0u8; 4];
        assert_eq!(data.read_at(3, &mut buf).unwrap(), 4);
        assert_eq!(&buf, b"3456");

        assert_eq!(data.read_at(8, &mut buf).unwrap(), 2);
        assert_eq!(&buf[..2], b"89");

        assert_eq!(data.read_at(10, &mut buf).unwrap(), 0);
        assert_eq!(data.read_at(100, &mut buf).unwrap(), 0);
    }

    #[test]
    fn status_text_covers_common_codes() {
        assert_eq!(status_text(200), "OK");
        assert_eq!(status_text(206), "Partial Content");
        assert_eq!(status_text(416), "Range Not Satisfiable");
        assert_eq!(status_text(599), "Unknown");
    }
}
