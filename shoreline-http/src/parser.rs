//! Streaming HTTP/1.1 request parser.
//!
//! Tolerates the message arriving split across any number of reads and
//! more than one message arriving in a single read. Unconsumed input is
//! buffered, never discarded; bytes past the end of a complete request
//! stay buffered for the next cycle.

use bytes::BytesMut;

use crate::error::HttpError;
use crate::request::Request;

/// Outcome of one [`RequestParser::feed`] call.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FeedProgress {
    /// The request in progress is fully parsed.
    Complete,
    /// More input is required to make progress.
    NeedMore,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ChunkState {
    SizeLine,
    Data { remaining: usize },
    DataCrlf,
    Trailer,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum State {
    AwaitingRequestLine,
    AwaitingHeaders,
    BodyNone,
    BodyContentLength { remaining: usize },
    BodyChunked(ChunkState),
    Complete,
}

/// Default cap on buffered body size: 16 MiB.
pub const DEFAULT_MAX_BODY: usize = 16 * 1024 * 1024;

/// Cap on the request line plus header section (and chunked trailers):
/// 64 KiB.
pub const MAX_HEAD: usize = 64 * 1024;

/// Incremental request parser. One instance per connection, reused
/// across keep-alive cycles via [`reset`](Self::reset).
pub struct RequestParser {
    state: State,
    buf: BytesMut,
    max_body: usize,
    /// Head bytes consumed so far this cycle, bounded by [`MAX_HEAD`].
    head_bytes: usize,
    /// Resume point for the CRLF scan, so byte-at-a-time feeds of one
    /// long line stay linear.
    scan: usize,
}

impl Default for RequestParser {
    fn default() -> Self {
        Self::new()
    }
}

impl RequestParser {
    pub fn new() -> Self {
        Self::with_max_body(DEFAULT_MAX_BODY)
    }

    pub fn with_max_body(max_body: usize) -> Self {
        Self {
            state: State::AwaitingRequestLine,
            buf: BytesMut::new(),
            max_body,
            head_bytes: 0,
            scan: 0,
        }
    }

    /// Bytes buffered but not yet consumed by a complete request.
    pub fn buffered(&self) -> usize {
        self.buf.len()
    }

    /// Begin the next request cycle. Pipelined bytes left over from the
    /// previous cycle stay buffered and are parsed immediately on the
    /// next feed.
    pub fn reset(&mut self) {
        self.state = State::AwaitingRequestLine;
        self.head_bytes = 0;
        self.scan = 0;
    }

    /// Split the next CRLF-terminated line off the buffer, remembering
    /// how far the scan got when the terminator has not arrived yet.
    fn take_line(&mut self) -> Option<BytesMut> {
        match find_crlf(&self.buf, self.scan) {
            Some(pos) => {
                self.scan = 0;
                Some(self.buf.split_to(pos + 2))
            }
            None => {
                // Back up one byte in case the buffer ends on a bare CR.
                self.scan = self.buf.len().saturating_sub(1);
                None
            }
        }
    }

    /// Account a consumed head line against [`MAX_HEAD`], or check the
    /// unterminated remainder when no full line is buffered yet.
    fn charge_head(&mut self, line: Option<usize>) -> Result<(), HttpError> {
        match line {
            Some(len) => self.head_bytes += len,
            None => {
                if self.head_bytes + self.buf.len() > MAX_HEAD {
                    return Err(HttpError::HeaderTooLarge);
                }
            }
        }
        if self.head_bytes > MAX_HEAD {
            return Err(HttpError::HeaderTooLarge);
        }
        Ok(())
    }

    /// Buffer raw input without advancing the state machine. Used from
    /// recv callbacks where errors cannot propagate; pair with
    /// [`poll_buffered`](Self::poll_buffered).
    pub fn append(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    /// Feed one read's worth of input and advance the state machine as
    /// far as the buffered bytes allow, filling `req` along the way.
    pub fn feed(&mut self, data: &[u8], req: &mut Request) -> Result<FeedProgress, HttpError> {
        self.buf.extend_from_slice(data);
        self.advance(req)
    }

    /// Drive the state machine on already-buffered bytes only. Used at
    /// the start of a cycle to consume pipelined input before recv.
    pub fn poll_buffered(&mut self, req: &mut Request) -> Result<FeedProgress, HttpError> {
        self.advance(req)
    }

    fn advance(&mut self, req: &mut Request) -> Result<FeedProgress, HttpError> {
        loop {
            match self.state {
                State::AwaitingRequestLine => {
                    let line = match self.take_line() {
                        Some(line) => line,
                        None => {
                            self.charge_head(None)?;
                            return Ok(FeedProgress::NeedMore);
                        }
                    };
                    self.charge_head(Some(line.len()))?;
                    parse_request_line(&line[..line.len() - 2], req)?;
                    self.state = State::AwaitingHeaders;
                }
                State::AwaitingHeaders => {
                    let line = match self.take_line() {
                        Some(line) => line,
                        None => {
                            self.charge_head(None)?;
                            return Ok(FeedProgress::NeedMore);
                        }
                    };
                    self.charge_head(Some(line.len()))?;
                    let line = &line[..line.len() - 2];
                    if line.is_empty() {
                        self.state = body_state_from_headers(req, self.max_body)?;
                        continue;
                    }
                    let text =
                        std::str::from_utf8(line).map_err(|_| HttpError::BadHeader)?;
                    match text.split_once(':') {
                        Some((name, value)) => {
                            req.headers.push((
                                name.trim().to_ascii_lowercase(),
                                value.trim().to_string(),
                            ));
                        }
                        // Soft line-folding: a separator-less non-empty
                        // line continues the previous header's value.
                        None => match req.headers.last_mut() {
                            Some((_, value)) => {
                                value.push(' ');
                                value.push_str(text.trim());
                            }
                            None => return Err(HttpError::BadHeader),
                        },
                    }
                }
                State::BodyNone => {
                    self.state = State::Complete;
                }
                State::BodyContentLength { remaining } => {
                    if remaining == 0 {
                        self.state = State::Complete;
                        continue;
                    }
                    if self.buf.is_empty() {
                        return Ok(FeedProgress::NeedMore);
                    }
                    let take = remaining.min(self.buf.len());
                    let piece = self.buf.split_to(take);
                    req.body.extend_from_slice(&piece);
                    self.state = State::BodyContentLength {
                        remaining: remaining - take,
                    };
                }
                State::BodyChunked(chunk) => match chunk {
                    ChunkState::SizeLine => {
                        let line = match self.take_line() {
                            Some(line) => line,
                            None => return Ok(FeedProgress::NeedMore),
                        };
                        let size = parse_chunk_size(&line[..line.len() - 2])?;
                        if req.body.len().saturating_add(size) > self.max_body {
                            return Err(HttpError::BodyTooLarge);
                        }
                        self.state = if size == 0 {
                            State::BodyChunked(ChunkState::Trailer)
                        } else {
                            State::BodyChunked(ChunkState::Data { remaining: size })
                        };
                    }
                    ChunkState::Data { remaining } => {
                        if self.buf.is_empty() {
                            return Ok(FeedProgress::NeedMore);
                        }
                        let take = remaining.min(self.buf.len());
                        let piece = self.buf.split_to(take);
                        req.body.extend_from_slice(&piece);
                        self.state = if take == remaining {
                            State::BodyChunked(ChunkState::DataCrlf)
                        } else {
                            State::BodyChunked(ChunkState::Data {
                                remaining: remaining - take,
                            })
                        };
                    }
                    ChunkState::DataCrlf => {
                        if self.buf.len() < 2 {
                            return Ok(FeedProgress::NeedMore);
                        }
                        let crlf = self.buf.split_to(2);
                        if &crlf[..] != b"\r\n" {
                            return Err(HttpError::BadChunk);
                        }
                        self.state = State::BodyChunked(ChunkState::SizeLine);
                    }
                    ChunkState::Trailer => {
                        // Trailer lines after the zero chunk are skipped
                        // up to the terminating empty line, but still
                        // count against the head cap.
                        let line = match self.take_line() {
                            Some(line) => line,
                            None => {
                                self.charge_head(None)?;
                                return Ok(FeedProgress::NeedMore);
                            }
                        };
                        self.charge_head(Some(line.len()))?;
                        if line.len() == 2 {
                            self.state = State::Complete;
                        }
                    }
                },
                State::Complete => return Ok(FeedProgress::Complete),
            }
        }
    }
}

fn find_crlf(data: &[u8], from: usize) -> Option<usize> {
    (from..data.len().saturating_sub(1)).find(|&i| data[i] == b'\r' && data[i + 1] == b'\n')
}

fn parse_request_line(line: &[u8], req: &mut Request) -> Result<(), HttpError> {
    let text = std::str::from_utf8(line).map_err(|_| HttpError::BadRequestLine)?;
    let mut parts = text.split(' ').filter(|s| !s.is_empty());
    let method = parts.next().ok_or(HttpError::BadRequestLine)?;
    let target = parts.next().ok_or(HttpError::BadRequestLine)?;
    let version = parts.next().ok_or(HttpError::BadRequestLine)?;
    if parts.next().is_some() || !version.starts_with("HTTP/") {
        return Err(HttpError::BadRequestLine);
    }
    req.method = method.to_string();
    req.target = target.to_string();
    req.version = version.to_string();
    Ok(())
}

fn body_state_from_headers(req: &Request, max_body: usize) -> Result<State, HttpError> {
    if let Some(te) = req.header("transfer-encoding") {
        if te.eq_ignore_ascii_case("chunked") {
            return Ok(State::BodyChunked(ChunkState::SizeLine));
        }
    }
    match req.header("content-length") {
        Some(v) => {
            let len: usize = v.trim().parse().map_err(|_| HttpError::BadContentLength)?;
            if len > max_body {
                return Err(HttpError::BodyTooLarge);
            }
            Ok(State::BodyContentLength { remaining: len })
        }
        None => Ok(State::BodyNone),
    }
}

/// Parse one `<hex-size>[;extensions]` chunk size line.
fn parse_chunk_size(line: &[u8]) -> Result<usize, HttpError> {
    let text = std::str::from_utf8(line).map_err(|_| HttpError::BadChunk)?;
    let hex = text.split(';').next().unwrap_or("").trim();
    if hex.is_empty() {
        return Err(HttpError::BadChunk);
    }
    usize::from_str_radix(hex, 16).map_err(|_| HttpError::BadChunk)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn parse_whole(input: &[u8]) -> Result<(Request, RequestParser), HttpError> {
        let mut parser = RequestParser::new();
        let mut req = Request::default();
        match parser.feed(input, &mut req)? {
            FeedProgress::Complete => Ok((req, parser)),
            FeedProgress::NeedMore => panic!("expected complete parse"),
        }
    }

    #[test]
    fn simple_get() {
        let (req, parser) = parse_whole(b"GET /x HTTP/1.1\r\nHost: a\r\n\r\n").unwrap();
        assert_eq!(req.method(), "GET");
        assert_eq!(req.path(), "/x");
        assert_eq!(req.version(), "HTTP/1.1");
        assert_eq!(req.header("host"), Some("a"));
        assert!(req.body().is_empty());
        assert_eq!(parser.buffered(), 0);
    }

    #[test]
    fn two_read_split_mid_header() {
        let mut parser = RequestParser::new();
        let mut req = Request::default();
        assert_eq!(
            parser.feed(b"GET /x HTTP/1.1\r\nHo", &mut req).unwrap(),
            FeedProgress::NeedMore
        );
        assert_eq!(
            parser.feed(b"st: a\r\n\r\n", &mut req).unwrap(),
            FeedProgress::Complete
        );
        assert_eq!(req.method(), "GET");
        assert_eq!(req.path(), "/x");
        assert_eq!(req.header("host"), Some("a"));
    }

    #[test]
    fn any_split_point_yields_same_request() {
        let raw = b"POST /submit?k=v HTTP/1.1\r\nHost: h\r\nContent-Length: 5\r\n\r\nhello";
        let (whole, _) = parse_whole(raw).unwrap();

        for split in 1..raw.len() {
            let mut parser = RequestParser::new();
            let mut req = Request::default();
            let first = parser.feed(&raw[..split], &mut req).unwrap();
            let progress = match first {
                FeedProgress::Complete => first,
                FeedProgress::NeedMore => parser.feed(&raw[split..], &mut req).unwrap(),
            };
            assert_eq!(progress, FeedProgress::Complete, "split at {split}");
            assert_eq!(req.method(), whole.method());
            assert_eq!(req.target(), whole.target());
            assert_eq!(req.headers(), whole.headers());
            assert_eq!(req.body(), whole.body());
        }
    }

    #[test]
    fn byte_at_a_time() {
        let raw = b"GET / HTTP/1.1\r\nHost: a\r\nAccept: */*\r\n\r\n";
        let mut parser = RequestParser::new();
        let mut req = Request::default();
        let mut done = false;
        for &b in raw.iter() {
            if parser.feed(&[b], &mut req).unwrap() == FeedProgress::Complete {
                done = true;
            }
        }
        assert!(done);
        assert_eq!(req.header("accept"), Some("*/*"));
    }

    #[test]
    fn header_keys_lowercased() {
        let (req, _) = parse_whole(b"GET / HTTP/1.1\r\nHoSt: A\r\nX-FOO: Bar\r\n\r\n").unwrap();
        assert_eq!(req.headers()[0].0, "host");
        assert_eq!(req.headers()[1].0, "x-foo");
        assert_eq!(req.header("x-foo"), Some("Bar"));
    }

    #[test]
    fn soft_line_folding_continues_previous_value() {
        let (req, _) =
            parse_whole(b"GET / HTTP/1.1\r\nX-Long: part one\r\npart two\r\n\r\n").unwrap();
        assert_eq!(req.header("x-long"), Some("part one part two"));
    }

    #[test]
    fn folding_without_previous_header_fails() {
        let mut parser = RequestParser::new();
        let mut req = Request::default();
        let err = parser
            .feed(b"GET / HTTP/1.1\r\nno separator here\r\n\r\n", &mut req)
            .unwrap_err();
        assert!(matches!(err, HttpError::BadHeader));
    }

    #[test]
    fn content_length_body_byte_exact() {
        let (req, parser) = parse_whole(
            b"POST /u HTTP/1.1\r\nHost: a\r\nContent-Length: 4\r\n\r\nbodyEXTRA",
        )
        .unwrap();
        assert_eq!(req.body(), b"body");
        // Pipelined bytes stay buffered.
        assert_eq!(parser.buffered(), 5);
    }

    #[test]
    fn pipelined_requests_do_not_corrupt_state() {
        let mut parser = RequestParser::new();
        let mut req = Request::default();
        let raw = b"GET /one HTTP/1.1\r\nHost: a\r\n\r\nGET /two HTTP/1.1\r\nHost: a\r\n\r\n";
        assert_eq!(parser.feed(raw, &mut req).unwrap(), FeedProgress::Complete);
        assert_eq!(req.path(), "/one");

        req.clear();
        parser.reset();
        assert_eq!(
            parser.poll_buffered(&mut req).unwrap(),
            FeedProgress::Complete
        );
        assert_eq!(req.path(), "/two");
        assert_eq!(parser.buffered(), 0);
    }

    #[test]
    fn chunked_body_roundtrip() {
        let (req, _) = parse_whole(
            b"POST /c HTTP/1.1\r\nHost: a\r\nTransfer-Encoding: chunked\r\n\r\n\
              5\r\nhello\r\n6\r\n world\r\n0\r\n\r\n",
        )
        .unwrap();
        assert_eq!(req.body(), b"hello world");
    }

    #[test]
    fn chunked_empty_body() {
        let (req, _) = parse_whole(
            b"POST /c HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n0\r\n\r\n",
        )
        .unwrap();
        assert!(req.body().is_empty());
    }

    #[test]
    fn chunked_single_byte_body() {
        let (req, _) = parse_whole(
            b"POST /c HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n1\r\nx\r\n0\r\n\r\n",
        )
        .unwrap();
        assert_eq!(req.body(), b"x");
    }

    #[test]
    fn chunked_large_body_split_feeds() {
        // > 64 KiB across two chunks, fed in awkward pieces.
        let big: Vec<u8> = (0..70000u32).map(|i| (i % 251) as u8).collect();
        let mut raw = Vec::new();
        raw.extend_from_slice(b"POST /c HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n");
        raw.extend_from_slice(format!("{:x}\r\n", 40000).as_bytes());
        raw.extend_from_slice(&big[..40000]);
        raw.extend_from_slice(b"\r\n");
        raw.extend_from_slice(format!("{:x}\r\n", 30000).as_bytes());
        raw.extend_from_slice(&big[40000..]);
        raw.extend_from_slice(b"\r\n0\r\n\r\n");

        let mut parser = RequestParser::new();
        let mut req = Request::default();
        let mut progress = FeedProgress::NeedMore;
        for piece in raw.chunks(1000) {
            progress = parser.feed(piece, &mut req).unwrap();
        }
        assert_eq!(progress, FeedProgress::Complete);
        assert_eq!(req.body(), &big[..]);
    }

    #[test]
    fn chunked_with_extensions_and_trailers() {
        let (req, _) = parse_whole(
            b"POST /c HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n\
              3;ext=1\r\nabc\r\n0\r\nX-Trailer: v\r\n\r\n",
        )
        .unwrap();
        assert_eq!(req.body(), b"abc");
    }

    #[test]
    fn malformed_chunk_size_is_protocol_error() {
        let mut parser = RequestParser::new();
        let mut req = Request::default();
        let err = parser
            .feed(
                b"POST /c HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\nzz\r\n",
                &mut req,
            )
            .unwrap_err();
        assert!(matches!(err, HttpError::BadChunk));
    }

    #[test]
    fn missing_chunk_crlf_is_protocol_error() {
        let mut parser = RequestParser::new();
        let mut req = Request::default();
        let err = parser
            .feed(
                b"POST /c HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\n3\r\nabcXX",
                &mut req,
            )
            .unwrap_err();
        assert!(matches!(err, HttpError::BadChunk));
    }

    #[test]
    fn bad_request_line_missing_tokens() {
        let mut parser = RequestParser::new();
        let mut req = Request::default();
        let err = parser.feed(b"GET\r\n", &mut req).unwrap_err();
        assert!(matches!(err, HttpError::BadRequestLine));
    }

    #[test]
    fn bad_content_length_value() {
        let mut parser = RequestParser::new();
        let mut req = Request::default();
        let err = parser
            .feed(b"POST / HTTP/1.1\r\nContent-Length: nope\r\n\r\n", &mut req)
            .unwrap_err();
        assert!(matches!(err, HttpError::BadContentLength));
    }

    #[test]
    fn content_length_over_limit_rejected() {
        let mut parser = RequestParser::with_max_body(10);
        let mut req = Request::default();
        let err = parser
            .feed(b"POST / HTTP/1.1\r\nContent-Length: 100000\r\n\r\n", &mut req)
            .unwrap_err();
        assert!(matches!(err, HttpError::BodyTooLarge));
        assert!(req.body().is_empty());
    }

    #[test]
    fn endless_header_lines_rejected() {
        let mut parser = RequestParser::new();
        let mut req = Request::default();
        assert_eq!(
            parser.feed(b"GET / HTTP/1.1\r\n", &mut req).unwrap(),
            FeedProgress::NeedMore
        );
        let line = b"x-filler: aaaaaaaaaaaaaaaaaaaaaaaaaaaaaaaa\r\n";
        let mut result = Ok(FeedProgress::NeedMore);
        for _ in 0..(MAX_HEAD / line.len() + 2) {
            result = parser.feed(line, &mut req);
            if result.is_err() {
                break;
            }
        }
        assert!(matches!(result, Err(HttpError::HeaderTooLarge)));
    }

    #[test]
    fn single_unterminated_line_rejected() {
        let mut parser = RequestParser::new();
        let mut req = Request::default();
        let chunk = [b'a'; 4096];
        let mut result = Ok(FeedProgress::NeedMore);
        for _ in 0..(MAX_HEAD / chunk.len() + 2) {
            result = parser.feed(&chunk, &mut req);
            if result.is_err() {
                break;
            }
        }
        assert!(matches!(result, Err(HttpError::HeaderTooLarge)));
    }

    #[test]
    fn scan_resumes_across_cr_boundary() {
        // Split exactly between the CR and LF of the request line.
        let mut parser = RequestParser::new();
        let mut req = Request::default();
        assert_eq!(
            parser.feed(b"GET /x HTTP/1.1\r", &mut req).unwrap(),
            FeedProgress::NeedMore
        );
        assert_eq!(
            parser.feed(b"\nHost: a\r\n\r\n", &mut req).unwrap(),
            FeedProgress::Complete
        );
        assert_eq!(req.path(), "/x");
    }

    #[test]
    fn chunked_body_over_limit_rejected() {
        let mut parser = RequestParser::with_max_body(10);
        let mut req = Request::default();
        let err = parser
            .feed(
                b"POST / HTTP/1.1\r\nTransfer-Encoding: chunked\r\n\r\nff\r\n",
                &mut req,
            )
            .unwrap_err();
        assert!(matches!(err, HttpError::BodyTooLarge));
    }
}
