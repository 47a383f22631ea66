use std::io;

/// Errors produced while parsing or serving HTTP/1.1.
#[derive(Debug, thiserror::Error)]
pub enum HttpError {
    /// The peer closed the connection mid-message.
    #[error("connection closed")]
    ConnectionClosed,

    /// Malformed request line (missing method, path, or version).
    #[error("malformed request line")]
    BadRequestLine,

    /// Malformed header line.
    #[error("malformed header")]
    BadHeader,

    /// Invalid Content-Length value.
    #[error("invalid content-length")]
    BadContentLength,

    /// Malformed chunk size line in a chunked body.
    #[error("malformed chunk framing")]
    BadChunk,

    /// Request body exceeds the configured limit.
    #[error("body too large")]
    BodyTooLarge,

    /// Request line and header section exceed the configured limit.
    #[error("header section too large")]
    HeaderTooLarge,

    /// The response was already flushed for this request cycle.
    #[error("response already sent")]
    AlreadySent,

    /// Range header was syntactically invalid or unsatisfiable.
    #[error("range not satisfiable")]
    RangeNotSatisfiable,

    /// The request waited longer than the idle timeout.
    #[error("timeout")]
    Timeout,

    /// Handler-raised failure surfaced through the serve loop.
    #[error("handler error: {0}")]
    Handler(String),

    /// I/O error from the underlying connection.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}

/// Errors produced by the WebSocket codec and session loop.
#[derive(Debug, thiserror::Error)]
pub enum WsError {
    /// The peer closed the connection mid-frame.
    #[error("connection closed")]
    ConnectionClosed,

    /// Opcode outside the known set.
    #[error("invalid opcode {0}")]
    InvalidOpcode(u8),

    /// Reserved bits must be zero.
    #[error("reserved bits set")]
    ReservedBits,

    /// Client frames must be masked, server frames unmasked.
    #[error("mask bit wrong for direction")]
    BadMask,

    /// Control frames require FIN=1 and payload < 126.
    #[error("oversized or fragmented control frame")]
    BadControlFrame,

    /// Continuation frame without a message in progress, or a new data
    /// frame while a fragmented message is open.
    #[error("bad fragmentation sequence")]
    BadFragmentation,

    /// Fragmented message exceeds the configured limit.
    #[error("message too large")]
    MessageTooLarge,

    /// Text message payload was not valid UTF-8.
    #[error("text payload not utf-8")]
    BadUtf8,

    /// I/O error from the underlying connection.
    #[error("io error: {0}")]
    Io(#[from] io::Error),
}
