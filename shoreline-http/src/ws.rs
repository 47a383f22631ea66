//! WebSocket upgrade handshake, frame codec, and server-side session.
//!
//! The frame layout follows RFC 6455 exactly: one byte of FIN + three
//! reserved bits + opcode, one byte of MASK + 7-bit length with the
//! 126/127 escapes selecting 16- and 64-bit big-endian extended
//! lengths, an optional 4-byte masking key, then the payload XORed
//! against the key cycling every four bytes.

use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine as _;
use bytes::BytesMut;
use sha1::{Digest, Sha1};
use shoreline::{ConnCtx, ParseResult};

use crate::error::{HttpError, WsError};
use crate::metrics::WS_UPGRADES;
use crate::request::Request;
use crate::response::Response;

const WS_GUID: &str = "258EAFA5-E914-47DA-95CA-C5AB0DC85B11";

/// Cap on a single (possibly fragmented) message: 64 MiB.
const MAX_MESSAGE: usize = 64 * 1024 * 1024;

/// Compute the `Sec-WebSocket-Accept` value for a handshake key.
pub fn accept_key(key: &str) -> String {
    let mut sha = Sha1::new();
    sha.update(key.as_bytes());
    sha.update(WS_GUID.as_bytes());
    BASE64.encode(sha.finalize())
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Opcode {
    Continuation = 0x0,
    Text = 0x1,
    Binary = 0x2,
    Close = 0x8,
    Ping = 0x9,
    Pong = 0xA,
}

impl Opcode {
    fn from_u8(value: u8) -> Result<Self, WsError> {
        match value {
            0x0 => Ok(Opcode::Continuation),
            0x1 => Ok(Opcode::Text),
            0x2 => Ok(Opcode::Binary),
            0x8 => Ok(Opcode::Close),
            0x9 => Ok(Opcode::Ping),
            0xA => Ok(Opcode::Pong),
            other => Err(WsError::InvalidOpcode(other)),
        }
    }

    fn is_control(&self) -> bool {
        matches!(self, Opcode::Close | Opcode::Ping | Opcode::Pong)
    }
}

/// One decoded frame. `payload` has the mask already removed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Frame {
    pub fin: bool,
    pub opcode: Opcode,
    pub masked: bool,
    pub payload: Vec<u8>,
}

/// Outcome of [`decode_frame`] on a byte prefix.
#[derive(Debug, PartialEq, Eq)]
pub enum DecodeResult {
    Complete { frame: Frame, consumed: usize },
    NeedMore,
}

fn apply_mask(payload: &mut [u8], key: [u8; 4]) {
    for (i, b) in payload.iter_mut().enumerate() {
        *b ^= key[i % 4];
    }
}

/// Encode one frame. `mask` carries the masking key for client-to-server
/// frames; server-to-client frames pass `None`.
pub fn encode_frame(fin: bool, opcode: Opcode, mask: Option<[u8; 4]>, payload: &[u8]) -> Vec<u8> {
    let mut out = Vec::with_capacity(payload.len() + 14);
    let fin_bit = if fin { 0x80 } else { 0x00 };
    out.push(fin_bit | opcode as u8);

    let mask_bit = if mask.is_some() { 0x80 } else { 0x00 };
    if payload.len() < 126 {
        out.push(mask_bit | payload.len() as u8);
    } else if payload.len() <= u16::MAX as usize {
        out.push(mask_bit | 126);
        out.extend_from_slice(&(payload.len() as u16).to_be_bytes());
    } else {
        out.push(mask_bit | 127);
        out.extend_from_slice(&(payload.len() as u64).to_be_bytes());
    }

    match mask {
        Some(key) => {
            out.extend_from_slice(&key);
            let start = out.len();
            out.extend_from_slice(payload);
            apply_mask(&mut out[start..], key);
        }
        None => out.extend_from_slice(payload),
    }
    out
}

/// Decode one frame from a byte prefix. Returns `NeedMore` until the
/// whole frame is present; never consumes a partial frame.
pub fn decode_frame(data: &[u8]) -> Result<DecodeResult, WsError> {
    if data.len() < 2 {
        return Ok(DecodeResult::NeedMore);
    }
    let b0 = data[0];
    let b1 = data[1];
    if b0 & 0x70 != 0 {
        return Err(WsError::ReservedBits);
    }
    let fin = b0 & 0x80 != 0;
    let opcode = Opcode::from_u8(b0 & 0x0F)?;
    let masked = b1 & 0x80 != 0;

    let mut pos = 2;
    let len = match b1 & 0x7F {
        126 => {
            if data.len() < pos + 2 {
                return Ok(DecodeResult::NeedMore);
            }
            let len = u16::from_be_bytes([data[pos], data[pos + 1]]) as usize;
            pos += 2;
            len
        }
        127 => {
            if data.len() < pos + 8 {
                return Ok(DecodeResult::NeedMore);
            }
            let mut bytes = [0u8; 8];
            bytes.copy_from_slice(&data[pos..pos + 8]);
            pos += 8;
            let len = u64::from_be_bytes(bytes);
            if len > MAX_MESSAGE as u64 {
                return Err(WsError::MessageTooLarge);
            }
            len as usize
        }
        short => short as usize,
    };

    if opcode.is_control() && (!fin || len >= 126) {
        return Err(WsError::BadControlFrame);
    }

    let key = if masked {
        if data.len() < pos + 4 {
            return Ok(DecodeResult::NeedMore);
        }
        let key = [data[pos], data[pos + 1], data[pos + 2], data[pos + 3]];
        pos += 4;
        Some(key)
    } else {
        None
    };

    if data.len() < pos + len {
        return Ok(DecodeResult::NeedMore);
    }
    let mut payload = data[pos..pos + len].to_vec();
    if let Some(key) = key {
        apply_mask(&mut payload, key);
    }
    Ok(DecodeResult::Complete {
        frame: Frame {
            fin,
            opcode,
            masked,
            payload,
        },
        consumed: pos + len,
    })
}

/// A complete message assembled from one or more frames.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WsMessage {
    Text(String),
    Binary(Vec<u8>),
    /// Peer initiated (or acknowledged) close, with the status code if
    /// one was carried.
    Close(Option<u16>),
}

/// Validate the upgrade request and perform the handshake.
///
/// A missing `Origin` answers 403 and a missing `Upgrade` or
/// `Sec-WebSocket-Key` answers 400; in both cases the rejection status
/// is left on `resp` for the serve loop to flush and `None` is
/// returned. On success the 101 goes out immediately and the returned
/// session owns the connection for its remaining lifetime.
pub async fn upgrade(req: &Request, resp: &mut Response) -> Result<Option<WsConn>, HttpError> {
    if req.header("origin").is_none() {
        resp.set_status(403);
        return Ok(None);
    }
    let upgrade_ok = req
        .header("upgrade")
        .map(|v| v.eq_ignore_ascii_case("websocket"))
        .unwrap_or(false);
    let key = match req.header("sec-websocket-key") {
        Some(key) if upgrade_ok => key,
        _ => {
            resp.set_status(400);
            return Ok(None);
        }
    };

    let accept = accept_key(key);
    let reply = format!(
        "HTTP/1.1 101 Switching Protocols\r\n\
         upgrade: websocket\r\n\
         connection: Upgrade\r\n\
         sec-websocket-accept: {accept}\r\n\r\n"
    );
    let conn = resp.conn();
    conn.send(reply.as_bytes())?.await?;
    resp.mark_sent();
    resp.upgraded = true;
    WS_UPGRADES.increment();
    Ok(Some(WsConn {
        conn,
        buf: BytesMut::new(),
        fragment: None,
        sent_close: false,
    }))
}

/// Server side of an upgraded WebSocket connection.
pub struct WsConn {
    conn: ConnCtx,
    buf: BytesMut,
    fragment: Option<(Opcode, Vec<u8>)>,
    sent_close: bool,
}

impl WsConn {
    /// Receive the next complete message. Pings are answered and pongs
    /// swallowed internally. A peer close is acknowledged and surfaced
    /// as [`WsMessage::Close`]; the session is over after that.
    pub async fn next_message(&mut self) -> Result<WsMessage, WsError> {
        loop {
            let frame = self.next_frame().await?;
            if !frame.masked {
                return Err(WsError::BadMask);
            }
            match frame.opcode {
                Opcode::Ping => {
                    self.send_frame(Opcode::Pong, &frame.payload).await?;
                }
                Opcode::Pong => {}
                Opcode::Close => {
                    let code = if frame.payload.len() >= 2 {
                        Some(u16::from_be_bytes([frame.payload[0], frame.payload[1]]))
                    } else {
                        None
                    };
                    if !self.sent_close {
                        self.send_frame(Opcode::Close, &frame.payload).await?;
                        self.sent_close = true;
                    }
                    return Ok(WsMessage::Close(code));
                }
                Opcode::Text | Opcode::Binary => {
                    if self.fragment.is_some() {
                        return Err(WsError::BadFragmentation);
                    }
                    if frame.fin {
                        return finish_message(frame.opcode, frame.payload);
                    }
                    self.fragment = Some((frame.opcode, frame.payload));
                }
                Opcode::Continuation => {
                    let (opcode, mut payload) =
                        self.fragment.take().ok_or(WsError::BadFragmentation)?;
                    if payload.len() + frame.payload.len() > MAX_MESSAGE {
                        return Err(WsError::MessageTooLarge);
                    }
                    payload.extend_from_slice(&frame.payload);
                    if frame.fin {
                        return finish_message(opcode, payload);
                    }
                    self.fragment = Some((opcode, payload));
                }
            }
        }
    }

    pub async fn send_text(&self, text: &str) -> Result<(), WsError> {
        self.send_frame(Opcode::Text, text.as_bytes()).await
    }

    pub async fn send_binary(&self, data: &[u8]) -> Result<(), WsError> {
        self.send_frame(Opcode::Binary, data).await
    }

    pub async fn send_ping(&self, data: &[u8]) -> Result<(), WsError> {
        self.send_frame(Opcode::Ping, data).await
    }

    /// Initiate the two-step close: send a close frame carrying `code`,
    /// then wait up to `timeout` for the peer's acknowledgement before
    /// tearing the connection down either way.
    pub async fn close(&mut self, code: u16, timeout: Duration) -> Result<(), WsError> {
        if !self.sent_close {
            self.send_frame(Opcode::Close, &code.to_be_bytes()).await?;
            self.sent_close = true;
        }
        let _ = shoreline::timeout(timeout, self.await_close_ack()).await;
        self.conn.close();
        Ok(())
    }

    async fn await_close_ack(&mut self) {
        loop {
            match self.next_frame().await {
                // Unmasked client frames violate the protocol; stop
                // waiting and let the teardown proceed.
                Ok(frame) if !frame.masked => return,
                Ok(frame) if frame.opcode == Opcode::Close => return,
                Ok(_) => {}
                Err(_) => return,
            }
        }
    }

    async fn send_frame(&self, opcode: Opcode, payload: &[u8]) -> Result<(), WsError> {
        let wire = encode_frame(true, opcode, None, payload);
        self.conn.send(&wire)?.await?;
        Ok(())
    }

    async fn next_frame(&mut self) -> Result<Frame, WsError> {
        loop {
            match decode_frame(&self.buf)? {
                DecodeResult::Complete { frame, consumed } => {
                    let _ = self.buf.split_to(consumed);
                    return Ok(frame);
                }
                DecodeResult::NeedMore => {}
            }
            let conn = self.conn;
            let buf = &mut self.buf;
            let n = conn
                .with_data(|data| {
                    buf.extend_from_slice(data);
                    ParseResult::Consumed(data.len())
                })
                .await;
            if n == 0 {
                return Err(WsError::ConnectionClosed);
            }
        }
    }
}

fn finish_message(opcode: Opcode, payload: Vec<u8>) -> Result<WsMessage, WsError> {
    match opcode {
        Opcode::Text => String::from_utf8(payload)
            .map(WsMessage::Text)
            .map_err(|_| WsError::BadUtf8),
        _ => Ok(WsMessage::Binary(payload)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rfc6455_accept_key_vector() {
        assert_eq!(
            accept_key("dGhlIHNhbXBsZSBub25jZQ=="),
            "s3pPLMBiTxaQ9kYGzzhZRbK+xOo="
        );
    }

    #[test]
    fn unmasked_text_frame_layout() {
        let wire = encode_frame(true, Opcode::Text, None, b"Hello");
        assert_eq!(wire, [0x81, 0x05, b'H', b'e', b'l', b'l', b'o']);
    }

    #[test]
    fn rfc6455_masked_hello_vector() {
        let wire = encode_frame(true, Opcode::Text, Some([0x37, 0xfa, 0x21, 0x3d]), b"Hello");
        assert_eq!(
            wire,
            [0x81, 0x85, 0x37, 0xfa, 0x21, 0x3d, 0x7f, 0x9f, 0x4d, 0x51, 0x58]
        );
    }

    fn roundtrip_masked(len: usize) {
        let payload: Vec<u8> = (0..len).map(|i| (i % 256) as u8).collect();
        let wire = encode_frame(true, Opcode::Binary, Some([0xA1, 0xB2, 0xC3, 0xD4]), &payload);
        match decode_frame(&wire).unwrap() {
            DecodeResult::Complete { frame, consumed } => {
                assert_eq!(consumed, wire.len());
                assert!(frame.fin);
                assert!(frame.masked);
                assert_eq!(frame.opcode, Opcode::Binary);
                assert_eq!(frame.payload, payload);
            }
            DecodeResult::NeedMore => panic!("frame of len {len} did not decode"),
        }
    }

    #[test]
    fn mask_roundtrip_at_length_boundaries() {
        roundtrip_masked(0);
        roundtrip_masked(125);
        roundtrip_masked(126);
        roundtrip_masked(65536);
    }

    #[test]
    fn extended_length_escapes_chosen_correctly() {
        let wire = encode_frame(true, Opcode::Binary, None, &[0u8; 125]);
        assert_eq!(wire[1], 125);

        let wire = encode_frame(true, Opcode::Binary, None, &[0u8; 126]);
        assert_eq!(wire[1], 126);
        assert_eq!(u16::from_be_bytes([wire[2], wire[3]]), 126);

        let wire = encode_frame(true, Opcode::Binary, None, &[0u8; 65536]);
        assert_eq!(wire[1], 127);
        let mut len = [0u8; 8];
        len.copy_from_slice(&wire[2..10]);
        assert_eq!(u64::from_be_bytes(len), 65536);
    }

    #[test]
    fn partial_input_never_consumes() {
        let wire = encode_frame(true, Opcode::Text, Some([1, 2, 3, 4]), b"partial test");
        for cut in 0..wire.len() {
            assert_eq!(
                decode_frame(&wire[..cut]).unwrap(),
                DecodeResult::NeedMore,
                "cut at {cut}"
            );
        }
    }

    #[test]
    fn reserved_bits_rejected() {
        assert!(matches!(
            decode_frame(&[0xC1, 0x00]),
            Err(WsError::ReservedBits)
        ));
    }

    #[test]
    fn unknown_opcode_rejected() {
        assert!(matches!(
            decode_frame(&[0x83, 0x00]),
            Err(WsError::InvalidOpcode(0x3))
        ));
    }

    #[test]
    fn fragmented_control_frame_rejected() {
        // Ping with FIN=0.
        assert!(matches!(
            decode_frame(&[0x09, 0x00]),
            Err(WsError::BadControlFrame)
        ));
    }

    #[test]
    fn oversized_control_frame_rejected() {
        // Close with the 16-bit length escape.
        assert!(matches!(
            decode_frame(&[0x88, 0x7E, 0x00, 0x7E]),
            Err(WsError::BadControlFrame)
        ));
    }

    #[test]
    fn decode_leaves_following_bytes() {
        let mut wire = encode_frame(true, Opcode::Text, Some([9, 9, 9, 9]), b"one");
        let second = encode_frame(true, Opcode::Text, Some([9, 9, 9, 9]), b"two");
        wire.extend_from_slice(&second);
        match decode_frame(&wire).unwrap() {
            DecodeResult::Complete { frame, consumed } => {
                assert_eq!(frame.payload, b"one");
                assert_eq!(consumed, wire.len() - second.len());
            }
            DecodeResult::NeedMore => panic!("first frame should decode"),
        }
    }
}
