use std::io::{self, Read as _, Write as _};
use std::sync::Arc;

use rustls::pki_types::ServerName;
use rustls::{ClientConnection, ServerConnection};

use crate::accumulator::AccumulatorTable;
use crate::buffer::SendCopyPool;
use crate::ring::Ring;

/// Server (accepted) or client (outbound) rustls session.
pub enum TlsSession {
    Server(ServerConnection),
    Client(ClientConnection),
}

impl TlsSession {
    fn read_tls(&mut self, rd: &mut dyn io::Read) -> io::Result<usize> {
        match self {
            TlsSession::Server(c) => c.read_tls(rd),
            TlsSession::Client(c) => c.read_tls(rd),
        }
    }

    fn write_tls(&mut self, wr: &mut dyn io::Write) -> io::Result<usize> {
        match self {
            TlsSession::Server(c) => c.write_tls(wr),
            TlsSession::Client(c) => c.write_tls(wr),
        }
    }

    fn process_new_packets(&mut self) -> Result<rustls::IoState, rustls::Error> {
        match self {
            TlsSession::Server(c) => c.process_new_packets(),
            TlsSession::Client(c) => c.process_new_packets(),
        }
    }

    fn reader(&mut self) -> rustls::Reader<'_> {
        match self {
            TlsSession::Server(c) => c.reader(),
            TlsSession::Client(c) => c.reader(),
        }
    }

    fn writer(&mut self) -> rustls::Writer<'_> {
        match self {
            TlsSession::Server(c) => c.writer(),
            TlsSession::Client(c) => c.writer(),
        }
    }

    fn wants_write(&self) -> bool {
        match self {
            TlsSession::Server(c) => c.wants_write(),
            TlsSession::Client(c) => c.wants_write(),
        }
    }

    fn is_handshaking(&self) -> bool {
        match self {
            TlsSession::Server(c) => c.is_handshaking(),
            TlsSession::Client(c) => c.is_handshaking(),
        }
    }

    fn send_close_notify(&mut self) {
        match self {
            TlsSession::Server(c) => c.send_close_notify(),
            TlsSession::Client(c) => c.send_close_notify(),
        }
    }
}

struct TlsConn {
    session: TlsSession,
    handshake_complete: bool,
}

/// TLS sessions indexed by connection slot. A separate Driver field so
/// borrows can be split against the accumulator table and the ring.
pub struct TlsTable {
    conns: Vec<Option<TlsConn>>,
    server_config: Option<Arc<rustls::ServerConfig>>,
    client_config: Option<Arc<rustls::ClientConfig>>,
    /// Shared ciphertext scratch, one per worker. Sessions are processed
    /// one at a time, so a single buffer suffices.
    write_buf: Vec<u8>,
}

impl TlsTable {
    pub fn new(
        max_connections: u32,
        server_config: Option<Arc<rustls::ServerConfig>>,
        client_config: Option<Arc<rustls::ClientConfig>>,
    ) -> Self {
        let mut conns = Vec::with_capacity(max_connections as usize);
        conns.resize_with(max_connections as usize, || None);
        TlsTable {
            conns,
            server_config,
            client_config,
            write_buf: Vec::new(),
        }
    }

    /// True when accepted connections speak TLS.
    pub fn has_server_config(&self) -> bool {
        self.server_config.is_some()
    }

    /// True when outbound TLS connects are possible.
    pub fn has_client_config(&self) -> bool {
        self.client_config.is_some()
    }

    /// Attach a server session to an accepted connection.
    pub fn create_server(&mut self, conn_index: u32) {
        let server_config = self
            .server_config
            .as_ref()
            .expect("create_server without server_config");
        let session = ServerConnection::new(server_config.clone())
            .expect("rustls ServerConnection::new failed");
        self.conns[conn_index as usize] = Some(TlsConn {
            session: TlsSession::Server(session),
            handshake_complete: false,
        });
    }

    /// Attach a client session to an outbound connection.
    pub fn create_client(&mut self, conn_index: u32, server_name: ServerName<'static>) {
        let client_config = self
            .client_config
            .as_ref()
            .expect("create_client without client_config");
        let session = ClientConnection::new(client_config.clone(), server_name)
            .expect("rustls ClientConnection::new failed");
        self.conns[conn_index as usize] = Some(TlsConn {
            session: TlsSession::Client(session),
            handshake_complete: false,
        });
    }

    pub fn has_session(&self, conn_index: u32) -> bool {
        self.conns[conn_index as usize].is_some()
    }

    pub fn remove(&mut self, conn_index: u32) {
        self.conns[conn_index as usize] = None;
    }
}

/// Result of feeding received ciphertext into a session.
pub enum TlsRecvResult {
    /// Bytes processed; any plaintext landed in the accumulator.
    Ok,
    /// Handshake just finished; accepted connections become established
    /// and get their task spawned now.
    HandshakeJustCompleted,
    /// Protocol error; an alert was flushed where possible.
    Error(rustls::Error),
    /// Peer sent close_notify, or no session exists.
    Closed,
}

/// Feed ciphertext into the session, decrypt plaintext into the
/// accumulator, flush any session output (handshake records, alerts).
pub fn feed_recv(
    tls_table: &mut TlsTable,
    accumulators: &mut AccumulatorTable,
    ring: &mut Ring,
    send_copy_pool: &mut SendCopyPool,
    scratch: &mut [u8],
    conn_index: u32,
    ciphertext: &[u8],
) -> TlsRecvResult {
    let tls_conn = match tls_table.conns[conn_index as usize].as_mut() {
        Some(tc) => tc,
        None => return TlsRecvResult::Closed,
    };

    let was_handshaking = !tls_conn.handshake_complete;

    let mut cursor = io::Cursor::new(ciphertext);
    if let Err(e) = tls_conn.session.read_tls(&mut cursor) {
        return TlsRecvResult::Error(rustls::Error::General(e.to_string()));
    }

    let state = match tls_conn.session.process_new_packets() {
        Ok(state) => state,
        Err(e) => {
            // Flush the alert before surfacing the error.
            if tls_conn.session.wants_write() {
                flush_session_output(
                    tls_conn,
                    &mut tls_table.write_buf,
                    ring,
                    send_copy_pool,
                    conn_index,
                    false,
                );
            }
            return TlsRecvResult::Error(e);
        }
    };

    if state.plaintext_bytes_to_read() > 0 {
        let mut reader = tls_conn.session.reader();
        loop {
            match reader.read(scratch) {
                Ok(0) => break,
                Ok(n) => {
                    accumulators.append(conn_index, &scratch[..n]);
                }
                Err(ref e) if e.kind() == io::ErrorKind::WouldBlock => break,
                Err(_) => break,
            }
        }
    }

    if tls_conn.session.wants_write() {
        flush_session_output(
            tls_conn,
            &mut tls_table.write_buf,
            ring,
            send_copy_pool,
            conn_index,
            false,
        );
    }

    if was_handshaking && !tls_conn.session.is_handshaking() {
        tls_conn.handshake_complete = true;
        return TlsRecvResult::HandshakeJustCompleted;
    }

    if state.peer_has_closed() {
        return TlsRecvResult::Closed;
    }

    TlsRecvResult::Ok
}

/// Encrypt plaintext and return the ciphertext records. The caller puts
/// them on the wire through its ordered send queue.
pub fn encrypt(tls_table: &mut TlsTable, conn_index: u32, plaintext: &[u8]) -> io::Result<Vec<u8>> {
    let (conn_slot, write_buf) = borrow_conn_and_buf(tls_table, conn_index);
    let tls_conn = conn_slot.as_mut().ok_or_else(|| {
        io::Error::new(io::ErrorKind::NotConnected, "no TLS session for connection")
    })?;

    tls_conn
        .session
        .writer()
        .write_all(plaintext)
        .map_err(io::Error::other)?;

    write_buf.clear();
    while tls_conn.session.wants_write() {
        tls_conn
            .session
            .write_tls(write_buf)
            .map_err(io::Error::other)?;
    }

    Ok(std::mem::take(write_buf))
}

/// Flush any pending session output, e.g. a client's initial hello after
/// the TCP connect lands.
pub fn flush_output(
    tls_table: &mut TlsTable,
    ring: &mut Ring,
    send_copy_pool: &mut SendCopyPool,
    conn_index: u32,
) {
    let (conn_slot, write_buf) = borrow_conn_and_buf(tls_table, conn_index);
    if let Some(tls_conn) = conn_slot {
        flush_session_output(tls_conn, write_buf, ring, send_copy_pool, conn_index, false);
    }
}

/// Queue a close_notify alert. The ciphertext rides IO_LINK'd SQEs so a
/// Close SQE pushed right after is chained behind the alert bytes.
pub fn send_close_notify(
    tls_table: &mut TlsTable,
    conn_index: u32,
    ring: &mut Ring,
    send_copy_pool: &mut SendCopyPool,
) {
    let (conn_slot, write_buf) = borrow_conn_and_buf(tls_table, conn_index);
    if let Some(tls_conn) = conn_slot {
        tls_conn.session.send_close_notify();
        flush_session_output(tls_conn, write_buf, ring, send_copy_pool, conn_index, true);
    }
}

/// Flush pending session output as fire-and-forget TlsSend SQEs; the
/// completion handler only releases the pool slots. With `linked` every
/// SQE carries IO_LINK.
fn flush_session_output(
    tls_conn: &mut TlsConn,
    write_buf: &mut Vec<u8>,
    ring: &mut Ring,
    send_copy_pool: &mut SendCopyPool,
    conn_index: u32,
    linked: bool,
) {
    write_buf.clear();
    if tls_conn.session.write_tls(write_buf).is_err() {
        return;
    }
    if write_buf.is_empty() {
        return;
    }

    let slot_size = send_copy_pool.slot_size() as usize;
    for chunk in write_buf.chunks(slot_size) {
        if let Some((slot, ptr, len)) = send_copy_pool.copy_in(chunk) {
            if linked {
                let _ = ring.submit_tls_send_linked(conn_index, ptr, len, slot);
            } else {
                let _ = ring.submit_tls_send(conn_index, ptr, len, slot);
            }
        }
    }
}

/// Split-borrow one session slot and the shared scratch; `conns[i]` and
/// `write_buf` are disjoint fields.
fn borrow_conn_and_buf(
    table: &mut TlsTable,
    conn_index: u32,
) -> (&mut Option<TlsConn>, &mut Vec<u8>) {
    (&mut table.conns[conn_index as usize], &mut table.write_buf)
}
