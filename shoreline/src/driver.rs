use std::collections::VecDeque;
use std::io;
use std::net::SocketAddr;
use std::os::fd::RawFd;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::time::Duration;

use crate::accumulator::AccumulatorTable;
use crate::buffer::{ProvidedBufRing, SendCopyPool};
use crate::completion::{OpTag, UserData};
use crate::config::Config;
use crate::connection::{ConnToken, ConnectionTable, RecvMode};
use crate::error::Error;
use crate::ring::Ring;
use crate::tls::TlsTable;

/// Write a SocketAddr into a sockaddr_storage, return the address length.
pub(crate) fn socket_addr_to_sockaddr(
    addr: SocketAddr,
    storage: &mut libc::sockaddr_storage,
) -> u32 {
    // Zero first so padding bytes are defined.
    unsafe {
        std::ptr::write_bytes(
            storage as *mut _ as *mut u8,
            0,
            std::mem::size_of::<libc::sockaddr_storage>(),
        );
    }
    match addr {
        SocketAddr::V4(v4) => {
            let sa = storage as *mut _ as *mut libc::sockaddr_in;
            unsafe {
                (*sa).sin_family = libc::AF_INET as libc::sa_family_t;
                (*sa).sin_port = v4.port().to_be();
                (*sa).sin_addr.s_addr = u32::from_ne_bytes(v4.ip().octets());
            }
            std::mem::size_of::<libc::sockaddr_in>() as u32
        }
        SocketAddr::V6(v6) => {
            let sa = storage as *mut _ as *mut libc::sockaddr_in6;
            unsafe {
                (*sa).sin6_family = libc::AF_INET6 as libc::sa_family_t;
                (*sa).sin6_port = v6.port().to_be();
                (*sa).sin6_flowinfo = v6.flowinfo();
                (*sa).sin6_addr.s6_addr = v6.ip().octets();
                (*sa).sin6_scope_id = v6.scope_id();
            }
            std::mem::size_of::<libc::sockaddr_in6>() as u32
        }
    }
}

/// Per-connection outbound state. Sends are serialized: one pool slot in
/// flight at a time, further chunks queued behind it, so byte order on
/// the socket matches call order even across partial writes.
pub(crate) struct ConnSendState {
    pub(crate) queue: VecDeque<Vec<u8>>,
    /// Pool slot of the in-flight send, `u16::MAX` when idle.
    pub(crate) in_flight_slot: u16,
    /// Bytes fully written since the send waiter was last woken.
    pub(crate) flushed: u32,
}

impl ConnSendState {
    fn new() -> Self {
        ConnSendState {
            queue: VecDeque::new(),
            in_flight_slot: u16::MAX,
            flushed: 0,
        }
    }

    pub(crate) fn is_idle(&self) -> bool {
        self.in_flight_slot == u16::MAX && self.queue.is_empty()
    }

    fn reset(&mut self) {
        self.queue.clear();
        self.in_flight_slot = u16::MAX;
        self.flushed = 0;
    }
}

/// I/O driver owning all per-worker infrastructure state: the ring, the
/// connection table, buffer pools, accumulators, and TLS sessions.
///
/// The event loop is a `Driver` plus a handler plus an executor.
pub(crate) struct Driver {
    pub(crate) ring: Ring,
    pub(crate) connections: ConnectionTable,
    pub(crate) provided_bufs: ProvidedBufRing,
    pub(crate) send_copy_pool: SendCopyPool,
    pub(crate) accumulators: AccumulatorTable,
    pub(crate) send_states: Vec<ConnSendState>,
    pub(crate) pending_replenish: Vec<u16>,
    pub(crate) accept_rx: Option<crossbeam_channel::Receiver<(RawFd, SocketAddr)>>,
    pub(crate) eventfd: RawFd,
    pub(crate) eventfd_buf: [u8; 8],
    /// Deadline-based flush interval. None disables batched flushing.
    pub(crate) flush_interval: Option<Duration>,
    pub(crate) shutdown_flag: Arc<AtomicBool>,
    pub(crate) shutdown_local: bool,
    pub(crate) tls_table: TlsTable,
    pub(crate) tls_scratch: Vec<u8>,
    /// Pre-allocated sockaddr storage for outbound connect SQEs.
    pub(crate) connect_addrs: Vec<libc::sockaddr_storage>,
    /// Pre-allocated timespec storage for connect deadlines.
    pub(crate) connect_timespecs: Vec<io_uring::types::Timespec>,
    /// Batch buffer for draining CQEs: (user_data, result, flags).
    pub(crate) cqe_batch: Vec<(u64, i32, u32)>,
    pub(crate) tcp_nodelay: bool,
    /// Tick timeout; keeps the loop waking periodically for on_tick even
    /// when no I/O completions are pending.
    pub(crate) tick_timeout_ts: Option<io_uring::types::Timespec>,
    pub(crate) tick_timeout_armed: bool,
}

impl Driver {
    pub(crate) fn new(
        config: &Config,
        accept_rx: Option<crossbeam_channel::Receiver<(RawFd, SocketAddr)>>,
        eventfd: RawFd,
        shutdown_flag: Arc<AtomicBool>,
    ) -> Result<Self, Error> {
        config.validate()?;
        let ring = Ring::setup(config)?;

        let provided_bufs = ProvidedBufRing::new(
            config.recv_buffer.bgid,
            config.recv_buffer.ring_size,
            config.recv_buffer.buffer_size,
        )?;

        ring.register_files_sparse(config.max_connections)?;
        ring.register_buf_ring(&provided_bufs)?;

        let connections = ConnectionTable::new(config.max_connections);
        let send_copy_pool = SendCopyPool::new(config.send_copy_count, config.send_copy_slot_size);
        let accumulators =
            AccumulatorTable::new(config.max_connections, config.recv_accumulator_capacity);

        let flush_interval = if config.flush_interval_us == 0 {
            None
        } else {
            Some(Duration::from_micros(config.flush_interval_us))
        };

        let tls_table = TlsTable::new(
            config.max_connections,
            config.tls.as_ref().map(|tc| tc.server_config.clone()),
            config
                .tls_client
                .as_ref()
                .map(|tc| tc.client_config.clone()),
        );

        let mut connect_addrs = Vec::with_capacity(config.max_connections as usize);
        connect_addrs.resize(config.max_connections as usize, unsafe {
            std::mem::zeroed()
        });

        let mut connect_timespecs = Vec::with_capacity(config.max_connections as usize);
        connect_timespecs.resize(
            config.max_connections as usize,
            io_uring::types::Timespec::new(),
        );

        let mut send_states = Vec::with_capacity(config.max_connections as usize);
        for _ in 0..config.max_connections {
            send_states.push(ConnSendState::new());
        }

        Ok(Driver {
            ring,
            connections,
            provided_bufs,
            send_copy_pool,
            accumulators,
            send_states,
            pending_replenish: Vec::with_capacity(config.recv_buffer.ring_size as usize),
            accept_rx,
            eventfd,
            eventfd_buf: [0u8; 8],
            flush_interval,
            shutdown_flag,
            shutdown_local: false,
            tls_table,
            tls_scratch: vec![0u8; 16384],
            connect_addrs,
            connect_timespecs,
            cqe_batch: Vec::with_capacity(config.sq_entries as usize * 4),
            tcp_nodelay: config.tcp_nodelay,
            tick_timeout_ts: if config.tick_timeout_us > 0 {
                Some(
                    io_uring::types::Timespec::new()
                        .sec(config.tick_timeout_us / 1_000_000)
                        .nsec((config.tick_timeout_us % 1_000_000) as u32 * 1000),
                )
            } else {
                None
            },
            tick_timeout_armed: false,
        })
    }

    /// Install an accepted socket: claim a slot, register the fd into the
    /// fixed file table, arm multishot recv. For TLS listeners the slot
    /// stays unestablished until the handshake finishes.
    pub(crate) fn install_connection(&mut self, fd: RawFd, peer: SocketAddr) -> Result<u32, Error> {
        let idx = match self.connections.allocate() {
            Some(idx) => idx,
            None => {
                crate::metrics::CONNECTIONS_REJECTED.increment();
                unsafe {
                    libc::close(fd);
                }
                return Err(Error::ConnectionLimitReached);
            }
        };

        if self.tcp_nodelay {
            set_tcp_nodelay(fd);
        }

        if let Err(e) = self.ring.register_files_update(idx, &[fd]) {
            unsafe {
                libc::close(fd);
            }
            self.connections.release(idx);
            return Err(Error::Io(e));
        }
        // The fixed table holds its own reference now.
        unsafe {
            libc::close(fd);
        }

        let tls = self.tls_table.has_server_config();
        if let Some(conn) = self.connections.get_mut(idx) {
            conn.peer_addr = Some(peer);
            conn.established = !tls;
        }
        if tls {
            self.tls_table.create_server(idx);
        }

        self.accumulators.reset(idx);
        self.send_states[idx as usize].reset();

        if let Err(e) = self.ring.submit_multishot_recv(idx) {
            self.connections.release(idx);
            return Err(Error::Io(e));
        }

        Ok(idx)
    }

    /// Start an outbound TCP connect. The Connect CQE completes the
    /// handshake; with a deadline, a linked timeout bounds it.
    pub(crate) fn connect(
        &mut self,
        addr: SocketAddr,
        timeout_ms: Option<u64>,
    ) -> Result<ConnToken, Error> {
        let idx = self
            .connections
            .allocate_outbound()
            .ok_or(Error::ConnectionLimitReached)?;

        let domain = if addr.is_ipv4() {
            libc::AF_INET
        } else {
            libc::AF_INET6
        };
        let fd = unsafe {
            libc::socket(
                domain,
                libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
                0,
            )
        };
        if fd < 0 {
            self.connections.release(idx);
            return Err(Error::Io(io::Error::last_os_error()));
        }

        if self.tcp_nodelay {
            set_tcp_nodelay(fd);
        }

        if let Err(e) = self.ring.register_files_update(idx, &[fd]) {
            unsafe {
                libc::close(fd);
            }
            self.connections.release(idx);
            return Err(Error::Io(e));
        }
        unsafe {
            libc::close(fd);
        }

        let addr_len = socket_addr_to_sockaddr(addr, &mut self.connect_addrs[idx as usize]);
        let addr_ptr = &self.connect_addrs[idx as usize] as *const _ as *const libc::sockaddr;

        if let Some(conn) = self.connections.get_mut(idx) {
            conn.peer_addr = Some(addr);
        }
        self.accumulators.reset(idx);
        self.send_states[idx as usize].reset();

        let submitted = match timeout_ms {
            Some(ms) => {
                self.connect_timespecs[idx as usize] = io_uring::types::Timespec::new()
                    .sec(ms / 1000)
                    .nsec((ms % 1000) as u32 * 1_000_000);
                let ts_ptr = &self.connect_timespecs[idx as usize] as *const _;
                self.ring
                    .submit_connect_linked(idx, addr_ptr, addr_len)
                    .and_then(|()| {
                        if let Some(conn) = self.connections.get_mut(idx) {
                            conn.connect_timeout_armed = true;
                        }
                        self.ring.submit_link_timeout(idx, ts_ptr)
                    })
            }
            None => self.ring.submit_connect(idx, addr_ptr, addr_len),
        };

        if let Err(e) = submitted {
            self.connections.release(idx);
            return Err(Error::Io(e));
        }

        Ok(ConnToken::new(idx, self.connections.generation(idx)))
    }

    /// [`connect()`](Self::connect) plus a client TLS session; the slot
    /// is established only once both handshakes finish.
    pub(crate) fn connect_tls(
        &mut self,
        addr: SocketAddr,
        server_name: &str,
        timeout_ms: Option<u64>,
    ) -> Result<ConnToken, Error> {
        if !self.tls_table.has_client_config() {
            return Err(Error::Io(io::Error::other("no TLS client config")));
        }
        let name = rustls::pki_types::ServerName::try_from(server_name.to_string())
            .map_err(|e| Error::Io(io::Error::other(e.to_string())))?;

        let token = self.connect(addr, timeout_ms)?;
        self.tls_table.create_client(token.index, name);
        Ok(token)
    }

    /// Queue `data` for sending on a connection. Chunks that do not fit a
    /// pool slot are queued behind the in-flight one; completion handling
    /// drains the queue in order.
    pub(crate) fn send(&mut self, token: ConnToken, data: &[u8]) -> io::Result<()> {
        let conn = self
            .connections
            .get(token.index)
            .filter(|c| c.generation == token.generation)
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotConnected, "connection gone"))?;
        if matches!(conn.recv_mode, RecvMode::Closed) {
            return Err(io::Error::new(
                io::ErrorKind::BrokenPipe,
                "connection closing",
            ));
        }

        if self.tls_table.has_session(token.index) {
            let ciphertext = crate::tls::encrypt(&mut self.tls_table, token.index, data)?;
            self.enqueue_send(token.index, &ciphertext)
        } else {
            self.enqueue_send(token.index, data)
        }
    }

    fn enqueue_send(&mut self, conn_index: u32, data: &[u8]) -> io::Result<()> {
        let slot_size = self.send_copy_pool.slot_size() as usize;
        for chunk in data.chunks(slot_size) {
            self.send_states[conn_index as usize]
                .queue
                .push_back(chunk.to_vec());
        }
        if self.send_states[conn_index as usize].in_flight_slot == u16::MAX {
            self.submit_next_send(conn_index)?;
        }
        Ok(())
    }

    /// Pop the next queued chunk and put it on the wire. `Ok(false)` when
    /// the queue was empty.
    pub(crate) fn submit_next_send(&mut self, conn_index: u32) -> io::Result<bool> {
        let state = &mut self.send_states[conn_index as usize];
        let chunk = match state.queue.pop_front() {
            Some(c) => c,
            None => {
                state.in_flight_slot = u16::MAX;
                return Ok(false);
            }
        };

        let (slot, ptr, len) = match self.send_copy_pool.copy_in(&chunk) {
            Some(v) => v,
            None => {
                crate::metrics::SEND_POOL_EXHAUSTED.increment();
                // Put it back; retried when a slot frees up.
                self.send_states[conn_index as usize].queue.push_front(chunk);
                self.send_states[conn_index as usize].in_flight_slot = u16::MAX;
                return Err(io::Error::other("send copy pool exhausted"));
            }
        };

        match self.ring.submit_send_copied(conn_index, ptr, len, slot) {
            Ok(()) => {
                self.send_states[conn_index as usize].in_flight_slot = slot;
                Ok(true)
            }
            Err(e) => {
                self.send_copy_pool.release(slot);
                self.drain_conn_send_queue(conn_index);
                Err(e)
            }
        }
    }

    /// Drop all queued sends for a connection and release the in-flight
    /// slot accounting. Used on close and on send errors.
    pub(crate) fn drain_conn_send_queue(&mut self, conn_index: u32) {
        let state = &mut self.send_states[conn_index as usize];
        state.queue.clear();
        state.in_flight_slot = u16::MAX;
        state.flushed = 0;
    }

    /// Half-close the write side.
    pub(crate) fn shutdown_write(&mut self, token: ConnToken) {
        let valid = self
            .connections
            .get(token.index)
            .map(|c| c.generation == token.generation)
            .unwrap_or(false);
        if valid {
            let _ = self.ring.submit_shutdown(token.index);
        }
    }

    /// Cancel in-flight operations on a connection (matched by the recv
    /// user_data; multishot recv is the long-lived SQE worth cancelling).
    pub(crate) fn cancel(&mut self, token: ConnToken) -> io::Result<()> {
        let valid = self
            .connections
            .get(token.index)
            .map(|c| c.generation == token.generation)
            .unwrap_or(false);
        if !valid {
            return Ok(());
        }
        let target = UserData::encode(OpTag::RecvMulti, token.index, 0);
        self.ring.submit_async_cancel(target.raw(), token.index)
    }

    pub(crate) fn request_shutdown(&mut self) {
        self.shutdown_local = true;
    }

    /// Schedule the close of a connection. Idempotent; the slot is only
    /// released when the Close CQE lands.
    pub(crate) fn close_connection(&mut self, conn_index: u32) {
        match self.connections.get_mut(conn_index) {
            Some(conn) => {
                if matches!(conn.recv_mode, RecvMode::Closed) {
                    return; // already closing, avoid a second Close SQE
                }
                conn.recv_mode = RecvMode::Closed;
            }
            None => return,
        }
        self.drain_conn_send_queue(conn_index);
        if self.tls_table.has_session(conn_index) {
            // close_notify rides IO_LINK'd SQEs so the fd close below
            // runs only after the alert bytes are out.
            crate::tls::send_close_notify(
                &mut self.tls_table,
                conn_index,
                &mut self.ring,
                &mut self.send_copy_pool,
            );
        }
        let _ = self.ring.submit_close(conn_index);
    }

    /// Shutdown: close every connection, drain remaining CQEs until the
    /// table empties or the drain budget runs out, close the eventfd.
    pub(crate) fn run_shutdown(&mut self) {
        let max = self.connections.max_slots();
        for i in 0..max {
            if self.connections.get(i).is_some() {
                self.close_connection(i);
            }
        }

        // Arm a short timeout each round so submit_and_wait(1) cannot
        // block forever once the CQ runs dry.
        let shutdown_ts = io_uring::types::Timespec::new().nsec(100_000_000);
        for _ in 0..100 {
            if self.connections.active_count() == 0 {
                break;
            }
            let ud = UserData::encode(OpTag::TickTimeout, 0, 0);
            let _ = self.ring.submit_tick_timeout(&shutdown_ts, ud.raw());
            if self.ring.submit_and_wait(1).is_err() {
                break;
            }

            self.cqe_batch.clear();
            {
                let cq = self.ring.ring.completion();
                for cqe in cq {
                    self.cqe_batch
                        .push((cqe.user_data(), cqe.result(), cqe.flags()));
                }
            }

            for i in 0..self.cqe_batch.len() {
                let (user_data_raw, _result, _flags) = self.cqe_batch[i];
                let ud = UserData(user_data_raw);
                let tag = match ud.tag() {
                    Some(t) => t,
                    None => continue,
                };

                match tag {
                    OpTag::Send | OpTag::TlsSend => {
                        let pool_slot = ud.payload() as u16;
                        self.send_copy_pool.release(pool_slot);
                    }
                    OpTag::Close => {
                        let conn_index = ud.conn_index();
                        self.tls_table.remove(conn_index);
                        self.connections.release(conn_index);
                    }
                    _ => {}
                }
            }
        }

        unsafe {
            libc::close(self.eventfd);
        }
    }
}

fn set_tcp_nodelay(fd: RawFd) {
    let optval: libc::c_int = 1;
    unsafe {
        libc::setsockopt(
            fd,
            libc::IPPROTO_TCP,
            libc::TCP_NODELAY,
            &optval as *const _ as *const libc::c_void,
            std::mem::size_of::<libc::c_int>() as libc::socklen_t,
        );
    }
}
