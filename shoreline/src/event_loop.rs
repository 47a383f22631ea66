use std::io;
use std::sync::atomic::Ordering;
use std::task::Context;
use std::time::Instant;

use io_uring::cqueue;

use crate::completion::{OpTag, UserData};
use crate::connection::RecvMode;
use crate::driver::Driver;
use crate::metrics;
use crate::runtime::handler::AsyncEventHandler;
use crate::runtime::io::{clear_driver_state, set_driver_state, ConnCtx, DriverState};
use crate::runtime::waker::{conn_waker, standalone_waker, STANDALONE_BIT};
use crate::runtime::{Executor, TimerSlotPool, CURRENT_TASK_ID};

/// Per-worker event loop: a [`Driver`] for the ring and buffers, an
/// [`Executor`] polling per-connection futures, and the handler that
/// supplies them.
pub(crate) struct EventLoop<A: AsyncEventHandler> {
    driver: Driver,
    handler: A,
    executor: Executor,
}

impl<A: AsyncEventHandler> EventLoop<A> {
    pub(crate) fn new(
        config: &crate::config::Config,
        handler: A,
        accept_rx: Option<crossbeam_channel::Receiver<(std::os::fd::RawFd, std::net::SocketAddr)>>,
        eventfd: std::os::fd::RawFd,
        shutdown_flag: std::sync::Arc<std::sync::atomic::AtomicBool>,
    ) -> Result<Self, crate::error::Error> {
        let driver = Driver::new(config, accept_rx, eventfd, shutdown_flag)?;
        let executor = Executor::new(
            config.max_connections,
            config.standalone_task_capacity,
            config.timer_slots,
        );
        Ok(EventLoop {
            driver,
            handler,
            executor,
        })
    }

    /// Run the event loop. Blocks the current thread until shutdown.
    pub(crate) fn run(&mut self) -> Result<(), crate::error::Error> {
        // The eventfd read is armed even without a listener; shutdown and
        // accept notifications both arrive through it.
        self.driver
            .ring
            .submit_eventfd_read(self.driver.eventfd, self.driver.eventfd_buf.as_mut_ptr())?;

        // Kick the eventfd so the first submit_and_wait(1) returns at once.
        let kick: u64 = 1;
        unsafe {
            libc::write(
                self.driver.eventfd,
                &kick as *const u64 as *const libc::c_void,
                8,
            );
        }

        // Client-only entry point.
        if let Some(future) = self.handler.on_start() {
            if let Some(idx) = self.executor.standalone_slab.spawn(future) {
                self.executor.ready_queue.push_back(idx | STANDALONE_BIT);
            }
        }

        loop {
            // Arm a tick timeout before blocking so on_tick keeps firing
            // through idle stretches.
            if !self.driver.tick_timeout_armed {
                if let Some(ref ts) = self.driver.tick_timeout_ts {
                    let ud = UserData::encode(OpTag::TickTimeout, 0, 0);
                    let _ = self
                        .driver
                        .ring
                        .submit_tick_timeout(ts as *const _, ud.raw());
                    self.driver.tick_timeout_armed = true;
                }
            }

            self.driver.ring.submit_and_wait(1)?;

            self.drain_completions();

            if self.driver.shutdown_local || self.driver.shutdown_flag.load(Ordering::Relaxed) {
                self.driver.run_shutdown();
                return Ok(());
            }

            // Batch replenish recv buffers.
            if !self.driver.pending_replenish.is_empty() {
                self.driver
                    .provided_bufs
                    .replenish_batch(&self.driver.pending_replenish);
                self.driver.pending_replenish.clear();
            }

            // Wakeups recorded while handling completions.
            self.executor.collect_wakeups();

            self.poll_ready_tasks();

            self.handler.on_tick();
        }
    }

    /// Poll every task in the ready queue, connection and standalone.
    fn poll_ready_tasks(&mut self) {
        // One thread-local install covers the whole batch.
        let mut driver_state = DriverState {
            driver: &mut self.driver as *mut Driver,
            executor: &mut self.executor as *mut Executor,
        };
        set_driver_state(&mut driver_state);

        let mut i = 0;
        while i < self.executor.ready_queue.len() {
            let raw_id = self.executor.ready_queue[i];
            i += 1;

            if raw_id & STANDALONE_BIT != 0 {
                let task_idx = raw_id & !STANDALONE_BIT;
                if let Some(mut fut) = self.executor.standalone_slab.take_ready(task_idx) {
                    let waker = standalone_waker(task_idx);
                    let mut cx = Context::from_waker(&waker);

                    CURRENT_TASK_ID.with(|c| c.set(raw_id));
                    match fut.as_mut().poll(&mut cx) {
                        std::task::Poll::Ready(()) => {
                            self.executor.standalone_slab.remove(task_idx);
                        }
                        std::task::Poll::Pending => {
                            self.executor.standalone_slab.park(task_idx, fut);
                        }
                    }
                }
            } else {
                let conn_index = raw_id;
                if let Some(mut fut) = self.executor.task_slab.take_ready(conn_index) {
                    let waker = conn_waker(conn_index);
                    let mut cx = Context::from_waker(&waker);

                    CURRENT_TASK_ID.with(|c| c.set(conn_index));
                    match fut.as_mut().poll(&mut cx) {
                        std::task::Poll::Ready(()) => {
                            // Handler done with this connection.
                            self.driver.close_connection(conn_index);
                            self.executor.remove_connection(conn_index);
                        }
                        std::task::Poll::Pending => {
                            self.executor.task_slab.park(conn_index, fut);
                        }
                    }
                }
            }
        }

        clear_driver_state();

        self.executor.ready_queue.clear();

        // Wakeups fired during the polls above.
        self.executor.collect_wakeups();
    }

    fn drain_completions(&mut self) {
        self.driver.cqe_batch.clear();

        {
            let cq = self.driver.ring.ring.completion();
            for cqe in cq {
                self.driver
                    .cqe_batch
                    .push((cqe.user_data(), cqe.result(), cqe.flags()));
            }
        }

        if let Some(interval) = self.driver.flush_interval {
            let mut last_flush = Instant::now();
            for i in 0..self.driver.cqe_batch.len() {
                let (user_data_raw, result, flags) = self.driver.cqe_batch[i];
                self.dispatch_cqe(user_data_raw, result, flags);
                // Check the clock every 16 CQEs to amortise Instant::now().
                if (i & 0xF) == 0xF {
                    let now = Instant::now();
                    if now.duration_since(last_flush) >= interval {
                        let _ = self.driver.ring.flush();
                        last_flush = now;
                    }
                }
            }
        } else {
            for i in 0..self.driver.cqe_batch.len() {
                let (user_data_raw, result, flags) = self.driver.cqe_batch[i];
                self.dispatch_cqe(user_data_raw, result, flags);
            }
        }
    }

    fn dispatch_cqe(&mut self, user_data_raw: u64, result: i32, flags: u32) {
        metrics::CQE_PROCESSED.increment();
        let ud = UserData(user_data_raw);
        let tag = match ud.tag() {
            Some(t) => t,
            None => return,
        };

        match tag {
            OpTag::RecvMulti => self.handle_recv_multi(ud, result, flags),
            OpTag::Send => self.handle_send(ud, result),
            OpTag::Close => self.handle_close(ud),
            OpTag::Shutdown => {}
            OpTag::EventFdRead => self.handle_eventfd_read(),
            OpTag::TlsSend => self.handle_tls_send(ud, result),
            OpTag::Connect => self.handle_connect(ud, result),
            OpTag::Timeout => self.handle_connect_timeout(ud, result),
            OpTag::Cancel => {}
            OpTag::TickTimeout => {
                self.driver.tick_timeout_armed = false;
            }
            OpTag::Timer => self.handle_timer(ud, result),
        }
    }

    fn handle_recv_multi(&mut self, ud: UserData, result: i32, flags: u32) {
        let conn_index = ud.conn_index();
        let has_more = cqueue::more(flags);

        if self.driver.connections.get(conn_index).is_none() {
            return;
        }

        if result <= 0 {
            if result == 0 {
                // EOF. Wake the recv waiter first so the owning task sees
                // RecvMode::Closed and resolves with 0.
                self.executor.wake_recv(conn_index);
                self.driver.close_connection(conn_index);
                return;
            }
            let errno = -result;
            if errno == libc::ENOBUFS {
                metrics::BUFFER_RING_EMPTY.increment();
                if !has_more {
                    let _ = self.driver.ring.submit_multishot_recv(conn_index);
                }
            } else if errno == libc::ECANCELED {
                return;
            } else if !has_more {
                self.executor.wake_recv(conn_index);
                self.driver.close_connection(conn_index);
            }
            return;
        }

        let bid = match cqueue::buffer_select(flags) {
            Some(bid) => bid,
            None => return,
        };

        let bytes_received = result as u32;
        metrics::BYTES_RECEIVED.add(bytes_received as u64);
        let (buf_ptr, _) = self.driver.provided_bufs.get_buffer(bid);
        let data = unsafe { std::slice::from_raw_parts(buf_ptr, bytes_received as usize) };

        self.driver.pending_replenish.push(bid);

        if self.driver.tls_table.has_session(conn_index) {
            let result = crate::tls::feed_recv(
                &mut self.driver.tls_table,
                &mut self.driver.accumulators,
                &mut self.driver.ring,
                &mut self.driver.send_copy_pool,
                &mut self.driver.tls_scratch,
                conn_index,
                data,
            );

            match result {
                crate::tls::TlsRecvResult::HandshakeJustCompleted => {
                    let is_outbound = self
                        .driver
                        .connections
                        .get(conn_index)
                        .map(|c| c.outbound)
                        .unwrap_or(false);

                    if let Some(cs) = self.driver.connections.get_mut(conn_index) {
                        cs.established = true;
                    }

                    if is_outbound {
                        self.executor.wake_connect(conn_index, Ok(()));
                    } else {
                        metrics::CONNECTIONS_ACCEPTED.increment();
                        metrics::CONNECTIONS_ACTIVE.increment();
                        self.spawn_accept_task(conn_index);
                    }

                    // Plaintext may already have accumulated behind the
                    // handshake records.
                    self.executor.wake_recv(conn_index);
                }
                crate::tls::TlsRecvResult::Ok => {
                    self.executor.wake_recv(conn_index);
                }
                crate::tls::TlsRecvResult::Error(e) => {
                    metrics::TLS_HANDSHAKE_FAILURES.increment();
                    log::debug!("tls error on conn {conn_index}: {e}");
                    self.driver.close_connection(conn_index);
                    self.executor.remove_connection(conn_index);
                }
                crate::tls::TlsRecvResult::Closed => {
                    self.driver.close_connection(conn_index);
                    self.executor.remove_connection(conn_index);
                }
            }
        } else {
            self.driver.accumulators.append(conn_index, data);
            self.executor.wake_recv(conn_index);
        }

        // The kernel drops the multishot arm under buffer pressure;
        // re-arm unless the connection is closing.
        if !has_more {
            if let Some(conn) = self.driver.connections.get(conn_index) {
                if matches!(conn.recv_mode, RecvMode::Armed) {
                    let _ = self.driver.ring.submit_multishot_recv(conn_index);
                }
            }
        }
    }

    fn handle_eventfd_read(&mut self) {
        // Drain the accept channel.
        loop {
            let item = match self.driver.accept_rx {
                Some(ref rx) => rx.try_recv().ok(),
                None => None,
            };
            let Some((raw_fd, peer_addr)) = item else {
                break;
            };

            let conn_index = match self.driver.install_connection(raw_fd, peer_addr) {
                Ok(idx) => idx,
                Err(_) => continue,
            };

            // TLS connections get their task only after the handshake.
            if self.driver.tls_table.has_session(conn_index) {
                continue;
            }

            metrics::CONNECTIONS_ACCEPTED.increment();
            metrics::CONNECTIONS_ACTIVE.increment();
            self.spawn_accept_task(conn_index);
        }

        // Re-arm the eventfd read.
        if !self.driver.shutdown_flag.load(Ordering::Relaxed) {
            let _ = self
                .driver
                .ring
                .submit_eventfd_read(self.driver.eventfd, self.driver.eventfd_buf.as_mut_ptr());
        }
    }

    fn handle_send(&mut self, ud: UserData, result: i32) {
        let conn_index = ud.conn_index();
        let pool_slot = ud.payload() as u16;

        if result > 0 {
            // Partial write: resubmit the remainder from the same slot.
            if let Some((ptr, remaining)) = self
                .driver
                .send_copy_pool
                .try_advance(pool_slot, result as u32)
            {
                let _ = self
                    .driver
                    .ring
                    .submit_send_copied(conn_index, ptr, remaining, pool_slot);
                return;
            }

            let total = self.driver.send_copy_pool.original_len(pool_slot);
            metrics::BYTES_SENT.add(total as u64);
            self.driver.send_copy_pool.release(pool_slot);

            let state = &mut self.driver.send_states[conn_index as usize];
            state.flushed = state.flushed.saturating_add(total);

            match self.driver.submit_next_send(conn_index) {
                Ok(true) => {}
                Ok(false) => {
                    // Queue drained; the waiter learns the full total.
                    let flushed = self.driver.send_states[conn_index as usize].flushed;
                    self.driver.send_states[conn_index as usize].flushed = 0;
                    self.executor.wake_send(conn_index, Ok(flushed));
                }
                Err(e) => {
                    self.executor.wake_send(conn_index, Err(e));
                }
            }
            return;
        }

        self.driver.send_copy_pool.release(pool_slot);
        self.driver.drain_conn_send_queue(conn_index);

        let io_result = if result == 0 {
            Ok(0u32)
        } else {
            Err(io::Error::from_raw_os_error(-result))
        };
        self.executor.wake_send(conn_index, io_result);
    }

    fn handle_tls_send(&mut self, ud: UserData, result: i32) {
        let conn_index = ud.conn_index();
        let pool_slot = ud.payload() as u16;

        if result > 0 {
            if let Some((ptr, remaining)) = self
                .driver
                .send_copy_pool
                .try_advance(pool_slot, result as u32)
            {
                let _ = self
                    .driver
                    .ring
                    .submit_tls_send(conn_index, ptr, remaining, pool_slot);
                return;
            }
        }
        self.driver.send_copy_pool.release(pool_slot);
    }

    fn handle_connect(&mut self, ud: UserData, result: i32) {
        let conn_index = ud.conn_index();

        if self.driver.connections.get(conn_index).is_none() {
            return;
        }

        if result < 0 {
            let errno = -result;

            if errno == libc::ECANCELED {
                let timeout_armed = self
                    .driver
                    .connections
                    .get(conn_index)
                    .map(|c| c.connect_timeout_armed)
                    .unwrap_or(false);
                if !timeout_armed {
                    let err = io::Error::from_raw_os_error(errno);
                    self.executor.wake_connect(conn_index, Err(err));
                    // remove_connection here would clear io_results before
                    // the owning task reads the error; handle_close cleans
                    // up instead.
                    self.driver.close_connection(conn_index);
                    return;
                }
                // The linked timeout fired; its own CQE drives the error.
                if let Some(cs) = self.driver.connections.get_mut(conn_index) {
                    cs.connect_timeout_armed = false;
                }
                return;
            }

            if self
                .driver
                .connections
                .get(conn_index)
                .map(|c| c.connect_timeout_armed)
                .unwrap_or(false)
            {
                let timeout_ud = UserData::encode(OpTag::Timeout, conn_index, 0);
                let _ = self
                    .driver
                    .ring
                    .submit_async_cancel(timeout_ud.raw(), conn_index);
                if let Some(cs) = self.driver.connections.get_mut(conn_index) {
                    cs.connect_timeout_armed = false;
                }
            }

            self.driver.tls_table.remove(conn_index);

            let err = io::Error::from_raw_os_error(errno);
            self.executor.wake_connect(conn_index, Err(err));
            self.driver.close_connection(conn_index);
            return;
        }

        // Connect succeeded; retire the linked timeout if one is pending.
        let timeout_was_armed = self
            .driver
            .connections
            .get(conn_index)
            .map(|c| c.connect_timeout_armed)
            .unwrap_or(false);
        if timeout_was_armed {
            let still_connecting = self
                .driver
                .connections
                .get(conn_index)
                .map(|c| matches!(c.recv_mode, RecvMode::Connecting))
                .unwrap_or(false);
            if !still_connecting {
                if let Some(cs) = self.driver.connections.get_mut(conn_index) {
                    cs.connect_timeout_armed = false;
                }
                return;
            }
            let timeout_ud = UserData::encode(OpTag::Timeout, conn_index, 0);
            let _ = self
                .driver
                .ring
                .submit_async_cancel(timeout_ud.raw(), conn_index);
            if let Some(cs) = self.driver.connections.get_mut(conn_index) {
                cs.connect_timeout_armed = false;
            }
        }

        self.driver.accumulators.reset(conn_index);

        // TLS client: start the handshake; the connect waiter wakes when
        // it finishes.
        if self.driver.tls_table.has_session(conn_index) {
            crate::tls::flush_output(
                &mut self.driver.tls_table,
                &mut self.driver.ring,
                &mut self.driver.send_copy_pool,
                conn_index,
            );
            if let Some(cs) = self.driver.connections.get_mut(conn_index) {
                cs.recv_mode = RecvMode::Armed;
            }
            let _ = self.driver.ring.submit_multishot_recv(conn_index);
            return;
        }

        if let Some(cs) = self.driver.connections.get_mut(conn_index) {
            cs.recv_mode = RecvMode::Armed;
            cs.established = true;
        }
        let _ = self.driver.ring.submit_multishot_recv(conn_index);

        self.executor.wake_connect(conn_index, Ok(()));
    }

    /// Linked connect timeout fired (-ETIME) or was retired (-ECANCELED).
    fn handle_connect_timeout(&mut self, ud: UserData, result: i32) {
        let conn_index = ud.conn_index();

        if result != -libc::ETIME {
            return;
        }

        let conn = match self.driver.connections.get(conn_index) {
            Some(c) => c,
            None => return,
        };

        if !matches!(conn.recv_mode, RecvMode::Connecting) {
            return;
        }

        let connect_ud = UserData::encode(OpTag::Connect, conn_index, 0);
        let _ = self
            .driver
            .ring
            .submit_async_cancel(connect_ud.raw(), conn_index);

        self.driver.tls_table.remove(conn_index);

        let err = io::Error::new(io::ErrorKind::TimedOut, "connect timed out");
        self.executor.wake_connect(conn_index, Err(err));
        self.driver.close_connection(conn_index);
    }

    fn handle_close(&mut self, ud: UserData) {
        let conn_index = ud.conn_index();

        let was_established = self
            .driver
            .connections
            .get(conn_index)
            .map(|c| c.established)
            .unwrap_or(false);

        self.driver.tls_table.remove(conn_index);

        if was_established {
            metrics::CONNECTIONS_CLOSED.increment();
            metrics::CONNECTIONS_ACTIVE.decrement();
        }

        // Drops the future if the task still exists.
        self.executor.remove_connection(conn_index);
        self.driver.connections.release(conn_index);
    }

    fn handle_timer(&mut self, ud: UserData, result: i32) {
        // -ETIME is normal expiry; -ECANCELED means a dropped SleepFuture
        // already released the slot.
        if result != -libc::ETIME {
            return;
        }

        let payload = ud.payload();
        let (slot, generation) = TimerSlotPool::decode_payload(payload);

        if let Some(waker_id) = self.executor.timer_pool.fire(slot, generation) {
            self.executor.wake_task(waker_id);
        }
    }

    /// Spawn the per-connection task for a newly established connection.
    fn spawn_accept_task(&mut self, conn_index: u32) {
        let generation = self.driver.connections.generation(conn_index);
        let conn_ctx = ConnCtx::new(conn_index, generation);
        let future = Box::pin(self.handler.on_accept(conn_ctx));
        self.executor.owner_task[conn_index as usize] = Some(conn_index);
        self.executor.task_slab.spawn(conn_index, future);
        self.executor.ready_queue.push_back(conn_index);
    }
}
