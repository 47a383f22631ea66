use std::cell::Cell;
use std::fmt;
use std::future::Future;
use std::io;
use std::net::SocketAddr;
use std::pin::Pin;
use std::task::{Context, Poll};
use std::time::Duration;

use bytes::Bytes;

use crate::completion::{OpTag, UserData};
use crate::connection::ConnToken;
use crate::driver::Driver;
use crate::error::TimerExhausted;
use crate::runtime::task::TaskId;
use crate::runtime::waker::STANDALONE_BIT;
use crate::runtime::{Executor, IoResult, TimerSlotPool, CURRENT_TASK_ID};

/// Outcome of a parse closure handed to [`ConnCtx::with_data`] or
/// [`ConnCtx::with_bytes`].
///
/// `NeedMore` (and `Consumed(0)` on non-empty input) parks the future
/// until another recv completion lands; consumed bytes are removed from
/// the connection's buffer, unconsumed bytes stay put. On EOF the future
/// resolves with `0` regardless of the closure's answer.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParseResult {
    /// The closure consumed `n` bytes.
    Consumed(usize),
    /// Not enough bytes yet to make progress.
    NeedMore,
}

/// Raw pointers to the worker's driver and executor, installed before
/// each task poll.
///
/// Sound because each worker is single-threaded, the pointers are set
/// only for the duration of a poll, and the pointees live on the worker's
/// stack for the lifetime of the event loop.
pub(crate) struct DriverState {
    pub(crate) driver: *mut Driver,
    pub(crate) executor: *mut Executor,
}

thread_local! {
    pub(crate) static CURRENT_DRIVER: Cell<*mut DriverState> =
        const { Cell::new(std::ptr::null_mut()) };
}

pub(crate) fn set_driver_state(state: *mut DriverState) {
    CURRENT_DRIVER.with(|c| c.set(state));
}

pub(crate) fn clear_driver_state() {
    CURRENT_DRIVER.with(|c| c.set(std::ptr::null_mut()));
}

/// Run `f` against the current worker's driver and executor; `None` when
/// called from outside a task poll.
fn try_with_state<R>(f: impl FnOnce(&mut Driver, &mut Executor) -> R) -> Option<R> {
    let ptr = CURRENT_DRIVER.with(|c| c.get());
    if ptr.is_null() {
        return None;
    }
    // SAFETY: set_driver_state installed valid pointers for the duration
    // of this poll, and the worker is single-threaded.
    let state = unsafe { &mut *ptr };
    Some(f(unsafe { &mut *state.driver }, unsafe {
        &mut *state.executor
    }))
}

/// Infallible [`try_with_state`]; panics outside a task poll.
fn with_state<R>(f: impl FnOnce(&mut Driver, &mut Executor) -> R) -> R {
    try_with_state(f).expect("called outside executor")
}

/// Spawn a standalone task on the current worker.
///
/// Standalone tasks are not tied to a connection; they run on the same
/// single-threaded executor and may use [`sleep()`](crate::sleep),
/// [`timeout()`](crate::timeout), and [`connect()`].
pub fn spawn(future: impl Future<Output = ()> + 'static) -> io::Result<TaskId> {
    try_with_state(|_driver, executor| {
        match executor.standalone_slab.spawn(Box::pin(future)) {
            Some(idx) => {
                executor.ready_queue.push_back(idx | STANDALONE_BIT);
                Ok(TaskId(idx))
            }
            None => Err(io::Error::other("standalone task slab exhausted")),
        }
    })
    .unwrap_or_else(|| Err(io::Error::other("called outside executor")))
}

impl TaskId {
    /// Drop a standalone task immediately, freeing its slot. A no-op if
    /// the task already finished. Timers owned by the dropped future are
    /// cancelled by their `Drop` impls; stale ready-queue entries are
    /// skipped when the executor meets them.
    pub fn cancel(self) {
        with_state(|_driver, executor| {
            executor.standalone_slab.remove(self.0);
        });
    }
}

/// Submit the connect SQE and register the calling task as the waiter
/// for its completion. Shared by every connect entry point.
fn start_connect(
    addr: SocketAddr,
    tls_name: Option<&str>,
    timeout_ms: Option<u64>,
) -> io::Result<ConnectFuture> {
    with_state(|driver, executor| {
        let token = match tls_name {
            Some(name) => driver.connect_tls(addr, name, timeout_ms),
            None => driver.connect(addr, timeout_ms),
        }
        .map_err(|e| io::Error::other(e.to_string()))?;

        let calling_task = CURRENT_TASK_ID.with(|c| c.get());
        executor.owner_task[token.index as usize] = Some(calling_task);
        executor.connect_waiters[token.index as usize] = true;
        Ok(ConnectFuture {
            conn_index: token.index,
            generation: token.generation,
        })
    })
}

/// Start an outbound TCP connection from any task; resolves with a
/// [`ConnCtx`] for the new connection.
pub fn connect(addr: SocketAddr) -> io::Result<ConnectFuture> {
    start_connect(addr, None, None)
}

/// [`connect()`] with a deadline; the connect fails with a timeout error
/// if the peer does not answer within `timeout_ms`.
pub fn connect_with_timeout(addr: SocketAddr, timeout_ms: u64) -> io::Result<ConnectFuture> {
    start_connect(addr, None, Some(timeout_ms))
}

/// Start an outbound TLS connection; resolves once both the TCP and TLS
/// handshakes finish. `server_name` is the SNI hostname.
pub fn connect_tls(addr: SocketAddr, server_name: &str) -> io::Result<ConnectFuture> {
    start_connect(addr, Some(server_name), None)
}

/// [`connect_tls()`] with a deadline.
pub fn connect_tls_with_timeout(
    addr: SocketAddr,
    server_name: &str,
    timeout_ms: u64,
) -> io::Result<ConnectFuture> {
    start_connect(addr, Some(server_name), Some(timeout_ms))
}

/// Ask the worker's event loop to shut down gracefully.
pub fn request_shutdown() -> io::Result<()> {
    try_with_state(|driver, _| {
        driver.request_shutdown();
    })
    .ok_or_else(|| io::Error::other("called outside executor"))
}

/// Handle to one connection, passed to
/// [`AsyncEventHandler::on_accept`](crate::AsyncEventHandler::on_accept).
///
/// All I/O on the connection goes through this handle, from the one task
/// that owns it: suspending reads via [`with_data`](Self::with_data) /
/// [`with_bytes`](Self::with_bytes), sends that either await completion
/// ([`send`](Self::send)) or fire and forget
/// ([`send_nowait`](Self::send_nowait)), and [`close`](Self::close).
///
/// The generation baked into the handle makes it harmless after the
/// connection dies: operations on a stale handle fail or no-op instead of
/// touching the slot's next occupant.
#[derive(Clone, Copy)]
pub struct ConnCtx {
    pub(crate) conn_index: u32,
    pub(crate) generation: u32,
}

impl ConnCtx {
    pub(crate) fn new(conn_index: u32, generation: u32) -> Self {
        ConnCtx {
            conn_index,
            generation,
        }
    }

    /// Connection slot index, for indexing per-connection state.
    pub fn index(&self) -> usize {
        self.conn_index as usize
    }

    pub(crate) fn token(&self) -> ConnToken {
        ConnToken::new(self.conn_index, self.generation)
    }

    // ── Recv ─────────────────────────────────────────────────────────

    /// Suspend until bytes are buffered, then let `f` parse them.
    ///
    /// Resolves immediately when data is already buffered. If `f` answers
    /// `NeedMore` (or `Consumed(0)` on non-empty input) the future parks
    /// and calls `f` again after the next recv completion, so `f` must
    /// tolerate repeated invocation. Resolves with the consumed count,
    /// or `0` on EOF.
    pub fn with_data<F: FnMut(&[u8]) -> ParseResult>(&self, f: F) -> WithDataFuture<F> {
        WithDataFuture {
            conn_index: self.conn_index,
            f: Some(f),
        }
    }

    /// Like [`with_data()`](Self::with_data) but hands the closure a
    /// refcounted `Bytes` it can slice without copying.
    pub fn with_bytes<F: FnMut(Bytes) -> ParseResult>(&self, f: F) -> WithBytesFuture<F> {
        WithBytesFuture {
            conn_index: self.conn_index,
            f: Some(f),
        }
    }

    /// Non-suspending look at buffered bytes. `None` when nothing is
    /// buffered; consumed bytes are removed as in `with_data`.
    pub fn try_with_data<F: FnOnce(&[u8]) -> ParseResult>(&self, f: F) -> Option<ParseResult> {
        with_state(|driver, _executor| {
            let data = driver.accumulators.data(self.conn_index);
            if data.is_empty() {
                return None;
            }
            let result = f(data);
            if let ParseResult::Consumed(consumed) = result {
                driver.accumulators.consume(self.conn_index, consumed);
            }
            Some(result)
        })
    }

    // ── Send ─────────────────────────────────────────────────────────

    /// Fire-and-forget send: one copy into the send pool, SQE submitted,
    /// no future. Partial writes are resubmitted internally until the
    /// whole buffer is out.
    pub fn send_nowait(&self, data: &[u8]) -> io::Result<()> {
        with_state(|driver, _| driver.send(self.token(), data))
    }

    /// Send and await completion. The SQE is submitted eagerly; the
    /// future resolves with the total bytes written once every byte has
    /// been accepted by the transport, or with the error that stopped it.
    pub fn send(&self, data: &[u8]) -> io::Result<SendFuture> {
        with_state(|driver, executor| {
            driver.send(self.token(), data)?;
            executor.send_waiters[self.conn_index as usize] = true;
            Ok(SendFuture {
                conn_index: self.conn_index,
            })
        })
    }

    // ── Connect ──────────────────────────────────────────────────────

    /// Open an outbound TCP connection; resolves with the peer's
    /// `ConnCtx`.
    pub fn connect(&self, addr: SocketAddr) -> io::Result<ConnectFuture> {
        start_connect(addr, None, None)
    }

    pub fn connect_with_timeout(
        &self,
        addr: SocketAddr,
        timeout_ms: u64,
    ) -> io::Result<ConnectFuture> {
        start_connect(addr, None, Some(timeout_ms))
    }

    // ── Shutdown / cancel / close ────────────────────────────────────

    /// Half-close: send a FIN, keep reading.
    pub fn shutdown_write(&self) {
        with_state(|driver, _| {
            driver.shutdown_write(self.token());
        })
    }

    /// Cancel any in-flight operations on this connection.
    pub fn cancel(&self) -> io::Result<()> {
        with_state(|driver, _| driver.cancel(self.token()))
    }

    /// Ask the worker's event loop to shut down gracefully.
    pub fn request_shutdown(&self) {
        with_state(|driver, _| {
            driver.request_shutdown();
        })
    }

    /// Schedule the close of this connection.
    ///
    /// The Close completes on its own CQE, possibly after the owning task
    /// has already returned; the slot is recycled only then, and its
    /// generation bump retires any completion still in flight.
    pub fn close(&self) {
        try_with_state(|driver, _| {
            driver.close_connection(self.conn_index);
        });
    }

    // ── Metadata ─────────────────────────────────────────────────────

    pub fn peer_addr(&self) -> Option<SocketAddr> {
        with_state(|driver, _| {
            let conn = driver.connections.get(self.conn_index)?;
            if conn.generation != self.generation {
                return None;
            }
            conn.peer_addr
        })
    }

    /// True when this connection was opened via connect rather than
    /// accepted.
    pub fn is_outbound(&self) -> bool {
        with_state(|driver, _| {
            driver
                .connections
                .get(self.conn_index)
                .map(|cs| cs.generation == self.generation && cs.outbound)
                .unwrap_or(false)
        })
    }

    /// True when the connection runs over TLS.
    pub fn is_tls(&self) -> bool {
        with_state(|driver, _| driver.tls_table.has_session(self.conn_index))
    }
}

// ── WithDataFuture / WithBytesFuture ─────────────────────────────────

/// No more bytes will ever arrive on this connection: the recv side is
/// closed, or the slot has already been recycled.
fn recv_finished(driver: &Driver, conn_index: u32) -> bool {
    driver
        .connections
        .get(conn_index)
        .map(|c| matches!(c.recv_mode, crate::connection::RecvMode::Closed))
        .unwrap_or(true)
}

/// How one parse attempt resolved, shared by the two recv futures.
enum Attempt {
    /// The closure consumed this many bytes; the future is done.
    Done(usize),
    /// Park until the next recv completion.
    Park,
    /// Nothing buffered and the peer is gone; give the closure one EOF
    /// call so framed parsers can flush a final item.
    Eof,
}

fn resolve_attempt(result: ParseResult, closed: bool) -> Attempt {
    match result {
        ParseResult::Consumed(n) if n > 0 => Attempt::Done(n),
        // EOF after an incomplete parse resolves with 0 so callers can
        // tell disconnect from an empty parse.
        _ if closed => Attempt::Done(0),
        _ => Attempt::Park,
    }
}

/// Future returned by [`ConnCtx::with_data`].
pub struct WithDataFuture<F> {
    conn_index: u32,
    f: Option<F>,
}

impl<F: FnMut(&[u8]) -> ParseResult + Unpin> Future for WithDataFuture<F> {
    type Output = usize;

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<usize> {
        let conn_index = self.conn_index;
        with_state(|driver, executor| {
            let f = self.f.as_mut().expect("polled after Ready");
            let data = driver.accumulators.data(conn_index);

            let attempt = if data.is_empty() {
                if recv_finished(driver, conn_index) {
                    Attempt::Eof
                } else {
                    Attempt::Park
                }
            } else {
                let result = f(data);
                if let ParseResult::Consumed(n) = result {
                    if n > 0 {
                        driver.accumulators.consume(conn_index, n);
                    }
                }
                resolve_attempt(result, recv_finished(driver, conn_index))
            };

            match attempt {
                Attempt::Done(n) => {
                    self.f.take();
                    Poll::Ready(n)
                }
                Attempt::Eof => {
                    let result = f(&[]);
                    self.f.take();
                    Poll::Ready(match result {
                        ParseResult::Consumed(n) => n,
                        ParseResult::NeedMore => 0,
                    })
                }
                Attempt::Park => {
                    executor.recv_waiters[conn_index as usize] = true;
                    Poll::Pending
                }
            }
        })
    }
}

/// Future returned by [`ConnCtx::with_bytes`].
pub struct WithBytesFuture<F> {
    conn_index: u32,
    f: Option<F>,
}

impl<F: FnMut(Bytes) -> ParseResult + Unpin> Future for WithBytesFuture<F> {
    type Output = usize;

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<usize> {
        let conn_index = self.conn_index;
        with_state(|driver, executor| {
            let f = self.f.as_mut().expect("polled after Ready");

            let attempt = if driver.accumulators.data(conn_index).is_empty() {
                if recv_finished(driver, conn_index) {
                    Attempt::Eof
                } else {
                    Attempt::Park
                }
            } else {
                // O(1) detach; the unconsumed remainder is prepended back.
                let frozen = driver.accumulators.take_frozen(conn_index);
                let result = f(frozen.clone());
                match result {
                    ParseResult::Consumed(n) if n > 0 && n < frozen.len() => {
                        driver.accumulators.prepend(conn_index, &frozen[n..]);
                    }
                    ParseResult::Consumed(n) if n > 0 => {}
                    _ => driver.accumulators.prepend(conn_index, &frozen[..]),
                }
                resolve_attempt(result, recv_finished(driver, conn_index))
            };

            match attempt {
                Attempt::Done(n) => {
                    self.f.take();
                    Poll::Ready(n)
                }
                Attempt::Eof => {
                    let result = f(Bytes::new());
                    self.f.take();
                    Poll::Ready(match result {
                        ParseResult::Consumed(n) => n,
                        ParseResult::NeedMore => 0,
                    })
                }
                Attempt::Park => {
                    executor.recv_waiters[conn_index as usize] = true;
                    Poll::Pending
                }
            }
        })
    }
}

// ── SendFuture ───────────────────────────────────────────────────────

/// Awaits a send completion. The SQE was already submitted; this just
/// waits for the stored result. No allocation.
pub struct SendFuture {
    conn_index: u32,
}

impl Future for SendFuture {
    type Output = io::Result<u32>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<u32>> {
        with_state(|_driver, executor| {
            match executor.io_results[self.conn_index as usize].take() {
                Some(IoResult::Send(result)) => Poll::Ready(result),
                _ => {
                    executor.send_waiters[self.conn_index as usize] = true;
                    Poll::Pending
                }
            }
        })
    }
}

// ── ConnectFuture ────────────────────────────────────────────────────

/// Awaits an outbound connect submitted by [`connect()`] or
/// [`ConnCtx::connect()`].
pub struct ConnectFuture {
    conn_index: u32,
    generation: u32,
}

impl Future for ConnectFuture {
    type Output = io::Result<ConnCtx>;

    fn poll(self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<io::Result<ConnCtx>> {
        with_state(|_driver, executor| {
            match executor.io_results[self.conn_index as usize].take() {
                Some(IoResult::Connect(result)) => match result {
                    Ok(()) => Poll::Ready(Ok(ConnCtx::new(self.conn_index, self.generation))),
                    Err(e) => Poll::Ready(Err(e)),
                },
                _ => {
                    executor.connect_waiters[self.conn_index as usize] = true;
                    Poll::Pending
                }
            }
        })
    }
}

// ── Sleep ────────────────────────────────────────────────────────────

/// Claim a timer slot, write its timespec, and submit the timeout SQE.
/// `Ok(None)` means the submit queue refused the SQE; the slot has been
/// released and the caller should resolve without waiting.
fn arm_timer(
    driver: &mut Driver,
    executor: &mut Executor,
    duration: Duration,
    absolute: Option<Deadline>,
) -> Result<Option<(u32, u16)>, TimerExhausted> {
    let waker_id = CURRENT_TASK_ID.with(|c| c.get());
    let (slot, generation) = executor.timer_pool.allocate(waker_id).ok_or_else(|| {
        crate::metrics::TIMER_POOL_EXHAUSTED.increment();
        TimerExhausted
    })?;

    executor.timer_pool.timespecs[slot as usize] = match absolute {
        Some(deadline) => io_uring::types::Timespec::new()
            .sec(deadline.secs)
            .nsec(deadline.nsecs),
        None => io_uring::types::Timespec::new()
            .sec(duration.as_secs())
            .nsec(duration.subsec_nanos()),
    };

    let payload = TimerSlotPool::encode_payload(slot, generation);
    let ud = UserData::encode(OpTag::Timer, 0, payload);
    let ts_ptr = &executor.timer_pool.timespecs[slot as usize] as *const io_uring::types::Timespec;

    let submitted = if absolute.is_some() {
        driver.ring.submit_timeout_abs(ts_ptr, ud)
    } else {
        driver.ring.submit_timeout(ts_ptr, ud)
    };

    if submitted.is_err() {
        executor.timer_pool.release(slot);
        return Ok(None);
    }
    Ok(Some((slot, generation)))
}

/// Complete after `duration`, via an io_uring timeout SQE on the calling
/// worker. Panics when the timer slot pool is exhausted; use
/// [`try_sleep()`] to handle that case.
pub fn sleep(duration: Duration) -> SleepFuture {
    SleepFuture {
        duration,
        timer_slot: None,
        generation: 0,
        absolute: None,
    }
}

/// Future returned by [`sleep()`] / [`sleep_until()`].
pub struct SleepFuture {
    duration: Duration,
    /// None until the first poll submits the SQE.
    timer_slot: Option<u32>,
    generation: u16,
    /// Set for absolute (deadline) timers.
    absolute: Option<Deadline>,
}

impl Future for SleepFuture {
    type Output = ();

    fn poll(mut self: Pin<&mut Self>, _cx: &mut Context<'_>) -> Poll<()> {
        with_state(|driver, executor| {
            if let Some(slot) = self.timer_slot {
                if executor.timer_pool.is_fired(slot) {
                    executor.timer_pool.release(slot);
                    self.timer_slot = None;
                    return Poll::Ready(());
                }
                return Poll::Pending;
            }

            // First poll: claim a slot, write the timespec, submit.
            match arm_timer(driver, executor, self.duration, self.absolute)
                .expect("timer slot pool exhausted")
            {
                Some((slot, generation)) => {
                    self.timer_slot = Some(slot);
                    self.generation = generation;
                    Poll::Pending
                }
                // Do not hang on SQ pressure; resolve now.
                None => Poll::Ready(()),
            }
        })
    }
}

impl Drop for SleepFuture {
    fn drop(&mut self) {
        let Some(slot) = self.timer_slot else { return };
        let generation = self.generation;
        // Submitted but never fired, e.g. the losing side of a select
        // race. Cancel the SQE and retire the slot.
        try_with_state(|driver, executor| {
            if !executor.timer_pool.is_fired(slot) {
                let payload = TimerSlotPool::encode_payload(slot, generation);
                let target_ud = UserData::encode(OpTag::Timer, 0, payload);
                let _ = driver.ring.submit_async_cancel(target_ud.raw(), 0);
            }
            executor.timer_pool.release(slot);
        });
    }
}

/// Fallible [`sleep()`]: `Err(TimerExhausted)` instead of panicking when
/// the pool is full. The slot is claimed eagerly, at call time.
pub fn try_sleep(duration: Duration) -> Result<SleepFuture, TimerExhausted> {
    with_state(|driver, executor| {
        let armed = arm_timer(driver, executor, duration, None)?;
        let (timer_slot, generation) = match armed {
            Some((slot, generation)) => (Some(slot), generation),
            None => (None, 0),
        };
        Ok(SleepFuture {
            duration,
            timer_slot,
            generation,
            absolute: None,
        })
    })
}

// ── Deadline ─────────────────────────────────────────────────────────

/// Point on `CLOCK_MONOTONIC` (the clock io_uring timers use).
#[derive(Copy, Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub struct Deadline {
    pub(crate) secs: u64,
    pub(crate) nsecs: u32,
}

impl Deadline {
    pub fn now() -> Self {
        let mut ts = libc::timespec {
            tv_sec: 0,
            tv_nsec: 0,
        };
        // Safety: plain clock_gettime on a stack timespec.
        unsafe {
            libc::clock_gettime(libc::CLOCK_MONOTONIC, &mut ts);
        }
        Deadline {
            secs: ts.tv_sec as u64,
            nsecs: ts.tv_nsec as u32,
        }
    }

    pub fn after(duration: Duration) -> Self {
        Self::from_duration(Self::now().as_duration() + duration)
    }

    /// Time left until the deadline, zero if already past.
    pub fn remaining(&self) -> Duration {
        self.as_duration().saturating_sub(Self::now().as_duration())
    }

    fn as_duration(&self) -> Duration {
        Duration::new(self.secs, self.nsecs)
    }

    fn from_duration(d: Duration) -> Self {
        Deadline {
            secs: d.as_secs(),
            nsecs: d.subsec_nanos(),
        }
    }
}

/// Complete at an absolute deadline (`TIMEOUT_ABS`), with no drift from
/// repeated relative sleeps.
pub fn sleep_until(deadline: Deadline) -> SleepFuture {
    SleepFuture {
        duration: Duration::ZERO,
        timer_slot: None,
        generation: 0,
        absolute: Some(deadline),
    }
}

/// Fallible [`sleep_until()`]; the slot is claimed eagerly.
pub fn try_sleep_until(deadline: Deadline) -> Result<SleepFuture, TimerExhausted> {
    with_state(|driver, executor| {
        let armed = arm_timer(driver, executor, Duration::ZERO, Some(deadline))?;
        let (timer_slot, generation) = match armed {
            Some((slot, generation)) => (Some(slot), generation),
            None => (None, 0),
        };
        Ok(SleepFuture {
            duration: Duration::ZERO,
            timer_slot,
            generation,
            absolute: Some(deadline),
        })
    })
}

// ── Timeout ──────────────────────────────────────────────────────────

/// A [`timeout()`] deadline expired before the wrapped future finished.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Elapsed;

impl fmt::Display for Elapsed {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str("deadline has elapsed")
    }
}

impl std::error::Error for Elapsed {}

/// Race `future` against a timer. `Err(Elapsed)` when the timer wins;
/// the future is dropped and never resumed afterwards.
///
/// # Example
///
/// ```no_run
/// # async fn example() {
/// use std::time::Duration;
/// match shoreline::timeout(Duration::from_secs(1), async { 42 }).await {
///     Ok(value) => { /* completed in time */ }
///     Err(_elapsed) => { /* timed out */ }
/// }
/// # }
/// ```
pub fn timeout<F: Future>(duration: Duration, future: F) -> TimeoutFuture<F> {
    TimeoutFuture {
        future,
        sleep: sleep(duration),
    }
}

/// Fallible [`timeout()`]: `Err(TimerExhausted)` when no timer slot is
/// free.
pub fn try_timeout<F: Future>(
    duration: Duration,
    future: F,
) -> Result<TimeoutFuture<F>, TimerExhausted> {
    let sleep = try_sleep(duration)?;
    Ok(TimeoutFuture { future, sleep })
}

/// [`timeout()`] against an absolute deadline.
pub fn timeout_at<F: Future>(deadline: Deadline, future: F) -> TimeoutFuture<F> {
    TimeoutFuture {
        future,
        sleep: sleep_until(deadline),
    }
}

/// Fallible [`timeout_at()`].
pub fn try_timeout_at<F: Future>(
    deadline: Deadline,
    future: F,
) -> Result<TimeoutFuture<F>, TimerExhausted> {
    let sleep = try_sleep_until(deadline)?;
    Ok(TimeoutFuture { future, sleep })
}

pin_project_lite::pin_project! {
    /// Future returned by [`timeout()`] / [`timeout_at()`].
    pub struct TimeoutFuture<F> {
        #[pin]
        future: F,
        #[pin]
        sleep: SleepFuture,
    }
}

impl<F: Future> Future for TimeoutFuture<F> {
    type Output = Result<F::Output, Elapsed>;

    fn poll(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let this = self.project();

        // Inner future first: if both are ready, completion beats the
        // deadline.
        if let Poll::Ready(output) = this.future.poll(cx) {
            return Poll::Ready(Ok(output));
        }

        if let Poll::Ready(()) = this.sleep.poll(cx) {
            return Poll::Ready(Err(Elapsed));
        }

        Poll::Pending
    }
}
