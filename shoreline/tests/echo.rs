#![allow(clippy::manual_async_fn)]
//! Integration tests driving a live shoreline worker over real TCP.
//!
//! Each test launches a single-worker server, talks to it with blocking
//! std sockets, and joins the worker threads on shutdown.

use std::future::Future;
use std::io::{self, Read, Write};
use std::net::{SocketAddr, TcpStream};
use std::pin::Pin;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::OnceLock;
use std::time::Duration;

use shoreline::{AsyncEventHandler, Config, ConnCtx, ParseResult, ShorelineBuilder};

// ── Handlers ────────────────────────────────────────────────────────

struct Echo;

impl AsyncEventHandler for Echo {
    fn on_accept(&self, conn: ConnCtx) -> impl Future<Output = ()> + 'static {
        async move {
            loop {
                let n = conn
                    .with_data(|data| {
                        let _ = conn.send_nowait(data);
                        ParseResult::Consumed(data.len())
                    })
                    .await;
                if n == 0 {
                    break;
                }
            }
        }
    }
    fn create_for_worker(_id: usize) -> Self {
        Echo
    }
}

/// Echo that awaits each send completion before reading more.
struct FlushedEcho;

impl AsyncEventHandler for FlushedEcho {
    fn on_accept(&self, conn: ConnCtx) -> impl Future<Output = ()> + 'static {
        async move {
            loop {
                let mut chunk = Vec::new();
                let n = conn
                    .with_data(|data| {
                        chunk.extend_from_slice(data);
                        ParseResult::Consumed(data.len())
                    })
                    .await;
                if n == 0 {
                    break;
                }
                let sent = match conn.send(&chunk) {
                    Ok(fut) => fut.await,
                    Err(_) => break,
                };
                match sent {
                    Ok(total) if total as usize == chunk.len() => {}
                    _ => break,
                }
            }
        }
    }
    fn create_for_worker(_id: usize) -> Self {
        FlushedEcho
    }
}

/// Echo built on the `with_bytes` receive path.
struct BytesEcho;

impl AsyncEventHandler for BytesEcho {
    fn on_accept(&self, conn: ConnCtx) -> impl Future<Output = ()> + 'static {
        async move {
            loop {
                let n = conn
                    .with_bytes(|bytes| {
                        let _ = conn.send_nowait(&bytes);
                        ParseResult::Consumed(bytes.len())
                    })
                    .await;
                if n == 0 {
                    break;
                }
            }
        }
    }
    fn create_for_worker(_id: usize) -> Self {
        BytesEcho
    }
}

// ── Helpers ─────────────────────────────────────────────────────────

fn test_config() -> Config {
    let mut config = Config::default();
    config.worker.threads = 1;
    config.worker.pin_to_core = false;
    config.sq_entries = 64;
    config.recv_buffer.ring_size = 64;
    config.recv_buffer.buffer_size = 4096;
    config.max_connections = 64;
    config.send_copy_count = 64;
    config
}

fn free_port() -> u16 {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    listener.local_addr().unwrap().port()
}

fn wait_for_server(addr: &str) {
    for _ in 0..200 {
        if TcpStream::connect(addr).is_ok() {
            return;
        }
        std::thread::sleep(Duration::from_millis(10));
    }
    panic!("server did not start on {addr}");
}

fn read_exact_len(stream: &mut TcpStream, len: usize) -> Vec<u8> {
    let mut buf = vec![0u8; len];
    let mut total = 0;
    while total < len {
        match stream.read(&mut buf[total..]) {
            Ok(0) => break,
            Ok(n) => total += n,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) => panic!("read error: {e}"),
        }
    }
    buf.truncate(total);
    buf
}

fn round_trip(addr: &str, msg: &[u8]) -> Vec<u8> {
    let mut stream = TcpStream::connect(addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    stream.write_all(msg).unwrap();
    stream.flush().unwrap();
    read_exact_len(&mut stream, msg.len())
}

/// Read until `pred` says the response is complete or the peer closes.
fn read_until(stream: &mut TcpStream, pred: impl Fn(&str) -> bool) -> String {
    let mut buf = [0u8; 256];
    let mut total = 0;
    loop {
        match stream.read(&mut buf[total..]) {
            Ok(0) => break,
            Ok(n) => {
                total += n;
                let s = std::str::from_utf8(&buf[..total]).unwrap_or("");
                if pred(s) {
                    break;
                }
            }
            Err(e) if e.kind() == io::ErrorKind::WouldBlock => break,
            Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
            Err(e) => panic!("read error: {e}"),
        }
    }
    String::from_utf8_lossy(&buf[..total]).into_owned()
}

type WorkerHandles = Vec<std::thread::JoinHandle<Result<(), shoreline::Error>>>;

fn launch<A: AsyncEventHandler>(
    config: Config,
) -> (String, shoreline::ShutdownHandle, WorkerHandles) {
    let port = free_port();
    let addr = format!("127.0.0.1:{port}");
    let (shutdown, handles) = ShorelineBuilder::new(config)
        .bind(addr.parse().unwrap())
        .launch::<A>()
        .expect("launch failed");
    wait_for_server(&addr);
    (addr, shutdown, handles)
}

fn join_all(handles: WorkerHandles) {
    for h in handles {
        h.join().expect("worker panicked").expect("worker error");
    }
}

// ── Echo basics ─────────────────────────────────────────────────────

#[test]
fn echo_small_message() {
    let (addr, shutdown, handles) = launch::<Echo>(test_config());

    let msg = b"hello shoreline";
    assert_eq!(round_trip(&addr, msg), msg);

    shutdown.shutdown();
    join_all(handles);
}

#[test]
fn echo_large_message() {
    let (addr, shutdown, handles) = launch::<Echo>(test_config());

    // Larger than one provided buffer, so the echo spans several recvs.
    let msg: Vec<u8> = (0..32768).map(|i| (i % 251) as u8).collect();
    assert_eq!(round_trip(&addr, &msg), msg);

    shutdown.shutdown();
    join_all(handles);
}

#[test]
fn echo_sequential_messages_on_one_connection() {
    let (addr, shutdown, handles) = launch::<Echo>(test_config());

    let mut stream = TcpStream::connect(&addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();

    for i in 0..20 {
        let msg = format!("msg-{i}\n");
        stream.write_all(msg.as_bytes()).unwrap();
        stream.flush().unwrap();
        let echo = read_exact_len(&mut stream, msg.len());
        assert_eq!(echo, msg.as_bytes(), "mismatch on message {i}");
    }

    shutdown.shutdown();
    join_all(handles);
}

#[test]
fn echo_concurrent_connections() {
    let (addr, shutdown, handles) = launch::<Echo>(test_config());

    let mut clients = Vec::new();
    for i in 0..8 {
        let addr = addr.clone();
        clients.push(std::thread::spawn(move || {
            let msg = format!("client-{i}");
            assert_eq!(round_trip(&addr, msg.as_bytes()), msg.as_bytes());
        }));
    }
    for c in clients {
        c.join().unwrap();
    }

    shutdown.shutdown();
    join_all(handles);
}

#[test]
fn echo_with_awaited_send() {
    let (addr, shutdown, handles) = launch::<FlushedEcho>(test_config());

    let msg: Vec<u8> = (0..20000).map(|i| (i % 127) as u8).collect();
    assert_eq!(round_trip(&addr, &msg), msg);

    shutdown.shutdown();
    join_all(handles);
}

#[test]
fn echo_with_bytes_receive() {
    let (addr, shutdown, handles) = launch::<BytesEcho>(test_config());

    let msg = b"frozen buffer path";
    assert_eq!(round_trip(&addr, msg), msg);

    shutdown.shutdown();
    join_all(handles);
}

#[test]
fn multi_worker_echo() {
    let mut config = test_config();
    config.worker.threads = 2;
    let (addr, shutdown, handles) = launch::<Echo>(config);

    // Sequential connections round-robin across both workers.
    for i in 0..6 {
        let msg = format!("multi-{i}");
        assert_eq!(round_trip(&addr, msg.as_bytes()), msg.as_bytes());
    }

    shutdown.shutdown();
    join_all(handles);
}

#[test]
fn survives_abrupt_client_disconnects() {
    let (addr, shutdown, handles) = launch::<Echo>(test_config());

    for _ in 0..16 {
        let stream = TcpStream::connect(&addr).unwrap();
        drop(stream);
    }
    std::thread::sleep(Duration::from_millis(200));

    assert_eq!(round_trip(&addr, b"still alive"), b"still alive");

    shutdown.shutdown();
    join_all(handles);
}

#[test]
fn graceful_shutdown_joins_cleanly() {
    let (addr, shutdown, handles) = launch::<Echo>(test_config());

    assert_eq!(round_trip(&addr, b"pre-shutdown"), b"pre-shutdown");

    shutdown.shutdown();
    join_all(handles);
}

// ── Half-close ──────────────────────────────────────────────────────

/// Echoes once, half-closes the write side, then waits for client EOF.
struct HalfCloseEcho;

impl AsyncEventHandler for HalfCloseEcho {
    fn on_accept(&self, conn: ConnCtx) -> impl Future<Output = ()> + 'static {
        async move {
            let n = conn
                .with_data(|data| {
                    let _ = conn.send_nowait(data);
                    ParseResult::Consumed(data.len())
                })
                .await;
            if n > 0 {
                conn.shutdown_write();
            }
            let _ = conn.with_data(|_| ParseResult::Consumed(0)).await;
        }
    }
    fn create_for_worker(_id: usize) -> Self {
        HalfCloseEcho
    }
}

#[test]
fn shutdown_write_delivers_eof() {
    let (addr, shutdown, handles) = launch::<HalfCloseEcho>(test_config());

    let mut stream = TcpStream::connect(&addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();

    let msg = b"half close";
    stream.write_all(msg).unwrap();
    stream.flush().unwrap();
    assert_eq!(read_exact_len(&mut stream, msg.len()), msg);

    let mut extra = [0u8; 1];
    match stream.read(&mut extra) {
        Ok(0) => {}
        Ok(_) => panic!("expected EOF after shutdown_write"),
        Err(e) => panic!("unexpected error: {e}"),
    }

    shutdown.shutdown();
    join_all(handles);
}

// ── Worker-initiated shutdown ───────────────────────────────────────

struct ShutdownOnMessage;

impl AsyncEventHandler for ShutdownOnMessage {
    fn on_accept(&self, conn: ConnCtx) -> impl Future<Output = ()> + 'static {
        async move {
            conn.with_data(|data| {
                let _ = conn.send_nowait(data);
                conn.request_shutdown();
                ParseResult::Consumed(data.len())
            })
            .await;
        }
    }
    fn create_for_worker(_id: usize) -> Self {
        ShutdownOnMessage
    }
}

#[test]
fn request_shutdown_exits_worker() {
    let (addr, shutdown, handles) = launch::<ShutdownOnMessage>(test_config());

    let _ = round_trip(&addr, b"bye");

    // The handler requested shutdown; workers exit without the handle.
    join_all(handles);
    drop(shutdown);
}

// ── Standalone tasks, sleep, timeout ────────────────────────────────

static SPAWNED: AtomicU32 = AtomicU32::new(0);

struct SpawnOnAccept;

impl AsyncEventHandler for SpawnOnAccept {
    fn on_accept(&self, conn: ConnCtx) -> impl Future<Output = ()> + 'static {
        async move {
            shoreline::spawn(async {
                SPAWNED.fetch_add(1, Ordering::SeqCst);
            })
            .unwrap();
            conn.with_data(|data| {
                let _ = conn.send_nowait(data);
                ParseResult::Consumed(data.len())
            })
            .await;
        }
    }
    fn create_for_worker(_id: usize) -> Self {
        SpawnOnAccept
    }
}

#[test]
fn spawned_tasks_run() {
    SPAWNED.store(0, Ordering::SeqCst);
    let (addr, shutdown, handles) = launch::<SpawnOnAccept>(test_config());

    for _ in 0..3 {
        round_trip(&addr, b"spawn");
    }
    std::thread::sleep(Duration::from_millis(100));

    let count = SPAWNED.load(Ordering::SeqCst);
    assert!(count >= 3, "expected at least 3 spawned tasks, got {count}");

    shutdown.shutdown();
    join_all(handles);
}

/// Delays each echo by 50ms via a spawned task.
struct DelayedEcho;

impl AsyncEventHandler for DelayedEcho {
    fn on_accept(&self, conn: ConnCtx) -> impl Future<Output = ()> + 'static {
        async move {
            loop {
                let n = conn
                    .with_data(|data| {
                        let copy = data.to_vec();
                        let conn2 = conn;
                        shoreline::spawn(async move {
                            shoreline::sleep(Duration::from_millis(50)).await;
                            let _ = conn2.send_nowait(&copy);
                        })
                        .unwrap();
                        ParseResult::Consumed(data.len())
                    })
                    .await;
                if n == 0 {
                    break;
                }
            }
        }
    }
    fn create_for_worker(_id: usize) -> Self {
        DelayedEcho
    }
}

#[test]
fn sleep_delays_response() {
    let (addr, shutdown, handles) = launch::<DelayedEcho>(test_config());

    let start = std::time::Instant::now();
    assert_eq!(round_trip(&addr, b"delayed"), b"delayed");
    let elapsed = start.elapsed();
    assert!(
        elapsed >= Duration::from_millis(30),
        "response arrived after only {elapsed:?}"
    );

    shutdown.shutdown();
    join_all(handles);
}

/// Answers "ok" or "expire" probes with the timeout outcome.
struct TimeoutProbe;

impl AsyncEventHandler for TimeoutProbe {
    fn on_accept(&self, conn: ConnCtx) -> impl Future<Output = ()> + 'static {
        async move {
            conn.with_data(|data| {
                let conn2 = conn;
                match data {
                    b"ok" => {
                        shoreline::spawn(async move {
                            let r =
                                shoreline::timeout(Duration::from_secs(10), async { 7u32 }).await;
                            let reply: &[u8] = if r == Ok(7) { b"FAST" } else { b"FAIL" };
                            let _ = conn2.send_nowait(reply);
                        })
                        .unwrap();
                    }
                    b"expire" => {
                        shoreline::spawn(async move {
                            let r = shoreline::timeout(
                                Duration::from_millis(20),
                                shoreline::sleep(Duration::from_secs(10)),
                            )
                            .await;
                            let reply: &[u8] = if r.is_err() { b"ELAPSED" } else { b"FAIL" };
                            let _ = conn2.send_nowait(reply);
                        })
                        .unwrap();
                    }
                    _ => {}
                }
                ParseResult::Consumed(data.len())
            })
            .await;
            // Keep the connection task alive while the probe task replies.
            shoreline::sleep(Duration::from_secs(5)).await;
        }
    }
    fn create_for_worker(_id: usize) -> Self {
        TimeoutProbe
    }
}

#[test]
fn timeout_passes_through_fast_future() {
    let (addr, shutdown, handles) = launch::<TimeoutProbe>(test_config());

    let mut stream = TcpStream::connect(&addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    stream.write_all(b"ok").unwrap();
    let reply = read_until(&mut stream, |s| s == "FAST" || s == "FAIL");
    assert_eq!(reply, "FAST");

    shutdown.shutdown();
    join_all(handles);
}

#[test]
fn timeout_expires_on_slow_future() {
    let (addr, shutdown, handles) = launch::<TimeoutProbe>(test_config());

    let mut stream = TcpStream::connect(&addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    stream.write_all(b"expire").unwrap();
    let reply = read_until(&mut stream, |s| s == "ELAPSED" || s == "FAIL");
    assert_eq!(reply, "ELAPSED");

    shutdown.shutdown();
    join_all(handles);
}

/// Uses a deadline-based timeout around a long sleep.
struct DeadlineProbe;

impl AsyncEventHandler for DeadlineProbe {
    fn on_accept(&self, conn: ConnCtx) -> impl Future<Output = ()> + 'static {
        async move {
            let n = conn
                .with_data(|data| ParseResult::Consumed(data.len()))
                .await;
            if n == 0 {
                return;
            }

            let deadline = shoreline::Deadline::after(Duration::from_millis(20));
            let r = shoreline::timeout_at(deadline, shoreline::sleep(Duration::from_secs(10)))
                .await;
            let reply: &[u8] = if r.is_err() { b"DEADLINE" } else { b"FAIL" };
            let _ = conn.send_nowait(reply);
            shoreline::sleep(Duration::from_millis(20)).await;
        }
    }
    fn create_for_worker(_id: usize) -> Self {
        DeadlineProbe
    }
}

#[test]
fn timeout_at_expires_at_deadline() {
    let (addr, shutdown, handles) = launch::<DeadlineProbe>(test_config());

    let mut stream = TcpStream::connect(&addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    stream.write_all(b"go").unwrap();
    let reply = read_until(&mut stream, |s| s == "DEADLINE" || s == "FAIL");
    assert_eq!(reply, "DEADLINE");

    shutdown.shutdown();
    join_all(handles);
}

/// Fills the timer pool via try_sleep and reports whether the next
/// allocation fails.
struct TimerPoolProbe;

impl AsyncEventHandler for TimerPoolProbe {
    fn on_accept(&self, conn: ConnCtx) -> impl Future<Output = ()> + 'static {
        async move {
            let n = conn
                .with_data(|data| ParseResult::Consumed(data.len()))
                .await;
            if n == 0 {
                return;
            }

            let exhausted = {
                let _a = shoreline::try_sleep(Duration::from_secs(60));
                let _b = shoreline::try_sleep(Duration::from_secs(60));
                shoreline::try_sleep(Duration::from_secs(60)).is_err()
            };
            let reply: &[u8] = if exhausted { b"EXHAUSTED" } else { b"SPARE" };
            let _ = conn.send_nowait(reply);
            shoreline::sleep(Duration::from_secs(5)).await;
        }
    }
    fn create_for_worker(_id: usize) -> Self {
        TimerPoolProbe
    }
}

#[test]
fn try_sleep_reports_pool_exhaustion() {
    let mut config = test_config();
    config.timer_slots = 2;
    let (addr, shutdown, handles) = launch::<TimerPoolProbe>(config);

    let mut stream = TcpStream::connect(&addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    stream.write_all(b"go").unwrap();
    let reply = read_until(&mut stream, |s| s == "EXHAUSTED" || s == "SPARE");
    assert_eq!(reply, "EXHAUSTED");

    shutdown.shutdown();
    join_all(handles);
}

// ── Select and timer-slot reuse ─────────────────────────────────────

/// Races recv against a long sleep on every message. The losing
/// SleepFuture is dropped each round; with a tiny timer pool this
/// catches leaked slots.
struct RacedEcho;

impl AsyncEventHandler for RacedEcho {
    fn on_accept(&self, conn: ConnCtx) -> impl Future<Output = ()> + 'static {
        async move {
            for _ in 0..200 {
                match shoreline::select(
                    conn.with_data(|data| {
                        let _ = conn.send_nowait(data);
                        ParseResult::Consumed(data.len())
                    }),
                    shoreline::sleep(Duration::from_secs(60)),
                )
                .await
                {
                    shoreline::Either::Left(0) => break,
                    shoreline::Either::Left(_) => {}
                    shoreline::Either::Right(()) => break,
                }
            }
        }
    }
    fn create_for_worker(_id: usize) -> Self {
        RacedEcho
    }
}

#[test]
fn dropped_sleep_releases_timer_slot() {
    let mut config = test_config();
    config.timer_slots = 8;
    let (addr, shutdown, handles) = launch::<RacedEcho>(config);

    let mut stream = TcpStream::connect(&addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(10)))
        .unwrap();

    // Far more rounds than timer slots.
    for i in 0..200 {
        let msg = format!("round-{i}\n");
        stream.write_all(msg.as_bytes()).unwrap();
        stream.flush().unwrap();
        let echo = read_exact_len(&mut stream, msg.len());
        assert_eq!(echo, msg.as_bytes(), "mismatch on round {i}");
    }

    shutdown.shutdown();
    join_all(handles);
}

// ── Outbound connections ────────────────────────────────────────────

static BACKEND_ADDR: OnceLock<SocketAddr> = OnceLock::new();

/// Proxies each client message through a backend echo server.
struct Forwarder;

impl AsyncEventHandler for Forwarder {
    fn on_accept(&self, client: ConnCtx) -> impl Future<Output = ()> + 'static {
        let backend_addr = *BACKEND_ADDR.get().expect("backend addr not set");
        async move {
            let backend = match client.connect(backend_addr) {
                Ok(fut) => match fut.await {
                    Ok(ctx) => ctx,
                    Err(e) => {
                        let _ = client.send_nowait(format!("ERR:{e}").as_bytes());
                        return;
                    }
                },
                Err(e) => {
                    let _ = client.send_nowait(format!("ERR:{e}").as_bytes());
                    return;
                }
            };

            loop {
                let mut request = Vec::new();
                let n = client
                    .with_data(|data| {
                        request.extend_from_slice(data);
                        ParseResult::Consumed(data.len())
                    })
                    .await;
                if n == 0 {
                    break;
                }
                if backend.send_nowait(&request).is_err() {
                    break;
                }

                let mut reply = Vec::new();
                while reply.len() < request.len() {
                    let remaining = request.len() - reply.len();
                    let got = backend
                        .with_data(|data| {
                            let take = data.len().min(remaining);
                            reply.extend_from_slice(&data[..take]);
                            ParseResult::Consumed(take)
                        })
                        .await;
                    if got == 0 {
                        break;
                    }
                }
                if client.send_nowait(&reply).is_err() {
                    break;
                }
            }
            backend.close();
        }
    }
    fn create_for_worker(_id: usize) -> Self {
        Forwarder
    }
}

#[test]
fn outbound_connect_proxies_echo() {
    let (backend_addr, backend_shutdown, backend_handles) = launch::<Echo>(test_config());
    BACKEND_ADDR.set(backend_addr.parse().unwrap()).ok();

    let (addr, shutdown, handles) = launch::<Forwarder>(test_config());

    assert_eq!(round_trip(&addr, b"via backend"), b"via backend");

    let big: Vec<u8> = (0..4096).map(|i| (i % 256) as u8).collect();
    assert_eq!(round_trip(&addr, &big), big);

    shutdown.shutdown();
    join_all(handles);
    backend_shutdown.shutdown();
    join_all(backend_handles);
}

static DEAD_PORT: AtomicU32 = AtomicU32::new(0);

/// Reports the outcome of connecting to a closed port.
struct ConnectRefusedProbe;

impl AsyncEventHandler for ConnectRefusedProbe {
    fn on_accept(&self, client: ConnCtx) -> impl Future<Output = ()> + 'static {
        async move {
            client
                .with_data(|data| ParseResult::Consumed(data.len()))
                .await;

            let port = DEAD_PORT.load(Ordering::SeqCst);
            let addr: SocketAddr = format!("127.0.0.1:{port}").parse().unwrap();
            let reply = match client.connect(addr) {
                Ok(fut) => match fut.await {
                    Ok(_) => "CONNECTED".to_string(),
                    Err(e) => format!("REFUSED:{}", e.kind()),
                },
                Err(e) => format!("SUBMIT_ERR:{e}"),
            };
            let _ = client.send_nowait(reply.as_bytes());
            shoreline::sleep(Duration::from_secs(5)).await;
        }
    }
    fn create_for_worker(_id: usize) -> Self {
        ConnectRefusedProbe
    }
}

#[test]
fn outbound_connect_refused_reports_error() {
    let listener = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
    let dead_port = listener.local_addr().unwrap().port();
    drop(listener);
    DEAD_PORT.store(dead_port as u32, Ordering::SeqCst);

    let (addr, shutdown, handles) = launch::<ConnectRefusedProbe>(test_config());

    let mut stream = TcpStream::connect(&addr).unwrap();
    stream
        .set_read_timeout(Some(Duration::from_secs(5)))
        .unwrap();
    stream.write_all(b"go").unwrap();

    let reply = read_until(&mut stream, |s| {
        s.starts_with("REFUSED:") || s.starts_with("CONNECTED") || s.starts_with("SUBMIT_ERR")
    });
    assert!(
        reply.starts_with("REFUSED:"),
        "expected connect error, got: {reply}"
    );

    shutdown.shutdown();
    join_all(handles);
}

// ── Client-only worker via on_start ─────────────────────────────────

static CLIENT_ONLY_BACKEND: OnceLock<SocketAddr> = OnceLock::new();
static CLIENT_ONLY_RESULT: OnceLock<String> = OnceLock::new();

/// Worker with no listener: on_start dials the backend, echoes one
/// message through it, then requests shutdown.
struct ClientOnly;

impl AsyncEventHandler for ClientOnly {
    fn on_accept(&self, _conn: ConnCtx) -> impl Future<Output = ()> + 'static {
        async {}
    }

    fn on_start(&self) -> Option<Pin<Box<dyn Future<Output = ()> + 'static>>> {
        let backend_addr = *CLIENT_ONLY_BACKEND.get().expect("backend addr not set");
        Some(Box::pin(async move {
            let backend = match shoreline::connect(backend_addr) {
                Ok(fut) => match fut.await {
                    Ok(ctx) => ctx,
                    Err(e) => {
                        CLIENT_ONLY_RESULT.set(format!("ERR:{e}")).ok();
                        let _ = shoreline::request_shutdown();
                        return;
                    }
                },
                Err(e) => {
                    CLIENT_ONLY_RESULT.set(format!("ERR:{e}")).ok();
                    let _ = shoreline::request_shutdown();
                    return;
                }
            };

            if backend.send_nowait(b"DIAL_OUT").is_err() {
                CLIENT_ONLY_RESULT.set("SEND_ERR".to_string()).ok();
                let _ = shoreline::request_shutdown();
                return;
            }

            let mut echo = Vec::new();
            while echo.len() < 8 {
                let remaining = 8 - echo.len();
                let got = backend
                    .with_data(|data| {
                        let take = data.len().min(remaining);
                        echo.extend_from_slice(&data[..take]);
                        ParseResult::Consumed(take)
                    })
                    .await;
                if got == 0 {
                    break;
                }
            }

            CLIENT_ONLY_RESULT
                .set(String::from_utf8_lossy(&echo).into_owned())
                .ok();
            let _ = shoreline::request_shutdown();
        }))
    }

    fn create_for_worker(_id: usize) -> Self {
        ClientOnly
    }
}

#[test]
fn client_only_worker_dials_out() {
    let (backend_addr, backend_shutdown, backend_handles) = launch::<Echo>(test_config());
    CLIENT_ONLY_BACKEND.set(backend_addr.parse().unwrap()).ok();

    // No bind(): the worker runs without an acceptor.
    let (_shutdown, handles) = ShorelineBuilder::new(test_config())
        .launch::<ClientOnly>()
        .expect("launch failed");

    join_all(handles);

    let result = CLIENT_ONLY_RESULT.get().expect("on_start never ran");
    assert_eq!(result, "DIAL_OUT");

    backend_shutdown.shutdown();
    join_all(backend_handles);
}
