//! shoreline — io_uring-native async server engine for Linux.
//!
//! shoreline is a thread-per-core network engine built directly on
//! io_uring. Each worker owns its own ring, executor, and connection
//! table; every accepted connection runs as a long-lived async task
//! ([`AsyncEventHandler::on_accept`]) on a single-threaded executor with
//! no work-stealing.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use shoreline::{AsyncEventHandler, Config, ConnCtx, ParseResult, ShorelineBuilder};
//!
//! struct Echo;
//!
//! impl AsyncEventHandler for Echo {
//!     fn on_accept(&self, conn: ConnCtx) -> impl std::future::Future<Output = ()> + 'static {
//!         async move {
//!             loop {
//!                 let n = conn.with_data(|data| {
//!                     conn.send_nowait(data).ok();
//!                     ParseResult::Consumed(data.len())
//!                 }).await;
//!                 if n == 0 { break; }
//!             }
//!         }
//!     }
//!     fn create_for_worker(_id: usize) -> Self { Echo }
//! }
//!
//! fn main() -> Result<(), shoreline::Error> {
//!     let config = Config::default();
//!     let (_shutdown, handles) = ShorelineBuilder::new(config)
//!         .bind("127.0.0.1:7878".parse().unwrap())
//!         .launch::<Echo>()?;
//!     for h in handles { h.join().unwrap()?; }
//!     Ok(())
//! }
//! ```
//!
//! # Platform
//!
//! Linux 6.0+ only. Requires io_uring with multishot recv, ring-provided
//! buffers, and fixed file table support.

// ── Internal modules ────────────────────────────────────────────────────
pub(crate) mod acceptor;
pub(crate) mod accumulator;
pub(crate) mod buffer;
pub(crate) mod completion;
pub(crate) mod connection;
pub(crate) mod driver;
pub(crate) mod event_loop;
pub(crate) mod metrics;
pub(crate) mod ring;
pub(crate) mod runtime;
pub(crate) mod tls;
pub(crate) mod worker;

// ── Public modules ──────────────────────────────────────────────────────
pub mod config;
pub mod error;

// ── Re-exports ──────────────────────────────────────────────────────────

pub use config::{
    Config, ConfigBuilder, RecvBufferConfig, TlsClientConfig, TlsConfig, WorkerConfig,
};
pub use connection::ConnToken;
pub use error::{Error, TimerExhausted};
pub use runtime::handler::AsyncEventHandler;
pub use runtime::io::{
    connect, connect_tls, connect_tls_with_timeout, connect_with_timeout, request_shutdown, sleep,
    sleep_until, spawn, timeout, timeout_at, try_sleep, try_sleep_until, try_timeout,
    try_timeout_at, ConnCtx, ConnectFuture, Deadline, Elapsed, ParseResult, SendFuture,
    SleepFuture, TimeoutFuture, WithBytesFuture, WithDataFuture,
};
pub use runtime::select::{select, Either, Select};
pub use runtime::task::TaskId;
pub use worker::{ShorelineBuilder, ShutdownHandle};
