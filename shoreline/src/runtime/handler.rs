use std::future::Future;
use std::pin::Pin;

use crate::runtime::io::ConnCtx;

/// Per-worker connection handler.
///
/// Each accepted socket becomes one long-lived async task produced by
/// [`on_accept`](Self::on_accept); the engine closes the connection when
/// that future completes, and never hands the same connection to two
/// tasks.
///
/// # Example
///
/// ```no_run
/// use std::future::Future;
/// use shoreline::{AsyncEventHandler, ConnCtx, ParseResult};
///
/// struct Echo;
///
/// impl AsyncEventHandler for Echo {
///     fn on_accept(&self, conn: ConnCtx) -> impl Future<Output = ()> + 'static {
///         async move {
///             loop {
///                 let n = conn.with_data(|data| {
///                     conn.send_nowait(data).ok();
///                     ParseResult::Consumed(data.len())
///                 }).await;
///                 if n == 0 {
///                     break;
///                 }
///             }
///         }
///     }
///
///     fn create_for_worker(_worker_id: usize) -> Self {
///         Echo
///     }
/// }
/// ```
pub trait AsyncEventHandler: 'static {
    /// Drive one accepted connection for its whole lifetime.
    fn on_accept(&self, conn: ConnCtx) -> impl Future<Output = ()> + 'static;

    /// Synchronous hook run once per event-loop iteration.
    fn on_tick(&mut self) {}

    /// Optional standalone task spawned before the loop starts accepting.
    ///
    /// Useful for workers that originate outbound connections via
    /// [`connect()`](crate::connect); the future may call
    /// [`request_shutdown()`](crate::request_shutdown) when done.
    fn on_start(&self) -> Option<Pin<Box<dyn Future<Output = ()> + 'static>>> {
        None
    }

    /// Build this worker's handler instance.
    fn create_for_worker(worker_id: usize) -> Self
    where
        Self: Sized;
}
