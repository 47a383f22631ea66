use std::collections::VecDeque;
use std::task::{RawWaker, RawWakerVTable, Waker};

thread_local! {
    /// Indices of tasks that are ready to poll. Wakers push here; the
    /// executor drains the queue after each CQE batch.
    pub(crate) static READY_QUEUE: std::cell::RefCell<VecDeque<u32>> =
        const { std::cell::RefCell::new(VecDeque::new()) };
}

/// Marks a ready-queue entry as a standalone task rather than a
/// connection task. Connection indices fit in 24 bits, so bit 31 is free.
pub(crate) const STANDALONE_BIT: u32 = 1 << 31;

/// Waker for the task owning `conn_index`. Zero allocation: the index is
/// smuggled through the RawWaker data pointer, so waking is just a push
/// onto the thread-local queue. Only valid on the executor's own thread.
pub(crate) fn conn_waker(conn_index: u32) -> Waker {
    debug_assert!(
        conn_index & STANDALONE_BIT == 0,
        "conn_index collides with standalone bit"
    );
    let data = conn_index as usize as *const ();
    // SAFETY: the vtable below upholds the RawWaker contract; data is a
    // plain integer, nothing is owned or freed.
    unsafe { Waker::from_raw(RawWaker::new(data, &VTABLE)) }
}

/// Waker for a standalone task; the index is tagged with
/// [`STANDALONE_BIT`] so the drain loop can tell the two kinds apart.
pub(crate) fn standalone_waker(task_idx: u32) -> Waker {
    debug_assert!(
        task_idx & STANDALONE_BIT == 0,
        "task_idx already tagged standalone"
    );
    let data = (task_idx | STANDALONE_BIT) as usize as *const ();
    unsafe { Waker::from_raw(RawWaker::new(data, &VTABLE)) }
}

const VTABLE: RawWakerVTable = RawWakerVTable::new(clone_fn, wake_fn, wake_by_ref_fn, drop_fn);

unsafe fn clone_fn(data: *const ()) -> RawWaker {
    RawWaker::new(data, &VTABLE)
}

unsafe fn wake_fn(data: *const ()) {
    unsafe { wake_by_ref_fn(data) };
}

unsafe fn wake_by_ref_fn(data: *const ()) {
    let index = data as usize as u32;
    READY_QUEUE.with(|q| {
        q.borrow_mut().push_back(index);
    });
}

unsafe fn drop_fn(_data: *const ()) {}

/// Move everything queued by wakers into `buf`.
pub(crate) fn drain_ready_queue(buf: &mut VecDeque<u32>) {
    READY_QUEUE.with(|q| {
        buf.append(&mut q.borrow_mut());
    });
}
