//! Task executor, wakers, and I/O futures.
//!
//! `task`, `waker`, and the `Executor` here know nothing about io_uring;
//! `io` is the backend-specific half, reaching the concrete `Driver`
//! through a thread-local pointer set by the event loop before each poll.

pub(crate) mod handler;
pub(crate) mod io;
pub(crate) mod select;
pub(crate) mod task;
pub(crate) mod waker;

use std::cell::Cell;
use std::collections::VecDeque;
use std::io as stdio;

use self::task::{StandaloneTaskSlab, TaskSlab};
use self::waker::drain_ready_queue;

/// Completion result stashed per connection until its future consumes it.
pub(crate) enum IoResult {
    /// Send finished: total bytes written, or the error.
    Send(stdio::Result<u32>),
    /// Connect finished.
    Connect(stdio::Result<()>),
}

thread_local! {
    /// Task being polled right now; set by the executor before each poll.
    /// Connection tasks use their conn_index, standalone tasks their
    /// index | STANDALONE_BIT. SleepFuture reads this to know which task
    /// its timer CQE should wake.
    pub(crate) static CURRENT_TASK_ID: Cell<u32> = const { Cell::new(0) };
}

/// Slots backing io_uring timeout SQEs for sleep/timeout futures.
///
/// The Timespec lives in the slot so the kernel reads stable memory. A
/// per-slot generation rides in the SQE payload; a CQE whose generation
/// no longer matches was for a past occupant and is ignored.
pub(crate) struct TimerSlotPool {
    /// Stable addresses handed to the kernel.
    pub(crate) timespecs: Vec<io_uring::types::Timespec>,
    /// Task (STANDALONE_BIT-encoded) to wake when the timer fires.
    pub(crate) waker_ids: Vec<u32>,
    pub(crate) fired: Vec<bool>,
    pub(crate) generations: Vec<u16>,
    free_list: Vec<u32>,
}

impl TimerSlotPool {
    pub(crate) fn new(capacity: u32) -> Self {
        let cap = capacity as usize;
        TimerSlotPool {
            timespecs: vec![io_uring::types::Timespec::new(); cap],
            waker_ids: vec![0; cap],
            fired: vec![false; cap],
            generations: vec![0; cap],
            free_list: (0..capacity).collect(),
        }
    }

    /// Claim a slot for a timer. Returns `(slot, generation)`.
    pub(crate) fn allocate(&mut self, waker_id: u32) -> Option<(u32, u16)> {
        let slot = self.free_list.pop()?;
        let idx = slot as usize;
        self.waker_ids[idx] = waker_id;
        self.fired[idx] = false;
        Some((slot, self.generations[idx]))
    }

    /// Recycle a slot, invalidating any CQE still in flight for it.
    pub(crate) fn release(&mut self, slot: u32) {
        let idx = slot as usize;
        if idx < self.generations.len() {
            self.generations[idx] = self.generations[idx].wrapping_add(1);
            self.free_list.push(slot);
        }
    }

    /// Record a timer CQE. Returns the waker id, or None for a stale CQE.
    pub(crate) fn fire(&mut self, slot: u32, generation: u16) -> Option<u32> {
        let idx = slot as usize;
        if idx >= self.generations.len() || self.generations[idx] != generation {
            return None;
        }
        self.fired[idx] = true;
        Some(self.waker_ids[idx])
    }

    pub(crate) fn is_fired(&self, slot: u32) -> bool {
        self.fired.get(slot as usize).copied().unwrap_or(false)
    }

    /// Pack `(slot, generation)` into a UserData payload.
    pub(crate) fn encode_payload(slot: u32, generation: u16) -> u32 {
        (slot & 0xFFFF) | ((generation as u32) << 16)
    }

    pub(crate) fn decode_payload(payload: u32) -> (u32, u16) {
        (payload & 0xFFFF, (payload >> 16) as u16)
    }
}

/// Per-worker executor: the task slabs plus the waiter/result bookkeeping
/// that connects CQEs to parked futures.
pub(crate) struct Executor {
    pub(crate) task_slab: TaskSlab,
    pub(crate) standalone_slab: StandaloneTaskSlab,
    pub(crate) timer_pool: TimerSlotPool,
    /// Task ids ready to poll (STANDALONE_BIT-encoded).
    pub(crate) ready_queue: VecDeque<u32>,
    /// Per connection: a task is parked awaiting recv data.
    pub(crate) recv_waiters: Vec<bool>,
    /// Per connection: a task is parked awaiting its send completion.
    pub(crate) send_waiters: Vec<bool>,
    /// Per connection: a task is parked awaiting connect.
    pub(crate) connect_waiters: Vec<bool>,
    pub(crate) io_results: Vec<Option<IoResult>>,
    /// conn_index → task that owns the connection. Accepted connections
    /// own themselves; outbound connections are owned by whichever task
    /// called connect, so wakes must route through this map.
    pub(crate) owner_task: Vec<Option<u32>>,
}

impl Executor {
    pub(crate) fn new(max_connections: u32, standalone_capacity: u32, timer_slots: u32) -> Self {
        let cap = max_connections as usize;
        let mut io_results = Vec::with_capacity(cap);
        io_results.resize_with(cap, || None);
        Executor {
            task_slab: TaskSlab::new(max_connections),
            standalone_slab: StandaloneTaskSlab::new(standalone_capacity),
            timer_pool: TimerSlotPool::new(timer_slots),
            ready_queue: VecDeque::with_capacity(64),
            recv_waiters: vec![false; cap],
            send_waiters: vec![false; cap],
            connect_waiters: vec![false; cap],
            io_results,
            owner_task: vec![None; cap],
        }
    }

    /// Pull everything queued by wakers into our ready queue.
    pub(crate) fn collect_wakeups(&mut self) {
        drain_ready_queue(&mut self.ready_queue);
    }

    /// Clear all per-connection executor state after a close.
    pub(crate) fn remove_connection(&mut self, conn_index: u32) {
        let idx = conn_index as usize;
        self.task_slab.remove(conn_index);
        if idx < self.recv_waiters.len() {
            self.recv_waiters[idx] = false;
            self.send_waiters[idx] = false;
            self.connect_waiters[idx] = false;
            self.io_results[idx] = None;
            self.owner_task[idx] = None;
        }
    }

    /// Wake either kind of task by id. Returns true if it was parked.
    pub(crate) fn wake_task(&mut self, task_id: u32) -> bool {
        if task_id & waker::STANDALONE_BIT != 0 {
            let idx = task_id & !waker::STANDALONE_BIT;
            if self.standalone_slab.wake(idx) {
                self.ready_queue.push_back(task_id);
                return true;
            }
        } else if self.task_slab.wake(task_id) {
            self.ready_queue.push_back(task_id);
            return true;
        }
        false
    }

    /// Wake whichever task owns this connection. Accepted connections
    /// own themselves; outbound connections route through `owner_task`.
    fn wake_owner(&mut self, conn_index: u32) {
        let task_id = self.owner_task[conn_index as usize].unwrap_or(conn_index);
        self.wake_task(task_id);
    }

    /// Wake the task parked on this connection's recv, if any.
    pub(crate) fn wake_recv(&mut self, conn_index: u32) {
        if claim_waiter(&mut self.recv_waiters, conn_index) {
            self.wake_owner(conn_index);
        }
    }

    /// Deliver a send result and wake the waiting task.
    pub(crate) fn wake_send(&mut self, conn_index: u32, result: stdio::Result<u32>) {
        if claim_waiter(&mut self.send_waiters, conn_index) {
            self.io_results[conn_index as usize] = Some(IoResult::Send(result));
            self.wake_owner(conn_index);
        }
    }

    /// Deliver a connect result and wake the waiting task.
    pub(crate) fn wake_connect(&mut self, conn_index: u32, result: stdio::Result<()>) {
        if claim_waiter(&mut self.connect_waiters, conn_index) {
            self.io_results[conn_index as usize] = Some(IoResult::Connect(result));
            self.wake_owner(conn_index);
        }
    }
}

/// Clear and report a waiter flag; out-of-range indices read as unset.
fn claim_waiter(waiters: &mut [bool], conn_index: u32) -> bool {
    match waiters.get_mut(conn_index as usize) {
        Some(flag) => std::mem::replace(flag, false),
        None => false,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn new_executor_is_idle() {
        let exec = Executor::new(8, 4, 4);
        assert!(exec.ready_queue.is_empty());
        assert_eq!(exec.recv_waiters.len(), 8);
        assert_eq!(exec.io_results.len(), 8);
        assert_eq!(exec.owner_task.len(), 8);
    }

    #[test]
    fn remove_connection_clears_waiters() {
        let mut exec = Executor::new(4, 4, 4);
        exec.recv_waiters[2] = true;
        exec.send_waiters[2] = true;
        exec.io_results[2] = Some(IoResult::Send(Ok(7)));
        exec.owner_task[2] = Some(0);

        exec.remove_connection(2);
        assert!(!exec.recv_waiters[2]);
        assert!(!exec.send_waiters[2]);
        assert!(exec.io_results[2].is_none());
        assert!(exec.owner_task[2].is_none());
    }

    #[test]
    fn wake_parked_connection_task() {
        let mut exec = Executor::new(4, 4, 4);
        exec.task_slab
            .spawn(1, Box::pin(std::future::pending::<()>()));
        let fut = exec.task_slab.take_ready(1).unwrap();
        exec.task_slab.park(1, fut);

        assert!(exec.wake_task(1));
        assert_eq!(exec.ready_queue, [1]);
    }

    #[test]
    fn wake_parked_standalone_task() {
        let mut exec = Executor::new(4, 4, 4);
        let idx = exec
            .standalone_slab
            .spawn(Box::pin(std::future::pending::<()>()))
            .unwrap();
        let fut = exec.standalone_slab.take_ready(idx).unwrap();
        exec.standalone_slab.park(idx, fut);

        let task_id = idx | waker::STANDALONE_BIT;
        assert!(exec.wake_task(task_id));
        assert_eq!(exec.ready_queue, [task_id]);
    }

    #[test]
    fn recv_wake_routes_through_owner() {
        let mut exec = Executor::new(16, 4, 4);

        // Task 5 owns connection 12, as after an outbound connect.
        exec.task_slab
            .spawn(5, Box::pin(std::future::pending::<()>()));
        let fut = exec.task_slab.take_ready(5).unwrap();
        exec.task_slab.park(5, fut);
        exec.owner_task[12] = Some(5);
        exec.recv_waiters[12] = true;

        exec.wake_recv(12);
        assert_eq!(exec.ready_queue, [5]);
        assert!(!exec.recv_waiters[12]);
    }

    #[test]
    fn send_wake_stores_result() {
        let mut exec = Executor::new(8, 4, 4);
        exec.task_slab
            .spawn(3, Box::pin(std::future::pending::<()>()));
        let fut = exec.task_slab.take_ready(3).unwrap();
        exec.task_slab.park(3, fut);
        exec.send_waiters[3] = true;

        exec.wake_send(3, Ok(42));
        assert_eq!(exec.ready_queue, [3]);
        assert!(matches!(exec.io_results[3], Some(IoResult::Send(Ok(42)))));
    }

    #[test]
    fn wake_without_waiter_is_noop() {
        let mut exec = Executor::new(4, 4, 4);
        exec.wake_recv(1);
        exec.wake_send(1, Ok(0));
        exec.wake_connect(1, Ok(()));
        assert!(exec.ready_queue.is_empty());
    }

    #[test]
    fn timer_slot_generation_guards_stale_fire() {
        let mut pool = TimerSlotPool::new(2);
        let (slot, generation) = pool.allocate(7).unwrap();
        pool.release(slot);

        // CQE from before the release must be ignored.
        assert_eq!(pool.fire(slot, generation), None);

        let (slot2, gen2) = pool.allocate(9).unwrap();
        assert_eq!(slot2, slot);
        assert_eq!(pool.fire(slot2, gen2), Some(9));
        assert!(pool.is_fired(slot2));
    }

    #[test]
    fn timer_payload_round_trip() {
        let payload = TimerSlotPool::encode_payload(0x1234, 0xBEEF);
        assert_eq!(TimerSlotPool::decode_payload(payload), (0x1234, 0xBEEF));
    }
}
