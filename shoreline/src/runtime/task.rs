use std::future::Future;
use std::pin::Pin;

use slab::Slab;

pub(crate) type BoxFuture = Pin<Box<dyn Future<Output = ()> + 'static>>;

/// Opaque handle for a standalone task spawned via [`spawn()`](crate::spawn).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TaskId(pub(crate) u32);

/// State of one stored task.
///
/// Spawned tasks start `Ready` but do not run until the event loop drains
/// the ready queue, so a freshly spawned task is effectively suspended.
/// While the executor holds the future out for polling the slot reads
/// `Running`; the poll pass either parks the future back or removes the
/// slot when it completed.
enum TaskSlot {
    Running,
    /// Suspended, waiting for its waker.
    Parked(BoxFuture),
    /// Queued for the next poll pass.
    Ready(BoxFuture),
}

impl TaskSlot {
    /// Move a `Ready` future out, leaving the slot `Running`.
    fn take_ready(&mut self) -> Option<BoxFuture> {
        match std::mem::replace(self, TaskSlot::Running) {
            TaskSlot::Ready(fut) => Some(fut),
            other => {
                *self = other;
                None
            }
        }
    }

    /// Promote `Parked` to `Ready`. False when no queue entry is needed:
    /// already `Ready`, or mid-poll (the poll pass re-checks readiness).
    fn wake(&mut self) -> bool {
        match std::mem::replace(self, TaskSlot::Running) {
            TaskSlot::Parked(fut) => {
                *self = TaskSlot::Ready(fut);
                true
            }
            other => {
                *self = other;
                false
            }
        }
    }
}

/// Per-connection tasks, addressed by connection slot index.
///
/// Exactly one task per live connection; it is created when the socket is
/// adopted and removed when the slot closes. The fixed index mapping means
/// no allocator is involved, just a flat table the size of the connection
/// limit.
pub(crate) struct TaskSlab {
    tasks: Vec<Option<TaskSlot>>,
}

impl TaskSlab {
    pub(crate) fn new(max_connections: u32) -> Self {
        let mut tasks = Vec::new();
        tasks.resize_with(max_connections as usize, || None);
        TaskSlab { tasks }
    }

    /// Install a task for a connection, marked Ready for its first poll.
    pub(crate) fn spawn(&mut self, conn_index: u32, future: BoxFuture) {
        let idx = conn_index as usize;
        debug_assert!(idx < self.tasks.len(), "conn_index out of range");
        debug_assert!(
            self.tasks[idx].is_none(),
            "slot {conn_index} already has a task"
        );
        self.tasks[idx] = Some(TaskSlot::Ready(future));
    }

    /// Move a Ready task out for polling; None if the slot is not Ready.
    pub(crate) fn take_ready(&mut self, conn_index: u32) -> Option<BoxFuture> {
        self.tasks
            .get_mut(conn_index as usize)?
            .as_mut()?
            .take_ready()
    }

    /// Store the future back after `Poll::Pending`.
    pub(crate) fn park(&mut self, conn_index: u32, future: BoxFuture) {
        let idx = conn_index as usize;
        debug_assert!(idx < self.tasks.len());
        self.tasks[idx] = Some(TaskSlot::Parked(future));
    }

    /// Promote Parked to Ready. Returns false when no new queue entry is
    /// needed (already Ready, mid-poll, or the slot is empty).
    pub(crate) fn wake(&mut self, conn_index: u32) -> bool {
        match self.tasks.get_mut(conn_index as usize) {
            Some(Some(slot)) => slot.wake(),
            _ => false,
        }
    }

    /// Drop a task (connection closed or future completed).
    pub(crate) fn remove(&mut self, conn_index: u32) {
        if let Some(slot) = self.tasks.get_mut(conn_index as usize) {
            *slot = None;
        }
    }

    #[allow(dead_code)]
    pub(crate) fn has_task(&self, conn_index: u32) -> bool {
        matches!(self.tasks.get(conn_index as usize), Some(Some(_)))
    }
}

/// Tasks not tied to any connection, slotted through a bounded `Slab`.
///
/// Indices are independent of connection indices; the executor tells the
/// two apart with `STANDALONE_BIT`. The slab recycles slots on its own;
/// the cap only bounds how many standalone tasks may be live at once.
pub(crate) struct StandaloneTaskSlab {
    tasks: Slab<TaskSlot>,
    capacity: usize,
}

impl StandaloneTaskSlab {
    pub(crate) fn new(capacity: u32) -> Self {
        StandaloneTaskSlab {
            tasks: Slab::with_capacity(capacity as usize),
            capacity: capacity as usize,
        }
    }

    /// Install a task; None when the slab is at capacity.
    pub(crate) fn spawn(&mut self, future: BoxFuture) -> Option<u32> {
        if self.tasks.len() >= self.capacity {
            return None;
        }
        Some(self.tasks.insert(TaskSlot::Ready(future)) as u32)
    }

    pub(crate) fn take_ready(&mut self, task_idx: u32) -> Option<BoxFuture> {
        self.tasks.get_mut(task_idx as usize)?.take_ready()
    }

    pub(crate) fn park(&mut self, task_idx: u32, future: BoxFuture) {
        if let Some(slot) = self.tasks.get_mut(task_idx as usize) {
            *slot = TaskSlot::Parked(future);
        }
    }

    pub(crate) fn wake(&mut self, task_idx: u32) -> bool {
        match self.tasks.get_mut(task_idx as usize) {
            Some(slot) => slot.wake(),
            None => false,
        }
    }

    /// Remove a finished or abandoned task and recycle its slot.
    pub(crate) fn remove(&mut self, task_idx: u32) {
        let idx = task_idx as usize;
        if self.tasks.contains(idx) {
            self.tasks.remove(idx);
        }
    }

    #[allow(dead_code)]
    pub(crate) fn has_task(&self, task_idx: u32) -> bool {
        self.tasks.contains(task_idx as usize)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::task::{Context, Poll};

    /// Resolves after N polls, waking itself in between.
    struct CountdownFuture(u32);

    impl Future for CountdownFuture {
        type Output = ();
        fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<()> {
            if self.0 == 0 {
                Poll::Ready(())
            } else {
                self.0 -= 1;
                cx.waker().wake_by_ref();
                Poll::Pending
            }
        }
    }

    #[test]
    fn spawned_task_is_ready_once() {
        let mut slab = TaskSlab::new(2);
        slab.spawn(0, Box::pin(CountdownFuture(1)));
        assert!(slab.take_ready(0).is_some());
        assert!(slab.take_ready(0).is_none());
    }

    #[test]
    fn parked_task_needs_wake() {
        let mut slab = TaskSlab::new(2);
        slab.spawn(1, Box::pin(CountdownFuture(1)));
        let fut = slab.take_ready(1).unwrap();
        slab.park(1, fut);

        assert!(slab.take_ready(1).is_none());
        assert!(slab.wake(1));
        assert!(slab.take_ready(1).is_some());
    }

    #[test]
    fn wake_while_ready_does_not_requeue() {
        let mut slab = TaskSlab::new(2);
        slab.spawn(0, Box::pin(CountdownFuture(0)));
        assert!(!slab.wake(0));
    }

    #[test]
    fn wake_while_running_does_not_requeue() {
        let mut slab = TaskSlab::new(2);
        slab.spawn(0, Box::pin(CountdownFuture(1)));
        let _held = slab.take_ready(0).unwrap();
        assert!(!slab.wake(0));
        assert!(slab.has_task(0));
    }

    #[test]
    fn remove_empties_the_slot() {
        let mut slab = TaskSlab::new(2);
        slab.spawn(0, Box::pin(CountdownFuture(0)));
        slab.remove(0);
        assert!(!slab.has_task(0));
        assert!(!slab.wake(0));
    }

    #[test]
    fn standalone_capacity_and_recycling() {
        let mut slab = StandaloneTaskSlab::new(2);
        let a = slab.spawn(Box::pin(CountdownFuture(0))).unwrap();
        let _b = slab.spawn(Box::pin(CountdownFuture(0))).unwrap();
        assert!(slab.spawn(Box::pin(CountdownFuture(0))).is_none());

        slab.remove(a);
        assert!(slab.spawn(Box::pin(CountdownFuture(0))).is_some());
    }

    #[test]
    fn standalone_park_wake_cycle() {
        let mut slab = StandaloneTaskSlab::new(2);
        let idx = slab.spawn(Box::pin(CountdownFuture(1))).unwrap();
        let fut = slab.take_ready(idx).unwrap();
        slab.park(idx, fut);
        assert!(slab.take_ready(idx).is_none());
        assert!(slab.wake(idx));
        assert!(slab.take_ready(idx).is_some());
    }

    #[test]
    fn standalone_remove_mid_poll_recycles() {
        let mut slab = StandaloneTaskSlab::new(1);
        let idx = slab.spawn(Box::pin(CountdownFuture(1))).unwrap();
        let _held = slab.take_ready(idx).unwrap();
        slab.remove(idx);
        assert!(!slab.has_task(idx));
        assert!(slab.spawn(Box::pin(CountdownFuture(0))).is_some());
    }
}
