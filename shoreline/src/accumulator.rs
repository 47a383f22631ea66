//! Per-connection reassembly buffers.
//!
//! A parser always sees the connection's pending bytes as one contiguous
//! slice and reports how much it consumed; whatever it leaves behind stays
//! buffered for the next feed. Consumption is O(1) via `BytesMut::advance`.

use bytes::{Buf, Bytes, BytesMut};

pub struct RecvAccumulator {
    buf: BytesMut,
}

impl RecvAccumulator {
    pub fn new(capacity: usize) -> Self {
        RecvAccumulator {
            buf: BytesMut::with_capacity(capacity),
        }
    }

    /// Append received bytes, growing as needed.
    pub fn append(&mut self, data: &[u8]) {
        self.buf.extend_from_slice(data);
    }

    pub fn data(&self) -> &[u8] {
        &self.buf[..]
    }

    /// Drop `n` bytes from the front.
    pub fn consume(&mut self, n: usize) {
        if n == 0 {
            return;
        }
        debug_assert!(
            n <= self.buf.len(),
            "consume({n}) exceeds buffered length {}",
            self.buf.len()
        );
        let n = n.min(self.buf.len());
        self.buf.advance(n);
    }

    pub fn reset(&mut self) {
        self.buf.clear();
    }
}

/// One accumulator per connection slot, stored apart from the connection
/// table so the event loop can borrow the two independently.
pub struct AccumulatorTable {
    accumulators: Vec<RecvAccumulator>,
}

impl AccumulatorTable {
    pub fn new(count: u32, capacity: usize) -> Self {
        let mut accumulators = Vec::with_capacity(count as usize);
        accumulators.resize_with(count as usize, || RecvAccumulator::new(capacity));
        AccumulatorTable { accumulators }
    }

    pub fn append(&mut self, index: u32, data: &[u8]) {
        self.accumulators[index as usize].append(data);
    }

    pub fn data(&self, index: u32) -> &[u8] {
        self.accumulators[index as usize].data()
    }

    pub fn consume(&mut self, index: u32, n: usize) {
        self.accumulators[index as usize].consume(n);
    }

    pub fn reset(&mut self, index: u32) {
        self.accumulators[index as usize].reset();
    }

    /// Detach the buffered bytes as a frozen `Bytes`, leaving the
    /// accumulator empty. Pair with [`prepend`](Self::prepend) to restore
    /// an unconsumed tail after zero-copy parsing.
    pub fn take_frozen(&mut self, index: u32) -> Bytes {
        let acc = &mut self.accumulators[index as usize];
        std::mem::replace(&mut acc.buf, BytesMut::new()).freeze()
    }

    /// Restore bytes the parser did not consume (incomplete next message,
    /// or a pipelined follow-up).
    pub fn prepend(&mut self, index: u32, data: &[u8]) {
        if data.is_empty() {
            return;
        }
        let acc = &mut self.accumulators[index as usize];
        if acc.buf.is_empty() {
            acc.buf.extend_from_slice(data);
        } else {
            // Cannot happen while polling is single-threaded, but keep the
            // remainder ordered before anything that slipped in.
            let mut merged = BytesMut::with_capacity(data.len() + acc.buf.len());
            merged.extend_from_slice(data);
            merged.extend_from_slice(&acc.buf);
            acc.buf = merged;
        }
    }
}
