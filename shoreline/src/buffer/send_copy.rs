/// Pool of engine-owned slots that outbound data is copied into.
///
/// An SQE must point at memory that stays valid until its CQE arrives, so
/// `send()` copies the caller's bytes into a slot and the slot is released
/// only when the Send completion lands. Partial sends advance the slot's
/// cursor and resubmit the remainder from the same slot.
pub struct SendCopyPool {
    backing: Vec<u8>,
    slot_size: u32,
    count: u16,
    free_list: Vec<u16>,
    // Cursor within each slot; advances on partial send.
    slot_offset: Vec<u32>,
    slot_remaining: Vec<u32>,
    in_use: Vec<bool>,
}

impl SendCopyPool {
    pub fn new(count: u16, slot_size: u32) -> Self {
        let n = count as usize;
        SendCopyPool {
            backing: vec![0u8; n * slot_size as usize],
            slot_size,
            count,
            free_list: (0..count).rev().collect(),
            slot_offset: vec![0u32; n],
            slot_remaining: vec![0u32; n],
            in_use: vec![false; n],
        }
    }

    /// Claim a slot and copy `data` into it. Returns `(slot, ptr, len)`,
    /// or `None` when the pool is empty or `data` does not fit one slot.
    pub fn copy_in(&mut self, data: &[u8]) -> Option<(u16, *const u8, u32)> {
        if data.len() > self.slot_size as usize {
            return None;
        }
        let idx = self.free_list.pop()?;
        let base = idx as usize * self.slot_size as usize;
        self.backing[base..base + data.len()].copy_from_slice(data);
        self.slot_offset[idx as usize] = 0;
        self.slot_remaining[idx as usize] = data.len() as u32;
        self.in_use[idx as usize] = true;
        Some((idx, self.backing.as_ptr().wrapping_add(base), data.len() as u32))
    }

    /// Return a slot to the free list. Called when the Send CQE for the
    /// final resubmission lands. Double release is a no-op.
    pub fn release(&mut self, idx: u16) {
        debug_assert!((idx as usize) < self.count as usize);
        if !self.in_use[idx as usize] {
            return;
        }
        self.in_use[idx as usize] = false;
        self.slot_offset[idx as usize] = 0;
        self.slot_remaining[idx as usize] = 0;
        self.free_list.push(idx);
    }

    /// Account for `bytes_sent` from a slot. Returns `Some((ptr, len))`
    /// pointing at the unsent remainder when the send was partial, `None`
    /// when everything went out.
    pub fn try_advance(&mut self, slot: u16, bytes_sent: u32) -> Option<(*const u8, u32)> {
        let i = slot as usize;
        debug_assert!(self.in_use[i]);
        debug_assert!(bytes_sent <= self.slot_remaining[i]);
        let left = self.slot_remaining[i] - bytes_sent;
        if left == 0 {
            return None;
        }
        self.slot_offset[i] += bytes_sent;
        self.slot_remaining[i] = left;
        let base = i * self.slot_size as usize;
        let ptr = self
            .backing
            .as_ptr()
            .wrapping_add(base + self.slot_offset[i] as usize);
        Some((ptr, left))
    }

    /// Total bytes originally copied into the slot. Valid between
    /// `copy_in` and `release`.
    pub fn original_len(&self, slot: u16) -> u32 {
        let i = slot as usize;
        debug_assert!(self.in_use[i]);
        self.slot_offset[i] + self.slot_remaining[i]
    }

    pub fn slot_size(&self) -> u32 {
        self.slot_size
    }

    #[allow(dead_code)]
    pub fn free_count(&self) -> usize {
        self.free_list.len()
    }
}
