/// Index plus generation identifying one incarnation of a connection
/// slot. A token from a prior incarnation fails the generation check and
/// is discarded rather than touching the slot's next occupant.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ConnToken {
    pub(crate) index: u32,
    pub(crate) generation: u32,
}

impl ConnToken {
    pub(crate) fn new(index: u32, generation: u32) -> Self {
        ConnToken { index, generation }
    }

    pub fn index(&self) -> u32 {
        self.index
    }
}

/// Receive state of a connection slot.
#[derive(Debug)]
pub enum RecvMode {
    /// Multishot recv armed against the provided buffer ring.
    Armed,
    /// Closing or closed; no recv armed. Guards against a second Close SQE.
    Closed,
    /// Outbound connect in flight; recv armed once it completes.
    Connecting,
}

/// Per-connection state tracked by the driver.
pub struct ConnSlot {
    pub recv_mode: RecvMode,
    pub active: bool,
    /// Bumped on every release. Completions carrying an older generation
    /// are stale and must be discarded.
    pub generation: u32,
    /// True for slots opened via connect rather than accept.
    pub outbound: bool,
    /// TCP (and TLS, if any) handshake finished; the slot is usable for
    /// application I/O.
    pub established: bool,
    pub peer_addr: Option<std::net::SocketAddr>,
    /// A connect-deadline timeout SQE is armed for this slot.
    pub connect_timeout_armed: bool,
}

impl Default for ConnSlot {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnSlot {
    pub fn new() -> Self {
        ConnSlot {
            recv_mode: RecvMode::Closed,
            active: false,
            generation: 0,
            outbound: false,
            established: false,
            peer_addr: None,
            connect_timeout_armed: false,
        }
    }

    fn open(&mut self) {
        self.active = true;
        self.recv_mode = RecvMode::Armed;
    }

    fn open_outbound(&mut self) {
        self.active = true;
        self.outbound = true;
        self.established = false;
        self.recv_mode = RecvMode::Connecting;
    }

    fn reset(&mut self) {
        self.active = false;
        self.recv_mode = RecvMode::Closed;
        self.outbound = false;
        self.established = false;
        self.peer_addr = None;
        self.connect_timeout_armed = false;
        self.generation = self.generation.wrapping_add(1);
    }
}

/// Fixed-capacity connection table with a free list for O(1) allocation.
///
/// Slot indices double as fixed-file-table indices, so a slot must not be
/// reused while any operation against its fd is still in flight; the
/// generation counter catches completions that arrive after reuse anyway.
pub struct ConnectionTable {
    slots: Vec<ConnSlot>,
    free_list: Vec<u32>,
}

impl ConnectionTable {
    pub fn new(max_connections: u32) -> Self {
        let mut slots = Vec::with_capacity(max_connections as usize);
        slots.resize_with(max_connections as usize, ConnSlot::new);
        // Reverse so pop() hands out the lowest index first.
        let free_list: Vec<u32> = (0..max_connections).rev().collect();
        ConnectionTable { slots, free_list }
    }

    /// Claim a slot for an accepted socket.
    pub fn allocate(&mut self) -> Option<u32> {
        let idx = self.free_list.pop()?;
        self.slots[idx as usize].open();
        Some(idx)
    }

    /// Claim a slot for an outbound connect.
    pub fn allocate_outbound(&mut self) -> Option<u32> {
        let idx = self.free_list.pop()?;
        self.slots[idx as usize].open_outbound();
        Some(idx)
    }

    /// Return a slot to the free list, bumping its generation.
    pub fn release(&mut self, idx: u32) {
        if let Some(slot) = self.slots.get_mut(idx as usize) {
            if !slot.active {
                return; // already released
            }
            slot.reset();
            self.free_list.push(idx);
        }
    }

    pub fn get(&self, idx: u32) -> Option<&ConnSlot> {
        self.slots.get(idx as usize).filter(|s| s.active)
    }

    pub fn get_mut(&mut self, idx: u32) -> Option<&mut ConnSlot> {
        self.slots.get_mut(idx as usize).filter(|s| s.active)
    }

    pub fn active_count(&self) -> usize {
        self.slots.len().saturating_sub(self.free_list.len())
    }

    pub fn max_slots(&self) -> u32 {
        self.slots.len() as u32
    }

    /// Generation for a slot, valid even when the slot is inactive.
    pub fn generation(&self, idx: u32) -> u32 {
        self.slots[idx as usize].generation
    }
}
