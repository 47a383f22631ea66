/// Kind of in-flight operation, carried in the top byte of user_data.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum OpTag {
    /// Multishot receive armed against a provided buffer ring.
    RecvMulti = 0,
    /// Copying send from a pool slot.
    Send = 1,
    /// Socket close via the fixed file table.
    Close = 2,
    /// TCP shutdown(2) prior to close.
    Shutdown = 3,
    /// Read on a worker's wakeup eventfd.
    EventFdRead = 4,
    /// TLS-internal send (handshake records, alerts). Releases its pool
    /// slot on completion without waking any task.
    TlsSend = 5,
    /// Outbound TCP connect.
    Connect = 6,
    /// Connect deadline timeout.
    Timeout = 7,
    /// Async cancel; its CQE is informational only.
    Cancel = 8,
    /// Periodic tick so submit_and_wait never blocks forever.
    TickTimeout = 9,
    /// Timer slot backing sleep/timeout futures.
    Timer = 10,
}

impl OpTag {
    pub fn from_u8(v: u8) -> Option<Self> {
        match v {
            0 => Some(OpTag::RecvMulti),
            1 => Some(OpTag::Send),
            2 => Some(OpTag::Close),
            3 => Some(OpTag::Shutdown),
            4 => Some(OpTag::EventFdRead),
            5 => Some(OpTag::TlsSend),
            6 => Some(OpTag::Connect),
            7 => Some(OpTag::Timeout),
            8 => Some(OpTag::Cancel),
            9 => Some(OpTag::TickTimeout),
            10 => Some(OpTag::Timer),
            _ => None,
        }
    }
}

/// Packed user_data identifying a completion.
///
/// Layout (64-bit):
/// ```text
/// bits 63..56  OpTag
/// bits 55..32  connection index (24 bits)
/// bits 31..0   payload (send slot, timer slot|generation, ...)
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UserData(pub u64);

impl UserData {
    const TAG_SHIFT: u64 = 56;
    const CONN_SHIFT: u64 = 32;
    const TAG_MASK: u64 = 0xFF << Self::TAG_SHIFT;
    const CONN_MASK: u64 = 0x00FF_FFFF << Self::CONN_SHIFT;
    const PAYLOAD_MASK: u64 = 0xFFFF_FFFF;

    #[inline]
    pub fn encode(tag: OpTag, conn_index: u32, payload: u32) -> Self {
        debug_assert!(conn_index < (1 << 24), "connection index exceeds 24 bits");
        let v = ((tag as u64) << Self::TAG_SHIFT)
            | (((conn_index as u64) & 0x00FF_FFFF) << Self::CONN_SHIFT)
            | (payload as u64);
        UserData(v)
    }

    #[inline]
    pub fn tag(self) -> Option<OpTag> {
        OpTag::from_u8(((self.0 & Self::TAG_MASK) >> Self::TAG_SHIFT) as u8)
    }

    #[inline]
    pub fn conn_index(self) -> u32 {
        ((self.0 & Self::CONN_MASK) >> Self::CONN_SHIFT) as u32
    }

    #[inline]
    pub fn payload(self) -> u32 {
        (self.0 & Self::PAYLOAD_MASK) as u32
    }

    #[inline]
    pub fn raw(self) -> u64 {
        self.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn encode_decode_round_trip() {
        for raw in 0..=10u8 {
            let tag = OpTag::from_u8(raw).unwrap();
            let ud = UserData::encode(tag, 0x0012_3456, 0xCAFE_F00D);
            assert_eq!(ud.tag(), Some(tag));
            assert_eq!(ud.conn_index(), 0x0012_3456);
            assert_eq!(ud.payload(), 0xCAFE_F00D);
        }
    }

    #[test]
    fn conn_index_at_limit() {
        let idx = (1u32 << 24) - 1;
        let ud = UserData::encode(OpTag::Send, idx, u32::MAX);
        assert_eq!(ud.conn_index(), idx);
        assert_eq!(ud.payload(), u32::MAX);
    }

    #[test]
    fn unknown_tag_decodes_to_none() {
        let ud = UserData(0x7F << 56);
        assert_eq!(ud.tag(), None);
    }
}
