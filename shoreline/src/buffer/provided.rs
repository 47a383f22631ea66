use std::io;
use std::ptr;
use std::sync::atomic::{self, AtomicU16};

/// Mirrors the kernel's `struct io_uring_buf`.
#[repr(C)]
struct BufRingEntry {
    addr: u64,
    len: u32,
    bid: u16,
    resv: u16,
}

const ENTRY_SIZE: usize = std::mem::size_of::<BufRingEntry>();

/// Page-aligned mapping holding the entry array shared with the kernel.
struct RingMapping {
    base: *mut u8,
    len: usize,
}

impl RingMapping {
    fn new(entries: u16) -> io::Result<Self> {
        let len = entries as usize * ENTRY_SIZE;
        let base = unsafe {
            libc::mmap(
                ptr::null_mut(),
                len,
                libc::PROT_READ | libc::PROT_WRITE,
                libc::MAP_ANONYMOUS | libc::MAP_SHARED,
                -1,
                0,
            )
        };
        if base == libc::MAP_FAILED {
            return Err(io::Error::last_os_error());
        }
        Ok(RingMapping {
            base: base as *mut u8,
            len,
        })
    }

    fn entry(&self, ring_idx: usize) -> *mut BufRingEntry {
        debug_assert!(ring_idx * ENTRY_SIZE < self.len);
        unsafe { self.base.add(ring_idx * ENTRY_SIZE).cast() }
    }

    /// The shared tail. `struct io_uring_buf_ring` overlays its header
    /// with bufs[0]; the tail sits where bufs[0].resv would be, byte
    /// offset 14.
    fn tail(&self) -> *const AtomicU16 {
        unsafe { self.base.add(14).cast() }
    }
}

impl Drop for RingMapping {
    fn drop(&mut self) {
        unsafe {
            libc::munmap(self.base as *mut _, self.len);
        }
    }
}

/// Kernel-shared provided buffer ring backing multishot recv.
///
/// Each recv completion names the buffer the kernel picked (via its bid);
/// after the event loop copies the bytes out it pushes the bid back so the
/// ring stays full.
pub struct ProvidedBufRing {
    mapping: RingMapping,
    /// Backing storage for every buffer in the group.
    buf_backing: Vec<u8>,
    bgid: u16,
    buf_size: u32,
    /// Producer tail: written here, read by the kernel.
    tail: u16,
    /// ring_size - 1; ring_size must be a power of two.
    mask: u16,
}

impl ProvidedBufRing {
    pub fn new(bgid: u16, ring_size: u16, buf_size: u32) -> io::Result<Self> {
        assert!(ring_size.is_power_of_two(), "ring_size must be a power of 2");

        let mut ring = ProvidedBufRing {
            mapping: RingMapping::new(ring_size)?,
            buf_backing: vec![0u8; ring_size as usize * buf_size as usize],
            bgid,
            buf_size,
            tail: 0,
            mask: ring_size - 1,
        };

        // Start full: offer every buffer, then publish the tail.
        for bid in 0..ring_size {
            ring.push_entry(bid);
        }
        ring.commit_tail();

        Ok(ring)
    }

    /// Address for `register_buf_ring()`.
    pub fn ring_addr(&self) -> u64 {
        self.mapping.base as u64
    }

    pub fn bgid(&self) -> u16 {
        self.bgid
    }

    pub fn ring_entries(&self) -> u32 {
        self.mask as u32 + 1
    }

    /// Pointer and capacity for the buffer with the given bid.
    pub fn get_buffer(&self, bid: u16) -> (*const u8, u32) {
        let offset = bid as usize * self.buf_size as usize;
        let ptr = unsafe { self.buf_backing.as_ptr().add(offset) };
        (ptr, self.buf_size)
    }

    /// Offer consumed buffers back to the kernel in one tail publish.
    pub fn replenish_batch(&mut self, bids: &[u16]) {
        if bids.is_empty() {
            return;
        }
        for &bid in bids {
            self.push_entry(bid);
        }
        self.commit_tail();
    }

    fn push_entry(&mut self, bid: u16) {
        let buf_offset = bid as usize * self.buf_size as usize;
        let buf_addr = unsafe { self.buf_backing.as_ptr().add(buf_offset) };
        let entry = self.mapping.entry((self.tail & self.mask) as usize);
        unsafe {
            ptr::write(
                entry,
                BufRingEntry {
                    addr: buf_addr as u64,
                    len: self.buf_size,
                    bid,
                    resv: 0,
                },
            );
        }
        self.tail = self.tail.wrapping_add(1);
    }

    fn commit_tail(&self) {
        unsafe {
            (*self.mapping.tail()).store(self.tail, atomic::Ordering::Release);
        }
    }
}

// Safety: owned and touched by exactly one worker thread.
unsafe impl Send for ProvidedBufRing {}
