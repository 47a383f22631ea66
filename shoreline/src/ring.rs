use std::io;
use std::os::fd::RawFd;

use io_uring::types::{Fd, Fixed};
use io_uring::{opcode, squeue, IoUring};

use crate::buffer::ProvidedBufRing;
use crate::completion::{OpTag, UserData};
use crate::config::Config;

/// Thin wrapper over `IoUring` with typed SQE submission helpers.
///
/// Every helper encodes a [`UserData`] so the completion dispatcher can
/// route the CQE back to the owning connection or timer slot.
pub struct Ring {
    pub(crate) ring: IoUring,
    /// Buffer group for multishot recv.
    bgid: u16,
}

impl Ring {
    pub fn setup(config: &Config) -> io::Result<Self> {
        // CQ sized well above SQ: multishot recv can produce many CQEs per
        // armed SQE.
        let cq_entries = config
            .sq_entries
            .checked_mul(4)
            .unwrap_or(config.sq_entries);

        let mut builder = IoUring::builder();
        builder.setup_cqsize(cq_entries);
        builder.setup_coop_taskrun();
        builder.setup_single_issuer();
        builder.setup_defer_taskrun();

        let ring = builder.build(config.sq_entries)?;

        Ok(Ring {
            ring,
            bgid: config.recv_buffer.bgid,
        })
    }

    /// Register a sparse fixed file table; connection slots index into it.
    pub fn register_files_sparse(&self, count: u32) -> io::Result<()> {
        self.ring.submitter().register_files_sparse(count)?;
        Ok(())
    }

    /// Install fds into the fixed file table at the given offset.
    pub fn register_files_update(&self, offset: u32, fds: &[RawFd]) -> io::Result<()> {
        self.ring.submitter().register_files_update(offset, fds)?;
        Ok(())
    }

    pub fn register_buf_ring(&self, provided: &ProvidedBufRing) -> io::Result<()> {
        // Safety: the mmap'd ring outlives the registration.
        unsafe {
            self.ring.submitter().register_buf_ring_with_flags(
                provided.ring_addr(),
                provided.ring_entries() as u16,
                provided.bgid(),
                0,
            )?;
        }
        Ok(())
    }

    /// Arm a multishot recv with the provided buffer ring.
    pub fn submit_multishot_recv(&mut self, conn_index: u32) -> io::Result<()> {
        let ud = UserData::encode(OpTag::RecvMulti, conn_index, 0);
        let entry = opcode::RecvMulti::new(Fixed(conn_index), self.bgid)
            .build()
            .user_data(ud.raw());
        unsafe { self.push_sqe(entry) }
    }

    /// Send from a pool slot; the slot index rides in the payload so the
    /// completion handler can release or resubmit it.
    pub fn submit_send_copied(
        &mut self,
        conn_index: u32,
        ptr: *const u8,
        len: u32,
        pool_slot: u16,
    ) -> io::Result<()> {
        let ud = UserData::encode(OpTag::Send, conn_index, pool_slot as u32);
        let entry = opcode::Send::new(Fixed(conn_index), ptr, len)
            .build()
            .user_data(ud.raw());
        unsafe { self.push_sqe(entry) }
    }

    /// TLS-internal send (handshake records, alerts). Tagged `TlsSend` so
    /// completion releases the slot without waking any task.
    pub fn submit_tls_send(
        &mut self,
        conn_index: u32,
        ptr: *const u8,
        len: u32,
        pool_slot: u16,
    ) -> io::Result<()> {
        let ud = UserData::encode(OpTag::TlsSend, conn_index, pool_slot as u32);
        let entry = opcode::Send::new(Fixed(conn_index), ptr, len)
            .build()
            .user_data(ud.raw());
        unsafe { self.push_sqe(entry) }
    }

    /// TLS send with `IO_LINK`, so a Close SQE pushed right after it only
    /// runs once the close_notify bytes are out.
    pub fn submit_tls_send_linked(
        &mut self,
        conn_index: u32,
        ptr: *const u8,
        len: u32,
        pool_slot: u16,
    ) -> io::Result<()> {
        let ud = UserData::encode(OpTag::TlsSend, conn_index, pool_slot as u32);
        let entry = opcode::Send::new(Fixed(conn_index), ptr, len)
            .build()
            .user_data(ud.raw())
            .flags(squeue::Flags::IO_LINK);
        unsafe { self.push_sqe(entry) }
    }

    /// 8-byte read on the worker's wakeup eventfd.
    pub fn submit_eventfd_read(&mut self, eventfd: RawFd, buf: *mut u8) -> io::Result<()> {
        let ud = UserData::encode(OpTag::EventFdRead, 0, 0);
        let entry = opcode::Read::new(Fd(eventfd), buf, 8)
            .build()
            .user_data(ud.raw());
        unsafe { self.push_sqe(entry) }
    }

    pub fn submit_close(&mut self, conn_index: u32) -> io::Result<()> {
        let ud = UserData::encode(OpTag::Close, conn_index, 0);
        let entry = opcode::Close::new(Fixed(conn_index))
            .build()
            .user_data(ud.raw());
        unsafe { self.push_sqe(entry) }
    }

    pub fn submit_connect(
        &mut self,
        conn_index: u32,
        addr: *const libc::sockaddr,
        addrlen: libc::socklen_t,
    ) -> io::Result<()> {
        let ud = UserData::encode(OpTag::Connect, conn_index, 0);
        let entry = opcode::Connect::new(Fixed(conn_index), addr, addrlen)
            .build()
            .user_data(ud.raw());
        unsafe { self.push_sqe(entry) }
    }

    /// Connect with `IO_LINK` set so a LinkTimeout SQE pushed right after
    /// it bounds the handshake.
    pub fn submit_connect_linked(
        &mut self,
        conn_index: u32,
        addr: *const libc::sockaddr,
        addrlen: libc::socklen_t,
    ) -> io::Result<()> {
        let ud = UserData::encode(OpTag::Connect, conn_index, 0);
        let entry = opcode::Connect::new(Fixed(conn_index), addr, addrlen)
            .build()
            .user_data(ud.raw())
            .flags(squeue::Flags::IO_LINK);
        unsafe { self.push_sqe(entry) }
    }

    /// LinkTimeout bounding the immediately preceding linked SQE. The
    /// timespec must stay valid until the CQE lands.
    pub fn submit_link_timeout(
        &mut self,
        conn_index: u32,
        timespec: *const io_uring::types::Timespec,
    ) -> io::Result<()> {
        let ud = UserData::encode(OpTag::Timeout, conn_index, 0);
        let entry = opcode::LinkTimeout::new(timespec)
            .build()
            .user_data(ud.raw());
        unsafe { self.push_sqe(entry) }
    }

    /// Relative timeout. The timespec must stay valid until the CQE lands.
    pub fn submit_timeout(
        &mut self,
        timespec: *const io_uring::types::Timespec,
        user_data: UserData,
    ) -> io::Result<()> {
        let entry = opcode::Timeout::new(timespec)
            .build()
            .user_data(user_data.raw());
        unsafe { self.push_sqe(entry) }
    }

    /// Absolute `CLOCK_MONOTONIC` timeout. The timespec must stay valid
    /// until the CQE lands.
    pub fn submit_timeout_abs(
        &mut self,
        timespec: *const io_uring::types::Timespec,
        user_data: UserData,
    ) -> io::Result<()> {
        let entry = opcode::Timeout::new(timespec)
            .flags(io_uring::types::TimeoutFlags::ABS)
            .build()
            .user_data(user_data.raw());
        unsafe { self.push_sqe(entry) }
    }

    /// Cancel a previously submitted operation by its user_data.
    pub fn submit_async_cancel(&mut self, target_user_data: u64, conn_index: u32) -> io::Result<()> {
        let ud = UserData::encode(OpTag::Cancel, conn_index, 0);
        let entry = opcode::AsyncCancel::new(target_user_data)
            .build()
            .user_data(ud.raw());
        unsafe { self.push_sqe(entry) }
    }

    pub fn submit_shutdown(&mut self, conn_index: u32) -> io::Result<()> {
        let ud = UserData::encode(OpTag::Shutdown, conn_index, 0);
        let entry = opcode::Shutdown::new(Fixed(conn_index), libc::SHUT_WR)
            .build()
            .user_data(ud.raw());
        unsafe { self.push_sqe(entry) }
    }

    /// Timeout used as the loop tick; fires with -ETIME or -ECANCELED.
    pub fn submit_tick_timeout(
        &mut self,
        ts: *const io_uring::types::Timespec,
        user_data: u64,
    ) -> io::Result<()> {
        let entry = opcode::Timeout::new(ts).build().user_data(user_data);
        unsafe { self.push_sqe(entry) }
    }

    /// Submit pending SQEs and block for at least `min_complete` CQEs.
    pub fn submit_and_wait(&self, min_complete: u32) -> io::Result<()> {
        self.ring
            .submitter()
            .submit_and_wait(min_complete as usize)?;
        Ok(())
    }

    /// Submit pending SQEs without waiting.
    pub fn flush(&self) -> io::Result<()> {
        self.ring.submit()?;
        Ok(())
    }

    /// Push one SQE, submitting first if the queue is full.
    ///
    /// # Safety
    /// Memory referenced by the SQE must stay valid until its CQE arrives.
    pub(crate) unsafe fn push_sqe(&mut self, entry: squeue::Entry) -> io::Result<()> {
        unsafe {
            if self.ring.submission().push(&entry).is_err() {
                self.ring.submit()?;
                if self.ring.submission().push(&entry).is_err() {
                    crate::metrics::SQE_SUBMIT_FAILURES.increment();
                    return Err(io::Error::other("SQ still full after submit"));
                }
            }
        }
        Ok(())
    }
}
