use std::io;
use std::os::fd::RawFd;

use io_uring::types::{Fd, TimeoutFlags, Timespec};
use io_uring::{IoUring, opcode, squeue};

use crate::completion::{OpTag, UserData};
use crate::config::Config;
use crate::timer::encode_timer_payload;

/// Wrapper around IoUring providing high-level SQE submission helpers.
///
/// The reactor hosts exactly three kinds of work: the eventfd read that
/// implements the cross-thread wake, absolute-deadline timeouts for timer
/// slots, and single-shot recvmsg operations for hosted UDP sockets.
pub(crate) struct Reactor {
    ring: IoUring,
    wake_fd: RawFd,
    /// Read target for the eventfd; boxed so its address is stable while a
    /// read SQE is in flight.
    wake_buf: Box<[u8; 8]>,
    /// Timespec for the shutdown drain timeout; must outlive in-flight SQEs.
    drain_ts: Timespec,
}

impl Reactor {
    /// Create and configure the io_uring instance.
    pub(crate) fn setup(config: &Config, wake_fd: RawFd) -> Result<Self, crate::error::Error> {
        let cq_entries = config.sq_entries.saturating_mul(4);

        let mut builder = IoUring::builder();
        builder.setup_cqsize(cq_entries);
        builder.setup_coop_taskrun();
        builder.setup_single_issuer();

        let ring = builder
            .build(config.sq_entries)
            .map_err(|e| crate::error::Error::ReactorSetup(e.to_string()))?;

        Ok(Reactor {
            ring,
            wake_fd,
            wake_buf: Box::new([0u8; 8]),
            drain_ts: Timespec::new().nsec(100_000_000),
        })
    }

    /// Arm (or re-arm) the eventfd read that delivers cross-thread wakes.
    pub(crate) fn submit_wake_read(&mut self) -> io::Result<()> {
        let ud = UserData::encode(OpTag::Wake, 0, 0);
        let buf = self.wake_buf.as_mut_ptr();
        let entry = opcode::Read::new(Fd(self.wake_fd), buf, 8)
            .build()
            .user_data(ud.raw());
        unsafe { self.push_sqe(entry) }
    }

    /// Submit an absolute (CLOCK_MONOTONIC) timeout for a timer slot.
    /// The timespec must remain valid until the CQE arrives.
    pub(crate) fn submit_timer_abs(
        &mut self,
        ts: *const Timespec,
        slot: u32,
        generation: u16,
    ) -> io::Result<()> {
        let ud = UserData::encode(OpTag::Timer, 0, encode_timer_payload(slot, generation));
        let entry = opcode::Timeout::new(ts)
            .flags(TimeoutFlags::ABS)
            .build()
            .user_data(ud.raw());
        unsafe { self.push_sqe(entry) }
    }

    /// Cancel an in-flight timer SQE by its (slot, generation) identity.
    pub(crate) fn cancel_timer(&mut self, slot: u32, generation: u16) -> io::Result<()> {
        let target = UserData::encode(OpTag::Timer, 0, encode_timer_payload(slot, generation));
        let ud = UserData::encode(OpTag::Cancel, 0, 0);
        let entry = opcode::AsyncCancel::new(target.raw())
            .build()
            .user_data(ud.raw());
        unsafe { self.push_sqe(entry) }
    }

    /// Submit a single-shot recvmsg for a hosted UDP socket.
    pub(crate) fn submit_udp_recv(
        &mut self,
        fd: RawFd,
        msghdr: *mut libc::msghdr,
        token: u32,
    ) -> io::Result<()> {
        let ud = UserData::encode(OpTag::UdpRecv, token, 0);
        let entry = opcode::RecvMsg::new(Fd(fd), msghdr)
            .build()
            .user_data(ud.raw());
        unsafe { self.push_sqe(entry) }
    }

    /// Cancel the in-flight recvmsg for a hosted UDP socket.
    pub(crate) fn cancel_udp_recv(&mut self, token: u32) -> io::Result<()> {
        let target = UserData::encode(OpTag::UdpRecv, token, 0);
        let ud = UserData::encode(OpTag::Cancel, token, 0);
        let entry = opcode::AsyncCancel::new(target.raw())
            .build()
            .user_data(ud.raw());
        unsafe { self.push_sqe(entry) }
    }

    /// Submit a relative 100ms timeout used to bound shutdown draining.
    pub(crate) fn submit_drain_timeout(&mut self) -> io::Result<()> {
        let ud = UserData::encode(OpTag::DrainTimeout, 0, 0);
        let ts = &self.drain_ts as *const Timespec;
        let entry = opcode::Timeout::new(ts).build().user_data(ud.raw());
        unsafe { self.push_sqe(entry) }
    }

    /// Submit all pending SQEs and wait for at least `min_complete` CQEs.
    pub(crate) fn submit_and_wait(&self, min_complete: u32) -> io::Result<()> {
        self.ring
            .submitter()
            .submit_and_wait(min_complete as usize)?;
        Ok(())
    }

    /// Drain all available CQEs into `out` as `(user_data, result)` pairs.
    pub(crate) fn drain_cqes(&mut self, out: &mut Vec<(u64, i32)>) {
        for cqe in self.ring.completion() {
            out.push((cqe.user_data(), cqe.result()));
        }
    }

    /// Push an SQE to the submission queue.
    ///
    /// # Safety
    /// The SQE must reference valid memory for the lifetime of the operation.
    unsafe fn push_sqe(&mut self, entry: squeue::Entry) -> io::Result<()> {
        // Try to push; if SQ is full, submit first to make room.
        unsafe {
            if self.ring.submission().push(&entry).is_err() {
                self.ring.submit()?;
                if self.ring.submission().push(&entry).is_err() {
                    return Err(io::Error::other("SQ still full after submit"));
                }
            }
        }
        Ok(())
    }
}
