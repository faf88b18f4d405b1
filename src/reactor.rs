// src/reactor.rs
use std::ops::BitOr;
use std::os::fd::RawFd;

use crate::error::Result;
use crate::syscalls::Epoll;

/// Readiness interest for a registered descriptor. `WAIT` keeps the
/// registration (and its timeout) alive without delivering I/O events.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interest(u32);

impl Interest {
    pub const WAIT: Interest = Interest(0);
    pub const IN: Interest = Interest(libc::EPOLLIN as u32);
    pub const OUT: Interest = Interest(libc::EPOLLOUT as u32);
    pub const RDHUP: Interest = Interest(libc::EPOLLRDHUP as u32);

    pub fn bits(self) -> u32 {
        self.0
    }
}

impl BitOr for Interest {
    type Output = Interest;

    fn bitor(self, rhs: Interest) -> Interest {
        Interest(self.0 | rhs.0)
    }
}

/// Observed readiness state delivered with an event. Hang-up and error
/// conditions are always reported, whatever the registered interest.
#[derive(Debug, Clone, Copy)]
pub struct Ready(u32);

impl Ready {
    pub fn from_bits(bits: u32) -> Self {
        Self(bits)
    }

    pub fn readable(self) -> bool {
        self.0 & libc::EPOLLIN as u32 != 0
    }

    pub fn writable(self) -> bool {
        self.0 & libc::EPOLLOUT as u32 != 0
    }

    pub fn rdhup(self) -> bool {
        self.0 & libc::EPOLLRDHUP as u32 != 0
    }

    pub fn hangup(self) -> bool {
        self.0 & libc::EPOLLHUP as u32 != 0
    }

    pub fn error(self) -> bool {
        self.0 & libc::EPOLLERR as u32 != 0
    }
}

/// Level-triggered readiness multiplexer with a cooperative stop flag.
///
/// The reactor only blocks inside `wait_into`; everything else is plain
/// bookkeeping. Events are reported as `(fd, state)` pairs and the caller
/// routes them, re-looking descriptors up by number so that entries
/// removed by an earlier event in the same batch are simply skipped.
pub struct Reactor {
    epoll: Epoll,
    buffer: Vec<libc::epoll_event>,
    stopped: bool,
}

impl Reactor {
    pub fn new(capacity: usize) -> Result<Self> {
        Ok(Self {
            epoll: Epoll::new()?,
            buffer: vec![libc::epoll_event { events: 0, u64: 0 }; capacity],
            stopped: false,
        })
    }

    pub fn register(&self, fd: RawFd, interest: Interest) -> Result<()> {
        self.epoll.add(fd, interest.bits())
    }

    pub fn update(&self, fd: RawFd, interest: Interest) -> Result<()> {
        self.epoll.modify(fd, interest.bits())
    }

    pub fn deregister(&self, fd: RawFd) -> Result<()> {
        self.epoll.delete(fd)
    }

    /// Block until events arrive and collect them into `out`.
    pub fn wait_into(&mut self, out: &mut Vec<(RawFd, Ready)>) -> Result<()> {
        out.clear();
        let count = self.epoll.wait(&mut self.buffer, -1)?;
        for event in &self.buffer[..count] {
            let fd = event.u64 as RawFd;
            let bits = event.events;
            out.push((fd, Ready::from_bits(bits)));
        }
        Ok(())
    }

    pub fn stop(&mut self) {
        self.stopped = true;
    }

    pub fn stopped(&self) -> bool {
        self.stopped
    }
}
