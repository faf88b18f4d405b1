// src/registry.rs
use std::collections::BTreeMap;
use std::os::fd::{AsRawFd, OwnedFd, RawFd};

use crate::error::Result;
use crate::reactor::{Interest, Reactor};

/// Seconds per tick of the sweep timer. Timeouts count in ticks.
pub const TICK_INTERVAL_SECS: u64 = 2;

const SHORT_TIMEOUT_TICKS: u64 = 60 / TICK_INTERVAL_SECS;
const LONG_TIMEOUT_TICKS: u64 = 600 / TICK_INTERVAL_SECS;

/// Idle timeout policy for a registered descriptor.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Timeout {
    Infinite,
    /// About a minute. Used while an outbound connect is in flight.
    Short,
    /// About ten minutes. Used for established traffic and idle clients.
    Long,
}

impl Timeout {
    fn ticks(self) -> Option<u64> {
        match self {
            Timeout::Infinite => None,
            Timeout::Short => Some(SHORT_TIMEOUT_TICKS),
            Timeout::Long => Some(LONG_TIMEOUT_TICKS),
        }
    }
}

struct Registration<T> {
    fd: OwnedFd,
    token: T,
    interest: Interest,
    timeout: Timeout,
    expires_at: Option<u64>,
}

/// Owner of every descriptor known to the reactor.
///
/// Each entry pairs an owned descriptor with its routing token, current
/// interest and timeout. Removing an entry deregisters the descriptor and
/// closes it by dropping the handle, so every descriptor is closed exactly
/// once. The periodic sweep removes entries whose expiry tick has passed.
pub struct Registry<T> {
    entries: BTreeMap<RawFd, Registration<T>>,
}

impl<T: Copy> Registry<T> {
    pub fn new() -> Self {
        Self {
            entries: BTreeMap::new(),
        }
    }

    /// Register `fd` with the reactor and take ownership of it. On failure
    /// the descriptor is closed before returning.
    pub fn insert(
        &mut self,
        reactor: &Reactor,
        fd: OwnedFd,
        interest: Interest,
        token: T,
        timeout: Timeout,
        now: u64,
    ) -> Result<RawFd> {
        let raw = fd.as_raw_fd();
        reactor.register(raw, interest)?;
        self.entries.insert(
            raw,
            Registration {
                fd,
                token,
                interest,
                timeout,
                expires_at: timeout.ticks().map(|t| now + t),
            },
        );
        Ok(raw)
    }

    /// Deregister and close. Returns false if the descriptor is unknown.
    pub fn remove(&mut self, reactor: &Reactor, fd: RawFd) -> bool {
        match self.entries.remove(&fd) {
            Some(registration) => {
                let _ = reactor.deregister(fd);
                drop(registration);
                true
            }
            None => false,
        }
    }

    pub fn token(&self, fd: RawFd) -> Option<T> {
        self.entries.get(&fd).map(|r| r.token)
    }

    pub fn contains(&self, fd: RawFd) -> bool {
        self.entries.contains_key(&fd)
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Change the interest mask, skipping the syscall when unchanged.
    pub fn set_interest(&mut self, reactor: &Reactor, fd: RawFd, interest: Interest) -> Result<()> {
        if let Some(registration) = self.entries.get_mut(&fd) {
            if registration.interest != interest {
                reactor.update(fd, interest)?;
                registration.interest = interest;
            }
        }
        Ok(())
    }

    /// Switch the timeout policy, restarting the expiry countdown.
    pub fn set_timeout(&mut self, fd: RawFd, timeout: Timeout, now: u64) {
        if let Some(registration) = self.entries.get_mut(&fd) {
            registration.timeout = timeout;
            registration.expires_at = timeout.ticks().map(|t| now + t);
        }
    }

    /// Defer expiry after activity on the descriptor.
    pub fn set_active(&mut self, fd: RawFd, now: u64) {
        if let Some(registration) = self.entries.get_mut(&fd) {
            if let Some(ticks) = registration.timeout.ticks() {
                registration.expires_at = Some(now + ticks);
            }
        }
    }

    /// Remove and close every expired entry, returning their tokens so the
    /// caller can tear down whatever they belonged to.
    pub fn sweep(&mut self, reactor: &Reactor, now: u64) -> Vec<(RawFd, T)> {
        let expired: Vec<RawFd> = self
            .entries
            .iter()
            .filter(|(_, r)| r.expires_at.is_some_and(|at| at <= now))
            .map(|(fd, _)| *fd)
            .collect();

        let mut removed = Vec::with_capacity(expired.len());
        for fd in expired {
            if let Some(registration) = self.entries.remove(&fd) {
                let _ = reactor.deregister(fd);
                removed.push((fd, registration.token));
            }
        }
        removed
    }
}
