// src/syscalls.rs
use std::ffi::{CStr, CString};
use std::io;
use std::mem;
use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::fd::{AsRawFd, FromRawFd, OwnedFd, RawFd};
use std::ptr;

use libc::{c_int, c_void, socklen_t};

use crate::error::{ProxyError, Result};

// ---- Socket Operations ----

/// Create a non-blocking TCP listen socket bound to all interfaces.
pub fn create_listen_socket(port: u16, backlog: c_int) -> Result<OwnedFd> {
    unsafe {
        let raw = libc::socket(
            libc::AF_INET,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        );
        if raw < 0 {
            return Err(io::Error::last_os_error().into());
        }
        let fd = OwnedFd::from_raw_fd(raw);

        let one: c_int = 1;
        if libc::setsockopt(
            fd.as_raw_fd(),
            libc::SOL_SOCKET,
            libc::SO_REUSEADDR,
            &one as *const _ as *const c_void,
            mem::size_of_val(&one) as socklen_t,
        ) < 0
        {
            return Err(io::Error::last_os_error().into());
        }

        let sin = libc::sockaddr_in {
            sin_family: libc::AF_INET as libc::sa_family_t,
            sin_port: port.to_be(),
            sin_addr: libc::in_addr {
                s_addr: libc::INADDR_ANY.to_be(),
            },
            sin_zero: [0; 8],
        };
        if libc::bind(
            fd.as_raw_fd(),
            &sin as *const _ as *const libc::sockaddr,
            mem::size_of_val(&sin) as socklen_t,
        ) < 0
        {
            return Err(io::Error::last_os_error().into());
        }

        if libc::listen(fd.as_raw_fd(), backlog) < 0 {
            return Err(io::Error::last_os_error().into());
        }

        Ok(fd)
    }
}

/// Port the socket is actually bound to (relevant when bound to port 0).
pub fn local_port(fd: RawFd) -> Result<u16> {
    unsafe {
        let mut sin: libc::sockaddr_in = mem::zeroed();
        let mut len = mem::size_of::<libc::sockaddr_in>() as socklen_t;
        if libc::getsockname(fd, &mut sin as *mut _ as *mut libc::sockaddr, &mut len) < 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(u16::from_be(sin.sin_port))
    }
}

/// Accept one pending connection. `None` means the accept queue is drained.
pub fn accept_connection(listen_fd: RawFd) -> Result<Option<OwnedFd>> {
    unsafe {
        let raw = libc::accept4(
            listen_fd,
            ptr::null_mut(),
            ptr::null_mut(),
            libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
        );
        if raw < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                Ok(None)
            } else {
                Err(err.into())
            }
        } else {
            Ok(Some(OwnedFd::from_raw_fd(raw)))
        }
    }
}

/// Create a non-blocking IPv4 stream socket for an outbound connection.
pub fn create_stream_socket() -> Result<OwnedFd> {
    unsafe {
        let raw = libc::socket(
            libc::AF_INET,
            libc::SOCK_STREAM | libc::SOCK_NONBLOCK | libc::SOCK_CLOEXEC,
            0,
        );
        if raw < 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(OwnedFd::from_raw_fd(raw))
    }
}

/// Outcome of a non-blocking connect attempt. A connect that is still in
/// flight is not an error, it just needs the socket to become writable.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectProgress {
    Ready,
    InProgress,
}

pub fn connect_nonblocking(fd: RawFd, addr: SocketAddrV4) -> Result<ConnectProgress> {
    let sin = libc::sockaddr_in {
        sin_family: libc::AF_INET as libc::sa_family_t,
        sin_port: addr.port().to_be(),
        sin_addr: libc::in_addr {
            s_addr: u32::from_ne_bytes(addr.ip().octets()),
        },
        sin_zero: [0; 8],
    };
    unsafe {
        if libc::connect(
            fd,
            &sin as *const _ as *const libc::sockaddr,
            mem::size_of_val(&sin) as socklen_t,
        ) < 0
        {
            let err = io::Error::last_os_error();
            if err.raw_os_error() == Some(libc::EINPROGRESS) {
                Ok(ConnectProgress::InProgress)
            } else {
                Err(err.into())
            }
        } else {
            Ok(ConnectProgress::Ready)
        }
    }
}

/// Read and clear the socket's pending error (SO_ERROR).
pub fn take_socket_error(fd: RawFd) -> Result<c_int> {
    unsafe {
        let mut code: c_int = 0;
        let mut len = mem::size_of::<c_int>() as socklen_t;
        if libc::getsockopt(
            fd,
            libc::SOL_SOCKET,
            libc::SO_ERROR,
            &mut code as *mut _ as *mut c_void,
            &mut len,
        ) < 0
        {
            return Err(io::Error::last_os_error().into());
        }
        Ok(code)
    }
}

/// Bytes currently readable without blocking (FIONREAD).
pub fn bytes_available(fd: RawFd) -> Result<usize> {
    unsafe {
        let mut available: c_int = 0;
        if libc::ioctl(fd, libc::FIONREAD, &mut available as *mut c_int) < 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(available.max(0) as usize)
    }
}

/// Result of one non-blocking read.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IoStep {
    Data(usize),
    WouldBlock,
    /// The peer performed an orderly close.
    Closed,
}

pub fn read_fd(fd: RawFd, buf: &mut [u8]) -> Result<IoStep> {
    unsafe {
        let res = libc::read(fd, buf.as_mut_ptr() as *mut c_void, buf.len());
        if res < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                Ok(IoStep::WouldBlock)
            } else {
                Err(err.into())
            }
        } else if res == 0 {
            Ok(IoStep::Closed)
        } else {
            Ok(IoStep::Data(res as usize))
        }
    }
}

/// Non-blocking write. Returns 0 when the kernel buffer is full.
pub fn write_fd(fd: RawFd, buf: &[u8]) -> Result<usize> {
    unsafe {
        let res = libc::write(fd, buf.as_ptr() as *const c_void, buf.len());
        if res < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                Ok(0)
            } else {
                Err(err.into())
            }
        } else {
            Ok(res as usize)
        }
    }
}

// ---- Timer, Event and Signal Descriptors ----

/// Monotonic timer firing every `interval_secs`, starting one interval in.
pub fn create_timer_fd(interval_secs: u64) -> Result<OwnedFd> {
    unsafe {
        let raw = libc::timerfd_create(libc::CLOCK_MONOTONIC, libc::TFD_NONBLOCK | libc::TFD_CLOEXEC);
        if raw < 0 {
            return Err(io::Error::last_os_error().into());
        }
        let fd = OwnedFd::from_raw_fd(raw);

        let period = libc::timespec {
            tv_sec: interval_secs as libc::time_t,
            tv_nsec: 0,
        };
        let spec = libc::itimerspec {
            it_interval: period,
            it_value: period,
        };
        if libc::timerfd_settime(fd.as_raw_fd(), 0, &spec, ptr::null_mut()) < 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(fd)
    }
}

/// Number of timer expirations since the last read, 0 if none are pending.
pub fn read_timer(fd: RawFd) -> Result<u64> {
    read_counter(fd)
}

/// Counting eventfd in semaphore mode: each read consumes exactly one
/// posted event, so notifications and dequeues stay paired one to one.
pub fn create_event_fd() -> Result<OwnedFd> {
    unsafe {
        let raw = libc::eventfd(
            0,
            libc::EFD_SEMAPHORE | libc::EFD_NONBLOCK | libc::EFD_CLOEXEC,
        );
        if raw < 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(OwnedFd::from_raw_fd(raw))
    }
}

pub fn read_event(fd: RawFd) -> Result<u64> {
    read_counter(fd)
}

/// Post one event on a counting eventfd.
pub fn signal_event(fd: RawFd) -> Result<()> {
    let value: u64 = 1;
    unsafe {
        if libc::write(
            fd,
            &value as *const u64 as *const c_void,
            mem::size_of::<u64>(),
        ) < 0
        {
            return Err(io::Error::last_os_error().into());
        }
    }
    Ok(())
}

fn read_counter(fd: RawFd) -> Result<u64> {
    unsafe {
        let mut value: u64 = 0;
        let res = libc::read(
            fd,
            &mut value as *mut u64 as *mut c_void,
            mem::size_of::<u64>(),
        );
        if res < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(0);
            }
            return Err(err.into());
        }
        Ok(value)
    }
}

/// Duplicate a descriptor, producing an independently owned handle.
pub fn dup_fd(fd: RawFd) -> Result<OwnedFd> {
    unsafe {
        let raw = libc::fcntl(fd, libc::F_DUPFD_CLOEXEC, 0);
        if raw < 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(OwnedFd::from_raw_fd(raw))
    }
}

/// Block the given signals for the whole process. Must run before any
/// thread is spawned so every later thread inherits the mask.
pub fn block_signals(signals: &[c_int]) -> Result<()> {
    unsafe {
        let mut set: libc::sigset_t = mem::zeroed();
        libc::sigemptyset(&mut set);
        for &signo in signals {
            libc::sigaddset(&mut set, signo);
        }
        let rc = libc::pthread_sigmask(libc::SIG_BLOCK, &set, ptr::null_mut());
        if rc != 0 {
            return Err(io::Error::from_raw_os_error(rc).into());
        }
    }
    Ok(())
}

/// Descriptor that delivers the given (blocked) signals as readable events.
pub fn create_signal_fd(signals: &[c_int]) -> Result<OwnedFd> {
    unsafe {
        let mut set: libc::sigset_t = mem::zeroed();
        libc::sigemptyset(&mut set);
        for &signo in signals {
            libc::sigaddset(&mut set, signo);
        }
        let raw = libc::signalfd(-1, &set, libc::SFD_NONBLOCK | libc::SFD_CLOEXEC);
        if raw < 0 {
            return Err(io::Error::last_os_error().into());
        }
        Ok(OwnedFd::from_raw_fd(raw))
    }
}

/// Dequeue one pending signal, `None` if the queue is empty.
pub fn read_signal(fd: RawFd) -> Result<Option<c_int>> {
    unsafe {
        let mut info: libc::signalfd_siginfo = mem::zeroed();
        let size = mem::size_of::<libc::signalfd_siginfo>();
        let res = libc::read(fd, &mut info as *mut _ as *mut c_void, size);
        if res < 0 {
            let err = io::Error::last_os_error();
            if err.kind() == io::ErrorKind::WouldBlock {
                return Ok(None);
            }
            return Err(err.into());
        }
        if res as usize != size {
            return Ok(None);
        }
        Ok(Some(info.ssi_signo as c_int))
    }
}

// ---- Name Resolution ----

/// Blocking IPv4 resolution with stream-socket hints. Every address the
/// resolver returns is collected, in answer order.
pub fn resolve_ipv4(host: &str, port: u16) -> Result<Vec<Ipv4Addr>> {
    let c_host = CString::new(host)
        .map_err(|_| ProxyError::Resolver(format!("host contains NUL: {host:?}")))?;
    let c_port = CString::new(port.to_string())
        .map_err(|_| ProxyError::Resolver("invalid port".to_string()))?;

    unsafe {
        let mut hints: libc::addrinfo = mem::zeroed();
        hints.ai_family = libc::AF_INET;
        hints.ai_socktype = libc::SOCK_STREAM;

        let mut list: *mut libc::addrinfo = ptr::null_mut();
        let rc = libc::getaddrinfo(c_host.as_ptr(), c_port.as_ptr(), &hints, &mut list);
        if rc != 0 {
            let reason = CStr::from_ptr(libc::gai_strerror(rc))
                .to_string_lossy()
                .into_owned();
            return Err(ProxyError::Resolver(format!("{host}: {reason}")));
        }

        let mut ips = Vec::new();
        let mut cursor = list;
        while !cursor.is_null() {
            let entry = &*cursor;
            if entry.ai_family == libc::AF_INET && !entry.ai_addr.is_null() {
                let sin = &*(entry.ai_addr as *const libc::sockaddr_in);
                ips.push(Ipv4Addr::from(sin.sin_addr.s_addr.to_ne_bytes()));
            }
            cursor = entry.ai_next;
        }
        libc::freeaddrinfo(list);
        Ok(ips)
    }
}

// ---- Epoll ----

pub struct Epoll {
    fd: OwnedFd,
}

impl Epoll {
    pub fn new() -> Result<Self> {
        unsafe {
            let raw = libc::epoll_create1(libc::EPOLL_CLOEXEC);
            if raw < 0 {
                return Err(io::Error::last_os_error().into());
            }
            Ok(Self {
                fd: OwnedFd::from_raw_fd(raw),
            })
        }
    }

    pub fn add(&self, fd: RawFd, events: u32) -> Result<()> {
        self.ctl(libc::EPOLL_CTL_ADD, fd, events)
    }

    pub fn modify(&self, fd: RawFd, events: u32) -> Result<()> {
        self.ctl(libc::EPOLL_CTL_MOD, fd, events)
    }

    pub fn delete(&self, fd: RawFd) -> Result<()> {
        unsafe {
            if libc::epoll_ctl(self.fd.as_raw_fd(), libc::EPOLL_CTL_DEL, fd, ptr::null_mut()) < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() != Some(libc::ENOENT) {
                    return Err(err.into());
                }
            }
        }
        Ok(())
    }

    /// Block for ready events. Interruption by a signal yields 0 events.
    pub fn wait(&self, events: &mut [libc::epoll_event], timeout_ms: c_int) -> Result<usize> {
        unsafe {
            let res = libc::epoll_wait(
                self.fd.as_raw_fd(),
                events.as_mut_ptr(),
                events.len() as c_int,
                timeout_ms,
            );
            if res < 0 {
                let err = io::Error::last_os_error();
                if err.raw_os_error() == Some(libc::EINTR) {
                    return Ok(0);
                }
                return Err(err.into());
            }
            Ok(res as usize)
        }
    }

    fn ctl(&self, op: c_int, fd: RawFd, events: u32) -> Result<()> {
        let mut event = libc::epoll_event {
            events,
            u64: fd as u64,
        };
        unsafe {
            if libc::epoll_ctl(self.fd.as_raw_fd(), op, fd, &mut event) < 0 {
                return Err(io::Error::last_os_error().into());
            }
        }
        Ok(())
    }
}
