// src/lib.rs
//! Caching, keep-alive-aware HTTP/1.1 forward proxy.
//!
//! A single-threaded epoll reactor drives every connection through an
//! explicit state machine: read the client request, resolve the origin
//! through a worker pool, connect, forward, and either stream the
//! response back or validate and replay a cached copy. Timeouts tick on
//! a timer descriptor, resolver results arrive through a counting
//! eventfd, and SIGINT lands on a signalfd that stops the loop.

pub mod cache;
pub mod conn;
pub mod error;
pub mod http;
pub mod logging;
pub mod lru;
pub mod message;
pub mod reactor;
pub mod registry;
pub mod resolver;
pub mod server;
pub mod syscalls;

// Re-exports for users
pub use error::{ProxyError, Result};
pub use logging::init_logging;
pub use server::ProxyServer;
