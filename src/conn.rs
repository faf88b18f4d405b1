// src/conn.rs
use std::collections::VecDeque;
use std::net::Ipv4Addr;
use std::os::fd::RawFd;

use crate::cache::CachedResponse;
use crate::http::{RequestLine, StatusLine};
use crate::message::Message;

pub type ConnId = u64;

/// Routing token stored with every registration; events are delivered by
/// descriptor number and re-looked-up here, so nothing dangles when a
/// sibling handler removes an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Token {
    Listener,
    Timer,
    Notifier,
    Signal,
    Client(ConnId),
    Server(ConnId),
}

/// Protocol phase of one client/server pairing. Each readiness event
/// consults the state and decides the transition.
#[derive(Debug)]
pub enum ConnState {
    /// Client accepted, nothing received yet.
    Accepted,
    /// Parsing the client's request header and body.
    ReadingRequest,
    /// The resolver holds work for this client.
    Resolving { host: String },
    /// Outbound connect in flight; remaining candidate addresses kept
    /// for retry after a refused or unreachable attempt.
    Connecting {
        ips: VecDeque<Ipv4Addr>,
        port: u16,
    },
    /// Writing the client's request to the origin.
    SendingRequest,
    /// Streaming the origin's response, interleaved with client writes.
    ReadingResponse,
    /// Writing a conditional request for a cached entry.
    SendingValidation {
        probe: Message<RequestLine>,
        cached: CachedResponse,
    },
    /// Reading the origin's verdict on the conditional request.
    ReadingValidation { cached: CachedResponse },
    /// Draining the response (fresh or cached) to the client.
    SendingResponse { close_after: bool },
    /// Waiting for the client's next request; origin parked if present.
    KeepAlive,
}

/// A client connection and, once established, its origin pairing. The
/// descriptors themselves live in the registry; the connection only keys
/// them. Created at accept with the client side alone, destroyed when
/// either side fails, disconnects with nothing left to read, or expires.
#[derive(Debug)]
pub struct Connection {
    pub id: ConnId,
    pub client: RawFd,
    pub server: Option<RawFd>,
    /// Host the attached origin socket is connected to.
    pub host: Option<String>,
    pub state: ConnState,
    pub request: Message<RequestLine>,
    pub response: Message<StatusLine>,
}

impl Connection {
    pub fn new(id: ConnId, client: RawFd) -> Self {
        Self {
            id,
            client,
            server: None,
            host: None,
            state: ConnState::Accepted,
            request: Message::new(),
            response: Message::new(),
        }
    }

    /// Fresh buffers for the next request/response exchange.
    pub fn reset_exchange(&mut self) {
        self.request = Message::new();
        self.response = Message::new();
    }
}
