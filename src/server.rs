// src/server.rs
use std::collections::{HashMap, VecDeque};
use std::net::{Ipv4Addr, SocketAddrV4};
use std::os::fd::{AsRawFd, RawFd};

use tracing::{debug, error, info, warn};

use crate::cache::{self, CachedResponse, ResponseCache};
use crate::conn::{ConnId, ConnState, Connection, Token};
use crate::error::Result;
use crate::http::{HttpHeader, RequestHeader, ResponseHeader};
use crate::message::{Message, ReadProgress};
use crate::reactor::{Interest, Reactor, Ready};
use crate::registry::{Registry, Timeout, TICK_INTERVAL_SECS};
use crate::resolver::Resolver;
use crate::syscalls;

const LISTEN_BACKLOG: libc::c_int = 200;
const EVENT_CAPACITY: usize = 256;

/// Metadata carried through the resolver and back: enough to locate the
/// pending resolution when the result arrives.
#[derive(Debug, Clone)]
struct ResolveTag {
    client: RawFd,
    host: String,
}

/// Coarse view of a connection's state, cheap to copy out so event
/// routing does not hold borrows into the connection table.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    Missing,
    Accepted,
    ReadingRequest,
    Resolving,
    Connecting,
    SendingRequest,
    ReadingResponse,
    SendingValidation,
    ReadingValidation,
    SendingResponse,
    KeepAlive,
}

/// The proxy supervisor: owns the reactor, the registration table, the
/// connection set, the pending-resolution set, the response cache and the
/// resolver pool, and drives every connection through its lifecycle from
/// reactor events. All mutation happens on the reactor thread.
pub struct ProxyServer {
    reactor: Reactor,
    registry: Registry<Token>,
    connections: HashMap<ConnId, Connection>,
    pending: HashMap<(RawFd, String), ConnId>,
    cache: ResponseCache,
    resolver: Resolver<ResolveTag>,
    next_id: ConnId,
    ticks: u64,
    listener: RawFd,
    timer: RawFd,
    notifier: RawFd,
    signal: RawFd,
    port: u16,
}

impl ProxyServer {
    pub fn new(port: u16) -> Result<Self> {
        // The mask must be in place before any thread exists; resolver
        // workers inherit it and never observe SIGINT.
        syscalls::block_signals(&[libc::SIGINT, libc::SIGPIPE])?;

        let reactor = Reactor::new(EVENT_CAPACITY)?;
        let mut registry = Registry::new();

        let listener_fd = syscalls::create_listen_socket(port, LISTEN_BACKLOG)?;
        let bound_port = syscalls::local_port(listener_fd.as_raw_fd())?;
        let timer_fd = syscalls::create_timer_fd(TICK_INTERVAL_SECS)?;
        let notifier_fd = syscalls::create_event_fd()?;
        let notifier_writer = syscalls::dup_fd(notifier_fd.as_raw_fd())?;
        let signal_fd = syscalls::create_signal_fd(&[libc::SIGINT, libc::SIGPIPE])?;

        let listener = registry.insert(
            &reactor,
            listener_fd,
            Interest::IN,
            Token::Listener,
            Timeout::Infinite,
            0,
        )?;
        let timer = registry.insert(
            &reactor,
            timer_fd,
            Interest::IN,
            Token::Timer,
            Timeout::Infinite,
            0,
        )?;
        let notifier = registry.insert(
            &reactor,
            notifier_fd,
            Interest::IN,
            Token::Notifier,
            Timeout::Infinite,
            0,
        )?;
        let signal = registry.insert(
            &reactor,
            signal_fd,
            Interest::IN,
            Token::Signal,
            Timeout::Infinite,
            0,
        )?;

        let resolver = Resolver::new(notifier_writer)?;

        Ok(Self {
            reactor,
            registry,
            connections: HashMap::new(),
            pending: HashMap::new(),
            cache: ResponseCache::new(),
            resolver,
            next_id: 0,
            ticks: 0,
            listener,
            timer,
            notifier,
            signal,
            port: bound_port,
        })
    }

    /// Port the listener is bound to.
    pub fn port(&self) -> u16 {
        self.port
    }

    /// Run the event loop until SIGINT flips the stop flag. Only
    /// unexpected multiplexer failures propagate out of here.
    pub fn run(&mut self) -> Result<()> {
        info!(port = self.port, "proxy started");
        let mut events: Vec<(RawFd, Ready)> = Vec::with_capacity(EVENT_CAPACITY);

        while !self.reactor.stopped() {
            self.reactor.wait_into(&mut events)?;
            for index in 0..events.len() {
                if self.reactor.stopped() {
                    break;
                }
                let (fd, ready) = events[index];
                self.dispatch(fd, ready);
            }
        }

        info!("proxy stopped");
        Ok(())
    }

    // Events carry only descriptor numbers; unknown numbers belong to
    // entries a sibling handler already removed and are skipped.
    fn dispatch(&mut self, fd: RawFd, ready: Ready) {
        let Some(token) = self.registry.token(fd) else {
            return;
        };
        match token {
            Token::Listener => self.on_listener(),
            Token::Timer => self.on_timer(),
            Token::Notifier => self.on_notifier(ready),
            Token::Signal => self.on_signal(),
            Token::Client(id) => self.on_client(id, fd, ready),
            Token::Server(id) => self.on_server(id, fd, ready),
        }
    }

    fn phase(&self, id: ConnId) -> Phase {
        match self.connections.get(&id).map(|c| &c.state) {
            None => Phase::Missing,
            Some(ConnState::Accepted) => Phase::Accepted,
            Some(ConnState::ReadingRequest) => Phase::ReadingRequest,
            Some(ConnState::Resolving { .. }) => Phase::Resolving,
            Some(ConnState::Connecting { .. }) => Phase::Connecting,
            Some(ConnState::SendingRequest) => Phase::SendingRequest,
            Some(ConnState::ReadingResponse) => Phase::ReadingResponse,
            Some(ConnState::SendingValidation { .. }) => Phase::SendingValidation,
            Some(ConnState::ReadingValidation { .. }) => Phase::ReadingValidation,
            Some(ConnState::SendingResponse { .. }) => Phase::SendingResponse,
            Some(ConnState::KeepAlive) => Phase::KeepAlive,
        }
    }

    // ---- Supervisor descriptors ----

    fn on_listener(&mut self) {
        loop {
            match syscalls::accept_connection(self.listener) {
                Ok(Some(client)) => {
                    let id = self.next_id;
                    self.next_id += 1;
                    match self.registry.insert(
                        &self.reactor,
                        client,
                        Interest::IN | Interest::RDHUP,
                        Token::Client(id),
                        Timeout::Long,
                        self.ticks,
                    ) {
                        Ok(fd) => {
                            self.connections.insert(id, Connection::new(id, fd));
                            debug!(fd, "new client accepted");
                        }
                        Err(e) => warn!(error = %e, "failed to register accepted client"),
                    }
                }
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "accept failed");
                    break;
                }
            }
        }
    }

    fn on_timer(&mut self) {
        let elapsed = match syscalls::read_timer(self.timer) {
            Ok(elapsed) => elapsed,
            Err(e) => {
                warn!(error = %e, "failed to read tick timer");
                return;
            }
        };
        if elapsed == 0 {
            return;
        }
        self.ticks += elapsed;

        for (fd, token) in self.registry.sweep(&self.reactor, self.ticks) {
            match token {
                Token::Client(id) | Token::Server(id) => {
                    info!(fd, "closed due timeout");
                    self.close_connection(id);
                }
                _ => warn!(fd, "internal descriptor expired"),
            }
        }
    }

    fn on_signal(&mut self) {
        loop {
            match syscalls::read_signal(self.signal) {
                Ok(Some(libc::SIGINT)) => {
                    info!("interrupt received, shutting down");
                    self.reactor.stop();
                }
                // SIGPIPE is drained here so broken writes stay EPIPE.
                Ok(Some(_)) => {}
                Ok(None) => break,
                Err(e) => {
                    warn!(error = %e, "failed to read signal descriptor");
                    break;
                }
            }
        }
    }

    // One dequeue per notification: the notifier is a semaphore, so
    // every event corresponds to exactly one resolver result.
    fn on_notifier(&mut self, ready: Ready) {
        if !ready.readable() {
            return;
        }
        match syscalls::read_event(self.notifier) {
            Ok(0) => return,
            Ok(_) => {}
            Err(e) => {
                warn!(error = %e, "failed to read resolver notifier");
                return;
            }
        }
        let Some(resolved) = self.resolver.take() else {
            warn!("notifier fired without a resolver result");
            return;
        };

        let (ips, port, tag) = resolved.into_parts();
        let key = (tag.client, tag.host);
        let Some(id) = self.pending.remove(&key) else {
            debug!(client = key.0, host = %key.1, "client went away during resolution");
            return;
        };
        if !self.connections.contains_key(&id) {
            return;
        }
        if ips.is_empty() {
            debug!(host = %key.1, "no relevant ip for origin");
            self.close_connection(id);
            return;
        }

        debug!(host = %key.1, candidates = ips.len(), "origin resolved");
        if let Some(conn) = self.connections.get_mut(&id) {
            conn.host = Some(key.1);
        }
        self.start_connect(id, ips, port);
    }

    // ---- Client side ----

    fn on_client(&mut self, id: ConnId, fd: RawFd, ready: Ready) {
        self.registry.set_active(fd, self.ticks);

        if ready.error() || ready.hangup() {
            self.fail_socket(id, fd, "client");
            return;
        }

        if ready.rdhup() {
            let reading = matches!(
                self.phase(id),
                Phase::Accepted | Phase::ReadingRequest | Phase::KeepAlive
            );
            if !reading || syscalls::bytes_available(fd).unwrap_or(0) == 0 {
                debug!(fd, "client dropped connection");
                self.close_connection(id);
                return;
            }
        }

        if ready.readable() {
            self.client_read(id, fd);
        }
        if ready.writable() {
            self.client_write(id, fd);
        }
    }

    fn client_read(&mut self, id: ConnId, fd: RawFd) {
        {
            let Some(conn) = self.connections.get_mut(&id) else {
                return;
            };
            match conn.state {
                ConnState::Accepted => {
                    conn.state = ConnState::ReadingRequest;
                    self.registry.set_timeout(fd, Timeout::Long, self.ticks);
                }
                ConnState::KeepAlive => {
                    debug!(fd, "next request on kept-alive client");
                    conn.reset_exchange();
                    conn.state = ConnState::ReadingRequest;
                }
                ConnState::ReadingRequest => {}
                _ => return,
            }
        }

        let progress = match self.connections.get_mut(&id) {
            Some(conn) => conn.request.read_from(fd),
            None => return,
        };
        match progress {
            Err(e) => {
                info!(fd, error = %e, "failed to read client request");
                self.close_connection(id);
            }
            Ok(ReadProgress::PeerClosed) => {
                debug!(fd, "client disconnected");
                self.close_connection(id);
            }
            Ok(ReadProgress::WouldBlock) => {}
            Ok(ReadProgress::Advanced) => {
                let done = self
                    .connections
                    .get(&id)
                    .map(|c| c.request.is_read())
                    .unwrap_or(false);
                if done {
                    self.on_request_complete(id);
                }
            }
        }
    }

    fn client_write(&mut self, id: ConnId, fd: RawFd) {
        match self.phase(id) {
            // Fast transfer: drain whatever response bytes exist, then go
            // quiet until the origin produces more.
            Phase::ReadingResponse => {
                let outcome = match self.connections.get_mut(&id) {
                    Some(conn) => conn.response.write_to(fd),
                    None => return,
                };
                if let Err(e) = outcome {
                    info!(fd, error = %e, "failed to stream response to client");
                    self.close_connection(id);
                    return;
                }
                let drained = self
                    .connections
                    .get(&id)
                    .map(|c| !c.response.can_write())
                    .unwrap_or(true);
                if drained {
                    self.update_interest(fd, Interest::RDHUP);
                }
            }
            Phase::SendingResponse => {
                let outcome = match self.connections.get_mut(&id) {
                    Some(conn) => conn.response.write_to(fd).map(|_| conn.response.is_written()),
                    None => return,
                };
                match outcome {
                    Err(e) => {
                        info!(fd, error = %e, "failed to finish response to client");
                        self.close_connection(id);
                    }
                    Ok(false) => {}
                    Ok(true) => self.response_delivered(id),
                }
            }
            _ => {}
        }
    }

    fn on_request_complete(&mut self, id: ConnId) {
        let (host, same_origin) = {
            let Some(conn) = self.connections.get(&id) else {
                return;
            };
            let Some(header) = conn.request.header() else {
                return;
            };
            let host = header.get("Host").unwrap_or("").to_string();
            let same = conn.server.is_some() && conn.host.as_deref() == Some(host.as_str());
            (host, same)
        };

        if same_origin {
            debug!(host = %host, "origin connection reused");
            self.dispatch_request(id);
            return;
        }

        let parked = self.connections.get_mut(&id).and_then(|c| c.server.take());
        if let Some(server_fd) = parked {
            debug!(server_fd, host = %host, "host switch, closing previous origin");
            self.registry.remove(&self.reactor, server_fd);
            if let Some(conn) = self.connections.get_mut(&id) {
                conn.host = None;
            }
        }
        self.start_resolve(id, host);
    }

    fn start_resolve(&mut self, id: ConnId, host: String) {
        let client_fd = {
            let Some(conn) = self.connections.get_mut(&id) else {
                return;
            };
            conn.state = ConnState::Resolving { host: host.clone() };
            conn.client
        };
        // While resolving, the client is only watched for hang-up; if it
        // leaves, the pending entry is removed and the eventual result
        // is discarded at the notifier.
        self.update_interest(client_fd, Interest::RDHUP);
        self.pending.insert((client_fd, host.clone()), id);
        debug!(client_fd, host = %host, "resolving origin");
        self.resolver.submit(
            host.clone(),
            ResolveTag {
                client: client_fd,
                host,
            },
        );
    }

    // ---- Origin side ----

    fn start_connect(&mut self, id: ConnId, ips: VecDeque<Ipv4Addr>, port: u16) {
        let Some(&ip) = ips.front() else {
            self.close_connection(id);
            return;
        };
        let socket = match syscalls::create_stream_socket() {
            Ok(socket) => socket,
            Err(e) => {
                warn!(error = %e, "failed to create origin socket");
                self.close_connection(id);
                return;
            }
        };
        // EINPROGRESS and immediate success both end up waiting for the
        // socket to report writable.
        if let Err(e) = syscalls::connect_nonblocking(socket.as_raw_fd(), SocketAddrV4::new(ip, port))
        {
            debug!(ip = %ip, error = %e, "connect failed");
            self.close_connection(id);
            return;
        }

        match self.registry.insert(
            &self.reactor,
            socket,
            Interest::OUT | Interest::RDHUP,
            Token::Server(id),
            Timeout::Short,
            self.ticks,
        ) {
            Ok(server_fd) => {
                if let Some(conn) = self.connections.get_mut(&id) {
                    conn.server = Some(server_fd);
                    conn.state = ConnState::Connecting { ips, port };
                }
                debug!(server_fd, ip = %ip, port, "connecting to origin");
            }
            Err(e) => {
                warn!(error = %e, "failed to register origin socket");
                self.close_connection(id);
            }
        }
    }

    fn on_server(&mut self, id: ConnId, fd: RawFd, ready: Ready) {
        self.registry.set_active(fd, self.ticks);

        if self.phase(id) == Phase::Connecting {
            self.server_connect_event(id, fd, ready);
            return;
        }

        if ready.error() || ready.hangup() {
            self.fail_socket(id, fd, "server");
            return;
        }

        if ready.rdhup() {
            match self.phase(id) {
                Phase::KeepAlive => {
                    // Rare: an origin that kept the connection alive drops
                    // it while idle. The next request starts cold.
                    debug!(fd, "idle origin dropped connection");
                    self.detach_server(id, fd);
                    return;
                }
                Phase::ReadingResponse | Phase::ReadingValidation => {
                    if syscalls::bytes_available(fd).unwrap_or(0) == 0 {
                        debug!(fd, "origin dropped connection");
                        self.close_connection(id);
                        return;
                    }
                }
                Phase::Missing => return,
                _ => {
                    debug!(fd, "origin dropped connection");
                    self.close_connection(id);
                    return;
                }
            }
        }

        if ready.writable() {
            match self.phase(id) {
                Phase::SendingRequest => self.server_send_request(id, fd),
                Phase::SendingValidation => self.server_send_validation(id, fd),
                _ => {}
            }
        }
        if ready.readable() {
            match self.phase(id) {
                Phase::ReadingResponse => self.server_read_response(id, fd),
                Phase::ReadingValidation => self.server_read_validation(id, fd),
                _ => {}
            }
        }
    }

    fn server_connect_event(&mut self, id: ConnId, fd: RawFd, ready: Ready) {
        if ready.error() || ready.hangup() {
            let code = syscalls::take_socket_error(fd).unwrap_or(0);
            match code {
                libc::ECONNREFUSED | libc::ENETUNREACH | 0 => self.retry_next_ip(id, fd),
                libc::EPIPE => {
                    info!(fd, "origin connection broke during connect");
                    self.close_connection(id);
                }
                _ => {
                    error!(fd, code, "unexpected connect error");
                    self.close_connection(id);
                }
            }
            return;
        }
        if ready.rdhup() {
            debug!(fd, "origin dropped connection during connect");
            self.close_connection(id);
            return;
        }
        if ready.writable() {
            debug!(fd, "origin connection established");
            self.registry.set_timeout(fd, Timeout::Long, self.ticks);
            self.dispatch_request(id);
        }
    }

    // A refused or unreachable address is popped and the next candidate
    // tried on a fresh socket; the failed one is replaced wholesale.
    fn retry_next_ip(&mut self, id: ConnId, failed_fd: RawFd) {
        let next = {
            let Some(conn) = self.connections.get_mut(&id) else {
                return;
            };
            let ConnState::Connecting { ips, port } = &mut conn.state else {
                return;
            };
            ips.pop_front();
            if ips.is_empty() {
                None
            } else {
                Some((ips.clone(), *port))
            }
        };

        self.registry.remove(&self.reactor, failed_fd);
        if let Some(conn) = self.connections.get_mut(&id) {
            conn.server = None;
        }

        match next {
            Some((ips, port)) => {
                debug!(failed_fd, "address not reachable, trying next");
                self.start_connect(id, ips, port);
            }
            None => {
                debug!(failed_fd, "no relevant ip left for origin");
                self.close_connection(id);
            }
        }
    }

    /// Origin connected and ready: forward the request, or validate the
    /// cached entry first when one exists for a GET.
    fn dispatch_request(&mut self, id: ConnId) {
        let (client_fd, server_fd, cached) = {
            let Some(conn) = self.connections.get(&id) else {
                return;
            };
            let Some(server_fd) = conn.server else {
                return;
            };
            let Some(header) = conn.request.header() else {
                return;
            };
            let cached = if header.start.is_get() {
                self.cache.lookup(&request_url(header))
            } else {
                None
            };
            (conn.client, server_fd, cached)
        };

        self.registry.set_active(server_fd, self.ticks);

        match cached {
            Some(cached) => {
                debug!(server_fd, "cached entry found, validating with origin");
                let probe = {
                    let Some(conn) = self.connections.get(&id) else {
                        return;
                    };
                    let Some(header) = conn.request.header() else {
                        return;
                    };
                    Message::from_header(validation_request(header, &cached.header), b"")
                };
                if let Some(conn) = self.connections.get_mut(&id) {
                    conn.state = ConnState::SendingValidation { probe, cached };
                }
            }
            None => {
                if let Some(conn) = self.connections.get_mut(&id) {
                    conn.state = ConnState::SendingRequest;
                }
            }
        }

        self.update_interest(server_fd, Interest::OUT | Interest::RDHUP);
        self.update_interest(client_fd, Interest::RDHUP);
    }

    fn server_send_request(&mut self, id: ConnId, fd: RawFd) {
        let outcome = match self.connections.get_mut(&id) {
            Some(conn) => conn.request.write_to(fd).map(|_| conn.request.is_written()),
            None => return,
        };
        match outcome {
            Err(e) => {
                info!(fd, error = %e, "failed to forward request");
                self.close_connection(id);
            }
            Ok(false) => {}
            Ok(true) => {
                debug!(fd, "request forwarded to origin");
                if let Some(conn) = self.connections.get_mut(&id) {
                    conn.response = Message::new();
                    conn.state = ConnState::ReadingResponse;
                }
                self.update_interest(fd, Interest::IN | Interest::RDHUP);
            }
        }
    }

    fn server_read_response(&mut self, id: ConnId, fd: RawFd) {
        let progress = match self.connections.get_mut(&id) {
            Some(conn) => conn.response.read_from(fd),
            None => return,
        };
        match progress {
            Err(e) => {
                info!(fd, error = %e, "failed to read origin response");
                self.close_connection(id);
            }
            Ok(ReadProgress::PeerClosed) => {
                debug!(fd, "origin closed before the response finished");
                self.close_connection(id);
            }
            Ok(ReadProgress::WouldBlock) => {}
            Ok(ReadProgress::Advanced) => {
                let (client_fd, writable, done) = match self.connections.get(&id) {
                    Some(conn) => (
                        conn.client,
                        conn.response.can_write(),
                        conn.response.is_read(),
                    ),
                    None => return,
                };
                if done {
                    self.finish_response(id);
                } else if writable {
                    self.update_interest(client_fd, Interest::OUT | Interest::RDHUP);
                }
            }
        }
    }

    /// The whole response has been read from the origin: cache it when
    /// allowed, settle the origin side, and drain the rest to the client.
    fn finish_response(&mut self, id: ConnId) {
        let (client_fd, server_fd, close_after, cache_entry) = {
            let Some(conn) = self.connections.get(&id) else {
                return;
            };
            let Some(header) = conn.response.header() else {
                return;
            };
            let close_after = header.connection_close();
            let cache_entry = match (cache::should_cache(header), conn.request.header()) {
                (true, Some(request_header)) => Some((
                    request_url(request_header),
                    CachedResponse {
                        header: header.clone(),
                        parts: conn.response.parts().to_vec(),
                    },
                )),
                _ => None,
            };
            (conn.client, conn.server, close_after, cache_entry)
        };

        if let Some((url, entry)) = cache_entry {
            debug!(url = %url, "response saved to cache");
            self.cache.store(url, entry);
        }

        if close_after {
            debug!("origin asked to close after this response");
            if let Some(server_fd) = server_fd {
                self.detach_server(id, server_fd);
            }
        } else if let Some(server_fd) = server_fd {
            self.update_interest(server_fd, Interest::WAIT);
        }

        if let Some(conn) = self.connections.get_mut(&id) {
            conn.state = ConnState::SendingResponse { close_after };
        }
        self.update_interest(client_fd, Interest::OUT | Interest::RDHUP);

        let flushed = self
            .connections
            .get(&id)
            .map(|c| c.response.is_written())
            .unwrap_or(false);
        if flushed {
            self.response_delivered(id);
        }
    }

    fn server_send_validation(&mut self, id: ConnId, fd: RawFd) {
        let outcome = {
            let Some(conn) = self.connections.get_mut(&id) else {
                return;
            };
            let ConnState::SendingValidation { probe, .. } = &mut conn.state else {
                return;
            };
            probe.write_to(fd).map(|_| probe.is_written())
        };
        match outcome {
            Err(e) => {
                info!(fd, error = %e, "failed to send validation request");
                self.close_connection(id);
            }
            Ok(false) => {}
            Ok(true) => {
                debug!(fd, "validation request sent");
                if let Some(conn) = self.connections.get_mut(&id) {
                    let state = std::mem::replace(&mut conn.state, ConnState::Accepted);
                    if let ConnState::SendingValidation { cached, .. } = state {
                        conn.response = Message::new();
                        conn.state = ConnState::ReadingValidation { cached };
                    }
                }
                self.update_interest(fd, Interest::IN | Interest::RDHUP);
            }
        }
    }

    fn server_read_validation(&mut self, id: ConnId, fd: RawFd) {
        let progress = match self.connections.get_mut(&id) {
            Some(conn) => conn.response.read_from(fd),
            None => return,
        };
        match progress {
            Err(e) => {
                info!(fd, error = %e, "failed to read validation response");
                self.close_connection(id);
            }
            Ok(ReadProgress::PeerClosed) => {
                debug!(fd, "origin closed during validation");
                self.close_connection(id);
            }
            Ok(ReadProgress::WouldBlock) => {}
            Ok(ReadProgress::Advanced) => {
                let done = self
                    .connections
                    .get(&id)
                    .map(|c| c.response.is_read())
                    .unwrap_or(false);
                if done {
                    self.handle_validation(id);
                }
            }
        }
    }

    /// The origin has ruled on the conditional request. A 200 or 304
    /// confirms the cached entry, which is then streamed to the client
    /// (with the verdict's Connection value spliced on). Anything else
    /// evicts the entry and replays the original request, reconnecting
    /// first when the verdict also closed the origin side.
    fn handle_validation(&mut self, id: ConnId) {
        let (cached, code, verdict_close, splice, url, host) = {
            let Some(conn) = self.connections.get_mut(&id) else {
                return;
            };
            let state = std::mem::replace(&mut conn.state, ConnState::Accepted);
            let ConnState::ReadingValidation { cached } = state else {
                return;
            };
            let Some(header) = conn.response.header() else {
                return;
            };
            let code = header.start.code;
            let verdict_close = header.connection_close();
            let splice = header.get("Connection").map(str::to_string);
            let Some(request_header) = conn.request.header() else {
                return;
            };
            let url = request_url(request_header);
            let host = request_header.get("Host").unwrap_or("").to_string();
            (cached, code, verdict_close, splice, url, host)
        };
        let (client_fd, server_fd) = match self.connections.get(&id) {
            Some(conn) => (conn.client, conn.server),
            None => return,
        };

        if code == 200 || code == 304 {
            debug!(url = %url, code, "cache entry confirmed by origin");
            let response = cached.into_message(splice.as_deref());
            let close_after = response
                .header()
                .map(|h| h.connection_close())
                .unwrap_or(false);
            if let Some(conn) = self.connections.get_mut(&id) {
                conn.response = response;
                conn.state = ConnState::SendingResponse { close_after };
            }
            if close_after {
                if let Some(server_fd) = server_fd {
                    self.detach_server(id, server_fd);
                }
            } else if let Some(server_fd) = server_fd {
                self.update_interest(server_fd, Interest::WAIT);
            }
            self.update_interest(client_fd, Interest::OUT | Interest::RDHUP);
        } else {
            debug!(url = %url, code, "cache entry rejected by origin, evicting");
            self.cache.invalidate(&url);
            if verdict_close {
                debug!("origin closed after validation, reconnecting");
                if let Some(server_fd) = server_fd {
                    self.detach_server(id, server_fd);
                }
                self.start_resolve(id, host);
            } else {
                if let Some(conn) = self.connections.get_mut(&id) {
                    conn.state = ConnState::SendingRequest;
                }
                if let Some(server_fd) = server_fd {
                    self.update_interest(server_fd, Interest::OUT | Interest::RDHUP);
                }
            }
        }
    }

    fn response_delivered(&mut self, id: ConnId) {
        let close_after = match self.connections.get(&id).map(|c| &c.state) {
            Some(ConnState::SendingResponse { close_after }) => *close_after,
            _ => return,
        };
        if close_after {
            debug!("response delivered, closing client");
            self.close_connection(id);
        } else {
            self.enter_keep_alive(id);
        }
    }

    fn enter_keep_alive(&mut self, id: ConnId) {
        let (client_fd, server_fd) = {
            let Some(conn) = self.connections.get_mut(&id) else {
                return;
            };
            conn.reset_exchange();
            conn.state = ConnState::KeepAlive;
            (conn.client, conn.server)
        };
        debug!(client_fd, "response delivered, kept alive");
        self.update_interest(client_fd, Interest::IN | Interest::RDHUP);
        if let Some(server_fd) = server_fd {
            self.update_interest(server_fd, Interest::RDHUP);
        }
    }

    // ---- Shared plumbing ----

    /// Drop the origin side only; the client connection lives on.
    fn detach_server(&mut self, id: ConnId, server_fd: RawFd) {
        self.registry.remove(&self.reactor, server_fd);
        if let Some(conn) = self.connections.get_mut(&id) {
            conn.server = None;
            conn.host = None;
        }
    }

    /// Uniform HUP/ERR handling outside the connecting phase: peer-level
    /// failures close quietly, anything else is logged loudly and still
    /// only costs this connection.
    fn fail_socket(&mut self, id: ConnId, fd: RawFd, side: &'static str) {
        let code = syscalls::take_socket_error(fd).unwrap_or(0);
        match code {
            0 => debug!(fd, side, "peer hung up"),
            libc::ECONNRESET | libc::EPIPE | libc::ETIMEDOUT => {
                info!(fd, side, code, "connection reset by peer");
            }
            _ => error!(fd, side, code, "unexpected socket error"),
        }
        self.close_connection(id);
    }

    /// Tear down both sides of a connection. Safe to call twice and safe
    /// when one side was already removed by the sweep.
    fn close_connection(&mut self, id: ConnId) {
        let Some(conn) = self.connections.remove(&id) else {
            return;
        };
        if let ConnState::Resolving { host } = &conn.state {
            self.pending.remove(&(conn.client, host.clone()));
        }
        self.registry.remove(&self.reactor, conn.client);
        if let Some(server_fd) = conn.server {
            self.registry.remove(&self.reactor, server_fd);
        }
        debug!(client = conn.client, "connection closed");
    }

    fn update_interest(&mut self, fd: RawFd, interest: Interest) {
        if let Err(e) = self.registry.set_interest(&self.reactor, fd, interest) {
            warn!(fd, error = %e, "failed to update interest");
        }
    }
}

/// Cache key: exact `Host` value concatenated with the request path.
fn request_url(header: &RequestHeader) -> String {
    format!(
        "{}{}",
        header.get("Host").unwrap_or(""),
        header.start.target
    )
}

/// Conditional request for a cached entry: the original request line and
/// host, the cached validators, and the client's Connection value.
fn validation_request(request: &RequestHeader, cached: &ResponseHeader) -> RequestHeader {
    let mut header = HttpHeader::new(request.start.clone());
    if let Some(host) = request.get("Host") {
        header.set("Host", host);
    }
    if let Some(etag) = cached.get("ETag") {
        header.set("If-None-Match", etag);
    }
    if let Some(modified) = cached.get("Last-Modified") {
        header.set("If-Modified-Since", modified);
    }
    if let Some(connection) = request.get("Connection") {
        header.set("Connection", connection);
    }
    header
}

#[cfg(test)]
mod tests {
    use super::*;

    fn request(text: &str) -> RequestHeader {
        RequestHeader::parse(text).unwrap()
    }

    fn response(text: &str) -> ResponseHeader {
        ResponseHeader::parse(text).unwrap()
    }

    #[test]
    fn url_is_host_plus_path() {
        let header = request("GET http://example.com/a/b?q=1 HTTP/1.1\r\nHost: example.com\r\n\r\n");
        assert_eq!(request_url(&header), "example.com/a/b?q=1");
    }

    #[test]
    fn validation_request_carries_exactly_the_cached_validators() {
        let client = request("GET /a HTTP/1.1\r\nHost: example.com\r\nConnection: keep-alive\r\n\r\n");
        let cached = response(
            "HTTP/1.1 200 OK\r\nETag: \"v1\"\r\nLast-Modified: Mon, 01 Jan 2024 00:00:00 GMT\r\n\r\n",
        );

        let probe = validation_request(&client, &cached);
        assert_eq!(probe.get("If-None-Match"), Some("\"v1\""));
        assert_eq!(
            probe.get("If-Modified-Since"),
            Some("Mon, 01 Jan 2024 00:00:00 GMT")
        );
        assert_eq!(probe.get("Host"), Some("example.com"));
        assert_eq!(probe.get("Connection"), Some("keep-alive"));
        assert!(probe.to_wire().starts_with("GET /a HTTP/1.1\r\n"));
    }

    #[test]
    fn validation_request_omits_absent_validators() {
        let client = request("GET /a HTTP/1.1\r\nHost: example.com\r\n\r\n");
        let cached = response("HTTP/1.1 200 OK\r\nETag: \"v1\"\r\n\r\n");

        let probe = validation_request(&client, &cached);
        assert_eq!(probe.get("If-None-Match"), Some("\"v1\""));
        assert!(!probe.has("If-Modified-Since"));
        assert!(!probe.has("Connection"));
    }
}
