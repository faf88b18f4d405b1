// src/resolver.rs
use std::collections::VecDeque;
use std::net::Ipv4Addr;
use std::os::fd::{AsRawFd, OwnedFd};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::thread::{self, JoinHandle};

use tracing::{debug, warn};

use crate::error::Result;
use crate::lru::LruCache;
use crate::syscalls;

/// Number of blocking resolution workers.
pub const WORKER_COUNT: usize = 4;

/// Bound on the host to address-list cache.
const HOST_CACHE_CAPACITY: usize = 500;

const DEFAULT_PORT: u16 = 80;

/// One completed resolution: the remaining candidate addresses, the
/// origin port, and the tag the caller submitted with the request.
#[derive(Debug)]
pub struct Resolved<T> {
    ips: VecDeque<Ipv4Addr>,
    port: u16,
    tag: T,
}

impl<T> Resolved<T> {
    pub fn tag(&self) -> &T {
        &self.tag
    }

    pub fn into_parts(self) -> (VecDeque<Ipv4Addr>, u16, T) {
        (self.ips, self.port, self.tag)
    }
}

struct Shared<T> {
    input: Mutex<VecDeque<(String, T)>>,
    available: Condvar,
    output: Mutex<VecDeque<Resolved<T>>>,
    cache: Mutex<LruCache<String, Vec<Ipv4Addr>>>,
    stop: AtomicBool,
    notifier: OwnedFd,
}

/// Worker pool performing blocking name resolution off the reactor thread.
///
/// Requests are tagged with opaque metadata and queued; each worker pops
/// one request, splits `host[:port]`, consults the bounded host cache,
/// resolves on a miss, pushes the result to the output queue and posts
/// one event on the notifier. The reactor dequeues exactly one result per
/// notifier event. Resolution failures of any kind surface as an empty
/// address list, never as a sentinel address.
///
/// Workers never touch reactor state; the queues (each under its own
/// mutex) and the notifier are the only cross-thread channels. The
/// process signal mask is set up before the pool starts, so workers
/// inherit blocked SIGINT and leave it to the reactor.
pub struct Resolver<T> {
    shared: Arc<Shared<T>>,
    workers: Vec<JoinHandle<()>>,
}

impl<T: Send + 'static> Resolver<T> {
    /// Start the pool. `notifier` is the write side of the counting
    /// eventfd whose read side the reactor watches.
    pub fn new(notifier: OwnedFd) -> Result<Self> {
        let shared = Arc::new(Shared {
            input: Mutex::new(VecDeque::new()),
            available: Condvar::new(),
            output: Mutex::new(VecDeque::new()),
            cache: Mutex::new(LruCache::new(HOST_CACHE_CAPACITY)),
            stop: AtomicBool::new(false),
            notifier,
        });

        let mut workers = Vec::with_capacity(WORKER_COUNT);
        for index in 0..WORKER_COUNT {
            let shared = Arc::clone(&shared);
            let handle = thread::Builder::new()
                .name(format!("ravel-resolver-{index}"))
                .spawn(move || worker_loop(shared))?;
            workers.push(handle);
        }

        Ok(Self { shared, workers })
    }

    /// Queue `host[:port]` for resolution, tagged with `tag`.
    pub fn submit(&self, host: String, tag: T) {
        lock(&self.shared.input).push_back((host, tag));
        self.shared.available.notify_one();
    }

    /// Dequeue one completed resolution, if any.
    pub fn take(&self) -> Option<Resolved<T>> {
        lock(&self.shared.output).pop_front()
    }

    /// Ask every worker to finish its current request and exit, then join.
    pub fn stop(&mut self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        self.shared.available.notify_all();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

impl<T> Drop for Resolver<T> {
    fn drop(&mut self) {
        self.shared.stop.store(true, Ordering::SeqCst);
        self.shared.available.notify_all();
        for handle in self.workers.drain(..) {
            let _ = handle.join();
        }
    }
}

fn worker_loop<T: Send>(shared: Arc<Shared<T>>) {
    loop {
        let job = {
            let mut queue = lock(&shared.input);
            loop {
                if shared.stop.load(Ordering::SeqCst) {
                    return;
                }
                if let Some(job) = queue.pop_front() {
                    break job;
                }
                queue = wait(&shared.available, queue);
            }
        };

        let (host, port) = split_host_port(&job.0);
        let ips = lookup(&shared, &host, port);
        debug!(host = %host, count = ips.len(), "resolution finished");

        lock(&shared.output).push_back(Resolved {
            ips: ips.into(),
            port,
            tag: job.1,
        });
        if let Err(error) = syscalls::signal_event(shared.notifier.as_raw_fd()) {
            warn!(error = %error, "failed to post resolver notification");
        }
    }
}

fn lookup<T>(shared: &Shared<T>, host: &str, port: u16) -> Vec<Ipv4Addr> {
    if let Some(ips) = lock(&shared.cache).get(&host.to_string()) {
        return ips.clone();
    }
    match syscalls::resolve_ipv4(host, port) {
        Ok(ips) => {
            if !ips.is_empty() {
                lock(&shared.cache).insert(host.to_string(), ips.clone());
            }
            ips
        }
        Err(error) => {
            debug!(host = %host, error = %error, "resolution failed");
            Vec::new()
        }
    }
}

fn split_host_port(input: &str) -> (String, u16) {
    match input.find(':') {
        Some(pos) => {
            let port = input[pos + 1..].parse::<u16>().unwrap_or(DEFAULT_PORT);
            (input[..pos].to_string(), port)
        }
        None => (input.to_string(), DEFAULT_PORT),
    }
}

fn lock<'a, V>(mutex: &'a Mutex<V>) -> MutexGuard<'a, V> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

fn wait<'a, V>(condvar: &Condvar, guard: MutexGuard<'a, V>) -> MutexGuard<'a, V> {
    condvar
        .wait(guard)
        .unwrap_or_else(|poisoned| poisoned.into_inner())
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn wait_for<T: Send + 'static>(resolver: &Resolver<T>) -> Resolved<T> {
        for _ in 0..500 {
            if let Some(result) = resolver.take() {
                return result;
            }
            thread::sleep(Duration::from_millis(10));
        }
        panic!("resolver produced no result");
    }

    #[test]
    fn numeric_host_resolves_with_tag() {
        let notifier = syscalls::create_event_fd().expect("eventfd");
        let resolver: Resolver<u32> = Resolver::new(notifier).expect("resolver");

        resolver.submit("127.0.0.1:8081".to_string(), 42);
        let resolved = wait_for(&resolver);

        assert_eq!(*resolved.tag(), 42);
        let (ips, port, tag) = resolved.into_parts();
        assert_eq!(ips.front(), Some(&Ipv4Addr::LOCALHOST));
        assert_eq!(port, 8081);
        assert_eq!(tag, 42);
    }

    #[test]
    fn unknown_host_yields_empty_list() {
        let notifier = syscalls::create_event_fd().expect("eventfd");
        let resolver: Resolver<u32> = Resolver::new(notifier).expect("resolver");

        resolver.submit("host.that.does.not.exist.invalid".to_string(), 1);
        let resolved = wait_for(&resolver);

        let (ips, port, _) = resolved.into_parts();
        assert!(ips.is_empty());
        assert_eq!(port, DEFAULT_PORT);
    }

    #[test]
    fn notifier_receives_one_event_per_result() {
        let notifier = syscalls::create_event_fd().expect("eventfd");
        let reader = syscalls::dup_fd(notifier.as_raw_fd()).expect("dup");
        let resolver: Resolver<u32> = Resolver::new(notifier).expect("resolver");

        resolver.submit("127.0.0.1".to_string(), 1);
        resolver.submit("127.0.0.1".to_string(), 2);

        let mut seen = 0;
        for _ in 0..500 {
            if syscalls::read_event(reader.as_raw_fd()).expect("read") > 0 {
                seen += 1;
                assert!(resolver.take().is_some());
                if seen == 2 {
                    break;
                }
            }
            thread::sleep(Duration::from_millis(10));
        }
        assert_eq!(seen, 2);
        assert_eq!(syscalls::read_event(reader.as_raw_fd()).expect("read"), 0);
    }

    #[test]
    fn split_host_port_defaults_to_http() {
        assert_eq!(split_host_port("example.com"), ("example.com".into(), 80));
        assert_eq!(
            split_host_port("example.com:8080"),
            ("example.com".into(), 8080)
        );
        assert_eq!(split_host_port("example.com:bad"), ("example.com".into(), 80));
    }

    #[test]
    fn stop_joins_all_workers() {
        let notifier = syscalls::create_event_fd().expect("eventfd");
        let mut resolver: Resolver<u32> = Resolver::new(notifier).expect("resolver");
        resolver.submit("127.0.0.1".to_string(), 1);
        resolver.stop();
    }
}
