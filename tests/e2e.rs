//! End-to-end exercise over loopback: a scripted origin, a proxy on an
//! ephemeral port, and a plain TCP client driving the caching flow.

use std::io::{Read, Write};
use std::net::{TcpListener, TcpStream};
use std::os::unix::thread::JoinHandleExt;
use std::sync::{Arc, Mutex};
use std::thread;
use std::time::Duration;

use ravel::ProxyServer;

/// Origin that records every request header it sees and answers from a
/// fixed script: a cacheable 200, a 304 validation pass, a 500 validation
/// failure, then a fresh 200 with new content.
fn spawn_origin(log: Arc<Mutex<Vec<String>>>) -> u16 {
    let listener = TcpListener::bind("127.0.0.1:0").expect("bind origin");
    let port = listener.local_addr().expect("origin addr").port();

    thread::spawn(move || {
        let mut served = 0usize;
        for stream in listener.incoming() {
            let Ok(mut stream) = stream else { break };
            stream
                .set_read_timeout(Some(Duration::from_secs(5)))
                .expect("origin timeout");
            while let Some(head) = read_head(&mut stream) {
                log.lock().expect("origin log").push(head);
                served += 1;
                let reply: &[u8] = match served {
                    1 => b"HTTP/1.1 200 OK\r\nETag: \"v1\"\r\nContent-Length: 5\r\n\r\nhello",
                    2 => b"HTTP/1.1 304 Not Modified\r\nETag: \"v1\"\r\n\r\n",
                    3 => b"HTTP/1.1 500 Internal Server Error\r\nContent-Length: 0\r\n\r\n",
                    _ => b"HTTP/1.1 200 OK\r\nETag: \"v2\"\r\nContent-Length: 5\r\n\r\nworld",
                };
                if stream.write_all(reply).is_err() {
                    break;
                }
                if served >= 4 {
                    return;
                }
            }
        }
    });

    port
}

/// Read one header section, byte at a time, up to the blank line.
fn read_head(stream: &mut TcpStream) -> Option<String> {
    let mut buf = Vec::new();
    let mut byte = [0u8; 1];
    loop {
        match stream.read(&mut byte) {
            Ok(0) | Err(_) => return None,
            Ok(_) => {
                buf.push(byte[0]);
                if buf.ends_with(b"\r\n\r\n") {
                    return Some(String::from_utf8_lossy(&buf).into_owned());
                }
            }
        }
    }
}

/// Read one response: the header section plus a Content-Length body.
fn read_response(stream: &mut TcpStream) -> (String, Vec<u8>) {
    let head = read_head(stream).expect("response header");
    let length = head
        .lines()
        .find_map(|line| {
            line.to_ascii_lowercase()
                .strip_prefix("content-length:")
                .map(|v| v.trim().parse::<usize>().expect("content length"))
        })
        .unwrap_or(0);
    let mut body = vec![0u8; length];
    stream.read_exact(&mut body).expect("response body");
    (head, body)
}

#[test]
fn cold_warm_and_invalidated_requests_over_keep_alive() {
    let log = Arc::new(Mutex::new(Vec::new()));
    let origin_port = spawn_origin(Arc::clone(&log));

    let mut server = ProxyServer::new(0).expect("start proxy");
    let proxy_port = server.port();
    let proxy = thread::spawn(move || server.run());

    let host = format!("127.0.0.1:{origin_port}");
    let mut client = TcpStream::connect(("127.0.0.1", proxy_port)).expect("connect to proxy");
    client
        .set_read_timeout(Some(Duration::from_secs(10)))
        .expect("client timeout");

    // Cold GET: forwarded with a path-only target, response cached.
    write!(client, "GET http://{host}/a HTTP/1.1\r\nHost: {host}\r\n\r\n").expect("request 1");
    let (head, body) = read_response(&mut client);
    assert!(head.starts_with("HTTP/1.1 200"), "got: {head}");
    assert_eq!(body, b"hello");

    // Warm GET on the same client socket: validated upstream, served
    // from cache when the origin says 304.
    write!(client, "GET http://{host}/a HTTP/1.1\r\nHost: {host}\r\n\r\n").expect("request 2");
    let (head, body) = read_response(&mut client);
    assert!(head.starts_with("HTTP/1.1 200"), "got: {head}");
    assert!(head.contains("ETag: \"v1\""));
    assert_eq!(body, b"hello");

    // Third GET: the origin rejects the validators, the entry is evicted
    // and the original request replayed for a fresh response.
    write!(client, "GET http://{host}/a HTTP/1.1\r\nHost: {host}\r\n\r\n").expect("request 3");
    let (head, body) = read_response(&mut client);
    assert!(head.starts_with("HTTP/1.1 200"), "got: {head}");
    assert_eq!(body, b"world");

    let seen = log.lock().expect("log").clone();
    assert_eq!(seen.len(), 4, "origin saw: {seen:#?}");
    assert!(seen[0].starts_with("GET /a HTTP/1.1\r\n"), "got: {}", seen[0]);
    assert!(!seen[0].to_ascii_lowercase().contains("if-none-match"));
    assert!(seen[1].contains("If-None-Match: \"v1\""), "got: {}", seen[1]);
    assert!(seen[2].contains("If-None-Match: \"v1\""), "got: {}", seen[2]);
    assert!(!seen[3].to_ascii_lowercase().contains("if-none-match"));

    // SIGINT lands on the proxy thread's signal descriptor and stops the
    // loop cleanly.
    unsafe {
        libc::pthread_kill(proxy.as_pthread_t() as libc::pthread_t, libc::SIGINT);
    }
    proxy.join().expect("join proxy").expect("clean shutdown");
}
