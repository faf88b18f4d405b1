// src/message.rs
use std::os::fd::RawFd;
use std::str;

use crate::error::Result;
use crate::http::{BodyLength, HttpHeader, ParseError, StartLine};
use crate::syscalls::{self, IoStep};

/// Maximal header section supported; not finding the blank line within
/// this many bytes is a protocol error.
pub const HEADER_LIMIT: usize = 8 * 1024;

const READ_CHUNK: usize = 8 * 1024;
const CHUNK_TERMINATOR: &[u8] = b"0\r\n\r\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReadProgress {
    Advanced,
    WouldBlock,
    /// The peer performed an orderly close before the message finished.
    PeerClosed,
}

/// An HTTP message assembled incrementally from a non-blocking socket.
///
/// Bytes accumulate until the header's blank line, the header is parsed
/// once, and from then on body bytes are framed by the derived
/// `BodyLength`. Everything that will go back out on the wire is kept as
/// a sequence of byte parts: the re-serialized header first, then each
/// body slab in arrival order. The parts double as the replayable form
/// stored in the response cache, and a write cursor sweeps them for
/// partial writes.
#[derive(Debug)]
pub struct Message<L> {
    header: Option<HttpHeader<L>>,
    head_buf: Vec<u8>,
    body: BodyLength,
    body_read: usize,
    complete: bool,
    parts: Vec<Vec<u8>>,
    write_part: usize,
    write_off: usize,
    tail: Vec<u8>,
}

impl<L: StartLine> Message<L> {
    pub fn new() -> Self {
        Self {
            header: None,
            head_buf: Vec::new(),
            body: BodyLength::Empty,
            body_read: 0,
            complete: false,
            parts: Vec::new(),
            write_part: 0,
            write_off: 0,
            tail: Vec::new(),
        }
    }

    /// A fully materialized outbound message (header plus body).
    pub fn from_header(header: HttpHeader<L>, body: &[u8]) -> Self {
        let mut bytes = header.to_wire().into_bytes();
        bytes.extend_from_slice(body);
        Self {
            header: Some(header),
            head_buf: Vec::new(),
            body: BodyLength::Exact(body.len()),
            body_read: body.len(),
            complete: true,
            parts: vec![bytes],
            write_part: 0,
            write_off: 0,
            tail: Vec::new(),
        }
    }

    /// Rebuild a message from previously captured wire parts.
    pub fn from_parts(header: HttpHeader<L>, parts: Vec<Vec<u8>>) -> Self {
        let body_read = parts.iter().skip(1).map(Vec::len).sum();
        Self {
            header: Some(header),
            head_buf: Vec::new(),
            body: BodyLength::Exact(body_read),
            body_read,
            complete: true,
            parts,
            write_part: 0,
            write_off: 0,
            tail: Vec::new(),
        }
    }

    pub fn header(&self) -> Option<&HttpHeader<L>> {
        self.header.as_ref()
    }

    pub fn is_header_read(&self) -> bool {
        self.header.is_some()
    }

    /// Header parsed and body fully received.
    pub fn is_read(&self) -> bool {
        self.header.is_some() && self.complete
    }

    /// Unwritten wire bytes remain.
    pub fn can_write(&self) -> bool {
        self.write_part < self.parts.len()
    }

    /// Fully received and every part flushed.
    pub fn is_written(&self) -> bool {
        self.is_read() && !self.can_write()
    }

    pub fn parts(&self) -> &[Vec<u8>] {
        &self.parts
    }

    /// Perform one non-blocking read, advancing header assembly or body
    /// framing depending on where the message is.
    pub fn read_from(&mut self, fd: RawFd) -> Result<ReadProgress> {
        if self.header.is_none() {
            self.read_header_bytes(fd)
        } else {
            self.read_body_bytes(fd)
        }
    }

    /// Perform one non-blocking write of the pending parts.
    pub fn write_to(&mut self, fd: RawFd) -> Result<()> {
        if !self.can_write() {
            return Ok(());
        }
        let part = &self.parts[self.write_part];
        let written = syscalls::write_fd(fd, &part[self.write_off..])?;
        if written == 0 {
            return Ok(());
        }
        self.write_off += written;
        if self.write_off == part.len() {
            self.write_part += 1;
            self.write_off = 0;
        }
        Ok(())
    }

    fn read_header_bytes(&mut self, fd: RawFd) -> Result<ReadProgress> {
        let room = HEADER_LIMIT - self.head_buf.len();
        if room == 0 {
            return Err(ParseError::TooLarge.into());
        }
        let mut buf = [0u8; READ_CHUNK];
        let count = match syscalls::read_fd(fd, &mut buf[..room])? {
            IoStep::WouldBlock => return Ok(ReadProgress::WouldBlock),
            IoStep::Closed => return Ok(ReadProgress::PeerClosed),
            IoStep::Data(count) => count,
        };
        self.head_buf.extend_from_slice(&buf[..count]);

        let Some((end, separator)) = find_header_end(&self.head_buf) else {
            if self.head_buf.len() >= HEADER_LIMIT {
                return Err(ParseError::TooLarge.into());
            }
            return Ok(ReadProgress::Advanced);
        };

        let text =
            str::from_utf8(&self.head_buf[..end]).map_err(|_| ParseError::InvalidEncoding)?;
        let header = HttpHeader::parse(text)?;
        self.body = header.body_length()?;

        let mut remainder = self.head_buf.split_off(end + separator);
        self.head_buf.clear();
        self.parts.push(header.to_wire().into_bytes());

        // Bytes past an exact body length arrived early and are dropped;
        // request pipelining is not supported.
        if let BodyLength::Exact(limit) = self.body {
            if remainder.len() > limit {
                remainder.truncate(limit);
            }
        }
        if !remainder.is_empty() {
            self.body_read = remainder.len();
            self.track_terminator_window(remainder.as_slice());
            self.parts.push(remainder);
        }

        self.header = Some(header);
        self.refresh_completion();
        Ok(ReadProgress::Advanced)
    }

    fn read_body_bytes(&mut self, fd: RawFd) -> Result<ReadProgress> {
        if self.complete {
            return Ok(ReadProgress::Advanced);
        }
        let want = match self.body {
            BodyLength::Exact(limit) => (limit - self.body_read).min(READ_CHUNK),
            BodyLength::Chunked => READ_CHUNK,
            BodyLength::Empty => 0,
        };
        if want == 0 {
            self.refresh_completion();
            return Ok(ReadProgress::Advanced);
        }
        let mut buf = [0u8; READ_CHUNK];
        match syscalls::read_fd(fd, &mut buf[..want])? {
            IoStep::WouldBlock => Ok(ReadProgress::WouldBlock),
            IoStep::Closed => Ok(ReadProgress::PeerClosed),
            IoStep::Data(count) => {
                self.body_read += count;
                self.track_terminator_window(&buf[..count]);
                self.parts.push(buf[..count].to_vec());
                self.refresh_completion();
                Ok(ReadProgress::Advanced)
            }
        }
    }

    fn refresh_completion(&mut self) {
        match self.body {
            BodyLength::Empty => self.complete = true,
            BodyLength::Exact(limit) => {
                if self.body_read >= limit {
                    self.complete = true;
                }
            }
            BodyLength::Chunked => {}
        }
    }

    // The chunk terminator may straddle read boundaries, so a sliding
    // window of the last bytes is kept instead of inspecting single slabs.
    fn track_terminator_window(&mut self, data: &[u8]) {
        if self.body != BodyLength::Chunked {
            return;
        }
        self.tail.extend_from_slice(data);
        if self.tail.len() > CHUNK_TERMINATOR.len() {
            let excess = self.tail.len() - CHUNK_TERMINATOR.len();
            self.tail.drain(..excess);
        }
        if self.tail.ends_with(CHUNK_TERMINATOR) {
            self.complete = true;
            self.body = BodyLength::Exact(self.body_read);
        }
    }
}

fn find_header_end(buf: &[u8]) -> Option<(usize, usize)> {
    if let Some(pos) = buf.windows(4).position(|w| w == b"\r\n\r\n") {
        return Some((pos, 4));
    }
    if let Some(pos) = buf.windows(2).position(|w| w == b"\n\n") {
        return Some((pos, 2));
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::{RequestLine, StatusLine};
    use std::os::fd::{AsRawFd, FromRawFd, OwnedFd};

    fn socket_pair() -> (OwnedFd, OwnedFd) {
        let mut fds = [0; 2];
        let rc = unsafe {
            libc::socketpair(
                libc::AF_UNIX,
                libc::SOCK_STREAM | libc::SOCK_NONBLOCK,
                0,
                fds.as_mut_ptr(),
            )
        };
        assert_eq!(rc, 0);
        unsafe { (OwnedFd::from_raw_fd(fds[0]), OwnedFd::from_raw_fd(fds[1])) }
    }

    fn push(fd: &OwnedFd, bytes: &[u8]) {
        let written = syscalls::write_fd(fd.as_raw_fd(), bytes).unwrap();
        assert_eq!(written, bytes.len());
    }

    fn drain(fd: &OwnedFd) -> Vec<u8> {
        let mut out = Vec::new();
        let mut buf = [0u8; 4096];
        while let Ok(IoStep::Data(count)) = syscalls::read_fd(fd.as_raw_fd(), &mut buf) {
            out.extend_from_slice(&buf[..count]);
        }
        out
    }

    #[test]
    fn header_split_across_reads() {
        let (near, far) = socket_pair();
        let mut message: Message<RequestLine> = Message::new();

        push(&far, b"GET http://example.com/a HT");
        assert_eq!(
            message.read_from(near.as_raw_fd()).unwrap(),
            ReadProgress::Advanced
        );
        assert!(!message.is_header_read());

        push(&far, b"TP/1.1\r\nHost: example.com\r\n\r\n");
        message.read_from(near.as_raw_fd()).unwrap();

        assert!(message.is_read());
        let header = message.header().unwrap();
        assert_eq!(header.start.target, "/a");
        assert!(message.parts()[0].starts_with(b"GET /a HTTP/1.1\r\n"));
    }

    #[test]
    fn nothing_to_read_is_would_block() {
        let (near, _far) = socket_pair();
        let mut message: Message<RequestLine> = Message::new();
        assert_eq!(
            message.read_from(near.as_raw_fd()).unwrap(),
            ReadProgress::WouldBlock
        );
    }

    #[test]
    fn peer_close_is_reported() {
        let (near, far) = socket_pair();
        drop(far);
        let mut message: Message<RequestLine> = Message::new();
        assert_eq!(
            message.read_from(near.as_raw_fd()).unwrap(),
            ReadProgress::PeerClosed
        );
    }

    #[test]
    fn exact_body_ignores_trailing_bytes() {
        let (near, far) = socket_pair();
        let mut message: Message<RequestLine> = Message::new();

        push(
            &far,
            b"POST /submit HTTP/1.1\r\nHost: a\r\nContent-Length: 3\r\n\r\nabcGET / HTTP/1.1\r\n",
        );
        message.read_from(near.as_raw_fd()).unwrap();

        assert!(message.is_read());
        let body: Vec<u8> = message.parts()[1..].concat();
        assert_eq!(body, b"abc");
    }

    #[test]
    fn chunked_terminator_split_across_reads() {
        let (near, far) = socket_pair();
        let mut message: Message<StatusLine> = Message::new();

        push(
            &far,
            b"HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n5\r\nhello\r\n0\r\n",
        );
        message.read_from(near.as_raw_fd()).unwrap();
        assert!(message.is_header_read());
        assert!(!message.is_read());

        push(&far, b"\r\n");
        message.read_from(near.as_raw_fd()).unwrap();
        assert!(message.is_read());
    }

    #[test]
    fn oversized_header_is_rejected() {
        let (near, far) = socket_pair();
        let mut message: Message<RequestLine> = Message::new();

        let filler = vec![b'a'; HEADER_LIMIT];
        push(&far, b"GET / HTTP/1.1\r\nPadding: ");
        message.read_from(near.as_raw_fd()).unwrap();
        push(&far, &filler);
        assert!(message.read_from(near.as_raw_fd()).is_err());
    }

    #[test]
    fn write_sweeps_all_parts() {
        let (near, far) = socket_pair();

        let header = crate::http::ResponseHeader::parse(
            "HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\n",
        )
        .unwrap();
        let mut message = Message::from_parts(
            header,
            vec![
                b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\n".to_vec(),
                b"hello".to_vec(),
                b"world".to_vec(),
            ],
        );

        while message.can_write() {
            message.write_to(near.as_raw_fd()).unwrap();
        }
        assert!(message.is_written());
        assert_eq!(
            drain(&far),
            b"HTTP/1.1 200 OK\r\nContent-Length: 10\r\n\r\nhelloworld"
        );
    }

    #[test]
    fn from_header_materializes_wire_bytes() {
        let header =
            crate::http::RequestHeader::parse("GET /a HTTP/1.1\r\nHost: a\r\n\r\n").unwrap();
        let message = Message::from_header(header, b"");

        assert!(message.is_read());
        assert!(message.can_write());
        assert_eq!(message.parts()[0], b"GET /a HTTP/1.1\r\nHost: a\r\n\r\n");
    }
}
