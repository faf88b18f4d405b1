// src/http.rs
use thiserror::Error;

#[derive(Debug, Error, Clone, Copy, PartialEq, Eq)]
pub enum ParseError {
    #[error("malformed start line")]
    InvalidStartLine,
    #[error("message is not valid UTF-8")]
    InvalidEncoding,
    #[error("invalid numeric field value")]
    InvalidNumber,
    #[error("header section too large")]
    TooLarge,
}

/// First line of an HTTP message: request line or status line.
pub trait StartLine: Sized {
    fn parse(line: &str) -> Result<Self, ParseError>;
    fn to_wire(&self) -> String;
}

/// `GET /path HTTP/1.1`. Absolute-form targets are reduced to the path
/// plus query at parse time; the request forwarded upstream always uses
/// the path-only form.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestLine {
    pub method: String,
    pub target: String,
    pub version: String,
}

impl RequestLine {
    pub fn is_get(&self) -> bool {
        self.method == "GET"
    }
}

impl StartLine for RequestLine {
    fn parse(line: &str) -> Result<Self, ParseError> {
        let mut pieces = line.splitn(3, ' ');
        let method = pieces.next().ok_or(ParseError::InvalidStartLine)?;
        let target = pieces.next().ok_or(ParseError::InvalidStartLine)?;
        let version = pieces.next().ok_or(ParseError::InvalidStartLine)?;
        if method.is_empty() || target.is_empty() {
            return Err(ParseError::InvalidStartLine);
        }
        Ok(Self {
            method: method.to_string(),
            target: strip_authority(target),
            version: version.to_string(),
        })
    }

    fn to_wire(&self) -> String {
        format!("{} {} {}\r\n", self.method, self.target, self.version)
    }
}

fn strip_authority(target: &str) -> String {
    if target.starts_with('/') {
        return target.to_string();
    }
    match target.find("://") {
        Some(scheme_end) => {
            let rest = &target[scheme_end + 3..];
            match rest.find('/') {
                Some(path_start) => rest[path_start..].to_string(),
                None => "/".to_string(),
            }
        }
        None => target.to_string(),
    }
}

/// `HTTP/1.1 200 OK`. The reason phrase may be absent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusLine {
    pub version: String,
    pub code: u16,
    pub reason: String,
}

impl StartLine for StatusLine {
    fn parse(line: &str) -> Result<Self, ParseError> {
        let mut pieces = line.splitn(3, ' ');
        let version = pieces.next().ok_or(ParseError::InvalidStartLine)?;
        let code = pieces
            .next()
            .ok_or(ParseError::InvalidStartLine)?
            .parse::<u16>()
            .map_err(|_| ParseError::InvalidNumber)?;
        let reason = pieces.next().unwrap_or("");
        if version.is_empty() {
            return Err(ParseError::InvalidStartLine);
        }
        Ok(Self {
            version: version.to_string(),
            code,
            reason: reason.to_string(),
        })
    }

    fn to_wire(&self) -> String {
        if self.reason.is_empty() {
            format!("{} {}\r\n", self.version, self.code)
        } else {
            format!("{} {} {}\r\n", self.version, self.code, self.reason)
        }
    }
}

/// How many body bytes follow the header.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BodyLength {
    Empty,
    Exact(usize),
    /// Streamed until the terminating `0\r\n\r\n` chunk.
    Chunked,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HeaderField {
    pub name: String,
    pub value: String,
}

/// Start line plus an insertion-ordered field list.
///
/// Field names keep their received spelling and compare case
/// insensitively, so serialization round-trips what the peer sent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HttpHeader<L> {
    pub start: L,
    fields: Vec<HeaderField>,
}

pub type RequestHeader = HttpHeader<RequestLine>;
pub type ResponseHeader = HttpHeader<StatusLine>;

impl<L: StartLine> HttpHeader<L> {
    pub fn new(start: L) -> Self {
        Self {
            start,
            fields: Vec::new(),
        }
    }

    /// Parse a complete header section (start line through the blank line).
    /// Lines may be terminated by CRLF or bare LF. Field lines without a
    /// colon are skipped.
    pub fn parse(text: &str) -> Result<Self, ParseError> {
        let mut lines = text.split('\n').map(|l| l.strip_suffix('\r').unwrap_or(l));
        let first = lines.next().ok_or(ParseError::InvalidStartLine)?;
        let mut header = Self::new(L::parse(first)?);

        for line in lines {
            if line.is_empty() {
                break;
            }
            let Some(colon) = line.find(':') else {
                continue;
            };
            let name = line[..colon].trim_end();
            let value = line[colon + 1..].trim_start_matches(' ');
            header.fields.push(HeaderField {
                name: name.to_string(),
                value: value.to_string(),
            });
        }

        header.normalize_proxy_connection();
        Ok(header)
    }

    // Proxy-Connection confuses some origins; fold it into Connection.
    fn normalize_proxy_connection(&mut self) {
        if let Some(value) = self.remove("Proxy-Connection") {
            if !self.has("Connection") {
                self.set("Connection", &value);
            }
        }
    }

    pub fn get(&self, name: &str) -> Option<&str> {
        self.fields
            .iter()
            .find(|f| f.name.eq_ignore_ascii_case(name))
            .map(|f| f.value.as_str())
    }

    pub fn has(&self, name: &str) -> bool {
        self.get(name).is_some()
    }

    /// Replace the first matching field's value, or append a new field.
    /// An existing field keeps its received name spelling.
    pub fn set(&mut self, name: &str, value: &str) {
        match self
            .fields
            .iter_mut()
            .find(|f| f.name.eq_ignore_ascii_case(name))
        {
            Some(field) => field.value = value.to_string(),
            None => self.fields.push(HeaderField {
                name: name.to_string(),
                value: value.to_string(),
            }),
        }
    }

    pub fn remove(&mut self, name: &str) -> Option<String> {
        let pos = self
            .fields
            .iter()
            .position(|f| f.name.eq_ignore_ascii_case(name))?;
        Some(self.fields.remove(pos).value)
    }

    pub fn to_wire(&self) -> String {
        let mut out = self.start.to_wire();
        for field in &self.fields {
            out.push_str(&field.name);
            out.push_str(": ");
            out.push_str(&field.value);
            out.push_str("\r\n");
        }
        out.push_str("\r\n");
        out
    }

    /// Body framing derived from the fields: Content-Length wins, then
    /// chunked transfer coding, otherwise no body.
    pub fn body_length(&self) -> Result<BodyLength, ParseError> {
        if let Some(value) = self.get("Content-Length") {
            let count = value
                .trim()
                .parse::<usize>()
                .map_err(|_| ParseError::InvalidNumber)?;
            return Ok(BodyLength::Exact(count));
        }
        if let Some(value) = self.get("Transfer-Encoding") {
            if value.trim().eq_ignore_ascii_case("chunked") {
                return Ok(BodyLength::Chunked);
            }
        }
        Ok(BodyLength::Empty)
    }

    pub fn connection_close(&self) -> bool {
        self.get("Connection")
            .is_some_and(|v| v.trim().eq_ignore_ascii_case("close"))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_request_header_with_absolute_target() {
        let header = RequestHeader::parse(
            "GET http://example.com:8080/a/b?q=1 HTTP/1.1\r\nHost: example.com:8080\r\nAccept: */*\r\n\r\n",
        )
        .unwrap();

        assert_eq!(header.start.method, "GET");
        assert_eq!(header.start.target, "/a/b?q=1");
        assert_eq!(header.start.version, "HTTP/1.1");
        assert_eq!(header.get("host"), Some("example.com:8080"));
        assert_eq!(header.get("ACCEPT"), Some("*/*"));
    }

    #[test]
    fn absolute_target_without_path_becomes_root() {
        let line = RequestLine::parse("GET http://example.com HTTP/1.1").unwrap();
        assert_eq!(line.target, "/");
    }

    #[test]
    fn proxy_connection_is_folded_into_connection() {
        let header = RequestHeader::parse(
            "GET / HTTP/1.1\r\nHost: a\r\nProxy-Connection: keep-alive\r\n\r\n",
        )
        .unwrap();

        assert!(!header.has("Proxy-Connection"));
        assert_eq!(header.get("Connection"), Some("keep-alive"));
    }

    #[test]
    fn existing_connection_wins_over_proxy_connection() {
        let header = RequestHeader::parse(
            "GET / HTTP/1.1\r\nConnection: close\r\nProxy-Connection: keep-alive\r\n\r\n",
        )
        .unwrap();

        assert!(!header.has("Proxy-Connection"));
        assert_eq!(header.get("Connection"), Some("close"));
    }

    #[test]
    fn body_length_variants() {
        let exact =
            ResponseHeader::parse("HTTP/1.1 200 OK\r\nContent-Length: 42\r\n\r\n").unwrap();
        assert_eq!(exact.body_length().unwrap(), BodyLength::Exact(42));

        let chunked =
            ResponseHeader::parse("HTTP/1.1 200 OK\r\nTransfer-Encoding: chunked\r\n\r\n")
                .unwrap();
        assert_eq!(chunked.body_length().unwrap(), BodyLength::Chunked);

        let empty = ResponseHeader::parse("HTTP/1.1 304 Not Modified\r\n\r\n").unwrap();
        assert_eq!(empty.body_length().unwrap(), BodyLength::Empty);

        let bad =
            ResponseHeader::parse("HTTP/1.1 200 OK\r\nContent-Length: nope\r\n\r\n").unwrap();
        assert_eq!(bad.body_length(), Err(ParseError::InvalidNumber));
    }

    #[test]
    fn set_keeps_received_name_spelling() {
        let mut header =
            ResponseHeader::parse("HTTP/1.1 200 OK\r\nConnection: keep-alive\r\n\r\n").unwrap();
        header.set("connection", "close");

        assert!(header.to_wire().contains("Connection: close\r\n"));
        assert!(header.connection_close());
    }

    #[test]
    fn serialization_round_trips() {
        let text = "HTTP/1.1 200 OK\r\nETag: \"v1\"\r\nLast-Modified: yesterday\r\n\r\n";
        let header = ResponseHeader::parse(text).unwrap();
        assert_eq!(header.to_wire(), text);

        let again = ResponseHeader::parse(&header.to_wire()).unwrap();
        assert_eq!(again, header);
    }

    #[test]
    fn status_line_without_reason() {
        let line = StatusLine::parse("HTTP/1.1 204").unwrap();
        assert_eq!(line.code, 204);
        assert_eq!(line.reason, "");
        assert_eq!(line.to_wire(), "HTTP/1.1 204\r\n");
    }

    #[test]
    fn newline_only_separators_are_accepted() {
        let header = RequestHeader::parse("GET / HTTP/1.0\nHost: a\n\n").unwrap();
        assert_eq!(header.get("Host"), Some("a"));
    }
}
