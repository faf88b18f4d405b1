// src/cache.rs
use crate::http::{ResponseHeader, StatusLine};
use crate::lru::LruCache;
use crate::message::Message;

/// Upper bound on retained responses, evicting by recency past it.
const RESPONSE_CACHE_CAPACITY: usize = 512;

/// A response retained for replay: the parsed header for validator and
/// splice access, and the wire parts exactly as they were relayed.
#[derive(Debug, Clone)]
pub struct CachedResponse {
    pub header: ResponseHeader,
    pub parts: Vec<Vec<u8>>,
}

impl CachedResponse {
    pub fn etag(&self) -> Option<&str> {
        self.header.get("ETag")
    }

    pub fn last_modified(&self) -> Option<&str> {
        self.header.get("Last-Modified")
    }

    /// Turn the entry into an outbound message. When the origin's
    /// validation response carried a `Connection` value it replaces the
    /// cached one, and only then is the header part re-serialized; without
    /// a splice the replay is byte-identical to what was cached.
    pub fn into_message(mut self, spliced_connection: Option<&str>) -> Message<StatusLine> {
        if let Some(value) = spliced_connection {
            self.header.set("Connection", value);
            if self.parts.is_empty() {
                self.parts.push(self.header.to_wire().into_bytes());
            } else {
                self.parts[0] = self.header.to_wire().into_bytes();
            }
        }
        Message::from_parts(self.header, self.parts)
    }
}

/// Decide whether a response may enter the cache. Anything the origin
/// marks as non-storable is rejected, as is a response without a
/// validator, because it could never be revalidated.
pub fn should_cache(header: &ResponseHeader) -> bool {
    if let Some(value) = header.get("Cache-Control") {
        let value = value.to_ascii_lowercase();
        if value.contains("no-cache")
            || value.contains("no-store")
            || value.contains("must-revalidate")
            || value.contains("proxy-revalidate")
            || value.contains("max-age=0")
        {
            return false;
        }
    }

    if let Some(value) = header.get("Pragma") {
        if value.to_ascii_lowercase().contains("no-cache") {
            return false;
        }
    }

    if let Some(value) = header.get("Cache") {
        if value.trim().eq_ignore_ascii_case("none") {
            return false;
        }
    }

    if !header.has("ETag") && !header.has("Last-Modified") {
        return false;
    }

    true
}

/// URL-keyed store of validated responses. The URL is the exact `Host`
/// header value concatenated with the request path.
pub struct ResponseCache {
    entries: LruCache<String, CachedResponse>,
}

impl ResponseCache {
    pub fn new() -> Self {
        Self {
            entries: LruCache::new(RESPONSE_CACHE_CAPACITY),
        }
    }

    pub fn lookup(&mut self, url: &str) -> Option<CachedResponse> {
        self.entries.get(&url.to_string()).cloned()
    }

    /// Retain a response. An entry already present stays untouched; it is
    /// only replaced after an explicit invalidation.
    pub fn store(&mut self, url: String, response: CachedResponse) {
        if !self.entries.contains(&url) {
            self.entries.insert(url, response);
        }
    }

    pub fn invalidate(&mut self, url: &str) {
        self.entries.remove(&url.to_string());
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

impl Default for ResponseCache {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn response(extra: &str) -> ResponseHeader {
        ResponseHeader::parse(&format!("HTTP/1.1 200 OK\r\n{extra}\r\n")).unwrap()
    }

    fn entry(extra: &str) -> CachedResponse {
        let header = response(extra);
        let parts = vec![header.to_wire().into_bytes(), b"payload".to_vec()];
        CachedResponse { header, parts }
    }

    #[test]
    fn validators_are_required() {
        assert!(should_cache(&response("ETag: \"v1\"\r\n")));
        assert!(should_cache(&response("Last-Modified: yesterday\r\n")));
        assert!(!should_cache(&response("Content-Length: 4\r\n")));
    }

    #[test]
    fn cache_control_directives_reject() {
        for directive in [
            "no-cache",
            "no-store",
            "must-revalidate",
            "proxy-revalidate",
            "max-age=0",
        ] {
            let header = response(&format!("ETag: \"v\"\r\nCache-Control: {directive}\r\n"));
            assert!(!should_cache(&header), "{directive} should reject");
        }

        let ok = response("ETag: \"v\"\r\nCache-Control: public, max-age=60\r\n");
        assert!(should_cache(&ok));
    }

    #[test]
    fn pragma_and_cache_fields_reject() {
        assert!(!should_cache(&response(
            "ETag: \"v\"\r\nPragma: no-cache\r\n"
        )));
        assert!(!should_cache(&response("ETag: \"v\"\r\nCache: none\r\n")));
        assert!(should_cache(&response("ETag: \"v\"\r\nCache: public\r\n")));
    }

    #[test]
    fn store_does_not_replace_existing_entry() {
        let mut cache = ResponseCache::new();
        cache.store("a/x".to_string(), entry("ETag: \"v1\"\r\n"));
        cache.store("a/x".to_string(), entry("ETag: \"v2\"\r\n"));

        let found = cache.lookup("a/x").unwrap();
        assert_eq!(found.etag(), Some("\"v1\""));
    }

    #[test]
    fn invalidate_then_store_replaces() {
        let mut cache = ResponseCache::new();
        cache.store("a/x".to_string(), entry("ETag: \"v1\"\r\n"));
        cache.invalidate("a/x");
        assert!(cache.lookup("a/x").is_none());

        cache.store("a/x".to_string(), entry("ETag: \"v2\"\r\n"));
        assert_eq!(cache.lookup("a/x").unwrap().etag(), Some("\"v2\""));
    }

    #[test]
    fn splice_rewrites_only_the_connection_line() {
        let cached = entry("ETag: \"v1\"\r\nConnection: keep-alive\r\n");
        let untouched = cached.clone().into_message(None);
        assert_eq!(untouched.parts(), cached.parts.as_slice());

        let spliced = cached.clone().into_message(Some("close"));
        let head = String::from_utf8(spliced.parts()[0].clone()).unwrap();
        assert!(head.contains("Connection: close\r\n"));
        assert!(head.contains("ETag: \"v1\"\r\n"));
        assert_eq!(spliced.parts()[1], cached.parts[1]);
    }
}
