//! HTTP/1.x request host extraction
//!
//! Finds the intended host of a plain HTTP request from its first bytes:
//!
//! - absolute-form request targets (`GET http://host:port/path HTTP/1.1`)
//! - CONNECT authorities (`CONNECT host:443 HTTP/1.1`)
//! - the `Host` header (case-insensitive, CRLF terminated)
//!
//! A request-target authority takes precedence over the `Host` header, as
//! RFC 7230 section 5.4 requires of proxies. Complete header blocks are
//! parsed with `httparse`; a partial buffer falls back to scanning the
//! CRLF-terminated lines received so far.
//!
//! ## Example
//!
//! ```
//! use routing_core::sniff::http::{extract_http_host, looks_like_http};
//!
//! let data = b"GET / HTTP/1.1\r\nHost: Example.com:8080\r\n\r\n";
//! assert!(looks_like_http(data));
//! assert_eq!(extract_http_host(data), Some("example.com".to_string()));
//! ```

use tracing::trace;

/// Maximum number of headers handed to `httparse`
const MAX_HEADERS: usize = 64;

/// Fields extracted from an HTTP request head
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct HttpRequestInfo {
    /// Request method
    pub method: String,
    /// Request target as sent
    pub target: String,
    /// Normalized host (no port, no brackets, lowercase)
    pub host: Option<String>,
    /// Whether `httparse` saw the complete header block
    pub complete: bool,
}

/// Quick check if data starts with a known HTTP method
#[must_use]
pub fn looks_like_http(data: &[u8]) -> bool {
    const METHODS: [&[u8]; 9] = [
        b"GET ", b"POST ", b"PUT ", b"HEAD ", b"DELETE ", b"OPTIONS ", b"PATCH ", b"CONNECT ",
        b"TRACE ",
    ];
    METHODS.iter().any(|m| data.starts_with(m))
}

/// Parse the head of an HTTP request
///
/// Returns `None` if the data does not start with an HTTP request line.
#[must_use]
pub fn parse_http_request(data: &[u8]) -> Option<HttpRequestInfo> {
    if !looks_like_http(data) {
        return None;
    }

    let mut headers = [httparse::EMPTY_HEADER; MAX_HEADERS];
    let mut req = httparse::Request::new(&mut headers);

    match req.parse(data) {
        Ok(httparse::Status::Complete(_)) => {
            let method = req.method?.to_string();
            let target = req.path?.to_string();
            let header_host = req
                .headers
                .iter()
                .find(|h| h.name.eq_ignore_ascii_case("host"))
                .and_then(|h| std::str::from_utf8(h.value).ok())
                .and_then(normalize_host);
            let host = target_authority(&method, &target).or(header_host);
            Some(HttpRequestInfo {
                method,
                target,
                host,
                complete: true,
            })
        }
        Ok(httparse::Status::Partial) | Err(httparse::Error::TooManyHeaders) => {
            trace!("partial HTTP head, scanning lines");
            scan_lines(data)
        }
        Err(e) => {
            trace!("failed to parse HTTP request: {:?}", e);
            None
        }
    }
}

/// Extract the request host from an HTTP request head
#[must_use]
pub fn extract_http_host(data: &[u8]) -> Option<String> {
    parse_http_request(data).and_then(|info| info.host)
}

/// Line-by-line scan of a possibly truncated request head
///
/// Only CRLF-terminated lines are trusted so a host cut off mid-name is
/// never reported.
fn scan_lines(data: &[u8]) -> Option<HttpRequestInfo> {
    let mut lines = crlf_lines(data);

    let request_line = std::str::from_utf8(lines.next()?).ok()?;
    let mut parts = request_line.split(' ').filter(|p| !p.is_empty());
    let method = parts.next()?.to_string();
    let target = parts.next()?.to_string();

    let mut host = target_authority(&method, &target);
    if host.is_none() {
        for line in lines {
            if line.is_empty() {
                break;
            }
            let Some(colon) = line.iter().position(|&b| b == b':') else {
                continue;
            };
            if line[..colon].eq_ignore_ascii_case(b"host") {
                host = std::str::from_utf8(&line[colon + 1..])
                    .ok()
                    .and_then(normalize_host);
                break;
            }
        }
    }

    Some(HttpRequestInfo {
        method,
        target,
        host,
        complete: false,
    })
}

fn crlf_lines(data: &[u8]) -> impl Iterator<Item = &[u8]> {
    let mut rest = data;
    std::iter::from_fn(move || {
        let pos = rest.windows(2).position(|w| w == b"\r\n")?;
        let line = &rest[..pos];
        rest = &rest[pos + 2..];
        Some(line)
    })
}

/// Host carried by the request target itself, if any
fn target_authority(method: &str, target: &str) -> Option<String> {
    if method.eq_ignore_ascii_case("CONNECT") {
        return normalize_host(target);
    }
    let (_, rest) = target.split_once("://")?;
    let authority = rest.split(&['/', '?', '#'][..]).next()?;
    let authority = authority.rsplit_once('@').map_or(authority, |(_, host)| host);
    normalize_host(authority)
}

/// Strip whitespace, port and IPv6 brackets; lowercase; validate
fn normalize_host(raw: &str) -> Option<String> {
    let raw = raw.trim();
    let host = if let Some(inner) = raw.strip_prefix('[') {
        &inner[..inner.find(']')?]
    } else if raw.matches(':').count() == 1 {
        // host:port; a bare IPv6 literal has several colons
        raw.split_once(':').map_or(raw, |(host, _)| host)
    } else {
        raw
    };
    let host = host.trim_end_matches('.');

    if host.is_empty() || host.len() > 253 {
        return None;
    }
    if !host
        .bytes()
        .all(|b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_' | b':'))
    {
        return None;
    }
    Some(host.to_ascii_lowercase())
}
