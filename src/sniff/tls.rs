//! TLS `ClientHello` server name extraction
//!
//! Reads the first TLS record of a connection and walks the `ClientHello`
//! down to the `server_name` extension.
//!
//! ## Layout walked
//!
//! ```text
//! Record:      type(1)=0x16 version(2) length(2)
//! Handshake:   type(1)=0x01 length(3)
//! ClientHello: version(2) random(32)
//!              session_id   <1-byte len>
//!              cipher_suites <2-byte len>
//!              compression  <1-byte len>
//!              extensions   <2-byte len> { type(2) len(2) data }*
//! server_name: list_len(2) { name_type(1)=0x00 len(2) host }*
//! ```
//!
//! Every length is bounds-checked; a truncated or malformed hello yields
//! `None`, never a panic.

use tracing::trace;

/// TLS `ContentType` for Handshake
const CONTENT_TYPE_HANDSHAKE: u8 = 0x16;

/// TLS `HandshakeType` for `ClientHello`
const HANDSHAKE_CLIENT_HELLO: u8 = 0x01;

/// Record header: type + version + length
const RECORD_HEADER_LEN: usize = 5;

/// Legacy version (2) + random (32)
const VERSION_AND_RANDOM_LEN: usize = 34;

/// `server_name` extension type
const EXT_SERVER_NAME: u16 = 0x0000;

/// `application_layer_protocol_negotiation` extension type
const EXT_ALPN: u16 = 0x0010;

/// `host_name` entry type inside `server_name`
const NAME_TYPE_HOST: u8 = 0x00;

/// RFC 8446 record size limit (plus slack some stacks send)
const MAX_RECORD_LEN: usize = 16384 + 2048;

/// Fields extracted from a `ClientHello`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ClientHelloInfo {
    /// `host_name` from the `server_name` extension
    pub server_name: Option<String>,
    /// Record-layer version
    pub record_version: u16,
    /// Offered ALPN protocols
    pub alpn: Vec<String>,
}

/// Bounds-checked big-endian cursor over a byte slice
struct Reader<'a> {
    buf: &'a [u8],
}

impl<'a> Reader<'a> {
    const fn new(buf: &'a [u8]) -> Self {
        Self { buf }
    }

    fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn take(&mut self, n: usize) -> Option<&'a [u8]> {
        if n > self.buf.len() {
            return None;
        }
        let (head, tail) = self.buf.split_at(n);
        self.buf = tail;
        Some(head)
    }

    fn u8(&mut self) -> Option<u8> {
        self.take(1).map(|b| b[0])
    }

    fn u16(&mut self) -> Option<u16> {
        self.take(2).map(|b| u16::from_be_bytes([b[0], b[1]]))
    }

    fn u24(&mut self) -> Option<usize> {
        self.take(3)
            .map(|b| (usize::from(b[0]) << 16) | (usize::from(b[1]) << 8) | usize::from(b[2]))
    }

    /// Take a block prefixed by a 1-byte length
    fn block8(&mut self) -> Option<Reader<'a>> {
        let len = usize::from(self.u8()?);
        self.take(len).map(Reader::new)
    }

    /// Take a block prefixed by a 2-byte length
    fn block16(&mut self) -> Option<Reader<'a>> {
        let len = usize::from(self.u16()?);
        self.take(len).map(Reader::new)
    }
}

/// Parse a TLS `ClientHello` from the first bytes of a connection
///
/// Returns `None` if the data is not a complete `ClientHello` record
/// header-and-body up to the end of the extensions block.
#[must_use]
pub fn parse_client_hello(data: &[u8]) -> Option<ClientHelloInfo> {
    let mut record = Reader::new(data);

    if record.u8()? != CONTENT_TYPE_HANDSHAKE {
        trace!("not a TLS handshake record");
        return None;
    }
    let record_version = record.u16()?;
    if !(0x0300..=0x0304).contains(&record_version) {
        trace!("unexpected TLS record version 0x{:04x}", record_version);
        return None;
    }
    let record_len = usize::from(record.u16()?);
    if record_len > MAX_RECORD_LEN {
        trace!("TLS record length {} over limit", record_len);
        return None;
    }

    if record.u8()? != HANDSHAKE_CLIENT_HELLO {
        trace!("TLS handshake is not a ClientHello");
        return None;
    }
    let hello_len = record.u24()?;
    // A hello spanning several records cannot be read from the first one
    let mut hello = Reader::new(record.take(hello_len)?);

    hello.take(VERSION_AND_RANDOM_LEN)?;
    hello.block8()?; // session id
    hello.block16()?; // cipher suites
    hello.block8()?; // compression methods

    let mut info = ClientHelloInfo {
        record_version,
        ..ClientHelloInfo::default()
    };

    // TLS 1.0 hellos may omit extensions entirely
    if hello.is_empty() {
        return Some(info);
    }

    let mut extensions = hello.block16()?;
    while !extensions.is_empty() {
        let ext_type = extensions.u16()?;
        let mut body = extensions.block16()?;
        match ext_type {
            EXT_SERVER_NAME if info.server_name.is_none() => {
                info.server_name = parse_server_name(&mut body);
                if let Some(name) = &info.server_name {
                    trace!("TLS SNI: {}", name);
                }
            }
            EXT_ALPN => info.alpn = parse_alpn(&mut body),
            _ => {}
        }
    }

    Some(info)
}

/// First `host_name` entry of a `server_name` extension body
fn parse_server_name(body: &mut Reader<'_>) -> Option<String> {
    let mut list = body.block16()?;
    while !list.is_empty() {
        let name_type = list.u8()?;
        let name = list.block16()?.buf;
        if name_type == NAME_TYPE_HOST {
            return valid_host_name(name);
        }
    }
    None
}

fn parse_alpn(body: &mut Reader<'_>) -> Vec<String> {
    let mut protocols = Vec::new();
    let Some(mut list) = body.block16() else {
        return protocols;
    };
    while let Some(proto) = list.block8() {
        if let Ok(s) = std::str::from_utf8(proto.buf) {
            protocols.push(s.to_string());
        }
    }
    protocols
}

/// Accept printable ASCII host names only
fn valid_host_name(raw: &[u8]) -> Option<String> {
    if raw.is_empty() || raw.len() > 253 {
        return None;
    }
    if !raw
        .iter()
        .all(|&b| b.is_ascii_alphanumeric() || matches!(b, b'-' | b'.' | b'_'))
    {
        return None;
    }
    std::str::from_utf8(raw).ok().map(str::to_string)
}

/// Extract the SNI host name from a `ClientHello`
#[must_use]
pub fn extract_tls_host(data: &[u8]) -> Option<String> {
    parse_client_hello(data).and_then(|info| info.server_name)
}

/// Quick check if data starts like a TLS handshake record
///
/// Only inspects the record header and the handshake type byte.
#[must_use]
pub fn looks_like_tls(data: &[u8]) -> bool {
    if data.len() < RECORD_HEADER_LEN || data[0] != CONTENT_TYPE_HANDSHAKE {
        return false;
    }
    let version = u16::from_be_bytes([data[1], data[2]]);
    if !(0x0300..=0x0304).contains(&version) {
        return false;
    }
    data.get(RECORD_HEADER_LEN)
        .map_or(true, |&t| t == HANDSHAKE_CLIENT_HELLO)
}

/// Test fixture: build a `ClientHello` record carrying the given SNI and ALPN
#[cfg(test)]
pub(crate) fn build_client_hello(sni: &str, alpn: &[&str]) -> Vec<u8> {
    fn with_len16(body: &[u8]) -> Vec<u8> {
        let mut out = (body.len() as u16).to_be_bytes().to_vec();
        out.extend_from_slice(body);
        out
    }

    let mut extensions = Vec::new();
    // An unrelated extension first (supported_groups)
    extensions.extend_from_slice(&[0x00, 0x0a]);
    extensions.extend_from_slice(&with_len16(&with_len16(&[0x00, 0x1d])));

    if !sni.is_empty() {
        let mut entry = vec![NAME_TYPE_HOST];
        entry.extend_from_slice(&with_len16(sni.as_bytes()));
        extensions.extend_from_slice(&EXT_SERVER_NAME.to_be_bytes());
        extensions.extend_from_slice(&with_len16(&with_len16(&entry)));
    }

    if !alpn.is_empty() {
        let mut list = Vec::new();
        for proto in alpn {
            list.push(proto.len() as u8);
            list.extend_from_slice(proto.as_bytes());
        }
        extensions.extend_from_slice(&EXT_ALPN.to_be_bytes());
        extensions.extend_from_slice(&with_len16(&with_len16(&list)));
    }

    let mut hello = vec![0x03, 0x03];
    hello.extend_from_slice(&[0x11; 32]);
    hello.push(32);
    hello.extend_from_slice(&[0x22; 32]);
    hello.extend_from_slice(&with_len16(&[0x13, 0x01, 0x13, 0x02]));
    hello.extend_from_slice(&[0x01, 0x00]);
    hello.extend_from_slice(&with_len16(&extensions));

    let mut handshake = vec![HANDSHAKE_CLIENT_HELLO];
    let len = hello.len() as u32;
    handshake.extend_from_slice(&len.to_be_bytes()[1..]);
    handshake.extend_from_slice(&hello);

    let mut record = vec![CONTENT_TYPE_HANDSHAKE, 0x03, 0x01];
    record.extend_from_slice(&with_len16(&handshake));
    record
}
