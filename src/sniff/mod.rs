//! Pre-DNS traffic sniffing
//!
//! Extracts the intended host name from the first bytes of a flow before
//! any DNS answer exists, so domain rules can match connections made to a
//! bare IP.
//!
//! # Supported Protocols
//!
//! - TLS: `server_name` from the `ClientHello`
//! - HTTP/1.x: `Host` header, absolute-form target, CONNECT authority
//!
//! # Example
//!
//! ```
//! use routing_core::sniff::{SniffProtocol, TrafficSniffer};
//!
//! let sniffer = TrafficSniffer::default();
//! let result = sniffer.sniff(b"CONNECT game.example.com:443 HTTP/1.1\r\n\r\n", 3128);
//! assert_eq!(result.protocol, SniffProtocol::Http);
//! assert_eq!(result.host.as_deref(), Some("game.example.com"));
//! ```

pub mod http;
mod result;
mod sniffer;
pub mod tls;

pub use http::looks_like_http;
pub use result::{SniffProtocol, SniffResult};
pub use sniffer::{
    sniff_payload, SnifferStats, SnifferStatsSnapshot, TrafficSniffer, DEFAULT_SNIFF_CACHE_CAPACITY,
    DEFAULT_SNIFF_CACHE_TTL,
};
pub use tls::looks_like_tls;
