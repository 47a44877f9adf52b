//! Sniff result types

use std::fmt;

use serde::{Deserialize, Serialize};

/// Result of sniffing the first bytes of a flow
///
/// A failed sniff is a normal outcome, not an error: `success` is `false`
/// and `host` is `None`, while `protocol` still reports what the bytes
/// looked like.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SniffResult {
    /// Extracted host name, normalized
    pub host: Option<String>,
    /// Detected application protocol
    pub protocol: SniffProtocol,
    /// Whether a host was extracted
    pub success: bool,
}

impl SniffResult {
    /// A successful extraction
    pub fn found(protocol: SniffProtocol, host: impl Into<String>) -> Self {
        Self {
            host: Some(host.into()),
            protocol,
            success: true,
        }
    }

    /// No host could be extracted
    #[must_use]
    pub const fn failed(protocol: SniffProtocol) -> Self {
        Self {
            host: None,
            protocol,
            success: false,
        }
    }

    /// Nothing recognizable
    #[must_use]
    pub const fn unknown() -> Self {
        Self::failed(SniffProtocol::Unknown)
    }
}

/// Application protocol recognized by the sniffer
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SniffProtocol {
    /// Plain HTTP/1.x
    Http,
    /// TLS
    Tls,
    /// Not recognized
    Unknown,
}

impl SniffProtocol {
    /// Get protocol name as string
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::Http => "http",
            Self::Tls => "tls",
            Self::Unknown => "unknown",
        }
    }
}

impl fmt::Display for SniffProtocol {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
