//! Error types for routing-core
//!
//! This module defines the error hierarchy for the routing decision engine.
//! Errors are categorized by subsystem and carry recovery hints.
//!
//! Only [`RuleError`] is surfaced to rule-management callers. Sniffing
//! failures are values, and `GeoIP`/service failures are recovered inside
//! their owning component.

use std::io;

use thiserror::Error;

/// Top-level error type for routing-core
#[derive(Debug, Error)]
pub enum RouterError {
    /// Invalid rule or route table
    #[error("Rule error: {0}")]
    Rule(#[from] RuleError),

    /// Configuration errors (file parsing, validation)
    #[error("Configuration error: {0}")]
    Config(#[from] ConfigError),

    /// `GeoIP` database errors
    #[error("GeoIP error: {0}")]
    GeoIp(#[from] GeoIpError),

    /// Background service connection errors
    #[error("Service error: {0}")]
    Service(#[from] ServiceError),

    /// I/O errors not covered by other categories
    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl RouterError {
    /// Check if this error is recoverable (can retry operation)
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::Rule(_) | Self::Config(_) => false,
            Self::GeoIp(e) => e.is_recoverable(),
            Self::Service(e) => e.is_recoverable(),
            Self::Io(e) => matches!(
                e.kind(),
                io::ErrorKind::TimedOut | io::ErrorKind::Interrupted | io::ErrorKind::WouldBlock
            ),
        }
    }
}

/// Rule and route table validation errors
///
/// Raised when a rule or table is constructed, before it can enter the
/// active route table.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RuleError {
    /// Rule has no matchers at all
    #[error("Rule '{id}' has no matchers")]
    NoMatchers { id: String },

    /// Rule identifier is empty
    #[error("Rule identifier cannot be empty")]
    EmptyId,

    /// Two rules share the same identifier
    #[error("Duplicate rule id: {0}")]
    DuplicateId(String),

    /// Matcher is malformed (empty set, bad value)
    #[error("Invalid matcher in rule '{id}': {reason}")]
    InvalidMatcher { id: String, reason: String },

    /// Port range with start > end
    #[error("Invalid port range: {start}-{end}")]
    InvalidPortRange { start: u16, end: u16 },

    /// Unparseable value (port, CIDR, hour...)
    #[error("Invalid value: {0}")]
    InvalidValue(String),

    /// Custom outbound is not registered in the outbound tag map
    #[error("Rule '{id}' references unknown outbound '{outbound}'")]
    UnknownOutbound { id: String, outbound: String },

    /// Geosite category is not present in the table
    #[error("Rule '{id}' references unknown geosite category '{category}'")]
    UnknownGeosite { id: String, category: String },

    /// Fallback chain is empty or contains an unresolvable entry
    #[error("Invalid fallback chain: {0}")]
    InvalidFallback(String),

    /// Rule with the given id does not exist
    #[error("Rule not found: {0}")]
    NotFound(String),
}

impl RuleError {
    /// Create an invalid matcher error
    pub fn invalid_matcher(id: impl Into<String>, reason: impl Into<String>) -> Self {
        Self::InvalidMatcher {
            id: id.into(),
            reason: reason.into(),
        }
    }
}

/// Configuration-related errors
#[derive(Debug, Error)]
pub enum ConfigError {
    /// File not found or inaccessible
    #[error("Configuration file not found: {path}")]
    FileNotFound { path: String },

    /// JSON parsing error
    #[error("Failed to parse configuration: {0}")]
    ParseError(String),

    /// Validation error (invalid values, missing required fields)
    #[error("Configuration validation failed: {0}")]
    ValidationError(String),

    /// Environment variable error
    #[error("Environment variable error: {name}: {reason}")]
    EnvError { name: String, reason: String },

    /// Rules embedded in the configuration are invalid
    #[error("Invalid routing rules: {0}")]
    Rule(#[from] RuleError),

    /// I/O error while reading config
    #[error("I/O error reading configuration: {0}")]
    IoError(#[from] io::Error),
}

impl ConfigError {
    /// Config errors are not recoverable without user intervention
    #[must_use]
    pub const fn is_recoverable(&self) -> bool {
        false
    }
}

/// `GeoIP` database errors
///
/// These never escape [`crate::geoip::GeoIpLookup`]; a failed load turns
/// every lookup into `None` for the rest of the session.
#[derive(Debug, Error)]
pub enum GeoIpError {
    /// No database path configured
    #[error("GeoIP database not configured")]
    NotConfigured,

    /// Database file is missing
    #[error("GeoIP database not found: {path}")]
    NotFound { path: String },

    /// Database content could not be parsed
    #[error("Malformed GeoIP database: {0}")]
    Malformed(String),

    /// I/O error while reading the database
    #[error("GeoIP I/O error: {0}")]
    IoError(#[from] io::Error),
}

impl GeoIpError {
    /// Check if this error is recoverable
    ///
    /// A reload may succeed once the installer has replaced the file.
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        matches!(self, Self::NotFound { .. } | Self::IoError(_))
    }
}

/// Errors on the connection to the privileged background service
#[derive(Debug, Error)]
pub enum ServiceError {
    /// Connection attempt failed
    #[error("Failed to connect to background service: {0}")]
    ConnectionFailed(String),

    /// Service went away (death notification)
    #[error("Background service disconnected: {0}")]
    Disconnected(String),

    /// Service refused the client permanently
    #[error("Background service rejected client: {0}")]
    Rejected(String),

    /// Wire protocol violation
    #[error("Service protocol error: {0}")]
    ProtocolError(String),

    /// I/O error
    #[error("Service I/O error: {0}")]
    IoError(#[from] io::Error),
}

impl ServiceError {
    /// Check if this error is recoverable
    #[must_use]
    pub fn is_recoverable(&self) -> bool {
        match self {
            Self::ConnectionFailed(_) | Self::Disconnected(_) | Self::ProtocolError(_) => true,
            Self::Rejected(_) => false,
            Self::IoError(e) => !matches!(e.kind(), io::ErrorKind::PermissionDenied),
        }
    }

    /// Create a protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Self::ProtocolError(msg.into())
    }
}

/// Type alias for Result with `RouterError`
pub type Result<T> = std::result::Result<T, RouterError>;
