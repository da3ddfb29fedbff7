//! Error Types
//!
//! Every failure the routing core can produce. Inbound failures are absorbed
//! at the mesh handler boundary; nothing here is fatal to the process.

use thiserror::Error;

use crate::protocol::DeviceId;

/// A specialized `Result` for mesh operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Malformed inbound bytes. Always recoverable: the frame is dropped.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ParseError {
    #[error("frame too short: {len} bytes, header needs at least {min}")]
    TooShort { len: usize, min: usize },

    #[error("unsupported message type: {0}")]
    UnknownMessageType(u8),

    #[error("ttl {ttl} exceeds protocol maximum {max}")]
    TtlOutOfRange { ttl: u8, max: u8 },

    #[error("truncated {0} field")]
    Truncated(&'static str),

    #[error("invalid device id in {field}: {reason}")]
    InvalidDeviceId { field: &'static str, reason: &'static str },

    #[error("body length mismatch: header says {declared}, frame carries {actual}")]
    BodyLengthMismatch { declared: usize, actual: usize },

    #[error("invalid OGM: {0}")]
    InvalidOgm(&'static str),
}

/// A message that could not be routed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RoutingError {
    #[error("no route to {0}")]
    NoRoute(DeviceId),

    #[error("ttl exhausted forwarding to {0}")]
    TtlExhausted(DeviceId),

    #[error("message from unknown previous hop {0}")]
    UnknownPreviousHop(DeviceId),

    #[error("unicast message without a device destination")]
    UnsupportedDestination,
}

/// Failure reported by a link implementation. Treated as a staleness hint.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum LinkError {
    #[error("link closed")]
    Closed,

    #[error("link rejected frame: {0}")]
    Rejected(String),
}

/// Invalid or unreadable configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("failed to read configuration: {0}")]
    Io(#[from] std::io::Error),

    #[error("failed to decode configuration: {0}")]
    Json(#[from] serde_json::Error),
}

/// Top-level error for the crate.
#[derive(Debug, Error)]
pub enum Error {
    #[error(transparent)]
    Parse(#[from] ParseError),

    #[error(transparent)]
    Routing(#[from] RoutingError),

    #[error(transparent)]
    Link(#[from] LinkError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("no tokio runtime available to schedule mesh tasks")]
    NoRuntime,
}

impl Error {
    /// Whether the mesh is expected to recover on its own (next OGM or purge cycle).
    pub fn is_recoverable(&self) -> bool {
        !matches!(self, Error::Config(_) | Error::NoRuntime)
    }
}
