//! Device identifiers
//!
//! Opaque string identities carried on the wire with a one-byte length prefix.

use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

use crate::error::ParseError;

/// Longest identifier the wire format can carry.
pub const MAX_DEVICE_ID_LEN: usize = u8::MAX as usize;

/// Opaque identity of a mesh node.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DeviceId(String);

impl DeviceId {
    /// Create an identifier, rejecting empty or over-long values
    pub fn new(id: impl Into<String>) -> Result<Self, ParseError> {
        Self::validated(id.into(), "device id")
    }

    /// Random UUIDv4-based identifier for nodes without a stable hardware id
    pub fn random() -> Self {
        Self(Uuid::new_v4().to_string())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub(crate) fn validated(id: String, field: &'static str) -> Result<Self, ParseError> {
        if id.is_empty() {
            return Err(ParseError::InvalidDeviceId { field, reason: "empty" });
        }
        if id.len() > MAX_DEVICE_ID_LEN {
            return Err(ParseError::InvalidDeviceId { field, reason: "longer than 255 bytes" });
        }
        Ok(Self(id))
    }
}

impl fmt::Display for DeviceId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl AsRef<str> for DeviceId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

impl TryFrom<String> for DeviceId {
    type Error = ParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl TryFrom<&str> for DeviceId {
    type Error = ParseError;

    fn try_from(value: &str) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<DeviceId> for String {
    fn from(id: DeviceId) -> Self {
        id.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_rejects_empty_and_long_ids() {
        assert!(DeviceId::new("").is_err());
        assert!(DeviceId::new("x".repeat(256)).is_err());
        assert!(DeviceId::new("x".repeat(255)).is_ok());
    }

    #[test]
    fn test_random_ids_are_distinct() {
        assert_ne!(DeviceId::random(), DeviceId::random());
    }

    #[test]
    fn test_serde_validates() {
        let id: DeviceId = serde_json::from_str("\"node-1\"").unwrap();
        assert_eq!(id.as_str(), "node-1");
        assert!(serde_json::from_str::<DeviceId>("\"\"").is_err());
    }
}
