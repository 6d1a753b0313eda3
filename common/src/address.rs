//! Agent addresses
//!
//! The ledger lowercases addresses at its boundary: callers may submit any
//! case, storage and equality are lowercase. Structural validation of the
//! address format belongs to the surrounding platform, not this core.

use std::fmt;

use serde::{de, Deserialize, Deserializer, Serialize, Serializer};
use thiserror::Error;

#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum AddressError {
    #[error("agent address is empty")]
    Empty,
}

/// A normalized (lowercased, trimmed) agent address
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct AgentAddr(String);

impl AgentAddr {
    pub fn new(raw: &str) -> Result<Self, AddressError> {
        let normalized = raw.trim().to_lowercase();
        if normalized.is_empty() {
            return Err(AddressError::Empty);
        }
        Ok(Self(normalized))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn into_string(self) -> String {
        self.0
    }
}

impl fmt::Display for AgentAddr {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl Serialize for AgentAddr {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.0)
    }
}

impl<'de> Deserialize<'de> for AgentAddr {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = String::deserialize(deserializer)?;
        AgentAddr::new(&raw).map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_lowercases_and_trims() {
        let addr = AgentAddr::new("  0xBuYeR ").unwrap();
        assert_eq!(addr.as_str(), "0xbuyer");
    }

    #[test]
    fn test_case_insensitive_equality() {
        assert_eq!(
            AgentAddr::new("0xABC").unwrap(),
            AgentAddr::new("0xabc").unwrap()
        );
    }

    #[test]
    fn test_rejects_empty() {
        assert!(matches!(AgentAddr::new("   "), Err(AddressError::Empty)));
    }
}
