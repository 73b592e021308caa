//! Operation identifier
//!
//! Ids are assigned once by whichever side initiates an Execute and are
//! reused verbatim on every message of that exchange.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Integer id correlating all messages belonging to one logical operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct OperationId(u32);

impl OperationId {
    /// Create from a raw id
    pub const fn new(id: u32) -> Self {
        Self(id)
    }

    /// Get the raw id
    pub const fn as_u32(&self) -> u32 {
        self.0
    }

    /// Parse from string representation
    pub fn parse(s: &str) -> Result<Self, String> {
        s.parse::<u32>()
            .map(Self)
            .map_err(|e| format!("Invalid operation ID '{}': {}", s, e))
    }
}

impl fmt::Display for OperationId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl From<u32> for OperationId {
    fn from(id: u32) -> Self {
        Self(id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_and_display() {
        let id = OperationId::parse("42").unwrap();
        assert_eq!(id, OperationId::new(42));
        assert_eq!(id.to_string(), "42");
    }

    #[test]
    fn test_parse_rejects_garbage() {
        assert!(OperationId::parse("-1").is_err());
        assert!(OperationId::parse("op-7").is_err());
    }

    #[test]
    fn test_ordering_follows_raw_id() {
        assert!(OperationId::new(1) < OperationId::new(2));
    }
}
