//! Core identifier types for dockwarden.
//!
//! Node IDs are operator-chosen slugs from the fleet configuration. Container
//! IDs are whatever the remote engine reports; they are kept verbatim so the
//! same value can be passed back to the engine.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Maximum length of a node identifier.
const MAX_NODE_ID_LEN: usize = 64;

/// Length of the abbreviated container ID used in logs and display.
const SHORT_CONTAINER_ID_LEN: usize = 12;

/// A node identifier.
///
/// Node IDs must be 1-64 characters of ASCII alphanumerics, `-`, `_` or `.`.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct NodeId(String);

impl NodeId {
    /// Create a validated `NodeId`.
    ///
    /// # Errors
    ///
    /// Returns an error if the ID is empty, too long, or contains characters
    /// outside `[A-Za-z0-9_.-]`.
    pub fn new(id: impl Into<String>) -> Result<Self, IdError> {
        let id = id.into();
        if id.is_empty() {
            return Err(IdError::Empty);
        }
        if id.len() > MAX_NODE_ID_LEN {
            return Err(IdError::TooLong {
                max: MAX_NODE_ID_LEN,
                got: id.len(),
            });
        }
        if let Some(c) = id
            .chars()
            .find(|c| !(c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.')))
        {
            return Err(IdError::InvalidChar(c));
        }
        Ok(Self(id))
    }

    /// Return the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "NodeId({})", self.0)
    }
}

impl fmt::Display for NodeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for NodeId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for NodeId {
    type Error = IdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<NodeId> for String {
    fn from(id: NodeId) -> Self {
        id.0
    }
}

impl AsRef<str> for NodeId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// A container identifier as reported by the engine.
#[derive(Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct ContainerId(String);

impl ContainerId {
    /// Create a `ContainerId` from an engine-reported value.
    ///
    /// # Errors
    ///
    /// Returns an error if the value is empty or contains whitespace.
    pub fn new(id: impl Into<String>) -> Result<Self, IdError> {
        let id = id.into();
        if id.is_empty() {
            return Err(IdError::Empty);
        }
        if let Some(c) = id.chars().find(|c| c.is_whitespace()) {
            return Err(IdError::InvalidChar(c));
        }
        Ok(Self(id))
    }

    /// Return the identifier as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }

    /// Return the abbreviated 12-character form used by the engine CLI.
    #[must_use]
    pub fn short(&self) -> &str {
        let end = self
            .0
            .char_indices()
            .nth(SHORT_CONTAINER_ID_LEN)
            .map_or(self.0.len(), |(i, _)| i);
        &self.0[..end]
    }

    /// Check whether `other` names this container by full or abbreviated ID.
    #[must_use]
    pub fn matches(&self, other: &str) -> bool {
        !other.is_empty() && (self.0 == other || self.0.starts_with(other) || other.starts_with(&self.0))
    }
}

impl fmt::Debug for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ContainerId({})", self.short())
    }
}

impl fmt::Display for ContainerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for ContainerId {
    type Err = IdError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::new(s)
    }
}

impl TryFrom<String> for ContainerId {
    type Error = IdError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        Self::new(value)
    }
}

impl From<ContainerId> for String {
    fn from(id: ContainerId) -> Self {
        id.0
    }
}

impl AsRef<str> for ContainerId {
    fn as_ref(&self) -> &str {
        &self.0
    }
}

/// Errors that can occur when parsing identifiers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum IdError {
    /// The identifier was empty.
    #[error("identifier is empty")]
    Empty,

    /// The identifier exceeds the maximum length.
    #[error("identifier too long: max {max}, got {got}")]
    TooLong {
        /// Maximum allowed length.
        max: usize,
        /// Actual length.
        got: usize,
    },

    /// The identifier contains a character that is not allowed.
    #[error("invalid character {0:?} in identifier")]
    InvalidChar(char),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn node_id_accepts_slugs() {
        let id = NodeId::new("edge-01.eu_west").unwrap();
        assert_eq!(id.as_str(), "edge-01.eu_west");
        assert_eq!(id.to_string(), "edge-01.eu_west");
    }

    #[test]
    fn node_id_rejects_empty() {
        assert_eq!(NodeId::new(""), Err(IdError::Empty));
    }

    #[test]
    fn node_id_rejects_spaces_and_punctuation() {
        assert_eq!(NodeId::new("edge 01"), Err(IdError::InvalidChar(' ')));
        assert_eq!(NodeId::new("edge/01"), Err(IdError::InvalidChar('/')));
    }

    #[test]
    fn node_id_rejects_long_ids() {
        let long = "n".repeat(65);
        assert!(matches!(NodeId::new(long), Err(IdError::TooLong { max: 64, got: 65 })));
    }

    #[test]
    fn node_id_serde_validates() {
        let id: NodeId = serde_json::from_str("\"n1\"").unwrap();
        assert_eq!(id.as_str(), "n1");
        assert!(serde_json::from_str::<NodeId>("\"bad id\"").is_err());
    }

    #[test]
    fn container_id_short_form() {
        let id = ContainerId::new("0123456789abcdef0123").unwrap();
        assert_eq!(id.short(), "0123456789ab");

        let tiny = ContainerId::new("abc").unwrap();
        assert_eq!(tiny.short(), "abc");
    }

    #[test]
    fn container_id_matches_prefixes() {
        let id = ContainerId::new("0123456789abcdef").unwrap();
        assert!(id.matches("0123456789abcdef"));
        assert!(id.matches("0123456789ab"));
        assert!(!id.matches("fedcba"));
        assert!(!id.matches(""));
    }

    #[test]
    fn container_id_rejects_whitespace() {
        assert_eq!(ContainerId::new("ab cd"), Err(IdError::InvalidChar(' ')));
    }
}
