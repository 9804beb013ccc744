//! Node descriptors and credentials.
//!
//! A [`NodeDescriptor`] is the static description of one remote host. It is
//! loaded once by the caller and treated as read-only by everything else.

use std::collections::BTreeSet;
use std::fmt;

use serde::{Deserialize, Deserializer, Serialize};
use tracing::warn;

use crate::ids::NodeId;

/// Default remote-shell port.
pub const DEFAULT_SSH_PORT: u16 = 22;

/// Host names that refer to the machine running dockwarden.
const LOCAL_HOSTS: &[&str] = &["localhost", "127.0.0.1", "::1", "local"];

/// Static configuration for a managed node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeDescriptor {
    /// Unique node identifier.
    pub id: NodeId,
    /// Human-readable display name.
    pub name: String,
    /// Free-form tags used by callers for grouping.
    #[serde(default)]
    pub tags: BTreeSet<String>,
    /// Remote-shell address.
    #[serde(flatten)]
    pub address: NodeAddress,
    /// Name of the credential entry used to authenticate.
    #[serde(default)]
    pub credential_ref: Option<String>,
}

impl NodeDescriptor {
    /// Create a descriptor with the default port and no tags.
    #[must_use]
    pub fn new(
        id: NodeId,
        name: impl Into<String>,
        host: impl Into<String>,
        username: impl Into<String>,
    ) -> Self {
        Self {
            id,
            name: name.into(),
            tags: BTreeSet::new(),
            address: NodeAddress {
                host: host.into(),
                port: DEFAULT_SSH_PORT,
                username: username.into(),
            },
            credential_ref: None,
        }
    }

    /// Set the remote-shell port.
    #[must_use]
    pub fn with_port(mut self, port: u16) -> Self {
        self.address.port = port;
        self
    }

    /// Add a tag.
    #[must_use]
    pub fn with_tag(mut self, tag: impl Into<String>) -> Self {
        self.tags.insert(tag.into());
        self
    }

    /// Returns true if the node is the machine running dockwarden.
    #[must_use]
    pub fn is_local(&self) -> bool {
        LOCAL_HOSTS
            .iter()
            .any(|h| self.address.host.eq_ignore_ascii_case(h))
    }
}

/// Remote-shell address of a node.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeAddress {
    /// Host name or IP address.
    pub host: String,
    /// Remote-shell port, sanitized on load.
    #[serde(default = "default_port", deserialize_with = "deserialize_port")]
    pub port: u16,
    /// Login user.
    pub username: String,
}

impl NodeAddress {
    /// Return `user@host` for the remote-shell client.
    #[must_use]
    pub fn destination(&self) -> String {
        format!("{}@{}", self.username, self.host)
    }
}

const fn default_port() -> u16 {
    DEFAULT_SSH_PORT
}

#[derive(Deserialize)]
#[serde(untagged)]
enum RawPort {
    Number(i64),
    Text(String),
}

fn deserialize_port<'de, D>(deserializer: D) -> Result<u16, D::Error>
where
    D: Deserializer<'de>,
{
    let port = match RawPort::deserialize(deserializer)? {
        RawPort::Number(n) => sanitize_port(&n.to_string()),
        RawPort::Text(s) => sanitize_port(&s),
    };
    Ok(port)
}

/// Sanitize a port value coming from user configuration.
///
/// Anything other than a plain decimal number in `1..=65535` (after trimming
/// whitespace) falls back to [`DEFAULT_SSH_PORT`].
#[must_use]
pub fn sanitize_port(raw: &str) -> u16 {
    let trimmed = raw.trim();
    if !trimmed.is_empty() && trimmed.bytes().all(|b| b.is_ascii_digit()) {
        if let Ok(port) = trimmed.parse::<u16>() {
            if port != 0 {
                return port;
            }
        }
    }
    warn!(raw = %raw, default = DEFAULT_SSH_PORT, "Malformed port value, using default");
    DEFAULT_SSH_PORT
}

/// Authentication material for a node.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Credential {
    /// Password authentication.
    Password {
        /// The login password.
        password: String,
    },
    /// Private-key authentication.
    PrivateKey {
        /// PEM-encoded private key contents.
        key: String,
        /// Passphrase protecting the key, if any.
        #[serde(default)]
        passphrase: Option<String>,
    },
}

impl Credential {
    /// Create a password credential.
    #[must_use]
    pub fn password(password: impl Into<String>) -> Self {
        Self::Password {
            password: password.into(),
        }
    }

    /// Create a private-key credential.
    #[must_use]
    pub fn private_key(key: impl Into<String>, passphrase: Option<String>) -> Self {
        Self::PrivateKey {
            key: key.into(),
            passphrase,
        }
    }
}

impl fmt::Debug for Credential {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Password { .. } => f.write_str("Credential::Password(<redacted>)"),
            Self::PrivateKey { passphrase, .. } => write!(
                f,
                "Credential::PrivateKey(<redacted>, passphrase: {})",
                passphrase.is_some()
            ),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitize_port_accepts_numbers() {
        assert_eq!(sanitize_port("2222"), 2222);
        assert_eq!(sanitize_port(" 22 "), 22);
    }

    #[test]
    fn sanitize_port_rejects_punctuation() {
        assert_eq!(sanitize_port("22,"), DEFAULT_SSH_PORT);
        assert_eq!(sanitize_port("2;2"), DEFAULT_SSH_PORT);
        assert_eq!(sanitize_port("-1"), DEFAULT_SSH_PORT);
        assert_eq!(sanitize_port("0"), DEFAULT_SSH_PORT);
        assert_eq!(sanitize_port("70000"), DEFAULT_SSH_PORT);
        assert_eq!(sanitize_port(""), DEFAULT_SSH_PORT);
    }

    #[test]
    fn descriptor_port_from_string_or_number() {
        let node: NodeDescriptor = toml::from_str(
            r#"
            id = "n1"
            name = "Node 1"
            host = "10.0.0.1"
            port = "2200"
            username = "ops"
            "#,
        )
        .unwrap();
        assert_eq!(node.address.port, 2200);

        let node: NodeDescriptor = toml::from_str(
            r#"
            id = "n1"
            name = "Node 1"
            host = "10.0.0.1"
            port = "22:"
            username = "ops"
            "#,
        )
        .unwrap();
        assert_eq!(node.address.port, DEFAULT_SSH_PORT);

        let node: NodeDescriptor = toml::from_str(
            r#"
            id = "n1"
            name = "Node 1"
            host = "10.0.0.1"
            port = 2022
            username = "ops"
            "#,
        )
        .unwrap();
        assert_eq!(node.address.port, 2022);
    }

    #[test]
    fn descriptor_local_detection() {
        let id = NodeId::new("local").unwrap();
        assert!(NodeDescriptor::new(id.clone(), "L", "localhost", "me").is_local());
        assert!(NodeDescriptor::new(id.clone(), "L", "127.0.0.1", "me").is_local());
        assert!(!NodeDescriptor::new(id, "R", "10.1.1.1", "me").is_local());
    }

    #[test]
    fn credential_debug_is_redacted() {
        let cred = Credential::password("hunter2");
        assert!(!format!("{cred:?}").contains("hunter2"));

        let cred = Credential::private_key("-----BEGIN KEY-----", Some("pp".into()));
        let debug = format!("{cred:?}");
        assert!(!debug.contains("BEGIN"));
        assert!(debug.contains("passphrase: true"));
    }

    #[test]
    fn destination_format() {
        let node = NodeDescriptor::new(NodeId::new("n1").unwrap(), "N", "host.example", "deploy");
        assert_eq!(node.address.destination(), "deploy@host.example");
    }
}
