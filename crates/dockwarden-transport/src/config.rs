//! Transport configuration.

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};

/// Settings for opening and using a node transport.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    /// Remote-shell client binary.
    #[serde(default = "TransportConfig::default_ssh_binary")]
    pub ssh_binary: String,

    /// Helper used to feed passwords and key passphrases to the client.
    #[serde(default = "TransportConfig::default_sshpass_binary")]
    pub sshpass_binary: String,

    /// Bounded time for the remote-shell session to become ready.
    #[serde(default = "TransportConfig::default_ready_timeout_secs")]
    pub ready_timeout_secs: u64,

    /// Keep-alive probe interval on the session.
    #[serde(default = "TransportConfig::default_keepalive_interval_secs")]
    pub keepalive_interval_secs: u64,

    /// Unanswered keep-alives before the session is declared dead.
    #[serde(default = "TransportConfig::default_keepalive_count")]
    pub keepalive_count: u32,

    /// Upper bound on a single remote command.
    #[serde(default = "TransportConfig::default_command_timeout_secs")]
    pub command_timeout_secs: u64,

    /// Host-key policy passed as `StrictHostKeyChecking`.
    #[serde(default = "TransportConfig::default_host_key_checking")]
    pub host_key_checking: String,

    /// Engine CLI binary on the remote host.
    #[serde(default = "TransportConfig::default_engine_binary")]
    pub engine_binary: String,

    /// Engine API socket on the remote (or local) host.
    #[serde(default = "TransportConfig::default_engine_socket")]
    pub engine_socket: PathBuf,

    /// Disable the API tunnel and always use shell-exec.
    #[serde(default)]
    pub shell_only: bool,
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            ssh_binary: Self::default_ssh_binary(),
            sshpass_binary: Self::default_sshpass_binary(),
            ready_timeout_secs: Self::default_ready_timeout_secs(),
            keepalive_interval_secs: Self::default_keepalive_interval_secs(),
            keepalive_count: Self::default_keepalive_count(),
            command_timeout_secs: Self::default_command_timeout_secs(),
            host_key_checking: Self::default_host_key_checking(),
            engine_binary: Self::default_engine_binary(),
            engine_socket: Self::default_engine_socket(),
            shell_only: false,
        }
    }
}

impl TransportConfig {
    fn default_ssh_binary() -> String {
        "ssh".to_string()
    }

    fn default_sshpass_binary() -> String {
        "sshpass".to_string()
    }

    const fn default_ready_timeout_secs() -> u64 {
        20
    }

    const fn default_keepalive_interval_secs() -> u64 {
        15
    }

    const fn default_keepalive_count() -> u32 {
        3
    }

    const fn default_command_timeout_secs() -> u64 {
        120
    }

    fn default_host_key_checking() -> String {
        "accept-new".to_string()
    }

    fn default_engine_binary() -> String {
        "docker".to_string()
    }

    fn default_engine_socket() -> PathBuf {
        PathBuf::from("/var/run/docker.sock")
    }

    /// Session ready timeout.
    #[must_use]
    pub const fn ready_timeout(&self) -> Duration {
        Duration::from_secs(self.ready_timeout_secs)
    }

    /// Per-command timeout.
    #[must_use]
    pub const fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    /// Command that turns the remote shell channel into a raw engine API pipe.
    #[must_use]
    pub fn dial_command(&self) -> String {
        format!("{} system dial-stdio", self.engine_binary)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn defaults_apply_to_partial_config() {
        let config: TransportConfig =
            serde_json::from_str(r#"{ "command_timeout_secs": 5 }"#).unwrap();
        assert_eq!(config.command_timeout(), Duration::from_secs(5));
        assert_eq!(config.ready_timeout(), Duration::from_secs(20));
        assert_eq!(config.engine_binary, "docker");
        assert_eq!(config.dial_command(), "docker system dial-stdio");
        assert!(!config.shell_only);
    }
}
