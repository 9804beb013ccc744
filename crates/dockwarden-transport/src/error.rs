//! Error types for the transport crate.

use std::time::Duration;

use thiserror::Error;

/// Errors that can occur while talking to a remote node.
#[derive(Error, Debug)]
pub enum TransportError {
    /// A channel on the remote-shell session could not be used
    /// (channel open failure, session ended mid-command).
    #[error("channel error: {0}")]
    Channel(String),

    /// The remote host rejected the credentials.
    #[error("authentication failed: {0}")]
    Auth(String),

    /// The remote-shell session could not be established.
    #[error("connection failed: {0}")]
    Connect(String),

    /// The engine API tunnel is not usable.
    #[error("engine API unavailable: {0}")]
    ApiUnavailable(String),

    /// A remote command exited unsuccessfully.
    #[error("command `{command}` failed (exit {exit_code:?}): {stderr}")]
    Command {
        /// The command that was run.
        command: String,
        /// Exit status, if the command ran to completion.
        exit_code: Option<i32>,
        /// Captured standard error.
        stderr: String,
    },

    /// The engine answered with an error status.
    #[error("engine error ({status}): {message}")]
    Engine {
        /// HTTP-style status code.
        status: u16,
        /// Engine error message.
        message: String,
    },

    /// The requested object does not exist on the engine.
    #[error("not found: {0}")]
    NotFound(String),

    /// Engine output could not be interpreted.
    #[error("invalid engine output: {0}")]
    Parse(String),

    /// JSON encoding or decoding failed.
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// Local I/O failed (spawning the remote-shell client, temp files).
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The operation did not finish in time.
    #[error("timed out after {0:?}")]
    Timeout(Duration),

    /// The transport has been closed.
    #[error("transport closed")]
    Closed,

    /// The operation is not available in the current transport mode.
    #[error("unsupported operation: {0}")]
    Unsupported(String),
}

impl TransportError {
    /// Check if this is a transient channel-level error that warrants one
    /// silent reconnect-and-retry.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(self, Self::Channel(_))
    }

    /// Check if this error means the engine API tunnel is unusable.
    #[must_use]
    pub const fn is_api_unavailable(&self) -> bool {
        matches!(self, Self::ApiUnavailable(_))
    }

    /// Check if this is an authentication failure.
    #[must_use]
    pub const fn is_auth(&self) -> bool {
        matches!(self, Self::Auth(_))
    }

    /// Check if this error indicates the remote session itself is gone.
    #[must_use]
    pub const fn is_session_lost(&self) -> bool {
        matches!(self, Self::Channel(_) | Self::Closed | Self::Connect(_))
    }

    /// Check if this error is retriable by the connection lifecycle.
    #[must_use]
    pub const fn is_retriable(&self) -> bool {
        matches!(
            self,
            Self::Channel(_) | Self::Connect(_) | Self::Timeout(_) | Self::Closed | Self::Auth(_)
        )
    }

    /// Build an engine error from a status code and a response body.
    ///
    /// The engine reports errors as `{"message": "..."}`; other bodies are
    /// used verbatim.
    #[must_use]
    pub fn from_engine_response(status: u16, body: &[u8]) -> Self {
        let message = serde_json::from_slice::<serde_json::Value>(body)
            .ok()
            .and_then(|v| v.get("message").and_then(|m| m.as_str()).map(str::to_string))
            .unwrap_or_else(|| String::from_utf8_lossy(body).trim().to_string());

        if status == 404 {
            Self::NotFound(message)
        } else {
            Self::Engine { status, message }
        }
    }
}

/// A specialized Result type for transport operations.
pub type Result<T> = std::result::Result<T, TransportError>;
