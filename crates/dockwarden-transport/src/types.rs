//! Shared transport types.

use std::pin::Pin;
use std::sync::Arc;

use futures::Stream;
use serde::{Deserialize, Serialize};
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;

use crate::error::Result;

/// A stream of raw byte chunks from a long-lived remote feed.
pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Vec<u8>>> + Send>>;

/// A bidirectional byte channel (a remote process's stdin/stdout, or a socket).
pub trait DuplexIo: AsyncRead + AsyncWrite + Unpin + Send {}

impl<T: AsyncRead + AsyncWrite + Unpin + Send> DuplexIo for T {}

/// How engine operations are currently carried to a node.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "kebab-case")]
pub enum TransportMode {
    /// Engine HTTP API over a tunnel through the remote-shell session.
    ApiTunnel,
    /// Discrete engine CLI commands over the remote shell.
    ShellExec,
    /// No transport is open.
    #[default]
    Unknown,
}

impl TransportMode {
    /// Kebab-case name of the mode.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::ApiTunnel => "api-tunnel",
            Self::ShellExec => "shell-exec",
            Self::Unknown => "unknown",
        }
    }
}

impl std::fmt::Display for TransportMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Captured result of a remote command.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct CommandOutput {
    /// Standard output.
    pub stdout: String,
    /// Standard error.
    pub stderr: String,
    /// Exit status, `None` if the process was killed by a signal.
    pub exit_code: Option<i32>,
}

impl CommandOutput {
    /// Build a successful output with the given stdout.
    #[must_use]
    pub fn ok(stdout: impl Into<String>) -> Self {
        Self {
            stdout: stdout.into(),
            stderr: String::new(),
            exit_code: Some(0),
        }
    }

    /// Build a failed output.
    #[must_use]
    pub fn failed(exit_code: i32, stderr: impl Into<String>) -> Self {
        Self {
            stdout: String::new(),
            stderr: stderr.into(),
            exit_code: Some(exit_code),
        }
    }

    /// Returns true if the command exited with status 0.
    #[must_use]
    pub fn success(&self) -> bool {
        self.exit_code == Some(0)
    }
}

/// Options for a single command execution.
#[derive(Debug, Clone, Default)]
pub struct ExecOptions {
    /// Return the output as-is instead of raising on failure.
    pub raw: bool,
    /// Bytes written to the command's standard input.
    pub stdin: Option<Vec<u8>>,
}

impl ExecOptions {
    /// Raw exit-code semantics: non-zero exits are returned, not raised.
    #[must_use]
    pub fn raw() -> Self {
        Self {
            raw: true,
            stdin: None,
        }
    }

    /// Feed the given bytes to the command's standard input.
    #[must_use]
    pub fn with_stdin(mut self, stdin: impl Into<Vec<u8>>) -> Self {
        self.stdin = Some(stdin.into());
        self
    }
}

/// Filter applied to the engine event feed.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EventFilter {
    /// Object types to receive (`container`, `image`, ...).
    pub types: Vec<String>,
}

impl Default for EventFilter {
    fn default() -> Self {
        Self {
            types: vec!["container".to_string()],
        }
    }
}

impl EventFilter {
    /// Encode as the JSON `filters` query parameter of the engine API.
    #[must_use]
    pub fn to_api_query(&self) -> String {
        let filters = serde_json::json!({ "type": self.types });
        urlencoding::encode(&filters.to_string()).into_owned()
    }

    /// Encode as engine CLI `--filter` arguments.
    #[must_use]
    pub fn to_cli_args(&self) -> String {
        self.types
            .iter()
            .map(|t| format!("--filter type={t}"))
            .collect::<Vec<_>>()
            .join(" ")
    }
}

/// Cancels the active event stream of a transport.
#[derive(Debug, Clone)]
pub struct StreamCancel {
    tx: Arc<watch::Sender<bool>>,
}

impl StreamCancel {
    pub(crate) fn new() -> (Self, watch::Receiver<bool>) {
        let (tx, rx) = watch::channel(false);
        (Self { tx: Arc::new(tx) }, rx)
    }

    /// Stop the stream. Idempotent.
    pub fn cancel(&self) {
        self.tx.send_replace(true);
    }

    /// Returns true once `cancel` has been called.
    #[must_use]
    pub fn is_cancelled(&self) -> bool {
        *self.tx.borrow()
    }
}

/// Result of asking a transport for its event stream.
pub enum StreamOpen {
    /// A new stream was opened.
    Opened {
        /// Raw event chunks.
        events: ByteStream,
        /// Handle that ends the stream.
        cancel: StreamCancel,
    },
    /// A stream is already running; its cancel handle is returned.
    AlreadyActive(StreamCancel),
}

impl std::fmt::Debug for StreamOpen {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Opened { .. } => f.write_str("StreamOpen::Opened"),
            Self::AlreadyActive(_) => f.write_str("StreamOpen::AlreadyActive"),
        }
    }
}
