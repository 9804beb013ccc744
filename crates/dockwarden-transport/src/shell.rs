//! Remote shell abstraction.
//!
//! A [`RemoteShell`] runs commands on a node. It is implemented by the SSH
//! control-master session for remote nodes and by a plain local shell for
//! the machine dockwarden runs on.

use std::pin::Pin;
use std::process::Stdio;
use std::task::{Context, Poll};
use std::time::Duration;

use async_trait::async_trait;
use futures::stream;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, ReadBuf};
use tokio::process::{Child, ChildStderr, ChildStdin, ChildStdout, Command};
use tracing::{debug, trace};

use crate::error::{Result, TransportError};
use crate::types::{ByteStream, CommandOutput, DuplexIo, ExecOptions};

/// Stderr fragments that mark a command as failed even with exit status 0.
const ERROR_MARKERS: &[&str] = &[
    "Error response from daemon",
    "Cannot connect to the Docker daemon",
    "error during connect",
    "permission denied while trying to connect",
];

/// Exit status the SSH client reports for its own failures.
const SSH_CLIENT_FAILURE: i32 = 255;

/// Command execution on a node.
#[async_trait]
pub trait RemoteShell: Send + Sync {
    /// Short label for logs (`user@host:port` or `local`).
    fn label(&self) -> &str;

    /// Run a command to completion and capture its output.
    ///
    /// Only session-level problems are errors; the exit status is returned
    /// as-is. Use [`check_output`] to apply failure semantics.
    async fn run(&self, command: &str, stdin: Option<&[u8]>) -> Result<CommandOutput>;

    /// Start a long-running command and stream its standard output.
    async fn stream(&self, command: &str) -> Result<ByteStream>;

    /// Start a command and return its stdin/stdout as a byte channel.
    async fn open_channel(&self, command: &str) -> Result<Box<dyn DuplexIo>>;

    /// Re-establish the session after a channel failure.
    async fn reconnect(&self) -> Result<()>;

    /// Tear the session down.
    async fn close(&self);

    /// Resolves when the session has ended.
    async fn closed(&self);
}

/// Apply failure semantics to a command's output.
///
/// Unless `options.raw` is set, a non-zero exit or an error marker on
/// stderr becomes [`TransportError::Command`]. SSH client failures are
/// classified with [`classify_ssh_failure`] regardless of `raw`.
///
/// # Errors
///
/// Returns an error if the command failed and raw semantics were not requested.
pub fn check_output(command: &str, output: CommandOutput, options: &ExecOptions) -> Result<CommandOutput> {
    if output.exit_code == Some(SSH_CLIENT_FAILURE) {
        if let Some(err) = classify_ssh_failure(&output.stderr) {
            return Err(err);
        }
    }
    if options.raw {
        return Ok(output);
    }
    let marked = ERROR_MARKERS.iter().any(|m| output.stderr.contains(m));
    if output.success() && !marked {
        return Ok(output);
    }
    Err(TransportError::Command {
        command: command.to_string(),
        exit_code: output.exit_code,
        stderr: output.stderr.trim().to_string(),
    })
}

/// Classify SSH client diagnostics.
///
/// Returns `None` when the text does not look like a session-level failure
/// (the remote command itself may have exited with 255).
#[must_use]
pub fn classify_ssh_failure(stderr: &str) -> Option<TransportError> {
    const AUTH: &[&str] = &[
        "Permission denied",
        "Authentication failed",
        "Too many authentication failures",
        "incorrect passphrase",
    ];
    const CHANNEL: &[&str] = &[
        "channel open failed",
        "open failed",
        "session request failed",
        "mux_client",
        "Control socket",
        "master is not running",
        "Connection closed",
        "Broken pipe",
        "Connection reset",
    ];
    const CONNECT: &[&str] = &[
        "Connection refused",
        "Connection timed out",
        "No route to host",
        "Could not resolve hostname",
        "Host key verification failed",
        "kex_exchange_identification",
    ];

    let text = stderr.trim();
    let message = || text.lines().last().unwrap_or(text).to_string();
    if AUTH.iter().any(|m| text.contains(m)) {
        Some(TransportError::Auth(message()))
    } else if CHANNEL.iter().any(|m| text.contains(m)) {
        Some(TransportError::Channel(message()))
    } else if CONNECT.iter().any(|m| text.contains(m)) {
        Some(TransportError::Connect(message()))
    } else {
        None
    }
}

/// Quote a string for a POSIX shell.
#[must_use]
pub fn shell_quote(arg: &str) -> String {
    if !arg.is_empty()
        && arg
            .bytes()
            .all(|b| b.is_ascii_alphanumeric() || b"-_./:=@,+%".contains(&b))
    {
        return arg.to_string();
    }
    format!("'{}'", arg.replace('\'', r"'\''"))
}

/// Join arguments into a quoted shell command line.
#[must_use]
pub fn shell_join<S: AsRef<str>>(args: &[S]) -> String {
    args.iter()
        .map(|a| shell_quote(a.as_ref()))
        .collect::<Vec<_>>()
        .join(" ")
}

/// Run a prepared command with an optional stdin payload and a timeout.
pub(crate) async fn run_child(mut cmd: Command, stdin: Option<&[u8]>, timeout: Duration) -> Result<CommandOutput> {
    cmd.stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let mut child = cmd.spawn()?;
    if let (Some(input), Some(mut pipe)) = (stdin, child.stdin.take()) {
        pipe.write_all(input).await?;
        pipe.shutdown().await?;
    }

    let output = tokio::time::timeout(timeout, child.wait_with_output())
        .await
        .map_err(|_| TransportError::Timeout(timeout))??;

    Ok(CommandOutput {
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr).into_owned(),
        exit_code: output.status.code(),
    })
}

struct StreamState {
    child: Child,
    stdout: ChildStdout,
    stderr: Option<ChildStderr>,
    label: String,
    done: bool,
}

/// Turn a spawned child's stdout into a [`ByteStream`].
///
/// When the output ends with a failed exit status, one final error item is
/// yielded.
pub(crate) fn child_stream(mut cmd: Command, label: String) -> Result<ByteStream> {
    cmd.stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    let mut child = cmd.spawn()?;
    let stdout = child
        .stdout
        .take()
        .ok_or_else(|| TransportError::Channel("stream stdout unavailable".into()))?;
    let stderr = child.stderr.take();

    let state = StreamState {
        child,
        stdout,
        stderr,
        label,
        done: false,
    };

    let events = stream::unfold(state, |mut state| async move {
        if state.done {
            return None;
        }
        let mut buf = vec![0u8; 8192];
        match state.stdout.read(&mut buf).await {
            Ok(0) => {
                state.done = true;
                let mut diagnostics = String::new();
                if let Some(mut stderr) = state.stderr.take() {
                    let _ = stderr.read_to_string(&mut diagnostics).await;
                }
                let status = state.child.wait().await.ok().and_then(|s| s.code());
                trace!(label = %state.label, ?status, "Stream process exited");
                match status {
                    Some(0) => None,
                    code => {
                        let err = classify_ssh_failure(&diagnostics).unwrap_or_else(|| {
                            TransportError::Command {
                                command: state.label.clone(),
                                exit_code: code,
                                stderr: diagnostics.trim().to_string(),
                            }
                        });
                        Some((Err(err), state))
                    }
                }
            }
            Ok(n) => {
                buf.truncate(n);
                Some((Ok(buf), state))
            }
            Err(e) => {
                state.done = true;
                Some((Err(TransportError::Channel(e.to_string())), state))
            }
        }
    });

    Ok(Box::pin(events))
}

/// A child process's stdin/stdout exposed as one duplex channel.
///
/// The process is killed when the channel is dropped.
pub(crate) struct ChildIo {
    _child: Child,
    stdout: ChildStdout,
    stdin: ChildStdin,
}

impl ChildIo {
    pub(crate) fn spawn(mut cmd: Command) -> Result<Self> {
        cmd.stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::null())
            .kill_on_drop(true);
        let mut child = cmd.spawn()?;
        let stdout = child
            .stdout
            .take()
            .ok_or_else(|| TransportError::Channel("channel stdout unavailable".into()))?;
        let stdin = child
            .stdin
            .take()
            .ok_or_else(|| TransportError::Channel("channel stdin unavailable".into()))?;
        Ok(Self {
            _child: child,
            stdout,
            stdin,
        })
    }
}

impl AsyncRead for ChildIo {
    fn poll_read(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &mut ReadBuf<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().stdout).poll_read(cx, buf)
    }
}

impl AsyncWrite for ChildIo {
    fn poll_write(self: Pin<&mut Self>, cx: &mut Context<'_>, buf: &[u8]) -> Poll<std::io::Result<usize>> {
        Pin::new(&mut self.get_mut().stdin).poll_write(cx, buf)
    }

    fn poll_flush(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().stdin).poll_flush(cx)
    }

    fn poll_shutdown(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<std::io::Result<()>> {
        Pin::new(&mut self.get_mut().stdin).poll_shutdown(cx)
    }
}

/// Shell on the machine running dockwarden.
#[derive(Debug, Clone)]
pub struct LocalShell {
    timeout: Duration,
}

impl LocalShell {
    /// Create a local shell with the given per-command timeout.
    #[must_use]
    pub const fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    fn command(command: &str) -> Command {
        let mut cmd = Command::new("sh");
        cmd.arg("-c").arg(command);
        cmd
    }
}

#[async_trait]
impl RemoteShell for LocalShell {
    fn label(&self) -> &str {
        "local"
    }

    async fn run(&self, command: &str, stdin: Option<&[u8]>) -> Result<CommandOutput> {
        debug!(command, "Running local command");
        run_child(Self::command(command), stdin, self.timeout).await
    }

    async fn stream(&self, command: &str) -> Result<ByteStream> {
        child_stream(Self::command(command), command.to_string())
    }

    async fn open_channel(&self, command: &str) -> Result<Box<dyn DuplexIo>> {
        Ok(Box::new(ChildIo::spawn(Self::command(command))?))
    }

    async fn reconnect(&self) -> Result<()> {
        Ok(())
    }

    async fn close(&self) {}

    async fn closed(&self) {
        std::future::pending::<()>().await;
    }
}
