//! SSH control-master session.
//!
//! One master connection per node is kept open with keep-alives. Commands,
//! streams and the engine API tunnel all run as multiplexed channels over
//! the master's control socket, so authentication happens exactly once.

use std::fs::OpenOptions;
use std::io::Write;
use std::os::unix::fs::OpenOptionsExt;
use std::path::PathBuf;
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dockwarden_core::{Credential, NodeDescriptor};
use tempfile::TempDir;
use tokio::io::AsyncReadExt;
use tokio::process::Command;
use tokio::sync::{oneshot, watch, Mutex};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::config::TransportConfig;
use crate::error::{Result, TransportError};
use crate::shell::{child_stream, classify_ssh_failure, run_child, ChildIo, RemoteShell};
use crate::types::{ByteStream, CommandOutput, DuplexIo};

const READY_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// `sshpass` exit status for a rejected password.
const SSHPASS_BAD_PASSWORD: i32 = 5;
/// `sshpass` exit status for an unknown host key.
const SSHPASS_HOST_KEY_UNKNOWN: i32 = 6;

enum SshAuth {
    Password(String),
    Key {
        path: PathBuf,
        passphrase: Option<String>,
    },
}

struct Master {
    stop: oneshot::Sender<()>,
    task: JoinHandle<()>,
}

/// A remote shell backed by an SSH control-master session.
pub struct SshShell {
    label: String,
    destination: String,
    port: u16,
    auth: SshAuth,
    config: TransportConfig,
    control_path: PathBuf,
    // Holds the control socket and key file; removed on drop.
    _workdir: TempDir,
    master: Mutex<Option<Master>>,
    alive: Arc<watch::Sender<bool>>,
}

impl SshShell {
    /// Open a session to `node`.
    ///
    /// # Errors
    ///
    /// Returns [`TransportError::Auth`] if the credentials are rejected,
    /// [`TransportError::Timeout`] if the session is not ready within the
    /// configured ready timeout, or [`TransportError::Connect`] otherwise.
    pub async fn connect(node: &NodeDescriptor, credential: &Credential, config: TransportConfig) -> Result<Self> {
        let workdir = tempfile::Builder::new().prefix("dockwarden-").tempdir()?;
        let control_path = workdir.path().join("ctl");

        let auth = match credential {
            Credential::Password { password } => SshAuth::Password(password.clone()),
            Credential::PrivateKey { key, passphrase } => {
                let path = workdir.path().join("id_key");
                write_key_file(&path, key)?;
                SshAuth::Key {
                    path,
                    passphrase: passphrase.clone(),
                }
            }
        };

        let (alive, _) = watch::channel(false);
        let shell = Self {
            label: format!("{}:{}", node.address.destination(), node.address.port),
            destination: node.address.destination(),
            port: node.address.port,
            auth,
            config,
            control_path,
            _workdir: workdir,
            master: Mutex::new(None),
            alive: Arc::new(alive),
        };

        let master = shell.start_master().await?;
        *shell.master.lock().await = Some(master);
        Ok(shell)
    }

    fn common_args(&self, cmd: &mut Command) {
        cmd.arg("-S")
            .arg(&self.control_path)
            .arg("-p")
            .arg(self.port.to_string())
            .arg("-o")
            .arg(format!("ServerAliveInterval={}", self.config.keepalive_interval_secs))
            .arg("-o")
            .arg(format!("ServerAliveCountMax={}", self.config.keepalive_count))
            .arg("-o")
            .arg(format!("ConnectTimeout={}", self.config.ready_timeout_secs))
            .arg("-o")
            .arg(format!("StrictHostKeyChecking={}", self.config.host_key_checking))
            .arg("-o")
            .arg("LogLevel=ERROR");
    }

    fn master_command(&self) -> Command {
        let mut cmd = match &self.auth {
            SshAuth::Password(password) => {
                let mut cmd = Command::new(&self.config.sshpass_binary);
                cmd.arg("-e").arg(&self.config.ssh_binary).env("SSHPASS", password);
                cmd
            }
            SshAuth::Key {
                passphrase: Some(passphrase),
                ..
            } => {
                let mut cmd = Command::new(&self.config.sshpass_binary);
                cmd.arg("-P")
                    .arg("passphrase")
                    .arg("-e")
                    .arg(&self.config.ssh_binary)
                    .env("SSHPASS", passphrase);
                cmd
            }
            SshAuth::Key { passphrase: None, .. } => Command::new(&self.config.ssh_binary),
        };

        cmd.arg("-M").arg("-N");
        self.common_args(&mut cmd);
        cmd.arg("-o").arg("ControlPersist=no");

        match &self.auth {
            SshAuth::Password(_) => {
                cmd.arg("-o")
                    .arg("PreferredAuthentications=password,keyboard-interactive")
                    .arg("-o")
                    .arg("PubkeyAuthentication=no")
                    .arg("-o")
                    .arg("NumberOfPasswordPrompts=1");
            }
            SshAuth::Key { path, passphrase } => {
                cmd.arg("-i").arg(path).arg("-o").arg("IdentitiesOnly=yes");
                if passphrase.is_none() {
                    cmd.arg("-o").arg("BatchMode=yes");
                }
            }
        }
        cmd.arg(&self.destination);
        cmd
    }

    fn channel_command(&self, remote: &str) -> Command {
        let mut cmd = Command::new(&self.config.ssh_binary);
        self.common_args(&mut cmd);
        cmd.arg("-o")
            .arg("ControlMaster=no")
            .arg("-o")
            .arg("BatchMode=yes")
            .arg(&self.destination)
            .arg(remote);
        cmd
    }

    async fn master_ready(&self) -> bool {
        let mut cmd = Command::new(&self.config.ssh_binary);
        cmd.arg("-S")
            .arg(&self.control_path)
            .arg("-O")
            .arg("check")
            .arg(&self.destination)
            .stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::null());
        matches!(cmd.status().await, Ok(status) if status.success())
    }

    async fn start_master(&self) -> Result<Master> {
        let mut cmd = self.master_command();
        cmd.stdin(Stdio::null())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        debug!(node = %self.label, "Starting SSH control master");
        let mut child = cmd.spawn().map_err(|e| {
            TransportError::Connect(format!("failed to start {}: {e}", self.config.ssh_binary))
        })?;

        let ready_timeout = self.config.ready_timeout();
        let deadline = Instant::now() + ready_timeout;
        loop {
            if let Some(status) = child.try_wait()? {
                let mut stderr = String::new();
                if let Some(mut pipe) = child.stderr.take() {
                    let _ = pipe.read_to_string(&mut stderr).await;
                }
                return Err(master_exit_error(status.code(), &stderr));
            }
            if self.master_ready().await {
                break;
            }
            if Instant::now() >= deadline {
                let _ = child.kill().await;
                return Err(TransportError::Timeout(ready_timeout));
            }
            tokio::time::sleep(READY_POLL_INTERVAL).await;
        }

        info!(node = %self.label, "SSH session established");
        self.alive.send_replace(true);

        let (stop, stop_rx) = oneshot::channel();
        let alive = Arc::clone(&self.alive);
        let label = self.label.clone();
        let task = tokio::spawn(async move {
            tokio::select! {
                status = child.wait() => {
                    warn!(node = %label, status = ?status.ok().and_then(|s| s.code()), "SSH session ended");
                }
                _ = stop_rx => {
                    let _ = child.kill().await;
                    debug!(node = %label, "SSH control master stopped");
                }
            }
            alive.send_replace(false);
        });

        Ok(Master { stop, task })
    }

    async fn stop_master(master: Master) {
        let _ = master.stop.send(());
        let _ = master.task.await;
    }
}

fn master_exit_error(code: Option<i32>, stderr: &str) -> TransportError {
    match code {
        Some(SSHPASS_BAD_PASSWORD) => TransportError::Auth("password rejected".into()),
        Some(SSHPASS_HOST_KEY_UNKNOWN) => TransportError::Connect("host key is not known".into()),
        _ => classify_ssh_failure(stderr).unwrap_or_else(|| {
            TransportError::Connect(format!("SSH exited with {code:?}: {}", stderr.trim()))
        }),
    }
}

fn write_key_file(path: &std::path::Path, key: &str) -> Result<()> {
    let mut file = OpenOptions::new()
        .write(true)
        .create_new(true)
        .mode(0o600)
        .open(path)?;
    file.write_all(key.as_bytes())?;
    if !key.ends_with('\n') {
        file.write_all(b"\n")?;
    }
    Ok(())
}

#[async_trait]
impl RemoteShell for SshShell {
    fn label(&self) -> &str {
        &self.label
    }

    async fn run(&self, command: &str, stdin: Option<&[u8]>) -> Result<CommandOutput> {
        debug!(node = %self.label, command, "Running remote command");
        run_child(self.channel_command(command), stdin, self.config.command_timeout()).await
    }

    async fn stream(&self, command: &str) -> Result<ByteStream> {
        child_stream(self.channel_command(command), command.to_string())
    }

    async fn open_channel(&self, command: &str) -> Result<Box<dyn DuplexIo>> {
        Ok(Box::new(ChildIo::spawn(self.channel_command(command))?))
    }

    async fn reconnect(&self) -> Result<()> {
        let mut master = self.master.lock().await;
        if master.is_some() && self.master_ready().await {
            return Ok(());
        }
        info!(node = %self.label, "Re-establishing SSH session");
        if let Some(old) = master.take() {
            Self::stop_master(old).await;
        }
        *master = Some(self.start_master().await?);
        Ok(())
    }

    async fn close(&self) {
        if let Some(old) = self.master.lock().await.take() {
            Self::stop_master(old).await;
        }
    }

    async fn closed(&self) {
        let mut rx = self.alive.subscribe();
        let _ = rx.wait_for(|alive| !*alive).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::fs::PermissionsExt;

    #[test]
    fn key_file_is_private() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("id_key");
        write_key_file(&path, "-----BEGIN KEY-----").unwrap();

        let mode = std::fs::metadata(&path).unwrap().permissions().mode();
        assert_eq!(mode & 0o777, 0o600);
        assert!(std::fs::read_to_string(&path).unwrap().ends_with('\n'));
    }

    #[test]
    fn master_exit_classification() {
        assert!(master_exit_error(Some(SSHPASS_BAD_PASSWORD), "").is_auth());
        assert!(matches!(
            master_exit_error(Some(255), "ssh: Could not resolve hostname nowhere"),
            TransportError::Connect(_)
        ));
        assert!(master_exit_error(Some(255), "Permission denied (publickey)").is_auth());
    }

    #[tokio::test]
    async fn missing_client_is_a_connect_error() {
        let node = NodeDescriptor::new(
            dockwarden_core::NodeId::new("n1").unwrap(),
            "N",
            "203.0.113.7",
            "ops",
        );
        let config = TransportConfig {
            ssh_binary: "/nonexistent/ssh".into(),
            ..TransportConfig::default()
        };
        let err = SshShell::connect(&node, &Credential::private_key("k", None), config)
            .await
            .err()
            .unwrap();
        assert!(matches!(err, TransportError::Connect(_)));
    }
}
