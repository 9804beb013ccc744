//! Engine operations as discrete CLI commands over the remote shell.
//!
//! Used when the API tunnel is unavailable. Listings use the CLI's
//! `{{json .}}` line format; container creation and network attachment,
//! which need the full create body, go to the engine socket through `curl`.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dockwarden_core::{
    ContainerDetails, ContainerId, ContainerSnapshot, ContainerState, ExecOutput, ImageSummary,
    NetworkSummary, VolumeSummary,
};
use serde_json::{json, Value};

use crate::config::TransportConfig;
use crate::engine::{container_id, state_from_status, str_field, EngineApi};
use crate::error::{Result, TransportError};
use crate::shell::{check_output, shell_join, shell_quote, RemoteShell};
use crate::types::{ByteStream, CommandOutput, EventFilter, ExecOptions};

const JSON_FORMAT: &str = "'{{json .}}'";

/// Stderr fragments the CLI uses for missing objects.
const NOT_FOUND_MARKERS: &[&str] = &["No such container", "No such object", "No such network", "No such image"];

/// Separator between the response body and the status code in curl output.
const STATUS_MARKER: &str = "\n__status__:";

/// [`EngineApi`] implemented with the engine CLI.
pub struct CliEngine {
    shell: Arc<dyn RemoteShell>,
    binary: String,
    socket: PathBuf,
}

impl CliEngine {
    /// Create a CLI engine running commands on `shell`.
    #[must_use]
    pub fn new(shell: Arc<dyn RemoteShell>, config: &TransportConfig) -> Self {
        Self {
            shell,
            binary: config.engine_binary.clone(),
            socket: config.engine_socket.clone(),
        }
    }

    async fn run(&self, args: &str, stdin: Option<&[u8]>) -> Result<CommandOutput> {
        let command = format!("{} {args}", self.binary);
        let output = self.shell.run(&command, stdin).await?;
        check_output(&command, output, &ExecOptions::default()).map_err(not_found)
    }

    async fn json_lines(&self, args: &str) -> Result<Vec<Value>> {
        let output = self.run(args, None).await?;
        output
            .stdout
            .lines()
            .filter(|l| !l.trim().is_empty())
            .map(|l| serde_json::from_str(l).map_err(TransportError::from))
            .collect()
    }

    /// Call the engine API on the host socket with `curl`.
    async fn socket_call(&self, method: &str, path: &str, body: &Value) -> Result<Vec<u8>> {
        let command = format!(
            "curl -sS -w {} --unix-socket {} -H 'Content-Type: application/json' -X {method} --data-binary @- {}",
            shell_quote(&format!("{STATUS_MARKER}%{{http_code}}")),
            shell_quote(&self.socket.to_string_lossy()),
            shell_quote(&format!("http://localhost{path}")),
        );
        let payload = serde_json::to_vec(body)?;
        let output = self.shell.run(&command, Some(&payload)).await?;
        let output = check_output(&command, output, &ExecOptions::default())?;

        let (body, status) = output
            .stdout
            .rsplit_once(STATUS_MARKER)
            .ok_or_else(|| TransportError::Parse(format!("no status in curl output: {}", output.stdout)))?;
        let status: u16 = status
            .trim()
            .parse()
            .map_err(|_| TransportError::Parse(format!("bad status {status:?}")))?;
        if (200..300).contains(&status) {
            Ok(body.as_bytes().to_vec())
        } else {
            Err(TransportError::from_engine_response(status, body.as_bytes()))
        }
    }
}

fn not_found(err: TransportError) -> TransportError {
    match err {
        TransportError::Command { stderr, .. } if NOT_FOUND_MARKERS.iter().any(|m| stderr.contains(m)) => {
            TransportError::NotFound(stderr)
        }
        other => other,
    }
}

fn snapshot_from_cli(v: &Value) -> Result<ContainerSnapshot> {
    let status = str_field(v, "Status").to_string();
    let state = match str_field(v, "State") {
        "" => state_from_status(&status),
        raw => ContainerState::from_engine(raw),
    };
    Ok(ContainerSnapshot {
        id: container_id(str_field(v, "ID"))?,
        names: str_field(v, "Names")
            .split(',')
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .map(str::to_string)
            .collect(),
        image: str_field(v, "Image").to_string(),
        state,
        status,
    })
}

fn image_from_cli(v: &Value) -> ImageSummary {
    let repo = str_field(v, "Repository");
    let tag = str_field(v, "Tag");
    let tags = if repo.is_empty() || repo == "<none>" {
        Vec::new()
    } else if tag.is_empty() || tag == "<none>" {
        vec![repo.to_string()]
    } else {
        vec![format!("{repo}:{tag}")]
    };
    ImageSummary {
        id: str_field(v, "ID").to_string(),
        tags,
        size: str_field(v, "Size").to_string(),
        created: str_field(v, "CreatedAt").to_string(),
    }
}

#[async_trait]
impl EngineApi for CliEngine {
    async fn ping(&self) -> Result<()> {
        self.run("version --format '{{.Server.Version}}'", None)
            .await
            .map(|_| ())
    }

    async fn list_containers(&self, all: bool) -> Result<Vec<ContainerSnapshot>> {
        let flag = if all { " -a" } else { "" };
        self.json_lines(&format!("ps --no-trunc --format {JSON_FORMAT}{flag}"))
            .await?
            .iter()
            .map(snapshot_from_cli)
            .collect()
    }

    async fn inspect(&self, container: &str) -> Result<ContainerDetails> {
        let output = self
            .run(&format!("inspect --type container {}", shell_quote(container)), None)
            .await?;
        let doc: Value = serde_json::from_str(&output.stdout)?;
        doc.get(0)
            .and_then(ContainerDetails::from_inspect)
            .ok_or_else(|| TransportError::NotFound(container.to_string()))
    }

    async fn start(&self, container: &str) -> Result<()> {
        self.run(&format!("start {}", shell_quote(container)), None)
            .await
            .map(|_| ())
    }

    async fn stop(&self, container: &str, grace: Duration) -> Result<()> {
        self.run(
            &format!("stop -t {} {}", grace.as_secs(), shell_quote(container)),
            None,
        )
        .await
        .map(|_| ())
    }

    async fn restart(&self, container: &str, grace: Duration) -> Result<()> {
        self.run(
            &format!("restart -t {} {}", grace.as_secs(), shell_quote(container)),
            None,
        )
        .await
        .map(|_| ())
    }

    async fn remove(&self, container: &str, force: bool) -> Result<()> {
        let flag = if force { "-f " } else { "" };
        self.run(&format!("rm {flag}{}", shell_quote(container)), None)
            .await
            .map(|_| ())
    }

    async fn rename(&self, container: &str, new_name: &str) -> Result<()> {
        self.run(
            &format!("rename {} {}", shell_quote(container), shell_quote(new_name)),
            None,
        )
        .await
        .map(|_| ())
    }

    async fn create(&self, name: &str, body: &Value) -> Result<ContainerId> {
        let path = format!("/containers/create?name={}", urlencoding::encode(name));
        let response = self.socket_call("POST", &path, body).await?;
        let doc: Value = serde_json::from_slice(&response)?;
        container_id(str_field(&doc, "Id"))
    }

    async fn connect_network(&self, network: &str, container: &str, endpoint: &Value) -> Result<()> {
        let path = format!("/networks/{}/connect", urlencoding::encode(network));
        let body = json!({ "Container": container, "EndpointConfig": endpoint });
        self.socket_call("POST", &path, &body).await.map(|_| ())
    }

    async fn exec(&self, container: &str, cmd: &[String]) -> Result<ExecOutput> {
        let command = format!("{} exec {} {}", self.binary, shell_quote(container), shell_join(cmd));
        let output = self.shell.run(&command, None).await?;
        // The command's own exit status is data; only engine failures raise.
        let output = check_output(&command, output, &ExecOptions::raw())?;
        if output.stderr.contains("Error response from daemon") {
            return Err(not_found(TransportError::Command {
                command,
                exit_code: output.exit_code,
                stderr: output.stderr.trim().to_string(),
            }));
        }
        Ok(ExecOutput {
            stdout: output.stdout,
            stderr: output.stderr,
            exit_code: output.exit_code.map(i64::from),
        })
    }

    async fn logs(&self, container: &str, tail: Option<usize>) -> Result<String> {
        let tail = tail.map_or_else(|| "all".to_string(), |n| n.to_string());
        self.run(&format!("logs --tail {tail} {} 2>&1", shell_quote(container)), None)
            .await
            .map(|o| o.stdout)
    }

    async fn list_images(&self) -> Result<Vec<ImageSummary>> {
        Ok(self
            .json_lines(&format!("images --no-trunc --format {JSON_FORMAT}"))
            .await?
            .iter()
            .map(image_from_cli)
            .collect())
    }

    async fn list_networks(&self) -> Result<Vec<NetworkSummary>> {
        Ok(self
            .json_lines(&format!("network ls --no-trunc --format {JSON_FORMAT}"))
            .await?
            .iter()
            .map(|v| NetworkSummary {
                id: str_field(v, "ID").to_string(),
                name: str_field(v, "Name").to_string(),
                driver: str_field(v, "Driver").to_string(),
                scope: str_field(v, "Scope").to_string(),
            })
            .collect())
    }

    async fn list_volumes(&self) -> Result<Vec<VolumeSummary>> {
        Ok(self
            .json_lines(&format!("volume ls --format {JSON_FORMAT}"))
            .await?
            .iter()
            .map(|v| VolumeSummary {
                name: str_field(v, "Name").to_string(),
                driver: str_field(v, "Driver").to_string(),
                mountpoint: str_field(v, "Mountpoint").to_string(),
            })
            .collect())
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        self.run(&format!("pull {}", shell_quote(image)), None)
            .await
            .map(|_| ())
    }

    async fn events(&self, filter: &EventFilter) -> Result<ByteStream> {
        let command = format!(
            "{} events --format {JSON_FORMAT} {}",
            self.binary,
            filter.to_cli_args()
        );
        self.shell.stream(&command).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::MockShell;

    fn engine(shell: &Arc<MockShell>) -> CliEngine {
        CliEngine::new(Arc::clone(shell) as Arc<dyn RemoteShell>, &TransportConfig::default())
    }

    #[tokio::test]
    async fn parses_ps_lines() {
        let shell = Arc::new(MockShell::new());
        shell.respond(
            "docker ps",
            CommandOutput::ok(concat!(
                r#"{"ID":"aaa111","Names":"web","Image":"nginx","State":"running","Status":"Up 1 hour"}"#,
                "\n",
                r#"{"ID":"bbb222","Names":"db,db-alias","Image":"postgres","Status":"Exited (1) 3 minutes ago"}"#,
                "\n"
            )),
        );
        let containers = engine(&shell).list_containers(true).await.unwrap();
        assert_eq!(containers.len(), 2);
        assert_eq!(containers[0].state, ContainerState::Running);
        assert_eq!(containers[1].names, vec!["db", "db-alias"]);
        assert_eq!(containers[1].state, ContainerState::Stopped);
        assert!(shell.commands()[0].ends_with(" -a"));
    }

    #[tokio::test]
    async fn missing_container_is_not_found() {
        let shell = Arc::new(MockShell::new());
        shell.respond(
            "docker inspect",
            CommandOutput::failed(1, "Error: No such container: ghost"),
        );
        let err = engine(&shell).inspect("ghost").await.unwrap_err();
        assert!(matches!(err, TransportError::NotFound(_)));
    }

    #[tokio::test]
    async fn create_goes_through_socket() {
        let shell = Arc::new(MockShell::new());
        shell.respond(
            "curl",
            CommandOutput::ok(format!("{{\"Id\":\"new123\",\"Warnings\":[]}}{STATUS_MARKER}201")),
        );
        let id = engine(&shell)
            .create("web", &json!({ "Image": "nginx" }))
            .await
            .unwrap();
        assert_eq!(id.as_str(), "new123");

        let command = &shell.commands()[0];
        assert!(command.contains("--unix-socket /var/run/docker.sock"));
        assert!(command.contains("containers/create?name=web"));
        assert_eq!(shell.last_stdin().unwrap(), br#"{"Image":"nginx"}"#);
    }

    #[tokio::test]
    async fn create_conflict_is_engine_error() {
        let shell = Arc::new(MockShell::new());
        shell.respond(
            "curl",
            CommandOutput::ok(format!("{{\"message\":\"name in use\"}}{STATUS_MARKER}409")),
        );
        let err = engine(&shell).create("web", &json!({})).await.unwrap_err();
        assert!(matches!(err, TransportError::Engine { status: 409, .. }));
    }

    #[tokio::test]
    async fn exec_keeps_exit_status() {
        let shell = Arc::new(MockShell::new());
        shell.respond("docker exec", CommandOutput::failed(2, "ls: missing"));
        let out = engine(&shell)
            .exec("web", &["ls".to_string(), "/missing dir".to_string()])
            .await
            .unwrap();
        assert_eq!(out.exit_code, Some(2));
        assert!(shell.commands()[0].ends_with("ls '/missing dir'"));
    }

    #[tokio::test]
    async fn images_normalize_tags() {
        let shell = Arc::new(MockShell::new());
        shell.respond(
            "docker images",
            CommandOutput::ok(concat!(
                r#"{"ID":"sha256:1","Repository":"nginx","Tag":"1.25","Size":"187MB","CreatedAt":"2024-01-01"}"#,
                "\n",
                r#"{"ID":"sha256:2","Repository":"<none>","Tag":"<none>","Size":"5MB","CreatedAt":"2024-01-02"}"#,
            )),
        );
        let images = engine(&shell).list_images().await.unwrap();
        assert_eq!(images[0].tags, vec!["nginx:1.25"]);
        assert!(images[1].tags.is_empty());
    }
}
