//! Engine HTTP API over a byte tunnel.
//!
//! The tunnel is either the engine's local socket or a remote-shell channel
//! running the engine's `dial-stdio` command. HTTP/1 is spoken over it with
//! a hyper client connection. Regular calls share one connection; long-lived
//! responses (events, exec output, pulls) get a dedicated one.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dockwarden_core::{
    ContainerDetails, ContainerId, ContainerSnapshot, ContainerState, ExecOutput, ImageSummary,
    NetworkSummary, VolumeSummary,
};
use futures::future::poll_fn;
use futures::stream;
use hyper::body::{Bytes, HttpBody};
use hyper::client::conn::SendRequest;
use hyper::header::{CONTENT_TYPE, HOST};
use hyper::{Body, Method, Request, StatusCode};
use serde_json::{json, Value};
use tokio::net::UnixStream;
use tokio::sync::Mutex;
use tracing::debug;
use urlencoding::encode;

use crate::engine::{container_id, format_size, split_image_ref, str_field, EngineApi};
use crate::error::{Result, TransportError};
use crate::framing::{merge_output, split_output};
use crate::shell::RemoteShell;
use crate::types::{ByteStream, DuplexIo, EventFilter};

/// Opens raw byte channels to the engine API.
#[async_trait]
pub trait Dialer: Send + Sync {
    /// Open a new channel.
    async fn dial(&self) -> Result<Box<dyn DuplexIo>>;
}

/// Dials through a remote-shell channel running the engine's stdio bridge.
pub struct ShellDialer {
    shell: Arc<dyn RemoteShell>,
    command: String,
}

impl ShellDialer {
    /// Create a dialer that runs `command` on `shell`.
    #[must_use]
    pub fn new(shell: Arc<dyn RemoteShell>, command: impl Into<String>) -> Self {
        Self {
            shell,
            command: command.into(),
        }
    }
}

#[async_trait]
impl Dialer for ShellDialer {
    async fn dial(&self) -> Result<Box<dyn DuplexIo>> {
        self.shell.open_channel(&self.command).await
    }
}

/// Dials the engine's local Unix socket.
pub struct UnixSocketDialer {
    path: PathBuf,
}

impl UnixSocketDialer {
    /// Create a dialer for the socket at `path`.
    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

#[async_trait]
impl Dialer for UnixSocketDialer {
    async fn dial(&self) -> Result<Box<dyn DuplexIo>> {
        let stream = UnixStream::connect(&self.path).await.map_err(|e| {
            TransportError::ApiUnavailable(format!("{}: {e}", self.path.display()))
        })?;
        Ok(Box::new(stream))
    }
}

fn unavailable(e: impl std::fmt::Display) -> TransportError {
    TransportError::ApiUnavailable(e.to_string())
}

/// A response whose body is still being read on its own connection.
struct Dedicated {
    status: StatusCode,
    body: Body,
    // Keeps the connection open until the body is consumed.
    sender: SendRequest<Body>,
}

/// Engine API client over a [`Dialer`].
pub struct ApiTunnel {
    dialer: Arc<dyn Dialer>,
    shared: Mutex<Option<SendRequest<Body>>>,
}

impl ApiTunnel {
    /// Create a tunnel client. No connection is made until the first call.
    #[must_use]
    pub fn new(dialer: Arc<dyn Dialer>) -> Self {
        Self {
            dialer,
            shared: Mutex::new(None),
        }
    }

    async fn handshake(&self) -> Result<SendRequest<Body>> {
        let io = self.dialer.dial().await.map_err(unavailable)?;
        let (sender, connection) = hyper::client::conn::handshake(io).await.map_err(unavailable)?;
        tokio::spawn(async move {
            if let Err(e) = connection.await {
                debug!(error = %e, "Engine API connection closed");
            }
        });
        Ok(sender)
    }

    fn request(method: &Method, path: &str, body: Option<&[u8]>) -> Result<Request<Body>> {
        let mut builder = Request::builder()
            .method(method.clone())
            .uri(path)
            .header(HOST, "docker");
        if body.is_some() {
            builder = builder.header(CONTENT_TYPE, "application/json");
        }
        builder
            .body(body.map_or_else(Body::empty, |b| Body::from(b.to_vec())))
            .map_err(|e| TransportError::Parse(e.to_string()))
    }

    /// Send a request on the shared connection and read the whole response.
    ///
    /// A failure on a reused connection is retried once on a fresh one.
    async fn call(&self, method: Method, path: &str, body: Option<&Value>) -> Result<(StatusCode, Bytes)> {
        let payload = body.map(serde_json::to_vec).transpose()?;
        let mut shared = self.shared.lock().await;
        let mut retried = false;
        loop {
            let reused = shared.is_some();
            let mut sender = match shared.take() {
                Some(sender) => sender,
                None => self.handshake().await?,
            };

            let outcome = match poll_fn(|cx| sender.poll_ready(cx)).await {
                Ok(()) => {
                    sender
                        .send_request(Self::request(&method, path, payload.as_deref())?)
                        .await
                }
                Err(e) => Err(e),
            };

            match outcome {
                Ok(response) => {
                    let status = response.status();
                    let bytes = hyper::body::to_bytes(response.into_body())
                        .await
                        .map_err(unavailable)?;
                    *shared = Some(sender);
                    return Ok((status, bytes));
                }
                Err(e) if reused && !retried => {
                    debug!(error = %e, path, "Stale engine API connection, redialing");
                    retried = true;
                }
                Err(e) => return Err(unavailable(e)),
            }
        }
    }

    async fn dedicated(&self, method: Method, path: &str, body: Option<&Value>) -> Result<Dedicated> {
        let payload = body.map(serde_json::to_vec).transpose()?;
        let mut sender = self.handshake().await?;
        poll_fn(|cx| sender.poll_ready(cx)).await.map_err(unavailable)?;
        let response = sender
            .send_request(Self::request(&method, path, payload.as_deref())?)
            .await
            .map_err(unavailable)?;
        Ok(Dedicated {
            status: response.status(),
            body: response.into_body(),
            sender,
        })
    }

    async fn read_dedicated(dedicated: Dedicated) -> Result<Bytes> {
        let Dedicated { status, body, sender } = dedicated;
        let bytes = hyper::body::to_bytes(body).await.map_err(unavailable)?;
        drop(sender);
        check(status, bytes)
    }

    async fn get_json(&self, path: &str) -> Result<Value> {
        let (status, bytes) = self.call(Method::GET, path, None).await?;
        Ok(serde_json::from_slice(&check(status, bytes)?)?)
    }

    async fn post(&self, path: &str, body: Option<&Value>) -> Result<Bytes> {
        let (status, bytes) = self.call(Method::POST, path, body).await?;
        check(status, bytes)
    }
}

/// Accept 2xx and 304 (already started / already stopped).
fn check(status: StatusCode, bytes: Bytes) -> Result<Bytes> {
    if status.is_success() || status == StatusCode::NOT_MODIFIED {
        Ok(bytes)
    } else {
        Err(TransportError::from_engine_response(status.as_u16(), &bytes))
    }
}

fn body_stream(dedicated: Dedicated) -> ByteStream {
    let Dedicated { body, sender, .. } = dedicated;
    Box::pin(stream::unfold(Some((body, sender)), |state| async move {
        let (mut body, sender) = state?;
        match body.data().await {
            Some(Ok(chunk)) => Some((Ok(chunk.to_vec()), Some((body, sender)))),
            Some(Err(e)) => Some((Err(TransportError::Channel(e.to_string())), None)),
            None => None,
        }
    }))
}

fn snapshot_from_api(v: &Value) -> Result<ContainerSnapshot> {
    let names = v
        .get("Names")
        .and_then(Value::as_array)
        .map(|a| {
            a.iter()
                .filter_map(Value::as_str)
                .map(|n| n.trim_start_matches('/').to_string())
                .collect()
        })
        .unwrap_or_default();
    Ok(ContainerSnapshot {
        id: container_id(str_field(v, "Id"))?,
        names,
        image: str_field(v, "Image").to_string(),
        state: ContainerState::from_engine(str_field(v, "State")),
        status: str_field(v, "Status").to_string(),
    })
}

fn image_from_api(v: &Value) -> ImageSummary {
    let tags = v
        .get("RepoTags")
        .and_then(Value::as_array)
        .map(|a| {
            a.iter()
                .filter_map(Value::as_str)
                .filter(|t| *t != "<none>:<none>")
                .map(str::to_string)
                .collect()
        })
        .unwrap_or_default();
    let created = v
        .get("Created")
        .and_then(Value::as_i64)
        .and_then(|secs| chrono::DateTime::from_timestamp(secs, 0))
        .map(|t| t.to_rfc3339())
        .unwrap_or_default();
    ImageSummary {
        id: str_field(v, "Id").to_string(),
        tags,
        size: format_size(v.get("Size").and_then(Value::as_i64).unwrap_or_default()),
        created,
    }
}

fn as_array(v: Value) -> Vec<Value> {
    match v {
        Value::Array(items) => items,
        _ => Vec::new(),
    }
}

#[async_trait]
impl EngineApi for ApiTunnel {
    async fn ping(&self) -> Result<()> {
        let (status, bytes) = self.call(Method::GET, "/_ping", None).await?;
        check(status, bytes).map(|_| ())
    }

    async fn list_containers(&self, all: bool) -> Result<Vec<ContainerSnapshot>> {
        let doc = self
            .get_json(&format!("/containers/json?all={}", u8::from(all)))
            .await?;
        as_array(doc).iter().map(snapshot_from_api).collect()
    }

    async fn inspect(&self, container: &str) -> Result<ContainerDetails> {
        let doc = self
            .get_json(&format!("/containers/{}/json", encode(container)))
            .await?;
        ContainerDetails::from_inspect(&doc)
            .ok_or_else(|| TransportError::Parse(format!("inspect of {container} has no Id")))
    }

    async fn start(&self, container: &str) -> Result<()> {
        self.post(&format!("/containers/{}/start", encode(container)), None)
            .await
            .map(|_| ())
    }

    async fn stop(&self, container: &str, grace: Duration) -> Result<()> {
        self.post(
            &format!("/containers/{}/stop?t={}", encode(container), grace.as_secs()),
            None,
        )
        .await
        .map(|_| ())
    }

    async fn restart(&self, container: &str, grace: Duration) -> Result<()> {
        self.post(
            &format!("/containers/{}/restart?t={}", encode(container), grace.as_secs()),
            None,
        )
        .await
        .map(|_| ())
    }

    async fn remove(&self, container: &str, force: bool) -> Result<()> {
        let (status, bytes) = self
            .call(
                Method::DELETE,
                &format!("/containers/{}?force={force}", encode(container)),
                None,
            )
            .await?;
        check(status, bytes).map(|_| ())
    }

    async fn rename(&self, container: &str, new_name: &str) -> Result<()> {
        self.post(
            &format!("/containers/{}/rename?name={}", encode(container), encode(new_name)),
            None,
        )
        .await
        .map(|_| ())
    }

    async fn create(&self, name: &str, body: &Value) -> Result<ContainerId> {
        let bytes = self
            .post(&format!("/containers/create?name={}", encode(name)), Some(body))
            .await?;
        let doc: Value = serde_json::from_slice(&bytes)?;
        container_id(str_field(&doc, "Id"))
    }

    async fn connect_network(&self, network: &str, container: &str, endpoint: &Value) -> Result<()> {
        let body = json!({ "Container": container, "EndpointConfig": endpoint });
        self.post(&format!("/networks/{}/connect", encode(network)), Some(&body))
            .await
            .map(|_| ())
    }

    async fn exec(&self, container: &str, cmd: &[String]) -> Result<ExecOutput> {
        let create = json!({ "AttachStdout": true, "AttachStderr": true, "Cmd": cmd });
        let bytes = self
            .post(&format!("/containers/{}/exec", encode(container)), Some(&create))
            .await?;
        let doc: Value = serde_json::from_slice(&bytes)?;
        let exec_id = str_field(&doc, "Id").to_string();
        if exec_id.is_empty() {
            return Err(TransportError::Parse("exec create returned no Id".into()));
        }

        let start = json!({ "Detach": false, "Tty": false });
        let output = Self::read_dedicated(
            self.dedicated(Method::POST, &format!("/exec/{exec_id}/start"), Some(&start))
                .await?,
        )
        .await?;
        let (stdout, stderr) = split_output(&output);

        let info = self.get_json(&format!("/exec/{exec_id}/json")).await?;
        Ok(ExecOutput {
            stdout,
            stderr,
            exit_code: info.get("ExitCode").and_then(Value::as_i64),
        })
    }

    async fn logs(&self, container: &str, tail: Option<usize>) -> Result<String> {
        let tail = tail.map_or_else(|| "all".to_string(), |n| n.to_string());
        let (status, bytes) = self
            .call(
                Method::GET,
                &format!(
                    "/containers/{}/logs?stdout=true&stderr=true&tail={tail}",
                    encode(container)
                ),
                None,
            )
            .await?;
        Ok(merge_output(&check(status, bytes)?))
    }

    async fn list_images(&self) -> Result<Vec<ImageSummary>> {
        let doc = self.get_json("/images/json").await?;
        Ok(as_array(doc).iter().map(image_from_api).collect())
    }

    async fn list_networks(&self) -> Result<Vec<NetworkSummary>> {
        let doc = self.get_json("/networks").await?;
        Ok(as_array(doc)
            .iter()
            .map(|v| NetworkSummary {
                id: str_field(v, "Id").to_string(),
                name: str_field(v, "Name").to_string(),
                driver: str_field(v, "Driver").to_string(),
                scope: str_field(v, "Scope").to_string(),
            })
            .collect())
    }

    async fn list_volumes(&self) -> Result<Vec<VolumeSummary>> {
        let doc = self.get_json("/volumes").await?;
        let volumes = doc.get("Volumes").cloned().unwrap_or(Value::Null);
        Ok(as_array(volumes)
            .iter()
            .map(|v| VolumeSummary {
                name: str_field(v, "Name").to_string(),
                driver: str_field(v, "Driver").to_string(),
                mountpoint: str_field(v, "Mountpoint").to_string(),
            })
            .collect())
    }

    async fn pull_image(&self, image: &str) -> Result<()> {
        let (repo, tag) = split_image_ref(image);
        let mut path = format!("/images/create?fromImage={}", encode(repo));
        if let Some(tag) = tag {
            path.push_str(&format!("&tag={}", encode(tag)));
        }
        let progress = Self::read_dedicated(self.dedicated(Method::POST, &path, None).await?).await?;

        // Pull failures arrive as a progress record with an `error` field.
        for line in progress.split(|b| *b == b'\n') {
            if let Ok(record) = serde_json::from_slice::<Value>(line) {
                if let Some(message) = record.get("error").and_then(Value::as_str) {
                    return Err(TransportError::Engine {
                        status: 500,
                        message: message.to_string(),
                    });
                }
            }
        }
        Ok(())
    }

    async fn events(&self, filter: &EventFilter) -> Result<ByteStream> {
        let path = format!("/events?filters={}", filter.to_api_query());
        let dedicated = self.dedicated(Method::GET, &path, None).await?;
        if !dedicated.status.is_success() {
            let bytes = hyper::body::to_bytes(dedicated.body).await.map_err(unavailable)?;
            return Err(TransportError::from_engine_response(dedicated.status.as_u16(), &bytes));
        }
        Ok(body_stream(dedicated))
    }
}
