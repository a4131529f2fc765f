//! Docker Engine API client
//!
//! Speaks plain HTTP/1.1 over the engine socket with `hyper`. Every request
//! opens its own connection, which keeps the long-lived event stream from
//! blocking the listing calls of a discovery pass.

use std::collections::HashMap;
use std::path::PathBuf;
use std::str::FromStr;

use async_trait::async_trait;
use bytes::Bytes;
use http::{header, Request, StatusCode};
use http_body_util::{BodyExt, Empty};
use hyper::body::Incoming;
use hyper::client::conn::http1::{self, SendRequest};
use hyper_util::rt::TokioIo;
use serde::de::DeserializeOwned;
use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::net::TcpStream;
use tracing::{debug, Instrument, Span};

use super::{
    NetworkDescriptor, ServiceDescriptor, ServiceEvent, ServiceEventStream, ServiceRegistry,
    VirtualIp,
};
use crate::config::RegistryConfig;
use crate::{Error, Result};

const SERVICES_PATH: &str = "/services";
// filters={"type":["service"]}
const SERVICE_EVENTS_PATH: &str = "/events?filters=%7B%22type%22%3A%5B%22service%22%5D%7D";

/// Where the Docker Engine API listens
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DockerHost {
    Unix(PathBuf),
    Tcp(String),
}

impl FromStr for DockerHost {
    type Err = Error;

    fn from_str(value: &str) -> Result<Self> {
        if let Some(path) = value.strip_prefix("unix://") {
            if path.is_empty() {
                return Err(Error::config("Docker unix socket path cannot be empty"));
            }
            return Ok(Self::Unix(PathBuf::from(path)));
        }

        let address = value
            .strip_prefix("tcp://")
            .or_else(|| value.strip_prefix("http://"))
            .ok_or_else(|| {
                Error::config(format!(
                    "Unsupported Docker host {}, expected unix:// or tcp://",
                    value
                ))
            })?
            .trim_end_matches('/');

        if address.is_empty() {
            return Err(Error::config("Docker TCP address cannot be empty"));
        }
        Ok(Self::Tcp(address.to_string()))
    }
}

/// [`ServiceRegistry`] backed by the Docker Engine API of a swarm manager
#[derive(Debug, Clone)]
pub struct DockerRegistry {
    host: DockerHost,
    span: Span,
}

impl DockerRegistry {
    pub fn new(host: DockerHost, span: Span) -> Self {
        Self { host, span }
    }

    pub fn from_config(config: &RegistryConfig, span: Span) -> Result<Self> {
        Ok(Self::new(config.docker_host.parse()?, span))
    }

    async fn connect(&self) -> Result<SendRequest<Empty<Bytes>>> {
        match &self.host {
            #[cfg(unix)]
            DockerHost::Unix(path) => {
                let stream = tokio::net::UnixStream::connect(path).await.map_err(|e| {
                    Error::registry_with_source(
                        format!("cannot reach Docker at {}", path.display()),
                        Box::new(e),
                    )
                })?;
                handshake(stream).await
            }
            #[cfg(not(unix))]
            DockerHost::Unix(path) => Err(Error::config(format!(
                "unix sockets are not supported on this platform: {}",
                path.display()
            ))),
            DockerHost::Tcp(address) => {
                let stream = TcpStream::connect(address).await.map_err(|e| {
                    Error::registry_with_source(
                        format!("cannot reach Docker at {}", address),
                        Box::new(e),
                    )
                })?;
                handshake(stream).await
            }
        }
    }

    async fn get(&self, path: &str) -> Result<Incoming> {
        let mut sender = self.connect().await?;

        let request = Request::get(path)
            .header(header::HOST, "docker")
            .header(header::ACCEPT, "application/json")
            .body(Empty::<Bytes>::new())
            .map_err(|e| Error::internal(format!("invalid Docker request {}: {}", path, e)))?;

        let response = sender.send_request(request).await.map_err(|e| {
            Error::registry_with_source(format!("Docker request {} failed", path), Box::new(e))
        })?;

        let status = response.status();
        let body = response.into_body();
        if status.is_success() {
            return Ok(body);
        }

        let bytes = body.collect().await.map(|b| b.to_bytes()).unwrap_or_default();
        Err(api_error(path, status, &bytes))
    }

    async fn get_json<T: DeserializeOwned>(&self, path: &str) -> Result<T> {
        let body = self.get(path).await?;
        let bytes = body
            .collect()
            .await
            .map_err(|e| {
                Error::registry_with_source(
                    format!("reading Docker response {} failed", path),
                    Box::new(e),
                )
            })?
            .to_bytes();

        serde_json::from_slice(&bytes)
            .map_err(|e| Error::serialization(format!("Docker response {}", path), e))
    }
}

async fn handshake<S>(stream: S) -> Result<SendRequest<Empty<Bytes>>>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let (sender, connection) = http1::handshake(TokioIo::new(stream)).await.map_err(|e| {
        Error::registry_with_source("Docker HTTP handshake failed", Box::new(e))
    })?;

    tokio::spawn(async move {
        if let Err(e) = connection.await {
            debug!(error = %e, "Docker connection closed");
        }
    });

    Ok(sender)
}

#[derive(Debug, Deserialize)]
struct DockerErrorBody {
    message: String,
}

fn api_error(path: &str, status: StatusCode, body: &[u8]) -> Error {
    let message = serde_json::from_slice::<DockerErrorBody>(body)
        .map(|b| b.message)
        .unwrap_or_else(|_| String::from_utf8_lossy(body).trim().to_string());
    Error::registry(format!("Docker API {} returned {}: {}", path, status, message))
}

fn is_safe_path_segment(value: &str) -> bool {
    !value.is_empty()
        && value.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '.' | '-'))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DockerService {
    #[serde(rename = "ID")]
    id: String,
    #[serde(default)]
    spec: DockerServiceSpec,
    #[serde(default)]
    endpoint: DockerEndpoint,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DockerServiceSpec {
    #[serde(default)]
    name: String,
    #[serde(default)]
    labels: Option<HashMap<String, String>>,
}

#[derive(Debug, Default, Deserialize)]
struct DockerEndpoint {
    #[serde(rename = "VirtualIPs", default)]
    virtual_ips: Option<Vec<DockerVirtualIp>>,
}

#[derive(Debug, Deserialize)]
struct DockerVirtualIp {
    #[serde(rename = "NetworkID", default)]
    network_id: String,
    #[serde(rename = "Addr", default)]
    addr: String,
}

impl From<DockerService> for ServiceDescriptor {
    fn from(service: DockerService) -> Self {
        Self {
            id: service.id,
            name: service.spec.name,
            labels: service.spec.labels.unwrap_or_default(),
            virtual_ips: service
                .endpoint
                .virtual_ips
                .unwrap_or_default()
                .into_iter()
                .map(|vip| VirtualIp { network_id: vip.network_id, addr: vip.addr })
                .collect(),
        }
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct DockerNetwork {
    #[serde(rename = "Id")]
    id: String,
    name: String,
    #[serde(default)]
    scope: String,
}

#[derive(Debug, Deserialize)]
struct DockerEvent {
    #[serde(rename = "Type", default)]
    kind: String,
    #[serde(rename = "Action", default)]
    action: String,
    #[serde(rename = "Actor", default)]
    actor: DockerActor,
}

#[derive(Debug, Default, Deserialize)]
struct DockerActor {
    #[serde(rename = "ID", default)]
    id: String,
    #[serde(rename = "Attributes", default)]
    attributes: HashMap<String, String>,
}

/// Splits the newline delimited JSON of the event endpoint into events
#[derive(Debug, Default)]
struct EventDecoder {
    buffer: Vec<u8>,
}

impl EventDecoder {
    fn push(&mut self, chunk: &[u8]) -> Vec<Result<ServiceEvent>> {
        self.buffer.extend_from_slice(chunk);

        let mut events = Vec::new();
        while let Some(end) = self.buffer.iter().position(|b| *b == b'\n') {
            let line: Vec<u8> = self.buffer.drain(..=end).collect();
            if line.iter().all(u8::is_ascii_whitespace) {
                continue;
            }

            match serde_json::from_slice::<DockerEvent>(&line) {
                Ok(event) if event.kind.is_empty() || event.kind == "service" => {
                    events.push(Ok(ServiceEvent {
                        action: event.action,
                        service_id: event.actor.id,
                        service_name: event.actor.attributes.get("name").cloned(),
                    }))
                }
                Ok(_) => {}
                Err(e) => events.push(Err(Error::serialization("Docker event", e))),
            }
        }
        events
    }
}

#[async_trait]
impl ServiceRegistry for DockerRegistry {
    async fn list_services(&self) -> Result<Vec<ServiceDescriptor>> {
        let services: Vec<DockerService> =
            self.get_json(SERVICES_PATH).instrument(self.span.clone()).await?;
        Ok(services.into_iter().map(ServiceDescriptor::from).collect())
    }

    async fn inspect_network(&self, id: &str) -> Result<NetworkDescriptor> {
        if !is_safe_path_segment(id) {
            return Err(Error::config(format!("invalid network name or ID: {}", id)));
        }

        let network: DockerNetwork =
            self.get_json(&format!("/networks/{}", id)).instrument(self.span.clone()).await?;
        Ok(NetworkDescriptor { id: network.id, name: network.name, scope: network.scope })
    }

    async fn events(&self) -> Result<ServiceEventStream> {
        let mut body = self.get(SERVICE_EVENTS_PATH).instrument(self.span.clone()).await?;
        debug!(parent: &self.span, "Subscribed to Docker service events");

        let stream = async_stream::stream! {
            let mut decoder = EventDecoder::default();
            while let Some(frame) = body.frame().await {
                match frame {
                    Ok(frame) => {
                        let Ok(data) = frame.into_data() else { continue };
                        for event in decoder.push(&data) {
                            yield event;
                        }
                    }
                    Err(e) => {
                        yield Err(Error::registry_with_source(
                            "Docker event stream failed",
                            Box::new(e),
                        ));
                        return;
                    }
                }
            }
        };

        Ok(Box::pin(stream))
    }
}
