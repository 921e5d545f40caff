//! Docker Engine API client.
//!
//! Talks plain HTTP/1.1 to the engine over its unix socket, or over TCP
//! when a socket-permission proxy sits in front of it. Only the four calls
//! the orchestrator needs are implemented: ping, inspect, start, stop.
//! The engine answers `304 Not Modified` when a container is already in
//! the requested state, which maps straight onto idempotent success.

use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use http::{Method, Request, StatusCode};
use http_body_util::{BodyExt, Empty};
use hyper_util::rt::TokioIo;
use serde::Deserialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::{Instant, timeout_at};
use tracing::debug;

use crate::error::{LifecycleError, LifecycleResult};
use crate::runtime::{ContainerInfo, ContainerRuntime, RuntimeStatus};

/// Where the engine API listens.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Endpoint {
    Unix(PathBuf),
    Tcp(String),
}

impl Endpoint {
    /// Parse `unix:///path`, `tcp://host:port` or `http://host:port`.
    pub fn parse(s: &str) -> LifecycleResult<Self> {
        if let Some(path) = s.strip_prefix("unix://") {
            return Ok(Self::Unix(PathBuf::from(path)));
        }
        if let Some(addr) = s
            .strip_prefix("tcp://")
            .or_else(|| s.strip_prefix("http://"))
        {
            let addr = addr.trim_end_matches('/');
            if addr.is_empty() {
                return Err(LifecycleError::InvalidEndpoint(s.to_string()));
            }
            return Ok(Self::Tcp(addr.to_string()));
        }
        Err(LifecycleError::InvalidEndpoint(s.to_string()))
    }

    fn host(&self) -> &str {
        match self {
            Self::Unix(_) => "docker",
            Self::Tcp(addr) => addr,
        }
    }
}

/// `ContainerRuntime` backed by the Docker Engine HTTP API.
pub struct DockerRuntime {
    endpoint: Endpoint,
    api_version: String,
    request_timeout: Duration,
}

impl DockerRuntime {
    pub fn new(endpoint: &str, api_version: &str, request_timeout: Duration) -> LifecycleResult<Self> {
        Ok(Self {
            endpoint: Endpoint::parse(endpoint)?,
            api_version: api_version.trim_matches('/').to_string(),
            request_timeout,
        })
    }

    fn versioned(&self, path: &str) -> String {
        if self.api_version.is_empty() {
            path.to_string()
        } else {
            format!("/{}{path}", self.api_version)
        }
    }

    async fn call(
        &self,
        method: Method,
        path: &str,
        timeout: Duration,
    ) -> LifecycleResult<(StatusCode, Bytes)> {
        let uri = self.versioned(path);
        let req = Request::builder()
            .method(method)
            .uri(&uri)
            .header("host", self.endpoint.host())
            .header("user-agent", "carousel/0.1")
            .body(Empty::<Bytes>::new())
            .map_err(|e| LifecycleError::Decode(e.to_string()))?;

        // A connect that fails or stalls means the engine is unreachable. Once
        // connected, a slow answer is a timeout of the operation itself.
        let deadline = Instant::now() + timeout;
        let connect_timed_out =
            || LifecycleError::Unavailable(format!("connect for {uri} timed out after {timeout:?}"));
        let answered = match &self.endpoint {
            #[cfg(unix)]
            Endpoint::Unix(socket) => {
                let stream = timeout_at(deadline, tokio::net::UnixStream::connect(socket))
                    .await
                    .map_err(|_| connect_timed_out())?
                    .map_err(unavailable)?;
                timeout_at(deadline, send(stream, req)).await
            }
            #[cfg(not(unix))]
            Endpoint::Unix(socket) => {
                return Err(LifecycleError::InvalidEndpoint(format!(
                    "unix socket {} unsupported on this platform",
                    socket.display()
                )));
            }
            Endpoint::Tcp(addr) => {
                let stream = timeout_at(deadline, tokio::net::TcpStream::connect(addr.as_str()))
                    .await
                    .map_err(|_| connect_timed_out())?
                    .map_err(unavailable)?;
                timeout_at(deadline, send(stream, req)).await
            }
        };

        let (status, body) = answered.map_err(|_| LifecycleError::RequestTimeout {
            uri: uri.clone(),
            timeout,
        })??;
        debug!(%uri, %status, "runtime API call");
        Ok((status, body))
    }
}

#[async_trait]
impl ContainerRuntime for DockerRuntime {
    async fn ping(&self) -> LifecycleResult<()> {
        let (status, body) = match self.call(Method::GET, "/_ping", self.request_timeout).await {
            Err(e @ LifecycleError::RequestTimeout { .. }) => {
                return Err(LifecycleError::Unavailable(e.to_string()));
            }
            other => other?,
        };
        if status.is_success() {
            Ok(())
        } else {
            Err(LifecycleError::Unavailable(format!(
                "ping answered {status}: {}",
                String::from_utf8_lossy(&body)
            )))
        }
    }

    async fn inspect(&self, name: &str) -> LifecycleResult<ContainerInfo> {
        let path = format!("/containers/{name}/json");
        let (status, body) = self.call(Method::GET, &path, self.request_timeout).await?;
        match status {
            StatusCode::OK => parse_inspect(&body),
            StatusCode::NOT_FOUND => Ok(ContainerInfo::missing()),
            other => Err(api_error(other, &body)),
        }
    }

    async fn start(&self, name: &str) -> LifecycleResult<()> {
        let path = format!("/containers/{name}/start");
        let (status, body) = self.call(Method::POST, &path, self.request_timeout).await?;
        match status {
            StatusCode::NO_CONTENT => Ok(()),
            StatusCode::NOT_MODIFIED => {
                debug!(container = name, "already running");
                Ok(())
            }
            StatusCode::NOT_FOUND => Err(LifecycleError::NotFound(name.to_string())),
            other => Err(api_error(other, &body)),
        }
    }

    async fn stop(&self, name: &str, grace: Duration) -> LifecycleResult<()> {
        let path = format!("/containers/{name}/stop?t={}", grace.as_secs());
        // The engine holds the request open for up to `grace`.
        let timeout = grace + self.request_timeout;
        let (status, body) = self.call(Method::POST, &path, timeout).await?;
        match status {
            StatusCode::NO_CONTENT => Ok(()),
            StatusCode::NOT_MODIFIED => {
                debug!(container = name, "already stopped");
                Ok(())
            }
            StatusCode::NOT_FOUND => Err(LifecycleError::NotFound(name.to_string())),
            other => Err(api_error(other, &body)),
        }
    }
}

async fn send<S>(stream: S, req: Request<Empty<Bytes>>) -> LifecycleResult<(StatusCode, Bytes)>
where
    S: AsyncRead + AsyncWrite + Unpin + Send + 'static,
{
    let io = TokioIo::new(stream);
    let (mut sender, conn) = hyper::client::conn::http1::handshake(io)
        .await
        .map_err(unavailable)?;

    // Drive the connection in the background.
    tokio::spawn(async move {
        let _ = conn.await;
    });

    let resp = sender.send_request(req).await.map_err(unavailable)?;
    let status = resp.status();
    let body = resp
        .into_body()
        .collect()
        .await
        .map_err(unavailable)?
        .to_bytes();
    Ok((status, body))
}

fn unavailable(e: impl std::fmt::Display) -> LifecycleError {
    LifecycleError::Unavailable(e.to_string())
}

#[derive(Deserialize)]
struct ErrorBody {
    message: String,
}

fn api_error(status: StatusCode, body: &[u8]) -> LifecycleError {
    let message = serde_json::from_slice::<ErrorBody>(body)
        .map(|b| b.message)
        .unwrap_or_else(|_| String::from_utf8_lossy(body).into_owned());
    LifecycleError::Api {
        status: status.as_u16(),
        message,
    }
}

#[derive(Deserialize)]
struct InspectBody {
    #[serde(rename = "Id")]
    id: Option<String>,
    #[serde(rename = "State")]
    state: Option<InspectState>,
}

#[derive(Deserialize)]
struct InspectState {
    #[serde(rename = "Status", default)]
    status: String,
    #[serde(rename = "Health")]
    health: Option<InspectHealth>,
}

#[derive(Deserialize)]
struct InspectHealth {
    #[serde(rename = "Status")]
    status: String,
}

/// Map a `GET /containers/{name}/json` body onto `ContainerInfo`.
fn parse_inspect(body: &[u8]) -> LifecycleResult<ContainerInfo> {
    let parsed: InspectBody =
        serde_json::from_slice(body).map_err(|e| LifecycleError::Decode(e.to_string()))?;
    let state = parsed
        .state
        .ok_or_else(|| LifecycleError::Decode("inspect body has no State".to_string()))?;

    let status = match state.status.as_str() {
        "running" => RuntimeStatus::Running,
        "restarting" => RuntimeStatus::Starting,
        "created" | "exited" | "paused" | "dead" | "removing" => RuntimeStatus::Stopped,
        other => {
            return Err(LifecycleError::Decode(format!(
                "unknown container state {other:?}"
            )));
        }
    };

    Ok(ContainerInfo {
        id: parsed.id,
        status,
        runtime_health: state.health.map(|h| h.status),
    })
}
