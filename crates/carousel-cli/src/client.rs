//! Minimal HTTP/1 client for the admin API.

use std::time::Duration;

use anyhow::{Context, anyhow, bail};
use bytes::Bytes;
use http::{Method, StatusCode, Uri};
use http_body_util::{BodyExt, Empty};
use serde::Deserialize;
use serde::de::DeserializeOwned;
use tracing::debug;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

/// `{success, data, error}` envelope every API answer is wrapped in.
#[derive(Debug, Deserialize)]
struct Envelope<T> {
    success: bool,
    data: Option<T>,
    error: Option<String>,
}

pub struct ApiClient {
    authority: String,
    base_path: String,
}

impl ApiClient {
    /// Accepts `http://host:port[/prefix]`.
    pub fn new(endpoint: &str) -> anyhow::Result<Self> {
        let uri: Uri = endpoint
            .parse()
            .with_context(|| format!("invalid endpoint {endpoint:?}"))?;
        match uri.scheme_str() {
            Some("http") => {}
            Some(other) => bail!("unsupported scheme {other:?} in {endpoint:?}, only http is supported"),
            None => bail!("endpoint {endpoint:?} needs an http:// scheme"),
        }
        let authority = uri
            .authority()
            .ok_or_else(|| anyhow!("endpoint {endpoint:?} has no host"))?;
        let port = authority.port_u16().unwrap_or(80);

        Ok(Self {
            authority: format!("{}:{port}", authority.host()),
            base_path: uri.path().trim_end_matches('/').to_string(),
        })
    }

    pub async fn get<T: DeserializeOwned>(&self, path: &str) -> anyhow::Result<T> {
        let (status, body) = self.request(Method::GET, path).await?;
        decode(status, &body)
    }

    pub async fn post<T: DeserializeOwned>(&self, path: &str) -> anyhow::Result<T> {
        let (status, body) = self.request(Method::POST, path).await?;
        decode(status, &body)
    }

    async fn request(&self, method: Method, path: &str) -> anyhow::Result<(StatusCode, Bytes)> {
        let target = format!("{}{path}", self.base_path);
        debug!(%method, authority = %self.authority, %target, "api request");

        let exchange = async {
            let stream = tokio::net::TcpStream::connect(&self.authority)
                .await
                .with_context(|| format!("cannot reach carousel at {}", self.authority))?;
            let io = hyper_util::rt::TokioIo::new(stream);
            let (mut sender, conn) = hyper::client::conn::http1::handshake(io).await?;
            tokio::spawn(async move {
                let _ = conn.await;
            });

            let req = http::Request::builder()
                .method(method)
                .uri(target.as_str())
                .header("host", self.authority.as_str())
                .header("user-agent", "carouselctl/0.1")
                .body(Empty::<Bytes>::new())?;
            let resp = sender.send_request(req).await?;
            let status = resp.status();
            let body = resp.into_body().collect().await?.to_bytes();
            Ok::<_, anyhow::Error>((status, body))
        };

        tokio::time::timeout(REQUEST_TIMEOUT, exchange)
            .await
            .map_err(|_| anyhow!("request to {} timed out after {REQUEST_TIMEOUT:?}", self.authority))?
    }
}

/// Unwrap the envelope, turning non-2xx answers into the API's message.
fn decode<T: DeserializeOwned>(status: StatusCode, body: &[u8]) -> anyhow::Result<T> {
    let envelope: Envelope<T> = match serde_json::from_slice(body) {
        Ok(envelope) => envelope,
        Err(e) if status.is_success() => return Err(e).context("malformed API response"),
        Err(_) => bail!("{status}: {}", String::from_utf8_lossy(body).trim()),
    };

    if !status.is_success() || !envelope.success {
        let message = envelope.error.unwrap_or_else(|| "request failed".to_string());
        bail!("{status}: {message}");
    }
    envelope
        .data
        .ok_or_else(|| anyhow!("API response carried no data"))
}
