//! Upstream HTTP abstraction.
//!
//! Executors build [`TransportRequest`]s; a [`UpstreamTransport`] performs
//! the IO. The `wreq` implementation keeps one client per outbound-proxy
//! value, built lazily. Tests substitute scripted transports.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures_util::StreamExt;
use tokio::sync::mpsc;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportErrorKind {
    Timeout,
    Connect,
    Other,
}

#[derive(Debug, Clone, thiserror::Error)]
#[error("transport error ({kind:?}): {message}")]
pub struct TransportError {
    pub kind: TransportErrorKind,
    pub message: String,
}

impl TransportError {
    pub fn other(message: impl Into<String>) -> Self {
        Self {
            kind: TransportErrorKind::Other,
            message: message.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct TransportRequest {
    pub method: &'static str,
    pub url: String,
    pub headers: Vec<(String, String)>,
    pub body: Option<Bytes>,
    /// Stream the response body instead of buffering it.
    pub stream: bool,
    /// Per-credential outbound proxy; falls back to the process default.
    pub proxy: Option<String>,
}

impl TransportRequest {
    pub fn post(url: impl Into<String>) -> Self {
        Self {
            method: "POST",
            url: url.into(),
            headers: Vec::new(),
            body: None,
            stream: false,
            proxy: None,
        }
    }

    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    pub fn body(mut self, body: Bytes) -> Self {
        self.body = Some(body);
        self
    }
}

/// Body chunks for streamed responses; an `Err` ends the stream.
pub type BodyStream = mpsc::Receiver<Result<Bytes, TransportError>>;

pub enum TransportBody {
    Bytes(Bytes),
    Stream(BodyStream),
}

impl TransportBody {
    /// Buffers the body regardless of mode. Only used on error paths.
    pub async fn collect(self) -> Result<Bytes, TransportError> {
        match self {
            TransportBody::Bytes(bytes) => Ok(bytes),
            TransportBody::Stream(mut rx) => {
                let mut out = Vec::new();
                while let Some(chunk) = rx.recv().await {
                    out.extend_from_slice(&chunk?);
                }
                Ok(Bytes::from(out))
            }
        }
    }
}

pub struct TransportResponse {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    pub body: TransportBody,
}

#[async_trait]
pub trait UpstreamTransport: Send + Sync {
    async fn send(&self, request: TransportRequest) -> Result<TransportResponse, TransportError>;
}

#[derive(Debug, Clone)]
pub struct WreqTransportConfig {
    pub default_proxy: Option<String>,
    pub connect_timeout: Duration,
    pub request_timeout: Duration,
    pub stream_idle_timeout: Duration,
}

impl Default for WreqTransportConfig {
    fn default() -> Self {
        Self {
            default_proxy: None,
            connect_timeout: Duration::from_secs(5),
            request_timeout: Duration::from_secs(86400),
            stream_idle_timeout: Duration::from_secs(30),
        }
    }
}

/// `wreq`-backed transport with a per-proxy client cache.
pub struct WreqTransport {
    config: WreqTransportConfig,
    clients: Mutex<HashMap<Option<String>, wreq::Client>>,
}

impl WreqTransport {
    pub fn new(config: WreqTransportConfig) -> Self {
        Self {
            config,
            clients: Mutex::new(HashMap::new()),
        }
    }

    fn client_for(&self, proxy: Option<&str>) -> Result<wreq::Client, TransportError> {
        let proxy = proxy
            .map(str::trim)
            .filter(|p| !p.is_empty())
            .map(str::to_string)
            .or_else(|| self.config.default_proxy.clone());
        let mut guard = self
            .clients
            .lock()
            .map_err(|_| TransportError::other("client cache lock poisoned"))?;
        if let Some(client) = guard.get(&proxy) {
            return Ok(client.clone());
        }
        let mut builder = wreq::Client::builder()
            .connect_timeout(self.config.connect_timeout)
            .timeout(self.config.request_timeout)
            .read_timeout(self.config.stream_idle_timeout);
        if let Some(proxy_url) = proxy.as_deref() {
            let parsed = wreq::Proxy::all(proxy_url)
                .map_err(|err| TransportError::other(err.to_string()))?;
            builder = builder.proxy(parsed);
        }
        let client = builder
            .build()
            .map_err(|err| TransportError::other(err.to_string()))?;
        guard.insert(proxy, client.clone());
        Ok(client)
    }
}

#[async_trait]
impl UpstreamTransport for WreqTransport {
    async fn send(&self, request: TransportRequest) -> Result<TransportResponse, TransportError> {
        let client = self.client_for(request.proxy.as_deref())?;
        let method = match request.method {
            "GET" => wreq::Method::GET,
            "PUT" => wreq::Method::PUT,
            "DELETE" => wreq::Method::DELETE,
            _ => wreq::Method::POST,
        };
        let mut builder = client.request(method, &request.url);
        for (name, value) in &request.headers {
            builder = builder.header(name, value);
        }
        if let Some(body) = request.body.clone() {
            builder = builder.body(body);
        }

        let response = builder.send().await.map_err(map_wreq_error)?;
        let status = response.status().as_u16();
        let headers = response
            .headers()
            .iter()
            .filter_map(|(name, value)| {
                value
                    .to_str()
                    .ok()
                    .map(|v| (name.as_str().to_string(), v.to_string()))
            })
            .collect();

        let success = (200..300).contains(&status);
        if !success || !request.stream {
            let bytes = response.bytes().await.map_err(map_wreq_error)?;
            return Ok(TransportResponse {
                status,
                headers,
                body: TransportBody::Bytes(bytes),
            });
        }

        let (tx, rx) = mpsc::channel::<Result<Bytes, TransportError>>(16);
        tokio::spawn(async move {
            let mut stream = response.bytes_stream();
            while let Some(item) = stream.next().await {
                let out = item.map_err(map_wreq_error);
                let is_err = out.is_err();
                if tx.send(out).await.is_err() || is_err {
                    break;
                }
            }
        });
        Ok(TransportResponse {
            status,
            headers,
            body: TransportBody::Stream(rx),
        })
    }
}

fn map_wreq_error(err: wreq::Error) -> TransportError {
    let message = err.to_string();
    let kind = if err.is_timeout() {
        TransportErrorKind::Timeout
    } else if err.is_connect() {
        TransportErrorKind::Connect
    } else {
        TransportErrorKind::Other
    };
    TransportError { kind, message }
}

pub fn header_value<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(key, _)| key.eq_ignore_ascii_case(name))
        .map(|(_, value)| value.as_str())
}
