//! HTTP transport abstraction and shared wire utilities.
//!
//! Provider clients and the module loader never call `reqwest` directly:
//! everything goes through the [`HttpTransport`] capability, injected once at
//! init. Tests substitute [`StubTransport`](stub::StubTransport) with scripted
//! responses.

pub mod ndjson;
pub mod sse;
pub mod stub;
pub mod tolerant;

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;
use futures::StreamExt;
use serde_json::Value;

use crate::error::{RenderifyError, Result};

/// A stream of raw body chunks.
pub type ByteStream = BoxStream<'static, Result<Bytes>>;

/// HTTP method. Only the verbs the runtime actually uses.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HttpMethod {
    Get,
    Post,
}

/// An outbound HTTP request.
#[derive(Debug, Clone)]
pub struct HttpRequest {
    pub method: HttpMethod,
    pub url: String,
    /// Header pairs in insertion order.
    pub headers: Vec<(String, String)>,
    /// JSON body for POST requests.
    pub body: Option<Value>,
}

impl HttpRequest {
    /// Build a GET request.
    pub fn get(url: impl Into<String>) -> Self {
        Self {
            method: HttpMethod::Get,
            url: url.into(),
            headers: Vec::new(),
            body: None,
        }
    }

    /// Build a POST request with a JSON body.
    pub fn post(url: impl Into<String>, body: Value) -> Self {
        Self {
            method: HttpMethod::Post,
            url: url.into(),
            headers: Vec::new(),
            body: Some(body),
        }
    }

    /// Append a header.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }
}

/// Response body: buffered up front or streamed chunk by chunk.
pub enum HttpBody {
    Buffered(Bytes),
    Streaming(ByteStream),
}

impl std::fmt::Debug for HttpBody {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            HttpBody::Buffered(b) => f.debug_tuple("Buffered").field(&b.len()).finish(),
            HttpBody::Streaming(_) => f.write_str("Streaming(..)"),
        }
    }
}

/// A normalized HTTP response.
#[derive(Debug)]
pub struct HttpResponse {
    pub status: u16,
    /// Header map with lowercased names.
    pub headers: HashMap<String, String>,
    pub body: HttpBody,
}

impl HttpResponse {
    /// Build a buffered response (handy for stubs).
    pub fn buffered(status: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status,
            headers: HashMap::new(),
            body: HttpBody::Buffered(body.into()),
        }
    }

    /// Whether the status is 2xx.
    pub fn ok(&self) -> bool {
        (200..300).contains(&self.status)
    }

    /// Header value by case-insensitive name.
    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(&name.to_ascii_lowercase()).map(|s| s.as_str())
    }

    /// Parsed `Retry-After` header (integer seconds form only).
    pub fn retry_after(&self) -> Option<Duration> {
        self.header("retry-after")
            .and_then(|v| v.trim().parse::<u64>().ok())
            .map(Duration::from_secs)
    }

    /// Collect the full body as bytes.
    pub async fn bytes(self) -> Result<Bytes> {
        match self.body {
            HttpBody::Buffered(b) => Ok(b),
            HttpBody::Streaming(mut stream) => {
                let mut out = Vec::new();
                while let Some(chunk) = stream.next().await {
                    out.extend_from_slice(&chunk?);
                }
                Ok(Bytes::from(out))
            }
        }
    }

    /// Collect the full body as UTF-8 text (lossy).
    pub async fn text(self) -> Result<String> {
        let bytes = self.bytes().await?;
        Ok(String::from_utf8_lossy(&bytes).into_owned())
    }

    /// Collect and parse the full body as JSON.
    pub async fn json(self) -> Result<Value> {
        let bytes = self.bytes().await?;
        Ok(serde_json::from_slice(&bytes)?)
    }

    /// Turn the body into a chunk stream regardless of its form.
    pub fn into_byte_stream(self) -> ByteStream {
        match self.body {
            HttpBody::Buffered(b) => futures::stream::once(async move { Ok(b) }).boxed(),
            HttpBody::Streaming(stream) => stream,
        }
    }
}

/// Capability trait over the host's `fetch`.
///
/// Exactly one production implementation exists ([`ReqwestTransport`]);
/// everything else in the crate is written against the trait so tests can
/// script responses.
#[async_trait]
pub trait HttpTransport: Send + Sync {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse>;
}

/// Shared handle to a transport.
pub type SharedTransport = Arc<dyn HttpTransport>;

/// Production transport over a shared `reqwest::Client`.
///
/// The client carries no per-request timeout: timeouts are enforced by the
/// [`TimeoutScope`](crate::scope::TimeoutScope) wrapping every call.
#[derive(Debug, Clone, Default)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    pub fn new() -> Self {
        Self {
            client: reqwest::Client::new(),
        }
    }

    pub fn with_client(client: reqwest::Client) -> Self {
        Self { client }
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        let mut req = match request.method {
            HttpMethod::Get => self.client.get(&request.url),
            HttpMethod::Post => self.client.post(&request.url),
        };
        for (name, value) in &request.headers {
            req = req.header(name.as_str(), value.as_str());
        }
        if let Some(body) = &request.body {
            req = req.json(body);
        }

        let resp = req.send().await.map_err(|e| {
            RenderifyError::Network(format!("Failed to connect to {}: {}", request.url, e))
        })?;
        let status = resp.status().as_u16();
        let mut headers = HashMap::new();
        for (name, value) in resp.headers() {
            if let Ok(v) = value.to_str() {
                headers.insert(name.as_str().to_ascii_lowercase(), v.to_string());
            }
        }

        let stream = resp
            .bytes_stream()
            .map(|chunk| chunk.map_err(RenderifyError::Request))
            .boxed();

        Ok(HttpResponse {
            status,
            headers,
            body: HttpBody::Streaming(stream),
        })
    }
}
