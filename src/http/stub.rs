//! Scripted transport for deterministic tests.
//!
//! [`StubTransport`] plays back pre-configured replies in order and records
//! every request it receives, so tests can assert on request shaping and on
//! how many times a URL was fetched without a live server.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use async_trait::async_trait;
use bytes::Bytes;
use futures::StreamExt;
use parking_lot::Mutex;
use serde_json::Value;

use super::{HttpBody, HttpRequest, HttpResponse, HttpTransport};
use crate::error::{RenderifyError, Result};

/// A single scripted reply.
#[derive(Debug, Clone)]
pub struct StubReply {
    pub status: u16,
    pub headers: Vec<(String, String)>,
    /// Body chunks, delivered as a stream when more than one.
    pub chunks: Vec<String>,
    /// Simulated connection failure; when set, everything else is ignored.
    pub network_error: Option<String>,
}

impl StubReply {
    /// A JSON reply.
    pub fn json(status: u16, body: Value) -> Self {
        Self {
            status,
            headers: vec![("content-type".into(), "application/json".into())],
            chunks: vec![body.to_string()],
            network_error: None,
        }
    }

    /// A plain-text reply.
    pub fn text(status: u16, body: impl Into<String>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            chunks: vec![body.into()],
            network_error: None,
        }
    }

    /// A streaming reply delivered chunk by chunk.
    pub fn stream(status: u16, chunks: Vec<String>) -> Self {
        Self {
            status,
            headers: Vec::new(),
            chunks,
            network_error: None,
        }
    }

    /// A simulated connection failure.
    pub fn network_error(message: impl Into<String>) -> Self {
        Self {
            status: 0,
            headers: Vec::new(),
            chunks: Vec::new(),
            network_error: Some(message.into()),
        }
    }

    /// Attach a header.
    pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.headers.push((name.into(), value.into()));
        self
    }

    fn into_response(self) -> Result<HttpResponse> {
        if let Some(message) = self.network_error {
            return Err(RenderifyError::Network(message));
        }
        let mut headers = HashMap::new();
        for (name, value) in self.headers {
            headers.insert(name.to_ascii_lowercase(), value);
        }
        let body = if self.chunks.len() > 1 {
            let chunks: Vec<Result<Bytes>> = self
                .chunks
                .into_iter()
                .map(|c| Ok(Bytes::from(c)))
                .collect();
            HttpBody::Streaming(futures::stream::iter(chunks).boxed())
        } else {
            HttpBody::Buffered(Bytes::from(self.chunks.into_iter().next().unwrap_or_default()))
        };
        Ok(HttpResponse {
            status: self.status,
            headers,
            body,
        })
    }
}

/// Transport that plays back scripted replies in FIFO order.
#[derive(Default)]
pub struct StubTransport {
    replies: Mutex<VecDeque<StubReply>>,
    requests: Mutex<Vec<HttpRequest>>,
}

impl StubTransport {
    pub fn new() -> Self {
        Self::default()
    }

    /// Build a transport pre-loaded with replies.
    pub fn scripted(replies: Vec<StubReply>) -> Arc<Self> {
        let stub = Self::new();
        *stub.replies.lock() = replies.into();
        Arc::new(stub)
    }

    /// Append a reply to the script.
    pub fn enqueue(&self, reply: StubReply) {
        self.replies.lock().push_back(reply);
    }

    /// All requests received so far, in order.
    pub fn requests(&self) -> Vec<HttpRequest> {
        self.requests.lock().clone()
    }

    /// How many requests targeted `url`.
    pub fn count_for(&self, url: &str) -> usize {
        self.requests
            .lock()
            .iter()
            .filter(|r| r.url == url)
            .count()
    }
}

#[async_trait]
impl HttpTransport for StubTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse> {
        self.requests.lock().push(request.clone());
        let reply = self.replies.lock().pop_front().ok_or_else(|| {
            RenderifyError::Other(format!("no scripted reply for {}", request.url))
        })?;
        reply.into_response()
    }
}
