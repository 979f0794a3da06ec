//! Mock interpreter for testing without a live provider.
//!
//! Returns pre-configured responses in order, cycling when exhausted. Useful
//! for downstream consumers writing deterministic tests and for
//! `RENDERIFY_LLM_PROVIDER=mock`.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::Value;

use super::schema::structured_from_text;
use super::{
    Interpreter, LlmRequest, LlmResponse, LlmStream, LlmStreamChunk,
    LlmStructuredResponse, STRUCTURED_FORMAT_RUNTIME_PLAN,
};
use crate::error::Result;
use crate::options::{pick, pick_u64};

/// A test interpreter that returns canned responses in order.
pub struct MockInterpreter {
    responses: Vec<String>,
    index: AtomicUsize,
    delay_ms: u64,
    templates: BTreeMap<String, String>,
}

impl MockInterpreter {
    /// Create a mock with the given canned responses. Cycles when exhausted.
    pub fn new(responses: Vec<String>) -> Self {
        let responses = if responses.is_empty() {
            vec!["mock response".to_string()]
        } else {
            responses
        };
        Self {
            responses,
            index: AtomicUsize::new(0),
            delay_ms: 0,
            templates: BTreeMap::new(),
        }
    }

    /// A mock that always returns the same response.
    pub fn fixed(response: impl Into<String>) -> Self {
        Self::new(vec![response.into()])
    }

    fn next_response(&self) -> String {
        let idx = self.index.fetch_add(1, Ordering::Relaxed) % self.responses.len();
        self.responses[idx].clone()
    }

    async fn simulate_latency(&self) {
        if self.delay_ms > 0 {
            tokio::time::sleep(Duration::from_millis(self.delay_ms)).await;
        }
    }
}

impl Default for MockInterpreter {
    fn default() -> Self {
        Self::new(Vec::new())
    }
}

#[async_trait]
impl Interpreter for MockInterpreter {
    fn name(&self) -> &str {
        "Mock"
    }

    fn configure(&mut self, options: &Value) {
        if let Some(responses) = pick(options, "responses").and_then(Value::as_array) {
            let scripted: Vec<String> = responses
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect();
            if !scripted.is_empty() {
                self.responses = scripted;
                self.index.store(0, Ordering::Relaxed);
            }
        }
        if let Some(delay) = pick_u64(options, "delayMs") {
            self.delay_ms = delay;
        }
    }

    async fn generate_response(&self, _request: &LlmRequest) -> Result<LlmResponse> {
        self.simulate_latency().await;
        let text = self.next_response();
        Ok(LlmResponse {
            text,
            tokens_used: None,
            model: Some("mock".to_string()),
            raw: Value::Null,
        })
    }

    async fn generate_response_stream(&self, _request: &LlmRequest) -> Result<LlmStream> {
        self.simulate_latency().await;
        let text = self.next_response();
        let chunks = vec![
            Ok(LlmStreamChunk {
                delta: text.clone(),
                text: text.clone(),
                done: false,
                index: 1,
                tokens_used: None,
                model: Some("mock".to_string()),
                raw: Value::Null,
            }),
            Ok(LlmStreamChunk {
                delta: String::new(),
                text,
                done: true,
                index: 2,
                tokens_used: None,
                model: Some("mock".to_string()),
                raw: Value::Null,
            }),
        ];
        Ok(Box::pin(futures::stream::iter(chunks)))
    }

    async fn generate_structured_response(
        &self,
        _request: &LlmRequest,
        format: &str,
    ) -> Result<LlmStructuredResponse> {
        if format != STRUCTURED_FORMAT_RUNTIME_PLAN {
            return Ok(LlmStructuredResponse::unsupported_format(format));
        }
        self.simulate_latency().await;
        let text = self.next_response();
        Ok(structured_from_text(
            &text,
            None,
            Some("mock".to_string()),
            Value::Null,
        ))
    }

    fn set_prompt_template(&mut self, name: &str, template: &str) {
        self.templates.insert(name.to_string(), template.to_string());
    }

    fn get_prompt_template(&self, name: &str) -> Option<String> {
        self.templates.get(name).cloned()
    }
}
