//! LM Studio client.
//!
//! LM Studio exposes an OpenAI-compatible local server, so this client is a
//! composition over [`OpenAiInterpreter`] with local defaults rather than a
//! subclass: same wire behavior, different display name and defaults.

use async_trait::async_trait;
use serde_json::Value;

use super::openai::{OpenAiInterpreter, OpenAiOptions};
use super::{Interpreter, LlmRequest, LlmResponse, LlmStream, LlmStructuredResponse};
use crate::error::Result;
use crate::http::SharedTransport;

/// Client for a local LM Studio server.
pub struct LmStudioInterpreter {
    inner: OpenAiInterpreter,
}

impl LmStudioInterpreter {
    pub fn new(transport: SharedTransport) -> Self {
        let options = OpenAiOptions {
            base_url: "http://127.0.0.1:1234/v1".to_string(),
            api_key: Some("lm-studio".to_string()),
            model: "qwen2.5-coder-7b-instruct".to_string(),
            ..OpenAiOptions::default()
        };
        Self {
            inner: OpenAiInterpreter::with_label(transport, "LM Studio", options),
        }
    }

    pub fn options(&self) -> &OpenAiOptions {
        self.inner.options()
    }
}

#[async_trait]
impl Interpreter for LmStudioInterpreter {
    fn name(&self) -> &str {
        self.inner.name()
    }

    fn configure(&mut self, options: &Value) {
        self.inner.configure(options);
    }

    async fn generate_response(&self, request: &LlmRequest) -> Result<LlmResponse> {
        self.inner.generate_response(request).await
    }

    async fn generate_response_stream(&self, request: &LlmRequest) -> Result<LlmStream> {
        self.inner.generate_response_stream(request).await
    }

    async fn generate_structured_response(
        &self,
        request: &LlmRequest,
        format: &str,
    ) -> Result<LlmStructuredResponse> {
        self.inner.generate_structured_response(request, format).await
    }

    fn set_prompt_template(&mut self, name: &str, template: &str) {
        self.inner.set_prompt_template(name, template);
    }

    fn get_prompt_template(&self, name: &str) -> Option<String> {
        self.inner.get_prompt_template(name)
    }
}
