//! Uniform client layer over heterogeneous LLM provider APIs.
//!
//! Each provider client implements [`Interpreter`]: unary calls, incremental
//! streaming, and schema-constrained structured outputs, all normalized into
//! [`LlmResponse`] / [`LlmStreamChunk`] / [`LlmStructuredResponse`].
//!
//! ```text
//! LlmRequest ──► Interpreter ──► Reliability ──► HttpTransport
//!                     │
//!       ┌──────┬──────┼──────────┬──────────┐
//!    OpenAI Anthropic Google   Ollama   LM Studio
//!    SSE       SSE     SSE     NDJSON   (OpenAI wire)
//! ```

pub mod anthropic;
pub mod google;
pub mod lmstudio;
pub mod mock;
pub mod ollama;
pub mod openai;
pub mod registry;
pub mod schema;

use std::collections::BTreeMap;

use async_trait::async_trait;
use futures::stream::BoxStream;
use serde_json::Value;
use tokio_util::sync::CancellationToken;

use crate::error::Result;
use crate::http::tolerant::format_context;

/// The only structured output format the clients accept.
pub const STRUCTURED_FORMAT_RUNTIME_PLAN: &str = "runtime-plan";

/// A normalized LLM request. Immutable per call.
#[derive(Debug, Clone, Default)]
pub struct LlmRequest {
    /// The user prompt text.
    pub prompt: String,
    /// Context map serialized into the prompt when non-empty.
    pub context: BTreeMap<String, Value>,
    /// Request-level system prompt, composed with configured and template
    /// system prompts per provider order.
    pub system_prompt: Option<String>,
    /// Caller cancellation token.
    pub signal: Option<CancellationToken>,
}

impl LlmRequest {
    pub fn new(prompt: impl Into<String>) -> Self {
        Self {
            prompt: prompt.into(),
            ..Self::default()
        }
    }

    pub fn with_context(mut self, context: BTreeMap<String, Value>) -> Self {
        self.context = context;
        self
    }

    pub fn with_system_prompt(mut self, system: impl Into<String>) -> Self {
        self.system_prompt = Some(system.into());
        self
    }

    pub fn with_signal(mut self, signal: CancellationToken) -> Self {
        self.signal = Some(signal);
        self
    }

    /// The prompt with the serialized context appended, when present.
    pub fn prompt_with_context(&self) -> String {
        let context = format_context(&self.context);
        if context.is_empty() {
            self.prompt.clone()
        } else {
            format!("{}\n\nContext: {}", self.prompt, context)
        }
    }
}

/// A normalized unary response.
#[derive(Debug, Clone)]
pub struct LlmResponse {
    /// The generated text.
    pub text: String,
    /// Total token count, synthesized from split counters when the provider
    /// exposes them.
    pub tokens_used: Option<u64>,
    /// Model identifier reported by the provider.
    pub model: Option<String>,
    /// The provider's raw response payload.
    pub raw: Value,
}

/// One chunk of an incremental stream.
#[derive(Debug, Clone)]
pub struct LlmStreamChunk {
    /// New text in this chunk.
    pub delta: String,
    /// Cumulative text: concatenation of all deltas so far.
    pub text: String,
    /// Exactly one chunk per stream has `done = true`.
    pub done: bool,
    /// 1-based, strictly increasing by 1.
    pub index: u64,
    pub tokens_used: Option<u64>,
    pub model: Option<String>,
    /// The provider frame this chunk was derived from.
    pub raw: Value,
}

/// Outcome of a structured (schema-constrained) call.
#[derive(Debug, Clone)]
pub struct LlmStructuredResponse {
    pub valid: bool,
    /// The parsed value when `valid`, or the best-effort parse otherwise.
    pub value: Option<Value>,
    pub errors: Vec<String>,
    pub tokens_used: Option<u64>,
    pub model: Option<String>,
    pub raw: Value,
}

impl LlmStructuredResponse {
    /// The response for a format the client does not support. No HTTP call
    /// is made.
    pub fn unsupported_format(format: &str) -> Self {
        Self {
            valid: false,
            value: None,
            errors: vec![format!("Unsupported structured format: {format}")],
            tokens_used: None,
            model: None,
            raw: Value::Null,
        }
    }
}

/// Lazy finite chunk sequence. Pull-based: the HTTP reader advances only as
/// the consumer requests chunks.
pub type LlmStream = BoxStream<'static, Result<LlmStreamChunk>>;

/// Uniform provider client interface.
#[async_trait]
pub trait Interpreter: Send + Sync {
    /// Provider display name used in error messages (e.g. `"OpenAI"`).
    fn name(&self) -> &str;

    /// Overlay configuration. Only keys present in `options` are applied;
    /// both canonical and `llm`-prefixed alias keys are honored.
    fn configure(&mut self, options: &Value);

    /// Unary text generation.
    async fn generate_response(&self, request: &LlmRequest) -> Result<LlmResponse>;

    /// Incremental streaming generation.
    async fn generate_response_stream(&self, request: &LlmRequest) -> Result<LlmStream>;

    /// Schema-constrained generation. Only `format = "runtime-plan"` is
    /// supported; anything else returns `valid: false` without an HTTP call.
    async fn generate_structured_response(
        &self,
        request: &LlmRequest,
        format: &str,
    ) -> Result<LlmStructuredResponse>;

    /// Store a named prompt template. The `"default"` template participates
    /// in system prompt composition.
    fn set_prompt_template(&mut self, name: &str, template: &str);

    /// Fetch a named prompt template.
    fn get_prompt_template(&self, name: &str) -> Option<String>;
}

/// Deterministic instruction appended to structured requests.
pub(crate) const STRUCTURED_INSTRUCTION: &str = "Return only a single JSON object, with no \
markdown fences or commentary. The JSON must conform to the runtime-plan schema; when the \
schema and the prompt conflict, the schema takes priority. Treat the schema as strict: do \
not invent fields it does not define.";

/// Collect the non-empty, trimmed system prompt parts in composition order:
/// configured, template `"default"`, request-supplied.
pub(crate) fn system_parts(
    configured: Option<&str>,
    template_default: Option<&str>,
    requested: Option<&str>,
) -> Vec<String> {
    [configured, template_default, requested]
        .into_iter()
        .flatten()
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .map(str::to_string)
        .collect()
}

/// Join system parts with blank lines; `None` when empty.
pub(crate) fn join_system_parts(parts: &[String]) -> Option<String> {
    if parts.is_empty() {
        None
    } else {
        Some(parts.join("\n\n"))
    }
}

/// Synthesize a total token count from split counters.
pub(crate) fn sum_tokens(input: Option<u64>, output: Option<u64>) -> Option<u64> {
    match (input, output) {
        (None, None) => None,
        (a, b) => Some(a.unwrap_or(0) + b.unwrap_or(0)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn prompt_with_context_appends_json() {
        let mut context = BTreeMap::new();
        context.insert("user".to_string(), json!("ada"));
        let request = LlmRequest::new("hello").with_context(context);
        assert_eq!(
            request.prompt_with_context(),
            "hello\n\nContext: {\"user\":\"ada\"}"
        );
        assert_eq!(LlmRequest::new("hello").prompt_with_context(), "hello");
    }

    #[test]
    fn system_parts_skip_blank_entries() {
        let parts = system_parts(Some("  one  "), Some(""), Some("three"));
        assert_eq!(parts, vec!["one".to_string(), "three".to_string()]);
        assert_eq!(
            join_system_parts(&parts).unwrap(),
            "one\n\nthree"
        );
        assert_eq!(join_system_parts(&[]), None);
    }

    #[test]
    fn token_synthesis() {
        assert_eq!(sum_tokens(Some(10), Some(32)), Some(42));
        assert_eq!(sum_tokens(Some(10), None), Some(10));
        assert_eq!(sum_tokens(None, None), None);
    }

    #[test]
    fn unsupported_format_shape() {
        let response = LlmStructuredResponse::unsupported_format("yaml-plan");
        assert!(!response.valid);
        assert_eq!(
            response.errors,
            vec!["Unsupported structured format: yaml-plan".to_string()]
        );
    }
}
