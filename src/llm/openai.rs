//! OpenAI chat-completions client.
//!
//! POSTs `{baseUrl}/chat/completions` with `Authorization: Bearer` and the
//! optional `OpenAI-Organization` / `OpenAI-Project` headers. Streaming uses
//! SSE with JSON frames and a `data: [DONE]` terminator; structured calls use
//! the `json_schema` response format with the runtime-plan schema.
//!
//! LM Studio speaks the same wire format; its client is a thin composition
//! over this one (see [`lmstudio`](super::lmstudio)).

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tracing::debug;

use super::schema::{runtime_plan_schema, structured_from_text};
use super::{
    sum_tokens, system_parts, Interpreter, LlmRequest, LlmResponse, LlmStream, LlmStreamChunk,
    LlmStructuredResponse, STRUCTURED_FORMAT_RUNTIME_PLAN, STRUCTURED_INSTRUCTION,
};
use crate::error::{RenderifyError, Result};
use crate::http::sse::SseParser;
use crate::http::tolerant::extract_error_message;
use crate::http::{HttpRequest, SharedTransport};
use crate::options::{pick_bool, pick_f64, pick_str, pick_u64};
use crate::reliability::{Reliability, ReliabilityConfig};
use crate::scope::TimeoutScope;

/// Resolved OpenAI client options.
#[derive(Debug, Clone)]
pub struct OpenAiOptions {
    pub api_key: Option<String>,
    pub organization: Option<String>,
    pub project: Option<String>,
    pub model: String,
    pub base_url: String,
    pub timeout_ms: u64,
    pub system_prompt: Option<String>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u64>,
    /// Sent as the `strict` flag on structured requests.
    pub strict_schema: bool,
}

impl Default for OpenAiOptions {
    fn default() -> Self {
        Self {
            api_key: None,
            organization: None,
            project: None,
            model: "gpt-4.1-mini".to_string(),
            base_url: "https://api.openai.com/v1".to_string(),
            timeout_ms: 60_000,
            system_prompt: None,
            temperature: None,
            max_tokens: None,
            strict_schema: true,
        }
    }
}

/// Client for the OpenAI chat-completions wire format.
pub struct OpenAiInterpreter {
    label: String,
    transport: SharedTransport,
    reliability: Reliability,
    options: OpenAiOptions,
    templates: BTreeMap<String, String>,
}

impl OpenAiInterpreter {
    pub fn new(transport: SharedTransport) -> Self {
        Self::with_label(transport, "OpenAI", OpenAiOptions::default())
    }

    /// Used by wire-compatible providers that reuse this client under their
    /// own display name and defaults.
    pub(crate) fn with_label(
        transport: SharedTransport,
        label: impl Into<String>,
        options: OpenAiOptions,
    ) -> Self {
        Self {
            label: label.into(),
            transport,
            reliability: Reliability::new(ReliabilityConfig::default()),
            options,
            templates: BTreeMap::new(),
        }
    }

    pub fn options(&self) -> &OpenAiOptions {
        &self.options
    }

    fn op(&self) -> String {
        format!("{} request", self.label)
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/chat/completions",
            self.options.base_url.trim_end_matches('/')
        )
    }

    fn scope_for(&self, request: &LlmRequest) -> TimeoutScope {
        TimeoutScope::new(
            self.op(),
            Duration::from_millis(self.options.timeout_ms),
            request.signal.clone(),
        )
    }

    fn build_messages(&self, request: &LlmRequest, structured: bool) -> Vec<Value> {
        // One system message per non-empty part, in composition order.
        let mut parts = system_parts(
            self.options.system_prompt.as_deref(),
            self.templates.get("default").map(String::as_str),
            request.system_prompt.as_deref(),
        );
        if structured {
            parts.push(STRUCTURED_INSTRUCTION.to_string());
        }

        let mut messages: Vec<Value> = parts
            .iter()
            .map(|part| json!({"role": "system", "content": part}))
            .collect();
        messages.push(json!({"role": "user", "content": request.prompt_with_context()}));
        messages
    }

    fn build_body(&self, request: &LlmRequest, stream: bool, structured: bool) -> Value {
        let mut body = json!({
            "model": self.options.model,
            "messages": self.build_messages(request, structured),
        });
        if let Some(temperature) = self.options.temperature {
            body["temperature"] = json!(temperature);
        }
        if let Some(max_tokens) = self.options.max_tokens {
            body["max_tokens"] = json!(max_tokens);
        }
        if stream {
            body["stream"] = json!(true);
            body["stream_options"] = json!({"include_usage": true});
        }
        if structured {
            body["response_format"] = json!({
                "type": "json_schema",
                "json_schema": {
                    "name": "runtime_plan",
                    "strict": self.options.strict_schema,
                    "schema": runtime_plan_schema(),
                }
            });
        }
        body
    }

    fn request_for(&self, url: &str, body: Value) -> HttpRequest {
        let mut request = HttpRequest::post(url, body);
        if let Some(key) = &self.options.api_key {
            request = request.header("Authorization", format!("Bearer {key}"));
        }
        if let Some(org) = &self.options.organization {
            request = request.header("OpenAI-Organization", org.clone());
        }
        if let Some(project) = &self.options.project {
            request = request.header("OpenAI-Project", project.clone());
        }
        request
    }

    /// Guarded POST returning the parsed success payload.
    async fn post_json(&self, scope: &TimeoutScope, body: Value) -> Result<Value> {
        let op = self.op();
        let url = self.endpoint();
        let response = self
            .reliability
            .call(&op, scope, || {
                let transport = Arc::clone(&self.transport);
                let request = self.request_for(&url, body.clone());
                async move { transport.send(request).await }
            })
            .await?;

        if !response.ok() {
            let status = response.status;
            let text = scope.guard(response.text()).await.unwrap_or_default();
            let message = extract_error_message(&text);
            return Err(RenderifyError::Provider {
                status,
                message: format!("{} failed ({status}): {message}", op),
            });
        }
        scope.guard(response.json()).await
    }

    fn message_text(&self, payload: &Value) -> Result<String> {
        let message = &payload["choices"][0]["message"];
        if let Some(refusal) = message["refusal"].as_str() {
            if !refusal.is_empty() {
                return Err(RenderifyError::Refused {
                    message: format!("{} refused request: {refusal}", self.label),
                });
            }
        }
        Ok(content_text(&message["content"]))
    }

    fn usage_tokens(payload: &Value) -> Option<u64> {
        let usage = payload.get("usage")?;
        usage.get("total_tokens").and_then(Value::as_u64).or_else(|| {
            sum_tokens(
                usage.get("prompt_tokens").and_then(Value::as_u64),
                usage.get("completion_tokens").and_then(Value::as_u64),
            )
        })
    }
}

/// Extract delta or message content that may be a string or an array of
/// `{text}` parts.
fn content_text(content: &Value) -> String {
    match content {
        Value::String(s) => s.clone(),
        Value::Array(parts) => parts
            .iter()
            .filter_map(|p| p["text"].as_str())
            .collect::<Vec<_>>()
            .concat(),
        _ => String::new(),
    }
}

#[async_trait]
impl Interpreter for OpenAiInterpreter {
    fn name(&self) -> &str {
        &self.label
    }

    fn configure(&mut self, options: &Value) {
        if let Some(v) = pick_str(options, "apiKey") {
            self.options.api_key = Some(v);
        }
        if let Some(v) = pick_str(options, "organization") {
            self.options.organization = Some(v);
        }
        if let Some(v) = pick_str(options, "project") {
            self.options.project = Some(v);
        }
        if let Some(v) = pick_str(options, "model") {
            self.options.model = v;
        }
        if let Some(v) = pick_str(options, "baseUrl") {
            self.options.base_url = v;
        }
        if let Some(v) = pick_u64(options, "timeoutMs") {
            self.options.timeout_ms = v.max(1);
        }
        if let Some(v) = pick_str(options, "systemPrompt") {
            self.options.system_prompt = Some(v);
        }
        if let Some(v) = pick_f64(options, "temperature") {
            self.options.temperature = Some(v);
        }
        if let Some(v) = pick_u64(options, "maxTokens") {
            self.options.max_tokens = Some(v);
        }
        if let Some(v) = pick_bool(options, "strictSchema") {
            self.options.strict_schema = v;
        }
        let config = self.reliability.config().clone().overlay(options);
        self.reliability.set_config(config);
    }

    async fn generate_response(&self, request: &LlmRequest) -> Result<LlmResponse> {
        let scope = self.scope_for(request);
        let body = self.build_body(request, false, false);
        let payload = self.post_json(&scope, body).await?;
        scope.release();

        let text = self.message_text(&payload)?;
        Ok(LlmResponse {
            text,
            tokens_used: Self::usage_tokens(&payload),
            model: payload["model"].as_str().map(str::to_string),
            raw: payload,
        })
    }

    async fn generate_response_stream(&self, request: &LlmRequest) -> Result<LlmStream> {
        let op = self.op();
        let scope = self.scope_for(request);
        let url = self.endpoint();
        let body = self.build_body(request, true, false);
        let response = self
            .reliability
            .call(&op, &scope, || {
                let transport = Arc::clone(&self.transport);
                let request = self.request_for(&url, body.clone());
                async move { transport.send(request).await }
            })
            .await?;

        if !response.ok() {
            let status = response.status;
            let text = scope.guard(response.text()).await.unwrap_or_default();
            let message = extract_error_message(&text);
            return Err(RenderifyError::Provider {
                status,
                message: format!("{op} failed ({status}): {message}"),
            });
        }

        let label = self.label.clone();
        let stream = async_stream::try_stream! {
            let mut parser = SseParser::new();
            let mut bytes = response.into_byte_stream();
            let mut text = String::new();
            let mut index: u64 = 0;
            let mut tokens: Option<u64> = None;
            let mut model: Option<String> = None;
            let mut finished = false;

            'read: loop {
                let next = tokio::select! {
                    biased;
                    _ = scope.token().cancelled() => None,
                    next = bytes.next() => Some(next),
                };
                let next = match next {
                    None => {
                        Err(scope.abort_error())?;
                        unreachable!()
                    }
                    Some(next) => next,
                };
                let Some(chunk) = next else { break 'read };
                let chunk = chunk?;
                for event in parser.push(&String::from_utf8_lossy(&chunk)) {
                    if event.data == "[DONE]" {
                        index += 1;
                        yield LlmStreamChunk {
                            delta: String::new(),
                            text: text.clone(),
                            done: true,
                            index,
                            tokens_used: tokens,
                            model: model.clone(),
                            raw: Value::Null,
                        };
                        finished = true;
                        break 'read;
                    }
                    let Ok(frame) = serde_json::from_str::<Value>(&event.data) else {
                        continue;
                    };
                    let delta_obj = &frame["choices"][0]["delta"];
                    if let Some(refusal) = delta_obj["refusal"].as_str() {
                        if !refusal.is_empty() {
                            Err(RenderifyError::Refused {
                                message: format!("{label} refused request: {refusal}"),
                            })?;
                        }
                    }
                    if let Some(t) = Self::usage_tokens(&frame) {
                        tokens = Some(t);
                    }
                    if model.is_none() {
                        model = frame["model"].as_str().map(str::to_string);
                    }
                    let delta = content_text(&delta_obj["content"]);
                    if !delta.is_empty() {
                        index += 1;
                        text.push_str(&delta);
                        yield LlmStreamChunk {
                            delta,
                            text: text.clone(),
                            done: false,
                            index,
                            tokens_used: None,
                            model: model.clone(),
                            raw: frame,
                        };
                    }
                }
            }

            if !finished {
                // EOF without [DONE]: pick up any trailing frame, then close.
                for event in parser.flush() {
                    if event.data == "[DONE]" {
                        continue;
                    }
                    if let Ok(frame) = serde_json::from_str::<Value>(&event.data) {
                        if let Some(t) = Self::usage_tokens(&frame) {
                            tokens = Some(t);
                        }
                        let delta = content_text(&frame["choices"][0]["delta"]["content"]);
                        if !delta.is_empty() {
                            index += 1;
                            text.push_str(&delta);
                            yield LlmStreamChunk {
                                delta,
                                text: text.clone(),
                                done: false,
                                index,
                                tokens_used: None,
                                model: model.clone(),
                                raw: frame,
                            };
                        }
                    }
                }
                index += 1;
                yield LlmStreamChunk {
                    delta: String::new(),
                    text: text.clone(),
                    done: true,
                    index,
                    tokens_used: tokens,
                    model: model.clone(),
                    raw: Value::Null,
                };
            }
            debug!(chunks = index, "stream complete");
            scope.release();
        };

        Ok(Box::pin(stream))
    }

    async fn generate_structured_response(
        &self,
        request: &LlmRequest,
        format: &str,
    ) -> Result<LlmStructuredResponse> {
        if format != STRUCTURED_FORMAT_RUNTIME_PLAN {
            return Ok(LlmStructuredResponse::unsupported_format(format));
        }

        let scope = self.scope_for(request);
        let body = self.build_body(request, false, true);
        let payload = self.post_json(&scope, body).await?;
        scope.release();

        let text = self.message_text(&payload)?;
        let tokens = Self::usage_tokens(&payload);
        let model = payload["model"].as_str().map(str::to_string);
        Ok(structured_from_text(&text, tokens, model, payload))
    }

    fn set_prompt_template(&mut self, name: &str, template: &str) {
        self.templates.insert(name.to_string(), template.to_string());
    }

    fn get_prompt_template(&self, name: &str) -> Option<String> {
        self.templates.get(name).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::stub::{StubReply, StubTransport};

    fn client(stub: Arc<StubTransport>) -> OpenAiInterpreter {
        let mut client = OpenAiInterpreter::new(stub);
        client.configure(&json!({
            "apiKey": "k",
            "model": "gpt-4.1-mini",
            "retryBaseDelayMs": 1,
            "retryJitterMs": 0,
        }));
        client
    }

    #[tokio::test]
    async fn unary_text_normalizes_response() {
        let stub = StubTransport::scripted(vec![StubReply::json(
            200,
            json!({
                "id": "c1",
                "model": "gpt-4.1-mini",
                "usage": {"total_tokens": 42},
                "choices": [{"message": {"content": "ok"}}]
            }),
        )]);
        let client = client(Arc::clone(&stub));

        let response = client
            .generate_response(&LlmRequest::new("p"))
            .await
            .unwrap();
        assert_eq!(response.text, "ok");
        assert_eq!(response.tokens_used, Some(42));
        assert_eq!(response.model.as_deref(), Some("gpt-4.1-mini"));

        let requests = stub.requests();
        assert_eq!(requests.len(), 1);
        assert!(requests[0].url.ends_with("/chat/completions"));
        let auth = requests[0]
            .headers
            .iter()
            .find(|(name, _)| name == "Authorization")
            .unwrap();
        assert_eq!(auth.1, "Bearer k");
    }

    #[tokio::test]
    async fn unary_error_surfaces_body_message() {
        let stub = StubTransport::scripted(vec![StubReply::json(
            401,
            json!({"error": {"message": "bad key"}}),
        )]);
        let client = client(stub);
        let err = client
            .generate_response(&LlmRequest::new("p"))
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "OpenAI request failed (401): bad key"
        );
        assert_eq!(err.status(), Some(401));
    }

    #[tokio::test]
    async fn streaming_chunks_accumulate_and_close_once() {
        let frames = vec![
            "data: {\"model\":\"gpt-4.1-mini\",\"choices\":[{\"delta\":{\"content\":\"hello \"}}]}\n\n".to_string(),
            "data: {\"choices\":[{\"delta\":{\"content\":\"world\"}}]}\n\n".to_string(),
            "data: {\"choices\":[],\"usage\":{\"total_tokens\":77}}\n\n".to_string(),
            "data: [DONE]\n\n".to_string(),
        ];
        let stub = StubTransport::scripted(vec![StubReply::stream(200, frames)]);
        let client = client(stub);

        let mut stream = client
            .generate_response_stream(&LlmRequest::new("p"))
            .await
            .unwrap();
        let mut chunks = Vec::new();
        while let Some(chunk) = stream.next().await {
            chunks.push(chunk.unwrap());
        }

        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[0].text, "hello ");
        assert_eq!(chunks[1].text, "hello world");
        assert_eq!(chunks[2].text, "hello world");
        assert!(chunks[2].done);
        assert_eq!(chunks[2].tokens_used, Some(77));
        assert_eq!(
            chunks.iter().map(|c| c.index).collect::<Vec<_>>(),
            vec![1, 2, 3]
        );
        assert_eq!(chunks.iter().filter(|c| c.done).count(), 1);
    }

    #[tokio::test]
    async fn streaming_eof_without_done_still_closes() {
        let frames =
            vec!["data: {\"choices\":[{\"delta\":{\"content\":\"hi\"}}]}\n\n".to_string()];
        let stub = StubTransport::scripted(vec![StubReply::stream(200, frames)]);
        let client = client(stub);

        let mut stream = client
            .generate_response_stream(&LlmRequest::new("p"))
            .await
            .unwrap();
        let mut chunks = Vec::new();
        while let Some(chunk) = stream.next().await {
            chunks.push(chunk.unwrap());
        }
        assert_eq!(chunks.len(), 2);
        assert!(chunks[1].done);
        assert_eq!(chunks[1].text, "hi");
    }

    #[tokio::test]
    async fn delta_content_parts_are_joined() {
        let frames = vec![
            "data: {\"choices\":[{\"delta\":{\"content\":[{\"text\":\"a\"},{\"text\":\"b\"}]}}]}\n\n"
                .to_string(),
            "data: [DONE]\n\n".to_string(),
        ];
        let stub = StubTransport::scripted(vec![StubReply::stream(200, frames)]);
        let client = client(stub);
        let mut stream = client
            .generate_response_stream(&LlmRequest::new("p"))
            .await
            .unwrap();
        let first = stream.next().await.unwrap().unwrap();
        assert_eq!(first.delta, "ab");
    }

    #[tokio::test]
    async fn refusal_surfaces_as_refused_error() {
        let stub = StubTransport::scripted(vec![StubReply::json(
            200,
            json!({"choices": [{"message": {"refusal": "cannot comply"}}]}),
        )]);
        let client = client(stub);
        let err = client
            .generate_response(&LlmRequest::new("p"))
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "OpenAI refused request: cannot comply"
        );
    }

    #[tokio::test]
    async fn unsupported_structured_format_makes_no_call() {
        let stub = StubTransport::scripted(vec![]);
        let client = client(Arc::clone(&stub));
        let response = client
            .generate_structured_response(&LlmRequest::new("p"), "yaml-plan")
            .await
            .unwrap();
        assert!(!response.valid);
        assert_eq!(
            response.errors,
            vec!["Unsupported structured format: yaml-plan".to_string()]
        );
        assert!(stub.requests().is_empty());
    }

    #[tokio::test]
    async fn structured_request_carries_schema_and_validates() {
        let plan = json!({
            "id": "p1",
            "version": 1,
            "capabilities": {"domWrite": false},
            "root": {"type": "text", "value": "hi"}
        });
        let stub = StubTransport::scripted(vec![StubReply::json(
            200,
            json!({
                "usage": {"prompt_tokens": 10, "completion_tokens": 5},
                "choices": [{"message": {"content": plan.to_string()}}]
            }),
        )]);
        let client = client(Arc::clone(&stub));

        let response = client
            .generate_structured_response(&LlmRequest::new("p"), "runtime-plan")
            .await
            .unwrap();
        assert!(response.valid, "errors: {:?}", response.errors);
        assert_eq!(response.tokens_used, Some(15));
        assert_eq!(response.value.unwrap()["id"], "p1");

        let body = stub.requests()[0].body.clone().unwrap();
        assert_eq!(body["response_format"]["type"], "json_schema");
        assert_eq!(
            body["response_format"]["json_schema"]["name"],
            "runtime_plan"
        );
        assert_eq!(body["response_format"]["json_schema"]["strict"], true);
    }

    #[tokio::test]
    async fn system_messages_compose_in_order() {
        let stub = StubTransport::scripted(vec![StubReply::json(
            200,
            json!({"choices": [{"message": {"content": "x"}}]}),
        )]);
        let mut client = client(Arc::clone(&stub));
        client.configure(&json!({"systemPrompt": "configured"}));
        client.set_prompt_template("default", "from template");

        client
            .generate_response(&LlmRequest::new("p").with_system_prompt("from request"))
            .await
            .unwrap();

        let body = stub.requests()[0].body.clone().unwrap();
        let messages = body["messages"].as_array().unwrap();
        assert_eq!(messages.len(), 4);
        assert_eq!(messages[0]["content"], "configured");
        assert_eq!(messages[1]["content"], "from template");
        assert_eq!(messages[2]["content"], "from request");
        assert_eq!(messages[3]["role"], "user");
    }

    #[test]
    fn configure_overlays_only_present_keys() {
        let stub = StubTransport::scripted(vec![]);
        let mut client = OpenAiInterpreter::new(stub);
        client.configure(&json!({"apiKey": "first"}));
        client.configure(&json!({"model": "gpt-4o"}));
        assert_eq!(client.options().api_key.as_deref(), Some("first"));
        assert_eq!(client.options().model, "gpt-4o");
        assert_eq!(client.options().base_url, "https://api.openai.com/v1");
    }
}
