//! Anthropic messages client.
//!
//! POSTs `{baseUrl}/messages` with `x-api-key` and `anthropic-version`
//! headers. Streaming is SSE with named event types; only
//! `content_block_delta` text deltas contribute to the aggregated response.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};

use super::schema::structured_from_text;
use super::{
    join_system_parts, sum_tokens, system_parts, Interpreter, LlmRequest, LlmResponse,
    LlmStream, LlmStreamChunk, LlmStructuredResponse, STRUCTURED_FORMAT_RUNTIME_PLAN,
    STRUCTURED_INSTRUCTION,
};
use crate::error::{RenderifyError, Result};
use crate::http::sse::SseParser;
use crate::http::tolerant::extract_error_message;
use crate::http::{HttpRequest, SharedTransport};
use crate::options::{pick_f64, pick_str, pick_u64};
use crate::reliability::{Reliability, ReliabilityConfig};
use crate::scope::TimeoutScope;

const LABEL: &str = "Anthropic";

/// Resolved Anthropic client options.
#[derive(Debug, Clone)]
pub struct AnthropicOptions {
    pub api_key: Option<String>,
    pub model: String,
    pub base_url: String,
    pub anthropic_version: String,
    pub timeout_ms: u64,
    pub max_tokens: u64,
    pub system_prompt: Option<String>,
    pub temperature: Option<f64>,
}

impl Default for AnthropicOptions {
    fn default() -> Self {
        Self {
            api_key: None,
            model: "claude-sonnet-4-20250514".to_string(),
            base_url: "https://api.anthropic.com/v1".to_string(),
            anthropic_version: "2023-06-01".to_string(),
            timeout_ms: 60_000,
            max_tokens: 4096,
            system_prompt: None,
            temperature: None,
        }
    }
}

/// Client for the Anthropic messages API.
pub struct AnthropicInterpreter {
    transport: SharedTransport,
    reliability: Reliability,
    options: AnthropicOptions,
    templates: BTreeMap<String, String>,
}

impl AnthropicInterpreter {
    pub fn new(transport: SharedTransport) -> Self {
        Self {
            transport,
            reliability: Reliability::new(ReliabilityConfig::default()),
            options: AnthropicOptions::default(),
            templates: BTreeMap::new(),
        }
    }

    pub fn options(&self) -> &AnthropicOptions {
        &self.options
    }

    fn endpoint(&self) -> String {
        format!("{}/messages", self.options.base_url.trim_end_matches('/'))
    }

    fn scope_for(&self, request: &LlmRequest) -> TimeoutScope {
        TimeoutScope::new(
            format!("{LABEL} request"),
            Duration::from_millis(self.options.timeout_ms),
            request.signal.clone(),
        )
    }

    /// Anthropic takes one `system` string: join the non-empty parts.
    fn system_for(&self, request: &LlmRequest, structured: bool) -> Option<String> {
        let mut parts = system_parts(
            self.options.system_prompt.as_deref(),
            self.templates.get("default").map(String::as_str),
            request.system_prompt.as_deref(),
        );
        if structured {
            parts.push(STRUCTURED_INSTRUCTION.to_string());
        }
        join_system_parts(&parts)
    }

    fn build_body(&self, request: &LlmRequest, stream: bool, structured: bool) -> Value {
        let mut body = json!({
            "model": self.options.model,
            "max_tokens": self.options.max_tokens,
            "messages": [
                {"role": "user", "content": request.prompt_with_context()}
            ],
        });
        if let Some(system) = self.system_for(request, structured) {
            body["system"] = json!(system);
        }
        if let Some(temperature) = self.options.temperature {
            body["temperature"] = json!(temperature);
        }
        if stream {
            body["stream"] = json!(true);
        }
        body
    }

    fn request_for(&self, url: &str, body: Value) -> HttpRequest {
        let mut request = HttpRequest::post(url, body)
            .header("anthropic-version", self.options.anthropic_version.clone());
        if let Some(key) = &self.options.api_key {
            request = request.header("x-api-key", key.clone());
        }
        request
    }

    async fn send(&self, scope: &TimeoutScope, body: Value) -> Result<crate::http::HttpResponse> {
        let op = format!("{LABEL} request");
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
                message: format!("{op} failed ({status}): {message}"),
            });
        }
        Ok(response)
    }

    fn content_text(payload: &Value) -> String {
        payload["content"]
            .as_array()
            .map(|blocks| {
                blocks
                    .iter()
                    .filter(|b| b["type"] == "text")
                    .filter_map(|b| b["text"].as_str())
                    .collect::<Vec<_>>()
                    .concat()
            })
            .unwrap_or_default()
    }

    fn usage_tokens(payload: &Value) -> Option<u64> {
        let usage = payload.get("usage")?;
        sum_tokens(
            usage.get("input_tokens").and_then(Value::as_u64),
            usage.get("output_tokens").and_then(Value::as_u64),
        )
    }
}

#[async_trait]
impl Interpreter for AnthropicInterpreter {
    fn name(&self) -> &str {
        LABEL
    }

    fn configure(&mut self, options: &Value) {
        if let Some(v) = pick_str(options, "apiKey") {
            self.options.api_key = Some(v);
        }
        if let Some(v) = pick_str(options, "model") {
            self.options.model = v;
        }
        if let Some(v) = pick_str(options, "baseUrl") {
            self.options.base_url = v;
        }
        if let Some(v) = pick_str(options, "anthropicVersion") {
            self.options.anthropic_version = v;
        }
        if let Some(v) = pick_u64(options, "timeoutMs") {
            self.options.timeout_ms = v.max(1);
        }
        if let Some(v) = pick_u64(options, "maxTokens") {
            self.options.max_tokens = v.max(1);
        }
        if let Some(v) = pick_str(options, "systemPrompt") {
            self.options.system_prompt = Some(v);
        }
        if let Some(v) = pick_f64(options, "temperature") {
            self.options.temperature = Some(v);
        }
        let config = self.reliability.config().clone().overlay(options);
        self.reliability.set_config(config);
    }

    async fn generate_response(&self, request: &LlmRequest) -> Result<LlmResponse> {
        let scope = self.scope_for(request);
        let body = self.build_body(request, false, false);
        let response = self.send(&scope, body).await?;
        let payload = scope.guard(response.json()).await?;
        scope.release();

        Ok(LlmResponse {
            text: Self::content_text(&payload),
            tokens_used: Self::usage_tokens(&payload),
            model: payload["model"].as_str().map(str::to_string),
            raw: payload,
        })
    }

    async fn generate_response_stream(&self, request: &LlmRequest) -> Result<LlmStream> {
        let scope = self.scope_for(request);
        let body = self.build_body(request, true, false);
        let response = self.send(&scope, body).await?;

        let stream = async_stream::try_stream! {
            let mut parser = SseParser::new();
            let mut bytes = response.into_byte_stream();
            let mut text = String::new();
            let mut index: u64 = 0;
            let mut input_tokens: Option<u64> = None;
            let mut output_tokens: Option<u64> = None;
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
                    let Ok(frame) = serde_json::from_str::<Value>(&event.data) else {
                        continue;
                    };
                    let kind = frame["type"]
                        .as_str()
                        .map(str::to_string)
                        .or(event.event.clone())
                        .unwrap_or_default();
                    match kind.as_str() {
                        "message_start" => {
                            model = frame["message"]["model"].as_str().map(str::to_string);
                            input_tokens =
                                frame["message"]["usage"]["input_tokens"].as_u64();
                        }
                        "content_block_delta" => {
                            let delta = frame["delta"]["text"]
                                .as_str()
                                .unwrap_or_default()
                                .to_string();
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
                        "message_delta" => {
                            if let Some(out) = frame["usage"]["output_tokens"].as_u64() {
                                output_tokens = Some(out);
                            }
                        }
                        "message_stop" => {
                            index += 1;
                            yield LlmStreamChunk {
                                delta: String::new(),
                                text: text.clone(),
                                done: true,
                                index,
                                tokens_used: sum_tokens(input_tokens, output_tokens),
                                model: model.clone(),
                                raw: frame,
                            };
                            finished = true;
                            break 'read;
                        }
                        _ => {}
                    }
                }
            }

            if !finished {
                index += 1;
                yield LlmStreamChunk {
                    delta: String::new(),
                    text: text.clone(),
                    done: true,
                    index,
                    tokens_used: sum_tokens(input_tokens, output_tokens),
                    model: model.clone(),
                    raw: Value::Null,
                };
            }
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
        let response = self.send(&scope, body).await?;
        let payload = scope.guard(response.json()).await?;
        scope.release();

        let text = Self::content_text(&payload);
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

    fn client(stub: Arc<StubTransport>) -> AnthropicInterpreter {
        let mut client = AnthropicInterpreter::new(stub);
        client.configure(&json!({"apiKey": "ak", "retryBaseDelayMs": 1, "retryJitterMs": 0}));
        client
    }

    #[tokio::test]
    async fn unary_joins_text_blocks_and_sums_tokens() {
        let stub = StubTransport::scripted(vec![StubReply::json(
            200,
            json!({
                "model": "claude-sonnet-4-20250514",
                "content": [
                    {"type": "text", "text": "hello "},
                    {"type": "tool_use", "id": "t1"},
                    {"type": "text", "text": "world"}
                ],
                "usage": {"input_tokens": 12, "output_tokens": 30}
            }),
        )]);
        let client = client(Arc::clone(&stub));
        let response = client
            .generate_response(&LlmRequest::new("p"))
            .await
            .unwrap();
        assert_eq!(response.text, "hello world");
        assert_eq!(response.tokens_used, Some(42));

        let request = &stub.requests()[0];
        assert!(request.url.ends_with("/messages"));
        assert!(request
            .headers
            .iter()
            .any(|(name, value)| name == "x-api-key" && value == "ak"));
        assert!(request
            .headers
            .iter()
            .any(|(name, _)| name == "anthropic-version"));
    }

    #[tokio::test]
    async fn system_parts_join_into_single_string() {
        let stub = StubTransport::scripted(vec![StubReply::json(
            200,
            json!({"content": [{"type": "text", "text": "x"}]}),
        )]);
        let mut client = client(Arc::clone(&stub));
        client.configure(&json!({"systemPrompt": "configured"}));
        client.set_prompt_template("default", "template");
        client
            .generate_response(&LlmRequest::new("p").with_system_prompt("requested"))
            .await
            .unwrap();

        let body = stub.requests()[0].body.clone().unwrap();
        assert_eq!(body["system"], "configured\n\ntemplate\n\nrequested");
    }

    #[tokio::test]
    async fn streaming_named_events() {
        let frames = vec![
            "event: message_start\ndata: {\"type\":\"message_start\",\"message\":{\"model\":\"claude-sonnet-4-20250514\",\"usage\":{\"input_tokens\":5}}}\n\n".to_string(),
            "event: content_block_delta\ndata: {\"type\":\"content_block_delta\",\"delta\":{\"type\":\"text_delta\",\"text\":\"hi \"}}\n\n".to_string(),
            "event: content_block_delta\ndata: {\"type\":\"content_block_delta\",\"delta\":{\"type\":\"text_delta\",\"text\":\"there\"}}\n\n".to_string(),
            "event: message_delta\ndata: {\"type\":\"message_delta\",\"usage\":{\"output_tokens\":7}}\n\n".to_string(),
            "event: message_stop\ndata: {\"type\":\"message_stop\"}\n\n".to_string(),
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
        assert_eq!(chunks[0].delta, "hi ");
        assert_eq!(chunks[1].text, "hi there");
        assert!(chunks[2].done);
        assert_eq!(chunks[2].tokens_used, Some(12));
        assert_eq!(chunks[2].model.as_deref(), Some("claude-sonnet-4-20250514"));
        assert_eq!(chunks.iter().filter(|c| c.done).count(), 1);
    }

    #[tokio::test]
    async fn error_body_message_surfaced() {
        let stub = StubTransport::scripted(vec![StubReply::json(
            400,
            json!({"error": {"message": "max_tokens required"}}),
        )]);
        let client = client(stub);
        let err = client
            .generate_response(&LlmRequest::new("p"))
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Anthropic request failed (400): max_tokens required"
        );
    }

    #[tokio::test]
    async fn structured_appends_instruction_to_system() {
        let plan = json!({
            "id": "p1",
            "version": 1,
            "capabilities": {"domWrite": false},
            "root": {"type": "text", "value": "hi"}
        });
        let stub = StubTransport::scripted(vec![StubReply::json(
            200,
            json!({"content": [{"type": "text", "text": plan.to_string()}]}),
        )]);
        let client = client(Arc::clone(&stub));
        let response = client
            .generate_structured_response(&LlmRequest::new("p"), "runtime-plan")
            .await
            .unwrap();
        assert!(response.valid);

        let body = stub.requests()[0].body.clone().unwrap();
        let system = body["system"].as_str().unwrap();
        assert!(system.contains("runtime-plan schema"));
    }
}
