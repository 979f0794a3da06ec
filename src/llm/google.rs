//! Google Gemini client.
//!
//! POSTs `{baseUrl}/models/{model}:generateContent` (or
//! `:streamGenerateContent?alt=sse`) with the `x-goog-api-key` header.
//! Structured calls try `generationConfig.responseJsonSchema` first and fall
//! back to an unconstrained JSON call when the model rejects the schema
//! parameter. Refusals are derived from `promptFeedback.blockReason` and
//! blocking finish reasons.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};
use tracing::debug;

use super::schema::{runtime_plan_schema, structured_from_text};
use super::{
    join_system_parts, sum_tokens, system_parts, Interpreter, LlmRequest, LlmResponse,
    LlmStream, LlmStreamChunk, LlmStructuredResponse, STRUCTURED_FORMAT_RUNTIME_PLAN,
    STRUCTURED_INSTRUCTION,
};
use crate::error::{RenderifyError, Result};
use crate::http::sse::SseParser;
use crate::http::tolerant::extract_error_message;
use crate::http::{HttpRequest, HttpResponse, SharedTransport};
use crate::options::{pick_f64, pick_str, pick_u64};
use crate::reliability::{Reliability, ReliabilityConfig};
use crate::scope::TimeoutScope;

const LABEL: &str = "Google";

/// Finish reasons that count as refusals.
const BLOCKING_FINISH_REASONS: &[&str] =
    &["SAFETY", "RECITATION", "BLOCKLIST", "PROHIBITED_CONTENT", "SPII"];

/// Substrings (lowercased) that mark a 4xx as a schema-parameter rejection.
const SCHEMA_REJECTION_MARKERS: &[&str] =
    &["responsejsonschema", "response_json_schema", "response_schema"];

/// Resolved Google client options.
#[derive(Debug, Clone)]
pub struct GoogleOptions {
    pub api_key: Option<String>,
    pub model: String,
    pub base_url: String,
    pub timeout_ms: u64,
    pub system_prompt: Option<String>,
    pub temperature: Option<f64>,
    pub max_output_tokens: Option<u64>,
}

impl Default for GoogleOptions {
    fn default() -> Self {
        Self {
            api_key: None,
            model: "gemini-2.5-flash".to_string(),
            base_url: "https://generativelanguage.googleapis.com/v1beta".to_string(),
            timeout_ms: 60_000,
            system_prompt: None,
            temperature: None,
            max_output_tokens: None,
        }
    }
}

/// Client for the Gemini generateContent API.
pub struct GoogleInterpreter {
    transport: SharedTransport,
    reliability: Reliability,
    options: GoogleOptions,
    templates: BTreeMap<String, String>,
}

impl GoogleInterpreter {
    pub fn new(transport: SharedTransport) -> Self {
        Self {
            transport,
            reliability: Reliability::new(ReliabilityConfig::default()),
            options: GoogleOptions::default(),
            templates: BTreeMap::new(),
        }
    }

    pub fn options(&self) -> &GoogleOptions {
        &self.options
    }

    fn endpoint(&self, stream: bool) -> String {
        let base = self.options.base_url.trim_end_matches('/');
        if stream {
            format!(
                "{base}/models/{}:streamGenerateContent?alt=sse",
                self.options.model
            )
        } else {
            format!("{base}/models/{}:generateContent", self.options.model)
        }
    }

    fn scope_for(&self, request: &LlmRequest) -> TimeoutScope {
        TimeoutScope::new(
            format!("{LABEL} request"),
            Duration::from_millis(self.options.timeout_ms),
            request.signal.clone(),
        )
    }

    /// Gemini takes one `systemInstruction`: join the non-empty parts.
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

    fn build_body(&self, request: &LlmRequest, structured: bool, with_schema: bool) -> Value {
        let mut body = json!({
            "contents": [
                {"role": "user", "parts": [{"text": request.prompt_with_context()}]}
            ],
        });
        if let Some(system) = self.system_for(request, structured) {
            body["systemInstruction"] = json!({"parts": [{"text": system}]});
        }

        let mut generation = serde_json::Map::new();
        if let Some(temperature) = self.options.temperature {
            generation.insert("temperature".into(), json!(temperature));
        }
        if let Some(max) = self.options.max_output_tokens {
            generation.insert("maxOutputTokens".into(), json!(max));
        }
        if structured {
            generation.insert("responseMimeType".into(), json!("application/json"));
            if with_schema {
                generation.insert("responseJsonSchema".into(), runtime_plan_schema().clone());
            }
        }
        if !generation.is_empty() {
            body["generationConfig"] = Value::Object(generation);
        }
        body
    }

    fn request_for(&self, url: &str, body: Value) -> HttpRequest {
        let mut request = HttpRequest::post(url, body);
        if let Some(key) = &self.options.api_key {
            request = request.header("x-goog-api-key", key.clone());
        }
        request
    }

    /// Send without raising on status; callers decide how to handle non-2xx.
    async fn send_raw(
        &self,
        scope: &TimeoutScope,
        url: &str,
        body: Value,
    ) -> Result<HttpResponse> {
        let op = format!("{LABEL} request");
        self.reliability
            .call(&op, scope, || {
                let transport = Arc::clone(&self.transport);
                let request = self.request_for(url, body.clone());
                async move { transport.send(request).await }
            })
            .await
    }

    async fn failure(&self, scope: &TimeoutScope, response: HttpResponse) -> RenderifyError {
        let status = response.status;
        let text = scope.guard(response.text()).await.unwrap_or_default();
        let message = extract_error_message(&text);
        RenderifyError::Provider {
            status,
            message: format!("{LABEL} request failed ({status}): {message}"),
        }
    }

    fn check_refusal(payload: &Value) -> Result<()> {
        if let Some(reason) = payload["promptFeedback"]["blockReason"].as_str() {
            if !reason.is_empty() {
                return Err(RenderifyError::Refused {
                    message: format!("{LABEL} refused request: {reason}"),
                });
            }
        }
        if let Some(reason) = payload["candidates"][0]["finishReason"].as_str() {
            if BLOCKING_FINISH_REASONS.contains(&reason) {
                return Err(RenderifyError::Refused {
                    message: format!("{LABEL} refused request: {reason}"),
                });
            }
        }
        Ok(())
    }

    fn content_text(payload: &Value) -> String {
        payload["candidates"][0]["content"]["parts"]
            .as_array()
            .map(|parts| {
                parts
                    .iter()
                    .filter_map(|p| p["text"].as_str())
                    .collect::<Vec<_>>()
                    .concat()
            })
            .unwrap_or_default()
    }

    fn usage_tokens(payload: &Value) -> Option<u64> {
        let usage = payload.get("usageMetadata")?;
        sum_tokens(
            usage.get("promptTokenCount").and_then(Value::as_u64),
            usage.get("candidatesTokenCount").and_then(Value::as_u64),
        )
    }

    fn model_of(payload: &Value) -> Option<String> {
        payload["modelVersion"].as_str().map(str::to_string)
    }
}

#[async_trait]
impl Interpreter for GoogleInterpreter {
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
            self.options.max_output_tokens = Some(v);
        }
        let config = self.reliability.config().clone().overlay(options);
        self.reliability.set_config(config);
    }

    async fn generate_response(&self, request: &LlmRequest) -> Result<LlmResponse> {
        let scope = self.scope_for(request);
        let url = self.endpoint(false);
        let body = self.build_body(request, false, false);
        let response = self.send_raw(&scope, &url, body).await?;
        if !response.ok() {
            return Err(self.failure(&scope, response).await);
        }
        let payload = scope.guard(response.json()).await?;
        scope.release();

        Self::check_refusal(&payload)?;
        Ok(LlmResponse {
            text: Self::content_text(&payload),
            tokens_used: Self::usage_tokens(&payload),
            model: Self::model_of(&payload),
            raw: payload,
        })
    }

    async fn generate_response_stream(&self, request: &LlmRequest) -> Result<LlmStream> {
        let scope = self.scope_for(request);
        let url = self.endpoint(true);
        let body = self.build_body(request, false, false);
        let response = self.send_raw(&scope, &url, body).await?;
        if !response.ok() {
            return Err(self.failure(&scope, response).await);
        }

        let stream = async_stream::try_stream! {
            let mut parser = SseParser::new();
            let mut bytes = response.into_byte_stream();
            let mut text = String::new();
            let mut index: u64 = 0;
            let mut tokens: Option<u64> = None;
            let mut model: Option<String> = None;

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
                    Self::check_refusal(&frame)?;
                    if let Some(t) = Self::usage_tokens(&frame) {
                        tokens = Some(t);
                    }
                    if model.is_none() {
                        model = Self::model_of(&frame);
                    }
                    let delta = Self::content_text(&frame);
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

            // Gemini streams have no explicit terminator: close on EOF, after
            // draining any unterminated trailing block.
            for event in parser.flush() {
                if let Ok(frame) = serde_json::from_str::<Value>(&event.data) {
                    Self::check_refusal(&frame)?;
                    if let Some(t) = Self::usage_tokens(&frame) {
                        tokens = Some(t);
                    }
                    let delta = Self::content_text(&frame);
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
        let url = self.endpoint(false);
        let first = self
            .send_raw(&scope, &url, self.build_body(request, true, true))
            .await?;

        let payload = if first.ok() {
            scope.guard(first.json()).await?
        } else {
            let status = first.status;
            let text = scope.guard(first.text()).await.unwrap_or_default();
            let message = extract_error_message(&text);
            let lowered = message.to_ascii_lowercase();
            let schema_rejected = (400..500).contains(&status)
                && SCHEMA_REJECTION_MARKERS
                    .iter()
                    .any(|marker| lowered.contains(marker));
            if !schema_rejected {
                return Err(RenderifyError::Provider {
                    status,
                    message: format!("{LABEL} request failed ({status}): {message}"),
                });
            }
            // Model rejected the schema parameter: retry once without it.
            debug!(status, "responseJsonSchema rejected, retrying without schema");
            let second = self
                .send_raw(&scope, &url, self.build_body(request, true, false))
                .await?;
            if !second.ok() {
                return Err(self.failure(&scope, second).await);
            }
            scope.guard(second.json()).await?
        };
        scope.release();

        Self::check_refusal(&payload)?;
        let text = Self::content_text(&payload);
        let tokens = Self::usage_tokens(&payload);
        let model = Self::model_of(&payload);
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

    fn client(stub: Arc<StubTransport>) -> GoogleInterpreter {
        let mut client = GoogleInterpreter::new(stub);
        client.configure(&json!({
            "apiKey": "gk",
            "model": "gemini-2.5-flash",
            "retryBaseDelayMs": 1,
            "retryJitterMs": 0,
        }));
        client
    }

    fn plan_text() -> String {
        json!({
            "id": "p1",
            "version": 1,
            "capabilities": {"domWrite": false},
            "root": {"type": "text", "value": "hi"}
        })
        .to_string()
    }

    #[tokio::test]
    async fn unary_joins_parts_and_counts_tokens() {
        let stub = StubTransport::scripted(vec![StubReply::json(
            200,
            json!({
                "candidates": [{"content": {"parts": [{"text": "hel"}, {"text": "lo"}]}}],
                "usageMetadata": {"promptTokenCount": 3, "candidatesTokenCount": 4},
                "modelVersion": "gemini-2.5-flash"
            }),
        )]);
        let client = client(Arc::clone(&stub));
        let response = client
            .generate_response(&LlmRequest::new("p"))
            .await
            .unwrap();
        assert_eq!(response.text, "hello");
        assert_eq!(response.tokens_used, Some(7));
        assert_eq!(response.model.as_deref(), Some("gemini-2.5-flash"));

        let request = &stub.requests()[0];
        assert!(request
            .url
            .ends_with("/models/gemini-2.5-flash:generateContent"));
        assert!(request
            .headers
            .iter()
            .any(|(name, value)| name == "x-goog-api-key" && value == "gk"));
    }

    #[tokio::test]
    async fn block_reason_is_a_refusal() {
        let stub = StubTransport::scripted(vec![StubReply::json(
            200,
            json!({"promptFeedback": {"blockReason": "SAFETY"}}),
        )]);
        let client = client(stub);
        let err = client
            .generate_response(&LlmRequest::new("p"))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Google refused request: SAFETY");
    }

    #[tokio::test]
    async fn blocking_finish_reason_is_a_refusal() {
        let stub = StubTransport::scripted(vec![StubReply::json(
            200,
            json!({"candidates": [{"finishReason": "RECITATION"}]}),
        )]);
        let client = client(stub);
        let err = client
            .generate_response(&LlmRequest::new("p"))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), "Google refused request: RECITATION");
    }

    #[tokio::test]
    async fn stream_closes_on_eof() {
        let frames = vec![
            "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"a\"}]}}]}\n\n".to_string(),
            "data: {\"candidates\":[{\"content\":{\"parts\":[{\"text\":\"b\"}]}}],\"usageMetadata\":{\"promptTokenCount\":1,\"candidatesTokenCount\":2}}\n\n".to_string(),
        ];
        let stub = StubTransport::scripted(vec![StubReply::stream(200, frames)]);
        let client = client(Arc::clone(&stub));

        let mut stream = client
            .generate_response_stream(&LlmRequest::new("p"))
            .await
            .unwrap();
        let mut chunks = Vec::new();
        while let Some(chunk) = stream.next().await {
            chunks.push(chunk.unwrap());
        }
        assert_eq!(chunks.len(), 3);
        assert_eq!(chunks[1].text, "ab");
        assert!(chunks[2].done);
        assert_eq!(chunks[2].tokens_used, Some(3));
        assert!(stub.requests()[0].url.contains(":streamGenerateContent?alt=sse"));
    }

    #[tokio::test]
    async fn structured_schema_fallback_retries_once() {
        let stub = StubTransport::scripted(vec![
            StubReply::json(
                400,
                json!({"error": {"message": "Unknown name \"response_json_schema\""}}),
            ),
            StubReply::json(
                200,
                json!({"candidates": [{"content": {"parts": [{"text": plan_text()}]}}]}),
            ),
        ]);
        let client = client(Arc::clone(&stub));
        let response = client
            .generate_structured_response(&LlmRequest::new("p"), "runtime-plan")
            .await
            .unwrap();
        assert!(response.valid, "errors: {:?}", response.errors);

        let requests = stub.requests();
        assert_eq!(requests.len(), 2);
        let first_body = requests[0].body.clone().unwrap();
        assert!(first_body["generationConfig"]["responseJsonSchema"].is_object());
        let second_body = requests[1].body.clone().unwrap();
        assert!(second_body["generationConfig"]
            .get("responseJsonSchema")
            .is_none());
        assert_eq!(
            second_body["generationConfig"]["responseMimeType"],
            "application/json"
        );
    }

    #[tokio::test]
    async fn structured_unrelated_4xx_not_retried() {
        let stub = StubTransport::scripted(vec![StubReply::json(
            403,
            json!({"error": {"message": "API key invalid"}}),
        )]);
        let client = client(Arc::clone(&stub));
        let err = client
            .generate_structured_response(&LlmRequest::new("p"), "runtime-plan")
            .await
            .unwrap_err();
        assert_eq!(
            err.to_string(),
            "Google request failed (403): API key invalid"
        );
        assert_eq!(stub.requests().len(), 1);
    }
}
