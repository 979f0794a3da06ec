//! Ollama native-API client.
//!
//! POSTs `{baseUrl}/api/generate` with no auth header. The response is a
//! single JSON object when not streaming, or NDJSON lines with
//! `{response, done, ...}` when streaming. Token counts are synthesized from
//! `prompt_eval_count + eval_count`.

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use futures::StreamExt;
use serde_json::{json, Value};

use super::schema::structured_from_text;
use super::{
    sum_tokens, system_parts, Interpreter, LlmRequest, LlmResponse, LlmStream,
    LlmStreamChunk, LlmStructuredResponse, STRUCTURED_FORMAT_RUNTIME_PLAN,
    STRUCTURED_INSTRUCTION,
};
use crate::error::{RenderifyError, Result};
use crate::http::ndjson::NdjsonParser;
use crate::http::tolerant::extract_error_message;
use crate::http::{HttpRequest, HttpResponse, SharedTransport};
use crate::options::{pick_f64, pick_str, pick_u64};
use crate::reliability::{Reliability, ReliabilityConfig};
use crate::scope::TimeoutScope;

const LABEL: &str = "Ollama";

/// Resolved Ollama client options.
#[derive(Debug, Clone)]
pub struct OllamaOptions {
    pub model: String,
    pub base_url: String,
    pub timeout_ms: u64,
    pub system_prompt: Option<String>,
    pub temperature: Option<f64>,
    pub max_tokens: Option<u64>,
}

impl Default for OllamaOptions {
    fn default() -> Self {
        Self {
            model: "llama3.2".to_string(),
            base_url: "http://localhost:11434".to_string(),
            timeout_ms: 120_000,
            system_prompt: None,
            temperature: None,
            max_tokens: None,
        }
    }
}

/// Client for Ollama's `/api/generate` endpoint.
pub struct OllamaInterpreter {
    transport: SharedTransport,
    reliability: Reliability,
    options: OllamaOptions,
    templates: BTreeMap<String, String>,
}

impl OllamaInterpreter {
    pub fn new(transport: SharedTransport) -> Self {
        Self {
            transport,
            reliability: Reliability::new(ReliabilityConfig::default()),
            options: OllamaOptions::default(),
            templates: BTreeMap::new(),
        }
    }

    pub fn options(&self) -> &OllamaOptions {
        &self.options
    }

    fn endpoint(&self) -> String {
        format!("{}/api/generate", self.options.base_url.trim_end_matches('/'))
    }

    fn scope_for(&self, request: &LlmRequest) -> TimeoutScope {
        TimeoutScope::new(
            format!("{LABEL} request"),
            Duration::from_millis(self.options.timeout_ms),
            request.signal.clone(),
        )
    }

    /// Ollama's generate endpoint takes a single `system` string: the first
    /// non-empty of (request, template `"default"`, configured) wins.
    fn system_for(&self, request: &LlmRequest, structured: bool) -> Option<String> {
        let chosen = system_parts(
            request.system_prompt.as_deref(),
            self.templates.get("default").map(String::as_str),
            self.options.system_prompt.as_deref(),
        )
        .into_iter()
        .next();
        if structured {
            Some(match chosen {
                Some(system) => format!("{system}\n\n{STRUCTURED_INSTRUCTION}"),
                None => STRUCTURED_INSTRUCTION.to_string(),
            })
        } else {
            chosen
        }
    }

    fn build_body(&self, request: &LlmRequest, stream: bool, structured: bool) -> Value {
        let mut body = json!({
            "model": self.options.model,
            "prompt": request.prompt_with_context(),
            "stream": stream,
        });
        if let Some(system) = self.system_for(request, structured) {
            body["system"] = json!(system);
        }
        let mut options = serde_json::Map::new();
        if let Some(temperature) = self.options.temperature {
            options.insert("temperature".into(), json!(temperature));
        }
        if let Some(max) = self.options.max_tokens {
            options.insert("num_predict".into(), json!(max));
        }
        if !options.is_empty() {
            body["options"] = Value::Object(options);
        }
        if structured {
            body["format"] = json!("json");
        }
        body
    }

    async fn send(&self, scope: &TimeoutScope, body: Value) -> Result<HttpResponse> {
        let op = format!("{LABEL} request");
        let url = self.endpoint();
        let response = self
            .reliability
            .call(&op, scope, || {
                let transport = Arc::clone(&self.transport);
                let request = HttpRequest::post(&url, body.clone());
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

    fn usage_tokens(payload: &Value) -> Option<u64> {
        sum_tokens(
            payload.get("prompt_eval_count").and_then(Value::as_u64),
            payload.get("eval_count").and_then(Value::as_u64),
        )
    }
}

#[async_trait]
impl Interpreter for OllamaInterpreter {
    fn name(&self) -> &str {
        LABEL
    }

    fn configure(&mut self, options: &Value) {
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
            text: payload["response"].as_str().unwrap_or_default().to_string(),
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
            let mut parser = NdjsonParser::new();
            let mut bytes = response.into_byte_stream();
            let mut text = String::new();
            let mut index: u64 = 0;
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
                let payloads = parser.push(&String::from_utf8_lossy(&chunk))?;
                for payload in payloads {
                    if model.is_none() {
                        model = payload["model"].as_str().map(str::to_string);
                    }
                    let delta = payload["response"].as_str().unwrap_or_default().to_string();
                    let done = payload["done"].as_bool().unwrap_or(false);
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
                            raw: payload.clone(),
                        };
                    }
                    if done {
                        index += 1;
                        yield LlmStreamChunk {
                            delta: String::new(),
                            text: text.clone(),
                            done: true,
                            index,
                            tokens_used: Self::usage_tokens(&payload),
                            model: model.clone(),
                            raw: payload,
                        };
                        finished = true;
                        break 'read;
                    }
                }
            }

            if !finished {
                for payload in parser.flush()? {
                    let delta = payload["response"].as_str().unwrap_or_default().to_string();
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
                            raw: payload,
                        };
                    }
                }
                index += 1;
                yield LlmStreamChunk {
                    delta: String::new(),
                    text: text.clone(),
                    done: true,
                    index,
                    tokens_used: None,
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

        let text = payload["response"].as_str().unwrap_or_default();
        let tokens = Self::usage_tokens(&payload);
        let model = payload["model"].as_str().map(str::to_string);
        Ok(structured_from_text(text, tokens, model, payload.clone()))
    }

    fn set_prompt_template(&mut self, name: &str, template: &str) {
        self.templates.insert(name.to_string(), template.to_string());
    }

    fn get_prompt_template(&self, name: &str) -> Option<String> {
        self.templates.get(name).cloned()
    }
}
