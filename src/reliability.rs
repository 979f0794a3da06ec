//! Retry policy, exponential backoff, and circuit breaker.
//!
//! Every upstream HTTP call is guarded by a [`Reliability`] instance owned by
//! the calling client. Retries cover transient statuses and (optionally)
//! network errors; sustained failure trips a per-client breaker that fails
//! calls fast until the cooldown elapses, after which one free attempt is
//! allowed.

use std::collections::BTreeSet;
use std::time::{Duration, Instant};

use parking_lot::Mutex;
use serde_json::Value;
use tracing::{debug, warn};

use crate::error::{RenderifyError, Result};
use crate::http::HttpResponse;
use crate::options::{pick, pick_bool, pick_u64};
use crate::scope::TimeoutScope;

/// Resolved retry/breaker configuration. All numeric fields are clamped to
/// their documented ranges at resolution time.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReliabilityConfig {
    /// Retry attempts beyond the first call. Clamped to 0..=10.
    pub max_retries: u32,
    /// First backoff delay in milliseconds. Clamped to >= 1.
    pub retry_base_delay_ms: u64,
    /// Backoff ceiling in milliseconds. Raised to at least the base delay.
    pub retry_max_delay_ms: u64,
    /// Uniform jitter added to every delay, in milliseconds.
    pub retry_jitter_ms: u64,
    /// Whether connection-level failures are retried.
    pub retry_on_network_error: bool,
    /// Statuses that trigger a retry. Values outside 100..=599 are dropped.
    pub retry_status_codes: BTreeSet<u16>,
    /// Consecutive failures before the breaker opens. Clamped to 1..=100.
    pub threshold: u32,
    /// How long the breaker stays open, in ms. Clamped to 100..=300000.
    pub cooldown_ms: u64,
}

impl Default for ReliabilityConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_base_delay_ms: 300,
            retry_max_delay_ms: 10_000,
            retry_jitter_ms: 100,
            retry_on_network_error: true,
            retry_status_codes: [429, 500, 502, 503, 504].into_iter().collect(),
            threshold: 5,
            cooldown_ms: 30_000,
        }
    }
}

impl ReliabilityConfig {
    /// Resolve a config from an options map, starting from defaults.
    pub fn resolve(options: &Value) -> Self {
        Self::default().overlay(options)
    }

    /// Overlay option keys present in `options`, then re-clamp.
    ///
    /// Both canonical and `llm`-prefixed alias keys are honored, e.g.
    /// `maxRetries` and `llmMaxRetries`.
    pub fn overlay(mut self, options: &Value) -> Self {
        if let Some(v) = pick_u64(options, "maxRetries") {
            self.max_retries = v as u32;
        }
        if let Some(v) = pick_u64(options, "retryBaseDelayMs") {
            self.retry_base_delay_ms = v;
        }
        if let Some(v) = pick_u64(options, "retryMaxDelayMs") {
            self.retry_max_delay_ms = v;
        }
        if let Some(v) = pick_u64(options, "retryJitterMs") {
            self.retry_jitter_ms = v;
        }
        if let Some(v) = pick_bool(options, "retryOnNetworkError") {
            self.retry_on_network_error = v;
        }
        if let Some(codes) = pick(options, "retryStatusCodes").and_then(Value::as_array) {
            self.retry_status_codes = codes
                .iter()
                .filter_map(Value::as_u64)
                .map(|c| c as u16)
                .collect();
        }
        if let Some(v) = pick_u64(options, "circuitBreakerThreshold") {
            self.threshold = v as u32;
        }
        if let Some(v) = pick_u64(options, "circuitBreakerCooldownMs") {
            self.cooldown_ms = v;
        }
        self.clamped()
    }

    fn clamped(mut self) -> Self {
        self.max_retries = self.max_retries.min(10);
        self.retry_base_delay_ms = self.retry_base_delay_ms.max(1);
        self.retry_max_delay_ms = self.retry_max_delay_ms.max(self.retry_base_delay_ms);
        self.retry_status_codes
            .retain(|c| (100..=599).contains(c));
        self.threshold = self.threshold.clamp(1, 100);
        self.cooldown_ms = self.cooldown_ms.clamp(100, 300_000);
        self
    }

    /// Backoff delay before retry attempt `attempt` (1-based):
    /// `min(base * 2^(attempt-1), max) + U[0, jitter]`.
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        let exp = self
            .retry_base_delay_ms
            .saturating_mul(1u64 << (attempt.saturating_sub(1)).min(32));
        let capped = exp.min(self.retry_max_delay_ms);
        let jitter = if self.retry_jitter_ms > 0 {
            fastrand::u64(0..=self.retry_jitter_ms)
        } else {
            0
        };
        Duration::from_millis(capped + jitter)
    }
}

/// Per-client breaker state.
#[derive(Debug, Default)]
struct BreakerState {
    failures: u32,
    open_until: Option<Instant>,
}

/// Retry + circuit breaker guard for one client.
pub struct Reliability {
    config: ReliabilityConfig,
    state: Mutex<BreakerState>,
}

impl Reliability {
    pub fn new(config: ReliabilityConfig) -> Self {
        Self {
            config,
            state: Mutex::new(BreakerState::default()),
        }
    }

    /// Current config.
    pub fn config(&self) -> &ReliabilityConfig {
        &self.config
    }

    /// Replace the config (used by incremental `configure`). Breaker state is
    /// preserved.
    pub fn set_config(&mut self, config: ReliabilityConfig) {
        self.config = config;
    }

    /// Whether the breaker is currently open.
    pub fn is_open(&self) -> bool {
        self.state
            .lock()
            .open_until
            .is_some_and(|until| until > Instant::now())
    }

    /// Run `attempt` under the retry/breaker policy.
    ///
    /// `op` names the guarded operation in error messages (e.g.
    /// `"OpenAI request"`). Each attempt future runs under `scope`, so
    /// caller aborts and timeouts surface immediately and are never retried.
    /// Non-success responses are returned, not raised; callers map status to
    /// errors after the reliability layer has recorded breaker effects.
    pub async fn call<F, Fut>(
        &self,
        op: &str,
        scope: &TimeoutScope,
        attempt: F,
    ) -> Result<HttpResponse>
    where
        F: Fn() -> Fut,
        Fut: std::future::Future<Output = Result<HttpResponse>>,
    {
        self.admit(op)?;

        let max_attempts = self.config.max_retries + 1;
        let mut attempt_no = 1u32;
        loop {
            match scope.guard(attempt()).await {
                Ok(response) => {
                    let status = response.status;
                    let retryable = self.config.retry_status_codes.contains(&status);
                    if retryable && attempt_no < max_attempts {
                        let delay = self.config.delay_for_attempt(attempt_no);
                        debug!(op, status, attempt = attempt_no, ?delay, "retrying");
                        scope.sleep(delay).await?;
                        attempt_no += 1;
                        continue;
                    }
                    if status >= 500 || retryable {
                        self.record_failure(op);
                    } else {
                        self.record_success();
                    }
                    return Ok(response);
                }
                Err(e) if e.is_cancellation() => return Err(e),
                Err(e) => {
                    if e.is_network()
                        && self.config.retry_on_network_error
                        && attempt_no < max_attempts
                    {
                        let delay = self.config.delay_for_attempt(attempt_no);
                        debug!(op, error = %e, attempt = attempt_no, ?delay, "retrying after network error");
                        scope.sleep(delay).await?;
                        attempt_no += 1;
                        continue;
                    }
                    self.record_failure(op);
                    return Err(e);
                }
            }
        }
    }

    /// Breaker admission check, with the half-open free attempt.
    fn admit(&self, op: &str) -> Result<()> {
        let mut state = self.state.lock();
        if let Some(until) = state.open_until {
            let now = Instant::now();
            if until > now {
                let remaining = until.duration_since(now).as_millis();
                return Err(RenderifyError::CircuitOpen {
                    message: format!(
                        "{op} circuit breaker is open (retry in {remaining}ms)"
                    ),
                });
            }
            // Cooldown elapsed: one free attempt.
            state.failures = 0;
            state.open_until = None;
        }
        Ok(())
    }

    fn record_failure(&self, op: &str) {
        let mut state = self.state.lock();
        state.failures += 1;
        if state.failures >= self.config.threshold {
            warn!(
                op,
                failures = state.failures,
                cooldown_ms = self.config.cooldown_ms,
                "circuit breaker opened"
            );
            state.open_until =
                Some(Instant::now() + Duration::from_millis(self.config.cooldown_ms));
            state.failures = 0;
        }
    }

    fn record_success(&self) {
        let mut state = self.state.lock();
        state.failures = 0;
        state.open_until = None;
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::stub::{StubReply, StubTransport};
    use crate::http::{HttpRequest, HttpTransport};
    use serde_json::json;
    use std::sync::Arc;
    use tokio_util::sync::CancellationToken;

    fn scope() -> TimeoutScope {
        TimeoutScope::new("test request", Duration::from_secs(5), None)
    }

    fn fast_config() -> ReliabilityConfig {
        ReliabilityConfig {
            retry_base_delay_ms: 1,
            retry_max_delay_ms: 2,
            retry_jitter_ms: 0,
            ..ReliabilityConfig::default()
        }
    }

    #[test]
    fn resolve_clamps_all_fields() {
        let config = ReliabilityConfig::resolve(&json!({
            "maxRetries": 99,
            "retryBaseDelayMs": 0,
            "retryMaxDelayMs": 0,
            "retryStatusCodes": [50, 429, 999, 503],
            "circuitBreakerThreshold": 0,
            "circuitBreakerCooldownMs": 1,
        }));
        assert_eq!(config.max_retries, 10);
        assert_eq!(config.retry_base_delay_ms, 1);
        assert!(config.retry_max_delay_ms >= config.retry_base_delay_ms);
        assert_eq!(
            config.retry_status_codes,
            [429, 503].into_iter().collect::<BTreeSet<u16>>()
        );
        assert_eq!(config.threshold, 1);
        assert_eq!(config.cooldown_ms, 100);
    }

    #[test]
    fn namespaced_aliases_apply() {
        let config = ReliabilityConfig::resolve(&json!({"llmMaxRetries": 7}));
        assert_eq!(config.max_retries, 7);
    }

    #[test]
    fn delay_doubles_and_caps() {
        let config = ReliabilityConfig {
            retry_base_delay_ms: 100,
            retry_max_delay_ms: 350,
            retry_jitter_ms: 0,
            ..ReliabilityConfig::default()
        };
        assert_eq!(config.delay_for_attempt(1), Duration::from_millis(100));
        assert_eq!(config.delay_for_attempt(2), Duration::from_millis(200));
        assert_eq!(config.delay_for_attempt(3), Duration::from_millis(350));
        assert_eq!(config.delay_for_attempt(10), Duration::from_millis(350));
    }

    #[tokio::test]
    async fn retries_transient_status_then_succeeds() {
        let stub = StubTransport::scripted(vec![
            StubReply::json(503, json!({"err": true})),
            StubReply::json(200, json!({"ok": true})),
        ]);
        let reliability = Reliability::new(ReliabilityConfig {
            max_retries: 1,
            ..fast_config()
        });
        let scope = scope();
        let stub2 = Arc::clone(&stub);
        let response = reliability
            .call("test request", &scope, || {
                let stub = Arc::clone(&stub2);
                async move { stub.send(HttpRequest::get("http://api")).await }
            })
            .await
            .unwrap();
        assert_eq!(response.status, 200);
        assert_eq!(stub.count_for("http://api"), 2);
    }

    #[tokio::test]
    async fn breaker_trips_and_blocks_next_call() {
        let stub = StubTransport::scripted(vec![StubReply::json(503, json!({}))]);
        let reliability = Reliability::new(ReliabilityConfig {
            max_retries: 0,
            threshold: 1,
            cooldown_ms: 60_000,
            ..fast_config()
        });
        let scope1 = scope();
        let stub2 = Arc::clone(&stub);
        let response = reliability
            .call("test request", &scope1, || {
                let stub = Arc::clone(&stub2);
                async move { stub.send(HttpRequest::get("http://api")).await }
            })
            .await
            .unwrap();
        assert_eq!(response.status, 503);
        assert!(reliability.is_open());

        let scope2 = scope();
        let stub3 = Arc::clone(&stub);
        let err = reliability
            .call("test request", &scope2, || {
                let stub = Arc::clone(&stub3);
                async move { stub.send(HttpRequest::get("http://api")).await }
            })
            .await
            .unwrap_err();
        assert!(err.to_string().contains("circuit breaker is open"));
        // Fetch was not invoked for the second call.
        assert_eq!(stub.count_for("http://api"), 1);
    }

    #[tokio::test]
    async fn half_open_allows_one_attempt_after_cooldown() {
        let stub = StubTransport::scripted(vec![
            StubReply::json(503, json!({})),
            StubReply::json(200, json!({})),
        ]);
        let reliability = Reliability::new(ReliabilityConfig {
            max_retries: 0,
            threshold: 1,
            cooldown_ms: 100,
            ..fast_config()
        });
        let stub2 = Arc::clone(&stub);
        let s = scope();
        reliability
            .call("test request", &s, || {
                let stub = Arc::clone(&stub2);
                async move { stub.send(HttpRequest::get("http://api")).await }
            })
            .await
            .unwrap();
        assert!(reliability.is_open());

        tokio::time::sleep(Duration::from_millis(120)).await;
        let stub3 = Arc::clone(&stub);
        let s = scope();
        let response = reliability
            .call("test request", &s, || {
                let stub = Arc::clone(&stub3);
                async move { stub.send(HttpRequest::get("http://api")).await }
            })
            .await
            .unwrap();
        assert_eq!(response.status, 200);
        assert!(!reliability.is_open());
    }

    #[tokio::test]
    async fn network_errors_retry_when_enabled() {
        let stub = StubTransport::scripted(vec![
            StubReply::network_error("connection refused"),
            StubReply::json(200, json!({})),
        ]);
        let reliability = Reliability::new(ReliabilityConfig {
            max_retries: 1,
            ..fast_config()
        });
        let s = scope();
        let stub2 = Arc::clone(&stub);
        let response = reliability
            .call("test request", &s, || {
                let stub = Arc::clone(&stub2);
                async move { stub.send(HttpRequest::get("http://api")).await }
            })
            .await
            .unwrap();
        assert_eq!(response.status, 200);
    }

    #[tokio::test]
    async fn network_errors_surface_when_disabled() {
        let stub = StubTransport::scripted(vec![StubReply::network_error("refused")]);
        let reliability = Reliability::new(ReliabilityConfig {
            max_retries: 3,
            retry_on_network_error: false,
            ..fast_config()
        });
        let s = scope();
        let err = reliability
            .call("test request", &s, || {
                let stub = Arc::clone(&stub);
                async move { stub.send(HttpRequest::get("http://api")).await }
            })
            .await
            .unwrap_err();
        assert!(err.is_network());
    }

    #[tokio::test]
    async fn caller_abort_propagates_without_retry() {
        let upstream = CancellationToken::new();
        upstream.cancel();
        let s = TimeoutScope::new("test request", Duration::from_secs(5), Some(upstream));
        tokio::time::sleep(Duration::from_millis(5)).await;

        let stub = StubTransport::scripted(vec![StubReply::json(200, json!({}))]);
        let reliability = Reliability::new(fast_config());
        let err = reliability
            .call("test request", &s, || {
                let stub = Arc::clone(&stub);
                async move { stub.send(HttpRequest::get("http://api")).await }
            })
            .await
            .unwrap_err();
        assert!(err.is_cancellation());
    }
}
