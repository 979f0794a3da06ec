//! Timeout-abort scopes for outbound calls.
//!
//! Every outbound HTTP call runs under a [`TimeoutScope`]: a cancellation
//! token that fires when the timeout elapses or when an upstream token is
//! cancelled, whichever comes first. The scope records *why* it fired so the
//! surfaced error can distinguish a caller abort from a timeout.

use std::sync::Arc;
use std::sync::OnceLock;
use std::time::Duration;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::error::{RenderifyError, Result};

/// Why a [`TimeoutScope`] fired.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AbortCause {
    /// The upstream (caller-supplied) token was cancelled.
    Caller,
    /// The scope's own timer elapsed.
    Timeout,
}

/// A cancellation scope combining a timeout with an optional upstream token.
///
/// The scope owns a watcher task that cancels the scope token on whichever
/// fires first. [`release`](Self::release) (or `Drop`) detaches the watcher;
/// after release no further aborts are delivered through this scope.
///
/// # Example
///
/// ```
/// use std::time::Duration;
/// use renderify::scope::TimeoutScope;
///
/// # tokio_test::block_on(async {
/// let scope = TimeoutScope::new("demo request", Duration::from_secs(30), None);
/// let out = scope.guard(async { Ok::<_, renderify::RenderifyError>(42) }).await;
/// assert_eq!(out.unwrap(), 42);
/// scope.release();
/// # });
/// ```
#[derive(Debug)]
pub struct TimeoutScope {
    operation: String,
    timeout: Duration,
    token: CancellationToken,
    cause: Arc<OnceLock<AbortCause>>,
    watcher: Option<JoinHandle<()>>,
}

impl TimeoutScope {
    /// Create a scope for `operation` that aborts after `timeout`, or when
    /// `upstream` is cancelled.
    ///
    /// `operation` names the call in surfaced error messages, e.g.
    /// `"OpenAI request"`.
    pub fn new(
        operation: impl Into<String>,
        timeout: Duration,
        upstream: Option<CancellationToken>,
    ) -> Self {
        let token = CancellationToken::new();
        let cause = Arc::new(OnceLock::new());

        let watch_token = token.clone();
        let watch_cause = Arc::clone(&cause);
        let watcher = tokio::spawn(async move {
            match upstream {
                Some(up) => {
                    tokio::select! {
                        _ = up.cancelled() => {
                            let _ = watch_cause.set(AbortCause::Caller);
                        }
                        _ = tokio::time::sleep(timeout) => {
                            let _ = watch_cause.set(AbortCause::Timeout);
                        }
                    }
                }
                None => {
                    tokio::time::sleep(timeout).await;
                    let _ = watch_cause.set(AbortCause::Timeout);
                }
            }
            watch_token.cancel();
        });

        Self {
            operation: operation.into(),
            timeout,
            token,
            cause,
            watcher: Some(watcher),
        }
    }

    /// The scope's cancellation token. Clone freely; all clones fire together.
    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Whether the scope has fired.
    pub fn is_aborted(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Why the scope fired, if it has.
    pub fn cause(&self) -> Option<AbortCause> {
        self.cause.get().copied()
    }

    /// The error to surface for this scope's abort.
    ///
    /// Caller aborts read `"{operation} aborted by caller"`; timeouts read
    /// `"{operation} timed out after {ms}ms"`.
    pub fn abort_error(&self) -> RenderifyError {
        match self.cause() {
            Some(AbortCause::Timeout) => RenderifyError::TimedOut {
                message: format!(
                    "{} timed out after {}ms",
                    self.operation,
                    self.timeout.as_millis()
                ),
            },
            // Treat an un-caused cancel as a caller abort: the only way the
            // token fires without a recorded cause is external cancellation.
            _ => RenderifyError::Aborted {
                message: format!("{} aborted by caller", self.operation),
            },
        }
    }

    /// Run `fut` under this scope, returning the scope's abort error if the
    /// scope fires first.
    pub async fn guard<T>(&self, fut: impl std::future::Future<Output = Result<T>>) -> Result<T> {
        tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(self.abort_error()),
            res = fut => res,
        }
    }

    /// Sleep for `duration`, waking early with the abort error if the scope
    /// fires. Used for retry backoff delays.
    pub async fn sleep(&self, duration: Duration) -> Result<()> {
        self.guard(async {
            tokio::time::sleep(duration).await;
            Ok(())
        })
        .await
    }

    /// Clear the timer and detach the upstream listener. After this call no
    /// further aborts are delivered through the scope token.
    pub fn release(mut self) {
        self.detach();
    }

    fn detach(&mut self) {
        if let Some(watcher) = self.watcher.take() {
            watcher.abort();
        }
    }
}

impl Drop for TimeoutScope {
    fn drop(&mut self) {
        self.detach();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn timeout_fires_with_timeout_cause() {
        let scope = TimeoutScope::new("OpenAI request", Duration::from_millis(10), None);
        scope.token().cancelled().await;
        assert_eq!(scope.cause(), Some(AbortCause::Timeout));
        let err = scope.abort_error();
        assert!(err.to_string().contains("timed out after 10ms"));
        assert!(matches!(err, RenderifyError::TimedOut { .. }));
    }

    #[tokio::test]
    async fn upstream_abort_wins_over_timeout() {
        let upstream = CancellationToken::new();
        let scope = TimeoutScope::new(
            "Anthropic request",
            Duration::from_secs(60),
            Some(upstream.clone()),
        );
        upstream.cancel();
        scope.token().cancelled().await;
        assert_eq!(scope.cause(), Some(AbortCause::Caller));
        assert_eq!(
            scope.abort_error().to_string(),
            "Anthropic request aborted by caller"
        );
    }

    #[tokio::test]
    async fn release_detaches_timer() {
        let scope = TimeoutScope::new("op", Duration::from_millis(5), None);
        let token = scope.token().clone();
        scope.release();
        tokio::time::sleep(Duration::from_millis(25)).await;
        assert!(!token.is_cancelled());
    }

    #[tokio::test]
    async fn guard_returns_future_result_when_not_aborted() {
        let scope = TimeoutScope::new("op", Duration::from_secs(5), None);
        let out = scope.guard(async { Ok("done") }).await.unwrap();
        assert_eq!(out, "done");
    }

    #[tokio::test]
    async fn guard_surfaces_abort() {
        let upstream = CancellationToken::new();
        let scope = TimeoutScope::new("op", Duration::from_secs(5), Some(upstream.clone()));
        upstream.cancel();
        // Give the watcher a beat to record the cause.
        tokio::time::sleep(Duration::from_millis(5)).await;
        let out: Result<()> = scope.guard(std::future::pending()).await;
        assert!(matches!(out, Err(RenderifyError::Aborted { .. })));
    }

    #[tokio::test]
    async fn sleep_cancels_early() {
        let upstream = CancellationToken::new();
        let scope = TimeoutScope::new("op", Duration::from_secs(60), Some(upstream.clone()));
        upstream.cancel();
        tokio::time::sleep(Duration::from_millis(5)).await;
        let started = std::time::Instant::now();
        let out = scope.sleep(Duration::from_secs(30)).await;
        assert!(out.is_err());
        assert!(started.elapsed() < Duration::from_secs(1));
    }
}
