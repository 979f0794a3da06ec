use std::time::Duration;
use thiserror::Error;

/// Errors produced by the provider layer and the runtime executor.
#[derive(Error, Debug)]
pub enum RenderifyError {
    /// Low-level HTTP transport failure (connection refused, DNS, TLS, etc.).
    #[error("HTTP request failed: {0}")]
    Request(#[from] reqwest::Error),

    /// Connection-level failure surfaced with the target URL.
    #[error("{0}")]
    Network(String),

    /// JSON parsing failed at the serde level.
    #[error("JSON parsing failed: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP error with status code, response body, and optional Retry-After hint.
    ///
    /// Returned when a provider or CDN responds with a non-success status.
    /// The `retry_after` field is populated from the `Retry-After` response
    /// header when present.
    #[error("HTTP {status}: {body}")]
    Http {
        /// HTTP status code (e.g. 429, 500, 503).
        status: u16,
        /// Response body text.
        body: String,
        /// Parsed `Retry-After` header value, if present.
        retry_after: Option<Duration>,
    },

    /// The caller's cancellation token fired. Never retried.
    #[error("{message}")]
    Aborted { message: String },

    /// A timeout scope fired before the operation finished. Never retried.
    #[error("{message}")]
    TimedOut { message: String },

    /// The circuit breaker for this client is open.
    #[error("{message}")]
    CircuitOpen { message: String },

    /// The provider refused to answer (safety block, explicit refusal).
    #[error("{message}")]
    Refused { message: String },

    /// An upstream provider call failed with a non-success status.
    ///
    /// The message carries the provider-specific user-visible phrasing, e.g.
    /// `"OpenAI request failed (429): rate limited"`.
    #[error("{message}")]
    Provider { status: u16, message: String },

    /// Fetched module bytes do not hash to the manifest's integrity value.
    #[error("{message}")]
    IntegrityMismatch { message: String },

    /// The integrity value could not be checked at all (malformed format).
    #[error("{message}")]
    IntegrityCheckFailed { message: String },

    /// Invalid configuration detected at resolution time.
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    /// The requested operation is not supported by this client or host.
    #[error("{0}")]
    Unsupported(String),

    /// Catch-all for other errors.
    #[error("{0}")]
    Other(String),
}

impl RenderifyError {
    /// Whether this error is a cancellation (caller abort or timeout).
    ///
    /// Cancellation errors are never retried and never count toward the
    /// circuit breaker.
    pub fn is_cancellation(&self) -> bool {
        matches!(
            self,
            RenderifyError::Aborted { .. } | RenderifyError::TimedOut { .. }
        )
    }

    /// Whether this error is a network-level transport failure.
    pub fn is_network(&self) -> bool {
        matches!(
            self,
            RenderifyError::Request(_) | RenderifyError::Network(_)
        )
    }

    /// The HTTP status carried by this error, if any.
    pub fn status(&self) -> Option<u16> {
        match self {
            RenderifyError::Http { status, .. } | RenderifyError::Provider { status, .. } => {
                Some(*status)
            }
            _ => None,
        }
    }
}

impl From<anyhow::Error> for RenderifyError {
    fn from(err: anyhow::Error) -> Self {
        RenderifyError::Other(err.to_string())
    }
}

pub type Result<T> = std::result::Result<T, RenderifyError>;
