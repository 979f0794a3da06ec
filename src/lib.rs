//! # Renderify
//!
//! Prompt-to-UI runtime: a uniform client layer over heterogeneous LLM
//! provider APIs, and a capability-gated executor for the declarative
//! **RuntimePlan** intermediate representation those LLMs produce.
//!
//! The crate has two tightly coupled halves:
//!
//! - **[`llm`]** — provider clients (OpenAI, Anthropic, Google, Ollama,
//!   LM Studio) behind one [`Interpreter`](llm::Interpreter) trait: unary
//!   calls, pull-based streaming, and schema-constrained structured outputs,
//!   hardened by retries, circuit breakers, timeout scopes, and
//!   cancellation.
//! - **[`runtime`]** — the plan executor: resolves, integrity-checks, and
//!   materializes remote modules, transpiles author source, runs it in one
//!   of several sandboxes, applies declarative state transitions, and
//!   produces a rendered node tree.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use renderify::config::RenderifyConfig;
//! use renderify::http::ReqwestTransport;
//! use renderify::llm::{LlmRequest, STRUCTURED_FORMAT_RUNTIME_PLAN};
//! use renderify::plan::RuntimePlan;
//! use renderify::runtime::{ExecuteRequest, HostCapabilities, RuntimeExecutor};
//!
//! # async fn run() -> renderify::Result<()> {
//! renderify::telemetry::init();
//! let config = RenderifyConfig::from_env();
//! let transport = Arc::new(ReqwestTransport::new());
//!
//! let interpreter = config.create_interpreter(transport.clone())?;
//! let structured = interpreter
//!     .generate_structured_response(
//!         &LlmRequest::new("a dashboard with a sales chart"),
//!         STRUCTURED_FORMAT_RUNTIME_PLAN,
//!     )
//!     .await?;
//! let plan: RuntimePlan = serde_json::from_value(structured.value.unwrap())?;
//!
//! let executor = RuntimeExecutor::new(
//!     transport,
//!     HostCapabilities::native(),
//!     config.runtime.clone(),
//! );
//! let result = executor.execute(ExecuteRequest::for_plan(&plan)).await?;
//! println!("rendered {} diagnostics", result.diagnostics.len());
//! # Ok(())
//! # }
//! ```

pub mod config;
pub mod error;
pub mod http;
pub mod llm;
pub mod plan;
pub mod reliability;
pub mod runtime;
pub mod scope;
pub mod telemetry;

pub(crate) mod options;

pub use error::{RenderifyError, Result};
pub use llm::registry::{default_registry, ProviderRegistry};
pub use llm::{
    Interpreter, LlmRequest, LlmResponse, LlmStream, LlmStreamChunk, LlmStructuredResponse,
};
pub use plan::{
    Capabilities, Diagnostic, DiagnosticLevel, ExecutionContext, ExecutionResult, ManifestEntry,
    Node, PlanEvent, RuntimePlan,
};
pub use reliability::{Reliability, ReliabilityConfig};
pub use runtime::{ExecuteRequest, HostCapabilities, RuntimeExecutor, RuntimeOptions};
pub use scope::TimeoutScope;
