//! Execution diagnostics with stable codes.
//!
//! The executor never crashes on a bad plan: every violation is recorded as a
//! [`Diagnostic`] and execution degrades (text fallback, omitted node, kept
//! fallback root). Codes are stable strings consumers can match on.

use serde::{Deserialize, Serialize};

/// Severity of a diagnostic.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum DiagnosticLevel {
    Warning,
    Error,
}

/// One diagnostic emitted during execution.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Diagnostic {
    pub level: DiagnosticLevel,
    pub code: String,
    pub message: String,
}

impl Diagnostic {
    pub fn warning(code: &str, message: impl Into<String>) -> Self {
        Self {
            level: DiagnosticLevel::Warning,
            code: code.to_string(),
            message: message.into(),
        }
    }

    pub fn error(code: &str, message: impl Into<String>) -> Self {
        Self {
            level: DiagnosticLevel::Error,
            code: code.to_string(),
            message: message.into(),
        }
    }
}

pub const RUNTIME_ABORTED: &str = "RUNTIME_ABORTED";
pub const RUNTIME_TIMEOUT: &str = "RUNTIME_TIMEOUT";
pub const RUNTIME_MANIFEST_MISSING: &str = "RUNTIME_MANIFEST_MISSING";
pub const RUNTIME_MANIFEST_INVALID: &str = "RUNTIME_MANIFEST_INVALID";
pub const RUNTIME_IMPORT_LIMIT_EXCEEDED: &str = "RUNTIME_IMPORT_LIMIT_EXCEEDED";
pub const RUNTIME_LOADER_MISSING: &str = "RUNTIME_LOADER_MISSING";
pub const RUNTIME_COMPONENT_SKIPPED: &str = "RUNTIME_COMPONENT_SKIPPED";
pub const RUNTIME_COMPONENT_EXEC_FAILED: &str = "RUNTIME_COMPONENT_EXEC_FAILED";
pub const RUNTIME_NODE_INVALID: &str = "RUNTIME_NODE_INVALID";
pub const RUNTIME_SOURCE_EXEC_FAILED: &str = "RUNTIME_SOURCE_EXEC_FAILED";
pub const RUNTIME_SOURCE_SANDBOX_EXECUTED: &str = "RUNTIME_SOURCE_SANDBOX_EXECUTED";
pub const RUNTIME_SOURCE_SANDBOX_FAILED: &str = "RUNTIME_SOURCE_SANDBOX_FAILED";
pub const RUNTIME_SOURCE_EXPORT_FALLBACK_DEFAULT: &str = "RUNTIME_SOURCE_EXPORT_FALLBACK_DEFAULT";
pub const RUNTIME_SOURCE_EXPORT_MISSING: &str = "RUNTIME_SOURCE_EXPORT_MISSING";
pub const RUNTIME_SOURCE_IMPORT_BLOCKED: &str = "RUNTIME_SOURCE_IMPORT_BLOCKED";
pub const RUNTIME_SOURCE_IMPORT_FALLBACK_USED: &str = "RUNTIME_SOURCE_IMPORT_FALLBACK_USED";
pub const RUNTIME_NETWORK_POLICY_BLOCKED: &str = "RUNTIME_NETWORK_POLICY_BLOCKED";
pub const RUNTIME_INTEGRITY_MISMATCH: &str = "RUNTIME_INTEGRITY_MISMATCH";
pub const RUNTIME_INTEGRITY_CHECK_FAILED: &str = "RUNTIME_INTEGRITY_CHECK_FAILED";
pub const RUNTIME_PREFLIGHT_SKIPPED: &str = "RUNTIME_PREFLIGHT_SKIPPED";
pub const RUNTIME_PREFLIGHT_IMPORT_FAILED: &str = "RUNTIME_PREFLIGHT_IMPORT_FAILED";
pub const RUNTIME_PREFLIGHT_COMPONENT_FAILED: &str = "RUNTIME_PREFLIGHT_COMPONENT_FAILED";
pub const RUNTIME_PREFLIGHT_SOURCE_IMPORT_FAILED: &str = "RUNTIME_PREFLIGHT_SOURCE_IMPORT_FAILED";
pub const RUNTIME_PREFLIGHT_SOURCE_IMPORT_RELATIVE_UNRESOLVED: &str =
    "RUNTIME_PREFLIGHT_SOURCE_IMPORT_RELATIVE_UNRESOLVED";
pub const RUNTIME_MANIFEST_AUTOPIN_FAILED: &str = "RUNTIME_MANIFEST_AUTOPIN_FAILED";
pub const RUNTIME_MANIFEST_AUTOPIN_BUDGET_EXCEEDED: &str =
    "RUNTIME_MANIFEST_AUTOPIN_BUDGET_EXCEEDED";
