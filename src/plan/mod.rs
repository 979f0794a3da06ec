//! The RuntimePlan data model.
//!
//! A [`RuntimePlan`] is the declarative UI description produced by an LLM and
//! consumed by the executor. Plans are immutable inputs: the executor never
//! mutates a plan it is handed.

pub mod diagnostics;

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use diagnostics::{Diagnostic, DiagnosticLevel};

/// The plan format version this runtime accepts by default.
pub const SPEC_VERSION_V1: &str = "runtime-plan/v1";

fn default_spec_version() -> String {
    SPEC_VERSION_V1.to_string()
}

/// Declarative UI plan. JSON wire format, `specVersion: "runtime-plan/v1"`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RuntimePlan {
    #[serde(default = "default_spec_version")]
    pub spec_version: String,
    pub id: String,
    pub version: u32,
    pub capabilities: Capabilities,
    pub root: Node,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub imports: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub module_manifest: Option<BTreeMap<String, ManifestEntry>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<PlanState>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source: Option<SourceModule>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub metadata: Option<Value>,
}

/// Pinning entry: where a bare specifier must resolve, and optionally what
/// the fetched bytes must hash to.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ManifestEntry {
    pub resolved_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub integrity: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub signer: Option<String>,
}

/// Tagged node tree: text leaf, host element, or remote component reference.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Node {
    Text {
        value: String,
    },
    #[serde(rename_all = "camelCase")]
    Element {
        tag: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        props: Option<BTreeMap<String, Value>>,
        #[serde(default, skip_serializing_if = "Vec::is_empty")]
        children: Vec<Node>,
    },
    #[serde(rename_all = "camelCase")]
    Component {
        module: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        export_name: Option<String>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        props: Option<BTreeMap<String, Value>>,
    },
}

impl Node {
    /// A text node.
    pub fn text(value: impl Into<String>) -> Self {
        Node::Text {
            value: value.into(),
        }
    }

    /// An element node with no props.
    pub fn element(tag: impl Into<String>, children: Vec<Node>) -> Self {
        Node::Element {
            tag: tag.into(),
            props: None,
            children,
        }
    }
}

/// What a plan is allowed to do.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct Capabilities {
    #[serde(default)]
    pub dom_write: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub allowed_modules: Option<Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_execution_ms: Option<u64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_imports: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_component_invocations: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub execution_profile: Option<ExecutionProfile>,
}

/// Requested isolation level for author source.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ExecutionProfile {
    #[serde(rename = "default")]
    Default,
    #[serde(rename = "sandbox-worker")]
    SandboxWorker,
    #[serde(rename = "sandbox-iframe")]
    SandboxIframe,
    #[serde(rename = "isolated-vm")]
    IsolatedVm,
}

/// Declarative state: initial value plus named transitions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
pub struct PlanState {
    #[serde(default)]
    pub initial: Value,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub transitions: BTreeMap<String, Vec<TransitionAction>>,
}

fn default_increment_by() -> f64 {
    1.0
}

/// One state transition action, applied in list order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum TransitionAction {
    /// Write `value` at dotted `path`. The value may be a literal or a
    /// `{"$from": "state.x" | "event.x" | "context.x" | "vars.x"}` reference.
    Set { path: String, value: Value },
    /// Numeric addition at `path`; non-numeric current values coerce to 0.
    Increment {
        path: String,
        #[serde(default = "default_increment_by")]
        by: f64,
    },
}

/// Author-supplied source to transpile and run in a sandbox.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SourceModule {
    pub code: String,
    pub language: SourceLanguage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub runtime: Option<SourceRuntime>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceLanguage {
    Js,
    Jsx,
    Ts,
    Tsx,
}

impl SourceLanguage {
    pub fn as_str(&self) -> &'static str {
        match self {
            SourceLanguage::Js => "js",
            SourceLanguage::Jsx => "jsx",
            SourceLanguage::Ts => "ts",
            SourceLanguage::Tsx => "tsx",
        }
    }

    /// Whether the language carries TypeScript syntax.
    pub fn is_typescript(&self) -> bool {
        matches!(self, SourceLanguage::Ts | SourceLanguage::Tsx)
    }

    /// Whether the language carries JSX syntax.
    pub fn is_jsx(&self) -> bool {
        matches!(self, SourceLanguage::Jsx | SourceLanguage::Tsx)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SourceRuntime {
    Renderify,
    Preact,
}

/// Read-only call context supplied by the embedder.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Default)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionContext {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub variables: BTreeMap<String, Value>,
}

/// Event delivered to a plan's state machine. Open map: any field beyond
/// `type` is available to `$from: "event.x"` references.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanEvent {
    #[serde(rename = "type")]
    pub event_type: String,
    #[serde(flatten)]
    pub data: BTreeMap<String, Value>,
}

impl PlanEvent {
    pub fn new(event_type: impl Into<String>) -> Self {
        Self {
            event_type: event_type.into(),
            data: BTreeMap::new(),
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: Value) -> Self {
        self.data.insert(key.into(), value);
        self
    }
}

/// One applied transition action, recorded in execution order.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AppliedAction {
    pub action: String,
    pub path: String,
    pub value: Value,
}

/// What `execute` returns. Always carries a usable `root` — the plan's
/// declared fallback when execution failed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ExecutionResult {
    pub plan_id: String,
    pub root: Node,
    pub diagnostics: Vec<Diagnostic>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub applied_actions: Option<Vec<AppliedAction>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub render_artifact: Option<String>,
}
