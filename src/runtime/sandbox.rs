//! Sandbox selection and dispatch for author-supplied source.
//!
//! The host environment's execution surfaces (worker, iframe, ShadowRealm,
//! direct dynamic import) are injected once at init through
//! [`HostCapabilities`]; the dispatcher picks a mode from the plan's
//! execution profile, falls back through the fixed order
//! worker → iframe → shadowrealm → none when the selected surface is
//! unavailable, and drives the serialized request/result boundary.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::error::Result;
use crate::plan::{ExecutionProfile, SourceRuntime};

/// Isolation mode for one source execution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum SandboxKind {
    Worker,
    Iframe,
    ShadowRealm,
    /// Direct dynamic import in the host realm.
    None,
}

impl SandboxKind {
    /// Fixed fallback order when the selected mode is unavailable.
    pub const FALLBACK_ORDER: [SandboxKind; 4] = [
        SandboxKind::Worker,
        SandboxKind::Iframe,
        SandboxKind::ShadowRealm,
        SandboxKind::None,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            SandboxKind::Worker => "worker",
            SandboxKind::Iframe => "iframe",
            SandboxKind::ShadowRealm => "shadowrealm",
            SandboxKind::None => "none",
        }
    }

    fn is_sandbox(&self) -> bool {
        !matches!(self, SandboxKind::None)
    }
}

/// Bootstrap script for worker hosts: imports the module from the envelope,
/// invokes the requested export, and posts the serialized outcome. Each
/// invocation gets a fresh worker; hosts terminate it on completion or abort.
pub const WORKER_BOOTSTRAP: &str = r#"self.onmessage = async (message) => {
  const { id, moduleUrl, exportName, runtimeInput } = message.data;
  try {
    const ns = await import(moduleUrl);
    const fn = exportName ? ns[exportName] : ns.default;
    if (typeof fn !== "function") {
      throw new Error("module export is not callable");
    }
    const output = await fn(runtimeInput);
    self.postMessage({ id, ok: true, output });
  } catch (error) {
    self.postMessage({ id, ok: false, error: String(error && error.message || error) });
  }
};
"#;

/// Bootstrap page for iframe hosts: announces readiness over a
/// `MessageChannel`, then serves one `execute` request and replies with a
/// single `result` message.
pub const IFRAME_BOOTSTRAP_HTML: &str = r#"<!doctype html>
<script type="module">
  const channel = new MessageChannel();
  channel.port1.onmessage = async (message) => {
    const { type, request } = message.data;
    if (type !== "execute") return;
    const { id, moduleUrl, exportName, runtimeInput } = request;
    try {
      const ns = await import(moduleUrl);
      const fn = exportName ? ns[exportName] : ns.default;
      if (typeof fn !== "function") {
        throw new Error("module export is not callable");
      }
      const output = await fn(runtimeInput);
      channel.port1.postMessage({ type: "result", id, ok: true, output });
    } catch (error) {
      channel.port1.postMessage({
        type: "result", id, ok: false,
        error: String(error && error.message || error),
      });
    }
  };
  parent.postMessage({ type: "ready" }, "*", [channel.port2]);
</script>
"#;

/// Serialized request crossing the sandbox boundary.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxEnvelope {
    pub id: String,
    /// Materialized module URL to import inside the sandbox.
    pub module_url: String,
    /// Export to invoke; empty means the default export.
    pub export_name: String,
    pub runtime_input: Value,
}

/// Serialized result crossing back.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SandboxOutcome {
    pub id: String,
    pub ok: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub output: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// One sandbox execution surface (worker, iframe, or ShadowRealm host).
///
/// Each invocation is expected to create a fresh isolate and tear it down on
/// completion or abort.
#[async_trait]
pub trait SandboxHost: Send + Sync {
    fn kind(&self) -> SandboxKind;
    async fn execute(
        &self,
        envelope: &SandboxEnvelope,
        cancel: &CancellationToken,
    ) -> Result<SandboxOutcome>;
}

/// Direct module import surface (`sandbox = none` and component loading).
#[async_trait]
pub trait ModuleHost: Send + Sync {
    /// Export names of the module at `import_url`.
    async fn exports(&self, import_url: &str) -> Result<Vec<String>>;
    /// Invoke a named export with a JSON input, returning its JSON output.
    async fn invoke(&self, import_url: &str, export: &str, input: &Value) -> Result<Value>;
}

/// The host capability record, discovered once at init.
#[derive(Clone, Default)]
pub struct HostCapabilities {
    pub is_browser: bool,
    module_host: Option<Arc<dyn ModuleHost>>,
    sandboxes: BTreeMap<&'static str, Arc<dyn SandboxHost>>,
}

impl HostCapabilities {
    /// A non-browser host with no execution surfaces.
    pub fn native() -> Self {
        Self::default()
    }

    pub fn browser() -> Self {
        Self {
            is_browser: true,
            ..Self::default()
        }
    }

    pub fn with_module_host(mut self, host: Arc<dyn ModuleHost>) -> Self {
        self.module_host = Some(host);
        self
    }

    pub fn with_sandbox(mut self, host: Arc<dyn SandboxHost>) -> Self {
        self.sandboxes.insert(host.kind().as_str(), host);
        self
    }

    pub fn module_host(&self) -> Option<&Arc<dyn ModuleHost>> {
        self.module_host.as_ref()
    }

    pub fn sandbox(&self, kind: SandboxKind) -> Option<&Arc<dyn SandboxHost>> {
        self.sandboxes.get(kind.as_str())
    }
}

/// Dispatcher configuration.
#[derive(Debug, Clone)]
pub struct DispatchOptions {
    /// Mode used when the plan does not request one.
    pub default_kind: SandboxKind,
    /// Suppress the final fallback to direct execution.
    pub fail_closed: bool,
}

impl Default for DispatchOptions {
    fn default() -> Self {
        Self {
            default_kind: SandboxKind::None,
            fail_closed: false,
        }
    }
}

/// How a dispatch failed; the executor maps these onto diagnostics.
#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("preact source cannot run in a sandbox")]
    PreactSandbox,
    #[error("no sandbox surface is available")]
    NoSurface,
    #[error("no module host is configured for direct execution")]
    NoModuleHost,
    #[error("export \"{0}\" not found in source module")]
    ExportMissing(String),
    #[error("source execution failed: {0}")]
    Execution(String),
    #[error(transparent)]
    Aborted(crate::error::RenderifyError),
}

/// A completed dispatch.
#[derive(Debug, Clone)]
pub struct SandboxExecution {
    pub output: Value,
    pub kind: SandboxKind,
    /// A mode other than the selected one ended up running the source.
    pub fallback_used: bool,
    /// The named export was missing and `default` was invoked instead.
    pub export_fallback: bool,
}

/// Select a mode and run the envelope through it.
pub async fn dispatch(
    hosts: &HostCapabilities,
    options: &DispatchOptions,
    profile: Option<ExecutionProfile>,
    runtime: Option<SourceRuntime>,
    envelope: &SandboxEnvelope,
    cancel: &CancellationToken,
) -> std::result::Result<SandboxExecution, DispatchError> {
    let selected = match profile {
        Some(ExecutionProfile::SandboxWorker) => SandboxKind::Worker,
        Some(ExecutionProfile::SandboxIframe) => SandboxKind::Iframe,
        Some(ExecutionProfile::IsolatedVm) => SandboxKind::ShadowRealm,
        Some(ExecutionProfile::Default) | None => options.default_kind,
    };

    if runtime == Some(SourceRuntime::Preact) {
        // Sandboxing is unsupported for preact sources; an explicit request
        // is a configuration error, otherwise run direct.
        if profile.is_some_and(|p| p != ExecutionProfile::Default) {
            return Err(DispatchError::PreactSandbox);
        }
        return run_direct(hosts, envelope, false).await;
    }

    let selected = if hosts.is_browser {
        selected
    } else {
        SandboxKind::None
    };

    let mut candidates: Vec<SandboxKind> = vec![selected];
    for kind in SandboxKind::FALLBACK_ORDER {
        if !candidates.contains(&kind) {
            candidates.push(kind);
        }
    }

    for kind in candidates {
        if kind == SandboxKind::None {
            if options.fail_closed && selected.is_sandbox() {
                return Err(DispatchError::NoSurface);
            }
            return run_direct(hosts, envelope, selected != SandboxKind::None).await;
        }
        let Some(host) = hosts.sandbox(kind) else {
            continue;
        };
        debug!(kind = kind.as_str(), id = %envelope.id, "dispatching source to sandbox");
        let outcome = host
            .execute(envelope, cancel)
            .await
            .map_err(|e| {
                if e.is_cancellation() {
                    DispatchError::Aborted(e)
                } else {
                    DispatchError::Execution(e.to_string())
                }
            })?;
        if !outcome.ok {
            return Err(DispatchError::Execution(
                outcome.error.unwrap_or_else(|| "unknown sandbox error".into()),
            ));
        }
        return Ok(SandboxExecution {
            output: outcome.output.unwrap_or(Value::Null),
            kind,
            fallback_used: kind != selected,
            export_fallback: false,
        });
    }

    Err(DispatchError::NoSurface)
}

/// Direct execution through the module host, with default-export fallback.
async fn run_direct(
    hosts: &HostCapabilities,
    envelope: &SandboxEnvelope,
    fallback_used: bool,
) -> std::result::Result<SandboxExecution, DispatchError> {
    let host = hosts.module_host().ok_or(DispatchError::NoModuleHost)?;

    let wanted = if envelope.export_name.is_empty() {
        "default".to_string()
    } else {
        envelope.export_name.clone()
    };
    let exports = host
        .exports(&envelope.module_url)
        .await
        .map_err(|e| DispatchError::Execution(e.to_string()))?;

    let (export, export_fallback) = if exports.iter().any(|e| e == &wanted) {
        (wanted, false)
    } else if wanted != "default" && exports.iter().any(|e| e == "default") {
        ("default".to_string(), true)
    } else {
        return Err(DispatchError::ExportMissing(wanted));
    };

    let output = host
        .invoke(&envelope.module_url, &export, &envelope.runtime_input)
        .await
        .map_err(|e| {
            if e.is_cancellation() {
                DispatchError::Aborted(e)
            } else {
                DispatchError::Execution(e.to_string())
            }
        })?;

    Ok(SandboxExecution {
        output,
        kind: SandboxKind::None,
        fallback_used,
        export_fallback,
    })
}

#[cfg(test)]
pub(crate) mod testing {
    //! Fake hosts shared by sandbox and executor tests.

    use super::*;
    use parking_lot::Mutex;

    /// Module host backed by a static export table.
    pub struct FakeModuleHost {
        /// `(import_url_suffix, export) -> output`
        pub modules: Mutex<Vec<(String, Vec<String>, Value)>>,
        pub invocations: Mutex<Vec<(String, String)>>,
    }

    impl FakeModuleHost {
        pub fn single(exports: Vec<&str>, output: Value) -> Arc<Self> {
            Arc::new(Self {
                modules: Mutex::new(vec![(
                    String::new(),
                    exports.into_iter().map(str::to_string).collect(),
                    output,
                )]),
                invocations: Mutex::new(Vec::new()),
            })
        }
    }

    #[async_trait]
    impl ModuleHost for FakeModuleHost {
        async fn exports(&self, import_url: &str) -> Result<Vec<String>> {
            let modules = self.modules.lock();
            Ok(modules
                .iter()
                .find(|(suffix, _, _)| import_url.contains(suffix.as_str()))
                .map(|(_, exports, _)| exports.clone())
                .unwrap_or_default())
        }

        async fn invoke(&self, import_url: &str, export: &str, _input: &Value) -> Result<Value> {
            self.invocations
                .lock()
                .push((import_url.to_string(), export.to_string()));
            let modules = self.modules.lock();
            Ok(modules
                .iter()
                .find(|(suffix, _, _)| import_url.contains(suffix.as_str()))
                .map(|(_, _, output)| output.clone())
                .unwrap_or(Value::Null))
        }
    }

    /// Sandbox host returning a fixed outcome.
    pub struct FakeSandboxHost {
        pub sandbox_kind: SandboxKind,
        pub outcome: SandboxOutcome,
        pub calls: Mutex<u32>,
    }

    impl FakeSandboxHost {
        pub fn succeeding(kind: SandboxKind, output: Value) -> Arc<Self> {
            Arc::new(Self {
                sandbox_kind: kind,
                outcome: SandboxOutcome {
                    id: "x".into(),
                    ok: true,
                    output: Some(output),
                    error: None,
                },
                calls: Mutex::new(0),
            })
        }

        pub fn failing(kind: SandboxKind, error: &str) -> Arc<Self> {
            Arc::new(Self {
                sandbox_kind: kind,
                outcome: SandboxOutcome {
                    id: "x".into(),
                    ok: false,
                    output: None,
                    error: Some(error.to_string()),
                },
                calls: Mutex::new(0),
            })
        }
    }

    #[async_trait]
    impl SandboxHost for FakeSandboxHost {
        fn kind(&self) -> SandboxKind {
            self.sandbox_kind
        }

        async fn execute(
            &self,
            _envelope: &SandboxEnvelope,
            _cancel: &CancellationToken,
        ) -> Result<SandboxOutcome> {
            *self.calls.lock() += 1;
            Ok(self.outcome.clone())
        }
    }
}
