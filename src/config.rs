//! Environment-driven configuration.
//!
//! All `RENDERIFY_*` variables are optional; unknown enum values fall back
//! to defaults with a warning. Security profiles bundle the runtime's
//! manifest-enforcement, isolation-fallback, and network-policy defaults.

use std::collections::HashMap;

use serde_json::{json, Value};
use tracing::warn;

use crate::error::Result;
use crate::llm::mock::MockInterpreter;
use crate::llm::registry::{default_registry, ProviderFactory};
use crate::llm::Interpreter;
use crate::http::SharedTransport;
use crate::runtime::resolver::NetworkPolicy;
use crate::runtime::RuntimeOptions;

/// Bundled security posture.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SecurityProfile {
    Strict,
    #[default]
    Balanced,
    Relaxed,
}

impl SecurityProfile {
    fn parse(value: &str) -> Option<Self> {
        match value.trim().to_ascii_lowercase().as_str() {
            "strict" => Some(SecurityProfile::Strict),
            "balanced" => Some(SecurityProfile::Balanced),
            "relaxed" => Some(SecurityProfile::Relaxed),
            _ => None,
        }
    }
}

/// Resolved LLM client settings.
#[derive(Debug, Clone)]
pub struct LlmSettings {
    pub provider: String,
    pub api_key: Option<String>,
    pub model: Option<String>,
    pub base_url: Option<String>,
    pub timeout_ms: Option<u64>,
    pub use_structured_output: bool,
}

impl Default for LlmSettings {
    fn default() -> Self {
        Self {
            provider: "openai".to_string(),
            api_key: None,
            model: None,
            base_url: None,
            timeout_ms: None,
            use_structured_output: true,
        }
    }
}

/// The resolved configuration.
#[derive(Debug, Clone)]
pub struct RenderifyConfig {
    pub llm: LlmSettings,
    pub security_profile: SecurityProfile,
    pub runtime: RuntimeOptions,
}

impl Default for RenderifyConfig {
    fn default() -> Self {
        Self::from_lookup(|_| None)
    }
}

const KNOWN_PROVIDERS: &[&str] = &["openai", "anthropic", "google", "ollama", "lmstudio", "mock"];

impl RenderifyConfig {
    /// Load from process environment (after `.env`, courtesy of dotenvy).
    pub fn from_env() -> Self {
        dotenvy::dotenv().ok();
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Load from an explicit variable map (tests).
    pub fn from_vars(vars: &HashMap<String, String>) -> Self {
        Self::from_lookup(|key| vars.get(key).cloned())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut llm = LlmSettings::default();
        if let Some(provider) = lookup("RENDERIFY_LLM_PROVIDER") {
            let normalized = provider.trim().to_ascii_lowercase();
            if KNOWN_PROVIDERS.contains(&normalized.as_str()) {
                llm.provider = normalized;
            } else {
                warn!(provider = %provider, "unknown RENDERIFY_LLM_PROVIDER, keeping default");
            }
        }
        llm.api_key = lookup("RENDERIFY_LLM_API_KEY").filter(|v| !v.trim().is_empty());
        llm.model = lookup("RENDERIFY_LLM_MODEL").filter(|v| !v.trim().is_empty());
        llm.base_url = lookup("RENDERIFY_LLM_BASE_URL").filter(|v| !v.trim().is_empty());
        llm.timeout_ms = lookup("RENDERIFY_LLM_TIMEOUT_MS")
            .and_then(|v| v.trim().parse::<u64>().ok())
            .filter(|v| *v > 0);
        if let Some(flag) = lookup("RENDERIFY_LLM_USE_STRUCTURED_OUTPUT") {
            llm.use_structured_output = flag.trim() != "false";
        }

        let mut profile = lookup("RENDERIFY_SECURITY_PROFILE")
            .and_then(|v| {
                let parsed = SecurityProfile::parse(&v);
                if parsed.is_none() {
                    warn!(profile = %v, "unknown RENDERIFY_SECURITY_PROFILE, keeping default");
                }
                parsed
            })
            .unwrap_or_default();
        if lookup("RENDERIFY_STRICT_SECURITY").is_some_and(|v| is_truthy(&v)) {
            profile = SecurityProfile::Strict;
        }

        let cdn_base_url = lookup("RENDERIFY_JSPM_CDN_URL")
            .filter(|v| !v.trim().is_empty())
            .unwrap_or_else(|| "https://ga.jspm.io".to_string());

        let mut runtime = RuntimeOptions {
            cdn_base_url: cdn_base_url.clone(),
            ..RuntimeOptions::default()
        };
        apply_profile(&mut runtime, profile, &cdn_base_url);

        if let Some(flag) = lookup("RENDERIFY_RUNTIME_ENFORCE_MANIFEST") {
            runtime.enforce_module_manifest = flag.trim() != "false";
        }
        if let Some(flag) = lookup("RENDERIFY_RUNTIME_ALLOW_ISOLATION_FALLBACK") {
            // Disallowing isolation fallback means failing closed.
            runtime.browser_source_sandbox_fail_closed = flag.trim() == "false";
        }
        if let Some(versions) = lookup("RENDERIFY_RUNTIME_SPEC_VERSIONS") {
            let parsed: Vec<String> = versions
                .split(',')
                .map(str::trim)
                .filter(|v| !v.is_empty())
                .map(str::to_string)
                .collect();
            if !parsed.is_empty() {
                runtime.accepted_spec_versions = parsed;
            }
        }
        if let Some(limit) = lookup("RENDERIFY_MAX_EXECUTIONS_PER_MINUTE")
            .and_then(|v| v.trim().parse::<u32>().ok())
            .filter(|v| *v > 0)
        {
            runtime.max_executions_per_minute = Some(limit);
        }
        if let Some(limit) = lookup("RENDERIFY_MAX_CONCURRENT_EXECUTIONS")
            .and_then(|v| v.trim().parse::<usize>().ok())
            .filter(|v| *v > 0)
        {
            runtime.max_concurrent_executions = Some(limit);
        }

        Self {
            llm,
            security_profile: profile,
            runtime,
        }
    }

    /// The options map handed to the provider factory.
    pub fn llm_options(&self) -> Value {
        let mut options = serde_json::Map::new();
        if let Some(key) = &self.llm.api_key {
            options.insert("apiKey".into(), json!(key));
        }
        if let Some(model) = &self.llm.model {
            options.insert("model".into(), json!(model));
        }
        if let Some(base_url) = &self.llm.base_url {
            options.insert("baseUrl".into(), json!(base_url));
        }
        if let Some(timeout) = self.llm.timeout_ms {
            options.insert("timeoutMs".into(), json!(timeout));
        }
        Value::Object(options)
    }

    /// Build the configured interpreter. `mock` is wired here, on top of the
    /// default registry's five real providers.
    pub fn create_interpreter(&self, transport: SharedTransport) -> Result<Box<dyn Interpreter>> {
        let mut registry = default_registry(transport);
        registry.register(ProviderFactory::new("mock", |options| {
            let mut mock = MockInterpreter::default();
            mock.configure(options);
            Box::new(mock)
        }));
        registry.create(&self.llm.provider, &self.llm_options())
    }
}

fn is_truthy(value: &str) -> bool {
    matches!(
        value.trim().to_ascii_lowercase().as_str(),
        "1" | "true" | "yes" | "on"
    )
}

/// Map a security profile onto runtime defaults.
fn apply_profile(runtime: &mut RuntimeOptions, profile: SecurityProfile, cdn_base_url: &str) {
    let cdn_hosts = || {
        let mut hosts = Vec::new();
        if let Some(host) = url_host(cdn_base_url) {
            hosts.push(host);
        }
        hosts
    };
    match profile {
        SecurityProfile::Strict => {
            runtime.enforce_module_manifest = true;
            runtime.browser_source_sandbox_fail_closed = true;
            runtime.fail_on_dependency_preflight_error = true;
            runtime.network_policy = NetworkPolicy::allow_hosts(cdn_hosts());
        }
        SecurityProfile::Balanced => {
            runtime.enforce_module_manifest = true;
            runtime.browser_source_sandbox_fail_closed = false;
            runtime.network_policy = NetworkPolicy::allow_hosts(cdn_hosts());
        }
        SecurityProfile::Relaxed => {
            runtime.enforce_module_manifest = false;
            runtime.browser_source_sandbox_fail_closed = false;
            runtime.network_policy = NetworkPolicy::allow_all();
        }
    }
}

fn url_host(url: &str) -> Option<String> {
    reqwest::Url::parse(url)
        .ok()
        .and_then(|u| u.host_str().map(str::to_string))
}
