//! Autopin: best-effort manifest filling before execution.
//!
//! For each bare import specifier with no manifest entry, probe the CDN for
//! the latest version (`GET {base}/npm:{pkg}` returns plain-text), pick an
//! ESM entry from the package manifest, and pin
//! `{base}/{pkg}@{version}/{entry}`. Existing entries are never overwritten;
//! running the pass twice yields the same manifest.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures::StreamExt;
use serde_json::Value;
use tracing::{debug, warn};

use super::resolver::{classify, is_runtime_alias, SpecifierKind};
use crate::error::{RenderifyError, Result};
use crate::http::{HttpRequest, SharedTransport};
use crate::plan::diagnostics::{
    Diagnostic, RUNTIME_MANIFEST_AUTOPIN_BUDGET_EXCEEDED, RUNTIME_MANIFEST_AUTOPIN_FAILED,
};
use crate::plan::ManifestEntry;
use crate::scope::TimeoutScope;

/// Autopin tuning knobs.
#[derive(Debug, Clone)]
pub struct AutopinOptions {
    pub cdn_base_url: String,
    pub max_concurrent_resolutions: usize,
    /// Running failure budget; once exceeded the pass stops probing.
    pub max_failed_resolutions: u32,
    pub probe_timeout_ms: u64,
}

impl Default for AutopinOptions {
    fn default() -> Self {
        Self {
            cdn_base_url: "https://ga.jspm.io".to_string(),
            max_concurrent_resolutions: 4,
            max_failed_resolutions: 3,
            probe_timeout_ms: 5_000,
        }
    }
}

/// What the pass produced: new manifest entries plus diagnostics.
#[derive(Debug, Default)]
pub struct AutopinOutcome {
    pub entries: BTreeMap<String, ManifestEntry>,
    pub diagnostics: Vec<Diagnostic>,
}

/// Run the autopin pass over the collected bare specifiers.
pub async fn autopin(
    transport: &SharedTransport,
    options: &AutopinOptions,
    specifiers: &[String],
    existing: Option<&BTreeMap<String, ManifestEntry>>,
) -> AutopinOutcome {
    let mut seen = BTreeSet::new();
    let candidates: Vec<String> = specifiers
        .iter()
        .filter(|spec| seen.insert(spec.as_str()))
        .filter(|spec| existing.map_or(true, |m| !m.contains_key(spec.as_str())))
        .filter(|spec| !is_runtime_alias(spec))
        .filter(|spec| matches!(classify(spec), Ok(SpecifierKind::Bare { .. })))
        .cloned()
        .collect();

    let failures = Arc::new(AtomicU32::new(0));
    let mut outcome = AutopinOutcome::default();
    let mut budget_exceeded = false;

    let mut probes = futures::stream::iter(candidates.into_iter().map(|specifier| {
        let transport = transport.clone();
        let options = options.clone();
        let failures = Arc::clone(&failures);
        async move {
            if failures.load(Ordering::Relaxed) > options.max_failed_resolutions {
                return (specifier, ProbeResult::Skipped);
            }
            match resolve_latest(&transport, &options, &specifier).await {
                Ok(entry) => (specifier, ProbeResult::Pinned(entry)),
                Err(e) => {
                    failures.fetch_add(1, Ordering::Relaxed);
                    (specifier, ProbeResult::Failed(e.to_string()))
                }
            }
        }
    }))
    .buffered(options.max_concurrent_resolutions.max(1));

    while let Some((specifier, result)) = probes.next().await {
        match result {
            ProbeResult::Pinned(entry) => {
                debug!(specifier = %specifier, url = %entry.resolved_url, "autopinned");
                outcome.entries.insert(specifier, entry);
            }
            ProbeResult::Failed(message) => {
                warn!(specifier = %specifier, message = %message, "autopin failed");
                outcome.diagnostics.push(Diagnostic::warning(
                    RUNTIME_MANIFEST_AUTOPIN_FAILED,
                    format!("could not pin \"{specifier}\": {message}"),
                ));
            }
            ProbeResult::Skipped => {
                if !budget_exceeded {
                    budget_exceeded = true;
                    outcome.diagnostics.push(Diagnostic::warning(
                        RUNTIME_MANIFEST_AUTOPIN_BUDGET_EXCEEDED,
                        "autopin stopped: failure budget exceeded",
                    ));
                }
            }
        }
    }

    outcome
}

enum ProbeResult {
    Pinned(ManifestEntry),
    Failed(String),
    Skipped,
}

/// Resolve the latest version and ESM entry for one bare specifier.
async fn resolve_latest(
    transport: &SharedTransport,
    options: &AutopinOptions,
    specifier: &str,
) -> Result<ManifestEntry> {
    let (package, subpath) = match classify(specifier)? {
        SpecifierKind::Bare { package, subpath } => (package, subpath),
        _ => {
            return Err(RenderifyError::Other(format!(
                "\"{specifier}\" is not a bare specifier"
            )))
        }
    };

    let cdn = options.cdn_base_url.trim_end_matches('/');
    let version = probe_text(
        transport,
        options,
        &format!("{cdn}/npm:{package}"),
    )
    .await?;
    let version = version.trim().to_string();
    if version.is_empty() || version.contains(char::is_whitespace) {
        return Err(RenderifyError::Other(format!(
            "CDN returned an invalid version for \"{package}\""
        )));
    }

    let entry_path = match subpath {
        Some(sub) => sub,
        None => {
            let manifest_url = format!("{cdn}/{package}@{version}/package.json");
            let manifest_text = probe_text(transport, options, &manifest_url).await?;
            let manifest: Value = serde_json::from_str(&manifest_text)?;
            pick_esm_entry(&manifest)
        }
    };

    Ok(ManifestEntry {
        resolved_url: format!("{cdn}/{package}@{version}/{entry_path}"),
        integrity: None,
        version: Some(version),
        signer: None,
    })
}

async fn probe_text(
    transport: &SharedTransport,
    options: &AutopinOptions,
    url: &str,
) -> Result<String> {
    let scope = TimeoutScope::new(
        format!("autopin probe {url}"),
        Duration::from_millis(options.probe_timeout_ms),
        None,
    );
    let result = scope
        .guard(async {
            let response = transport.send(HttpRequest::get(url)).await?;
            if !response.ok() {
                let status = response.status;
                let body = response.text().await.unwrap_or_default();
                return Err(RenderifyError::Http {
                    status,
                    body,
                    retry_after: None,
                });
            }
            response.text().await
        })
        .await;
    scope.release();
    result
}

/// Pick an ESM entry from a package manifest: `module`, then the root
/// `exports` target, then `main`, else `index.js`.
fn pick_esm_entry(manifest: &Value) -> String {
    if let Some(module) = manifest["module"].as_str() {
        return strip_dot_slash(module);
    }
    if let Some(exports) = manifest.get("exports") {
        if let Some(target) = export_target(exports) {
            return strip_dot_slash(&target);
        }
        if let Some(root) = exports.get(".") {
            if let Some(target) = export_target(root) {
                return strip_dot_slash(&target);
            }
        }
    }
    if let Some(main) = manifest["main"].as_str() {
        return strip_dot_slash(main);
    }
    "index.js".to_string()
}

fn export_target(exports: &Value) -> Option<String> {
    match exports {
        Value::String(s) => Some(s.clone()),
        Value::Object(map) => map
            .get("import")
            .or_else(|| map.get("default"))
            .and_then(Value::as_str)
            .map(str::to_string),
        _ => None,
    }
}

fn strip_dot_slash(path: &str) -> String {
    path.strip_prefix("./").unwrap_or(path).to_string()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::stub::{StubReply, StubTransport};
    use serde_json::json;

    fn options() -> AutopinOptions {
        AutopinOptions {
            cdn_base_url: "https://ga.jspm.io".to_string(),
            max_concurrent_resolutions: 1,
            max_failed_resolutions: 1,
            probe_timeout_ms: 1_000,
        }
    }

    #[tokio::test]
    async fn pins_latest_version_with_esm_entry() {
        let stub = StubTransport::scripted(vec![
            StubReply::text(200, "4.1.0"),
            StubReply::json(200, json!({"name": "date-fns", "module": "./index.js"})),
        ]);
        let transport: SharedTransport = stub.clone();
        let outcome = autopin(&transport, &options(), &["date-fns".to_string()], None).await;

        let entry = &outcome.entries["date-fns"];
        assert!(entry.resolved_url.ends_with("/date-fns@4.1.0/index.js"));
        assert_eq!(entry.version.as_deref(), Some("4.1.0"));
        assert!(outcome.diagnostics.is_empty());

        let requests = stub.requests();
        assert_eq!(requests[0].url, "https://ga.jspm.io/npm:date-fns");
        assert_eq!(
            requests[1].url,
            "https://ga.jspm.io/date-fns@4.1.0/package.json"
        );
    }

    #[tokio::test]
    async fn existing_entries_are_never_overwritten() {
        let stub = StubTransport::scripted(vec![]);
        let transport: SharedTransport = Arc::clone(&stub) as _;
        let mut existing = BTreeMap::new();
        existing.insert(
            "date-fns".to_string(),
            ManifestEntry {
                resolved_url: "https://pinned.example/date-fns@3.0.0/index.js".to_string(),
                integrity: None,
                version: Some("3.0.0".to_string()),
                signer: None,
            },
        );
        let outcome = autopin(
            &transport,
            &options(),
            &["date-fns".to_string()],
            Some(&existing),
        )
        .await;
        assert!(outcome.entries.is_empty());
        assert!(stub.requests().is_empty());
    }

    #[tokio::test]
    async fn aliases_and_urls_are_not_probed() {
        let stub = StubTransport::scripted(vec![]);
        let transport: SharedTransport = Arc::clone(&stub) as _;
        let outcome = autopin(
            &transport,
            &options(),
            &[
                "preact".to_string(),
                "preact/hooks".to_string(),
                "https://cdn.example/mod.js".to_string(),
            ],
            None,
        )
        .await;
        assert!(outcome.entries.is_empty());
        assert!(stub.requests().is_empty());
    }

    #[tokio::test]
    async fn failure_budget_stops_the_pass() {
        // Budget 0: the first failure exhausts it and the rest are skipped.
        let mut opts = options();
        opts.max_failed_resolutions = 0;
        let stub = StubTransport::scripted(vec![StubReply::text(404, "not found")]);
        let transport: SharedTransport = Arc::clone(&stub) as _;
        let outcome = autopin(
            &transport,
            &opts,
            &["nope-a".to_string(), "nope-b".to_string()],
            None,
        )
        .await;
        assert!(outcome.entries.is_empty());
        assert!(outcome
            .diagnostics
            .iter()
            .any(|d| d.code == RUNTIME_MANIFEST_AUTOPIN_FAILED));
        assert!(outcome
            .diagnostics
            .iter()
            .any(|d| d.code == RUNTIME_MANIFEST_AUTOPIN_BUDGET_EXCEEDED));
        // Only the first specifier was probed.
        assert_eq!(stub.requests().len(), 1);
    }

    #[tokio::test]
    async fn subpath_specifiers_pin_the_subpath() {
        let stub = StubTransport::scripted(vec![StubReply::text(200, "7.3.1")]);
        let transport: SharedTransport = stub;
        let outcome = autopin(
            &transport,
            &options(),
            &["@mui/material/Box".to_string()],
            None,
        )
        .await;
        let entry = &outcome.entries["@mui/material/Box"];
        assert_eq!(
            entry.resolved_url,
            "https://ga.jspm.io/@mui/material@7.3.1/Box"
        );
    }

    #[test]
    fn esm_entry_preference_order() {
        assert_eq!(
            pick_esm_entry(&json!({"module": "./esm/index.js", "main": "./cjs/index.js"})),
            "esm/index.js"
        );
        assert_eq!(
            pick_esm_entry(&json!({"exports": {".": {"import": "./dist/mod.mjs"}}})),
            "dist/mod.mjs"
        );
        assert_eq!(
            pick_esm_entry(&json!({"exports": "./only.js"})),
            "only.js"
        );
        assert_eq!(pick_esm_entry(&json!({"main": "lib/index.js"})), "lib/index.js");
        assert_eq!(pick_esm_entry(&json!({})), "index.js");
    }
}
