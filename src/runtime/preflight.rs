//! Dependency preflight: probe declared dependencies before rendering.
//!
//! Probes are collected from declared plan imports, component nodes in the
//! tree, and author-source import statements, deduplicated by
//! `(usage, specifier)` in declaration order. Execution is sequential,
//! abortable between probes, and budgeted.

use std::collections::{BTreeMap, HashSet};

use tracing::debug;

use super::loader::ModuleLoader;
use super::resolver::ModuleResolver;
use super::transpiler::collect_import_specifiers;
use crate::plan::diagnostics::{
    Diagnostic, RUNTIME_ABORTED, RUNTIME_PREFLIGHT_COMPONENT_FAILED,
    RUNTIME_PREFLIGHT_IMPORT_FAILED, RUNTIME_PREFLIGHT_SKIPPED,
    RUNTIME_PREFLIGHT_SOURCE_IMPORT_FAILED,
    RUNTIME_PREFLIGHT_SOURCE_IMPORT_RELATIVE_UNRESOLVED, RUNTIME_SOURCE_IMPORT_BLOCKED,
    RUNTIME_TIMEOUT,
};
use crate::plan::{ManifestEntry, Node, RuntimePlan};

/// Where a probe's specifier was found.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ProbeUsage {
    Import,
    Component,
    SourceImport,
}

impl ProbeUsage {
    pub fn as_str(&self) -> &'static str {
        match self {
            ProbeUsage::Import => "import",
            ProbeUsage::Component => "component",
            ProbeUsage::SourceImport => "source-import",
        }
    }

    fn failure_code(&self) -> &'static str {
        match self {
            ProbeUsage::Import => RUNTIME_PREFLIGHT_IMPORT_FAILED,
            ProbeUsage::Component => RUNTIME_PREFLIGHT_COMPONENT_FAILED,
            ProbeUsage::SourceImport => RUNTIME_PREFLIGHT_SOURCE_IMPORT_FAILED,
        }
    }
}

/// One dependency to probe.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct DependencyProbe {
    pub usage: ProbeUsage,
    pub specifier: String,
}

/// The result of one probe.
#[derive(Debug, Clone)]
pub struct ProbeStatus {
    pub usage: ProbeUsage,
    pub specifier: String,
    pub ok: bool,
    pub message: Option<String>,
}

/// The whole pass: per-probe statuses plus diagnostics. `completed` is false
/// when the pass was cut short by abort or budget.
#[derive(Debug, Default)]
pub struct PreflightReport {
    pub statuses: Vec<ProbeStatus>,
    pub diagnostics: Vec<Diagnostic>,
    pub completed: bool,
}

impl PreflightReport {
    pub fn all_ok(&self) -> bool {
        self.statuses.iter().all(|s| s.ok)
    }
}

/// Collect probes from a plan: declared imports, component modules found by
/// walking the tree, and author-source imports. Duplicate-free under
/// `(usage, specifier)`, in declaration order.
pub fn collect_probes(plan: &RuntimePlan) -> Vec<DependencyProbe> {
    let mut probes = Vec::new();
    let mut seen: HashSet<(ProbeUsage, String)> = HashSet::new();
    let mut push = |probes: &mut Vec<DependencyProbe>, usage: ProbeUsage, specifier: &str| {
        if seen.insert((usage, specifier.to_string())) {
            probes.push(DependencyProbe {
                usage,
                specifier: specifier.to_string(),
            });
        }
    };

    for import in &plan.imports {
        push(&mut probes, ProbeUsage::Import, import);
    }
    collect_component_modules(&plan.root, &mut |specifier| {
        push(&mut probes, ProbeUsage::Component, specifier);
    });
    if let Some(source) = &plan.source {
        for specifier in collect_import_specifiers(&source.code) {
            push(&mut probes, ProbeUsage::SourceImport, &specifier);
        }
    }
    probes
}

fn collect_component_modules(node: &Node, visit: &mut impl FnMut(&str)) {
    match node {
        Node::Component { module, .. } => visit(module),
        Node::Element { children, .. } => {
            for child in children {
                collect_component_modules(child, visit);
            }
        }
        Node::Text { .. } => {}
    }
}

/// Run probes in order. `is_aborted` / `has_exceeded_budget` are consulted
/// before each probe; either cuts the pass short with a stable diagnostic
/// and the partial status list.
pub async fn run_preflight(
    probes: &[DependencyProbe],
    resolver: &ModuleResolver,
    manifest: Option<&BTreeMap<String, ManifestEntry>>,
    loader: Option<&ModuleLoader>,
    is_aborted: impl Fn() -> bool,
    has_exceeded_budget: impl Fn() -> bool,
) -> PreflightReport {
    let mut report = PreflightReport::default();

    for probe in probes {
        if is_aborted() {
            report.diagnostics.push(Diagnostic::error(
                RUNTIME_ABORTED,
                "dependency preflight aborted",
            ));
            return report;
        }
        if has_exceeded_budget() {
            report.diagnostics.push(Diagnostic::error(
                RUNTIME_TIMEOUT,
                "dependency preflight exceeded the execution budget",
            ));
            return report;
        }

        let status = run_probe(probe, resolver, manifest, loader, &mut report.diagnostics).await;
        debug!(
            usage = probe.usage.as_str(),
            specifier = %probe.specifier,
            ok = status.ok,
            "preflight probe"
        );
        report.statuses.push(status);
    }

    report.completed = true;
    report
}

async fn run_probe(
    probe: &DependencyProbe,
    resolver: &ModuleResolver,
    manifest: Option<&BTreeMap<String, ManifestEntry>>,
    loader: Option<&ModuleLoader>,
    diagnostics: &mut Vec<Diagnostic>,
) -> ProbeStatus {
    let fail = |message: String, code: &str, diagnostics: &mut Vec<Diagnostic>| {
        diagnostics.push(Diagnostic::warning(
            code,
            format!("{} \"{}\": {}", probe.usage.as_str(), probe.specifier, message),
        ));
        ProbeStatus {
            usage: probe.usage,
            specifier: probe.specifier.clone(),
            ok: false,
            message: Some(message),
        }
    };

    // Relative source imports cannot be resolved against a remote CDN.
    if probe.usage == ProbeUsage::SourceImport
        && (probe.specifier.starts_with("./") || probe.specifier.starts_with("../"))
    {
        return fail(
            "relative import cannot be resolved".to_string(),
            RUNTIME_PREFLIGHT_SOURCE_IMPORT_RELATIVE_UNRESOLVED,
            diagnostics,
        );
    }

    let resolution = match resolver.resolve(&probe.specifier, manifest) {
        Ok(resolution) => resolution,
        Err(e) => return fail(e.to_string(), probe.usage.failure_code(), diagnostics),
    };

    let Some(loader) = loader else {
        diagnostics.push(Diagnostic::warning(
            RUNTIME_PREFLIGHT_SKIPPED,
            format!(
                "no loader available to probe \"{}\"",
                probe.specifier
            ),
        ));
        return ProbeStatus {
            usage: probe.usage,
            specifier: probe.specifier.clone(),
            ok: true,
            message: None,
        };
    };

    match loader.load(&resolution).await {
        Ok(_) => ProbeStatus {
            usage: probe.usage,
            specifier: probe.specifier.clone(),
            ok: true,
            message: None,
        },
        Err(e) => {
            let code = if probe.usage == ProbeUsage::SourceImport
                && e.to_string().contains("network policy")
            {
                RUNTIME_SOURCE_IMPORT_BLOCKED
            } else {
                probe.usage.failure_code()
            };
            fail(e.to_string(), code, diagnostics)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::stub::{StubReply, StubTransport};
    use crate::runtime::loader::LoaderOptions;
    use crate::runtime::resolver::NetworkPolicy;
    use crate::plan::{SourceLanguage, SourceModule};
    use serde_json::json;

    fn plan_with_everything() -> RuntimePlan {
        serde_json::from_value(json!({
            "id": "p1",
            "version": 1,
            "capabilities": {"domWrite": false},
            "imports": ["date-fns", "date-fns"],
            "root": {
                "type": "element",
                "tag": "div",
                "children": [
                    {"type": "component", "module": "chart-lib"},
                    {"type": "element", "tag": "span", "children": [
                        {"type": "component", "module": "chart-lib"},
                        {"type": "component", "module": "table-lib"}
                    ]}
                ]
            }
        }))
        .unwrap()
    }

    #[test]
    fn probes_are_deduplicated_in_declaration_order() {
        let mut plan = plan_with_everything();
        plan.source = Some(SourceModule {
            code: "import \"date-fns\";\nimport x from \"chart-lib\";".to_string(),
            language: SourceLanguage::Js,
            filename: None,
            runtime: None,
        });

        let probes = collect_probes(&plan);
        let listed: Vec<(&str, &str)> = probes
            .iter()
            .map(|p| (p.usage.as_str(), p.specifier.as_str()))
            .collect();
        assert_eq!(
            listed,
            vec![
                ("import", "date-fns"),
                ("component", "chart-lib"),
                ("component", "table-lib"),
                // Same specifiers under a different usage are distinct.
                ("source-import", "date-fns"),
                ("source-import", "chart-lib"),
            ]
        );
    }

    #[test]
    fn probe_set_is_duplicate_free() {
        let plan = plan_with_everything();
        let probes = collect_probes(&plan);
        let mut seen = HashSet::new();
        for probe in &probes {
            assert!(seen.insert((probe.usage, probe.specifier.clone())));
        }
    }

    fn loader_with(replies: Vec<StubReply>) -> ModuleLoader {
        let stub = StubTransport::scripted(replies);
        ModuleLoader::new(
            stub,
            LoaderOptions {
                policy: NetworkPolicy::allow_all(),
                fetch_retries: 0,
                ..LoaderOptions::default()
            },
        )
    }

    fn pinned_manifest() -> BTreeMap<String, ManifestEntry> {
        let mut manifest = BTreeMap::new();
        manifest.insert(
            "date-fns".to_string(),
            ManifestEntry {
                resolved_url: "https://cdn.example/date-fns@4.1.0/index.js".to_string(),
                integrity: None,
                version: None,
                signer: None,
            },
        );
        manifest
    }

    #[tokio::test]
    async fn successful_pass_reports_ok_statuses() {
        let resolver = ModuleResolver::new("https://ga.jspm.io", true);
        let loader = loader_with(vec![StubReply::text(200, "export default 1;")]);
        let manifest = pinned_manifest();
        let probes = vec![DependencyProbe {
            usage: ProbeUsage::Import,
            specifier: "date-fns".to_string(),
        }];

        let report = run_preflight(
            &probes,
            &resolver,
            Some(&manifest),
            Some(&loader),
            || false,
            || false,
        )
        .await;
        assert!(report.completed);
        assert!(report.all_ok());
        assert!(report.diagnostics.is_empty());
    }

    #[tokio::test]
    async fn abort_cuts_pass_short() {
        let resolver = ModuleResolver::new("https://ga.jspm.io", true);
        let probes = vec![
            DependencyProbe {
                usage: ProbeUsage::Import,
                specifier: "date-fns".to_string(),
            },
        ];
        let report = run_preflight(&probes, &resolver, None, None, || true, || false).await;
        assert!(!report.completed);
        assert!(report.statuses.is_empty());
        assert_eq!(report.diagnostics[0].code, RUNTIME_ABORTED);
    }

    #[tokio::test]
    async fn budget_exhaustion_reports_timeout() {
        let resolver = ModuleResolver::new("https://ga.jspm.io", true);
        let probes = vec![DependencyProbe {
            usage: ProbeUsage::Import,
            specifier: "date-fns".to_string(),
        }];
        let report = run_preflight(&probes, &resolver, None, None, || false, || true).await;
        assert!(!report.completed);
        assert_eq!(report.diagnostics[0].code, RUNTIME_TIMEOUT);
    }

    #[tokio::test]
    async fn relative_source_import_is_unresolvable() {
        let resolver = ModuleResolver::new("https://ga.jspm.io", true);
        let probes = vec![DependencyProbe {
            usage: ProbeUsage::SourceImport,
            specifier: "./local.js".to_string(),
        }];
        let report = run_preflight(&probes, &resolver, None, None, || false, || false).await;
        assert!(report.completed);
        assert!(!report.statuses[0].ok);
        assert_eq!(
            report.diagnostics[0].code,
            RUNTIME_PREFLIGHT_SOURCE_IMPORT_RELATIVE_UNRESOLVED
        );
    }

    #[tokio::test]
    async fn failed_fetch_uses_usage_specific_code() {
        let resolver = ModuleResolver::new("https://ga.jspm.io", true);
        let loader = loader_with(vec![StubReply::text(404, "missing")]);
        let manifest = pinned_manifest();
        let probes = vec![DependencyProbe {
            usage: ProbeUsage::Import,
            specifier: "date-fns".to_string(),
        }];
        let report = run_preflight(
            &probes,
            &resolver,
            Some(&manifest),
            Some(&loader),
            || false,
            || false,
        )
        .await;
        assert!(!report.statuses[0].ok);
        assert_eq!(report.diagnostics[0].code, RUNTIME_PREFLIGHT_IMPORT_FAILED);
    }

    #[tokio::test]
    async fn blocked_source_import_uses_blocked_code() {
        let resolver = ModuleResolver::new("https://ga.jspm.io", false);
        let stub = StubTransport::scripted(vec![]);
        let loader = ModuleLoader::new(
            stub,
            LoaderOptions {
                policy: NetworkPolicy::allow_hosts(vec!["allowed.example".to_string()]),
                ..LoaderOptions::default()
            },
        );
        let probes = vec![DependencyProbe {
            usage: ProbeUsage::SourceImport,
            specifier: "https://blocked.example/mod.js".to_string(),
        }];
        let report =
            run_preflight(&probes, &resolver, None, Some(&loader), || false, || false).await;
        assert!(!report.statuses[0].ok);
        assert_eq!(report.diagnostics[0].code, RUNTIME_SOURCE_IMPORT_BLOCKED);
    }

    #[tokio::test]
    async fn no_loader_records_skip() {
        let resolver = ModuleResolver::new("https://ga.jspm.io", true);
        let manifest = pinned_manifest();
        let probes = vec![DependencyProbe {
            usage: ProbeUsage::Import,
            specifier: "date-fns".to_string(),
        }];
        let report =
            run_preflight(&probes, &resolver, Some(&manifest), None, || false, || false).await;
        assert!(report.completed);
        assert_eq!(report.diagnostics[0].code, RUNTIME_PREFLIGHT_SKIPPED);
    }
}
