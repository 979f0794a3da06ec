//! Module specifier resolution, manifest enforcement, and network policy.
//!
//! Turns bare or scheme-qualified specifiers into fetchable URLs. When a plan
//! pins a specifier through its manifest, the pin wins; otherwise well-known
//! runtime aliases resolve through the compatibility table, and everything
//! else is subject to manifest enforcement.

use std::collections::BTreeMap;

use crate::error::{RenderifyError, Result};
use crate::plan::ManifestEntry;

/// Node built-ins that can never be loaded remotely.
const NODE_BUILTINS: &[&str] = &[
    "assert", "buffer", "child_process", "cluster", "crypto", "dns", "events", "fs",
    "http", "https", "module", "net", "os", "path", "process", "readline", "stream",
    "tls", "tty", "url", "util", "vm", "worker_threads", "zlib",
];

/// Schemes the loader refuses outright.
const REJECTED_SCHEMES: &[&str] = &["file:", "jsr:", "node:"];

/// Host-reserved aliases resolved through the compatibility table. The
/// `react*` family maps onto preact/compat so plans written against React
/// keep working.
const COMPAT_ALIASES: &[(&str, &str)] = &[
    ("preact", "preact@10.26.4/dist/preact.module.js"),
    ("preact/hooks", "preact@10.26.4/hooks/dist/hooks.module.js"),
    (
        "preact/jsx-runtime",
        "preact@10.26.4/jsx-runtime/dist/jsxRuntime.module.js",
    ),
    ("react", "preact@10.26.4/compat/dist/compat.module.js"),
    ("react-dom", "preact@10.26.4/compat/dist/compat.module.js"),
    (
        "react/jsx-runtime",
        "preact@10.26.4/jsx-runtime/dist/jsxRuntime.module.js",
    ),
];

/// How a specifier was classified.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SpecifierKind {
    /// Bare npm specifier: package plus optional subpath.
    Bare { package: String, subpath: Option<String> },
    /// Absolute http(s) URL.
    Url(String),
    /// Inline `data:` URL.
    Data(String),
}

/// Classify a specifier, rejecting what can never resolve remotely.
pub fn classify(specifier: &str) -> Result<SpecifierKind> {
    let spec = specifier.trim();
    if spec.is_empty() {
        return Err(RenderifyError::Other("empty module specifier".into()));
    }
    for scheme in REJECTED_SCHEMES {
        if spec.starts_with(scheme) {
            return Err(RenderifyError::Unsupported(format!(
                "unsupported module scheme in \"{spec}\""
            )));
        }
    }
    if spec.starts_with("data:") {
        return Ok(SpecifierKind::Data(spec.to_string()));
    }
    if spec.starts_with("http://") || spec.starts_with("https://") {
        return Ok(SpecifierKind::Url(spec.to_string()));
    }
    if spec.starts_with("./") || spec.starts_with("../") || spec.starts_with('/') {
        return Err(RenderifyError::Unsupported(format!(
            "local path \"{spec}\" cannot be resolved remotely"
        )));
    }

    let bare = spec.strip_prefix("npm:").unwrap_or(spec);
    let (package, subpath) = split_package(bare)?;
    if NODE_BUILTINS.contains(&package.as_str()) {
        return Err(RenderifyError::Unsupported(format!(
            "\"{package}\" is a node built-in"
        )));
    }
    Ok(SpecifierKind::Bare { package, subpath })
}

/// Split a bare specifier into `(package, subpath)`, scope-aware.
fn split_package(bare: &str) -> Result<(String, Option<String>)> {
    let segments: Vec<&str> = bare.split('/').collect();
    let package_segments = if bare.starts_with('@') { 2 } else { 1 };
    if segments.len() < package_segments || segments[..package_segments.min(segments.len())]
        .iter()
        .any(|s| s.is_empty())
    {
        return Err(RenderifyError::Other(format!(
            "malformed module specifier \"{bare}\""
        )));
    }
    let package = segments[..package_segments].join("/");
    let subpath = if segments.len() > package_segments {
        Some(segments[package_segments..].join("/"))
    } else {
        None
    };
    Ok((package, subpath))
}

/// Whether a specifier belongs to the well-known runtime alias family that
/// escapes manifest enforcement.
pub fn is_runtime_alias(specifier: &str) -> bool {
    specifier == "preact"
        || specifier.starts_with("preact/")
        || specifier == "react"
        || specifier.starts_with("react/")
        || specifier == "react-dom"
        || specifier.starts_with("react-dom/")
}

/// Where a resolution came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResolutionSource {
    Manifest,
    Alias,
    Direct,
    /// Unpinned bare specifier resolved straight against the CDN.
    Unpinned,
}

/// A resolved, fetchable module reference.
#[derive(Debug, Clone, PartialEq)]
pub struct Resolution {
    pub specifier: String,
    pub url: String,
    pub integrity: Option<String>,
    pub source: ResolutionSource,
}

/// Resolver over one plan's manifest.
#[derive(Debug, Clone)]
pub struct ModuleResolver {
    cdn_base_url: String,
    enforce_module_manifest: bool,
}

impl ModuleResolver {
    pub fn new(cdn_base_url: impl Into<String>, enforce_module_manifest: bool) -> Self {
        Self {
            cdn_base_url: cdn_base_url.into(),
            enforce_module_manifest,
        }
    }

    fn cdn(&self) -> &str {
        self.cdn_base_url.trim_end_matches('/')
    }

    /// Resolve `specifier` against `manifest`.
    ///
    /// Precedence: manifest pin, then the alias compatibility table, then
    /// direct URLs. An unpinned bare specifier is fatal when manifest
    /// enforcement is on (`RUNTIME_MANIFEST_MISSING` at the call site).
    pub fn resolve(
        &self,
        specifier: &str,
        manifest: Option<&BTreeMap<String, ManifestEntry>>,
    ) -> Result<Resolution> {
        let kind = classify(specifier)?;

        if let Some(entry) = manifest.and_then(|m| m.get(specifier)) {
            return Ok(Resolution {
                specifier: specifier.to_string(),
                url: entry.resolved_url.clone(),
                integrity: entry.integrity.clone(),
                source: ResolutionSource::Manifest,
            });
        }

        match kind {
            SpecifierKind::Url(url) | SpecifierKind::Data(url) => Ok(Resolution {
                specifier: specifier.to_string(),
                url,
                integrity: None,
                source: ResolutionSource::Direct,
            }),
            SpecifierKind::Bare { package, subpath } => {
                if let Some((_, path)) = COMPAT_ALIASES
                    .iter()
                    .find(|(alias, _)| *alias == specifier)
                {
                    return Ok(Resolution {
                        specifier: specifier.to_string(),
                        url: format!("{}/{path}", self.cdn()),
                        integrity: None,
                        source: ResolutionSource::Alias,
                    });
                }
                if is_runtime_alias(specifier) {
                    // Alias family without a table row: point at the package
                    // root on the CDN.
                    return Ok(Resolution {
                        specifier: specifier.to_string(),
                        url: format!("{}/{}", self.cdn(), specifier),
                        integrity: None,
                        source: ResolutionSource::Alias,
                    });
                }
                if self.enforce_module_manifest {
                    return Err(RenderifyError::Other(format!(
                        "no manifest entry for bare specifier \"{specifier}\""
                    )));
                }
                let path = match subpath {
                    Some(sub) => format!("{package}/{sub}"),
                    None => package,
                };
                Ok(Resolution {
                    specifier: specifier.to_string(),
                    url: format!("{}/{path}", self.cdn()),
                    integrity: None,
                    source: ResolutionSource::Unpinned,
                })
            }
        }
    }
}

/// Host allow-list with wildcard patterns and default-port normalization.
#[derive(Debug, Clone, Default)]
pub struct NetworkPolicy {
    pub allow_arbitrary_network: bool,
    pub allowed_hosts: Vec<String>,
}

impl NetworkPolicy {
    pub fn allow_all() -> Self {
        Self {
            allow_arbitrary_network: true,
            allowed_hosts: Vec::new(),
        }
    }

    pub fn allow_hosts(hosts: Vec<String>) -> Self {
        Self {
            allow_arbitrary_network: false,
            allowed_hosts: hosts,
        }
    }

    /// Whether `url` may be fetched. `data:` URLs never touch the network
    /// and are always permitted.
    pub fn permits(&self, url: &str) -> bool {
        if url.starts_with("data:") {
            return true;
        }
        if self.allow_arbitrary_network {
            return true;
        }
        let Some(host_port) = host_with_port(url) else {
            return false;
        };
        self.allowed_hosts
            .iter()
            .any(|pattern| host_matches(&normalize_pattern(pattern), &host_port))
    }
}

/// Extract `host` or `host:port` from a URL, dropping default ports.
fn host_with_port(url: &str) -> Option<String> {
    let parsed = reqwest::Url::parse(url).ok()?;
    let host = parsed.host_str()?.to_ascii_lowercase();
    match parsed.port() {
        // `Url::port` already yields None for scheme-default ports.
        Some(port) => Some(format!("{host}:{port}")),
        None => Some(host),
    }
}

/// Strip explicit default ports from a configured pattern.
fn normalize_pattern(pattern: &str) -> String {
    let lowered = pattern.trim().to_ascii_lowercase();
    lowered
        .strip_suffix(":443")
        .or_else(|| lowered.strip_suffix(":80"))
        .map(str::to_string)
        .unwrap_or(lowered)
}

fn host_matches(pattern: &str, host: &str) -> bool {
    if let Some(suffix) = pattern.strip_prefix("*.") {
        let bare_host = host.split(':').next().unwrap_or(host);
        return bare_host.ends_with(suffix)
            && bare_host.len() > suffix.len()
            && bare_host.as_bytes()[bare_host.len() - suffix.len() - 1] == b'.';
    }
    pattern == host
}

#[cfg(test)]
mod tests {
    use super::*;

    fn resolver() -> ModuleResolver {
        ModuleResolver::new("https://ga.jspm.io", true)
    }

    fn manifest_with(specifier: &str, url: &str) -> BTreeMap<String, ManifestEntry> {
        let mut manifest = BTreeMap::new();
        manifest.insert(
            specifier.to_string(),
            ManifestEntry {
                resolved_url: url.to_string(),
                integrity: None,
                version: None,
                signer: None,
            },
        );
        manifest
    }

    #[test]
    fn classify_specifier_kinds() {
        assert_eq!(
            classify("react").unwrap(),
            SpecifierKind::Bare {
                package: "react".into(),
                subpath: None
            }
        );
        assert_eq!(
            classify("@mui/material/Box").unwrap(),
            SpecifierKind::Bare {
                package: "@mui/material".into(),
                subpath: Some("Box".into())
            }
        );
        assert_eq!(
            classify("npm:date-fns").unwrap(),
            SpecifierKind::Bare {
                package: "date-fns".into(),
                subpath: None
            }
        );
        assert!(matches!(
            classify("https://cdn.example/mod.js").unwrap(),
            SpecifierKind::Url(_)
        ));
        assert!(matches!(
            classify("data:text/javascript,export default 1").unwrap(),
            SpecifierKind::Data(_)
        ));
    }

    #[test]
    fn rejects_builtins_schemes_and_local_paths() {
        assert!(classify("fs").is_err());
        assert!(classify("node:path").is_err());
        assert!(classify("file:///etc/passwd").is_err());
        assert!(classify("jsr:@std/path").is_err());
        assert!(classify("./local.js").is_err());
        assert!(classify("/abs.js").is_err());
    }

    #[test]
    fn manifest_pin_wins() {
        let manifest = manifest_with("date-fns", "https://cdn.example/date-fns@4.1.0/index.js");
        let resolution = resolver().resolve("date-fns", Some(&manifest)).unwrap();
        assert_eq!(resolution.url, "https://cdn.example/date-fns@4.1.0/index.js");
        assert_eq!(resolution.source, ResolutionSource::Manifest);
    }

    #[test]
    fn alias_escapes_manifest_enforcement() {
        let resolution = resolver().resolve("preact/hooks", None).unwrap();
        assert_eq!(resolution.source, ResolutionSource::Alias);
        assert!(resolution.url.contains("preact@10.26.4/hooks"));

        let react = resolver().resolve("react", None).unwrap();
        assert!(react.url.contains("compat"));
    }

    #[test]
    fn unpinned_bare_is_fatal_under_enforcement() {
        let err = resolver().resolve("left-pad", None).unwrap_err();
        assert!(err.to_string().contains("no manifest entry"));
    }

    #[test]
    fn unpinned_bare_resolves_when_enforcement_off() {
        let resolver = ModuleResolver::new("https://ga.jspm.io", false);
        let resolution = resolver.resolve("left-pad", None).unwrap();
        assert_eq!(resolution.url, "https://ga.jspm.io/left-pad");
        assert_eq!(resolution.source, ResolutionSource::Unpinned);
    }

    #[test]
    fn policy_wildcards_and_ports() {
        let policy = NetworkPolicy::allow_hosts(vec![
            "*.jspm.io".to_string(),
            "cdn.example:8443".to_string(),
            "plain.example:443".to_string(),
        ]);
        assert!(policy.permits("https://ga.jspm.io/pkg@1/index.js"));
        assert!(!policy.permits("https://jspm.io.evil.com/x"));
        assert!(policy.permits("https://cdn.example:8443/x"));
        assert!(!policy.permits("https://cdn.example/x"));
        // Default port in the pattern matches a URL without one.
        assert!(policy.permits("https://plain.example/x"));
        assert!(policy.permits("data:text/javascript,export default 1"));
        assert!(!policy.permits("https://unlisted.example/x"));
    }

    #[test]
    fn arbitrary_network_allows_everything() {
        assert!(NetworkPolicy::allow_all().permits("https://anything.example/x"));
    }
}
