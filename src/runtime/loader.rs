//! Remote module fetching, integrity verification, and materialization.
//!
//! The loader turns a [`Resolution`] into an importable module reference:
//! fetch (with bounded retries and a hedged fallback CDN request), verify
//! integrity when the manifest pins one, and re-emit the body as a
//! `data:` URL the host runtime can import. Namespace records are cached
//! under an LRU keyed by requested URL; concurrent loads of the same URL are
//! deduplicated so the upstream fetch runs exactly once.

use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;
use std::time::Duration;

use base64::engine::general_purpose::STANDARD as BASE64;
use base64::Engine;
use bytes::Bytes;
use futures::future::{BoxFuture, FutureExt, Shared};
use lru::LruCache;
use parking_lot::Mutex;
use sha2::{Digest, Sha256, Sha384, Sha512};
use tracing::{debug, warn};

use super::resolver::{NetworkPolicy, Resolution};
use crate::error::{RenderifyError, Result};
use crate::http::{HttpRequest, SharedTransport};
use crate::scope::TimeoutScope;

/// Canonical user-visible message for a policy-blocked URL.
pub const NETWORK_POLICY_BLOCKED_MESSAGE: &str =
    "Remote module URL is blocked by runtime network policy";

/// What kind of body was materialized.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ModuleContentType {
    JavaScript,
    Css,
    Json,
}

/// An importable module reference.
#[derive(Debug, Clone, PartialEq)]
pub struct ModuleRecord {
    pub specifier: String,
    /// The URL the caller asked for (cache key).
    pub requested_url: String,
    /// The URL that actually served the bytes (primary or fallback CDN).
    pub fetched_url: String,
    /// Materialized `data:` URL suitable for a host `import()`.
    pub import_url: String,
    pub content_type: ModuleContentType,
    pub used_fallback: bool,
    pub size: usize,
}

/// Loader tuning knobs.
#[derive(Debug, Clone)]
pub struct LoaderOptions {
    pub policy: NetworkPolicy,
    /// Fallback CDN base URLs for hedged fetches.
    pub fallback_cdn_urls: Vec<String>,
    /// Delay before the hedged fallback request is fired.
    pub hedge_delay_ms: u64,
    pub fetch_timeout_ms: u64,
    pub fetch_retries: u32,
    pub cache_capacity: usize,
}

impl Default for LoaderOptions {
    fn default() -> Self {
        Self {
            policy: NetworkPolicy::default(),
            fallback_cdn_urls: Vec::new(),
            hedge_delay_ms: 200,
            fetch_timeout_ms: 10_000,
            fetch_retries: 2,
            cache_capacity: 64,
        }
    }
}

type SharedError = Arc<RenderifyError>;
type SharedLoad = Shared<BoxFuture<'static, std::result::Result<Arc<ModuleRecord>, SharedError>>>;

struct LoaderInner {
    transport: SharedTransport,
    options: LoaderOptions,
    cache: Mutex<LruCache<String, Arc<ModuleRecord>>>,
    in_flight: Mutex<HashMap<String, SharedLoad>>,
}

/// Module loader with an LRU namespace cache and in-flight deduplication.
pub struct ModuleLoader {
    inner: Arc<LoaderInner>,
}

impl ModuleLoader {
    pub fn new(transport: SharedTransport, options: LoaderOptions) -> Self {
        let capacity = NonZeroUsize::new(options.cache_capacity.max(1)).expect("nonzero");
        Self {
            inner: Arc::new(LoaderInner {
                transport,
                options,
                cache: Mutex::new(LruCache::new(capacity)),
                in_flight: Mutex::new(HashMap::new()),
            }),
        }
    }

    /// Load a resolved module, deduplicating concurrent requests per URL.
    pub async fn load(&self, resolution: &Resolution) -> Result<Arc<ModuleRecord>> {
        let url = resolution.url.clone();
        if !self.inner.options.policy.permits(&url) {
            return Err(RenderifyError::Other(NETWORK_POLICY_BLOCKED_MESSAGE.into()));
        }

        // Inline data URLs never touch the network.
        if url.starts_with("data:") {
            return Ok(Arc::new(ModuleRecord {
                specifier: resolution.specifier.clone(),
                requested_url: url.clone(),
                fetched_url: url.clone(),
                import_url: url,
                content_type: ModuleContentType::JavaScript,
                used_fallback: false,
                size: 0,
            }));
        }

        if let Some(hit) = self.inner.cache.lock().get(&url).cloned() {
            return Ok(hit);
        }

        let load = {
            let mut in_flight = self.inner.in_flight.lock();
            if let Some(existing) = in_flight.get(&url) {
                existing.clone()
            } else {
                let inner = Arc::clone(&self.inner);
                let resolution = resolution.clone();
                let key = url.clone();
                let fut: SharedLoad = async move {
                    let outcome = fetch_and_materialize(&inner, &resolution).await;
                    inner.in_flight.lock().remove(&key);
                    match outcome {
                        Ok(record) => {
                            let record = Arc::new(record);
                            inner.cache.lock().put(key, Arc::clone(&record));
                            Ok(record)
                        }
                        Err(e) => Err(Arc::new(e)),
                    }
                }
                .boxed()
                .shared();
                in_flight.insert(url, fut.clone());
                fut
            }
        };

        load.await.map_err(|e| clone_error(&e))
    }

    /// Cached record for a URL, if present. Promotes the entry to MRU.
    pub fn cached(&self, url: &str) -> Option<Arc<ModuleRecord>> {
        self.inner.cache.lock().get(url).cloned()
    }

    /// Lifecycle teardown: drop the cache and any in-flight bookkeeping.
    pub fn terminate(&self) {
        self.inner.cache.lock().clear();
        self.inner.in_flight.lock().clear();
    }
}

/// Reconstruct an owned error from a shared one. `reqwest::Error` is not
/// cloneable, so transport errors come back as their message.
fn clone_error(err: &RenderifyError) -> RenderifyError {
    match err {
        RenderifyError::Http {
            status,
            body,
            retry_after,
        } => RenderifyError::Http {
            status: *status,
            body: body.clone(),
            retry_after: *retry_after,
        },
        RenderifyError::IntegrityMismatch { message } => RenderifyError::IntegrityMismatch {
            message: message.clone(),
        },
        RenderifyError::IntegrityCheckFailed { message } => {
            RenderifyError::IntegrityCheckFailed {
                message: message.clone(),
            }
        }
        RenderifyError::Aborted { message } => RenderifyError::Aborted {
            message: message.clone(),
        },
        RenderifyError::TimedOut { message } => RenderifyError::TimedOut {
            message: message.clone(),
        },
        RenderifyError::Network(message) => RenderifyError::Network(message.clone()),
        other => RenderifyError::Other(other.to_string()),
    }
}

async fn fetch_and_materialize(
    inner: &LoaderInner,
    resolution: &Resolution,
) -> Result<ModuleRecord> {
    let (bytes, content_type_header, fetched_url, used_fallback) =
        fetch_with_hedging(inner, &resolution.url).await?;

    if let Some(integrity) = &resolution.integrity {
        verify_integrity(integrity, &bytes, &resolution.url)?;
    }

    let content_type = detect_content_type(content_type_header.as_deref(), &fetched_url);
    let source = String::from_utf8_lossy(&bytes);
    let import_url = materialize(content_type, &source);
    debug!(
        url = %resolution.url,
        ?content_type,
        size = bytes.len(),
        used_fallback,
        "module materialized"
    );

    Ok(ModuleRecord {
        specifier: resolution.specifier.clone(),
        requested_url: resolution.url.clone(),
        fetched_url,
        import_url,
        content_type,
        used_fallback,
        size: bytes.len(),
    })
}

/// Fetch the primary URL; when fallback CDNs are configured, hedge with a
/// delayed second request and let the first success win. The loser is
/// dropped, which aborts its connection.
async fn fetch_with_hedging(
    inner: &LoaderInner,
    primary_url: &str,
) -> Result<(Bytes, Option<String>, String, bool)> {
    let fallbacks: Vec<String> = inner
        .options
        .fallback_cdn_urls
        .iter()
        .filter_map(|base| rewrite_to_fallback(primary_url, base))
        .filter(|url| inner.options.policy.permits(url))
        .collect();

    let primary = fetch_with_retries(inner, primary_url.to_string());
    if fallbacks.is_empty() {
        let (bytes, content_type) = primary.await?;
        return Ok((bytes, content_type, primary_url.to_string(), false));
    }

    let hedge_delay = Duration::from_millis(inner.options.hedge_delay_ms);
    let hedge = async {
        tokio::time::sleep(hedge_delay).await;
        let mut last_err: Option<RenderifyError> = None;
        for url in &fallbacks {
            match fetch_with_retries(inner, url.clone()).await {
                Ok((bytes, content_type)) => return Ok((bytes, content_type, url.clone())),
                Err(e) => {
                    warn!(url = %url, error = %e, "fallback CDN fetch failed");
                    last_err = Some(e);
                }
            }
        }
        Err(last_err.unwrap_or_else(|| RenderifyError::Other("no fallback CDN".into())))
    };

    let mut primary = Box::pin(primary);
    let mut hedge = Box::pin(hedge);
    tokio::select! {
        first = &mut primary => match first {
            Ok((bytes, content_type)) => Ok((bytes, content_type, primary_url.to_string(), false)),
            Err(primary_err) => match hedge.await {
                Ok((bytes, content_type, url)) => Ok((bytes, content_type, url, true)),
                Err(_) => Err(primary_err),
            },
        },
        first = &mut hedge => match first {
            Ok((bytes, content_type, url)) => Ok((bytes, content_type, url, true)),
            Err(_) => {
                let (bytes, content_type) = primary.await?;
                Ok((bytes, content_type, primary_url.to_string(), false))
            }
        },
    }
}

/// One URL, bounded timeout per attempt, small retry count.
async fn fetch_with_retries(
    inner: &LoaderInner,
    url: String,
) -> Result<(Bytes, Option<String>)> {
    let mut last_err: Option<RenderifyError> = None;
    for attempt in 0..=inner.options.fetch_retries {
        if attempt > 0 {
            tokio::time::sleep(Duration::from_millis(100 * attempt as u64)).await;
        }
        let scope = TimeoutScope::new(
            format!("module fetch {url}"),
            Duration::from_millis(inner.options.fetch_timeout_ms),
            None,
        );
        let attempt_result = scope
            .guard(async {
                let response = inner.transport.send(HttpRequest::get(&url)).await?;
                if !response.ok() {
                    let status = response.status;
                    let body = response.text().await.unwrap_or_default();
                    return Err(RenderifyError::Http {
                        status,
                        body,
                        retry_after: None,
                    });
                }
                let content_type = response.header("content-type").map(str::to_string);
                let bytes = response.bytes().await?;
                Ok((bytes, content_type))
            })
            .await;
        scope.release();
        match attempt_result {
            Ok(ok) => return Ok(ok),
            Err(e) => last_err = Some(e),
        }
    }
    Err(last_err.unwrap_or_else(|| RenderifyError::Other(format!("fetch failed: {url}"))))
}

/// Graft the primary URL's path onto a fallback CDN base.
fn rewrite_to_fallback(primary_url: &str, fallback_base: &str) -> Option<String> {
    let parsed = reqwest::Url::parse(primary_url).ok()?;
    let mut path = parsed.path().to_string();
    if let Some(query) = parsed.query() {
        path.push('?');
        path.push_str(query);
    }
    Some(format!(
        "{}{}",
        fallback_base.trim_end_matches('/'),
        path
    ))
}

/// Verify a `sha{256,384,512}-{base64}` integrity value in constant time.
pub fn verify_integrity(integrity: &str, bytes: &[u8], url: &str) -> Result<()> {
    let (algorithm, expected_b64) = integrity.split_once('-').ok_or_else(|| {
        RenderifyError::IntegrityCheckFailed {
            message: format!("malformed integrity value \"{integrity}\" for {url}"),
        }
    })?;
    let expected = BASE64.decode(expected_b64.trim()).map_err(|e| {
        RenderifyError::IntegrityCheckFailed {
            message: format!("undecodable integrity value for {url}: {e}"),
        }
    })?;
    let actual: Vec<u8> = match algorithm {
        "sha256" => Sha256::digest(bytes).to_vec(),
        "sha384" => Sha384::digest(bytes).to_vec(),
        "sha512" => Sha512::digest(bytes).to_vec(),
        other => {
            return Err(RenderifyError::IntegrityCheckFailed {
                message: format!("unsupported integrity algorithm \"{other}\" for {url}"),
            })
        }
    };
    if !constant_time_eq(&expected, &actual) {
        return Err(RenderifyError::IntegrityMismatch {
            message: format!("integrity mismatch for {url}"),
        });
    }
    Ok(())
}

fn constant_time_eq(a: &[u8], b: &[u8]) -> bool {
    if a.len() != b.len() {
        return false;
    }
    let mut diff = 0u8;
    for (x, y) in a.iter().zip(b.iter()) {
        diff |= x ^ y;
    }
    diff == 0
}

/// Pick a content type from the header, falling back to the URL extension.
fn detect_content_type(header: Option<&str>, url: &str) -> ModuleContentType {
    if let Some(header) = header {
        let mime = header.split(';').next().unwrap_or("").trim().to_ascii_lowercase();
        match mime.as_str() {
            "text/css" => return ModuleContentType::Css,
            "application/json" => return ModuleContentType::Json,
            "application/javascript" | "text/javascript" | "application/x-javascript"
            | "module/javascript" => return ModuleContentType::JavaScript,
            _ => {}
        }
    }
    let path = url.split(['?', '#']).next().unwrap_or(url);
    if path.ends_with(".css") {
        ModuleContentType::Css
    } else if path.ends_with(".json") {
        ModuleContentType::Json
    } else {
        ModuleContentType::JavaScript
    }
}

/// Re-emit a body as an importable `data:text/javascript` URL.
pub fn materialize(content_type: ModuleContentType, source: &str) -> String {
    let module_source = match content_type {
        ModuleContentType::JavaScript => strip_source_maps(source),
        ModuleContentType::Css => css_proxy(source),
        ModuleContentType::Json => format!("const __json = {source};\nexport default __json;\n"),
    };
    format!(
        "data:text/javascript;base64,{}",
        BASE64.encode(module_source.as_bytes())
    )
}

/// Drop `sourceMappingURL` directives so the data URL does not point at a
/// dangling map.
fn strip_source_maps(source: &str) -> String {
    source
        .lines()
        .filter(|line| {
            let trimmed = line.trim_start();
            !(trimmed.starts_with("//# sourceMappingURL=")
                || trimmed.starts_with("//@ sourceMappingURL="))
        })
        .collect::<Vec<_>>()
        .join("\n")
}

/// Wrap CSS into an ESM proxy that injects a `<style>` element on import and
/// exports the text.
fn css_proxy(css: &str) -> String {
    let encoded = serde_json::to_string(css).unwrap_or_else(|_| "\"\"".to_string());
    format!(
        "const __css = {encoded};\n\
         if (typeof document !== \"undefined\") {{\n\
           const style = document.createElement(\"style\");\n\
           style.textContent = __css;\n\
           document.head.appendChild(style);\n\
         }}\n\
         export default __css;\n"
    )
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::http::stub::{StubReply, StubTransport};
    use crate::runtime::resolver::ResolutionSource;

    fn resolution(url: &str) -> Resolution {
        Resolution {
            specifier: "pkg".to_string(),
            url: url.to_string(),
            integrity: None,
            source: ResolutionSource::Manifest,
        }
    }

    fn open_options() -> LoaderOptions {
        LoaderOptions {
            policy: NetworkPolicy::allow_all(),
            fetch_retries: 0,
            hedge_delay_ms: 10,
            ..LoaderOptions::default()
        }
    }

    fn decode_data_url(url: &str) -> String {
        let b64 = url.split("base64,").nth(1).unwrap();
        String::from_utf8(BASE64.decode(b64).unwrap()).unwrap()
    }

    #[tokio::test]
    async fn concurrent_loads_fetch_once() {
        let stub = StubTransport::scripted(vec![StubReply::text(200, "export default 1;")]);
        let loader = ModuleLoader::new(Arc::clone(&stub) as _, open_options());
        let target = resolution("https://cdn.example/pkg@1.0.0/index.js");

        let (a, b) = tokio::join!(loader.load(&target), loader.load(&target));
        let a = a.unwrap();
        let b = b.unwrap();
        assert!(Arc::ptr_eq(&a, &b));
        assert_eq!(stub.count_for("https://cdn.example/pkg@1.0.0/index.js"), 1);

        // A later load hits the cache, still one fetch.
        loader.load(&target).await.unwrap();
        assert_eq!(stub.count_for("https://cdn.example/pkg@1.0.0/index.js"), 1);
    }

    #[tokio::test]
    async fn integrity_mismatch_blocks_module() {
        let stub = StubTransport::scripted(vec![StubReply::text(200, "export default 1;")]);
        let loader = ModuleLoader::new(stub, open_options());
        let mut target = resolution("https://cdn.example/pkg@1.0.0/index.js");
        target.integrity = Some("sha384-AAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAAA".into());

        let err = loader.load(&target).await.unwrap_err();
        assert!(matches!(err, RenderifyError::IntegrityMismatch { .. }));
        assert!(loader.cached(&target.url).is_none());
    }

    #[tokio::test]
    async fn integrity_match_accepts_module() {
        let body = "export default 42;";
        let digest = Sha256::digest(body.as_bytes());
        let integrity = format!("sha256-{}", BASE64.encode(digest));

        let stub = StubTransport::scripted(vec![StubReply::text(200, body)]);
        let loader = ModuleLoader::new(stub, open_options());
        let mut target = resolution("https://cdn.example/pkg@1.0.0/index.js");
        target.integrity = Some(integrity);

        let record = loader.load(&target).await.unwrap();
        assert_eq!(record.size, body.len());
    }

    #[test]
    fn malformed_integrity_is_check_failure() {
        let err = verify_integrity("notahash", b"x", "https://u").unwrap_err();
        assert!(matches!(err, RenderifyError::IntegrityCheckFailed { .. }));
        let err = verify_integrity("md5-AAAA", b"x", "https://u").unwrap_err();
        assert!(matches!(err, RenderifyError::IntegrityCheckFailed { .. }));
    }

    #[tokio::test]
    async fn policy_blocked_urls_are_not_fetched() {
        let stub = StubTransport::scripted(vec![]);
        let options = LoaderOptions {
            policy: NetworkPolicy::allow_hosts(vec!["allowed.example".into()]),
            ..LoaderOptions::default()
        };
        let loader = ModuleLoader::new(Arc::clone(&stub) as _, options);
        let err = loader
            .load(&resolution("https://blocked.example/mod.js"))
            .await
            .unwrap_err();
        assert_eq!(err.to_string(), NETWORK_POLICY_BLOCKED_MESSAGE);
        assert!(stub.requests().is_empty());
    }

    #[tokio::test]
    async fn hedged_fallback_wins_when_primary_fails() {
        let stub = StubTransport::scripted(vec![
            StubReply::network_error("primary down"),
            StubReply::text(200, "export default 1;"),
        ]);
        let options = LoaderOptions {
            policy: NetworkPolicy::allow_all(),
            fallback_cdn_urls: vec!["https://mirror.example".into()],
            fetch_retries: 0,
            hedge_delay_ms: 1,
            ..LoaderOptions::default()
        };
        let loader = ModuleLoader::new(Arc::clone(&stub) as _, options);
        let record = loader
            .load(&resolution("https://cdn.example/pkg@1.0.0/index.js"))
            .await
            .unwrap();
        assert!(record.used_fallback);
        assert_eq!(record.fetched_url, "https://mirror.example/pkg@1.0.0/index.js");
    }

    #[tokio::test]
    async fn data_urls_pass_through() {
        let stub = StubTransport::scripted(vec![]);
        let loader = ModuleLoader::new(Arc::clone(&stub) as _, open_options());
        let url = "data:text/javascript;base64,ZXhwb3J0IGRlZmF1bHQgMTs=";
        let record = loader.load(&resolution(url)).await.unwrap();
        assert_eq!(record.import_url, url);
        assert!(stub.requests().is_empty());
    }

    #[test]
    fn materialize_js_strips_source_maps() {
        let source = "export default 1;\n//# sourceMappingURL=mod.js.map\n";
        let url = materialize(ModuleContentType::JavaScript, source);
        let decoded = decode_data_url(&url);
        assert!(decoded.contains("export default 1;"));
        assert!(!decoded.contains("sourceMappingURL"));
    }

    #[test]
    fn materialize_css_builds_style_proxy() {
        let url = materialize(ModuleContentType::Css, ".a { color: red }");
        let decoded = decode_data_url(&url);
        assert!(decoded.contains("document.createElement(\"style\")"));
        assert!(decoded.contains("export default __css;"));
        assert!(decoded.contains(".a { color: red }"));
    }

    #[test]
    fn materialize_json_exports_value() {
        let url = materialize(ModuleContentType::Json, "{\"a\": 1}");
        let decoded = decode_data_url(&url);
        assert_eq!(
            decoded,
            "const __json = {\"a\": 1};\nexport default __json;\n"
        );
    }

    #[test]
    fn content_type_detection() {
        assert_eq!(
            detect_content_type(Some("text/css; charset=utf-8"), "https://u/x"),
            ModuleContentType::Css
        );
        assert_eq!(
            detect_content_type(None, "https://u/styles.css?v=1"),
            ModuleContentType::Css
        );
        assert_eq!(
            detect_content_type(Some("application/json"), "https://u/x"),
            ModuleContentType::Json
        );
        assert_eq!(
            detect_content_type(Some("text/plain"), "https://u/mod.js"),
            ModuleContentType::JavaScript
        );
    }

    #[tokio::test]
    async fn terminate_clears_cache() {
        let stub = StubTransport::scripted(vec![
            StubReply::text(200, "export default 1;"),
            StubReply::text(200, "export default 2;"),
        ]);
        let loader = ModuleLoader::new(Arc::clone(&stub) as _, open_options());
        let target = resolution("https://cdn.example/pkg@1.0.0/index.js");
        loader.load(&target).await.unwrap();
        loader.terminate();
        assert!(loader.cached(&target.url).is_none());
        loader.load(&target).await.unwrap();
        assert_eq!(stub.count_for(&target.url), 2);
    }
}
