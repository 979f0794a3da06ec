//! Source transpilation: JS/TS/JSX/TSX into plain ESM.
//!
//! `js` passes through unchanged; `ts`/`tsx` run the TypeScript-stripping
//! pass; `jsx`/`tsx` run the JSX pass, in preact automatic mode when the
//! source targets the preact runtime, classic factory mode otherwise.
//! Results are cached under an LRU keyed by language, runtime, filename, and
//! the full source.

mod jsx;
mod lexer;
mod typescript;

use std::num::NonZeroUsize;
use std::sync::Arc;

use lru::LruCache;
use parking_lot::Mutex;
use tracing::debug;

pub use jsx::{JsxMode, CLASSIC_FACTORY, CLASSIC_FRAGMENT, CLASSIC_PRELUDE};
pub use typescript::strip_types;

use crate::error::Result;
use crate::plan::{SourceModule, SourceRuntime};

/// Default transpile-cache capacity.
pub const DEFAULT_CACHE_CAPACITY: usize = 256;

/// A pluggable transpiler engine.
///
/// The built-in passes are the primary engine; a secondary engine may be
/// configured as a fallback, consulted only outside browser runtimes.
pub trait Transpile: Send + Sync {
    fn transpile(&self, source: &SourceModule) -> Result<String>;
}

/// Caching transpiler front end.
pub struct SourceTranspiler {
    cache: Mutex<LruCache<String, String>>,
    fallback: Option<Arc<dyn Transpile>>,
    in_browser: bool,
}

impl SourceTranspiler {
    pub fn new(cache_capacity: usize) -> Self {
        Self {
            cache: Mutex::new(LruCache::new(
                NonZeroUsize::new(cache_capacity.max(1)).expect("nonzero"),
            )),
            fallback: None,
            in_browser: false,
        }
    }

    /// Configure a fallback engine, consulted when the primary pass fails
    /// and the host is not a browser runtime.
    pub fn with_fallback(mut self, fallback: Arc<dyn Transpile>, in_browser: bool) -> Self {
        self.fallback = Some(fallback);
        self.in_browser = in_browser;
        self
    }

    /// Transpile a source module, consulting the cache first. Hits are
    /// promoted to most-recently-used.
    pub fn transpile(&self, source: &SourceModule) -> Result<String> {
        let key = cache_key(source);
        if let Some(hit) = self.cache.lock().get(&key).cloned() {
            return Ok(hit);
        }

        let result = match transpile_once(source) {
            Ok(output) => Ok(output),
            Err(primary_err) => match (&self.fallback, self.in_browser) {
                (Some(fallback), false) => {
                    debug!(error = %primary_err, "primary transpile failed, using fallback engine");
                    fallback.transpile(source)
                }
                _ => Err(primary_err),
            },
        }?;

        self.cache.lock().put(key, result.clone());
        Ok(result)
    }
}

impl Default for SourceTranspiler {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_CAPACITY)
    }
}

fn cache_key(source: &SourceModule) -> String {
    format!(
        "{}|{}|{}|{}",
        source.language.as_str(),
        match source.runtime {
            Some(SourceRuntime::Preact) => "preact",
            _ => "renderify",
        },
        source.filename.as_deref().unwrap_or(""),
        source.code
    )
}

/// One uncached transpile.
fn transpile_once(source: &SourceModule) -> Result<String> {
    let mut code = source.code.clone();
    if source.language.is_typescript() {
        code = strip_types(&code)?;
    }
    if source.language.is_jsx() {
        let mode = match source.runtime {
            Some(SourceRuntime::Preact) => JsxMode::Automatic {
                import_source: "preact".to_string(),
            },
            _ => JsxMode::Classic,
        };
        let (transformed, _found) = jsx::transform_jsx(&code, &mode)?;
        code = transformed;
    }
    Ok(code)
}

/// Collect import specifiers from ESM source, in declaration order:
/// `import ... from "x"`, side-effect `import "x"`, `export ... from "x"`,
/// and dynamic `import("x")` with a literal argument.
pub fn collect_import_specifiers(source: &str) -> Vec<String> {
    let src = source.as_bytes();
    let mut specifiers = Vec::new();
    let mut i = 0;
    let mut last_sig: Option<u8> = None;

    while i < src.len() {
        if let Some(next) = lexer::skip_opaque(src, i) {
            if src[i] != b'/' {
                last_sig = Some(b'"');
            }
            i = next;
            continue;
        }
        let b = src[i];
        if b.is_ascii_whitespace() {
            i += 1;
            continue;
        }
        if lexer::is_ident_start(b) {
            let end = lexer::read_ident(src, i);
            let word = &source[i..end];
            let statement_position =
                matches!(last_sig, None | Some(b';') | Some(b'{') | Some(b'}') | Some(b')'));
            if word == "import" {
                let mut pos = skip_ws(src, end);
                if src.get(pos) == Some(&b'(') {
                    // Dynamic import with a literal argument.
                    pos = skip_ws(src, pos + 1);
                    if let Some(spec) = read_string_literal(source, src, pos) {
                        specifiers.push(spec);
                    }
                } else if statement_position {
                    if let Some(spec) = statement_specifier(source, src, pos) {
                        specifiers.push(spec);
                    }
                }
            } else if word == "export" && statement_position {
                let pos = skip_ws(src, end);
                if let Some(spec) = statement_specifier(source, src, pos) {
                    specifiers.push(spec);
                }
            }
            last_sig = Some(src[end - 1]);
            i = end;
            continue;
        }
        last_sig = Some(b);
        i += 1;
    }
    specifiers
}

fn skip_ws(src: &[u8], mut pos: usize) -> usize {
    while pos < src.len() && src[pos].is_ascii_whitespace() {
        pos += 1;
    }
    pos
}

fn read_string_literal(text: &str, src: &[u8], pos: usize) -> Option<String> {
    match src.get(pos) {
        Some(b'"') | Some(b'\'') => {
            let end = lexer::skip_string(src, pos);
            if end > pos + 1 {
                Some(text[pos + 1..end - 1].to_string())
            } else {
                None
            }
        }
        _ => None,
    }
}

/// Scan one import/export statement for its source string: either an
/// immediate literal (`import "x"`) or the literal after `from`.
fn statement_specifier(text: &str, src: &[u8], start: usize) -> Option<String> {
    if let Some(spec) = read_string_literal(text, src, start) {
        return Some(spec);
    }
    let mut i = start;
    while i < src.len() {
        if let Some(next) = lexer::skip_opaque(src, i) {
            i = next;
            continue;
        }
        match src[i] {
            b';' | b'\n' => return None,
            b if lexer::is_ident_start(b) => {
                let end = lexer::read_ident(src, i);
                if &text[i..end] == "from" {
                    let pos = skip_ws(src, end);
                    return read_string_literal(text, src, pos);
                }
                i = end;
            }
            b'{' => {
                i = lexer::skip_balanced(src, i)?;
            }
            _ => i += 1,
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::SourceLanguage;

    fn module(code: &str, language: SourceLanguage, runtime: Option<SourceRuntime>) -> SourceModule {
        SourceModule {
            code: code.to_string(),
            language,
            filename: Some("widget.tsx".to_string()),
            runtime,
        }
    }

    #[test]
    fn js_passes_through_unchanged() {
        let transpiler = SourceTranspiler::default();
        let source = module("export default () => 1;", SourceLanguage::Js, None);
        assert_eq!(transpiler.transpile(&source).unwrap(), source.code);
    }

    #[test]
    fn ts_strips_types() {
        let transpiler = SourceTranspiler::default();
        let source = module(
            "const n: number = 1;\nexport default n;",
            SourceLanguage::Ts,
            None,
        );
        let out = transpiler.transpile(&source).unwrap();
        assert!(!out.contains(": number"));
        assert!(out.contains("export default n;"));
    }

    #[test]
    fn tsx_strips_types_and_rewrites_jsx() {
        let transpiler = SourceTranspiler::default();
        let source = module(
            "export default function Widget(props: { label: string }) { return <div>{props.label}</div>; }",
            SourceLanguage::Tsx,
            None,
        );
        let out = transpiler.transpile(&source).unwrap();
        assert!(out.contains(CLASSIC_FACTORY));
        assert!(out.contains(CLASSIC_PRELUDE.lines().next().unwrap()));
        assert!(!out.contains("label: string"));
    }

    #[test]
    fn preact_runtime_uses_automatic_jsx() {
        let transpiler = SourceTranspiler::default();
        let source = module(
            "export default () => <p>hi</p>;",
            SourceLanguage::Jsx,
            Some(SourceRuntime::Preact),
        );
        let out = transpiler.transpile(&source).unwrap();
        assert!(out.contains("from \"preact/jsx-runtime\""));
        assert!(!out.contains(CLASSIC_FACTORY));
    }

    #[test]
    fn cache_round_trip() {
        let transpiler = SourceTranspiler::new(2);
        let source = module("export default () => <p>hi</p>;", SourceLanguage::Jsx, None);
        let first = transpiler.transpile(&source).unwrap();
        let second = transpiler.transpile(&source).unwrap();
        assert_eq!(first, second);
    }

    #[test]
    fn import_specifiers_in_declaration_order() {
        let source = r#"
import { format } from "date-fns";
import "side-effect-pkg";
import Chart from 'chart.js';
export { helper } from "helper-pkg";
const lazy = import("lazy-pkg");
const noise = "import fake from \"not-an-import\"";
"#;
        assert_eq!(
            collect_import_specifiers(source),
            vec![
                "date-fns".to_string(),
                "side-effect-pkg".to_string(),
                "chart.js".to_string(),
                "helper-pkg".to_string(),
                "lazy-pkg".to_string(),
            ]
        );
    }

    #[test]
    fn export_without_from_is_not_an_import() {
        let source = "export const a = 1;\nexport default a;";
        assert!(collect_import_specifiers(source).is_empty());
    }
}
