//! JSX transformation pass.
//!
//! Recursive-descent rewrite of JSX elements into call expressions. Two
//! emit modes:
//!
//! - **classic** — `__renderify_runtime_h(tag, props, ...children)` with
//!   `__renderify_runtime_fragment` for fragments; a helper prelude defining
//!   both is merged into the output.
//! - **automatic** — `_jsx` / `_jsxs` / `_Fragment` calls with an import from
//!   `{importSource}/jsx-runtime` (used for the preact runtime).

use super::lexer::{is_ident_part, is_ident_start, read_ident, skip_opaque};
use crate::error::{RenderifyError, Result};

/// Classic-mode factory identifier.
pub const CLASSIC_FACTORY: &str = "__renderify_runtime_h";
/// Classic-mode fragment identifier.
pub const CLASSIC_FRAGMENT: &str = "__renderify_runtime_fragment";

/// How JSX is emitted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum JsxMode {
    /// Factory calls plus the merged helper prelude.
    Classic,
    /// Automatic runtime with an import from `{import_source}/jsx-runtime`.
    Automatic { import_source: String },
}

/// Helper prelude merged into classic-mode output. The helpers coerce
/// arbitrary JSX results into the runtime's tagged node shape.
pub const CLASSIC_PRELUDE: &str = r##"const __renderify_runtime_fragment = "#fragment";
function __renderify_runtime_text(value) {
  return { type: "text", value: String(value) };
}
function __renderify_runtime_normalize(child) {
  if (child === null || child === undefined || child === false || child === true) return [];
  if (Array.isArray(child)) return child.flatMap(__renderify_runtime_normalize);
  if (typeof child === "object" && typeof child.type === "string") return [child];
  return [__renderify_runtime_text(child)];
}
function __renderify_runtime_h(tag, props, ...children) {
  const normalized = children.flatMap(__renderify_runtime_normalize);
  if (typeof tag === "function") {
    const result = tag({ ...(props || {}), children: normalized });
    const resolved = __renderify_runtime_normalize(result);
    if (resolved.length === 1) return resolved[0];
    return { type: "element", tag: "div", children: resolved };
  }
  if (tag === __renderify_runtime_fragment) {
    if (normalized.length === 1) return normalized[0];
    return { type: "element", tag: "div", children: normalized };
  }
  const node = { type: "element", tag: String(tag), children: normalized };
  if (props && Object.keys(props).length > 0) node.props = props;
  return node;
}
"##;

/// Transform all JSX in `source`. Returns the rewritten source and whether
/// any JSX was found (callers skip prelude/import merging when none was).
pub fn transform_jsx(source: &str, mode: &JsxMode) -> Result<(String, bool)> {
    let mut transformer = JsxTransformer {
        src: source.as_bytes(),
        text: source,
        mode,
        found: false,
    };
    let body = transformer.transform_region(0, source.len())?;
    let found = transformer.found;
    if !found {
        return Ok((body, false));
    }
    let output = match mode {
        JsxMode::Classic => {
            if source.contains(CLASSIC_FACTORY) {
                body
            } else {
                format!("{CLASSIC_PRELUDE}\n{body}")
            }
        }
        JsxMode::Automatic { import_source } => format!(
            "import {{ Fragment as _Fragment, jsx as _jsx, jsxs as _jsxs }} from \"{import_source}/jsx-runtime\";\n{body}"
        ),
    };
    Ok((output, true))
}

struct JsxTransformer<'a> {
    src: &'a [u8],
    text: &'a str,
    mode: &'a JsxMode,
    found: bool,
}

#[derive(Debug)]
enum JsxAttr {
    Named { name: String, value: Option<String> },
    Spread(String),
}

impl<'a> JsxTransformer<'a> {
    /// Transform a code region, rewriting each JSX element found in
    /// expression position.
    fn transform_region(&mut self, start: usize, end: usize) -> Result<String> {
        let mut out = String::with_capacity(end - start);
        let mut i = start;
        // Last significant byte and identifier, for expression-position
        // detection.
        let mut last_sig: Option<u8> = None;
        let mut last_word = String::new();

        while i < end {
            let b = self.src[i];
            if let Some(next) = skip_opaque(self.src, i) {
                let next = next.min(end);
                out.push_str(&self.text[i..next]);
                if b != b'/' {
                    last_sig = Some(b'"');
                    last_word.clear();
                }
                i = next;
                continue;
            }
            if b.is_ascii_whitespace() {
                out.push(b as char);
                i += 1;
                continue;
            }
            if b == b'=' && self.src.get(i + 1) == Some(&b'>') {
                // Arrow: what follows is expression position, not a
                // comparison operand.
                out.push_str("=>");
                last_sig = Some(b'=');
                last_word.clear();
                i += 2;
                continue;
            }
            if b == b'<' && self.jsx_starts_here(i, last_sig, &last_word) {
                let (call, next) = self.parse_element(i)?;
                out.push_str(&call);
                self.found = true;
                last_sig = Some(b')');
                last_word.clear();
                i = next;
                continue;
            }
            if is_ident_start(b) {
                let word_end = read_ident(self.src, i).min(end);
                out.push_str(&self.text[i..word_end]);
                last_word = self.text[i..word_end].to_string();
                last_sig = Some(self.src[word_end - 1]);
                i = word_end;
                continue;
            }
            out.push(b as char);
            last_sig = Some(b);
            last_word.clear();
            i += 1;
        }
        Ok(out)
    }

    /// Expression-position heuristic: `<` opens JSX when what precedes it
    /// cannot end a value, and what follows looks like a tag.
    fn jsx_starts_here(&self, i: usize, last_sig: Option<u8>, last_word: &str) -> bool {
        let next = match self.src.get(i + 1) {
            Some(b) => *b,
            None => return false,
        };
        if !(is_ident_start(next) || next == b'>') {
            return false;
        }
        const EXPR_KEYWORDS: &[&str] = &[
            "return", "typeof", "case", "do", "else", "in", "instanceof", "new", "throw",
            "yield", "await", "void", "default",
        ];
        match last_sig {
            None => true,
            Some(b) if is_ident_part(b) => EXPR_KEYWORDS.contains(&last_word),
            Some(b')') | Some(b']') | Some(b'"') => false,
            Some(b'>') => false,
            _ => true,
        }
    }

    /// Parse one element or fragment starting at `<`. Returns the emitted
    /// call expression and the position after the element.
    fn parse_element(&mut self, start: usize) -> Result<(String, usize)> {
        let mut i = start + 1;

        // Fragment: <> ... </>
        if self.src.get(i) == Some(&b'>') {
            let (children, next) = self.parse_children(i + 1, None)?;
            return Ok((self.emit(None, Vec::new(), children), next));
        }

        let tag_end = self.read_tag_name(i)?;
        let tag = self.text[i..tag_end].to_string();
        i = tag_end;

        let mut attrs = Vec::new();
        loop {
            i = self.skip_ws(i);
            match self.src.get(i) {
                Some(b'/') if self.src.get(i + 1) == Some(&b'>') => {
                    return Ok((self.emit(Some(&tag), attrs, Vec::new()), i + 2));
                }
                Some(b'>') => {
                    let (children, next) = self.parse_children(i + 1, Some(&tag))?;
                    return Ok((self.emit(Some(&tag), attrs, children), next));
                }
                Some(b'{') => {
                    // {...spread}
                    let expr_end = self.find_matching_brace(i)?;
                    let inner = self.text[i + 1..expr_end - 1].trim();
                    let spread = inner.strip_prefix("...").ok_or_else(|| {
                        RenderifyError::Other("expected spread attribute".into())
                    })?;
                    let rewritten = self.transform_subexpression(spread)?;
                    attrs.push(JsxAttr::Spread(rewritten));
                    i = expr_end;
                }
                Some(b) if is_ident_start(*b) => {
                    let (attr, next) = self.parse_attr(i)?;
                    attrs.push(attr);
                    i = next;
                }
                Some(other) => {
                    return Err(RenderifyError::Other(format!(
                        "unexpected character '{}' in JSX tag <{tag}>",
                        *other as char
                    )))
                }
                None => {
                    return Err(RenderifyError::Other(format!(
                        "unterminated JSX tag <{tag}>"
                    )))
                }
            }
        }
    }

    fn parse_attr(&mut self, start: usize) -> Result<(JsxAttr, usize)> {
        let mut end = start;
        while end < self.src.len()
            && (is_ident_part(self.src[end]) || self.src[end] == b'-' || self.src[end] == b':')
        {
            end += 1;
        }
        let name = self.text[start..end].to_string();
        let mut i = self.skip_ws(end);
        if self.src.get(i) != Some(&b'=') {
            return Ok((JsxAttr::Named { name, value: None }, end));
        }
        i = self.skip_ws(i + 1);
        match self.src.get(i) {
            Some(b'"') | Some(b'\'') => {
                let string_end = super::lexer::skip_string(self.src, i);
                let raw = &self.text[i..string_end];
                Ok((
                    JsxAttr::Named {
                        name,
                        value: Some(raw.to_string()),
                    },
                    string_end,
                ))
            }
            Some(b'{') => {
                let expr_end = self.find_matching_brace(i)?;
                let inner = self.text[i + 1..expr_end - 1].trim();
                let rewritten = self.transform_subexpression(inner)?;
                Ok((
                    JsxAttr::Named {
                        name,
                        value: Some(rewritten),
                    },
                    expr_end,
                ))
            }
            _ => Err(RenderifyError::Other(format!(
                "missing value for JSX attribute \"{name}\""
            ))),
        }
    }

    /// Parse children until the matching close tag. `tag = None` means
    /// fragment (closed by `</>`).
    fn parse_children(
        &mut self,
        start: usize,
        tag: Option<&str>,
    ) -> Result<(Vec<String>, usize)> {
        let mut children = Vec::new();
        let mut text_run = String::new();
        let mut i = start;

        loop {
            match self.src.get(i) {
                None => {
                    return Err(RenderifyError::Other(format!(
                        "unterminated JSX children for <{}>",
                        tag.unwrap_or("")
                    )))
                }
                Some(b'<') if self.src.get(i + 1) == Some(&b'/') => {
                    flush_text(&mut children, &mut text_run);
                    let close_start = self.skip_ws(i + 2);
                    let close_end = if self.src.get(close_start) == Some(&b'>') {
                        close_start
                    } else {
                        self.read_tag_name(close_start)?
                    };
                    let close_name = &self.text[close_start..close_end];
                    let expected = tag.unwrap_or("");
                    if close_name != expected {
                        return Err(RenderifyError::Other(format!(
                            "mismatched JSX close tag: expected </{expected}>, found </{close_name}>"
                        )));
                    }
                    let after = self.skip_ws(close_end);
                    if self.src.get(after) != Some(&b'>') {
                        return Err(RenderifyError::Other(
                            "malformed JSX close tag".into(),
                        ));
                    }
                    return Ok((children, after + 1));
                }
                Some(b'<') => {
                    flush_text(&mut children, &mut text_run);
                    let (call, next) = self.parse_element(i)?;
                    children.push(call);
                    i = next;
                }
                Some(b'{') => {
                    flush_text(&mut children, &mut text_run);
                    let expr_end = self.find_matching_brace(i)?;
                    let inner = self.text[i + 1..expr_end - 1].trim();
                    // {/* comment */} children are dropped.
                    if !inner.is_empty() && !is_only_comment(inner) {
                        children.push(self.transform_subexpression(inner)?);
                    }
                    i = expr_end;
                }
                Some(_) => {
                    // Collect raw text up to the next '<' or '{'.
                    let ch_start = i;
                    while i < self.src.len() && self.src[i] != b'<' && self.src[i] != b'{' {
                        i += 1;
                    }
                    text_run.push_str(&self.text[ch_start..i]);
                }
            }
        }
    }

    /// JSX expressions may themselves contain JSX.
    fn transform_subexpression(&mut self, expr: &str) -> Result<String> {
        let mut inner = JsxTransformer {
            src: expr.as_bytes(),
            text: expr,
            mode: self.mode,
            found: false,
        };
        let out = inner.transform_region(0, expr.len())?;
        self.found |= inner.found;
        Ok(out)
    }

    fn emit(&self, tag: Option<&str>, attrs: Vec<JsxAttr>, children: Vec<String>) -> String {
        let tag_expr = match (tag, self.mode) {
            (None, JsxMode::Classic) => CLASSIC_FRAGMENT.to_string(),
            (None, JsxMode::Automatic { .. }) => "_Fragment".to_string(),
            (Some(name), _) => {
                let host_element = name
                    .chars()
                    .next()
                    .map(|c| c.is_ascii_lowercase())
                    .unwrap_or(false)
                    && !name.contains('.');
                if host_element {
                    format!("\"{name}\"")
                } else {
                    name.to_string()
                }
            }
        };

        let props = emit_props(&attrs);
        match self.mode {
            JsxMode::Classic => {
                let mut call = format!("{CLASSIC_FACTORY}({tag_expr}, {})", props.unwrap_or_else(|| "null".into()));
                for child in &children {
                    call.push_str(", ");
                    call.push_str(child);
                }
                call.push(')');
                call
            }
            JsxMode::Automatic { .. } => {
                let mut fields = Vec::new();
                if let Some(props) = props_fields(&attrs) {
                    fields.push(props);
                }
                match children.len() {
                    0 => {}
                    1 => fields.push(format!("children: {}", children[0])),
                    _ => fields.push(format!("children: [{}]", children.join(", "))),
                }
                let object = format!("{{ {} }}", fields.join(", "));
                let ctor = if children.len() > 1 { "_jsxs" } else { "_jsx" };
                format!("{ctor}({tag_expr}, {object})")
            }
        }
    }

    fn read_tag_name(&self, start: usize) -> Result<usize> {
        if start >= self.src.len() || !is_ident_start(self.src[start]) {
            return Err(RenderifyError::Other("malformed JSX tag name".into()));
        }
        let mut end = start;
        while end < self.src.len()
            && (is_ident_part(self.src[end]) || self.src[end] == b'.' || self.src[end] == b'-')
        {
            end += 1;
        }
        Ok(end)
    }

    fn skip_ws(&self, mut pos: usize) -> usize {
        while pos < self.src.len() && self.src[pos].is_ascii_whitespace() {
            pos += 1;
        }
        pos
    }

    /// Position after the brace matching the one at `start`, tracking
    /// strings, templates, and comments.
    fn find_matching_brace(&self, start: usize) -> Result<usize> {
        super::lexer::skip_balanced(self.src, start)
            .ok_or_else(|| RenderifyError::Other("unbalanced JSX expression".into()))
    }
}

/// Emit the props object, or `None` when there are no attributes.
fn emit_props(attrs: &[JsxAttr]) -> Option<String> {
    props_fields(attrs).map(|fields| format!("{{ {fields} }}"))
}

fn props_fields(attrs: &[JsxAttr]) -> Option<String> {
    if attrs.is_empty() {
        return None;
    }
    let parts: Vec<String> = attrs
        .iter()
        .map(|attr| match attr {
            JsxAttr::Named { name, value } => {
                let key = if name.chars().all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '$')
                {
                    name.clone()
                } else {
                    format!("\"{name}\"")
                };
                match value {
                    Some(value) => format!("{key}: {value}"),
                    None => format!("{key}: true"),
                }
            }
            JsxAttr::Spread(expr) => format!("...{expr}"),
        })
        .collect();
    Some(parts.join(", "))
}

fn flush_text(children: &mut Vec<String>, text_run: &mut String) {
    let collapsed = text_run.split_whitespace().collect::<Vec<_>>().join(" ");
    text_run.clear();
    if !collapsed.is_empty() {
        children.push(
            serde_json::to_string(&collapsed).unwrap_or_else(|_| "\"\"".to_string()),
        );
    }
}

fn is_only_comment(expr: &str) -> bool {
    let trimmed = expr.trim();
    (trimmed.starts_with("/*") && trimmed.ends_with("*/")) || trimmed.starts_with("//")
}

#[cfg(test)]
mod tests {
    use super::*;

    fn classic(source: &str) -> String {
        let (out, found) = transform_jsx(source, &JsxMode::Classic).unwrap();
        assert!(found, "expected JSX in: {source}");
        out
    }

    fn automatic(source: &str) -> String {
        let (out, found) = transform_jsx(
            source,
            &JsxMode::Automatic {
                import_source: "preact".to_string(),
            },
        )
        .unwrap();
        assert!(found);
        out
    }

    #[test]
    fn plain_source_passes_through() {
        let source = "const a = 1 < 2;\nexport default a;";
        let (out, found) = transform_jsx(source, &JsxMode::Classic).unwrap();
        assert!(!found);
        assert_eq!(out, source);
    }

    #[test]
    fn simple_element() {
        let out = classic("export default () => <div class=\"box\">hi</div>;");
        assert!(out.contains(
            "__renderify_runtime_h(\"div\", { class: \"box\" }, \"hi\")"
        ));
        assert!(out.starts_with(CLASSIC_PRELUDE));
    }

    #[test]
    fn self_closing_and_boolean_attrs() {
        let out = classic("const x = <input disabled />;");
        assert!(out.contains("__renderify_runtime_h(\"input\", { disabled: true })"));
    }

    #[test]
    fn expression_attributes_and_children() {
        let out = classic("const x = <li key={item.id}>{item.label}</li>;");
        assert!(out.contains(
            "__renderify_runtime_h(\"li\", { key: item.id }, item.label)"
        ));
    }

    #[test]
    fn spread_attributes() {
        let out = classic("const x = <div {...rest} id=\"a\" />;");
        assert!(out.contains("__renderify_runtime_h(\"div\", { ...rest, id: \"a\" })"));
    }

    #[test]
    fn nested_elements_and_text_collapse() {
        let out = classic("const x = <ul>\n  <li>one</li>\n  <li>two</li>\n</ul>;");
        assert!(out.contains(
            "__renderify_runtime_h(\"ul\", null, __renderify_runtime_h(\"li\", null, \"one\"), __renderify_runtime_h(\"li\", null, \"two\"))"
        ));
    }

    #[test]
    fn component_tags_stay_identifiers() {
        let out = classic("const x = <Layout.Header title=\"t\" />;");
        assert!(out.contains("__renderify_runtime_h(Layout.Header, { title: \"t\" })"));
    }

    #[test]
    fn fragments() {
        let out = classic("const x = <><span>a</span><span>b</span></>;");
        assert!(out.contains(&format!("__renderify_runtime_h({CLASSIC_FRAGMENT}, null")));
    }

    #[test]
    fn jsx_inside_expression_child() {
        let out = classic("const x = <div>{flag ? <b>yes</b> : \"no\"}</div>;");
        assert!(out.contains("flag ? __renderify_runtime_h(\"b\", null, \"yes\") : \"no\""));
    }

    #[test]
    fn comparison_operators_left_alone() {
        let source = "const small = a < b;\nconst shifted = bits << 2;";
        let (out, found) = transform_jsx(source, &JsxMode::Classic).unwrap();
        assert!(!found);
        assert_eq!(out, source);
    }

    #[test]
    fn automatic_mode_emits_jsx_runtime_calls() {
        let out = automatic("export default () => <div id=\"a\">hi</div>;");
        assert!(out.starts_with(
            "import { Fragment as _Fragment, jsx as _jsx, jsxs as _jsxs } from \"preact/jsx-runtime\";"
        ));
        assert!(out.contains("_jsx(\"div\", { id: \"a\", children: \"hi\" })"));
    }

    #[test]
    fn automatic_mode_uses_jsxs_for_many_children() {
        let out = automatic("const x = <ul><li>a</li><li>b</li></ul>;");
        assert!(out.contains("_jsxs(\"ul\", { children: ["));
        assert!(out.contains("_jsx(\"li\", { children: \"a\" })"));
    }

    #[test]
    fn comment_children_are_dropped() {
        let out = classic("const x = <div>{/* note */}text</div>;");
        assert!(out.contains("__renderify_runtime_h(\"div\", null, \"text\")"));
    }

    #[test]
    fn mismatched_close_tag_errors() {
        let err = transform_jsx("const x = <div>text</span>;", &JsxMode::Classic).unwrap_err();
        assert!(err.to_string().contains("mismatched JSX close tag"));
    }
}
