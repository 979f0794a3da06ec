//! TypeScript-stripping pass.
//!
//! Token-level removal of TypeScript syntax so the remaining source is plain
//! JavaScript: `interface` / `type` / `declare` declarations, type-only
//! imports and exports, parameter / return / variable / class-field
//! annotations, optional markers, `as` / `satisfies` casts, non-null `!`,
//! access modifiers, `implements` clauses, and generic argument lists.
//! Runtime-level TS constructs (`enum`, namespaces, decorators) are passed
//! through untouched.

use super::lexer::{
    is_ident_part, is_ident_start, read_ident, skip_balanced, skip_opaque,
};
use crate::error::{RenderifyError, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum CtxKind {
    Block,
    Class,
    ObjectLiteral,
    Paren,
    Bracket,
}

#[derive(Debug)]
struct CtxFrame {
    kind: CtxKind,
    ternary: u32,
}

struct Stripper<'a> {
    src: &'a [u8],
    text: &'a str,
    out: String,
    i: usize,
    /// Last significant (non-whitespace, non-comment) byte emitted.
    last_sig: Option<u8>,
    /// Last identifier emitted.
    last_word: String,
    ctx: Vec<CtxFrame>,
    in_decl: bool,
    in_import: bool,
    pending_class: bool,
}

/// Strip TypeScript syntax from `source`, returning plain JavaScript.
pub fn strip_types(source: &str) -> Result<String> {
    let mut stripper = Stripper {
        src: source.as_bytes(),
        text: source,
        out: String::with_capacity(source.len()),
        i: 0,
        last_sig: None,
        last_word: String::new(),
        ctx: vec![CtxFrame {
            kind: CtxKind::Block,
            ternary: 0,
        }],
        in_decl: false,
        in_import: false,
        pending_class: false,
    };
    stripper.run()?;
    Ok(stripper.out)
}

impl<'a> Stripper<'a> {
    fn run(&mut self) -> Result<()> {
        while self.i < self.src.len() {
            let b = self.src[self.i];

            if let Some(end) = skip_opaque(self.src, self.i) {
                let is_comment = b == b'/';
                self.emit_range(self.i, end);
                self.i = end;
                if !is_comment {
                    self.last_sig = Some(b'"');
                    self.last_word.clear();
                }
                continue;
            }

            if b.is_ascii_whitespace() {
                self.out.push(b as char);
                self.i += 1;
                continue;
            }

            if is_ident_start(b) {
                self.handle_word()?;
                continue;
            }

            self.handle_punct();
        }
        Ok(())
    }

    fn emit_range(&mut self, start: usize, end: usize) {
        self.out.push_str(&self.text[start..end]);
    }

    fn emit_word(&mut self, start: usize, end: usize) {
        self.emit_range(start, end);
        self.last_sig = Some(self.src[end - 1]);
        self.last_word = self.text[start..end].to_string();
        self.i = end;
    }

    fn top(&mut self) -> &mut CtxFrame {
        self.ctx.last_mut().expect("context stack never empty")
    }

    fn innermost_kind(&self) -> CtxKind {
        self.ctx.last().map(|f| f.kind).unwrap_or(CtxKind::Block)
    }

    fn statement_position(&self) -> bool {
        matches!(self.last_sig, None | Some(b';') | Some(b'{') | Some(b'}'))
    }

    fn skip_ws(&self, mut pos: usize) -> usize {
        while pos < self.src.len() && self.src[pos].is_ascii_whitespace() {
            pos += 1;
        }
        pos
    }

    fn peek_sig(&self, pos: usize) -> Option<u8> {
        let pos = self.skip_ws(pos);
        self.src.get(pos).copied()
    }

    fn peek_word(&self, pos: usize) -> (usize, usize) {
        let start = self.skip_ws(pos);
        if start < self.src.len() && is_ident_start(self.src[start]) {
            (start, read_ident(self.src, start))
        } else {
            (start, start)
        }
    }

    fn handle_word(&mut self) -> Result<()> {
        let start = self.i;
        let end = read_ident(self.src, start);
        let word = &self.text[start..end];

        if self.statement_position() {
            match word {
                "interface" => return self.strip_interface(end),
                "type" if self.looks_like_type_alias(end) => {
                    return self.strip_type_alias(end)
                }
                "declare" => return self.strip_declare(end),
                "export" => {
                    let (ws, we) = self.peek_word(end);
                    match &self.text[ws..we] {
                        "interface" => return self.strip_interface(read_ident(self.src, ws)),
                        "declare" => return self.strip_declare(read_ident(self.src, ws)),
                        "type" => {
                            // Covers both `export type X = ...` and
                            // `export type { A } from "x"`.
                            let alias_end = read_ident(self.src, ws);
                            if self.looks_like_type_alias(alias_end) {
                                return self.strip_type_alias(alias_end);
                            }
                            return self.strip_to_semicolon();
                        }
                        _ => {
                            // Only re-export forms behave like imports
                            // (protecting `as` inside their braces); a
                            // declaration export is stripped like any code.
                            let next = self.peek_sig(end);
                            if next == Some(b'{') || next == Some(b'*') {
                                self.in_import = true;
                            }
                            self.emit_word(start, end);
                            return Ok(());
                        }
                    }
                }
                "import" => {
                    if self.peek_sig(end) == Some(b'(') {
                        // Dynamic import expression.
                        self.emit_word(start, end);
                        return Ok(());
                    }
                    let (ws, we) = self.peek_word(end);
                    if &self.text[ws..we] == "type" {
                        return self.strip_to_semicolon();
                    }
                    self.in_import = true;
                    self.emit_word(start, end);
                    return Ok(());
                }
                _ => {}
            }
        }

        if !self.in_import {
            match word {
                "as" | "satisfies" if value_position(self.last_sig) => {
                    self.i = skip_type(
                        self.src,
                        self.skip_ws(end),
                        &[b',', b';', b')', b']', b'}', b':', b'?', b'='],
                        false,
                    );
                    return Ok(());
                }
                "implements" if self.pending_class => {
                    // Drop the clause; `{` opens the class body next.
                    let mut pos = self.skip_ws(end);
                    while pos < self.src.len() && self.src[pos] != b'{' {
                        if let Some(next) = skip_opaque(self.src, pos) {
                            pos = next;
                        } else {
                            pos += 1;
                        }
                    }
                    self.i = pos;
                    return Ok(());
                }
                "private" | "public" | "protected" | "readonly" | "abstract"
                    if self.modifier_position() =>
                {
                    let (ws, we) = self.peek_word(end);
                    if we > ws {
                        // Drop the modifier, keep what it modified.
                        self.i = ws;
                        return Ok(());
                    }
                }
                "class" => {
                    self.pending_class = true;
                }
                "let" | "const" | "var" => {
                    self.in_decl = true;
                }
                _ => {}
            }
        }

        self.emit_word(start, end);
        Ok(())
    }

    /// Whether a stripped access modifier is plausible here: constructor
    /// parameter position or a class-body statement.
    fn modifier_position(&self) -> bool {
        match self.innermost_kind() {
            CtxKind::Paren => matches!(self.last_sig, Some(b'(') | Some(b',')),
            CtxKind::Class => self.statement_position(),
            _ => false,
        }
    }

    fn looks_like_type_alias(&self, after_type: usize) -> bool {
        let (ws, we) = self.peek_word(after_type);
        if we == ws {
            return false;
        }
        let mut pos = self.skip_ws(we);
        if pos < self.src.len() && self.src[pos] == b'<' {
            match try_skip_type_args(self.src, pos) {
                Some(end) => pos = self.skip_ws(end),
                None => return false,
            }
        }
        self.src.get(pos) == Some(&b'=') && self.src.get(pos + 1) != Some(&b'>')
    }

    fn strip_type_alias(&mut self, after_type: usize) -> Result<()> {
        let end = skip_type(self.src, after_type, &[b';'], true);
        self.i = if self.src.get(end) == Some(&b';') {
            end + 1
        } else {
            end
        };
        Ok(())
    }

    fn strip_interface(&mut self, after_keyword: usize) -> Result<()> {
        let mut pos = self.skip_ws(after_keyword);
        while pos < self.src.len() && self.src[pos] != b'{' {
            if let Some(next) = skip_opaque(self.src, pos) {
                pos = next;
            } else {
                pos += 1;
            }
        }
        if pos >= self.src.len() {
            return Err(RenderifyError::Other(
                "unterminated interface declaration".into(),
            ));
        }
        self.i = skip_balanced(self.src, pos).ok_or_else(|| {
            RenderifyError::Other("unbalanced interface body".into())
        })?;
        Ok(())
    }

    fn strip_declare(&mut self, after_keyword: usize) -> Result<()> {
        let mut pos = self.skip_ws(after_keyword);
        while pos < self.src.len() {
            if let Some(next) = skip_opaque(self.src, pos) {
                pos = next;
                continue;
            }
            match self.src[pos] {
                b'{' => {
                    self.i = skip_balanced(self.src, pos)
                        .ok_or_else(|| RenderifyError::Other("unbalanced declare body".into()))?;
                    return Ok(());
                }
                b';' => {
                    self.i = pos + 1;
                    return Ok(());
                }
                _ => pos += 1,
            }
        }
        self.i = self.src.len();
        Ok(())
    }

    fn strip_to_semicolon(&mut self) -> Result<()> {
        let mut pos = self.i;
        while pos < self.src.len() {
            if let Some(next) = skip_opaque(self.src, pos) {
                pos = next;
                continue;
            }
            if self.src[pos] == b';' {
                self.i = pos + 1;
                return Ok(());
            }
            if self.src[pos] == b'\n' {
                self.i = pos;
                return Ok(());
            }
            pos += 1;
        }
        self.i = self.src.len();
        Ok(())
    }

    fn handle_punct(&mut self) {
        let b = self.src[self.i];
        match b {
            b'(' => {
                self.ctx.push(CtxFrame {
                    kind: CtxKind::Paren,
                    ternary: 0,
                });
                self.emit_byte();
            }
            b'[' => {
                self.ctx.push(CtxFrame {
                    kind: CtxKind::Bracket,
                    ternary: 0,
                });
                self.emit_byte();
            }
            b'{' => {
                let kind = if self.pending_class {
                    self.pending_class = false;
                    CtxKind::Class
                } else if self.brace_opens_object() {
                    CtxKind::ObjectLiteral
                } else {
                    CtxKind::Block
                };
                self.ctx.push(CtxFrame { kind, ternary: 0 });
                self.emit_byte();
            }
            b')' | b']' | b'}' => {
                if self.ctx.len() > 1 {
                    self.ctx.pop();
                }
                self.emit_byte();
            }
            b';' => {
                self.in_decl = false;
                self.in_import = false;
                self.emit_byte();
            }
            b':' => self.handle_colon(),
            b'?' => self.handle_question(),
            b'!' => self.handle_bang(),
            b'<' => self.handle_angle(),
            _ => self.emit_byte(),
        }
    }

    fn emit_byte(&mut self) {
        let b = self.src[self.i];
        self.out.push(b as char);
        self.last_sig = Some(b);
        self.last_word.clear();
        self.i += 1;
    }

    fn brace_opens_object(&self) -> bool {
        matches!(
            self.last_sig,
            Some(b'=') | Some(b'(') | Some(b',') | Some(b'[') | Some(b':') | Some(b'?')
        ) || self.last_word == "return"
    }

    fn handle_colon(&mut self) {
        if self.in_import {
            self.emit_byte();
            return;
        }
        if self.top().ternary > 0 {
            self.top().ternary -= 1;
            self.emit_byte();
            return;
        }
        // Return type annotation after a parameter list.
        if self.last_sig == Some(b')') {
            self.i = skip_type(
                self.src,
                self.skip_ws(self.i + 1),
                &[b'{', b';', b',', b'=', b')'],
                false,
            );
            return;
        }
        match self.innermost_kind() {
            CtxKind::Paren => {
                self.i = skip_type(
                    self.src,
                    self.skip_ws(self.i + 1),
                    &[b',', b')', b'='],
                    true,
                );
            }
            CtxKind::Class => {
                self.i = skip_type(
                    self.src,
                    self.skip_ws(self.i + 1),
                    &[b'=', b';', b'}'],
                    true,
                );
            }
            CtxKind::ObjectLiteral | CtxKind::Bracket => self.emit_byte(),
            CtxKind::Block => {
                if self.in_decl {
                    self.i = skip_type(
                        self.src,
                        self.skip_ws(self.i + 1),
                        &[b'=', b';', b','],
                        true,
                    );
                } else {
                    self.emit_byte();
                }
            }
        }
    }

    fn handle_question(&mut self) {
        let next = self.src.get(self.i + 1).copied();
        if next == Some(b'.') || next == Some(b'?') {
            // Optional chaining / nullish coalescing.
            self.emit_byte();
            self.emit_byte();
            return;
        }
        let after = self.peek_sig(self.i + 1);
        let annotation_ctx = matches!(self.innermost_kind(), CtxKind::Paren | CtxKind::Class)
            || self.in_decl;
        if annotation_ctx
            && value_position(self.last_sig)
            && matches!(after, Some(b':') | Some(b')') | Some(b',') | Some(b';') | Some(b'='))
        {
            // Optional marker: drop it, the colon handler removes the type.
            self.i += 1;
            return;
        }
        self.top().ternary += 1;
        self.emit_byte();
    }

    fn handle_bang(&mut self) {
        if value_position(self.last_sig) && self.src.get(self.i + 1) != Some(&b'=') {
            // Non-null assertion.
            self.i += 1;
            return;
        }
        self.emit_byte();
    }

    fn handle_angle(&mut self) {
        let ident_before = self
            .last_sig
            .map(is_ident_part)
            .unwrap_or(false);
        if ident_before && !self.in_import {
            if let Some(end) = try_skip_type_args(self.src, self.i) {
                if self.peek_sig(end) == Some(b'(') {
                    // Generic call or declaration arguments.
                    self.i = end;
                    return;
                }
            }
        }
        self.emit_byte();
    }
}

/// Whether the previous significant byte ends a value expression.
fn value_position(last_sig: Option<u8>) -> bool {
    match last_sig {
        Some(b')') | Some(b']') | Some(b'"') => true,
        Some(b) => is_ident_part(b),
        None => false,
    }
}

/// Consume a type expression starting at `start`; stops at the first byte in
/// `stop` at angle/bracket depth zero. With `consume_arrows`, `=>` inside the
/// type is swallowed; otherwise it terminates the scan.
fn skip_type(src: &[u8], start: usize, stop: &[u8], consume_arrows: bool) -> usize {
    let mut i = start;
    let mut angle: i32 = 0;
    while i < src.len() {
        if let Some(next) = skip_opaque(src, i) {
            i = next;
            continue;
        }
        let b = src[i];
        if b == b'=' && src.get(i + 1) == Some(&b'>') {
            if consume_arrows {
                i += 2;
                continue;
            }
            return i;
        }
        if angle == 0 && stop.contains(&b) {
            return i;
        }
        match b {
            b'<' => {
                angle += 1;
                i += 1;
            }
            b'>' => {
                if angle > 0 {
                    angle -= 1;
                }
                i += 1;
            }
            b'(' | b'[' | b'{' => {
                i = skip_balanced(src, i).unwrap_or(src.len());
            }
            _ => i += 1,
        }
    }
    src.len()
}

/// Try to read a `<...>` type-argument list. Returns the position after the
/// closing `>` when the content looks like types rather than comparisons.
fn try_skip_type_args(src: &[u8], start: usize) -> Option<usize> {
    const SCAN_LIMIT: usize = 600;
    let mut depth: i32 = 0;
    let mut i = start;
    while i < src.len() && i - start < SCAN_LIMIT {
        if let Some(next) = skip_opaque(src, i) {
            i = next;
            continue;
        }
        let b = src[i];
        match b {
            b'<' => {
                depth += 1;
                i += 1;
            }
            b'>' => {
                depth -= 1;
                i += 1;
                if depth == 0 {
                    return Some(i);
                }
            }
            b'(' | b'[' | b'{' => {
                i = skip_balanced(src, i)?;
            }
            b';' => return None,
            b'&' | b'|' => {
                if src.get(i + 1) == Some(&b) {
                    return None;
                }
                i += 1;
            }
            b'=' => {
                // `=>` is fine inside function types; a bare `=` is not.
                if src.get(i + 1) == Some(&b'>') {
                    i += 2;
                } else {
                    return None;
                }
            }
            b'+' | b'-' | b'*' | b'/' => return None,
            _ => i += 1,
        }
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    fn normalize(s: &str) -> String {
        s.split_whitespace().collect::<Vec<_>>().join(" ")
    }

    fn assert_strips(input: &str, expected: &str) {
        let out = strip_types(input).unwrap();
        assert_eq!(normalize(&out), normalize(expected), "input: {input}");
    }

    #[test]
    fn interface_declarations_removed() {
        assert_strips(
            "interface Props { a: number; b?: string }\nconst x = 1;",
            "const x = 1;",
        );
        assert_strips(
            "export interface Props extends Base { a: number }\nlet y = 2;",
            "let y = 2;",
        );
    }

    #[test]
    fn type_aliases_removed() {
        assert_strips("type A = { a: number };\nconst x = 1;", "const x = 1;");
        assert_strips("export type B = A | string;\nconst x = 1;", "const x = 1;");
        assert_strips("type F<T> = (x: T) => T;\nconst x = 1;", "const x = 1;");
    }

    #[test]
    fn import_type_removed_value_imports_kept() {
        assert_strips(
            "import type { A } from \"mod\";\nimport { b as c } from \"mod\";",
            "import { b as c } from \"mod\";",
        );
    }

    #[test]
    fn parameter_annotations_removed() {
        assert_strips(
            "function add(a: number, b: number = 2): number { return a + b; }",
            "function add(a, b = 2) { return a + b; }",
        );
        assert_strips(
            "const f = (name?: string) => name;",
            "const f = (name) => name;",
        );
    }

    #[test]
    fn variable_annotations_removed() {
        assert_strips("const n: number = 1;", "const n = 1;");
        assert_strips(
            "let handler: (x: number) => void = (x) => x;",
            "let handler = (x) => x;",
        );
    }

    #[test]
    fn object_literals_untouched() {
        assert_strips(
            "const o = { a: 1, b: \"two\", c: { d: 3 } };",
            "const o = { a: 1, b: \"two\", c: { d: 3 } };",
        );
    }

    #[test]
    fn ternaries_untouched() {
        assert_strips("const x = a ? b : c;", "const x = a ? b : c;");
        assert_strips("f(a ? b : c);", "f(a ? b : c);");
    }

    #[test]
    fn casts_removed() {
        assert_strips("const x = value as string;", "const x = value ;");
        assert_strips("const y = (v as any).field;", "const y = (v ).field;");
        assert_strips("const z = cfg satisfies Config;", "const z = cfg ;");
    }

    #[test]
    fn non_null_assertions_removed() {
        assert_strips("const a = b!.c;", "const a = b.c;");
        assert_strips("use(items!);", "use(items);");
        assert_strips("if (a !== b) { run(!flag); }", "if (a !== b) { run(!flag); }");
    }

    #[test]
    fn generic_arguments_removed() {
        assert_strips("const s = useState<number>(0);", "const s = useState(0);");
        assert_strips(
            "function identity<T>(value: T): T { return value; }",
            "function identity(value) { return value; }",
        );
        // A comparison is not a generic argument list.
        assert_strips("const ok = a < b && c > d;", "const ok = a < b && c > d;");
    }

    #[test]
    fn class_members_stripped() {
        assert_strips(
            "class Counter { private count: number = 0; constructor(private step: number) {} bump(): number { return this.count += this.step; } }",
            "class Counter { count = 0; constructor(step) {} bump() { return this.count += this.step; } }",
        );
    }

    #[test]
    fn implements_clause_removed() {
        assert_strips(
            "class A extends B implements C, D { run(): void {} }",
            "class A extends B { run() {} }",
        );
    }

    #[test]
    fn exported_declarations_still_strip_annotations() {
        assert_strips("export const n: number = 1;", "export const n = 1;");
        assert_strips(
            "export function f(a: string): string { return a; }",
            "export function f(a) { return a; }",
        );
        assert_strips(
            "export { a as b } from \"mod\";",
            "export { a as b } from \"mod\";",
        );
    }

    #[test]
    fn declare_statements_removed() {
        assert_strips("declare const env: string;\nconst x = 1;", "const x = 1;");
    }

    #[test]
    fn optional_chaining_preserved() {
        assert_strips("const v = a?.b ?? c;", "const v = a?.b ?? c;");
    }

    #[test]
    fn strings_and_comments_preserved() {
        assert_strips(
            "// keep: this\nconst s = \"a: b\"; /* x: y */",
            "// keep: this\nconst s = \"a: b\"; /* x: y */",
        );
    }
}
