//! `{{ expr }}` template interpolation over the execution scope.
//!
//! Placeholders resolve by path prefix: `state.`, `event.`, `context.`,
//! `vars.` (shorthand for `context.variables.`), and default to `state.`.
//! Missing values render as the empty string; objects render through a
//! bounded serializer (depth 8, 256 nodes, 4096 output chars) so plan
//! templates cannot blow up the rendered tree.

use std::collections::BTreeMap;

use serde_json::Value;

use super::state::lookup_scope_path;
use crate::plan::{ExecutionContext, PlanEvent};

const MAX_DEPTH: usize = 8;
const MAX_NODES: usize = 256;
const MAX_OUTPUT: usize = 4096;

/// Values visible to placeholders.
pub struct InterpolationScope<'a> {
    pub state: &'a Value,
    pub event: Option<&'a PlanEvent>,
    pub context: &'a ExecutionContext,
}

impl<'a> InterpolationScope<'a> {
    fn resolve(&self, path: &str) -> Option<Value> {
        let fallback_event = PlanEvent::new("");
        let event = self.event.unwrap_or(&fallback_event);
        lookup_scope_path(path, self.state, event, self.context)
    }
}

/// Interpolate `{{ expr }}` placeholders in `template`.
///
/// A template with no placeholders is returned unchanged.
pub fn interpolate_text(template: &str, scope: &InterpolationScope<'_>) -> String {
    let Some(first) = template.find("{{") else {
        return template.to_string();
    };

    let mut out = String::with_capacity(template.len());
    out.push_str(&template[..first]);
    let mut rest = &template[first..];

    while let Some(open) = rest.find("{{") {
        out.push_str(&rest[..open]);
        let after_open = &rest[open + 2..];
        match after_open.find("}}") {
            Some(close) => {
                let expr = after_open[..close].trim();
                out.push_str(&render_resolved(scope.resolve(expr)));
                rest = &after_open[close + 2..];
            }
            None => {
                // Unterminated placeholder: emit verbatim.
                out.push_str(&rest[open..]);
                rest = "";
                break;
            }
        }
    }
    out.push_str(rest);
    out
}

/// Interpolate every string found in a props map, recursing into nested
/// arrays and objects with a hard depth bound.
pub fn interpolate_props(
    props: &BTreeMap<String, Value>,
    scope: &InterpolationScope<'_>,
) -> BTreeMap<String, Value> {
    props
        .iter()
        .map(|(key, value)| (key.clone(), interpolate_value(value, scope, 0)))
        .collect()
}

fn interpolate_value(value: &Value, scope: &InterpolationScope<'_>, depth: usize) -> Value {
    if depth > 64 {
        return value.clone();
    }
    match value {
        Value::String(s) => Value::String(interpolate_text(s, scope)),
        Value::Array(items) => Value::Array(
            items
                .iter()
                .map(|item| interpolate_value(item, scope, depth + 1))
                .collect(),
        ),
        Value::Object(map) => Value::Object(
            map.iter()
                .map(|(key, item)| (key.clone(), interpolate_value(item, scope, depth + 1)))
                .collect(),
        ),
        other => other.clone(),
    }
}

fn render_resolved(value: Option<Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s,
        Some(Value::Bool(b)) => b.to_string(),
        Some(Value::Number(n)) => n.to_string(),
        Some(other) => render_bounded(&other),
    }
}

/// Bounded JSON rendering for composite values.
pub fn render_bounded(value: &Value) -> String {
    let mut writer = BoundedWriter {
        out: String::new(),
        nodes: 0,
        truncated: false,
    };
    writer.write(value, 0);
    let mut out = writer.out;
    if out.len() > MAX_OUTPUT {
        let mut cut = MAX_OUTPUT;
        while !out.is_char_boundary(cut) {
            cut -= 1;
        }
        out.truncate(cut);
        writer.truncated = true;
    }
    if writer.truncated {
        out.push_str("...");
    }
    out
}

struct BoundedWriter {
    out: String,
    nodes: usize,
    truncated: bool,
}

impl BoundedWriter {
    fn budget(&mut self, depth: usize) -> bool {
        if depth > MAX_DEPTH || self.nodes >= MAX_NODES || self.out.len() > MAX_OUTPUT {
            self.truncated = true;
            return false;
        }
        self.nodes += 1;
        true
    }

    fn write(&mut self, value: &Value, depth: usize) {
        if !self.budget(depth) {
            self.out.push_str("\"[Truncated]\"");
            return;
        }
        match value {
            Value::Object(map) => {
                self.out.push('{');
                for (i, (key, item)) in map.iter().enumerate() {
                    if i > 0 {
                        self.out.push(',');
                    }
                    self.out
                        .push_str(&serde_json::to_string(key).unwrap_or_default());
                    self.out.push(':');
                    self.write(item, depth + 1);
                    if self.out.len() > MAX_OUTPUT {
                        self.truncated = true;
                        break;
                    }
                }
                self.out.push('}');
            }
            Value::Array(items) => {
                self.out.push('[');
                for (i, item) in items.iter().enumerate() {
                    if i > 0 {
                        self.out.push(',');
                    }
                    self.write(item, depth + 1);
                    if self.out.len() > MAX_OUTPUT {
                        self.truncated = true;
                        break;
                    }
                }
                self.out.push(']');
            }
            leaf => {
                self.out
                    .push_str(&serde_json::to_string(leaf).unwrap_or_default());
            }
        }
    }
}
