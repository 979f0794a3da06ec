//! Option-map key picking shared by `configure` implementations.
//!
//! Client configuration is incremental: each `configure(options)` overlays
//! only the keys present in the map. Every canonical key also has an
//! `llm`-prefixed namespaced alias (`apiKey` / `llmApiKey`).

use serde_json::Value;

/// Look up `key` or its `llm`-prefixed alias.
pub(crate) fn pick<'a>(options: &'a Value, key: &str) -> Option<&'a Value> {
    if let Some(v) = options.get(key) {
        return Some(v);
    }
    let mut alias = String::with_capacity(key.len() + 3);
    alias.push_str("llm");
    let mut chars = key.chars();
    if let Some(first) = chars.next() {
        alias.push(first.to_ascii_uppercase());
        alias.push_str(chars.as_str());
    }
    options.get(&alias)
}

pub(crate) fn pick_str(options: &Value, key: &str) -> Option<String> {
    pick(options, key)
        .and_then(Value::as_str)
        .map(str::to_string)
}

pub(crate) fn pick_u64(options: &Value, key: &str) -> Option<u64> {
    pick(options, key).and_then(Value::as_u64)
}

pub(crate) fn pick_f64(options: &Value, key: &str) -> Option<f64> {
    pick(options, key).and_then(Value::as_f64)
}

pub(crate) fn pick_bool(options: &Value, key: &str) -> Option<bool> {
    pick(options, key).and_then(Value::as_bool)
}
