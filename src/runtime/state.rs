//! Declarative plan state: initial values, transitions, and snapshots.
//!
//! Snapshots are last-write-wins per plan id, held in-process. A transition
//! named by the event type applies its actions in list order; `set` values
//! may reference the live `{state, event, context, vars}` scope through
//! `{"$from": "..."}`.

use std::collections::HashMap;

use parking_lot::Mutex;
use serde_json::{json, Map, Value};
use tracing::debug;

use crate::plan::{AppliedAction, ExecutionContext, PlanEvent, TransitionAction};

/// In-memory snapshot store, keyed by plan id.
#[derive(Debug, Default)]
pub struct StateStore {
    snapshots: Mutex<HashMap<String, Value>>,
}

impl StateStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get_plan_state(&self, plan_id: &str) -> Option<Value> {
        self.snapshots.lock().get(plan_id).cloned()
    }

    pub fn set_plan_state(&self, plan_id: &str, state: Value) {
        self.snapshots.lock().insert(plan_id.to_string(), state);
    }

    pub fn clear_plan_state(&self, plan_id: &str) {
        self.snapshots.lock().remove(plan_id);
    }

    pub fn clear_all(&self) {
        self.snapshots.lock().clear();
    }
}

/// Deep-merge `overlay` onto `base`: objects merge key-wise with overlay
/// values winning, everything else is replaced by the overlay.
pub fn deep_merge(base: &Value, overlay: &Value) -> Value {
    match (base, overlay) {
        (Value::Object(base_map), Value::Object(overlay_map)) => {
            let mut merged = base_map.clone();
            for (key, overlay_value) in overlay_map {
                let merged_value = match merged.get(key) {
                    Some(base_value) => deep_merge(base_value, overlay_value),
                    None => overlay_value.clone(),
                };
                merged.insert(key.clone(), merged_value);
            }
            Value::Object(merged)
        }
        _ => overlay.clone(),
    }
}

/// Apply a transition's actions in order, returning the new state and the
/// applied-action record.
pub fn apply_transition(
    state: &Value,
    actions: &[TransitionAction],
    event: &PlanEvent,
    context: &ExecutionContext,
) -> (Value, Vec<AppliedAction>) {
    let mut next = state.clone();
    if !next.is_object() {
        next = Value::Object(Map::new());
    }
    let mut applied = Vec::with_capacity(actions.len());

    for action in actions {
        match action {
            TransitionAction::Set { path, value } => {
                let resolved = resolve_value(value, &next, event, context);
                set_path(&mut next, path, resolved.clone());
                applied.push(AppliedAction {
                    action: "set".to_string(),
                    path: path.clone(),
                    value: resolved,
                });
            }
            TransitionAction::Increment { path, by } => {
                let current = get_path(&next, path)
                    .and_then(Value::as_f64)
                    .unwrap_or(0.0);
                let incremented = json_number(current + by);
                set_path(&mut next, path, incremented.clone());
                applied.push(AppliedAction {
                    action: "increment".to_string(),
                    path: path.clone(),
                    value: incremented,
                });
            }
        }
    }

    debug!(actions = applied.len(), "transition applied");
    (next, applied)
}

/// Integral results stay integers on the wire.
fn json_number(value: f64) -> Value {
    if value.fract() == 0.0 && value.abs() < (i64::MAX as f64) {
        json!(value as i64)
    } else {
        json!(value)
    }
}

/// Resolve a literal or a `{"$from": "scope.path"}` reference.
fn resolve_value(
    value: &Value,
    state: &Value,
    event: &PlanEvent,
    context: &ExecutionContext,
) -> Value {
    let Some(reference) = value.get("$from").and_then(Value::as_str) else {
        return value.clone();
    };
    lookup_scope_path(reference, state, event, context).unwrap_or(Value::Null)
}

/// Resolve a dotted path with a `state.` / `event.` / `context.` / `vars.`
/// prefix.
pub(crate) fn lookup_scope_path(
    reference: &str,
    state: &Value,
    event: &PlanEvent,
    context: &ExecutionContext,
) -> Option<Value> {
    let (root, rest) = match reference.split_once('.') {
        Some((root, rest)) => (root, rest),
        None => (reference, ""),
    };
    let root_value: Value = match root {
        "state" => state.clone(),
        "event" => serde_json::to_value(event).ok()?,
        "context" => serde_json::to_value(context).ok()?,
        "vars" => serde_json::to_value(&context.variables).ok()?,
        // No known prefix: the whole reference is a state path.
        _ => return get_path(state, reference).cloned(),
    };
    if rest.is_empty() {
        return Some(root_value);
    }
    get_path(&root_value, rest).cloned()
}

/// Read a dotted path.
pub(crate) fn get_path<'a>(value: &'a Value, path: &str) -> Option<&'a Value> {
    let mut current = value;
    for segment in path.split('.') {
        current = current.get(segment)?;
    }
    Some(current)
}

/// Write a dotted path, creating intermediate objects and replacing
/// non-object intermediates.
fn set_path(target: &mut Value, path: &str, new_value: Value) {
    let segments: Vec<&str> = path.split('.').collect();
    let mut current = target;
    for (i, segment) in segments.iter().enumerate() {
        if !current.is_object() {
            *current = Value::Object(Map::new());
        }
        let map = current.as_object_mut().expect("object ensured above");
        if i == segments.len() - 1 {
            map.insert((*segment).to_string(), new_value);
            return;
        }
        current = map
            .entry((*segment).to_string())
            .or_insert_with(|| Value::Object(Map::new()));
    }
}
