//! The runtime-plan JSON Schema and structured-output validation.
//!
//! Structured provider calls either enforce this schema upstream (OpenAI
//! `json_schema` response format, Google `responseJsonSchema`) or validate
//! the returned text locally. Either way the final result is checked here
//! before it is handed to callers.

use std::sync::OnceLock;

use serde_json::{json, Value};

use super::LlmStructuredResponse;
use crate::http::tolerant::parse_tolerant_json;

/// The JSON Schema every structured response must satisfy.
pub fn runtime_plan_schema() -> &'static Value {
    static SCHEMA: OnceLock<Value> = OnceLock::new();
    SCHEMA.get_or_init(|| {
        json!({
            "$schema": "http://json-schema.org/draft-07/schema#",
            "type": "object",
            "required": ["id", "version", "root", "capabilities"],
            "properties": {
                "specVersion": {"type": "string"},
                "id": {"type": "string", "minLength": 1},
                "version": {"type": "integer", "minimum": 1},
                "capabilities": {
                    "type": "object",
                    "required": ["domWrite"],
                    "properties": {
                        "domWrite": {"type": "boolean"},
                        "allowedModules": {"type": "array", "items": {"type": "string"}},
                        "maxExecutionMs": {"type": "integer", "minimum": 1},
                        "maxImports": {"type": "integer", "minimum": 0},
                        "maxComponentInvocations": {"type": "integer", "minimum": 0},
                        "executionProfile": {
                            "enum": ["default", "sandbox-worker", "sandbox-iframe", "isolated-vm"]
                        }
                    }
                },
                "root": {"$ref": "#/definitions/node"},
                "imports": {"type": "array", "items": {"type": "string"}},
                "moduleManifest": {
                    "type": "object",
                    "additionalProperties": {
                        "type": "object",
                        "required": ["resolvedUrl"],
                        "properties": {
                            "resolvedUrl": {"type": "string"},
                            "integrity": {"type": "string"},
                            "version": {"type": "string"},
                            "signer": {"type": "string"}
                        }
                    }
                },
                "state": {
                    "type": "object",
                    "properties": {
                        "initial": {},
                        "transitions": {
                            "type": "object",
                            "additionalProperties": {
                                "type": "array",
                                "items": {
                                    "type": "object",
                                    "required": ["type", "path"],
                                    "properties": {
                                        "type": {"enum": ["set", "increment"]},
                                        "path": {"type": "string"},
                                        "value": {},
                                        "by": {"type": "number"}
                                    }
                                }
                            }
                        }
                    }
                },
                "source": {
                    "type": "object",
                    "required": ["code", "language"],
                    "properties": {
                        "code": {"type": "string"},
                        "language": {"enum": ["js", "jsx", "ts", "tsx"]},
                        "filename": {"type": "string"},
                        "runtime": {"enum": ["renderify", "preact"]}
                    }
                },
                "metadata": {"type": "object"}
            },
            "definitions": {
                "node": {
                    "oneOf": [
                        {
                            "type": "object",
                            "required": ["type", "value"],
                            "properties": {
                                "type": {"const": "text"},
                                "value": {"type": "string"}
                            }
                        },
                        {
                            "type": "object",
                            "required": ["type", "tag"],
                            "properties": {
                                "type": {"const": "element"},
                                "tag": {"type": "string"},
                                "props": {"type": "object"},
                                "children": {
                                    "type": "array",
                                    "items": {"$ref": "#/definitions/node"}
                                }
                            }
                        },
                        {
                            "type": "object",
                            "required": ["type", "module"],
                            "properties": {
                                "type": {"const": "component"},
                                "module": {"type": "string"},
                                "exportName": {"type": "string"},
                                "props": {"type": "object"}
                            }
                        }
                    ]
                }
            }
        })
    })
}

fn validator() -> &'static jsonschema::Validator {
    static VALIDATOR: OnceLock<jsonschema::Validator> = OnceLock::new();
    VALIDATOR.get_or_init(|| {
        jsonschema::validator_for(runtime_plan_schema())
            .expect("runtime-plan schema is valid")
    })
}

/// Validate a candidate plan value. Empty result means valid.
pub fn validate_plan_value(value: &Value) -> Vec<String> {
    validator()
        .iter_errors(value)
        .map(|err| {
            let path = err.instance_path.to_string();
            if path.is_empty() {
                err.to_string()
            } else {
                format!("{path}: {err}")
            }
        })
        .collect()
}

/// Build a structured response from provider text: tolerant-parse, then
/// validate against the runtime-plan schema.
pub fn structured_from_text(
    text: &str,
    tokens_used: Option<u64>,
    model: Option<String>,
    raw: Value,
) -> LlmStructuredResponse {
    match parse_tolerant_json(text) {
        Ok(value) => {
            let errors = validate_plan_value(&value);
            LlmStructuredResponse {
                valid: errors.is_empty(),
                value: Some(value),
                errors,
                tokens_used,
                model,
                raw,
            }
        }
        Err(parse_error) => LlmStructuredResponse {
            valid: false,
            value: None,
            errors: vec![format!("response is not valid JSON: {parse_error}")],
            tokens_used,
            model,
            raw,
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn minimal_plan() -> Value {
        json!({
            "id": "p1",
            "version": 1,
            "capabilities": {"domWrite": false},
            "root": {"type": "text", "value": "hello"}
        })
    }

    #[test]
    fn minimal_plan_validates() {
        assert!(validate_plan_value(&minimal_plan()).is_empty());
    }

    #[test]
    fn missing_required_fields_reported() {
        let errors = validate_plan_value(&json!({"id": "p1"}));
        assert!(!errors.is_empty());
    }

    #[test]
    fn bad_source_language_rejected() {
        let mut plan = minimal_plan();
        plan["source"] = json!({"code": "x", "language": "py"});
        assert!(!validate_plan_value(&plan).is_empty());
    }

    #[test]
    fn nested_nodes_validate() {
        let mut plan = minimal_plan();
        plan["root"] = json!({
            "type": "element",
            "tag": "div",
            "children": [
                {"type": "component", "module": "chart", "exportName": "Chart"},
                {"type": "text", "value": "caption"}
            ]
        });
        assert!(validate_plan_value(&plan).is_empty());
    }

    #[test]
    fn structured_from_fenced_text() {
        let text = format!("```json\n{}\n```", minimal_plan());
        let response = structured_from_text(&text, Some(9), None, Value::Null);
        assert!(response.valid);
        assert_eq!(response.value.unwrap()["id"], "p1");
        assert_eq!(response.tokens_used, Some(9));
    }

    #[test]
    fn structured_from_garbage_text() {
        let response = structured_from_text("nope", None, None, Value::Null);
        assert!(!response.valid);
        assert!(response.errors[0].contains("not valid JSON"));
    }

    #[test]
    fn structured_from_invalid_plan() {
        let response =
            structured_from_text(r#"{"id": "p1"}"#, None, None, Value::Null);
        assert!(!response.valid);
        assert!(response.value.is_some());
        assert!(!response.errors.is_empty());
    }
}
