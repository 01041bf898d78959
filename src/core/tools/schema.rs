//! JSON-schema argument validation.
//!
//! A deliberately small subset of JSON schema: top-level `object` with
//! `properties`, `required` and primitive `type` checks. That covers every
//! schema the built-in tools declare, and anything the validator cannot
//! verify is passed through to the handler untouched.

use serde_json::{Map, Value};

use crate::errors::BridgeError;

/// Validate raw arguments against a tool's parameter schema.
///
/// Returns the argument object on success. Any violation yields
/// [`BridgeError::InvalidArguments`] and the handler is never invoked.
pub fn validate_arguments(raw: &Value, schema: &Value) -> Result<Map<String, Value>, BridgeError> {
    let args = raw
        .as_object()
        .ok_or_else(|| BridgeError::InvalidArguments("arguments must be a JSON object".into()))?;

    let properties = schema.get("properties").and_then(Value::as_object);

    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for name in required.iter().filter_map(Value::as_str) {
            if !args.contains_key(name) {
                return Err(BridgeError::InvalidArguments(format!(
                    "missing required field '{name}'"
                )));
            }
        }
    }

    if let Some(properties) = properties {
        for (name, value) in args {
            // Null is treated as "field omitted".
            if value.is_null() {
                continue;
            }
            let Some(expected) = properties
                .get(name)
                .and_then(|p| p.get("type"))
                .and_then(Value::as_str)
            else {
                continue;
            };
            if !type_matches(value, expected) {
                return Err(BridgeError::InvalidArguments(format!(
                    "field '{name}' must be of type {expected}"
                )));
            }
        }
    }

    Ok(args.clone())
}

fn type_matches(value: &Value, expected: &str) -> bool {
    match expected {
        "string" => value.is_string(),
        "integer" => value.is_i64() || value.is_u64(),
        "number" => value.is_number(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        _ => true,
    }
}
