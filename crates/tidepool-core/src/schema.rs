//! Tool-input shape validation.
//!
//! Capability input schemas are JSON values in the common
//! `{ "required": [...], "properties": { field: { "type": ... } } }`
//! shape. Validation checks presence of required fields and primitive
//! type agreement; it is deliberately not a full JSON-Schema engine;
//! the upstream system only ever validates shape.

use crate::error::SchemaViolation;
use serde_json::Value;

/// Validate `input` against `schema`.
///
/// Returns the first violation found, checking required fields before
/// property types so repair prompts lead with the most actionable error.
pub fn validate_input(schema: &Value, input: &Value) -> Result<(), SchemaViolation> {
    let Some(object) = input.as_object() else {
        return Err(SchemaViolation::NotAnObject);
    };

    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for field in required.iter().filter_map(Value::as_str) {
            if !object.contains_key(field) {
                return Err(SchemaViolation::MissingField {
                    field: field.to_string(),
                });
            }
        }
    }

    if let Some(properties) = schema.get("properties").and_then(Value::as_object) {
        for (field, spec) in properties {
            let Some(value) = object.get(field) else {
                continue;
            };
            let Some(expected) = spec.get("type").and_then(Value::as_str) else {
                continue;
            };
            if !type_matches(expected, value) {
                return Err(SchemaViolation::WrongType {
                    field: field.clone(),
                    expected: expected.to_string(),
                    actual: json_type_name(value).to_string(),
                });
            }
        }
    }

    Ok(())
}

fn type_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "array" => value.is_array(),
        "object" => value.is_object(),
        "null" => value.is_null(),
        // Unknown type names don't fail validation.
        _ => true,
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
