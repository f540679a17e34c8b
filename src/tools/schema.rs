//! Validation of tool call parameters against a declared JSON Schema.
//!
//! Only the top level is checked: parameters must be an object, `required`
//! fields must be present, and properties with a declared `type` must match.

use serde_json::Value;
use crate::Result;
use crate::error::Error;

fn type_matches(expected: &str, value: &Value) -> bool {
    match expected {
        "string" => value.is_string(),
        "number" => value.is_number(),
        "integer" => value.is_i64() || value.is_u64(),
        "boolean" => value.is_boolean(),
        "object" => value.is_object(),
        "array" => value.is_array(),
        "null" => value.is_null(),
        // Unknown type keywords are not ours to reject
        _ => true,
    }
}

fn json_type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(n) if n.is_i64() || n.is_u64() => "integer",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

/// Check `params` against `schema`.
pub fn validate_parameters(schema: &Value, params: &Value) -> Result<()> {
    let Some(params) = params.as_object() else {
        return Err(Error::ToolValidation(format!(
            "parameters must be a JSON object, got {}",
            json_type_name(params)
        )));
    };

    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        let missing: Vec<&str> = required
            .iter()
            .filter_map(Value::as_str)
            .filter(|field| !params.contains_key(*field))
            .collect();
        if !missing.is_empty() {
            return Err(Error::ToolValidation(format!(
                "missing required parameter(s): {}",
                missing.join(", ")
            )));
        }
    }

    let Some(properties) = schema.get("properties").and_then(Value::as_object) else {
        return Ok(());
    };

    for (name, value) in params {
        let Some(declared) = properties.get(name).and_then(|p| p.get("type")) else {
            continue;
        };
        let ok = match declared {
            Value::String(t) => type_matches(t, value),
            Value::Array(types) => types
                .iter()
                .filter_map(Value::as_str)
                .any(|t| type_matches(t, value)),
            _ => true,
        };
        if !ok {
            return Err(Error::ToolValidation(format!(
                "parameter '{name}' should be {declared}, got {}",
                json_type_name(value)
            )));
        }
    }

    Ok(())
}
