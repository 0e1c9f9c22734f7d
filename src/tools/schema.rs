//! Minimal JSON Schema checks applied to tool arguments before invocation.
//!
//! Covers what tool schemas in this crate actually use: an object root,
//! `required` properties, and primitive `type` constraints (including
//! `enum` for strings). Anything else in the schema is ignored.

use serde_json::Value;

pub fn validate_arguments(schema: &Value, args: &Value) -> Result<(), String> {
    if schema.get("type").and_then(Value::as_str) == Some("object") && !args.is_object() {
        return Err(format!("expected an object, got {}", type_name(args)));
    }

    let Some(obj) = args.as_object() else {
        return Ok(());
    };

    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for name in required.iter().filter_map(Value::as_str) {
            match obj.get(name) {
                None | Some(Value::Null) => {
                    return Err(format!("missing required property '{}'", name));
                }
                Some(_) => {}
            }
        }
    }

    let Some(properties) = schema.get("properties").and_then(Value::as_object) else {
        return Ok(());
    };

    for (name, value) in obj {
        let Some(prop_schema) = properties.get(name) else {
            continue;
        };
        if value.is_null() {
            continue;
        }
        if let Some(expected) = prop_schema.get("type").and_then(Value::as_str) {
            if !matches_type(expected, value) {
                return Err(format!(
                    "property '{}' must be of type {}, got {}",
                    name,
                    expected,
                    type_name(value)
                ));
            }
        }
        if let Some(allowed) = prop_schema.get("enum").and_then(Value::as_array) {
            if !allowed.contains(value) {
                return Err(format!("property '{}' has a value outside its enum", name));
            }
        }
    }

    Ok(())
}

fn matches_type(expected: &str, value: &Value) -> bool {
    match expected {
        "string" => value.is_string(),
        "integer" => value.is_i64() || value.is_u64(),
        "number" => value.is_number(),
        "boolean" => value.is_boolean(),
        "object" => value.is_object(),
        "array" => value.is_array(),
        _ => true,
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
