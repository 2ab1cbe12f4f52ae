//! JSON-schema validation of tool parameters.

use jsonschema::validator_for;
use serde_json::Value;

use super::ToolError;

/// Validate `args` against a tool's declared parameter schema.
///
/// On failure the error names the offending field: a missing required
/// property first, otherwise the first declared property whose value does not
/// satisfy its own sub-schema. Errors that cannot be pinned to a property are
/// reported against `<root>`.
pub fn validate_params(tool: &str, schema: &Value, args: &Value) -> Result<(), ToolError> {
    let compiled = validator_for(schema).map_err(|e| ToolError::InvalidSchema {
        tool: tool.to_string(),
        message: e.to_string(),
    })?;
    if compiled.is_valid(args) {
        return Ok(());
    }

    let invalid = |field: &str, message: String| ToolError::InvalidParameter {
        tool: tool.to_string(),
        field: field.to_string(),
        message,
    };

    let Some(object) = args.as_object() else {
        return Err(invalid("<root>", "parameters must be a JSON object".to_string()));
    };

    if let Some(required) = schema.get("required").and_then(Value::as_array) {
        for field in required.iter().filter_map(Value::as_str) {
            if !object.contains_key(field) {
                return Err(invalid(field, "missing required field".to_string()));
            }
        }
    }

    if let Some(properties) = schema.get("properties").and_then(Value::as_object) {
        for (field, subschema) in properties {
            let Some(value) = object.get(field) else {
                continue;
            };
            let Ok(sub) = validator_for(subschema) else {
                continue;
            };
            if !sub.is_valid(value) {
                let message = sub
                    .iter_errors(value)
                    .map(|err| err.to_string())
                    .collect::<Vec<_>>()
                    .join("; ");
                return Err(invalid(field, message));
            }
        }
    }

    let messages = compiled
        .iter_errors(args)
        .map(|err| err.to_string())
        .collect::<Vec<_>>();
    Err(invalid("<root>", messages.join("; ")))
}
