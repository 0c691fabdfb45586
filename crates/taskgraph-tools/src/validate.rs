//! Generic ArgSchema-driven argument validation (§4.6 validate step).
//!
//! The teacher's `deepseek-tools/src/validation.rs` hand-writes one validator
//! function per tool name (`validate_read_file_args`, `validate_bash_args`,
//! ...). Since every `ToolSpec` here carries a declarative `ArgSchema`
//! (§3), a single schema-walking validator replaces the whole family: type
//! checking, enum membership, required-field presence, default substitution,
//! and unknown-key rejection all happen in one recursive pass instead of N
//! hand-rolled ones. The error vocabulary (missing/invalid-type/invalid-enum/
//! unexpected-key) mirrors the teacher's `ValidationError` messages.

use serde_json::{Map, Value};
use taskgraph_core::ArgSchema;

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ValidationError {
    #[error("missing required field `{0}`")]
    MissingField(String),
    #[error("field `{field}` expected type `{expected}`, got `{actual}`")]
    WrongType {
        field: String,
        expected: String,
        actual: String,
    },
    #[error("field `{field}` must be one of {allowed:?}, got `{actual}`")]
    InvalidEnum {
        field: String,
        allowed: Vec<Value>,
        actual: Value,
    },
    #[error("unexpected field `{0}`")]
    UnexpectedField(String),
    #[error("expected a JSON object for arguments, got `{0}`")]
    NotAnObject(String),
}

/// Validates `args` against `schema`, filling in declared defaults for
/// absent optional fields. Returns the (possibly defaulted) argument value.
pub fn validate_args(schema: &ArgSchema, args: &Value) -> Result<Value, ValidationError> {
    validate_value("$", schema, args)
}

fn validate_value(field: &str, schema: &ArgSchema, value: &Value) -> Result<Value, ValidationError> {
    match schema.type_name.as_str() {
        "object" => validate_object(field, schema, value),
        "array" => validate_array(field, schema, value),
        "string" => {
            expect_type(field, value, value.is_string(), "string")?;
            check_enum(field, schema, value)?;
            Ok(value.clone())
        }
        "number" => {
            expect_type(field, value, value.is_number(), "number")?;
            check_enum(field, schema, value)?;
            Ok(value.clone())
        }
        "integer" => {
            expect_type(field, value, value.is_i64() || value.is_u64(), "integer")?;
            check_enum(field, schema, value)?;
            Ok(value.clone())
        }
        "boolean" => {
            expect_type(field, value, value.is_boolean(), "boolean")?;
            Ok(value.clone())
        }
        other => {
            // Unrecognized type names pass through unchecked; the schema
            // author is responsible for using the known vocabulary.
            let _ = other;
            Ok(value.clone())
        }
    }
}

fn validate_object(field: &str, schema: &ArgSchema, value: &Value) -> Result<Value, ValidationError> {
    let Value::Object(input) = value else {
        return Err(ValidationError::NotAnObject(describe(value)));
    };

    if !schema.additional_properties {
        for key in input.keys() {
            if !schema.properties.contains_key(key) {
                return Err(ValidationError::UnexpectedField(format!("{field}.{key}")));
            }
        }
    }

    let mut out = Map::new();
    for (prop_name, prop_schema) in &schema.properties {
        let child_field = format!("{field}.{prop_name}");
        match input.get(prop_name) {
            Some(v) => {
                out.insert(prop_name.clone(), validate_value(&child_field, prop_schema, v)?);
            }
            None => {
                if let Some(default) = &prop_schema.default {
                    out.insert(prop_name.clone(), default.clone());
                } else if prop_schema.required {
                    return Err(ValidationError::MissingField(child_field));
                }
            }
        }
    }
    // Pass through fields not declared in the schema when additional
    // properties are allowed.
    if schema.additional_properties {
        for (k, v) in input {
            out.entry(k.clone()).or_insert_with(|| v.clone());
        }
    }
    Ok(Value::Object(out))
}

fn validate_array(field: &str, schema: &ArgSchema, value: &Value) -> Result<Value, ValidationError> {
    let Value::Array(items) = value else {
        return Err(ValidationError::WrongType {
            field: field.to_string(),
            expected: "array".to_string(),
            actual: describe(value),
        });
    };
    let Some(item_schema) = &schema.items else {
        return Ok(value.clone());
    };
    let mut out = Vec::with_capacity(items.len());
    for (i, item) in items.iter().enumerate() {
        out.push(validate_value(&format!("{field}[{i}]"), item_schema, item)?);
    }
    Ok(Value::Array(out))
}

fn expect_type(field: &str, value: &Value, ok: bool, expected: &str) -> Result<(), ValidationError> {
    if ok {
        Ok(())
    } else {
        Err(ValidationError::WrongType {
            field: field.to_string(),
            expected: expected.to_string(),
            actual: describe(value),
        })
    }
}

fn check_enum(field: &str, schema: &ArgSchema, value: &Value) -> Result<(), ValidationError> {
    if schema.enum_values.is_empty() {
        return Ok(());
    }
    if schema.enum_values.contains(value) {
        Ok(())
    } else {
        Err(ValidationError::InvalidEnum {
            field: field.to_string(),
            allowed: schema.enum_values.clone(),
            actual: value.clone(),
        })
    }
}

fn describe(value: &Value) -> String {
    match value {
        Value::Null => "null".to_string(),
        Value::Bool(_) => "boolean".to_string(),
        Value::Number(_) => "number".to_string(),
        Value::String(_) => "string".to_string(),
        Value::Array(_) => "array".to_string(),
        Value::Object(_) => "object".to_string(),
    }
}
