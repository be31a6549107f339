use jsonschema::Validator;
use serde_json::Value;
use thiserror::Error;

#[derive(Debug, Clone)]
pub struct ValidationIssue {
    pub path: String,
    pub expected: String,
    pub fragment: String,
}

#[derive(Debug, Clone)]
pub struct ValidationOutcome {
    pub ok: bool,
    pub errors: Vec<ValidationIssue>,
}

#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("schema for '{tool}' is not a valid JSON Schema: {message}")]
    InvalidSchema { tool: String, message: String },
}

/// Strict JSON-Schema validation of tool arguments: no additional
/// properties beyond those declared, no type coercion, integer-vs-number
/// distinguished, full recursion into nested schemas and `$ref`s.
pub struct SchemaValidator;

impl SchemaValidator {
    pub fn new() -> Self {
        Self
    }

    /// Forces `additionalProperties: false` at the schema's top level and
    /// in every nested object schema that doesn't already declare it, since
    /// the spec demands strictness even when a downstream tool's declared
    /// schema doesn't explicitly forbid extras.
    pub fn harden_schema(schema: &Value) -> Value {
        let mut hardened = schema.clone();
        harden_recursive(&mut hardened);
        hardened
    }

    pub fn compile(&self, tool_name: &str, schema: &Value) -> Result<Validator, ValidationError> {
        let hardened = Self::harden_schema(schema);
        jsonschema::validator_for(&hardened).map_err(|err| ValidationError::InvalidSchema {
            tool: tool_name.to_string(),
            message: err.to_string(),
        })
    }

    pub fn validate(&self, tool_name: &str, args: &Value, schema: &Value) -> Result<ValidationOutcome, ValidationError> {
        let compiled = self.compile(tool_name, schema)?;
        let errors: Vec<ValidationIssue> = compiled
            .iter_errors(args)
            .map(|error| ValidationIssue {
                path: error.instance_path.to_string(),
                expected: error.kind.to_string(),
                fragment: error.instance.to_string(),
            })
            .collect();
        Ok(ValidationOutcome {
            ok: errors.is_empty(),
            errors,
        })
    }
}

impl Default for SchemaValidator {
    fn default() -> Self {
        Self::new()
    }
}

fn harden_recursive(value: &mut Value) {
    if let Value::Object(map) = value {
        if map.get("type").and_then(Value::as_str) == Some("object")
            && !map.contains_key("additionalProperties")
        {
            map.insert("additionalProperties".to_string(), Value::Bool(false));
        }
        if let Some(Value::Object(properties)) = map.get_mut("properties") {
            for (_, nested) in properties.iter_mut() {
                harden_recursive(nested);
            }
        }
        if let Some(items) = map.get_mut("items") {
            harden_recursive(items);
        }
        for key in ["anyOf", "oneOf", "allOf"] {
            if let Some(Value::Array(variants)) = map.get_mut(key) {
                for variant in variants.iter_mut() {
                    harden_recursive(variant);
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn int_schema() -> Value {
        json!({
            "type": "object",
            "properties": { "x": { "type": "integer" } },
            "required": ["x"]
        })
    }

    #[test]
    fn accepts_matching_integer_argument() {
        let validator = SchemaValidator::new();
        let outcome = validator
            .validate("tool-a", &json!({"x": 1}), &int_schema())
            .unwrap();
        assert!(outcome.ok);
    }

    #[test]
    fn rejects_string_where_integer_required() {
        let validator = SchemaValidator::new();
        let outcome = validator
            .validate("tool-a", &json!({"x": "1"}), &int_schema())
            .unwrap();
        assert!(!outcome.ok);
        assert_eq!(outcome.errors[0].path, "/x");
    }

    #[test]
    fn rejects_additional_properties_even_if_schema_is_silent() {
        let schema = json!({
            "type": "object",
            "properties": { "x": { "type": "integer" } }
        });
        let validator = SchemaValidator::new();
        let outcome = validator
            .validate("tool-a", &json!({"x": 1, "y": 2}), &schema)
            .unwrap();
        assert!(!outcome.ok);
    }

    #[test]
    fn distinguishes_integer_from_number() {
        let validator = SchemaValidator::new();
        let outcome = validator
            .validate("tool-a", &json!({"x": 1.5}), &int_schema())
            .unwrap();
        assert!(!outcome.ok);
    }
}
