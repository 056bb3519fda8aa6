//! JSON Schema validation of elicitation answers.

use serde_json::{Map, Value};

use crate::errors::{Result, RuntimeError};

/// Compiled schema plus the normalization rules for empty answers.
pub struct SchemaValidator {
    schema: Value,
    validator: jsonschema::Validator,
}

impl std::fmt::Debug for SchemaValidator {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SchemaValidator")
            .field("schema", &self.schema)
            .finish_non_exhaustive()
    }
}

fn is_empty_answer(v: &Value) -> bool {
    match v {
        Value::Null => true,
        Value::String(s) => s.trim().is_empty(),
        _ => false,
    }
}

impl SchemaValidator {
    pub fn new(schema: &Value) -> Result<Self> {
        let validator = jsonschema::validator_for(schema)
            .map_err(|e| RuntimeError::InvalidSchema(e.to_string()))?;
        Ok(Self {
            schema: schema.clone(),
            validator,
        })
    }

    fn property(&self, name: &str) -> Option<&Value> {
        self.schema.get("properties")?.get(name)
    }

    /// Resolve empty answers: a field with a `default` takes it, any other
    /// empty field is dropped (so a required one fails validation).
    pub fn normalize(&self, value: Value) -> Value {
        let Value::Object(fields) = value else {
            return value;
        };
        let normalized: Map<String, Value> = fields
            .into_iter()
            .filter_map(|(name, v)| {
                if !is_empty_answer(&v) {
                    return Some((name, v));
                }
                let default = self.property(&name)?.get("default")?.clone();
                Some((name, default))
            })
            .collect();
        Value::Object(normalized)
    }

    /// Normalize, then validate. The error is a user-facing message listing
    /// every violation.
    pub fn validate(&self, value: Value) -> std::result::Result<Value, String> {
        let value = self.normalize(value);
        let errors: Vec<String> = self
            .validator
            .iter_errors(&value)
            .map(|e| {
                let path = e.instance_path.to_string();
                if path.is_empty() {
                    e.to_string()
                } else {
                    format!("{path}: {e}")
                }
            })
            .collect();
        if errors.is_empty() {
            Ok(value)
        } else {
            Err(errors.join("; "))
        }
    }
}
