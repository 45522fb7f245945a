use std::collections::{BTreeMap, HashMap};

use serde_json::Value;

use crate::error::ValidationErrors;
use crate::Record;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ValidationMode {
    /// Full record: every required property must be present.
    Insert,
    /// Partial record: only the supplied properties are checked.
    Patch,
}

/// Validates and normalises one record of an entity before it is written.
pub trait Validator: Send + Sync {
    fn validate(
        &self,
        entity: &str,
        record: Record,
        mode: ValidationMode,
    ) -> Result<Record, ValidationErrors>;
}

#[derive(Debug, Clone, Copy, Default)]
pub struct AcceptAll;

impl Validator for AcceptAll {
    fn validate(
        &self,
        _entity: &str,
        record: Record,
        _mode: ValidationMode,
    ) -> Result<Record, ValidationErrors> {
        Ok(record)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldType {
    String,
    Integer,
    Number,
    Boolean,
    Object,
    Array,
}

impl FieldType {
    fn matches(&self, value: &Value) -> bool {
        match self {
            FieldType::String => value.is_string(),
            FieldType::Integer => value.is_i64() || value.is_u64(),
            FieldType::Number => value.is_number(),
            FieldType::Boolean => value.is_boolean(),
            FieldType::Object => value.is_object(),
            FieldType::Array => value.is_array(),
        }
    }

    fn label(&self) -> &'static str {
        match self {
            FieldType::String => "string",
            FieldType::Integer => "integer",
            FieldType::Number => "number",
            FieldType::Boolean => "boolean",
            FieldType::Object => "object",
            FieldType::Array => "array",
        }
    }
}

#[derive(Debug, Clone, Default)]
struct EntityRules {
    required: Vec<String>,
    types: BTreeMap<String, FieldType>,
}

/// Per-entity required properties and JSON type expectations. Null passes
/// type checks; it only fails a required property.
#[derive(Debug, Clone, Default)]
pub struct FieldRules {
    entities: HashMap<String, EntityRules>,
}

impl FieldRules {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn require(mut self, entity: &str, property: &str) -> Self {
        let rules = self.entities.entry(entity.to_string()).or_default();
        if !rules.required.iter().any(|p| p == property) {
            rules.required.push(property.to_string());
        }
        self
    }

    pub fn field(mut self, entity: &str, property: &str, ty: FieldType) -> Self {
        self.entities
            .entry(entity.to_string())
            .or_default()
            .types
            .insert(property.to_string(), ty);
        self
    }
}

impl Validator for FieldRules {
    fn validate(
        &self,
        entity: &str,
        record: Record,
        mode: ValidationMode,
    ) -> Result<Record, ValidationErrors> {
        let Some(rules) = self.entities.get(entity) else {
            return Ok(record);
        };

        let mut errors = ValidationErrors::new();
        if mode == ValidationMode::Insert {
            for property in &rules.required {
                if record.get(property).map_or(true, Value::is_null) {
                    errors.add(property.clone(), "is a required property");
                }
            }
        }
        for (property, ty) in &rules.types {
            match record.get(property) {
                Some(value) if !value.is_null() && !ty.matches(value) => {
                    errors.add(property.clone(), format!("should be {}", ty.label()));
                }
                _ => {}
            }
        }

        if errors.is_empty() {
            Ok(record)
        } else {
            Err(errors)
        }
    }
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    fn record(value: Value) -> Record {
        value.as_object().cloned().unwrap()
    }

    fn rules() -> FieldRules {
        FieldRules::new()
            .require("Person", "firstName")
            .field("Person", "firstName", FieldType::String)
            .field("Person", "age", FieldType::Integer)
    }

    #[test]
    fn insert_requires_fields() {
        let err = rules()
            .validate("Person", record(json!({"age": 3})), ValidationMode::Insert)
            .unwrap_err();
        assert!(err.contains("firstName"));
    }

    #[test]
    fn patch_skips_required_but_checks_types() {
        let rules = rules();
        assert!(rules
            .validate("Person", record(json!({"age": 3})), ValidationMode::Patch)
            .is_ok());
        let err = rules
            .validate("Person", record(json!({"age": "x"})), ValidationMode::Patch)
            .unwrap_err();
        assert!(err.contains("age"));
    }

    #[test]
    fn unknown_entities_pass() {
        assert!(rules()
            .validate("Movie", record(json!({})), ValidationMode::Insert)
            .is_ok());
    }
}
