use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;
use sha2::{Digest, Sha256};

use crate::filter::parse_date;
use crate::ParqueError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    String,
    Number,
    Boolean,
    Date,
    Object,
    Array,
    Reference,
}

/// Link field descriptor: the target namespace and the forward/reverse
/// predicate names used by the relationship store.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RelationshipDef {
    pub target_ns: String,
    pub predicate: String,
    pub reverse: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FieldDef {
    #[serde(rename = "type")]
    pub field_type: FieldType,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub indexed: bool,
    #[serde(default)]
    pub unique: bool,
    #[serde(default)]
    pub array: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub relationship: Option<RelationshipDef>,
}

impl FieldDef {
    pub fn of(field_type: FieldType) -> Self {
        Self {
            field_type,
            required: false,
            indexed: false,
            unique: false,
            array: false,
            relationship: None,
        }
    }

    pub fn required(mut self) -> Self {
        self.required = true;
        self
    }

    pub fn indexed(mut self) -> Self {
        self.indexed = true;
        self
    }

    pub fn array(mut self) -> Self {
        self.array = true;
        self
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CollectionOptions {
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub extra: BTreeMap<String, JsonValue>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CollectionSchema {
    pub name: String,
    pub version: u32,
    pub fields: BTreeMap<String, FieldDef>,
    #[serde(default)]
    pub options: CollectionOptions,
}

impl CollectionSchema {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version: 1,
            fields: BTreeMap::new(),
            options: CollectionOptions::default(),
        }
    }

    pub fn with_field(mut self, name: impl Into<String>, def: FieldDef) -> Self {
        self.fields.insert(name.into(), def);
        self
    }

    /// Content hash over the canonical serialization. Field maps are
    /// ordered, so equal schemas always hash equally.
    pub fn hash(&self) -> String {
        let canonical = serde_json::to_vec(self).expect("schema serializes");
        hex_digest(&canonical)
    }

    /// Validates a document against this schema: required fields present,
    /// typed fields carry the declared type.
    pub fn validate_doc(&self, doc: &JsonValue) -> Result<(), ParqueError> {
        let map = doc
            .as_object()
            .ok_or_else(|| ParqueError::invariant("document must be an object"))?;

        for (name, def) in &self.fields {
            let value = map.get(name);
            match value {
                None | Some(JsonValue::Null) => {
                    if def.required {
                        return Err(ParqueError::invariant(format!(
                            "{}: required field '{name}' is missing",
                            self.name
                        )));
                    }
                }
                Some(value) => {
                    if def.array {
                        let Some(items) = value.as_array() else {
                            return Err(ParqueError::invariant(format!(
                                "{}: field '{name}' must be an array",
                                self.name
                            )));
                        };
                        for item in items {
                            check_type(&self.name, name, def.field_type, item)?;
                        }
                    } else {
                        check_type(&self.name, name, def.field_type, value)?;
                    }
                }
            }
        }
        Ok(())
    }
}

fn check_type(
    collection: &str,
    field: &str,
    expected: FieldType,
    value: &JsonValue,
) -> Result<(), ParqueError> {
    let ok = match expected {
        FieldType::String => value.is_string(),
        FieldType::Number => value.is_number(),
        FieldType::Boolean => value.is_boolean(),
        FieldType::Date => value.as_str().is_some_and(|text| parse_date(text).is_some()),
        FieldType::Object => value.is_object(),
        FieldType::Array => value.is_array(),
        // Reference fields hold entity ids (or id objects before hydration).
        FieldType::Reference => value.is_string() || value.is_object(),
    };
    if ok {
        Ok(())
    } else {
        Err(ParqueError::invariant(format!(
            "{collection}: field '{field}' is not a {expected:?}"
        )))
    }
}

pub(crate) fn hex_digest(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    let digest = hasher.finalize();
    digest.iter().map(|byte| format!("{byte:02x}")).collect()
}

#[cfg(test)]
mod tests {
    use super::{CollectionSchema, FieldDef, FieldType};
    use serde_json::json;

    fn user_schema() -> CollectionSchema {
        CollectionSchema::new("users")
            .with_field("name", FieldDef::of(FieldType::String).required())
            .with_field("age", FieldDef::of(FieldType::Number))
            .with_field("tags", FieldDef::of(FieldType::String).array())
            .with_field("joined", FieldDef::of(FieldType::Date))
    }

    #[test]
    fn equal_schemas_hash_equally_and_changes_move_the_hash() {
        let a = user_schema();
        let b = user_schema();
        assert_eq!(a.hash(), b.hash());

        let c = user_schema().with_field("bio", FieldDef::of(FieldType::String));
        assert_ne!(a.hash(), c.hash());
    }

    #[test]
    fn validation_enforces_required_and_types() {
        let schema = user_schema();
        assert!(schema
            .validate_doc(&json!({"name": "ada", "age": 36, "tags": ["x"], "joined": "2024-01-01T00:00:00Z"}))
            .is_ok());
        assert!(schema.validate_doc(&json!({"age": 36})).is_err());
        assert!(schema.validate_doc(&json!({"name": "ada", "age": "old"})).is_err());
        assert!(schema.validate_doc(&json!({"name": "ada", "tags": "x"})).is_err());
        assert!(schema
            .validate_doc(&json!({"name": "ada", "joined": "yesterday"}))
            .is_err());
    }

    #[test]
    fn optional_fields_accept_null_and_absence() {
        let schema = user_schema();
        assert!(schema.validate_doc(&json!({"name": "ada", "age": null})).is_ok());
        assert!(schema.validate_doc(&json!({"name": "ada"})).is_ok());
    }
}
