//! Collection schema
//!
//! A JSON-schema-like description of a collection: primary key, property
//! definitions, declared indexes and the schema version used by migration.
//! Every indexed field must have a bounded encoding so index keys can be
//! rendered as fixed-width sortable strings (see [`crate::index`]).

use crate::revision::hash_token;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::borrow::Cow;
use std::collections::BTreeMap;

/// Path of the soft-delete flag
pub const DELETED_PATH: &str = "_deleted";
/// Path of the last-write-time
pub const LWT_PATH: &str = "_meta.lwt";

/// Top-level property names that collide with document accessors
pub const RESERVED_PROPERTY_NAMES: &[&str] = &[
    "primary",
    "revision",
    "deleted",
    "get",
    "patch",
    "remove",
    "collection",
    "put_attachment",
    "get_attachment",
    "remove_attachment",
];

/// JSON type of a property
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum FieldType {
    /// UTF-8 string
    String,
    /// Floating point number
    Number,
    /// Whole number
    Integer,
    /// true / false
    Boolean,
    /// Nested object
    Object,
    /// Array
    Array,
    /// null
    Null,
}

/// Definition of one property
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct FieldDefinition {
    /// Declared JSON type
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub field_type: Option<FieldType>,
    /// Maximum string length in characters
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_length: Option<usize>,
    /// Lower numeric bound
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub minimum: Option<f64>,
    /// Upper numeric bound
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub maximum: Option<f64>,
    /// Numeric precision step
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub multiple_of: Option<f64>,
    /// Nested properties of an object field
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, FieldDefinition>,
}

impl FieldDefinition {
    /// String field with a maximum length
    pub fn string(max_length: usize) -> Self {
        Self {
            field_type: Some(FieldType::String),
            max_length: Some(max_length),
            ..Default::default()
        }
    }

    /// Boolean field
    pub fn boolean() -> Self {
        Self {
            field_type: Some(FieldType::Boolean),
            ..Default::default()
        }
    }

    /// Bounded number field
    pub fn number(minimum: f64, maximum: f64, multiple_of: f64) -> Self {
        Self {
            field_type: Some(FieldType::Number),
            minimum: Some(minimum),
            maximum: Some(maximum),
            multiple_of: Some(multiple_of),
            ..Default::default()
        }
    }

    /// Check a document value against this definition, nested properties
    /// included
    fn check_value(&self, path: &str, value: &Value) -> Result<()> {
        let type_ok = match self.field_type {
            None => true,
            Some(FieldType::String) => value.is_string(),
            Some(FieldType::Number) => value.is_number(),
            Some(FieldType::Integer) => value.as_f64().is_some_and(|n| n.fract() == 0.0),
            Some(FieldType::Boolean) => value.is_boolean(),
            Some(FieldType::Object) => value.is_object(),
            Some(FieldType::Array) => value.is_array(),
            Some(FieldType::Null) => value.is_null(),
        };
        if !type_ok {
            return Err(Error::validation(format!(
                "field '{path}' must be of type {:?}, got {value}",
                self.field_type
            )));
        }
        if let (Some(max), Some(s)) = (self.max_length, value.as_str()) {
            if s.chars().count() > max {
                return Err(Error::validation(format!(
                    "field '{path}' is longer than maxLength {max}"
                )));
            }
        }
        if let Some(n) = value.as_f64() {
            if self.minimum.is_some_and(|min| n < min) || self.maximum.is_some_and(|max| n > max) {
                return Err(Error::validation(format!(
                    "field '{path}' value {n} is outside [{:?}, {:?}]",
                    self.minimum, self.maximum
                )));
            }
            if let Some(step) = self.multiple_of.filter(|step| *step > 0.0) {
                let ratio = n / step;
                if (ratio - ratio.round()).abs() > 1e-9 * ratio.abs().max(1.0) {
                    return Err(Error::validation(format!(
                        "field '{path}' value {n} is not a multiple of {step}"
                    )));
                }
            }
        }
        if let Some(object) = value.as_object() {
            for (name, nested) in object {
                if let Some(def) = self.properties.get(name) {
                    def.check_value(&format!("{path}.{name}"), nested)?;
                }
            }
        }
        Ok(())
    }

    fn check_indexable(&self, path: &str) -> Result<()> {
        match self.field_type {
            Some(FieldType::String) if self.max_length.is_some() => Ok(()),
            Some(FieldType::String) => Err(Error::schema(format!(
                "indexed string field '{path}' must declare maxLength"
            ))),
            Some(FieldType::Boolean) => Ok(()),
            Some(FieldType::Number) => {
                if self.minimum.is_some() && self.maximum.is_some() && self.multiple_of.is_some() {
                    Ok(())
                } else {
                    Err(Error::schema(format!(
                        "indexed number field '{path}' must declare minimum, maximum and multipleOf"
                    )))
                }
            }
            Some(FieldType::Integer) => {
                if self.minimum.is_some() && self.maximum.is_some() {
                    Ok(())
                } else {
                    Err(Error::schema(format!(
                        "indexed integer field '{path}' must declare minimum and maximum"
                    )))
                }
            }
            other => Err(Error::schema(format!(
                "field '{path}' of type {other:?} cannot be indexed"
            ))),
        }
    }
}

/// Composite primary key: joined values of several fields
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CompositePrimaryKey {
    /// Field that stores the composed value
    pub key: String,
    /// Source fields, in join order
    pub fields: Vec<String>,
    /// Join separator
    pub separator: String,
}

/// Primary key descriptor
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum PrimaryKey {
    /// A single string field
    Field(String),
    /// A key composed from several fields
    Composite(CompositePrimaryKey),
}

impl PrimaryKey {
    /// Field that stores the primary key value
    pub fn path(&self) -> &str {
        match self {
            Self::Field(field) => field,
            Self::Composite(composite) => &composite.key,
        }
    }
}

/// Declared index: one field or an ordered field list
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IndexDefinition {
    /// Single-field index
    Single(String),
    /// Compound index
    Compound(Vec<String>),
}

impl IndexDefinition {
    /// Ordered fields of the index
    pub fn fields(&self) -> Vec<String> {
        match self {
            Self::Single(field) => vec![field.clone()],
            Self::Compound(fields) => fields.clone(),
        }
    }
}

/// Collection schema
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Schema {
    /// Human readable title
    #[serde(default)]
    pub title: String,
    /// Schema version, bumped on incompatible changes
    #[serde(default)]
    pub version: u32,
    /// Primary key descriptor
    pub primary_key: PrimaryKey,
    /// Top-level properties
    #[serde(default)]
    pub properties: BTreeMap<String, FieldDefinition>,
    /// Required top-level properties
    #[serde(default)]
    pub required: Vec<String>,
    /// Declared indexes
    #[serde(default)]
    pub indexes: Vec<IndexDefinition>,
    /// Attachment support marker
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub attachments: Option<Value>,
}

impl Schema {
    /// Parse and validate a schema from JSON
    pub fn from_value(value: Value) -> Result<Self> {
        let schema: Schema = serde_json::from_value(value)
            .map_err(|e| Error::schema(format!("invalid schema: {e}")))?;
        schema.validate()?;
        Ok(schema)
    }

    /// Field storing the primary key
    pub fn primary_path(&self) -> &str {
        self.primary_key.path()
    }

    /// Whether documents may carry attachments
    pub fn has_attachments(&self) -> bool {
        self.attachments.is_some()
    }

    /// Check structural rules: key definition, property names, indexable fields
    pub fn validate(&self) -> Result<()> {
        let primary = self.primary_path();
        match self.properties.get(primary) {
            Some(def) if def.field_type == Some(FieldType::String) && def.max_length.is_some() => {}
            Some(_) => {
                return Err(Error::schema(format!(
                    "primary key '{primary}' must be a string with maxLength"
                )));
            }
            None => {
                return Err(Error::schema(format!(
                    "primary key '{primary}' is not a declared property"
                )));
            }
        }
        if let PrimaryKey::Composite(composite) = &self.primary_key {
            if composite.fields.is_empty() {
                return Err(Error::schema("composite primary key needs at least one field"));
            }
            for field in &composite.fields {
                if !self.properties.contains_key(field) {
                    return Err(Error::schema(format!(
                        "composite primary key field '{field}' is not a declared property"
                    )));
                }
            }
        }

        for name in self.properties.keys() {
            if name.starts_with('_') {
                return Err(Error::schema(format!(
                    "top-level property '{name}' must not start with an underscore"
                )));
            }
            if name.is_empty() || name.contains('.') {
                return Err(Error::schema(format!("invalid property name '{name}'")));
            }
            if RESERVED_PROPERTY_NAMES.contains(&name.as_str()) {
                return Err(Error::schema(format!(
                    "property name '{name}' is reserved by the document API"
                )));
            }
        }
        for name in &self.required {
            if !self.properties.contains_key(name) {
                return Err(Error::schema(format!(
                    "required property '{name}' is not declared"
                )));
            }
        }

        for index in &self.indexes {
            let fields = index.fields();
            if fields.is_empty() {
                return Err(Error::schema("empty index definition"));
            }
            for field in &fields {
                let def = self
                    .field(field)
                    .ok_or_else(|| Error::schema(format!("indexed field '{field}' is not declared")))?;
                def.check_indexable(field)?;
            }
        }
        Ok(())
    }

    /// Definition of a dotted field path, including the internal paths
    pub fn field(&self, path: &str) -> Option<Cow<'_, FieldDefinition>> {
        match path {
            DELETED_PATH => Some(Cow::Owned(FieldDefinition::boolean())),
            LWT_PATH => Some(Cow::Owned(FieldDefinition::number(1.0, 1e15, 0.01))),
            _ => {
                let mut segments = path.split('.');
                let mut def = self.properties.get(segments.next()?)?;
                for segment in segments {
                    def = def.properties.get(segment)?;
                }
                Some(Cow::Borrowed(def))
            }
        }
    }

    /// Indexes available to the query planner, primary key index first
    ///
    /// Declared indexes get the primary key appended so every index
    /// defines a total order.
    pub fn query_indexes(&self) -> Vec<Vec<String>> {
        let primary = self.primary_path().to_string();
        let mut indexes = vec![vec![primary.clone()]];
        for index in &self.indexes {
            let mut fields = index.fields();
            if fields.last() != Some(&primary) {
                fields.push(primary.clone());
            }
            if !indexes.contains(&fields) {
                indexes.push(fields);
            }
        }
        indexes
    }

    /// Index ordering documents by `(lwt, primary key)`
    pub fn changes_index(&self) -> Vec<String> {
        vec![LWT_PATH.to_string(), self.primary_path().to_string()]
    }

    /// Index ordering tombstones by `(deleted, lwt, primary key)`
    pub fn cleanup_index(&self) -> Vec<String> {
        vec![
            DELETED_PATH.to_string(),
            LWT_PATH.to_string(),
            self.primary_path().to_string(),
        ]
    }

    /// Storage index behind a query index: `_deleted` first, so live
    /// documents form one contiguous range
    pub fn live_index(query_index: &[String]) -> Vec<String> {
        let mut fields = Vec::with_capacity(query_index.len() + 1);
        fields.push(DELETED_PATH.to_string());
        fields.extend(query_index.iter().cloned());
        fields
    }

    /// Every index a storage backend maintains
    pub fn storage_indexes(&self) -> Vec<Vec<String>> {
        let mut indexes: Vec<Vec<String>> = self
            .query_indexes()
            .iter()
            .map(|index| Self::live_index(index))
            .collect();
        for extra in [self.changes_index(), self.cleanup_index()] {
            if !indexes.contains(&extra) {
                indexes.push(extra);
            }
        }
        indexes
    }

    /// Compute (for composite keys) and validate the primary key of `data`
    pub fn fill_primary_key(&self, data: &mut Map<String, Value>) -> Result<String> {
        let id = match &self.primary_key {
            PrimaryKey::Field(field) => match data.get(field) {
                Some(Value::String(id)) => id.clone(),
                Some(other) => {
                    return Err(Error::validation(format!(
                        "primary key '{field}' must be a string, got {other}"
                    )));
                }
                None => {
                    return Err(Error::validation(format!("missing primary key '{field}'")));
                }
            },
            PrimaryKey::Composite(composite) => {
                let mut parts = Vec::with_capacity(composite.fields.len());
                for field in &composite.fields {
                    let part = match data.get(field) {
                        Some(Value::String(s)) => s.clone(),
                        Some(Value::Number(n)) => n.to_string(),
                        Some(Value::Bool(b)) => b.to_string(),
                        _ => {
                            return Err(Error::validation(format!(
                                "composite primary key field '{field}' is missing"
                            )));
                        }
                    };
                    parts.push(part);
                }
                let composed = parts.join(&composite.separator);
                if let Some(existing) = data.get(&composite.key) {
                    if existing.as_str() != Some(composed.as_str()) {
                        return Err(Error::validation(format!(
                            "primary key '{}' does not match its composite fields",
                            composite.key
                        )));
                    }
                }
                data.insert(composite.key.clone(), Value::String(composed.clone()));
                composed
            }
        };
        self.validate_primary_key_value(&id)?;
        Ok(id)
    }

    /// Check the user fields of a document against the declared properties
    ///
    /// Every `required` field must be present. Declared fields must match
    /// their type and bounds; index strings rely on those bounds. Undeclared
    /// fields are not checked.
    pub fn validate_document(&self, data: &Map<String, Value>) -> Result<()> {
        if let Some(missing) = self.required.iter().find(|name| !data.contains_key(*name)) {
            return Err(Error::validation(format!(
                "required field '{missing}' is missing"
            )));
        }
        for (name, value) in data {
            if let Some(def) = self.properties.get(name) {
                def.check_value(name, value)?;
            }
        }
        Ok(())
    }

    /// Primary keys are embedded in index strings and must stay printable
    pub fn validate_primary_key_value(&self, id: &str) -> Result<()> {
        if id.is_empty() {
            return Err(Error::validation("primary key must not be empty"));
        }
        if id.trim() != id {
            return Err(Error::validation(format!(
                "primary key '{id}' has leading or trailing whitespace"
            )));
        }
        if id.chars().any(|c| c.is_control() || c == '"' || c == '\'') {
            return Err(Error::validation(format!(
                "primary key '{id}' contains control characters or quotes"
            )));
        }
        let max = self
            .properties
            .get(self.primary_path())
            .and_then(|def| def.max_length)
            .unwrap_or(usize::MAX);
        if id.chars().count() > max {
            return Err(Error::validation(format!(
                "primary key '{id}' is longer than maxLength {max}"
            )));
        }
        Ok(())
    }

    /// Stable fingerprint used to detect schema edits without a version bump
    pub fn fingerprint(&self) -> String {
        hash_token(&serde_json::to_string(self).unwrap_or_default())
    }

    /// Copy of this schema with another version number
    pub fn with_version(&self, version: u32) -> Self {
        Self {
            version,
            ..self.clone()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn human() -> Value {
        json!({
            "title": "human",
            "version": 0,
            "primaryKey": "id",
            "type": "object",
            "properties": {
                "id": { "type": "string", "maxLength": 100 },
                "name": { "type": "string", "maxLength": 50 },
                "age": { "type": "integer", "minimum": 0, "maximum": 150, "multipleOf": 1 },
                "address": {
                    "type": "object",
                    "properties": { "city": { "type": "string", "maxLength": 20 } }
                }
            },
            "required": ["id"],
            "indexes": ["age", ["name", "age"], "address.city"]
        })
    }

    #[test]
    fn test_parse_and_indexes() {
        let schema = Schema::from_value(human()).unwrap();
        assert_eq!(schema.primary_path(), "id");
        assert_eq!(
            schema.query_indexes(),
            vec![
                vec!["id".to_string()],
                vec!["age".to_string(), "id".to_string()],
                vec!["name".to_string(), "age".to_string(), "id".to_string()],
                vec!["address.city".to_string(), "id".to_string()],
            ]
        );
        let storage = schema.storage_indexes();
        assert_eq!(storage.len(), 6);
        assert_eq!(storage[1], vec!["_deleted", "age", "id"]);
        assert_eq!(storage[4], schema.changes_index());
        assert_eq!(
            schema.field("address.city").unwrap().max_length,
            Some(20)
        );
        assert_eq!(
            schema.field("_meta.lwt").unwrap().maximum,
            Some(1e15)
        );
    }

    #[test]
    fn test_rejects_unbounded_index() {
        let mut value = human();
        value["properties"]["name"] = json!({ "type": "string" });
        let err = Schema::from_value(value).unwrap_err();
        assert!(matches!(err, Error::Schema(msg) if msg.contains("maxLength")));
    }

    #[test]
    fn test_rejects_underscore_property() {
        let mut value = human();
        value["properties"]["_secret"] = json!({ "type": "string" });
        assert!(Schema::from_value(value).is_err());
    }

    #[test]
    fn test_rejects_reserved_property() {
        let mut value = human();
        value["properties"]["patch"] = json!({ "type": "string" });
        assert!(Schema::from_value(value).is_err());
    }

    #[test]
    fn test_rejects_missing_primary() {
        let mut value = human();
        value["primaryKey"] = json!("nope");
        assert!(Schema::from_value(value).is_err());
    }

    #[test]
    fn test_composite_primary_key() {
        let schema = Schema::from_value(json!({
            "version": 0,
            "primaryKey": { "key": "key", "fields": ["first", "last"], "separator": "|" },
            "properties": {
                "key": { "type": "string", "maxLength": 100 },
                "first": { "type": "string" },
                "last": { "type": "string" }
            }
        }))
        .unwrap();
        let mut data = json!({ "first": "ada", "last": "lovelace" })
            .as_object()
            .cloned()
            .unwrap();
        assert_eq!(schema.fill_primary_key(&mut data).unwrap(), "ada|lovelace");
        assert_eq!(data["key"], "ada|lovelace");
    }

    #[test]
    fn test_primary_key_values() {
        let schema = Schema::from_value(human()).unwrap();
        assert!(schema.validate_primary_key_value("alice").is_ok());
        for bad in ["", " alice", "alice ", "al\"ice", "al'ice", "a\nb"] {
            assert!(schema.validate_primary_key_value(bad).is_err(), "{bad:?}");
        }
        assert!(schema.validate_primary_key_value(&"x".repeat(101)).is_err());
    }

    #[test]
    fn test_fingerprint_changes_with_content() {
        let schema = Schema::from_value(human()).unwrap();
        let mut other = schema.clone();
        other.title = "changed".into();
        assert_eq!(schema.fingerprint(), schema.clone().fingerprint());
        assert_ne!(schema.fingerprint(), other.fingerprint());
    }

    #[test]
    fn test_validate_document() {
        let schema = Schema::from_value(human()).unwrap();
        let doc = |value: Value| value.as_object().cloned().unwrap();
        assert!(
            schema
                .validate_document(&doc(json!({
                    "id": "a", "name": "A", "age": 30, "address": { "city": "Oslo" }, "extra": [1]
                })))
                .is_ok()
        );

        let invalid = [
            json!({ "name": "no id" }),
            json!({ "id": "a", "age": 200 }),
            json!({ "id": "a", "age": -1 }),
            json!({ "id": "a", "age": 1.5 }),
            json!({ "id": "a", "age": "30" }),
            json!({ "id": "a", "name": "n".repeat(51) }),
            json!({ "id": "a", "address": { "city": "c".repeat(21) } }),
        ];
        for value in invalid {
            assert!(
                matches!(schema.validate_document(&doc(value.clone())), Err(Error::Validation(_))),
                "{value} should be rejected"
            );
        }
    }
}
