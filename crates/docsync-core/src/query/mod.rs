//! Mango queries
//!
//! A query is `{selector, sort?, skip?, limit?, index?}`. Queries are
//! normalized (bare values become `$eq`, the primary key is appended as the
//! final sort field) and then planned against the schema's indexes. A
//! [`PreparedQuery`] bundles the normalized query, the compiled selector and
//! the [`QueryPlan`] every storage backend executes.

pub mod planner;
pub mod selector;
pub mod sort;

pub use planner::{QueryPlan, plan_query};
pub use selector::Selector;
pub use sort::{compare_values, sort_documents};

use crate::document::DocumentData;
use crate::schema::Schema;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use std::collections::BTreeMap;

/// Sort direction of one sort field
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
    /// Ascending
    Asc,
    /// Descending
    Desc,
}

/// One `{field: direction}` entry of a sort
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(
    try_from = "BTreeMap<String, SortDirection>",
    into = "BTreeMap<String, SortDirection>"
)]
pub struct SortField {
    /// Dotted field path
    pub field: String,
    /// Direction
    pub direction: SortDirection,
}

impl SortField {
    /// Ascending sort on `field`
    pub fn asc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: SortDirection::Asc,
        }
    }

    /// Descending sort on `field`
    pub fn desc(field: impl Into<String>) -> Self {
        Self {
            field: field.into(),
            direction: SortDirection::Desc,
        }
    }
}

impl TryFrom<BTreeMap<String, SortDirection>> for SortField {
    type Error = String;

    fn try_from(map: BTreeMap<String, SortDirection>) -> std::result::Result<Self, String> {
        let mut entries = map.into_iter();
        match (entries.next(), entries.next()) {
            (Some((field, direction)), None) => Ok(Self { field, direction }),
            _ => Err("each sort entry must contain exactly one field".to_string()),
        }
    }
}

impl From<SortField> for BTreeMap<String, SortDirection> {
    fn from(sort: SortField) -> Self {
        BTreeMap::from([(sort.field, sort.direction)])
    }
}

/// Explicit index override: one field or an ordered field list
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum IndexHint {
    /// Single field
    Field(String),
    /// Ordered fields
    Fields(Vec<String>),
}

impl IndexHint {
    /// Fields of the hinted index
    pub fn fields(&self) -> Vec<String> {
        match self {
            Self::Field(field) => vec![field.clone()],
            Self::Fields(fields) => fields.clone(),
        }
    }
}

/// Selector/sort/skip/limit query
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct MangoQuery {
    /// Field-operator tree
    #[serde(default)]
    pub selector: Map<String, Value>,
    /// Sort fields, applied in order
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sort: Vec<SortField>,
    /// Number of leading results to drop
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub skip: Option<usize>,
    /// Maximum number of results
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limit: Option<usize>,
    /// Explicit index to use
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub index: Option<IndexHint>,
}

impl MangoQuery {
    /// Parse a query, rejecting unknown top-level keys
    pub fn from_value(value: Value) -> Result<Self> {
        serde_json::from_value(value).map_err(|e| Error::query(format!("invalid query: {e}")))
    }

    /// Query with only a selector
    pub fn with_selector(selector: Value) -> Result<Self> {
        match selector {
            Value::Object(selector) => Ok(Self {
                selector,
                ..Default::default()
            }),
            other => Err(Error::query(format!("selector must be an object, got {other}"))),
        }
    }

    /// Rewrite to canonical form for `schema`
    ///
    /// Bare values become `{"$eq": value}`, the primary key is appended as
    /// the last sort field, and an index hint gets the primary key appended
    /// the same way declared indexes do.
    pub fn normalize(mut self, schema: &Schema) -> Self {
        let primary = schema.primary_path().to_string();
        self.selector = normalize_selector(self.selector);
        if !self.sort.iter().any(|s| s.field == primary) {
            self.sort.push(SortField::asc(primary.clone()));
        }
        if let Some(hint) = self.index.take() {
            let mut fields = hint.fields();
            if fields.last() != Some(&primary) {
                fields.push(primary);
            }
            self.index = Some(IndexHint::Fields(fields));
        }
        self
    }
}

fn is_operator_object(value: &Value) -> bool {
    match value {
        Value::Object(map) => !map.is_empty() && map.keys().all(|k| k.starts_with('$')),
        _ => false,
    }
}

fn normalize_selector(selector: Map<String, Value>) -> Map<String, Value> {
    selector
        .into_iter()
        .map(|(key, value)| {
            let value = match key.as_str() {
                "$and" | "$or" | "$nor" => match value {
                    Value::Array(items) => Value::Array(
                        items
                            .into_iter()
                            .map(|item| match item {
                                Value::Object(map) => Value::Object(normalize_selector(map)),
                                other => other,
                            })
                            .collect(),
                    ),
                    other => other,
                },
                _ if key.starts_with('$') => value,
                _ if is_operator_object(&value) => value,
                _ => {
                    let mut eq = Map::new();
                    eq.insert("$eq".to_string(), value);
                    Value::Object(eq)
                }
            };
            (key, value)
        })
        .collect()
}

/// A normalized query with its compiled selector and plan
#[derive(Debug, Clone)]
pub struct PreparedQuery {
    /// Normalized query
    pub query: MangoQuery,
    /// Compiled selector for in-memory matching
    pub selector: Selector,
    /// Index plan
    pub plan: QueryPlan,
}

impl PreparedQuery {
    /// Whether a document yielded by the index range belongs to the result
    pub fn accepts(&self, doc: &DocumentData) -> bool {
        !doc.deleted && (self.plan.selector_satisfied_by_index || self.selector.matches(doc))
    }

    /// Accepted documents a traversal needs before it can stop
    ///
    /// Only bounded when the index order is the requested order; otherwise
    /// every match has to be sorted first.
    pub fn traversal_limit(&self) -> usize {
        if !self.plan.sort_satisfied_by_index {
            return usize::MAX;
        }
        match self.query.limit {
            Some(limit) => self.query.skip.unwrap_or(0).saturating_add(limit),
            None => usize::MAX,
        }
    }

    /// Finish a query over documents yielded in index order
    ///
    /// Deleted documents are dropped, the selector is applied when the
    /// index does not already satisfy it, results are re-sorted when the
    /// index order differs from the requested one, then skip/limit apply.
    pub fn execute<I>(&self, docs_in_index_order: I) -> Vec<DocumentData>
    where
        I: IntoIterator<Item = DocumentData>,
    {
        let skip = self.query.skip.unwrap_or(0);
        let limit = self.query.limit.unwrap_or(usize::MAX);
        let filtered = docs_in_index_order
            .into_iter()
            .filter(|doc| self.accepts(doc));

        if self.plan.sort_satisfied_by_index {
            filtered.skip(skip).take(limit).collect()
        } else {
            let mut docs: Vec<DocumentData> = filtered.collect();
            sort_documents(&mut docs, &self.query.sort);
            docs.into_iter().skip(skip).take(limit).collect()
        }
    }
}

/// Normalize, validate and plan a query
pub fn prepare_query(schema: &Schema, query: MangoQuery) -> Result<PreparedQuery> {
    let query = query.normalize(schema);
    for sort in &query.sort {
        if schema.field(&sort.field).is_none() {
            return Err(Error::query(format!(
                "sort field '{}' is not part of the schema",
                sort.field
            )));
        }
    }
    let selector = Selector::compile(&query.selector)?;
    let plan = plan_query(schema, &query)?;
    Ok(PreparedQuery {
        query,
        selector,
        plan,
    })
}

/// Like [`prepare_query`] but for `count`, which rejects skip and limit
pub fn prepare_count_query(schema: &Schema, query: MangoQuery) -> Result<PreparedQuery> {
    if query.skip.is_some() || query.limit.is_some() {
        return Err(Error::query("count queries must not use skip or limit"));
    }
    prepare_query(schema, query)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn schema() -> Schema {
        Schema::from_value(json!({
            "version": 0,
            "primaryKey": "id",
            "properties": {
                "id": { "type": "string", "maxLength": 20 },
                "name": { "type": "string", "maxLength": 20 },
                "age": { "type": "integer", "minimum": 0, "maximum": 150 }
            },
            "indexes": ["age"]
        }))
        .unwrap()
    }

    #[test]
    fn test_rejects_unknown_keys() {
        let err = MangoQuery::from_value(json!({ "selector": {}, "fields": ["a"] })).unwrap_err();
        assert!(matches!(err, Error::Query(_)));
    }

    #[test]
    fn test_parse_sort_and_hint() {
        let query = MangoQuery::from_value(json!({
            "selector": { "age": 3 },
            "sort": [{ "age": "desc" }],
            "limit": 2,
            "index": "age"
        }))
        .unwrap();
        assert_eq!(query.sort, vec![SortField::desc("age")]);
        assert_eq!(query.index, Some(IndexHint::Field("age".into())));
        assert!(MangoQuery::from_value(json!({ "sort": [{ "a": "asc", "b": "asc" }] })).is_err());
    }

    #[test]
    fn test_normalize() {
        let schema = schema();
        let query = MangoQuery::from_value(json!({
            "selector": {
                "name": "alice",
                "age": { "$gt": 3 },
                "$or": [{ "name": "bob" }]
            },
            "index": ["age"]
        }))
        .unwrap()
        .normalize(&schema);

        assert_eq!(query.selector["name"], json!({ "$eq": "alice" }));
        assert_eq!(query.selector["age"], json!({ "$gt": 3 }));
        assert_eq!(query.selector["$or"], json!([{ "name": { "$eq": "bob" } }]));
        assert_eq!(query.sort, vec![SortField::asc("id")]);
        assert_eq!(
            query.index,
            Some(IndexHint::Fields(vec!["age".into(), "id".into()]))
        );
    }

    #[test]
    fn test_count_rejects_skip_limit() {
        let schema = schema();
        let query = MangoQuery::from_value(json!({ "selector": {}, "limit": 1 })).unwrap();
        assert!(prepare_count_query(&schema, query).is_err());
    }

    #[test]
    fn test_unknown_sort_field() {
        let schema = schema();
        let query = MangoQuery::from_value(json!({ "sort": [{ "nope": "asc" }] })).unwrap();
        assert!(prepare_query(&schema, query).is_err());
    }

    #[test]
    fn test_execute_filters_sorts_and_pages() {
        let schema = schema();
        let query = MangoQuery::from_value(json!({
            "selector": { "name": { "$ne": "x" } },
            "sort": [{ "age": "desc" }],
            "skip": 1,
            "limit": 2
        }))
        .unwrap();
        let prepared = prepare_query(&schema, query).unwrap();
        let docs = [("a", 5, "y"), ("b", 7, "x"), ("c", 9, "z"), ("d", 1, "w"), ("e", 3, "v")]
            .into_iter()
            .map(|(id, age, name)| {
                DocumentData::from_value(json!({ "id": id, "age": age, "name": name })).unwrap()
            });
        let result: Vec<String> = prepared
            .execute(docs)
            .iter()
            .map(|d| d.primary("id").unwrap().to_string())
            .collect();
        assert_eq!(result, vec!["a", "e"]);
    }

    #[test]
    fn test_traversal_limit_only_when_index_order_matches() {
        let schema = schema();
        let in_order = prepare_query(
            &schema,
            MangoQuery::from_value(json!({ "selector": {}, "skip": 2, "limit": 3 })).unwrap(),
        )
        .unwrap();
        assert!(in_order.plan.sort_satisfied_by_index);
        assert_eq!(in_order.traversal_limit(), 5);

        let resorted = prepare_query(
            &schema,
            MangoQuery::from_value(json!({ "sort": [{ "age": "desc" }], "limit": 3 })).unwrap(),
        )
        .unwrap();
        assert_eq!(resorted.traversal_limit(), usize::MAX);
    }
}
