//! Value collation and document sorting

use crate::document::DocumentData;
use crate::query::{SortDirection, SortField};
use serde_json::Value;
use std::cmp::Ordering;

fn type_rank(value: &Value) -> u8 {
    match value {
        Value::Null => 0,
        Value::Bool(_) => 1,
        Value::Number(_) => 2,
        Value::String(_) => 3,
        Value::Array(_) => 4,
        Value::Object(_) => 5,
    }
}

/// Total order over JSON values: null < bool < number < string < array < object
pub fn compare_values(a: &Value, b: &Value) -> Ordering {
    match (a, b) {
        (Value::Null, Value::Null) => Ordering::Equal,
        (Value::Bool(a), Value::Bool(b)) => a.cmp(b),
        (Value::Number(a), Value::Number(b)) => {
            let (a, b) = (a.as_f64().unwrap_or(0.0), b.as_f64().unwrap_or(0.0));
            a.partial_cmp(&b).unwrap_or(Ordering::Equal)
        }
        (Value::String(a), Value::String(b)) => a.cmp(b),
        (Value::Array(a), Value::Array(b)) => a
            .iter()
            .zip(b)
            .map(|(x, y)| compare_values(x, y))
            .find(|o| *o != Ordering::Equal)
            .unwrap_or_else(|| a.len().cmp(&b.len())),
        (Value::Object(a), Value::Object(b)) => a
            .iter()
            .zip(b)
            .map(|((ka, va), (kb, vb))| ka.cmp(kb).then_with(|| compare_values(va, vb)))
            .find(|o| *o != Ordering::Equal)
            .unwrap_or_else(|| a.len().cmp(&b.len())),
        _ => type_rank(a).cmp(&type_rank(b)),
    }
}

/// Compare two documents by a list of sort fields; missing fields sort as null
pub fn compare_documents(sort: &[SortField], a: &DocumentData, b: &DocumentData) -> Ordering {
    for field in sort {
        let left = a.get_path(&field.field);
        let right = b.get_path(&field.field);
        let ordering = compare_values(
            left.as_deref().unwrap_or(&Value::Null),
            right.as_deref().unwrap_or(&Value::Null),
        );
        let ordering = match field.direction {
            SortDirection::Asc => ordering,
            SortDirection::Desc => ordering.reverse(),
        };
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}

/// Stable in-place sort
pub fn sort_documents(docs: &mut [DocumentData], sort: &[SortField]) {
    docs.sort_by(|a, b| compare_documents(sort, a, b));
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_type_collation() {
        let ordered = [
            json!(null),
            json!(false),
            json!(true),
            json!(-1),
            json!(2.5),
            json!(""),
            json!("a"),
            json!([1]),
            json!([1, 2]),
            json!({ "a": 1 }),
        ];
        for pair in ordered.windows(2) {
            assert_eq!(compare_values(&pair[0], &pair[1]), Ordering::Less, "{pair:?}");
        }
    }

    #[test]
    fn test_sort_documents_with_tiebreak() {
        let mut docs: Vec<DocumentData> = [("b", 1), ("a", 1), ("c", 0)]
            .into_iter()
            .map(|(id, age)| DocumentData::from_value(json!({ "id": id, "age": age })).unwrap())
            .collect();
        sort_documents(&mut docs, &[SortField::desc("age"), SortField::asc("id")]);
        let ids: Vec<_> = docs.iter().map(|d| d.primary("id").unwrap()).collect();
        assert_eq!(ids, vec!["a", "b", "c"]);
    }
}
