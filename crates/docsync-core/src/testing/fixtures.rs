//! Schema and documents used across tests

use crate::document::{DocumentData, now_lwt};
use crate::revision::create_revision;
use crate::schema::Schema;
use crate::storage::{BulkWriteRow, StorageInstance};
use serde_json::{Map, Value, json};

/// Revision token of fixture writes
pub const FIXTURE_TOKEN: &str = "fixture";

/// JSON of the `human` schema: `id`, `name`, indexed `age`
pub fn human_schema_value() -> Value {
    json!({
        "title": "human",
        "version": 0,
        "primaryKey": "id",
        "type": "object",
        "properties": {
            "id": { "type": "string", "maxLength": 100 },
            "name": { "type": "string", "maxLength": 100 },
            "age": { "type": "integer", "minimum": 0, "maximum": 150, "multipleOf": 1 }
        },
        "required": ["id", "name", "age"],
        "indexes": ["age"],
        "attachments": {}
    })
}

/// The `human` schema
pub fn human_schema() -> Schema {
    Schema::from_value(human_schema_value()).expect("human schema is valid")
}

/// A first-revision `human` document
pub fn human(id: &str, age: u32) -> DocumentData {
    let mut data = Map::new();
    data.insert("id".to_string(), json!(id));
    data.insert("name".to_string(), json!(id));
    data.insert("age".to_string(), json!(age));
    let mut doc = DocumentData::new(data);
    doc.rev = create_revision(FIXTURE_TOKEN, None).expect("fixture token is valid");
    doc.meta.lwt = now_lwt();
    doc
}

/// Row writing `change` on top of `previous` with the next revision
pub fn update_row(previous: &DocumentData, change: impl FnOnce(&mut DocumentData)) -> BulkWriteRow {
    let mut document = previous.clone();
    change(&mut document);
    document.rev = create_revision(FIXTURE_TOKEN, Some(previous)).expect("valid revision");
    document.meta.lwt = now_lwt();
    BulkWriteRow::update(previous.clone(), document)
}

/// Insert `(id, age)` humans in one batch, panicking on any row error
pub async fn insert_humans(
    instance: &dyn StorageInstance,
    humans: &[(&str, u32)],
) -> Vec<DocumentData> {
    let rows = humans
        .iter()
        .map(|(id, age)| BulkWriteRow::insert(human(id, *age)))
        .collect();
    let response = instance
        .bulk_write(rows, "fixtures")
        .await
        .expect("fixture write failed");
    assert!(
        response.error.is_empty(),
        "fixture rows rejected: {:?}",
        response.error.keys().collect::<Vec<_>>()
    );
    humans
        .iter()
        .map(|(id, _)| response.success[*id].clone())
        .collect()
}
