//! Bulk-write categorization
//!
//! Classifies every row of a batch as insert, update or error against the
//! current stored state, diffs attachments and builds the event bulk. The
//! physical write of every backend is driven by the result.

use crate::document::{AttachmentData, Checkpoint, DocumentData, now_lwt};
use crate::revision::random_token;
use crate::storage::{
    BulkWriteRow, ChangeEvent, EventBulk, Operation, WriteError, WriteErrorKind,
};
use crate::{Error, Result};
use std::collections::BTreeMap;

/// A row accepted by the categorizer
#[derive(Debug, Clone)]
pub struct CategorizedRow {
    /// Primary key
    pub id: String,
    /// State to store, attachment payloads stripped
    pub document: DocumentData,
    /// Stored state being replaced, `None` for inserts
    pub replaces: Option<DocumentData>,
}

/// New or changed attachment payload
#[derive(Debug, Clone, PartialEq)]
pub struct AttachmentWrite {
    /// Owning document
    pub document_id: String,
    /// Attachment id
    pub attachment_id: String,
    /// Metadata with base64 payload
    pub attachment: AttachmentData,
}

/// Attachment payload to drop
#[derive(Debug, Clone, PartialEq)]
pub struct AttachmentRemove {
    /// Owning document
    pub document_id: String,
    /// Attachment id
    pub attachment_id: String,
    /// Digest of the removed payload
    pub digest: String,
}

/// Output of [`categorize_bulk_write_rows`]
#[derive(Debug, Clone)]
pub struct CategorizedWrites {
    /// Rows for documents that did not exist
    pub bulk_insert_docs: Vec<CategorizedRow>,
    /// Rows replacing a stored document
    pub bulk_update_docs: Vec<CategorizedRow>,
    /// Rejected rows by primary key
    pub errors: BTreeMap<String, WriteError>,
    /// Events of the accepted rows
    pub event_bulk: EventBulk,
    /// Attachment payloads to add
    pub attachments_add: Vec<AttachmentWrite>,
    /// Attachment payloads to replace
    pub attachments_update: Vec<AttachmentWrite>,
    /// Attachment payloads to remove
    pub attachments_remove: Vec<AttachmentRemove>,
    /// Accepted row with the highest lwt
    pub newest_row: Option<DocumentData>,
}

impl CategorizedWrites {
    /// Accepted rows in input order of their kind: inserts first, then updates
    pub fn accepted(&self) -> impl Iterator<Item = &CategorizedRow> {
        self.bulk_insert_docs.iter().chain(&self.bulk_update_docs)
    }

    /// Whether any row was accepted
    pub fn has_writes(&self) -> bool {
        !self.bulk_insert_docs.is_empty() || !self.bulk_update_docs.is_empty()
    }

    /// Stamp the bulk's end time and checkpoint once the write committed
    pub fn finish_event_bulk(&mut self, primary_path: &str) -> EventBulk {
        self.event_bulk.checkpoint = self
            .newest_row
            .as_ref()
            .and_then(|doc| Checkpoint::of(doc, primary_path));
        self.event_bulk.end_time = now_lwt();
        self.event_bulk.clone()
    }
}

fn missing_attachment(
    id: &str,
    row: &BulkWriteRow,
    in_db: Option<&DocumentData>,
    attachment_id: &str,
) -> WriteError {
    let mut err = WriteError::new(
        WriteErrorKind::MissingAttachmentData,
        id,
        row.clone(),
        in_db.cloned(),
    );
    err.attachment_id = Some(attachment_id.to_string());
    err
}

/// Classify a batch of rows against the stored state
///
/// `docs_in_db` must contain the current stored state of every id touched
/// by `rows`. Rows are processed in order; a row that touches an id written
/// earlier in the same batch sees that earlier write as the stored state.
/// Rows without a primary key are a programmer error and fail the batch.
pub fn categorize_bulk_write_rows(
    primary_path: &str,
    has_attachments: bool,
    docs_in_db: &BTreeMap<String, DocumentData>,
    rows: Vec<BulkWriteRow>,
    context: &str,
) -> Result<CategorizedWrites> {
    let start_time = now_lwt();
    let bulk_id = random_token(10);
    let mut overlay: BTreeMap<String, DocumentData> = BTreeMap::new();
    let mut out = CategorizedWrites {
        bulk_insert_docs: Vec::new(),
        bulk_update_docs: Vec::new(),
        errors: BTreeMap::new(),
        event_bulk: EventBulk {
            id: bulk_id.clone(),
            events: Vec::new(),
            checkpoint: None,
            context: context.to_string(),
            start_time,
            end_time: start_time,
        },
        attachments_add: Vec::new(),
        attachments_update: Vec::new(),
        attachments_remove: Vec::new(),
        newest_row: None,
    };

    for (row_index, row) in rows.into_iter().enumerate() {
        let id = row
            .document
            .primary(primary_path)
            .ok_or_else(|| {
                Error::validation(format!("write row has no primary key '{primary_path}'"))
            })?
            .to_string();

        let key_changed = row
            .previous
            .as_ref()
            .is_some_and(|previous| previous.primary(primary_path) != Some(id.as_str()));
        if key_changed {
            let in_db = overlay.get(&id).or_else(|| docs_in_db.get(&id)).cloned();
            let err = WriteError::new(WriteErrorKind::PrimaryKeyChanged, &id, row, in_db);
            out.errors.insert(id, err);
            continue;
        }

        let in_db = overlay.get(&id).or_else(|| docs_in_db.get(&id));
        let stored = row.document.without_attachment_data();

        let Some(in_db) = in_db else {
            // Tombstones may be inserted directly, replication does this.
            if has_attachments {
                if let Some((attachment_id, _)) =
                    row.document.attachments.iter().find(|(_, a)| a.data.is_none())
                {
                    let err = missing_attachment(&id, &row, None, attachment_id);
                    out.errors.insert(id, err);
                    continue;
                }
                out.attachments_add
                    .extend(row.document.attachments.iter().map(|(attachment_id, a)| {
                        AttachmentWrite {
                            document_id: id.clone(),
                            attachment_id: attachment_id.clone(),
                            attachment: a.clone(),
                        }
                    }));
            }
            if !row.document.deleted {
                out.event_bulk.events.push(ChangeEvent {
                    event_id: event_key(&bulk_id, row_index, &id, &stored.rev),
                    document_id: id.clone(),
                    operation: Operation::Insert,
                    document_data: stored.clone(),
                    previous_document_data: None,
                });
            }
            track_newest(&mut out.newest_row, &stored);
            overlay.insert(id.clone(), stored.clone());
            out.bulk_insert_docs.push(CategorizedRow {
                id,
                document: stored,
                replaces: None,
            });
            continue;
        };

        let stale = match &row.previous {
            Some(previous) => previous.rev != in_db.rev,
            None => true,
        };
        if stale {
            let err = WriteError::new(WriteErrorKind::Conflict, &id, row, Some(in_db.clone()));
            out.errors.insert(id, err);
            continue;
        }
        let in_db = in_db.clone();

        if has_attachments {
            if row.document.deleted {
                out.attachments_remove
                    .extend(in_db.attachments.iter().map(|(attachment_id, a)| AttachmentRemove {
                        document_id: id.clone(),
                        attachment_id: attachment_id.clone(),
                        digest: a.digest.clone(),
                    }));
            } else {
                if let Some((attachment_id, _)) = row
                    .document
                    .attachments
                    .iter()
                    .find(|(key, a)| a.data.is_none() && !in_db.attachments.contains_key(*key))
                {
                    let err = missing_attachment(&id, &row, Some(&in_db), attachment_id);
                    out.errors.insert(id, err);
                    continue;
                }
                diff_attachments(&id, &row.document, &in_db, &mut out);
            }
        }

        let previous_stripped = row.previous.as_ref().map(DocumentData::without_attachment_data);
        let (operation, previous_document_data) = match (in_db.deleted, stored.deleted) {
            (true, false) => (Operation::Insert, None),
            (false, false) => (Operation::Update, previous_stripped),
            (_, true) => (Operation::Delete, previous_stripped),
        };
        out.event_bulk.events.push(ChangeEvent {
            event_id: event_key(&bulk_id, row_index, &id, &stored.rev),
            document_id: id.clone(),
            operation,
            document_data: stored.clone(),
            previous_document_data,
        });
        track_newest(&mut out.newest_row, &stored);
        overlay.insert(id.clone(), stored.clone());
        out.bulk_update_docs.push(CategorizedRow {
            id,
            document: stored,
            replaces: Some(in_db),
        });
    }

    Ok(out)
}

fn diff_attachments(
    id: &str,
    document: &DocumentData,
    in_db: &DocumentData,
    out: &mut CategorizedWrites,
) {
    for (attachment_id, attachment) in &document.attachments {
        match in_db.attachments.get(attachment_id) {
            None => out.attachments_add.push(AttachmentWrite {
                document_id: id.to_string(),
                attachment_id: attachment_id.clone(),
                attachment: attachment.clone(),
            }),
            Some(existing) if attachment.data.is_some() && existing.digest != attachment.digest => {
                out.attachments_update.push(AttachmentWrite {
                    document_id: id.to_string(),
                    attachment_id: attachment_id.clone(),
                    attachment: attachment.clone(),
                })
            }
            Some(_) => {}
        }
    }
    for (attachment_id, existing) in &in_db.attachments {
        if !document.attachments.contains_key(attachment_id) {
            out.attachments_remove.push(AttachmentRemove {
                document_id: id.to_string(),
                attachment_id: attachment_id.clone(),
                digest: existing.digest.clone(),
            });
        }
    }
}

fn track_newest(newest: &mut Option<DocumentData>, doc: &DocumentData) {
    if newest.as_ref().is_none_or(|n| n.meta.lwt <= doc.meta.lwt) {
        *newest = Some(doc.clone());
    }
}

fn event_key(bulk_id: &str, row_index: usize, id: &str, rev: &str) -> String {
    format!("{bulk_id}|{row_index}|{id}|{rev}")
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn doc(value: serde_json::Value) -> DocumentData {
        DocumentData::from_value(value).unwrap()
    }

    fn stored(id: &str, rev: &str, lwt: f64) -> DocumentData {
        doc(json!({ "id": id, "v": 1, "_rev": rev, "_meta": { "lwt": lwt } }))
    }

    #[test]
    fn test_insert_update_conflict() {
        let mut db = BTreeMap::new();
        db.insert("b".to_string(), stored("b", "1-x", 1.0));
        db.insert("c".to_string(), stored("c", "2-x", 2.0));

        let rows = vec![
            BulkWriteRow::insert(stored("a", "1-x", 5.0)),
            BulkWriteRow::update(stored("b", "1-x", 1.0), stored("b", "2-x", 6.0)),
            BulkWriteRow::update(stored("c", "1-x", 1.0), stored("c", "2-y", 7.0)),
        ];
        let out = categorize_bulk_write_rows("id", false, &db, rows, "test").unwrap();

        assert_eq!(out.bulk_insert_docs.len(), 1);
        assert_eq!(out.bulk_update_docs.len(), 1);
        assert_eq!(out.errors.keys().collect::<Vec<_>>(), vec!["c"]);
        assert_eq!(out.errors["c"].status, 409);
        assert_eq!(out.errors["c"].document_in_db.as_ref().unwrap().rev, "2-x");
        assert_eq!(out.event_bulk.events.len(), 2);
        assert_eq!(out.newest_row.as_ref().unwrap().meta.lwt, 6.0);
    }

    #[test]
    fn test_blind_insert_over_existing_conflicts() {
        let mut db = BTreeMap::new();
        db.insert("a".to_string(), stored("a", "1-x", 1.0));
        let out = categorize_bulk_write_rows(
            "id",
            false,
            &db,
            vec![BulkWriteRow::insert(stored("a", "1-y", 2.0))],
            "test",
        )
        .unwrap();
        assert_eq!(out.errors["a"].kind, WriteErrorKind::Conflict);
        assert!(!out.has_writes());
    }

    #[test]
    fn test_operations() {
        let mut db = BTreeMap::new();
        let mut tomb = stored("t", "2-x", 1.0);
        tomb.deleted = true;
        db.insert("t".to_string(), tomb.clone());
        db.insert("u".to_string(), stored("u", "1-x", 1.0));

        let mut deleted_u = stored("u", "2-x", 3.0);
        deleted_u.deleted = true;
        let mut inserted_tomb = stored("n", "1-x", 4.0);
        inserted_tomb.deleted = true;
        let rows = vec![
            BulkWriteRow::update(tomb, stored("t", "3-x", 2.0)),
            BulkWriteRow::update(stored("u", "1-x", 1.0), deleted_u),
            BulkWriteRow::insert(inserted_tomb),
        ];
        let out = categorize_bulk_write_rows("id", false, &db, rows, "test").unwrap();
        let ops: Vec<_> = out.event_bulk.events.iter().map(|e| e.operation).collect();
        assert_eq!(ops, vec![Operation::Insert, Operation::Delete]);
        assert_eq!(out.bulk_insert_docs.len(), 1);
        assert_eq!(out.bulk_update_docs.len(), 2);
    }

    #[test]
    fn test_same_id_twice_in_batch() {
        let db = BTreeMap::new();
        let first = stored("a", "1-x", 1.0);
        let rows = vec![
            BulkWriteRow::insert(first.clone()),
            BulkWriteRow::update(first, stored("a", "2-x", 2.0)),
        ];
        let out = categorize_bulk_write_rows("id", false, &db, rows, "test").unwrap();
        assert!(out.errors.is_empty());
        assert_eq!(out.bulk_update_docs[0].replaces.as_ref().unwrap().rev, "1-x");
    }

    #[test]
    fn test_primary_key_change_rejected() {
        let mut db = BTreeMap::new();
        db.insert("a".to_string(), stored("a", "1-x", 1.0));
        let rows = vec![BulkWriteRow::update(stored("a", "1-x", 1.0), stored("z", "2-x", 2.0))];
        let out = categorize_bulk_write_rows("id", false, &db, rows, "test").unwrap();
        assert_eq!(out.errors["z"].status, 422);
    }

    #[test]
    fn test_missing_attachment_data() {
        let db = BTreeMap::new();
        let row = BulkWriteRow::insert(doc(json!({
            "id": "a",
            "_rev": "1-x",
            "_attachments": { "f": { "digest": "d", "length": 1, "type": "text/plain" } }
        })));
        let out = categorize_bulk_write_rows("id", true, &db, vec![row], "test").unwrap();
        assert_eq!(out.errors["a"].status, 510);
        assert_eq!(out.errors["a"].attachment_id.as_deref(), Some("f"));
    }

    #[test]
    fn test_attachment_diff() {
        let mut db = BTreeMap::new();
        let previous = doc(json!({
            "id": "a",
            "_rev": "1-x",
            "_attachments": {
                "keep": { "digest": "k", "length": 1, "type": "text/plain" },
                "gone": { "digest": "g", "length": 1, "type": "text/plain" },
                "edit": { "digest": "e1", "length": 1, "type": "text/plain" }
            }
        }));
        db.insert("a".to_string(), previous.clone());
        let next = doc(json!({
            "id": "a",
            "_rev": "2-x",
            "_attachments": {
                "keep": { "digest": "k", "length": 1, "type": "text/plain" },
                "edit": { "digest": "e2", "length": 1, "type": "text/plain", "data": "YQ==" },
                "new": { "digest": "n", "length": 1, "type": "text/plain", "data": "Yg==" }
            }
        }));
        let out = categorize_bulk_write_rows(
            "id",
            true,
            &db,
            vec![BulkWriteRow::update(previous, next)],
            "test",
        )
        .unwrap();
        assert_eq!(out.attachments_add[0].attachment_id, "new");
        assert_eq!(out.attachments_update[0].attachment_id, "edit");
        assert_eq!(out.attachments_remove[0].attachment_id, "gone");
        assert!(
            out.bulk_update_docs[0]
                .document
                .attachments
                .values()
                .all(|a| a.data.is_none())
        );
    }
}
