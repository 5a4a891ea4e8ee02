//! In-memory storage backend
//!
//! Documents live in a hash map; every storage index is an ordered
//! `BTreeMap<index string, primary key>`. Instances opened with the same
//! `(database, collection, version)` share one state through the factory's
//! registry. The state is dropped when its last instance closes.

use crate::document::{AttachmentData, Checkpoint, DocumentData};
use crate::index::IndexEncoder;
use crate::query::PreparedQuery;
use crate::schema::Schema;
use crate::storage::categorize::{CategorizedRow, categorize_bulk_write_rows};
use crate::storage::{
    BulkWriteResponse, BulkWriteRow, ChangeStream, ChangedDocuments, CountMode, CountResult,
    EventBulk, HandleRegistry, Storage, StorageInstance, StorageInstanceParams, attachment_key,
    changes_range, cleanup_range, cleanup_threshold, plan_index, plan_range,
};
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::RwLock;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info};

struct MemoryIndex {
    encoder: IndexEncoder,
    entries: BTreeMap<String, String>,
}

struct MemoryInner {
    documents: HashMap<String, DocumentData>,
    attachments: HashMap<String, AttachmentData>,
    indexes: Vec<MemoryIndex>,
}

impl MemoryInner {
    fn new(schema: &Schema) -> Result<Self> {
        let indexes = schema
            .storage_indexes()
            .iter()
            .map(|fields| {
                Ok(MemoryIndex {
                    encoder: IndexEncoder::new(schema, fields)?,
                    entries: BTreeMap::new(),
                })
            })
            .collect::<Result<Vec<_>>>()?;
        Ok(Self {
            documents: HashMap::new(),
            attachments: HashMap::new(),
            indexes,
        })
    }

    fn index(&self, fields: &[String]) -> Result<&MemoryIndex> {
        self.indexes
            .iter()
            .find(|index| index.encoder.fields() == fields)
            .ok_or_else(|| Error::query(format!("index {fields:?} is not maintained")))
    }

    fn remove_from_indexes(&mut self, id: &str, doc: &DocumentData) -> Result<()> {
        for index in &mut self.indexes {
            let key = index.encoder.encode(doc);
            if index.entries.remove(&key).is_none() {
                return Err(Error::internal(format!(
                    "document '{id}' missing from index {:?}",
                    index.encoder.fields()
                )));
            }
        }
        Ok(())
    }

    fn apply(&mut self, row: &CategorizedRow) -> Result<()> {
        if let Some(old) = &row.replaces {
            self.remove_from_indexes(&row.id, old)?;
        }
        for index in &mut self.indexes {
            index
                .entries
                .insert(index.encoder.encode(&row.document), row.id.clone());
        }
        self.documents.insert(row.id.clone(), row.document.clone());
        Ok(())
    }

    fn ids_in_range<'a>(
        &'a self,
        index: &'a MemoryIndex,
        range: Option<(std::ops::Bound<String>, std::ops::Bound<String>)>,
    ) -> impl Iterator<Item = &'a DocumentData> + 'a {
        range
            .into_iter()
            .flat_map(move |range| index.entries.range(range).map(|(_, id)| id))
            .filter_map(move |id| self.documents.get(id))
    }
}

struct MemoryState {
    inner: RwLock<MemoryInner>,
    events: broadcast::Sender<Arc<EventBulk>>,
}

/// Factory of in-memory instances
#[derive(Default)]
pub struct MemoryStorage {
    registry: Arc<HandleRegistry<String, Arc<MemoryState>>>,
}

impl MemoryStorage {
    /// Create a factory with its own registry
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of live shared states
    pub fn open_states(&self) -> usize {
        self.registry.len()
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    fn name(&self) -> &'static str {
        "memory"
    }

    async fn create_storage_instance(
        &self,
        params: StorageInstanceParams,
    ) -> Result<Arc<dyn StorageInstance>> {
        params.validate()?;
        let key = params.instance_key();
        let state = self.registry.acquire_or_insert_with(key.clone(), || {
            let (events, _) = broadcast::channel(params.options.change_stream_capacity.max(1));
            Ok(Arc::new(MemoryState {
                inner: RwLock::new(MemoryInner::new(&params.schema)?),
                events,
            }))
        })?;
        debug!("opened memory instance {}", key);
        Ok(Arc::new(MemoryStorageInstance {
            primary_path: params.schema.primary_path().to_string(),
            params,
            key,
            state,
            registry: self.registry.clone(),
            closed: AtomicBool::new(false),
        }))
    }
}

/// One logical instance over a shared in-memory state
pub struct MemoryStorageInstance {
    params: StorageInstanceParams,
    primary_path: String,
    key: String,
    state: Arc<MemoryState>,
    registry: Arc<HandleRegistry<String, Arc<MemoryState>>>,
    closed: AtomicBool,
}

impl MemoryStorageInstance {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::closed(self.key.clone()));
        }
        Ok(())
    }

    fn write(&self, rows: Vec<BulkWriteRow>, context: &str) -> Result<BulkWriteResponse> {
        let mut inner = self.state.inner.write();
        let docs_in_db: BTreeMap<String, DocumentData> = rows
            .iter()
            .filter_map(|row| row.document.primary(&self.primary_path))
            .filter_map(|id| inner.documents.get(id).map(|d| (id.to_string(), d.clone())))
            .collect();
        let mut categorized = categorize_bulk_write_rows(
            &self.primary_path,
            self.params.schema.has_attachments(),
            &docs_in_db,
            rows,
            context,
        )?;

        for row in categorized.accepted() {
            inner.apply(row)?;
        }
        for write in categorized
            .attachments_add
            .iter()
            .chain(&categorized.attachments_update)
        {
            inner.attachments.insert(
                attachment_key(&write.document_id, &write.attachment_id),
                write.attachment.clone(),
            );
        }
        for remove in &categorized.attachments_remove {
            inner
                .attachments
                .remove(&attachment_key(&remove.document_id, &remove.attachment_id));
        }

        let response = BulkWriteResponse {
            success: categorized
                .accepted()
                .map(|row| (row.id.clone(), row.document.clone()))
                .collect(),
            error: std::mem::take(&mut categorized.errors),
        };
        if categorized.has_writes() {
            let bulk = categorized.finish_event_bulk(&self.primary_path);
            // Sending while holding the lock keeps bulks in commit order.
            let _ = self.state.events.send(Arc::new(bulk));
        }
        Ok(response)
    }

    fn run_query(&self, query: &PreparedQuery) -> Result<Vec<DocumentData>> {
        let inner = self.state.inner.read();
        let index = inner.index(&plan_index(&query.plan))?;
        let range = plan_range(&index.encoder, &query.plan);
        let docs: Vec<DocumentData> = inner
            .ids_in_range(index, range)
            .filter(|doc| query.accepts(doc))
            .take(query.traversal_limit())
            .cloned()
            .collect();
        Ok(query.execute(docs))
    }

    fn run_count(&self, query: &PreparedQuery) -> Result<CountResult> {
        let inner = self.state.inner.read();
        let index = inner.index(&plan_index(&query.plan))?;
        let range = plan_range(&index.encoder, &query.plan);
        if query.plan.selector_satisfied_by_index {
            let count = range.map_or(0, |range| index.entries.range(range).count());
            return Ok(CountResult {
                count,
                mode: CountMode::Fast,
            });
        }
        let count = inner
            .ids_in_range(index, range)
            .filter(|d| query.accepts(d))
            .count();
        Ok(CountResult {
            count,
            mode: CountMode::Slow,
        })
    }

    fn changes_since(&self, limit: usize, checkpoint: Option<&Checkpoint>) -> Result<ChangedDocuments> {
        let inner = self.state.inner.read();
        let index = inner.index(&self.params.schema.changes_index())?;
        let documents: Vec<DocumentData> = inner
            .ids_in_range(index, changes_range(&index.encoder, checkpoint))
            .take(limit)
            .cloned()
            .collect();
        let checkpoint = documents
            .last()
            .and_then(|doc| Checkpoint::of(doc, &self.primary_path))
            .or_else(|| checkpoint.cloned());
        Ok(ChangedDocuments {
            documents,
            checkpoint,
        })
    }

    fn purge_tombstones(&self, minimum_deleted_age: Duration) -> Result<bool> {
        let batch_size = self.params.options.cleanup_batch_size.max(1);
        let mut inner = self.state.inner.write();
        let index = inner.index(&self.params.schema.cleanup_index())?;
        let range = cleanup_range(&index.encoder, cleanup_threshold(minimum_deleted_age));
        let purge: Vec<DocumentData> = inner
            .ids_in_range(index, range)
            .take(batch_size)
            .cloned()
            .collect();
        for doc in &purge {
            let Some(id) = doc.primary(&self.primary_path).map(str::to_string) else {
                continue;
            };
            inner.remove_from_indexes(&id, doc)?;
            inner.documents.remove(&id);
            for attachment_id in doc.attachments.keys() {
                inner.attachments.remove(&attachment_key(&id, attachment_id));
            }
        }
        debug!("purged {} tombstones from {}", purge.len(), self.key);
        Ok(purge.len() < batch_size)
    }
}

#[async_trait]
impl StorageInstance for MemoryStorageInstance {
    fn database_name(&self) -> &str {
        &self.params.database_name
    }

    fn collection_name(&self) -> &str {
        &self.params.collection_name
    }

    fn schema(&self) -> &Arc<Schema> {
        &self.params.schema
    }

    async fn bulk_write(
        &self,
        rows: Vec<BulkWriteRow>,
        context: &str,
    ) -> Result<BulkWriteResponse> {
        self.ensure_open()?;
        if rows.is_empty() {
            return Ok(BulkWriteResponse::default());
        }
        self.write(rows, context)
    }

    async fn find_documents_by_id(
        &self,
        ids: &[String],
        with_deleted: bool,
    ) -> Result<BTreeMap<String, DocumentData>> {
        self.ensure_open()?;
        let inner = self.state.inner.read();
        Ok(ids
            .iter()
            .filter_map(|id| inner.documents.get(id).map(|d| (id.clone(), d)))
            .filter(|(_, d)| with_deleted || !d.deleted)
            .map(|(id, d)| (id, d.clone()))
            .collect())
    }

    async fn query(&self, query: &PreparedQuery) -> Result<Vec<DocumentData>> {
        self.ensure_open()?;
        self.run_query(query)
    }

    async fn count(&self, query: &PreparedQuery) -> Result<CountResult> {
        self.ensure_open()?;
        self.run_count(query)
    }

    async fn get_changed_documents_since(
        &self,
        limit: usize,
        checkpoint: Option<&Checkpoint>,
    ) -> Result<ChangedDocuments> {
        self.ensure_open()?;
        self.changes_since(limit, checkpoint)
    }

    fn change_stream(&self) -> ChangeStream {
        ChangeStream::new(self.state.events.subscribe())
    }

    async fn get_attachment_data(&self, document_id: &str, attachment_id: &str) -> Result<String> {
        self.ensure_open()?;
        let inner = self.state.inner.read();
        inner
            .attachments
            .get(&attachment_key(document_id, attachment_id))
            .and_then(|a| a.data.clone())
            .ok_or_else(|| {
                Error::not_found(format!("attachment '{attachment_id}' of '{document_id}'"))
            })
    }

    async fn cleanup(&self, minimum_deleted_age: Duration) -> Result<bool> {
        self.ensure_open()?;
        self.purge_tombstones(minimum_deleted_age)
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if self.registry.release(&self.key).is_some() {
            info!("dropped memory state {}", self.key);
        }
        Ok(())
    }

    async fn remove(&self) -> Result<()> {
        self.ensure_open()?;
        {
            let mut inner = self.state.inner.write();
            *inner = MemoryInner::new(&self.params.schema)?;
        }
        self.registry.remove(&self.key);
        info!("removed memory instance {}", self.key);
        self.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::{MangoQuery, prepare_query};
    use crate::storage::{get_single_document, write_single};
    use serde_json::json;

    fn schema() -> Schema {
        Schema::from_value(json!({
            "version": 0,
            "primaryKey": "id",
            "properties": {
                "id": { "type": "string", "maxLength": 20 },
                "age": { "type": "integer", "minimum": 0, "maximum": 150 }
            },
            "indexes": ["age"]
        }))
        .unwrap()
    }

    fn doc(id: &str, age: u32, rev: &str) -> DocumentData {
        let mut doc = DocumentData::from_value(json!({ "id": id, "age": age })).unwrap();
        doc.rev = rev.to_string();
        doc.meta.lwt = crate::document::now_lwt();
        doc
    }

    async fn instance(storage: &MemoryStorage) -> Arc<dyn StorageInstance> {
        storage
            .create_storage_instance(StorageInstanceParams::new("db", "people", schema()))
            .await
            .unwrap()
    }

    #[tokio::test]
    async fn test_instances_share_state() {
        let storage = MemoryStorage::new();
        let a = instance(&storage).await;
        let b = instance(&storage).await;
        write_single(a.as_ref(), BulkWriteRow::insert(doc("x", 3, "1-a")), "test")
            .await
            .unwrap();
        assert!(get_single_document(b.as_ref(), "x").await.unwrap().is_some());

        a.close().await.unwrap();
        a.close().await.unwrap();
        assert_eq!(storage.open_states(), 1);
        b.close().await.unwrap();
        assert_eq!(storage.open_states(), 0);

        let c = instance(&storage).await;
        assert!(get_single_document(c.as_ref(), "x").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_closed_instance_rejects_calls() {
        let storage = MemoryStorage::new();
        let a = instance(&storage).await;
        a.close().await.unwrap();
        let err = a
            .bulk_write(vec![BulkWriteRow::insert(doc("x", 1, "1-a"))], "test")
            .await
            .unwrap_err();
        assert!(matches!(err, Error::Closed(_)));
    }

    #[tokio::test]
    async fn test_query_uses_index_range() {
        let storage = MemoryStorage::new();
        let a = instance(&storage).await;
        let rows = [("a", 10), ("b", 20), ("c", 30), ("d", 40)]
            .into_iter()
            .map(|(id, age)| BulkWriteRow::insert(doc(id, age, "1-a")))
            .collect();
        a.bulk_write(rows, "test").await.unwrap();

        let query = MangoQuery::from_value(json!({
            "selector": { "age": { "$gt": 10, "$lte": 30 } }
        }))
        .unwrap();
        let prepared = prepare_query(a.schema(), query).unwrap();
        let ids: Vec<String> = a
            .query(&prepared)
            .await
            .unwrap()
            .iter()
            .map(|d| d.primary("id").unwrap().to_string())
            .collect();
        assert_eq!(ids, vec!["b", "c"]);
        assert_eq!(a.count(&prepared).await.unwrap().mode, CountMode::Fast);
    }
}
