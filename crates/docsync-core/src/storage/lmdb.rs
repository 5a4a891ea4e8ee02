//! LMDB storage backend (heed)
//!
//! One LMDB environment per database directory, shared by every instance
//! of that database through the factory's registry. Each collection
//! version gets its own named databases:
//!
//! - `<collection>-<version>|docs`: primary key to document
//! - `<collection>-<version>|attachments`: `<doc>||<attachment>` to payload
//! - `<collection>-<version>|idx|<fields>`: index string to primary key
//!
//! Writes of one environment run through a single [`TaskQueue`]; each
//! bulk write is one LMDB write transaction, so readers see whole batches.

use crate::document::{AttachmentData, Checkpoint, DocumentData};
use crate::index::IndexEncoder;
use crate::query::PreparedQuery;
use crate::schema::Schema;
use crate::storage::categorize::categorize_bulk_write_rows;
use crate::storage::{
    BulkWriteResponse, BulkWriteRow, ChangeStream, ChangedDocuments, CountMode, CountResult,
    EventBulk, HandleRegistry, Storage, StorageInstance, StorageInstanceParams, TaskQueue,
    attachment_key, changes_range, cleanup_range, cleanup_threshold, plan_index, plan_range,
};
use crate::{Error, Result};
use async_trait::async_trait;
use heed::types::{SerdeJson, Str};
use heed::{Database, Env, EnvOpenOptions, RoTxn};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::ops::Bound;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;
use tokio::sync::broadcast;
use tracing::{debug, info};

/// Default LMDB map size (256 MiB)
pub const DEFAULT_MAP_SIZE: usize = 256 * 1024 * 1024;
/// Default maximum number of named databases per environment
pub const DEFAULT_MAX_DBS: u32 = 256;

type DocsDb = Database<Str, SerdeJson<DocumentData>>;
type AttachmentsDb = Database<Str, SerdeJson<AttachmentData>>;
type IndexDb = Database<Str, Str>;

/// Shared per-directory LMDB handle
struct LmdbEnvironment {
    env: Env,
    writes: TaskQueue,
    channels: Mutex<HashMap<String, broadcast::Sender<Arc<EventBulk>>>>,
}

impl LmdbEnvironment {
    fn open(path: &Path, map_size: usize, max_dbs: u32) -> Result<Self> {
        std::fs::create_dir_all(path)?;
        let env = unsafe {
            EnvOpenOptions::new()
                .map_size(map_size)
                .max_dbs(max_dbs)
                .open(path)?
        };
        info!("opened LMDB environment at {}", path.display());
        Ok(Self {
            env,
            writes: TaskQueue::new(),
            channels: Mutex::new(HashMap::new()),
        })
    }

    fn channel(&self, key: &str, capacity: usize) -> broadcast::Sender<Arc<EventBulk>> {
        self.channels
            .lock()
            .entry(key.to_string())
            .or_insert_with(|| broadcast::channel(capacity.max(1)).0)
            .clone()
    }
}

struct LmdbIndex {
    encoder: IndexEncoder,
    db: IndexDb,
}

/// Factory of LMDB-backed instances
pub struct LmdbStorage {
    base_dir: PathBuf,
    map_size: usize,
    max_dbs: u32,
    registry: Arc<HandleRegistry<PathBuf, Arc<LmdbEnvironment>>>,
}

impl LmdbStorage {
    /// Factory storing each database under `base_dir/<database name>`
    pub fn new<P: AsRef<Path>>(base_dir: P) -> Self {
        Self::with_options(base_dir, DEFAULT_MAP_SIZE, DEFAULT_MAX_DBS)
    }

    /// Factory with explicit LMDB sizing
    pub fn with_options<P: AsRef<Path>>(base_dir: P, map_size: usize, max_dbs: u32) -> Self {
        Self {
            base_dir: base_dir.as_ref().to_path_buf(),
            map_size,
            max_dbs,
            registry: Arc::new(HandleRegistry::new()),
        }
    }

    /// Number of open environments
    pub fn open_environments(&self) -> usize {
        self.registry.len()
    }
}

#[async_trait]
impl Storage for LmdbStorage {
    fn name(&self) -> &'static str {
        "lmdb"
    }

    async fn create_storage_instance(
        &self,
        params: StorageInstanceParams,
    ) -> Result<Arc<dyn StorageInstance>> {
        params.validate()?;
        let path = self.base_dir.join(&params.database_name);
        let env = self.registry.acquire_or_insert_with(path.clone(), || {
            LmdbEnvironment::open(&path, self.map_size, self.max_dbs).map(Arc::new)
        })?;

        let opened = open_collection(&env, &params);
        let (docs, attachments, indexes) = match opened {
            Ok(dbs) => dbs,
            Err(err) => {
                self.registry.release(&path);
                return Err(err);
            }
        };
        let key = params.instance_key();
        let events = env.channel(&key, params.options.change_stream_capacity);
        debug!("opened LMDB instance {}", key);

        Ok(Arc::new(LmdbStorageInstance {
            primary_path: params.schema.primary_path().to_string(),
            params,
            key,
            path,
            env,
            docs,
            attachments,
            indexes,
            events,
            registry: self.registry.clone(),
            closed: AtomicBool::new(false),
        }))
    }
}

fn open_collection(
    env: &LmdbEnvironment,
    params: &StorageInstanceParams,
) -> Result<(DocsDb, AttachmentsDb, Vec<LmdbIndex>)> {
    let prefix = format!("{}-{}", params.collection_name, params.schema.version);
    let mut wtxn = env.env.write_txn()?;
    let docs: DocsDb = env
        .env
        .create_database(&mut wtxn, Some(&format!("{prefix}|docs")))?;
    let attachments: AttachmentsDb = env
        .env
        .create_database(&mut wtxn, Some(&format!("{prefix}|attachments")))?;
    let mut indexes = Vec::new();
    for fields in params.schema.storage_indexes() {
        let name = format!("{prefix}|idx|{}", fields.join(","));
        indexes.push(LmdbIndex {
            encoder: IndexEncoder::new(&params.schema, &fields)?,
            db: env.env.create_database(&mut wtxn, Some(&name))?,
        });
    }
    wtxn.commit()?;
    Ok((docs, attachments, indexes))
}

fn str_range(range: &(Bound<String>, Bound<String>)) -> (Bound<&str>, Bound<&str>) {
    (
        range.0.as_ref().map(String::as_str),
        range.1.as_ref().map(String::as_str),
    )
}

/// One logical instance over a shared LMDB environment
pub struct LmdbStorageInstance {
    params: StorageInstanceParams,
    primary_path: String,
    key: String,
    path: PathBuf,
    env: Arc<LmdbEnvironment>,
    docs: DocsDb,
    attachments: AttachmentsDb,
    indexes: Vec<LmdbIndex>,
    events: broadcast::Sender<Arc<EventBulk>>,
    registry: Arc<HandleRegistry<PathBuf, Arc<LmdbEnvironment>>>,
    closed: AtomicBool,
}

impl LmdbStorageInstance {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::closed(self.key.clone()));
        }
        Ok(())
    }

    fn index(&self, fields: &[String]) -> Result<&LmdbIndex> {
        self.indexes
            .iter()
            .find(|index| index.encoder.fields() == fields)
            .ok_or_else(|| Error::query(format!("index {fields:?} is not maintained")))
    }

    /// Documents referenced by an index range, in index order
    fn docs_in_range(
        &self,
        rtxn: &RoTxn,
        index: &LmdbIndex,
        range: Option<(Bound<String>, Bound<String>)>,
        limit: usize,
    ) -> Result<Vec<DocumentData>> {
        self.docs_in_range_where(rtxn, index, range, limit, |_| true)
    }

    /// Like `docs_in_range`, keeping only documents `keep` accepts; `limit`
    /// counts kept documents
    fn docs_in_range_where(
        &self,
        rtxn: &RoTxn,
        index: &LmdbIndex,
        range: Option<(Bound<String>, Bound<String>)>,
        limit: usize,
        keep: impl Fn(&DocumentData) -> bool,
    ) -> Result<Vec<DocumentData>> {
        let Some(range) = range else {
            return Ok(Vec::new());
        };
        let mut docs = Vec::new();
        for entry in index.db.range(rtxn, &str_range(&range))? {
            if docs.len() >= limit {
                break;
            }
            let (_, id) = entry?;
            let doc = self.docs.get(rtxn, id)?.ok_or_else(|| {
                Error::internal(format!("index entry points to missing document '{id}'"))
            })?;
            if keep(&doc) {
                docs.push(doc);
            }
        }
        Ok(docs)
    }

    /// Entries in an index range, without reading documents
    fn entries_in_range(
        &self,
        rtxn: &RoTxn,
        index: &LmdbIndex,
        range: Option<(Bound<String>, Bound<String>)>,
    ) -> Result<usize> {
        let Some(range) = range else {
            return Ok(0);
        };
        let mut count = 0;
        for entry in index.db.range(rtxn, &str_range(&range))? {
            entry?;
            count += 1;
        }
        Ok(count)
    }

    fn write_sync(&self, rows: Vec<BulkWriteRow>, context: &str) -> Result<BulkWriteResponse> {
        let mut wtxn = self.env.env.write_txn()?;
        let mut docs_in_db = BTreeMap::new();
        for row in &rows {
            if let Some(id) = row.document.primary(&self.primary_path) {
                if let Some(doc) = self.docs.get(&wtxn, id)? {
                    docs_in_db.insert(id.to_string(), doc);
                }
            }
        }
        let mut categorized = categorize_bulk_write_rows(
            &self.primary_path,
            self.params.schema.has_attachments(),
            &docs_in_db,
            rows,
            context,
        )?;

        for row in categorized.accepted() {
            if let Some(old) = &row.replaces {
                for index in &self.indexes {
                    if !index.db.delete(&mut wtxn, &index.encoder.encode(old))? {
                        return Err(Error::internal(format!(
                            "document '{}' missing from index {:?}",
                            row.id,
                            index.encoder.fields()
                        )));
                    }
                }
            }
            for index in &self.indexes {
                index
                    .db
                    .put(&mut wtxn, &index.encoder.encode(&row.document), &row.id)?;
            }
            self.docs.put(&mut wtxn, &row.id, &row.document)?;
        }
        for write in categorized
            .attachments_add
            .iter()
            .chain(&categorized.attachments_update)
        {
            let key = attachment_key(&write.document_id, &write.attachment_id);
            self.attachments.put(&mut wtxn, &key, &write.attachment)?;
        }
        for remove in &categorized.attachments_remove {
            let key = attachment_key(&remove.document_id, &remove.attachment_id);
            self.attachments.delete(&mut wtxn, &key)?;
        }
        wtxn.commit()?;

        let response = BulkWriteResponse {
            success: categorized
                .accepted()
                .map(|row| (row.id.clone(), row.document.clone()))
                .collect(),
            error: std::mem::take(&mut categorized.errors),
        };
        if categorized.has_writes() {
            let bulk = categorized.finish_event_bulk(&self.primary_path);
            let _ = self.events.send(Arc::new(bulk));
        }
        Ok(response)
    }

    fn cleanup_sync(&self, minimum_deleted_age: Duration) -> Result<bool> {
        let batch_size = self.params.options.cleanup_batch_size.max(1);
        let mut wtxn = self.env.env.write_txn()?;
        let index = self.index(&self.params.schema.cleanup_index())?;
        let range = cleanup_range(&index.encoder, cleanup_threshold(minimum_deleted_age));
        let purge = self.docs_in_range(&wtxn, index, range, batch_size)?;
        for doc in &purge {
            let Some(id) = doc.primary(&self.primary_path) else {
                continue;
            };
            for index in &self.indexes {
                index.db.delete(&mut wtxn, &index.encoder.encode(doc))?;
            }
            self.docs.delete(&mut wtxn, id)?;
            for attachment_id in doc.attachments.keys() {
                self.attachments
                    .delete(&mut wtxn, &attachment_key(id, attachment_id))?;
            }
        }
        wtxn.commit()?;
        debug!("purged {} tombstones from {}", purge.len(), self.key);
        Ok(purge.len() < batch_size)
    }

    fn clear_sync(&self) -> Result<()> {
        let mut wtxn = self.env.env.write_txn()?;
        self.docs.clear(&mut wtxn)?;
        self.attachments.clear(&mut wtxn)?;
        for index in &self.indexes {
            index.db.clear(&mut wtxn)?;
        }
        wtxn.commit()?;
        Ok(())
    }
}

#[async_trait]
impl StorageInstance for LmdbStorageInstance {
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
        self.env
            .writes
            .run(move || async move { self.write_sync(rows, context) })
            .await
    }

    async fn find_documents_by_id(
        &self,
        ids: &[String],
        with_deleted: bool,
    ) -> Result<BTreeMap<String, DocumentData>> {
        self.ensure_open()?;
        let rtxn = self.env.env.read_txn()?;
        let mut found = BTreeMap::new();
        for id in ids {
            if let Some(doc) = self.docs.get(&rtxn, id)? {
                if with_deleted || !doc.deleted {
                    found.insert(id.clone(), doc);
                }
            }
        }
        Ok(found)
    }

    async fn query(&self, query: &PreparedQuery) -> Result<Vec<DocumentData>> {
        self.ensure_open()?;
        let rtxn = self.env.env.read_txn()?;
        let index = self.index(&plan_index(&query.plan))?;
        let docs = self.docs_in_range_where(
            &rtxn,
            index,
            plan_range(&index.encoder, &query.plan),
            query.traversal_limit(),
            |doc| query.accepts(doc),
        )?;
        Ok(query.execute(docs))
    }

    async fn count(&self, query: &PreparedQuery) -> Result<CountResult> {
        self.ensure_open()?;
        let rtxn = self.env.env.read_txn()?;
        let index = self.index(&plan_index(&query.plan))?;
        let range = plan_range(&index.encoder, &query.plan);
        if query.plan.selector_satisfied_by_index {
            return Ok(CountResult {
                count: self.entries_in_range(&rtxn, index, range)?,
                mode: CountMode::Fast,
            });
        }
        let matching =
            self.docs_in_range_where(&rtxn, index, range, usize::MAX, |doc| query.accepts(doc))?;
        Ok(CountResult {
            count: matching.len(),
            mode: CountMode::Slow,
        })
    }

    async fn get_changed_documents_since(
        &self,
        limit: usize,
        checkpoint: Option<&Checkpoint>,
    ) -> Result<ChangedDocuments> {
        self.ensure_open()?;
        let rtxn = self.env.env.read_txn()?;
        let index = self.index(&self.params.schema.changes_index())?;
        let documents = self.docs_in_range(
            &rtxn,
            index,
            changes_range(&index.encoder, checkpoint),
            limit,
        )?;
        let checkpoint = documents
            .last()
            .and_then(|doc| Checkpoint::of(doc, &self.primary_path))
            .or_else(|| checkpoint.cloned());
        Ok(ChangedDocuments {
            documents,
            checkpoint,
        })
    }

    fn change_stream(&self) -> ChangeStream {
        ChangeStream::new(self.events.subscribe())
    }

    async fn get_attachment_data(&self, document_id: &str, attachment_id: &str) -> Result<String> {
        self.ensure_open()?;
        let rtxn = self.env.env.read_txn()?;
        self.attachments
            .get(&rtxn, &attachment_key(document_id, attachment_id))?
            .and_then(|a| a.data)
            .ok_or_else(|| {
                Error::not_found(format!("attachment '{attachment_id}' of '{document_id}'"))
            })
    }

    async fn cleanup(&self, minimum_deleted_age: Duration) -> Result<bool> {
        self.ensure_open()?;
        self.env
            .writes
            .run(move || async move { self.cleanup_sync(minimum_deleted_age) })
            .await
    }

    async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        if self.registry.release(&self.path).is_some() {
            info!("closed LMDB environment at {}", self.path.display());
        }
        Ok(())
    }

    async fn remove(&self) -> Result<()> {
        self.ensure_open()?;
        self.env.writes.run(|| async { self.clear_sync() }).await?;
        info!("removed LMDB instance {}", self.key);
        self.close().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::{get_single_document, write_single};
    use crate::testing::TestContext;
    use serde_json::json;

    fn schema() -> Schema {
        Schema::from_value(json!({
            "version": 0,
            "primaryKey": "id",
            "properties": {
                "id": { "type": "string", "maxLength": 20 },
                "v": { "type": "integer", "minimum": 0, "maximum": 100 }
            }
        }))
        .unwrap()
    }

    fn doc(id: &str, v: u32) -> DocumentData {
        let mut doc = DocumentData::from_value(json!({ "id": id, "v": v })).unwrap();
        doc.rev = "1-a".to_string();
        doc.meta.lwt = crate::document::now_lwt();
        doc
    }

    #[tokio::test]
    async fn test_data_survives_reopen() {
        let ctx = TestContext::new();
        {
            let storage = LmdbStorage::with_options(ctx.path(), 16 * 1024 * 1024, 32);
            let instance = storage
                .create_storage_instance(StorageInstanceParams::new("db", "items", schema()))
                .await
                .unwrap();
            write_single(instance.as_ref(), BulkWriteRow::insert(doc("a", 1)), "test")
                .await
                .unwrap();
            instance.close().await.unwrap();
            assert_eq!(storage.open_environments(), 0);
        }
        let storage = LmdbStorage::with_options(ctx.path(), 16 * 1024 * 1024, 32);
        let instance = storage
            .create_storage_instance(StorageInstanceParams::new("db", "items", schema()))
            .await
            .unwrap();
        let stored = get_single_document(instance.as_ref(), "a").await.unwrap().unwrap();
        assert_eq!(stored.data["v"], json!(1));
        instance.remove().await.unwrap();
    }

    #[tokio::test]
    async fn test_environment_shared_between_collections() {
        let ctx = TestContext::new();
        let storage = LmdbStorage::with_options(ctx.path(), 16 * 1024 * 1024, 32);
        let a = storage
            .create_storage_instance(StorageInstanceParams::new("db", "a", schema()))
            .await
            .unwrap();
        let b = storage
            .create_storage_instance(StorageInstanceParams::new("db", "b", schema()))
            .await
            .unwrap();
        assert_eq!(storage.open_environments(), 1);
        write_single(a.as_ref(), BulkWriteRow::insert(doc("x", 1)), "test")
            .await
            .unwrap();
        assert!(get_single_document(b.as_ref(), "x").await.unwrap().is_none());
        a.close().await.unwrap();
        assert_eq!(storage.open_environments(), 1);
        b.close().await.unwrap();
        assert_eq!(storage.open_environments(), 0);
    }
}
