//! Collections and documents
//!
//! A [`Collection`] wraps the storage instance of one collection version.
//! Every write stamps a fresh revision (`create_revision` with the database
//! token) and a new `lwt`; reads hand out [`Document`] wrappers deduplicated
//! through a [`DocumentCache`], so two reads of the same revision return the
//! same `Arc`.

use crate::cache::{CachedDocument, DocumentCache};
use crate::config::{CleanupConfig, DatabaseConfig, ReplicationDefaults};
use crate::document::{AttachmentData, DocumentData, now_lwt};
use crate::local_documents::LocalDocuments;
use crate::query::{MangoQuery, prepare_count_query, prepare_query};
use crate::replication::{ReplicationMeta, ReplicationOptions, ReplicationState};
use crate::revision::create_revision;
use crate::schema::Schema;
use crate::storage::{
    BulkWriteRow, ChangeStream, Storage, StorageInstance, WriteError, get_single_document,
    write_single,
};
use crate::{Error, Result};
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde_json::{Map, Value};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, info};

/// Context of writes issued through the collection API
pub const COLLECTION_WRITE_CONTEXT: &str = "collection";
/// Attempts of an upsert or modify before giving up on concurrent writers
const WRITE_ATTEMPTS: usize = 8;

/// `sha256-<base64>` digest of an attachment payload
pub fn attachment_digest(payload: &[u8]) -> String {
    format!("sha256-{}", STANDARD.encode(Sha256::digest(payload)))
}

/// Outcome of [`Collection::bulk_insert`]
pub struct BulkInsertResult {
    /// Inserted documents in input order
    pub success: Vec<Arc<Document>>,
    /// Rejected rows
    pub error: Vec<WriteError>,
}

/// One collection of a database
pub struct Collection {
    name: String,
    database_name: String,
    token: String,
    instance: Arc<dyn StorageInstance>,
    storage: Arc<dyn Storage>,
    allow_slow_count: bool,
    cleanup: CleanupConfig,
    replication: ReplicationDefaults,
    cache: DocumentCache<Document>,
    local: OnceCell<LocalDocuments>,
    this: Weak<Collection>,
}

impl Collection {
    pub(crate) fn new(
        name: &str,
        database_name: &str,
        token: &str,
        instance: Arc<dyn StorageInstance>,
        storage: Arc<dyn Storage>,
        config: &DatabaseConfig,
    ) -> Arc<Self> {
        Arc::new_cyclic(|this| Self {
            name: name.to_string(),
            database_name: database_name.to_string(),
            token: token.to_string(),
            instance,
            storage,
            allow_slow_count: config.allow_slow_count,
            cleanup: config.cleanup.clone(),
            replication: config.replication.clone(),
            cache: DocumentCache::new(),
            local: OnceCell::new(),
            this: this.clone(),
        })
    }

    /// Collection name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Collection schema
    pub fn schema(&self) -> &Arc<Schema> {
        self.instance.schema()
    }

    /// Underlying storage instance
    pub fn storage_instance(&self) -> &Arc<dyn StorageInstance> {
        &self.instance
    }

    /// Document cache of this collection
    pub fn cache(&self) -> &DocumentCache<Document> {
        &self.cache
    }

    fn primary_path(&self) -> &str {
        self.instance.schema().primary_path()
    }

    fn wrap(&self, data: DocumentData) -> Result<Arc<Document>> {
        let primary = data
            .primary(self.primary_path())
            .ok_or_else(|| Error::internal("stored document without primary key"))?
            .to_string();
        let rev = data.rev.clone();
        Ok(self.cache.get_or_insert_with(&primary, &rev, || Document {
            collection: self.this.clone(),
            primary: primary.clone(),
            data,
        }))
    }

    /// Envelope for user fields, primary key filled in and checked
    fn new_document(&self, value: Value) -> Result<(String, DocumentData)> {
        let Value::Object(mut data) = value else {
            return Err(Error::validation(format!(
                "documents of '{}' must be JSON objects",
                self.name
            )));
        };
        if let Some(field) = data.keys().find(|key| key.starts_with('_')) {
            return Err(Error::validation(format!(
                "document field '{field}' is reserved for bookkeeping"
            )));
        }
        let id = self.schema().fill_primary_key(&mut data)?;
        Ok((id, DocumentData::new(data)))
    }

    /// Validate a new state and give it a revision and lwt
    fn stamp(&self, document: &mut DocumentData, previous: Option<&DocumentData>) -> Result<()> {
        if !document.deleted {
            self.schema().validate_document(&document.data)?;
        }
        document.rev = create_revision(&self.token, previous)?;
        document.meta.lwt = now_lwt();
        Ok(())
    }

    async fn write(&self, row: BulkWriteRow) -> Result<Arc<Document>> {
        let stored = write_single(self.instance.as_ref(), row, COLLECTION_WRITE_CONTEXT).await?;
        self.wrap(stored)
    }

    /// Insert a new document
    pub async fn insert(&self, value: Value) -> Result<Arc<Document>> {
        let (_, mut document) = self.new_document(value)?;
        self.stamp(&mut document, None)?;
        self.write(BulkWriteRow::insert(document)).await
    }

    /// Insert several documents in one storage write
    pub async fn bulk_insert(&self, values: Vec<Value>) -> Result<BulkInsertResult> {
        let mut ids = Vec::with_capacity(values.len());
        let mut rows = Vec::with_capacity(values.len());
        for value in values {
            let (id, mut document) = self.new_document(value)?;
            self.stamp(&mut document, None)?;
            ids.push(id);
            rows.push(BulkWriteRow::insert(document));
        }
        if rows.is_empty() {
            return Ok(BulkInsertResult {
                success: Vec::new(),
                error: Vec::new(),
            });
        }
        let mut response = self
            .instance
            .bulk_write(rows, COLLECTION_WRITE_CONTEXT)
            .await?;
        let mut success = Vec::with_capacity(response.success.len());
        for id in &ids {
            if let Some(stored) = response.success.remove(id) {
                success.push(self.wrap(stored)?);
            }
        }
        Ok(BulkInsertResult {
            success,
            error: response.error.into_values().collect(),
        })
    }

    /// Insert, or overwrite the current state of the same primary key
    pub async fn upsert(&self, value: Value) -> Result<Arc<Document>> {
        let (id, template) = self.new_document(value)?;
        for _ in 0..WRITE_ATTEMPTS {
            let previous = get_single_document(self.instance.as_ref(), &id).await?;
            let mut document = template.clone();
            if let Some(previous) = previous.as_ref().filter(|p| !p.deleted) {
                document.attachments = previous.attachments.clone();
            }
            self.stamp(&mut document, previous.as_ref())?;
            match self.write(BulkWriteRow { document, previous }).await {
                Ok(doc) => return Ok(doc),
                Err(err) if err.is_conflict() => {
                    debug!("Upsert of {} in {} conflicted, retrying", id, self.name);
                }
                Err(err) => return Err(err),
            }
        }
        Err(Error::validation(format!(
            "upsert of '{id}' kept conflicting after {WRITE_ATTEMPTS} attempts"
        )))
    }

    /// Non-deleted documents by primary key
    pub async fn find_by_ids(&self, ids: &[String]) -> Result<BTreeMap<String, Arc<Document>>> {
        let found = self.instance.find_documents_by_id(ids, false).await?;
        found
            .into_iter()
            .map(|(id, doc)| Ok((id, self.wrap(doc)?)))
            .collect()
    }

    /// Documents matching `query`
    pub async fn find(&self, query: MangoQuery) -> Result<Vec<Arc<Document>>> {
        let prepared = prepare_query(self.schema(), query)?;
        let docs = self.instance.query(&prepared).await?;
        docs.into_iter().map(|doc| self.wrap(doc)).collect()
    }

    /// First document matching `query`
    pub async fn find_one(&self, mut query: MangoQuery) -> Result<Option<Arc<Document>>> {
        query.limit = Some(1);
        Ok(self.find(query).await?.into_iter().next())
    }

    /// Number of documents matching `query`
    ///
    /// Counts the index cannot answer alone are refused unless the database
    /// config sets `allow_slow_count`.
    pub async fn count(&self, query: MangoQuery) -> Result<usize> {
        let prepared = prepare_count_query(self.schema(), query)?;
        if !prepared.plan.selector_satisfied_by_index && !self.allow_slow_count {
            return Err(Error::query(format!(
                "count on '{}' needs a full scan; the selector is not covered by an index \
                 and allow_slow_count is off",
                self.name
            )));
        }
        Ok(self.instance.count(&prepared).await?.count)
    }

    /// Soft-delete `id`; `None` when it does not exist
    pub async fn remove_by_id(&self, id: &str) -> Result<Option<Arc<Document>>> {
        match self.find_by_ids(&[id.to_string()]).await?.remove(id) {
            Some(doc) => Ok(Some(doc.remove().await?)),
            None => Ok(None),
        }
    }

    /// Purge tombstones older than `minimum_deleted_age` (the configured
    /// default when `None`) until none are left
    pub async fn cleanup(&self, minimum_deleted_age: Option<Duration>) -> Result<()> {
        let age = minimum_deleted_age.unwrap_or(self.cleanup.minimum_deleted_time);
        let mut rounds = 0usize;
        while !self.instance.cleanup(age).await? {
            rounds += 1;
        }
        debug!("Cleanup of {} done after {} rounds", self.name, rounds + 1);
        Ok(())
    }

    /// Live change events of this collection
    pub fn change_stream(&self) -> ChangeStream {
        self.instance.change_stream()
    }

    /// Start replicating this collection
    ///
    /// Checkpoints and assumed master states live in a meta instance keyed
    /// by `options.identifier`, so restarting with the same identifier
    /// resumes where the previous run stopped.
    pub async fn replicate(&self, options: ReplicationOptions) -> Result<ReplicationState> {
        let meta = ReplicationMeta::open(
            self.storage.as_ref(),
            &self.database_name,
            &self.name,
            &options.identifier,
        )
        .await?;
        ReplicationState::start(self.instance.clone(), meta, options)
    }

    /// Replication options with this database's defaults
    pub fn replication_options(&self, identifier: impl Into<String>) -> ReplicationOptions {
        ReplicationOptions::new(identifier, &self.replication)
    }

    /// Collection-level local documents
    pub async fn local_documents(&self) -> Result<&LocalDocuments> {
        self.local
            .get_or_try_init(|| {
                LocalDocuments::open(
                    self.storage.as_ref(),
                    &self.database_name,
                    &self.name,
                    &self.token,
                )
            })
            .await
    }

    /// Close the storage instance
    pub async fn close(&self) -> Result<()> {
        if let Some(local) = self.local.get() {
            local.close().await?;
        }
        self.cache.clear();
        self.instance.close().await?;
        info!("Closed collection {}", self.name);
        Ok(())
    }

    /// Delete every document and close
    pub async fn remove(&self) -> Result<()> {
        if let Some(local) = self.local.get() {
            local.remove_all().await?;
        }
        self.cache.clear();
        self.instance.remove().await?;
        info!("Removed collection {}", self.name);
        Ok(())
    }
}

/// Metadata of one attachment
#[derive(Debug, Clone, PartialEq)]
pub struct Attachment {
    /// Attachment id
    pub id: String,
    /// `sha256-<base64>` digest
    pub digest: String,
    /// Payload length in bytes
    pub length: u64,
    /// MIME type
    pub content_type: String,
}

/// Immutable view of one document revision
pub struct Document {
    collection: Weak<Collection>,
    primary: String,
    data: DocumentData,
}

impl CachedDocument for Document {
    fn revision(&self) -> &str {
        &self.data.rev
    }
}

impl std::fmt::Debug for Document {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Document")
            .field("primary", &self.primary)
            .field("rev", &self.data.rev)
            .field("deleted", &self.data.deleted)
            .finish()
    }
}

impl Document {
    /// Primary key
    pub fn primary(&self) -> &str {
        &self.primary
    }

    /// Revision of this state
    pub fn revision(&self) -> &str {
        &self.data.rev
    }

    /// Whether this state is a tombstone
    pub fn is_deleted(&self) -> bool {
        self.data.deleted
    }

    /// Stored envelope
    pub fn data(&self) -> &DocumentData {
        &self.data
    }

    /// User fields as JSON
    pub fn to_json(&self) -> Value {
        self.data.user_value()
    }

    /// Value at a dotted path
    pub fn get(&self, path: &str) -> Option<Value> {
        self.data.get_path(path).map(|value| value.into_owned())
    }

    fn collection(&self) -> Result<Arc<Collection>> {
        self.collection
            .upgrade()
            .ok_or_else(|| Error::closed(format!("collection of '{}' is gone", self.primary)))
    }

    /// Write `document` on top of this state
    async fn write_next(&self, mut document: DocumentData) -> Result<Arc<Document>> {
        let collection = self.collection()?;
        collection.stamp(&mut document, Some(&self.data))?;
        collection
            .write(BulkWriteRow::update(self.data.clone(), document))
            .await
    }

    /// Merge the top-level fields of `changes` into this state
    ///
    /// Fails with a conflict when this state is no longer the stored one.
    pub async fn patch(&self, changes: Value) -> Result<Arc<Document>> {
        let Value::Object(changes) = changes else {
            return Err(Error::validation("patch must be a JSON object"));
        };
        let mut document = self.data.clone();
        merge_fields(&mut document.data, changes)?;
        self.write_next(document).await
    }

    /// Apply `modifier` to the latest stored state, retrying on conflicts
    pub async fn modify<F>(&self, modifier: F) -> Result<Arc<Document>>
    where
        F: Fn(Value) -> Value + Send + Sync,
    {
        let collection = self.collection()?;
        let mut current = self.data.clone();
        for _ in 0..WRITE_ATTEMPTS {
            let Value::Object(fields) = modifier(current.user_value()) else {
                return Err(Error::validation("modifier must return a JSON object"));
            };
            let mut document = current.clone();
            document.data = fields;
            collection.stamp(&mut document, Some(&current))?;
            match collection
                .write(BulkWriteRow::update(current.clone(), document))
                .await
            {
                Ok(doc) => return Ok(doc),
                Err(err) => match err.as_conflict().and_then(|c| c.document_in_db.clone()) {
                    Some(in_db) if err.is_conflict() && !in_db.deleted => current = in_db,
                    _ => return Err(err),
                },
            }
        }
        Err(Error::validation(format!(
            "modify of '{}' kept conflicting after {WRITE_ATTEMPTS} attempts",
            self.primary
        )))
    }

    /// Soft-delete this state
    pub async fn remove(&self) -> Result<Arc<Document>> {
        let mut document = self.data.clone();
        document.deleted = true;
        self.write_next(document).await
    }

    /// Attachments of this state
    pub fn attachments(&self) -> Vec<Attachment> {
        self.data
            .attachments
            .iter()
            .map(|(id, a)| Attachment {
                id: id.clone(),
                digest: a.digest.clone(),
                length: a.length,
                content_type: a.content_type.clone(),
            })
            .collect()
    }

    /// Add or replace attachment `id`
    pub async fn put_attachment(
        &self,
        id: &str,
        content_type: &str,
        payload: &[u8],
    ) -> Result<Arc<Document>> {
        let collection = self.collection()?;
        if !collection.schema().has_attachments() {
            return Err(Error::validation(format!(
                "collection '{}' does not support attachments",
                collection.name
            )));
        }
        let mut document = self.data.clone();
        document.attachments.insert(
            id.to_string(),
            AttachmentData {
                digest: attachment_digest(payload),
                length: payload.len() as u64,
                content_type: content_type.to_string(),
                data: Some(STANDARD.encode(payload)),
            },
        );
        self.write_next(document).await
    }

    /// Payload of attachment `id`
    pub async fn get_attachment_data(&self, id: &str) -> Result<Vec<u8>> {
        if !self.data.attachments.contains_key(id) {
            return Err(Error::not_found(format!(
                "document '{}' has no attachment '{id}'",
                self.primary
            )));
        }
        let collection = self.collection()?;
        let encoded = collection
            .instance
            .get_attachment_data(&self.primary, id)
            .await?;
        STANDARD
            .decode(encoded)
            .map_err(|e| Error::internal(format!("corrupt attachment '{id}': {e}")))
    }

    /// Drop attachment `id`
    pub async fn remove_attachment(&self, id: &str) -> Result<Arc<Document>> {
        let mut document = self.data.clone();
        if document.attachments.remove(id).is_none() {
            return Err(Error::not_found(format!(
                "document '{}' has no attachment '{id}'",
                self.primary
            )));
        }
        self.write_next(document).await
    }
}

fn merge_fields(target: &mut Map<String, Value>, changes: Map<String, Value>) -> Result<()> {
    if let Some(field) = changes.keys().find(|key| key.starts_with('_')) {
        return Err(Error::validation(format!(
            "document field '{field}' is reserved for bookkeeping"
        )));
    }
    target.extend(changes);
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryStorage;
    use crate::storage::{StorageInstanceParams, WriteErrorKind};
    use crate::testing::fixtures;
    use serde_json::json;

    async fn humans(config: DatabaseConfig) -> Arc<Collection> {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let instance = storage
            .create_storage_instance(StorageInstanceParams::new(
                "db",
                "humans",
                fixtures::human_schema(),
            ))
            .await
            .unwrap();
        Collection::new("humans", "db", "tok", instance, storage, &config)
    }

    #[tokio::test]
    async fn test_insert_find_and_cache_identity() {
        let humans = humans(DatabaseConfig::default()).await;
        let alice = humans
            .insert(json!({ "id": "alice", "name": "Alice", "age": 30 }))
            .await
            .unwrap();
        assert_eq!(alice.revision(), "1-tok");

        let found = humans
            .find_one(MangoQuery::with_selector(json!({ "age": { "$gte": 18 } })).unwrap())
            .await
            .unwrap()
            .unwrap();
        assert!(Arc::ptr_eq(&alice, &found));

        let dup = humans
            .insert(json!({ "id": "alice", "name": "Other", "age": 1 }))
            .await
            .unwrap_err();
        assert_eq!(dup.as_conflict().unwrap().kind, WriteErrorKind::Conflict);
    }

    #[tokio::test]
    async fn test_patch_conflicts_on_stale_state() {
        let humans = humans(DatabaseConfig::default()).await;
        let v1 = humans
            .insert(json!({ "id": "bob", "name": "Bob", "age": 20 }))
            .await
            .unwrap();
        let v2 = v1.patch(json!({ "age": 21 })).await.unwrap();
        assert_eq!(v2.get("age"), Some(json!(21)));
        assert_eq!(v2.revision(), "2-tok");

        assert!(v1.patch(json!({ "age": 22 })).await.unwrap_err().is_conflict());
        let v3 = v1
            .modify(|mut doc| {
                doc["age"] = json!(doc["age"].as_u64().unwrap_or(0) + 10);
                doc
            })
            .await
            .unwrap();
        assert_eq!(v3.get("age"), Some(json!(31)));
        assert!(v1.patch(json!({ "_rev": "x" })).await.is_err());
    }

    #[tokio::test]
    async fn test_bulk_insert_partial_success() {
        let humans = humans(DatabaseConfig::default()).await;
        humans
            .insert(json!({ "id": "a", "name": "A", "age": 1 }))
            .await
            .unwrap();
        let result = humans
            .bulk_insert(vec![
                json!({ "id": "a", "name": "A", "age": 1 }),
                json!({ "id": "b", "name": "B", "age": 2 }),
            ])
            .await
            .unwrap();
        assert_eq!(result.success.len(), 1);
        assert_eq!(result.success[0].primary(), "b");
        assert_eq!(result.error.len(), 1);
        assert_eq!(result.error[0].document_id, "a");
    }

    #[tokio::test]
    async fn test_upsert_and_remove() {
        let humans = humans(DatabaseConfig::default()).await;
        humans
            .upsert(json!({ "id": "c", "name": "C", "age": 5 }))
            .await
            .unwrap();
        let updated = humans
            .upsert(json!({ "id": "c", "name": "C", "age": 6 }))
            .await
            .unwrap();
        assert_eq!(updated.revision(), "2-tok");

        let removed = humans.remove_by_id("c").await.unwrap().unwrap();
        assert!(removed.is_deleted());
        assert!(humans.find_by_ids(&["c".to_string()]).await.unwrap().is_empty());
        assert!(humans.remove_by_id("c").await.unwrap().is_none());

        let revived = humans
            .upsert(json!({ "id": "c", "name": "C", "age": 7 }))
            .await
            .unwrap();
        assert_eq!(revived.revision(), "4-tok");
    }

    #[tokio::test]
    async fn test_slow_count_policy() {
        let strict = humans(DatabaseConfig::default()).await;
        strict
            .insert(json!({ "id": "a", "name": "A", "age": 40 }))
            .await
            .unwrap();
        let by_age = MangoQuery::with_selector(json!({ "age": { "$gt": 30 } })).unwrap();
        assert_eq!(strict.count(by_age).await.unwrap(), 1);

        let by_name = MangoQuery::with_selector(json!({ "name": "A" })).unwrap();
        assert!(matches!(
            strict.count(by_name.clone()).await,
            Err(Error::Query(_))
        ));

        let relaxed = humans(DatabaseConfig {
            allow_slow_count: true,
            ..DatabaseConfig::default()
        })
        .await;
        relaxed
            .insert(json!({ "id": "a", "name": "A", "age": 40 }))
            .await
            .unwrap();
        assert_eq!(relaxed.count(by_name).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn test_writes_are_validated_against_schema() {
        let humans = humans(DatabaseConfig::default()).await;
        for value in [
            json!({ "id": "x", "name": "X" }),
            json!({ "id": "x", "name": "X", "age": 200 }),
            json!({ "id": "x", "name": 7, "age": 1 }),
        ] {
            assert!(matches!(
                humans.insert(value.clone()).await,
                Err(Error::Validation(_))
            ));
            assert!(matches!(humans.upsert(value).await, Err(Error::Validation(_))));
        }
        assert!(humans.find(MangoQuery::default()).await.unwrap().is_empty());

        let ok = humans
            .insert(json!({ "id": "x", "name": "X", "age": 150 }))
            .await
            .unwrap();
        assert!(matches!(
            ok.patch(json!({ "age": 151 })).await,
            Err(Error::Validation(_))
        ));
        let by_age = MangoQuery::with_selector(json!({ "age": 150 })).unwrap();
        assert_eq!(humans.find(by_age).await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_attachments_roundtrip() {
        let humans = humans(DatabaseConfig::default()).await;
        let doc = humans
            .insert(json!({ "id": "d", "name": "D", "age": 9 }))
            .await
            .unwrap();
        let with = doc
            .put_attachment("avatar", "image/png", b"\x89PNG")
            .await
            .unwrap();
        let attachments = with.attachments();
        assert_eq!(attachments.len(), 1);
        assert_eq!(attachments[0].digest, attachment_digest(b"\x89PNG"));
        assert_eq!(with.get_attachment_data("avatar").await.unwrap(), b"\x89PNG");

        let patched = with.patch(json!({ "age": 10 })).await.unwrap();
        assert_eq!(patched.attachments().len(), 1);

        let without = patched.remove_attachment("avatar").await.unwrap();
        assert!(without.attachments().is_empty());
        assert!(matches!(
            without.get_attachment_data("avatar").await,
            Err(Error::NotFound(_))
        ));
    }
}
