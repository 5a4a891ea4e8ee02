//! Local documents
//!
//! Small per-database or per-collection key/value records that are never
//! replicated. They live in a dedicated `<parent>-local` storage instance
//! with the schema `{ id, data }`.

use crate::document::{DocumentData, now_lwt};
use crate::query::{MangoQuery, prepare_query};
use crate::revision::create_revision;
use crate::schema::Schema;
use crate::storage::{
    BulkWriteRow, Storage, StorageInstance, StorageInstanceParams, get_single_document,
    write_single,
};
use crate::{Error, Result};
use serde_json::{Map, Value, json};
use std::sync::Arc;
use tracing::debug;

const LOCAL_CONTEXT: &str = "local-document";
/// Attempts of an upsert before giving up on concurrent writers
const UPSERT_ATTEMPTS: usize = 8;

/// Schema of local document instances
pub fn local_documents_schema() -> Result<Schema> {
    Schema::from_value(json!({
        "title": "local documents",
        "version": 0,
        "primaryKey": "id",
        "type": "object",
        "properties": {
            "id": { "type": "string", "maxLength": 128 },
            "data": { "type": "object" }
        },
        "required": ["id", "data"]
    }))
}

/// A stored local document
#[derive(Debug, Clone, PartialEq)]
pub struct LocalDocument {
    /// Key
    pub id: String,
    /// Stored value
    pub data: Value,
    /// Current revision
    pub revision: String,
}

impl LocalDocument {
    fn from_stored(doc: &DocumentData) -> Option<Self> {
        Some(Self {
            id: doc.primary("id")?.to_string(),
            data: doc.data.get("data").cloned().unwrap_or(Value::Null),
            revision: doc.rev.clone(),
        })
    }
}

/// Local documents of one database or collection
pub struct LocalDocuments {
    instance: Arc<dyn StorageInstance>,
    token: String,
}

impl LocalDocuments {
    /// Open the `<parent>-local` instance
    pub async fn open(
        storage: &dyn Storage,
        database_name: &str,
        parent: &str,
        token: impl Into<String>,
    ) -> Result<Self> {
        let params = StorageInstanceParams::new(
            database_name,
            format!("{parent}-local"),
            local_documents_schema()?,
        );
        let instance = storage.create_storage_instance(params).await?;
        Ok(Self {
            instance,
            token: token.into(),
        })
    }

    /// Underlying instance
    pub fn instance(&self) -> &Arc<dyn StorageInstance> {
        &self.instance
    }

    /// Document `id`, `None` when absent or removed
    pub async fn get(&self, id: &str) -> Result<Option<LocalDocument>> {
        Ok(self
            .current(id)
            .await?
            .filter(|doc| !doc.deleted)
            .as_ref()
            .and_then(LocalDocument::from_stored))
    }

    /// Create `id`; fails with a conflict when it already exists
    pub async fn insert(&self, id: &str, data: Value) -> Result<LocalDocument> {
        let current = self.current(id).await?;
        let previous = match current {
            Some(doc) if !doc.deleted => {
                let row = BulkWriteRow::insert(self.build(id, data, None)?);
                return Err(crate::storage::WriteError::new(
                    crate::storage::WriteErrorKind::Conflict,
                    id,
                    row,
                    Some(doc),
                )
                .into());
            }
            other => other,
        };
        self.write(id, data, previous).await
    }

    /// Create or overwrite `id`
    pub async fn upsert(&self, id: &str, data: Value) -> Result<LocalDocument> {
        for _ in 0..UPSERT_ATTEMPTS {
            let previous = self.current(id).await?;
            match self.write(id, data.clone(), previous).await {
                Ok(doc) => return Ok(doc),
                Err(err) if err.is_conflict() => {
                    debug!("Local document {} changed concurrently, retrying", id);
                }
                Err(err) => return Err(err),
            }
        }
        Err(Error::validation(format!(
            "local document '{id}' kept conflicting after {UPSERT_ATTEMPTS} attempts"
        )))
    }

    /// Remove `id`; returns whether it existed
    pub async fn remove(&self, id: &str) -> Result<bool> {
        let Some(current) = self.current(id).await?.filter(|doc| !doc.deleted) else {
            return Ok(false);
        };
        let mut document = current.clone();
        document.deleted = true;
        document.rev = create_revision(&self.token, Some(&current))?;
        document.meta.lwt = now_lwt();
        write_single(
            self.instance.as_ref(),
            BulkWriteRow::update(current, document),
            LOCAL_CONTEXT,
        )
        .await?;
        Ok(true)
    }

    /// Every stored document, ordered by id
    pub async fn all(&self) -> Result<Vec<LocalDocument>> {
        let query = prepare_query(self.instance.schema(), MangoQuery::default())?;
        let docs = self.instance.query(&query).await?;
        Ok(docs.iter().filter_map(LocalDocument::from_stored).collect())
    }

    /// Close the instance
    pub async fn close(&self) -> Result<()> {
        self.instance.close().await
    }

    /// Delete every local document and close
    pub async fn remove_all(&self) -> Result<()> {
        self.instance.remove().await
    }

    async fn current(&self, id: &str) -> Result<Option<DocumentData>> {
        self.instance.schema().validate_primary_key_value(id)?;
        get_single_document(self.instance.as_ref(), id).await
    }

    fn build(&self, id: &str, data: Value, previous: Option<&DocumentData>) -> Result<DocumentData> {
        let mut fields = Map::new();
        fields.insert("id".to_string(), Value::String(id.to_string()));
        fields.insert("data".to_string(), data);
        let mut document = DocumentData::new(fields);
        document.rev = create_revision(&self.token, previous)?;
        document.meta.lwt = now_lwt();
        Ok(document)
    }

    async fn write(
        &self,
        id: &str,
        data: Value,
        previous: Option<DocumentData>,
    ) -> Result<LocalDocument> {
        let document = self.build(id, data, previous.as_ref())?;
        let stored = write_single(
            self.instance.as_ref(),
            BulkWriteRow { document, previous },
            LOCAL_CONTEXT,
        )
        .await?;
        LocalDocument::from_stored(&stored)
            .ok_or_else(|| Error::internal("stored local document lost its id"))
    }
}
