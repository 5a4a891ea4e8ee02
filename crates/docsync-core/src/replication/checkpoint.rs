//! Persisted replication state
//!
//! One meta instance per replication keeps three kinds of records:
//! `checkpoint|push` (last fork position handed to the push handler),
//! `checkpoint|pull` (opaque master cursor) and `doc|<id>` (the master state
//! the fork last agreed on, sent as `assumed_master_state`).

use crate::document::{Checkpoint, DocumentData, now_lwt};
use crate::revision::{create_revision, hash_token};
use crate::schema::Schema;
use crate::storage::{
    BulkWriteRow, Storage, StorageInstance, StorageInstanceParams, get_single_document,
    write_single,
};
use crate::{Error, Result};
use serde_json::{Map, Value, json};
use std::collections::BTreeMap;
use std::sync::Arc;
use tracing::debug;

const PUSH_CHECKPOINT_ID: &str = "checkpoint|push";
const PULL_CHECKPOINT_ID: &str = "checkpoint|pull";
const META_TOKEN: &str = "meta";
/// Attempts of a meta upsert before giving up on concurrent writers
const UPSERT_ATTEMPTS: usize = 8;

/// Schema of replication meta instances
pub fn meta_schema() -> Result<Schema> {
    Schema::from_value(json!({
        "title": "replication meta",
        "version": 0,
        "primaryKey": "id",
        "type": "object",
        "properties": {
            "id": { "type": "string", "maxLength": 256 },
            "kind": { "type": "string", "maxLength": 32 },
            "data": { "type": "object" }
        },
        "required": ["id", "kind", "data"]
    }))
}

fn assumed_id(document_id: &str) -> String {
    format!("doc|{document_id}")
}

/// Checkpoints and assumed master states of one replication
#[derive(Clone)]
pub struct ReplicationMeta {
    instance: Arc<dyn StorageInstance>,
}

impl ReplicationMeta {
    /// Use an already opened meta instance
    pub fn new(instance: Arc<dyn StorageInstance>) -> Self {
        Self { instance }
    }

    /// Open the meta instance of replication `identifier` of `collection`
    pub async fn open(
        storage: &dyn Storage,
        database_name: &str,
        collection: &str,
        identifier: &str,
    ) -> Result<Self> {
        let params = StorageInstanceParams::new(
            database_name,
            format!("{collection}-replication-{}", hash_token(identifier)),
            meta_schema()?,
        );
        let instance = storage.create_storage_instance(params).await?;
        debug!(
            "Opened replication meta {} for {}",
            instance.collection_name(),
            collection
        );
        Ok(Self::new(instance))
    }

    /// Underlying instance
    pub fn instance(&self) -> &Arc<dyn StorageInstance> {
        &self.instance
    }

    /// Last fork checkpoint acknowledged by the push handler
    pub async fn push_checkpoint(&self) -> Result<Option<Checkpoint>> {
        match self.read_data(PUSH_CHECKPOINT_ID).await? {
            Some(data) => Ok(Some(serde_json::from_value(data)?)),
            None => Ok(None),
        }
    }

    /// Persist the push checkpoint
    pub async fn set_push_checkpoint(&self, checkpoint: &Checkpoint) -> Result<()> {
        self.upsert(PUSH_CHECKPOINT_ID, "checkpoint", serde_json::to_value(checkpoint)?)
            .await
    }

    /// Last master cursor returned by the pull handler
    pub async fn pull_checkpoint(&self) -> Result<Option<Value>> {
        self.read_data(PULL_CHECKPOINT_ID).await
    }

    /// Persist the pull cursor
    pub async fn set_pull_checkpoint(&self, checkpoint: Value) -> Result<()> {
        self.upsert(PULL_CHECKPOINT_ID, "checkpoint", checkpoint).await
    }

    /// Assumed master states of `ids`; unknown ids are omitted
    pub async fn assumed_master_states(
        &self,
        ids: &[String],
    ) -> Result<BTreeMap<String, DocumentData>> {
        let meta_ids: Vec<String> = ids.iter().map(|id| assumed_id(id)).collect();
        let found = self.instance.find_documents_by_id(&meta_ids, false).await?;
        let mut states = BTreeMap::new();
        for (id, meta_id) in ids.iter().zip(&meta_ids) {
            if let Some(record) = found.get(meta_id) {
                let data = record.data.get("data").cloned().unwrap_or(Value::Null);
                states.insert(id.clone(), DocumentData::from_value(data)?);
            }
        }
        Ok(states)
    }

    /// Remember `documents` as the master states the fork agrees with
    pub async fn set_assumed_master_states(
        &self,
        primary_path: &str,
        documents: &[DocumentData],
    ) -> Result<()> {
        for doc in documents {
            let id = doc.primary(primary_path).ok_or_else(|| {
                Error::internal(format!("replicated document without '{primary_path}'"))
            })?;
            self.upsert(&assumed_id(id), "assumed", doc.without_attachment_data().to_value())
                .await?;
        }
        Ok(())
    }

    /// Delete all replication state
    pub async fn remove(&self) -> Result<()> {
        self.instance.remove().await
    }

    async fn read_data(&self, id: &str) -> Result<Option<Value>> {
        let record = get_single_document(self.instance.as_ref(), id).await?;
        Ok(record
            .filter(|r| !r.deleted)
            .and_then(|r| r.data.get("data").cloned()))
    }

    async fn upsert(&self, id: &str, kind: &str, data: Value) -> Result<()> {
        for _ in 0..UPSERT_ATTEMPTS {
            let current = get_single_document(self.instance.as_ref(), id).await?;
            let mut fields = Map::new();
            fields.insert("id".to_string(), Value::String(id.to_string()));
            fields.insert("kind".to_string(), Value::String(kind.to_string()));
            fields.insert("data".to_string(), data.clone());
            let mut document = DocumentData::new(fields);
            document.rev = create_revision(META_TOKEN, current.as_ref())?;
            document.meta.lwt = now_lwt();

            let row = BulkWriteRow {
                document,
                previous: current,
            };
            match write_single(self.instance.as_ref(), row, "replication-meta").await {
                Ok(_) => return Ok(()),
                Err(err) if err.is_conflict() => {
                    debug!("Meta record {} changed concurrently, retrying", id);
                }
                Err(err) => return Err(err),
            }
        }
        Err(Error::replication(format!(
            "meta record '{id}' kept conflicting after {UPSERT_ATTEMPTS} attempts"
        )))
    }
}
