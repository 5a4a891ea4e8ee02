//! Replication handlers
//!
//! The driver only talks to the master side through [`PullHandler`] and
//! [`PushHandler`]. [`StorageReplicationHandler`] implements both on top of
//! any [`StorageInstance`], which is enough for storage-to-storage sync and
//! for schema migration.

use crate::document::{Checkpoint, DocumentData, now_lwt};
use crate::revision::create_revision;
use crate::storage::{BulkWriteRow, StorageInstance};
use anyhow::Context;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::sync::Arc;

/// Context of writes performed on the master by a push
pub const PUSH_CONTEXT: &str = "replication-push";

/// One batch returned by a pull
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PullResult {
    /// Master states in master order
    pub documents: Vec<DocumentData>,
    /// Opaque cursor to resume from; `None` keeps the previous one
    pub checkpoint: Option<Value>,
    /// Whether the master has more documents after this batch
    pub has_more_documents: bool,
}

/// A fork change offered to the master
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PushRow {
    /// Master state the fork last saw, if any
    pub assumed_master_state: Option<DocumentData>,
    /// Current fork state
    pub new_document_state: DocumentData,
}

/// Fetches master changes after a checkpoint
#[async_trait]
pub trait PullHandler: Send + Sync {
    /// At most `batch_size` master documents after `checkpoint`
    async fn pull(&self, checkpoint: Option<Value>, batch_size: usize) -> anyhow::Result<PullResult>;
}

/// Applies fork changes to the master
#[async_trait]
pub trait PushHandler: Send + Sync {
    /// Write `rows`; returns the current master state of every conflicting row
    async fn push(&self, rows: Vec<PushRow>) -> anyhow::Result<Vec<DocumentData>>;
}

/// Pull and push handlers backed by a storage instance acting as master
pub struct StorageReplicationHandler {
    instance: Arc<dyn StorageInstance>,
    token: String,
}

impl StorageReplicationHandler {
    /// Handler writing master revisions tagged with `token`
    pub fn new(instance: Arc<dyn StorageInstance>, token: impl Into<String>) -> Self {
        Self {
            instance,
            token: token.into(),
        }
    }

    /// Master instance
    pub fn instance(&self) -> &Arc<dyn StorageInstance> {
        &self.instance
    }
}

#[async_trait]
impl PullHandler for StorageReplicationHandler {
    async fn pull(&self, checkpoint: Option<Value>, batch_size: usize) -> anyhow::Result<PullResult> {
        let checkpoint: Option<Checkpoint> = checkpoint
            .map(serde_json::from_value)
            .transpose()
            .context("malformed pull checkpoint")?;
        let changes = self
            .instance
            .get_changed_documents_since(batch_size, checkpoint.as_ref())
            .await?;
        let has_more_documents = changes.documents.len() == batch_size;
        Ok(PullResult {
            documents: changes
                .documents
                .iter()
                .map(DocumentData::without_attachment_data)
                .collect(),
            checkpoint: changes.checkpoint.map(serde_json::to_value).transpose()?,
            has_more_documents,
        })
    }
}

#[async_trait]
impl PushHandler for StorageReplicationHandler {
    async fn push(&self, rows: Vec<PushRow>) -> anyhow::Result<Vec<DocumentData>> {
        let primary = self.instance.schema().primary_path().to_string();
        let mut ids = Vec::with_capacity(rows.len());
        for row in &rows {
            let id = row
                .new_document_state
                .primary(&primary)
                .with_context(|| format!("pushed document has no '{primary}'"))?;
            ids.push(id.to_string());
        }
        let master = self.instance.find_documents_by_id(&ids, true).await?;

        let mut conflicts = Vec::new();
        let mut writes = Vec::new();
        for (id, row) in ids.iter().zip(rows) {
            let current = master.get(id);
            if let Some(current) = current {
                if current.same_content(&row.new_document_state) {
                    continue;
                }
                let assumed_matches = row
                    .assumed_master_state
                    .as_ref()
                    .is_some_and(|assumed| assumed.same_content(current));
                if !assumed_matches {
                    conflicts.push(current.clone());
                    continue;
                }
            }
            let mut document = row.new_document_state;
            document.rev = create_revision(&self.token, current)?;
            document.meta.lwt = now_lwt();
            document.attachments = current.map(|c| c.attachments.clone()).unwrap_or_default();
            writes.push(BulkWriteRow {
                document,
                previous: current.cloned(),
            });
        }

        if !writes.is_empty() {
            let response = self.instance.bulk_write(writes, PUSH_CONTEXT).await?;
            conflicts.extend(
                response
                    .error
                    .into_values()
                    .filter_map(|err| err.document_in_db),
            );
        }
        Ok(conflicts)
    }
}
