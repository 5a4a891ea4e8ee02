//! Schema migration
//!
//! When a collection is opened with a higher schema version than the one
//! recorded in the internal store, a [`MigrationState`] moves the documents
//! of the old storage instance into the new one. The move is a push-only
//! replication (old instance = fork, new instance = master) whose push
//! handler runs every document through the [`MigrationStrategies`] of the
//! versions in between.
//!
//! Progress is persisted as a status record in the internal store so that
//! other participants (and restarts) can observe it.

use crate::config::{LeaderConfig, MigrationConfig, ReplicationDefaults};
use crate::database::{
    COLLECTION_CONTEXT, MIGRATION_STATUS_CONTEXT, internal_id, internal_record,
    old_collection_meta,
};
use crate::document::{AttachmentData, DocumentData, now_lwt};
use crate::leader::{BroadcastChannel, LeaderElector};
use crate::replication::{PushHandler, PushRow, ReplicationMeta, ReplicationOptions, ReplicationState};
use crate::revision::{create_revision, hash_token};
use crate::schema::Schema;
use crate::storage::{
    BulkWriteRow, Storage, StorageInstance, StorageInstanceParams, TaskQueue,
    count_all_documents, get_single_document, write_single,
};
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use tracing::{debug, info, warn};

/// Context of writes into the new storage instance
pub const MIGRATION_CONTEXT: &str = "migration";

/// Turns a document of version `n - 1` into version `n`; `None` drops it
pub type MigrationStrategy = Arc<dyn Fn(Value) -> Option<Value> + Send + Sync>;

/// Strategies keyed by the schema version they migrate to
#[derive(Clone, Default)]
pub struct MigrationStrategies {
    strategies: BTreeMap<u32, MigrationStrategy>,
}

impl MigrationStrategies {
    /// No strategies
    pub fn new() -> Self {
        Self::default()
    }

    /// Add the strategy producing version `version`
    pub fn with<F>(mut self, version: u32, strategy: F) -> Self
    where
        F: Fn(Value) -> Option<Value> + Send + Sync + 'static,
    {
        self.strategies.insert(version, Arc::new(strategy));
        self
    }

    /// Strategy producing version `version`
    pub fn get(&self, version: u32) -> Option<&MigrationStrategy> {
        self.strategies.get(&version)
    }

    /// Require exactly one strategy per version `1..=schema_version`
    pub fn validate(&self, schema_version: u32) -> Result<()> {
        for version in 1..=schema_version {
            if !self.strategies.contains_key(&version) {
                return Err(Error::migration(format!(
                    "missing migration strategy for version {version}"
                )));
            }
        }
        if let Some(extra) = self.strategies.keys().find(|v| **v == 0 || **v > schema_version) {
            return Err(Error::migration(format!(
                "migration strategy for version {extra} does not match schema version {schema_version}"
            )));
        }
        Ok(())
    }

    /// Run `value` through the strategies of `from + 1 ..= to`
    pub fn migrate(&self, from: u32, to: u32, mut value: Value) -> Result<Option<Value>> {
        for version in from + 1..=to {
            let strategy = self.get(version).ok_or_else(|| {
                Error::migration(format!("missing migration strategy for version {version}"))
            })?;
            match strategy(value) {
                Some(next) => value = next,
                None => return Ok(None),
            }
        }
        Ok(Some(value))
    }
}

/// Lifecycle of a migration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MigrationStatusKind {
    /// Documents are being moved
    Running,
    /// Old storage removed, collection meta retired
    Done,
    /// Migration failed; `error` tells why
    Error,
}

/// Document counters of a migration
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MigrationCount {
    /// Non-deleted documents in the old storage
    pub total: usize,
    /// Documents processed so far, dropped ones included
    pub handled: usize,
    /// `handled / total` in percent, capped at 100
    pub percent: u32,
}

/// Persisted migration status
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationStatus {
    /// Migrated collection
    pub collection_name: String,
    /// Current phase
    pub status: MigrationStatusKind,
    /// Progress
    pub count: MigrationCount,
    /// Failure message when `status` is `ERROR`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl MigrationStatus {
    fn running(collection_name: &str) -> Self {
        Self {
            collection_name: collection_name.to_string(),
            status: MigrationStatusKind::Running,
            count: MigrationCount::default(),
            error: None,
        }
    }

    fn refresh_percent(&mut self) {
        self.count.percent = if self.count.total == 0 {
            0
        } else {
            let percent = (self.count.handled as f64 / self.count.total as f64 * 100.0).round();
            percent.min(100.0) as u32
        };
    }
}

/// Serialized read-modify-write access to one status record
struct StatusStore {
    internal: Arc<dyn StorageInstance>,
    key: String,
    id: String,
    token: String,
    collection_name: String,
    retry_limit: usize,
    queue: TaskQueue,
}

impl StatusStore {
    async fn read(&self) -> Result<Option<MigrationStatus>> {
        let record = get_single_document(self.internal.as_ref(), &self.id).await?;
        match record.filter(|r| !r.deleted) {
            Some(record) => {
                let data = record.data.get("data").cloned().unwrap_or(Value::Null);
                Ok(Some(serde_json::from_value(data)?))
            }
            None => Ok(None),
        }
    }

    /// Apply `change` to the latest status, re-reading on conflicts
    async fn update<F>(&self, change: F) -> Result<MigrationStatus>
    where
        F: Fn(&mut MigrationStatus) + Send + Sync,
    {
        self.queue
            .run(move || async move {
                for _ in 0..self.retry_limit {
                    let previous = get_single_document(self.internal.as_ref(), &self.id).await?;
                    let mut status = match previous.as_ref().and_then(|p| p.data.get("data")) {
                        Some(data) => serde_json::from_value(data.clone())?,
                        None => MigrationStatus::running(&self.collection_name),
                    };
                    let before = status.clone();
                    change(&mut status);
                    status.refresh_percent();
                    if previous.is_some() && status == before {
                        return Ok(status);
                    }

                    let mut document = DocumentData::new(internal_record(
                        MIGRATION_STATUS_CONTEXT,
                        &self.key,
                        serde_json::to_value(&status)?,
                    ));
                    document.rev = create_revision(&self.token, previous.as_ref())?;
                    document.meta.lwt = now_lwt();
                    let row = BulkWriteRow {
                        document,
                        previous,
                    };
                    match write_single(self.internal.as_ref(), row, MIGRATION_STATUS_CONTEXT).await {
                        Ok(_) => return Ok(status),
                        Err(err) if err.is_conflict() => {
                            debug!("Migration status {} changed concurrently, retrying", self.id);
                        }
                        Err(err) => return Err(err),
                    }
                }
                Err(Error::migration(format!(
                    "status record '{}' kept conflicting after {} attempts",
                    self.id, self.retry_limit
                )))
            })
            .await
    }
}

/// Database facilities a migration needs
#[derive(Clone)]
pub struct MigrationContext {
    /// Storage the old and new instances live in
    pub storage: Arc<dyn Storage>,
    /// Database name
    pub database_name: String,
    /// Revision token of the database
    pub token: String,
    /// Internal store holding collection metas and status records
    pub internal: Arc<dyn StorageInstance>,
    /// Whether other participants share the database
    pub multi_instance: bool,
    /// Election bus for multi-instance databases
    pub channel: Option<BroadcastChannel>,
    /// Migration settings
    pub config: MigrationConfig,
    /// Replication settings of the migration run
    pub replication: ReplicationDefaults,
    /// Election timing
    pub leader: LeaderConfig,
}

/// Migration of one collection to its current schema version
pub struct MigrationState {
    context: MigrationContext,
    collection_name: String,
    schema: Arc<Schema>,
    destination: Arc<dyn StorageInstance>,
    strategies: MigrationStrategies,
    status: Arc<StatusStore>,
    started: AtomicBool,
    canceled: AtomicBool,
    replication: Mutex<Option<Arc<ReplicationState>>>,
    elector: Mutex<Option<Arc<LeaderElector>>>,
}

impl MigrationState {
    /// Migration of `destination`'s collection into `destination`
    pub fn new(
        context: MigrationContext,
        destination: Arc<dyn StorageInstance>,
        strategies: MigrationStrategies,
    ) -> Self {
        let collection_name = destination.collection_name().to_string();
        let schema = destination.schema().clone();
        let key = format!("{}-v-{}", collection_name, schema.version);
        let status = Arc::new(StatusStore {
            internal: context.internal.clone(),
            id: internal_id(MIGRATION_STATUS_CONTEXT, &key),
            key,
            token: context.token.clone(),
            collection_name: collection_name.clone(),
            retry_limit: context.config.status_retry_limit.max(1),
            queue: TaskQueue::new(),
        });
        Self {
            context,
            collection_name,
            schema,
            destination,
            strategies,
            status,
            started: AtomicBool::new(false),
            canceled: AtomicBool::new(false),
            replication: Mutex::new(None),
            elector: Mutex::new(None),
        }
    }

    /// Migrated collection
    pub fn collection_name(&self) -> &str {
        &self.collection_name
    }

    /// Id of the status record in the internal store
    pub fn status_id(&self) -> &str {
        &self.status.id
    }

    /// Whether an older collection meta is still recorded
    pub async fn must_migrate(&self) -> Result<bool> {
        Ok(self.old_meta().await?.is_some())
    }

    /// Persisted status, `None` before the migration started
    pub async fn status(&self) -> Result<Option<MigrationStatus>> {
        self.status.read().await
    }

    /// Run the migration; returns once the old storage is gone
    ///
    /// In a multi-instance database only the elected participant migrates;
    /// the others wait for leadership and find nothing left to do.
    pub async fn start_migration(&self, batch_size: Option<usize>) -> Result<()> {
        if !self.must_migrate().await? {
            return Ok(());
        }
        if self.started.swap(true, Ordering::SeqCst) {
            return Err(Error::migration(format!(
                "migration of '{}' already started",
                self.collection_name
            )));
        }
        let batch_size = batch_size.unwrap_or(self.context.config.batch_size);
        match self.run_migration(batch_size).await {
            Ok(()) => Ok(()),
            Err(err) => {
                warn!("Migration of {} failed: {}", self.collection_name, err);
                let message = err.to_string();
                let recorded = self
                    .status
                    .update(move |s| {
                        s.status = MigrationStatusKind::Error;
                        s.error = Some(message.clone());
                    })
                    .await;
                if let Err(status_err) = recorded {
                    warn!("Could not record migration failure: {}", status_err);
                }
                Err(err)
            }
        }
    }

    /// Start the migration in the background and wait for `DONE` or `ERROR`
    pub async fn migrate_promise(self: &Arc<Self>, batch_size: Option<usize>) -> Result<MigrationStatus> {
        if !self.must_migrate().await? {
            if let Some(status) = self.status().await? {
                return Ok(status);
            }
            let mut status = MigrationStatus::running(&self.collection_name);
            status.status = MigrationStatusKind::Done;
            return Ok(status);
        }

        let mut changes = self.context.internal.change_stream();
        let this = self.clone();
        tokio::spawn(async move {
            if let Err(err) = this.start_migration(batch_size).await {
                debug!("Background migration of {} ended: {}", this.collection_name, err);
            }
        });

        loop {
            if let Some(status) = self.status().await? {
                match status.status {
                    MigrationStatusKind::Done => return Ok(status),
                    MigrationStatusKind::Error => {
                        return Err(Error::migration(format!(
                            "migration of '{}' failed: {}",
                            self.collection_name,
                            status.error.unwrap_or_default()
                        )));
                    }
                    MigrationStatusKind::Running => {}
                }
            }
            if changes.next().await.is_none() {
                return Err(Error::migration("internal store closed during migration"));
            }
        }
    }

    /// Stop the replication and leave the election
    pub async fn cancel(&self) {
        self.canceled.store(true, Ordering::SeqCst);
        let replication = self.replication.lock().take();
        if let Some(replication) = replication {
            replication.cancel();
        }
        let elector = self.elector.lock().take();
        if let Some(elector) = elector {
            elector.die().await;
        }
    }

    async fn old_meta(&self) -> Result<Option<DocumentData>> {
        old_collection_meta(&self.context.internal, &self.collection_name, self.schema.version).await
    }

    async fn run_migration(&self, batch_size: usize) -> Result<()> {
        if let (true, Some(channel)) = (self.context.multi_instance, &self.context.channel) {
            let elector = Arc::new(LeaderElector::start(
                channel,
                format!(
                    "migration|{}|{}|{}",
                    self.context.database_name, self.collection_name, self.schema.version
                ),
                &self.context.leader,
            ));
            *self.elector.lock() = Some(elector.clone());
            elector.await_leadership().await?;
        }

        let Some(old_meta) = self.old_meta().await? else {
            debug!("{} was migrated by another participant", self.collection_name);
            return Ok(());
        };
        let old_schema = old_meta
            .data
            .get("data")
            .and_then(|data| data.get("schema"))
            .cloned()
            .ok_or_else(|| Error::internal("collection meta without schema"))?;
        let old_schema = Schema::from_value(old_schema)?;
        let old_version = old_schema.version;
        self.strategies.validate(self.schema.version)?;

        let mut params = StorageInstanceParams::new(
            &self.context.database_name,
            &self.collection_name,
            old_schema,
        );
        params.multi_instance = self.context.multi_instance;
        let old = self.context.storage.create_storage_instance(params).await?;

        let total = count_all_documents(old.as_ref()).await?;
        self.status.update(move |s| s.count.total = total).await?;
        info!(
            "Migrating {} documents of {} from v{} to v{}",
            total, self.collection_name, old_version, self.schema.version
        );

        if let Err(err) = self.migrate_storage(old.clone(), batch_size).await {
            let _ = old.close().await;
            return Err(err);
        }

        self.retire_collection_meta(old_meta).await?;
        self.status
            .update(|s| s.status = MigrationStatusKind::Done)
            .await?;
        info!("Migration of {} to v{} done", self.collection_name, self.schema.version);

        let elector = self.elector.lock().take();
        if let Some(elector) = elector {
            elector.die().await;
        }
        Ok(())
    }

    async fn migrate_storage(&self, old: Arc<dyn StorageInstance>, batch_size: usize) -> Result<()> {
        let identifier = format!(
            "migration-{}-{}-{}",
            self.collection_name,
            old.schema().version,
            self.schema.version
        );
        let meta = ReplicationMeta::open(
            self.context.storage.as_ref(),
            &self.context.database_name,
            &format!("migration-{}", self.collection_name),
            &identifier,
        )
        .await?;

        let handler = Arc::new(MigrationPushHandler {
            source: old.clone(),
            destination: self.destination.clone(),
            strategies: self.strategies.clone(),
            from_version: old.schema().version,
            to_version: self.schema.version,
            status: self.status.clone(),
        });
        let mut options = ReplicationOptions::new(identifier, &self.context.replication)
            .with_push(handler)
            .once();
        options.batch_size = batch_size;

        if self.canceled.load(Ordering::SeqCst) {
            return Err(Error::migration("migration canceled"));
        }
        let (state, mut errors) =
            ReplicationState::start_with_errors(old.clone(), meta.clone(), options)?;
        let state = Arc::new(state);
        *self.replication.lock() = Some(state.clone());

        let synced = tokio::select! {
            result = async {
                state.await_initial_sync().await?;
                state.await_in_sync().await
            } => result,
            failure = errors.recv() => Err(match failure {
                Ok(err) => Error::migration(err.to_string()),
                Err(_) => Error::migration("replication error stream closed"),
            }),
        };
        state.cancel();
        self.replication.lock().take();

        if let Err(err) = synced {
            let _ = meta.instance().close().await;
            return Err(err);
        }
        old.remove().await?;
        meta.remove().await?;
        Ok(())
    }

    /// Mark the old collection meta deleted, tolerating a concurrent retire
    async fn retire_collection_meta(&self, mut current: DocumentData) -> Result<()> {
        let id = current
            .primary("id")
            .ok_or_else(|| Error::internal("collection meta without id"))?
            .to_string();
        for _ in 0..self.context.config.status_retry_limit.max(1) {
            let mut document = current.clone();
            document.deleted = true;
            document.rev = create_revision(&self.context.token, Some(&current))?;
            document.meta.lwt = now_lwt();
            match write_single(
                self.context.internal.as_ref(),
                BulkWriteRow::update(current.clone(), document),
                COLLECTION_CONTEXT,
            )
            .await
            {
                Ok(_) => return Ok(()),
                Err(err) => match err.as_conflict().and_then(|c| c.document_in_db.clone()) {
                    Some(in_db) if in_db.deleted => return Ok(()),
                    Some(in_db) if err.is_conflict() => current = in_db,
                    _ => return Err(err),
                },
            }
        }
        Err(Error::migration(format!(
            "collection meta '{id}' kept conflicting"
        )))
    }
}

/// Push handler writing migrated documents into the new instance
struct MigrationPushHandler {
    source: Arc<dyn StorageInstance>,
    destination: Arc<dyn StorageInstance>,
    strategies: MigrationStrategies,
    from_version: u32,
    to_version: u32,
    status: Arc<StatusStore>,
}

impl MigrationPushHandler {
    async fn migrate_row(&self, row: PushRow) -> anyhow::Result<Option<DocumentData>> {
        let old = row.new_document_state;
        let Some(value) = self
            .strategies
            .migrate(self.from_version, self.to_version, old.user_value())?
        else {
            return Ok(None);
        };
        let Value::Object(data) = value else {
            anyhow::bail!("migration strategy returned a non-object document");
        };

        let mut document = DocumentData::new(data);
        document.deleted = old.deleted;
        document.meta = old.meta.clone();
        if self.destination.schema().has_attachments() && !old.deleted {
            let id = old
                .primary(self.source.schema().primary_path())
                .ok_or_else(|| anyhow::anyhow!("old document without primary key"))?;
            for (attachment_id, attachment) in &old.attachments {
                let data = self.source.get_attachment_data(id, attachment_id).await?;
                document.attachments.insert(
                    attachment_id.clone(),
                    AttachmentData {
                        data: Some(data),
                        ..attachment.clone()
                    },
                );
            }
        }
        Ok(Some(document))
    }
}

#[async_trait]
impl PushHandler for MigrationPushHandler {
    async fn push(&self, rows: Vec<PushRow>) -> anyhow::Result<Vec<DocumentData>> {
        let handled = rows.len();
        let primary = self.destination.schema().primary_path().to_string();

        let mut migrated = Vec::with_capacity(rows.len());
        for row in rows {
            if let Some(document) = self.migrate_row(row).await? {
                let id = document
                    .primary(&primary)
                    .ok_or_else(|| anyhow::anyhow!("migrated document has no '{primary}'"))?
                    .to_string();
                migrated.push((id, document));
            }
        }

        let ids: Vec<String> = migrated.iter().map(|(id, _)| id.clone()).collect();
        let current = self.destination.find_documents_by_id(&ids, true).await?;
        let mut conflicts = Vec::new();
        let mut writes = Vec::new();
        for (id, mut document) in migrated {
            match current.get(&id) {
                Some(existing) if existing.same_content(&document) => {}
                Some(existing) => conflicts.push(existing.clone()),
                None => {
                    let content = serde_json::to_string(&document.without_attachment_data())?;
                    document.rev = create_revision(&hash_token(&content), None)?;
                    writes.push(BulkWriteRow::insert(document));
                }
            }
        }

        if !writes.is_empty() {
            let response = self.destination.bulk_write(writes, MIGRATION_CONTEXT).await?;
            conflicts.extend(
                response
                    .error
                    .into_values()
                    .filter_map(|err| err.document_in_db),
            );
        }
        self.status.update(move |s| s.count.handled += handled).await?;
        Ok(conflicts)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_strategies_chain_and_drop() {
        let strategies = MigrationStrategies::new()
            .with(1, |mut doc| {
                doc["age"] = json!(doc["age"].as_u64().unwrap_or(0) + 1);
                Some(doc)
            })
            .with(2, |doc| if doc["age"] == 100 { None } else { Some(doc) });
        strategies.validate(2).unwrap();

        let migrated = strategies.migrate(0, 2, json!({ "id": "a", "age": 1 })).unwrap();
        assert_eq!(migrated, Some(json!({ "id": "a", "age": 2 })));
        assert_eq!(strategies.migrate(0, 2, json!({ "id": "b", "age": 99 })).unwrap(), None);
        assert_eq!(
            strategies.migrate(1, 2, json!({ "id": "c", "age": 5 })).unwrap(),
            Some(json!({ "id": "c", "age": 5 }))
        );
    }

    #[test]
    fn test_strategies_validation() {
        let strategies = MigrationStrategies::new().with(2, Some);
        assert!(strategies.validate(2).is_err());
        assert!(MigrationStrategies::new().with(1, Some).validate(0).is_err());
        MigrationStrategies::new().validate(0).unwrap();
    }

    #[test]
    fn test_status_wire_shape() {
        let mut status = MigrationStatus::running("humans");
        status.count.total = 3;
        status.count.handled = 2;
        status.refresh_percent();
        assert_eq!(
            serde_json::to_value(&status).unwrap(),
            json!({
                "collectionName": "humans",
                "status": "RUNNING",
                "count": { "total": 3, "handled": 2, "percent": 67 }
            })
        );
    }
}
