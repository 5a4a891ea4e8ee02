//! Database
//!
//! A [`Database`] owns one storage backend, an internal store recording the
//! schema of every collection version, and the collections opened on it.
//!
//! Internal store records have the shape `{ id, context, key, data }` with
//! `id = "<context>|<key>"`. Collection metas use the `collection` context
//! and the key `<name>-<version>`; migration status records use
//! `migration-status`.

use crate::collection::Collection;
use crate::config::DatabaseConfig;
use crate::document::{DocumentData, now_lwt};
use crate::leader::{BroadcastChannel, LeaderElector};
use crate::local_documents::LocalDocuments;
use crate::migration::{MigrationContext, MigrationState, MigrationStrategies};
use crate::query::{MangoQuery, prepare_query};
use crate::revision::{create_revision, random_token};
use crate::schema::Schema;
use crate::storage::{
    BulkWriteRow, InstanceOptions, Storage, StorageInstance, StorageInstanceParams, write_single,
};
use crate::{Error, Result};
use parking_lot::RwLock;
use regex::Regex;
use serde_json::{Map, Value, json};
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, OnceLock};
use tokio::sync::OnceCell;
use tracing::{debug, info};

/// Collection name of the internal store
pub const INTERNAL_STORE_NAME: &str = "docsync-internal";
/// Context of collection meta records
pub const COLLECTION_CONTEXT: &str = "collection";
/// Context of migration status records
pub const MIGRATION_STATUS_CONTEXT: &str = "migration-status";

/// Names that would shadow database accessors
pub const RESERVED_COLLECTION_NAMES: &[&str] = &[
    "destroy",
    "remove",
    "close",
    "collections",
    "storage",
    "internal",
    "local",
    "name",
    "token",
    "config",
];

/// Attempts at writing a collection meta before giving up
const META_WRITE_ATTEMPTS: usize = 8;

fn collection_name_pattern() -> &'static Regex {
    static PATTERN: OnceLock<Regex> = OnceLock::new();
    PATTERN.get_or_init(|| {
        Regex::new(r"^[a-z][_$a-z0-9\-]*$").unwrap_or_else(|e| panic!("invalid name pattern: {e}"))
    })
}

/// Check a collection name against the naming rules
pub fn validate_collection_name(name: &str) -> Result<()> {
    if !collection_name_pattern().is_match(name) {
        return Err(Error::validation(format!(
            "collection name '{name}' must start with a lowercase letter and contain only \
             a-z, 0-9, '_', '$' and '-'"
        )));
    }
    if RESERVED_COLLECTION_NAMES.contains(&name) {
        return Err(Error::validation(format!(
            "collection name '{name}' is reserved"
        )));
    }
    Ok(())
}

/// Schema of the internal store
pub fn internal_store_schema() -> Result<Schema> {
    Schema::from_value(json!({
        "title": "internal store",
        "version": 0,
        "primaryKey": "id",
        "type": "object",
        "properties": {
            "id": { "type": "string", "maxLength": 256 },
            "context": { "type": "string", "maxLength": 64 },
            "key": { "type": "string", "maxLength": 256 },
            "data": { "type": "object" }
        },
        "required": ["id", "context", "key", "data"]
    }))
}

/// Primary key of an internal record
pub fn internal_id(context: &str, key: &str) -> String {
    format!("{context}|{key}")
}

pub(crate) fn internal_record(context: &str, key: &str, data: Value) -> Map<String, Value> {
    let mut record = Map::new();
    record.insert("id".to_string(), Value::String(internal_id(context, key)));
    record.insert("context".to_string(), Value::String(context.to_string()));
    record.insert("key".to_string(), Value::String(key.to_string()));
    record.insert("data".to_string(), data);
    record
}

fn meta_version(meta: &DocumentData) -> Option<u32> {
    meta.get_path("data.version")
        .and_then(|v| v.as_u64())
        .and_then(|v| u32::try_from(v).ok())
}

/// Live collection metas of `name`, any version
pub(crate) async fn collection_metas(
    internal: &Arc<dyn StorageInstance>,
    name: &str,
) -> Result<Vec<DocumentData>> {
    let query = MangoQuery::with_selector(json!({
        "context": COLLECTION_CONTEXT,
        "data.name": name
    }))?;
    let prepared = prepare_query(internal.schema(), query)?;
    internal.query(&prepared).await
}

/// Highest recorded meta of `name` below `current_version`
pub(crate) async fn old_collection_meta(
    internal: &Arc<dyn StorageInstance>,
    name: &str,
    current_version: u32,
) -> Result<Option<DocumentData>> {
    let metas = collection_metas(internal, name).await?;
    Ok(metas
        .into_iter()
        .filter(|meta| !meta.deleted)
        .filter_map(|meta| meta_version(&meta).map(|version| (version, meta)))
        .filter(|(version, _)| *version < current_version)
        .max_by_key(|(version, _)| *version)
        .map(|(_, meta)| meta))
}

/// A collection opened by [`Database::add_collection`]
pub struct AddedCollection {
    /// The collection
    pub collection: Arc<Collection>,
    /// Pending migration from an older schema version
    pub migration: Option<Arc<MigrationState>>,
}

/// Offline-first document database
pub struct Database {
    name: String,
    token: String,
    config: DatabaseConfig,
    storage: Arc<dyn Storage>,
    internal: Arc<dyn StorageInstance>,
    collections: RwLock<HashMap<String, Arc<Collection>>>,
    migrations: RwLock<HashMap<String, Arc<MigrationState>>>,
    channel: Option<BroadcastChannel>,
    elector: OnceCell<Arc<LeaderElector>>,
    local: OnceCell<LocalDocuments>,
    closed: AtomicBool,
}

impl Database {
    /// Open the database described by `config` on `storage`
    ///
    /// A multi-instance database gets a private election channel; use
    /// [`Database::create_with_channel`] to share one between participants.
    pub async fn create(config: DatabaseConfig, storage: Arc<dyn Storage>) -> Result<Arc<Self>> {
        let channel = config.multi_instance.then(BroadcastChannel::default);
        Self::open(config, storage, channel).await
    }

    /// Open a participant of a multi-instance database
    pub async fn create_with_channel(
        config: DatabaseConfig,
        storage: Arc<dyn Storage>,
        channel: BroadcastChannel,
    ) -> Result<Arc<Self>> {
        Self::open(config, storage, Some(channel)).await
    }

    async fn open(
        config: DatabaseConfig,
        storage: Arc<dyn Storage>,
        channel: Option<BroadcastChannel>,
    ) -> Result<Arc<Self>> {
        config.validate()?;
        let mut params =
            StorageInstanceParams::new(&config.name, INTERNAL_STORE_NAME, internal_store_schema()?);
        params.options = instance_options(&config);
        params.multi_instance = config.multi_instance;
        let internal = storage.create_storage_instance(params).await?;

        let token = random_token(10);
        info!(
            "Opened database {} on {} storage (token {})",
            config.name,
            storage.name(),
            token
        );
        Ok(Arc::new(Self {
            name: config.name.clone(),
            token,
            config,
            storage,
            internal,
            collections: RwLock::new(HashMap::new()),
            migrations: RwLock::new(HashMap::new()),
            channel,
            elector: OnceCell::new(),
            local: OnceCell::new(),
            closed: AtomicBool::new(false),
        }))
    }

    /// Database name
    pub fn name(&self) -> &str {
        &self.name
    }

    /// Writer token stamped into every revision written here
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Configuration
    pub fn config(&self) -> &DatabaseConfig {
        &self.config
    }

    /// Storage backend
    pub fn storage(&self) -> &Arc<dyn Storage> {
        &self.storage
    }

    /// Internal store instance
    pub fn internal_store(&self) -> &Arc<dyn StorageInstance> {
        &self.internal
    }

    /// Whether [`Database::close`] ran
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    fn ensure_open(&self) -> Result<()> {
        if self.is_closed() {
            return Err(Error::closed(format!("database '{}' is closed", self.name)));
        }
        Ok(())
    }

    /// Open collection `name` with `schema`
    ///
    /// Records the schema in the internal store. Reopening the same version
    /// with a different schema fails; a higher version than recorded yields
    /// a [`MigrationState`] for the documents of the older one.
    pub async fn add_collection(
        &self,
        name: &str,
        schema: Schema,
        strategies: MigrationStrategies,
    ) -> Result<AddedCollection> {
        self.ensure_open()?;
        validate_collection_name(name)?;
        if self.collections.read().contains_key(name) {
            return Err(Error::validation(format!(
                "collection '{name}' already exists on database '{}'",
                self.name
            )));
        }
        schema.validate()?;
        strategies.validate(schema.version)?;

        self.record_collection_meta(name, &schema).await?;

        let mut params = StorageInstanceParams::new(&self.name, name, schema);
        params.options = instance_options(&self.config);
        params.multi_instance = self.config.multi_instance;
        let instance = self.storage.create_storage_instance(params).await?;

        let migration = match old_collection_meta(&self.internal, name, instance.schema().version)
            .await?
        {
            Some(old) => {
                debug!(
                    "Collection {} has documents of v{:?} to migrate",
                    name,
                    meta_version(&old)
                );
                let state = Arc::new(MigrationState::new(
                    self.migration_context(),
                    instance.clone(),
                    strategies,
                ));
                self.migrations
                    .write()
                    .insert(name.to_string(), state.clone());
                Some(state)
            }
            None => None,
        };

        let collection = Collection::new(
            name,
            &self.name,
            &self.token,
            instance,
            self.storage.clone(),
            &self.config,
        );
        let mut collections = self.collections.write();
        if collections.contains_key(name) {
            return Err(Error::validation(format!(
                "collection '{name}' already exists on database '{}'",
                self.name
            )));
        }
        collections.insert(name.to_string(), collection.clone());
        info!("Added collection {} to {}", name, self.name);
        Ok(AddedCollection {
            collection,
            migration,
        })
    }

    /// Insert the meta of `name` at `schema.version`, or check the recorded
    /// one against `schema`
    async fn record_collection_meta(&self, name: &str, schema: &Schema) -> Result<()> {
        let metas = collection_metas(&self.internal, name).await?;
        if let Some(newer) = metas
            .iter()
            .filter(|meta| !meta.deleted)
            .filter_map(meta_version)
            .find(|version| *version > schema.version)
        {
            return Err(Error::schema(format!(
                "collection '{name}' is stored at v{newer}, newer than v{}",
                schema.version
            )));
        }

        let key = format!("{name}-{}", schema.version);
        let id = internal_id(COLLECTION_CONTEXT, &key);
        let fingerprint = schema.fingerprint();
        let data = json!({
            "name": name,
            "version": schema.version,
            "schema": schema,
            "schemaHash": fingerprint,
        });

        let mut current = metas.into_iter().find(|meta| meta.primary("id") == Some(id.as_str()));
        for _ in 0..META_WRITE_ATTEMPTS {
            match current.take() {
                Some(existing) if !existing.deleted => {
                    let recorded = existing.get_path("data.schemaHash");
                    if recorded.as_deref().and_then(Value::as_str) != Some(fingerprint.as_str()) {
                        return Err(Error::schema(format!(
                            "schema of collection '{name}' v{} changed without a version bump",
                            schema.version
                        )));
                    }
                    return Ok(());
                }
                previous => {
                    let mut document =
                        DocumentData::new(internal_record(COLLECTION_CONTEXT, &key, data.clone()));
                    document.rev = create_revision(&self.token, previous.as_ref())?;
                    document.meta.lwt = now_lwt();
                    let row = BulkWriteRow { document, previous };
                    match write_single(self.internal.as_ref(), row, COLLECTION_CONTEXT).await {
                        Ok(_) => return Ok(()),
                        Err(err) => match err.as_conflict() {
                            Some(conflict) => current = conflict.document_in_db.clone(),
                            None => return Err(err),
                        },
                    }
                }
            }
        }
        Err(Error::schema(format!(
            "collection meta of '{name}' kept conflicting"
        )))
    }

    fn migration_context(&self) -> MigrationContext {
        MigrationContext {
            storage: self.storage.clone(),
            database_name: self.name.clone(),
            token: self.token.clone(),
            internal: self.internal.clone(),
            multi_instance: self.config.multi_instance,
            channel: self.channel.clone(),
            config: self.config.migration.clone(),
            replication: self.config.replication.clone(),
            leader: self.config.leader.clone(),
        }
    }

    /// Open collection `name`
    pub fn collection(&self, name: &str) -> Option<Arc<Collection>> {
        self.collections.read().get(name).cloned()
    }

    /// Names of the open collections, sorted
    pub fn collection_names(&self) -> Vec<String> {
        let mut names: Vec<String> = self.collections.read().keys().cloned().collect();
        names.sort();
        names
    }

    /// Migration of `name` created by [`Database::add_collection`]
    pub fn migration_state(&self, name: &str) -> Option<Arc<MigrationState>> {
        self.migrations.read().get(name).cloned()
    }

    /// Database-level local documents
    pub async fn local_documents(&self) -> Result<&LocalDocuments> {
        self.ensure_open()?;
        self.local
            .get_or_try_init(|| {
                LocalDocuments::open(self.storage.as_ref(), &self.name, &self.name, &self.token)
            })
            .await
    }

    /// Participant of the database-wide election
    ///
    /// Fails for single-instance databases, which have nobody to elect.
    pub async fn leader_elector(&self) -> Result<Arc<LeaderElector>> {
        self.ensure_open()?;
        let Some(channel) = &self.channel else {
            return Err(Error::leadership(format!(
                "database '{}' is not multi-instance",
                self.name
            )));
        };
        let elector = self
            .elector
            .get_or_init(|| async {
                Arc::new(LeaderElector::start_with_token(
                    channel,
                    format!("database|{}", self.name),
                    self.token.clone(),
                    &self.config.leader,
                ))
            })
            .await;
        Ok(elector.clone())
    }

    /// Whether this participant leads; single-instance databases always do
    pub async fn is_leader(&self) -> Result<bool> {
        if self.channel.is_none() {
            return Ok(true);
        }
        Ok(self.leader_elector().await?.is_leader())
    }

    /// Close every collection, the internal store and the election
    pub async fn close(&self) -> Result<()> {
        if self.closed.swap(true, Ordering::SeqCst) {
            return Ok(());
        }
        let migrations: Vec<_> = self.migrations.write().drain().map(|(_, m)| m).collect();
        for migration in migrations {
            migration.cancel().await;
        }
        let collections: Vec<_> = self.collections.write().drain().map(|(_, c)| c).collect();
        for collection in collections {
            collection.close().await?;
        }
        if let Some(local) = self.local.get() {
            local.close().await?;
        }
        if let Some(elector) = self.elector.get() {
            elector.die().await;
        }
        self.internal.close().await?;
        info!("Closed database {}", self.name);
        Ok(())
    }

    /// Delete every document of every open collection and the internal store
    pub async fn remove(&self) -> Result<()> {
        self.ensure_open()?;
        let collections: Vec<_> = self.collections.read().values().cloned().collect();
        for collection in collections {
            collection.remove().await?;
        }
        if let Some(local) = self.local.get() {
            local.remove_all().await?;
        }
        self.internal.remove().await?;
        self.closed.store(true, Ordering::SeqCst);
        self.collections.write().clear();
        if let Some(elector) = self.elector.get() {
            elector.die().await;
        }
        info!("Removed database {}", self.name);
        Ok(())
    }
}

fn instance_options(config: &DatabaseConfig) -> InstanceOptions {
    InstanceOptions {
        cleanup_batch_size: config.cleanup.batch_size,
        change_stream_capacity: config.storage.change_stream_capacity,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryStorage;
    use crate::testing::fixtures;

    async fn database(storage: Arc<dyn Storage>) -> Arc<Database> {
        Database::create(DatabaseConfig::named("testdb"), storage)
            .await
            .unwrap()
    }

    #[test]
    fn test_collection_names() {
        validate_collection_name("humans").unwrap();
        validate_collection_name("human_2$-x").unwrap();
        assert!(validate_collection_name("Humans").is_err());
        assert!(validate_collection_name("2humans").is_err());
        assert!(validate_collection_name("").is_err());
        assert!(validate_collection_name("local").is_err());
    }

    #[test]
    fn test_internal_record_shape() {
        let record = internal_record(COLLECTION_CONTEXT, "humans-0", json!({ "a": 1 }));
        assert_eq!(
            Value::Object(record),
            json!({
                "id": "collection|humans-0",
                "context": "collection",
                "key": "humans-0",
                "data": { "a": 1 }
            })
        );
    }

    #[tokio::test]
    async fn test_add_collection_records_meta() {
        let db = database(Arc::new(MemoryStorage::new())).await;
        let added = db
            .add_collection("humans", fixtures::human_schema(), MigrationStrategies::new())
            .await
            .unwrap();
        assert!(added.migration.is_none());
        assert_eq!(db.collection_names(), vec!["humans".to_string()]);

        let metas = collection_metas(db.internal_store(), "humans").await.unwrap();
        assert_eq!(metas.len(), 1);
        assert_eq!(metas[0].primary("id"), Some("collection|humans-0"));

        let again = db
            .add_collection("humans", fixtures::human_schema(), MigrationStrategies::new())
            .await;
        assert!(again.is_err());
    }

    #[tokio::test]
    async fn test_changed_schema_without_bump_is_rejected() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let first = database(storage.clone()).await;
        first
            .add_collection("humans", fixtures::human_schema(), MigrationStrategies::new())
            .await
            .unwrap();

        let mut changed = fixtures::human_schema();
        changed.title = "people".to_string();
        let second = database(storage).await;
        let err = second
            .add_collection("humans", changed, MigrationStrategies::new())
            .await
            .err()
            .unwrap();
        assert!(matches!(err, Error::Schema(_)));
    }

    #[tokio::test]
    async fn test_version_bump_creates_migration() {
        let storage: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let first = database(storage.clone()).await;
        first
            .add_collection("humans", fixtures::human_schema(), MigrationStrategies::new())
            .await
            .unwrap();

        let second = database(storage).await;
        let added = second
            .add_collection(
                "humans",
                fixtures::human_schema().with_version(1),
                MigrationStrategies::new().with(1, Some),
            )
            .await
            .unwrap();
        let migration = added.migration.unwrap();
        assert!(migration.must_migrate().await.unwrap());
        assert!(second.migration_state("humans").is_some());
    }

    #[tokio::test]
    async fn test_single_instance_is_always_leader() {
        let db = database(Arc::new(MemoryStorage::new())).await;
        assert!(db.is_leader().await.unwrap());
        assert!(db.leader_elector().await.is_err());
        db.close().await.unwrap();
        assert!(db.local_documents().await.is_err());
    }
}
