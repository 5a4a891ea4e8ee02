//! Storage instance contract
//!
//! Every backend implements [`StorageInstance`] with identical observable
//! semantics:
//!
//! - `bulk_write` applies a batch atomically and reports per-row conflicts
//!   in its error map, never as an `Err`
//! - one [`EventBulk`] is published on the change stream per batch with at
//!   least one successful row, in commit order
//! - queries see either all or none of a batch
//!
//! Backends:
//! - [`memory::MemoryStorage`]: maps and ordered index trees
//! - [`lmdb::LmdbStorage`]: LMDB via heed, one environment per database
//! - [`remote::RemoteStorage`]: forwards every call to the current leader

pub mod categorize;
pub mod lmdb;
pub mod memory;
pub mod queue;
pub mod registry;
pub mod remote;

pub use categorize::{CategorizedWrites, categorize_bulk_write_rows};
pub use queue::TaskQueue;
pub use registry::HandleRegistry;

use crate::document::{Checkpoint, DocumentData, now_lwt};
use crate::index::{IndexBound, IndexEncoder};
use crate::query::{MangoQuery, PreparedQuery, QueryPlan, prepare_count_query};
use crate::schema::Schema;
use crate::{Error, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast;
use tokio::sync::broadcast::error::RecvError;
use tracing::warn;

/// Default number of tombstones purged per `cleanup` call
pub const DEFAULT_CLEANUP_BATCH_SIZE: usize = 100;
/// Default change stream buffer
pub const DEFAULT_CHANGE_STREAM_CAPACITY: usize = 1024;

/// A proposed write with the writer's assumed current state
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BulkWriteRow {
    /// New state
    pub document: DocumentData,
    /// Assumed current state; `None` for inserts
    pub previous: Option<DocumentData>,
}

impl BulkWriteRow {
    /// Row inserting a new document
    pub fn insert(document: DocumentData) -> Self {
        Self {
            document,
            previous: None,
        }
    }

    /// Row updating `previous` to `document`
    pub fn update(previous: DocumentData, document: DocumentData) -> Self {
        Self {
            document,
            previous: Some(previous),
        }
    }
}

/// Why a row was rejected
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum WriteErrorKind {
    /// Assumed previous state does not match the stored state
    Conflict,
    /// The row changes the primary key of an existing document
    PrimaryKeyChanged,
    /// A new or changed attachment has no payload
    MissingAttachmentData,
}

impl WriteErrorKind {
    /// HTTP-like status code
    pub fn status(self) -> u16 {
        match self {
            Self::Conflict => 409,
            Self::PrimaryKeyChanged => 422,
            Self::MissingAttachmentData => 510,
        }
    }
}

/// A rejected row
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WriteError {
    /// Status code, see [`WriteErrorKind::status`]
    pub status: u16,
    /// Rejection reason
    pub kind: WriteErrorKind,
    /// Primary key of the row
    pub document_id: String,
    /// The rejected row
    pub write_row: BulkWriteRow,
    /// Actual stored state, when one exists
    pub document_in_db: Option<DocumentData>,
    /// Offending attachment for `MissingAttachmentData`
    pub attachment_id: Option<String>,
}

impl WriteError {
    /// Build an error of `kind` for a row
    pub fn new(
        kind: WriteErrorKind,
        document_id: impl Into<String>,
        write_row: BulkWriteRow,
        document_in_db: Option<DocumentData>,
    ) -> Self {
        Self {
            status: kind.status(),
            kind,
            document_id: document_id.into(),
            write_row,
            document_in_db,
            attachment_id: None,
        }
    }
}

/// Result of `bulk_write`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BulkWriteResponse {
    /// Stored state of every written document
    pub success: BTreeMap<String, DocumentData>,
    /// Rejected rows by primary key
    pub error: BTreeMap<String, WriteError>,
}

/// Change event operation
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Operation {
    /// Document created, or revived from a tombstone
    Insert,
    /// Document changed
    Update,
    /// Document soft-deleted
    Delete,
}

/// One document change
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeEvent {
    /// `<bulkId>|<rowIndex>|<docId>|<rev>`
    pub event_id: String,
    /// Primary key
    pub document_id: String,
    /// Kind of change
    pub operation: Operation,
    /// New state, without attachment payloads
    pub document_data: DocumentData,
    /// Previous state for updates and deletes
    pub previous_document_data: Option<DocumentData>,
}

/// All changes committed by one `bulk_write`
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct EventBulk {
    /// Unique bulk id
    pub id: String,
    /// Events in row order
    pub events: Vec<ChangeEvent>,
    /// Position of the newest written document
    pub checkpoint: Option<Checkpoint>,
    /// Caller supplied context
    pub context: String,
    /// Categorization start, epoch millis
    pub start_time: f64,
    /// Commit time, epoch millis
    pub end_time: f64,
}

/// Result of `count`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct CountResult {
    /// Number of matching non-deleted documents
    pub count: usize,
    /// Whether the index alone answered the count
    pub mode: CountMode,
}

/// How a count was computed
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CountMode {
    /// Index range only
    Fast,
    /// Documents were materialized and matched
    Slow,
}

/// Result of `get_changed_documents_since`
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ChangedDocuments {
    /// Documents ordered by `(lwt, primary key)`, tombstones included
    pub documents: Vec<DocumentData>,
    /// Position of the last returned document, or the input checkpoint
    pub checkpoint: Option<Checkpoint>,
}

/// Backend specific knobs carried into every instance
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct InstanceOptions {
    /// Maximum tombstones purged per `cleanup` call
    pub cleanup_batch_size: usize,
    /// Change stream buffer size
    pub change_stream_capacity: usize,
}

impl Default for InstanceOptions {
    fn default() -> Self {
        Self {
            cleanup_batch_size: DEFAULT_CLEANUP_BATCH_SIZE,
            change_stream_capacity: DEFAULT_CHANGE_STREAM_CAPACITY,
        }
    }
}

/// Parameters of `create_storage_instance`
#[derive(Debug, Clone)]
pub struct StorageInstanceParams {
    /// Database name
    pub database_name: String,
    /// Collection name
    pub collection_name: String,
    /// Collection schema
    pub schema: Arc<Schema>,
    /// Backend options
    pub options: InstanceOptions,
    /// Whether other processes may open the same instance
    pub multi_instance: bool,
}

impl StorageInstanceParams {
    /// Params with default options
    pub fn new(
        database_name: impl Into<String>,
        collection_name: impl Into<String>,
        schema: Schema,
    ) -> Self {
        Self {
            database_name: database_name.into(),
            collection_name: collection_name.into(),
            schema: Arc::new(schema),
            options: InstanceOptions::default(),
            multi_instance: false,
        }
    }

    /// Key shared by every instance of the same collection version
    pub fn instance_key(&self) -> String {
        format!(
            "{}|{}|{}",
            self.database_name, self.collection_name, self.schema.version
        )
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.database_name.is_empty() || self.collection_name.is_empty() {
            return Err(Error::validation(
                "database and collection names must not be empty",
            ));
        }
        self.schema.validate()
    }
}

/// Live subscription to committed event bulks
///
/// Only bulks committed after subscribing are delivered; history must be
/// read with `get_changed_documents_since`.
pub struct ChangeStream {
    receiver: broadcast::Receiver<Arc<EventBulk>>,
}

impl ChangeStream {
    /// Wrap a broadcast receiver
    pub fn new(receiver: broadcast::Receiver<Arc<EventBulk>>) -> Self {
        Self { receiver }
    }

    /// Next bulk, `None` once the instance is gone
    pub async fn next(&mut self) -> Option<Arc<EventBulk>> {
        loop {
            match self.receiver.recv().await {
                Ok(bulk) => return Some(bulk),
                Err(RecvError::Lagged(skipped)) => {
                    warn!("change stream subscriber lagged, skipped {} bulks", skipped);
                }
                Err(RecvError::Closed) => return None,
            }
        }
    }
}

/// Uniform contract over every storage backend
#[async_trait]
pub trait StorageInstance: Send + Sync {
    /// Database this instance belongs to
    fn database_name(&self) -> &str;

    /// Collection this instance stores
    fn collection_name(&self) -> &str;

    /// Collection schema
    fn schema(&self) -> &Arc<Schema>;

    /// Apply a batch of writes in one transaction
    async fn bulk_write(&self, rows: Vec<BulkWriteRow>, context: &str)
    -> Result<BulkWriteResponse>;

    /// Point lookups; ids without a stored document are omitted
    async fn find_documents_by_id(
        &self,
        ids: &[String],
        with_deleted: bool,
    ) -> Result<BTreeMap<String, DocumentData>>;

    /// Execute a prepared query
    async fn query(&self, query: &PreparedQuery) -> Result<Vec<DocumentData>>;

    /// Count matches of a prepared count query
    async fn count(&self, query: &PreparedQuery) -> Result<CountResult>;

    /// Documents strictly after `checkpoint` in `(lwt, primary key)` order
    async fn get_changed_documents_since(
        &self,
        limit: usize,
        checkpoint: Option<&Checkpoint>,
    ) -> Result<ChangedDocuments>;

    /// Subscribe to future event bulks
    fn change_stream(&self) -> ChangeStream;

    /// Base64 payload of an attachment
    async fn get_attachment_data(&self, document_id: &str, attachment_id: &str) -> Result<String>;

    /// Purge tombstones older than `minimum_deleted_age`; `true` when done
    async fn cleanup(&self, minimum_deleted_age: Duration) -> Result<bool>;

    /// Release resources; closing twice is a no-op
    async fn close(&self) -> Result<()>;

    /// Delete all data of this instance, then close it
    async fn remove(&self) -> Result<()>;
}

/// Factory of storage instances
#[async_trait]
pub trait Storage: Send + Sync {
    /// Backend name, for logs
    fn name(&self) -> &'static str;

    /// Open (or attach to) the instance described by `params`
    async fn create_storage_instance(
        &self,
        params: StorageInstanceParams,
    ) -> Result<Arc<dyn StorageInstance>>;
}

/// Write a single row, turning a row error into `Error::Conflict`
pub async fn write_single(
    instance: &dyn StorageInstance,
    row: BulkWriteRow,
    context: &str,
) -> Result<DocumentData> {
    let primary = instance.schema().primary_path().to_string();
    let id = row
        .document
        .primary(&primary)
        .ok_or_else(|| Error::validation(format!("row has no primary key '{primary}'")))?
        .to_string();
    let mut response = instance.bulk_write(vec![row], context).await?;
    if let Some(err) = response.error.remove(&id) {
        return Err(err.into());
    }
    response
        .success
        .remove(&id)
        .ok_or_else(|| Error::internal(format!("bulk write returned no result for '{id}'")))
}

/// Fetch one document, tombstones included
pub async fn get_single_document(
    instance: &dyn StorageInstance,
    id: &str,
) -> Result<Option<DocumentData>> {
    let mut docs = instance
        .find_documents_by_id(&[id.to_string()], true)
        .await?;
    Ok(docs.remove(id))
}

/// Number of non-deleted documents
pub async fn count_all_documents(instance: &dyn StorageInstance) -> Result<usize> {
    let query = prepare_count_query(instance.schema(), MangoQuery::default())?;
    Ok(instance.count(&query).await?.count)
}

/// Range bounds over index strings, or `None` when the range is empty
pub(crate) fn index_range(
    lower: String,
    upper: String,
    inclusive_start: bool,
    inclusive_end: bool,
) -> Option<(Bound<String>, Bound<String>)> {
    if lower > upper || (lower == upper && !(inclusive_start && inclusive_end)) {
        return None;
    }
    let start = if inclusive_start {
        Bound::Included(lower)
    } else {
        Bound::Excluded(lower)
    };
    let end = if inclusive_end {
        Bound::Included(upper)
    } else {
        Bound::Excluded(upper)
    };
    Some((start, end))
}

/// Storage index fields a query plan traverses
pub(crate) fn plan_index(plan: &QueryPlan) -> Vec<String> {
    Schema::live_index(&plan.index)
}

/// Key range of a query plan over its live index
///
/// The leading `_deleted` field is pinned to `false`, so the range never
/// yields tombstones.
pub(crate) fn plan_range(
    encoder: &IndexEncoder,
    plan: &QueryPlan,
) -> Option<(Bound<String>, Bound<String>)> {
    let live = |keys: &[IndexBound]| {
        std::iter::once(IndexBound::Value(Value::Bool(false)))
            .chain(keys.iter().cloned())
            .collect::<Vec<_>>()
    };
    index_range(
        encoder.lower_bound(&live(&plan.start_keys)),
        encoder.upper_bound(&live(&plan.end_keys)),
        plan.inclusive_start,
        plan.inclusive_end,
    )
}

/// Key range of the changes index strictly after `checkpoint`
pub(crate) fn changes_range(
    encoder: &IndexEncoder,
    checkpoint: Option<&Checkpoint>,
) -> Option<(Bound<String>, Bound<String>)> {
    let upper = encoder.upper_bound(&[]);
    match checkpoint {
        Some(cp) => index_range(
            encoder.lower_bound(&[
                IndexBound::Value(Value::from(cp.lwt)),
                IndexBound::Value(Value::String(cp.id.clone())),
            ]),
            upper,
            false,
            true,
        ),
        None => index_range(encoder.lower_bound(&[]), upper, true, true),
    }
}

/// Key range of the cleanup index covering tombstones written up to `max_lwt`
pub(crate) fn cleanup_range(
    encoder: &IndexEncoder,
    max_lwt: f64,
) -> Option<(Bound<String>, Bound<String>)> {
    index_range(
        encoder.lower_bound(&[IndexBound::Value(Value::Bool(true))]),
        encoder.upper_bound(&[
            IndexBound::Value(Value::Bool(true)),
            IndexBound::Value(Value::from(max_lwt)),
        ]),
        true,
        true,
    )
}

/// Latest lwt a tombstone may carry to be purged by `cleanup`
pub(crate) fn cleanup_threshold(minimum_deleted_age: Duration) -> f64 {
    now_lwt() - minimum_deleted_age.as_millis() as f64
}

/// Key of an attachment payload in backend maps
pub(crate) fn attachment_key(document_id: &str, attachment_id: &str) -> String {
    format!("{document_id}||{attachment_id}")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_index_range_guards() {
        assert!(index_range("b".into(), "a".into(), true, true).is_none());
        assert!(index_range("a".into(), "a".into(), true, false).is_none());
        assert!(index_range("a".into(), "a".into(), true, true).is_some());
        assert!(matches!(
            index_range("a".into(), "b".into(), false, true),
            Some((Bound::Excluded(_), Bound::Included(_)))
        ));
    }

    #[test]
    fn test_write_error_status() {
        assert_eq!(WriteErrorKind::Conflict.status(), 409);
        assert_eq!(WriteErrorKind::MissingAttachmentData.status(), 510);
        assert_eq!(WriteErrorKind::PrimaryKeyChanged.status(), 422);
    }

    #[test]
    fn test_event_wire_shape() {
        let event = ChangeEvent {
            event_id: "b|0|a|1-x".into(),
            document_id: "a".into(),
            operation: Operation::Insert,
            document_data: DocumentData::default(),
            previous_document_data: None,
        };
        let value = serde_json::to_value(&event).unwrap();
        assert_eq!(value["operation"], "INSERT");
        assert!(value.get("documentData").is_some());
    }
}
