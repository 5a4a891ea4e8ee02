//! Master/fork checkpoint replication
//!
//! A [`ReplicationState`] drives one fork instance against a master reached
//! through [`PullHandler`] / [`PushHandler`]. Each cycle runs
//! `Pushing -> Pulling -> Idle`; a failed cycle waits in `RetryWait` and
//! starts over from the push phase.
//!
//! - Push drains every fork change after the persisted push checkpoint
//!   before pull is attempted.
//! - A pulled batch is dropped when the fork got a local change while it was
//!   being fetched; the cycle then restarts from push.
//! - Pulled writes carry the replication tag as revision hash so the push
//!   phase and the live trigger can tell them apart from local writes.
//! - Conflicts returned by the push handler are resolved master-wins.

pub mod checkpoint;
pub mod error;
pub mod handler;

pub use checkpoint::ReplicationMeta;
pub use error::ReplicationError;
pub use handler::{PullHandler, PullResult, PushHandler, PushRow, StorageReplicationHandler};

use crate::config::ReplicationDefaults;
use crate::document::{DocumentData, now_lwt};
use crate::revision::{create_revision, hash_token, revision_hash};
use crate::storage::{BulkWriteRow, ChangeStream, StorageInstance};
use crate::{Error, Result};
use parking_lot::Mutex;
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::sync::{Notify, broadcast, watch};
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

/// Context of writes performed on the fork by a pull
pub const PULL_CONTEXT: &str = "replication-pull";

const ERROR_STREAM_CAPACITY: usize = 64;

/// Phase of the replication driver
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReplicationPhase {
    /// Waiting for a trigger
    Idle,
    /// Sending fork changes to the master
    Pushing,
    /// Fetching master changes into the fork
    Pulling,
    /// Waiting out the retry delay after a failure
    RetryWait,
    /// Canceled, or done in non-live mode
    Stopped,
}

/// Settings of one replication
#[derive(Clone)]
pub struct ReplicationOptions {
    /// Stable identifier; its hash tags pulled revisions
    pub identifier: String,
    /// Documents per push or pull batch
    pub batch_size: usize,
    /// Keep running after the initial sync
    pub live: bool,
    /// Delay before retrying a failed cycle
    pub retry_time: Duration,
    /// Interval of the live pull timer
    pub live_interval: Duration,
    /// Master change source, `None` for push-only
    pub pull: Option<Arc<dyn PullHandler>>,
    /// Master change sink, `None` for pull-only
    pub push: Option<Arc<dyn PushHandler>>,
}

impl ReplicationOptions {
    /// Options for `identifier` with the configured defaults and no handlers
    pub fn new(identifier: impl Into<String>, defaults: &ReplicationDefaults) -> Self {
        Self {
            identifier: identifier.into(),
            batch_size: defaults.batch_size,
            live: defaults.live,
            retry_time: defaults.retry_time,
            live_interval: defaults.live_interval,
            pull: None,
            push: None,
        }
    }

    /// Set the pull handler
    pub fn with_pull(mut self, handler: Arc<dyn PullHandler>) -> Self {
        self.pull = Some(handler);
        self
    }

    /// Set the push handler
    pub fn with_push(mut self, handler: Arc<dyn PushHandler>) -> Self {
        self.push = Some(handler);
        self
    }

    /// Run one initial sync and stop
    pub fn once(mut self) -> Self {
        self.live = false;
        self
    }

    fn validate(&self) -> Result<()> {
        if self.identifier.is_empty() {
            return Err(Error::validation("replication identifier must not be empty"));
        }
        if self.batch_size == 0 {
            return Err(Error::validation("replication batch size must be positive"));
        }
        if self.pull.is_none() && self.push.is_none() {
            return Err(Error::validation(
                "replication needs a pull handler, a push handler or both",
            ));
        }
        Ok(())
    }
}

enum Cycle {
    Complete,
    Restart,
    Canceled,
}

struct Shared {
    fork: Arc<dyn StorageInstance>,
    meta: ReplicationMeta,
    options: ReplicationOptions,
    primary_path: String,
    tag: String,
    canceled: watch::Sender<bool>,
    trigger: Notify,
    phase: watch::Sender<ReplicationPhase>,
    initial_sync: watch::Sender<bool>,
    in_sync: watch::Sender<bool>,
    errors: broadcast::Sender<ReplicationError>,
    received: AtomicU64,
    sent: AtomicU64,
}

/// A running replication of one fork instance
pub struct ReplicationState {
    shared: Arc<Shared>,
    driver: Mutex<Option<JoinHandle<()>>>,
    listener: Mutex<Option<JoinHandle<()>>>,
}

impl ReplicationState {
    /// Validate `options` and spawn the driver
    pub fn start(
        fork: Arc<dyn StorageInstance>,
        meta: ReplicationMeta,
        options: ReplicationOptions,
    ) -> Result<Self> {
        Self::start_with_errors(fork, meta, options).map(|(state, _)| state)
    }

    /// Like [`ReplicationState::start`], also returning an error receiver
    /// subscribed before the driver runs its first cycle
    pub fn start_with_errors(
        fork: Arc<dyn StorageInstance>,
        meta: ReplicationMeta,
        options: ReplicationOptions,
    ) -> Result<(Self, broadcast::Receiver<ReplicationError>)> {
        options.validate()?;
        let tag = hash_token(&options.identifier);
        let primary_path = fork.schema().primary_path().to_string();
        let (errors, first_errors) = broadcast::channel(ERROR_STREAM_CAPACITY);
        let shared = Arc::new(Shared {
            fork,
            meta,
            primary_path,
            tag,
            canceled: watch::channel(false).0,
            trigger: Notify::new(),
            phase: watch::channel(ReplicationPhase::Idle).0,
            initial_sync: watch::channel(false).0,
            in_sync: watch::channel(false).0,
            errors,
            received: AtomicU64::new(0),
            sent: AtomicU64::new(0),
            options,
        });

        info!(
            "Starting replication {} of {} (live: {})",
            shared.options.identifier,
            shared.fork.collection_name(),
            shared.options.live
        );

        let listener = (shared.options.live && shared.options.push.is_some()).then(|| {
            let stream = shared.fork.change_stream();
            tokio::spawn(watch_local_changes(Arc::downgrade(&shared), stream))
        });
        let driver = tokio::spawn(drive(shared.clone()));

        let state = Self {
            shared,
            driver: Mutex::new(Some(driver)),
            listener: Mutex::new(listener),
        };
        Ok((state, first_errors))
    }

    /// Identifier of this replication
    pub fn identifier(&self) -> &str {
        &self.shared.options.identifier
    }

    /// Revision hash of documents written by pull
    pub fn pull_tag(&self) -> &str {
        &self.shared.tag
    }

    /// Persisted replication state
    pub fn meta(&self) -> &ReplicationMeta {
        &self.shared.meta
    }

    /// Request another cycle
    pub fn run(&self) {
        self.shared.in_sync.send_replace(false);
        self.shared.trigger.notify_one();
    }

    /// Stop after the current step; in-flight handler results are discarded
    pub fn cancel(&self) {
        if self.shared.canceled.send_replace(true) {
            return;
        }
        info!("Canceling replication {}", self.shared.options.identifier);
        if let Some(listener) = self.listener.lock().take() {
            listener.abort();
        }
    }

    /// Whether the driver is canceled or finished
    pub fn is_stopped(&self) -> bool {
        *self.shared.canceled.borrow()
            || *self.shared.phase.borrow() == ReplicationPhase::Stopped
    }

    /// Current phase updates
    pub fn phase(&self) -> watch::Receiver<ReplicationPhase> {
        self.shared.phase.subscribe()
    }

    /// Failed cycles
    pub fn errors(&self) -> broadcast::Receiver<ReplicationError> {
        self.shared.errors.subscribe()
    }

    /// Master documents written into the fork
    pub fn received(&self) -> u64 {
        self.shared.received.load(Ordering::SeqCst)
    }

    /// Fork documents accepted by the master
    pub fn sent(&self) -> u64 {
        self.shared.sent.load(Ordering::SeqCst)
    }

    /// Wait until the first full cycle completed
    pub async fn await_initial_sync(&self) -> Result<()> {
        self.wait_flag(&self.shared.initial_sync).await
    }

    /// Wait until a cycle completed with no fork change left to push
    pub async fn await_in_sync(&self) -> Result<()> {
        self.await_initial_sync().await?;
        loop {
            if *self.shared.phase.borrow() == ReplicationPhase::Stopped {
                return Ok(());
            }
            self.wait_flag(&self.shared.in_sync).await?;
            if !self.shared.has_unpushed_changes().await? {
                return Ok(());
            }
            debug!(
                "Replication {} has unpushed changes, running again",
                self.shared.options.identifier
            );
            self.run();
        }
    }

    /// Wait for the driver task to finish
    pub async fn join(&self) {
        let driver = self.driver.lock().take();
        if let Some(driver) = driver {
            if let Err(err) = driver.await {
                if !err.is_cancelled() {
                    error!("Replication driver panicked: {}", err);
                }
            }
        }
    }

    async fn wait_flag(&self, flag: &watch::Sender<bool>) -> Result<()> {
        let mut flag = flag.subscribe();
        let mut canceled = self.shared.canceled.subscribe();
        tokio::select! {
            result = flag.wait_for(|done| *done) => {
                result.map(|_| ()).map_err(|_| Error::replication("replication state dropped"))
            }
            _ = canceled.wait_for(|c| *c) => {
                Err(Error::replication(format!(
                    "replication {} was canceled",
                    self.shared.options.identifier
                )))
            }
        }
    }
}

impl Drop for ReplicationState {
    fn drop(&mut self) {
        self.shared.canceled.send_replace(true);
        if let Some(listener) = self.listener.get_mut().take() {
            listener.abort();
        }
    }
}

async fn drive(shared: Arc<Shared>) {
    let mut canceled = shared.canceled.subscribe();
    loop {
        if shared.is_canceled() {
            break;
        }
        match shared.cycle().await {
            Ok(Cycle::Complete) => {
                shared.initial_sync.send_replace(true);
                shared.in_sync.send_replace(true);
                if !shared.options.live {
                    break;
                }
                shared.phase.send_replace(ReplicationPhase::Idle);
                tokio::select! {
                    _ = shared.trigger.notified() => {}
                    _ = tokio::time::sleep(shared.options.live_interval) => {}
                    _ = canceled.wait_for(|c| *c) => break,
                }
            }
            Ok(Cycle::Restart) => {}
            Ok(Cycle::Canceled) => break,
            Err(err) => {
                error!(
                    "Replication {} failed, retrying in {:?}: {}",
                    shared.options.identifier, shared.options.retry_time, err
                );
                shared.in_sync.send_replace(false);
                let _ = shared.errors.send(err);
                shared.phase.send_replace(ReplicationPhase::RetryWait);
                tokio::select! {
                    _ = tokio::time::sleep(shared.options.retry_time) => {}
                    _ = canceled.wait_for(|c| *c) => break,
                }
            }
        }
    }
    shared.phase.send_replace(ReplicationPhase::Stopped);
    info!("Replication {} stopped", shared.options.identifier);
}

async fn watch_local_changes(shared: Weak<Shared>, mut stream: ChangeStream) {
    while let Some(bulk) = stream.next().await {
        let Some(shared) = shared.upgrade() else {
            break;
        };
        let local = bulk
            .events
            .iter()
            .any(|event| !shared.is_tagged(&event.document_data));
        if local {
            shared.in_sync.send_replace(false);
            shared.trigger.notify_one();
        }
    }
}

impl Shared {
    fn is_canceled(&self) -> bool {
        *self.canceled.borrow()
    }

    fn is_tagged(&self, doc: &DocumentData) -> bool {
        revision_hash(&doc.rev).as_deref() == Some(self.tag.as_str())
    }

    fn primary_of<'a>(&self, doc: &'a DocumentData) -> std::result::Result<&'a str, ReplicationError> {
        doc.primary(&self.primary_path).ok_or_else(|| {
            ReplicationError::Storage(format!(
                "document without primary key '{}'",
                self.primary_path
            ))
        })
    }

    async fn cycle(&self) -> std::result::Result<Cycle, ReplicationError> {
        if let Some(push) = &self.options.push {
            self.phase.send_replace(ReplicationPhase::Pushing);
            loop {
                if self.is_canceled() {
                    return Ok(Cycle::Canceled);
                }
                if !self.push_batch(push.as_ref()).await? {
                    break;
                }
            }
        }

        if let Some(pull) = &self.options.pull {
            self.phase.send_replace(ReplicationPhase::Pulling);
            loop {
                let checkpoint = self.meta.pull_checkpoint().await?;
                let result = pull
                    .pull(checkpoint.clone(), self.options.batch_size)
                    .await
                    .map_err(|err| ReplicationError::pull(err, checkpoint))?;
                if self.is_canceled() {
                    return Ok(Cycle::Canceled);
                }
                if self.options.push.is_some() && self.has_unpushed_changes().await? {
                    warn!(
                        "Replication {}: fork changed during pull, dropping {} documents",
                        self.options.identifier,
                        result.documents.len()
                    );
                    return Ok(Cycle::Restart);
                }
                if !result.documents.is_empty() && !self.persist_pulled(&result.documents).await? {
                    warn!(
                        "Replication {}: fork changed while writing pulled documents",
                        self.options.identifier
                    );
                    return Ok(Cycle::Restart);
                }
                if let Some(next) = result.checkpoint {
                    self.meta.set_pull_checkpoint(next).await?;
                }
                if result.documents.is_empty() || !result.has_more_documents {
                    break;
                }
            }
        }
        Ok(Cycle::Complete)
    }

    /// Push one batch; `true` when a full batch was read and more may follow
    async fn push_batch(&self, push: &dyn PushHandler) -> std::result::Result<bool, ReplicationError> {
        let checkpoint = self.meta.push_checkpoint().await?;
        let changes = self
            .fork
            .get_changed_documents_since(self.options.batch_size, checkpoint.as_ref())
            .await?;
        if changes.documents.is_empty() {
            return Ok(false);
        }
        let full_batch = changes.documents.len() == self.options.batch_size;

        let local: Vec<DocumentData> = changes
            .documents
            .iter()
            .filter(|doc| !self.is_tagged(doc))
            .map(DocumentData::without_attachment_data)
            .collect();

        if !local.is_empty() {
            let ids = local
                .iter()
                .map(|doc| self.primary_of(doc).map(str::to_string))
                .collect::<std::result::Result<Vec<_>, _>>()?;
            let mut assumed = self.meta.assumed_master_states(&ids).await?;
            let rows: Vec<PushRow> = ids
                .iter()
                .zip(&local)
                .map(|(id, doc)| PushRow {
                    assumed_master_state: assumed.remove(id),
                    new_document_state: doc.clone(),
                })
                .collect();

            debug!(
                "Replication {}: pushing {} documents",
                self.options.identifier,
                rows.len()
            );
            let conflicts = push
                .push(rows.clone())
                .await
                .map_err(|err| ReplicationError::push(err, rows))?;
            if self.is_canceled() {
                return Ok(false);
            }

            let conflicted = conflicts
                .iter()
                .map(|doc| self.primary_of(doc).map(str::to_string))
                .collect::<std::result::Result<BTreeSet<_>, _>>()?;
            let accepted: Vec<DocumentData> = ids
                .iter()
                .zip(local)
                .filter(|(id, _)| !conflicted.contains(*id))
                .map(|(_, doc)| doc)
                .collect();
            self.sent.fetch_add(accepted.len() as u64, Ordering::SeqCst);
            self.meta
                .set_assumed_master_states(&self.primary_path, &accepted)
                .await?;

            if !conflicts.is_empty() {
                info!(
                    "Replication {}: {} push conflicts, taking master state",
                    self.options.identifier,
                    conflicts.len()
                );
                if !self.persist_pulled(&conflicts).await? {
                    // The fork moved again; the next batch pushes it.
                    debug!("Conflict resolution raced a local write");
                }
            }
        }

        if let Some(next) = changes.checkpoint {
            self.meta.set_push_checkpoint(&next).await?;
        }
        Ok(full_batch)
    }

    /// Write master states into the fork; `false` when a local write raced
    async fn persist_pulled(&self, documents: &[DocumentData]) -> std::result::Result<bool, ReplicationError> {
        let ids = documents
            .iter()
            .map(|doc| self.primary_of(doc).map(str::to_string))
            .collect::<std::result::Result<Vec<_>, _>>()?;
        let current = self.fork.find_documents_by_id(&ids, true).await?;

        let mut rows = Vec::new();
        for (id, master) in ids.iter().zip(documents) {
            let local = current.get(id);
            if local.is_some_and(|local| local.same_content(master)) {
                continue;
            }
            let mut document = master.without_attachment_data();
            document.rev = create_revision(&self.tag, local)
                .map_err(|err| ReplicationError::Storage(err.to_string()))?;
            document.meta.lwt = now_lwt();
            document.attachments = local.map(|l| l.attachments.clone()).unwrap_or_default();
            rows.push(BulkWriteRow {
                document,
                previous: local.cloned(),
            });
        }

        let mut raced = false;
        if !rows.is_empty() {
            let response = self.fork.bulk_write(rows, PULL_CONTEXT).await?;
            self.received
                .fetch_add(response.success.len() as u64, Ordering::SeqCst);
            raced = !response.error.is_empty();
        }

        self.meta
            .set_assumed_master_states(&self.primary_path, documents)
            .await?;
        Ok(!raced)
    }

    /// Whether the fork holds local writes after the push checkpoint
    async fn has_unpushed_changes(&self) -> Result<bool> {
        let mut checkpoint = self.meta.push_checkpoint().await?;
        loop {
            let changes = self
                .fork
                .get_changed_documents_since(self.options.batch_size, checkpoint.as_ref())
                .await?;
            if changes.documents.iter().any(|doc| !self.is_tagged(doc)) {
                return Ok(true);
            }
            if changes.documents.len() < self.options.batch_size {
                return Ok(false);
            }
            checkpoint = changes.checkpoint;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryStorage;
    use crate::storage::{Storage, StorageInstanceParams};
    use crate::testing::fixtures;

    async fn instance(storage: &MemoryStorage, name: &str) -> Arc<dyn StorageInstance> {
        storage
            .create_storage_instance(StorageInstanceParams::new(
                "db",
                name,
                fixtures::human_schema(),
            ))
            .await
            .unwrap()
    }

    #[test]
    fn test_options_need_a_handler() {
        let options = ReplicationOptions::new("x", &ReplicationDefaults::default());
        assert!(matches!(options.validate(), Err(Error::Validation(_))));
    }

    #[tokio::test]
    async fn test_push_only_copies_fork_to_master() {
        let storage = MemoryStorage::new();
        let fork = instance(&storage, "fork").await;
        let master = instance(&storage, "master").await;
        fixtures::insert_humans(fork.as_ref(), &[("alice", 30), ("bob", 40), ("carol", 50)])
            .await;

        let meta = ReplicationMeta::open(&storage, "db", "fork", "push-only")
            .await
            .unwrap();
        let handler = Arc::new(StorageReplicationHandler::new(master.clone(), "master"));
        let mut options = ReplicationOptions::new("push-only", &ReplicationDefaults::default())
            .with_push(handler)
            .once();
        options.batch_size = 2;
        let state = ReplicationState::start(fork, meta, options).unwrap();

        state.await_initial_sync().await.unwrap();
        state.await_in_sync().await.unwrap();
        assert_eq!(state.sent(), 3);
        assert_eq!(crate::storage::count_all_documents(master.as_ref()).await.unwrap(), 3);
        state.join().await;
        assert!(state.is_stopped());
    }

    #[tokio::test]
    async fn test_pulled_documents_are_tagged_and_not_pushed_back() {
        let storage = MemoryStorage::new();
        let fork = instance(&storage, "fork").await;
        let master = instance(&storage, "master").await;
        fixtures::insert_humans(master.as_ref(), &[("alice", 30)]).await;

        let meta = ReplicationMeta::open(&storage, "db", "fork", "both")
            .await
            .unwrap();
        let handler = Arc::new(StorageReplicationHandler::new(master.clone(), "master"));
        let options = ReplicationOptions::new("both", &ReplicationDefaults::default())
            .with_pull(handler.clone())
            .with_push(handler)
            .once();
        let state = ReplicationState::start(fork.clone(), meta, options).unwrap();
        state.await_initial_sync().await.unwrap();

        let pulled = crate::storage::get_single_document(fork.as_ref(), "alice")
            .await
            .unwrap()
            .unwrap();
        assert_eq!(pulled.rev, format!("1-{}", state.pull_tag()));
        assert_eq!(state.received(), 1);
        assert_eq!(state.sent(), 0);
    }
}
