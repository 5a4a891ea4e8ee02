//! Remote storage backend
//!
//! Non-leader participants do not touch the physical storage. Every call
//! is sent as a [`RemoteRequest`] over an mpsc channel to the
//! [`RemoteStorageServer`] run by the current leader, which executes it on
//! its own storage and answers over a oneshot channel.
//!
//! The current leader endpoint is observed through a `watch` channel. When
//! the leader goes away while a request is in flight (its channel closes or
//! the reply is dropped) the request is re-issued to the next leader.

use crate::document::{Checkpoint, DocumentData};
use crate::query::{MangoQuery, PreparedQuery, prepare_count_query, prepare_query};
use crate::schema::Schema;
use crate::storage::{
    BulkWriteResponse, BulkWriteRow, ChangeStream, ChangedDocuments, CountResult, EventBulk,
    Storage, StorageInstance, StorageInstanceParams,
};
use crate::{Error, Result};
use async_trait::async_trait;
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Default number of times a request is re-issued after leader loss
pub const DEFAULT_MAX_REISSUES: usize = 3;
/// Default wait for a leader endpoint to appear
pub const DEFAULT_LEADER_TIMEOUT: Duration = Duration::from_secs(10);

/// Operation forwarded to the leader
#[derive(Debug)]
pub enum RemoteRequest {
    /// Open an instance on the leader; answered with its session id
    Open(StorageInstanceParams),
    /// `bulk_write`
    BulkWrite {
        /// Session id
        instance: String,
        /// Rows to write
        rows: Vec<BulkWriteRow>,
        /// Write context
        context: String,
    },
    /// `find_documents_by_id`
    FindDocumentsById {
        /// Session id
        instance: String,
        /// Primary keys
        ids: Vec<String>,
        /// Include tombstones
        with_deleted: bool,
    },
    /// `query`
    Query {
        /// Session id
        instance: String,
        /// Normalized query, planned again on the leader
        query: MangoQuery,
    },
    /// `count`
    Count {
        /// Session id
        instance: String,
        /// Normalized query
        query: MangoQuery,
    },
    /// `get_changed_documents_since`
    ChangedSince {
        /// Session id
        instance: String,
        /// Maximum number of documents
        limit: usize,
        /// Exclusive start position
        checkpoint: Option<Checkpoint>,
    },
    /// `get_attachment_data`
    AttachmentData {
        /// Session id
        instance: String,
        /// Owning document
        document_id: String,
        /// Attachment id
        attachment_id: String,
    },
    /// `cleanup`
    Cleanup {
        /// Session id
        instance: String,
        /// Minimum tombstone age
        minimum_deleted_age: Duration,
    },
    /// `change_stream`
    Subscribe {
        /// Session id
        instance: String,
    },
    /// `close`
    Close {
        /// Session id
        instance: String,
    },
    /// `remove`
    Remove {
        /// Session id
        instance: String,
    },
}

/// Successful answer of the leader
pub enum RemoteResponse {
    /// Session id of an opened instance
    Opened(String),
    /// Result of `bulk_write`
    Written(BulkWriteResponse),
    /// Result of `find_documents_by_id`
    Documents(BTreeMap<String, DocumentData>),
    /// Result of `query`
    QueryResult(Vec<DocumentData>),
    /// Result of `count`
    Counted(CountResult),
    /// Result of `get_changed_documents_since`
    Changed(ChangedDocuments),
    /// Base64 attachment payload
    Attachment(String),
    /// Result of `cleanup`
    CleanedUp(bool),
    /// Live stream of the leader's instance
    Subscribed(ChangeStream),
    /// Acknowledgement of `close` / `remove`
    Done,
}

/// Error answer of the leader, mapped back to [`Error`] on the caller side
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RemoteFailure {
    /// Programmer error on the caller side
    Validation(String),
    /// Invalid query
    Query(String),
    /// Unknown session or closed instance
    Closed(String),
    /// Missing document or attachment
    NotFound(String),
    /// Anything else
    Other(String),
}

impl From<Error> for RemoteFailure {
    fn from(err: Error) -> Self {
        match err {
            Error::Validation(msg) | Error::Schema(msg) => Self::Validation(msg),
            Error::Query(msg) => Self::Query(msg),
            Error::Closed(msg) => Self::Closed(msg),
            Error::NotFound(msg) => Self::NotFound(msg),
            other => Self::Other(other.to_string()),
        }
    }
}

impl From<RemoteFailure> for Error {
    fn from(failure: RemoteFailure) -> Self {
        match failure {
            RemoteFailure::Validation(msg) => Error::validation(msg),
            RemoteFailure::Query(msg) => Error::query(msg),
            RemoteFailure::Closed(msg) => Error::closed(msg),
            RemoteFailure::NotFound(msg) => Error::not_found(msg),
            RemoteFailure::Other(msg) => Error::remote(msg),
        }
    }
}

type RemoteResult = std::result::Result<RemoteResponse, RemoteFailure>;

/// A request with its reply channel
pub struct RemoteMessage {
    /// The forwarded operation
    pub request: RemoteRequest,
    /// Where the leader sends the answer
    pub reply: oneshot::Sender<RemoteResult>,
}

/// The leader vanished before answering
#[derive(Debug)]
struct LeaderGone;

/// Sending side of a leader's request channel
#[derive(Clone)]
pub struct RemoteEndpoint {
    id: u64,
    sender: mpsc::Sender<RemoteMessage>,
}

impl RemoteEndpoint {
    /// Unique id of the serving leader
    pub fn id(&self) -> u64 {
        self.id
    }

    /// Whether the leader stopped serving
    pub fn is_closed(&self) -> bool {
        self.sender.is_closed()
    }

    async fn send(&self, request: RemoteRequest) -> std::result::Result<RemoteResult, LeaderGone> {
        let (reply, answer) = oneshot::channel();
        self.sender
            .send(RemoteMessage { request, reply })
            .await
            .map_err(|_| LeaderGone)?;
        answer.await.map_err(|_| LeaderGone)
    }
}

impl std::fmt::Debug for RemoteEndpoint {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RemoteEndpoint").field("id", &self.id).finish()
    }
}

static NEXT_ENDPOINT_ID: AtomicU64 = AtomicU64::new(1);

/// Executes forwarded requests on the leader's storage, one at a time
pub struct RemoteStorageServer {
    storage: Arc<dyn Storage>,
    instances: HashMap<String, Arc<dyn StorageInstance>>,
    next_session: u64,
}

/// Handle of a running [`RemoteStorageServer`]
pub struct RemoteServerHandle {
    endpoint: RemoteEndpoint,
    task: JoinHandle<()>,
}

impl RemoteServerHandle {
    /// Endpoint to publish to followers
    pub fn endpoint(&self) -> RemoteEndpoint {
        self.endpoint.clone()
    }

    /// Stop serving; in-flight requests are dropped unanswered
    pub fn shutdown(self) {
        self.task.abort();
        info!("remote storage server {} stopped", self.endpoint.id);
    }
}

impl RemoteStorageServer {
    /// Serve `storage` on a fresh request channel
    pub fn spawn(storage: Arc<dyn Storage>, capacity: usize) -> RemoteServerHandle {
        let (sender, mut receiver) = mpsc::channel::<RemoteMessage>(capacity.max(1));
        let id = NEXT_ENDPOINT_ID.fetch_add(1, Ordering::SeqCst);
        let mut server = RemoteStorageServer {
            storage,
            instances: HashMap::new(),
            next_session: 0,
        };
        let task = tokio::spawn(async move {
            while let Some(message) = receiver.recv().await {
                let answer = server.handle(message.request).await;
                let _ = message.reply.send(answer);
            }
            for (session, instance) in server.instances.drain() {
                if let Err(e) = instance.close().await {
                    warn!("failed to close remote session {}: {}", session, e);
                }
            }
        });
        info!("remote storage server {} started", id);
        RemoteServerHandle {
            endpoint: RemoteEndpoint { id, sender },
            task,
        }
    }

    fn instance(&self, session: &str) -> std::result::Result<Arc<dyn StorageInstance>, RemoteFailure> {
        self.instances
            .get(session)
            .cloned()
            .ok_or_else(|| RemoteFailure::Closed(format!("unknown remote session '{session}'")))
    }

    async fn handle(&mut self, request: RemoteRequest) -> RemoteResult {
        Ok(match request {
            RemoteRequest::Open(params) => {
                self.next_session += 1;
                let session = format!("{}#{}", params.instance_key(), self.next_session);
                let instance = self.storage.create_storage_instance(params).await?;
                self.instances.insert(session.clone(), instance);
                debug!("opened remote session {}", session);
                RemoteResponse::Opened(session)
            }
            RemoteRequest::BulkWrite {
                instance,
                rows,
                context,
            } => RemoteResponse::Written(self.instance(&instance)?.bulk_write(rows, &context).await?),
            RemoteRequest::FindDocumentsById {
                instance,
                ids,
                with_deleted,
            } => RemoteResponse::Documents(
                self.instance(&instance)?
                    .find_documents_by_id(&ids, with_deleted)
                    .await?,
            ),
            RemoteRequest::Query { instance, query } => {
                let instance = self.instance(&instance)?;
                let prepared = prepare_query(instance.schema(), query)?;
                RemoteResponse::QueryResult(instance.query(&prepared).await?)
            }
            RemoteRequest::Count { instance, query } => {
                let instance = self.instance(&instance)?;
                let prepared = prepare_count_query(instance.schema(), query)?;
                RemoteResponse::Counted(instance.count(&prepared).await?)
            }
            RemoteRequest::ChangedSince {
                instance,
                limit,
                checkpoint,
            } => RemoteResponse::Changed(
                self.instance(&instance)?
                    .get_changed_documents_since(limit, checkpoint.as_ref())
                    .await?,
            ),
            RemoteRequest::AttachmentData {
                instance,
                document_id,
                attachment_id,
            } => RemoteResponse::Attachment(
                self.instance(&instance)?
                    .get_attachment_data(&document_id, &attachment_id)
                    .await?,
            ),
            RemoteRequest::Cleanup {
                instance,
                minimum_deleted_age,
            } => RemoteResponse::CleanedUp(
                self.instance(&instance)?.cleanup(minimum_deleted_age).await?,
            ),
            RemoteRequest::Subscribe { instance } => {
                RemoteResponse::Subscribed(self.instance(&instance)?.change_stream())
            }
            RemoteRequest::Close { instance } => {
                if let Some(opened) = self.instances.remove(&instance) {
                    opened.close().await?;
                }
                RemoteResponse::Done
            }
            RemoteRequest::Remove { instance } => {
                let opened = self.instance(&instance)?;
                self.instances.remove(&instance);
                opened.remove().await?;
                RemoteResponse::Done
            }
        })
    }
}

/// Factory of instances that forward to the current leader
pub struct RemoteStorage {
    leader: watch::Receiver<Option<RemoteEndpoint>>,
    max_reissues: usize,
    leader_timeout: Duration,
}

impl RemoteStorage {
    /// Forward to whichever endpoint `leader` currently holds
    pub fn new(leader: watch::Receiver<Option<RemoteEndpoint>>) -> Self {
        Self {
            leader,
            max_reissues: DEFAULT_MAX_REISSUES,
            leader_timeout: DEFAULT_LEADER_TIMEOUT,
        }
    }

    /// Override re-issue count and leader wait
    pub fn with_limits(mut self, max_reissues: usize, leader_timeout: Duration) -> Self {
        self.max_reissues = max_reissues;
        self.leader_timeout = leader_timeout;
        self
    }
}

#[async_trait]
impl Storage for RemoteStorage {
    fn name(&self) -> &'static str {
        "remote"
    }

    async fn create_storage_instance(
        &self,
        params: StorageInstanceParams,
    ) -> Result<Arc<dyn StorageInstance>> {
        params.validate()?;
        let (events, _) = broadcast::channel(params.options.change_stream_capacity.max(1));
        let connection = Arc::new(RemoteConnection {
            params,
            leader: self.leader.clone(),
            session: tokio::sync::Mutex::new(None),
            max_reissues: self.max_reissues,
            leader_timeout: self.leader_timeout,
            events,
            closed: AtomicBool::new(false),
        });
        // Subscribed before returning: bulks written right after creation
        // must reach the local stream.
        let stream = match connection
            .call(|instance| RemoteRequest::Subscribe { instance })
            .await?
        {
            RemoteResponse::Subscribed(stream) => stream,
            _ => return Err(unexpected("subscribe")),
        };
        let relay = tokio::spawn(relay_change_stream(connection.clone(), Some(stream)));
        Ok(Arc::new(RemoteStorageInstance {
            connection,
            relay: Mutex::new(Some(relay)),
        }))
    }
}

#[derive(Clone)]
struct Session {
    endpoint: RemoteEndpoint,
    instance: String,
}

struct RemoteConnection {
    params: StorageInstanceParams,
    leader: watch::Receiver<Option<RemoteEndpoint>>,
    session: tokio::sync::Mutex<Option<Session>>,
    max_reissues: usize,
    leader_timeout: Duration,
    events: broadcast::Sender<Arc<EventBulk>>,
    closed: AtomicBool,
}

impl RemoteConnection {
    fn ensure_open(&self) -> Result<()> {
        if self.closed.load(Ordering::SeqCst) {
            return Err(Error::closed(self.params.instance_key()));
        }
        Ok(())
    }

    async fn live_endpoint(&self) -> Result<RemoteEndpoint> {
        let mut leader = self.leader.clone();
        let wait = leader.wait_for(|endpoint| endpoint.as_ref().is_some_and(|e| !e.is_closed()));
        match tokio::time::timeout(self.leader_timeout, wait).await {
            Ok(Ok(endpoint)) => endpoint
                .clone()
                .ok_or_else(|| Error::internal("leader endpoint vanished while borrowed")),
            Ok(Err(_)) => Err(Error::leadership("leader channel closed")),
            Err(_) => Err(Error::leadership(format!(
                "no leader within {:?}",
                self.leader_timeout
            ))),
        }
    }

    /// Current session, opening one on the current leader when needed
    async fn session(&self) -> Result<Session> {
        let mut current = self.session.lock().await;
        if let Some(session) = current.as_ref() {
            if !session.endpoint.is_closed() {
                return Ok(session.clone());
            }
        }
        for _ in 0..=self.max_reissues {
            let endpoint = self.live_endpoint().await?;
            match endpoint
                .send(RemoteRequest::Open(self.params.clone()))
                .await
            {
                Ok(Ok(RemoteResponse::Opened(instance))) => {
                    debug!("attached to leader {} as {}", endpoint.id, instance);
                    let session = Session { endpoint, instance };
                    *current = Some(session.clone());
                    return Ok(session);
                }
                Ok(Ok(_)) => return Err(Error::internal("unexpected answer to open")),
                Ok(Err(failure)) => return Err(failure.into()),
                Err(LeaderGone) => warn!("leader {} gone while opening", endpoint.id),
            }
        }
        Err(Error::remote("could not open an instance on any leader"))
    }

    async fn forget(&self, dead: &Session) {
        let mut current = self.session.lock().await;
        if current
            .as_ref()
            .is_some_and(|s| s.endpoint.id == dead.endpoint.id)
        {
            *current = None;
        }
    }

    /// Send a request, re-issuing it to the next leader when the current one dies
    async fn call<F>(&self, make: F) -> Result<RemoteResponse>
    where
        F: Fn(String) -> RemoteRequest + Send + Sync,
    {
        self.ensure_open()?;
        for attempt in 0..=self.max_reissues {
            let session = self.session().await?;
            match session.endpoint.send(make(session.instance.clone())).await {
                Ok(answer) => return answer.map_err(Error::from),
                Err(LeaderGone) => {
                    warn!(
                        "leader {} died during request (attempt {}), re-issuing",
                        session.endpoint.id,
                        attempt + 1
                    );
                    self.forget(&session).await;
                }
            }
        }
        Err(Error::remote(format!(
            "request failed after {} re-issues",
            self.max_reissues
        )))
    }
}

fn unexpected(what: &str) -> Error {
    Error::internal(format!("unexpected remote answer to {what}"))
}

/// Forward bulks of the leader's stream into the local stream, following
/// leader changes
async fn relay_change_stream(connection: Arc<RemoteConnection>, mut first: Option<ChangeStream>) {
    while !connection.closed.load(Ordering::SeqCst) {
        let subscribed = match first.take() {
            Some(stream) => Ok(RemoteResponse::Subscribed(stream)),
            None => {
                connection
                    .call(|instance| RemoteRequest::Subscribe { instance })
                    .await
            }
        };
        let mut stream = match subscribed {
            Ok(RemoteResponse::Subscribed(stream)) => stream,
            Ok(_) => {
                warn!("unexpected answer to subscribe");
                return;
            }
            Err(e) => {
                if !connection.closed.load(Ordering::SeqCst) {
                    warn!("change stream relay stopped: {}", e);
                }
                return;
            }
        };
        let Some(session) = connection.session.lock().await.clone() else {
            continue;
        };
        loop {
            tokio::select! {
                bulk = stream.next() => match bulk {
                    Some(bulk) => {
                        let _ = connection.events.send(bulk);
                    }
                    None => break,
                },
                _ = session.endpoint.sender.closed() => {
                    debug!("leader {} stopped, resubscribing", session.endpoint.id);
                    connection.forget(&session).await;
                    break;
                }
            }
        }
    }
}

/// Instance forwarding every call to the leader
pub struct RemoteStorageInstance {
    connection: Arc<RemoteConnection>,
    relay: Mutex<Option<JoinHandle<()>>>,
}

impl Drop for RemoteStorageInstance {
    fn drop(&mut self) {
        if let Some(relay) = self.relay.lock().take() {
            relay.abort();
        }
    }
}

#[async_trait]
impl StorageInstance for RemoteStorageInstance {
    fn database_name(&self) -> &str {
        &self.connection.params.database_name
    }

    fn collection_name(&self) -> &str {
        &self.connection.params.collection_name
    }

    fn schema(&self) -> &Arc<Schema> {
        &self.connection.params.schema
    }

    async fn bulk_write(
        &self,
        rows: Vec<BulkWriteRow>,
        context: &str,
    ) -> Result<BulkWriteResponse> {
        match self
            .connection
            .call(|instance| RemoteRequest::BulkWrite {
                instance,
                rows: rows.clone(),
                context: context.to_string(),
            })
            .await?
        {
            RemoteResponse::Written(response) => Ok(response),
            _ => Err(unexpected("bulk_write")),
        }
    }

    async fn find_documents_by_id(
        &self,
        ids: &[String],
        with_deleted: bool,
    ) -> Result<BTreeMap<String, DocumentData>> {
        match self
            .connection
            .call(|instance| RemoteRequest::FindDocumentsById {
                instance,
                ids: ids.to_vec(),
                with_deleted,
            })
            .await?
        {
            RemoteResponse::Documents(docs) => Ok(docs),
            _ => Err(unexpected("find_documents_by_id")),
        }
    }

    async fn query(&self, query: &PreparedQuery) -> Result<Vec<DocumentData>> {
        match self
            .connection
            .call(|instance| RemoteRequest::Query {
                instance,
                query: query.query.clone(),
            })
            .await?
        {
            RemoteResponse::QueryResult(docs) => Ok(docs),
            _ => Err(unexpected("query")),
        }
    }

    async fn count(&self, query: &PreparedQuery) -> Result<CountResult> {
        match self
            .connection
            .call(|instance| RemoteRequest::Count {
                instance,
                query: query.query.clone(),
            })
            .await?
        {
            RemoteResponse::Counted(count) => Ok(count),
            _ => Err(unexpected("count")),
        }
    }

    async fn get_changed_documents_since(
        &self,
        limit: usize,
        checkpoint: Option<&Checkpoint>,
    ) -> Result<ChangedDocuments> {
        match self
            .connection
            .call(|instance| RemoteRequest::ChangedSince {
                instance,
                limit,
                checkpoint: checkpoint.cloned(),
            })
            .await?
        {
            RemoteResponse::Changed(changed) => Ok(changed),
            _ => Err(unexpected("get_changed_documents_since")),
        }
    }

    fn change_stream(&self) -> ChangeStream {
        ChangeStream::new(self.connection.events.subscribe())
    }

    async fn get_attachment_data(&self, document_id: &str, attachment_id: &str) -> Result<String> {
        match self
            .connection
            .call(|instance| RemoteRequest::AttachmentData {
                instance,
                document_id: document_id.to_string(),
                attachment_id: attachment_id.to_string(),
            })
            .await?
        {
            RemoteResponse::Attachment(data) => Ok(data),
            _ => Err(unexpected("get_attachment_data")),
        }
    }

    async fn cleanup(&self, minimum_deleted_age: Duration) -> Result<bool> {
        match self
            .connection
            .call(|instance| RemoteRequest::Cleanup {
                instance,
                minimum_deleted_age,
            })
            .await?
        {
            RemoteResponse::CleanedUp(done) => Ok(done),
            _ => Err(unexpected("cleanup")),
        }
    }

    async fn close(&self) -> Result<()> {
        if self.connection.closed.load(Ordering::SeqCst) {
            return Ok(());
        }
        let result = self
            .connection
            .call(|instance| RemoteRequest::Close { instance })
            .await;
        self.connection.closed.store(true, Ordering::SeqCst);
        if let Some(relay) = self.relay.lock().take() {
            relay.abort();
        }
        result.map(|_| ())
    }

    async fn remove(&self) -> Result<()> {
        self.connection
            .call(|instance| RemoteRequest::Remove { instance })
            .await?;
        self.connection.closed.store(true, Ordering::SeqCst);
        if let Some(relay) = self.relay.lock().take() {
            relay.abort();
        }
        info!(
            "removed remote instance {}",
            self.connection.params.instance_key()
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryStorage;
    use crate::storage::{get_single_document, write_single};
    use serde_json::json;

    fn params() -> StorageInstanceParams {
        let schema = Schema::from_value(json!({
            "version": 0,
            "primaryKey": "id",
            "properties": { "id": { "type": "string", "maxLength": 20 } }
        }))
        .unwrap();
        StorageInstanceParams::new("db", "items", schema)
    }

    fn doc(id: &str) -> DocumentData {
        let mut doc = DocumentData::from_value(json!({ "id": id })).unwrap();
        doc.rev = "1-a".to_string();
        doc.meta.lwt = crate::document::now_lwt();
        doc
    }

    #[tokio::test]
    async fn test_forwards_to_leader() {
        let backing: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let server = RemoteStorageServer::spawn(backing.clone(), 16);
        let (_board, leader) = watch::channel(Some(server.endpoint()));
        let remote = RemoteStorage::new(leader);
        let instance = remote.create_storage_instance(params()).await.unwrap();

        write_single(instance.as_ref(), BulkWriteRow::insert(doc("a")), "test")
            .await
            .unwrap();
        let direct = backing.create_storage_instance(params()).await.unwrap();
        assert!(get_single_document(direct.as_ref(), "a").await.unwrap().is_some());
        instance.close().await.unwrap();
        instance.close().await.unwrap();
    }

    #[tokio::test]
    async fn test_reissues_after_leader_change() {
        let backing: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let first = RemoteStorageServer::spawn(backing.clone(), 16);
        let (board, leader) = watch::channel(Some(first.endpoint()));
        let remote = RemoteStorage::new(leader).with_limits(3, Duration::from_secs(2));
        let instance = remote.create_storage_instance(params()).await.unwrap();
        write_single(instance.as_ref(), BulkWriteRow::insert(doc("a")), "test")
            .await
            .unwrap();

        first.shutdown();
        let backing_for_next = backing.clone();
        let next = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(20)).await;
            let second = RemoteStorageServer::spawn(backing_for_next, 16);
            board.send_replace(Some(second.endpoint()));
            (board, second)
        });

        let found = get_single_document(instance.as_ref(), "a").await.unwrap();
        assert!(found.is_some());
        let (_board, second) = next.await.unwrap();
        second.shutdown();
    }

    #[tokio::test]
    async fn test_no_leader_times_out() {
        let (_board, leader) = watch::channel(None);
        let remote = RemoteStorage::new(leader).with_limits(0, Duration::from_millis(20));
        let err = remote.create_storage_instance(params()).await.err().unwrap();
        assert!(matches!(err, Error::Leadership(_)));
    }
}
