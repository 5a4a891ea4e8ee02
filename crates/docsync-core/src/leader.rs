//! Leader election
//!
//! Participants sharing a [`BroadcastChannel`] elect one leader per topic.
//! Each [`LeaderElector`] is an actor task cycling
//! `Follower -> Candidate -> Leader`:
//!
//! - a candidate posts `Apply` and becomes leader when nobody objects within
//!   the response time
//! - a candidate yields on `Tell` or on an `Apply` carrying a higher token,
//!   and answers an `Apply` with a lower token by applying again
//! - a leader answers every `Apply` with `Tell` and posts `Death` when it dies
//! - followers apply again on `Death` and on the fallback interval
//!
//! [`serve_storage_as_leader`] ties an elector to a [`RemoteStorageServer`]
//! so that non-leaders can reach the single writer through
//! [`crate::storage::remote::RemoteStorage`].

use crate::config::LeaderConfig;
use crate::revision::random_token;
use crate::storage::Storage;
use crate::storage::remote::{RemoteEndpoint, RemoteStorageServer};
use crate::{Error, Result};
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::broadcast::error::RecvError;
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use tracing::{debug, info, warn};

/// Default capacity of a [`BroadcastChannel`]
pub const DEFAULT_CHANNEL_CAPACITY: usize = 256;

/// Election message kinds
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaderMessageKind {
    /// Sender wants to become leader
    Apply,
    /// Sender is the leader
    Tell,
    /// Sender was the leader and is gone
    Death,
}

/// One message on the election bus
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LeaderMessage {
    /// Election topic; participants ignore other topics
    pub topic: String,
    /// Sender token
    pub token: String,
    /// Message kind
    pub kind: LeaderMessageKind,
}

/// In-process message bus shared by all participants
#[derive(Clone)]
pub struct BroadcastChannel {
    sender: broadcast::Sender<LeaderMessage>,
}

impl Default for BroadcastChannel {
    fn default() -> Self {
        Self::new(DEFAULT_CHANNEL_CAPACITY)
    }
}

impl BroadcastChannel {
    /// Bus buffering up to `capacity` messages per subscriber
    pub fn new(capacity: usize) -> Self {
        let (sender, _) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Deliver `message` to every subscriber
    pub fn post(&self, message: LeaderMessage) {
        // No subscribers simply means nobody else is listening.
        let _ = self.sender.send(message);
    }

    /// Receive messages posted from now on
    pub fn subscribe(&self) -> broadcast::Receiver<LeaderMessage> {
        self.sender.subscribe()
    }
}

/// Position of a participant in the election
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LeaderState {
    /// Waiting for a chance to apply
    Follower,
    /// Applied, waiting for objections
    Candidate,
    /// Holds leadership
    Leader,
    /// Left the election
    Dead,
}

enum Command {
    Die(oneshot::Sender<()>),
}

/// Handle of one election participant
pub struct LeaderElector {
    token: String,
    topic: String,
    state: watch::Receiver<LeaderState>,
    commands: mpsc::Sender<Command>,
    task: Mutex<Option<JoinHandle<()>>>,
}

impl LeaderElector {
    /// Join the election on `topic` with a fresh random token
    pub fn start(channel: &BroadcastChannel, topic: impl Into<String>, config: &LeaderConfig) -> Self {
        Self::start_with_token(channel, topic, random_token(16), config)
    }

    /// Join the election on `topic` with `token`
    pub fn start_with_token(
        channel: &BroadcastChannel,
        topic: impl Into<String>,
        token: impl Into<String>,
        config: &LeaderConfig,
    ) -> Self {
        let topic = topic.into();
        let token = token.into();
        let (state_tx, state) = watch::channel(LeaderState::Follower);
        let (commands, command_rx) = mpsc::channel(4);
        let actor = ElectionActor {
            channel: channel.clone(),
            inbox: channel.subscribe(),
            topic: topic.clone(),
            token: token.clone(),
            state: state_tx,
            response_time: config.response_time,
            fallback_interval: config.fallback_interval,
        };
        let task = tokio::spawn(actor.run(command_rx));
        Self {
            token,
            topic,
            state,
            commands,
            task: Mutex::new(Some(task)),
        }
    }

    /// Token of this participant
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Election topic
    pub fn topic(&self) -> &str {
        &self.topic
    }

    /// Current state
    pub fn state(&self) -> LeaderState {
        *self.state.borrow()
    }

    /// State updates
    pub fn watch_state(&self) -> watch::Receiver<LeaderState> {
        self.state.clone()
    }

    /// Whether this participant currently leads
    pub fn is_leader(&self) -> bool {
        self.state() == LeaderState::Leader
    }

    /// Wait until this participant leads; fails once it died
    pub async fn await_leadership(&self) -> Result<()> {
        let mut state = self.state.clone();
        let reached = state
            .wait_for(|s| matches!(s, LeaderState::Leader | LeaderState::Dead))
            .await
            .map(|s| *s)
            .map_err(|_| Error::leadership("election actor stopped"))?;
        match reached {
            LeaderState::Leader => Ok(()),
            _ => Err(Error::leadership(format!(
                "participant {} left the election on '{}'",
                self.token, self.topic
            ))),
        }
    }

    /// Leave the election, announcing death if leading
    pub async fn die(&self) {
        let (ack, done) = oneshot::channel();
        if self.commands.send(Command::Die(ack)).await.is_ok() {
            let _ = done.await;
        }
        let task = self.task.lock().take();
        if let Some(task) = task {
            let _ = task.await;
        }
    }
}

impl Drop for LeaderElector {
    fn drop(&mut self) {
        if let Some(task) = self.task.get_mut().take() {
            task.abort();
        }
    }
}

struct ElectionActor {
    channel: BroadcastChannel,
    inbox: broadcast::Receiver<LeaderMessage>,
    topic: String,
    token: String,
    state: watch::Sender<LeaderState>,
    response_time: Duration,
    fallback_interval: Duration,
}

impl ElectionActor {
    fn current(&self) -> LeaderState {
        *self.state.borrow()
    }

    fn post(&self, kind: LeaderMessageKind) {
        self.channel.post(LeaderMessage {
            topic: self.topic.clone(),
            token: self.token.clone(),
            kind,
        });
    }

    fn set(&self, state: LeaderState) {
        let previous = self.state.send_replace(state);
        if previous != state {
            debug!("Elector {} on '{}': {:?} -> {:?}", self.token, self.topic, previous, state);
            if state == LeaderState::Leader {
                info!("Participant {} is now leader of '{}'", self.token, self.topic);
            }
        }
    }

    /// Become candidate and return the deadline for objections
    fn apply(&self) -> Instant {
        self.set(LeaderState::Candidate);
        self.post(LeaderMessageKind::Apply);
        Instant::now() + self.response_time
    }

    async fn run(mut self, mut commands: mpsc::Receiver<Command>) {
        let mut deadline = self.apply();
        let mut fallback = tokio::time::interval(self.fallback_interval);
        fallback.tick().await;

        loop {
            let candidate = self.current() == LeaderState::Candidate;
            tokio::select! {
                command = commands.recv() => {
                    if let Some(Command::Die(ack)) = command {
                        if self.current() == LeaderState::Leader {
                            self.post(LeaderMessageKind::Death);
                        }
                        self.set(LeaderState::Dead);
                        let _ = ack.send(());
                    } else {
                        self.set(LeaderState::Dead);
                    }
                    break;
                }
                message = self.inbox.recv() => match message {
                    Ok(message) => {
                        if message.topic == self.topic && message.token != self.token {
                            if let Some(next) = self.handle(&message) {
                                deadline = next;
                            }
                        }
                    }
                    Err(RecvError::Lagged(skipped)) => {
                        warn!("Elector {} lagged, skipped {} messages", self.token, skipped);
                    }
                    Err(RecvError::Closed) => break,
                },
                _ = tokio::time::sleep_until(deadline), if candidate => {
                    self.set(LeaderState::Leader);
                    self.post(LeaderMessageKind::Tell);
                }
                _ = fallback.tick() => {
                    if self.current() == LeaderState::Follower {
                        deadline = self.apply();
                    }
                }
            }
        }
    }

    /// React to a message of another participant; returns a new deadline
    /// when this participant (re-)applied
    fn handle(&self, message: &LeaderMessage) -> Option<Instant> {
        match (self.current(), message.kind) {
            (LeaderState::Leader, LeaderMessageKind::Apply) => {
                self.post(LeaderMessageKind::Tell);
                None
            }
            (LeaderState::Leader, LeaderMessageKind::Tell) if message.token > self.token => {
                warn!(
                    "Participant {} steps down for {} on '{}'",
                    self.token, message.token, self.topic
                );
                self.set(LeaderState::Follower);
                None
            }
            (LeaderState::Candidate, LeaderMessageKind::Tell) => {
                self.set(LeaderState::Follower);
                None
            }
            (LeaderState::Candidate, LeaderMessageKind::Apply) => {
                if message.token > self.token {
                    self.set(LeaderState::Follower);
                    None
                } else {
                    Some(self.apply())
                }
            }
            (LeaderState::Follower, LeaderMessageKind::Death) => Some(self.apply()),
            _ => None,
        }
    }
}

/// Endpoint board shared by every participant of a database
pub type LeaderBoard = Arc<watch::Sender<Option<RemoteEndpoint>>>;

/// Fresh empty board
pub fn leader_board() -> LeaderBoard {
    Arc::new(watch::channel(None).0)
}

/// Serve `storage` through a [`RemoteStorageServer`] while `elector` leads
///
/// The server endpoint is published on `board` when leadership is gained
/// and withdrawn when the elector dies.
pub fn serve_storage_as_leader(
    elector: Arc<LeaderElector>,
    storage: Arc<dyn Storage>,
    board: LeaderBoard,
    capacity: usize,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        if let Err(err) = elector.await_leadership().await {
            debug!("Not serving storage: {}", err);
            return;
        }
        let server = RemoteStorageServer::spawn(storage, capacity);
        info!(
            "Leader {} serves storage endpoint {}",
            elector.token(),
            server.endpoint().id()
        );
        board.send_replace(Some(server.endpoint()));

        let mut state = elector.watch_state();
        let _ = state.wait_for(|s| *s != LeaderState::Leader).await;

        board.send_if_modified(|current| {
            let ours = current
                .as_ref()
                .is_some_and(|endpoint| endpoint.id() == server.endpoint().id());
            if ours {
                *current = None;
            }
            ours
        });
        server.shutdown();
        info!("Leader {} stopped serving storage", elector.token());
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::memory::MemoryStorage;
    use crate::storage::remote::RemoteStorage;
    use crate::storage::{StorageInstanceParams, count_all_documents};
    use crate::testing::fixtures;

    fn fast() -> LeaderConfig {
        LeaderConfig {
            response_time: Duration::from_millis(20),
            fallback_interval: Duration::from_millis(50),
        }
    }

    #[tokio::test]
    async fn test_single_participant_becomes_leader() {
        let channel = BroadcastChannel::default();
        let elector = LeaderElector::start(&channel, "db", &fast());
        elector.await_leadership().await.unwrap();
        assert!(elector.is_leader());
        elector.die().await;
        assert_eq!(elector.state(), LeaderState::Dead);
        assert!(elector.await_leadership().await.is_err());
    }

    #[tokio::test]
    async fn test_one_leader_and_handover_on_death() {
        let channel = BroadcastChannel::default();
        let config = fast();
        let first = LeaderElector::start_with_token(&channel, "db", "aaaa", &config);
        first.await_leadership().await.unwrap();

        let second = LeaderElector::start_with_token(&channel, "db", "bbbb", &config);
        tokio::time::sleep(Duration::from_millis(120)).await;
        assert!(first.is_leader());
        assert!(!second.is_leader());

        first.die().await;
        tokio::time::timeout(Duration::from_secs(2), second.await_leadership())
            .await
            .unwrap()
            .unwrap();
    }

    #[tokio::test]
    async fn test_topics_are_independent() {
        let channel = BroadcastChannel::default();
        let a = LeaderElector::start(&channel, "a", &fast());
        let b = LeaderElector::start(&channel, "b", &fast());
        a.await_leadership().await.unwrap();
        b.await_leadership().await.unwrap();
    }

    #[tokio::test]
    async fn test_leader_serves_storage_to_followers() {
        let channel = BroadcastChannel::default();
        let board = leader_board();
        let elector = Arc::new(LeaderElector::start(&channel, "db", &fast()));
        let backend: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
        let serving = serve_storage_as_leader(elector.clone(), backend.clone(), board.clone(), 16);

        let remote = RemoteStorage::new(board.subscribe());
        let instance = remote
            .create_storage_instance(StorageInstanceParams::new(
                "db",
                "humans",
                fixtures::human_schema(),
            ))
            .await
            .unwrap();
        fixtures::insert_humans(instance.as_ref(), &[("alice", 30)]).await;
        assert_eq!(count_all_documents(instance.as_ref()).await.unwrap(), 1);

        elector.die().await;
        serving.await.unwrap();
        assert!(board.borrow().is_none());
    }
}
