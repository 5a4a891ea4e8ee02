//! Shared harness for integration tests

#![allow(dead_code)]

use docsync_core::leader::{LeaderBoard, leader_board};
use docsync_core::storage::lmdb::LmdbStorage;
use docsync_core::storage::memory::MemoryStorage;
use docsync_core::storage::remote::{RemoteServerHandle, RemoteStorage, RemoteStorageServer};
use docsync_core::storage::{Storage, StorageInstance, StorageInstanceParams};
use docsync_core::testing::{TestContext, fixtures, init_tracing};
use std::sync::Arc;

/// Backends every storage contract test runs against
#[derive(Debug, Clone, Copy)]
pub enum Backend {
    Memory,
    Lmdb,
    Remote,
}

pub const ALL_BACKENDS: [Backend; 3] = [Backend::Memory, Backend::Lmdb, Backend::Remote];

/// A storage plus whatever must stay alive while it is used
pub struct Harness {
    pub backend: Backend,
    pub storage: Arc<dyn Storage>,
    _ctx: Option<TestContext>,
    _board: Option<LeaderBoard>,
    _server: Option<RemoteServerHandle>,
}

impl Harness {
    pub fn new(backend: Backend) -> Self {
        init_tracing();
        match backend {
            Backend::Memory => Self {
                backend,
                storage: Arc::new(MemoryStorage::new()),
                _ctx: None,
                _board: None,
                _server: None,
            },
            Backend::Lmdb => {
                let ctx = TestContext::new();
                let storage = Arc::new(LmdbStorage::with_options(ctx.path(), 32 * 1024 * 1024, 64));
                Self {
                    backend,
                    storage,
                    _ctx: Some(ctx),
                    _board: None,
                    _server: None,
                }
            }
            Backend::Remote => {
                let leader: Arc<dyn Storage> = Arc::new(MemoryStorage::new());
                let server = RemoteStorageServer::spawn(leader, 64);
                let board = leader_board();
                board.send_replace(Some(server.endpoint()));
                Self {
                    backend,
                    storage: Arc::new(RemoteStorage::new(board.subscribe())),
                    _ctx: None,
                    _board: Some(board),
                    _server: Some(server),
                }
            }
        }
    }

    /// Instance of the `human` fixture schema
    pub async fn humans(&self, collection: &str) -> Arc<dyn StorageInstance> {
        self.storage
            .create_storage_instance(StorageInstanceParams::new(
                "testdb",
                collection,
                fixtures::human_schema(),
            ))
            .await
            .unwrap_or_else(|e| panic!("{:?}: opening {collection} failed: {e}", self.backend))
    }
}

/// Poll `check` until it holds, failing after two seconds
pub async fn eventually<F, Fut>(what: &str, mut check: F)
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = bool>,
{
    for _ in 0..200 {
        if check().await {
            return;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    panic!("timed out waiting for {what}");
}
