//! docsync core - offline-first document database engine
//!
//! This crate provides the storage and sync core of docsync:
//! - Revision codec (`<height>-<hash>`) for optimistic concurrency
//! - Bulk-write categorizer producing per-row errors and change events
//! - Mango query planner over fixed-width sortable index strings
//! - Storage contract with memory, LMDB and remote (leader-forwarded) backends
//! - Checkpoint-based master/fork replication
//! - Schema migration and local documents on top of replication
//! - Leader election between participants of one database
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────┐
//! │      Database / Collection / Document        │
//! │   (local documents, migration, leadership)  │
//! └──────────────┬──────────────────────────────┘
//!                │
//! ┌──────────────┴──────────────────────────────┐
//! │            Replication                       │
//! │   (push/pull handlers, checkpoints, meta)   │
//! └──────────────┬──────────────────────────────┘
//!                │
//! ┌──────────────┴──────────────────────────────┐
//! │         Storage Instance Contract            │
//! │  (categorizer, query plan, change stream)   │
//! └──────────────┬──────────────────────────────┘
//!                │
//! ┌──────────────┴──────────────────────────────┐
//! │              Backends                        │
//! │        (memory, LMDB, remote)               │
//! └─────────────────────────────────────────────┘
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod cache;
pub mod collection;
pub mod config;
pub mod database;
pub mod document;
pub mod error;
pub mod index;
pub mod leader;
pub mod local_documents;
pub mod migration;
pub mod query;
pub mod replication;
pub mod revision;
pub mod schema;
pub mod storage;
pub mod testing;

pub use collection::{Collection, Document};
pub use config::DatabaseConfig;
pub use database::Database;
pub use document::DocumentData;
pub use error::{Error, Result};
