//! Replication error types

use crate::replication::handler::PushRow;
use serde_json::Value;
use thiserror::Error;

/// Failures of one replication cycle, emitted on the error stream
#[derive(Error, Debug, Clone)]
pub enum ReplicationError {
    /// The pull handler failed
    #[error("Pull failed: {message}")]
    Pull {
        /// Handler error rendered with its causes
        message: String,
        /// Checkpoint the failed pull started from
        checkpoint: Option<Value>,
    },

    /// The push handler failed
    #[error("Push failed for {} rows: {message}", rows.len())]
    Push {
        /// Handler error rendered with its causes
        message: String,
        /// Rows of the failed batch
        rows: Vec<PushRow>,
    },

    /// Reading or writing the fork or meta instance failed
    #[error("Replication storage error: {0}")]
    Storage(String),
}

impl ReplicationError {
    /// Wrap a pull handler failure
    pub fn pull(err: anyhow::Error, checkpoint: Option<Value>) -> Self {
        Self::Pull {
            message: format!("{err:#}"),
            checkpoint,
        }
    }

    /// Wrap a push handler failure
    pub fn push(err: anyhow::Error, rows: Vec<PushRow>) -> Self {
        Self::Push {
            message: format!("{err:#}"),
            rows,
        }
    }
}

impl From<crate::Error> for ReplicationError {
    fn from(err: crate::Error) -> Self {
        Self::Storage(err.to_string())
    }
}
