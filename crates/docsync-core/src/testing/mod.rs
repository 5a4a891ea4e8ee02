//! Test support
//!
//! Shared by unit tests, integration tests and downstream crates that want
//! to exercise a storage backend:
//!
//! - [`TestContext`] owns a temporary directory for LMDB environments
//! - [`fixtures`] builds a small indexed schema and documents for it
//! - [`init_tracing`] installs a test log subscriber once per process

mod context;
pub mod fixtures;

pub use context::TestContext;

use std::sync::Once;
use tracing_subscriber::EnvFilter;

static TRACING: Once = Once::new();

/// Install a `RUST_LOG`-filtered subscriber writing through the test harness
pub fn init_tracing() {
    TRACING.call_once(|| {
        let filter =
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("warn"));
        let _ = tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_test_writer()
            .try_init();
    });
}
