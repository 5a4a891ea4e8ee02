//! TestContext - owns the temporary directory of one test

use std::path::Path;
use tempfile::TempDir;

/// Temporary directory removed when the context is dropped
///
/// Keep the context alive for as long as any LMDB environment opened under
/// [`TestContext::path`] is in use.
pub struct TestContext {
    temp_dir: TempDir,
}

impl TestContext {
    /// Create a context with a fresh, existing directory
    pub fn new() -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temporary directory");
        std::fs::create_dir_all(temp_dir.path()).expect("Failed to create test directory");
        Self { temp_dir }
    }

    /// Directory of this test
    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Keep the directory beyond the context
    pub fn into_temp_dir(self) -> TempDir {
        self.temp_dir
    }
}

impl Default for TestContext {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    #[test]
    fn test_context_creates_directory() {
        let ctx = TestContext::new();
        assert!(ctx.path().is_dir());
        fs::write(ctx.path().join("touch"), "x").expect("directory should be writable");
    }

    #[test]
    fn test_context_cleanup_on_drop() {
        let path = {
            let ctx = TestContext::new();
            ctx.path().to_path_buf()
        };
        assert!(!path.exists());
    }
}
