//! Test environment abstraction for isolated testing.
//!
//! Provides `TestEnvironment` to manage a throwaway project root with its
//! own map file location, so tests never collide on paths.

use std::path::PathBuf;
use std::sync::atomic::{AtomicU32, Ordering};

use tempfile::TempDir;

/// Atomic counter for unique test IDs
static TEST_COUNTER: AtomicU32 = AtomicU32::new(0);

/// Isolated test environment with unique paths
pub struct TestEnvironment {
    /// Temporary directory (dropped on cleanup)
    _temp_dir: TempDir,
    /// Project root for the test
    pub project_root: PathBuf,
    /// Map file name, unique per test
    pub map_file: String,
    /// Unique test ID
    pub test_id: u32,
}

impl TestEnvironment {
    /// Create a new isolated test environment
    pub fn new() -> anyhow::Result<Self> {
        let test_id = TEST_COUNTER.fetch_add(1, Ordering::Relaxed);
        let temp_dir = TempDir::new()?;

        let project_root = temp_dir.path().join("project");
        std::fs::create_dir_all(&project_root)?;

        Ok(Self {
            _temp_dir: temp_dir,
            project_root,
            map_file: format!(".lamina-test-{test_id}.map"),
            test_id,
        })
    }

    /// Absolute path of the map file
    pub fn map_path(&self) -> PathBuf {
        self.project_root.join(&self.map_file)
    }

    /// Create a test file with content under the project root
    pub fn create_file(&self, relative_path: &str, content: &[u8]) -> anyhow::Result<PathBuf> {
        let path = self.project_root.join(relative_path);
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent)?;
        }
        std::fs::write(&path, content)?;
        Ok(path)
    }
}

impl Default for TestEnvironment {
    fn default() -> Self {
        Self::new().expect("Failed to create test environment")
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_environment_creates_project_root() {
        let env = TestEnvironment::new().unwrap();
        assert!(env.project_root.exists());
        assert!(!env.map_path().exists());
    }

    #[test]
    fn test_environment_is_unique() {
        let env1 = TestEnvironment::new().unwrap();
        let env2 = TestEnvironment::new().unwrap();
        assert_ne!(env1.map_path(), env2.map_path());
    }

    #[test]
    fn test_create_file() {
        let env = TestEnvironment::new().unwrap();
        let path = env.create_file("upper/data.txt", b"contents").unwrap();
        assert!(path.exists());
        assert_eq!(std::fs::read(&path).unwrap(), b"contents");
    }
}
