//! Throwaway SQLite database files

use std::path::{Path, PathBuf};

use tempfile::TempDir;

/// A SQLite file inside its own temporary directory, removed on drop.
pub struct TempSqlite {
    dir: TempDir,
    path: PathBuf,
}

impl TempSqlite {
    /// # Panics
    /// Panics if the temporary directory cannot be created.
    pub fn new() -> Self {
        let dir = tempfile::tempdir().expect("failed to create temp dir for sqlite");
        let path = dir.path().join("korm.db");
        Self { dir, path }
    }

    /// Connection string that creates the file on first connect.
    pub fn url(&self) -> String {
        format!("sqlite://{}?mode=rwc", self.path.display())
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn dir(&self) -> &Path {
        self.dir.path()
    }
}

impl Default for TempSqlite {
    fn default() -> Self {
        Self::new()
    }
}
