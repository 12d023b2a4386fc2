use std::fs;
use std::path::{Path, PathBuf};

use tracing::{debug, warn};

use crate::error::ScriptError;
use crate::options::ScriptsProvider;
use crate::script::MigrationScript;

/// Folder searched next to the running executable when no provider is configured.
pub const ENTRY_SCRIPTS_FOLDER: &str = "SqlScripts";

/// Scripts compiled into the binary as `(file name, sql)` pairs.
///
/// ```ignore
/// EmbeddedScriptsProvider::new([
///     ("20240101001_create_users.sql", include_str!("../sql/20240101001_create_users.sql")),
/// ]);
/// ```
pub struct EmbeddedScriptsProvider {
    scripts: Vec<(&'static str, &'static str)>,
}

impl EmbeddedScriptsProvider {
    pub fn new<I>(scripts: I) -> Self
    where
        I: IntoIterator<Item = (&'static str, &'static str)>,
    {
        Self {
            scripts: scripts.into_iter().collect(),
        }
    }
}

impl ScriptsProvider for EmbeddedScriptsProvider {
    fn describe(&self) -> String {
        format!("embedded({})", self.scripts.len())
    }

    fn scripts(&self) -> Result<Vec<MigrationScript>, ScriptError> {
        self.scripts
            .iter()
            .map(|(name, sql)| MigrationScript::from_file_name(name, *sql))
            .collect()
    }
}

/// Reads every `*.sql` file of a directory.
pub struct DirectoryScriptsProvider {
    dir: PathBuf,
    required: bool,
}

impl DirectoryScriptsProvider {
    /// A missing directory is an error.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            required: true,
        }
    }

    /// A missing directory yields no scripts.
    pub fn optional(dir: impl Into<PathBuf>) -> Self {
        Self {
            dir: dir.into(),
            required: false,
        }
    }

    /// The `SqlScripts` folder next to the running executable.
    pub fn entry_default() -> Self {
        let dir = std::env::current_exe()
            .ok()
            .and_then(|exe| exe.parent().map(|dir| dir.join(ENTRY_SCRIPTS_FOLDER)))
            .unwrap_or_else(|| PathBuf::from(ENTRY_SCRIPTS_FOLDER));
        Self::optional(dir)
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn io_error(&self, source: std::io::Error) -> ScriptError {
        ScriptError::Io {
            path: self.dir.clone(),
            source,
        }
    }
}

impl ScriptsProvider for DirectoryScriptsProvider {
    fn describe(&self) -> String {
        format!("directory({})", self.dir.display())
    }

    fn scripts(&self) -> Result<Vec<MigrationScript>, ScriptError> {
        if !self.dir.is_dir() {
            if self.required {
                return Err(self.io_error(std::io::Error::new(
                    std::io::ErrorKind::NotFound,
                    "directory does not exist",
                )));
            }
            warn!(dir = %self.dir.display(), "migration scripts directory not found");
            return Ok(Vec::new());
        }

        let mut scripts = Vec::new();
        for entry in fs::read_dir(&self.dir).map_err(|e| self.io_error(e))? {
            let path = entry.map_err(|e| self.io_error(e))?.path();
            let is_sql = path
                .extension()
                .and_then(|ext| ext.to_str())
                .is_some_and(|ext| ext.eq_ignore_ascii_case("sql"));
            if !path.is_file() || !is_sql {
                continue;
            }

            let Some(file_name) = path.file_name().and_then(|n| n.to_str()) else {
                continue;
            };
            let sql = fs::read_to_string(&path).map_err(|e| self.io_error(e))?;
            debug!(script = file_name, "migration script loaded");
            scripts.push(MigrationScript::from_file_name(file_name, sql)?);
        }

        Ok(scripts)
    }
}
