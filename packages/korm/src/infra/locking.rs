use std::fs::{File, OpenOptions};
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use sea_orm::{ConnectionTrait, DatabaseBackend, DatabaseConnection, Statement};
use tracing::{debug, warn};
use xxhash_rust::xxh3::xxh3_64;

use crate::config::DbProvider;
use crate::database::KormDatabase;
use crate::error::KormError;

pub const LOCK_FILE_SUFFIX: &str = ".migrate.lock";

pub fn pg_lock_id(key: &str) -> i64 {
    xxh3_64(key.as_bytes()) as i64
}

enum GuardKind {
    Postgres {
        conn: DatabaseConnection,
        lock_key: i64,
    },
    SqliteFile {
        file: File,
        lock_path: PathBuf,
    },
    InMemory,
}

/// A held bootstrap lock. Call [`Guard::release`] when done; dropping a file
/// guard also releases the OS lock.
pub struct Guard {
    kind: GuardKind,
}

impl Guard {
    fn new(kind: GuardKind) -> Self {
        Self { kind }
    }

    pub async fn release(self) -> Result<(), KormError> {
        match self.kind {
            GuardKind::SqliteFile { file, lock_path } => {
                match fs4::fs_std::FileExt::unlock(&file) {
                    Ok(()) => debug!(lock_path = %lock_path.display(), "SQLite file lock released"),
                    Err(e) => debug!(
                        error = %e,
                        lock_path = %lock_path.display(),
                        "SQLite file unlock returned error"
                    ),
                }
                Ok(())
            }
            GuardKind::InMemory => Ok(()),
            GuardKind::Postgres { conn, lock_key } => {
                let stmt = Statement::from_sql_and_values(
                    DatabaseBackend::Postgres,
                    "SELECT pg_advisory_unlock($1) AS unlocked",
                    vec![lock_key.into()],
                );

                match conn.query_one(stmt).await {
                    Ok(Some(row)) => {
                        let unlocked: bool = row.try_get("", "unlocked").map_err(|e| {
                            KormError::lock(format!("failed to read unlock result: {e}"))
                        })?;
                        if !unlocked {
                            warn!(
                                code = "PG_UNLOCK_FALSE",
                                lock_key, "Advisory lock unlock returned false"
                            );
                        }
                    }
                    Ok(None) => warn!(lock_key, "No result from advisory lock unlock query"),
                    Err(e) => warn!(error = %e, lock_key, "Failed to unlock advisory lock"),
                }
                Ok(())
            }
        }
    }
}

/// Non-blocking lock acquisition, retried by the caller.
#[async_trait]
pub trait BootstrapLock: Send {
    /// `Ok(None)` when another process holds the lock.
    async fn try_acquire(&mut self) -> Result<Option<Guard>, KormError>;
}

/// Postgres session advisory lock.
///
/// The connection must come from a single-connection pool so that lock and
/// unlock run on the same session.
pub struct PgAdvisoryLock {
    conn: DatabaseConnection,
    lock_key: i64,
}

impl PgAdvisoryLock {
    pub fn new(conn: DatabaseConnection, key: &str) -> Self {
        Self {
            conn,
            lock_key: pg_lock_id(key),
        }
    }

    pub fn lock_key(&self) -> i64 {
        self.lock_key
    }
}

#[async_trait]
impl BootstrapLock for PgAdvisoryLock {
    async fn try_acquire(&mut self) -> Result<Option<Guard>, KormError> {
        let stmt = Statement::from_sql_and_values(
            DatabaseBackend::Postgres,
            "SELECT pg_try_advisory_lock($1) AS locked",
            vec![self.lock_key.into()],
        );

        let row = self
            .conn
            .query_one(stmt)
            .await
            .map_err(|e| KormError::lock(format!("failed to acquire advisory lock: {e}")))?
            .ok_or_else(|| KormError::lock("pg_try_advisory_lock returned no row"))?;
        let locked: bool = row
            .try_get("", "locked")
            .map_err(|e| KormError::lock(format!("failed to read lock result: {e}")))?;

        if !locked {
            return Ok(None);
        }

        Ok(Some(Guard::new(GuardKind::Postgres {
            conn: self.conn.clone(),
            lock_key: self.lock_key,
        })))
    }
}

/// Exclusive OS file lock on `<db>.migrate.lock`.
pub struct SqliteFileLock {
    lock_path: PathBuf,
}

impl SqliteFileLock {
    pub fn new(lock_path: &Path) -> Self {
        Self {
            lock_path: lock_path.to_path_buf(),
        }
    }

    pub fn lock_path(&self) -> &Path {
        &self.lock_path
    }
}

#[async_trait]
impl BootstrapLock for SqliteFileLock {
    async fn try_acquire(&mut self) -> Result<Option<Guard>, KormError> {
        use fs4::fs_std::FileExt;

        if let Some(parent) = self.lock_path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent).map_err(|e| {
                    KormError::lock(format!("failed to create lock file parent directory: {e}"))
                })?;
            }
        }

        let file = OpenOptions::new()
            .create(true)
            .truncate(true)
            .read(true)
            .write(true)
            .open(&self.lock_path)
            .map_err(|e| KormError::lock(format!("failed to open lock file: {e}")))?;

        // Ok(false) means the lock would block.
        match file.try_lock_exclusive() {
            Ok(true) => {
                debug!(lock_path = %self.lock_path.display(), "SQLite file lock acquired");
                Ok(Some(Guard::new(GuardKind::SqliteFile {
                    file,
                    lock_path: self.lock_path.clone(),
                })))
            }
            Ok(false) => {
                debug!(lock_path = %self.lock_path.display(), "SQLite file lock contended");
                Ok(None)
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => Ok(None),
            Err(e) => Err(KormError::lock(format!(
                "failed to acquire SQLite file lock: {e}"
            ))),
        }
    }
}

/// No-op lock for in-memory databases, which are private to one process.
pub struct InMemoryLock;

#[async_trait]
impl BootstrapLock for InMemoryLock {
    async fn try_acquire(&mut self) -> Result<Option<Guard>, KormError> {
        Ok(Some(Guard::new(GuardKind::InMemory)))
    }
}

/// Lock file for a SQLite connection string; `None` for in-memory databases.
pub fn sqlite_lock_path(connection_string: &str) -> Option<PathBuf> {
    let rest = connection_string
        .strip_prefix("sqlite://")
        .or_else(|| connection_string.strip_prefix("sqlite:"))
        .unwrap_or(connection_string);
    let (path, query) = match rest.split_once('?') {
        Some((path, query)) => (path, query),
        None => (rest, ""),
    };

    let in_memory = path.is_empty()
        || path == ":memory:"
        || query
            .split('&')
            .any(|pair| pair.eq_ignore_ascii_case("mode=memory"));
    if in_memory {
        return None;
    }

    Some(PathBuf::from(format!("{path}{LOCK_FILE_SUFFIX}")))
}

/// Pick the lock matching the database. `conn` is the single-connection
/// pool the migrations will run on.
pub fn bootstrap_lock(database: &KormDatabase, conn: &DatabaseConnection) -> Box<dyn BootstrapLock> {
    let settings = database.connection_settings();
    match database.provider() {
        DbProvider::Postgres => {
            let key = format!("korm:migrate:{}", settings.sanitized());
            Box::new(PgAdvisoryLock::new(conn.clone(), &key))
        }
        DbProvider::Sqlite => match sqlite_lock_path(&settings.connection_string) {
            Some(path) => Box::new(SqliteFileLock::new(&path)),
            None => Box::new(InMemoryLock),
        },
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lock_ids_are_stable() {
        assert_eq!(pg_lock_id("korm:migrate:a"), pg_lock_id("korm:migrate:a"));
        assert_ne!(pg_lock_id("korm:migrate:a"), pg_lock_id("korm:migrate:b"));
    }

    #[test]
    fn sqlite_lock_path_sits_next_to_database() {
        assert_eq!(
            sqlite_lock_path("sqlite:///var/lib/app.db?mode=rwc"),
            Some(PathBuf::from("/var/lib/app.db.migrate.lock"))
        );
        assert_eq!(
            sqlite_lock_path("sqlite://data/app.db"),
            Some(PathBuf::from("data/app.db.migrate.lock"))
        );
        assert_eq!(sqlite_lock_path("sqlite::memory:"), None);
        assert_eq!(sqlite_lock_path("sqlite://shared?mode=memory&cache=shared"), None);
    }

    #[tokio::test]
    async fn file_lock_is_exclusive_until_released() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("nested").join("app.db.migrate.lock");

        let mut first = SqliteFileLock::new(&path);
        let mut second = SqliteFileLock::new(&path);

        let guard = first.try_acquire().await.unwrap().expect("first acquire");
        assert!(second.try_acquire().await.unwrap().is_none());

        guard.release().await.unwrap();
        let guard = second.try_acquire().await.unwrap().expect("acquire after release");
        guard.release().await.unwrap();
    }

    #[tokio::test]
    async fn in_memory_lock_always_acquires() {
        let mut lock = InMemoryLock;
        let a = lock.try_acquire().await.unwrap().unwrap();
        let b = lock.try_acquire().await.unwrap().unwrap();
        a.release().await.unwrap();
        b.release().await.unwrap();
    }
}
