pub mod locking;
pub mod runner;

pub use locking::{BootstrapLock, Guard, InMemoryLock, PgAdvisoryLock, SqliteFileLock};
pub use runner::{MigrationsRunner, SqlMigrationsRunner};
