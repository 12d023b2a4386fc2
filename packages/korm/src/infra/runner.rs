use std::time::{Duration, Instant};

use async_trait::async_trait;
use korm_migrations::{apply_pending, is_up_to_date, MigrationOptions, MigrationReport};
use rand::Rng;
use sea_orm::DatabaseConnection;
use tracing::{info, trace, warn};

use crate::database::KormDatabase;
use crate::error::KormError;
use crate::infra::locking::{bootstrap_lock, BootstrapLock, Guard};

pub const DEFAULT_LOCK_TIMEOUT: Duration = Duration::from_secs(60);

/// Applies pending migrations. Each call is one attempt that either
/// completes or fails.
#[async_trait]
pub trait MigrationsRunner: Send + Sync {
    async fn migrate(&self) -> Result<(), KormError>;
}

/// Runs SQL script migrations against one database, serialized across
/// processes by a bootstrap lock.
pub struct SqlMigrationsRunner {
    database: KormDatabase,
    options: MigrationOptions,
    lock_timeout: Duration,
}

impl SqlMigrationsRunner {
    pub fn new(database: KormDatabase, options: MigrationOptions) -> Self {
        Self {
            database,
            options,
            lock_timeout: DEFAULT_LOCK_TIMEOUT,
        }
    }

    /// How long to keep retrying lock acquisition.
    pub fn with_lock_timeout(mut self, lock_timeout: Duration) -> Self {
        self.lock_timeout = lock_timeout;
        self
    }

    pub fn database(&self) -> &KormDatabase {
        &self.database
    }

    pub fn options(&self) -> &MigrationOptions {
        &self.options
    }

    async fn acquire(
        &self,
        conn: &DatabaseConnection,
        lock: &mut dyn BootstrapLock,
    ) -> Result<Option<Guard>, KormError> {
        let start = Instant::now();
        let mut attempts: u32 = 0;

        loop {
            attempts += 1;

            if is_up_to_date(conn, &self.options).await? {
                info!("migrate=skipped up_to_date=true");
                return Ok(None);
            }

            if let Some(guard) = lock.try_acquire().await? {
                trace!(
                    lock = "won",
                    engine = self.database.provider().engine(),
                    attempts,
                    elapsed_ms = start.elapsed().as_millis()
                );
                return Ok(Some(guard));
            }

            let base_delay_ms = (5u64 << attempts.saturating_sub(1).min(16)).min(80);
            let jitter_ms = rand::rng().random::<u64>() % 4;
            let delay_ms = base_delay_ms + jitter_ms;

            trace!(
                lock = "backoff",
                attempts,
                delay_ms,
                elapsed_ms = start.elapsed().as_millis()
            );

            tokio::time::sleep(Duration::from_millis(delay_ms)).await;
            if start.elapsed() >= self.lock_timeout {
                return Err(KormError::lock(format!(
                    "migration lock acquisition timeout after {:?} ({} attempts)",
                    start.elapsed(),
                    attempts
                )));
            }
        }
    }

    async fn run_locked(&self, conn: &DatabaseConnection) -> Result<(), KormError> {
        let mut lock = bootstrap_lock(&self.database, conn);
        let Some(guard) = self.acquire(conn, lock.as_mut()).await? else {
            return Ok(());
        };

        let start = Instant::now();
        let body_timeout = self.options.timeout();
        let result: Result<MigrationReport, KormError> =
            match tokio::time::timeout(body_timeout, apply_pending(conn, &self.options)).await {
                Ok(outcome) => outcome.map_err(KormError::from),
                Err(_) => {
                    info!(
                        elapsed_ms = start.elapsed().as_millis(),
                        "Migration body timeout"
                    );
                    Err(KormError::Timeout {
                        elapsed_ms: start.elapsed().as_millis(),
                    })
                }
            };

        if let Err(release_err) = guard.release().await {
            warn!(error = %release_err, "Failed to release migration guard");
        }

        let report = result?;
        info!(
            migrator = "ran",
            applied = report.applied.len(),
            last_id = ?report.last_id,
            elapsed_ms = start.elapsed().as_millis()
        );
        Ok(())
    }
}

#[async_trait]
impl MigrationsRunner for SqlMigrationsRunner {
    async fn migrate(&self) -> Result<(), KormError> {
        let start = Instant::now();
        let engine = self.database.provider().engine();
        info!(
            "migrate=start engine={} target={} providers={}",
            engine,
            self.database.connection_settings().sanitized(),
            self.options.providers().len()
        );

        let conn = self.database.connect_single().await?;
        let result = self.run_locked(&conn).await;

        if let Err(e) = conn.close().await {
            warn!(error = %e, "Failed to close migration pool");
        }

        match &result {
            Ok(()) => info!(
                "migrate=done engine={} elapsed_ms={}",
                engine,
                start.elapsed().as_millis()
            ),
            Err(e) => warn!(
                "migrate=failed engine={} elapsed_ms={} error={}",
                engine,
                start.elapsed().as_millis(),
                e
            ),
        }
        result
    }
}
