//! Database handle construction.
//!
//! [`DatabaseBuilder`] collects a connection and any number of
//! [`DatabaseConfiguration`]s and produces an immutable [`KormDatabase`].
//! Connecting builds an sqlx pool whose connections run the configured
//! session statements before they are handed to sea-orm.

use std::fmt;
use std::future::Future;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use sea_orm::{DatabaseConnection, SqlxPostgresConnector, SqlxSqliteConnector};
use sqlx::postgres::PgPoolOptions;
use sqlx::sqlite::{SqliteConnectOptions, SqlitePoolOptions};
use tracing::{info, trace, warn};

use crate::config::{ConnectionSettings, DbProvider};
use crate::error::KormError;

const CONNECT_ATTEMPTS: u32 = 5;
const CONNECT_RETRY_INTERVAL_MS: u64 = 500;

/// Pool sizing and per-connection session statements.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DatabaseOptions {
    pub min_connections: u32,
    pub max_connections: u32,
    pub acquire_timeout: Duration,
    pub sqlx_logging: bool,
    /// Executed in order on every new connection.
    pub session_statements: Vec<String>,
}

impl DatabaseOptions {
    pub fn for_provider(provider: DbProvider) -> Self {
        let session_statements = match provider {
            DbProvider::Sqlite => vec![
                "PRAGMA foreign_keys = ON;".to_string(),
                "PRAGMA busy_timeout = 5000;".to_string(),
            ],
            DbProvider::Postgres => vec!["SET timezone = 'UTC';".to_string()],
        };

        Self {
            min_connections: 1,
            max_connections: (num_cpus::get() as u32).saturating_mul(2).max(2),
            acquire_timeout: Duration::from_secs(5),
            sqlx_logging: false,
            session_statements,
        }
    }

    pub fn add_session_statement(&mut self, statement: impl Into<String>) -> &mut Self {
        self.session_statements.push(statement.into());
        self
    }
}

/// Adjusts how a [`KormDatabase`] connects.
pub trait DatabaseConfiguration: Send + Sync {
    fn configure(&self, options: &mut DatabaseOptions);
}

#[derive(Clone, Default)]
pub struct DatabaseBuilder {
    connection: Option<ConnectionSettings>,
    configurations: Vec<Arc<dyn DatabaseConfiguration>>,
}

impl DatabaseBuilder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn use_connection(&mut self, settings: ConnectionSettings) -> &mut Self {
        self.connection = Some(settings);
        self
    }

    pub fn use_database_configuration<T>(&mut self) -> &mut Self
    where
        T: DatabaseConfiguration + Default + 'static,
    {
        self.use_database_configuration_with(T::default())
    }

    pub fn use_database_configuration_with(
        &mut self,
        configuration: impl DatabaseConfiguration + 'static,
    ) -> &mut Self {
        self.configurations.push(Arc::new(configuration));
        self
    }

    pub fn build(&self) -> Result<KormDatabase, KormError> {
        let settings = self
            .connection
            .clone()
            .ok_or(KormError::ArgumentMissing { name: "connection" })?;
        KormDatabase::with_configurations(settings, self.configurations.clone())
    }
}

/// Immutable database handle: where to connect and how.
#[derive(Clone)]
pub struct KormDatabase {
    settings: ConnectionSettings,
    provider: DbProvider,
    options: DatabaseOptions,
    configurations: Vec<Arc<dyn DatabaseConfiguration>>,
}

impl KormDatabase {
    pub fn new(settings: ConnectionSettings) -> Result<Self, KormError> {
        Self::with_configurations(settings, Vec::new())
    }

    fn with_configurations(
        settings: ConnectionSettings,
        configurations: Vec<Arc<dyn DatabaseConfiguration>>,
    ) -> Result<Self, KormError> {
        let provider = settings.provider()?;
        let mut options = DatabaseOptions::for_provider(provider);
        for configuration in &configurations {
            configuration.configure(&mut options);
        }

        Ok(Self {
            settings,
            provider,
            options,
            configurations,
        })
    }

    pub fn connection_settings(&self) -> &ConnectionSettings {
        &self.settings
    }

    pub fn provider(&self) -> DbProvider {
        self.provider
    }

    pub fn options(&self) -> &DatabaseOptions {
        &self.options
    }

    pub fn configuration_count(&self) -> usize {
        self.configurations.len()
    }

    /// Open a pool sized by [`DatabaseOptions`].
    pub async fn connect(&self) -> Result<DatabaseConnection, KormError> {
        self.open_pool(self.options.min_connections, self.options.max_connections)
            .await
    }

    /// Open a pool with exactly one connection. Used for migrations and ID
    /// generator setup, where every statement must share one session.
    pub async fn connect_single(&self) -> Result<DatabaseConnection, KormError> {
        self.open_pool(1, 1).await
    }

    async fn open_pool(&self, min: u32, max: u32) -> Result<DatabaseConnection, KormError> {
        let url = self.settings.connection_string.as_str();
        let statements = Arc::new(self.options.session_statements.clone());
        let acquire_timeout = self.options.acquire_timeout;

        match self.provider {
            DbProvider::Sqlite => {
                let connect_opts = SqliteConnectOptions::from_str(url)
                    .map_err(|e| KormError::config(format!("invalid SQLite connection options: {e}")))?
                    .create_if_missing(true);

                let pool = SqlitePoolOptions::new()
                    .min_connections(min)
                    .max_connections(max)
                    .acquire_timeout(acquire_timeout)
                    .after_connect(move |conn, _meta| {
                        let statements = statements.clone();
                        Box::pin(async move {
                            for stmt in statements.iter() {
                                sqlx::query(stmt).execute(&mut *conn).await?;
                            }
                            trace!("db=sqlite hook=after_connect ok");
                            Ok::<_, sqlx::Error>(())
                        })
                    })
                    .connect_with(connect_opts)
                    .await
                    .map_err(|e| {
                        KormError::config(format!("failed to create SQLite connection pool: {e}"))
                    })?;

                info!(
                    "pool=create engine=sqlite min={} max={} acquire_timeout_ms={}",
                    min,
                    max,
                    acquire_timeout.as_millis()
                );
                Ok(SqlxSqliteConnector::from_sqlx_sqlite_pool(pool))
            }
            DbProvider::Postgres => {
                let pool = retry_connection(
                    || {
                        let statements = statements.clone();
                        async move {
                            PgPoolOptions::new()
                                .min_connections(min)
                                .max_connections(max)
                                .acquire_timeout(acquire_timeout)
                                .idle_timeout(Duration::from_secs(30))
                                .after_connect(move |conn, _meta| {
                                    let statements = statements.clone();
                                    Box::pin(async move {
                                        for stmt in statements.iter() {
                                            sqlx::query(stmt).execute(&mut *conn).await?;
                                        }
                                        Ok::<_, sqlx::Error>(())
                                    })
                                })
                                .connect(url)
                                .await
                                .map_err(|e| {
                                    KormError::config(format!("failed to connect to Postgres: {e}"))
                                })
                        }
                    },
                    CONNECT_ATTEMPTS,
                    CONNECT_RETRY_INTERVAL_MS,
                )
                .await?;

                info!(
                    "pool=create engine=postgres target={} min={} max={} acquire_timeout_ms={}",
                    self.settings.sanitized(),
                    min,
                    max,
                    acquire_timeout.as_millis()
                );
                Ok(SqlxPostgresConnector::from_sqlx_postgres_pool(pool))
            }
        }
    }
}

impl fmt::Debug for KormDatabase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("KormDatabase")
            .field("settings", &self.settings)
            .field("provider", &self.provider)
            .field("options", &self.options)
            .field("configurations", &self.configurations.len())
            .finish()
    }
}

async fn retry_connection<T, F, Fut>(
    mut connect_fn: F,
    max_attempts: u32,
    interval_ms: u64,
) -> Result<T, KormError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, KormError>>,
{
    let mut last_error = None;

    for attempt in 1..=max_attempts {
        match connect_fn().await {
            Ok(result) => {
                if attempt > 1 {
                    info!(
                        "connection_retry=success attempts={} interval_ms={}",
                        attempt, interval_ms
                    );
                }
                return Ok(result);
            }
            Err(e) => {
                last_error = Some(e);
                if attempt < max_attempts {
                    warn!(
                        "connection_retry=failed attempt={} max_attempts={} interval_ms={}",
                        attempt, max_attempts, interval_ms
                    );
                    tokio::time::sleep(Duration::from_millis(interval_ms)).await;
                }
            }
        }
    }

    Err(last_error.unwrap_or_else(|| KormError::config("no connection attempts were made")))
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};

    use super::*;

    #[derive(Default)]
    struct SmallPool;

    impl DatabaseConfiguration for SmallPool {
        fn configure(&self, options: &mut DatabaseOptions) {
            options.max_connections = 3;
        }
    }

    struct SearchPath(&'static str);

    impl DatabaseConfiguration for SearchPath {
        fn configure(&self, options: &mut DatabaseOptions) {
            options.add_session_statement(format!("SET search_path TO {};", self.0));
        }
    }

    #[test]
    fn configurations_apply_in_order() {
        let mut builder = DatabaseBuilder::new();
        builder
            .use_connection(ConnectionSettings::new("postgres://db/app", "postgres"))
            .use_database_configuration::<SmallPool>()
            .use_database_configuration_with(SearchPath("app"));

        let database = builder.build().unwrap();
        assert_eq!(database.configuration_count(), 2);
        assert_eq!(database.options().max_connections, 3);
        assert_eq!(
            database.options().session_statements,
            vec![
                "SET timezone = 'UTC';".to_string(),
                "SET search_path TO app;".to_string()
            ]
        );
    }

    #[test]
    fn build_without_connection_fails() {
        let err = DatabaseBuilder::new().build().unwrap_err();
        assert!(matches!(err, KormError::ArgumentMissing { name: "connection" }));
    }

    #[test]
    fn sqlite_defaults_enable_foreign_keys() {
        let options = DatabaseOptions::for_provider(DbProvider::Sqlite);
        assert!(options
            .session_statements
            .contains(&"PRAGMA foreign_keys = ON;".to_string()));
        assert!(options.max_connections >= 2);
    }

    #[tokio::test]
    async fn retry_gives_up_after_max_attempts() {
        let attempts = AtomicU32::new(0);
        let result: Result<(), KormError> = retry_connection(
            || {
                attempts.fetch_add(1, Ordering::SeqCst);
                async { Err(KormError::config("refused")) }
            },
            3,
            1,
        )
        .await;

        assert!(matches!(result, Err(KormError::Configuration { message }) if message == "refused"));
        assert_eq!(attempts.load(Ordering::SeqCst), 3);
    }

    #[tokio::test]
    async fn retry_returns_first_success() {
        let attempts = AtomicU32::new(0);
        let result = retry_connection(
            || {
                let n = attempts.fetch_add(1, Ordering::SeqCst);
                async move {
                    if n < 1 {
                        Err(KormError::config("not yet"))
                    } else {
                        Ok(n)
                    }
                }
            },
            5,
            1,
        )
        .await
        .unwrap();

        assert_eq!(result, 1);
    }

    #[tokio::test]
    async fn connects_to_sqlite_file() {
        let dir = tempfile::tempdir().unwrap();
        let url = format!("sqlite://{}?mode=rwc", dir.path().join("app.db").display());
        let database = KormDatabase::new(ConnectionSettings::new(url, "sqlite")).unwrap();

        let conn = database.connect_single().await.unwrap();
        conn.ping().await.unwrap();
        conn.close().await.unwrap();
    }
}
