//! Table-backed ID generators.
//!
//! A generator hands out monotonically increasing ids per sequence name,
//! persisted in [`ID_STORE_TABLE`]. Generators hold a connection and must be
//! released by whoever acquired them.

use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use sea_orm::{ConnectionTrait, DatabaseConnection, Statement};
use tracing::{debug, info};

use crate::config::{ConnectionSettings, DbProvider};
use crate::database::KormDatabase;
use crate::error::KormError;

pub const ID_STORE_TABLE: &str = "korm_id_store";

/// Sequence used when a generator is requested with an empty name.
pub const DEFAULT_SEQUENCE: &str = "__default";

#[async_trait]
pub trait IdGenerator: Send {
    /// Create the backing table if needed. Idempotent.
    async fn init_database_for_id_generator(&mut self) -> Result<(), KormError>;

    async fn next_id(&mut self) -> Result<i64, KormError>;

    /// Release held resources. The generator must not be used afterwards.
    async fn release(&mut self) -> Result<(), KormError>;
}

pub trait IdGeneratorFactory: Send + Sync {
    fn get_generator(&self, name: &str) -> Result<Box<dyn IdGenerator>, KormError>;
}

type FactoryConstructor =
    Arc<dyn Fn(ConnectionSettings) -> Result<Arc<dyn IdGeneratorFactory>, KormError> + Send + Sync>;

/// Generator factories keyed by database provider.
#[derive(Clone)]
pub struct IdGeneratorFactories {
    constructors: HashMap<DbProvider, FactoryConstructor>,
}

impl IdGeneratorFactories {
    pub fn empty() -> Self {
        Self {
            constructors: HashMap::new(),
        }
    }

    /// Replace the factory used for `provider`.
    pub fn register<F>(&mut self, provider: DbProvider, constructor: F) -> &mut Self
    where
        F: Fn(ConnectionSettings) -> Result<Arc<dyn IdGeneratorFactory>, KormError>
            + Send
            + Sync
            + 'static,
    {
        self.constructors.insert(provider, Arc::new(constructor));
        self
    }

    pub fn get_factory(
        &self,
        connection_string: &str,
        provider_name: &str,
    ) -> Result<Arc<dyn IdGeneratorFactory>, KormError> {
        let settings = ConnectionSettings::new(connection_string, provider_name);
        let provider = settings.provider()?;
        let constructor =
            self.constructors
                .get(&provider)
                .ok_or_else(|| KormError::UnsupportedProvider {
                    provider: provider_name.to_string(),
                })?;
        constructor(settings)
    }
}

impl Default for IdGeneratorFactories {
    fn default() -> Self {
        let mut factories = Self::empty();
        for provider in [DbProvider::Postgres, DbProvider::Sqlite] {
            factories.register(provider, |settings| {
                Ok(Arc::new(SqlIdGeneratorFactory::new(KormDatabase::new(settings)?))
                    as Arc<dyn IdGeneratorFactory>)
            });
        }
        factories
    }
}

impl fmt::Debug for IdGeneratorFactories {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_set().entries(self.constructors.keys()).finish()
    }
}

pub struct SqlIdGeneratorFactory {
    database: KormDatabase,
}

impl SqlIdGeneratorFactory {
    pub fn new(database: KormDatabase) -> Self {
        Self { database }
    }
}

impl IdGeneratorFactory for SqlIdGeneratorFactory {
    fn get_generator(&self, name: &str) -> Result<Box<dyn IdGenerator>, KormError> {
        Ok(Box::new(SqlIdGenerator::new(self.database.clone(), name)))
    }
}

/// Generator backed by one row of [`ID_STORE_TABLE`]. Connects lazily.
pub struct SqlIdGenerator {
    database: KormDatabase,
    sequence: String,
    conn: Option<DatabaseConnection>,
}

impl SqlIdGenerator {
    pub fn new(database: KormDatabase, name: &str) -> Self {
        let sequence = match name.trim() {
            "" => DEFAULT_SEQUENCE.to_string(),
            name => name.to_string(),
        };
        Self {
            database,
            sequence,
            conn: None,
        }
    }

    pub fn sequence(&self) -> &str {
        &self.sequence
    }

    async fn connection(&mut self) -> Result<&DatabaseConnection, KormError> {
        if self.conn.is_none() {
            self.conn = Some(self.database.connect_single().await?);
        }
        self.conn
            .as_ref()
            .ok_or_else(|| KormError::config("id generator connection unavailable"))
    }
}

#[async_trait]
impl IdGenerator for SqlIdGenerator {
    async fn init_database_for_id_generator(&mut self) -> Result<(), KormError> {
        let sql = match self.database.provider() {
            DbProvider::Postgres => format!(
                "CREATE TABLE IF NOT EXISTS {ID_STORE_TABLE} (\
                 table_name VARCHAR(128) PRIMARY KEY, \
                 last_id BIGINT NOT NULL)"
            ),
            DbProvider::Sqlite => format!(
                "CREATE TABLE IF NOT EXISTS {ID_STORE_TABLE} (\
                 table_name TEXT PRIMARY KEY NOT NULL, \
                 last_id INTEGER NOT NULL)"
            ),
        };

        let conn = self.connection().await?;
        conn.execute_unprepared(&sql).await?;
        info!(table = ID_STORE_TABLE, "id_store=ready");
        Ok(())
    }

    async fn next_id(&mut self) -> Result<i64, KormError> {
        let provider = self.database.provider();
        let sql = match provider {
            DbProvider::Postgres => format!(
                "INSERT INTO {ID_STORE_TABLE} (table_name, last_id) VALUES ($1, 1) \
                 ON CONFLICT (table_name) DO UPDATE SET last_id = {ID_STORE_TABLE}.last_id + 1 \
                 RETURNING last_id"
            ),
            DbProvider::Sqlite => format!(
                "INSERT INTO {ID_STORE_TABLE} (table_name, last_id) VALUES (?, 1) \
                 ON CONFLICT (table_name) DO UPDATE SET last_id = last_id + 1 \
                 RETURNING last_id"
            ),
        };
        let stmt = Statement::from_sql_and_values(
            provider.backend(),
            sql,
            vec![self.sequence.clone().into()],
        );

        let row = self
            .connection()
            .await?
            .query_one(stmt)
            .await?
            .ok_or_else(|| KormError::config("id store upsert returned no row"))?;
        let id: i64 = row.try_get("", "last_id")?;
        debug!(sequence = %self.sequence, id, "id_store=next");
        Ok(id)
    }

    async fn release(&mut self) -> Result<(), KormError> {
        if let Some(conn) = self.conn.take() {
            conn.close().await?;
        }
        Ok(())
    }
}
