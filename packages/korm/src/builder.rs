//! Startup wiring for a KORM database.
//!
//! ```no_run
//! # async fn run(cfg: korm::Configuration) -> Result<(), korm::KormError> {
//! use korm::{ConnectionSettings, KormBuilder, ServiceCollection};
//!
//! let connection = ConnectionSettings::new("sqlite://app.db?mode=rwc", "sqlite");
//! let builder = KormBuilder::new(ServiceCollection::new(), connection)?
//!     .init_database_for_id_generator()
//!     .await?
//!     .add_korm_migrations(&cfg)?;
//! builder.migrate().await?;
//! let services = builder.into_services()?;
//! # let _ = services;
//! # Ok(())
//! # }
//! ```

use std::sync::Arc;

use korm_migrations::{DirectoryScriptsProvider, MigrationOptions};
use tokio::runtime::{Handle, RuntimeFlavor};
use tracing::{debug, info, warn};

use crate::cache::MemoryCache;
use crate::config::{Configuration, ConnectionSettings, MigrationsSection};
use crate::database::{DatabaseBuilder, DatabaseConfiguration, KormDatabase};
use crate::error::KormError;
use crate::id_generator::IdGeneratorFactories;
use crate::infra::runner::{MigrationsRunner, SqlMigrationsRunner};
use crate::services::ServiceCollection;

type MigrationsSetup = Arc<dyn Fn(&mut MigrationOptions) + Send + Sync>;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MigrateStatus {
    /// Auto-migration was not enabled; nothing ran.
    Skipped,
    Completed,
}

pub struct KormBuilder {
    services: ServiceCollection,
    connection: ConnectionSettings,
    database: DatabaseBuilder,
    id_generators: IdGeneratorFactories,
    auto_migrate: bool,
}

impl KormBuilder {
    pub fn new(services: ServiceCollection, connection: ConnectionSettings) -> Result<Self, KormError> {
        connection.validate()?;

        let mut database = DatabaseBuilder::new();
        database.use_connection(connection.clone());

        Ok(Self {
            services,
            connection,
            database,
            id_generators: IdGeneratorFactories::default(),
            auto_migrate: false,
        })
    }

    /// Builder for the `ConnectionStrings:<name>` connection.
    pub fn from_configuration(
        services: ServiceCollection,
        configuration: &Configuration,
        name: &str,
    ) -> Result<Self, KormError> {
        let connection = ConnectionSettings::from_configuration(configuration, name)?;
        Self::new(services, connection)
    }

    pub fn services(&self) -> &ServiceCollection {
        &self.services
    }

    pub fn services_mut(&mut self) -> &mut ServiceCollection {
        &mut self.services
    }

    pub fn connection_settings(&self) -> &ConnectionSettings {
        &self.connection
    }

    pub fn auto_migrate(&self) -> bool {
        self.auto_migrate
    }

    pub fn with_id_generator_factories(mut self, factories: IdGeneratorFactories) -> Self {
        self.id_generators = factories;
        self
    }

    pub fn use_database_configuration<T>(mut self) -> Self
    where
        T: DatabaseConfiguration + Default + 'static,
    {
        self.database.use_database_configuration::<T>();
        self
    }

    pub fn use_database_configuration_with(
        mut self,
        configuration: impl DatabaseConfiguration + 'static,
    ) -> Self {
        self.database.use_database_configuration_with(configuration);
        self
    }

    /// Create the ID generator's backing storage. The generator is released
    /// before returning, whether or not initialization succeeded.
    pub async fn init_database_for_id_generator(self) -> Result<Self, KormError> {
        let factory = self.id_generators.get_factory(
            &self.connection.connection_string,
            &self.connection.provider_name,
        )?;
        let mut generator = factory.get_generator("")?;

        let init = generator.init_database_for_id_generator().await;
        let release = generator.release().await;

        match (init, release) {
            (Ok(()), Ok(())) => {
                debug!(target = %self.connection.sanitized(), "id_generator=initialized");
                Ok(self)
            }
            (Err(init_err), Ok(())) => Err(init_err),
            (Err(init_err), Err(release_err)) => {
                warn!(error = %release_err, "Failed to release id generator after init error");
                Err(init_err)
            }
            (Ok(()), Err(release_err)) => Err(release_err),
        }
    }

    /// Register migrations for the `KormMigrations` section, loading scripts
    /// from the `SqlScripts` folder next to the executable.
    pub fn add_korm_migrations(self, configuration: &Configuration) -> Result<Self, KormError> {
        self.register_migrations(configuration, None)
    }

    /// Like [`add_korm_migrations`](Self::add_korm_migrations), with `setup`
    /// choosing the scripts. `setup` runs each time a runner is resolved.
    pub fn add_korm_migrations_with<F>(
        self,
        configuration: &Configuration,
        setup: F,
    ) -> Result<Self, KormError>
    where
        F: Fn(&mut MigrationOptions) + Send + Sync + 'static,
    {
        self.register_migrations(configuration, Some(Arc::new(setup)))
    }

    fn register_migrations(
        mut self,
        configuration: &Configuration,
        setup: Option<MigrationsSetup>,
    ) -> Result<Self, KormError> {
        let section = MigrationsSection::resolve(configuration)?;

        if self.services.contains::<Arc<dyn MigrationsRunner>>() {
            warn!("add_korm_migrations called again; the last registration wins");
        }

        self.auto_migrate = section.auto_migrate;
        self.services.try_add_singleton(MemoryCache::new());

        let settings = section.connection_string;
        self.services
            .add_transient::<Arc<dyn MigrationsRunner>, _>(move |_| {
                let database = KormDatabase::new(settings.clone())?;
                let mut options = MigrationOptions::new();
                match &setup {
                    Some(setup) => setup(&mut options),
                    None => {
                        options.add_scripts_provider(DirectoryScriptsProvider::entry_default());
                    }
                }
                Ok(Arc::new(SqlMigrationsRunner::new(database, options)) as Arc<dyn MigrationsRunner>)
            });

        debug!(auto_migrate = self.auto_migrate, "migrations registered");
        Ok(self)
    }

    /// Run migrations when `AutoMigrate` is enabled.
    pub async fn migrate(&self) -> Result<MigrateStatus, KormError> {
        if !self.auto_migrate {
            info!("migrate=skipped auto_migrate=false");
            return Ok(MigrateStatus::Skipped);
        }

        let provider = self.services.build_service_provider();
        let runner = provider.get_required_service::<Arc<dyn MigrationsRunner>>()?;
        runner.migrate().await?;
        Ok(MigrateStatus::Completed)
    }

    /// Blocking form of [`migrate`](Self::migrate) for synchronous startup.
    ///
    /// Inside a multi-thread runtime the current worker is handed off while
    /// blocking; a current-thread runtime cannot block and is rejected.
    /// Outside any runtime a private one is created.
    pub fn migrate_blocking(&self) -> Result<MigrateStatus, KormError> {
        if !self.auto_migrate {
            info!("migrate=skipped auto_migrate=false");
            return Ok(MigrateStatus::Skipped);
        }

        match Handle::try_current() {
            Ok(handle) => match handle.runtime_flavor() {
                RuntimeFlavor::CurrentThread => Err(KormError::config(
                    "migrate_blocking cannot run on a current-thread runtime; await migrate() instead",
                )),
                _ => tokio::task::block_in_place(|| handle.block_on(self.migrate())),
            },
            Err(_) => tokio::runtime::Builder::new_current_thread()
                .enable_all()
                .build()?
                .block_on(self.migrate()),
        }
    }

    pub(crate) fn build(&self) -> Result<KormDatabase, KormError> {
        self.database.build()
    }

    /// Finish: register the configured [`KormDatabase`] as a singleton and
    /// return the service collection.
    pub fn into_services(mut self) -> Result<ServiceCollection, KormError> {
        let database = self.build()?;
        info!(
            engine = database.provider().engine(),
            configurations = database.configuration_count(),
            "korm=ready"
        );
        self.services.add_singleton(database);
        Ok(self.services)
    }
}
